/// Endpoint defaults for a named OpenAI-compatible provider.
#[derive(Debug, Clone, Copy)]
pub struct ProviderPreset {
    pub default_base_url: &'static str,
    pub needs_api_key: bool,
    pub extra_headers: &'static [(&'static str, &'static str)],
}

/// Look up a provider preset by name.
pub fn get_preset(provider: &str) -> Option<ProviderPreset> {
    match provider {
        "ollama" => Some(ProviderPreset {
            default_base_url: "http://localhost:11434/v1/chat/completions",
            needs_api_key: false,
            extra_headers: &[],
        }),
        "openai" => Some(ProviderPreset {
            default_base_url: "https://api.openai.com/v1/chat/completions",
            needs_api_key: true,
            extra_headers: &[],
        }),
        "vllm" => Some(ProviderPreset {
            default_base_url: "http://localhost:8000/v1/chat/completions",
            needs_api_key: false,
            extra_headers: &[],
        }),
        "groq" => Some(ProviderPreset {
            default_base_url: "https://api.groq.com/openai/v1/chat/completions",
            needs_api_key: true,
            extra_headers: &[],
        }),
        "openrouter" => Some(ProviderPreset {
            default_base_url: "https://openrouter.ai/api/v1/chat/completions",
            needs_api_key: true,
            extra_headers: &[("X-Title", "opsgraph")],
        }),
        "deepseek" => Some(ProviderPreset {
            default_base_url: "https://api.deepseek.com/v1/chat/completions",
            needs_api_key: true,
            extra_headers: &[],
        }),
        _ => None,
    }
}

/// Preset headers merged with user-configured ones. User values win.
pub fn merge_headers<'a>(
    preset: Option<&ProviderPreset>,
    user_headers: impl IntoIterator<Item = (&'a String, &'a String)>,
) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = preset
        .map(|p| {
            p.extra_headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        })
        .unwrap_or_default();

    for (k, v) in user_headers {
        match headers.iter_mut().find(|(hk, _)| hk.eq_ignore_ascii_case(k)) {
            Some(existing) => existing.1 = v.clone(),
            None => headers.push((k.clone(), v.clone())),
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn ollama_is_local_and_keyless() {
        let p = get_preset("ollama").unwrap();
        assert!(!p.needs_api_key);
        assert!(p.default_base_url.starts_with("http://localhost"));
        assert!(get_preset("made-up").is_none());
    }

    #[test]
    fn user_headers_override_preset() {
        let preset = get_preset("openrouter");
        let mut user = BTreeMap::new();
        user.insert("x-title".to_string(), "ops".to_string());
        user.insert("X-Team".to_string(), "sre".to_string());
        let merged = merge_headers(preset.as_ref(), &user);
        assert_eq!(merged.len(), 2);
        assert!(merged.contains(&("X-Title".to_string(), "ops".to_string())));
        assert!(merged.contains(&("X-Team".to_string(), "sre".to_string())));
    }
}
