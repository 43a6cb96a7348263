use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde::Deserialize;

use opsgraph_core::error::{OpsError, Result};
use opsgraph_core::traits::Tool;
use opsgraph_core::types::{ToolContext, ToolResult};

const BODY_PREVIEW_CHARS: usize = 2000;

/// What a single HTTP probe observed.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub status: u16,
    pub reason: String,
    pub latency_ms: u64,
    pub healthy: bool,
    pub body_preview: String,
}

impl ProbeReport {
    pub fn summary(&self) -> String {
        format!(
            "HTTP {} {} in {}ms",
            self.status, self.reason, self.latency_ms
        )
    }
}

pub(crate) fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| OpsError::ToolExecution {
            tool: "http_probe".into(),
            message: e.to_string(),
        })
}

/// Issue one request and classify the response.
///
/// `expect_status` pins the healthy code; otherwise any 2xx is healthy.
/// Transport failures (refused, DNS, TLS) are errors, not reports.
pub async fn probe(
    client: &reqwest::Client,
    method: reqwest::Method,
    url: &str,
    expect_status: Option<u16>,
) -> Result<ProbeReport> {
    let started = Instant::now();
    let resp = client
        .request(method, url)
        .send()
        .await
        .map_err(|e| OpsError::ToolExecution {
            tool: "http_probe".into(),
            message: format!("{}: {}", url, e),
        })?;
    let latency_ms = started.elapsed().as_millis() as u64;

    let status = resp.status();
    let healthy = match expect_status {
        Some(code) => status.as_u16() == code,
        None => status.is_success(),
    };
    let body = resp.text().await.unwrap_or_default();
    let body_preview: String = body.chars().take(BODY_PREVIEW_CHARS).collect();

    Ok(ProbeReport {
        status: status.as_u16(),
        reason: status.canonical_reason().unwrap_or("").to_string(),
        latency_ms,
        healthy,
        body_preview,
    })
}

/// Probe a single HTTP endpoint: status, latency and a body preview.
pub struct HttpProbeTool {
    timeout_secs: u64,
}

impl HttpProbeTool {
    pub fn new(timeout_secs: u64) -> Self {
        Self { timeout_secs }
    }
}

#[derive(Deserialize)]
struct ProbeInput {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    expect_status: Option<u16>,
}

fn default_method() -> String {
    "GET".into()
}

impl Tool for HttpProbeTool {
    fn name(&self) -> &str {
        "http_probe"
    }

    fn description(&self) -> &str {
        "Probe an HTTP endpoint (health check, status page, metrics URL). Returns status code, latency and the start of the body."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "Endpoint to probe" },
                "method": { "type": "string", "enum": ["GET", "HEAD"], "description": "HTTP method (default GET)" },
                "expect_status": { "type": "integer", "description": "Status code considered healthy (default: any 2xx)" }
            },
            "required": ["url"]
        })
    }

    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: ProbeInput = serde_json::from_value(input)
                .map_err(|e| OpsError::ToolValidation(e.to_string()))?;
            let method = match p.method.to_ascii_uppercase().as_str() {
                "GET" => reqwest::Method::GET,
                "HEAD" => reqwest::Method::HEAD,
                other => {
                    return Err(OpsError::ToolValidation(format!(
                        "unsupported method '{}' (GET or HEAD)",
                        other
                    )))
                }
            };

            let client = build_client(Duration::from_secs(self.timeout_secs))?;
            let report = probe(&client, method, &p.url, p.expect_status).await?;

            let verdict = if report.healthy { "healthy" } else { "UNHEALTHY" };
            let mut out = format!("{} ({})", report.summary(), verdict);
            if !report.body_preview.is_empty() {
                out.push_str("\n\n");
                out.push_str(&report.body_preview);
            }
            Ok(ToolResult::success(out))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::get;
    use opsgraph_core::types::SessionId;

    async fn serve_fixture() -> String {
        let app = axum::Router::new()
            .route("/healthz", get(|| async { "ok" }))
            .route(
                "/broken",
                get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "upstream connect error") }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn ctx() -> ToolContext {
        ToolContext {
            session_id: SessionId::new(),
            node: "K8s_Specialist".into(),
        }
    }

    #[tokio::test]
    async fn healthy_endpoint() {
        let base = serve_fixture().await;
        let result = HttpProbeTool::new(5)
            .execute(serde_json::json!({"url": format!("{}/healthz", base)}), ctx())
            .await
            .unwrap();
        assert!(!result.is_error);
        assert!(result.content.starts_with("HTTP 200"));
        assert!(result.content.contains("(healthy)"));
    }

    #[tokio::test]
    async fn failing_status_is_reported_not_raised() {
        let base = serve_fixture().await;
        let result = HttpProbeTool::new(5)
            .execute(serde_json::json!({"url": format!("{}/broken", base)}), ctx())
            .await
            .unwrap();
        assert!(result.content.contains("HTTP 503"));
        assert!(result.content.contains("UNHEALTHY"));
        assert!(result.content.contains("upstream connect error"));
    }

    #[tokio::test]
    async fn rejects_mutating_methods() {
        let err = HttpProbeTool::new(5)
            .execute(
                serde_json::json!({"url": "http://127.0.0.1:1/", "method": "DELETE"}),
                ctx(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OpsError::ToolValidation(_)));
    }

    #[tokio::test]
    async fn refused_connection_is_an_error() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let err = HttpProbeTool::new(2)
            .execute(serde_json::json!({"url": format!("http://127.0.0.1:{}/", port)}), ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, OpsError::ToolExecution { .. }));
    }
}
