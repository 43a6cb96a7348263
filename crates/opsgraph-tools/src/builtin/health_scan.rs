use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::info;

use opsgraph_core::config::{HealthTarget, ToolsConfig};
use opsgraph_core::error::{OpsError, Result};
use opsgraph_core::traits::Tool;
use opsgraph_core::types::{ToolContext, ToolResult};

use super::http_probe::{build_client, probe, ProbeReport};
use crate::dispatch::{FanOut, SlotResult, SubCall};

/// Composite cross-domain health scan: probes every configured target
/// through the fan-out dispatcher and reports one line per target.
pub struct HealthScanTool {
    targets: Vec<HealthTarget>,
    fan_out: FanOut,
}

impl HealthScanTool {
    pub fn new(targets: Vec<HealthTarget>, fan_out: FanOut) -> Self {
        Self { targets, fan_out }
    }

    pub fn from_config(config: &ToolsConfig) -> Self {
        Self::new(
            config.health_targets.clone(),
            FanOut::new(
                config.max_concurrency,
                Duration::from_secs(config.timeout_secs),
            ),
        )
    }

    fn selected(&self, domain: Option<&str>) -> Vec<HealthTarget> {
        self.targets
            .iter()
            .filter(|t| match domain {
                Some(d) => t
                    .domain
                    .as_deref()
                    .map(|td| td.eq_ignore_ascii_case(d))
                    .unwrap_or(false),
                None => true,
            })
            .cloned()
            .collect()
    }
}

#[derive(Deserialize, Default)]
struct ScanInput {
    #[serde(default)]
    domain: Option<String>,
}

fn slot_label(target: &HealthTarget) -> String {
    match &target.domain {
        Some(domain) => format!("{} ({})", target.name, domain),
        None => target.name.clone(),
    }
}

/// Render the per-slot report followed by the overall status line.
pub fn render_report(slots: &[SlotResult<ProbeReport>]) -> String {
    let mut lines = Vec::with_capacity(slots.len() + 1);
    let mut unhealthy = 0;

    for slot in slots {
        match &slot.outcome {
            Ok(report) if report.healthy => {
                lines.push(format!("[ok]   {}: {}", slot.label, report.summary()));
            }
            Ok(report) => {
                unhealthy += 1;
                lines.push(format!("[fail] {}: {}", slot.label, report.summary()));
            }
            Err(e) => {
                unhealthy += 1;
                lines.push(format!("[fail] {}: error: {}", slot.label, e));
            }
        }
    }

    let overall = if unhealthy == 0 {
        format!("overall: healthy ({} targets)", slots.len())
    } else {
        format!("overall: degraded ({}/{} failing)", unhealthy, slots.len())
    };
    lines.push(overall);
    lines.join("\n")
}

impl Tool for HealthScanTool {
    fn name(&self) -> &str {
        "health_scan"
    }

    fn description(&self) -> &str {
        "Run the cross-domain health scan over every configured endpoint concurrently. Optional 'domain' narrows the scan (e.g. k8s, gcp)."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "domain": { "type": "string", "description": "Only scan targets of this domain" }
            }
        })
    }

    /// Enough for every wave of sub-calls to hit its own timeout.
    fn timeout_secs(&self) -> Option<u64> {
        let per_call = self.fan_out.call_timeout().as_secs().max(1);
        let waves = self.targets.len().div_ceil(self.fan_out.max_concurrency()).max(1) as u64;
        Some(per_call * waves + 5)
    }

    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: ScanInput = if input.is_null() {
                ScanInput::default()
            } else {
                serde_json::from_value(input).map_err(|e| OpsError::ToolValidation(e.to_string()))?
            };

            let targets = self.selected(p.domain.as_deref());
            if targets.is_empty() {
                return Ok(ToolResult::error(match p.domain {
                    Some(d) => format!("no health targets configured for domain '{}'", d),
                    None => "no health targets configured".to_string(),
                }));
            }

            let client = build_client(self.fan_out.call_timeout())?;
            let calls = targets
                .iter()
                .map(|t| {
                    let client = client.clone();
                    let url = t.url.clone();
                    let expect = t.expect_status;
                    let call: BoxFuture<'static, Result<ProbeReport>> = Box::pin(async move {
                        probe(&client, reqwest::Method::GET, &url, expect).await
                    });
                    SubCall::new(slot_label(t), call)
                })
                .collect();

            let slots = self.fan_out.run(calls).await;
            let failing = slots
                .iter()
                .filter(|s| !matches!(&s.outcome, Ok(r) if r.healthy))
                .count();
            info!(targets = slots.len(), failing, "Health scan complete");

            Ok(ToolResult::success(render_report(&slots)))
        })
    }
}
