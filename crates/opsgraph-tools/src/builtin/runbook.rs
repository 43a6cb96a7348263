use std::collections::BTreeMap;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::{info, warn};

use opsgraph_core::config::RunbookConfig;
use opsgraph_core::error::{OpsError, Result};
use opsgraph_core::traits::Tool;
use opsgraph_core::types::{ToolContext, ToolResult};

const MAX_OUTPUT: usize = 30_000;

/// Runs one of the operator-declared runbooks. The model picks a runbook
/// by name; it never supplies a command line.
pub struct RunbookTool {
    runbooks: BTreeMap<String, RunbookConfig>,
    default_timeout_secs: u64,
    description: String,
}

impl RunbookTool {
    pub fn new(runbooks: BTreeMap<String, RunbookConfig>, default_timeout_secs: u64) -> Self {
        let description = if runbooks.is_empty() {
            "Run a pre-approved remediation runbook by name. No runbooks are configured.".to_string()
        } else {
            let listing = runbooks
                .iter()
                .map(|(name, rb)| {
                    if rb.description.is_empty() {
                        format!("- {}", name)
                    } else {
                        format!("- {}: {}", name, rb.description)
                    }
                })
                .collect::<Vec<_>>()
                .join("\n");
            format!(
                "Run a pre-approved remediation runbook by name. Available runbooks:\n{}",
                listing
            )
        };
        Self {
            runbooks,
            default_timeout_secs,
            description,
        }
    }

    fn longest_timeout(&self) -> u64 {
        self.runbooks
            .values()
            .filter_map(|rb| rb.timeout_secs)
            .max()
            .unwrap_or(self.default_timeout_secs)
            .max(self.default_timeout_secs)
    }
}

#[derive(Deserialize)]
struct RunbookInput {
    runbook: String,
}

fn render_output(stdout: &[u8], stderr: &[u8]) -> String {
    let stdout = String::from_utf8_lossy(stdout);
    let stderr = String::from_utf8_lossy(stderr);

    let mut content = stdout.into_owned();
    if !stderr.is_empty() {
        if !content.is_empty() {
            content.push('\n');
        }
        content.push_str("STDERR:\n");
        content.push_str(&stderr);
    }
    if content.len() > MAX_OUTPUT {
        let mut cut = MAX_OUTPUT;
        while !content.is_char_boundary(cut) {
            cut -= 1;
        }
        content.truncate(cut);
        content.push_str("\n... (output truncated)");
    }
    if content.is_empty() {
        content = "(no output)".to_string();
    }
    content
}

impl Tool for RunbookTool {
    fn name(&self) -> &str {
        "run_runbook"
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> serde_json::Value {
        let names: Vec<&String> = self.runbooks.keys().collect();
        serde_json::json!({
            "type": "object",
            "properties": {
                "runbook": { "type": "string", "enum": names, "description": "Runbook name" }
            },
            "required": ["runbook"]
        })
    }

    fn timeout_secs(&self) -> Option<u64> {
        // Per-runbook timeouts are enforced inside execute
        Some(self.longest_timeout() + 1)
    }

    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: RunbookInput = serde_json::from_value(input)
                .map_err(|e| OpsError::ToolValidation(e.to_string()))?;

            let Some(rb) = self.runbooks.get(&p.runbook) else {
                let known: Vec<&str> = self.runbooks.keys().map(|s| s.as_str()).collect();
                return Ok(ToolResult::error(format!(
                    "unknown runbook '{}'; available: [{}]",
                    p.runbook,
                    known.join(", ")
                )));
            };

            let timeout_secs = rb.timeout_secs.unwrap_or(self.default_timeout_secs);
            info!(
                session_id = %ctx.session_id,
                node = %ctx.node,
                runbook = %p.runbook,
                command = %rb.command,
                "Running runbook"
            );

            let result = tokio::time::timeout(
                Duration::from_secs(timeout_secs),
                tokio::process::Command::new(&rb.command)
                    .args(&rb.args)
                    .kill_on_drop(true)
                    .output(),
            )
            .await;

            match result {
                Ok(Ok(output)) => {
                    let content = render_output(&output.stdout, &output.stderr);
                    if output.status.success() {
                        Ok(ToolResult::success(content))
                    } else {
                        let code = output.status.code().unwrap_or(-1);
                        warn!(runbook = %p.runbook, code, "Runbook exited with failure");
                        Ok(ToolResult::error(format!("Exit code {}\n{}", code, content)))
                    }
                }
                Ok(Err(e)) => Err(OpsError::ToolExecution {
                    tool: "run_runbook".to_string(),
                    message: format!("{}: {}", rb.command, e),
                }),
                Err(_) => Err(OpsError::ToolTimeout {
                    tool: "run_runbook".to_string(),
                    timeout_secs,
                }),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsgraph_core::types::SessionId;

    fn runbook(command: &str, args: &[&str], timeout: Option<u64>) -> RunbookConfig {
        RunbookConfig {
            description: format!("runs {}", command),
            command: command.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            timeout_secs: timeout,
        }
    }

    fn ctx() -> ToolContext {
        ToolContext {
            session_id: SessionId::new(),
            node: "Automation_Specialist".into(),
        }
    }

    fn tool() -> RunbookTool {
        let mut books = BTreeMap::new();
        books.insert("echo-restart".into(), runbook("echo", &["restarted", "frontend"], None));
        books.insert("fail".into(), runbook("sh", &["-c", "echo boom >&2; exit 3"], None));
        books.insert("hang".into(), runbook("sleep", &["30"], Some(1)));
        RunbookTool::new(books, 10)
    }

    #[test]
    fn description_lists_runbooks() {
        let t = tool();
        assert!(t.description().contains("- echo-restart: runs echo"));
        assert_eq!(t.input_schema()["properties"]["runbook"]["enum"][0], "echo-restart");
    }

    #[tokio::test]
    async fn runs_configured_command() {
        let result = tool()
            .execute(serde_json::json!({"runbook": "echo-restart"}), ctx())
            .await
            .unwrap();
        assert!(!result.is_error);
        assert_eq!(result.content.trim(), "restarted frontend");
    }

    #[tokio::test]
    async fn non_zero_exit_is_error_result() {
        let result = tool()
            .execute(serde_json::json!({"runbook": "fail"}), ctx())
            .await
            .unwrap();
        assert!(result.is_error);
        assert!(result.content.starts_with("Exit code 3"));
        assert!(result.content.contains("STDERR:\nboom"));
    }

    #[tokio::test]
    async fn unknown_runbook_lists_choices() {
        let result = tool()
            .execute(serde_json::json!({"runbook": "drop-database"}), ctx())
            .await
            .unwrap();
        assert!(result.is_error);
        assert!(result.content.contains("echo-restart"));
    }

    #[tokio::test]
    async fn runbook_timeout() {
        let err = tool()
            .execute(serde_json::json!({"runbook": "hang"}), ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, OpsError::ToolTimeout { timeout_secs: 1, .. }));
    }

    #[test]
    fn output_truncation_respects_char_boundaries() {
        let long = "é".repeat(MAX_OUTPUT);
        let rendered = render_output(long.as_bytes(), b"");
        assert!(rendered.ends_with("(output truncated)"));
        assert_eq!(render_output(b"", b""), "(no output)");
    }
}
