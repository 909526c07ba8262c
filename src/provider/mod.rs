//! AI-tool adapters.
//!
//! Each provider is an opaque CLI driven as a subprocess: prompt and
//! working directory in, aggregated text summary out. Credentials travel
//! via the environment only, never argv. Adding a provider means adding a
//! variant here and a driver module next to the existing ones.

mod claude;
mod codex;

pub use claude::ClaudeCli;
pub use codex::CodexCli;

use anyhow::{anyhow, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::info;

use crate::config::{Config, ProviderKind};

/// Wall-clock ceiling applied when a request carries no deadline.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(10 * 60);

/// Bound on stored/logged summaries of tool output.
const SUMMARY_LIMIT: usize = 2000;
/// Bound on failure summaries (stderr tail).
const FAILURE_LIMIT: usize = 1000;

pub struct CodeRequest {
    pub prompt: String,
    pub repo_path: PathBuf,
    /// Forwarded task context; `github_token` is lifted into the child env.
    pub context: HashMap<String, String>,
    pub timeout: Option<Duration>,
}

pub struct CodeResponse {
    /// Compact aggregate of the tool's structured output; bookkeeping only.
    pub summary: String,
}

pub enum Provider {
    Claude(ClaudeCli),
    Codex(CodexCli),
}

impl Provider {
    /// Select and construct the provider once at process start.
    pub fn from_config(config: &Config) -> Self {
        match config.provider {
            ProviderKind::Claude => Provider::Claude(ClaudeCli::new(
                config.claude_model.clone(),
                config.anthropic_api_key.clone(),
            )),
            ProviderKind::Codex => Provider::Codex(CodexCli::new(
                config.codex_model.clone(),
                config.openai_api_key.clone(),
                config.openai_base_url.clone(),
            )),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Provider::Claude(_) => "claude",
            Provider::Codex(_) => "codex",
        }
    }

    pub async fn generate_code(&self, req: &CodeRequest) -> Result<CodeResponse> {
        info!(
            "[{}] Starting code generation (prompt length: {} chars)",
            self.name(),
            req.prompt.len()
        );

        let output = match self {
            Provider::Claude(cli) => cli.invoke(req).await?,
            Provider::Codex(cli) => cli.invoke(req).await?,
        };

        info!(
            "[{}] Response length: {} characters",
            self.name(),
            output.len()
        );
        Ok(CodeResponse {
            summary: truncate_log(&output, SUMMARY_LIMIT),
        })
    }
}

/// Run a prepared tool command under a deadline, returning aggregated
/// structured output. Shared by all drivers.
pub(crate) async fn run_tool(
    mut command: Command,
    tool: &str,
    deadline: Duration,
) -> Result<String> {
    command.kill_on_drop(true);
    command.stdin(std::process::Stdio::null());
    command.stdout(std::process::Stdio::piped());
    command.stderr(std::process::Stdio::piped());

    let started = Instant::now();
    let child = command
        .spawn()
        .map_err(|e| anyhow!("failed to spawn {} CLI: {}", tool, e))?;

    let output = match tokio::time::timeout(deadline, child.wait_with_output()).await {
        Ok(result) => result.map_err(|e| anyhow!("{} CLI process failed: {}", tool, e))?,
        Err(_) => {
            // kill_on_drop reaps the process group when the future is dropped
            return Err(anyhow!(
                "{} CLI timeout after {:?}",
                tool,
                started.elapsed()
            ));
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    if !output.status.success() {
        let elapsed = started.elapsed();
        let summary = summarize_process_failure(&stderr, &stdout);
        return Err(anyhow!(
            "{} CLI failed with {} after {:?}: {}",
            tool,
            output.status,
            elapsed,
            summary
        ));
    }

    info!(
        "[{}] Command completed in {:?}, output length: {} bytes",
        tool,
        started.elapsed(),
        stdout.len()
    );

    let aggregated = aggregate_structured_output(&stdout);
    if aggregated.is_empty() {
        Ok(stdout.trim().to_string())
    } else {
        Ok(aggregated)
    }
}

/// Collapse line-oriented JSON output into readable text.
///
/// Each line is parsed as JSON: `message` wins, then `item.text`, then the
/// concatenation of `item.content[].text`. Parseable lines with none of
/// those are dropped; unparseable lines pass through verbatim.
pub(crate) fn aggregate_structured_output(output: &str) -> String {
    let mut sections = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match extract_message_from_json_line(line) {
            Some(Some(msg)) => sections.push(msg),
            Some(None) => {} // structured but carries no text
            None => sections.push(line.to_string()),
        }
    }

    sections.join("\n\n")
}

/// `Some(Some(msg))`: JSON with text. `Some(None)`: JSON without text.
/// `None`: not JSON.
fn extract_message_from_json_line(line: &str) -> Option<Option<String>> {
    let envelope: Value = serde_json::from_str(line).ok()?;

    if let Some(msg) = envelope.get("message").and_then(Value::as_str) {
        if !msg.is_empty() {
            return Some(Some(msg.to_string()));
        }
    }

    if let Some(item) = envelope.get("item") {
        return Some(extract_text_from_item(item));
    }

    Some(None)
}

fn extract_text_from_item(item: &Value) -> Option<String> {
    if let Some(text) = item.get("text").and_then(Value::as_str) {
        if !text.is_empty() {
            return Some(text.to_string());
        }
    }

    if let Some(content) = item.get("content").and_then(Value::as_array) {
        let parts: Vec<&str> = content
            .iter()
            .filter_map(|segment| segment.get("text").and_then(Value::as_str))
            .filter(|text| !text.is_empty())
            .collect();
        if !parts.is_empty() {
            return Some(parts.join("\n"));
        }
    }

    None
}

/// Truncate to `max_len` chars keeping a short head and a long tail around
/// an ellipsis marker. The tail usually holds the actionable error, so it
/// gets the larger share.
pub(crate) fn truncate_log(s: &str, max_len: usize) -> String {
    const MARKER: &str = "\n... (truncated) ...\n";

    if max_len == 0 {
        return String::new();
    }

    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= max_len {
        return s.to_string();
    }

    let marker_len = MARKER.chars().count();

    // Very small limits: spend everything on the tail, skip the marker
    if max_len <= marker_len + 32 {
        return chars[chars.len() - max_len..].iter().collect();
    }

    let head_len = max_len / 4;
    let tail_len = max_len - head_len - marker_len;

    let head: String = chars[..head_len].iter().collect();
    let tail: String = chars[chars.len() - tail_len..].iter().collect();

    format!("{}{}{}", head, MARKER, tail)
}

/// Failure summary: stderr first, else parsed stdout, else raw stdout.
pub(crate) fn summarize_process_failure(stderr: &str, stdout: &str) -> String {
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return truncate_log(stderr, FAILURE_LIMIT);
    }

    let stdout = stdout.trim();
    let parsed = aggregate_structured_output(stdout);
    if !parsed.is_empty() {
        return truncate_log(&parsed, FAILURE_LIMIT);
    }

    truncate_log(stdout, FAILURE_LIMIT)
}
