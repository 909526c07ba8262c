//! Claude Code CLI driver.

use anyhow::Result;
use tokio::process::Command;
use tracing::info;

use super::{run_tool, CodeRequest, DEFAULT_DEADLINE};

pub struct ClaudeCli {
    model: String,
    api_key: Option<String>,
}

impl ClaudeCli {
    pub fn new(model: String, api_key: Option<String>) -> Self {
        Self { model, api_key }
    }

    pub(crate) async fn invoke(&self, req: &CodeRequest) -> Result<String> {
        let mut command = Command::new("claude");
        command
            .arg("-p")
            .arg(&req.prompt)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--model")
            .arg(&self.model)
            .arg("--dangerously-skip-permissions")
            .current_dir(&req.repo_path);

        if let Some(key) = &self.api_key {
            command.env("ANTHROPIC_API_KEY", key);
        }

        // Repo-scoped token for any in-tool git/API use
        if let Some(token) = req.context.get("github_token") {
            if !token.is_empty() {
                command.env("GITHUB_TOKEN", token);
                command.env("GH_TOKEN", token);
            }
        }

        info!(
            "[claude] Executing: claude -p <prompt> --output-format stream-json --model {} -C {}",
            self.model,
            req.repo_path.display()
        );

        run_tool(command, "claude", req.timeout.unwrap_or(DEFAULT_DEADLINE)).await
    }
}
