//! Codex CLI driver.

use anyhow::Result;
use tokio::process::Command;
use tracing::info;

use super::{run_tool, CodeRequest, DEFAULT_DEADLINE};

pub struct CodexCli {
    model: String,
    api_key: Option<String>,
    base_url: Option<String>,
}

impl CodexCli {
    pub fn new(model: String, api_key: Option<String>, base_url: Option<String>) -> Self {
        Self {
            model,
            api_key,
            base_url,
        }
    }

    pub(crate) async fn invoke(&self, req: &CodeRequest) -> Result<String> {
        let mut command = Command::new("codex");
        command
            .arg("exec")
            .arg("-m")
            .arg(&self.model)
            .arg("-c")
            .arg(r#"model_reasoning_effort="high""#)
            .arg("--dangerously-bypass-approvals-and-sandbox")
            .arg("--json")
            .arg("-C")
            .arg(&req.repo_path)
            .arg(&req.prompt);

        if let Some(key) = &self.api_key {
            command.env("OPENAI_API_KEY", key);
        }
        // Custom endpoints (proxies, local deployments)
        if let Some(base_url) = &self.base_url {
            command.env("OPENAI_BASE_URL", base_url);
        }
        command.env("SANDBOX_MODE", "danger-full-access");

        if let Some(token) = req.context.get("github_token") {
            if !token.is_empty() {
                command.env("GITHUB_TOKEN", token);
                command.env("GH_TOKEN", token);
            }
        }

        info!(
            "[codex] Executing: codex exec -m {} -c model_reasoning_effort=\"high\" --dangerously-bypass-approvals-and-sandbox -C {}",
            self.model,
            req.repo_path.display()
        );

        run_tool(command, "codex", req.timeout.unwrap_or(DEFAULT_DEADLINE)).await
    }
}
