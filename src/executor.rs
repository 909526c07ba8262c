//! The per-task state machine:
//!
//! ```text
//! Queued → Working → Cloning → Invoking → Detecting →
//!   { NoChange → Completed(analysis-only)
//!   | Changed → Committing → Pushing → Linking → Completed }
//! Any step → Failed (fatal error or exhausted retries)
//! ```
//!
//! Clone, invoke, and push failures are retryable within the dispatcher's
//! attempts budget; detect, commit, and link failures are terminal. Every
//! transition edits the tracking comment and mirrors into the task store.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::command::summarize_instruction;
use crate::config::Config;
use crate::git::GitWorkspace;
use crate::github::GitHubClient;
use crate::provider::{CodeRequest, Provider};
use crate::task::{nanos_since_epoch, Task};
use crate::taskstore::{LogLevel, TaskStatus, TaskStore};
use crate::tracker::{CommentTracker, CompletionLink, TrackerState};

/// Step failures, split by retry class.
#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("clone failed: {0}")]
    Clone(#[source] anyhow::Error),

    #[error("provider failed: {0}")]
    Invoke(#[source] anyhow::Error),

    #[error("change detection failed: {0}")]
    Detect(#[source] anyhow::Error),

    #[error("commit failed: {0}")]
    Commit(#[source] anyhow::Error),

    #[error("push failed: {0}")]
    Push(#[source] anyhow::Error),

    #[error("result linking failed: {0}")]
    Link(#[source] anyhow::Error),

    #[error("task cancelled")]
    Cancelled,
}

impl ExecuteError {
    /// Whether the dispatcher may reschedule the task.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecuteError::Clone(_) | ExecuteError::Invoke(_) | ExecuteError::Push(_)
        )
    }
}

/// Execution seam between the dispatcher and the real executor, so worker
/// behavior is testable without git, GitHub, or provider binaries.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: &Task, cancel: &CancellationToken) -> Result<(), ExecuteError>;
}

pub struct Executor {
    github: Arc<GitHubClient>,
    provider: Arc<Provider>,
    store: TaskStore,
    git_name: String,
    git_email: String,
    max_attempts: u32,
}

impl Executor {
    pub fn new(
        github: Arc<GitHubClient>,
        provider: Arc<Provider>,
        store: TaskStore,
        config: &Config,
    ) -> Self {
        Self {
            github,
            provider,
            store,
            git_name: config.git_name.clone(),
            git_email: config.git_email.clone(),
            max_attempts: config.dispatcher.max_attempts,
        }
    }

    async fn log(&self, task_id: &str, level: LogLevel, message: &str) {
        if let Err(e) = self.store.add_log(task_id, level, message).await {
            warn!("Failed to record log for task {}: {:#}", task_id, e);
        }
    }

    async fn set_status(&self, task_id: &str, status: TaskStatus) {
        if let Err(e) = self.store.update_status(task_id, status).await {
            warn!("Failed to update status for task {}: {:#}", task_id, e);
        }
    }

    /// Drive the full state machine for one attempt.
    async fn run_steps(
        &self,
        task: &Task,
        tracker: &mut CommentTracker,
        cancel: &CancellationToken,
    ) -> Result<(), ExecuteError> {
        // ── Working ──
        tracker
            .set_state(TrackerState::Working {
                attempt: task.attempt,
                max_attempts: self.max_attempts,
            })
            .await;
        self.set_status(&task.id, TaskStatus::Running).await;
        self.log(
            &task.id,
            LogLevel::Info,
            &format!("Attempt {}/{} started", task.attempt, self.max_attempts),
        )
        .await;

        // ── Cloning ──
        if cancel.is_cancelled() {
            return Err(ExecuteError::Cancelled);
        }

        let token = self
            .github
            .get_installation_token(task.installation_id)
            .await
            .map_err(ExecuteError::Clone)?;

        let workdir = tempfile::tempdir().map_err(|e| ExecuteError::Clone(e.into()))?;
        let repo_path = workdir.path().join("repo");

        let append_path = is_append_path(task);
        let checkout_ref = if append_path {
            task.pr_branch.as_deref().unwrap_or(&task.branch)
        } else {
            &task.branch
        };

        let workspace = GitWorkspace::clone_shallow(&task.repo, checkout_ref, &token, &repo_path)
            .await
            .map_err(ExecuteError::Clone)?;

        self.log(
            &task.id,
            LogLevel::Info,
            &format!("Cloned {} at {}", task.repo, checkout_ref),
        )
        .await;

        // ── Invoking ──
        if cancel.is_cancelled() {
            return Err(ExecuteError::Cancelled);
        }

        let mut context = task.prompt_context.clone();
        context.insert("github_token".to_string(), token.clone());

        let request = CodeRequest {
            prompt: task.prompt.clone(),
            repo_path: workspace.root().to_path_buf(),
            context,
            timeout: None,
        };

        let response = self
            .provider
            .generate_code(&request)
            .await
            .map_err(ExecuteError::Invoke)?;

        self.log(
            &task.id,
            LogLevel::Info,
            &format!("{} output: {}", self.provider.name(), response.summary),
        )
        .await;
        tracker
            .append_message(&format!("`{}` finished", self.provider.name()))
            .await;

        // ── Detecting ──
        if cancel.is_cancelled() {
            return Err(ExecuteError::Cancelled);
        }

        let changed_files = workspace
            .changed_files()
            .await
            .map_err(ExecuteError::Detect)?;

        if changed_files.is_empty() {
            info!("Task {}: no file changes, completing as analysis-only", task.id);
            tracker
                .set_completed(
                    "Analysis complete — the tool made no file changes.",
                    &[],
                    None,
                )
                .await;
            self.set_status(&task.id, TaskStatus::Completed).await;
            self.log(&task.id, LogLevel::Success, "Completed without changes")
                .await;
            return Ok(());
        }

        // ── Committing ──
        if cancel.is_cancelled() {
            return Err(ExecuteError::Cancelled);
        }

        let push_branch = if append_path {
            checkout_ref.to_string()
        } else {
            let name = new_branch_name(task.number);
            workspace
                .checkout_new_branch(&name)
                .await
                .map_err(ExecuteError::Commit)?;
            name
        };

        workspace
            .commit_all(&commit_message(task), &self.git_name, &self.git_email)
            .await
            .map_err(ExecuteError::Commit)?;

        self.log(
            &task.id,
            LogLevel::Info,
            &format!("Committed {} file(s) to {}", changed_files.len(), push_branch),
        )
        .await;

        // ── Pushing ──
        if cancel.is_cancelled() {
            return Err(ExecuteError::Cancelled);
        }

        workspace
            .push(&push_branch)
            .await
            .map_err(ExecuteError::Push)?;

        // ── Linking ──
        let link = if append_path {
            let sha = workspace.head_sha().await.map_err(ExecuteError::Link)?;
            CompletionLink::Commit(commit_url(&task.repo, &sha))
        } else {
            let url = compare_url(task, &push_branch).map_err(ExecuteError::Link)?;
            CompletionLink::Compare(url)
        };

        tracker
            .set_completed(
                &format!("Changes pushed to `{}`.", push_branch),
                &changed_files,
                Some(link),
            )
            .await;
        self.set_status(&task.id, TaskStatus::Completed).await;
        self.log(
            &task.id,
            LogLevel::Success,
            &format!("Completed: pushed {} to {}", changed_files.len(), push_branch),
        )
        .await;

        Ok(())
    }
}

#[async_trait]
impl TaskRunner for Executor {
    async fn run(&self, task: &Task, cancel: &CancellationToken) -> Result<(), ExecuteError> {
        let mut tracker = CommentTracker::new(self.github.clone(), task);
        tracker.attach().await;

        match self.run_steps(task, &mut tracker, cancel).await {
            Ok(()) => Ok(()),
            Err(ExecuteError::Cancelled) => {
                self.log(&task.id, LogLevel::Hint, "Cancelled during shutdown")
                    .await;
                Err(ExecuteError::Cancelled)
            }
            Err(e) => {
                let summary = crate::command::truncate_text(&format!("{:#}", e), 600);
                self.log(&task.id, LogLevel::Error, &summary).await;

                let will_retry = e.is_retryable() && task.attempt < self.max_attempts;
                if will_retry {
                    tracker
                        .append_message(&format!(
                            "Attempt {}/{} failed: {} — retrying",
                            task.attempt, self.max_attempts, summary
                        ))
                        .await;
                } else {
                    tracker.set_failed(&summary).await;
                    self.set_status(&task.id, TaskStatus::Failed).await;
                }

                Err(e)
            }
        }
    }
}

/// Append path: the event originated on a PR that is still open, so
/// commits go onto its existing head ref instead of a fresh branch.
pub fn is_append_path(task: &Task) -> bool {
    task.is_pr
        && task.pr_branch.as_deref().is_some_and(|b| !b.is_empty())
        && task.pr_state.as_deref() == Some("open")
}

/// Fresh branch for the new-branch path.
pub fn new_branch_name(number: u64) -> String {
    format!("swe-agent/{}-{}", number, nanos_since_epoch())
}

/// Commit message: one summarized subject line, attribution in the body.
/// Only the instruction section of the prompt feeds the subject; the
/// issue-context tail after the separator is reference material.
pub fn commit_message(task: &Task) -> String {
    let instruction = task.prompt.split("\n\n---\n\n").next().unwrap_or("");
    let subject = {
        let summarized = summarize_instruction(instruction, 72);
        if summarized.is_empty() {
            summarize_instruction(&task.issue_title, 72)
        } else {
            summarized
        }
    };
    format!("swe-agent: {}\n\nRequested by @{}", subject, task.username)
}

/// Prefilled compare page: base is the task's base branch, head the new
/// branch; title and `Fixes #N` body are query-encoded.
pub fn compare_url(task: &Task, head_branch: &str) -> Result<String> {
    let title = if task.issue_title.trim().is_empty() {
        summarize_instruction(&task.prompt, 80)
    } else {
        task.issue_title.trim().to_string()
    };

    let base = format!(
        "https://github.com/{}/compare/{}...{}",
        task.repo, task.branch, head_branch
    );
    let body = format!("Fixes #{}", task.number);
    let url = reqwest::Url::parse_with_params(
        &base,
        &[
            ("expand", "1"),
            ("title", title.as_str()),
            ("body", body.as_str()),
        ],
    )?;

    Ok(url.to_string())
}

pub fn commit_url(repo: &str, sha: &str) -> String {
    format!("https://github.com/{}/commit/{}", repo, sha)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn task() -> Task {
        Task {
            id: "owner-repo-issue-123-1".to_string(),
            repo: "owner/repo".to_string(),
            number: 123,
            branch: "main".to_string(),
            prompt: "fix the off-by-one in the paginator".to_string(),
            prompt_summary: String::new(),
            issue_title: "Paginator skips last page".to_string(),
            issue_body: String::new(),
            is_pr: false,
            pr_branch: None,
            pr_state: None,
            username: "alice".to_string(),
            installation_id: 1,
            attempt: 1,
            prompt_context: HashMap::new(),
        }
    }

    #[test]
    fn test_retry_classification() {
        assert!(ExecuteError::Clone(anyhow::anyhow!("x")).is_retryable());
        assert!(ExecuteError::Invoke(anyhow::anyhow!("x")).is_retryable());
        assert!(ExecuteError::Push(anyhow::anyhow!("x")).is_retryable());
        assert!(!ExecuteError::Detect(anyhow::anyhow!("x")).is_retryable());
        assert!(!ExecuteError::Commit(anyhow::anyhow!("x")).is_retryable());
        assert!(!ExecuteError::Link(anyhow::anyhow!("x")).is_retryable());
        assert!(!ExecuteError::Cancelled.is_retryable());
    }

    #[test]
    fn test_append_path_requires_open_pr_with_branch() {
        let mut t = task();
        assert!(!is_append_path(&t));

        t.is_pr = true;
        t.pr_branch = Some("feature/x".to_string());
        t.pr_state = Some("open".to_string());
        assert!(is_append_path(&t));

        t.pr_state = Some("closed".to_string());
        assert!(!is_append_path(&t));

        t.pr_state = Some("open".to_string());
        t.pr_branch = Some(String::new());
        assert!(!is_append_path(&t));

        t.pr_branch = None;
        assert!(!is_append_path(&t));
    }

    #[test]
    fn test_new_branch_name_shape() {
        let name = new_branch_name(123);
        assert!(name.starts_with("swe-agent/123-"));
        let suffix = name.trim_start_matches("swe-agent/123-");
        assert!(suffix.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_commit_message_prefers_instruction() {
        let message = commit_message(&task());
        assert!(message.starts_with("swe-agent: fix the off-by-one in the paginator"));
        assert!(message.contains("Requested by @alice"));
    }

    #[test]
    fn test_commit_message_ignores_issue_context_tail() {
        let mut t = task();
        t.prompt = format!(
            "{}\n\n---\n\n# Issue Context\n\n## Title\nPaginator skips last page",
            t.prompt
        );
        let message = commit_message(&t);
        assert!(message.starts_with("swe-agent: fix the off-by-one in the paginator"));
        assert!(!message.contains("Issue Context"));
    }

    #[test]
    fn test_commit_message_falls_back_to_title() {
        let mut t = task();
        t.prompt = String::new();
        let message = commit_message(&t);
        assert!(message.starts_with("swe-agent: Paginator skips last page"));
    }

    #[test]
    fn test_compare_url_shape() {
        let url = compare_url(&task(), "swe-agent/123-42").unwrap();
        assert!(url.starts_with("https://github.com/owner/repo/compare/main...swe-agent/123-42?"));
        assert!(url.contains("expand=1"));
        assert!(url.contains("body=Fixes+%23123"));
        // Title with spaces is query-encoded
        assert!(url.contains("title=Paginator+skips+last+page"));
    }

    #[test]
    fn test_commit_url() {
        assert_eq!(
            commit_url("owner/repo", "abc123"),
            "https://github.com/owner/repo/commit/abc123"
        );
    }
}
