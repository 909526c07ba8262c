//! The tracking comment: the single user-facing progress record.
//!
//! One comment per task, owned by the bridge and edited in place. The body
//! opens with a hidden marker carrying the task id so a fresh executor
//! (e.g. a retry) can rediscover the comment instead of posting a new one.
//! Tracker failures are logged and swallowed; they must never mask the
//! underlying task status.

use std::sync::Arc;
use tracing::{info, warn};

use crate::github::GitHubClient;
use crate::task::Task;

/// Rendered as the comment header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerState {
    Queued,
    Working { attempt: u32, max_attempts: u32 },
    Completed,
    Failed,
}

/// Terminal link shown on success.
#[derive(Debug, Clone)]
pub enum CompletionLink {
    /// New-branch path: prefilled compare page.
    Compare(String),
    /// Append path: the pushed commit on the PR's existing head ref.
    Commit(String),
}

pub struct CommentTracker {
    github: Arc<GitHubClient>,
    installation_id: u64,
    repo_owner: String,
    repo_name: String,
    number: u64,
    task_id: String,
    prompt_summary: String,
    comment_id: Option<u64>,
    state: TrackerState,
    details: Vec<String>,
}

const DETAILS_SEPARATOR: &str = "\n\n---\n\n";

impl CommentTracker {
    pub fn new(github: Arc<GitHubClient>, task: &Task) -> Self {
        let (repo_owner, repo_name) = task.split_repo();
        Self {
            github,
            installation_id: task.installation_id,
            repo_owner,
            repo_name,
            number: task.number,
            task_id: task.id.clone(),
            prompt_summary: task.prompt_summary.clone(),
            comment_id: None,
            state: TrackerState::Queued,
            details: Vec::new(),
        }
    }

    fn marker(&self) -> String {
        marker_for(&self.task_id)
    }

    fn render(&self) -> String {
        render_body(
            &self.task_id,
            &render_header(&self.state),
            &self.prompt_summary,
            &self.details,
        )
    }

    /// Post the initial `Queued` comment. Called once at enqueue time.
    pub async fn create(&mut self) {
        self.state = TrackerState::Queued;
        self.push_edit().await;
    }

    /// Rediscover an existing tracking comment by its marker, recovering
    /// any detail lines a previous attempt appended. No-op when the
    /// comment is already known or none exists yet.
    pub async fn attach(&mut self) {
        if self.comment_id.is_some() {
            return;
        }

        let comments = match self
            .github
            .list_issue_comments(
                self.installation_id,
                &self.repo_owner,
                &self.repo_name,
                self.number,
            )
            .await
        {
            Ok(comments) => comments,
            Err(e) => {
                warn!("Failed to list comments for task {}: {:#}", self.task_id, e);
                return;
            }
        };

        let marker = self.marker();
        for comment in comments {
            if comment.body.starts_with(&marker) {
                info!(
                    "Reattached to tracking comment {} for task {}",
                    comment.id, self.task_id
                );
                self.comment_id = Some(comment.id);
                self.details = parse_details(&comment.body);
                return;
            }
        }
    }

    /// Replace the header, preserving appended detail sections.
    pub async fn set_state(&mut self, state: TrackerState) {
        self.state = state;
        self.push_edit().await;
    }

    /// Append a detail line under the header.
    pub async fn append_message(&mut self, text: &str) {
        self.details.push(text.to_string());
        self.push_edit().await;
    }

    /// Terminal success edit: summary line, changed files, and the
    /// compare/commit link (absent for analysis-only completions).
    pub async fn set_completed(
        &mut self,
        summary: &str,
        files: &[String],
        link: Option<CompletionLink>,
    ) {
        self.state = TrackerState::Completed;
        self.details.push(summary.to_string());

        if !files.is_empty() {
            let mut listing = String::from("**Changed files:**");
            for file in files {
                listing.push_str("\n- `");
                listing.push_str(file);
                listing.push('`');
            }
            self.details.push(listing);
        }

        match link {
            Some(CompletionLink::Compare(url)) => {
                self.details.push(format!("[Create a pull request]({})", url));
            }
            Some(CompletionLink::Commit(url)) => {
                self.details.push(format!("Pushed commit: {}", url));
            }
            None => {}
        }

        self.push_edit().await;
    }

    /// Terminal failure edit with the (already truncated) error tail.
    pub async fn set_failed(&mut self, error_text: &str) {
        self.state = TrackerState::Failed;
        self.details.push(format!("```\n{}\n```", error_text));
        self.push_edit().await;
    }

    /// Full-body replace; create on first use. Errors are logged and
    /// swallowed so tracker trouble never fails the task.
    async fn push_edit(&mut self) {
        let body = self.render();

        match self.comment_id {
            Some(comment_id) => {
                if let Err(e) = self
                    .github
                    .update_comment(
                        self.installation_id,
                        &self.repo_owner,
                        &self.repo_name,
                        comment_id,
                        &body,
                    )
                    .await
                {
                    warn!(
                        "Failed to update tracking comment for task {}: {:#}",
                        self.task_id, e
                    );
                }
            }
            None => {
                match self
                    .github
                    .post_issue_comment(
                        self.installation_id,
                        &self.repo_owner,
                        &self.repo_name,
                        self.number,
                        &body,
                    )
                    .await
                {
                    Ok(comment) => self.comment_id = Some(comment.id),
                    Err(e) => {
                        warn!(
                            "Failed to create tracking comment for task {}: {:#}",
                            self.task_id, e
                        );
                    }
                }
            }
        }
    }
}

pub fn marker_for(task_id: &str) -> String {
    format!("<!-- swe-bridge({}) -->", task_id)
}

pub fn render_header(state: &TrackerState) -> String {
    match state {
        TrackerState::Queued => "### ⏳ Queued".to_string(),
        TrackerState::Working {
            attempt,
            max_attempts,
        } => format!("### 🔄 Working (attempt {}/{})", attempt, max_attempts),
        TrackerState::Completed => "### ✅ Completed".to_string(),
        TrackerState::Failed => "### ❌ Failed".to_string(),
    }
}

pub fn render_body(task_id: &str, header: &str, prompt_summary: &str, details: &[String]) -> String {
    let mut body = format!("{}\n{}", marker_for(task_id), header);

    if !prompt_summary.is_empty() {
        body.push_str("\n\n");
        body.push_str(prompt_summary);
    }

    if !details.is_empty() {
        body.push_str(DETAILS_SEPARATOR);
        body.push_str(&details.join("\n\n"));
    }

    body
}

/// Inverse of `render_body` for the detail sections, used on reattach.
fn parse_details(body: &str) -> Vec<String> {
    match body.split_once(DETAILS_SEPARATOR) {
        Some((_, details)) => details
            .split("\n\n")
            .map(str::to_string)
            .collect(),
        None => Vec::new(),
    }
}
