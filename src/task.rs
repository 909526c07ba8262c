//! Task identity and the unit of work handed to the dispatcher.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// A code-generation task derived from a triggering comment.
///
/// The tracking-comment handle deliberately does not live here; the
/// executor rediscovers the comment through its body marker, so the task
/// stays a plain value that can be requeued freely.
#[derive(Debug, Clone)]
pub struct Task {
    /// Semantic id: `{repo|/→-}[-issue-{N}][-pr-{M}]-{nanos}`.
    pub id: String,
    /// Canonical `owner/name`.
    pub repo: String,
    /// Primary issue or PR number (the one the comment landed on).
    pub number: u64,
    /// Base branch, target of an eventual PR.
    pub branch: String,
    pub prompt: String,
    pub prompt_summary: String,
    pub issue_title: String,
    pub issue_body: String,
    pub is_pr: bool,
    /// Head ref when the event originated on a PR.
    pub pr_branch: Option<String>,
    /// `"open"` or `"closed"` when the event originated on a PR.
    pub pr_state: Option<String>,
    /// Actor who posted the trigger comment.
    pub username: String,
    /// GitHub App installation the repo belongs to, for token minting.
    pub installation_id: u64,
    /// Retry counter, maintained by the dispatcher. 1-based.
    pub attempt: u32,
    /// Free-form context forwarded to the provider.
    pub prompt_context: HashMap<String, String>,
}

impl Task {
    /// Serialization key for per-task mutual exclusion.
    pub fn lock_key(&self) -> String {
        format!("{}#{}", self.repo, self.number)
    }

    /// `(owner, name)` split of the repo slug.
    pub fn split_repo(&self) -> (String, String) {
        split_repo(&self.repo)
    }
}

pub fn split_repo(full: &str) -> (String, String) {
    match full.split_once('/') {
        Some((owner, name)) => (owner.to_string(), name.to_string()),
        None => (full.to_string(), String::new()),
    }
}

/// Components of a semantic task id. Issue and PR segments are optional;
/// rendering order is fixed: repo, issue, pr, timestamp.
#[derive(Debug, Clone, Default)]
pub struct TaskIdComponents {
    pub repo: String,
    pub issue_number: Option<u64>,
    pub pr_number: Option<u64>,
    pub timestamp_ns: u128,
}

impl TaskIdComponents {
    pub fn now(repo: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            issue_number: None,
            pr_number: None,
            timestamp_ns: nanos_since_epoch(),
        }
    }

    pub fn render(&self) -> String {
        let mut parts = vec![self.repo.replace('/', "-")];

        if let Some(issue) = self.issue_number {
            parts.push(format!("issue-{}", issue));
        }

        if let Some(pr) = self.pr_number {
            parts.push(format!("pr-{}", pr));
        }

        parts.push(self.timestamp_ns.to_string());
        parts.join("-")
    }
}

/// Nanoseconds since the epoch; monotone enough to keep ids unique even
/// under webhook bursts.
pub fn nanos_since_epoch() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn components(
        repo: &str,
        issue: Option<u64>,
        pr: Option<u64>,
        ts: u128,
    ) -> TaskIdComponents {
        TaskIdComponents {
            repo: repo.to_string(),
            issue_number: issue,
            pr_number: pr,
            timestamp_ns: ts,
        }
    }

    #[test]
    fn test_render_issue_only() {
        let id = components("owner/repo", Some(123), None, 1234567890).render();
        assert_eq!(id, "owner-repo-issue-123-1234567890");
    }

    #[test]
    fn test_render_pr_only() {
        let id = components("owner/repo", None, Some(456), 1234567890).render();
        assert_eq!(id, "owner-repo-pr-456-1234567890");
    }

    #[test]
    fn test_render_issue_and_pr() {
        let id = components("owner/repo", Some(123), Some(456), 1234567890).render();
        assert_eq!(id, "owner-repo-issue-123-pr-456-1234567890");
    }

    #[test]
    fn test_render_timestamp_only() {
        let id = components("owner/repo", None, None, 1234567890).render();
        assert_eq!(id, "owner-repo-1234567890");
    }

    #[test]
    fn test_render_sanitizes_nested_slashes() {
        let id = components("deep/nested/repo", Some(1), None, 1234567890).render();
        assert_eq!(id, "deep-nested-repo-issue-1-1234567890");
    }

    #[test]
    fn test_render_segment_ordering() {
        let id = components("owner/repo", Some(10), Some(20), 9999).render();
        assert_eq!(id, "owner-repo-issue-10-pr-20-9999");
    }

    #[test]
    fn test_render_large_numbers() {
        let id = components("owner/repo", Some(999_999), Some(888_888), 1234567890).render();
        assert!(id.contains("issue-999999"));
        assert!(id.contains("pr-888888"));
    }

    #[test]
    fn test_nanos_monotone_across_calls() {
        let a = nanos_since_epoch();
        let b = nanos_since_epoch();
        assert!(b >= a);
    }

    #[test]
    fn test_lock_key() {
        let mut task = sample_task();
        task.repo = "acme/widgets".to_string();
        task.number = 7;
        assert_eq!(task.lock_key(), "acme/widgets#7");
    }

    #[test]
    fn test_split_repo() {
        assert_eq!(
            split_repo("owner/repo"),
            ("owner".to_string(), "repo".to_string())
        );
        assert_eq!(split_repo("bare"), ("bare".to_string(), String::new()));
    }

    pub(crate) fn sample_task() -> Task {
        Task {
            id: "owner-repo-issue-1-1".to_string(),
            repo: "owner/repo".to_string(),
            number: 1,
            branch: "main".to_string(),
            prompt: "do the thing".to_string(),
            prompt_summary: "**Issue:** thing".to_string(),
            issue_title: "thing".to_string(),
            issue_body: String::new(),
            is_pr: false,
            pr_branch: None,
            pr_state: None,
            username: "alice".to_string(),
            installation_id: 99,
            attempt: 1,
            prompt_context: HashMap::new(),
        }
    }
}
