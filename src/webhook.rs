//! Webhook intake: signature verification, event parsing, the
//! ignore/authorize/dedupe pipeline, task construction, and enqueueing.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::command::{build_prompt, build_prompt_summary, extract_prompt};
use crate::dispatcher::EnqueueError;
use crate::task::{split_repo, Task, TaskIdComponents};
use crate::taskstore::{LogEntry, LogLevel, StoredTask};
use crate::tracker::CommentTracker;
use crate::AppState;

/// Deadline for the best-effort linked-issue enrichment query.
const ENRICHMENT_DEADLINE: Duration = Duration::from_secs(2);

// ── Payload types ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct IssueCommentEvent {
    #[serde(default)]
    pub action: String,
    pub issue: Issue,
    pub comment: EventComment,
    pub repository: Repository,
    pub installation: Option<Installation>,
}

#[derive(Debug, Deserialize)]
pub struct ReviewCommentEvent {
    #[serde(default)]
    pub action: String,
    pub comment: EventComment,
    pub pull_request: PullRequest,
    pub repository: Repository,
    pub installation: Option<Installation>,
}

#[derive(Debug, Deserialize)]
pub struct Issue {
    pub number: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    /// Present when the "issue" is actually a pull request.
    pub pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct EventComment {
    pub id: u64,
    #[serde(default)]
    pub body: String,
    pub user: User,
}

#[derive(Debug, Deserialize)]
pub struct User {
    pub login: String,
    #[serde(rename = "type", default)]
    pub user_type: Option<String>,
}

impl User {
    fn is_bot(&self) -> bool {
        self.user_type.as_deref() == Some("Bot")
    }
}

#[derive(Debug, Deserialize)]
pub struct Repository {
    pub full_name: String,
    #[serde(default)]
    pub default_branch: String,
}

#[derive(Debug, Deserialize)]
pub struct Installation {
    pub id: u64,
}

#[derive(Debug, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub state: String,
    pub head: BranchRef,
    pub base: BranchRef,
}

#[derive(Debug, Deserialize)]
pub struct BranchRef {
    #[serde(rename = "ref")]
    pub ref_name: String,
}

// ── Signature verification ───────────────────────────────────────────────

type HmacSha256 = Hmac<Sha256>;

/// Constant-time HMAC-SHA-256 check of `sha256=<hex>` against the raw body.
pub fn verify_github_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let Some(signature_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };

    let signature_bytes = match hex::decode(signature_hex) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };

    mac.update(payload);

    // Constant-time verification
    mac.verify_slice(&signature_bytes).is_ok()
}

async fn verify_webhook_signature(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    let signature = parts
        .headers
        .get("x-hub-signature-256")
        .and_then(|h| h.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    if !verify_github_signature(&state.webhook_secret, &bytes, signature) {
        error!("Invalid webhook signature");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let request = Request::from_parts(parts, axum::body::Body::from(bytes));
    Ok(next.run(request).await)
}

// ── Handlers ─────────────────────────────────────────────────────────────

pub async fn github_webhook_handler(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Response {
    let event_type = request
        .headers()
        .get("x-github-event")
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let (_parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(_) => return (StatusCode::BAD_REQUEST, "Error reading payload").into_response(),
    };

    let (status, message) = match event_type.as_str() {
        "issue_comment" => handle_issue_comment(&state, &bytes).await,
        "pull_request_review_comment" => handle_review_comment(&state, &bytes).await,
        other => {
            info!("Ignoring unsupported event type: {:?}", other);
            (StatusCode::OK, "Event ignored".to_string())
        }
    };

    (status, message).into_response()
}

pub async fn handle_issue_comment(state: &AppState, payload: &[u8]) -> (StatusCode, String) {
    let event: IssueCommentEvent = match serde_json::from_slice(payload) {
        Ok(event) => event,
        Err(e) => {
            error!("Error parsing issue_comment event: {}", e);
            return (StatusCode::BAD_REQUEST, "Error parsing event".to_string());
        }
    };

    if event.action != "created" {
        info!("Ignoring issue_comment action: {}", event.action);
        return (StatusCode::OK, "Issue comment action ignored".to_string());
    }

    if event.comment.user.is_bot() {
        info!("Ignoring comment from bot: {}", event.comment.user.login);
        return (StatusCode::OK, "Bot comment ignored".to_string());
    }

    let Some(instruction) = extract_prompt(&event.comment.body, &state.trigger_keyword) else {
        info!(
            "Comment does not contain trigger keyword {:?}",
            state.trigger_keyword
        );
        return (StatusCode::OK, "No trigger keyword found".to_string());
    };

    let Some(installation) = &event.installation else {
        warn!("issue_comment payload carries no installation");
        return (StatusCode::OK, "Missing installation information".to_string());
    };

    if !verify_permission(
        state,
        installation.id,
        &event.repository.full_name,
        &event.comment.user.login,
    )
    .await
    {
        info!(
            "Permission denied: user {} lacks write access to {}",
            event.comment.user.login, event.repository.full_name
        );
        return (StatusCode::OK, "Permission denied".to_string());
    }

    if !state.issue_deduper.mark_if_new(event.comment.id) {
        info!("Ignoring duplicate issue comment: id={}", event.comment.id);
        return (StatusCode::OK, "Duplicate comment ignored".to_string());
    }

    let is_pr = event.issue.pull_request.is_some();
    let issue_body = event.issue.body.clone().unwrap_or_default();

    let prompt = build_prompt(&event.issue.title, &issue_body, &instruction);
    let prompt_summary = build_prompt_summary(&event.issue.title, &instruction, is_pr);

    let mut components = TaskIdComponents::now(&event.repository.full_name);
    let mut branch = event.repository.default_branch.clone();
    let mut pr_branch = None;
    let mut pr_state = None;

    if is_pr {
        // PR conversation comment: PR-only id plus a best-effort
        // linked-issue lookup
        components.pr_number = Some(event.issue.number);
        components.issue_number = lookup_linked_issue(
            state,
            installation.id,
            &event.repository.full_name,
            event.issue.number,
        )
        .await;

        // The issue_comment payload carries no PR refs; fetch them so an
        // open PR takes the append path. Degrades to a fresh branch off
        // the default branch when the lookup fails.
        let (owner, name) = split_repo(&event.repository.full_name);
        match state
            .github_client
            .get_pull_request(installation.id, &owner, &name, event.issue.number)
            .await
        {
            Ok(pr) => {
                if !pr.base.ref_name.is_empty() {
                    branch = pr.base.ref_name;
                }
                pr_branch = Some(pr.head.ref_name);
                pr_state = Some(pr.state);
            }
            Err(e) => {
                warn!(
                    "Failed to fetch PR #{} details: {:#} (treating as new-branch path)",
                    event.issue.number, e
                );
            }
        }
    } else {
        components.issue_number = Some(event.issue.number);
    }

    let task = Task {
        id: components.render(),
        repo: event.repository.full_name.clone(),
        number: event.issue.number,
        branch,
        prompt,
        prompt_summary,
        issue_title: event.issue.title.clone(),
        issue_body,
        is_pr,
        pr_branch,
        pr_state,
        username: event.comment.user.login.clone(),
        installation_id: installation.id,
        attempt: 1,
        prompt_context: prompt_context_for_issue(&event, &state.trigger_keyword, is_pr),
    };

    info!(
        "Received task: repo={}, number={}, commentID={}, user={}",
        task.repo, task.number, event.comment.id, task.username
    );

    enqueue_task(state, task).await
}

pub async fn handle_review_comment(state: &AppState, payload: &[u8]) -> (StatusCode, String) {
    let event: ReviewCommentEvent = match serde_json::from_slice(payload) {
        Ok(event) => event,
        Err(e) => {
            error!("Error parsing review comment event: {}", e);
            return (StatusCode::BAD_REQUEST, "Error parsing event".to_string());
        }
    };

    if event.action != "created" {
        info!("Ignoring pull_request_review_comment action: {}", event.action);
        return (StatusCode::OK, "Review comment action ignored".to_string());
    }

    if event.comment.user.is_bot() {
        info!("Ignoring review comment from bot: {}", event.comment.user.login);
        return (StatusCode::OK, "Bot comment ignored".to_string());
    }

    let Some(instruction) = extract_prompt(&event.comment.body, &state.trigger_keyword) else {
        info!(
            "Review comment does not contain trigger keyword {:?}",
            state.trigger_keyword
        );
        return (StatusCode::OK, "No trigger keyword found".to_string());
    };

    let Some(installation) = &event.installation else {
        warn!("pull_request_review_comment payload carries no installation");
        return (StatusCode::OK, "Missing installation information".to_string());
    };

    if !verify_permission(
        state,
        installation.id,
        &event.repository.full_name,
        &event.comment.user.login,
    )
    .await
    {
        info!(
            "Permission denied: user {} lacks write access to {}",
            event.comment.user.login, event.repository.full_name
        );
        return (StatusCode::OK, "Permission denied".to_string());
    }

    if !state.review_deduper.mark_if_new(event.comment.id) {
        info!("Ignoring duplicate review comment: id={}", event.comment.id);
        return (StatusCode::OK, "Duplicate comment ignored".to_string());
    }

    let pr_body = event.pull_request.body.clone().unwrap_or_default();
    let prompt = build_prompt(&event.pull_request.title, &pr_body, &instruction);
    let prompt_summary = build_prompt_summary(&event.pull_request.title, &instruction, true);

    let branch = if event.pull_request.base.ref_name.is_empty() {
        event.repository.default_branch.clone()
    } else {
        event.pull_request.base.ref_name.clone()
    };

    let mut components = TaskIdComponents::now(&event.repository.full_name);
    components.pr_number = Some(event.pull_request.number);
    components.issue_number = lookup_linked_issue(
        state,
        installation.id,
        &event.repository.full_name,
        event.pull_request.number,
    )
    .await;

    let task = Task {
        id: components.render(),
        repo: event.repository.full_name.clone(),
        number: event.pull_request.number,
        branch,
        prompt,
        prompt_summary,
        issue_title: event.pull_request.title.clone(),
        issue_body: pr_body,
        is_pr: true,
        pr_branch: Some(event.pull_request.head.ref_name.clone()),
        pr_state: Some(event.pull_request.state.clone()),
        username: event.comment.user.login.clone(),
        installation_id: installation.id,
        attempt: 1,
        prompt_context: prompt_context_for_review(&event, &state.trigger_keyword),
    };

    info!(
        "Received review task: repo={}, number={}, commentID={}, user={}",
        task.repo, task.number, event.comment.id, task.username
    );

    enqueue_task(state, task).await
}

/// Write-permission gate with two escape hatches: the env override, and
/// fail-open on API errors (availability over strictness).
async fn verify_permission(
    state: &AppState,
    installation_id: u64,
    repo: &str,
    username: &str,
) -> bool {
    if state.allow_all_users {
        info!(
            "Permission override enabled via env, allowing user {}",
            username
        );
        return true;
    }

    let (owner, name) = split_repo(repo);
    match state
        .github_client
        .check_user_permission(installation_id, &owner, &name, username)
        .await
    {
        Ok(true) => {
            info!(
                "Permission check passed: user={} has write permission to repo={}",
                username, repo
            );
            true
        }
        Ok(false) => false,
        Err(e) => {
            warn!(
                "Failed to check user permission for {}: {:#} (allowing request)",
                username, e
            );
            true
        }
    }
}

/// Best-effort linked-issue lookup with a hard 2-second deadline. Any
/// failure mode (timeout, API error, no linkage) leaves the id PR-only.
async fn lookup_linked_issue(
    state: &AppState,
    installation_id: u64,
    repo: &str,
    pr_number: u64,
) -> Option<u64> {
    let (owner, name) = split_repo(repo);

    let lookup = state
        .github_client
        .get_linked_issue(installation_id, &owner, &name, pr_number);

    match tokio::time::timeout(ENRICHMENT_DEADLINE, lookup).await {
        Ok(Ok(Some(issue))) => {
            info!(
                "Task ID enrichment: found linked issue #{} for PR #{}",
                issue, pr_number
            );
            Some(issue)
        }
        Ok(Ok(None)) => None,
        Ok(Err(e)) => {
            warn!(
                "Failed to fetch linked issue for PR #{}: {:#} (continuing with PR-only ID)",
                pr_number, e
            );
            None
        }
        Err(_) => {
            warn!(
                "Linked-issue lookup for PR #{} exceeded {:?} (continuing with PR-only ID)",
                pr_number, ENRICHMENT_DEADLINE
            );
            None
        }
    }
}

/// Reserve a queue slot, then record the task and post the initial
/// `Queued` comment, then commit the task to the slot. Reserving first
/// means a saturated queue rejects the delivery without mutating state,
/// and committing last means the worker can only see the task after its
/// store row and tracking comment exist.
async fn enqueue_task(state: &AppState, task: Task) -> (StatusCode, String) {
    let slot = match state.dispatcher.reserve() {
        Ok(slot) => slot,
        Err(e) => {
            error!("Failed to enqueue task {}: {}", task.id, e);
            return match e {
                EnqueueError::QueueFull => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Task queue is busy, try again later".to_string(),
                ),
                EnqueueError::QueueClosed => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Task queue unavailable".to_string(),
                ),
            };
        }
    };

    create_store_task(state, &task).await;

    let mut tracker = CommentTracker::new(state.github_client.clone(), &task);
    tracker.create().await;

    slot.send(task);
    (StatusCode::ACCEPTED, "Task queued".to_string())
}

async fn create_store_task(state: &AppState, task: &Task) {
    let (owner, name) = task.split_repo();
    let mut stored = StoredTask::new(
        &task.id,
        &task.issue_title,
        owner,
        name,
        task.number,
        &task.username,
    );
    stored.logs.push(LogEntry {
        timestamp: stored.created_at,
        level: LogLevel::Info,
        message: "Task queued".to_string(),
    });

    if let Err(e) = state.store.create(stored).await {
        error!("Failed to create task {} in store: {:#}", task.id, e);
    }
}

fn prompt_context_for_issue(
    event: &IssueCommentEvent,
    trigger: &str,
    is_pr: bool,
) -> HashMap<String, String> {
    let mut context = HashMap::from([
        ("issue_title".to_string(), event.issue.title.clone()),
        (
            "issue_body".to_string(),
            event.issue.body.clone().unwrap_or_default(),
        ),
        ("event_name".to_string(), "issue_comment".to_string()),
        ("event_type".to_string(), "GENERAL_COMMENT".to_string()),
        ("trigger_phrase".to_string(), trigger.to_string()),
        (
            "trigger_username".to_string(),
            event.comment.user.login.clone(),
        ),
        ("trigger_comment".to_string(), event.comment.body.clone()),
        (
            "repository".to_string(),
            event.repository.full_name.clone(),
        ),
        (
            "base_branch".to_string(),
            event.repository.default_branch.clone(),
        ),
        ("is_pr".to_string(), is_pr.to_string()),
        ("issue_number".to_string(), event.issue.number.to_string()),
    ]);

    if is_pr {
        context.insert("pr_number".to_string(), event.issue.number.to_string());
    }

    context
}

fn prompt_context_for_review(
    event: &ReviewCommentEvent,
    trigger: &str,
) -> HashMap<String, String> {
    let branch = if event.pull_request.base.ref_name.is_empty() {
        event.repository.default_branch.clone()
    } else {
        event.pull_request.base.ref_name.clone()
    };

    HashMap::from([
        ("issue_title".to_string(), event.pull_request.title.clone()),
        (
            "issue_body".to_string(),
            event.pull_request.body.clone().unwrap_or_default(),
        ),
        (
            "event_name".to_string(),
            "pull_request_review_comment".to_string(),
        ),
        ("event_type".to_string(), "REVIEW_COMMENT".to_string()),
        ("trigger_phrase".to_string(), trigger.to_string()),
        (
            "trigger_username".to_string(),
            event.comment.user.login.clone(),
        ),
        ("trigger_comment".to_string(), event.comment.body.clone()),
        (
            "repository".to_string(),
            event.repository.full_name.clone(),
        ),
        ("base_branch".to_string(), branch),
        ("is_pr".to_string(), "true".to_string()),
        (
            "pr_number".to_string(),
            event.pull_request.number.to_string(),
        ),
    ])
}

pub fn webhook_router(middleware_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/webhook", post(github_webhook_handler))
        .route_layer(middleware::from_fn_with_state(
            middleware_state,
            verify_webhook_signature,
        ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatcherConfig;
    use crate::dedupe::CommentDeduper;
    use crate::dispatcher::Dispatcher;
    use crate::executor::{ExecuteError, TaskRunner};
    use crate::taskstore::TaskStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    struct RecordingRunner {
        tasks: Mutex<Vec<Task>>,
    }

    #[async_trait]
    impl TaskRunner for RecordingRunner {
        async fn run(
            &self,
            task: &Task,
            _cancel: &CancellationToken,
        ) -> Result<(), ExecuteError> {
            self.tasks.lock().unwrap().push(task.clone());
            Ok(())
        }
    }

    struct ParkedRunner;

    #[async_trait]
    impl TaskRunner for ParkedRunner {
        async fn run(
            &self,
            _task: &Task,
            cancel: &CancellationToken,
        ) -> Result<(), ExecuteError> {
            cancel.cancelled().await;
            Err(ExecuteError::Cancelled)
        }
    }

    fn test_state(
        runner: Arc<dyn TaskRunner>,
        dispatcher_config: DispatcherConfig,
    ) -> Arc<AppState> {
        // Bogus credentials: every GitHub call fails fast at JWT signing,
        // which exercises the fail-open and tracker-swallow paths.
        let github = Arc::new(crate::GitHubClient::new(1, "not-a-pem".to_string()));
        let dispatcher = Arc::new(Dispatcher::start(
            dispatcher_config,
            runner,
            CancellationToken::new(),
        ));

        Arc::new(AppState {
            github_client: github,
            store: TaskStore::in_memory().unwrap(),
            dispatcher,
            webhook_secret: "test-secret".to_string(),
            trigger_keyword: "/code".to_string(),
            allow_all_users: true,
            issue_deduper: CommentDeduper::default(),
            review_deduper: CommentDeduper::default(),
        })
    }

    fn issue_comment_payload(comment_id: u64, body: &str) -> Vec<u8> {
        json!({
            "action": "created",
            "issue": {
                "number": 123,
                "title": "Fix the widget",
                "body": "It is broken"
            },
            "comment": {
                "id": comment_id,
                "body": body,
                "user": { "login": "alice", "type": "User" }
            },
            "repository": {
                "full_name": "owner/repo",
                "default_branch": "main"
            },
            "installation": { "id": 42 }
        })
        .to_string()
        .into_bytes()
    }

    fn review_comment_payload(comment_id: u64, body: &str, pr_state: &str) -> Vec<u8> {
        json!({
            "action": "created",
            "comment": {
                "id": comment_id,
                "body": body,
                "user": { "login": "alice", "type": "User" }
            },
            "pull_request": {
                "number": 456,
                "title": "Refactor auth",
                "body": "Closes #100",
                "state": pr_state,
                "head": { "ref": "feature/auth" },
                "base": { "ref": "main" }
            },
            "repository": {
                "full_name": "owner/repo",
                "default_branch": "main"
            },
            "installation": { "id": 42 }
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn test_signature_valid() {
        let secret = "test-secret";
        let payload = b"payload-bytes";

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload);
        let signature = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

        assert!(verify_github_signature(secret, payload, &signature));
    }

    #[test]
    fn test_signature_wrong_secret() {
        let payload = b"payload-bytes";
        let mut mac = HmacSha256::new_from_slice(b"other-secret").unwrap();
        mac.update(payload);
        let signature = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

        assert!(!verify_github_signature("test-secret", payload, &signature));
    }

    #[test]
    fn test_signature_malformed_header() {
        assert!(!verify_github_signature("s", b"p", "sha1=abcdef"));
        assert!(!verify_github_signature("s", b"p", "abcdef"));
        assert!(!verify_github_signature("s", b"p", "sha256=not-hex!"));
        assert!(!verify_github_signature("s", b"p", "sha256="));
    }

    #[test]
    fn test_signature_tampered_payload() {
        let secret = "test-secret";
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(b"original");
        let signature = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

        assert!(!verify_github_signature(secret, b"tampered", &signature));
    }

    #[tokio::test]
    async fn test_plain_issue_comment_creates_task() {
        let runner = Arc::new(RecordingRunner {
            tasks: Mutex::new(Vec::new()),
        });
        let state = test_state(runner.clone(), DispatcherConfig::default());

        let (status, message) =
            handle_issue_comment(&state, &issue_comment_payload(1, "/code fix typo")).await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(message, "Task queued");

        // Exactly one store row with the semantic id
        let tasks = state.store.list().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(tasks[0].id.starts_with("owner-repo-issue-123-"));
        assert_eq!(tasks[0].actor, "alice");
        assert_eq!(tasks[0].issue_number, 123);

        // Worker received the task
        tokio::time::sleep(Duration::from_millis(50)).await;
        let seen = runner.tasks.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].branch, "main");
        assert!(!seen[0].is_pr);
        assert!(seen[0].prompt.starts_with("fix typo"));
        assert_eq!(seen[0].prompt_context.get("event_name").unwrap(), "issue_comment");
    }

    #[tokio::test]
    async fn test_duplicate_comment_yields_one_task() {
        let runner = Arc::new(RecordingRunner {
            tasks: Mutex::new(Vec::new()),
        });
        let state = test_state(runner, DispatcherConfig::default());

        let (first, _) =
            handle_issue_comment(&state, &issue_comment_payload(77, "/code fix typo")).await;
        let (second, message) =
            handle_issue_comment(&state, &issue_comment_payload(77, "/code fix typo")).await;

        assert_eq!(first, StatusCode::ACCEPTED);
        assert_eq!(second, StatusCode::OK);
        assert_eq!(message, "Duplicate comment ignored");

        assert_eq!(state.store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_bot_comment_ignored() {
        let runner = Arc::new(RecordingRunner {
            tasks: Mutex::new(Vec::new()),
        });
        let state = test_state(runner, DispatcherConfig::default());

        let payload = json!({
            "action": "created",
            "issue": { "number": 1, "title": "t" },
            "comment": {
                "id": 5,
                "body": "/code loop forever",
                "user": { "login": "swe-bridge[bot]", "type": "Bot" }
            },
            "repository": { "full_name": "owner/repo", "default_branch": "main" },
            "installation": { "id": 42 }
        })
        .to_string()
        .into_bytes();

        let (status, message) = handle_issue_comment(&state, &payload).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(message, "Bot comment ignored");
        assert!(state.store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_trigger_ignored() {
        let runner = Arc::new(RecordingRunner {
            tasks: Mutex::new(Vec::new()),
        });
        let state = test_state(runner, DispatcherConfig::default());

        let (status, message) =
            handle_issue_comment(&state, &issue_comment_payload(2, "nice issue!")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(message, "No trigger keyword found");
        assert!(state.store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_created_action_ignored() {
        let runner = Arc::new(RecordingRunner {
            tasks: Mutex::new(Vec::new()),
        });
        let state = test_state(runner, DispatcherConfig::default());

        let payload = json!({
            "action": "edited",
            "issue": { "number": 1, "title": "t" },
            "comment": {
                "id": 5,
                "body": "/code retry",
                "user": { "login": "alice" }
            },
            "repository": { "full_name": "owner/repo", "default_branch": "main" },
            "installation": { "id": 42 }
        })
        .to_string()
        .into_bytes();

        let (status, message) = handle_issue_comment(&state, &payload).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(message, "Issue comment action ignored");
    }

    #[tokio::test]
    async fn test_malformed_payload_is_bad_request() {
        let runner = Arc::new(RecordingRunner {
            tasks: Mutex::new(Vec::new()),
        });
        let state = test_state(runner, DispatcherConfig::default());

        let (status, _) = handle_issue_comment(&state, b"not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_review_comment_builds_pr_task() {
        let runner = Arc::new(RecordingRunner {
            tasks: Mutex::new(Vec::new()),
        });
        let state = test_state(runner.clone(), DispatcherConfig::default());

        let (status, _) = handle_review_comment(
            &state,
            &review_comment_payload(9, "/code refactor", "open"),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let seen = runner.tasks.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let task = &seen[0];

        // Enrichment fails fast here (bogus credentials), so the id stays
        // PR-only with no issue segment
        assert!(task.id.starts_with("owner-repo-pr-456-"));
        assert!(!task.id.contains("issue-"));
        assert!(task.is_pr);
        assert_eq!(task.pr_branch.as_deref(), Some("feature/auth"));
        assert_eq!(task.pr_state.as_deref(), Some("open"));
        assert_eq!(task.branch, "main");
        assert_eq!(
            task.prompt_context.get("event_type").unwrap(),
            "REVIEW_COMMENT"
        );
    }

    #[tokio::test]
    async fn test_issue_comment_on_pr_gets_pr_segment() {
        let runner = Arc::new(RecordingRunner {
            tasks: Mutex::new(Vec::new()),
        });
        let state = test_state(runner.clone(), DispatcherConfig::default());

        let payload = json!({
            "action": "created",
            "issue": {
                "number": 456,
                "title": "Refactor auth",
                "body": "",
                "pull_request": { "url": "https://api.github.com/repos/owner/repo/pulls/456" }
            },
            "comment": {
                "id": 33,
                "body": "/code refactor",
                "user": { "login": "alice", "type": "User" }
            },
            "repository": { "full_name": "owner/repo", "default_branch": "main" },
            "installation": { "id": 42 }
        })
        .to_string()
        .into_bytes();

        let (status, _) = handle_issue_comment(&state, &payload).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let seen = runner.tasks.lock().unwrap();
        assert_eq!(seen.len(), 1);
        // PR detail fetch and enrichment both fail fast here, so the task
        // keeps the PR-only id and falls back to the new-branch path
        assert!(seen[0].id.starts_with("owner-repo-pr-456-"));
        assert!(seen[0].is_pr);
        assert!(seen[0].pr_branch.is_none());
        assert_eq!(seen[0].branch, "main");
    }

    #[tokio::test]
    async fn test_queue_full_returns_503_and_keeps_store_rows() {
        let config = DispatcherConfig {
            workers: 1,
            queue_size: 1,
            ..DispatcherConfig::default()
        };
        let state = test_state(Arc::new(ParkedRunner), config);

        // First fills the worker, second fills the queue slot
        let (s1, _) =
            handle_issue_comment(&state, &issue_comment_payload(101, "/code one")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (s2, _) =
            handle_issue_comment(&state, &issue_comment_payload(102, "/code two")).await;
        let (s3, body) =
            handle_issue_comment(&state, &issue_comment_payload(103, "/code three")).await;

        assert_eq!(s1, StatusCode::ACCEPTED);
        assert_eq!(s2, StatusCode::ACCEPTED);
        assert_eq!(s3, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "Task queue is busy, try again later");

        // The rejected delivery mutated nothing: only accepted tasks
        // have store rows
        assert_eq!(state.store.list().await.unwrap().len(), 2);

        state.dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_permission_api_failure_is_fail_open() {
        let runner = Arc::new(RecordingRunner {
            tasks: Mutex::new(Vec::new()),
        });
        let mut config = DispatcherConfig::default();
        config.workers = 1;
        let state = test_state(runner, config);

        // No env override: the permission check runs and fails fast on the
        // bogus credentials, and the request is allowed through anyway
        let state = Arc::new(AppState {
            github_client: state.github_client.clone(),
            store: TaskStore::in_memory().unwrap(),
            dispatcher: state.dispatcher.clone(),
            webhook_secret: state.webhook_secret.clone(),
            trigger_keyword: state.trigger_keyword.clone(),
            allow_all_users: false,
            issue_deduper: CommentDeduper::default(),
            review_deduper: CommentDeduper::default(),
        });

        let (status, message) =
            handle_issue_comment(&state, &issue_comment_payload(201, "/code fix")).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(message, "Task queued");
    }
}
