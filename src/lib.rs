pub mod command;
pub mod config;
pub mod dashboard;
pub mod dedupe;
pub mod dispatcher;
pub mod executor;
pub mod git;
pub mod github;
pub mod provider;
pub mod task;
pub mod taskstore;
pub mod tracker;
pub mod webhook;

use std::sync::Arc;

pub use dispatcher::Dispatcher;
pub use github::GitHubClient;
pub use task::Task;
pub use taskstore::TaskStore;

use dedupe::CommentDeduper;

/// Shared state for the HTTP layer.
///
/// The dedupers and dispatcher are process-wide singletons created at
/// startup; they live here rather than as free globals.
pub struct AppState {
    pub github_client: Arc<GitHubClient>,
    pub store: TaskStore,
    pub dispatcher: Arc<Dispatcher>,
    pub webhook_secret: String,
    pub trigger_keyword: String,
    pub allow_all_users: bool,
    pub issue_deduper: CommentDeduper,
    pub review_deduper: CommentDeduper,
}
