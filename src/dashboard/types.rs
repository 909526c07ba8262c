//! JSON response shapes for the dashboard API.

use serde::Serialize;

use crate::taskstore::{LogLevel, StoredTask, TaskStatus};

/// Response for the task list endpoint.
#[derive(Debug, Serialize)]
pub struct TasksResponse {
    pub tasks: Vec<TaskSummary>,
}

/// Summary row for the list view; logs are omitted (fetch the detail
/// endpoint for them).
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    pub repo_owner: String,
    pub repo_name: String,
    pub issue_number: u64,
    pub actor: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Full task detail including its log timeline.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDetail {
    #[serde(flatten)]
    pub summary: TaskSummary,
    pub logs: Vec<TaskLog>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskLog {
    pub timestamp: String,
    pub level: LogLevel,
    pub message: String,
}

impl From<&StoredTask> for TaskSummary {
    fn from(task: &StoredTask) -> Self {
        Self {
            id: task.id.clone(),
            title: task.title.clone(),
            status: task.status,
            repo_owner: task.repo_owner.clone(),
            repo_name: task.repo_name.clone(),
            issue_number: task.issue_number,
            actor: task.actor.clone(),
            created_at: task.created_at.to_rfc3339(),
            updated_at: task.updated_at.to_rfc3339(),
        }
    }
}

impl From<&StoredTask> for TaskDetail {
    fn from(task: &StoredTask) -> Self {
        Self {
            summary: TaskSummary::from(task),
            logs: task
                .logs
                .iter()
                .map(|entry| TaskLog {
                    timestamp: entry.timestamp.to_rfc3339(),
                    level: entry.level,
                    message: entry.message.clone(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taskstore::LogEntry;
    use chrono::Utc;

    #[test]
    fn test_summary_serialization_is_camel_case() {
        let task = StoredTask::new("t-1", "Title", "owner", "repo", 9, "alice");
        let json = serde_json::to_value(TaskSummary::from(&task)).unwrap();

        assert_eq!(json["id"], "t-1");
        assert_eq!(json["repoOwner"], "owner");
        assert_eq!(json["issueNumber"], 9);
        assert_eq!(json["status"], "pending");
        assert!(json.get("logs").is_none());
    }

    #[test]
    fn test_detail_includes_logs() {
        let mut task = StoredTask::new("t-2", "Title", "owner", "repo", 9, "alice");
        task.logs.push(LogEntry {
            timestamp: Utc::now(),
            level: LogLevel::Success,
            message: "done".to_string(),
        });

        let json = serde_json::to_value(TaskDetail::from(&task)).unwrap();
        assert_eq!(json["logs"][0]["level"], "success");
        assert_eq!(json["logs"][0]["message"], "done");
        // Flattened summary fields sit at the top level
        assert_eq!(json["id"], "t-2");
    }
}
