use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod wire;

/// Fallback message applied when a completion event carries none.
pub const DEFAULT_COMPLETION_MESSAGE: &str = "processing complete";
/// Fixed message for cancelled tasks; the event's own message is ignored.
pub const CANCELLED_MESSAGE: &str = "task cancelled";
/// Message given to freshly seeded tasks.
pub const WAITING_MESSAGE: &str = "waiting to process";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Waiting,
    Processing,
    Completed,
    Error,
    Cancelled,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Waiting
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal states expect no further transitions for the task.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Error | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "waiting" | "pending" => Ok(TaskStatus::Waiting),
            "processing" | "active" => Ok(TaskStatus::Processing),
            "completed" | "done" | "success" => Ok(TaskStatus::Completed),
            "error" | "failed" => Ok(TaskStatus::Error),
            "cancelled" | "canceled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("Unknown status: {other}")),
        }
    }
}

/// One `{taskId, fileName}` pair returned by a successful submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskSeed {
    #[serde(rename = "taskId")]
    pub task_id: String,
    #[serde(rename = "fileName")]
    pub file_name: String,
}

/// Live, mutable state for one in-flight or finished processing job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub task_id: String,
    pub file_name: String,
    pub progress: u8,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TaskRecord {
    pub fn seeded(seed: &TaskSeed) -> Self {
        Self {
            task_id: seed.task_id.clone(),
            file_name: seed.file_name.clone(),
            progress: 0,
            status: TaskStatus::Waiting,
            message: Some(WAITING_MESSAGE.to_string()),
        }
    }
}

/// Immutable history entry captured once per task reaching a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    pub task_id: String,
    pub file_name: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub captured_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            TaskStatus::Waiting,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Error,
            TaskStatus::Cancelled,
        ] {
            let parsed: TaskStatus = status.as_str().parse().expect("parse");
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn status_accepts_aliases() {
        assert_eq!("canceled".parse::<TaskStatus>(), Ok(TaskStatus::Cancelled));
        assert_eq!("failed".parse::<TaskStatus>(), Ok(TaskStatus::Error));
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(!TaskStatus::Waiting.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Error.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn seeded_record_starts_waiting() {
        let seed = TaskSeed {
            task_id: "t1".to_string(),
            file_name: "a.xlsx".to_string(),
        };
        let record = TaskRecord::seeded(&seed);
        assert_eq!(record.status, TaskStatus::Waiting);
        assert_eq!(record.progress, 0);
        assert_eq!(record.message.as_deref(), Some(WAITING_MESSAGE));
    }

    #[test]
    fn task_seed_uses_camel_case_wire_names() {
        let seed: TaskSeed =
            serde_json::from_str(r#"{"taskId":"t1","fileName":"a.xlsx"}"#).expect("parse seed");
        assert_eq!(seed.task_id, "t1");
        assert_eq!(seed.file_name, "a.xlsx");
    }
}
