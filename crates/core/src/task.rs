//! Task lifecycle types.
//!
//! A task is created per invocation and owned by the caller; only the agent
//! loop mutates it. Once a task reaches a terminal status every transition
//! method is a no-op.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::provider::Usage;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

/// One unit of work for the agent loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    pub max_iterations: u32,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub current_iteration: u32,
    pub result: Option<String>,
    pub error: Option<String>,
    /// Token usage summed over every LLM turn of this task
    pub usage: Usage,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            description: description.into(),
            status: TaskStatus::Pending,
            max_iterations: 20,
            timeout: Duration::from_secs(300),
            current_iteration: 0,
            result: None,
            error: None,
            usage: Usage::default(),
            created_at: Utc::now(),
        }
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn start(&mut self) {
        if !self.status.is_terminal() {
            self.status = TaskStatus::Running;
        }
    }

    pub fn complete(&mut self, result: impl Into<String>) {
        if !self.status.is_terminal() {
            self.status = TaskStatus::Completed;
            self.result = Some(result.into());
        }
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        if !self.status.is_terminal() {
            self.status = TaskStatus::Failed;
            self.error = Some(error.into());
        }
    }

    pub fn cancel(&mut self) {
        if !self.status.is_terminal() {
            self.status = TaskStatus::Cancelled;
        }
    }

    pub fn record_usage(&mut self, usage: Usage) {
        self.usage = self.usage.add(usage);
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_defaults() {
        let task = Task::new("what tools are available");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.max_iterations, 20);
        assert_eq!(task.timeout, Duration::from_secs(300));
        assert_eq!(task.current_iteration, 0);
        assert!(!task.id.is_empty());
    }

    #[test]
    fn terminal_status_is_immutable() {
        let mut task = Task::new("t");
        task.start();
        task.complete("done");
        task.fail("late failure");
        task.cancel();
        task.start();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.as_deref(), Some("done"));
        assert!(task.error.is_none());
    }

    #[test]
    fn failure_records_error() {
        let mut task = Task::new("t");
        task.start();
        task.fail("provider down");
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("provider down"));
    }

    #[test]
    fn usage_accumulates() {
        let mut task = Task::new("t");
        let turn = Usage {
            prompt_tokens: 3,
            completion_tokens: 2,
            total_tokens: 5,
        };
        task.record_usage(turn);
        task.record_usage(turn);
        assert_eq!(task.usage.total_tokens, 10);
    }

    #[test]
    fn task_roundtrips_through_json() {
        let task = Task::new("t").with_timeout(Duration::from_millis(1500));
        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back.timeout, Duration::from_millis(1500));
        assert_eq!(back.id, task.id);
    }
}
