use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::Priority;
use crate::ids::{AgentId, RequestId, ResultId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub request_id: RequestId,
    pub requester_id: AgentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_filter: Option<String>,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

impl TaskRequest {
    pub fn new(
        request_id: impl Into<RequestId>,
        requester_id: impl Into<AgentId>,
        parameters: Value,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            requester_id: requester_id.into(),
            target_id: None,
            capability_filter: None,
            parameters,
            priority: None,
            deadline: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Success,
    Failure,
    InProgress,
    Queued,
    Rejected,
}

impl TaskStatus {
    /// Terminal statuses close the request; at most one per `request_id`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Rejected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub result_id: ResultId,
    pub request_id: RequestId,
    pub executor_id: AgentId,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

impl TaskResult {
    pub fn success(
        request_id: impl Into<RequestId>,
        executor_id: impl Into<AgentId>,
        payload: Value,
    ) -> Self {
        Self {
            result_id: ResultId::new_uuid(),
            request_id: request_id.into(),
            executor_id: executor_id.into(),
            status: TaskStatus::Success,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn failure(
        request_id: impl Into<RequestId>,
        executor_id: impl Into<AgentId>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            result_id: ResultId::new_uuid(),
            request_id: request_id.into(),
            executor_id: executor_id.into(),
            status: TaskStatus::Failure,
            payload: None,
            error: Some(TaskError {
                code: code.into(),
                message: message.into(),
            }),
        }
    }

    pub fn progress(
        request_id: impl Into<RequestId>,
        executor_id: impl Into<AgentId>,
        status: TaskStatus,
    ) -> Self {
        Self {
            result_id: ResultId::new_uuid(),
            request_id: request_id.into(),
            executor_id: executor_id.into(),
            status,
            payload: None,
            error: None,
        }
    }
}
