use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, HspError};
use crate::ids::MessageId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgement {
    pub target_message_id: MessageId,
    pub acknowledged_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegativeAcknowledgement {
    pub target_message_id: MessageId,
    pub error_code: String,
    pub error_message: String,
    pub acknowledged_at: DateTime<Utc>,
}

impl NegativeAcknowledgement {
    pub fn from_error(target: MessageId, error: &HspError, at: DateTime<Utc>) -> Self {
        Self::with_code(target, error.code(), error.to_string(), at)
    }

    pub fn with_code(
        target: MessageId,
        code: ErrorCode,
        message: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            target_message_id: target,
            error_code: code.as_str().to_owned(),
            error_message: message.into(),
            acknowledged_at: at,
        }
    }

    pub fn into_error(self) -> HspError {
        HspError::Nacked {
            code: self.error_code,
            message: self.error_message,
        }
    }
}
