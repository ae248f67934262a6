//! Standard response envelope
use crate::error::{ErrorKind, kind_of, status_code_of};
use crate::model::TimeStamp;
use crate::utils::{CORRELATION_HRP, new_uuid_to_bech32};
use serde::Serialize;
use serde_json::Value;
use uuid7::uuid7;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub status_code: u16,
    pub status: StatusBlock,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusBlock {
    pub code: String,
    pub message: String,
    /// Correlation id of this response.
    pub identifier: String,
    pub date: String,
}

impl StatusBlock {
    fn of(kind: ErrorKind) -> Self {
        Self {
            code: kind.code().to_string(),
            message: kind.message().to_string(),
            identifier: correlation_id(),
            date: TimeStamp::new().to_datetime_utc().to_rfc3339(),
        }
    }
}

fn correlation_id() -> String {
    new_uuid_to_bech32(CORRELATION_HRP).unwrap_or_else(|_| uuid7().to_string())
}

/// Turns operation results into envelopes.
pub trait ResponseBuilder: Send + Sync {
    fn success(&self, body: Value) -> Envelope;
    fn failure(&self, err: &anyhow::Error) -> Envelope;
}

/// Catalog-driven envelopes; internal errors never expose their detail.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardResponses;

impl ResponseBuilder for StandardResponses {
    fn success(&self, body: Value) -> Envelope {
        let kind = ErrorKind::Success;
        Envelope {
            status_code: kind.status_code(),
            status: StatusBlock::of(kind),
            body: Some(body),
        }
    }

    fn failure(&self, err: &anyhow::Error) -> Envelope {
        let kind = kind_of(err);
        let body = match kind {
            ErrorKind::InternalError => None,
            _ => Some(Value::String(err.to_string())),
        };
        Envelope {
            status_code: status_code_of(err),
            status: StatusBlock::of(kind),
            body,
        }
    }
}
