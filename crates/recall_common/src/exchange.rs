//! Pending exchange data model.
//!
//! One JSON file per exchange under `pending/`. Written atomically by the
//! backup writer when a live archive call fails; consumed and deleted by the
//! recovery daemon once the remote service has durably stored it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A conversation exchange waiting to be re-archived.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingExchange {
    /// Unique id of the exchange, assigned at capture time.
    pub exchange_id: String,
    /// Conversation this exchange belongs to.
    pub conversation_id: String,
    /// User side of the exchange.
    pub user: String,
    /// Assistant side of the exchange.
    pub assistant: String,
    /// Capture timestamp (ISO-8601).
    pub timestamp: DateTime<Utc>,
    /// Free-form metadata attached by the capturing layer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Model/runtime context captured alongside the exchange.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_context: Option<Value>,
}

impl PendingExchange {
    /// Create a new exchange with a fresh id and the current timestamp.
    pub fn new(
        conversation_id: impl Into<String>,
        user: impl Into<String>,
        assistant: impl Into<String>,
    ) -> Self {
        Self {
            exchange_id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            user: user.into(),
            assistant: assistant.into(),
            timestamp: Utc::now(),
            metadata: None,
            ai_context: None,
        }
    }

    /// Body sent to `POST /archive` on the remote memory service.
    ///
    /// The remote schema nests the two message halves under `content` and
    /// carries the recovery marker so replays are distinguishable from live
    /// writes on the service side.
    pub fn archive_body(&self) -> Value {
        serde_json::json!({
            "exchange_id": self.exchange_id,
            "conversation_id": self.conversation_id,
            "content": {
                "user": self.user,
                "assistant": self.assistant,
            },
            "timestamp": self.timestamp.to_rfc3339(),
            "metadata": self.metadata,
            "ai_context": self.ai_context,
            "recovered": true,
        })
    }

    /// Approximate payload size in bytes, as it would go over the wire.
    pub fn payload_size(&self) -> usize {
        serde_json::to_string(&self.archive_body())
            .map(|s| s.len())
            .unwrap_or(0)
    }
}
