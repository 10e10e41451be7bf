//! Protocol messages: immutable once created, expired by TTL.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::TaskId;

/// Message kinds exchanged over the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Declared intent to execute a task this round.
    Claim,
    /// Coordinator verdict on a claim.
    Response,
    /// Broadcast plea for helpers on a task.
    RequestAssist,
    /// Helper acknowledgment against an assist request.
    AckAssist,
    /// One-time quorum release for a cooperative task.
    SyncStart,
}

/// Addressing: a single agent or every reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    Agent(String),
    Broadcast,
}

/// Claim/response verdict carried on `Response` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Accepted,
    Rejected,
}

/// A protocol message. Immutable once posted; expires when
/// `now - created_at > ttl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub sender: String,
    pub recipient: Recipient,
    pub kind: MessageKind,
    pub task: TaskId,
    /// Sender priority at post time (claim escalation, assist urgency).
    pub priority: i64,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub ttl_ms: i64,
}

impl Message {
    pub fn new(
        sender: impl Into<String>,
        recipient: Recipient,
        kind: MessageKind,
        task: TaskId,
        priority: i64,
        created_at: DateTime<Utc>,
        ttl_ms: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: sender.into(),
            recipient,
            kind,
            task,
            priority,
            status: MessageStatus::Pending,
            created_at,
            ttl_ms,
        }
    }

    /// Response messages carry the verdict in `status`.
    pub fn with_status(mut self, status: MessageStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.created_at) > Duration::milliseconds(self.ttl_ms)
    }

    /// Whether this message lands in `agent`'s inbox.
    pub fn addressed_to(&self, agent: &str) -> bool {
        match &self.recipient {
            Recipient::Broadcast => true,
            Recipient::Agent(name) => name == agent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EntityId;

    #[test]
    fn expiry_is_strictly_after_ttl() {
        let now = Utc::now();
        let msg = Message::new(
            "agent1",
            Recipient::Broadcast,
            MessageKind::Claim,
            EntityId(4),
            0,
            now,
            1_000,
        );
        assert!(!msg.is_expired(now));
        assert!(!msg.is_expired(now + Duration::milliseconds(1_000)));
        assert!(msg.is_expired(now + Duration::milliseconds(1_001)));
    }

    #[test]
    fn broadcast_reaches_everyone() {
        let msg = Message::new(
            "agent1",
            Recipient::Broadcast,
            MessageKind::RequestAssist,
            EntityId(4),
            0,
            Utc::now(),
            1_000,
        );
        assert!(msg.addressed_to("agent2"));
        assert!(msg.addressed_to("agent3"));

        let direct = Message::new(
            "agent1",
            Recipient::Agent("agent2".into()),
            MessageKind::Response,
            EntityId(4),
            0,
            Utc::now(),
            1_000,
        );
        assert!(direct.addressed_to("agent2"));
        assert!(!direct.addressed_to("agent3"));
    }
}
