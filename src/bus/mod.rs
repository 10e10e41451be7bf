//! Message Bus: the addressed, time-to-live mailbox shared by all agents.
//!
//! All coordination happens by posting and reading messages; there are no
//! component-to-component calls. Messages are "posted", not sent
//! synchronously: the log grows within a round and is trimmed only by
//! expiry, never by consumption, so multiple readers can observe the same
//! broadcast (`request_assist` / `sync_start` are one-to-many).

pub mod message;

pub use message::{Message, MessageKind, MessageStatus, Recipient};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bus traffic counters (snapshot, serializable for reports).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BusStats {
    pub posted_total: u64,
    pub expired_total: u64,
}

/// Shared ordered message log.
#[derive(Debug, Default)]
pub struct MessageBus {
    log: Vec<Message>,
    stats: BusStats,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message to the shared log.
    pub fn post(&mut self, message: Message) {
        self.stats.posted_total += 1;
        self.log.push(message);
    }

    /// All currently non-expired messages addressed to `agent` (broadcasts
    /// included), in arrival order. Non-consuming.
    pub fn inbox(&self, agent: &str, now: DateTime<Utc>) -> Vec<&Message> {
        self.log
            .iter()
            .filter(|m| !m.is_expired(now) && m.addressed_to(agent))
            .collect()
    }

    /// Non-expired messages of one kind, in arrival order. Non-consuming;
    /// used by coordinators that must observe a full-round snapshot.
    pub fn of_kind(&self, kind: MessageKind, now: DateTime<Utc>) -> Vec<&Message> {
        self.log
            .iter()
            .filter(|m| !m.is_expired(now) && m.kind == kind)
            .collect()
    }

    /// Remove and return every message of one kind (round completion
    /// garbage collection for claims/responses).
    pub fn drain_kind(&mut self, kind: MessageKind) -> Vec<Message> {
        let mut drained = Vec::new();
        let mut kept = Vec::with_capacity(self.log.len());
        for msg in self.log.drain(..) {
            if msg.kind == kind {
                drained.push(msg);
            } else {
                kept.push(msg);
            }
        }
        self.log = kept;
        drained
    }

    /// Purge expired entries. Stale messages are dropped silently, never
    /// delivered, never an error.
    pub fn purge_expired(&mut self, now: DateTime<Utc>) {
        let before = self.log.len();
        self.log.retain(|m| !m.is_expired(now));
        self.stats.expired_total += (before - self.log.len()) as u64;
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    pub fn stats(&self) -> BusStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EntityId;
    use chrono::Duration;

    fn claim(sender: &str, task: u32, now: DateTime<Utc>, ttl_ms: i64) -> Message {
        Message::new(
            sender,
            Recipient::Broadcast,
            MessageKind::Claim,
            EntityId(task),
            1,
            now,
            ttl_ms,
        )
    }

    #[test]
    fn inbox_is_non_consuming_for_broadcasts() {
        let now = Utc::now();
        let mut bus = MessageBus::new();
        bus.post(claim("agent1", 7, now, 5_000));

        assert_eq!(bus.inbox("agent2", now).len(), 1);
        // A second reader still sees the same broadcast.
        assert_eq!(bus.inbox("agent3", now).len(), 1);
        assert_eq!(bus.len(), 1);
    }

    #[test]
    fn expired_messages_are_never_delivered() {
        let now = Utc::now();
        let mut bus = MessageBus::new();
        bus.post(claim("agent1", 7, now - Duration::milliseconds(10_000), 5_000));
        bus.post(claim("agent2", 8, now, 5_000));

        assert_eq!(bus.inbox("agent3", now).len(), 1);
        bus.purge_expired(now);
        assert_eq!(bus.len(), 1);
        assert_eq!(bus.stats().expired_total, 1);
    }

    #[test]
    fn drain_kind_leaves_other_traffic() {
        let now = Utc::now();
        let mut bus = MessageBus::new();
        bus.post(claim("agent1", 7, now, 5_000));
        bus.post(Message::new(
            "agent2",
            Recipient::Broadcast,
            MessageKind::RequestAssist,
            EntityId(7),
            0,
            now,
            5_000,
        ));

        let claims = bus.drain_kind(MessageKind::Claim);
        assert_eq!(claims.len(), 1);
        assert_eq!(bus.len(), 1);
        assert_eq!(bus.of_kind(MessageKind::RequestAssist, now).len(), 1);
    }
}
