//! Core domain types: entities, task kinds, and the shared task pool.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Handle for a body in the world (agents and tasks both have one).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct EntityId(pub u32);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Tasks are opaque entity handles with a position queried from the world.
pub type TaskId = EntityId;

/// Task kind, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Solo,
    Urgent,
    /// Requires at least two co-present agents before execution may start.
    Cooperative,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Solo => write!(f, "solo"),
            TaskKind::Urgent => write!(f, "urgent"),
            TaskKind::Cooperative => write!(f, "cooperative"),
        }
    }
}

/// Shared task pool plus the per-scenario lock registry.
///
/// The `assigned` map is the post-resolution exclusivity lock: once a round
/// grants a task it never re-enters the pool for the same scenario, and the
/// winner's name is recorded so a returning owner (e.g. after an assist
/// episode) can re-validate its claim. Owned by whoever runs the allocation
/// session, never ambient global state.
#[derive(Debug, Clone, Default)]
pub struct TaskBook {
    kinds: BTreeMap<TaskId, TaskKind>,
    names: BTreeMap<TaskId, String>,
    available: Vec<TaskId>,
    assigned: BTreeMap<TaskId, String>,
}

impl TaskBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task and place it in the available pool.
    pub fn insert(&mut self, id: TaskId, name: impl Into<String>, kind: TaskKind) {
        self.kinds.insert(id, kind);
        self.names.insert(id, name.into());
        if !self.available.contains(&id) {
            self.available.push(id);
        }
    }

    pub fn kind(&self, id: TaskId) -> Option<TaskKind> {
        self.kinds.get(&id).copied()
    }

    /// Human-readable task name for logs.
    pub fn name(&self, id: TaskId) -> &str {
        self.names.get(&id).map(String::as_str).unwrap_or("unknown")
    }

    pub fn is_available(&self, id: TaskId) -> bool {
        self.available.contains(&id)
    }

    pub fn is_assigned(&self, id: TaskId) -> bool {
        self.assigned.contains_key(&id)
    }

    /// Current lock holder, if any.
    pub fn owner(&self, id: TaskId) -> Option<&str> {
        self.assigned.get(&id).map(String::as_str)
    }

    /// Lock a task to its winner: removed from the pool, never re-granted to
    /// anyone else. Returns true when the lock is fresh or already held by
    /// the same owner, false when another agent holds it.
    pub fn lock(&mut self, id: TaskId, owner: &str) -> bool {
        match self.assigned.get(&id) {
            Some(existing) => existing == owner,
            None => {
                self.assigned.insert(id, owner.to_string());
                self.available.retain(|t| *t != id);
                true
            }
        }
    }

    pub fn available(&self) -> &[TaskId] {
        &self.available
    }

    /// Available tasks minus an exclusion list (just-lost task, locked tasks).
    pub fn available_excluding(&self, excludes: &[TaskId]) -> Vec<TaskId> {
        self.available
            .iter()
            .copied()
            .filter(|t| !excludes.contains(t))
            .collect()
    }

    /// All registered tasks, pool membership aside.
    pub fn all(&self) -> Vec<TaskId> {
        self.kinds.keys().copied().collect()
    }

    pub fn assigned(&self) -> &BTreeMap<TaskId, String> {
        &self.assigned
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_removes_from_pool_and_is_idempotent() {
        let mut book = TaskBook::new();
        book.insert(EntityId(10), "cube_0", TaskKind::Solo);
        book.insert(EntityId(11), "cube_1", TaskKind::Cooperative);

        assert!(book.is_available(EntityId(10)));
        assert!(book.lock(EntityId(10), "agent1"));
        assert!(!book.is_available(EntityId(10)));
        assert!(book.is_assigned(EntityId(10)));
        assert_eq!(book.owner(EntityId(10)), Some("agent1"));
        // Re-lock by the same owner re-validates; anyone else is refused.
        assert!(book.lock(EntityId(10), "agent1"));
        assert!(!book.lock(EntityId(10), "agent2"));
        assert_eq!(book.available(), &[EntityId(11)]);
    }

    #[test]
    fn available_excluding_filters_both_lists() {
        let mut book = TaskBook::new();
        for i in 0..3 {
            book.insert(EntityId(i), format!("cube_{i}"), TaskKind::Solo);
        }
        book.lock(EntityId(0), "agent1");
        let remaining = book.available_excluding(&[EntityId(1)]);
        assert_eq!(remaining, vec![EntityId(2)]);
    }
}
