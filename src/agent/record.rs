//! Per-agent mutable record and its tick state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use tracing::{debug, info, warn};

use crate::bus::{MessageBus, MessageKind};
use crate::config::MotionConfig;
use crate::domain::{EntityId, TaskBook, TaskId, TaskKind};
use crate::error::Result;
use crate::policy::{DecisionPolicy, Observation};
use crate::world::{clamp_step, planar_distance, WorldState};

/// What an agent is engaged with. A single tagged variant instead of
/// coupled task/assist/backup fields, so "assisting without an assist task"
/// cannot be represented.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Engagement {
    #[default]
    Idle,
    /// Executing an owned (claimed) task.
    Own { task: TaskId },
    /// Helping with a shared task; `backup` is the owned task to resume
    /// once the assist episode ends.
    Assisting {
        task: TaskId,
        backup: Option<TaskId>,
    },
}

impl Engagement {
    /// The task the agent acts on this tick: owned task, else assist task.
    pub fn effective_task(&self) -> Option<TaskId> {
        match self {
            Engagement::Idle => None,
            Engagement::Own { task } => Some(*task),
            Engagement::Assisting { task, .. } => Some(*task),
        }
    }

    /// The owned task, if any (None while assisting without backup).
    pub fn owned_task(&self) -> Option<TaskId> {
        match self {
            Engagement::Own { task } => Some(*task),
            _ => None,
        }
    }

    pub fn is_assisting(&self) -> bool {
        matches!(self, Engagement::Assisting { .. })
    }
}

/// Result of one agent tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No effective task; nothing to do.
    Idle,
    /// Within reach threshold of an owned task; holding at goal.
    Reached,
    /// Assist episode ended; backup task resumed (or idle).
    AssistComplete,
    /// Cooperative task, quorum not yet released; holding.
    WaitingForSync,
    /// Displacement applied.
    Moved,
    /// Policy failed or produced a null step; position held this tick.
    Held,
}

/// Shared read-only inputs for one agent tick.
pub struct TickContext<'a> {
    pub book: &'a TaskBook,
    /// Tasks with an active assistance record; treated as cooperative.
    pub assisted: &'a HashSet<TaskId>,
    pub motion: &'a MotionConfig,
    pub now: DateTime<Utc>,
}

/// Per-agent mutable state: engagement, priority, sync flags, and the
/// bounded position history used for stuck detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub name: String,
    pub body: EntityId,
    pub engagement: Engagement,
    /// Escalates on each failed claim; never decreases within a session.
    pub priority: i64,
    pub claim_attempts: u32,
    /// Finalized claim success for the current allocation session.
    pub success: bool,
    pub reached_goal: bool,
    pub ready_to_start: bool,
    pub started: bool,
    pub waiting_for_sync: bool,
    history: VecDeque<[f64; 2]>,
    window: usize,
}

impl AgentRecord {
    pub fn new(name: impl Into<String>, body: EntityId, window: usize) -> Self {
        Self {
            name: name.into(),
            body,
            engagement: Engagement::Idle,
            priority: 0,
            claim_attempts: 0,
            success: false,
            reached_goal: false,
            ready_to_start: false,
            started: false,
            waiting_for_sync: false,
            history: VecDeque::with_capacity(window),
            window,
        }
    }

    pub fn effective_task(&self) -> Option<TaskId> {
        self.engagement.effective_task()
    }

    /// Assign an owned task. Ignored while assisting; the backup slot
    /// already carries the task to resume.
    pub fn assign(&mut self, task: TaskId) {
        if self.engagement.is_assisting() {
            return;
        }
        self.engagement = Engagement::Own { task };
    }

    pub fn clear_task(&mut self) {
        if !self.engagement.is_assisting() {
            self.engagement = Engagement::Idle;
        }
    }

    /// Switch to assisting `task`, snapshotting the owned task as backup.
    pub fn begin_assist(&mut self, task: TaskId) {
        let backup = self.engagement.owned_task();
        self.engagement = Engagement::Assisting { task, backup };
        self.waiting_for_sync = true;
        self.ready_to_start = false;
        self.started = false;
        self.reached_goal = false;
    }

    /// Full reinitialization (agent removed/re-added); the only path that
    /// resets priority.
    pub fn reset(&mut self) {
        self.engagement = Engagement::Idle;
        self.priority = 0;
        self.claim_attempts = 0;
        self.success = false;
        self.reached_goal = false;
        self.ready_to_start = false;
        self.started = false;
        self.waiting_for_sync = false;
        self.history.clear();
    }

    /// Record a position sample, evicting the oldest beyond the window.
    pub fn record_position(&mut self, xy: [f64; 2]) {
        if self.history.len() == self.window {
            self.history.pop_front();
        }
        self.history.push_back(xy);
    }

    pub fn has_full_window(&self) -> bool {
        self.history.len() >= self.window
    }

    /// Maximum pairwise displacement across the sample window.
    pub fn max_window_displacement(&self) -> f64 {
        let mut max = 0.0_f64;
        for (i, a) in self.history.iter().enumerate() {
            for b in self.history.iter().skip(i + 1) {
                let dx = a[0] - b[0];
                let dy = a[1] - b[1];
                max = max.max((dx * dx + dy * dy).sqrt());
            }
        }
        max
    }

    /// Advance the agent one tick against the world, bus, and policy.
    pub fn advance(
        &mut self,
        world: &mut dyn WorldState,
        bus: &MessageBus,
        policy: &dyn DecisionPolicy,
        ctx: &TickContext<'_>,
    ) -> Result<TickOutcome> {
        let Some(task) = self.effective_task() else {
            return Ok(TickOutcome::Idle);
        };

        let current = world.position(self.body)?;
        self.record_position([current[0], current[1]]);

        // Quorum release arrives as a broadcast; reading it flips the gate.
        for msg in bus.inbox(&self.name, ctx.now) {
            if msg.kind == MessageKind::SyncStart && msg.task == task {
                self.ready_to_start = true;
                self.waiting_for_sync = false;
            }
        }

        let target = world.position(task)?;
        let distance = planar_distance(current, target);

        if distance < ctx.motion.reach_threshold {
            if self.engagement.is_assisting() {
                return Ok(self.finish_assist(ctx.book));
            }
            if !self.reached_goal {
                info!(
                    agent = %self.name,
                    task = %ctx.book.name(task),
                    "agent reached its task"
                );
            }
            self.reached_goal = true;
            return Ok(TickOutcome::Reached);
        }

        let cooperative = ctx.book.kind(task) == Some(TaskKind::Cooperative)
            || ctx.assisted.contains(&task);

        if cooperative && !self.ready_to_start {
            if !self.waiting_for_sync {
                debug!(
                    agent = %self.name,
                    task = %ctx.book.name(task),
                    "waiting for sync start"
                );
                self.waiting_for_sync = true;
            }
            return Ok(TickOutcome::WaitingForSync);
        }

        if !self.started {
            self.started = true;
            info!(
                agent = %self.name,
                task = %ctx.book.name(task),
                cooperative,
                "agent begins executing task"
            );
        }

        let step = match Observation::gather(world, self.body, task, task.0 as usize)
            .and_then(|obs| policy.predict_step(&obs))
        {
            Ok(seq) => seq.first().copied().unwrap_or([0.0, 0.0]),
            Err(e) => {
                // Policy failures are absorbed; the agent holds position.
                warn!(agent = %self.name, error = %e, "policy step failed, holding position");
                [0.0, 0.0]
            }
        };

        let step = clamp_step(step, ctx.motion.max_step);
        if step == [0.0, 0.0] {
            return Ok(TickOutcome::Held);
        }

        world.set_position(
            self.body,
            [current[0] + step[0], current[1] + step[1], current[2]],
        )?;
        Ok(TickOutcome::Moved)
    }

    /// End the assist episode: resume the backup task and re-enter the
    /// allocation cycle for it instead of trusting stale ownership.
    fn finish_assist(&mut self, book: &TaskBook) -> TickOutcome {
        let Engagement::Assisting { task, backup } = self.engagement.clone() else {
            return TickOutcome::Idle;
        };

        match backup {
            Some(original) => {
                info!(
                    agent = %self.name,
                    assisted = %book.name(task),
                    resuming = %book.name(original),
                    "assist complete, resuming original task"
                );
                self.engagement = Engagement::Own { task: original };
                // Ownership may have moved while assisting; the next
                // allocation session re-validates the claim.
                self.success = false;
            }
            None => {
                warn!(
                    agent = %self.name,
                    assisted = %book.name(task),
                    "assist complete but no backup task recorded, going idle"
                );
                self.engagement = Engagement::Idle;
            }
        }

        self.waiting_for_sync = false;
        self.ready_to_start = false;
        self.started = false;
        self.reached_goal = false;
        TickOutcome::AssistComplete
    }
}
