//! Simulation driver: owns the world, the fleet, and both coordinators,
//! and advances everything on a single-threaded tick loop.
//!
//! Each tick runs the protocol phases in a fixed order: expiry sweep,
//! assistance bookkeeping (auto-assist, stuck scan, helper matching, sync
//! barriers), then one `advance` per agent in name order. Time is an
//! explicit clock stepped by `tick_ms`, so runs are deterministic and tests
//! never sleep.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::agent::{AgentRecord, TickContext, TickOutcome};
use crate::allocator::{AllocationCoordinator, AllocationReport};
use crate::assist::AssistCoordinator;
use crate::bus::MessageBus;
use crate::config::{AppConfig, MotionConfig};
use crate::domain::TaskBook;
use crate::error::Result;
use crate::policy::{DecisionPolicy, NearestTaskPolicy};
use crate::scenario::Scenario;
use crate::world::PlanarWorld;

/// Outcome counters for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub moved: usize,
    pub reached: usize,
    pub waiting: usize,
    pub assists_completed: usize,
    pub held: usize,
    pub idle: usize,
}

/// Whole-run summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimReport {
    pub ticks_run: u64,
    pub completed: bool,
    pub allocation: AllocationReport,
}

pub struct Simulation {
    pub world: PlanarWorld,
    pub agents: BTreeMap<String, AgentRecord>,
    pub book: TaskBook,
    pub bus: MessageBus,
    allocator: AllocationCoordinator,
    assist: AssistCoordinator,
    policy: Box<dyn DecisionPolicy>,
    motion: MotionConfig,
    clock: DateTime<Utc>,
    tick_step: Duration,
}

impl Simulation {
    /// Assemble a simulation from pre-built parts. The clock starts at the
    /// current wall time and advances only through `tick`.
    pub fn new(scenario: Scenario, cfg: &AppConfig, policy: Box<dyn DecisionPolicy>) -> Self {
        Self {
            world: scenario.world,
            agents: scenario.agents,
            book: scenario.book,
            bus: MessageBus::new(),
            allocator: AllocationCoordinator::new(cfg.protocol.clone()),
            assist: AssistCoordinator::new(cfg.protocol.clone(), cfg.motion.clone()),
            policy,
            motion: cfg.motion.clone(),
            clock: Utc::now(),
            tick_step: Duration::milliseconds(cfg.motion.tick_ms as i64),
        }
    }

    /// Bootstrap a scenario from config with the default nearest-task policy.
    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        let scenario = Scenario::bootstrap(&cfg.scenario, &cfg.motion)?;
        Ok(Self::new(scenario, cfg, Box::new(NearestTaskPolicy)))
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock
    }

    /// Run one allocation session over the current fleet and pool. Session
    /// traffic is stamped with the simulation clock so mid-run
    /// re-allocations stay on the same time base as the tick loop.
    pub fn allocate(&mut self) -> AllocationReport {
        self.allocator.run_session(
            &mut self.agents,
            &mut self.book,
            &self.world,
            self.policy.as_ref(),
            &mut self.bus,
            self.clock,
        )
    }

    /// Advance the whole system one tick.
    pub fn tick(&mut self) -> Result<TickReport> {
        self.clock += self.tick_step;
        let now = self.clock;

        self.assist.sweep(&mut self.bus, now);
        self.assist
            .auto_assist(&self.agents, &self.book, &mut self.bus, now);
        self.assist
            .scan_for_stuck(&self.agents, &self.world, &mut self.bus, now);
        self.assist
            .match_helpers(&mut self.agents, &self.book, &mut self.bus, now);
        self.assist
            .fire_barriers(&mut self.agents, &self.world, &mut self.bus, now);

        let assisted = self.assist.assisted_tasks(&self.bus, now);
        let ctx = TickContext {
            book: &self.book,
            assisted: &assisted,
            motion: &self.motion,
            now,
        };

        let mut report = TickReport::default();
        for agent in self.agents.values_mut() {
            match agent.advance(&mut self.world, &self.bus, self.policy.as_ref(), &ctx)? {
                TickOutcome::Moved => report.moved += 1,
                TickOutcome::Reached => report.reached += 1,
                TickOutcome::WaitingForSync => report.waiting += 1,
                TickOutcome::AssistComplete => report.assists_completed += 1,
                TickOutcome::Held => report.held += 1,
                TickOutcome::Idle => report.idle += 1,
            }
        }
        Ok(report)
    }

    /// Every engaged agent has reached its goal; idle agents count as done.
    pub fn completed(&self) -> bool {
        self.agents.values().all(|a| {
            a.effective_task().is_none() || (a.reached_goal && !a.engagement.is_assisting())
        })
    }

    /// Full run: allocate, then tick until every engaged agent reaches its
    /// goal or the tick budget runs out. A completed assist episode puts
    /// the helper's resumed task back through allocation before movement
    /// continues, so stale ownership is never trusted.
    pub fn run(&mut self, max_ticks: u64) -> Result<SimReport> {
        let allocation = self.allocate();

        let mut ticks_run = 0;
        while ticks_run < max_ticks && !self.completed() {
            let report = self.tick()?;
            ticks_run += 1;

            if report.assists_completed > 0 {
                debug!(ticks_run, "assist episodes ended, re-running allocation");
                self.allocate();
            }
        }

        let completed = self.completed();
        info!(ticks_run, completed, "simulation run finished");
        Ok(SimReport {
            ticks_run,
            completed,
            allocation,
        })
    }
}
