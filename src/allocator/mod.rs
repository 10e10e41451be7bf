//! Allocation Coordinator: claim collection, deterministic conflict
//! resolution, and the retry loop with priority escalation.
//!
//! One coordination round: gather claims from agent records → group by task
//! and pick winners → resolve outcomes (lock won tasks, escalate and
//! reassign losers). Rounds repeat until every agent holds a non-conflicting
//! task or the retry budget is exhausted, in which case the session surfaces
//! a partial-success report rather than an error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::agent::AgentRecord;
use crate::bus::{Message, MessageBus, MessageKind, MessageStatus, Recipient};
use crate::config::ProtocolConfig;
use crate::domain::{TaskBook, TaskId};
use crate::policy::DecisionPolicy;
use crate::world::{planar_distance, WorldState};

/// A declared intent to execute a task this round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub sender: String,
    pub task: TaskId,
    pub priority: i64,
    pub created_at: DateTime<Utc>,
}

/// Coordinator verdict delivered back to each claimant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimResponse {
    pub to: String,
    pub task: TaskId,
    pub accepted: bool,
}

/// Session outcome: which agents converged and which remain taskless.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationReport {
    pub rounds_run: u32,
    pub resolved: Vec<String>,
    pub unresolved: Vec<String>,
}

impl AllocationReport {
    pub fn all_resolved(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// Drives allocation sessions over a shared task pool. The pool's lock set
/// lives in the `TaskBook` handed into each call, keeping every phase
/// testable in isolation.
#[derive(Debug, Clone)]
pub struct AllocationCoordinator {
    cfg: ProtocolConfig,
}

impl AllocationCoordinator {
    pub fn new(cfg: ProtocolConfig) -> Self {
        Self { cfg }
    }

    /// Phase 1: every agent without a finalized success that holds an owned
    /// task posts a claim; the round then drains all claim traffic at once
    /// so evaluation sees a single consistent snapshot.
    pub fn collect_claims(
        &self,
        agents: &BTreeMap<String, AgentRecord>,
        bus: &mut MessageBus,
        now: DateTime<Utc>,
    ) -> Vec<Claim> {
        for agent in agents.values() {
            if agent.success {
                continue;
            }
            let Some(task) = agent.engagement.owned_task() else {
                continue;
            };
            debug!(agent = %agent.name, task = %task, priority = agent.priority, "posting claim");
            bus.post(Message::new(
                agent.name.clone(),
                Recipient::Broadcast,
                MessageKind::Claim,
                task,
                agent.priority,
                now,
                self.cfg.claim_ttl_ms,
            ));
        }

        bus.drain_kind(MessageKind::Claim)
            .into_iter()
            .filter(|m| !m.is_expired(now))
            .map(|m| Claim {
                sender: m.sender,
                task: m.task,
                priority: m.priority,
                created_at: m.created_at,
            })
            .collect()
    }

    /// Phase 2: group claims by task and pick one winner per group:
    /// highest priority, ties broken by smaller agent→task distance, then
    /// by sender name so evaluation is order-independent. Verdicts are
    /// posted back to each claimant.
    pub fn evaluate_conflicts(
        &self,
        claims: &[Claim],
        agents: &BTreeMap<String, AgentRecord>,
        world: &dyn WorldState,
        bus: &mut MessageBus,
        now: DateTime<Utc>,
    ) -> Vec<ClaimResponse> {
        let mut grouped: BTreeMap<TaskId, Vec<&Claim>> = BTreeMap::new();
        for claim in claims {
            grouped.entry(claim.task).or_default().push(claim);
        }

        let mut responses = Vec::new();
        for (task, mut group) in grouped {
            group.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then_with(|| {
                        let da = claim_distance(world, agents, a);
                        let db = claim_distance(world, agents, b);
                        da.total_cmp(&db)
                    })
                    .then_with(|| a.sender.cmp(&b.sender))
            });

            let winner = group[0].sender.clone();
            if group.len() > 1 {
                info!(
                    task = %task,
                    winner = %winner,
                    contenders = group.len(),
                    "claim conflict resolved"
                );
            }

            for claim in group {
                let accepted = claim.sender == winner;
                let status = if accepted {
                    MessageStatus::Accepted
                } else {
                    MessageStatus::Rejected
                };
                bus.post(
                    Message::new(
                        "coordinator",
                        Recipient::Agent(claim.sender.clone()),
                        MessageKind::Response,
                        task,
                        claim.priority,
                        now,
                        self.cfg.response_ttl_ms,
                    )
                    .with_status(status),
                );
                responses.push(ClaimResponse {
                    to: claim.sender.clone(),
                    task,
                    accepted,
                });
            }
        }
        responses
    }

    /// Phase 3: finalize winners (lock their tasks out of the pool),
    /// escalate and reassign everyone else. Returns true when every
    /// non-assisting agent holds a finalized task.
    pub fn resolve_outcomes(
        &self,
        agents: &mut BTreeMap<String, AgentRecord>,
        responses: &[ClaimResponse],
        book: &mut TaskBook,
        world: &dyn WorldState,
        policy: &dyn DecisionPolicy,
    ) -> bool {
        let mut all_success = true;

        for agent in agents.values_mut() {
            if agent.success || agent.engagement.is_assisting() {
                continue;
            }

            let Some(task) = agent.engagement.owned_task() else {
                // No claimable task this round: escalate and try the pool.
                all_success = false;
                self.escalate_and_reassign(agent, None, book, world, policy);
                continue;
            };

            let outcome = responses
                .iter()
                .find(|r| r.to == agent.name && r.task == task);

            let accepted = outcome.map(|r| r.accepted).unwrap_or(false);
            if accepted && book.lock(task, &agent.name) {
                agent.success = true;
                info!(
                    agent = %agent.name,
                    task = %book.name(task),
                    "claim accepted, task locked"
                );
                continue;
            }

            if accepted {
                // Won the group but the task was finalized to someone else
                // in an earlier round; treated as a rejection.
                debug!(agent = %agent.name, task = %task, "accepted claim hit a locked task");
            }
            all_success = false;
            self.escalate_and_reassign(agent, Some(task), book, world, policy);
        }

        all_success
    }

    /// Escalation: bump priority by the configured step (never decreases)
    /// and reselect a task from the pool, excluding the task just lost and
    /// every locked task. An empty pool leaves the agent taskless for the
    /// round (reported, never fatal).
    fn escalate_and_reassign(
        &self,
        agent: &mut AgentRecord,
        lost: Option<TaskId>,
        book: &TaskBook,
        world: &dyn WorldState,
        policy: &dyn DecisionPolicy,
    ) {
        agent.priority += self.cfg.priority_step;
        agent.claim_attempts += 1;

        let excludes: Vec<TaskId> = lost.into_iter().collect();
        let candidates = book.available_excluding(&excludes);
        if candidates.is_empty() {
            warn!(agent = %agent.name, "no tasks remain in pool, agent stays taskless this round");
            agent.clear_task();
            return;
        }

        match policy.choose(agent.body, world, &candidates) {
            Ok(Some(next)) => {
                info!(
                    agent = %agent.name,
                    task = %book.name(next),
                    priority = agent.priority,
                    "reassigned after rejection"
                );
                agent.assign(next);
            }
            Ok(None) => {
                warn!(agent = %agent.name, "policy declined every candidate task");
                agent.clear_task();
            }
            Err(e) => {
                // Policy failure is absorbed; the agent sits out the round.
                warn!(agent = %agent.name, error = %e, "task choice failed");
                agent.clear_task();
            }
        }
    }

    /// Run the full session: up to `max_retries` rounds with early stop on
    /// convergence. Unresolved agents are cleared to taskless and reported.
    /// All traffic posted during the session is stamped with the caller's
    /// `now`, keeping session messages on the same clock as the tick loop.
    pub fn run_session(
        &self,
        agents: &mut BTreeMap<String, AgentRecord>,
        book: &mut TaskBook,
        world: &dyn WorldState,
        policy: &dyn DecisionPolicy,
        bus: &mut MessageBus,
        now: DateTime<Utc>,
    ) -> AllocationReport {
        let mut rounds_run = 0;

        for round in 0..self.cfg.max_retries {
            rounds_run = round + 1;

            let claims = self.collect_claims(agents, bus, now);
            let responses = self.evaluate_conflicts(&claims, agents, world, bus, now);
            let all_success = self.resolve_outcomes(agents, &responses, book, world, policy);

            // Round completion garbage collection for verdict traffic.
            bus.drain_kind(MessageKind::Response);

            if all_success {
                info!(round, "allocation converged, all agents assigned");
                break;
            }
        }

        let mut resolved = Vec::new();
        let mut unresolved = Vec::new();
        for agent in agents.values_mut() {
            if agent.success || agent.engagement.is_assisting() {
                resolved.push(agent.name.clone());
            } else {
                // Retry budget exhausted: the agent stays taskless until a
                // task frees up.
                agent.clear_task();
                unresolved.push(agent.name.clone());
            }
        }

        if !unresolved.is_empty() {
            warn!(
                rounds_run,
                unresolved = ?unresolved,
                "allocation ended with partial success"
            );
        }

        AllocationReport {
            rounds_run,
            resolved,
            unresolved,
        }
    }
}

fn claim_distance(
    world: &dyn WorldState,
    agents: &BTreeMap<String, AgentRecord>,
    claim: &Claim,
) -> f64 {
    let Some(agent) = agents.get(&claim.sender) else {
        return f64::INFINITY;
    };
    let (Ok(a), Ok(t)) = (world.position(agent.body), world.position(claim.task)) else {
        return f64::INFINITY;
    };
    planar_distance(a, t)
}
