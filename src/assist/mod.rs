//! Assistance and synchronization: stuck detection, help routing, and the
//! quorum barrier that releases cooperative tasks in lockstep.
//!
//! Runs once per tick: sweep expired requests, open assistance records for
//! stuck agents and cooperative-task holders, recruit helpers for pending
//! requests, then fire sync barriers for tasks whose quorum is complete.
//! All registries (open-episode guard, ack book, sync-sent set) are owned
//! here and passed state, never ambient globals.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, info, warn};

use crate::agent::AgentRecord;
use crate::bus::{Message, MessageBus, MessageKind, Recipient};
use crate::config::{MotionConfig, ProtocolConfig};
use crate::domain::{TaskBook, TaskId, TaskKind};
use crate::world::{planar_distance, WorldState};

/// Acknowledged helpers recorded against one assisted task.
#[derive(Debug, Clone)]
struct AckRegistry {
    requester: String,
    helpers: BTreeSet<String>,
}

impl AckRegistry {
    fn members(&self) -> BTreeSet<String> {
        let mut members = self.helpers.clone();
        members.insert(self.requester.clone());
        members
    }
}

/// Pending request snapshot taken before any matching happens, so helper
/// selection observes one consistent view of the round.
#[derive(Debug, Clone)]
struct PendingRequest {
    requester: String,
    task: TaskId,
    urgency: i64,
}

pub struct AssistCoordinator {
    cfg: ProtocolConfig,
    motion: MotionConfig,
    /// Agents with an open assist episode (once-per-episode guard).
    requested: HashSet<String>,
    /// Task → requester + acknowledged helpers.
    acks: BTreeMap<TaskId, AckRegistry>,
    /// Tasks whose barrier already fired (at most once per task).
    sync_sent: HashSet<TaskId>,
}

impl AssistCoordinator {
    pub fn new(cfg: ProtocolConfig, motion: MotionConfig) -> Self {
        Self {
            cfg,
            motion,
            requested: HashSet::new(),
            acks: BTreeMap::new(),
            sync_sent: HashSet::new(),
        }
    }

    /// Tasks with an active assistance record; agents treat these as
    /// cooperative regardless of their declared kind.
    pub fn assisted_tasks(&self, bus: &MessageBus, now: DateTime<Utc>) -> HashSet<TaskId> {
        let mut tasks: HashSet<TaskId> = bus
            .of_kind(MessageKind::RequestAssist, now)
            .iter()
            .map(|m| m.task)
            .collect();
        tasks.extend(self.acks.keys().copied());
        tasks
    }

    /// Whether the barrier for a task has already been released.
    pub fn sync_fired(&self, task: TaskId) -> bool {
        self.sync_sent.contains(&task)
    }

    /// Expiry sweep: purge stale bus traffic and release the open-episode
    /// guard for agents whose request lapsed, so a still-stuck agent may
    /// open a fresh episode.
    pub fn sweep(&mut self, bus: &mut MessageBus, now: DateTime<Utc>) {
        bus.purge_expired(now);

        let live: HashSet<String> = bus
            .of_kind(MessageKind::RequestAssist, now)
            .iter()
            .map(|m| m.sender.clone())
            .collect();
        self.requested.retain(|name| live.contains(name));

        // Drop ack books for episodes that expired before their barrier.
        let sync_sent = &self.sync_sent;
        self.acks.retain(|task, registry| {
            sync_sent.contains(task) || live.contains(&registry.requester)
        });
    }

    /// Stuck iff the window is full, the agent is still outside the reach
    /// threshold of its target, and the whole window fits inside the stuck
    /// displacement bound. An agent at its goal is never stuck.
    pub fn is_stuck(&self, agent: &AgentRecord, world: &dyn WorldState) -> bool {
        let Some(task) = agent.effective_task() else {
            return false;
        };
        if !agent.has_full_window() {
            return false;
        }
        let (Ok(pos), Ok(target)) = (world.position(agent.body), world.position(task)) else {
            return false;
        };
        if planar_distance(pos, target) <= self.motion.reach_threshold {
            return false;
        }
        agent.max_window_displacement() < self.motion.stuck_threshold
    }

    /// Post assistance requests for stuck agents, at most once per episode.
    pub fn scan_for_stuck(
        &mut self,
        agents: &BTreeMap<String, AgentRecord>,
        world: &dyn WorldState,
        bus: &mut MessageBus,
        now: DateTime<Utc>,
    ) {
        for agent in agents.values() {
            if agent.engagement.is_assisting() || self.requested.contains(&agent.name) {
                continue;
            }
            if !self.is_stuck(agent, world) {
                continue;
            }
            let Some(task) = agent.effective_task() else {
                continue;
            };
            info!(
                agent = %agent.name,
                task = %task,
                "agent is stuck, broadcasting assist request"
            );
            self.open_episode(agent, task, bus, now);
        }
    }

    /// Holders of cooperative tasks open an assistance record immediately:
    /// the task cannot start without a quorum, so recruiting begins before
    /// anyone is stuck.
    pub fn auto_assist(
        &mut self,
        agents: &BTreeMap<String, AgentRecord>,
        book: &TaskBook,
        bus: &mut MessageBus,
        now: DateTime<Utc>,
    ) {
        for agent in agents.values() {
            if agent.reached_goal
                || agent.engagement.is_assisting()
                || self.requested.contains(&agent.name)
            {
                continue;
            }
            let Some(task) = agent.engagement.owned_task() else {
                continue;
            };
            if book.kind(task) != Some(TaskKind::Cooperative) || self.sync_fired(task) {
                continue;
            }
            // One assistance record per task; a second holder never exists
            // post-resolution, but guard against in-flight rounds anyway.
            if self.acks.contains_key(&task) {
                continue;
            }
            debug!(
                agent = %agent.name,
                task = %book.name(task),
                "cooperative task held, opening assistance record"
            );
            self.open_episode(agent, task, bus, now);
        }
    }

    fn open_episode(
        &mut self,
        agent: &AgentRecord,
        task: TaskId,
        bus: &mut MessageBus,
        now: DateTime<Utc>,
    ) {
        bus.post(Message::new(
            agent.name.clone(),
            Recipient::Broadcast,
            MessageKind::RequestAssist,
            task,
            agent.priority,
            now,
            self.cfg.assist_ttl_ms,
        ));
        self.requested.insert(agent.name.clone());
        self.acks.entry(task).or_insert_with(|| AckRegistry {
            requester: agent.name.clone(),
            helpers: BTreeSet::new(),
        });
    }

    /// Recruit helpers for pending, non-expired requests whose task is not
    /// yet sufficiently staffed. Candidates must be free of any assistance
    /// duty, hold no cooperative or urgent task of their own, and carry a
    /// priority no greater than the requester's; high-priority agents are
    /// not pulled off their own work.
    pub fn match_helpers(
        &mut self,
        agents: &mut BTreeMap<String, AgentRecord>,
        book: &TaskBook,
        bus: &mut MessageBus,
        now: DateTime<Utc>,
    ) {
        let pending: Vec<PendingRequest> = bus
            .of_kind(MessageKind::RequestAssist, now)
            .iter()
            .map(|m| PendingRequest {
                requester: m.sender.clone(),
                task: m.task,
                urgency: m.priority,
            })
            .collect();

        for request in pending {
            let staffed = self
                .acks
                .get(&request.task)
                .map(|r| r.helpers.len())
                .unwrap_or(0);
            if staffed >= self.cfg.max_helpers || self.sync_fired(request.task) {
                continue;
            }

            let candidate = agents
                .values()
                .find(|a| {
                    a.name != request.requester
                        && !a.engagement.is_assisting()
                        && !a.reached_goal
                        && !a.waiting_for_sync
                        && !a.started
                        && !holds_busy_task(a, book)
                        && a.priority <= request.urgency
                })
                .map(|a| a.name.clone());
            let Some(name) = candidate else {
                debug!(task = %request.task, "no eligible helper this tick");
                continue;
            };

            if let Some(helper) = agents.get_mut(&name) {
                helper.begin_assist(request.task);
                bus.post(Message::new(
                    helper.name.clone(),
                    Recipient::Agent(request.requester.clone()),
                    MessageKind::AckAssist,
                    request.task,
                    helper.priority,
                    now,
                    self.cfg.assist_ttl_ms,
                ));
                info!(
                    helper = %name,
                    requester = %request.requester,
                    task = %book.name(request.task),
                    "helper reassigned to assist"
                );

                self.acks
                    .entry(request.task)
                    .or_insert_with(|| AckRegistry {
                        requester: request.requester.clone(),
                        helpers: BTreeSet::new(),
                    })
                    .helpers
                    .insert(name);
            }
        }
    }

    /// Release the quorum barrier for tasks whose member set (acknowledged
    /// helpers plus the requester) reached size >= 2 and, when co-presence
    /// is required, whose members all stand within the reach threshold.
    /// Fires at most once per task; no rollback path exists.
    pub fn fire_barriers(
        &mut self,
        agents: &mut BTreeMap<String, AgentRecord>,
        world: &dyn WorldState,
        bus: &mut MessageBus,
        now: DateTime<Utc>,
    ) {
        let mut released: Vec<(TaskId, BTreeSet<String>)> = Vec::new();

        for (task, registry) in &self.acks {
            if self.sync_sent.contains(task) {
                continue;
            }
            let members = registry.members();
            if members.len() < 2 {
                continue;
            }
            if self.cfg.require_copresence && !self.all_present(&members, *task, agents, world) {
                continue;
            }
            released.push((*task, members));
        }

        for (task, members) in released {
            bus.post(Message::new(
                "coordinator",
                Recipient::Broadcast,
                MessageKind::SyncStart,
                task,
                0,
                now,
                self.cfg.sync_ttl_ms,
            ));
            for name in &members {
                if let Some(agent) = agents.get_mut(name) {
                    agent.ready_to_start = true;
                    agent.waiting_for_sync = false;
                } else {
                    warn!(agent = %name, task = %task, "quorum member vanished before sync");
                }
            }
            self.sync_sent.insert(task);
            info!(task = %task, members = ?members, "sync barrier released");
        }
    }

    fn all_present(
        &self,
        members: &BTreeSet<String>,
        task: TaskId,
        agents: &BTreeMap<String, AgentRecord>,
        world: &dyn WorldState,
    ) -> bool {
        let Ok(target) = world.position(task) else {
            return false;
        };
        members.iter().all(|name| {
            agents
                .get(name)
                .and_then(|a| world.position(a.body).ok())
                .map(|pos| planar_distance(pos, target) <= self.motion.reach_threshold)
                .unwrap_or(false)
        })
    }
}

fn holds_busy_task(agent: &AgentRecord, book: &TaskBook) -> bool {
    agent
        .engagement
        .owned_task()
        .and_then(|t| book.kind(t))
        .map(|k| matches!(k, TaskKind::Cooperative | TaskKind::Urgent))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EntityId;
    use crate::world::PlanarWorld;

    fn coordinator() -> AssistCoordinator {
        AssistCoordinator::new(ProtocolConfig::default(), MotionConfig::default())
    }

    fn world_with(agent_bodies: &[(u32, [f64; 2])], tasks: &[(u32, [f64; 2])]) -> PlanarWorld {
        let mut world = PlanarWorld::new();
        for (id, xy) in agent_bodies.iter().chain(tasks) {
            world.spawn(EntityId(*id), [xy[0], xy[1], 0.5]);
        }
        world
    }

    fn stuck_agent(name: &str, body: u32, task: u32) -> AgentRecord {
        let mut agent = AgentRecord::new(name, EntityId(body), 10);
        agent.assign(EntityId(task));
        for _ in 0..10 {
            agent.record_position([0.0, 0.0]);
        }
        agent
    }

    #[test]
    fn agent_within_reach_is_never_stuck() {
        let world = world_with(&[(1, [0.0, 0.0])], &[(10, [0.05, 0.0])]);
        let agent = stuck_agent("agent1", 1, 10);
        assert!(!coordinator().is_stuck(&agent, &world));
    }

    #[test]
    fn partial_window_is_never_stuck() {
        let world = world_with(&[(1, [0.0, 0.0])], &[(10, [2.0, 0.0])]);
        let mut agent = AgentRecord::new("agent1", EntityId(1), 10);
        agent.assign(EntityId(10));
        for _ in 0..5 {
            agent.record_position([0.0, 0.0]);
        }
        assert!(!coordinator().is_stuck(&agent, &world));
    }

    #[test]
    fn motionless_far_agent_is_stuck() {
        let world = world_with(&[(1, [0.0, 0.0])], &[(10, [2.0, 0.0])]);
        let agent = stuck_agent("agent1", 1, 10);
        assert!(coordinator().is_stuck(&agent, &world));
    }

    #[test]
    fn assist_request_is_posted_exactly_once_per_episode() {
        let world = world_with(&[(1, [0.0, 0.0])], &[(10, [2.0, 0.0])]);
        let mut agents = BTreeMap::new();
        agents.insert("agent1".to_string(), stuck_agent("agent1", 1, 10));

        let mut coord = coordinator();
        let mut bus = MessageBus::new();
        let now = Utc::now();

        for _ in 0..10 {
            coord.scan_for_stuck(&agents, &world, &mut bus, now);
        }
        assert_eq!(bus.of_kind(MessageKind::RequestAssist, now).len(), 1);
    }

    #[test]
    fn expired_request_releases_the_episode_guard() {
        let world = world_with(&[(1, [0.0, 0.0])], &[(10, [2.0, 0.0])]);
        let mut agents = BTreeMap::new();
        agents.insert("agent1".to_string(), stuck_agent("agent1", 1, 10));

        let mut coord = coordinator();
        let mut bus = MessageBus::new();
        let t0 = Utc::now();
        coord.scan_for_stuck(&agents, &world, &mut bus, t0);
        assert_eq!(bus.of_kind(MessageKind::RequestAssist, t0).len(), 1);

        let later = t0 + chrono::Duration::milliseconds(6_000);
        coord.sweep(&mut bus, later);
        coord.scan_for_stuck(&agents, &world, &mut bus, later);
        assert_eq!(bus.of_kind(MessageKind::RequestAssist, later).len(), 1);
    }

    #[test]
    fn helper_selection_respects_priority_gate_and_busy_tasks() {
        let world = world_with(
            &[(1, [0.0, 0.0]), (2, [1.0, 0.0]), (3, [0.0, 1.0])],
            &[(10, [2.0, 0.0]), (11, [3.0, 0.0]), (12, [4.0, 0.0])],
        );
        let mut book = TaskBook::new();
        book.insert(EntityId(10), "cube_0", TaskKind::Solo);
        book.insert(EntityId(11), "cube_1", TaskKind::Urgent);
        book.insert(EntityId(12), "cube_2", TaskKind::Solo);

        let mut requester = stuck_agent("agent1", 1, 10);
        requester.priority = 3;
        // agent2 holds an urgent task and is never pulled off it.
        let mut busy = AgentRecord::new("agent2", EntityId(2), 10);
        busy.assign(EntityId(11));
        // agent3 outranks the requester; priority gate excludes it.
        let mut ranked = AgentRecord::new("agent3", EntityId(3), 10);
        ranked.assign(EntityId(12));
        ranked.priority = 9;

        let mut agents = BTreeMap::new();
        agents.insert("agent1".to_string(), requester);
        agents.insert("agent2".to_string(), busy);
        agents.insert("agent3".to_string(), ranked);

        let mut coord = coordinator();
        let mut bus = MessageBus::new();
        let now = Utc::now();
        coord.scan_for_stuck(&agents, &world, &mut bus, now);
        coord.match_helpers(&mut agents, &book, &mut bus, now);

        assert!(!agents["agent2"].engagement.is_assisting());
        assert!(!agents["agent3"].engagement.is_assisting());

        // Lower the rank and the gate opens.
        agents.get_mut("agent3").unwrap().priority = 2;
        coord.match_helpers(&mut agents, &book, &mut bus, now);
        let helper = &agents["agent3"];
        assert!(helper.engagement.is_assisting());
        assert!(helper.waiting_for_sync);
        assert_eq!(
            helper.engagement,
            crate::agent::Engagement::Assisting {
                task: EntityId(10),
                backup: Some(EntityId(12)),
            }
        );
    }

    #[test]
    fn barrier_fires_once_and_only_for_members() {
        let world = world_with(
            &[(1, [0.0, 0.0]), (2, [1.0, 0.0]), (3, [5.0, 5.0])],
            &[(10, [2.0, 0.0]), (12, [4.0, 0.0])],
        );
        let mut book = TaskBook::new();
        book.insert(EntityId(10), "cube_0", TaskKind::Cooperative);
        book.insert(EntityId(12), "cube_2", TaskKind::Solo);

        let mut requester = stuck_agent("agent1", 1, 10);
        requester.priority = 5;
        let helper = AgentRecord::new("agent2", EntityId(2), 10);
        let mut outsider = AgentRecord::new("agent3", EntityId(3), 10);
        outsider.assign(EntityId(12));

        let mut agents = BTreeMap::new();
        agents.insert("agent1".to_string(), requester);
        agents.insert("agent2".to_string(), helper);
        agents.insert("agent3".to_string(), outsider);

        let mut coord = coordinator();
        let mut bus = MessageBus::new();
        let now = Utc::now();

        coord.scan_for_stuck(&agents, &world, &mut bus, now);
        // Quorum of one: barrier must hold.
        coord.fire_barriers(&mut agents, &world, &mut bus, now);
        assert!(!coord.sync_fired(EntityId(10)));

        coord.match_helpers(&mut agents, &book, &mut bus, now);
        coord.fire_barriers(&mut agents, &world, &mut bus, now);
        assert!(coord.sync_fired(EntityId(10)));
        assert!(agents["agent1"].ready_to_start);
        assert!(agents["agent2"].ready_to_start);
        assert!(!agents["agent3"].ready_to_start);

        // At most once per task.
        let sync_count = bus.of_kind(MessageKind::SyncStart, now).len();
        coord.fire_barriers(&mut agents, &world, &mut bus, now);
        assert_eq!(bus.of_kind(MessageKind::SyncStart, now).len(), sync_count);
        assert_eq!(sync_count, 1);
    }

    #[test]
    fn copresence_gate_holds_barrier_until_members_arrive() {
        let mut world = world_with(&[(1, [1.8, 0.0]), (2, [1.0, 0.0])], &[(10, [2.0, 0.0])]);
        let mut agents = BTreeMap::new();
        let mut requester = stuck_agent("agent1", 1, 10);
        requester.priority = 5;
        agents.insert("agent1".to_string(), requester);
        agents.insert(
            "agent2".to_string(),
            AgentRecord::new("agent2", EntityId(2), 10),
        );

        let mut cfg = ProtocolConfig::default();
        cfg.require_copresence = true;
        let mut coord = AssistCoordinator::new(cfg, MotionConfig::default());
        let mut bus = MessageBus::new();
        let now = Utc::now();
        let book = {
            let mut b = TaskBook::new();
            b.insert(EntityId(10), "cube_0", TaskKind::Cooperative);
            b
        };

        coord.scan_for_stuck(&agents, &world, &mut bus, now);
        coord.match_helpers(&mut agents, &book, &mut bus, now);
        coord.fire_barriers(&mut agents, &world, &mut bus, now);
        assert!(!coord.sync_fired(EntityId(10)));

        // Both members arrive at the task.
        world.set_position(EntityId(1), [1.95, 0.0, 0.5]).unwrap();
        world.set_position(EntityId(2), [2.05, 0.0, 0.5]).unwrap();
        coord.fire_barriers(&mut agents, &world, &mut bus, now);
        assert!(coord.sync_fired(EntityId(10)));
    }
}
