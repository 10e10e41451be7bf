//! Scenario bootstrap: populates the world, agent records, and task book,
//! then seeds a claim conflict and initial priorities.
//!
//! Everything here is setup; the protocol itself never depends on how a
//! scenario was generated. Seeded runs are fully reproducible.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::agent::AgentRecord;
use crate::config::{MotionConfig, ScenarioConfig};
use crate::domain::{EntityId, TaskBook, TaskKind};
use crate::error::{MeshError, Result};
use crate::world::{planar_distance, PlanarWorld, Position, WorldState};

/// Canonical starting positions for the first three agents. Extra agents
/// spawn at random positions inside the task field.
const AGENT_STARTS: [Position; 3] = [[0.0, -1.0, 0.5], [0.0, 1.0, 0.5], [-1.0, 0.0, 0.5]];

/// Task field bounds (planar, z fixed).
const FIELD: f64 = 2.0;

/// A fully initialized scenario: world entities spawned, task book filled,
/// agent records created with conflicting seed tasks and starting priorities.
pub struct Scenario {
    pub world: PlanarWorld,
    pub agents: BTreeMap<String, AgentRecord>,
    pub book: TaskBook,
}

impl Scenario {
    pub fn bootstrap(cfg: &ScenarioConfig, motion: &MotionConfig) -> Result<Self> {
        if cfg.num_agents == 0 || cfg.num_tasks == 0 {
            return Err(MeshError::Scenario(
                "scenario needs at least one agent and one task".into(),
            ));
        }
        if !(0.0..=1.0).contains(&cfg.conflict_ratio) {
            return Err(MeshError::Scenario(format!(
                "conflict_ratio {} outside [0, 1]",
                cfg.conflict_ratio
            )));
        }

        let mut rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut world = PlanarWorld::new();
        let mut book = TaskBook::new();

        // Tasks first: ids 1..=num_tasks, scattered across the field.
        // Kind layout mirrors the reference fleet: one cooperative, one
        // urgent, the rest solo.
        for i in 0..cfg.num_tasks {
            let id = EntityId(1 + i as u32);
            let pos = [
                rng.gen_range(-FIELD..FIELD),
                rng.gen_range(-FIELD..FIELD),
                0.5,
            ];
            world.spawn(id, pos);
            let kind = match i {
                0 => TaskKind::Cooperative,
                1 => TaskKind::Urgent,
                _ => TaskKind::Solo,
            };
            book.insert(id, format!("cube_{i}"), kind);
        }

        // Agents follow: ids continue after the tasks.
        let mut agents = BTreeMap::new();
        for i in 0..cfg.num_agents {
            let id = EntityId(1 + (cfg.num_tasks + i) as u32);
            let pos = AGENT_STARTS.get(i).copied().unwrap_or_else(|| {
                [
                    rng.gen_range(-FIELD..FIELD),
                    rng.gen_range(-FIELD..FIELD),
                    0.5,
                ]
            });
            world.spawn(id, pos);
            let name = format!("agent{}", i + 1);
            agents.insert(name.clone(), AgentRecord::new(name, id, motion.stuck_window));
        }

        let mut scenario = Self {
            world,
            agents,
            book,
        };
        scenario.seed_conflicts(cfg.conflict_ratio, &mut rng);
        scenario.init_priorities(&cfg.fixed_weights);
        Ok(scenario)
    }

    /// Pre-assign tasks so a claim conflict exists: one task is handed to
    /// `ratio` of the fleet, the rest receive distinct tasks from what
    /// remains. Assignments here are intent only; ownership is settled by
    /// the allocation session.
    fn seed_conflicts(&mut self, ratio: f64, rng: &mut StdRng) {
        let pool = self.book.all();
        let Some(conflict_task) = pool.choose(rng).copied() else {
            warn!("task pool is empty, nothing to seed");
            return;
        };
        info!(task = %self.book.name(conflict_task), "conflict task selected");

        let num_conflicted = (self.agents.len() as f64 * ratio) as usize;
        let mut names: Vec<String> = self.agents.keys().cloned().collect();
        names.shuffle(rng);

        let (conflicted, rest) = names.split_at(num_conflicted.min(names.len()));
        for name in conflicted {
            if let Some(agent) = self.agents.get_mut(name) {
                agent.assign(conflict_task);
                info!(agent = %name, task = %self.book.name(conflict_task), "seeded conflicting task");
            }
        }

        let leftovers: Vec<EntityId> = pool
            .iter()
            .copied()
            .filter(|t| *t != conflict_task)
            .collect();
        for (name, task) in rest.iter().zip(leftovers) {
            if let Some(agent) = self.agents.get_mut(name) {
                agent.assign(task);
                info!(agent = %name, task = %self.book.name(task), "seeded task");
            }
        }
    }

    /// Starting priority: average planar distance to every task, scaled,
    /// plus a fixed per-agent weight. Closer agents start with lower
    /// priority and rely on escalation to win contested tasks.
    fn init_priorities(&mut self, fixed_weights: &[i64]) {
        let tasks = self.book.all();
        if tasks.is_empty() {
            return;
        }
        for (i, agent) in self.agents.values_mut().enumerate() {
            let Ok(agent_pos) = self.world.position(agent.body) else {
                continue;
            };
            let total: f64 = tasks
                .iter()
                .filter_map(|t| self.world.position(*t).ok())
                .map(|task_pos| planar_distance(agent_pos, task_pos))
                .sum();
            let avg = total / tasks.len() as f64;
            let weight = fixed_weights.get(i).copied().unwrap_or(0);
            agent.priority = (avg * 10.0) as i64 + weight;
            info!(
                agent = %agent.name,
                priority = agent.priority,
                distance_score = avg * 10.0,
                weight,
                "initial priority"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(seed: u64) -> ScenarioConfig {
        ScenarioConfig {
            seed: Some(seed),
            ..ScenarioConfig::default()
        }
    }

    #[test]
    fn bootstrap_spawns_agents_tasks_and_kinds() {
        let scenario = Scenario::bootstrap(&cfg(7), &MotionConfig::default()).unwrap();
        assert_eq!(scenario.agents.len(), 3);
        assert_eq!(scenario.book.len(), 3);
        assert_eq!(scenario.book.kind(EntityId(1)), Some(TaskKind::Cooperative));
        assert_eq!(scenario.book.kind(EntityId(2)), Some(TaskKind::Urgent));
        assert_eq!(scenario.book.kind(EntityId(3)), Some(TaskKind::Solo));
        for agent in scenario.agents.values() {
            assert!(scenario.world.contains(agent.body));
        }
    }

    #[test]
    fn seeded_runs_are_reproducible() {
        let a = Scenario::bootstrap(&cfg(42), &MotionConfig::default()).unwrap();
        let b = Scenario::bootstrap(&cfg(42), &MotionConfig::default()).unwrap();
        for (name, agent) in &a.agents {
            assert_eq!(agent.engagement, b.agents[name].engagement);
            assert_eq!(agent.priority, b.agents[name].priority);
        }
    }

    #[test]
    fn conflict_ratio_seeds_shared_task() {
        // 3 agents at 0.8 → 2 agents share one task.
        let scenario = Scenario::bootstrap(&cfg(3), &MotionConfig::default()).unwrap();
        let mut counts: BTreeMap<EntityId, usize> = BTreeMap::new();
        for agent in scenario.agents.values() {
            if let Some(task) = agent.engagement.owned_task() {
                *counts.entry(task).or_default() += 1;
            }
        }
        assert!(counts.values().any(|&c| c == 2));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut bad = cfg(1);
        bad.num_agents = 0;
        assert!(Scenario::bootstrap(&bad, &MotionConfig::default()).is_err());

        let mut bad = cfg(1);
        bad.conflict_ratio = 1.5;
        assert!(Scenario::bootstrap(&bad, &MotionConfig::default()).is_err());
    }
}
