//! Decision policy seam: task choice and motion prediction.
//!
//! The protocol treats the policy as an opaque capability pair: `choose`
//! picks a task from candidates, `predict_step` maps an observation to an
//! action sequence. Internals (nearest-neighbor heuristic, learned model,
//! random stub) are out of scope; the core only uses the first predicted
//! vector, clamped to the configured step size.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::domain::{EntityId, TaskId};
use crate::error::Result;
use crate::world::{planar_distance, WorldState};

/// Snapshot handed to `predict_step`: agent and target kinematics plus the
/// task slot for models that consume a one-hot task encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub agent_xy: [f64; 2],
    pub agent_vel: [f64; 2],
    pub target_xy: [f64; 2],
    pub target_vel: [f64; 2],
    pub task_slot: usize,
}

impl Observation {
    /// Gather an observation from the world for one agent/target pair.
    pub fn gather(
        world: &dyn WorldState,
        agent_body: EntityId,
        target: TaskId,
        task_slot: usize,
    ) -> Result<Self> {
        let agent_pos = world.position(agent_body)?;
        let target_pos = world.position(target)?;
        Ok(Self {
            agent_xy: [agent_pos[0], agent_pos[1]],
            agent_vel: world.velocity(agent_body)?,
            target_xy: [target_pos[0], target_pos[1]],
            target_vel: world.velocity(target)?,
            task_slot,
        })
    }
}

/// Tagged policy interface: both capabilities are explicit, no probing.
#[cfg_attr(test, mockall::automock)]
pub trait DecisionPolicy {
    /// Pick a task from the candidate pool for the agent body, or None when
    /// nothing is acceptable.
    fn choose(
        &self,
        agent_body: EntityId,
        world: &dyn WorldState,
        candidates: &[TaskId],
    ) -> Result<Option<TaskId>>;

    /// Predict an action sequence toward the observed target. Callers use
    /// only the first vector and clamp its magnitude.
    fn predict_step(&self, obs: &Observation) -> Result<Vec<[f64; 2]>>;
}

/// Greedy heuristic: nearest candidate wins, straight-line motion.
#[derive(Debug, Clone, Copy, Default)]
pub struct NearestTaskPolicy;

impl DecisionPolicy for NearestTaskPolicy {
    fn choose(
        &self,
        agent_body: EntityId,
        world: &dyn WorldState,
        candidates: &[TaskId],
    ) -> Result<Option<TaskId>> {
        let agent_pos = world.position(agent_body)?;
        let mut best: Option<(TaskId, f64)> = None;
        for task in candidates {
            let dist = planar_distance(agent_pos, world.position(*task)?);
            let closer = match best {
                Some((_, best_dist)) => dist < best_dist,
                None => true,
            };
            if closer {
                best = Some((*task, dist));
            }
        }
        Ok(best.map(|(task, _)| task))
    }

    fn predict_step(&self, obs: &Observation) -> Result<Vec<[f64; 2]>> {
        Ok(vec![[
            obs.target_xy[0] - obs.agent_xy[0],
            obs.target_xy[1] - obs.agent_xy[1],
        ]])
    }
}

/// Random stand-in for a learned model; satisfies tests without weights.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomPolicy;

impl DecisionPolicy for RandomPolicy {
    fn choose(
        &self,
        _agent_body: EntityId,
        _world: &dyn WorldState,
        candidates: &[TaskId],
    ) -> Result<Option<TaskId>> {
        Ok(candidates.choose(&mut rand::thread_rng()).copied())
    }

    fn predict_step(&self, _obs: &Observation) -> Result<Vec<[f64; 2]>> {
        let mut rng = rand::thread_rng();
        let angle: f64 = rng.gen_range(0.0..std::f64::consts::TAU);
        Ok(vec![[angle.cos(), angle.sin()]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::PlanarWorld;

    #[test]
    fn nearest_policy_prefers_closest_task() {
        let mut world = PlanarWorld::new();
        world.spawn(EntityId(1), [0.0, 0.0, 0.5]);
        world.spawn(EntityId(10), [2.0, 0.0, 0.5]);
        world.spawn(EntityId(11), [0.5, 0.0, 0.5]);

        let policy = NearestTaskPolicy;
        let picked = policy
            .choose(EntityId(1), &world, &[EntityId(10), EntityId(11)])
            .unwrap();
        assert_eq!(picked, Some(EntityId(11)));
    }

    #[test]
    fn nearest_policy_empty_pool_yields_none() {
        let mut world = PlanarWorld::new();
        world.spawn(EntityId(1), [0.0, 0.0, 0.5]);
        let policy = NearestTaskPolicy;
        assert_eq!(policy.choose(EntityId(1), &world, &[]).unwrap(), None);
    }

    #[test]
    fn predicted_step_points_at_target() {
        let policy = NearestTaskPolicy;
        let obs = Observation {
            agent_xy: [0.0, 0.0],
            agent_vel: [0.0, 0.0],
            target_xy: [1.0, 1.0],
            target_vel: [0.0, 0.0],
            task_slot: 0,
        };
        let steps = policy.predict_step(&obs).unwrap();
        assert_eq!(steps[0], [1.0, 1.0]);
    }
}
