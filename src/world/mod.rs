//! World state interface: the simulation's position store.
//!
//! The protocol core treats the world purely as a key-value position store:
//! it never interprets orientation or physics beyond 2D planar distance.
//! `PlanarWorld` is the in-memory implementation used by the scenario
//! builder and tests; a physics engine adapter would implement the same
//! trait.

use std::collections::HashMap;

use crate::domain::EntityId;
use crate::error::{MeshError, Result};

/// World position (x, y, z). The protocol only reads x/y.
pub type Position = [f64; 3];

/// Planar velocity (vx, vy).
pub type Velocity = [f64; 2];

/// Position store consumed by the protocol core.
pub trait WorldState {
    fn position(&self, id: EntityId) -> Result<Position>;
    fn velocity(&self, id: EntityId) -> Result<Velocity>;
    fn set_position(&mut self, id: EntityId, pos: Position) -> Result<()>;
}

/// Planar distance between two world positions (xy only).
pub fn planar_distance(a: Position, b: Position) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    (dx * dx + dy * dy).sqrt()
}

/// Clamp a displacement to a maximum step magnitude. Steps shorter than
/// the dead zone collapse to zero so noise never registers as motion.
pub fn clamp_step(step: [f64; 2], max_step: f64) -> [f64; 2] {
    let norm = (step[0] * step[0] + step[1] * step[1]).sqrt();
    if norm < 1e-9 {
        return [0.0, 0.0];
    }
    if norm <= max_step {
        return step;
    }
    [step[0] / norm * max_step, step[1] / norm * max_step]
}

/// In-memory world: a flat map of entity positions and velocities.
#[derive(Debug, Clone, Default)]
pub struct PlanarWorld {
    positions: HashMap<EntityId, Position>,
    velocities: HashMap<EntityId, Velocity>,
}

impl PlanarWorld {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a body at a starting position with zero velocity.
    pub fn spawn(&mut self, id: EntityId, pos: Position) {
        self.positions.insert(id, pos);
        self.velocities.insert(id, [0.0, 0.0]);
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.positions.contains_key(&id)
    }
}

impl WorldState for PlanarWorld {
    fn position(&self, id: EntityId) -> Result<Position> {
        self.positions
            .get(&id)
            .copied()
            .ok_or(MeshError::UnknownEntity(id))
    }

    fn velocity(&self, id: EntityId) -> Result<Velocity> {
        self.velocities
            .get(&id)
            .copied()
            .ok_or(MeshError::UnknownEntity(id))
    }

    fn set_position(&mut self, id: EntityId, pos: Position) -> Result<()> {
        let prev = self
            .positions
            .get_mut(&id)
            .ok_or(MeshError::UnknownEntity(id))?;
        self.velocities
            .insert(id, [pos[0] - prev[0], pos[1] - prev[1]]);
        *prev = pos;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_entity_is_an_error_not_a_panic() {
        let world = PlanarWorld::new();
        assert!(matches!(
            world.position(EntityId(99)),
            Err(MeshError::UnknownEntity(_))
        ));
    }

    #[test]
    fn clamp_step_bounds_magnitude() {
        let step = clamp_step([3.0, 4.0], 0.01);
        let norm = (step[0] * step[0] + step[1] * step[1]).sqrt();
        assert!((norm - 0.01).abs() < 1e-12);
        // Short steps pass through unchanged.
        assert_eq!(clamp_step([0.001, 0.0], 0.01), [0.001, 0.0]);
        // Near-zero steps collapse.
        assert_eq!(clamp_step([1e-12, 0.0], 0.01), [0.0, 0.0]);
    }

    #[test]
    fn set_position_tracks_velocity() {
        let mut world = PlanarWorld::new();
        world.spawn(EntityId(1), [0.0, 0.0, 0.5]);
        world.set_position(EntityId(1), [0.01, 0.0, 0.5]).unwrap();
        let vel = world.velocity(EntityId(1)).unwrap();
        assert!((vel[0] - 0.01).abs() < 1e-12);
    }

    #[test]
    fn planar_distance_ignores_z() {
        assert!((planar_distance([0.0, 0.0, 0.5], [3.0, 4.0, 9.0]) - 5.0).abs() < 1e-12);
    }
}
