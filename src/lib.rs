pub mod agent;
pub mod allocator;
pub mod assist;
pub mod bus;
pub mod config;
pub mod domain;
pub mod error;
pub mod policy;
pub mod scenario;
pub mod sim;
pub mod world;

pub use agent::{AgentRecord, Engagement, TickContext, TickOutcome};
pub use allocator::{AllocationCoordinator, AllocationReport, Claim, ClaimResponse};
pub use assist::AssistCoordinator;
pub use bus::{Message, MessageBus, MessageKind, MessageStatus, Recipient};
pub use config::AppConfig;
pub use domain::{EntityId, TaskBook, TaskId, TaskKind};
pub use error::{MeshError, Result};
pub use policy::{DecisionPolicy, NearestTaskPolicy, Observation, RandomPolicy};
pub use scenario::Scenario;
pub use sim::{SimReport, Simulation, TickReport};
pub use world::{planar_distance, PlanarWorld, Position, Velocity, WorldState};
