//! Agent records: per-agent state plus the tick update function.

pub mod record;

pub use record::{AgentRecord, Engagement, TickContext, TickOutcome};
