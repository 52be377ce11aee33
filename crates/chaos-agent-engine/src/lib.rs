//! Fault handlers, the cron scheduler and the lifecycle engine that ties
//! them to an [`chaos_agent_core::ExperimentStore`].

pub mod cancel;
pub mod clock;
pub mod config;
mod engine;
pub mod fault;
pub mod handlers;
pub mod registry;
pub mod scheduler;

pub use cancel::{CancelReason, Cancellation};
pub use clock::{parse_clock_ids, ClockAttack};
pub use config::{Attack, FaultConfig, Schedule};
pub use engine::Engine;
pub use fault::{Fault, HandlerEnv};
pub use registry::{descriptor, HandlerDescriptor};
