//! Beat library for host metrics shipping
//!
//! This crate provides the core functionality for:
//! - Polling host metrics from the proc filesystem
//! - Building flat, timestamped events from raw samples
//! - Batching, retrying and delivering events to an output
//! - Lifecycle supervision with graceful drain
//! - Health checks and observability

pub mod builder;
pub mod clock;
pub mod collector;
pub mod config;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod output;
pub mod state;
pub mod supervisor;

pub use config::{BeatConfig, BEAT_NAME};
pub use error::{
    AgentError, CollectError, ConfigError, DrainTimeout, ErrorKind, SendError, StateError,
    ValidationError,
};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{BeatMetrics, StructuredLogger};
pub use state::{AgentState, AgentStateHandle, ReadinessEvent};
pub use supervisor::{RunOutcome, Supervisor};
