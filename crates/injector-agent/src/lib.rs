//! Injection agent runtime
//!
//! Wires the storage contract, the cloud API, the namespace manager, the
//! proxy supervisor and the ingress multiplexer into one control loop:
//!
//! - [`EndpointReconciler`] lists endpoints needing work and drives each one
//!   through its status state machine inside a row-locked transaction
//! - [`CloudPortResolver`] enables or disables the injection of one endpoint
//! - [`JobScheduler`] runs one deduplicated task per endpoint
//! - [`StatsRegistry`] holds the latest proxy counters

pub mod agent;
pub mod config;
pub mod reconciler;
pub mod resolver;
pub mod scheduler;
pub mod stats;

pub use agent::{Agent, AgentError};
pub use config::{AgentConfig, ConfigError, ServiceSettings};
pub use reconciler::{EndpointReconciler, ReconcileError, Transition};
pub use resolver::{CloudPortResolver, ResolverError};
pub use scheduler::{JobScheduler, SchedulerError};
pub use stats::StatsRegistry;
