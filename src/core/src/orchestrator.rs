//! Instance registry and lifecycle orchestration.
//!
//! The [`Orchestrator`] owns every [`Instance`] known to this node. Each
//! instance carries its state machine behind an async mutex, so at most one
//! lifecycle operation runs per instance while different instances proceed
//! independently. Runtime events are correlated to instances through the
//! container labels and turned into state transitions under the same lock.
//!
//! Re-exports:
//! - [`Orchestrator`]: power operations, queries and event handling.
//! - [`Instance`]: one managed instance.
//! - [`PowerOutcome`], [`InstanceSummary`], [`StatsSubscription`].

pub mod instance;
pub mod instance_manager;
pub mod types;

pub use instance::Instance;
pub use instance_manager::Orchestrator;
pub use types::{InstanceSummary, PowerOutcome, StatsSubscription};
