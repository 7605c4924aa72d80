//! Core types for the Foreman kernel.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (FunctionId, FlowId, etc.)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Kernel deadline configuration

mod config;
mod errors;
mod ids;

pub use config::KernelConfig;
pub use errors::{Error, Result};
pub use ids::{
    FlowId, FunctionId, GovernanceId, HandleId, JobId, ProcessId, ResourceId, StrategyId, TeamId,
    ThreadContextId,
};
