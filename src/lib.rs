//! Cohort - Multi-agent routing and coordination engine
//!
//! This library decides which execution path and which collaborating
//! agents should run each incoming task, dispatches the work, reconciles
//! the resulting outputs, and tracks the lifecycle of the execution.

pub mod agent;
pub mod aggregate;
pub mod bus;
pub mod config;
pub mod conflict;
pub mod context;
pub mod logging;
pub mod orchestrator;
pub mod routing;
pub mod session;
pub mod telemetry;
