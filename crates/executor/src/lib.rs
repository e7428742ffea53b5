//! Tick-driven execution over the world state registry.
//!
//! The executor owns a dedicated tick thread. Registered systems run once
//! per tick in a stable order; a system that keeps failing is isolated with
//! an escalating cooldown instead of taking the loop down. All external
//! writes funnel through a mutation queue drained at tick boundaries, so
//! systems observe a stable state within a tick.

pub mod executor;
pub mod isolation;

pub use executor::{
    ExecutorConfig, ExecutorError, ExecutorStatus, SystemError, SystemStatus, TickContext,
    TickExecutor,
};
pub use isolation::{FaultIsolationController, IsolationPolicy, IsolationSnapshot};
