//! Health checking for routed services
//!
//! Provides:
//! - The uniform probe capability and its concrete methods
//! - Per-check hysteresis (rise/fall) state tracking
//! - The scheduling loop that turns probe outcomes into route directives

pub mod methods;
pub mod probe;
pub mod runner;

pub use probe::{Probe, ProbeError, ProbeMethod};
pub use runner::{CheckRunner, HealthState};
