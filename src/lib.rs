//! tixrace: timed sale-open race automation for KKTIX ticket pages.
//!
//! The library surface is thin; the real machinery lives in the workspace
//! crates (matcher, race-state, scheduler, autofill, cdp-session). This
//! crate adds the user configuration layer and the orchestrator that wires
//! one sale attempt together.

pub mod config;
pub mod orchestrator;

pub use config::{ConfigError, UserConfig};
pub use orchestrator::Orchestrator;
