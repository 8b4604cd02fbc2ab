//! Browser session provider over the Chrome DevTools Protocol, plus the
//! KKTIX-specific page strategies built on top of it.
//!
//! The transport drives a chromiumoxide [`Connection`] as a raw CDP pipe:
//! commands are submitted by method name with JSON params, responses are
//! routed back through oneshot channels keyed by call id. Everything above
//! that speaks [`PageSession`], so the race components never see CDP.
//!
//! [`Connection`]: chromiumoxide::conn::Connection

pub mod auth;
pub mod js;
pub mod launch;
pub mod probe;
pub mod session;
pub mod store;
pub mod timing;
pub mod transport;

use thiserror::Error;

pub use auth::{Credentials, GuestModalAuthenticator};
pub use launch::SessionConfig;
pub use probe::KktixProbe;
pub use session::{Browser, CdpPage, PageSession};
pub use store::LocalStorageStore;
pub use timing::{measure_clock_offset, CdpRaceClock, IntervalTicker, ReloadFirePath};

#[derive(Debug, Error, Clone)]
pub enum SessionError {
    #[error("chrome launch failed: {0}")]
    Launch(String),
    #[error("cdp i/o failure: {0}")]
    Io(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("javascript evaluation failed: {0}")]
    Js(String),
    #[error("unexpected {method} payload: {reason}")]
    Payload { method: String, reason: String },
}

impl SessionError {
    pub(crate) fn payload(method: &str, reason: impl Into<String>) -> Self {
        Self::Payload {
            method: method.to_string(),
            reason: reason.into(),
        }
    }
}
