//! Post-reload autofill state machine.
//!
//! Runs one re-entrant pass per page load: decide from the persisted race
//! state whether this load is a race resume at all, re-locate the matched
//! ticket under the fresh DOM, fill the quantity, accept terms and advance
//! to checkout, terminating permanently once a payment page is detected.
//!
//! The entry decision is a pure function ([`decide`]) evaluated once per
//! load; every side effect lives in the [`runner::AutofillRunner`]. All
//! waits are cooperative yields; nothing here blocks the page.

pub mod probe;
pub mod retry;
pub mod runner;

use thiserror::Error;
use tixrace_core_types::PageKind;
use tixrace_race_state::{PreFire, StoreError};

#[derive(Debug, Error)]
pub enum AutofillError {
    #[error("page probe failure: {0}")]
    Probe(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Phases of the per-load pass. `PaymentPageReached` and `Aborted` are
/// terminal for the whole sale attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    Idle,
    LocatingTarget,
    FillingQuantity,
    AcceptingTerms,
    AdvancingCheckout,
    PaymentPageReached,
    Aborted,
}

/// Snapshot of the persisted flags plus the page-local reload evidence,
/// taken once at the start of a load.
#[derive(Clone, Copy, Debug)]
pub struct FlagsSnapshot {
    pub payment_page_reached: bool,
    pub timer_fired: bool,
    pub pre_fire: PreFire,
    pub autofill_ever_completed: bool,
    /// Navigation-type signal: the browser reports this load was a reload.
    pub reload_evidence: bool,
}

impl FlagsSnapshot {
    /// Positive evidence that this load was caused by the scheduler (or at
    /// least is a reload worth resuming into).
    pub fn has_resume_evidence(&self) -> bool {
        matches!(self.pre_fire, PreFire::Armed) || self.timer_fired || self.reload_evidence
    }
}

/// Per-load entry decision.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Entry {
    /// Payment flag already set: no-op immediately, overriding everything.
    Abort,
    /// The current document is a checkout page: persist the terminal flags.
    FinalizePayment,
    /// Run the fill sequence (clearing a stale completion marker first if
    /// one is present alongside fresh evidence).
    Resume,
    /// Not a scheduler-caused load, or already finished: do nothing.
    StayIdle,
}

/// Pure entry decision, highest-priority check first.
pub fn decide(flags: &FlagsSnapshot, page: PageKind) -> Entry {
    if flags.payment_page_reached {
        return Entry::Abort;
    }
    if page == PageKind::Payment {
        return Entry::FinalizePayment;
    }
    if !flags.has_resume_evidence() {
        // Covers both the unrelated-visit case and the finished-earlier
        // case; a completed run without fresh evidence stays idle.
        return Entry::StayIdle;
    }
    Entry::Resume
}
