//! Capability interface over the one site-specific DOM layer.
//!
//! The state machine senses and drives the page exclusively through this
//! trait, so the single site implementation can be swapped for a scripted
//! fake in tests without touching the machine itself.

use async_trait::async_trait;
use tixrace_core_types::{PageKind, SelectorSet, TicketCandidate};

use crate::AutofillError;

/// Observed state of the next/continue control.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ButtonState {
    Missing,
    /// Present but not clickable (disabled attribute, disabled classes, or
    /// hidden by computed style).
    Disabled,
    Ready,
}

#[async_trait]
pub trait PageProbe: Send + Sync {
    /// Classify the current document. Payment detection is positive
    /// identification (confirm-order control present) and implementations
    /// cache a positive result for the lifetime of the load.
    async fn detect_page_kind(&self) -> Result<PageKind, AutofillError>;

    /// Whether the browser reports this load as a reload.
    async fn reload_evidence(&self) -> Result<bool, AutofillError>;

    /// Snapshot every rendered ticket unit. May legitimately be empty while
    /// the listing is still rendering.
    async fn extract_candidates(
        &self,
        selectors: &SelectorSet,
    ) -> Result<Vec<TicketCandidate>, AutofillError>;

    /// Whether the quantity input exists inside the given unit.
    async fn quantity_input_present(
        &self,
        unit_index: usize,
        selectors: &SelectorSet,
    ) -> Result<bool, AutofillError>;

    /// Type the quantity into the unit's input with keystroke-level event
    /// dispatch (the page's reactive framework listens for input events,
    /// not value assignment).
    async fn type_quantity(
        &self,
        unit_index: usize,
        selectors: &SelectorSet,
        quantity: &str,
    ) -> Result<(), AutofillError>;

    /// Terms checkbox state: `None` when the flow has no checkbox,
    /// `Some(checked)` otherwise.
    async fn terms_checkbox(&self, selectors: &SelectorSet) -> Result<Option<bool>, AutofillError>;

    async fn click_terms(&self, selectors: &SelectorSet) -> Result<(), AutofillError>;

    async fn next_button(&self, selectors: &SelectorSet) -> Result<ButtonState, AutofillError>;

    /// Click the next/continue control. Implementations fall back to a
    /// synthetic click event when the direct click throws.
    async fn click_next(&self, selectors: &SelectorSet) -> Result<(), AutofillError>;
}
