//! Target matcher: picks the ticket unit the user asked for out of the
//! rendered candidate list, and re-locates it after a reload.
//!
//! Matching is a plain document-order scan with four independent predicates
//! (primary name, secondary name, seat label, price); a predicate whose
//! must-check flag is off is vacuously true. The first candidate satisfying
//! all four wins, with no scoring.
//!
//! Re-resolution runs a three-tier fallback because element position and
//! identity are not stable across a hard reload while the semantic
//! attributes are: positional hint first, stable element id second, full
//! predicate re-scan last.

use thiserror::Error;
use tixrace_core_types::{DesiredTicket, MatchDescriptor, SelectorSet, TicketCandidate};
use tracing::debug;

#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum MatchError {
    /// No candidate satisfied the checked predicates. Callers poll and
    /// retry; the listing may render asynchronously after navigation.
    #[error("no candidate matched the desired ticket")]
    NotFound,
}

/// Evaluate the four predicates against one candidate.
pub fn candidate_matches(desired: &DesiredTicket, candidate: &TicketCandidate) -> bool {
    let ok_name1 = match &desired.name1 {
        Some(want) => candidate.name1 == *want,
        None => true,
    };
    let ok_name2 = match &desired.name2 {
        Some(want) => candidate.name2 == *want,
        None => true,
    };
    // Seat type is always constrained; it comes from a non-optional toggle.
    let ok_seat = candidate.seat_label == desired.seat_mode.label();
    let ok_price = match desired.price {
        // A candidate with no rendered price fails an exact-price check.
        Some(want) => candidate.price == Some(want),
        None => true,
    };
    ok_name1 && ok_name2 && ok_seat && ok_price
}

/// Scan candidates in document order and return a descriptor for the first
/// one satisfying every checked predicate.
pub fn find_match(
    desired: &DesiredTicket,
    candidates: &[TicketCandidate],
    selectors: &SelectorSet,
) -> Result<MatchDescriptor, MatchError> {
    for candidate in candidates {
        if candidate_matches(desired, candidate) {
            debug!(
                target: "matcher",
                index = candidate.dom_index,
                id = candidate.element_id.as_deref().unwrap_or("-"),
                "candidate matched"
            );
            return Ok(MatchDescriptor {
                candidate_index: Some(candidate.dom_index),
                candidate_id: candidate.element_id.clone(),
                desired: desired.clone(),
                selectors: selectors.clone(),
            });
        }
    }
    Err(MatchError::NotFound)
}

/// Re-locate the matched ticket in a fresh candidate list.
///
/// Tier 1: the positional hint, accepted only while the candidate sitting at
/// that index still satisfies the desired predicates (a reordered list makes
/// the hint stale, not merely out of range). Tier 2: stable element id.
/// Tier 3: full predicate re-scan.
pub fn resolve(
    descriptor: &MatchDescriptor,
    candidates: &[TicketCandidate],
) -> Result<usize, MatchError> {
    if let Some(index) = descriptor.candidate_index {
        if let Some(candidate) = candidates.get(index) {
            if candidate_matches(&descriptor.desired, candidate) {
                return Ok(index);
            }
            debug!(target: "matcher", index, "positional hint stale, falling back");
        }
    }

    if let Some(id) = &descriptor.candidate_id {
        if let Some(position) = candidates
            .iter()
            .position(|c| c.element_id.as_deref() == Some(id.as_str()))
        {
            return Ok(position);
        }
        debug!(target: "matcher", id = id.as_str(), "id hint missing, re-scanning");
    }

    candidates
        .iter()
        .position(|c| candidate_matches(&descriptor.desired, c))
        .ok_or(MatchError::NotFound)
}
