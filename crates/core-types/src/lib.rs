//! Shared data model for the tixrace sale-open race engine.
//!
//! These types cross the crate boundaries between the matcher, the persisted
//! race state, the scheduler and the autofill state machine. They carry no
//! I/O; everything here is plain data plus derivation helpers.

use serde::{Deserialize, Serialize};

/// Seat allocation mode offered by the sale page.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SeatMode {
    /// The site assigns seats automatically.
    AutoAllocate,
    /// The buyer picks seats manually.
    ManualSeat,
}

impl SeatMode {
    /// Rendered seat-type text on the KKTIX ticket unit for this mode.
    pub fn label(&self) -> &'static str {
        match self {
            SeatMode::AutoAllocate => "電腦配位",
            SeatMode::ManualSeat => "自行選位",
        }
    }
}

/// Immutable snapshot of what the user wants to buy.
///
/// `None` in an optional field means "do not constrain this attribute", not
/// "match empty". The `check_*` accessors expose the derived must-check
/// flags; the seat label is always checked.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DesiredTicket {
    pub name1: Option<String>,
    pub name2: Option<String>,
    pub price: Option<u32>,
    pub seat_mode: SeatMode,
    /// Kept as a string for form-entry fidelity (typed digit by digit).
    pub quantity: String,
}

impl DesiredTicket {
    /// Build a desired ticket from raw user input, deriving the must-check
    /// flags: empty or whitespace-only input means "don't constrain".
    pub fn from_user_input(
        name1: &str,
        name2: &str,
        price: &str,
        quantity: &str,
        seat_mode: SeatMode,
    ) -> Self {
        let price = non_empty(price).and_then(|p| p.parse::<u32>().ok());
        let quantity = non_empty(quantity).unwrap_or_else(|| "1".to_string());
        Self {
            name1: non_empty(name1),
            name2: non_empty(name2),
            price,
            seat_mode,
            quantity,
        }
    }

    pub fn check_name1(&self) -> bool {
        self.name1.is_some()
    }

    pub fn check_name2(&self) -> bool {
        self.name2.is_some()
    }

    pub fn check_price(&self) -> bool {
        self.price.is_some()
    }
}

fn non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// One rendered ticket unit read from the live page.
///
/// Recreated on every DOM query; valid only for the snapshot it came from.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TicketCandidate {
    /// Primary label, direct text content only (nested badges excluded).
    pub name1: String,
    /// Secondary label, full text, whitespace-collapsed.
    pub name2: String,
    /// Seat-type text as rendered.
    pub seat_label: String,
    /// Digits-only parse of the price element; `None` when not rendered.
    pub price: Option<u32>,
    /// Stable element id attribute when the markup provides one.
    pub element_id: Option<String>,
    /// Position in the candidate list at extraction time.
    pub dom_index: usize,
}

/// Named CSS locators for the sale page markup.
///
/// Externalized so a site markup change only requires updating this table.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SelectorSet {
    pub unit: String,
    pub name: String,
    pub name2: String,
    pub seat: String,
    pub price: String,
    pub qty_input: String,
    pub agree: String,
    pub next_btn: String,
}

impl Default for SelectorSet {
    fn default() -> Self {
        Self {
            unit: ".ticket-unit.ng-scope".to_string(),
            name: ".ticket-name.ng-binding".to_string(),
            name2: ".small.text-muted.ng-binding.ng-scope".to_string(),
            seat: ".ticket-seat.ng-binding.ng-scope".to_string(),
            price: "span[ng-if=\"ticket.price.cents > 0\"].ng-binding.ng-scope".to_string(),
            qty_input: "input[ng-model=\"ticketModel.quantity\"]".to_string(),
            agree: "#person_agree_terms".to_string(),
            next_btn: ".register-new-next-button-area button".to_string(),
        }
    }
}

/// Persisted result of a successful match, used to re-locate the target
/// after the deliberate reload.
///
/// `candidate_index` is a best-effort positional hint and `candidate_id` a
/// reorder-resistant fallback; `desired` allows a full predicate re-scan
/// when both hints fail.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MatchDescriptor {
    pub candidate_index: Option<usize>,
    pub candidate_id: Option<String>,
    pub desired: DesiredTicket,
    pub selectors: SelectorSet,
}

/// Absolute sale-open instant plus the measured page-vs-controller clock
/// difference, fixed once at injection time.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SaleWindow {
    /// Sale-open instant as unix milliseconds (controller reference).
    pub target_ms: i64,
    /// Page clock minus controller clock, in milliseconds.
    pub clock_offset_ms: i64,
}

impl SaleWindow {
    pub fn new(target_ms: i64, clock_offset_ms: i64) -> Self {
        Self {
            target_ms,
            clock_offset_ms,
        }
    }

    /// The target instant expressed on the page's own clock. All runtime
    /// countdown comparisons use this value.
    pub fn aim_page_ms(&self) -> i64 {
        self.target_ms + self.clock_offset_ms
    }
}

/// Classification of the current document.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum PageKind {
    /// The ticket listing the race runs against.
    SaleListing,
    /// Checkout / payment confirmation; terminal for the whole flow.
    Payment,
    /// Anything else (interstitials, login, unrelated pages).
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desired_ticket_derives_check_flags_from_input() {
        let desired = DesiredTicket::from_user_input("VIP", "", "1200", "2", SeatMode::AutoAllocate);
        assert!(desired.check_name1());
        assert!(!desired.check_name2());
        assert!(desired.check_price());
        assert_eq!(desired.price, Some(1200));
        assert_eq!(desired.quantity, "2");
    }

    #[test]
    fn blank_quantity_defaults_to_one() {
        let desired = DesiredTicket::from_user_input("", "", "", "  ", SeatMode::ManualSeat);
        assert_eq!(desired.quantity, "1");
        assert!(!desired.check_name1());
        assert!(!desired.check_price());
    }

    #[test]
    fn sale_window_aims_on_the_page_clock() {
        let window = SaleWindow::new(1_000_000, -250);
        assert_eq!(window.aim_page_ms(), 999_750);
    }

    #[test]
    fn match_descriptor_round_trips_through_json() {
        let descriptor = MatchDescriptor {
            candidate_index: Some(3),
            candidate_id: Some("unit-7".to_string()),
            desired: DesiredTicket::from_user_input("A", "B", "800", "1", SeatMode::AutoAllocate),
            selectors: SelectorSet::default(),
        };
        let json = serde_json::to_string(&descriptor).unwrap();
        let back: MatchDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, descriptor);
    }
}
