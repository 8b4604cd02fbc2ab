//! Full race flow over in-memory fakes: pre-search, scheduler fire, then
//! the post-reload autofill pass, sharing one persisted state surface the
//! way the real components share localStorage.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tixrace_autofill::probe::{ButtonState, PageProbe};
use tixrace_autofill::runner::AutofillRunner;
use tixrace_autofill::{AutofillError, Phase};
use tixrace_core_types::{
    DesiredTicket, PageKind, SaleWindow, SeatMode, SelectorSet, TicketCandidate,
};
use tixrace_matcher::find_match;
use tixrace_race_state::{MemoryStore, PreFire, RaceState};
use tixrace_scheduler::{
    ArmOutcome, FirePath, FrameTicker, RaceClock, SaleScheduler, ScheduleError,
};

struct SharedClock {
    now: Arc<Mutex<i64>>,
}

#[async_trait]
impl RaceClock for SharedClock {
    async fn now_ms(&self) -> Result<i64, ScheduleError> {
        let mut now = self.now.lock();
        *now += 1;
        Ok(*now)
    }
}

struct SharedTicker {
    now: Arc<Mutex<i64>>,
}

#[async_trait]
impl FrameTicker for SharedTicker {
    async fn tick(&self) {
        *self.now.lock() += 5;
    }
}

/// Fire path standing in for the page reload: records that it ran.
struct RecordedFire {
    fired: Arc<Mutex<bool>>,
}

#[async_trait]
impl FirePath for RecordedFire {
    async fn fire(&self) -> Result<(), ScheduleError> {
        *self.fired.lock() = true;
        Ok(())
    }
}

/// Post-reload sale listing: the target unit is rendered, the next button
/// needs a couple of polls to enable, and clicking lands on checkout.
struct PostReloadListing {
    button_polls: Mutex<u64>,
    clicked: Mutex<bool>,
    terms_checked: Mutex<bool>,
    typed: Mutex<Option<String>>,
}

impl PostReloadListing {
    fn new() -> Self {
        Self {
            button_polls: Mutex::new(0),
            clicked: Mutex::new(false),
            terms_checked: Mutex::new(false),
            typed: Mutex::new(None),
        }
    }

    fn units(&self) -> Vec<TicketCandidate> {
        vec![
            TicketCandidate {
                name1: "一般票".to_string(),
                name2: String::new(),
                seat_label: "電腦配位".to_string(),
                price: Some(800),
                element_id: Some("unit-0".to_string()),
                dom_index: 0,
            },
            TicketCandidate {
                name1: "VIP".to_string(),
                name2: String::new(),
                seat_label: "電腦配位".to_string(),
                price: Some(1800),
                element_id: Some("unit-1".to_string()),
                dom_index: 1,
            },
        ]
    }
}

#[async_trait]
impl PageProbe for PostReloadListing {
    async fn detect_page_kind(&self) -> Result<PageKind, AutofillError> {
        if *self.clicked.lock() {
            Ok(PageKind::Payment)
        } else {
            Ok(PageKind::SaleListing)
        }
    }

    async fn reload_evidence(&self) -> Result<bool, AutofillError> {
        Ok(true)
    }

    async fn extract_candidates(
        &self,
        _selectors: &SelectorSet,
    ) -> Result<Vec<TicketCandidate>, AutofillError> {
        Ok(self.units())
    }

    async fn quantity_input_present(
        &self,
        _unit_index: usize,
        _selectors: &SelectorSet,
    ) -> Result<bool, AutofillError> {
        Ok(true)
    }

    async fn type_quantity(
        &self,
        _unit_index: usize,
        _selectors: &SelectorSet,
        quantity: &str,
    ) -> Result<(), AutofillError> {
        *self.typed.lock() = Some(quantity.to_string());
        Ok(())
    }

    async fn terms_checkbox(
        &self,
        _selectors: &SelectorSet,
    ) -> Result<Option<bool>, AutofillError> {
        Ok(Some(*self.terms_checked.lock()))
    }

    async fn click_terms(&self, _selectors: &SelectorSet) -> Result<(), AutofillError> {
        *self.terms_checked.lock() = true;
        Ok(())
    }

    async fn next_button(&self, _selectors: &SelectorSet) -> Result<ButtonState, AutofillError> {
        let mut polls = self.button_polls.lock();
        *polls += 1;
        if *polls > 2 {
            Ok(ButtonState::Ready)
        } else {
            Ok(ButtonState::Disabled)
        }
    }

    async fn click_next(&self, _selectors: &SelectorSet) -> Result<(), AutofillError> {
        *self.clicked.lock() = true;
        Ok(())
    }
}

#[tokio::test]
async fn presearch_fire_and_autofill_share_one_state_surface() {
    let state = RaceState::new(Arc::new(MemoryStore::new()));
    let selectors = SelectorSet::default();
    let desired = DesiredTicket::from_user_input("VIP", "", "1800", "2", SeatMode::AutoAllocate);

    // Pre-race: match against the calm listing and persist the descriptor.
    let listing = PostReloadListing::new();
    let descriptor = find_match(&desired, &listing.units(), &selectors).unwrap();
    assert_eq!(descriptor.candidate_index, Some(1));
    state.save_descriptor(&descriptor).await.unwrap();
    state.reset_for_new_attempt().await.unwrap();

    // Race: the scheduler counts down on the shared clock and fires.
    let now = Arc::new(Mutex::new(9_000_i64));
    let fired = Arc::new(Mutex::new(false));
    let scheduler = SaleScheduler::new(
        SharedClock { now: now.clone() },
        SharedTicker { now: now.clone() },
        RecordedFire {
            fired: fired.clone(),
        },
        state.clone(),
    );
    let outcome = scheduler.arm(SaleWindow::new(10_000, 0)).await.unwrap();
    assert_eq!(outcome, ArmOutcome::Fired);
    assert!(*fired.lock());
    assert_eq!(state.pre_fire().await.unwrap(), PreFire::Armed);
    assert!(state.timer_fired().await.unwrap());

    // Post-reload: the autofill pass resumes off the persisted evidence.
    let runner = AutofillRunner::new(listing, state.clone());
    let phase = runner.run_once().await.unwrap();
    assert_eq!(phase, Phase::PaymentPageReached);

    // Terminal taxonomy: everything set, pre-fire consumed.
    assert!(state.payment_page_reached().await.unwrap());
    assert!(state.autofill_ever_completed().await.unwrap());
    assert_eq!(state.pre_fire().await.unwrap(), PreFire::Done);

    // A second pass (stray reload) is a no-op.
    let runner_again = AutofillRunner::new(PostReloadListing::new(), state.clone());
    assert_eq!(runner_again.run_once().await.unwrap(), Phase::Aborted);
}

#[tokio::test]
async fn rescan_descriptor_matches_units_that_render_at_open() {
    // Pre-race the unit was absent; the stash carries predicates only.
    let state = RaceState::new(Arc::new(MemoryStore::new()));
    let desired = DesiredTicket::from_user_input("VIP", "", "1800", "1", SeatMode::AutoAllocate);
    let descriptor = tixrace_core_types::MatchDescriptor {
        candidate_index: None,
        candidate_id: None,
        desired,
        selectors: SelectorSet::default(),
    };
    state.save_descriptor(&descriptor).await.unwrap();
    state.mark_timer_fired().await.unwrap();

    let listing = PostReloadListing::new();
    let runner = AutofillRunner::new(listing, state.clone());
    let phase = runner.run_once().await.unwrap();

    assert_eq!(phase, Phase::PaymentPageReached);
    assert!(state.payment_page_reached().await.unwrap());
}
