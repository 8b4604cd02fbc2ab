//! The per-load autofill pass: all side effects of the state machine.

use std::time::Duration;

use tixrace_core_types::PageKind;
use tixrace_race_state::RaceState;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::probe::{ButtonState, PageProbe};
use crate::retry::RetryPolicy;
use crate::{decide, AutofillError, Entry, FlagsSnapshot, Phase};

#[derive(Clone, Copy, Debug)]
pub struct AutofillConfig {
    /// Polling for the matched unit and its quantity input.
    pub locate: RetryPolicy,
    /// Polling for the next button to become present and enabled.
    pub advance: RetryPolicy,
    /// Re-check for a payment redirect every this many polling attempts;
    /// `0` disables the re-check.
    pub payment_recheck_every: u64,
    /// Settle time between clicking next and re-detecting the page kind.
    pub settle_after_click: Duration,
}

impl Default for AutofillConfig {
    fn default() -> Self {
        Self {
            locate: RetryPolicy::unbounded(Duration::from_millis(60)),
            advance: RetryPolicy::unbounded(Duration::from_millis(40)),
            payment_recheck_every: 50,
            settle_after_click: Duration::from_millis(1000),
        }
    }
}

pub struct AutofillRunner<P> {
    probe: P,
    state: RaceState,
    cfg: AutofillConfig,
}

impl<P: PageProbe> AutofillRunner<P> {
    pub fn new(probe: P, state: RaceState) -> Self {
        Self::with_config(probe, state, AutofillConfig::default())
    }

    pub fn with_config(probe: P, state: RaceState, cfg: AutofillConfig) -> Self {
        Self { probe, state, cfg }
    }

    /// Execute one pass for the current page load.
    ///
    /// `PaymentPageReached` and `Aborted` are terminal for the attempt.
    /// `AdvancingCheckout` means the single best-effort pass finished
    /// without confirming a checkout page; there is no loop back.
    pub async fn run_once(&self) -> Result<Phase, AutofillError> {
        let flags = self.snapshot_flags().await?;
        let page = self.probe.detect_page_kind().await?;

        match decide(&flags, page) {
            Entry::Abort => {
                debug!(target: "autofill", "payment already reached, pass is a no-op");
                return Ok(Phase::Aborted);
            }
            Entry::FinalizePayment => {
                info!(target: "autofill", "landed on a payment page, finalizing");
                self.finalize().await?;
                return Ok(Phase::PaymentPageReached);
            }
            Entry::StayIdle => {
                debug!(target: "autofill", "no resume evidence, staying idle");
                return Ok(Phase::Idle);
            }
            Entry::Resume => {}
        }

        if flags.autofill_ever_completed {
            // Fresh evidence alongside a stale completion marker: a new
            // race cycle superseded the old run.
            self.state.clear_autofill_completed().await?;
        }

        let descriptor = match self.state.load_descriptor().await? {
            Some(descriptor) => descriptor,
            None => {
                debug!(target: "autofill", "no armed presearch stash, staying idle");
                return Ok(Phase::Idle);
            }
        };

        // LocatingTarget: poll for the matched unit and its quantity input.
        let mut locating = self.cfg.locate.start();
        let unit_index = loop {
            if self.payment_recheck_due(locating.attempts()) {
                if self.state.payment_page_reached().await? {
                    return Ok(Phase::Aborted);
                }
                if self.probe.detect_page_kind().await? == PageKind::Payment {
                    info!(target: "autofill", "payment page appeared while locating");
                    self.finalize().await?;
                    return Ok(Phase::PaymentPageReached);
                }
            }

            let candidates = self.probe.extract_candidates(&descriptor.selectors).await?;
            if let Ok(index) = tixrace_matcher::resolve(&descriptor, &candidates) {
                if self
                    .probe
                    .quantity_input_present(index, &descriptor.selectors)
                    .await?
                {
                    break index;
                }
            }

            if locating.expired() {
                debug!(target: "autofill", "locate window expired without a target");
                return Ok(Phase::LocatingTarget);
            }
            locating.pause().await;
        };
        debug!(target: "autofill", unit_index, "target located");

        // FillingQuantity: keystroke dispatch, best effort, no read-back.
        if let Err(err) = self
            .probe
            .type_quantity(unit_index, &descriptor.selectors, &descriptor.desired.quantity)
            .await
        {
            warn!(target: "autofill", %err, "quantity fill failed, advancing anyway");
        }

        // AcceptingTerms: click only a present, unchecked box; never fails.
        match self.probe.terms_checkbox(&descriptor.selectors).await {
            Ok(Some(false)) => {
                if let Err(err) = self.probe.click_terms(&descriptor.selectors).await {
                    warn!(target: "autofill", %err, "terms click failed, skipping");
                }
            }
            Ok(Some(true)) => debug!(target: "autofill", "terms already accepted"),
            Ok(None) => debug!(target: "autofill", "no terms checkbox in this flow"),
            Err(err) => warn!(target: "autofill", %err, "terms lookup failed, skipping"),
        }

        // AdvancingCheckout: wait for present *and* enabled, then click once.
        let mut advancing = self.cfg.advance.start();
        loop {
            if self.payment_recheck_due(advancing.attempts())
                && self.state.payment_page_reached().await?
            {
                return Ok(Phase::Aborted);
            }
            match self.probe.next_button(&descriptor.selectors).await? {
                ButtonState::Ready => break,
                state => {
                    if advancing.expired() {
                        debug!(target: "autofill", ?state, "advance window expired");
                        return Ok(Phase::AdvancingCheckout);
                    }
                    advancing.pause().await;
                }
            }
        }

        if let Err(err) = self.probe.click_next(&descriptor.selectors).await {
            warn!(target: "autofill", %err, "next click failed after fallback");
        }

        sleep(self.cfg.settle_after_click).await;
        if self.probe.detect_page_kind().await? == PageKind::Payment {
            info!(target: "autofill", "checkout page confirmed after click");
            self.finalize().await?;
            return Ok(Phase::PaymentPageReached);
        }

        // Single best-effort pass: record completion even without a
        // confirmed checkout page so unrelated later loads stay idle.
        self.state.mark_pre_fire_done().await?;
        self.state.mark_autofill_completed().await?;
        Ok(Phase::AdvancingCheckout)
    }

    fn payment_recheck_due(&self, attempts: u64) -> bool {
        self.cfg.payment_recheck_every != 0
            && attempts > 0
            && attempts % self.cfg.payment_recheck_every == 0
    }

    async fn snapshot_flags(&self) -> Result<FlagsSnapshot, AutofillError> {
        Ok(FlagsSnapshot {
            payment_page_reached: self.state.payment_page_reached().await?,
            timer_fired: self.state.timer_fired().await?,
            pre_fire: self.state.pre_fire().await?,
            autofill_ever_completed: self.state.autofill_ever_completed().await?,
            reload_evidence: self.probe.reload_evidence().await?,
        })
    }

    /// Terminal bookkeeping once a checkout page is positively identified.
    /// After these writes every component no-ops at its next check point.
    async fn finalize(&self) -> Result<(), AutofillError> {
        self.state.mark_payment_page_reached().await?;
        self.state.mark_pre_fire_done().await?;
        self.state.mark_autofill_completed().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tixrace_core_types::{
        DesiredTicket, MatchDescriptor, SeatMode, SelectorSet, TicketCandidate,
    };
    use tixrace_race_state::MemoryStore;

    #[derive(Default)]
    struct FakeDom {
        candidates: Vec<TicketCandidate>,
        typed: Option<(usize, String)>,
        terms: Option<bool>,
        button_ready_after: u64,
        button_polls: u64,
        payment_after_click: bool,
        clicked: bool,
        reloaded: bool,
        log: Vec<&'static str>,
    }

    #[derive(Clone)]
    struct FakeProbe {
        dom: Arc<Mutex<FakeDom>>,
    }

    impl FakeProbe {
        fn new(dom: FakeDom) -> Self {
            Self {
                dom: Arc::new(Mutex::new(dom)),
            }
        }
    }

    #[async_trait]
    impl PageProbe for FakeProbe {
        async fn detect_page_kind(&self) -> Result<PageKind, AutofillError> {
            let mut dom = self.dom.lock();
            dom.log.push("detect");
            if dom.clicked && dom.payment_after_click {
                Ok(PageKind::Payment)
            } else {
                Ok(PageKind::SaleListing)
            }
        }

        async fn reload_evidence(&self) -> Result<bool, AutofillError> {
            Ok(self.dom.lock().reloaded)
        }

        async fn extract_candidates(
            &self,
            _selectors: &SelectorSet,
        ) -> Result<Vec<TicketCandidate>, AutofillError> {
            let mut dom = self.dom.lock();
            dom.log.push("extract");
            Ok(dom.candidates.clone())
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
            unit_index: usize,
            _selectors: &SelectorSet,
            quantity: &str,
        ) -> Result<(), AutofillError> {
            let mut dom = self.dom.lock();
            dom.log.push("type");
            dom.typed = Some((unit_index, quantity.to_string()));
            Ok(())
        }

        async fn terms_checkbox(
            &self,
            _selectors: &SelectorSet,
        ) -> Result<Option<bool>, AutofillError> {
            Ok(self.dom.lock().terms)
        }

        async fn click_terms(&self, _selectors: &SelectorSet) -> Result<(), AutofillError> {
            let mut dom = self.dom.lock();
            dom.log.push("click_terms");
            dom.terms = Some(true);
            Ok(())
        }

        async fn next_button(&self, _selectors: &SelectorSet) -> Result<ButtonState, AutofillError> {
            let mut dom = self.dom.lock();
            dom.button_polls += 1;
            if dom.button_polls > dom.button_ready_after {
                Ok(ButtonState::Ready)
            } else {
                Ok(ButtonState::Disabled)
            }
        }

        async fn click_next(&self, _selectors: &SelectorSet) -> Result<(), AutofillError> {
            let mut dom = self.dom.lock();
            dom.log.push("click_next");
            dom.clicked = true;
            Ok(())
        }
    }

    fn vip_candidate() -> TicketCandidate {
        TicketCandidate {
            name1: "VIP".to_string(),
            name2: String::new(),
            seat_label: SeatMode::AutoAllocate.label().to_string(),
            price: Some(1800),
            element_id: Some("unit-0".to_string()),
            dom_index: 0,
        }
    }

    fn desired() -> DesiredTicket {
        DesiredTicket::from_user_input("VIP", "", "", "2", SeatMode::AutoAllocate)
    }

    fn descriptor() -> MatchDescriptor {
        MatchDescriptor {
            candidate_index: Some(0),
            candidate_id: Some("unit-0".to_string()),
            desired: desired(),
            selectors: SelectorSet::default(),
        }
    }

    async fn armed_state() -> RaceState {
        let state = RaceState::new(Arc::new(MemoryStore::new()));
        state.save_descriptor(&descriptor()).await.unwrap();
        state.mark_pre_fire_armed().await.unwrap();
        state.mark_timer_fired().await.unwrap();
        state
    }

    #[tokio::test(start_paused = true)]
    async fn full_pass_reaches_payment_page() {
        let probe = FakeProbe::new(FakeDom {
            candidates: vec![vip_candidate()],
            terms: Some(false),
            // Button enables a few polls in, past the sale-open render.
            button_ready_after: 5,
            payment_after_click: true,
            ..FakeDom::default()
        });
        let state = armed_state().await;
        let runner = AutofillRunner::new(probe.clone(), state.clone());

        let phase = runner.run_once().await.unwrap();

        assert_eq!(phase, Phase::PaymentPageReached);
        let dom = probe.dom.lock();
        assert_eq!(dom.typed, Some((0, "2".to_string())));
        assert_eq!(dom.terms, Some(true));
        assert!(dom.clicked);
        drop(dom);
        assert!(state.payment_page_reached().await.unwrap());
        assert!(state.autofill_ever_completed().await.unwrap());
        assert_eq!(
            state.pre_fire().await.unwrap(),
            tixrace_race_state::PreFire::Done
        );

        // Nothing mutates the page after the click that won the race.
        let dom = probe.dom.lock();
        let click_pos = dom.log.iter().position(|op| *op == "click_next").unwrap();
        assert!(dom.log[click_pos + 1..]
            .iter()
            .all(|op| *op == "detect"));
    }

    #[tokio::test(start_paused = true)]
    async fn pass_is_noop_once_payment_flag_is_set() {
        let probe = FakeProbe::new(FakeDom {
            candidates: vec![vip_candidate()],
            ..FakeDom::default()
        });
        let state = armed_state().await;
        state.mark_payment_page_reached().await.unwrap();

        let phase = AutofillRunner::new(probe.clone(), state).run_once().await.unwrap();

        assert_eq!(phase, Phase::Aborted);
        let dom = probe.dom.lock();
        assert!(dom.typed.is_none());
        assert!(!dom.clicked);
    }

    #[tokio::test(start_paused = true)]
    async fn unrelated_load_stays_idle() {
        let probe = FakeProbe::new(FakeDom {
            candidates: vec![vip_candidate()],
            ..FakeDom::default()
        });
        let state = RaceState::new(Arc::new(MemoryStore::new()));
        state.save_descriptor(&descriptor()).await.unwrap();
        // No pre-fire, no timer flag, no reload evidence.

        let phase = AutofillRunner::new(probe.clone(), state).run_once().await.unwrap();

        assert_eq!(phase, Phase::Idle);
        assert!(probe.dom.lock().typed.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn reload_evidence_alone_resumes_the_pass() {
        let probe = FakeProbe::new(FakeDom {
            candidates: vec![vip_candidate()],
            reloaded: true,
            payment_after_click: true,
            ..FakeDom::default()
        });
        let state = RaceState::new(Arc::new(MemoryStore::new()));
        state.save_descriptor(&descriptor()).await.unwrap();

        let phase = AutofillRunner::new(probe, state).run_once().await.unwrap();
        assert_eq!(phase, Phase::PaymentPageReached);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_terms_checkbox_is_skipped() {
        let probe = FakeProbe::new(FakeDom {
            candidates: vec![vip_candidate()],
            terms: None,
            payment_after_click: true,
            ..FakeDom::default()
        });
        let state = armed_state().await;

        let phase = AutofillRunner::new(probe.clone(), state).run_once().await.unwrap();

        assert_eq!(phase, Phase::PaymentPageReached);
        assert!(!probe.dom.lock().log.contains(&"click_terms"));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_descriptor_stays_idle() {
        let probe = FakeProbe::new(FakeDom {
            candidates: vec![vip_candidate()],
            ..FakeDom::default()
        });
        let state = RaceState::new(Arc::new(MemoryStore::new()));
        state.mark_pre_fire_armed().await.unwrap();

        let phase = AutofillRunner::new(probe, state).run_once().await.unwrap();
        assert_eq!(phase, Phase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_locate_gives_up_when_ticket_never_renders() {
        let probe = FakeProbe::new(FakeDom::default());
        let state = armed_state().await;
        let cfg = AutofillConfig {
            locate: RetryPolicy::bounded(
                Duration::from_millis(60),
                Duration::from_millis(600),
            ),
            ..AutofillConfig::default()
        };

        let phase = AutofillRunner::with_config(probe, state.clone(), cfg)
            .run_once()
            .await
            .unwrap();

        assert_eq!(phase, Phase::LocatingTarget);
        assert!(!state.payment_page_reached().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_recheck_cadence_disables_the_payment_poll() {
        let probe = FakeProbe::new(FakeDom {
            candidates: vec![vip_candidate()],
            terms: Some(true),
            button_ready_after: 2,
            payment_after_click: true,
            ..FakeDom::default()
        });
        let state = armed_state().await;
        let cfg = AutofillConfig {
            payment_recheck_every: 0,
            ..AutofillConfig::default()
        };

        let phase = AutofillRunner::with_config(probe, state, cfg)
            .run_once()
            .await
            .unwrap();

        assert_eq!(phase, Phase::PaymentPageReached);
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_checkout_still_marks_completion() {
        let probe = FakeProbe::new(FakeDom {
            candidates: vec![vip_candidate()],
            terms: Some(true),
            payment_after_click: false,
            ..FakeDom::default()
        });
        let state = armed_state().await;

        let phase = AutofillRunner::new(probe, state.clone()).run_once().await.unwrap();

        assert_eq!(phase, Phase::AdvancingCheckout);
        assert!(state.autofill_ever_completed().await.unwrap());
        assert!(!state.payment_page_reached().await.unwrap());
        assert_eq!(
            state.pre_fire().await.unwrap(),
            tixrace_race_state::PreFire::Done
        );
    }
}
