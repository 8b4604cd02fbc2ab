//! End-to-end race driver: wires the browser session, persisted state,
//! scheduler and autofill passes together for one sale attempt.
//!
//! Sequence per attempt: navigate and settle, sign in if the guest modal
//! shows, pre-search the target while the listing is calm, measure the
//! clock offset, arm the scheduler, mirror the countdown coarsely on the
//! controller side, fall back to a forced reload when no fire evidence
//! appears, then run autofill passes until a terminal phase. The session
//! then stays open for the manual payment steps.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tixrace_autofill::probe::PageProbe;
use tixrace_autofill::retry::RetryPolicy;
use tixrace_autofill::runner::{AutofillConfig, AutofillRunner};
use tixrace_autofill::Phase;
use tixrace_cdp_session::probe::bootstrap_js;
use tixrace_cdp_session::{
    measure_clock_offset, Browser, CdpRaceClock, GuestModalAuthenticator, IntervalTicker,
    KktixProbe, LocalStorageStore, PageSession, ReloadFirePath, SessionConfig,
};
use tixrace_core_types::{MatchDescriptor, SaleWindow, SelectorSet};
use tixrace_matcher::{find_match, MatchError};
use tixrace_race_state::{PreFire, RaceState, StoreError};
use tixrace_scheduler::SaleScheduler;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::UserConfig;

/// How long past the target the controller waits for in-page fire evidence
/// before forcing the reload itself.
const FIRE_EVIDENCE_GRACE: Duration = Duration::from_secs(5);

pub struct Orchestrator {
    user: UserConfig,
    session: SessionConfig,
}

impl Orchestrator {
    pub fn new(user: UserConfig, session: SessionConfig) -> Self {
        Self { user, session }
    }

    pub async fn run(&self) -> Result<()> {
        let url = self.user.ticket_url()?.to_string();
        let desired = self.user.desired_ticket();
        let selectors = SelectorSet::default();

        let browser = Browser::launch(&self.session)
            .await
            .context("launching browser")?;
        let page: Arc<dyn PageSession> =
            Arc::new(browser.new_page().await.context("opening page")?);

        info!(target: "orchestrator", %url, "navigating to the sale page");
        page.navigate(&url).await.context("navigating to sale page")?;
        if let Err(err) = page.wait_until_ready(Duration::from_secs(10)).await {
            warn!(target: "orchestrator", %err, "page never settled, continuing anyway");
        }
        sleep(Duration::from_secs(1)).await;

        if let Some(credentials) = self.user.credentials() {
            let auth = GuestModalAuthenticator::new(page.clone());
            match auth.sign_in_if_needed(&credentials, &url).await {
                Ok(true) => info!(target: "orchestrator", "signed in"),
                Ok(false) => debug!(target: "orchestrator", "already signed in"),
                Err(err) => warn!(target: "orchestrator", %err, "sign-in failed, continuing as-is"),
            }
        }

        let state = RaceState::new(Arc::new(LocalStorageStore::new(page.clone())));
        let probe = KktixProbe::new(page.clone());

        // Pre-search while the listing is calm: one extraction, one match,
        // persisted so the post-reload pass re-reads instead of recomputing.
        let candidates = probe
            .extract_candidates(&selectors)
            .await
            .context("extracting ticket candidates")?;
        let descriptor = match find_match(&desired, &candidates, &selectors) {
            Ok(descriptor) => {
                info!(
                    target: "orchestrator",
                    index = ?descriptor.candidate_index,
                    "target ticket matched pre-race"
                );
                descriptor
            }
            Err(MatchError::NotFound) => {
                // The unit may only render at sale open; stash the desired
                // predicates and let the re-scan find it after the reload.
                warn!(target: "orchestrator", "no match pre-race, relying on post-reload re-scan");
                MatchDescriptor {
                    candidate_index: None,
                    candidate_id: None,
                    desired: desired.clone(),
                    selectors: selectors.clone(),
                }
            }
        };
        state
            .save_descriptor(&descriptor)
            .await
            .context("persisting the match descriptor")?;

        let offset = measure_clock_offset(page.as_ref())
            .await
            .context("measuring clock offset")?;
        info!(target: "orchestrator", offset_ms = offset, "clock offset measured");

        page.evaluate_on_new_document(&bootstrap_js())
            .await
            .context("installing the new-document bootstrap")?;

        state
            .reset_for_new_attempt()
            .await
            .context("clearing stale race flags")?;

        let target_ms = match self.user.sale_target_ms()? {
            Some(target_ms) => target_ms,
            None => {
                info!(target: "orchestrator", "no sale time configured, leaving the session open");
                tokio::signal::ctrl_c().await.ok();
                return Ok(());
            }
        };
        let window = SaleWindow::new(target_ms, offset);

        let scheduler = SaleScheduler::new(
            CdpRaceClock::new(page.clone()),
            IntervalTicker::default(),
            ReloadFirePath::new(page.clone()),
            state.clone(),
        );
        let scheduler_task = tokio::spawn(async move {
            match scheduler.arm(window).await {
                Ok(outcome) => info!(target: "orchestrator", ?outcome, "scheduler finished"),
                Err(err) => warn!(target: "orchestrator", %err, "scheduler failed"),
            }
        });

        self.mirror_countdown(page.as_ref(), window).await;
        self.ensure_fired(page.as_ref(), &state).await;
        scheduler_task.abort();

        self.drive_autofill(probe, &state).await;

        info!(target: "orchestrator", "automation done, payment steps are manual; Ctrl-C to exit");
        tokio::signal::ctrl_c().await.ok();
        Ok(())
    }

    /// Coarse controller-side countdown keyed off the page clock, with
    /// converging sleeps so the browser is left alone near the instant.
    async fn mirror_countdown(&self, page: &dyn PageSession, window: SaleWindow) {
        let aim = window.aim_page_ms();
        loop {
            let now = match page.evaluate("Date.now()").await {
                Ok(value) => value
                    .as_i64()
                    .unwrap_or_else(|| chrono::Utc::now().timestamp_millis() + window.clock_offset_ms),
                Err(_) => chrono::Utc::now().timestamp_millis() + window.clock_offset_ms,
            };
            let remain = aim - now;
            if remain <= 0 {
                return;
            }
            let pause = if remain > 5_000 {
                Duration::from_millis((remain as u64 / 10).clamp(100, 1_000))
            } else if remain > 1_000 {
                Duration::from_millis(100)
            } else {
                Duration::from_millis(50)
            };
            sleep(pause).await;
        }
    }

    /// Wait a short grace period for fire evidence; when none appears the
    /// controller writes the pre-fire marker and reloads itself. The store
    /// reads race the very reload they are watching for, so a torn evaluate
    /// counts as no evidence yet and the poll continues.
    async fn ensure_fired(&self, page: &dyn PageSession, state: &RaceState) {
        let polls = FIRE_EVIDENCE_GRACE.as_millis() as u64 / 100;
        for _ in 0..polls {
            sleep(Duration::from_millis(100)).await;
            match fire_evidence(state).await {
                Ok(true) => {
                    debug!(target: "orchestrator", "fire evidence observed");
                    return;
                }
                Ok(false) => {}
                Err(err) => {
                    debug!(target: "orchestrator", %err, "state read failed mid-reload, still polling");
                }
            }
        }

        warn!(target: "orchestrator", "no fire evidence after the grace period, forcing reload");
        if let Err(err) = state.mark_pre_fire_armed().await {
            warn!(target: "orchestrator", %err, "pre-fire marker write failed before the forced reload");
        }
        if let Err(err) = page.reload().await {
            warn!(target: "orchestrator", %err, "forced reload failed");
        }
    }

    /// Run autofill passes until a terminal phase. Each pass is bounded so
    /// the loop can re-check the page between attempts; transient probe and
    /// store failures end the pass, never the loop.
    async fn drive_autofill<P: PageProbe>(&self, probe: P, state: &RaceState) {
        let cfg = AutofillConfig {
            locate: RetryPolicy::bounded(Duration::from_millis(60), Duration::from_secs(15)),
            advance: RetryPolicy::bounded(Duration::from_millis(40), Duration::from_secs(30)),
            ..AutofillConfig::default()
        };
        let runner = AutofillRunner::with_config(probe, state.clone(), cfg);

        loop {
            match runner.run_once().await {
                Ok(Phase::PaymentPageReached) => {
                    info!(target: "orchestrator", "checkout page reached");
                    return;
                }
                Ok(Phase::Aborted) => {
                    info!(target: "orchestrator", "attempt already terminal");
                    return;
                }
                Ok(phase) => debug!(target: "orchestrator", ?phase, "autofill pass ended"),
                Err(err) => warn!(target: "orchestrator", %err, "autofill pass failed"),
            }
            match state.payment_page_reached().await {
                Ok(true) => return,
                Ok(false) => {}
                Err(err) => {
                    debug!(target: "orchestrator", %err, "state read failed, retrying next pass");
                }
            }
            if let Ok(true) = state.autofill_ever_completed().await {
                info!(target: "orchestrator", "autofill pass completed without checkout confirmation");
                return;
            }
            sleep(Duration::from_secs(1)).await;
        }
    }
}

async fn fire_evidence(state: &RaceState) -> Result<bool, StoreError> {
    Ok(state.pre_fire().await? == PreFire::Armed || state.timer_fired().await?)
}

/// Convenience entry used by the binary.
pub async fn run(config_path: PathBuf, session: SessionConfig) -> Result<()> {
    let user = UserConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    Orchestrator::new(user, session).run().await
}
