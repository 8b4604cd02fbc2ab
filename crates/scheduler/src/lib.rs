//! Sale-open scheduler: counts down to the sale instant on the page's own
//! clock and triggers the reload within single-digit milliseconds of it.
//!
//! The countdown has three regimes. Far out (more than the coarse lead), a
//! single one-shot sleep avoids burning CPU. Inside the lead, a per-tick
//! fine loop yields on a display-refresh-equivalent ticker and re-reads the
//! payment flag at every check point. In the last few milliseconds it
//! busy-spins on the clock, then fires: persist the fire markers, clear the
//! autofill completion flag and trigger the hard reload.
//!
//! Arming is idempotent per scheduler instance; the instance guard is scoped
//! to the current page load only. Cross-reload dedup is carried by the
//! persisted `kk_refresh_timer_executed` flag instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tixrace_core_types::SaleWindow;
use tixrace_race_state::{RaceState, StoreError};
use tokio::time::sleep;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("clock read failed: {0}")]
    Clock(String),
    #[error("fire path failed: {0}")]
    Fire(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Page-referenced time source. All countdown comparisons use this clock,
/// never the controller's, to keep process-to-page latency out of the math.
#[async_trait]
pub trait RaceClock: Send + Sync {
    async fn now_ms(&self) -> Result<i64, ScheduleError>;
}

/// Cooperative high-frequency yield, the equivalent of an animation-frame
/// callback: short, non-blocking, roughly display-refresh cadence.
#[async_trait]
pub trait FrameTicker: Send + Sync {
    async fn tick(&self);
}

/// The action taken at the target instant: a hard reload, with a
/// navigation-replace fallback inside the implementation.
#[async_trait]
pub trait FirePath: Send + Sync {
    async fn fire(&self) -> Result<(), ScheduleError>;
}

/// What happened when the scheduler was armed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ArmOutcome {
    /// Countdown completed and the reload was triggered.
    Fired,
    /// This instance was already armed; the second call did nothing.
    AlreadyArmed,
    /// The persisted timer-executed flag was set by a previous page load.
    AlreadyFired,
    /// The payment page was reached; the countdown stopped silently.
    Aborted,
}

#[derive(Clone, Copy, Debug)]
pub struct SchedulerConfig {
    /// Switch from the coarse one-shot sleep to the fine loop this far out.
    pub coarse_lead: Duration,
    /// Below this remaining time the loop stops yielding and spins.
    pub spin_threshold_ms: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            coarse_lead: Duration::from_secs(2),
            spin_threshold_ms: 3,
        }
    }
}

pub struct SaleScheduler<C, T, F> {
    clock: C,
    ticker: T,
    fire_path: F,
    state: RaceState,
    cfg: SchedulerConfig,
    armed: AtomicBool,
}

impl<C, T, F> SaleScheduler<C, T, F>
where
    C: RaceClock,
    T: FrameTicker,
    F: FirePath,
{
    pub fn new(clock: C, ticker: T, fire_path: F, state: RaceState) -> Self {
        Self::with_config(clock, ticker, fire_path, state, SchedulerConfig::default())
    }

    pub fn with_config(
        clock: C,
        ticker: T,
        fire_path: F,
        state: RaceState,
        cfg: SchedulerConfig,
    ) -> Self {
        Self {
            clock,
            ticker,
            fire_path,
            state,
            cfg,
            armed: AtomicBool::new(false),
        }
    }

    /// Run the countdown and fire at the target instant. Idempotent: a
    /// second call on the same instance returns immediately.
    pub async fn arm(&self, window: SaleWindow) -> Result<ArmOutcome, ScheduleError> {
        if self.armed.swap(true, Ordering::SeqCst) {
            debug!(target: "scheduler", "already armed, skipping");
            return Ok(ArmOutcome::AlreadyArmed);
        }

        if self.state.payment_page_reached().await? {
            debug!(target: "scheduler", "payment page already reached, not arming");
            return Ok(ArmOutcome::Aborted);
        }
        if self.state.timer_fired().await? {
            debug!(target: "scheduler", "timer already executed on a previous load");
            return Ok(ArmOutcome::AlreadyFired);
        }

        let aim = window.aim_page_ms();
        info!(
            target: "scheduler",
            aim,
            offset_ms = window.clock_offset_ms,
            "armed for sale open"
        );

        // Coarse regime: one-shot sleep until shortly before the target.
        let now = self.clock.now_ms().await?;
        let remaining = aim - now;
        let lead_ms = self.cfg.coarse_lead.as_millis() as i64;
        if remaining > lead_ms {
            sleep(Duration::from_millis((remaining - lead_ms) as u64)).await;
        }

        // Fine regime: yield per frame tick, re-checking the abort flag at
        // every check point.
        loop {
            if self.state.payment_page_reached().await? {
                info!(target: "scheduler", "payment page reached mid-countdown, aborting");
                return Ok(ArmOutcome::Aborted);
            }
            let now = self.clock.now_ms().await?;
            if aim - now <= self.cfg.spin_threshold_ms {
                break;
            }
            self.ticker.tick().await;
        }

        // Spin regime: no more yielding; hold the clock until the instant.
        loop {
            let now = self.clock.now_ms().await?;
            if now >= aim {
                break;
            }
        }

        self.fire().await?;
        Ok(ArmOutcome::Fired)
    }

    /// Persist the fire markers, then trigger the reload. The completion
    /// flag is cleared so the autofill pass is guaranteed to re-run after
    /// the reload this causes.
    async fn fire(&self) -> Result<(), ScheduleError> {
        self.state.mark_pre_fire_armed().await?;
        self.state.mark_timer_fired().await?;
        self.state.clear_autofill_completed().await?;

        if let Err(err) = self.fire_path.fire().await {
            warn!(target: "scheduler", %err, "fire path failed after markers were set");
            return Err(err);
        }
        info!(target: "scheduler", "reload fired");
        Ok(())
    }
}
