//! Production implementations of the scheduler's timing capabilities.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tixrace_scheduler::{FirePath, FrameTicker, RaceClock, ScheduleError};
use tokio::time::sleep;
use tracing::warn;

use crate::session::PageSession;
use crate::SessionError;

/// Page-referenced clock: samples `Date.now()` in the page itself, so the
/// countdown compares against the clock the site's own countdown uses.
pub struct CdpRaceClock {
    page: Arc<dyn PageSession>,
}

impl CdpRaceClock {
    pub fn new(page: Arc<dyn PageSession>) -> Self {
        Self { page }
    }
}

#[async_trait]
impl RaceClock for CdpRaceClock {
    async fn now_ms(&self) -> Result<i64, ScheduleError> {
        let value = self
            .page
            .evaluate("Date.now()")
            .await
            .map_err(|err| ScheduleError::Clock(err.to_string()))?;
        value
            .as_i64()
            .or_else(|| value.as_f64().map(|f| f as i64))
            .ok_or_else(|| ScheduleError::Clock("Date.now() returned a non-number".to_string()))
    }
}

/// Measure the page-minus-controller clock difference. The page sample is
/// bracketed by two local samples and compared against their midpoint to
/// cancel out the evaluation round trip.
pub async fn measure_clock_offset(page: &dyn PageSession) -> Result<i64, SessionError> {
    let local_before = Utc::now().timestamp_millis();
    let value = page.evaluate("Date.now()").await?;
    let local_after = Utc::now().timestamp_millis();

    let page_now = value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
        .ok_or_else(|| SessionError::payload("Runtime.evaluate", "Date.now() not a number"))?;
    let midpoint = local_before + (local_after - local_before) / 2;
    Ok(page_now - midpoint)
}

/// Cooperative yield at roughly display-refresh cadence, standing in for an
/// animation-frame callback on the controller side.
pub struct IntervalTicker {
    period: Duration,
}

impl IntervalTicker {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }
}

impl Default for IntervalTicker {
    fn default() -> Self {
        Self::new(Duration::from_millis(8))
    }
}

#[async_trait]
impl FrameTicker for IntervalTicker {
    async fn tick(&self) {
        sleep(self.period).await;
    }
}

/// Hard reload via `Page.reload`, with an in-page `location.replace`
/// fallback when the protocol path fails.
pub struct ReloadFirePath {
    page: Arc<dyn PageSession>,
}

impl ReloadFirePath {
    pub fn new(page: Arc<dyn PageSession>) -> Self {
        Self { page }
    }
}

#[async_trait]
impl FirePath for ReloadFirePath {
    async fn fire(&self) -> Result<(), ScheduleError> {
        match self.page.reload().await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(target: "cdp-session", %err, "protocol reload failed, replacing location");
                self.page
                    .evaluate("location.replace(location.href)")
                    .await
                    .map_err(|err| ScheduleError::Fire(err.to_string()))?;
                Ok(())
            }
        }
    }
}
