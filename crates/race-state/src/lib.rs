//! Persisted race state: the only synchronization surface shared between the
//! controller process and the page across the deliberate reload.
//!
//! There is no lock. Every flag has exactly one designated writer and the
//! boolean flags are monotone (false→true) within a race attempt; the only
//! reset path is [`RaceState::reset_for_new_attempt`], which the orchestrator
//! runs before any in-page logic is re-armed. The literal string values are
//! part of the contract with the page's origin-scoped storage.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tixrace_core_types::MatchDescriptor;
use tracing::debug;

/// Storage keys, with their designated writers.
pub mod keys {
    /// JSON match descriptor stash. Writer: orchestrator (pre-race).
    pub const PRESEARCH: &str = "kk_presearch";
    /// `"1"` when the scheduler fired, `"done"` after autofill completes.
    /// Writers: scheduler (`"1"`), autofill (`"done"`).
    pub const PRE_FIRE: &str = "kk_pre_fire";
    /// `"true"` once the reload timer executed. Writer: scheduler.
    pub const REFRESH_TIMER_EXECUTED: &str = "kk_refresh_timer_executed";
    /// `"true"` once a checkout page was positively detected. Writer: autofill.
    pub const PAYMENT_PAGE_REACHED: &str = "kk_payment_page_reached";
    /// `"true"` once a full autofill pass finished. Writer: autofill;
    /// cleared by the scheduler at fire time and by the orchestrator at the
    /// start of a new attempt.
    pub const AUTOFILL_EVER_COMPLETED: &str = "kk_autofill_ever_completed";
}

#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("state store backend failure: {0}")]
    Backend(String),
    #[error("corrupt value under {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// String key-value surface surviving page reloads.
///
/// Production backing is the page's origin-scoped `localStorage`; tests use
/// [`MemoryStore`].
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Pre-fire marker taxonomy: unset, armed by the scheduler, or consumed by a
/// completed autofill pass.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PreFire {
    Unset,
    Armed,
    Done,
}

impl PreFire {
    fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("1") => PreFire::Armed,
            Some("done") => PreFire::Done,
            _ => PreFire::Unset,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct PresearchStash {
    #[serde(flatten)]
    descriptor: MatchDescriptor,
    armed: bool,
}

/// Typed facade over the raw store.
#[derive(Clone)]
pub struct RaceState {
    store: Arc<dyn StateStore>,
}

impl RaceState {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> Arc<dyn StateStore> {
        self.store.clone()
    }

    async fn flag(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.store.get(key).await?.as_deref() == Some("true"))
    }

    pub async fn payment_page_reached(&self) -> Result<bool, StoreError> {
        self.flag(keys::PAYMENT_PAGE_REACHED).await
    }

    /// Single global cancellation signal; observed by every component at its
    /// next suspension point. Never cleared within an attempt.
    pub async fn mark_payment_page_reached(&self) -> Result<(), StoreError> {
        self.store.set(keys::PAYMENT_PAGE_REACHED, "true").await
    }

    pub async fn timer_fired(&self) -> Result<bool, StoreError> {
        self.flag(keys::REFRESH_TIMER_EXECUTED).await
    }

    pub async fn mark_timer_fired(&self) -> Result<(), StoreError> {
        self.store.set(keys::REFRESH_TIMER_EXECUTED, "true").await
    }

    pub async fn autofill_ever_completed(&self) -> Result<bool, StoreError> {
        self.flag(keys::AUTOFILL_EVER_COMPLETED).await
    }

    pub async fn mark_autofill_completed(&self) -> Result<(), StoreError> {
        self.store.set(keys::AUTOFILL_EVER_COMPLETED, "true").await
    }

    /// Scheduler-side clear at fire time, guaranteeing the autofill pass
    /// re-runs after the reload it is about to cause.
    pub async fn clear_autofill_completed(&self) -> Result<(), StoreError> {
        self.store.remove(keys::AUTOFILL_EVER_COMPLETED).await
    }

    pub async fn pre_fire(&self) -> Result<PreFire, StoreError> {
        let raw = self.store.get(keys::PRE_FIRE).await?;
        Ok(PreFire::parse(raw.as_deref()))
    }

    pub async fn mark_pre_fire_armed(&self) -> Result<(), StoreError> {
        self.store.set(keys::PRE_FIRE, "1").await
    }

    pub async fn mark_pre_fire_done(&self) -> Result<(), StoreError> {
        self.store.set(keys::PRE_FIRE, "done").await
    }

    /// Persist the match descriptor with the armed marker set. Overwrites
    /// any previous stash.
    pub async fn save_descriptor(&self, descriptor: &MatchDescriptor) -> Result<(), StoreError> {
        let stash = PresearchStash {
            descriptor: descriptor.clone(),
            armed: true,
        };
        let json = serde_json::to_string(&stash).map_err(|err| StoreError::Corrupt {
            key: keys::PRESEARCH.to_string(),
            reason: err.to_string(),
        })?;
        self.store.set(keys::PRESEARCH, &json).await
    }

    /// Re-read the persisted descriptor. Returns `None` when the stash is
    /// absent, unreadable or not armed; the descriptor is never recomputed
    /// here.
    pub async fn load_descriptor(&self) -> Result<Option<MatchDescriptor>, StoreError> {
        let raw = match self.store.get(keys::PRESEARCH).await? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        match serde_json::from_str::<PresearchStash>(&raw) {
            Ok(stash) if stash.armed => Ok(Some(stash.descriptor)),
            Ok(_) => Ok(None),
            Err(err) => {
                debug!(target: "race-state", %err, "discarding unreadable presearch stash");
                Ok(None)
            }
        }
    }

    /// Orchestrator-only: clear the flags a previous attempt may have left
    /// behind, before any in-page logic is (re)armed. The pre-fire marker is
    /// left alone; the fresh stash written afterwards supersedes it.
    pub async fn reset_for_new_attempt(&self) -> Result<(), StoreError> {
        self.store.remove(keys::REFRESH_TIMER_EXECUTED).await?;
        self.store.remove(keys::AUTOFILL_EVER_COMPLETED).await?;
        self.store.remove(keys::PAYMENT_PAGE_REACHED).await?;
        Ok(())
    }
}

/// In-process store used by tests and fakes.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tixrace_core_types::{DesiredTicket, SeatMode, SelectorSet};

    fn state() -> RaceState {
        RaceState::new(Arc::new(MemoryStore::new()))
    }

    fn descriptor() -> MatchDescriptor {
        MatchDescriptor {
            candidate_index: Some(2),
            candidate_id: None,
            desired: DesiredTicket::from_user_input("VIP", "", "", "2", SeatMode::AutoAllocate),
            selectors: SelectorSet::default(),
        }
    }

    #[tokio::test]
    async fn payment_flag_is_monotone_within_an_attempt() {
        let state = state();
        assert!(!state.payment_page_reached().await.unwrap());
        state.mark_payment_page_reached().await.unwrap();
        state.mark_payment_page_reached().await.unwrap();
        assert!(state.payment_page_reached().await.unwrap());
    }

    #[tokio::test]
    async fn pre_fire_literals_follow_the_contract() {
        let state = state();
        assert_eq!(state.pre_fire().await.unwrap(), PreFire::Unset);
        state.mark_pre_fire_armed().await.unwrap();
        assert_eq!(
            state.store().get(keys::PRE_FIRE).await.unwrap().as_deref(),
            Some("1")
        );
        state.mark_pre_fire_done().await.unwrap();
        assert_eq!(state.pre_fire().await.unwrap(), PreFire::Done);
    }

    #[tokio::test]
    async fn descriptor_round_trips_only_while_armed() {
        let state = state();
        assert!(state.load_descriptor().await.unwrap().is_none());
        state.save_descriptor(&descriptor()).await.unwrap();
        let loaded = state.load_descriptor().await.unwrap().unwrap();
        assert_eq!(loaded, descriptor());
    }

    #[tokio::test]
    async fn unreadable_stash_is_treated_as_absent() {
        let state = state();
        state
            .store()
            .set(keys::PRESEARCH, "{\"err\":\"boom\"}")
            .await
            .unwrap();
        assert!(state.load_descriptor().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reset_clears_previous_attempt_flags() {
        let state = state();
        state.mark_timer_fired().await.unwrap();
        state.mark_autofill_completed().await.unwrap();
        state.mark_payment_page_reached().await.unwrap();

        state.reset_for_new_attempt().await.unwrap();

        assert!(!state.timer_fired().await.unwrap());
        assert!(!state.autofill_ever_completed().await.unwrap());
        assert!(!state.payment_page_reached().await.unwrap());
    }
}
