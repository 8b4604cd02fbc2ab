//! Race-state persistence backed by the page's origin-scoped localStorage.

use std::sync::Arc;

use async_trait::async_trait;
use tixrace_race_state::{StateStore, StoreError};

use crate::js;
use crate::session::PageSession;

/// [`StateStore`] over `localStorage`, so the persisted flags live with the
/// sale page's origin and survive the deliberate reload.
pub struct LocalStorageStore {
    page: Arc<dyn PageSession>,
}

impl LocalStorageStore {
    pub fn new(page: Arc<dyn PageSession>) -> Self {
        Self { page }
    }
}

#[async_trait]
impl StateStore for LocalStorageStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let expr = format!("localStorage.getItem({})", js::str_lit(key));
        let value = self
            .page
            .evaluate(&expr)
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        Ok(value.as_str().map(str::to_string))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let expr = format!(
            "localStorage.setItem({}, {})",
            js::str_lit(key),
            js::str_lit(value)
        );
        self.page
            .evaluate(&expr)
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let expr = format!("localStorage.removeItem({})", js::str_lit(key));
        self.page
            .evaluate(&expr)
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        Ok(())
    }
}
