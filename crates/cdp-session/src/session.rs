//! Page-level session surface over the raw transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::launch::SessionConfig;
use crate::transport::{CommandTarget, Transport};
use crate::SessionError;

/// Capability surface the race components get for a single browser tab.
#[async_trait]
pub trait PageSession: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), SessionError>;

    /// One-shot script evaluation, returning the completion value by value.
    async fn evaluate(&self, expression: &str) -> Result<Value, SessionError>;

    /// Register a script to run in every new document before its own code.
    async fn evaluate_on_new_document(&self, source: &str) -> Result<(), SessionError>;

    async fn current_url(&self) -> Result<String, SessionError>;

    async fn ready_state(&self) -> Result<String, SessionError>;

    /// Poll until the document is at least interactive.
    async fn wait_until_ready(&self, limit: Duration) -> Result<(), SessionError>;

    async fn reload(&self) -> Result<(), SessionError>;

    async fn close(&self) -> Result<(), SessionError>;
}

pub struct Browser {
    transport: Arc<Transport>,
}

impl Browser {
    pub async fn launch(cfg: &SessionConfig) -> Result<Self, SessionError> {
        let transport = Transport::launch(cfg).await?;
        Ok(Self {
            transport: Arc::new(transport),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }

    /// Open a fresh tab and attach to it with a flat session.
    pub async fn new_page(&self) -> Result<CdpPage, SessionError> {
        let created = self
            .transport
            .send(
                CommandTarget::Browser,
                "Target.createTarget",
                json!({ "url": "about:blank" }),
            )
            .await?;
        let target_id = created["targetId"]
            .as_str()
            .ok_or_else(|| SessionError::payload("Target.createTarget", "missing targetId"))?
            .to_string();

        let attached = self
            .transport
            .send(
                CommandTarget::Browser,
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
            )
            .await?;
        let session_id = attached["sessionId"]
            .as_str()
            .ok_or_else(|| SessionError::payload("Target.attachToTarget", "missing sessionId"))?
            .to_string();

        let page = CdpPage {
            transport: self.transport.clone(),
            session_id,
            target_id,
        };
        page.command("Page.enable", json!({})).await?;
        page.command("Runtime.enable", json!({})).await?;
        debug!(target: "cdp-session", target_id = %page.target_id, "page attached");
        Ok(page)
    }
}

pub struct CdpPage {
    transport: Arc<Transport>,
    session_id: String,
    target_id: String,
}

impl CdpPage {
    async fn command(&self, method: &str, params: Value) -> Result<Value, SessionError> {
        self.transport
            .send(
                CommandTarget::Session(self.session_id.clone()),
                method,
                params,
            )
            .await
    }
}

#[async_trait]
impl PageSession for CdpPage {
    async fn navigate(&self, url: &str) -> Result<(), SessionError> {
        let payload = self.command("Page.navigate", json!({ "url": url })).await?;
        if let Some(error_text) = payload["errorText"].as_str() {
            if !error_text.is_empty() {
                return Err(SessionError::payload("Page.navigate", error_text));
            }
        }
        Ok(())
    }

    async fn evaluate(&self, expression: &str) -> Result<Value, SessionError> {
        let payload = self
            .command(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;

        if let Some(details) = payload.get("exceptionDetails") {
            let text = details["exception"]["description"]
                .as_str()
                .or_else(|| details["text"].as_str())
                .unwrap_or("unknown exception");
            return Err(SessionError::Js(text.to_string()));
        }
        Ok(payload["result"]["value"].clone())
    }

    async fn evaluate_on_new_document(&self, source: &str) -> Result<(), SessionError> {
        self.command(
            "Page.addScriptToEvaluateOnNewDocument",
            json!({ "source": source }),
        )
        .await?;
        Ok(())
    }

    async fn current_url(&self) -> Result<String, SessionError> {
        let value = self.evaluate("location.href").await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| SessionError::payload("Runtime.evaluate", "location.href not a string"))
    }

    async fn ready_state(&self) -> Result<String, SessionError> {
        let value = self.evaluate("document.readyState").await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| SessionError::payload("Runtime.evaluate", "readyState not a string"))
    }

    async fn wait_until_ready(&self, limit: Duration) -> Result<(), SessionError> {
        let started = Instant::now();
        loop {
            match self.ready_state().await {
                Ok(state) if state == "interactive" || state == "complete" => return Ok(()),
                Ok(_) => {}
                // Evaluation can fail transiently mid-navigation.
                Err(err) => debug!(target: "cdp-session", %err, "ready-state probe failed"),
            }
            if started.elapsed() >= limit {
                return Err(SessionError::Timeout("document never became ready".to_string()));
            }
            sleep(Duration::from_millis(100)).await;
        }
    }

    async fn reload(&self) -> Result<(), SessionError> {
        self.command("Page.reload", json!({})).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.transport
            .send(
                CommandTarget::Browser,
                "Target.closeTarget",
                json!({ "targetId": self.target_id }),
            )
            .await?;
        Ok(())
    }
}
