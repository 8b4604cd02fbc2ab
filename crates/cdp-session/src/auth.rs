//! Sign-in handling for the guest modal flow.
//!
//! KKTIX shows a "become a member" modal over the sale page when the visitor
//! is not signed in; its presence is the signed-out signal. The login link
//! inside it leads to the sign-in form, which is filled with human-paced
//! keystrokes and submitted, after which the site redirects back to the
//! original URL on its own.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::js::str_lit;
use crate::session::PageSession;
use crate::SessionError;

#[derive(Clone, Debug)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

pub struct GuestModalAuthenticator {
    page: Arc<dyn PageSession>,
}

fn guest_modal_visible_js() -> String {
    r#"(function(){
  var modals = document.querySelectorAll('.modal.ng-isolate-scope, .modal.ng-scope');
  for (var i = 0; i < modals.length; i++) {
    var m = modals[i];
    var body = m.querySelector('.modal-body');
    if (!body) continue;
    var text = (body.textContent || '').toLowerCase();
    if (text.indexOf('立刻成為') >= 0 || text.indexOf('kktix 會員') >= 0 ||
        text.indexOf('會員登入') >= 0 || text.indexOf('sign in') >= 0) {
      var cs = getComputedStyle(m);
      if (cs.display !== 'none' && cs.visibility !== 'hidden') {
        var rect = m.getBoundingClientRect();
        if (rect.width > 0 && rect.height > 0) return true;
      }
    }
  }
  return false;
})()"#
        .to_string()
}

fn click_login_link_js() -> String {
    r#"(function(){
  var modals = document.querySelectorAll('.modal.ng-isolate-scope, .modal.ng-scope');
  for (var i = 0; i < modals.length; i++) {
    var links = modals[i].querySelectorAll('a');
    for (var j = 0; j < links.length; j++) {
      var a = links[j];
      if ((a.textContent || '').indexOf('登入') >= 0) {
        var cs = getComputedStyle(a);
        if (cs.display !== 'none' && cs.visibility !== 'hidden') {
          a.click();
          return true;
        }
      }
    }
  }
  return false;
})()"#
        .to_string()
}

fn submit_sign_in_js() -> String {
    r#"(function(){
  var btn = document.querySelector('input[type="submit"][value="登入"]');
  if (btn) { btn.click(); return true; }
  var form = document.getElementById('new_user');
  if (form) { form.submit(); return true; }
  return false;
})()"#
        .to_string()
}

fn append_char_js(element_id: &str, ch: char) -> String {
    format!(
        r#"(function(){{
  var input = document.getElementById({id});
  if (!input) return false;
  input.focus();
  input.value += {ch};
  input.dispatchEvent(new Event('input', {{bubbles: true}}));
  return true;
}})()"#,
        id = str_lit(element_id),
        ch = str_lit(&ch.to_string()),
    )
}

fn clear_field_js(element_id: &str) -> String {
    format!(
        r#"(function(){{
  var input = document.getElementById({id});
  if (!input) return false;
  input.focus();
  input.value = '';
  input.dispatchEvent(new Event('input', {{bubbles: true}}));
  return true;
}})()"#,
        id = str_lit(element_id),
    )
}

/// One keystroke's pause: 14-19 characters per second with ±10% jitter and
/// an occasional longer hesitation.
fn keystroke_delay() -> Duration {
    let mut rng = rand::thread_rng();
    let cps: f64 = rng.gen_range(14.1..18.5);
    let base = 1.0 / cps;
    let jitter = rng.gen_range(-0.1..0.1) * base;
    let mut secs = (base + jitter).max(0.01);
    if rng.gen_bool(0.05) {
        secs += rng.gen_range(0.05..0.15);
    }
    Duration::from_secs_f64(secs)
}

impl GuestModalAuthenticator {
    pub fn new(page: Arc<dyn PageSession>) -> Self {
        Self { page }
    }

    /// A visible guest modal means the visitor is signed out.
    pub async fn guest_modal_visible(&self) -> Result<bool, SessionError> {
        let value = self.page.evaluate(&guest_modal_visible_js()).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    /// Run the full sign-in sequence when the guest modal is showing.
    /// Returns `false` when no modal was present and nothing was done.
    pub async fn sign_in_if_needed(
        &self,
        credentials: &Credentials,
        return_url: &str,
    ) -> Result<bool, SessionError> {
        if !self.guest_modal_visible().await? {
            debug!(target: "auth", "no guest modal, already signed in");
            return Ok(false);
        }

        info!(target: "auth", "guest modal detected, signing in");
        let clicked = self.page.evaluate(&click_login_link_js()).await?;
        if clicked.as_bool() != Some(true) {
            return Err(SessionError::Js(
                "guest modal has no visible login link".to_string(),
            ));
        }

        self.wait_for_login_form(Duration::from_secs(10)).await?;

        self.type_field("user_login", &credentials.username).await?;
        sleep(Duration::from_millis(500)).await;
        self.type_field("user_password", &credentials.password)
            .await?;
        sleep(Duration::from_millis(500)).await;

        let submitted = self.page.evaluate(&submit_sign_in_js()).await?;
        if submitted.as_bool() != Some(true) {
            return Err(SessionError::Js("sign-in form has no submit path".to_string()));
        }

        self.wait_for_return(return_url, Duration::from_secs(20))
            .await?;
        self.page.wait_until_ready(Duration::from_secs(10)).await?;
        info!(target: "auth", "sign-in completed, back on the sale page");
        Ok(true)
    }

    async fn wait_for_login_form(&self, limit: Duration) -> Result<(), SessionError> {
        let started = Instant::now();
        loop {
            let present = self
                .page
                .evaluate("!!document.getElementById('user_login')")
                .await?;
            if present.as_bool() == Some(true) {
                return Ok(());
            }
            if started.elapsed() >= limit {
                return Err(SessionError::Timeout(
                    "sign-in form never appeared".to_string(),
                ));
            }
            sleep(Duration::from_millis(200)).await;
        }
    }

    /// Clear the field, then type character by character at human pace.
    async fn type_field(&self, element_id: &str, text: &str) -> Result<(), SessionError> {
        let cleared = self.page.evaluate(&clear_field_js(element_id)).await?;
        if cleared.as_bool() != Some(true) {
            return Err(SessionError::Js(format!("no #{element_id} field to fill")));
        }
        for ch in text.chars() {
            self.page.evaluate(&append_char_js(element_id, ch)).await?;
            sleep(keystroke_delay()).await;
        }
        Ok(())
    }

    async fn wait_for_return(&self, return_url: &str, limit: Duration) -> Result<(), SessionError> {
        let started = Instant::now();
        loop {
            match self.page.current_url().await {
                Ok(url) if url.starts_with(return_url) => return Ok(()),
                Ok(_) => {}
                Err(err) => debug!(target: "auth", %err, "url probe failed mid-redirect"),
            }
            if started.elapsed() >= limit {
                return Err(SessionError::Timeout(
                    "never redirected back to the sale page".to_string(),
                ));
            }
            sleep(Duration::from_millis(250)).await;
        }
    }
}
