//! The KKTIX page strategy: every piece of site-specific DOM knowledge,
//! expressed as JavaScript snippet builders plus a [`PageProbe`] impl that
//! evaluates them over the session.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tixrace_autofill::probe::{ButtonState, PageProbe};
use tixrace_autofill::AutofillError;
use tixrace_core_types::{PageKind, SelectorSet, TicketCandidate};

use crate::js::str_lit;
use crate::session::PageSession;
use crate::SessionError;

pub struct KktixProbe {
    page: Arc<dyn PageSession>,
    selectors: SelectorSet,
}

impl KktixProbe {
    pub fn new(page: Arc<dyn PageSession>) -> Self {
        Self::with_selectors(page, SelectorSet::default())
    }

    pub fn with_selectors(page: Arc<dyn PageSession>, selectors: SelectorSet) -> Self {
        Self { page, selectors }
    }
}

fn probe_err(err: SessionError) -> AutofillError {
    AutofillError::Probe(err.to_string())
}

/// Shape of one unit as serialized by the extraction snippet.
#[derive(Deserialize)]
struct RawCandidate {
    name1: String,
    name2: String,
    seat: String,
    price: Option<u32>,
    id: Option<String>,
}

/// Script run in every fresh document before page code, resetting the
/// per-load payment-detection cache.
pub fn bootstrap_js() -> String {
    "(function(){ window.__tx_payment_confirmed = false; })();".to_string()
}

/// Classify the document: a confirm-order control marks checkout, the
/// ticket list marks the sale listing. A positive checkout verdict is
/// cached in a window global for the lifetime of the load.
pub fn page_kind_js(selectors: &SelectorSet) -> String {
    format!(
        r#"(function(){{
  if (window.__tx_payment_confirmed === true) return 'payment';
  if (document.querySelector('a[ng-click="confirmOrder()"]')) {{
    window.__tx_payment_confirmed = true;
    return 'payment';
  }}
  var list = document.querySelector('.ticket-list');
  var units = document.querySelectorAll({unit});
  if (list && units.length > 0) return 'listing';
  return 'other';
}})()"#,
        unit = str_lit(&selectors.unit)
    )
}

/// Did the browser itself classify this load as a reload.
pub fn reload_evidence_js() -> String {
    r#"(function(){
  try {
    var entries = performance.getEntriesByType('navigation');
    if (entries.length > 0) return entries[0].type === 'reload';
  } catch (e) {}
  return !!(window.performance && performance.navigation && performance.navigation.type === 1);
})()"#
        .to_string()
}

/// Snapshot every rendered unit. The primary name takes direct text nodes
/// only, so nested badge elements don't pollute the comparison; prices are
/// reduced to their digits.
pub fn candidates_js(selectors: &SelectorSet) -> String {
    format!(
        r#"(function(){{
  function baseText(el){{ return (el ? (el.textContent || '') : '').replace(/\s+/g, ' ').trim(); }}
  function digitsInt(el){{
    var s = baseText(el).replace(/[^0-9]/g, '');
    return s ? parseInt(s, 10) : null;
  }}
  var units = Array.from(document.querySelectorAll({unit}));
  return units.map(function(u){{
    var nameEl = u.querySelector({name});
    var nm1 = '';
    if (nameEl) {{
      for (var i = 0; i < nameEl.childNodes.length; i++) {{
        var node = nameEl.childNodes[i];
        if (node.nodeType === 3) nm1 += node.textContent;
      }}
      nm1 = nm1.replace(/\s+/g, ' ').trim();
    }}
    var anchor = u.querySelector('.display-table[id]');
    return {{
      name1: nm1,
      name2: baseText(u.querySelector({name2})),
      seat: baseText(u.querySelector({seat})),
      price: digitsInt(u.querySelector({price})),
      id: anchor ? anchor.id : null
    }};
  }});
}})()"#,
        unit = str_lit(&selectors.unit),
        name = str_lit(&selectors.name),
        name2 = str_lit(&selectors.name2),
        seat = str_lit(&selectors.seat),
        price = str_lit(&selectors.price),
    )
}

pub fn quantity_present_js(unit_index: usize, selectors: &SelectorSet) -> String {
    format!(
        r#"(function(){{
  var unit = document.querySelectorAll({unit})[{unit_index}];
  return !!(unit && unit.querySelector({qty}));
}})()"#,
        unit = str_lit(&selectors.unit),
        qty = str_lit(&selectors.qty_input),
    )
}

/// Keystroke-level quantity entry. The page's reactive framework listens
/// for input events, so plain value assignment would not register.
pub fn type_quantity_js(unit_index: usize, selectors: &SelectorSet, quantity: &str) -> String {
    format!(
        r#"(function(){{
  var unit = document.querySelectorAll({unit})[{unit_index}];
  var input = unit ? unit.querySelector({qty}) : null;
  if (!input) return false;
  input.focus();
  input.value = '';
  input.dispatchEvent(new Event('input', {{bubbles: true}}));
  var text = {text};
  for (var i = 0; i < text.length; i++) {{
    var ch = text[i];
    input.dispatchEvent(new KeyboardEvent('keydown', {{bubbles: true, key: ch}}));
    input.value += ch;
    input.dispatchEvent(new Event('input', {{bubbles: true}}));
    input.dispatchEvent(new KeyboardEvent('keyup', {{bubbles: true, key: ch}}));
  }}
  input.dispatchEvent(new Event('change', {{bubbles: true}}));
  input.blur();
  return true;
}})()"#,
        unit = str_lit(&selectors.unit),
        qty = str_lit(&selectors.qty_input),
        text = str_lit(quantity),
    )
}

/// `null` when absent, else the checked state.
pub fn terms_state_js(selectors: &SelectorSet) -> String {
    format!(
        r#"(function(){{
  var box = document.querySelector({agree});
  return box ? box.checked : null;
}})()"#,
        agree = str_lit(&selectors.agree),
    )
}

pub fn click_terms_js(selectors: &SelectorSet) -> String {
    format!(
        r#"(function(){{
  var box = document.querySelector({agree});
  if (!box) return false;
  box.click();
  box.dispatchEvent(new Event('change', {{bubbles: true}}));
  return true;
}})()"#,
        agree = str_lit(&selectors.agree),
    )
}

/// Enablement goes beyond the disabled attribute: the site also parks the
/// button behind disabled classes and hidden computed style pre-open.
pub fn next_button_js(selectors: &SelectorSet) -> String {
    format!(
        r#"(function(){{
  var btn = document.querySelector({next});
  if (!btn) return 'missing';
  if (btn.disabled) return 'disabled';
  var cs = getComputedStyle(btn);
  if (cs.display === 'none' || cs.visibility === 'hidden') return 'disabled';
  var cls = (btn.className || '') + ' ' + (btn.getAttribute('class') || '');
  if (/btn-disabled|btn-disabled-alt|disabled|ng-disabled/.test(cls)) return 'disabled';
  return 'ready';
}})()"#,
        next = str_lit(&selectors.next_btn),
    )
}

pub fn click_next_js(selectors: &SelectorSet) -> String {
    format!(
        r#"(function(){{
  var btn = document.querySelector({next});
  if (!btn) return false;
  try {{ btn.click(); }}
  catch (e) {{ btn.dispatchEvent(new MouseEvent('click', {{bubbles: true}})); }}
  return true;
}})()"#,
        next = str_lit(&selectors.next_btn),
    )
}

#[async_trait]
impl PageProbe for KktixProbe {
    async fn detect_page_kind(&self) -> Result<PageKind, AutofillError> {
        let value = self
            .page
            .evaluate(&page_kind_js(&self.selectors))
            .await
            .map_err(probe_err)?;
        Ok(match value.as_str() {
            Some("payment") => PageKind::Payment,
            Some("listing") => PageKind::SaleListing,
            _ => PageKind::Other,
        })
    }

    async fn reload_evidence(&self) -> Result<bool, AutofillError> {
        let value = self
            .page
            .evaluate(&reload_evidence_js())
            .await
            .map_err(probe_err)?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn extract_candidates(
        &self,
        selectors: &SelectorSet,
    ) -> Result<Vec<TicketCandidate>, AutofillError> {
        let value = self
            .page
            .evaluate(&candidates_js(selectors))
            .await
            .map_err(probe_err)?;
        let raw: Vec<RawCandidate> = serde_json::from_value(value)
            .map_err(|err| AutofillError::Probe(format!("bad candidate payload: {err}")))?;
        Ok(raw
            .into_iter()
            .enumerate()
            .map(|(dom_index, c)| TicketCandidate {
                name1: c.name1,
                name2: c.name2,
                seat_label: c.seat,
                price: c.price,
                element_id: c.id,
                dom_index,
            })
            .collect())
    }

    async fn quantity_input_present(
        &self,
        unit_index: usize,
        selectors: &SelectorSet,
    ) -> Result<bool, AutofillError> {
        let value = self
            .page
            .evaluate(&quantity_present_js(unit_index, selectors))
            .await
            .map_err(probe_err)?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn type_quantity(
        &self,
        unit_index: usize,
        selectors: &SelectorSet,
        quantity: &str,
    ) -> Result<(), AutofillError> {
        let value = self
            .page
            .evaluate(&type_quantity_js(unit_index, selectors, quantity))
            .await
            .map_err(probe_err)?;
        if value.as_bool() == Some(true) {
            Ok(())
        } else {
            Err(AutofillError::Probe(
                "quantity input disappeared before typing".to_string(),
            ))
        }
    }

    async fn terms_checkbox(
        &self,
        selectors: &SelectorSet,
    ) -> Result<Option<bool>, AutofillError> {
        let value = self
            .page
            .evaluate(&terms_state_js(selectors))
            .await
            .map_err(probe_err)?;
        Ok(value.as_bool())
    }

    async fn click_terms(&self, selectors: &SelectorSet) -> Result<(), AutofillError> {
        let value = self
            .page
            .evaluate(&click_terms_js(selectors))
            .await
            .map_err(probe_err)?;
        if value.as_bool() == Some(true) {
            Ok(())
        } else {
            Err(AutofillError::Probe("terms checkbox not found".to_string()))
        }
    }

    async fn next_button(&self, selectors: &SelectorSet) -> Result<ButtonState, AutofillError> {
        let value = self
            .page
            .evaluate(&next_button_js(selectors))
            .await
            .map_err(probe_err)?;
        Ok(match value.as_str() {
            Some("ready") => ButtonState::Ready,
            Some("disabled") => ButtonState::Disabled,
            _ => ButtonState::Missing,
        })
    }

    async fn click_next(&self, selectors: &SelectorSet) -> Result<(), AutofillError> {
        let value = self
            .page
            .evaluate(&click_next_js(selectors))
            .await
            .map_err(probe_err)?;
        if value.as_bool() == Some(true) {
            Ok(())
        } else {
            Err(AutofillError::Probe("next button not found".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn snippets_escape_attribute_selectors() {
        let selectors = SelectorSet::default();
        let js = candidates_js(&selectors);
        // The price selector carries double quotes and must arrive escaped.
        assert!(js.contains(r#"\"ticket.price.cents > 0\""#));
        assert!(js.contains(r#"".ticket-unit.ng-scope""#));
    }

    #[test]
    fn quantity_snippet_embeds_the_typed_text_as_a_literal() {
        let selectors = SelectorSet::default();
        let js = type_quantity_js(2, &selectors, "2");
        assert!(js.contains("querySelectorAll(\".ticket-unit.ng-scope\")[2]"));
        assert!(js.contains("var text = \"2\";"));
    }

    #[test]
    fn page_kind_snippet_keys_on_the_confirm_order_control() {
        let js = page_kind_js(&SelectorSet::default());
        assert!(js.contains(r#"a[ng-click="confirmOrder()"]"#));
        assert!(js.contains("__tx_payment_confirmed"));
    }

    #[test]
    fn raw_candidates_map_into_dom_order() {
        let payload = json!([
            { "name1": "VIP", "name2": "", "seat": "電腦配位", "price": 1800, "id": "unit-0" },
            { "name1": "一般", "name2": "早鳥", "seat": "自行選位", "price": null, "id": null },
        ]);
        let raw: Vec<RawCandidate> = serde_json::from_value(payload).unwrap();
        assert_eq!(raw.len(), 2);
        assert_eq!(raw[0].price, Some(1800));
        assert_eq!(raw[1].price, None);
        assert_eq!(raw[1].id, None);
    }

    #[test]
    fn button_snippet_checks_disabled_classes() {
        let js = next_button_js(&SelectorSet::default());
        assert!(js.contains("btn-disabled|btn-disabled-alt|disabled|ng-disabled"));
        assert!(js.contains("getComputedStyle"));
    }
}
