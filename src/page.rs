//! Chrome page provider
//!
//! [`CdpPage`] implements [`Page`] over a CDP session. Each frame is driven
//! through its own isolated JavaScript world, so scripts see the frame's DOM
//! without touching the portal's globals and without reaching across origins
//! from the parent document.
//!
//! Elements are handed out as marker attributes: `find_visible` tags the
//! element it found and the marker value becomes the [`ElementId`]. The DOM is
//! shared between worlds, so the tag survives until the document is replaced.
//! `is_visible` only reads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::cdp::Session;
use crate::driver::{ElementId, Frame, InputInfo, Locator, Page};
use crate::error::{Error, Result};
use crate::model::RawRow;
use crate::wait::PollingWaiter;

/// Global counter for unique element markers
static MARKER_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Attribute carrying element markers
const MARKER_ATTR: &str = "data-lookup-id";

/// Name of the isolated world created in each frame
const WORLD_NAME: &str = "cedula_lookup";

/// Pause between `document.readyState` checks while a page loads
const LOAD_POLL: Duration = Duration::from_millis(100);

/// Helpers shared by every frame script
const PRELUDE: &str = r#"
const norm = (s) => (s || '').replace(/\s+/g, ' ').trim();
const textOf = (el) => norm(el.innerText || el.textContent || '');
const visible = (el) => {
  if (!el || !el.isConnected) return false;
  const style = getComputedStyle(el);
  if (style.display === 'none' || style.visibility === 'hidden' || parseFloat(style.opacity) === 0) return false;
  const r = el.getBoundingClientRect();
  return r.width > 0 && r.height > 0;
};
const labelsOf = (el) => {
  const out = [];
  if (el.id) {
    for (const l of document.querySelectorAll('label[for="' + CSS.escape(el.id) + '"]')) out.push(textOf(l));
  }
  const wrap = el.closest('label');
  if (wrap) out.push(textOf(wrap));
  const aria = el.getAttribute('aria-label');
  if (aria) out.push(norm(aria));
  const by = el.getAttribute('aria-labelledby');
  if (by) {
    for (const id of by.split(/\s+/)) {
      const n = document.getElementById(id);
      if (n) out.push(textOf(n));
    }
  }
  return out;
};
const BUTTONS = 'button, input[type="button"], input[type="submit"], input[type="reset"], [role="button"]';
const nameOf = (el) => norm(el.getAttribute('aria-label') || textOf(el) || el.value || el.title || '');
const candidates = (spec) => {
  switch (spec.kind) {
    case 'label': {
      const re = new RegExp(spec.pattern, 'i');
      return [...document.querySelectorAll('input, select, textarea, [role="textbox"], [role="combobox"]')]
        .filter((el) => labelsOf(el).some((l) => re.test(l)));
    }
    case 'css':
      return [...document.querySelectorAll(spec.selector)];
    case 'role': {
      const re = new RegExp(spec.pattern, 'i');
      const sel = spec.role === 'button' ? BUTTONS : '[role="' + CSS.escape(spec.role) + '"]';
      return [...document.querySelectorAll(sel)].filter((el) => re.test(nameOf(el)));
    }
    case 'button_text': {
      const needle = spec.text.toLowerCase();
      return [...document.querySelectorAll(BUTTONS)].filter((el) => nameOf(el).toLowerCase().includes(needle));
    }
    case 'text': {
      const re = new RegExp(spec.pattern, 'i');
      const out = new Set();
      if (!document.body) return [];
      const walker = document.createTreeWalker(document.body, NodeFilter.SHOW_TEXT);
      for (let n = walker.nextNode(); n; n = walker.nextNode()) {
        const el = n.parentElement;
        if (!el || el.closest('script, style, noscript')) continue;
        if (re.test(norm(n.nodeValue))) out.add(el);
      }
      return [...out];
    }
    default:
      throw new Error('unknown locator kind ' + spec.kind);
  }
};
const marked = (marker) => document.querySelector('[' + MARKER + '="' + marker + '"]');
"#;

/// Wrap a script body with the prelude and its JSON arguments
fn frame_script(body: &str, args: &Value) -> String {
    format!(
        "(() => {{\nconst MARKER = '{}';\n{}\nconst args = {};\n{}\n}})()",
        MARKER_ATTR, PRELUDE, args, body
    )
}

/// JSON shape of a locator as the frame scripts read it
fn locator_spec(locator: &Locator) -> Value {
    match locator {
        Locator::Label(re) => json!({ "kind": "label", "pattern": re.as_str() }),
        Locator::Css(selector) => json!({ "kind": "css", "selector": selector }),
        Locator::Role { role, name } => {
            json!({ "kind": "role", "role": role, "pattern": name.as_str() })
        }
        Locator::ButtonText(text) => json!({ "kind": "button_text", "text": text }),
        Locator::Text(re) => json!({ "kind": "text", "pattern": re.as_str() }),
    }
}

fn next_marker() -> String {
    format!("el-{}", MARKER_COUNTER.fetch_add(1, Ordering::SeqCst))
}

/// Chrome reports a destroyed execution context this way after navigation
fn is_stale_context(err: &Error) -> bool {
    matches!(err, Error::Cdp { message, .. }
        if message.contains("Cannot find context") || message.contains("context was destroyed"))
}

struct PageInner {
    session: Session,
    /// frame id -> isolated world context id
    worlds: Mutex<HashMap<String, i64>>,
}

impl PageInner {
    async fn world(&self, frame_id: &str) -> Result<i64> {
        if let Some(id) = self.worlds.lock().await.get(frame_id) {
            return Ok(*id);
        }
        let id = self
            .session
            .create_isolated_world(frame_id, WORLD_NAME)
            .await
            .map_err(|e| match e {
                Error::Cdp { .. } => Error::FrameNotFound(frame_id.to_string()),
                other => other,
            })?;
        self.worlds.lock().await.insert(frame_id.to_string(), id);
        Ok(id)
    }

    /// Evaluate in a frame's world, recreating the world once if it went stale
    async fn eval_in(&self, frame_id: &str, expression: &str) -> Result<Value> {
        let context = self.world(frame_id).await?;
        match self.session.evaluate(expression, Some(context)).await {
            Err(e) if is_stale_context(&e) => {
                tracing::debug!("Isolated world for frame {} went stale, recreating", frame_id);
                self.worlds.lock().await.remove(frame_id);
                let context = self.world(frame_id).await?;
                self.session.evaluate(expression, Some(context)).await
            }
            Err(Error::Script { message, .. }) => Err(Error::script(frame_id, message)),
            other => other,
        }
    }
}

/// A Chrome tab driven over CDP
pub struct CdpPage {
    inner: Arc<PageInner>,
    browser_context_id: Option<String>,
}

impl CdpPage {
    pub(crate) fn new(session: Session, browser_context_id: Option<String>) -> Self {
        Self {
            inner: Arc::new(PageInner {
                session,
                worlds: Mutex::new(HashMap::new()),
            }),
            browser_context_id,
        }
    }

    /// Get the underlying CDP session
    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    /// Browser context that owns this page, if any
    pub fn browser_context_id(&self) -> Option<&str> {
        self.browser_context_id.as_deref()
    }

    async fn ready_state_complete(&self) -> bool {
        matches!(
            self.inner.session.evaluate("document.readyState", None).await,
            Ok(Value::String(state)) if state == "complete"
        )
    }
}

#[async_trait]
impl Page for CdpPage {
    async fn frames(&self) -> Result<Vec<Arc<dyn Frame>>> {
        let tree = self.inner.session.get_frame_tree().await?;
        Ok(tree
            .flatten()
            .into_iter()
            .map(|info| {
                Arc::new(CdpFrame {
                    page: Arc::clone(&self.inner),
                    id: info.id,
                    url: info.url,
                }) as Arc<dyn Frame>
            })
            .collect())
    }

    async fn goto(&self, url: &str, timeout: Duration) -> Result<()> {
        tracing::debug!("Navigating to {}", url);
        let result = self.inner.session.navigate(url).await?;
        if let Some(reason) = result.error_text.filter(|t| !t.is_empty()) {
            return Err(Error::navigation(url, reason));
        }

        // Every frame gets a fresh document
        self.inner.worlds.lock().await.clear();

        let loaded = PollingWaiter::new(LOAD_POLL)
            .poll_until(|| self.ready_state_complete(), timeout)
            .await;
        if !loaded {
            tracing::warn!(
                "{} still loading after {}ms, continuing",
                url,
                timeout.as_millis()
            );
        }
        Ok(())
    }
}

/// One frame of a [`CdpPage`]
pub struct CdpFrame {
    page: Arc<PageInner>,
    id: String,
    url: String,
}

impl CdpFrame {
    async fn run(&self, body: &str, args: Value) -> Result<Value> {
        self.page.eval_in(&self.id, &frame_script(body, &args)).await
    }

    async fn act_on(&self, element: &ElementId, body: &str, extra: Value) -> Result<()> {
        let args = json!({ "marker": element.0, "extra": extra });
        match self.run(body, args).await? {
            Value::Bool(true) => Ok(()),
            _ => Err(Error::ElementDetached(element.0.clone())),
        }
    }
}

#[async_trait]
impl Frame for CdpFrame {
    fn id(&self) -> &str {
        &self.id
    }

    fn url(&self) -> &str {
        &self.url
    }

    async fn find_visible(&self, locator: &Locator, _probe: Duration) -> Result<Option<ElementId>> {
        let marker = next_marker();
        let found = self
            .run(
                r#"
                const el = candidates(args.spec).find(visible);
                if (!el) return false;
                el.setAttribute(MARKER, args.marker);
                return true;
                "#,
                json!({ "spec": locator_spec(locator), "marker": marker }),
            )
            .await?;
        Ok((found == Value::Bool(true)).then(|| ElementId(marker)))
    }

    async fn is_visible(&self, locator: &Locator, _probe: Duration) -> Result<bool> {
        let seen = self
            .run(
                "return candidates(args.spec).some(visible);",
                json!({ "spec": locator_spec(locator) }),
            )
            .await?;
        Ok(seen == Value::Bool(true))
    }

    async fn fill(&self, element: &ElementId, value: &str) -> Result<()> {
        self.act_on(
            element,
            r#"
            const el = marked(args.marker);
            if (!el) return false;
            el.scrollIntoView({ block: 'center' });
            el.focus();
            const proto = el instanceof HTMLTextAreaElement
              ? HTMLTextAreaElement.prototype
              : el instanceof HTMLSelectElement ? HTMLSelectElement.prototype : HTMLInputElement.prototype;
            const setter = Object.getOwnPropertyDescriptor(proto, 'value')?.set;
            if (setter) setter.call(el, args.extra); else el.value = args.extra;
            el.dispatchEvent(new Event('input', { bubbles: true }));
            el.dispatchEvent(new Event('change', { bubbles: true }));
            el.blur();
            return true;
            "#,
            json!(value),
        )
        .await
    }

    async fn click(&self, element: &ElementId) -> Result<()> {
        self.act_on(
            element,
            r#"
            const el = marked(args.marker);
            if (!el) return false;
            el.scrollIntoView({ block: 'center' });
            el.click();
            return true;
            "#,
            Value::Null,
        )
        .await
    }

    async fn count(&self, selector: &str) -> Result<usize> {
        let n = self
            .run(
                "return document.querySelectorAll(args.selector).length;",
                json!({ "selector": selector }),
            )
            .await?;
        Ok(n.as_u64().unwrap_or(0) as usize)
    }

    async fn rows(&self, row_selector: &str) -> Result<Vec<RawRow>> {
        let rows = self
            .run(
                r#"
                return [...document.querySelectorAll(args.selector)].map((tr) =>
                  [...tr.querySelectorAll('td')].map((td) => (td.innerText || td.textContent || '').trim())
                );
                "#,
                json!({ "selector": row_selector }),
            )
            .await?;
        Ok(serde_json::from_value(rows)?)
    }

    async fn inputs(&self) -> Result<Vec<InputInfo>> {
        let inputs = self
            .run(
                r#"
                return [...document.querySelectorAll('input, select, textarea')].filter(visible).map((el) => ({
                  tag: el.tagName.toLowerCase(),
                  id: el.id || '',
                  formcontrolname: el.getAttribute('formcontrolname') || '',
                  placeholder: el.getAttribute('placeholder') || '',
                }));
                "#,
                Value::Null,
            )
            .await?;
        Ok(serde_json::from_value(inputs)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controls::compile_pattern;

    #[test]
    fn test_locator_spec_shapes() {
        let label = locator_spec(&Locator::Label(compile_pattern(r"Nombre\(s\)*").unwrap()));
        assert_eq!(label, json!({ "kind": "label", "pattern": r"Nombre\(s\)*" }));

        let role = locator_spec(&Locator::Role {
            role: "button".into(),
            name: compile_pattern("buscar").unwrap(),
        });
        assert_eq!(role["kind"], "role");
        assert_eq!(role["role"], "button");
        assert_eq!(role["pattern"], "buscar");

        let css = locator_spec(&Locator::Css(r#"input[formcontrolname="curp"]"#.into()));
        assert_eq!(css["selector"], r#"input[formcontrolname="curp"]"#);
    }

    #[test]
    fn test_script_embeds_args_as_json() {
        let script = frame_script(
            "return args.value;",
            &json!({ "value": "O'Brien \"x\" </script>" }),
        );
        assert!(script.starts_with("(() => {"));
        assert!(script.trim_end().ends_with("})()"));
        assert!(script.contains(r#"const args = {"value":"O'Brien \"x\" </script>"};"#));
        assert!(script.contains(MARKER_ATTR));
    }

    #[test]
    fn test_markers_are_unique() {
        let a = next_marker();
        let b = next_marker();
        assert_ne!(a, b);
        assert!(a.starts_with("el-"));
    }

    #[test]
    fn test_stale_context_detection() {
        assert!(is_stale_context(&Error::cdp(
            "Runtime.evaluate",
            -32000,
            "Cannot find context with specified id"
        )));
        assert!(!is_stale_context(&Error::cdp("Runtime.evaluate", -32000, "Other")));
        assert!(!is_stale_context(&Error::ElementDetached("el-1".into())));
    }
}
