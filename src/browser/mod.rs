//! The seam between the extraction logic and whatever drives the page.
//!
//! `chrome` talks to a real Chromium over CDP; `snapshot` answers the same
//! calls from saved HTML so runs can be replayed and tested offline.

pub mod chrome;
pub mod snapshot;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::schema::NextControl;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("timed out after {timeout:?} waiting for {selector}")]
    Timeout { selector: String, timeout: Duration },
    #[error("no element matches {0}")]
    ElementNotFound(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("script evaluation failed: {0}")]
    Script(String),
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("input dispatch failed: {0}")]
    Input(String),
}

/// When `navigate` may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitUntil {
    /// The load event fired.
    Load,
    /// Load fired and the document has gone quiet.
    NetworkIdle,
}

/// Selectors for one page worth of review records. Field selectors are
/// resolved relative to each item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordQuery {
    pub item: String,
    pub rating: Option<String>,
    pub author: Option<String>,
    pub title: Option<String>,
    pub body: Option<String>,
}

/// Scripts evaluated inside the page, with their arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageScript {
    /// `document.body.innerHTML` as a string.
    BodyHtml,
    /// Array of `{rating, author, title, description}`, each a string or null.
    ExtractRecords(RecordQuery),
    /// Whether the next-page control exists and is not marked inactive.
    NextControlActive(NextControl),
}

impl PageScript {
    /// Render as a self-invoking expression with JSON-encoded arguments.
    pub fn to_js(&self) -> String {
        match self {
            Self::BodyHtml => "document.body ? document.body.innerHTML : ''".to_string(),
            Self::ExtractRecords(query) => format!("({})({})", EXTRACT_RECORDS_JS, to_json(query)),
            Self::NextControlActive(control) => {
                format!("({})({})", NEXT_CONTROL_JS, to_json(control))
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::BodyHtml => "body-html",
            Self::ExtractRecords(_) => "extract-records",
            Self::NextControlActive(_) => "next-control-active",
        }
    }
}

fn to_json<T: Serialize>(args: &T) -> String {
    // Plain structs of strings; serialization cannot fail.
    serde_json::to_string(args).unwrap_or_else(|_| "null".to_string())
}

/// Ratings come from `data-score`, or from the element text when it is a bare number.
pub(crate) fn looks_like_score(text: &str) -> bool {
    let mut parts = text.splitn(2, '.');
    let whole = parts.next().unwrap_or("");
    let frac = parts.next();
    !whole.is_empty()
        && whole.bytes().all(|b| b.is_ascii_digit())
        && frac.map_or(true, |f| !f.is_empty() && f.bytes().all(|b| b.is_ascii_digit()))
}

const EXTRACT_RECORDS_JS: &str = r#"(q) => {
  const find = (el, sel) => (sel ? el.querySelector(sel) : null);
  const text = (node) => {
    if (!node) return null;
    const t = (node.innerText || node.textContent || '').replace(/\s+/g, ' ').trim();
    return t || null;
  };
  const rating = (node) => {
    if (!node) return null;
    const score = (node.getAttribute('data-score') || '').trim();
    if (score) return score;
    const t = text(node);
    return t && /^\d+(\.\d+)?$/.test(t) ? t : null;
  };
  return Array.from(document.querySelectorAll(q.item)).map((el) => ({
    rating: rating(find(el, q.rating)),
    author: text(find(el, q.author)),
    title: text(find(el, q.title)),
    description: text(find(el, q.body)),
  }));
}"#;

const NEXT_CONTROL_JS: &str = r#"(c) => {
  const el = document.querySelector(c.selector);
  if (!el) return false;
  return !(c.inactive_class && el.classList.contains(c.inactive_class));
}"#;

/// What the extraction pipeline needs from a browser session.
#[async_trait]
pub trait Browser: Send {
    async fn navigate(&mut self, url: &str, wait: WaitUntil) -> Result<(), BrowserError>;

    async fn evaluate(&mut self, script: &PageScript) -> Result<Value, BrowserError>;

    /// Fails with `BrowserError::Timeout` when nothing matches in time.
    async fn wait_for_selector(
        &mut self,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), BrowserError>;

    /// Fails with `BrowserError::ElementNotFound` when nothing matches.
    async fn click(&mut self, selector: &str) -> Result<(), BrowserError>;

    async fn send_key(&mut self, key: &str) -> Result<(), BrowserError>;
}
