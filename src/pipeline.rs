//! One end-to-end run: snapshot the page, infer a schema from it, then walk
//! the review pages with that schema.

use std::time::Duration;

use indicatif::ProgressBar;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::browser::{Browser, BrowserError, PageScript, WaitUntil};
use crate::config::Settings;
use crate::extract::Record;
use crate::inference::{InferenceError, ReasoningService, SchemaInference};
use crate::paginate::{PaginationConfig, PaginationController, PaginationOutcome, Termination};
use crate::sanitize::sanitize;
use crate::schema::SelectorSchema;

const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum RunFailure {
    #[error("could not capture the page: {0}")]
    Snapshot(#[source] BrowserError),
    #[error("could not infer selectors: {0}")]
    Inference(#[source] InferenceError),
    #[error("could not open the page for extraction: {0}")]
    Navigation(#[source] BrowserError),
    #[error("pagination stopped early: {0}")]
    Pagination(#[source] BrowserError),
}

/// Everything a run produced. `records` is always the best effort, even
/// when `failure` is set.
#[derive(Debug)]
pub struct RunReport {
    pub url: String,
    pub records: Vec<Record>,
    pub pages: usize,
    pub schema: Option<SelectorSchema>,
    pub failure: Option<RunFailure>,
}

impl RunReport {
    fn failed(url: &str, schema: Option<SelectorSchema>, failure: RunFailure) -> Self {
        Self {
            url: url.to_string(),
            records: Vec::new(),
            pages: 0,
            schema,
            failure: Some(failure),
        }
    }
}

pub struct Pipeline<S> {
    inference: SchemaInference<S>,
    pagination: PaginationConfig,
    initial_settle: Duration,
    max_html_chars: usize,
    inference_attempts: u32,
    retry_backoff: Duration,
    progress: Option<ProgressBar>,
}

impl<S: ReasoningService> Pipeline<S> {
    pub fn new(inference: SchemaInference<S>, settings: &Settings) -> Self {
        Self {
            inference,
            pagination: settings.pagination_config(),
            initial_settle: settings.timing.initial_settle(),
            max_html_chars: settings.run.max_html_chars,
            inference_attempts: settings.run.inference_attempts.max(1),
            retry_backoff: Duration::from_millis(settings.run.retry_backoff_ms),
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Use one session to capture the page and another to extract from it.
    pub async fn run_with_sessions<A, B>(&self, snapshot: &mut A, extraction: &mut B, url: &str) -> RunReport
    where
        A: Browser + ?Sized,
        B: Browser + ?Sized,
    {
        let schema = match self.capture_schema(snapshot, url).await {
            Ok(schema) => schema,
            Err(failure) => return RunReport::failed(url, None, failure),
        };
        self.extract_with_schema(extraction, url, schema).await
    }

    /// Both passes in the same session.
    pub async fn run<B: Browser + ?Sized>(&self, session: &mut B, url: &str) -> RunReport {
        let schema = match self.capture_schema(session, url).await {
            Ok(schema) => schema,
            Err(failure) => return RunReport::failed(url, None, failure),
        };
        self.extract_with_schema(session, url, schema).await
    }

    /// Load the page, sanitize its body and infer a schema from it.
    pub async fn capture_schema<B: Browser + ?Sized>(
        &self,
        browser: &mut B,
        url: &str,
    ) -> Result<SelectorSchema, RunFailure> {
        self.set_stage("capturing page");
        let body = snapshot_body(browser, url, self.initial_settle)
            .await
            .map_err(RunFailure::Snapshot)?;

        let sanitized = sanitize(&body);
        if sanitized.degraded {
            warn!("Review widget markup was unbalanced; inferring from the whole page");
        }
        let html = truncate_chars(&sanitized.html, self.max_html_chars);
        if html.len() < sanitized.html.len() {
            info!(
                "Truncated sanitized HTML from {} to {} bytes",
                sanitized.html.len(),
                html.len()
            );
        }

        self.set_stage("inferring selectors");
        self.infer_with_retry(html).await.map_err(RunFailure::Inference)
    }

    /// Open the page again and walk its review pages.
    pub async fn extract_with_schema<B: Browser + ?Sized>(
        &self,
        browser: &mut B,
        url: &str,
        schema: SelectorSchema,
    ) -> RunReport {
        self.set_stage("opening page");
        if let Err(e) = browser.navigate(url, WaitUntil::Load).await {
            return RunReport::failed(url, Some(schema), RunFailure::Navigation(e));
        }

        let mut controller = PaginationController::new(&schema, self.pagination.clone());
        if let Some(pb) = &self.progress {
            controller = controller.with_progress(pb.clone());
        }
        let PaginationOutcome {
            records,
            pages,
            termination,
            more_pages,
            ..
        } = controller.run(browser).await;

        if more_pages {
            warn!("Stopped after page {} with more pages still available", pages);
        }

        let failure = match termination {
            Termination::Done => None,
            Termination::Failed(e) => Some(RunFailure::Pagination(e)),
        };
        info!("Collected {} reviews over {} page(s)", records.len(), pages);

        RunReport {
            url: url.to_string(),
            records,
            pages,
            schema: Some(schema),
            failure,
        }
    }

    async fn infer_with_retry(&self, html: &str) -> Result<SelectorSchema, InferenceError> {
        let mut attempt = 1;
        loop {
            match self.inference.infer(html).await {
                Ok(schema) => return Ok(schema),
                Err(e) if attempt >= self.inference_attempts => return Err(e),
                Err(e) => {
                    let backoff = retry_backoff(self.retry_backoff, attempt);
                    warn!(
                        "Inference failed (attempt {}/{}): {}; retrying in {:.1}s",
                        attempt,
                        self.inference_attempts,
                        e,
                        backoff.as_secs_f64()
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    fn set_stage(&self, stage: &'static str) {
        if let Some(pb) = &self.progress {
            pb.set_message(stage);
        }
    }
}

/// Doubles per failed attempt, capped at [`MAX_RETRY_BACKOFF`].
fn retry_backoff(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(MAX_RETRY_BACKOFF)
}

async fn snapshot_body<B: Browser + ?Sized>(
    browser: &mut B,
    url: &str,
    settle: Duration,
) -> Result<String, BrowserError> {
    browser.navigate(url, WaitUntil::NetworkIdle).await?;
    if !settle.is_zero() {
        tokio::time::sleep(settle).await;
    }
    match browser.evaluate(&PageScript::BodyHtml).await? {
        Value::String(html) => {
            debug!("Captured {} bytes of body HTML", html.len());
            Ok(html)
        }
        other => Err(BrowserError::Script(format!(
            "body HTML came back as {}",
            other
        ))),
    }
}

/// Cut to at most `max` characters without splitting one.
fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
