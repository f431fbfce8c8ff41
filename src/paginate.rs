use std::time::Duration;

use indicatif::ProgressBar;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::browser::{Browser, BrowserError, PageScript};
use crate::extract::{extract_page, Record};
use crate::schema::{PaginationStyle, SelectorSchema};

const DISMISS_KEY: &str = "Escape";

/// Where the controller is in its walk over the review pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    Loading(usize),
    Extracting(usize),
    CheckingNext(usize),
    Navigating(usize),
    Done,
    Failed,
}

#[derive(Debug)]
pub enum Termination {
    Done,
    /// The review list never showed up; records gathered so far are kept.
    Failed(BrowserError),
}

#[derive(Debug)]
pub struct PaginationOutcome {
    pub records: Vec<Record>,
    /// Last page that finished loading.
    pub pages: usize,
    pub termination: Termination,
    /// The next control was still active when the walk stopped.
    pub more_pages: bool,
    pub trace: Vec<State>,
}

#[derive(Debug, Clone)]
pub struct PaginationConfig {
    pub container_timeout: Duration,
    pub settle_delay: Duration,
    pub max_pages: usize,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            container_timeout: Duration::from_secs(60),
            settle_delay: Duration::from_secs(3),
            max_pages: 500,
        }
    }
}

/// Mutable state threaded through one run.
#[derive(Debug)]
struct RunState {
    page_number: usize,
    accumulated: Vec<Record>,
    has_more: bool,
}

/// Walks review pages with a fixed schema until the next control runs out.
pub struct PaginationController<'a> {
    schema: &'a SelectorSchema,
    config: PaginationConfig,
    progress: Option<ProgressBar>,
}

impl<'a> PaginationController<'a> {
    pub fn new(schema: &'a SelectorSchema, config: PaginationConfig) -> Self {
        Self {
            schema,
            config,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Drive the browser from page 1. Never fails outright: every outcome
    /// carries whatever records were collected.
    pub async fn run<B: Browser + ?Sized>(&self, browser: &mut B) -> PaginationOutcome {
        let style = self.schema.style();
        info!("Paginating with style {}", style);

        let mut run = RunState {
            page_number: 0,
            accumulated: Vec::new(),
            has_more: false,
        };
        let mut failure = None;
        let mut trace = Vec::new();
        let mut state = State::Loading(1);

        loop {
            trace.push(state.clone());
            state = match state {
                State::Loading(n) => match self.wait_for_reviews(browser).await {
                    Ok(()) => {
                        run.page_number = n;
                        self.report(&run);
                        self.dismiss_dialogs(browser).await;
                        State::Extracting(n)
                    }
                    Err(e) => {
                        warn!("Reviews never appeared on page {}: {}", n, e);
                        failure = Some(e);
                        State::Failed
                    }
                },
                State::Extracting(n) => {
                    if !style.defers_extraction() {
                        self.extract_into(browser, &mut run).await;
                    }
                    State::CheckingNext(n)
                }
                State::CheckingNext(n) => {
                    run.has_more = self.next_available(browser).await;
                    if run.has_more && n < self.config.max_pages {
                        State::Navigating(n + 1)
                    } else {
                        if run.has_more {
                            info!("Reached the {} page limit; stopping", self.config.max_pages);
                        }
                        self.finish(browser, &mut run, style).await;
                        State::Done
                    }
                }
                State::Navigating(n) => match self.advance(browser).await {
                    Ok(()) => State::Loading(n),
                    Err(e) => {
                        info!("Could not move to page {} ({}); finishing with what we have", n, e);
                        self.finish(browser, &mut run, style).await;
                        State::Done
                    }
                },
                State::Done | State::Failed => break,
            };
        }

        debug!("Pagination trace: {:?}", trace);
        let termination = match failure {
            Some(e) => Termination::Failed(e),
            None => Termination::Done,
        };
        PaginationOutcome {
            records: run.accumulated,
            pages: run.page_number,
            termination,
            more_pages: run.has_more,
            trace,
        }
    }

    async fn wait_for_reviews<B: Browser + ?Sized>(&self, browser: &mut B) -> Result<(), BrowserError> {
        match self.schema.ready_selector() {
            Some(selector) => {
                browser
                    .wait_for_selector(&selector, self.config.container_timeout)
                    .await
            }
            None => {
                warn!("Schema names no reviews container or item; not waiting for the list");
                Ok(())
            }
        }
    }

    async fn dismiss_dialogs<B: Browser + ?Sized>(&self, browser: &mut B) {
        if let Err(e) = browser.send_key(DISMISS_KEY).await {
            warn!("Could not dismiss dialogs: {}", e);
        }
    }

    async fn extract_into<B: Browser + ?Sized>(&self, browser: &mut B, run: &mut RunState) {
        match extract_page(browser, self.schema.review_body()).await {
            Ok(records) => {
                info!("Page {}: {} reviews", run.page_number, records.len());
                run.accumulated.extend(records);
                self.report(run);
            }
            Err(e) => warn!("Extraction failed on page {}: {}", run.page_number, e),
        }
    }

    /// Deferred styles read the page once, after the last advance.
    async fn finish<B: Browser + ?Sized>(
        &self,
        browser: &mut B,
        run: &mut RunState,
        style: PaginationStyle,
    ) {
        if style.defers_extraction() {
            self.extract_into(browser, run).await;
        }
    }

    async fn next_available<B: Browser + ?Sized>(&self, browser: &mut B) -> bool {
        let Some(control) = self.schema.next_control() else {
            return false;
        };
        match browser.evaluate(&PageScript::NextControlActive(control)).await {
            Ok(Value::Bool(active)) => active,
            Ok(other) => {
                warn!("Next-control check returned {}; assuming last page", other);
                false
            }
            Err(e) => {
                warn!("Next-control check failed: {}; assuming last page", e);
                false
            }
        }
    }

    async fn advance<B: Browser + ?Sized>(&self, browser: &mut B) -> Result<(), BrowserError> {
        let control = self
            .schema
            .next_control()
            .ok_or_else(|| BrowserError::ElementNotFound("next page control".to_string()))?;
        browser.click(&control.selector).await?;
        self.wait_for_reviews(browser).await?;
        if !self.config.settle_delay.is_zero() {
            tokio::time::sleep(self.config.settle_delay).await;
        }
        Ok(())
    }

    fn report(&self, run: &RunState) {
        if let Some(pb) = &self.progress {
            pb.set_message(format!(
                "page {} · {} reviews",
                run.page_number,
                run.accumulated.len()
            ));
        }
    }
}
