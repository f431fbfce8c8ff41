use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use serde_json::{json, Value};
use tracing::debug;

use super::{looks_like_score, Browser, BrowserError, PageScript, RecordQuery, WaitUntil};
use crate::sanitize::collapse_whitespace;
use crate::schema::NextControl;

/// Answers browser calls from saved HTML. Clicking a control that exists on
/// the current page moves to the next saved page.
#[derive(Debug, Default)]
pub struct SnapshotBrowser {
    pages: Vec<String>,
    current: usize,
    visited_urls: Vec<String>,
    clicks: Vec<String>,
    keys: Vec<String>,
    extractions: usize,
    fail_clicks_on: Option<usize>,
    fail_keys: bool,
}

impl SnapshotBrowser {
    pub fn new(pages: Vec<String>) -> Self {
        Self {
            pages,
            ..Self::default()
        }
    }

    pub fn from_files<P: AsRef<Path>>(paths: &[P]) -> std::io::Result<Self> {
        let pages = paths
            .iter()
            .map(std::fs::read_to_string)
            .collect::<std::io::Result<Vec<_>>>()?;
        Ok(Self::new(pages))
    }

    #[cfg(test)]
    /// Clicking while on `page` (1-based) fails with a navigation error.
    pub fn fail_clicks_on(mut self, page: usize) -> Self {
        self.fail_clicks_on = Some(page);
        self
    }

    #[cfg(test)]
    /// Every key press fails.
    pub fn fail_keys(mut self) -> Self {
        self.fail_keys = true;
        self
    }

    /// 1-based number of the page currently shown.
    pub fn current_page(&self) -> usize {
        self.current + 1
    }

    #[cfg(test)]
    pub fn visited_urls(&self) -> &[String] {
        &self.visited_urls
    }

    #[cfg(test)]
    pub fn clicks(&self) -> &[String] {
        &self.clicks
    }

    #[cfg(test)]
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    #[cfg(test)]
    /// How many times records were pulled from a page.
    pub fn extraction_count(&self) -> usize {
        self.extractions
    }

    fn page(&self) -> Result<&str, BrowserError> {
        self.pages
            .get(self.current)
            .map(String::as_str)
            .ok_or_else(|| BrowserError::Navigation("no saved page loaded".to_string()))
    }
}

#[async_trait]
impl Browser for SnapshotBrowser {
    async fn navigate(&mut self, url: &str, _wait: WaitUntil) -> Result<(), BrowserError> {
        if self.pages.is_empty() {
            return Err(BrowserError::Navigation(format!("no saved pages for {}", url)));
        }
        self.current = 0;
        self.visited_urls.push(url.to_string());
        Ok(())
    }

    async fn evaluate(&mut self, script: &PageScript) -> Result<Value, BrowserError> {
        let html = self.page()?;
        let value = match script {
            PageScript::BodyHtml => Value::String(body_html(html)),
            PageScript::ExtractRecords(query) => {
                let records = extract_records(html, query)?;
                self.extractions += 1;
                records
            }
            PageScript::NextControlActive(control) => Value::Bool(next_control_active(html, control)?),
        };
        Ok(value)
    }

    async fn wait_for_selector(
        &mut self,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), BrowserError> {
        // Saved pages never change, so there is nothing to wait for.
        if matches_any(self.page()?, selector)? {
            Ok(())
        } else {
            Err(BrowserError::Timeout {
                selector: selector.to_string(),
                timeout,
            })
        }
    }

    async fn click(&mut self, selector: &str) -> Result<(), BrowserError> {
        if !matches_any(self.page()?, selector)? {
            return Err(BrowserError::ElementNotFound(selector.to_string()));
        }
        self.clicks.push(selector.to_string());
        if self.fail_clicks_on == Some(self.current_page()) {
            return Err(BrowserError::Navigation(format!(
                "click on {} did not load page {}",
                selector,
                self.current_page() + 1
            )));
        }
        if self.current + 1 >= self.pages.len() {
            return Err(BrowserError::Navigation(format!(
                "no saved page after page {}",
                self.current_page()
            )));
        }
        self.current += 1;
        debug!("Snapshot advanced to page {}", self.current_page());
        Ok(())
    }

    async fn send_key(&mut self, key: &str) -> Result<(), BrowserError> {
        if self.fail_keys {
            return Err(BrowserError::Input(format!("{} rejected", key)));
        }
        self.keys.push(key.to_string());
        Ok(())
    }
}

// Html is not Send, so every parse stays inside a synchronous helper.

fn parse_selector(selector: &str) -> Result<Selector, BrowserError> {
    Selector::parse(selector)
        .map_err(|e| BrowserError::Script(format!("invalid selector {}: {:?}", selector, e)))
}

fn body_html(html: &str) -> String {
    let document = Html::parse_document(html);
    match Selector::parse("body") {
        Ok(body) => document
            .select(&body)
            .next()
            .map(|b| b.inner_html())
            .unwrap_or_default(),
        Err(_) => String::new(),
    }
}

fn matches_any(html: &str, selector: &str) -> Result<bool, BrowserError> {
    let selector = parse_selector(selector)?;
    let document = Html::parse_document(html);
    let found = document.select(&selector).next().is_some();
    Ok(found)
}

fn element_text(el: ElementRef<'_>) -> Option<String> {
    let text = collapse_whitespace(&el.text().collect::<String>());
    (!text.is_empty()).then_some(text)
}

fn element_rating(el: ElementRef<'_>) -> Option<String> {
    if let Some(score) = el.value().attr("data-score").map(str::trim) {
        if !score.is_empty() {
            return Some(score.to_string());
        }
    }
    element_text(el).filter(|t| looks_like_score(t))
}

fn find<'a>(el: ElementRef<'a>, selector: &Option<Selector>) -> Option<ElementRef<'a>> {
    selector.as_ref().and_then(|s| el.select(s).next())
}

fn extract_records(html: &str, query: &RecordQuery) -> Result<Value, BrowserError> {
    let item = parse_selector(&query.item)?;
    let field = |sel: &Option<String>| sel.as_deref().map(parse_selector).transpose();
    let rating = field(&query.rating)?;
    let author = field(&query.author)?;
    let title = field(&query.title)?;
    let body = field(&query.body)?;

    let document = Html::parse_document(html);
    let records: Vec<Value> = document
        .select(&item)
        .map(|el| {
            json!({
                "rating": find(el, &rating).and_then(element_rating),
                "author": find(el, &author).and_then(element_text),
                "title": find(el, &title).and_then(element_text),
                "description": find(el, &body).and_then(element_text),
            })
        })
        .collect();
    Ok(Value::Array(records))
}

fn next_control_active(html: &str, control: &NextControl) -> Result<bool, BrowserError> {
    let selector = parse_selector(&control.selector)?;
    let document = Html::parse_document(html);
    let active = match document.select(&selector).next() {
        None => false,
        Some(el) => match &control.inactive_class {
            Some(inactive) => !el.value().classes().any(|c| c == inactive),
            None => true,
        },
    };
    Ok(active)
}

/// Judge.me-style listing pages for tests. Every review carries its page
/// and position in its text so ordering and duplicates are visible.
#[cfg(test)]
pub(crate) fn review_listing(page: usize, reviews: usize, has_next: bool) -> String {
    let items: String = (1..=reviews)
        .map(|i| {
            format!(
                r#"<div class="jdgm-rev jdgm-divider-top">
                     <span class="jdgm-rev__rating" data-score="{score}"></span>
                     <span class="jdgm-rev__author">Author {page}-{i}</span>
                     <b class="jdgm-rev__title">Title {page}-{i}</b>
                     <div class="jdgm-rev__body"><p>Body {page}-{i}</p></div>
                   </div>"#,
                score = (i % 5) + 1,
            )
        })
        .collect();
    let next_class = if has_next {
        "jdgm-paginate__page jdgm-paginate__next-page"
    } else {
        "jdgm-paginate__page jdgm-paginate__next-page jdgm-paginate__page-inactive"
    };
    format!(
        r#"<html><body>
             <div class="jdgm-widget jdgm-review-widget">
               <div class="jdgm-rev-widg__reviews">{items}</div>
               <div class="jdgm-paginate">
                 <a class="jdgm-paginate__page jdgm-curt">{page}</a>
                 <a class="{next_class}"></a>
               </div>
             </div>
           </body></html>"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query() -> RecordQuery {
        RecordQuery {
            item: ".jdgm-rev".into(),
            rating: Some(".jdgm-rev__rating".into()),
            author: Some(".jdgm-rev__author".into()),
            title: Some(".jdgm-rev__title".into()),
            body: Some(".jdgm-rev__body".into()),
        }
    }

    fn fixture() -> String {
        std::fs::read_to_string("tests/fixtures/judgeme_page.html").unwrap()
    }

    #[tokio::test]
    async fn extracts_fields_relative_to_each_item() {
        let mut browser = SnapshotBrowser::new(vec![fixture()]);
        browser.navigate("https://shop.test", WaitUntil::Load).await.unwrap();

        let value = browser
            .evaluate(&PageScript::ExtractRecords(query()))
            .await
            .unwrap();
        assert_eq!(
            value,
            json!([
                {"rating": "5", "author": "Dana R.", "title": "Lovely product",
                 "description": "Noticed a difference within two days."},
                {"rating": "4", "author": "Priya K.", "title": "Tasty",
                 "description": "Good flavour, a bit sweet."}
            ])
        );
        assert_eq!(browser.extraction_count(), 1);
    }

    #[tokio::test]
    async fn missing_fields_come_back_null() {
        let html = r#"<div class="rev"><span class="stars">4.5</span></div>
                      <div class="rev"><span class="stars">great</span><i class="who"> </i></div>"#;
        let mut browser = SnapshotBrowser::new(vec![html.to_string()]);
        browser.navigate("https://shop.test", WaitUntil::Load).await.unwrap();

        let value = browser
            .evaluate(&PageScript::ExtractRecords(RecordQuery {
                item: ".rev".into(),
                rating: Some(".stars".into()),
                author: Some(".who".into()),
                title: None,
                body: Some(".missing".into()),
            }))
            .await
            .unwrap();
        assert_eq!(value[0]["rating"], "4.5");
        assert_eq!(value[1]["rating"], Value::Null);
        assert_eq!(value[1]["author"], Value::Null);
        assert_eq!(value[0]["title"], Value::Null);
        assert_eq!(value[0]["description"], Value::Null);
    }

    #[tokio::test]
    async fn body_html_returns_markup() {
        let mut browser = SnapshotBrowser::new(vec![fixture()]);
        browser.navigate("https://shop.test", WaitUntil::NetworkIdle).await.unwrap();
        let body = browser.evaluate(&PageScript::BodyHtml).await.unwrap();
        let body = body.as_str().unwrap();
        assert!(body.contains("jdgm-rev-widg__reviews"));
        assert!(!body.contains("<body"));
    }

    #[tokio::test]
    async fn next_control_respects_inactive_marker() {
        let control = NextControl {
            selector: ".jdgm-paginate__next-page".into(),
            inactive_class: Some("jdgm-paginate__page-inactive".into()),
        };
        let mut browser =
            SnapshotBrowser::new(vec![review_listing(1, 1, true), review_listing(2, 1, false)]);
        browser.navigate("https://shop.test", WaitUntil::Load).await.unwrap();

        let script = PageScript::NextControlActive(control);
        assert_eq!(browser.evaluate(&script).await.unwrap(), json!(true));
        browser.click(".jdgm-paginate__next-page").await.unwrap();
        assert_eq!(browser.current_page(), 2);
        assert_eq!(browser.evaluate(&script).await.unwrap(), json!(false));
    }

    #[tokio::test]
    async fn click_errors() {
        let mut browser = SnapshotBrowser::new(vec![review_listing(1, 1, true)]);
        browser.navigate("https://shop.test", WaitUntil::Load).await.unwrap();

        assert!(matches!(
            browser.click(".nope").await,
            Err(BrowserError::ElementNotFound(_))
        ));
        assert!(matches!(
            browser.click(".jdgm-paginate__next-page").await,
            Err(BrowserError::Navigation(_))
        ));
        assert_eq!(browser.current_page(), 1);
    }

    #[tokio::test]
    async fn wait_for_absent_selector_times_out() {
        let mut browser = SnapshotBrowser::new(vec![review_listing(1, 1, false)]);
        browser.navigate("https://shop.test", WaitUntil::Load).await.unwrap();

        browser
            .wait_for_selector(".jdgm-rev-widg__reviews", Duration::from_secs(1))
            .await
            .unwrap();
        let err = browser
            .wait_for_selector(".spr-reviews", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, BrowserError::Timeout { .. }));
    }

    #[tokio::test]
    async fn navigate_without_pages_fails() {
        let mut browser = SnapshotBrowser::new(Vec::new());
        assert!(browser.navigate("https://shop.test", WaitUntil::Load).await.is_err());
    }
}
