use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::browser::{Browser, BrowserError, PageScript, RecordQuery};
use crate::schema::{ClassName, ReviewBody};

pub const NO_RATING: &str = "N/A";
pub const NO_AUTHOR: &str = "No Author";
pub const NO_TITLE: &str = "No Title";
pub const NO_DESCRIPTION: &str = "No Description";

/// One review as written to the output. Fields that could not be located
/// hold their sentinel instead of being empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub rating: String,
    pub author: String,
    pub title: String,
    pub description: String,
}

/// What the page script hands back for one item.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawRecord {
    rating: Option<String>,
    author: Option<String>,
    title: Option<String>,
    description: Option<String>,
}

impl From<RawRecord> for Record {
    fn from(raw: RawRecord) -> Self {
        fn or_sentinel(value: Option<String>, sentinel: &str) -> String {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| sentinel.to_string())
        }

        Self {
            rating: or_sentinel(raw.rating, NO_RATING),
            author: or_sentinel(raw.author, NO_AUTHOR),
            title: or_sentinel(raw.title, NO_TITLE),
            description: or_sentinel(raw.description, NO_DESCRIPTION),
        }
    }
}

/// Selectors for one page of records, or `None` when the schema never named
/// the repeating item.
pub fn record_query(body: &ReviewBody) -> Option<RecordQuery> {
    let selector = |c: &Option<ClassName>| c.as_ref().map(ClassName::selector);
    Some(RecordQuery {
        item: body.item_selector()?,
        rating: selector(&body.rating_class),
        author: selector(&body.author_name_class).or_else(|| selector(&body.author_class)),
        title: selector(&body.title_class),
        body: selector(&body.body_text_class).or_else(|| selector(&body.content_class)),
    })
}

/// Read every review item on the current page, in document order.
pub async fn extract_page<B: Browser + ?Sized>(
    browser: &mut B,
    body: &ReviewBody,
) -> Result<Vec<Record>, BrowserError> {
    let Some(query) = record_query(body) else {
        warn!("Schema has no review_item_class; nothing to extract on this page");
        return Ok(Vec::new());
    };

    let value = browser.evaluate(&PageScript::ExtractRecords(query)).await?;
    let raw: Vec<RawRecord> = serde_json::from_value(value)
        .map_err(|e| BrowserError::Script(format!("unexpected record shape: {}", e)))?;
    debug!("Extracted {} records", raw.len());

    Ok(raw.into_iter().map(Record::from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::snapshot::{review_listing, SnapshotBrowser};
    use crate::browser::WaitUntil;

    fn body(item: Option<&str>) -> ReviewBody {
        ReviewBody {
            reviews_container_class: ClassName::new("jdgm-rev-widg__reviews"),
            review_item_class: item.and_then(ClassName::new),
            title_class: ClassName::new("jdgm-rev__title"),
            body_text_class: ClassName::new("jdgm-rev__body"),
            author_name_class: ClassName::new("jdgm-rev__author"),
            rating_class: ClassName::new("jdgm-rev__rating"),
            ..ReviewBody::default()
        }
    }

    async fn loaded(pages: Vec<String>) -> SnapshotBrowser {
        let mut browser = SnapshotBrowser::new(pages);
        browser.navigate("https://shop.test/products/cookies", WaitUntil::Load).await.unwrap();
        browser
    }

    #[tokio::test]
    async fn complete_items_have_no_sentinels() {
        let mut browser = loaded(vec![review_listing(1, 4, false)]).await;
        let records = extract_page(&mut browser, &body(Some("jdgm-rev jdgm-divider-top")))
            .await
            .unwrap();

        assert_eq!(records.len(), 4);
        for (i, record) in records.iter().enumerate() {
            let n = i + 1;
            assert_eq!(record.author, format!("Author 1-{}", n));
            assert_eq!(record.title, format!("Title 1-{}", n));
            assert_eq!(record.description, format!("Body 1-{}", n));
            assert_eq!(record.rating, ((n % 5) + 1).to_string());
        }
    }

    #[tokio::test]
    async fn missing_rating_becomes_sentinel() {
        let html = r#"<div class="jdgm-rev">
                        <span class="jdgm-rev__author">Sam</span>
                        <b class="jdgm-rev__title">Fine</b>
                        <div class="jdgm-rev__body">Does the job.</div>
                      </div>"#;
        let mut browser = loaded(vec![html.to_string()]).await;
        let records = extract_page(&mut browser, &body(Some("jdgm-rev"))).await.unwrap();

        assert_eq!(
            records,
            vec![Record {
                rating: NO_RATING.into(),
                author: "Sam".into(),
                title: "Fine".into(),
                description: "Does the job.".into(),
            }]
        );
    }

    #[tokio::test]
    async fn missing_item_class_is_empty_without_touching_the_page() {
        let mut browser = loaded(vec![review_listing(1, 3, false)]).await;
        let records = extract_page(&mut browser, &body(None)).await.unwrap();

        assert!(records.is_empty());
        assert_eq!(browser.extraction_count(), 0);
    }

    #[test]
    fn author_and_body_fall_back_to_broader_classes() {
        let body = ReviewBody {
            review_item_class: ClassName::new("rev"),
            author_class: ClassName::new("rev-author"),
            content_class: ClassName::new("rev-content"),
            ..ReviewBody::default()
        };
        let query = record_query(&body).unwrap();
        assert_eq!(query.author.as_deref(), Some(".rev-author"));
        assert_eq!(query.body.as_deref(), Some(".rev-content"));
        assert_eq!(query.rating, None);
    }

    #[test]
    fn blank_values_map_to_sentinels() {
        let record = Record::from(RawRecord {
            rating: Some("  ".into()),
            author: None,
            title: Some(" Great ".into()),
            description: Some(String::new()),
        });
        assert_eq!(record.rating, NO_RATING);
        assert_eq!(record.author, NO_AUTHOR);
        assert_eq!(record.title, "Great");
        assert_eq!(record.description, NO_DESCRIPTION);
    }
}
