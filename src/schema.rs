use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::warn;

/// A non-empty CSS class token, possibly a space-joined run of several.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassName(String);

impl ClassName {
    /// Normalize a class string from the service. Blank input is `None`.
    pub fn new(raw: &str) -> Option<Self> {
        let trimmed = raw.trim().trim_start_matches('.').trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.split_whitespace().collect::<Vec<_>>().join(" ")))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Only the first token is authoritative for matching.
    pub fn first_token(&self) -> &str {
        self.0.split(' ').next().unwrap_or(&self.0)
    }

    pub fn selector(&self) -> String {
        format!(".{}", self.first_token())
    }
}

impl fmt::Display for ClassName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Lenient field decoding ──
//
// The reasoning service answers in loosely typed JSON: classes arrive as
// strings, arrays, "null" or "". None of that should fail the whole parse.

fn class_from_value(value: &Value) -> Option<ClassName> {
    match value {
        Value::String(s) if !s.eq_ignore_ascii_case("null") => ClassName::new(s),
        Value::Array(items) => {
            let joined = items
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(" ");
            ClassName::new(&joined)
        }
        _ => None,
    }
}

fn lenient_class<'de, D>(deserializer: D) -> Result<Option<ClassName>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(class_from_value))
}

fn lenient_class_list<'de, D>(deserializer: D) -> Result<Vec<ClassName>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    let classes = match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .flat_map(str::split_whitespace)
            .filter_map(ClassName::new)
            .collect(),
        Some(Value::String(s)) => s.split_whitespace().filter_map(ClassName::new).collect(),
        _ => Vec::new(),
    };
    Ok(classes)
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => {
            let s = s.trim();
            (!s.is_empty() && !s.eq_ignore_ascii_case("null")).then(|| s.to_string())
        }
        _ => None,
    })
}

fn lenient_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    let mut map = BTreeMap::new();
    if let Some(Value::Object(obj)) = value {
        for (key, v) in obj {
            let text = match v {
                Value::String(s) => s,
                Value::Null => continue,
                other => other.to_string(),
            };
            if !key.trim().is_empty() && !text.is_empty() {
                map.insert(key, text);
            }
        }
    }
    Ok(map)
}

fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Bool(b)) => b,
        Some(Value::String(s)) => s.trim().eq_ignore_ascii_case("true"),
        _ => false,
    })
}

// ── Schema parts ──

/// Identifies the root of the review section, when the service found one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ContainerSignature {
    #[serde(deserialize_with = "lenient_string")]
    pub id: Option<String>,
    #[serde(rename = "class", deserialize_with = "lenient_class_list")]
    pub classes: Vec<ClassName>,
    #[serde(
        rename = "data-attributes",
        alias = "data_attributes",
        deserialize_with = "lenient_map"
    )]
    pub data_attributes: BTreeMap<String, String>,
}

impl ContainerSignature {
    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.classes.is_empty() && self.data_attributes.is_empty()
    }

    /// `#id` when an id is known, otherwise the compound class selector.
    pub fn selector(&self) -> Option<String> {
        if let Some(id) = &self.id {
            return Some(format!("#{}", id));
        }
        if self.classes.is_empty() {
            return None;
        }
        Some(
            self.classes
                .iter()
                .map(|c| format!(".{}", c.first_token()))
                .collect::<String>(),
        )
    }
}

/// Review roles mapped to class tokens. Field names on the wire follow the
/// service contract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReviewBody {
    #[serde(rename = "class", deserialize_with = "lenient_class")]
    pub wrapper_class: Option<ClassName>,
    #[serde(rename = "reviews_class", deserialize_with = "lenient_class")]
    pub reviews_container_class: Option<ClassName>,
    #[serde(deserialize_with = "lenient_class")]
    pub review_item_class: Option<ClassName>,
    #[serde(rename = "review_content_class", deserialize_with = "lenient_class")]
    pub content_class: Option<ClassName>,
    #[serde(rename = "review_title_class", deserialize_with = "lenient_class")]
    pub title_class: Option<ClassName>,
    #[serde(rename = "review_body_text_class", deserialize_with = "lenient_class")]
    pub body_text_class: Option<ClassName>,
    #[serde(rename = "review_timestamp_class", deserialize_with = "lenient_class")]
    pub timestamp_class: Option<ClassName>,
    #[serde(rename = "review_author_class", deserialize_with = "lenient_class")]
    pub author_class: Option<ClassName>,
    #[serde(rename = "review_author_name_class", deserialize_with = "lenient_class")]
    pub author_name_class: Option<ClassName>,
    #[serde(rename = "review_buyer_badge_class", deserialize_with = "lenient_class")]
    pub buyer_badge_class: Option<ClassName>,
    #[serde(rename = "review_social_class", deserialize_with = "lenient_class")]
    pub social_class: Option<ClassName>,
    #[serde(rename = "review_votes_class", deserialize_with = "lenient_class")]
    pub votes_class: Option<ClassName>,
    #[serde(rename = "review_rating_class", deserialize_with = "lenient_class")]
    pub rating_class: Option<ClassName>,
}

impl ReviewBody {
    /// Selector for the repeating review element.
    pub fn item_selector(&self) -> Option<String> {
        self.review_item_class.as_ref().map(ClassName::selector)
    }

    fn roles(&self) -> [(&'static str, Option<&ClassName>); 13] {
        [
            ("wrapper", self.wrapper_class.as_ref()),
            ("reviews", self.reviews_container_class.as_ref()),
            ("item", self.review_item_class.as_ref()),
            ("content", self.content_class.as_ref()),
            ("title", self.title_class.as_ref()),
            ("body", self.body_text_class.as_ref()),
            ("timestamp", self.timestamp_class.as_ref()),
            ("author", self.author_class.as_ref()),
            ("author name", self.author_name_class.as_ref()),
            ("buyer badge", self.buyer_badge_class.as_ref()),
            ("social", self.social_class.as_ref()),
            ("votes", self.votes_class.as_ref()),
            ("rating", self.rating_class.as_ref()),
        ]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PaginationSelectors {
    #[serde(deserialize_with = "lenient_class")]
    pub pagination_class: Option<ClassName>,
    #[serde(deserialize_with = "lenient_class")]
    pub page_class: Option<ClassName>,
    #[serde(deserialize_with = "lenient_class")]
    pub current_page_class: Option<ClassName>,
    #[serde(deserialize_with = "lenient_class")]
    pub next_page_class: Option<ClassName>,
    #[serde(deserialize_with = "lenient_class")]
    pub last_page_class: Option<ClassName>,
    #[serde(deserialize_with = "lenient_class")]
    pub spinner_wrapper_class: Option<ClassName>,
    #[serde(deserialize_with = "lenient_class")]
    pub spinner_class: Option<ClassName>,
}

impl PaginationSelectors {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn roles(&self) -> [(&'static str, Option<&ClassName>); 7] {
        [
            ("pagination", self.pagination_class.as_ref()),
            ("page", self.page_class.as_ref()),
            ("current page", self.current_page_class.as_ref()),
            ("next page", self.next_page_class.as_ref()),
            ("last page", self.last_page_class.as_ref()),
            ("spinner wrapper", self.spinner_wrapper_class.as_ref()),
            ("spinner", self.spinner_class.as_ref()),
        ]
    }
}

/// How the page advances. Decided once, when the schema is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaginationStyle {
    /// A distinct "next" control replaces the list on click.
    ButtonAdvance,
    /// Only a generic page control; content accumulates in place.
    AccumulateOnly,
    /// Single page.
    None,
}

impl PaginationStyle {
    fn resolve(pagination: Option<&PaginationSelectors>) -> Self {
        match pagination {
            Some(p) if p.next_page_class.is_some() => Self::ButtonAdvance,
            Some(p) if p.page_class.is_some() => Self::AccumulateOnly,
            _ => Self::None,
        }
    }

    /// Extraction is postponed until no further advance is possible.
    pub fn defers_extraction(self) -> bool {
        !matches!(self, Self::ButtonAdvance)
    }
}

impl fmt::Display for PaginationStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ButtonAdvance => "button-advance",
            Self::AccumulateOnly => "accumulate-only",
            Self::None => "none",
        };
        f.write_str(name)
    }
}

/// The control to query and click when moving to the next page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NextControl {
    pub selector: String,
    /// Marker class meaning the control is disabled (`<page_class>-inactive`).
    pub inactive_class: Option<String>,
}

// ── Schema ──

/// Where reviews and pagination controls live on one page.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectorSchema {
    container: Option<ContainerSignature>,
    review_body: ReviewBody,
    pagination: Option<PaginationSelectors>,
    pagination_declared: bool,
    style: PaginationStyle,
}

impl SelectorSchema {
    pub fn new(
        container: Option<ContainerSignature>,
        review_body: ReviewBody,
        pagination: Option<PaginationSelectors>,
        pagination_declared: bool,
    ) -> Self {
        let container = container.filter(|c| !c.is_empty());
        let pagination = pagination.filter(|p| !p.is_empty());

        if pagination.is_some() != pagination_declared {
            warn!(
                pagination_object = pagination.is_some(),
                pagination_declared,
                "Service disagrees with itself about pagination; trusting the pagination object"
            );
        }

        let style = PaginationStyle::resolve(pagination.as_ref());
        if pagination.is_some() && style == PaginationStyle::None {
            warn!("Pagination object has neither next_page_class nor page_class; treating as single page");
        }

        Self {
            container,
            review_body,
            pagination,
            pagination_declared,
            style,
        }
    }

    /// Build from the service's JSON shape. Missing parts become `None`.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let wire: WireResponse = serde_json::from_value(value)?;
        Ok(wire.into_schema())
    }

    #[cfg(test)]
    pub fn container(&self) -> Option<&ContainerSignature> {
        self.container.as_ref()
    }

    pub fn review_body(&self) -> &ReviewBody {
        &self.review_body
    }

    #[cfg(test)]
    pub fn pagination(&self) -> Option<&PaginationSelectors> {
        self.pagination.as_ref()
    }

    #[cfg(test)]
    pub fn pagination_declared(&self) -> bool {
        self.pagination_declared
    }

    pub fn style(&self) -> PaginationStyle {
        self.style
    }

    /// Selector whose presence means the review list has rendered.
    pub fn ready_selector(&self) -> Option<String> {
        self.review_body
            .reviews_container_class
            .as_ref()
            .map(ClassName::selector)
            .or_else(|| self.container.as_ref().and_then(ContainerSignature::selector))
            .or_else(|| self.review_body.item_selector())
    }

    pub fn next_control(&self) -> Option<NextControl> {
        if self.style == PaginationStyle::None {
            return None;
        }
        let pagination = self.pagination.as_ref()?;
        let selector = pagination
            .next_page_class
            .as_ref()
            .or(pagination.page_class.as_ref())?
            .selector();
        let inactive_class = pagination
            .page_class
            .as_ref()
            .map(|c| format!("{}-inactive", c.first_token()));
        Some(NextControl {
            selector,
            inactive_class,
        })
    }
}

/// One line per role the service filled in.
impl fmt::Display for SelectorSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(container) = &self.container {
            let selector = container.selector().unwrap_or_default();
            let attrs: Vec<String> = container
                .data_attributes
                .iter()
                .map(|(k, v)| format!("[{}={}]", k, v))
                .collect();
            writeln!(f, "{:>16}: {}{}", "container", selector, attrs.concat())?;
        }
        let pagination = self.pagination.as_ref().map(PaginationSelectors::roles);
        let roles = self
            .review_body
            .roles()
            .into_iter()
            .chain(pagination.into_iter().flatten());
        for (role, class) in roles {
            if let Some(class) = class {
                writeln!(f, "{:>16}: {}", role, class)?;
            }
        }
        write!(
            f,
            "{:>16}: {} (declared: {})",
            "paging", self.style, self.pagination_declared
        )
    }
}

// ── Wire shape ──

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireSection {
    main_review_section_container: Option<ContainerSignature>,
    review_body: Option<ReviewBody>,
    pagination: Option<PaginationSelectors>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WirePaginationInfo {
    #[serde(deserialize_with = "lenient_bool")]
    exists: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireResponse {
    review_section: Option<WireSection>,
    pagination_info: Option<WirePaginationInfo>,
    // Some answers drop the review_section wrapper.
    #[serde(flatten)]
    unwrapped: WireSection,
}

impl WireResponse {
    fn into_schema(self) -> SelectorSchema {
        let section = self.review_section.unwrap_or(self.unwrapped);
        SelectorSchema::new(
            section.main_review_section_container,
            section.review_body.unwrap_or_default(),
            section.pagination,
            self.pagination_info.map(|p| p.exists).unwrap_or(false),
        )
    }
}
