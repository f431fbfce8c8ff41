//! Asking a reasoning service where the reviews live on a page.
//!
//! The service sees sanitized HTML and answers with class names in a fixed
//! JSON shape. Answers are often wrapped in prose or markdown fences, so
//! recovery tries a strict parse first and a tolerant one second.

pub mod openai;
mod prompt;

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::schema::SelectorSchema;

pub use openai::OpenAiService;

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"```(?:json|JSON)?").unwrap());

/// One prompt plus the response shape the service must fill in.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub prompt: String,
    pub function_name: &'static str,
    /// JSON Schema for the function's parameters.
    pub response_format: Value,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("API error: {0}")]
    Api(String),
    #[error("could not read service reply: {0}")]
    Parse(String),
    #[error("service returned no content")]
    Empty,
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("reply does not contain a JSON object")]
    MalformedResponse,
    #[error("reply is not valid JSON: {0}")]
    Unparseable(String),
    #[error(transparent)]
    Service(#[from] ServiceError),
}

#[async_trait]
pub trait ReasoningService: Send + Sync {
    /// Send one request and return the raw text of the answer.
    async fn complete(&self, request: &InferenceRequest) -> Result<String, ServiceError>;
}

#[async_trait]
impl<T: ReasoningService + ?Sized> ReasoningService for std::sync::Arc<T> {
    async fn complete(&self, request: &InferenceRequest) -> Result<String, ServiceError> {
        (**self).complete(request).await
    }
}

pub struct SchemaInference<S> {
    service: S,
}

impl<S: ReasoningService> SchemaInference<S> {
    pub fn new(service: S) -> Self {
        Self { service }
    }

    /// One service call; retries are the caller's business.
    pub async fn infer(&self, html: &str) -> Result<SelectorSchema, InferenceError> {
        let request = prompt::build_request(html);
        debug!("Inference prompt is {} bytes", request.prompt.len());

        let reply = self.service.complete(&request).await?;
        debug!("Service replied with {} bytes", reply.len());

        let schema = recover_schema(&reply)?;
        info!(
            "Inferred schema: item={}, pagination={}",
            schema
                .review_body()
                .review_item_class
                .as_ref()
                .map(|c| c.as_str())
                .unwrap_or("-"),
            schema.style()
        );
        Ok(schema)
    }
}

/// Parse a service reply into a schema: strict first, tolerant second.
pub fn recover_schema(reply: &str) -> Result<SelectorSchema, InferenceError> {
    let value = match parse_strict(reply) {
        Some(value) => value,
        None => {
            debug!("Strict parse failed; cleaning up the reply");
            parse_tolerant(reply)?
        }
    };
    SelectorSchema::from_value(value).map_err(|e| InferenceError::Unparseable(e.to_string()))
}

fn parse_strict(reply: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(reply.trim()).ok()? {
        value @ Value::Object(_) => Some(value),
        // Some services double-encode the arguments.
        Value::String(inner) => match serde_json::from_str::<Value>(inner.trim()).ok()? {
            value @ Value::Object(_) => Some(value),
            _ => None,
        },
        _ => None,
    }
}

fn parse_tolerant(reply: &str) -> Result<Value, InferenceError> {
    let unfenced = FENCE_RE.replace_all(reply, "");
    let trimmed = unfenced.trim();

    let candidate = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => trimmed,
    };
    if !(candidate.starts_with('{') && candidate.ends_with('}')) {
        warn!("Service reply has no JSON object: {:.80}", trimmed);
        return Err(InferenceError::MalformedResponse);
    }

    serde_json::from_str(candidate).map_err(|e| InferenceError::Unparseable(e.to_string()))
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Replies from a script, counting every call.
    pub(crate) struct ScriptedService {
        replies: Mutex<VecDeque<Result<String, ServiceError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedService {
        pub fn new(replies: Vec<Result<String, ServiceError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ReasoningService for ScriptedService {
        async fn complete(&self, request: &InferenceRequest) -> Result<String, ServiceError> {
            assert_eq!(request.function_name, "generateReviewResponseFormat");
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(ServiceError::Empty))
        }
    }
}
