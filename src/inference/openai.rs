use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{InferenceRequest, ReasoningService, ServiceError};
use crate::config::ServiceSettings;

/// Chat-completions client that forces a single function call.
pub struct OpenAiService {
    client: Client,
    endpoint: String,
    model: String,
    api_key: String,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Message {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCall>>,
    function_call: Option<FunctionCall>,
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    function: FunctionCall,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    #[serde(default)]
    arguments: String,
}

impl OpenAiService {
    pub fn new(settings: &ServiceSettings, api_key: String) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| ServiceError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: settings.endpoint.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            api_key,
            temperature: settings.temperature,
        })
    }

    fn body(&self, request: &InferenceRequest) -> Value {
        json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [
                { "role": "user", "content": request.prompt }
            ],
            "tools": [{
                "type": "function",
                "function": {
                    "name": request.function_name,
                    "parameters": request.response_format
                }
            }],
            "tool_choice": {
                "type": "function",
                "function": { "name": request.function_name }
            }
        })
    }
}

#[async_trait]
impl ReasoningService for OpenAiService {
    async fn complete(&self, request: &InferenceRequest) -> Result<String, ServiceError> {
        let url = format!("{}/chat/completions", self.endpoint);
        debug!("POST {} (model {})", url, self.model);

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.body(request))
            .send()
            .await
            .map_err(|e| ServiceError::Connection(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ServiceError::Api(format!("HTTP {}: {}", status, body)));
        }

        let chat: ChatResponse = resp
            .json()
            .await
            .map_err(|e| ServiceError::Parse(e.to_string()))?;
        extract_reply(chat)
    }
}

/// The function arguments when the model called the tool, else the message text.
fn extract_reply(chat: ChatResponse) -> Result<String, ServiceError> {
    let message = chat
        .choices
        .into_iter()
        .next()
        .map(|c| c.message)
        .ok_or(ServiceError::Empty)?;

    let from_tool = message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .next()
        .map(|call| call.function.arguments);
    let from_function = message.function_call.map(|call| call.arguments);

    from_tool
        .into_iter()
        .chain(from_function)
        .chain(message.content)
        .find(|text| !text.trim().is_empty())
        .ok_or(ServiceError::Empty)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(value: Value) -> Result<String, ServiceError> {
        extract_reply(serde_json::from_value(value).unwrap())
    }

    #[test]
    fn tool_call_arguments_win() {
        let reply = parse(json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {
                            "name": "generateReviewResponseFormat",
                            "arguments": "{\"pagination_info\":{\"exists\":false}}"
                        }
                    }]
                }
            }]
        }))
        .unwrap();
        assert_eq!(reply, r#"{"pagination_info":{"exists":false}}"#);
    }

    #[test]
    fn falls_back_to_legacy_function_call_then_content() {
        let reply = parse(json!({
            "choices": [{"message": {"function_call": {"name": "f", "arguments": "{}"}}}]
        }))
        .unwrap();
        assert_eq!(reply, "{}");

        let reply = parse(json!({
            "choices": [{"message": {"content": "```json\n{}\n```"}}]
        }))
        .unwrap();
        assert!(reply.contains("{}"));
    }

    #[test]
    fn empty_replies_are_errors() {
        assert!(matches!(parse(json!({"choices": []})), Err(ServiceError::Empty)));
        assert!(matches!(
            parse(json!({"choices": [{"message": {"content": "  "}}]})),
            Err(ServiceError::Empty)
        ));
    }

    #[test]
    fn request_forces_the_function() {
        let settings = ServiceSettings::default();
        let service = OpenAiService::new(&settings, "sk-test".into()).unwrap();
        let request = super::super::prompt::build_request("<div></div>");

        let body = service.body(&request);
        assert_eq!(body["model"], settings.model.as_str());
        assert_eq!(body["tools"][0]["function"]["name"], "generateReviewResponseFormat");
        assert_eq!(body["tool_choice"]["function"]["name"], "generateReviewResponseFormat");
        assert_eq!(body["messages"][0]["role"], "user");
    }
}
