//! Anthropic Messages API backend.

use crate::model::{
    Backend, Message, ModelError, ModelRequest, ModelResponse, Part, Role, ToolCall, ToolSpec,
    Usage,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_MAX_TOKENS: u32 = 1000;
const ANTHROPIC_VERSION: &str = "2023-06-01";

// ─────────────────────────────────────────────────────────────────────────────
// API Wire Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool<'a>>,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: &'static str,
    content: ApiContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ApiContent {
    Text(String),
    Blocks(Vec<ApiContentBlock>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

#[derive(Debug, Serialize)]
struct ApiTool<'a> {
    name: &'a str,
    description: &'a str,
    input_schema: &'a Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    content: Vec<ApiResponseBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    usage: ApiUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Backend Implementation
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for creating an Anthropic backend.
#[derive(Debug, Clone)]
pub struct AnthropicBackendBuilder {
    api_key: String,
    model: String,
    max_tokens: u32,
    base_url: String,
}

impl AnthropicBackendBuilder {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn build(self) -> AnthropicBackend {
        let endpoint = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        AnthropicBackend {
            client: reqwest::Client::new(),
            api_key: self.api_key,
            model: self.model,
            max_tokens: self.max_tokens,
            endpoint,
        }
    }
}

/// Anthropic API backend.
pub struct AnthropicBackend {
    client: reqwest::Client,
    api_key: String,
    model: String,
    max_tokens: u32,
    endpoint: String,
}

impl AnthropicBackend {
    pub fn builder(api_key: impl Into<String>, model: impl Into<String>) -> AnthropicBackendBuilder {
        AnthropicBackendBuilder::new(api_key, model)
    }

    fn role_to_api(role: Role) -> &'static str {
        match role {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    fn message_to_api(msg: &Message) -> ApiMessage {
        let role = Self::role_to_api(msg.role);

        // Simple case: single text part
        if let [Part::Text(text)] = msg.parts.as_slice() {
            return ApiMessage {
                role,
                content: ApiContent::Text(text.clone()),
            };
        }

        let blocks = msg
            .parts
            .iter()
            .map(|part| match part {
                Part::Text(text) => ApiContentBlock::Text { text: text.clone() },
                Part::ToolCall(call) => ApiContentBlock::ToolUse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.input.clone(),
                },
                Part::ToolResult(result) => ApiContentBlock::ToolResult {
                    tool_use_id: result.tool_call_id.clone(),
                    content: result.outcome.content().to_string(),
                    is_error: result.outcome.is_error(),
                },
            })
            .collect();

        ApiMessage {
            role,
            content: ApiContent::Blocks(blocks),
        }
    }

    fn tool_to_api(spec: &ToolSpec) -> ApiTool<'_> {
        ApiTool {
            name: &spec.name,
            description: &spec.description,
            input_schema: &spec.schema,
        }
    }

    fn response_to_message(blocks: Vec<ApiResponseBlock>) -> Message {
        let parts: Vec<Part> = blocks
            .into_iter()
            .filter_map(|block| match block {
                ApiResponseBlock::Text { text } => Some(Part::Text(text)),
                ApiResponseBlock::ToolUse { id, name, input } => {
                    Some(Part::ToolCall(ToolCall { id, name, input }))
                }
                ApiResponseBlock::Unknown => None,
            })
            .collect();

        Message {
            role: Role::Assistant,
            parts,
        }
    }

    fn build_request<'a>(&'a self, request: &ModelRequest<'a>) -> ApiRequest<'a> {
        ApiRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            // The API rejects turns with no content blocks.
            messages: request
                .messages
                .iter()
                .filter(|msg| !msg.parts.is_empty())
                .map(Self::message_to_api)
                .collect(),
            system: request.system,
            tools: request.tools.iter().map(Self::tool_to_api).collect(),
        }
    }

    fn api_error(status: reqwest::StatusCode, body: &str) -> ModelError {
        let message = serde_json::from_str::<ApiErrorBody>(body)
            .map(|parsed| parsed.error.message)
            .unwrap_or_else(|_| body.to_string());
        ModelError::Api {
            status: status.as_u16(),
            message,
        }
    }
}

impl Backend for AnthropicBackend {
    async fn call(&self, request: ModelRequest<'_>) -> Result<ModelResponse, ModelError> {
        let api_request = self.build_request(&request);

        debug!(
            model = %self.model,
            messages = api_request.messages.len(),
            tools = api_request.tools.len(),
            "calling model"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .header("accept", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| ModelError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Self::api_error(status, &body));
        }

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| ModelError::InvalidResponse(e.to_string()))?;

        debug!(stop_reason = ?api_response.stop_reason, "model responded");

        let message = Self::response_to_message(api_response.content);
        if message.parts.is_empty() {
            return Err(ModelError::InvalidResponse(format!(
                "no text or tool use in response (stop reason: {})",
                api_response.stop_reason.as_deref().unwrap_or("none")
            )));
        }
        let usage = Usage {
            input_tokens: api_response.usage.input_tokens,
            output_tokens: api_response.usage.output_tokens,
        };

        Ok(ModelResponse { message, usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ToolOutcome, ToolResult};
    use serde_json::json;

    fn backend() -> AnthropicBackend {
        AnthropicBackend::builder("sk-test", "claude-test")
            .base_url("http://localhost:9/")
            .build()
    }

    #[test]
    fn endpoint_joins_base_url() {
        assert_eq!(backend().endpoint, "http://localhost:9/v1/messages");
        let default = AnthropicBackend::builder("k", "m").build();
        assert_eq!(default.endpoint, "https://api.anthropic.com/v1/messages");
        assert_eq!(default.max_tokens, DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn request_carries_system_and_tools() {
        let backend = backend();
        let messages = vec![Message::user("Weather in Sacramento?")];
        let tools = vec![ToolSpec {
            name: "get_forecast".into(),
            description: "Get weather forecast for a location".into(),
            schema: json!({"type": "object"}),
        }];
        let request = ModelRequest {
            system: Some("Be brief."),
            messages: &messages,
            tools: &tools,
        };

        let body = serde_json::to_value(backend.build_request(&request)).unwrap();
        assert_eq!(body["model"], "claude-test");
        assert_eq!(body["system"], "Be brief.");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "Weather in Sacramento?");
        assert_eq!(body["tools"][0]["name"], "get_forecast");
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
    }

    #[test]
    fn request_omits_empty_tools_and_system() {
        let backend = backend();
        let messages = vec![Message::user("hi")];
        let request = ModelRequest {
            system: None,
            messages: &messages,
            tools: &[],
        };
        let body = serde_json::to_value(backend.build_request(&request)).unwrap();
        assert!(body.get("tools").is_none());
        assert!(body.get("system").is_none());
    }

    #[test]
    fn tool_interactions_become_blocks() {
        let call = Message {
            role: Role::Assistant,
            parts: vec![
                Part::Text("Checking.".into()),
                Part::ToolCall(ToolCall {
                    id: "toolu_1".into(),
                    name: "get_alerts".into(),
                    input: json!({"state": "CA"}),
                }),
            ],
        };
        let value = serde_json::to_value(AnthropicBackend::message_to_api(&call)).unwrap();
        assert_eq!(value["role"], "assistant");
        assert_eq!(value["content"][1]["type"], "tool_use");
        assert_eq!(value["content"][1]["input"]["state"], "CA");

        let results = Message::tool_results([
            ToolResult::new("toolu_1", ToolOutcome::success("No active alerts for this state.")),
            ToolResult::new("toolu_2", ToolOutcome::error("unknown tool: get_tides")),
        ]);
        let value = serde_json::to_value(AnthropicBackend::message_to_api(&results)).unwrap();
        assert_eq!(value["role"], "user");
        assert_eq!(value["content"][0]["type"], "tool_result");
        assert_eq!(value["content"][0]["tool_use_id"], "toolu_1");
        assert!(value["content"][0].get("is_error").is_none());
        assert_eq!(value["content"][1]["is_error"], true);
    }

    #[test]
    fn response_blocks_become_parts() {
        let response: ApiResponse = serde_json::from_value(json!({
            "content": [
                {"type": "thinking", "thinking": "..."},
                {"type": "text", "text": "Let me look."},
                {"type": "tool_use", "id": "toolu_9", "name": "get_forecast",
                 "input": {"latitude": 38.58, "longitude": -121.49}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 12, "output_tokens": 30}
        }))
        .unwrap();

        let message = AnthropicBackend::response_to_message(response.content);
        assert_eq!(message.role, Role::Assistant);
        assert_eq!(message.text(), "Let me look.");
        let calls = message.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "toolu_9");
    }

    #[test]
    fn empty_turns_are_not_sent() {
        let backend = backend();
        let thinking_only: ApiResponse = serde_json::from_value(json!({
            "content": [{"type": "thinking", "thinking": "..."}],
            "stop_reason": "max_tokens",
            "usage": {"input_tokens": 5, "output_tokens": 1000}
        }))
        .unwrap();
        let empty = AnthropicBackend::response_to_message(thinking_only.content);
        assert!(empty.parts.is_empty());

        let messages = vec![Message::user("hi"), empty, Message::user("hello?")];
        let request = ModelRequest {
            system: None,
            messages: &messages,
            tools: &[],
        };
        let body = serde_json::to_value(backend.build_request(&request)).unwrap();
        let sent = body["messages"].as_array().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|msg| msg["content"] != json!([])));
    }

    #[test]
    fn api_errors_use_provider_message() {
        let body = r#"{"type":"error","error":{"type":"authentication_error","message":"invalid x-api-key"}}"#;
        let err = AnthropicBackend::api_error(reqwest::StatusCode::UNAUTHORIZED, body);
        assert!(err.is_auth());
        assert_eq!(err.to_string(), "provider api (401): invalid x-api-key");

        let err = AnthropicBackend::api_error(reqwest::StatusCode::BAD_GATEWAY, "upstream down");
        assert!(!err.is_auth());
        assert!(err.to_string().contains("upstream down"));
    }
}
