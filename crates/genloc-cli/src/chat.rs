//! Chat-completion client for OpenAI-compatible endpoints.

use async_trait::async_trait;
use genloc_index::retry::{is_retryable_status, RetryPolicy, Retryable};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("chat request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("chat service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed chat response: {0}")]
    MalformedResponse(String),
}

impl Retryable for ChatError {
    fn is_retryable(&self) -> bool {
        match self {
            ChatError::Transport(error) => !error.is_builder() && !error.is_decode(),
            ChatError::Status { status, .. } => is_retryable_status(*status),
            ChatError::MalformedResponse(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments, exactly as produced by the model.
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: FunctionCall,
}

fn function_kind() -> String {
    "function".to_string()
}

impl ToolCall {
    pub fn new(id: &str, name: &str, arguments: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: function_kind(),
            function: FunctionCall {
                name: name.to_string(),
                arguments: arguments.to_string(),
            },
        }
    }
}

/// Conversation entry, tagged by role on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        #[serde(default)]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        tool_call_id: String,
        name: String,
        content: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    Required,
    None,
    Auto,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub function: FunctionDefinition,
}

impl ToolDefinition {
    pub fn function(name: &str, description: &str, parameters: Value) -> Self {
        Self {
            kind: "function",
            function: FunctionDefinition {
                name: name.to_string(),
                description: description.to_string(),
                parameters,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// The assistant turn returned by one completion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
}

impl ChatResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    pub fn to_message(&self) -> ChatMessage {
        ChatMessage::Assistant {
            content: self.content.clone(),
            tool_calls: self.tool_calls.clone(),
        }
    }
}

#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ChatError>;
}

#[derive(Debug, Deserialize)]
struct CompletionBody {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

fn parse_completion(body: &str) -> Result<ChatResponse, ChatError> {
    let parsed: CompletionBody =
        serde_json::from_str(body).map_err(|error| ChatError::MalformedResponse(error.to_string()))?;
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ChatError::MalformedResponse("response has no choices".to_string()))?;
    Ok(ChatResponse {
        content: choice.message.content,
        tool_calls: choice.message.tool_calls.unwrap_or_default(),
        usage: parsed.usage,
    })
}

/// `POST {base}/chat/completions` with bearer authentication.
pub struct OpenAiChatClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    retry: RetryPolicy,
}

impl OpenAiChatClient {
    pub fn new(base_url: &str, api_key: &str, retry: RetryPolicy) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
            retry,
        }
    }

    async fn complete_once(&self, request: &ChatRequest) -> Result<ChatResponse, ChatError> {
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ChatError::Status {
                status: status.as_u16(),
                body,
            });
        }
        parse_completion(&body)
    }
}

#[async_trait]
impl ChatClient for OpenAiChatClient {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ChatError> {
        debug!(model = %request.model, messages = request.messages.len(), "Requesting chat completion");
        self.retry
            .execute(|_attempt| self.complete_once(request))
            .await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn messages_serialize_with_role_tags() {
        let tool = ChatMessage::Tool {
            tool_call_id: "call_1".into(),
            name: "search_file".into(),
            content: "[]".into(),
        };
        assert_eq!(
            serde_json::to_value(&tool).unwrap(),
            json!({"role": "tool", "tool_call_id": "call_1", "name": "search_file", "content": "[]"})
        );

        let assistant = ChatMessage::Assistant {
            content: None,
            tool_calls: vec![ToolCall::new("call_1", "get_candidate_files", "{}")],
        };
        let value = serde_json::to_value(&assistant).unwrap();
        assert_eq!(value["role"], "assistant");
        assert_eq!(value["tool_calls"][0]["type"], "function");
        assert_eq!(value["tool_calls"][0]["function"]["name"], "get_candidate_files");
    }

    #[test]
    fn tool_choice_uses_wire_names() {
        assert_eq!(serde_json::to_value(ToolChoice::Required).unwrap(), json!("required"));
        assert_eq!(serde_json::to_value(ToolChoice::None).unwrap(), json!("none"));
        assert_eq!(serde_json::to_value(ToolChoice::Auto).unwrap(), json!("auto"));
    }

    #[test]
    fn completions_with_tool_calls_parse() {
        let body = r#"{
            "choices": [{"message": {"role": "assistant", "content": null,
                "tool_calls": [{"id": "c1", "type": "function",
                    "function": {"name": "search_file", "arguments": "{\"filename\":\"a.py\"}"}}]}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        }"#;
        let response = parse_completion(body).unwrap();
        assert!(response.has_tool_calls());
        assert_eq!(response.tool_calls[0].function.name, "search_file");
        assert_eq!(response.usage.unwrap().total_tokens, 15);
    }

    #[test]
    fn empty_choices_are_malformed() {
        assert!(matches!(
            parse_completion(r#"{"choices": []}"#),
            Err(ChatError::MalformedResponse(_))
        ));
    }
}
