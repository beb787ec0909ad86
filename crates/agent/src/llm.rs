use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;

use reservo_core::config::LlmConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One entry of the completion request, in the common chat wire shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<WireToolCall>>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: Some(content.into()),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: Some(content.into()),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: Some(content.into()),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    /// The assistant turn that requested a tool call, echoed back so the
    /// model sees its own request preceding the tool result.
    pub fn assistant_tool_call(call: &ToolCall) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: None,
            tool_call_id: None,
            tool_calls: Some(vec![WireToolCall::from(call)]),
        }
    }

    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: Some(content.into()),
            tool_call_id: Some(call_id.into()),
            tool_calls: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: WireFunctionCall,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireFunctionCall {
    pub name: String,
    /// JSON-encoded arguments, as the wire format carries them.
    pub arguments: String,
}

impl From<&ToolCall> for WireToolCall {
    fn from(call: &ToolCall) -> Self {
        Self {
            id: call.id.clone(),
            kind: "function".to_owned(),
            function: WireFunctionCall {
                name: call.name.clone(),
                arguments: call.arguments.to_string(),
            },
        }
    }
}

/// A model-initiated request to invoke a named side-effecting operation.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Declared invokable tool: name, description, JSON-schema parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolSpec {
    pub fn to_wire(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            },
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ModelOutput {
    Text(String),
    ToolCall(ToolCall),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModelResponse {
    pub output: ModelOutput,
    pub tokens_used: u32,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("chat completion request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("chat completion returned status {status}: {body}")]
    Api { status: u16, body: String },
    #[error("chat completion response was malformed: {0}")]
    Malformed(String),
}

/// Completion-model collaborator: ordered history plus a declared tool schema
/// in, plain text or a structured tool-call request out. Token usage is
/// reported per call.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<ModelResponse, LlmError>;
}

/// OpenAI-compatible `/chat/completions` client.
pub struct OpenAiChatModel {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    model: String,
}

impl OpenAiChatModel {
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = config
            .api_key
            .clone()
            .unwrap_or_else(|| SecretString::from(String::new()));
        let http =
            reqwest::Client::builder().timeout(Duration::from_secs(config.timeout_secs)).build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            api_key,
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<ModelResponse, LlmError> {
        let mut body = json!({
            "model": self.model,
            "messages": messages,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.iter().map(ToolSpec::to_wire).collect());
        }

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key.expose_secret()))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api { status: status.as_u16(), body });
        }

        let payload = response.json::<Value>().await?;
        parse_completion(&payload)
    }
}

/// Parses a completion payload into either plain text or the first requested
/// tool call.
pub(crate) fn parse_completion(payload: &Value) -> Result<ModelResponse, LlmError> {
    let completion: Completion = serde_json::from_value(payload.clone())
        .map_err(|error| LlmError::Malformed(error.to_string()))?;

    let tokens_used = completion.usage.map(|usage| usage.total_tokens).unwrap_or(0);
    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::Malformed("completion has no choices".to_owned()))?;

    if let Some(calls) = choice.message.tool_calls {
        // The generation loop executes one call per round; when the model
        // requests parallel calls only the first runs, and the model asks
        // for the rest again on the next round.
        if calls.len() > 1 {
            warn!(
                event_name = "llm.parallel_tool_calls_truncated",
                discarded = calls.len() - 1,
                "model requested parallel tool calls; keeping only the first"
            );
        }
        let call = calls
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Malformed("tool_calls array is empty".to_owned()))?;
        let arguments = serde_json::from_str::<Value>(&call.function.arguments)
            .map_err(|error| LlmError::Malformed(format!("tool arguments: {error}")))?;
        return Ok(ModelResponse {
            output: ModelOutput::ToolCall(ToolCall {
                id: call.id,
                name: call.function.name,
                arguments,
            }),
            tokens_used,
        });
    }

    match choice.message.content {
        Some(text) => Ok(ModelResponse { output: ModelOutput::Text(text), tokens_used }),
        None => Err(LlmError::Malformed("choice has neither content nor tool_calls".to_owned())),
    }
}

#[derive(Debug, Deserialize)]
struct Completion {
    choices: Vec<CompletionChoice>,
    usage: Option<CompletionUsage>,
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
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    total_tokens: u32,
}
