// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Model generation surface.
//!
//! Nodes talk to language models through [`GenerationService`], a narrow
//! async trait: a request carries a message transcript plus optional tool
//! definitions and an optional response schema; the response is plain text,
//! a schema-conforming JSON value, or a batch of tool calls. Production
//! backends live behind this trait; tests use [`MockGenerationService`]
//! with a scripted response queue.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    Human,
    Ai,
    Tool,
}

/// One turn in a model transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Tool calls the model requested, on `Ai` messages only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// The call a `Tool` message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn human(content: impl Into<String>) -> Self {
        Self::plain(Role::Human, content)
    }

    pub fn ai(content: impl Into<String>) -> Self {
        Self::plain(Role::Ai, content)
    }

    /// An assistant turn that requests tool invocations.
    pub fn ai_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Ai,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    /// A tool result answering the call with the given id.
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// True if this is an assistant turn carrying at least one tool call.
    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        self.role == Role::Ai && !self.tool_calls.is_empty()
    }
}

/// One tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// A tool advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema for the tool's arguments.
    pub parameters: Value,
}

/// A single generation request.
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub messages: Vec<Message>,
    /// Tools the model may call. Empty means tool use is not offered.
    pub tools: Vec<ToolDefinition>,
    /// JSON schema the response must conform to. Forces a `Structured`
    /// response when set.
    pub response_schema: Option<Value>,
}

impl GenerationRequest {
    #[must_use]
    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    #[must_use]
    pub fn with_response_schema(mut self, schema: Value) -> Self {
        self.response_schema = Some(schema);
        self
    }
}

/// What a generation call produced.
#[derive(Debug, Clone)]
pub enum GenerationResponse {
    /// Plain text completion.
    Text(String),
    /// JSON value conforming to the request's response schema.
    Structured(Value),
    /// The model wants tools invoked before it can answer.
    ToolCalls(Vec<ToolCall>),
}

/// Errors from a generation backend.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum GenerationError {
    /// Required credential or model identifier is absent.
    #[error("Missing credentials: {0}")]
    MissingCredentials(String),

    /// The backend rejected or failed the request.
    #[error("Generation backend error: {0}")]
    Service(String),

    /// A structured response did not conform to the requested schema.
    #[error("Response does not conform to the requested schema: {0}")]
    SchemaConformance(String),
}

/// Async boundary between graph nodes and a model backend.
#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> std::result::Result<GenerationResponse, GenerationError>;
}

/// Scripted backend for tests and demos.
///
/// Outcomes are served in order; requesting more than were scripted is a
/// `Service` error. Requests are recorded for assertion.
pub struct MockGenerationService {
    script: Mutex<VecDeque<std::result::Result<GenerationResponse, GenerationError>>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl MockGenerationService {
    /// Script a sequence of successful responses.
    #[must_use]
    pub fn new(script: Vec<GenerationResponse>) -> Self {
        Self::with_script(script.into_iter().map(Ok).collect())
    }

    /// Script a sequence of outcomes, errors included.
    #[must_use]
    pub fn with_script(
        script: Vec<std::result::Result<GenerationResponse, GenerationError>>,
    ) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Requests received so far, in order.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().clone()
    }

    /// Number of scripted responses not yet served.
    pub fn remaining(&self) -> usize {
        self.script.lock().len()
    }
}

#[async_trait]
impl GenerationService for MockGenerationService {
    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> std::result::Result<GenerationResponse, GenerationError> {
        self.requests.lock().push(request);
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(GenerationError::Service("mock script exhausted".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_mock_serves_script_in_order() {
        let service = MockGenerationService::new(vec![
            GenerationResponse::Text("one".to_string()),
            GenerationResponse::Text("two".to_string()),
        ]);

        let first = service
            .generate(GenerationRequest::from_messages(vec![Message::human("hi")]))
            .await
            .unwrap();
        assert!(matches!(first, GenerationResponse::Text(ref t) if t == "one"));

        let second = service
            .generate(GenerationRequest::default())
            .await
            .unwrap();
        assert!(matches!(second, GenerationResponse::Text(ref t) if t == "two"));
        assert_eq!(service.remaining(), 0);

        let exhausted = service.generate(GenerationRequest::default()).await;
        assert!(matches!(exhausted, Err(GenerationError::Service(_))));
    }

    #[tokio::test]
    async fn test_mock_serves_scripted_errors() {
        let service = MockGenerationService::with_script(vec![
            Err(GenerationError::SchemaConformance(
                "missing field 'grade'".to_string(),
            )),
            Ok(GenerationResponse::Text("recovered".to_string())),
        ]);

        let first = service.generate(GenerationRequest::default()).await;
        assert!(matches!(first, Err(GenerationError::SchemaConformance(_))));

        let second = service.generate(GenerationRequest::default()).await.unwrap();
        assert!(matches!(second, GenerationResponse::Text(ref t) if t == "recovered"));
    }

    #[tokio::test]
    async fn test_mock_records_requests() {
        let service = MockGenerationService::new(vec![GenerationResponse::Text("ok".to_string())]);
        let request = GenerationRequest::from_messages(vec![
            Message::system("be brief"),
            Message::human("summarize"),
        ]);
        service.generate(request).await.unwrap();

        let seen = service.requests();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].messages.len(), 2);
        assert_eq!(seen[0].messages[0].role, Role::System);
    }

    #[test]
    fn test_message_constructors() {
        let call = ToolCall {
            id: "c1".to_string(),
            name: "search".to_string(),
            arguments: json!({"query": "rust"}),
        };
        let ai = Message::ai_with_tool_calls("", vec![call.clone()]);
        assert!(ai.has_tool_calls());

        let tool = Message::tool("c1", "3 results");
        assert_eq!(tool.role, Role::Tool);
        assert_eq!(tool.tool_call_id.as_deref(), Some("c1"));
        assert!(!tool.has_tool_calls());

        assert!(!Message::ai("plain answer").has_tool_calls());
    }

    #[test]
    fn test_message_serde_round_trip() {
        let message = Message::ai_with_tool_calls(
            "checking",
            vec![ToolCall {
                id: "c9".to_string(),
                name: "lookup".to_string(),
                arguments: json!({"key": 7}),
            }],
        );
        let encoded = serde_json::to_string(&message).unwrap();
        let decoded: Message = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.tool_calls, message.tool_calls);
        assert_eq!(decoded.role, Role::Ai);
    }
}
