// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Tool registry for agent graphs.
//!
//! A [`Tool`] executes one model-requested operation; the [`ToolRegistry`]
//! owns the set a graph can dispatch, advertises their definitions to the
//! generation service, and resolves incoming [`ToolCall`]s by name. Closures
//! become tools via [`FunctionTool`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::generation::{ToolCall, ToolDefinition};

/// Tool dispatch errors.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ToolError {
    /// The model asked for a tool nobody registered.
    #[error("Unknown tool '{0}'")]
    UnknownTool(String),

    /// The tool ran and failed.
    #[error("Tool '{name}' failed: {message}")]
    Execution {
        /// The tool that failed.
        name: String,
        /// What went wrong.
        message: String,
    },

    /// The call's arguments did not match the tool's schema.
    #[error("Invalid arguments for tool '{name}': {message}")]
    InvalidArguments {
        /// The tool being called.
        name: String,
        /// Why the arguments were rejected.
        message: String,
    },
}

/// One operation a model may invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema for the arguments.
    fn parameters(&self) -> Value;

    async fn execute(&self, arguments: Value) -> std::result::Result<Value, ToolError>;
}

type ToolFn = dyn Fn(Value) -> std::result::Result<Value, ToolError> + Send + Sync;

/// A synchronous closure exposed as a [`Tool`].
pub struct FunctionTool {
    name: String,
    description: String,
    parameters: Value,
    f: Box<ToolFn>,
}

impl FunctionTool {
    pub fn new<F>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        f: F,
    ) -> Self
    where
        F: Fn(Value) -> std::result::Result<Value, ToolError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            f: Box::new(f),
        }
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Value {
        self.parameters.clone()
    }

    async fn execute(&self, arguments: Value) -> std::result::Result<Value, ToolError> {
        (self.f)(arguments)
    }
}

/// The tools one graph can dispatch, keyed by name.
///
/// A `BTreeMap` keeps `definitions()` output stable across runs.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Re-registering a name replaces the previous tool.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> &mut Self {
        self.tools.insert(tool.name().to_string(), tool);
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Definitions to advertise on a generation request, in name order.
    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
            })
            .collect()
    }

    /// Dispatch one model-requested call.
    pub async fn execute(&self, call: &ToolCall) -> std::result::Result<Value, ToolError> {
        let tool = self
            .tools
            .get(&call.name)
            .ok_or_else(|| ToolError::UnknownTool(call.name.clone()))?;
        tool.execute(call.arguments.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn adder() -> FunctionTool {
        FunctionTool::new(
            "add",
            "Add two integers",
            json!({
                "type": "object",
                "properties": {
                    "a": {"type": "integer"},
                    "b": {"type": "integer"}
                },
                "required": ["a", "b"]
            }),
            |arguments| {
                let a = arguments.get("a").and_then(Value::as_i64).ok_or_else(|| {
                    ToolError::InvalidArguments {
                        name: "add".to_string(),
                        message: "missing integer 'a'".to_string(),
                    }
                })?;
                let b = arguments.get("b").and_then(Value::as_i64).ok_or_else(|| {
                    ToolError::InvalidArguments {
                        name: "add".to_string(),
                        message: "missing integer 'b'".to_string(),
                    }
                })?;
                Ok(json!(a + b))
            },
        )
    }

    #[tokio::test]
    async fn test_registry_dispatches_by_name() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(adder()));

        let call = ToolCall {
            id: "c1".to_string(),
            name: "add".to_string(),
            arguments: json!({"a": 2, "b": 40}),
        };
        let result = registry.execute(&call).await.unwrap();
        assert_eq!(result, json!(42));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_an_error() {
        let registry = ToolRegistry::new();
        let call = ToolCall {
            id: "c1".to_string(),
            name: "vanish".to_string(),
            arguments: json!({}),
        };
        let result = registry.execute(&call).await;
        assert!(matches!(result, Err(ToolError::UnknownTool(name)) if name == "vanish"));
    }

    #[tokio::test]
    async fn test_invalid_arguments_reported() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(adder()));
        let call = ToolCall {
            id: "c1".to_string(),
            name: "add".to_string(),
            arguments: json!({"a": "two"}),
        };
        let result = registry.execute(&call).await;
        assert!(matches!(result, Err(ToolError::InvalidArguments { .. })));
    }

    #[test]
    fn test_definitions_are_name_ordered() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(FunctionTool::new(
            "zeta",
            "last",
            json!({"type": "object"}),
            |_| Ok(json!(null)),
        )));
        registry.register(Arc::new(FunctionTool::new(
            "alpha",
            "first",
            json!({"type": "object"}),
            |_| Ok(json!(null)),
        )));

        let names: Vec<String> = registry
            .definitions()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
