//! Tool dispatch with bounded fan-out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use crate::config::KestrelConfig;
use crate::provider::ToolDefinition;
use crate::types::{ToolCall, ToolResult};
use crate::util::with_timeout;

use super::tool::{Tool, ToolExecutionContext};

/// Dispatches named tool calls against a registry.
///
/// Independent calls from the same turn run concurrently up to the
/// configured bound; results come back in call order so the run loop can
/// pair them with the emitted `tool_call` events. A failing tool never
/// fails the run — the failure is folded into the result payload and the
/// model decides how to proceed.
pub struct ToolDispatcher {
    tools: HashMap<String, Arc<dyn Tool>>,
    concurrency: usize,
    call_timeout: Duration,
}

impl ToolDispatcher {
    pub fn new(concurrency: usize, call_timeout: Duration) -> Self {
        Self {
            tools: HashMap::new(),
            concurrency: concurrency.max(1),
            call_timeout,
        }
    }

    pub fn from_config(config: &KestrelConfig) -> Self {
        Self::new(config.tool_concurrency, config.tool_timeout)
    }

    /// Register a tool. A later registration under the same name wins.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Definitions advertised to the provider.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters().clone(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Resolve a single call to a result payload.
    pub async fn dispatch(&self, call: &ToolCall) -> ToolResult {
        let Some(tool) = self.tools.get(&call.name) else {
            tracing::warn!(tool = %call.name, "unknown tool requested");
            return failure_result(call, format!("unknown tool '{}'", call.name), false);
        };

        let ctx = ToolExecutionContext {
            tool_call_id: Some(call.id.clone()),
            tool_name: Some(call.name.clone()),
        };
        match with_timeout(self.call_timeout, tool.execute(&call.arguments, &ctx)).await {
            Ok(value) => ToolResult {
                tool_call_id: call.id.clone(),
                result: value,
                is_error: false,
            },
            Err(err) => {
                tracing::warn!(tool = %call.name, error = %err, "tool execution failed");
                failure_result(call, err.to_string(), err.is_retryable())
            }
        }
    }

    /// Resolve a batch of calls, bounded-concurrent, results in call order.
    pub async fn dispatch_batch(&self, calls: &[ToolCall]) -> Vec<ToolResult> {
        futures::stream::iter(calls.iter().cloned().map(|call| async move {
            self.dispatch(&call).await
        }))
        .buffered(self.concurrency)
        .collect()
        .await
    }
}

impl std::fmt::Debug for ToolDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDispatcher")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

fn failure_result(call: &ToolCall, message: String, retryable: bool) -> ToolResult {
    ToolResult {
        tool_call_id: call.id.clone(),
        result: serde_json::json!({ "error": message, "retryable": retryable }),
        is_error: true,
    }
}
