//! The LLM engine contract.
//!
//! The runner never talks to a model provider directly; it drives an
//! [`Engine`] implementation one conversation turn at a time and interprets
//! the returned [`Continuation`].

use crate::call::CallContext;
use crate::program::Tool;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

/// Failures from the engine or the external-command runtime.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("model error: {0}")]
    Model(String),

    #[error("command runtime error: {0}")]
    Runtime(String),

    /// Raised by the chat-finish built-in to terminate a chat conversation.
    /// Carries the final message.
    #[error("chat finish: {0}")]
    ChatFinish(String),

    #[error("no free ports in range {start}-{end}")]
    PortsExhausted { start: u16, end: u16 },
}

/// Conversation state returned by the engine after each turn.
///
/// The `state` payload is opaque JSON owned by the engine, with one
/// documented exception: when it is an object, its `"input"` key carries the
/// input of the current turn so context providers can be re-resolved against
/// it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Continuation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub calls: BTreeMap<String, Call>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl Continuation {
    /// A terminal continuation carrying only a result.
    pub fn from_result(result: impl Into<String>) -> Self {
        Self {
            result: Some(result.into()),
            ..Default::default()
        }
    }

    /// The current turn input recorded in the engine state, if any.
    pub fn turn_input(&self) -> Option<&str> {
        self.state.as_ref()?.get("input")?.as_str()
    }
}

/// A tool call requested by the LLM.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Call {
    pub tool_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub input: String,
}

impl Call {
    pub fn new(tool_id: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            tool_id: tool_id.into(),
            input: input.into(),
        }
    }
}

/// A completed sub-call result fed back into the conversation. A value with
/// only `user` set is a synthetic user message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CallResult {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tool_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub call_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// Token accounting for one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

/// Streaming status pushed by the engine while a completion is in flight.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompletionStatus {
    pub completion_id: String,
    /// Partial rendered content; present only for incremental updates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial_response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(skip_serializing_if = "Usage::is_zero")]
    pub usage: Usage,
    #[serde(skip_serializing_if = "crate::program::is_false")]
    pub cached: bool,
}

/// Side-channel for [`CompletionStatus`] updates.
pub type ProgressSender = mpsc::UnboundedSender<CompletionStatus>;

/// Per-turn inputs handed to the engine alongside the call context.
pub struct Turn<'a> {
    /// Working environment as `KEY=value` entries.
    pub env: &'a [String],
    /// Turn input; empty when continuing with call results.
    pub input: &'a str,
    pub progress: ProgressSender,
    pub runtime_manager: Option<Arc<dyn RuntimeManager>>,
    pub ports: Option<Arc<PortAllocator>>,
}

/// Drives one LLM conversation.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Open a conversation for the frame's tool and return the first
    /// continuation.
    async fn start(&self, ctx: &CallContext, turn: Turn<'_>)
        -> Result<Continuation, EngineError>;

    /// Feed completed call results into a prior conversation state and
    /// return the next continuation.
    async fn continue_turn(
        &self,
        ctx: &CallContext,
        prior: Option<&Value>,
        results: Vec<CallResult>,
        turn: Turn<'_>,
    ) -> Result<Continuation, EngineError>;
}

/// Prepares runtimes for external-command tools. Opaque to the runner; it is
/// forwarded to the engine untouched.
#[async_trait]
pub trait RuntimeManager: Send + Sync {
    /// Extra environment entries for running the given tool.
    async fn runtime_env(&self, tool: &Tool) -> Result<Vec<String>, EngineError>;
}

/// Allocates listener ports for external-command lifecycles out of a fixed
/// inclusive range.
#[derive(Debug)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    used: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            used: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn range(&self) -> (u16, u16) {
        (self.start, self.end)
    }

    /// Claim the lowest free port in the range.
    pub fn acquire(&self) -> Result<u16, EngineError> {
        let mut used = self.used.lock().expect("port set poisoned");
        for port in self.start..=self.end {
            if used.insert(port) {
                return Ok(port);
            }
        }
        Err(EngineError::PortsExhausted {
            start: self.start,
            end: self.end,
        })
    }

    /// Return a port to the pool.
    pub fn release(&self, port: u16) {
        self.used.lock().expect("port set poisoned").remove(&port);
    }
}
