//! Per-frame call contexts.
//!
//! Every invocation of a tool, top-level or nested, runs inside a
//! [`CallContext`]. Frames form a tree: sub-calls derive a child frame (and a
//! child cancellation token) from their parent.

use crate::engine::Continuation;
use crate::monitor::PauseFn;
use crate::program::{Program, ProgramError, Tool};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How a call was reached from its parent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    /// A regular tool call requested by the LLM or the program entry point.
    #[default]
    Normal,
    /// A context-provider invocation; its output is injected into the
    /// parent's prompt.
    Context,
    /// A credential-tool invocation; its output becomes environment
    /// variables.
    Credential,
}

/// The resolved output of one context-provider tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InputContext {
    pub tool_id: String,
    pub content: String,
}

/// Serializable projection of a call frame, attached to monitor events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CallFrame {
    pub id: String,
    pub tool_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tool_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub tool_category: ToolCategory,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub input: String,
}

/// Per-call execution context threaded through the runner.
#[derive(Clone)]
pub struct CallContext {
    pub program: Arc<Program>,
    pub tool: Tool,
    pub id: String,
    pub category: ToolCategory,
    pub parent: Option<Box<CallFrame>>,
    pub input: String,
    /// Already-resolved context-provider outputs for this frame.
    pub input_context: Vec<InputContext>,
    /// The most recent continuation observed while dispatching sub-calls.
    pub last_return: Option<Continuation>,
    pub cancel: CancellationToken,
    /// Hook for collaborators that need to pause monitor output while
    /// prompting a human.
    pub pause: Option<PauseFn>,
}

impl CallContext {
    /// Build the root frame for a program's entry tool.
    pub fn root(
        program: Arc<Program>,
        input: impl Into<String>,
        cancel: CancellationToken,
    ) -> Result<Self, ProgramError> {
        let tool = program.get_tool(&program.entry_tool_id)?.clone();
        Ok(Self {
            program,
            tool,
            id: fresh_call_id(),
            category: ToolCategory::Normal,
            parent: None,
            input: input.into(),
            input_context: Vec::new(),
            last_return: None,
            cancel,
            pause: None,
        })
    }

    /// Derive a child frame for a sub-call. An empty `call_id` assigns a
    /// fresh one.
    pub fn sub_call(
        &self,
        input: impl Into<String>,
        tool_id: &str,
        call_id: &str,
        category: ToolCategory,
    ) -> Result<Self, ProgramError> {
        let tool = self.program.get_tool(tool_id)?.clone();
        let id = if call_id.is_empty() {
            fresh_call_id()
        } else {
            call_id.to_string()
        };
        Ok(Self {
            program: self.program.clone(),
            tool,
            id,
            category,
            parent: Some(Box::new(self.frame())),
            input: input.into(),
            input_context: Vec::new(),
            last_return: None,
            cancel: self.cancel.child_token(),
            pause: self.pause.clone(),
        })
    }

    /// The event projection of this frame.
    pub fn frame(&self) -> CallFrame {
        CallFrame {
            id: self.id.clone(),
            tool_id: self.tool.id.clone(),
            tool_name: self.tool.name.clone(),
            parent_id: self.parent.as_ref().map(|p| p.id.clone()),
            tool_category: self.category,
            input: self.input.clone(),
        }
    }
}

/// Time-ordered call id for frames the runner creates itself.
pub fn fresh_call_id() -> String {
    Uuid::now_v7().simple().to_string()
}
