//! Monitor events.

use crate::call::CallFrame;
use crate::engine::{Call, Usage};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Lifecycle stage an [`Event`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventType {
    RunStart,
    CallStart,
    CallContinue,
    CallSubCalls,
    CallProgress,
    CallChat,
    CallFinish,
    RunFinish,
}

/// A timestamped monitor record. Which payload fields are set depends on the
/// event type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Unix milliseconds.
    pub time: u64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_context: Option<CallFrame>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tool_sub_calls: BTreeMap<String, Call>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub tool_results: usize,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub completion_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_request: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_response: Option<Value>,
    #[serde(default, skip_serializing_if = "Usage::is_zero")]
    pub usage: Usage,
    #[serde(default, skip_serializing_if = "crate::program::is_false")]
    pub chat_response_cached: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
}

impl Event {
    pub fn new(event_type: EventType, call_context: Option<CallFrame>) -> Self {
        Self {
            time: current_unix_millis(),
            event_type,
            call_context,
            tool_sub_calls: BTreeMap::new(),
            tool_results: 0,
            completion_id: String::new(),
            chat_request: None,
            chat_response: None,
            usage: Usage::default(),
            chat_response_cached: false,
            content: String::new(),
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_sub_calls(mut self, calls: BTreeMap<String, Call>) -> Self {
        self.tool_sub_calls = calls;
        self
    }

    pub fn with_tool_results(mut self, count: usize) -> Self {
        self.tool_results = count;
        self
    }

    pub fn with_completion_id(mut self, completion_id: impl Into<String>) -> Self {
        self.completion_id = completion_id.into();
        self
    }

    pub fn with_chat_exchange(mut self, request: Option<Value>, response: Option<Value>) -> Self {
        self.chat_request = request;
        self.chat_response = response;
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_cached(mut self, cached: bool) -> Self {
        self.chat_response_cached = cached;
        self
    }
}

fn is_zero(value: &usize) -> bool {
    *value == 0
}

/// Current wall-clock time in unix milliseconds.
pub fn current_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis().min(u128::from(u64::MAX)) as u64)
}
