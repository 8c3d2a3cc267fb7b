//! Runner error taxonomy.

use crate::credentials::CredentialError;
use crate::state::StateError;
use thiserror::Error;
use weft_contract::monitor::{AuthorizerError, MonitorError};
use weft_contract::{EngineError, InvalidCredentialOverride, ProgramError};

/// Any failure surfaced by the runner. Authorization rejections are not
/// errors; they become the call's terminal result.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Program(#[from] ProgramError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error(transparent)]
    Authorizer(#[from] AuthorizerError),

    #[error(transparent)]
    InvalidCredentialOverride(#[from] InvalidCredentialOverride),

    #[error("invalid port range: {start}-{end}")]
    InvalidPortRange { start: u16, end: u16 },

    #[error("failed to unmarshal chat state: {0}")]
    InvalidChatState(#[source] serde_json::Error),

    #[error("program is interactive; tool {tool_id} expects further chat input")]
    ChatRequired { tool_id: String },

    #[error("call to tool {tool_id} [call {call_id}] failed: {source}")]
    Call {
        tool_id: String,
        call_id: String,
        #[source]
        source: Box<RunnerError>,
    },

    #[error("run cancelled")]
    Cancelled,
}

impl RunnerError {
    /// The chat-finish message carried by this error chain, if any. Call
    /// wrapping is transparent to the signal.
    pub fn chat_finish_message(&self) -> Option<&str> {
        match self {
            Self::Engine(EngineError::ChatFinish(message)) => Some(message),
            Self::Call { source, .. } => source.chat_finish_message(),
            _ => None,
        }
    }
}
