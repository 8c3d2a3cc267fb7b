//! Serializable call state.
//!
//! A [`State`] is the snapshot that makes the runner resumable: it records an
//! in-flight LLM conversation together with any suspension point waiting for
//! user input, either in a sub-call or in a context provider. The value is a
//! tree: a paused context provider or sub-call stores the child's own
//! [`State`], so arbitrarily nested conversations serialize in one piece.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use weft_contract::{current_unix_millis, Continuation, InputContext};

/// Illegal resume shapes.
#[derive(Debug, Clone, Error)]
pub enum StateError {
    #[error("invalid state: resume must not be called while awaiting input context resolution")]
    ResumeOnStartContinuation,

    #[error("invalid state: resume requires continuation data")]
    MissingContinuation,

    #[error("invalid state: input must be set for sub call continuation on call id [{call_id}]")]
    MissingResumeInput { call_id: String },

    #[error("invalid state: failed to find sub call for call id [{call_id}]")]
    SubCallNotFound { call_id: String },

    #[error("invalid state: no result message found in chat response")]
    NoResultMessage,
}

/// Snapshot of one call frame's progress.
///
/// On a well-formed frame exactly one of `continuation` and `result` is set:
/// `result` only on terminal frames, `continuation` everywhere else.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct State {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuation: Option<Continuation>,
    /// Id of the tool that produced `continuation` on a chat pause.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuation_tool_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,

    /// User input to inject on the next resume.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_input: Option<String>,
    /// Sub-call roster preserved across a suspension.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sub_calls: Vec<SubCallResult>,
    /// Set iff a child sub-call is awaiting user input.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_call_id: Option<String>,

    /// Context-provider results collected before a suspension.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub input_contexts: Vec<InputContext>,
    /// Set iff a context-provider tool itself paused.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_context_continuation: Option<Box<State>>,
    /// The parent input in effect when the context provider paused.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub input_context_continuation_input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_context_continuation_resume_input: Option<String>,
    /// True only on a frame paused during context acquisition that has not
    /// yet entered the LLM for its own tool.
    #[serde(skip_serializing_if = "is_false")]
    pub start_continuation: bool,
}

/// One entry in a frame's sub-call roster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubCallResult {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tool_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub call_id: String,
    pub state: State,
}

impl State {
    /// A terminal state carrying only a result.
    pub fn from_result(result: impl Into<String>) -> Self {
        Self {
            result: Some(result.into()),
            ..Default::default()
        }
    }

    /// Copy of this state with the resume input replaced.
    pub fn with_resume_input(&self, input: Option<String>) -> State {
        let mut state = self.clone();
        state.resume_input = input;
        state
    }

    /// The content a chat caller should display: the deepest continuation
    /// result, descending through a paused context provider first and the
    /// active sub-call second.
    pub fn continuation_content(&self) -> Result<String, StateError> {
        if let Some(result) = self.continuation.as_ref().and_then(|c| c.result.as_ref()) {
            return Ok(result.clone());
        }
        if let Some(continuation) = &self.input_context_continuation {
            return continuation.continuation_content();
        }
        if let Some(sub_call_id) = &self.sub_call_id {
            for sub_call in &self.sub_calls {
                if &sub_call.call_id == sub_call_id {
                    return sub_call.state.continuation_content();
                }
            }
        }
        Err(StateError::NoResultMessage)
    }

    /// The id of the tool that produced [`State::continuation_content`]: the
    /// deepest chat tool in the tree.
    pub fn continuation_content_tool_id(&self) -> Result<String, StateError> {
        if self
            .continuation
            .as_ref()
            .is_some_and(|c| c.result.is_some())
        {
            return Ok(self.continuation_tool_id.clone().unwrap_or_default());
        }
        if let Some(continuation) = &self.input_context_continuation {
            return continuation.continuation_content_tool_id();
        }
        if let Some(sub_call_id) = &self.sub_call_id {
            for sub_call in &self.sub_calls {
                if &sub_call.call_id == sub_call_id {
                    return sub_call.state.continuation_content_tool_id();
                }
            }
        }
        Err(StateError::NoResultMessage)
    }
}

/// Best-effort dump of the final state into the system temp directory.
/// Failures are logged and ignored.
pub(crate) fn dump_state_artifact(state: &State) {
    match write_state_dump(&std::env::temp_dir(), state) {
        Ok(path) => debug!(path = %path.display(), "wrote state dump"),
        Err(err) => warn!(%err, "failed to write state dump"),
    }
}

pub(crate) fn write_state_dump(dir: &Path, state: &State) -> io::Result<PathBuf> {
    let path = dir.join(format!(
        "weft-state-{}-{}",
        hostname(),
        current_unix_millis()
    ));
    let json = serde_json::to_vec(state).map_err(io::Error::other)?;
    fs::write(&path, json)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o444))?;
    }
    Ok(path)
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

fn is_false(value: &bool) -> bool {
    !*value
}
