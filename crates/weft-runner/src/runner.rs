//! The runner and its chat facade.

use crate::error::RunnerError;
use crate::options::{complete, Options};
use crate::state::{dump_state_artifact, State};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use weft_contract::{
    parse_credential_overrides, Authorizer, CallContext, CredentialStoreFactory,
    DefaultAuthorizer, Engine, MemoryCredentialStoreFactory, Monitor, MonitorFactory,
    NoopMonitorFactory, PortAllocator, Program, RuntimeManager,
};

/// Executes tool programs against an LLM [`Engine`].
///
/// A runner is cheap to share: each [`Runner::chat`] call owns its own frame
/// tree and the only cross-call resource is the credential-acquisition lock.
pub struct Runner {
    pub(crate) engine: Arc<dyn Engine>,
    pub(crate) auth: Arc<dyn Authorizer>,
    pub(crate) factory: Arc<dyn MonitorFactory>,
    pub(crate) runtime_manager: Option<Arc<dyn RuntimeManager>>,
    pub(crate) store_factory: Arc<dyn CredentialStoreFactory>,
    pub(crate) cred_ctx: String,
    pub(crate) cred_mutex: Mutex<()>,
    pub(crate) cred_overrides: HashMap<String, BTreeMap<String, String>>,
    pub(crate) sequential: bool,
    pub(crate) ports: Option<Arc<PortAllocator>>,
}

impl Runner {
    pub fn new(
        engine: Arc<dyn Engine>,
        cred_ctx: impl Into<String>,
        opts: impl IntoIterator<Item = Options>,
    ) -> Result<Self, RunnerError> {
        let opt = complete(opts);

        let ports = if opt.start_port != 0 {
            if opt.end_port < opt.start_port {
                return Err(RunnerError::InvalidPortRange {
                    start: opt.start_port,
                    end: opt.end_port,
                });
            }
            Some(Arc::new(PortAllocator::new(opt.start_port, opt.end_port)))
        } else {
            None
        };

        let cred_overrides = parse_credential_overrides(&opt.credential_overrides)?;

        Ok(Self {
            engine,
            auth: opt
                .authorizer
                .unwrap_or_else(|| Arc::new(DefaultAuthorizer)),
            factory: opt
                .monitor_factory
                .unwrap_or_else(|| Arc::new(NoopMonitorFactory)),
            runtime_manager: opt.runtime_manager,
            store_factory: opt
                .credential_store_factory
                .unwrap_or_else(|| Arc::new(MemoryCredentialStoreFactory::default())),
            cred_ctx: cred_ctx.into(),
            cred_mutex: Mutex::new(()),
            cred_overrides,
            sequential: opt.sequential,
            ports,
        })
    }

    /// One chat turn: start a fresh conversation or resume a serialized one,
    /// and run until it terminates or needs more user input.
    pub async fn chat(
        &self,
        cancel: &CancellationToken,
        prev_state: ChatState,
        program: Arc<Program>,
        env: &[String],
        input: &str,
    ) -> Result<ChatResponse, RunnerError> {
        let state = prev_state.into_state()?;

        let monitor = self.factory.start(&program, env, input).await?;
        let result = self
            .chat_with_monitor(cancel, state, program, env, input, &monitor)
            .await;
        match &result {
            Ok(response) => monitor.stop(&response.content, None),
            Err(err) => monitor.stop("", Some(err as &(dyn Error + 'static))),
        }
        result
    }

    async fn chat_with_monitor(
        &self,
        cancel: &CancellationToken,
        prev_state: Option<State>,
        program: Arc<Program>,
        env: &[String],
        input: &str,
        monitor: &Arc<dyn Monitor>,
    ) -> Result<ChatResponse, RunnerError> {
        let ctx = CallContext::root(program, input, cancel.child_token())?;

        let mut state = match prev_state {
            None => self.start(ctx.clone(), None, monitor, env, input).await?,
            Some(prev) if prev.start_continuation => {
                // The new input resumes the paused context provider; the
                // owning tool still starts with its original input.
                let carried = prev.with_resume_input(Some(input.to_string()));
                let original_input = carried.input_context_continuation_input.clone();
                self.start(ctx.clone(), Some(carried), monitor, env, &original_input)
                    .await?
            }
            Some(prev) => prev.with_resume_input(Some(input.to_string())),
        };

        if !state.start_continuation {
            state = self.resume(ctx, monitor, env, state).await?;
        }

        dump_state_artifact(&state);

        if let Some(result) = state.result.clone() {
            return Ok(ChatResponse {
                done: true,
                content: result,
                tool_id: String::new(),
                state: None,
            });
        }

        let content = state.continuation_content()?;
        let tool_id = state.continuation_content_tool_id()?;
        Ok(ChatResponse {
            done: false,
            content,
            tool_id,
            state: Some(state),
        })
    }

    /// Run a non-interactive program to completion and return its output.
    /// Fails with [`RunnerError::ChatRequired`] if the program pauses for
    /// chat input instead of terminating.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        program: Arc<Program>,
        env: &[String],
        input: &str,
    ) -> Result<String, RunnerError> {
        let response = self
            .chat(cancel, ChatState::None, program, env, input)
            .await?;
        if !response.done {
            return Err(RunnerError::ChatRequired {
                tool_id: response.tool_id,
            });
        }
        Ok(response.content)
    }
}

/// Prior conversation state accepted by [`Runner::chat`]: nothing, a live
/// [`State`], or its JSON serialization (the literal `"null"` counts as
/// nothing).
#[derive(Debug, Clone, Default)]
pub enum ChatState {
    #[default]
    None,
    State(Box<State>),
    Json(String),
}

impl ChatState {
    fn into_state(self) -> Result<Option<State>, RunnerError> {
        match self {
            Self::None => Ok(None),
            Self::State(state) => Ok(Some(*state)),
            Self::Json(raw) if raw == "null" => Ok(None),
            Self::Json(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(RunnerError::InvalidChatState),
        }
    }
}

impl From<State> for ChatState {
    fn from(state: State) -> Self {
        Self::State(Box::new(state))
    }
}

impl From<Option<State>> for ChatState {
    fn from(state: Option<State>) -> Self {
        state.map_or(Self::None, Into::into)
    }
}

impl From<String> for ChatState {
    fn from(raw: String) -> Self {
        Self::Json(raw)
    }
}

impl From<&str> for ChatState {
    fn from(raw: &str) -> Self {
        Self::Json(raw.to_string())
    }
}

/// Outcome of one [`Runner::chat`] turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatResponse {
    /// True when the program terminated; false when it waits for more user
    /// input.
    pub done: bool,
    pub content: String,
    /// Tool that produced `content` on a chat pause.
    #[serde(rename = "toolID", skip_serializing_if = "String::is_empty")]
    pub tool_id: String,
    /// Serialized continuation point; feed back into the next `chat` call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<State>,
}
