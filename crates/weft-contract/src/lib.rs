//! Data model and collaborator contracts for the weft tool-program runner.
//!
//! This crate defines what a tool program *is* and the seams the runner
//! drives it through: the LLM [`Engine`], the [`CredentialStore`], the
//! [`Monitor`] event sink, and the [`Authorizer`]. The runner itself lives in
//! the `weft-runner` crate.

pub mod call;
pub mod credential;
pub mod engine;
pub mod event;
pub mod monitor;
pub mod program;

pub use call::{fresh_call_id, CallContext, CallFrame, InputContext, ToolCategory};
pub use credential::{
    is_github_tool, parse_credential_overrides, Credential, CredentialStore,
    CredentialStoreError, CredentialStoreFactory, CredentialType, InvalidCredentialOverride,
    MemoryCredentialStoreFactory,
};
pub use engine::{
    Call, CallResult, CompletionStatus, Continuation, Engine, EngineError, PortAllocator,
    ProgressSender, RuntimeManager, Turn, Usage,
};
pub use event::{current_unix_millis, Event, EventType};
pub use monitor::{
    Authorizer, AuthorizerError, AuthorizerResponse, DefaultAuthorizer, Monitor, MonitorError,
    MonitorFactory, NoopMonitorFactory, PauseFn, ResumeFn,
};
pub use program::{
    is_safe_tool, object_schema, JsonSchema, Program, ProgramError, Repo, SchemaType, Tool,
    ToolReference, ToolSource, SAFE_TOOLS,
};
