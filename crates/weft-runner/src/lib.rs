//! Resumable call driver for weft tool programs.
//!
//! The runner executes a [`weft_contract::Program`]: it drives the entry
//! tool's LLM conversation, expands requested tool calls into recursive
//! sub-calls (concurrently, or serially in call-id order), injects
//! context-provider output and credential environments, and emits monitor
//! events along the way. Any frame may pause for user input; the whole call
//! tree then serializes into a [`State`] that a later [`Runner::chat`]
//! resumes, in this process or another.

pub use weft_contract as contract;

mod binder;
mod context;
mod credentials;
mod dispatcher;
mod driver;
mod error;
mod options;
mod progress;
mod runner;
mod state;
mod subcall;

pub use credentials::CredentialError;
pub use error::RunnerError;
pub use options::{complete, Options};
pub use runner::{ChatResponse, ChatState, Runner};
pub use state::{State, StateError, SubCallResult};

#[cfg(test)]
mod tests;
