//! Monitoring and authorization contracts.
//!
//! A [`MonitorFactory`] opens one [`Monitor`] per top-level chat call; the
//! factory emits `runStart` and `Monitor::stop` emits `runFinish`. Monitors
//! must accept [`Monitor::event`] calls from concurrent tasks: the runner
//! invokes them from both driver frames and the progress pump.

use crate::call::CallContext;
use crate::event::Event;
use crate::program::Program;
use async_trait::async_trait;
use std::error::Error;
use std::sync::Arc;
use thiserror::Error as ThisError;

/// Resumes monitor output after a [`Monitor::pause`].
pub type ResumeFn = Box<dyn FnOnce() + Send>;

/// Pauses monitor output while a collaborator prompts a human; the returned
/// closure resumes it.
pub type PauseFn = Arc<dyn Fn() -> ResumeFn + Send + Sync>;

/// Failure starting a monitor.
#[derive(Debug, Clone, ThisError)]
#[error("monitor failure: {0}")]
pub struct MonitorError(pub String);

/// Event sink for a single run.
pub trait Monitor: Send + Sync {
    fn event(&self, event: Event);

    /// Suspend output (e.g. while a credential tool prompts on the
    /// terminal). The returned closure resumes it.
    fn pause(&self) -> ResumeFn {
        Box::new(|| {})
    }

    /// Called exactly once with the final output and error of the run.
    fn stop(&self, output: &str, err: Option<&(dyn Error + 'static)>);
}

/// Opens a [`Monitor`] for each top-level call.
#[async_trait]
pub trait MonitorFactory: Send + Sync {
    async fn start(
        &self,
        program: &Program,
        env: &[String],
        input: &str,
    ) -> Result<Arc<dyn Monitor>, MonitorError>;
}

/// Discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMonitorFactory;

#[async_trait]
impl MonitorFactory for NoopMonitorFactory {
    async fn start(
        &self,
        _program: &Program,
        _env: &[String],
        _input: &str,
    ) -> Result<Arc<dyn Monitor>, MonitorError> {
        Ok(Arc::new(NoopMonitor))
    }
}

struct NoopMonitor;

impl Monitor for NoopMonitor {
    fn event(&self, _event: Event) {}

    fn stop(&self, _output: &str, _err: Option<&(dyn Error + 'static)>) {}
}

/// Outcome of an authorization check for a command tool.
#[derive(Debug, Clone, Default)]
pub struct AuthorizerResponse {
    pub accept: bool,
    pub message: String,
}

/// Failure while consulting an authorizer.
#[derive(Debug, Clone, ThisError)]
#[error("authorizer failure: {0}")]
pub struct AuthorizerError(pub String);

/// Oracle consulted before running command tools that are not on the
/// safe-list. Rejection is not an error; it becomes the call's result.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(
        &self,
        ctx: &CallContext,
        input: &str,
    ) -> Result<AuthorizerResponse, AuthorizerError>;
}

/// Accepts every command.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultAuthorizer;

#[async_trait]
impl Authorizer for DefaultAuthorizer {
    async fn authorize(
        &self,
        _ctx: &CallContext,
        _input: &str,
    ) -> Result<AuthorizerResponse, AuthorizerError> {
        Ok(AuthorizerResponse {
            accept: true,
            message: String::new(),
        })
    }
}
