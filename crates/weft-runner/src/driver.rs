//! The call driver.
//!
//! `start` opens a call: credentials, context providers, authorization, then
//! the first engine turn. `resume` loops the conversation: expand pending
//! sub-calls, feed their results back into the engine, repeat until a
//! terminal continuation, a chat pause, or a suspension that needs user
//! input. `call` chains the two for child frames.

use crate::error::RunnerError;
use crate::progress::ProgressPump;
use crate::runner::Runner;
use crate::state::{State, StateError};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;
use tracing::debug;
use weft_contract::{
    is_safe_tool, CallContext, CallResult, Continuation, Event, EventType, Monitor, Turn,
};

impl Runner {
    /// Drive one call to completion or its first suspension point.
    pub(crate) fn call<'a>(
        &'a self,
        ctx: CallContext,
        monitor: &'a Arc<dyn Monitor>,
        env: &'a [String],
        input: String,
    ) -> BoxFuture<'a, Result<State, RunnerError>> {
        async move {
            let state = self.start(ctx.clone(), None, monitor, env, &input).await?;
            if state.start_continuation {
                return Ok(state);
            }
            self.resume(ctx, monitor, env, state).await
        }
        .boxed()
    }

    /// Begin a call: acquire credentials, resolve context providers, check
    /// authorization, and run the first engine turn. When a context provider
    /// pauses, the returned state has `start_continuation` set and the
    /// engine has not been entered.
    pub(crate) async fn start(
        &self,
        ctx: CallContext,
        prior: Option<State>,
        monitor: &Arc<dyn Monitor>,
        env: &[String],
        input: &str,
    ) -> Result<State, RunnerError> {
        let mut pump = ProgressPump::start(ctx.frame(), monitor.clone());
        let result = self
            .start_with_pump(ctx, prior, monitor, env, input, &pump)
            .await;
        pump.close().await;
        result
    }

    async fn start_with_pump(
        &self,
        mut ctx: CallContext,
        prior: Option<State>,
        monitor: &Arc<dyn Monitor>,
        env: &[String],
        input: &str,
        pump: &ProgressPump,
    ) -> Result<State, RunnerError> {
        monitor.event(Event::new(EventType::CallStart, Some(ctx.frame())).with_content(input));
        debug!(tool = %ctx.tool.id, call = %ctx.id, "starting call");

        if ctx.cancel.is_cancelled() {
            return Err(RunnerError::Cancelled);
        }

        let mut env = env.to_vec();
        if !ctx.tool.credentials.is_empty() {
            env = self.handle_credentials(&ctx, monitor, &env).await?;
        }

        let (contexts, new_state) = self
            .resolve_input_contexts(&ctx, prior.as_ref(), monitor, &env, input)
            .await?;
        if let Some(mut new_state) = new_state {
            if new_state.input_context_continuation.is_some() {
                new_state.start_continuation = true;
                return Ok(new_state);
            }
        }
        ctx.input_context = contexts;

        let pause_monitor = monitor.clone();
        ctx.pause = Some(Arc::new(move || pause_monitor.pause()));

        if ctx.tool.is_command() && !is_safe_tool(&ctx.tool.id) {
            let response = self.auth.authorize(&ctx, input).await?;
            if !response.accept {
                let message = format!("[AUTHORIZATION ERROR]: {}", response.message);
                return Ok(State {
                    continuation: Some(Continuation::from_result(message)),
                    ..Default::default()
                });
            }
        }

        let continuation = self
            .engine
            .start(&ctx, self.turn(&env, input, pump))
            .await?;

        Ok(State {
            continuation: Some(continuation),
            ..Default::default()
        })
    }

    /// Continue a call from a prior state until it terminates or suspends
    /// again.
    pub(crate) async fn resume(
        &self,
        ctx: CallContext,
        monitor: &Arc<dyn Monitor>,
        env: &[String],
        state: State,
    ) -> Result<State, RunnerError> {
        let mut pump = ProgressPump::start(ctx.frame(), monitor.clone());
        let result = self
            .resume_with_pump(ctx, monitor, env, state, &mut pump)
            .await;
        pump.close().await;
        result
    }

    async fn resume_with_pump(
        &self,
        mut ctx: CallContext,
        monitor: &Arc<dyn Monitor>,
        env: &[String],
        mut state: State,
        pump: &mut ProgressPump,
    ) -> Result<State, RunnerError> {
        if state.start_continuation {
            return Err(StateError::ResumeOnStartContinuation.into());
        }
        if state.continuation.is_none() {
            return Err(StateError::MissingContinuation.into());
        }

        let mut env = env.to_vec();
        if !ctx.tool.credentials.is_empty() {
            env = self.handle_credentials(&ctx, monitor, &env).await?;
        }

        loop {
            if ctx.cancel.is_cancelled() {
                return Err(RunnerError::Cancelled);
            }

            let continuation = state
                .continuation
                .clone()
                .ok_or(StateError::MissingContinuation)?;

            if continuation.result.is_some()
                && continuation.calls.is_empty()
                && state.sub_call_id.is_none()
                && state.resume_input.is_none()
            {
                // Close early so buffered progress precedes the finish event.
                pump.close().await;
                let result = continuation.result.clone().unwrap_or_default();
                monitor.event(
                    Event::new(EventType::CallFinish, Some(ctx.frame())).with_content(&result),
                );
                if ctx.tool.chat {
                    return Ok(State {
                        continuation: Some(continuation),
                        continuation_tool_id: Some(ctx.tool.id.clone()),
                        ..Default::default()
                    });
                }
                return Ok(State {
                    result: Some(result),
                    ..Default::default()
                });
            }

            monitor.event(
                Event::new(EventType::CallSubCalls, Some(ctx.frame()))
                    .with_sub_calls(continuation.calls.clone()),
            );

            ctx.last_return = Some(continuation);

            let (next_state, call_results) = match self
                .sub_calls(&ctx, monitor, &env, state, ctx.category)
                .await
            {
                Ok(expanded) => expanded,
                Err(err) => {
                    // The chat-finish built-in terminates the owning chat
                    // tool with its message.
                    if let Some(message) = err.chat_finish_message() {
                        if ctx.tool.chat {
                            return Ok(State::from_result(message));
                        }
                    }
                    return Err(err);
                }
            };
            state = next_state;

            let mut engine_results = Vec::new();
            let mut suspended_call_id = None;
            for call_result in &call_results {
                if call_result.state.continuation.is_none() {
                    engine_results.push(CallResult {
                        tool_id: call_result.tool_id.clone(),
                        call_id: call_result.call_id.clone(),
                        result: call_result.state.result.clone().unwrap_or_default(),
                        user: None,
                    });
                } else {
                    suspended_call_id = Some(call_result.call_id.clone());
                    break;
                }
            }
            if let Some(sub_call_id) = suspended_call_id {
                // A child is awaiting user input; hand the whole roster back
                // to the caller for serialization.
                return Ok(State {
                    continuation: state.continuation,
                    sub_calls: call_results,
                    sub_call_id: Some(sub_call_id),
                    ..Default::default()
                });
            }

            monitor.event(
                Event::new(EventType::CallContinue, Some(ctx.frame()))
                    .with_tool_results(call_results.len()),
            );

            // Context providers may depend on the input recorded by the
            // latest engine turn.
            let content_input = state
                .continuation
                .as_ref()
                .and_then(|c| c.turn_input())
                .unwrap_or_default()
                .to_string();

            let (contexts, new_state) = self
                .resolve_input_contexts(&ctx, Some(&state), monitor, &env, &content_input)
                .await?;
            ctx.input_context = contexts;
            if let Some(new_state) = new_state {
                state = new_state;
            }
            if state.input_context_continuation.is_some() {
                return Ok(state);
            }

            if let Some(user) = state.resume_input.clone() {
                engine_results.push(CallResult {
                    user: Some(user),
                    ..Default::default()
                });
            }

            let prior = state.continuation.as_ref().and_then(|c| c.state.clone());
            let next = self
                .engine
                .continue_turn(&ctx, prior.as_ref(), engine_results, self.turn(&env, "", pump))
                .await?;

            state = State {
                continuation: Some(next),
                sub_calls: call_results,
                ..Default::default()
            };
        }
    }

    fn turn<'a>(&self, env: &'a [String], input: &'a str, pump: &ProgressPump) -> Turn<'a> {
        Turn {
            env,
            input,
            progress: pump.sender(),
            runtime_manager: self.runtime_manager.clone(),
            ports: self.ports.clone(),
        }
    }
}
