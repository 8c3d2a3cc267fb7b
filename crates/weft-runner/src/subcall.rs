//! Sub-call machinery.
//!
//! `sub_calls` expands the pending calls of a continuation. A fresh fanout
//! submits every call to the dispatcher in lexicographic call-id order; a
//! resume re-enters exactly the suspended child and leaves terminated
//! siblings untouched.

use crate::dispatcher::Dispatcher;
use crate::error::RunnerError;
use crate::runner::Runner;
use crate::state::{State, StateError, SubCallResult};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::{Arc, Mutex};
use weft_contract::{CallContext, Monitor, ToolCategory};

impl Runner {
    /// Run one child tool from scratch.
    pub(crate) async fn sub_call(
        &self,
        parent: &CallContext,
        monitor: &Arc<dyn Monitor>,
        env: &[String],
        tool_id: &str,
        input: &str,
        call_id: &str,
        category: ToolCategory,
    ) -> Result<State, RunnerError> {
        let ctx = parent.sub_call(input, tool_id, call_id, category)?;
        let (tool_id, call_id) = (ctx.tool.id.clone(), ctx.id.clone());
        self.call(ctx, monitor, env, input.to_string())
            .await
            .map_err(|source| RunnerError::Call {
                tool_id,
                call_id,
                source: Box::new(source),
            })
    }

    /// Re-enter a suspended child with its stored state.
    pub(crate) fn sub_call_resume<'a>(
        &'a self,
        parent: &'a CallContext,
        monitor: &'a Arc<dyn Monitor>,
        env: &'a [String],
        tool_id: &'a str,
        call_id: &'a str,
        state: State,
        category: ToolCategory,
    ) -> BoxFuture<'a, Result<State, RunnerError>> {
        async move {
            let ctx = parent.sub_call("", tool_id, call_id, category)?;
            let (tool_id, call_id) = (ctx.tool.id.clone(), ctx.id.clone());
            self.resume(ctx, monitor, env, state)
                .await
                .map_err(|source| RunnerError::Call {
                    tool_id,
                    call_id,
                    source: Box::new(source),
                })
        }
        .boxed()
    }

    /// Expand the pending calls of `state`, returning the (possibly updated)
    /// state and the sub-call results in call-id order.
    pub(crate) async fn sub_calls(
        &self,
        ctx: &CallContext,
        monitor: &Arc<dyn Monitor>,
        env: &[String],
        state: State,
        category: ToolCategory,
    ) -> Result<(State, Vec<SubCallResult>), RunnerError> {
        // A paused context provider is handled by the driver, not here.
        if state.input_context_continuation.is_some() {
            return Ok((state, Vec::new()));
        }

        if let Some(sub_call_id) = state.sub_call_id.clone() {
            let resume_input =
                state
                    .resume_input
                    .clone()
                    .ok_or_else(|| StateError::MissingResumeInput {
                        call_id: sub_call_id.clone(),
                    })?;

            let mut results = Vec::new();
            let mut found = false;
            for sub_call in &state.sub_calls {
                if sub_call.call_id == sub_call_id {
                    found = true;
                    let resumed = self
                        .sub_call_resume(
                            ctx,
                            monitor,
                            env,
                            &sub_call.tool_id,
                            &sub_call.call_id,
                            sub_call.state.with_resume_input(Some(resume_input.clone())),
                            category,
                        )
                        .await?;
                    results.push(SubCallResult {
                        tool_id: sub_call.tool_id.clone(),
                        call_id: sub_call.call_id.clone(),
                        state: resumed,
                    });
                } else {
                    results.push(sub_call.clone());
                }
            }
            if !found {
                return Err(StateError::SubCallNotFound {
                    call_id: sub_call_id,
                }
                .into());
            }

            // The input has been delivered to the child.
            return Ok((state.with_resume_input(None), results));
        }

        let calls = state
            .continuation
            .as_ref()
            .map(|c| c.calls.clone())
            .unwrap_or_default();

        let results = Mutex::new(Vec::new());
        let mut dispatcher = Dispatcher::new(self.sequential);
        for (call_id, call) in &calls {
            let results = &results;
            dispatcher.run(async move {
                let child = self
                    .sub_call(ctx, monitor, env, &call.tool_id, &call.input, call_id, category)
                    .await?;
                results.lock().unwrap().push(SubCallResult {
                    tool_id: call.tool_id.clone(),
                    call_id: call_id.clone(),
                    state: child,
                });
                Ok(())
            });
        }
        dispatcher.wait().await?;

        let mut results = results.into_inner().unwrap();
        // Call-id order regardless of completion order.
        results.sort_by(|a, b| a.call_id.cmp(&b.call_id));

        Ok((state, results))
    }
}
