//! Context-provider orchestration.
//!
//! Every context reference of the active tool is resolved to an
//! [`InputContext`] by invoking the referenced tool as a sub-call. A provider
//! may itself pause for user input; resolution then stops and the partial
//! progress is captured in the frame's [`State`] so a later resume re-enters
//! the paused provider and continues from the same index.

use crate::binder::context_call_input;
use crate::error::RunnerError;
use crate::runner::Runner;
use crate::state::State;
use std::sync::Arc;
use weft_contract::{CallContext, InputContext, Monitor, ToolCategory};

impl Runner {
    /// Resolve the input contexts for one frame.
    ///
    /// Returns the resolved contexts plus the frame's updated state: `None`
    /// when no prior state was given and nothing paused, otherwise a state
    /// whose `input_context_continuation` is set iff a provider paused.
    pub(crate) async fn resolve_input_contexts(
        &self,
        ctx: &CallContext,
        state: Option<&State>,
        monitor: &Arc<dyn Monitor>,
        env: &[String],
        input: &str,
    ) -> Result<(Vec<InputContext>, Option<State>), RunnerError> {
        let tool_refs = ctx.program.get_context_tool_refs(&ctx.tool.id)?;

        let mut new_state = state.cloned();
        let mut input = input.to_string();
        let mut pending_resume: Option<(State, Option<String>)> = None;

        if let Some(prev) = state {
            if let Some(continuation) = &prev.input_context_continuation {
                // Re-enter the paused provider with the caller's new input;
                // the cleared copy keeps the rest of the frame intact.
                pending_resume = Some(((**continuation).clone(), prev.resume_input.clone()));
                input = prev.input_context_continuation_input.clone();
                if let Some(cleared) = new_state.as_mut() {
                    cleared.input_contexts = Vec::new();
                    cleared.input_context_continuation = None;
                    cleared.input_context_continuation_input = String::new();
                    cleared.resume_input = prev.input_context_continuation_resume_input.clone();
                }
            }
        }

        let mut result = Vec::new();
        for (i, tool_ref) in tool_refs.iter().enumerate() {
            // Results gathered before a pause are reused verbatim.
            if let Some(prev) = state {
                if i < prev.input_contexts.len() {
                    result.push(prev.input_contexts[i].clone());
                    continue;
                }
            }

            let content = if let Some((continuation, resume_input)) = pending_resume.take() {
                self.sub_call_resume(
                    ctx,
                    monitor,
                    env,
                    &tool_ref.tool_id,
                    "",
                    continuation.with_resume_input(resume_input),
                    ToolCategory::Context,
                )
                .await?
            } else {
                let context_input = context_call_input(&ctx.program, tool_ref, &input)?;
                self.sub_call(
                    ctx,
                    monitor,
                    env,
                    &tool_ref.tool_id,
                    context_input.as_deref().unwrap_or_default(),
                    "",
                    ToolCategory::Context,
                )
                .await?
            };

            if content.continuation.is_some() {
                let mut suspended = new_state.unwrap_or_default();
                suspended.input_contexts = result;
                suspended.input_context_continuation = Some(Box::new(content));
                suspended.input_context_continuation_input = input;
                if let Some(prev) = state {
                    suspended.input_context_continuation_resume_input =
                        prev.resume_input.clone();
                }
                return Ok((Vec::new(), Some(suspended)));
            }

            result.push(InputContext {
                tool_id: tool_ref.tool_id.clone(),
                content: content.result.clone().unwrap_or_default(),
            });
        }

        Ok((result, new_state))
    }
}
