//! Bag-of-tasks dispatcher for sub-call fanout.
//!
//! Tasks are submitted in order and driven either concurrently or serially.
//! In both modes the first error wins; concurrent mode drops the remaining
//! futures at that point, which cancels sibling sub-calls cooperatively.

use crate::error::RunnerError;
use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use std::future::Future;

pub(crate) struct Dispatcher<'a> {
    sequential: bool,
    tasks: Vec<BoxFuture<'a, Result<(), RunnerError>>>,
}

impl<'a> Dispatcher<'a> {
    pub(crate) fn new(sequential: bool) -> Self {
        Self {
            sequential,
            tasks: Vec::new(),
        }
    }

    /// Submit one unit of work. Nothing runs until [`Dispatcher::wait`].
    pub(crate) fn run<F>(&mut self, task: F)
    where
        F: Future<Output = Result<(), RunnerError>> + Send + 'a,
    {
        self.tasks.push(task.boxed());
    }

    /// Drive all submitted units to completion and surface the first error.
    pub(crate) async fn wait(self) -> Result<(), RunnerError> {
        if self.sequential {
            for task in self.tasks {
                task.await?;
            }
            Ok(())
        } else {
            try_join_all(self.tasks).await.map(|_| ())
        }
    }
}
