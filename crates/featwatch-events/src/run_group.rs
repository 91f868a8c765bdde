use std::future::Future;

use thiserror::Error;
use tokio::task::{JoinError, JoinSet};
use tracing::warn;

use crate::cancel::CancelToken;

#[derive(Debug, Error)]
pub enum RunGroupError<E>
where
    E: std::error::Error + 'static,
{
    #[error(transparent)]
    Task(E),
    #[error("task aborted: {0}")]
    Join(#[from] JoinError),
}

/// Runs sibling tasks under a shared cancel token. The first failure
/// cancels the rest; [`RunGroup::wait`] returns only after every task exited.
pub struct RunGroup<E> {
    cancel: CancelToken,
    tasks: JoinSet<Result<(), E>>,
}

impl<E> RunGroup<E>
where
    E: std::error::Error + Send + 'static,
{
    pub fn new(parent: &CancelToken) -> Self {
        Self {
            cancel: parent.child(),
            tasks: JoinSet::new(),
        }
    }

    pub fn token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn spawn<F, Fut>(&mut self, task: F)
    where
        F: FnOnce(CancelToken) -> Fut,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        self.tasks.spawn(task(self.cancel.clone()));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub async fn wait(mut self) -> Result<(), RunGroupError<E>> {
        let mut first_error = None;
        while let Some(joined) = self.tasks.join_next().await {
            let failure = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => RunGroupError::Task(err),
                Err(err) => RunGroupError::Join(err),
            };
            if first_error.is_none() {
                self.cancel.cancel();
                first_error = Some(failure);
            } else {
                warn!(error = %failure, "additional task failure after cancellation");
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
