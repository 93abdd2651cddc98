//! Type-erased storage for a suspended tasklet continuation.

use std::task::{Context, Poll};

use crate::tracing_compat::trace;
use crate::types::{BodyFuture, TaskletId};

/// A tasklet's suspended continuation: the pinned body future plus poll
/// bookkeeping.
///
/// Owned by the tasklet's record while suspended; moved into the scheduler's
/// active slot for the duration of a dispatch.
pub struct StoredTasklet {
    future: BodyFuture,
    tasklet: TaskletId,
    poll_count: u64,
}

impl StoredTasklet {
    /// Wraps an already-boxed body future.
    pub(crate) fn new(tasklet: TaskletId, future: BodyFuture) -> Self {
        Self {
            future,
            tasklet,
            poll_count: 0,
        }
    }

    /// Polls the continuation once.
    pub(crate) fn poll(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        self.poll_count += 1;
        let result = self.future.as_mut().poll(cx);
        trace!(
            tasklet = %self.tasklet,
            poll = self.poll_count,
            ready = matches!(result, Poll::Ready(())),
            "tasklet polled"
        );
        result
    }

    /// How many times this continuation has been polled.
    #[must_use]
    pub fn poll_count(&self) -> u64 {
        self.poll_count
    }
}

impl std::fmt::Debug for StoredTasklet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredTasklet")
            .field("tasklet", &self.tasklet)
            .field("poll_count", &self.poll_count)
            .finish_non_exhaustive()
    }
}
