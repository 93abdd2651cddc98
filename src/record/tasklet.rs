//! Tasklet record and lifecycle state machine.
//!
//! A tasklet is referenced by at most one of {run-queue, a channel's
//! wait-queue} at any time. Its continuation lives in `stored` while the
//! tasklet is suspended and is moved into the scheduler's active slot for
//! the duration of a dispatch, so ownership of the execution context is
//! explicit in the data.

use crate::runtime::StoredTasklet;
use crate::types::{ChannelId, Failure, TaskletId, Value};

/// The lifecycle state of a tasklet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskletState {
    /// Allocated, not yet enqueued.
    Created,
    /// Eligible for dispatch (queued, or parked off-queue awaiting insert).
    Runnable,
    /// Being polled by the scheduler right now.
    Running,
    /// Parked: on a channel wait-queue, or stepped off the run-queue.
    Blocked,
    /// Irreversibly cancelled; the continuation was discarded.
    Killed,
    /// The body returned.
    Completed,
}

impl TaskletState {
    /// True for states no transition leaves.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Killed | Self::Completed)
    }
}

/// The at-most-one pending payload delivered to a suspended tasklet,
/// observed by its parked operation on the next poll.
#[derive(Debug)]
pub(crate) enum Resumption {
    /// The tasklet's send completed its rendezvous.
    Sent,
    /// The tasklet's receive matched a sender carrying this value.
    Received(Value),
    /// The tasklet's operation failed; includes injected exceptions.
    Failed(Failure),
}

/// Internal record for one tasklet.
#[derive(Debug)]
pub struct TaskletRecord {
    /// The tasklet's id.
    pub id: TaskletId,
    /// Current lifecycle state.
    pub state: TaskletState,
    /// The channel this tasklet is blocked on, if any. A lookup relation,
    /// not ownership; cleared when the tasklet resumes.
    pub blocked_on: Option<ChannelId>,
    /// Marks the synthetic record for the driving context.
    pub(crate) is_main: bool,
    /// The suspended continuation. `None` while the tasklet is running
    /// (moved to the active slot) and after a terminal transition.
    pub(crate) stored: Option<StoredTasklet>,
    /// Pending payload awaiting delivery on resume.
    pub(crate) resumption: Option<Resumption>,
}

impl TaskletRecord {
    /// Creates a record in `Created` state.
    #[must_use]
    pub(crate) fn new(id: TaskletId) -> Self {
        Self {
            id,
            state: TaskletState::Created,
            blocked_on: None,
            is_main: false,
            stored: None,
            resumption: None,
        }
    }

    /// Creates the synthetic record representing the driving context.
    #[must_use]
    pub(crate) fn new_main(id: TaskletId) -> Self {
        Self {
            id,
            state: TaskletState::Running,
            blocked_on: None,
            is_main: true,
            stored: None,
            resumption: None,
        }
    }

    /// Kills the tasklet: discards the continuation without resuming it.
    ///
    /// Idempotent; returns true if the state changed.
    pub(crate) fn kill(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = TaskletState::Killed;
        self.stored = None;
        self.resumption = None;
        true
    }

    /// Marks the body as returned. Idempotent on terminal states.
    pub(crate) fn complete(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = TaskletState::Completed;
        self.stored = None;
        true
    }

    /// Parks the tasklet on `channel`.
    pub(crate) fn park_on(&mut self, channel: Option<ChannelId>) {
        self.state = TaskletState::Blocked;
        self.blocked_on = channel;
    }

    /// Delivers the pending payload and makes the tasklet runnable.
    ///
    /// The caller is responsible for re-enqueueing it.
    pub(crate) fn resume_with(&mut self, resumption: Resumption) {
        debug_assert!(
            self.resumption.is_none(),
            "tasklet {} already has a pending resumption",
            self.id
        );
        self.resumption = Some(resumption);
        self.blocked_on = None;
        self.state = TaskletState::Runnable;
    }

    /// Takes the pending payload, if any.
    pub(crate) fn take_resumption(&mut self) -> Option<Resumption> {
        self.resumption.take()
    }
}
