//! The context handle passed to every tasklet body.
//!
//! A `Cx` identifies the tasklet it was issued to and is the route to every
//! effectful operation a body can perform: channel rendezvous and explicit
//! yields (the only suspension points), plus scheduler services. Bodies
//! receive their `Cx` at bind time; sharing one across tasklets is possible
//! but the operations always act on behalf of the issuing tasklet.

use std::sync::Weak;

use crate::channel::{ReceiveOp, SendOp, YieldOp};
use crate::record::Payload;
use crate::runtime::state::SchedulerShared;
use crate::runtime::Scheduler;
use crate::types::{ChannelId, Exception, ExceptionKind, TaskletId, Traceback, Value};

/// Capability handle for one tasklet.
#[derive(Clone)]
pub struct Cx {
    pub(crate) shared: Weak<SchedulerShared>,
    pub(crate) tasklet: TaskletId,
}

impl Cx {
    /// The id of the tasklet this context was issued to.
    #[must_use]
    pub fn tasklet_id(&self) -> TaskletId {
        self.tasklet
    }

    /// A scheduler handle for registry operations (create, kill, insert…).
    ///
    /// # Panics
    ///
    /// Panics if the scheduler was dropped, which cannot happen while the
    /// issuing tasklet is being dispatched.
    #[must_use]
    pub fn scheduler(&self) -> Scheduler {
        Scheduler::from_shared(self.shared.upgrade().expect("scheduler dropped"))
    }

    /// Sends `value` over `channel`, suspending until a receiver takes it.
    pub fn send(&self, channel: ChannelId, value: Value) -> SendOp {
        SendOp::new(
            self.shared.clone(),
            channel,
            self.tasklet,
            Payload::Value(value),
        )
    }

    /// Sends `exception` over `channel`; the matched receiver's `receive`
    /// raises it instead of returning a value.
    pub fn send_throw(&self, channel: ChannelId, exception: Exception) -> SendOp {
        SendOp::new(
            self.shared.clone(),
            channel,
            self.tasklet,
            Payload::Exception(exception),
        )
    }

    /// Builds an exception from `kind` and optional context, then behaves as
    /// [`Cx::send_throw`].
    pub fn send_exception(
        &self,
        channel: ChannelId,
        kind: ExceptionKind,
        value: Option<Value>,
    ) -> SendOp {
        let mut exception = Exception::new(kind);
        if let Some(value) = value {
            exception = exception.with_value(value);
        }
        self.send_throw(channel, exception)
    }

    /// Sends an exception with an explicit traceback attached.
    pub fn send_throw_with_traceback(
        &self,
        channel: ChannelId,
        kind: ExceptionKind,
        value: Option<Value>,
        traceback: Traceback,
    ) -> SendOp {
        let mut exception = Exception::new(kind).with_traceback(traceback);
        if let Some(value) = value {
            exception = exception.with_value(value);
        }
        self.send_throw(channel, exception)
    }

    /// Receives the next value from `channel`, suspending until a sender
    /// arrives.
    pub fn receive(&self, channel: ChannelId) -> ReceiveOp {
        ReceiveOp::new(self.shared.clone(), channel, self.tasklet)
    }

    /// Yields control at an explicit suspension point.
    ///
    /// With `remove` true the caller steps off the run-queue (cleanup/kill
    /// flows) and resumes only via [`Scheduler::insert`].
    pub fn schedule(&self, remove: bool) -> YieldOp {
        YieldOp::new(self.shared.clone(), self.tasklet, remove)
    }
}

impl std::fmt::Debug for Cx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cx").field("tasklet", &self.tasklet).finish()
    }
}
