//! Rendezvous channel operations.
//!
//! Channels are synchronous and unbuffered: a send completes only by handing
//! its payload to a receiver, and each side queues FIFO while unmatched. The
//! operation futures here are the suspension points of a tasklet body. On
//! first poll they attempt an immediate rendezvous against the opposite
//! wait-queue; failing that they park the calling tasklet and surrender
//! control to the scheduler. A parked operation resumes when rendezvous
//! completion, exception injection, or cancellation stores a pending
//! payload in the tasklet's record.

use std::future::Future;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};

use crate::error::Error;
use crate::record::{Payload, Resumption, TaskletState};
use crate::runtime::state::{SchedulerShared, TryReceive, TrySend};
use crate::types::{ChannelId, Failure, OutcomeCode, TaskletId, Value};

/// True if the record is in a state that can legally issue an operation.
fn op_allowed(state: TaskletState) -> bool {
    !state.is_terminal()
}

/// A pending `send`, `send_throw`, or `send_exception` issued from a tasklet.
///
/// Resolves once the payload has been handed to a receiver, or fails with
/// the interruption/partner-death conditions described in [`Failure`].
#[must_use = "channel operations do nothing unless awaited"]
pub struct SendOp {
    shared: Weak<SchedulerShared>,
    channel: ChannelId,
    tasklet: TaskletId,
    payload: Option<Payload>,
    parked: bool,
}

impl SendOp {
    pub(crate) fn new(
        shared: Weak<SchedulerShared>,
        channel: ChannelId,
        tasklet: TaskletId,
        payload: Payload,
    ) -> Self {
        Self {
            shared,
            channel,
            tasklet,
            payload: Some(payload),
            parked: false,
        }
    }
}

impl Future for SendOp {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(shared) = this.shared.upgrade() else {
            return Poll::Ready(Err(Failure::Interrupted.into()));
        };
        let mut st = shared.state.lock().expect("scheduler lock poisoned");

        if this.parked {
            let resumption = match st.tasklet_mut(this.tasklet) {
                Some(rec) => rec.take_resumption(),
                None => return Poll::Ready(Err(Failure::Interrupted.into())),
            };
            return match resumption {
                Some(Resumption::Sent) => {
                    st.last_outcome = OutcomeCode::Success;
                    Poll::Ready(Ok(()))
                }
                Some(Resumption::Failed(failure)) => {
                    st.last_outcome = OutcomeCode::Failed;
                    Poll::Ready(Err(failure.into()))
                }
                Some(Resumption::Received(_)) => {
                    debug_assert!(false, "value delivered to a parked sender");
                    st.last_outcome = OutcomeCode::Failed;
                    Poll::Ready(Err(Failure::Interrupted.into()))
                }
                None => Poll::Pending,
            };
        }

        match st.tasklet(this.tasklet) {
            Some(rec) if op_allowed(rec.state) => {}
            _ => return Poll::Ready(Err(Failure::Interrupted.into())),
        }
        if !st.is_channel(this.channel) {
            return Poll::Ready(Err(Error::NotAChannel));
        }

        let payload = this.payload.take().expect("send payload already consumed");
        match st.try_send(this.channel, payload) {
            TrySend::Complete => {
                st.last_outcome = OutcomeCode::Success;
                Poll::Ready(Ok(()))
            }
            TrySend::Failed(failure) => {
                st.last_outcome = OutcomeCode::Failed;
                Poll::Ready(Err(failure.into()))
            }
            TrySend::NotReady(payload) => {
                st.park_sender(this.channel, this.tasklet, payload);
                this.parked = true;
                Poll::Pending
            }
        }
    }
}

/// A pending `receive` issued from a tasklet.
///
/// Resolves to the matched sender's value; a thrown payload surfaces as
/// [`Failure::Raised`] at this resumption point.
#[must_use = "channel operations do nothing unless awaited"]
pub struct ReceiveOp {
    shared: Weak<SchedulerShared>,
    channel: ChannelId,
    tasklet: TaskletId,
    parked: bool,
}

impl ReceiveOp {
    pub(crate) fn new(shared: Weak<SchedulerShared>, channel: ChannelId, tasklet: TaskletId) -> Self {
        Self {
            shared,
            channel,
            tasklet,
            parked: false,
        }
    }
}

impl Future for ReceiveOp {
    type Output = Result<Value, Error>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(shared) = this.shared.upgrade() else {
            return Poll::Ready(Err(Failure::Interrupted.into()));
        };
        let mut st = shared.state.lock().expect("scheduler lock poisoned");

        if this.parked {
            let resumption = match st.tasklet_mut(this.tasklet) {
                Some(rec) => rec.take_resumption(),
                None => return Poll::Ready(Err(Failure::Interrupted.into())),
            };
            return match resumption {
                Some(Resumption::Received(value)) => {
                    st.last_outcome = OutcomeCode::Success;
                    Poll::Ready(Ok(value))
                }
                Some(Resumption::Failed(failure)) => {
                    st.last_outcome = OutcomeCode::Failed;
                    Poll::Ready(Err(failure.into()))
                }
                Some(Resumption::Sent) => {
                    debug_assert!(false, "send completion delivered to a parked receiver");
                    st.last_outcome = OutcomeCode::Failed;
                    Poll::Ready(Err(Failure::Interrupted.into()))
                }
                None => Poll::Pending,
            };
        }

        match st.tasklet(this.tasklet) {
            Some(rec) if op_allowed(rec.state) => {}
            _ => return Poll::Ready(Err(Failure::Interrupted.into())),
        }
        if !st.is_channel(this.channel) {
            return Poll::Ready(Err(Error::NotAChannel));
        }

        match st.try_receive(this.channel) {
            TryReceive::Complete(Ok(value)) => {
                st.last_outcome = OutcomeCode::Success;
                Poll::Ready(Ok(value))
            }
            TryReceive::Complete(Err(failure)) => {
                st.last_outcome = OutcomeCode::Failed;
                Poll::Ready(Err(failure.into()))
            }
            TryReceive::NotReady => {
                st.park_receiver(this.channel, this.tasklet);
                this.parked = true;
                Poll::Pending
            }
        }
    }
}

/// An explicit yield: the other legal suspension point besides channel
/// operations.
///
/// With `remove` false the caller re-enqueues at the run-queue tail; with
/// `remove` true it steps off the queue entirely and runs again only after
/// [`Scheduler::insert`](crate::Scheduler::insert).
#[must_use = "yield operations do nothing unless awaited"]
pub struct YieldOp {
    shared: Weak<SchedulerShared>,
    tasklet: TaskletId,
    remove: bool,
    parked: bool,
}

impl YieldOp {
    pub(crate) fn new(shared: Weak<SchedulerShared>, tasklet: TaskletId, remove: bool) -> Self {
        Self {
            shared,
            tasklet,
            remove,
            parked: false,
        }
    }
}

impl Future for YieldOp {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.parked {
            return Poll::Ready(());
        }
        let Some(shared) = this.shared.upgrade() else {
            return Poll::Ready(());
        };
        let mut st = shared.state.lock().expect("scheduler lock poisoned");

        let state = match st.tasklet(this.tasklet) {
            Some(rec) => rec.state,
            None => return Poll::Ready(()),
        };
        if state.is_terminal() {
            return Poll::Ready(());
        }

        if this.remove {
            if let Some(rec) = st.tasklet_mut(this.tasklet) {
                rec.park_on(None);
            }
        } else {
            if let Some(rec) = st.tasklet_mut(this.tasklet) {
                rec.state = TaskletState::Runnable;
            }
            st.run_queue.push(this.tasklet);
        }
        this.parked = true;
        Poll::Pending
    }
}
