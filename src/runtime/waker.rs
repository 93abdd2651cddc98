//! Waker plumbing for dispatched continuations.
//!
//! Channel rendezvous and explicit yields re-enqueue tasklets directly, so
//! in the common case the waker is never invoked. It exists so a body that
//! awaits a foreign future still finds its way back onto the run-queue: such
//! a tasklet parks off-queue and the foreign waker brings it back.

use std::sync::{Arc, Weak};
use std::task::Wake;

use crate::record::TaskletState;
use crate::runtime::state::SchedulerShared;
use crate::tracing_compat::trace;
use crate::types::TaskletId;

pub(crate) struct TaskletWaker {
    pub(crate) tasklet: TaskletId,
    pub(crate) shared: Weak<SchedulerShared>,
}

impl Wake for TaskletWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut st = shared.state.lock().expect("scheduler lock poisoned");
        let id = self.tasklet;
        let (state, parked_off_queue, is_main) = match st.tasklet_mut(id) {
            Some(rec) => (rec.state, rec.blocked_on.is_none(), rec.is_main),
            None => return,
        };
        if is_main {
            return;
        }
        match state {
            // Woken during its own poll: keep it eligible for dispatch.
            TaskletState::Running | TaskletState::Runnable => {
                st.run_queue.push(id);
                trace!(tasklet = %id, "self-wake enqueued");
            }
            // Parked off-queue on a foreign future.
            TaskletState::Blocked if parked_off_queue => {
                if let Some(rec) = st.tasklet_mut(id) {
                    rec.state = TaskletState::Runnable;
                }
                st.run_queue.push(id);
                trace!(tasklet = %id, "foreign wake enqueued");
            }
            // Channel parks are woken by rendezvous completion, terminal
            // states not at all.
            _ => {}
        }
    }
}
