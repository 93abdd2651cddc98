//! Channel record: a FIFO pair of wait-queues and the balance counter.
//!
//! All queue mutation goes through the push/pop/remove helpers here so the
//! balance counter can never drift from the queue contents. Sign convention:
//! positive balance means senders are waiting, negative means receivers.

use std::collections::VecDeque;

use crate::types::{ChannelId, Exception, TaskletId, Value};

/// What a completed rendezvous does with the woken tasklet.
///
/// Scheduling policy only; correctness does not depend on the choice.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WakePreference {
    /// Push the woken tasklet to the head of the run-queue so it runs on the
    /// next dispatch (hand-off latency).
    Immediate,
    /// Enqueue at the tail like any other runnable tasklet (pure FIFO).
    #[default]
    Queued,
}

/// The payload a parked sender carries: a plain value, or an exception to be
/// raised at the matched receiver's resumption point.
#[derive(Debug)]
pub enum Payload {
    /// Ordinary value transfer.
    Value(Value),
    /// Injected exception (`send_throw` / `send_exception`).
    Exception(Exception),
}

/// One entry in the senders-waiting queue.
#[derive(Debug)]
pub struct SendWaiter {
    /// The parked sender.
    pub tasklet: TaskletId,
    /// The in-flight payload for its matched receiver.
    pub payload: Payload,
}

/// Internal record for one channel.
#[derive(Debug)]
pub struct ChannelRecord {
    /// The channel's id.
    pub id: ChannelId,
    /// Wake policy applied when a rendezvous completes.
    pub preference: WakePreference,
    /// Signed count of unmatched waiters: `senders.len() - receivers.len()`.
    pub balance: i64,
    pub(crate) senders: VecDeque<SendWaiter>,
    pub(crate) receivers: VecDeque<TaskletId>,
}

impl ChannelRecord {
    /// Creates an empty channel record.
    #[must_use]
    pub(crate) fn new(id: ChannelId, preference: WakePreference) -> Self {
        Self {
            id,
            preference,
            balance: 0,
            senders: VecDeque::new(),
            receivers: VecDeque::new(),
        }
    }

    /// Number of queued senders.
    #[must_use]
    pub fn sender_count(&self) -> usize {
        self.senders.len()
    }

    /// Number of queued receivers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.receivers.len()
    }

    /// True if any waiter is queued on either side.
    #[must_use]
    pub fn has_waiters(&self) -> bool {
        !self.senders.is_empty() || !self.receivers.is_empty()
    }

    pub(crate) fn push_sender(&mut self, waiter: SendWaiter) {
        self.senders.push_back(waiter);
        self.balance += 1;
        self.check_balance();
    }

    pub(crate) fn pop_sender(&mut self) -> Option<SendWaiter> {
        let waiter = self.senders.pop_front()?;
        self.balance -= 1;
        self.check_balance();
        Some(waiter)
    }

    pub(crate) fn push_receiver(&mut self, tasklet: TaskletId) {
        self.receivers.push_back(tasklet);
        self.balance -= 1;
        self.check_balance();
    }

    pub(crate) fn pop_receiver(&mut self) -> Option<TaskletId> {
        let tasklet = self.receivers.pop_front()?;
        self.balance += 1;
        self.check_balance();
        Some(tasklet)
    }

    /// Unlinks a parked sender; true if an entry was removed.
    pub(crate) fn remove_sender(&mut self, tasklet: TaskletId) -> bool {
        let before = self.senders.len();
        self.senders.retain(|w| w.tasklet != tasklet);
        let removed = before - self.senders.len();
        self.balance -= removed as i64;
        self.check_balance();
        removed > 0
    }

    /// Unlinks a parked receiver; true if an entry was removed.
    pub(crate) fn remove_receiver(&mut self, tasklet: TaskletId) -> bool {
        let before = self.receivers.len();
        self.receivers.retain(|t| *t != tasklet);
        let removed = before - self.receivers.len();
        self.balance += removed as i64;
        self.check_balance();
        removed > 0
    }

    fn check_balance(&self) {
        debug_assert_eq!(
            self.balance,
            self.sender_count() as i64 - self.receiver_count() as i64,
            "channel {} balance out of sync",
            self.id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chan() -> ChannelRecord {
        ChannelRecord::new(ChannelId::new_for_test(0, 0), WakePreference::default())
    }

    fn waiter(n: u32) -> SendWaiter {
        SendWaiter {
            tasklet: TaskletId::new_for_test(n, 0),
            payload: Payload::Value(Value::new(n)),
        }
    }

    #[test]
    fn balance_tracks_queues() {
        let mut c = chan();
        c.push_sender(waiter(1));
        c.push_sender(waiter(2));
        assert_eq!(c.balance, 2);

        c.push_receiver(TaskletId::new_for_test(3, 0));
        assert_eq!(c.balance, 1);

        c.pop_sender();
        c.pop_sender();
        c.pop_receiver();
        assert_eq!(c.balance, 0);
        assert!(!c.has_waiters());
    }

    #[test]
    fn senders_match_in_fifo_order() {
        let mut c = chan();
        c.push_sender(waiter(1));
        c.push_sender(waiter(2));
        assert_eq!(c.pop_sender().unwrap().tasklet, TaskletId::new_for_test(1, 0));
        assert_eq!(c.pop_sender().unwrap().tasklet, TaskletId::new_for_test(2, 0));
    }

    #[test]
    fn remove_rebalances() {
        let mut c = chan();
        c.push_receiver(TaskletId::new_for_test(1, 0));
        c.push_receiver(TaskletId::new_for_test(2, 0));
        assert_eq!(c.balance, -2);

        assert!(c.remove_receiver(TaskletId::new_for_test(1, 0)));
        assert_eq!(c.balance, -1);
        assert!(!c.remove_receiver(TaskletId::new_for_test(1, 0)));
        assert_eq!(c.receiver_count(), 1);
    }
}
