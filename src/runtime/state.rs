//! Shared scheduler state: the registries, the run-queue, and the
//! rendezvous/cancellation core.
//!
//! All mutation happens under one lock, held by exactly one logical thread
//! of control at a time; dispatch releases it before polling a continuation
//! so channel operations inside tasklet bodies can re-acquire it.

use std::sync::Mutex;

use crate::config::SchedulerConfig;
use crate::error::Error;
use crate::record::{ChannelRecord, Payload, Resumption, SendWaiter, TaskletRecord, TaskletState, WakePreference};
use crate::runtime::RunQueue;
use crate::tracing_compat::{debug, trace};
use crate::types::{ChannelId, Failure, OutcomeCode, TaskletId, Value};

/// Callback invoked on every dispatch with (previous, next).
pub type ScheduleCallback = Box<dyn FnMut(Option<TaskletId>, TaskletId) + Send>;

/// The lock wrapper the `Scheduler` handle, `Cx`, and wakers share.
pub(crate) struct SchedulerShared {
    pub(crate) state: Mutex<SchedulerState>,
}

/// Outcome of an immediate send attempt.
pub(crate) enum TrySend {
    /// Rendezvous completed against a waiting receiver.
    Complete,
    /// The oldest waiting receiver was dead; its entry has been removed.
    Failed(Failure),
    /// No receiver waiting; the payload is handed back for parking.
    NotReady(Payload),
}

/// Outcome of an immediate receive attempt.
pub(crate) enum TryReceive {
    /// Rendezvous completed against the oldest waiting sender.
    Complete(Result<Value, Failure>),
    /// No sender waiting.
    NotReady,
}

/// Point-in-time diagnostic view of a scheduler.
///
/// Tasklet counts exclude the synthetic driving-context record.
#[derive(Clone, Debug)]
pub struct SchedulerSnapshot {
    /// Tasklets in `Created` state.
    pub created: usize,
    /// Tasklets in `Runnable` state.
    pub runnable: usize,
    /// Tasklets in `Running` state.
    pub running: usize,
    /// Tasklets in `Blocked` state.
    pub blocked: usize,
    /// Tasklets in `Killed` state.
    pub killed: usize,
    /// Tasklets in `Completed` state.
    pub completed: usize,
    /// Run-queue occupancy.
    pub queued: usize,
    /// Dispatches performed so far.
    pub steps: u64,
    /// Balance per live channel, in registry order.
    pub channel_balances: Vec<(ChannelId, i64)>,
}

pub(crate) struct SchedulerState {
    pub(crate) tasklets: crate::util::Arena<TaskletRecord>,
    pub(crate) channels: crate::util::Arena<ChannelRecord>,
    pub(crate) run_queue: RunQueue,
    /// The tasklet occupying the active slot, while a dispatch is in flight.
    pub(crate) current: Option<TaskletId>,
    /// The tasklet that held the active slot in the previous dispatch.
    pub(crate) previous: Option<TaskletId>,
    /// Synthetic record for the driving context.
    pub(crate) main: TaskletId,
    pub(crate) last_outcome: OutcomeCode,
    pub(crate) switch_callback: Option<ScheduleCallback>,
    pub(crate) config: SchedulerConfig,
    pub(crate) steps: u64,
}

impl SchedulerState {
    pub(crate) fn new(config: SchedulerConfig) -> Self {
        let mut tasklets = crate::util::Arena::new();
        let idx =
            tasklets.insert_with(|idx| TaskletRecord::new_main(TaskletId::from_arena(idx)));
        let main = TaskletId::from_arena(idx);
        Self {
            tasklets,
            channels: crate::util::Arena::new(),
            run_queue: RunQueue::new(),
            current: None,
            previous: None,
            main,
            last_outcome: OutcomeCode::default(),
            switch_callback: None,
            config,
            steps: 0,
        }
    }

    pub(crate) fn tasklet(&self, id: TaskletId) -> Option<&TaskletRecord> {
        self.tasklets.get(id.arena_index())
    }

    pub(crate) fn tasklet_mut(&mut self, id: TaskletId) -> Option<&mut TaskletRecord> {
        self.tasklets.get_mut(id.arena_index())
    }

    pub(crate) fn channel_mut(&mut self, id: ChannelId) -> Option<&mut ChannelRecord> {
        self.channels.get_mut(id.arena_index())
    }

    pub(crate) fn is_tasklet(&self, id: TaskletId) -> bool {
        self.tasklets.contains(id.arena_index())
    }

    pub(crate) fn is_channel(&self, id: ChannelId) -> bool {
        self.channels.contains(id.arena_index())
    }

    /// Allocates a `Created` tasklet record and returns its id.
    pub(crate) fn allocate_tasklet(&mut self) -> TaskletId {
        let idx = self
            .tasklets
            .insert_with(|idx| TaskletRecord::new(TaskletId::from_arena(idx)));
        TaskletId::from_arena(idx)
    }

    pub(crate) fn create_channel(&mut self, preference: WakePreference) -> ChannelId {
        let idx = self
            .channels
            .insert_with(|idx| ChannelRecord::new(ChannelId::from_arena(idx), preference));
        let id = ChannelId::from_arena(idx);
        debug!(channel = %id, "channel created");
        id
    }

    /// Re-enqueues a woken tasklet according to the channel's wake policy.
    fn wake(&mut self, tasklet: TaskletId, preference: WakePreference) {
        match preference {
            WakePreference::Immediate => self.run_queue.push_front(tasklet),
            WakePreference::Queued => self.run_queue.push(tasklet),
        };
    }

    /// Attempts an immediate rendezvous for a sender.
    ///
    /// Pops the oldest waiting receiver. A dead receiver fails the send with
    /// `PartnerKilled`; its entry has already been unlinked by the pop, so
    /// the balance invariant holds.
    pub(crate) fn try_send(&mut self, channel: ChannelId, payload: Payload) -> TrySend {
        let Some(chan) = self.channel_mut(channel) else {
            return TrySend::NotReady(payload);
        };
        let preference = chan.preference;
        let Some(rx) = chan.pop_receiver() else {
            return TrySend::NotReady(payload);
        };

        let resumption = match payload {
            Payload::Value(v) => Resumption::Received(v),
            Payload::Exception(e) => Resumption::Failed(Failure::Raised(e)),
        };
        let delivered = match self.tasklets.get_mut(rx.arena_index()) {
            Some(rec) if rec.state == TaskletState::Blocked => {
                rec.resume_with(resumption);
                Some(rec.is_main)
            }
            _ => None,
        };
        match delivered {
            Some(is_main) => {
                trace!(channel = %channel, receiver = %rx, "rendezvous: sender matched receiver");
                if !is_main {
                    self.wake(rx, preference);
                }
                TrySend::Complete
            }
            None => {
                trace!(channel = %channel, receiver = %rx, "rendezvous partner dead");
                TrySend::Failed(Failure::PartnerKilled)
            }
        }
    }

    /// Attempts an immediate rendezvous for a receiver.
    pub(crate) fn try_receive(&mut self, channel: ChannelId) -> TryReceive {
        let Some(chan) = self.channel_mut(channel) else {
            return TryReceive::NotReady;
        };
        let preference = chan.preference;
        let Some(SendWaiter { tasklet: tx, payload }) = chan.pop_sender() else {
            return TryReceive::NotReady;
        };

        let delivered = match self.tasklets.get_mut(tx.arena_index()) {
            Some(rec) if rec.state == TaskletState::Blocked => {
                rec.resume_with(Resumption::Sent);
                Some(rec.is_main)
            }
            _ => None,
        };
        match delivered {
            Some(is_main) => {
                trace!(channel = %channel, sender = %tx, "rendezvous: receiver matched sender");
                if !is_main {
                    self.wake(tx, preference);
                }
                match payload {
                    Payload::Value(v) => TryReceive::Complete(Ok(v)),
                    Payload::Exception(e) => TryReceive::Complete(Err(Failure::Raised(e))),
                }
            }
            None => {
                trace!(channel = %channel, sender = %tx, "rendezvous partner dead");
                TryReceive::Complete(Err(Failure::PartnerKilled))
            }
        }
    }

    /// Parks `tasklet` on the senders-waiting queue, carrying `payload`.
    pub(crate) fn park_sender(&mut self, channel: ChannelId, tasklet: TaskletId, payload: Payload) {
        if let Some(chan) = self.channels.get_mut(channel.arena_index()) {
            chan.push_sender(SendWaiter { tasklet, payload });
        }
        if let Some(rec) = self.tasklets.get_mut(tasklet.arena_index()) {
            rec.park_on(Some(channel));
        }
        trace!(channel = %channel, tasklet = %tasklet, "sender parked");
    }

    /// Parks `tasklet` on the receivers-waiting queue.
    pub(crate) fn park_receiver(&mut self, channel: ChannelId, tasklet: TaskletId) {
        if let Some(chan) = self.channels.get_mut(channel.arena_index()) {
            chan.push_receiver(tasklet);
        }
        if let Some(rec) = self.tasklets.get_mut(tasklet.arena_index()) {
            rec.park_on(Some(channel));
        }
        trace!(channel = %channel, tasklet = %tasklet, "receiver parked");
    }

    /// Unlinks `tasklet` from `channel`'s wait queues, rebalancing.
    pub(crate) fn unlink_waiter(&mut self, channel: ChannelId, tasklet: TaskletId) {
        if let Some(chan) = self.channels.get_mut(channel.arena_index()) {
            chan.remove_sender(tasklet);
            chan.remove_receiver(tasklet);
        }
    }

    /// Kills a tasklet.
    ///
    /// Idempotent and safe in every state. A suspended continuation is
    /// discarded without being resumed. A wait-queue entry is left in place:
    /// whichever partner would have matched it observes `PartnerKilled` and
    /// the entry is removed at that point. Killing the driving context's
    /// record only interrupts its pending operation, if one is in flight.
    pub(crate) fn kill(&mut self, id: TaskletId) -> Result<(), Error> {
        let (is_main, state, blocked_on) = {
            let Some(rec) = self.tasklets.get_mut(id.arena_index()) else {
                return Err(Error::NotATasklet);
            };
            (rec.is_main, rec.state, rec.blocked_on)
        };

        if is_main {
            if state == TaskletState::Blocked {
                if let Some(rec) = self.tasklets.get_mut(id.arena_index()) {
                    rec.resume_with(Resumption::Failed(Failure::Interrupted));
                }
                if let Some(cid) = blocked_on {
                    self.unlink_waiter(cid, id);
                }
                debug!(tasklet = %id, "pending driver operation interrupted by kill");
            }
            return Ok(());
        }

        match state {
            TaskletState::Killed | TaskletState::Completed => Ok(()),
            TaskletState::Runnable | TaskletState::Created => {
                if let Some(rec) = self.tasklets.get_mut(id.arena_index()) {
                    rec.kill();
                }
                self.run_queue.remove(id);
                debug!(tasklet = %id, "killed while runnable");
                Ok(())
            }
            TaskletState::Running => {
                // The continuation is out in the active slot; the dispatch
                // loop drops it when the poll returns.
                if let Some(rec) = self.tasklets.get_mut(id.arena_index()) {
                    rec.kill();
                }
                debug!(tasklet = %id, "killed while running");
                Ok(())
            }
            TaskletState::Blocked => {
                if let Some(rec) = self.tasklets.get_mut(id.arena_index()) {
                    rec.kill();
                }
                debug!(tasklet = %id, "killed while blocked");
                Ok(())
            }
        }
    }

    /// Re-enqueues a parked or unqueued runnable tasklet at the tail.
    pub(crate) fn insert(&mut self, id: TaskletId) -> Result<(), Error> {
        let (is_main, state, parked_off_queue) = {
            let Some(rec) = self.tasklets.get_mut(id.arena_index()) else {
                return Err(Error::NotATasklet);
            };
            (rec.is_main, rec.state, rec.blocked_on.is_none())
        };
        if is_main {
            return Err(Error::NotRunnable);
        }
        match state {
            TaskletState::Runnable => {
                self.run_queue.push(id);
                Ok(())
            }
            TaskletState::Blocked if parked_off_queue => {
                if let Some(rec) = self.tasklets.get_mut(id.arena_index()) {
                    rec.state = TaskletState::Runnable;
                }
                self.run_queue.push(id);
                Ok(())
            }
            _ => Err(Error::NotRunnable),
        }
    }

    /// Drains every wait queue, delivering `Interrupted` to each parked
    /// waiter. Returns how many tasklets were unblocked.
    pub(crate) fn unblock_all_channels(&mut self) -> usize {
        let mut drained = Vec::new();
        for (_, chan) in self.channels.iter_mut() {
            while let Some(waiter) = chan.pop_sender() {
                drained.push(waiter.tasklet);
            }
            while let Some(rx) = chan.pop_receiver() {
                drained.push(rx);
            }
        }

        let mut woken = 0;
        for id in drained {
            let Some(rec) = self.tasklets.get_mut(id.arena_index()) else {
                continue;
            };
            if rec.state != TaskletState::Blocked {
                continue; // tombstone of a killed waiter
            }
            rec.resume_with(Resumption::Failed(Failure::Interrupted));
            let is_main = rec.is_main;
            woken += 1;
            if !is_main {
                self.run_queue.push(id);
            }
        }
        debug!(woken, "unblocked all channels");
        woken
    }

    /// Number of channels that currently have waiters queued.
    pub(crate) fn active_channel_count(&self) -> usize {
        self.channels.iter().filter(|(_, c)| c.has_waiters()).count()
    }

    pub(crate) fn snapshot(&self) -> SchedulerSnapshot {
        let mut snapshot = SchedulerSnapshot {
            created: 0,
            runnable: 0,
            running: 0,
            blocked: 0,
            killed: 0,
            completed: 0,
            queued: self.run_queue.len(),
            steps: self.steps,
            channel_balances: Vec::new(),
        };
        for (_, rec) in self.tasklets.iter() {
            if rec.is_main {
                continue;
            }
            match rec.state {
                TaskletState::Created => snapshot.created += 1,
                TaskletState::Runnable => snapshot.runnable += 1,
                TaskletState::Running => snapshot.running += 1,
                TaskletState::Blocked => snapshot.blocked += 1,
                TaskletState::Killed => snapshot.killed += 1,
                TaskletState::Completed => snapshot.completed += 1,
            }
        }
        for (_, chan) in self.channels.iter() {
            snapshot.channel_balances.push((chan.id, chan.balance));
        }
        snapshot
    }

    /// Tears the instance down: kills every tasklet, drops every channel and
    /// queue entry. Records are removed slot by slot so previously issued
    /// ids stay stale (their generations are retired); the driving-context
    /// record is re-created.
    pub(crate) fn shutdown(&mut self) {
        let ids: Vec<TaskletId> = self.tasklets.iter().map(|(_, r)| r.id).collect();
        for id in ids {
            let _ = self.kill(id);
            self.tasklets.remove(id.arena_index());
        }
        let channels: Vec<ChannelId> = self.channels.iter().map(|(_, c)| c.id).collect();
        for id in channels {
            self.channels.remove(id.arena_index());
        }
        self.run_queue.clear();
        self.current = None;
        self.previous = None;

        let idx = self
            .tasklets
            .insert_with(|idx| TaskletRecord::new_main(TaskletId::from_arena(idx)));
        self.main = TaskletId::from_arena(idx);
        debug!("scheduler shut down");
    }
}
