//! The scheduler handle: tasklet creation, dispatch, blocking operations
//! from the driving context, and the process-wide instance.

use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context, Poll, Waker};

use crate::config::SchedulerConfig;
use crate::cx::Cx;
use crate::error::Error;
use crate::record::{Payload, Resumption, TaskletState, WakePreference};
use crate::runtime::state::{
    ScheduleCallback, SchedulerShared, SchedulerSnapshot, SchedulerState, TryReceive, TrySend,
};
use crate::runtime::waker::TaskletWaker;
use crate::runtime::StoredTasklet;
use crate::tracing_compat::{debug, trace};
use crate::types::{
    ChannelId, Exception, ExceptionKind, Failure, OutcomeCode, TaskletBody, TaskletId, Value,
};

/// A cloneable handle to one scheduler instance.
///
/// The scheduler owns the registry of all live tasklets and channels, the
/// FIFO run-queue, and the active slot holding the continuation of whichever
/// tasklet is currently running. Dispatch is strictly cooperative: a tasklet
/// runs until it blocks on a channel operation, yields explicitly, or its
/// body returns.
///
/// The thread that calls [`Scheduler::run`], [`Scheduler::schedule`], or the
/// blocking channel operations is the *driving context*; it is represented
/// in the registry by a synthetic main tasklet so its own pending channel
/// operation can rendezvous with tasklets like any other waiter.
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
}

impl Clone for Scheduler {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Creates a scheduler with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    /// Creates a scheduler with an explicit configuration.
    #[must_use]
    pub fn with_config(config: SchedulerConfig) -> Self {
        Self {
            shared: Arc::new(SchedulerShared {
                state: Mutex::new(SchedulerState::new(config)),
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<SchedulerShared>) -> Self {
        Self { shared }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.shared.state.lock().expect("scheduler lock poisoned")
    }

    /// True if `other` is a handle to this same scheduler instance.
    #[must_use]
    pub fn same_instance(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    // ---- creation and registry -------------------------------------------

    /// Creates a tasklet bound to the deferred call `f(cx)` and enqueues it
    /// at the tail of the run-queue.
    pub fn create_tasklet<F, Fut>(&self, f: F) -> TaskletId
    where
        F: FnOnce(Cx) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.lock().allocate_tasklet();
        let cx = Cx {
            shared: Arc::downgrade(&self.shared),
            tasklet: id,
        };
        let future = Box::pin(f(cx));
        self.attach(id, StoredTasklet::new(id, future));
        id
    }

    /// Binds a tasklet to a callable carried as an opaque payload.
    ///
    /// # Errors
    ///
    /// `InvalidCallable` if the payload is not a [`TaskletBody`].
    pub fn create_tasklet_value(&self, callable: &Value) -> Result<TaskletId, Error> {
        let body = callable
            .downcast_ref::<TaskletBody>()
            .ok_or(Error::InvalidCallable)?
            .clone();
        let id = self.lock().allocate_tasklet();
        let cx = Cx {
            shared: Arc::downgrade(&self.shared),
            tasklet: id,
        };
        let future = body.bind(cx);
        self.attach(id, StoredTasklet::new(id, future));
        Ok(id)
    }

    fn attach(&self, id: TaskletId, stored: StoredTasklet) {
        let mut st = self.lock();
        let bind = match st.tasklet_mut(id) {
            Some(rec) if rec.state == TaskletState::Created => {
                rec.stored = Some(stored);
                rec.state = TaskletState::Runnable;
                true
            }
            // Killed between allocation and bind: the continuation is
            // discarded without ever being enqueued.
            _ => false,
        };
        if bind {
            st.run_queue.push(id);
            debug!(tasklet = %id, "tasklet created");
        }
    }

    /// Creates a channel with the configured default wake policy.
    #[must_use]
    pub fn create_channel(&self) -> ChannelId {
        let mut st = self.lock();
        let preference = st.config.preference;
        st.create_channel(preference)
    }

    /// Creates a channel with an explicit wake policy.
    #[must_use]
    pub fn create_channel_with(&self, preference: WakePreference) -> ChannelId {
        self.lock().create_channel(preference)
    }

    /// Capability check: is `id` a live tasklet? Never fails.
    #[must_use]
    pub fn is_tasklet(&self, id: TaskletId) -> bool {
        self.lock().is_tasklet(id)
    }

    /// Capability check: is `id` a live channel? Never fails.
    #[must_use]
    pub fn is_channel(&self, id: ChannelId) -> bool {
        self.lock().is_channel(id)
    }

    /// Kills a tasklet. Idempotent; safe in every state.
    ///
    /// # Errors
    ///
    /// `NotATasklet` if `id` is not a live tasklet.
    pub fn kill(&self, id: TaskletId) -> Result<(), Error> {
        self.lock().kill(id)
    }

    /// Re-enqueues a parked or unqueued runnable tasklet at the tail.
    ///
    /// # Errors
    ///
    /// `NotATasklet` for a stale id; `NotRunnable` if the tasklet is blocked
    /// on a channel, currently running, or terminal.
    pub fn insert(&self, id: TaskletId) -> Result<(), Error> {
        self.lock().insert(id)
    }

    // ---- dispatch --------------------------------------------------------

    /// Dispatches one tasklet: the head of the run-queue, or `target`.
    ///
    /// Returns the id of the tasklet that held the running slot during this
    /// call, `None` if the queue was idle. With `remove` true the dispatched
    /// tasklet is stepped off the run-queue after its poll instead of
    /// keeping any position it re-acquired by yielding.
    ///
    /// # Errors
    ///
    /// With an explicit `target`: `NotATasklet` for a stale id,
    /// `NotRunnable` if the target cannot be dispatched.
    pub fn schedule(
        &self,
        target: Option<TaskletId>,
        remove: bool,
    ) -> Result<Option<TaskletId>, Error> {
        match target {
            Some(id) => {
                {
                    let st = self.lock();
                    match st.tasklet(id) {
                        None => return Err(Error::NotATasklet),
                        Some(rec)
                            if rec.state == TaskletState::Runnable && rec.stored.is_some() => {}
                        Some(_) => return Err(Error::NotRunnable),
                    }
                }
                match self.dispatch(Some(id), remove) {
                    Some(ran) => Ok(Some(ran)),
                    None => Err(Error::NotRunnable),
                }
            }
            None => Ok(self.dispatch(None, remove)),
        }
    }

    /// Runs until the run-queue is empty or the configured step guard trips.
    ///
    /// Returns the number of dispatches performed.
    pub fn run(&self) -> u64 {
        let max_steps = self.lock().config.max_steps;
        let mut steps = 0_u64;
        loop {
            if let Some(max) = max_steps {
                if steps >= max {
                    debug!(steps, "run stopped by step guard");
                    break;
                }
            }
            if self.dispatch(None, false).is_none() {
                break;
            }
            steps += 1;
        }
        steps
    }

    /// Performs at most `n` dispatches; returns how many actually ran.
    pub fn run_steps(&self, n: u64) -> u64 {
        let mut steps = 0_u64;
        while steps < n {
            if self.dispatch(None, false).is_none() {
                break;
            }
            steps += 1;
        }
        steps
    }

    fn dispatch(&self, pick: Option<TaskletId>, remove: bool) -> Option<TaskletId> {
        let (id, mut stored, prev, mut callback) = loop {
            let mut st = self.lock();
            let id = match pick {
                Some(id) => {
                    match st.tasklet(id) {
                        Some(rec)
                            if rec.state == TaskletState::Runnable && rec.stored.is_some() => {}
                        _ => return None,
                    }
                    st.run_queue.remove(id);
                    id
                }
                None => {
                    let id = st.run_queue.pop()?;
                    match st.tasklet(id) {
                        Some(rec)
                            if rec.state == TaskletState::Runnable && rec.stored.is_some() =>
                        {
                            id
                        }
                        // Stale queue entry; try the next one.
                        _ => continue,
                    }
                }
            };

            let rec = st.tasklet_mut(id).expect("validated above");
            let stored = rec.stored.take().expect("validated above");
            rec.state = TaskletState::Running;
            let prev = st.previous;
            st.current = Some(id);
            st.steps += 1;
            let callback = st.switch_callback.take();
            break (id, stored, prev, callback);
        };

        trace!(tasklet = %id, "dispatch");
        if let Some(cb) = callback.as_mut() {
            cb(prev, id);
        }

        let waker = Waker::from(Arc::new(TaskletWaker {
            tasklet: id,
            shared: Arc::downgrade(&self.shared),
        }));
        let mut poll_cx = Context::from_waker(&waker);
        let poll = stored.poll(&mut poll_cx);

        let mut st = self.lock();
        st.current = None;
        st.previous = Some(id);
        if let Some(cb) = callback {
            if st.switch_callback.is_none() {
                st.switch_callback = Some(cb);
            }
        }

        let queued = st.run_queue.contains(id);
        if let Some(rec) = st.tasklet_mut(id) {
            match poll {
                Poll::Ready(()) => {
                    rec.complete();
                }
                Poll::Pending => match rec.state {
                    TaskletState::Running => {
                        // The body awaited something other than our own
                        // suspension points: park off-queue and let its
                        // waker bring it back.
                        rec.stored = Some(stored);
                        if queued {
                            rec.state = TaskletState::Runnable;
                        } else {
                            rec.park_on(None);
                        }
                    }
                    TaskletState::Runnable | TaskletState::Blocked | TaskletState::Created => {
                        rec.stored = Some(stored);
                    }
                    TaskletState::Killed | TaskletState::Completed => {
                        // Killed mid-poll: the continuation is dropped here,
                        // never resumed.
                    }
                },
            }
        }

        if remove {
            let runnable = st
                .tasklet(id)
                .is_some_and(|rec| rec.state == TaskletState::Runnable);
            if runnable {
                st.run_queue.remove(id);
                if let Some(rec) = st.tasklet_mut(id) {
                    rec.park_on(None);
                }
                trace!(tasklet = %id, "stepped off the run-queue");
            }
        }

        Some(id)
    }

    // ---- blocking operations from the driving context --------------------

    /// Sends `value`, blocking the driving context until a receiver takes it.
    ///
    /// If a receiver is already waiting the rendezvous completes without
    /// suspension. Otherwise the scheduler runs until the operation
    /// completes, is interrupted, or no runnable tasklet remains
    /// (`Failure::Deadlock`).
    ///
    /// # Errors
    ///
    /// `NotAChannel`, `Reentrant`, or a wrapped [`Failure`].
    pub fn send(&self, channel: ChannelId, value: Value) -> Result<(), Error> {
        self.drive_send(channel, Payload::Value(value))
    }

    /// Sends `exception`; the matched receiver raises it at its resumption
    /// point instead of returning a value.
    ///
    /// # Errors
    ///
    /// As for [`Scheduler::send`].
    pub fn send_throw(&self, channel: ChannelId, exception: Exception) -> Result<(), Error> {
        self.drive_send(channel, Payload::Exception(exception))
    }

    /// Builds an exception from `kind` and `value`, then behaves as
    /// [`Scheduler::send_throw`].
    ///
    /// # Errors
    ///
    /// As for [`Scheduler::send`].
    pub fn send_exception(
        &self,
        channel: ChannelId,
        kind: ExceptionKind,
        value: Option<Value>,
    ) -> Result<(), Error> {
        let mut exception = Exception::new(kind);
        if let Some(value) = value {
            exception = exception.with_value(value);
        }
        self.drive_send(channel, Payload::Exception(exception))
    }

    /// Receives the next value, blocking the driving context until a sender
    /// arrives.
    ///
    /// # Errors
    ///
    /// As for [`Scheduler::send`]; a thrown payload surfaces as
    /// `Failure::Raised`.
    pub fn receive(&self, channel: ChannelId) -> Result<Value, Error> {
        {
            let mut st = self.lock();
            if !st.is_channel(channel) {
                return Err(Error::NotAChannel);
            }
            let main = st.main;
            if st.tasklet(main).map(|r| r.state) == Some(TaskletState::Blocked) {
                return Err(Error::Reentrant);
            }
            match st.try_receive(channel) {
                TryReceive::Complete(Ok(value)) => {
                    st.last_outcome = OutcomeCode::Success;
                    return Ok(value);
                }
                TryReceive::Complete(Err(failure)) => {
                    st.last_outcome = OutcomeCode::Failed;
                    return Err(failure.into());
                }
                TryReceive::NotReady => {
                    st.park_receiver(channel, main);
                }
            }
        }
        match self.pump_main()? {
            Resumption::Received(value) => Ok(value),
            Resumption::Failed(failure) => Err(failure.into()),
            Resumption::Sent => {
                debug_assert!(false, "send completion delivered to the driving receiver");
                Err(Failure::Interrupted.into())
            }
        }
    }

    fn drive_send(&self, channel: ChannelId, payload: Payload) -> Result<(), Error> {
        {
            let mut st = self.lock();
            if !st.is_channel(channel) {
                return Err(Error::NotAChannel);
            }
            let main = st.main;
            if st.tasklet(main).map(|r| r.state) == Some(TaskletState::Blocked) {
                return Err(Error::Reentrant);
            }
            match st.try_send(channel, payload) {
                TrySend::Complete => {
                    st.last_outcome = OutcomeCode::Success;
                    return Ok(());
                }
                TrySend::Failed(failure) => {
                    st.last_outcome = OutcomeCode::Failed;
                    return Err(failure.into());
                }
                TrySend::NotReady(payload) => {
                    st.park_sender(channel, main, payload);
                }
            }
        }
        match self.pump_main()? {
            Resumption::Sent => Ok(()),
            Resumption::Failed(failure) => Err(failure.into()),
            Resumption::Received(_) => {
                debug_assert!(false, "value delivered to the driving sender");
                Err(Failure::Interrupted.into())
            }
        }
    }

    /// Runs the scheduler until the driving context's parked operation is
    /// resolved, or declares deadlock when the run-queue empties first.
    fn pump_main(&self) -> Result<Resumption, Error> {
        loop {
            let stepped = self.dispatch(None, false);

            let mut st = self.lock();
            let main = st.main;
            let resumption = st.tasklet_mut(main).and_then(|rec| rec.take_resumption());
            if let Some(resumption) = resumption {
                if let Some(rec) = st.tasklet_mut(main) {
                    rec.state = TaskletState::Running;
                    rec.blocked_on = None;
                }
                st.last_outcome = match resumption {
                    Resumption::Failed(_) => OutcomeCode::Failed,
                    _ => OutcomeCode::Success,
                };
                return Ok(resumption);
            }

            if stepped.is_none() {
                let blocked_on = st.tasklet(main).and_then(|rec| rec.blocked_on);
                if let Some(cid) = blocked_on {
                    st.unlink_waiter(cid, main);
                }
                if let Some(rec) = st.tasklet_mut(main) {
                    rec.state = TaskletState::Running;
                    rec.blocked_on = None;
                }
                st.last_outcome = OutcomeCode::Failed;
                debug!("driving operation deadlocked: no runnable tasklet remains");
                return Err(Failure::Deadlock.into());
            }
        }
    }

    // ---- introspection ---------------------------------------------------

    /// The tasklet currently holding the running slot, or the driving
    /// context's tasklet when no dispatch is in flight.
    #[must_use]
    pub fn current(&self) -> TaskletId {
        let st = self.lock();
        st.current.unwrap_or(st.main)
    }

    /// The synthetic tasklet representing the driving context.
    #[must_use]
    pub fn main_tasklet(&self) -> TaskletId {
        self.lock().main
    }

    /// Queued runnable tasklets plus the driving context, mirroring the
    /// classic run-counter convention.
    #[must_use]
    pub fn runcount(&self) -> usize {
        self.lock().run_queue.len() + 1
    }

    /// The diagnostic probe: outcome of the last channel operation.
    #[must_use]
    pub fn last_outcome(&self) -> OutcomeCode {
        self.lock().last_outcome
    }

    /// Installs (or clears) the dispatch callback and returns the previous
    /// one. The callback observes every dispatch as (previous, next).
    pub fn set_schedule_callback(
        &self,
        callback: Option<ScheduleCallback>,
    ) -> Option<ScheduleCallback> {
        let mut st = self.lock();
        std::mem::replace(&mut st.switch_callback, callback)
    }

    /// Point-in-time diagnostic snapshot.
    #[must_use]
    pub fn snapshot(&self) -> SchedulerSnapshot {
        self.lock().snapshot()
    }

    /// Number of channels that currently have parked waiters.
    #[must_use]
    pub fn active_channel_count(&self) -> usize {
        self.lock().active_channel_count()
    }

    /// Delivers `Interrupted` to every parked waiter on every channel and
    /// re-enqueues the unblocked tasklets. Returns how many were woken.
    pub fn unblock_all_channels(&self) -> usize {
        self.lock().unblock_all_channels()
    }

    /// Kills every live tasklet and empties the registries and run-queue.
    /// Previously issued ids go stale.
    pub fn shutdown(&self) {
        self.lock().shutdown();
    }
}

static PROCESS_SCHEDULER: OnceLock<Scheduler> = OnceLock::new();

/// The process-wide scheduler instance, created on first use and living
/// until process exit ([`Scheduler::shutdown`] tears its contents down).
///
/// Embedding layers that want isolation should construct their own
/// [`Scheduler`] instead; every operation takes the handle explicitly.
#[must_use]
pub fn get_scheduler() -> Scheduler {
    PROCESS_SCHEDULER.get_or_init(Scheduler::new).clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn tasklet_receives_sent_value() {
        init_test("tasklet_receives_sent_value");
        let sched = Scheduler::new();
        let ch = sched.create_channel();

        let got: Arc<StdMutex<Option<Value>>> = Arc::new(StdMutex::new(None));
        let slot = Arc::clone(&got);
        sched.create_tasklet(move |cx| async move {
            let v = cx.receive(ch).await.expect("receive should succeed");
            *slot.lock().unwrap() = Some(v);
        });

        // Run the tasklet until it parks as a receiver.
        sched.schedule(None, false).unwrap();
        assert_eq!(sched.snapshot().channel_balances, vec![(ch, -1)]);

        // A receiver is waiting, so the send completes without suspension.
        let v = Value::new(42_i32);
        sched.send(ch, v.clone()).expect("send should succeed");
        assert_eq!(sched.last_outcome(), OutcomeCode::Success);

        sched.run();
        let received = got.lock().unwrap().take().expect("tasklet saw the value");
        assert!(received.ptr_eq(&v));
        assert_eq!(received.downcast_ref::<i32>(), Some(&42));
        crate::test_complete!("tasklet_receives_sent_value");
    }

    #[test]
    fn send_exception_raises_at_receiver() {
        init_test("send_exception_raises_at_receiver");
        let sched = Scheduler::new();
        let ch = sched.create_channel();

        let caught: Arc<StdMutex<Option<Error>>> = Arc::new(StdMutex::new(None));
        let slot = Arc::clone(&caught);
        sched.create_tasklet(move |cx| async move {
            let err = cx.receive(ch).await.expect_err("receive should raise");
            *slot.lock().unwrap() = Some(err);
        });
        sched.schedule(None, false).unwrap();

        sched
            .send_exception(ch, ExceptionKind::new("ValueError"), Some(Value::new("bad")))
            .expect("send_exception should succeed");
        sched.run();

        match caught.lock().unwrap().take() {
            Some(Error::Failed(Failure::Raised(exception))) => {
                assert_eq!(exception.kind(), ExceptionKind::new("ValueError"));
                let value = exception.value().expect("exception carries its value");
                assert_eq!(value.downcast_ref::<&str>(), Some(&"bad"));
            }
            other => panic!("expected a raised ValueError, got {other:?}"),
        }
        crate::test_complete!("send_exception_raises_at_receiver");
    }

    #[test]
    fn send_throw_preserves_exception_context() {
        init_test("send_throw_preserves_exception_context");
        let sched = Scheduler::new();
        let ch = sched.create_channel();

        let caught: Arc<StdMutex<Option<Error>>> = Arc::new(StdMutex::new(None));
        let slot = Arc::clone(&caught);
        sched.create_tasklet(move |cx| async move {
            let err = cx.receive(ch).await.expect_err("receive should raise");
            *slot.lock().unwrap() = Some(err);
        });
        sched.schedule(None, false).unwrap();

        let value = Value::new(7_u8);
        let traceback = crate::types::Traceback::new(vec!["frame0".into(), "frame1".into()]);
        let exception = Exception::new(ExceptionKind::new("RuntimeError"))
            .with_value(value.clone())
            .with_traceback(traceback.clone());
        sched
            .send_throw(ch, exception.clone())
            .expect("send_throw should succeed");
        sched.run();

        match caught.lock().unwrap().take() {
            Some(Error::Failed(Failure::Raised(delivered))) => {
                assert_eq!(delivered, exception);
                assert!(delivered.value().unwrap().ptr_eq(&value));
                assert_eq!(delivered.traceback(), Some(&traceback));
            }
            other => panic!("expected the thrown exception, got {other:?}"),
        }
        crate::test_complete!("send_throw_preserves_exception_context");
    }

    #[test]
    fn fifo_matching_pairs_oldest_first() {
        init_test("fifo_matching_pairs_oldest_first");
        let sched = Scheduler::new();
        let ch = sched.create_channel();
        let v1 = Value::new(1_i32);
        let v2 = Value::new(2_i32);

        let send1 = v1.clone();
        sched.create_tasklet(move |cx| async move {
            cx.send(ch, send1).await.expect("first send");
        });
        let send2 = v2.clone();
        sched.create_tasklet(move |cx| async move {
            cx.send(ch, send2).await.expect("second send");
        });

        // Park both senders, in creation order.
        sched.schedule(None, false).unwrap();
        sched.schedule(None, false).unwrap();
        assert_eq!(sched.snapshot().channel_balances, vec![(ch, 2)]);

        let first = sched.receive(ch).expect("first receive");
        assert!(first.ptr_eq(&v1));
        let second = sched.receive(ch).expect("second receive");
        assert!(second.ptr_eq(&v2));

        sched.run();
        let snap = sched.snapshot();
        assert_eq!(snap.completed, 2);
        assert_eq!(snap.channel_balances, vec![(ch, 0)]);
        crate::test_complete!("fifo_matching_pairs_oldest_first");
    }

    #[test]
    fn scheduler_fairness_visits_in_creation_order() {
        init_test("scheduler_fairness_visits_in_creation_order");
        let sched = Scheduler::new();
        let order: Arc<StdMutex<Vec<u32>>> = Arc::new(StdMutex::new(Vec::new()));

        let ids: Vec<TaskletId> = (0..5)
            .map(|i| {
                let order = Arc::clone(&order);
                sched.create_tasklet(move |_cx| async move {
                    order.lock().unwrap().push(i);
                })
            })
            .collect();

        let mut visited = Vec::new();
        for _ in 0..5 {
            visited.push(
                sched
                    .schedule(None, false)
                    .unwrap()
                    .expect("queue should not be idle yet"),
            );
        }

        assert_eq!(visited, ids);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert!(sched.schedule(None, false).unwrap().is_none());
        crate::test_complete!("scheduler_fairness_visits_in_creation_order");
    }

    #[test]
    fn kill_before_rendezvous_fails_pending_send() {
        init_test("kill_before_rendezvous_fails_pending_send");
        let sched = Scheduler::new();
        let ch = sched.create_channel();

        let t = sched.create_tasklet(move |cx| async move {
            let _ = cx.receive(ch).await;
        });
        sched.schedule(None, false).unwrap();
        assert_eq!(sched.snapshot().channel_balances, vec![(ch, -1)]);

        sched.kill(t).unwrap();
        // The killed waiter's entry still counts toward the balance until a
        // partner observes it.
        assert_eq!(sched.snapshot().channel_balances, vec![(ch, -1)]);

        let err = sched.send(ch, Value::new(0_u8)).unwrap_err();
        assert_eq!(err, Error::Failed(Failure::PartnerKilled));
        assert_eq!(sched.last_outcome().as_i32(), -1);
        assert_eq!(sched.snapshot().channel_balances, vec![(ch, 0)]);

        // Kill is idempotent.
        sched.kill(t).unwrap();
        crate::test_complete!("kill_before_rendezvous_fails_pending_send");
    }

    #[test]
    fn blocking_send_runs_scheduler_until_matched() {
        init_test("blocking_send_runs_scheduler_until_matched");
        let sched = Scheduler::new();
        let ch = sched.create_channel();

        let got: Arc<StdMutex<Option<Value>>> = Arc::new(StdMutex::new(None));
        let slot = Arc::clone(&got);
        sched.create_tasklet(move |cx| async move {
            let v = cx.receive(ch).await.expect("receive should succeed");
            *slot.lock().unwrap() = Some(v);
        });

        // The tasklet has not run yet, so the driving send must pump the
        // scheduler until the receiver arrives.
        let v = Value::new("hello");
        sched.send(ch, v.clone()).expect("send should succeed");
        sched.run();

        assert!(got.lock().unwrap().take().expect("delivered").ptr_eq(&v));
        crate::test_complete!("blocking_send_runs_scheduler_until_matched");
    }

    #[test]
    fn deadlocked_driver_operation_fails() {
        init_test("deadlocked_driver_operation_fails");
        let sched = Scheduler::new();
        let ch = sched.create_channel();

        let err = sched.send(ch, Value::new(0_u8)).unwrap_err();
        assert_eq!(err, Error::Failed(Failure::Deadlock));
        assert_eq!(sched.last_outcome().as_i32(), -1);
        assert_eq!(sched.snapshot().channel_balances, vec![(ch, 0)]);

        let err = sched.receive(ch).unwrap_err();
        assert_eq!(err, Error::Failed(Failure::Deadlock));
        assert_eq!(sched.snapshot().channel_balances, vec![(ch, 0)]);
        crate::test_complete!("deadlocked_driver_operation_fails");
    }

    #[test]
    fn schedule_callback_observes_every_dispatch() {
        init_test("schedule_callback_observes_every_dispatch");
        let sched = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let pairs: Arc<StdMutex<Vec<(Option<TaskletId>, TaskletId)>>> =
            Arc::new(StdMutex::new(Vec::new()));

        let cb_count = Arc::clone(&count);
        let cb_pairs = Arc::clone(&pairs);
        let previous = sched.set_schedule_callback(Some(Box::new(move |prev, next| {
            cb_count.fetch_add(1, Ordering::SeqCst);
            cb_pairs.lock().unwrap().push((prev, next));
        })));
        assert!(previous.is_none());

        let mut ids = Vec::new();
        for _ in 0..2 {
            ids.push(sched.create_tasklet(move |cx| async move {
                for _ in 0..3 {
                    cx.schedule(false).await;
                }
            }));
        }
        sched.run();

        // Each tasklet is polled four times (three yields + completion).
        assert_eq!(count.load(Ordering::SeqCst), 8);
        let pairs = pairs.lock().unwrap();
        assert_eq!(pairs[0], (None, ids[0]));
        assert_eq!(pairs[1], (Some(ids[0]), ids[1]));

        let installed = sched.set_schedule_callback(None);
        assert!(installed.is_some());
        crate::test_complete!("schedule_callback_observes_every_dispatch");
    }

    #[test]
    fn yield_remove_steps_off_until_insert() {
        init_test("yield_remove_steps_off_until_insert");
        let sched = Scheduler::new();
        let done = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&done);
        let t = sched.create_tasklet(move |cx| async move {
            cx.schedule(true).await;
            flag.store(true, Ordering::SeqCst);
        });

        sched.schedule(None, false).unwrap();
        assert_eq!(sched.run(), 0, "removed tasklet must not be rescheduled");
        assert!(!done.load(Ordering::SeqCst));

        sched.insert(t).unwrap();
        sched.run();
        assert!(done.load(Ordering::SeqCst));

        // Terminal tasklets cannot be re-inserted.
        assert_eq!(sched.insert(t).unwrap_err(), Error::NotRunnable);
        crate::test_complete!("yield_remove_steps_off_until_insert");
    }

    #[test]
    fn schedule_remove_steps_the_dispatched_tasklet_off() {
        init_test("schedule_remove_steps_the_dispatched_tasklet_off");
        let sched = Scheduler::new();
        let polls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&polls);
        let t = sched.create_tasklet(move |cx| async move {
            loop {
                counter.fetch_add(1, Ordering::SeqCst);
                cx.schedule(false).await;
            }
        });

        sched.schedule(None, true).unwrap();
        assert_eq!(polls.load(Ordering::SeqCst), 1);
        // The yield re-enqueued the tasklet; remove stepped it back off.
        assert_eq!(sched.run(), 0);

        sched.insert(t).unwrap();
        assert_eq!(sched.run_steps(2), 2);
        assert_eq!(polls.load(Ordering::SeqCst), 3);

        sched.kill(t).unwrap();
        assert_eq!(sched.run(), 0);
        crate::test_complete!("schedule_remove_steps_the_dispatched_tasklet_off");
    }

    #[test]
    fn unblock_all_channels_interrupts_waiters() {
        init_test("unblock_all_channels_interrupts_waiters");
        let sched = Scheduler::new();
        let ch = sched.create_channel();

        let caught: Arc<StdMutex<Option<Error>>> = Arc::new(StdMutex::new(None));
        let slot = Arc::clone(&caught);
        sched.create_tasklet(move |cx| async move {
            let err = cx.receive(ch).await.expect_err("receive is interrupted");
            *slot.lock().unwrap() = Some(err);
        });
        sched.schedule(None, false).unwrap();
        assert_eq!(sched.active_channel_count(), 1);

        assert_eq!(sched.unblock_all_channels(), 1);
        assert_eq!(sched.active_channel_count(), 0);
        sched.run();

        assert_eq!(
            caught.lock().unwrap().take(),
            Some(Error::Failed(Failure::Interrupted))
        );
        crate::test_complete!("unblock_all_channels_interrupts_waiters");
    }

    #[test]
    fn dynamic_bind_rejects_non_callables() {
        init_test("dynamic_bind_rejects_non_callables");
        let sched = Scheduler::new();
        let ran = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&ran);
        let body = Value::new(TaskletBody::new(move |_cx| {
            let flag = Arc::clone(&flag);
            async move {
                flag.store(true, Ordering::SeqCst);
            }
        }));
        assert!(body.is_callable());

        let t = sched.create_tasklet_value(&body).expect("bindable");
        assert!(sched.is_tasklet(t));
        sched.run();
        assert!(ran.load(Ordering::SeqCst));

        let err = sched.create_tasklet_value(&Value::new(5_i32)).unwrap_err();
        assert_eq!(err, Error::InvalidCallable);
        crate::test_complete!("dynamic_bind_rejects_non_callables");
    }

    #[test]
    fn capability_checks_reject_stale_ids() {
        init_test("capability_checks_reject_stale_ids");
        let sched = Scheduler::new();
        let bogus_channel = ChannelId::new_for_test(99, 0);
        let bogus_tasklet = TaskletId::new_for_test(99, 0);

        assert!(!sched.is_channel(bogus_channel));
        assert!(!sched.is_tasklet(bogus_tasklet));
        assert_eq!(
            sched.send(bogus_channel, Value::new(0_u8)).unwrap_err(),
            Error::NotAChannel
        );
        assert_eq!(sched.receive(bogus_channel).unwrap_err(), Error::NotAChannel);
        assert_eq!(sched.kill(bogus_tasklet).unwrap_err(), Error::NotATasklet);
        crate::test_complete!("capability_checks_reject_stale_ids");
    }

    #[test]
    fn wake_preference_orders_the_woken_party() {
        init_test("wake_preference_orders_the_woken_party");
        for (preference, expected) in [
            (WakePreference::Immediate, vec!["receiver", "bystander"]),
            (WakePreference::Queued, vec!["bystander", "receiver"]),
        ] {
            let sched = Scheduler::new();
            let ch = sched.create_channel_with(preference);
            let order: Arc<StdMutex<Vec<&'static str>>> = Arc::new(StdMutex::new(Vec::new()));

            let slot = Arc::clone(&order);
            sched.create_tasklet(move |cx| async move {
                let _ = cx.receive(ch).await;
                slot.lock().unwrap().push("receiver");
            });
            sched.schedule(None, false).unwrap();

            let slot = Arc::clone(&order);
            sched.create_tasklet(move |_cx| async move {
                slot.lock().unwrap().push("bystander");
            });

            sched.send(ch, Value::new(0_u8)).unwrap();
            sched.run();
            assert_eq!(*order.lock().unwrap(), expected, "preference {preference:?}");
        }
        crate::test_complete!("wake_preference_orders_the_woken_party");
    }

    #[test]
    fn balance_invariant_holds_across_operations() {
        init_test("balance_invariant_holds_across_operations");
        let sched = Scheduler::new();
        let ch = sched.create_channel();

        for i in 0..3 {
            sched.create_tasklet(move |cx| async move {
                cx.send(ch, Value::new(i)).await.expect("send");
            });
        }
        sched.schedule(None, false).unwrap();
        assert_eq!(sched.snapshot().channel_balances, vec![(ch, 1)]);
        sched.schedule(None, false).unwrap();
        sched.schedule(None, false).unwrap();
        assert_eq!(sched.snapshot().channel_balances, vec![(ch, 3)]);

        sched.receive(ch).unwrap();
        assert_eq!(sched.snapshot().channel_balances, vec![(ch, 2)]);
        sched.receive(ch).unwrap();
        sched.receive(ch).unwrap();
        assert_eq!(sched.snapshot().channel_balances, vec![(ch, 0)]);
        crate::test_complete!("balance_invariant_holds_across_operations");
    }

    #[test]
    fn schedule_targets_a_specific_tasklet() {
        init_test("schedule_targets_a_specific_tasklet");
        let sched = Scheduler::new();
        let order: Arc<StdMutex<Vec<u32>>> = Arc::new(StdMutex::new(Vec::new()));

        let ids: Vec<TaskletId> = (0..3)
            .map(|i| {
                let order = Arc::clone(&order);
                sched.create_tasklet(move |_cx| async move {
                    order.lock().unwrap().push(i);
                })
            })
            .collect();

        // Jump the queue: run the last-created tasklet first.
        let ran = sched.schedule(Some(ids[2]), false).unwrap();
        assert_eq!(ran, Some(ids[2]));
        sched.run();
        assert_eq!(*order.lock().unwrap(), vec![2, 0, 1]);

        assert_eq!(
            sched.schedule(Some(ids[2]), false).unwrap_err(),
            Error::NotRunnable
        );
        crate::test_complete!("schedule_targets_a_specific_tasklet");
    }

    #[test]
    fn current_falls_back_to_main() {
        init_test("current_falls_back_to_main");
        let sched = Scheduler::new();
        assert_eq!(sched.current(), sched.main_tasklet());
        assert_eq!(sched.runcount(), 1);

        let observed: Arc<StdMutex<Option<TaskletId>>> = Arc::new(StdMutex::new(None));
        let slot = Arc::clone(&observed);
        let handle = sched.clone();
        let t = sched.create_tasklet(move |cx| async move {
            *slot.lock().unwrap() = Some(handle.current());
            let _ = cx;
        });
        assert_eq!(sched.runcount(), 2);

        sched.run();
        assert_eq!(observed.lock().unwrap().take(), Some(t));
        assert_eq!(sched.runcount(), 1);
        crate::test_complete!("current_falls_back_to_main");
    }

    #[test]
    fn reentrant_driver_operations_are_rejected() {
        init_test("reentrant_driver_operations_are_rejected");
        let sched = Scheduler::new();
        let ch = sched.create_channel();

        let inner: Arc<StdMutex<Option<Error>>> = Arc::new(StdMutex::new(None));
        let slot = Arc::clone(&inner);
        let handle = sched.clone();
        sched.create_tasklet(move |cx| async move {
            // The driver is parked in `send` while this runs; a nested
            // driver operation must be refused, not corrupt its park.
            *slot.lock().unwrap() = Some(handle.receive(ch).unwrap_err());
            let _ = cx.receive(ch).await;
        });

        sched.send(ch, Value::new(1_u8)).expect("send completes");
        assert_eq!(inner.lock().unwrap().take(), Some(Error::Reentrant));
        crate::test_complete!("reentrant_driver_operations_are_rejected");
    }

    #[test]
    fn shutdown_clears_the_instance() {
        init_test("shutdown_clears_the_instance");
        let sched = Scheduler::new();
        let ch = sched.create_channel();
        let t = sched.create_tasklet(move |cx| async move {
            let _ = cx.receive(ch).await;
        });
        sched.schedule(None, false).unwrap();

        sched.shutdown();
        assert!(!sched.is_tasklet(t));
        assert!(!sched.is_channel(ch));
        let snap = sched.snapshot();
        assert_eq!(snap.queued, 0);
        assert!(snap.channel_balances.is_empty());

        // The instance keeps working after teardown.
        let ch2 = sched.create_channel();
        assert!(sched.is_channel(ch2));
        crate::test_complete!("shutdown_clears_the_instance");
    }

    #[test]
    fn process_scheduler_is_a_singleton() {
        init_test("process_scheduler_is_a_singleton");
        let a = get_scheduler();
        let b = get_scheduler();
        assert!(a.same_instance(&b));

        let ch = a.create_channel();
        assert!(b.is_channel(ch));
        crate::test_complete!("process_scheduler_is_a_singleton");
    }
}
