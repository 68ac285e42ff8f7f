//! The central scheduling loop.
//!
//! The [`Orchestrator`] owns every live connection as a task: a channel plus
//! the bookkeeping needed to decide *when* it may run. One main thread does
//! all scheduling: it sleeps on a wait event until the earliest deadline
//! anything in the system cares about, collects closed tasks, snapshots the
//! ready ones, and posts each to the worker pool. Workers advance channels;
//! the poller reports readiness from its own thread; neither ever blocks on
//! the other.
//!
//! # Threads
//!
//! - **main**: sole mutator of the task vector and the fast-lookup map
//!   (aside from [`Orchestrator::add`], which takes the same lock). Never
//!   performs I/O.
//! - **poller**: invokes [`Orchestrator::on_event`]; only performs the two
//!   wait→work stage transitions, under the channel's exchange lock.
//! - **workers**: run [`Task::activate`]; block only on the exchange lock,
//!   and only briefly.
//!
//! Lock order is strictly *orchestrator state → channel exchange*; the
//! exchange lock is never held across an acquisition of the state lock.

mod task;

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, trace, warn};

use crate::channel::{panic_message, Channel, ChannelFactory, Stage};
use crate::error::{OrchestratorError, PollerError};
use crate::poller::{EventCallback, EventSet, Poller};
use crate::pool::ActivationPool;
use crate::signal::Signal;
use crate::stream::{ByteStream, StreamId};
use crate::sync::WaitEvent;
use crate::throttle::Throttler;

pub(crate) use task::Task;

/// Default maximum idle time while waiting on the client.
const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

/// Cap applied when deadline arithmetic would overflow.
const DISTANT_FUTURE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Default)]
struct SchedulerState {
    tasks: Vec<Arc<Task>>,
    fast_lookup: HashMap<StreamId, Weak<Task>>,
}

/// Point-in-time counters for introspection and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorStats {
    /// Tasks currently owned by the scheduler (closed-but-uncollected
    /// included).
    pub live_tasks: usize,
    /// Streams resolvable through the fast-lookup map.
    pub tracked_streams: usize,
}

/// Outcome of one orchestrator run, fulfilled at full stop.
#[derive(Default)]
struct RunOutcome {
    result: Mutex<Option<Result<(), OrchestratorError>>>,
    cond: Condvar,
}

impl RunOutcome {
    fn fulfil(&self, result: Result<(), OrchestratorError>) {
        let mut slot = self.result.lock();
        if slot.is_none() {
            *slot = Some(result);
        }
        drop(slot);
        self.cond.notify_all();
    }

    fn wait(&self) -> Result<(), OrchestratorError> {
        let mut slot = self.result.lock();
        while slot.is_none() {
            self.cond.wait(&mut slot);
        }
        slot.take().expect("outcome checked above")
    }

    fn is_fulfilled(&self) -> bool {
        self.result.lock().is_some()
    }
}

/// Handle returned by [`Orchestrator::start`]; completes when the run has
/// fully stopped, with the error when the main loop died abnormally.
pub struct StartHandle {
    outcome: Arc<RunOutcome>,
}

impl StartHandle {
    /// Blocks until the orchestrator has fully stopped and returns how the
    /// run ended.
    pub fn wait(self) -> Result<(), OrchestratorError> {
        self.outcome.wait()
    }

    /// Whether the run has already ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.outcome.is_fulfilled()
    }
}

/// The scheduling core of a non-blocking server.
///
/// See the [module docs](self) for the threading model. Construct with
/// [`Orchestrator::builder`].
pub struct Orchestrator {
    /// Self-reference for thread and callback closures; always upgradable
    /// while the caller holds the orchestrator.
    weak_self: Weak<Orchestrator>,
    factory: Arc<dyn ChannelFactory>,
    poller: Arc<dyn Poller>,
    pool: ActivationPool,
    master_read: Arc<Throttler>,
    master_write: Arc<Throttler>,
    new_event: WaitEvent,
    stop: AtomicBool,
    inactivity_timeout_nanos: AtomicU64,
    state: Mutex<SchedulerState>,
    main_thread: Mutex<Option<JoinHandle<()>>>,
    outcome: Mutex<Option<Arc<RunOutcome>>>,
    on_stop: Signal,
}

impl Orchestrator {
    /// Starts building an orchestrator around a channel factory.
    #[must_use]
    pub fn builder(factory: Arc<dyn ChannelFactory>) -> OrchestratorBuilder {
        OrchestratorBuilder::new(factory)
    }

    /// Spawns the main scheduling thread and starts the poller.
    ///
    /// The returned handle completes when the orchestrator has fully
    /// stopped — normally after [`Orchestrator::stop`], or with an error if
    /// the main thread died.
    pub fn start(&self) -> Result<StartHandle, OrchestratorError> {
        if self
            .stop
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(OrchestratorError::AlreadyRunning);
        }

        self.on_stop.rearm();
        self.new_event.reset();
        self.pool.start();

        let outcome = Arc::new(RunOutcome::default());
        *self.outcome.lock() = Some(Arc::clone(&outcome));

        let weak = Weak::clone(&self.weak_self);
        let callback: EventCallback = Arc::new(move |id, events| {
            if let Some(orchestrator) = weak.upgrade() {
                orchestrator.on_event(id, events);
            }
        });
        if let Err(e) = self.poller.start(callback) {
            self.stop.store(true, Ordering::SeqCst);
            self.pool.stop();
            *self.outcome.lock() = None;
            return Err(e.into());
        }

        // If the poller dies on its own, the orchestrator must wind down
        // with it. Subscribed after `Poller::start` because starting
        // re-arms the poller's stop signal.
        let weak = Weak::clone(&self.weak_self);
        self.poller.subscribe_stop(Box::new(move || {
            if let Some(orchestrator) = weak.upgrade() {
                orchestrator.stop.store(true, Ordering::SeqCst);
                orchestrator.new_event.signal();
            }
        }));

        let me = self
            .weak_self
            .upgrade()
            .expect("start called on a live orchestrator");
        let handle = thread::Builder::new()
            .name("switchyard-main".into())
            .spawn(move || {
                let result = catch_unwind(AssertUnwindSafe(|| {
                    while !me.stop.load(Ordering::SeqCst) {
                        me.iterate_once();
                    }
                }));
                match result {
                    Ok(()) => me.internal_stop(None),
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        me.internal_stop(Some(OrchestratorError::MainLoopPanicked { message }));
                    }
                }
            })
            .expect("failed to spawn orchestrator main thread");
        *self.main_thread.lock() = Some(handle);

        info!("orchestrator started");
        Ok(StartHandle { outcome })
    }

    /// Requests a stop and joins the main thread. Idempotent, safe from any
    /// thread — including on-stop subscribers, for whom the join is
    /// skipped.
    pub fn stop(&self) {
        {
            let _state = self.state.lock();
            self.stop.store(true, Ordering::SeqCst);
        }
        self.new_event.signal();

        let handle = self.main_thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                // Called from the main thread itself (an on-stop hook); it
                // is already on its way out.
                return;
            }
            let _ = handle.join();
        }
    }

    /// Registers a connection: builds its handler and channel, tracks the
    /// task, and arms the poller for readability. Thread-safe.
    ///
    /// On a poller registration failure the channel is closed and collected
    /// on the next iteration; the error is also returned.
    pub fn add(&self, stream: Arc<dyn ByteStream>) -> Result<(), PollerError> {
        let handler = self.factory.create_handler(stream.as_ref());
        let channel = Arc::new(Channel::new(
            Arc::clone(&stream),
            handler,
            Arc::clone(&self.master_read),
            Arc::clone(&self.master_write),
        ));
        self.factory.configure_channel(&channel);
        let channel_id = channel.id();
        debug!(channel = channel_id, stream = %stream.id(), "adding channel");

        let task = Arc::new(Task::new(channel));
        {
            let mut state = self.state.lock();
            state.fast_lookup.insert(stream.id(), Arc::downgrade(&task));
            state.tasks.push(Arc::clone(&task));
        }

        let result = self
            .poller
            .watch(stream.as_ref(), EventSet::READABLE | EventSet::COMPLETION);
        if let Err(e) = &result {
            warn!(channel = channel_id, error = %e, "failed to arm poller for new channel; closing");
            task.channel().close();
        }

        // Wake the main thread so its eviction deadline accounts for the
        // new task right away.
        self.new_event.signal();
        result
    }

    /// Replaces the master read throttler shared by all live and future
    /// channels.
    pub fn throttle_read(&self, throttler: Throttler) {
        self.master_read.replace(throttler);
        self.new_event.signal();
    }

    /// Replaces the master write throttler shared by all live and future
    /// channels.
    pub fn throttle_write(&self, throttler: Throttler) {
        self.master_write.replace(throttler);
        self.new_event.signal();
    }

    /// Sets the maximum idle time while waiting on the client before a
    /// channel is forcibly closed.
    pub fn set_inactivity_timeout(&self, timeout: Duration) {
        let nanos = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        self.inactivity_timeout_nanos
            .store(nanos, Ordering::Release);
        self.new_event.signal();
    }

    /// The current inactivity timeout.
    #[must_use]
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_nanos(self.inactivity_timeout_nanos.load(Ordering::Acquire))
    }

    /// Registers a hook to run when the orchestrator has fully stopped.
    /// Fires exactly once per run.
    pub fn on_stop<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_stop.subscribe(Box::new(hook));
    }

    /// Current task and lookup counters.
    #[must_use]
    pub fn stats(&self) -> OrchestratorStats {
        let state = self.state.lock();
        OrchestratorStats {
            live_tasks: state.tasks.len(),
            tracked_streams: state.fast_lookup.len(),
        }
    }

    pub(crate) fn poller(&self) -> &dyn Poller {
        self.poller.as_ref()
    }

    /// Wakes the main thread to re-evaluate its schedule.
    pub(crate) fn wake_up(&self) {
        self.new_event.signal();
    }

    /// One main-loop iteration: wait for something to do, then dispatch
    /// every ready task to the pool.
    fn iterate_once(&self) {
        for task in self.capture_tasks() {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            let Some(orchestrator) = self.weak_self.upgrade() else {
                return;
            };
            // Claim on the main thread so the next capture already filters
            // this task out, even before a worker picks the job up.
            task.mark_in_process(true);
            self.pool.post(move || {
                task.activate(&orchestrator);
            });
        }
    }

    /// Waits until the next deadline or signal, collects garbage, and
    /// snapshots the ready tasks. The snapshot releases the state lock so
    /// `add` and the poller callback are never blocked behind dispatch.
    fn capture_tasks(&self) -> Vec<Arc<Task>> {
        let mut state = self.state.lock();
        loop {
            let wakeup = self.latest_allowed_wakeup(&state);
            if wakeup <= Instant::now() {
                break;
            }
            drop(state);
            trace!("waiting for work");
            self.new_event.wait_until_and_reset(wakeup);
            state = self.state.lock();
            if self.stop.load(Ordering::SeqCst) || self.at_least_one_task_ready(&state) {
                break;
            }
        }

        Self::collect_garbage(&mut state);

        state
            .tasks
            .iter()
            .filter(|task| self.is_task_ready(task))
            .cloned()
            .collect()
    }

    /// The latest instant the main thread may sleep until: bounded by the
    /// inactivity horizon, every channel's requested throttling wakeup, and
    /// the idle deadline of every task currently waiting on its client.
    fn latest_allowed_wakeup(&self, state: &SchedulerState) -> Instant {
        let now = Instant::now();
        let inactivity = self.inactivity_timeout();
        let mut wakeup = now
            .checked_add(inactivity)
            .unwrap_or_else(|| now + DISTANT_FUTURE);

        for task in &state.tasks {
            let requested = task.channel().requested_timeout();
            if requested >= now && requested < wakeup {
                // The channel asked to be revisited sooner (throttler
                // refill); honor it.
                wakeup = requested;
            }
            if !task.is_in_process() && task.channel().is_waiting_for_client() {
                let idle = task.idle_deadline(inactivity).max(now);
                if idle < wakeup {
                    wakeup = idle;
                }
            }
        }
        wakeup
    }

    fn is_task_ready(&self, task: &Task) -> bool {
        // A claimed task is some worker's problem until it reports back.
        if task.is_in_process() {
            return false;
        }
        // A task past its inactivity deadline must close itself, by itself;
        // otherwise, readiness is the channel's call.
        task.reached_inactivity_timeout(self.inactivity_timeout()) || task.channel().is_ready()
    }

    fn at_least_one_task_ready(&self, state: &SchedulerState) -> bool {
        state.tasks.iter().any(|task| self.is_task_ready(task))
    }

    /// Drops every task whose channel has closed, forgetting its stream.
    /// Tentative stage reads suffice: `Closed` is sticky.
    fn collect_garbage(state: &mut SchedulerState) {
        let SchedulerState { tasks, fast_lookup } = state;
        tasks.retain(|task| {
            if task.channel().tentative_stage() == Stage::Closed {
                trace!(channel = task.channel().id(), "collecting closed channel");
                fast_lookup.remove(&task.channel().stream().id());
                false
            } else {
                true
            }
        });
    }

    /// Poller callback: translate readiness into a stage transition and
    /// wake the main thread. Runs on the poller's thread.
    fn on_event(&self, id: StreamId, events: EventSet) {
        let task = {
            let state = self.state.lock();
            // Upgraded under the lock: the garbage collector cannot drop
            // the last reference between lookup and use.
            match state.fast_lookup.get(&id).and_then(Weak::upgrade) {
                Some(task) => task,
                None => {
                    trace!(stream = %id, "event for unknown stream (raced with close)");
                    return;
                }
            }
        };

        let channel = task.channel();
        if events.contains(EventSet::COMPLETION) {
            // No use talking to a wall; whatever else the mask says, nobody
            // is listening to replies anymore.
            trace!(channel = channel.id(), "received completion event");
            channel.close();
        } else {
            let exchange = channel.lock_exchange();
            match channel.definite_stage(&exchange) {
                Stage::WaitReadable => {
                    if events.contains(EventSet::READABLE) {
                        trace!(channel = channel.id(), "became readable");
                        channel.set_stage(Stage::Read);
                    } else {
                        error!(
                            channel = channel.id(),
                            events = %events,
                            "channel was waiting for readability but got a different event; check poll logic"
                        );
                    }
                }
                Stage::WaitWritable => {
                    if events.contains(EventSet::WRITABLE) {
                        trace!(channel = channel.id(), "became writable");
                        channel.set_stage(Stage::Write);
                    } else {
                        error!(
                            channel = channel.id(),
                            events = %events,
                            "channel was waiting for writability but got a different event; check poll logic"
                        );
                    }
                }
                Stage::Closed => {
                    // The inactivity reaper may have won the race between
                    // event dispatch and processing.
                    trace!(channel = channel.id(), "ignoring event on closed channel");
                }
                stage => {
                    error!(
                        channel = channel.id(),
                        ?stage,
                        events = %events,
                        "channel received an event outside a waiting stage; check poll logic"
                    );
                    channel.close();
                }
            }
            drop(exchange);
        }

        self.wake_up();
    }

    /// Tears the run down from the main thread: stop collaborators, close
    /// and drop what is left, fire hooks, fulfil the outcome.
    fn internal_stop(&self, error: Option<OrchestratorError>) {
        if let Some(e) = &error {
            error!(error = %e, "orchestrator stopped due to error");
            self.stop.store(true, Ordering::SeqCst);
        }

        self.poller.stop();
        self.pool.stop();

        // No callbacks or activations can run past this point.
        let drained: Vec<Arc<Task>> = {
            let mut state = self.state.lock();
            state.fast_lookup.clear();
            state.tasks.drain(..).collect()
        };
        for task in &drained {
            task.channel().close();
        }
        drop(drained);

        self.on_stop.fire();

        let outcome = self.outcome.lock().take();
        if let Some(outcome) = outcome {
            outcome.fulfil(error.map_or(Ok(()), Err));
        }
        info!("orchestrator stopped");
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Configuration for an [`Orchestrator`].
///
/// All options have defaults; only the factory is mandatory.
pub struct OrchestratorBuilder {
    factory: Arc<dyn ChannelFactory>,
    threads: usize,
    inactivity_timeout: Duration,
    read_throttler: Throttler,
    write_throttler: Throttler,
    poller: Option<Arc<dyn Poller>>,
}

impl OrchestratorBuilder {
    fn new(factory: Arc<dyn ChannelFactory>) -> Self {
        Self {
            factory,
            threads: 1,
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            read_throttler: Throttler::unlimited(),
            write_throttler: Throttler::unlimited(),
            poller: None,
        }
    }

    /// Size of the activation worker pool. Default 1.
    #[must_use]
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Maximum idle time while waiting on the client. Default 10 seconds.
    #[must_use]
    pub fn inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    /// Global read-rate ceiling. Default: unthrottled.
    #[must_use]
    pub fn read_throttler(mut self, throttler: Throttler) -> Self {
        self.read_throttler = throttler;
        self
    }

    /// Global write-rate ceiling. Default: unthrottled.
    #[must_use]
    pub fn write_throttler(mut self, throttler: Throttler) -> Self {
        self.write_throttler = throttler;
        self
    }

    /// Readiness poller to schedule against. Default: the OS-backed poller.
    #[must_use]
    pub fn poller(mut self, poller: Arc<dyn Poller>) -> Self {
        self.poller = Some(poller);
        self
    }

    /// Builds the orchestrator. It is created stopped; call
    /// [`Orchestrator::start`] to run it.
    pub fn build(self) -> Result<Arc<Orchestrator>, OrchestratorError> {
        let poller = match self.poller {
            Some(poller) => poller,
            None => default_poller()?,
        };
        let inactivity_nanos =
            u64::try_from(self.inactivity_timeout.as_nanos()).unwrap_or(u64::MAX);
        Ok(Arc::new_cyclic(|weak_self| Orchestrator {
            weak_self: Weak::clone(weak_self),
            factory: self.factory,
            poller,
            pool: ActivationPool::new(self.threads),
            master_read: Arc::new(self.read_throttler),
            master_write: Arc::new(self.write_throttler),
            new_event: WaitEvent::new(),
            stop: AtomicBool::new(true),
            inactivity_timeout_nanos: AtomicU64::new(inactivity_nanos),
            state: Mutex::new(SchedulerState::default()),
            main_thread: Mutex::new(None),
            outcome: Mutex::new(None),
            on_stop: Signal::new(),
        }))
    }
}

#[cfg(unix)]
fn default_poller() -> Result<Arc<dyn Poller>, OrchestratorError> {
    let poller: Arc<dyn Poller> = crate::poller::SysPoller::new();
    Ok(poller)
}

#[cfg(not(unix))]
fn default_poller() -> Result<Arc<dyn Poller>, OrchestratorError> {
    Err(OrchestratorError::Poller(PollerError::NotRunning))
}
