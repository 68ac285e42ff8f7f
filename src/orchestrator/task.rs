//! Per-channel scheduling record.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, trace, warn};

use crate::channel::{Channel, Stage};
use crate::poller::EventSet;

use super::Orchestrator;

/// Scheduling metadata wrapping one [`Channel`].
///
/// The channel's exchange lock serializes activation; the task only adds
/// the bookkeeping the orchestrator filters on: when the channel was last
/// activated, and whether a worker currently owns it.
pub(crate) struct Task {
    channel: Arc<Channel>,
    last_active: Mutex<Instant>,
    in_process: AtomicBool,
}

impl Task {
    pub(crate) fn new(channel: Arc<Channel>) -> Self {
        Self {
            channel,
            last_active: Mutex::new(Instant::now()),
            in_process: AtomicBool::new(false),
        }
    }

    pub(crate) fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Claims or releases the task for a worker. Claimed eagerly on the
    /// main thread before dispatch so the next capture filters the task out
    /// without waiting for the worker to actually start.
    pub(crate) fn mark_in_process(&self, claimed: bool) {
        self.in_process.store(claimed, Ordering::Release);
    }

    pub(crate) fn is_in_process(&self) -> bool {
        self.in_process.load(Ordering::Acquire)
    }

    /// True iff the channel is waiting on the *client* and has been doing
    /// so longer than `timeout`. Inactivity while the server merely hasn't
    /// scheduled the channel yet is never the client's fault.
    pub(crate) fn reached_inactivity_timeout(&self, timeout: Duration) -> bool {
        if !self.channel.is_waiting_for_client() {
            return false;
        }
        self.last_active.lock().elapsed() >= timeout
    }

    /// The absolute instant at which this task becomes eviction-eligible,
    /// assuming it keeps waiting on the client.
    pub(crate) fn idle_deadline(&self, timeout: Duration) -> Instant {
        let last_active = *self.last_active.lock();
        last_active
            .checked_add(timeout)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(365 * 24 * 60 * 60))
    }

    /// One activation cycle, executed on a worker thread.
    pub(crate) fn activate(&self, orchestrator: &Orchestrator) {
        trace!(channel = self.channel.id(), "activating");

        if self.reached_inactivity_timeout(orchestrator.inactivity_timeout()) {
            info!(
                channel = self.channel.id(),
                "channel reached inactivity timeout"
            );
            // It may still be armed in the poller; removal tolerates it
            // not being there.
            orchestrator.poller().unwatch(self.channel.stream().as_ref());
            self.channel.close();
            self.mark_in_process(false);
            orchestrator.wake_up();
            return;
        }

        let mut exchange = self.channel.lock_exchange();
        self.channel.advance(&mut exchange);
        *self.last_active.lock() = Instant::now();

        // When the channel parks on the poller there is nothing for the
        // main thread to do until the kernel reports; every other outcome
        // (ready again, throttling deadline, closed) needs the main loop to
        // re-evaluate its schedule.
        let mut notify = false;
        match self.channel.definite_stage(&exchange) {
            Stage::WaitReadable => {
                if let Err(e) = orchestrator.poller().watch(
                    self.channel.stream().as_ref(),
                    EventSet::READABLE | EventSet::COMPLETION,
                ) {
                    warn!(channel = self.channel.id(), error = %e, "failed to arm poller; closing");
                    self.channel.close();
                    notify = true;
                }
            }
            Stage::WaitWritable => {
                if let Err(e) = orchestrator.poller().watch(
                    self.channel.stream().as_ref(),
                    EventSet::WRITABLE | EventSet::COMPLETION,
                ) {
                    warn!(channel = self.channel.id(), error = %e, "failed to arm poller; closing");
                    self.channel.close();
                    notify = true;
                }
            }
            _ => notify = true,
        }

        // Released while the exchange lock is still held: a poller event
        // blocked on that lock must observe the claim already cleared once
        // it gets to transition the stage.
        self.mark_in_process(false);
        drop(exchange);

        if notify {
            orchestrator.wake_up();
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("channel", &self.channel.id())
            .field("in_process", &self.is_in_process())
            .finish()
    }
}
