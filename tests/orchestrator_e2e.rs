//! End-to-end scheduling scenarios over the lab poller.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::*;
use switchyard::poller::EventSet;
use switchyard::stream::LabStream;
use switchyard::ByteStream;

#[test]
fn idle_channel_is_closed_within_the_inactivity_window() {
    let (orchestrator, _poller, handle) = start_lab(
        Arc::new(EchoFactory { keep_alive: true }),
        1,
        Duration::from_millis(100),
    );

    let stream = LabStream::new();
    let added_at = Instant::now();
    orchestrator.add(stream).expect("add");
    assert_eq!(orchestrator.stats().live_tasks, 1);

    assert!(
        wait_until(Duration::from_secs(2), || {
            orchestrator.stats().live_tasks == 0
        }),
        "idle channel was never evicted"
    );
    let elapsed = added_at.elapsed();
    assert!(
        elapsed >= Duration::from_millis(90),
        "evicted too early: {elapsed:?}"
    );
    assert!(
        elapsed <= Duration::from_millis(400),
        "evicted too late: {elapsed:?}"
    );
    assert_eq!(orchestrator.stats().tracked_streams, 0);

    orchestrator.stop();
    handle.wait().expect("clean shutdown");
}

#[test]
fn simultaneously_readable_channels_advance_in_parallel() {
    let factory = Arc::new(BarrierFactory::new(2));
    let (orchestrator, poller, handle) =
        start_lab(Arc::clone(&factory) as Arc<dyn switchyard::ChannelFactory>, 2, Duration::from_secs(10));

    let first = LabStream::new();
    let second = LabStream::new();
    for stream in [&first, &second] {
        stream.push_incoming(b"go\n");
        orchestrator.add(Arc::clone(stream) as Arc<dyn ByteStream>).expect("add");
    }
    poller.inject(first.id(), EventSet::READABLE);
    poller.inject(second.id(), EventSet::READABLE);

    // Both handlers rendezvous inside `process`: the responses can only
    // get prepared if the two activations ran concurrently.
    assert!(
        wait_until(Duration::from_secs(2), || {
            poller.is_armed(first.id()) && poller.is_armed(second.id())
        }),
        "activations never passed the rendezvous"
    );

    // Flush both responses and let the exchanges finish.
    poller.inject(first.id(), EventSet::WRITABLE);
    poller.inject(second.id(), EventSet::WRITABLE);
    assert!(
        wait_until(Duration::from_secs(2), || {
            orchestrator.stats().live_tasks == 0
        }),
        "parallel activations never completed"
    );
    assert_eq!(first.output(), b"ok\n");
    assert_eq!(second.output(), b"ok\n");

    orchestrator.stop();
    handle.wait().expect("clean shutdown");
}

#[test]
fn completion_during_process_closes_without_writing() {
    let factory = Arc::new(GateFactory::new());
    let started = Arc::clone(&factory.started);
    let release = Arc::clone(&factory.release);
    let (orchestrator, poller, handle) =
        start_lab(Arc::clone(&factory) as Arc<dyn switchyard::ChannelFactory>, 1, Duration::from_secs(10));

    let stream = LabStream::new();
    stream.push_incoming(b"x\n");
    orchestrator.add(Arc::clone(&stream) as Arc<dyn ByteStream>).expect("add");
    poller.inject(stream.id(), EventSet::READABLE);

    assert!(
        wait_until(Duration::from_secs(2), || started.load(Ordering::SeqCst) == 1),
        "handler never entered process"
    );

    // The peer goes away while the handler is busy. The completion is
    // pending and lands the moment the channel re-arms for writing.
    poller.inject(stream.id(), EventSet::COMPLETION);
    release.signal();

    assert!(
        wait_until(Duration::from_secs(2), || {
            orchestrator.stats().live_tasks == 0
        }),
        "completed channel was never collected"
    );
    assert!(
        stream.output().is_empty(),
        "channel wrote a response to a hung-up peer"
    );

    orchestrator.stop();
    handle.wait().expect("clean shutdown");
}

#[test]
fn stop_waits_for_in_flight_activations_and_fires_on_stop_once() {
    let factory = Arc::new(GateFactory::new());
    let started = Arc::clone(&factory.started);
    let release = Arc::clone(&factory.release);
    let (orchestrator, poller, handle) =
        start_lab(Arc::clone(&factory) as Arc<dyn switchyard::ChannelFactory>, 1, Duration::from_secs(10));

    let on_stop_count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&on_stop_count);
    orchestrator.on_stop(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let stream = LabStream::new();
    stream.push_incoming(b"x\n");
    orchestrator.add(Arc::clone(&stream) as Arc<dyn ByteStream>).expect("add");
    poller.inject(stream.id(), EventSet::READABLE);
    assert!(
        wait_until(Duration::from_secs(2), || started.load(Ordering::SeqCst) == 1),
        "handler never entered process"
    );

    // Stop while the worker is blocked inside the handler.
    let stopper = {
        let orchestrator = Arc::clone(&orchestrator);
        thread::spawn(move || orchestrator.stop())
    };

    thread::sleep(Duration::from_millis(100));
    assert!(
        !handle.is_finished(),
        "run finished while an activation was still in flight"
    );

    // A channel becoming readable during shutdown must not start a new
    // activation.
    let late = LabStream::new();
    late.push_incoming(b"y\n");
    let _ = orchestrator.add(Arc::clone(&late) as Arc<dyn ByteStream>);
    poller.inject(late.id(), EventSet::READABLE);

    release.signal();
    stopper.join().expect("stop thread panicked");

    handle.wait().expect("clean shutdown");
    assert_eq!(on_stop_count.load(Ordering::SeqCst), 1);
    assert_eq!(
        started.load(Ordering::SeqCst),
        1,
        "an activation started after stop"
    );
    assert!(late.output().is_empty());
}

#[test]
fn garbage_collection_forgets_exactly_the_evicted_half() {
    let (orchestrator, poller, handle) = start_lab(
        Arc::new(EchoFactory { keep_alive: true }),
        2,
        Duration::from_millis(500),
    );

    let streams: Vec<_> = (0..100).map(|_| LabStream::new()).collect();
    for stream in &streams {
        orchestrator.add(Arc::clone(stream) as Arc<dyn ByteStream>).expect("add");
    }
    assert_eq!(orchestrator.stats().live_tasks, 100);

    // Refresh half of the population with a partial request: the channel
    // reads it, finds no newline, and goes back to waiting — last activity
    // renewed, no response involved.
    thread::sleep(Duration::from_millis(250));
    for stream in &streams[..50] {
        stream.push_incoming(b".");
        poller.inject(stream.id(), EventSet::READABLE);
    }

    // The untouched half hits the 500ms inactivity deadline first; the
    // refreshed half is not due for another quarter second after that.
    assert!(
        wait_until(Duration::from_secs(3), || {
            orchestrator.stats().live_tasks <= 50
        }),
        "idle half was never evicted"
    );
    let stats = orchestrator.stats();
    assert_eq!(stats.live_tasks, 50, "refreshed half evicted too");
    assert_eq!(stats.tracked_streams, 50);

    orchestrator.stop();
    handle.wait().expect("clean shutdown");
    assert_eq!(orchestrator.stats().live_tasks, 0);
}

#[test]
fn add_followed_immediately_by_stop_closes_cleanly() {
    let (orchestrator, _poller, handle) = start_lab(
        Arc::new(EchoFactory { keep_alive: true }),
        1,
        Duration::from_secs(10),
    );

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    orchestrator.on_stop(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let stream = LabStream::new();
    orchestrator.add(stream).expect("add");
    orchestrator.stop();

    handle.wait().expect("clean shutdown");
    let stats = orchestrator.stats();
    assert_eq!(stats.live_tasks, 0);
    assert_eq!(stats.tracked_streams, 0);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn full_exchange_is_collected_and_forgotten() {
    let (orchestrator, poller, handle) = start_lab(
        Arc::new(EchoFactory { keep_alive: false }),
        1,
        Duration::from_secs(10),
    );

    let stream = LabStream::new();
    stream.push_incoming(b"bye\n");
    orchestrator.add(Arc::clone(&stream) as Arc<dyn ByteStream>).expect("add");
    poller.inject(stream.id(), EventSet::READABLE);

    // After reading and processing, the channel parks for writability.
    assert!(
        wait_until(Duration::from_secs(2), || poller.is_armed(stream.id())),
        "channel never armed for writing"
    );
    poller.inject(stream.id(), EventSet::WRITABLE);

    assert!(
        wait_until(Duration::from_secs(2), || {
            orchestrator.stats().live_tasks == 0
        }),
        "finished exchange was never collected"
    );
    assert_eq!(stream.output(), b"bye\n");
    assert_eq!(orchestrator.stats().tracked_streams, 0);

    orchestrator.stop();
    handle.wait().expect("clean shutdown");
}

#[test]
fn keep_alive_channel_serves_multiple_exchanges() {
    let (orchestrator, poller, handle) = start_lab(
        Arc::new(EchoFactory { keep_alive: true }),
        1,
        Duration::from_secs(10),
    );

    let stream = LabStream::new();
    orchestrator.add(Arc::clone(&stream) as Arc<dyn ByteStream>).expect("add");

    for round in 0..3u8 {
        let message = format!("round {round}\n");
        stream.push_incoming(message.as_bytes());
        poller.inject(stream.id(), EventSet::READABLE);

        assert!(
            wait_until(Duration::from_secs(2), || poller.is_armed(stream.id())
                && stream.pending_incoming() == 0),
            "round {round}: channel never armed for writing"
        );
        poller.inject(stream.id(), EventSet::WRITABLE);

        assert!(
            wait_until(Duration::from_secs(2), || {
                stream.output() == message.as_bytes()
            }),
            "round {round}: response never flushed"
        );
        let _ = stream.take_output();
        assert_eq!(orchestrator.stats().live_tasks, 1, "round {round}");
    }

    orchestrator.stop();
    handle.wait().expect("clean shutdown");
}

#[test]
fn eof_from_the_peer_closes_and_collects() {
    let (orchestrator, poller, handle) = start_lab(
        Arc::new(EchoFactory { keep_alive: true }),
        1,
        Duration::from_secs(10),
    );

    let stream = LabStream::new();
    orchestrator.add(Arc::clone(&stream) as Arc<dyn ByteStream>).expect("add");

    stream.set_eof();
    poller.inject(stream.id(), EventSet::READABLE);

    assert!(
        wait_until(Duration::from_secs(2), || {
            orchestrator.stats().live_tasks == 0
        }),
        "EOF channel was never collected"
    );

    orchestrator.stop();
    handle.wait().expect("clean shutdown");
}

#[test]
fn restart_after_stop_schedules_again() {
    let factory = Arc::new(EchoFactory { keep_alive: false });
    let (orchestrator, poller, handle) =
        start_lab(Arc::clone(&factory) as Arc<dyn switchyard::ChannelFactory>, 1, Duration::from_secs(10));

    orchestrator.stop();
    handle.wait().expect("first run");

    let handle = orchestrator.start().expect("restart");

    let stream = LabStream::new();
    stream.push_incoming(b"again\n");
    orchestrator.add(Arc::clone(&stream) as Arc<dyn ByteStream>).expect("add");
    poller.inject(stream.id(), EventSet::READABLE);

    assert!(
        wait_until(Duration::from_secs(2), || poller.is_armed(stream.id())),
        "channel never armed for writing after restart"
    );
    poller.inject(stream.id(), EventSet::WRITABLE);
    assert!(
        wait_until(Duration::from_secs(2), || stream.output() == b"again\n"),
        "no echo after restart"
    );

    orchestrator.stop();
    handle.wait().expect("second run");
}

#[test]
fn starting_twice_is_rejected() {
    let (orchestrator, _poller, handle) = start_lab(
        Arc::new(EchoFactory { keep_alive: true }),
        1,
        Duration::from_secs(10),
    );

    assert!(matches!(
        orchestrator.start(),
        Err(switchyard::OrchestratorError::AlreadyRunning)
    ));

    orchestrator.stop();
    handle.wait().expect("clean shutdown");
}
