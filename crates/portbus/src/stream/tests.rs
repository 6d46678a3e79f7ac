//! Unit tests for stream events, subscriptions and the pull bridge.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use rstest::{fixture, rstest};
use tokio::sync::mpsc;

use super::*;
use crate::command::Output;
use crate::error::{BusError, HandlerError};

type Seen = Arc<Mutex<Vec<String>>>;

fn describe(event: &StreamEvent<Output>) -> String {
    match event {
        StreamEvent::Next(_) => "next".to_owned(),
        StreamEvent::Complete(Some(_)) => "complete+value".to_owned(),
        StreamEvent::Complete(None) => "complete".to_owned(),
        StreamEvent::Failed(error) => format!("failed: {error}"),
    }
}

fn recording_sink(seen: &Seen) -> EventSink {
    let seen = Arc::clone(seen);
    EventSink::new(move |event| {
        seen.lock().expect("lock").push(describe(&event));
    })
}

#[fixture]
fn seen() -> Seen {
    Arc::new(Mutex::new(Vec::new()))
}

// ---------------------------------------------------------------------------
// StreamEvent
// ---------------------------------------------------------------------------

#[rstest]
#[case::value(Some(1), false, None, "next")]
#[case::final_value(Some(1), true, None, "complete")]
#[case::bare_done(None, true, None, "complete")]
#[case::error_wins(Some(1), false, Some(BusError::handler_not_found("X")), "failed")]
fn from_parts_follows_wire_triple(
    #[case] value: Option<i32>,
    #[case] done: bool,
    #[case] error: Option<BusError>,
    #[case] expected: &str,
) {
    let event = StreamEvent::from_parts(value, done, error);
    let kind = match event {
        StreamEvent::Next(_) => "next",
        StreamEvent::Complete(_) => "complete",
        StreamEvent::Failed(_) => "failed",
    };
    assert_eq!(kind, expected);
}

#[test]
fn map_preserves_terminal_value() {
    let event = StreamEvent::Complete(Some(20)).map(|v| v + 1);
    assert!(event.is_terminal());
    assert_eq!(event.into_value(), Some(21));
}

// ---------------------------------------------------------------------------
// Subscription guard
// ---------------------------------------------------------------------------

#[rstest]
fn guard_drops_events_after_terminal(seen: Seen) {
    let subscription = Subscription::new("Count");
    let emitter = Emitter::<u32>::new("Count", subscription.guard(recording_sink(&seen)));

    emitter.next(1);
    emitter.complete(None);
    emitter.next(2);
    emitter.complete(Some(3));

    assert_eq!(*seen.lock().expect("lock"), vec!["next", "complete"]);
    assert!(subscription.is_finished());
    assert!(!subscription.is_active());
}

#[rstest]
fn guard_drops_events_after_unsubscribe(seen: Seen) {
    let subscription = Subscription::new("Count");
    let emitter = Emitter::<u32>::new("Count", subscription.guard(recording_sink(&seen)));

    emitter.next(1);
    subscription.unsubscribe();
    emitter.next(2);
    emitter.fail(HandlerError::new("late"));

    assert_eq!(*seen.lock().expect("lock"), vec!["next"]);
}

#[rstest]
fn emit_with_done_completes(seen: Seen) {
    let subscription = Subscription::new("Count");
    let emitter = Emitter::<u32>::new("Count", subscription.guard(recording_sink(&seen)));

    emitter.emit(1, false);
    emitter.emit(2, true);

    assert_eq!(*seen.lock().expect("lock"), vec!["next", "complete+value"]);
}

#[rstest]
fn fail_reports_handler_error(seen: Seen) {
    let subscription = Subscription::new("Count");
    let emitter = Emitter::<u32>::new("Count", subscription.guard(recording_sink(&seen)));

    emitter.fail(HandlerError::new("boom"));

    let events = seen.lock().expect("lock");
    assert_eq!(events.len(), 1);
    let event = events.first().expect("one event");
    assert!(event.contains("boom"), "unexpected event: {event}");
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

#[test]
fn teardown_runs_once_on_unsubscribe() {
    let runs = Arc::new(AtomicUsize::new(0));
    let subscription = Subscription::new("Count");
    let counter = Arc::clone(&runs);
    subscription.attach(Teardown::immediate(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    subscription.unsubscribe();
    subscription.unsubscribe();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn teardown_attached_after_unsubscribe_runs_immediately() {
    let runs = Arc::new(AtomicUsize::new(0));
    let subscription = Subscription::new("Count");
    subscription.unsubscribe();

    let counter = Arc::clone(&runs);
    subscription.attach(Teardown::immediate(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn teardown_is_skipped_on_completion() {
    let runs = Arc::new(AtomicUsize::new(0));
    let subscription = Subscription::new("Count");
    let counter = Arc::clone(&runs);
    subscription.attach(Teardown::immediate(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    subscription.guard(EventSink::new(|_| {})).send(StreamEvent::Complete(None));

    assert!(subscription.is_finished());
    assert_eq!(runs.load(Ordering::SeqCst), 0);
}

#[test]
fn deferred_teardown_resolves_outside_runtime() {
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let teardown = Teardown::deferred(async move {
        Teardown::immediate(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    });

    teardown.run();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn deferred_teardown_is_spawned_inside_runtime() {
    let (tx, rx) = tokio::sync::oneshot::channel();
    let teardown = Teardown::deferred(async move {
        Teardown::immediate(move || {
            drop(tx.send(()));
        })
    });

    teardown.run();

    rx.await.expect("deferred teardown ran");
}

// ---------------------------------------------------------------------------
// CancellationSignal
// ---------------------------------------------------------------------------

#[test]
fn signal_unsubscribes_bound_subscription() {
    let signal = CancellationSignal::new();
    let subscription = Subscription::new("Count");
    subscription.bind(&signal);

    signal.cancel();

    assert!(signal.is_cancelled());
    assert!(!subscription.is_active());
}

#[test]
fn callback_registered_after_cancel_runs_at_once() {
    let signal = CancellationSignal::new();
    signal.cancel();
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);

    signal.on_cancel(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancelled_future_resolves_after_cancel() {
    let signal = CancellationSignal::new();
    let waiter = signal.clone();
    let task = tokio::spawn(async move { waiter.cancelled().await });

    tokio::task::yield_now().await;
    signal.cancel();

    task.await.expect("waiter finished");
}

// ---------------------------------------------------------------------------
// CommandStream
// ---------------------------------------------------------------------------

#[tokio::test]
async fn bridged_stream_yields_final_value_then_ends() {
    let (tx, rx) = mpsc::unbounded_channel();
    let subscription = Subscription::new("Count");
    for event in [
        StreamEvent::Next(0),
        StreamEvent::Next(1),
        StreamEvent::Complete(Some(2)),
    ] {
        tx.send(event).expect("queue");
    }
    let stream = CommandStream::bridged(rx, subscription.clone());

    let values: Vec<i32> = stream
        .map(|item| item.expect("value"))
        .collect()
        .await;

    assert_eq!(values, vec![0, 1, 2]);
    assert!(subscription.is_active(), "completion must not unsubscribe");
}

#[tokio::test]
async fn bridged_stream_surfaces_failure_once() {
    let (tx, rx) = mpsc::unbounded_channel::<StreamEvent<i32>>();
    tx.send(StreamEvent::Failed(BusError::handler_not_found("Count")))
        .expect("queue");
    let mut stream = CommandStream::bridged(rx, Subscription::new("Count"));

    assert!(matches!(stream.next().await, Some(Err(_))));
    assert!(stream.next().await.is_none());
    assert!(stream.is_terminated());
}

#[test]
fn dropping_unfinished_stream_unsubscribes() {
    let (_tx, rx) = mpsc::unbounded_channel::<StreamEvent<i32>>();
    let subscription = Subscription::new("Count");
    let stream = CommandStream::bridged(rx, subscription.clone());

    drop(stream);

    assert!(!subscription.is_active());
}

#[tokio::test]
async fn failed_stream_raises_on_first_pull() {
    let mut stream = CommandStream::<i32>::failed(BusError::handler_not_found("Count"));

    let first = stream.next().await.expect("an item");
    assert!(matches!(first, Err(BusError::HandlerNotFound { .. })));
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn direct_stream_stops_after_error() {
    let source = futures::stream::iter(vec![
        Ok(1),
        Err(BusError::handler("Count", HandlerError::new("boom"))),
        Ok(2),
    ]);
    let stream = CommandStream::direct(source.boxed());

    let items: Vec<_> = stream.collect().await;

    assert_eq!(items.len(), 2);
    assert!(matches!(items.last(), Some(Err(BusError::Handler { .. }))));
}
