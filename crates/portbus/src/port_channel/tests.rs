//! Unit tests for remote dispatch over port channels.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use mockall::mock;
use rstest::rstest;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::*;
use crate::bus::CommandBus;
use crate::channel::{EndpointId, ListenerId, MemoryHub, MemoryPort, listener};
use crate::command::Command;
use crate::error::{HandlerError, TimeoutStage};
use crate::protocol::{
    CommandAckEvent, CommandDataEvent, CommandResponseEvent, CommandUnsubscribeEvent,
};
use crate::stream::{Emitter, StreamEvent};

#[derive(Debug, Serialize, Deserialize)]
struct Double(i64);

impl Command for Double {
    const NAME: &'static str = "Double";
    type Output = i64;
}

#[derive(Debug, Serialize, Deserialize)]
struct Count {
    upto: u32,
}

impl Command for Count {
    const NAME: &'static str = "Count";
    type Output = u32;
}

#[derive(Debug, Serialize, Deserialize)]
struct Ticks(u64);

impl Command for Ticks {
    const NAME: &'static str = "Ticks";
    type Output = u64;
}

#[derive(Debug, Serialize, Deserialize)]
struct Stall;

#[derive(Debug, Serialize, Deserialize)]
struct Words;

impl Command for Words {
    const NAME: &'static str = "Words";
    type Output = String;
}

/// Same wire name as [`Words`], but expecting numbers back.
#[derive(Debug, Serialize, Deserialize)]
struct WordLengths;

impl Command for WordLengths {
    const NAME: &'static str = "Words";
    type Output = u32;
}

impl Command for Stall {
    const NAME: &'static str = "Stall";
    type Output = ();
}

struct Node {
    bus: CommandBus,
    plugin: PortChannelPlugin,
    endpoint: EndpointId,
}

fn node(hub: &MemoryHub, options: PortChannelOptions) -> Node {
    let port = Arc::new(hub.connect());
    let endpoint = port.endpoint();
    let plugin = PortChannelPlugin::new(port, options);
    let bus = CommandBus::builder().plugin(plugin.clone()).build();
    Node {
        bus,
        plugin,
        endpoint,
    }
}

fn fast() -> PortChannelOptions {
    PortChannelOptions::new().with_timeout(Duration::from_millis(200))
}

async fn eventually(check: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

#[tokio::test]
async fn remote_execute_round_trips() {
    let hub = MemoryHub::new();
    let server = node(&hub, fast());
    let client = node(&hub, fast());
    server.bus.register(|command: Double, _| Ok(command.0 * 2));

    let result = client.bus.execute(Double(21)).await.expect("remote result");

    assert_eq!(result, 42);
    let requests = hub.published_on("Double");
    assert_eq!(requests.len(), 1);
    assert!(requests.iter().all(|message| message.source == client.endpoint));
    let acks = hub.published_on("Double_Ack");
    assert_eq!(
        acks.first().and_then(|message| message.options.target()),
        Some(client.endpoint)
    );
    let responses = hub.published_on("Double_Response");
    assert_eq!(
        responses.first().map(|message| message.payload["data"].clone()),
        Some(json!(42))
    );
}

#[tokio::test]
async fn remote_failure_is_forwarded() {
    let hub = MemoryHub::new();
    let server = node(&hub, fast());
    let client = node(&hub, fast());
    server.bus.register(|_: Double, _| -> Result<i64, HandlerError> {
        Err(HandlerError::new("boom").with_data(json!({"code": 7})))
    });

    let err = client.bus.execute(Double(1)).await.expect_err("remote failure");

    assert!(
        matches!(
            &err,
            BusError::Remote { source, .. }
                if source.message() == "boom" && source.data() == Some(&json!({"code": 7}))
        ),
        "unexpected error: {err:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn unanswered_request_times_out() {
    let hub = MemoryHub::new();
    let client = node(&hub, fast());
    let started = tokio::time::Instant::now();

    let err = client.bus.execute(Double(21)).await.expect_err("timeout");

    assert!(err.to_string().contains("Timeout"), "unexpected error: {err}");
    assert!(matches!(
        err,
        BusError::RemoteTimeout {
            stage: TimeoutStage::Acknowledgement,
            timeout_ms: 200,
            ..
        }
    ));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(250));
    assert_eq!(hub.published_on("Double_Unsubscribe").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn acknowledged_request_can_time_out_awaiting_response() {
    let hub = MemoryHub::new();
    let server = node(&hub, fast());
    let client = node(
        &hub,
        fast().with_response_timeout(Some(Duration::from_millis(100))),
    );
    server
        .bus
        .register_async(|_: Stall, _| futures::future::pending::<Result<(), HandlerError>>());

    let err = client.bus.execute(Stall).await.expect_err("timeout");

    assert!(matches!(
        err,
        BusError::RemoteTimeout {
            stage: TimeoutStage::Response,
            ..
        }
    ));
    let cancels = hub.published_on("Stall_Unsubscribe");
    assert_eq!(
        cancels.first().and_then(|message| message.options.target()),
        Some(server.endpoint)
    );
    eventually(|| server.plugin.serving().is_empty()).await;
}

#[tokio::test]
async fn local_handler_short_circuits_the_channel() {
    let hub = MemoryHub::new();
    let local = node(&hub, fast());
    let remote = node(&hub, fast());
    local.bus.register(|command: Double, _| Ok(command.0 * 2));
    remote.bus.register(|command: Double, _| Ok(command.0 * 3));

    let result = local.bus.execute(Double(21)).await.expect("local result");

    assert_eq!(result, 42);
    assert!(hub.published().is_empty());
}

fn counting(bus: &CommandBus) {
    bus.register_stream(|command: Count, _: &Context, emitter: Emitter<u32>| {
        let last = command.upto.saturating_sub(1);
        for n in 0..command.upto {
            emitter.emit(n, n == last);
        }
        Teardown::none()
    });
}

#[tokio::test]
async fn local_stream_short_circuits_the_channel() {
    let hub = MemoryHub::new();
    let local = node(&hub, fast());
    let remote = node(&hub, fast());
    counting(&local.bus);
    counting(&remote.bus);

    let items: Vec<u32> = local
        .bus
        .stream_async(Count { upto: 3 })
        .map(|item| item.expect("count"))
        .collect()
        .await;

    assert_eq!(items, vec![0, 1, 2]);
    assert!(hub.published().is_empty());
}

#[tokio::test]
async fn remote_push_stream_arrives_in_order() {
    let hub = MemoryHub::new();
    let server = node(&hub, fast());
    let client = node(&hub, fast());
    counting(&server.bus);

    let items: Vec<u32> = client
        .bus
        .stream_async(Count { upto: 5 })
        .map(|item| item.expect("count"))
        .collect()
        .await;

    assert_eq!(items, vec![0, 1, 2, 3, 4]);
    assert!(client.plugin.active_remote_streams().is_empty());
    assert!(server.plugin.serving().is_empty());
}

#[tokio::test]
async fn remote_pull_stream_is_driven_to_completion() {
    let hub = MemoryHub::new();
    let server = node(&hub, fast());
    let client = node(&hub, fast());
    server
        .bus
        .register_stream_async(|command: Ticks, _| futures::stream::iter((0..command.0).map(Ok)));

    let items: Vec<u64> = client
        .bus
        .stream_async(Ticks(4))
        .map(|item| item.expect("tick"))
        .collect()
        .await;

    assert_eq!(items, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn remote_stream_failure_terminates_the_sequence() {
    let hub = MemoryHub::new();
    let server = node(&hub, fast());
    let client = node(&hub, fast());
    server.bus.register_stream_async(|_: Ticks, _| {
        futures::stream::iter(vec![Ok(1), Err(HandlerError::new("dried up"))])
    });

    let items: Vec<Result<u64, BusError>> = client.bus.stream_async(Ticks(0)).collect().await;

    assert_eq!(items.len(), 2);
    assert!(matches!(items.first(), Some(Ok(1))));
    assert!(matches!(
        items.last(),
        Some(Err(BusError::Remote { source, .. })) if source.message() == "dried up"
    ));
}

#[tokio::test]
async fn cancelling_a_remote_stream_stops_the_producer() {
    let hub = MemoryHub::new();
    let server = node(&hub, fast());
    let client = node(&hub, fast());
    let stopped = Arc::new(AtomicBool::new(false));
    let producers: Arc<Mutex<Vec<Emitter<u32>>>> = Arc::new(Mutex::new(Vec::new()));
    let flag = Arc::clone(&stopped);
    let held = Arc::clone(&producers);
    server
        .bus
        .register_stream(move |_: Count, _: &Context, emitter: Emitter<u32>| {
            emitter.next(0);
            held.lock().expect("producers").push(emitter);
            let done = Arc::clone(&flag);
            Teardown::immediate(move || done.store(true, Ordering::SeqCst))
        });
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    let subscription = client
        .bus
        .stream(Count { upto: 0 }, move |event: StreamEvent<u32>| {
            sink.lock().expect("seen").push(event.into_value());
        })
        .expect("stream opened");
    eventually(|| !seen.lock().expect("seen").is_empty()).await;
    assert_eq!(client.plugin.active_remote_streams().len(), 1);

    subscription.unsubscribe();
    eventually(|| stopped.load(Ordering::SeqCst)).await;

    assert!(client.plugin.active_remote_streams().is_empty());
    assert!(server.plugin.serving().is_empty());
    let cancels = hub.published_on("Count_Unsubscribe");
    assert_eq!(
        cancels.first().and_then(|message| message.options.target()),
        Some(server.endpoint)
    );
    if let Some(emitter) = producers.lock().expect("producers").first() {
        emitter.next(1);
    }
    assert_eq!(seen.lock().expect("seen").len(), 1);
}

#[tokio::test]
async fn responder_unsubscribe_completes_the_stream() {
    let hub = MemoryHub::new();
    let client = node(&hub, fast());
    let responder = Arc::new(hub.connect());
    let port = Arc::clone(&responder);
    responder.subscribe(
        "Count",
        listener(move |payload, envelope| {
            let request: CommandDataEvent = serde_json::from_value(payload).expect("request");
            let to = PublishOptions::to(envelope.source);
            let ack = CommandAckEvent {
                id: request.id.clone(),
            };
            port.publish("Count_Ack", serde_json::to_value(ack).expect("ack"), to);
            let cancel = CommandUnsubscribeEvent { id: request.id };
            port.publish(
                "Count_Unsubscribe",
                serde_json::to_value(cancel).expect("cancel"),
                to,
            );
        }),
    );

    let items: Vec<Result<u32, BusError>> =
        client.bus.stream_async(Count { upto: 3 }).collect().await;

    assert!(items.is_empty());
    assert!(client.plugin.active_remote_streams().is_empty());
}

#[tokio::test]
async fn stray_responses_are_ignored() {
    let hub = MemoryHub::new();
    let client = node(&hub, fast());
    let server = Arc::new(hub.connect());
    let port = Arc::clone(&server);
    let answered = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&answered);
    server.subscribe(
        "Double",
        listener(move |payload, envelope| {
            let request: CommandDataEvent = serde_json::from_value(payload).expect("request");
            let to = PublishOptions::to(envelope.source);
            let stray = CommandResponseEvent::complete(RequestId::from("stray"), json!(0));
            port.publish("Double_Response", serde_json::to_value(stray).expect("stray"), to);
            let real = CommandResponseEvent::complete(request.id, json!(84));
            port.publish("Double_Response", serde_json::to_value(real).expect("real"), to);
            port.publish("Double_Response", json!({"garbage": true}), to);
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );

    let result = client.bus.execute(Double(42)).await.expect("answered");

    assert_eq!(result, 84);
    assert_eq!(answered.load(Ordering::SeqCst), 1);
}

#[rstest]
#[case::execute(false)]
#[case::stream(true)]
#[tokio::test]
async fn missing_remote_handler_times_out(#[case] stream: bool) {
    let hub = MemoryHub::new();
    let client = node(
        &hub,
        PortChannelOptions::new().with_timeout(Duration::from_millis(20)),
    );

    let err = if stream {
        client
            .bus
            .stream_async(Count { upto: 1 })
            .next()
            .await
            .and_then(Result::err)
            .expect("stream failed")
    } else {
        client.bus.execute(Double(1)).await.expect_err("execute failed")
    };

    assert!(err.is_timeout());
}

#[tokio::test]
async fn unary_only_type_is_not_streamable_locally() {
    let hub = MemoryHub::new();
    let local = node(&hub, fast());
    local.bus.register(|command: Double, _| Ok(command.0));

    let err = local
        .bus
        .stream(Double(1), |_| {})
        .expect_err("not a stream handler");

    assert!(matches!(err, BusError::NotAStreamHandler { .. }));
}

#[test]
fn options_default_to_five_seconds() {
    let options = PortChannelOptions::default();
    assert_eq!(options.timeout(), Duration::from_millis(5000));
    assert_eq!(options.response_timeout(), None);
}

mock! {
    Port {}
    impl PortChannel for Port {
        fn endpoint(&self) -> EndpointId;
        fn publish(&self, channel: &str, payload: Value, options: PublishOptions);
        fn subscribe(&self, channel: &str, listener: Listener) -> ListenerId;
        fn unsubscribe(&self, channel: &str, listener: ListenerId);
    }
}

fn numbered_subscriptions(port: &mut MockPort, times: usize) {
    let next = AtomicU64::new(0);
    port.expect_subscribe()
        .times(times)
        .returning(move |_, _| ListenerId::new(next.fetch_add(1, Ordering::Relaxed)));
}

#[tokio::test(start_paused = true)]
async fn request_publishes_once_and_releases_listeners_on_timeout() {
    let mut port = MockPort::new();
    numbered_subscriptions(&mut port, 3);
    port.expect_publish()
        .withf(|channel, payload, options| {
            channel == "Double"
                && payload["data"] == json!(21)
                && payload["id"].is_string()
                && options.is_single_consumer()
                && options.target().is_none()
        })
        .times(1)
        .return_const(());
    port.expect_publish()
        .withf(|channel, _, options| channel == "Double_Unsubscribe" && options.target().is_none())
        .times(1)
        .return_const(());
    port.expect_unsubscribe().times(3).return_const(());
    let plugin = PortChannelPlugin::new(Arc::new(port), fast());
    let bus = CommandBus::builder().plugin(plugin).build();

    let err = bus.execute(Double(21)).await.expect_err("timeout");

    assert!(err.is_timeout());
}

#[tokio::test]
async fn registering_listens_without_publishing() {
    let mut port = MockPort::new();
    numbered_subscriptions(&mut port, 2);
    port.expect_publish().never();
    let plugin = PortChannelPlugin::new(Arc::new(port), fast());
    let bus = CommandBus::builder().plugin(plugin).build();
    bus.register(|command: Double, _| Ok(command.0 * 2));
    bus.register(|command: Double, _| Ok(command.0 * 4));

    assert_eq!(bus.execute(Double(2)).await.expect("local"), 8);
}

#[tokio::test]
async fn abandoned_execute_cancels_the_request() {
    let hub = MemoryHub::new();
    let server = node(&hub, fast());
    let client = node(&hub, fast());
    server
        .bus
        .register_async(|_: Stall, _| futures::future::pending::<Result<(), HandlerError>>());

    let outcome = tokio::time::timeout(Duration::from_millis(50), client.bus.execute(Stall)).await;

    assert!(outcome.is_err());
    eventually(|| !hub.published_on("Stall_Unsubscribe").is_empty()).await;
    eventually(|| server.plugin.serving().is_empty()).await;
}

#[test]
fn plugin_debug_names_endpoint() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");
    let _guard = runtime.enter();
    let hub = MemoryHub::new();
    let port: MemoryPort = hub.connect();
    let plugin = PortChannelPlugin::new(Arc::new(port), fast());
    assert!(format!("{plugin:?}").contains("endpoint-1"));
}

/// Serves `Words` as a stream that emits one word and then stays open.
fn serve_words(server: &Node) -> (Arc<AtomicBool>, Arc<Mutex<Vec<Emitter<String>>>>) {
    let stopped = Arc::new(AtomicBool::new(false));
    let producers: Arc<Mutex<Vec<Emitter<String>>>> = Arc::new(Mutex::new(Vec::new()));
    let flag = Arc::clone(&stopped);
    let held = Arc::clone(&producers);
    server
        .bus
        .register_stream(move |_: Words, _: &Context, emitter: Emitter<String>| {
            emitter.next("hello".to_owned());
            held.lock().expect("producers").push(emitter);
            let done = Arc::clone(&flag);
            Teardown::immediate(move || done.store(true, Ordering::SeqCst))
        });
    (stopped, producers)
}

#[tokio::test]
async fn undecodable_remote_value_releases_the_pulled_stream() {
    let hub = MemoryHub::new();
    let server = node(&hub, fast());
    let client = node(&hub, fast());
    let (stopped, _producers) = serve_words(&server);

    let mut items = client.bus.stream_async(WordLengths);
    let first = items.next().await;

    assert!(
        matches!(first, Some(Err(BusError::Decode { .. }))),
        "unexpected item: {first:?}"
    );
    eventually(|| stopped.load(Ordering::SeqCst)).await;
    assert!(client.plugin.active_remote_streams().is_empty());
    assert!(server.plugin.serving().is_empty());
    let cancels = hub.published_on("Words_Unsubscribe");
    assert_eq!(
        cancels.first().and_then(|message| message.options.target()),
        Some(server.endpoint)
    );
    assert!(items.next().await.is_none());
}

#[tokio::test]
async fn undecodable_remote_value_ends_the_pushed_stream() {
    let hub = MemoryHub::new();
    let server = node(&hub, fast());
    let client = node(&hub, fast());
    let (stopped, producers) = serve_words(&server);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    let subscription = client
        .bus
        .stream(WordLengths, move |event: StreamEvent<u32>| {
            sink.lock().expect("seen").push(event.is_terminal());
        })
        .expect("stream opened");
    eventually(|| stopped.load(Ordering::SeqCst)).await;

    assert!(!subscription.is_active());
    assert!(client.plugin.active_remote_streams().is_empty());
    assert!(server.plugin.serving().is_empty());
    if let Some(emitter) = producers.lock().expect("producers").first() {
        emitter.next("again".to_owned());
    }
    assert_eq!(*seen.lock().expect("seen"), vec![true]);
}

#[tokio::test]
async fn first_acknowledgement_names_the_responder() {
    let hub = MemoryHub::new();
    let client = node(&hub, fast());
    let first = Arc::new(hub.connect());
    let second = Arc::new(hub.connect());
    let (early, late) = (Arc::clone(&first), Arc::clone(&second));
    first.subscribe(
        "Count",
        listener(move |payload, envelope| {
            let request: CommandDataEvent = serde_json::from_value(payload).expect("request");
            let to = PublishOptions::to(envelope.source);
            let ack = serde_json::to_value(CommandAckEvent {
                id: request.id.clone(),
            })
            .expect("ack");
            early.publish("Count_Ack", ack.clone(), to);
            late.publish("Count_Ack", ack, to);
            let item = CommandResponseEvent::next(request.id, json!(7));
            early.publish("Count_Response", serde_json::to_value(item).expect("item"), to);
        }),
    );
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    let subscription = client
        .bus
        .stream(Count { upto: 1 }, move |event: StreamEvent<u32>| {
            sink.lock().expect("seen").push(event.into_value());
        })
        .expect("stream opened");
    eventually(|| !seen.lock().expect("seen").is_empty()).await;
    subscription.unsubscribe();

    let cancels = hub.published_on("Count_Unsubscribe");
    assert_eq!(cancels.len(), 1);
    assert_eq!(
        cancels.first().and_then(|message| message.options.target()),
        Some(first.endpoint())
    );
    assert_eq!(*seen.lock().expect("seen"), vec![Some(7)]);
}

#[tokio::test]
async fn first_terminal_response_settles_the_request() {
    let hub = MemoryHub::new();
    let client = node(&hub, fast());
    let first = Arc::new(hub.connect());
    let second = Arc::new(hub.connect());
    let (early, late) = (Arc::clone(&first), Arc::clone(&second));
    first.subscribe(
        "Double",
        listener(move |payload, envelope| {
            let request: CommandDataEvent = serde_json::from_value(payload).expect("request");
            let to = PublishOptions::to(envelope.source);
            let ack = serde_json::to_value(CommandAckEvent {
                id: request.id.clone(),
            })
            .expect("ack");
            early.publish("Double_Ack", ack.clone(), to);
            late.publish("Double_Ack", ack, to);
            let winner = CommandResponseEvent::complete(request.id.clone(), json!(84));
            early.publish("Double_Response", serde_json::to_value(winner).expect("winner"), to);
            let loser = CommandResponseEvent::complete(request.id, json!(0));
            late.publish("Double_Response", serde_json::to_value(loser).expect("loser"), to);
        }),
    );

    let result = client.bus.execute(Double(42)).await.expect("answered");

    assert_eq!(result, 84);
    assert_eq!(hub.published_on("Double_Response").len(), 2);
    let again = client.bus.execute(Double(1)).await.expect("answered again");
    assert_eq!(again, 84);
}
