//! Crate-level integration and BDD tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, duplex, split};

use crate::channel::LinkPort;
use crate::error::{BusError, HandlerError};
use crate::port_channel::{PortChannelOptions, PortChannelPlugin};
use crate::stream::{Emitter, Teardown};
use crate::{Command, CommandBus, Context};


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
struct Fail {
    reason: String,
}

impl Command for Fail {
    const NAME: &'static str = "Fail";
    type Output = ();
}

#[derive(Debug, Serialize, Deserialize)]
struct Endless;

impl Command for Endless {
    const NAME: &'static str = "Endless";
    type Output = u32;
}

fn register_handlers(bus: &CommandBus) {
    bus.register(|command: Double, _: &Context| Ok(command.0 * 2));
    bus.register(|command: Fail, _: &Context| Err(HandlerError::new(command.reason)));
    bus.register_stream(|command: Count, _: &Context, emitter: Emitter<u32>| {
        for n in 0..command.upto {
            emitter.next(n);
        }
        emitter.complete(None);
        Teardown::none()
    });
}

/// Links two buses over an in-process byte pipe, as a worker process would
/// be linked over its standard I/O.
fn linked_buses() -> (CommandBus, CommandBus) {
    let (near, far) = duplex(64 * 1024);
    let (near_reader, near_writer) = split(near);
    let (far_reader, far_writer) = split(far);
    let client_port = Arc::new(LinkPort::new(near_reader, near_writer));
    let server_port = Arc::new(LinkPort::new(far_reader, far_writer));
    client_port.start();
    server_port.start();

    let client = CommandBus::builder()
        .plugin(PortChannelPlugin::new(client_port, PortChannelOptions::new()))
        .build();
    let server = CommandBus::builder()
        .plugin(PortChannelPlugin::new(server_port, PortChannelOptions::new()))
        .build();
    register_handlers(&server);
    (client, server)
}

#[tokio::test]
async fn unary_command_crosses_a_byte_link() {
    let (client, _server) = linked_buses();
    let doubled = client.execute(Double(21)).await.expect("remote result");
    assert_eq!(doubled, 42);
}

#[tokio::test]
async fn remote_failure_crosses_a_byte_link() {
    let (client, _server) = linked_buses();
    let err = client
        .execute(Fail {
            reason: "boom".into(),
        })
        .await
        .expect_err("remote failure");
    assert!(err.to_string().contains("boom"), "unexpected error: {err}");
}

#[tokio::test]
async fn stream_crosses_a_byte_link() {
    let (client, _server) = linked_buses();
    let values: Vec<u32> = client
        .stream_async(Count { upto: 4 })
        .map(|item| item.expect("remote value"))
        .collect()
        .await;
    assert_eq!(values, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn peer_hanging_up_after_acknowledging_fails_the_request() {
    let (near, far) = duplex(64 * 1024);
    let (near_reader, near_writer) = split(near);
    let port = Arc::new(LinkPort::new(near_reader, near_writer));
    port.start();
    let client = CommandBus::builder()
        .plugin(PortChannelPlugin::new(port, PortChannelOptions::new()))
        .build();
    let peer = tokio::spawn(async move {
        let (reader, mut writer) = split(far);
        let mut lines = BufReader::new(reader).lines();
        let line = lines
            .next_line()
            .await
            .expect("request read")
            .expect("request frame");
        let frame: Value = serde_json::from_str(&line).expect("frame");
        let ack = json!({"channel": "Double_Ack", "payload": {"id": frame["payload"]["id"]}});
        writer
            .write_all(format!("{ack}\n").as_bytes())
            .await
            .expect("ack written");
        writer.flush().await.expect("ack flushed");
    });

    let outcome = tokio::time::timeout(Duration::from_secs(2), client.execute(Double(21)))
        .await
        .expect("request settled");
    peer.await.expect("peer finished");

    assert!(
        matches!(outcome, Err(BusError::Disconnected { .. })),
        "unexpected outcome: {outcome:?}"
    );
    let again = client.execute(Double(1)).await;
    assert!(
        matches!(again, Err(BusError::Disconnected { .. })),
        "unexpected outcome: {again:?}"
    );
}

#[tokio::test]
async fn served_streams_stop_when_the_caller_hangs_up() {
    let (client, server) = linked_buses();
    let stopped = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stopped);
    server.register_stream(move |_: Endless, _: &Context, emitter: Emitter<u32>| {
        emitter.next(0);
        let done = Arc::clone(&flag);
        Teardown::immediate(move || {
            drop(emitter);
            done.store(true, Ordering::SeqCst);
        })
    });
    let mut items = client.stream_async(Endless);
    let first = items.next().await.map(|item| item.expect("remote value"));
    assert_eq!(first, Some(0));

    drop(client);

    tokio::time::timeout(Duration::from_secs(2), async {
        while !stopped.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("producer stopped");
    drop(items);
}
