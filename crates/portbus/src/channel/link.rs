//! Point-to-point transport over a byte stream.
//!
//! Frames travel as JSON lines of the form `{"channel": ..., "payload": ...}`.

use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::listeners::ListenerTable;
use super::{CHANNEL_TARGET, EndpointId, Envelope, Listener, ListenerId, PortChannel, PublishOptions};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Serialize, Deserialize)]
struct Frame {
    channel: String,
    #[serde(default)]
    payload: Value,
}

struct Unstarted {
    reader: BoxedReader,
    closed: watch::Sender<bool>,
}

/// Joins this process to exactly one peer over a reader/writer pair.
///
/// Every publish goes to the peer regardless of consumer mode; messages
/// addressed to any other endpoint are dropped. Incoming frames are delivered
/// with [`LinkPort::PEER`] as their source.
///
/// Frames are written by a background task spawned in [`LinkPort::new`].
/// Reading begins once [`LinkPort::start`] is called, so listeners can be
/// registered first.
pub struct LinkPort {
    listeners: Arc<ListenerTable>,
    outgoing: mpsc::UnboundedSender<String>,
    unstarted: Mutex<Option<Unstarted>>,
    closed: watch::Receiver<bool>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl LinkPort {
    /// Identity of this side of the link.
    pub const LOCAL: EndpointId = EndpointId::new(0);
    /// Identity of the remote side of the link.
    pub const PEER: EndpointId = EndpointId::new(1);

    /// Wraps a reader and writer connected to the peer.
    ///
    /// Must be called within a Tokio runtime.
    #[must_use]
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (outgoing, lines) = mpsc::unbounded_channel();
        tokio::spawn(write_frames(writer, lines));
        let (closed_tx, closed) = watch::channel(false);
        Self {
            listeners: Arc::new(ListenerTable::default()),
            outgoing,
            unstarted: Mutex::new(Some(Unstarted {
                reader: Box::new(reader),
                closed: closed_tx,
            })),
            closed,
            reader_task: Mutex::new(None),
        }
    }

    /// Links to the peer over this process's standard input and output.
    #[must_use]
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }

    /// Starts delivering frames from the peer. Later calls do nothing.
    pub fn start(&self) {
        let Some(unstarted) = lock(&self.unstarted).take() else {
            return;
        };
        let task = tokio::spawn(read_frames(
            unstarted.reader,
            Arc::clone(&self.listeners),
            unstarted.closed,
        ));
        *lock(&self.reader_task) = Some(task);
        debug!(target: CHANNEL_TARGET, "link started");
    }

    /// Returns `true` once the peer has closed its side of the link.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

impl PortChannel for LinkPort {
    fn endpoint(&self) -> EndpointId {
        Self::LOCAL
    }

    fn publish(&self, channel: &str, payload: Value, options: PublishOptions) {
        if options.target().is_some_and(|target| target != Self::PEER) {
            debug!(target: CHANNEL_TARGET, channel, "dropping message for unknown endpoint");
            return;
        }
        let frame = Frame {
            channel: channel.to_owned(),
            payload,
        };
        let line = match serde_json::to_string(&frame) {
            Ok(line) => line,
            Err(error) => {
                warn!(target: CHANNEL_TARGET, channel, %error, "failed to encode frame");
                return;
            }
        };
        if self.outgoing.send(line).is_err() {
            debug!(target: CHANNEL_TARGET, channel, "link writer has stopped");
        }
    }

    fn subscribe(&self, channel: &str, listener: Listener) -> ListenerId {
        self.listeners.add(channel, listener).0
    }

    fn unsubscribe(&self, channel: &str, listener: ListenerId) {
        self.listeners.remove(channel, listener);
    }

    /// Resolves once the peer has closed its side of the link or the reader
    /// has stopped.
    fn closed(&self) -> BoxFuture<'static, ()> {
        let mut watcher = self.closed.clone();
        Box::pin(async move {
            drop(watcher.wait_for(|flag| *flag).await);
        })
    }
}

impl Drop for LinkPort {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.reader_task).take() {
            task.abort();
        }
    }
}

impl fmt::Debug for LinkPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkPort")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn write_frames<W>(mut writer: W, mut lines: mpsc::UnboundedReceiver<String>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = lines.recv().await {
        if let Err(error) = write_line(&mut writer, &line).await {
            warn!(target: CHANNEL_TARGET, %error, "failed to write frame");
            return;
        }
    }
    drop(writer.shutdown().await);
}

async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

async fn read_frames(reader: BoxedReader, listeners: Arc<ListenerTable>, closed: watch::Sender<bool>) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => deliver_line(&line, &listeners),
            Ok(None) => break,
            Err(error) => {
                warn!(target: CHANNEL_TARGET, %error, "failed to read frame");
                break;
            }
        }
    }
    debug!(target: CHANNEL_TARGET, "link closed by peer");
    closed.send_modify(|flag| *flag = true);
}

fn deliver_line(line: &str, listeners: &ListenerTable) {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return;
    }
    let frame: Frame = match serde_json::from_str(trimmed) {
        Ok(frame) => frame,
        Err(error) => {
            warn!(target: CHANNEL_TARGET, %error, "ignoring malformed frame");
            return;
        }
    };
    let envelope = Envelope {
        source: LinkPort::PEER,
        channel: frame.channel,
    };
    let delivered = listeners.dispatch(&frame.payload, &envelope);
    trace!(target: CHANNEL_TARGET, channel = %envelope.channel, delivered, "frame received");
}
