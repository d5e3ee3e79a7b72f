//! Stream multiplexer over a single WebSocket connection
//!
//! One reader task owns the socket's read half and dispatches inbound
//! frames; one writer task owns the write half and drains a single bounded
//! queue, which is what guarantees total frame ordering on the wire. All
//! outbound traffic — OPEN_STREAM, DATA, CLOSE_STREAM, PING, PONG — goes
//! through that queue, so a large DATA write never blocks control frames
//! behind a held lock.

use super::frame::{Frame, FrameType, FRAME_HEADER_SIZE};
use super::stream::{Stream, StreamShared};
use super::ProtocolError;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Capacity of the shared outbound frame queue.
const OUTBOUND_QUEUE: usize = 256;

/// Capacity of the queue of remotely opened streams awaiting accept.
const ACCEPT_QUEUE: usize = 32;

/// Per-stream inbound payload queue capacity.
const STREAM_QUEUE: usize = 256;

/// Which half of the stream-ID space this endpoint allocates from.
/// Clients originate odd IDs starting at 1, servers even IDs starting
/// at 2, so the two sides never collide without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn first_stream_id(self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }
}

/// Stream registry: the ID table plus the allocation state it guards.
pub(crate) struct Registry {
    pub(crate) streams: HashMap<u32, StreamEntry>,
    pub(crate) next_id: u32,
    pub(crate) max_streams: usize,
}

/// Registry-side view of one stream.
pub(crate) struct StreamEntry {
    pub(crate) data_tx: mpsc::Sender<Bytes>,
    pub(crate) shared: Arc<StreamShared>,
}

/// Stream multiplexer
pub struct Mux {
    shared: Arc<MuxShared>,
    accept_rx: AsyncMutex<mpsc::Receiver<Stream>>,
}

struct MuxShared {
    registry: Arc<RwLock<Registry>>,
    outbound_tx: mpsc::Sender<Bytes>,
    /// Set once shutdown begins; unblocks every suspended operation.
    closed: CancellationToken,
    /// Set when the reader task exits.
    done: CancellationToken,
    /// Set when the writer task exits.
    writer_done: CancellationToken,
    shutdown_started: AtomicBool,
    on_pong: StdMutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl Mux {
    /// Wrap `conn` in a multiplexer and start its reader and writer tasks.
    pub fn new<S>(conn: WebSocketStream<S>, role: Role) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, source) = conn.split();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_QUEUE);

        let shared = Arc::new(MuxShared {
            registry: Arc::new(RwLock::new(Registry {
                streams: HashMap::new(),
                next_id: role.first_stream_id(),
                max_streams: 0,
            })),
            outbound_tx,
            closed: CancellationToken::new(),
            done: CancellationToken::new(),
            writer_done: CancellationToken::new(),
            shutdown_started: AtomicBool::new(false),
            on_pong: StdMutex::new(None),
        });

        tokio::spawn(read_loop(Arc::clone(&shared), source, accept_tx));
        tokio::spawn(write_loop(Arc::clone(&shared), sink, outbound_rx));

        Self {
            shared,
            accept_rx: AsyncMutex::new(accept_rx),
        }
    }

    /// Set the maximum number of concurrently registered streams that
    /// `open_stream` will allow. 0 means unlimited. Remotely opened
    /// streams are always admitted.
    pub fn set_max_streams(&self, n: usize) {
        self.shared.registry.write().unwrap().max_streams = n;
    }

    /// Open a new outbound stream.
    pub async fn open_stream(&self) -> Result<Stream, ProtocolError> {
        if self.shared.closed.is_cancelled() {
            return Err(ProtocolError::MuxClosed);
        }

        let (id, stream) = {
            let mut reg = self.shared.registry.write().unwrap();
            if reg.max_streams > 0 && reg.streams.len() >= reg.max_streams {
                return Err(ProtocolError::TooManyStreams);
            }
            let id = reg.next_id;
            reg.next_id += 2;
            let stream = self.shared.register_locked(&mut reg, id);
            (id, stream)
        };

        if let Err(e) = self.shared.enqueue(Frame::open_stream(id).encode()).await {
            self.shared.registry.write().unwrap().streams.remove(&id);
            return Err(e);
        }

        Ok(stream)
    }

    /// Block until the remote side opens a stream or the mux shuts down.
    pub async fn accept_stream(&self) -> Result<Stream, ProtocolError> {
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            stream = rx.recv() => stream.ok_or(ProtocolError::MuxClosed),
            _ = self.shared.closed.cancelled() => Err(ProtocolError::MuxClosed),
        }
    }

    /// Queue a PING frame.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        if self.shared.closed.is_cancelled() {
            return Err(ProtocolError::MuxClosed);
        }
        self.shared.enqueue(Frame::ping().encode()).await
    }

    /// Register a callback fired from the reader task on every PONG
    /// received. Replaces any previous callback.
    pub fn on_pong<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.shared.on_pong.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Resolve when the reader task has exited, i.e. the underlying
    /// connection broke or the mux was closed.
    pub async fn done(&self) {
        self.shared.done.cancelled().await;
    }

    /// Shut the mux down: close every stream, unblock pending accepts,
    /// drain the writer, and close the connection. Idempotent; waits for
    /// both tasks to exit.
    pub async fn close(&self) {
        self.shared.shutdown().await;
        self.shared.done.cancelled().await;
    }

    /// Number of currently registered streams.
    pub fn stream_count(&self) -> usize {
        self.shared.registry.read().unwrap().streams.len()
    }
}

impl MuxShared {
    /// Create a stream, register it, and hand back the user-facing half.
    /// The caller holds the registry write lock.
    fn register_locked(self: &Arc<Self>, reg: &mut Registry, id: u32) -> Stream {
        let (data_tx, data_rx) = mpsc::channel(STREAM_QUEUE);
        let shared = Arc::new(StreamShared::new());
        reg.streams.insert(
            id,
            StreamEntry {
                data_tx,
                shared: Arc::clone(&shared),
            },
        );
        Stream::new(
            id,
            data_rx,
            self.outbound_tx.clone(),
            shared,
            Arc::downgrade(&self.registry),
        )
    }

    /// Queue an encoded frame for the writer task. Blocks while the queue
    /// is full; fails once the mux is closed.
    async fn enqueue(&self, frame: Bytes) -> Result<(), ProtocolError> {
        tokio::select! {
            res = self.outbound_tx.send(frame) => res.map_err(|_| ProtocolError::MuxClosed),
            _ = self.closed.cancelled() => Err(ProtocolError::MuxClosed),
        }
    }

    /// One-shot teardown. Runs at most once regardless of who triggers it
    /// (external close, reader error, writer error).
    async fn shutdown(&self) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closed.cancel();

        // Close the read side of every stream. Dropping the data senders
        // lets readers drain buffered payloads and then observe EOF.
        {
            let mut reg = self.registry.write().unwrap();
            for (_, entry) in reg.streams.drain() {
                entry.shared.tear_down();
            }
        }

        // The writer drains what is queued, performs the closing
        // handshake, and exits; the reader exits right behind it.
        self.writer_done.cancelled().await;
    }

    async fn handle_open_stream(self: &Arc<Self>, id: u32, accept_tx: &mpsc::Sender<Stream>) {
        let stream = {
            let mut reg = self.registry.write().unwrap();
            self.register_locked(&mut reg, id)
        };

        // A full accept queue blocks frame dispatch until a consumer
        // catches up or the mux closes.
        tokio::select! {
            _ = accept_tx.send(stream) => {}
            _ = self.closed.cancelled() => {}
        }
    }

    async fn handle_data(&self, id: u32, payload: Bytes) {
        // Clone the channel handle and release the lock before awaiting;
        // nothing may block while the registry is held.
        let entry = {
            let reg = self.registry.read().unwrap();
            reg.streams
                .get(&id)
                .map(|e| (e.data_tx.clone(), Arc::clone(&e.shared)))
        };
        let Some((data_tx, stream_shared)) = entry else {
            // The stream already closed locally; the remote may not have
            // observed our CLOSE_STREAM yet.
            trace!("dropping DATA for unknown stream {id}");
            return;
        };

        tokio::select! {
            _ = data_tx.send(payload) => {}
            _ = stream_shared.closed.cancelled() => {}
        }
    }

    fn handle_close_stream(&self, id: u32) {
        let entry = self.registry.write().unwrap().streams.remove(&id);
        match entry {
            Some(e) => e.shared.tear_down(),
            None => trace!("dropping CLOSE_STREAM for unknown stream {id}"),
        }
    }

    fn notify_pong(&self) {
        let callback = self.on_pong.lock().unwrap().clone();
        if let Some(f) = callback {
            f();
        }
    }
}

/// Reader task: drains inbound WebSocket messages and dispatches frames.
async fn read_loop<S>(
    shared: Arc<MuxShared>,
    mut source: SplitStream<WebSocketStream<S>>,
    accept_tx: mpsc::Sender<Stream>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let message = tokio::select! {
            _ = shared.closed.cancelled() => break,
            msg = source.next() => msg,
        };

        let data = match message {
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Close(_))) | None => break,
            // Text and WebSocket-level control frames carry no protocol
            // frames; tungstenite answers transport pings itself.
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!("transport read failed: {e}");
                break;
            }
        };

        if data.len() < FRAME_HEADER_SIZE {
            continue;
        }
        let frame = match Frame::decode(&data[..]) {
            Ok(frame) => frame,
            Err(e) => {
                trace!("discarding undecodable message: {e}");
                continue;
            }
        };

        if shared.closed.is_cancelled() {
            break;
        }

        match frame.frame_type {
            FrameType::OpenStream => shared.handle_open_stream(frame.stream_id, &accept_tx).await,
            FrameType::Data => shared.handle_data(frame.stream_id, frame.payload).await,
            FrameType::CloseStream => shared.handle_close_stream(frame.stream_id),
            // PONG goes out before the next inbound frame is processed.
            FrameType::Ping => {
                let _ = shared.enqueue(Frame::pong().encode()).await;
            }
            FrameType::Pong => shared.notify_pong(),
        }
    }

    shared.shutdown().await;
    shared.done.cancel();
}

/// Writer task: sole owner of the socket's write half. Sends one binary
/// message per queued frame, in queue order.
async fn write_loop<S>(
    shared: Arc<MuxShared>,
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut outbound_rx: mpsc::Receiver<Bytes>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        tokio::select! {
            biased;
            _ = shared.closed.cancelled() => {
                // Flush frames queued before the close, then run the
                // closing handshake.
                while let Ok(data) = outbound_rx.try_recv() {
                    if sink.send(Message::Binary(data)).await.is_err() {
                        break;
                    }
                }
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "mux closed".into(),
                    })))
                    .await;
                let _ = sink.close().await;
                break;
            }
            item = outbound_rx.recv() => match item {
                Some(data) => {
                    if let Err(e) = sink.send(Message::Binary(data)).await {
                        debug!("transport write failed: {e}");
                        // Shutdown waits for this task, so it must run
                        // detached rather than inline here.
                        let sh = Arc::clone(&shared);
                        tokio::spawn(async move { sh.shutdown().await });
                        break;
                    }
                }
                None => break,
            }
        }
    }
    shared.writer_done.cancel();
}
