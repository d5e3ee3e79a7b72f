//! Multiplexed stream implementation
//!
//! A [`Stream`] is one logical bidirectional byte channel carried over the
//! shared WebSocket. Inbound payloads are queued by the mux's reader task;
//! outbound writes are framed and funneled through the mux's single write
//! queue. The type implements [`AsyncRead`] and [`AsyncWrite`] so it can be
//! driven with `BufReader`, `BufWriter`, and `tokio::io::copy` like any
//! socket.

use super::frame::Frame;
use super::mux::Registry;
use super::ProtocolError;
use bytes::Bytes;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, PollSender};

/// State shared between a [`Stream`] handle and the mux's registry entry.
///
/// `closed` is the closure signal; `torn_down` is the one-shot guard that
/// makes teardown happen exactly once no matter which side closes first.
pub(crate) struct StreamShared {
    pub(crate) closed: CancellationToken,
    torn_down: AtomicBool,
}

impl StreamShared {
    pub(crate) fn new() -> Self {
        Self {
            closed: CancellationToken::new(),
            torn_down: AtomicBool::new(false),
        }
    }

    /// Close the read side without emitting CLOSE_STREAM (remote close or
    /// mux shutdown). Consumes the one-shot guard.
    pub(crate) fn tear_down(&self) {
        if !self.torn_down.swap(true, Ordering::SeqCst) {
            self.closed.cancel();
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").field("id", &self.id).finish()
    }
}

/// A multiplexed stream within the tunnel
pub struct Stream {
    id: u32,
    /// Incoming payloads, in arrival order. The sender side lives in the
    /// mux registry; once the entry is removed, reads drain what is
    /// buffered and then return EOF.
    data_rx: mpsc::Receiver<Bytes>,
    /// Remainder of a partially consumed payload.
    leftover: Bytes,
    /// Encoded frames into the mux's outbound queue.
    frame_tx: PollSender<Bytes>,
    shared: Arc<StreamShared>,
    registry: Weak<RwLock<Registry>>,
}

impl Stream {
    pub(crate) fn new(
        id: u32,
        data_rx: mpsc::Receiver<Bytes>,
        outbound_tx: mpsc::Sender<Bytes>,
        shared: Arc<StreamShared>,
        registry: Weak<RwLock<Registry>>,
    ) -> Self {
        Self {
            id,
            data_rx,
            leftover: Bytes::new(),
            frame_tx: PollSender::new(outbound_tx),
            shared,
            registry,
        }
    }

    /// Stream ID
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Whether the stream has been closed by either side.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Close the stream. Safe to call multiple times; only the first call
    /// emits a CLOSE_STREAM frame and removes the registry entry.
    pub async fn close(&mut self) {
        if self.shared.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.closed.cancel();
        if let Some(tx) = self.frame_tx.get_ref() {
            let _ = tx.send(Frame::close_stream(self.id).encode()).await;
        }
        self.remove_from_registry();
    }

    fn remove_from_registry(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.write().unwrap().streams.remove(&self.id);
        }
    }

    fn stream_closed_err() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, ProtocolError::StreamClosed)
    }

    fn mux_closed_err() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, ProtocolError::MuxClosed)
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        // Serve leftover bytes from a previous payload first so delivery
        // order matches arrival order.
        if !this.leftover.is_empty() {
            let n = this.leftover.len().min(buf.remaining());
            buf.put_slice(&this.leftover.split_to(n));
            return Poll::Ready(Ok(()));
        }

        loop {
            match this.data_rx.poll_recv(cx) {
                Poll::Ready(Some(mut data)) => {
                    // Zero-length payloads are legal keep-alive no-ops; a
                    // 0-byte read would signal EOF here, so skip them.
                    if data.is_empty() {
                        continue;
                    }
                    let n = data.len().min(buf.remaining());
                    buf.put_slice(&data.split_to(n));
                    this.leftover = data;
                    return Poll::Ready(Ok(()));
                }
                // Sender dropped: stream closed and queue drained.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;

        if this.shared.closed.is_cancelled() {
            return Poll::Ready(Err(Self::stream_closed_err()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        match this.frame_tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                // Re-check after the suspension point: closure may have
                // raced the write.
                if this.shared.closed.is_cancelled() {
                    this.frame_tx.abort_send();
                    return Poll::Ready(Err(Self::stream_closed_err()));
                }
                // Copy so the caller may reuse its buffer on return.
                let frame = Frame::data(this.id, Bytes::copy_from_slice(buf)).encode();
                if this.frame_tx.send_item(frame).is_err() {
                    return Poll::Ready(Err(Self::mux_closed_err()));
                }
                Poll::Ready(Ok(buf.len()))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(Self::mux_closed_err())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are handed to the writer task as soon as they are queued.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;

        if this.shared.torn_down.load(Ordering::SeqCst) {
            return Poll::Ready(Ok(()));
        }

        // Reserve the queue slot for CLOSE_STREAM before consuming the
        // one-shot guard so a pending poll can retry cleanly.
        match this.frame_tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                if this.shared.torn_down.swap(true, Ordering::SeqCst) {
                    this.frame_tx.abort_send();
                    return Poll::Ready(Ok(()));
                }
                this.shared.closed.cancel();
                let _ = this
                    .frame_tx
                    .send_item(Frame::close_stream(this.id).encode());
                this.remove_from_registry();
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(_)) => {
                // Mux already gone; tear down locally.
                if !this.shared.torn_down.swap(true, Ordering::SeqCst) {
                    this.shared.closed.cancel();
                    this.remove_from_registry();
                }
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // Last-resort teardown for handles dropped without an explicit
        // close; the frame is best-effort since we cannot await here.
        if !self.shared.torn_down.swap(true, Ordering::SeqCst) {
            self.shared.closed.cancel();
            if let Some(tx) = self.frame_tx.get_ref() {
                let _ = tx.try_send(Frame::close_stream(self.id).encode());
            }
            self.remove_from_registry();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameType;
    use std::collections::HashMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Harness {
        stream: Stream,
        data_tx: mpsc::Sender<Bytes>,
        outbound_rx: mpsc::Receiver<Bytes>,
        shared: Arc<StreamShared>,
        _registry: Arc<RwLock<Registry>>,
    }

    fn test_stream(id: u32) -> Harness {
        let (data_tx, data_rx) = mpsc::channel(256);
        let (outbound_tx, outbound_rx) = mpsc::channel(256);
        let shared = Arc::new(StreamShared::new());
        let registry = Arc::new(RwLock::new(Registry {
            streams: HashMap::new(),
            next_id: 1,
            max_streams: 0,
        }));
        let stream = Stream::new(
            id,
            data_rx,
            outbound_tx,
            Arc::clone(&shared),
            Arc::downgrade(&registry),
        );
        Harness {
            stream,
            data_tx,
            outbound_rx,
            shared,
            _registry: registry,
        }
    }

    #[tokio::test]
    async fn test_read_write() {
        let mut h = test_stream(1);

        let n = h.stream.write(b"hello stream").await.unwrap();
        assert_eq!(n, 12);

        let frame = Frame::decode(&h.outbound_rx.recv().await.unwrap()[..]).unwrap();
        assert_eq!(frame.frame_type, FrameType::Data);
        assert_eq!(frame.stream_id, 1);
        assert_eq!(&frame.payload[..], b"hello stream");

        h.data_tx
            .send(Bytes::from_static(b"response"))
            .await
            .unwrap();
        let mut buf = [0u8; 64];
        let n = h.stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"response");
    }

    #[tokio::test]
    async fn test_partial_read() {
        let mut h = test_stream(1);
        h.data_tx
            .send(Bytes::from_static(b"abcdef"))
            .await
            .unwrap();

        let mut buf = [0u8; 3];
        let n = h.stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abc");

        let n = h.stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"def");
    }

    #[tokio::test]
    async fn test_read_drains_before_eof() {
        let mut h = test_stream(1);

        h.data_tx.send(Bytes::from_static(b"data")).await.unwrap();
        // Remote close: the guard is consumed and the sender dropped.
        h.shared.tear_down();
        drop(h.data_tx);

        let mut buf = [0u8; 64];
        let n = h.stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"data");

        let n = h.stream.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_write_after_close() {
        let mut h = test_stream(1);
        h.stream.close().await;

        let err = h.stream.write(b"data").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_close_idempotent() {
        let mut h = test_stream(7);

        h.stream.close().await;
        h.stream.close().await;

        let frame = Frame::decode(&h.outbound_rx.recv().await.unwrap()[..]).unwrap();
        assert_eq!(frame.frame_type, FrameType::CloseStream);
        assert_eq!(frame.stream_id, 7);

        // No second CLOSE_STREAM was queued.
        assert!(h.outbound_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_empty_payload_skipped() {
        let mut h = test_stream(1);

        h.data_tx.send(Bytes::new()).await.unwrap();
        h.data_tx.send(Bytes::from_static(b"after")).await.unwrap();

        let mut buf = [0u8; 64];
        let n = h.stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"after");
    }
}
