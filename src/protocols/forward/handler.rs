//! Forward protocol connection handler.
//!
//! Owns one accepted connection: decodes frames, normalizes their entries,
//! counts them and hands each frame's entries to the sink as one batch.

use super::parser::{Frame, FrameScanner, ParseResult};
use super::value::normalize;
use crate::error::{classify, ProtocolError, TransportClass};
use crate::server::Registration;
use crate::sink::Sink;
use bytes::{Buf, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{error, info, trace, warn};

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// Why a handler stopped.
#[derive(Debug)]
pub enum Exit {
    /// Peer closed the connection.
    EndOfStream,
    /// The listener closed the connection during shutdown.
    Closed,
    /// Peer sent something that is not a valid frame.
    Protocol(ProtocolError),
    /// Non-temporary transport failure.
    Transport(io::Error),
}

/// Per-connection decode loop.
pub struct Handler<S> {
    stream: S,
    peer: SocketAddr,
    buffer: BytesMut,
    scanner: FrameScanner,
    sink: Arc<dyn Sink>,
    entries: Arc<AtomicU64>,
    max_frame_size: usize,
    registration: Registration,
}

impl<S> Handler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        peer: SocketAddr,
        registration: Registration,
        sink: Arc<dyn Sink>,
        entries: Arc<AtomicU64>,
        max_frame_size: usize,
    ) -> Self {
        Self {
            stream,
            peer,
            buffer: BytesMut::with_capacity(BUFFER_SIZE),
            scanner: FrameScanner::new(),
            sink,
            entries,
            max_frame_size,
            registration,
        }
    }

    /// Run until the connection ends, then close it and leave the registry.
    pub async fn run(mut self) -> Exit {
        let conn_id = self.registration.id();
        let exit = self.decode_loop().await;

        match &exit {
            Exit::EndOfStream => {
                info!(peer = %self.peer, conn_id, "Client closed the connection");
                if !self.buffer.is_empty() {
                    warn!(
                        peer = %self.peer,
                        pending = self.buffer.len(),
                        "Discarding truncated frame"
                    );
                }
            }
            Exit::Closed => info!(peer = %self.peer, conn_id, "Connection closed by server"),
            Exit::Protocol(e) => error!(peer = %self.peer, conn_id, error = %e, "Protocol error"),
            Exit::Transport(e) => error!(peer = %self.peer, conn_id, error = %e, "Connection error"),
        }

        if let Err(e) = self.stream.shutdown().await {
            warn!(peer = %self.peer, error = %e, "Failed to close connection");
        }
        // Dropping the registration removes this handler from the registry
        drop(self.registration);
        exit
    }

    async fn decode_loop(&mut self) -> Exit {
        loop {
            match self.scanner.parse(&self.buffer) {
                ParseResult::Complete(frame, consumed) => {
                    self.buffer.advance(consumed);
                    self.dispatch(frame);
                    continue;
                }
                ParseResult::Incomplete => {
                    if self.buffer.len() > self.max_frame_size {
                        return Exit::Protocol(ProtocolError::FrameTooLarge {
                            limit: self.max_frame_size,
                        });
                    }
                }
                ParseResult::Error(e) => return Exit::Protocol(e),
            }

            let cancel = self.registration.token();
            let read = tokio::select! {
                r = self.stream.read_buf(&mut self.buffer) => Some(r),
                _ = cancel.cancelled() => None,
            };

            match read {
                None => return Exit::Closed,
                Some(Ok(0)) => return Exit::EndOfStream,
                Some(Ok(n)) => trace!(peer = %self.peer, bytes = n, "Read"),
                Some(Err(e)) => match classify(&e) {
                    TransportClass::Temporary => {
                        warn!(peer = %self.peer, error = %e, "Temporary failure");
                    }
                    TransportClass::EndOfStream => return Exit::EndOfStream,
                    TransportClass::Fatal => return Exit::Transport(e),
                },
            }
        }
    }

    fn dispatch(&self, frame: Frame) {
        let mut entries = frame.into_entries();
        for entry in &mut entries {
            normalize(&mut entry.data);
        }

        let count = entries.len();
        self.entries.fetch_add(count as u64, Ordering::Relaxed);
        trace!(peer = %self.peer, entries = count, "Decoded frame");

        if count > 0 {
            self.sink.emit(entries);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::forward::{encoder, Entry, Record, Value};
    use crate::server::ConnectionRegistry;
    use crate::sink::ChannelSink;
    use tokio::io::duplex;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        entries: Arc<AtomicU64>,
        rx: UnboundedReceiver<Vec<Entry>>,
    }

    fn start<S>(stream: S, max_frame_size: usize) -> (Fixture, tokio::task::JoinHandle<Exit>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let registry = Arc::new(ConnectionRegistry::new());
        let entries = Arc::new(AtomicU64::new(0));
        let (sink, rx) = ChannelSink::new();
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let registration = registry.register(peer);
        let handler = Handler::new(
            stream,
            peer,
            registration,
            Arc::new(sink),
            Arc::clone(&entries),
            max_frame_size,
        );
        let task = tokio::spawn(handler.run());
        (
            Fixture {
                registry,
                entries,
                rx,
            },
            task,
        )
    }

    fn record(msg: &str) -> Record {
        let mut r = Record::new();
        r.insert("message".to_string(), Value::Bytes(msg.as_bytes().to_vec()));
        r
    }

    #[tokio::test]
    async fn test_frames_reach_sink_normalized() {
        let (mut client, server) = duplex(1024);
        let (mut fx, task) = start(server, 1 << 20);
        assert_eq!(fx.registry.len(), 1);

        let mut buf = BytesMut::new();
        encoder::encode_single(&mut buf, "app.log", 1000, &record("hi")).unwrap();
        encoder::encode_batch(&mut buf, "t", &[(1, record("a")), (2, record("b"))]).unwrap();
        client.write_all(&buf).await.unwrap();
        drop(client);

        let first = fx.rx.recv().await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].tag, "app.log");
        assert_eq!(first[0].data["message"], Value::from("hi"));

        let second = fx.rx.recv().await.unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].data["message"], Value::from("a"));
        assert_eq!(second[1].data["message"], Value::from("b"));

        assert!(matches!(task.await.unwrap(), Exit::EndOfStream));
        assert_eq!(fx.entries.load(Ordering::Relaxed), 3);
        assert_eq!(fx.registry.len(), 0);
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let (mut client, server) = duplex(1024);
        let (mut fx, task) = start(server, 1 << 20);

        let mut buf = BytesMut::new();
        encoder::encode_single(&mut buf, "split", 7, &record("piecewise")).unwrap();
        let (head, tail) = buf.split_at(buf.len() / 2);
        client.write_all(head).await.unwrap();
        tokio::task::yield_now().await;
        client.write_all(tail).await.unwrap();
        drop(client);

        let batch = fx.rx.recv().await.unwrap();
        assert_eq!(batch[0].timestamp, 7);
        assert!(matches!(task.await.unwrap(), Exit::EndOfStream));
    }

    #[tokio::test]
    async fn test_frames_across_scripted_reads() {
        let mut buf = BytesMut::new();
        encoder::encode_batch(&mut buf, "t", &[(1, record("a")), (2, record("b"))]).unwrap();
        encoder::encode_single(&mut buf, "t", 3, &record("c")).unwrap();

        // Split inside the first frame and again right at a frame boundary
        let boundary = buf.len() - {
            let mut single = BytesMut::new();
            encoder::encode_single(&mut single, "t", 3, &record("c")).unwrap();
            single.len()
        };
        let mock = tokio_test::io::Builder::new()
            .read(&buf[..5])
            .read(&buf[5..boundary])
            .read(&buf[boundary..])
            .build();
        let (mut fx, task) = start(mock, 1 << 20);

        let first = fx.rx.recv().await.unwrap();
        assert_eq!(first.len(), 2);
        let second = fx.rx.recv().await.unwrap();
        assert_eq!(second[0].timestamp, 3);
        assert_eq!(second[0].data["message"], Value::from("c"));

        assert!(matches!(task.await.unwrap(), Exit::EndOfStream));
        assert_eq!(fx.entries.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_large_frame_in_small_reads() {
        let pairs: Vec<(u64, Record)> = (0..200_000u64)
            .map(|i| (i, record(&format!("entry {i}"))))
            .collect();
        let mut buf = BytesMut::new();
        encoder::encode_batch(&mut buf, "bulk", &pairs).unwrap();
        assert!(buf.len() > 2 << 20);

        let (mut client, server) = duplex(16 * 1024);
        let (mut fx, task) = start(server, 16 << 20);
        let writer = tokio::spawn(async move {
            for chunk in buf.chunks(16 * 1024) {
                client.write_all(chunk).await.unwrap();
            }
        });

        let batch = tokio::time::timeout(std::time::Duration::from_secs(30), fx.rx.recv())
            .await
            .expect("large frame was not decoded in time")
            .unwrap();
        assert_eq!(batch.len(), 200_000);
        assert_eq!(batch[199_999].timestamp, 199_999);
        assert_eq!(batch[7].data["message"], Value::from("entry 7"));

        writer.await.unwrap();
        assert!(matches!(task.await.unwrap(), Exit::EndOfStream));
        assert_eq!(fx.entries.load(Ordering::Relaxed), 200_000);
    }

    #[tokio::test]
    async fn test_temporary_read_errors_are_retried() {
        let mut buf = BytesMut::new();
        encoder::encode_single(&mut buf, "t", 1, &record("before")).unwrap();
        let first_len = buf.len();
        encoder::encode_single(&mut buf, "t", 2, &record("after")).unwrap();

        let mock = tokio_test::io::Builder::new()
            .read(&buf[..first_len + 3])
            .read_error(io::Error::from(io::ErrorKind::Interrupted))
            .read_error(io::Error::from(io::ErrorKind::TimedOut))
            .read(&buf[first_len + 3..])
            .build();
        let (mut fx, task) = start(mock, 1 << 20);

        assert_eq!(fx.rx.recv().await.unwrap()[0].timestamp, 1);
        let second = fx.rx.recv().await.unwrap();
        assert_eq!(second[0].timestamp, 2);
        assert_eq!(second[0].data["message"], Value::from("after"));

        assert!(matches!(task.await.unwrap(), Exit::EndOfStream));
        assert_eq!(fx.entries.load(Ordering::Relaxed), 2);
        assert!(fx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_fatal_read_error_ends_connection() {
        let mut buf = BytesMut::new();
        encoder::encode_single(&mut buf, "t", 1, &record("delivered")).unwrap();

        let mock = tokio_test::io::Builder::new()
            .read(&buf)
            .read_error(io::Error::from(io::ErrorKind::ConnectionReset))
            .build();
        let (mut fx, task) = start(mock, 1 << 20);

        assert_eq!(fx.rx.recv().await.unwrap().len(), 1);
        match task.await.unwrap() {
            Exit::Transport(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(fx.registry.is_empty());
        assert_eq!(fx.entries.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_garbage_closes_connection() {
        let (mut client, server) = duplex(1024);
        let (fx, task) = start(server, 1 << 20);

        client.write_all(&[0xc1, 0xc1, 0xc1]).await.unwrap();

        assert!(matches!(task.await.unwrap(), Exit::Protocol(_)));
        assert_eq!(fx.registry.len(), 0);
        assert_eq!(fx.entries.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_frame_too_large() {
        let (mut client, server) = duplex(4096);
        let (_fx, task) = start(server, 64);

        let mut buf = BytesMut::new();
        let big = "x".repeat(512);
        encoder::encode_single(&mut buf, "big", 1, &record(&big)).unwrap();
        // Withhold the last byte so the frame never completes
        client.write_all(&buf[..buf.len() - 1]).await.unwrap();

        match task.await.unwrap() {
            Exit::Protocol(ProtocolError::FrameTooLarge { limit }) => assert_eq!(limit, 64),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_all_stops_handler() {
        let (_client, server) = duplex(1024);
        let (fx, task) = start(server, 1 << 20);

        assert_eq!(fx.registry.close_all(), 1);
        assert!(matches!(task.await.unwrap(), Exit::Closed));
        assert_eq!(fx.registry.len(), 0);
    }
}
