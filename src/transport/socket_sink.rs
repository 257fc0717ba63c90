// src/transport/socket_sink.rs
//! Asynchronous socket sink
//!
//! The instrumented program hands buffers to a bounded queue; one dedicated
//! writer thread connects, then pulls the head buffer and drives a
//! current-thread tokio runtime that waits for the socket to become writable
//! and writes as much as the socket accepts, moving on only when the buffer
//! is fully written. Callers never enter that runtime, so the sink works the
//! same from plain threads and from inside an async runtime.
//!
//! # Shutdown
//!
//! ```text
//! close() → enqueue FINISHED → close queue → wait (window 1)
//!              drained? ── yes ──→ done
//!                 │ no
//!                 ▼
//!          abort writer → writer writes leftovers in blocking mode (window 2)
//!              done? ── yes ──→ done
//!                 │ no
//!                 ▼
//!          warn, shut the socket down under the writer
//! ```

use crate::transport::buffer_queue::{BufferQueue, QueueCounters, QueueStats};
use crate::transport::wire::{kinds, START_PREAMBLE};
use crate::transport::Sink;
use crate::utils::config::SocketConfig;
use crate::utils::errors::{DiscoveryError, Result};
use bytes::{Buf, Bytes};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::io::Write;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Name of the writer thread
pub const WRITER_THREAD_NAME: &str = "discovery-data-writer";

/// How the writer thread ended
enum WriterExit {
    /// Queue closed and every buffer written; `forced` of them after an abort
    Drained { forced: usize },

    Failed(DiscoveryError),
}

enum Step<T> {
    Abort,
    Ready(T),
}

/// Where the writer connects
struct Target {
    host: String,
    port: u16,
    send_buffer_size: u32,
}

/// Peer address plus a second handle on the socket for closing it
type Connected = (SocketAddr, std::net::TcpStream);

struct WriterHandle {
    thread: JoinHandle<()>,
    exit: Receiver<WriterExit>,
    /// Interrupts the writer while it waits for the next buffer
    abort: Sender<()>,
    /// Interrupts the writer while it waits for the socket
    abort_write: Arc<Notify>,
}

/// Socket sink with a bounded queue and a dedicated writer
pub struct SocketSink {
    queue: BufferQueue,
    writer: Option<WriterHandle>,
    counters: Arc<QueueCounters>,
    peer: SocketAddr,
    control: std::net::TcpStream,
    shutdown_timeout: Duration,
    position: u64,
    closed: bool,
}

impl SocketSink {
    /// Connect to the configured listener, start the writer and send the
    /// START handshake
    pub fn connect(config: &SocketConfig) -> Result<Self> {
        let target = Target {
            host: config.host.clone(),
            port: config.require_port()?,
            send_buffer_size: config.send_buffer_size,
        };

        let (queue, receiver) = BufferQueue::new(config.queue_capacity);
        let counters = queue.counters();
        let abort_write = Arc::new(Notify::new());
        let (abort_tx, abort_rx) = crossbeam_channel::bounded(1);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let (exit_tx, exit_rx) = crossbeam_channel::bounded(1);

        let thread = {
            let counters = Arc::clone(&counters);
            let abort_write = Arc::clone(&abort_write);
            // Held by the writer so the abort channel stays open if the sink
            // is dropped without a shutdown
            let abort_keepalive = abort_tx.clone();
            std::thread::Builder::new()
                .name(WRITER_THREAD_NAME.to_string())
                .spawn(move || {
                    let _abort_keepalive = abort_keepalive;
                    let Some(exit) =
                        run_writer(target, receiver, abort_rx, &abort_write, &counters, ready_tx)
                    else {
                        return;
                    };
                    if let WriterExit::Failed(ref e) = exit {
                        error!("Discovery socket writer stopped: {}", e);
                    }
                    let _ = exit_tx.send(exit);
                })
                .map_err(|e| {
                    DiscoveryError::TransportFailed(format!("Failed to spawn writer thread: {}", e))
                })?
        };

        let (peer, control) = match ready_rx.recv() {
            Ok(Ok(connected)) => connected,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                return Err(DiscoveryError::TransportFailed(
                    "socket writer exited before connecting".to_string(),
                ))
            }
        };

        info!("Connected to discovery listener at {}", peer);

        let mut sink = Self {
            queue,
            writer: Some(WriterHandle {
                thread,
                exit: exit_rx,
                abort: abort_tx,
                abort_write,
            }),
            counters,
            peer,
            control,
            shutdown_timeout: config.shutdown_timeout(),
            position: 0,
            closed: false,
        };
        sink.send(Bytes::from_static(&START_PREAMBLE))?;
        Ok(sink)
    }

    /// Enqueue an encoded buffer without copying it
    pub fn send(&mut self, buffer: Bytes) -> Result<()> {
        if self.closed {
            return Err(DiscoveryError::SessionClosed);
        }
        let len = buffer.len() as u64;
        self.queue.push(buffer)?;
        self.position += len;
        Ok(())
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Override the length of each shutdown wait window
    pub fn set_shutdown_timeout(&mut self, timeout: Duration) {
        self.shutdown_timeout = timeout;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Send FINISHED, drain the queue and close the connection
    pub fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }

        let finished = self.send(Bytes::from_static(&[kinds::FINISHED]));
        self.closed = true;
        self.queue.close();

        let drained = match self.writer.take() {
            Some(writer) => self.await_writer(writer),
            None => Ok(()),
        };

        let stats = self.queue.stats();
        debug!(
            "Socket sink closed: {} of {} buffers written, {} bytes",
            stats.written, stats.enqueued, stats.bytes_written
        );

        finished.and(drained)
    }

    fn await_writer(&self, writer: WriterHandle) -> Result<()> {
        let WriterHandle {
            thread,
            exit,
            abort,
            abort_write,
        } = writer;

        let outcome = match exit.recv_timeout(self.shutdown_timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Socket writer did not drain within {:?}, forcing remaining writes",
                    self.shutdown_timeout
                );
                let _ = abort.try_send(());
                abort_write.notify_one();
                match exit.recv_timeout(self.shutdown_timeout) {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!("Socket writer didn't finish properly");
                        // Fails the writer's pending write; unsent data is lost
                        self.close_control();
                        return Ok(());
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(DiscoveryError::TransportFailed(
                    "socket writer exited without reporting".to_string(),
                ));
            }
        };

        if thread.join().is_err() {
            warn!("Socket writer thread panicked after reporting");
        }

        match outcome {
            WriterExit::Drained { forced } => {
                if forced > 0 {
                    info!("Forced {} queued buffers onto the socket", forced);
                }
                Ok(())
            }
            WriterExit::Failed(e) => Err(e),
        }
    }

    fn close_control(&self) {
        if let Err(e) = self.control.shutdown(Shutdown::Both) {
            warn!("Failed to close discovery socket: {}", e);
        }
    }
}

impl Sink for SocketSink {
    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.send(Bytes::copy_from_slice(data))
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn is_seekable(&self) -> bool {
        false
    }

    fn close(&mut self) -> Result<()> {
        self.shutdown()
    }
}

impl Drop for SocketSink {
    fn drop(&mut self) {
        if !self.closed {
            // Let the writer drain and exit on its own
            warn!("Socket sink dropped without shutdown; detaching writer");
            self.queue.close();
        }
    }
}

/// Body of the writer thread. Connection failures are reported through
/// `ready` and yield `None`.
fn run_writer(
    target: Target,
    queue: Receiver<Bytes>,
    abort: Receiver<()>,
    abort_write: &Notify,
    counters: &QueueCounters,
    ready: Sender<Result<Connected>>,
) -> Option<WriterExit> {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready.send(Err(DiscoveryError::TransportFailed(format!(
                "Failed to build writer runtime: {}",
                e
            ))));
            return None;
        }
    };

    let connected = runtime.block_on(async {
        let stream = open_stream(&target.host, target.port, target.send_buffer_size).await?;
        split_control(stream)
    });
    let (stream, peer, control) = match connected {
        Ok(connected) => connected,
        Err(e) => {
            let _ = ready.send(Err(e));
            return None;
        }
    };
    if ready.send(Ok((peer, control))).is_err() {
        return None;
    }

    Some(write_loop(&runtime, stream, &queue, &abort, abort_write, counters))
}

async fn open_stream(host: &str, port: u16, send_buffer_size: u32) -> Result<TcpStream> {
    let addrs = lookup_host((host, port)).await.map_err(|e| {
        DiscoveryError::TransportFailed(format!("Failed to resolve {}:{}: {}", host, port, e))
    })?;

    let mut last_error = None;
    for addr in addrs {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        };
        let attempt = async {
            let socket = socket?;
            socket.set_send_buffer_size(send_buffer_size)?;
            socket.connect(addr).await
        };
        match attempt.await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!("Connection to {} failed: {}", addr, e);
                last_error = Some(e);
            }
        }
    }

    Err(DiscoveryError::TransportFailed(match last_error {
        Some(e) => format!("Failed to connect to {}:{}: {}", host, port, e),
        None => format!("{}:{} resolved to no addresses", host, port),
    }))
}

/// Keep a plain handle on the connected socket for the closing thread.
/// Must run inside the writer runtime.
fn split_control(stream: TcpStream) -> Result<(TcpStream, SocketAddr, std::net::TcpStream)> {
    let failed = |e: std::io::Error| {
        DiscoveryError::TransportFailed(format!("Failed to prepare socket: {}", e))
    };
    let peer = stream.peer_addr().map_err(failed)?;
    let stream = stream.into_std().map_err(failed)?;
    let control = stream.try_clone().map_err(failed)?;
    let stream = TcpStream::from_std(stream).map_err(failed)?;
    Ok((stream, peer, control))
}

fn write_loop(
    runtime: &Runtime,
    mut stream: TcpStream,
    queue: &Receiver<Bytes>,
    abort: &Receiver<()>,
    abort_write: &Notify,
    counters: &QueueCounters,
) -> WriterExit {
    loop {
        let mut buffer = match next_buffer(queue, abort) {
            Step::Abort => return force_drain(runtime, stream, None, queue, counters),
            Step::Ready(Some(buffer)) => buffer,
            // Queue closed and empty
            Step::Ready(None) => break,
        };

        match runtime.block_on(write_buffer(&mut stream, &mut buffer, abort_write, counters)) {
            Ok(Step::Ready(())) => {
                counters.written.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Step::Abort) => return force_drain(runtime, stream, Some(buffer), queue, counters),
            Err(e) => return WriterExit::Failed(e),
        }
    }

    if let Err(e) = runtime.block_on(stream.shutdown()) {
        warn!("Failed to close discovery socket: {}", e);
    }
    WriterExit::Drained { forced: 0 }
}

/// Wait for the head buffer; `None` once the queue is closed and empty
fn next_buffer(queue: &Receiver<Bytes>, abort: &Receiver<()>) -> Step<Option<Bytes>> {
    if abort.try_recv().is_ok() {
        return Step::Abort;
    }
    crossbeam_channel::select! {
        recv(abort) -> _ => Step::Abort,
        recv(queue) -> buffer => Step::Ready(buffer.ok()),
    }
}

/// Write `buffer` completely, advancing it past whatever was accepted
async fn write_buffer(
    stream: &mut TcpStream,
    buffer: &mut Bytes,
    abort: &Notify,
    counters: &QueueCounters,
) -> Result<Step<()>> {
    while buffer.has_remaining() {
        let ready = tokio::select! {
            biased;
            _ = abort.notified() => return Ok(Step::Abort),
            ready = stream.writable() => ready,
        };
        ready.map_err(|e| {
            DiscoveryError::TransportFailed(format!("Readiness wait failed: {}", e))
        })?;

        match stream.try_write(buffer.chunk()) {
            Ok(0) => {
                return Err(DiscoveryError::TransportFailed(
                    "Connection is closed".to_string(),
                ))
            }
            Ok(n) => {
                buffer.advance(n);
                counters.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => {
                return Err(DiscoveryError::TransportFailed(format!(
                    "Socket write failed: {}",
                    e
                )))
            }
        }
    }
    Ok(Step::Ready(()))
}

/// Write what is left in blocking mode, without readiness waits
fn force_drain(
    runtime: &Runtime,
    stream: TcpStream,
    pending: Option<Bytes>,
    queue: &Receiver<Bytes>,
    counters: &QueueCounters,
) -> WriterExit {
    let failed = |e: std::io::Error| {
        WriterExit::Failed(DiscoveryError::TransportFailed(format!(
            "Forced write failed: {}",
            e
        )))
    };

    let stream = {
        let _guard = runtime.enter();
        stream.into_std()
    };
    let mut stream = match stream.and_then(|s| s.set_nonblocking(false).map(|()| s)) {
        Ok(stream) => stream,
        Err(e) => return failed(e),
    };

    let mut forced = 0usize;
    for buffer in pending.into_iter().chain(queue.try_iter()) {
        if let Err(e) = stream.write_all(&buffer) {
            return failed(e);
        }
        counters
            .bytes_written
            .fetch_add(buffer.len() as u64, Ordering::Relaxed);
        counters.written.fetch_add(1, Ordering::Relaxed);
        forced += 1;
    }
    if let Err(e) = stream.flush() {
        return failed(e);
    }

    if let Err(e) = stream.shutdown(Shutdown::Write) {
        warn!("Failed to close discovery socket: {}", e);
    }
    WriterExit::Drained { forced }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::wire::{WireMessage, WIRE_VERSION};
    use std::io::Read;
    use std::net::TcpListener;
    use std::thread;

    /// Accepts one connection and returns everything read until EOF,
    /// optionally waiting before the first read
    fn spawn_reader(delay: Duration) -> (SocketConfig, thread::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            thread::sleep(delay);
            let mut received = Vec::new();
            stream.read_to_end(&mut received).unwrap();
            received
        });
        (SocketConfig::new("127.0.0.1", port), handle)
    }

    #[test]
    fn test_handshake_and_finish() {
        let (config, reader) = spawn_reader(Duration::ZERO);
        let mut sink = SocketSink::connect(&config).unwrap();
        assert!(!sink.is_seekable());
        sink.shutdown().unwrap();

        let received = reader.join().unwrap();
        assert_eq!(received, vec![kinds::START, WIRE_VERSION, kinds::FINISHED]);
        assert!(sink.is_closed());
    }

    #[test]
    fn test_messages_arrive_in_order() {
        let (config, reader) = spawn_reader(Duration::ZERO);
        let mut sink = SocketSink::connect(&config).unwrap();

        let messages: Vec<WireMessage> = (0..25)
            .map(|i| WireMessage::TestFinished {
                test: format!("Suite.test{}", i),
                classes: vec![(format!("Class{}", i), vec!["run".to_string()])],
            })
            .collect();
        for message in &messages {
            sink.send(message.to_bytes().unwrap()).unwrap();
        }
        sink.shutdown().unwrap();

        let decoded = WireMessage::decode_all(&reader.join().unwrap()).unwrap();
        assert_eq!(decoded.len(), messages.len() + 2);
        assert_eq!(decoded[0], WireMessage::Start { version: 1 });
        assert_eq!(&decoded[1..26], &messages[..]);
        assert_eq!(decoded[26], WireMessage::Finished);
    }

    #[test]
    fn test_slow_reader_applies_backpressure_without_loss() {
        let (mut config, reader) = spawn_reader(Duration::from_millis(300));
        config.queue_capacity = 2;
        let mut sink = SocketSink::connect(&config).unwrap();

        let chunk = 256 * 1024;
        for i in 0..40u8 {
            sink.write_all(&vec![i; chunk]).unwrap();
        }
        sink.close().unwrap();

        let stats = sink.stats();
        assert!(stats.blocked > 0, "producer never waited: {:?}", stats);
        assert_eq!(stats.written, stats.enqueued);

        let received = reader.join().unwrap();
        assert_eq!(received.len(), 2 + 40 * chunk + 1);
        for i in 0..40usize {
            let start = 2 + i * chunk;
            assert!(received[start..start + chunk].iter().all(|&b| b == i as u8));
        }
        assert_eq!(received[received.len() - 1], kinds::FINISHED);
    }

    #[test]
    fn test_forced_drain_delivers_everything() {
        // The reader sleeps through the first shutdown window, so the writer
        // is aborted and writes the leftovers in blocking mode
        let (mut config, reader) = spawn_reader(Duration::from_millis(300));
        config.queue_capacity = 8;
        let mut sink = SocketSink::connect(&config).unwrap();
        sink.set_shutdown_timeout(Duration::from_millis(250));

        let chunk = 512 * 1024;
        for i in 0..6u8 {
            sink.write_all(&vec![i; chunk]).unwrap();
        }
        sink.close().unwrap();

        let stats = sink.stats();
        assert_eq!(stats.written, stats.enqueued);

        let received = reader.join().unwrap();
        assert_eq!(received.len(), 2 + 6 * chunk + 1);
        for i in 0..6usize {
            let start = 2 + i * chunk;
            assert!(received[start..start + chunk].iter().all(|&b| b == i as u8));
        }
        assert_eq!(received[received.len() - 1], kinds::FINISHED);
    }

    #[test]
    fn test_stuck_peer_does_not_hold_up_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
        let peer = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            // Never reads; holds the connection open until released
            let _ = release_rx.recv();
            drop(stream);
        });

        let mut config = SocketConfig::new("127.0.0.1", port);
        config.queue_capacity = 32;
        let mut sink = SocketSink::connect(&config).unwrap();
        sink.set_shutdown_timeout(Duration::from_millis(100));

        let chunk = 1024 * 1024;
        for i in 0..16u8 {
            sink.write_all(&vec![i; chunk]).unwrap();
        }

        let started = std::time::Instant::now();
        sink.close().unwrap();
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "close took {:?}",
            started.elapsed()
        );
        assert!(sink.is_closed());

        let stats = sink.stats();
        assert!(stats.written < stats.enqueued, "{:?}", stats);

        release_tx.send(()).unwrap();
        peer.join().unwrap();
    }

    #[tokio::test]
    async fn test_connect_and_close_inside_async_runtime() {
        let (config, reader) = spawn_reader(Duration::ZERO);
        let mut sink = SocketSink::connect(&config).unwrap();

        let message = WireMessage::TestFinished {
            test: "Suite.async".to_string(),
            classes: vec![("Worker".to_string(), vec!["poll".to_string()])],
        };
        sink.send(message.to_bytes().unwrap()).unwrap();
        sink.shutdown().unwrap();

        let decoded = WireMessage::decode_all(&reader.join().unwrap()).unwrap();
        assert_eq!(
            decoded,
            vec![WireMessage::Start { version: 1 }, message, WireMessage::Finished]
        );
    }

    #[test]
    fn test_send_after_close_is_rejected() {
        let (config, reader) = spawn_reader(Duration::ZERO);
        let mut sink = SocketSink::connect(&config).unwrap();
        sink.close().unwrap();
        sink.close().unwrap();
        assert!(matches!(
            sink.send(Bytes::from_static(b"late")),
            Err(DiscoveryError::SessionClosed)
        ));
        reader.join().unwrap();
    }

    #[test]
    fn test_connection_refused() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let result = SocketSink::connect(&SocketConfig::new("127.0.0.1", port));
        assert!(matches!(result, Err(DiscoveryError::TransportFailed(_))));
    }

    #[test]
    fn test_missing_port() {
        let result = SocketSink::connect(&SocketConfig::default());
        assert!(matches!(result, Err(DiscoveryError::ConfigError(_))));
    }

    #[test]
    fn test_peer_disconnect_is_transport_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let acceptor = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });

        let mut sink = SocketSink::connect(&SocketConfig::new("127.0.0.1", port)).unwrap();
        acceptor.join().unwrap();

        let mut failed = false;
        for _ in 0..200 {
            if sink.write_all(&vec![0u8; 64 * 1024]).is_err() {
                failed = true;
                break;
            }
        }
        let closed = sink.close();
        assert!(failed || closed.is_err());
        if let Err(e) = closed {
            assert!(e.is_fatal());
        }
    }
}
