//! One TCP connection to a remote overlay node.
//!
//! [`TcpPeer`] owns a single socket and everything that moves through it:
//!
//! - an outbound FIFO queue feeding exactly one in-flight write at a time,
//!   with queue-delay and write-delay instrumentation per message
//! - a read loop that drains already-buffered frames before returning to the
//!   scheduler, bounded by a yield budget so one busy connection cannot
//!   starve the rest
//! - a lifecycle state machine (`Connecting -> Connected -> GotAuth ->
//!   Closing`) and a two-step graceful teardown (FIN, then close) that can
//!   wait for the write queue to drain
//!
//! The peer talks upward through the [`PeerHub`] seam and holds it weakly;
//! the hub owns its peers, never the reverse. Every spawned task (dial, read
//! loop, write pump, idle timer, shutdown sequence) captures a strong `Arc`
//! to the peer, which is what keeps it alive while I/O is in flight.

use crate::{
    codec::MessageCodec,
    message::{self, AuthenticatedEnvelope, ErrorCode, ErrorMessage, NodeMessage},
    metrics::OverlayMetrics,
    OverlayConfig, OverlayError, PeerAddress, PeerHub, Result,
};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex as TokioMutex, OwnedMutexGuard};
use tokio::time::timeout;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use vela_common::YieldTimer;

/// Userspace buffering per direction (256 KiB).
///
/// The write half sits behind a `BufWriter` of this size; the read loop
/// reserves its receive buffer in steps of this size, so one socket read can
/// pull in many small frames at once.
pub const BUFSZ: usize = 0x40000;

type SocketWriter = BufWriter<OwnedWriteHalf>;

/// Lifecycle state of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Outbound dial still in progress.
    Connecting,
    /// Socket is up; handshake not yet complete.
    Connected,
    /// Handshake complete; full-size frames accepted.
    GotAuth,
    /// Terminal: teardown has begun.
    Closing,
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PeerState::Connecting => "connecting",
            PeerState::Connected => "connected",
            PeerState::GotAuth => "authenticated",
            PeerState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Direction of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDirection {
    /// We initiated the connection.
    Outbound,
    /// The peer connected to us.
    Inbound,
}

impl ConnectionDirection {
    /// Returns true if we initiated this connection.
    pub fn we_called_remote(&self) -> bool {
        matches!(self, ConnectionDirection::Outbound)
    }
}

impl std::fmt::Display for ConnectionDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionDirection::Outbound => f.write_str("outbound"),
            ConnectionDirection::Inbound => f.write_str("inbound"),
        }
    }
}

/// Who ended the connection, for drop logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropDirection {
    /// We decided to drop the remote.
    WeDroppedRemote,
    /// The remote dropped us (error or disconnect observed locally).
    RemoteDroppedUs,
}

/// Whether a drop waits for the outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropMode {
    /// Tear down now; queued messages past the in-flight one are abandoned.
    IgnoreWriteQueue,
    /// Let the write pump drain the queue, then tear down.
    KeepWriteQueue,
}

/// One outbound message with its write-pipeline timestamps.
struct TimestampedMessage {
    frame: Bytes,
    enqueued: Instant,
    issued: Option<Instant>,
    completed: Option<Instant>,
}

impl TimestampedMessage {
    fn new(frame: Bytes) -> Self {
        Self {
            frame,
            enqueued: Instant::now(),
            issued: None,
            completed: None,
        }
    }

    fn record_write_timing(&self, metrics: &OverlayMetrics) {
        if let (Some(issued), Some(completed)) = (self.issued, self.completed) {
            metrics.write_queue_delay.record(issued - self.enqueued);
            metrics.async_write_delay.record(completed - issued);
        }
    }
}

/// State machine shared by the peer's tasks. Never held across an await.
struct PeerInner {
    state: PeerState,
    write_queue: VecDeque<TimestampedMessage>,
    /// True iff a write pump task is armed.
    writing: bool,
    /// Shutdown deferred until the write queue drains.
    delayed_shutdown: bool,
    /// Shutdown already queued; second schedule is a bug.
    shutdown_scheduled: bool,
    last_read: Instant,
    last_write: Instant,
    /// Last time the write queue was observed empty while the pump was armed.
    last_empty: Instant,
}

/// A peer reached over a TCP socket.
///
/// Created by [`initiate`](TcpPeer::initiate) (outbound) or
/// [`accept`](TcpPeer::accept) (inbound); terminated by
/// [`drop_peer`](TcpPeer::drop_peer).
pub struct TcpPeer {
    direction: ConnectionDirection,
    remote_addr: SocketAddr,
    config: OverlayConfig,
    metrics: Arc<OverlayMetrics>,
    hub: Weak<dyn PeerHub>,
    inner: Mutex<PeerInner>,
    /// The buffered write half. `None` before an outbound dial completes and
    /// again after shutdown step 2 releases the descriptor.
    writer: Arc<TokioMutex<Option<SocketWriter>>>,
    /// Cancelled when shutdown is scheduled; stops the idle timer and the
    /// read loop.
    teardown: CancellationToken,
}

impl std::fmt::Display for TcpPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} peer {}", self.direction, self.remote_addr)
    }
}

impl std::fmt::Debug for TcpPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpPeer")
            .field("direction", &self.direction)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

impl TcpPeer {
    fn new(
        direction: ConnectionDirection,
        remote_addr: SocketAddr,
        config: OverlayConfig,
        hub: Weak<dyn PeerHub>,
        metrics: Arc<OverlayMetrics>,
        writer: Option<SocketWriter>,
        state: PeerState,
    ) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            direction,
            remote_addr,
            config,
            metrics,
            hub,
            inner: Mutex::new(PeerInner {
                state,
                write_queue: VecDeque::new(),
                writing: false,
                delayed_shutdown: false,
                shutdown_scheduled: false,
                last_read: now,
                last_write: now,
                last_empty: now,
            }),
            writer: Arc::new(TokioMutex::new(writer)),
            teardown: CancellationToken::new(),
        })
    }

    /// Creates an outbound peer and starts dialing.
    ///
    /// The handle is returned immediately in [`PeerState::Connecting`]; the
    /// dial proceeds on a background task and the hub hears about the
    /// outcome through [`PeerHub::connected`] or [`PeerHub::remove_peer`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidPeerAddress` unless the host is an IPv4 literal.
    pub fn initiate(
        config: OverlayConfig,
        hub: &Arc<dyn PeerHub>,
        metrics: Arc<OverlayMetrics>,
        address: &PeerAddress,
    ) -> Result<Arc<Self>> {
        let ip: Ipv4Addr = address.host.parse().map_err(|_| {
            OverlayError::InvalidPeerAddress(format!(
                "outbound connections require an IPv4 address, got {}",
                address.host
            ))
        })?;
        let remote_addr = SocketAddr::from((ip, address.port));
        debug!(%remote_addr, "initiating outbound connection");

        let peer = Self::new(
            ConnectionDirection::Outbound,
            remote_addr,
            config,
            Arc::downgrade(hub),
            metrics,
            None,
            PeerState::Connecting,
        );
        peer.start_idle_timer();

        let dial = Arc::clone(&peer);
        tokio::spawn(async move {
            let connect_timeout = Duration::from_secs(dial.config.connect_timeout_secs);
            let result = match timeout(connect_timeout, TcpStream::connect(dial.remote_addr)).await
            {
                Ok(Ok(stream)) => Ok(stream),
                Ok(Err(e)) => Err(OverlayError::ConnectionFailed(format!(
                    "{}: {}",
                    dial.remote_addr, e
                ))),
                Err(_) => Err(OverlayError::ConnectionTimeout(dial.remote_addr.to_string())),
            };
            dial.connect_handler(result).await;
        });
        Ok(peer)
    }

    /// Creates an inbound peer from an accepted socket and starts reading.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if socket option setup fails, in which case no
    /// peer exists.
    pub fn accept(
        config: OverlayConfig,
        hub: &Arc<dyn PeerHub>,
        metrics: Arc<OverlayMetrics>,
        socket: TcpStream,
    ) -> Result<Arc<Self>> {
        socket.set_nodelay(true)?;
        let remote_addr = socket.peer_addr()?;
        debug!(%remote_addr, "accepted inbound connection");

        let (read_half, write_half) = socket.into_split();
        let peer = Self::new(
            ConnectionDirection::Inbound,
            remote_addr,
            config,
            Arc::downgrade(hub),
            metrics,
            Some(BufWriter::with_capacity(BUFSZ, write_half)),
            PeerState::Connected,
        );
        peer.start_idle_timer();
        peer.start_read(read_half);
        Ok(peer)
    }

    /// Direction of this connection.
    pub fn direction(&self) -> ConnectionDirection {
        self.direction
    }

    /// Remote endpoint.
    pub fn remote_address(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Remote IP as a string.
    pub fn remote_ip(&self) -> String {
        self.remote_addr.ip().to_string()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PeerState {
        self.inner.lock().state
    }

    /// True while the socket is usable.
    pub fn is_connected(&self) -> bool {
        matches!(self.state(), PeerState::Connected | PeerState::GotAuth)
    }

    /// True once the handshake outcome has been recorded.
    pub fn is_authenticated(&self) -> bool {
        self.state() == PeerState::GotAuth
    }

    /// True once teardown has begun; handlers observing this stop issuing
    /// I/O.
    pub fn should_abort(&self) -> bool {
        self.state() == PeerState::Closing
    }

    /// Records a completed handshake, raising the inbound size limit.
    pub fn mark_authenticated(&self) {
        let mut inner = self.inner.lock();
        if inner.state == PeerState::Connected {
            inner.state = PeerState::GotAuth;
        }
    }

    /// Queues a serialized message for transmission.
    ///
    /// Messages go out in enqueue order. Sending on a closing peer is a
    /// caller bug: the message is discarded with an error log and state is
    /// left untouched.
    pub fn send_message(self: &Arc<Self>, payload: Bytes) {
        trace!(peer = %self, len = payload.len(), "send_message");

        let frame = match MessageCodec::encode_frame(&payload) {
            Ok(frame) => frame,
            Err(e) => {
                error!(peer = %self, error = %e, "refusing to queue message");
                return;
            }
        };

        let held = {
            let mut inner = self.inner.lock();
            if inner.state == PeerState::Closing {
                error!(peer = %self, "attempt to send a message after drop; this is a bug");
                return;
            }
            inner.write_queue.push_back(TimestampedMessage::new(frame));
            if inner.writing {
                return;
            }
            inner.writing = true;
            inner.last_empty = Instant::now();
            // Claim the writer before any concurrently scheduled teardown
            // can, so the first write keeps its place in line.
            self.writer.clone().try_lock_owned().ok()
        };

        let pump = Arc::clone(self);
        tokio::spawn(async move { pump.message_sender(held).await });
    }

    /// Serializes an envelope and queues it for transmission.
    pub fn send_envelope(self: &Arc<Self>, envelope: &AuthenticatedEnvelope) -> Result<()> {
        let bytes = message::encode_envelope(envelope)?;
        self.send_message(bytes);
        Ok(())
    }

    /// Queues a last-gasp error message, then drops the peer.
    ///
    /// The teardown's flush-then-FIN gives the error frame a chance to reach
    /// the wire before the descriptor goes away.
    pub fn send_error_and_drop(self: &Arc<Self>, code: ErrorCode, text: &str, mode: DropMode) {
        let envelope = AuthenticatedEnvelope::unauthenticated(NodeMessage::Error(ErrorMessage {
            code,
            message: text.to_string(),
        }));
        if let Err(e) = self.send_envelope(&envelope) {
            warn!(peer = %self, error = %e, "failed to queue error message");
        }
        self.drop_peer(text, DropDirection::WeDroppedRemote, mode);
    }

    /// Terminates the peer. Idempotent: a second call is a no-op.
    ///
    /// Transitions to [`PeerState::Closing`], removes the peer from the hub,
    /// and either runs the shutdown sequence now (`IgnoreWriteQueue`, or no
    /// write armed) or leaves a flag for the write pump to run it once the
    /// queue drains (`KeepWriteQueue`).
    pub fn drop_peer(self: &Arc<Self>, reason: &str, direction: DropDirection, mode: DropMode) {
        let shutdown_now = {
            let mut inner = self.inner.lock();
            if inner.state == PeerState::Closing {
                return;
            }

            if inner.state != PeerState::GotAuth {
                debug!(peer = %self, state = %inner.state, reason, "dropping peer");
            } else if direction == DropDirection::WeDroppedRemote {
                info!(peer = %self, reason, "dropping peer");
            } else {
                info!(peer = %self, reason, "peer dropped us");
            }

            inner.state = PeerState::Closing;
            let now = mode == DropMode::IgnoreWriteQueue || !inner.writing;
            if !now {
                // The pump consumes this once the queue drains.
                inner.delayed_shutdown = true;
            }
            now
        };

        if let Some(hub) = self.hub.upgrade() {
            hub.remove_peer(self);
        }
        if shutdown_now {
            self.shutdown();
        }
    }

    /// Schedules the two-step socket teardown. Guarded against double
    /// scheduling; the second call is an internal bug.
    fn shutdown(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            if inner.shutdown_scheduled {
                error!(peer = %self, "shutdown scheduled twice; this is a bug");
                return;
            }
            inner.shutdown_scheduled = true;
        }

        // Stops the idle timer and the read loop.
        self.teardown.cancel();

        let peer = Arc::clone(self);
        tokio::spawn(async move {
            // Step 1: flush whatever is buffered and push a FIN. A
            // well-behaved remote gets to observe the disconnect, and read
            // any last error frame, before the descriptor goes away. No ACK
            // is awaited; the remote may be hostile or unresponsive.
            {
                let mut guard = peer.writer.lock().await;
                if let Some(writer) = guard.as_mut() {
                    if let Err(e) = writer.shutdown().await {
                        debug!(peer = %peer, error = %e, "socket shutdown failed");
                    }
                }
            }

            // Step 2, on a later scheduler turn so completions already in
            // line fire first: release the write half. The descriptor closes
            // once the read loop has let go of its half as well; anything
            // still waiting on the writer observes it gone and stops.
            tokio::task::yield_now().await;
            peer.writer.lock().await.take();
        });
    }

    /// The write pump: drains the queue one frame at a time, exactly one
    /// write in flight, then flushes.
    ///
    /// `held` is the writer guard pre-claimed by the arming `send_message`,
    /// if it won the race for it. The guard is released and re-acquired
    /// between steps, so a shutdown requested mid-chain waits only for the
    /// in-flight write, then takes the socket ahead of the rest of the
    /// queue.
    async fn message_sender(
        self: Arc<Self>,
        mut held: Option<OwnedMutexGuard<Option<SocketWriter>>>,
    ) {
        loop {
            // Stamp and copy the head frame without popping it; the queue
            // keeps the buffer alive for the duration of the write.
            let front = {
                let mut inner = self.inner.lock();
                match inner.write_queue.front_mut() {
                    Some(msg) => {
                        msg.issued = Some(Instant::now());
                        Some(msg.frame.clone())
                    }
                    None => {
                        inner.last_empty = Instant::now();
                        None
                    }
                }
            };

            let mut guard = match held.take() {
                Some(guard) => guard,
                None => self.writer.clone().lock_owned().await,
            };
            let Some(writer) = guard.as_mut() else {
                // No socket: either the dial has not finished (the connect
                // handler re-arms us) or teardown released it.
                let run_shutdown = {
                    let mut inner = self.inner.lock();
                    inner.writing = false;
                    std::mem::take(&mut inner.delayed_shutdown)
                };
                if run_shutdown {
                    self.shutdown();
                }
                return;
            };

            match front {
                Some(frame) => {
                    let result = writer.write_all(&frame).await.map(|()| frame.len());
                    drop(guard);

                    self.write_handler(&result);
                    {
                        let mut inner = self.inner.lock();
                        if let Some(mut msg) = inner.write_queue.pop_front() {
                            msg.completed = Some(Instant::now());
                            msg.record_write_timing(&self.metrics);
                        }
                    }
                    if result.is_err() {
                        return;
                    }
                }
                None => {
                    let result = writer.flush().await.map(|()| 0);
                    drop(guard);

                    self.write_handler(&result);
                    if result.is_err() {
                        return;
                    }
                    let run_shutdown = {
                        let mut inner = self.inner.lock();
                        if !inner.write_queue.is_empty() {
                            // More arrived while flushing; keep pumping.
                            continue;
                        }
                        inner.writing = false;
                        inner.delayed_shutdown
                    };
                    if run_shutdown {
                        self.shutdown();
                    }
                    return;
                }
            }
        }
    }

    /// Write completion accounting and error disposition.
    fn write_handler(self: &Arc<Self>, result: &std::io::Result<usize>) {
        self.inner.lock().last_write = Instant::now();

        match result {
            Err(e) => {
                if self.is_connected() {
                    // Errors during shutdown or connection are expected and
                    // stay quiet; an established peer failing is worth noise.
                    self.metrics.errors_write.inc();
                    error!(peer = %self, error = %e, "error during write");
                }
                if self.inner.lock().delayed_shutdown {
                    self.shutdown();
                } else {
                    self.drop_peer(
                        "error during write",
                        DropDirection::WeDroppedRemote,
                        DropMode::IgnoreWriteQueue,
                    );
                }
            }
            Ok(n) if *n > 0 => {
                self.metrics.messages_written.inc();
                self.metrics.bytes_written.add(*n as u64);
            }
            Ok(_) => {}
        }
    }

    /// Outcome of the background dial for an outbound peer.
    async fn connect_handler(self: &Arc<Self>, result: Result<TcpStream>) {
        if self.should_abort() {
            // Dropped while the dial was in flight.
            return;
        }

        let result = match result {
            Ok(stream) => match stream.set_nodelay(true) {
                Ok(()) => Ok(stream),
                Err(e) => Err(OverlayError::Io(e)),
            },
            Err(e) => Err(e),
        };

        match result {
            Ok(stream) => {
                debug!(peer = %self, "connected");
                let (read_half, write_half) = stream.into_split();
                {
                    let mut guard = self.writer.lock().await;
                    let mut inner = self.inner.lock();
                    if inner.state == PeerState::Closing {
                        // A drop won the race while the dial was finishing.
                        return;
                    }
                    *guard = Some(BufWriter::with_capacity(BUFSZ, write_half));
                    inner.state = PeerState::Connected;
                }

                // Re-arm the pump for anything queued before the socket
                // existed.
                let arm = {
                    let mut inner = self.inner.lock();
                    if !inner.write_queue.is_empty() && !inner.writing {
                        inner.writing = true;
                        inner.last_empty = Instant::now();
                        true
                    } else {
                        false
                    }
                };
                if arm {
                    let pump = Arc::clone(self);
                    tokio::spawn(async move { pump.message_sender(None).await });
                }

                if let Some(hub) = self.hub.upgrade() {
                    hub.connected(self).await;
                }
                self.start_read(read_half);
            }
            Err(e) => {
                debug!(peer = %self, error = %e, "connect failed");
                self.drop_peer(
                    "failed to connect",
                    DropDirection::WeDroppedRemote,
                    DropMode::IgnoreWriteQueue,
                );
            }
        }
    }

    fn start_read(self: &Arc<Self>, read_half: OwnedReadHalf) {
        let peer = Arc::clone(self);
        tokio::spawn(async move { peer.read_loop(read_half).await });
    }

    /// The read loop: drain buffered frames, then await the socket.
    ///
    /// A burst often leaves several complete frames in the receive buffer
    /// after one socket read; digesting them without returning to the
    /// scheduler saves a wakeup per frame. The yield budget caps how long
    /// one pass may run, and at least one frame is processed per pass so a
    /// tiny budget still makes progress.
    async fn read_loop(self: Arc<Self>, mut read_half: OwnedReadHalf) {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::with_capacity(BUFSZ);
        let yield_budget = Duration::from_millis(self.config.yield_budget_ms);

        loop {
            if self.should_abort() {
                return;
            }

            let yt = YieldTimer::start(yield_budget);
            let mut need_more = false;
            loop {
                if self.should_abort() {
                    return;
                }
                codec.set_authenticated(self.is_authenticated());
                match codec.decode(&mut buf) {
                    Ok(Some(body)) => {
                        self.received_bytes(0, true);
                        self.recv_message(body).await;
                    }
                    Ok(None) => {
                        need_more = true;
                        break;
                    }
                    Err(e) => {
                        // Size-limit violations land here; always metered.
                        self.metrics.errors_read.inc();
                        error!(peer = %self, error = %e, "rejecting inbound frame");
                        self.drop_peer(
                            "error during read",
                            DropDirection::WeDroppedRemote,
                            DropMode::IgnoreWriteQueue,
                        );
                        return;
                    }
                }
                if !yt.should_keep_going() {
                    break;
                }
            }

            if !need_more {
                // Budget spent with frames possibly still buffered; give
                // other tasks a turn and keep draining.
                tokio::task::yield_now().await;
                continue;
            }

            self.metrics.async_reads.inc();
            buf.reserve(BUFSZ);
            tokio::select! {
                _ = self.teardown.cancelled() => return,
                result = read_half.read_buf(&mut buf) => match result {
                    Ok(0) => {
                        self.read_error_handler(&OverlayError::PeerDisconnected(
                            "connection closed by remote".to_string(),
                        ));
                        return;
                    }
                    Ok(n) => self.received_bytes(n, false),
                    Err(e) => {
                        self.read_error_handler(&OverlayError::Io(e));
                        return;
                    }
                },
            }
        }
    }

    /// Read failure disposition.
    fn read_error_handler(self: &Arc<Self>, error: &OverlayError) {
        if self.is_connected() {
            // Errors during shutdown or connection are expected and stay
            // quiet.
            self.metrics.errors_read.inc();
            debug!(peer = %self, error = %error, "error during read");
        }
        self.drop_peer(
            "error during read",
            DropDirection::WeDroppedRemote,
            DropMode::IgnoreWriteQueue,
        );
    }

    /// Records receive progress for metrics and the idle clock.
    ///
    /// `byte_count` is the number of newly received bytes; a completed
    /// message's bytes were already reported as they arrived, so frame
    /// completion passes zero.
    fn received_bytes(&self, byte_count: usize, completed_message: bool) {
        if byte_count > 0 {
            self.metrics.bytes_read.add(byte_count as u64);
        }
        if completed_message {
            self.metrics.messages_read.inc();
        }
        self.inner.lock().last_read = Instant::now();
    }

    /// Deserializes an assembled frame and hands it to the hub.
    ///
    /// A body that fails to deserialize is the one protocol-level error the
    /// remote gets told about before being dropped.
    async fn recv_message(self: &Arc<Self>, body: Bytes) {
        match message::decode_envelope(&body) {
            Ok(envelope) => {
                if let Some(hub) = self.hub.upgrade() {
                    if let Err(e) = hub.recv_message(self, envelope).await {
                        warn!(peer = %self, error = %e, "message handler failed");
                    }
                }
            }
            Err(e) => {
                error!(peer = %self, error = %e, "received corrupt envelope");
                self.send_error_and_drop(
                    ErrorCode::Data,
                    "received corrupt envelope",
                    DropMode::IgnoreWriteQueue,
                );
            }
        }
    }

    /// Watches for read/write progress drying up.
    ///
    /// Two conditions end the peer: no progress at all for the idle timeout,
    /// or a write queue that stays armed without draining for the straggler
    /// timeout (the remote reads too slowly to keep up).
    fn start_idle_timer(self: &Arc<Self>) {
        let peer = Arc::clone(self);
        tokio::spawn(async move {
            let idle_timeout = Duration::from_secs(peer.config.idle_timeout_secs);
            let straggler_timeout = Duration::from_secs(peer.config.straggler_timeout_secs);
            let check_every = (idle_timeout / 2).max(Duration::from_millis(50));

            loop {
                tokio::select! {
                    _ = peer.teardown.cancelled() => return,
                    _ = tokio::time::sleep(check_every) => {}
                }
                if peer.should_abort() {
                    return;
                }

                let (idle_for, straggling_for) = {
                    let inner = peer.inner.lock();
                    (
                        inner.last_read.max(inner.last_write).elapsed(),
                        if inner.writing {
                            Some(inner.last_empty.elapsed())
                        } else {
                            None
                        },
                    )
                };

                if idle_for >= idle_timeout {
                    peer.metrics.timeouts_idle.inc();
                    warn!(peer = %peer, ?idle_for, "idle timeout");
                    peer.drop_peer(
                        "idle timeout",
                        DropDirection::WeDroppedRemote,
                        DropMode::IgnoreWriteQueue,
                    );
                    return;
                }
                if straggling_for.is_some_and(|d| d >= straggler_timeout) {
                    peer.metrics.timeouts_straggler.inc();
                    warn!(peer = %peer, "straggler timeout");
                    peer.drop_peer(
                        "straggling (write queue not draining)",
                        DropDirection::WeDroppedRemote,
                        DropMode::IgnoreWriteQueue,
                    );
                    return;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_roles() {
        assert!(ConnectionDirection::Outbound.we_called_remote());
        assert!(!ConnectionDirection::Inbound.we_called_remote());
    }

    #[test]
    fn state_display() {
        assert_eq!(PeerState::Connecting.to_string(), "connecting");
        assert_eq!(PeerState::GotAuth.to_string(), "authenticated");
    }

    #[test]
    fn timestamped_message_records_both_delays() {
        let metrics = OverlayMetrics::new();
        let mut msg = TimestampedMessage::new(Bytes::from_static(b"x"));
        msg.issued = Some(msg.enqueued + Duration::from_millis(5));
        msg.completed = Some(msg.enqueued + Duration::from_millis(8));
        msg.record_write_timing(&metrics);

        assert_eq!(metrics.write_queue_delay.count(), 1);
        assert_eq!(metrics.async_write_delay.count(), 1);
        assert_eq!(
            metrics.write_queue_delay.snapshot().max,
            Duration::from_millis(5)
        );
        assert_eq!(
            metrics.async_write_delay.snapshot().max,
            Duration::from_millis(3)
        );
    }

    #[test]
    fn unissued_message_records_nothing() {
        let metrics = OverlayMetrics::new();
        let msg = TimestampedMessage::new(Bytes::from_static(b"x"));
        msg.record_write_timing(&metrics);
        assert_eq!(metrics.write_queue_delay.count(), 0);
        assert_eq!(metrics.async_write_delay.count(), 0);
    }
}
