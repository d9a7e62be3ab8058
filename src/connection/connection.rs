//! The connection core: message I/O, control handling, close handshake.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::SystemTime;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::compression::DeflateContext;
use crate::config::Options;
use crate::connection::metadata::ConnectionInfo;
use crate::connection::{ConnectionState, Role};
use crate::error::{Error, Result};
use crate::message::{close_code, BodySender, Message};
use crate::protocol::frame::Frame;
use crate::protocol::opcode::OpCode;
use crate::protocol::parser::{FrameEvent, FrameParser};
use crate::protocol::utf8::Utf8Validator;
use crate::scheduler::Scheduler;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type CloseCallback = Box<dyn FnOnce(u16, &str) + Send>;

const READ_BUFFER_SIZE: usize = 8 * 1024;
const INCOMING_CHANNEL_CAPACITY: usize = 16;

/// Optional connection parameters known at handshake completion.
#[derive(Debug, Default)]
pub struct EndpointParams {
    /// Negotiated permessage-deflate context, if any.
    pub compression: Option<DeflateContext>,
    /// Local socket address, for [`Connection::info`].
    pub local_addr: Option<SocketAddr>,
    /// Remote socket address, for [`Connection::info`].
    pub remote_addr: Option<SocketAddr>,
    /// TLS protocol description when the stream is encrypted.
    pub tls_protocol: Option<String>,
}

/// A WebSocket connection over an established byte stream.
///
/// `Connection` is a cheap-to-clone handle. The stream is owned by the
/// connection: a spawned reader task parses inbound frames, and every
/// outbound operation serializes through an internal writer lock so two
/// messages never interleave frames on the wire.
///
/// ## Example
///
/// ```rust,ignore
/// use wsio::{Connection, Options, Role, Scheduler};
///
/// let scheduler = Scheduler::new();
/// let conn = Connection::establish(stream, Role::Responder, Options::default(), &scheduler);
///
/// while let Some(mut msg) = conn.receive().await? {
///     let text = msg.text().await?;
///     conn.send(&text).await?;
/// }
/// ```
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("state", &self.inner.state())
            .finish()
    }
}

pub(crate) struct ConnectionInner {
    id: u64,
    role: Role,
    options: Options,
    scheduler: Scheduler,
    shared: StdMutex<Shared>,
    writer: Mutex<BoxedWriter>,
    compression: Option<StdMutex<DeflateContext>>,
    compression_rsv: u8,
    receiver: Mutex<mpsc::Receiver<Message>>,
    /// Signaled when the peer's close frame arrives (or can no longer
    /// arrive); releases the close-wait in `close`.
    close_wait: Notify,
    /// Signaled once on finalization; stops the reader task.
    closed_notify: Notify,
    window_bytes: AtomicU64,
    window_frames: AtomicU64,
}

struct Shared {
    state: ConnectionState,
    info: ConnectionInfo,
    peer_close_received: bool,
    finalized: bool,
    /// Body sender of the message currently in assembly, mirrored here so
    /// a close from another task can fail the in-flight body.
    assembly_tx: Option<BodySender>,
    on_close: Vec<CloseCallback>,
}

impl Connection {
    /// Wrap an established, already-upgraded byte stream in a connection.
    ///
    /// The stream must be connected and the opening handshake completed;
    /// the connection starts in the `Open` state, registers with the
    /// scheduler, and spawns its reader task. Must be called within a
    /// tokio runtime.
    pub fn establish<S>(stream: S, role: Role, options: Options, scheduler: &Scheduler) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::establish_with(stream, role, options, scheduler, EndpointParams::default())
    }

    /// Like [`Connection::establish`], with compression and peer metadata.
    pub fn establish_with<S>(
        stream: S,
        role: Role,
        options: Options,
        scheduler: &Scheduler,
        params: EndpointParams,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let id = scheduler.allocate_id();
        let (read, write) = tokio::io::split(stream);
        let read: BoxedReader = Box::new(read);
        let write: BoxedWriter = Box::new(write);

        let compression_rsv = params.compression.as_ref().map_or(0, DeflateContext::rsv_bit);
        let parser = FrameParser::new(role, &options, compression_rsv);

        let mut info = ConnectionInfo::new(id);
        info.local_addr = params.local_addr;
        info.remote_addr = params.remote_addr;
        info.tls_protocol = params.tls_protocol;

        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_CHANNEL_CAPACITY);

        let inner = Arc::new(ConnectionInner {
            id,
            role,
            options,
            scheduler: scheduler.clone(),
            shared: StdMutex::new(Shared {
                state: ConnectionState::Open,
                info,
                peer_close_received: false,
                finalized: false,
                assembly_tx: None,
                on_close: Vec::new(),
            }),
            writer: Mutex::new(write),
            compression: params.compression.map(StdMutex::new),
            compression_rsv,
            receiver: Mutex::new(incoming_rx),
            close_wait: Notify::new(),
            closed_notify: Notify::new(),
            window_bytes: AtomicU64::new(0),
            window_frames: AtomicU64::new(0),
        });

        scheduler.attach(&inner);
        tokio::spawn(run_reader(Arc::clone(&inner), read, parser, incoming_tx));
        debug!(id, role = %role, "connection established");

        Connection { inner }
    }

    /// Receive the next inbound message.
    ///
    /// Resolves as soon as a message's first frame arrives; the body can
    /// then be streamed from the returned [`Message`]. Returns `Ok(None)`
    /// once the connection has closed. Messages that arrived before the
    /// call are returned oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReceiveInProgress`] when another `receive` call is
    /// still pending; this is a usage error, not a connection failure.
    pub async fn receive(&self) -> Result<Option<Message>> {
        let mut rx = self
            .inner
            .receiver
            .try_lock()
            .map_err(|_| Error::ReceiveInProgress)?;
        Ok(rx.recv().await)
    }

    /// Send a text message. Returns the bytes written on the wire.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] when the connection is not open or the
    /// write fails (the failure also closes the connection).
    pub async fn send(&self, text: &str) -> Result<usize> {
        self.inner
            .send_data(Bytes::copy_from_slice(text.as_bytes()), false)
            .await
    }

    /// Send a binary message. Returns the bytes written on the wire.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] when the connection is not open or the
    /// write fails.
    pub async fn send_binary(&self, data: impl Into<Bytes>) -> Result<usize> {
        self.inner.send_data(data.into(), true).await
    }

    /// Stream a potentially large payload as fragmented frames.
    ///
    /// The source is read until EOF; every `stream_threshold` buffered
    /// bytes are flushed as a non-final frame. The payload is never
    /// compressed. Returns the bytes written on the wire.
    ///
    /// # Errors
    ///
    /// A source read error closes the connection with an
    /// unexpected-server-error code and is returned to the caller as
    /// [`Error::Io`]; a write error surfaces as [`Error::Closed`].
    pub async fn stream<R>(&self, source: R, binary: bool) -> Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        self.inner.stream(source, binary).await
    }

    /// Send a ping whose payload is the decimal serial of this ping.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] when the connection is not open.
    pub async fn ping(&self) -> Result<usize> {
        self.inner.ping().await
    }

    /// Initiate a graceful close with the given code and reason.
    ///
    /// Writes the close frame, waits up to `close_period` for the peer's
    /// close frame, then releases the stream. Calling close on an already
    /// closing or closed connection is a no-op returning 0.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` covers future transport
    /// surfacing.
    pub async fn close(&self, code: u16, reason: &str) -> Result<usize> {
        self.inner.close(code, reason).await
    }

    /// Register a callback invoked with the final (code, reason) after the
    /// connection closes. When already closed the callback runs
    /// immediately.
    pub fn on_close(&self, callback: impl FnOnce(u16, &str) + Send + 'static) {
        self.inner.on_close(Box::new(callback));
    }

    /// Unique connection id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Connection role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Whether the connection has not fully closed yet.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.state() != ConnectionState::Closed
    }

    /// Local socket address, when provided at establishment.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.shared.lock().unwrap().info.local_addr
    }

    /// Remote socket address, when provided at establishment.
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.shared.lock().unwrap().info.remote_addr
    }

    /// TLS protocol description, when provided at establishment.
    #[must_use]
    pub fn tls_protocol(&self) -> Option<String> {
        self.inner.shared.lock().unwrap().info.tls_protocol.clone()
    }

    /// Close code, once the connection is closing or closed.
    #[must_use]
    pub fn close_code(&self) -> Option<u16> {
        self.inner.shared.lock().unwrap().info.close_code
    }

    /// Close reason, once the connection is closing or closed.
    #[must_use]
    pub fn close_reason(&self) -> Option<String> {
        self.inner.shared.lock().unwrap().info.close_reason.clone()
    }

    /// Whether the peer initiated the close handshake.
    #[must_use]
    pub fn peer_initiated_close(&self) -> bool {
        self.inner.shared.lock().unwrap().info.peer_initiated_close
    }

    /// Snapshot of the connection statistics.
    #[must_use]
    pub fn info(&self) -> ConnectionInfo {
        self.inner.shared.lock().unwrap().info.clone()
    }
}

impl ConnectionInner {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn heartbeat_enabled(&self) -> bool {
        self.options.heartbeat_enabled
    }

    pub(crate) fn heartbeat_period(&self) -> std::time::Duration {
        self.options.heartbeat_period
    }

    pub(crate) fn queued_ping_limit(&self) -> u64 {
        self.options.queued_ping_limit
    }

    pub(crate) fn unanswered_pings(&self) -> u64 {
        self.shared.lock().unwrap().info.unanswered_pings()
    }

    pub(crate) fn reset_rate_window(&self) {
        self.window_bytes.store(0, Ordering::Relaxed);
        self.window_frames.store(0, Ordering::Relaxed);
    }

    fn state(&self) -> ConnectionState {
        self.shared.lock().unwrap().state
    }

    fn ensure_open(&self) -> Result<()> {
        let s = self.shared.lock().unwrap();
        if s.state == ConnectionState::Open {
            Ok(())
        } else {
            Err(Error::Closed {
                code: s.info.close_code.unwrap_or(close_code::NONE),
                reason: s.info.close_reason.clone().unwrap_or_default(),
            })
        }
    }

    /// OPEN -> CLOSING transition. Records the close metadata and returns
    /// false when a close is already under way.
    fn begin_close(&self, code: u16, reason: &str, peer_initiated: bool) -> bool {
        let mut s = self.shared.lock().unwrap();
        if s.state != ConnectionState::Open {
            return false;
        }
        s.state = ConnectionState::Closing;
        s.info.closed_at = Some(SystemTime::now());
        s.info.close_code = Some(code);
        s.info.close_reason = Some(reason.to_string());
        s.info.peer_initiated_close = peer_initiated;
        true
    }

    /// Fail the in-assembly message body, if one is open.
    fn fail_assembly(&self, code: u16, reason: &str) {
        let tx = self.shared.lock().unwrap().assembly_tx.take();
        if let Some(tx) = tx {
            let _ = tx.try_send(Err(Error::Closed {
                code,
                reason: reason.to_string(),
            }));
        }
    }

    /// CLOSING -> CLOSED: release the stream, deregister, fire callbacks.
    /// Idempotent.
    async fn finalize(&self) {
        let (code, reason, callbacks) = {
            let mut s = self.shared.lock().unwrap();
            if s.finalized {
                return;
            }
            s.finalized = true;
            s.state = ConnectionState::Closed;
            if s.info.closed_at.is_none() {
                s.info.closed_at = Some(SystemTime::now());
            }
            let code = s.info.close_code.unwrap_or(close_code::NONE);
            let reason = s.info.close_reason.clone().unwrap_or_default();
            (code, reason, std::mem::take(&mut s.on_close))
        };

        {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        }
        self.scheduler.detach(self.id);
        self.closed_notify.notify_waiters();
        self.close_wait.notify_one();
        debug!(id = self.id, code, reason = %reason, "connection closed");
        for callback in callbacks {
            callback(code, &reason);
        }
    }

    fn on_close(&self, callback: CloseCallback) {
        let mut s = self.shared.lock().unwrap();
        if s.finalized {
            let code = s.info.close_code.unwrap_or(close_code::NONE);
            let reason = s.info.close_reason.clone().unwrap_or_default();
            drop(s);
            callback(code, &reason);
        } else {
            s.on_close.push(callback);
        }
    }

    fn generate_mask(&self) -> Result<[u8; 4]> {
        let mut key = [0u8; 4];
        getrandom::getrandom(&mut key).map_err(|e| Error::Io(format!("mask RNG failure: {e}")))?;
        Ok(key)
    }

    /// Serialize one frame onto the wire. Caller holds the writer lock.
    async fn write_frame_locked(
        &self,
        writer: &mut BoxedWriter,
        frame: &Frame,
        is_data: bool,
    ) -> Result<usize> {
        let mask = if self.role.masks_payloads() {
            Some(self.generate_mask()?)
        } else {
            None
        };
        let wire = frame.encode(mask);
        writer.write_all(&wire).await?;
        writer.flush().await?;

        let mut s = self.shared.lock().unwrap();
        s.info.bytes_sent += wire.len() as u64;
        s.info.frames_sent += 1;
        let now = SystemTime::now();
        s.info.last_sent_at = Some(now);
        if is_data {
            s.info.last_data_sent_at = Some(now);
        }
        Ok(wire.len())
    }

    /// Write a single control frame through the outbound serialization.
    async fn write_control(&self, frame: Frame) -> Result<usize> {
        let mut writer = self.writer.lock().await;
        self.write_frame_locked(&mut writer, &frame, false).await
    }

    /// Map an outbound failure: close the connection and produce the
    /// `Closed` error handed to the caller.
    async fn write_failed(&self, err: Error) -> Error {
        let (code, reason) = if matches!(err, Error::Io(_)) {
            (close_code::ABNORMAL, "Writing to the client failed".to_string())
        } else {
            (err.close_code(), err.close_reason())
        };
        self.close_on_error(code, &reason).await;
        Error::Closed { code, reason }
    }

    /// Close without waiting for the peer's close frame. Used on outbound
    /// failures where the transport is suspect.
    async fn close_on_error(&self, code: u16, reason: &str) {
        if self.begin_close(code, reason, false) {
            self.fail_assembly(code, reason);
            let _ = self.write_control(Frame::close(code, reason)).await;
            self.finalize().await;
        }
    }

    fn compress_block(&self, data: &[u8], final_block: bool) -> Result<Vec<u8>> {
        let ctx = self
            .compression
            .as_ref()
            .expect("compress_block requires a compression context");
        ctx.lock().unwrap().compress(data, final_block)
    }

    fn decompress_message(&self, data: &[u8]) -> Result<Vec<u8>> {
        let ctx = self.compression.as_ref().ok_or_else(|| {
            Error::Protocol("Compressed frame without negotiated compression".into())
        })?;
        let plain = ctx.lock().unwrap().decompress(data, true)?;
        if plain.len() > self.options.message_size_limit {
            return Err(Error::MessageTooLarge {
                size: plain.len(),
                max: self.options.message_size_limit,
            });
        }
        Ok(plain)
    }

    async fn send_data(&self, payload: Bytes, binary: bool) -> Result<usize> {
        self.ensure_open()?;
        let mut writer = self.writer.lock().await;
        // State may have changed while waiting on the prior outbound op.
        self.ensure_open()?;

        match self.send_data_locked(&mut writer, payload, binary).await {
            Ok(total) => {
                drop(writer);
                let mut s = self.shared.lock().unwrap();
                s.info.messages_sent += 1;
                Ok(total)
            }
            Err(err) => {
                drop(writer);
                Err(self.write_failed(err).await)
            }
        }
    }

    async fn send_data_locked(
        &self,
        writer: &mut BoxedWriter,
        payload: Bytes,
        binary: bool,
    ) -> Result<usize> {
        let compress = !binary
            && self.compression.is_some()
            && payload.len() > self.options.compression_threshold;
        let opcode = if binary { OpCode::Binary } else { OpCode::Text };
        let split_threshold = self.options.frame_split_threshold.max(1);
        let mut total = 0;

        if payload.len() <= self.options.frame_split_threshold {
            let (body, rsv) = if compress {
                (Bytes::from(self.compress_block(&payload, true)?), self.compression_rsv)
            } else {
                (payload, 0)
            };
            total += self
                .write_frame_locked(writer, &Frame::new(true, rsv, opcode, body), true)
                .await?;
        } else {
            let len = payload.len();
            let mut offset = 0;
            let mut first = true;
            while offset < len {
                let end = (offset + split_threshold).min(len);
                let fin = end == len;
                let slice = payload.slice(offset..end);
                let body = if compress {
                    Bytes::from(self.compress_block(&slice, fin)?)
                } else {
                    slice
                };
                let rsv = if first && compress { self.compression_rsv } else { 0 };
                let op = if first { opcode } else { OpCode::Continuation };
                total += self
                    .write_frame_locked(writer, &Frame::new(fin, rsv, op, body), true)
                    .await?;
                first = false;
                offset = end;
            }
        }
        Ok(total)
    }

    async fn stream<R>(&self, mut source: R, binary: bool) -> Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        self.ensure_open()?;
        let mut writer = self.writer.lock().await;
        self.ensure_open()?;

        let opcode = if binary { OpCode::Binary } else { OpCode::Text };
        let threshold = self.options.stream_threshold.max(1);
        let mut pending = BytesMut::with_capacity(threshold);
        let mut read_buf = vec![0u8; READ_BUFFER_SIZE];
        let mut first = true;
        let mut total = 0;

        loop {
            let n = match source.read(&mut read_buf).await {
                Ok(n) => n,
                Err(e) => {
                    drop(writer);
                    let _ = self
                        .close(
                            close_code::UNEXPECTED_SERVER_ERROR,
                            "Error while reading the source stream",
                        )
                        .await;
                    return Err(Error::Io(e.to_string()));
                }
            };
            if n == 0 {
                break;
            }
            pending.extend_from_slice(&read_buf[..n]);

            while pending.len() >= threshold {
                let chunk = pending.split_to(threshold).freeze();
                let op = if first { opcode } else { OpCode::Continuation };
                first = false;
                match self
                    .write_frame_locked(&mut writer, &Frame::new(false, 0, op, chunk), true)
                    .await
                {
                    Ok(n) => total += n,
                    Err(e) => {
                        drop(writer);
                        return Err(self.write_failed(e).await);
                    }
                }
            }
        }

        let op = if first { opcode } else { OpCode::Continuation };
        match self
            .write_frame_locked(&mut writer, &Frame::new(true, 0, op, pending.freeze()), true)
            .await
        {
            Ok(n) => total += n,
            Err(e) => {
                drop(writer);
                return Err(self.write_failed(e).await);
            }
        }

        drop(writer);
        self.shared.lock().unwrap().info.messages_sent += 1;
        Ok(total)
    }

    pub(crate) async fn ping(&self) -> Result<usize> {
        self.ensure_open()?;
        let mut writer = self.writer.lock().await;
        self.ensure_open()?;

        let serial = {
            let mut s = self.shared.lock().unwrap();
            s.info.ping_count += 1;
            s.info.last_heartbeat_at = Some(SystemTime::now());
            s.info.ping_count
        };
        let frame = Frame::ping(Bytes::from(serial.to_string()));
        match self.write_frame_locked(&mut writer, &frame, false).await {
            Ok(n) => Ok(n),
            Err(e) => {
                drop(writer);
                Err(self.write_failed(e).await)
            }
        }
    }

    pub(crate) async fn close(&self, code: u16, reason: &str) -> Result<usize> {
        if !self.begin_close(code, reason, false) {
            return Ok(0);
        }
        self.fail_assembly(code, reason);

        let written = self
            .write_control(Frame::close(code, reason))
            .await
            .unwrap_or(0);

        let must_wait = {
            let s = self.shared.lock().unwrap();
            !s.peer_close_received && !s.finalized
        };
        if must_wait {
            let _ = timeout(self.options.close_period, self.close_wait.notified()).await;
        }
        self.finalize().await;
        Ok(written)
    }

    /// Record a pong payload: decimal serial, capped at the pings we
    /// actually sent so a peer cannot inflate its liveness.
    fn note_pong(&self, payload: &[u8]) -> Result<()> {
        let parsed = std::str::from_utf8(payload)
            .ok()
            .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|v| *v >= 1);
        let Some(serial) = parsed else {
            return Err(Error::Policy(
                "PONG payload must be a positive decimal integer".into(),
            ));
        };
        let mut s = self.shared.lock().unwrap();
        let acked = serial.min(s.info.ping_count);
        if acked > s.info.pong_count {
            s.info.pong_count = acked;
        }
        Ok(())
    }

    fn note_read(&self, bytes: usize) {
        let mut s = self.shared.lock().unwrap();
        s.info.bytes_read += bytes as u64;
        s.info.last_read_at = Some(SystemTime::now());
    }

    fn note_frame_read(&self, is_data: bool) {
        let mut s = self.shared.lock().unwrap();
        s.info.frames_read += 1;
        if is_data {
            s.info.last_data_read_at = Some(SystemTime::now());
        }
    }

    /// Add this chunk to the one-second rate window; true when a limit is
    /// exceeded and the reader must wait for the next scheduler tick.
    fn note_rate(&self, bytes: u64, frames: u64) -> bool {
        let window_bytes = self.window_bytes.fetch_add(bytes, Ordering::Relaxed) + bytes;
        let window_frames = self.window_frames.fetch_add(frames, Ordering::Relaxed) + frames;
        let limits = &self.options;
        (limits.bytes_per_second_limit > 0 && window_bytes > limits.bytes_per_second_limit)
            || (limits.frames_per_second_limit > 0 && window_frames > limits.frames_per_second_limit)
    }
}

/// In-progress inbound message assembly. Reader-task local.
#[derive(Default)]
struct Assembly {
    active: bool,
    binary: bool,
    compressed: bool,
    body_tx: Option<BodySender>,
    pending: BytesMut,
    compressed_buf: Vec<u8>,
    utf8: Option<Utf8Validator>,
}

enum StepOutcome {
    Continue,
    Stop,
    Fatal(Error),
}

async fn run_reader(
    inner: Arc<ConnectionInner>,
    mut read: BoxedReader,
    mut parser: FrameParser,
    incoming_tx: mpsc::Sender<Message>,
) {
    let mut assembly = Assembly::default();
    let mut read_buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        if inner.state() == ConnectionState::Closed {
            break;
        }
        tokio::select! {
            _ = inner.closed_notify.notified() => break,
            outcome = read_step(&inner, &mut read, &mut read_buf, &mut parser, &mut assembly, &incoming_tx) => {
                match outcome {
                    StepOutcome::Continue => {}
                    StepOutcome::Stop => break,
                    StepOutcome::Fatal(err) => {
                        fail(&inner, &mut read, err).await;
                        break;
                    }
                }
            }
        }
    }
    trace!(id = inner.id(), "reader task exiting");
}

async fn read_step(
    inner: &Arc<ConnectionInner>,
    read: &mut BoxedReader,
    read_buf: &mut [u8],
    parser: &mut FrameParser,
    assembly: &mut Assembly,
    incoming_tx: &mpsc::Sender<Message>,
) -> StepOutcome {
    let n = match read.read(read_buf).await {
        Ok(n) => n,
        Err(e) => return StepOutcome::Fatal(Error::Io(e.to_string())),
    };
    if n == 0 {
        return match inner.state() {
            ConnectionState::Open => {
                StepOutcome::Fatal(Error::Io("Stream closed unexpectedly".into()))
            }
            ConnectionState::Closing => {
                // The peer is gone; nothing left to wait for.
                inner.close_wait.notify_one();
                StepOutcome::Stop
            }
            ConnectionState::Closed => StepOutcome::Stop,
        };
    }

    parser.feed(&read_buf[..n]);
    inner.note_read(n);
    if inner.heartbeat_enabled() {
        inner
            .scheduler
            .refresh_heartbeat(inner.id(), inner.heartbeat_period());
    }

    let mut frames = 0u64;
    loop {
        let event = match parser.next_event() {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(e) => return StepOutcome::Fatal(e),
        };
        frames += 1;
        inner.note_frame_read(matches!(event, FrameEvent::Data { .. }));

        match event {
            FrameEvent::Data {
                opcode,
                payload,
                fin,
                compressed,
            } => {
                if inner.state() != ConnectionState::Open {
                    // Frames after the close began are dropped.
                    continue;
                }
                if let Err(e) =
                    handle_data(inner, assembly, incoming_tx, opcode, payload, fin, compressed)
                        .await
                {
                    return StepOutcome::Fatal(e);
                }
            }
            FrameEvent::Control {
                opcode: OpCode::Ping,
                payload,
            } => {
                if inner.state() == ConnectionState::Open
                    && inner.write_control(Frame::pong(payload)).await.is_err()
                {
                    return StepOutcome::Fatal(Error::Io("Writing to the client failed".into()));
                }
            }
            FrameEvent::Control {
                opcode: OpCode::Pong,
                payload,
            } => {
                if let Err(e) = inner.note_pong(&payload) {
                    return StepOutcome::Fatal(e);
                }
            }
            FrameEvent::Control {
                opcode: OpCode::Close,
                payload,
            } => return handle_peer_close(inner, &payload).await,
            FrameEvent::Control { .. } => {}
        }
    }

    if inner.note_rate(n as u64, frames) {
        trace!(id = inner.id(), "rate limit reached, throttling reader");
        inner.scheduler.wait_tick().await;
    }
    StepOutcome::Continue
}

async fn handle_data(
    inner: &Arc<ConnectionInner>,
    assembly: &mut Assembly,
    incoming_tx: &mpsc::Sender<Message>,
    opcode: OpCode,
    payload: Bytes,
    fin: bool,
    compressed: bool,
) -> Result<()> {
    if !assembly.active {
        if opcode == OpCode::Continuation {
            return Err(Error::Protocol("Unexpected continuation frame".into()));
        }
        assembly.active = true;
        assembly.binary = opcode == OpCode::Binary;
        assembly.compressed = compressed;
        assembly.pending.clear();
        assembly.compressed_buf.clear();
        assembly.utf8 = (!assembly.binary && inner.options.validate_utf8 && !compressed)
            .then(Utf8Validator::new);

        // Validate before the handle is handed out: a message whose very
        // first frame is invalid is never delivered at all.
        if let Some(validator) = assembly.utf8.as_mut() {
            validator.validate(&payload, fin)?;
        }

        let (tx, message) = Message::channel(assembly.binary);
        assembly.body_tx = Some(tx.clone());
        inner.shared.lock().unwrap().assembly_tx = Some(tx);
        // Deliver the handle as soon as the message opens; receive() picks
        // it up while the body is still streaming in.
        let _ = incoming_tx.send(message).await;
    } else {
        if opcode != OpCode::Continuation {
            return Err(Error::Protocol("Expected continuation frame".into()));
        }
        if let Some(validator) = assembly.utf8.as_mut() {
            validator.validate(&payload, fin)?;
        }
    }

    if assembly.compressed {
        assembly.compressed_buf.extend_from_slice(&payload);
        if fin {
            let plain = inner.decompress_message(&assembly.compressed_buf)?;
            assembly.compressed_buf = Vec::new();
            if !assembly.binary && inner.options.validate_utf8 {
                Utf8Validator::new().validate(&plain, true)?;
            }
            deliver_chunk(assembly, Bytes::from(plain)).await;
            finish_message(inner, assembly);
        }
        return Ok(());
    }

    assembly.pending.extend_from_slice(&payload);

    if (fin || assembly.pending.len() >= inner.options.stream_threshold)
        && !assembly.pending.is_empty()
    {
        let chunk = assembly.pending.split().freeze();
        deliver_chunk(assembly, chunk).await;
    }
    if fin {
        finish_message(inner, assembly);
    }
    Ok(())
}

async fn deliver_chunk(assembly: &mut Assembly, chunk: Bytes) {
    if let Some(tx) = assembly.body_tx.as_ref() {
        if tx.send(Ok(chunk)).await.is_err() {
            // Consumer dropped the message handle; discard the rest.
            assembly.body_tx = None;
        }
    }
}

fn finish_message(inner: &Arc<ConnectionInner>, assembly: &mut Assembly) {
    assembly.body_tx = None;
    assembly.active = false;
    assembly.utf8 = None;
    let mut s = inner.shared.lock().unwrap();
    s.assembly_tx = None;
    s.info.messages_read += 1;
}

async fn handle_peer_close(inner: &Arc<ConnectionInner>, payload: &[u8]) -> StepOutcome {
    let (code, reason) = match payload.len() {
        0 => (close_code::NONE, String::new()),
        1 => {
            return StepOutcome::Fatal(Error::Protocol("Close code must be two bytes".into()));
        }
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !close_code::is_valid_wire_code(code) {
                return StepOutcome::Fatal(Error::Protocol("Invalid close code".into()));
            }
            let reason_bytes = &payload[2..];
            let reason = if inner.options.validate_utf8 {
                match std::str::from_utf8(reason_bytes) {
                    Ok(reason) => reason.to_string(),
                    Err(_) => {
                        return StepOutcome::Fatal(Error::InvalidUtf8(
                            "Close reason must be valid UTF-8".into(),
                        ));
                    }
                }
            } else {
                String::from_utf8_lossy(reason_bytes).into_owned()
            };
            (code, reason)
        }
    };

    let echo = {
        let mut s = inner.shared.lock().unwrap();
        s.peer_close_received = true;
        if s.state == ConnectionState::Open {
            s.state = ConnectionState::Closing;
            s.info.closed_at = Some(SystemTime::now());
            s.info.close_code = Some(code);
            s.info.close_reason = Some(reason.clone());
            s.info.peer_initiated_close = true;
            true
        } else {
            false
        }
    };
    inner.close_wait.notify_one();

    if echo {
        debug!(id = inner.id(), code, "peer initiated close");
        inner.fail_assembly(code, &reason);
        let _ = inner.write_control(Frame::close(code, &reason)).await;
        inner.finalize().await;
    }
    StepOutcome::Stop
}

/// Terminate the connection after a fatal inbound error: send our close
/// frame, drain the stream for up to `close_period`, then release it.
async fn fail(inner: &Arc<ConnectionInner>, read: &mut BoxedReader, err: Error) {
    let code = err.close_code();
    let reason = err.close_reason();
    warn!(id = inner.id(), error = %err, "closing connection after fatal error");

    if !inner.begin_close(code, &reason, false) {
        // A close is already under way; parsing has stopped, so release
        // its close-wait instead of leaving it to the timeout.
        inner.close_wait.notify_one();
        return;
    }
    inner.fail_assembly(code, &reason);
    let _ = inner.write_control(Frame::close(code, &reason)).await;

    // Parsing stopped at the offending frame; all that is left is to give
    // the peer a bounded chance to hang up.
    let mut sink = [0u8; 1024];
    let _ = timeout(inner.options.close_period, async {
        loop {
            match read.read(&mut sink).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;

    inner.finalize().await;
}
