//! Connection lifecycle manager.
//!
//! [`LiveChatClient`] owns one room's connection: it resolves and signs the
//! session, opens the transport, sends the entry frame, promotes the
//! connection to streaming, runs the receive loop and heartbeat task side by
//! side, and applies the reconnection policy when the connection is lost.
//! Callers poll [`LiveChatClient::drain_events`] for normalized events.
//!
//! ```text
//! Disconnected -> Connecting -> Authenticating -> Streaming
//!       ^                                             |
//!       +---------- (backoff) <---- Closing <---------+
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::buffer::EventBuffer;
use crate::codec::{FrameClass, FrameReader};
use crate::collaborator::{RequestSigner, ResolvedSession, SessionResolver};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::heartbeat::{HeartbeatExit, HeartbeatScheduler};
use crate::normalizer::{
    now_millis, NormalizeContext, NormalizedEvent, Normalizer, RoomObserver, RoomStats,
};
use crate::platform::{PlatformProtocol, SessionContext};
use crate::transport::{BoxStream, SharedSink, Transport};
use crate::util;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Streaming,
    Closing,
}

/// Why the client stopped for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    /// The broadcast ended.
    Ended,
    /// The server refused the entry frame.
    EntryRejected,
    ReconnectExhausted,
    /// A non-retryable error after the connection task started, such as a
    /// protocol refusing to build its entry frame.
    Failed,
    /// Stopped by the caller.
    Stopped,
}

/// Latest room-level figures seen on the connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RoomSnapshot {
    pub online: Option<u64>,
    pub total_viewers: Option<String>,
    pub display: Option<String>,
    pub ended: bool,
    pub updated_at_ms: Option<u64>,
}

/// State shared between the client handle and its supervisor task.
struct Shared {
    state: watch::Sender<ConnectionState>,
    terminal: watch::Sender<Option<TerminalStatus>>,
    snapshot: Mutex<RoomSnapshot>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            trace!(from = ?*current, to = ?state, "connection state changed");
            *current = state;
            true
        });
    }

    fn finish(&self, status: TerminalStatus) {
        self.terminal.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(status);
            true
        });
        self.set_state(ConnectionState::Disconnected);
    }
}

/// Observer handed to the normalizer for one connection: updates the
/// snapshot, forwards to the caller's observer and flags stream end.
struct SessionObserver<'a> {
    shared: &'a Shared,
    forward: Option<&'a dyn RoomObserver>,
    ended: AtomicBool,
}

impl RoomObserver for SessionObserver<'_> {
    fn on_room_stats(&self, stats: &RoomStats) {
        {
            let mut snapshot = self.shared.snapshot.lock();
            if stats.online.is_some() {
                snapshot.online = stats.online;
            }
            if stats.total_viewers.is_some() {
                snapshot.total_viewers.clone_from(&stats.total_viewers);
            }
            if stats.display.is_some() {
                snapshot.display.clone_from(&stats.display);
            }
            snapshot.updated_at_ms = Some(now_millis());
        }
        if let Some(observer) = self.forward {
            observer.on_room_stats(stats);
        }
    }

    fn on_stream_ended(&self) {
        self.ended.store(true, Ordering::SeqCst);
        self.shared.snapshot.lock().ended = true;
        if let Some(observer) = self.forward {
            observer.on_stream_ended();
        }
    }
}

/// How one connection ended.
enum SessionEnd {
    /// Cancelled by the caller.
    Stopped,
    /// The broadcast ended.
    Ended,
    /// Not retried.
    Fatal(Error),
    /// Retried under the reconnection policy. `healthy` is set once the
    /// connection delivered at least one push after entry.
    Lost { error: Error, healthy: bool },
}

/// What a single inbound frame asks of the connection.
enum FrameOutcome {
    Continue,
    /// Evidence that entry was accepted.
    Accepted,
    /// A push was decoded and its events buffered. Also implies entry was
    /// accepted.
    Delivered,
    Ended,
    Rejected(String),
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Everything one run of the supervisor needs, cloned out of the client.
struct Session<P, T> {
    room: String,
    protocol: Arc<P>,
    transport: Arc<T>,
    config: ClientConfig,
    buffer: Arc<EventBuffer>,
    shared: Arc<Shared>,
    observer: Option<Arc<dyn RoomObserver>>,
    resolved: ResolvedSession,
    signature: Option<String>,
    normalizer: Normalizer,
}

pub struct LiveChatClient<P, T> {
    room: String,
    protocol: Arc<P>,
    transport: Arc<T>,
    resolver: Arc<dyn SessionResolver>,
    signer: Option<Arc<dyn RequestSigner>>,
    config: ClientConfig,
    buffer: Arc<EventBuffer>,
    shared: Arc<Shared>,
    observer: Option<Arc<dyn RoomObserver>>,
    running: Mutex<Option<Running>>,
}

impl<P: PlatformProtocol, T: Transport + 'static> LiveChatClient<P, T> {
    pub fn new(
        room: impl Into<String>,
        protocol: P,
        transport: T,
        resolver: Arc<dyn SessionResolver>,
        config: ClientConfig,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (terminal, _) = watch::channel(None);
        Self {
            room: room.into(),
            protocol: Arc::new(protocol),
            transport: Arc::new(transport),
            resolver,
            signer: None,
            buffer: Arc::new(EventBuffer::new(config.buffer_capacity)),
            config,
            shared: Arc::new(Shared {
                state,
                terminal,
                snapshot: Mutex::new(RoomSnapshot::default()),
            }),
            observer: None,
            running: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_signer(mut self, signer: Arc<dyn RequestSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Receive room stats and stream-end notifications as they arrive.
    /// Applies from the next `connect`.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn RoomObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn platform(&self) -> &'static str {
        self.protocol.name()
    }

    /// Open the connection and wait until it is streaming.
    ///
    /// Collaborator failures are returned before any connection is opened.
    /// Connection failures are retried under the reconnection policy; the
    /// returned error is the terminal one.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut running = self.running.lock();
            if let Some(current) = running.as_ref() {
                if !current.task.is_finished() {
                    return Err(Error::AlreadyRunning);
                }
            }
            *running = None;
        }

        let resolved = self.resolver.resolve_session_id(&self.room).await?;
        if resolved.session_id.trim().is_empty() {
            return Err(Error::InvalidSession(format!(
                "no session id for room {}",
                self.room
            )));
        }

        let signature = match self.protocol.sign_request(&resolved) {
            Some(request) => {
                let signer = self.signer.as_ref().ok_or_else(|| {
                    Error::Signature(format!("{} requires a request signer", self.protocol.name()))
                })?;
                let token = signer.sign_request(&request).await?;
                if token.trim().is_empty() {
                    return Err(Error::Signature("signer returned an empty token".to_string()));
                }
                Some(token)
            }
            None => None,
        };

        let session = Session {
            room: self.room.clone(),
            protocol: Arc::clone(&self.protocol),
            transport: Arc::clone(&self.transport),
            config: self.config.clone(),
            buffer: Arc::clone(&self.buffer),
            shared: Arc::clone(&self.shared),
            observer: self.observer.clone(),
            resolved,
            signature,
            normalizer: Normalizer::new(NormalizeContext {
                platform: self.protocol.name().to_string(),
                room_id: self.room.clone(),
                started_at_ms: now_millis(),
                like_policy: self.config.like_policy,
            }),
        };

        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        {
            let mut running = self.running.lock();
            if running.is_some() {
                return Err(Error::AlreadyRunning);
            }
            self.shared.terminal.send_replace(None);
            let task = tokio::spawn(session.supervise(cancel.clone(), ready_tx));
            *running = Some(Running { cancel, task });
        }

        let outcome = ready_rx
            .await
            .unwrap_or_else(|_| Err(Error::Internal("supervisor exited without reporting".into())));

        if outcome.is_err() {
            let running = self.running.lock().take();
            if let Some(running) = running {
                running.cancel.cancel();
                if let Err(e) = running.task.await {
                    error!(error = %e, "supervisor task failed");
                }
            }
        }
        outcome
    }

    /// Stop the client from any state. No reconnect follows.
    pub async fn disconnect(&self) {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return;
        };
        running.cancel.cancel();
        if let Err(e) = running.task.await {
            error!(error = %e, "supervisor task failed");
        }
        self.shared.finish(TerminalStatus::Stopped);
        info!(room = %self.room, platform = self.protocol.name(), "client stopped");
    }

    /// Alias of [`Self::disconnect`].
    pub async fn stop(&self) {
        self.disconnect().await;
    }

    /// Whether the connection is currently streaming.
    pub fn is_running(&self) -> bool {
        self.state() == ConnectionState::Streaming
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Set once the client has stopped for good; cleared by `connect`.
    pub fn terminal_status(&self) -> Option<TerminalStatus> {
        *self.shared.terminal.borrow()
    }

    /// Wait until the client stops for good.
    pub async fn wait_terminal(&self) -> TerminalStatus {
        let mut rx = self.shared.terminal.subscribe();
        let status = match rx.wait_for(Option::is_some).await {
            Ok(status) => (*status).unwrap_or(TerminalStatus::Stopped),
            Err(_) => TerminalStatus::Stopped,
        };
        status
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Remove and return every buffered event. Never blocks on the
    /// connection.
    pub fn drain_events(&self) -> Vec<NormalizedEvent> {
        self.buffer.drain()
    }

    /// Events dropped to keep the buffer within capacity.
    pub fn evicted_events(&self) -> u64 {
        self.buffer.evicted()
    }

    pub fn room_snapshot(&self) -> RoomSnapshot {
        self.shared.snapshot.lock().clone()
    }
}

impl<P, T> Drop for LiveChatClient<P, T> {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}

impl<P: PlatformProtocol, T: Transport + 'static> Session<P, T> {
    async fn supervise(
        self,
        cancel: CancellationToken,
        ready: oneshot::Sender<Result<()>>,
    ) {
        let mut ready = Some(ready);
        let max_attempts = self.config.max_reconnect_attempts;
        let mut failures: u32 = 0;
        let mut reconnects: u32 = 0;

        let status = loop {
            let end = self.run_once(reconnects, &cancel, &mut ready).await;
            self.shared.set_state(ConnectionState::Disconnected);

            match end {
                SessionEnd::Stopped => break TerminalStatus::Stopped,
                SessionEnd::Ended => {
                    info!(room = %self.room, "live stream ended");
                    report(&mut ready, Err(Error::StreamEnded));
                    break TerminalStatus::Ended;
                }
                SessionEnd::Fatal(error) => {
                    error!(room = %self.room, error = %error, "session failed");
                    let status = if matches!(error, Error::EntryRejected(_)) {
                        TerminalStatus::EntryRejected
                    } else {
                        TerminalStatus::Failed
                    };
                    report(&mut ready, Err(error));
                    break status;
                }
                SessionEnd::Lost { error, healthy } => {
                    // Only a connection that carried data clears the count.
                    if healthy {
                        failures = 0;
                    }
                    failures += 1;
                    if failures > max_attempts {
                        error!(
                            room = %self.room,
                            attempts = max_attempts,
                            "giving up after {max_attempts} reconnect attempts: {error}"
                        );
                        report(
                            &mut ready,
                            Err(Error::ReconnectExhausted {
                                attempts: max_attempts,
                            }),
                        );
                        break TerminalStatus::ReconnectExhausted;
                    }

                    warn!(
                        room = %self.room,
                        attempt = failures,
                        max_attempts,
                        "connection lost, reconnecting: {error}"
                    );
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break TerminalStatus::Stopped,
                        () = util::backoff(
                            failures,
                            self.config.initial_backoff_ms,
                            self.config.max_backoff_ms,
                        ) => {}
                    }
                    reconnects += 1;
                }
            }
        };

        if status == TerminalStatus::Stopped {
            report(
                &mut ready,
                Err(Error::Internal("client stopped before streaming".to_string())),
            );
        }
        self.shared.finish(status);
        debug!(room = %self.room, ?status, "supervisor finished");
    }

    /// One connection from `Connecting` to `Closing`.
    async fn run_once(
        &self,
        reconnect_count: u32,
        cancel: &CancellationToken,
        ready: &mut Option<oneshot::Sender<Result<()>>>,
    ) -> SessionEnd {
        self.shared.set_state(ConnectionState::Connecting);

        let ctx = SessionContext {
            room: self.room.clone(),
            session: self.resolved.clone(),
            signature: self.signature.clone(),
            reconnect_count,
        };
        let entry = match self.protocol.entry_frame(&ctx) {
            Ok(entry) => entry,
            Err(e) => return SessionEnd::Fatal(e),
        };
        let request = match self.protocol.connect_request(&ctx) {
            Ok(request) => request,
            Err(e) => return SessionEnd::Fatal(e),
        };

        debug!(room = %self.room, url = %request.url, reconnect_count, "connecting");
        let connected = tokio::select! {
            biased;
            () = cancel.cancelled() => return SessionEnd::Stopped,
            connected = self.transport.connect(&request) => connected,
        };
        let (sink, mut stream) = match connected {
            Ok(halves) => halves,
            Err(error) => {
                return SessionEnd::Lost {
                    error,
                    healthy: false,
                }
            }
        };
        let sink: SharedSink = Arc::new(tokio::sync::Mutex::new(sink));

        let end = self
            .drive(entry, &sink, &mut stream, cancel, ready)
            .await;

        self.shared.set_state(ConnectionState::Closing);
        if let Err(e) = sink.lock().await.close().await {
            debug!(error = %e, "error closing transport");
        }
        end
    }

    /// Entry, authentication and the streaming phase over an open transport.
    async fn drive(
        &self,
        entry: Option<Bytes>,
        sink: &SharedSink,
        stream: &mut BoxStream,
        cancel: &CancellationToken,
        ready: &mut Option<oneshot::Sender<Result<()>>>,
    ) -> SessionEnd {
        self.shared.set_state(ConnectionState::Authenticating);
        let mut reader = FrameReader::new(self.protocol.framing());
        let observer = SessionObserver {
            shared: &self.shared,
            forward: self.observer.as_deref(),
            ended: AtomicBool::new(false),
        };

        if let Some(entry) = entry {
            if let Err(error) = sink.lock().await.send(entry).await {
                return SessionEnd::Lost {
                    error,
                    healthy: false,
                };
            }
        }

        let mut healthy = false;

        let deadline = Instant::now() + self.config.entry_grace_period();
        loop {
            let chunk = tokio::select! {
                biased;
                () = cancel.cancelled() => return SessionEnd::Stopped,
                () = tokio::time::sleep_until(deadline) => {
                    debug!(room = %self.room, "no entry rejection within grace period");
                    break;
                }
                chunk = stream.next_frame() => chunk,
            };
            match self.on_chunk(chunk, &mut reader, sink, &observer).await {
                Ok(FrameOutcome::Continue) => {}
                Ok(FrameOutcome::Accepted) => break,
                Ok(FrameOutcome::Delivered) => {
                    healthy = true;
                    break;
                }
                Ok(FrameOutcome::Ended) => return SessionEnd::Ended,
                Ok(FrameOutcome::Rejected(reason)) => {
                    return SessionEnd::Fatal(Error::EntryRejected(reason))
                }
                Err(error) => {
                    return SessionEnd::Lost {
                        error,
                        healthy: false,
                    }
                }
            }
        }

        self.shared.set_state(ConnectionState::Streaming);
        info!(room = %self.room, platform = self.protocol.name(), "streaming");
        report(ready, Ok(()));

        let heartbeat_cancel = cancel.child_token();
        let protocol = Arc::clone(&self.protocol);
        let mut heartbeat = tokio::spawn(
            HeartbeatScheduler::new(self.config.heartbeat_interval(
                self.protocol.default_heartbeat_interval(),
            ))
            .run(
                Arc::clone(sink),
                move || protocol.heartbeat_frame(),
                heartbeat_cancel.clone(),
            ),
        );
        let mut heartbeat_done = false;

        let end = loop {
            let chunk = tokio::select! {
                biased;
                () = cancel.cancelled() => break SessionEnd::Stopped,
                exit = &mut heartbeat => {
                    heartbeat_done = true;
                    let error = match exit {
                        Ok(HeartbeatExit::Failed(error)) => error,
                        Ok(HeartbeatExit::Cancelled) => {
                            Error::Internal("heartbeat cancelled".to_string())
                        }
                        Err(e) => Error::Internal(format!("heartbeat task failed: {e}")),
                    };
                    break SessionEnd::Lost { error, healthy };
                }
                chunk = stream.next_frame() => chunk,
            };
            match self.on_chunk(chunk, &mut reader, sink, &observer).await {
                Ok(FrameOutcome::Continue | FrameOutcome::Accepted) => {}
                Ok(FrameOutcome::Delivered) => healthy = true,
                Ok(FrameOutcome::Ended) => break SessionEnd::Ended,
                Ok(FrameOutcome::Rejected(reason)) => {
                    break SessionEnd::Lost {
                        error: Error::Transport(reason),
                        healthy,
                    }
                }
                Err(error) => break SessionEnd::Lost { error, healthy },
            }
        };

        heartbeat_cancel.cancel();
        if !heartbeat_done {
            if let Err(e) = heartbeat.await {
                debug!(error = %e, "heartbeat task failed");
            }
        }
        end
    }

    /// Handle one transport read.
    async fn on_chunk(
        &self,
        chunk: Option<Result<Bytes>>,
        reader: &mut FrameReader,
        sink: &SharedSink,
        observer: &SessionObserver<'_>,
    ) -> Result<FrameOutcome> {
        let data = match chunk {
            Some(Ok(data)) => data,
            Some(Err(e)) => return Err(e),
            None => return Err(Error::Transport("connection closed by peer".to_string())),
        };

        let frames = match reader.push(data) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(room = %self.room, error = %e, "dropping unframeable input");
                return Ok(FrameOutcome::Continue);
            }
        };

        let mut outcome = FrameOutcome::Continue;
        for raw in frames {
            match self.on_frame(&raw, sink, observer).await? {
                FrameOutcome::Continue => {}
                FrameOutcome::Accepted => {
                    if matches!(outcome, FrameOutcome::Continue) {
                        outcome = FrameOutcome::Accepted;
                    }
                }
                FrameOutcome::Delivered => outcome = FrameOutcome::Delivered,
                terminal => return Ok(terminal),
            }
        }
        Ok(outcome)
    }

    async fn on_frame(
        &self,
        raw: &[u8],
        sink: &SharedSink,
        observer: &SessionObserver<'_>,
    ) -> Result<FrameOutcome> {
        let envelope = match self.protocol.decode_frame(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(room = %self.room, error = %e, len = raw.len(), "dropping undecodable frame");
                return Ok(FrameOutcome::Continue);
            }
        };

        if envelope.needs_ack {
            match self.protocol.ack_frame(&envelope) {
                Ok(Some(ack)) => sink.lock().await.send(ack).await?,
                Ok(None) => {}
                Err(e) => warn!(error = %e, log_id = ?envelope.log_id, "failed to build ack"),
            }
        }

        match self.protocol.classify(&envelope) {
            FrameClass::Push => {
                let messages = self.protocol.decode_messages(&envelope);
                trace!(kind = envelope.kind, messages = messages.len(), "push frame");
                let mut events = Vec::with_capacity(messages.len());
                for message in messages {
                    events.extend(self.normalizer.normalize(message, observer));
                    if observer.ended.load(Ordering::SeqCst) {
                        break;
                    }
                }
                self.buffer.extend(events);

                if observer.ended.load(Ordering::SeqCst) {
                    self.shared.set_state(ConnectionState::Closing);
                    return Ok(FrameOutcome::Ended);
                }
                Ok(FrameOutcome::Delivered)
            }
            FrameClass::EntryAck => {
                debug!(room = %self.room, "entry acknowledged");
                Ok(FrameOutcome::Accepted)
            }
            FrameClass::HeartbeatAck => {
                trace!("heartbeat acknowledged");
                Ok(FrameOutcome::Continue)
            }
            FrameClass::Error => Ok(FrameOutcome::Rejected(self.protocol.describe_error(&envelope))),
            FrameClass::Closed => {
                self.shared.snapshot.lock().ended = true;
                self.shared.set_state(ConnectionState::Closing);
                Ok(FrameOutcome::Ended)
            }
            FrameClass::Ignored => Ok(FrameOutcome::Continue),
        }
    }
}

fn report(ready: &mut Option<oneshot::Sender<Result<()>>>, outcome: Result<()>) {
    if let Some(tx) = ready.take() {
        let _ = tx.send(outcome);
    }
}
