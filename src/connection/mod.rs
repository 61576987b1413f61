//! Connection lifecycle management.
//!
//! This module owns the state machine that orchestrates the engine:
//! negotiate → connect → active ⇄ reconnecting → disconnected. It drives
//! the transport, applies inbound envelopes (cursor, groups token, message
//! routing), reacts to heartbeat events and schedules resumption attempts.
//!
//! All shared connection state (current state, cursor, descriptor) lives in
//! one lock-guarded [`Machine`]; the send path, the receive path and
//! timer-driven transitions serialize through it via atomic transition
//! operations only.

pub mod bus;
pub mod heartbeat;
pub mod retry;
pub mod tracker;

use std::sync::Arc;

use futures_channel::oneshot;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, error, warn};

use crate::config::ClientConfig;
use crate::connection::bus::{MessageBus, QueuedCall};
use crate::connection::heartbeat::{HeartbeatEvent, HeartbeatMonitor};
use crate::connection::retry::ReconnectContext;
use crate::connection::tracker::StateTracker;
use crate::error::ClientError;
use crate::negotiate::{NegotiationResponse, PROTOCOL_VERSION};
use crate::protocol::{Envelope, EnvelopeCodec, InboundMessage, OutboundFrame, ProtocolError};
use crate::transport::{
    receive_url, ConnectAction, ConnectRequest, Transport, TransportChannels, TransportEvent,
};

/// Connection lifecycle states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Performing the bootstrap negotiation exchange.
    Negotiating,
    /// Transport opening; waiting for the initialization frame.
    Connecting,
    /// Stream established; invocations flow.
    Active,
    /// Transport lost; resumption attempts in progress.
    Reconnecting { attempt: u32 },
    /// Terminal until explicitly restarted.
    Disconnected,
}

/// Negotiated parameters for one logical connection.
///
/// Immutable once negotiation completes. Reconnects reuse it wholesale; only
/// a fresh negotiation after an explicit restart replaces it.
#[derive(Debug, Clone)]
pub struct ConnectionDescriptor {
    pub connection_token: String,
    pub connection_id: String,
    pub protocol_version: String,
    /// Interval at which the server promises traffic. Absent when the
    /// server sends no keep-alive frames.
    pub keep_alive: Option<Duration>,
    /// How long after the last receipt the connection counts as dead.
    pub disconnect_timeout: Duration,
}

impl ConnectionDescriptor {
    /// Validates a negotiation response and derives the descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NegotiationFailed`] on a protocol-version
    /// mismatch or when the server does not offer the websocket transport.
    pub fn from_negotiation(response: &NegotiationResponse) -> Result<Self, ClientError> {
        if response.protocol_version != PROTOCOL_VERSION {
            return Err(ClientError::NegotiationFailed(format!(
                "unsupported protocol version {}",
                response.protocol_version
            )));
        }
        if !response.try_web_sockets {
            return Err(ClientError::NegotiationFailed(
                "server does not offer the websocket transport".into(),
            ));
        }

        Ok(Self {
            connection_token: response.connection_token.clone(),
            connection_id: response.connection_id.clone(),
            protocol_version: response.protocol_version.clone(),
            keep_alive: response
                .keep_alive_timeout
                .filter(|seconds| *seconds > 0.0)
                .map(Duration::from_secs_f64),
            disconnect_timeout: Duration::from_secs_f64(response.disconnect_timeout),
        })
    }
}

/// Shared mutable connection state. One lock, no raw field access outside
/// this module.
struct Machine {
    state: ConnectionState,
    descriptor: Option<ConnectionDescriptor>,
    /// Last consumed message-stream position.
    cursor: Option<u64>,
    /// Why the connection finalized; surfaced by `start` on early failure.
    close_reason: Option<String>,
}

pub(crate) struct Inner {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    machine: Mutex<Machine>,
    state_tx: watch::Sender<ConnectionState>,
    /// Keeps the state channel alive so sends never fail.
    _state_rx: watch::Receiver<ConnectionState>,
    tracker: Arc<StateTracker>,
    bus: MessageBus,
    /// Sender of the currently open transport, if any.
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    stop_tx: watch::Sender<bool>,
    /// Keeps the stop channel alive so sends never fail.
    _stop_rx: watch::Receiver<bool>,
}

/// What applying one envelope asks the driver to do next.
enum Applied {
    Continue,
    Reconnect(String),
    Fatal(String),
}

/// How one transport session ended.
enum LoopExit {
    Stopped,
    Lost(String),
    Fatal(String),
}

impl Inner {
    fn state(&self) -> ConnectionState {
        self.machine.lock().state.clone()
    }

    fn transition(&self, next: ConnectionState) {
        let mut machine = self.machine.lock();
        if machine.state == next {
            return;
        }
        debug!("State changed: {:?} -> {:?}", machine.state, next);
        machine.state = next.clone();
        drop(machine);
        let _ = self.state_tx.send(next);
    }

    /// Terminal teardown: records the reason, enters `Disconnected` and
    /// fails every pending invocation exactly once.
    async fn finalize(&self, reason: &str) {
        {
            let mut machine = self.machine.lock();
            if machine.close_reason.is_none() {
                machine.close_reason = Some(reason.to_string());
            }
        }
        *self.outbound.lock() = None;
        self.transition(ConnectionState::Disconnected);
        self.bus.fail_all(reason).await;
    }

    /// Applies one decoded envelope: updates cursor and groups token,
    /// completes the connect handshake, routes messages.
    async fn apply_envelope(&self, envelope: Envelope) -> Applied {
        if let Some(server_error) = envelope.error {
            return Applied::Fatal(format!("server error: {server_error}"));
        }

        if let Some(token) = envelope.groups_token {
            self.tracker.set_groups_token(token);
        }

        if let Some(cursor) = envelope.cursor {
            let mut machine = self.machine.lock();
            if let Some(last) = machine.cursor {
                if cursor <= last {
                    drop(machine);
                    let desync = ClientError::ProtocolDesync(format!(
                        "cursor moved from {last} to {cursor}"
                    ));
                    error!("{desync}; dropping frame and forcing reconnect");
                    return Applied::Reconnect(desync.to_string());
                }
            }
            machine.cursor = Some(cursor);
        }

        if envelope.initialized {
            let connecting = self.machine.lock().state == ConnectionState::Connecting;
            if connecting {
                self.transition(ConnectionState::Active);
            }
        }

        for message in envelope.messages {
            match message {
                InboundMessage::Result(result) => self.bus.complete(result).await,
                InboundMessage::ServerCall(call) => self.bus.route_server_call(call),
            }
        }

        if envelope.should_reconnect == Some(true) {
            return Applied::Reconnect("server requested reconnect".into());
        }
        Applied::Continue
    }
}

/// A logical connection to a remote hub endpoint.
///
/// Created by [`HubClient`](crate::client::HubClient); most callers use the
/// client facade rather than this type directly.
pub struct Connection {
    inner: Arc<Inner>,
    driver: Mutex<Option<JoinHandle<()>>>,
    dispatch_rx: Mutex<Option<mpsc::UnboundedReceiver<QueuedCall>>>,
}

impl Connection {
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let tracker = Arc::new(StateTracker::new());
        let (bus, dispatch_rx) = MessageBus::new(tracker.clone());
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (stop_tx, stop_rx) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                machine: Mutex::new(Machine {
                    state: ConnectionState::Disconnected,
                    descriptor: None,
                    cursor: None,
                    close_reason: None,
                }),
                state_tx,
                _state_rx: state_rx,
                tracker,
                bus,
                outbound: Mutex::new(None),
                stop_tx,
                _stop_rx: stop_rx,
            }),
            driver: Mutex::new(None),
            dispatch_rx: Mutex::new(Some(dispatch_rx)),
        }
    }

    /// Negotiates and starts the connection, returning once the stream is
    /// active.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NegotiationFailed`] when the bootstrap
    /// exchange fails (fatal, not retried) and a transport error when the
    /// stream dies before initializing.
    pub async fn start(&self) -> Result<(), ClientError> {
        {
            let mut machine = self.inner.machine.lock();
            if machine.state != ConnectionState::Disconnected {
                return Err(ClientError::InvalidState(format!(
                    "cannot start from {:?}",
                    machine.state
                )));
            }
            machine.state = ConnectionState::Negotiating;
            machine.descriptor = None;
            machine.cursor = None;
            machine.close_reason = None;
        }
        self.inner.tracker.reset();
        let _ = self.inner.stop_tx.send(false);
        let _ = self.inner.state_tx.send(ConnectionState::Negotiating);

        // The dispatcher outlives individual transports; spawn it once.
        if let Some(queue) = self.dispatch_rx.lock().take() {
            tokio::spawn(bus::run_dispatcher(self.inner.bus.handlers(), queue));
        }

        let negotiation = match self.inner.transport.negotiate(&self.inner.config).await {
            Ok(negotiation) => negotiation,
            Err(e) => {
                self.inner.finalize(&format!("negotiation failed: {e}")).await;
                return Err(e);
            }
        };
        let descriptor = match ConnectionDescriptor::from_negotiation(&negotiation) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                self.inner.finalize(&format!("negotiation failed: {e}")).await;
                return Err(e);
            }
        };
        debug!(
            "Negotiation completed for connection {}",
            descriptor.connection_id
        );
        self.inner.machine.lock().descriptor = Some(descriptor.clone());
        self.inner.transition(ConnectionState::Connecting);

        *self.driver.lock() = Some(tokio::spawn(drive(self.inner.clone(), descriptor)));

        // Wait until the stream initializes or startup fails.
        let mut state_rx = self.inner.state_tx.subscribe();
        loop {
            let current = state_rx.borrow_and_update().clone();
            match current {
                ConnectionState::Active => return Ok(()),
                ConnectionState::Disconnected => {
                    let reason = self
                        .inner
                        .machine
                        .lock()
                        .close_reason
                        .clone()
                        .unwrap_or_else(|| "connection failed during startup".into());
                    return Err(ClientError::Transport(reason));
                }
                _ => {
                    if state_rx.changed().await.is_err() {
                        return Err(ClientError::NotConnected);
                    }
                }
            }
        }
    }

    /// Sends an invocation and returns a handle that resolves with the
    /// correlated result, or with [`ClientError::ConnectionLost`] if the
    /// connection tears down first.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] unless the connection is
    /// `Active`.
    pub async fn invoke(
        &self,
        hub: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<InvocationHandle, ClientError> {
        if self.inner.state() != ConnectionState::Active {
            return Err(ClientError::NotConnected);
        }

        let id = self.inner.bus.next_correlation_id();
        let frame = OutboundFrame {
            correlation_id: id,
            target: format!("{hub}.{method}"),
            args,
            state: self.inner.bus.state_snapshot(hub),
            groups_token: self.inner.tracker.groups_token(),
        };
        let payload = EnvelopeCodec::encode(&frame)?;

        let receiver = self.inner.bus.register_pending(id, hub).await;
        let sender = self.inner.outbound.lock().clone();
        let delivered = sender.is_some_and(|sender| sender.send(payload).is_ok());
        if !delivered {
            self.inner.bus.discard_pending(id).await;
            return Err(ClientError::NotConnected);
        }

        debug!("Invoking {}.{} with correlation id {}", hub, method, id);
        Ok(InvocationHandle {
            correlation_id: id,
            receiver,
        })
    }

    /// Registers a handler for server-initiated calls on `(hub, method)`.
    pub async fn on<F>(&self, hub: &str, method: &str, handler: F)
    where
        F: Fn(Vec<Value>) + Send + Sync + 'static,
    {
        self.inner.bus.register_handler(hub, method, handler).await;
    }

    /// Stops the connection.
    ///
    /// Idempotent. Interrupts any in-progress backoff wait and does not
    /// return until every pending invocation handle has been resolved.
    pub async fn stop(&self) {
        let _ = self.inner.stop_tx.send(true);
        let driver = self.driver.lock().take();
        match driver {
            Some(driver) => {
                let _ = driver.await;
            }
            None => {
                // Never started, or already stopped. Make the state terminal
                // either way.
                if self.inner.state() != ConnectionState::Disconnected {
                    self.inner.finalize("stopped by caller").await;
                }
            }
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Stream of lifecycle state changes.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Negotiated parameters, once available.
    pub fn descriptor(&self) -> Option<ConnectionDescriptor> {
        self.inner.machine.lock().descriptor.clone()
    }
}

/// Handle to one in-flight invocation. Resolves exactly once: with the
/// correlated result, the server's error, or a connection-lost error on
/// teardown.
#[derive(Debug)]
pub struct InvocationHandle {
    correlation_id: u64,
    receiver: oneshot::Receiver<Result<Value, ClientError>>,
}

impl InvocationHandle {
    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    /// Waits for the invocation to resolve.
    pub async fn result(self) -> Result<Value, ClientError> {
        match self.receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Err(ClientError::ConnectionLost("connection closed".into())),
        }
    }

    /// Waits for the invocation to resolve and deserializes the result.
    pub async fn result_as<R: DeserializeOwned>(self) -> Result<R, ClientError> {
        let value = self.result().await?;
        serde_json::from_value(value)
            .map_err(|e| ClientError::MalformedEnvelope(ProtocolError::Decode(e)))
    }

    /// Non-blocking probe: `Some` once resolved, `None` while pending.
    pub fn try_result(&mut self) -> Option<Result<Value, ClientError>> {
        match self.receiver.try_recv() {
            Ok(Some(outcome)) => Some(outcome),
            Ok(None) => None,
            Err(_) => Some(Err(ClientError::ConnectionLost(
                "connection closed".into(),
            ))),
        }
    }
}

/// Lifecycle driver: opens transports, runs the receive loop and schedules
/// resumption until the connection finalizes.
async fn drive(inner: Arc<Inner>, descriptor: ConnectionDescriptor) {
    let mut stop_rx = inner.stop_tx.subscribe();
    let mut reconnect: Option<ReconnectContext> = None;

    let close_reason: String = loop {
        if *stop_rx.borrow() {
            break "stopped by caller".into();
        }

        // Backoff between resume attempts. The first attempt of an episode
        // is immediate; later ones wait per the policy, bounded by the
        // episode deadline.
        if let Some(ctx) = &reconnect {
            if inner.config.reconnect.attempts_exhausted(ctx.attempt) {
                break format!("reconnect attempts exhausted after {}", ctx.attempt);
            }
            if ctx.attempt > 0 {
                let delay = inner.config.reconnect.delay_for(ctx.attempt - 1);
                let wake = Instant::now() + delay;
                if wake >= ctx.deadline {
                    tokio::select! {
                        _ = sleep_until(ctx.deadline) => {
                            break "disconnect timeout elapsed while reconnecting".into();
                        }
                        _ = stop_rx.changed() => break "stopped by caller".into(),
                    }
                }
                tokio::select! {
                    _ = sleep_until(wake) => {}
                    _ = stop_rx.changed() => break "stopped by caller".into(),
                }
            } else if Instant::now() >= ctx.deadline {
                break "disconnect timeout elapsed while reconnecting".into();
            }
            inner.transition(ConnectionState::Reconnecting {
                attempt: ctx.attempt + 1,
            });
        }

        let action = match reconnect {
            Some(_) => ConnectAction::Reconnect,
            None => ConnectAction::Connect,
        };
        let cursor = reconnect.as_ref().and_then(|ctx| ctx.last_cursor);
        let groups_token = inner.tracker.groups_token();
        let url = match receive_url(
            &inner.config,
            &descriptor,
            action,
            cursor,
            groups_token.as_deref(),
        ) {
            Ok(url) => url,
            Err(e) => break format!("cannot build connect URL: {e}"),
        };
        let request = ConnectRequest {
            url,
            headers: inner.config.headers.clone(),
        };

        let opened = tokio::select! {
            result = inner.transport.open(request) => result,
            _ = stop_rx.changed() => break "stopped by caller".into(),
        };
        let mut channels = match opened {
            Ok(channels) => channels,
            Err(e) => {
                warn!("Transport open failed: {}", e);
                match &mut reconnect {
                    Some(ctx) => {
                        ctx.attempt += 1;
                        continue;
                    }
                    // Initial connect gets no retry budget; negotiation must
                    // be redone by an explicit restart.
                    None => break format!("transport failed to open: {e}"),
                }
            }
        };

        *inner.outbound.lock() = Some(channels.outbound.clone());
        let monitor = HeartbeatMonitor::new(
            descriptor.keep_alive,
            descriptor.disconnect_timeout,
            inner.config.heartbeat_factor,
        );

        if reconnect.take().is_some() {
            // Resume accepted: the stream continues, no re-initialization.
            debug!("Reconnected");
            inner.transition(ConnectionState::Active);
        }

        let exit = run_transport(&inner, &mut channels, &monitor, &mut stop_rx).await;

        *inner.outbound.lock() = None;
        let _ = channels.stop.send(true);

        match exit {
            LoopExit::Stopped => break "stopped by caller".into(),
            LoopExit::Fatal(reason) => break reason,
            LoopExit::Lost(reason) => {
                if inner.state() == ConnectionState::Connecting {
                    break format!("transport lost before initialization: {reason}");
                }
                warn!("Transport lost ({}), reconnecting", reason);
                reconnect = Some(ReconnectContext {
                    attempt: 0,
                    last_cursor: inner.machine.lock().cursor,
                    deadline: monitor.last_beat() + descriptor.disconnect_timeout,
                });
                inner.transition(ConnectionState::Reconnecting { attempt: 1 });
            }
        }
    };

    inner.finalize(&close_reason).await;
}

/// Receive loop for one transport session.
async fn run_transport(
    inner: &Inner,
    channels: &mut TransportChannels,
    monitor: &HeartbeatMonitor,
    stop_rx: &mut watch::Receiver<bool>,
) -> LoopExit {
    loop {
        tokio::select! {
            event = channels.events.recv() => match event {
                Some(TransportEvent::Payload(payload)) => {
                    monitor.beat();
                    let envelope = match EnvelopeCodec::decode(&payload) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            warn!("Dropping malformed envelope: {}", e);
                            continue;
                        }
                    };
                    match inner.apply_envelope(envelope).await {
                        Applied::Continue => {}
                        Applied::Reconnect(reason) => return LoopExit::Lost(reason),
                        Applied::Fatal(reason) => return LoopExit::Fatal(reason),
                    }
                }
                Some(TransportEvent::Closed(reason)) => {
                    return LoopExit::Lost(
                        reason.unwrap_or_else(|| "transport closed".into()),
                    );
                }
                Some(TransportEvent::Error(detail)) => return LoopExit::Lost(detail),
                None => return LoopExit::Lost("transport event channel closed".into()),
            },
            event = monitor.expired() => match event {
                HeartbeatEvent::PossiblyDead => {
                    return LoopExit::Lost("heartbeat timeout".into());
                }
                HeartbeatEvent::DefinitelyDead => {
                    return LoopExit::Fatal(
                        "no traffic within the disconnect timeout".into(),
                    );
                }
            },
            _ = stop_rx.changed() => return LoopExit::Stopped,
        }
    }
}
