//! Invocation multiplexing and server-call dispatch.
//!
//! This module provides the core infrastructure for:
//! - Managing pending client invocations (`invoke` → correlated result),
//! - Dispatching server-initiated calls (`on` → registered handler).
//!
//! It uses `Arc<RwLock<...>>` for thread-safe shared state and a one-shot
//! channel per invocation for asynchronous completion. Handler dispatch is
//! decoupled through an unbounded queue so a slow caller handler can never
//! stall the transport's receive loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_channel::oneshot;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::connection::tracker::StateTracker;
use crate::error::ClientError;
use crate::protocol::{InvocationResult, ServerCall};

/// Handler for server-initiated calls, invoked with the call's arguments.
pub type ServerCallHandler = Box<dyn Fn(Vec<Value>) + Send + Sync>;

/// A server call queued for dispatch off the receive path.
#[derive(Debug)]
pub(crate) struct QueuedCall {
    hub: String,
    method: String,
    args: Vec<Value>,
}

type CompletionSlot = oneshot::Sender<Result<Value, ClientError>>;

/// Registered server-call handlers, keyed by lowercased (hub, method).
pub(crate) type HandlerMap = Arc<RwLock<HashMap<(String, String), ServerCallHandler>>>;

/// One outbound call record: the hub it targeted (for result-state
/// application) and the slot its result resolves.
struct PendingInvocation {
    hub: String,
    slot: CompletionSlot,
}

/// Multiplexes outbound invocations and inbound messages.
///
/// Owns every pending invocation from creation until completion or
/// connection teardown, at which point each unresolved one is failed with a
/// connection-lost error, exactly once.
#[derive(Clone)]
pub struct MessageBus {
    /// Pending invocations awaiting a correlated result.
    pending: Arc<RwLock<HashMap<u64, PendingInvocation>>>,
    handlers: HandlerMap,
    /// Per-hub state shared with the connection's tracker.
    tracker: Arc<StateTracker>,
    next_id: Arc<AtomicU64>,
    dispatch_tx: mpsc::UnboundedSender<QueuedCall>,
}

impl MessageBus {
    /// Creates a bus and the receive side of its dispatch queue. The caller
    /// spawns [`run_dispatcher`] on the receiver.
    pub(crate) fn new(tracker: Arc<StateTracker>) -> (Self, mpsc::UnboundedReceiver<QueuedCall>) {
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let bus = Self {
            pending: Arc::new(RwLock::new(HashMap::new())),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            tracker,
            next_id: Arc::new(AtomicU64::new(1)),
            dispatch_tx,
        };
        (bus, dispatch_rx)
    }

    /// Assigns the next correlation id. Monotonic for the connection's
    /// lifetime, never reused.
    pub fn next_correlation_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a pending invocation and returns the receiver its result
    /// will be delivered on.
    pub async fn register_pending(
        &self,
        id: u64,
        hub: &str,
    ) -> oneshot::Receiver<Result<Value, ClientError>> {
        let (tx, rx) = oneshot::channel();
        self.pending.write().await.insert(
            id,
            PendingInvocation {
                hub: hub.to_string(),
                slot: tx,
            },
        );
        rx
    }

    /// Drops a pending registration, e.g. when the send itself failed.
    pub async fn discard_pending(&self, id: u64) {
        self.pending.write().await.remove(&id);
    }

    /// Registers a handler for server-initiated calls on (hub, method).
    pub async fn register_handler<F>(&self, hub: &str, method: &str, handler: F)
    where
        F: Fn(Vec<Value>) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .await
            .insert(handler_key(hub, method), Box::new(handler));
    }

    /// Routes an inbound invocation result to its pending slot.
    ///
    /// A result with no matching pending id is acknowledged and discarded:
    /// the invocation may already have been failed by a teardown.
    pub async fn complete(&self, result: InvocationResult) {
        let Some(pending) = self.pending.write().await.remove(&result.correlation_id) else {
            debug!(
                "No pending invocation for correlation id {}",
                result.correlation_id
            );
            return;
        };

        if let Some(state) = result.state {
            self.tracker.apply_state(&pending.hub, state);
        }

        let outcome = match result.error {
            Some(error) => Err(ClientError::Server(error)),
            None => Ok(result.result.unwrap_or(Value::Null)),
        };
        let _ = pending.slot.send(outcome);
    }

    /// Queues a server-initiated call for handler dispatch.
    ///
    /// Calls whose target has no registered handler are silently discarded
    /// at dispatch time; the server cannot know which hubs the client has
    /// chosen to handle.
    pub fn route_server_call(&self, call: ServerCall) {
        let Some((hub, method)) = call.split_target() else {
            debug!("Discarding server call with unqualified target {}", call.target);
            return;
        };
        let queued = QueuedCall {
            hub: hub.to_string(),
            method: method.to_string(),
            args: call.args,
        };
        if let Some(state) = call.state {
            self.tracker.apply_state(&queued.hub, state);
        }
        let _ = self.dispatch_tx.send(queued);
    }

    /// Fails every pending invocation with a connection-lost error.
    ///
    /// Each slot is a one-shot sender, so resolution is deterministic and
    /// exactly once even if a result for the same id arrives later.
    pub async fn fail_all(&self, reason: &str) {
        let mut pending = self.pending.write().await;
        if !pending.is_empty() {
            debug!("Failing {} pending invocation(s): {}", pending.len(), reason);
        }
        for (_, invocation) in pending.drain() {
            let _ = invocation
                .slot
                .send(Err(ClientError::ConnectionLost(reason.to_string())));
        }
    }

    /// Number of unresolved invocations.
    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    /// Snapshot of a hub's tracked state for an outbound frame.
    pub fn state_snapshot(&self, hub: &str) -> Option<HashMap<String, Value>> {
        self.tracker.state_snapshot(hub)
    }

    /// Handle to the handler registry for the dispatcher task. Holding only
    /// this (and not a bus clone) lets the dispatch queue close when the
    /// bus is dropped.
    pub(crate) fn handlers(&self) -> HandlerMap {
        Arc::clone(&self.handlers)
    }
}

fn handler_key(hub: &str, method: &str) -> (String, String) {
    (hub.to_lowercase(), method.to_lowercase())
}

/// Consumes the dispatch queue, resolving handlers at call time.
///
/// Runs as its own task for the client's lifetime; ends when the bus side
/// of the queue is dropped.
pub(crate) async fn run_dispatcher(
    handlers: HandlerMap,
    mut queue: mpsc::UnboundedReceiver<QueuedCall>,
) {
    while let Some(call) = queue.recv().await {
        let handlers = handlers.read().await;
        match handlers.get(&handler_key(&call.hub, &call.method)) {
            Some(handler) => handler(call.args),
            None => debug!("No handler for {}.{}, discarding", call.hub, call.method),
        }
    }
}
