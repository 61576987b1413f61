//! Connection lifecycle tests against an in-memory transport.
//!
//! The mock implements the [`Transport`] contract: negotiation returns a
//! canned response and each `open` hands the test a server-side view of the
//! session (its URL, an event sender and the outbound payload stream).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::time::{advance, Duration};

use hubwire::negotiate::NegotiationResponse;
use hubwire::transport::{ConnectRequest, Transport, TransportChannels, TransportEvent};
use hubwire::{Backoff, ClientConfig, ClientError, ConnectionState, HubClient, ReconnectPolicy};

/// Server-side view of one opened mock session.
struct ServerSide {
    url: url::Url,
    events: mpsc::UnboundedSender<TransportEvent>,
    outbound: mpsc::UnboundedReceiver<String>,
    #[allow(dead_code)]
    stop: watch::Receiver<bool>,
}

impl ServerSide {
    fn send_payload(&self, payload: Value) {
        let _ = self
            .events
            .send(TransportEvent::Payload(payload.to_string()));
    }

    fn close(&self, reason: Option<&str>) {
        let _ = self
            .events
            .send(TransportEvent::Closed(reason.map(Into::into)));
    }

    async fn next_outbound(&mut self) -> Value {
        let payload = self.outbound.recv().await.expect("outbound closed");
        serde_json::from_str(&payload).expect("outbound payload is JSON")
    }

    fn query(&self, key: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }
}

struct MockTransport {
    response: NegotiationResponse,
    fail_negotiate: bool,
    sessions: mpsc::UnboundedSender<ServerSide>,
    /// Successful opens remaining; further opens are refused.
    open_budget: AtomicU32,
}

#[async_trait]
impl Transport for MockTransport {
    async fn negotiate(&self, _config: &ClientConfig) -> Result<NegotiationResponse, ClientError> {
        if self.fail_negotiate {
            return Err(ClientError::NegotiationFailed("endpoint unreachable".into()));
        }
        Ok(self.response.clone())
    }

    async fn open(&self, request: ConnectRequest) -> Result<TransportChannels, ClientError> {
        let remaining = self.open_budget.load(Ordering::SeqCst);
        if remaining == 0 {
            return Err(ClientError::Transport("connection refused".into()));
        }
        self.open_budget.store(remaining - 1, Ordering::SeqCst);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let _ = self.sessions.send(ServerSide {
            url: request.url,
            events: event_tx,
            outbound: outbound_rx,
            stop: stop_rx,
        });
        Ok(TransportChannels {
            outbound: outbound_tx,
            events: event_rx,
            stop: stop_tx,
        })
    }
}

fn negotiation(keep_alive: Option<f64>, disconnect: f64) -> NegotiationResponse {
    NegotiationResponse {
        connection_token: "tok-1".into(),
        connection_id: "conn-1".into(),
        protocol_version: "1.5".into(),
        keep_alive_timeout: keep_alive,
        disconnect_timeout: disconnect,
        try_web_sockets: true,
    }
}

fn quick_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        backoff: Backoff::Exponential,
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(8),
        max_attempts: None,
        jitter: 0.0,
    }
}

fn build_client(
    response: NegotiationResponse,
    policy: ReconnectPolicy,
    open_budget: u32,
    fail_negotiate: bool,
) -> (HubClient, mpsc::UnboundedReceiver<ServerSide>) {
    let (sessions_tx, sessions_rx) = mpsc::unbounded_channel();
    let transport = Arc::new(MockTransport {
        response,
        fail_negotiate,
        sessions: sessions_tx,
        open_budget: AtomicU32::new(open_budget),
    });
    let config = ClientConfig::new("http://example.org/hub")
        .unwrap()
        .with_reconnect_policy(policy);
    (HubClient::with_transport(config, transport), sessions_rx)
}

/// Starts a client and answers the first open with an initialization frame.
async fn establish(
    response: NegotiationResponse,
    policy: ReconnectPolicy,
    open_budget: u32,
) -> (HubClient, ServerSide, mpsc::UnboundedReceiver<ServerSide>) {
    let (client, mut sessions) = build_client(response, policy, open_budget, false);
    let (started, session) = tokio::join!(client.start(), async {
        let session = sessions.recv().await.expect("no session opened");
        session.send_payload(json!({"initialized": true}));
        session
    });
    started.expect("start failed");
    assert_eq!(client.state(), ConnectionState::Active);
    (client, session, sessions)
}

async fn wait_for(client: &HubClient, wanted: fn(&ConnectionState) -> bool) {
    let mut states = client.state_changes();
    loop {
        if wanted(&states.borrow_and_update()) {
            return;
        }
        states.changed().await.expect("state stream ended");
    }
}

#[tokio::test]
async fn start_establishes_active_connection() {
    let (client, session, _sessions) =
        establish(negotiation(Some(10.0), 30.0), quick_policy(), 1).await;
    assert_eq!(session.url.path(), "/hub/connect");
    assert_eq!(session.query("connectionToken").as_deref(), Some("tok-1"));
    assert_eq!(session.query("connectionId").as_deref(), Some("conn-1"));
    assert!(session.query("messageId").is_none());
    client.stop().await;
}

#[tokio::test]
async fn failed_negotiation_is_fatal() {
    let (client, _sessions) = build_client(negotiation(None, 30.0), quick_policy(), 1, true);
    let err = client.start().await.unwrap_err();
    assert!(matches!(err, ClientError::NegotiationFailed(_)));
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn invoke_resolves_with_correlated_result() {
    let (client, mut session, _sessions) =
        establish(negotiation(Some(10.0), 30.0), quick_policy(), 1).await;

    let handle = client.invoke("Chat", "Send", &["hi"]).await.unwrap();
    assert_eq!(handle.correlation_id(), 1);

    let frame = session.next_outbound().await;
    assert_eq!(frame["correlationId"], json!(1));
    assert_eq!(frame["target"], json!("Chat.Send"));
    assert_eq!(frame["args"], json!(["hi"]));

    session.send_payload(json!({
        "cursor": 1,
        "messages": [{"correlationId": 1, "result": "ok"}]
    }));
    let reply: String = handle.result_as().await.unwrap();
    assert_eq!(reply, "ok");
    client.stop().await;
}

#[tokio::test]
async fn invoke_outside_active_is_rejected() {
    let (client, _sessions) = build_client(negotiation(None, 30.0), quick_policy(), 1, false);
    let err = client.invoke("Chat", "Send", &["hi"]).await.unwrap_err();
    assert!(matches!(err, ClientError::NotConnected));
}

#[tokio::test]
async fn server_calls_route_to_registered_handler() {
    let (client, session, _sessions) =
        establish(negotiation(Some(10.0), 30.0), quick_policy(), 1).await;

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    client
        .on("Chat", "Receive", move |args| {
            let _ = seen_tx.send(args);
        })
        .await;

    session.send_payload(json!({
        "cursor": 1,
        "messages": [{"target": "Chat.Receive", "args": ["hi"]}]
    }));
    assert_eq!(seen_rx.recv().await.unwrap(), vec![json!("hi")]);

    // An unhandled call is discarded without disturbing the stream.
    session.send_payload(json!({
        "cursor": 2,
        "messages": [{"target": "Presence.Changed", "args": [1]}]
    }));
    session.send_payload(json!({
        "cursor": 3,
        "messages": [{"target": "Chat.Receive", "args": ["again"]}]
    }));
    assert_eq!(seen_rx.recv().await.unwrap(), vec![json!("again")]);
    assert_eq!(client.state(), ConnectionState::Active);
    client.stop().await;
}

#[tokio::test(start_paused = true)]
async fn heartbeat_silence_reconnects_then_disconnects() {
    // With a 10s keep-alive and a 30s disconnect timeout, silence puts the
    // connection in Reconnecting at 20s and finalizes it at 30s.
    let (client, _session, _sessions) =
        establish(negotiation(Some(10.0), 30.0), quick_policy(), 1).await;

    advance(Duration::from_secs(21)).await;
    tokio::task::yield_now().await;
    assert!(matches!(
        client.state(),
        ConnectionState::Reconnecting { .. }
    ));

    advance(Duration::from_secs(10)).await;
    wait_for(&client, |s| *s == ConnectionState::Disconnected).await;
}

#[tokio::test]
async fn transport_close_triggers_resume_with_cursor() {
    let (client, session, mut sessions) =
        establish(negotiation(Some(10.0), 30.0), quick_policy(), 2).await;

    session.send_payload(json!({"cursor": 5, "groupsToken": "grp-5"}));
    session.close(Some("gone"));

    let resumed = sessions.recv().await.expect("no resume attempt");
    assert_eq!(resumed.url.path(), "/hub/reconnect");
    assert_eq!(resumed.query("messageId").as_deref(), Some("5"));
    assert_eq!(resumed.query("groupsToken").as_deref(), Some("grp-5"));
    assert_eq!(resumed.query("connectionToken").as_deref(), Some("tok-1"));

    // Resume needs no re-initialization.
    wait_for(&client, |s| *s == ConnectionState::Active).await;
    client.stop().await;
}

#[tokio::test]
async fn pending_invocation_survives_reconnect() {
    // An invocation outstanding across a transport drop is neither failed
    // nor re-sent; it resolves once the resumed stream answers it.
    let (client, mut session, mut sessions) =
        establish(negotiation(Some(10.0), 30.0), quick_policy(), 2).await;

    let mut handle = client.invoke("Chat", "Send", &["hi"]).await.unwrap();
    let _ = session.next_outbound().await;
    session.close(None);

    let resumed = sessions.recv().await.expect("no resume attempt");
    wait_for(&client, |s| *s == ConnectionState::Active).await;
    assert!(handle.try_result().is_none());

    resumed.send_payload(json!({
        "cursor": 1,
        "messages": [{"correlationId": 1, "result": "late"}]
    }));
    assert_eq!(handle.result().await.unwrap(), json!("late"));
    client.stop().await;
}

#[tokio::test(start_paused = true)]
async fn exhausted_reconnect_fails_pending_invocations() {
    let policy = ReconnectPolicy {
        max_attempts: Some(2),
        ..quick_policy()
    };
    let (client, mut session, _sessions) =
        establish(negotiation(Some(10.0), 30.0), policy, 1).await;

    let handle = client.invoke("Chat", "Send", &["hi"]).await.unwrap();
    let _ = session.next_outbound().await;
    session.close(None);

    wait_for(&client, |s| *s == ConnectionState::Disconnected).await;
    assert!(matches!(
        handle.result().await,
        Err(ClientError::ConnectionLost(_))
    ));
}

#[tokio::test]
async fn cursor_regression_is_desync_and_not_redelivered() {
    let (client, session, mut sessions) =
        establish(negotiation(Some(10.0), 30.0), quick_policy(), 2).await;

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    client
        .on("Chat", "Receive", move |args| {
            let _ = seen_tx.send(args);
        })
        .await;

    session.send_payload(json!({
        "cursor": 5,
        "messages": [{"target": "Chat.Receive", "args": ["first"]}]
    }));
    assert_eq!(seen_rx.recv().await.unwrap(), vec![json!("first")]);

    // A repeated cursor must not be delivered; the stream resumes from the
    // last consumed position instead.
    session.send_payload(json!({
        "cursor": 5,
        "messages": [{"target": "Chat.Receive", "args": ["duplicate"]}]
    }));

    let resumed = sessions.recv().await.expect("desync did not force reconnect");
    assert_eq!(resumed.query("messageId").as_deref(), Some("5"));
    wait_for(&client, |s| *s == ConnectionState::Active).await;
    assert!(seen_rx.try_recv().is_err());
    client.stop().await;
}

#[tokio::test]
async fn server_reconnect_hint_is_honored() {
    let (client, session, mut sessions) =
        establish(negotiation(Some(10.0), 30.0), quick_policy(), 2).await;

    session.send_payload(json!({"cursor": 2, "shouldReconnect": true}));

    let resumed = sessions.recv().await.expect("hint did not force reconnect");
    assert_eq!(resumed.url.path(), "/hub/reconnect");
    wait_for(&client, |s| *s == ConnectionState::Active).await;
    client.stop().await;
}

#[tokio::test]
async fn fatal_server_error_finalizes_and_drains() {
    let (client, session, _sessions) =
        establish(negotiation(Some(10.0), 30.0), quick_policy(), 1).await;

    let handle = client.invoke("Chat", "Send", &["hi"]).await.unwrap();
    session.send_payload(json!({"error": "connection rejected"}));

    wait_for(&client, |s| *s == ConnectionState::Disconnected).await;
    assert!(matches!(
        handle.result().await,
        Err(ClientError::ConnectionLost(_))
    ));
}

#[tokio::test]
async fn stop_is_idempotent_and_drains_pending() {
    let (client, mut session, _sessions) =
        establish(negotiation(Some(10.0), 30.0), quick_policy(), 1).await;

    let handle = client.invoke("Chat", "Send", &["hi"]).await.unwrap();
    let _ = session.next_outbound().await;

    client.stop().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(matches!(
        handle.result().await,
        Err(ClientError::ConnectionLost(_))
    ));

    client.stop().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn groups_token_rides_on_frames_after_reconnect() {
    let (client, session, mut sessions) =
        establish(negotiation(Some(10.0), 30.0), quick_policy(), 2).await;

    session.send_payload(json!({"cursor": 1, "groupsToken": "grp-1"}));
    session.close(None);

    let mut resumed = sessions.recv().await.expect("no resume attempt");
    wait_for(&client, |s| *s == ConnectionState::Active).await;

    let _handle = client.invoke("Chat", "Send", &["hi"]).await.unwrap();
    let frame = resumed.next_outbound().await;
    assert_eq!(frame["groupsToken"], json!("grp-1"));
    client.stop().await;
}

#[tokio::test]
async fn malformed_payload_is_dropped_without_killing_the_stream() {
    let (client, session, _sessions) =
        establish(negotiation(Some(10.0), 30.0), quick_policy(), 1).await;

    let _ = session
        .events
        .send(TransportEvent::Payload("not json".into()));
    let _ = session
        .events
        .send(TransportEvent::Payload("[1,2,3]".into()));

    let handle = client.invoke("Chat", "Send", &["hi"]).await.unwrap();
    session.send_payload(json!({
        "cursor": 1,
        "messages": [{"correlationId": 1, "result": "still alive"}]
    }));
    assert_eq!(handle.result().await.unwrap(), json!("still alive"));
    assert_eq!(client.state(), ConnectionState::Active);
    client.stop().await;
}

#[tokio::test]
async fn restart_after_stop_renegotiates() {
    let (client, _session, mut sessions) =
        establish(negotiation(Some(10.0), 30.0), quick_policy(), 2).await;
    client.stop().await;

    let (started, session) = tokio::join!(client.start(), async {
        let session = sessions.recv().await.expect("no session after restart");
        session.send_payload(json!({"initialized": true}));
        session
    });
    started.expect("restart failed");
    // A fresh negotiation starts a fresh stream: connect, not reconnect.
    assert_eq!(session.url.path(), "/hub/connect");
    assert!(session.query("messageId").is_none());
    client.stop().await;
}
