//! Integration tests for supabase-client-realtime.
//!
//! `mock` runs against an in-process Phoenix-style websocket server; `live`
//! needs a local Supabase stack and is ignored by default.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::mpsc;

use supabase_client_realtime::{
    ChannelStatus, PostgresChangesEvent, PostgresChangesFilter, PushStatus, RealtimeClient,
    RealtimeConfig, RealtimeError, RealtimeMessage, SocketStatus,
};

// ── Mock Server ───────────────────────────────────────────────────────────────

mod server {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::{mpsc, oneshot};
    use tokio_tungstenite::tungstenite::Message;

    #[derive(Clone)]
    pub struct Behavior {
        pub answer_heartbeats: bool,
        pub ack_broadcasts: bool,
        /// Joins on these topics get no reply.
        pub silent_joins: Vec<String>,
        /// Joins on these topics are refused.
        pub rejected_joins: Vec<String>,
        /// Hold acknowledged broadcasts until this many arrived, then send a
        /// reply for an unknown ref followed by the real replies newest first.
        pub reversed_acks: usize,
    }

    impl Default for Behavior {
        fn default() -> Self {
            Self {
                answer_heartbeats: true,
                ack_broadcasts: true,
                silent_joins: Vec::new(),
                rejected_joins: Vec::new(),
                reversed_acks: 0,
            }
        }
    }

    #[derive(Default)]
    struct State {
        received: Mutex<Vec<Value>>,
        connections: AtomicUsize,
        to_client: Mutex<Option<mpsc::UnboundedSender<Message>>>,
        kill: Mutex<Option<oneshot::Sender<()>>>,
    }

    pub struct MockServer {
        pub url: String,
        state: Arc<State>,
    }

    impl MockServer {
        pub async fn start(behavior: Behavior) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let url = format!("http://{}", listener.local_addr().unwrap());
            let state = Arc::new(State::default());

            let accept_state = Arc::clone(&state);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(serve(stream, Arc::clone(&accept_state), behavior.clone()));
                }
            });

            Self { url, state }
        }

        pub fn connections(&self) -> usize {
            self.state.connections.load(Ordering::SeqCst)
        }

        /// Every message received so far with the given event.
        pub fn received(&self, event: &str) -> Vec<Value> {
            self.state
                .received
                .lock()
                .unwrap()
                .iter()
                .filter(|m| m["event"] == event)
                .cloned()
                .collect()
        }

        /// Push a frame to the currently connected client.
        pub fn send(&self, message: Value) {
            let guard = self.state.to_client.lock().unwrap();
            let tx = guard.as_ref().expect("no client connected");
            tx.send(Message::Text(message.to_string().into())).unwrap();
        }

        /// Drop the current connection without a close frame.
        pub fn drop_connection(&self) {
            if let Some(kill) = self.state.kill.lock().unwrap().take() {
                let _ = kill.send(());
            }
        }
    }

    async fn serve(stream: TcpStream, state: Arc<State>, behavior: Behavior) {
        let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
            return;
        };
        let (mut sink, mut read) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (kill_tx, mut kill_rx) = oneshot::channel();
        *state.to_client.lock().unwrap() = Some(tx);
        *state.kill.lock().unwrap() = Some(kill_tx);
        state.connections.fetch_add(1, Ordering::SeqCst);

        let mut broadcast_ack: HashMap<String, bool> = HashMap::new();
        let mut held: Vec<Value> = Vec::new();
        loop {
            tokio::select! {
                _ = &mut kill_rx => return,
                Some(out) = rx.recv() => {
                    if sink.send(out).await.is_err() {
                        return;
                    }
                }
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        let msg: Value = serde_json::from_str(&text).unwrap();
                        state.received.lock().unwrap().push(msg.clone());
                        for reply in respond(&behavior, &mut broadcast_ack, &mut held, &msg) {
                            if sink.send(Message::Text(reply.to_string().into())).await.is_err() {
                                return;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                    _ => {}
                }
            }
        }
    }

    fn reply(msg: &Value, status: &str, response: Value) -> Value {
        json!({
            "topic": msg["topic"],
            "event": "phx_reply",
            "payload": {"status": status, "response": response},
            "ref": msg["ref"],
            "join_ref": msg["join_ref"],
        })
    }

    fn respond(
        behavior: &Behavior,
        broadcast_ack: &mut HashMap<String, bool>,
        held: &mut Vec<Value>,
        msg: &Value,
    ) -> Vec<Value> {
        let topic = msg["topic"].as_str().unwrap_or_default().to_string();
        match msg["event"].as_str().unwrap_or_default() {
            "heartbeat" if behavior.answer_heartbeats => vec![reply(msg, "ok", json!({}))],
            "phx_join" => {
                if behavior.silent_joins.contains(&topic) {
                    return Vec::new();
                }
                if behavior.rejected_joins.contains(&topic) {
                    return vec![reply(msg, "error", json!({"reason": "unauthorized"}))];
                }
                let config = &msg["payload"]["config"];
                broadcast_ack.insert(topic, config["broadcast"]["ack"] == true);
                let changes: Vec<Value> = config["postgres_changes"]
                    .as_array()
                    .map(|filters| {
                        filters
                            .iter()
                            .enumerate()
                            .map(|(i, f)| {
                                let mut entry = f.clone();
                                entry["id"] = json!(100 + i);
                                entry
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                vec![reply(msg, "ok", json!({"postgres_changes": changes}))]
            }
            "phx_leave" => vec![
                reply(msg, "ok", json!({})),
                json!({
                    "topic": topic,
                    "event": "phx_close",
                    "payload": {},
                    "ref": null,
                    "join_ref": msg["join_ref"],
                }),
            ],
            "broadcast" if behavior.reversed_acks > 0 && broadcast_ack.get(&topic) == Some(&true) => {
                held.push(msg.clone());
                if held.len() < behavior.reversed_acks {
                    return Vec::new();
                }
                let mut stray = reply(msg, "error", json!({}));
                stray["ref"] = json!("no-such-ref");
                let mut out = vec![stray];
                out.extend(held.drain(..).rev().map(|m| reply(&m, "ok", json!({}))));
                out
            }
            "broadcast" if behavior.ack_broadcasts && broadcast_ack.get(&topic) == Some(&true) => {
                vec![reply(msg, "ok", json!({}))]
            }
            "presence" => vec![reply(msg, "ok", json!({}))],
            _ => Vec::new(),
        }
    }
}

use server::{Behavior, MockServer};

fn config(server: &MockServer) -> RealtimeConfig {
    RealtimeConfig::new(&server.url, "anon-key")
        .timeout_interval(Duration::from_secs(2))
        .reconnect_delay(Duration::from_millis(100))
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn collector<T: Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(T) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |item| sink.lock().unwrap().push(item))
}

// ── Tests against the mock server ─────────────────────────────────────────────

mod mock {
    use super::*;

    #[tokio::test]
    async fn subscribe_connects_and_joins() {
        let server = MockServer::start(Behavior::default()).await;
        let client = RealtimeClient::with_config(config(&server)).unwrap();

        let channel = client.channel("room-1").subscribe().await.unwrap();
        assert_eq!(channel.status(), ChannelStatus::Subscribed);
        assert_eq!(client.status(), SocketStatus::Connected);
        assert_eq!(channel.topic(), "realtime:room-1");

        let joins = server.received("phx_join");
        assert_eq!(joins.len(), 1);
        assert_eq!(joins[0]["topic"], "realtime:room-1");
        assert_eq!(joins[0]["ref"], joins[0]["join_ref"]);
        assert_eq!(joins[0]["payload"]["access_token"], "anon-key");
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let server = MockServer::start(Behavior::default()).await;
        let client = RealtimeClient::with_config(config(&server)).unwrap();

        let (a, b) = tokio::join!(client.connect(), client.connect());
        a.unwrap();
        b.unwrap();
        client.connect().await.unwrap();
        assert_eq!(server.connections(), 1);
    }

    #[tokio::test]
    async fn rejected_join_surfaces_reason() {
        let server = MockServer::start(Behavior {
            rejected_joins: vec!["realtime:secret".into()],
            ..Behavior::default()
        })
        .await;
        let client = RealtimeClient::with_config(config(&server)).unwrap();
        let channel = client.channel("secret").build().unwrap();

        match channel.subscribe().await {
            Err(RealtimeError::ServerError(reason)) => assert_eq!(reason, "unauthorized"),
            other => panic!("expected server error, got {other:?}"),
        }
        assert_eq!(channel.status(), ChannelStatus::Unsubscribed);
    }

    #[tokio::test]
    async fn unanswered_join_times_out() {
        let server = MockServer::start(Behavior {
            silent_joins: vec!["realtime:slow".into()],
            ..Behavior::default()
        })
        .await;
        let client = RealtimeClient::with_config(
            config(&server).timeout_interval(Duration::from_millis(300)),
        )
        .unwrap();
        let channel = client.channel("slow").build().unwrap();

        let start = Instant::now();
        assert!(matches!(
            channel.subscribe().await,
            Err(RealtimeError::Timeout(_))
        ));
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert_eq!(channel.status(), ChannelStatus::Unsubscribed);
    }

    #[tokio::test]
    async fn send_without_ack_returns_immediately() {
        let server = MockServer::start(Behavior::default()).await;
        let client = RealtimeClient::with_config(config(&server)).unwrap();
        let channel = client.channel("room-1").subscribe().await.unwrap();

        let status = channel.send("msg", json!({"text": "hi"})).await.unwrap();
        assert_eq!(status, PushStatus::Ok);

        wait_until("broadcast to arrive", || !server.received("broadcast").is_empty()).await;
        let sent = &server.received("broadcast")[0];
        assert_eq!(sent["payload"]["event"], "msg");
        assert_eq!(sent["payload"]["payload"]["text"], "hi");
    }

    #[tokio::test]
    async fn send_with_ack_waits_for_reply() {
        let server = MockServer::start(Behavior::default()).await;
        let client = RealtimeClient::with_config(config(&server)).unwrap();
        let channel = client
            .channel("room-1")
            .broadcast_ack(true)
            .subscribe()
            .await
            .unwrap();

        let status = channel.send("msg", json!({})).await.unwrap();
        assert_eq!(status, PushStatus::Ok);
    }

    #[tokio::test]
    async fn acks_are_matched_by_ref_not_arrival_order() {
        let server = MockServer::start(Behavior {
            reversed_acks: 2,
            ..Behavior::default()
        })
        .await;
        let client = RealtimeClient::with_config(config(&server)).unwrap();
        let channel = client
            .channel("room-1")
            .broadcast_ack(true)
            .subscribe()
            .await
            .unwrap();

        let (first, second) = tokio::join!(
            channel.send("msg", json!({"n": 1})),
            channel.send("msg", json!({"n": 2})),
        );
        // The stray reply is an error; had it matched either send, that send
        // would not be Ok.
        assert_eq!(first.unwrap(), PushStatus::Ok);
        assert_eq!(second.unwrap(), PushStatus::Ok);

        let sent = server.received("broadcast");
        assert_eq!(sent.len(), 2);
        assert_ne!(sent[0]["ref"], sent[1]["ref"]);
    }

    #[tokio::test]
    async fn unacknowledged_send_times_out_after_timeout() {
        let server = MockServer::start(Behavior {
            ack_broadcasts: false,
            ..Behavior::default()
        })
        .await;
        let client = RealtimeClient::with_config(
            config(&server).timeout_interval(Duration::from_secs(1)),
        )
        .unwrap();
        let channel = client
            .channel("room:1")
            .broadcast_ack(true)
            .subscribe()
            .await
            .unwrap();

        let start = Instant::now();
        let status = channel.send("msg", json!({"body": "hello"})).await.unwrap();
        let elapsed = start.elapsed();
        assert_eq!(status, PushStatus::Timeout);
        assert!(elapsed >= Duration::from_secs(1), "resolved early: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(3), "resolved late: {elapsed:?}");
    }

    #[tokio::test]
    async fn send_requires_subscription() {
        let server = MockServer::start(Behavior::default()).await;
        let client = RealtimeClient::with_config(config(&server)).unwrap();
        let channel = client.channel("room-1").build().unwrap();

        assert!(matches!(
            channel.send("msg", json!({})).await,
            Err(RealtimeError::InvalidChannelState {
                actual: ChannelStatus::Unsubscribed,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let server = MockServer::start(Behavior::default()).await;
        let client = RealtimeClient::with_config(config(&server)).unwrap();
        let channel = client.channel("room-1").subscribe().await.unwrap();
        assert_eq!(client.channels().len(), 1);

        channel.unsubscribe().await.unwrap();
        assert_eq!(channel.status(), ChannelStatus::Unsubscribed);
        assert!(client.channels().is_empty());

        channel.unsubscribe().await.unwrap();
        assert_eq!(server.received("phx_leave").len(), 1);
    }

    #[tokio::test]
    async fn broadcasts_reach_bindings_and_unknown_topics_are_dropped() {
        let server = MockServer::start(Behavior::default()).await;
        let client = RealtimeClient::with_config(config(&server)).unwrap();
        let (seen, on_broadcast) = collector::<Value>();
        let (all, on_any) = collector::<Value>();
        let _channel = client
            .channel("room-1")
            .on_broadcast("msg", on_broadcast)
            .on_broadcast("*", on_any)
            .subscribe()
            .await
            .unwrap();

        server.send(json!({
            "topic": "realtime:nobody",
            "event": "broadcast",
            "payload": {"type": "broadcast", "event": "msg", "payload": {"n": 0}},
            "ref": null,
        }));
        server.send(json!({
            "topic": "realtime:room-1",
            "event": "broadcast",
            "payload": {"type": "broadcast", "event": "other", "payload": {"n": 1}},
            "ref": null,
        }));
        server.send(json!({
            "topic": "realtime:room-1",
            "event": "broadcast",
            "payload": {"type": "broadcast", "event": "msg", "payload": {"n": 2}},
            "ref": null,
        }));

        wait_until("broadcast callback", || seen.lock().unwrap().len() == 1).await;
        assert_eq!(seen.lock().unwrap()[0]["n"], 2);
        wait_until("wildcard callback", || all.lock().unwrap().len() == 2).await;
        assert_eq!(client.status(), SocketStatus::Connected);
    }

    #[tokio::test]
    async fn postgres_changes_routed_by_server_id() {
        let server = MockServer::start(Behavior::default()).await;
        let client = RealtimeClient::with_config(config(&server)).unwrap();
        let (messages, on_messages) = collector::<String>();
        let (users, on_users) = collector::<String>();
        let _channel = client
            .channel("db")
            .on_postgres_changes(
                PostgresChangesEvent::Insert,
                PostgresChangesFilter::new("public", "messages"),
                move |change| on_messages(change.table),
            )
            .on_postgres_changes(
                PostgresChangesEvent::All,
                PostgresChangesFilter::new("public", "users"),
                move |change| on_users(change.table),
            )
            .subscribe()
            .await
            .unwrap();

        let join = &server.received("phx_join")[0];
        assert_eq!(join["payload"]["config"]["postgres_changes"][0]["event"], "INSERT");

        server.send(json!({
            "topic": "realtime:db",
            "event": "postgres_changes",
            "payload": {
                "ids": [101],
                "data": {
                    "schema": "public",
                    "table": "users",
                    "type": "UPDATE",
                    "record": {"id": 1}
                }
            },
            "ref": null,
        }));

        wait_until("users change", || users.lock().unwrap().len() == 1).await;
        assert_eq!(users.lock().unwrap()[0], "users");
        assert!(messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn presence_sync_and_diff() {
        let server = MockServer::start(Behavior::default()).await;
        let client = RealtimeClient::with_config(config(&server)).unwrap();
        let (joins, on_join) = collector::<String>();
        let (leaves, on_leave) = collector::<String>();
        let channel = client
            .channel("lobby")
            .presence_key("alice")
            .on_presence_join(move |key, _| on_join(key.to_string()))
            .on_presence_leave(move |key, _| on_leave(key.to_string()))
            .subscribe()
            .await
            .unwrap();

        assert_eq!(channel.track(json!({"online": true})).await.unwrap(), PushStatus::Ok);
        let track = &server.received("presence")[0];
        assert_eq!(track["payload"]["event"], "track");

        server.send(json!({
            "topic": "realtime:lobby",
            "event": "presence_state",
            "payload": {"alice": {"metas": [{"phx_ref": "a1", "online": true}]}},
            "ref": null,
        }));
        server.send(json!({
            "topic": "realtime:lobby",
            "event": "presence_diff",
            "payload": {
                "joins": {"bob": {"metas": [{"phx_ref": "b1"}]}},
                "leaves": {"alice": {"metas": [{"phx_ref": "a1"}]}}
            },
            "ref": null,
        }));

        wait_until("presence leave", || leaves.lock().unwrap().len() == 1).await;
        assert_eq!(*joins.lock().unwrap(), vec!["alice".to_string(), "bob".to_string()]);
        assert_eq!(leaves.lock().unwrap()[0], "alice");
        let state = channel.presence_state();
        assert!(state.contains_key("bob"));
        assert!(!state.contains_key("alice"));
    }

    #[tokio::test]
    async fn server_close_unsubscribes_channel() {
        let server = MockServer::start(Behavior::default()).await;
        let client = RealtimeClient::with_config(config(&server)).unwrap();
        let channel = client.channel("room-1").subscribe().await.unwrap();
        let join_ref = server.received("phx_join")[0]["join_ref"].clone();

        server.send(json!({
            "topic": "realtime:room-1",
            "event": "phx_close",
            "payload": {},
            "ref": null,
            "join_ref": join_ref,
        }));

        let mut status = channel.status_changes();
        tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|s| *s == ChannelStatus::Unsubscribed),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn heartbeats_keep_connection_alive() {
        let server = MockServer::start(Behavior::default()).await;
        let client = RealtimeClient::with_config(
            config(&server).heartbeat_interval(Duration::from_millis(100)),
        )
        .unwrap();
        client.connect().await.unwrap();

        wait_until("heartbeats", || server.received("heartbeat").len() >= 3).await;
        assert_eq!(client.status(), SocketStatus::Connected);
        assert_eq!(server.connections(), 1);
        assert!(server.received("heartbeat").iter().all(|h| h["topic"] == "phoenix"));
    }

    #[tokio::test]
    async fn missed_heartbeat_reconnects_and_rejoins() {
        let server = MockServer::start(Behavior {
            answer_heartbeats: false,
            ..Behavior::default()
        })
        .await;
        let client = RealtimeClient::with_config(
            config(&server).heartbeat_interval(Duration::from_millis(150)),
        )
        .unwrap();
        let channel = client.channel("room-1").subscribe().await.unwrap();

        wait_until("reconnect", || server.connections() >= 2).await;
        wait_until("rejoin", || {
            server.received("phx_join").len() >= 2 && channel.status() == ChannelStatus::Subscribed
        })
        .await;
    }

    #[tokio::test]
    async fn messages_pushed_while_disconnected_are_flushed() {
        let server = MockServer::start(Behavior::default()).await;
        let client = RealtimeClient::with_config(
            config(&server).reconnect_delay(Duration::from_millis(300)),
        )
        .unwrap();
        client.connect().await.unwrap();

        server.drop_connection();
        let mut status = client.status_changes();
        tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|s| *s == SocketStatus::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();

        client.push(RealtimeMessage::new("realtime:queued", "custom", json!({"n": 1})));
        wait_until("flush after reconnect", || !server.received("custom").is_empty()).await;
        assert_eq!(server.connections(), 2);
        assert!(server.received("custom")[0]["ref"].is_string());
    }

    #[tokio::test]
    async fn disconnect_unsubscribes_and_stops_reconnecting() {
        let server = MockServer::start(Behavior::default()).await;
        let client = RealtimeClient::with_config(config(&server)).unwrap();
        let channel = client.channel("room-1").subscribe().await.unwrap();

        client.disconnect().await;
        assert_eq!(client.status(), SocketStatus::Disconnected);
        assert_eq!(channel.status(), ChannelStatus::Unsubscribed);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(server.connections(), 1);

        // Resubscribing reconnects.
        channel.subscribe().await.unwrap();
        assert_eq!(server.connections(), 2);
    }

    #[tokio::test]
    async fn set_auth_updates_subscribed_channels() {
        let server = MockServer::start(Behavior::default()).await;
        let client = RealtimeClient::with_config(config(&server)).unwrap();
        let _channel = client.channel("room-1").subscribe().await.unwrap();

        client.set_auth(Some("user-jwt".into()));
        wait_until("access token push", || !server.received("access_token").is_empty()).await;
        let push = &server.received("access_token")[0];
        assert_eq!(push["topic"], "realtime:room-1");
        assert_eq!(push["payload"]["access_token"], "user-jwt");

        let other = client.channel("room-2").subscribe().await.unwrap();
        let joins = server.received("phx_join");
        assert_eq!(joins.last().unwrap()["payload"]["access_token"], "user-jwt");
        other.unsubscribe().await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_live_topic_is_rejected() {
        let server = MockServer::start(Behavior::default()).await;
        let client = RealtimeClient::with_config(config(&server)).unwrap();
        let _first = client.channel("room-1").subscribe().await.unwrap();

        assert!(matches!(
            client.channel("room-1").subscribe().await,
            Err(RealtimeError::ChannelAlreadyExists(_))
        ));
        assert_eq!(server.received("phx_join").len(), 1);
    }
}

// ── Live Tests (require local Supabase) ───────────────────────────────────────

mod live {
    use super::*;

    fn url() -> String {
        std::env::var("SUPABASE_URL").unwrap_or_else(|_| "http://127.0.0.1:54321".to_string())
    }

    fn key() -> String {
        std::env::var("SUPABASE_ANON_KEY").unwrap_or_default()
    }

    #[tokio::test]
    #[ignore = "requires a running Supabase instance"]
    async fn broadcast_round_trip() {
        let client = RealtimeClient::new(url(), key()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = client
            .channel("live-test")
            .broadcast_self(true)
            .broadcast_ack(true)
            .on_broadcast("ping", move |payload| {
                let _ = tx.send(payload);
            })
            .subscribe()
            .await
            .unwrap();

        assert_eq!(channel.send("ping", json!({"n": 1})).await.unwrap(), PushStatus::Ok);
        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received["n"], 1);

        client.remove_all_channels().await.unwrap();
        client.disconnect().await;
    }
}
