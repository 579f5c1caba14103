//! Realtime change feeds over the Phoenix websocket protocol.
//!
//! One socket per `Backend`, opened lazily on the first subscription and
//! owned by a background task. Subscriptions talk to that task through a
//! command channel; dropping a `Subscription` leaves its channel. When the
//! socket drops, the task reconnects after `reconnect_delay` and rejoins
//! every live channel.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, StreamExt};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

use crate::backend::Backend;
use crate::change::{Binding, PostgresChange};
use crate::error::BackendError;

/// Change subscriptions.
/// Real implementation: `Backend`. Test double: `MemoryBackend`.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, channel: ChannelConfig) -> Result<Subscription, BackendError>;
}

#[async_trait]
impl ChangeFeed for Backend {
    async fn subscribe(&self, channel: ChannelConfig) -> Result<Subscription, BackendError> {
        self.realtime
            .subscribe(channel.with_schema(&self.config().schema))
    }
}

/// A named channel with one or more `postgres_changes` bindings.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    pub name: String,
    pub bindings: Vec<Binding>,
}

impl ChannelConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bindings: Vec::new(),
        }
    }

    pub fn on(mut self, binding: Binding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// Point every binding at `schema`.
    pub fn with_schema(mut self, schema: &str) -> Self {
        for binding in &mut self.bindings {
            binding.schema = schema.to_string();
        }
        self
    }

    pub fn topic(&self) -> String {
        format!("realtime:{}", self.name)
    }

    pub fn matches(&self, change: &PostgresChange) -> bool {
        self.bindings.iter().any(|b| b.matches(change))
    }

    fn join_payload(&self, access_token: Option<&str>) -> Value {
        let mut payload = json!({
            "config": {
                "broadcast": { "ack": false, "self": false },
                "presence": { "key": "" },
                "postgres_changes": self.bindings.iter().map(Binding::to_json).collect::<Vec<_>>(),
            }
        });
        if let Some(token) = access_token {
            payload["access_token"] = Value::String(token.to_string());
        }
        payload
    }
}

/// Receiving end of a channel. Dropping it unsubscribes.
pub struct Subscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<PostgresChange>,
    _leave: Option<LeaveGuard>,
}

impl Subscription {
    /// Subscription fed directly by `rx`, with no socket behind it.
    pub fn detached(topic: impl Into<String>, rx: mpsc::UnboundedReceiver<PostgresChange>) -> Self {
        Self {
            topic: topic.into(),
            rx,
            _leave: None,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next change, or `None` once the feed has shut down.
    pub async fn recv(&mut self) -> Option<PostgresChange> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<PostgresChange> {
        self.rx.try_recv().ok()
    }
}

struct LeaveGuard {
    id: u64,
    commands: mpsc::UnboundedSender<Command>,
}

impl Drop for LeaveGuard {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Leave { id: self.id });
    }
}

enum Command {
    Join {
        id: u64,
        channel: ChannelConfig,
        tx: mpsc::UnboundedSender<PostgresChange>,
    },
    Leave {
        id: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PhoenixMessage {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    msg_ref: Option<String>,
}

pub(crate) struct RealtimeClient {
    url: Url,
    heartbeat: Duration,
    reconnect_delay: Duration,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    access_token: watch::Sender<Option<String>>,
    next_id: AtomicU64,
}

impl RealtimeClient {
    pub(crate) fn new(url: Url, heartbeat: Duration, reconnect_delay: Duration) -> Self {
        let (access_token, _rx) = watch::channel(None);
        Self {
            url,
            heartbeat,
            reconnect_delay,
            commands: Mutex::new(None),
            access_token,
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn set_access_token(&self, token: Option<String>) {
        self.access_token.send_replace(token);
    }

    fn subscribe(&self, channel: ChannelConfig) -> Result<Subscription, BackendError> {
        let commands = self.command_sender()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let topic = channel.topic();
        let (tx, rx) = mpsc::unbounded_channel();
        commands
            .send(Command::Join { id, channel, tx })
            .map_err(|_| BackendError::Realtime("realtime task has stopped".into()))?;
        Ok(Subscription {
            topic,
            rx,
            _leave: Some(LeaveGuard { id, commands }),
        })
    }

    /// Command sender for the connection task, spawning the task on first use.
    fn command_sender(&self) -> Result<mpsc::UnboundedSender<Command>, BackendError> {
        let mut guard = self
            .commands
            .lock()
            .map_err(|_| BackendError::Realtime("realtime lock poisoned".into()))?;
        if let Some(tx) = guard.as_ref().filter(|tx| !tx.is_closed()) {
            return Ok(tx.clone());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Connection {
            url: self.url.clone(),
            heartbeat: self.heartbeat,
            reconnect_delay: self.reconnect_delay,
            access_token: self.access_token.subscribe(),
            channels: ChannelTable::default(),
            next_ref: 0,
        };
        tokio::spawn(connection.run(rx));
        *guard = Some(tx.clone());
        Ok(tx)
    }
}

struct JoinedChannel {
    topic: String,
    config: ChannelConfig,
    tx: mpsc::UnboundedSender<PostgresChange>,
}

/// Live channels keyed by subscription id.
#[derive(Default)]
struct ChannelTable {
    entries: HashMap<u64, JoinedChannel>,
}

impl ChannelTable {
    /// Register a channel and return its topic. Topics stay unique per
    /// socket: a second subscription on the same name gets a suffix.
    fn insert(&mut self, id: u64, config: ChannelConfig, tx: mpsc::UnboundedSender<PostgresChange>) -> String {
        let base = config.topic();
        let topic = if self.entries.values().any(|c| c.topic == base) {
            format!("{}:{}", base, id)
        } else {
            base
        };
        self.entries.insert(
            id,
            JoinedChannel {
                topic: topic.clone(),
                config,
                tx,
            },
        );
        topic
    }

    fn remove(&mut self, id: u64) -> Option<String> {
        self.entries.remove(&id).map(|c| c.topic)
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn get(&self, id: u64) -> Option<&JoinedChannel> {
        self.entries.get(&id)
    }

    /// Deliver a server message. Returns the ids of subscriptions whose
    /// receiver is gone so the caller can leave them.
    fn route(&self, msg: &PhoenixMessage) -> (usize, Vec<u64>) {
        let mut delivered = 0;
        let mut closed = Vec::new();
        match msg.event.as_str() {
            "postgres_changes" => {
                let change = match serde_json::from_value::<PostgresChange>(msg.payload["data"].clone()) {
                    Ok(change) => change,
                    Err(e) => {
                        tracing::warn!(topic = %msg.topic, error = %e, "undecodable postgres change");
                        return (0, closed);
                    }
                };
                for (id, channel) in &self.entries {
                    if channel.topic != msg.topic || !channel.config.matches(&change) {
                        continue;
                    }
                    if channel.tx.send(change.clone()).is_ok() {
                        delivered += 1;
                    } else {
                        closed.push(*id);
                    }
                }
            }
            "phx_reply" => {
                if msg.payload["status"] == "error" {
                    tracing::warn!(topic = %msg.topic, response = %msg.payload["response"], "realtime join rejected");
                }
            }
            "phx_error" | "phx_close" => {
                tracing::warn!(topic = %msg.topic, event = %msg.event, "realtime channel closed by server");
            }
            other => {
                tracing::trace!(topic = %msg.topic, event = other, "realtime message ignored");
            }
        }
        (delivered, closed)
    }
}

enum ConnectionEnd {
    Shutdown,
    Disconnected(String),
}

struct Connection {
    url: Url,
    heartbeat: Duration,
    reconnect_delay: Duration,
    access_token: watch::Receiver<Option<String>>,
    channels: ChannelTable,
    next_ref: u64,
}

impl Connection {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            // Stay offline until someone subscribes.
            if self.channels.is_empty() {
                match commands.recv().await {
                    Some(cmd) => self.apply_offline(cmd),
                    None => return,
                }
                continue;
            }

            match self.connected(&mut commands).await {
                ConnectionEnd::Shutdown => {
                    tracing::debug!("realtime connection shut down");
                    return;
                }
                ConnectionEnd::Disconnected(reason) => {
                    tracing::warn!(reason = %reason, retry_in = ?self.reconnect_delay, "realtime disconnected");
                    tokio::time::sleep(self.reconnect_delay).await;
                }
            }
        }
    }

    fn apply_offline(&mut self, cmd: Command) {
        match cmd {
            Command::Join { id, channel, tx } => {
                self.channels.insert(id, channel, tx);
            }
            Command::Leave { id } => {
                self.channels.remove(id);
            }
        }
    }

    fn message(&mut self, topic: &str, event: &str, payload: Value) -> PhoenixMessage {
        self.next_ref += 1;
        PhoenixMessage {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
            msg_ref: Some(self.next_ref.to_string()),
        }
    }

    fn join_message(&mut self, id: u64) -> Option<PhoenixMessage> {
        let token = self.access_token.borrow().clone();
        let (topic, payload) = {
            let channel = self.channels.get(id)?;
            (channel.topic.clone(), channel.config.join_payload(token.as_deref()))
        };
        Some(self.message(&topic, "phx_join", payload))
    }

    async fn connected(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) -> ConnectionEnd {
        let stream = match tokio_tungstenite::connect_async(self.url.as_str()).await {
            Ok((stream, _)) => stream,
            Err(e) => return ConnectionEnd::Disconnected(format!("connect failed: {}", e)),
        };
        tracing::info!(channels = self.channels.entries.len(), "realtime connected");
        let (mut sink, mut source) = stream.split();

        let ids: Vec<u64> = self.channels.entries.keys().copied().collect();
        for id in ids {
            if let Some(join) = self.join_message(id)
                && let Err(e) = push(&mut sink, &join).await
            {
                return ConnectionEnd::Disconnected(e.to_string());
            }
        }

        let mut heartbeat = tokio::time::interval(self.heartbeat);
        // The first tick completes immediately.
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let beat = self.message("phoenix", "heartbeat", json!({}));
                    if let Err(e) = push(&mut sink, &beat).await {
                        return ConnectionEnd::Disconnected(e.to_string());
                    }
                }
                cmd = commands.recv() => {
                    let outgoing = match cmd {
                        None => {
                            let _ = sink.close().await;
                            return ConnectionEnd::Shutdown;
                        }
                        Some(Command::Join { id, channel, tx }) => {
                            self.channels.insert(id, channel, tx);
                            self.join_message(id)
                        }
                        Some(Command::Leave { id }) => self
                            .channels
                            .remove(id)
                            .map(|topic| self.message(&topic, "phx_leave", json!({}))),
                    };
                    if let Some(msg) = outgoing
                        && let Err(e) = push(&mut sink, &msg).await
                    {
                        return ConnectionEnd::Disconnected(e.to_string());
                    }
                }
                changed = self.access_token.changed() => {
                    if changed.is_err() {
                        let _ = sink.close().await;
                        return ConnectionEnd::Shutdown;
                    }
                    let token = self.access_token.borrow_and_update().clone();
                    let Some(token) = token else { continue };
                    let topics: Vec<String> = self.channels.entries.values().map(|c| c.topic.clone()).collect();
                    for topic in topics {
                        let msg = self.message(&topic, "access_token", json!({ "access_token": token }));
                        if let Err(e) = push(&mut sink, &msg).await {
                            return ConnectionEnd::Disconnected(e.to_string());
                        }
                    }
                }
                incoming = source.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            let msg = match serde_json::from_str::<PhoenixMessage>(&text) {
                                Ok(msg) => msg,
                                Err(e) => {
                                    tracing::warn!(error = %e, "unparseable realtime frame");
                                    continue;
                                }
                            };
                            let (_, closed) = self.channels.route(&msg);
                            for id in closed {
                                if let Some(topic) = self.channels.remove(id) {
                                    let leave = self.message(&topic, "phx_leave", json!({}));
                                    if let Err(e) = push(&mut sink, &leave).await {
                                        return ConnectionEnd::Disconnected(e.to_string());
                                    }
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = sink.send(Message::Pong(data)).await {
                                return ConnectionEnd::Disconnected(e.to_string());
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            return ConnectionEnd::Disconnected(format!("closed by server: {:?}", frame));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return ConnectionEnd::Disconnected(e.to_string()),
                        None => return ConnectionEnd::Disconnected("stream ended".into()),
                    }
                }
            }
        }
    }
}

async fn push<S>(sink: &mut S, msg: &PhoenixMessage) -> Result<(), BackendError>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let text = serde_json::to_string(msg).map_err(|e| BackendError::decode("realtime frame", e))?;
    sink.send(Message::Text(text))
        .await
        .map_err(|e| BackendError::Realtime(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeKind;
    use crate::filter::RowFilter;
    use crate::table::Table;

    fn change_frame(topic: &str, kind: &str, record: Value) -> PhoenixMessage {
        PhoenixMessage {
            topic: topic.to_string(),
            event: "postgres_changes".to_string(),
            payload: json!({
                "ids": [1],
                "data": {
                    "schema": "public",
                    "table": "upload",
                    "type": kind,
                    "record": record,
                    "old_record": {},
                    "commit_timestamp": "2024-05-01T10:00:00Z"
                }
            }),
            msg_ref: None,
        }
    }

    fn upload_channel() -> ChannelConfig {
        ChannelConfig::new("upload")
            .on(Binding::on(ChangeKind::Insert, Table::Upload).with_filter(RowFilter::eq("active", true)))
            .on(Binding::on(ChangeKind::Update, Table::Upload).with_filter(RowFilter::eq("active", false)))
    }

    #[test]
    fn join_payload_lists_every_binding() {
        let payload = upload_channel().join_payload(Some("jwt"));
        let bindings = payload["config"]["postgres_changes"].as_array().unwrap();
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0]["event"], "INSERT");
        assert_eq!(bindings[1]["filter"], "active=eq.false");
        assert_eq!(payload["access_token"], "jwt");

        let anonymous = upload_channel().join_payload(None);
        assert!(anonymous.get("access_token").is_none());
    }

    #[test]
    fn configured_schema_reaches_every_binding() {
        let channel = upload_channel().with_schema("plant");
        assert!(channel.bindings.iter().all(|b| b.schema == "plant"));
        let payload = channel.join_payload(None);
        assert_eq!(payload["config"]["postgres_changes"][1]["schema"], "plant");
    }

    #[test]
    fn duplicate_channel_names_get_unique_topics() {
        let mut table = ChannelTable::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let first = table.insert(1, ChannelConfig::new("steps"), tx.clone());
        let second = table.insert(2, ChannelConfig::new("steps"), tx);
        assert_eq!(first, "realtime:steps");
        assert_eq!(second, "realtime:steps:2");
        assert_eq!(table.remove(1).as_deref(), Some("realtime:steps"));
        assert!(table.remove(1).is_none());
    }

    #[test]
    fn route_delivers_only_matching_changes() {
        let mut table = ChannelTable::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let topic = table.insert(1, upload_channel(), tx);

        let (delivered, closed) = table.route(&change_frame(&topic, "INSERT", json!({"id": 1, "active": true})));
        assert_eq!(delivered, 1);
        assert!(closed.is_empty());
        assert_eq!(rx.try_recv().unwrap().record["id"], 1);

        // Insert of an inactive row does not match the filtered binding.
        let (delivered, _) = table.route(&change_frame(&topic, "INSERT", json!({"id": 2, "active": false})));
        assert_eq!(delivered, 0);

        // Wrong topic.
        let (delivered, _) = table.route(&change_frame("realtime:other", "UPDATE", json!({"active": false})));
        assert_eq!(delivered, 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn route_reports_dropped_receivers() {
        let mut table = ChannelTable::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let topic = table.insert(7, upload_channel(), tx);
        drop(rx);
        let (delivered, closed) = table.route(&change_frame(&topic, "INSERT", json!({"active": true})));
        assert_eq!(delivered, 0);
        assert_eq!(closed, vec![7]);
    }

    #[test]
    fn phoenix_message_uses_ref_field_name() {
        let msg = PhoenixMessage {
            topic: "phoenix".into(),
            event: "heartbeat".into(),
            payload: json!({}),
            msg_ref: Some("3".into()),
        };
        let text = serde_json::to_value(&msg).unwrap();
        assert_eq!(text["ref"], "3");
        assert_eq!(text["event"], "heartbeat");
    }

    #[tokio::test]
    async fn detached_subscription_forwards_changes() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sub = Subscription::detached("realtime:test", rx);
        tx.send(PostgresChange::new(ChangeKind::Insert, Table::Steps, json!({"id": 1}), Value::Null))
            .unwrap();
        drop(tx);
        assert_eq!(sub.topic(), "realtime:test");
        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
    }
}
