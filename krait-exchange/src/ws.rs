//! Private WebSocket stream: order / execution / position / wallet topics.
//!
//! The connection task authenticates, subscribes, heartbeats, and forwards
//! typed events over an mpsc channel. Disconnects reconnect with backoff and
//! are surfaced as events so the ingest side can publish `WS_RECONNECT`.
//! Unknown message types are logged and dropped, never fatal.

use std::time::Duration;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::{BybitCredentials, ExchangeError, VenueResult};

type HmacSha256 = Hmac<Sha256>;
type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const HEARTBEAT_SECS: u64 = 20;
const RECONNECT_BASE_SECS: u64 = 1;
const RECONNECT_MAX_SECS: u64 = 30;

/// Typed event delivered to the ingest loop.
#[derive(Clone, Debug)]
pub enum PrivateEvent {
    Connected { connect_count: u32 },
    Disconnected { reason: String },
    Order(WsOrderUpdate),
    Execution(WsExecutionUpdate),
    Position(WsPositionUpdate),
    Wallet(Value),
}

#[derive(Clone, Debug, Deserialize)]
pub struct WsOrderUpdate {
    #[serde(rename = "orderId")]
    pub order_id: String,
    #[serde(rename = "orderLinkId", default)]
    pub order_link_id: String,
    pub symbol: String,
    #[serde(default)]
    pub side: String,
    #[serde(rename = "orderStatus")]
    pub order_status: String,
    #[serde(rename = "cumExecQty", default)]
    pub cum_exec_qty: String,
    #[serde(rename = "avgPrice", default)]
    pub avg_price: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct WsExecutionUpdate {
    #[serde(rename = "execId")]
    pub exec_id: String,
    #[serde(rename = "orderId")]
    pub order_id: String,
    #[serde(rename = "orderLinkId", default)]
    pub order_link_id: String,
    pub symbol: String,
    #[serde(default)]
    pub side: String,
    #[serde(rename = "execQty")]
    pub exec_qty: String,
    #[serde(rename = "execPrice")]
    pub exec_price: String,
    #[serde(rename = "execFee", default)]
    pub exec_fee: String,
    #[serde(rename = "execTime", default)]
    pub exec_time: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct WsPositionUpdate {
    pub symbol: String,
    #[serde(default)]
    pub side: String,
    pub size: String,
    #[serde(rename = "entryPrice", default)]
    pub entry_price: String,
    #[serde(rename = "unrealisedPnl", default)]
    pub unrealised_pnl: String,
}

impl WsPositionUpdate {
    #[must_use]
    pub fn size_abs(&self) -> f64 {
        self.size.parse::<f64>().unwrap_or(0.0).abs()
    }
}

/// Private stream configuration.
#[derive(Clone)]
pub struct PrivateStreamConfig {
    pub ws_url: String,
    pub credentials: BybitCredentials,
    pub subscriptions: Vec<String>,
}

/// Spawn the connection task; events arrive on the returned receiver. The
/// task exits when the receiver is dropped.
pub fn spawn_private_stream(
    config: PrivateStreamConfig,
) -> (mpsc::Receiver<PrivateEvent>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(1024);
    let handle = tokio::spawn(async move {
        run_private_stream(config, tx).await;
    });
    (rx, handle)
}

async fn run_private_stream(config: PrivateStreamConfig, tx: mpsc::Sender<PrivateEvent>) {
    let mut connect_count = 0u32;
    let mut backoff_secs = RECONNECT_BASE_SECS;
    loop {
        match connect_and_auth(&config).await {
            Ok(socket) => {
                connect_count += 1;
                backoff_secs = RECONNECT_BASE_SECS;
                if tx
                    .send(PrivateEvent::Connected { connect_count })
                    .await
                    .is_err()
                {
                    return;
                }
                let reason = pump_messages(socket, &tx).await;
                if tx
                    .send(PrivateEvent::Disconnected { reason })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(err) => {
                error!(error = %err, "private ws connect failed");
                if tx
                    .send(PrivateEvent::Disconnected {
                        reason: err.to_string(),
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
        tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
        backoff_secs = (backoff_secs * 2).min(RECONNECT_MAX_SECS);
    }
}

async fn connect_and_auth(config: &PrivateStreamConfig) -> VenueResult<WsStream> {
    let endpoint = format!("{}/v5/private", config.ws_url.trim_end_matches('/'));
    let (mut socket, _) = connect_async(&endpoint)
        .await
        .map_err(|err| ExchangeError::Transport(err.to_string()))?;

    let expires = (Utc::now() + chrono::Duration::seconds(10)).timestamp_millis();
    let payload = format!("GET/realtime{expires}");
    let mut mac = HmacSha256::new_from_slice(config.credentials.api_secret.as_bytes())
        .map_err(|err| ExchangeError::Authentication(err.to_string()))?;
    mac.update(payload.as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());

    let auth_payload = json!({
        "op": "auth",
        "args": [config.credentials.api_key.clone(), expires, signature],
    });
    socket
        .send(Message::Text(auth_payload.to_string()))
        .await
        .map_err(|err| ExchangeError::Transport(err.to_string()))?;

    if let Some(Ok(Message::Text(text))) = socket.next().await {
        let ok = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| v.get("success").and_then(Value::as_bool))
            .unwrap_or(false);
        if !ok {
            warn!(payload = %text, "private ws auth failed");
            return Err(ExchangeError::Authentication(
                "private websocket auth failed".into(),
            ));
        }
        info!("private websocket authenticated");
    }

    let sub_payload = json!({
        "op": "subscribe",
        "args": config.subscriptions,
    });
    socket
        .send(Message::Text(sub_payload.to_string()))
        .await
        .map_err(|err| ExchangeError::Transport(err.to_string()))?;
    info!(topics = ?config.subscriptions, "subscribed to private topics");

    Ok(socket)
}

/// Read messages until the socket drops; returns the disconnect reason.
async fn pump_messages(mut socket: WsStream, tx: &mpsc::Sender<PrivateEvent>) -> String {
    let mut heartbeat = interval(Duration::from_secs(HEARTBEAT_SECS));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = socket.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if forward_text(&text, tx).await.is_err() {
                            return "receiver closed".into();
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            return "pong send failed".into();
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return format!("closed by venue: {frame:?}");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return format!("stream error: {err}"),
                    None => return "stream ended".into(),
                }
            }
            _ = heartbeat.tick() => {
                let ping = json!({"op": "ping"});
                if socket.send(Message::Text(ping.to_string())).await.is_err() {
                    return "ping send failed".into();
                }
            }
        }
    }
}

async fn forward_text(text: &str, tx: &mpsc::Sender<PrivateEvent>) -> Result<(), ()> {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        warn!(payload = text, "unparseable private ws payload");
        return Ok(());
    };

    if let Some(op) = value.get("op").and_then(Value::as_str) {
        debug!(op, "private ws command ack");
        return Ok(());
    }

    let Some(topic) = value.get("topic").and_then(Value::as_str) else {
        debug!("private ws message without topic; ignoring");
        return Ok(());
    };
    let data = value.get("data").cloned().unwrap_or(Value::Null);

    match topic {
        "order" => {
            for item in as_array(data) {
                match serde_json::from_value::<WsOrderUpdate>(item) {
                    Ok(update) => tx.send(PrivateEvent::Order(update)).await.map_err(|_| ())?,
                    Err(err) => warn!(error = %err, "malformed ws order item"),
                }
            }
        }
        "execution" => {
            for item in as_array(data) {
                match serde_json::from_value::<WsExecutionUpdate>(item) {
                    Ok(update) => tx
                        .send(PrivateEvent::Execution(update))
                        .await
                        .map_err(|_| ())?,
                    Err(err) => warn!(error = %err, "malformed ws execution item"),
                }
            }
        }
        "position" => {
            for item in as_array(data) {
                match serde_json::from_value::<WsPositionUpdate>(item) {
                    Ok(update) => tx
                        .send(PrivateEvent::Position(update))
                        .await
                        .map_err(|_| ())?,
                    Err(err) => warn!(error = %err, "malformed ws position item"),
                }
            }
        }
        "wallet" => {
            tx.send(PrivateEvent::Wallet(data)).await.map_err(|_| ())?;
        }
        other => {
            debug!(topic = other, "ignoring unsupported private topic");
        }
    }
    Ok(())
}

fn as_array(data: Value) -> Vec<Value> {
    match data {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn order_topic_is_forwarded_typed() {
        let (tx, mut rx) = mpsc::channel(8);
        let text = json!({
            "topic": "order",
            "data": [{
                "orderId": "o1",
                "orderLinkId": "k:ENTRY:0",
                "symbol": "BTCUSDT",
                "side": "Buy",
                "orderStatus": "Filled",
                "cumExecQty": "0.05",
                "avgPrice": "30010"
            }]
        })
        .to_string();
        forward_text(&text, &tx).await.unwrap();
        match rx.recv().await.unwrap() {
            PrivateEvent::Order(update) => {
                assert_eq!(update.order_id, "o1");
                assert_eq!(update.order_status, "Filled");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_topics_and_acks_are_dropped() {
        let (tx, mut rx) = mpsc::channel(8);
        forward_text(&json!({"op": "subscribe", "success": true}).to_string(), &tx)
            .await
            .unwrap();
        forward_text(
            &json!({"topic": "greeks", "data": [{"x": 1}]}).to_string(),
            &tx,
        )
        .await
        .unwrap();
        forward_text("not json at all", &tx).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn position_update_parses_size() {
        let (tx, mut rx) = mpsc::channel(8);
        let text = json!({
            "topic": "position",
            "data": [{"symbol": "BTCUSDT", "side": "Buy", "size": "0.11"}]
        })
        .to_string();
        forward_text(&text, &tx).await.unwrap();
        match rx.recv().await.unwrap() {
            PrivateEvent::Position(update) => {
                assert!((update.size_abs() - 0.11).abs() < 1e-12);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
