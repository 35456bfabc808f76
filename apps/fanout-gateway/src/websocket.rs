use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use channel_fanout::{ChannelSink, ConnectionRecord};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::metrics;
use crate::state::GatewayState;

/// Frames the gateway writes to a client, besides relayed channel envelopes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    System {
        connection_id: String,
        message: String,
    },
    Pong,
    Error {
        message: String,
    },
}

impl ServerFrame {
    fn encode(&self) -> String {
        // Plain enum of strings; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ClientFrame {
    Control {
        #[serde(rename = "type")]
        kind: String,
    },
    Channel {
        channel: String,
        #[serde(default)]
        intent: Option<String>,
        #[serde(default)]
        payload: Value,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intent {
    Subscribe,
    Unsubscribe,
    Publish,
}

impl Intent {
    // Anything that is not a (un)subscribe publishes; a missing intent does too.
    fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("subscribe") => Intent::Subscribe,
            Some("unsubscribe") => Intent::Unsubscribe,
            _ => Intent::Publish,
        }
    }
}

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<GatewayState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: GatewayState) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let writer_id = connection_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        debug!(connection_id = %writer_id, "websocket writer ended");
    });

    open_connection(&state, &connection_id, tx.clone()).await;

    while let Some(frame) = receiver.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(err) => {
                warn!(%connection_id, error = %err, "websocket read error");
                break;
            }
        };
        match msg {
            Message::Text(text) => handle_text_frame(&state, &connection_id, &text, &tx).await,
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => handle_text_frame(&state, &connection_id, &text, &tx).await,
                Err(_) => debug!(%connection_id, "ignoring non-utf8 binary frame"),
            },
            Message::Close(_) => {
                debug!(%connection_id, "client closed websocket");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    close_connection(&state, &connection_id).await;
    drop(tx);
    let _ = writer.await;
}

/// Make the connection visible locally and platform-wide, then greet it.
pub async fn open_connection(
    state: &GatewayState,
    connection_id: &str,
    tx: mpsc::UnboundedSender<String>,
) {
    state
        .local()
        .insert(connection_id, Arc::new(ChannelSink::new(tx.clone())));
    let record = ConnectionRecord::new(connection_id, state.instance_id());
    if let Err(err) = state.registry().register_connection(record).await {
        error!(%connection_id, error = %err, "failed to register connection");
    }
    metrics::CONNECTIONS_TOTAL.inc();
    metrics::CONNECTIONS_ACTIVE.inc();
    info!(%connection_id, instance_id = state.instance_id(), "websocket connected");

    let welcome = ServerFrame::System {
        connection_id: connection_id.to_string(),
        message: "Connected to WebSocket Gateway".into(),
    };
    let _ = tx.send(welcome.encode());
}

pub async fn close_connection(state: &GatewayState, connection_id: &str) {
    state.forget_connection(connection_id).await;
    metrics::CONNECTIONS_ACTIVE.dec();
    info!(%connection_id, "websocket disconnected");
}

/// Apply one client text frame. Replies go through `reply`.
pub async fn handle_text_frame(
    state: &GatewayState,
    connection_id: &str,
    text: &str,
    reply: &mpsc::UnboundedSender<String>,
) {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(err) => {
            debug!(%connection_id, error = %err, "invalid client frame");
            let _ = reply.send(
                ServerFrame::Error {
                    message: format!("Invalid message format: {err}"),
                }
                .encode(),
            );
            return;
        }
    };

    match frame {
        ClientFrame::Control { kind } if kind == "ping" => {
            match state.registry().touch_connection(connection_id).await {
                Ok(true) => {}
                Ok(false) => debug!(%connection_id, "heartbeat for unknown connection"),
                Err(err) => warn!(%connection_id, error = %err, "heartbeat refresh failed"),
            }
            let _ = reply.send(ServerFrame::Pong.encode());
        }
        ClientFrame::Control { kind } => {
            debug!(%connection_id, %kind, "ignoring control frame");
        }
        ClientFrame::Channel {
            channel,
            intent,
            payload,
        } => {
            if channel.trim().is_empty() {
                let _ = reply.send(
                    ServerFrame::Error {
                        message: "Invalid message format: channel must not be empty".into(),
                    }
                    .encode(),
                );
                return;
            }
            match Intent::parse(intent.as_deref()) {
                Intent::Unsubscribe => {
                    if let Err(err) = state.leave_channel(connection_id, &channel).await {
                        warn!(%connection_id, %channel, error = %err, "failed to leave channel");
                    }
                }
                Intent::Subscribe => join_channel(state, connection_id, &channel).await,
                Intent::Publish => {
                    join_channel(state, connection_id, &channel).await;
                    let outcome = state
                        .manager()
                        .publish_to_channel(&channel, payload, Some(connection_id.to_string()))
                        .await;
                    metrics::record_publish(outcome.is_success());
                    if let channel_fanout::PublishOutcome::Failed { error } = outcome {
                        let _ = reply.send(
                            ServerFrame::Error {
                                message: format!("Publish failed: {error}"),
                            }
                            .encode(),
                        );
                    }
                }
            }
        }
    }
}

async fn join_channel(state: &GatewayState, connection_id: &str, channel: &str) {
    if let Err(err) = state.join_channel(connection_id, channel).await {
        warn!(%connection_id, %channel, error = %err, "failed to join channel");
    }
}
