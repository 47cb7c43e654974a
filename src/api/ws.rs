//! Websocket transport adapter for the realtime push path.
//!
//! This layer only frames messages. Subscription ownership, ordering,
//! backpressure, and resync all live in the fanout hub; a disconnecting
//! client simply unsubscribes, which cancels anything still queued for it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::classify::{EntityDelta, SubscriptionFilter};
use crate::config::ScreenConfig;
use crate::fanout::{FanoutHub, OutboundMessage, SubscriberReceiver};
use crate::feed::types::FeedEntity;

#[derive(Clone)]
pub struct WsState {
    pub hub: Arc<FanoutHub>,
    pub screens: Arc<HashMap<String, ScreenConfig>>,
}

/// Client subscription message
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
enum ClientMessage {
    /// Subscribe to stops, routes, and/or a configured screen. Replaces any
    /// previous subscription on this connection.
    Subscribe {
        #[serde(default)]
        stop_ids: Vec<String>,
        #[serde(default)]
        route_ids: Vec<String>,
        #[serde(default)]
        screen_id: Option<String>,
    },
}

/// Server message sent to clients
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
enum ServerMessage {
    /// Initial connection acknowledgment
    Connected { message: String },
    /// Full current state for the subscription (sent on subscribe and on
    /// forced resync)
    Snapshot {
        resync: bool,
        entities: Vec<FeedEntity>,
    },
    /// Incremental update
    Update(EntityDelta),
    /// Error message
    Error { message: String },
}

impl From<OutboundMessage> for ServerMessage {
    fn from(message: OutboundMessage) -> Self {
        match message {
            OutboundMessage::Snapshot { entities, resync } => {
                ServerMessage::Snapshot { resync, entities }
            }
            OutboundMessage::Delta(delta) => ServerMessage::Update(delta),
        }
    }
}

/// Merge the explicit stop/route sets with a configured screen's sets.
fn resolve_filter(
    stop_ids: Vec<String>,
    route_ids: Vec<String>,
    screen_id: Option<String>,
    screens: &HashMap<String, ScreenConfig>,
) -> Result<SubscriptionFilter, String> {
    let mut stop_ids: HashSet<String> = stop_ids.into_iter().collect();
    let mut route_ids: HashSet<String> = route_ids.into_iter().collect();

    if let Some(screen_id) = &screen_id {
        let Some(screen) = screens.get(screen_id) else {
            return Err(format!("unknown screen_id '{screen_id}'"));
        };
        stop_ids.extend(screen.stop_ids.iter().cloned());
        route_ids.extend(screen.route_ids.iter().cloned());
    }

    if stop_ids.is_empty() && route_ids.is_empty() {
        return Err("subscription must name at least one stop, route, or screen".to_string());
    }

    Ok(SubscriptionFilter {
        stop_ids,
        route_ids,
        screen_id,
    })
}

/// WebSocket endpoint for realtime updates
pub async fn ws_updates(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: WsState) {
    let (mut sender, mut receiver) = socket.split();

    let connected = ServerMessage::Connected {
        message: "Connected. Send a subscribe message with stop_ids, route_ids, or screen_id."
            .to_string(),
    };
    if let Ok(json) = serde_json::to_string(&connected) {
        let _ = sender.send(Message::Text(json.into())).await;
    }

    // Subscription changes flow from the read loop to the forward task
    let (sub_tx, mut sub_rx) =
        tokio::sync::mpsc::channel::<Result<SubscriptionFilter, String>>(16);

    let hub = state.hub.clone();
    let forward_task = tokio::spawn(async move {
        // No hub subscription until the client says what it wants
        let mut current: Option<(Uuid, SubscriberReceiver)> = None;

        loop {
            let Some((subscriber_id, rx)) = &current else {
                match sub_rx.recv().await {
                    Some(Ok(filter)) => current = Some(hub.subscribe(filter).await),
                    Some(Err(message)) => {
                        if !send_message(&mut sender, ServerMessage::Error { message }).await {
                            break;
                        }
                    }
                    None => break,
                }
                continue;
            };

            tokio::select! {
                maybe_sub = sub_rx.recv() => {
                    match maybe_sub {
                        // A repeated subscribe swaps the filter on the
                        // existing subscription; the hub answers with a
                        // fresh snapshot for the new scope.
                        Some(Ok(filter)) => hub.update_filter(*subscriber_id, filter).await,
                        Some(Err(message)) => {
                            if !send_message(&mut sender, ServerMessage::Error { message }).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                outbound = rx.recv() => {
                    match outbound {
                        Some(message) => {
                            if !send_message(&mut sender, ServerMessage::from(message)).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        if let Some((subscriber_id, _)) = current {
            hub.unsubscribe(subscriber_id).await;
        }
    });

    // Read loop: parse client frames until the connection goes away
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Subscribe {
                    stop_ids,
                    route_ids,
                    screen_id,
                }) => {
                    let resolved = resolve_filter(stop_ids, route_ids, screen_id, &state.screens);
                    if sub_tx.send(resolved).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "Ignoring unparseable client message");
                }
            },
            Ok(Message::Ping(_)) => {
                // Axum handles pong automatically
            }
            Ok(Message::Close(_)) => break,
            Err(_) => break,
            _ => {}
        }
    }

    // Closing the channel lets the forward task unsubscribe and finish
    drop(sub_tx);
    let _ = forward_task.await;
}

async fn send_message(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    message: ServerMessage,
) -> bool {
    let Ok(json) = serde_json::to_string(&message) else {
        return true;
    };
    sender.send(Message::Text(json.into())).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn screens() -> HashMap<String, ScreenConfig> {
        [(
            "platform_1".to_string(),
            ScreenConfig {
                screen_id: "platform_1".to_string(),
                stop_ids: vec!["STOP_1".to_string(), "STOP_2".to_string()],
                route_ids: vec!["R1".to_string()],
            },
        )]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_resolve_filter_merges_screen_sets() {
        let filter = resolve_filter(
            vec!["STOP_9".to_string()],
            vec![],
            Some("platform_1".to_string()),
            &screens(),
        )
        .unwrap();

        assert!(filter.stop_ids.contains("STOP_9"));
        assert!(filter.stop_ids.contains("STOP_1"));
        assert!(filter.stop_ids.contains("STOP_2"));
        assert!(filter.route_ids.contains("R1"));
        assert_eq!(filter.screen_id.as_deref(), Some("platform_1"));
    }

    #[test]
    fn test_resolve_filter_rejects_unknown_screen() {
        let err = resolve_filter(vec![], vec![], Some("nope".to_string()), &screens()).unwrap_err();
        assert!(err.contains("unknown screen_id"));
    }

    #[test]
    fn test_resolve_filter_rejects_empty_subscription() {
        let err = resolve_filter(vec![], vec![], None, &screens()).unwrap_err();
        assert!(err.contains("at least one"));
    }

    #[test]
    fn test_client_message_parsing() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type": "subscribe", "stop_ids": ["STOP_1"], "route_ids": ["R1"]}"#,
        )
        .unwrap();
        let ClientMessage::Subscribe {
            stop_ids,
            route_ids,
            screen_id,
        } = msg;
        assert_eq!(stop_ids, vec!["STOP_1".to_string()]);
        assert_eq!(route_ids, vec!["R1".to_string()]);
        assert!(screen_id.is_none());
    }

    #[test]
    fn test_server_message_tagging() {
        let json = serde_json::to_string(&ServerMessage::Snapshot {
            resync: true,
            entities: vec![],
        })
        .unwrap();
        assert!(json.contains(r#""type":"snapshot"#));
        assert!(json.contains(r#""resync":true"#));
    }
}
