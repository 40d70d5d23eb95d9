//! WebSocket Routes
//!
//! 토픽 구독 기반 잔액/환율 스트림
//!
//! # Endpoints
//! - `GET /ws` - WebSocket 연결
//!
//! # Protocol
//! ```text
//! → {"action":"Subscribe","topic":"account/<uuid>/balance"}
//! ← {"type":"Subscribed","data":{"topic":"...","subscribed":true}}
//! ← {"type":"Balance","data":{"topic":"...","balance":"70000000000000000000"}}
//! → {"action":"Ping"}
//! ← {"type":"Pong"}
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::services::events::{
    is_known_topic, parse_client_message, serialize_message, ClientMessage, EventHub,
    EventMessage, SubscriptionConfirm, WsError,
};
use crate::AppState;

/// 연결당 송신 버퍼
const OUTBOUND_CAPACITY: usize = 64;

/// WebSocket 업그레이드 핸들러
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let hub = state.events.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

/// WebSocket 연결 처리
async fn handle_socket(socket: WebSocket, hub: Arc<EventHub>) {
    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<EventMessage>(OUTBOUND_CAPACITY);
    let conn_id = uuid::Uuid::new_v4();
    debug!(%conn_id, "WebSocket connected");

    // 송신 태스크
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let json = match serialize_message(&msg) {
                Ok(json) => json,
                Err(e) => {
                    warn!(error = %e, "Failed to serialize outbound message");
                    continue;
                }
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    // 수신 태스크
    let mut subscriptions = Subscriptions::new(hub, out_tx.clone());
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    let reply = subscriptions.handle_text(&text);
                    if out_tx.send(reply).await.is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // 한쪽이 끝나면 다른 쪽도 정리
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    debug!(%conn_id, "WebSocket disconnected");
}

/// 연결 하나의 토픽 구독 목록
///
/// 토픽마다 broadcast 수신 → 연결 송신 큐로 넘기는 태스크를 하나씩 둔다.
struct Subscriptions {
    hub: Arc<EventHub>,
    out: mpsc::Sender<EventMessage>,
    forwarders: HashMap<String, JoinHandle<()>>,
}

impl Subscriptions {
    fn new(hub: Arc<EventHub>, out: mpsc::Sender<EventMessage>) -> Self {
        Self {
            hub,
            out,
            forwarders: HashMap::new(),
        }
    }

    /// 클라이언트 메시지 하나를 처리하고 응답을 돌려준다
    fn handle_text(&mut self, text: &str) -> EventMessage {
        match parse_client_message(text) {
            Ok(ClientMessage::Subscribe { topic }) => self.subscribe(topic),
            Ok(ClientMessage::Unsubscribe { topic }) => self.unsubscribe(topic),
            Ok(ClientMessage::Ping) => EventMessage::Pong,
            Err(e) => EventMessage::Error(WsError {
                code: 400,
                message: format!("Invalid message: {e}"),
            }),
        }
    }

    fn subscribe(&mut self, topic: String) -> EventMessage {
        if !is_known_topic(&topic) {
            return EventMessage::Error(WsError {
                code: 404,
                message: format!("Unknown topic {topic}"),
            });
        }

        if !self.forwarders.contains_key(&topic) {
            let rx = self.hub.subscribe(&topic);
            let task = tokio::spawn(forward(rx, self.out.clone()));
            self.forwarders.insert(topic.clone(), task);
        }

        EventMessage::Subscribed(SubscriptionConfirm {
            topic,
            subscribed: true,
        })
    }

    fn unsubscribe(&mut self, topic: String) -> EventMessage {
        if let Some(task) = self.forwarders.remove(&topic) {
            task.abort();
            self.hub.prune(&topic);
        }
        EventMessage::Subscribed(SubscriptionConfirm {
            topic,
            subscribed: false,
        })
    }

    fn clear(&mut self) {
        for (topic, task) in self.forwarders.drain() {
            task.abort();
            self.hub.prune(&topic);
        }
    }
}

impl Drop for Subscriptions {
    fn drop(&mut self) {
        self.clear();
    }
}

async fn forward(mut rx: broadcast::Receiver<EventMessage>, out: mpsc::Sender<EventMessage>) {
    loop {
        match rx.recv().await {
            Ok(msg) => {
                if out.send(msg).await.is_err() {
                    break;
                }
            }
            // 느린 클라이언트는 최신 잔액만 받으면 된다
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "Subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
