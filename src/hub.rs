// synckairos: WebSocket Hub (WH) — §4.4.
//
// Per-instance registry of active client sockets keyed by session id;
// consumes `ws:*` broadcasts and forwards to local subscribers; handles
// heartbeats and reconnection sync. Holds no session data — registries
// are non-authoritative caches of socket handles only (§3 Ownership).

use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::engine::SessionEngine;
use crate::store::WsMessage;

const BROWSER_PING_INTERVAL_MS: u64 = 15_000;
const MOBILE_PING_INTERVAL_MS: u64 = 30_000;
const MAX_MESSAGES_PER_MIN: u32 = 100;
const MAX_PAYLOAD_BYTES: usize = 10 * 1024;
const MISSED_PONG_LIMIT: u32 = 2;
const CONNECT_QUOTA_WINDOW: Duration = Duration::from_secs(60);

/// Per-IP connect counter for the §4.4 connection quota (`<=N`/IP/min).
struct ConnectWindow {
    window_start: Instant,
    count: u32,
}

/// Outbound message types delivered to clients (§4.4).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum OutboundMessage<'a> {
    StateUpdate {
        state: &'a crate::model::Session,
    },
    TimeExpired {
        participant_id: Uuid,
        action: Option<String>,
    },
    StateSync {
        state: &'a crate::model::Session,
    },
    ReconnectAck,
    Pong {
        client_timestamp_ms: i64,
        server_timestamp_ms: i64,
    },
}

/// Client-initiated messages (§4.4).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum InboundMessage {
    Ping { timestamp: i64 },
    Reconnect {
        #[serde(rename = "sessionId")]
        session_id: Uuid,
        last_known_version: u64,
        #[serde(default)]
        reconnect_attempt: u32,
    },
    SubscribeParticipant { participant_id: Uuid },
}

struct Socket {
    tx: mpsc::Sender<Message>,
}

/// Registry of local sockets, keyed by session id. Non-authoritative:
/// rebuilt on reconnect, consulted only for local fan-out.
#[derive(Clone)]
pub struct Hub {
    sockets: Arc<DashMap<Uuid, Vec<Socket>>>,
    engine: Arc<SessionEngine>,
    connect_counts: Arc<DashMap<IpAddr, ConnectWindow>>,
    max_connects_per_ip_per_min: u32,
}

impl Hub {
    pub fn new(engine: Arc<SessionEngine>, max_connects_per_ip_per_min: u32) -> Self {
        Self {
            sockets: Arc::new(DashMap::new()),
            engine,
            connect_counts: Arc::new(DashMap::new()),
            max_connects_per_ip_per_min,
        }
    }

    /// Checks and consumes one slot of the per-IP connect quota (§4.4:
    /// `<=5/IP/min` by default). Returns `false` when the caller should
    /// be refused the upgrade.
    pub fn check_connect_quota(&self, ip: IpAddr) -> bool {
        let mut entry = self.connect_counts.entry(ip).or_insert_with(|| ConnectWindow {
            window_start: Instant::now(),
            count: 0,
        });
        if entry.window_start.elapsed() > CONNECT_QUOTA_WINDOW {
            entry.window_start = Instant::now();
            entry.count = 0;
        }
        entry.count += 1;
        entry.count <= self.max_connects_per_ip_per_min
    }

    fn register(&self, session_id: Uuid, tx: mpsc::Sender<Message>) {
        self.sockets.entry(session_id).or_default().push(Socket { tx });
    }

    fn unregister(&self, session_id: Uuid, tx: &mpsc::Sender<Message>) {
        if let Some(mut entry) = self.sockets.get_mut(&session_id) {
            entry.retain(|s| !s.tx.same_channel(tx));
            if entry.is_empty() {
                drop(entry);
                self.sockets.remove(&session_id);
            }
        }
    }

    pub fn socket_count(&self, session_id: Uuid) -> usize {
        self.sockets.get(&session_id).map(|e| e.len()).unwrap_or(0)
    }

    pub fn total_instance_sockets(&self) -> usize {
        self.sockets.iter().map(|e| e.value().len()).sum()
    }

    /// Dispatches a message received from the `ws:*` pattern subscription
    /// to every local socket subscribed to `session_id`. Called from the
    /// cross-instance fan-out listener task spawned in `main`.
    pub async fn dispatch(&self, session_id: Uuid, msg: WsMessage) {
        let Some(entry) = self.sockets.get(&session_id) else { return };
        let outbound = match &msg {
            WsMessage::StateUpdate { state } => OutboundMessage::StateUpdate { state },
            WsMessage::TimeExpired { participant_id, action } => OutboundMessage::TimeExpired {
                participant_id: *participant_id,
                action: action.clone(),
            },
        };
        let Ok(text) = serde_json::to_string(&outbound) else { return };
        for socket in entry.value() {
            let _ = socket.tx.try_send(Message::Text(text.clone()));
        }
    }

    pub async fn handle_socket(&self, session_id: Uuid, socket: WebSocket, is_mobile: bool) {
        let span = info_span!("ws_session", session_id = %session_id);
        self.run_session(session_id, socket, is_mobile).instrument(span).await;
    }

    async fn run_session(&self, session_id: Uuid, socket: WebSocket, is_mobile: bool) {
        if self.total_instance_sockets() >= 10_000 {
            warn!("instance socket quota exceeded, refusing connection");
            return;
        }

        let (mut ws_tx, mut ws_rx) = socket.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(1024);

        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if ws_tx.send(msg).await.is_err() {
                    break;
                }
            }
        });

        self.register(session_id, out_tx.clone());

        let ping_interval_ms = if is_mobile { MOBILE_PING_INTERVAL_MS } else { BROWSER_PING_INTERVAL_MS };
        let mut ping_tick = tokio::time::interval(Duration::from_millis(ping_interval_ms));
        let missed_pongs = AtomicU32::new(0);
        let message_count = AtomicU32::new(0);
        let mut window_start = Instant::now();

        loop {
            tokio::select! {
                _ = ping_tick.tick() => {
                    if missed_pongs.fetch_add(1, Ordering::SeqCst) + 1 > MISSED_PONG_LIMIT {
                        warn!("missed {} consecutive pongs, closing with 1011", MISSED_PONG_LIMIT);
                        let _ = out_tx.send(Message::Close(Some(axum::extract::ws::CloseFrame {
                            code: 1011,
                            reason: "heartbeat timeout".into(),
                        }))).await;
                        break;
                    }
                    let _ = out_tx.try_send(Message::Ping(Vec::new()));
                }

                incoming = ws_rx.next() => {
                    match incoming {
                        Some(Ok(Message::Pong(_))) => {
                            missed_pongs.store(0, Ordering::SeqCst);
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(Message::Text(text))) => {
                            if text.len() > MAX_PAYLOAD_BYTES {
                                let _ = out_tx.send(Message::Close(Some(axum::extract::ws::CloseFrame {
                                    code: 1009,
                                    reason: "payload too large".into(),
                                }))).await;
                                break;
                            }
                            if window_start.elapsed() > Duration::from_secs(60) {
                                window_start = Instant::now();
                                message_count.store(0, Ordering::SeqCst);
                            }
                            if message_count.fetch_add(1, Ordering::SeqCst) + 1 > MAX_MESSAGES_PER_MIN {
                                let _ = out_tx.send(Message::Close(Some(axum::extract::ws::CloseFrame {
                                    code: 1008,
                                    reason: "rate limit exceeded".into(),
                                }))).await;
                                break;
                            }
                            self.handle_inbound(session_id, &text, &out_tx).await;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(_)) => break,
                    }
                }
            }
        }

        self.unregister(session_id, &out_tx);
        writer.abort();
        info!("ws session closed");
    }

    async fn handle_inbound(&self, session_id: Uuid, text: &str, out_tx: &mpsc::Sender<Message>) {
        let Ok(inbound) = serde_json::from_str::<InboundMessage>(text) else {
            return;
        };
        match inbound {
            InboundMessage::Ping { timestamp } => {
                let pong = OutboundMessage::Pong {
                    client_timestamp_ms: timestamp,
                    server_timestamp_ms: Utc::now().timestamp_millis(),
                };
                if let Ok(body) = serde_json::to_string(&pong) {
                    let _ = out_tx.try_send(Message::Text(body));
                }
            }
            InboundMessage::Reconnect { session_id: req_id, last_known_version, .. } => {
                let target = if req_id == Uuid::nil() { session_id } else { req_id };
                match self.engine.get_current_state(target).await {
                    Ok(state) if state.version > last_known_version => {
                        let body = serde_json::to_string(&OutboundMessage::StateSync { state: &state }).unwrap();
                        let _ = out_tx.try_send(Message::Text(body));
                    }
                    Ok(_) => {
                        let body = serde_json::to_string(&OutboundMessage::ReconnectAck).unwrap();
                        let _ = out_tx.try_send(Message::Text(body));
                    }
                    Err(e) => {
                        warn!(error = %e, "reconnect state lookup failed");
                    }
                }
            }
            InboundMessage::SubscribeParticipant { .. } => {
                // Narrowing future deliveries is optional (§4.4); the hub
                // currently fans every STATE_UPDATE out to all session
                // subscribers regardless of participant filter.
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_count_reflects_registrations() {
        let sockets: DashMap<Uuid, Vec<Socket>> = DashMap::new();
        let id = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(8);
        sockets.entry(id).or_default().push(Socket { tx });
        assert_eq!(sockets.get(&id).map(|e| e.len()).unwrap_or(0), 1);
    }

    #[test]
    fn inbound_ping_deserializes() {
        let json = r#"{"type":"Ping","timestamp":123}"#;
        let msg: InboundMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(msg, InboundMessage::Ping { timestamp: 123 }));
    }
}
