// synckairos: State Store Client (SSC) — §4.1.
//
// Thin abstraction over a key-value store with TTL, atomic CAS, and
// publish/subscribe. The trait exists so tests (and, per the spec's own
// dependency-injection redesign note in §9, `main`) can swap the Redis
// implementation for an in-memory fake without touching the engine.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::Script;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tokio::time::Duration;
use tracing::warn;

use crate::error::{SyncKairosError, SyncKairosResult};
use crate::model::Session;

const SESSION_TTL_SECS: usize = 3_600;
const IDEMPOTENCY_TTL_SECS: usize = 86_400;
const SESSION_UPDATES_CHANNEL: &str = "session-updates";
const WS_CHANNEL_PATTERN: &str = "ws:*";
const FANOUT_CHANNEL_CAPACITY: usize = 1_024;

/// Atomic CAS per spec §4.1: "a Lua-like atomic script ... is
/// recommended". Reads the stored version and writes the new body in a
/// single `EVAL`, so no other client's write can land between the check
/// and the write the way a plain GET-then-SET would allow.
const CAS_UPDATE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == false then
    return 'MISSING'
end
local ok, decoded = pcall(cjson.decode, current)
if not ok then
    return 'MISSING'
end
if tostring(decoded.version) ~= ARGV[2] then
    return 'CONFLICT:' .. tostring(decoded.version)
end
redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[3])
return 'OK'
"#;

fn cas_script() -> &'static Script {
    static SCRIPT: OnceLock<Script> = OnceLock::new();
    SCRIPT.get_or_init(|| Script::new(CAS_UPDATE_SCRIPT))
}

fn session_key(id: uuid::Uuid) -> String {
    format!("session:{id}")
}

fn ws_channel(id: uuid::Uuid) -> String {
    format!("ws:{id}")
}

fn idempotency_key(key: &str) -> String {
    format!("idempotency:{key}")
}

/// Payload published on `session-updates` (engine-to-engine fan-out).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum SessionUpdateMessage {
    State { session_id: uuid::Uuid, state: Session },
    Deleted { session_id: uuid::Uuid },
}

/// Typed message published on `ws:{id}` (engine-to-hub), mirroring the
/// client-facing message types in §4.4.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsMessage {
    StateUpdate { state: Session },
    TimeExpired {
        participant_id: uuid::Uuid,
        action: Option<String>,
    },
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, id: uuid::Uuid) -> SyncKairosResult<Option<Session>>;
    async fn create(&self, state: Session) -> SyncKairosResult<()>;
    /// Atomic compare-and-set when `expected_version` is `Some`; an
    /// unconditional write (recovery write-back only) when `None`.
    async fn update(
        &self,
        id: uuid::Uuid,
        new_state: Session,
        expected_version: Option<u64>,
    ) -> SyncKairosResult<()>;
    async fn delete(&self, id: uuid::Uuid) -> SyncKairosResult<()>;
    async fn publish_update(&self, msg: SessionUpdateMessage) -> SyncKairosResult<()>;
    async fn publish_ws(&self, id: uuid::Uuid, msg: WsMessage) -> SyncKairosResult<()>;

    /// Subscribes to the `session-updates` channel (engine-to-engine).
    /// Each call yields an independent receiver over the same underlying
    /// broadcast.
    async fn subscribe_updates(&self) -> SyncKairosResult<broadcast::Receiver<SessionUpdateMessage>>;
    /// Subscribes to the `ws:*` pattern (engine-to-hub). The Hub drains
    /// this to fan broadcasts out to its local sockets (§4.4).
    async fn subscribe_ws(&self) -> SyncKairosResult<broadcast::Receiver<(uuid::Uuid, WsMessage)>>;

    /// Idempotency cache for `POST /sessions/{id}/switch` (§4.5): keyed by
    /// the caller-supplied `Idempotency-Key`, 24h TTL.
    async fn get_idempotent_response(&self, key: &str) -> SyncKairosResult<Option<serde_json::Value>>;
    async fn put_idempotent_response(&self, key: &str, response: serde_json::Value) -> SyncKairosResult<()>;
}

/// Redis-backed implementation. `get` delegates to the Recovery Loader on
/// miss per §4.1; callers that want the raw (non-recovering) read use
/// `get_raw`.
pub struct RedisStore {
    conn: ConnectionManager,
    recovery: Option<Arc<dyn crate::recovery::RecoveryLoader>>,
    updates_tx: broadcast::Sender<SessionUpdateMessage>,
    ws_tx: broadcast::Sender<(uuid::Uuid, WsMessage)>,
}

impl RedisStore {
    /// `client` is used only to open the pub/sub connection the listener
    /// task subscribes with; all other operations go through `conn`.
    pub fn new(
        client: redis::Client,
        conn: ConnectionManager,
        recovery: Option<Arc<dyn crate::recovery::RecoveryLoader>>,
    ) -> Self {
        let (updates_tx, _) = broadcast::channel(FANOUT_CHANNEL_CAPACITY);
        let (ws_tx, _) = broadcast::channel(FANOUT_CHANNEL_CAPACITY);
        spawn_pubsub_listener(client, updates_tx.clone(), ws_tx.clone());
        Self {
            conn,
            recovery,
            updates_tx,
            ws_tx,
        }
    }

    async fn get_raw(&self, id: uuid::Uuid) -> SyncKairosResult<Option<Session>> {
        let mut con = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(session_key(id))
            .query_async(&mut con)
            .await?;
        match raw {
            None => Ok(None),
            Some(s) => serde_json::from_str(&s)
                .map(Some)
                .map_err(|e| SyncKairosError::StateDeserialization(e.to_string())),
        }
    }

    async fn write_raw(&self, id: uuid::Uuid, state: &Session) -> SyncKairosResult<()> {
        let mut con = self.conn.clone();
        let body = serde_json::to_string(state)?;
        redis::cmd("SET")
            .arg(session_key(id))
            .arg(body)
            .arg("EX")
            .arg(SESSION_TTL_SECS)
            .query_async::<_, ()>(&mut con)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn get(&self, id: uuid::Uuid) -> SyncKairosResult<Option<Session>> {
        match self.get_raw(id).await? {
            Some(session) => Ok(Some(session)),
            None => match &self.recovery {
                Some(loader) => loader.recover(id).await,
                None => Ok(None),
            },
        }
    }

    async fn create(&self, state: Session) -> SyncKairosResult<()> {
        self.write_raw(state.session_id, &state).await
    }

    async fn update(
        &self,
        id: uuid::Uuid,
        new_state: Session,
        expected_version: Option<u64>,
    ) -> SyncKairosResult<()> {
        match expected_version {
            Some(expected) => {
                let mut con = self.conn.clone();
                let body = serde_json::to_string(&new_state)?;
                let result: String = cas_script()
                    .key(session_key(id))
                    .arg(body)
                    .arg(expected.to_string())
                    .arg(SESSION_TTL_SECS)
                    .invoke_async(&mut con)
                    .await?;
                match result.as_str() {
                    "OK" => Ok(()),
                    "MISSING" => Err(SyncKairosError::SessionNotFound(id)),
                    other if other.starts_with("CONFLICT:") => {
                        let found = other
                            .trim_start_matches("CONFLICT:")
                            .parse::<u64>()
                            .unwrap_or(0);
                        Err(SyncKairosError::ConcurrentModification { expected, found })
                    }
                    other => Err(SyncKairosError::Internal(format!(
                        "unexpected CAS script result: {other}"
                    ))),
                }
            }
            None => self.write_raw(id, &new_state).await,
        }
    }

    async fn delete(&self, id: uuid::Uuid) -> SyncKairosResult<()> {
        let mut con = self.conn.clone();
        redis::cmd("DEL")
            .arg(session_key(id))
            .query_async::<_, ()>(&mut con)
            .await?;
        Ok(())
    }

    async fn publish_update(&self, msg: SessionUpdateMessage) -> SyncKairosResult<()> {
        let mut con = self.conn.clone();
        let body = serde_json::to_string(&msg)?;
        redis::cmd("PUBLISH")
            .arg(SESSION_UPDATES_CHANNEL)
            .arg(body)
            .query_async::<_, ()>(&mut con)
            .await?;
        Ok(())
    }

    async fn publish_ws(&self, id: uuid::Uuid, msg: WsMessage) -> SyncKairosResult<()> {
        let mut con = self.conn.clone();
        let body = serde_json::to_string(&msg)?;
        redis::cmd("PUBLISH")
            .arg(ws_channel(id))
            .arg(body)
            .query_async::<_, ()>(&mut con)
            .await?;
        Ok(())
    }

    async fn subscribe_updates(&self) -> SyncKairosResult<broadcast::Receiver<SessionUpdateMessage>> {
        Ok(self.updates_tx.subscribe())
    }

    async fn subscribe_ws(&self) -> SyncKairosResult<broadcast::Receiver<(uuid::Uuid, WsMessage)>> {
        Ok(self.ws_tx.subscribe())
    }

    async fn get_idempotent_response(&self, key: &str) -> SyncKairosResult<Option<serde_json::Value>> {
        let mut con = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(idempotency_key(key))
            .query_async(&mut con)
            .await?;
        raw.map(|s| serde_json::from_str(&s).map_err(SyncKairosError::from))
            .transpose()
    }

    async fn put_idempotent_response(&self, key: &str, response: serde_json::Value) -> SyncKairosResult<()> {
        let mut con = self.conn.clone();
        let body = serde_json::to_string(&response)?;
        redis::cmd("SET")
            .arg(idempotency_key(key))
            .arg(body)
            .arg("EX")
            .arg(IDEMPOTENCY_TTL_SECS)
            .query_async::<_, ()>(&mut con)
            .await?;
        Ok(())
    }
}

/// Subscribes to `session-updates` (exact) and `ws:*` (pattern) on a
/// dedicated pub/sub connection and forwards decoded payloads onto the
/// in-process broadcast channels the Hub and other subscribers drain.
/// Reconnects with a 1s backoff on any connection error; a lost Redis
/// connection degrades fan-out, not correctness — state reads/writes go
/// through `conn` independently.
fn spawn_pubsub_listener(
    client: redis::Client,
    updates_tx: broadcast::Sender<SessionUpdateMessage>,
    ws_tx: broadcast::Sender<(uuid::Uuid, WsMessage)>,
) {
    tokio::spawn(async move {
        loop {
            match run_pubsub_once(&client, &updates_tx, &ws_tx).await {
                Ok(()) => {}
                Err(e) => warn!(error = %e, "pub/sub listener lost connection, retrying"),
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    });
}

async fn run_pubsub_once(
    client: &redis::Client,
    updates_tx: &broadcast::Sender<SessionUpdateMessage>,
    ws_tx: &broadcast::Sender<(uuid::Uuid, WsMessage)>,
) -> SyncKairosResult<()> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(SESSION_UPDATES_CHANNEL).await?;
    pubsub.psubscribe(WS_CHANNEL_PATTERN).await?;
    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let channel = msg.get_channel_name().to_string();
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, channel = %channel, "dropping undecodable pub/sub payload");
                continue;
            }
        };
        if channel == SESSION_UPDATES_CHANNEL {
            match serde_json::from_str::<SessionUpdateMessage>(&payload) {
                Ok(decoded) => {
                    let _ = updates_tx.send(decoded);
                }
                Err(e) => warn!(error = %e, "dropping malformed session-updates payload"),
            }
        } else if let Some(id_str) = channel.strip_prefix("ws:") {
            match uuid::Uuid::parse_str(id_str) {
                Ok(id) => match serde_json::from_str::<WsMessage>(&payload) {
                    Ok(decoded) => {
                        let _ = ws_tx.send((id, decoded));
                    }
                    Err(e) => warn!(error = %e, channel = %channel, "dropping malformed ws payload"),
                },
                Err(e) => warn!(error = %e, channel = %channel, "dropping ws message with invalid session id"),
            }
        }
    }
    Ok(())
}

/// In-memory fake for tests and for the local dev profile, per §9's
/// dependency-injection note. CAS semantics are identical to
/// `RedisStore`; publishes are captured on channels callers can drain.
pub struct FakeStore {
    sessions: RwLock<HashMap<uuid::Uuid, Session>>,
    idempotency: RwLock<HashMap<String, serde_json::Value>>,
    updates_tx: broadcast::Sender<SessionUpdateMessage>,
    ws_tx: broadcast::Sender<(uuid::Uuid, WsMessage)>,
}

impl FakeStore {
    pub fn new() -> (
        Self,
        broadcast::Receiver<SessionUpdateMessage>,
        broadcast::Receiver<(uuid::Uuid, WsMessage)>,
    ) {
        let (updates_tx, updates_rx) = broadcast::channel(FANOUT_CHANNEL_CAPACITY);
        let (ws_tx, ws_rx) = broadcast::channel(FANOUT_CHANNEL_CAPACITY);
        (
            Self {
                sessions: RwLock::new(HashMap::new()),
                idempotency: RwLock::new(HashMap::new()),
                updates_tx,
                ws_tx,
            },
            updates_rx,
            ws_rx,
        )
    }
}

#[async_trait]
impl StateStore for FakeStore {
    async fn get(&self, id: uuid::Uuid) -> SyncKairosResult<Option<Session>> {
        Ok(self.sessions.read().await.get(&id).cloned())
    }

    async fn create(&self, state: Session) -> SyncKairosResult<()> {
        self.sessions.write().await.insert(state.session_id, state);
        Ok(())
    }

    async fn update(
        &self,
        id: uuid::Uuid,
        new_state: Session,
        expected_version: Option<u64>,
    ) -> SyncKairosResult<()> {
        let mut sessions = self.sessions.write().await;
        if let Some(expected) = expected_version {
            let current = sessions
                .get(&id)
                .ok_or(SyncKairosError::SessionNotFound(id))?;
            if current.version != expected {
                return Err(SyncKairosError::ConcurrentModification {
                    expected,
                    found: current.version,
                });
            }
        }
        sessions.insert(id, new_state);
        Ok(())
    }

    async fn delete(&self, id: uuid::Uuid) -> SyncKairosResult<()> {
        self.sessions.write().await.remove(&id);
        Ok(())
    }

    async fn publish_update(&self, msg: SessionUpdateMessage) -> SyncKairosResult<()> {
        let _ = self.updates_tx.send(msg);
        Ok(())
    }

    async fn publish_ws(&self, id: uuid::Uuid, msg: WsMessage) -> SyncKairosResult<()> {
        let _ = self.ws_tx.send((id, msg));
        Ok(())
    }

    async fn subscribe_updates(&self) -> SyncKairosResult<broadcast::Receiver<SessionUpdateMessage>> {
        Ok(self.updates_tx.subscribe())
    }

    async fn subscribe_ws(&self) -> SyncKairosResult<broadcast::Receiver<(uuid::Uuid, WsMessage)>> {
        Ok(self.ws_tx.subscribe())
    }

    async fn get_idempotent_response(&self, key: &str) -> SyncKairosResult<Option<serde_json::Value>> {
        Ok(self.idempotency.read().await.get(key).cloned())
    }

    async fn put_idempotent_response(&self, key: &str, response: serde_json::Value) -> SyncKairosResult<()> {
        self.idempotency.write().await.insert(key.to_string(), response);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{build_pending_session, CreateSessionRequest, ParticipantInput, SyncMode};
    use chrono::Utc;

    fn sample_session() -> Session {
        let req = CreateSessionRequest {
            session_id: uuid::Uuid::new_v4(),
            sync_mode: SyncMode::PerParticipant,
            participants: vec![ParticipantInput {
                participant_id: uuid::Uuid::new_v4(),
                participant_index: None,
                total_time_ms: 10_000,
                group_id: None,
            }],
            time_per_cycle_ms: None,
            increment_ms: None,
            max_time_ms: None,
            action_on_timeout: None,
            auto_advance: None,
            metadata: None,
        };
        build_pending_session(req, Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn create_then_get_roundtrips() {
        let (store, _updates, _ws) = FakeStore::new();
        let session = sample_session();
        let id = session.session_id;
        store.create(session.clone()).await.unwrap();
        let fetched = store.get(id).await.unwrap().unwrap();
        assert_eq!(fetched.session_id, id);
    }

    #[tokio::test]
    async fn update_with_stale_expected_version_fails() {
        let (store, _updates, _ws) = FakeStore::new();
        let session = sample_session();
        let id = session.session_id;
        store.create(session.clone()).await.unwrap();

        let mut next = session.clone();
        next.version = 2;
        let result = store.update(id, next, Some(99)).await;
        assert!(matches!(
            result,
            Err(SyncKairosError::ConcurrentModification { .. })
        ));
    }

    #[tokio::test]
    async fn update_on_missing_session_is_session_not_found() {
        let (store, _updates, _ws) = FakeStore::new();
        let session = sample_session();
        let result = store.update(session.session_id, session, Some(1)).await;
        assert!(matches!(result, Err(SyncKairosError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn publish_update_is_observable_on_the_channel() {
        let (store, mut updates, _ws) = FakeStore::new();
        let session = sample_session();
        let id = session.session_id;
        store
            .publish_update(SessionUpdateMessage::State {
                session_id: id,
                state: session,
            })
            .await
            .unwrap();
        let received = updates.recv().await.unwrap();
        match received {
            SessionUpdateMessage::State { session_id, .. } => assert_eq!(session_id, id),
            _ => panic!("expected State message"),
        }
    }
}
