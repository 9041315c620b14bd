// synckairos: Recovery Loader (RL) — §4.6.
//
// Invoked by the State Store Client on a `get` miss. Reconstructs the
// last-known session state from the audit database's snapshot column and
// writes it back unconditionally, so a subsequent `get` finds it in the
// store without the caller having to special-case recovery.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;

use crate::error::SyncKairosResult;
use crate::model::Session;

#[async_trait]
pub trait RecoveryLoader: Send + Sync {
    async fn recover(&self, session_id: uuid::Uuid) -> SyncKairosResult<Option<Session>>;
}

/// Queries `sync_events` for the most recent `state_snapshot`, since the
/// audit log is the only durable record of full session state (§6).
pub struct AuditRecoveryLoader {
    pool: PgPool,
    store: std::sync::Arc<dyn crate::store::StateStore>,
}

impl AuditRecoveryLoader {
    pub fn new(pool: PgPool, store: std::sync::Arc<dyn crate::store::StateStore>) -> Self {
        Self { pool, store }
    }
}

#[async_trait]
impl RecoveryLoader for AuditRecoveryLoader {
    async fn recover(&self, session_id: uuid::Uuid) -> SyncKairosResult<Option<Session>> {
        let row: Option<(serde_json::Value,)> = sqlx::query_as(
            "SELECT state_snapshot FROM sync_events \
             WHERE session_id = $1 \
             ORDER BY timestamp DESC LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((snapshot,)) = row else {
            return Ok(None);
        };

        let mut session: Session = serde_json::from_value(snapshot)?;
        session.recovered = Some(true);
        session.recovered_at = Some(Utc::now());
        session.recovery_warning = Some("recovered from audit snapshot, up to 2s stale".to_string());

        // Unconditional write-back: we just materialized this version, so
        // there is nothing to CAS against.
        self.store.update(session_id, session.clone(), None).await?;

        Ok(Some(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{build_pending_session, CreateSessionRequest, ParticipantInput, SyncMode};
    use crate::store::FakeStore;
    use std::sync::Arc;

    struct StaticRecoveryLoader {
        snapshot: Option<Session>,
        store: Arc<dyn crate::store::StateStore>,
    }

    #[async_trait]
    impl RecoveryLoader for StaticRecoveryLoader {
        async fn recover(&self, _session_id: uuid::Uuid) -> SyncKairosResult<Option<Session>> {
            match &self.snapshot {
                None => Ok(None),
                Some(s) => {
                    let mut s = s.clone();
                    s.recovered = Some(true);
                    s.recovered_at = Some(Utc::now());
                    self.store.update(s.session_id, s.clone(), None).await?;
                    Ok(Some(s))
                }
            }
        }
    }

    #[tokio::test]
    async fn recovers_and_writes_back_tagged_state() {
        let (store, _u, _w) = FakeStore::new();
        let store: Arc<dyn crate::store::StateStore> = Arc::new(store);

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
        let session = build_pending_session(req, Utc::now()).unwrap();
        let id = session.session_id;

        let loader = StaticRecoveryLoader {
            snapshot: Some(session),
            store: store.clone(),
        };

        let recovered = loader.recover(id).await.unwrap().unwrap();
        assert_eq!(recovered.recovered, Some(true));

        let persisted = store.get(id).await.unwrap().unwrap();
        assert_eq!(persisted.recovered, Some(true));
    }

    #[tokio::test]
    async fn returns_none_when_no_snapshot_exists() {
        let (store, _u, _w) = FakeStore::new();
        let store: Arc<dyn crate::store::StateStore> = Arc::new(store);
        let loader = StaticRecoveryLoader {
            snapshot: None,
            store,
        };
        assert!(loader.recover(uuid::Uuid::new_v4()).await.unwrap().is_none());
    }
}
