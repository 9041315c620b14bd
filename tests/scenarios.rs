// End-to-end scenario coverage that doesn't fit naturally inside a single
// module's unit tests: cross-instance fan-out (hub dispatch driven by the
// store's publish channel) and recovery after a simulated store loss.
//
// Scenarios A, B, C and F (increment accounting, expiration, concurrent
// switch contention, pause/resume accounting) are covered as engine unit
// tests; this file covers D and E.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use synckairos::audit::AuditQueue;
use synckairos::engine::SessionEngine;
use synckairos::error::SyncKairosResult;
use synckairos::hub::Hub;
use synckairos::model::{build_pending_session, CreateSessionRequest, ParticipantInput, Session, SyncMode};
use synckairos::recovery::RecoveryLoader;
use synckairos::store::{FakeStore, StateStore, WsMessage};

fn two_player_request() -> CreateSessionRequest {
    CreateSessionRequest {
        session_id: Uuid::new_v4(),
        sync_mode: SyncMode::PerParticipant,
        participants: vec![
            ParticipantInput {
                participant_id: Uuid::new_v4(),
                participant_index: None,
                total_time_ms: 600_000,
                group_id: None,
            },
            ParticipantInput {
                participant_id: Uuid::new_v4(),
                participant_index: None,
                total_time_ms: 600_000,
                group_id: None,
            },
        ],
        time_per_cycle_ms: None,
        increment_ms: Some(2_000),
        max_time_ms: None,
        action_on_timeout: None,
        auto_advance: None,
        metadata: None,
    }
}

/// Scenario D: a switch on one engine instance publishes a `ws:{id}`
/// message that a second instance's hub can dispatch to its local
/// sockets, without either instance holding authoritative session state
/// in the hub itself.
#[tokio::test]
async fn scenario_d_cross_instance_fan_out_via_ws_channel() {
    let (store, _updates, mut ws_rx) = FakeStore::new();
    let store: Arc<dyn StateStore> = Arc::new(store);
    let audit = Arc::new(AuditQueue::new_noop());
    let engine = Arc::new(SessionEngine::new(store.clone(), audit));

    // Instance A owns the engine and performs the switch.
    let created = engine.create_session(two_player_request()).await.unwrap();
    let id = created.session_id;
    engine.start_session(id).await.unwrap();
    engine.switch_cycle(id, None, None).await.unwrap();

    // Instance B only has a Hub wired to the same engine (as it would be
    // over the shared store/bus in a real deployment) and consumes the
    // `ws:{id}` channel to fan out to its local sockets.
    let hub_b = Hub::new(engine.clone(), 5);
    let (session_id, msg) = ws_rx.recv().await.expect("publish_ws emitted a message");
    assert_eq!(session_id, id);
    assert!(matches!(msg, WsMessage::StateUpdate { .. }));

    // No sockets registered on instance B yet; dispatch is a no-op but
    // must not panic or error.
    hub_b.dispatch(session_id, msg).await;
    assert_eq!(hub_b.socket_count(session_id), 0);
}

/// Scenario E: the primary store loses its copy of a session (simulated
/// by deleting it directly), and a get through a recovering store
/// reconstructs state from the last audit snapshot, tagging it as
/// recovered and writing it back so the next read hits the store.
struct SnapshotRecoveryLoader {
    snapshot: Session,
    store: Arc<dyn StateStore>,
}

#[async_trait]
impl RecoveryLoader for SnapshotRecoveryLoader {
    async fn recover(&self, session_id: Uuid) -> SyncKairosResult<Option<Session>> {
        if session_id != self.snapshot.session_id {
            return Ok(None);
        }
        let mut recovered = self.snapshot.clone();
        recovered.recovered = Some(true);
        recovered.recovered_at = Some(Utc::now());
        recovered.recovery_warning = Some("recovered from audit snapshot, up to 2s stale".to_string());
        self.store.update(session_id, recovered.clone(), None).await?;
        Ok(Some(recovered))
    }
}

#[tokio::test]
async fn scenario_e_recovery_after_primary_store_loss() {
    let (store, _updates, _ws) = FakeStore::new();
    let store: Arc<dyn StateStore> = Arc::new(store);

    let req = CreateSessionRequest {
        session_id: Uuid::new_v4(),
        sync_mode: SyncMode::PerParticipant,
        participants: vec![ParticipantInput {
            participant_id: Uuid::new_v4(),
            participant_index: None,
            total_time_ms: 300_000,
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
    store.create(session.clone()).await.unwrap();

    // Simulate the primary store losing the key (e.g. a Redis restart
    // before persistence flushed).
    store.delete(id).await.unwrap();
    assert!(store.get(id).await.unwrap().is_none());

    // The audit database still has the last snapshot; the loader
    // reconstructs and writes it back.
    let loader = SnapshotRecoveryLoader {
        snapshot: session,
        store: store.clone(),
    };
    let recovered = loader.recover(id).await.unwrap().expect("snapshot exists");
    assert_eq!(recovered.recovered, Some(true));
    assert!(recovered.recovery_warning.is_some());

    // A subsequent read now finds the reconstructed state without the
    // caller having to know recovery happened.
    let persisted = store.get(id).await.unwrap().unwrap();
    assert_eq!(persisted.session_id, id);
    assert_eq!(persisted.recovered, Some(true));
}
