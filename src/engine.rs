// synckairos: Session Engine (SE) — §4.3.
//
// Enforces the session state machine, performs time arithmetic, enforces
// optimistic locking via `version`, and emits updates through the store
// and the audit queue. SE performs no internal retries: either a
// mutation applies exactly once at some version, or the caller sees
// `ConcurrentModification`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::audit::{AuditQueue, EventType};
use crate::error::{SyncKairosError, SyncKairosResult};
use crate::model::{build_pending_session, CreateSessionRequest, Session, Status, SyncMode};
use crate::store::{SessionUpdateMessage, StateStore, WsMessage};

/// Result of a `switchCycle` call (§4.3: "includes the new state, the id
/// of any expired participant, and the applied action").
#[derive(Debug, Clone)]
pub struct SwitchResult {
    pub state: Session,
    pub expired_participant_id: Option<Uuid>,
    pub applied_action: Option<String>,
}

pub struct SessionEngine {
    store: Arc<dyn StateStore>,
    audit: Arc<AuditQueue>,
}

impl SessionEngine {
    pub fn new(store: Arc<dyn StateStore>, audit: Arc<AuditQueue>) -> Self {
        Self { store, audit }
    }

    async fn publish(&self, session: &Session) -> SyncKairosResult<()> {
        self.store
            .publish_update(SessionUpdateMessage::State {
                session_id: session.session_id,
                state: session.clone(),
            })
            .await?;
        self.store
            .publish_ws(
                session.session_id,
                WsMessage::StateUpdate {
                    state: session.clone(),
                },
            )
            .await
    }

    pub async fn create_session(&self, req: CreateSessionRequest) -> SyncKairosResult<Session> {
        let session = build_pending_session(req, Utc::now())?;
        self.store.create(session.clone()).await?;
        self.audit
            .enqueue(session.session_id, session.clone(), EventType::SessionCreated)
            .await;
        Ok(session)
    }

    pub async fn start_session(&self, id: Uuid) -> SyncKairosResult<Session> {
        let mut session = self
            .store
            .get(id)
            .await?
            .ok_or(SyncKairosError::SessionNotFound(id))?;

        if session.status != Status::Pending {
            return Err(SyncKairosError::InvalidState(format!(
                "startSession requires status=pending, found {:?}",
                session.status
            )));
        }

        let expected_version = session.version;
        let now = Utc::now();
        session.status = Status::Running;
        session.session_started_at = Some(now);
        session.cycle_started_at = Some(now);

        if matches!(
            session.sync_mode,
            crate::model::SyncMode::PerParticipant | crate::model::SyncMode::PerGroup
        ) {
            if let Some(first) = session
                .participants
                .iter()
                .min_by_key(|p| p.participant_index)
                .map(|p| p.participant_id)
            {
                session.active_participant_id = Some(first);
                if let Some(p) = session.active_participant_mut() {
                    p.is_active = true;
                }
            }
        }

        session.version += 1;
        session.updated_at = now;

        self.store
            .update(id, session.clone(), Some(expected_version))
            .await?;
        self.publish(&session).await?;
        self.audit
            .enqueue(id, session.clone(), EventType::SessionStarted)
            .await;

        Ok(session)
    }

    /// The hot path. Budgeted at <50ms p99 (§4.3, GLOSSARY).
    pub async fn switch_cycle(
        &self,
        id: Uuid,
        current_pid: Option<Uuid>,
        next_pid: Option<Uuid>,
    ) -> SyncKairosResult<SwitchResult> {
        let mut session = self
            .store
            .get(id)
            .await?
            .ok_or(SyncKairosError::SessionNotFound(id))?;

        if session.status != Status::Running {
            return Err(SyncKairosError::InvalidState(format!(
                "switchCycle requires status=running, found {:?}",
                session.status
            )));
        }

        let expected_version = session.version;
        let now = Utc::now();
        let cycle_started_at = session
            .cycle_started_at
            .ok_or_else(|| SyncKairosError::Internal("running session missing cycle_started_at".into()))?;
        let elapsed = elapsed_ms(cycle_started_at, now);

        let active_id = current_pid.or(session.active_participant_id);
        let mut expired_participant_id = None;
        let mut applied_action = None;
        let mut current_index = None;
        let mut session_expired = false;

        if let Some(active_id) = active_id {
            let increment_ms = session.increment_ms;
            let active = session
                .participants
                .iter_mut()
                .find(|p| p.participant_id == active_id)
                .ok_or(SyncKairosError::ParticipantNotFound(active_id))?;

            current_index = Some(active.participant_index);
            active.time_used_ms += elapsed;
            active.total_time_ms = (active.total_time_ms - elapsed).max(0);
            active.time_remaining_ms = active.total_time_ms;

            if active.total_time_ms == 0 {
                active.has_expired = true;
                expired_participant_id = Some(active.participant_id);
            } else if increment_ms > 0 {
                active.total_time_ms += increment_ms;
                active.time_remaining_ms = active.total_time_ms;
            }

            active.cycle_count += 1;
            active.is_active = false;
        } else if matches!(session.sync_mode, SyncMode::Global | SyncMode::CountUp) {
            // No single active participant to charge; the whole session
            // accrues elapsed time against its own `max_time_ms` cap.
            session.time_used_ms += elapsed;
            if let Some(max_time_ms) = session.max_time_ms {
                if session.time_used_ms >= max_time_ms {
                    session.time_used_ms = max_time_ms;
                    session.has_expired = true;
                    session_expired = true;
                }
            }
        }

        let participant_count = session.participants.len() as u32;
        let next_index = current_index.map(|idx| (idx + 1) % participant_count.max(1));

        let next = match next_pid {
            Some(pid) => Some(
                session
                    .participant_by_id(pid)
                    .ok_or(SyncKairosError::ParticipantNotFound(pid))?
                    .participant_id,
            ),
            None => next_index.and_then(|idx| session.participant_by_index(idx)).map(|p| p.participant_id),
        };

        let should_halt = (expired_participant_id.is_some() || session_expired)
            && session
                .action_on_timeout
                .as_ref()
                .map(|a| a.halts_session())
                .unwrap_or(false);

        if should_halt {
            session.status = Status::Expired;
            session.active_participant_id = None;
            applied_action = session.action_on_timeout.as_ref().map(|a| a.kind.clone());
        } else if let Some(next_id) = next {
            session.active_participant_id = Some(next_id);
            session.cycle_started_at = Some(now);
            if let Some(p) = session.participants.iter_mut().find(|p| p.participant_id == next_id) {
                p.is_active = true;
            }
        }

        session.version += 1;
        session.updated_at = now;

        self.store
            .update(id, session.clone(), Some(expected_version))
            .await?;
        self.publish(&session).await?;

        if let Some(expired_id) = expired_participant_id {
            self.store
                .publish_ws(
                    id,
                    WsMessage::TimeExpired {
                        participant_id: expired_id,
                        action: applied_action.clone(),
                    },
                )
                .await?;
            self.audit
                .enqueue(id, session.clone(), EventType::ParticipantExpired)
                .await;
        } else if session_expired {
            // No participant to name in a WS `TimeExpired` message; the
            // unconditional `publish` above already carried `has_expired`
            // in the state snapshot.
            self.audit
                .enqueue(id, session.clone(), EventType::ParticipantExpired)
                .await;
        } else {
            self.audit
                .enqueue(id, session.clone(), EventType::CycleSwitched)
                .await;
        }

        Ok(SwitchResult {
            state: session,
            expired_participant_id,
            applied_action,
        })
    }

    pub async fn pause_session(&self, id: Uuid) -> SyncKairosResult<Session> {
        let mut session = self
            .store
            .get(id)
            .await?
            .ok_or(SyncKairosError::SessionNotFound(id))?;

        if session.status != Status::Running {
            return Err(SyncKairosError::InvalidState(format!(
                "pauseSession requires status=running, found {:?}",
                session.status
            )));
        }

        let expected_version = session.version;
        let now = Utc::now();
        if let Some(cycle_started_at) = session.cycle_started_at {
            let elapsed = elapsed_ms(cycle_started_at, now);
            if let Some(active) = session.active_participant_mut() {
                active.time_used_ms += elapsed;
                active.total_time_ms = (active.total_time_ms - elapsed).max(0);
                active.time_remaining_ms = active.total_time_ms;
            } else if matches!(session.sync_mode, SyncMode::Global | SyncMode::CountUp) {
                session.time_used_ms += elapsed;
                if let Some(max_time_ms) = session.max_time_ms {
                    if session.time_used_ms >= max_time_ms {
                        session.time_used_ms = max_time_ms;
                        session.has_expired = true;
                    }
                }
            }
        }
        session.cycle_started_at = None;
        session.status = Status::Paused;
        session.version += 1;
        session.updated_at = now;

        self.store
            .update(id, session.clone(), Some(expected_version))
            .await?;
        self.publish(&session).await?;
        self.audit
            .enqueue(id, session.clone(), EventType::SessionPaused)
            .await;

        Ok(session)
    }

    pub async fn resume_session(&self, id: Uuid) -> SyncKairosResult<Session> {
        let mut session = self
            .store
            .get(id)
            .await?
            .ok_or(SyncKairosError::SessionNotFound(id))?;

        if session.status != Status::Paused {
            return Err(SyncKairosError::InvalidState(format!(
                "resumeSession requires status=paused, found {:?}",
                session.status
            )));
        }

        let expected_version = session.version;
        let now = Utc::now();
        session.cycle_started_at = Some(now);
        session.status = Status::Running;
        session.version += 1;
        session.updated_at = now;

        self.store
            .update(id, session.clone(), Some(expected_version))
            .await?;
        self.publish(&session).await?;
        self.audit
            .enqueue(id, session.clone(), EventType::SessionResumed)
            .await;

        Ok(session)
    }

    pub async fn complete_session(&self, id: Uuid) -> SyncKairosResult<Session> {
        let mut session = self
            .store
            .get(id)
            .await?
            .ok_or(SyncKairosError::SessionNotFound(id))?;

        if !session.status.can_transition_to(Status::Completed) {
            return Err(SyncKairosError::InvalidState(format!(
                "cannot complete session in status {:?}",
                session.status
            )));
        }

        let expected_version = session.version;
        let now = Utc::now();
        session.status = Status::Completed;
        session.session_completed_at = Some(now);
        session.cycle_started_at = None;
        for p in &mut session.participants {
            p.is_active = false;
        }
        session.active_participant_id = None;
        session.version += 1;
        session.updated_at = now;

        self.store
            .update(id, session.clone(), Some(expected_version))
            .await?;
        self.publish(&session).await?;
        self.audit
            .enqueue(id, session.clone(), EventType::SessionCompleted)
            .await;

        Ok(session)
    }

    pub async fn cancel_session(&self, id: Uuid) -> SyncKairosResult<Session> {
        let mut session = self
            .store
            .get(id)
            .await?
            .ok_or(SyncKairosError::SessionNotFound(id))?;

        let expected_version = session.version;
        let now = Utc::now();
        session.status = Status::Cancelled;
        session.cycle_started_at = None;
        for p in &mut session.participants {
            p.is_active = false;
        }
        session.active_participant_id = None;
        session.version += 1;
        session.updated_at = now;

        self.store
            .update(id, session.clone(), Some(expected_version))
            .await?;
        self.publish(&session).await?;
        self.audit
            .enqueue(id, session.clone(), EventType::SessionCancelled)
            .await;

        Ok(session)
    }

    /// Does not advance time; returns stored anchors verbatim (§4.3).
    pub async fn get_current_state(&self, id: Uuid) -> SyncKairosResult<Session> {
        self.store
            .get(id)
            .await?
            .ok_or(SyncKairosError::SessionNotFound(id))
    }

    pub async fn delete_session(&self, id: Uuid) -> SyncKairosResult<()> {
        self.store.delete(id).await?;
        self.store
            .publish_update(SessionUpdateMessage::Deleted { session_id: id })
            .await
    }
}

/// `elapsed = max(0, now - cycle_started_at)`. The clamp absorbs clock
/// skew between coordinating instances (§4.3 step 3).
fn elapsed_ms(cycle_started_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - cycle_started_at).num_milliseconds().max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditQueue;
    use crate::model::{ParticipantInput, SyncMode};
    use crate::store::FakeStore;
    use std::time::Duration;

    async fn engine_with_fake_store() -> (SessionEngine, Arc<dyn StateStore>) {
        let (store, _u, _w) = FakeStore::new();
        let store: Arc<dyn StateStore> = Arc::new(store);
        let audit = Arc::new(AuditQueue::new_noop());
        (SessionEngine::new(store.clone(), audit), store)
    }

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

    #[tokio::test]
    async fn scenario_a_increment_applied_on_switch() {
        let (engine, _store) = engine_with_fake_store().await;
        let created = engine.create_session(two_player_request()).await.unwrap();
        let id = created.session_id;

        let started = engine.start_session(id).await.unwrap();
        assert_eq!(started.version, 2);
        assert!(started.participants[0].is_active);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let result = engine.switch_cycle(id, None, None).await.unwrap();

        assert_eq!(result.state.version, 3);
        assert!(!result.state.participants[0].is_active);
        assert!(result.state.participants[1].is_active);
        assert_eq!(result.state.participants[0].cycle_count, 1);
        // total_time_ms should be close to 600_000 - elapsed + 2000 increment.
        assert!(result.state.participants[0].total_time_ms > 600_000);
    }

    #[tokio::test]
    async fn scenario_b_expiration_suppresses_increment() {
        let (engine, _store) = engine_with_fake_store().await;
        let mut req = two_player_request();
        req.participants[0].total_time_ms = 1_000;
        let created = engine.create_session(req).await.unwrap();
        let id = created.session_id;

        engine.start_session(id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_010)).await;
        let result = engine.switch_cycle(id, None, None).await.unwrap();

        let expired = &result.state.participants[0];
        assert_eq!(expired.total_time_ms, 0);
        assert!(expired.has_expired);
        assert_eq!(expired.cycle_count, 1);
        assert_eq!(result.expired_participant_id, Some(expired.participant_id));
    }

    #[tokio::test]
    async fn scenario_c_concurrent_switches_only_one_succeeds() {
        let (engine, _store) = engine_with_fake_store().await;
        let created = engine.create_session(two_player_request()).await.unwrap();
        let id = created.session_id;
        engine.start_session(id).await.unwrap();

        let engine = Arc::new(engine);
        let mut handles = Vec::new();
        for _ in 0..5 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move { engine.switch_cycle(id, None, None).await }));
        }

        let mut successes = 0;
        let mut conflicts = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => successes += 1,
                Err(SyncKairosError::ConcurrentModification { .. }) => conflicts += 1,
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }

        assert_eq!(successes, 1);
        assert_eq!(conflicts, 4);

        let final_state = engine.get_current_state(id).await.unwrap();
        assert_eq!(final_state.version, 3);
    }

    #[tokio::test]
    async fn single_participant_session_rotates_to_itself() {
        let (engine, _store) = engine_with_fake_store().await;
        let req = CreateSessionRequest {
            session_id: Uuid::new_v4(),
            sync_mode: SyncMode::PerParticipant,
            participants: vec![ParticipantInput {
                participant_id: Uuid::new_v4(),
                participant_index: None,
                total_time_ms: 600_000,
                group_id: None,
            }],
            time_per_cycle_ms: None,
            increment_ms: None,
            max_time_ms: None,
            action_on_timeout: None,
            auto_advance: None,
            metadata: None,
        };
        let created = engine.create_session(req).await.unwrap();
        let id = created.session_id;
        let only_id = created.participants[0].participant_id;

        engine.start_session(id).await.unwrap();
        let result = engine.switch_cycle(id, None, None).await.unwrap();

        assert_eq!(result.state.active_participant_id, Some(only_id));
        assert_eq!(result.state.participants[0].cycle_count, 1);
    }

    #[tokio::test]
    async fn scenario_f_pause_resume_accounting() {
        let (engine, _store) = engine_with_fake_store().await;
        let created = engine.create_session(two_player_request()).await.unwrap();
        let id = created.session_id;
        engine.start_session(id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let paused = engine.pause_session(id).await.unwrap();
        assert!(paused.cycle_started_at.is_none());
        let used_at_pause = paused.participants[0].time_used_ms;
        assert!(used_at_pause >= 90);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let resumed = engine.resume_session(id).await.unwrap();
        assert!(resumed.cycle_started_at.is_some());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let switched = engine.switch_cycle(id, None, None).await.unwrap();
        // time_used_ms should reflect ~100ms + ~20ms, not the 50ms pause interval.
        assert!(switched.state.participants[0].time_used_ms < used_at_pause + 200);
    }

    #[tokio::test]
    async fn start_session_requires_pending_status() {
        let (engine, _store) = engine_with_fake_store().await;
        let created = engine.create_session(two_player_request()).await.unwrap();
        let id = created.session_id;
        engine.start_session(id).await.unwrap();
        let result = engine.start_session(id).await;
        assert!(matches!(result, Err(SyncKairosError::InvalidState(_))));
    }
}
