// synckairos: Session/Participant data model and creation validation (§3, §4.3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{SyncKairosError, SyncKairosResult};

const MIN_TOTAL_TIME_MS: i64 = 1_000;
const MAX_TOTAL_TIME_MS: i64 = 86_400_000;
const MAX_PARTICIPANTS: usize = 1_000;
const MAX_METADATA_BYTES: usize = 10 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    PerParticipant,
    PerCycle,
    PerGroup,
    Global,
    CountUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Running,
    Paused,
    Expired,
    Completed,
    Cancelled,
}

impl Status {
    /// Allowed status transitions, per spec §3: pending→running;
    /// running⇄paused; running→expired; running→completed; any→cancelled.
    pub fn can_transition_to(self, next: Status) -> bool {
        use Status::*;
        match (self, next) {
            (_, Cancelled) => true,
            (Pending, Running) => true,
            (Running, Paused) => true,
            (Paused, Running) => true,
            (Running, Expired) => true,
            (Running, Completed) => true,
            _ => false,
        }
    }
}

/// Opaque timeout policy. The engine recognizes only whether the policy
/// halts the session (`end_session`) or lets it continue (everything
/// else, including `skip_cycle` / `auto_action`); any further semantics
/// belong to a policy layer outside the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOnTimeout {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub extra: Value,
}

impl ActionOnTimeout {
    pub fn halts_session(&self) -> bool {
        self.kind == "end_session"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub participant_id: Uuid,
    pub group_id: Option<Uuid>,
    pub participant_index: u32,
    pub total_time_ms: i64,
    pub time_used_ms: i64,
    pub time_remaining_ms: i64,
    pub cycle_count: u64,
    pub is_active: bool,
    pub has_expired: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: Uuid,
    pub sync_mode: SyncMode,
    pub status: Status,
    pub active_participant_id: Option<Uuid>,
    pub active_group_id: Option<Uuid>,
    pub cycle_started_at: Option<DateTime<Utc>>,
    pub session_started_at: Option<DateTime<Utc>>,
    pub session_completed_at: Option<DateTime<Utc>>,
    pub time_per_cycle_ms: Option<i64>,
    pub increment_ms: i64,
    pub max_time_ms: Option<i64>,
    pub auto_advance: bool,
    pub action_on_timeout: Option<ActionOnTimeout>,
    /// Session-level accounting for `global`/`count_up`, which have no
    /// single active participant to hold `time_used_ms`/`has_expired` on.
    pub time_used_ms: i64,
    pub has_expired: bool,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: Value,
    pub participants: Vec<Participant>,
    /// Set by the Recovery Loader when this state was reconstructed from
    /// an audit snapshot rather than read live from the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovered: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_warning: Option<String>,
}

impl Session {
    pub fn active_participant_mut(&mut self) -> Option<&mut Participant> {
        let id = self.active_participant_id?;
        self.participants.iter_mut().find(|p| p.participant_id == id)
    }

    pub fn participant_by_id(&self, id: Uuid) -> Option<&Participant> {
        self.participants.iter().find(|p| p.participant_id == id)
    }

    pub fn participant_by_index(&self, index: u32) -> Option<&Participant> {
        self.participants.iter().find(|p| p.participant_index == index)
    }
}

/// Wire shape of one participant entry in the create-session payload (§6).
#[derive(Debug, Clone, Deserialize)]
pub struct ParticipantInput {
    pub participant_id: Uuid,
    pub participant_index: Option<u32>,
    pub total_time_ms: i64,
    pub group_id: Option<Uuid>,
}

/// Wire shape of `POST /sessions` (§6).
#[derive(Debug, Clone, Deserialize)]
pub struct CreateSessionRequest {
    pub session_id: Uuid,
    pub sync_mode: SyncMode,
    pub participants: Vec<ParticipantInput>,
    pub time_per_cycle_ms: Option<i64>,
    pub increment_ms: Option<i64>,
    pub max_time_ms: Option<i64>,
    pub action_on_timeout: Option<ActionOnTimeout>,
    pub auto_advance: Option<bool>,
    pub metadata: Option<Value>,
}

/// Validate and materialize a pending `Session` from a create request.
/// Does not touch the store; `engine::create_session` persists the result.
pub fn build_pending_session(
    req: CreateSessionRequest,
    now: DateTime<Utc>,
) -> SyncKairosResult<Session> {
    if req.participants.is_empty() || req.participants.len() > MAX_PARTICIPANTS {
        return Err(SyncKairosError::Validation(format!(
            "participants must have 1..{MAX_PARTICIPANTS} entries, got {}",
            req.participants.len()
        )));
    }

    let mut seen_ids = std::collections::HashSet::new();
    for p in &req.participants {
        if !seen_ids.insert(p.participant_id) {
            return Err(SyncKairosError::Validation(format!(
                "duplicate participant_id {}",
                p.participant_id
            )));
        }
        if !(MIN_TOTAL_TIME_MS..=MAX_TOTAL_TIME_MS).contains(&p.total_time_ms) {
            return Err(SyncKairosError::Validation(format!(
                "participant {} total_time_ms {} out of range [{MIN_TOTAL_TIME_MS}, {MAX_TOTAL_TIME_MS}]",
                p.participant_id, p.total_time_ms
            )));
        }
    }

    if let Some(tpc) = req.time_per_cycle_ms {
        if tpc < 1_000 {
            return Err(SyncKairosError::Validation(
                "time_per_cycle_ms must be >= 1000".to_string(),
            ));
        }
    }
    let increment_ms = req.increment_ms.unwrap_or(0);
    if !(0..=60_000).contains(&increment_ms) {
        return Err(SyncKairosError::Validation(
            "increment_ms must be in [0, 60000]".to_string(),
        ));
    }
    if let Some(mt) = req.max_time_ms {
        if !(MIN_TOTAL_TIME_MS..=MAX_TOTAL_TIME_MS).contains(&mt) {
            return Err(SyncKairosError::Validation(format!(
                "max_time_ms out of range [{MIN_TOTAL_TIME_MS}, {MAX_TOTAL_TIME_MS}]"
            )));
        }
    }

    let metadata = req.metadata.unwrap_or(Value::Null);
    let metadata_len = serde_json::to_vec(&metadata)
        .map(|bytes| bytes.len())
        .unwrap_or(0);
    if metadata_len > MAX_METADATA_BYTES {
        return Err(SyncKairosError::Validation(format!(
            "metadata exceeds {MAX_METADATA_BYTES} bytes"
        )));
    }

    let participants = assign_dense_indices(req.participants)?;

    Ok(Session {
        session_id: req.session_id,
        sync_mode: req.sync_mode,
        status: Status::Pending,
        active_participant_id: None,
        active_group_id: None,
        cycle_started_at: None,
        session_started_at: None,
        session_completed_at: None,
        time_per_cycle_ms: req.time_per_cycle_ms,
        increment_ms,
        max_time_ms: req.max_time_ms,
        auto_advance: req.auto_advance.unwrap_or(false),
        action_on_timeout: req.action_on_timeout,
        time_used_ms: 0,
        has_expired: false,
        version: 1,
        created_at: now,
        updated_at: now,
        metadata,
        participants,
        recovered: None,
        recovered_at: None,
        recovery_warning: None,
    })
}

/// participant_index values are dense starting at 0; when the caller
/// supplies no indices, assignment follows input order.
fn assign_dense_indices(inputs: Vec<ParticipantInput>) -> SyncKairosResult<Vec<Participant>> {
    let all_explicit = inputs.iter().all(|p| p.participant_index.is_some());
    let indexed: Vec<(u32, ParticipantInput)> = if all_explicit {
        let mut pairs: Vec<(u32, ParticipantInput)> = inputs
            .into_iter()
            .map(|p| (p.participant_index.unwrap(), p))
            .collect();
        pairs.sort_by_key(|(idx, _)| *idx);
        let mut expected = 0u32;
        for (idx, _) in &pairs {
            if *idx != expected {
                return Err(SyncKairosError::Validation(
                    "participant_index values must be dense starting at 0".to_string(),
                ));
            }
            expected += 1;
        }
        pairs
    } else {
        inputs
            .into_iter()
            .enumerate()
            .map(|(i, p)| (i as u32, p))
            .collect()
    };

    Ok(indexed
        .into_iter()
        .map(|(idx, p)| Participant {
            participant_id: p.participant_id,
            group_id: p.group_id,
            participant_index: idx,
            total_time_ms: p.total_time_ms,
            time_used_ms: 0,
            time_remaining_ms: p.total_time_ms,
            cycle_count: 0,
            is_active: false,
            has_expired: false,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_request() -> CreateSessionRequest {
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

    #[test]
    fn builds_pending_session_with_dense_indices() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let session = build_pending_session(sample_request(), now).unwrap();
        assert_eq!(session.status, Status::Pending);
        assert_eq!(session.version, 1);
        assert_eq!(session.participants[0].participant_index, 0);
        assert_eq!(session.participants[1].participant_index, 1);
        assert!(!session.participants[0].is_active);
    }

    #[test]
    fn rejects_duplicate_participant_ids() {
        let mut req = sample_request();
        let dup = req.participants[0].participant_id;
        req.participants[1].participant_id = dup;
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert!(build_pending_session(req, now).is_err());
    }

    #[test]
    fn rejects_total_time_out_of_range() {
        let mut req = sample_request();
        req.participants[0].total_time_ms = 10;
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert!(build_pending_session(req, now).is_err());
    }

    #[test]
    fn rejects_empty_participants() {
        let mut req = sample_request();
        req.participants.clear();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert!(build_pending_session(req, now).is_err());
    }

    #[test]
    fn status_transition_graph_matches_spec() {
        assert!(Status::Pending.can_transition_to(Status::Running));
        assert!(Status::Running.can_transition_to(Status::Paused));
        assert!(Status::Paused.can_transition_to(Status::Running));
        assert!(Status::Running.can_transition_to(Status::Expired));
        assert!(Status::Running.can_transition_to(Status::Completed));
        assert!(Status::Completed.can_transition_to(Status::Cancelled));
        assert!(!Status::Pending.can_transition_to(Status::Completed));
        assert!(!Status::Expired.can_transition_to(Status::Running));
    }
}
