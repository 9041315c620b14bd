// synckairos: Audit Queue (AQ) — §4.2.
//
// Durable job queue backed by an in-process channel; accepts
// fire-and-forget write requests, retries with exponential backoff, and
// escalates to an alert sink after attempts are exhausted. Writes to the
// relational audit database; never read on the hot path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tracing::{error, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::{SyncKairosError, SyncKairosResult};
use crate::model::Session;
use crate::retry::RetryConfig;

/// Closed set of event types, per §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SessionCreated,
    SessionStarted,
    CycleSwitched,
    SessionPaused,
    SessionResumed,
    ParticipantExpired,
    SessionCompleted,
    SessionCancelled,
}

impl EventType {
    fn as_str(self) -> &'static str {
        match self {
            EventType::SessionCreated => "session_created",
            EventType::SessionStarted => "session_started",
            EventType::CycleSwitched => "cycle_switched",
            EventType::SessionPaused => "session_paused",
            EventType::SessionResumed => "session_resumed",
            EventType::ParticipantExpired => "participant_expired",
            EventType::SessionCompleted => "session_completed",
            EventType::SessionCancelled => "session_cancelled",
        }
    }
}

#[derive(Debug, Clone)]
struct AuditJob {
    job_id: Uuid,
    session_id: Uuid,
    state: Session,
    event_type: EventType,
    attempt: u32,
}

/// Emitted when a job exhausts its attempts (§4.2 "Escalation").
#[derive(Debug, Clone, Serialize)]
pub struct EscalationReport {
    pub job_id: Uuid,
    pub session_id: Uuid,
    pub event_type: &'static str,
    pub attempt_count: u32,
    pub last_error: String,
}

/// Pluggable alert sink. The default implementation just logs; a real
/// deployment wires this to pager/Slack, which is an external-collaborator
/// concern outside this core.
pub trait AlertSink: Send + Sync {
    fn escalate(&self, report: EscalationReport);
}

pub struct LoggingAlertSink;

impl AlertSink for LoggingAlertSink {
    fn escalate(&self, report: EscalationReport) {
        error!(
            job_id = %report.job_id,
            session_id = %report.session_id,
            event_type = report.event_type,
            attempts = report.attempt_count,
            last_error = %report.last_error,
            "audit job exhausted retries"
        );
    }
}

#[async_trait::async_trait]
pub trait AuditWriter: Send + Sync {
    async fn write(&self, session_id: Uuid, state: &Session, event_type: EventType) -> SyncKairosResult<()>;
}

/// Postgres writer: upserts `sync_sessions`, inserts an immutable
/// `sync_events` row, in a single transaction (§4.2 "Worker").
pub struct PostgresAuditWriter {
    pool: PgPool,
}

impl PostgresAuditWriter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl AuditWriter for PostgresAuditWriter {
    async fn write(&self, session_id: Uuid, state: &Session, event_type: EventType) -> SyncKairosResult<()> {
        let mut tx = self.pool.begin().await?;

        let sync_mode = serde_json::to_string(&state.sync_mode)?;
        let final_status = serde_json::to_string(&state.status)?;
        let metadata = state.metadata.clone();

        sqlx::query(
            r#"
            INSERT INTO sync_sessions
                (session_id, sync_mode, created_at, started_at, completed_at,
                 final_status, total_participants, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (session_id) DO UPDATE SET
                final_status = $6,
                started_at = $4,
                completed_at = $5,
                total_participants = $7,
                metadata = $8
            "#,
        )
        .bind(session_id)
        .bind(sync_mode)
        .bind(state.created_at)
        .bind(state.session_started_at)
        .bind(state.session_completed_at)
        .bind(final_status)
        .bind(state.participants.len() as i32)
        .bind(metadata)
        .execute(&mut *tx)
        .await?;

        let active = state.active_participant_id.and_then(|id| state.participant_by_id(id));
        let snapshot = serde_json::to_value(state)?;

        sqlx::query(
            r#"
            INSERT INTO sync_events
                (session_id, event_type, timestamp, participant_id, time_remaining_ms, state_snapshot, metadata)
            VALUES ($1, $2, now(), $3, $4, $5, $6)
            "#,
        )
        .bind(session_id)
        .bind(event_type.as_str())
        .bind(active.map(|p| p.participant_id))
        .bind(active.map(|p| p.time_remaining_ms))
        .bind(snapshot)
        .bind(state.metadata.clone())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

/// Classifies a raw writer error as retryable or not, per §4.2's table:
/// transport/timeout/deadlock/pool-exhaustion retry; unique-key and
/// constraint violations are swallowed as "complete".
fn classify(err: &SyncKairosError) -> bool {
    match err {
        SyncKairosError::Internal(msg) => {
            let msg = msg.to_lowercase();
            !(msg.contains("unique") || msg.contains("foreign key") || msg.contains("check constraint"))
        }
        _ => true,
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct AuditMetrics {
    pub enqueued: u64,
    pub completed: u64,
    pub non_retryable_swallowed: u64,
    pub escalated: u64,
}

struct Counters {
    enqueued: AtomicU64,
    completed: AtomicU64,
    non_retryable_swallowed: AtomicU64,
    escalated: AtomicU64,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            enqueued: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            non_retryable_swallowed: AtomicU64::new(0),
            escalated: AtomicU64::new(0),
        }
    }
}

pub struct AuditQueue {
    tx: Option<mpsc::UnboundedSender<AuditJob>>,
    counters: Arc<Counters>,
}

impl AuditQueue {
    /// Spawns `worker_pool_size` workers draining an unbounded queue.
    pub fn new(writer: Arc<dyn AuditWriter>, alert_sink: Arc<dyn AlertSink>, retry: RetryConfig, worker_pool_size: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<AuditJob>();
        let counters = Arc::new(Counters::default());
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        for worker_id in 0..worker_pool_size.max(1) {
            let rx = rx.clone();
            let writer = writer.clone();
            let alert_sink = alert_sink.clone();
            let retry = retry.clone();
            let counters = counters.clone();
            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(job) = job else { break };
                    process_job(worker_id, job, &writer, &alert_sink, &retry, &counters).await;
                }
            });
        }

        Self {
            tx: Some(tx),
            counters,
        }
    }

    /// No-op queue for tests that don't exercise the audit DB: jobs are
    /// accepted and dropped without a worker pool.
    pub fn new_noop() -> Self {
        Self {
            tx: None,
            counters: Arc::new(Counters::default()),
        }
    }

    pub async fn enqueue(&self, session_id: Uuid, state: Session, event_type: EventType) {
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        let Some(tx) = &self.tx else { return };
        let job = AuditJob {
            job_id: Uuid::new_v4(),
            session_id,
            state,
            event_type,
            attempt: 0,
        };
        if tx.send(job).is_err() {
            warn!(session_id = %session_id, "audit queue closed, dropping job");
        }
    }

    pub fn metrics(&self) -> AuditMetrics {
        AuditMetrics {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            non_retryable_swallowed: self.counters.non_retryable_swallowed.load(Ordering::Relaxed),
            escalated: self.counters.escalated.load(Ordering::Relaxed),
        }
    }

    pub async fn close(&mut self) {
        self.tx = None;
    }
}

async fn process_job(
    worker_id: usize,
    mut job: AuditJob,
    writer: &Arc<dyn AuditWriter>,
    alert_sink: &Arc<dyn AlertSink>,
    retry: &RetryConfig,
    counters: &Arc<Counters>,
) {
    let span = info_span!("audit_job", worker_id, job_id = %job.job_id, session_id = %job.session_id, event_type = job.event_type.as_str());
    async {
        let mut delay_ms = retry.initial_delay_ms;
        loop {
            job.attempt += 1;
            match writer.write(job.session_id, &job.state, job.event_type).await {
                Ok(()) => {
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(e) if !classify(&e) => {
                    // Non-retryable: logic bug or replay of a known event.
                    warn!(error = %e, "audit job non-retryable, marking complete");
                    counters.non_retryable_swallowed.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(e) => {
                    if job.attempt >= retry.max_attempts {
                        let report = EscalationReport {
                            job_id: job.job_id,
                            session_id: job.session_id,
                            event_type: job.event_type.as_str(),
                            attempt_count: job.attempt,
                            last_error: e.to_string(),
                        };
                        counters.escalated.fetch_add(1, Ordering::Relaxed);
                        alert_sink.escalate(report);
                        return;
                    }
                    tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    delay_ms = ((delay_ms as f64) * retry.multiplier) as u64;
                    delay_ms = delay_ms.min(retry.max_delay_ms);
                }
            }
        }
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct CountingWriter {
        calls: AtomicUsize,
        fail_times: usize,
        non_retryable: bool,
    }

    #[async_trait::async_trait]
    impl AuditWriter for CountingWriter {
        async fn write(&self, _session_id: Uuid, _state: &Session, _event_type: EventType) -> SyncKairosResult<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                if self.non_retryable {
                    return Err(SyncKairosError::Internal("unique constraint violated".into()));
                }
                return Err(SyncKairosError::Internal("connection refused".into()));
            }
            Ok(())
        }
    }

    struct CapturingAlertSink {
        reports: Mutex<Vec<EscalationReport>>,
    }

    impl AlertSink for CapturingAlertSink {
        fn escalate(&self, report: EscalationReport) {
            self.reports.lock().unwrap().push(report);
        }
    }

    fn sample_session() -> Session {
        use crate::model::{build_pending_session, CreateSessionRequest, ParticipantInput, SyncMode};
        let req = CreateSessionRequest {
            session_id: Uuid::new_v4(),
            sync_mode: SyncMode::PerParticipant,
            participants: vec![ParticipantInput {
                participant_id: Uuid::new_v4(),
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
    async fn retries_then_succeeds_and_counts_completed() {
        let writer: Arc<dyn AuditWriter> = Arc::new(CountingWriter {
            calls: AtomicUsize::new(0),
            fail_times: 2,
            non_retryable: false,
        });
        let sink: Arc<dyn AlertSink> = Arc::new(LoggingAlertSink);
        let retry = RetryConfig {
            max_attempts: 5,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            multiplier: 2.0,
        };
        let queue = AuditQueue::new(writer, sink, retry, 1);
        queue.enqueue(Uuid::new_v4(), sample_session(), EventType::SessionCreated).await;

        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        assert_eq!(queue.metrics().completed, 1);
    }

    #[tokio::test]
    async fn non_retryable_error_is_swallowed_as_complete() {
        let writer: Arc<dyn AuditWriter> = Arc::new(CountingWriter {
            calls: AtomicUsize::new(0),
            fail_times: 1,
            non_retryable: true,
        });
        let sink: Arc<dyn AlertSink> = Arc::new(LoggingAlertSink);
        let retry = RetryConfig {
            max_attempts: 5,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            multiplier: 2.0,
        };
        let queue = AuditQueue::new(writer, sink, retry, 1);
        queue.enqueue(Uuid::new_v4(), sample_session(), EventType::SessionCreated).await;

        tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        let metrics = queue.metrics();
        assert_eq!(metrics.non_retryable_swallowed, 1);
        assert_eq!(metrics.completed, 0);
    }

    #[tokio::test]
    async fn exhausted_attempts_escalate() {
        let writer: Arc<dyn AuditWriter> = Arc::new(CountingWriter {
            calls: AtomicUsize::new(0),
            fail_times: 100,
            non_retryable: false,
        });
        let sink = Arc::new(CapturingAlertSink {
            reports: Mutex::new(Vec::new()),
        });
        let retry = RetryConfig {
            max_attempts: 2,
            initial_delay_ms: 1,
            max_delay_ms: 1,
            multiplier: 1.0,
        };
        let queue = AuditQueue::new(writer, sink.clone(), retry, 1);
        queue.enqueue(Uuid::new_v4(), sample_session(), EventType::SessionCreated).await;

        tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        assert_eq!(queue.metrics().escalated, 1);
        assert_eq!(sink.reports.lock().unwrap().len(), 1);
    }
}
