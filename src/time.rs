// synckairos: NTP-style time endpoint (§4.5, §6).
//
// Clients compute remaining time from server-supplied anchors rather
// than counting down locally (§1); this is the anchor they poll.

use chrono::Utc;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ServerTime {
    pub timestamp_ms: i64,
}

pub fn now() -> ServerTime {
    ServerTime {
        timestamp_ms: Utc::now().timestamp_millis(),
    }
}
