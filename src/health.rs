// synckairos: Health check endpoints (§6).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Degraded,
}

/// Component health
#[derive(Debug, Clone)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,
    pub last_check: Instant,
}

impl ComponentHealth {
    pub fn new(name: String) -> Self {
        Self {
            name,
            status: HealthStatus::Healthy,
            message: "OK".to_string(),
            last_check: Instant::now(),
        }
    }

    pub fn update(&mut self, status: HealthStatus, message: String) {
        self.status = status;
        self.message = message;
        self.last_check = Instant::now();
    }
}

/// Response body for `/health` (§6: `{status, store, audit_db}`).
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub store: &'static str,
    pub audit_db: &'static str,
}

/// Response body for `/ready` (§6: store reachable + worker running).
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub message: String,
}

/// Tracks the liveness of the two external dependencies the health
/// surface reports on: the state store and the audit database. The
/// worker pool's liveness is reported by the audit queue itself.
pub struct HealthChecker {
    components: Arc<Mutex<HashMap<String, ComponentHealth>>>,
    worker_running: std::sync::atomic::AtomicBool,
}

impl HealthChecker {
    pub fn new() -> Self {
        let components = Arc::new(Mutex::new(HashMap::new()));
        {
            let mut map = components.lock().unwrap();
            map.insert("store".to_string(), ComponentHealth::new("store".to_string()));
            map.insert("audit_db".to_string(), ComponentHealth::new("audit_db".to_string()));
        }
        Self {
            components,
            worker_running: std::sync::atomic::AtomicBool::new(true),
        }
    }

    pub fn update_component(&self, name: &str, status: HealthStatus, message: String) {
        let mut components = self.components.lock().unwrap();
        if let Some(component) = components.get_mut(name) {
            component.update(status, message);
        }
    }

    pub fn set_worker_running(&self, running: bool) {
        self.worker_running.store(running, std::sync::atomic::Ordering::Relaxed);
    }

    fn component_status(&self, name: &str) -> HealthStatus {
        self.components
            .lock()
            .unwrap()
            .get(name)
            .map(|c| c.status)
            .unwrap_or(HealthStatus::Healthy)
    }

    /// `/health`: 200 with both components up in <1s; else 503.
    pub fn health(&self) -> (bool, HealthResponse) {
        let store_ok = self.component_status("store") != HealthStatus::Unhealthy;
        let audit_ok = self.component_status("audit_db") != HealthStatus::Unhealthy;
        let response = HealthResponse {
            status: if store_ok && audit_ok { "ok" } else { "degraded" },
            store: if store_ok { "up" } else { "down" },
            audit_db: if audit_ok { "up" } else { "down" },
        };
        (store_ok && audit_ok, response)
    }

    /// `/ready`: store reachable and worker running.
    pub fn ready(&self) -> (bool, ReadyResponse) {
        let store_ok = self.component_status("store") != HealthStatus::Unhealthy;
        let worker_ok = self.worker_running.load(std::sync::atomic::Ordering::Relaxed);
        let ready = store_ok && worker_ok;
        let message = if ready {
            "ready".to_string()
        } else if !store_ok {
            "store unreachable".to_string()
        } else {
            "audit worker not running".to_string()
        };
        (ready, ReadyResponse { ready, message })
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_by_default() {
        let checker = HealthChecker::new();
        let (ok, body) = checker.health();
        assert!(ok);
        assert_eq!(body.status, "ok");
    }

    #[test]
    fn store_down_fails_health_and_ready() {
        let checker = HealthChecker::new();
        checker.update_component("store", HealthStatus::Unhealthy, "connection refused".to_string());
        let (ok, _) = checker.health();
        assert!(!ok);
        let (ready, _) = checker.ready();
        assert!(!ready);
    }

    #[test]
    fn worker_stopped_fails_ready_but_not_health() {
        let checker = HealthChecker::new();
        checker.set_worker_running(false);
        let (health_ok, _) = checker.health();
        assert!(health_ok);
        let (ready, _) = checker.ready();
        assert!(!ready);
    }
}
