//! Activity logging sink
//!
//! Fire-and-forget structured events for the dashboard. A failed or slow
//! sink never affects the session that produced the event.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::store::HostId;

/// Activity event categories the core emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Terminal,
    Tunnel,
    FileManager,
    Docker,
    OpksshAuthentication,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    pub user_id: String,
    pub host_id: HostId,
    pub host_name: String,
}

/// Fire-and-forget activity sink
pub trait ActivityLog: Send + Sync {
    /// Must not block the caller; implementations spawn their own I/O.
    fn log(&self, event: ActivityEvent);
}

pub type SharedActivityLog = Arc<dyn ActivityLog>;

/// Sink that drops everything (activity logging disabled)
pub struct NoopActivityLog;

impl ActivityLog for NoopActivityLog {
    fn log(&self, event: ActivityEvent) {
        debug!(kind = ?event.kind, "Activity logging disabled, dropping event");
    }
}

/// POSTs events to the internal activity endpoint with a bearer token
pub struct HttpActivityLog {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpActivityLog {
    pub fn new(url: String, token: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self { client, url, token }
    }
}

impl ActivityLog for HttpActivityLog {
    fn log(&self, event: ActivityEvent) {
        let client = self.client.clone();
        let url = self.url.clone();
        let token = self.token.clone();

        tokio::spawn(async move {
            let mut req = client.post(&url).json(&event);
            if let Some(t) = token {
                req = req.bearer_auth(t);
            }
            match req.send().await {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => {
                    warn!(status = %resp.status(), "Activity sink rejected event");
                }
                Err(e) => {
                    warn!("Activity sink unreachable: {}", e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_wire_shape() {
        let ev = ActivityEvent {
            kind: ActivityKind::FileManager,
            user_id: "alice".into(),
            host_id: 42,
            host_name: "prod-1".into(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "file_manager");
        assert_eq!(json["userId"], "alice");
        assert_eq!(json["hostId"], 42);
        assert_eq!(json["hostName"], "prod-1");
    }
}
