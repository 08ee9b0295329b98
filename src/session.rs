//! Per-run collection state: the single device connection, spec statistics
//! and completion flag.
//!
//! A second connection replaces the first. The old connection is told to
//! close and everything it sends afterwards, including its disconnect, is
//! discarded, so two devices can never interleave into one set of results.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{oneshot, watch, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::{EventBus, EventKind, SpecStatus, Subscription, TestEvent};

pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStats {
    pub specs_executed: u32,
    pub specs_failed: u32,
}

impl RunStats {
    pub fn record(&mut self, status: &SpecStatus) {
        if *status != SpecStatus::Disabled {
            self.specs_executed += 1;
        }
        if *status == SpecStatus::Failed {
            self.specs_failed += 1;
        }
    }

    pub fn passed(&self) -> bool {
        self.specs_failed == 0
    }

    /// Reads the `specResults` block injected into `jasmineDone` payloads.
    pub fn from_spec_results(payload: &Value) -> Option<Self> {
        let results = payload.get("specResults")?;
        Some(Self {
            specs_executed: u32::try_from(results.get("specExecuted")?.as_u64()?).ok()?,
            specs_failed: u32::try_from(results.get("specFailed")?.as_u64()?).ok()?,
        })
    }
}

/// The live device connection owned by the session.
pub struct DeviceConnection {
    pub id: ConnectionId,
    pub created_at: DateTime<Utc>,
    close_tx: Option<oneshot::Sender<()>>,
}

impl DeviceConnection {
    fn close(mut self) {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Given to the transport when a connection is attached. `closed` fires when
/// the session drops the connection (replaced, reset or shut down).
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub closed: oneshot::Receiver<()>,
}

pub struct SessionState {
    pub session_id: Uuid,
    pub stats: RunStats,
    pub completed: bool,
    pub shut_down: bool,
    connection: Option<DeviceConnection>,
    next_connection_id: ConnectionId,
    connections_accepted: u64,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            session_id: Uuid::new_v4(),
            stats: RunStats::default(),
            completed: false,
            shut_down: false,
            connection: None,
            next_connection_id: 1,
            connections_accepted: 0,
        }
    }

    pub fn is_current(&self, id: ConnectionId) -> bool {
        self.connection.as_ref().is_some_and(|c| c.id == id)
    }

    pub fn connected_since(&self) -> Option<DateTime<Utc>> {
        self.connection.as_ref().map(|c| c.created_at)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub connected: bool,
    pub connected_since: Option<DateTime<Utc>>,
    pub specs_executed: u32,
    pub specs_failed: u32,
    pub completed: bool,
}

pub struct Session {
    state: RwLock<SessionState>,
    bus: EventBus,
    accepted_tx: watch::Sender<u64>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        let (accepted_tx, _) = watch::channel(0);
        Self {
            state: RwLock::new(SessionState::new()),
            bus: EventBus::new(),
            accepted_tx,
        }
    }

    /// Register a new device connection, replacing any current one.
    /// Returns `None` once the session has been shut down.
    pub async fn attach(&self) -> Option<ConnectionHandle> {
        let mut state = self.state.write().await;
        if state.shut_down {
            return None;
        }

        let id = state.next_connection_id;
        state.next_connection_id += 1;

        if let Some(old) = state.connection.take() {
            warn!(
                "local-server: device connection {} replaced by {}, closing the old one",
                old.id, id
            );
            old.close();
        }

        let (close_tx, closed) = oneshot::channel();
        state.connection = Some(DeviceConnection {
            id,
            created_at: Utc::now(),
            close_tx: Some(close_tx),
        });
        state.connections_accepted += 1;
        let accepted = state.connections_accepted;
        drop(state);

        self.accepted_tx.send_replace(accepted);
        info!("local-server: new device connection {}", id);
        Some(ConnectionHandle { id, closed })
    }

    /// Apply and republish one event from connection `id`. Statistics are
    /// updated before subscribers see the event. Returns false if the event
    /// was dropped (stale connection or session shut down).
    pub async fn dispatch(&self, id: ConnectionId, event: TestEvent) -> bool {
        if event.kind == EventKind::Disconnect {
            return self.detach(id).await;
        }

        let mut state = self.state.write().await;
        if state.shut_down {
            return false;
        }
        if !state.is_current(id) {
            debug!(
                "local-server: dropping {} from abandoned connection {}",
                event.kind, id
            );
            return false;
        }

        let mut event = event;
        match event.kind {
            EventKind::SpecDone => {
                if let Some(status) = event.spec_status() {
                    state.stats.record(&status);
                }
            }
            EventKind::JasmineDone => {
                state.completed = true;
                inject_spec_results(&mut event.payload, state.stats);
            }
            _ => {}
        }

        // Still holding the state lock so a concurrent reset cannot slip in
        // between the statistics update and the fan-out.
        self.bus.publish(event).await;
        true
    }

    /// Remove connection `id` and publish `disconnect`, unless it has already
    /// been replaced.
    pub async fn detach(&self, id: ConnectionId) -> bool {
        let mut state = self.state.write().await;
        if !state.is_current(id) {
            debug!("local-server: ignoring disconnect of abandoned connection {}", id);
            return false;
        }
        if let Some(conn) = state.connection.take() {
            conn.close();
        }
        info!("local-server: device connection {} closed", id);
        if !state.shut_down {
            self.bus.publish(TestEvent::disconnect()).await;
        }
        true
    }

    pub async fn is_device_connected(&self) -> bool {
        self.state.read().await.connection.is_some()
    }

    pub async fn stats(&self) -> RunStats {
        self.state.read().await.stats
    }

    pub async fn is_completed(&self) -> bool {
        self.state.read().await.completed
    }

    pub async fn session_id(&self) -> Uuid {
        self.state.read().await.session_id
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, crate::error::ParamedicError> {
        let state = self.state.read().await;
        if state.shut_down {
            return Err(crate::error::ParamedicError::SessionClosed);
        }
        Ok(SessionSnapshot {
            session_id: state.session_id,
            connected: state.connection.is_some(),
            connected_since: state.connected_since(),
            specs_executed: state.stats.specs_executed,
            specs_failed: state.stats.specs_failed,
            completed: state.completed,
        })
    }

    /// Subscribe to events on the session's bus.
    pub async fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        self.bus.subscribe(kinds).await
    }

    /// Count of connections accepted since the last reset.
    pub fn connections(&self) -> watch::Receiver<u64> {
        self.accepted_tx.subscribe()
    }

    /// Forget the connection, statistics and subscribers and start over with
    /// a fresh session id.
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        if let Some(conn) = state.connection.take() {
            conn.close();
        }
        let shut_down = state.shut_down;
        let next_connection_id = state.next_connection_id;
        *state = SessionState {
            shut_down,
            next_connection_id,
            ..SessionState::new()
        };
        self.bus.clear().await;
        self.accepted_tx.send_replace(0);
        debug!("local-server: session reset to {}", state.session_id);
    }

    /// Close the connection and the bus. Later events are ignored.
    pub async fn shutdown(&self) {
        let mut state = self.state.write().await;
        state.shut_down = true;
        if let Some(conn) = state.connection.take() {
            conn.close();
        }
        self.bus.close().await;
    }
}

fn inject_spec_results(payload: &mut Value, stats: RunStats) {
    let results = json!({
        "specExecuted": stats.specs_executed,
        "specFailed": stats.specs_failed,
    });
    match payload {
        Value::Object(map) => {
            map.insert("specResults".to_string(), results);
        }
        _ => *payload = json!({ "specResults": results }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_done(status: &str) -> TestEvent {
        TestEvent::new(EventKind::SpecDone, json!({ "status": status }))
    }

    #[test]
    fn test_run_stats_record() {
        let mut stats = RunStats::default();
        for status in ["passed", "failed", "pending", "disabled", "failed", "disabled"] {
            stats.record(&SpecStatus::parse(status));
        }
        assert_eq!(stats.specs_executed, 4);
        assert_eq!(stats.specs_failed, 2);
        assert!(!stats.passed());
    }

    #[test]
    fn test_run_stats_from_spec_results() {
        let payload = json!({"specResults": {"specExecuted": 3, "specFailed": 0}});
        assert_eq!(
            RunStats::from_spec_results(&payload),
            Some(RunStats { specs_executed: 3, specs_failed: 0 })
        );
        assert_eq!(RunStats::from_spec_results(&json!({})), None);
    }

    #[tokio::test]
    async fn test_stats_follow_spec_done_statuses() {
        let session = Session::new();
        let conn = session.attach().await.unwrap();
        let statuses = ["passed", "failed", "pending", "disabled", "passed", "failed", "disabled"];
        for status in statuses {
            assert!(session.dispatch(conn.id, spec_done(status)).await);
        }

        let stats = session.stats().await;
        let executed = statuses.iter().filter(|s| **s != "disabled").count() as u32;
        let failed = statuses.iter().filter(|s| **s == "failed").count() as u32;
        assert_eq!(stats.specs_executed, executed);
        assert_eq!(stats.specs_failed, failed);
        assert!(stats.specs_failed <= stats.specs_executed);
    }

    #[tokio::test]
    async fn test_stats_counted_once_regardless_of_subscribers() {
        let session = Session::new();
        let _a = session.subscribe(&[EventKind::SpecDone]).await;
        let _b = session.subscribe(&[EventKind::SpecDone]).await;
        let _c = session.subscribe(&EventKind::ALL).await;
        let conn = session.attach().await.unwrap();

        session.dispatch(conn.id, spec_done("failed")).await;
        assert_eq!(
            session.stats().await,
            RunStats { specs_executed: 1, specs_failed: 1 }
        );
    }

    #[tokio::test]
    async fn test_jasmine_done_carries_spec_results() {
        let session = Session::new();
        let mut sub = session.subscribe(&[EventKind::JasmineDone]).await;
        let conn = session.attach().await.unwrap();

        session.dispatch(conn.id, spec_done("passed")).await;
        session.dispatch(conn.id, spec_done("failed")).await;
        session
            .dispatch(conn.id, TestEvent::new(EventKind::JasmineDone, json!({"cordova": {"platform": "Android"}})))
            .await;

        let event = sub.recv().await.unwrap();
        assert_eq!(event.payload["cordova"]["platform"], "Android");
        assert_eq!(
            RunStats::from_spec_results(&event.payload),
            Some(RunStats { specs_executed: 2, specs_failed: 1 })
        );
        assert!(session.is_completed().await);
    }

    #[tokio::test]
    async fn test_events_are_republished_unmodified() {
        let session = Session::new();
        let mut sub = session.subscribe(&[EventKind::DeviceLog]).await;
        let conn = session.attach().await.unwrap();
        let payload = json!({"type": "log", "msg": ["hello", 42]});

        session
            .dispatch(conn.id, TestEvent::new(EventKind::DeviceLog, payload.clone()))
            .await;
        assert_eq!(sub.recv().await.unwrap().payload, payload);
    }

    #[tokio::test]
    async fn test_connected_reflects_latest_connection() {
        let session = Session::new();
        assert!(!session.is_device_connected().await);

        let first = session.attach().await.unwrap();
        assert!(session.is_device_connected().await);
        assert!(session.detach(first.id).await);
        assert!(!session.is_device_connected().await);

        let second = session.attach().await.unwrap();
        assert!(session.is_device_connected().await);
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_second_connection_replaces_first() {
        let session = Session::new();
        let mut disconnects = session.subscribe(&[EventKind::Disconnect]).await;

        let first = session.attach().await.unwrap();
        let second = session.attach().await.unwrap();

        // The old transport is told to close
        assert!(first.closed.await.is_ok());

        // Late traffic from the old connection is discarded
        assert!(!session.dispatch(first.id, spec_done("failed")).await);
        assert!(!session.detach(first.id).await);
        assert!(disconnects.try_recv().is_none());
        assert!(session.is_device_connected().await);
        assert_eq!(session.stats().await, RunStats::default());

        assert!(session.detach(second.id).await);
        assert!(!session.is_device_connected().await);
        assert_eq!(disconnects.try_recv().unwrap().kind, EventKind::Disconnect);
    }

    #[tokio::test]
    async fn test_device_sent_disconnect_detaches() {
        let session = Session::new();
        let conn = session.attach().await.unwrap();
        assert!(session.dispatch(conn.id, TestEvent::disconnect()).await);
        assert!(!session.is_device_connected().await);
    }

    #[tokio::test]
    async fn test_connections_counter() {
        let session = Session::new();
        let rx = session.connections();
        assert_eq!(*rx.borrow(), 0);
        let conn = session.attach().await.unwrap();
        session.detach(conn.id).await;
        // Still counts: the device did connect at some point
        assert_eq!(*rx.borrow(), 1);
    }

    #[tokio::test]
    async fn test_reset_clears_everything() {
        let session = Session::new();
        let before = session.session_id().await;
        let conn = session.attach().await.unwrap();
        session.dispatch(conn.id, spec_done("failed")).await;
        session
            .dispatch(conn.id, TestEvent::new(EventKind::JasmineDone, json!({})))
            .await;

        session.reset().await;

        assert_ne!(session.session_id().await, before);
        assert!(!session.is_device_connected().await);
        assert!(!session.is_completed().await);
        assert_eq!(session.stats().await, RunStats::default());
        assert_eq!(*session.connections().borrow(), 0);
        assert!(!session.dispatch(conn.id, spec_done("failed")).await);
    }

    #[tokio::test]
    async fn test_events_after_shutdown_are_noops() {
        let session = Session::new();
        let conn = session.attach().await.unwrap();
        session.shutdown().await;

        assert!(!session.dispatch(conn.id, spec_done("failed")).await);
        assert!(!session.detach(conn.id).await);
        assert!(session.attach().await.is_none());
        assert!(session.snapshot().await.is_err());
    }
}
