//! Test-run events received from the device and the in-process bus that
//! fans them out to subscribers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::{mpsc, Mutex};

/// Named events a device may send. Every name is republished unchanged on
/// the [`EventBus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    DeviceLog,
    Disconnect,
    DeviceInfo,
    JasmineStarted,
    SpecStarted,
    SpecDone,
    SuiteStarted,
    SuiteDone,
    JasmineDone,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::DeviceLog,
        EventKind::Disconnect,
        EventKind::DeviceInfo,
        EventKind::JasmineStarted,
        EventKind::SpecStarted,
        EventKind::SpecDone,
        EventKind::SuiteStarted,
        EventKind::SuiteDone,
        EventKind::JasmineDone,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EventKind::DeviceLog => "deviceLog",
            EventKind::Disconnect => "disconnect",
            EventKind::DeviceInfo => "deviceInfo",
            EventKind::JasmineStarted => "jasmineStarted",
            EventKind::SpecStarted => "specStarted",
            EventKind::SpecDone => "specDone",
            EventKind::SuiteStarted => "suiteStarted",
            EventKind::SuiteDone => "suiteDone",
            EventKind::JasmineDone => "jasmineDone",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        EventKind::ALL.into_iter().find(|k| k.name() == name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Status of a finished spec as reported in a `specDone` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecStatus {
    Passed,
    Failed,
    Pending,
    Disabled,
    Other(String),
}

impl SpecStatus {
    pub fn parse(status: &str) -> Self {
        match status {
            "passed" => SpecStatus::Passed,
            "failed" => SpecStatus::Failed,
            "pending" => SpecStatus::Pending,
            "disabled" => SpecStatus::Disabled,
            other => SpecStatus::Other(other.to_string()),
        }
    }
}

/// One event with its opaque JSON payload.
#[derive(Debug, Clone, PartialEq)]
pub struct TestEvent {
    pub kind: EventKind,
    pub payload: Value,
}

impl TestEvent {
    pub fn new(kind: EventKind, payload: Value) -> Self {
        Self { kind, payload }
    }

    pub fn disconnect() -> Self {
        Self::new(EventKind::Disconnect, Value::Null)
    }

    /// `status` of a `specDone` payload. A missing status counts as executed.
    pub fn spec_status(&self) -> Option<SpecStatus> {
        if self.kind != EventKind::SpecDone {
            return None;
        }
        let status = self
            .payload
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Some(SpecStatus::parse(status))
    }
}

/// Frame sent by the device over the socket: `{"event": "...", "data": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl WireMessage {
    /// Unknown event names yield `None` and are dropped by the caller.
    pub fn into_event(self) -> Option<TestEvent> {
        EventKind::from_name(&self.event).map(|kind| TestEvent::new(kind, self.data))
    }
}

/// Receiving end of a bus subscription. Dropping it unsubscribes.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<TestEvent>,
}

impl Subscription {
    /// Next event, or `None` once the bus has been closed.
    pub async fn recv(&mut self) -> Option<TestEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<TestEvent> {
        self.rx.try_recv().ok()
    }
}

#[derive(Default)]
struct BusInner {
    subscribers: HashMap<EventKind, Vec<mpsc::UnboundedSender<TestEvent>>>,
    closed: bool,
}

/// Publish/subscribe keyed by event name.
#[derive(Default)]
pub struct EventBus {
    inner: Mutex<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to the given kinds. Events are queued until received.
    pub async fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().await;
        if !inner.closed {
            for kind in kinds {
                inner.subscribers.entry(*kind).or_default().push(tx.clone());
            }
        }
        Subscription { rx }
    }

    /// Deliver to every live subscriber of `event.kind`. Returns how many got
    /// it; a closed bus delivers nothing.
    pub async fn publish(&self, event: TestEvent) -> usize {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return 0;
        }
        let Some(subscribers) = inner.subscribers.get_mut(&event.kind) else {
            return 0;
        };
        subscribers.retain(|tx| !tx.is_closed());
        let mut delivered = 0;
        for tx in subscribers.iter() {
            if tx.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Drop all subscribers. Their `recv` returns `None` once drained.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        inner.subscribers.clear();
    }

    /// Drop all subscribers but keep accepting new ones.
    pub async fn clear(&self) {
        self.inner.lock().await.subscribers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_kind_names_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(EventKind::from_name("specFinished"), None);
    }

    #[test]
    fn test_wire_message_into_event() {
        let msg: WireMessage =
            serde_json::from_value(json!({"event": "specDone", "data": {"status": "failed"}}))
                .unwrap();
        let event = msg.into_event().unwrap();
        assert_eq!(event.kind, EventKind::SpecDone);
        assert_eq!(event.spec_status(), Some(SpecStatus::Failed));
    }

    #[test]
    fn test_wire_message_without_data() {
        let msg: WireMessage = serde_json::from_str(r#"{"event":"jasmineStarted"}"#).unwrap();
        let event = msg.into_event().unwrap();
        assert_eq!(event.payload, Value::Null);
    }

    #[test]
    fn test_spec_status_only_for_spec_done() {
        let event = TestEvent::new(EventKind::SuiteDone, json!({"status": "failed"}));
        assert_eq!(event.spec_status(), None);
    }

    #[tokio::test]
    async fn test_publish_reaches_only_matching_subscribers() {
        let bus = EventBus::new();
        let mut specs = bus.subscribe(&[EventKind::SpecDone]).await;
        let mut logs = bus.subscribe(&[EventKind::DeviceLog]).await;

        let delivered = bus
            .publish(TestEvent::new(EventKind::SpecDone, json!({"status": "passed"})))
            .await;
        assert_eq!(delivered, 1);
        assert_eq!(specs.try_recv().unwrap().kind, EventKind::SpecDone);
        assert!(logs.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let bus = EventBus::new();
        let sub = bus.subscribe(&[EventKind::JasmineDone]).await;
        drop(sub);
        let delivered = bus.publish(TestEvent::new(EventKind::JasmineDone, json!({}))).await;
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn test_publish_after_close_is_noop() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(&EventKind::ALL).await;
        bus.close().await;

        let delivered = bus.publish(TestEvent::disconnect()).await;
        assert_eq!(delivered, 0);
        assert!(sub.recv().await.is_none());

        // Subscribing after close yields an already-finished stream
        let mut late = bus.subscribe(&EventKind::ALL).await;
        assert!(late.recv().await.is_none());
    }
}
