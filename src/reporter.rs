use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Platform;
use crate::error::ParamedicError;
use crate::events::{EventKind, SpecStatus, Subscription, TestEvent};
use crate::junit::JunitReport;
use crate::session::RunStats;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedSpec {
    pub full_name: String,
    pub messages: Vec<String>,
}

/// What the reporter saw during one target's run. Written out as
/// `<platform>_results.json`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSummary {
    pub platform: String,
    pub completed: bool,
    pub passed: bool,
    pub specs_executed: u32,
    pub specs_failed: u32,
    pub failures: Vec<FailedSpec>,
    pub device: Option<Value>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Logs the device's progress as it reports it, and keeps the JUnit view of
/// the same specs.
pub struct ConsoleReporter {
    summary: ReportSummary,
    junit: JunitReport,
}

impl ConsoleReporter {
    pub fn new(platform: Platform) -> Self {
        Self {
            summary: ReportSummary {
                platform: platform.id().to_string(),
                ..ReportSummary::default()
            },
            junit: JunitReport::new(platform.id()),
        }
    }

    pub fn summary(&self) -> &ReportSummary {
        &self.summary
    }

    pub fn junit(&self) -> &JunitReport {
        &self.junit
    }

    pub fn into_summary(self) -> ReportSummary {
        self.summary
    }

    pub fn handle(&mut self, event: &TestEvent) {
        let payload = &event.payload;
        match event.kind {
            EventKind::DeviceLog => {
                let kind = payload.get("type").and_then(Value::as_str).unwrap_or("log");
                debug!("device {}: {}", kind, join_message(payload.get("msg")));
            }
            EventKind::DeviceInfo => {
                info!("paramedic: device info {}", payload);
                self.summary.device = Some(payload.clone());
            }
            EventKind::JasmineStarted => match payload.get("totalSpecsDefined").and_then(Value::as_u64) {
                Some(total) => info!("paramedic: running {} specs", total),
                None => info!("paramedic: tests started"),
            },
            EventKind::SuiteStarted => {
                info!("{}", text(payload, "description"));
                self.junit.suite_started(payload);
            }
            EventKind::SuiteDone => {
                debug!("{} {}", event.kind, text(payload, "fullName"));
                self.junit.suite_done();
            }
            EventKind::SpecStarted => debug!("{} {}", event.kind, text(payload, "fullName")),
            EventKind::SpecDone => self.spec_done(event),
            EventKind::JasmineDone => {
                let stats = RunStats::from_spec_results(payload).unwrap_or_default();
                self.summary.completed = true;
                self.summary.passed = stats.passed();
                self.summary.specs_executed = stats.specs_executed;
                self.summary.specs_failed = stats.specs_failed;
                self.summary.finished_at = Some(Utc::now());
                if let Some(cordova) = payload.get("cordova") {
                    self.summary.device.get_or_insert_with(|| cordova.clone());
                }
                info!(
                    "paramedic: {} specs executed, {} failed",
                    stats.specs_executed, stats.specs_failed
                );
            }
            EventKind::Disconnect => warn!("paramedic: device disconnected"),
        }
    }

    fn spec_done(&mut self, event: &TestEvent) {
        let name = text(&event.payload, "fullName");
        let status = event.spec_status();
        if let Some(status) = &status {
            self.junit.spec_done(&event.payload, status);
        }
        match status {
            Some(SpecStatus::Passed) => info!("  passed: {}", name),
            Some(SpecStatus::Failed) => {
                let messages: Vec<String> = event
                    .payload
                    .get("failedExpectations")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|e| e.get("message").and_then(Value::as_str))
                            .map(String::from)
                            .collect()
                    })
                    .unwrap_or_default();
                warn!("  FAILED: {}", name);
                for message in &messages {
                    warn!("    {}", message);
                }
                self.summary.failures.push(FailedSpec {
                    full_name: name.to_string(),
                    messages,
                });
            }
            Some(SpecStatus::Pending) => info!("  pending: {}", name),
            Some(SpecStatus::Disabled) => debug!("  disabled: {}", name),
            Some(SpecStatus::Other(status)) => info!("  {}: {}", status, name),
            None => {}
        }
    }

    /// Write the summary to `<dir>/<platform>_results.json` and the specs to
    /// `<dir>/<platform>_junit.xml`.
    pub fn write_results(&self, dir: &Path) -> Result<PathBuf, ParamedicError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}_results.json", self.summary.platform));
        std::fs::write(&path, serde_json::to_string_pretty(&self.summary)?)?;
        info!("paramedic: results written to {}", path.display());
        self.junit.write(dir)?;
        Ok(path)
    }
}

/// Log every event on `events` until the server closes the bus. Results are
/// written to `output_dir` when the run completes.
pub fn spawn_console_reporter(
    mut events: Subscription,
    platform: Platform,
    output_dir: Option<PathBuf>,
) -> JoinHandle<ReportSummary> {
    tokio::spawn(async move {
        let mut reporter = ConsoleReporter::new(platform);
        while let Some(event) = events.recv().await {
            reporter.handle(&event);
            if event.kind == EventKind::JasmineDone {
                if let Some(dir) = &output_dir {
                    if let Err(e) = reporter.write_results(dir) {
                        warn!("paramedic: cannot write results: {}", e);
                    }
                }
            }
        }
        reporter.into_summary()
    })
}

fn text<'a>(payload: &'a Value, key: &str) -> &'a str {
    payload.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn join_message(msg: Option<&Value>) -> String {
    match msg {
        Some(Value::Array(parts)) => parts
            .iter()
            .map(|p| match p {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" "),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use serde_json::json;

    fn failed_spec() -> TestEvent {
        TestEvent::new(
            EventKind::SpecDone,
            json!({
                "fullName": "Battery fires batterystatus",
                "status": "failed",
                "failedExpectations": [{"message": "Expected false to be true."}]
            }),
        )
    }

    #[test]
    fn test_join_message() {
        assert_eq!(join_message(Some(&json!(["count", 3, true]))), "count 3 true");
        assert_eq!(join_message(None), "");
    }

    #[test]
    fn test_reporter_collects_failures() {
        let mut reporter = ConsoleReporter::new(Platform::Android);
        reporter.handle(&TestEvent::new(EventKind::SpecDone, json!({"fullName": "a", "status": "passed"})));
        reporter.handle(&failed_spec());
        reporter.handle(&TestEvent::new(
            EventKind::JasmineDone,
            json!({"specResults": {"specExecuted": 2, "specFailed": 1}, "cordova": {"platform": "android"}}),
        ));

        let summary = reporter.summary();
        assert!(summary.completed);
        assert!(!summary.passed);
        assert_eq!(summary.specs_executed, 2);
        assert_eq!(
            summary.failures,
            vec![FailedSpec {
                full_name: "Battery fires batterystatus".to_string(),
                messages: vec!["Expected false to be true.".to_string()],
            }]
        );
        assert_eq!(summary.device, Some(json!({"platform": "android"})));
    }

    #[test]
    fn test_write_results() {
        let dir = tempfile::tempdir().unwrap();
        let mut reporter = ConsoleReporter::new(Platform::Ios);
        reporter.handle(&failed_spec());

        let path = reporter.write_results(dir.path()).unwrap();
        assert!(path.ends_with("ios_results.json"));
        let written: Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(written["platform"], "ios");
        assert_eq!(written["failures"][0]["fullName"], "Battery fires batterystatus");

        let junit = std::fs::read_to_string(dir.path().join("ios_junit.xml")).unwrap();
        assert!(junit.contains("failures=\"1\""));
        assert!(junit.contains("Expected false to be true."));
    }

    #[test]
    fn test_reporter_feeds_junit_suites() {
        let mut reporter = ConsoleReporter::new(Platform::Android);
        reporter.handle(&TestEvent::new(
            EventKind::SuiteStarted,
            json!({"description": "Battery", "fullName": "Battery"}),
        ));
        reporter.handle(&TestEvent::new(
            EventKind::SpecDone,
            json!({"description": "exists", "fullName": "Battery exists", "status": "passed"}),
        ));
        reporter.handle(&failed_spec());
        reporter.handle(&TestEvent::new(EventKind::SuiteDone, json!({"fullName": "Battery"})));

        let suites = reporter.junit().suites();
        assert_eq!(suites.len(), 1);
        assert_eq!(suites[0].name, "Battery");
        assert_eq!(suites[0].cases.len(), 2);
    }

    #[tokio::test]
    async fn test_spawned_reporter_ends_when_bus_closes() {
        let bus = EventBus::new();
        let dir = tempfile::tempdir().unwrap();
        let handle = spawn_console_reporter(
            bus.subscribe(&EventKind::ALL).await,
            Platform::Browser,
            Some(dir.path().to_path_buf()),
        );

        bus.publish(failed_spec()).await;
        bus.publish(TestEvent::new(
            EventKind::JasmineDone,
            json!({"specResults": {"specExecuted": 1, "specFailed": 1}}),
        ))
        .await;
        bus.close().await;

        let summary = handle.await.unwrap();
        assert_eq!(summary.failures.len(), 1);
        assert!(dir.path().join("browser_results.json").is_file());
        assert!(dir.path().join("browser_junit.xml").is_file());
    }
}
