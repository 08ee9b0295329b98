//! JUnit XML rendering of the specs a device reported, for CI systems that
//! read `<testsuites>` files.

use serde_json::Value;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::ParamedicError;
use crate::events::SpecStatus;

#[derive(Debug, Clone, PartialEq)]
pub enum CaseResult {
    Passed,
    Failed(Vec<String>),
    Skipped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestCase {
    pub name: String,
    pub classname: String,
    pub seconds: f64,
    pub result: CaseResult,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestSuite {
    pub name: String,
    pub cases: Vec<TestCase>,
}

impl TestSuite {
    fn count(&self, pick: fn(&CaseResult) -> bool) -> usize {
        self.cases.iter().filter(|c| pick(&c.result)).count()
    }

    fn seconds(&self) -> f64 {
        self.cases.iter().map(|c| c.seconds).sum()
    }
}

/// Groups `specDone` events under the innermost open suite. Specs reported
/// outside any suite land in a suite named after the platform.
#[derive(Debug, Clone)]
pub struct JunitReport {
    root: String,
    open: Vec<String>,
    suites: Vec<TestSuite>,
}

impl JunitReport {
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            open: Vec::new(),
            suites: Vec::new(),
        }
    }

    pub fn suites(&self) -> &[TestSuite] {
        &self.suites
    }

    pub fn suite_started(&mut self, payload: &Value) {
        let name = full_name(payload);
        self.open.push(if name.is_empty() { self.root.clone() } else { name });
    }

    pub fn suite_done(&mut self) {
        self.open.pop();
    }

    pub fn spec_done(&mut self, payload: &Value, status: &SpecStatus) {
        let suite = self.open.last().cloned().unwrap_or_else(|| self.root.clone());
        let description = payload
            .get("description")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| full_name(payload));
        let result = match status {
            SpecStatus::Failed => CaseResult::Failed(failure_messages(payload)),
            SpecStatus::Pending | SpecStatus::Disabled => CaseResult::Skipped,
            SpecStatus::Passed | SpecStatus::Other(_) => CaseResult::Passed,
        };
        let seconds = payload
            .get("duration")
            .and_then(Value::as_f64)
            .map(|ms| ms / 1000.0)
            .unwrap_or_default();

        let case = TestCase {
            name: description,
            classname: suite.clone(),
            seconds,
            result,
        };
        match self.suites.iter_mut().find(|s| s.name == suite) {
            Some(existing) => existing.cases.push(case),
            None => self.suites.push(TestSuite {
                name: suite,
                cases: vec![case],
            }),
        }
    }

    pub fn render(&self) -> String {
        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<testsuites>\n");
        for suite in &self.suites {
            let _ = writeln!(
                xml,
                "  <testsuite name=\"{}\" tests=\"{}\" failures=\"{}\" skipped=\"{}\" errors=\"0\" time=\"{:.3}\">",
                escape(&suite.name),
                suite.cases.len(),
                suite.count(|r| matches!(r, CaseResult::Failed(_))),
                suite.count(|r| matches!(r, CaseResult::Skipped)),
                suite.seconds(),
            );
            for case in &suite.cases {
                let _ = write!(
                    xml,
                    "    <testcase classname=\"{}\" name=\"{}\" time=\"{:.3}\"",
                    escape(&case.classname),
                    escape(&case.name),
                    case.seconds,
                );
                match &case.result {
                    CaseResult::Passed => xml.push_str(" />\n"),
                    CaseResult::Skipped => xml.push_str(">\n      <skipped />\n    </testcase>\n"),
                    CaseResult::Failed(messages) => {
                        xml.push_str(">\n");
                        let first = messages.first().map(String::as_str).unwrap_or("failed");
                        let _ = writeln!(
                            xml,
                            "      <failure type=\"expect\" message=\"{}\">{}</failure>",
                            escape(first),
                            escape(&messages.join("\n")),
                        );
                        xml.push_str("    </testcase>\n");
                    }
                }
            }
            xml.push_str("  </testsuite>\n");
        }
        xml.push_str("</testsuites>\n");
        xml
    }

    /// Write `<dir>/<root>_junit.xml`.
    pub fn write(&self, dir: &Path) -> Result<PathBuf, ParamedicError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}_junit.xml", self.root));
        std::fs::write(&path, self.render())?;
        info!("paramedic: junit report written to {}", path.display());
        Ok(path)
    }
}

fn full_name(payload: &Value) -> String {
    payload
        .get("fullName")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn failure_messages(payload: &Value) -> Vec<String> {
    payload
        .get("failedExpectations")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|e| e.get("message").and_then(Value::as_str))
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

pub fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            // Control characters are not allowed in XML 1.0
            c if c.is_control() && !matches!(c, '\n' | '\r' | '\t') => {}
            c => out.push(c),
        }
    }
    out
}
