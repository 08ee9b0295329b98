//! Runs every configured target in turn and folds the outcomes into a process
//! exit code.

use tokio::sync::watch;
use tracing::{error, info};

use crate::config::{RunConfig, Target};
use crate::error::{ErrorKind, ParamedicError};
use crate::process::port::PortProbe;
use crate::runner::{TargetOutcome, TargetRunner};
use crate::toolchain::Toolchain;

pub const EXIT_PASSED: u8 = 0;
pub const EXIT_TESTS_FAILED: u8 = 1;
pub const EXIT_NON_TEST_FAILURE: u8 = 2;

#[derive(Debug)]
pub struct TargetReport {
    pub target: Target,
    pub result: Result<TargetOutcome, ParamedicError>,
}

#[derive(Debug, Default)]
pub struct RunReport {
    /// Set when the toolchain was unusable and no target ran.
    pub environment_error: Option<ParamedicError>,
    pub targets: Vec<TargetReport>,
}

impl RunReport {
    /// 2 if anything other than a test failed, else 1 if any test failed,
    /// else 0.
    pub fn exit_code(&self) -> u8 {
        if self.environment_error.is_some() || self.targets.iter().any(|t| t.result.is_err()) {
            return EXIT_NON_TEST_FAILURE;
        }
        let all_passed = self
            .targets
            .iter()
            .all(|t| matches!(&t.result, Ok(outcome) if outcome.passed()));
        if all_passed {
            EXIT_PASSED
        } else {
            EXIT_TESTS_FAILED
        }
    }
}

pub struct Paramedic<'a> {
    config: &'a RunConfig,
    toolchain: &'a dyn Toolchain,
    probe: &'a (dyn PortProbe + Sync),
    cancel: Option<watch::Receiver<bool>>,
}

impl<'a> Paramedic<'a> {
    pub fn new(
        config: &'a RunConfig,
        toolchain: &'a dyn Toolchain,
        probe: &'a (dyn PortProbe + Sync),
    ) -> Self {
        Self {
            config,
            toolchain,
            probe,
            cancel: None,
        }
    }

    /// Stop between or during targets once `cancel` turns true.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|cancel| *cancel.borrow())
    }

    /// Run the targets one after another. Each gets its own project and
    /// server, and the previous server is fully shut down first.
    pub async fn run(&self) -> RunReport {
        let mut report = RunReport::default();

        if let Err(e) = self.toolchain.check_environment().await {
            error!("paramedic: {}", e);
            report.environment_error = Some(e);
            return report;
        }

        for target in &self.config.targets {
            if self.is_cancelled() {
                report.targets.push(TargetReport {
                    target: target.clone(),
                    result: Err(ParamedicError::Interrupted),
                });
                break;
            }
            let mut runner = TargetRunner::new(self.config, self.toolchain, self.probe);
            if let Some(cancel) = &self.cancel {
                runner = runner.with_cancel(cancel.clone());
            }
            let result = runner.run(target).await;
            log_result(target, &result);

            let fatal = matches!(&result, Err(e) if e.kind() == ErrorKind::Fatal);
            report.targets.push(TargetReport {
                target: target.clone(),
                result,
            });
            if fatal {
                error!("paramedic: aborting remaining targets");
                break;
            }
        }

        match report.exit_code() {
            EXIT_PASSED => info!("All tests have been passed."),
            EXIT_TESTS_FAILED => error!("There are tests failures."),
            _ => error!("There were failures not caused by tests."),
        }
        report
    }
}

fn log_result(target: &Target, result: &Result<TargetOutcome, ParamedicError>) {
    info!("paramedic: tests done for platform {}", target.platform);
    match result {
        Ok(TargetOutcome::Passed(stats)) => info!(
            "Result: passed ({} specs executed)",
            stats.specs_executed
        ),
        Ok(TargetOutcome::Built) => info!("Result: passed (build only)"),
        Ok(TargetOutcome::Failed(reason)) => error!("Result: failed - {}", reason),
        Err(e) => error!("Result: failed - {}", e),
    }
}
