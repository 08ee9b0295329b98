//! Runs one target end to end: prepare the project, start the result server,
//! launch the app and wait for the device to report back.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::app::ScaffoldedApp;
use crate::config::{RunConfig, Target};
use crate::error::ParamedicError;
use crate::events::{EventKind, Subscription};
use crate::process::port::{find_available_port, PortProbe};
use crate::process::tunnel::Tunnel;
use crate::reporter::{spawn_console_reporter, ReportSummary};
use crate::server::{EventServer, ServerOptions};
use crate::session::RunStats;
use crate::toolchain::{DeviceTarget, Toolchain};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Preparing,
    ServerReady,
    Launching,
    AwaitingConnection,
    AwaitingCompletion,
    Done,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Preparing => "preparing",
            RunPhase::ServerReady => "server-ready",
            RunPhase::Launching => "launching",
            RunPhase::AwaitingConnection => "awaiting-connection",
            RunPhase::AwaitingCompletion => "awaiting-completion",
            RunPhase::Done => "done",
        };
        f.write_str(name)
    }
}

/// Why a target failed. These are results, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    NoDeviceConnected { window: Duration },
    DisconnectedBeforeCompletion,
    TimedOut { timeout: Duration },
    TestsFailed(RunStats),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::NoDeviceConnected { window } => write!(
                f,
                "device did not connect to the local server within {} secs",
                window.as_secs()
            ),
            FailureReason::DisconnectedBeforeCompletion => {
                f.write_str("device disconnected before the tests completed")
            }
            FailureReason::TimedOut { timeout } => write!(
                f,
                "tests did not complete within {} secs",
                timeout.as_secs()
            ),
            FailureReason::TestsFailed(stats) => write!(
                f,
                "{} of {} specs failed",
                stats.specs_failed, stats.specs_executed
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOutcome {
    Passed(RunStats),
    /// Build-only target; nothing to wait for.
    Built,
    Failed(FailureReason),
}

impl TargetOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, TargetOutcome::Passed(_) | TargetOutcome::Built)
    }

    pub fn from_stats(stats: RunStats) -> Self {
        if stats.passed() {
            TargetOutcome::Passed(stats)
        } else {
            TargetOutcome::Failed(FailureReason::TestsFailed(stats))
        }
    }
}

/// Terminal event of the completion wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Finished(RunStats),
    Disconnected,
    /// The server went away underneath us.
    Closed,
}

/// Wait for the first of `jasmineDone` or `disconnect` on `events`. Whatever
/// arrives later is ignored; the caller drops the subscription afterwards.
pub async fn await_completion(events: &mut Subscription) -> Completion {
    while let Some(event) = events.recv().await {
        match event.kind {
            EventKind::JasmineDone => {
                let stats = RunStats::from_spec_results(&event.payload).unwrap_or_default();
                return Completion::Finished(stats);
            }
            EventKind::Disconnect => return Completion::Disconnected,
            _ => {}
        }
    }
    Completion::Closed
}

/// Resolves once `cancel` flips to true. A dropped sender never cancels.
pub async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let stopped = cancel.wait_for(|stop| *stop).await.is_ok();
    if !stopped {
        std::future::pending::<()>().await;
    }
}

/// Everything a run acquires that teardown has to release.
#[derive(Default)]
struct RunResources {
    app: Option<ScaffoldedApp>,
    server: Option<EventServer>,
    tunnel: Option<Tunnel>,
    reporter: Option<JoinHandle<ReportSummary>>,
    device: Option<DeviceTarget>,
    /// Set as soon as the launch starts, so a launch cut short by the run
    /// timeout still gets its logs collected and the app uninstalled.
    launched: bool,
}

pub struct TargetRunner<'a> {
    config: &'a RunConfig,
    toolchain: &'a dyn Toolchain,
    probe: &'a (dyn PortProbe + Sync),
    phase: RunPhase,
    cancel: Option<watch::Receiver<bool>>,
}

impl<'a> TargetRunner<'a> {
    pub fn new(
        config: &'a RunConfig,
        toolchain: &'a dyn Toolchain,
        probe: &'a (dyn PortProbe + Sync),
    ) -> Self {
        Self {
            config,
            toolchain,
            probe,
            phase: RunPhase::Preparing,
            cancel: None,
        }
    }

    /// Abandon the run with `Interrupted` once `cancel` turns true. Teardown
    /// still runs.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// Run `target` under the whole-run timeout, then tear down whatever was
    /// set up, whether the run passed, failed, errored or timed out.
    pub async fn run(&mut self, target: &Target) -> Result<TargetOutcome, ParamedicError> {
        info!("paramedic: running tests for {} ({})", target.platform, target.action.as_str());
        let mut resources = RunResources::default();

        let limit = self.config.timeout;
        let mut cancel = self.cancel.clone();
        let driven = tokio::select! {
            driven = timeout(limit, self.drive(target, &mut resources)) => Some(driven),
            _ = async {
                match cancel.as_mut() {
                    Some(cancel) => cancelled(cancel).await,
                    None => std::future::pending::<()>().await,
                }
            } => None,
        };
        let result = match driven {
            None => {
                warn!(
                    "paramedic: {} interrupted in phase {}, tearing down",
                    target.platform, self.phase
                );
                Err(ParamedicError::Interrupted)
            }
            Some(Ok(result)) => result,
            Some(Err(_)) => {
                warn!(
                    "paramedic: {} timed out in phase {}",
                    target.platform, self.phase
                );
                Ok(TargetOutcome::Failed(FailureReason::TimedOut { timeout: limit }))
            }
        };

        self.teardown(target, resources).await;
        result
    }

    fn enter(&mut self, phase: RunPhase) {
        info!("paramedic: {} -> {}", self.phase, phase);
        self.phase = phase;
    }

    async fn drive(
        &mut self,
        target: &Target,
        resources: &mut RunResources,
    ) -> Result<TargetOutcome, ParamedicError> {
        self.phase = RunPhase::Preparing;
        let app = resources.app.insert(ScaffoldedApp::create_dir()?);
        self.toolchain.create_project(app).await?;
        self.toolchain.install_plugins(app, &self.config.plugins).await?;
        app.set_start_page()?;
        self.toolchain.add_platform(app, target).await?;
        self.toolchain.check_requirements(app, target).await?;

        self.enter(RunPhase::ServerReady);
        let port = find_available_port(self.config.ports, self.probe)?;
        let options = ServerOptions::from_config(self.config, target.platform);
        let server = resources.server.insert(EventServer::start(port, options).await?);
        if self.config.use_tunnel {
            let tunnel = resources.tunnel.insert(self.toolchain.open_tunnel(port).await?);
            server.attach_tunnel(tunnel.url());
        }
        let url = server.connection_url()?;
        app.write_medic_url(&url)?;

        // Subscribe before launching so nothing the device sends is missed
        let mut completion = server
            .subscribe(&[EventKind::JasmineDone, EventKind::Disconnect])
            .await;
        let events = server.subscribe(&EventKind::ALL).await;
        resources.reporter = Some(spawn_console_reporter(
            events,
            target.platform,
            self.config.output_dir.clone(),
        ));
        let mut connections = server.connections();

        self.enter(RunPhase::Launching);
        let device = if target.action.waits_for_results() {
            match self.toolchain.choose_device(target).await {
                Ok(device) => device,
                Err(e) => {
                    warn!("paramedic: could not determine the device: {}", e);
                    DeviceTarget::default()
                }
            }
        } else {
            DeviceTarget::default()
        };
        let device = resources.device.insert(device);
        resources.launched = true;
        if let Err(e) = self.toolchain.launch(app, target, device).await {
            // The build failed, so there is nothing installed to clean up
            resources.launched = false;
            return Err(e);
        }
        if !target.action.waits_for_results() {
            info!("paramedic: build finished, nothing to wait for");
            return Ok(TargetOutcome::Built);
        }

        self.enter(RunPhase::AwaitingConnection);
        let window = self.config.connection_timeout.min(self.config.timeout);
        let connected = timeout(window, async {
            connections.wait_for(|accepted| *accepted > 0).await.is_ok()
        })
        .await;
        match connected {
            Ok(true) => info!("paramedic: device connected"),
            Ok(false) => return Ok(TargetOutcome::Failed(FailureReason::DisconnectedBeforeCompletion)),
            Err(_) => {
                error!(
                    "paramedic: seems like the device did not connect to the local server in {} secs",
                    window.as_secs()
                );
                return Ok(TargetOutcome::Failed(FailureReason::NoDeviceConnected { window }));
            }
        }

        self.enter(RunPhase::AwaitingCompletion);
        let outcome = match await_completion(&mut completion).await {
            Completion::Finished(stats) => TargetOutcome::from_stats(stats),
            Completion::Disconnected | Completion::Closed => {
                TargetOutcome::Failed(FailureReason::DisconnectedBeforeCompletion)
            }
        };
        Ok(outcome)
    }

    /// Best effort: every step logs its own failure and carries on.
    async fn teardown(&mut self, target: &Target, mut resources: RunResources) {
        self.enter(RunPhase::Done);
        let output_dir: PathBuf = self.config.output_dir_or_cwd();

        if let Some(app) = &resources.app {
            if resources.launched && target.action.waits_for_results() {
                let device = resources.device.clone().unwrap_or_default();
                if let Err(e) = self
                    .toolchain
                    .collect_logs(app, target, &device, &output_dir)
                    .await
                {
                    warn!("paramedic: failed to collect logs: {}", e);
                }
                if let Err(e) = self.toolchain.uninstall(app, target, &device).await {
                    warn!("paramedic: failed to uninstall the app: {}", e);
                }
            }
        }

        if self.config.cleanup_after_run {
            if let Err(e) = self.toolchain.kill_emulator(target).await {
                warn!("paramedic: failed to kill the emulator: {}", e);
            }
            if let Some(app) = resources.app.take() {
                if let Err(e) = app.remove() {
                    warn!("paramedic: failed to delete the project: {}", e);
                }
            }
        }

        if let Some(tunnel) = resources.tunnel.take() {
            tunnel.close().await;
        }
        if let Some(mut server) = resources.server.take() {
            server.shutdown().await;
        }
        if let Some(reporter) = resources.reporter.take() {
            match reporter.await {
                Ok(summary) => info!(
                    "paramedic: {} reported {} specs, {} failed",
                    target.platform, summary.specs_executed, summary.failures.len()
                ),
                Err(e) => warn!("paramedic: reporter task failed: {}", e),
            }
        }
    }
}
