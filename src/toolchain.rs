//! External tools the run depends on: the platform CLI, adb, simctl and
//! friends. [`Toolchain`] is the seam the run state machine talks to;
//! [`CordovaToolchain`] drives the real binaries.

use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{info, warn};

use crate::app::ScaffoldedApp;
use crate::config::{
    Platform, RunConfig, Target, ANDROID_BOOT_TIMEOUT_SECS, ANDROID_RETRY_TIMES,
    BUILD_FAILED_MARKER, COMMON_CLI_ARGS, DEFAULT_LOG_MINS, LOG_MINS_ADDITIONAL, SUPPORT_PLUGINS,
    UNINSTALL_TIMEOUT_SECS,
};
use crate::error::ParamedicError;
use crate::process::command::{self, CommandOutput};
use crate::process::emulator::{
    emulator_tasks, ensure_emulator, kill_command, parse_adb_devices, AndroidEmulator,
};
use crate::process::tunnel::Tunnel;

static BOOTED_SIMULATOR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(.+?) \(([0-9A-Fa-f-]{36})\) \(Booted\)").unwrap()
});

/// Device or simulator the app was deployed to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceTarget {
    /// adb serial, simulator name or Windows target id.
    pub target: Option<String>,
    /// iOS simulator UDID.
    pub sim_id: Option<String>,
}

#[async_trait]
pub trait Toolchain: Send + Sync {
    /// Make sure the platform CLI and npm are installed.
    async fn check_environment(&self) -> Result<(), ParamedicError>;

    async fn create_project(&self, app: &ScaffoldedApp) -> Result<(), ParamedicError>;

    /// Install the plugins under test, their test plugins and the test harness.
    async fn install_plugins(&self, app: &ScaffoldedApp, plugins: &[String]) -> Result<(), ParamedicError>;

    async fn add_platform(&self, app: &ScaffoldedApp, target: &Target) -> Result<(), ParamedicError>;

    async fn check_requirements(&self, app: &ScaffoldedApp, target: &Target) -> Result<(), ParamedicError>;

    /// Build, or build and start, the app on `device`. A non-zero exit or a
    /// build failure marker in the output is `BuildFailed`.
    async fn launch(
        &self,
        app: &ScaffoldedApp,
        target: &Target,
        device: &DeviceTarget,
    ) -> Result<(), ParamedicError>;

    /// Pick the device to run on. For Android without `--target` this boots
    /// an emulator if nothing is attached.
    async fn choose_device(&self, target: &Target) -> Result<DeviceTarget, ParamedicError>;

    /// Dump device logs into `output_dir`. Returns the written file, if any.
    async fn collect_logs(
        &self,
        app: &ScaffoldedApp,
        target: &Target,
        device: &DeviceTarget,
        output_dir: &Path,
    ) -> Result<Option<PathBuf>, ParamedicError>;

    async fn uninstall(
        &self,
        app: &ScaffoldedApp,
        target: &Target,
        device: &DeviceTarget,
    ) -> Result<(), ParamedicError>;

    async fn kill_emulator(&self, target: &Target) -> Result<(), ParamedicError>;

    async fn open_tunnel(&self, port: u16) -> Result<Tunnel, ParamedicError>;
}

/// Runs the Cordova CLI and the platform SDK tools.
#[derive(Debug, Clone)]
pub struct CordovaToolchain {
    cli: String,
    /// Where relative plugin paths are resolved from.
    base_dir: PathBuf,
    paramedic_plugin: Option<String>,
    device_target: Option<String>,
    log_mins: Option<u32>,
    emulator: AndroidEmulator,
}

impl CordovaToolchain {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            cli: config.cli.clone(),
            base_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            paramedic_plugin: config.paramedic_plugin.clone(),
            device_target: config.device_target.clone(),
            log_mins: config.log_mins,
            emulator: AndroidEmulator::new(),
        }
    }

    async fn cli(&self, app: &ScaffoldedApp, args: Vec<String>) -> Result<CommandOutput, ParamedicError> {
        command::run(&self.cli, &with_common_args(args), Some(app.path())).await
    }

    async fn install_plugin(&self, app: &ScaffoldedApp, spec: &str) -> Result<(), ParamedicError> {
        let (path, extra) = split_plugin_spec(spec);
        let resolved = self.base_dir.join(path);
        let plugin = if resolved.exists() {
            resolved.display().to_string()
        } else {
            path.to_string()
        };

        info!("paramedic: installing plugin {}", plugin);
        let mut args = vec!["plugin".to_string(), "add".to_string(), plugin];
        args.extend(extra);
        self.cli(app, args).await?.check()?;
        Ok(())
    }
}

#[async_trait]
impl Toolchain for CordovaToolchain {
    async fn check_environment(&self) -> Result<(), ParamedicError> {
        let cli = command::run(&self.cli, &["--version".to_string()], None).await?;
        let npm = command::run("npm", &["-v".to_string()], None).await?;
        if !cli.success() || !npm.success() {
            return Err(ParamedicError::Process(format!(
                "{} / npm not usable: {}{}",
                self.cli, cli.stderr, npm.stderr
            )));
        }
        info!("paramedic: using {} version {}", self.cli, cli.stdout.trim());
        info!("paramedic: using npm version {}", npm.stdout.trim());
        Ok(())
    }

    async fn create_project(&self, app: &ScaffoldedApp) -> Result<(), ParamedicError> {
        let args = with_common_args(vec!["create".to_string(), app.path().display().to_string()]);
        command::run(&self.cli, &args, None).await?.check()?;
        Ok(())
    }

    async fn install_plugins(&self, app: &ScaffoldedApp, plugins: &[String]) -> Result<(), ParamedicError> {
        info!("paramedic: installing plugins");
        for plugin in plugins {
            self.install_plugin(app, plugin).await?;
        }

        for tests in find_test_plugins(&app.path().join("plugins"))? {
            self.install_plugin(app, &tests.display().to_string()).await?;
        }

        let mut support: Vec<String> = SUPPORT_PLUGINS.iter().map(|p| p.to_string()).collect();
        support.extend(self.paramedic_plugin.clone());
        for plugin in &support {
            self.install_plugin(app, plugin).await?;
        }

        // Lists installed plugins and their versions in the log
        self.cli(app, vec!["plugins".to_string()]).await?;
        Ok(())
    }

    async fn add_platform(&self, app: &ScaffoldedApp, target: &Target) -> Result<(), ParamedicError> {
        info!("paramedic: adding platform {}", target.platform_spec);
        let args = vec!["platform".to_string(), "add".to_string(), target.platform_spec.clone()];
        self.cli(app, args).await?.check()?;
        info!("paramedic: successfully finished adding platform {}", target.platform);
        Ok(())
    }

    async fn check_requirements(&self, app: &ScaffoldedApp, target: &Target) -> Result<(), ParamedicError> {
        if target.platform == Platform::Browser {
            return Ok(());
        }
        info!("paramedic: checking requirements for platform {}", target.platform);
        let args = vec!["requirements".to_string(), target.platform.id().to_string()];
        self.cli(app, args).await?.check()?;
        Ok(())
    }

    async fn launch(
        &self,
        app: &ScaffoldedApp,
        target: &Target,
        device: &DeviceTarget,
    ) -> Result<(), ParamedicError> {
        let output = self.cli(app, launch_args(target, device)).await?;
        if !output.success() || output.stdout_contains(BUILD_FAILED_MARKER) {
            return Err(ParamedicError::BuildFailed(format!(
                "`{}` exited with {:?}",
                output.command, output.code
            )));
        }
        Ok(())
    }

    async fn choose_device(&self, target: &Target) -> Result<DeviceTarget, ParamedicError> {
        match target.platform {
            Platform::Android => {
                if let Some(serial) = &self.device_target {
                    return Ok(DeviceTarget {
                        target: Some(serial.clone()),
                        sim_id: None,
                    });
                }
                let serial = ensure_emulator(
                    &self.emulator,
                    ANDROID_RETRY_TIMES,
                    Duration::from_secs(ANDROID_BOOT_TIMEOUT_SECS),
                )
                .await?;
                Ok(DeviceTarget {
                    target: serial,
                    sim_id: None,
                })
            }
            Platform::Ios => {
                let args = ["simctl", "list", "devices"].map(String::from);
                let output = command::run("xcrun", &args, None).await?.check()?;
                let booted = parse_booted_simulator(&output.stdout);
                Ok(DeviceTarget {
                    target: self
                        .device_target
                        .clone()
                        .or_else(|| booted.as_ref().map(|(name, _)| name.clone())),
                    sim_id: booted.map(|(_, id)| id),
                })
            }
            Platform::Windows => Ok(DeviceTarget {
                target: self.device_target.clone(),
                sim_id: None,
            }),
            Platform::Browser => Ok(DeviceTarget::default()),
        }
    }

    async fn collect_logs(
        &self,
        app: &ScaffoldedApp,
        target: &Target,
        device: &DeviceTarget,
        output_dir: &Path,
    ) -> Result<Option<PathBuf>, ParamedicError> {
        let logs = match target.platform {
            Platform::Android => {
                let Some(serial) = &device.target else {
                    warn!("paramedic: no android device to get logs from");
                    return Ok(None);
                };
                let devices = command::run("adb", &["devices".to_string()], None).await?;
                if parse_adb_devices(&devices.stdout).len() != 1 {
                    warn!("paramedic: there must be exactly one emulator/device attached");
                    return Ok(None);
                }
                let args = ["-s", serial.as_str(), "logcat", "-d", "-v", "time"].map(String::from);
                command::run("adb", &args, None).await?.check()?.stdout
            }
            Platform::Ios => {
                let Some(sim_id) = &device.sim_id else {
                    warn!("paramedic: failed to find the simulator id");
                    return Ok(None);
                };
                let Some(home) = dirs::home_dir() else {
                    warn!("paramedic: no home directory, skipping simulator logs");
                    return Ok(None);
                };
                let path = home
                    .join("Library/Logs/CoreSimulator")
                    .join(sim_id)
                    .join("system.log");
                tokio::fs::read_to_string(&path).await?
            }
            Platform::Windows => {
                let script = app.path().join("platforms/windows/cordova/log.bat");
                if !script.exists() {
                    return Ok(None);
                }
                let args = vec![
                    "--dump".to_string(),
                    "--mins".to_string(),
                    log_minutes(self.log_mins).to_string(),
                ];
                command::run(&script.display().to_string(), &args, Some(app.path()))
                    .await?
                    .check()?
                    .stdout
            }
            Platform::Browser => {
                info!("paramedic: logging is unsupported for browser, skipping");
                return Ok(None);
            }
        };

        tokio::fs::create_dir_all(output_dir).await?;
        let file = output_dir.join(format!("{}_logs.txt", target.platform));
        tokio::fs::write(&file, logs).await?;
        info!("paramedic: logfiles written to {}", file.display());
        Ok(Some(file))
    }

    async fn uninstall(
        &self,
        app: &ScaffoldedApp,
        target: &Target,
        device: &DeviceTarget,
    ) -> Result<(), ParamedicError> {
        let app_id = app.app_id();
        let (program, args) = match (target.platform, &device.target, &device.sim_id) {
            (Platform::Android, Some(serial), _) => {
                ("adb", vec!["-s".to_string(), serial.clone(), "uninstall".to_string(), app_id])
            }
            (Platform::Ios, _, Some(sim_id)) => (
                "xcrun",
                vec!["simctl".to_string(), "uninstall".to_string(), sim_id.clone(), app_id],
            ),
            _ => {
                info!("paramedic: nothing to uninstall for {}", target.platform);
                return Ok(());
            }
        };

        let limit = Duration::from_secs(UNINSTALL_TIMEOUT_SECS);
        command::run_with_timeout(program, &args, None, limit)
            .await?
            .check()?;
        info!("paramedic: uninstalled {}", app.app_id());
        Ok(())
    }

    async fn kill_emulator(&self, target: &Target) -> Result<(), ParamedicError> {
        let tasks = emulator_tasks(target.platform);
        if tasks.is_empty() {
            return Ok(());
        }
        let (program, args) = kill_command(tasks);
        let output = command::run(program, &args, None).await?;
        if !output.success() {
            warn!("paramedic: kill command returned {:?}", output.code);
        }

        if target.platform == Platform::Android {
            info!("paramedic: killing adb server");
            command::run("adb", &["kill-server".to_string()], None)
                .await?
                .check()?;
        }
        Ok(())
    }

    async fn open_tunnel(&self, port: u16) -> Result<Tunnel, ParamedicError> {
        Tunnel::open(port).await
    }
}

fn with_common_args(mut args: Vec<String>) -> Vec<String> {
    args.extend(COMMON_CLI_ARGS.iter().map(|a| a.to_string()));
    args
}

/// `<action> <platform> [args...] [--target=<device>]`. The chosen device is
/// only passed for platforms whose CLI takes a device id, and never when the
/// user's args already name one.
pub fn launch_args(target: &Target, device: &DeviceTarget) -> Vec<String> {
    let mut args = vec![target.action.as_str().to_string(), target.platform.id().to_string()];
    if let Some(extra) = &target.args {
        args.extend(extra.split_whitespace().map(String::from));
    }
    let takes_device_id = matches!(target.platform, Platform::Android | Platform::Windows);
    let named = args.iter().any(|a| a.starts_with("--target"));
    if let (true, false, Some(id)) = (takes_device_id, named, &device.target) {
        args.push(format!("--target={}", id));
    }
    args
}

/// Splits `path --variable FOO=bar` into the plugin and its extra arguments.
pub fn split_plugin_spec(spec: &str) -> (&str, Vec<String>) {
    match spec.find(" --") {
        Some(idx) if idx > 0 => (
            spec[..idx].trim(),
            spec[idx..].split_whitespace().map(String::from).collect(),
        ),
        _ => (spec.trim(), Vec::new()),
    }
}

/// `tests/` sub-plugins shipped with installed plugins.
pub fn find_test_plugins(plugins_dir: &Path) -> Result<Vec<PathBuf>, ParamedicError> {
    if !plugins_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in std::fs::read_dir(plugins_dir)? {
        let tests = entry?.path().join("tests");
        if tests.join("plugin.xml").is_file() {
            found.push(tests);
        }
    }
    found.sort();
    Ok(found)
}

/// (name, udid) of the first booted simulator in `xcrun simctl list devices`.
pub fn parse_booted_simulator(output: &str) -> Option<(String, String)> {
    output.lines().find_map(|line| {
        let caps = BOOTED_SIMULATOR_PATTERN.captures(line)?;
        Some((caps[1].trim().to_string(), caps[2].to_string()))
    })
}

fn log_minutes(log_mins: Option<u32>) -> u32 {
    match log_mins {
        Some(mins) => mins + LOG_MINS_ADDITIONAL,
        None => DEFAULT_LOG_MINS,
    }
}
