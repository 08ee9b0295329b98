use clap::Parser;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ParamedicError;

/// Paramedic: builds a throwaway app with the given plugins, runs its test
/// suite on a device and collects the results.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "paramedic", version)]
pub struct CliArgs {
    /// Platform id, optionally with a source (`android`, `ios@../cordova-ios`)
    #[arg(long, env = "PARAMEDIC_PLATFORM")]
    pub platform: Option<String>,

    /// Path or id of a plugin to install and test (repeatable)
    #[arg(long = "plugin")]
    pub plugins: Vec<String>,

    /// Read configuration from a JSON file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Only build the project, do not run the tests
    #[arg(long = "justbuild", visible_alias = "just-build")]
    pub just_build: bool,

    /// Platform CLI action (`run`, `emulate` or `build`)
    #[arg(long)]
    pub action: Option<String>,

    /// Extra arguments passed to the platform CLI action
    #[arg(long, allow_hyphen_values = true)]
    pub args: Option<String>,

    /// First port of the range scanned for the result server
    #[arg(long = "startport")]
    pub start_port: Option<u16>,

    /// Last port of the range scanned for the result server
    #[arg(long = "endport")]
    pub end_port: Option<u16>,

    /// Use exactly this port (sets both ends of the range)
    #[arg(long)]
    pub port: Option<u16>,

    /// Whole-run timeout in milliseconds
    #[arg(long = "timeout")]
    pub timeout_ms: Option<u64>,

    /// How long to wait for the device to connect, in milliseconds
    #[arg(long = "connection-timeout")]
    pub connection_timeout_ms: Option<u64>,

    /// Address the device should use to reach this machine
    #[arg(long = "external-server-url", env = "PARAMEDIC_EXTERNAL_SERVER_URL")]
    pub external_server_url: Option<String>,

    /// Expose the result server through a public tunnel
    #[arg(long = "use-tunnel")]
    pub use_tunnel: bool,

    /// Delete the scaffolded app and kill emulators after the run
    #[arg(long = "cleanup-after-run")]
    pub cleanup_after_run: bool,

    /// Directory for device logs, results and the run log
    #[arg(long = "output-dir")]
    pub output_dir: Option<PathBuf>,

    /// Windows only: minutes of event log to dump
    #[arg(long = "log-mins")]
    pub log_mins: Option<u32>,

    /// Device or emulator to deploy to
    #[arg(long)]
    pub target: Option<String>,

    /// Path to the platform CLI
    #[arg(long, env = "PARAMEDIC_CLI")]
    pub cli: Option<String>,

    /// Path to the device-side reporter plugin
    #[arg(long = "paramedic-plugin")]
    pub paramedic_plugin: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

// Port constants
pub const DEFAULT_START_PORT: u16 = 7008;
pub const DEFAULT_END_PORT: u16 = 7208;

// Timing constants
pub const DEFAULT_TIMEOUT_MS: u64 = 60 * 60 * 1000; // 60 minutes
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 300_000; // 5 minutes
pub const HEARTBEAT_PING_INTERVAL_SECS: u64 = 25;
pub const HEARTBEAT_PING_TIMEOUT_SECS: u64 = 60;
pub const TUNNEL_STARTUP_TIMEOUT_SECS: u64 = 30;
pub const UNINSTALL_TIMEOUT_SECS: u64 = 60;

// Addressing
pub const ANDROID_EMULATOR_HOST: &str = "http://10.0.2.2";
pub const LOOPBACK_HOST: &str = "http://127.0.0.1";

// Platform CLI
pub const DEFAULT_CLI: &str = "cordova";
pub const COMMON_CLI_ARGS: &[&str] = &["--no-telemetry"];
pub const BUILD_FAILED_MARKER: &str = "BUILD FAILED";
pub const DEFAULT_APP_ID: &str = "io.cordova.hellocordova";
pub const SUPPORT_PLUGINS: &[&str] = &["cordova-plugin-test-framework", "cordova-plugin-device"];

// Scaffolded app
pub const MEDIC_FILE: &str = "medic.json";
pub const TEST_START_PAGE: &str = "cdvtests/index.html";

// Android emulator
pub const ANDROID_RETRY_TIMES: u32 = 3;
pub const ANDROID_BOOT_TIMEOUT_SECS: u64 = 300;
pub const ANDROID_BOOT_POLL_SECS: u64 = 5;

// Device logs
pub const DEFAULT_LOG_MINS: u32 = 15;
pub const LOG_MINS_ADDITIONAL: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Android,
    Ios,
    Windows,
    Browser,
}

impl Platform {
    pub fn id(&self) -> &'static str {
        match self {
            Platform::Android => "android",
            Platform::Ios => "ios",
            Platform::Windows => "windows",
            Platform::Browser => "browser",
        }
    }

    /// Parses a platform spec such as `android` or `windows@../cordova-windows`.
    pub fn from_spec(spec: &str) -> Result<Self, ParamedicError> {
        let id = spec.split('@').next().unwrap_or_default().trim();
        match id.to_ascii_lowercase().as_str() {
            "android" => Ok(Platform::Android),
            "ios" => Ok(Platform::Ios),
            "windows" => Ok(Platform::Windows),
            "browser" => Ok(Platform::Browser),
            _ => Err(ParamedicError::Config(format!(
                "Unknown platform '{}'. Supported: android, ios, windows, browser",
                spec
            ))),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Run,
    Emulate,
    Build,
}

impl Action {
    pub fn parse(action: &str) -> Result<Self, ParamedicError> {
        match action.trim() {
            "run" => Ok(Action::Run),
            "emulate" => Ok(Action::Emulate),
            "build" => Ok(Action::Build),
            other => Err(ParamedicError::Config(format!(
                "Unknown action '{}'. Supported: run, emulate, build",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Run => "run",
            Action::Emulate => "emulate",
            Action::Build => "build",
        }
    }

    /// Whether the app is launched and we have results to wait for.
    pub fn waits_for_results(&self) -> bool {
        matches!(self, Action::Run | Action::Emulate)
    }
}

/// One (platform, action, args) triple to run the tests against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub platform: Platform,
    /// Full spec passed to `platform add`, e.g. `android@12.0.0`.
    pub platform_spec: String,
    pub action: Action,
    pub args: Option<String>,
}

impl Target {
    pub fn new(platform_spec: &str, action: Action, args: Option<String>) -> Result<Self, ParamedicError> {
        Ok(Self {
            platform: Platform::from_spec(platform_spec)?,
            platform_spec: platform_spec.trim().to_string(),
            action,
            args: args.filter(|a| !a.trim().is_empty()),
        })
    }
}

/// Inclusive port range. A reversed range is swapped before use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self, ParamedicError> {
        if start == 0 || end == 0 {
            return Err(ParamedicError::Config(format!(
                "Port range {}-{} must only contain positive ports",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    pub fn normalized(self) -> Self {
        if self.start > self.end {
            Self {
                start: self.end,
                end: self.start,
            }
        } else {
            self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// How often the server pings the device.
    pub ping_interval: Duration,
    /// How long without any frame from the device before it is considered gone.
    pub ping_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(HEARTBEAT_PING_INTERVAL_SECS),
            ping_timeout: Duration::from_secs(HEARTBEAT_PING_TIMEOUT_SECS),
        }
    }
}

/// Target entry of the JSON config file.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetSpec {
    pub platform: String,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub args: Option<String>,
}

/// On-disk configuration (`--config`). Keys are camelCase.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    pub platform: Option<String>,
    pub action: Option<String>,
    pub args: Option<String>,
    #[serde(default)]
    pub plugins: Vec<String>,
    #[serde(default)]
    pub targets: Vec<TargetSpec>,
    pub use_tunnel: Option<bool>,
    pub external_server_url: Option<String>,
    pub start_port: Option<u16>,
    pub end_port: Option<u16>,
    pub timeout: Option<u64>,
    pub connection_timeout: Option<u64>,
    pub clean_up_after_run: Option<bool>,
    pub output_dir: Option<PathBuf>,
    pub log_mins: Option<u32>,
    pub target: Option<String>,
    pub cli: Option<String>,
    pub paramedic_plugin: Option<String>,
    pub verbose: Option<bool>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, ParamedicError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ParamedicError::Config(format!("Cannot read config file {:?}: {}", path, e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            ParamedicError::Config(format!("Invalid config file {:?}: {}", path, e))
        })
    }
}

/// Immutable run parameters. Built once at startup and only read afterwards.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub targets: Vec<Target>,
    pub plugins: Vec<String>,
    pub ports: PortRange,
    pub external_server_url: Option<String>,
    pub use_tunnel: bool,
    pub timeout: Duration,
    /// Initial-connection window. Never longer than `timeout`.
    pub connection_timeout: Duration,
    pub cleanup_after_run: bool,
    pub output_dir: Option<PathBuf>,
    pub log_mins: Option<u32>,
    pub device_target: Option<String>,
    pub cli: String,
    pub paramedic_plugin: Option<String>,
    pub verbose: bool,
    pub heartbeat: HeartbeatConfig,
}

impl RunConfig {
    pub fn from_args(args: CliArgs) -> Result<Self, ParamedicError> {
        let file = match &args.config {
            Some(path) => ConfigFile::load(path)?,
            None => ConfigFile::default(),
        };
        Self::merge(args, file)
    }

    /// Combines CLI flags with the config file. Flags win.
    pub fn merge(args: CliArgs, file: ConfigFile) -> Result<Self, ParamedicError> {
        let action = if args.just_build {
            Action::Build
        } else {
            match args.action.as_deref().or(file.action.as_deref()) {
                Some(a) => Action::parse(a)?,
                None => Action::Run,
            }
        };
        let target_args = args.args.clone().or(file.args.clone());

        let targets = if let Some(platform) = args.platform.as_deref() {
            vec![Target::new(platform, action, target_args)?]
        } else if !file.targets.is_empty() {
            file.targets
                .iter()
                .map(|t| {
                    let action = if args.just_build {
                        Action::Build
                    } else {
                        match t.action.as_deref() {
                            Some(a) => Action::parse(a)?,
                            None => action,
                        }
                    };
                    Target::new(&t.platform, action, t.args.clone())
                })
                .collect::<Result<Vec<_>, _>>()?
        } else if let Some(platform) = file.platform.as_deref() {
            vec![Target::new(platform, action, target_args)?]
        } else {
            return Err(ParamedicError::Config(
                "Missing platform: pass --platform or --config".to_string(),
            ));
        };

        let plugins = if args.plugins.is_empty() {
            file.plugins
        } else {
            args.plugins
        };

        let start = args
            .port
            .or(args.start_port)
            .or(file.start_port)
            .unwrap_or(DEFAULT_START_PORT);
        let end = args
            .port
            .or(args.end_port)
            .or(file.end_port)
            .unwrap_or(DEFAULT_END_PORT);

        let timeout_ms = args.timeout_ms.or(file.timeout).unwrap_or(DEFAULT_TIMEOUT_MS);
        let connection_timeout_ms = args
            .connection_timeout_ms
            .or(file.connection_timeout)
            .unwrap_or(DEFAULT_CONNECTION_TIMEOUT_MS);

        let config = RunConfig {
            targets,
            plugins,
            ports: PortRange::new(start, end)?,
            external_server_url: args
                .external_server_url
                .or(file.external_server_url)
                .map(|u| u.trim_end_matches('/').to_string()),
            use_tunnel: args.use_tunnel || file.use_tunnel.unwrap_or(false),
            timeout: Duration::from_millis(timeout_ms),
            connection_timeout: Duration::from_millis(connection_timeout_ms.min(timeout_ms)),
            cleanup_after_run: args.cleanup_after_run || file.clean_up_after_run.unwrap_or(false),
            output_dir: args.output_dir.or(file.output_dir),
            log_mins: args.log_mins.or(file.log_mins),
            device_target: args.target.or(file.target),
            cli: args
                .cli
                .or(file.cli)
                .unwrap_or_else(|| DEFAULT_CLI.to_string()),
            paramedic_plugin: args.paramedic_plugin.or(file.paramedic_plugin),
            verbose: args.verbose || file.verbose.unwrap_or(false),
            heartbeat: HeartbeatConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ParamedicError> {
        if self.targets.is_empty() {
            return Err(ParamedicError::Config("No targets to run".to_string()));
        }
        if self.plugins.is_empty() {
            return Err(ParamedicError::Config(
                "Missing plugins: pass at least one --plugin".to_string(),
            ));
        }
        if self.timeout.is_zero() || self.connection_timeout.is_zero() {
            return Err(ParamedicError::Config(
                "Timeouts must be positive".to_string(),
            ));
        }
        if self.connection_timeout > self.timeout {
            return Err(ParamedicError::Config(
                "Connection timeout cannot exceed the run timeout".to_string(),
            ));
        }
        if let Some(external) = &self.external_server_url {
            url::Url::parse(external).map_err(|e| {
                ParamedicError::Config(format!("Invalid external server url '{}': {}", external, e))
            })?;
        }
        Ok(())
    }

    /// Directory for logs and results; the working directory when unset.
    pub fn output_dir_or_cwd(&self) -> PathBuf {
        self.output_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_with(platform: &str) -> CliArgs {
        CliArgs {
            platform: Some(platform.to_string()),
            plugins: vec!["./my-plugin".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_platform_from_spec_strips_source() {
        assert_eq!(Platform::from_spec("android").unwrap(), Platform::Android);
        assert_eq!(
            Platform::from_spec("windows@https://github.com/apache/cordova-windows.git").unwrap(),
            Platform::Windows
        );
        assert_eq!(Platform::from_spec("IOS@../cordova-ios").unwrap(), Platform::Ios);
    }

    #[test]
    fn test_platform_from_spec_rejects_unknown() {
        let err = Platform::from_spec("blackberry10").unwrap_err();
        assert!(matches!(err, ParamedicError::Config(_)));
    }

    #[test]
    fn test_action_waits_for_results() {
        assert!(Action::Run.waits_for_results());
        assert!(Action::Emulate.waits_for_results());
        assert!(!Action::Build.waits_for_results());
    }

    #[test]
    fn test_port_range_rejects_zero() {
        assert!(PortRange::new(0, 10).is_err());
        assert!(PortRange::new(10, 0).is_err());
    }

    #[test]
    fn test_port_range_normalizes_reversed() {
        let range = PortRange::new(7208, 7008).unwrap().normalized();
        assert_eq!(range.start, 7008);
        assert_eq!(range.end, 7208);
    }

    #[test]
    fn test_merge_defaults() {
        let config = RunConfig::merge(args_with("android"), ConfigFile::default()).unwrap();
        assert_eq!(config.targets.len(), 1);
        assert_eq!(config.targets[0].action, Action::Run);
        assert_eq!(config.ports, PortRange { start: DEFAULT_START_PORT, end: DEFAULT_END_PORT });
        assert_eq!(config.timeout, Duration::from_millis(DEFAULT_TIMEOUT_MS));
        assert_eq!(
            config.connection_timeout,
            Duration::from_millis(DEFAULT_CONNECTION_TIMEOUT_MS)
        );
        assert_eq!(config.cli, DEFAULT_CLI);
        assert!(!config.use_tunnel);
        assert!(!config.cleanup_after_run);
    }

    #[test]
    fn test_merge_port_sets_both_ends() {
        let mut args = args_with("ios");
        args.port = Some(8008);
        let config = RunConfig::merge(args, ConfigFile::default()).unwrap();
        assert_eq!(config.ports, PortRange { start: 8008, end: 8008 });
    }

    #[test]
    fn test_merge_just_build_overrides_action() {
        let mut args = args_with("browser");
        args.action = Some("run".to_string());
        args.just_build = true;
        let config = RunConfig::merge(args, ConfigFile::default()).unwrap();
        assert_eq!(config.targets[0].action, Action::Build);
    }

    #[test]
    fn test_merge_connection_timeout_clamped_to_run_timeout() {
        let mut args = args_with("android");
        args.timeout_ms = Some(1_000);
        args.connection_timeout_ms = Some(540_000);
        let config = RunConfig::merge(args, ConfigFile::default()).unwrap();
        assert_eq!(config.connection_timeout, Duration::from_millis(1_000));
    }

    #[test]
    fn test_merge_requires_platform() {
        let args = CliArgs {
            plugins: vec!["p".to_string()],
            ..Default::default()
        };
        assert!(RunConfig::merge(args, ConfigFile::default()).is_err());
    }

    #[test]
    fn test_merge_requires_plugins() {
        let args = CliArgs {
            platform: Some("android".to_string()),
            ..Default::default()
        };
        assert!(RunConfig::merge(args, ConfigFile::default()).is_err());
    }

    #[test]
    fn test_merge_rejects_invalid_external_url() {
        let mut args = args_with("android");
        args.external_server_url = Some("not a url".to_string());
        assert!(RunConfig::merge(args, ConfigFile::default()).is_err());
    }

    #[test]
    fn test_merge_uses_file_targets() {
        let file: ConfigFile = serde_json::from_value(serde_json::json!({
            "useTunnel": true,
            "plugins": ["https://github.com/apache/cordova-plugin-inappbrowser"],
            "cleanUpAfterRun": true,
            "targets": [
                {"platform": "ios@https://github.com/apache/cordova-ios.git", "action": "run", "args": "--device"},
                {"platform": "windows", "action": "build"}
            ]
        }))
        .unwrap();
        let config = RunConfig::merge(CliArgs::default(), file).unwrap();
        assert!(config.use_tunnel);
        assert!(config.cleanup_after_run);
        assert_eq!(config.targets.len(), 2);
        assert_eq!(config.targets[0].platform, Platform::Ios);
        assert_eq!(config.targets[0].args.as_deref(), Some("--device"));
        assert_eq!(config.targets[1].action, Action::Build);
    }

    #[test]
    fn test_cli_platform_overrides_file_targets() {
        let file: ConfigFile = serde_json::from_value(serde_json::json!({
            "targets": [{"platform": "ios"}, {"platform": "windows"}]
        }))
        .unwrap();
        let config = RunConfig::merge(args_with("android"), file).unwrap();
        assert_eq!(config.targets.len(), 1);
        assert_eq!(config.targets[0].platform, Platform::Android);
    }
}
