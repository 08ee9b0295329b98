//! Emulator lifecycle: booting an Android emulator when no device was named,
//! and killing leftover emulator processes after a run.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

use crate::config::{Platform, ANDROID_BOOT_POLL_SECS};
use crate::error::ParamedicError;
use crate::process::command;

#[async_trait]
pub trait EmulatorControl: Send + Sync {
    /// Serials of devices and emulators that are already attached.
    async fn attached(&self) -> Result<Vec<String>, ParamedicError>;

    /// Boot one emulator and wait up to `deadline` for it. `Ok(None)` if it
    /// did not finish booting in time.
    async fn start(&self, deadline: Duration) -> Result<Option<String>, ParamedicError>;

    async fn kill(&self) -> Result<(), ParamedicError>;
}

/// Reuse an attached device, or boot an emulator. A boot that does not
/// finish within `deadline` is killed and retried `retries` more times.
/// Errors from the tools themselves are not retried.
pub async fn ensure_emulator(
    control: &dyn EmulatorControl,
    retries: u32,
    deadline: Duration,
) -> Result<Option<String>, ParamedicError> {
    if let Some(serial) = control.attached().await?.into_iter().next() {
        info!("paramedic: using attached device {}", serial);
        return Ok(Some(serial));
    }

    let attempts = retries + 1;
    for attempt in 1..=attempts {
        info!("paramedic: starting an Android emulator (attempt {}/{})", attempt, attempts);
        if let Some(serial) = control.start(deadline).await? {
            info!("paramedic: emulator {} is up", serial);
            return Ok(Some(serial));
        }
        warn!("paramedic: emulator did not boot within {} secs", deadline.as_secs());
        if attempt < attempts {
            if let Err(e) = control.kill().await {
                warn!("paramedic: failed to kill the emulator: {}", e);
            }
        }
    }

    error!("paramedic: could not start an android emulator");
    Ok(None)
}

/// The SDK's `emulator` binary and `adb`.
#[derive(Debug, Clone)]
pub struct AndroidEmulator {
    program: String,
    poll: Duration,
}

impl Default for AndroidEmulator {
    fn default() -> Self {
        Self::new()
    }
}

impl AndroidEmulator {
    pub fn new() -> Self {
        Self {
            program: sdk_emulator_binary(),
            poll: Duration::from_secs(ANDROID_BOOT_POLL_SECS),
        }
    }

    async fn boot_completed(&self, serial: &str) -> bool {
        let args = ["-s", serial, "shell", "getprop", "sys.boot_completed"].map(String::from);
        match command::run("adb", &args, None).await {
            Ok(output) => output.success() && output.stdout.trim() == "1",
            Err(_) => false,
        }
    }
}

#[async_trait]
impl EmulatorControl for AndroidEmulator {
    async fn attached(&self) -> Result<Vec<String>, ParamedicError> {
        let output = command::run("adb", &["devices".to_string()], None).await?.check()?;
        Ok(parse_adb_devices(&output.stdout))
    }

    async fn start(&self, deadline: Duration) -> Result<Option<String>, ParamedicError> {
        let before = self.attached().await?;
        let avds = command::run(&self.program, &["-list-avds".to_string()], None)
            .await?
            .check()?;
        let Some(avd) = first_avd(&avds.stdout) else {
            return Err(ParamedicError::Process(
                "no Android virtual device is configured".to_string(),
            ));
        };
        command::spawn_detached(&self.program, &["-avd".to_string(), avd])?;

        let booted = timeout(deadline, async {
            loop {
                sleep(self.poll).await;
                let now = self.attached().await.unwrap_or_default();
                for serial in now.iter().filter(|s| is_emulator(s.as_str()) && !before.contains(*s)) {
                    if self.boot_completed(serial).await {
                        return serial.clone();
                    }
                }
            }
        })
        .await;
        Ok(booted.ok())
    }

    async fn kill(&self) -> Result<(), ParamedicError> {
        let (program, args) = kill_command(emulator_tasks(Platform::Android));
        let output = command::run(program, &args, None).await?;
        if !output.success() {
            warn!("paramedic: kill command returned {:?}", output.code);
        }
        Ok(())
    }
}

/// `$ANDROID_HOME/emulator/emulator` when the SDK location is known.
fn sdk_emulator_binary() -> String {
    let binary = if cfg!(windows) { "emulator.exe" } else { "emulator" };
    ["ANDROID_HOME", "ANDROID_SDK_ROOT"]
        .iter()
        .filter_map(std::env::var_os)
        .map(|root| PathBuf::from(root).join("emulator").join(binary))
        .find(|path| path.is_file())
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "emulator".to_string())
}

fn is_emulator(serial: &str) -> bool {
    serial.starts_with("emulator-")
}

/// First AVD name in `emulator -list-avds` output.
pub fn first_avd(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with("INFO"))
        .map(String::from)
}

/// Serials of attached devices from `adb devices` output.
pub fn parse_adb_devices(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| !line.starts_with("List of devices"))
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let serial = cols.next()?;
            matches!(cols.next()?, "device" | "emulator" | "host").then(|| serial.to_string())
        })
        .collect()
}

pub fn emulator_tasks(platform: Platform) -> &'static [&'static str] {
    match platform {
        Platform::Windows => &["WWAHost.exe"],
        Platform::Ios => &["Simulator", "iOS Simulator"],
        Platform::Android if cfg!(windows) => &["emulator-arm.exe"],
        Platform::Android => &["emulator64-x86", "emulator64-arm"],
        Platform::Browser => &[],
    }
}

pub fn kill_command(tasks: &[&str]) -> (&'static str, Vec<String>) {
    if cfg!(windows) {
        let mut args = vec!["/F".to_string()];
        for task in tasks {
            args.push("/IM".to_string());
            args.push(task.to_string());
        }
        ("taskkill", args)
    } else {
        let mut args = vec!["-9".to_string()];
        args.extend(tasks.iter().map(|t| t.to_string()));
        ("killall", args)
    }
}
