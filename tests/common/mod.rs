#![allow(dead_code)]

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use paramedic::app::ScaffoldedApp;
use paramedic::config::{Action, HeartbeatConfig, PortRange, RunConfig, Target};
use paramedic::error::ParamedicError;
use paramedic::process::tunnel::Tunnel;
use paramedic::toolchain::{DeviceTarget, Toolchain};

pub const STOCK_CONFIG_XML: &str = r#"<?xml version='1.0' encoding='utf-8'?>
<widget id="io.cordova.hellocordova" version="1.0.0" xmlns="http://www.w3.org/ns/widgets">
    <content src="index.html" />
</widget>
"#;

/// A port that was free a moment ago.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("0.0.0.0:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn test_config(platform: &str, action: Action, port: u16) -> RunConfig {
    RunConfig {
        targets: vec![Target::new(platform, action, None).unwrap()],
        plugins: vec!["cordova-plugin-battery-status".to_string()],
        ports: PortRange::new(port, port).unwrap(),
        external_server_url: None,
        use_tunnel: false,
        timeout: Duration::from_secs(3600),
        connection_timeout: Duration::from_secs(300),
        cleanup_after_run: true,
        output_dir: None,
        log_mins: None,
        device_target: None,
        cli: "cordova".to_string(),
        paramedic_plugin: None,
        verbose: false,
        heartbeat: HeartbeatConfig::default(),
    }
}

/// Device side of the result socket.
pub struct FakeDevice {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl FakeDevice {
    /// Connect to a `logurl` as written into `medic.json`.
    pub async fn connect(logurl: &str) -> Self {
        let url = logurl.replacen("http://", "ws://", 1).replacen("https://", "wss://", 1);
        let (ws, _) = connect_async(format!("{}/", url.trim_end_matches('/')))
            .await
            .unwrap();
        Self { ws }
    }

    pub async fn connect_port(port: u16) -> Self {
        Self::connect(&format!("http://127.0.0.1:{}", port)).await
    }

    pub async fn send(&mut self, event: &str, data: Value) {
        let frame = json!({ "event": event, "data": data }).to_string();
        self.ws.send(Message::Text(frame.into())).await.unwrap();
    }

    /// Send without caring whether the server still listens.
    pub async fn try_send(&mut self, event: &str, data: Value) -> bool {
        let frame = json!({ "event": event, "data": data }).to_string();
        self.ws.send(Message::Text(frame.into())).await.is_ok()
    }

    pub async fn spec_done(&mut self, name: &str, status: &str) {
        self.send("specDone", json!({ "fullName": name, "status": status }))
            .await;
    }

    /// Next close frame or end of stream, skipping pings.
    pub async fn wait_closed(&mut self) {
        while let Some(frame) = self.ws.next().await {
            match frame {
                Ok(Message::Close(_)) | Err(_) => return,
                Ok(_) => {}
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// What the fake device does once the app is "launched".
#[derive(Debug, Clone)]
pub enum DeviceScript {
    /// Never connects.
    Silent,
    /// Connects, sends the events in order, then optionally hangs up.
    Report {
        events: Vec<(String, Value)>,
        close: bool,
    },
    /// Connects and never says anything.
    Hang,
}

impl DeviceScript {
    pub fn report(events: &[(&str, Value)], close: bool) -> Self {
        DeviceScript::Report {
            events: events
                .iter()
                .map(|(name, data)| (name.to_string(), data.clone()))
                .collect(),
            close,
        }
    }
}

/// Records calls and plays a device script on launch.
pub struct FakeToolchain {
    pub script: DeviceScript,
    pub fail_launch: bool,
    /// `launch` never returns, like a build stuck on a device prompt.
    pub hang_launch: bool,
    pub fail_environment: bool,
    pub calls: Mutex<Vec<String>>,
    pub projects: Mutex<Vec<PathBuf>>,
}

impl FakeToolchain {
    pub fn new(script: DeviceScript) -> Self {
        Self {
            script,
            fail_launch: false,
            hang_launch: false,
            fail_environment: false,
            calls: Mutex::new(Vec::new()),
            projects: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn called(&self, name: &str) -> bool {
        self.calls().iter().any(|c| c == name)
    }

    fn record(&self, name: &str) {
        self.calls.lock().unwrap().push(name.to_string());
    }
}

fn read_logurl(project: &Path) -> String {
    let body = std::fs::read_to_string(project.join("www").join("medic.json")).unwrap();
    let value: Value = serde_json::from_str(&body).unwrap();
    value["logurl"].as_str().unwrap().to_string()
}

#[async_trait]
impl Toolchain for FakeToolchain {
    async fn check_environment(&self) -> Result<(), ParamedicError> {
        self.record("check_environment");
        if self.fail_environment {
            return Err(ParamedicError::Process("cordova: command not found".into()));
        }
        Ok(())
    }

    async fn create_project(&self, app: &ScaffoldedApp) -> Result<(), ParamedicError> {
        self.record("create_project");
        std::fs::write(app.path().join("config.xml"), STOCK_CONFIG_XML)?;
        self.projects.lock().unwrap().push(app.path().to_path_buf());
        Ok(())
    }

    async fn install_plugins(&self, _app: &ScaffoldedApp, _plugins: &[String]) -> Result<(), ParamedicError> {
        self.record("install_plugins");
        Ok(())
    }

    async fn add_platform(&self, _app: &ScaffoldedApp, _target: &Target) -> Result<(), ParamedicError> {
        self.record("add_platform");
        Ok(())
    }

    async fn check_requirements(&self, _app: &ScaffoldedApp, _target: &Target) -> Result<(), ParamedicError> {
        self.record("check_requirements");
        Ok(())
    }

    async fn launch(
        &self,
        app: &ScaffoldedApp,
        _target: &Target,
        _device: &DeviceTarget,
    ) -> Result<(), ParamedicError> {
        self.record("launch");
        if self.fail_launch {
            return Err(ParamedicError::BuildFailed("BUILD FAILED".into()));
        }
        if self.hang_launch {
            std::future::pending::<()>().await;
        }

        let logurl = read_logurl(app.path());
        match self.script.clone() {
            DeviceScript::Silent => {}
            DeviceScript::Report { events, close } => {
                tokio::spawn(async move {
                    let mut device = FakeDevice::connect(&logurl).await;
                    for (name, data) in events {
                        device.send(&name, data).await;
                    }
                    if close {
                        device.close().await;
                    } else {
                        device.wait_closed().await;
                    }
                });
            }
            DeviceScript::Hang => {
                tokio::spawn(async move {
                    let mut device = FakeDevice::connect(&logurl).await;
                    device.wait_closed().await;
                });
            }
        }
        Ok(())
    }

    async fn choose_device(&self, _target: &Target) -> Result<DeviceTarget, ParamedicError> {
        self.record("choose_device");
        Ok(DeviceTarget::default())
    }

    async fn collect_logs(
        &self,
        _app: &ScaffoldedApp,
        _target: &Target,
        _device: &DeviceTarget,
        _output_dir: &Path,
    ) -> Result<Option<PathBuf>, ParamedicError> {
        self.record("collect_logs");
        Err(ParamedicError::Process("adb: no devices".into()))
    }

    async fn uninstall(
        &self,
        _app: &ScaffoldedApp,
        _target: &Target,
        _device: &DeviceTarget,
    ) -> Result<(), ParamedicError> {
        self.record("uninstall");
        Ok(())
    }

    async fn kill_emulator(&self, _target: &Target) -> Result<(), ParamedicError> {
        self.record("kill_emulator");
        Ok(())
    }

    async fn open_tunnel(&self, _port: u16) -> Result<Tunnel, ParamedicError> {
        self.record("open_tunnel");
        Ok(Tunnel::fixed("https://fake-tunnel.loca.lt"))
    }
}
