use regex::Regex;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::TUNNEL_STARTUP_TIMEOUT_SECS;
use crate::error::ParamedicError;

const TUNNEL_PROGRAM: &str = "lt";

static TUNNEL_URL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)your url is:\s*(https?://\S+)").unwrap());

/// Extract the public URL from a line of `lt` output.
pub fn parse_tunnel_url(line: &str) -> Option<String> {
    TUNNEL_URL_PATTERN
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim_end_matches('/').to_string())
}

/// A public forwarding address for the local server.
pub struct Tunnel {
    url: String,
    child: Option<Child>,
}

impl Tunnel {
    /// Start `lt --port <port>` and wait for it to report its URL.
    pub async fn open(port: u16) -> Result<Self, ParamedicError> {
        Self::open_with(TUNNEL_PROGRAM, port, Duration::from_secs(TUNNEL_STARTUP_TIMEOUT_SECS)).await
    }

    pub async fn open_with(
        program: &str,
        port: u16,
        deadline: Duration,
    ) -> Result<Self, ParamedicError> {
        info!("paramedic: opening tunnel to port {}", port);
        let mut child = Command::new(program)
            .args(["--port", &port.to_string()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ParamedicError::Tunnel(format!("Failed to spawn {}: {}", program, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ParamedicError::Tunnel("tunnel stdout not captured".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        let wait_for_url = async {
            while let Some(line) = lines.next_line().await? {
                debug!("lt: {}", line);
                if let Some(url) = parse_tunnel_url(&line) {
                    return Ok(Some(url));
                }
            }
            Ok::<_, std::io::Error>(None)
        };

        let url = match tokio::time::timeout(deadline, wait_for_url).await {
            Ok(Ok(Some(url))) => url,
            Ok(Ok(None)) => {
                return Err(ParamedicError::Tunnel(
                    "tunnel exited without reporting a url".to_string(),
                ))
            }
            Ok(Err(e)) => return Err(ParamedicError::Tunnel(format!("reading tunnel output: {}", e))),
            Err(_) => {
                return Err(ParamedicError::Timeout(format!(
                    "tunnel did not report a url within {:?}",
                    deadline
                )))
            }
        };

        // Keep draining so the child never blocks on a full pipe
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("lt: {}", line);
            }
        });

        info!("paramedic: tunnel ready at {}", url);
        Ok(Self {
            url,
            child: Some(child),
        })
    }

    /// A tunnel managed outside this process.
    pub fn fixed(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            child: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn close(mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                warn!("paramedic: failed to stop tunnel: {}", e);
            } else {
                info!("paramedic: tunnel closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tunnel_url() {
        assert_eq!(
            parse_tunnel_url("your url is: https://sharp-cat-42.loca.lt"),
            Some("https://sharp-cat-42.loca.lt".to_string())
        );
        assert_eq!(
            parse_tunnel_url("Your URL is: http://abc.loca.lt/"),
            Some("http://abc.loca.lt".to_string())
        );
        assert_eq!(parse_tunnel_url("connecting..."), None);
    }

    #[test]
    fn test_fixed_tunnel_has_no_process() {
        let tunnel = Tunnel::fixed("https://lab.example.com");
        assert_eq!(tunnel.url(), "https://lab.example.com");
        assert!(tunnel.child.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_open_reads_url_from_child_output() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-lt");
        std::fs::write(
            &script,
            "#!/bin/sh\necho \"starting on $2\"\necho \"your url is: https://fake-$2.loca.lt\"\nsleep 30\n",
        )
        .unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let tunnel = Tunnel::open_with(script.to_str().unwrap(), 7010, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(tunnel.url(), "https://fake-7010.loca.lt");
        tunnel.close().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_open_fails_when_child_exits_silently() {
        let err = Tunnel::open_with("true", 7010, Duration::from_secs(5))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ParamedicError::Tunnel(_)));
    }
}
