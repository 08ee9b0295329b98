use crate::config::{Platform, ANDROID_EMULATOR_HOST, LOOPBACK_HOST};
use crate::error::ParamedicError;

/// Inputs for working out the URL a device uses to reach the result server.
#[derive(Debug, Clone, Copy)]
pub struct UrlSources<'a> {
    pub platform: Platform,
    pub port: u16,
    pub tunnel_url: Option<&'a str>,
    pub external_server_url: Option<&'a str>,
    /// A tunnel was requested; without a tunnel URL that is an error rather
    /// than a silent fallback to loopback.
    pub use_tunnel: bool,
}

/// Tunnel URL, else external URL + port, else the platform loopback + port.
pub fn resolve_connection_url(sources: UrlSources<'_>) -> Result<String, ParamedicError> {
    if let Some(tunnel) = non_empty(sources.tunnel_url) {
        return Ok(tunnel.to_string());
    }
    if sources.use_tunnel {
        return Err(ParamedicError::ConnectionUrlUnavailable(
            "a tunnel was requested but no tunnel URL was established".to_string(),
        ));
    }

    if let Some(external) = sources.external_server_url {
        let external = external.trim().trim_end_matches('/');
        if external.is_empty() {
            return Err(ParamedicError::ConnectionUrlUnavailable(
                "external server url is empty".to_string(),
            ));
        }
        return Ok(format!("{}:{}", external, sources.port));
    }

    Ok(format!("{}:{}", loopback_host(sources.platform), sources.port))
}

/// Host the app uses to reach this machine when running locally. The Android
/// emulator does not map 127.0.0.1 to the host, it has its own alias.
pub fn loopback_host(platform: Platform) -> &'static str {
    match platform {
        Platform::Android => ANDROID_EMULATOR_HOST,
        Platform::Ios | Platform::Windows | Platform::Browser => LOOPBACK_HOST,
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
