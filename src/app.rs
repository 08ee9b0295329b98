//! The throwaway project the plugins are installed into.

use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{info, warn};

use crate::config::{DEFAULT_APP_ID, MEDIC_FILE, TEST_START_PAGE};
use crate::error::ParamedicError;

const CONFIG_XML: &str = "config.xml";
const DEFAULT_START_PAGE: &str = r#"src="index.html""#;

static WIDGET_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<widget[^>]*\sid="([^"]+)""#).unwrap());

/// Contents of `www/medic.json`, read by the app at startup.
#[derive(Debug, Serialize)]
struct MedicFile<'a> {
    logurl: &'a str,
}

#[derive(Debug)]
pub struct ScaffoldedApp {
    dir: PathBuf,
}

impl ScaffoldedApp {
    /// Reserve a fresh, empty directory for the project. It outlives this
    /// value and is only deleted by [`ScaffoldedApp::remove`].
    pub fn create_dir() -> Result<Self, ParamedicError> {
        let dir = tempfile::Builder::new().prefix("paramedic-").tempdir()?.keep();
        info!("paramedic: creating temp project at {}", dir.display());
        Ok(Self { dir })
    }

    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn www_dir(&self) -> PathBuf {
        self.dir.join("www")
    }

    /// Point the app's start page at the test runner page. Returns false if
    /// `config.xml` has no default start page to replace.
    pub fn set_start_page(&self) -> Result<bool, ParamedicError> {
        let path = self.dir.join(CONFIG_XML);
        let content = std::fs::read_to_string(&path)?;
        if !content.contains(DEFAULT_START_PAGE) {
            warn!("paramedic: no default start page in {}", path.display());
            return Ok(false);
        }
        let patched = content.replace(
            DEFAULT_START_PAGE,
            &format!(r#"src="{}""#, TEST_START_PAGE),
        );
        std::fs::write(&path, patched)?;
        info!("paramedic: setting app start page to test page");
        Ok(true)
    }

    /// Write the URL the app reports to into `www/medic.json`.
    pub fn write_medic_url(&self, url: &str) -> Result<PathBuf, ParamedicError> {
        let www = self.www_dir();
        std::fs::create_dir_all(&www)?;
        let path = www.join(MEDIC_FILE);
        let body = serde_json::to_string(&MedicFile { logurl: url })?;
        std::fs::write(&path, body)?;
        info!("paramedic: writing medic log url to project {}", url);
        Ok(path)
    }

    /// Package id from `config.xml`, falling back to the stock template id.
    pub fn app_id(&self) -> String {
        std::fs::read_to_string(self.dir.join(CONFIG_XML))
            .ok()
            .and_then(|xml| {
                WIDGET_ID_PATTERN
                    .captures(&xml)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().to_string())
            })
            .unwrap_or_else(|| DEFAULT_APP_ID.to_string())
    }

    pub fn remove(self) -> Result<(), ParamedicError> {
        info!("paramedic: deleting the application: {}", self.dir.display());
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
