use std::path::{Path, PathBuf};

use actix_web::http::Uri;
use serde::{Deserialize, Serialize};

use crate::http::Surface;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("config file '{0}' could not be read: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("config file '{0}' is malformed: {1}")]
    Parse(PathBuf, serde_json::Error),
    #[error("config file '{0}' could not be written: {1}")]
    Write(PathBuf, std::io::Error),
    #[error("invalid base url '{0}'")]
    InvalidUrl(String),
    #[error("secret must be at least 32 characters long")]
    WeakSecret,
}

/// Filesystem locations the application works with.
#[derive(Debug, Clone)]
pub struct Paths {
    pub config: PathBuf,
    pub storage: PathBuf,
}

impl Paths {
    pub fn new(config: impl Into<PathBuf>, storage: impl Into<PathBuf>) -> Self {
        Self { config: config.into(), storage: storage.into() }
    }

    pub fn from_env() -> Self {
        let config = std::env::var("EMBER_CONFIG").unwrap_or_else(|_| "config.json".into());
        let storage = std::env::var("EMBER_STORAGE").unwrap_or_else(|_| "storage".into());
        Self::new(config, storage)
    }

    pub fn snapshot(&self) -> PathBuf {
        self.storage.join("state.json")
    }

    pub fn assets(&self) -> PathBuf {
        self.storage.join("assets")
    }

    /// A site counts as installed once its config file exists.
    pub fn is_installed(&self) -> bool {
        self.config.is_file()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseDriver {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DatabaseConfig {
    pub driver: DatabaseDriver,
    pub url: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SurfacePaths {
    pub api: String,
    pub admin: String,
}

impl Default for SurfacePaths {
    fn default() -> Self {
        Self { api: "api".into(), admin: "admin".into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub lifetime_minutes: i64,
    pub cookie: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { lifetime_minutes: 120, cookie: "session".into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub debug: bool,
    pub offline: bool,
    pub url: String,
    pub paths: SurfacePaths,
    pub database: DatabaseConfig,
    pub session: SessionConfig,
    pub secret: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: false,
            offline: false,
            url: "http://localhost:8080".into(),
            paths: SurfacePaths::default(),
            database: DatabaseConfig::default(),
            session: SessionConfig::default(),
            secret: String::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path).map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        let config: Config =
            serde_json::from_slice(&bytes).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        Ok(config.with_env_overrides())
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| ConfigError::Write(path.to_path_buf(), e))?;
        }
        let json = serde_json::to_vec_pretty(self).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        std::fs::write(path, json).map_err(|e| ConfigError::Write(path.to_path_buf(), e))
    }

    /// Overlay environment variables on top of file values.
    pub fn with_env_overrides(mut self) -> Self {
        fn bool_env(name: &str) -> Option<bool> {
            std::env::var(name).ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        }
        if let Some(debug) = bool_env("EMBER_DEBUG") { self.debug = debug; }
        if let Some(offline) = bool_env("EMBER_OFFLINE") { self.offline = offline; }
        if let Ok(url) = std::env::var("EMBER_URL") { self.url = url; }
        if let Ok(secret) = std::env::var("EMBER_SECRET") { self.secret = secret; }
        if let Ok(db) = std::env::var("DATABASE_URL") {
            self.database.url = Some(db);
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.base_path()?;
        if self.secret.len() < 32 {
            return Err(ConfigError::WeakSecret);
        }
        Ok(())
    }

    /// Path component of the base url without trailing slash ("" for a root install).
    pub fn base_path(&self) -> Result<String, ConfigError> {
        let uri: Uri = self.url.parse().map_err(|_| ConfigError::InvalidUrl(self.url.clone()))?;
        Ok(uri.path().trim_end_matches('/').to_string())
    }

    /// Mount point of a surface, e.g. `/api` or `/forum/admin`.
    pub fn surface_path(&self, surface: Surface) -> Result<String, ConfigError> {
        let base = self.base_path()?;
        let path = match surface {
            Surface::Api => format!("{base}/{}", self.paths.api.trim_matches('/')),
            Surface::Admin => format!("{base}/{}", self.paths.admin.trim_matches('/')),
            Surface::Forum | Surface::Install | Surface::Update => {
                if base.is_empty() { "/".to_string() } else { base }
            }
        };
        Ok(path)
    }

    /// Absolute url of a surface.
    pub fn url_for(&self, surface: Surface) -> String {
        let root = self.url.trim_end_matches('/');
        match surface {
            Surface::Api => format!("{root}/{}", self.paths.api.trim_matches('/')),
            Surface::Admin => format!("{root}/{}", self.paths.admin.trim_matches('/')),
            _ => root.to_string(),
        }
    }
}
