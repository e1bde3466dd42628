use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use salesync_remote::{
    ClientCredentials, FileLocator, GraphClientConfig, DEFAULT_GRAPH_BASE_URL,
    DEFAULT_LOGIN_BASE_URL,
};
use thiserror::Error;

pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required env var: {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// How mapped rows are written: one statement per row, or staged and merged in bulk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UpsertMode {
    #[default]
    Batch,
    Row,
}

impl FromStr for UpsertMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "batch" => Ok(UpsertMode::Batch),
            "row" => Ok(UpsertMode::Row),
            other => Err(format!("expected `batch` or `row`, got `{other}`")),
        }
    }
}

#[derive(Clone)]
pub struct SyncConfig {
    pub credentials: ClientCredentials,
    pub locator: FileLocator,
    pub database_url: String,
    pub sheet_name: Option<String>,
    pub upsert_mode: UpsertMode,
    pub batch_size: usize,
    pub http_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub graph_base_url: String,
    pub login_base_url: String,
    pub user_agent: String,
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("credentials", &self.credentials)
            .field("locator", &self.locator)
            .field("database_url", &"<redacted>")
            .field("sheet_name", &self.sheet_name)
            .field("upsert_mode", &self.upsert_mode)
            .field("batch_size", &self.batch_size)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("download_timeout_secs", &self.download_timeout_secs)
            .field("graph_base_url", &self.graph_base_url)
            .field("login_base_url", &self.login_base_url)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Blank values count as absent.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let optional = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let required = |name: &'static str| optional(name).ok_or(ConfigError::Missing(name));

        let credentials = ClientCredentials {
            tenant_id: required("TENANT_ID")?,
            client_id: required("CLIENT_ID")?,
            client_secret: required("CLIENT_SECRET")?,
        };
        let locator = FileLocator {
            hostname: required("SITE_HOSTNAME")?,
            site_path: required("SITE_PATH")?,
            file_path: required("FILE_PATH")?,
        };
        let database_url = required("DATABASE_URL")?;

        let upsert_mode = match optional("SYNC_UPSERT_MODE") {
            Some(raw) => raw.parse().map_err(|reason| ConfigError::Invalid {
                name: "SYNC_UPSERT_MODE",
                value: raw.clone(),
                reason,
            })?,
            None => UpsertMode::default(),
        };
        let batch_size = parse_positive(optional("SYNC_BATCH_SIZE"), "SYNC_BATCH_SIZE")?
            .unwrap_or(DEFAULT_BATCH_SIZE as u64) as usize;
        let http_timeout_secs = parse_positive(optional("HTTP_TIMEOUT_SECS"), "HTTP_TIMEOUT_SECS")?
            .unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS);
        let download_timeout_secs =
            parse_positive(optional("DOWNLOAD_TIMEOUT_SECS"), "DOWNLOAD_TIMEOUT_SECS")?
                .unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT_SECS);

        Ok(Self {
            credentials,
            locator,
            database_url,
            sheet_name: optional("SHEET_NAME"),
            upsert_mode,
            batch_size,
            http_timeout_secs,
            download_timeout_secs,
            graph_base_url: optional("GRAPH_BASE_URL")
                .unwrap_or_else(|| DEFAULT_GRAPH_BASE_URL.to_string()),
            login_base_url: optional("LOGIN_BASE_URL")
                .unwrap_or_else(|| DEFAULT_LOGIN_BASE_URL.to_string()),
            user_agent: optional("SALESYNC_USER_AGENT")
                .unwrap_or_else(|| format!("salesync/{}", env!("CARGO_PKG_VERSION"))),
        })
    }

    pub fn graph_client_config(&self) -> GraphClientConfig {
        GraphClientConfig {
            graph_base_url: self.graph_base_url.clone(),
            login_base_url: self.login_base_url.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            download_timeout: Duration::from_secs(self.download_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

/// `DATABASE_URL` alone, for commands that never touch the remote file.
pub fn database_url_from_env() -> Result<String, ConfigError> {
    std::env::var("DATABASE_URL")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing("DATABASE_URL"))
}

fn parse_positive(raw: Option<String>, name: &'static str) -> Result<Option<u64>, ConfigError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    match raw.trim().parse::<u64>() {
        Ok(0) => Err(ConfigError::Invalid {
            name,
            value: raw,
            reason: "must be greater than zero".to_string(),
        }),
        Ok(n) => Ok(Some(n)),
        Err(err) => Err(ConfigError::Invalid {
            name,
            value: raw,
            reason: err.to_string(),
        }),
    }
}
