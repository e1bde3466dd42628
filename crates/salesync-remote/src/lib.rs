//! Microsoft Graph access for the sales workbook: client-credentials token,
//! site → drive → item resolution and content download.

use std::fmt;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::Url;
use salesync_core::FileRevision;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "salesync-remote";

pub const DEFAULT_GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";
pub const DEFAULT_LOGIN_BASE_URL: &str = "https://login.microsoftonline.com";
pub const GRAPH_DEFAULT_SCOPE: &str = "https://graph.microsoft.com/.default";

const ERROR_DETAIL_LIMIT: usize = 300;

#[derive(Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// Human-readable location of the workbook inside a SharePoint site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLocator {
    pub hostname: String,
    pub site_path: String,
    /// Path relative to the root of the site's default document library.
    pub file_path: String,
}

/// Bearer token for one run. There is no refresh; a run uses a single token.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(<redacted>)")
    }
}

#[derive(Debug, Clone)]
pub struct GraphClientConfig {
    pub graph_base_url: String,
    pub login_base_url: String,
    /// Applies to token and metadata requests.
    pub timeout: Duration,
    /// Applies to the workbook content download only.
    pub download_timeout: Duration,
    pub user_agent: Option<String>,
}

/// The resolved workbook: where to download it from and which revision it is.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteFile {
    pub drive_id: String,
    pub file_path: String,
    pub revision: FileRevision,
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("token request rejected with status {status}: {detail}")]
    Auth { status: u16, detail: String },
    #[error("http status {status} for {url}: {detail}")]
    HttpStatus {
        status: u16,
        url: String,
        detail: String,
    },
    #[error("invalid url {0}")]
    InvalidUrl(String),
    #[error("file path is empty")]
    EmptyPath,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveItemResponse {
    #[serde(rename = "eTag")]
    e_tag: Option<String>,
    last_modified_date_time: Option<DateTime<Utc>>,
    name: Option<String>,
    size: Option<u64>,
}

impl From<DriveItemResponse> for FileRevision {
    fn from(item: DriveItemResponse) -> Self {
        FileRevision {
            etag: item.e_tag,
            last_modified: item.last_modified_date_time,
            name: item.name,
            size: item.size,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphErrorBody {
    error: GraphErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GraphErrorDetail {
    code: Option<String>,
    message: Option<String>,
}

fn truncated(body: &str) -> String {
    body.chars().take(ERROR_DETAIL_LIMIT).collect()
}

fn oauth_error_detail(body: &str) -> String {
    match serde_json::from_str::<OAuthErrorBody>(body) {
        Ok(OAuthErrorBody {
            error_description: Some(description),
            ..
        }) => description,
        Ok(OAuthErrorBody {
            error: Some(error), ..
        }) => error,
        _ => truncated(body),
    }
}

fn graph_error_detail(body: &str) -> String {
    match serde_json::from_str::<GraphErrorBody>(body) {
        Ok(GraphErrorBody {
            error: GraphErrorDetail {
                message: Some(message),
                ..
            },
        }) => message,
        Ok(GraphErrorBody {
            error: GraphErrorDetail {
                code: Some(code), ..
            },
        }) => code,
        _ => truncated(body),
    }
}

fn endpoint<I>(base: &Url, segments: I) -> Result<Url, GraphError>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| GraphError::InvalidUrl(base.to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn path_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

#[derive(Debug, Clone)]
pub struct GraphClient {
    client: reqwest::Client,
    graph_base: Url,
    login_base: Url,
    download_timeout: Duration,
}

impl GraphClient {
    pub fn new(config: GraphClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        let graph_base = Url::parse(&config.graph_base_url)
            .with_context(|| format!("parsing graph base url {}", config.graph_base_url))?;
        let login_base = Url::parse(&config.login_base_url)
            .with_context(|| format!("parsing login base url {}", config.login_base_url))?;

        Ok(Self {
            client,
            graph_base,
            login_base,
            download_timeout: config.download_timeout,
        })
    }

    pub fn site_url(&self, hostname: &str, site_path: &str) -> Result<Url, GraphError> {
        let site_segments = path_segments(site_path);
        if site_segments.is_empty() {
            return endpoint(&self.graph_base, ["sites", hostname]);
        }
        let host = format!("{hostname}:");
        endpoint(
            &self.graph_base,
            ["sites", host.as_str()].into_iter().chain(site_segments),
        )
    }

    pub fn item_url(&self, drive_id: &str, file_path: &str) -> Result<Url, GraphError> {
        let segments = path_segments(file_path);
        if segments.is_empty() {
            return Err(GraphError::EmptyPath);
        }
        endpoint(
            &self.graph_base,
            ["drives", drive_id, "root:"].into_iter().chain(segments),
        )
    }

    pub fn content_url(&self, drive_id: &str, file_path: &str) -> Result<Url, GraphError> {
        let mut segments: Vec<String> = path_segments(file_path)
            .into_iter()
            .map(str::to_string)
            .collect();
        match segments.last_mut() {
            Some(last) => last.push(':'),
            None => return Err(GraphError::EmptyPath),
        }
        segments.push("content".to_string());
        endpoint(
            &self.graph_base,
            ["drives", drive_id, "root:"]
                .into_iter()
                .map(str::to_string)
                .chain(segments),
        )
    }

    /// Exchange tenant + client credentials for a Graph bearer token.
    pub async fn acquire_token(
        &self,
        credentials: &ClientCredentials,
    ) -> Result<AccessToken, GraphError> {
        let span = info_span!("token_exchange", tenant_id = %credentials.tenant_id);
        self.exchange_credentials(credentials).instrument(span).await
    }

    async fn exchange_credentials(
        &self,
        credentials: &ClientCredentials,
    ) -> Result<AccessToken, GraphError> {
        let url = endpoint(
            &self.login_base,
            [credentials.tenant_id.as_str(), "oauth2", "v2.0", "token"],
        )?;
        let form = [
            ("client_id", credentials.client_id.as_str()),
            ("client_secret", credentials.client_secret.as_str()),
            ("grant_type", "client_credentials"),
            ("scope", GRAPH_DEFAULT_SCOPE),
        ];

        let resp = self.client.post(url).form(&form).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GraphError::Auth {
                status: status.as_u16(),
                detail: oauth_error_detail(&body),
            });
        }
        let token: TokenResponse = resp.json().await?;
        debug!("access token acquired");
        Ok(AccessToken(token.access_token))
    }

    async fn send_get(
        &self,
        token: &AccessToken,
        url: Url,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response, GraphError> {
        let span = info_span!("graph_get", url = %url);
        self.get_checked(token, url, timeout).instrument(span).await
    }

    async fn get_checked(
        &self,
        token: &AccessToken,
        url: Url,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response, GraphError> {
        let mut request = self.client.get(url.clone()).bearer_auth(token.secret());
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let resp = request.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(GraphError::HttpStatus {
            status: status.as_u16(),
            url: url.to_string(),
            detail: graph_error_detail(&body),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        token: &AccessToken,
        url: Url,
    ) -> Result<T, GraphError> {
        Ok(self.send_get(token, url, None).await?.json().await?)
    }

    pub async fn resolve_site_id(
        &self,
        token: &AccessToken,
        hostname: &str,
        site_path: &str,
    ) -> Result<String, GraphError> {
        let url = self.site_url(hostname, site_path)?;
        let site: IdResponse = self.get_json(token, url).await?;
        Ok(site.id)
    }

    /// Identifier of the site's default document library.
    pub async fn resolve_default_drive_id(
        &self,
        token: &AccessToken,
        site_id: &str,
    ) -> Result<String, GraphError> {
        let url = endpoint(&self.graph_base, ["sites", site_id, "drive"])?;
        let drive: IdResponse = self.get_json(token, url).await?;
        Ok(drive.id)
    }

    pub async fn drive_item(
        &self,
        token: &AccessToken,
        drive_id: &str,
        file_path: &str,
    ) -> Result<FileRevision, GraphError> {
        let url = self.item_url(drive_id, file_path)?;
        let item: DriveItemResponse = self.get_json(token, url).await?;
        Ok(item.into())
    }

    pub async fn download(
        &self,
        token: &AccessToken,
        drive_id: &str,
        file_path: &str,
    ) -> Result<Vec<u8>, GraphError> {
        let url = self.content_url(drive_id, file_path)?;
        let resp = self
            .send_get(token, url, Some(self.download_timeout))
            .await?;
        let body = resp.bytes().await?.to_vec();
        debug!(bytes = body.len(), "downloaded drive item content");
        Ok(body)
    }

    /// Resolve site, default drive and item metadata for a workbook.
    pub async fn locate_file(
        &self,
        token: &AccessToken,
        locator: &FileLocator,
    ) -> Result<RemoteFile, GraphError> {
        let site_id = self
            .resolve_site_id(token, &locator.hostname, &locator.site_path)
            .await?;
        let drive_id = self.resolve_default_drive_id(token, &site_id).await?;
        let revision = self.drive_item(token, &drive_id, &locator.file_path).await?;
        Ok(RemoteFile {
            drive_id,
            file_path: locator.file_path.clone(),
            revision,
        })
    }
}
