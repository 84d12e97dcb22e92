//! Minimal Google Drive v3 REST client.
//!
//! Authenticates as a service account: a short-lived RS256 JWT is exchanged
//! for an access token (`urn:ietf:params:oauth:grant-type:jwt-bearer`), which
//! is cached until shortly before it expires.
//!
//! | Operation | Endpoint |
//! |-----------|----------|
//! | list PDFs | `GET /drive/v3/files?q=…` (paginated) |
//! | download | `GET /drive/v3/files/{id}?alt=media` |
//! | archive | `PATCH /drive/v3/files/{id}?addParents=…&removeParents=…` |
//! | watch folder | `POST /drive/v3/files/{id}/watch` |
//! | stop channel | `POST /drive/v3/channels/stop` |

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::models::{stream_from_bytes, ByteStream};
use crate::watch_channels::{ChannelProvider, ChannelRequest};

const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const FILE_FIELDS: &str = "nextPageToken, files(id, name, parents, createdTime, modifiedTime)";
/// Tokens are refreshed this long before their reported expiry.
const TOKEN_SLACK: Duration = Duration::from_secs(60);

/// A file as returned by `files.list`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub parents: Vec<String>,
    pub created_time: Option<DateTime<Utc>>,
    pub modified_time: Option<DateTime<Utc>>,
}

/// File operations the Drive watcher needs.
#[async_trait]
pub trait DriveApi: Send + Sync {
    /// Every non-trashed PDF whose parent is one of `folder_ids`.
    async fn list_pdfs(&self, folder_ids: &[String]) -> Result<Vec<DriveFile>>;

    async fn download(&self, file_id: &str) -> Result<ByteStream>;

    /// Re-parents `file_id` so that `folder_id` is its only parent.
    async fn move_file(&self, file_id: &str, folder_id: &str) -> Result<()>;
}

/// Builds the `files.list` query for PDFs in any of `folder_ids`.
pub fn build_search_query(folder_ids: &[String]) -> String {
    let parents = folder_ids
        .iter()
        .map(|id| format!("'{}' in parents", id.replace('\\', "\\\\").replace('\'', "\\'")))
        .collect::<Vec<_>>()
        .join(" or ");
    format!(
        "mimeType='application/pdf' and ({}) and trashed=false",
        parents
    )
}

#[derive(Debug, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default)]
    token_uri: Option<String>,
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Parents {
    #[serde(default)]
    parents: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WatchResponse {
    resource_id: Option<String>,
}

pub struct GoogleDriveClient {
    http: reqwest::Client,
    api_url: String,
    client_email: String,
    token_uri: String,
    key: EncodingKey,
    token: Mutex<Option<(String, Instant)>>,
}

impl GoogleDriveClient {
    /// Loads a service-account JSON key file.
    pub fn from_key_file(path: &Path, api_url: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read service account key: {}", path.display()))?;
        let key: ServiceAccountKey = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse service account key: {}", path.display()))?;
        let encoding = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .context("Service account private key is not a valid RSA PEM")?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            client_email: key.client_email,
            token_uri: key.token_uri.unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string()),
            key: encoding,
            token: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some((token, expires)) = cached.as_ref() {
            if Instant::now() + TOKEN_SLACK < *expires {
                return Ok(token.clone());
            }
        }

        let now = Utc::now().timestamp();
        let claims = Claims {
            iss: &self.client_email,
            scope: DRIVE_SCOPE,
            aud: &self.token_uri,
            iat: now,
            exp: now + 3600,
        };
        let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.key)
            .context("Failed to sign token request")?;

        let params = [
            ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
            ("assertion", assertion.as_str()),
        ];
        let response = self
            .http
            .post(&self.token_uri)
            .form(&params)
            .send()
            .await
            .context("Failed to request access token")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Token request failed {}: {}", status, body);
        }
        let token: TokenResponse = response
            .json()
            .await
            .context("Failed to parse token response")?;

        debug!(expires_in = token.expires_in, "obtained drive access token");
        let expires = Instant::now() + Duration::from_secs(token.expires_in);
        *cached = Some((token.access_token.clone(), expires));
        Ok(token.access_token)
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let token = self.access_token().await?;
        let response = req.bearer_auth(token).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Drive API error {}: {}", status, body);
        }
        Ok(response)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/drive/v3/{}", self.api_url, path)
    }
}

#[async_trait]
impl DriveApi for GoogleDriveClient {
    async fn list_pdfs(&self, folder_ids: &[String]) -> Result<Vec<DriveFile>> {
        if folder_ids.is_empty() {
            return Ok(Vec::new());
        }
        let query = build_search_query(folder_ids);
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut params = vec![("q", query.as_str()), ("fields", FILE_FIELDS)];
            if let Some(token) = page_token.as_deref() {
                params.push(("pageToken", token));
            }
            let page: FileList = self
                .send(self.http.get(self.url("files")).query(&params))
                .await?
                .json()
                .await
                .context("Failed to parse file list")?;
            files.extend(page.files);

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        Ok(files)
    }

    async fn download(&self, file_id: &str) -> Result<ByteStream> {
        let bytes = self
            .send(
                self.http
                    .get(self.url(&format!("files/{}", file_id)))
                    .query(&[("alt", "media")]),
            )
            .await?
            .bytes()
            .await
            .with_context(|| format!("Failed to download file {}", file_id))?;
        Ok(stream_from_bytes(bytes.to_vec()))
    }

    async fn move_file(&self, file_id: &str, folder_id: &str) -> Result<()> {
        let url = self.url(&format!("files/{}", file_id));
        let current: Parents = self
            .send(self.http.get(&url).query(&[("fields", "parents")]))
            .await?
            .json()
            .await
            .context("Failed to parse file parents")?;
        let previous = current.parents.join(",");

        self.send(
            self.http
                .patch(&url)
                .query(&[
                    ("addParents", folder_id),
                    ("removeParents", previous.as_str()),
                    ("fields", "id, parents"),
                ])
                .json(&serde_json::json!({})),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ChannelProvider for GoogleDriveClient {
    async fn watch(&self, req: &ChannelRequest) -> Result<Option<String>> {
        let mut body = serde_json::json!({
            "id": req.channel_id,
            "type": "web_hook",
            "address": req.webhook_url,
            "expiration": req.expires_at.timestamp_millis().to_string(),
        });
        if let Some(token) = &req.token {
            body["token"] = serde_json::Value::String(token.clone());
        }

        let watched: WatchResponse = self
            .send(
                self.http
                    .post(self.url(&format!("files/{}/watch", req.folder_id)))
                    .json(&body),
            )
            .await?
            .json()
            .await
            .context("Failed to parse watch response")?;
        Ok(watched.resource_id)
    }

    async fn stop(&self, channel_id: &str, resource_id: Option<&str>) -> Result<()> {
        let mut body = serde_json::json!({ "id": channel_id });
        if let Some(resource_id) = resource_id {
            body["resourceId"] = serde_json::Value::String(resource_id.to_string());
        }
        self.send(self.http.post(self.url("channels/stop")).json(&body))
            .await?;
        Ok(())
    }
}
