//! `ocr` stage: converts a PDF to Markdown through a Mathpix-style service.
//!
//! 1. `POST <api_url>` multipart upload (`file` part) → `{ "pdf_id": … }`
//! 2. `GET <api_url>/<pdf_id>` every `poll_interval` until the status is
//!    `completed` or `error`
//! 3. `GET <api_url>/<pdf_id>.md` → Markdown body
//!
//! Every request carries `app_id` and `app_key` headers. All three steps share
//! one deadline of `timeout` from the start of `process`, so a service that
//! stops answering mid-request still ends in `ConversionTimeout`.

use std::future::Future;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::debug;

use crate::error::PipelineError;
use crate::models::{read_stream, stream_from_bytes, ByteStream, SourceDocument};
use crate::stage::Stage;

pub struct OcrStage {
    client: reqwest::Client,
    api_url: String,
    app_id: String,
    app_key: String,
    poll_interval: Duration,
    timeout: Duration,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorInfo {
    #[serde(default)]
    id: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    pdf_id: String,
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_info: Option<ErrorInfo>,
}

#[derive(Debug, Deserialize)]
struct PollResponse {
    status: String,
}

impl OcrStage {
    pub fn new(
        api_url: &str,
        app_id: &str,
        app_key: &str,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            app_id: app_id.to_string(),
            app_key: app_key.to_string(),
            poll_interval,
            timeout,
        })
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("app_id", &self.app_id)
            .header("app_key", &self.app_key)
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("conversion service error {}: {}", status, body);
        }
        Ok(resp)
    }

    async fn upload(&self, name: &str, data: Vec<u8>) -> Result<String> {
        let part = Part::bytes(data)
            .file_name(name.to_string())
            .mime_str("application/pdf")?;
        let form = Form::new().part("file", part);

        let resp = self
            .send(self.request(reqwest::Method::POST, &self.api_url).multipart(form))
            .await?;
        let upload: UploadResponse = resp
            .json()
            .await
            .context("Invalid upload response from conversion service")?;

        if !upload.error.is_empty() {
            let info = upload.error_info.unwrap_or_default();
            bail!(
                "conversion service rejected upload: {} ({}: {})",
                upload.error,
                info.id,
                info.message
            );
        }
        if upload.pdf_id.is_empty() {
            bail!("conversion service returned no job id");
        }
        Ok(upload.pdf_id)
    }

    fn timed_out(&self, job_id: &str) -> anyhow::Error {
        PipelineError::ConversionTimeout {
            job_id: job_id.to_string(),
            timeout_secs: self.timeout.as_secs(),
        }
        .into()
    }

    async fn before<T>(
        &self,
        deadline: Instant,
        job_id: &str,
        step: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout_at(deadline, step).await {
            Ok(result) => result,
            Err(_) => Err(self.timed_out(job_id)),
        }
    }

    async fn poll_status(&self, url: &str) -> Result<PollResponse> {
        let resp = self.send(self.request(reqwest::Method::GET, url)).await?;
        resp.json()
            .await
            .context("Invalid status response from conversion service")
    }

    async fn wait_for_completion(&self, job_id: &str, deadline: Instant) -> Result<()> {
        let url = format!("{}/{}", self.api_url, job_id);

        loop {
            let poll = self.before(deadline, job_id, self.poll_status(&url)).await?;
            debug!(job_id, status = %poll.status, "conversion status");

            match poll.status.as_str() {
                "completed" => return Ok(()),
                "error" => {
                    return Err(PipelineError::ConversionFailed {
                        job_id: job_id.to_string(),
                        reason: "service reported an error".to_string(),
                    }
                    .into())
                }
                _ => {}
            }

            if Instant::now() + self.poll_interval > deadline {
                return Err(self.timed_out(job_id));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn fetch_markdown(&self, job_id: &str) -> Result<String> {
        let url = format!("{}/{}.md", self.api_url, job_id);
        let resp = self.send(self.request(reqwest::Method::GET, &url)).await?;
        Ok(resp.text().await?)
    }
}

#[async_trait]
impl Stage for OcrStage {
    fn name(&self) -> &str {
        "ocr"
    }

    async fn process(&self, doc: &SourceDocument, input: ByteStream) -> Result<ByteStream> {
        let data = read_stream(input)
            .await
            .context("Failed to read document for conversion")?;

        let deadline = Instant::now() + self.timeout;
        let job_id = self
            .before(deadline, "pending", self.upload(&doc.name, data))
            .await?;
        debug!(job_id = %job_id, "uploaded for conversion");

        self.wait_for_completion(&job_id, deadline).await?;
        let markdown = self
            .before(deadline, &job_id, self.fetch_markdown(&job_id))
            .await?;
        Ok(stream_from_bytes(markdown))
    }
}
