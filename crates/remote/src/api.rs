//! REST client for the ingestion service.
//!
//! Wraps `GET /collections` and the multipart `POST /upload-{format}/{collection}`
//! submission using [`reqwest`]. The file body is streamed from disk and
//! reports transfer progress as it goes.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::Url;
use tokio::sync::watch;
use tokio_util::io::ReaderStream;

use bulkload_core::collection::{Collection, CollectionList};
use bulkload_core::error::CoreError;
use bulkload_core::job::{FieldMappings, ImportJob, ParsingConfig, SourceFile, SourceFormat};

use crate::error::IngestApiError;

// ---------------------------------------------------------------------------
// Collaborator trait
// ---------------------------------------------------------------------------

/// The ingestion service as seen by the orchestrator.
#[async_trait]
pub trait IngestBackend: Send + Sync {
    /// List the collections a file can be imported into.
    async fn list_collections(&self) -> Result<Vec<Collection>, IngestApiError>;

    /// Submit a file for ingestion. Resolves once the service has
    /// answered the HTTP request; ingestion itself continues remotely.
    ///
    /// Dropping the returned future aborts the request.
    async fn submit(
        &self,
        request: &UploadRequest,
        progress: TransferProgress,
    ) -> Result<SubmitAck, IngestApiError>;
}

/// The service queued the work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitAck {
    pub status: u16,
}

// ---------------------------------------------------------------------------
// Upload request
// ---------------------------------------------------------------------------

/// Everything sent with one submission. Built from a validated job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub collection: String,
    pub source: SourceFile,
    pub parsing: ParsingConfig,
    pub field_mappings: FieldMappings,
}

impl UploadRequest {
    /// Freeze a job into a request. Fails with a configuration error when
    /// the job is not submittable.
    pub fn from_job(job: &ImportJob) -> Result<Self, CoreError> {
        let collection = job.check_submittable()?.to_string();
        Ok(Self {
            collection,
            source: job.source.clone(),
            parsing: job.parsing.clone(),
            field_mappings: job.field_mappings.clone(),
        })
    }

    pub fn format(&self) -> SourceFormat {
        self.parsing.format
    }

    /// Text fields of the multipart form, in send order.
    pub fn form_fields(&self) -> Result<Vec<(&'static str, String)>, serde_json::Error> {
        let parsing = &self.parsing;
        let mut fields = vec![
            ("encoding", parsing.encoding.clone()),
            ("batchSize", parsing.batch_size.to_string()),
        ];

        let mappings_field = match parsing.format {
            SourceFormat::Csv => {
                fields.push(("delimiter", parsing.delimiter.to_string()));
                fields.push(("hasHeader", parsing.has_header.to_string()));
                fields.push(("skipEmptyRows", parsing.skip_empty_rows.to_string()));
                "fieldMappings"
            }
            SourceFormat::Json => {
                fields.push(("rootPath", parsing.root_path.clone()));
                "pathMappings"
            }
        };

        if !self.field_mappings.is_empty() {
            fields.push((mappings_field, serde_json::to_string(&self.field_mappings)?));
        }

        Ok(fields)
    }

    fn mime(&self) -> &'static str {
        match self.parsing.format {
            SourceFormat::Csv => "text/csv",
            SourceFormat::Json => "application/json",
        }
    }
}

// ---------------------------------------------------------------------------
// Transfer progress
// ---------------------------------------------------------------------------

/// Reports upload progress as a percentage that never decreases.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    tx: Arc<watch::Sender<u8>>,
}

impl TransferProgress {
    pub fn channel() -> (Self, watch::Receiver<u8>) {
        let (tx, rx) = watch::channel(0);
        (Self { tx: Arc::new(tx) }, rx)
    }

    /// Record `sent` of `total` bytes transferred.
    pub fn report(&self, sent: u64, total: u64) {
        let percent = if total == 0 {
            100
        } else {
            (sent.min(total) * 100 / total) as u8
        };
        self.tx.send_if_modified(|current| {
            if percent > *current {
                *current = percent;
                true
            } else {
                false
            }
        });
    }

    pub fn complete(&self) {
        self.report(1, 1);
    }
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// HTTP client for one ingestion service.
#[derive(Debug, Clone)]
pub struct IngestApi {
    client: reqwest::Client,
    api_url: String,
}

impl IngestApi {
    /// * `api_url` - Base HTTP URL, e.g. `http://localhost:8000`.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Reuse an existing [`reqwest::Client`] (connection pool, timeouts).
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into(),
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    // ---- private helpers ----

    /// Turn a non-2xx response into [`IngestApiError::Rejected`], using the
    /// service's `detail`, `error` or `message` field when present.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, IngestApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        Err(IngestApiError::Rejected {
            status: status.as_u16(),
            message: rejection_message(&body, status),
        })
    }
}

#[async_trait]
impl IngestBackend for IngestApi {
    #[tracing::instrument(skip(self), fields(api_url = %self.api_url))]
    async fn list_collections(&self) -> Result<Vec<Collection>, IngestApiError> {
        let url = endpoint(&self.api_url, &["collections"])?;
        let response = self.client.get(url).send().await.map_err(classify)?;
        let response = Self::ensure_success(response).await?;
        let list: CollectionList = response.json().await?;

        tracing::debug!(count = list.collections.len(), "Loaded collections");
        Ok(list.collections)
    }

    #[tracing::instrument(
        skip(self, request, progress),
        fields(collection = %request.collection, format = %request.format(), file = %request.source.file_name),
    )]
    async fn submit(
        &self,
        request: &UploadRequest,
        progress: TransferProgress,
    ) -> Result<SubmitAck, IngestApiError> {
        let format = request.format();
        let route = format!("upload-{}", format.path_segment());
        let url = endpoint(&self.api_url, &[route.as_str(), request.collection.as_str()])?;

        let path = &request.source.path;
        let file_err = |source| IngestApiError::File {
            path: path.display().to_string(),
            source,
        };
        let file = tokio::fs::File::open(path).await.map_err(file_err)?;
        let total = file.metadata().await.map_err(file_err)?.len();

        let reporter = progress.clone();
        let mut sent = 0u64;
        let body = ReaderStream::new(file).map(move |chunk| {
            if let Ok(bytes) = &chunk {
                sent += bytes.len() as u64;
                reporter.report(sent, total);
            }
            chunk
        });

        let part = Part::stream_with_length(reqwest::Body::wrap_stream(body), total)
            .file_name(request.source.file_name.clone())
            .mime_str(request.mime())?;

        let mut form = Form::new().part("file", part);
        for (name, value) in request.form_fields()? {
            form = form.text(name, value);
        }

        tracing::info!(bytes = total, batch_size = request.parsing.batch_size, "Submitting upload");

        let response = self
            .client
            .post(url)
            .multipart(form)
            .send()
            .await
            .map_err(classify)?;
        let response = Self::ensure_success(response).await?;

        progress.complete();
        let status = response.status().as_u16();
        tracing::info!(status, "Upload accepted");

        Ok(SubmitAck { status })
    }
}

/// Build `base/seg1/seg2...`, percent-encoding each segment.
pub fn endpoint(base: &str, segments: &[&str]) -> Result<Url, IngestApiError> {
    let mut url = Url::parse(base).map_err(|e| IngestApiError::InvalidUrl(format!("{base}: {e}")))?;
    url.path_segments_mut()
        .map_err(|_| IngestApiError::InvalidUrl(format!("{base} cannot be a base URL")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Connection-level failures are transient; everything else is not.
fn classify(err: reqwest::Error) -> IngestApiError {
    if err.is_connect() || err.is_timeout() {
        IngestApiError::Offline(err.to_string())
    } else {
        IngestApiError::Request(err)
    }
}

fn rejection_message(body: &str, status: reqwest::StatusCode) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["detail", "error", "message"] {
            if let Some(text) = value.get(key).and_then(|v| v.as_str()) {
                return text.to_string();
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        trimmed.to_string()
    }
}
