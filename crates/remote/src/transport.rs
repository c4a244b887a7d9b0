//! Progress stream transports.
//!
//! The channel manager only sees a [`ProgressTransport`]: something that
//! can be asked for a fresh stream of decoded [`ProgressMessage`]s. The
//! HTTP implementation reads server-sent events; tests plug in scripted
//! streams.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};

use bulkload_core::job::SourceFormat;

use crate::api::endpoint;
use crate::error::TransportError;
use crate::messages::ProgressMessage;
use crate::sse::SseParser;

/// A live progress stream. Ends with an `Err` item or `None` when the
/// connection is lost.
pub type ProgressStream =
    Pin<Box<dyn Stream<Item = Result<ProgressMessage, TransportError>> + Send>>;

/// Which progress stream to follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelTarget {
    pub format: SourceFormat,
    pub collection: String,
}

#[async_trait]
pub trait ProgressTransport: Send + Sync {
    /// Open a new stream. Each call is an independent connection.
    async fn connect(&self, target: &ChannelTarget) -> Result<ProgressStream, TransportError>;
}

/// Server-sent events over HTTP:
/// `GET {api_url}/upload-{format}/progress/{collection}`.
#[derive(Debug, Clone)]
pub struct SseTransport {
    client: reqwest::Client,
    api_url: String,
}

impl SseTransport {
    pub fn new(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into(),
        }
    }
}

#[async_trait]
impl ProgressTransport for SseTransport {
    async fn connect(&self, target: &ChannelTarget) -> Result<ProgressStream, TransportError> {
        let route = format!("upload-{}", target.format.path_segment());
        let url = endpoint(&self.api_url, &[route.as_str(), "progress", target.collection.as_str()])
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }

        tracing::debug!(collection = %target.collection, "Progress stream connected");

        let stream = async_stream::stream! {
            let mut parser = SseParser::new();
            let mut body = response.bytes_stream();

            while let Some(chunk) = body.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        yield Err(TransportError::Stream(e.to_string()));
                        return;
                    }
                };
                for frame in parser.feed(&bytes) {
                    if frame.data.trim().is_empty() {
                        continue;
                    }
                    match ProgressMessage::decode(&frame.data) {
                        Ok(message) => yield Ok(message),
                        Err(e) => {
                            tracing::warn!(error = %e, data = %frame.data, "Ignoring undecodable progress event");
                        }
                    }
                }
            }

            yield Err(TransportError::Closed);
        };

        Ok(Box::pin(stream))
    }
}
