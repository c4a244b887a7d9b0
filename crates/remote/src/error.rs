/// Errors from the ingestion REST endpoints.
#[derive(Debug, thiserror::Error)]
pub enum IngestApiError {
    /// The service could not be reached (DNS, refused connection, timeout).
    /// Transient: the job is not failed because of it.
    #[error("Ingestion service unreachable: {0}")]
    Offline(String),

    /// The service answered with a non-2xx status.
    #[error("Upload rejected ({status}): {message}")]
    Rejected {
        status: u16,
        message: String,
    },

    /// Any other HTTP-level failure.
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The local source file could not be read.
    #[error("Failed to read {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid service URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to encode form field: {0}")]
    Encode(#[from] serde_json::Error),
}

impl IngestApiError {
    /// Whether retrying later could succeed without operator action.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Offline(_))
    }

    /// A 4xx rejection: the request itself is wrong.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Rejected { status, .. } if (400..500).contains(status))
    }
}

/// Errors raised by a progress transport. All of them are recoverable
/// from the channel's point of view and drive its reconnect policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Progress endpoint returned HTTP {0}")]
    Status(u16),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Stream closed by server")]
    Closed,
}
