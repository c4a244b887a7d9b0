//! Bounded file reads.

use std::path::Path;

use tokio::io::AsyncReadExt;

use crate::error::AnalyzerError;

/// Bytes read from a candidate file.
#[derive(Debug)]
pub struct FileSample {
    pub bytes: Vec<u8>,
    pub file_size: u64,
    /// Only a prefix was read.
    pub truncated: bool,
}

/// Read the whole file when it is at most `threshold` bytes, otherwise
/// only its first `prefix` bytes.
pub async fn read_sample(
    path: &Path,
    threshold: u64,
    prefix: u64,
) -> Result<FileSample, AnalyzerError> {
    let io_err = |source| AnalyzerError::Io {
        path: path.display().to_string(),
        source,
    };

    let file = tokio::fs::File::open(path).await.map_err(io_err)?;
    let metadata = file.metadata().await.map_err(io_err)?;
    if !metadata.is_file() {
        return Err(AnalyzerError::NotAFile(path.display().to_string()));
    }
    let file_size = metadata.len();

    let truncated = file_size > threshold;
    let limit = if truncated { prefix } else { file_size };

    let mut bytes = Vec::with_capacity(limit as usize);
    file.take(limit)
        .read_to_end(&mut bytes)
        .await
        .map_err(io_err)?;

    tracing::debug!(
        path = %path.display(),
        file_size,
        bytes_read = bytes.len(),
        truncated,
        "Read file sample",
    );

    Ok(FileSample {
        bytes,
        file_size,
        truncated,
    })
}
