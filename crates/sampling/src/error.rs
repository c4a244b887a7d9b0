/// Errors that prevent any preview from being produced.
///
/// Structural problems inside the file are not errors: they degrade the
/// preview to an opaque text sample with a warning instead.
#[derive(Debug, thiserror::Error)]
pub enum AnalyzerError {
    /// The file could not be opened or read.
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The path does not point at a regular file.
    #[error("{0} is not a regular file")]
    NotAFile(String),
}
