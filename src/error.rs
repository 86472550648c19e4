//! Error types for the receipt pipeline.
//!
//! Only one failure mode is absorbed internally: an OCR response whose shape
//! does not match the configured wire format degrades to an empty line
//! sequence. Everything else is fatal for the receipt being processed:
//! the error propagates to the caller and nothing is persisted.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanError {
    /// Input image path does not exist. Raised before any work is performed.
    #[error("source image not found: '{path}'")]
    SourceNotFound { path: PathBuf },

    /// Input image exists but could not be read.
    #[error("could not read source image '{path}': {source}")]
    SourceUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// OCR service transport or HTTP failure. Shape mismatches are not
    /// errors; they degrade to an empty line sequence instead.
    #[error("OCR service error: {detail}")]
    OcrService { detail: String },

    /// Required environment configuration is absent.
    #[error("{var} not set in .env")]
    ConfigMissing { var: &'static str },

    /// OLLAMA_MODEL is absent or empty. Fatal for the extraction step.
    #[error("OLLAMA_MODEL is not set (empty). Check your .env file.")]
    ModelNotConfigured,

    /// The model service could not be reached, timed out, or answered with
    /// a non-success status. Never retried.
    #[error("model service is not reachable at {url} ({detail})")]
    ServiceUnreachable { url: String, detail: String },

    /// No parseable JSON object anywhere in the model output.
    #[error("malformed model response: {detail}")]
    MalformedResponse { detail: String },

    /// The model's JSON parsed but is not an object with an `extracted`
    /// object inside it.
    #[error("model response violates required schema: {detail}")]
    SchemaViolation { detail: String },

    /// Upsert was called without a content digest. Nothing is written.
    #[error("missing source_sha; ensure the pipeline set the content digest before upsert")]
    MissingDigest,

    /// A shared handle's lock was poisoned by a panic in another caller.
    #[error("internal lock poisoned")]
    LockPoisoned,

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
