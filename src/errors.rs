//! Typed error hierarchy for the webporizer bot.
//!
//! Four top-level enums cover the four failure surfaces:
//! - `StoreError`: remote versioned-store (GitHub) calls, fatal to a run
//! - `ConversionError`: a single file's transformation, recorded as data
//! - `RunFailure`: the cause carried by a failed pipeline run
//! - `WebhookError`: inbound delivery rejected before dispatch

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors from the remote versioned store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Reference {reference} already exists")]
    RefConflict { reference: String },

    #[error("Reference {reference} was updated concurrently: {message}")]
    StaleRef { reference: String, message: String },

    #[error("Invalid tree: {0}")]
    InvalidTree(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Remote call timed out after {}ms", .after.as_millis())]
    Timeout { after: Duration },

    #[error("GitHub API error: status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(String),
}

impl StoreError {
    /// HTTP-like status for logging, when one applies.
    pub fn status(&self) -> Option<u16> {
        match self {
            StoreError::RefConflict { .. }
            | StoreError::StaleRef { .. }
            | StoreError::InvalidTree(_)
            | StoreError::Validation(_) => Some(422),
            StoreError::NotFound(_) => Some(404),
            StoreError::Api { status, .. } => Some(*status),
            StoreError::Timeout { .. } | StoreError::Transport(_) => None,
        }
    }
}

/// Errors from converting a single asset.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode {path}: {message}")]
    Decode { path: PathBuf, message: String },

    #[error("Failed to encode {path}: {message}")]
    Encode { path: PathBuf, message: String },

    #[error("Unsupported asset {path}")]
    Unsupported { path: PathBuf },
}

/// Cause of a failed pipeline run.
#[derive(Debug, Error)]
pub enum RunFailure {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Working directory error: {0}")]
    Workspace(String),

    #[error("Transformation aborted: {0}")]
    Transform(String),
}

/// Reasons a webhook delivery is rejected before it reaches the pipeline.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Missing header {0}")]
    MissingHeader(&'static str),

    #[error("Webhook signature mismatch")]
    BadSignature,

    #[error("Invalid payload: {0}")]
    Payload(String),
}
