//! Error taxonomy shared by the store, the capture loop and the media pipeline.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────────────
    // Session store
    // ─────────────────────────────────────────────────────────────────────
    #[error("session already active (ID: {id})")]
    AlreadyActive { id: i64 },

    #[error("no active session")]
    NoActiveSession,

    #[error("session not found: {0}")]
    NotFound(i64),

    #[error("session store unavailable: {0}")]
    StoreUnavailable(#[from] rusqlite::Error),

    #[error("cannot read screenshot file {path}: {source}")]
    FileUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Timelapse
    // ─────────────────────────────────────────────────────────────────────
    #[error("video encoder not found (looked beside the executable and on PATH)")]
    EncoderUnavailable,

    #[error("need at least 2 screenshots to create a timelapse (have {count})")]
    InsufficientFrames { count: usize },

    #[error("encoder failed ({status}): {message}")]
    EncodingFailed { status: String, message: String },

    // ─────────────────────────────────────────────────────────────────────
    // Collaborators and ambient concerns
    // ─────────────────────────────────────────────────────────────────────
    #[error("{collaborator} failed: {message}")]
    CollaboratorFailure {
        collaborator: &'static str,
        message: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn capture(message: impl Into<String>) -> Self {
        Error::CollaboratorFailure {
            collaborator: "screen capture",
            message: message.into(),
        }
    }

    pub fn summarizer(message: impl Into<String>) -> Self {
        Error::CollaboratorFailure {
            collaborator: "summarizer",
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
