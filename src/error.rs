//! Error kinds surfaced to the host.
//!
//! Every failure that reaches a response carries one of the stable type
//! names returned by [`BridgeError::kind`]. Capability and config code
//! uses `anyhow`; those errors are wrapped into a variant at the point
//! where the bridge decides what they mean for the request.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("invalid request: {0}")]
    Protocol(String),

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("invalid params for {method}: {message}")]
    InvalidParams { method: String, message: String },

    #[error("failed to load indexing subsystem: {0:#}")]
    DependencyLoad(anyhow::Error),

    #[error("no content to encode: all sources were empty or unreadable")]
    EmptyContent,

    #[error("source unreadable ({source_label}): {message}")]
    SourceUnreadable {
        source_label: String,
        message: String,
    },

    #[error("memory bank not found: {}", .0.display())]
    ArtifactNotFound(PathBuf),

    #[error("encode failed: {0:#}")]
    Encode(anyhow::Error),

    #[error("rebuild failed, previous files restored: {0:#}")]
    Rebuild(anyhow::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for Result using BridgeError
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Stable name reported in the `type` / `error_type` response fields.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::Protocol(_) => "ProtocolError",
            BridgeError::UnknownMethod(_) => "UnknownMethod",
            BridgeError::InvalidParams { .. } => "InvalidParams",
            BridgeError::DependencyLoad(_) => "DependencyLoadFailure",
            BridgeError::EmptyContent => "EmptyContent",
            BridgeError::SourceUnreadable { .. } => "SourceUnreadable",
            BridgeError::ArtifactNotFound(_) => "ArtifactNotFound",
            BridgeError::Encode(_) => "EncodeFailure",
            BridgeError::Rebuild(_) => "RebuildFailure",
            BridgeError::Io(_) => "IoError",
            BridgeError::Internal(_) => "InternalError",
        }
    }

    pub fn source_unreadable(label: impl Into<String>, err: impl std::fmt::Display) -> Self {
        BridgeError::SourceUnreadable {
            source_label: label.into(),
            message: err.to_string(),
        }
    }
}

/// Text of a caught panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panicked".to_string()
    }
}
