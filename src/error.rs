//! Error types shared by the orchestration layer and the guest agent client.

use std::fmt;

use thiserror::Error;

/// Top-level error for everything the library does.
#[derive(Debug, Error)]
pub enum VmError {
    /// Missing or invalid specification field, or a required file is absent.
    /// Always raised before the hypervisor is spawned.
    #[error("configuration error in `{field}`: {detail}")]
    Configuration { field: String, detail: String },

    /// An external tool failed or timed out while preparing a resource.
    #[error("provisioning {resource} failed at {step}: {diagnostic}")]
    Provisioning {
        resource: String,
        step: String,
        diagnostic: String,
    },

    /// The agent channel misbehaved.
    #[error("agent protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The guest agent answered with its own error descriptor.
    #[error("{class}: {desc}")]
    Guest { class: String, desc: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VmError {
    pub fn config(field: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            detail: detail.into(),
        }
    }

    pub fn provisioning(
        resource: impl fmt::Display,
        step: impl Into<String>,
        diagnostic: impl Into<String>,
    ) -> Self {
        Self::Provisioning {
            resource: resource.to_string(),
            step: step.into(),
            diagnostic: diagnostic.into(),
        }
    }
}

/// Failures of the request/response exchange itself, as opposed to errors
/// reported by the guest.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Nothing arrived before the quiescence window closed.
    #[error("peer disconnected")]
    Disconnected,

    /// The accumulated bytes were not a single JSON document.
    #[error("malformed reply: {0}")]
    Malformed(String),

    /// The reply was neither `{"return": …}` nor `{"error": …}`.
    #[error("invalid reply: {0}")]
    InvalidReply(String),

    /// A success payload did not have the shape the command promises.
    #[error("`{command}` expected {expected} reply, got {got}")]
    UnexpectedShape {
        command: String,
        expected: String,
        got: String,
    },
}

pub type Result<T> = std::result::Result<T, VmError>;
