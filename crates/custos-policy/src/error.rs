//! Error types for policy decoding and evaluation.

use std::path::PathBuf;

use custos_signature::SignatureError;
use custos_signature::json::JsonFormatError;

/// A policy document, or a requirement built in code, is malformed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid policy format: {0}")]
pub struct PolicyFormatError(pub String);

impl PolicyFormatError {
    pub(crate) fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<JsonFormatError> for PolicyFormatError {
    fn from(e: JsonFormatError) -> Self {
        Self(e.0)
    }
}

/// A requirement was evaluated and explicitly denied the image or
/// signature. The message is the human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct PolicyRequirementError(pub String);

impl PolicyRequirementError {
    pub(crate) fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Errors from policy evaluation.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// A requirement denied the image.
    #[error(transparent)]
    Requirement(#[from] PolicyRequirementError),

    /// The policy is malformed.
    #[error(transparent)]
    Format(#[from] PolicyFormatError),

    /// A signature could not be parsed or verified.
    #[error(transparent)]
    Signature(#[from] SignatureError),

    /// Reading key, certificate or policy material failed.
    #[error("failed to read {path}: {source}")]
    Io {
        /// The file that could not be read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Certificate parsing or chain verification failed.
    #[error("{0}")]
    Certificate(String),

    /// A Rekor signed entry timestamp did not verify.
    #[error("{0}")]
    Rekor(String),

    /// The policy context was used in the wrong state.
    #[error("{0}")]
    Context(String),

    /// The image could not provide its manifest or signatures.
    #[error("image error: {0}")]
    Image(String),

    /// A configuration file is malformed.
    #[error("invalid configuration {path}: {message}")]
    Config {
        /// The configuration file.
        path: PathBuf,
        /// What is wrong with it.
        message: String,
    },
}

impl PolicyError {
    /// Whether this error is an explicit policy denial rather than a
    /// failure to evaluate.
    #[must_use]
    pub fn is_denial(&self) -> bool {
        matches!(self, Self::Requirement(_))
    }

    pub(crate) fn denied(msg: impl Into<String>) -> Self {
        Self::Requirement(PolicyRequirementError::new(msg))
    }

    pub(crate) fn certificate(msg: impl Into<String>) -> Self {
        Self::Certificate(msg.into())
    }

    pub(crate) fn rekor(msg: impl Into<String>) -> Self {
        Self::Rekor(msg.into())
    }
}
