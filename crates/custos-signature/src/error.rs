//! Error types for signature formats and mechanisms.

use std::path::PathBuf;

/// Errors from parsing, signing or verifying container signatures.
#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    /// A docker reference could not be parsed.
    #[error("invalid reference `{reference}`: {reason}")]
    InvalidReference {
        /// The rejected input.
        reference: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A reference carries both a tag and a digest where only one is allowed.
    #[error("reference `{0}` has both a tag and a digest, which is not supported")]
    TagAndDigest(String),

    /// A content digest could not be parsed.
    #[error("invalid digest `{digest}`: {reason}")]
    InvalidDigest {
        /// The rejected input.
        digest: String,
        /// Why it was rejected.
        reason: String,
    },

    /// JSON was malformed or structurally unacceptable.
    #[error(transparent)]
    JsonFormat(#[from] crate::json::JsonFormatError),

    /// The signature blob or its payload is invalid.
    #[error("{0}")]
    InvalidSignature(String),

    /// Key material could not be parsed or used.
    #[error("key error: {0}")]
    Key(String),

    /// The OpenPGP engine reported a failure.
    #[error("OpenPGP error: {0}")]
    Mechanism(String),

    /// A manifest could not be digested.
    #[error("invalid manifest: {0}")]
    Manifest(String),

    /// Reading a file failed.
    #[error("failed to read {path}: {source}")]
    ReadFile {
        /// The file that could not be read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Other I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON syntax error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SignatureError {
    /// Shorthand for [`SignatureError::InvalidSignature`].
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidSignature(msg.into())
    }
}
