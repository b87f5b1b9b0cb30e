//! Content digests in `algorithm:hex` form.

use std::fmt;

use sha2::{Digest as _, Sha256, Sha384, Sha512};

use crate::error::SignatureError;

/// A digest algorithm this crate can compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    /// SHA-256, the registry default.
    Sha256,
    /// SHA-384.
    Sha384,
    /// SHA-512.
    Sha512,
}

impl DigestAlgorithm {
    /// The algorithm name used in digest strings.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
        }
    }

    fn hex_len(self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Sha384 => 96,
            Self::Sha512 => 128,
        }
    }

    /// Hash `data` and return the lowercase hex encoding.
    #[must_use]
    pub fn hash_hex(self, data: &[u8]) -> String {
        match self {
            Self::Sha256 => hex::encode(Sha256::digest(data)),
            Self::Sha384 => hex::encode(Sha384::digest(data)),
            Self::Sha512 => hex::encode(Sha512::digest(data)),
        }
    }
}

/// A validated content digest, e.g. `sha256:4c3a…`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: DigestAlgorithm,
    hex: String,
}

impl Digest {
    /// Parse a digest string.
    ///
    /// # Errors
    ///
    /// Returns [`SignatureError::InvalidDigest`] for unknown algorithms,
    /// wrong lengths or non-lowercase-hex encodings.
    pub fn parse(s: &str) -> Result<Self, SignatureError> {
        let Some((alg, encoded)) = s.split_once(':') else {
            return Err(invalid(s, "missing algorithm separator"));
        };
        let algorithm = match alg {
            "sha256" => DigestAlgorithm::Sha256,
            "sha384" => DigestAlgorithm::Sha384,
            "sha512" => DigestAlgorithm::Sha512,
            other => return Err(invalid(s, &format!("unsupported digest algorithm {other}"))),
        };
        if encoded.len() != algorithm.hex_len() {
            return Err(invalid(s, "invalid encoded digest length"));
        }
        if !encoded.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(invalid(s, "encoded digest must be lowercase hex"));
        }
        Ok(Self {
            algorithm,
            hex: encoded.to_owned(),
        })
    }

    /// Compute the digest of `data` with `algorithm`.
    #[must_use]
    pub fn compute(algorithm: DigestAlgorithm, data: &[u8]) -> Self {
        Self {
            algorithm,
            hex: algorithm.hash_hex(data),
        }
    }

    /// Compute the SHA-256 digest of `data`.
    #[must_use]
    pub fn sha256(data: &[u8]) -> Self {
        Self::compute(DigestAlgorithm::Sha256, data)
    }

    /// The digest algorithm.
    #[must_use]
    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// The hex-encoded hash value.
    #[must_use]
    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.hex)
    }
}

impl std::str::FromStr for Digest {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn invalid(digest: &str, reason: &str) -> SignatureError {
    SignatureError::InvalidDigest {
        digest: digest.to_owned(),
        reason: reason.to_owned(),
    }
}
