//! Manifest digesting.
//!
//! Signatures bind to the digest of the image manifest. For docker
//! schema 1 manifests, which embed their own JWS signatures, the digest is
//! taken over the signed payload rather than the raw bytes.

use base64::Engine;
use serde::Deserialize;

use crate::digest::{Digest, DigestAlgorithm};
use crate::error::SignatureError;

/// Docker schema 1 signed manifest media type.
pub const DOCKER_V2_SCHEMA1_SIGNED_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";
/// Docker schema 1 manifest media type.
pub const DOCKER_V2_SCHEMA1_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v1+json";
/// Docker schema 2 manifest media type.
pub const DOCKER_V2_SCHEMA2_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v2+json";

#[derive(Deserialize)]
struct ManifestMeta {
    #[serde(rename = "mediaType", default)]
    media_type: Option<String>,
    #[serde(rename = "schemaVersion", default)]
    schema_version: Option<i64>,
}

#[derive(Deserialize)]
struct Schema1Signatures {
    #[serde(default)]
    signatures: Vec<Schema1Signature>,
}

#[derive(Deserialize)]
struct Schema1Signature {
    protected: String,
}

#[derive(Deserialize)]
struct ProtectedHeader {
    #[serde(rename = "formatLength")]
    format_length: usize,
    #[serde(rename = "formatTail")]
    format_tail: String,
}

fn is_schema1(manifest: &[u8]) -> bool {
    let Ok(meta) = serde_json::from_slice::<ManifestMeta>(manifest) else {
        return false;
    };
    match meta.media_type.as_deref() {
        Some(DOCKER_V2_SCHEMA1_MEDIA_TYPE | DOCKER_V2_SCHEMA1_SIGNED_MEDIA_TYPE) => true,
        Some(_) => false,
        None => meta.schema_version == Some(1),
    }
}

/// Strip the JWS signatures from a schema 1 manifest, returning the bytes
/// that were signed.
fn schema1_payload(manifest: &[u8]) -> Result<Vec<u8>, SignatureError> {
    let sigs: Schema1Signatures = serde_json::from_slice(manifest)
        .map_err(|e| SignatureError::Manifest(format!("parsing schema 1 signatures: {e}")))?;
    let Some(first) = sigs.signatures.first() else {
        // Unsigned schema 1 manifests are digested as-is.
        return Ok(manifest.to_vec());
    };
    let b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD;
    let header = b64
        .decode(first.protected.trim_end_matches('='))
        .map_err(|e| SignatureError::Manifest(format!("invalid protected header: {e}")))?;
    let header: ProtectedHeader = serde_json::from_slice(&header)
        .map_err(|e| SignatureError::Manifest(format!("invalid protected header: {e}")))?;
    let tail = b64
        .decode(header.format_tail.trim_end_matches('='))
        .map_err(|e| SignatureError::Manifest(format!("invalid formatTail: {e}")))?;
    let Some(head) = manifest.get(..header.format_length) else {
        return Err(SignatureError::Manifest(
            "formatLength exceeds manifest size".to_owned(),
        ));
    };
    let mut payload = head.to_vec();
    payload.extend_from_slice(&tail);
    Ok(payload)
}

fn digest_with(manifest: &[u8], algorithm: DigestAlgorithm) -> Result<Digest, SignatureError> {
    if is_schema1(manifest) {
        Ok(Digest::compute(algorithm, &schema1_payload(manifest)?))
    } else {
        Ok(Digest::compute(algorithm, manifest))
    }
}

/// Compute the SHA-256 digest identifying `manifest`.
///
/// # Errors
///
/// Returns [`SignatureError::Manifest`] for malformed schema 1 signatures.
pub fn digest(manifest: &[u8]) -> Result<Digest, SignatureError> {
    digest_with(manifest, DigestAlgorithm::Sha256)
}

/// Check whether `manifest` has the `expected` digest, computed with the
/// expected digest's own algorithm.
///
/// # Errors
///
/// Returns [`SignatureError::Manifest`] for malformed schema 1 signatures.
pub fn matches_digest(manifest: &[u8], expected: &Digest) -> Result<bool, SignatureError> {
    Ok(digest_with(manifest, expected.algorithm())? == *expected)
}
