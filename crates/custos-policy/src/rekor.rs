//! Rekor signed entry timestamps.
//!
//! A SET is the transparency log's signed promise that it recorded a
//! `hashedrekord` entry. Verifying one proves the signature existed at the
//! entry's integrated time, which is the time Fulcio certificates are
//! validated at. The entry is bound to the exact signature, payload hash
//! and key or certificate being evaluated.

use base64::Engine as _;
use chrono::{DateTime, Utc};
use custos_signature::PublicKey;
use custos_signature::json::{self, JsonObject};
use custos_signature::keys::parse_pem_blocks;
use sha2::{Digest as _, Sha256};

use crate::error::PolicyError;

const HASHEDREKORD_KIND: &str = "hashedrekord";
const HASHEDREKORD_VERSION: &str = "0.0.1";

/// Verify `set_bytes` with any of `keys` and check that it records
/// `base64_signature` over `payload` made by `key_or_cert_pem`.
///
/// Returns the time the log integrated the entry.
///
/// # Errors
///
/// Returns [`PolicyError::Rekor`] naming the first check that failed.
pub fn verify_rekor_set(
    keys: &[PublicKey],
    set_bytes: &[u8],
    key_or_cert_pem: &[u8],
    base64_signature: &str,
    payload: &[u8],
) -> Result<DateTime<Utc>, PolicyError> {
    let set = json::parse_object(set_bytes).map_err(|e| PolicyError::rekor(format!("invalid Rekor SET: {e}")))?;
    set.exact_fields(&["SignedEntryTimestamp", "Payload"])
        .map_err(|e| PolicyError::rekor(format!("invalid Rekor SET: {e}")))?;
    let set_signature = base64_field(&set, "SignedEntryTimestamp")?;
    let canonical = set
        .required("Payload")
        .map_err(|e| PolicyError::rekor(e.0))?
        .to_canonical_vec()
        .map_err(|e| PolicyError::rekor(e.0))?;

    verify_set_signature(keys, &canonical, &set_signature)?;

    let entry = json::parse_object(&canonical).map_err(|e| PolicyError::rekor(e.0))?;
    entry
        .exact_fields(&["body", "integratedTime", "logIndex", "logID"])
        .map_err(|e| PolicyError::rekor(format!("invalid Rekor SET payload: {e}")))?;
    let body = base64_field(&entry, "body")?;
    let integrated_time = entry.integer("integratedTime").map_err(|e| PolicyError::rekor(e.0))?;
    let log_index = entry.integer("logIndex").map_err(|e| PolicyError::rekor(e.0))?;
    entry.string("logID").map_err(|e| PolicyError::rekor(e.0))?;

    verify_hashedrekord(&body, key_or_cert_pem, base64_signature, payload)?;

    let integrated = DateTime::<Utc>::from_timestamp(integrated_time, 0).ok_or_else(|| {
        PolicyError::rekor(format!("integratedTime {integrated_time} is out of range"))
    })?;
    tracing::debug!(log_index, integrated_time = %integrated.to_rfc3339(), "Rekor SET verified");
    Ok(integrated)
}

fn verify_set_signature(keys: &[PublicKey], message: &[u8], signature: &[u8]) -> Result<(), PolicyError> {
    let mut failures = Vec::with_capacity(keys.len());
    for key in keys {
        match key.verify(message, signature) {
            Ok(()) => return Ok(()),
            Err(e) => failures.push(e.to_string()),
        }
    }
    Err(PolicyError::rekor(format!(
        "cryptographic signature verification of Rekor SET failed: {}",
        failures.join(", ")
    )))
}

fn base64_field(obj: &JsonObject, field: &str) -> Result<Vec<u8>, PolicyError> {
    let value = obj.string(field).map_err(|e| PolicyError::rekor(e.0))?;
    base64::engine::general_purpose::STANDARD
        .decode(value)
        .map_err(|e| PolicyError::rekor(format!("invalid base64 in \"{field}\": {e}")))
}

fn missing(field: &str) -> PolicyError {
    PolicyError::rekor(format!("Missing \"{field}\" field in hashedrekord"))
}

fn nested<'a>(obj: &'a JsonObject, key: &str, path: &str) -> Result<&'a JsonObject, PolicyError> {
    match obj.get(key) {
        None => Err(missing(path)),
        Some(v) => v
            .as_object()
            .ok_or_else(|| PolicyError::rekor(format!("\"{path}\" in hashedrekord is not an object"))),
    }
}

fn nested_str<'a>(obj: &'a JsonObject, key: &str, path: &str) -> Result<&'a str, PolicyError> {
    match obj.get(key) {
        None => Err(missing(path)),
        Some(v) => v
            .as_str()
            .ok_or_else(|| PolicyError::rekor(format!("\"{path}\" in hashedrekord is not a string"))),
    }
}

fn single_pem_der(data: &[u8], what: &str) -> Result<Vec<u8>, PolicyError> {
    let blocks = parse_pem_blocks(data)
        .map_err(|_| PolicyError::rekor(format!("{what} is not in PEM format")))?;
    let mut blocks = blocks.into_iter();
    let first = blocks
        .next()
        .ok_or_else(|| PolicyError::rekor(format!("{what} is not in PEM format")))?;
    if blocks.next().is_some() {
        return Err(PolicyError::rekor(format!("{what} has trailing data")));
    }
    Ok(first.der)
}

fn verify_hashedrekord(
    body: &[u8],
    key_or_cert_pem: &[u8],
    base64_signature: &str,
    payload: &[u8],
) -> Result<(), PolicyError> {
    let entry = json::parse_object(body).map_err(|e| PolicyError::rekor(format!("invalid Rekor entry: {e}")))?;
    let kind = nested_str(&entry, "kind", "kind")?;
    if kind != HASHEDREKORD_KIND {
        return Err(PolicyError::rekor(format!("Rekor entry is of unsupported kind {kind:?}")));
    }
    let version = nested_str(&entry, "apiVersion", "apiVersion")?;
    if version != HASHEDREKORD_VERSION {
        return Err(PolicyError::rekor(format!(
            "Rekor entry is of unsupported version {version:?}"
        )));
    }
    let spec = nested(&entry, "spec", "spec")?;

    let signature = nested(spec, "signature", "signature")?;
    let content = nested_str(signature, "content", "signature.content")?;
    let logged_signature = base64::engine::general_purpose::STANDARD
        .decode(content)
        .map_err(|e| PolicyError::rekor(format!("decoding signature.content base64: {e}")))?;
    let our_signature = base64::engine::general_purpose::STANDARD
        .decode(base64_signature)
        .map_err(|e| PolicyError::rekor(format!("decoding signature base64: {e}")))?;
    if logged_signature != our_signature {
        return Err(PolicyError::rekor("signature in Rekor SET does not match"));
    }

    let public_key = nested(signature, "publicKey", "signature.publicKey")?;
    let key_content = nested_str(public_key, "content", "signature.publicKey.content")?;
    let logged_pem = base64::engine::general_purpose::STANDARD
        .decode(key_content)
        .map_err(|e| PolicyError::rekor(format!("decoding signature.publicKey.content base64: {e}")))?;
    let logged_der = single_pem_der(&logged_pem, "publicKey in Rekor SET")?;
    let our_der = single_pem_der(key_or_cert_pem, "key or certificate")?;
    if logged_der != our_der {
        return Err(PolicyError::rekor("publicKey in Rekor SET does not match"));
    }

    let data = nested(spec, "data", "data")?;
    let hash = nested(data, "hash", "data.hash")?;
    let algorithm = nested_str(hash, "algorithm", "data.hash.algorithm")?;
    if algorithm != "sha256" {
        return Err(PolicyError::rekor(format!(
            "Unexpected \"data.hash.algorithm\" value {algorithm:?}"
        )));
    }
    let value = nested_str(hash, "value", "data.hash.value")?;
    let logged_hash = hex::decode(value)
        .map_err(|e| PolicyError::rekor(format!("Invalid \"data.hash.value\" field in hashedrekord: {e}")))?;
    if logged_hash.as_slice() != Sha256::digest(payload).as_slice() {
        return Err(PolicyError::rekor("payload in Rekor SET does not match"));
    }
    Ok(())
}
