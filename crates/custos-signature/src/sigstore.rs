//! Sigstore signatures and the untrusted signature container.
//!
//! A sigstore signature is an OCI attachment: an opaque payload plus a set
//! of annotations, one of which carries the base64 signature over the
//! payload. Certificates, chains and Rekor bundles travel in further
//! annotations and are interpreted by the policy engine.

use std::collections::BTreeMap;

use base64::Engine;
use serde::Serialize;

use crate::error::SignatureError;
use crate::json::{self, JsonValue};
use crate::keys::{LocalSigner, PublicKey};
use crate::payload::{AcceptanceRules, PayloadFormat, Signature, accept_payload};

/// MIME type of sigstore simple-signing payload attachments.
pub const SIGSTORE_SIGNATURE_MIME_TYPE: &str = "application/vnd.dev.cosign.simplesigning.v1+json";
/// Annotation holding the base64 signature over the payload.
pub const SIGNATURE_ANNOTATION: &str = "dev.cosignproject.cosign/signature";
/// Annotation holding the PEM leaf certificate.
pub const CERTIFICATE_ANNOTATION: &str = "dev.sigstore.cosign/certificate";
/// Annotation holding the PEM intermediate and root certificates.
pub const CHAIN_ANNOTATION: &str = "dev.sigstore.cosign/chain";
/// Annotation holding the Rekor signed entry timestamp bundle.
pub const SET_ANNOTATION: &str = "dev.sigstore.cosign/bundle";

/// Blob format tag of simple signing signatures.
const SIMPLE_SIGNING_FORMAT: &str = "simple-signing";
/// Blob format tag of sigstore signatures.
const SIGSTORE_FORMAT: &str = "sigstore-json";
/// Older name of [`SIGSTORE_FORMAT`], still accepted when reading.
const LEGACY_SIGSTORE_FORMAT: &str = "cosign-json";

/// An unverified sigstore attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SigstoreSignature {
    /// Claimed MIME type of the payload.
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    /// The payload that was (supposedly) signed.
    #[serde(serialize_with = "serialize_base64")]
    pub payload: Vec<u8>,
    /// Attachment annotations.
    pub annotations: BTreeMap<String, String>,
}

fn serialize_base64<S: serde::Serializer>(data: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(data))
}

impl SigstoreSignature {
    /// A signature over `payload` with the standard MIME type and
    /// `base64_signature` in the signature annotation.
    #[must_use]
    pub fn new(payload: Vec<u8>, base64_signature: String) -> Self {
        Self {
            mime_type: SIGSTORE_SIGNATURE_MIME_TYPE.to_owned(),
            payload,
            annotations: BTreeMap::from([(SIGNATURE_ANNOTATION.to_owned(), base64_signature)]),
        }
    }

    /// Look up an annotation.
    #[must_use]
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// Strictly decode the JSON representation
    /// `{"mimeType", "payload" (base64), "annotations"}`.
    ///
    /// # Errors
    ///
    /// Fails on duplicate or unknown keys, wrong types or invalid base64.
    pub fn from_json(data: &[u8]) -> Result<Self, SignatureError> {
        let obj = json::parse_object(data)?;
        obj.known_fields(&["mimeType", "payload", "annotations"])?;
        let mime_type = obj.string("mimeType")?.to_owned();
        let payload = base64::engine::general_purpose::STANDARD
            .decode(obj.string("payload")?)
            .map_err(|e| SignatureError::invalid(format!("invalid base64 payload: {e}")))?;

        let mut annotations = BTreeMap::new();
        match obj.get("annotations") {
            None | Some(JsonValue::Null) => {}
            Some(JsonValue::Object(map)) => {
                for (key, value) in map.iter() {
                    let value = value.as_str().ok_or_else(|| {
                        SignatureError::invalid(format!("annotation {key} is not a string"))
                    })?;
                    annotations.insert(key.to_owned(), value.to_owned());
                }
            }
            Some(other) => {
                return Err(SignatureError::invalid(format!(
                    "annotations is not a JSON object (got {})",
                    other.kind()
                )));
            }
        }
        Ok(Self {
            mime_type,
            payload,
            annotations,
        })
    }

    /// The JSON representation read by [`SigstoreSignature::from_json`].
    ///
    /// # Errors
    ///
    /// Propagates serialization failures.
    pub fn to_json(&self) -> Result<Vec<u8>, SignatureError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// A signature attached to an image, not yet verified in any way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UntrustedSignature {
    /// An inline-signed OpenPGP message.
    SimpleSigning(Vec<u8>),
    /// A sigstore attachment.
    Sigstore(SigstoreSignature),
}

impl UntrustedSignature {
    /// Short name of the signature kind, for logs and summaries.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SimpleSigning(_) => SIMPLE_SIGNING_FORMAT,
            Self::Sigstore(_) => SIGSTORE_FORMAT,
        }
    }

    /// Parse a stored signature blob.
    ///
    /// Blobs are `\0<format>\n<data>`. Bare OpenPGP messages, which start
    /// with a compressed data packet, are also recognized as simple
    /// signing.
    ///
    /// # Errors
    ///
    /// Fails for empty blobs, unknown formats and malformed sigstore JSON.
    pub fn from_blob(blob: &[u8]) -> Result<Self, SignatureError> {
        let Some((&first, rest)) = blob.split_first() else {
            return Err(SignatureError::invalid("empty signature blob"));
        };
        // OpenPGP compressed data packet, old (tag 8, 1-4 length bytes) or new format.
        if matches!(first, 0xA0..=0xA3 | 0xC8) {
            return Ok(Self::SimpleSigning(blob.to_vec()));
        }
        if first != 0 {
            return Err(SignatureError::invalid(format!(
                "unrecognized signature format, starting with binary {first:#04x}"
            )));
        }
        let Some(newline) = rest.iter().position(|&b| b == b'\n') else {
            return Err(SignatureError::invalid("invalid signature format, missing newline"));
        };
        let (format, data) = (&rest[..newline], &rest[newline + 1..]);
        if !format.iter().all(|b| b.is_ascii_graphic()) {
            return Err(SignatureError::invalid(
                "invalid signature format, non-ASCII byte in format name",
            ));
        }
        match std::str::from_utf8(format).unwrap_or_default() {
            SIMPLE_SIGNING_FORMAT => Ok(Self::SimpleSigning(data.to_vec())),
            SIGSTORE_FORMAT | LEGACY_SIGSTORE_FORMAT => {
                Ok(Self::Sigstore(SigstoreSignature::from_json(data)?))
            }
            other => Err(SignatureError::invalid(format!(
                "unrecognized signature format {other:?}"
            ))),
        }
    }

    /// Serialize for storage, readable by [`UntrustedSignature::from_blob`].
    ///
    /// # Errors
    ///
    /// Propagates JSON serialization failures.
    pub fn to_blob(&self) -> Result<Vec<u8>, SignatureError> {
        let (format, data) = match self {
            // Bare OpenPGP for compatibility with readers that predate format tags.
            Self::SimpleSigning(data) => return Ok(data.clone()),
            Self::Sigstore(sig) => (SIGSTORE_FORMAT, sig.to_json()?),
        };
        let mut blob = Vec::with_capacity(format.len() + data.len() + 2);
        blob.push(0);
        blob.extend_from_slice(format.as_bytes());
        blob.push(b'\n');
        blob.extend_from_slice(&data);
        Ok(blob)
    }
}

// ── Payload verification ─────────────────────────────────────────────

/// Verify `base64_signature` over `payload` with any of `keys`, then decode
/// the payload and apply `rules`.
///
/// The payload is only parsed after a key has verified the signature.
///
/// # Errors
///
/// Fails if `keys` is empty, no key verifies the signature, the payload is
/// malformed or a rule rejects it.
pub fn verify_sigstore_payload<R: AcceptanceRules>(
    keys: &[PublicKey],
    payload: &[u8],
    base64_signature: &str,
    rules: &R,
) -> Result<Signature, R::Error> {
    let signature = base64::engine::general_purpose::STANDARD
        .decode(base64_signature)
        .map_err(|e| SignatureError::invalid(format!("base64 decoding: {e}")))?;
    verify_blob_signature(keys, payload, &signature)?;
    accept_payload(payload, PayloadFormat::Sigstore, rules)
}

fn verify_blob_signature(
    keys: &[PublicKey],
    payload: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    if keys.is_empty() {
        return Err(SignatureError::invalid(
            "Need at least one public key to verify the sigstore payload, but got 0",
        ));
    }
    let mut failures = Vec::with_capacity(keys.len());
    for key in keys {
        match key.verify(payload, signature) {
            Ok(()) => return Ok(()),
            Err(e) => failures.push(e.to_string()),
        }
    }
    Err(SignatureError::invalid(format!(
        "cryptographic signature verification failed: {}",
        failures.join(", ")
    )))
}

/// Sign `payload` with `signer`, returning the base64 signature for
/// [`SIGNATURE_ANNOTATION`].
///
/// # Errors
///
/// Returns [`SignatureError::Key`] if signing fails.
pub fn sign_sigstore_payload(signer: &LocalSigner, payload: &[u8]) -> Result<String, SignatureError> {
    Ok(base64::engine::general_purpose::STANDARD.encode(signer.sign(payload)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::digest::Digest;
    use crate::payload::UntrustedPayload;

    struct AcceptAll;

    impl AcceptanceRules for AcceptAll {
        type Error = SignatureError;

        fn validate_signed_docker_reference(&self, _: &str) -> Result<(), SignatureError> {
            Ok(())
        }

        fn validate_signed_docker_manifest_digest(&self, _: &Digest) -> Result<(), SignatureError> {
            Ok(())
        }
    }

    fn signed_payload(signer: &LocalSigner) -> (Vec<u8>, String) {
        let payload = UntrustedPayload::new(Digest::sha256(b"manifest"), "example.com/app:v1")
            .encode(PayloadFormat::Sigstore)
            .expect("encode");
        let sig = sign_sigstore_payload(signer, &payload).expect("sign");
        (payload, sig)
    }

    #[test]
    fn verifies_with_any_key() {
        let signer = LocalSigner::generate().expect("generate");
        let other = LocalSigner::generate().expect("generate");
        let (payload, sig) = signed_payload(&signer);
        let keys = [
            other.public_key().expect("public"),
            signer.public_key().expect("public"),
        ];
        let accepted = verify_sigstore_payload(&keys, &payload, &sig, &AcceptAll).expect("verify");
        assert_eq!(accepted.docker_reference, "example.com/app:v1");
    }

    #[test]
    fn failures_are_joined() {
        let signer = LocalSigner::generate().expect("generate");
        let (payload, sig) = signed_payload(&signer);
        let keys = [
            LocalSigner::generate().expect("generate").public_key().expect("public"),
            LocalSigner::generate().expect("generate").public_key().expect("public"),
        ];
        let err = verify_sigstore_payload(&keys, &payload, &sig, &AcceptAll).expect_err("wrong keys");
        let msg = err.to_string();
        assert!(msg.starts_with("cryptographic signature verification failed: "), "{msg}");
        assert_eq!(msg.matches("invalid signature").count(), 2, "{msg}");
    }

    #[test]
    fn no_keys_and_bad_base64() {
        let signer = LocalSigner::generate().expect("generate");
        let (payload, sig) = signed_payload(&signer);
        assert!(verify_sigstore_payload(&[], &payload, &sig, &AcceptAll).is_err());
        let keys = [signer.public_key().expect("public")];
        let err = verify_sigstore_payload(&keys, &payload, "%%%", &AcceptAll).expect_err("base64");
        assert!(err.to_string().starts_with("base64 decoding"));
    }

    #[test]
    fn payload_is_parsed_only_after_verification() {
        let signer = LocalSigner::generate().expect("generate");
        let sig = sign_sigstore_payload(&signer, b"not json").expect("sign");
        let stranger = [LocalSigner::generate().expect("generate").public_key().expect("public")];
        let err = verify_sigstore_payload(&stranger, b"not json", &sig, &AcceptAll).expect_err("key");
        assert!(err.to_string().contains("cryptographic"), "{err}");

        let keys = [signer.public_key().expect("public")];
        let err = verify_sigstore_payload(&keys, b"not json", &sig, &AcceptAll).expect_err("json");
        assert!(!err.to_string().contains("cryptographic"), "{err}");
    }

    #[test]
    fn json_representation() {
        let sig = SigstoreSignature::new(b"payload".to_vec(), "c2ln".to_owned());
        let json = sig.to_json().expect("serialize");
        assert_eq!(SigstoreSignature::from_json(&json).expect("parse"), sig);
        assert_eq!(sig.annotation(SIGNATURE_ANNOTATION), Some("c2ln"));

        let no_annotations = br#"{"mimeType": "x", "payload": "cA=="}"#;
        let parsed = SigstoreSignature::from_json(no_annotations).expect("parse");
        assert!(parsed.annotations.is_empty());

        let dup = br#"{"mimeType": "x", "payload": "cA==", "payload": "cQ=="}"#;
        assert!(SigstoreSignature::from_json(dup).is_err());
        let bad = br#"{"mimeType": "x", "payload": "cA==", "annotations": {"a": 1}}"#;
        assert!(SigstoreSignature::from_json(bad).is_err());
    }

    #[test]
    fn blob_forms() {
        let sigstore = UntrustedSignature::Sigstore(SigstoreSignature::new(b"p".to_vec(), "cw==".to_owned()));
        let blob = sigstore.to_blob().expect("blob");
        assert!(blob.starts_with(b"\x00sigstore-json\n{"));
        assert_eq!(UntrustedSignature::from_blob(&blob).expect("parse"), sigstore);

        let legacy = [b"\x00cosign-json\n".as_slice(), &blob[15..]].concat();
        assert_eq!(UntrustedSignature::from_blob(&legacy).expect("legacy"), sigstore);

        let tagged = UntrustedSignature::from_blob(b"\x00simple-signing\nhello").expect("tagged");
        assert_eq!(tagged, UntrustedSignature::SimpleSigning(b"hello".to_vec()));
        let bare = UntrustedSignature::from_blob(b"\xa3\x01rest").expect("bare");
        assert_eq!(bare.kind(), "simple-signing");
    }

    #[test]
    fn invalid_blobs() {
        for blob in [
            b"".as_slice(),
            b"\xffsimple-signing\nhello",
            b"\x00simple-signing",
            b"\x00format\xffname\ndata",
            b"\x00unknown-format\ndata",
        ] {
            assert!(UntrustedSignature::from_blob(blob).is_err(), "{blob:?}");
        }
    }
}
