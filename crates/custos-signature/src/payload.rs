//! Signed payload formats.
//!
//! Both simple signing and sigstore payloads carry the same claims,
//! a manifest digest and a docker reference, in a `critical` section whose
//! keys are checked exactly. They differ only in the type string and in
//! whether `optional` may be `null`.

use serde::Serialize;
use serde_json::json;

use crate::digest::Digest;
use crate::error::SignatureError;
use crate::json::{self, JsonObject, JsonValue};

/// Type string of simple signing payloads.
pub const SIMPLE_SIGNING_TYPE: &str = "atomic container signature";
/// Type string of sigstore payloads.
pub const SIGSTORE_TYPE: &str = "cosign container image signature";

/// Which payload dialect to encode or decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    /// OpenPGP simple signing.
    SimpleSigning,
    /// Sigstore / cosign.
    Sigstore,
}

impl PayloadFormat {
    /// The `critical.type` string of this format.
    #[must_use]
    pub fn type_string(self) -> &'static str {
        match self {
            Self::SimpleSigning => SIMPLE_SIGNING_TYPE,
            Self::Sigstore => SIGSTORE_TYPE,
        }
    }
}

/// A verified signature: the claims of a payload whose cryptographic
/// signature and acceptance rules have all passed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Signature {
    /// The manifest digest the signer vouched for.
    #[serde(rename = "docker-manifest-digest", serialize_with = "serialize_display")]
    pub docker_manifest_digest: Digest,
    /// The reference the signer vouched for, as written in the payload.
    #[serde(rename = "docker-reference")]
    pub docker_reference: String,
}

fn serialize_display<S: serde::Serializer>(d: &Digest, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(d)
}

/// The claims of a payload that has not been verified yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UntrustedPayload {
    /// Claimed manifest digest.
    pub docker_manifest_digest: Digest,
    /// Claimed docker reference.
    pub docker_reference: String,
    /// Free-form creator string, if present.
    pub creator: Option<String>,
    /// Creation time in seconds since the epoch, if present.
    pub timestamp: Option<i64>,
}

impl UntrustedPayload {
    /// A payload for `digest` and `reference` stamped with this crate's
    /// creator string and the current time.
    #[must_use]
    pub fn new(docker_manifest_digest: Digest, docker_reference: impl Into<String>) -> Self {
        Self {
            docker_manifest_digest,
            docker_reference: docker_reference.into(),
            creator: Some(format!("custos {}", env!("CARGO_PKG_VERSION"))),
            timestamp: Some(chrono::Utc::now().timestamp()),
        }
    }

    /// Serialize as `format`.
    ///
    /// # Errors
    ///
    /// Fails if the digest or reference is empty.
    pub fn encode(&self, format: PayloadFormat) -> Result<Vec<u8>, SignatureError> {
        if self.docker_reference.is_empty() {
            return Err(SignatureError::invalid("Unexpected empty signature content"));
        }
        let mut optional = serde_json::Map::new();
        if let Some(creator) = &self.creator {
            optional.insert("creator".to_owned(), json!(creator));
        }
        if let Some(ts) = self.timestamp {
            optional.insert("timestamp".to_owned(), json!(ts));
        }
        let doc = json!({
            "critical": {
                "type": format.type_string(),
                "image": {"docker-manifest-digest": self.docker_manifest_digest.to_string()},
                "identity": {"docker-reference": self.docker_reference},
            },
            "optional": optional,
        });
        Ok(serde_json::to_vec(&doc)?)
    }

    /// Strictly decode `data` as `format`.
    ///
    /// # Errors
    ///
    /// Returns [`SignatureError::InvalidSignature`] for any structural
    /// deviation: duplicate or unexpected keys in `critical`, a wrong type
    /// string, a malformed digest or a non-integer timestamp.
    pub fn decode(data: &[u8], format: PayloadFormat) -> Result<Self, SignatureError> {
        let top = json::parse_object(data).map_err(|e| SignatureError::invalid(e.0))?;
        decode_object(&top, format).map_err(|e| match e {
            SignatureError::JsonFormat(e) => SignatureError::InvalidSignature(e.0),
            other => other,
        })
    }
}

fn decode_object(top: &JsonObject, format: PayloadFormat) -> Result<UntrustedPayload, SignatureError> {
    top.exact_fields(&["critical", "optional"])?;

    let mut creator = None;
    let mut timestamp = None;
    match top.required("optional")? {
        JsonValue::Null if format == PayloadFormat::Sigstore => {}
        JsonValue::Object(optional) => {
            creator = optional.optional_string("creator")?.map(str::to_owned);
            timestamp = optional.get("timestamp").map(integral_timestamp).transpose()?;
        }
        other => {
            return Err(SignatureError::invalid(format!(
                "Field optional is not a JSON object (got {})",
                other.kind()
            )));
        }
    }

    let critical = top.object("critical")?;
    critical.exact_fields(&["type", "image", "identity"])?;
    let kind = critical.string("type")?;
    if kind != format.type_string() {
        return Err(SignatureError::invalid(format!(
            "Unrecognized signature type {kind}"
        )));
    }

    let image = critical.object("image")?;
    image.exact_fields(&["docker-manifest-digest"])?;
    let digest = Digest::parse(image.string("docker-manifest-digest")?)
        .map_err(|e| SignatureError::invalid(e.to_string()))?;

    let identity = critical.object("identity")?;
    identity.exact_fields(&["docker-reference"])?;
    let reference = identity.string("docker-reference")?;

    Ok(UntrustedPayload {
        docker_manifest_digest: digest,
        docker_reference: reference.to_owned(),
        creator,
        timestamp,
    })
}

#[expect(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    reason = "the round-trip equality check rejects lossy conversions"
)]
fn integral_timestamp(value: &JsonValue) -> Result<i64, SignatureError> {
    let not_integer = || SignatureError::invalid("Field optional.timestamp is not an integer");
    let JsonValue::Number(n) = value else {
        return Err(not_integer());
    };
    if let Some(i) = n.as_i64() {
        return Ok(i);
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && (f as i64) as f64 == f => Ok(f as i64),
        _ => Err(not_integer()),
    }
}

/// Checks applied to a cryptographically verified payload before it is
/// accepted as a [`Signature`].
///
/// The error type lets callers report rejections in their own vocabulary;
/// decoding failures arrive through `From<SignatureError>`.
pub trait AcceptanceRules {
    /// Error produced by the rules.
    type Error: From<SignatureError>;

    /// Accept or reject the identity of the key that made the signature.
    ///
    /// # Errors
    ///
    /// Rejects identities the caller does not trust.
    fn validate_key_identity(&self, _key_identity: &str) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Accept or reject the signed docker reference.
    ///
    /// # Errors
    ///
    /// Rejects references that do not match the image.
    fn validate_signed_docker_reference(&self, reference: &str) -> Result<(), Self::Error>;

    /// Accept or reject the signed manifest digest.
    ///
    /// # Errors
    ///
    /// Rejects digests that do not match the image's manifest.
    fn validate_signed_docker_manifest_digest(&self, digest: &Digest) -> Result<(), Self::Error>;
}

/// Decode a verified payload and run the digest, then reference, rules.
///
/// # Errors
///
/// Propagates decoding failures and rule rejections.
pub fn accept_payload<R: AcceptanceRules>(
    verified: &[u8],
    format: PayloadFormat,
    rules: &R,
) -> Result<Signature, R::Error> {
    let payload = UntrustedPayload::decode(verified, format)?;
    rules.validate_signed_docker_manifest_digest(&payload.docker_manifest_digest)?;
    rules.validate_signed_docker_reference(&payload.docker_reference)?;
    Ok(Signature {
        docker_manifest_digest: payload.docker_manifest_digest,
        docker_reference: payload.docker_reference,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest() -> Digest {
        Digest::sha256(b"manifest")
    }

    fn valid_doc(kind: &str) -> serde_json::Value {
        json!({
            "critical": {
                "type": kind,
                "image": {"docker-manifest-digest": digest().to_string()},
                "identity": {"docker-reference": "example.com/ns/repo:tag"},
            },
            "optional": {"creator": "someone", "timestamp": 1_700_000_000},
        })
    }

    fn decode_value(v: &serde_json::Value, format: PayloadFormat) -> Result<UntrustedPayload, SignatureError> {
        UntrustedPayload::decode(&serde_json::to_vec(v).expect("serialize"), format)
    }

    #[test]
    fn encode_decode_simple_signing() {
        let p = UntrustedPayload::new(digest(), "example.com/ns/repo:tag");
        let bytes = p.encode(PayloadFormat::SimpleSigning).expect("encode");
        let back = UntrustedPayload::decode(&bytes, PayloadFormat::SimpleSigning).expect("decode");
        assert_eq!(back, p);
        assert!(UntrustedPayload::decode(&bytes, PayloadFormat::Sigstore).is_err());
    }

    #[test]
    fn decodes_valid_documents() {
        let p = decode_value(&valid_doc(SIMPLE_SIGNING_TYPE), PayloadFormat::SimpleSigning)
            .expect("decode");
        assert_eq!(p.docker_reference, "example.com/ns/repo:tag");
        assert_eq!(p.creator.as_deref(), Some("someone"));
        assert_eq!(p.timestamp, Some(1_700_000_000));
    }

    #[test]
    fn sigstore_allows_null_optional_and_unknown_optional_keys() {
        let mut v = valid_doc(SIGSTORE_TYPE);
        v["optional"] = serde_json::Value::Null;
        let p = decode_value(&v, PayloadFormat::Sigstore).expect("null optional");
        assert_eq!(p.creator, None);

        v["optional"] = json!({"com.example.annotation": "x"});
        assert!(decode_value(&v, PayloadFormat::Sigstore).is_ok());

        let mut simple = valid_doc(SIMPLE_SIGNING_TYPE);
        simple["optional"] = serde_json::Value::Null;
        assert!(decode_value(&simple, PayloadFormat::SimpleSigning).is_err());
    }

    #[test]
    fn rejects_structural_deviations() {
        type Breaker = fn(&mut serde_json::Value);
        let breakers: Vec<Breaker> = vec![
            |v: &mut serde_json::Value| v["unexpected"] = json!(1),
            |v: &mut serde_json::Value| {
                v.as_object_mut().expect("object").remove("optional");
            },
            |v: &mut serde_json::Value| {
                v.as_object_mut().expect("object").remove("critical");
            },
            |v: &mut serde_json::Value| v["critical"]["unexpected"] = json!(1),
            |v: &mut serde_json::Value| v["critical"]["type"] = json!("something else"),
            |v: &mut serde_json::Value| v["critical"]["type"] = json!(1),
            |v: &mut serde_json::Value| v["critical"]["image"]["extra"] = json!(1),
            |v: &mut serde_json::Value| v["critical"]["image"]["docker-manifest-digest"] = json!("sha256:nope"),
            |v: &mut serde_json::Value| v["critical"]["identity"]["extra"] = json!(1),
            |v: &mut serde_json::Value| v["critical"]["identity"]["docker-reference"] = json!(1),
            |v: &mut serde_json::Value| v["optional"]["creator"] = json!(1),
            |v: &mut serde_json::Value| v["optional"]["timestamp"] = json!(1.5),
            |v: &mut serde_json::Value| v["optional"]["timestamp"] = json!("now"),
            |v: &mut serde_json::Value| v["optional"] = json!([]),
        ];
        for (i, brk) in breakers.into_iter().enumerate() {
            let mut v = valid_doc(SIMPLE_SIGNING_TYPE);
            brk(&mut v);
            assert!(
                decode_value(&v, PayloadFormat::SimpleSigning).is_err(),
                "breaker {i} should fail"
            );
        }
    }

    #[test]
    fn rejects_duplicate_keys() {
        let doc = format!(
            r#"{{"critical": {{"type": "{SIMPLE_SIGNING_TYPE}", "type": "{SIMPLE_SIGNING_TYPE}", "image": {{"docker-manifest-digest": "{}"}}, "identity": {{"docker-reference": "a/b"}}}}, "optional": {{}}}}"#,
            digest()
        );
        assert!(UntrustedPayload::decode(doc.as_bytes(), PayloadFormat::SimpleSigning).is_err());
    }

    #[test]
    fn integral_float_timestamp_is_accepted() {
        let mut v = valid_doc(SIMPLE_SIGNING_TYPE);
        v["optional"]["timestamp"] = json!(12.0);
        let p = decode_value(&v, PayloadFormat::SimpleSigning).expect("decode");
        assert_eq!(p.timestamp, Some(12));
    }

    struct Expect {
        digest: Digest,
        reference: &'static str,
    }

    impl AcceptanceRules for Expect {
        type Error = SignatureError;

        fn validate_signed_docker_reference(&self, reference: &str) -> Result<(), SignatureError> {
            if reference == self.reference {
                Ok(())
            } else {
                Err(SignatureError::invalid(format!("reference {reference}")))
            }
        }

        fn validate_signed_docker_manifest_digest(&self, digest: &Digest) -> Result<(), SignatureError> {
            if *digest == self.digest {
                Ok(())
            } else {
                Err(SignatureError::invalid(format!("digest {digest}")))
            }
        }
    }

    #[test]
    fn accept_payload_applies_rules() {
        let bytes = serde_json::to_vec(&valid_doc(SIMPLE_SIGNING_TYPE)).expect("serialize");
        let ok = Expect {
            digest: digest(),
            reference: "example.com/ns/repo:tag",
        };
        let sig = accept_payload(&bytes, PayloadFormat::SimpleSigning, &ok).expect("accepted");
        assert_eq!(sig.docker_manifest_digest, digest());

        let wrong_ref = Expect {
            digest: digest(),
            reference: "example.com/other:tag",
        };
        let err = accept_payload(&bytes, PayloadFormat::SimpleSigning, &wrong_ref)
            .expect_err("reference mismatch");
        assert!(err.to_string().contains("reference"));

        let wrong_digest = Expect {
            digest: Digest::sha256(b"other"),
            reference: "example.com/other:tag",
        };
        let err = accept_payload(&bytes, PayloadFormat::SimpleSigning, &wrong_digest)
            .expect_err("digest mismatch");
        assert!(err.to_string().contains("digest"), "digest is checked first: {err}");
    }
}
