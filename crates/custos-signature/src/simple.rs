//! Simple signing: OpenPGP-signed JSON payloads.
//!
//! A simple signing blob is an inline-signed OpenPGP message whose literal
//! data is an [`UntrustedPayload`] in the [`PayloadFormat::SimpleSigning`]
//! dialect.

use crate::digest::Digest;
use crate::error::SignatureError;
use crate::manifest;
use crate::mechanism::SigningMechanism;
use crate::payload::{AcceptanceRules, PayloadFormat, Signature, UntrustedPayload, accept_payload};
use crate::reference::ImageReference;

/// Create a simple signing blob binding `manifest` to `docker_reference`,
/// signed by `key_identity`.
///
/// # Errors
///
/// Fails if the manifest cannot be digested or the mechanism cannot sign.
pub fn sign_docker_manifest(
    manifest: &[u8],
    docker_reference: &str,
    mech: &dyn SigningMechanism,
    key_identity: &str,
) -> Result<Vec<u8>, SignatureError> {
    let digest = manifest::digest(manifest)?;
    let payload = UntrustedPayload::new(digest, docker_reference).encode(PayloadFormat::SimpleSigning)?;
    tracing::debug!(%docker_reference, %key_identity, "signing docker manifest");
    mech.sign(&payload, key_identity)
}

/// Verify `unverified` with `mech`, then apply `rules` to the signer and
/// the signed claims.
///
/// # Errors
///
/// Fails if the cryptographic signature does not verify, the payload is
/// malformed, or any rule rejects it.
pub fn verify_and_extract_signature<R: AcceptanceRules>(
    mech: &dyn SigningMechanism,
    unverified: &[u8],
    rules: &R,
) -> Result<Signature, R::Error> {
    let (signed, key_identity) = mech.verify(unverified)?;
    rules.validate_key_identity(&key_identity)?;
    accept_payload(&signed, PayloadFormat::SimpleSigning, rules)
}

struct ExactRules<'a> {
    manifest: &'a [u8],
    expected_reference: &'a str,
    expected_key_identity: &'a str,
}

impl AcceptanceRules for ExactRules<'_> {
    type Error = SignatureError;

    fn validate_key_identity(&self, key_identity: &str) -> Result<(), SignatureError> {
        if key_identity.eq_ignore_ascii_case(self.expected_key_identity) {
            Ok(())
        } else {
            Err(SignatureError::invalid(format!(
                "Signature by {key_identity} does not match expected fingerprint {}",
                self.expected_key_identity
            )))
        }
    }

    fn validate_signed_docker_reference(&self, reference: &str) -> Result<(), SignatureError> {
        if same_reference(reference, self.expected_reference) {
            Ok(())
        } else {
            Err(SignatureError::invalid(format!(
                "Docker reference {reference} does not match {}",
                self.expected_reference
            )))
        }
    }

    fn validate_signed_docker_manifest_digest(&self, digest: &Digest) -> Result<(), SignatureError> {
        if manifest::matches_digest(self.manifest, digest)? {
            Ok(())
        } else {
            Err(SignatureError::invalid(format!(
                "Docker manifest digest {digest} does not match {}",
                manifest::digest(self.manifest)?
            )))
        }
    }
}

/// References are compared in normalized form when both parse, so that
/// `busybox` and `docker.io/library/busybox` are the same image.
fn same_reference(signed: &str, expected: &str) -> bool {
    match (
        ImageReference::parse_normalized(signed),
        ImageReference::parse_normalized(expected),
    ) {
        (Ok(a), Ok(b)) => a == b,
        _ => signed == expected,
    }
}

/// Verify a standalone simple signing blob against a known manifest,
/// reference and signer.
///
/// # Errors
///
/// Fails with a descriptive [`SignatureError::InvalidSignature`] for a
/// different signer, reference or manifest digest.
pub fn verify_docker_manifest_signature(
    unverified_signature: &[u8],
    unverified_manifest: &[u8],
    expected_docker_reference: &str,
    mech: &dyn SigningMechanism,
    expected_key_identity: &str,
) -> Result<Signature, SignatureError> {
    let rules = ExactRules {
        manifest: unverified_manifest,
        expected_reference: expected_docker_reference,
        expected_key_identity,
    };
    verify_and_extract_signature(mech, unverified_signature, &rules)
}
