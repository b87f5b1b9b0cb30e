//! Fulcio certificate verification.
//!
//! A Fulcio certificate binds an ephemeral signing key to an OIDC identity
//! for a few minutes. It is checked at the time Rekor recorded the
//! signature, not at the current time, so the certificate has long expired
//! by the time anyone verifies it.

use chrono::{DateTime, Utc};
use custos_signature::PublicKey;
use der::Decode as _;
use der::asn1::{ObjectIdentifier, Utf8StringRef};

use crate::certs::{ParsedCertificate, parse_leaf_certificate, verify_chain};
use crate::error::PolicyError;
use crate::trust_root::{FulcioTrustRoot, untrusted_intermediates};

/// OIDC issuer, raw string value (deprecated by Fulcio but still emitted).
const OID_ISSUER_V1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.1");
/// OIDC issuer, DER `UTF8String` value.
const OID_ISSUER_V2: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.8");

impl FulcioTrustRoot {
    /// Verify a Fulcio leaf certificate as of `at` and return its key.
    ///
    /// `chain_pem` is the untrusted chain attached to the signature; its
    /// last element is the root and is ignored in favor of the configured
    /// CA certificates.
    ///
    /// # Errors
    ///
    /// Fails if the chain does not verify, or the certificate was not
    /// issued to the required OIDC issuer and email.
    pub fn verify(
        &self,
        leaf_pem: &[u8],
        chain_pem: Option<&[u8]>,
        at: DateTime<Utc>,
    ) -> Result<PublicKey, PolicyError> {
        let intermediates = untrusted_intermediates(chain_pem)?;
        let leaf = parse_leaf_certificate(leaf_pem)?;
        verify_chain(&leaf, &intermediates, &self.ca_certificates, at)
            .map_err(|e| PolicyError::certificate(format!("verifying leaf certificate failed: {e}")))?;

        let issuer = oidc_issuer(&leaf)?;
        if issuer != self.oidc_issuer {
            return Err(PolicyError::certificate(format!(
                "Unexpected Fulcio OIDC issuer {issuer:?}, expected {:?}",
                self.oidc_issuer
            )));
        }
        let emails = leaf.email_addresses()?;
        if !emails.iter().any(|e| *e == self.subject_email) {
            return Err(PolicyError::certificate(format!(
                "Required email {} not found (got {emails:?})",
                self.subject_email
            )));
        }
        tracing::debug!(%issuer, email = %self.subject_email, "Fulcio certificate accepted");
        leaf.public_key()
    }
}

/// The OIDC issuer recorded in a Fulcio certificate.
fn oidc_issuer(cert: &ParsedCertificate) -> Result<String, PolicyError> {
    let mut v1 = None;
    let mut v2 = None;
    for ext in cert.extensions() {
        if ext.extn_id == OID_ISSUER_V1 {
            if v1.is_some() {
                return Err(PolicyError::certificate(
                    "Fulcio certificate has a duplicate OIDC issuer v1 extension",
                ));
            }
            let value = String::from_utf8(ext.extn_value.as_bytes().to_vec()).map_err(|_| {
                PolicyError::certificate("invalid UTF-8 in OIDC issuer v1 extension")
            })?;
            v1 = Some(value);
        } else if ext.extn_id == OID_ISSUER_V2 {
            if v2.is_some() {
                return Err(PolicyError::certificate(
                    "Fulcio certificate has a duplicate OIDC issuer v2 extension",
                ));
            }
            v2 = Some(decode_issuer_v2(ext.extn_value.as_bytes())?);
        }
    }

    match (v1.filter(|s| !s.is_empty()), v2.filter(|s| !s.is_empty())) {
        (Some(v1), Some(v2)) if v1 != v2 => Err(PolicyError::certificate(format!(
            "inconsistent OIDC issuer extension values: v1 {v1:?}, v2 {v2:?}"
        ))),
        (Some(issuer), _) | (None, Some(issuer)) => Ok(issuer),
        (None, None) => Err(PolicyError::certificate(
            "Fulcio certificate is missing the issuer extension",
        )),
    }
}

fn decode_issuer_v2(value: &[u8]) -> Result<String, PolicyError> {
    match Utf8StringRef::from_der(value) {
        Ok(s) => Ok(s.as_str().to_owned()),
        Err(e) if matches!(e.kind(), der::ErrorKind::TrailingData { .. }) => Err(
            PolicyError::certificate("invalid ASN.1 in OIDC issuer v2 extension, trailing data"),
        ),
        Err(e) => Err(PolicyError::certificate(format!(
            "invalid ASN.1 in OIDC issuer v2 extension: {e}"
        ))),
    }
}
