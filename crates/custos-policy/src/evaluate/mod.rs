//! Evaluating single requirements.
//!
//! Every requirement answers two questions: whether one signature's author
//! is accepted ([`PolicyRequirement::is_signature_author_accepted`]), and
//! whether the image may run at all
//! ([`PolicyRequirement::is_running_image_allowed`]). Requirements that
//! look at signatures allow an image as soon as any one signature is
//! accepted.

mod base_layer;
mod signed_by;
mod sigstore;

use custos_signature::{AcceptanceRules, Digest, Signature, UntrustedSignature, manifest};

use crate::error::PolicyError;
use crate::image::UnparsedImage;
use crate::types::{PolicyReferenceMatch, PolicyRequirement};

const REJECT_SIGNATURES: &str = "Any signatures for these images are rejected by policy.";
const REJECT_RUNNING: &str = "Running these images is rejected by policy.";

/// One requirement's verdict on one signature.
#[derive(Debug)]
pub enum SignatureAcceptance {
    /// The signature is valid and trusted; its verified contents.
    Accepted(Signature),
    /// The signature is not acceptable, and why.
    Rejected(PolicyError),
    /// The requirement does not judge signatures.
    Unknown,
}

impl SignatureAcceptance {
    /// Returns `true` if the signature was accepted.
    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

impl From<Result<Signature, PolicyError>> for SignatureAcceptance {
    fn from(result: Result<Signature, PolicyError>) -> Self {
        match result {
            Ok(signature) => Self::Accepted(signature),
            Err(e) => Self::Rejected(e),
        }
    }
}

impl PolicyRequirement {
    /// Judge whether `signature`, attached to `image`, was made by an
    /// author this requirement trusts.
    pub fn is_signature_author_accepted(
        &self,
        image: &dyn UnparsedImage,
        signature: &UntrustedSignature,
    ) -> SignatureAcceptance {
        match self {
            Self::InsecureAcceptAnything => SignatureAcceptance::Unknown,
            Self::Reject => SignatureAcceptance::Rejected(PolicyError::denied(REJECT_SIGNATURES)),
            Self::SignedBy(req) => req.is_signature_author_accepted(image, signature),
            Self::SignedBaseLayer(req) => req.is_signature_author_accepted(image, signature),
            Self::SigstoreSigned(req) => req.is_signature_author_accepted(image, signature),
        }
    }

    /// Decide whether `image` may run as far as this requirement is
    /// concerned.
    ///
    /// # Errors
    ///
    /// A [`PolicyError::Requirement`] explains a denial; other variants
    /// mean the requirement could not be evaluated, which also denies.
    pub fn is_running_image_allowed(&self, image: &dyn UnparsedImage) -> Result<(), PolicyError> {
        match self {
            Self::InsecureAcceptAnything => Ok(()),
            Self::Reject => Err(PolicyError::denied(REJECT_RUNNING)),
            Self::SignedBy(req) => req.is_running_image_allowed(image),
            Self::SignedBaseLayer(req) => req.is_running_image_allowed(image),
            Self::SigstoreSigned(req) => req.is_running_image_allowed(image),
        }
    }
}

// ── Payload rules ────────────────────────────────────────────────────

/// Checks a verified payload against the image it is attached to.
pub(crate) struct ImageRules<'a> {
    pub(crate) image: &'a dyn UnparsedImage,
    pub(crate) signed_identity: &'a PolicyReferenceMatch,
    /// Signer identities to accept; `None` skips the check.
    pub(crate) trusted_identities: Option<&'a [String]>,
}

impl AcceptanceRules for ImageRules<'_> {
    type Error = PolicyError;

    fn validate_key_identity(&self, key_identity: &str) -> Result<(), PolicyError> {
        match self.trusted_identities {
            Some(trusted) if !trusted.iter().any(|t| t == key_identity) => Err(PolicyError::denied(
                format!("Signature by key {key_identity} is not accepted"),
            )),
            _ => Ok(()),
        }
    }

    fn validate_signed_docker_reference(&self, reference: &str) -> Result<(), PolicyError> {
        if self
            .signed_identity
            .matches_docker_reference(self.image.reference(), reference)
        {
            Ok(())
        } else {
            Err(PolicyError::denied(format!(
                "Signature for identity {reference} is not accepted"
            )))
        }
    }

    fn validate_signed_docker_manifest_digest(&self, digest: &Digest) -> Result<(), PolicyError> {
        let bytes = self.image.manifest()?;
        if manifest::matches_digest(&bytes, digest)? {
            Ok(())
        } else {
            Err(PolicyError::denied(format!(
                "Signature for digest {digest} does not match"
            )))
        }
    }
}

// ── Signature fan-out ────────────────────────────────────────────────

/// How a requirement classified one attached signature.
pub(crate) enum Candidate {
    /// Accepted; the image may run.
    Accepted,
    /// Evaluated and rejected.
    Rejected(PolicyError),
    /// A signature of a format the requirement does not handle.
    OtherFormat,
    /// An attachment of the right format that is not a signature.
    NotASignature,
}

/// Names of the ignored attachment classes, for the summary message.
pub(crate) struct IgnoredKinds {
    pub(crate) other_format: &'static str,
    pub(crate) not_a_signature: &'static str,
}

/// Allow the image if any signature is accepted, otherwise summarize why
/// none was.
pub(crate) fn require_accepted_signature(
    signatures: &[UntrustedSignature],
    ignored: &IgnoredKinds,
    mut evaluate: impl FnMut(&UntrustedSignature) -> Candidate,
) -> Result<(), PolicyError> {
    let mut rejections = Vec::new();
    let mut other_format = 0_usize;
    let mut not_a_signature = 0_usize;
    for signature in signatures {
        match evaluate(signature) {
            Candidate::Accepted => return Ok(()),
            Candidate::Rejected(e) => rejections.push(e),
            Candidate::OtherFormat => other_format += 1,
            Candidate::NotASignature => not_a_signature += 1,
        }
    }
    Err(summarize_rejections(
        rejections,
        other_format,
        not_a_signature,
        ignored,
    ))
}

fn summarize_rejections(
    mut rejections: Vec<PolicyError>,
    other_format: usize,
    not_a_signature: usize,
    ignored: &IgnoredKinds,
) -> PolicyError {
    match rejections.len() {
        0 if other_format == 0 && not_a_signature == 0 => {
            PolicyError::denied("A signature was required, but no signature exists")
        }
        0 => PolicyError::denied(format!(
            "A signature was required, but no signature exists ({other_format} {}, {not_a_signature} {})",
            ignored.other_format, ignored.not_a_signature
        )),
        1 => rejections.remove(0),
        _ => {
            let reasons: Vec<String> = rejections.iter().map(ToString::to_string).collect();
            PolicyError::denied(format!(
                "None of the signatures were accepted, reasons: {}",
                reasons.join("; ")
            ))
        }
    }
}
