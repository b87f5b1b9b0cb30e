//! Matching the reference inside a signature against the image.
//!
//! Every failure to parse either side is "no match": a signature naming
//! garbage never identifies anything.

use custos_signature::ImageReference;

use crate::types::PolicyReferenceMatch;

impl PolicyReferenceMatch {
    /// Whether a signature claiming `signature_reference` identifies an
    /// image whose reference is `image`.
    ///
    /// `image` is the reference the image was pulled by; images without
    /// one only match the `exact*` matchers, which ignore it.
    #[must_use]
    pub fn matches_docker_reference(
        &self,
        image: Option<&ImageReference>,
        signature_reference: &str,
    ) -> bool {
        match self {
            Self::MatchExact => with_image(image, signature_reference, |intended, signature| {
                !intended.is_name_only()
                    && !signature.is_name_only()
                    && signature.to_string() == intended.to_string()
            }),
            Self::MatchRepoDigestOrExact => {
                with_image(image, signature_reference, repo_digest_or_exact)
            }
            Self::MatchRepository => with_image(image, signature_reference, |intended, signature| {
                signature.name() == intended.name()
            }),
            Self::ExactReference { docker_reference } => {
                let (Some(intended), Some(signature)) =
                    (parse(docker_reference), parse(signature_reference))
                else {
                    return false;
                };
                !intended.is_name_only()
                    && !signature.is_name_only()
                    && signature.to_string() == intended.to_string()
            }
            Self::ExactRepository { docker_repository } => {
                let (Some(intended), Some(signature)) =
                    (parse(docker_repository), parse(signature_reference))
                else {
                    return false;
                };
                signature.name() == intended.name()
            }
            Self::RemapIdentity {
                prefix,
                signed_prefix,
            } => with_image(image, signature_reference, |intended, signature| {
                match remap(intended, prefix, signed_prefix) {
                    Remapped::Unchanged => repo_digest_or_exact(intended, signature),
                    Remapped::To(remapped) => repo_digest_or_exact(&remapped, signature),
                    Remapped::Invalid => false,
                }
            }),
        }
    }
}

fn parse(s: &str) -> Option<ImageReference> {
    ImageReference::parse_normalized(s).ok()
}

fn with_image(
    image: Option<&ImageReference>,
    signature_reference: &str,
    matches: impl FnOnce(&ImageReference, &ImageReference) -> bool,
) -> bool {
    let Some(intended) = image else {
        tracing::debug!(
            %signature_reference,
            "docker reference match attempted on an image with no known docker reference"
        );
        return false;
    };
    parse(signature_reference).is_some_and(|signature| matches(intended, &signature))
}

/// Tagged images need the exact reference; digested images need the same
/// repository, since the digest itself is checked against the manifest.
fn repo_digest_or_exact(intended: &ImageReference, signature: &ImageReference) -> bool {
    if signature.is_name_only() {
        return false;
    }
    if intended.tag().is_some() {
        signature.to_string() == intended.to_string()
    } else if intended.digest().is_some() {
        signature.name() == intended.name()
    } else {
        false
    }
}

/// Outcome of rewriting an image reference for `remapIdentity`.
#[derive(Debug)]
enum Remapped {
    /// `prefix` does not apply; match the reference as is.
    Unchanged,
    To(ImageReference),
    /// The rewritten reference does not parse, so nothing can match it.
    Invalid,
}

/// Rewrite `prefix` at the start of `intended` to `signed_prefix`. The
/// prefix must end at a path component boundary.
fn remap(intended: &ImageReference, prefix: &str, signed_prefix: &str) -> Remapped {
    let name = intended.name();
    let Some(rest_of_name) = name.strip_prefix(prefix) else {
        return Remapped::Unchanged;
    };
    if !(rest_of_name.is_empty() || rest_of_name.starts_with('/')) {
        return Remapped::Unchanged;
    }
    let full = intended.to_string();
    let Some(rest) = full.strip_prefix(prefix) else {
        return Remapped::Unchanged;
    };
    let rewritten = format!("{signed_prefix}{rest}");
    match ImageReference::parse_normalized(&rewritten) {
        Ok(remapped) => Remapped::To(remapped),
        Err(e) => {
            tracing::debug!(%rewritten, error = %e, "remapped reference does not parse");
            Remapped::Invalid
        }
    }
}
