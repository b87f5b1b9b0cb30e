//! Choosing the requirement list that applies to an image.

use custos_signature::{ImageReference, SignatureError};

use crate::error::PolicyError;
use crate::types::{Policy, PolicyRequirements};

impl Policy {
    /// The requirements for an image with the given reference.
    ///
    /// Lookup is literal over the docker scopes, most specific first: the
    /// fully expanded reference (`latest` is added to name-only
    /// references), then the repository name, then each ancestor namespace
    /// down to the bare host, then the docker-wide `""` scope. If none is
    /// present, or the image has no reference, [`Policy::default`] applies.
    ///
    /// # Errors
    ///
    /// References with both a tag and a digest are not supported.
    pub fn requirements_for_image(
        &self,
        reference: Option<&ImageReference>,
    ) -> Result<&PolicyRequirements, PolicyError> {
        let Some(reference) = reference else {
            tracing::debug!("image has no docker reference, using default policy");
            return Ok(&self.default);
        };
        if reference.tag().is_some() && reference.digest().is_some() {
            return Err(SignatureError::TagAndDigest(reference.to_string()).into());
        }

        let full = reference.with_default_tag().to_string();
        if let Some(requirements) = self.specific.get(&full) {
            tracing::debug!(scope = %full, "using exact reference scope");
            return Ok(requirements);
        }

        let name = reference.name();
        let mut candidate = name.as_str();
        loop {
            if let Some(requirements) = self.specific.get(candidate) {
                tracing::debug!(scope = %candidate, "using namespace scope");
                return Ok(requirements);
            }
            match candidate.rfind('/') {
                Some(idx) => candidate = &candidate[..idx],
                None => break,
            }
        }

        if let Some(requirements) = self.specific.get("") {
            tracing::debug!(reference = %full, "using docker-wide default scope");
            return Ok(requirements);
        }
        tracing::debug!(reference = %full, "no scope matches, using default policy");
        Ok(&self.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PolicyRequirement;

    /// Each scope gets a distinguishable requirement list: `n` rejects.
    fn marker(n: usize) -> PolicyRequirements {
        vec![PolicyRequirement::Reject; n]
    }

    fn reference(s: &str) -> ImageReference {
        ImageReference::parse_normalized(s).expect("valid reference")
    }

    fn resolve(policy: &Policy, s: &str) -> usize {
        policy
            .requirements_for_image(Some(&reference(s)))
            .expect("resolve")
            .len()
    }

    fn policy() -> Policy {
        Policy::new(marker(1))
            .with_scope("example.com", marker(2))
            .with_scope("example.com/ns", marker(3))
            .with_scope("example.com/ns/repo", marker(4))
            .with_scope("example.com/ns/repo:tag", marker(5))
            .with_scope(
                "example.com/ns/repo@sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef",
                marker(6),
            )
            .with_scope("docker.io/library/busybox:latest", marker(7))
    }

    #[test]
    fn most_specific_scope_wins() {
        let p = policy();
        assert_eq!(resolve(&p, "example.com/ns/repo:tag"), 5);
        assert_eq!(
            resolve(
                &p,
                "example.com/ns/repo@sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef"
            ),
            6
        );
        assert_eq!(resolve(&p, "example.com/ns/repo:other"), 4);
        assert_eq!(resolve(&p, "example.com/ns/other:tag"), 3);
        assert_eq!(resolve(&p, "example.com/ns/deeper/repo:tag"), 3);
        assert_eq!(resolve(&p, "example.com/other:tag"), 2);
        assert_eq!(resolve(&p, "other.example.com/ns/repo:tag"), 1);
    }

    #[test]
    fn name_only_references_get_the_default_tag() {
        let p = policy();
        assert_eq!(resolve(&p, "busybox"), 7);
        assert_eq!(resolve(&p, "busybox:latest"), 7);
        assert_eq!(resolve(&p, "busybox:musl"), 1);
    }

    #[test]
    fn scopes_are_not_string_prefixes() {
        let p = Policy::new(marker(1)).with_scope("example.com/ns", marker(2));
        assert_eq!(resolve(&p, "example.com/ns2/repo:tag"), 1);
        assert_eq!(resolve(&p, "example.com/ns/repo:tag"), 2);
    }

    #[test]
    fn wildcard_scopes_are_literal() {
        let p = Policy::new(marker(1)).with_scope("*.example.com", marker(2));
        assert_eq!(resolve(&p, "registry.example.com/repo:tag"), 1);
    }

    #[test]
    fn docker_wide_scope_precedes_default() {
        let p = Policy::new(marker(1))
            .with_scope("", marker(2))
            .with_scope("example.com", marker(3));
        assert_eq!(resolve(&p, "example.com/repo:tag"), 3);
        assert_eq!(resolve(&p, "quay.io/repo:tag"), 2);
    }

    #[test]
    fn missing_reference_uses_default() {
        let p = policy();
        assert_eq!(p.requirements_for_image(None).expect("resolve").len(), 1);
    }

    #[test]
    fn tag_and_digest_is_an_error() {
        let r = reference(
            "example.com/ns/repo:tag@sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef",
        );
        assert!(policy().requirements_for_image(Some(&r)).is_err());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// The chosen list is the deepest namespace present.
            #[test]
            fn deepest_present_namespace_wins(
                components in proptest::collection::vec("[a-z]{1,6}", 1..5),
                present in proptest::collection::vec(any::<bool>(), 5),
            ) {
                let repo = format!("example.com/{}", components.join("/"));
                let mut policy = Policy::new(marker(1));
                let mut expected = 1;
                // depth 0 is the host, depth components.len() the full name.
                for depth in 0..=components.len() {
                    if present[depth] {
                        let scope = if depth == 0 {
                            "example.com".to_owned()
                        } else {
                            format!("example.com/{}", components[..depth].join("/"))
                        };
                        policy = policy.with_scope(scope, marker(depth + 2));
                        expected = depth + 2;
                    }
                }
                prop_assert_eq!(resolve(&policy, &format!("{repo}:tag")), expected);
            }
        }
    }
}
