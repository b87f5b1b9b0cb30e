//! Docker image references.
//!
//! Parses the `[domain/]path[:tag][@digest]` grammar used by registries and
//! normalizes short names the way the docker CLI does: `busybox` becomes
//! `docker.io/library/busybox`. A parsed [`ImageReference`] always displays
//! in its fully expanded form.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::digest::Digest;
use crate::error::SignatureError;

/// Registry used for references without an explicit domain.
pub const DEFAULT_DOMAIN: &str = "docker.io";
/// Historical alias for [`DEFAULT_DOMAIN`].
const LEGACY_DEFAULT_DOMAIN: &str = "index.docker.io";
/// Namespace prepended to single-component names on [`DEFAULT_DOMAIN`].
const OFFICIAL_REPO_PREFIX: &str = "library/";
/// Tag added to name-only references by [`ImageReference::with_default_tag`].
pub const DEFAULT_TAG: &str = "latest";
/// Upper bound on the length of the name part.
const NAME_TOTAL_LENGTH_MAX: usize = 255;

// ── Grammar ──────────────────────────────────────────────────────────

const PATH_COMPONENT: &str = r"[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*";
const DOMAIN_COMPONENT: &str = r"(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9])";
const IPV6_ADDRESS: &str = r"\[[a-fA-F0-9:]+\]";
const TAG: &str = r"[\w][\w.-]{0,127}";
const DIGEST: &str = r"[A-Za-z][A-Za-z0-9]*(?:[-_+.][A-Za-z][A-Za-z0-9]*)*:[0-9a-fA-F]{32,}";

fn domain_pattern() -> String {
    format!(r"(?:{DOMAIN_COMPONENT}(?:\.{DOMAIN_COMPONENT})*|{IPV6_ADDRESS})(?::[0-9]+)?")
}

static REFERENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    let domain = domain_pattern();
    let pattern = format!(
        r"^((?:({domain})/)?({PATH_COMPONENT}(?:/{PATH_COMPONENT})*))(?::({TAG}))?(?:@({DIGEST}))?$"
    );
    Regex::new(&pattern).unwrap_or_else(|e| unreachable!("reference grammar is valid: {e}"))
});

static DOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^{}$", domain_pattern()))
        .unwrap_or_else(|e| unreachable!("domain grammar is valid: {e}"))
});

static PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^{}(?:/{PATH_COMPONENT})*$", domain_pattern()))
        .unwrap_or_else(|e| unreachable!("prefix grammar is valid: {e}"))
});

static IDENTIFIER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new("^[a-f0-9]{64}$").unwrap_or_else(|e| unreachable!("identifier grammar is valid: {e}"))
});

/// Returns true if `s` is a syntactically valid registry host, with an
/// optional port.
#[must_use]
pub fn is_valid_domain(s: &str) -> bool {
    DOMAIN_RE.is_match(s)
}

/// Returns true if `s` is a host optionally followed by `/`-separated path
/// components, with no tag or digest: the shape of a repository prefix.
///
/// The first component is always read as a host, so `ns/repo` passes even
/// though it would normalize onto `docker.io`.
#[must_use]
pub fn is_valid_repository_prefix(s: &str) -> bool {
    PREFIX_RE.is_match(s)
}

/// A parsed, normalized docker reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    domain: String,
    path: String,
    tag: Option<String>,
    digest: Option<Digest>,
}

impl ImageReference {
    /// Parse `s`, filling in the default domain and `library/` namespace
    /// the way `docker pull` does.
    ///
    /// # Errors
    ///
    /// Returns [`SignatureError::InvalidReference`] if `s` does not follow
    /// the reference grammar, names a 64-character hex identifier, or uses
    /// uppercase letters in the repository path.
    pub fn parse_normalized(s: &str) -> Result<Self, SignatureError> {
        if IDENTIFIER_RE.is_match(s) {
            return Err(invalid(s, "cannot specify 64-byte hexadecimal strings"));
        }
        let (domain, remainder) = split_docker_domain(s);
        let remote_name = remainder.split_once(':').map_or(remainder.as_str(), |(n, _)| n);
        if remote_name.to_lowercase() != remote_name {
            return Err(invalid(
                s,
                &format!("repository name ({remote_name}) must be lowercase"),
            ));
        }
        Self::parse(&format!("{domain}/{remainder}"))
            .map_err(|e| match e {
                SignatureError::InvalidReference { reason, .. } => invalid(s, &reason),
                other => other,
            })
    }

    /// Parse an already fully qualified reference without normalization.
    fn parse(s: &str) -> Result<Self, SignatureError> {
        let Some(caps) = REFERENCE_RE.captures(s) else {
            return Err(invalid(s, "invalid reference format"));
        };
        let name = caps.get(1).map_or("", |m| m.as_str());
        if name.len() > NAME_TOTAL_LENGTH_MAX {
            return Err(invalid(
                s,
                &format!("repository name must not be more than {NAME_TOTAL_LENGTH_MAX} characters"),
            ));
        }
        let Some(domain) = caps.get(2) else {
            return Err(invalid(s, "reference has no domain"));
        };
        let path = caps.get(3).map_or("", |m| m.as_str());
        let tag = caps.get(4).map(|m| m.as_str().to_owned());
        let digest = caps.get(5).map(|m| Digest::parse(m.as_str())).transpose()?;
        Ok(Self {
            domain: domain.as_str().to_owned(),
            path: path.to_owned(),
            tag,
            digest,
        })
    }

    /// The registry host, e.g. `docker.io`.
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The repository path within the registry, e.g. `library/busybox`.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The full repository name, e.g. `docker.io/library/busybox`.
    #[must_use]
    pub fn name(&self) -> String {
        format!("{}/{}", self.domain, self.path)
    }

    /// The tag, if any.
    #[must_use]
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// The digest, if any.
    #[must_use]
    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    /// True if the reference has neither a tag nor a digest.
    #[must_use]
    pub fn is_name_only(&self) -> bool {
        self.tag.is_none() && self.digest.is_none()
    }

    /// Return a copy with [`DEFAULT_TAG`] added if the reference is name-only.
    #[must_use]
    pub fn with_default_tag(&self) -> Self {
        let mut out = self.clone();
        if out.is_name_only() {
            out.tag = Some(DEFAULT_TAG.to_owned());
        }
        out
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.domain, self.path)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for ImageReference {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_normalized(s)
    }
}

/// Split a user-supplied name into a domain and the remainder, applying
/// the docker defaults.
fn split_docker_domain(name: &str) -> (String, String) {
    let (mut domain, mut remainder) = match name.split_once('/') {
        Some((first, rest))
            if first.contains(['.', ':'])
                || first == "localhost"
                || first.to_lowercase() != first =>
        {
            (first.to_owned(), rest.to_owned())
        }
        _ => (DEFAULT_DOMAIN.to_owned(), name.to_owned()),
    };
    if domain == LEGACY_DEFAULT_DOMAIN {
        DEFAULT_DOMAIN.clone_into(&mut domain);
    }
    if domain == DEFAULT_DOMAIN && !remainder.contains('/') {
        remainder = format!("{OFFICIAL_REPO_PREFIX}{remainder}");
    }
    (domain, remainder)
}

fn invalid(reference: &str, reason: &str) -> SignatureError {
    SignatureError::InvalidReference {
        reference: reference.to_owned(),
        reason: reason.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    #[test]
    fn normalizes_short_names() {
        let cases = [
            ("busybox", "docker.io/library/busybox"),
            ("busybox:1.36", "docker.io/library/busybox:1.36"),
            ("library/busybox", "docker.io/library/busybox"),
            ("myuser/app", "docker.io/myuser/app"),
            ("index.docker.io/busybox", "docker.io/library/busybox"),
            ("quay.io/ns/repo:v1", "quay.io/ns/repo:v1"),
            ("localhost/app", "localhost/app"),
            ("localhost:5000/a/b/c:t", "localhost:5000/a/b/c:t"),
            ("[::1]:5000/app", "[::1]:5000/app"),
        ];
        for (input, expected) in cases {
            let r = ImageReference::parse_normalized(input).expect(input);
            assert_eq!(r.to_string(), expected, "{input}");
        }
    }

    #[test]
    fn splits_components() {
        let r = ImageReference::parse_normalized(&format!("example.com:5000/ns/repo:tag@sha256:{HEX}"))
            .expect("parse");
        assert_eq!(r.domain(), "example.com:5000");
        assert_eq!(r.path(), "ns/repo");
        assert_eq!(r.name(), "example.com:5000/ns/repo");
        assert_eq!(r.tag(), Some("tag"));
        assert_eq!(r.digest().map(ToString::to_string), Some(format!("sha256:{HEX}")));
        assert!(!r.is_name_only());
    }

    #[test]
    fn name_only_and_default_tag() {
        let r = ImageReference::parse_normalized("quay.io/ns/repo").expect("parse");
        assert!(r.is_name_only());
        assert_eq!(r.with_default_tag().to_string(), "quay.io/ns/repo:latest");

        let tagged = ImageReference::parse_normalized("quay.io/ns/repo:v2").expect("parse");
        assert_eq!(tagged.with_default_tag(), tagged);
    }

    #[test]
    fn rejects_malformed_references() {
        for input in [
            "",
            "docker.io/Busybox",
            "repo:",
            "repo@sha256:short",
            "a//b",
            HEX,
            "example.com/repo:tag:extra",
        ] {
            assert!(
                ImageReference::parse_normalized(input).is_err(),
                "expected {input:?} to be rejected"
            );
        }
    }

    #[test]
    fn rejects_overlong_names() {
        let long = format!("example.com/{}", "a".repeat(250));
        assert!(ImageReference::parse_normalized(&long).is_err());
    }

    #[test]
    fn domain_validation() {
        assert!(is_valid_domain("example.com"));
        assert!(is_valid_domain("localhost:5000"));
        assert!(is_valid_domain("[fe80::1]:443"));
        assert!(!is_valid_domain("example.com/ns"));
        assert!(!is_valid_domain("-bad.example.com"));
    }

    #[test]
    fn repository_prefix_validation() {
        for ok in [
            "localhost",
            "example.com:80",
            "example.com/repo",
            "example.com:80/ns1/ns2/repo.with.dots-dashes_underscores",
            "shortname",
            "ns/shortname",
        ] {
            assert!(is_valid_repository_prefix(ok), "{ok}");
        }
        for bad in [
            "",
            "repo_with_underscores",
            "example.com/",
            "example.com/UPPERCASE",
            "example.com/repo/",
            "example.com/repo:tag",
        ] {
            assert!(!is_valid_repository_prefix(bad), "{bad}");
        }
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn display_reparses_to_same_reference(
                host in "[a-z][a-z0-9]{0,8}\\.[a-z]{2,4}",
                path in "[a-z0-9]{1,8}(/[a-z0-9]{1,8}){0,3}",
                tag in proptest::option::of("[A-Za-z0-9_][A-Za-z0-9_.-]{0,10}"),
            ) {
                let input = match &tag {
                    Some(t) => format!("{host}/{path}:{t}"),
                    None => format!("{host}/{path}"),
                };
                let parsed = ImageReference::parse_normalized(&input).expect("valid input");
                prop_assert_eq!(parsed.to_string(), input.clone());
                let again = ImageReference::parse_normalized(&parsed.to_string()).expect("reparse");
                prop_assert_eq!(again, parsed);
            }
        }
    }
}
