//! Certificates issued by a caller-supplied PKI.

use std::net::IpAddr;

use custos_signature::PublicKey;

use crate::certs::{ParsedCertificate, parse_leaf_certificate, verify_chain};
use crate::error::PolicyError;
use crate::trust_root::{PkiTrustRoot, untrusted_intermediates};

impl PkiTrustRoot {
    /// Verify a leaf certificate against the configured roots and return
    /// its key.
    ///
    /// Intermediates come from `chain_pem` when the signature carries a
    /// chain, and from the configured pool otherwise. The chain is checked
    /// at the leaf's own `notBefore`, so signatures stay verifiable after
    /// the certificate expires.
    ///
    /// # Errors
    ///
    /// Fails if the chain does not verify or the subject does not match.
    pub fn verify(&self, leaf_pem: &[u8], chain_pem: Option<&[u8]>) -> Result<PublicKey, PolicyError> {
        let from_signature = untrusted_intermediates(chain_pem)?;
        let intermediates = if chain_pem.is_some_and(|c| !c.is_empty()) {
            from_signature.as_slice()
        } else {
            self.intermediates.as_slice()
        };
        let leaf = parse_leaf_certificate(leaf_pem)?;
        verify_chain(&leaf, intermediates, &self.roots, leaf.not_before())
            .map_err(|e| PolicyError::certificate(format!("verifying leaf certificate failed: {e}")))?;

        if let Some(email) = &self.subject_email {
            let emails = leaf.email_addresses()?;
            if !emails.contains(email) {
                return Err(PolicyError::certificate(format!(
                    "Required email {email:?} not found (got {emails:?})"
                )));
            }
        }
        if let Some(hostname) = &self.subject_hostname {
            check_hostname(&leaf, hostname)?;
        }
        leaf.public_key()
    }
}

fn check_hostname(cert: &ParsedCertificate, hostname: &str) -> Result<(), PolicyError> {
    let unexpected = |detail: String| PolicyError::certificate(format!("Unexpected subject hostname: {detail}"));

    let bare = hostname
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(hostname);
    if let Ok(ip) = bare.parse::<IpAddr>() {
        let wanted = match ip {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        };
        if cert.ip_addresses()?.contains(&wanted) {
            return Ok(());
        }
        return Err(unexpected(format!(
            "certificate is not valid for IP address {ip}"
        )));
    }

    let names = cert.dns_names()?;
    if names.iter().any(|pattern| hostname_matches(pattern, hostname)) {
        return Ok(());
    }
    if names.is_empty() {
        Err(unexpected(format!(
            "certificate is not valid for any names, but wanted to match {hostname}"
        )))
    } else {
        Err(unexpected(format!(
            "certificate is valid for {}, not {hostname}",
            names.join(", ")
        )))
    }
}

/// Case-insensitive DNS name match; a leading `*.` in `pattern` matches
/// exactly one label.
fn hostname_matches(pattern: &str, hostname: &str) -> bool {
    let pattern = pattern.trim_end_matches('.').to_ascii_lowercase();
    let hostname = hostname.trim_end_matches('.').to_ascii_lowercase();
    if pattern.is_empty() || hostname.is_empty() {
        return false;
    }
    match pattern.strip_prefix("*.") {
        Some(suffix) => hostname
            .split_once('.')
            .is_some_and(|(label, rest)| !label.is_empty() && rest == suffix),
        None => pattern == hostname,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rcgen::CustomExtension;

    use crate::certs::tests::{LeafSpec, TestCa, issue_leaf};

    const EMAIL: &str = "qa@redhat.com";
    const HOSTNAME: &str = "myhost.example.com";

    struct Setup {
        root: TestCa,
        intermediate: TestCa,
        leaf_pem: String,
    }

    fn setup(spec: LeafSpec) -> Setup {
        let root = TestCa::new("pki-root");
        let intermediate = root.intermediate("pki-intermediate");
        let (leaf, _) = issue_leaf(&intermediate, spec);
        Setup {
            leaf_pem: leaf.pem(),
            root,
            intermediate,
        }
    }

    fn default_spec() -> LeafSpec {
        LeafSpec {
            emails: vec![EMAIL.to_owned()],
            dns_names: vec![HOSTNAME.to_owned()],
            ..LeafSpec::default()
        }
    }

    fn trust(s: &Setup, configured_intermediates: bool) -> PkiTrustRoot {
        PkiTrustRoot {
            roots: vec![s.root.parsed()],
            intermediates: if configured_intermediates {
                vec![s.intermediate.parsed()]
            } else {
                Vec::new()
            },
            subject_email: Some(EMAIL.to_owned()),
            subject_hostname: Some(HOSTNAME.to_owned()),
        }
    }

    fn chain(s: &Setup) -> String {
        format!("{}{}", s.intermediate.pem(), s.root.pem())
    }

    #[test]
    fn intermediates_from_configuration() {
        let s = setup(default_spec());
        trust(&s, true)
            .verify(s.leaf_pem.as_bytes(), None)
            .expect("configured intermediates");
    }

    #[test]
    fn intermediates_from_signature() {
        let s = setup(default_spec());
        trust(&s, false)
            .verify(s.leaf_pem.as_bytes(), Some(chain(&s).as_bytes()))
            .expect("intermediates from chain annotation");
    }

    #[test]
    fn cross_signed_intermediate_in_signature_chain() {
        let s = setup(default_spec());
        let other_root = TestCa::new("pki-other-root");
        let cross_signed = s.intermediate.cross_signed_by("pki-intermediate", &other_root);
        // The last certificate of the annotation is taken as its root and dropped.
        let chain = format!(
            "{}{}{}",
            cross_signed.pem(),
            s.intermediate.pem(),
            s.root.pem()
        );
        trust(&s, false)
            .verify(s.leaf_pem.as_bytes(), Some(chain.as_bytes()))
            .expect("path through the intermediate signed by the trusted root");
    }

    #[test]
    fn missing_intermediates_fail() {
        let s = setup(default_spec());
        let err = trust(&s, false)
            .verify(s.leaf_pem.as_bytes(), None)
            .expect_err("no intermediates");
        assert!(err.to_string().contains("verifying leaf certificate failed"), "{err}");
    }

    #[test]
    fn garbage_chain_is_an_error() {
        let s = setup(default_spec());
        let err = trust(&s, true)
            .verify(s.leaf_pem.as_bytes(), Some(b"this is not PEM"))
            .expect_err("garbage chain");
        assert!(err.to_string().contains("loading certificate chain"), "{err}");
    }

    #[test]
    fn subject_checks() {
        let s = setup(default_spec());
        let mut wrong_email = trust(&s, true);
        wrong_email.subject_email = Some("someone@example.com".to_owned());
        let err = wrong_email.verify(s.leaf_pem.as_bytes(), None).expect_err("email");
        assert!(err.to_string().contains("Required email \"someone@example.com\" not found"), "{err}");

        let mut wrong_host = trust(&s, true);
        wrong_host.subject_hostname = Some("other.example.com".to_owned());
        let err = wrong_host.verify(s.leaf_pem.as_bytes(), None).expect_err("hostname");
        assert!(err.to_string().contains("Unexpected subject hostname"), "{err}");

        let mut email_only = trust(&s, true);
        email_only.subject_hostname = None;
        email_only.verify(s.leaf_pem.as_bytes(), None).expect("email only");
    }

    #[test]
    fn one_of_several_hostnames_suffices() {
        let s = setup(LeafSpec {
            emails: vec![EMAIL.to_owned()],
            dns_names: vec!["first.example.com".to_owned(), HOSTNAME.to_owned()],
            ..LeafSpec::default()
        });
        trust(&s, true)
            .verify(s.leaf_pem.as_bytes(), None)
            .expect("second SAN matches");
    }

    #[test]
    fn critical_other_name_san_is_unhandled() {
        // SEQUENCE { [0] otherName { 1.2.3.4, [0] UTF8String "x" } }
        let san = vec![
            0x30, 0x0c, 0xa0, 0x0a, 0x06, 0x03, 0x2a, 0x03, 0x04, 0xa0, 0x03, 0x0c, 0x01, 0x78,
        ];
        let mut ext = CustomExtension::from_oid_content(&[2, 5, 29, 17], san);
        ext.set_criticality(true);
        let s = setup(LeafSpec {
            extensions: vec![ext],
            ..LeafSpec::default()
        });
        let err = trust(&s, true)
            .verify(s.leaf_pem.as_bytes(), None)
            .expect_err("otherName only");
        assert!(err.to_string().contains("unhandled critical extension"), "{err}");
    }

    #[test]
    fn hostname_patterns() {
        assert!(hostname_matches("example.com", "EXAMPLE.com"));
        assert!(hostname_matches("*.example.com", "www.example.com"));
        assert!(!hostname_matches("*.example.com", "example.com"));
        assert!(!hostname_matches("*.example.com", "a.b.example.com"));
        assert!(hostname_matches("example.com.", "example.com"));
        assert!(!hostname_matches("", "example.com"));
    }
}
