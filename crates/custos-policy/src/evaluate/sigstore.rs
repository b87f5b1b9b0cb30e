//! `sigstoreSigned`: sigstore signatures by static keys, Fulcio
//! certificates or certificates from a caller-supplied PKI.
//!
//! The signing key is established first (directly, or from a verified
//! certificate); for Fulcio, and for static keys when Rekor keys are
//! configured, the Rekor SET must also bind that key to this exact
//! signature and payload. Only then is the payload signature checked and
//! the payload decoded.

use custos_signature::sigstore::{
    CERTIFICATE_ANNOTATION, CHAIN_ANNOTATION, SET_ANNOTATION, SIGNATURE_ANNOTATION,
    SIGSTORE_SIGNATURE_MIME_TYPE, verify_sigstore_payload,
};
use custos_signature::{PublicKey, Signature, SigstoreSignature, UntrustedSignature};

use super::{Candidate, IgnoredKinds, ImageRules, SignatureAcceptance, require_accepted_signature};
use crate::error::PolicyError;
use crate::image::UnparsedImage;
use crate::rekor::verify_rekor_set;
use crate::trust_root::TrustAnchor;
use crate::types::SigstoreSigned;

const IGNORED: IgnoredKinds = IgnoredKinds {
    other_format: "non-sigstore signatures",
    not_a_signature: "sigstore non-signature attachments",
};

impl SigstoreSigned {
    pub(crate) fn is_signature_author_accepted(
        &self,
        image: &dyn UnparsedImage,
        signature: &UntrustedSignature,
    ) -> SignatureAcceptance {
        match signature {
            UntrustedSignature::Sigstore(sig) if is_signature(sig) => self.verify(image, sig).into(),
            UntrustedSignature::Sigstore(sig) => SignatureAcceptance::Rejected(PolicyError::denied(format!(
                "sigstore attachment of type {:?} is not a signature",
                sig.mime_type
            ))),
            other => SignatureAcceptance::Rejected(PolicyError::denied(format!(
                "sigstoreSigned only accepts sigstore signatures, not {}",
                other.kind()
            ))),
        }
    }

    pub(crate) fn is_running_image_allowed(&self, image: &dyn UnparsedImage) -> Result<(), PolicyError> {
        let signatures = image.untrusted_signatures()?;
        require_accepted_signature(&signatures, &IGNORED, |signature| match signature {
            UntrustedSignature::Sigstore(sig) if is_signature(sig) => match self.verify(image, sig) {
                Ok(_) => Candidate::Accepted,
                Err(e) => Candidate::Rejected(e),
            },
            UntrustedSignature::Sigstore(_) => Candidate::NotASignature,
            UntrustedSignature::SimpleSigning(_) => Candidate::OtherFormat,
        })
    }

    fn verify(&self, image: &dyn UnparsedImage, sig: &SigstoreSignature) -> Result<Signature, PolicyError> {
        let root = self.prepare_trust_root()?;
        let base64_signature = required_annotation(sig, SIGNATURE_ANNOTATION)?;

        let keys = match root.anchor {
            TrustAnchor::PublicKeys(keys) => match root.rekor_keys {
                None => keys,
                Some(rekor_keys) => vec![key_logged_in_rekor(keys, &rekor_keys, sig, base64_signature)?],
            },
            TrustAnchor::Fulcio(fulcio) => {
                let Some(rekor_keys) = root.rekor_keys else {
                    return Err(PolicyError::rekor(
                        "Internal inconsistency: Fulcio CA specified without a Rekor public key",
                    ));
                };
                let certificate = required_annotation(sig, CERTIFICATE_ANNOTATION)?;
                let set = required_annotation(sig, SET_ANNOTATION)?;
                let integrated_time = verify_rekor_set(
                    &rekor_keys,
                    set.as_bytes(),
                    certificate.as_bytes(),
                    base64_signature,
                    &sig.payload,
                )?;
                let chain = sig.annotation(CHAIN_ANNOTATION).map(str::as_bytes);
                vec![fulcio.verify(certificate.as_bytes(), chain, integrated_time)?]
            }
            TrustAnchor::Pki(pki) => {
                let certificate = required_annotation(sig, CERTIFICATE_ANNOTATION)?;
                let chain = sig.annotation(CHAIN_ANNOTATION).map(str::as_bytes);
                vec![pki.verify(certificate.as_bytes(), chain)?]
            }
        };

        let rules = ImageRules {
            image,
            signed_identity: self.signed_identity(),
            trusted_identities: None,
        };
        let result = verify_sigstore_payload(&keys, &sig.payload, base64_signature, &rules);
        if let Err(e) = &result {
            tracing::debug!(error = %e, "sigstore signature rejected");
        }
        result
    }
}

fn is_signature(sig: &SigstoreSignature) -> bool {
    sig.mime_type == SIGSTORE_SIGNATURE_MIME_TYPE
}

fn required_annotation<'a>(sig: &'a SigstoreSignature, key: &str) -> Result<&'a str, PolicyError> {
    sig.annotation(key)
        .ok_or_else(|| PolicyError::denied(format!("missing {key} annotation")))
}

/// The first of `keys` that the Rekor SET records as having made this
/// signature.
fn key_logged_in_rekor(
    keys: Vec<PublicKey>,
    rekor_keys: &[PublicKey],
    sig: &SigstoreSignature,
    base64_signature: &str,
) -> Result<PublicKey, PolicyError> {
    let set = required_annotation(sig, SET_ANNOTATION)?;
    let mut failures = Vec::with_capacity(keys.len());
    for key in keys {
        let key_pem = key.to_pem()?;
        match verify_rekor_set(
            rekor_keys,
            set.as_bytes(),
            key_pem.as_bytes(),
            base64_signature,
            &sig.payload,
        ) {
            Ok(integrated_time) => {
                tracing::debug!(integrated_time = %integrated_time.to_rfc3339(), "public key found in Rekor SET");
                return Ok(key);
            }
            Err(e) => failures.push(e.to_string()),
        }
    }
    Err(PolicyError::denied(format!(
        "No public key verified against the RekorSET: {}",
        failures.join(", ")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Utc;
    use custos_signature::Digest;
    use custos_signature::keys::{LocalSigner, der_to_pem};
    use custos_signature::payload::{PayloadFormat, UntrustedPayload};
    use custos_signature::sigstore::sign_sigstore_payload;
    use rcgen::{CustomExtension, ExtendedKeyUsagePurpose};

    use crate::certs::tests::{LeafSpec, TestCa, issue_leaf};
    use crate::evaluate::tests::{MANIFEST, image};
    use crate::rekor::tests::{hashedrekord_body, make_set};
    use crate::types::{CertSource, FulcioTrust, KeySource, PkiTrust, PolicyReferenceMatch, SigstoreTrust};

    const REFERENCE: &str = "example.com/ns/repo:tag";
    const ISSUER: &str = "https://github.com/login/oauth";
    const EMAIL: &str = "signer@example.com";

    fn payload(reference: &str) -> Vec<u8> {
        UntrustedPayload::new(Digest::sha256(MANIFEST), reference)
            .encode(PayloadFormat::Sigstore)
            .expect("encode payload")
    }

    fn signed(signer: &LocalSigner, payload: Vec<u8>) -> SigstoreSignature {
        let b64 = sign_sigstore_payload(signer, &payload).expect("sign");
        SigstoreSignature::new(payload, b64)
    }

    fn pem(signer: &LocalSigner) -> Vec<u8> {
        signer.public_key().expect("public key").to_pem().expect("encode").into_bytes()
    }

    fn key_requirement(signer: &LocalSigner, rekor: Option<&LocalSigner>) -> SigstoreSigned {
        SigstoreSigned::new(
            SigstoreTrust::PublicKeys(KeySource::Data(pem(signer))),
            rekor.map(|log| KeySource::Data(pem(log))),
            PolicyReferenceMatch::MatchRepoDigestOrExact,
        )
        .expect("valid requirement")
    }

    fn attach_set(sig: &mut SigstoreSignature, log: &LocalSigner, key_or_cert_pem: &[u8]) {
        let b64 = sig.annotation(SIGNATURE_ANNOTATION).expect("signature").to_owned();
        let body = hashedrekord_body(key_or_cert_pem, &b64, &sig.payload);
        let set = make_set(log, &body, Utc::now().timestamp());
        sig.annotations
            .insert(SET_ANNOTATION.to_owned(), String::from_utf8(set).expect("utf8 SET"));
    }

    fn rejection(acceptance: SignatureAcceptance) -> String {
        match acceptance {
            SignatureAcceptance::Rejected(e) => e.to_string(),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    // ── Public keys ──────────────────────────────────────────────────

    #[test]
    fn public_key_signature_is_accepted() {
        let signer = LocalSigner::generate().expect("signer");
        let img = image(REFERENCE);
        let sig = UntrustedSignature::Sigstore(signed(&signer, payload(REFERENCE)));
        let req = key_requirement(&signer, None);

        let SignatureAcceptance::Accepted(signature) = req.is_signature_author_accepted(&img, &sig) else {
            panic!("expected acceptance");
        };
        assert_eq!(signature.docker_reference, REFERENCE);
        assert_eq!(signature.docker_manifest_digest, Digest::sha256(MANIFEST));
        req.is_running_image_allowed(&img.with_signature(sig)).expect("allowed");
    }

    #[test]
    fn public_key_rejections() {
        let signer = LocalSigner::generate().expect("signer");
        let other = LocalSigner::generate().expect("other");
        let img = image(REFERENCE);
        let req = key_requirement(&signer, None);

        let by_other = UntrustedSignature::Sigstore(signed(&other, payload(REFERENCE)));
        assert!(rejection(req.is_signature_author_accepted(&img, &by_other))
            .contains("cryptographic signature verification failed"));

        let wrong_tag = UntrustedSignature::Sigstore(signed(&signer, payload("example.com/ns/repo:other")));
        assert_eq!(
            rejection(req.is_signature_author_accepted(&img, &wrong_tag)),
            "Signature for identity example.com/ns/repo:other is not accepted"
        );

        let mut unsigned = signed(&signer, payload(REFERENCE));
        unsigned.annotations.clear();
        assert_eq!(
            rejection(req.is_signature_author_accepted(&img, &UntrustedSignature::Sigstore(unsigned))),
            format!("missing {SIGNATURE_ANNOTATION} annotation")
        );

        let simple = UntrustedSignature::SimpleSigning(b"openpgp".to_vec());
        assert!(rejection(req.is_signature_author_accepted(&img, &simple)).contains("only accepts sigstore"));
    }

    #[test]
    fn wrong_kind_attachments_are_counted() {
        let signer = LocalSigner::generate().expect("signer");
        let mut attachment = signed(&signer, payload(REFERENCE));
        attachment.mime_type = "application/vnd.example.sbom+json".to_owned();
        let img = image(REFERENCE)
            .with_signature(UntrustedSignature::SimpleSigning(b"openpgp".to_vec()))
            .with_signature(UntrustedSignature::Sigstore(attachment));
        let err = key_requirement(&signer, None)
            .is_running_image_allowed(&img)
            .expect_err("no usable signature");
        assert_eq!(
            err.to_string(),
            "A signature was required, but no signature exists (1 non-sigstore signatures, 1 sigstore non-signature attachments)"
        );
    }

    #[test]
    fn public_key_with_rekor() {
        let signer = LocalSigner::generate().expect("signer");
        let log = LocalSigner::generate().expect("log");
        let img = image(REFERENCE);
        let req = key_requirement(&signer, Some(&log));

        let mut sig = signed(&signer, payload(REFERENCE));
        assert_eq!(
            rejection(req.is_signature_author_accepted(&img, &UntrustedSignature::Sigstore(sig.clone()))),
            format!("missing {SET_ANNOTATION} annotation")
        );

        attach_set(&mut sig, &log, &pem(&signer));
        assert!(req
            .is_signature_author_accepted(&img, &UntrustedSignature::Sigstore(sig))
            .is_accepted());

        let other = LocalSigner::generate().expect("other");
        let mut logged_other = signed(&signer, payload(REFERENCE));
        attach_set(&mut logged_other, &log, &pem(&other));
        let reason = rejection(req.is_signature_author_accepted(&img, &UntrustedSignature::Sigstore(logged_other)));
        assert!(reason.starts_with("No public key verified against the RekorSET: "), "{reason}");
    }

    // ── Fulcio ───────────────────────────────────────────────────────

    struct Fulcio {
        ca: TestCa,
        log: LocalSigner,
    }

    impl Fulcio {
        fn new() -> Self {
            Self {
                ca: TestCa::new("sigstore"),
                log: LocalSigner::generate().expect("log"),
            }
        }

        fn requirement(&self) -> SigstoreSigned {
            let trust = FulcioTrust::new(CertSource::Data(self.ca.pem().into_bytes()), ISSUER, EMAIL)
                .expect("fulcio trust");
            SigstoreSigned::new(
                SigstoreTrust::Fulcio(trust),
                Some(KeySource::Data(pem(&self.log))),
                PolicyReferenceMatch::MatchRepoDigestOrExact,
            )
            .expect("valid requirement")
        }

        /// A signature by a fresh certificate issued to `issuer`, logged in Rekor.
        fn sign(&self, issuer: &str) -> UntrustedSignature {
            let (leaf, pkcs8) = issue_leaf(
                &self.ca,
                LeafSpec {
                    emails: vec![EMAIL.to_owned()],
                    extensions: vec![CustomExtension::from_oid_content(
                        &[1, 3, 6, 1, 4, 1, 57264, 1, 1],
                        issuer.as_bytes().to_vec(),
                    )],
                    eku: vec![ExtendedKeyUsagePurpose::CodeSigning],
                    ..LeafSpec::default()
                },
            );
            let signer = LocalSigner::from_pkcs8_pem(der_to_pem(&pkcs8, "PRIVATE KEY").expect("encode").as_bytes())
                .expect("leaf key");
            let mut sig = signed(&signer, payload(REFERENCE));
            sig.annotations
                .insert(CERTIFICATE_ANNOTATION.to_owned(), leaf.pem());
            attach_set(&mut sig, &self.log, leaf.pem().as_bytes());
            UntrustedSignature::Sigstore(sig)
        }
    }

    #[test]
    fn fulcio_signature_is_accepted() {
        let fulcio = Fulcio::new();
        let img = image(REFERENCE);
        let sig = fulcio.sign(ISSUER);
        let req = fulcio.requirement();
        assert!(req.is_signature_author_accepted(&img, &sig).is_accepted());
        req.is_running_image_allowed(&img.with_signature(sig)).expect("allowed");
    }

    #[test]
    fn fulcio_evil_issuer_is_rejected_despite_valid_set() {
        let fulcio = Fulcio::new();
        let sig = fulcio.sign("https://evil.example");
        let reason = rejection(fulcio.requirement().is_signature_author_accepted(&image(REFERENCE), &sig));
        assert!(reason.contains("Unexpected Fulcio OIDC issuer"), "{reason}");
    }

    #[test]
    fn fulcio_requires_certificate_and_set() {
        let fulcio = Fulcio::new();
        let img = image(REFERENCE);
        for annotation in [CERTIFICATE_ANNOTATION, SET_ANNOTATION] {
            let UntrustedSignature::Sigstore(mut sig) = fulcio.sign(ISSUER) else {
                panic!("sigstore signature");
            };
            sig.annotations.remove(annotation);
            assert_eq!(
                rejection(fulcio.requirement().is_signature_author_accepted(&img, &UntrustedSignature::Sigstore(sig))),
                format!("missing {annotation} annotation")
            );
        }
    }

    #[test]
    fn fulcio_set_must_come_from_the_configured_log() {
        let fulcio = Fulcio::new();
        let impostor = Fulcio {
            ca: TestCa::new("unused"),
            log: LocalSigner::generate().expect("impostor log"),
        };
        let UntrustedSignature::Sigstore(mut sig) = fulcio.sign(ISSUER) else {
            panic!("sigstore signature");
        };
        let certificate = sig.annotation(CERTIFICATE_ANNOTATION).expect("certificate").to_owned();
        attach_set(&mut sig, &impostor.log, certificate.as_bytes());
        let reason = rejection(
            fulcio
                .requirement()
                .is_signature_author_accepted(&image(REFERENCE), &UntrustedSignature::Sigstore(sig)),
        );
        assert!(reason.contains("Rekor SET failed"), "{reason}");
    }

    // ── PKI ──────────────────────────────────────────────────────────

    #[test]
    fn pki_signature_is_accepted() {
        let root = TestCa::new("pki-root");
        let intermediate = root.intermediate("pki-intermediate");
        let (leaf, pkcs8) = issue_leaf(
            &intermediate,
            LeafSpec {
                emails: vec![EMAIL.to_owned()],
                ..LeafSpec::default()
            },
        );
        let signer = LocalSigner::from_pkcs8_pem(der_to_pem(&pkcs8, "PRIVATE KEY").expect("encode").as_bytes()).expect("leaf key");
        let mut sig = signed(&signer, payload(REFERENCE));
        sig.annotations.insert(CERTIFICATE_ANNOTATION.to_owned(), leaf.pem());
        sig.annotations.insert(
            CHAIN_ANNOTATION.to_owned(),
            format!("{}{}", intermediate.pem(), root.pem()),
        );

        let trust = PkiTrust::new(
            CertSource::Data(root.pem().into_bytes()),
            None,
            Some(EMAIL.to_owned()),
            None,
        )
        .expect("pki trust");
        let req = SigstoreSigned::new(SigstoreTrust::Pki(trust), None, PolicyReferenceMatch::default())
            .expect("valid requirement");
        let img = image(REFERENCE);
        assert!(req
            .is_signature_author_accepted(&img, &UntrustedSignature::Sigstore(sig.clone()))
            .is_accepted());

        sig.annotations.remove(CHAIN_ANNOTATION);
        let reason = rejection(req.is_signature_author_accepted(&img, &UntrustedSignature::Sigstore(sig)));
        assert!(reason.contains("verifying leaf certificate failed"), "{reason}");
    }
}
