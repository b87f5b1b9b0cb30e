//! `signedBy`: simple signing signatures by OpenPGP keys.
//!
//! The configured keys are imported into a fresh keyring for every
//! signature, so nothing outside the policy can ever be trusted. The
//! keyring directory is removed when the mechanism is dropped, on every
//! return path.

use custos_signature::mechanism::SequoiaMechanism;
use custos_signature::simple::verify_and_extract_signature;
use custos_signature::{Signature, UntrustedSignature};

use super::{Candidate, IgnoredKinds, ImageRules, SignatureAcceptance, require_accepted_signature};
use crate::error::{PolicyError, PolicyFormatError};
use crate::image::UnparsedImage;
use crate::trust_root::load_key_source;
use crate::types::{SignedBy, SignedByKeyType};

const IGNORED: IgnoredKinds = IgnoredKinds {
    other_format: "non-simple-signing signatures",
    not_a_signature: "simple-signing non-signature attachments",
};

impl SignedBy {
    pub(crate) fn is_signature_author_accepted(
        &self,
        image: &dyn UnparsedImage,
        signature: &UntrustedSignature,
    ) -> SignatureAcceptance {
        self.verify(image, signature).into()
    }

    pub(crate) fn is_running_image_allowed(&self, image: &dyn UnparsedImage) -> Result<(), PolicyError> {
        let signatures = image.untrusted_signatures()?;
        require_accepted_signature(&signatures, &IGNORED, |signature| {
            match self.verify(image, signature) {
                Ok(_) => Candidate::Accepted,
                Err(e) => Candidate::Rejected(e),
            }
        })
    }

    fn verify(&self, image: &dyn UnparsedImage, signature: &UntrustedSignature) -> Result<Signature, PolicyError> {
        if self.key_type() != SignedByKeyType::GpgKeys {
            return Err(PolicyFormatError(format!(
                "Unimplemented \"keyType\" value \"{}\"",
                self.key_type().as_str()
            ))
            .into());
        }
        let UntrustedSignature::SimpleSigning(blob) = signature else {
            return Err(PolicyError::denied(format!(
                "signedBy only accepts simple signing signatures, not {}",
                signature.kind()
            )));
        };

        let keys = load_key_source(self.key_source())?;
        let (mech, trusted_identities) = SequoiaMechanism::new_ephemeral(&keys)?;
        let rules = ImageRules {
            image,
            signed_identity: self.signed_identity(),
            trusted_identities: Some(&trusted_identities),
        };
        let result = verify_and_extract_signature(&mech, blob, &rules);
        if let Err(e) = mech.close() {
            tracing::warn!(error = %e, "failed to remove ephemeral keyring");
        }
        if let Err(e) = &result {
            tracing::debug!(error = %e, "simple signing signature rejected");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use custos_signature::mechanism::SigningMechanism as _;
    use custos_signature::simple::sign_docker_manifest;
    use custos_signature::{Digest, SigstoreSignature};
    use sequoia_openpgp::cert::CertBuilder;
    use sequoia_openpgp::serialize::SerializeInto as _;

    use crate::evaluate::tests::{MANIFEST, image};
    use crate::types::{KeySource, PolicyReferenceMatch};

    struct Key {
        tsk: Vec<u8>,
        public: Vec<u8>,
        fingerprint: String,
    }

    fn generate(user_id: &str) -> Key {
        let (cert, _revocation) = CertBuilder::general_purpose(None, Some(user_id))
            .generate()
            .expect("generate certificate");
        Key {
            tsk: cert.as_tsk().armored().to_vec().expect("serialize TSK"),
            public: cert.armored().to_vec().expect("serialize public key"),
            fingerprint: cert.fingerprint().to_hex(),
        }
    }

    fn sign(key: &Key, manifest: &[u8], reference: &str) -> UntrustedSignature {
        let (mech, _) = SequoiaMechanism::new_ephemeral(&[&key.tsk]).expect("import signing key");
        mech.supports_signing().expect("signing key");
        UntrustedSignature::SimpleSigning(
            sign_docker_manifest(manifest, reference, &mech, &key.fingerprint).expect("sign"),
        )
    }

    fn requirement(key: &Key, identity: PolicyReferenceMatch) -> SignedBy {
        SignedBy::new(
            SignedByKeyType::GpgKeys,
            KeySource::Data(key.public.clone()),
            identity,
        )
        .expect("valid requirement")
    }

    fn rejection(acceptance: SignatureAcceptance) -> String {
        match acceptance {
            SignatureAcceptance::Rejected(e) => e.to_string(),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn accepts_a_valid_signature() {
        let key = generate("signer@example.com");
        let img = image("example.com/ns/repo:tag");
        let sig = sign(&key, MANIFEST, "example.com/ns/repo:tag");
        let req = requirement(&key, PolicyReferenceMatch::MatchExact);

        let SignatureAcceptance::Accepted(signature) = req.is_signature_author_accepted(&img, &sig) else {
            panic!("expected acceptance");
        };
        assert_eq!(signature.docker_manifest_digest, Digest::sha256(MANIFEST));
        assert_eq!(signature.docker_reference, "example.com/ns/repo:tag");
        req.is_running_image_allowed(&img.with_signature(sig)).expect("allowed");
    }

    #[test]
    fn verification_is_repeatable() {
        let key = generate("signer@example.com");
        let img = image("example.com/ns/repo:tag");
        let sig = sign(&key, MANIFEST, "example.com/ns/repo:tag");
        let req = requirement(&key, PolicyReferenceMatch::MatchExact);
        let first = req.verify(&img, &sig).expect("first");
        let second = req.verify(&img, &sig).expect("second");
        assert_eq!(first, second);
    }

    #[test]
    fn identity_mismatch_is_rejected() {
        let key = generate("signer@example.com");
        let img = image("example.com/ns/repo:other");
        let sig = sign(&key, MANIFEST, "example.com/ns/repo:tag");
        let req = requirement(&key, PolicyReferenceMatch::MatchExact);
        assert_eq!(
            rejection(req.is_signature_author_accepted(&img, &sig)),
            "Signature for identity example.com/ns/repo:tag is not accepted"
        );
    }

    #[test]
    fn digest_mismatch_is_rejected() {
        let key = generate("signer@example.com");
        let img = image("example.com/ns/repo:tag");
        let sig = sign(&key, b"{\"a different\": \"manifest\"}", "example.com/ns/repo:tag");
        let req = requirement(&key, PolicyReferenceMatch::MatchExact);
        let reason = rejection(req.is_signature_author_accepted(&img, &sig));
        assert!(reason.starts_with("Signature for digest sha256:"), "{reason}");
        assert!(reason.ends_with("does not match"), "{reason}");
    }

    #[test]
    fn untrusted_signer_is_rejected() {
        let trusted = generate("trusted@example.com");
        let other = generate("other@example.com");
        let img = image("example.com/ns/repo:tag");
        let sig = sign(&other, MANIFEST, "example.com/ns/repo:tag");
        let req = requirement(&trusted, PolicyReferenceMatch::MatchExact);
        assert!(matches!(
            req.is_signature_author_accepted(&img, &sig),
            SignatureAcceptance::Rejected(_)
        ));
    }

    #[test]
    fn unimplemented_key_types() {
        let key = generate("signer@example.com");
        let img = image("example.com/ns/repo:tag");
        let sig = sign(&key, MANIFEST, "example.com/ns/repo:tag");
        for key_type in [
            SignedByKeyType::SignedByGpgKeys,
            SignedByKeyType::X509Certificates,
            SignedByKeyType::SignedByX509Cas,
        ] {
            let req = SignedBy::new(key_type, KeySource::Data(key.public.clone()), PolicyReferenceMatch::default())
                .expect("valid requirement");
            let reason = rejection(req.is_signature_author_accepted(&img, &sig));
            assert!(
                reason.contains(&format!("Unimplemented \"keyType\" value \"{}\"", key_type.as_str())),
                "{reason}"
            );
        }
    }

    #[test]
    fn sigstore_signatures_are_rejected() {
        let key = generate("signer@example.com");
        let img = image("example.com/ns/repo:tag");
        let sig = UntrustedSignature::Sigstore(SigstoreSignature::new(b"{}".to_vec(), "c2ln".to_owned()));
        let req = requirement(&key, PolicyReferenceMatch::default());
        assert!(rejection(req.is_signature_author_accepted(&img, &sig)).contains("simple signing"));
    }

    #[test]
    fn running_requires_one_good_signature() {
        let key = generate("signer@example.com");
        let req = requirement(&key, PolicyReferenceMatch::MatchExact);

        let err = req
            .is_running_image_allowed(&image("example.com/ns/repo:tag"))
            .expect_err("unsigned");
        assert_eq!(err.to_string(), "A signature was required, but no signature exists");

        let bad = sign(&key, MANIFEST, "example.com/ns/repo:wrong");
        let good = sign(&key, MANIFEST, "example.com/ns/repo:tag");
        req.is_running_image_allowed(
            &image("example.com/ns/repo:tag")
                .with_signature(bad.clone())
                .with_signature(good),
        )
        .expect("one good signature suffices");

        let err = req
            .is_running_image_allowed(
                &image("example.com/ns/repo:tag")
                    .with_signature(bad.clone())
                    .with_signature(bad),
            )
            .expect_err("all bad");
        assert!(err.is_denial());
        assert!(
            err.to_string().starts_with("None of the signatures were accepted, reasons: "),
            "{err}"
        );
    }

    #[test]
    fn missing_key_file_is_an_error() {
        let key = generate("signer@example.com");
        let req = SignedBy::new(
            SignedByKeyType::GpgKeys,
            KeySource::Path("/nonexistent/custos/pubring.gpg".into()),
            PolicyReferenceMatch::default(),
        )
        .expect("valid requirement");
        let img = image("example.com/ns/repo:tag");
        let sig = sign(&key, MANIFEST, "example.com/ns/repo:tag");
        let reason = rejection(req.is_signature_author_accepted(&img, &sig));
        assert!(reason.contains("/nonexistent/custos/pubring.gpg"), "{reason}");
    }
}
