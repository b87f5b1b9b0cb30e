//! Public keys, PEM helpers and a local ECDSA signer.
//!
//! Verification goes through `aws-lc-rs`. Keys arrive as PEM-wrapped
//! `SubjectPublicKeyInfo` and are dispatched on their algorithm
//! identifier: ECDSA P-256 and P-384, RSA and Ed25519 are supported.

use aws_lc_rs::rand::SystemRandom;
use aws_lc_rs::signature::{
    self, ECDSA_P256_SHA256_ASN1_SIGNING, EcdsaKeyPair, KeyPair, UnparsedPublicKey,
    VerificationAlgorithm,
};
use der::asn1::ObjectIdentifier;
use der::pem::{self, LineEnding};
use der::{Decode, Encode};
use x509_cert::spki::SubjectPublicKeyInfoOwned;

use crate::error::SignatureError;

// ── OIDs ─────────────────────────────────────────────────────────────

const OID_EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
const OID_SECP256R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.3.1.7");
const OID_SECP384R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.132.0.34");
const OID_RSA_ENCRYPTION: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");
const OID_ED25519: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.101.112");

const OID_ECDSA_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2");
const OID_ECDSA_SHA384: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.3");
const OID_RSA_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.11");
const OID_RSA_SHA384: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.12");
const OID_RSA_SHA512: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.13");

// ── PEM helpers ──────────────────────────────────────────────────────

/// One decoded PEM block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PemBlock {
    /// The label between `BEGIN` and the dashes, e.g. `CERTIFICATE`.
    pub label: String,
    /// The decoded body.
    pub der: Vec<u8>,
}

/// Wrap DER bytes in PEM with the given label.
///
/// # Errors
///
/// Fails if `label` is not a valid PEM label.
pub fn der_to_pem(der: &[u8], label: &str) -> Result<String, SignatureError> {
    pem::encode_string(label, LineEnding::LF, der)
        .map_err(|e| SignatureError::Key(format!("failed to encode PEM block {label}: {e}")))
}

/// Decode every PEM block in `input`.
///
/// Text outside of blocks must be whitespace. Blocks follow RFC 7468's
/// strict encoding, as written by `der_to_pem`.
///
/// # Errors
///
/// Fails on unterminated blocks, mismatched labels, invalid base64 or
/// stray text between blocks.
pub fn parse_pem_blocks(input: &[u8]) -> Result<Vec<PemBlock>, SignatureError> {
    let text = std::str::from_utf8(input)
        .map_err(|_| SignatureError::Key("PEM data is not valid UTF-8".to_owned()))?;
    let mut blocks = Vec::new();
    let mut rest = text.trim_start();

    while !rest.is_empty() {
        let label = rest
            .lines()
            .next()
            .and_then(|line| line.trim_end().strip_prefix("-----BEGIN "))
            .and_then(|line| line.strip_suffix("-----"))
            .ok_or_else(|| SignatureError::Key("unexpected data outside of a PEM block".to_owned()))?;
        let end_marker = format!("-----END {label}-----");
        let block_len = rest
            .find(&end_marker)
            .map(|at| at + end_marker.len())
            .ok_or_else(|| SignatureError::Key(format!("unterminated PEM block {label}")))?;

        let (decoded_label, der) = pem::decode_vec(rest[..block_len].as_bytes())
            .map_err(|e| SignatureError::Key(format!("invalid PEM block {label}: {e}")))?;
        blocks.push(PemBlock {
            label: decoded_label.to_owned(),
            der,
        });
        rest = rest[block_len..].trim_start();
    }
    Ok(blocks)
}

/// Decode `input`, which must contain exactly one PEM block.
///
/// # Errors
///
/// Fails if `input` holds zero or several blocks, or is malformed.
pub fn parse_single_pem(input: &[u8]) -> Result<PemBlock, SignatureError> {
    let mut blocks = parse_pem_blocks(input)?;
    match blocks.len() {
        1 => Ok(blocks.remove(0)),
        0 => Err(SignatureError::Key("no PEM block found".to_owned())),
        n => Err(SignatureError::Key(format!(
            "expected exactly one PEM block, found {n}"
        ))),
    }
}

// ── Public keys ──────────────────────────────────────────────────────

/// The algorithm family of a [`PublicKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    /// ECDSA over NIST P-256.
    EcdsaP256,
    /// ECDSA over NIST P-384.
    EcdsaP384,
    /// RSA (PKCS#1 v1.5 signatures).
    Rsa,
    /// Ed25519.
    Ed25519,
}

/// A parsed public key usable for signature verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    algorithm: KeyAlgorithm,
    key_bytes: Vec<u8>,
    spki_der: Vec<u8>,
}

impl PublicKey {
    /// Parse a DER-encoded `SubjectPublicKeyInfo`.
    ///
    /// # Errors
    ///
    /// Returns [`SignatureError::Key`] for malformed or unsupported keys.
    pub fn from_spki_der(der: &[u8]) -> Result<Self, SignatureError> {
        let spki = SubjectPublicKeyInfoOwned::from_der(der)
            .map_err(|e| SignatureError::Key(format!("invalid SubjectPublicKeyInfo: {e}")))?;
        Self::from_spki(&spki)
    }

    /// Build a key from an already decoded `SubjectPublicKeyInfo`.
    ///
    /// # Errors
    ///
    /// Returns [`SignatureError::Key`] for unsupported algorithms or curves.
    pub fn from_spki(spki: &SubjectPublicKeyInfoOwned) -> Result<Self, SignatureError> {
        let oid = spki.algorithm.oid;
        let algorithm = if oid == OID_EC_PUBLIC_KEY {
            let curve = spki
                .algorithm
                .parameters
                .as_ref()
                .and_then(|p| p.decode_as::<ObjectIdentifier>().ok())
                .ok_or_else(|| SignatureError::Key("EC key without a named curve".to_owned()))?;
            match curve {
                c if c == OID_SECP256R1 => KeyAlgorithm::EcdsaP256,
                c if c == OID_SECP384R1 => KeyAlgorithm::EcdsaP384,
                c => return Err(SignatureError::Key(format!("unsupported EC curve {c}"))),
            }
        } else if oid == OID_RSA_ENCRYPTION {
            KeyAlgorithm::Rsa
        } else if oid == OID_ED25519 {
            KeyAlgorithm::Ed25519
        } else {
            return Err(SignatureError::Key(format!(
                "unsupported public key algorithm {oid}"
            )));
        };
        let key_bytes = spki
            .subject_public_key
            .as_bytes()
            .ok_or_else(|| SignatureError::Key("public key has unused bits".to_owned()))?
            .to_vec();
        let spki_der = spki
            .to_der()
            .map_err(|e| SignatureError::Key(format!("re-encoding public key: {e}")))?;
        Ok(Self {
            algorithm,
            key_bytes,
            spki_der,
        })
    }

    /// Parse a single PEM `PUBLIC KEY` block.
    ///
    /// # Errors
    ///
    /// Fails if `pem` is not exactly one parseable public key.
    pub fn from_pem(pem: &[u8]) -> Result<Self, SignatureError> {
        let block = parse_single_pem(pem)?;
        if block.label != "PUBLIC KEY" {
            return Err(SignatureError::Key(format!(
                "expected a PUBLIC KEY PEM block, got {}",
                block.label
            )));
        }
        Self::from_spki_der(&block.der)
    }

    /// The key's algorithm family.
    #[must_use]
    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    /// The DER `SubjectPublicKeyInfo`.
    #[must_use]
    pub fn spki_der(&self) -> &[u8] {
        &self.spki_der
    }

    /// The key as a PEM `PUBLIC KEY` block.
    ///
    /// # Errors
    ///
    /// Returns [`SignatureError::Key`] if encoding fails.
    pub fn to_pem(&self) -> Result<String, SignatureError> {
        der_to_pem(&self.spki_der, "PUBLIC KEY")
    }

    /// Verify `signature` over `message` the way container signatures are
    /// produced: SHA-256 for ECDSA (ASN.1 signatures) and RSA, pure Ed25519.
    ///
    /// # Errors
    ///
    /// Returns [`SignatureError::InvalidSignature`] if the signature does
    /// not verify.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), SignatureError> {
        let alg: &'static dyn VerificationAlgorithm = match self.algorithm {
            KeyAlgorithm::EcdsaP256 => &signature::ECDSA_P256_SHA256_ASN1,
            KeyAlgorithm::EcdsaP384 => &signature::ECDSA_P384_SHA256_ASN1,
            KeyAlgorithm::Rsa => &signature::RSA_PKCS1_2048_8192_SHA256,
            KeyAlgorithm::Ed25519 => &signature::ED25519,
        };
        self.verify_with(alg, message, signature)
    }

    /// Verify an X.509 signature produced with `signature_algorithm`.
    ///
    /// # Errors
    ///
    /// Fails for algorithm/key mismatches, unsupported algorithms, or a
    /// signature that does not verify.
    pub fn verify_x509_signature(
        &self,
        signature_algorithm: &ObjectIdentifier,
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), SignatureError> {
        let sig_alg = *signature_algorithm;
        let alg: &'static dyn VerificationAlgorithm = match (self.algorithm, sig_alg) {
            (KeyAlgorithm::EcdsaP256, a) if a == OID_ECDSA_SHA256 => {
                &signature::ECDSA_P256_SHA256_ASN1
            }
            (KeyAlgorithm::EcdsaP256, a) if a == OID_ECDSA_SHA384 => {
                &signature::ECDSA_P256_SHA384_ASN1
            }
            (KeyAlgorithm::EcdsaP384, a) if a == OID_ECDSA_SHA256 => {
                &signature::ECDSA_P384_SHA256_ASN1
            }
            (KeyAlgorithm::EcdsaP384, a) if a == OID_ECDSA_SHA384 => {
                &signature::ECDSA_P384_SHA384_ASN1
            }
            (KeyAlgorithm::Rsa, a) if a == OID_RSA_SHA256 => &signature::RSA_PKCS1_2048_8192_SHA256,
            (KeyAlgorithm::Rsa, a) if a == OID_RSA_SHA384 => &signature::RSA_PKCS1_2048_8192_SHA384,
            (KeyAlgorithm::Rsa, a) if a == OID_RSA_SHA512 => &signature::RSA_PKCS1_2048_8192_SHA512,
            (KeyAlgorithm::Ed25519, a) if a == OID_ED25519 => &signature::ED25519,
            (key, a) => {
                return Err(SignatureError::InvalidSignature(format!(
                    "unsupported signature algorithm {a} for {key:?} key"
                )));
            }
        };
        self.verify_with(alg, message, signature)
    }

    fn verify_with(
        &self,
        alg: &'static dyn VerificationAlgorithm,
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), SignatureError> {
        UnparsedPublicKey::new(alg, &self.key_bytes)
            .verify(message, signature)
            .map_err(|_| SignatureError::invalid("invalid signature when validating ASN.1 encoded signature"))
    }
}

// ── Local signer ─────────────────────────────────────────────────────

/// ECDSA P-256 signer backed by `aws-lc-rs`, for producing sigstore-style
/// signatures from a local PKCS#8 key.
pub struct LocalSigner {
    key_pair: EcdsaKeyPair,
    rng: SystemRandom,
}

impl LocalSigner {
    /// Generate a fresh key.
    ///
    /// # Errors
    ///
    /// Returns [`SignatureError::Key`] if key generation fails.
    pub fn generate() -> Result<Self, SignatureError> {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &rng)
            .map_err(|e| SignatureError::Key(format!("failed to generate key: {e}")))?;
        let key_pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, pkcs8.as_ref())
            .map_err(|e| SignatureError::Key(format!("failed to load generated key: {e}")))?;
        Ok(Self { key_pair, rng })
    }

    /// Load a PEM `PRIVATE KEY` (PKCS#8) block.
    ///
    /// # Errors
    ///
    /// Returns [`SignatureError::Key`] if the PEM or the key is invalid.
    pub fn from_pkcs8_pem(pem: &[u8]) -> Result<Self, SignatureError> {
        let block = parse_single_pem(pem)?;
        let key_pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &block.der)
            .map_err(|e| SignatureError::Key(format!("failed to parse PKCS#8 key: {e}")))?;
        Ok(Self {
            key_pair,
            rng: SystemRandom::new(),
        })
    }

    /// The PKCS#8 document for this key, PEM-encoded.
    ///
    /// # Errors
    ///
    /// Returns [`SignatureError::Key`] if serialization fails.
    pub fn to_pkcs8_pem(&self) -> Result<String, SignatureError> {
        let doc = self
            .key_pair
            .to_pkcs8v1()
            .map_err(|e| SignatureError::Key(format!("failed to export key: {e}")))?;
        der_to_pem(doc.as_ref(), "PRIVATE KEY")
    }

    /// The public half as a [`PublicKey`].
    ///
    /// # Errors
    ///
    /// Fails only if the encoded point is rejected by the SPKI parser.
    pub fn public_key(&self) -> Result<PublicKey, SignatureError> {
        PublicKey::from_spki_der(&encode_p256_spki(self.key_pair.public_key().as_ref()))
    }

    /// Sign `message` (ECDSA P-256, SHA-256, ASN.1 signature).
    ///
    /// # Errors
    ///
    /// Returns [`SignatureError::Key`] if signing fails.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SignatureError> {
        self.key_pair
            .sign(&self.rng, message)
            .map(|sig| sig.as_ref().to_vec())
            .map_err(|e| SignatureError::Key(format!("signing failed: {e}")))
    }
}

/// Encode a raw P-256 public key (uncompressed point, 65 bytes) as
/// `SubjectPublicKeyInfo` DER.
///
/// The SPKI structure for P-256 has a fixed 26-byte header:
/// ```text
/// SEQUENCE {
///   SEQUENCE {
///     OID 1.2.840.10045.2.1  (id-ecPublicKey)
///     OID 1.2.840.10045.3.1.7 (prime256v1)
///   }
///   BIT STRING <public key>
/// }
/// ```
#[must_use]
pub fn encode_p256_spki(point: &[u8]) -> Vec<u8> {
    #[rustfmt::skip]
    const SPKI_HEADER: [u8; 26] = [
        0x30, 0x59,
        0x30, 0x13,
        0x06, 0x07,
        0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01,
        0x06, 0x08,
        0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07,
        0x03, 0x42, 0x00,
    ];

    let mut spki = Vec::with_capacity(SPKI_HEADER.len() + point.len());
    spki.extend_from_slice(&SPKI_HEADER);
    spki.extend_from_slice(point);
    spki
}
