//! OpenPGP signing mechanisms.
//!
//! [`SigningMechanism`] is the seam between signature formats and an
//! OpenPGP engine. [`SequoiaMechanism`] implements it with
//! `sequoia-openpgp` over an ephemeral keyring: the imported certificates
//! are written to a private temporary directory that is removed when the
//! mechanism is dropped, on success and failure paths alike. Nothing is
//! ever read from or written to a user's default keyring.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use sequoia_openpgp as openpgp;

use openpgp::cert::{Cert, CertParser};
use openpgp::parse::Parse;
use openpgp::parse::stream::{MessageLayer, MessageStructure, VerificationHelper, VerifierBuilder};
use openpgp::policy::StandardPolicy;
use openpgp::serialize::Serialize as _;
use openpgp::serialize::stream::{LiteralWriter, Message, Signer};
use openpgp::{Fingerprint, KeyHandle};
use tempfile::TempDir;

use crate::error::SignatureError;

/// File name of the public keyring inside an ephemeral keyring directory.
const KEYRING_FILE: &str = "pubring.pgp";

/// An OpenPGP engine able to verify, and possibly create, signatures.
pub trait SigningMechanism {
    /// Fail unless [`SigningMechanism::sign`] can work.
    ///
    /// # Errors
    ///
    /// Explains why signing is unavailable.
    fn supports_signing(&self) -> Result<(), SignatureError>;

    /// Sign `input` with the key identified by `key_identity`, producing
    /// an inline-signed OpenPGP message.
    ///
    /// # Errors
    ///
    /// Fails if the key is unknown or has no usable signing subkey.
    fn sign(&self, input: &[u8], key_identity: &str) -> Result<Vec<u8>, SignatureError>;

    /// Verify an inline-signed message, returning its contents and the
    /// identity (primary key fingerprint) of the signer.
    ///
    /// # Errors
    ///
    /// Fails if no signature by a known key verifies.
    fn verify(&self, unverified: &[u8]) -> Result<(Vec<u8>, String), SignatureError>;
}

/// A `sequoia-openpgp` mechanism over an ephemeral, isolated keyring.
pub struct SequoiaMechanism {
    keyring: TempDir,
    public: Vec<Cert>,
    signing: Vec<Cert>,
}

impl std::fmt::Debug for SequoiaMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequoiaMechanism")
            .field("keyring", &self.keyring.path())
            .field("public", &self.public.len())
            .field("signing", &self.signing.len())
            .finish()
    }
}

impl SequoiaMechanism {
    /// Create a fresh keyring containing only the certificates in `blobs`
    /// (binary or ASCII-armored), returning the mechanism and the
    /// identities of every imported certificate.
    ///
    /// Certificates that include unencrypted secret keys can also be used
    /// for [`SigningMechanism::sign`].
    ///
    /// # Errors
    ///
    /// Fails if a blob cannot be parsed, the keyring cannot be written, or
    /// no keys were imported at all.
    pub fn new_ephemeral<B: AsRef<[u8]>>(
        blobs: &[B],
    ) -> Result<(Self, Vec<String>), SignatureError> {
        let keyring = tempfile::Builder::new()
            .prefix("custos-keyring-")
            .tempdir()?;
        let keyring_path = keyring.path().join(KEYRING_FILE);

        let mut signing = Vec::new();
        {
            let mut out = File::create(&keyring_path)?;
            for blob in blobs {
                let parser = CertParser::from_bytes(blob.as_ref()).map_err(mechanism_error)?;
                for cert in parser {
                    let cert = cert.map_err(mechanism_error)?;
                    cert.serialize(&mut out).map_err(mechanism_error)?;
                    if cert.is_tsk() {
                        signing.push(cert);
                    }
                }
            }
            out.flush()?;
        }

        let public = load_keyring(&keyring_path)?;
        if public.is_empty() {
            return Err(SignatureError::Mechanism("No public keys imported".to_owned()));
        }
        let identities: Vec<String> = public.iter().map(|c| c.fingerprint().to_hex()).collect();
        tracing::debug!(
            keys = identities.len(),
            keyring = %keyring.path().display(),
            "created ephemeral OpenPGP keyring"
        );

        Ok((
            Self {
                keyring,
                public,
                signing,
            },
            identities,
        ))
    }

    /// The directory holding the ephemeral keyring. It is deleted when the
    /// mechanism is dropped.
    #[must_use]
    pub fn keyring_dir(&self) -> &Path {
        self.keyring.path()
    }

    /// Delete the keyring now, reporting any failure instead of ignoring
    /// it as `Drop` must.
    ///
    /// # Errors
    ///
    /// Returns the I/O error from removing the directory.
    pub fn close(self) -> Result<(), SignatureError> {
        Ok(self.keyring.close()?)
    }
}

fn load_keyring(path: &Path) -> Result<Vec<Cert>, SignatureError> {
    let mut bytes = Vec::new();
    File::open(path)
        .and_then(|mut f| f.read_to_end(&mut bytes))
        .map_err(|source| SignatureError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    CertParser::from_bytes(&bytes)
        .map_err(mechanism_error)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(mechanism_error)
}

fn mechanism_error(e: impl std::fmt::Display) -> SignatureError {
    SignatureError::Mechanism(e.to_string())
}

fn matches_identity(cert: &Cert, key_identity: &str) -> bool {
    cert.keys()
        .any(|ka| ka.key().fingerprint().to_hex().eq_ignore_ascii_case(key_identity))
}

impl SigningMechanism for SequoiaMechanism {
    fn supports_signing(&self) -> Result<(), SignatureError> {
        if self.signing.is_empty() {
            Err(SignatureError::Mechanism(
                "signing requires a certificate with secret key material".to_owned(),
            ))
        } else {
            Ok(())
        }
    }

    fn sign(&self, input: &[u8], key_identity: &str) -> Result<Vec<u8>, SignatureError> {
        let policy = StandardPolicy::new();
        let cert = self
            .signing
            .iter()
            .find(|c| matches_identity(c, key_identity))
            .ok_or_else(|| {
                SignatureError::Mechanism(format!("no secret key for identity {key_identity}"))
            })?;
        let key = cert
            .keys()
            .unencrypted_secret()
            .with_policy(&policy, None)
            .alive()
            .revoked(false)
            .for_signing()
            .next()
            .ok_or_else(|| {
                SignatureError::Mechanism(format!("key {key_identity} has no usable signing key"))
            })?;
        let keypair = key.key().clone().into_keypair().map_err(mechanism_error)?;

        let mut sink = Vec::new();
        {
            let message = Message::new(&mut sink);
            let signer = Signer::new(message, keypair).build().map_err(mechanism_error)?;
            let mut literal = LiteralWriter::new(signer).build().map_err(mechanism_error)?;
            literal.write_all(input)?;
            literal.finalize().map_err(mechanism_error)?;
        }
        Ok(sink)
    }

    fn verify(&self, unverified: &[u8]) -> Result<(Vec<u8>, String), SignatureError> {
        let policy = StandardPolicy::new();
        let helper = Helper {
            certs: &self.public,
            signer: None,
        };
        let mut verifier = VerifierBuilder::from_bytes(unverified)
            .map_err(mechanism_error)?
            .with_policy(&policy, None, helper)
            .map_err(mechanism_error)?;
        let mut contents = Vec::new();
        verifier
            .read_to_end(&mut contents)
            .map_err(mechanism_error)?;
        let helper = verifier.into_helper();

        let Some(signing_key) = helper.signer else {
            return Err(SignatureError::Mechanism("No valid signature".to_owned()));
        };
        let identity = self
            .public
            .iter()
            .find(|c| c.keys().any(|ka| ka.key().fingerprint() == signing_key))
            .map(|c| c.fingerprint().to_hex())
            .ok_or_else(|| {
                SignatureError::Mechanism(format!("signing key {signing_key} is not in the keyring"))
            })?;
        Ok((contents, identity))
    }
}

struct Helper<'a> {
    certs: &'a [Cert],
    signer: Option<Fingerprint>,
}

impl VerificationHelper for Helper<'_> {
    fn get_certs(&mut self, _ids: &[KeyHandle]) -> openpgp::Result<Vec<Cert>> {
        Ok(self.certs.to_vec())
    }

    fn check(&mut self, structure: MessageStructure) -> openpgp::Result<()> {
        for layer in structure {
            if let MessageLayer::SignatureGroup { results } = layer {
                if let Some(Ok(good)) = results.iter().find(|r| r.is_ok()) {
                    self.signer = Some(good.ka.key().fingerprint());
                    return Ok(());
                }
            }
        }
        Err(openpgp::Error::BadSignature("No valid signature".to_owned()).into())
    }
}
