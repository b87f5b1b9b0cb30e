//! Turning configured key and certificate sources into verification
//! material.
//!
//! Sources are read and parsed on every evaluation, so a policy change on
//! disk takes effect without rebuilding the [`crate::PolicyContext`].

use std::path::Path;

use custos_signature::PublicKey;
use custos_signature::keys::KeyAlgorithm;

use crate::certs::{ParsedCertificate, parse_pem_certificates};
use crate::error::PolicyError;
use crate::types::{CertSource, FulcioTrust, KeySource, PkiTrust, SigstoreSigned, SigstoreTrust};

/// Trusted Fulcio CAs and the identity a certificate must carry.
#[derive(Debug)]
pub struct FulcioTrustRoot {
    pub(crate) ca_certificates: Vec<ParsedCertificate>,
    pub(crate) oidc_issuer: String,
    pub(crate) subject_email: String,
}

/// Trusted PKI roots, optional intermediates and the required subject.
#[derive(Debug)]
pub struct PkiTrustRoot {
    pub(crate) roots: Vec<ParsedCertificate>,
    pub(crate) intermediates: Vec<ParsedCertificate>,
    pub(crate) subject_email: Option<String>,
    pub(crate) subject_hostname: Option<String>,
}

/// What a sigstore signature's key is checked against.
#[derive(Debug)]
pub enum TrustAnchor {
    /// Any of these keys.
    PublicKeys(Vec<PublicKey>),
    /// A certificate issued by Fulcio.
    Fulcio(FulcioTrustRoot),
    /// A certificate issued by a caller-supplied PKI.
    Pki(PkiTrustRoot),
}

/// Prepared material for one `sigstoreSigned` evaluation.
#[derive(Debug)]
pub struct SigstoreTrustRoot {
    /// The trust anchor.
    pub anchor: TrustAnchor,
    /// Rekor log keys, when inclusion proofs are required.
    pub rekor_keys: Option<Vec<PublicKey>>,
}

impl SigstoreSigned {
    /// Read and parse all configured key and certificate material.
    ///
    /// # Errors
    ///
    /// Fails if a file cannot be read or its contents do not parse.
    pub fn prepare_trust_root(&self) -> Result<SigstoreTrustRoot, PolicyError> {
        let anchor = match self.trust() {
            SigstoreTrust::PublicKeys(source) => {
                TrustAnchor::PublicKeys(parse_public_keys(&load_key_source(source)?)?)
            }
            SigstoreTrust::Fulcio(fulcio) => TrustAnchor::Fulcio(prepare_fulcio(fulcio)?),
            SigstoreTrust::Pki(pki) => TrustAnchor::Pki(prepare_pki(pki)?),
        };
        let rekor_keys = self
            .rekor()
            .map(|source| parse_rekor_keys(&load_key_source(source)?))
            .transpose()?;
        Ok(SigstoreTrustRoot { anchor, rekor_keys })
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, PolicyError> {
    std::fs::read(path).map_err(|source| PolicyError::Io {
        path: path.to_owned(),
        source,
    })
}

/// The raw blobs of a key source, one per key.
///
/// # Errors
///
/// Fails if a file cannot be read.
pub fn load_key_source(source: &KeySource) -> Result<Vec<Vec<u8>>, PolicyError> {
    match source {
        KeySource::Path(path) => Ok(vec![read_file(path)?]),
        KeySource::Paths(paths) => paths.iter().map(|p| read_file(p)).collect(),
        KeySource::Data(data) => Ok(vec![data.clone()]),
        KeySource::Datas(datas) => Ok(datas.clone()),
    }
}

fn load_cert_source(source: &CertSource) -> Result<Vec<u8>, PolicyError> {
    match source {
        CertSource::Path(path) => read_file(path),
        CertSource::Data(data) => Ok(data.clone()),
    }
}

fn parse_public_keys(blobs: &[Vec<u8>]) -> Result<Vec<PublicKey>, PolicyError> {
    blobs
        .iter()
        .enumerate()
        .map(|(i, blob)| {
            PublicKey::from_pem(blob)
                .map_err(|e| PolicyError::certificate(format!("parsing public key {}: {e}", i + 1)))
        })
        .collect()
}

fn parse_rekor_keys(blobs: &[Vec<u8>]) -> Result<Vec<PublicKey>, PolicyError> {
    let keys = parse_public_keys(blobs)?;
    for (i, key) in keys.iter().enumerate() {
        if !matches!(key.algorithm(), KeyAlgorithm::EcdsaP256 | KeyAlgorithm::EcdsaP384) {
            return Err(PolicyError::rekor(format!(
                "Rekor public key {} is not using ECDSA",
                i + 1
            )));
        }
    }
    Ok(keys)
}

fn load_pool(source: &CertSource, what: &str) -> Result<Vec<ParsedCertificate>, PolicyError> {
    let data = load_cert_source(source)?;
    let certs = parse_pem_certificates(&data)
        .map_err(|e| PolicyError::certificate(format!("error loading {what}: {e}")))?;
    if certs.is_empty() {
        return Err(PolicyError::certificate(format!(
            "error loading {what}: no certificates found"
        )));
    }
    Ok(certs)
}

/// Intermediates from a signature's chain annotation: every certificate
/// except the last, which is the chain's root.
pub(crate) fn untrusted_intermediates(
    chain_pem: Option<&[u8]>,
) -> Result<Vec<ParsedCertificate>, PolicyError> {
    let Some(chain_pem) = chain_pem.filter(|c| !c.is_empty()) else {
        return Ok(Vec::new());
    };
    let mut chain = parse_pem_certificates(chain_pem)
        .map_err(|e| PolicyError::certificate(format!("loading certificate chain: {e}")))?;
    chain.pop();
    Ok(chain)
}

fn prepare_fulcio(fulcio: &FulcioTrust) -> Result<FulcioTrustRoot, PolicyError> {
    Ok(FulcioTrustRoot {
        ca_certificates: load_pool(fulcio.ca(), "Fulcio CA certificates")?,
        oidc_issuer: fulcio.oidc_issuer().to_owned(),
        subject_email: fulcio.subject_email().to_owned(),
    })
}

fn prepare_pki(pki: &PkiTrust) -> Result<PkiTrustRoot, PolicyError> {
    let intermediates = match pki.ca_intermediates() {
        Some(source) => load_pool(source, "PKI intermediate certificates")?,
        None => Vec::new(),
    };
    Ok(PkiTrustRoot {
        roots: load_pool(pki.ca_roots(), "PKI root certificates")?,
        intermediates,
        subject_email: pki.subject_email().map(str::to_owned),
        subject_hostname: pki.subject_hostname().map(str::to_owned),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use custos_signature::keys::LocalSigner;

    use crate::certs::tests::TestCa;
    use crate::types::PolicyReferenceMatch;

    fn key_pem() -> Vec<u8> {
        LocalSigner::generate()
            .expect("signer")
            .public_key()
            .expect("public key")
            .to_pem()
            .expect("encode")
            .into_bytes()
    }

    fn sigstore(trust: SigstoreTrust, rekor: Option<KeySource>) -> SigstoreSigned {
        SigstoreSigned::new(trust, rekor, PolicyReferenceMatch::default()).expect("valid requirement")
    }

    #[test]
    fn keys_from_data_and_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("key.pub");
        std::fs::write(&path, key_pem()).expect("write key");

        let req = sigstore(
            SigstoreTrust::PublicKeys(KeySource::Paths(vec![path.clone(), path])),
            Some(KeySource::Datas(vec![key_pem()])),
        );
        let root = req.prepare_trust_root().expect("prepare");
        let TrustAnchor::PublicKeys(keys) = root.anchor else {
            panic!("expected public keys");
        };
        assert_eq!(keys.len(), 2);
        assert_eq!(root.rekor_keys.map(|k| k.len()), Some(1));
    }

    #[test]
    fn missing_file_names_the_path() {
        let req = sigstore(
            SigstoreTrust::PublicKeys(KeySource::Path("/nonexistent/custos/key.pub".into())),
            None,
        );
        let err = req.prepare_trust_root().expect_err("missing file");
        assert!(err.to_string().contains("/nonexistent/custos/key.pub"), "{err}");
    }

    #[test]
    fn unparseable_keys_are_numbered() {
        let req = sigstore(
            SigstoreTrust::PublicKeys(KeySource::Datas(vec![key_pem(), b"garbage".to_vec()])),
            None,
        );
        let err = req.prepare_trust_root().expect_err("bad key");
        assert!(err.to_string().contains("parsing public key 2"), "{err}");
    }

    #[test]
    fn rekor_keys_must_be_ecdsa() {
        let ed25519 = "-----BEGIN PUBLIC KEY-----\nMCowBQYDK2VwAyEAGb9ECWmEzf6FQbrBZ9w7lshQhqowtrbLDFw4rXAxZuE=\n-----END PUBLIC KEY-----\n";
        let req = sigstore(
            SigstoreTrust::PublicKeys(KeySource::Data(key_pem())),
            Some(KeySource::Data(ed25519.as_bytes().to_vec())),
        );
        let err = req.prepare_trust_root().expect_err("ed25519 Rekor key");
        assert!(err.to_string().contains("Rekor public key 1 is not using ECDSA"), "{err}");
    }

    #[test]
    fn certificate_pools() {
        let ca = TestCa::new("fulcio");
        let fulcio = FulcioTrust::new(CertSource::Data(ca.pem().into_bytes()), "https://issuer", "a@example.com")
            .expect("fulcio");
        let req = sigstore(SigstoreTrust::Fulcio(fulcio), Some(KeySource::Data(key_pem())));
        let root = req.prepare_trust_root().expect("prepare");
        assert!(matches!(root.anchor, TrustAnchor::Fulcio(ref f) if f.ca_certificates.len() == 1));

        let empty = FulcioTrust::new(CertSource::Data(Vec::new()), "https://issuer", "a@example.com")
            .expect("fulcio");
        let req = sigstore(SigstoreTrust::Fulcio(empty), Some(KeySource::Data(key_pem())));
        let err = req.prepare_trust_root().expect_err("empty pool");
        assert!(err.to_string().contains("error loading Fulcio CA certificates"), "{err}");

        let pki = PkiTrust::new(
            CertSource::Data(ca.pem().into_bytes()),
            Some(CertSource::Data(b"not a certificate".to_vec())),
            Some("a@example.com".to_owned()),
            None,
        )
        .expect("pki");
        let err = sigstore(SigstoreTrust::Pki(pki), None)
            .prepare_trust_root()
            .expect_err("bad intermediates");
        assert!(err.to_string().contains("PKI intermediate certificates"), "{err}");
    }
}
