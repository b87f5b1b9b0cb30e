//! X.509 certificate parsing and chain verification.
//!
//! Chains are built upward from the leaf: each step looks for a candidate
//! (trusted roots first, then the untrusted intermediates) whose subject
//! equals the current issuer and whose key verifies the current
//! signature. Every certificate on the path must be valid at the
//! verification time, allow code signing if it restricts extended key
//! usage, and carry no critical extension we do not understand.

use chrono::{DateTime, Utc};
use custos_signature::PublicKey;
use custos_signature::keys::parse_pem_blocks;
use der::asn1::ObjectIdentifier;
use der::{Decode, Encode};
use x509_cert::Certificate;
use x509_cert::ext::Extension;
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::{BasicConstraints, ExtendedKeyUsage, SubjectAltName};

use crate::error::PolicyError;

/// Longest chain we try to build, leaf included.
const MAX_CHAIN_DEPTH: usize = 16;

const OID_SUBJECT_KEY_ID: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.14");
const OID_KEY_USAGE: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.15");
const OID_SUBJECT_ALT_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.17");
const OID_BASIC_CONSTRAINTS: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.19");
const OID_CERTIFICATE_POLICIES: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.32");
const OID_AUTHORITY_KEY_ID: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.35");
const OID_EXTENDED_KEY_USAGE: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.37");
const OID_EKU_ANY: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.37.0");
const OID_EKU_CODE_SIGNING: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.3");

/// A decoded certificate with its original encoding.
#[derive(Debug, Clone)]
pub struct ParsedCertificate {
    der: Vec<u8>,
    tbs_der: Vec<u8>,
    cert: Certificate,
}

impl PartialEq for ParsedCertificate {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

impl ParsedCertificate {
    /// Decode one DER certificate.
    ///
    /// # Errors
    ///
    /// Fails for malformed DER.
    pub fn from_der(der: &[u8]) -> Result<Self, PolicyError> {
        let cert = Certificate::from_der(der)
            .map_err(|e| PolicyError::certificate(format!("invalid certificate DER: {e}")))?;
        let tbs_der = cert
            .tbs_certificate
            .to_der()
            .map_err(|e| PolicyError::certificate(format!("re-encoding certificate: {e}")))?;
        Ok(Self {
            der: der.to_vec(),
            tbs_der,
            cert,
        })
    }

    /// The DER encoding.
    #[must_use]
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// The decoded certificate.
    #[must_use]
    pub fn certificate(&self) -> &Certificate {
        &self.cert
    }

    /// The subject public key.
    ///
    /// # Errors
    ///
    /// Fails for unsupported key types.
    pub fn public_key(&self) -> Result<PublicKey, PolicyError> {
        Ok(PublicKey::from_spki(&self.cert.tbs_certificate.subject_public_key_info)?)
    }

    /// Start of the validity period.
    #[must_use]
    pub fn not_before(&self) -> DateTime<Utc> {
        self.cert.tbs_certificate.validity.not_before.to_system_time().into()
    }

    /// End of the validity period.
    #[must_use]
    pub fn not_after(&self) -> DateTime<Utc> {
        self.cert.tbs_certificate.validity.not_after.to_system_time().into()
    }

    /// All extensions, in certificate order.
    #[must_use]
    pub fn extensions(&self) -> &[Extension] {
        self.cert.tbs_certificate.extensions.as_deref().unwrap_or_default()
    }

    /// The extension with `oid`, if present exactly once.
    ///
    /// # Errors
    ///
    /// Fails if the extension appears more than once.
    pub fn extension(&self, oid: &ObjectIdentifier) -> Result<Option<&Extension>, PolicyError> {
        let mut matching = self.extensions().iter().filter(|e| e.extn_id == *oid);
        let first = matching.next();
        if matching.next().is_some() {
            return Err(PolicyError::certificate(format!(
                "certificate contains duplicate extension {oid}"
            )));
        }
        Ok(first)
    }

    fn subject_alt_names(&self) -> Result<Vec<GeneralName>, PolicyError> {
        match self.extension(&OID_SUBJECT_ALT_NAME)? {
            Some(ext) => SubjectAltName::from_der(ext.extn_value.as_bytes())
                .map(|san| san.0)
                .map_err(|e| PolicyError::certificate(format!("invalid subject alternative name: {e}"))),
            None => Ok(Vec::new()),
        }
    }

    /// Email addresses in the subject alternative name.
    ///
    /// # Errors
    ///
    /// Fails for a malformed SAN extension.
    pub fn email_addresses(&self) -> Result<Vec<String>, PolicyError> {
        Ok(self
            .subject_alt_names()?
            .into_iter()
            .filter_map(|n| match n {
                GeneralName::Rfc822Name(email) => Some(email.to_string()),
                _ => None,
            })
            .collect())
    }

    /// DNS names in the subject alternative name.
    ///
    /// # Errors
    ///
    /// Fails for a malformed SAN extension.
    pub fn dns_names(&self) -> Result<Vec<String>, PolicyError> {
        Ok(self
            .subject_alt_names()?
            .into_iter()
            .filter_map(|n| match n {
                GeneralName::DnsName(name) => Some(name.to_string()),
                _ => None,
            })
            .collect())
    }

    /// IP addresses in the subject alternative name, as raw octets.
    ///
    /// # Errors
    ///
    /// Fails for a malformed SAN extension.
    pub fn ip_addresses(&self) -> Result<Vec<Vec<u8>>, PolicyError> {
        Ok(self
            .subject_alt_names()?
            .into_iter()
            .filter_map(|n| match n {
                GeneralName::IpAddress(ip) => Some(ip.as_bytes().to_vec()),
                _ => None,
            })
            .collect())
    }

    fn basic_constraints(&self) -> Result<Option<BasicConstraints>, PolicyError> {
        self.extension(&OID_BASIC_CONSTRAINTS)?
            .map(|ext| {
                BasicConstraints::from_der(ext.extn_value.as_bytes())
                    .map_err(|e| PolicyError::certificate(format!("invalid basic constraints: {e}")))
            })
            .transpose()
    }

    fn extended_key_usage(&self) -> Result<Option<ExtendedKeyUsage>, PolicyError> {
        self.extension(&OID_EXTENDED_KEY_USAGE)?
            .map(|ext| {
                ExtendedKeyUsage::from_der(ext.extn_value.as_bytes())
                    .map_err(|e| PolicyError::certificate(format!("invalid extended key usage: {e}")))
            })
            .transpose()
    }

    /// Whether `issuer` names and signed this certificate.
    fn is_issued_by(&self, issuer: &Self) -> bool {
        if self.cert.tbs_certificate.issuer != issuer.cert.tbs_certificate.subject {
            return false;
        }
        let Some(signature) = self.cert.signature.as_bytes() else {
            return false;
        };
        issuer.public_key().is_ok_and(|key| {
            key.verify_x509_signature(&self.cert.signature_algorithm.oid, &self.tbs_der, signature)
                .is_ok()
        })
    }

    /// Checks that apply to every certificate on a chain.
    fn check_usable(&self, at: DateTime<Utc>) -> Result<(), PolicyError> {
        if at < self.not_before() || at > self.not_after() {
            return Err(PolicyError::certificate(format!(
                "certificate has expired or is not yet valid: current time {} is outside of {} .. {}",
                at.to_rfc3339(),
                self.not_before().to_rfc3339(),
                self.not_after().to_rfc3339()
            )));
        }
        for ext in self.extensions().iter().filter(|e| e.critical) {
            if !Self::handles_critical(ext) {
                return Err(PolicyError::certificate(format!(
                    "unhandled critical extension {}",
                    ext.extn_id
                )));
            }
        }
        if let Some(eku) = self.extended_key_usage()? {
            if !eku.0.iter().any(|u| *u == OID_EKU_CODE_SIGNING || *u == OID_EKU_ANY) {
                return Err(PolicyError::certificate(
                    "certificate specifies an incompatible key usage",
                ));
            }
        }
        Ok(())
    }

    fn handles_critical(ext: &Extension) -> bool {
        const UNDERSTOOD: [ObjectIdentifier; 6] = [
            OID_KEY_USAGE,
            OID_BASIC_CONSTRAINTS,
            OID_EXTENDED_KEY_USAGE,
            OID_SUBJECT_KEY_ID,
            OID_AUTHORITY_KEY_ID,
            OID_CERTIFICATE_POLICIES,
        ];
        if UNDERSTOOD.contains(&ext.extn_id) {
            return true;
        }
        // A SAN carrying only otherName entries is not understood.
        ext.extn_id == OID_SUBJECT_ALT_NAME
            && SubjectAltName::from_der(ext.extn_value.as_bytes())
                .is_ok_and(|san| san.0.iter().any(|n| !matches!(n, GeneralName::OtherName(_))))
    }

    /// Checks for a certificate acting as an issuer with `below`
    /// intermediates between it and the leaf.
    fn check_issuer(&self, below: usize, is_root: bool) -> Result<(), PolicyError> {
        let constraints = self.basic_constraints()?;
        if !is_root && !constraints.as_ref().is_some_and(|bc| bc.ca) {
            return Err(PolicyError::certificate(
                "certificate is not authorized to sign other certificates",
            ));
        }
        if let Some(max) = constraints.and_then(|bc| bc.path_len_constraint) {
            if below > usize::from(max) {
                return Err(PolicyError::certificate("too many intermediates for path length constraint"));
            }
        }
        Ok(())
    }
}

/// Decode every `CERTIFICATE` block of a PEM bundle.
///
/// # Errors
///
/// Fails for malformed PEM, other block types, or undecodable
/// certificates.
pub fn parse_pem_certificates(data: &[u8]) -> Result<Vec<ParsedCertificate>, PolicyError> {
    parse_pem_blocks(data)?
        .into_iter()
        .map(|block| {
            if block.label != "CERTIFICATE" {
                return Err(PolicyError::certificate(format!(
                    "unexpected PEM block {} in certificate data",
                    block.label
                )));
            }
            ParsedCertificate::from_der(&block.der)
        })
        .collect()
}

/// Decode the single leaf certificate attached to a signature.
///
/// # Errors
///
/// Fails unless `pem` holds exactly one certificate.
pub fn parse_leaf_certificate(pem: &[u8]) -> Result<ParsedCertificate, PolicyError> {
    let mut certs = parse_pem_certificates(pem)
        .map_err(|e| PolicyError::certificate(format!("parsing leaf certificate: {e}")))?;
    match certs.len() {
        0 => Err(PolicyError::certificate(
            "no certificate found in signature certificate data",
        )),
        1 => Ok(certs.remove(0)),
        _ => Err(PolicyError::certificate(
            "unexpected multiple certificates present in signature certificate data",
        )),
    }
}

/// Verify that `leaf` chains to one of `roots` at time `at`, possibly
/// through `intermediates`.
///
/// Every candidate issuer is tried, so a cross-signed intermediate that
/// leads to an untrusted root does not hide another one that works.
///
/// # Errors
///
/// Describes the last check that failed once every path is exhausted, or
/// reports an unknown authority if no candidate issuer was found at all.
pub fn verify_chain(
    leaf: &ParsedCertificate,
    intermediates: &[ParsedCertificate],
    roots: &[ParsedCertificate],
    at: DateTime<Utc>,
) -> Result<(), PolicyError> {
    leaf.check_usable(at)?;
    if roots.contains(leaf) {
        return Ok(());
    }

    let mut search = ChainSearch {
        intermediates,
        roots,
        at,
        path: vec![leaf],
        last_rejection: None,
    };
    if let Some(depth) = search.extend(leaf) {
        tracing::debug!(depth, "certificate chain verified");
        return Ok(());
    }
    Err(search.last_rejection.unwrap_or_else(|| {
        PolicyError::certificate("x509: certificate signed by unknown authority")
    }))
}

/// Depth-first search for a path from the leaf to a trusted root.
struct ChainSearch<'a> {
    intermediates: &'a [ParsedCertificate],
    roots: &'a [ParsedCertificate],
    at: DateTime<Utc>,
    /// The leaf followed by the intermediates chosen so far.
    path: Vec<&'a ParsedCertificate>,
    last_rejection: Option<PolicyError>,
}

impl<'a> ChainSearch<'a> {
    /// Find an issuer path above `current`, the last entry of `path`.
    /// Returns the number of issuers between the leaf and the root, root
    /// included.
    fn extend(&mut self, current: &'a ParsedCertificate) -> Option<usize> {
        let below = self.path.len() - 1;
        if below >= MAX_CHAIN_DEPTH {
            return None;
        }

        let roots = self.roots;
        for root in roots {
            if current.is_issued_by(root) && self.accept(root, below, true) {
                return Some(below + 1);
            }
        }

        let intermediates = self.intermediates;
        for candidate in intermediates {
            if self.path.contains(&candidate)
                || !current.is_issued_by(candidate)
                || !self.accept(candidate, below, false)
            {
                continue;
            }
            self.path.push(candidate);
            let found = self.extend(candidate);
            self.path.pop();
            if found.is_some() {
                return found;
            }
        }
        None
    }

    fn accept(&mut self, issuer: &ParsedCertificate, below: usize, is_root: bool) -> bool {
        match issuer
            .check_usable(self.at)
            .and_then(|()| issuer.check_issuer(below, is_root))
        {
            Ok(()) => true,
            Err(e) => {
                self.last_rejection = Some(e);
                false
            }
        }
    }
}
