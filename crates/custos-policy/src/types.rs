//! The policy data model.
//!
//! A [`Policy`] maps docker scopes to ordered lists of
//! [`PolicyRequirement`]s. Requirements and reference matchers are closed
//! enums; the constructors on the payload structs enforce the invariants
//! that the JSON decoder also enforces, so a value built in code is as
//! trustworthy as one read from disk.

use std::collections::BTreeMap;
use std::path::PathBuf;

use custos_signature::ImageReference;
use custos_signature::reference::is_valid_repository_prefix;

use crate::error::PolicyFormatError;

/// An ordered list of requirements; all of them must allow an image.
pub type PolicyRequirements = Vec<PolicyRequirement>;

/// Scope → requirements for one transport.
pub type TransportScopes = BTreeMap<String, PolicyRequirements>;

/// A complete trust policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    /// Requirements for images no scope matches.
    pub default: PolicyRequirements,
    /// Docker scopes: a host, a repository prefix or a full reference.
    /// The empty scope is the docker-wide default.
    pub specific: TransportScopes,
    /// Sections for transports other than docker. They are validated and
    /// preserved but never consulted during evaluation.
    pub other_transports: BTreeMap<String, TransportScopes>,
}

impl Policy {
    /// A policy that applies `default` to every image.
    #[must_use]
    pub fn new(default: PolicyRequirements) -> Self {
        Self {
            default,
            specific: BTreeMap::new(),
            other_transports: BTreeMap::new(),
        }
    }

    /// Add a docker scope.
    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>, requirements: PolicyRequirements) -> Self {
        self.specific.insert(scope.into(), requirements);
        self
    }
}

// ── Requirements ─────────────────────────────────────────────────────

/// One trust requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyRequirement {
    /// Accept any image; has no opinion on signatures.
    InsecureAcceptAnything,
    /// Reject every image and every signature.
    Reject,
    /// Require a simple signing signature by an OpenPGP key.
    SignedBy(SignedBy),
    /// Require a signed base layer. Not implemented; always denies.
    SignedBaseLayer(SignedBaseLayer),
    /// Require a sigstore signature.
    SigstoreSigned(SigstoreSigned),
}

impl PolicyRequirement {
    /// The JSON `type` discriminator.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::InsecureAcceptAnything => "insecureAcceptAnything",
            Self::Reject => "reject",
            Self::SignedBy(_) => "signedBy",
            Self::SignedBaseLayer(_) => "signedBaseLayer",
            Self::SigstoreSigned(_) => "sigstoreSigned",
        }
    }
}

/// Where key material comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// One file (`keyPath`).
    Path(PathBuf),
    /// Several files (`keyPaths`).
    Paths(Vec<PathBuf>),
    /// Inline data (`keyData`, base64 in JSON).
    Data(Vec<u8>),
    /// Several inline blobs (`keyDatas`).
    Datas(Vec<Vec<u8>>),
}

impl KeySource {
    fn validate(&self, paths_field: &str, datas_field: &str) -> Result<(), PolicyFormatError> {
        match self {
            Self::Path(p) if p.as_os_str().is_empty() => {
                Err(PolicyFormatError::new("key path must not be empty"))
            }
            Self::Paths(p) if p.is_empty() => Err(PolicyFormatError::new(format!(
                "\"{paths_field}\" contains no entries"
            ))),
            Self::Paths(p) if p.iter().any(|p| p.as_os_str().is_empty()) => {
                Err(PolicyFormatError::new(format!("\"{paths_field}\" contains an empty path")))
            }
            Self::Datas(d) if d.is_empty() => Err(PolicyFormatError::new(format!(
                "\"{datas_field}\" contains no entries"
            ))),
            _ => Ok(()),
        }
    }
}

/// Where a certificate bundle comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertSource {
    /// A PEM file.
    Path(PathBuf),
    /// Inline PEM (base64 in JSON).
    Data(Vec<u8>),
}

/// Key formats of `signedBy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignedByKeyType {
    /// An OpenPGP keyring. The only implemented type.
    GpgKeys,
    /// OpenPGP keys signed by a trusted key.
    SignedByGpgKeys,
    /// X.509 certificates.
    X509Certificates,
    /// Certificates signed by trusted X.509 CAs.
    SignedByX509Cas,
}

impl SignedByKeyType {
    /// The JSON spelling.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GpgKeys => "GPGKeys",
            Self::SignedByGpgKeys => "signedByGPGKeys",
            Self::X509Certificates => "X509Certificates",
            Self::SignedByX509Cas => "signedByX509CAs",
        }
    }

    /// Parse the JSON spelling.
    ///
    /// # Errors
    ///
    /// Rejects unknown values.
    pub fn parse(s: &str) -> Result<Self, PolicyFormatError> {
        match s {
            "GPGKeys" => Ok(Self::GpgKeys),
            "signedByGPGKeys" => Ok(Self::SignedByGpgKeys),
            "X509Certificates" => Ok(Self::X509Certificates),
            "signedByX509CAs" => Ok(Self::SignedByX509Cas),
            other => Err(PolicyFormatError::new(format!("Unknown key type \"{other}\""))),
        }
    }
}

/// The `signedBy` requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedBy {
    key_type: SignedByKeyType,
    key_source: KeySource,
    signed_identity: PolicyReferenceMatch,
}

impl SignedBy {
    /// Build a `signedBy` requirement.
    ///
    /// # Errors
    ///
    /// Rejects `keyDatas` (not supported by `signedBy`) and empty paths.
    pub fn new(
        key_type: SignedByKeyType,
        key_source: KeySource,
        signed_identity: PolicyReferenceMatch,
    ) -> Result<Self, PolicyFormatError> {
        if matches!(key_source, KeySource::Datas(_)) {
            return Err(PolicyFormatError::new("\"keyDatas\" is not supported by signedBy"));
        }
        key_source.validate("keyPaths", "keyDatas")?;
        Ok(Self {
            key_type,
            key_source,
            signed_identity,
        })
    }

    /// The key format.
    #[must_use]
    pub fn key_type(&self) -> SignedByKeyType {
        self.key_type
    }

    /// Where the keys come from.
    #[must_use]
    pub fn key_source(&self) -> &KeySource {
        &self.key_source
    }

    /// How the signed reference must relate to the image.
    #[must_use]
    pub fn signed_identity(&self) -> &PolicyReferenceMatch {
        &self.signed_identity
    }
}

/// The `signedBaseLayer` requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedBaseLayer {
    /// Identity the base layer must be signed as.
    pub base_layer_identity: PolicyReferenceMatch,
}

/// Fulcio trust: certificates issued by a CA to an OIDC identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FulcioTrust {
    ca: CertSource,
    oidc_issuer: String,
    subject_email: String,
}

impl FulcioTrust {
    /// Build Fulcio trust settings.
    ///
    /// # Errors
    ///
    /// Both the issuer and the email must be non-empty.
    pub fn new(
        ca: CertSource,
        oidc_issuer: impl Into<String>,
        subject_email: impl Into<String>,
    ) -> Result<Self, PolicyFormatError> {
        let oidc_issuer = oidc_issuer.into();
        let subject_email = subject_email.into();
        if oidc_issuer.is_empty() {
            return Err(PolicyFormatError::new("oidcIssuer not specified"));
        }
        if subject_email.is_empty() {
            return Err(PolicyFormatError::new("subjectEmail not specified"));
        }
        Ok(Self {
            ca,
            oidc_issuer,
            subject_email,
        })
    }

    /// The CA bundle.
    #[must_use]
    pub fn ca(&self) -> &CertSource {
        &self.ca
    }

    /// The required OIDC issuer URL.
    #[must_use]
    pub fn oidc_issuer(&self) -> &str {
        &self.oidc_issuer
    }

    /// The required subject email.
    #[must_use]
    pub fn subject_email(&self) -> &str {
        &self.subject_email
    }
}

/// PKI trust: certificates chaining to caller-supplied roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkiTrust {
    ca_roots: CertSource,
    ca_intermediates: Option<CertSource>,
    subject_email: Option<String>,
    subject_hostname: Option<String>,
}

impl PkiTrust {
    /// Build PKI trust settings.
    ///
    /// # Errors
    ///
    /// At least one of the subject email and hostname is required.
    pub fn new(
        ca_roots: CertSource,
        ca_intermediates: Option<CertSource>,
        subject_email: Option<String>,
        subject_hostname: Option<String>,
    ) -> Result<Self, PolicyFormatError> {
        let subject_email = subject_email.filter(|s| !s.is_empty());
        let subject_hostname = subject_hostname.filter(|s| !s.is_empty());
        if subject_email.is_none() && subject_hostname.is_none() {
            return Err(PolicyFormatError::new(
                "At least one of subjectEmail, subjectHostname must be specified",
            ));
        }
        Ok(Self {
            ca_roots,
            ca_intermediates,
            subject_email,
            subject_hostname,
        })
    }

    /// The root CA bundle.
    #[must_use]
    pub fn ca_roots(&self) -> &CertSource {
        &self.ca_roots
    }

    /// The optional intermediate CA bundle.
    #[must_use]
    pub fn ca_intermediates(&self) -> Option<&CertSource> {
        self.ca_intermediates.as_ref()
    }

    /// Required email SAN, if any.
    #[must_use]
    pub fn subject_email(&self) -> Option<&str> {
        self.subject_email.as_deref()
    }

    /// Required hostname, if any.
    #[must_use]
    pub fn subject_hostname(&self) -> Option<&str> {
        self.subject_hostname.as_deref()
    }
}

/// What a sigstore signature must be anchored to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigstoreTrust {
    /// Static public keys.
    PublicKeys(KeySource),
    /// Fulcio-issued certificates.
    Fulcio(FulcioTrust),
    /// Caller-supplied PKI.
    Pki(PkiTrust),
}

/// The `sigstoreSigned` requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigstoreSigned {
    trust: SigstoreTrust,
    rekor: Option<KeySource>,
    signed_identity: PolicyReferenceMatch,
}

impl SigstoreSigned {
    /// Build a `sigstoreSigned` requirement.
    ///
    /// # Errors
    ///
    /// Fulcio requires Rekor keys, PKI forbids them, and key sources must
    /// be non-empty.
    pub fn new(
        trust: SigstoreTrust,
        rekor: Option<KeySource>,
        signed_identity: PolicyReferenceMatch,
    ) -> Result<Self, PolicyFormatError> {
        if let SigstoreTrust::PublicKeys(keys) = &trust {
            keys.validate("keyPaths", "keyDatas")?;
        }
        if let Some(rekor) = &rekor {
            rekor.validate("rekorPublicKeyPaths", "rekorPublicKeyDatas")?;
        }
        match (&trust, &rekor) {
            (SigstoreTrust::Fulcio(_), None) => {
                return Err(PolicyFormatError::new(
                    "At least one of rekorPublicKeyPath, rekorPublicKeyPaths, rekorPublicKeyData and rekorPublicKeyDatas must be specified if fulcio is used",
                ));
            }
            (SigstoreTrust::Pki(_), Some(_)) => {
                return Err(PolicyFormatError::new(
                    "rekorPublicKeyPath, rekorPublicKeyPaths, rekorPublicKeyData and rekorPublicKeyDatas are not supported for pki",
                ));
            }
            _ => {}
        }
        Ok(Self {
            trust,
            rekor,
            signed_identity,
        })
    }

    /// The trust anchor.
    #[must_use]
    pub fn trust(&self) -> &SigstoreTrust {
        &self.trust
    }

    /// Rekor public keys, if transparency-log inclusion is required.
    #[must_use]
    pub fn rekor(&self) -> Option<&KeySource> {
        self.rekor.as_ref()
    }

    /// How the signed reference must relate to the image.
    #[must_use]
    pub fn signed_identity(&self) -> &PolicyReferenceMatch {
        &self.signed_identity
    }
}

// ── Reference matchers ───────────────────────────────────────────────

/// How the reference inside a signature must relate to the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyReferenceMatch {
    /// Same repository and same tag or digest.
    MatchExact,
    /// Same reference for tagged images, same repository for digested ones.
    MatchRepoDigestOrExact,
    /// Same repository, any tag or digest.
    MatchRepository,
    /// The signature must name exactly this tagged or digested reference.
    ExactReference {
        /// The required reference.
        docker_reference: String,
    },
    /// The signature must name this repository.
    ExactRepository {
        /// The required repository.
        docker_repository: String,
    },
    /// Like [`PolicyReferenceMatch::MatchRepoDigestOrExact`], after
    /// rewriting `prefix` in the image reference to `signed_prefix`.
    RemapIdentity {
        /// Prefix of the image reference to rewrite.
        prefix: String,
        /// Replacement prefix expected in signatures.
        signed_prefix: String,
    },
}

impl PolicyReferenceMatch {
    /// The JSON `type` discriminator.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::MatchExact => "matchExact",
            Self::MatchRepoDigestOrExact => "matchRepoDigestOrExact",
            Self::MatchRepository => "matchRepository",
            Self::ExactReference { .. } => "exactReference",
            Self::ExactRepository { .. } => "exactRepository",
            Self::RemapIdentity { .. } => "remapIdentity",
        }
    }

    /// An `exactReference` matcher.
    ///
    /// # Errors
    ///
    /// The reference must parse and carry a tag or digest.
    pub fn exact_reference(docker_reference: impl Into<String>) -> Result<Self, PolicyFormatError> {
        let docker_reference = docker_reference.into();
        let parsed = ImageReference::parse_normalized(&docker_reference).map_err(|e| {
            PolicyFormatError::new(format!("Invalid format of dockerReference: {e}"))
        })?;
        if parsed.is_name_only() {
            return Err(PolicyFormatError::new(format!(
                "dockerReference {docker_reference} contains neither a tag nor digest"
            )));
        }
        Ok(Self::ExactReference { docker_reference })
    }

    /// An `exactRepository` matcher.
    ///
    /// # Errors
    ///
    /// The repository must parse.
    pub fn exact_repository(docker_repository: impl Into<String>) -> Result<Self, PolicyFormatError> {
        let docker_repository = docker_repository.into();
        ImageReference::parse_normalized(&docker_repository).map_err(|e| {
            PolicyFormatError::new(format!("Invalid format of dockerRepository: {e}"))
        })?;
        Ok(Self::ExactRepository { docker_repository })
    }

    /// A `remapIdentity` matcher.
    ///
    /// # Errors
    ///
    /// Both prefixes must be a host or a host followed by repository path
    /// components.
    pub fn remap_identity(
        prefix: impl Into<String>,
        signed_prefix: impl Into<String>,
    ) -> Result<Self, PolicyFormatError> {
        let prefix = prefix.into();
        let signed_prefix = signed_prefix.into();
        for p in [&prefix, &signed_prefix] {
            if !is_valid_repository_prefix(p) {
                return Err(PolicyFormatError::new(format!("prefix {p:?} is not valid")));
            }
        }
        Ok(Self::RemapIdentity {
            prefix,
            signed_prefix,
        })
    }
}

impl Default for PolicyReferenceMatch {
    fn default() -> Self {
        Self::MatchRepoDigestOrExact
    }
}
