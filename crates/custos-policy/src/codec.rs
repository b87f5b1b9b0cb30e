//! The policy JSON format.
//!
//! Decoding goes through the strict JSON codec, so duplicate keys at any
//! depth are errors. Requirement and matcher objects are dispatched on
//! their `type` field through static registries; every decoder checks its
//! exact field set. Encoding is a plain `serde::Serialize` that
//! produces a document the decoder accepts and that decodes back to an
//! equal [`Policy`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use custos_signature::ImageReference;
use custos_signature::json::{self, JsonObject, JsonValue};
use custos_signature::reference::is_valid_domain;
use serde::ser::{Error as _, SerializeMap, Serializer};
use serde::Serialize;

use crate::error::{PolicyError, PolicyFormatError};
use crate::types::{
    CertSource, FulcioTrust, KeySource, PkiTrust, Policy, PolicyReferenceMatch, PolicyRequirement,
    PolicyRequirements, SignedBaseLayer, SignedBy, SignedByKeyType, SigstoreSigned, SigstoreTrust,
    TransportScopes,
};

/// Transport whose scopes are evaluated.
pub const DOCKER_TRANSPORT: &str = "docker";

/// Message for an empty requirement list, at decode and evaluation time.
pub(crate) const EMPTY_REQUIREMENTS: &str =
    "List of verification policy requirements must not be empty";

impl Policy {
    /// Decode a policy document.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyFormatError`] for malformed JSON, duplicate keys,
    /// unknown or missing fields and invalid requirements or scopes.
    pub fn from_json_str(s: &str) -> Result<Self, PolicyFormatError> {
        Self::from_bytes(s.as_bytes())
    }

    /// Decode a policy document from raw bytes.
    ///
    /// # Errors
    ///
    /// See [`Policy::from_json_str`].
    pub fn from_bytes(data: &[u8]) -> Result<Self, PolicyFormatError> {
        let obj = json::parse_object(data)?;
        decode_policy(&obj)
    }

    /// Read and decode a policy file.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Io`] if the file cannot be read and
    /// [`PolicyError::Format`] if it does not decode.
    pub fn from_file(path: &Path) -> Result<Self, PolicyError> {
        let data = std::fs::read(path).map_err(|source| PolicyError::Io {
            path: path.to_owned(),
            source,
        })?;
        let policy = Self::from_bytes(&data).map_err(|e| {
            PolicyFormatError::new(format!("{}: {}", path.display(), e.0))
        })?;
        tracing::debug!(path = %path.display(), scopes = policy.specific.len(), "loaded policy");
        Ok(policy)
    }

    /// Encode the policy as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Fails only for key paths that are not valid UTF-8.
    pub fn to_json(&self) -> Result<String, PolicyFormatError> {
        serde_json::to_string_pretty(self).map_err(|e| PolicyFormatError::new(e.to_string()))
    }
}

// ── Decoding ─────────────────────────────────────────────────────────

fn decode_policy(obj: &JsonObject) -> Result<Policy, PolicyFormatError> {
    obj.known_fields(&["default", "specific", "transports"])?;
    let default = match obj.get("default") {
        Some(v) => decode_requirements(v)?,
        None => return Err(PolicyFormatError::new("Default policy is missing")),
    };

    let mut policy = Policy::new(default);
    match (obj.get("specific"), obj.get("transports")) {
        (Some(_), Some(_)) => {
            return Err(PolicyFormatError::new(
                "\"specific\" and \"transports\" cannot both be specified",
            ));
        }
        (Some(specific), None) => {
            policy.specific = decode_scopes(DOCKER_TRANSPORT, specific)?;
        }
        (None, Some(transports)) => {
            let transports = transports
                .as_object()
                .ok_or_else(|| PolicyFormatError::new("\"transports\" is not a JSON object"))?;
            for (transport, scopes) in transports.iter() {
                let scopes = decode_scopes(transport, scopes)?;
                if transport == DOCKER_TRANSPORT {
                    policy.specific = scopes;
                } else {
                    policy.other_transports.insert(transport.to_owned(), scopes);
                }
            }
        }
        (None, None) => {}
    }
    Ok(policy)
}

fn decode_scopes(transport: &str, value: &JsonValue) -> Result<TransportScopes, PolicyFormatError> {
    let obj = value.as_object().ok_or_else(|| {
        PolicyFormatError::new(format!("Scopes of transport {transport} are not a JSON object"))
    })?;
    let mut scopes = BTreeMap::new();
    for (scope, requirements) in obj.iter() {
        // The empty scope is the transport-wide default and always valid.
        if !scope.is_empty() {
            validate_scope(transport, scope)?;
        }
        scopes.insert(scope.to_owned(), decode_requirements(requirements)?);
    }
    Ok(scopes)
}

fn decode_requirements(value: &JsonValue) -> Result<PolicyRequirements, PolicyFormatError> {
    let items = value
        .as_array()
        .ok_or_else(|| PolicyFormatError::new("Policy requirements are not a JSON array"))?;
    if items.is_empty() {
        return Err(PolicyFormatError::new(EMPTY_REQUIREMENTS));
    }
    items.iter().map(decode_requirement).collect()
}

type RequirementDecoder = fn(&JsonObject) -> Result<PolicyRequirement, PolicyFormatError>;

const REQUIREMENT_DECODERS: &[(&str, RequirementDecoder)] = &[
    ("insecureAcceptAnything", decode_insecure_accept_anything),
    ("reject", decode_reject),
    ("signedBy", decode_signed_by),
    ("signedBaseLayer", decode_signed_base_layer),
    ("sigstoreSigned", decode_sigstore_signed),
];

fn decode_requirement(value: &JsonValue) -> Result<PolicyRequirement, PolicyFormatError> {
    let obj = value
        .as_object()
        .ok_or_else(|| PolicyFormatError::new("Policy requirement is not a JSON object"))?;
    let kind = obj.string("type")?;
    let (_, decode) = REQUIREMENT_DECODERS
        .iter()
        .find(|(name, _)| *name == kind)
        .ok_or_else(|| PolicyFormatError::new(format!("Unknown policy requirement type \"{kind}\"")))?;
    decode(obj)
}

fn decode_insecure_accept_anything(obj: &JsonObject) -> Result<PolicyRequirement, PolicyFormatError> {
    obj.exact_fields(&["type"])?;
    Ok(PolicyRequirement::InsecureAcceptAnything)
}

fn decode_reject(obj: &JsonObject) -> Result<PolicyRequirement, PolicyFormatError> {
    obj.exact_fields(&["type"])?;
    Ok(PolicyRequirement::Reject)
}

fn decode_signed_by(obj: &JsonObject) -> Result<PolicyRequirement, PolicyFormatError> {
    obj.known_fields(&["type", "keyType", "keyPath", "keyPaths", "keyData", "signedIdentity"])?;
    let key_type = SignedByKeyType::parse(obj.string("keyType")?)?;
    let key_source = decode_key_source(obj, &SIGNED_BY_KEY_FIELDS)?.ok_or_else(|| {
        PolicyFormatError::new("Exactly one of keyPath, keyPaths and keyData must be specified")
    })?;
    let signed_identity = decode_signed_identity(obj)?;
    Ok(PolicyRequirement::SignedBy(SignedBy::new(key_type, key_source, signed_identity)?))
}

fn decode_signed_base_layer(obj: &JsonObject) -> Result<PolicyRequirement, PolicyFormatError> {
    obj.exact_fields(&["type", "baseLayerIdentity"])?;
    let base_layer_identity = decode_reference_match(obj.required("baseLayerIdentity")?)?;
    Ok(PolicyRequirement::SignedBaseLayer(SignedBaseLayer { base_layer_identity }))
}

fn decode_sigstore_signed(obj: &JsonObject) -> Result<PolicyRequirement, PolicyFormatError> {
    obj.known_fields(&[
        "type",
        "keyPath",
        "keyPaths",
        "keyData",
        "keyDatas",
        "fulcio",
        "pki",
        "rekorPublicKeyPath",
        "rekorPublicKeyPaths",
        "rekorPublicKeyData",
        "rekorPublicKeyDatas",
        "signedIdentity",
    ])?;
    let keys = decode_key_source(obj, &SIGSTORE_KEY_FIELDS)?;
    let fulcio = obj.get("fulcio").map(decode_fulcio).transpose()?;
    let pki = obj.get("pki").map(decode_pki).transpose()?;
    let trust = match (keys, fulcio, pki) {
        (Some(keys), None, None) => SigstoreTrust::PublicKeys(keys),
        (None, Some(fulcio), None) => SigstoreTrust::Fulcio(fulcio),
        (None, None, Some(pki)) => SigstoreTrust::Pki(pki),
        _ => {
            return Err(PolicyFormatError::new(
                "Exactly one of keyPath, keyPaths, keyData, keyDatas, fulcio and pki must be specified",
            ));
        }
    };
    let rekor = decode_key_source(obj, &REKOR_KEY_FIELDS)?;
    let signed_identity = decode_signed_identity(obj)?;
    Ok(PolicyRequirement::SigstoreSigned(SigstoreSigned::new(
        trust,
        rekor,
        signed_identity,
    )?))
}

fn decode_fulcio(value: &JsonValue) -> Result<FulcioTrust, PolicyFormatError> {
    let obj = value
        .as_object()
        .ok_or_else(|| PolicyFormatError::new("\"fulcio\" is not a JSON object"))?;
    obj.known_fields(&["caPath", "caData", "oidcIssuer", "subjectEmail"])?;
    let ca = decode_cert_source(obj, "caPath", "caData")?
        .ok_or_else(|| PolicyFormatError::new("Exactly one of caPath and caData must be specified"))?;
    FulcioTrust::new(
        ca,
        obj.optional_string("oidcIssuer")?.unwrap_or_default(),
        obj.optional_string("subjectEmail")?.unwrap_or_default(),
    )
}

fn decode_pki(value: &JsonValue) -> Result<PkiTrust, PolicyFormatError> {
    let obj = value
        .as_object()
        .ok_or_else(|| PolicyFormatError::new("\"pki\" is not a JSON object"))?;
    obj.known_fields(&[
        "caRootsPath",
        "caRootsData",
        "caIntermediatesPath",
        "caIntermediatesData",
        "subjectEmail",
        "subjectHostname",
    ])?;
    let roots = decode_cert_source(obj, "caRootsPath", "caRootsData")?.ok_or_else(|| {
        PolicyFormatError::new("Exactly one of caRootsPath and caRootsData must be specified")
    })?;
    let intermediates = decode_cert_source(obj, "caIntermediatesPath", "caIntermediatesData")?;
    PkiTrust::new(
        roots,
        intermediates,
        obj.optional_string("subjectEmail")?.map(str::to_owned),
        obj.optional_string("subjectHostname")?.map(str::to_owned),
    )
}

fn decode_signed_identity(obj: &JsonObject) -> Result<PolicyReferenceMatch, PolicyFormatError> {
    obj.get("signedIdentity")
        .map(decode_reference_match)
        .transpose()
        .map(Option::unwrap_or_default)
}

/// JSON field names of one key source family.
struct KeyFields {
    path: &'static str,
    paths: &'static str,
    data: &'static str,
    datas: Option<&'static str>,
}

const SIGNED_BY_KEY_FIELDS: KeyFields = KeyFields {
    path: "keyPath",
    paths: "keyPaths",
    data: "keyData",
    datas: None,
};

const SIGSTORE_KEY_FIELDS: KeyFields = KeyFields {
    path: "keyPath",
    paths: "keyPaths",
    data: "keyData",
    datas: Some("keyDatas"),
};

const REKOR_KEY_FIELDS: KeyFields = KeyFields {
    path: "rekorPublicKeyPath",
    paths: "rekorPublicKeyPaths",
    data: "rekorPublicKeyData",
    datas: Some("rekorPublicKeyDatas"),
};

impl KeyFields {
    fn names(&self) -> String {
        let mut names = vec![self.path, self.paths, self.data];
        names.extend(self.datas);
        names.join(", ")
    }
}

/// At most one field of the family may be present.
fn decode_key_source(obj: &JsonObject, fields: &KeyFields) -> Result<Option<KeySource>, PolicyFormatError> {
    let mut found = Vec::new();
    if let Some(path) = obj.optional_string(fields.path)? {
        found.push(KeySource::Path(PathBuf::from(path)));
    }
    if let Some(paths) = obj.optional_string_array(fields.paths)? {
        found.push(KeySource::Paths(paths.into_iter().map(PathBuf::from).collect()));
    }
    if obj.contains_key(fields.data) {
        found.push(KeySource::Data(decode_base64(obj, fields.data)?));
    }
    if let Some(datas) = fields.datas {
        if let Some(items) = obj.optional_string_array(datas)? {
            let blobs = items
                .into_iter()
                .map(|item| base64_bytes(datas, item))
                .collect::<Result<Vec<_>, _>>()?;
            found.push(KeySource::Datas(blobs));
        }
    }
    match found.len() {
        0 | 1 => Ok(found.pop()),
        _ => Err(PolicyFormatError::new(format!(
            "At most one of {} may be specified",
            fields.names()
        ))),
    }
}

fn decode_cert_source(
    obj: &JsonObject,
    path_field: &str,
    data_field: &str,
) -> Result<Option<CertSource>, PolicyFormatError> {
    let path = obj.optional_string(path_field)?;
    let has_data = obj.contains_key(data_field);
    match (path, has_data) {
        (Some(_), true) => Err(PolicyFormatError::new(format!(
            "At most one of {path_field} and {data_field} may be specified"
        ))),
        (Some(path), false) => Ok(Some(CertSource::Path(PathBuf::from(path)))),
        (None, true) => Ok(Some(CertSource::Data(decode_base64(obj, data_field)?))),
        (None, false) => Ok(None),
    }
}

fn decode_base64(obj: &JsonObject, field: &str) -> Result<Vec<u8>, PolicyFormatError> {
    base64_bytes(field, obj.string(field)?)
}

fn base64_bytes(field: &str, value: &str) -> Result<Vec<u8>, PolicyFormatError> {
    base64::engine::general_purpose::STANDARD
        .decode(value)
        .map_err(|e| PolicyFormatError::new(format!("Invalid base64 in \"{field}\": {e}")))
}

type MatchDecoder = fn(&JsonObject) -> Result<PolicyReferenceMatch, PolicyFormatError>;

const MATCH_DECODERS: &[(&str, MatchDecoder)] = &[
    ("matchExact", |obj| {
        obj.exact_fields(&["type"])?;
        Ok(PolicyReferenceMatch::MatchExact)
    }),
    ("matchRepoDigestOrExact", |obj| {
        obj.exact_fields(&["type"])?;
        Ok(PolicyReferenceMatch::MatchRepoDigestOrExact)
    }),
    ("matchRepository", |obj| {
        obj.exact_fields(&["type"])?;
        Ok(PolicyReferenceMatch::MatchRepository)
    }),
    ("exactReference", |obj| {
        obj.exact_fields(&["type", "dockerReference"])?;
        PolicyReferenceMatch::exact_reference(obj.string("dockerReference")?)
    }),
    ("exactRepository", |obj| {
        obj.exact_fields(&["type", "dockerRepository"])?;
        PolicyReferenceMatch::exact_repository(obj.string("dockerRepository")?)
    }),
    ("remapIdentity", |obj| {
        obj.exact_fields(&["type", "prefix", "signedPrefix"])?;
        PolicyReferenceMatch::remap_identity(obj.string("prefix")?, obj.string("signedPrefix")?)
    }),
];

fn decode_reference_match(value: &JsonValue) -> Result<PolicyReferenceMatch, PolicyFormatError> {
    let obj = value
        .as_object()
        .ok_or_else(|| PolicyFormatError::new("Policy reference match is not a JSON object"))?;
    let kind = obj.string("type")?;
    let (_, decode) = MATCH_DECODERS
        .iter()
        .find(|(name, _)| *name == kind)
        .ok_or_else(|| {
            PolicyFormatError::new(format!("Unknown policy reference match type \"{kind}\""))
        })?;
    decode(obj)
}

// ── Scope validation ─────────────────────────────────────────────────

fn validate_scope(transport: &str, scope: &str) -> Result<(), PolicyFormatError> {
    match transport {
        DOCKER_TRANSPORT | "atomic" => validate_docker_scope(scope),
        "dir" | "oci" | "oci-archive" | "docker-archive" => validate_path_scope(scope),
        _ => Ok(()),
    }
}

/// A docker scope is a hostname, a `*.`-wildcarded hostname, a repository
/// namespace, or a reference in its fully expanded form.
fn validate_docker_scope(scope: &str) -> Result<(), PolicyFormatError> {
    if let Some(domain) = scope.strip_prefix("*.") {
        if !is_valid_domain(domain) {
            return Err(invalid_scope(scope, "wildcard is not followed by a hostname"));
        }
        tracing::warn!(
            %scope,
            "wildcard scopes are matched as literal strings only; use an exact hostname"
        );
        return Ok(());
    }
    if !scope.contains('/') {
        return if is_valid_domain(scope) {
            Ok(())
        } else {
            Err(invalid_scope(scope, "not a valid hostname"))
        };
    }
    let parsed = ImageReference::parse_normalized(scope)
        .map_err(|e| invalid_scope(scope, &e.to_string()))?;
    if parsed.to_string() != scope {
        return Err(invalid_scope(scope, "Uses non-canonical format"));
    }
    Ok(())
}

/// Path-based transports use absolute, clean paths.
fn validate_path_scope(scope: &str) -> Result<(), PolicyFormatError> {
    let Some(rest) = scope.strip_prefix('/') else {
        return Err(invalid_scope(scope, "Must be an absolute path"));
    };
    if rest.is_empty() {
        return Ok(());
    }
    if rest.split('/').any(|c| c.is_empty() || c == "." || c == "..") {
        return Err(invalid_scope(scope, "Uses non-canonical format"));
    }
    Ok(())
}

fn invalid_scope(scope: &str, reason: &str) -> PolicyFormatError {
    PolicyFormatError::new(format!("Invalid scope {scope}: {reason}"))
}

// ── Encoding ─────────────────────────────────────────────────────────

impl Serialize for Policy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("default", &self.default)?;
        if self.other_transports.is_empty() {
            if !self.specific.is_empty() {
                map.serialize_entry("specific", &self.specific)?;
            }
        } else {
            let mut transports: BTreeMap<&str, &TransportScopes> = self
                .other_transports
                .iter()
                .map(|(k, v)| (k.as_str(), v))
                .collect();
            if !self.specific.is_empty() {
                transports.insert(DOCKER_TRANSPORT, &self.specific);
            }
            map.serialize_entry("transports", &transports)?;
        }
        map.end()
    }
}

impl Serialize for PolicyRequirement {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("type", self.type_name())?;
        match self {
            Self::InsecureAcceptAnything | Self::Reject => {}
            Self::SignedBy(req) => {
                map.serialize_entry("keyType", req.key_type().as_str())?;
                serialize_key_source(&mut map, req.key_source(), &SIGNED_BY_KEY_FIELDS)?;
                map.serialize_entry("signedIdentity", req.signed_identity())?;
            }
            Self::SignedBaseLayer(req) => {
                map.serialize_entry("baseLayerIdentity", &req.base_layer_identity)?;
            }
            Self::SigstoreSigned(req) => {
                match req.trust() {
                    SigstoreTrust::PublicKeys(keys) => {
                        serialize_key_source(&mut map, keys, &SIGSTORE_KEY_FIELDS)?;
                    }
                    SigstoreTrust::Fulcio(fulcio) => map.serialize_entry("fulcio", fulcio)?,
                    SigstoreTrust::Pki(pki) => map.serialize_entry("pki", pki)?,
                }
                if let Some(rekor) = req.rekor() {
                    serialize_key_source(&mut map, rekor, &REKOR_KEY_FIELDS)?;
                }
                map.serialize_entry("signedIdentity", req.signed_identity())?;
            }
        }
        map.end()
    }
}

fn serialize_key_source<M: SerializeMap>(
    map: &mut M,
    source: &KeySource,
    fields: &KeyFields,
) -> Result<(), M::Error> {
    let b64 = &base64::engine::general_purpose::STANDARD;
    match source {
        KeySource::Path(path) => map.serialize_entry(fields.path, path),
        KeySource::Paths(paths) => map.serialize_entry(fields.paths, paths),
        KeySource::Data(data) => map.serialize_entry(fields.data, &b64.encode(data)),
        KeySource::Datas(datas) => {
            let name = fields
                .datas
                .ok_or_else(|| M::Error::custom(format!("{} does not accept multiple key blobs", fields.data)))?;
            let encoded: Vec<String> = datas.iter().map(|d| b64.encode(d)).collect();
            map.serialize_entry(name, &encoded)
        }
    }
}

fn serialize_cert_source<M: SerializeMap>(
    map: &mut M,
    source: &CertSource,
    path_field: &str,
    data_field: &str,
) -> Result<(), M::Error> {
    match source {
        CertSource::Path(path) => map.serialize_entry(path_field, path),
        CertSource::Data(data) => {
            map.serialize_entry(data_field, &base64::engine::general_purpose::STANDARD.encode(data))
        }
    }
}

impl Serialize for FulcioTrust {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(3))?;
        serialize_cert_source(&mut map, self.ca(), "caPath", "caData")?;
        map.serialize_entry("oidcIssuer", self.oidc_issuer())?;
        map.serialize_entry("subjectEmail", self.subject_email())?;
        map.end()
    }
}

impl Serialize for PkiTrust {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        serialize_cert_source(&mut map, self.ca_roots(), "caRootsPath", "caRootsData")?;
        if let Some(intermediates) = self.ca_intermediates() {
            serialize_cert_source(&mut map, intermediates, "caIntermediatesPath", "caIntermediatesData")?;
        }
        if let Some(email) = self.subject_email() {
            map.serialize_entry("subjectEmail", email)?;
        }
        if let Some(hostname) = self.subject_hostname() {
            map.serialize_entry("subjectHostname", hostname)?;
        }
        map.end()
    }
}

impl Serialize for PolicyReferenceMatch {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("type", self.type_name())?;
        match self {
            Self::MatchExact | Self::MatchRepoDigestOrExact | Self::MatchRepository => {}
            Self::ExactReference { docker_reference } => {
                map.serialize_entry("dockerReference", docker_reference)?;
            }
            Self::ExactRepository { docker_repository } => {
                map.serialize_entry("dockerRepository", docker_repository)?;
            }
            Self::RemapIdentity {
                prefix,
                signed_prefix,
            } => {
                map.serialize_entry("prefix", prefix)?;
                map.serialize_entry("signedPrefix", signed_prefix)?;
            }
        }
        map.end()
    }
}
