//! Strict JSON decoding.
//!
//! Security-relevant documents (policies, signature payloads, transparency
//! log receipts) must not be ambiguous. [`JsonValue`] is decoded by a
//! token-level visitor that records every object key it has seen and fails
//! on the first repeat, instead of letting the last value win. Objects keep
//! their keys in document order.
//!
//! The typed accessors on [`JsonObject`] produce [`JsonFormatError`]s whose
//! messages name the offending field.

use std::collections::HashSet;
use std::fmt;

use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

/// A structural problem in otherwise well-formed JSON.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct JsonFormatError(pub String);

impl JsonFormatError {
    fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// A JSON document with duplicate-free objects.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonValue {
    /// `null`
    Null,
    /// `true` / `false`
    Bool(bool),
    /// Any number.
    Number(serde_json::Number),
    /// A string.
    String(String),
    /// An array.
    Array(Vec<JsonValue>),
    /// An object.
    Object(JsonObject),
}

/// A JSON object whose keys are unique, in document order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JsonObject {
    entries: Vec<(String, JsonValue)>,
}

/// Decode `input`, rejecting duplicate object keys at any depth.
///
/// # Errors
///
/// Returns [`JsonFormatError`] for syntax errors and duplicate keys.
pub fn parse(input: &[u8]) -> Result<JsonValue, JsonFormatError> {
    serde_json::from_slice(input).map_err(|e| JsonFormatError::new(e.to_string()))
}

/// Decode `input`, which must be a JSON object.
///
/// # Errors
///
/// Returns [`JsonFormatError`] if `input` is malformed or not an object.
pub fn parse_object(input: &[u8]) -> Result<JsonObject, JsonFormatError> {
    match parse(input)? {
        JsonValue::Object(obj) => Ok(obj),
        other => Err(JsonFormatError(format!(
            "expected a JSON object, got {}",
            other.kind()
        ))),
    }
}

impl JsonValue {
    /// A short name for the value's JSON type, for error messages.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
        }
    }

    /// The string value, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// The object, if this is an object.
    #[must_use]
    pub fn as_object(&self) -> Option<&JsonObject> {
        match self {
            Self::Object(o) => Some(o),
            _ => None,
        }
    }

    /// The elements, if this is an array.
    #[must_use]
    pub fn as_array(&self) -> Option<&[JsonValue]> {
        match self {
            Self::Array(a) => Some(a),
            _ => None,
        }
    }

    /// The value as an `i64`, if this is an integer that fits.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    /// True for `null`.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Serialize in canonical form: object keys sorted by UTF-16 code
    /// units, no insignificant whitespace (RFC 8785 for the integer and
    /// string values this crate canonicalizes).
    ///
    /// # Errors
    ///
    /// Returns [`JsonFormatError`] if a string cannot be escaped.
    pub fn to_canonical_vec(&self) -> Result<Vec<u8>, JsonFormatError> {
        let mut out = Vec::new();
        self.write_canonical(&mut out)
            .map_err(|e| JsonFormatError::new(format!("failed to write canonical JSON: {e}")))?;
        Ok(out)
    }

    fn write_canonical(&self, out: &mut Vec<u8>) -> serde_json::Result<()> {
        match self {
            Self::Null => out.extend_from_slice(b"null"),
            Self::Bool(b) => out.extend_from_slice(if *b { "true" } else { "false" }.as_bytes()),
            Self::Number(n) => out.extend_from_slice(canonical_number(n).as_bytes()),
            Self::String(s) => serde_json::to_writer(&mut *out, s)?,
            Self::Array(items) => {
                out.push(b'[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(b',');
                    }
                    item.write_canonical(out)?;
                }
                out.push(b']');
            }
            Self::Object(obj) => {
                let mut entries: Vec<&(String, JsonValue)> = obj.entries.iter().collect();
                entries.sort_by(|(a, _), (b, _)| a.encode_utf16().cmp(b.encode_utf16()));
                out.push(b'{');
                for (i, (key, value)) in entries.into_iter().enumerate() {
                    if i > 0 {
                        out.push(b',');
                    }
                    serde_json::to_writer(&mut *out, key)?;
                    out.push(b':');
                    value.write_canonical(out)?;
                }
                out.push(b'}');
            }
        }
        Ok(())
    }
}

#[expect(
    clippy::cast_possible_truncation,
    reason = "guarded by the integral and magnitude checks"
)]
fn canonical_number(n: &serde_json::Number) -> String {
    match n.as_f64() {
        Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
        _ => n.to_string(),
    }
}

impl JsonObject {
    /// Look up a key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// True if `key` is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Iterate over keys in document order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Iterate over entries in document order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &JsonValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the object has no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fail unless the object has exactly the keys in `expected`.
    ///
    /// # Errors
    ///
    /// Names the first unexpected or missing key.
    pub fn exact_fields(&self, expected: &[&str]) -> Result<(), JsonFormatError> {
        self.known_fields(expected)?;
        for key in expected {
            if !self.contains_key(key) {
                return Err(JsonFormatError(format!("Key \"{key}\" missing in a JSON object")));
            }
        }
        Ok(())
    }

    /// Fail if the object has any key not in `allowed`.
    ///
    /// # Errors
    ///
    /// Names the first unexpected key.
    pub fn known_fields(&self, allowed: &[&str]) -> Result<(), JsonFormatError> {
        match self.keys().find(|k| !allowed.contains(k)) {
            Some(unknown) => Err(JsonFormatError(format!(
                "Unexpected key \"{unknown}\" in a JSON object"
            ))),
            None => Ok(()),
        }
    }

    /// A required field of any type.
    ///
    /// # Errors
    ///
    /// Fails if the field is missing.
    pub fn required(&self, key: &str) -> Result<&JsonValue, JsonFormatError> {
        self.get(key)
            .ok_or_else(|| JsonFormatError(format!("Field \"{key}\" missing")))
    }

    /// A required string field.
    ///
    /// # Errors
    ///
    /// Fails if the field is missing or not a string.
    pub fn string(&self, key: &str) -> Result<&str, JsonFormatError> {
        let value = self.required(key)?;
        value.as_str().ok_or_else(|| wrong_type(key, "a string", value))
    }

    /// An optional string field.
    ///
    /// # Errors
    ///
    /// Fails if the field is present but not a string.
    pub fn optional_string(&self, key: &str) -> Result<Option<&str>, JsonFormatError> {
        self.get(key)
            .map(|v| v.as_str().ok_or_else(|| wrong_type(key, "a string", v)))
            .transpose()
    }

    /// A required object field.
    ///
    /// # Errors
    ///
    /// Fails if the field is missing or not an object.
    pub fn object(&self, key: &str) -> Result<&JsonObject, JsonFormatError> {
        let value = self.required(key)?;
        value.as_object().ok_or_else(|| wrong_type(key, "a JSON object", value))
    }

    /// An optional array-of-strings field.
    ///
    /// # Errors
    ///
    /// Fails if the field is present but not an array of strings.
    pub fn optional_string_array(&self, key: &str) -> Result<Option<Vec<&str>>, JsonFormatError> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        let items = value
            .as_array()
            .ok_or_else(|| wrong_type(key, "an array", value))?;
        items
            .iter()
            .map(|item| {
                item.as_str()
                    .ok_or_else(|| wrong_type(key, "an array of strings", value))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }

    /// A required integer field.
    ///
    /// # Errors
    ///
    /// Fails if the field is missing or not an integer.
    pub fn integer(&self, key: &str) -> Result<i64, JsonFormatError> {
        let value = self.required(key)?;
        value.as_i64().ok_or_else(|| wrong_type(key, "an integer", value))
    }
}

fn wrong_type(key: &str, expected: &str, got: &JsonValue) -> JsonFormatError {
    JsonFormatError(format!(
        "Field \"{key}\" is not {expected} (got {})",
        got.kind()
    ))
}

impl FromIterator<(String, JsonValue)> for JsonObject {
    /// Build an object; later duplicates of a key are dropped.
    fn from_iter<I: IntoIterator<Item = (String, JsonValue)>>(iter: I) -> Self {
        let mut seen = HashSet::new();
        let entries = iter
            .into_iter()
            .filter(|(k, _)| seen.insert(k.clone()))
            .collect();
        Self { entries }
    }
}

// ── serde plumbing ───────────────────────────────────────────────────

impl<'de> Deserialize<'de> for JsonValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(StrictVisitor)
    }
}

struct StrictVisitor;

impl<'de> Visitor<'de> for StrictVisitor {
    type Value = JsonValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("any JSON value")
    }

    fn visit_bool<E>(self, v: bool) -> Result<JsonValue, E> {
        Ok(JsonValue::Bool(v))
    }

    fn visit_i64<E>(self, v: i64) -> Result<JsonValue, E> {
        Ok(JsonValue::Number(v.into()))
    }

    fn visit_u64<E>(self, v: u64) -> Result<JsonValue, E> {
        Ok(JsonValue::Number(v.into()))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<JsonValue, E> {
        serde_json::Number::from_f64(v)
            .map(JsonValue::Number)
            .ok_or_else(|| E::custom("non-finite number"))
    }

    fn visit_str<E>(self, v: &str) -> Result<JsonValue, E> {
        Ok(JsonValue::String(v.to_owned()))
    }

    fn visit_string<E>(self, v: String) -> Result<JsonValue, E> {
        Ok(JsonValue::String(v))
    }

    fn visit_unit<E>(self) -> Result<JsonValue, E> {
        Ok(JsonValue::Null)
    }

    fn visit_none<E>(self) -> Result<JsonValue, E> {
        Ok(JsonValue::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<JsonValue, D::Error> {
        Deserialize::deserialize(d)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<JsonValue, A::Error> {
        let mut items = Vec::new();
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(JsonValue::Array(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<JsonValue, A::Error> {
        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        while let Some(key) = map.next_key::<String>()? {
            if !seen.insert(key.clone()) {
                return Err(de::Error::custom(format_args!("duplicate key \"{key}\"")));
            }
            let value: JsonValue = map.next_value()?;
            entries.push((key, value));
        }
        Ok(JsonValue::Object(JsonObject { entries }))
    }
}

impl Serialize for JsonValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Number(n) => n.serialize(serializer),
            Self::String(s) => serializer.serialize_str(s),
            Self::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Object(obj) => obj.serialize(serializer),
        }
    }
}

impl Serialize for JsonObject {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}
