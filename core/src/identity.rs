//! Identity keys derived from request descriptors.
//!
//! The identity function is pure and deterministic: two descriptors with equal
//! method, URL and body always produce equal keys. The key is the unit of
//! request deduplication and cache addressing.
//!
//! # Key format
//!
//! ```text
//! {METHOD}:{url}[@BODY:{encoded-body}]
//! ```
//!
//! The body suffix is appended only when the encoded body is non-empty. Bodies
//! are encoded as `application/x-www-form-urlencoded`:
//!
//! - Form bodies encode their fields in insertion order. Two forms holding the
//!   same fields in a different order therefore produce **different** keys.
//!   This is a known limitation of the order-sensitive encoder.
//! - JSON objects encode their top-level fields in the map's iteration order.
//!   Strings, numbers and booleans are stringified, arrays repeat the key once
//!   per scalar element, and `null` or nested objects encode as an empty value.
//! - Text bodies and non-object JSON encode the whole text as a single token.

use crate::request::{RequestBody, RequestDescriptor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use url::form_urlencoded;

/// Separator between the request part and the encoded body.
const BODY_MARKER: &str = "@BODY:";

/// Error type for [`IdentityKey`] parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid identity key: {0}")]
pub struct ParseIdentityKeyError(String);

/// Deterministic key identifying a request.
///
/// # Examples
///
/// ```
/// use fetch_cache_core::identity::IdentityKey;
///
/// let key = IdentityKey::new("GET:/foo");
/// assert_eq!(key.as_str(), "GET:/foo");
///
/// let parsed: IdentityKey = "GET:/bar".parse().unwrap();
/// assert_eq!(parsed, IdentityKey::new("GET:/bar"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    /// Create a key from a string without validation.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Get the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert the key into its inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for IdentityKey {
    type Err = ParseIdentityKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseIdentityKeyError(
                "Identity key cannot be empty".to_string(),
            ));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<String> for IdentityKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for IdentityKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Borrow<str> for IdentityKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Caller-supplied replacement for [`identity_of`].
pub type IdentityFn = Arc<dyn Fn(&RequestDescriptor) -> IdentityKey + Send + Sync>;

/// Default identity function.
///
/// # Examples
///
/// ```
/// use fetch_cache_core::identity::identity_of;
/// use fetch_cache_core::request::{RequestBody, RequestDescriptor};
///
/// let get = RequestDescriptor::get("/foo");
/// assert_eq!(identity_of(&get).as_str(), "GET:/foo");
///
/// let post = RequestDescriptor::post("/foo")
///     .with_body(RequestBody::form([("a", "1"), ("b", "2")]));
/// assert_eq!(identity_of(&post).as_str(), "POST:/foo@BODY:a=1&b=2");
/// ```
#[must_use]
pub fn identity_of(descriptor: &RequestDescriptor) -> IdentityKey {
    let mut key = format!("{}:{}", descriptor.method(), descriptor.url());

    if let Some(body) = descriptor.body() {
        let encoded = encode_body(body);
        if !encoded.is_empty() {
            key.push_str(BODY_MARKER);
            key.push_str(&encoded);
        }
    }

    IdentityKey(key)
}

/// Encode a body the way the identity function does.
#[must_use]
pub fn encode_body(body: &RequestBody) -> String {
    match body {
        RequestBody::Form(fields) => {
            let mut serializer = form_urlencoded::Serializer::new(String::new());
            for (name, value) in fields {
                serializer.append_pair(name, value);
            }
            serializer.finish()
        },
        RequestBody::Json(Value::Object(map)) => {
            let mut serializer = form_urlencoded::Serializer::new(String::new());
            for (name, value) in map {
                match value {
                    Value::Array(items) => {
                        for item in items {
                            serializer.append_pair(name, &scalar_text(item));
                        }
                    },
                    other => {
                        serializer.append_pair(name, &scalar_text(other));
                    },
                }
            }
            serializer.finish()
        },
        RequestBody::Json(other) => encode_token(&other.to_string()),
        RequestBody::Text(text) => encode_token(text),
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null | Value::Array(_) | Value::Object(_) => String::new(),
    }
}

fn encode_token(text: &str) -> String {
    form_urlencoded::byte_serialize(text.as_bytes()).collect()
}
