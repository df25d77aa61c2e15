//! Settled request outcomes.
//!
//! The transport resolves every request into a tagged [`FetchResult`]: either
//! data with the response status and headers, or an error. Transport and
//! decode failures are values here, never panics or rejections, so they can be
//! cached and published like any other outcome.

use crate::request::Headers;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Failure carried by an error-tagged outcome.
///
/// The display string is exactly the underlying message, so a transport that
/// fails with `"Failed to fetch /foo"` surfaces that same text.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FetchError {
    /// The request never produced a response (network failure, refused
    /// connection, rejected transport future).
    #[error("{message}")]
    Transport {
        /// Failure description
        message: String,
    },

    /// A response arrived but its body could not be decoded.
    #[error("{message}")]
    Decode {
        /// Failure description
        message: String,
    },
}

impl FetchError {
    /// Build a transport failure.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Build a decode failure.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// The failure message.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Transport { message } | Self::Decode { message } => message,
        }
    }
}

/// Settled outcome of a request.
///
/// | Outcome            | `data` | `error`     | `status` | `headers` |
/// |--------------------|--------|-------------|----------|-----------|
/// | Success            | set    | -           | set      | set       |
/// | Decode failure     | -      | `Decode`    | set      | set       |
/// | Transport failure  | -      | `Transport` | -        | -         |
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchResult {
    /// Decoded payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Failure, if the request did not succeed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FetchError>,
    /// Response status code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Response headers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
}

impl FetchResult {
    /// A decoded response.
    #[must_use]
    pub const fn success(data: Value, status: u16, headers: Headers) -> Self {
        Self {
            data: Some(data),
            error: None,
            status: Some(status),
            headers: Some(headers),
        }
    }

    /// A transport failure with no response attached.
    #[must_use]
    pub const fn failure(error: FetchError) -> Self {
        Self {
            data: None,
            error: Some(error),
            status: None,
            headers: None,
        }
    }

    /// A response whose body could not be decoded.
    #[must_use]
    pub const fn undecodable(error: FetchError, status: u16, headers: Headers) -> Self {
        Self {
            data: None,
            error: Some(error),
            status: Some(status),
            headers: Some(headers),
        }
    }

    /// Whether this outcome carries an error.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Deserialize the payload into a typed value.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if the payload does not match `T`.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.data.clone().map(serde_json::from_value).transpose()
    }

    /// Split the outcome into payload or error.
    ///
    /// # Errors
    ///
    /// Returns the carried [`FetchError`] for error-tagged outcomes.
    pub fn into_outcome(self) -> Result<Option<Value>, FetchError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.data),
        }
    }

    /// Shallow-merge `patch` over `previous`.
    ///
    /// Fields set on the patch replace the previous ones; unset fields are
    /// kept. With no previous value the patch alone forms the result.
    #[must_use]
    pub fn patched(previous: Option<Self>, patch: ResultPatch) -> Self {
        let previous = previous.unwrap_or_default();
        Self {
            data: patch.data.or(previous.data),
            error: patch.error.or(previous.error),
            status: patch.status.or(previous.status),
            headers: patch.headers.or(previous.headers),
        }
    }
}

/// Partial update of a [`FetchResult`], applied with [`FetchResult::patched`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultPatch {
    /// Replacement payload
    pub data: Option<Value>,
    /// Replacement error
    pub error: Option<FetchError>,
    /// Replacement status
    pub status: Option<u16>,
    /// Replacement headers
    pub headers: Option<Headers>,
}

impl ResultPatch {
    /// A patch that only replaces the payload.
    #[must_use]
    pub const fn data(data: Value) -> Self {
        Self {
            data: Some(data),
            error: None,
            status: None,
            headers: None,
        }
    }
}
