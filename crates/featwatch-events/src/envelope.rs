//! The `{apiVersion, kind, data}` wire envelope.
//!
//! Every payload type declares its own `KIND` and `API_VERSION`, so producers
//! and consumers agree on the tag through the type rather than a registry.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const API_VERSION_V1: &str = "v1";

/// A payload that can travel inside an [`Envelope`].
pub trait Event: Serialize + DeserializeOwned + Send + 'static {
    const KIND: &'static str;
    const API_VERSION: &'static str = API_VERSION_V1;
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("expected kind {expected}, found {found}")]
    KindMismatch {
        expected: &'static str,
        found: String,
    },
    #[error("kind {kind} has unsupported apiVersion {api_version}")]
    UnsupportedVersion { kind: String, api_version: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn wrap<E: Event>(event: &E) -> Result<Self, EnvelopeError> {
        Ok(Self {
            api_version: E::API_VERSION.to_string(),
            kind: E::KIND.to_string(),
            data: serde_json::to_value(event)?,
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn is<E: Event>(&self) -> bool {
        self.kind == E::KIND
    }

    /// Take the payload out as `E`, checking both kind and version.
    pub fn into_event<E: Event>(self) -> Result<E, EnvelopeError> {
        if self.kind != E::KIND {
            return Err(EnvelopeError::KindMismatch {
                expected: E::KIND,
                found: self.kind,
            });
        }
        if self.api_version != E::API_VERSION {
            return Err(EnvelopeError::UnsupportedVersion {
                kind: self.kind,
                api_version: self.api_version,
            });
        }
        Ok(serde_json::from_value(self.data)?)
    }
}

pub fn encode<E: Event>(event: &E) -> Result<Vec<u8>, EnvelopeError> {
    Envelope::wrap(event)?.to_bytes()
}

pub fn decode<E: Event>(bytes: &[u8]) -> Result<E, EnvelopeError> {
    Envelope::decode(bytes)?.into_event()
}
