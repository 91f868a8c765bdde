//! Payload types carried on the wire and in blob bodies.

use chrono::{DateTime, Utc};
use featwatch_core::{FeatureDiff, FeatureSnapshot, Frequency, Reason, SubscriptionTrigger};
use serde::{Deserialize, Serialize};

use crate::envelope::Event;

/// Opaque bytes carried as a base64 string.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Ask the producer to re-evaluate one saved search for one cadence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshSearchCommand {
    pub search_id: String,
    pub query: String,
    pub frequency: Frequency,
    pub timestamp: DateTime<Utc>,
}

impl Event for RefreshSearchCommand {
    const KIND: &'static str = "RefreshSearchCommand";
}

/// A saved search was created or edited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchConfigurationChangedEvent {
    pub search_id: String,
    pub query: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub is_creation: bool,
    pub frequency: Frequency,
}

impl Event for SearchConfigurationChangedEvent {
    const KIND: &'static str = "SearchConfigurationChangedEvent";
}

impl From<SearchConfigurationChangedEvent> for RefreshSearchCommand {
    fn from(event: SearchConfigurationChangedEvent) -> Self {
        Self {
            search_id: event.search_id,
            query: event.query,
            frequency: event.frequency,
            timestamp: event.timestamp,
        }
    }
}

/// Refresh every saved search for a cadence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRefreshTrigger {
    pub frequency: Frequency,
}

impl Event for BatchRefreshTrigger {
    const KIND: &'static str = "BatchRefreshTrigger";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureDiffEvent {
    pub event_id: String,
    pub search_id: String,
    pub query: String,
    /// Serialized summary, passed through to delivery untouched.
    #[serde(with = "base64_bytes")]
    pub summary: Vec<u8>,
    pub state_id: String,
    pub state_blob_path: String,
    pub diff_id: String,
    pub diff_blob_path: String,
    pub generated_at: DateTime<Utc>,
    pub frequency: Frequency,
    pub reasons: Vec<Reason>,
}

impl Event for FeatureDiffEvent {
    const KIND: &'static str = "FeatureDiffEvent";
}

/// Fields needed only to build links in the rendered email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailJobMetadata {
    pub event_id: String,
    pub search_id: String,
    pub query: String,
    pub frequency: Frequency,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailJobEvent {
    pub subscription_id: String,
    pub recipient_email: String,
    pub channel_id: String,
    #[serde(with = "base64_bytes")]
    pub summary_raw: Vec<u8>,
    pub metadata: EmailJobMetadata,
    pub triggers: Vec<SubscriptionTrigger>,
}

impl EmailJobEvent {
    /// Stable across redeliveries of the same job.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.metadata.event_id, self.subscription_id)
    }
}

impl Event for EmailJobEvent {
    const KIND: &'static str = "EmailJobEvent";
}

impl Event for FeatureSnapshot {
    const KIND: &'static str = "FeatureListSnapshot";
}

impl Event for FeatureDiff {
    const KIND: &'static str = "FeatureDiff";
}
