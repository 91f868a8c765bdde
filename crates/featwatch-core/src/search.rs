//! Saved searches, cadences and the notification event fact table.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SearchScope {
    UserPublic,
}

impl SearchScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserPublic => "USER_PUBLIC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedSearch {
    pub id: String,
    pub name: String,
    pub query: String,
    pub scope: SearchScope,
    pub author_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The `(id, query)` projection used by the batch fan-out publisher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedSearchRef {
    pub id: String,
    pub query: String,
}

/// How often a subscriber wants to hear about a saved search.
///
/// Unrecognized wire values decode as `Unknown` so newer producers never
/// break older consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frequency {
    Immediate,
    Daily,
    Weekly,
    Monthly,
    #[serde(other)]
    Unknown,
}

impl Frequency {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Immediate => "IMMEDIATE",
            Self::Daily => "DAILY",
            Self::Weekly => "WEEKLY",
            Self::Monthly => "MONTHLY",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn snapshot_type(self) -> SnapshotType {
        SnapshotType::for_frequency(self)
    }

    /// Every frequency that lands on the same snapshot row as `self`.
    pub fn sharing_snapshot(self) -> Vec<Frequency> {
        let target = self.snapshot_type();
        [
            Self::Immediate,
            Self::Daily,
            Self::Weekly,
            Self::Monthly,
            Self::Unknown,
        ]
        .into_iter()
        .filter(|f| f.snapshot_type() == target)
        .collect()
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Frequency {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_uppercase().as_str() {
            "IMMEDIATE" => Self::Immediate,
            "DAILY" => Self::Daily,
            "WEEKLY" => Self::Weekly,
            "MONTHLY" => Self::Monthly,
            _ => Self::Unknown,
        })
    }
}

/// Key component of the snapshot/lock row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SnapshotType {
    Immediate,
    Weekly,
    Monthly,
}

impl SnapshotType {
    /// Immediate, Daily and Unknown all share the Immediate snapshot until a
    /// dedicated daily snapshot exists. Widen here, nowhere else.
    pub fn for_frequency(frequency: Frequency) -> Self {
        match frequency {
            Frequency::Immediate | Frequency::Daily | Frequency::Unknown => Self::Immediate,
            Frequency::Weekly => Self::Weekly,
            Frequency::Monthly => Self::Monthly,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Immediate => "IMMEDIATE",
            Self::Weekly => "WEEKLY",
            Self::Monthly => "MONTHLY",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "IMMEDIATE" => Some(Self::Immediate),
            "WEEKLY" => Some(Self::Weekly),
            "MONTHLY" => Some(Self::Monthly),
            _ => None,
        }
    }
}

impl fmt::Display for SnapshotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a notification event was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    QueryChanged,
    DataUpdated,
}

impl Reason {
    /// Representation stored in the `notification_events.reasons` column.
    pub fn storage_str(self) -> &'static str {
        match self {
            Self::QueryChanged => "QUERY_EDITED",
            Self::DataUpdated => "DATA_UPDATED",
        }
    }

    pub fn from_storage(value: &str) -> Option<Self> {
        match value {
            "QUERY_EDITED" => Some(Self::QueryChanged),
            "DATA_UPDATED" => Some(Self::DataUpdated),
            _ => None,
        }
    }
}

/// One row of the append-only event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub event_id: String,
    pub search_id: String,
    pub snapshot_type: SnapshotType,
    /// Query and cadence the diff was computed under.
    pub query: String,
    pub frequency: Frequency,
    pub timestamp: DateTime<Utc>,
    pub reasons: Vec<Reason>,
    pub state_blob_path: String,
    pub diff_blob_path: String,
    /// The stored `{"summary": ...}` wrapper, kept as authored.
    pub summary: serde_json::Value,
}

impl NotificationEvent {
    /// Raw summary object without the storage wrapper.
    pub fn summary_bytes(&self) -> Vec<u8> {
        let inner = self.summary.get("summary").unwrap_or(&self.summary);
        serde_json::to_vec(inner).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestEvent {
    pub event_id: String,
    pub state_blob_path: String,
}
