//! Structured difference between two result sets of a saved search.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::feature::{BaselineState, BrowserState, Docs};
use crate::search::Reason;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change<T> {
    pub from: T,
    pub to: T,
}

impl<T: PartialEq> Change<T> {
    /// `Some` only when the two sides differ.
    pub fn between(from: T, to: T) -> Option<Self> {
        if from == to {
            None
        } else {
            Some(Self { from, to })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddReason {
    /// Newly created upstream, or the edited query matches it now.
    NewMatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoveReason {
    /// Still exists upstream but no longer matches the query.
    Unmatched,
    /// Upstream no longer knows the feature.
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureAdded {
    pub id: String,
    pub name: String,
    pub reason: AddReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureRemoved {
    pub id: String,
    pub name: String,
    pub reason: RemoveReason,
}

/// A feature present on both sides whose tracked fields changed. Only the
/// fields that actually differ are populated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureModified {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_change: Option<Change<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_change: Option<Change<BaselineState>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub browser_changes: BTreeMap<String, Change<BrowserState>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docs_change: Option<Change<Docs>>,
}

impl FeatureModified {
    pub fn is_empty(&self) -> bool {
        self.name_change.is_none()
            && self.baseline_change.is_none()
            && self.browser_changes.is_empty()
            && self.docs_change.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureMoved {
    pub from_id: String,
    pub from_name: String,
    pub to_id: String,
    pub to_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSplit {
    pub from_id: String,
    pub from_name: String,
    pub to: Vec<FeatureRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureDiff {
    pub query_changed: bool,
    #[serde(default)]
    pub added: Vec<FeatureAdded>,
    #[serde(default)]
    pub removed: Vec<FeatureRemoved>,
    #[serde(default)]
    pub modified: Vec<FeatureModified>,
    #[serde(default)]
    pub moved: Vec<FeatureMoved>,
    #[serde(default)]
    pub split: Vec<FeatureSplit>,
}

impl FeatureDiff {
    pub fn has_data_changes(&self) -> bool {
        !(self.added.is_empty()
            && self.removed.is_empty()
            && self.modified.is_empty()
            && self.moved.is_empty()
            && self.split.is_empty())
    }

    pub fn has_changes(&self) -> bool {
        self.query_changed || self.has_data_changes()
    }

    /// Number of individual change records across every bucket.
    pub fn total_records(&self) -> usize {
        self.added.len() + self.removed.len() + self.modified.len() + self.moved.len() + self.split.len()
    }

    pub fn reasons(&self) -> Vec<Reason> {
        let mut reasons = Vec::new();
        if self.query_changed {
            reasons.push(Reason::QueryChanged);
        }
        if self.has_data_changes() {
            reasons.push(Reason::DataUpdated);
        }
        reasons
    }
}
