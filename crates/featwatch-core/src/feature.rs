//! Feature state as seen by the notification pipeline.
//!
//! Status fields stay as the raw strings the feature backend returns. They
//! are only mapped onto closed enums when a summary is generated, so an
//! upstream schema addition never breaks diffing.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaselineState {
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserState {
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Docs {
    #[serde(default)]
    pub mdn_urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureState {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub baseline: BaselineState,
    /// Keyed by backend browser name (`chrome`, `firefox`, ...).
    #[serde(default)]
    pub browsers: BTreeMap<String, BrowserState>,
    #[serde(default)]
    pub docs: Docs,
}

impl FeatureState {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            baseline: BaselineState::default(),
            browsers: BTreeMap::new(),
            docs: Docs::default(),
        }
    }

    pub fn with_baseline(mut self, status: &str) -> Self {
        self.baseline.status = Some(status.to_string());
        self
    }

    pub fn with_browser(mut self, browser: &str, status: &str, version: Option<&str>) -> Self {
        self.browsers.insert(
            browser.to_string(),
            BrowserState {
                status: Some(status.to_string()),
                version: version.map(str::to_string),
                date: None,
            },
        );
        self
    }
}

/// Result of looking a single feature up in the upstream registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeatureLookup {
    Regular(FeatureState),
    /// The feature was renamed; `new_id` is its successor.
    Moved { new_id: String },
    /// The feature was split into several successors.
    Split { new_ids: Vec<String> },
    NotFound,
}

/// The prior result set of a saved search, persisted as a blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSnapshot {
    pub query: String,
    pub captured_at: DateTime<Utc>,
    pub features: BTreeMap<String, FeatureState>,
}

impl FeatureSnapshot {
    pub fn new(query: impl Into<String>, captured_at: DateTime<Utc>, features: Vec<FeatureState>) -> Self {
        Self {
            query: query.into(),
            captured_at,
            features: features.into_iter().map(|f| (f.id.clone(), f)).collect(),
        }
    }
}
