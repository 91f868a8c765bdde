//! Versioned, bounded digest of a [`FeatureDiff`].
//!
//! Stored summaries are historical facts: they are parsed with the schema
//! version they were written with and never upgraded. Each version gets its
//! own [`SummaryVisitor`] method.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use featwatch_core::{BaselineState, BrowserState, Change, FeatureDiff, FeatureModified};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SCHEMA_VERSION_V1: &str = "v1";
pub const MAX_HIGHLIGHTS: usize = 10_000;

#[derive(Debug, Error)]
pub enum SummaryError {
    #[error("summary is not valid json: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("summary has no schema_version")]
    MissingVersion,
    #[error("unknown summary schema version {0:?}")]
    UnknownVersion(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryCategories {
    #[serde(default)]
    pub query_changed: u32,
    #[serde(default)]
    pub added: u32,
    #[serde(default)]
    pub removed: u32,
    #[serde(default)]
    pub moved: u32,
    #[serde(default)]
    pub split: u32,
    #[serde(default)]
    pub updated: u32,
    #[serde(default)]
    pub updated_impl: u32,
    #[serde(default)]
    pub updated_rename: u32,
    #[serde(default)]
    pub updated_baseline: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HighlightType {
    Changed,
    Added,
    Removed,
    Moved,
    Split,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselineStatus {
    Limited,
    Newly,
    Widely,
    #[serde(other)]
    Unknown,
}

impl BaselineStatus {
    fn from_backend(status: Option<&str>) -> Self {
        match status {
            Some("limited") => Self::Limited,
            Some("newly") => Self::Newly,
            Some("widely") => Self::Widely,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrowserStatus {
    Available,
    Unavailable,
    #[serde(other)]
    Unknown,
}

impl BrowserStatus {
    fn from_backend(status: Option<&str>) -> Self {
        match status {
            Some("available") => Self::Available,
            Some("unavailable") => Self::Unavailable,
            _ => Self::Unknown,
        }
    }
}

/// Browsers a highlight may mention. Anything else is dropped from the
/// summary but kept in the diff blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrowserName {
    Chrome,
    ChromeAndroid,
    Edge,
    Firefox,
    FirefoxAndroid,
    Safari,
    SafariIos,
}

impl BrowserName {
    pub fn from_backend(name: &str) -> Option<Self> {
        Some(match name {
            "chrome" => Self::Chrome,
            "chrome_android" => Self::ChromeAndroid,
            "edge" => Self::Edge,
            "firefox" => Self::Firefox,
            "firefox_android" => Self::FirefoxAndroid,
            "safari" => Self::Safari,
            "safari_ios" => Self::SafariIos,
            _ => return None,
        })
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Chrome => "Chrome",
            Self::ChromeAndroid => "Chrome Android",
            Self::Edge => "Edge",
            Self::Firefox => "Firefox",
            Self::FirefoxAndroid => "Firefox Android",
            Self::Safari => "Safari",
            Self::SafariIos => "Safari iOS",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaselineValue {
    pub status: BaselineStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_date: Option<NaiveDate>,
}

impl From<&BaselineState> for BaselineValue {
    fn from(state: &BaselineState) -> Self {
        Self {
            status: BaselineStatus::from_backend(state.status.as_deref()),
            low_date: state.low_date,
            high_date: state.high_date,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserValue {
    pub status: BrowserStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
}

impl From<&BrowserState> for BrowserValue {
    fn from(state: &BrowserState) -> Self {
        Self {
            status: BrowserStatus::from_backend(state.status.as_deref()),
            version: state.version.clone(),
            date: state.date,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureLink {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Highlight {
    #[serde(rename = "type")]
    pub kind: HighlightType,
    pub feature_id: String,
    pub feature_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_change: Option<Change<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_change: Option<Change<BaselineValue>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub browser_changes: BTreeMap<BrowserName, Change<BrowserValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moved_from: Option<FeatureLink>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub split_into: Vec<FeatureLink>,
}

impl Highlight {
    fn bare(kind: HighlightType, feature_id: &str, feature_name: &str) -> Self {
        Self {
            kind,
            feature_id: feature_id.to_string(),
            feature_name: feature_name.to_string(),
            name_change: None,
            baseline_change: None,
            browser_changes: BTreeMap::new(),
            moved_from: None,
            split_into: Vec::new(),
        }
    }

    fn modified(m: &FeatureModified) -> Self {
        let mut highlight = Self::bare(HighlightType::Changed, &m.id, &m.name);
        highlight.name_change = m.name_change.clone();
        highlight.baseline_change = m.baseline_change.as_ref().map(|c| Change {
            from: BaselineValue::from(&c.from),
            to: BaselineValue::from(&c.to),
        });
        highlight.browser_changes = m
            .browser_changes
            .iter()
            .filter_map(|(name, c)| {
                let browser = BrowserName::from_backend(name)?;
                Some((
                    browser,
                    Change {
                        from: BrowserValue::from(&c.from),
                        to: BrowserValue::from(&c.to),
                    },
                ))
            })
            .collect();
        highlight
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSummaryV1 {
    pub schema_version: String,
    pub text: String,
    pub categories: SummaryCategories,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub highlights: Vec<Highlight>,
}

/// Build the v1 summary and its serialized form.
pub fn generate_json_summary(diff: &FeatureDiff) -> Result<(EventSummaryV1, Vec<u8>), SummaryError> {
    let summary = summarize(diff, MAX_HIGHLIGHTS);
    let bytes = serde_json::to_vec(&summary)?;
    Ok((summary, bytes))
}

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

fn categories(diff: &FeatureDiff) -> SummaryCategories {
    let mut categories = SummaryCategories {
        query_changed: u32::from(diff.query_changed),
        added: count(diff.added.len()),
        removed: count(diff.removed.len()),
        moved: count(diff.moved.len()),
        split: count(diff.split.len()),
        updated: count(diff.modified.len()),
        ..SummaryCategories::default()
    };
    for m in &diff.modified {
        if !m.browser_changes.is_empty() {
            categories.updated_impl += 1;
        }
        if m.name_change.is_some() {
            categories.updated_rename += 1;
        }
        if m.baseline_change.is_some() {
            categories.updated_baseline += 1;
        }
    }
    categories
}

fn text(categories: &SummaryCategories) -> String {
    let mut clauses = Vec::new();
    if categories.query_changed > 0 {
        clauses.push("Search criteria updated".to_string());
    }
    for (n, what) in [
        (categories.added, "added"),
        (categories.removed, "removed"),
        (categories.moved, "moved/renamed"),
        (categories.split, "split"),
        (categories.updated, "updated"),
    ] {
        if n > 0 {
            clauses.push(format!("{n} features {what}"));
        }
    }
    if clauses.is_empty() {
        "No changes detected".to_string()
    } else {
        clauses.join(", ")
    }
}

struct Highlights {
    cap: usize,
    items: Vec<Highlight>,
    truncated: bool,
}

impl Highlights {
    /// Returns `false` once the cap is hit; nothing more is accepted.
    fn push(&mut self, highlight: Highlight) -> bool {
        if self.items.len() >= self.cap {
            self.truncated = true;
            return false;
        }
        self.items.push(highlight);
        true
    }

    fn extend(&mut self, highlights: impl Iterator<Item = Highlight>) -> bool {
        for highlight in highlights {
            if !self.push(highlight) {
                return false;
            }
        }
        true
    }
}

fn summarize(diff: &FeatureDiff, cap: usize) -> EventSummaryV1 {
    let categories = categories(diff);
    let mut highlights = Highlights {
        cap,
        items: Vec::new(),
        truncated: false,
    };

    // Modified first: changes to features the user already tracks matter most.
    let sources: [Box<dyn Iterator<Item = Highlight> + '_>; 5] = [
        Box::new(diff.modified.iter().map(Highlight::modified)),
        Box::new(
            diff.added
                .iter()
                .map(|a| Highlight::bare(HighlightType::Added, &a.id, &a.name)),
        ),
        Box::new(
            diff.removed
                .iter()
                .map(|r| Highlight::bare(HighlightType::Removed, &r.id, &r.name)),
        ),
        Box::new(diff.moved.iter().map(|m| {
            let mut h = Highlight::bare(HighlightType::Moved, &m.to_id, &m.to_name);
            h.moved_from = Some(FeatureLink {
                id: m.from_id.clone(),
                name: m.from_name.clone(),
            });
            h
        })),
        Box::new(diff.split.iter().map(|s| {
            let mut h = Highlight::bare(HighlightType::Split, &s.from_id, &s.from_name);
            h.split_into = s
                .to
                .iter()
                .map(|r| FeatureLink {
                    id: r.id.clone(),
                    name: r.name.clone(),
                })
                .collect();
            h
        })),
    ];
    for source in sources {
        if !highlights.extend(source) {
            break;
        }
    }

    EventSummaryV1 {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        text: text(&categories),
        categories,
        truncated: highlights.truncated,
        highlights: highlights.items,
    }
}

/// One method per schema version ever written.
pub trait SummaryVisitor {
    type Output;

    fn visit_v1(&mut self, summary: EventSummaryV1) -> Self::Output;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionedSummary {
    V1(EventSummaryV1),
}

impl VersionedSummary {
    pub fn schema_version(&self) -> &'static str {
        match self {
            Self::V1(_) => SCHEMA_VERSION_V1,
        }
    }

    pub fn accept<V: SummaryVisitor>(self, visitor: &mut V) -> V::Output {
        match self {
            Self::V1(summary) => visitor.visit_v1(summary),
        }
    }
}

#[derive(Deserialize)]
struct VersionPeek {
    schema_version: Option<String>,
}

/// Peek the schema version, then decode with that version's shape.
pub fn parse_event_summary(bytes: &[u8]) -> Result<VersionedSummary, SummaryError> {
    let peek: VersionPeek = serde_json::from_slice(bytes)?;
    match peek.schema_version.as_deref() {
        Some(SCHEMA_VERSION_V1) => Ok(VersionedSummary::V1(serde_json::from_slice(bytes)?)),
        Some(other) => Err(SummaryError::UnknownVersion(other.to_string())),
        None => Err(SummaryError::MissingVersion),
    }
}

pub fn visit_event_summary<V: SummaryVisitor>(
    bytes: &[u8],
    visitor: &mut V,
) -> Result<V::Output, SummaryError> {
    Ok(parse_event_summary(bytes)?.accept(visitor))
}
