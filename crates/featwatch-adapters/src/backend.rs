//! Feature backend: paged search plus single-feature lookup that understands
//! moved and split features.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use featwatch_core::{BaselineState, BrowserState, Docs, FeatureLookup, FeatureState};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_PAGE_SIZE: u32 = 100;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("feature backend request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("feature backend returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("feature backend response could not be decoded: {0}")]
    Decode(String),
    #[error("invalid feature backend configuration: {0}")]
    Config(String),
}

impl BackendError {
    /// Whether trying again later could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Decode(_) | Self::Config(_) => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeaturePage {
    pub features: Vec<FeatureState>,
    pub next_page_token: Option<String>,
}

#[async_trait]
pub trait FeatureBackend: Send + Sync {
    async fn features_search(
        &self,
        query: &str,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<FeaturePage, BackendError>;

    async fn get_feature(&self, feature_id: &str) -> Result<FeatureLookup, BackendError>;
}

/// Page through `query` until the backend stops returning a page token.
pub async fn fetch_all_features<B>(
    backend: &B,
    query: &str,
    page_size: u32,
) -> Result<Vec<FeatureState>, BackendError>
where
    B: FeatureBackend + ?Sized,
{
    let mut features = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let page = backend
            .features_search(query, token.as_deref(), page_size)
            .await?;
        features.extend(page.features);
        match page.next_page_token {
            Some(next) if token.as_deref() == Some(next.as_str()) => {
                return Err(BackendError::Decode(format!(
                    "pagination did not advance past token {next:?}"
                )));
            }
            Some(next) if !next.is_empty() => token = Some(next),
            _ => break,
        }
    }
    debug!(query, count = features.len(), "fetched live results");
    Ok(features)
}

#[derive(Debug, Deserialize)]
struct WireBaseline {
    status: Option<String>,
    #[serde(default)]
    low_date: Option<NaiveDate>,
    #[serde(default)]
    high_date: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
struct WireBrowser {
    status: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    date: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
struct WireMdnDoc {
    url: String,
}

#[derive(Debug, Default, Deserialize)]
struct WireDocs {
    #[serde(default)]
    mdn_docs: Vec<WireMdnDoc>,
}

#[derive(Debug, Deserialize)]
struct WireFeature {
    feature_id: String,
    name: String,
    #[serde(default)]
    baseline: Option<WireBaseline>,
    #[serde(default)]
    browser_implementations: BTreeMap<String, WireBrowser>,
    #[serde(default)]
    docs: Option<WireDocs>,
}

impl From<WireFeature> for FeatureState {
    fn from(wire: WireFeature) -> Self {
        let baseline = wire
            .baseline
            .map(|b| BaselineState {
                status: b.status,
                low_date: b.low_date,
                high_date: b.high_date,
            })
            .unwrap_or_default();
        let browsers = wire
            .browser_implementations
            .into_iter()
            .map(|(name, b)| {
                (
                    name,
                    BrowserState {
                        status: b.status,
                        version: b.version,
                        date: b.date,
                    },
                )
            })
            .collect();
        let mut mdn_urls: Vec<String> = wire
            .docs
            .unwrap_or_default()
            .mdn_docs
            .into_iter()
            .map(|d| d.url)
            .collect();
        mdn_urls.sort();
        Self {
            id: wire.feature_id,
            name: wire.name,
            baseline,
            browsers,
            docs: Docs { mdn_urls },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct WirePageMetadata {
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WirePage {
    #[serde(default)]
    data: Vec<WireFeature>,
    #[serde(default)]
    metadata: Option<WirePageMetadata>,
}

#[derive(Debug, Deserialize)]
struct WireFeatureRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct WireGone {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    new_features: Vec<WireFeatureRef>,
}

/// Backend over the feature REST API. Redirects are not followed: a
/// redirect from `/v1/features/{id}` is how the API reports a moved feature.
#[derive(Debug, Clone)]
pub struct HttpFeatureBackend {
    client: reqwest::Client,
    base: Url,
}

impl HttpFeatureBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, BackendError> {
        let base = Url::parse(base_url)
            .map_err(|e| BackendError::Config(format!("invalid backend url {base_url:?}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(BackendError::Config(format!(
                "backend url {base_url:?} cannot be a base"
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("featwatch/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, base })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn error_for(response: reqwest::Response) -> BackendError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        BackendError::Status { status, body }
    }
}

fn moved_target(location: &str) -> Option<String> {
    let path = location.split(['?', '#']).next().unwrap_or_default();
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl FeatureBackend for HttpFeatureBackend {
    async fn features_search(
        &self,
        query: &str,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<FeaturePage, BackendError> {
        let page_size = page_size.to_string();
        let mut request = self
            .client
            .get(self.endpoint(&["v1", "features"]))
            .query(&[("q", query), ("page_size", page_size.as_str())]);
        if let Some(token) = page_token {
            request = request.query(&[("page_token", token)]);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }
        let page: WirePage = response
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        Ok(FeaturePage {
            features: page.data.into_iter().map(FeatureState::from).collect(),
            next_page_token: page.metadata.and_then(|m| m.next_page_token),
        })
    }

    async fn get_feature(&self, feature_id: &str) -> Result<FeatureLookup, BackendError> {
        let response = self
            .client
            .get(self.endpoint(&["v1", "features", feature_id]))
            .send()
            .await?;
        let status = response.status();

        if status.is_redirection() {
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .and_then(moved_target)
                .ok_or_else(|| {
                    BackendError::Decode(format!("redirect for {feature_id} has no usable location"))
                })?;
            return Ok(FeatureLookup::Moved { new_id: location });
        }
        match status {
            StatusCode::NOT_FOUND => Ok(FeatureLookup::NotFound),
            StatusCode::GONE => {
                let gone: WireGone = response
                    .json()
                    .await
                    .map_err(|e| BackendError::Decode(e.to_string()))?;
                if gone.kind == "feature_split" && !gone.new_features.is_empty() {
                    Ok(FeatureLookup::Split {
                        new_ids: gone.new_features.into_iter().map(|f| f.id).collect(),
                    })
                } else {
                    Ok(FeatureLookup::NotFound)
                }
            }
            s if s.is_success() => {
                let feature: WireFeature = response
                    .json()
                    .await
                    .map_err(|e| BackendError::Decode(e.to_string()))?;
                Ok(FeatureLookup::Regular(feature.into()))
            }
            _ => Err(Self::error_for(response).await),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FixtureFile {
    #[serde(default)]
    features: Vec<FeatureState>,
    #[serde(default)]
    queries: HashMap<String, Vec<String>>,
    #[serde(default)]
    moved: HashMap<String, String>,
    #[serde(default)]
    split: HashMap<String, Vec<String>>,
}

/// Backend over a fixed catalogue, for tests and offline runs.
#[derive(Debug, Clone, Default)]
pub struct FixtureFeatureBackend {
    catalogue: BTreeMap<String, FeatureState>,
    queries: HashMap<String, Vec<String>>,
    lookups: HashMap<String, FeatureLookup>,
}

impl FixtureFeatureBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON fixture with `features`, `queries`, `moved` and `split` keys.
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading feature fixtures {}", path.display()))?;
        let file: FixtureFile = serde_json::from_str(&raw)
            .with_context(|| format!("parsing feature fixtures {}", path.display()))?;
        let mut backend = Self::new();
        for feature in file.features {
            backend.insert_feature(feature);
        }
        for (query, ids) in file.queries {
            backend.queries.insert(query, ids);
        }
        for (from, to) in file.moved {
            backend.mark_moved(&from, &to);
        }
        for (from, to) in file.split {
            backend.mark_split(&from, to);
        }
        Ok(backend)
    }

    pub fn insert_feature(&mut self, feature: FeatureState) {
        self.catalogue.insert(feature.id.clone(), feature);
    }

    /// Replace the result set of `query`, adding the features to the catalogue.
    pub fn set_results(&mut self, query: &str, features: Vec<FeatureState>) {
        let ids = features.iter().map(|f| f.id.clone()).collect();
        for feature in features {
            self.insert_feature(feature);
        }
        self.queries.insert(query.to_string(), ids);
    }

    pub fn remove_feature(&mut self, feature_id: &str) {
        self.catalogue.remove(feature_id);
    }

    pub fn mark_moved(&mut self, from: &str, to: &str) {
        self.catalogue.remove(from);
        self.lookups.insert(
            from.to_string(),
            FeatureLookup::Moved {
                new_id: to.to_string(),
            },
        );
    }

    pub fn mark_split(&mut self, from: &str, to: Vec<String>) {
        self.catalogue.remove(from);
        self.lookups
            .insert(from.to_string(), FeatureLookup::Split { new_ids: to });
    }
}

#[async_trait]
impl FeatureBackend for FixtureFeatureBackend {
    async fn features_search(
        &self,
        query: &str,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<FeaturePage, BackendError> {
        let ids = self.queries.get(query).cloned().unwrap_or_default();
        let offset = match page_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| BackendError::Decode(format!("bad page token {token:?}")))?,
            None => 0,
        };
        let page_size = page_size.max(1) as usize;
        let features: Vec<FeatureState> = ids
            .iter()
            .skip(offset)
            .take(page_size)
            .filter_map(|id| self.catalogue.get(id).cloned())
            .collect();
        let next = offset + page_size;
        Ok(FeaturePage {
            features,
            next_page_token: (next < ids.len()).then(|| next.to_string()),
        })
    }

    async fn get_feature(&self, feature_id: &str) -> Result<FeatureLookup, BackendError> {
        if let Some(lookup) = self.lookups.get(feature_id) {
            return Ok(lookup.clone());
        }
        Ok(self
            .catalogue
            .get(feature_id)
            .cloned()
            .map(FeatureLookup::Regular)
            .unwrap_or(FeatureLookup::NotFound))
    }
}
