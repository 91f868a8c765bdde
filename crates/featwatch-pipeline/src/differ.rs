//! Diff engine: compares the stored snapshot of a saved search with its live
//! result set.
//!
//! Features that disappeared are looked up in the upstream registry before
//! anything is classified, so a rename or split is reported once as `Moved` or
//! `Split` and never as an unrelated add/remove pair.

use std::collections::{BTreeMap, BTreeSet};

use featwatch_adapters::{fetch_all_features, BackendError, FeatureBackend, DEFAULT_PAGE_SIZE};
use featwatch_core::{
    AddReason, BrowserState, Change, FeatureAdded, FeatureDiff, FeatureLookup, FeatureModified,
    FeatureMoved, FeatureRef, FeatureRemoved, FeatureSnapshot, FeatureSplit, FeatureState,
    RemoveReason,
};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DiffError {
    #[error("fetching live results for {query:?}: {source}")]
    Fetch {
        query: String,
        #[source]
        source: BackendError,
    },
    #[error("looking up removed feature {feature_id}: {source}")]
    Lookup {
        feature_id: String,
        #[source]
        source: BackendError,
    },
}

impl DiffError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Fetch { source, .. } | Self::Lookup { source, .. } => source.is_transient(),
        }
    }
}

/// Page the live result set of `query` to completion.
pub async fn fetch_current<B>(backend: &B, query: &str) -> Result<Vec<FeatureState>, DiffError>
where
    B: FeatureBackend + ?Sized,
{
    fetch_all_features(backend, query, DEFAULT_PAGE_SIZE)
        .await
        .map_err(|source| DiffError::Fetch {
            query: query.to_string(),
            source,
        })
}

/// Compute the structured difference between `previous` and `current`.
///
/// `backend` is only consulted for features that left the result set.
pub async fn compute_diff<B>(
    backend: &B,
    previous: &FeatureSnapshot,
    current: &FeatureSnapshot,
) -> Result<FeatureDiff, DiffError>
where
    B: FeatureBackend + ?Sized,
{
    let mut diff = FeatureDiff {
        query_changed: previous.query != current.query,
        ..FeatureDiff::default()
    };

    let mut unclaimed_added: BTreeSet<&str> = current
        .features
        .keys()
        .filter(|id| !previous.features.contains_key(*id))
        .map(String::as_str)
        .collect();

    for (id, old) in &previous.features {
        if current.features.contains_key(id) {
            continue;
        }
        let lookup = backend
            .get_feature(id)
            .await
            .map_err(|source| DiffError::Lookup {
                feature_id: id.clone(),
                source,
            })?;

        match lookup {
            FeatureLookup::Moved { new_id } if unclaimed_added.remove(new_id.as_str()) => {
                diff.moved.push(FeatureMoved {
                    from_id: id.clone(),
                    from_name: old.name.clone(),
                    to_name: name_of(current, &new_id),
                    to_id: new_id,
                });
            }
            FeatureLookup::Split { new_ids }
                if !new_ids.is_empty()
                    && new_ids.iter().all(|n| unclaimed_added.contains(n.as_str())) =>
            {
                let mut to: Vec<FeatureRef> = new_ids
                    .iter()
                    .map(|n| {
                        unclaimed_added.remove(n.as_str());
                        FeatureRef {
                            id: n.clone(),
                            name: name_of(current, n),
                        }
                    })
                    .collect();
                to.sort_by(|a, b| a.id.cmp(&b.id));
                to.dedup_by(|a, b| a.id == b.id);
                diff.split.push(FeatureSplit {
                    from_id: id.clone(),
                    from_name: old.name.clone(),
                    to,
                });
            }
            FeatureLookup::NotFound => diff.removed.push(FeatureRemoved {
                id: id.clone(),
                name: old.name.clone(),
                reason: RemoveReason::Deleted,
            }),
            // Still known upstream, under this id or a successor that does
            // not match the query.
            _ => diff.removed.push(FeatureRemoved {
                id: id.clone(),
                name: old.name.clone(),
                reason: RemoveReason::Unmatched,
            }),
        }
    }

    for id in unclaimed_added {
        diff.added.push(FeatureAdded {
            id: id.to_string(),
            name: name_of(current, id),
            reason: AddReason::NewMatch,
        });
    }

    for (id, new) in &current.features {
        if let Some(old) = previous.features.get(id) {
            let modified = compare_feature(old, new);
            if !modified.is_empty() {
                diff.modified.push(modified);
            }
        }
    }

    sort_diff(&mut diff);
    debug!(
        query_changed = diff.query_changed,
        added = diff.added.len(),
        removed = diff.removed.len(),
        modified = diff.modified.len(),
        moved = diff.moved.len(),
        split = diff.split.len(),
        "diff computed"
    );
    Ok(diff)
}

fn name_of(snapshot: &FeatureSnapshot, id: &str) -> String {
    snapshot
        .features
        .get(id)
        .map(|f| f.name.clone())
        .unwrap_or_else(|| id.to_string())
}

/// Field-by-field comparison; only differing fields are populated.
pub fn compare_feature(old: &FeatureState, new: &FeatureState) -> FeatureModified {
    let browsers: BTreeSet<&String> = old.browsers.keys().chain(new.browsers.keys()).collect();
    let mut browser_changes = BTreeMap::new();
    for browser in browsers {
        let from = old.browsers.get(browser).cloned().unwrap_or_default();
        let to = new.browsers.get(browser).cloned().unwrap_or_default();
        if let Some(change) = Change::between(from, to) {
            browser_changes.insert(browser.clone(), change);
        }
    }

    FeatureModified {
        id: new.id.clone(),
        name: new.name.clone(),
        name_change: Change::between(old.name.clone(), new.name.clone()),
        baseline_change: Change::between(old.baseline.clone(), new.baseline.clone()),
        browser_changes,
        docs_change: Change::between(old.docs.clone(), new.docs.clone()),
    }
}

fn sort_diff(diff: &mut FeatureDiff) {
    diff.added.sort_by(|a, b| a.id.cmp(&b.id));
    diff.removed.sort_by(|a, b| a.id.cmp(&b.id));
    diff.modified.sort_by(|a, b| a.id.cmp(&b.id));
    diff.moved.sort_by(|a, b| a.from_id.cmp(&b.from_id));
    diff.split.sort_by(|a, b| a.from_id.cmp(&b.from_id));
}
