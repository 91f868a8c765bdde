//! Core domain model for saved-search change notifications.

pub mod diff;
pub mod feature;
pub mod search;
pub mod subscription;

pub use diff::{
    AddReason, Change, FeatureAdded, FeatureDiff, FeatureModified, FeatureMoved, FeatureRef,
    FeatureRemoved, FeatureSplit, RemoveReason,
};
pub use feature::{BaselineState, BrowserState, Docs, FeatureLookup, FeatureSnapshot, FeatureState};
pub use search::{
    Frequency, LatestEvent, NotificationEvent, Reason, SavedSearch, SavedSearchRef, SearchScope,
    SnapshotType,
};
pub use subscription::{
    ChannelConfigError, ChannelKind, ChannelState, EmailConfig, EmailSubscriber,
    SubscriptionDestination, SubscriptionTrigger, WebhookConfig,
};

pub const CRATE_NAME: &str = "featwatch-core";

/// Generate a fresh opaque identifier for events, blobs and messages.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
