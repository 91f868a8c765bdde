//! Storage ports consumed by the notification pipeline.
//!
//! Each trait matches one consumer so tests can stand in a narrow fake. Both
//! [`crate::PgStore`] and [`crate::MemoryStore`] implement all of them.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use featwatch_core::{
    ChannelState, Frequency, LatestEvent, NotificationEvent, Reason, SavedSearchRef, SnapshotType,
    SubscriptionDestination,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored row could not be decoded: {0}")]
    Decode(String),
    #[error("saved search {0} does not exist")]
    UnknownSearch(String),
}

/// Input of [`EventLog::publish_event`].
#[derive(Debug, Clone, PartialEq)]
pub struct PublishEventRequest {
    pub event_id: String,
    pub search_id: String,
    pub snapshot_type: SnapshotType,
    pub query: String,
    pub frequency: Frequency,
    pub reasons: Vec<Reason>,
    pub state_blob_path: String,
    pub diff_blob_path: String,
    /// The bare summary object; the store adds the `{"summary": ...}` wrapper.
    pub summary: serde_json::Value,
}

impl PublishEventRequest {
    pub fn storage_reasons(&self) -> Vec<String> {
        self.reasons.iter().map(|r| r.storage_str().to_string()).collect()
    }

    pub fn wrapped_summary(&self) -> serde_json::Value {
        serde_json::json!({ "summary": self.summary })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelFailure {
    pub channel_id: String,
    pub at: DateTime<Utc>,
    pub message: String,
    /// Only permanent user-caused failures count towards disabling the channel.
    pub permanent_user: bool,
    pub disable_threshold: u32,
}

/// Per-`(search, snapshot type)` worker lock.
#[async_trait]
pub trait SnapshotLocks: Send + Sync {
    /// Take the lock unless another worker holds an unexpired one.
    async fn acquire_lock(
        &self,
        search_id: &str,
        snapshot_type: SnapshotType,
        worker_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Clear the lock fields for the key, whoever holds them.
    async fn release_lock(
        &self,
        search_id: &str,
        snapshot_type: SnapshotType,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait EventLog: Send + Sync {
    async fn get_latest_event(
        &self,
        snapshot_type: SnapshotType,
        search_id: &str,
    ) -> Result<Option<LatestEvent>, StoreError>;

    /// Append the event row and point the snapshot state at the new blob, in
    /// one transaction. Once this returns the event is durable.
    async fn publish_event(
        &self,
        request: PublishEventRequest,
    ) -> Result<NotificationEvent, StoreError>;

    /// Committed events whose fan-out message was never confirmed.
    async fn pending_fanout(
        &self,
        search_id: &str,
        snapshot_type: SnapshotType,
    ) -> Result<Vec<NotificationEvent>, StoreError>;

    async fn mark_fanned_out(&self, event_id: &str) -> Result<(), StoreError>;

    /// Newest first.
    async fn list_events(
        &self,
        search_id: &str,
        limit: u32,
    ) -> Result<Vec<NotificationEvent>, StoreError>;
}

#[async_trait]
pub trait SavedSearchCatalog: Send + Sync {
    async fn list_all_saved_searches(&self) -> Result<Vec<SavedSearchRef>, StoreError>;

    async fn get_saved_search(&self, search_id: &str) -> Result<Option<SavedSearchRef>, StoreError>;
}

#[async_trait]
pub trait SubscriberDirectory: Send + Sync {
    /// Active destinations whose subscription frequency shares the snapshot
    /// type of `frequency`. Channels disabled by the system are excluded.
    async fn find_subscription_destinations(
        &self,
        search_id: &str,
        frequency: Frequency,
    ) -> Result<Vec<SubscriptionDestination>, StoreError>;
}

#[async_trait]
pub trait ChannelHealth: Send + Sync {
    async fn record_channel_success(
        &self,
        channel_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn record_channel_failure(&self, failure: ChannelFailure) -> Result<(), StoreError>;

    async fn channel_state(&self, channel_id: &str) -> Result<Option<ChannelState>, StoreError>;
}

/// Apply one failure to an in-memory channel state. Mirrors the upsert in
/// [`crate::PgStore::record_channel_failure`].
pub fn apply_channel_failure(state: &mut ChannelState, failure: &ChannelFailure) {
    state.last_failure_at = Some(failure.at);
    state.last_failure_message = Some(failure.message.clone());
    if failure.permanent_user {
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if state.consecutive_failures >= failure.disable_threshold.max(1) {
            state.is_disabled_by_system = true;
        }
    }
}

pub fn apply_channel_success(state: &mut ChannelState, at: DateTime<Utc>) {
    state.last_success_at = Some(at);
    state.consecutive_failures = 0;
}
