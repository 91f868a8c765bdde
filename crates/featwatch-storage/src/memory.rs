//! In-process store with the same semantics as [`crate::PgStore`].

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use featwatch_core::{
    ChannelState, Frequency, LatestEvent, NotificationEvent, SavedSearch, SavedSearchRef,
    SnapshotType, SubscriptionDestination,
};
use tokio::sync::Mutex;

use crate::seed::{NewChannel, NewSubscription, SeedData};
use crate::store::{
    apply_channel_failure, apply_channel_success, ChannelFailure, ChannelHealth, EventLog,
    PublishEventRequest, SavedSearchCatalog, SnapshotLocks, StoreError, SubscriberDirectory,
};

#[derive(Debug, Clone, Default)]
struct StateRow {
    last_known_state_blob_path: Option<String>,
    worker_lock_id: Option<String>,
    worker_lock_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct StoredEvent {
    event: NotificationEvent,
    fanned_out: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    searches: BTreeMap<String, SavedSearch>,
    states: HashMap<(String, SnapshotType), StateRow>,
    events: Vec<StoredEvent>,
    channels: BTreeMap<String, NewChannel>,
    channel_states: HashMap<String, ChannelState>,
    subscriptions: BTreeMap<String, NewSubscription>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_saved_search(&self, search: SavedSearch) {
        let mut state = self.state.lock().await;
        state.searches.insert(search.id.clone(), search);
    }

    pub async fn update_query(&self, search_id: &str, query: &str) {
        let mut state = self.state.lock().await;
        if let Some(search) = state.searches.get_mut(search_id) {
            search.query = query.to_string();
            search.updated_at = Utc::now();
        }
    }

    pub async fn insert_channel(&self, channel: NewChannel) {
        let mut state = self.state.lock().await;
        state.channels.insert(channel.id.clone(), channel);
    }

    pub async fn insert_subscription(&self, subscription: NewSubscription) {
        let mut state = self.state.lock().await;
        state
            .subscriptions
            .insert(subscription.id.clone(), subscription);
    }

    pub async fn apply_seed(&self, data: &SeedData) {
        for search in &data.saved_searches {
            self.insert_saved_search(search.clone()).await;
        }
        for channel in &data.channels {
            self.insert_channel(channel.clone()).await;
        }
        for subscription in &data.subscriptions {
            self.insert_subscription(subscription.clone()).await;
        }
    }

    /// Remove a saved search and everything keyed by it.
    pub async fn delete_saved_search(&self, search_id: &str) {
        let mut state = self.state.lock().await;
        state.searches.remove(search_id);
        state.states.retain(|(id, _), _| id != search_id);
        state.events.retain(|e| e.event.search_id != search_id);
        state
            .subscriptions
            .retain(|_, s| s.saved_search_id != search_id);
    }

    pub async fn lock_holder(&self, search_id: &str, snapshot_type: SnapshotType) -> Option<String> {
        let state = self.state.lock().await;
        state
            .states
            .get(&(search_id.to_string(), snapshot_type))
            .and_then(|row| row.worker_lock_id.clone())
    }

    pub async fn last_known_state_blob_path(
        &self,
        search_id: &str,
        snapshot_type: SnapshotType,
    ) -> Option<String> {
        let state = self.state.lock().await;
        state
            .states
            .get(&(search_id.to_string(), snapshot_type))
            .and_then(|row| row.last_known_state_blob_path.clone())
    }

    pub async fn event_count(&self) -> usize {
        self.state.lock().await.events.len()
    }
}

#[async_trait]
impl SnapshotLocks for MemoryStore {
    async fn acquire_lock(
        &self,
        search_id: &str,
        snapshot_type: SnapshotType,
        worker_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StoreError::Decode(format!("lock ttl out of range: {e}")))?;
        let mut state = self.state.lock().await;
        if !state.searches.contains_key(search_id) {
            return Err(StoreError::UnknownSearch(search_id.to_string()));
        }
        let now = Utc::now();
        let row = state
            .states
            .entry((search_id.to_string(), snapshot_type))
            .or_default();
        let held = match (&row.worker_lock_id, row.worker_lock_expires_at) {
            (Some(_), Some(expires_at)) => expires_at > now,
            _ => false,
        };
        if held {
            return Ok(false);
        }
        row.worker_lock_id = Some(worker_id.to_string());
        row.worker_lock_expires_at = Some(now + ttl);
        Ok(true)
    }

    async fn release_lock(
        &self,
        search_id: &str,
        snapshot_type: SnapshotType,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(row) = state.states.get_mut(&(search_id.to_string(), snapshot_type)) {
            row.worker_lock_id = None;
            row.worker_lock_expires_at = None;
        }
        Ok(())
    }
}

#[async_trait]
impl EventLog for MemoryStore {
    async fn get_latest_event(
        &self,
        snapshot_type: SnapshotType,
        search_id: &str,
    ) -> Result<Option<LatestEvent>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .rev()
            .find(|e| e.event.search_id == search_id && e.event.snapshot_type == snapshot_type)
            .map(|e| LatestEvent {
                event_id: e.event.event_id.clone(),
                state_blob_path: e.event.state_blob_path.clone(),
            }))
    }

    async fn publish_event(
        &self,
        request: PublishEventRequest,
    ) -> Result<NotificationEvent, StoreError> {
        let mut state = self.state.lock().await;
        if !state.searches.contains_key(&request.search_id) {
            return Err(StoreError::UnknownSearch(request.search_id));
        }
        let event = NotificationEvent {
            event_id: request.event_id.clone(),
            search_id: request.search_id.clone(),
            snapshot_type: request.snapshot_type,
            query: request.query.clone(),
            frequency: request.frequency,
            timestamp: Utc::now(),
            reasons: request.reasons.clone(),
            state_blob_path: request.state_blob_path.clone(),
            diff_blob_path: request.diff_blob_path.clone(),
            summary: request.wrapped_summary(),
        };
        state
            .states
            .entry((request.search_id.clone(), request.snapshot_type))
            .or_default()
            .last_known_state_blob_path = Some(request.state_blob_path);
        state.events.push(StoredEvent {
            event: event.clone(),
            fanned_out: false,
        });
        Ok(event)
    }

    async fn pending_fanout(
        &self,
        search_id: &str,
        snapshot_type: SnapshotType,
    ) -> Result<Vec<NotificationEvent>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .filter(|e| {
                !e.fanned_out
                    && e.event.search_id == search_id
                    && e.event.snapshot_type == snapshot_type
            })
            .map(|e| e.event.clone())
            .collect())
    }

    async fn mark_fanned_out(&self, event_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        for stored in state.events.iter_mut().filter(|e| e.event.event_id == event_id) {
            stored.fanned_out = true;
        }
        Ok(())
    }

    async fn list_events(
        &self,
        search_id: &str,
        limit: u32,
    ) -> Result<Vec<NotificationEvent>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .rev()
            .filter(|e| e.event.search_id == search_id)
            .take(limit as usize)
            .map(|e| e.event.clone())
            .collect())
    }
}

#[async_trait]
impl SavedSearchCatalog for MemoryStore {
    async fn list_all_saved_searches(&self) -> Result<Vec<SavedSearchRef>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .searches
            .values()
            .map(|s| SavedSearchRef {
                id: s.id.clone(),
                query: s.query.clone(),
            })
            .collect())
    }

    async fn get_saved_search(&self, search_id: &str) -> Result<Option<SavedSearchRef>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.searches.get(search_id).map(|s| SavedSearchRef {
            id: s.id.clone(),
            query: s.query.clone(),
        }))
    }
}

#[async_trait]
impl SubscriberDirectory for MemoryStore {
    async fn find_subscription_destinations(
        &self,
        search_id: &str,
        frequency: Frequency,
    ) -> Result<Vec<SubscriptionDestination>, StoreError> {
        let frequencies = frequency.sharing_snapshot();
        let state = self.state.lock().await;
        let mut destinations = Vec::new();
        for sub in state.subscriptions.values() {
            if sub.saved_search_id != search_id || !frequencies.contains(&sub.frequency) {
                continue;
            }
            let Some(channel) = state.channels.get(&sub.channel_id) else {
                continue;
            };
            let disabled = state
                .channel_states
                .get(&channel.id)
                .is_some_and(|s| s.is_disabled_by_system);
            if disabled {
                continue;
            }
            destinations.push(SubscriptionDestination {
                subscription_id: sub.id.clone(),
                user_id: sub.user_id.clone(),
                channel_id: channel.id.clone(),
                channel_type: channel.channel_type.clone(),
                channel_config: channel.config.clone(),
                triggers: sub.triggers.clone(),
            });
        }
        Ok(destinations)
    }
}

#[async_trait]
impl ChannelHealth for MemoryStore {
    async fn record_channel_success(
        &self,
        channel_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let entry = state
            .channel_states
            .entry(channel_id.to_string())
            .or_insert_with(|| ChannelState {
                channel_id: channel_id.to_string(),
                ..ChannelState::default()
            });
        apply_channel_success(entry, at);
        Ok(())
    }

    async fn record_channel_failure(&self, failure: ChannelFailure) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let entry = state
            .channel_states
            .entry(failure.channel_id.clone())
            .or_insert_with(|| ChannelState {
                channel_id: failure.channel_id.clone(),
                ..ChannelState::default()
            });
        apply_channel_failure(entry, &failure);
        Ok(())
    }

    async fn channel_state(&self, channel_id: &str) -> Result<Option<ChannelState>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.channel_states.get(channel_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use featwatch_core::{Reason, SearchScope};

    fn search(id: &str, query: &str) -> SavedSearch {
        SavedSearch {
            id: id.to_string(),
            name: format!("search {id}"),
            query: query.to_string(),
            scope: SearchScope::UserPublic,
            author_id: "author".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn publish_request(event_id: &str, search_id: &str) -> PublishEventRequest {
        PublishEventRequest {
            event_id: event_id.to_string(),
            search_id: search_id.to_string(),
            snapshot_type: SnapshotType::Immediate,
            query: "q".to_string(),
            frequency: Frequency::Immediate,
            reasons: vec![Reason::DataUpdated],
            state_blob_path: format!("state/{search_id}/{event_id}.json"),
            diff_blob_path: format!("diff/{search_id}/{event_id}.json"),
            summary: serde_json::json!({"schema_version": "v1"}),
        }
    }

    #[tokio::test]
    async fn concurrent_lock_acquisition_has_one_winner() {
        let store = Arc::new(MemoryStore::new());
        store.insert_saved_search(search("s1", "q")).await;

        let mut handles = Vec::new();
        for n in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .acquire_lock(
                        "s1",
                        SnapshotType::Immediate,
                        &format!("worker-{n}"),
                        Duration::from_secs(60),
                    )
                    .await
                    .unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn locks_are_per_snapshot_type_and_reclaimable_after_expiry() {
        let store = MemoryStore::new();
        store.insert_saved_search(search("s1", "q")).await;

        assert!(store
            .acquire_lock("s1", SnapshotType::Immediate, "a", Duration::ZERO)
            .await
            .unwrap());
        assert!(store
            .acquire_lock("s1", SnapshotType::Weekly, "b", Duration::from_secs(60))
            .await
            .unwrap());
        // The zero-ttl lock has already lapsed.
        assert!(store
            .acquire_lock("s1", SnapshotType::Immediate, "c", Duration::from_secs(60))
            .await
            .unwrap());
        assert_eq!(
            store.lock_holder("s1", SnapshotType::Immediate).await.as_deref(),
            Some("c")
        );

        store.release_lock("s1", SnapshotType::Immediate).await.unwrap();
        assert_eq!(store.lock_holder("s1", SnapshotType::Immediate).await, None);
    }

    #[tokio::test]
    async fn locking_an_unknown_search_fails() {
        let store = MemoryStore::new();
        let err = store
            .acquire_lock("nope", SnapshotType::Immediate, "w", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownSearch(_)));
    }

    #[tokio::test]
    async fn latest_event_and_outbox_tracking() {
        let store = MemoryStore::new();
        store.insert_saved_search(search("s1", "q")).await;
        assert!(store
            .get_latest_event(SnapshotType::Immediate, "s1")
            .await
            .unwrap()
            .is_none());

        store.publish_event(publish_request("e1", "s1")).await.unwrap();
        store.publish_event(publish_request("e2", "s1")).await.unwrap();

        let latest = store
            .get_latest_event(SnapshotType::Immediate, "s1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.event_id, "e2");
        assert_eq!(latest.state_blob_path, "state/s1/e2.json");
        assert_eq!(
            store
                .last_known_state_blob_path("s1", SnapshotType::Immediate)
                .await
                .as_deref(),
            Some("state/s1/e2.json")
        );

        store.mark_fanned_out("e1").await.unwrap();
        let pending = store
            .pending_fanout("s1", SnapshotType::Immediate)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event_id, "e2");
        assert_eq!(
            pending[0].summary,
            serde_json::json!({"summary": {"schema_version": "v1"}})
        );

        let listed = store.list_events("s1", 1).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].event_id, "e2");
    }

    #[tokio::test]
    async fn deleting_a_search_cascades() {
        let store = MemoryStore::new();
        store.insert_saved_search(search("s1", "q")).await;
        store.publish_event(publish_request("e1", "s1")).await.unwrap();
        store.insert_subscription(NewSubscription {
            id: "sub".into(),
            user_id: "u".into(),
            channel_id: "c".into(),
            saved_search_id: "s1".into(),
            triggers: vec![],
            frequency: Frequency::Immediate,
        })
        .await;

        assert_eq!(
            store.get_saved_search("s1").await.unwrap().map(|s| s.query),
            Some("q".to_string())
        );
        store.delete_saved_search("s1").await;
        assert!(store.get_saved_search("s1").await.unwrap().is_none());
        assert_eq!(store.event_count().await, 0);
        assert!(store.list_all_saved_searches().await.unwrap().is_empty());
        assert!(store
            .find_subscription_destinations("s1", Frequency::Immediate)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn disabled_channels_are_not_resolved() {
        let store = MemoryStore::new();
        store.insert_saved_search(search("s1", "q")).await;
        store
            .insert_channel(NewChannel {
                id: "c1".into(),
                user_id: "u1".into(),
                name: "mail".into(),
                channel_type: "email".into(),
                config: Some(serde_json::json!({"address": "u1@example.com"})),
            })
            .await;
        store
            .insert_subscription(NewSubscription {
                id: "sub1".into(),
                user_id: "u1".into(),
                channel_id: "c1".into(),
                saved_search_id: "s1".into(),
                triggers: vec![],
                frequency: Frequency::Daily,
            })
            .await;

        let found = store
            .find_subscription_destinations("s1", Frequency::Immediate)
            .await
            .unwrap();
        assert_eq!(found.len(), 1, "daily shares the immediate snapshot");
        assert!(store
            .find_subscription_destinations("s1", Frequency::Weekly)
            .await
            .unwrap()
            .is_empty());

        store
            .record_channel_failure(ChannelFailure {
                channel_id: "c1".into(),
                at: Utc::now(),
                message: "mailbox unavailable".into(),
                permanent_user: true,
                disable_threshold: 1,
            })
            .await
            .unwrap();
        assert!(store
            .find_subscription_destinations("s1", Frequency::Immediate)
            .await
            .unwrap()
            .is_empty());
    }
}
