//! Event producer: one locked diff-and-publish cycle per
//! `(saved search, snapshot type)`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use featwatch_adapters::FeatureBackend;
use featwatch_core::{new_id, FeatureSnapshot, Frequency, NotificationEvent, SnapshotType};
use featwatch_events::{
    decode, encode, publish_event, EnvelopeError, EventHandler, EventPublisher, FeatureDiffEvent,
    HandlerError, QueueError, RefreshSearchCommand, SearchConfigurationChangedEvent,
};
use featwatch_storage::{
    BlobError, BlobKind, BlobStore, EventLog, PublishEventRequest, SnapshotLocks, StoreError,
};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::differ::{compute_diff, fetch_current, DiffError};
use crate::summary::{generate_json_summary, SummaryError};

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("acquiring worker lock: {0}")]
    Lock(#[source] StoreError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error("stored snapshot is unreadable: {0}")]
    Snapshot(#[from] EnvelopeError),
    #[error(transparent)]
    Diff(#[from] DiffError),
    #[error(transparent)]
    Summary(#[from] SummaryError),
    #[error("publishing diff event: {0}")]
    Publish(#[from] QueueError),
}

impl ProducerError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Lock(err) | Self::Store(err) => !matches!(err, StoreError::UnknownSearch(_)),
            Self::Diff(err) => err.is_transient(),
            Self::Blob(_) | Self::Publish(_) => true,
            Self::Snapshot(_) | Self::Summary(_) => false,
        }
    }
}

impl From<ProducerError> for HandlerError {
    fn from(err: ProducerError) -> Self {
        if err.is_transient() {
            HandlerError::transient(err)
        } else {
            HandlerError::permanent(err)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Another worker holds the lock for this key.
    Skipped,
    NoChanges,
    Published { event_id: String },
}

pub struct EventProducer {
    locks: Arc<dyn SnapshotLocks>,
    events: Arc<dyn EventLog>,
    backend: Arc<dyn FeatureBackend>,
    publisher: Arc<dyn EventPublisher>,
    blobs: BlobStore,
    topic: String,
    worker_id: String,
    lock_ttl: Duration,
}

impl EventProducer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        locks: Arc<dyn SnapshotLocks>,
        events: Arc<dyn EventLog>,
        backend: Arc<dyn FeatureBackend>,
        publisher: Arc<dyn EventPublisher>,
        blobs: BlobStore,
        topic: impl Into<String>,
        worker_id: impl Into<String>,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            locks,
            events,
            backend,
            publisher,
            blobs,
            topic: topic.into(),
            worker_id: worker_id.into(),
            lock_ttl,
        }
    }

    pub async fn refresh(&self, command: &RefreshSearchCommand) -> Result<RefreshOutcome, ProducerError> {
        let snapshot_type = command.frequency.snapshot_type();
        let span = info_span!(
            "refresh",
            search_id = %command.search_id,
            snapshot_type = %snapshot_type,
            worker_id = %self.worker_id
        );
        async move {
            let acquired = self
                .locks
                .acquire_lock(&command.search_id, snapshot_type, &self.worker_id, self.lock_ttl)
                .await
                .map_err(ProducerError::Lock)?;
            if !acquired {
                info!("lock held by another worker; skipping");
                return Ok(RefreshOutcome::Skipped);
            }
            debug!("lock acquired");

            let outcome = self.run_locked(command, snapshot_type).await;

            match self.locks.release_lock(&command.search_id, snapshot_type).await {
                Ok(()) => debug!("lock released"),
                // The TTL reclaims it.
                Err(err) => warn!(error = %err, "releasing lock failed"),
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn run_locked(
        &self,
        command: &RefreshSearchCommand,
        snapshot_type: SnapshotType,
    ) -> Result<RefreshOutcome, ProducerError> {
        self.republish_pending(command, snapshot_type).await?;

        let previous = match self
            .events
            .get_latest_event(snapshot_type, &command.search_id)
            .await?
        {
            Some(latest) => {
                let bytes = self.blobs.get(&latest.state_blob_path).await?;
                decode::<FeatureSnapshot>(&bytes)?
            }
            // First evaluation: everything live counts as added.
            None => FeatureSnapshot::new(command.query.clone(), DateTime::<Utc>::UNIX_EPOCH, Vec::new()),
        };

        let features = fetch_current(self.backend.as_ref(), &command.query).await?;
        let current = FeatureSnapshot::new(command.query.clone(), Utc::now(), features);
        let diff = compute_diff(self.backend.as_ref(), &previous, &current).await?;
        if !diff.has_changes() {
            info!("no changes detected");
            return Ok(RefreshOutcome::NoChanges);
        }

        let (summary, summary_bytes) = generate_json_summary(&diff)?;
        let state = self
            .blobs
            .put(BlobKind::State, &command.search_id, &encode(&current)?)
            .await?;
        let diff_blob = self
            .blobs
            .put(BlobKind::Diff, &command.search_id, &encode(&diff)?)
            .await?;

        let event = self
            .events
            .publish_event(PublishEventRequest {
                event_id: new_id(),
                search_id: command.search_id.clone(),
                snapshot_type,
                query: command.query.clone(),
                frequency: command.frequency,
                reasons: diff.reasons(),
                state_blob_path: state.path,
                diff_blob_path: diff_blob.path,
                summary: serde_json::to_value(&summary).map_err(SummaryError::from)?,
            })
            .await?;
        info!(event_id = %event.event_id, text = %summary.text, "event published");

        let message = diff_event(&event, summary_bytes);
        self.fan_out(&event.event_id, &message).await?;
        Ok(RefreshOutcome::Published {
            event_id: event.event_id,
        })
    }

    /// Events that committed without a confirmed fan-out get their message
    /// sent again before anything new is computed.
    async fn republish_pending(
        &self,
        command: &RefreshSearchCommand,
        snapshot_type: SnapshotType,
    ) -> Result<(), ProducerError> {
        let pending = self
            .events
            .pending_fanout(&command.search_id, snapshot_type)
            .await?;
        for event in pending {
            info!(event_id = %event.event_id, "re-publishing pending fan-out");
            let message = diff_event(&event, event.summary_bytes());
            self.fan_out(&event.event_id, &message).await?;
        }
        Ok(())
    }

    async fn fan_out(&self, event_id: &str, message: &FeatureDiffEvent) -> Result<(), ProducerError> {
        let message_id = publish_event(self.publisher.as_ref(), &self.topic, message).await?;
        self.events.mark_fanned_out(event_id).await?;
        debug!(event_id, message_id = %message_id, topic = %self.topic, "fan-out confirmed");
        Ok(())
    }
}

/// Blob file stem, which is the content hash.
fn blob_id(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(path)
        .to_string()
}

fn diff_event(event: &NotificationEvent, summary: Vec<u8>) -> FeatureDiffEvent {
    FeatureDiffEvent {
        event_id: event.event_id.clone(),
        search_id: event.search_id.clone(),
        query: event.query.clone(),
        summary,
        state_id: blob_id(&event.state_blob_path),
        state_blob_path: event.state_blob_path.clone(),
        diff_id: blob_id(&event.diff_blob_path),
        diff_blob_path: event.diff_blob_path.clone(),
        generated_at: event.timestamp,
        frequency: event.frequency,
        reasons: event.reasons.clone(),
    }
}

#[async_trait]
impl EventHandler<RefreshSearchCommand> for EventProducer {
    async fn handle(&self, event: RefreshSearchCommand) -> Result<(), HandlerError> {
        self.refresh(&event).await?;
        Ok(())
    }
}

#[async_trait]
impl EventHandler<SearchConfigurationChangedEvent> for EventProducer {
    async fn handle(&self, event: SearchConfigurationChangedEvent) -> Result<(), HandlerError> {
        info!(
            search_id = %event.search_id,
            user_id = %event.user_id,
            is_creation = event.is_creation,
            "saved search configuration changed"
        );
        // Edits are evaluated against the immediate snapshot.
        let mut command = RefreshSearchCommand::from(event);
        if command.frequency == Frequency::Unknown {
            command.frequency = Frequency::Immediate;
        }
        self.refresh(&command).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use featwatch_adapters::FixtureFeatureBackend;
    use featwatch_core::{FeatureState, SavedSearch, SearchScope};
    use featwatch_events::{MemoryQueue, Message, MessageHandler};
    use featwatch_storage::MemoryStore;
    use std::sync::atomic::{AtomicBool, Ordering};

    const QUERY: &str = "baseline_status:newly";
    const TOPIC: &str = "notification-events";

    fn feature(id: &str) -> FeatureState {
        FeatureState::new(id, id.to_uppercase()).with_baseline("newly")
    }

    fn search(id: &str) -> SavedSearch {
        SavedSearch {
            id: id.into(),
            name: "Newly available".into(),
            query: QUERY.into(),
            scope: SearchScope::UserPublic,
            author_id: "user-1".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn command(frequency: Frequency) -> RefreshSearchCommand {
        RefreshSearchCommand {
            search_id: "s1".into(),
            query: QUERY.into(),
            frequency,
            timestamp: Utc::now(),
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        queue: MemoryQueue,
        _dir: tempfile::TempDir,
        blobs: BlobStore,
    }

    impl Harness {
        async fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            store.insert_saved_search(search("s1")).await;
            let dir = tempfile::tempdir().unwrap();
            let blobs = BlobStore::new(dir.path());
            Self {
                store,
                queue: MemoryQueue::default(),
                _dir: dir,
                blobs,
            }
        }

        fn producer(&self, backend: FixtureFeatureBackend) -> EventProducer {
            self.producer_with(backend, Arc::new(self.queue.clone()))
        }

        fn producer_with(
            &self,
            backend: FixtureFeatureBackend,
            publisher: Arc<dyn EventPublisher>,
        ) -> EventProducer {
            EventProducer::new(
                self.store.clone(),
                self.store.clone(),
                Arc::new(backend),
                publisher,
                self.blobs.clone(),
                TOPIC,
                "worker-a",
                Duration::from_secs(60),
            )
        }
    }

    fn backend_with(ids: &[&str]) -> FixtureFeatureBackend {
        let mut backend = FixtureFeatureBackend::new();
        backend.set_results(QUERY, ids.iter().map(|id| feature(id)).collect());
        backend
    }

    async fn published_diff_events(queue: &MemoryQueue) -> Vec<FeatureDiffEvent> {
        queue
            .pending(TOPIC)
            .await
            .iter()
            .map(|m| decode::<FeatureDiffEvent>(&m.payload).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn first_run_reports_everything_added() {
        let harness = Harness::new().await;
        let producer = harness.producer(backend_with(&["a", "b"]));

        let outcome = producer.refresh(&command(Frequency::Immediate)).await.unwrap();
        let RefreshOutcome::Published { event_id } = outcome else {
            panic!("expected a published event, got {outcome:?}");
        };

        let events = published_diff_events(&harness.queue).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, event_id);
        let summary: serde_json::Value = serde_json::from_slice(&events[0].summary).unwrap();
        assert_eq!(summary["text"], "2 features added");
        assert!(harness.store.lock_holder("s1", SnapshotType::Immediate).await.is_none());
        assert!(harness
            .store
            .pending_fanout("s1", SnapshotType::Immediate)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn second_run_diffs_against_the_stored_snapshot() {
        let harness = Harness::new().await;
        harness
            .producer(backend_with(&["a", "b"]))
            .refresh(&command(Frequency::Immediate))
            .await
            .unwrap();

        let mut backend = backend_with(&["b", "c"]);
        backend.insert_feature(feature("a"));
        let outcome = harness
            .producer(backend)
            .refresh(&command(Frequency::Immediate))
            .await
            .unwrap();
        assert!(matches!(outcome, RefreshOutcome::Published { .. }));

        let events = published_diff_events(&harness.queue).await;
        let summary: serde_json::Value = serde_json::from_slice(&events[1].summary).unwrap();
        assert_eq!(summary["text"], "1 features added, 1 features removed");
        assert_eq!(summary["categories"]["added"], 1);
        assert_eq!(summary["categories"]["removed"], 1);
        assert_eq!(events[1].reasons, vec![featwatch_core::Reason::DataUpdated]);
    }

    #[tokio::test]
    async fn unchanged_results_publish_nothing() {
        let harness = Harness::new().await;
        let producer = harness.producer(backend_with(&["a"]));
        producer.refresh(&command(Frequency::Weekly)).await.unwrap();
        let outcome = producer.refresh(&command(Frequency::Weekly)).await.unwrap();
        assert_eq!(outcome, RefreshOutcome::NoChanges);
        assert_eq!(harness.store.event_count().await, 1);
    }

    #[tokio::test]
    async fn held_lock_skips_the_cycle() {
        let harness = Harness::new().await;
        assert!(harness
            .store
            .acquire_lock("s1", SnapshotType::Immediate, "other", Duration::from_secs(60))
            .await
            .unwrap());

        let outcome = harness
            .producer(backend_with(&["a"]))
            .refresh(&command(Frequency::Daily))
            .await
            .unwrap();
        assert_eq!(outcome, RefreshOutcome::Skipped);
        assert_eq!(
            harness.store.lock_holder("s1", SnapshotType::Immediate).await.as_deref(),
            Some("other")
        );
        assert_eq!(harness.store.event_count().await, 0);
    }

    #[tokio::test]
    async fn failed_fetch_releases_the_lock_and_persists_nothing() {
        let harness = Harness::new().await;
        struct Broken;
        #[async_trait]
        impl FeatureBackend for Broken {
            async fn features_search(
                &self,
                _query: &str,
                _page_token: Option<&str>,
                _page_size: u32,
            ) -> Result<featwatch_adapters::FeaturePage, featwatch_adapters::BackendError> {
                Err(featwatch_adapters::BackendError::Status {
                    status: 503,
                    body: "unavailable".into(),
                })
            }

            async fn get_feature(
                &self,
                _feature_id: &str,
            ) -> Result<featwatch_core::FeatureLookup, featwatch_adapters::BackendError> {
                Ok(featwatch_core::FeatureLookup::NotFound)
            }
        }

        let producer = EventProducer::new(
            harness.store.clone(),
            harness.store.clone(),
            Arc::new(Broken),
            Arc::new(harness.queue.clone()),
            harness.blobs.clone(),
            TOPIC,
            "worker-a",
            Duration::from_secs(60),
        );
        let err = producer.refresh(&command(Frequency::Immediate)).await.unwrap_err();
        assert!(err.is_transient());
        assert!(harness.store.lock_holder("s1", SnapshotType::Immediate).await.is_none());
        assert_eq!(harness.store.event_count().await, 0);
    }

    struct FlakyPublisher {
        inner: MemoryQueue,
        fail: AtomicBool,
    }

    #[async_trait]
    impl EventPublisher for FlakyPublisher {
        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<String, QueueError> {
            if self.fail.swap(false, Ordering::SeqCst) {
                return Err(QueueError::Closed);
            }
            self.inner.publish(topic, payload).await
        }
    }

    #[tokio::test]
    async fn failed_fan_out_is_retried_from_the_committed_event() {
        let harness = Harness::new().await;
        let publisher = Arc::new(FlakyPublisher {
            inner: harness.queue.clone(),
            fail: AtomicBool::new(true),
        });
        let producer = harness.producer_with(backend_with(&["a"]), publisher);

        let err = producer.refresh(&command(Frequency::Immediate)).await.unwrap_err();
        assert!(matches!(err, ProducerError::Publish(_)));
        assert_eq!(harness.store.event_count().await, 1);
        assert!(published_diff_events(&harness.queue).await.is_empty());

        let outcome = producer.refresh(&command(Frequency::Immediate)).await.unwrap();
        assert_eq!(outcome, RefreshOutcome::NoChanges);
        assert_eq!(harness.store.event_count().await, 1);
        let events = published_diff_events(&harness.queue).await;
        assert_eq!(events.len(), 1);
        assert!(!events[0].summary.is_empty());
    }

    #[tokio::test]
    async fn retried_fan_out_keeps_the_query_it_was_computed_under() {
        let harness = Harness::new().await;
        let mut backend = FixtureFeatureBackend::new();
        backend.set_results("baseline_status:limited", vec![feature("a")]);
        backend.set_results("baseline_status:widely", vec![feature("a"), feature("b")]);
        let publisher = Arc::new(FlakyPublisher {
            inner: harness.queue.clone(),
            fail: AtomicBool::new(true),
        });
        let producer = harness.producer_with(backend, publisher);

        let mut before_edit = command(Frequency::Daily);
        before_edit.query = "baseline_status:limited".into();
        producer.refresh(&before_edit).await.unwrap_err();

        let mut after_edit = command(Frequency::Immediate);
        after_edit.query = "baseline_status:widely".into();
        producer.refresh(&after_edit).await.unwrap();

        let events = published_diff_events(&harness.queue).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].query, "baseline_status:limited");
        assert_eq!(events[0].frequency, Frequency::Daily);
        let summary: serde_json::Value = serde_json::from_slice(&events[0].summary).unwrap();
        assert_eq!(summary["text"], "1 features added");
        assert_eq!(events[1].query, "baseline_status:widely");
        assert_eq!(events[1].frequency, Frequency::Immediate);
    }

    #[tokio::test]
    async fn edits_route_through_the_router_as_refreshes() {
        let harness = Harness::new().await;
        let producer = Arc::new(harness.producer(backend_with(&["a"])));
        let mut router = featwatch_events::Router::new();
        router
            .register::<RefreshSearchCommand, _>(producer.clone())
            .register::<SearchConfigurationChangedEvent, _>(producer);

        let edit = SearchConfigurationChangedEvent {
            search_id: "s1".into(),
            query: QUERY.into(),
            user_id: "user-1".into(),
            timestamp: Utc::now(),
            is_creation: true,
            frequency: Frequency::Unknown,
        };
        let message = Message {
            id: "m1".into(),
            topic: "refresh-searches".into(),
            payload: encode(&edit).unwrap(),
            attempt: 1,
        };
        router.handle(&message).await.unwrap();
        assert_eq!(published_diff_events(&harness.queue).await.len(), 1);
    }

    #[tokio::test]
    async fn deleted_search_is_a_permanent_failure() {
        let harness = Harness::new().await;
        let mut cmd = command(Frequency::Immediate);
        cmd.search_id = "missing".into();
        let err = harness
            .producer(backend_with(&["a"]))
            .refresh(&cmd)
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert!(!HandlerError::from(err).is_transient());
    }

    #[test]
    fn blob_ids_are_file_stems() {
        assert_eq!(blob_id("state/s1/abc123.json"), "abc123");
    }
}
