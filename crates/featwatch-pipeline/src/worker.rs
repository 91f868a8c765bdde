//! Wiring of handlers onto topics, and the supervised listener group.

use std::sync::Arc;

use featwatch_events::{
    BatchRefreshTrigger, CancelToken, EmailJobEvent, EventSubscriber, FeatureDiffEvent,
    MessageHandler, QueueError, RefreshSearchCommand, Router, RunGroup, RunGroupError,
    SearchConfigurationChangedEvent, Topics,
};
use tracing::info;

use crate::batch::BatchPublisher;
use crate::dispatcher::Dispatcher;
use crate::producer::EventProducer;
use crate::sender::EmailDelivery;

/// Every stage of the pipeline, ready to be routed.
pub struct Pipeline {
    pub producer: Arc<EventProducer>,
    pub batch: Arc<BatchPublisher>,
    pub dispatcher: Arc<Dispatcher>,
    pub delivery: Arc<EmailDelivery>,
}

impl Pipeline {
    /// One router per topic. Edits and scheduled refreshes share the
    /// refresh topic.
    pub fn routes(&self, topics: &Topics) -> Vec<(String, Router)> {
        let mut refresh = Router::new();
        refresh
            .register::<RefreshSearchCommand, _>(Arc::clone(&self.producer))
            .register::<SearchConfigurationChangedEvent, _>(Arc::clone(&self.producer));

        let mut batch = Router::new();
        batch.register::<BatchRefreshTrigger, _>(Arc::clone(&self.batch));

        let mut notifications = Router::new();
        notifications.register::<FeatureDiffEvent, _>(Arc::clone(&self.dispatcher));

        let mut email = Router::new();
        email.register::<EmailJobEvent, _>(Arc::clone(&self.delivery));

        vec![
            (topics.refresh_searches.clone(), refresh),
            (topics.batch_triggers.clone(), batch),
            (topics.notification_events.clone(), notifications),
            (topics.email_jobs.clone(), email),
        ]
    }
}

/// Subscribe every route and block until `cancel` fires or one listener
/// fails, in which case the others are stopped first.
pub async fn run_subscriptions(
    subscriber: Arc<dyn EventSubscriber>,
    routes: Vec<(String, Router)>,
    cancel: &CancelToken,
) -> Result<(), RunGroupError<QueueError>> {
    let mut group = RunGroup::new(cancel);
    for (topic, router) in routes {
        info!(topic = %topic, kinds = ?router.kinds(), "starting listener");
        let subscriber = Arc::clone(&subscriber);
        let handler: Arc<dyn MessageHandler> = Arc::new(router);
        group.spawn(move |token| async move { subscriber.subscribe(&topic, handler, token).await });
    }
    group.wait().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::EmailRenderer;
    use async_trait::async_trait;
    use chrono::Utc;
    use featwatch_adapters::{EmailSender, FixtureFeatureBackend, SendError};
    use featwatch_core::{FeatureState, Frequency, SavedSearch, SearchScope};
    use featwatch_events::{publish_event, MemoryQueue};
    use featwatch_storage::{BlobStore, MemoryStore, NewChannel, NewSubscription};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Outbox(Mutex<Vec<(String, String, String)>>);

    #[async_trait]
    impl EmailSender for Outbox {
        async fn send(&self, id: &str, to: &str, subject: &str, html_body: &str) -> Result<(), SendError> {
            let mut sent = self.0.lock().unwrap();
            if sent.iter().any(|(seen, _, _)| seen == id) {
                return Err(SendError::Duplicate);
            }
            sent.push((id.to_string(), to.to_string(), format!("{subject}\n{html_body}")));
            Ok(())
        }
    }

    const QUERY: &str = "baseline_status:newly";

    async fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_saved_search(SavedSearch {
                id: "s1".into(),
                name: "Newly".into(),
                query: QUERY.into(),
                scope: SearchScope::UserPublic,
                author_id: "u1".into(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await;
        store
            .insert_channel(NewChannel {
                id: "c1".into(),
                user_id: "u1".into(),
                name: "Inbox".into(),
                channel_type: "email".into(),
                config: Some(serde_json::json!({"address": "dev@example.com"})),
            })
            .await;
        store
            .insert_subscription(NewSubscription {
                id: "sub1".into(),
                user_id: "u1".into(),
                channel_id: "c1".into(),
                saved_search_id: "s1".into(),
                triggers: vec!["feature_promoted_to_newly".into()],
                frequency: Frequency::Immediate,
            })
            .await;
        store
    }

    fn pipeline(
        store: &Arc<MemoryStore>,
        queue: &MemoryQueue,
        backend: FixtureFeatureBackend,
        blobs: BlobStore,
        outbox: Arc<Outbox>,
        topics: &Topics,
    ) -> Pipeline {
        Pipeline {
            producer: Arc::new(EventProducer::new(
                store.clone(),
                store.clone(),
                Arc::new(backend),
                Arc::new(queue.clone()),
                blobs,
                topics.notification_events.clone(),
                "worker-test",
                Duration::from_secs(60),
            )),
            batch: Arc::new(BatchPublisher::new(
                store.clone(),
                Arc::new(queue.clone()),
                topics.refresh_searches.clone(),
            )),
            dispatcher: Arc::new(Dispatcher::new(
                store.clone(),
                Arc::new(queue.clone()),
                topics.email_jobs.clone(),
            )),
            delivery: Arc::new(EmailDelivery::new(
                EmailRenderer::new("https://status.example.com"),
                outbox,
                store.clone(),
                3,
            )),
        }
    }

    fn backend(ids: &[&str]) -> FixtureFeatureBackend {
        let mut backend = FixtureFeatureBackend::new();
        backend.set_results(
            QUERY,
            ids.iter()
                .map(|id| FeatureState::new(*id, id.to_uppercase()).with_baseline("newly"))
                .collect(),
        );
        backend
    }

    /// Drain every topic in pipeline order until nothing is left.
    async fn drain_all(queue: &MemoryQueue, routes: &[(String, Router)]) {
        for _ in 0..4 {
            for (topic, router) in routes {
                queue.drain(topic, router).await;
            }
        }
    }

    #[tokio::test]
    async fn batch_trigger_flows_through_to_an_email() {
        let topics = Topics::default();
        let store = seeded_store().await;
        let queue = MemoryQueue::default();
        let dir = tempfile::tempdir().unwrap();
        let outbox = Arc::new(Outbox::default());

        // First cycle records {A, B}.
        let routes = pipeline(
            &store,
            &queue,
            backend(&["a", "b"]),
            BlobStore::new(dir.path()),
            outbox.clone(),
            &topics,
        )
        .routes(&topics);
        publish_event(
            &queue,
            &topics.batch_triggers,
            &BatchRefreshTrigger {
                frequency: Frequency::Immediate,
            },
        )
        .await
        .unwrap();
        drain_all(&queue, &routes).await;
        assert_eq!(outbox.0.lock().unwrap().len(), 1);

        // Second cycle sees {B, C}; A is still known upstream.
        let mut next = backend(&["b", "c"]);
        next.insert_feature(FeatureState::new("a", "A"));
        let routes = pipeline(
            &store,
            &queue,
            next,
            BlobStore::new(dir.path()),
            outbox.clone(),
            &topics,
        )
        .routes(&topics);
        publish_event(
            &queue,
            &topics.batch_triggers,
            &BatchRefreshTrigger {
                frequency: Frequency::Daily,
            },
        )
        .await
        .unwrap();
        drain_all(&queue, &routes).await;

        let sent = outbox.0.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].1, "dev@example.com");
        assert!(sent[1].2.contains("1 features added, 1 features removed"));
        assert!(queue.dead_letters().await.is_empty());
        assert_eq!(store.event_count().await, 2);
    }

    #[tokio::test]
    async fn listeners_stop_on_cancel() {
        let topics = Topics::default();
        let store = seeded_store().await;
        let queue = MemoryQueue::default().with_poll_interval(Duration::from_millis(5));
        let dir = tempfile::tempdir().unwrap();
        let routes = pipeline(
            &store,
            &queue,
            backend(&["a"]),
            BlobStore::new(dir.path()),
            Arc::new(Outbox::default()),
            &topics,
        )
        .routes(&topics);

        let cancel = CancelToken::new();
        let running = tokio::spawn({
            let cancel = cancel.clone();
            let subscriber: Arc<dyn EventSubscriber> = Arc::new(queue.clone());
            async move { run_subscriptions(subscriber, routes, &cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        running.await.unwrap().unwrap();
    }
}
