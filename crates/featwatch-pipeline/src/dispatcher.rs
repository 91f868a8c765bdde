//! Delivery dispatcher: turns one diff event into one job per subscriber.

use std::sync::Arc;

use async_trait::async_trait;
use featwatch_core::{ChannelKind, EmailSubscriber, Frequency, SubscriptionTrigger};
use featwatch_events::{
    publish_event, EmailJobEvent, EmailJobMetadata, EventHandler, EventPublisher,
    FeatureDiffEvent, HandlerError,
};
use featwatch_storage::{StoreError, SubscriberDirectory};
use tracing::{debug, info, warn};

/// Active subscribers of a search, grouped by channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subscribers {
    pub emails: Vec<EmailSubscriber>,
}

/// Resolve destinations into typed subscribers. Unknown channel types and
/// destinations with missing or invalid config are skipped.
pub async fn find_subscribers(
    directory: &dyn SubscriberDirectory,
    search_id: &str,
    frequency: Frequency,
) -> Result<Subscribers, StoreError> {
    let destinations = directory
        .find_subscription_destinations(search_id, frequency)
        .await?;

    let mut subscribers = Subscribers::default();
    for destination in destinations {
        let kind = match ChannelKind::from_parts(
            &destination.channel_type,
            destination.channel_config.as_ref(),
        ) {
            Ok(Some(kind)) => kind,
            Ok(None) => {
                debug!(
                    subscription_id = %destination.subscription_id,
                    channel_type = %destination.channel_type,
                    "skipping unsupported channel type"
                );
                continue;
            }
            Err(err) => {
                warn!(
                    subscription_id = %destination.subscription_id,
                    channel_id = %destination.channel_id,
                    error = %err,
                    "skipping subscriber with unusable channel config"
                );
                continue;
            }
        };

        match kind {
            ChannelKind::Email(config) => subscribers.emails.push(EmailSubscriber {
                subscription_id: destination.subscription_id,
                user_id: destination.user_id,
                email_address: config.address,
                triggers: destination
                    .triggers
                    .iter()
                    .map(|t| SubscriptionTrigger::parse(t))
                    .collect(),
                channel_id: destination.channel_id,
            }),
            ChannelKind::Webhook(_) => {
                debug!(
                    subscription_id = %destination.subscription_id,
                    "webhook delivery is not available yet"
                );
            }
        }
    }
    Ok(subscribers)
}

pub struct Dispatcher {
    directory: Arc<dyn SubscriberDirectory>,
    publisher: Arc<dyn EventPublisher>,
    topic: String,
}

impl Dispatcher {
    pub fn new(
        directory: Arc<dyn SubscriberDirectory>,
        publisher: Arc<dyn EventPublisher>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            directory,
            publisher,
            topic: topic.into(),
        }
    }

    /// Publish one email job per subscriber. Every subscriber is attempted;
    /// the error reports how many jobs did not go out.
    pub async fn process_event(&self, event: &FeatureDiffEvent) -> Result<usize, HandlerError> {
        let subscribers = find_subscribers(self.directory.as_ref(), &event.search_id, event.frequency)
            .await
            .map_err(HandlerError::transient)?;

        let metadata = EmailJobMetadata {
            event_id: event.event_id.clone(),
            search_id: event.search_id.clone(),
            query: event.query.clone(),
            frequency: event.frequency,
            generated_at: event.generated_at,
        };

        let mut failed = 0usize;
        let mut sent = 0usize;
        for subscriber in subscribers.emails {
            let job = EmailJobEvent {
                subscription_id: subscriber.subscription_id,
                recipient_email: subscriber.email_address,
                channel_id: subscriber.channel_id,
                summary_raw: event.summary.clone(),
                metadata: metadata.clone(),
                triggers: subscriber.triggers,
            };
            match publish_event(self.publisher.as_ref(), &self.topic, &job).await {
                Ok(_) => sent += 1,
                Err(err) => {
                    failed += 1;
                    warn!(
                        event_id = %event.event_id,
                        subscription_id = %job.subscription_id,
                        error = %err,
                        "publishing email job failed"
                    );
                }
            }
        }

        info!(event_id = %event.event_id, search_id = %event.search_id, sent, failed, "event dispatched");
        if failed > 0 {
            return Err(HandlerError::transient(format!(
                "{failed} email jobs could not be published"
            )));
        }
        Ok(sent)
    }
}

#[async_trait]
impl EventHandler<FeatureDiffEvent> for Dispatcher {
    async fn handle(&self, event: FeatureDiffEvent) -> Result<(), HandlerError> {
        self.process_event(&event).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use featwatch_core::{Reason, SubscriptionDestination};
    use featwatch_events::{decode, MemoryQueue, QueueError};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedDirectory(Vec<SubscriptionDestination>);

    #[async_trait]
    impl SubscriberDirectory for FixedDirectory {
        async fn find_subscription_destinations(
            &self,
            _search_id: &str,
            _frequency: Frequency,
        ) -> Result<Vec<SubscriptionDestination>, StoreError> {
            Ok(self.0.clone())
        }
    }

    fn destination(id: &str, channel_type: &str, config: Option<serde_json::Value>) -> SubscriptionDestination {
        SubscriptionDestination {
            subscription_id: id.into(),
            user_id: format!("user-{id}"),
            channel_id: format!("chan-{id}"),
            channel_type: channel_type.into(),
            channel_config: config,
            triggers: vec!["feature_promoted_to_newly".into(), "something_new".into()],
        }
    }

    fn diff_event() -> FeatureDiffEvent {
        FeatureDiffEvent {
            event_id: "e1".into(),
            search_id: "s1".into(),
            query: "baseline_status:newly".into(),
            summary: br#"{"schema_version":"v1"}"#.to_vec(),
            state_id: "st".into(),
            state_blob_path: "state/s1/st.json".into(),
            diff_id: "df".into(),
            diff_blob_path: "diff/s1/df.json".into(),
            generated_at: Utc::now(),
            frequency: Frequency::Immediate,
            reasons: vec![Reason::DataUpdated],
        }
    }

    #[tokio::test]
    async fn resolution_keeps_only_usable_email_destinations() {
        let directory = FixedDirectory(vec![
            destination("ok", "email", Some(json!({"address": "dev@example.com"}))),
            destination("no-config", "email", None),
            destination("bad", "email", Some(json!({"address": "nope"}))),
            destination("hook", "webhook", Some(json!({"url": "https://example.com"}))),
            destination("pager", "pager", Some(json!({}))),
        ]);

        let subscribers = find_subscribers(&directory, "s1", Frequency::Immediate)
            .await
            .unwrap();
        assert_eq!(subscribers.emails.len(), 1);
        let email = &subscribers.emails[0];
        assert_eq!(email.email_address, "dev@example.com");
        assert_eq!(
            email.triggers,
            vec![
                SubscriptionTrigger::FeaturePromotedToNewly,
                SubscriptionTrigger::Unknown
            ]
        );
    }

    #[tokio::test]
    async fn one_job_per_subscriber_with_opaque_summary() {
        let directory = Arc::new(FixedDirectory(vec![
            destination("a", "email", Some(json!({"address": "a@example.com"}))),
            destination("b", "email", Some(json!({"address": "b@example.com"}))),
        ]));
        let queue = MemoryQueue::default();
        let dispatcher = Dispatcher::new(directory, Arc::new(queue.clone()), "email-jobs");

        assert_eq!(dispatcher.process_event(&diff_event()).await.unwrap(), 2);
        let jobs: Vec<EmailJobEvent> = queue
            .pending("email-jobs")
            .await
            .iter()
            .map(|m| decode(&m.payload).unwrap())
            .collect();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.summary_raw == diff_event().summary));
        assert_eq!(jobs[0].metadata.query, "baseline_status:newly");
        assert_eq!(jobs[0].idempotency_key(), "e1:a");
    }

    struct FailSecond {
        inner: MemoryQueue,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EventPublisher for FailSecond {
        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<String, QueueError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 1 {
                return Err(QueueError::Closed);
            }
            self.inner.publish(topic, payload).await
        }
    }

    #[tokio::test]
    async fn one_failed_job_does_not_block_the_rest() {
        let directory = Arc::new(FixedDirectory(vec![
            destination("a", "email", Some(json!({"address": "a@example.com"}))),
            destination("b", "email", Some(json!({"address": "b@example.com"}))),
            destination("c", "email", Some(json!({"address": "c@example.com"}))),
        ]));
        let queue = MemoryQueue::default();
        let publisher = Arc::new(FailSecond {
            inner: queue.clone(),
            calls: AtomicUsize::new(0),
        });
        let dispatcher = Dispatcher::new(directory, publisher, "email-jobs");

        let err = dispatcher.process_event(&diff_event()).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(queue.pending("email-jobs").await.len(), 2);
    }
}
