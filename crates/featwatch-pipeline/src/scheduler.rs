//! Cron-driven batch triggers.

use std::sync::Arc;

use anyhow::{Context, Result};
use featwatch_core::Frequency;
use featwatch_events::{publish_event, BatchRefreshTrigger, EventPublisher, QueueError};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::config::PipelineConfig;

/// Publish one batch trigger for `frequency`; returns the message id.
pub async fn trigger_batch(
    publisher: &dyn EventPublisher,
    topic: &str,
    frequency: Frequency,
) -> Result<String, QueueError> {
    let id = publish_event(publisher, topic, &BatchRefreshTrigger { frequency }).await?;
    info!(%frequency, message_id = %id, "batch refresh triggered");
    Ok(id)
}

pub fn schedules(config: &PipelineConfig) -> [(Frequency, &str); 3] {
    [
        (Frequency::Immediate, config.cron_immediate.as_str()),
        (Frequency::Weekly, config.cron_weekly.as_str()),
        (Frequency::Monthly, config.cron_monthly.as_str()),
    ]
}

/// `None` when the scheduler is disabled. The caller starts the returned
/// scheduler and shuts it down.
pub async fn maybe_build_scheduler(
    config: &PipelineConfig,
    publisher: Arc<dyn EventPublisher>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for (frequency, cron) in schedules(config) {
        let publisher = Arc::clone(&publisher);
        let topic = config.topics.batch_triggers.clone();
        let job = Job::new_async(cron, move |_uuid, _l| {
            let publisher = Arc::clone(&publisher);
            let topic = topic.clone();
            Box::pin(async move {
                if let Err(err) = trigger_batch(publisher.as_ref(), &topic, frequency).await {
                    warn!(%frequency, error = %err, "scheduled batch trigger failed");
                }
            })
        })
        .with_context(|| format!("creating {frequency} job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(%frequency, cron, "scheduled batch refresh");
    }
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use featwatch_events::{decode, MemoryQueue};

    fn config(enabled: bool) -> PipelineConfig {
        let enabled = enabled.to_string();
        PipelineConfig::from_lookup(|key| {
            (key == "FEATWATCH_SCHEDULER_ENABLED").then(|| enabled.clone())
        })
    }

    #[tokio::test]
    async fn trigger_publishes_a_batch_envelope() {
        let queue = MemoryQueue::default();
        trigger_batch(&queue, "batch-triggers", Frequency::Monthly)
            .await
            .unwrap();
        let pending = queue.pending("batch-triggers").await;
        let trigger: BatchRefreshTrigger = decode(&pending[0].payload).unwrap();
        assert_eq!(trigger.frequency, Frequency::Monthly);
    }

    #[tokio::test]
    async fn disabled_scheduler_is_not_built() {
        let built = maybe_build_scheduler(&config(false), Arc::new(MemoryQueue::default()))
            .await
            .unwrap();
        assert!(built.is_none());
    }

    #[tokio::test]
    async fn default_crons_are_accepted() {
        let built = maybe_build_scheduler(&config(true), Arc::new(MemoryQueue::default()))
            .await
            .unwrap();
        assert!(built.is_some());
    }
}
