//! Batch fan-out: one refresh command per saved search for a cadence.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use featwatch_events::{
    publish_event, BatchRefreshTrigger, EventHandler, EventPublisher, HandlerError,
    RefreshSearchCommand,
};
use featwatch_storage::SavedSearchCatalog;
use tracing::{info, warn};

pub struct BatchPublisher {
    catalog: Arc<dyn SavedSearchCatalog>,
    publisher: Arc<dyn EventPublisher>,
    topic: String,
}

impl BatchPublisher {
    pub fn new(
        catalog: Arc<dyn SavedSearchCatalog>,
        publisher: Arc<dyn EventPublisher>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            catalog,
            publisher,
            topic: topic.into(),
        }
    }

    /// Returns how many commands were published.
    pub async fn publish_all(&self, trigger: &BatchRefreshTrigger) -> Result<usize, HandlerError> {
        let searches = self
            .catalog
            .list_all_saved_searches()
            .await
            .map_err(HandlerError::transient)?;
        let timestamp = Utc::now();

        let mut published = 0;
        let mut failed = 0;
        for search in searches {
            let command = RefreshSearchCommand {
                search_id: search.id,
                query: search.query,
                frequency: trigger.frequency,
                timestamp,
            };
            match publish_event(self.publisher.as_ref(), &self.topic, &command).await {
                Ok(_) => published += 1,
                Err(err) => {
                    failed += 1;
                    warn!(search_id = %command.search_id, error = %err, "publishing refresh command failed");
                }
            }
        }

        info!(frequency = %trigger.frequency, published, failed, "batch refresh fanned out");
        if failed > 0 {
            // Redelivery republishes every search; repeats diff to no changes.
            return Err(HandlerError::transient(format!(
                "{failed} refresh commands could not be published"
            )));
        }
        Ok(published)
    }
}

#[async_trait]
impl EventHandler<BatchRefreshTrigger> for BatchPublisher {
    async fn handle(&self, event: BatchRefreshTrigger) -> Result<(), HandlerError> {
        self.publish_all(&event).await.map(|_| ())
    }
}
