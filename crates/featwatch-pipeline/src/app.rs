//! Production wiring: PostgreSQL store and queue plus the configured adapters.

use std::sync::Arc;

use anyhow::{Context, Result};
use featwatch_adapters::{
    DeliveryRules, EmailSender, FeatureBackend, FixtureFeatureBackend, HttpEmailSender,
    HttpEmailSenderConfig, HttpFeatureBackend, LogEmailSender,
};
use featwatch_events::PgQueue;
use featwatch_storage::{BlobStore, PgStore};
use tracing::{info, warn};

use crate::batch::BatchPublisher;
use crate::config::PipelineConfig;
use crate::dispatcher::Dispatcher;
use crate::producer::EventProducer;
use crate::sender::{EmailDelivery, EmailRenderer};
use crate::worker::Pipeline;

pub struct Services {
    pub config: PipelineConfig,
    pub store: Arc<PgStore>,
    pub queue: Arc<PgQueue>,
    pub blobs: BlobStore,
}

impl Services {
    pub async fn connect(config: PipelineConfig) -> Result<Self> {
        let pool_size = u32::try_from(config.max_concurrency * 4 + 2).unwrap_or(u32::MAX);
        let store = PgStore::connect(&config.database_url, pool_size)
            .await
            .context("connecting to postgres")?;
        let queue = PgQueue::new(store.pool().clone(), config.retry_policy())
            .with_max_concurrency(config.max_concurrency)
            .with_poll_interval(config.poll_interval);
        let blobs = BlobStore::new(config.blob_dir.clone());
        Ok(Self {
            config,
            store: Arc::new(store),
            queue: Arc::new(queue),
            blobs,
        })
    }

    pub fn feature_backend(&self) -> Result<Arc<dyn FeatureBackend>> {
        match &self.config.backend_url {
            Some(url) => {
                info!(url = %url, "using http feature backend");
                let backend = HttpFeatureBackend::new(url, self.config.http_timeout)
                    .context("building feature backend client")?;
                Ok(Arc::new(backend))
            }
            None => {
                let path = &self.config.feature_fixtures;
                warn!(path = %path.display(), "no backend url configured; serving fixture features");
                Ok(Arc::new(FixtureFeatureBackend::from_json_file(path)?))
            }
        }
    }

    pub fn email_sender(&self) -> Result<Arc<dyn EmailSender>> {
        let Some(api_url) = &self.config.email_api_url else {
            warn!("no email provider configured; emails will only be logged");
            return Ok(Arc::new(LogEmailSender));
        };
        let rules = DeliveryRules::load_or_default(&self.config.delivery_rules_path)?;
        let sender = HttpEmailSender::new(HttpEmailSenderConfig {
            api_url: api_url.clone(),
            api_token: self.config.email_api_token.clone(),
            from_address: self.config.email_from.clone(),
            timeout: self.config.http_timeout,
            rules,
        })
        .context("building email sender")?;
        Ok(Arc::new(sender))
    }

    pub fn pipeline(&self) -> Result<Pipeline> {
        let topics = &self.config.topics;
        Ok(Pipeline {
            producer: Arc::new(EventProducer::new(
                self.store.clone(),
                self.store.clone(),
                self.feature_backend()?,
                self.queue.clone(),
                self.blobs.clone(),
                topics.notification_events.clone(),
                self.config.worker_id.clone(),
                self.config.lock_ttl,
            )),
            batch: Arc::new(BatchPublisher::new(
                self.store.clone(),
                self.queue.clone(),
                topics.refresh_searches.clone(),
            )),
            dispatcher: Arc::new(Dispatcher::new(
                self.store.clone(),
                self.queue.clone(),
                topics.email_jobs.clone(),
            )),
            delivery: Arc::new(EmailDelivery::new(
                EmailRenderer::new(&self.config.frontend_url),
                self.email_sender()?,
                self.store.clone(),
                self.config.channel_failure_threshold,
            )),
        })
    }
}
