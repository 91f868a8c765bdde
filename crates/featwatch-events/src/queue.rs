//! Publish/subscribe ports and the retry policy shared by queue transports.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinSet;

use crate::cancel::CancelToken;
use crate::envelope::{encode, EnvelopeError, Event};

/// Fixed topic names used by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub refresh_searches: String,
    pub batch_triggers: String,
    pub notification_events: String,
    pub email_jobs: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            refresh_searches: "refresh-searches".to_string(),
            batch_triggers: "batch-triggers".to_string(),
            notification_events: "notification-events".to_string(),
            email_jobs: "email-jobs".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error("queue is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Safe to redeliver.
    Transient,
    /// Redelivery cannot help; acknowledge and dead-letter.
    Permanent,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{disposition} failure: {message}")]
pub struct HandlerError {
    pub disposition: Disposition,
    pub message: String,
}

impl HandlerError {
    pub fn transient(err: impl fmt::Display) -> Self {
        Self {
            disposition: Disposition::Transient,
            message: err.to_string(),
        }
    }

    pub fn permanent(err: impl fmt::Display) -> Self {
        Self {
            disposition: Disposition::Permanent,
            message: err.to_string(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.disposition == Disposition::Transient
    }
}

/// A message as handed to a subscriber. `attempt` is 1 on first delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub attempt: u32,
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Returns the id assigned to the message.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<String, QueueError>;
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError>;
}

#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Deliver messages from `topic` to `handler` until `cancel` fires.
    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
        cancel: CancelToken,
    ) -> Result<(), QueueError>;
}

/// Collect handler tasks that have already finished, without waiting.
pub(crate) fn reap_finished(in_flight: &mut JoinSet<()>) -> usize {
    let mut reaped = 0;
    while in_flight.try_join_next().is_some() {
        reaped += 1;
    }
    reaped
}

/// Wrap `event` in its envelope and publish it.
pub async fn publish_event<P, E>(publisher: &P, topic: &str, event: &E) -> Result<String, QueueError>
where
    P: EventPublisher + ?Sized,
    E: Event + Sync,
{
    let payload = encode(event)?;
    publisher.publish(topic, payload).await
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub backoff: BackoffPolicy,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            max_attempts: 8,
        }
    }
}

/// What a transport does with a message after its handler returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Retry { delay: Duration, error: String },
    DeadLetter { error: String },
}

impl RetryPolicy {
    pub fn settle(&self, attempt: u32, outcome: &Result<(), HandlerError>) -> Settlement {
        match outcome {
            Ok(()) => Settlement::Ack,
            Err(err) if err.is_transient() && attempt < self.max_attempts => Settlement::Retry {
                delay: self
                    .backoff
                    .delay_for_attempt(attempt.saturating_sub(1) as usize),
                error: err.message.clone(),
            },
            Err(err) if err.is_transient() => Settlement::DeadLetter {
                error: format!("gave up after {attempt} attempts: {}", err.message),
            },
            Err(err) => Settlement::DeadLetter {
                error: err.message.clone(),
            },
        }
    }
}
