use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::cancel::CancelToken;
use crate::queue::{
    reap_finished, EventPublisher, EventSubscriber, HandlerError, Message, MessageHandler,
    QueueError, RetryPolicy, Settlement,
};

/// Work queue over the `queue_messages` table.
///
/// Claimed rows are leased by pushing `visible_at` forward; a worker that
/// dies mid-message leaves the row to be reclaimed once the lease lapses.
#[derive(Debug, Clone)]
pub struct PgQueue {
    pool: PgPool,
    policy: RetryPolicy,
    max_concurrency: usize,
    poll_interval: Duration,
    lease: Duration,
}

impl PgQueue {
    pub fn new(pool: PgPool, policy: RetryPolicy) -> Self {
        Self {
            pool,
            policy,
            max_concurrency: 8,
            poll_interval: Duration::from_millis(500),
            lease: Duration::from_secs(300),
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    async fn claim(&self, topic: &str, limit: usize) -> Result<Vec<Message>, QueueError> {
        let rows = sqlx::query(
            r#"
            UPDATE queue_messages
               SET status = 'leased',
                   attempts = attempts + 1,
                   visible_at = NOW() + make_interval(secs => $3)
             WHERE id IN (
                   SELECT id
                     FROM queue_messages
                    WHERE topic = $1
                      AND status IN ('ready', 'leased')
                      AND visible_at <= NOW()
                    ORDER BY id
                    LIMIT $2
                    FOR UPDATE SKIP LOCKED
             )
            RETURNING message_id, topic, payload, attempts
            "#,
        )
        .bind(topic)
        .bind(limit as i64)
        .bind(self.lease.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let attempts: i32 = row.try_get("attempts")?;
            out.push(Message {
                id: row.try_get("message_id")?,
                topic: row.try_get("topic")?,
                payload: row.try_get("payload")?,
                attempt: u32::try_from(attempts).unwrap_or(u32::MAX),
            });
        }
        Ok(out)
    }

    async fn settle(&self, message: &Message, outcome: Result<(), HandlerError>) -> Result<(), QueueError> {
        match self.policy.settle(message.attempt, &outcome) {
            Settlement::Ack => {
                sqlx::query("DELETE FROM queue_messages WHERE message_id = $1")
                    .bind(&message.id)
                    .execute(&self.pool)
                    .await?;
                debug!(message_id = %message.id, topic = %message.topic, "message acknowledged");
            }
            Settlement::Retry { delay, error } => {
                sqlx::query(
                    r#"
                    UPDATE queue_messages
                       SET status = 'ready',
                           visible_at = NOW() + make_interval(secs => $2),
                           last_error = $3
                     WHERE message_id = $1
                    "#,
                )
                .bind(&message.id)
                .bind(delay.as_secs_f64())
                .bind(&error)
                .execute(&self.pool)
                .await?;
                warn!(
                    message_id = %message.id,
                    topic = %message.topic,
                    attempt = message.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "message will be redelivered"
                );
            }
            Settlement::DeadLetter { error: reason } => {
                sqlx::query(
                    r#"
                    UPDATE queue_messages
                       SET status = 'dead',
                           last_error = $2
                     WHERE message_id = $1
                    "#,
                )
                .bind(&message.id)
                .bind(&reason)
                .execute(&self.pool)
                .await?;
                error!(
                    message_id = %message.id,
                    topic = %message.topic,
                    attempt = message.attempt,
                    error = %reason,
                    "message dead-lettered"
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventPublisher for PgQueue {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<String, QueueError> {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO queue_messages (message_id, topic, payload) VALUES ($1, $2, $3)")
            .bind(&id)
            .bind(topic)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(id)
    }
}

#[async_trait]
impl EventSubscriber for PgQueue {
    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
        cancel: CancelToken,
    ) -> Result<(), QueueError> {
        info!(topic, max_concurrency = self.max_concurrency, "subscribing");
        let permits = Arc::new(Semaphore::new(self.max_concurrency));
        let mut in_flight = JoinSet::new();

        while !cancel.is_cancelled() {
            reap_finished(&mut in_flight);
            let available = permits.available_permits();
            let claimed = if available > 0 {
                match self.claim(topic, available).await {
                    Ok(claimed) => claimed,
                    Err(err) => {
                        warn!(topic, error = %err, "claiming messages failed");
                        Vec::new()
                    }
                }
            } else {
                Vec::new()
            };
            let idle = claimed.is_empty();

            for message in claimed {
                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                    return Err(QueueError::Closed);
                };
                let queue = self.clone();
                let handler = Arc::clone(&handler);
                in_flight.spawn(async move {
                    let outcome = handler.handle(&message).await;
                    if let Err(err) = queue.settle(&message, outcome).await {
                        // The lease expires and the message is redelivered.
                        error!(message_id = %message.id, error = %err, "settling message failed");
                    }
                    drop(permit);
                });
            }

            if idle || permits.available_permits() == 0 {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
                }
            }
        }

        while in_flight.join_next().await.is_some() {}
        info!(topic, "subscription stopped");
        Ok(())
    }
}
