//! In-process queue with the same delivery semantics as [`crate::PgQueue`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::cancel::CancelToken;
use crate::queue::{
    reap_finished, EventPublisher, EventSubscriber, HandlerError, Message, MessageHandler,
    QueueError, RetryPolicy, Settlement,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub message: Message,
    pub error: String,
}

#[derive(Debug)]
struct Pending {
    message: Message,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    topics: HashMap<String, VecDeque<Pending>>,
    dead_letters: Vec<DeadLetter>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
    policy: RetryPolicy,
}

impl Shared {
    async fn claim(&self, topic: &str, limit: usize) -> Vec<Message> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let Some(queue) = state.topics.get_mut(topic) else {
            return Vec::new();
        };
        let mut claimed = Vec::new();
        let mut kept = VecDeque::with_capacity(queue.len());
        while let Some(mut pending) = queue.pop_front() {
            if claimed.len() < limit && pending.visible_at <= now {
                pending.message.attempt += 1;
                claimed.push(pending.message);
            } else {
                kept.push_back(pending);
            }
        }
        *queue = kept;
        claimed
    }

    async fn settle(&self, message: Message, outcome: Result<(), HandlerError>) -> Settlement {
        let settlement = self.policy.settle(message.attempt, &outcome);
        match &settlement {
            Settlement::Ack => {
                debug!(message_id = %message.id, topic = %message.topic, "message acknowledged");
            }
            Settlement::Retry { delay, error } => {
                warn!(
                    message_id = %message.id,
                    topic = %message.topic,
                    attempt = message.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "message will be redelivered"
                );
                let mut state = self.state.lock().await;
                state
                    .topics
                    .entry(message.topic.clone())
                    .or_default()
                    .push_back(Pending {
                        message,
                        visible_at: Instant::now() + *delay,
                    });
            }
            Settlement::DeadLetter { error: reason } => {
                error!(
                    message_id = %message.id,
                    topic = %message.topic,
                    attempt = message.attempt,
                    error = %reason,
                    "message dead-lettered"
                );
                let mut state = self.state.lock().await;
                state.dead_letters.push(DeadLetter {
                    message,
                    error: reason.clone(),
                });
            }
        }
        settlement
    }
}

#[derive(Debug, Clone)]
pub struct MemoryQueue {
    shared: Arc<Shared>,
    max_concurrency: usize,
    poll_interval: Duration,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl MemoryQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                policy,
            }),
            max_concurrency: 8,
            poll_interval: Duration::from_millis(50),
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

    /// Messages waiting on `topic`, including ones scheduled for redelivery.
    pub async fn pending(&self, topic: &str) -> Vec<Message> {
        let state = self.shared.state.lock().await;
        state
            .topics
            .get(topic)
            .map(|q| q.iter().map(|p| p.message.clone()).collect())
            .unwrap_or_default()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.shared.state.lock().await.dead_letters.clone()
    }

    /// Deliver every currently visible message on `topic` to `handler`, one
    /// at a time, until none are left. Returns the settlements in order.
    pub async fn drain(&self, topic: &str, handler: &dyn MessageHandler) -> Vec<Settlement> {
        let mut settlements = Vec::new();
        loop {
            let claimed = self.shared.claim(topic, 1).await;
            let Some(message) = claimed.into_iter().next() else {
                break;
            };
            let outcome = handler.handle(&message).await;
            settlements.push(self.shared.settle(message, outcome).await);
        }
        settlements
    }
}

#[async_trait]
impl EventPublisher for MemoryQueue {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<String, QueueError> {
        let id = uuid::Uuid::new_v4().to_string();
        {
            let mut state = self.shared.state.lock().await;
            state
                .topics
                .entry(topic.to_string())
                .or_default()
                .push_back(Pending {
                    message: Message {
                        id: id.clone(),
                        topic: topic.to_string(),
                        payload,
                        attempt: 0,
                    },
                    visible_at: Instant::now(),
                });
        }
        self.shared.notify.notify_waiters();
        Ok(id)
    }
}

#[async_trait]
impl EventSubscriber for MemoryQueue {
    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
        cancel: CancelToken,
    ) -> Result<(), QueueError> {
        let permits = Arc::new(Semaphore::new(self.max_concurrency));
        let mut in_flight = JoinSet::new();

        while !cancel.is_cancelled() {
            reap_finished(&mut in_flight);
            let available = permits.available_permits();
            let claimed = if available > 0 {
                self.shared.claim(topic, available).await
            } else {
                Vec::new()
            };

            for message in claimed {
                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                    return Err(QueueError::Closed);
                };
                let shared = Arc::clone(&self.shared);
                let handler = Arc::clone(&handler);
                in_flight.spawn(async move {
                    let outcome = handler.handle(&message).await;
                    shared.settle(message, outcome).await;
                    drop(permit);
                });
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.shared.notify.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            }
        }

        while in_flight.join_next().await.is_some() {}
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::BackoffPolicy;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FailTimes {
        remaining: AtomicU32,
        transient: bool,
        calls: AtomicU32,
    }

    #[async_trait]
    impl MessageHandler for FailTimes {
        async fn handle(&self, _message: &Message) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.remaining.load(Ordering::SeqCst);
            if left == 0 {
                return Ok(());
            }
            self.remaining.store(left - 1, Ordering::SeqCst);
            if self.transient {
                Err(HandlerError::transient("flaky"))
            } else {
                Err(HandlerError::permanent("broken"))
            }
        }
    }

    fn instant_retries(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            backoff: BackoffPolicy {
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
            },
            max_attempts,
        }
    }

    fn handler(failures: u32, transient: bool) -> FailTimes {
        FailTimes {
            remaining: AtomicU32::new(failures),
            transient,
            calls: AtomicU32::new(0),
        }
    }

    #[tokio::test]
    async fn transient_failures_are_redelivered() {
        let queue = MemoryQueue::new(instant_retries(5));
        queue.publish("t", b"x".to_vec()).await.unwrap();
        let handler = handler(2, true);

        let settlements = queue.drain("t", &handler).await;
        assert_eq!(settlements.len(), 3);
        assert_eq!(settlements.last(), Some(&Settlement::Ack));
        assert!(queue.pending("t").await.is_empty());
        assert!(queue.dead_letters().await.is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter() {
        let queue = MemoryQueue::new(instant_retries(2));
        queue.publish("t", b"x".to_vec()).await.unwrap();
        let handler = handler(10, true);

        queue.drain("t", &handler).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        let dead = queue.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message.attempt, 2);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let queue = MemoryQueue::new(instant_retries(5));
        queue.publish("t", b"x".to_vec()).await.unwrap();
        let handler = handler(1, false);

        queue.drain("t", &handler).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.dead_letters().await[0].error, "broken");
    }

    #[tokio::test]
    async fn delayed_retries_stay_invisible_until_due() {
        let queue = MemoryQueue::new(RetryPolicy {
            backoff: BackoffPolicy {
                base_delay: Duration::from_secs(60),
                max_delay: Duration::from_secs(60),
            },
            max_attempts: 5,
        });
        queue.publish("t", b"x".to_vec()).await.unwrap();
        let handler = handler(1, true);

        let settlements = queue.drain("t", &handler).await;
        assert_eq!(settlements.len(), 1);
        assert_eq!(queue.pending("t").await.len(), 1);
    }

    #[tokio::test]
    async fn subscribe_processes_until_cancelled() {
        let queue = MemoryQueue::new(instant_retries(3)).with_poll_interval(Duration::from_millis(5));
        for _ in 0..5 {
            queue.publish("t", b"x".to_vec()).await.unwrap();
        }
        let handler = Arc::new(handler(0, true));
        let cancel = CancelToken::new();

        let worker = tokio::spawn({
            let queue = queue.clone();
            let handler: Arc<dyn MessageHandler> = handler.clone();
            let cancel = cancel.clone();
            async move { queue.subscribe("t", handler, cancel).await }
        });

        for _ in 0..100 {
            if handler.calls.load(Ordering::SeqCst) == 5 && queue.pending("t").await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        worker.await.unwrap().unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 5);
    }
}
