//! Kind-keyed dispatch over envelopes.
//!
//! Handlers are registered per payload type; the router reads `kind` off the
//! envelope and hands the decoded payload to the matching handler. A single
//! handler may be registered for several kinds.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error};

use crate::envelope::{Envelope, EnvelopeError, Event};
use crate::queue::{HandlerError, Message, MessageHandler};

#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync {
    async fn handle(&self, event: E) -> Result<(), HandlerError>;
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error("no handler registered for kind {kind}")]
    UnknownKind { kind: String },
    #[error(transparent)]
    Handler(#[from] HandlerError),
}

type BoxFuture = Pin<Box<dyn Future<Output = Result<(), RouterError>> + Send>>;
type ErasedHandler = Arc<dyn Fn(Envelope) -> BoxFuture + Send + Sync>;

#[derive(Default, Clone)]
pub struct Router {
    routes: HashMap<&'static str, ErasedHandler>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `E::KIND` to `handler`. A later registration for the same kind
    /// replaces the earlier one.
    pub fn register<E, H>(&mut self, handler: Arc<H>) -> &mut Self
    where
        E: Event,
        H: EventHandler<E> + 'static,
    {
        let erased: ErasedHandler = Arc::new(move |envelope: Envelope| -> BoxFuture {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let event = envelope.into_event::<E>()?;
                handler.handle(event).await?;
                Ok(())
            })
        });
        self.routes.insert(E::KIND, erased);
        self
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.routes.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }

    pub async fn dispatch(&self, payload: &[u8]) -> Result<(), RouterError> {
        let envelope = Envelope::decode(payload)?;
        let Some(handler) = self.routes.get(envelope.kind.as_str()) else {
            return Err(RouterError::UnknownKind {
                kind: envelope.kind,
            });
        };
        debug!(kind = %envelope.kind, api_version = %envelope.api_version, "dispatching envelope");
        handler(envelope).await
    }
}

#[async_trait]
impl MessageHandler for Router {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        match self.dispatch(&message.payload).await {
            Ok(()) => Ok(()),
            Err(RouterError::Handler(err)) => Err(err),
            Err(err) => {
                error!(
                    message_id = %message.id,
                    topic = %message.topic,
                    error = %err,
                    "undeliverable envelope"
                );
                Err(HandlerError::permanent(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::encode;
    use crate::events::{RefreshSearchCommand, SearchConfigurationChangedEvent};
    use crate::queue::Disposition;
    use chrono::Utc;
    use featwatch_core::Frequency;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventHandler<RefreshSearchCommand> for Recorder {
        async fn handle(&self, event: RefreshSearchCommand) -> Result<(), HandlerError> {
            self.seen.lock().await.push(format!("refresh:{}", event.search_id));
            Ok(())
        }
    }

    #[async_trait]
    impl EventHandler<SearchConfigurationChangedEvent> for Recorder {
        async fn handle(&self, event: SearchConfigurationChangedEvent) -> Result<(), HandlerError> {
            if event.query.is_empty() {
                return Err(HandlerError::transient("empty query"));
            }
            self.seen.lock().await.push(format!("edit:{}", event.search_id));
            Ok(())
        }
    }

    fn router(recorder: &Arc<Recorder>) -> Router {
        let mut router = Router::new();
        router
            .register::<RefreshSearchCommand, _>(Arc::clone(recorder))
            .register::<SearchConfigurationChangedEvent, _>(Arc::clone(recorder));
        router
    }

    fn edit(query: &str) -> SearchConfigurationChangedEvent {
        SearchConfigurationChangedEvent {
            search_id: "s2".into(),
            query: query.into(),
            user_id: "u".into(),
            timestamp: Utc::now(),
            is_creation: false,
            frequency: Frequency::Immediate,
        }
    }

    #[tokio::test]
    async fn one_handler_serves_two_kinds() {
        let recorder = Arc::new(Recorder::default());
        let router = router(&recorder);
        assert_eq!(
            router.kinds(),
            vec!["RefreshSearchCommand", "SearchConfigurationChangedEvent"]
        );

        let refresh = RefreshSearchCommand {
            search_id: "s1".into(),
            query: "q".into(),
            frequency: Frequency::Weekly,
            timestamp: Utc::now(),
        };
        router.dispatch(&encode(&refresh).unwrap()).await.unwrap();
        router.dispatch(&encode(&edit("q")).unwrap()).await.unwrap();
        assert_eq!(*recorder.seen.lock().await, vec!["refresh:s1", "edit:s2"]);
    }

    #[tokio::test]
    async fn unknown_kind_is_a_hard_error() {
        let router = router(&Arc::new(Recorder::default()));
        let payload = br#"{"apiVersion":"v1","kind":"WebhookJobEvent","data":{}}"#;
        let err = router.dispatch(payload).await.unwrap_err();
        assert!(matches!(err, RouterError::UnknownKind { ref kind } if kind == "WebhookJobEvent"));

        let message = Message {
            id: "m1".into(),
            topic: "email-jobs".into(),
            payload: payload.to_vec(),
            attempt: 1,
        };
        let err = MessageHandler::handle(&router, &message).await.unwrap_err();
        assert_eq!(err.disposition, Disposition::Permanent);
    }

    #[tokio::test]
    async fn handler_disposition_passes_through() {
        let router = router(&Arc::new(Recorder::default()));
        let message = Message {
            id: "m2".into(),
            topic: "refresh-searches".into(),
            payload: encode(&edit("")).unwrap(),
            attempt: 1,
        };
        let err = MessageHandler::handle(&router, &message).await.unwrap_err();
        assert!(err.is_transient());
    }
}
