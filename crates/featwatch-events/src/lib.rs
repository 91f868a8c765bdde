//! Event routing for the notification pipeline: the wire envelope, typed
//! payloads, kind-keyed dispatch, queue ports and transports, and the
//! cancellation primitives workers run under.

pub mod cancel;
pub mod envelope;
pub mod events;
pub mod memory;
pub mod pg;
pub mod queue;
pub mod router;
pub mod run_group;

pub use cancel::CancelToken;
pub use envelope::{decode, encode, Envelope, EnvelopeError, Event, API_VERSION_V1};
pub use events::{
    BatchRefreshTrigger, EmailJobEvent, EmailJobMetadata, FeatureDiffEvent, RefreshSearchCommand,
    SearchConfigurationChangedEvent,
};
pub use memory::{DeadLetter, MemoryQueue};
pub use pg::PgQueue;
pub use queue::{
    publish_event, BackoffPolicy, Disposition, EventPublisher, EventSubscriber, HandlerError,
    Message, MessageHandler, QueueError, RetryPolicy, Settlement, Topics,
};
pub use router::{EventHandler, Router, RouterError};
pub use run_group::{RunGroup, RunGroupError};

pub const CRATE_NAME: &str = "featwatch-events";
