//! External collaborators of the notification pipeline: the feature backend
//! and channel senders.

pub mod backend;
pub mod email;

pub use backend::{
    fetch_all_features, BackendError, FeatureBackend, FeaturePage, FixtureFeatureBackend,
    HttpFeatureBackend, DEFAULT_PAGE_SIZE,
};
pub use email::{
    classify_outcome, classify_status, DeliveryRules, EmailSender, FailureCause, HttpEmailSender,
    HttpEmailSenderConfig, LogEmailSender, SendError, SendResponse,
};

pub const CRATE_NAME: &str = "featwatch-adapters";
