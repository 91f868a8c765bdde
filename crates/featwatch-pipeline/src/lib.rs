//! The saved-search notification pipeline: diffing, summaries, the locked
//! producer cycle, fan-out, dispatch and email delivery.

pub mod app;
pub mod batch;
pub mod config;
pub mod differ;
pub mod dispatcher;
pub mod producer;
pub mod scheduler;
pub mod sender;
pub mod summary;
pub mod worker;

pub use app::Services;
pub use batch::BatchPublisher;
pub use config::PipelineConfig;
pub use differ::{compare_feature, compute_diff, fetch_current, DiffError};
pub use dispatcher::{find_subscribers, Dispatcher, Subscribers};
pub use producer::{EventProducer, ProducerError, RefreshOutcome};
pub use scheduler::{maybe_build_scheduler, trigger_batch};
pub use sender::{EmailDelivery, EmailRenderer, RenderError, RenderedEmail};
pub use summary::{
    generate_json_summary, parse_event_summary, visit_event_summary, EventSummaryV1, Highlight,
    HighlightType, SummaryCategories, SummaryError, SummaryVisitor, VersionedSummary,
    MAX_HIGHLIGHTS, SCHEMA_VERSION_V1,
};
pub use worker::{run_subscriptions, Pipeline};

pub const CRATE_NAME: &str = "featwatch-pipeline";
