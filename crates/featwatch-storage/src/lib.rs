//! Persistence for the notification pipeline: the relational store (saved
//! searches, snapshot locks, the event log, subscriptions and channel
//! health) plus the content-addressed blob store for snapshot and diff bodies.

pub mod blob;
pub mod memory;
pub mod pg;
pub mod seed;
pub mod store;

pub use blob::{BlobError, BlobKind, BlobStore, StoredBlob};
pub use memory::MemoryStore;
pub use pg::PgStore;
pub use seed::{FakeDataGenerator, NewChannel, NewSubscription, SeedData};
pub use store::{
    apply_channel_failure, apply_channel_success, ChannelFailure, ChannelHealth, EventLog,
    PublishEventRequest, SavedSearchCatalog, SnapshotLocks, StoreError, SubscriberDirectory,
};

pub const CRATE_NAME: &str = "featwatch-storage";

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    MIGRATOR.run(pool).await
}
