use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use featwatch_core::{
    ChannelState, Frequency, LatestEvent, NotificationEvent, Reason, SavedSearchRef, SnapshotType,
    SubscriptionDestination,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::debug;

use crate::seed::SeedData;
use crate::store::{
    ChannelFailure, ChannelHealth, EventLog, PublishEventRequest, SavedSearchCatalog,
    SnapshotLocks, StoreError, SubscriberDirectory,
};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert generated rows, skipping ids that already exist.
    pub async fn apply_seed(&self, data: &SeedData) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for search in &data.saved_searches {
            sqlx::query(
                r#"
                INSERT INTO saved_searches (id, name, query, scope, author_id, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(&search.id)
            .bind(&search.name)
            .bind(&search.query)
            .bind(search.scope.as_str())
            .bind(&search.author_id)
            .bind(search.created_at)
            .bind(search.updated_at)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO saved_search_user_roles (saved_search_id, user_id, user_role)
                VALUES ($1, $2, 'OWNER')
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(&search.id)
            .bind(&search.author_id)
            .execute(&mut *tx)
            .await?;
        }
        for channel in &data.channels {
            sqlx::query(
                r#"
                INSERT INTO notification_channels (id, user_id, name, type, config)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(&channel.id)
            .bind(&channel.user_id)
            .bind(&channel.name)
            .bind(&channel.channel_type)
            .bind(channel.config.clone().map(Json))
            .execute(&mut *tx)
            .await?;
        }
        for sub in &data.subscriptions {
            sqlx::query(
                r#"
                INSERT INTO saved_search_subscriptions
                    (id, user_id, channel_id, saved_search_id, triggers, frequency)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(&sub.id)
            .bind(&sub.user_id)
            .bind(&sub.channel_id)
            .bind(&sub.saved_search_id)
            .bind(&sub.triggers)
            .bind(sub.frequency.as_str())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

fn snapshot_type_from_row(row: &PgRow) -> Result<SnapshotType, StoreError> {
    let raw: String = row.try_get("snapshot_type")?;
    SnapshotType::parse(&raw)
        .ok_or_else(|| StoreError::Decode(format!("unknown snapshot type {raw:?}")))
}

fn event_from_row(row: &PgRow) -> Result<NotificationEvent, StoreError> {
    let raw_reasons: Vec<String> = row.try_get("reasons")?;
    // Reasons written by newer code are dropped rather than failing the read.
    let reasons = raw_reasons
        .iter()
        .filter_map(|r| Reason::from_storage(r))
        .collect();
    let Json(summary): Json<serde_json::Value> = row.try_get("summary")?;
    let frequency: String = row.try_get("frequency")?;
    Ok(NotificationEvent {
        event_id: row.try_get("event_id")?,
        search_id: row.try_get("saved_search_id")?,
        snapshot_type: snapshot_type_from_row(row)?,
        query: row.try_get("query")?,
        frequency: frequency.parse().unwrap_or(Frequency::Unknown),
        timestamp: row.try_get("timestamp")?,
        reasons,
        state_blob_path: row.try_get("blob_path")?,
        diff_blob_path: row.try_get("diff_blob_path")?,
        summary,
    })
}

const EVENT_COLUMNS: &str = "event_id, saved_search_id, snapshot_type, query, frequency, \
                             timestamp, reasons, blob_path, diff_blob_path, summary";

#[async_trait]
impl SnapshotLocks for PgStore {
    async fn acquire_lock(
        &self,
        search_id: &str,
        snapshot_type: SnapshotType,
        worker_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let exists: Option<String> =
            sqlx::query_scalar("SELECT id FROM saved_searches WHERE id = $1")
                .bind(search_id)
                .fetch_optional(&self.pool)
                .await?;
        if exists.is_none() {
            return Err(StoreError::UnknownSearch(search_id.to_string()));
        }

        // Insert-or-steal in one statement; the WHERE on the conflict arm
        // keeps an unexpired lock in place and yields no row.
        let acquired: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO saved_search_state
                (saved_search_id, snapshot_type, worker_lock_id, worker_lock_expires_at)
            VALUES ($1, $2, $3, NOW() + make_interval(secs => $4))
            ON CONFLICT (saved_search_id, snapshot_type) DO UPDATE
               SET worker_lock_id = EXCLUDED.worker_lock_id,
                   worker_lock_expires_at = EXCLUDED.worker_lock_expires_at
             WHERE saved_search_state.worker_lock_id IS NULL
                OR saved_search_state.worker_lock_expires_at IS NULL
                OR saved_search_state.worker_lock_expires_at <= NOW()
            RETURNING worker_lock_id
            "#,
        )
        .bind(search_id)
        .bind(snapshot_type.as_str())
        .bind(worker_id)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        let acquired = acquired.as_deref() == Some(worker_id);
        debug!(search_id, snapshot_type = %snapshot_type, worker_id, acquired, "lock acquisition");
        Ok(acquired)
    }

    async fn release_lock(
        &self,
        search_id: &str,
        snapshot_type: SnapshotType,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE saved_search_state
               SET worker_lock_id = NULL,
                   worker_lock_expires_at = NULL
             WHERE saved_search_id = $1
               AND snapshot_type = $2
            "#,
        )
        .bind(search_id)
        .bind(snapshot_type.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl EventLog for PgStore {
    async fn get_latest_event(
        &self,
        snapshot_type: SnapshotType,
        search_id: &str,
    ) -> Result<Option<LatestEvent>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT event_id, blob_path
              FROM notification_events
             WHERE saved_search_id = $1
               AND snapshot_type = $2
             ORDER BY timestamp DESC, event_id DESC
             LIMIT 1
            "#,
        )
        .bind(search_id)
        .bind(snapshot_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<LatestEvent, StoreError> {
            Ok(LatestEvent {
                event_id: row.try_get("event_id")?,
                state_blob_path: row.try_get("blob_path")?,
            })
        })
        .transpose()
    }

    async fn publish_event(
        &self,
        request: PublishEventRequest,
    ) -> Result<NotificationEvent, StoreError> {
        let mut tx = self.pool.begin().await?;

        let insert = sqlx::query(&format!(
            r#"
            INSERT INTO notification_events
                (event_id, saved_search_id, snapshot_type, query, frequency,
                 reasons, blob_path, diff_blob_path, summary)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(&request.event_id)
        .bind(&request.search_id)
        .bind(request.snapshot_type.as_str())
        .bind(&request.query)
        .bind(request.frequency.as_str())
        .bind(request.storage_reasons())
        .bind(&request.state_blob_path)
        .bind(&request.diff_blob_path)
        .bind(Json(request.wrapped_summary()))
        .fetch_one(&mut *tx)
        .await;

        let row = match insert {
            Ok(row) => row,
            Err(sqlx::Error::Database(db)) if db.is_foreign_key_violation() => {
                return Err(StoreError::UnknownSearch(request.search_id));
            }
            Err(err) => return Err(err.into()),
        };

        sqlx::query(
            r#"
            INSERT INTO saved_search_state (saved_search_id, snapshot_type, last_known_state_blob_path)
            VALUES ($1, $2, $3)
            ON CONFLICT (saved_search_id, snapshot_type) DO UPDATE
               SET last_known_state_blob_path = EXCLUDED.last_known_state_blob_path
            "#,
        )
        .bind(&request.search_id)
        .bind(request.snapshot_type.as_str())
        .bind(&request.state_blob_path)
        .execute(&mut *tx)
        .await?;

        let event = event_from_row(&row)?;
        tx.commit().await?;
        Ok(event)
    }

    async fn pending_fanout(
        &self,
        search_id: &str,
        snapshot_type: SnapshotType,
    ) -> Result<Vec<NotificationEvent>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
              FROM notification_events
             WHERE saved_search_id = $1
               AND snapshot_type = $2
               AND fanned_out_at IS NULL
             ORDER BY timestamp ASC
            "#
        ))
        .bind(search_id)
        .bind(snapshot_type.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn mark_fanned_out(&self, event_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE notification_events
               SET fanned_out_at = NOW()
             WHERE event_id = $1
               AND fanned_out_at IS NULL
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_events(
        &self,
        search_id: &str,
        limit: u32,
    ) -> Result<Vec<NotificationEvent>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
              FROM notification_events
             WHERE saved_search_id = $1
             ORDER BY timestamp DESC, event_id DESC
             LIMIT $2
            "#
        ))
        .bind(search_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }
}

#[async_trait]
impl SavedSearchCatalog for PgStore {
    async fn list_all_saved_searches(&self) -> Result<Vec<SavedSearchRef>, StoreError> {
        let rows = sqlx::query("SELECT id, query FROM saved_searches ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(SavedSearchRef {
                id: row.try_get("id")?,
                query: row.try_get("query")?,
            });
        }
        Ok(out)
    }

    async fn get_saved_search(&self, search_id: &str) -> Result<Option<SavedSearchRef>, StoreError> {
        let row = sqlx::query("SELECT id, query FROM saved_searches WHERE id = $1")
            .bind(search_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| -> Result<SavedSearchRef, StoreError> {
            Ok(SavedSearchRef {
                id: row.try_get("id")?,
                query: row.try_get("query")?,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl SubscriberDirectory for PgStore {
    async fn find_subscription_destinations(
        &self,
        search_id: &str,
        frequency: Frequency,
    ) -> Result<Vec<SubscriptionDestination>, StoreError> {
        let frequencies: Vec<String> = frequency
            .sharing_snapshot()
            .into_iter()
            .map(|f| f.as_str().to_string())
            .collect();
        let rows = sqlx::query(
            r#"
            SELECT s.id AS subscription_id,
                   s.user_id,
                   s.triggers,
                   c.id AS channel_id,
                   c.type AS channel_type,
                   c.config AS channel_config
              FROM saved_search_subscriptions s
              JOIN notification_channels c ON c.id = s.channel_id
              LEFT JOIN notification_channel_state cs ON cs.channel_id = c.id
             WHERE s.saved_search_id = $1
               AND s.frequency = ANY($2)
               AND COALESCE(cs.is_disabled_by_system, FALSE) = FALSE
             ORDER BY s.id
            "#,
        )
        .bind(search_id)
        .bind(&frequencies)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let config: Option<Json<serde_json::Value>> = row.try_get("channel_config")?;
            out.push(SubscriptionDestination {
                subscription_id: row.try_get("subscription_id")?,
                user_id: row.try_get("user_id")?,
                channel_id: row.try_get("channel_id")?,
                channel_type: row.try_get("channel_type")?,
                channel_config: config.map(|Json(v)| v),
                triggers: row.try_get("triggers")?,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl ChannelHealth for PgStore {
    async fn record_channel_success(
        &self,
        channel_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO notification_channel_state (channel_id, last_success_at, consecutive_failures)
            VALUES ($1, $2, 0)
            ON CONFLICT (channel_id) DO UPDATE
               SET last_success_at = EXCLUDED.last_success_at,
                   consecutive_failures = 0,
                   updated_at = NOW()
            "#,
        )
        .bind(channel_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_channel_failure(&self, failure: ChannelFailure) -> Result<(), StoreError> {
        let increment: i32 = if failure.permanent_user { 1 } else { 0 };
        let threshold = i32::try_from(failure.disable_threshold.max(1)).unwrap_or(i32::MAX);
        sqlx::query(
            r#"
            INSERT INTO notification_channel_state
                (channel_id, last_failure_at, last_failure_message, consecutive_failures, is_disabled_by_system)
            VALUES ($1, $2, $3, $4, $4 >= $5)
            ON CONFLICT (channel_id) DO UPDATE
               SET last_failure_at = EXCLUDED.last_failure_at,
                   last_failure_message = EXCLUDED.last_failure_message,
                   consecutive_failures = notification_channel_state.consecutive_failures + $4,
                   is_disabled_by_system = notification_channel_state.is_disabled_by_system
                       OR ($4 > 0 AND notification_channel_state.consecutive_failures + $4 >= $5),
                   updated_at = NOW()
            "#,
        )
        .bind(&failure.channel_id)
        .bind(failure.at)
        .bind(&failure.message)
        .bind(increment)
        .bind(threshold)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn channel_state(&self, channel_id: &str) -> Result<Option<ChannelState>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT channel_id, is_disabled_by_system, consecutive_failures,
                   last_success_at, last_failure_at, last_failure_message
              FROM notification_channel_state
             WHERE channel_id = $1
            "#,
        )
        .bind(channel_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<ChannelState, StoreError> {
            let failures: i32 = row.try_get("consecutive_failures")?;
            Ok(ChannelState {
                channel_id: row.try_get("channel_id")?,
                is_disabled_by_system: row.try_get("is_disabled_by_system")?,
                consecutive_failures: u32::try_from(failures).unwrap_or(0),
                last_success_at: row.try_get("last_success_at")?,
                last_failure_at: row.try_get("last_failure_at")?,
                last_failure_message: row.try_get("last_failure_message")?,
            })
        })
        .transpose()
    }
}
