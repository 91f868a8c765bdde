//! Axum ingress for the notification pipeline: manual cadence triggers,
//! saved-search edit notifications and event history.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use featwatch_core::{Frequency, NotificationEvent, Reason, SnapshotType};
use featwatch_events::{publish_event, EventPublisher, QueueError, SearchConfigurationChangedEvent, Topics};
use featwatch_pipeline::{
    parse_event_summary, trigger_batch, EventSummaryV1, SummaryCategories, SummaryVisitor,
};
use featwatch_storage::{EventLog, SavedSearchCatalog, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "featwatch-web";

pub const USER_HEADER: &str = "x-user-id";
pub const DEFAULT_HISTORY_LIMIT: u32 = 20;
pub const MAX_HISTORY_LIMIT: u32 = 100;

#[derive(Clone)]
pub struct AppState {
    pub events: Arc<dyn EventLog>,
    pub catalog: Arc<dyn SavedSearchCatalog>,
    pub publisher: Arc<dyn EventPublisher>,
    pub topics: Topics,
}

impl AppState {
    pub fn new(
        events: Arc<dyn EventLog>,
        catalog: Arc<dyn SavedSearchCatalog>,
        publisher: Arc<dyn EventPublisher>,
        topics: Topics,
    ) -> Self {
        Self {
            events,
            catalog,
            publisher,
            topics,
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("missing x-user-id header")]
    Unauthorized,
    #[error("saved search {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Store(_) | Self::Queue(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/v1/triggers/{frequency}", post(trigger_handler))
        .route("/v1/saved-searches/{id}/refresh", post(refresh_handler))
        .route("/v1/saved-searches/{id}/events", get(history_handler))
        .with_state(Arc::new(state))
}

/// Bind `0.0.0.0:port` and serve until `shutdown` resolves.
pub async fn serve<F>(state: AppState, port: u16, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "http ingress listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "crate": CRATE_NAME }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Accepted {
    pub message_id: String,
}

async fn trigger_handler(
    State(state): State<Arc<AppState>>,
    Path(frequency): Path<String>,
) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    let frequency = parse_frequency(&frequency)?;
    let message_id =
        trigger_batch(state.publisher.as_ref(), &state.topics.batch_triggers, frequency).await?;
    Ok((StatusCode::ACCEPTED, Json(Accepted { message_id })))
}

#[derive(Debug, Default, Deserialize)]
struct RefreshParams {
    frequency: Option<String>,
    #[serde(default)]
    created: bool,
}

async fn refresh_handler(
    State(state): State<Arc<AppState>>,
    Path(search_id): Path<String>,
    Query(params): Query<RefreshParams>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    let user_id = headers
        .get(USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(ApiError::Unauthorized)?
        .to_string();
    let frequency = match params.frequency.as_deref() {
        Some(raw) => parse_frequency(raw)?,
        None => Frequency::Immediate,
    };
    let search = state
        .catalog
        .get_saved_search(&search_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(search_id.clone()))?;

    let event = SearchConfigurationChangedEvent {
        search_id: search.id,
        query: search.query,
        user_id,
        timestamp: Utc::now(),
        is_creation: params.created,
        frequency,
    };
    let message_id =
        publish_event(state.publisher.as_ref(), &state.topics.refresh_searches, &event).await?;
    info!(search_id = %event.search_id, user_id = %event.user_id, %message_id, "search change published");
    Ok((StatusCode::ACCEPTED, Json(Accepted { message_id })))
}

#[derive(Debug, Default, Deserialize)]
struct HistoryParams {
    limit: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EventView {
    pub event_id: String,
    pub snapshot_type: SnapshotType,
    pub timestamp: DateTime<Utc>,
    pub reasons: Vec<Reason>,
    pub summary: SummaryView,
}

/// A stored summary as it was authored, or the reason it could not be read.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SummaryView {
    Parsed {
        schema_version: String,
        text: String,
        categories: SummaryCategories,
        truncated: bool,
        highlights: usize,
    },
    Unreadable {
        error: String,
    },
}

struct HistoryVisitor;

impl SummaryVisitor for HistoryVisitor {
    type Output = SummaryView;

    fn visit_v1(&mut self, summary: EventSummaryV1) -> SummaryView {
        SummaryView::Parsed {
            schema_version: summary.schema_version,
            text: summary.text,
            categories: summary.categories,
            truncated: summary.truncated,
            highlights: summary.highlights.len(),
        }
    }
}

fn event_view(event: NotificationEvent) -> EventView {
    let summary = match parse_event_summary(&event.summary_bytes()) {
        Ok(parsed) => parsed.accept(&mut HistoryVisitor),
        Err(err) => SummaryView::Unreadable {
            error: err.to_string(),
        },
    };
    EventView {
        event_id: event.event_id,
        snapshot_type: event.snapshot_type,
        timestamp: event.timestamp,
        reasons: event.reasons,
        summary,
    }
}

async fn history_handler(
    State(state): State<Arc<AppState>>,
    Path(search_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<EventView>>, ApiError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    if state.catalog.get_saved_search(&search_id).await?.is_none() {
        return Err(ApiError::NotFound(search_id));
    }
    let events = state.events.list_events(&search_id, limit).await?;
    Ok(Json(events.into_iter().map(event_view).collect()))
}

fn parse_frequency(raw: &str) -> Result<Frequency, ApiError> {
    match raw.parse::<Frequency>() {
        Ok(Frequency::Unknown) | Err(_) => {
            Err(ApiError::BadRequest(format!("unknown frequency {raw:?}")))
        }
        Ok(frequency) => Ok(frequency),
    }
}
