//! Email delivery: render a job, send it, and keep channel health current.

use std::sync::Arc;

use askama::Template;
use async_trait::async_trait;
use chrono::Utc;
use featwatch_adapters::{EmailSender, SendError};
use featwatch_core::{Change, Frequency, SubscriptionTrigger};
use featwatch_events::{EmailJobEvent, EventHandler, HandlerError};
use featwatch_storage::{ChannelFailure, ChannelHealth};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::form_urlencoded;

use crate::summary::{
    visit_event_summary, BaselineStatus, BrowserStatus, BrowserValue, EventSummaryV1, Highlight,
    HighlightType, SummaryError, SummaryVisitor,
};

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("summary cannot be rendered: {0}")]
    Summary(#[from] SummaryError),
    #[error("template failed: {0}")]
    Template(#[from] askama::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub html_body: String,
}

struct HighlightView {
    label: &'static str,
    feature_name: String,
    feature_url: String,
    details: Vec<String>,
}

#[derive(Template)]
#[template(path = "email_subject.txt")]
struct SubjectTemplate<'a> {
    headline: &'a str,
    query: &'a str,
}

#[derive(Template)]
#[template(path = "email_body.html")]
struct BodyTemplate<'a> {
    headline: &'a str,
    text: &'a str,
    query: &'a str,
    cadence: &'static str,
    search_url: &'a str,
    results_url: &'a str,
    triggers: Vec<&'static str>,
    highlights: Vec<HighlightView>,
    truncated: bool,
}

fn cadence_label(frequency: Frequency) -> &'static str {
    match frequency {
        Frequency::Immediate | Frequency::Unknown => "immediate",
        Frequency::Daily => "daily digest",
        Frequency::Weekly => "weekly digest",
        Frequency::Monthly => "monthly digest",
    }
}

fn trigger_label(trigger: SubscriptionTrigger) -> Option<&'static str> {
    match trigger {
        SubscriptionTrigger::FeaturePromotedToNewly => Some("features becoming Baseline newly available"),
        SubscriptionTrigger::FeaturePromotedToWidely => Some("features becoming Baseline widely available"),
        SubscriptionTrigger::FeatureRegressedToLimited => Some("features regressing to limited availability"),
        SubscriptionTrigger::BrowserImplementationAnywhereComplete => {
            Some("browser implementations landing")
        }
        SubscriptionTrigger::Unknown => None,
    }
}

fn baseline_label(status: BaselineStatus) -> &'static str {
    match status {
        BaselineStatus::Limited => "limited",
        BaselineStatus::Newly => "newly available",
        BaselineStatus::Widely => "widely available",
        BaselineStatus::Unknown => "unknown",
    }
}

fn browser_label(value: &BrowserValue) -> String {
    let status = match value.status {
        BrowserStatus::Available => "available",
        BrowserStatus::Unavailable => "unavailable",
        BrowserStatus::Unknown => "unknown",
    };
    match &value.version {
        Some(version) => format!("{status} ({version})"),
        None => status.to_string(),
    }
}

/// Builds links against the public frontend.
#[derive(Debug, Clone)]
pub struct EmailRenderer {
    frontend_base_url: String,
}

impl EmailRenderer {
    pub fn new(frontend_base_url: &str) -> Self {
        Self {
            frontend_base_url: frontend_base_url.trim_end_matches('/').to_string(),
        }
    }

    fn feature_url(&self, id: &str) -> String {
        format!("{}/features/{}", self.frontend_base_url, encode(id))
    }

    pub fn render(&self, job: &EmailJobEvent) -> Result<RenderedEmail, RenderError> {
        let mut visitor = V1Email { renderer: self, job };
        visit_event_summary(&job.summary_raw, &mut visitor)?
    }

    fn highlight_view(&self, highlight: &Highlight) -> HighlightView {
        let mut details = Vec::new();
        if let Some(Change { from, to }) = &highlight.name_change {
            details.push(format!("Renamed from {from} to {to}"));
        }
        if let Some(change) = &highlight.baseline_change {
            details.push(format!(
                "Baseline: {} to {}",
                baseline_label(change.from.status),
                baseline_label(change.to.status)
            ));
        }
        for (browser, change) in &highlight.browser_changes {
            details.push(format!(
                "{}: {} to {}",
                browser.display_name(),
                browser_label(&change.from),
                browser_label(&change.to)
            ));
        }
        if let Some(from) = &highlight.moved_from {
            details.push(format!("Previously {} ({})", from.name, from.id));
        }
        if !highlight.split_into.is_empty() {
            let parts: Vec<_> = highlight.split_into.iter().map(|p| p.name.as_str()).collect();
            details.push(format!("Split into {}", parts.join(", ")));
        }

        HighlightView {
            label: match highlight.kind {
                HighlightType::Changed => "Changed",
                HighlightType::Added => "Added",
                HighlightType::Removed => "Removed",
                HighlightType::Moved => "Moved",
                HighlightType::Split => "Split",
            },
            feature_name: highlight.feature_name.clone(),
            feature_url: self.feature_url(&highlight.feature_id),
            details,
        }
    }
}

fn encode(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

struct V1Email<'a> {
    renderer: &'a EmailRenderer,
    job: &'a EmailJobEvent,
}

impl SummaryVisitor for V1Email<'_> {
    type Output = Result<RenderedEmail, RenderError>;

    fn visit_v1(&mut self, summary: EventSummaryV1) -> Self::Output {
        let base = &self.renderer.frontend_base_url;
        let metadata = &self.job.metadata;
        let search_url = format!("{base}/saved-searches/{}", encode(&metadata.search_id));
        let results_url = format!("{base}/features?q={}", encode(&metadata.query));
        let headline = "Saved search update";

        let subject = SubjectTemplate {
            headline,
            query: &metadata.query,
        }
        .render()?;
        let html_body = BodyTemplate {
            headline,
            text: &summary.text,
            query: &metadata.query,
            cadence: cadence_label(metadata.frequency),
            search_url: &search_url,
            results_url: &results_url,
            triggers: self.job.triggers.iter().filter_map(|t| trigger_label(*t)).collect(),
            highlights: summary
                .highlights
                .iter()
                .map(|h| self.renderer.highlight_view(h))
                .collect(),
            truncated: summary.truncated,
        }
        .render()?;

        Ok(RenderedEmail {
            subject: subject.trim().to_string(),
            html_body,
        })
    }
}

pub struct EmailDelivery {
    renderer: EmailRenderer,
    sender: Arc<dyn EmailSender>,
    health: Arc<dyn ChannelHealth>,
    failure_threshold: u32,
}

impl EmailDelivery {
    pub fn new(
        renderer: EmailRenderer,
        sender: Arc<dyn EmailSender>,
        health: Arc<dyn ChannelHealth>,
        failure_threshold: u32,
    ) -> Self {
        Self {
            renderer,
            sender,
            health,
            failure_threshold,
        }
    }

    /// Render, send and record the outcome against the channel. Only
    /// transient send failures come back as retryable.
    pub async fn process_message(&self, job: &EmailJobEvent) -> Result<(), HandlerError> {
        let email = match self.renderer.render(job) {
            Ok(email) => email,
            Err(err) => {
                error!(channel_id = %job.channel_id, event_id = %job.metadata.event_id, error = %err, "rendering email failed");
                self.record_failure(job, &err.to_string(), false).await;
                return Err(HandlerError::permanent(err));
            }
        };

        let id = job.idempotency_key();
        match self
            .sender
            .send(&id, &job.recipient_email, &email.subject, &email.html_body)
            .await
        {
            Ok(()) => {
                info!(notification_id = %id, channel_id = %job.channel_id, "email sent");
                self.record_success(job).await;
                Ok(())
            }
            Err(SendError::Duplicate) => {
                debug!(notification_id = %id, "provider already processed this email");
                self.record_success(job).await;
                Ok(())
            }
            Err(err @ SendError::PermanentUser(_)) => {
                warn!(notification_id = %id, channel_id = %job.channel_id, error = %err, "recipient rejected email");
                self.record_failure(job, &err.to_string(), true).await;
                Err(HandlerError::permanent(err))
            }
            Err(err @ (SendError::PermanentSystem(_) | SendError::Config(_))) => {
                error!(notification_id = %id, channel_id = %job.channel_id, error = %err, "email provider refused request");
                self.record_failure(job, &err.to_string(), false).await;
                Err(HandlerError::permanent(err))
            }
            Err(err @ SendError::Transient(_)) => {
                warn!(notification_id = %id, channel_id = %job.channel_id, error = %err, "email send will be retried");
                self.record_failure(job, &err.to_string(), false).await;
                Err(HandlerError::transient(err))
            }
        }
    }

    async fn record_success(&self, job: &EmailJobEvent) {
        if let Err(err) = self.health.record_channel_success(&job.channel_id, Utc::now()).await {
            warn!(channel_id = %job.channel_id, error = %err, "recording channel success failed");
        }
    }

    async fn record_failure(&self, job: &EmailJobEvent, message: &str, permanent_user: bool) {
        let failure = ChannelFailure {
            channel_id: job.channel_id.clone(),
            at: Utc::now(),
            message: message.to_string(),
            permanent_user,
            disable_threshold: self.failure_threshold,
        };
        if let Err(err) = self.health.record_channel_failure(failure).await {
            warn!(channel_id = %job.channel_id, error = %err, "recording channel failure failed");
        }
    }
}

#[async_trait]
impl EventHandler<EmailJobEvent> for EmailDelivery {
    async fn handle(&self, event: EmailJobEvent) -> Result<(), HandlerError> {
        self.process_message(&event).await
    }
}
