//! Email channel sender over a third-party notification API.
//!
//! Every failure is classified into exactly one [`SendError`] bucket. When a
//! provider response cannot be placed confidently, it is treated as
//! transient so the job is retried rather than dropped.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// The provider already processed this notification id.
    #[error("duplicate notification")]
    Duplicate,
    #[error("permanent recipient failure: {0}")]
    PermanentUser(String),
    #[error("permanent system failure: {0}")]
    PermanentSystem(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("email sender misconfigured: {0}")]
    Config(String),
}

impl SendError {
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::PermanentUser(_) | Self::PermanentSystem(_) | Self::Config(_)
        )
    }
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    /// `id` doubles as the provider-side idempotency key.
    async fn send(&self, id: &str, to: &str, subject: &str, html_body: &str)
        -> Result<(), SendError>;
}

/// Keyword lists used to classify free-text delivery failure reasons.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRules {
    #[serde(default)]
    pub user_keywords: Vec<String>,
    #[serde(default)]
    pub system_keywords: Vec<String>,
}

impl Default for DeliveryRules {
    fn default() -> Self {
        Self {
            user_keywords: vec!["invalid_mailbox".to_string(), "no such user".to_string()],
            system_keywords: vec!["perm_fail_sender_denied".to_string()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    User,
    System,
    Transient,
}

impl DeliveryRules {
    pub fn from_yaml_str(raw: &str) -> anyhow::Result<Self> {
        let rules: Self = serde_yaml::from_str(raw).context("parsing delivery failure rules")?;
        Ok(rules.normalized())
    }

    /// Load rules from `path`, falling back to the built-in lists when the
    /// file does not exist.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no delivery rules file, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading delivery rules {}", path.display()))?;
        Self::from_yaml_str(&raw)
    }

    fn normalized(mut self) -> Self {
        for list in [&mut self.user_keywords, &mut self.system_keywords] {
            for keyword in list.iter_mut() {
                *keyword = keyword.trim().to_lowercase();
            }
            list.retain(|k| !k.is_empty());
        }
        self
    }

    /// User keywords win over system keywords when both match.
    pub fn classify_reason(&self, reason: &str) -> FailureCause {
        let reason = reason.to_lowercase();
        if self.user_keywords.iter().any(|k| reason.contains(k.as_str())) {
            FailureCause::User
        } else if self.system_keywords.iter().any(|k| reason.contains(k.as_str())) {
            FailureCause::System
        } else {
            FailureCause::Transient
        }
    }
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    notification_id: &'a str,
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html_body: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SendResponse {
    pub outcome: String,
    #[serde(default)]
    pub delivery_failure_reason: Option<String>,
}

pub const OUTCOME_SENT: &str = "SENT";
pub const OUTCOME_PREFERENCE_DROPPED: &str = "PREFERENCE_DROPPED";
pub const OUTCOME_INVALID_REQUEST_DROPPED: &str = "INVALID_REQUEST_DROPPED";
pub const OUTCOME_QUOTA_DROPPED: &str = "QUOTA_DROPPED";
pub const OUTCOME_DELIVERY_FAILURE: &str = "DELIVERY_FAILURE";

fn with_reason(message: &str, reason: &str) -> String {
    if reason.is_empty() {
        message.to_string()
    } else {
        format!("{message}: {reason}")
    }
}

/// Map a 2xx provider response body onto a send result.
pub fn classify_outcome(response: &SendResponse, rules: &DeliveryRules) -> Result<(), SendError> {
    let reason = response
        .delivery_failure_reason
        .clone()
        .unwrap_or_default();
    match response.outcome.as_str() {
        OUTCOME_SENT => Ok(()),
        OUTCOME_PREFERENCE_DROPPED => Err(SendError::PermanentUser(with_reason(
            "recipient preferences dropped the message",
            &reason,
        ))),
        OUTCOME_INVALID_REQUEST_DROPPED => Err(SendError::PermanentSystem(with_reason(
            "provider rejected the request as invalid",
            &reason,
        ))),
        OUTCOME_QUOTA_DROPPED => Err(SendError::Transient("provider quota exhausted".to_string())),
        OUTCOME_DELIVERY_FAILURE => match rules.classify_reason(&reason) {
            FailureCause::User => Err(SendError::PermanentUser(reason)),
            FailureCause::System => Err(SendError::PermanentSystem(reason)),
            FailureCause::Transient => Err(SendError::Transient(format!(
                "delivery failed: {reason}"
            ))),
        },
        other => Err(SendError::Transient(format!("unrecognized outcome {other:?}"))),
    }
}

/// Map a non-2xx provider status onto a send error.
pub fn classify_status(status: StatusCode, body: &str) -> SendError {
    let detail = format!("provider returned {}: {}", status.as_u16(), body.trim());
    match status {
        StatusCode::CONFLICT => SendError::Duplicate,
        StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            SendError::PermanentSystem(detail)
        }
        // 429, 5xx and anything unexpected.
        _ => SendError::Transient(detail),
    }
}

#[derive(Debug, Clone)]
pub struct HttpEmailSenderConfig {
    pub api_url: String,
    pub api_token: String,
    pub from_address: String,
    pub timeout: Duration,
    pub rules: DeliveryRules,
}

#[derive(Debug, Clone)]
pub struct HttpEmailSender {
    client: reqwest::Client,
    endpoint: Url,
    api_token: String,
    from_address: String,
    rules: DeliveryRules,
}

impl HttpEmailSender {
    pub fn new(config: HttpEmailSenderConfig) -> Result<Self, SendError> {
        let mut endpoint = Url::parse(&config.api_url)
            .map_err(|e| SendError::Config(format!("invalid api url {:?}: {e}", config.api_url)))?;
        endpoint
            .path_segments_mut()
            .map_err(|_| SendError::Config(format!("api url {:?} cannot be a base", config.api_url)))?
            .pop_if_empty()
            .extend(["v1", "notifications"]);
        if config.from_address.trim().is_empty() {
            return Err(SendError::Config("from address is empty".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| SendError::Config(e.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            api_token: config.api_token,
            from_address: config.from_address,
            rules: config.rules,
        })
    }
}

#[async_trait]
impl EmailSender for HttpEmailSender {
    async fn send(
        &self,
        id: &str,
        to: &str,
        subject: &str,
        html_body: &str,
    ) -> Result<(), SendError> {
        let request = SendRequest {
            notification_id: id,
            from: &self.from_address,
            to: [to],
            subject,
            html_body,
        };
        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_token)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                warn!(notification_id = id, error = %e, "email provider unreachable");
                SendError::Transient(format!("email provider request failed: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }
        let parsed: SendResponse = response
            .json()
            .await
            .map_err(|e| SendError::Transient(format!("unreadable provider response: {e}")))?;
        classify_outcome(&parsed, &self.rules)
    }
}

/// Logs instead of sending. Used when no provider is configured.
#[derive(Debug, Clone, Default)]
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send(
        &self,
        id: &str,
        to: &str,
        subject: &str,
        html_body: &str,
    ) -> Result<(), SendError> {
        info!(
            notification_id = id,
            to,
            subject,
            body_bytes = html_body.len(),
            "email not sent: no provider configured"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use rstest::rstest;
    use serde_json::json;

    fn sender(server: &MockServer) -> HttpEmailSender {
        HttpEmailSender::new(HttpEmailSenderConfig {
            api_url: server.base_url(),
            api_token: "secret".into(),
            from_address: "alerts@example.com".into(),
            timeout: Duration::from_secs(5),
            rules: DeliveryRules::default(),
        })
        .unwrap()
    }

    fn outcome(outcome: &str, reason: Option<&str>) -> SendResponse {
        SendResponse {
            outcome: outcome.into(),
            delivery_failure_reason: reason.map(str::to_string),
        }
    }

    fn bucket(result: Result<(), SendError>) -> &'static str {
        match result {
            Ok(()) => "ok",
            Err(SendError::Duplicate) => "duplicate",
            Err(SendError::PermanentUser(_)) => "user",
            Err(SendError::PermanentSystem(_)) => "system",
            Err(SendError::Transient(_)) => "transient",
            Err(SendError::Config(_)) => "config",
        }
    }

    #[rstest]
    #[case("SENT", None, "ok")]
    #[case("PREFERENCE_DROPPED", None, "user")]
    #[case("INVALID_REQUEST_DROPPED", None, "system")]
    #[case("QUOTA_DROPPED", None, "transient")]
    #[case("DELIVERY_FAILURE", Some("invalid_mailbox: unknown"), "user")]
    #[case("DELIVERY_FAILURE", Some("550 No Such User here"), "user")]
    #[case("DELIVERY_FAILURE", Some("perm_fail_sender_denied"), "system")]
    #[case("DELIVERY_FAILURE", Some("mailbox full"), "transient")]
    #[case("SOMETHING_NEW", None, "transient")]
    fn outcomes_are_classified(
        #[case] name: &str,
        #[case] reason: Option<&str>,
        #[case] expected: &str,
    ) {
        let result = classify_outcome(&outcome(name, reason), &DeliveryRules::default());
        assert_eq!(bucket(result), expected);
    }

    #[rstest]
    #[case(409, "duplicate")]
    #[case(400, "system")]
    #[case(401, "system")]
    #[case(403, "system")]
    #[case(429, "transient")]
    #[case(500, "transient")]
    #[case(503, "transient")]
    fn statuses_are_classified(#[case] status: u16, #[case] expected: &str) {
        let status = StatusCode::from_u16(status).unwrap();
        assert_eq!(bucket(Err(classify_status(status, "body"))), expected);
    }

    #[test]
    fn yaml_rules_override_the_defaults() {
        let rules = DeliveryRules::from_yaml_str(
            "user_keywords:\n  - '  Mailbox_Disabled '\nsystem_keywords:\n  - dkim_failure\n",
        )
        .unwrap();
        assert_eq!(rules.user_keywords, vec!["mailbox_disabled"]);
        assert_eq!(rules.classify_reason("MAILBOX_DISABLED by admin"), FailureCause::User);
        assert_eq!(rules.classify_reason("dkim_failure"), FailureCause::System);
        assert_eq!(rules.classify_reason("invalid_mailbox"), FailureCause::Transient);
    }

    #[test]
    fn missing_rules_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let rules = DeliveryRules::load_or_default(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(rules, DeliveryRules::default());
    }

    #[tokio::test]
    async fn sent_outcome_succeeds_and_carries_the_idempotency_key() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/notifications")
                    .header("authorization", "Bearer secret")
                    .json_body(json!({
                        "notification_id": "e1:sub1",
                        "from": "alerts@example.com",
                        "to": ["dev@example.com"],
                        "subject": "Update",
                        "html_body": "<p>hi</p>"
                    }));
                then.status(200).json_body(json!({"outcome": "SENT"}));
            })
            .await;

        sender(&server)
            .send("e1:sub1", "dev@example.com", "Update", "<p>hi</p>")
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn conflict_is_a_duplicate_and_preference_drop_is_permanent() {
        let conflict = MockServer::start_async().await;
        conflict
            .mock_async(|when, then| {
                when.method(POST).path("/v1/notifications");
                then.status(409).body("already processed");
            })
            .await;
        let dropped = MockServer::start_async().await;
        dropped
            .mock_async(|when, then| {
                when.method(POST).path("/v1/notifications");
                then.status(200)
                    .json_body(json!({"outcome": "PREFERENCE_DROPPED"}));
            })
            .await;

        assert_eq!(
            sender(&conflict).send("dup", "a@example.com", "s", "b").await,
            Err(SendError::Duplicate)
        );
        assert!(matches!(
            sender(&dropped).send("pref", "a@example.com", "s", "b").await,
            Err(SendError::PermanentUser(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_provider_is_transient() {
        let sender = HttpEmailSender::new(HttpEmailSenderConfig {
            api_url: "http://127.0.0.1:9".into(),
            api_token: "t".into(),
            from_address: "alerts@example.com".into(),
            timeout: Duration::from_millis(500),
            rules: DeliveryRules::default(),
        })
        .unwrap();
        assert!(matches!(
            sender.send("id", "a@example.com", "s", "b").await,
            Err(SendError::Transient(_))
        ));
    }
}
