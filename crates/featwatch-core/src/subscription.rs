//! Subscriptions, delivery channels and channel health.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailConfig {
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
}

/// A delivery destination with its channel-specific configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    Email(EmailConfig),
    Webhook(WebhookConfig),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelConfigError {
    #[error("channel {channel_type} has no config")]
    Missing { channel_type: String },
    #[error("channel {channel_type} config is invalid: {message}")]
    Invalid {
        channel_type: String,
        message: String,
    },
}

impl ChannelKind {
    pub const EMAIL: &'static str = "email";
    pub const WEBHOOK: &'static str = "webhook";

    /// Decode a stored `(type, config)` pair. Unknown channel types yield
    /// `Ok(None)` so that newer rows never fail older workers.
    pub fn from_parts(
        channel_type: &str,
        config: Option<&serde_json::Value>,
    ) -> Result<Option<Self>, ChannelConfigError> {
        let invalid = |kind: &str, err: serde_json::Error| ChannelConfigError::Invalid {
            channel_type: kind.to_string(),
            message: err.to_string(),
        };

        match channel_type {
            Self::EMAIL => {
                let value = require_config(Self::EMAIL, config)?;
                let config: EmailConfig =
                    serde_json::from_value(value.clone()).map_err(|e| invalid(Self::EMAIL, e))?;
                if !looks_like_email(&config.address) {
                    return Err(ChannelConfigError::Invalid {
                        channel_type: Self::EMAIL.to_string(),
                        message: format!("not an email address: {:?}", config.address),
                    });
                }
                Ok(Some(Self::Email(config)))
            }
            Self::WEBHOOK => {
                let value = require_config(Self::WEBHOOK, config)?;
                let config: WebhookConfig = serde_json::from_value(value.clone())
                    .map_err(|e| invalid(Self::WEBHOOK, e))?;
                Ok(Some(Self::Webhook(config)))
            }
            _ => Ok(None),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Email(_) => Self::EMAIL,
            Self::Webhook(_) => Self::WEBHOOK,
        }
    }
}

fn require_config<'a>(
    channel_type: &str,
    config: Option<&'a serde_json::Value>,
) -> Result<&'a serde_json::Value, ChannelConfigError> {
    match config {
        Some(value) if !value.is_null() => Ok(value),
        _ => Err(ChannelConfigError::Missing {
            channel_type: channel_type.to_string(),
        }),
    }
}

fn looks_like_email(address: &str) -> bool {
    let address = address.trim();
    match address.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.ends_with('.'),
        None => false,
    }
}

/// Conditions under which a subscriber wants to be told about a change.
///
/// Values written by newer clients that this build does not know decode as
/// `Unknown`, which renders as the empty string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SubscriptionTrigger {
    FeaturePromotedToNewly,
    FeaturePromotedToWidely,
    FeatureRegressedToLimited,
    BrowserImplementationAnywhereComplete,
    Unknown,
}

impl SubscriptionTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FeaturePromotedToNewly => "feature_promoted_to_newly",
            Self::FeaturePromotedToWidely => "feature_promoted_to_widely",
            Self::FeatureRegressedToLimited => "feature_regressed_to_limited",
            Self::BrowserImplementationAnywhereComplete => "browser_implementation_anywhere_complete",
            Self::Unknown => "",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "feature_promoted_to_newly" => Self::FeaturePromotedToNewly,
            "feature_promoted_to_widely" => Self::FeaturePromotedToWidely,
            "feature_regressed_to_limited" => Self::FeatureRegressedToLimited,
            "browser_implementation_anywhere_complete" => {
                Self::BrowserImplementationAnywhereComplete
            }
            _ => Self::Unknown,
        }
    }
}

impl From<String> for SubscriptionTrigger {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<SubscriptionTrigger> for String {
    fn from(value: SubscriptionTrigger) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for SubscriptionTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One active `(subscription, channel)` pair as loaded from storage, before
/// any channel-specific decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionDestination {
    pub subscription_id: String,
    pub user_id: String,
    pub channel_id: String,
    pub channel_type: String,
    pub channel_config: Option<serde_json::Value>,
    pub triggers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailSubscriber {
    pub subscription_id: String,
    pub user_id: String,
    pub email_address: String,
    pub triggers: Vec<SubscriptionTrigger>,
    pub channel_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelState {
    pub channel_id: String,
    pub is_disabled_by_system: bool,
    pub consecutive_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_failure_message: Option<String>,
}
