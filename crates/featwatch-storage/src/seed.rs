//! Deterministic fake data for local runs and demos.
//!
//! The generator owns the RNG it is handed, so the same seed always yields
//! the same searches, channels and subscriptions.

use chrono::{Duration, TimeZone, Utc};
use featwatch_core::{Frequency, SavedSearch, SearchScope, SubscriptionTrigger};
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use uuid::{Builder, Uuid};

const QUERIES: &[&str] = &[
    "baseline_status:newly",
    "baseline_status:widely",
    "baseline_status:limited",
    "available_on:chrome",
    "available_on:firefox AND -available_on:safari",
    "name:grid",
    "group:css",
    "baseline_date:2024-01-01..2024-12-31",
];

const TRIGGERS: &[SubscriptionTrigger] = &[
    SubscriptionTrigger::FeaturePromotedToNewly,
    SubscriptionTrigger::FeaturePromotedToWidely,
    SubscriptionTrigger::FeatureRegressedToLimited,
    SubscriptionTrigger::BrowserImplementationAnywhereComplete,
];

const FREQUENCIES: &[Frequency] = &[Frequency::Immediate, Frequency::Weekly, Frequency::Monthly];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewChannel {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub channel_type: String,
    pub config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSubscription {
    pub id: String,
    pub user_id: String,
    pub channel_id: String,
    pub saved_search_id: String,
    pub triggers: Vec<String>,
    pub frequency: Frequency,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeedData {
    pub saved_searches: Vec<SavedSearch>,
    pub channels: Vec<NewChannel>,
    pub subscriptions: Vec<NewSubscription>,
}

pub struct FakeDataGenerator {
    rng: ChaCha8Rng,
}

impl FakeDataGenerator {
    pub fn new(rng: ChaCha8Rng) -> Self {
        Self { rng }
    }

    pub fn from_seed(seed: u64) -> Self {
        Self::new(ChaCha8Rng::seed_from_u64(seed))
    }

    fn next_id(&mut self) -> String {
        let bytes: [u8; 16] = self.rng.random();
        let id: Uuid = Builder::from_random_bytes(bytes).into_uuid();
        id.to_string()
    }

    pub fn generate(&mut self, users: usize, searches: usize) -> SeedData {
        let epoch = Utc
            .with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_else(Utc::now);
        let mut data = SeedData::default();

        let user_ids: Vec<String> = (0..users.max(1)).map(|_| self.next_id()).collect();
        for (n, user_id) in user_ids.iter().enumerate() {
            data.channels.push(NewChannel {
                id: self.next_id(),
                user_id: user_id.clone(),
                name: "Primary email".to_string(),
                channel_type: "email".to_string(),
                config: Some(serde_json::json!({ "address": format!("user{n}@example.com") })),
            });
        }

        for n in 0..searches {
            let author_index = self.rng.random_range(0..user_ids.len());
            let query = QUERIES.choose(&mut self.rng).copied().unwrap_or("name:grid");
            let created_at = epoch + Duration::minutes(self.rng.random_range(0..525_600));
            let search = SavedSearch {
                id: self.next_id(),
                name: format!("Saved search {n}"),
                query: query.to_string(),
                scope: SearchScope::UserPublic,
                author_id: user_ids[author_index].clone(),
                created_at,
                updated_at: created_at,
            };

            let subscriber_count = self.rng.random_range(0..=user_ids.len().min(3));
            let subscribers: Vec<usize> =
                rand::seq::index::sample(&mut self.rng, user_ids.len(), subscriber_count).into_vec();
            for user_index in subscribers {
                let trigger_count = self.rng.random_range(0..=2);
                let triggers = TRIGGERS
                    .choose_multiple(&mut self.rng, trigger_count)
                    .map(|t| t.as_str().to_string())
                    .collect();
                let frequency = *FREQUENCIES.choose(&mut self.rng).unwrap_or(&Frequency::Immediate);
                data.subscriptions.push(NewSubscription {
                    id: self.next_id(),
                    user_id: user_ids[user_index].clone(),
                    channel_id: data.channels[user_index].id.clone(),
                    saved_search_id: search.id.clone(),
                    triggers,
                    frequency,
                });
            }
            data.saved_searches.push(search);
        }

        data
    }
}
