use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::NutritionixCredentials;
use fitlog_core::db::Database;
use fitlog_core::models::NutritionRecord;
use fitlog_core::nutrition::{self, LookupError, NutrientsResponse};

const NUTRIENTS_URL: &str = "https://trackapi.nutritionix.com/v2/natural/nutrients";

/// A nutrition-data source. The server runs one for its whole lifetime:
/// the real Nutritionix client when credentials are configured, the
/// deterministic stub otherwise.
#[async_trait]
pub trait NutritionProvider: Send + Sync {
    async fn lookup(&self, query: &str) -> Result<NutritionRecord, LookupError>;
}

pub struct NutritionixClient {
    client: reqwest::Client,
    credentials: NutritionixCredentials,
}

impl NutritionixClient {
    pub fn new(credentials: NutritionixCredentials) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(format!(
                "fitlog/{} (fitness tracker)",
                env!("CARGO_PKG_VERSION")
            ))
            .timeout(std::time::Duration::from_secs(10))
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .expect("Failed to build HTTP client");
        Self {
            client,
            credentials,
        }
    }
}

#[async_trait]
impl NutritionProvider for NutritionixClient {
    async fn lookup(&self, query: &str) -> Result<NutritionRecord, LookupError> {
        let response = self
            .client
            .post(NUTRIENTS_URL)
            .header("x-app-id", &self.credentials.app_id)
            .header("x-app-key", &self.credentials.api_key)
            .json(&serde_json::json!({ "query": query }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LookupError::UpstreamTimeout
                } else {
                    LookupError::UpstreamUnreachable
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(LookupError::UpstreamRejected(status.as_u16()));
        }

        let data: NutrientsResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                LookupError::UpstreamTimeout
            } else {
                LookupError::Internal(anyhow!(e).context("Failed to parse Nutritionix response"))
            }
        })?;

        let food = data
            .foods
            .into_iter()
            .next()
            .ok_or_else(|| LookupError::Internal(anyhow!("Nutritionix returned no foods")))?;

        nutrition::food_to_record(food).ok_or_else(|| {
            LookupError::Internal(anyhow!("Nutritionix food item is missing required fields"))
        })
    }
}

/// Offline provider used when no credentials are configured. Always
/// succeeds with the deterministic mock record so the system stays
/// testable and demoable.
pub struct StubNutritionProvider;

#[async_trait]
impl NutritionProvider for StubNutritionProvider {
    async fn lookup(&self, query: &str) -> Result<NutritionRecord, LookupError> {
        Ok(nutrition::fallback_record(query))
    }
}

/// Cache-or-fetch nutrition lookup.
///
/// Normalizes the raw query, answers from the cache when the key is
/// already populated, and otherwise makes exactly one provider call.
/// The cache write afterwards is best-effort: a failure (or losing the
/// insert race to a concurrent request) never fails the lookup, it only
/// forfeits future hits for that key. Cached rows are returned verbatim
/// forever; there is no TTL and no revalidation.
pub async fn lookup_nutrition(
    db: &Arc<Mutex<Database>>,
    provider: &dyn NutritionProvider,
    raw_query: &str,
) -> Result<NutritionRecord, LookupError> {
    let normalized = nutrition::normalize_query(raw_query)?;

    // The DB lock is never held across the provider call
    let cached = {
        let db = db.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        db.get_cached_nutrition(&normalized.cache_key)
            .map_err(LookupError::Internal)?
    };
    if let Some(record) = cached {
        info!(key = %normalized.cache_key, "nutrition cache hit");
        return Ok(record);
    }

    let record = provider.lookup(&normalized.provider_query).await?;

    let stored = {
        let db = db.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        db.cache_nutrition(&normalized.cache_key, &record)
    };
    match stored {
        Ok(true) => info!(key = %normalized.cache_key, "cached nutrition result"),
        // A concurrent lookup won the insert race; its row stands
        Ok(false) => {}
        Err(e) => warn!(key = %normalized.cache_key, "failed to cache nutrition result: {e:#}"),
    }

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
        record: NutritionRecord,
    }

    impl CountingProvider {
        fn new(record: NutritionRecord) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                record,
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl NutritionProvider for CountingProvider {
        async fn lookup(&self, _query: &str) -> Result<NutritionRecord, LookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.record.clone())
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl NutritionProvider for FailingProvider {
        async fn lookup(&self, _query: &str) -> Result<NutritionRecord, LookupError> {
            Err(LookupError::UpstreamTimeout)
        }
    }

    fn test_db() -> Arc<Mutex<Database>> {
        Arc::new(Mutex::new(Database::open_in_memory().unwrap()))
    }

    fn sample_record() -> NutritionRecord {
        NutritionRecord {
            food_name: "cafe latte".to_string(),
            calories: 190.0,
            protein: 12.0,
            carbs: 18.0,
            fat: 7.0,
            serving_qty: Some(1.0),
            serving_unit: Some("cup".to_string()),
        }
    }

    #[tokio::test]
    async fn second_lookup_hits_cache_without_provider_call() {
        let db = test_db();
        let provider = CountingProvider::new(sample_record());

        let first = lookup_nutrition(&db, &provider, "Café Latté").await.unwrap();
        // Case variant normalizes to the same key
        let second = lookup_nutrition(&db, &provider, "CAFE LATTE").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(provider.call_count(), 1);

        let db = db.lock().unwrap();
        assert_eq!(db.nutrition_cache_len().unwrap(), 1);
        assert!(db.get_cached_nutrition("cafe latte").unwrap().is_some());
    }

    #[tokio::test]
    async fn empty_query_never_reaches_provider() {
        let db = test_db();
        let provider = CountingProvider::new(sample_record());

        let result = lookup_nutrition(&db, &provider, "   ").await;
        assert!(matches!(result, Err(LookupError::EmptyQuery)));

        // A query that folds away entirely behaves the same
        let result = lookup_nutrition(&db, &provider, "日本食").await;
        assert!(matches!(result, Err(LookupError::EmptyQuery)));

        assert_eq!(provider.call_count(), 0);
        assert_eq!(db.lock().unwrap().nutrition_cache_len().unwrap(), 0);
    }

    #[tokio::test]
    async fn provider_failure_caches_nothing() {
        let db = test_db();

        let result = lookup_nutrition(&db, &FailingProvider, "toast").await;
        assert!(matches!(result, Err(LookupError::UpstreamTimeout)));
        assert_eq!(db.lock().unwrap().nutrition_cache_len().unwrap(), 0);

        // The key stays open for a later successful lookup
        let provider = CountingProvider::new(sample_record());
        lookup_nutrition(&db, &provider, "toast").await.unwrap();
        assert_eq!(db.lock().unwrap().nutrition_cache_len().unwrap(), 1);
    }

    #[tokio::test]
    async fn pre_populated_key_short_circuits() {
        let db = test_db();
        {
            let locked = db.lock().unwrap();
            locked.cache_nutrition("toast", &sample_record()).unwrap();
        }

        let provider = CountingProvider::new(NutritionRecord {
            food_name: "should not be returned".to_string(),
            ..sample_record()
        });
        let record = lookup_nutrition(&db, &provider, "  Toast ").await.unwrap();

        assert_eq!(record.food_name, "cafe latte");
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn stub_provider_result_is_persisted_like_a_real_one() {
        let db = test_db();

        let record = lookup_nutrition(&db, &StubNutritionProvider, "Avocado Toast")
            .await
            .unwrap();
        assert_eq!(record.food_name, "Mock Avocado Toast");

        // The cached stub record now answers even if the provider breaks
        let cached = lookup_nutrition(&db, &FailingProvider, "avocado toast")
            .await
            .unwrap();
        assert_eq!(cached, record);
    }
}
