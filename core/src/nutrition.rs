use serde::Deserialize;
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

use crate::models::NutritionRecord;

/// Failure classes of a nutrition lookup. The HTTP layer maps each
/// variant onto its own status code.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("No query provided")]
    EmptyQuery,
    #[error("Nutrition provider timed out")]
    UpstreamTimeout,
    #[error("Unable to reach nutrition provider")]
    UpstreamUnreachable,
    #[error("Nutrition provider rejected the request (status {0})")]
    UpstreamRejected(u16),
    #[error("Nutrition lookup failed")]
    Internal(anyhow::Error),
}

/// A food query after normalization.
///
/// `provider_query` keeps the original casing and is what goes over the
/// wire; `cache_key` is its lower-cased form and is the cache's
/// uniqueness key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedQuery {
    pub provider_query: String,
    pub cache_key: String,
}

/// Normalize a raw food query.
///
/// Trims, applies NFKD compatibility decomposition, drops every
/// remaining non-ASCII code point, and trims again. The result must be
/// non-empty or the lookup fails with [`LookupError::EmptyQuery`]. This
/// pipeline is the cache-key contract: any change invalidates every
/// existing cache row.
pub fn normalize_query(raw: &str) -> Result<NormalizedQuery, LookupError> {
    let folded: String = raw.trim().nfkd().filter(char::is_ascii).collect();
    let provider_query = folded.trim().to_string();
    if provider_query.is_empty() {
        return Err(LookupError::EmptyQuery);
    }
    let cache_key = provider_query.to_lowercase();
    Ok(NormalizedQuery {
        provider_query,
        cache_key,
    })
}

// --- Nutritionix natural-nutrients response types ---

#[derive(Debug, Deserialize)]
pub struct NutrientsResponse {
    pub foods: Vec<FoodData>,
}

#[derive(Debug, Deserialize)]
pub struct FoodData {
    pub food_name: Option<String>,
    pub nf_calories: Option<f64>,
    pub nf_protein: Option<f64>,
    pub nf_total_carbohydrate: Option<f64>,
    pub nf_total_fat: Option<f64>,
    pub serving_qty: Option<f64>,
    pub serving_unit: Option<String>,
}

/// Map a provider food item into the internal record shape.
/// Name and calories are required; absent macros read as zero.
#[must_use]
pub fn food_to_record(food: FoodData) -> Option<NutritionRecord> {
    let food_name = food.food_name.filter(|n| !n.is_empty())?;
    let calories = food.nf_calories?;

    Some(NutritionRecord {
        food_name,
        calories,
        protein: food.nf_protein.unwrap_or(0.0),
        carbs: food.nf_total_carbohydrate.unwrap_or(0.0),
        fat: food.nf_total_fat.unwrap_or(0.0),
        serving_qty: food.serving_qty,
        serving_unit: food.serving_unit,
    })
}

/// Deterministic record used when no provider credentials are
/// configured, so the system stays demoable offline. Persisted under the
/// same key a real result would be.
#[must_use]
pub fn fallback_record(query: &str) -> NutritionRecord {
    NutritionRecord {
        food_name: format!("Mock {query}"),
        calories: 150.0,
        protein: 5.0,
        carbs: 30.0,
        fat: 2.0,
        serving_qty: Some(1.0),
        serving_unit: Some("serving".to_string()),
    }
}
