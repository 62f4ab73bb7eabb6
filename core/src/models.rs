use anyhow::{Result, bail};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub created_at: String,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CalorieEntry {
    pub id: i64,
    pub name: String,
    pub calories: f64,
    pub protein: f64,
    pub carbs: f64,
    pub fat: f64,
    pub date: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewCalorieEntry {
    pub name: String,
    pub calories: f64,
    pub protein: f64,
    pub carbs: f64,
    pub fat: f64,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressEntry {
    pub id: i64,
    pub body_weight: f64,
    pub bench: f64,
    pub squat: f64,
    pub deadlift: f64,
    pub date: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewProgressEntry {
    pub body_weight: f64,
    pub bench: f64,
    pub squat: f64,
    pub deadlift: f64,
    pub date: NaiveDate,
}

/// Per-user daily macro targets.
///
/// `Default` is the virtual goal set returned before the user ever writes
/// one; it is never persisted on read.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Goals {
    pub daily_calories: f64,
    pub daily_protein: f64,
    pub daily_carbs: f64,
    pub daily_fat: f64,
    pub target_weight: Option<f64>,
}

impl Default for Goals {
    fn default() -> Self {
        Self {
            daily_calories: 2000.0,
            daily_protein: 150.0,
            daily_carbs: 250.0,
            daily_fat: 65.0,
            target_weight: None,
        }
    }
}

/// Partial goals update: `None` leaves a field untouched.
/// `target_weight` distinguishes absent (`None`) from an explicit
/// clear (`Some(None)`).
#[derive(Debug, Clone, Default)]
#[allow(clippy::option_option)]
pub struct GoalsUpdate {
    pub daily_calories: Option<f64>,
    pub daily_protein: Option<f64>,
    pub daily_carbs: Option<f64>,
    pub daily_fat: Option<f64>,
    pub target_weight: Option<Option<f64>>,
}

impl Goals {
    pub fn apply(&mut self, update: &GoalsUpdate) {
        if let Some(v) = update.daily_calories {
            self.daily_calories = v;
        }
        if let Some(v) = update.daily_protein {
            self.daily_protein = v;
        }
        if let Some(v) = update.daily_carbs {
            self.daily_carbs = v;
        }
        if let Some(v) = update.daily_fat {
            self.daily_fat = v;
        }
        if let Some(v) = update.target_weight {
            self.target_weight = v;
        }
    }
}

/// A normalized nutrition record, as cached and as returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NutritionRecord {
    pub food_name: String,
    pub calories: f64,
    pub protein: f64,
    pub carbs: f64,
    pub fat: f64,
    pub serving_qty: Option<f64>,
    pub serving_unit: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NutritionTotals {
    pub total_calories: f64,
    pub avg_daily_calories: f64,
    pub total_protein: f64,
    pub total_carbs: f64,
    pub total_fat: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryStats {
    pub period: String,
    pub nutrition: NutritionTotals,
    pub latest_progress: Option<ProgressEntry>,
    pub entries_count: i64,
    pub progress_entries_count: i64,
}

pub const MAX_ENTRY_NAME_LEN: usize = 255;

/// Validate and normalize a username: trimmed, 2-50 characters.
pub fn validate_username(username: &str) -> Result<String> {
    let trimmed = username.trim();
    if trimmed.len() < 2 || trimmed.len() > 50 {
        bail!("Username must be between 2 and 50 characters");
    }
    Ok(trimmed.to_string())
}

/// Validate and normalize an email address: trimmed, lower-cased.
pub fn validate_email(email: &str) -> Result<String> {
    let normalized = email.trim().to_lowercase();
    if normalized.is_empty() || !normalized.contains('@') {
        bail!("Invalid email address");
    }
    Ok(normalized)
}

pub fn validate_password(password: &str) -> Result<()> {
    if password.len() < 6 {
        bail!("Password must be at least 6 characters long");
    }
    Ok(())
}

/// Validate an entry name and clamp it to the stored column width.
pub fn validate_entry_name(name: &str) -> Result<String> {
    if name.trim().is_empty() {
        bail!("Entry name must not be empty");
    }
    Ok(name.chars().take(MAX_ENTRY_NAME_LEN).collect())
}

pub fn parse_entry_date(date: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|_| anyhow::anyhow!("Invalid date '{date}'. Use YYYY-MM-DD"))
}
