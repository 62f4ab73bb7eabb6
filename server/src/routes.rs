use std::sync::{Arc, Mutex};

use anyhow::Context;
use axum::{
    Extension, Json, Router,
    extract::{Path, Query, Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::auth::{self, AuthUser};
use crate::nutritionix::{self, NutritionProvider};
use fitlog_core::db::Database;
use fitlog_core::models::{
    GoalsUpdate, NewCalorieEntry, NewProgressEntry, NewUser, NutritionRecord, SummaryStats, User,
    parse_entry_date, validate_email, validate_entry_name, validate_password, validate_username,
};
use fitlog_core::nutrition::LookupError;

const BODY_LIMIT: usize = 1024 * 1024; // 1 MiB

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Mutex<Database>>,
    pub provider: Arc<dyn NutritionProvider>,
    pub jwt_secret: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// --- Error handling ---

enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Conflict(String),
    Lookup(LookupError),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg),
            Self::Lookup(err) => return lookup_error_response(&err),
            Self::Internal(err) => {
                error!("Internal server error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

/// Each lookup failure class has its own status; upstream rejections
/// forward the provider's own code.
fn lookup_error_response(err: &LookupError) -> Response {
    let (status, message) = match err {
        LookupError::EmptyQuery => (StatusCode::BAD_REQUEST, err.to_string()),
        LookupError::UpstreamTimeout => (StatusCode::GATEWAY_TIMEOUT, err.to_string()),
        LookupError::UpstreamUnreachable => (StatusCode::BAD_GATEWAY, err.to_string()),
        LookupError::UpstreamRejected(code) => (
            StatusCode::from_u16(*code).unwrap_or(StatusCode::BAD_GATEWAY),
            err.to_string(),
        ),
        LookupError::Internal(source) => {
            error!("Nutrition lookup failed: {source:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            )
        }
    };
    (status, Json(ErrorResponse { error: message })).into_response()
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl From<LookupError> for ApiError {
    fn from(err: LookupError) -> Self {
        Self::Lookup(err)
    }
}

// --- Request body helpers ---
//
// Bodies are taken as `serde_json::Value` and picked apart by hand so
// that a missing field, a wrong type, and a non-coercible number all
// surface as 400s naming the problem, not as framework rejections.

fn require_object(data: &Value) -> Result<&serde_json::Map<String, Value>, ApiError> {
    match data.as_object() {
        Some(map) if !map.is_empty() => Ok(map),
        _ => Err(ApiError::BadRequest("No data provided".to_string())),
    }
}

fn require_nonempty_str<'a>(
    data: &'a serde_json::Map<String, Value>,
    field: &str,
) -> Result<&'a str, ApiError> {
    data.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest(format!("Missing or empty field: {field}")))
}

/// Accepts JSON numbers and numeric strings, like the clients send.
fn coerce_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn require_f64(data: &serde_json::Map<String, Value>, field: &str) -> Result<f64, ApiError> {
    let value = data
        .get(field)
        .ok_or_else(|| ApiError::BadRequest(format!("Missing field: {field}")))?;
    coerce_f64(value).ok_or_else(|| ApiError::BadRequest("Invalid numeric values".to_string()))
}

fn optional_f64(
    data: &serde_json::Map<String, Value>,
    field: &str,
) -> Result<Option<f64>, ApiError> {
    match data.get(field) {
        None => Ok(None),
        Some(value) => coerce_f64(value)
            .map(Some)
            .ok_or_else(|| ApiError::BadRequest("Invalid numeric values".to_string())),
    }
}

/// Optional entry date; defaults to today.
fn entry_date(data: &serde_json::Map<String, Value>) -> Result<NaiveDate, ApiError> {
    match data.get("date") {
        None => Ok(Local::now().date_naive()),
        Some(value) => {
            let s = value.as_str().ok_or_else(|| {
                ApiError::BadRequest("Invalid date format. Use YYYY-MM-DD".to_string())
            })?;
            parse_entry_date(s).map_err(|e| ApiError::BadRequest(format!("{e}")))
        }
    }
}

fn lock_db(state: &AppState) -> std::sync::MutexGuard<'_, Database> {
    state
        .db
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

// --- Middleware ---

async fn require_auth(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let user_id = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .and_then(|token| auth::verify_token(token, &state.jwt_secret));

    let Some(user_id) = user_id else {
        return unauthorized();
    };

    // The token subject must still resolve to an active account
    let user = {
        let db = lock_db(&state);
        db.get_user_by_id(user_id)
    };
    match user {
        Ok(Some(user)) if user.is_active => {
            request.extensions_mut().insert(AuthUser { id: user.id });
            next.run(request).await
        }
        Ok(_) => unauthorized(),
        Err(err) => ApiError::Internal(err).into_response(),
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: "Invalid or missing token".to_string(),
        }),
    )
        .into_response()
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

// --- Misc handlers ---

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

// --- Auth handlers ---

async fn register(
    State(state): State<AppState>,
    Json(data): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let data = require_object(&data)?;

    let username = require_nonempty_str(data, "username")?;
    let email = require_nonempty_str(data, "email")?;
    let password = require_nonempty_str(data, "password")?;

    let username = validate_username(username).map_err(|e| ApiError::BadRequest(format!("{e}")))?;
    let email = validate_email(email).map_err(|e| ApiError::BadRequest(format!("{e}")))?;
    validate_password(password).map_err(|e| ApiError::BadRequest(format!("{e}")))?;

    {
        let db = lock_db(&state);
        if db.username_taken(&username).context("database error")? {
            return Err(ApiError::Conflict("Username already exists".to_string()));
        }
        if db.email_taken(&email).context("database error")? {
            return Err(ApiError::Conflict("Email already registered".to_string()));
        }
    }

    let password_hash = auth::hash_password(password).context("failed to hash password")?;

    let user = {
        let db = lock_db(&state);
        db.create_user(&NewUser {
            username,
            email,
            password_hash,
        })
        .context("failed to create user")?
    };

    let token = auth::issue_token(user.id, &state.jwt_secret).context("failed to issue token")?;

    info!(username = %user.username, "new user registered");
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "User registered successfully",
            "token": token,
            "user": user,
        })),
    ))
}

async fn login(
    State(state): State<AppState>,
    Json(data): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let data = require_object(&data)?;

    let email = data
        .get("email")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_lowercase();
    let password = data.get("password").and_then(Value::as_str).unwrap_or("");
    if email.is_empty() || password.is_empty() {
        return Err(ApiError::BadRequest(
            "Email and password are required".to_string(),
        ));
    }

    let found = {
        let db = lock_db(&state);
        db.get_auth_user_by_email(&email).context("database error")?
    };

    let Some((user, password_hash)) = found else {
        return Err(ApiError::Unauthorized(
            "Invalid email or password".to_string(),
        ));
    };
    if !auth::verify_password(password, &password_hash) {
        return Err(ApiError::Unauthorized(
            "Invalid email or password".to_string(),
        ));
    }
    if !user.is_active {
        return Err(ApiError::Unauthorized("Account is deactivated".to_string()));
    }

    let token = auth::issue_token(user.id, &state.jwt_secret).context("failed to issue token")?;

    info!(username = %user.username, "user logged in");
    Ok(Json(json!({
        "message": "Login successful",
        "token": token,
        "user": user,
    })))
}

fn current_user(state: &AppState, auth: AuthUser) -> Result<User, ApiError> {
    let db = lock_db(state);
    db.get_user_by_id(auth.id)
        .context("database error")?
        .ok_or_else(|| ApiError::Unauthorized("Invalid or missing token".to_string()))
}

async fn verify_token(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
) -> Result<Json<Value>, ApiError> {
    let user = current_user(&state, auth)?;
    Ok(Json(json!({ "message": "Token is valid", "user": user })))
}

async fn get_profile(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
) -> Result<Json<Value>, ApiError> {
    let user = current_user(&state, auth)?;
    Ok(Json(json!({ "user": user })))
}

// --- Nutrition lookup ---

async fn nutrition_lookup(
    State(state): State<AppState>,
    Json(data): Json<Value>,
) -> Result<Json<NutritionRecord>, ApiError> {
    let query = data
        .get("query")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::BadRequest("No query provided".to_string()))?;

    let record = nutritionix::lookup_nutrition(&state.db, state.provider.as_ref(), query).await?;
    Ok(Json(record))
}

// --- Calorie entry handlers ---

async fn create_entry(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Json(data): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let data = require_object(&data)?;

    let name = require_nonempty_str(data, "name")?;
    let name = validate_entry_name(name).map_err(|e| ApiError::BadRequest(format!("{e}")))?;
    let calories = require_f64(data, "calories")?;
    let protein = require_f64(data, "protein")?;
    let carbs = require_f64(data, "carbs")?;
    let fat = require_f64(data, "fat")?;
    let date = entry_date(data)?;

    let entry = {
        let db = lock_db(&state);
        db.insert_calorie_entry(
            auth.id,
            &NewCalorieEntry {
                name,
                calories,
                protein,
                carbs,
                fat,
                date,
            },
        )
        .context("failed to insert entry")?
    };

    info!(user_id = auth.id, name = %entry.name, "added calorie entry");
    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": "Entry added", "entry": entry })),
    ))
}

async fn list_entries(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
) -> Result<Json<Value>, ApiError> {
    let entries = {
        let db = lock_db(&state);
        db.list_calorie_entries(auth.id).context("database error")?
    };
    Ok(Json(serde_json::to_value(entries).context("failed to serialize entries")?))
}

async fn list_entries_today(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
) -> Result<Json<Value>, ApiError> {
    let today = Local::now().date_naive();
    let entries = {
        let db = lock_db(&state);
        db.list_calorie_entries_for_date(auth.id, today)
            .context("database error")?
    };
    Ok(Json(serde_json::to_value(entries).context("failed to serialize entries")?))
}

#[derive(Deserialize)]
struct DateRangeQuery {
    start_date: Option<String>,
    end_date: Option<String>,
}

fn parse_range(params: &DateRangeQuery) -> Result<(NaiveDate, NaiveDate), ApiError> {
    let (Some(start), Some(end)) = (params.start_date.as_deref(), params.end_date.as_deref())
    else {
        return Err(ApiError::BadRequest(
            "start_date and end_date required".to_string(),
        ));
    };
    let start = NaiveDate::parse_from_str(start, "%Y-%m-%d").map_err(|_| {
        ApiError::BadRequest("Invalid date format. Use YYYY-MM-DD".to_string())
    })?;
    let end = NaiveDate::parse_from_str(end, "%Y-%m-%d").map_err(|_| {
        ApiError::BadRequest("Invalid date format. Use YYYY-MM-DD".to_string())
    })?;
    Ok((start, end))
}

/// Group serialized rows into an object keyed by their `date` field.
fn group_by_date<T: Serialize>(rows: &[T]) -> Result<Value, ApiError> {
    let mut grouped = serde_json::Map::new();
    for row in rows {
        let value = serde_json::to_value(row).context("failed to serialize entry")?;
        let date = value
            .get("date")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if let Value::Array(items) = grouped
            .entry(date)
            .or_insert_with(|| Value::Array(Vec::new()))
        {
            items.push(value);
        }
    }
    Ok(Value::Object(grouped))
}

async fn list_entries_by_range(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Query(params): Query<DateRangeQuery>,
) -> Result<Json<Value>, ApiError> {
    let (start, end) = parse_range(&params)?;
    let entries = {
        let db = lock_db(&state);
        db.list_calorie_entries_in_range(auth.id, start, end)
            .context("database error")?
    };
    Ok(Json(group_by_date(&entries)?))
}

async fn list_entries_by_date(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(date_str): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let date = NaiveDate::parse_from_str(&date_str, "%Y-%m-%d")
        .map_err(|_| ApiError::BadRequest("Invalid date format. Use YYYY-MM-DD".to_string()))?;
    let entries = {
        let db = lock_db(&state);
        db.list_calorie_entries_for_date(auth.id, date)
            .context("database error")?
    };
    Ok(Json(serde_json::to_value(entries).context("failed to serialize entries")?))
}

async fn delete_entry(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(id_str): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id: i64 = id_str
        .parse()
        .map_err(|_| ApiError::BadRequest("Invalid entry id".to_string()))?;

    let deleted = {
        let db = lock_db(&state);
        db.delete_calorie_entry(auth.id, id)
            .context("database error")?
    };
    if deleted {
        info!(user_id = auth.id, entry_id = id, "deleted calorie entry");
        Ok(Json(json!({ "message": "Entry deleted" })))
    } else {
        Err(ApiError::NotFound("Entry not found".to_string()))
    }
}

// --- Progress handlers ---

async fn create_progress(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Json(data): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let data = require_object(&data)?;

    let body_weight = require_f64(data, "body_weight")?;
    let bench = require_f64(data, "bench")?;
    let squat = require_f64(data, "squat")?;
    let deadlift = require_f64(data, "deadlift")?;
    let date = entry_date(data)?;

    let entry = {
        let db = lock_db(&state);
        db.insert_progress_entry(
            auth.id,
            &NewProgressEntry {
                body_weight,
                bench,
                squat,
                deadlift,
                date,
            },
        )
        .context("failed to insert progress entry")?
    };

    info!(user_id = auth.id, body_weight, "added progress entry");
    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": "Progress entry added", "entry": entry })),
    ))
}

async fn list_progress(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
) -> Result<Json<Value>, ApiError> {
    let entries = {
        let db = lock_db(&state);
        db.list_progress_entries(auth.id).context("database error")?
    };
    Ok(Json(serde_json::to_value(entries).context("failed to serialize entries")?))
}

async fn list_progress_by_range(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Query(params): Query<DateRangeQuery>,
) -> Result<Json<Value>, ApiError> {
    let (start, end) = parse_range(&params)?;
    let entries = {
        let db = lock_db(&state);
        db.list_progress_entries_in_range(auth.id, start, end)
            .context("database error")?
    };
    Ok(Json(group_by_date(&entries)?))
}

async fn list_progress_by_date(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(date_str): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let date = NaiveDate::parse_from_str(&date_str, "%Y-%m-%d")
        .map_err(|_| ApiError::BadRequest("Invalid date format. Use YYYY-MM-DD".to_string()))?;
    let entries = {
        let db = lock_db(&state);
        db.list_progress_entries_for_date(auth.id, date)
            .context("database error")?
    };
    Ok(Json(serde_json::to_value(entries).context("failed to serialize entries")?))
}

async fn delete_progress(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(id_str): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id: i64 = id_str
        .parse()
        .map_err(|_| ApiError::BadRequest("Invalid entry id".to_string()))?;

    let deleted = {
        let db = lock_db(&state);
        db.delete_progress_entry(auth.id, id)
            .context("database error")?
    };
    if deleted {
        info!(user_id = auth.id, entry_id = id, "deleted progress entry");
        Ok(Json(json!({ "message": "Progress entry deleted" })))
    } else {
        Err(ApiError::NotFound("Progress entry not found".to_string()))
    }
}

// --- Goals handlers ---

async fn get_goals(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
) -> Result<Json<Value>, ApiError> {
    // The default goal set is virtual: reads never create a row
    let goals = {
        let db = lock_db(&state);
        db.get_goals(auth.id).context("database error")?
    }
    .unwrap_or_default();
    Ok(Json(serde_json::to_value(goals).context("failed to serialize goals")?))
}

async fn update_goals(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Json(data): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let data = require_object(&data)?;

    let update = GoalsUpdate {
        daily_calories: optional_f64(data, "daily_calories")?,
        daily_protein: optional_f64(data, "daily_protein")?,
        daily_carbs: optional_f64(data, "daily_carbs")?,
        daily_fat: optional_f64(data, "daily_fat")?,
        // Present-null clears the target weight, absent leaves it alone
        target_weight: match data.get("target_weight") {
            None => None,
            Some(Value::Null) => Some(None),
            Some(value) => Some(Some(coerce_f64(value).ok_or_else(|| {
                ApiError::BadRequest("Invalid numeric values".to_string())
            })?)),
        },
    };

    {
        let db = lock_db(&state);
        db.upsert_goals(auth.id, &update)
            .context("failed to update goals")?;
    }

    info!(user_id = auth.id, "updated goals");
    Ok(Json(json!({ "message": "Goals updated" })))
}

// --- Summary statistics ---

#[derive(Deserialize)]
struct StatsQuery {
    days: Option<i64>,
}

async fn summary_stats(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Query(params): Query<StatsQuery>,
) -> Result<Json<SummaryStats>, ApiError> {
    let days = params.days.unwrap_or(7);
    if days < 1 {
        return Err(ApiError::BadRequest("days must be at least 1".to_string()));
    }

    let today = Local::now().date_naive();
    let stats = {
        let db = lock_db(&state);
        db.summary_stats(auth.id, days, today)
            .context("database error")?
    };
    Ok(Json(stats))
}

// --- Router builder ---

fn build_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/health", get(health))
        .route("/auth/register", post(register))
        .route("/auth/login", post(login));

    let protected = Router::new()
        .route("/auth/verify", get(verify_token))
        .route("/auth/profile", get(get_profile))
        .route("/api/nutritionix", post(nutrition_lookup))
        .route("/entries", get(list_entries).post(create_entry))
        .route("/entries/today", get(list_entries_today))
        .route("/entries/date-range", get(list_entries_by_range))
        .route(
            "/entries/{date}",
            get(list_entries_by_date).delete(delete_entry),
        )
        .route("/progress", get(list_progress).post(create_progress))
        .route("/progress/date-range", get(list_progress_by_range))
        .route(
            "/progress/{date}",
            get(list_progress_by_date).delete(delete_progress),
        )
        .route("/goals", get(get_goals).post(update_goals))
        .route("/stats/summary", get(summary_stats))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    public
        .merge(protected)
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

// --- Server startup ---

pub async fn start_server(
    db: Database,
    provider: Arc<dyn NutritionProvider>,
    jwt_secret: String,
    port: u16,
    bind: &str,
) -> anyhow::Result<()> {
    let state = AppState {
        db: Arc::new(Mutex::new(db)),
        provider,
        jwt_secret,
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}")).await?;
    info!("Listening on http://{bind}:{port}");
    axum::serve(listener, app).await?;

    Ok(())
}
