use std::path::Path;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use rusqlite::{Connection, params};
use uuid::Uuid;

use crate::models::{
    CalorieEntry, Goals, GoalsUpdate, NewCalorieEntry, NewProgressEntry, NewUser, NutritionRecord,
    NutritionTotals, ProgressEntry, SummaryStats, User,
};

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        // Cascading deletes depend on this; off by default in SQLite
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    username TEXT NOT NULL UNIQUE,
                    email TEXT NOT NULL UNIQUE,
                    password_hash TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    is_active INTEGER NOT NULL DEFAULT 1
                );

                CREATE TABLE IF NOT EXISTS calorie_entries (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    calories REAL NOT NULL,
                    protein REAL NOT NULL,
                    carbs REAL NOT NULL,
                    fat REAL NOT NULL,
                    date TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS progress_entries (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    body_weight REAL NOT NULL,
                    bench REAL NOT NULL,
                    squat REAL NOT NULL,
                    deadlift REAL NOT NULL,
                    date TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS user_goals (
                    user_id INTEGER PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
                    daily_calories REAL NOT NULL,
                    daily_protein REAL NOT NULL,
                    daily_carbs REAL NOT NULL,
                    daily_fat REAL NOT NULL,
                    target_weight REAL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS nutrition_cache (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    uuid TEXT NOT NULL,
                    query TEXT NOT NULL UNIQUE,
                    food_name TEXT NOT NULL,
                    calories REAL NOT NULL,
                    protein REAL NOT NULL,
                    carbs REAL NOT NULL,
                    fat REAL NOT NULL,
                    serving_qty REAL,
                    serving_unit TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_calorie_entries_user_date
                    ON calorie_entries(user_id, date);
                CREATE INDEX IF NOT EXISTS idx_progress_entries_user_date
                    ON progress_entries(user_id, date);

                PRAGMA user_version = 1;",
            )?;
        }

        Ok(())
    }

    // --- Users ---

    pub fn create_user(&self, user: &NewUser) -> Result<User> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO users (username, email, password_hash, created_at, is_active)
             VALUES (?1, ?2, ?3, ?4, 1)",
            params![user.username, user.email, user.password_hash, now],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_user_by_id(id)?.context("User not found after insert")
    }

    pub fn get_user_by_id(&self, id: i64) -> Result<Option<User>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, username, email, created_at, is_active FROM users WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Self::user_from_row(row)?))
        } else {
            Ok(None)
        }
    }

    /// Fetch a user and their stored password hash for credential checks.
    pub fn get_auth_user_by_email(&self, email: &str) -> Result<Option<(User, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, username, email, created_at, is_active, password_hash
             FROM users WHERE email = ?1",
        )?;
        let mut rows = stmt.query(params![email])?;
        if let Some(row) = rows.next()? {
            let user = Self::user_from_row(row)?;
            let hash: String = row.get(5)?;
            Ok(Some((user, hash)))
        } else {
            Ok(None)
        }
    }

    pub fn username_taken(&self, username: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM users WHERE username = ?1",
            params![username],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn email_taken(&self, email: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM users WHERE email = ?1",
            params![email],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Delete a user; the schema cascades their entries, progress, and
    /// goals away with them.
    pub fn delete_user(&self, id: i64) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM users WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    fn user_from_row(row: &rusqlite::Row) -> rusqlite::Result<User> {
        Ok(User {
            id: row.get(0)?,
            username: row.get(1)?,
            email: row.get(2)?,
            created_at: row.get(3)?,
            is_active: row.get(4)?,
        })
    }

    // --- Calorie entries ---

    pub fn insert_calorie_entry(&self, user_id: i64, entry: &NewCalorieEntry) -> Result<CalorieEntry> {
        let now = Utc::now().to_rfc3339();
        let date_str = entry.date.format("%Y-%m-%d").to_string();
        self.conn.execute(
            "INSERT INTO calorie_entries (user_id, name, calories, protein, carbs, fat, date, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                user_id,
                entry.name,
                entry.calories,
                entry.protein,
                entry.carbs,
                entry.fat,
                date_str,
                now,
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_calorie_entry(user_id, id)?
            .context("Entry not found after insert")
    }

    pub fn get_calorie_entry(&self, user_id: i64, id: i64) -> Result<Option<CalorieEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, calories, protein, carbs, fat, date, created_at
             FROM calorie_entries WHERE id = ?1 AND user_id = ?2",
        )?;
        let mut rows = stmt.query(params![id, user_id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Self::calorie_entry_from_row(row)?))
        } else {
            Ok(None)
        }
    }

    /// All of one user's entries, newest day first, newest entry first
    /// within a day.
    pub fn list_calorie_entries(&self, user_id: i64) -> Result<Vec<CalorieEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, calories, protein, carbs, fat, date, created_at
             FROM calorie_entries WHERE user_id = ?1
             ORDER BY date DESC, created_at DESC, id DESC",
        )?;
        let entries = stmt
            .query_map(params![user_id], Self::calorie_entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn list_calorie_entries_for_date(
        &self,
        user_id: i64,
        date: NaiveDate,
    ) -> Result<Vec<CalorieEntry>> {
        let date_str = date.format("%Y-%m-%d").to_string();
        let mut stmt = self.conn.prepare(
            "SELECT id, name, calories, protein, carbs, fat, date, created_at
             FROM calorie_entries WHERE user_id = ?1 AND date = ?2
             ORDER BY created_at DESC, id DESC",
        )?;
        let entries = stmt
            .query_map(params![user_id, date_str], Self::calorie_entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn list_calorie_entries_in_range(
        &self,
        user_id: i64,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<CalorieEntry>> {
        let start_str = start.format("%Y-%m-%d").to_string();
        let end_str = end.format("%Y-%m-%d").to_string();
        let mut stmt = self.conn.prepare(
            "SELECT id, name, calories, protein, carbs, fat, date, created_at
             FROM calorie_entries WHERE user_id = ?1 AND date BETWEEN ?2 AND ?3
             ORDER BY date DESC, created_at DESC, id DESC",
        )?;
        let entries = stmt
            .query_map(
                params![user_id, start_str, end_str],
                Self::calorie_entry_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Owner-scoped delete. Returns false when the id does not exist or
    /// belongs to someone else.
    pub fn delete_calorie_entry(&self, user_id: i64, id: i64) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM calorie_entries WHERE id = ?1 AND user_id = ?2",
            params![id, user_id],
        )?;
        Ok(rows > 0)
    }

    fn calorie_entry_from_row(row: &rusqlite::Row) -> rusqlite::Result<CalorieEntry> {
        Ok(CalorieEntry {
            id: row.get(0)?,
            name: row.get(1)?,
            calories: row.get(2)?,
            protein: row.get(3)?,
            carbs: row.get(4)?,
            fat: row.get(5)?,
            date: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    // --- Progress entries ---

    pub fn insert_progress_entry(
        &self,
        user_id: i64,
        entry: &NewProgressEntry,
    ) -> Result<ProgressEntry> {
        let now = Utc::now().to_rfc3339();
        let date_str = entry.date.format("%Y-%m-%d").to_string();
        self.conn.execute(
            "INSERT INTO progress_entries (user_id, body_weight, bench, squat, deadlift, date, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                user_id,
                entry.body_weight,
                entry.bench,
                entry.squat,
                entry.deadlift,
                date_str,
                now,
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_progress_entry(user_id, id)?
            .context("Progress entry not found after insert")
    }

    pub fn get_progress_entry(&self, user_id: i64, id: i64) -> Result<Option<ProgressEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, body_weight, bench, squat, deadlift, date, created_at
             FROM progress_entries WHERE id = ?1 AND user_id = ?2",
        )?;
        let mut rows = stmt.query(params![id, user_id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Self::progress_entry_from_row(row)?))
        } else {
            Ok(None)
        }
    }

    /// All of one user's progress entries, oldest first, the natural
    /// order for charting strength over time.
    pub fn list_progress_entries(&self, user_id: i64) -> Result<Vec<ProgressEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, body_weight, bench, squat, deadlift, date, created_at
             FROM progress_entries WHERE user_id = ?1
             ORDER BY date ASC, created_at ASC, id ASC",
        )?;
        let entries = stmt
            .query_map(params![user_id], Self::progress_entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn list_progress_entries_for_date(
        &self,
        user_id: i64,
        date: NaiveDate,
    ) -> Result<Vec<ProgressEntry>> {
        let date_str = date.format("%Y-%m-%d").to_string();
        let mut stmt = self.conn.prepare(
            "SELECT id, body_weight, bench, squat, deadlift, date, created_at
             FROM progress_entries WHERE user_id = ?1 AND date = ?2
             ORDER BY created_at DESC, id DESC",
        )?;
        let entries = stmt
            .query_map(params![user_id, date_str], Self::progress_entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn list_progress_entries_in_range(
        &self,
        user_id: i64,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ProgressEntry>> {
        let start_str = start.format("%Y-%m-%d").to_string();
        let end_str = end.format("%Y-%m-%d").to_string();
        let mut stmt = self.conn.prepare(
            "SELECT id, body_weight, bench, squat, deadlift, date, created_at
             FROM progress_entries WHERE user_id = ?1 AND date BETWEEN ?2 AND ?3
             ORDER BY date DESC, created_at DESC, id DESC",
        )?;
        let entries = stmt
            .query_map(
                params![user_id, start_str, end_str],
                Self::progress_entry_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn delete_progress_entry(&self, user_id: i64, id: i64) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM progress_entries WHERE id = ?1 AND user_id = ?2",
            params![id, user_id],
        )?;
        Ok(rows > 0)
    }

    fn progress_entry_from_row(row: &rusqlite::Row) -> rusqlite::Result<ProgressEntry> {
        Ok(ProgressEntry {
            id: row.get(0)?,
            body_weight: row.get(1)?,
            bench: row.get(2)?,
            squat: row.get(3)?,
            deadlift: row.get(4)?,
            date: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    // --- Goals ---

    pub fn get_goals(&self, user_id: i64) -> Result<Option<Goals>> {
        let mut stmt = self.conn.prepare(
            "SELECT daily_calories, daily_protein, daily_carbs, daily_fat, target_weight
             FROM user_goals WHERE user_id = ?1",
        )?;
        let mut rows = stmt.query(params![user_id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Goals {
                daily_calories: row.get(0)?,
                daily_protein: row.get(1)?,
                daily_carbs: row.get(2)?,
                daily_fat: row.get(3)?,
                target_weight: row.get(4)?,
            }))
        } else {
            Ok(None)
        }
    }

    /// Create-or-update the user's goals row. Fields absent from the
    /// update keep their stored values, or the defaults on first write.
    pub fn upsert_goals(&self, user_id: i64, update: &GoalsUpdate) -> Result<Goals> {
        let mut goals = self.get_goals(user_id)?.unwrap_or_default();
        goals.apply(update);

        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO user_goals (user_id, daily_calories, daily_protein, daily_carbs, daily_fat, target_weight, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(user_id) DO UPDATE SET
                daily_calories = excluded.daily_calories,
                daily_protein = excluded.daily_protein,
                daily_carbs = excluded.daily_carbs,
                daily_fat = excluded.daily_fat,
                target_weight = excluded.target_weight,
                updated_at = excluded.updated_at",
            params![
                user_id,
                goals.daily_calories,
                goals.daily_protein,
                goals.daily_carbs,
                goals.daily_fat,
                goals.target_weight,
                now,
            ],
        )?;
        Ok(goals)
    }

    // --- Summary statistics ---

    /// Aggregate calorie totals and the latest progress entry over the
    /// trailing window `[today - (days - 1), today]`.
    #[allow(clippy::cast_precision_loss)]
    pub fn summary_stats(&self, user_id: i64, days: i64, today: NaiveDate) -> Result<SummaryStats> {
        let start = today - chrono::Duration::days(days - 1);
        let start_str = start.format("%Y-%m-%d").to_string();
        let end_str = today.format("%Y-%m-%d").to_string();

        let (total_calories, total_protein, total_carbs, total_fat, entries_count): (
            f64,
            f64,
            f64,
            f64,
            i64,
        ) = self.conn.query_row(
            "SELECT COALESCE(SUM(calories), 0), COALESCE(SUM(protein), 0),
                    COALESCE(SUM(carbs), 0), COALESCE(SUM(fat), 0), COUNT(*)
             FROM calorie_entries WHERE user_id = ?1 AND date BETWEEN ?2 AND ?3",
            params![user_id, start_str, end_str],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            },
        )?;

        let progress = self.list_progress_entries_in_range(user_id, start, today)?;
        let latest_progress = progress.first().cloned();
        let progress_entries_count = progress.len() as i64;

        Ok(SummaryStats {
            period: format!("Last {days} days"),
            nutrition: NutritionTotals {
                total_calories,
                avg_daily_calories: total_calories / days as f64,
                total_protein,
                total_carbs,
                total_fat,
            },
            latest_progress,
            entries_count,
            progress_entries_count,
        })
    }

    // --- Nutrition cache ---

    pub fn get_cached_nutrition(&self, key: &str) -> Result<Option<NutritionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT food_name, calories, protein, carbs, fat, serving_qty, serving_unit
             FROM nutrition_cache WHERE query = ?1",
        )?;
        let mut rows = stmt.query(params![key])?;
        if let Some(row) = rows.next()? {
            Ok(Some(NutritionRecord {
                food_name: row.get(0)?,
                calories: row.get(1)?,
                protein: row.get(2)?,
                carbs: row.get(3)?,
                fat: row.get(4)?,
                serving_qty: row.get(5)?,
                serving_unit: row.get(6)?,
            }))
        } else {
            Ok(None)
        }
    }

    /// Insert a cache row for `key`, first writer wins. Returns false
    /// when the key was already populated; the row is never overwritten.
    pub fn cache_nutrition(&self, key: &str, record: &NutritionRecord) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let uuid = Uuid::new_v4().to_string();
        let rows = self.conn.execute(
            "INSERT OR IGNORE INTO nutrition_cache
                (uuid, query, food_name, calories, protein, carbs, fat, serving_qty, serving_unit, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                uuid,
                key,
                record.food_name,
                record.calories,
                record.protein,
                record.carbs,
                record.fat,
                record.serving_qty,
                record.serving_unit,
                now,
            ],
        )?;
        Ok(rows > 0)
    }

    pub fn nutrition_cache_len(&self) -> Result<i64> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM nutrition_cache", [], |row| row.get(0))?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewCalorieEntry, NewProgressEntry, NewUser};

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn test_user(db: &Database, name: &str) -> User {
        db.create_user(&NewUser {
            username: name.to_string(),
            email: format!("{name}@example.com"),
            password_hash: "not-a-real-hash".to_string(),
        })
        .unwrap()
    }

    fn sample_entry(name: &str, day: &str) -> NewCalorieEntry {
        NewCalorieEntry {
            name: name.to_string(),
            calories: 250.0,
            protein: 20.0,
            carbs: 30.0,
            fat: 5.0,
            date: date(day),
        }
    }

    fn sample_progress(day: &str, bench: f64) -> NewProgressEntry {
        NewProgressEntry {
            body_weight: 82.5,
            bench,
            squat: 140.0,
            deadlift: 180.0,
            date: date(day),
        }
    }

    #[test]
    fn test_create_and_get_user() {
        let db = Database::open_in_memory().unwrap();
        let user = test_user(&db, "alice");

        assert_eq!(user.username, "alice");
        assert_eq!(user.email, "alice@example.com");
        assert!(user.is_active);

        let fetched = db.get_user_by_id(user.id).unwrap().unwrap();
        assert_eq!(fetched.id, user.id);
        assert_eq!(fetched.username, "alice");
    }

    #[test]
    fn test_duplicate_username_rejected() {
        let db = Database::open_in_memory().unwrap();
        test_user(&db, "alice");

        assert!(db.username_taken("alice").unwrap());
        assert!(!db.username_taken("bob").unwrap());

        let result = db.create_user(&NewUser {
            username: "alice".to_string(),
            email: "other@example.com".to_string(),
            password_hash: "hash".to_string(),
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_email_taken() {
        let db = Database::open_in_memory().unwrap();
        test_user(&db, "alice");
        assert!(db.email_taken("alice@example.com").unwrap());
        assert!(!db.email_taken("bob@example.com").unwrap());
    }

    #[test]
    fn test_get_auth_user_by_email() {
        let db = Database::open_in_memory().unwrap();
        let user = test_user(&db, "alice");

        let (fetched, hash) = db
            .get_auth_user_by_email("alice@example.com")
            .unwrap()
            .unwrap();
        assert_eq!(fetched.id, user.id);
        assert_eq!(hash, "not-a-real-hash");

        assert!(db.get_auth_user_by_email("nobody@example.com").unwrap().is_none());
    }

    #[test]
    fn test_insert_and_list_calorie_entries_ordering() {
        let db = Database::open_in_memory().unwrap();
        let user = test_user(&db, "alice");

        db.insert_calorie_entry(user.id, &sample_entry("oats", "2024-06-14")).unwrap();
        db.insert_calorie_entry(user.id, &sample_entry("eggs", "2024-06-15")).unwrap();
        db.insert_calorie_entry(user.id, &sample_entry("toast", "2024-06-15")).unwrap();

        let entries = db.list_calorie_entries(user.id).unwrap();
        assert_eq!(entries.len(), 3);
        // Newest date first, newest insert first within the date
        assert_eq!(entries[0].name, "toast");
        assert_eq!(entries[1].name, "eggs");
        assert_eq!(entries[2].name, "oats");
    }

    #[test]
    fn test_list_calorie_entries_scoped_to_owner() {
        let db = Database::open_in_memory().unwrap();
        let alice = test_user(&db, "alice");
        let bob = test_user(&db, "bob");

        db.insert_calorie_entry(alice.id, &sample_entry("oats", "2024-06-15")).unwrap();

        assert_eq!(db.list_calorie_entries(alice.id).unwrap().len(), 1);
        assert!(db.list_calorie_entries(bob.id).unwrap().is_empty());
    }

    #[test]
    fn test_list_calorie_entries_for_date_and_range() {
        let db = Database::open_in_memory().unwrap();
        let user = test_user(&db, "alice");

        db.insert_calorie_entry(user.id, &sample_entry("oats", "2024-06-10")).unwrap();
        db.insert_calorie_entry(user.id, &sample_entry("eggs", "2024-06-12")).unwrap();
        db.insert_calorie_entry(user.id, &sample_entry("rice", "2024-06-20")).unwrap();

        let on_day = db
            .list_calorie_entries_for_date(user.id, date("2024-06-12"))
            .unwrap();
        assert_eq!(on_day.len(), 1);
        assert_eq!(on_day[0].name, "eggs");

        let in_range = db
            .list_calorie_entries_in_range(user.id, date("2024-06-09"), date("2024-06-13"))
            .unwrap();
        assert_eq!(in_range.len(), 2);
        assert_eq!(in_range[0].name, "eggs");
        assert_eq!(in_range[1].name, "oats");
    }

    #[test]
    fn test_delete_calorie_entry_owner_scoped() {
        let db = Database::open_in_memory().unwrap();
        let alice = test_user(&db, "alice");
        let bob = test_user(&db, "bob");

        let entry = db
            .insert_calorie_entry(alice.id, &sample_entry("oats", "2024-06-15"))
            .unwrap();

        // Bob cannot delete Alice's entry, and the row survives
        assert!(!db.delete_calorie_entry(bob.id, entry.id).unwrap());
        assert_eq!(db.list_calorie_entries(alice.id).unwrap().len(), 1);

        assert!(db.delete_calorie_entry(alice.id, entry.id).unwrap());
        assert!(db.list_calorie_entries(alice.id).unwrap().is_empty());

        // Deleting again reports not found
        assert!(!db.delete_calorie_entry(alice.id, entry.id).unwrap());
    }

    #[test]
    fn test_progress_entries_listed_oldest_first() {
        let db = Database::open_in_memory().unwrap();
        let user = test_user(&db, "alice");

        db.insert_progress_entry(user.id, &sample_progress("2024-06-15", 100.0)).unwrap();
        db.insert_progress_entry(user.id, &sample_progress("2024-06-01", 95.0)).unwrap();
        db.insert_progress_entry(user.id, &sample_progress("2024-06-08", 97.5)).unwrap();

        let entries = db.list_progress_entries(user.id).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].date, "2024-06-01");
        assert_eq!(entries[1].date, "2024-06-08");
        assert_eq!(entries[2].date, "2024-06-15");
    }

    #[test]
    fn test_delete_progress_entry_owner_scoped() {
        let db = Database::open_in_memory().unwrap();
        let alice = test_user(&db, "alice");
        let bob = test_user(&db, "bob");

        let entry = db
            .insert_progress_entry(alice.id, &sample_progress("2024-06-15", 100.0))
            .unwrap();

        assert!(!db.delete_progress_entry(bob.id, entry.id).unwrap());
        assert!(db.delete_progress_entry(alice.id, entry.id).unwrap());
    }

    #[test]
    fn test_goals_absent_until_first_write() {
        let db = Database::open_in_memory().unwrap();
        let user = test_user(&db, "alice");

        // No row is created by reads
        assert!(db.get_goals(user.id).unwrap().is_none());
        assert!(db.get_goals(user.id).unwrap().is_none());
    }

    #[test]
    fn test_goals_partial_update_keeps_defaults() {
        let db = Database::open_in_memory().unwrap();
        let user = test_user(&db, "alice");

        let goals = db
            .upsert_goals(
                user.id,
                &GoalsUpdate {
                    daily_protein: Some(200.0),
                    ..GoalsUpdate::default()
                },
            )
            .unwrap();
        assert_eq!(goals.daily_protein, 200.0);
        assert_eq!(goals.daily_calories, 2000.0);

        let stored = db.get_goals(user.id).unwrap().unwrap();
        assert_eq!(stored.daily_protein, 200.0);
        assert_eq!(stored.daily_carbs, 250.0);
        assert_eq!(stored.daily_fat, 65.0);
        assert!(stored.target_weight.is_none());
    }

    #[test]
    fn test_goals_second_update_preserves_earlier_write() {
        let db = Database::open_in_memory().unwrap();
        let user = test_user(&db, "alice");

        db.upsert_goals(
            user.id,
            &GoalsUpdate {
                daily_protein: Some(200.0),
                ..GoalsUpdate::default()
            },
        )
        .unwrap();
        db.upsert_goals(
            user.id,
            &GoalsUpdate {
                target_weight: Some(Some(78.0)),
                ..GoalsUpdate::default()
            },
        )
        .unwrap();

        let stored = db.get_goals(user.id).unwrap().unwrap();
        assert_eq!(stored.daily_protein, 200.0);
        assert_eq!(stored.target_weight, Some(78.0));

        // Explicit null clears the target weight
        db.upsert_goals(
            user.id,
            &GoalsUpdate {
                target_weight: Some(None),
                ..GoalsUpdate::default()
            },
        )
        .unwrap();
        assert!(db.get_goals(user.id).unwrap().unwrap().target_weight.is_none());
    }

    #[test]
    fn test_summary_stats_empty_window() {
        let db = Database::open_in_memory().unwrap();
        let user = test_user(&db, "alice");

        let stats = db.summary_stats(user.id, 7, date("2024-06-15")).unwrap();
        assert_eq!(stats.period, "Last 7 days");
        assert_eq!(stats.nutrition.total_calories, 0.0);
        assert_eq!(stats.nutrition.avg_daily_calories, 0.0);
        assert!(stats.latest_progress.is_none());
        assert_eq!(stats.entries_count, 0);
        assert_eq!(stats.progress_entries_count, 0);
    }

    #[test]
    fn test_summary_stats_aggregates_window() {
        let db = Database::open_in_memory().unwrap();
        let user = test_user(&db, "alice");

        db.insert_calorie_entry(user.id, &sample_entry("oats", "2024-06-15")).unwrap();
        db.insert_calorie_entry(user.id, &sample_entry("eggs", "2024-06-12")).unwrap();
        // Outside the 7-day window ending 2024-06-15
        db.insert_calorie_entry(user.id, &sample_entry("old", "2024-06-01")).unwrap();

        db.insert_progress_entry(user.id, &sample_progress("2024-06-10", 95.0)).unwrap();
        db.insert_progress_entry(user.id, &sample_progress("2024-06-14", 100.0)).unwrap();

        let stats = db.summary_stats(user.id, 7, date("2024-06-15")).unwrap();
        assert_eq!(stats.entries_count, 2);
        assert!((stats.nutrition.total_calories - 500.0).abs() < 0.01);
        assert!((stats.nutrition.avg_daily_calories - 500.0 / 7.0).abs() < 0.01);
        assert!((stats.nutrition.total_protein - 40.0).abs() < 0.01);

        let latest = stats.latest_progress.unwrap();
        assert_eq!(latest.date, "2024-06-14");
        assert_eq!(latest.bench, 100.0);
        assert_eq!(stats.progress_entries_count, 2);
    }

    #[test]
    fn test_summary_stats_scoped_to_owner() {
        let db = Database::open_in_memory().unwrap();
        let alice = test_user(&db, "alice");
        let bob = test_user(&db, "bob");

        db.insert_calorie_entry(alice.id, &sample_entry("oats", "2024-06-15")).unwrap();

        let stats = db.summary_stats(bob.id, 7, date("2024-06-15")).unwrap();
        assert_eq!(stats.entries_count, 0);
        assert_eq!(stats.nutrition.total_calories, 0.0);
    }

    fn sample_record() -> NutritionRecord {
        NutritionRecord {
            food_name: "grilled chicken".to_string(),
            calories: 312.5,
            protein: 58.9,
            carbs: 0.0,
            fat: 6.8,
            serving_qty: Some(1.0),
            serving_unit: Some("breast".to_string()),
        }
    }

    #[test]
    fn test_cache_nutrition_roundtrip() {
        let db = Database::open_in_memory().unwrap();

        assert!(db.get_cached_nutrition("grilled chicken").unwrap().is_none());
        assert!(db.cache_nutrition("grilled chicken", &sample_record()).unwrap());

        let cached = db.get_cached_nutrition("grilled chicken").unwrap().unwrap();
        assert_eq!(cached, sample_record());
    }

    #[test]
    fn test_cache_nutrition_first_writer_wins() {
        let db = Database::open_in_memory().unwrap();

        assert!(db.cache_nutrition("toast", &sample_record()).unwrap());

        // A racing second write is discarded, not an error
        let mut other = sample_record();
        other.food_name = "different".to_string();
        assert!(!db.cache_nutrition("toast", &other).unwrap());

        assert_eq!(db.nutrition_cache_len().unwrap(), 1);
        let cached = db.get_cached_nutrition("toast").unwrap().unwrap();
        assert_eq!(cached.food_name, "grilled chicken");
    }

    #[test]
    fn test_delete_user_cascades_owned_rows() {
        let db = Database::open_in_memory().unwrap();
        let user = test_user(&db, "alice");

        db.insert_calorie_entry(user.id, &sample_entry("oats", "2024-06-15")).unwrap();
        db.insert_progress_entry(user.id, &sample_progress("2024-06-15", 100.0)).unwrap();
        db.upsert_goals(user.id, &GoalsUpdate::default()).unwrap();

        assert!(db.delete_user(user.id).unwrap());
        assert!(db.get_user_by_id(user.id).unwrap().is_none());
        assert!(db.list_calorie_entries(user.id).unwrap().is_empty());
        assert!(db.list_progress_entries(user.id).unwrap().is_empty());
        assert!(db.get_goals(user.id).unwrap().is_none());
    }
}
