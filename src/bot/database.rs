//! Persistent SQLite store for users, conversation turns and usage.

use crate::bot::message::{Role, Turn, UserStats};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Stored timestamp format. Lexical order equals chronological order.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// What kind of external request a usage row records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageKind {
    Text,
    Vision,
    Image,
    Chart,
}

impl UsageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageKind::Text => "text",
            UsageKind::Vision => "vision",
            UsageKind::Image => "image",
            UsageKind::Chart => "chart",
        }
    }
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Persistent SQLite database for the bot.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Create a new in-memory database.
    pub fn in_memory() -> rusqlite::Result<Self> {
        let db = Self { conn: Mutex::new(Connection::open_in_memory()?) };
        db.init_schema()?;
        Ok(db)
    }

    /// Open (or create) the database file at `path`.
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        let db = Self { conn: Mutex::new(Connection::open(path)?) };
        db.init_schema()?;

        let (users, turns) = db.counts()?;
        info!("Loaded database from {:?} ({} users, {} turns)", path, users, turns);
        Ok(db)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock leaves the connection itself usable.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn init_schema(&self) -> rusqlite::Result<()> {
        self.lock().execute_batch(r#"
            CREATE TABLE IF NOT EXISTS users (
                user_id INTEGER PRIMARY KEY,
                username TEXT,
                first_name TEXT NOT NULL,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                model TEXT
            );

            CREATE TABLE IF NOT EXISTS turns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                role TEXT NOT NULL CHECK (role IN ('user', 'model')),
                text TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS usage (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                tokens INTEGER NOT NULL DEFAULT 0,
                timestamp TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_turns_chat ON turns(chat_id, id);
            CREATE INDEX IF NOT EXISTS idx_usage_user_time ON usage(user_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_usage_time ON usage(timestamp);
        "#)
    }

    fn counts(&self) -> rusqlite::Result<(usize, usize)> {
        let conn = self.lock();
        let users: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        let turns: i64 = conn.query_row("SELECT COUNT(*) FROM turns", [], |row| row.get(0))?;
        Ok((users as usize, turns as usize))
    }

    // ==================== USER METHODS ====================

    /// Insert the user or refresh their name and last-seen time.
    pub fn touch_user(
        &self,
        user_id: i64,
        username: Option<&str>,
        first_name: &str,
        at: DateTime<Utc>,
    ) -> rusqlite::Result<()> {
        let ts = format_timestamp(at);
        self.lock().execute(
            "INSERT INTO users (user_id, username, first_name, first_seen, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(user_id) DO UPDATE SET
                username = COALESCE(?2, username),
                first_name = ?3,
                last_seen = ?4",
            params![user_id, username, first_name, ts],
        )?;
        Ok(())
    }

    /// The user's chosen model, if they picked one.
    pub fn user_model(&self, user_id: i64) -> rusqlite::Result<Option<String>> {
        self.lock()
            .query_row(
                "SELECT model FROM users WHERE user_id = ?1",
                params![user_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
            .map(Option::flatten)
    }

    pub fn set_user_model(&self, user_id: i64, model: &str) -> rusqlite::Result<bool> {
        let n = self.lock().execute(
            "UPDATE users SET model = ?2 WHERE user_id = ?1",
            params![user_id, model],
        )?;
        debug!("Model for {} set to {} ({} row)", user_id, model, n);
        Ok(n > 0)
    }

    // ==================== TURN METHODS ====================

    pub fn add_turn(
        &self,
        chat_id: i64,
        user_id: i64,
        turn: &Turn,
        at: DateTime<Utc>,
    ) -> rusqlite::Result<()> {
        self.lock().execute(
            "INSERT INTO turns (chat_id, user_id, role, text, timestamp) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![chat_id, user_id, turn.role.as_str(), turn.text, format_timestamp(at)],
        )?;
        Ok(())
    }

    /// The last `limit` turns of a chat, oldest first.
    ///
    /// Never starts with a model turn: Gemini rejects histories that do.
    pub fn recent_turns(&self, chat_id: i64, limit: usize) -> rusqlite::Result<Vec<Turn>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT role, text FROM turns WHERE chat_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![chat_id, limit as i64], |row| {
            let role: String = row.get(0)?;
            let text: String = row.get(1)?;
            Ok((role, text))
        })?;

        let mut turns = Vec::new();
        for row in rows {
            let (role, text) = row?;
            if let Some(role) = Role::parse(&role) {
                turns.push(Turn { role, text });
            }
        }
        turns.reverse();

        let first_user = turns.iter().position(|t| t.role == Role::User).unwrap_or(turns.len());
        turns.drain(..first_user);
        Ok(turns)
    }

    /// Delete a chat's history. Returns the number of turns removed.
    pub fn clear_turns(&self, chat_id: i64) -> rusqlite::Result<usize> {
        let n = self.lock().execute("DELETE FROM turns WHERE chat_id = ?1", params![chat_id])?;
        info!("🧹 Cleared {} turns in chat {}", n, chat_id);
        Ok(n)
    }

    pub fn turn_count(&self, chat_id: i64) -> rusqlite::Result<u64> {
        self.lock().query_row(
            "SELECT COUNT(*) FROM turns WHERE chat_id = ?1",
            params![chat_id],
            |row| row.get::<_, i64>(0),
        ).map(|n| n as u64)
    }

    // ==================== USAGE METHODS ====================

    pub fn record_usage(
        &self,
        user_id: i64,
        kind: UsageKind,
        tokens: u32,
        at: DateTime<Utc>,
    ) -> rusqlite::Result<()> {
        self.lock().execute(
            "INSERT INTO usage (user_id, kind, tokens, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![user_id, kind.as_str(), tokens, format_timestamp(at)],
        )?;
        Ok(())
    }

    /// Number of usage rows for a user at or after `since`.
    pub fn usage_since(&self, user_id: i64, since: DateTime<Utc>) -> rusqlite::Result<u64> {
        self.lock().query_row(
            "SELECT COUNT(*) FROM usage WHERE user_id = ?1 AND timestamp >= ?2",
            params![user_id, format_timestamp(since)],
            |row| row.get::<_, i64>(0),
        ).map(|n| n as u64)
    }

    /// Usage rows per local day at or after `since`, optionally for one user.
    pub fn daily_counts(
        &self,
        user_id: Option<i64>,
        since: DateTime<Utc>,
        tz: Tz,
    ) -> rusqlite::Result<BTreeMap<NaiveDate, u64>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT timestamp FROM usage WHERE timestamp >= ?1 AND (?2 IS NULL OR user_id = ?2)",
        )?;
        let rows = stmt.query_map(params![format_timestamp(since), user_id], |row| {
            row.get::<_, String>(0)
        })?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let ts = row?;
            // Bucketing happens in the configured zone, not in SQL (which only knows UTC).
            if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(&ts, TIMESTAMP_FORMAT) {
                let day = naive.and_utc().with_timezone(&tz).date_naive();
                *counts.entry(day).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    pub fn user_stats(&self, user_id: i64, chat_id: i64) -> rusqlite::Result<UserStats> {
        let turns = self.turn_count(chat_id)?;
        let conn = self.lock();
        let (requests, tokens, images): (i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(tokens), 0), COALESCE(SUM(kind = 'image'), 0)
             FROM usage WHERE user_id = ?1",
            params![user_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let first_seen = conn
            .query_row(
                "SELECT first_seen FROM users WHERE user_id = ?1",
                params![user_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        Ok(UserStats {
            requests: requests as u64,
            tokens: tokens as u64,
            images: images as u64,
            turns,
            first_seen,
        })
    }
}
