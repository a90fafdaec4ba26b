//! SQLite repository.
//!
//! Per-call connections against a process-wide database path (swappable
//! for tests), WAL tuning and `create table if not exists` migrations in
//! [`init`]. Holds the persistent side of tokens, users, channels,
//! pricing and the quota ledger.

use std::path::PathBuf;
use std::sync::RwLock;

use once_cell::sync::Lazy;
use rusqlite::{params, Connection, OptionalExtension, Result};
use serde::{Deserialize, Serialize};

/// Token lifecycle states.
pub const TOKEN_STATUS_ENABLED: i64 = 1;
pub const TOKEN_STATUS_DISABLED: i64 = 2;
pub const TOKEN_STATUS_EXPIRED: i64 = 3;
pub const TOKEN_STATUS_EXHAUSTED: i64 = 4;

/// `expired_time` sentinel: never expires.
pub const TOKEN_NEVER_EXPIRES: i64 = -1;

/// User roles.
pub const ROLE_COMMON: i64 = 1;
pub const ROLE_ADMIN: i64 = 10;
pub const ROLE_ROOT: i64 = 100;

pub const USER_STATUS_ENABLED: i64 = 1;

/// Channel type discriminators (provider adapter selection and the
/// model-owner registry key).
pub mod channel_type {
    pub const OPENAI: i64 = 1;
    pub const ANTHROPIC: i64 = 14;
    pub const GEMINI: i64 = 25;
    pub const MIDJOURNEY: i64 = 27;
    pub const VERTEX_AI: i64 = 31;
}

/// Heartbeat sub-setting of a token.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HeartbeatSetting {
    pub enabled: bool,
    pub timeout_seconds: u64,
}

/// Structured per-token settings, stored as JSON in the tokens table.
///
/// `models: None` means no constraint; `Some(vec![])` means the token may
/// invoke no models at all.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TokenSetting {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub models: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
    pub heartbeat: HeartbeatSetting,
}

/// A long-lived API credential.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Token {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub key: String,
    pub status: i64,
    /// Absolute unix seconds; -1 = never, 0 accepted as "unset" on input.
    pub expired_time: i64,
    pub remain_quota: i64,
    pub unlimited_quota: bool,
    pub group: String,
    pub backup_group: String,
    pub setting: TokenSetting,
    pub created_time: i64,
    pub accessed_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub role: i64,
    pub status: i64,
    pub group: String,
    pub access_token: String,
}

/// Upstream endpoint configuration. Immutable for the duration of one
/// relayed request; the group index is rebuilt on admin mutation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub channel_type: i64,
    pub status: i64,
    pub base_url: String,
    pub api_key: String,
    pub groups: Vec<String>,
    pub models: Vec<String>,
    pub priority: i64,
    pub weight: i64,
    pub enable_search: bool,
    pub system_prompt: String,
    /// Requested model -> upstream model substitution for this channel.
    pub model_mapping: std::collections::HashMap<String, String>,
}

pub const CHANNEL_STATUS_ENABLED: i64 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserGroup {
    pub symbol: String,
    pub name: String,
    pub public: bool,
    pub ratio: f64,
}

/// One committed ledger row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub request_id: String,
    pub user_id: i64,
    pub token_id: i64,
    pub model_name: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub quota: i64,
    pub is_stream: bool,
    pub first_response_ms: Option<i64>,
    pub created_time: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Paging {
    pub page: Option<i64>,
    pub size: Option<i64>,
    pub keyword: Option<String>,
}

impl Paging {
    fn limit_offset(&self) -> (i64, i64) {
        let size = self.size.unwrap_or(20).clamp(1, 100);
        let page = self.page.unwrap_or(1).max(1);
        (size, (page - 1) * size)
    }
}

static DB_PATH: Lazy<RwLock<PathBuf>> = Lazy::new(|| RwLock::new(default_path()));

fn default_path() -> PathBuf {
    let mut p = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    p.push("relayhub");
    std::fs::create_dir_all(&p).ok();
    p.push("relayhub.db");
    p
}

/// Current database path (shared with the logger).
pub fn database_path() -> PathBuf {
    DB_PATH.read().unwrap().clone()
}

/// Point the repository at a different file (tests).
pub fn set_database_path(path: PathBuf) {
    *DB_PATH.write().unwrap() = path;
}

fn open_conn() -> Result<Connection> {
    let conn = Connection::open(database_path())?;
    conn.pragma_update(None, "journal_mode", "WAL").ok();
    conn.pragma_update(None, "synchronous", "NORMAL").ok();
    conn.pragma_update(None, "busy_timeout", "5000").ok();
    Ok(conn)
}

/// Create all tables and seed the default public group.
pub fn init() -> Result<()> {
    let conn = open_conn()?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL UNIQUE,
            role INTEGER NOT NULL DEFAULT 1,
            status INTEGER NOT NULL DEFAULT 1,
            user_group TEXT NOT NULL DEFAULT 'default',
            access_token TEXT NOT NULL DEFAULT ''
        );
        CREATE TABLE IF NOT EXISTS tokens (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            name TEXT NOT NULL DEFAULT '',
            key TEXT NOT NULL UNIQUE,
            status INTEGER NOT NULL DEFAULT 1,
            expired_time INTEGER NOT NULL DEFAULT -1,
            remain_quota INTEGER NOT NULL DEFAULT 0,
            unlimited_quota INTEGER NOT NULL DEFAULT 0,
            token_group TEXT NOT NULL DEFAULT '',
            backup_group TEXT NOT NULL DEFAULT '',
            setting TEXT NOT NULL DEFAULT '{}',
            created_time INTEGER NOT NULL DEFAULT 0,
            accessed_time INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_tokens_user ON tokens(user_id);
        CREATE TABLE IF NOT EXISTS channels (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            channel_type INTEGER NOT NULL,
            status INTEGER NOT NULL DEFAULT 1,
            base_url TEXT NOT NULL DEFAULT '',
            api_key TEXT NOT NULL DEFAULT '',
            groups TEXT NOT NULL DEFAULT '[]',
            models TEXT NOT NULL DEFAULT '[]',
            priority INTEGER NOT NULL DEFAULT 0,
            weight INTEGER NOT NULL DEFAULT 1,
            enable_search INTEGER NOT NULL DEFAULT 0,
            system_prompt TEXT NOT NULL DEFAULT '',
            model_mapping TEXT NOT NULL DEFAULT '{}'
        );
        CREATE TABLE IF NOT EXISTS user_groups (
            symbol TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            public INTEGER NOT NULL DEFAULT 0,
            ratio REAL NOT NULL DEFAULT 1.0
        );
        CREATE TABLE IF NOT EXISTS model_prices (
            model TEXT PRIMARY KEY,
            channel_type INTEGER NOT NULL,
            input REAL NOT NULL DEFAULT 0,
            output REAL NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS model_owners (
            channel_type INTEGER PRIMARY KEY,
            name TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS quota_ledger (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            request_id TEXT NOT NULL,
            user_id INTEGER NOT NULL,
            token_id INTEGER NOT NULL,
            model_name TEXT NOT NULL,
            prompt_tokens INTEGER NOT NULL,
            completion_tokens INTEGER NOT NULL,
            quota INTEGER NOT NULL,
            is_stream INTEGER NOT NULL,
            first_response_ms INTEGER,
            created_time INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_ledger_token ON quota_ledger(token_id, created_time DESC);",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO user_groups (symbol, name, public, ratio) VALUES ('default', 'Default', 1, 1.0)",
        [],
    )?;
    Ok(())
}

fn row_to_token(row: &rusqlite::Row<'_>) -> Result<Token> {
    let setting_raw: String = row.get(10)?;
    Ok(Token {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        key: row.get(3)?,
        status: row.get(4)?,
        expired_time: row.get(5)?,
        remain_quota: row.get(6)?,
        unlimited_quota: row.get::<_, i64>(7)? != 0,
        group: row.get(8)?,
        backup_group: row.get(9)?,
        setting: serde_json::from_str(&setting_raw).unwrap_or_default(),
        created_time: row.get(11)?,
        accessed_time: row.get(12)?,
    })
}

const TOKEN_COLS: &str = "id, user_id, name, key, status, expired_time, remain_quota, \
     unlimited_quota, token_group, backup_group, setting, created_time, accessed_time";

pub fn get_user_tokens_list(user_id: i64, paging: &Paging) -> Result<Vec<Token>> {
    let conn = open_conn()?;
    let (limit, offset) = paging.limit_offset();
    let keyword = format!("%{}%", paging.keyword.clone().unwrap_or_default());
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {TOKEN_COLS} FROM tokens WHERE user_id = ?1 AND name LIKE ?2 \
         ORDER BY id DESC LIMIT ?3 OFFSET ?4"
    ))?;
    let rows = stmt.query_map(params![user_id, keyword, limit, offset], row_to_token)?;
    rows.collect()
}

pub fn get_token_by_ids(id: i64, user_id: i64) -> Result<Option<Token>> {
    let conn = open_conn()?;
    let result = conn
        .prepare_cached(&format!(
            "SELECT {TOKEN_COLS} FROM tokens WHERE id = ?1 AND user_id = ?2"
        ))?
        .query_row(params![id, user_id], row_to_token)
        .optional();
    result
}

pub fn get_token_by_name(name: &str, user_id: i64) -> Result<Option<Token>> {
    let conn = open_conn()?;
    let result = conn
        .prepare_cached(&format!(
            "SELECT {TOKEN_COLS} FROM tokens WHERE name = ?1 AND user_id = ?2"
        ))?
        .query_row(params![name, user_id], row_to_token)
        .optional();
    result
}

pub fn get_token_by_key(key: &str) -> Result<Option<Token>> {
    let conn = open_conn()?;
    let result = conn
        .prepare_cached(&format!("SELECT {TOKEN_COLS} FROM tokens WHERE key = ?1"))?
        .query_row(params![key], row_to_token)
        .optional();
    result
}

pub fn insert_token(token: &Token) -> Result<i64> {
    let conn = open_conn()?;
    conn.execute(
        "INSERT INTO tokens (user_id, name, key, status, expired_time, remain_quota, \
         unlimited_quota, token_group, backup_group, setting, created_time, accessed_time) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            token.user_id,
            token.name,
            token.key,
            token.status,
            token.expired_time,
            token.remain_quota,
            token.unlimited_quota as i64,
            token.group,
            token.backup_group,
            serde_json::to_string(&token.setting).unwrap_or_else(|_| "{}".to_string()),
            token.created_time,
            token.accessed_time,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn update_token(token: &Token) -> Result<()> {
    let conn = open_conn()?;
    conn.execute(
        "UPDATE tokens SET name = ?1, status = ?2, expired_time = ?3, remain_quota = ?4, \
         unlimited_quota = ?5, token_group = ?6, backup_group = ?7, setting = ?8 \
         WHERE id = ?9 AND user_id = ?10",
        params![
            token.name,
            token.status,
            token.expired_time,
            token.remain_quota,
            token.unlimited_quota as i64,
            token.group,
            token.backup_group,
            serde_json::to_string(&token.setting).unwrap_or_else(|_| "{}".to_string()),
            token.id,
            token.user_id,
        ],
    )?;
    Ok(())
}

pub fn update_token_status(id: i64, status: i64) -> Result<()> {
    let conn = open_conn()?;
    conn.execute(
        "UPDATE tokens SET status = ?1 WHERE id = ?2",
        params![status, id],
    )?;
    Ok(())
}

pub fn delete_token(id: i64, user_id: i64) -> Result<bool> {
    let conn = open_conn()?;
    let n = conn.execute(
        "DELETE FROM tokens WHERE id = ?1 AND user_id = ?2",
        params![id, user_id],
    )?;
    Ok(n > 0)
}

/// Best-effort read-path touch; callers ignore the result.
pub fn bump_accessed_time(id: i64) -> Result<()> {
    let conn = open_conn()?;
    conn.execute(
        "UPDATE tokens SET accessed_time = ?1 WHERE id = ?2",
        params![chrono::Utc::now().timestamp(), id],
    )?;
    Ok(())
}

/// Atomically reserve `amount` units of a token's quota.
///
/// The conditional UPDATE is the §5 atomicity point: of two concurrent
/// requests that together would overdraw, exactly one sees `false`.
/// Unlimited tokens always succeed without a decrement.
pub fn pre_consume_token_quota(token_id: i64, amount: i64) -> Result<bool> {
    if amount <= 0 {
        return Ok(true);
    }
    let conn = open_conn()?;
    let unlimited: Option<i64> = conn
        .prepare_cached("SELECT unlimited_quota FROM tokens WHERE id = ?1")?
        .query_row(params![token_id], |r| r.get(0))
        .optional()?;
    match unlimited {
        None => Ok(false),
        Some(v) if v != 0 => Ok(true),
        Some(_) => {
            let n = conn.execute(
                "UPDATE tokens SET remain_quota = remain_quota - ?1 \
                 WHERE id = ?2 AND remain_quota >= ?1",
                params![amount, token_id],
            )?;
            Ok(n > 0)
        }
    }
}

/// Return `amount` units to a token. Negative amounts charge extra (the
/// actual cost exceeded the reservation).
pub fn refund_token_quota(token_id: i64, amount: i64) -> Result<()> {
    if amount == 0 {
        return Ok(());
    }
    let conn = open_conn()?;
    conn.execute(
        "UPDATE tokens SET remain_quota = remain_quota + ?1 \
         WHERE id = ?2 AND unlimited_quota = 0",
        params![amount, token_id],
    )?;
    Ok(())
}

pub fn token_remain_quota(token_id: i64) -> Result<Option<i64>> {
    let conn = open_conn()?;
    let result = conn
        .prepare_cached("SELECT remain_quota FROM tokens WHERE id = ?1")?
        .query_row(params![token_id], |r| r.get(0))
        .optional();
    result
}

pub fn insert_ledger(entry: &LedgerEntry) -> Result<()> {
    let conn = open_conn()?;
    conn.execute(
        "INSERT INTO quota_ledger (request_id, user_id, token_id, model_name, prompt_tokens, \
         completion_tokens, quota, is_stream, first_response_ms, created_time) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            entry.request_id,
            entry.user_id,
            entry.token_id,
            entry.model_name,
            entry.prompt_tokens,
            entry.completion_tokens,
            entry.quota,
            entry.is_stream as i64,
            entry.first_response_ms,
            entry.created_time,
        ],
    )?;
    Ok(())
}

pub fn recent_ledger(limit: i64, offset: i64) -> Result<Vec<LedgerEntry>> {
    let conn = open_conn()?;
    let mut stmt = conn.prepare_cached(
        "SELECT request_id, user_id, token_id, model_name, prompt_tokens, completion_tokens, \
         quota, is_stream, first_response_ms, created_time FROM quota_ledger \
         ORDER BY created_time DESC LIMIT ?1 OFFSET ?2",
    )?;
    let rows = stmt.query_map(params![limit, offset], |row| {
        Ok(LedgerEntry {
            request_id: row.get(0)?,
            user_id: row.get(1)?,
            token_id: row.get(2)?,
            model_name: row.get(3)?,
            prompt_tokens: row.get(4)?,
            completion_tokens: row.get(5)?,
            quota: row.get(6)?,
            is_stream: row.get::<_, i64>(7)? != 0,
            first_response_ms: row.get(8)?,
            created_time: row.get(9)?,
        })
    })?;
    rows.collect()
}

fn row_to_user(row: &rusqlite::Row<'_>) -> Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        role: row.get(2)?,
        status: row.get(3)?,
        group: row.get(4)?,
        access_token: row.get(5)?,
    })
}

const USER_COLS: &str = "id, username, role, status, user_group, access_token";

pub fn get_user(id: i64) -> Result<Option<User>> {
    let conn = open_conn()?;
    let result = conn
        .prepare_cached(&format!("SELECT {USER_COLS} FROM users WHERE id = ?1"))?
        .query_row(params![id], row_to_user)
        .optional();
    result
}

pub fn is_admin(user_id: i64) -> bool {
    get_user(user_id)
        .ok()
        .flatten()
        .map_or(false, |u| u.role >= ROLE_ADMIN)
}

/// Resolve an admin-surface bearer access token to its user.
pub fn validate_access_token(bearer: &str) -> Result<Option<User>> {
    let token = bearer.trim_start_matches("Bearer ").trim();
    if token.is_empty() {
        return Ok(None);
    }
    let conn = open_conn()?;
    let result = conn
        .prepare_cached(&format!(
            "SELECT {USER_COLS} FROM users WHERE access_token = ?1 AND status = ?2"
        ))?
        .query_row(params![token, USER_STATUS_ENABLED], row_to_user)
        .optional();
    result
}

pub fn insert_user(user: &User) -> Result<i64> {
    let conn = open_conn()?;
    conn.execute(
        "INSERT INTO users (username, role, status, user_group, access_token) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![user.username, user.role, user.status, user.group, user.access_token],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_user_group(user_id: i64) -> Result<Option<String>> {
    let conn = open_conn()?;
    let result = conn
        .prepare_cached("SELECT user_group FROM users WHERE id = ?1")?
        .query_row(params![user_id], |r| r.get(0))
        .optional();
    result
}

fn row_to_channel(row: &rusqlite::Row<'_>) -> Result<Channel> {
    let groups_raw: String = row.get(6)?;
    let models_raw: String = row.get(7)?;
    let mapping_raw: String = row.get(12)?;
    Ok(Channel {
        id: row.get(0)?,
        name: row.get(1)?,
        channel_type: row.get(2)?,
        status: row.get(3)?,
        base_url: row.get(4)?,
        api_key: row.get(5)?,
        groups: serde_json::from_str(&groups_raw).unwrap_or_default(),
        models: serde_json::from_str(&models_raw).unwrap_or_default(),
        priority: row.get(8)?,
        weight: row.get(9)?,
        enable_search: row.get::<_, i64>(10)? != 0,
        system_prompt: row.get(11)?,
        model_mapping: serde_json::from_str(&mapping_raw).unwrap_or_default(),
    })
}

const CHANNEL_COLS: &str = "id, name, channel_type, status, base_url, api_key, groups, models, \
     priority, weight, enable_search, system_prompt, model_mapping";

/// All enabled channels, for the group index rebuild.
pub fn list_enabled_channels() -> Result<Vec<Channel>> {
    let conn = open_conn()?;
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {CHANNEL_COLS} FROM channels WHERE status = ?1 ORDER BY id"
    ))?;
    let rows = stmt.query_map(params![CHANNEL_STATUS_ENABLED], row_to_channel)?;
    rows.collect()
}

pub fn insert_channel(channel: &Channel) -> Result<i64> {
    let conn = open_conn()?;
    conn.execute(
        "INSERT INTO channels (name, channel_type, status, base_url, api_key, groups, models, \
         priority, weight, enable_search, system_prompt, model_mapping) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            channel.name,
            channel.channel_type,
            channel.status,
            channel.base_url,
            channel.api_key,
            serde_json::to_string(&channel.groups).unwrap_or_else(|_| "[]".to_string()),
            serde_json::to_string(&channel.models).unwrap_or_else(|_| "[]".to_string()),
            channel.priority,
            channel.weight,
            channel.enable_search as i64,
            channel.system_prompt,
            serde_json::to_string(&channel.model_mapping).unwrap_or_else(|_| "{}".to_string()),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_group_by_symbol(symbol: &str) -> Result<Option<UserGroup>> {
    let conn = open_conn()?;
    let result = conn
        .prepare_cached("SELECT symbol, name, public, ratio FROM user_groups WHERE symbol = ?1")?
        .query_row(params![symbol], |row| {
            Ok(UserGroup {
                symbol: row.get(0)?,
                name: row.get(1)?,
                public: row.get::<_, i64>(2)? != 0,
                ratio: row.get(3)?,
            })
        })
        .optional();
    result
}

pub fn public_group_symbols() -> Result<Vec<String>> {
    let conn = open_conn()?;
    let mut stmt =
        conn.prepare_cached("SELECT symbol FROM user_groups WHERE public = 1 ORDER BY symbol")?;
    let rows = stmt.query_map([], |r| r.get(0))?;
    rows.collect()
}

pub fn upsert_user_group(group: &UserGroup) -> Result<()> {
    let conn = open_conn()?;
    conn.execute(
        "INSERT INTO user_groups (symbol, name, public, ratio) VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT(symbol) DO UPDATE SET name = excluded.name, public = excluded.public, \
         ratio = excluded.ratio",
        params![group.symbol, group.name, group.public as i64, group.ratio],
    )?;
    Ok(())
}

pub fn upsert_model_price(model: &str, channel_type: i64, input: f64, output: f64) -> Result<()> {
    let conn = open_conn()?;
    conn.execute(
        "INSERT INTO model_prices (model, channel_type, input, output) VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT(model) DO UPDATE SET channel_type = excluded.channel_type, \
         input = excluded.input, output = excluded.output",
        params![model, channel_type, input, output],
    )?;
    Ok(())
}

pub fn load_model_prices() -> Result<Vec<(String, i64, f64, f64)>> {
    let conn = open_conn()?;
    let mut stmt = conn.prepare_cached("SELECT model, channel_type, input, output FROM model_prices")?;
    let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))?;
    rows.collect()
}

pub fn upsert_model_owner(channel_type: i64, name: &str) -> Result<()> {
    let conn = open_conn()?;
    conn.execute(
        "INSERT INTO model_owners (channel_type, name) VALUES (?1, ?2) \
         ON CONFLICT(channel_type) DO UPDATE SET name = excluded.name",
        params![channel_type, name],
    )?;
    Ok(())
}

pub fn load_model_owners() -> Result<Vec<(i64, String)>> {
    let conn = open_conn()?;
    let mut stmt = conn.prepare_cached("SELECT channel_type, name FROM model_owners")?;
    let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
    rows.collect()
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    /// Serializes tests that share the process-wide db path.
    static DB_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    pub fn lock() -> std::sync::MutexGuard<'static, ()> {
        DB_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Point the repository at a fresh temp database and run migrations.
    /// Returns the guard keeping the file alive.
    pub fn fresh_db() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        set_database_path(dir.path().join("test.db"));
        init().expect("init test db");
        dir
    }

    pub fn seed_user(role: i64, group: &str) -> i64 {
        insert_user(&User {
            id: 0,
            username: format!("user-{}", uuid::Uuid::new_v4()),
            role,
            status: USER_STATUS_ENABLED,
            group: group.to_string(),
            access_token: uuid::Uuid::new_v4().to_string(),
        })
        .expect("insert user")
    }

    pub fn seed_token(user_id: i64, key: &str, quota: i64) -> i64 {
        let now = chrono::Utc::now().timestamp();
        insert_token(&Token {
            id: 0,
            user_id,
            name: "test".to_string(),
            key: key.to_string(),
            status: TOKEN_STATUS_ENABLED,
            expired_time: TOKEN_NEVER_EXPIRES,
            remain_quota: quota,
            unlimited_quota: false,
            group: "default".to_string(),
            backup_group: String::new(),
            setting: TokenSetting::default(),
            created_time: now,
            accessed_time: now,
        })
        .expect("insert token")
    }
}
