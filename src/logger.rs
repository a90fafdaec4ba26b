//! Gateway logger.
//!
//! Unified logging seam for the relay. Entries go onto an mpsc channel;
//! a background thread wakes per burst and commits each sweep of the
//! queue to the `logs` table in one transaction. Warn/error additionally
//! echo to stderr. Background tasks log here instead of propagating
//! errors into the response path.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::sync::{mpsc, Once, RwLock};

static INIT: Once = Once::new();

#[derive(Debug, Clone)]
struct LogMessage {
    timestamp: i64,
    level: String,
    source: String,
    message: String,
}

static LOG_SENDER: RwLock<Option<mpsc::Sender<LogMessage>>> = RwLock::new(None);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub timestamp: i64,
    pub level: LogLevel,
    pub source: String,
    pub message: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct LogQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub level: Option<LogLevel>,
    pub source: Option<String>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
}

fn open_conn() -> Connection {
    Connection::open(crate::db::database_path()).expect("open log database")
}

/// Create the logs table and start the batch writer.
pub fn init() {
    INIT.call_once(|| {
        let conn = open_conn();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                level TEXT NOT NULL,
                source TEXT NOT NULL,
                message TEXT NOT NULL
            )",
            [],
        )
        .expect("create logs table");
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp DESC)",
            [],
        )
        .ok();
        conn.execute("CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level)", [])
            .ok();

        spawn_batch_writer();
    });
}

/// Largest burst committed in one transaction; anything beyond waits
/// for the next wake-up.
const MAX_BATCH: usize = 256;

/// Writer loop: sleep on the channel until an entry arrives, then sweep
/// whatever else has queued up behind it so a burst lands as a single
/// transaction. Quiet periods cost nothing; sender disconnect ends the
/// loop with the queue already drained.
fn spawn_batch_writer() {
    let (tx, rx) = mpsc::channel::<LogMessage>();

    {
        let mut sender = LOG_SENDER.write().unwrap();
        *sender = Some(tx);
    }

    std::thread::spawn(move || {
        while let Ok(first) = rx.recv() {
            let mut batch = Vec::with_capacity(8);
            batch.push(first);
            while batch.len() < MAX_BATCH {
                let Ok(next) = rx.try_recv() else {
                    break;
                };
                batch.push(next);
            }
            write_batch(&batch);
        }
    });
}

fn write_batch(batch: &[LogMessage]) {
    let mut conn = open_conn();
    let Ok(tx) = conn.transaction() else {
        return;
    };
    let inserted = {
        let Ok(mut stmt) = tx.prepare_cached(
            "INSERT INTO logs (timestamp, level, source, message) VALUES (?1, ?2, ?3, ?4)",
        ) else {
            return;
        };
        batch
            .iter()
            .filter(|msg| {
                stmt.execute(params![msg.timestamp, msg.level, msg.source, msg.message])
                    .is_ok()
            })
            .count()
    };
    if inserted > 0 {
        let _ = tx.commit();
    }
}

fn log_internal(level: LogLevel, source: &str, message: &str) {
    if matches!(level, LogLevel::Warn | LogLevel::Error) {
        eprintln!("[{}] {}: {}", level.as_str(), source, message);
    }

    let msg = LogMessage {
        timestamp: chrono::Utc::now().timestamp(),
        level: level.as_str().to_string(),
        source: source.to_string(),
        message: message.to_string(),
    };

    if let Some(sender) = LOG_SENDER.read().unwrap().as_ref() {
        let _ = sender.send(msg);
    }
    // Not initialized (unit tests, early startup): stderr echo above is all we do.
}

pub fn debug(source: &str, message: &str) {
    log_internal(LogLevel::Debug, source, message);
}

pub fn info(source: &str, message: &str) {
    log_internal(LogLevel::Info, source, message);
}

pub fn warn(source: &str, message: &str) {
    log_internal(LogLevel::Warn, source, message);
}

pub fn error(source: &str, message: &str) {
    log_internal(LogLevel::Error, source, message);
}

/// Query persisted logs for the admin surface.
pub fn query_logs(query: &LogQuery) -> Vec<LogEntry> {
    let conn = open_conn();
    let mut sql =
        String::from("SELECT id, timestamp, level, source, message FROM logs WHERE 1=1");
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(ref level) = query.level {
        sql.push_str(" AND level = ?");
        params_vec.push(Box::new(level.as_str().to_string()));
    }
    if let Some(ref source) = query.source {
        sql.push_str(" AND source = ?");
        params_vec.push(Box::new(source.clone()));
    }
    if let Some(start_time) = query.start_time {
        sql.push_str(" AND timestamp >= ?");
        params_vec.push(Box::new(start_time));
    }
    if let Some(end_time) = query.end_time {
        sql.push_str(" AND timestamp <= ?");
        params_vec.push(Box::new(end_time));
    }

    sql.push_str(" ORDER BY timestamp DESC");
    let limit = query.limit.unwrap_or(100);
    let offset = query.offset.unwrap_or(0);
    sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset));

    let Ok(mut stmt) = conn.prepare(&sql) else {
        return Vec::new();
    };
    let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();

    let rows = stmt.query_map(params_refs.as_slice(), |row| {
        let level_str: String = row.get(2)?;
        Ok(LogEntry {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            level: LogLevel::parse(&level_str).unwrap_or(LogLevel::Info),
            source: row.get(3)?,
            message: row.get(4)?,
        })
    });
    match rows {
        Ok(rows) => rows.filter_map(|r| r.ok()).collect(),
        Err(_) => Vec::new(),
    }
}

/// Delete logs older than `before_time` (unix seconds).
pub fn prune_logs(before_time: i64) -> usize {
    let conn = open_conn();
    conn.execute("DELETE FROM logs WHERE timestamp < ?1", params![before_time])
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_parse_roundtrip() {
        for level in [LogLevel::Debug, LogLevel::Info, LogLevel::Warn, LogLevel::Error] {
            assert_eq!(LogLevel::parse(level.as_str()), Some(level));
        }
        assert_eq!(LogLevel::parse("trace"), None);
    }
}
