//! Persistent agent sessions
//!
//! One JSON file per session, so a conversation can be listed and resumed.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::exchange::ChatExchange;
use crate::llm::Usage;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub created_at: String,
    pub updated_at: String,
    /// The request that started the session
    pub task: String,
    pub model: String,
    /// Units whose tools were offered
    #[serde(default)]
    pub units: Vec<String>,
    pub exchange: ChatExchange,
    pub iterations: usize,
    #[serde(default)]
    pub usage: Usage,
    pub complete: bool,
}

impl Session {
    pub fn new(task: impl Into<String>, model: impl Into<String>) -> Self {
        let now = timestamp();
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            created_at: now.clone(),
            updated_at: now,
            task: task.into(),
            model: model.into(),
            units: Vec::new(),
            exchange: ChatExchange::new(),
            iterations: 0,
            usage: Usage::default(),
            complete: false,
        }
    }

    /// Fold a finished run into the session
    pub fn record_run(&mut self, exchange: ChatExchange, iterations: usize, usage: &Usage, complete: bool) {
        self.exchange = exchange;
        self.iterations += iterations;
        self.usage.add(usage);
        self.complete = complete;
        self.updated_at = timestamp();
    }
}

pub struct SessionStore {
    base_dir: PathBuf,
}

impl SessionStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    /// `~/.toolsmith/sessions`
    pub fn default_store() -> std::io::Result<Self> {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Self::new(PathBuf::from(home).join(".toolsmith").join("sessions"))
    }

    pub fn dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn save(&self, session: &Session) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(session).map_err(std::io::Error::other)?;
        std::fs::write(self.session_path(&session.id), json)
    }

    pub fn load(&self, session_id: &str) -> std::io::Result<Session> {
        load_from_path(&self.session_path(session_id))
    }

    /// Newest first; unreadable files are skipped
    pub fn list(&self) -> std::io::Result<Vec<SessionSummary>> {
        let mut sessions = Vec::new();
        for entry in std::fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "json") {
                match load_from_path(&path) {
                    Ok(session) => sessions.push(SessionSummary {
                        id: session.id,
                        task: truncate(&session.task, 50),
                        created_at: session.created_at,
                        iterations: session.iterations,
                        tokens: session.usage.total_tokens(),
                        complete: session.complete,
                    }),
                    Err(e) => tracing::debug!(path = %path.display(), error = %e, "Skipping session file"),
                }
            }
        }
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(sessions)
    }

    pub fn delete(&self, session_id: &str) -> std::io::Result<()> {
        std::fs::remove_file(self.session_path(session_id))
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.base_dir.join(format!("{session_id}.json"))
    }
}

fn load_from_path(path: &Path) -> std::io::Result<Session> {
    let json = std::fs::read_to_string(path)?;
    serde_json::from_str(&json).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub task: String,
    pub created_at: String,
    pub iterations: usize,
    pub tokens: u64,
    pub complete: bool,
}

/// UTC `YYYY-MM-DD HH:MM:SS`
fn timestamp() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format_utc(secs)
}

fn format_utc(secs: u64) -> String {
    let days = (secs / 86_400) as i64;
    let rem = secs % 86_400;
    // Civil date from days since 1970-01-01 (proleptic Gregorian)
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + i64::from(month <= 2);
    format!(
        "{year:04}-{month:02}-{day:02} {:02}:{:02}:{:02}",
        rem / 3_600,
        (rem % 3_600) / 60,
        rem % 60
    )
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{head}...")
    }
}
