use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::session::QuizSession;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    /// At most one live quiz session per daemon.
    pub session: Option<QuizSession>,
}
