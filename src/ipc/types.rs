use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

/// One request line on stdin: `{"id", "method", "params"}`. Responses echo
/// the id back so the UI can run calls concurrently over the single pipe.
#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Everything rosterd holds between requests: the selected workspace and
/// its open roster database. Both stay None until `workspace.select`.
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
}
