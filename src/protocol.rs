//! Wire types: the JSON shapes exchanged with HTTP clients and persisted in
//! `meta.json` / recording files. Kept separate from the in-memory session
//! state in `session.rs` so the on-disk/wire contract can evolve
//! independently of how a running session tracks itself.

use std::collections::HashMap;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

/// Lifecycle status of a session, as exposed over the wire and persisted in
/// `meta.json`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Running,
    Exited,
}

/// Persisted session descriptor, written atomically to `<id>/meta.json`.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub command: Vec<String>,
    pub working_dir: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub width: u16,
    pub height: u16,
    pub term: String,
    pub name: String,
    pub started_at: Timestamp,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub waiting: bool,
    /// Set once a recording append has failed; the session keeps running,
    /// but the file is no longer a complete record of the session.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub recording_truncated: bool,
}

/// `201` body for `POST /api/sessions`.
#[derive(Serialize, Debug)]
pub struct CreateSessionResponse {
    pub id: String,
}

/// `POST /api/sessions` request body.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub command: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_cols")]
    pub width: u16,
    #[serde(default = "default_rows")]
    pub height: u16,
    #[serde(default)]
    pub term: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

const fn default_cols() -> u16 {
    80
}

const fn default_rows() -> u16 {
    24
}

/// `POST /api/sessions/{id}/input` request body. Exactly one of `text` or
/// `specialKey` is expected to be set; `specialKey` takes precedence if both
/// are present.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct InputRequest {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub special_key: Option<String>,
}

/// `POST /api/sessions/{id}/resize` request body.
#[derive(Deserialize, Debug)]
pub struct ResizeRequest {
    pub cols: u16,
    pub rows: u16,
}

/// Uniform JSON error envelope returned on non-2xx responses.
#[derive(Serialize, Debug)]
pub struct ApiErrorBody {
    pub error: String,
}

/// JSON body for `GET /api/sessions/{id}/snapshot`.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotResponse {
    pub cols: u16,
    pub rows: u16,
    pub cursor_x: u16,
    pub cursor_y: u16,
    pub cursor_visible: bool,
    pub lines: Vec<String>,
}

/// Tag of one recording-file event line: `"o"` for PTY output, `"i"` for
/// input fed back to the child, `"r"` for a resize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingEventKind {
    Output,
    Input,
    Resize,
}

impl RecordingEventKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Output => "o",
            Self::Input => "i",
            Self::Resize => "r",
        }
    }
}

/// One line of a recording file after the header, encoded on the wire as the
/// flat JSON array `[tSeconds, type, payload]`
/// (`/stream`'s SSE frames are this same line, verbatim, wrapped in
/// `data: ...\n\n`, so the file and wire formats cannot drift apart).
pub fn recording_event_line(elapsed_seconds: f64, kind: RecordingEventKind, data: &str) -> String {
    serde_json::json!([elapsed_seconds, kind.as_str(), data]).to_string()
}

/// First line of every recording file, doubling as `/stream`'s first SSE
/// frame (`{"type":"header", …}`).
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RecordingHeader {
    #[serde(rename = "type")]
    pub kind: String,
    pub version: u32,
    pub width: u16,
    pub height: u16,
    pub timestamp: i64,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub env: HashMap<String, String>,
}

/// Final line written to a recording file once the child exits:
/// `["exit", exitCode, sessionId]`.
pub fn recording_exit_line(exit_code: i32, session_id: &str) -> String {
    serde_json::json!(["exit", exit_code, session_id]).to_string()
}
