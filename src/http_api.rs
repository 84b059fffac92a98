//! HttpApi (C6) + StreamEndpoints (C7): the control HTTP surface.
//!
//! Transport is `http_server.rs`'s hand-rolled `HttpServer` (raw
//! `TcpListener` + `http` crate types, one worker thread per accepted
//! connection via `thread::spawn`) rather than a framework like
//! `hyper`/`axum`. This module owns routing, JSON (de)serialization, the
//! Basic-auth gate, and static asset serving.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use data_encoding::BASE64;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::Error;
use crate::http_server::{status_line, HttpRequest, HttpServer, Method, Response, StatusCode};
use crate::protocol::{
    ApiErrorBody, CreateSessionRequest, CreateSessionResponse, InputRequest, ResizeRequest,
    SnapshotResponse,
};
use crate::registry::SessionRegistry;
use crate::session::SubscriberMsg;
use crate::special_keys::key_to_bytes;

pub fn serve(config: Arc<ServerConfig>, registry: Arc<SessionRegistry>) -> Result<(), anyhow::Error> {
    fs::create_dir_all(registry.control_path())?;
    registry.reconcile_on_start();

    let server = HttpServer::bind(config.bind_addr())
        .map_err(|err| anyhow::anyhow!("failed to bind {}: {err}", config.bind_addr()))?;

    if config.password.is_some() {
        info!(addr = %config.bind_addr(), "HTTP API listening with Basic Auth enabled");
    } else {
        info!(addr = %config.bind_addr(), "HTTP API listening with no authentication");
    }

    for incoming in server.incoming() {
        let config = Arc::clone(&config);
        let registry = Arc::clone(&registry);
        thread::spawn(move || {
            let mut req = match incoming {
                Ok(req) => req,
                Err(err) => {
                    warn!(%err, "failed to read request");
                    return;
                }
            };
            handle_connection(&mut req, &config, &registry);
        });
    }

    Ok(())
}

fn handle_connection(req: &mut HttpRequest, config: &ServerConfig, registry: &Arc<SessionRegistry>) {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!(%method, %path, "request");

    // `--password` gates `/api/*` only; static dashboard assets (and the
    // bare `/api/health` probe) stay reachable unauthenticated.
    if let Some(ref expected) = config.password {
        if path.starts_with("/api/") && path != "/api/health" && !check_basic_auth(req, expected) {
            let _ = req.respond_json(unauthorized_response());
            return;
        }
    }

    if method == Method::GET && !path.starts_with("/api/") {
        if let Some(static_path) = &config.static_path {
            if let Some(response) = serve_static_file(static_path, &path) {
                let _ = req.respond_json(response);
                return;
            }
        }
    }

    if method == Method::GET && path == "/api/sessions" {
        return respond(req, handle_list_sessions(registry));
    }
    if method == Method::POST && path == "/api/sessions" {
        return respond(req, handle_create_session(req, registry));
    }
    if method == Method::POST && path == "/api/cleanup-exited" {
        return respond(req, handle_cleanup_exited(registry));
    }
    if method == Method::GET && path == "/api/health" {
        return respond(req, handle_health());
    }

    if let Some((id, suffix)) = split_session_path(&path) {
        match (&method, suffix) {
            (&Method::GET, "") => return respond(req, handle_get_session(registry, &id)),
            (&Method::DELETE, "") => return respond(req, handle_delete_session(registry, &id)),
            (&Method::POST, "/input") => return respond(req, handle_input(req, registry, &id)),
            (&Method::POST, "/resize") => return respond(req, handle_resize(req, registry, &id)),
            (&Method::GET, "/snapshot") => return respond(req, handle_snapshot(registry, &id)),
            (&Method::GET, "/buffer") => return respond(req, handle_buffer(req, registry, &id)),
            (&Method::GET, "/stream") => {
                handle_stream(req, registry, &id);
                return;
            }
            _ => {}
        }
    }

    let _ = req.respond_json(error_response(Error::NotFound(format!("no route for {path}"))));
}

fn respond(req: &mut HttpRequest, result: Result<Response<Vec<u8>>, Error>) {
    let response = result.unwrap_or_else(error_response);
    if let Err(err) = req.respond_json(response) {
        debug!(%err, "failed to write response (client likely disconnected)");
    }
}

fn error_response(err: Error) -> Response<Vec<u8>> {
    let body = ApiErrorBody {
        error: err.to_string(),
    };
    json_response(err.status_code(), &body)
}

fn json_response<T: Serialize>(status: StatusCode, data: &T) -> Response<Vec<u8>> {
    let body = serde_json::to_vec(data).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(body)
        .expect("static response components are always valid")
}

fn handle_health() -> Result<Response<Vec<u8>>, Error> {
    Ok(json_response(StatusCode::OK, &serde_json::json!({"status": "ok"})))
}

fn handle_list_sessions(registry: &SessionRegistry) -> Result<Response<Vec<u8>>, Error> {
    let list = registry.list()?;
    Ok(json_response(StatusCode::OK, &list))
}

fn handle_create_session(
    req: &mut HttpRequest,
    registry: &SessionRegistry,
) -> Result<Response<Vec<u8>>, Error> {
    let create_req: CreateSessionRequest = parse_json_body(req)?;
    if create_req.command.is_empty() {
        return Err(Error::BadRequest("command must not be empty".to_string()));
    }
    if let Some(dir) = &create_req.working_dir {
        if dir.is_empty() || !dir.starts_with('/') {
            return Err(Error::BadRequest("workingDir must be a non-empty absolute path".to_string()));
        }
        if !Path::new(dir).is_dir() {
            return Err(Error::BadRequest(format!("working directory does not exist: {dir}")));
        }
    }

    let id = registry.create(create_req)?;
    Ok(json_response(StatusCode::CREATED, &CreateSessionResponse { id }))
}

fn handle_get_session(registry: &SessionRegistry, id: &str) -> Result<Response<Vec<u8>>, Error> {
    let info = registry.get(id)?;
    Ok(json_response(StatusCode::OK, &info))
}

fn handle_delete_session(registry: &SessionRegistry, id: &str) -> Result<Response<Vec<u8>>, Error> {
    registry.delete(id)?;
    Ok(json_response(StatusCode::OK, &serde_json::json!({})))
}

fn handle_input(
    req: &mut HttpRequest,
    registry: &SessionRegistry,
    id: &str,
) -> Result<Response<Vec<u8>>, Error> {
    let body: InputRequest = parse_json_body(req)?;
    let bytes = if let Some(key) = body.special_key {
        key_to_bytes(&key)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| Error::BadRequest(format!("unknown special key: {key}")))?
    } else if let Some(text) = body.text {
        text.into_bytes()
    } else {
        return Err(Error::BadRequest("input requires `text` or `specialKey`".to_string()));
    };

    let session = registry
        .get_live(id)
        .ok_or_else(|| match registry.get(id) {
            Ok(_) => Error::Conflict(format!("session {id} has exited")),
            Err(_) => Error::NotFound(format!("session {id} not found")),
        })?;
    session.send_input(bytes)?;
    Ok(json_response(StatusCode::OK, &serde_json::json!({})))
}

fn handle_resize(
    req: &mut HttpRequest,
    registry: &SessionRegistry,
    id: &str,
) -> Result<Response<Vec<u8>>, Error> {
    let body: ResizeRequest = parse_json_body(req)?;
    if body.cols < 1 || body.rows < 1 {
        return Err(Error::BadRequest("cols and rows must be >= 1".to_string()));
    }

    let session = registry
        .get_live(id)
        .ok_or_else(|| match registry.get(id) {
            Ok(_) => Error::Conflict(format!("session {id} has exited")),
            Err(_) => Error::NotFound(format!("session {id} not found")),
        })?;
    session.resize(body.cols, body.rows)?;
    Ok(json_response(StatusCode::OK, &serde_json::json!({})))
}

fn handle_cleanup_exited(registry: &SessionRegistry) -> Result<Response<Vec<u8>>, Error> {
    let removed = registry.cleanup_exited()?;
    Ok(json_response(StatusCode::OK, &serde_json::json!({"removed": removed})))
}

fn handle_snapshot(registry: &SessionRegistry, id: &str) -> Result<Response<Vec<u8>>, Error> {
    let session = registry
        .get_live(id)
        .ok_or_else(|| Error::NotFound(format!("session {id} not found")))?;
    let snapshot = session.snapshot();
    let (cursor_x, cursor_y, cursor_visible) = session.cursor_position();
    let response = SnapshotResponse {
        cols: snapshot.cols,
        rows: snapshot.rows,
        cursor_x,
        cursor_y,
        cursor_visible,
        lines: session.lines(),
    };
    Ok(json_response(StatusCode::OK, &response))
}

#[derive(Deserialize, Default)]
struct BufferQuery {
    #[serde(rename = "viewportY", default)]
    viewport_y: u16,
    #[serde(default)]
    #[allow(dead_code)]
    lines: Option<u16>,
}

fn handle_buffer(
    req: &HttpRequest,
    registry: &SessionRegistry,
    id: &str,
) -> Result<Response<Vec<u8>>, Error> {
    let session = registry
        .get_live(id)
        .ok_or_else(|| Error::NotFound(format!("session {id} not found")))?;
    let query: BufferQuery = req
        .uri()
        .query()
        .map(serde_urlencoded::from_str)
        .transpose()
        .map_err(|err| Error::BadRequest(format!("invalid query: {err}")))?
        .unwrap_or_default();

    let snapshot = session.terminal_snapshot(query.viewport_y);
    let body = snapshot.encode();
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/octet-stream")
        .header("Access-Control-Allow-Origin", "*")
        .body(body)
        .expect("static response components are always valid"))
}

/// `GET /api/sessions/{id}/stream`: replays the on-disk recording, then
/// switches to live events with no gap or duplication. The
/// replay/live boundary is whatever `Session::subscribe` captured under its
/// single recording lock, so nothing written after that call is skipped or
/// doubled. Writes directly to the connection as frames become available
/// rather than building one `Response`, since the body length isn't known
/// up front; a write failure (client gone) ends the loop and drops the
/// subscriber.
fn handle_stream(req: &mut HttpRequest, registry: &SessionRegistry, id: &str) {
    let session = match registry.get_live(id) {
        Some(session) => session,
        None => {
            let _ = req.respond_json(error_response(Error::NotFound(format!("session {id} not found"))));
            return;
        }
    };

    let (replay, rx) = match session.subscribe() {
        Ok(pair) => pair,
        Err(err) => {
            let _ = req.respond_json(error_response(err));
            return;
        }
    };

    let mut head = status_line(StatusCode::OK);
    head.extend_from_slice(b"Content-Type: text/event-stream\r\n");
    head.extend_from_slice(b"Cache-Control: no-cache\r\n");
    head.extend_from_slice(b"Connection: close\r\n");
    head.extend_from_slice(b"Access-Control-Allow-Origin: *\r\n\r\n");
    if req.respond(head).is_err() {
        return;
    }

    for line in replay {
        if req.respond(sse_frame(&line)).is_err() {
            return;
        }
    }

    loop {
        match rx.recv_timeout(std::time::Duration::from_secs(15)) {
            Ok(SubscriberMsg::Event(line)) => {
                if req.respond(sse_frame(&line)).is_err() {
                    return;
                }
            }
            Ok(SubscriberMsg::Exit(_)) => {
                // The exit marker line was already published as an Event
                // (see session.rs::finalize_exit); this variant just tells
                // us the stream is over.
                return;
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                // keep-alive comment, at most every 15s
                if req.respond(b":\n\n".as_slice()).is_err() {
                    return;
                }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn sse_frame(line: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(line.len() + 8);
    out.extend_from_slice(b"data: ");
    out.extend_from_slice(line.as_bytes());
    out.extend_from_slice(b"\n\n");
    out
}

fn parse_json_body<T: serde::de::DeserializeOwned>(req: &HttpRequest) -> Result<T, Error> {
    if req.body().is_empty() {
        return serde_json::from_str("{}").map_err(Into::into);
    }
    serde_json::from_slice(req.body()).map_err(Into::into)
}

fn check_basic_auth(req: &HttpRequest, expected_password: &str) -> bool {
    let Some(header) = req.headers().get("authorization") else {
        return false;
    };
    let Ok(value) = header.to_str() else {
        return false;
    };
    let Some(credentials) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = BASE64.decode(credentials.as_bytes()) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    decoded
        .split_once(':')
        .is_some_and(|(_, password)| password == expected_password)
}

fn unauthorized_response() -> Response<Vec<u8>> {
    Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header("WWW-Authenticate", "Basic realm=\"termrelay\"")
        .header("Content-Type", "text/plain")
        .body(b"Unauthorized".to_vec())
        .expect("static response components are always valid")
}

fn get_mime_type(file_path: &Path) -> &'static str {
    match file_path.extension().and_then(|ext| ext.to_str()) {
        Some("html" | "htm") => "text/html",
        Some("css") => "text/css",
        Some("js" | "mjs") => "application/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        _ => "application/octet-stream",
    }
}

fn serve_static_file(static_root: &Path, request_path: &str) -> Option<Response<Vec<u8>>> {
    if request_path.contains("..") {
        return None;
    }

    let cleaned = request_path.trim_start_matches('/');
    let file_path = static_root.join(cleaned);
    if !file_path.starts_with(static_root) {
        return None;
    }

    let resolved = if file_path.is_dir() {
        file_path.join("index.html")
    } else {
        file_path
    };
    if !resolved.is_file() {
        return None;
    }

    match fs::read(&resolved) {
        Ok(content) => Some(
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", get_mime_type(&resolved))
                .header("Access-Control-Allow-Origin", "*")
                .body(content)
                .expect("static response components are always valid"),
        ),
        Err(err) => {
            error!(path = %resolved.display(), %err, "failed to read static asset");
            None
        }
    }
}

/// Splits `/api/sessions/{id}` and `/api/sessions/{id}/{suffix}` into
/// `(id, "")` / `(id, "/suffix")`. Returns `None` for anything else under
/// `/api/sessions/` (e.g. the bare collection path, handled separately).
fn split_session_path(path: &str) -> Option<(String, &'static str)> {
    let re = Regex::new(r"^/api/sessions/([^/]+)(/input|/resize|/snapshot|/buffer|/stream)?$")
        .expect("static regex is valid");
    let caps = re.captures(path)?;
    let id = caps.get(1)?.as_str().to_string();
    let suffix = match caps.get(2).map(|m| m.as_str()) {
        None => "",
        Some("/input") => "/input",
        Some("/resize") => "/resize",
        Some("/snapshot") => "/snapshot",
        Some("/buffer") => "/buffer",
        Some("/stream") => "/stream",
        Some(_) => return None,
    };
    Some((id, suffix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_bare_session_path() {
        assert_eq!(
            split_session_path("/api/sessions/123-456"),
            Some(("123-456".to_string(), ""))
        );
    }

    #[test]
    fn splits_session_path_with_suffix() {
        assert_eq!(
            split_session_path("/api/sessions/abc-def/stream"),
            Some(("abc-def".to_string(), "/stream"))
        );
        assert_eq!(
            split_session_path("/api/sessions/abc-def/input"),
            Some(("abc-def".to_string(), "/input"))
        );
        assert_eq!(
            split_session_path("/api/sessions/abc-def/buffer"),
            Some(("abc-def".to_string(), "/buffer"))
        );
    }

    #[test]
    fn rejects_unknown_suffix_and_bare_collection() {
        assert_eq!(split_session_path("/api/sessions/abc/unknown"), None);
        assert_eq!(split_session_path("/api/sessions/"), None);
        assert_eq!(split_session_path("/api/sessions"), None);
        assert_eq!(split_session_path("/other/path"), None);
    }

    #[test]
    fn get_mime_type_covers_common_extensions() {
        assert_eq!(get_mime_type(Path::new("index.html")), "text/html");
        assert_eq!(get_mime_type(Path::new("app.js")), "application/javascript");
        assert_eq!(get_mime_type(Path::new("style.css")), "text/css");
        assert_eq!(get_mime_type(Path::new("data.bin")), "application/octet-stream");
    }

    #[test]
    fn serve_static_file_rejects_path_traversal() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("index.html"), b"hi").unwrap();
        assert!(serve_static_file(dir.path(), "/../../etc/passwd").is_none());
        assert!(serve_static_file(dir.path(), "/index.html").is_some());
    }

    #[test]
    fn unauthorized_response_has_status_and_challenge_header() {
        let response = unauthorized_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get("WWW-Authenticate").unwrap(),
            "Basic realm=\"termrelay\""
        );
    }

    #[test]
    fn json_response_sets_content_type_and_cors() {
        let response = json_response(StatusCode::OK, &serde_json::json!({"ok": true}));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("Content-Type").unwrap(), "application/json");
        assert_eq!(response.headers().get("Access-Control-Allow-Origin").unwrap(), "*");
        assert_eq!(response.body(), br#"{"ok":true}"#);
    }
}
