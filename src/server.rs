//! HTTP/WS/SSE Surface (C10, spec §6): binds C1–C9 to the wire. One thread
//! per accepted TCP connection, the donor's own model (`api_server.rs`'s
//! `start_server`), dispatching on `(method, path)` rather than pulling in a
//! routing framework.
//!
//! The only thing the donor never had to do is choose between the
//! hand-rolled HTTP parser and a WebSocket upgrade on the same listener —
//! `http::peek_is_upgrade_to` makes that choice before either path consumes
//! a byte from the stream.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};
use tungstenite::Message;

use crate::aggregator::BufferAggregator;
use crate::auth::{AuthOutcome, AuthRequest, Authenticator};
use crate::buffer;
use crate::error::{AppError, AppResult};
use crate::http::{
    self, empty_response, json_response, text_response, HttpRequest, HttpServer, Method, Request,
    Response, StatusCode,
};
use crate::manager::{CreateSessionRequest, SessionManager};
use crate::protocol::{Session, SessionStatus};
use crate::remote::RemoteRegistry;
use crate::watcher::{StreamWatcher, WatchEvent};

const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Everything a request handler needs. Cheap to clone — every field is
/// itself an `Arc`-backed handle (spec §9: "construct once at startup,
/// thread them through").
#[derive(Clone)]
pub struct AppState {
    pub manager: SessionManager,
    pub watcher: StreamWatcher,
    pub aggregator: BufferAggregator,
    pub authenticator: Arc<dyn Authenticator>,
    /// `Some` only when running in HQ mode (spec §4.9).
    pub remotes: Option<RemoteRegistry>,
    pub http_client: reqwest::blocking::Client,
}

/// Binds `addr` and serves forever, one thread per connection.
pub fn serve(addr: &str, state: AppState) -> std::io::Result<()> {
    let server = HttpServer::bind(addr)?;
    info!(%addr, "vibetunneld listening");
    for conn in server.incoming() {
        let (stream, peer) = conn?;
        let state = state.clone();
        let limit = server.request_size_limit();
        std::thread::spawn(move || handle_connection(stream, peer, state, limit));
    }
    Ok(())
}

fn handle_connection(stream: TcpStream, peer: SocketAddr, state: AppState, limit: Option<usize>) {
    if http::peek_is_upgrade_to(&stream, "/buffers") {
        handle_websocket(stream, peer, &state);
        return;
    }

    let mut request = match HttpRequest::from_stream(stream, peer, limit) {
        Ok(req) => req,
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return,
        Err(err) => {
            warn!(%peer, error = %err, "failed to parse request");
            return;
        }
    };

    // `GET .../stream` hijacks the connection for the rest of its lifetime
    // (spec §4.5) rather than producing one `Response`, so it's handled
    // before the normal dispatch-then-respond flow below ever touches the
    // stream — the same reason the websocket upgrade is peeked above.
    if *request.method() == Method::GET && extract_stream_session_id(&request.path()).is_some() {
        if let Err(err) = authenticate(&request, &state) {
            let _ = request.respond(error_response(&err));
            return;
        }
        if let Err(err) = handle_stream(&mut request, &state) {
            warn!(%peer, error = %err, "sse stream ended with error");
        }
        return;
    }

    let response = dispatch(&request, &state);
    if let Err(err) = request.respond(response) {
        warn!(%peer, error = %err, "failed to write response");
    }
}

fn is_local(addr: SocketAddr) -> bool {
    addr.ip().is_loopback()
}

fn authenticate(request: &HttpRequest, state: &AppState) -> AppResult<()> {
    if request.path() == "/health" {
        return Ok(());
    }
    let query_token = request
        .query()
        .and_then(|q| serde_urlencoded::from_str::<HashMap<String, String>>(q).ok())
        .and_then(|params| params.get("token").cloned());

    let auth_req = AuthRequest {
        authorization_header: request.header("authorization"),
        query_token: query_token.as_deref(),
        local_header: request.header("x-vibetunnel-local"),
    };
    let outcome = state
        .authenticator
        .authenticate(&auth_req, is_local(request.remote_addr()))?;
    crate::auth::require_allowed(outcome)
}

fn dispatch(request: &HttpRequest, state: &AppState) -> Response<Vec<u8>> {
    if let Err(err) = authenticate(request, state) {
        return error_response(&err);
    }

    let path = request.path();
    let result = route(request, &path, state);
    match result {
        Ok(response) => response,
        Err(err) => error_response(&err),
    }
}

fn error_response(err: &AppError) -> Response<Vec<u8>> {
    if !matches!(err, AppError::NotFound(_) | AppError::InvalidInput(_) | AppError::SessionExited) {
        error!(error = %err, "request failed");
    }
    json_response(
        err.status(),
        &json!({ "error": err.code(), "message": err.to_string() }),
    )
}

fn route(request: &HttpRequest, path: &str, state: &AppState) -> AppResult<Response<Vec<u8>>> {
    match (request.method().clone(), path) {
        (Method::GET, "/health") => Ok(json_response(
            StatusCode::OK,
            &json!({ "ok": true, "version": SERVER_VERSION }),
        )),

        (Method::GET, "/api/sessions") => handle_list_sessions(state),
        (Method::POST, "/api/sessions") => handle_create_session(request, state),
        (Method::POST, "/api/cleanup-exited") => handle_cleanup_exited(state),
        (Method::GET, "/api/sessions/activity") => handle_all_activity(state),

        (Method::GET, "/api/remotes") => handle_list_remotes(state),
        (Method::POST, "/api/remotes/register") => handle_register_remote(request, state),
        (Method::DELETE, p) if p.starts_with("/api/remotes/") => {
            handle_unregister_remote(&p["/api/remotes/".len()..], state)
        }

        (method, p) if p.starts_with("/api/sessions/") => {
            route_session_scoped(request, method, &p["/api/sessions/".len()..], state)
        }

        _ => Err(AppError::NotFound(path.to_string())),
    }
}

fn route_session_scoped(
    request: &HttpRequest,
    method: Method,
    rest: &str,
    state: &AppState,
) -> AppResult<Response<Vec<u8>>> {
    let (id, suffix) = rest.split_once('/').unwrap_or((rest, ""));
    let id = id.to_string();

    // Local lookup first; HQ mode falls through to proxying when absent.
    let local_exists = state.manager.get(&id).is_ok();
    if !local_exists {
        if let Some(registry) = &state.remotes {
            if let Some(remote) = registry.find_owner(&id) {
                return proxy_to_remote(request, &remote, state);
            }
        }
    }

    match (method, suffix) {
        (Method::GET, "") => {
            let session = state.manager.get(&id)?;
            Ok(json_response(StatusCode::OK, &session))
        }
        (Method::DELETE, "") => {
            let _ = state.manager.kill(&id, false);
            Ok(empty_response(StatusCode::NO_CONTENT))
        }
        (Method::DELETE, "cleanup") => {
            state.manager.cleanup(&id)?;
            Ok(empty_response(StatusCode::NO_CONTENT))
        }
        (Method::POST, "input") => handle_input(request, &id, state),
        (Method::POST, "resize") => handle_resize(request, &id, state),
        // GET .../stream is intercepted in `handle_connection` before this
        // dispatch is ever reached (spec §4.5 hijacks the connection).
        (Method::GET, "buffer") => handle_buffer(&id, state),
        (Method::GET, "text") => handle_text(request, &id, state),
        _ => Err(AppError::NotFound(format!("{id}/{suffix}"))),
    }
}

fn handle_list_sessions(state: &AppState) -> AppResult<Response<Vec<u8>>> {
    let local = state.manager.list()?;
    let sessions = match &state.remotes {
        Some(registry) => registry.fan_out_sessions(&state.http_client, local),
        None => local,
    };
    Ok(json_response(StatusCode::OK, &sessions))
}

#[derive(Deserialize)]
struct CreateSessionBody {
    command: Vec<String>,
    #[serde(rename = "workingDir")]
    working_dir: Option<String>,
    name: Option<String>,
    #[serde(rename = "remoteId")]
    remote_id: Option<String>,
    #[serde(default)]
    env: HashMap<String, String>,
}

fn handle_create_session(request: &HttpRequest, state: &AppState) -> AppResult<Response<Vec<u8>>> {
    let body: CreateSessionBody = serde_json::from_slice(request.body())
        .map_err(|e| AppError::InvalidInput(e.to_string()))?;

    if let (Some(remote_id), Some(registry)) = (&body.remote_id, &state.remotes) {
        let remote = registry
            .find_by_id(remote_id)
            .ok_or_else(|| AppError::NotFound(remote_id.clone()))?;
        return create_session_on_remote(&body, &remote, state);
    }

    let session = state.manager.create(CreateSessionRequest {
        name: body.name,
        command: body.command,
        working_dir: body.working_dir,
        term: None,
        cols: None,
        rows: None,
        env: body.env.into_iter().collect(),
    })?;
    Ok(json_response(StatusCode::CREATED, &json!({ "sessionId": session.id })))
}

/// Routes `POST /api/sessions {"remoteId":...}` to the named remote's own
/// `/api/sessions` (spec §4.8: "route to a specific remote if `spec.remoteId`
/// is set"). Mirrors `proxy_to_remote`'s bearer-auth-and-relay shape, but
/// unlike the session-scoped proxy this constructs a fresh request body
/// rather than forwarding the inbound one verbatim, since `remoteId` itself
/// must not be re-sent (the remote has no federation of its own to resolve
/// it against).
fn create_session_on_remote(
    body: &CreateSessionBody,
    remote: &crate::protocol::RemoteRegistration,
    state: &AppState,
) -> AppResult<Response<Vec<u8>>> {
    let url = format!("{}/api/sessions", remote.base_url.trim_end_matches('/'));
    let remote_body = json!({
        "command": body.command,
        "workingDir": body.working_dir,
        "name": body.name,
    });

    let response = state
        .http_client
        .post(&url)
        .bearer_auth(&remote.bearer_token)
        .json(&remote_body)
        .send()
        .map_err(|e| AppError::UpstreamUnavailable(e.to_string()))?;

    let status = StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let body = response
        .bytes()
        .map_err(|e| AppError::UpstreamUnavailable(e.to_string()))?
        .to_vec();

    Ok(Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(body)
        .unwrap_or_else(|_| empty_response(StatusCode::BAD_GATEWAY)))
}

fn handle_cleanup_exited(state: &AppState) -> AppResult<Response<Vec<u8>>> {
    let removed = state.manager.cleanup_all_exited()?;
    Ok(json_response(StatusCode::OK, &json!({ "cleaned": removed.len() })))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum InputBody {
    Text { text: String },
    Key { key: String },
}

fn handle_input(request: &HttpRequest, id: &str, state: &AppState) -> AppResult<Response<Vec<u8>>> {
    let body: InputBody = serde_json::from_slice(request.body())
        .map_err(|e| AppError::InvalidInput(e.to_string()))?;
    let bytes = match body {
        InputBody::Text { text } => text.into_bytes(),
        InputBody::Key { key } => key_to_bytes(&key)
            .ok_or_else(|| AppError::InvalidInput(format!("unknown key: {key}")))?
            .to_vec(),
    };
    state.manager.input(id, &bytes)?;
    Ok(empty_response(StatusCode::NO_CONTENT))
}

fn key_to_bytes(key: &str) -> Option<&'static [u8]> {
    Some(match key {
        "enter" | "ctrl_enter" => b"\r",
        "shift_enter" => b"\x1b\r",
        "escape" => b"\x1b",
        "backspace" => b"\x7f",
        "tab" => b"\t",
        "shift_tab" => b"\x1b[Z",
        "arrow_up" => b"\x1b[A",
        "arrow_down" => b"\x1b[B",
        "arrow_right" => b"\x1b[C",
        "arrow_left" => b"\x1b[D",
        "page_up" => b"\x1b[5~",
        "page_down" => b"\x1b[6~",
        "home" => b"\x1b[H",
        "end" => b"\x1b[F",
        "delete" => b"\x1b[3~",
        "f1" => b"\x1bOP",
        "f2" => b"\x1bOQ",
        "f3" => b"\x1bOR",
        "f4" => b"\x1bOS",
        "f5" => b"\x1b[15~",
        "f6" => b"\x1b[17~",
        "f7" => b"\x1b[18~",
        "f8" => b"\x1b[19~",
        "f9" => b"\x1b[20~",
        "f10" => b"\x1b[21~",
        "f11" => b"\x1b[23~",
        "f12" => b"\x1b[24~",
        _ => return None,
    })
}

#[derive(Deserialize)]
struct ResizeBody {
    cols: u16,
    rows: u16,
}

fn handle_resize(request: &HttpRequest, id: &str, state: &AppState) -> AppResult<Response<Vec<u8>>> {
    let body: ResizeBody = serde_json::from_slice(request.body())
        .map_err(|e| AppError::InvalidInput(e.to_string()))?;
    if body.cols == 0 || body.rows == 0 {
        return Err(AppError::InvalidInput("cols and rows must be > 0".to_string()));
    }
    state.manager.resize(id, body.cols, body.rows)?;
    Ok(empty_response(StatusCode::NO_CONTENT))
}

fn handle_buffer(id: &str, state: &AppState) -> AppResult<Response<Vec<u8>>> {
    let snapshot = state.manager.snapshot(id)?;
    Ok(http::binary_response(StatusCode::OK, buffer::encode(&snapshot)))
}

fn handle_text(request: &HttpRequest, id: &str, state: &AppState) -> AppResult<Response<Vec<u8>>> {
    let snapshot = state.manager.snapshot(id)?;
    let styled = request.query().is_some_and(|q| q.split('&').any(|kv| kv == "styles"));

    let mut out = String::new();
    for row in &snapshot.grid {
        if row.is_empty() {
            out.push('\n');
            continue;
        }
        if styled {
            let mut current_style: Option<String> = None;
            for cell in row {
                let style = cell_style_tag(cell);
                if style != current_style {
                    if current_style.is_some() {
                        out.push_str("[/style]");
                    }
                    if let Some(tag) = &style {
                        out.push_str(tag);
                    }
                    current_style = style;
                }
                out.push(cell.codepoint);
            }
            if current_style.is_some() {
                out.push_str("[/style]");
            }
        } else {
            for cell in row {
                out.push(cell.codepoint);
            }
        }
        out.push('\n');
    }
    Ok(text_response(StatusCode::OK, out))
}

fn cell_style_tag(cell: &crate::protocol::Cell) -> Option<String> {
    use crate::protocol::Color;
    if cell.attrs.is_empty() && matches!(cell.fg, Color::Default) {
        return None;
    }
    let fg = match cell.fg {
        Color::Default => None,
        Color::Indexed(i) => Some(i.to_string()),
        Color::Rgb(r, g, b) => Some(format!("{r},{g},{b}")),
    };
    let mut tag = String::from("[style");
    if let Some(fg) = fg {
        tag.push_str(&format!(" fg=\"{fg}\""));
    }
    if cell.attrs.bold {
        tag.push_str(" bold");
    }
    if cell.attrs.italic {
        tag.push_str(" italic");
    }
    if cell.attrs.underline {
        tag.push_str(" underline");
    }
    tag.push(']');
    Some(tag)
}

fn handle_all_activity(state: &AppState) -> AppResult<Response<Vec<u8>>> {
    let mut map = serde_json::Map::new();
    for session in state.manager.list()? {
        if let Some(activity) = state.manager.store().read_activity(&session.id)? {
            map.insert(session.id, activity);
        }
    }
    Ok(json_response(StatusCode::OK, &serde_json::Value::Object(map)))
}

fn handle_list_remotes(state: &AppState) -> AppResult<Response<Vec<u8>>> {
    let registry = state
        .remotes
        .as_ref()
        .ok_or_else(|| AppError::InvalidInput("not running in HQ mode".to_string()))?;
    Ok(json_response(StatusCode::OK, &registry.list_public()))
}

#[derive(Deserialize)]
struct RegisterRemoteBody {
    id: String,
    name: String,
    #[serde(rename = "baseUrl")]
    base_url: String,
    token: String,
}

fn handle_register_remote(request: &HttpRequest, state: &AppState) -> AppResult<Response<Vec<u8>>> {
    let registry = state
        .remotes
        .as_ref()
        .ok_or_else(|| AppError::InvalidInput("not running in HQ mode".to_string()))?;
    let body: RegisterRemoteBody = serde_json::from_slice(request.body())
        .map_err(|e| AppError::InvalidInput(e.to_string()))?;

    registry.register(crate::protocol::RemoteRegistration {
        id: body.id,
        name: body.name,
        base_url: body.base_url,
        bearer_token: body.token,
        last_healthy: jiff::Timestamp::now(),
        owned_session_ids: Vec::new(),
        consecutive_failures: 0,
    });
    Ok(empty_response(StatusCode::CREATED))
}

fn handle_unregister_remote(id: &str, state: &AppState) -> AppResult<Response<Vec<u8>>> {
    let registry = state
        .remotes
        .as_ref()
        .ok_or_else(|| AppError::InvalidInput("not running in HQ mode".to_string()))?;
    registry.unregister(id);
    Ok(empty_response(StatusCode::NO_CONTENT))
}

/// Proxies a session-scoped request verbatim to the owning remote (spec
/// §4.9): body and `Authorization` header pass through; the response is
/// relayed back with its original status and body.
fn proxy_to_remote(
    request: &HttpRequest,
    remote: &crate::protocol::RemoteRegistration,
    state: &AppState,
) -> AppResult<Response<Vec<u8>>> {
    let url = format!("{}{}", remote.base_url.trim_end_matches('/'), request.path());
    let method = reqwest::Method::from_bytes(request.method().as_str().as_bytes())
        .map_err(|e| AppError::Fatal(e.to_string()))?;

    let mut builder = state
        .http_client
        .request(method, &url)
        .bearer_auth(&remote.bearer_token)
        .body(request.body().to_vec());
    if let Some(auth) = request.header("authorization") {
        builder = builder.header("x-forwarded-authorization", auth);
    }

    let response = builder
        .send()
        .map_err(|e| AppError::UpstreamUnavailable(e.to_string()))?;
    let status = StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let body = response
        .bytes()
        .map_err(|e| AppError::UpstreamUnavailable(e.to_string()))?
        .to_vec();

    Ok(Response::builder()
        .status(status)
        .header("Content-Type", content_type)
        .header("Access-Control-Allow-Origin", "*")
        .body(body)
        .unwrap_or_else(|_| empty_response(StatusCode::BAD_GATEWAY)))
}

/// Extracts `:id` from `/api/sessions/:id/stream`, the one route
/// `handle_connection` intercepts ahead of normal dispatch.
fn extract_stream_session_id(path: &str) -> Option<&str> {
    let rest = path.strip_prefix("/api/sessions/")?;
    let id = rest.strip_suffix("/stream")?;
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

/// SSE handler for `GET /api/sessions/:id/stream` (spec §4.5). Owns the
/// connection's write side for the session's remaining lifetime, so it's
/// driven straight from `handle_connection` rather than through the normal
/// `route` → `Response` pipeline every other endpoint uses.
fn handle_stream(request: &mut HttpRequest, state: &AppState) -> AppResult<()> {
    let id = extract_stream_session_id(&request.path())
        .ok_or_else(|| AppError::NotFound(request.path()))?
        .to_string();

    let _ = state.manager.get(&id)?; // 404s cleanly if the session is unknown
    let stream_out = state.manager.store().session_dir(&id).join("stream-out");
    let subscription = state.watcher.subscribe(&id, stream_out)?;

    request.start_sse()?;
    for event in subscription {
        match event {
            WatchEvent::Header(line) => request.write_sse_data(&line)?,
            WatchEvent::Heartbeat => request.write_sse_comment("heartbeat")?,
            WatchEvent::Record(record) => {
                let is_exit = record.is_exit();
                request.write_sse_data(&record.to_json_line())?;
                if is_exit {
                    break;
                }
            }
        }
    }
    Ok(())
}

fn handle_websocket(stream: TcpStream, peer: SocketAddr, state: &AppState) {
    let auth_state = state.clone();
    let callback = move |req: &tungstenite::handshake::server::Request,
                          response: tungstenite::handshake::server::Response| {
        let query_token = req
            .uri()
            .query()
            .and_then(|q| serde_urlencoded::from_str::<HashMap<String, String>>(q).ok())
            .and_then(|params| params.get("token").cloned());
        let auth_req = AuthRequest {
            authorization_header: req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok()),
            query_token: query_token.as_deref(),
            local_header: req
                .headers()
                .get("x-vibetunnel-local")
                .and_then(|v| v.to_str().ok()),
        };
        match auth_state.authenticator.authenticate(&auth_req, is_local(peer)) {
            Ok(AuthOutcome::Allow) => Ok(response),
            _ => {
                let rejection = tungstenite::handshake::server::ErrorResponse::new(None);
                Err(rejection)
            }
        }
    };

    let mut ws = match tungstenite::accept_hdr(stream, callback) {
        Ok(ws) => ws,
        Err(err) => {
            warn!(%peer, error = %err, "websocket handshake failed");
            return;
        }
    };

    if let Err(err) = ws.get_mut().set_read_timeout(Some(std::time::Duration::from_millis(50))) {
        warn!(%peer, error = %err, "failed to set websocket read timeout");
        return;
    }

    let client_id = state.aggregator.new_client_id();
    let mut subscriptions: HashMap<String, Receiver<Vec<u8>>> = HashMap::new();

    'outer: loop {
        for rx in subscriptions.values() {
            while let Ok(frame) = rx.try_recv() {
                if ws.send(Message::Binary(frame)).is_err() {
                    break 'outer;
                }
            }
        }

        match ws.read() {
            Ok(Message::Text(text)) => {
                if !handle_ws_control(&text, client_id, &mut subscriptions, &mut ws, state) {
                    let _ = ws.close(Some(tungstenite::protocol::CloseFrame {
                        code: tungstenite::protocol::frame::coding::CloseCode::Protocol,
                        reason: "sessionId too long".into(),
                    }));
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(data)) => {
                if ws.send(Message::Pong(data)).is_err() {
                    break;
                }
            }
            Ok(_) => {}
            Err(tungstenite::Error::Io(ref e))
                if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(_) => break,
        }
    }

    state.aggregator.unsubscribe_all(client_id);
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WsControlMessage {
    Subscribe { #[serde(rename = "sessionId")] session_id: String },
    Unsubscribe { #[serde(rename = "sessionId")] session_id: String },
    Ping,
}

/// Max `sessionId` length a WS binary data frame can carry (spec §8: `idLen`
/// is a `u8` but capped at 64 so a runaway id can't dominate a frame).
/// Returns `false` when the connection must be closed with code 1002.
const MAX_WS_SESSION_ID_LEN: usize = 64;

fn handle_ws_control(
    text: &str,
    client_id: crate::aggregator::ClientId,
    subscriptions: &mut HashMap<String, Receiver<Vec<u8>>>,
    ws: &mut tungstenite::WebSocket<TcpStream>,
    state: &AppState,
) -> bool {
    let Ok(message) = serde_json::from_str::<WsControlMessage>(text) else {
        return true;
    };
    match message {
        WsControlMessage::Subscribe { session_id } => {
            if session_id.len() > MAX_WS_SESSION_ID_LEN {
                return false;
            }
            let rx = state.aggregator.subscribe(client_id, &session_id);
            subscriptions.insert(session_id, rx);
        }
        WsControlMessage::Unsubscribe { session_id } => {
            state.aggregator.unsubscribe(client_id, &session_id);
            subscriptions.remove(&session_id);
        }
        WsControlMessage::Ping => {
            let _ = ws.send(Message::Text(r#"{"type":"pong"}"#.to_string().into()));
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_to_bytes_covers_navigation_keys() {
        assert_eq!(key_to_bytes("enter"), Some(&b"\r"[..]));
        assert_eq!(key_to_bytes("arrow_up"), Some(&b"\x1b[A"[..]));
        assert_eq!(key_to_bytes("unknown-key"), None);
    }

    #[test]
    fn cell_style_tag_is_none_for_plain_cell() {
        let cell = crate::protocol::Cell::default();
        assert!(cell_style_tag(&cell).is_none());
    }
}
