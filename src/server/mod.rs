use crate::capture::{send_command, CaptureCommand, CommandError, CommandSender};
use crate::config::{CaptureMode, ThemeConfig};
use crate::model::BridgeFrame;
use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio::sync::watch;

const VIEW_SCRIPT: &str = r#"<script>
(function () {
  document.querySelectorAll('a').forEach(function (a) {
    var href = a.getAttribute('href');
    if (href && !/^https?:/i.test(href)) {
      a.setAttribute('href', 'javascript:void(0)');
      a.addEventListener('click', function (e) { e.preventDefault(); });
    }
  });
  document.querySelectorAll('img, script, link, iframe').forEach(function (el) {
    var src = el.getAttribute('src');
    if (src && src.indexOf('data:') !== 0) { el.removeAttribute('src'); }
    var href = el.getAttribute('href');
    if (el.tagName === 'LINK' && href && href.indexOf('data:') !== 0) { el.removeAttribute('href'); }
  });
})();
</script>"#;

#[derive(Clone)]
pub struct ServerState {
    token: Option<String>,
    rx: watch::Receiver<BridgeFrame>,
    cmd_tx: CommandSender,
    theme: ThemeConfig,
    refresh_ms: u64,
}

impl ServerState {
    pub fn new(
        token: Option<String>,
        rx: watch::Receiver<BridgeFrame>,
        cmd_tx: CommandSender,
        theme: ThemeConfig,
        refresh_ms: u64,
    ) -> Self {
        Self {
            token,
            rx,
            cmd_tx,
            theme,
            refresh_ms,
        }
    }
}

pub async fn start(
    addr: SocketAddr,
    state: ServerState,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = router(state);

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "web server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await?;

    Ok(())
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/", get(index_page))
        .route("/view", get(view_page))
        .route("/snapshot.png", get(snapshot_png))
        .route("/ws", get(ws_handler))
        .route("/api/status", get(api_status))
        .route("/api/navigate", post(api_navigate))
        .route("/api/click", post(api_click))
        .route("/api/fill", post(api_fill))
        .route("/api/relogin", post(api_relogin))
        .with_state(Arc::new(state))
}

async fn index_page(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> impl IntoResponse {
    if !authorized(&state, &headers, &query.0) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let html = r##"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="UTF-8">
  <meta name="viewport" content="width=device-width, initial-scale=1.0">
  <title>FRITZ!Box Mesh</title>
  <style>
    :root { {{THEME_VARS}} }
    * { margin: 0; padding: 0; box-sizing: border-box; }
    body {
      background: linear-gradient(135deg, var(--accent) 0%, var(--accent-alt) 100%);
      display: flex; justify-content: center; align-items: center;
      min-height: 100vh; font-family: var(--font); padding: 10px;
    }
    .container {
      background: var(--panel); border-radius: 10px; box-shadow: 0 20px 60px rgba(0,0,0,0.3);
      padding: 20px; width: 95vw; height: 95vh;
      display: flex; flex-direction: column; gap: 10px; overflow: hidden;
    }
    h1 { color: var(--text); font-size: 20px; }
    .info { color: var(--muted); font-size: 12px; }
    .status { padding: 10px; border-radius: 6px; font-size: 12px; font-weight: 500; }
    .status.loading { background: #fff3cd; color: var(--warn); }
    .status.ready { background: #d4edda; color: var(--good); }
    .status.error { background: #f8d7da; color: var(--bad); }
    .frame-wrapper {
      flex: 1; display: flex; justify-content: center; align-items: center;
      overflow: auto; background: #f9f9f9; border-radius: 8px; position: relative;
    }
    iframe { width: 100%; height: 100%; border: none; border-radius: 8px; }
    .loader { position: absolute; display: flex; flex-direction: column; align-items: center; color: #999; }
    .spinner {
      border: 3px solid #f3f3f3; border-top: 3px solid var(--accent); border-radius: 50%;
      width: 40px; height: 40px; animation: spin 1s linear infinite; margin-bottom: 10px;
    }
    @keyframes spin { 0% { transform: rotate(0deg); } 100% { transform: rotate(360deg); } }
  </style>
</head>
<body>
  <div class="container">
    <h1>FRITZ!Box Mesh</h1>
    <div class="info">Mode: {{MODE}}</div>
    <div id="status" class="status loading">Connecting...</div>
    <div class="frame-wrapper">
      <div id="loader" class="loader"><div class="spinner"></div><p>Starting browser...</p></div>
      <iframe id="mesh-frame" style="display: none;"></iframe>
    </div>
  </div>
  <script>
    const tokenQuery = '{{TOKEN_QUERY}}';
    const statusEl = document.getElementById('status');
    const loaderEl = document.getElementById('loader');
    const frameEl = document.getElementById('mesh-frame');

    function render(data) {
      if (data.status === 'ready') {
        statusEl.textContent = 'FRITZ!Box connected';
        statusEl.className = 'status ready';
        loaderEl.style.display = 'none';
        frameEl.style.display = 'block';
        if (!frameEl.src) { frameEl.src = '/view' + tokenQuery; }
      } else if (data.status === 'loading') {
        statusEl.textContent = 'Connecting to FRITZ!Box...';
        statusEl.className = 'status loading';
      } else {
        statusEl.textContent = 'Connection failed: ' + (data.message || 'unknown error')
          + ' (' + data.consecutive_failures + ' in a row)';
        statusEl.className = 'status error';
      }
    }

    async function poll() {
      try {
        const res = await fetch('/api/status' + tokenQuery);
        render(await res.json());
      } catch (e) {
        console.error('status check failed', e);
      }
    }

    function connect() {
      const proto = window.location.protocol === 'https:' ? 'wss' : 'ws';
      const ws = new WebSocket(`${proto}://${window.location.host}/ws${tokenQuery}`);
      ws.onmessage = (ev) => render(JSON.parse(ev.data));
      ws.onclose = () => { poll(); setTimeout(connect, 2000); };
    }

    poll();
    connect();
  </script>
</body>
</html>
"##
    .replace("{{THEME_VARS}}", &theme_css(&state.theme))
    .replace("{{MODE}}", state.rx.borrow().mode.as_str())
    .replace("{{TOKEN_QUERY}}", &token_query(&query.0, '?'));

    Html(html).into_response()
}

async fn view_page(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&state, &headers, &query.0) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let frame = state.rx.borrow().clone();
    let Some(snapshot) = frame.snapshot else {
        return not_ready();
    };

    match (frame.mode, snapshot.html.as_deref()) {
        (CaptureMode::Live, Some(html)) => (
            [
                (header::CONTENT_TYPE, "text/html; charset=utf-8"),
                (header::CACHE_CONTROL, "no-store"),
            ],
            inject_view_script(html),
        )
            .into_response(),
        _ => Html(screenshot_page(
            &token_query(&query.0, '&'),
            state.refresh_ms,
        ))
        .into_response(),
    }
}

async fn snapshot_png(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&state, &headers, &query.0) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let snapshot = state.rx.borrow().snapshot.clone();
    match snapshot {
        Some(snapshot) => (
            [
                (header::CONTENT_TYPE, "image/png"),
                (header::CACHE_CONTROL, "no-store"),
            ],
            snapshot.png.clone(),
        )
            .into_response(),
        None => not_ready(),
    }
}

async fn api_status(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&state, &headers, &query.0) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let view = state.rx.borrow().status_view();
    Json(view).into_response()
}

#[derive(Deserialize)]
struct NavigateRequest {
    url: Option<String>,
}

#[derive(Deserialize)]
struct ClickRequest {
    selector: Option<String>,
}

#[derive(Deserialize)]
struct FillRequest {
    selector: Option<String>,
    value: Option<String>,
}

async fn api_navigate(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
    body: Result<Json<NavigateRequest>, JsonRejection>,
) -> Response {
    if !authorized(&state, &headers, &query.0) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let body = match json_body(body) {
        Ok(body) => body,
        Err(response) => return response,
    };
    let Some(url) = non_empty(body.url) else {
        return bad_request("url is required");
    };
    let result = send_command(&state.cmd_tx, |reply| CaptureCommand::Navigate { url, reply }).await;
    command_response(result)
}

async fn api_click(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
    body: Result<Json<ClickRequest>, JsonRejection>,
) -> Response {
    if !authorized(&state, &headers, &query.0) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let body = match json_body(body) {
        Ok(body) => body,
        Err(response) => return response,
    };
    let Some(selector) = non_empty(body.selector) else {
        return bad_request("selector is required");
    };
    let result =
        send_command(&state.cmd_tx, |reply| CaptureCommand::Click { selector, reply }).await;
    command_response(result)
}

async fn api_fill(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
    body: Result<Json<FillRequest>, JsonRejection>,
) -> Response {
    if !authorized(&state, &headers, &query.0) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let body = match json_body(body) {
        Ok(body) => body,
        Err(response) => return response,
    };
    let (Some(selector), Some(value)) = (non_empty(body.selector), body.value) else {
        return bad_request("selector and value are required");
    };
    let result = send_command(&state.cmd_tx, |reply| CaptureCommand::Fill {
        selector,
        value,
        reply,
    })
    .await;
    command_response(result)
}

async fn api_relogin(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&state, &headers, &query.0) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let result = send_command(&state.cmd_tx, |reply| CaptureCommand::Relogin { reply }).await;
    command_response(result)
}

fn command_response(result: Result<(), CommandError>) -> Response {
    let err = match result {
        Ok(()) => return Json(serde_json::json!({ "success": true })).into_response(),
        Err(err) => err,
    };
    let status = match err {
        CommandError::NotReady | CommandError::WorkerGone => StatusCode::SERVICE_UNAVAILABLE,
        CommandError::Rejected(_) => StatusCode::BAD_REQUEST,
        CommandError::Failed(_) => {
            tracing::warn!(error = %err, "remote control command failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}

/// Missing, mistyped or malformed bodies all answer 400, after the token check.
fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, Response> {
    match body {
        Ok(Json(body)) => Ok(body),
        Err(rejection) => {
            tracing::debug!(error = %rejection, "rejected request body");
            Err(bad_request("invalid JSON body"))
        }
    }
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

fn not_ready() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        [(header::RETRY_AFTER, "2")],
        "Connecting to FRITZ!Box...",
    )
        .into_response()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

async fn ws_handler(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> impl IntoResponse {
    if !authorized(&state, &headers, &query.0) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let rx = state.rx.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, rx))
}

async fn handle_socket(mut socket: WebSocket, rx: watch::Receiver<BridgeFrame>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(1000));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let view = rx.borrow().status_view();
                let payload = match serde_json::to_string(&view) {
                    Ok(payload) => payload,
                    Err(_) => break,
                };
                if socket.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => {}
                }
            }
        }
    }
}

fn authorized(state: &ServerState, headers: &HeaderMap, query: &HashMap<String, String>) -> bool {
    match &state.token {
        Some(token) => is_token_valid(headers, query, token),
        None => true,
    }
}

fn is_token_valid(headers: &HeaderMap, query: &HashMap<String, String>, token: &str) -> bool {
    // Header for API clients, query parameter for iframes and dashboards.
    if let Some(auth_header) = headers.get("authorization") {
        if let Ok(auth_str) = auth_header.to_str() {
            if let Some(provided_token) = auth_str.strip_prefix("Bearer ") {
                return provided_token == token;
            }
        }
    }

    query.get("token").map(|t| t == token).unwrap_or(false)
}

/// Re-emit the caller's token so nested requests stay authorised.
fn token_query(query: &HashMap<String, String>, lead: char) -> String {
    match query.get("token") {
        Some(token) => {
            let encoded: String = url::form_urlencoded::byte_serialize(token.as_bytes()).collect();
            format!("{}token={}", lead, encoded)
        }
        None => String::new(),
    }
}

async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "healthy",
            "timestamp": crate::model::now_unix(),
        })),
    )
}

fn theme_css(theme: &ThemeConfig) -> String {
    format!(
        "--font: {}; --accent: {}; --accent-alt: {}; --panel: {}; --text: {}; --muted: {}; --good: {}; --warn: {}; --bad: {};",
        theme.font_family,
        theme.accent,
        theme.accent_alt,
        theme.panel,
        theme.text,
        theme.muted,
        theme.good,
        theme.warn,
        theme.bad
    )
}

fn screenshot_page(token_amp: &str, refresh_ms: u64) -> String {
    r##"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="UTF-8">
  <title>FRITZ!Box Mesh</title>
  <style>
    html, body { margin: 0; height: 100%; background: #f9f9f9; }
    body { display: flex; justify-content: center; align-items: center; }
    img { max-width: 100%; max-height: 100%; object-fit: contain; }
  </style>
</head>
<body>
  <img id="mesh" src="/snapshot.png?t=0{{TOKEN_AMP}}" alt="FRITZ!Box mesh overview">
  <script>
    const img = document.getElementById('mesh');
    setInterval(() => {
      const next = new Image();
      next.onload = () => { img.src = next.src; };
      next.src = '/snapshot.png?t=' + Date.now() + '{{TOKEN_AMP}}';
    }, {{REFRESH_MS}});
  </script>
</body>
</html>
"##
    .replace("{{TOKEN_AMP}}", token_amp)
    .replace("{{REFRESH_MS}}", &refresh_ms.to_string())
}

/// Insert the link-neutralising script before the last `</body>`, or append it.
fn inject_view_script(html: &str) -> String {
    let lower = html.to_ascii_lowercase();
    match lower.rfind("</body>") {
        Some(idx) => {
            let mut out = String::with_capacity(html.len() + VIEW_SCRIPT.len());
            out.push_str(&html[..idx]);
            out.push_str(VIEW_SCRIPT);
            out.push_str(&html[idx..]);
            out
        }
        None => format!("{}{}", html, VIEW_SCRIPT),
    }
}
