use crate::config::BrowserConfig;
use chromiumoxide::browser::HeadlessMode;
use chromiumoxide::Handler;
use futures::StreamExt;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const LAUNCH_TIMEOUT: Duration = Duration::from_secs(20);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const VERSION_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum BrowserError {
    #[error("no chromium or chrome executable found; set browser.chrome_path")]
    ChromeNotFound,
    #[error("browser launch failed: {0}")]
    LaunchFailed(String),
    #[error("devtools connection failed: {0}")]
    ConnectFailed(String),
    #[error(transparent)]
    Cdp(#[from] chromiumoxide::error::CdpError),
}

#[derive(Debug, Deserialize)]
struct VersionInfo {
    #[serde(rename = "Browser")]
    browser: String,
    #[serde(rename = "webSocketDebuggerUrl")]
    web_socket_debugger_url: String,
}

/// A Chromium instance driven over DevTools.
///
/// Browsers launched here are closed on `shutdown`; one found already listening
/// on the debug port is only disconnected from.
pub struct Browser {
    inner: chromiumoxide::Browser,
    handler: JoinHandle<()>,
    alive: Arc<AtomicBool>,
    launched: bool,
}

impl Browser {
    pub async fn start(cfg: &BrowserConfig) -> Result<Self, BrowserError> {
        let endpoint = cfg.endpoint();

        if let Ok(version) = fetch_version(&endpoint).await {
            tracing::info!(browser = %version.browser, port = cfg.debug_port, "reusing browser already listening");
            let (inner, handler) = chromiumoxide::Browser::connect(version.web_socket_debugger_url)
                .await
                .map_err(|e| BrowserError::ConnectFailed(e.to_string()))?;
            return Ok(Self::wrap(inner, handler, false));
        }

        let chrome = match &cfg.chrome_path {
            Some(path) => PathBuf::from(path),
            None => find_chrome().ok_or(BrowserError::ChromeNotFound)?,
        };

        let config = launch_config(cfg, &chrome)?;
        let (inner, handler) = chromiumoxide::Browser::launch(config)
            .await
            .map_err(|e| BrowserError::LaunchFailed(format!("{}: {}", chrome.display(), e)))?;
        tracing::info!(path = %chrome.display(), "browser launched");

        Ok(Self::wrap(inner, handler, true))
    }

    fn wrap(inner: chromiumoxide::Browser, mut handler: Handler, launched: bool) -> Self {
        let alive = Arc::new(AtomicBool::new(true));
        let flag = alive.clone();
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    tracing::debug!(error = %err, "devtools handler error");
                }
            }
            flag.store(false, Ordering::SeqCst);
            tracing::debug!("devtools connection closed");
        });

        Self {
            inner,
            handler,
            alive,
            launched,
        }
    }

    /// Cleared once the DevTools connection is gone.
    pub fn liveness(&self) -> Arc<AtomicBool> {
        self.alive.clone()
    }

    pub async fn new_page(&self) -> Result<chromiumoxide::Page, BrowserError> {
        Ok(self.inner.new_page("about:blank").await?)
    }

    pub async fn shutdown(self) {
        let mut inner = self.inner;
        if self.launched {
            if let Err(err) = inner.close().await {
                tracing::debug!(error = %err, "browser close failed");
            }
            if let Err(err) = inner.wait().await {
                tracing::debug!(error = %err, "browser already gone");
            }
        }
        self.handler.abort();
    }
}

async fn fetch_version(endpoint: &str) -> Result<VersionInfo, reqwest::Error> {
    let url = format!("{}/json/version", endpoint.trim_end_matches('/'));
    reqwest::Client::builder()
        .timeout(VERSION_TIMEOUT)
        .build()?
        .get(&url)
        .send()
        .await?
        .json()
        .await
}

fn launch_config(
    cfg: &BrowserConfig,
    chrome: &Path,
) -> Result<chromiumoxide::BrowserConfig, BrowserError> {
    let mut builder = chromiumoxide::BrowserConfig::builder()
        .chrome_executable(chrome)
        .user_data_dir(cfg.profile_dir())
        .port(cfg.debug_port)
        .window_size(cfg.viewport_width, cfg.viewport_height)
        .launch_timeout(LAUNCH_TIMEOUT)
        .request_timeout(REQUEST_TIMEOUT)
        .args(extra_args(cfg));

    builder = if cfg.headless {
        builder.headless_mode(HeadlessMode::New)
    } else {
        builder.with_head()
    };
    if cfg.no_sandbox {
        builder = builder.no_sandbox();
    }

    builder.build().map_err(BrowserError::LaunchFailed)
}

/// Flags on top of the ones chromiumoxide always passes.
fn extra_args(cfg: &BrowserConfig) -> Vec<String> {
    let mut args = vec![
        "--no-default-browser-check".to_string(),
        "--disable-translate".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--mute-audio".to_string(),
    ];
    if cfg.headless {
        args.push("--disable-gpu".to_string());
    }
    if cfg.no_sandbox {
        args.push("--disable-setuid-sandbox".to_string());
    }
    args
}

pub fn find_chrome() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    let paths: &[&str] = &[
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/usr/lib/chromium/chromium",
        "/usr/bin/google-chrome",
        "/usr/bin/google-chrome-stable",
        "/snap/bin/chromium",
    ];
    #[cfg(target_os = "macos")]
    let paths: &[&str] = &[
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
    ];
    #[cfg(target_os = "windows")]
    let paths: &[&str] = &[
        r"C:\Program Files\Google\Chrome\Application\chrome.exe",
        r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
    ];
    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    let paths: &[&str] = &[];

    paths.iter().map(PathBuf::from).find(|p| p.exists())
}
