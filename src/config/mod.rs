use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "FRITZMESH_";
const DEFAULT_DATA_DIR: &str = "/data";

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub router: RouterConfig,
    pub browser: BrowserConfig,
    pub capture: CaptureConfig,
    pub server: ServerConfig,
    pub vault: VaultConfig,
    pub theme: ThemeConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RouterConfig {
    pub host: String,
    pub username: String,
    /// Plain password. Prefer `password_key` outside of add-on deployments.
    pub password: Option<String>,
    pub password_key: Option<String>,
    pub mesh_path: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            host: "fritz.box".to_string(),
            username: "Admin".to_string(),
            password: None,
            password_key: None,
            mesh_path: "/#/mesh".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub chrome_path: Option<String>,
    pub debug_port: u16,
    pub headless: bool,
    pub no_sandbox: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub user_agent: String,
    pub profile_dir: Option<String>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            chrome_path: None,
            debug_port: 9222,
            headless: true,
            no_sandbox: true,
            viewport_width: 1920,
            viewport_height: 1080,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36"
                .to_string(),
            profile_dir: None,
        }
    }
}

impl BrowserConfig {
    pub fn endpoint(&self) -> String {
        format!("http://127.0.0.1:{}", self.debug_port)
    }

    pub fn profile_dir(&self) -> PathBuf {
        match &self.profile_dir {
            Some(dir) => PathBuf::from(dir),
            None => env::temp_dir().join("fritz-mesh-bridge-profile"),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    #[default]
    Screenshot,
    Live,
}

impl CaptureMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureMode::Screenshot => "screenshot",
            CaptureMode::Live => "live",
        }
    }
}

impl std::str::FromStr for CaptureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "screenshot" => Ok(CaptureMode::Screenshot),
            "live" => Ok(CaptureMode::Live),
            other => Err(format!("unknown capture mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub mode: CaptureMode,
    pub interval_ms: u64,
    /// Forces a fresh login after this many seconds. 0 keeps the session until it breaks.
    pub session_refresh_secs: u64,
    pub page_load_timeout_ms: u64,
    pub initial_settle_ms: u64,
    pub login_settle_ms: u64,
    pub navigate_settle_ms: u64,
    pub max_failures: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            mode: CaptureMode::Screenshot,
            interval_ms: 5000,
            session_refresh_secs: 900,
            page_load_timeout_ms: 30_000,
            initial_settle_ms: 2000,
            login_settle_ms: 5000,
            navigate_settle_ms: 3000,
            max_failures: 5,
            backoff_initial_ms: 1000,
            backoff_max_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub token: Option<String>,
    pub require_token: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8000,
            token: None,
            require_token: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ThemeConfig {
    pub font_family: String,
    pub accent: String,
    pub accent_alt: String,
    pub panel: String,
    pub text: String,
    pub muted: String,
    pub good: String,
    pub warn: String,
    pub bad: String,
}

impl Default for ThemeConfig {
    fn default() -> Self {
        Self {
            font_family: "-apple-system, BlinkMacSystemFont, 'Segoe UI', sans-serif".to_string(),
            accent: "#667eea".to_string(),
            accent_alt: "#764ba2".to_string(),
            panel: "#ffffff".to_string(),
            text: "#333333".to_string(),
            muted: "#666666".to_string(),
            good: "#155724".to_string(),
            warn: "#856404".to_string(),
            bad: "#721c24".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct VaultConfig {
    pub path: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = Self::default();
        let config_path = active_config_path();

        if let Ok(raw) = fs::read_to_string(&config_path) {
            match toml::from_str::<Config>(&raw) {
                Ok(file_config) => config = file_config,
                Err(err) => {
                    tracing::warn!(path = %config_path.display(), error = %err, "ignoring unreadable config file");
                }
            }
        }

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| env::var(name).ok());
    }

    fn apply_overrides<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let prefixed = |key: &str| var(&format!("{}{}", ENV_PREFIX, key));

        // Add-on variables
        if let Some(val) = var("FRITZ_HOST") {
            self.router.host = val;
        }
        if let Some(val) = var("FRITZ_USER") {
            self.router.username = val;
        }
        if let Some(val) = var("FRITZ_PASS") {
            if !val.is_empty() {
                self.router.password = Some(val);
            }
        }

        // Router settings
        if let Some(val) = prefixed("ROUTER_HOST") {
            self.router.host = val;
        }
        if let Some(val) = prefixed("ROUTER_USERNAME") {
            self.router.username = val;
        }
        if let Some(val) = prefixed("ROUTER_PASSWORD") {
            self.router.password = Some(val);
        }
        if let Some(val) = prefixed("ROUTER_PASSWORD_KEY") {
            self.router.password_key = Some(val);
        }
        if let Some(val) = prefixed("MESH_PATH") {
            self.router.mesh_path = val;
        }

        // Browser settings
        if let Some(val) = prefixed("CHROME_PATH") {
            self.browser.chrome_path = Some(val);
        }
        if let Some(val) = prefixed("DEBUG_PORT") {
            if let Ok(port) = val.parse() {
                self.browser.debug_port = port;
            }
        }
        if let Some(val) = prefixed("HEADLESS") {
            self.browser.headless = val.parse().unwrap_or(true);
        }
        if let Some(val) = prefixed("NO_SANDBOX") {
            self.browser.no_sandbox = val.parse().unwrap_or(true);
        }

        // Capture settings
        if let Some(val) = prefixed("CAPTURE_MODE") {
            match val.parse() {
                Ok(mode) => self.capture.mode = mode,
                Err(err) => tracing::warn!(error = %err, "ignoring capture mode override"),
            }
        }
        if let Some(val) = prefixed("CAPTURE_INTERVAL_MS") {
            if let Ok(interval) = val.parse() {
                self.capture.interval_ms = interval;
            }
        }
        if let Some(val) = prefixed("SESSION_REFRESH_SECS") {
            if let Ok(secs) = val.parse() {
                self.capture.session_refresh_secs = secs;
            }
        }

        // Server settings
        if let Some(val) = prefixed("SERVER_PORT") {
            if let Ok(port) = val.parse() {
                self.server.port = port;
            }
        }
        if let Some(val) = prefixed("SERVER_BIND") {
            self.server.bind = val;
        }
        if let Some(val) = prefixed("SERVER_TOKEN") {
            self.server.token = Some(val);
        }

        // Vault settings
        if let Some(val) = prefixed("VAULT_PATH") {
            self.vault.path = Some(val);
        }
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.router.host.trim().is_empty() {
            return Err("router.host must be set".into());
        }
        if self.router.mesh_path.trim().is_empty() {
            return Err("router.mesh_path must be set".into());
        }
        if self.browser.debug_port == 0 {
            return Err("browser.debug_port must be non-zero".into());
        }
        if self.browser.viewport_width == 0 || self.browser.viewport_height == 0 {
            return Err("browser viewport must be non-zero".into());
        }
        if self.server.port == 0 {
            return Err("server.port must be non-zero".into());
        }
        if self.capture.interval_ms < 500 {
            return Err("capture.interval_ms must be >= 500".into());
        }
        if self.capture.max_failures == 0 {
            return Err("capture.max_failures must be >= 1".into());
        }
        if self.capture.backoff_initial_ms == 0
            || self.capture.backoff_initial_ms > self.capture.backoff_max_ms
        {
            return Err(
                "capture.backoff_initial_ms must be non-zero and <= capture.backoff_max_ms".into(),
            );
        }
        Ok(())
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err("config.toml already exists".into());
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }

    /// Router root URL with a scheme and without a trailing slash.
    pub fn router_base_url(&self) -> String {
        normalize_base_url(&self.router.host)
    }
}

pub fn normalize_base_url(host: &str) -> String {
    let host = host.trim();
    let url = if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{}", host)
    };
    url.trim_end_matches('/').to_string()
}

pub fn data_dir() -> PathBuf {
    env::var(format!("{}DATA_DIR", ENV_PREFIX))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR))
}

fn managed_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{}CONFIG_PATH", ENV_PREFIX)) {
        return PathBuf::from(path);
    }
    data_dir().join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}
