use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{
    is_mesh_view, looks_logged_in, mesh_url, on_login_page, resolve_target, TargetError,
    LOGIN_FORM_SELECTORS, PASSWORD_SELECTORS, SUBMIT_SELECTORS, USER_SELECTORS,
};
use crate::config::{CaptureMode, Config};
use crate::model::{now_unix, Snapshot};
use crate::page::{self, first_visible, PageDriver, PageError, PageLauncher};

const LOGIN_POLL: Duration = Duration::from_millis(500);
const NAVIGATE_SETTLE: Duration = Duration::from_millis(1000);
const INPUT_SETTLE: Duration = Duration::from_millis(500);
const USER_SELECT_SETTLE: Duration = Duration::from_millis(300);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Page(#[from] PageError),
    #[error("router rejected the login")]
    LoginRejected,
    #[error("router session expired")]
    SessionExpired,
    #[error("login form shown but no router password configured")]
    MissingPassword,
    #[error(transparent)]
    Target(#[from] TargetError),
}

impl SessionError {
    /// Errors after which the current browser session is worthless.
    pub fn requires_new_session(&self) -> bool {
        match self {
            SessionError::LoginRejected
            | SessionError::SessionExpired
            | SessionError::MissingPassword => true,
            SessionError::Page(err) => err.is_fatal(),
            SessionError::Target(_) => false,
        }
    }
}

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<set>"))
            .finish()
    }
}

#[derive(Debug, Clone)]
struct Timing {
    page_load: Duration,
    initial_settle: Duration,
    login_settle: Duration,
    navigate_settle: Duration,
}

/// A browser tab logged into the router and parked on the mesh view.
pub struct RouterSession {
    page: Box<dyn PageDriver>,
    base_url: String,
    mesh_path: String,
    timing: Timing,
    started: Instant,
    started_unix: u64,
    follow_mesh: bool,
}

impl RouterSession {
    /// Open a tab, log in and show the mesh view. The tab is closed again on failure.
    pub async fn open(
        launcher: &dyn PageLauncher,
        cfg: &Config,
        credentials: &Credentials,
    ) -> Result<Self, SessionError> {
        let page = launcher.open().await?;

        let session = Self {
            page,
            base_url: cfg.router_base_url(),
            mesh_path: cfg.router.mesh_path.clone(),
            timing: Timing {
                page_load: Duration::from_millis(cfg.capture.page_load_timeout_ms),
                initial_settle: Duration::from_millis(cfg.capture.initial_settle_ms),
                login_settle: Duration::from_millis(cfg.capture.login_settle_ms),
                navigate_settle: Duration::from_millis(cfg.capture.navigate_settle_ms),
            },
            started: Instant::now(),
            started_unix: now_unix(),
            follow_mesh: true,
        };

        match session.enter(credentials).await {
            Ok(()) => {
                info!("router session ready");
                Ok(session)
            }
            Err(err) => {
                session.close().await;
                Err(err)
            }
        }
    }

    async fn enter(&self, credentials: &Credentials) -> Result<(), SessionError> {
        info!(url = %self.base_url, "opening router");
        page::navigate(self.page.as_ref(), &self.base_url, self.timing.page_load).await?;
        tokio::time::sleep(self.timing.initial_settle).await;

        self.login(credentials).await?;
        self.goto_mesh().await
    }

    async fn login(&self, credentials: &Credentials) -> Result<(), SessionError> {
        let page = self.page.as_ref();
        let Some(password_selector) = first_visible(page, PASSWORD_SELECTORS).await? else {
            info!("no login form, already signed in");
            return Ok(());
        };
        info!(selector = password_selector, "login form found");

        if let Some(user_selector) = first_visible(page, USER_SELECTORS).await? {
            match page.select_option(user_selector, &credentials.username).await {
                Ok(()) => info!(user = %credentials.username, "user selected"),
                Err(err) => debug!(error = %err, "user selection skipped"),
            }
            tokio::time::sleep(USER_SELECT_SETTLE).await;
        }

        let password = credentials
            .password
            .as_deref()
            .ok_or(SessionError::MissingPassword)?;
        page.fill(password_selector, password).await?;
        tokio::time::sleep(INPUT_SETTLE).await;

        match first_visible(page, SUBMIT_SELECTORS).await? {
            Some(submit) => {
                debug!(selector = submit, "clicking login button");
                page.click(submit).await?;
            }
            None => {
                debug!("no login button, submitting form");
                page.submit_enclosing_form(password_selector).await?;
            }
        }
        tokio::time::sleep(self.timing.login_settle).await;

        let deadline = Instant::now() + self.timing.page_load;
        loop {
            match self.login_state(password_selector).await {
                Ok(true) => {
                    info!("login accepted");
                    return Ok(());
                }
                Ok(false) => {}
                Err(err) if err.is_fatal() => return Err(err.into()),
                Err(err) => debug!(error = %err, "login check failed, retrying"),
            }
            if Instant::now() >= deadline {
                warn!("login form still present after submit");
                return Err(SessionError::LoginRejected);
            }
            tokio::time::sleep(LOGIN_POLL).await;
        }
    }

    async fn login_state(&self, password_selector: &str) -> Result<bool, PageError> {
        let url = self.page.current_url().await?;
        let form_visible = self.page.is_visible(password_selector).await?;
        Ok(looks_logged_in(&url, form_visible))
    }

    /// The router's own login form is back, not just some password input.
    async fn login_form_shown(&self, url: &str) -> Result<bool, PageError> {
        let page = self.page.as_ref();
        if first_visible(page, LOGIN_FORM_SELECTORS).await?.is_some() {
            return Ok(true);
        }
        Ok(on_login_page(url) && first_visible(page, PASSWORD_SELECTORS).await?.is_some())
    }

    async fn goto_mesh(&self) -> Result<(), SessionError> {
        let url = mesh_url(&self.base_url, &self.mesh_path);
        info!(url = %url, "navigating to mesh view");
        page::navigate(self.page.as_ref(), &url, self.timing.page_load).await?;
        tokio::time::sleep(self.timing.navigate_settle).await;
        Ok(())
    }

    /// Capture the current view. Screenshot always, outer HTML in live mode.
    pub async fn capture(&mut self, mode: CaptureMode) -> Result<Snapshot, SessionError> {
        let mut url = self.page.current_url().await?;
        if self.login_form_shown(&url).await? {
            return Err(SessionError::SessionExpired);
        }

        if self.follow_mesh && !is_mesh_view(&url, &self.mesh_path) {
            warn!(url = %url, "router left the mesh view");
            self.goto_mesh().await?;
            url = self.page.current_url().await?;
        }

        let png = self.page.screenshot_png().await?;
        let html = match mode {
            CaptureMode::Live => Some(self.page.content().await?),
            CaptureMode::Screenshot => None,
        };

        Ok(Snapshot {
            png,
            html,
            url,
            captured_at_unix: now_unix(),
        })
    }

    /// Navigate elsewhere on the router. Stops snapping back to the mesh view.
    pub async fn navigate(&mut self, requested: &str) -> Result<String, SessionError> {
        let target = resolve_target(&self.base_url, requested)?;
        page::navigate(self.page.as_ref(), &target, self.timing.page_load).await?;
        tokio::time::sleep(NAVIGATE_SETTLE).await;
        self.follow_mesh = is_mesh_view(&target, &self.mesh_path);
        Ok(target)
    }

    pub async fn click(&self, selector: &str) -> Result<(), SessionError> {
        self.page.click(selector).await?;
        tokio::time::sleep(INPUT_SETTLE).await;
        Ok(())
    }

    pub async fn fill(&self, selector: &str, value: &str) -> Result<(), SessionError> {
        self.page.fill(selector, value).await?;
        tokio::time::sleep(INPUT_SETTLE).await;
        Ok(())
    }

    pub fn is_alive(&self) -> bool {
        self.page.is_alive()
    }

    /// Whether the login is older than `refresh_after`. A zero interval never expires.
    pub fn needs_refresh(&self, refresh_after: Duration) -> bool {
        session_due(self.started.elapsed(), refresh_after)
    }

    pub fn started_unix(&self) -> u64 {
        self.started_unix
    }

    pub async fn close(self) {
        self.page.close().await;
    }
}

fn session_due(age: Duration, refresh_after: Duration) -> bool {
    !refresh_after.is_zero() && age >= refresh_after
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::fake::{FakeLauncher, FakePage, OVERVIEW_URL};

    const MESH: &str = "http://fritz.box/#/mesh";

    fn creds(password: Option<&str>) -> Credentials {
        Credentials {
            username: "Admin".to_string(),
            password: password.map(str::to_string),
        }
    }

    async fn open_session(page: &FakePage) -> RouterSession {
        let launcher = FakeLauncher::new(page.clone());
        RouterSession::open(&launcher, &Config::default(), &creds(Some("secret")))
            .await
            .unwrap()
    }

    #[test]
    fn zero_refresh_never_expires() {
        assert!(!session_due(Duration::from_secs(86_400), Duration::ZERO));
    }

    #[test]
    fn refresh_triggers_at_interval() {
        let refresh = Duration::from_secs(900);
        assert!(!session_due(Duration::from_secs(899), refresh));
        assert!(session_due(Duration::from_secs(900), refresh));
    }

    #[test]
    fn credentials_debug_hides_password() {
        let debug = format!("{:?}", creds(Some("hunter2")));
        assert!(debug.contains("Admin"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn fatal_errors_force_new_session() {
        assert!(SessionError::SessionExpired.requires_new_session());
        assert!(SessionError::LoginRejected.requires_new_session());
        assert!(SessionError::Page(PageError::SessionClosed).requires_new_session());
        assert!(!SessionError::Page(PageError::ElementNotFound("#x".into())).requires_new_session());
        assert!(!SessionError::Target(TargetError::Empty).requires_new_session());
    }

    #[tokio::test(start_paused = true)]
    async fn open_logs_in_and_parks_on_mesh() {
        let page = FakePage::login_form();
        let session = open_session(&page).await;

        let state = page.state();
        assert_eq!(state.fills, vec![("#uiPassInput".to_string(), "secret".to_string())]);
        assert_eq!(state.clicks, vec!["#submitLoginBtn".to_string()]);
        assert_eq!(state.gotos.last().map(String::as_str), Some(MESH));
        assert!(!state.closed);
        drop(state);
        assert!(session.is_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_login_closes_the_tab() {
        let page = FakePage::login_form();
        page.state().accept_login = false;
        let launcher = FakeLauncher::new(page.clone());

        let err = RouterSession::open(&launcher, &Config::default(), &creds(Some("wrong")))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::LoginRejected));
        assert!(page.state().closed);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_password_closes_the_tab() {
        let page = FakePage::login_form();
        let launcher = FakeLauncher::new(page.clone());

        let err = RouterSession::open(&launcher, &Config::default(), &creds(None))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::MissingPassword));
        assert!(page.state().closed);
    }

    #[tokio::test(start_paused = true)]
    async fn returning_login_form_means_expired() {
        let page = FakePage::login_form();
        let mut session = open_session(&page).await;

        page.show_login_form();
        let err = session.capture(CaptureMode::Screenshot).await.unwrap_err();
        assert!(matches!(err, SessionError::SessionExpired));
    }

    #[tokio::test(start_paused = true)]
    async fn password_field_on_settings_page_is_not_expiry() {
        let page = FakePage::login_form();
        let mut session = open_session(&page).await;

        session.navigate("#/wlan/security").await.unwrap();
        page.state()
            .visible
            .insert("input[type='password']".to_string());

        let snapshot = session.capture(CaptureMode::Screenshot).await.unwrap();
        assert_eq!(snapshot.url, "http://fritz.box/#/wlan/security");
        assert_eq!(
            page.state().gotos.last().map(String::as_str),
            Some("http://fritz.box/#/wlan/security")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn capture_snaps_back_to_mesh() {
        let page = FakePage::login_form();
        let mut session = open_session(&page).await;

        page.state().url = OVERVIEW_URL.to_string();
        let snapshot = session.capture(CaptureMode::Live).await.unwrap();
        assert_eq!(snapshot.url, MESH);
        assert!(snapshot.html.unwrap().contains("#/mesh"));
        assert_eq!(snapshot.png, vec![0x89, b'P', b'N', b'G']);
    }

    #[tokio::test(start_paused = true)]
    async fn navigating_back_to_mesh_resumes_following() {
        let page = FakePage::login_form();
        let mut session = open_session(&page).await;

        session.navigate("#/wlan").await.unwrap();
        page.state().url = OVERVIEW_URL.to_string();
        let snapshot = session.capture(CaptureMode::Screenshot).await.unwrap();
        assert_eq!(snapshot.url, OVERVIEW_URL);

        session.navigate("/#/mesh").await.unwrap();
        page.state().url = OVERVIEW_URL.to_string();
        let snapshot = session.capture(CaptureMode::Screenshot).await.unwrap();
        assert_eq!(snapshot.url, MESH);
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_navigation_is_rejected_without_leaving_the_page() {
        let page = FakePage::login_form();
        let mut session = open_session(&page).await;
        let before = page.state().gotos.len();

        let err = session.navigate("http://example.com/").await.unwrap_err();
        assert!(matches!(err, SessionError::Target(TargetError::ForeignHost(_))));
        assert_eq!(page.state().gotos.len(), before);
    }
}
