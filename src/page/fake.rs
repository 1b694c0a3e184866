//! Scripted stand-in for a router tab.

use super::{PageDriver, PageError, PageLauncher};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

pub(crate) const LOGIN_URL: &str = "http://fritz.box/";
pub(crate) const OVERVIEW_URL: &str = "http://fritz.box/?sid=1#/overview";

#[derive(Debug)]
pub(crate) struct FakeState {
    pub url: String,
    pub visible: HashSet<String>,
    /// Clicking the login button logs in when set.
    pub accept_login: bool,
    pub alive: bool,
    pub closed: bool,
    pub ready_state: String,
    /// Consumed front to back before `ready_state` applies.
    pub ready_states: Vec<String>,
    pub fail_screenshot: bool,
    pub gotos: Vec<String>,
    pub clicks: Vec<String>,
    pub fills: Vec<(String, String)>,
}

#[derive(Clone)]
pub(crate) struct FakePage {
    state: Arc<Mutex<FakeState>>,
}

impl FakePage {
    pub fn new(url: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                url: url.to_string(),
                visible: HashSet::new(),
                accept_login: true,
                alive: true,
                closed: false,
                ready_state: "complete".to_string(),
                ready_states: Vec::new(),
                fail_screenshot: false,
                gotos: Vec::new(),
                clicks: Vec::new(),
                fills: Vec::new(),
            })),
        }
    }

    /// A FRITZ!Box showing its login form.
    pub fn login_form() -> Self {
        let page = Self::new(LOGIN_URL);
        page.show_login_form();
        page
    }

    pub fn show_login_form(&self) {
        let mut state = self.state();
        state.url = LOGIN_URL.to_string();
        for selector in ["#uiPassInput", "#uiViewUser", "#submitLoginBtn"] {
            state.visible.insert(selector.to_string());
        }
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    fn check_alive(&self) -> Result<MutexGuard<'_, FakeState>, PageError> {
        let state = self.state();
        if state.alive {
            Ok(state)
        } else {
            Err(PageError::SessionClosed)
        }
    }
}

#[async_trait]
impl PageDriver for FakePage {
    async fn goto(&self, url: &str) -> Result<(), PageError> {
        let mut state = self.check_alive()?;
        state.url = url.to_string();
        state.gotos.push(url.to_string());
        Ok(())
    }

    async fn ready_state(&self) -> Result<String, PageError> {
        let mut state = self.check_alive()?;
        if state.ready_states.is_empty() {
            Ok(state.ready_state.clone())
        } else {
            Ok(state.ready_states.remove(0))
        }
    }

    async fn current_url(&self) -> Result<String, PageError> {
        Ok(self.check_alive()?.url.clone())
    }

    async fn content(&self) -> Result<String, PageError> {
        let state = self.check_alive()?;
        Ok(format!("<html><body data-url=\"{}\"></body></html>", state.url))
    }

    async fn is_visible(&self, selector: &str) -> Result<bool, PageError> {
        Ok(self.check_alive()?.visible.contains(selector))
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), PageError> {
        let mut state = self.check_alive()?;
        if !state.visible.contains(selector) {
            return Err(PageError::ElementNotFound(selector.to_string()));
        }
        state.fills.push((selector.to_string(), value.to_string()));
        Ok(())
    }

    async fn select_option(&self, selector: &str, _value: &str) -> Result<(), PageError> {
        let state = self.check_alive()?;
        if state.visible.contains(selector) {
            Ok(())
        } else {
            Err(PageError::ElementNotFound(selector.to_string()))
        }
    }

    async fn click(&self, selector: &str) -> Result<(), PageError> {
        let mut state = self.check_alive()?;
        if !state.visible.contains(selector) {
            return Err(PageError::ElementNotFound(selector.to_string()));
        }
        state.clicks.push(selector.to_string());
        if selector == "#submitLoginBtn" && state.accept_login {
            state.visible.clear();
            state.url = OVERVIEW_URL.to_string();
        }
        Ok(())
    }

    async fn submit_enclosing_form(&self, selector: &str) -> Result<(), PageError> {
        self.click(selector).await
    }

    async fn screenshot_png(&self) -> Result<Vec<u8>, PageError> {
        let state = self.check_alive()?;
        if state.fail_screenshot {
            return Err(PageError::Protocol("screenshot failed".to_string()));
        }
        Ok(vec![0x89, b'P', b'N', b'G'])
    }

    fn is_alive(&self) -> bool {
        self.state().alive
    }

    async fn close(self: Box<Self>) {
        self.state().closed = true;
    }
}

/// Hands out clones of one scripted page, or fails when `fail_launch` is set.
#[derive(Clone)]
pub(crate) struct FakeLauncher {
    pub page: FakePage,
    pub fail_launch: bool,
    opened: Arc<AtomicUsize>,
}

impl FakeLauncher {
    pub fn new(page: FakePage) -> Self {
        Self {
            page,
            fail_launch: false,
            opened: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_launch: true,
            ..Self::new(FakePage::new("about:blank"))
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageLauncher for FakeLauncher {
    async fn open(&self) -> Result<Box<dyn PageDriver>, PageError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        if self.fail_launch {
            return Err(PageError::Browser(crate::browser::BrowserError::ChromeNotFound));
        }
        {
            let mut state = self.page.state();
            state.closed = false;
            state.alive = true;
        }
        self.page.show_login_form();
        Ok(Box::new(self.page.clone()))
    }
}
