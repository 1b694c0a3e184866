//! FRITZ!Box UI scripting: selector chains, URL heuristics and the logged-in
//! browser session built on top of them.
//!
//! The router UI is obfuscated and changes between firmware releases, so every
//! element lookup walks a fallback chain from the most specific id to a generic
//! form selector.

mod session;

pub use session::{Credentials, RouterSession, SessionError};

use url::Url;

pub const PASSWORD_SELECTORS: &[&str] = &[
    "#uiPassInput",
    "#uiPass",
    "input[type='password']",
];

/// Ids only the router's own login page uses. Settings pages have password
/// inputs too, so these are what tells an expired session apart.
pub const LOGIN_FORM_SELECTORS: &[&str] = &["#uiPassInput", "#uiPass"];

pub const USER_SELECTORS: &[&str] = &[
    "#uiViewUser",
    "select[name='username']",
    "input[name='username']",
];

pub const SUBMIT_SELECTORS: &[&str] = &[
    "#submitLoginBtn",
    "#submitLogin",
    "button[type='submit']",
    "input[type='submit']",
];

const LOGIN_URL_MARKERS: &[&str] = &["login", "lp="];

/// Login succeeded once the password field is gone and the URL left the login page.
pub fn looks_logged_in(url: &str, password_field_visible: bool) -> bool {
    !password_field_visible && !on_login_page(url)
}

pub fn on_login_page(url: &str) -> bool {
    let url = url.to_ascii_lowercase();
    LOGIN_URL_MARKERS.iter().any(|marker| url.contains(marker))
}

pub fn mesh_url(base: &str, mesh_path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), mesh_path.trim_start_matches('/'))
}

pub fn is_mesh_view(url: &str, mesh_path: &str) -> bool {
    let marker = mesh_path.trim_start_matches('/');
    !marker.is_empty() && url.contains(marker)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetError {
    #[error("url is required")]
    Empty,
    #[error("invalid url: {0}")]
    Invalid(String),
    #[error("refusing to leave the router: {0}")]
    ForeignHost(String),
    #[error("unsupported url scheme: {0}")]
    UnsupportedScheme(String),
}

/// Map a remote-control navigation request onto the router.
///
/// Relative paths and `#/` fragments are joined onto `base`. Absolute URLs must
/// point at the router itself.
pub fn resolve_target(base: &str, requested: &str) -> Result<String, TargetError> {
    let requested = requested.trim();
    if requested.is_empty() {
        return Err(TargetError::Empty);
    }

    let base_url = Url::parse(base).map_err(|e| TargetError::Invalid(e.to_string()))?;

    if let Some((scheme, _)) = requested.split_once("://") {
        if scheme != "http" && scheme != "https" {
            return Err(TargetError::UnsupportedScheme(scheme.to_string()));
        }
        let target = Url::parse(requested).map_err(|e| TargetError::Invalid(e.to_string()))?;
        let same_host = target.host_str() == base_url.host_str()
            && target.port_or_known_default() == base_url.port_or_known_default();
        if !same_host {
            return Err(TargetError::ForeignHost(
                target.host_str().unwrap_or_default().to_string(),
            ));
        }
        return Ok(target.to_string());
    }

    if let Some((scheme, _)) = requested.split_once(':') {
        let scheme = scheme.to_ascii_lowercase();
        if scheme == "javascript" || scheme == "data" || scheme == "file" {
            return Err(TargetError::UnsupportedScheme(scheme));
        }
    }

    Ok(format!(
        "{}/{}",
        base.trim_end_matches('/'),
        requested.trim_start_matches('/')
    ))
}
