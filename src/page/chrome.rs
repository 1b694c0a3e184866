use super::{element_script, PageDriver, PageError, PageLauncher};
use crate::browser::Browser;
use crate::config::BrowserConfig;
use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Launches (or attaches to) Chromium and opens one tab per session.
#[derive(Debug, Clone)]
pub struct ChromeLauncher {
    config: BrowserConfig,
}

impl ChromeLauncher {
    pub fn new(config: BrowserConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PageLauncher for ChromeLauncher {
    async fn open(&self) -> Result<Box<dyn PageDriver>, PageError> {
        let browser = Browser::start(&self.config).await?;
        let page = match browser.new_page().await {
            Ok(page) => page,
            Err(err) => {
                browser.shutdown().await;
                return Err(err.into());
            }
        };

        let driver = Box::new(ChromePage {
            page,
            alive: browser.liveness(),
            browser: Mutex::new(browser),
        });
        if let Err(err) = driver.prepare(&self.config).await {
            driver.close().await;
            return Err(err);
        }
        Ok(driver)
    }
}

struct ChromePage {
    page: Page,
    // Only taken on close; keeps the driver Sync.
    browser: Mutex<Browser>,
    alive: Arc<AtomicBool>,
}

impl ChromePage {
    async fn prepare(&self, cfg: &BrowserConfig) -> Result<(), PageError> {
        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(i64::from(cfg.viewport_width))
            .height(i64::from(cfg.viewport_height))
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(PageError::Protocol)?;
        self.page.execute(metrics).await.map_err(|e| self.error(e))?;
        self.page
            .execute(SetUserAgentOverrideParams::new(cfg.user_agent.clone()))
            .await
            .map_err(|e| self.error(e))?;
        Ok(())
    }

    fn error(&self, err: chromiumoxide::error::CdpError) -> PageError {
        classify(self.alive.load(Ordering::SeqCst), err)
    }

    async fn eval(&self, script: &str) -> Result<Value, PageError> {
        let result = self
            .page
            .evaluate(script)
            .await
            .map_err(|e| self.error(e))?;
        Ok(result.value().cloned().unwrap_or(Value::Null))
    }

    async fn expect_element(&self, selector: &str, body: &str) -> Result<(), PageError> {
        match self.eval(&element_script(selector, body, "false")).await? {
            Value::Bool(true) => Ok(()),
            _ => Err(PageError::ElementNotFound(selector.to_string())),
        }
    }
}

/// Requests fail in many ways once the socket drops; report all of them as closed.
fn classify(alive: bool, err: impl std::fmt::Display) -> PageError {
    if alive {
        PageError::Protocol(err.to_string())
    } else {
        PageError::SessionClosed
    }
}

#[async_trait]
impl PageDriver for ChromePage {
    async fn goto(&self, url: &str) -> Result<(), PageError> {
        self.page
            .goto(url)
            .await
            .map_err(|e| match self.error(e) {
                PageError::Protocol(msg) => PageError::NavigationFailed(format!("{}: {}", url, msg)),
                other => other,
            })?;
        Ok(())
    }

    async fn ready_state(&self) -> Result<String, PageError> {
        Ok(self
            .eval("document.readyState")
            .await?
            .as_str()
            .unwrap_or_default()
            .to_string())
    }

    async fn current_url(&self) -> Result<String, PageError> {
        let url = self.page.url().await.map_err(|e| self.error(e))?;
        Ok(url.unwrap_or_default())
    }

    async fn content(&self) -> Result<String, PageError> {
        self.page.content().await.map_err(|e| self.error(e))
    }

    async fn is_visible(&self, selector: &str) -> Result<bool, PageError> {
        let script = element_script(
            selector,
            "return !!(el.offsetWidth || el.offsetHeight || el.getClientRects().length);",
            "false",
        );
        Ok(self.eval(&script).await?.as_bool().unwrap_or(false))
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), PageError> {
        let value = Value::from(value).to_string();
        let body = format!(
            "el.focus();
             const desc = Object.getOwnPropertyDescriptor(Object.getPrototypeOf(el), 'value');
             if (desc && desc.set) {{ desc.set.call(el, {value}); }} else {{ el.value = {value}; }}
             el.dispatchEvent(new Event('input', {{ bubbles: true }}));
             el.dispatchEvent(new Event('change', {{ bubbles: true }}));
             return true;"
        );
        self.expect_element(selector, &body).await
    }

    async fn select_option(&self, selector: &str, value: &str) -> Result<(), PageError> {
        let quoted = Value::from(value).to_string();
        let body = format!(
            "if (el.tagName === 'SELECT') {{
               const opt = Array.from(el.options).find(o => o.value === {quoted} || o.text.trim() === {quoted});
               if (!opt) {{ return 'no-option'; }}
               el.value = opt.value;
             }} else {{
               el.value = {quoted};
             }}
             el.dispatchEvent(new Event('input', {{ bubbles: true }}));
             el.dispatchEvent(new Event('change', {{ bubbles: true }}));
             return true;"
        );
        match self.eval(&element_script(selector, &body, "false")).await? {
            Value::Bool(true) => Ok(()),
            Value::String(s) if s == "no-option" => Err(PageError::ElementNotFound(format!(
                "{} has no option {}",
                selector, value
            ))),
            _ => Err(PageError::ElementNotFound(selector.to_string())),
        }
    }

    async fn click(&self, selector: &str) -> Result<(), PageError> {
        let element = self.page.find_element(selector).await.map_err(|e| {
            match self.error(e) {
                PageError::Protocol(_) => PageError::ElementNotFound(selector.to_string()),
                other => other,
            }
        })?;
        element.click().await.map_err(|e| self.error(e))?;
        Ok(())
    }

    async fn submit_enclosing_form(&self, selector: &str) -> Result<(), PageError> {
        self.expect_element(
            selector,
            "const form = el.closest('form');
             if (!form) { return false; }
             if (form.requestSubmit) { form.requestSubmit(); } else { form.submit(); }
             return true;",
        )
        .await
    }

    async fn screenshot_png(&self) -> Result<Vec<u8>, PageError> {
        self.page
            .screenshot(
                ScreenshotParams::builder()
                    .format(CaptureScreenshotFormat::Png)
                    .build(),
            )
            .await
            .map_err(|e| self.error(e))
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(self: Box<Self>) {
        let ChromePage { page, browser, .. } = *self;
        if let Err(err) = page.close().await {
            tracing::debug!(error = %err, "closing page failed");
        }
        let browser = browser
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        browser.shutdown().await;
    }
}
