//! headless_chrome implementation of the page capabilities.
//!
//! headless_chrome is synchronous, so every command runs on the blocking pool
//! with its own clone of the `Arc<Tab>`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, LaunchOptions, Tab};
use regex::Regex;
use serde_json::json;
use std::collections::HashSet;
use std::ffi::OsStr;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::BrowserConfig;
use crate::dom::{self, ElementSource};
use crate::error::BrowserError;
use crate::hands::BrowserPage;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const MARKER_ATTR: &str = "data-webpilot-target";

static HAS_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z][a-z0-9-]*):has-text\('(.*)'\)$").expect("valid has-text regex")
});

const IS_RENDERED_JS: &str = r#"function() {
  const r = this.getBoundingClientRect();
  const s = window.getComputedStyle(this);
  return r.width > 0 && r.height > 0 && s.display !== 'none' && s.visibility !== 'hidden';
}"#;

const GET_ATTRIBUTE_JS: &str = "function(name) { return this.getAttribute(name); }";

const FILL_JS: &str = r#"function(value) {
  this.focus();
  this.value = value;
  this.dispatchEvent(new Event('input', { bubbles: true }));
  this.dispatchEvent(new Event('change', { bubbles: true }));
}"#;

/// One browser tab plus the browser it belongs to.
#[derive(Clone)]
pub struct ChromePage {
    browser: Arc<Browser>,
    tab: Arc<Tab>,
}

impl ChromePage {
    /// Attach to a running Chrome if `attach_url` is set and reachable,
    /// otherwise launch one with a persistent profile.
    pub fn launch(config: &BrowserConfig) -> Result<Self> {
        if let Some(url) = &config.attach_url {
            info!(%url, "attempting to attach to existing Chrome");
            match Browser::connect(url.clone()) {
                Ok(browser) => {
                    let existing = browser
                        .get_tabs()
                        .lock()
                        .map_err(|_| anyhow::anyhow!("tab list lock poisoned"))?
                        .first()
                        .cloned();
                    let tab = match existing {
                        Some(tab) => tab,
                        None => browser.new_tab().context("failed to open a tab")?,
                    };
                    info!("attached to existing Chrome");
                    return Ok(Self {
                        browser: Arc::new(browser),
                        tab,
                    });
                }
                Err(e) => warn!(error = %e, "could not attach, launching a new Chrome"),
            }
        }

        let profile = profile_dir(config)?;
        let options = LaunchOptions {
            headless: config.headless,
            path: config.chrome_path.clone(),
            user_data_dir: Some(profile.clone()),
            args: vec![
                OsStr::new("--no-first-run"),
                OsStr::new("--no-default-browser-check"),
                OsStr::new("--disable-blink-features=AutomationControlled"),
                OsStr::new("--disable-infobars"),
            ],
            idle_browser_timeout: Duration::from_secs(600),
            ..Default::default()
        };

        info!(profile = %profile.display(), headless = config.headless, "starting Chrome");
        let browser = Browser::new(options).context("browser launch failed")?;
        let tab = browser.new_tab().context("failed to open a tab")?;
        info!("Chrome ready");

        Ok(Self {
            browser: Arc::new(browser),
            tab,
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, BrowserError>
    where
        F: FnOnce(&Browser, &Arc<Tab>) -> Result<T, BrowserError> + Send + 'static,
        T: Send + 'static,
    {
        let browser = self.browser.clone();
        let tab = self.tab.clone();
        tokio::task::spawn_blocking(move || f(&browser, &tab))
            .await
            .map_err(|e| BrowserError::Driver(format!("browser task failed: {e}")))?
    }
}

fn profile_dir(config: &BrowserConfig) -> Result<std::path::PathBuf> {
    let dir = match &config.profile_dir {
        Some(dir) => dir.clone(),
        None => dirs::data_local_dir()
            .context("no local data directory")?
            .join("webpilot")
            .join("profile"),
    };
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    Ok(dir)
}

fn unescape_text(escaped: &str) -> String {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Turn a selector into plain CSS. `tag:has-text('...')` is not CSS, so the
/// matching element is marked with an attribute and selected through it.
fn css_selector(tab: &Tab, selector: &str) -> Result<String, BrowserError> {
    let Some(caps) = HAS_TEXT.captures(selector) else {
        return Ok(selector.to_string());
    };
    let tag = caps[1].to_string();
    let text = unescape_text(&caps[2]);

    let script = format!(
        r#"(() => {{
  const norm = s => (s || '').replace(/\s+/g, '');
  document.querySelectorAll('[{MARKER_ATTR}]').forEach(e => e.removeAttribute('{MARKER_ATTR}'));
  const want = norm({want});
  for (const el of document.querySelectorAll({tag})) {{
    if (norm(el.getAttribute('aria-label') || el.textContent) === want) {{
      el.setAttribute('{MARKER_ATTR}', '1');
      return true;
    }}
  }}
  return false;
}})()"#,
        want = json!(text),
        tag = json!(tag),
    );

    let found = tab
        .evaluate(&script, false)
        .map_err(|e| BrowserError::Script(e.to_string()))?
        .value
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    if found {
        Ok(format!("[{MARKER_ATTR}=\"1\"]"))
    } else {
        Err(BrowserError::NotFound(selector.to_string()))
    }
}

/// Poll until the selector resolves to a rendered element.
fn wait_rendered(tab: &Tab, selector: &str, timeout: Duration) -> Result<String, BrowserError> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(css) = css_selector(tab, selector) {
            if let Ok(element) = tab.find_element(&css) {
                let rendered = element
                    .call_js_fn(IS_RENDERED_JS, vec![], false)
                    .ok()
                    .and_then(|r| r.value)
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                if rendered {
                    return Ok(css);
                }
            }
        }
        if Instant::now() >= deadline {
            return Err(BrowserError::timeout(format!("'{selector}' to become visible"), timeout));
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

#[async_trait]
impl ElementSource for ChromePage {
    async fn list_interactive_fragments(&self) -> Result<Vec<String>, BrowserError> {
        self.blocking(|_, tab| {
            let result = tab
                .evaluate(dom::EXTRACT_JS, false)
                .map_err(|e| BrowserError::Script(e.to_string()))?;
            dom::decode_fragments(result.value)
        })
        .await
    }
}

#[async_trait]
impl BrowserPage for ChromePage {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        let url = url.to_string();
        self.blocking(move |_, tab| {
            tab.navigate_to(&url)
                .and_then(|t| t.wait_until_navigated())
                .map_err(BrowserError::driver)?;
            Ok(())
        })
        .await
    }

    async fn wait_visible(&self, selector: &str, timeout: Duration) -> Result<(), BrowserError> {
        let selector = selector.to_string();
        self.blocking(move |_, tab| wait_rendered(tab, &selector, timeout).map(|_| ()))
            .await
    }

    async fn attribute(&self, selector: &str, name: &str) -> Result<Option<String>, BrowserError> {
        let selector = selector.to_string();
        let name = name.to_string();
        self.blocking(move |_, tab| {
            let css = css_selector(tab, &selector)?;
            let element = tab
                .find_element(&css)
                .map_err(|_| BrowserError::NotFound(selector.clone()))?;
            let value = element
                .call_js_fn(GET_ATTRIBUTE_JS, vec![json!(name)], false)
                .map_err(|e| BrowserError::Script(e.to_string()))?
                .value;
            Ok(value.and_then(|v| v.as_str().map(String::from)))
        })
        .await
    }

    async fn click(&self, selector: &str) -> Result<(), BrowserError> {
        let selector = selector.to_string();
        self.blocking(move |_, tab| {
            let css = css_selector(tab, &selector)?;
            let element = tab
                .find_element(&css)
                .map_err(|_| BrowserError::NotFound(selector.clone()))?;
            element.click().map_err(BrowserError::driver)?;
            Ok(())
        })
        .await
    }

    async fn click_into_new_page(&self, selector: &str, timeout: Duration) -> Result<Self, BrowserError> {
        let selector = selector.to_string();
        let new_tab = self
            .blocking(move |browser, tab| {
                let known: HashSet<String> = browser
                    .get_tabs()
                    .lock()
                    .map_err(|_| BrowserError::Driver("tab list lock poisoned".into()))?
                    .iter()
                    .map(|t| t.get_target_id().to_string())
                    .collect();

                let css = css_selector(tab, &selector)?;
                tab.find_element(&css)
                    .map_err(|_| BrowserError::NotFound(selector.clone()))?
                    .click()
                    .map_err(BrowserError::driver)?;

                let deadline = Instant::now() + timeout;
                loop {
                    let opened = browser
                        .get_tabs()
                        .lock()
                        .map_err(|_| BrowserError::Driver("tab list lock poisoned".into()))?
                        .iter()
                        .find(|t| !known.contains(t.get_target_id().as_str()))
                        .cloned();
                    if let Some(opened) = opened {
                        return Ok(opened);
                    }
                    if Instant::now() >= deadline {
                        return Err(BrowserError::NoNewPage(timeout));
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
            })
            .await?;

        Ok(Self {
            browser: self.browser.clone(),
            tab: new_tab,
        })
    }

    async fn fill(&self, selector: &str, value: &str, timeout: Duration) -> Result<(), BrowserError> {
        let selector = selector.to_string();
        let value = value.to_string();
        self.blocking(move |_, tab| {
            let css = wait_rendered(tab, &selector, timeout)?;
            let element = tab
                .find_element(&css)
                .map_err(|_| BrowserError::NotFound(selector.clone()))?;
            element
                .call_js_fn(FILL_JS, vec![json!(value)], false)
                .map_err(|e| BrowserError::Script(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn type_text(&self, text: &str) -> Result<(), BrowserError> {
        let text = text.to_string();
        self.blocking(move |_, tab| {
            tab.type_str(&text).map_err(BrowserError::driver)?;
            Ok(())
        })
        .await
    }

    async fn wait_for_content_loaded(&self, timeout: Duration) -> Result<(), BrowserError> {
        self.blocking(move |_, tab| {
            let deadline = Instant::now() + timeout;
            loop {
                // Evaluation fails while a navigation swaps the document; keep polling.
                let state = tab
                    .evaluate("document.readyState", false)
                    .ok()
                    .and_then(|r| r.value)
                    .and_then(|v| v.as_str().map(String::from));
                if matches!(state.as_deref(), Some("interactive" | "complete")) {
                    return Ok(());
                }
                if Instant::now() >= deadline {
                    return Err(BrowserError::timeout("the page to finish loading", timeout));
                }
                std::thread::sleep(POLL_INTERVAL);
            }
        })
        .await
    }

    async fn screenshot_png(&self) -> Result<Vec<u8>, BrowserError> {
        self.blocking(|_, tab| {
            tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)
                .map_err(BrowserError::driver)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_text_selectors_are_recognised() {
        let caps = HAS_TEXT.captures(r"button:has-text('Don\'t panic')").unwrap();
        assert_eq!(&caps[1], "button");
        assert_eq!(unescape_text(&caps[2]), "Don't panic");
        assert!(HAS_TEXT.captures("#submit").is_none());
        assert!(HAS_TEXT.captures("a[name='x']").is_none());
    }

    #[test]
    fn unescape_handles_backslashes() {
        assert_eq!(unescape_text(r#"a \"b\" c\\d"#), r#"a "b" c\d"#);
    }
}
