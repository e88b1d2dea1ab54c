//! Chromium-backed page provider using chromiumoxide.

use super::{
    script, ElementRef, ElementState, MutationRecord, PageError, PageProvider, SubscriptionId,
};
use crate::ops::{Operation, OperationOutput};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

/// Find the Chromium binary path.
pub fn find_chromium() -> Option<PathBuf> {
    // 1. TRELLIS_CHROMIUM_PATH env
    if let Ok(p) = std::env::var("TRELLIS_CHROMIUM_PATH") {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
    }

    // 2. ~/.trellis/chromium/
    if let Some(home) = dirs::home_dir() {
        let candidates = if cfg!(target_os = "macos") {
            vec![
                home.join(".trellis/chromium/chrome-mac-arm64/Google Chrome for Testing.app/Contents/MacOS/Google Chrome for Testing"),
                home.join(".trellis/chromium/chrome-mac-x64/Google Chrome for Testing.app/Contents/MacOS/Google Chrome for Testing"),
                home.join(".trellis/chromium/chrome"),
            ]
        } else {
            vec![
                home.join(".trellis/chromium/chrome-linux64/chrome"),
                home.join(".trellis/chromium/chrome"),
            ]
        };
        for c in candidates {
            if c.exists() {
                return Some(c);
            }
        }
    }

    // 3. System PATH
    for name in ["google-chrome", "chromium", "chromium-browser"] {
        if let Ok(path) = which::which(name) {
            return Some(path);
        }
    }

    // 4. Common macOS location
    if cfg!(target_os = "macos") {
        let common =
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome");
        if common.exists() {
            return Some(common);
        }
    }

    None
}

/// Envelope every generated script evaluates to.
#[derive(Debug, Deserialize)]
struct ScriptReply<T> {
    #[serde(default = "Option::default")]
    ok: Option<T>,
    #[serde(default)]
    detached: bool,
    #[serde(default)]
    error: Option<String>,
}

/// A live page in a headless Chromium instance.
pub struct ChromiumPage {
    browser: Browser,
    page: Page,
    handler: JoinHandle<()>,
}

impl ChromiumPage {
    /// Launch headless Chromium and navigate to `url`.
    pub async fn launch(url: &str, timeout_ms: u64) -> Result<Self> {
        let chrome_path = find_chromium()
            .context("Chromium not found. Set TRELLIS_CHROMIUM_PATH or install Chrome.")?;

        let config = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-background-networking")
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("failed to launch Chromium")?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                let _ = event;
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .context("failed to create new page")?;

        let chromium = Self {
            browser,
            page,
            handler,
        };
        chromium.navigate(url, timeout_ms).await?;
        Ok(chromium)
    }

    /// Navigate the page. Element references from the previous document
    /// become detached.
    pub async fn navigate(&self, url: &str, timeout_ms: u64) -> Result<u64> {
        let start = Instant::now();
        let result =
            tokio::time::timeout(Duration::from_millis(timeout_ms), self.page.goto(url)).await;

        match result {
            Ok(Ok(_)) => {
                let _ = self.page.wait_for_navigation().await;
                let load_time_ms = start.elapsed().as_millis() as u64;
                debug!(url, load_time_ms, "page loaded");
                Ok(load_time_ms)
            }
            Ok(Err(e)) => bail!("navigation failed: {e}"),
            Err(_) => bail!("navigation timed out after {timeout_ms}ms"),
        }
    }

    /// Close the page and the browser.
    pub async fn close(mut self) -> Result<()> {
        let _ = self.page.close().await;
        let _ = self.browser.close().await;
        self.handler.abort();
        Ok(())
    }

    async fn eval<T: DeserializeOwned>(&self, script: String) -> Result<ScriptReply<T>> {
        let result = self
            .page
            .evaluate(script)
            .await
            .context("JS execution failed")?;
        let value: serde_json::Value = result
            .into_value()
            .map_err(|e| anyhow::anyhow!("failed to convert JS result: {e:?}"))?;
        serde_json::from_value(value).context("unexpected script reply")
    }
}

#[async_trait]
impl PageProvider for ChromiumPage {
    async fn query_all(&self, scope: Option<&ElementRef>, selector: &str) -> Result<Vec<ElementRef>> {
        let reply: ScriptReply<Vec<String>> = self.eval(script::query_all(scope, selector)?).await?;
        if reply.detached {
            if let Some(scope) = scope {
                return Err(PageError::Detached(scope.clone()).into());
            }
        }
        if let Some(error) = reply.error {
            if error.contains("not a valid selector") {
                return Err(PageError::InvalidSelector(selector.to_string()).into());
            }
            bail!("query `{selector}` failed: {error}");
        }
        Ok(reply
            .ok
            .unwrap_or_default()
            .into_iter()
            .map(ElementRef)
            .collect())
    }

    async fn element_state(&self, element: &ElementRef) -> Result<Option<ElementState>> {
        let reply: ScriptReply<ElementState> = self.eval(script::element_state(element)?).await?;
        if let Some(error) = reply.error {
            bail!("reading state of {element} failed: {error}");
        }
        Ok(reply.ok)
    }

    async fn perform(&self, element: &ElementRef, operation: &Operation) -> Result<OperationOutput> {
        let reply: ScriptReply<OperationOutput> =
            self.eval(script::perform(element, operation)?).await?;
        if reply.detached {
            return Err(PageError::Detached(element.clone()).into());
        }
        if let Some(error) = reply.error {
            return Err(PageError::NotInteractable(element.clone(), error).into());
        }
        reply
            .ok
            .with_context(|| format!("{} on {element} returned no output", operation.kind()))
    }

    async fn observe(&self, element: &ElementRef) -> Result<SubscriptionId> {
        let reply: ScriptReply<u64> = self.eval(script::observe(element)?).await?;
        if reply.detached {
            return Err(PageError::Detached(element.clone()).into());
        }
        if let Some(error) = reply.error {
            bail!("observing {element} failed: {error}");
        }
        reply
            .ok
            .map(SubscriptionId)
            .with_context(|| format!("observing {element} returned no subscription"))
    }

    async fn unobserve(&self, subscription: SubscriptionId) -> Result<()> {
        let reply: ScriptReply<bool> = self.eval(script::unobserve(subscription)).await?;
        if reply.error.is_some() {
            return Err(PageError::UnknownSubscription(subscription).into());
        }
        Ok(())
    }

    async fn take_mutations(&self) -> Result<Vec<MutationRecord>> {
        let reply: ScriptReply<Vec<MutationRecord>> =
            self.eval(script::take_mutations()).await?;
        if let Some(error) = reply.error {
            bail!("draining mutations failed: {error}");
        }
        Ok(reply.ok.unwrap_or_default())
    }

    async fn url(&self) -> Result<String> {
        let url = self
            .page
            .url()
            .await
            .context("failed to get URL")?
            .map(|u| u.to_string())
            .unwrap_or_default();
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::OperationKind;

    #[test]
    fn test_script_reply_shapes() {
        let ok: ScriptReply<Vec<String>> =
            serde_json::from_str(r#"{ "ok": ["1", "2"] }"#).unwrap();
        assert_eq!(ok.ok.unwrap(), vec!["1", "2"]);

        let detached: ScriptReply<Vec<String>> =
            serde_json::from_str(r#"{ "detached": true }"#).unwrap();
        assert!(detached.detached && detached.ok.is_none());

        let gone: ScriptReply<ElementState> = serde_json::from_str(r#"{ "ok": null }"#).unwrap();
        assert!(gone.ok.is_none());

        let output: ScriptReply<OperationOutput> =
            serde_json::from_str(r#"{ "ok": { "kind": "scrolled", "scroll_top": 800, "at_end": false } }"#)
                .unwrap();
        assert!(matches!(
            output.ok,
            Some(OperationOutput::Scrolled { at_end: false, .. })
        ));
    }

    #[tokio::test]
    #[ignore] // Requires Chromium to be installed
    async fn test_chromium_query_and_click() {
        let page = ChromiumPage::launch(
            "data:text/html,<div id='feed'><button class='item'>A</button><button class='item'>B</button></div>",
            10_000,
        )
        .await
        .expect("failed to launch");

        let feed = page.query_all(None, "#feed").await.unwrap();
        assert_eq!(feed.len(), 1);
        let items = page.query_all(Some(&feed[0]), ".item").await.unwrap();
        assert_eq!(items.len(), 2);

        let again = page.query_all(Some(&feed[0]), ".item").await.unwrap();
        assert_eq!(items, again, "element references are stable");

        let state = page.element_state(&items[0]).await.unwrap().unwrap();
        assert!(state.is_visible());

        let sub = page.observe(&feed[0]).await.unwrap();
        let out = page.perform(&items[1], &Operation::Click).await.unwrap();
        assert_eq!(out, OperationOutput::Clicked);
        page.unobserve(sub).await.unwrap();

        let extracted = page
            .perform(&items[0], &Operation::Extract { fields: Vec::new() })
            .await
            .unwrap();
        assert!(matches!(extracted, OperationOutput::Extracted { .. }));
        assert_eq!(Operation::Click.kind(), OperationKind::Click);

        page.close().await.unwrap();
    }
}
