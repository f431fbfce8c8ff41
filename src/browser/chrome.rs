use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::input::{DispatchKeyEventParams, DispatchKeyEventType};
use chromiumoxide::{Browser as Chromium, BrowserConfig, Page};
use futures::StreamExt;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Browser, BrowserError, PageScript, WaitUntil};
use crate::config::BrowserSettings;

const READY_STATE_TIMEOUT: Duration = Duration::from_secs(30);
const NETWORK_QUIET: Duration = Duration::from_millis(500);

/// One Chromium process with a single tab and its own throwaway profile.
pub struct ChromeSession {
    browser: Chromium,
    handler_task: JoinHandle<()>,
    page: Page,
    profile_dir: PathBuf,
    poll_interval: Duration,
}

impl ChromeSession {
    pub async fn launch(
        settings: &BrowserSettings,
        poll_interval: Duration,
    ) -> Result<Self, BrowserError> {
        let profile_dir = fresh_profile_dir()?;
        match Self::start(settings, &profile_dir).await {
            Ok((browser, handler_task, page)) => Ok(Self {
                browser,
                handler_task,
                page,
                profile_dir,
                poll_interval: poll_interval.max(Duration::from_millis(10)),
            }),
            Err(e) => {
                remove_profile_dir(&profile_dir);
                Err(e)
            }
        }
    }

    async fn start(
        settings: &BrowserSettings,
        profile_dir: &Path,
    ) -> Result<(Chromium, JoinHandle<()>, Page), BrowserError> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .user_data_dir(profile_dir)
            .arg("--disable-setuid-sandbox")
            .arg("--disable-features=site-per-process");
        if settings.headless {
            info!("Launching browser in headless mode");
        } else {
            info!("Launching browser in visible mode");
            builder = builder.with_head();
        }
        let chrome_bin = settings
            .chrome_bin
            .clone()
            .or_else(|| std::env::var("CHROME_BIN").ok());
        if let Some(bin) = chrome_bin {
            info!("Using custom Chrome binary: {}", bin);
            builder = builder.chrome_executable(bin);
        }

        let config = builder.build().map_err(BrowserError::Launch)?;
        let (mut browser, mut handler) = Chromium::launch(config)
            .await
            .map_err(|e| BrowserError::Launch(e.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser handler error (ignoring): {}", e);
                }
            }
        });

        match browser.new_page("about:blank").await {
            Ok(page) => Ok((browser, handler_task, page)),
            Err(e) => {
                if let Err(close_err) = browser.close().await {
                    warn!("Error closing browser after a failed start: {}", close_err);
                }
                let _ = handler_task.await;
                Err(BrowserError::Launch(format!("could not open a tab: {}", e)))
            }
        }
    }

    pub async fn close(mut self) -> Result<(), BrowserError> {
        let closed = self
            .browser
            .close()
            .await
            .map_err(|e| BrowserError::Launch(format!("error closing browser: {}", e)));
        let _ = self.handler_task.await;
        remove_profile_dir(&self.profile_dir);
        closed.map(|_| ())
    }

    async fn wait_for_ready_state(&self) {
        let deadline = Instant::now() + READY_STATE_TIMEOUT;
        loop {
            let state = self
                .page
                .evaluate("document.readyState")
                .await
                .ok()
                .and_then(|r| r.into_value::<String>().ok());
            if state.as_deref() == Some("complete") {
                break;
            }
            if Instant::now() >= deadline {
                warn!("Timeout waiting for document.readyState=complete");
                break;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        tokio::time::sleep(NETWORK_QUIET).await;
    }

    async fn dispatch_key(&self, kind: DispatchKeyEventType, key: &str) -> Result<(), BrowserError> {
        let event = DispatchKeyEventParams::builder()
            .r#type(kind)
            .key(key)
            .code(key)
            .build()
            .map_err(BrowserError::Input)?;
        self.page
            .execute(event)
            .await
            .map_err(|e| BrowserError::Input(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl Browser for ChromeSession {
    async fn navigate(&mut self, url: &str, wait: WaitUntil) -> Result<(), BrowserError> {
        info!("Navigating to: {}", url);
        self.page
            .goto(url)
            .await
            .map_err(|e| BrowserError::Navigation(e.to_string()))?;
        if wait == WaitUntil::NetworkIdle {
            self.wait_for_ready_state().await;
        }
        Ok(())
    }

    async fn evaluate(&mut self, script: &PageScript) -> Result<Value, BrowserError> {
        self.page
            .evaluate(script.to_js())
            .await
            .map_err(|e| BrowserError::Script(format!("{}: {}", script.name(), e)))?
            .into_value::<Value>()
            .map_err(|e| BrowserError::Script(format!("{}: {}", script.name(), e)))
    }

    async fn wait_for_selector(
        &mut self,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), BrowserError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.page.find_element(selector).await.is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(BrowserError::Timeout {
                    selector: selector.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn click(&mut self, selector: &str) -> Result<(), BrowserError> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|_| BrowserError::ElementNotFound(selector.to_string()))?;
        element
            .click()
            .await
            .map_err(|e| BrowserError::Navigation(format!("click on {} failed: {}", selector, e)))?;
        Ok(())
    }

    async fn send_key(&mut self, key: &str) -> Result<(), BrowserError> {
        self.dispatch_key(DispatchKeyEventType::KeyDown, key).await?;
        self.dispatch_key(DispatchKeyEventType::KeyUp, key).await
    }
}

/// Each session gets its own profile so two sessions never share state.
fn remove_profile_dir(dir: &Path) {
    if let Err(e) = std::fs::remove_dir_all(dir) {
        debug!("Failed to clean up {}: {}", dir.display(), e);
    }
}

fn fresh_profile_dir() -> Result<PathBuf, BrowserError> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!(
        "review-scraper-profile-{}-{}",
        std::process::id(),
        nanos
    ));
    std::fs::create_dir_all(&dir)
        .map_err(|e| BrowserError::Launch(format!("cannot create {}: {}", dir.display(), e)))?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile_dirs() -> usize {
        let prefix = format!("review-scraper-profile-{}-", std::process::id());
        std::fs::read_dir(std::env::temp_dir())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(&prefix))
            .count()
    }

    #[tokio::test]
    async fn failed_launch_leaves_no_profile_behind() {
        let before = profile_dirs();
        let settings = BrowserSettings {
            headless: true,
            chrome_bin: Some("/nonexistent/review-scraper/chrome".to_string()),
        };

        let result = ChromeSession::launch(&settings, Duration::from_millis(50)).await;

        assert!(matches!(result, Err(BrowserError::Launch(_))));
        assert_eq!(profile_dirs(), before);
    }
}
