//! Runtime settings.
//!
//! Layered from built-in defaults, an optional `review_scraper.toml` in the
//! working directory, and `REVIEWS_*` environment variables with `__`
//! between nested keys (`REVIEWS_TIMING__SETTLE_DELAY_MS=500`). A `.env`
//! file is loaded first when present.

use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::paginate::PaginationConfig;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub service: ServiceSettings,
    pub timing: TimingSettings,
    pub run: RunSettings,
    pub browser: BrowserSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    pub endpoint: String,
    pub model: String,
    /// Falls back to `OPENAI_API_KEY`.
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub temperature: f32,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            api_key: None,
            timeout_secs: 120,
            temperature: 0.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    pub container_timeout_secs: u64,
    pub settle_delay_ms: u64,
    pub initial_settle_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            container_timeout_secs: 60,
            settle_delay_ms: 3000,
            initial_settle_ms: 1000,
            poll_interval_ms: 250,
        }
    }
}

impl TimingSettings {
    pub fn initial_settle(&self) -> Duration {
        Duration::from_millis(self.initial_settle_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Sanitized HTML beyond this many characters is cut before inference.
    pub max_html_chars: usize,
    pub max_pages: usize,
    pub inference_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            max_html_chars: 100_000,
            max_pages: 500,
            inference_attempts: 1,
            retry_backoff_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    pub headless: bool,
    /// Falls back to `CHROME_BIN`, then to chromiumoxide's own lookup.
    pub chrome_bin: Option<String>,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: true,
            chrome_bin: None,
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        Config::builder()
            .add_source(File::with_name("review_scraper").required(false))
            .add_source(
                Environment::with_prefix("REVIEWS")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    pub fn api_key(&self) -> Option<String> {
        self.service
            .api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .filter(|k| !k.trim().is_empty())
    }

    pub fn pagination_config(&self) -> PaginationConfig {
        PaginationConfig {
            container_timeout: Duration::from_secs(self.timing.container_timeout_secs),
            settle_delay: Duration::from_millis(self.timing.settle_delay_ms),
            max_pages: self.run.max_pages.max(1),
        }
    }
}
