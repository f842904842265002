//! Browser settings - file config plus environment overrides
//!
//! One finite schema: every recognized environment variable is a variant of
//! `EnvKey`, typed by the field it overrides. The resulting `Settings` value
//! is immutable and injected into the manager; there is no process-wide
//! default instance.

use std::collections::HashMap;
use std::path::Path;

use driver::{ContextOptions, EngineKind, Geolocation, LaunchOptions};
use serde::{Deserialize, Serialize};

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Immutable browser configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub default_browser: EngineKind,
    pub headless: bool,
    /// Delay before each page operation, milliseconds.
    pub slow_mo: u64,
    pub width: u32,
    pub height: u32,
    pub debug_screenshots: bool,
    /// Navigation timeout, milliseconds.
    pub timeout: u64,
    pub proxy: Option<String>,
    pub geolocation: Option<Geolocation>,
    pub locale: String,
    pub timezone_id: String,
    pub user_agent: String,
    /// Live pages allowed before page creation triggers cleanup.
    pub max_tabs: usize,
    /// Seconds of inactivity before a tab is considered idle.
    pub tab_idle_timeout: u64,
    /// Whether telemetry records outgoing network requests.
    pub capture_network: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_browser: EngineKind::Chromium,
            headless: false,
            slow_mo: 50,
            width: 1280,
            height: 800,
            debug_screenshots: false,
            timeout: 30_000,
            proxy: None,
            geolocation: None,
            locale: "en-US".to_string(),
            timezone_id: "America/Los_Angeles".to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            max_tabs: 8,
            tab_idle_timeout: 300,
            capture_network: false,
        }
    }
}

/// The recognized environment variables. `ForceVisible` is applied last so
/// it wins over any other headless configuration; visible-mode debugging
/// must always be reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EnvKey {
    BrowserType,
    Headless,
    SlowMo,
    Width,
    Height,
    DebugScreenshots,
    Timeout,
    Proxy,
    Locale,
    Timezone,
    CaptureNetwork,
    ForceVisible,
}

impl EnvKey {
    const ALL: [EnvKey; 12] = [
        EnvKey::BrowserType,
        EnvKey::Headless,
        EnvKey::SlowMo,
        EnvKey::Width,
        EnvKey::Height,
        EnvKey::DebugScreenshots,
        EnvKey::Timeout,
        EnvKey::Proxy,
        EnvKey::Locale,
        EnvKey::Timezone,
        EnvKey::CaptureNetwork,
        EnvKey::ForceVisible,
    ];

    fn var(self) -> &'static str {
        match self {
            EnvKey::BrowserType => "WEBTOOLS_BROWSER_TYPE",
            EnvKey::Headless => "WEBTOOLS_BROWSER_HEADLESS",
            EnvKey::SlowMo => "WEBTOOLS_BROWSER_SLOW_MO",
            EnvKey::Width => "WEBTOOLS_BROWSER_WIDTH",
            EnvKey::Height => "WEBTOOLS_BROWSER_HEIGHT",
            EnvKey::DebugScreenshots => "WEBTOOLS_BROWSER_DEBUG_SCREENSHOTS",
            EnvKey::Timeout => "WEBTOOLS_BROWSER_TIMEOUT",
            EnvKey::Proxy => "WEBTOOLS_BROWSER_PROXY",
            EnvKey::Locale => "WEBTOOLS_BROWSER_LOCALE",
            EnvKey::Timezone => "WEBTOOLS_BROWSER_TIMEZONE",
            EnvKey::CaptureNetwork => "WEBTOOLS_CAPTURE_NETWORK",
            EnvKey::ForceVisible => "WEBTOOLS_FORCE_VISIBLE",
        }
    }

    fn apply(self, raw: &str, settings: &mut Settings) -> Result<(), String> {
        match self {
            EnvKey::BrowserType => settings.default_browser = raw.parse()?,
            EnvKey::Headless => settings.headless = parse_bool(raw),
            EnvKey::SlowMo => settings.slow_mo = parse_int(raw)?,
            EnvKey::Width => settings.width = parse_int(raw)? as u32,
            EnvKey::Height => settings.height = parse_int(raw)? as u32,
            EnvKey::DebugScreenshots => settings.debug_screenshots = parse_bool(raw),
            EnvKey::Timeout => settings.timeout = parse_int(raw)?,
            EnvKey::Proxy => settings.proxy = Some(raw.to_string()),
            EnvKey::Locale => settings.locale = raw.to_string(),
            EnvKey::Timezone => settings.timezone_id = raw.to_string(),
            EnvKey::CaptureNetwork => settings.capture_network = parse_bool(raw),
            EnvKey::ForceVisible => {
                if parse_bool(raw) {
                    settings.headless = false;
                }
            }
        }
        Ok(())
    }
}

fn parse_bool(raw: &str) -> bool {
    raw.eq_ignore_ascii_case("true")
}

fn parse_int(raw: &str) -> Result<u64, String> {
    raw.parse::<u64>().map_err(|e| format!("not an integer: {e}"))
}

impl Settings {
    /// Load settings: file if present, defaults otherwise, then environment
    /// overrides from the current process environment. Never fails; a
    /// malformed file or value is logged and skipped.
    pub fn load(config_path: Option<&Path>) -> Settings {
        let mut settings = match config_path {
            Some(path) if path.exists() => match std::fs::read_to_string(path) {
                Ok(text) => match serde_json::from_str::<Settings>(&text) {
                    Ok(settings) => {
                        tracing::info!("loaded browser configuration from {}", path.display());
                        settings
                    }
                    Err(e) => {
                        tracing::error!("malformed config {}: {e}, using defaults", path.display());
                        Settings::default()
                    }
                },
                Err(e) => {
                    tracing::error!("unreadable config {}: {e}, using defaults", path.display());
                    Settings::default()
                }
            },
            _ => Settings::default(),
        };
        settings.apply_env(std::env::vars());
        settings
    }

    /// Apply environment overrides from an explicit variable set.
    pub fn apply_env<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars.into_iter().collect();
        for key in EnvKey::ALL {
            let Some(raw) = vars.get(key.var()) else { continue };
            if let Err(e) = key.apply(raw, self) {
                tracing::warn!("ignoring {}={raw}: {e}", key.var());
            }
        }
    }

    pub fn launch_options(&self) -> LaunchOptions {
        LaunchOptions {
            headless: self.headless,
            slow_mo_ms: self.slow_mo,
            proxy: self.proxy.clone(),
            cdp_url: None,
        }
    }

    pub fn context_options(&self) -> ContextOptions {
        ContextOptions {
            viewport_width: self.width,
            viewport_height: self.height,
            user_agent: Some(self.user_agent.clone()),
            locale: Some(self.locale.clone()),
            timezone_id: Some(self.timezone_id.clone()),
            geolocation: self.geolocation,
        }
    }
}
