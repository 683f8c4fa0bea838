use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::{fs, path::Path, time::Duration};

/// Runtime knobs for the supervisor and the scan worker.
///
/// Every field has a default, so an empty JSON object (or no file at all)
/// gives the stock behaviour: poll every second, kill a worker after ten.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub poll_interval_ms: u64,
    pub process_timeout_secs: u64,
    pub restart_delay_ms: u64,
    pub teardown_timeout_secs: u64,
    pub clipboard_settle_ms: u64,
    pub paste_confirm_delay_ms: u64,
    pub url_scheme: String,
    pub artifact_prefix: String,
    /// When false the payload is only copied, never pasted.
    pub auto_paste: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            process_timeout_secs: 10,
            restart_delay_ms: 1_000,
            teardown_timeout_secs: 5,
            clipboard_settle_ms: 100,
            paste_confirm_delay_ms: 50,
            url_scheme: "https://".into(),
            artifact_prefix: ")%U".into(),
            auto_paste: true,
        }
    }
}

impl Settings {
    /// Loads settings from `path`, or returns defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let settings = match path {
            Some(path) => {
                let contents = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read settings from {}", path.display()))?;
                Self::from_json(&contents)
                    .with_context(|| format!("Invalid settings in {}", path.display()))?
            }
            None => Self::default(),
        };
        Ok(settings)
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        let settings: Settings = serde_json::from_str(contents)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            bail!("poll_interval_ms must be greater than zero");
        }
        if self.process_timeout_secs == 0 {
            bail!("process_timeout_secs must be greater than zero");
        }
        if self.restart_delay_ms == 0 {
            bail!("restart_delay_ms must be greater than zero");
        }
        if self.teardown_timeout_secs == 0 {
            bail!("teardown_timeout_secs must be greater than zero");
        }
        if self.url_scheme.is_empty() {
            bail!("url_scheme must not be empty");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn process_timeout(&self) -> Duration {
        Duration::from_secs(self.process_timeout_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_secs(self.teardown_timeout_secs)
    }

    pub fn clipboard_settle(&self) -> Duration {
        Duration::from_millis(self.clipboard_settle_ms)
    }

    pub fn paste_confirm_delay(&self) -> Duration {
        Duration::from_millis(self.paste_confirm_delay_ms)
    }
}
