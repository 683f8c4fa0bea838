//! Getting a payload into whatever application has focus.

use std::time::Duration;

use crate::error::ScanError;
use crate::macos_bridge;
use crate::scan::Payload;
use crate::settings::Settings;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info};

pub trait Deliver {
    fn deliver(&mut self, payload: &Payload) -> Result<(), ScanError>;
}

/// Clipboard copy followed by a simulated paste + Enter.
pub struct PlatformDelivery {
    clipboard: Option<arboard::Clipboard>,
    settle: Duration,
    confirm_delay: Duration,
    auto_paste: bool,
}

impl PlatformDelivery {
    pub fn new(settings: &Settings) -> Self {
        Self {
            clipboard: None,
            settle: settings.clipboard_settle(),
            confirm_delay: settings.paste_confirm_delay(),
            auto_paste: settings.auto_paste,
        }
    }

    fn copy(&mut self, text: &str) -> Result<(), ScanError> {
        if self.clipboard.is_none() {
            let clipboard = arboard::Clipboard::new()
                .map_err(|err| ScanError::Clipboard(format!("failed to open clipboard: {err}")))?;
            self.clipboard = Some(clipboard);
        }
        let Some(clipboard) = self.clipboard.as_mut() else {
            return Err(ScanError::Clipboard("clipboard unavailable".into()));
        };
        if let Err(err) = clipboard.set_text(text.to_owned()) {
            // Reopen on the next delivery; the handle may be stale.
            self.clipboard = None;
            return Err(ScanError::Clipboard(err.to_string()));
        }
        Ok(())
    }
}

impl Deliver for PlatformDelivery {
    fn deliver(&mut self, payload: &Payload) -> Result<(), ScanError> {
        log_info!("pasting: {payload}");
        self.copy(payload.as_str())?;

        if !self.auto_paste {
            log_debug!("auto paste disabled, leaving payload on the clipboard");
            return Ok(());
        }

        // Let the pasteboard settle before the target app reads it.
        std::thread::sleep(self.settle);
        macos_bridge::paste_and_confirm(self.confirm_delay)
    }
}

/// Prints the payload instead of touching the clipboard.
#[derive(Debug, Default)]
pub struct PrintDelivery;

impl Deliver for PrintDelivery {
    fn deliver(&mut self, payload: &Payload) -> Result<(), ScanError> {
        println!("{payload}");
        Ok(())
    }
}
