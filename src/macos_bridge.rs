//! OS automation used to type into the focused application.

use std::time::Duration;

use crate::error::ScanError;

/// AppleScript run through `osascript`: Cmd+V, a short pause, Return.
#[cfg(target_os = "macos")]
fn paste_script(confirm_delay: Duration) -> String {
    format!(
        r#"tell application "System Events"
    keystroke "v" using command down
    delay {:.3}
    keystroke return
end tell"#,
        confirm_delay.as_secs_f64()
    )
}

#[cfg(target_os = "macos")]
pub fn paste_and_confirm(confirm_delay: Duration) -> Result<(), ScanError> {
    let output = std::process::Command::new("osascript")
        .arg("-e")
        .arg(paste_script(confirm_delay))
        .output()
        .map_err(|err| ScanError::Paste(format!("failed to spawn osascript: {err}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ScanError::Paste(format!(
            "osascript exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(())
}

#[cfg(not(target_os = "macos"))]
pub fn paste_and_confirm(_confirm_delay: Duration) -> Result<(), ScanError> {
    Err(ScanError::Paste(
        "paste automation is only available on macOS".into(),
    ))
}
