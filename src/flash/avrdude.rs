//! Legacy AVR boards are programmed by the external `avrdude` tool, which
//! performs its own read-back verification.

use std::path::Path;

use tokio::process::Command;

use crate::detect::DetectedBoard;
use crate::error::FlashCause;

/// Flash `file` (Intel HEX) onto an AVR board through `avrdude`.
pub async fn flash(file: &Path, board: &DetectedBoard) -> Result<(), FlashCause> {
    let port = board
        .port
        .as_deref()
        .ok_or_else(|| FlashCause::Usb("avrdude needs a port path".into()))?;
    let output = Command::new("avrdude")
        .arg("-p")
        .arg("m2560")
        .arg("-c")
        .arg("wiring")
        .arg("-P")
        .arg(port)
        .arg("-b")
        .arg("115200")
        .arg("-D")
        .arg("-U")
        .arg(format!("flash:w:{}:i", file.display()))
        .output()
        .await
        .map_err(|e| FlashCause::Usb(format!("failed to launch avrdude: {e}")))?;
    if output.status.success() {
        Ok(())
    } else {
        log::warn!(
            "avrdude failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        Err(FlashCause::ExternalFlasher(
            output.status.code().unwrap_or(-1),
        ))
    }
}
