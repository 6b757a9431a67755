// Shadowlink - Clipboard Access

use async_trait::async_trait;

use shadowlink_common::{Error, Result};

use crate::service::ClipboardReader;

/// System clipboard via arboard. Reads run on the blocking pool since
/// arboard talks to the display server synchronously.
pub struct ArboardClipboard;

#[async_trait]
impl ClipboardReader for ArboardClipboard {
    async fn read_text(&self) -> Result<String> {
        tokio::task::spawn_blocking(|| {
            let mut clipboard = arboard::Clipboard::new()
                .map_err(|err| Error::Clipboard(format!("clipboard unavailable: {err}")))?;
            clipboard
                .get_text()
                .map_err(|err| Error::Clipboard(format!("clipboard read failed: {err}")))
        })
        .await
        .map_err(|err| Error::Clipboard(format!("clipboard task failed: {err}")))?
    }
}
