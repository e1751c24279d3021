use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use arboard::Clipboard;
use async_trait::async_trait;
use tracing::debug;

use crate::ports::ClipboardWriter;

/// System clipboard via `arboard`. The handle is opened on first write so a
/// headless host can start without a display.
#[derive(Default)]
pub struct SystemClipboard {
    handle: Mutex<Option<Clipboard>>,
}

impl SystemClipboard {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClipboardWriter for SystemClipboard {
    async fn write_text(&self, text: &str) -> Result<()> {
        let mut guard = self
            .handle
            .lock()
            .map_err(|_| anyhow!("clipboard lock poisoned"))?;

        if guard.is_none() {
            *guard = Some(Clipboard::new().context("Failed to initialize clipboard")?);
            debug!("Clipboard handle opened");
        }

        match guard.as_mut() {
            Some(clipboard) => clipboard
                .set_text(text)
                .context("Failed to write text to clipboard"),
            None => Err(anyhow!("clipboard unavailable")),
        }
    }
}
