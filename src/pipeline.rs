use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{ErrorContext, TagResult};
use crate::error_log::ErrorLog;
use crate::format;
use crate::options::{FormatOptions, OptionsStore};
use crate::ports::{ClipboardWriter, MarkdownConverter, PreviewChannel};
use crate::router::TriggerSource;

/// The most recent formatted text, kept in memory only so a popup opened
/// after the fact can show what was copied.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CopyResult {
    text: Option<String>,
}

impl CopyResult {
    pub fn replace(&mut self, text: String) {
        self.text = Some(text);
    }

    pub fn text(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_none()
    }
}

/// Selection HTML in, clipboard text out.
///
/// `run` takes `&mut self`, so two runs can never interleave their clipboard
/// writes; the owner processes one event at a time.
pub struct CopyPipeline {
    converter: Arc<dyn MarkdownConverter>,
    clipboard: Arc<dyn ClipboardWriter>,
    preview: Arc<dyn PreviewChannel>,
    options: OptionsStore,
    error_log: ErrorLog,
    last_result: CopyResult,
    write_clipboard: bool,
}

impl CopyPipeline {
    pub fn new(
        converter: Arc<dyn MarkdownConverter>,
        clipboard: Arc<dyn ClipboardWriter>,
        preview: Arc<dyn PreviewChannel>,
        options: OptionsStore,
        error_log: ErrorLog,
    ) -> Self {
        Self {
            converter,
            clipboard,
            preview,
            options,
            error_log,
            last_result: CopyResult::default(),
            write_clipboard: true,
        }
    }

    pub fn set_write_clipboard(&mut self, enabled: bool) {
        self.write_clipboard = enabled;
    }

    pub fn last_result(&self) -> &CopyResult {
        &self.last_result
    }

    /// Always returns the formatted text. Skipped rules, clipboard and preview
    /// failures are recorded in the error log and do not change the result.
    pub async fn run(&mut self, html: &str, title: &str, url: &str, source: TriggerSource) -> String {
        let markdown = self.converter.convert(html);
        let options = self.current_options().await;
        let (formatted, rejected) = format::format_with_report(markdown.trim(), title, url, &options);
        for rejection in rejected {
            self.error_log
                .record(ErrorContext::FormatRule, rejection)
                .await;
        }

        info!(
            "Formatted {} selection: {} characters",
            source,
            formatted.chars().count()
        );

        if self.write_clipboard {
            match self
                .clipboard
                .write_text(&formatted)
                .await
                .tag(ErrorContext::TabClipboardWrite)
            {
                Ok(()) => debug!("Text copied to clipboard"),
                Err(err) => self.error_log.record_tagged(&err).await,
            }
        } else {
            debug!("Clipboard writes disabled; skipping");
        }

        if source == TriggerSource::Popup {
            if let Err(err) = self
                .preview
                .broadcast_preview(&formatted)
                .await
                .tag(ErrorContext::NotifyPopupPreview)
            {
                self.error_log.record_tagged(&err).await;
            }
        }

        self.last_result.replace(formatted.clone());
        formatted
    }

    async fn current_options(&self) -> FormatOptions {
        match self.options.load().await {
            Ok(options) => options,
            Err(err) => {
                self.error_log.record_tagged(&err).await;
                FormatOptions::default()
            }
        }
    }
}
