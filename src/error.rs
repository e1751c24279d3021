use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pipeline stage a failure originated from. Serialized values are stable:
/// the popup matches on them when rendering the problem list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorContext {
    InjectSelectionScript,
    OpenPopup,
    HotkeyPopupTimeout,
    TabClipboardWrite,
    NotifyPopupPreview,
    InvalidOptionsPayload,
    LoadOptions,
    SaveOptions,
    FormatRule,
}

impl ErrorContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorContext::InjectSelectionScript => "inject-selection-script",
            ErrorContext::OpenPopup => "open-popup",
            ErrorContext::HotkeyPopupTimeout => "hotkey-popup-timeout",
            ErrorContext::TabClipboardWrite => "tab-clipboard-write",
            ErrorContext::NotifyPopupPreview => "notify-popup-preview",
            ErrorContext::InvalidOptionsPayload => "invalid-options-payload",
            ErrorContext::LoadOptions => "load-options",
            ErrorContext::SaveOptions => "save-options",
            ErrorContext::FormatRule => "format-rule",
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure already attributed to the stage that produced it.
///
/// Everything inside the router and pipeline returns `Result<T, TaggedError>`;
/// only the app loop turns these into error log entries.
#[derive(Debug, Error)]
#[error("{context}: {message}")]
pub struct TaggedError {
    pub context: ErrorContext,
    pub message: String,
}

impl TaggedError {
    pub fn new(context: ErrorContext, error: impl fmt::Display) -> Self {
        Self {
            context,
            message: format!("{error:#}"),
        }
    }
}

pub trait TagResult<T> {
    fn tag(self, context: ErrorContext) -> Result<T, TaggedError>;
}

impl<T, E: fmt::Display> TagResult<T> for Result<T, E> {
    fn tag(self, context: ErrorContext) -> Result<T, TaggedError> {
        self.map_err(|err| TaggedError::new(context, err))
    }
}
