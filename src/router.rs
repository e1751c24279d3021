//! Per-tab trigger state: `idle -> pending -> resolved | timed out`.
//!
//! At most one pending request exists per tab. Every trigger gets a fresh
//! generation number that the injected probe echoes back, so a selection from
//! a superseded probe can be told apart from the current one.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info};

use crate::error::{ErrorContext, TagResult, TaggedError};
use crate::ports::ScriptInjector;

pub type TabId = i64;
pub type Generation = u64;

/// How long a hotkey-opened popup has to acknowledge before the request is
/// dropped.
pub const HOTKEY_POPUP_TIMEOUT: Duration = Duration::from_millis(1500);

pub const PROTECTED_URL_PREFIXES: &[&str] = &[
    "chrome://",
    "chrome-extension://",
    "chrome-search://",
    "edge://",
    "about:",
    "devtools://",
    "view-source:",
    "https://chrome.google.com/webstore",
    "https://chromewebstore.google.com",
    "https://microsoftedge.microsoft.com/addons",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerSource {
    Popup,
    Hotkey,
    ContextMenu,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TriggerSource::Popup => "popup",
            TriggerSource::Hotkey => "hotkey",
            TriggerSource::ContextMenu => "context-menu",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabInfo {
    pub id: TabId,
    pub url: String,
    #[serde(default)]
    pub title: String,
}

/// Posted back to the app loop when a hotkey request's popup wait elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTimeout {
    pub tab_id: TabId,
    pub generation: Generation,
}

#[derive(Debug)]
pub struct PendingCopyRequest {
    pub tab: TabInfo,
    pub source: TriggerSource,
    pub generation: Generation,
    pub created_at: Instant,
    timeout: Option<JoinHandle<()>>,
}

impl PendingCopyRequest {
    pub fn awaiting_popup(&self) -> bool {
        self.timeout.is_some()
    }

    fn cancel_timeout(&mut self) {
        if let Some(handle) = self.timeout.take() {
            handle.abort();
        }
    }
}

impl Drop for PendingCopyRequest {
    fn drop(&mut self) {
        self.cancel_timeout();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    Pending { generation: Generation },
    Blocked { message: String },
}

pub struct TriggerRouter {
    pending: HashMap<TabId, PendingCopyRequest>,
    next_generation: Generation,
    extra_protected: Vec<String>,
    timeout_tx: mpsc::UnboundedSender<PendingTimeout>,
}

impl TriggerRouter {
    pub fn new(timeout_tx: mpsc::UnboundedSender<PendingTimeout>) -> Self {
        Self {
            pending: HashMap::new(),
            next_generation: 1,
            extra_protected: Vec::new(),
            timeout_tx,
        }
    }

    pub fn set_extra_protected(&mut self, prefixes: Vec<String>) {
        self.extra_protected = prefixes
            .into_iter()
            .map(|prefix| prefix.trim().to_ascii_lowercase())
            .filter(|prefix| !prefix.is_empty())
            .collect();
    }

    pub fn is_protected(&self, url: &str) -> bool {
        let url = url.trim_start().to_ascii_lowercase();
        PROTECTED_URL_PREFIXES
            .iter()
            .copied()
            .chain(self.extra_protected.iter().map(String::as_str))
            .any(|prefix| url.starts_with(prefix))
    }

    /// Starts a copy for `tab`. A protected URL leaves the tab idle and
    /// reports why; an injection failure leaves it idle and is returned as an
    /// error. Any earlier pending request for the tab is cancelled first.
    pub async fn trigger(
        &mut self,
        tab: TabInfo,
        source: TriggerSource,
        injector: &dyn ScriptInjector,
    ) -> Result<TriggerOutcome, TaggedError> {
        if self.is_protected(&tab.url) {
            info!("Refusing {} trigger on protected page {}", source, tab.url);
            return Ok(TriggerOutcome::Blocked {
                message: "This page does not allow copying selections.".to_string(),
            });
        }

        if let Some(previous) = self.pending.remove(&tab.id) {
            debug!(
                tab_id = tab.id,
                "Superseding pending {} request (generation {})",
                previous.source,
                previous.generation
            );
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        injector
            .inject_probe(tab.id, generation)
            .await
            .tag(ErrorContext::InjectSelectionScript)?;

        self.enter_pending(tab, source, generation);
        Ok(TriggerOutcome::Pending { generation })
    }

    fn enter_pending(&mut self, tab: TabInfo, source: TriggerSource, generation: Generation) {
        let timeout = (source == TriggerSource::Hotkey).then(|| {
            let tx = self.timeout_tx.clone();
            let tab_id = tab.id;
            tokio::spawn(async move {
                time::sleep(HOTKEY_POPUP_TIMEOUT).await;
                let _ = tx.send(PendingTimeout { tab_id, generation });
            })
        });

        debug!(
            tab_id = tab.id,
            generation, "Pending {} request created", source
        );
        self.pending.insert(
            tab.id,
            PendingCopyRequest {
                tab,
                source,
                generation,
                created_at: Instant::now(),
                timeout,
            },
        );
    }

    /// Takes the pending request a selection message belongs to. Messages
    /// from superseded probes (wrong generation) are discarded and leave the
    /// current request in place.
    pub fn resolve(&mut self, tab_id: TabId, generation: Generation) -> Option<PendingCopyRequest> {
        match self.pending.get(&tab_id) {
            Some(request) if request.generation == generation => {}
            Some(request) => {
                debug!(
                    tab_id,
                    "Discarding selection from generation {} (current {})",
                    generation,
                    request.generation
                );
                return None;
            }
            None => {
                debug!(tab_id, generation, "Discarding selection with no pending request");
                return None;
            }
        }

        let mut request = self.pending.remove(&tab_id)?;
        request.cancel_timeout();
        debug!(
            tab_id,
            generation,
            elapsed_ms = request.created_at.elapsed().as_millis() as u64,
            "Pending request resolved"
        );
        Some(request)
    }

    /// The popup opened for a hotkey request is up; stop its timer but keep
    /// waiting for the selection.
    pub fn acknowledge_popup(&mut self, tab_id: TabId) -> bool {
        match self.pending.get_mut(&tab_id) {
            Some(request) if request.awaiting_popup() => {
                request.cancel_timeout();
                debug!(tab_id, "Popup acknowledged hotkey request");
                true
            }
            _ => false,
        }
    }

    /// Drops the request a timeout refers to, if it is still the current one
    /// and still waiting on its popup.
    pub fn expire(&mut self, timeout: PendingTimeout) -> Option<PendingCopyRequest> {
        let current = self.pending.get(&timeout.tab_id)?;
        if current.generation != timeout.generation || !current.awaiting_popup() {
            return None;
        }
        let mut request = self.pending.remove(&timeout.tab_id)?;
        request.timeout = None;
        Some(request)
    }

    pub fn pending(&self, tab_id: TabId) -> Option<&PendingCopyRequest> {
        self.pending.get(&tab_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
