use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ErrorContext, TagResult};
use crate::error_log::{self, ErrorLog};
use crate::messages::{Inbound, Outbound};
use crate::options::{FormatOptions, OptionsStore};
use crate::pipeline::CopyPipeline;
use crate::ports::{
    ClipboardWriter, KeyValueStore, MarkdownConverter, PreviewChannel, ReplySink, ScriptInjector,
};
use crate::router::{
    Generation, PendingTimeout, TabId, TabInfo, TriggerOutcome, TriggerRouter, TriggerSource,
    HOTKEY_POPUP_TIMEOUT,
};

const NO_SELECTION_NOTICE: &str = "No text selected.";
const INJECTION_FAILED_NOTICE: &str =
    "Could not read the selection on this page. Check that the extension can access this site.";

pub struct Collaborators {
    pub store: Arc<dyn KeyValueStore>,
    pub clipboard: Arc<dyn ClipboardWriter>,
    pub converter: Arc<dyn MarkdownConverter>,
    pub injector: Arc<dyn ScriptInjector>,
    pub preview: Arc<dyn PreviewChannel>,
    pub replies: Arc<dyn ReplySink>,
}

/// The background orchestrator. Owns the per-tab trigger state and the last
/// copy result; both start empty on every process start.
pub struct MarkclipApp {
    router: TriggerRouter,
    pipeline: CopyPipeline,
    options: OptionsStore,
    error_log: ErrorLog,
    injector: Arc<dyn ScriptInjector>,
    replies: Arc<dyn ReplySink>,
    timeout_rx: mpsc::UnboundedReceiver<PendingTimeout>,
    current_config: Config,
}

impl MarkclipApp {
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        let Collaborators {
            store,
            clipboard,
            converter,
            injector,
            preview,
            replies,
        } = collaborators;

        let error_log = ErrorLog::new(Arc::clone(&store), config.error_log_capacity);
        let options = OptionsStore::new(store);

        let mut pipeline = CopyPipeline::new(
            converter,
            clipboard,
            preview,
            options.clone(),
            error_log.clone(),
        );
        pipeline.set_write_clipboard(config.auto_copy_clipboard);

        let (timeout_tx, timeout_rx) = mpsc::unbounded_channel();
        let mut router = TriggerRouter::new(timeout_tx);
        router.set_extra_protected(config.extra_protected_prefixes.clone());

        Self {
            router,
            pipeline,
            options,
            error_log,
            injector,
            replies,
            timeout_rx,
            current_config: config,
        }
    }

    /// Processes events one at a time until the inbound channel closes.
    pub async fn run(
        mut self,
        mut inbound: mpsc::Receiver<Inbound>,
        mut config_rx: Option<watch::Receiver<Config>>,
    ) -> Result<()> {
        info!("markclip orchestrator running");

        loop {
            tokio::select! {
                message = inbound.recv() => {
                    match message {
                        Some(message) => self.handle(message).await,
                        None => {
                            info!("Inbound channel closed");
                            break;
                        }
                    }
                }
                Some(timeout) = self.timeout_rx.recv() => {
                    self.handle_timeout(timeout).await;
                }
                update = next_config(&mut config_rx) => {
                    match update {
                        Some(config) => self.apply_config_update(config),
                        None => {
                            info!("Configuration watcher closed");
                            config_rx = None;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    pub async fn handle(&mut self, message: Inbound) {
        debug!("Handling {}", message.kind());
        match message {
            Inbound::Trigger {
                tab_id,
                url,
                title,
                source,
            } => {
                let tab = TabInfo {
                    id: tab_id,
                    url,
                    title,
                };
                self.on_trigger(tab, source).await;
            }
            Inbound::SelectionCaptured {
                tab_id,
                generation,
                html,
            } => self.on_selection(tab_id, generation, &html).await,
            Inbound::PopupReady { tab_id } => {
                if let Some(tab_id) = tab_id {
                    self.router.acknowledge_popup(tab_id);
                }
            }
            Inbound::PopupClosed {} => debug!("Popup closed"),
            Inbound::GetLastFormatted {} => {
                let text = self.last_formatted().to_string();
                self.reply(Outbound::LastFormatted { text }).await;
            }
            Inbound::SetOptions { options } => self.on_set_options(options).await,
            Inbound::GetErrorLog {} => {
                let entries = self.error_log.read().await;
                let badge = error_log::badge(entries.len());
                self.reply(Outbound::ErrorLog { entries, badge }).await;
            }
            Inbound::ClearErrorLog {} => self.error_log.clear().await,
        }
    }

    pub async fn handle_timeout(&mut self, timeout: PendingTimeout) {
        if let Some(request) = self.router.expire(timeout) {
            self.error_log
                .record(
                    ErrorContext::HotkeyPopupTimeout,
                    format!(
                        "popup did not acknowledge within {} ms (tab {}, generation {})",
                        HOTKEY_POPUP_TIMEOUT.as_millis(),
                        request.tab.id,
                        request.generation
                    ),
                )
                .await;
        }
    }

    pub fn apply_config_update(&mut self, new_config: Config) {
        if new_config == self.current_config {
            debug!("Config unchanged; ignoring update");
            return;
        }

        if new_config.storage_path != self.current_config.storage_path {
            warn!(
                "storage_path changed to {:?}; restart markclip-rs to use the new store",
                new_config.storage_path
            );
        }

        self.error_log.set_capacity(new_config.error_log_capacity);
        self.router
            .set_extra_protected(new_config.extra_protected_prefixes.clone());
        self.pipeline
            .set_write_clipboard(new_config.auto_copy_clipboard);
        self.current_config = new_config;

        info!("Configuration updated");
        debug!(?self.current_config, "Config state after update");
    }

    pub fn last_formatted(&self) -> &str {
        self.pipeline.last_result().text()
    }

    pub fn router(&self) -> &TriggerRouter {
        &self.router
    }

    pub fn error_log(&self) -> &ErrorLog {
        &self.error_log
    }

    async fn on_trigger(&mut self, tab: TabInfo, source: TriggerSource) {
        let tab_id = tab.id;

        if source == TriggerSource::Hotkey && !self.router.is_protected(&tab.url) {
            if let Err(err) = self
                .injector
                .open_popup(tab_id)
                .await
                .tag(ErrorContext::OpenPopup)
            {
                self.error_log.record_tagged(&err).await;
            }
        }

        match self
            .router
            .trigger(tab, source, self.injector.as_ref())
            .await
        {
            Ok(TriggerOutcome::Pending { generation }) => {
                debug!(tab_id, generation, "Selection probe injected");
            }
            Ok(TriggerOutcome::Blocked { message }) => {
                self.reply(Outbound::Notice {
                    tab_id: Some(tab_id),
                    message,
                })
                .await;
            }
            Err(err) => {
                self.error_log.record_tagged(&err).await;
                self.reply(Outbound::Notice {
                    tab_id: Some(tab_id),
                    message: INJECTION_FAILED_NOTICE.to_string(),
                })
                .await;
            }
        }
    }

    async fn on_selection(&mut self, tab_id: TabId, generation: Generation, html: &str) {
        let Some(request) = self.router.resolve(tab_id, generation) else {
            return;
        };

        if html.trim().is_empty() {
            info!(tab_id, "Probe found no selection");
            self.reply(Outbound::Notice {
                tab_id: Some(tab_id),
                message: NO_SELECTION_NOTICE.to_string(),
            })
            .await;
            return;
        }

        self.pipeline
            .run(html, &request.tab.title, &request.tab.url, request.source)
            .await;
    }

    async fn on_set_options(&mut self, payload: Value) {
        let options = match FormatOptions::from_payload(payload) {
            Ok(options) => options,
            Err(err) => {
                self.error_log
                    .record(ErrorContext::InvalidOptionsPayload, err)
                    .await;
                return;
            }
        };

        match self.options.save(&options).await {
            Ok(()) => self.reply(Outbound::OptionsApplied {}).await,
            Err(err) => self.error_log.record_tagged(&err).await,
        }
    }

    async fn reply(&self, message: Outbound) {
        if let Err(err) = self.replies.send(message).await {
            debug!("Dropping reply: {:#}", err);
        }
    }
}

async fn next_config(rx: &mut Option<watch::Receiver<Config>>) -> Option<Config> {
    match rx {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(rx.borrow().clone()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}
