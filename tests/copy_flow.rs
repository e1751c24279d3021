use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use markclip_rs::convert::Html2MdConverter;
use markclip_rs::error_log::ErrorLog;
use markclip_rs::messages::{Inbound, Outbound};
use markclip_rs::options::{OptionsStore, ReplacementRule};
use markclip_rs::ports::{ClipboardWriter, KeyValueStore, PreviewChannel, ReplySink, ScriptInjector};
use markclip_rs::router::{Generation, PendingTimeout, TabId, HOTKEY_POPUP_TIMEOUT};
use markclip_rs::storage::MemoryStore;
use markclip_rs::{
    Collaborators, Config, CopyPipeline, ErrorContext, FormatOptions, MarkclipApp, TriggerSource,
};

#[derive(Default)]
struct FakeClipboard {
    writes: Mutex<Vec<String>>,
    fail: bool,
}

#[async_trait]
impl ClipboardWriter for FakeClipboard {
    async fn write_text(&self, text: &str) -> Result<()> {
        if self.fail {
            return Err(anyhow!("offscreen document unavailable"));
        }
        self.writes.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

/// Records everything the orchestrator sends towards the host surfaces.
#[derive(Default)]
struct FakeHost {
    injected: Mutex<Vec<(TabId, Generation)>>,
    popups_opened: Mutex<Vec<TabId>>,
    previews: Mutex<Vec<String>>,
    replies: Mutex<Vec<Outbound>>,
    popup_listening: bool,
    refuse_injection: bool,
}

impl FakeHost {
    fn listening() -> Self {
        Self {
            popup_listening: true,
            ..Self::default()
        }
    }

    fn last_generation(&self, tab_id: TabId) -> Generation {
        self.injected
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(tab, _)| *tab == tab_id)
            .map(|(_, generation)| *generation)
            .expect("probe injected")
    }

    fn replies(&self) -> Vec<Outbound> {
        self.replies.lock().unwrap().clone()
    }
}

#[async_trait]
impl ScriptInjector for FakeHost {
    async fn inject_probe(&self, tab_id: TabId, generation: Generation) -> Result<()> {
        if self.refuse_injection {
            return Err(anyhow!("Cannot access contents of the page"));
        }
        self.injected.lock().unwrap().push((tab_id, generation));
        Ok(())
    }

    async fn open_popup(&self, tab_id: TabId) -> Result<()> {
        self.popups_opened.lock().unwrap().push(tab_id);
        Ok(())
    }
}

#[async_trait]
impl PreviewChannel for FakeHost {
    async fn broadcast_preview(&self, text: &str) -> Result<()> {
        if !self.popup_listening {
            return Err(anyhow!("Could not establish connection. Receiving end does not exist."));
        }
        self.previews.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

#[async_trait]
impl ReplySink for FakeHost {
    async fn send(&self, message: Outbound) -> Result<()> {
        self.replies.lock().unwrap().push(message);
        Ok(())
    }
}

struct Harness {
    app: MarkclipApp,
    host: Arc<FakeHost>,
    clipboard: Arc<FakeClipboard>,
    store: Arc<MemoryStore>,
}

fn harness_with(host: FakeHost, clipboard: FakeClipboard) -> Harness {
    let host = Arc::new(host);
    let clipboard = Arc::new(clipboard);
    let store = Arc::new(MemoryStore::new());

    let app = MarkclipApp::new(
        Config::default(),
        Collaborators {
            store: store.clone(),
            clipboard: clipboard.clone(),
            converter: Arc::new(Html2MdConverter),
            injector: host.clone(),
            preview: host.clone(),
            replies: host.clone(),
        },
    );

    Harness {
        app,
        host,
        clipboard,
        store,
    }
}

fn harness() -> Harness {
    harness_with(FakeHost::listening(), FakeClipboard::default())
}

fn trigger(tab_id: TabId, url: &str, source: TriggerSource) -> Inbound {
    Inbound::Trigger {
        tab_id,
        url: url.to_string(),
        title: "Example".to_string(),
        source,
    }
}

fn selection(tab_id: TabId, generation: Generation, html: &str) -> Inbound {
    Inbound::SelectionCaptured {
        tab_id,
        generation,
        html: html.to_string(),
    }
}

#[tokio::test]
async fn bold_selection_becomes_attributed_quote() {
    let mut h = harness();

    h.app
        .handle(trigger(1, "https://example.com", TriggerSource::Popup))
        .await;
    let generation = h.host.last_generation(1);
    h.app.handle(selection(1, generation, "<b>Hello</b>")).await;

    let copied = h.clipboard.writes.lock().unwrap().clone();
    assert_eq!(copied.len(), 1);
    assert!(copied[0].contains("**Hello**"), "{}", copied[0]);
    assert!(copied[0].contains("[Example](https://example.com)"), "{}", copied[0]);

    assert_eq!(h.host.previews.lock().unwrap().as_slice(), copied.as_slice());
    assert_eq!(h.app.last_formatted(), copied[0]);

    h.app.handle(Inbound::GetLastFormatted {}).await;
    assert_eq!(
        h.host.replies().last(),
        Some(&Outbound::LastFormatted {
            text: copied[0].clone()
        })
    );
}

#[tokio::test]
async fn unsafe_rule_is_skipped_and_formatting_continues() {
    let h = harness();
    let options = FormatOptions {
        template: "{{text}}".to_string(),
        rules: vec![
            ReplacementRule::new("(a+)+$", "X"),
            ReplacementRule::new("Hello", "Goodbye"),
        ],
        rules_enabled: true,
    };
    // Written straight to storage, bypassing save-time validation.
    h.store
        .set("formatOptions", serde_json::to_value(&options).unwrap())
        .await
        .unwrap();

    let log = ErrorLog::new(h.store.clone(), 10);
    let mut pipeline = CopyPipeline::new(
        Arc::new(Html2MdConverter),
        h.clipboard.clone(),
        h.host.clone(),
        OptionsStore::new(h.store.clone()),
        log.clone(),
    );
    let output = pipeline
        .run("<p>Hello aaaa</p>", "T", "https://t.test", TriggerSource::ContextMenu)
        .await;

    assert_eq!(output, "Goodbye aaaa");
    let entries = log.read().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].context, ErrorContext::FormatRule);
    assert!(entries[0].message.contains("(a+)+$"), "{}", entries[0].message);
}

#[tokio::test]
async fn clipboard_failure_still_returns_text_and_logs_once() {
    let h = harness_with(
        FakeHost::listening(),
        FakeClipboard {
            fail: true,
            ..FakeClipboard::default()
        },
    );
    let log = ErrorLog::new(h.store.clone(), 10);
    let mut pipeline = CopyPipeline::new(
        Arc::new(Html2MdConverter),
        h.clipboard.clone(),
        h.host.clone(),
        OptionsStore::new(h.store.clone()),
        log.clone(),
    );

    let output = pipeline
        .run("<b>Hello</b>", "Example", "https://example.com", TriggerSource::Popup)
        .await;

    assert!(output.contains("**Hello**"));
    assert_eq!(pipeline.last_result().text(), output);

    let entries = log.read().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].context, ErrorContext::TabClipboardWrite);
    assert!(entries[0].message.contains("offscreen document unavailable"));
}

#[tokio::test]
async fn protected_page_gets_a_notice_instead_of_a_probe() {
    let mut h = harness();

    h.app
        .handle(trigger(2, "chrome://extensions", TriggerSource::Hotkey))
        .await;

    assert!(h.host.injected.lock().unwrap().is_empty());
    assert!(h.host.popups_opened.lock().unwrap().is_empty());
    assert!(h.app.router().pending(2).is_none());
    assert!(matches!(
        h.host.replies().as_slice(),
        [Outbound::Notice { tab_id: Some(2), .. }]
    ));
}

#[tokio::test]
async fn only_the_latest_trigger_resolves() {
    let mut h = harness();

    h.app
        .handle(trigger(3, "https://example.com", TriggerSource::Popup))
        .await;
    let first = h.host.last_generation(3);
    h.app
        .handle(trigger(3, "https://example.com", TriggerSource::ContextMenu))
        .await;
    let second = h.host.last_generation(3);
    assert_ne!(first, second);

    h.app.handle(selection(3, second, "<p>fresh</p>")).await;
    h.app.handle(selection(3, first, "<p>stale</p>")).await;

    let copied = h.clipboard.writes.lock().unwrap().clone();
    assert_eq!(copied.len(), 1);
    assert!(copied[0].contains("fresh"));
    assert!(h.host.previews.lock().unwrap().is_empty());
    assert_eq!(h.app.router().pending_count(), 0);
}

#[tokio::test]
async fn repeated_runs_are_byte_identical() {
    let mut h = harness();

    for _ in 0..2 {
        h.app
            .handle(trigger(4, "https://example.com/a", TriggerSource::ContextMenu))
            .await;
        let generation = h.host.last_generation(4);
        h.app
            .handle(selection(4, generation, "<p>Same <em>input</em></p>"))
            .await;
    }

    let copied = h.clipboard.writes.lock().unwrap().clone();
    assert_eq!(copied.len(), 2);
    assert_eq!(copied[0], copied[1]);
}

#[tokio::test]
async fn empty_selection_produces_notice_without_copy() {
    let mut h = harness();

    h.app
        .handle(trigger(5, "https://example.com", TriggerSource::Popup))
        .await;
    let generation = h.host.last_generation(5);
    h.app.handle(selection(5, generation, "   ")).await;

    assert!(h.clipboard.writes.lock().unwrap().is_empty());
    assert_eq!(h.app.last_formatted(), "");
    assert!(matches!(
        h.host.replies().as_slice(),
        [Outbound::Notice { tab_id: Some(5), .. }]
    ));
}

#[tokio::test]
async fn missing_preview_listener_is_logged_not_fatal() {
    let mut h = harness_with(FakeHost::default(), FakeClipboard::default());

    h.app
        .handle(trigger(6, "https://example.com", TriggerSource::Popup))
        .await;
    let generation = h.host.last_generation(6);
    h.app.handle(selection(6, generation, "<p>text</p>")).await;

    assert_eq!(h.clipboard.writes.lock().unwrap().len(), 1);
    let entries = h.app.error_log().read().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].context, ErrorContext::NotifyPopupPreview);
}

#[tokio::test]
async fn set_options_applies_valid_and_logs_invalid_payloads() {
    let mut h = harness();

    h.app
        .handle(Inbound::SetOptions {
            options: json!({ "template": "{{text}} <{{url}}>" }),
        })
        .await;
    assert_eq!(h.host.replies().last(), Some(&Outbound::OptionsApplied {}));

    h.app
        .handle(Inbound::SetOptions {
            options: json!({ "rules": [{ "pattern": "(a+)+$" }] }),
        })
        .await;
    h.app
        .handle(Inbound::SetOptions {
            options: json!("not an object"),
        })
        .await;

    let entries = h.app.error_log().read().await;
    assert_eq!(entries.len(), 2);
    assert!(entries
        .iter()
        .all(|entry| entry.context == ErrorContext::InvalidOptionsPayload));

    h.app
        .handle(trigger(7, "https://example.com", TriggerSource::ContextMenu))
        .await;
    let generation = h.host.last_generation(7);
    h.app.handle(selection(7, generation, "<p>kept</p>")).await;
    assert_eq!(h.app.last_formatted(), "kept <https://example.com>");
}

#[tokio::test]
async fn hotkey_timeout_is_logged_and_clears_request() {
    let mut h = harness();

    h.app
        .handle(trigger(8, "https://example.com", TriggerSource::Hotkey))
        .await;
    assert_eq!(h.host.popups_opened.lock().unwrap().as_slice(), &[8]);
    let generation = h.host.last_generation(8);

    h.app
        .handle_timeout(PendingTimeout {
            tab_id: 8,
            generation,
        })
        .await;
    assert!(h.app.router().pending(8).is_none());

    h.app.handle(selection(8, generation, "<p>late</p>")).await;
    assert!(h.clipboard.writes.lock().unwrap().is_empty());

    h.app.handle(Inbound::GetErrorLog {}).await;
    match h.host.replies().last() {
        Some(Outbound::ErrorLog { entries, badge }) => {
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].context, ErrorContext::HotkeyPopupTimeout);
            assert_eq!(badge, "1");
        }
        other => panic!("expected error log reply, got {other:?}"),
    }

    h.app.handle(Inbound::ClearErrorLog {}).await;
    assert!(h.app.error_log().read().await.is_empty());
}

#[tokio::test]
async fn popup_acknowledgement_keeps_hotkey_request_alive() {
    let mut h = harness();

    h.app
        .handle(trigger(9, "https://example.com", TriggerSource::Hotkey))
        .await;
    let generation = h.host.last_generation(9);
    h.app
        .handle(Inbound::PopupReady { tab_id: Some(9) })
        .await;

    h.app
        .handle_timeout(PendingTimeout {
            tab_id: 9,
            generation,
        })
        .await;
    assert!(h.app.router().pending(9).is_some());

    h.app.handle(selection(9, generation, "<p>via hotkey</p>")).await;
    assert_eq!(h.clipboard.writes.lock().unwrap().len(), 1);
    assert!(h.app.error_log().read().await.is_empty());
}

#[tokio::test]
async fn injection_failure_is_logged_and_leaves_tab_idle() {
    let mut h = harness_with(
        FakeHost {
            refuse_injection: true,
            ..FakeHost::listening()
        },
        FakeClipboard::default(),
    );

    h.app
        .handle(trigger(11, "https://example.com", TriggerSource::ContextMenu))
        .await;

    assert!(h.app.router().pending(11).is_none());
    let entries = h.app.error_log().read().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].context, ErrorContext::InjectSelectionScript);
    assert!(entries[0].message.contains("Cannot access contents"));

    match h.host.replies().as_slice() {
        [Outbound::Notice {
            tab_id: Some(11),
            message,
        }] => assert!(message.starts_with("Could not read the selection")),
        other => panic!("expected one notice, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn run_loop_expires_unacknowledged_hotkey_request() {
    let Harness {
        app,
        host,
        clipboard,
        store,
    } = harness();
    let (inbound_tx, inbound_rx) = mpsc::channel(8);
    let running = tokio::spawn(app.run(inbound_rx, None));

    inbound_tx
        .send(trigger(12, "https://example.com", TriggerSource::Hotkey))
        .await
        .unwrap();
    tokio::time::sleep(HOTKEY_POPUP_TIMEOUT + Duration::from_millis(100)).await;

    let generation = host.last_generation(12);
    inbound_tx
        .send(selection(12, generation, "<p>too late</p>"))
        .await
        .unwrap();
    drop(inbound_tx);
    running.await.unwrap().unwrap();

    assert_eq!(host.popups_opened.lock().unwrap().as_slice(), &[12]);
    assert!(clipboard.writes.lock().unwrap().is_empty());
    let entries = ErrorLog::new(store, 10).read().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].context, ErrorContext::HotkeyPopupTimeout);
}

#[tokio::test]
async fn storage_path_change_keeps_the_running_store() {
    let mut h = harness();

    h.app.apply_config_update(Config {
        storage_path: Some("/tmp/elsewhere.json".to_string()),
        error_log_capacity: 1,
        ..Config::default()
    });
    assert_eq!(h.app.error_log().capacity(), 1);

    h.app
        .handle(Inbound::SetOptions {
            options: json!("not an object"),
        })
        .await;
    assert_eq!(ErrorLog::new(h.store.clone(), 10).read().await.len(), 1);
}
