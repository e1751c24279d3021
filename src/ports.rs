//! Seams to the collaborators that live outside the orchestrator: storage,
//! clipboard, the page-side probe and the popup surface.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::messages::Outbound;
use crate::router::{Generation, TabId};

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn set(&self, key: &str, value: Value) -> Result<()>;
}

#[async_trait]
pub trait ClipboardWriter: Send + Sync {
    async fn write_text(&self, text: &str) -> Result<()>;
}

/// Injects the selection probe into a tab. The probe must echo `generation`
/// back with its one selection message.
#[async_trait]
pub trait ScriptInjector: Send + Sync {
    async fn inject_probe(&self, tab_id: TabId, generation: Generation) -> Result<()>;
    async fn open_popup(&self, tab_id: TabId) -> Result<()>;
}

/// Best-effort broadcast to an open popup. Failing when nobody listens is
/// expected.
#[async_trait]
pub trait PreviewChannel: Send + Sync {
    async fn broadcast_preview(&self, text: &str) -> Result<()>;
}

/// Outbound replies and notices to whichever surface asked.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn send(&self, message: Outbound) -> Result<()>;
}

/// HTML to Markdown. Total: every input produces some output.
pub trait MarkdownConverter: Send + Sync {
    fn convert(&self, html: &str) -> String;
}
