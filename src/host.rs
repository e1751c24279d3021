//! Newline-delimited JSON bridge between the orchestrator and whatever
//! drives it over stdio (browser native-messaging shim, test harness).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::messages::{Inbound, Outbound};
use crate::ports::{PreviewChannel, ReplySink, ScriptInjector};
use crate::router::{Generation, TabId};

/// Outbound side of the bridge. Injection and popup requests are forwarded
/// as messages; whether a popup is listening is tracked from the
/// `popup-ready` / `popup-closed` messages seen on the inbound side.
pub struct StdioHost {
    outbound: mpsc::UnboundedSender<Outbound>,
    popup_listening: AtomicBool,
}

impl StdioHost {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let host = Arc::new(Self {
            outbound,
            popup_listening: AtomicBool::new(false),
        });
        (host, rx)
    }

    pub fn popup_listening(&self) -> bool {
        self.popup_listening.load(Ordering::Relaxed)
    }

    fn observe(&self, message: &Inbound) {
        match message {
            Inbound::PopupReady { .. } => self.popup_listening.store(true, Ordering::Relaxed),
            Inbound::PopupClosed {} => self.popup_listening.store(false, Ordering::Relaxed),
            _ => {}
        }
    }

    fn emit(&self, message: Outbound) -> Result<()> {
        self.outbound
            .send(message)
            .map_err(|_| anyhow!("host output channel closed"))
    }
}

#[async_trait]
impl ScriptInjector for StdioHost {
    async fn inject_probe(&self, tab_id: TabId, generation: Generation) -> Result<()> {
        self.emit(Outbound::InjectProbe { tab_id, generation })
    }

    async fn open_popup(&self, tab_id: TabId) -> Result<()> {
        self.emit(Outbound::OpenPopup { tab_id })
    }
}

#[async_trait]
impl PreviewChannel for StdioHost {
    async fn broadcast_preview(&self, text: &str) -> Result<()> {
        if !self.popup_listening() {
            return Err(anyhow!("no popup is listening for previews"));
        }
        self.emit(Outbound::CopiedTextPreview {
            text: text.to_string(),
        })
    }
}

#[async_trait]
impl ReplySink for StdioHost {
    async fn send(&self, message: Outbound) -> Result<()> {
        self.emit(message)
    }
}

/// Reads inbound lines until EOF, forwarding every well-formed message to
/// `tx`. Malformed lines, including ones that are not UTF-8, are logged and
/// dropped.
pub async fn read_inbound<R>(reader: R, host: Arc<StdioHost>, tx: mpsc::Sender<Inbound>) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut segments = reader.split(b'\n');
    while let Some(raw) = segments
        .next_segment()
        .await
        .context("Failed to read inbound message")?
    {
        let line = match String::from_utf8(raw) {
            Ok(line) => line,
            Err(err) => {
                warn!("Dropping inbound line that is not UTF-8: {}", err);
                continue;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let message = match Inbound::parse(line) {
            Ok(message) => message,
            Err(err) => {
                warn!("Dropping malformed inbound message: {}", err);
                continue;
            }
        };

        debug!("Inbound {}", message.kind());
        host.observe(&message);
        if tx.send(message).await.is_err() {
            debug!("Orchestrator stopped; closing inbound reader");
            break;
        }
    }
    Ok(())
}

pub async fn write_outbound<W>(mut rx: mpsc::UnboundedReceiver<Outbound>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let mut line = message.to_line().context("Failed to serialize outbound message")?;
        line.push('\n');
        writer
            .write_all(line.as_bytes())
            .await
            .context("Failed to write outbound message")?;
        writer.flush().await.context("Failed to flush outbound message")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn reader_forwards_valid_lines_and_tracks_popup() {
        let input = concat!(
            "{\"type\":\"popup-ready\",\"tab_id\":3}\n",
            "\n",
            "{\"type\":\"bogus\"}\n",
            "{\"type\":\"get-last-formatted\"}\n",
        );
        let (host, _outbound) = StdioHost::new();
        let (tx, mut rx) = mpsc::channel(8);

        read_inbound(BufReader::new(input.as_bytes()), Arc::clone(&host), tx)
            .await
            .unwrap();

        assert_eq!(rx.recv().await, Some(Inbound::PopupReady { tab_id: Some(3) }));
        assert_eq!(rx.recv().await, Some(Inbound::GetLastFormatted {}));
        assert_eq!(rx.recv().await, None);
        assert!(host.popup_listening());
    }

    #[tokio::test]
    async fn reader_survives_lines_that_are_not_utf8() {
        let mut input = b"{\"type\":\"get-last-formatted\"}\n".to_vec();
        input.extend_from_slice(b"\xff\xfe garbage\n");
        input.extend_from_slice(b"{\"type\":\"get-error-log\"}\r\n");
        let (host, _outbound) = StdioHost::new();
        let (tx, mut rx) = mpsc::channel(8);

        read_inbound(BufReader::new(input.as_slice()), host, tx)
            .await
            .unwrap();

        assert_eq!(rx.recv().await, Some(Inbound::GetLastFormatted {}));
        assert_eq!(rx.recv().await, Some(Inbound::GetErrorLog {}));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn preview_fails_without_listener() {
        let (host, mut outbound) = StdioHost::new();
        assert!(host.broadcast_preview("text").await.is_err());

        host.observe(&Inbound::PopupReady { tab_id: None });
        host.broadcast_preview("text").await.unwrap();
        assert_eq!(
            outbound.recv().await,
            Some(Outbound::CopiedTextPreview {
                text: "text".into()
            })
        );

        host.observe(&Inbound::PopupClosed {});
        assert!(host.broadcast_preview("again").await.is_err());
    }

    #[tokio::test]
    async fn writer_emits_one_line_per_message() {
        let (host, outbound) = StdioHost::new();
        host.inject_probe(1, 2).await.unwrap();
        host.open_popup(1).await.unwrap();
        drop(host);

        let mut buffer = Vec::new();
        write_outbound(outbound, &mut buffer).await.unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                r#"{"type":"inject-probe","tab_id":1,"generation":2}"#,
                r#"{"type":"open-popup","tab_id":1}"#,
            ]
        );
    }
}
