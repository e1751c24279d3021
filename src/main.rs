use anyhow::{Context, Result};
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use markclip_rs::{
    clipboard::SystemClipboard,
    convert::Html2MdConverter,
    error_log::{self, ErrorLog},
    format,
    host::{self, StdioHost},
    logging::MarkclipLogFormatter,
    options::{FormatOptions, OptionsStore},
    ports::{KeyValueStore, MarkdownConverter},
    storage::JsonFileStore,
    Collaborators, ConfigManager, MarkclipApp,
};
use std::env;
use std::sync::Arc;
use time::{macros::format_description, OffsetDateTime};
use tokio::io::BufReader;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries outbound messages.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "markclip_rs=info,markclip=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .event_format(MarkclipLogFormatter::new()),
        )
        .init();

    let args: Vec<String> = env::args().collect();

    if args.iter().any(|arg| arg == "--errors") {
        return print_error_log().await;
    }

    if let Some(path) = flag_value(&args, "--format") {
        let title = flag_value(&args, "--title").unwrap_or_default();
        let url = flag_value(&args, "--url").unwrap_or_default();
        return format_file(&path, &title, &url).await;
    }

    run_host().await
}

async fn run_host() -> Result<()> {
    info!("🚀 markclip-rs starting up");

    let config_manager = ConfigManager::load()?;
    config_manager.start_watching();
    let config = config_manager.get();
    let storage_file = config_manager.storage_file();
    info!("✅ Configuration loaded");
    info!("   Storage: {:?}", storage_file);
    info!("   Error log capacity: {}", config.error_log_capacity);
    info!("   Clipboard writes: {}", config.auto_copy_clipboard);

    let store: Arc<dyn KeyValueStore> = Arc::new(JsonFileStore::new(storage_file));
    let (stdio, outbound_rx) = StdioHost::new();

    let app = MarkclipApp::new(
        config,
        Collaborators {
            store,
            clipboard: Arc::new(SystemClipboard::new()),
            converter: Arc::new(Html2MdConverter),
            injector: stdio.clone(),
            preview: stdio.clone(),
            replies: stdio.clone(),
        },
    );

    let (inbound_tx, inbound_rx) = mpsc::channel(64);

    tokio::spawn(async move {
        if let Err(err) = host::write_outbound(outbound_rx, tokio::io::stdout()).await {
            error!("Outbound writer stopped: {:#}", err);
        }
    });

    let reader_host = Arc::clone(&stdio);
    tokio::spawn(async move {
        let stdin = BufReader::new(tokio::io::stdin());
        if let Err(err) = host::read_inbound(stdin, reader_host, inbound_tx).await {
            error!("Inbound reader stopped: {:#}", err);
        }
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

    #[cfg(unix)]
    {
        tokio::spawn(async move {
            let ctrl_c = signal::ctrl_c();
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to set up SIGTERM handler");

            tokio::select! {
                _ = ctrl_c => {
                    info!("Received SIGINT (Ctrl+C)");
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                }
            }

            let _ = shutdown_tx.send(());
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
            info!("Received SIGINT (Ctrl+C)");
            let _ = shutdown_tx.send(());
        });
    }

    tokio::select! {
        result = app.run(inbound_rx, Some(config_manager.subscribe())) => {
            if let Err(e) = result {
                error!("Orchestrator error: {:#}", e);
            }
        }
        _ = shutdown_rx => {
            info!("Shutdown signal received");
        }
    }

    info!("🛑 markclip-rs stopped");
    Ok(())
}

async fn print_error_log() -> Result<()> {
    let config_manager = ConfigManager::load()?;
    let config = config_manager.get();
    let store: Arc<dyn KeyValueStore> = Arc::new(JsonFileStore::new(config_manager.storage_file()));
    let entries = ErrorLog::new(store, config.error_log_capacity).read().await;

    if entries.is_empty() {
        println!("No problems recorded.");
        return Ok(());
    }

    let timestamp_format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["When (UTC)", "Context", "Message"]);

    for entry in &entries {
        let when = OffsetDateTime::from_unix_timestamp_nanos(i128::from(entry.timestamp_ms) * 1_000_000)
            .ok()
            .and_then(|at| at.format(&timestamp_format).ok())
            .unwrap_or_else(|| entry.timestamp_ms.to_string());
        table.add_row(vec![when, entry.context.to_string(), entry.message.clone()]);
    }

    println!("{table}");
    println!("{} problem(s) [badge: {}]", entries.len(), error_log::badge(entries.len()));
    Ok(())
}

async fn format_file(path: &str, title: &str, url: &str) -> Result<()> {
    let html = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read selection HTML at {:?}", path))?;

    let config_manager = ConfigManager::load()?;
    let store: Arc<dyn KeyValueStore> = Arc::new(JsonFileStore::new(config_manager.storage_file()));
    let options = match OptionsStore::new(store).load().await {
        Ok(options) => options,
        Err(err) => {
            warn!("Using default format options: {}", err);
            FormatOptions::default()
        }
    };

    let markdown = Html2MdConverter.convert(&html);
    println!("{}", format::format(markdown.trim(), title, url, &options));
    Ok(())
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|arg| arg == flag)
        .and_then(|index| args.get(index + 1))
        .cloned()
}
