use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::error::{ErrorContext, TaggedError};
use crate::ports::KeyValueStore;

pub const ERROR_LOG_KEY: &str = "errorLog";
pub const DEFAULT_ERROR_LOG_CAPACITY: usize = 50;
const BADGE_LIMIT: usize = 99;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggedError {
    pub message: String,
    pub context: ErrorContext,
    pub timestamp_ms: i64,
}

/// Bounded, persisted record of recent failures, oldest first.
///
/// Recording never fails from the caller's point of view: if the store
/// cannot be read or written the new entry is dropped and the stored history
/// is left alone. Only an unreadable payload is reset.
#[derive(Clone)]
pub struct ErrorLog {
    store: Arc<dyn KeyValueStore>,
    capacity: Arc<AtomicUsize>,
}

impl ErrorLog {
    pub fn new(store: Arc<dyn KeyValueStore>, capacity: usize) -> Self {
        Self {
            store,
            capacity: Arc::new(AtomicUsize::new(capacity.max(1))),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Shared by every clone of this log.
    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity.max(1), Ordering::Relaxed);
    }

    pub async fn record(&self, context: ErrorContext, error: impl fmt::Display) {
        let message = format!("{error:#}");
        warn!(context = %context, "{}", message);

        let mut entries = match self.try_load().await {
            Ok(entries) => entries,
            Err(err) => {
                debug!("Failed to read error log; dropping entry: {:#}", err);
                return;
            }
        };
        entries.push(LoggedError {
            message,
            context,
            timestamp_ms: now_ms(),
        });

        let capacity = self.capacity();
        if entries.len() > capacity {
            let overflow = entries.len() - capacity;
            entries.drain(..overflow);
        }

        self.persist(&entries).await;
    }

    pub async fn record_tagged(&self, error: &TaggedError) {
        self.record(error.context, &error.message).await;
    }

    pub async fn read(&self) -> Vec<LoggedError> {
        self.try_load().await.unwrap_or_else(|err| {
            debug!("Failed to read error log: {:#}", err);
            Vec::new()
        })
    }

    pub async fn clear(&self) {
        self.persist(&[]).await;
    }

    /// Errors only when the store itself fails; a corrupt payload reads as
    /// an empty log.
    async fn try_load(&self) -> anyhow::Result<Vec<LoggedError>> {
        let Some(value) = self.store.get(ERROR_LOG_KEY).await? else {
            return Ok(Vec::new());
        };
        Ok(serde_json::from_value(value).unwrap_or_else(|err| {
            debug!("Discarding unreadable error log: {}", err);
            Vec::new()
        }))
    }

    async fn persist(&self, entries: &[LoggedError]) {
        let value = match serde_json::to_value(entries) {
            Ok(value) => value,
            Err(err) => {
                debug!("Failed to serialize error log: {}", err);
                return;
            }
        };
        if let Err(err) = self.store.set(ERROR_LOG_KEY, value).await {
            debug!("Failed to persist error log: {:#}", err);
        }
    }
}

/// Badge text for the popup: empty when there is nothing to show.
pub fn badge(count: usize) -> String {
    match count {
        0 => String::new(),
        n if n > BADGE_LIMIT => format!("{BADGE_LIMIT}+"),
        n => n.to_string(),
    }
}

fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
