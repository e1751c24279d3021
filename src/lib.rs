pub mod app;
pub mod clipboard;
pub mod config;
pub mod convert;
pub mod error;
pub mod error_log;
pub mod format;
pub mod host;
pub mod logging;
pub mod messages;
pub mod options;
pub mod pipeline;
pub mod ports;
pub mod router;
pub mod safety;
pub mod storage;

pub use app::{Collaborators, MarkclipApp};
pub use config::{Config, ConfigManager};
pub use error::{ErrorContext, TaggedError};
pub use options::{FormatOptions, ReplacementRule};
pub use pipeline::{CopyPipeline, CopyResult};
pub use router::{TriggerRouter, TriggerSource};
