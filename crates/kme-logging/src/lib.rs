//! Structured logging for KME nodes
//!
//! This crate sets up the tracing subscriber used by every KME binary and
//! test harness.
//!
//! # Features
//!
//! - **JSONL Output**: Structured JSON lines for log aggregation (default)
//! - **Node Context**: A per-node span tags every line with the KME that
//!   produced it, so logs from two nodes in one process can be told apart
//! - **Correlation IDs**: Follow one request from the SAE-facing node to its
//!   peer through W3C `traceparent` headers
//! - **File Rotation**: Daily/hourly log rotation via tracing-appender
//!
//! # Quick Start
//!
//! ```ignore
//! use kme_logging::{KmeSubscriberBuilder, LogConfig};
//!
//! // JSONL to console
//! let _guard = KmeSubscriberBuilder::new().init()?;
//!
//! // Pretty human-readable output
//! let _guard = KmeSubscriberBuilder::new()
//!     .with_config(LogConfig::development())
//!     .init()?;
//! ```

pub mod config;
pub mod context;
pub mod correlation;
pub mod layers;

pub use config::{ConsoleFormat, FileOutput, JsonFields, LogConfig, LogRotation};
pub use context::NodeContextData;
pub use correlation::{CorrelationContext, TRACEPARENT_HEADER};
pub use tracing_appender::non_blocking::WorkerGuard;

use std::fs::{self, File};

use thiserror::Error;
use tracing_appender::non_blocking::NonBlocking;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    layer::{Layered, SubscriberExt},
    util::SubscriberInitExt,
};

/// Errors raised while installing the subscriber
#[derive(Debug, Error)]
pub enum LogError {
    /// The log directory or file could not be created
    #[error("Failed to prepare log output: {0}")]
    Io(#[from] std::io::Error),

    /// Filter directives did not parse
    #[error("Invalid log filter: {0}")]
    Filter(String),

    /// A global subscriber is already installed
    #[error("Failed to install subscriber: {0}")]
    Init(String),
}

/// Subscriber the output layers stack on
type Base = Layered<EnvFilter, Registry>;

/// Installs the global subscriber from a [`LogConfig`]
///
/// Stdout gets JSON lines unless the config picks another [`ConsoleFormat`].
/// File output is always JSON lines.
#[derive(Debug, Default)]
pub struct KmeSubscriberBuilder {
    config: LogConfig,
}

impl KmeSubscriberBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration
    pub fn with_config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.config.level = level.into();
        self
    }

    pub fn with_console(mut self, format: ConsoleFormat) -> Self {
        self.config.console = format;
        self
    }

    /// Also write JSON lines under `output.dir`
    pub fn with_file_output(mut self, output: FileOutput) -> Self {
        self.config.file = Some(output);
        self
    }

    /// Install the subscriber globally
    ///
    /// `RUST_LOG` overrides the configured level. The returned guard flushes
    /// file output when dropped and must be held for the program's lifetime.
    pub fn init(self) -> Result<Option<WorkerGuard>, LogError> {
        let env_filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::try_new(self.config.filter_directives())
                .map_err(|e| LogError::Filter(e.to_string()))?,
        };

        let mut outputs: Vec<Box<dyn Layer<Base> + Send + Sync>> = Vec::new();
        let mut guard = None;

        match self.config.console {
            ConsoleFormat::Off => {}
            ConsoleFormat::Json => {
                outputs.push(layers::jsonl_layer(std::io::stdout, &self.config.json))
            }
            ConsoleFormat::Pretty => outputs.push(layers::pretty_layer(false)),
            ConsoleFormat::Color => outputs.push(layers::pretty_layer(true)),
        }

        if let Some(output) = &self.config.file {
            let (writer, file_guard) = file_writer(output)?;
            outputs.push(layers::jsonl_layer(writer, &self.config.json));
            guard = Some(file_guard);
        }

        Registry::default()
            .with(env_filter)
            .with(outputs)
            .try_init()
            .map_err(|e| LogError::Init(e.to_string()))?;

        Ok(guard)
    }
}

/// Non-blocking writer for `output`, creating its directory first
fn file_writer(output: &FileOutput) -> Result<(NonBlocking, WorkerGuard), LogError> {
    fs::create_dir_all(&output.dir)?;
    let rotation = match output.rotation {
        LogRotation::Never => {
            let path = output.dir.join(format!("{}.log", output.prefix));
            return Ok(tracing_appender::non_blocking(File::create(path)?));
        }
        LogRotation::Daily => Rotation::DAILY,
        LogRotation::Hourly => Rotation::HOURLY,
    };
    let appender = RollingFileAppender::new(rotation, &output.dir, &output.prefix);
    Ok(tracing_appender::non_blocking(appender))
}

/// Warnings only; every test may call this, the first call wins
pub fn init_testing() {
    let _ = KmeSubscriberBuilder::new()
        .with_config(LogConfig::testing())
        .init();
}
