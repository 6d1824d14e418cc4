//! Logging configuration
//!
//! Usually read from the `[logging]` table of a node's TOML file:
//!
//! ```toml
//! [logging]
//! level = "info"
//! console = "pretty"
//!
//! [logging.file]
//! dir = "/var/log/kme"
//! rotation = "hourly"
//!
//! [logging.targets]
//! reqwest = "warn"
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// What the subscriber writes and where
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Level applied to every target without an override; `RUST_LOG` wins
    pub level: String,
    /// Format of stdout output
    pub console: ConsoleFormat,
    /// JSON lines written to rotating files
    pub file: Option<FileOutput>,
    /// Fields included in JSON lines, console and file alike
    pub json: JsonFields,
    /// Per-target levels, e.g. `reqwest = "warn"`
    pub targets: BTreeMap<String, String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            console: ConsoleFormat::Json,
            file: None,
            json: JsonFields::default(),
            targets: BTreeMap::new(),
        }
    }
}

impl LogConfig {
    /// Colored human-readable console at debug level
    pub fn development() -> Self {
        Self {
            level: "debug".into(),
            console: ConsoleFormat::Color,
            ..Self::default()
        }
    }

    /// Files only, under `dir`, rotated daily
    pub fn production(dir: PathBuf) -> Self {
        Self {
            console: ConsoleFormat::Off,
            file: Some(FileOutput {
                dir,
                ..FileOutput::default()
            }),
            ..Self::default()
        }
    }

    /// Warnings and errors only, so test output stays readable
    pub fn testing() -> Self {
        Self {
            level: "warn".into(),
            console: ConsoleFormat::Pretty,
            ..Self::default()
        }
    }

    /// `EnvFilter` directives: the level, then each target override
    pub fn filter_directives(&self) -> String {
        std::iter::once(self.level.clone())
            .chain(
                self.targets
                    .iter()
                    .map(|(target, level)| format!("{target}={level}")),
            )
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Stdout format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleFormat {
    /// Nothing on stdout
    Off,
    /// One JSON object per line
    #[default]
    Json,
    /// Plain human-readable lines
    Pretty,
    /// Human-readable lines with ANSI colors
    Color,
}

/// Rotating file output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileOutput {
    pub dir: PathBuf,
    /// File names start with this, then the rotation date
    pub prefix: String,
    pub rotation: LogRotation,
}

impl Default for FileOutput {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            prefix: "kme".into(),
            rotation: LogRotation::Daily,
        }
    }
}

/// When a new log file is started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    #[default]
    Daily,
    Hourly,
    /// One `{prefix}.log`, truncated at startup
    Never,
}

/// Optional parts of each JSON line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonFields {
    /// Event fields at the top level instead of under `fields`
    pub flatten: bool,
    /// The full span stack, not just the innermost span
    pub spans: bool,
    /// Thread ID and name
    pub thread: bool,
    /// Source file and line
    pub location: bool,
}

impl Default for JsonFields {
    fn default() -> Self {
        Self {
            flatten: true,
            spans: true,
            thread: false,
            location: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        let default = LogConfig::default();
        assert_eq!(default.level, "info");
        assert_eq!(default.console, ConsoleFormat::Json);
        assert!(default.file.is_none());

        let dev = LogConfig::development();
        assert_eq!(dev.level, "debug");
        assert_eq!(dev.console, ConsoleFormat::Color);

        let prod = LogConfig::production(PathBuf::from("/var/log/kme"));
        assert_eq!(prod.console, ConsoleFormat::Off);
        let file = prod.file.unwrap();
        assert_eq!(file.dir, PathBuf::from("/var/log/kme"));
        assert_eq!(file.prefix, "kme");
        assert_eq!(file.rotation, LogRotation::Daily);

        assert_eq!(LogConfig::testing().level, "warn");
    }

    #[test]
    fn test_filter_directives() {
        let mut config = LogConfig::default();
        assert_eq!(config.filter_directives(), "info");

        config.targets.insert("reqwest".into(), "warn".into());
        config.targets.insert("hyper".into(), "error".into());
        assert_eq!(config.filter_directives(), "info,hyper=error,reqwest=warn");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: LogConfig = toml::from_str(
            r#"
            level = "debug"
            console = "off"

            [file]
            dir = "/tmp/kme-logs"
            rotation = "never"
            "#,
        )
        .unwrap();
        assert_eq!(config.level, "debug");
        assert_eq!(config.console, ConsoleFormat::Off);
        assert!(config.json.flatten);
        let file = config.file.unwrap();
        assert_eq!(file.rotation, LogRotation::Never);
        assert_eq!(file.prefix, "kme");
    }
}
