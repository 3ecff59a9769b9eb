// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Configuration types and parsing.
//!
//! JSON5 configuration format supporting:
//! - `loggers`: name → threshold and stream assignment (empty name is
//!   the root logger)
//! - `streams`: name → sink definition (file, dispatcher, async, or an
//!   externally registered type)
//! - `severities`: additional named severity points
//! - comments and trailing commas

use crate::decorator::{DecoratorError, FormatTemplate};
use crate::filter::{CompiledFilter, FilterError};
use crate::queue::OverflowPolicy;
use crate::severity::{Severity, SeverityError};
use crate::sink::Sink;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Startup/running configuration (JSON5 file format)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    /// Additional named severity points (name → rank).
    #[serde(default)]
    pub severities: HashMap<String, u8>,

    /// Logger tree configuration. The empty-name entry is the root.
    #[serde(default)]
    pub loggers: HashMap<String, LoggerConfig>,

    /// Output stream definitions.
    #[serde(default)]
    pub streams: HashMap<String, StreamConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct LoggerConfig {
    /// Threshold by severity name; inherited from the parent if absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<String>,

    /// One stream name or a list of them.
    #[serde(default)]
    pub stream: StreamRefs,
}

/// One stream reference or several, as the config file prefers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum StreamRefs {
    One(String),
    Many(Vec<String>),
}

impl Default for StreamRefs {
    fn default() -> Self {
        StreamRefs::Many(Vec::new())
    }
}

impl StreamRefs {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        match self {
            StreamRefs::One(name) => std::slice::from_ref(name).iter(),
            StreamRefs::Many(names) => names.iter(),
        }
        .map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        match self {
            StreamRefs::One(_) => false,
            StreamRefs::Many(names) => names.is_empty(),
        }
    }
}

/// A dispatch entry: a reference to a named stream, or a nested
/// anonymous stream definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum DispatchRef {
    Named(String),
    Inline(Box<StreamConfig>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StreamConfig {
    /// `file`, `dispatcher`, `async`, or an externally registered type.
    #[serde(rename = "type", default)]
    pub kind: String,

    /// Format template; defaults to "{date_time} {severity} {logger} {msg}".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,

    /// Per-sink filter expression.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,

    /// Filename template for file streams ($D, $T, $$, $N, ${VAR}).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,

    #[serde(default)]
    pub create_dirs: bool,

    /// Write buffer size in bytes; 0 flushes after every record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffering: Option<usize>,

    /// Children of dispatcher/async streams.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dispatch: Vec<DispatchRef>,

    /// Queue capacity of async streams (rounded up to a power of two).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_capacity: Option<usize>,

    /// Overflow policy of async streams.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overflow: Option<OverflowPolicy>,

    /// Per-sink encoded frame limit in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_frame: Option<usize>,

    // Rotation belongs to external file-sink implementations; the
    // built-in file stream rejects these.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotate_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotate_period: Option<String>,
    #[serde(default)]
    pub compress_on_close: bool,
}

/// Configuration errors. Returned to the configuration caller; a failed
/// load or reload leaves the runtime state untouched.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {message}")]
    Io { path: PathBuf, message: String },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("stream '{stream}': unknown stream type '{kind}'")]
    UnknownStreamType { stream: String, kind: String },

    #[error("stream '{stream}' references unknown stream '{target}'")]
    DanglingStream { stream: String, target: String },

    #[error("logger '{logger}' references unknown stream '{target}'")]
    DanglingLoggerStream { logger: String, target: String },

    #[error("cyclic dispatch involving stream '{0}'")]
    CyclicDispatch(String),

    #[error("stream '{stream}': {source}")]
    Placeholder {
        stream: String,
        #[source]
        source: DecoratorError,
    },

    #[error("stream '{stream}': invalid filter: {source}")]
    Filter {
        stream: String,
        #[source]
        source: FilterError,
    },

    #[error(transparent)]
    Severity(#[from] SeverityError),

    #[error("unknown severity '{0}'")]
    UnknownSeverity(String),

    #[error("stream '{stream}': missing required field '{field}'")]
    MissingField { stream: String, field: &'static str },

    #[error("stream '{stream}': option '{option}' requires an external sink implementation")]
    UnsupportedOption { stream: String, option: &'static str },

    #[error("stream '{stream}': invalid '{field}': {message}")]
    InvalidValue {
        stream: String,
        field: &'static str,
        message: String,
    },

    #[error("logging already initialized")]
    AlreadyInitialized,
}

/// Builder hook for stream types the core does not implement
/// (socket, syslog, zip, rotating files).
pub trait SinkFactory: Send + Sync {
    fn build(&self, name: &str, config: &StreamConfig) -> Result<Arc<dyn Sink>, ConfigError>;
}

static FACTORIES: RwLock<Vec<(String, Arc<dyn SinkFactory>)>> = RwLock::new(Vec::new());

/// Register a factory for an external stream type. Later registrations
/// for the same type replace earlier ones.
pub fn register_sink_factory(kind: &str, factory: Arc<dyn SinkFactory>) {
    let mut factories = FACTORIES.write().unwrap_or_else(|e| e.into_inner());
    factories.retain(|(existing, _)| existing != kind);
    factories.push((kind.to_string(), factory));
}

pub(crate) fn factory_for(kind: &str) -> Option<Arc<dyn SinkFactory>> {
    let factories = FACTORIES.read().unwrap_or_else(|e| e.into_inner());
    factories
        .iter()
        .find(|(existing, _)| existing == kind)
        .map(|(_, factory)| factory.clone())
}

const BUILTIN_KINDS: [&str; 3] = ["file", "dispatcher", "async"];
const MIN_MAX_FRAME: usize = 256;

impl Config {
    /// Load configuration from a JSON5 file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        json5::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Serialize configuration to a pretty JSON string. The json5 crate
    /// has no pretty printer; serde_json output is valid json5 input.
    pub fn to_json5(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Save configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        std::fs::write(path, self.to_json5()).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Resolve a severity name against the built-in points, previously
    /// registered points, and this configuration's own `severities`.
    pub(crate) fn resolve_severity(&self, name: &str) -> Option<Severity> {
        if let Some(severity) = Severity::from_name(name) {
            return Some(severity);
        }
        self.severities
            .iter()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
            .map(|(_, rank)| Severity::from_rank(*rank))
    }

    /// Validate the configuration without touching runtime state.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_severities()?;
        for (name, stream) in &self.streams {
            self.validate_stream(name, stream)?;
        }
        self.detect_dispatch_cycles()?;
        for (logger, config) in &self.loggers {
            if let Some(threshold) = &config.threshold {
                if self.resolve_severity(threshold).is_none() {
                    return Err(ConfigError::UnknownSeverity(threshold.clone()));
                }
            }
            for target in config.stream.iter() {
                if !self.streams.contains_key(target) {
                    return Err(ConfigError::DanglingLoggerStream {
                        logger: logger.clone(),
                        target: target.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn validate_severities(&self) -> Result<(), ConfigError> {
        let mut ranks: HashMap<u8, &str> = HashMap::new();
        for (name, rank) in &self.severities {
            if let Some(builtin) = Severity::from_name(name) {
                if builtin.rank() != *rank {
                    return Err(SeverityError::NameTaken(name.clone(), builtin.rank()).into());
                }
            }
            if let Some(previous) = ranks.insert(*rank, name) {
                return Err(SeverityError::RankTaken(*rank, previous.to_string()).into());
            }
        }
        Ok(())
    }

    fn validate_stream(&self, name: &str, stream: &StreamConfig) -> Result<(), ConfigError> {
        if let Some(format) = &stream.format {
            FormatTemplate::compile(format).map_err(|source| ConfigError::Placeholder {
                stream: name.to_string(),
                source,
            })?;
        }
        if let Some(filter) = &stream.filter {
            CompiledFilter::compile(filter).map_err(|source| ConfigError::Filter {
                stream: name.to_string(),
                source,
            })?;
        }
        let is_async = stream.kind == "async";
        if !is_async {
            if stream.queue_capacity.is_some() {
                return Err(ConfigError::InvalidValue {
                    stream: name.to_string(),
                    field: "queue_capacity",
                    message: "only async streams have a queue".to_string(),
                });
            }
            if stream.overflow.is_some() {
                return Err(ConfigError::InvalidValue {
                    stream: name.to_string(),
                    field: "overflow",
                    message: "only async streams have an overflow policy".to_string(),
                });
            }
        }
        match stream.kind.as_str() {
            "file" => {
                if stream.filename.is_none() {
                    return Err(ConfigError::MissingField {
                        stream: name.to_string(),
                        field: "filename",
                    });
                }
                if stream.rotate_size.is_some() {
                    return Err(ConfigError::UnsupportedOption {
                        stream: name.to_string(),
                        option: "rotate_size",
                    });
                }
                if stream.rotate_period.is_some() {
                    return Err(ConfigError::UnsupportedOption {
                        stream: name.to_string(),
                        option: "rotate_period",
                    });
                }
                if stream.compress_on_close {
                    return Err(ConfigError::UnsupportedOption {
                        stream: name.to_string(),
                        option: "compress_on_close",
                    });
                }
            }
            "dispatcher" | "async" => {
                if let Some(capacity) = stream.queue_capacity {
                    if capacity < 2 {
                        return Err(ConfigError::InvalidValue {
                            stream: name.to_string(),
                            field: "queue_capacity",
                            message: format!("{} is below the minimum of 2", capacity),
                        });
                    }
                }
                if let Some(max_frame) = stream.max_frame {
                    if max_frame < MIN_MAX_FRAME {
                        return Err(ConfigError::InvalidValue {
                            stream: name.to_string(),
                            field: "max_frame",
                            message: format!(
                                "{} is below the minimum of {}",
                                max_frame, MIN_MAX_FRAME
                            ),
                        });
                    }
                }
                for entry in &stream.dispatch {
                    match entry {
                        DispatchRef::Named(target) => {
                            if !self.streams.contains_key(target) {
                                return Err(ConfigError::DanglingStream {
                                    stream: name.to_string(),
                                    target: target.clone(),
                                });
                            }
                        }
                        DispatchRef::Inline(inline) => {
                            self.validate_stream(name, inline)?;
                        }
                    }
                }
            }
            other => {
                if !BUILTIN_KINDS.contains(&other) && factory_for(other).is_none() {
                    return Err(ConfigError::UnknownStreamType {
                        stream: name.to_string(),
                        kind: other.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Named dispatch references reachable from `stream`, inline
    /// definitions included.
    fn named_refs<'a>(stream: &'a StreamConfig, out: &mut Vec<&'a str>) {
        for entry in &stream.dispatch {
            match entry {
                DispatchRef::Named(target) => out.push(target),
                DispatchRef::Inline(inline) => Self::named_refs(inline, out),
            }
        }
    }

    fn detect_dispatch_cycles(&self) -> Result<(), ConfigError> {
        fn visit<'a>(
            config: &'a Config,
            name: &'a str,
            visiting: &mut HashSet<&'a str>,
            done: &mut HashSet<&'a str>,
        ) -> Result<(), ConfigError> {
            if done.contains(name) {
                return Ok(());
            }
            if !visiting.insert(name) {
                return Err(ConfigError::CyclicDispatch(name.to_string()));
            }
            if let Some(stream) = config.streams.get(name) {
                let mut refs = Vec::new();
                Config::named_refs(stream, &mut refs);
                for target in refs {
                    if config.streams.contains_key(target) {
                        visit(config, target, visiting, done)?;
                    }
                }
            }
            visiting.remove(name);
            done.insert(name);
            Ok(())
        }

        let mut done = HashSet::new();
        for name in self.streams.keys() {
            let mut visiting = HashSet::new();
            visit(self, name, &mut visiting, &mut done)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
    {
        // comments and trailing commas are fine
        severities: { "audit": 45 },
        loggers: {
            "": { threshold: "INFO", stream: "console" },
            "net": { threshold: "DEBUG", stream: ["console", "bulk"] },
        },
        streams: {
            console: {
                type: "file",
                filename: "/tmp/logfan-$$.log",
                format: "{severity} {msg}",
                filter: "severity >= DEBUG",
            },
            bulk: {
                type: "async",
                dispatch: ["console"],
                queue_capacity: 1024,
                overflow: "drop_newest",
            },
        },
    }
    "#;

    #[test]
    fn test_parse_json5_with_comments() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.severities.get("audit"), Some(&45));
        assert_eq!(config.loggers[""].threshold.as_deref(), Some("INFO"));
        let net: Vec<&str> = config.loggers["net"].stream.iter().collect();
        assert_eq!(net, vec!["console", "bulk"]);
        assert_eq!(config.streams["bulk"].kind, "async");
        assert_eq!(
            config.streams["bulk"].overflow,
            Some(OverflowPolicy::DropNewest)
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_roundtrip_through_pretty_output() {
        let config = Config::parse(SAMPLE).unwrap();
        let text = config.to_json5();
        let reparsed = Config::parse(&text).unwrap();
        assert_eq!(config, reparsed);
    }

    #[test]
    fn test_unknown_stream_type() {
        let config = Config::parse(r#"{ streams: { s: { type: "teleport" } } }"#).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownStreamType { .. })
        ));
    }

    #[test]
    fn test_missing_filename() {
        let config = Config::parse(r#"{ streams: { f: { type: "file" } } }"#).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField {
                field: "filename",
                ..
            })
        ));
    }

    #[test]
    fn test_unknown_placeholder() {
        let config = Config::parse(
            r#"{ streams: { f: { type: "file", filename: "x.log", format: "{wat}" } } }"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Placeholder { .. })
        ));
    }

    #[test]
    fn test_bad_filter_names_offender() {
        let config = Config::parse(
            r#"{ streams: { f: { type: "file", filename: "x.log", filter: "sev >= 1" } } }"#,
        )
        .unwrap();
        match config.validate() {
            Err(ConfigError::Filter { stream, .. }) => assert_eq!(stream, "f"),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_cyclic_dispatch_detected() {
        let config = Config::parse(
            r#"{ streams: {
                a: { type: "dispatcher", dispatch: ["b"] },
                b: { type: "dispatcher", dispatch: ["a"] },
            } }"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::CyclicDispatch(_))
        ));
    }

    #[test]
    fn test_dangling_references() {
        let config =
            Config::parse(r#"{ streams: { a: { type: "dispatcher", dispatch: ["ghost"] } } }"#)
                .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DanglingStream { .. })
        ));

        let config = Config::parse(r#"{ loggers: { x: { stream: "ghost" } } }"#).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DanglingLoggerStream { .. })
        ));
    }

    #[test]
    fn test_rotation_requires_external_sink() {
        let config = Config::parse(
            r#"{ streams: { f: { type: "file", filename: "x.log", rotate_size: 1048576 } } }"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnsupportedOption {
                option: "rotate_size",
                ..
            })
        ));
    }

    #[test]
    fn test_custom_severity_resolution() {
        let config = Config::parse(
            r#"{ severities: { audit: 45 },
                 loggers: { "": { threshold: "audit" } } }"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(
            config.resolve_severity("audit"),
            Some(Severity::from_rank(45))
        );
    }

    #[test]
    fn test_queue_options_only_on_async() {
        let config = Config::parse(
            r#"{ streams: { f: { type: "file", filename: "x.log", queue_capacity: 64 } } }"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "queue_capacity",
                ..
            })
        ));
    }

    #[test]
    fn test_inline_dispatch_validates() {
        let config = Config::parse(
            r#"{ streams: { a: { type: "async", dispatch: [
                { type: "file", filename: "x.log" },
            ] } } }"#,
        )
        .unwrap();
        config.validate().unwrap();

        let config = Config::parse(
            r#"{ streams: { a: { type: "async", dispatch: [
                { type: "file" },
            ] } } }"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField { .. })
        ));
    }
}
