// SPDX-License-Identifier: Apache-2.0 OR MIT
// Runtime: initialization, the sink graph, and the termination coordinator
//
// The Runtime is the scoped resource governing worker shutdown. Worker
// threads never block process exit by themselves; holding the Runtime
// near the entry point re-attaches them: dropping it (or calling
// shutdown()) signals every worker, drains each queue under its
// deadline, joins the workers, and closes every sink exactly once.

use crate::config::{Config, ConfigError, DispatchRef, StreamConfig};
use crate::logger::Logger;
use crate::registry::{self, LoggerAssignment, DEFAULT_ROOT_THRESHOLD};
use crate::severity::Severity;
use crate::sink::{fallback_report, DispatcherSink, Sink, TextSink};
use crate::typereg;
use crate::worker::AsyncSink;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

static ACTIVE: AtomicBool = AtomicBool::new(false);

/// Get (creating on demand) a logger handle. Until a runtime is
/// initialized the handle has no sinks, so accepted records go nowhere,
/// but thresholds already apply.
pub fn logger(name: &str) -> Logger {
    registry::global().logger(name)
}

/// What the final drain observed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Frames that missed the per-sink drain deadline.
    pub lost_at_shutdown: u64,
    /// Records dropped earlier by overflow policies.
    pub dropped_overflow: u64,
}

/// The process-wide logging runtime. One instance at a time.
pub struct Runtime {
    sinks: Vec<Arc<dyn Sink>>,
    async_sinks: Vec<Arc<AsyncSink>>,
    shut_down: bool,
}

impl Runtime {
    /// Initialize from a validated configuration. Fails without side
    /// effects if the configuration is invalid or a runtime is already
    /// active.
    pub fn init(config: Config) -> Result<Runtime, ConfigError> {
        config.validate()?;
        if ACTIVE.swap(true, Ordering::SeqCst) {
            return Err(ConfigError::AlreadyInitialized);
        }
        match Self::apply(&config) {
            Ok(runtime) => Ok(runtime),
            Err(error) => {
                ACTIVE.store(false, Ordering::SeqCst);
                Err(error)
            }
        }
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder {
            root_threshold: DEFAULT_ROOT_THRESHOLD,
            sinks: Vec::new(),
            async_sinks: Vec::new(),
            assignments: Vec::new(),
        }
    }

    fn apply(config: &Config) -> Result<Runtime, ConfigError> {
        for (name, rank) in &config.severities {
            Severity::register(name, *rank)?;
        }
        typereg::seal();

        let mut graph = SinkGraph {
            config,
            named: HashMap::new(),
            all: Vec::new(),
            async_sinks: Vec::new(),
        };
        match Self::wire(config, &mut graph) {
            Ok((root_threshold, assignments)) => {
                registry::global().apply_configuration(root_threshold, assignments);
                Ok(Runtime {
                    sinks: graph.all,
                    async_sinks: graph.async_sinks,
                    shut_down: false,
                })
            }
            Err(error) => {
                // A partially built graph may already have running
                // workers; tear it down before reporting.
                for sink in &graph.async_sinks {
                    sink.shutdown_and_join();
                }
                for sink in &graph.all {
                    sink.close();
                }
                Err(error)
            }
        }
    }

    fn wire(
        config: &Config,
        graph: &mut SinkGraph,
    ) -> Result<(Severity, Vec<LoggerAssignment>), ConfigError> {
        let mut stream_names: Vec<&String> = config.streams.keys().collect();
        stream_names.sort();
        for name in stream_names {
            graph.named_sink(name)?;
        }

        let mut assignments = Vec::new();
        for (name, logger_config) in &config.loggers {
            let threshold = match &logger_config.threshold {
                Some(text) => Some(
                    config
                        .resolve_severity(text)
                        .ok_or_else(|| ConfigError::UnknownSeverity(text.clone()))?,
                ),
                None => None,
            };
            let sinks = if logger_config.stream.is_empty() {
                None
            } else {
                let mut list: Vec<Arc<dyn Sink>> = Vec::new();
                for target in logger_config.stream.iter() {
                    list.push(graph.named_sink(target)?);
                }
                Some(Arc::new(list))
            };
            // The root threshold is passed separately below.
            let threshold = if name.is_empty() { None } else { threshold };
            assignments.push(LoggerAssignment {
                name: name.clone(),
                threshold,
                sinks,
            });
        }
        let root_threshold = config
            .loggers
            .get("")
            .and_then(|root| root.threshold.as_deref())
            .and_then(|text| config.resolve_severity(text))
            .unwrap_or(DEFAULT_ROOT_THRESHOLD);
        Ok((root_threshold, assignments))
    }

    /// Runtime control: set a logger's threshold, effective immediately
    /// for subsequent emissions.
    pub fn set_threshold(&self, name: &str, severity: Severity) {
        registry::global().set_threshold(name, severity);
    }

    /// Runtime control: all known loggers with effective thresholds.
    pub fn list_loggers(&self) -> Vec<(String, Severity)> {
        registry::global().list()
    }

    /// Flush every sink; async sinks drain their queues first.
    pub fn flush_all(&self) {
        for sink in &self.sinks {
            sink.flush();
        }
    }

    /// Replace the configuration. The old sink graph is drained and
    /// closed only after the new one validated and built.
    pub fn reload_config(&mut self, text: &str) -> Result<(), ConfigError> {
        let config = Config::parse(text)?;
        config.validate()?;
        let mut replacement = Self::apply(&config)?;
        let old_sinks = std::mem::replace(&mut self.sinks, std::mem::take(&mut replacement.sinks));
        let old_async = std::mem::replace(&mut self.async_sinks, std::mem::take(&mut replacement.async_sinks));
        for sink in &old_async {
            sink.shutdown_and_join();
        }
        for sink in &old_sinks {
            sink.close();
        }
        Ok(())
    }

    /// Drain and join every worker, then close every sink. Returns what
    /// was lost. Never deadlocks; each worker enforces its own drain
    /// deadline.
    pub fn shutdown(mut self) -> ShutdownReport {
        self.do_shutdown()
    }

    fn do_shutdown(&mut self) -> ShutdownReport {
        if self.shut_down {
            return ShutdownReport::default();
        }
        self.shut_down = true;

        // Detach loggers first: emissions after this point are gated
        // away from the sinks being torn down.
        registry::global().apply_configuration(DEFAULT_ROOT_THRESHOLD, Vec::new());

        let mut report = ShutdownReport::default();
        for sink in &self.async_sinks {
            report.lost_at_shutdown += sink.shutdown_and_join();
            report.dropped_overflow += sink.dropped_count();
        }
        for sink in &self.sinks {
            sink.close();
        }
        if report.lost_at_shutdown > 0 {
            fallback_report(&format!(
                "logfan: shutdown dropped {} records past the drain deadline",
                report.lost_at_shutdown
            ));
        }
        ACTIVE.store(false, Ordering::SeqCst);
        report
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.do_shutdown();
    }
}

/// Builds the sink graph for one configuration, memoizing named
/// streams so shared references resolve to shared sinks.
struct SinkGraph<'a> {
    config: &'a Config,
    named: HashMap<String, Arc<dyn Sink>>,
    all: Vec<Arc<dyn Sink>>,
    async_sinks: Vec<Arc<AsyncSink>>,
}

impl SinkGraph<'_> {
    fn named_sink(&mut self, name: &str) -> Result<Arc<dyn Sink>, ConfigError> {
        if let Some(sink) = self.named.get(name) {
            return Ok(sink.clone());
        }
        let stream = self
            .config
            .streams
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::DanglingStream {
                stream: name.to_string(),
                target: name.to_string(),
            })?;
        let sink = self.build_stream(name, &stream)?;
        self.named.insert(name.to_string(), sink.clone());
        Ok(sink)
    }

    fn build_stream(
        &mut self,
        name: &str,
        stream: &StreamConfig,
    ) -> Result<Arc<dyn Sink>, ConfigError> {
        let sink: Arc<dyn Sink> = match stream.kind.as_str() {
            "file" => {
                let filename =
                    stream
                        .filename
                        .as_deref()
                        .ok_or_else(|| ConfigError::MissingField {
                            stream: name.to_string(),
                            field: "filename",
                        })?;
                let mut builder = TextSink::builder(name);
                if let Some(format) = &stream.format {
                    builder = builder.format(format);
                }
                if let Some(filter) = &stream.filter {
                    builder = builder.filter(filter);
                }
                builder.file(filename, stream.create_dirs, stream.buffering.unwrap_or(0))?
            }
            "dispatcher" => {
                let children = self.build_children(name, &stream.dispatch)?;
                DispatcherSink::new(name, children)
            }
            "async" => {
                let children = self.build_children(name, &stream.dispatch)?;
                let mut builder = AsyncSink::builder(name);
                for child in children {
                    builder = builder.dispatch(child);
                }
                if let Some(filter) = &stream.filter {
                    builder = builder.filter(filter);
                }
                if let Some(capacity) = stream.queue_capacity {
                    builder = builder.queue_capacity(capacity);
                }
                if let Some(policy) = stream.overflow {
                    builder = builder.overflow(policy);
                }
                if let Some(max_frame) = stream.max_frame {
                    builder = builder.max_frame(max_frame);
                }
                let sink = builder.build()?;
                self.async_sinks.push(sink.clone());
                sink
            }
            other => {
                let factory =
                    crate::config::factory_for(other).ok_or_else(|| {
                        ConfigError::UnknownStreamType {
                            stream: name.to_string(),
                            kind: other.to_string(),
                        }
                    })?;
                factory.build(name, stream)?
            }
        };
        self.all.push(sink.clone());
        Ok(sink)
    }

    fn build_children(
        &mut self,
        parent: &str,
        dispatch: &[DispatchRef],
    ) -> Result<Vec<Arc<dyn Sink>>, ConfigError> {
        let mut children = Vec::with_capacity(dispatch.len());
        for (index, entry) in dispatch.iter().enumerate() {
            match entry {
                DispatchRef::Named(target) => children.push(self.named_sink(target)?),
                DispatchRef::Inline(inline) => {
                    let child_name = format!("{}#{}", parent, index);
                    children.push(self.build_stream(&child_name, inline)?);
                }
            }
        }
        Ok(children)
    }
}

/// Programmatic alternative to `Runtime::init` for hosts that assemble
/// sinks in code (tests, embedders, custom sinks).
pub struct RuntimeBuilder {
    root_threshold: Severity,
    sinks: Vec<Arc<dyn Sink>>,
    async_sinks: Vec<Arc<AsyncSink>>,
    assignments: Vec<(String, Option<Severity>, Vec<Arc<dyn Sink>>)>,
}

impl RuntimeBuilder {
    pub fn root_threshold(mut self, threshold: Severity) -> Self {
        self.root_threshold = threshold;
        self
    }

    /// Register a sink for lifecycle management (flush and close).
    pub fn sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Register an async sink; it is joined and drained at shutdown
    /// before any sink closes.
    pub fn async_sink(mut self, sink: Arc<AsyncSink>) -> Self {
        self.sinks.push(sink.clone());
        self.async_sinks.push(sink);
        self
    }

    /// Assign a threshold and sink list to a logger. Unlisted loggers
    /// inherit both from their nearest configured ancestor.
    pub fn logger(
        mut self,
        name: &str,
        threshold: Option<Severity>,
        sinks: Vec<Arc<dyn Sink>>,
    ) -> Self {
        for sink in &sinks {
            if !self.sinks.iter().any(|known| Arc::ptr_eq(known, sink)) {
                self.sinks.push(sink.clone());
            }
        }
        self.assignments.push((name.to_string(), threshold, sinks));
        self
    }

    pub fn build(self) -> Result<Runtime, ConfigError> {
        if ACTIVE.swap(true, Ordering::SeqCst) {
            return Err(ConfigError::AlreadyInitialized);
        }
        typereg::seal();
        let assignments = self
            .assignments
            .into_iter()
            .map(|(name, threshold, sinks)| LoggerAssignment {
                threshold: if name.is_empty() { None } else { threshold },
                sinks: if sinks.is_empty() {
                    None
                } else {
                    Some(Arc::new(sinks))
                },
                name,
            })
            .collect();
        registry::global().apply_configuration(self.root_threshold, assignments);
        Ok(Runtime {
            sinks: self.sinks,
            async_sinks: self.async_sinks,
            shut_down: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::TextSink;
    use std::sync::Mutex;

    // One runtime at a time; unit tests in this module share the
    // process-wide registry.
    static SERIAL: Mutex<()> = Mutex::new(());

    #[test]
    fn test_builder_runtime_lifecycle() {
        let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
        let (sink, handle) = TextSink::builder("mem")
            .format("{severity} {msg}")
            .memory()
            .unwrap();
        let runtime = Runtime::builder()
            .root_threshold(Severity::INFO)
            .logger("", None, vec![sink])
            .build()
            .unwrap();

        let app = logger("app");
        crate::log_warning!(app, "w=", 1);
        crate::log_debug!(app, "d=", 2); // below INFO, discarded

        let report = runtime.shutdown();
        assert_eq!(report, ShutdownReport::default());
        assert_eq!(handle.lines(), vec!["WARNING w=1"]);
        assert_eq!(handle.close_count(), 1);
    }

    #[test]
    fn test_double_init_fails() {
        let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
        let runtime = Runtime::builder().build().unwrap();
        assert!(matches!(
            Runtime::builder().build(),
            Err(ConfigError::AlreadyInitialized)
        ));
        drop(runtime);
        // Shutdown releases the slot.
        let runtime = Runtime::builder().build().unwrap();
        drop(runtime);
    }

    #[test]
    fn test_config_runtime_with_factory_sink() {
        let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());

        // Factories normally build sockets or syslog connections; a
        // memory sink keeps the test hermetic.
        let shared: Arc<Mutex<Option<crate::sink::MemoryHandle>>> =
            Arc::new(Mutex::new(None));
        struct CapturingFactory(Arc<Mutex<Option<crate::sink::MemoryHandle>>>);
        impl crate::config::SinkFactory for CapturingFactory {
            fn build(
                &self,
                name: &str,
                config: &StreamConfig,
            ) -> Result<Arc<dyn Sink>, ConfigError> {
                let mut builder = TextSink::builder(name);
                if let Some(format) = &config.format {
                    builder = builder.format(format);
                }
                let (sink, handle) = builder.memory()?;
                *self.0.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
                Ok(sink)
            }
        }
        crate::config::register_sink_factory(
            "capture",
            Arc::new(CapturingFactory(shared.clone())),
        );

        let config = Config::parse(
            r#"{
                loggers: { "": { threshold: "INFO", stream: "out" } },
                streams: { out: { type: "capture", format: "{severity} {msg}" } },
            }"#,
        )
        .unwrap();
        let runtime = Runtime::init(config).unwrap();

        let root = logger("");
        crate::log_error!(root, "boom ", 7);
        runtime.shutdown();

        let handle = shared
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap();
        assert_eq!(handle.lines(), vec!["ERROR boom 7"]);
    }

    #[test]
    fn test_reload_swaps_sink_graph() {
        let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
        let (first, first_handle) = TextSink::builder("first").format("{msg}").memory().unwrap();
        let mut runtime = Runtime::builder()
            .root_threshold(Severity::TRACE)
            .logger("", None, vec![first])
            .build()
            .unwrap();

        let root = logger("");
        crate::log_info!(root, "before");
        assert_eq!(first_handle.lines(), vec!["before"]);

        // Reload onto a file-less config; the old sink is closed.
        runtime
            .reload_config(r#"{ loggers: { "": { threshold: "ERROR" } } }"#)
            .unwrap();
        assert_eq!(first_handle.close_count(), 1);
        crate::log_info!(root, "after");
        assert_eq!(first_handle.lines(), vec!["before"]);

        // A bad reload leaves the current graph in place.
        assert!(runtime.reload_config("{ streams: ").is_err());
        runtime.shutdown();
    }

    #[test]
    fn test_set_threshold_is_immediate() {
        let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
        let (sink, handle) = TextSink::builder("mem").format("{msg}").memory().unwrap();
        let runtime = Runtime::builder()
            .root_threshold(Severity::WARNING)
            .logger("", None, vec![sink])
            .build()
            .unwrap();

        let svc = logger("svc.threshold");
        crate::log_info!(svc, "quiet");
        assert!(handle.is_empty());

        runtime.set_threshold("svc.threshold", Severity::TRACE);
        crate::log_info!(svc, "loud");
        assert_eq!(handle.lines(), vec!["loud"]);

        let listed = runtime.list_loggers();
        assert!(listed
            .iter()
            .any(|(name, sev)| name == "svc.threshold" && *sev == Severity::TRACE));
        runtime.shutdown();
    }
}
