// SPDX-License-Identifier: Apache-2.0 OR MIT
// Output sinks
//
// A sink is the polymorphic output endpoint. It exposes two write
// operations: one for a live record on the emitting thread (sync path)
// and one for a decoded frame view handed over by a worker (async
// path). Write errors never reach the emitter; they are coalesced onto
// the process-wide fallback writer.

use crate::config::ConfigError;
use crate::decorator::{Composed, FormatTemplate, DEFAULT_FORMAT};
use crate::encode::FrameView;
use crate::filter::CompiledFilter;
use crate::record::Record;
use crate::registry;
use crate::severity::Severity;
use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// The cheap pre-filter view of a record, used before any capture or
/// formatting work.
pub struct RecordMeta<'a> {
    pub severity: Severity,
    pub logger: &'a str,
}

/// The polymorphic output endpoint.
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    /// Cheap pre-filter (severity floor, logger name). Never the full
    /// filter predicate.
    fn maybe_accepts(&self, _meta: &RecordMeta) -> bool {
        true
    }

    /// Sync path: write a live record on the emitting thread.
    fn write_record(&self, record: &Record);

    /// Async path: write a decoded frame handed over by a worker.
    fn write_frame(&self, frame: &FrameView);

    fn flush(&self);

    /// Invoked exactly once per sink by the coordinator. Containers do
    /// not cascade close onto shared children; the coordinator owns
    /// every sink it built.
    fn close(&self);
}

// ---------------------------------------------------------------------
// Fallback diagnostics
// ---------------------------------------------------------------------

static FALLBACK: Mutex<Option<Box<dyn Write + Send>>> = Mutex::new(None);

/// Redirect the library's own diagnostics (sink write errors, shutdown
/// losses). Default is process stderr.
pub fn set_fallback_writer(writer: Box<dyn Write + Send>) {
    *FALLBACK.lock().unwrap_or_else(|e| e.into_inner()) = Some(writer);
}

pub(crate) fn fallback_report(line: &str) {
    let mut guard = FALLBACK.lock().unwrap_or_else(|e| e.into_inner());
    match guard.as_mut() {
        Some(writer) => {
            let _ = writeln!(writer, "{}", line);
            let _ = writer.flush();
        }
        None => {
            let _ = writeln!(io::stderr(), "{}", line);
        }
    }
}

/// Per-sink write-error counter with a once-per-second coalesced
/// diagnostic on the fallback writer.
pub(crate) struct ErrorReporter {
    sink: String,
    failures: AtomicU64,
    reported: AtomicU64,
    /// Monotonic ms of the last report, plus one (zero means never).
    window: AtomicU64,
}

impl ErrorReporter {
    pub(crate) fn new(sink: &str) -> Self {
        Self {
            sink: sink.to_string(),
            failures: AtomicU64::new(0),
            reported: AtomicU64::new(0),
            window: AtomicU64::new(0),
        }
    }

    fn record_failure(&self, error: &io::Error) {
        let total = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        let now_ms = crate::scope::monotonic_nanos() / 1_000_000;
        let window = self.window.load(Ordering::Relaxed);
        if window != 0 && now_ms + 1 < window + 1000 {
            return;
        }
        if self
            .window
            .compare_exchange(window, now_ms + 1, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let reported_before = self.reported.swap(total, Ordering::Relaxed);
        let suppressed = total.saturating_sub(reported_before).saturating_sub(1);
        let mut line = format!("logfan: sink '{}' write error: {}", self.sink, error);
        if suppressed > 0 {
            let _ = write!(line, " ({} earlier errors coalesced)", suppressed);
        }
        fallback_report(&line);
    }
}

// ---------------------------------------------------------------------
// Text targets
// ---------------------------------------------------------------------

/// Where a `TextSink` puts its formatted lines.
pub trait TextTarget: Send {
    fn write_line(&mut self, line: &str) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
    fn close(&mut self) -> io::Result<()> {
        self.flush()
    }
}

struct StderrTarget;

impl TextTarget for StderrTarget {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let stderr = io::stderr();
        let mut guard = stderr.lock();
        guard.write_all(line.as_bytes())?;
        guard.write_all(b"\n")
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}

struct StdoutTarget;

impl TextTarget for StdoutTarget {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let stdout = io::stdout();
        let mut guard = stdout.lock();
        guard.write_all(line.as_bytes())?;
        guard.write_all(b"\n")
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()
    }
}

/// Observer handle for the in-memory capture target (the stub sink the
/// test suites assert against).
#[derive(Clone, Default)]
pub struct MemoryHandle {
    lines: Arc<Mutex<Vec<String>>>,
    closes: Arc<AtomicU32>,
}

impl MemoryHandle {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// How many times the owning sink's close() ran.
    pub fn close_count(&self) -> u32 {
        self.closes.load(Ordering::Relaxed)
    }
}

struct MemoryTarget {
    handle: MemoryHandle,
}

impl TextTarget for MemoryTarget {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.handle
            .lines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(line.to_string());
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.handle.closes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Expand a filename template: `$D` date, `$T` time, `$$` process id,
/// `$N` unique sequence, `${VAR}` environment variable. Runs at open
/// time, not at configuration time.
pub(crate) fn expand_path(spec: &str) -> PathBuf {
    static SEQUENCE: AtomicU32 = AtomicU32::new(0);
    let now = chrono::Local::now();
    let mut out = String::with_capacity(spec.len());
    let mut chars = spec.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('D') => {
                let _ = write!(out, "{}", now.format("%Y-%m-%d"));
            }
            Some('T') => {
                let _ = write!(out, "{}", now.format("%H%M%S"));
            }
            Some('$') => {
                let _ = write!(out, "{}", std::process::id());
            }
            Some('N') => {
                let _ = write!(out, "{}", SEQUENCE.fetch_add(1, Ordering::Relaxed));
            }
            Some('{') => {
                let mut name = String::new();
                for c in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    name.push(c);
                }
                if let Ok(value) = std::env::var(&name) {
                    out.push_str(&value);
                }
            }
            Some(other) => {
                out.push('$');
                out.push(other);
            }
            None => out.push('$'),
        }
    }
    PathBuf::from(out)
}

/// Lazily opened file target. The path template expands and the file is
/// created when the first record is written, not at configuration time.
struct FileTarget {
    spec: String,
    create_dirs: bool,
    /// Buffer capacity; zero flushes after every line.
    buffering: usize,
    file: Option<BufWriter<std::fs::File>>,
}

impl FileTarget {
    fn writer(&mut self) -> io::Result<&mut BufWriter<std::fs::File>> {
        if self.file.is_none() {
            let path = expand_path(&self.spec);
            if self.create_dirs {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            let capacity = self.buffering.max(1);
            self.file = Some(BufWriter::with_capacity(capacity, file));
        }
        match self.file.as_mut() {
            Some(writer) => Ok(writer),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "log file not open")),
        }
    }
}

impl TextTarget for FileTarget {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let line_buffered = self.buffering == 0;
        let writer = self.writer()?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        if line_buffered {
            writer.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        if let Some(mut writer) = self.file.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
// TextSink
// ---------------------------------------------------------------------

/// A formatting sink: per-sink filter, `{name}` template, and a locked
/// target whose critical section covers only the line write.
pub struct TextSink {
    name: String,
    template: FormatTemplate,
    filter: Option<CompiledFilter>,
    floor: Option<Severity>,
    target: Mutex<Box<dyn TextTarget>>,
    errors: ErrorReporter,
    closed: AtomicBool,
}

impl TextSink {
    pub fn builder(name: &str) -> TextSinkBuilder {
        TextSinkBuilder {
            name: name.to_string(),
            format: DEFAULT_FORMAT.to_string(),
            filter: None,
            floor: None,
        }
    }

    fn write_composed(&self, composed: &Composed) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        if let Some(filter) = &self.filter {
            if !filter.accepts(composed) {
                return;
            }
        }
        let mut line = String::new();
        self.template.render(composed, &mut line);
        // Format happens outside the lock; the critical section is the
        // write itself.
        let result = {
            let mut target = self.target.lock().unwrap_or_else(|e| e.into_inner());
            target.write_line(&line)
        };
        if let Err(error) = result {
            self.errors.record_failure(&error);
        }
    }
}

impl Sink for TextSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn maybe_accepts(&self, meta: &RecordMeta) -> bool {
        match self.floor {
            Some(floor) => meta.severity >= floor,
            None => true,
        }
    }

    fn write_record(&self, record: &Record) {
        let composed = Composed::from_record(record);
        self.write_composed(&composed);
    }

    fn write_frame(&self, frame: &FrameView) {
        let node = registry::global().node_by_id(frame.logger_id());
        let name = match &node {
            Some(node) => node.name(),
            None => "",
        };
        let composed = Composed::from_frame(frame, name);
        self.write_composed(&composed);
    }

    fn flush(&self) {
        let result = {
            let mut target = self.target.lock().unwrap_or_else(|e| e.into_inner());
            target.flush()
        };
        if let Err(error) = result {
            self.errors.record_failure(&error);
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let result = {
            let mut target = self.target.lock().unwrap_or_else(|e| e.into_inner());
            target.close()
        };
        if let Err(error) = result {
            self.errors.record_failure(&error);
        }
    }
}

pub struct TextSinkBuilder {
    name: String,
    format: String,
    filter: Option<String>,
    floor: Option<Severity>,
}

impl TextSinkBuilder {
    pub fn format(mut self, template: &str) -> Self {
        self.format = template.to_string();
        self
    }

    pub fn filter(mut self, expression: &str) -> Self {
        self.filter = Some(expression.to_string());
        self
    }

    /// Severity floor applied by `maybe_accepts`, ahead of the filter.
    pub fn severity_floor(mut self, floor: Severity) -> Self {
        self.floor = Some(floor);
        self
    }

    pub fn target(self, target: Box<dyn TextTarget>) -> Result<Arc<TextSink>, ConfigError> {
        let template = FormatTemplate::compile(&self.format).map_err(|source| {
            ConfigError::Placeholder {
                stream: self.name.clone(),
                source,
            }
        })?;
        let filter = self
            .filter
            .as_deref()
            .map(CompiledFilter::compile)
            .transpose()
            .map_err(|source| ConfigError::Filter {
                stream: self.name.clone(),
                source,
            })?;
        Ok(Arc::new(TextSink {
            errors: ErrorReporter::new(&self.name),
            name: self.name,
            template,
            filter,
            floor: self.floor,
            target: Mutex::new(target),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn stderr(self) -> Result<Arc<TextSink>, ConfigError> {
        self.target(Box::new(StderrTarget))
    }

    pub fn stdout(self) -> Result<Arc<TextSink>, ConfigError> {
        self.target(Box::new(StdoutTarget))
    }

    /// The in-memory capture sink used as a test stub.
    pub fn memory(self) -> Result<(Arc<TextSink>, MemoryHandle), ConfigError> {
        let handle = MemoryHandle::default();
        let sink = self.target(Box::new(MemoryTarget {
            handle: handle.clone(),
        }))?;
        Ok((sink, handle))
    }

    pub fn file(
        self,
        spec: &str,
        create_dirs: bool,
        buffering: usize,
    ) -> Result<Arc<TextSink>, ConfigError> {
        self.target(Box::new(FileTarget {
            spec: spec.to_string(),
            create_dirs,
            buffering,
            file: None,
        }))
    }
}

// ---------------------------------------------------------------------
// DispatcherSink
// ---------------------------------------------------------------------

/// Ordered fan-out over child sinks.
pub struct DispatcherSink {
    name: String,
    children: Vec<Arc<dyn Sink>>,
}

impl DispatcherSink {
    pub fn new(name: &str, children: Vec<Arc<dyn Sink>>) -> Arc<DispatcherSink> {
        Arc::new(DispatcherSink {
            name: name.to_string(),
            children,
        })
    }
}

impl Sink for DispatcherSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn maybe_accepts(&self, meta: &RecordMeta) -> bool {
        self.children.iter().any(|child| child.maybe_accepts(meta))
    }

    fn write_record(&self, record: &Record) {
        let meta = RecordMeta {
            severity: record.severity(),
            logger: record.logger_name(),
        };
        for child in &self.children {
            if child.maybe_accepts(&meta) {
                child.write_record(record);
            }
        }
    }

    fn write_frame(&self, frame: &FrameView) {
        let node = registry::global().node_by_id(frame.logger_id());
        let meta = RecordMeta {
            severity: frame.severity(),
            logger: node.as_ref().map(|n| n.name()).unwrap_or(""),
        };
        for child in &self.children {
            if child.maybe_accepts(&meta) {
                child.write_frame(frame);
            }
        }
    }

    fn flush(&self) {
        for child in &self.children {
            child.flush();
        }
    }

    fn close(&self) {
        // Children are closed by the coordinator; nothing owned here.
    }
}
