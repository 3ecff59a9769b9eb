// SPDX-License-Identifier: Apache-2.0 OR MIT
// Decorators: named producers of synthesized output fields
//
// A sink's format string is a template of `{name}` substitutions, each
// resolved against the decorator registry at configuration load. The
// emission-time values (date_time, time, task_id, scope_indent,
// scope_elapsed) read fields captured in the record or frame; the
// write-time values (pid, logger, severity) are computed where the
// output happens.

use crate::component::Component;
use crate::encode::FrameView;
use crate::record::{Record, MAX_COMPONENTS};
use crate::severity::Severity;
use crate::typereg;
use chrono::{DateTime, Local};
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// A record or decoded frame, flattened for formatting and filtering.
pub struct Composed<'a> {
    pub severity: Severity,
    pub logger_name: &'a str,
    pub logger_id: u64,
    pub timestamp_ns: u64,
    pub task_id: Option<u32>,
    /// (depth, elapsed ns) of the innermost scope at emission.
    pub scope: Option<(u16, u64)>,
    /// Source file; on the frame path this already carries `:line`.
    pub loc_file: &'a str,
    pub loc_line: Option<u32>,
    pub loc_entity: &'a str,
    pub truncated: bool,
    components: [Component<'a>; MAX_COMPONENTS],
    len: usize,
}

impl<'a> Composed<'a> {
    pub fn components(&self) -> &[Component<'a>] {
        &self.components[..self.len]
    }

    /// Flatten a live record (the sync write path).
    pub fn from_record(record: &'a Record<'a>) -> Composed<'a> {
        let mut components = [Component::Empty; MAX_COMPONENTS];
        let source = record.components();
        components[..source.len()].copy_from_slice(source);
        let location = record.location();
        Composed {
            severity: record.severity(),
            logger_name: record.logger_name(),
            logger_id: record.logger_id(),
            timestamp_ns: record.timestamp_ns(),
            task_id: Some(record.task_id()),
            scope: record.scope(),
            loc_file: location.file,
            loc_line: Some(location.line),
            loc_entity: location.entity,
            truncated: false,
            components,
            len: source.len(),
        }
    }

    /// Flatten a decoded frame (the async write path). The logger name
    /// is resolved by the caller since frames carry only the id.
    pub fn from_frame(view: &FrameView<'a>, logger_name: &'a str) -> Composed<'a> {
        let mut components = [Component::Empty; MAX_COMPONENTS];
        let mut len = 0;
        for component in view.components().take(MAX_COMPONENTS) {
            components[len] = component;
            len += 1;
        }
        Composed {
            severity: view.severity(),
            logger_name,
            logger_id: view.logger_id(),
            timestamp_ns: view.timestamp_ns(),
            task_id: view.task_id(),
            scope: view.scope(),
            loc_file: view.loc_file(),
            loc_line: None,
            loc_entity: view.loc_entity(),
            truncated: view.truncated(),
            components,
            len,
        }
    }
}

/// A named producer of one output field.
pub trait Decorator: Send + Sync {
    fn name(&self) -> &'static str;
    fn emit(&self, view: &Composed, out: &mut String);
}

fn local_time(view: &Composed) -> DateTime<Local> {
    DateTime::from_timestamp_nanos(view.timestamp_ns as i64).with_timezone(&Local)
}

struct DateTimeDecorator;

impl Decorator for DateTimeDecorator {
    fn name(&self) -> &'static str {
        "date_time"
    }

    fn emit(&self, view: &Composed, out: &mut String) {
        let _ = write!(out, "{}", local_time(view).format("%Y-%m-%d %H:%M:%S%.3f"));
    }
}

struct TimeDecorator;

impl Decorator for TimeDecorator {
    fn name(&self) -> &'static str {
        "time"
    }

    fn emit(&self, view: &Composed, out: &mut String) {
        let _ = write!(out, "{}", local_time(view).format("%H:%M:%S%.6f"));
    }
}

struct LoggerDecorator;

impl Decorator for LoggerDecorator {
    fn name(&self) -> &'static str {
        "logger"
    }

    fn emit(&self, view: &Composed, out: &mut String) {
        if view.logger_id == 0 {
            out.push_str("logfan");
        } else if view.logger_name.is_empty() {
            out.push_str("root");
        } else {
            out.push_str(view.logger_name);
        }
    }
}

struct SeverityDecorator;

impl Decorator for SeverityDecorator {
    fn name(&self) -> &'static str {
        "severity"
    }

    fn emit(&self, view: &Composed, out: &mut String) {
        let _ = write!(out, "{}", view.severity);
    }
}

struct TaskIdDecorator;

impl Decorator for TaskIdDecorator {
    fn name(&self) -> &'static str {
        "task_id"
    }

    fn emit(&self, view: &Composed, out: &mut String) {
        if let Some(task_id) = view.task_id {
            let _ = write!(out, "{}", task_id);
        }
    }
}

struct PidDecorator;

impl Decorator for PidDecorator {
    fn name(&self) -> &'static str {
        "pid"
    }

    fn emit(&self, _view: &Composed, out: &mut String) {
        let _ = write!(out, "{}", std::process::id());
    }
}

struct SourceLocationDecorator;

impl Decorator for SourceLocationDecorator {
    fn name(&self) -> &'static str {
        "source_location"
    }

    fn emit(&self, view: &Composed, out: &mut String) {
        out.push_str(view.loc_file);
        if let Some(line) = view.loc_line {
            let _ = write!(out, ":{}", line);
        }
        if !view.loc_entity.is_empty() {
            let _ = write!(out, " ({})", view.loc_entity);
        }
    }
}

struct ScopeIndentDecorator;

impl Decorator for ScopeIndentDecorator {
    fn name(&self) -> &'static str {
        "scope_indent"
    }

    fn emit(&self, view: &Composed, out: &mut String) {
        if let Some((depth, _)) = view.scope {
            for _ in 0..depth {
                out.push_str("  ");
            }
        }
    }
}

struct ScopeElapsedDecorator;

impl Decorator for ScopeElapsedDecorator {
    fn name(&self) -> &'static str {
        "scope_elapsed"
    }

    fn emit(&self, view: &Composed, out: &mut String) {
        if let Some((_, elapsed_ns)) = view.scope {
            let _ = write!(out, "{:.3}ms", elapsed_ns as f64 / 1_000_000.0);
        }
    }
}

struct MsgDecorator;

impl Decorator for MsgDecorator {
    fn name(&self) -> &'static str {
        "msg"
    }

    fn emit(&self, view: &Composed, out: &mut String) {
        for component in view.components() {
            render_component(component, out);
        }
        if view.truncated {
            out.push_str("...");
        }
    }
}

const BYTES_RENDER_CAP: usize = 64;

fn render_component(component: &Component, out: &mut String) {
    match component {
        Component::Empty => {}
        Component::I64(v) => {
            let _ = write!(out, "{}", v);
        }
        Component::F64(v) => {
            let _ = write!(out, "{}", v);
        }
        Component::Bool(v) => {
            let _ = write!(out, "{}", v);
        }
        Component::Str(s) => out.push_str(s),
        Component::Bytes(bytes) => {
            out.push_str("0x");
            for byte in bytes.iter().take(BYTES_RENDER_CAP) {
                let _ = write!(out, "{:02x}", byte);
            }
            if bytes.len() > BYTES_RENDER_CAP {
                out.push_str("..");
            }
        }
        Component::Address(v) => {
            let _ = write!(out, "{:#x}", v);
        }
        Component::Instant(v) => {
            let _ = write!(out, "{}", v);
        }
        Component::User { type_id, bytes } => match typereg::lookup(*type_id) {
            Some(def) => out.push_str(&(def.decode)(bytes)),
            None => {
                let _ = write!(out, "<type {}:{} bytes>", type_id, bytes.len());
            }
        },
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecoratorError {
    #[error("unknown format placeholder '{{{0}}}'")]
    Unknown(String),

    #[error("decorator name '{0}' is already registered")]
    NameTaken(String),
}

static STANDARD: &[&(dyn Decorator)] = &[
    &DateTimeDecorator,
    &TimeDecorator,
    &LoggerDecorator,
    &SeverityDecorator,
    &TaskIdDecorator,
    &PidDecorator,
    &SourceLocationDecorator,
    &ScopeIndentDecorator,
    &ScopeElapsedDecorator,
    &MsgDecorator,
];

static CUSTOM: Mutex<Vec<Arc<dyn Decorator>>> = Mutex::new(Vec::new());

/// Register an application decorator. Standard names cannot be shadowed.
pub fn register_decorator(decorator: Arc<dyn Decorator>) -> Result<(), DecoratorError> {
    let mut custom = CUSTOM.lock().unwrap_or_else(|e| e.into_inner());
    let name = decorator.name();
    let taken = STANDARD.iter().any(|d| d.name() == name)
        || custom.iter().any(|d| d.name() == name);
    if taken {
        return Err(DecoratorError::NameTaken(name.to_string()));
    }
    custom.push(decorator);
    Ok(())
}

fn lookup(name: &str) -> Option<DecoratorRef> {
    if let Some(standard) = STANDARD.iter().find(|d| d.name() == name) {
        return Some(DecoratorRef::Standard(*standard));
    }
    let custom = CUSTOM.lock().unwrap_or_else(|e| e.into_inner());
    custom
        .iter()
        .find(|d| d.name() == name)
        .cloned()
        .map(DecoratorRef::Custom)
}

#[derive(Clone)]
enum DecoratorRef {
    Standard(&'static dyn Decorator),
    Custom(Arc<dyn Decorator>),
}

impl DecoratorRef {
    fn emit(&self, view: &Composed, out: &mut String) {
        match self {
            DecoratorRef::Standard(decorator) => decorator.emit(view, out),
            DecoratorRef::Custom(decorator) => decorator.emit(view, out),
        }
    }
}

enum Segment {
    Literal(String),
    Field(DecoratorRef),
}

/// A compiled `{name}` format template.
pub struct FormatTemplate {
    segments: Vec<Segment>,
}

pub(crate) const DEFAULT_FORMAT: &str = "{date_time} {severity} {logger} {msg}";

impl FormatTemplate {
    /// Compile a template, resolving each placeholder against the
    /// decorator registry. `{{` and `}}` escape the braces.
    pub fn compile(template: &str) -> Result<FormatTemplate, DecoratorError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) => name.push(c),
                            None => return Err(DecoratorError::Unknown(name)),
                        }
                    }
                    let decorator =
                        lookup(&name).ok_or_else(|| DecoratorError::Unknown(name.clone()))?;
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Field(decorator));
                }
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Ok(FormatTemplate { segments })
    }

    pub fn render(&self, view: &Composed, out: &mut String) {
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(decorator) => decorator.emit(view, out),
            }
        }
    }
}
