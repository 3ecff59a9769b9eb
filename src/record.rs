// SPDX-License-Identifier: Apache-2.0 OR MIT
// Fixed-capacity record builder with an absorbing empty state

use crate::component::Component;
use crate::logger::LoggerNode;
use crate::severity::Severity;
use crate::sink::RecordMeta;

/// Maximum number of components a record can carry.
pub const MAX_COMPONENTS: usize = 15;

/// Marker stored in the last slot when a record saturates.
pub(crate) const SATURATION_MARKER: &str = "...";

/// Source location captured at the emission site.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: &'static str,
    pub line: u32,
    pub entity: &'static str,
}

pub(crate) struct RecordInner<'a> {
    logger: &'a LoggerNode,
    severity: Severity,
    location: SourceLocation,
    timestamp_ns: u64,
    task_id: u32,
    scope: Option<(u16, u64)>,
    len: u8,
    saturated: bool,
    components: [Component<'a>; MAX_COMPONENTS],
}

/// One log event under construction.
///
/// A record is either empty (the logger was disabled or the severity
/// was below threshold) or live. The empty state is absorbing: every
/// `extend` on it returns immediately, which keeps the discard path to
/// a single predictable branch per component. Neither state touches the
/// heap.
pub struct Record<'a> {
    inner: Option<RecordInner<'a>>,
}

impl<'a> Record<'a> {
    /// The empty record. Extending it is a no-op.
    #[inline(always)]
    pub(crate) fn disabled() -> Record<'a> {
        Record { inner: None }
    }

    /// Open a live record. Only reached on the accept path; kept out of
    /// line so the gate itself stays small enough to inline everywhere.
    #[cold]
    pub(crate) fn open(
        logger: &'a LoggerNode,
        severity: Severity,
        location: SourceLocation,
    ) -> Record<'a> {
        Record {
            inner: Some(RecordInner {
                logger,
                severity,
                location,
                timestamp_ns: crate::scope::epoch_nanos(),
                task_id: crate::scope::task_id(),
                scope: crate::scope::scope_snapshot(),
                len: 0,
                saturated: false,
                components: [Component::Empty; MAX_COMPONENTS],
            }),
        }
    }

    /// Append one component.
    ///
    /// Empty records absorb the call. A live record accepts components
    /// until one slot remains; the last slot is then spent on the
    /// `"..."` marker and every further call is a no-op.
    #[inline(always)]
    pub fn extend(mut self, component: Component<'a>) -> Record<'a> {
        if let Some(inner) = self.inner.as_mut() {
            inner.push(component);
        }
        self
    }

    /// Dispatch the record to the owning logger's sinks. Empty records
    /// vanish here without any sink observing them.
    pub fn emit(&self) {
        let Some(inner) = &self.inner else { return };
        let sinks = inner.logger.sinks();
        let meta = RecordMeta {
            severity: inner.severity,
            logger: inner.logger.name(),
        };
        for sink in sinks.iter() {
            if sink.maybe_accepts(&meta) {
                sink.write_record(self);
            }
        }
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Components captured so far; empty for the empty record.
    pub fn components(&self) -> &[Component<'a>] {
        match &self.inner {
            Some(inner) => &inner.components[..inner.len as usize],
            None => &[],
        }
    }

    pub fn severity(&self) -> Severity {
        self.inner
            .as_ref()
            .map(|i| i.severity)
            .unwrap_or(Severity::TRACE)
    }

    pub fn location(&self) -> SourceLocation {
        self.inner.as_ref().map(|i| i.location).unwrap_or(SourceLocation {
            file: "",
            line: 0,
            entity: "",
        })
    }

    /// Nanoseconds since the Unix epoch, captured when the record was opened.
    pub fn timestamp_ns(&self) -> u64 {
        self.inner.as_ref().map(|i| i.timestamp_ns).unwrap_or(0)
    }

    pub fn task_id(&self) -> u32 {
        self.inner.as_ref().map(|i| i.task_id).unwrap_or(0)
    }

    /// (depth, elapsed ns) of the innermost scope at emission, if any.
    pub fn scope(&self) -> Option<(u16, u64)> {
        self.inner.as_ref().and_then(|i| i.scope)
    }

    pub fn logger_name(&self) -> &str {
        self.inner.as_ref().map(|i| i.logger.name()).unwrap_or("")
    }

    pub fn logger_id(&self) -> u64 {
        self.inner.as_ref().map(|i| i.logger.id()).unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn saturated(&self) -> bool {
        self.inner.as_ref().map(|i| i.saturated).unwrap_or(false)
    }
}

impl<'a> RecordInner<'a> {
    #[inline]
    fn push(&mut self, component: Component<'a>) {
        let len = self.len as usize;
        if len < MAX_COMPONENTS - 1 {
            self.components[len] = component;
            self.len += 1;
        } else if len == MAX_COMPONENTS - 1 && !self.saturated {
            self.components[len] = Component::Str(SATURATION_MARKER);
            self.len += 1;
            self.saturated = true;
        }
        // Saturated: silently dropped.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::LoggerNode;
    use std::sync::Arc;

    fn test_node() -> Arc<LoggerNode> {
        Arc::new(LoggerNode::new("rec".to_string(), 9, Severity::TRACE))
    }

    fn location() -> SourceLocation {
        SourceLocation {
            file: file!(),
            line: line!(),
            entity: module_path!(),
        }
    }

    #[test]
    fn test_empty_record_is_absorbing() {
        let record = Record::disabled();
        let record = record.extend(Component::Str("x"));
        let record = record.extend(Component::I64(1));
        assert!(!record.is_enabled());
        assert!(record.components().is_empty());
        // Emitting the empty record is a no-op.
        record.emit();
    }

    #[test]
    fn test_extend_appends_in_order() {
        let node = test_node();
        let record = Record::open(&node, Severity::INFO, location())
            .extend(Component::Str("n="))
            .extend(Component::I64(7));
        assert_eq!(
            record.components(),
            &[Component::Str("n="), Component::I64(7)]
        );
        assert_eq!(record.severity(), Severity::INFO);
        assert!(record.timestamp_ns() > 0);
    }

    #[test]
    fn test_saturation_replaces_last_slot() {
        let node = test_node();
        let mut record = Record::open(&node, Severity::INFO, location());
        for i in 0..(MAX_COMPONENTS as i64 + 5) {
            record = record.extend(Component::I64(i));
        }
        let components = record.components();
        assert_eq!(components.len(), MAX_COMPONENTS);
        assert_eq!(components[MAX_COMPONENTS - 1], Component::Str(SATURATION_MARKER));
        // The first MAX_COMPONENTS - 1 survive untouched.
        assert_eq!(components[MAX_COMPONENTS - 2], Component::I64(MAX_COMPONENTS as i64 - 2));
        assert!(record.saturated());
    }

    #[test]
    fn test_exactly_max_minus_one_does_not_saturate() {
        let node = test_node();
        let mut record = Record::open(&node, Severity::INFO, location());
        for i in 0..(MAX_COMPONENTS as i64 - 1) {
            record = record.extend(Component::I64(i));
        }
        assert_eq!(record.components().len(), MAX_COMPONENTS - 1);
        assert!(!record.saturated());
    }
}
