// SPDX-License-Identifier: Apache-2.0 OR MIT
// Logger handles and registry nodes

use crate::record::{Record, SourceLocation};
use crate::severity::Severity;
use crate::sink::Sink;
use std::sync::atomic::{AtomicI16, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

/// Ordered sink list shared between a node and in-flight emissions.
pub(crate) type SinkList = Arc<Vec<Arc<dyn Sink>>>;

/// One node in the logger hierarchy.
///
/// Nodes are shared between the registry and every handle cloned from
/// it. The effective threshold is a plain atomic so control-plane
/// changes are visible to emitters immediately, without the emitters
/// ever touching the registry lock.
pub(crate) struct LoggerNode {
    name: String,
    id: u64,
    /// Explicit threshold rank, or -1 to inherit from the parent.
    explicit: AtomicI16,
    /// Cached effective threshold rank, maintained by the registry.
    effective: AtomicU8,
    /// Effective sink list, resolved through inheritance by the registry.
    sinks: RwLock<SinkList>,
}

impl LoggerNode {
    pub(crate) fn new(name: String, id: u64, effective: Severity) -> Self {
        Self {
            name,
            id,
            explicit: AtomicI16::new(-1),
            effective: AtomicU8::new(effective.rank()),
            sinks: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub(crate) fn effective(&self) -> u8 {
        self.effective.load(Ordering::Relaxed)
    }

    pub(crate) fn set_effective(&self, severity: Severity) {
        self.effective.store(severity.rank(), Ordering::Relaxed);
    }

    pub(crate) fn explicit(&self) -> Option<Severity> {
        let rank = self.explicit.load(Ordering::Relaxed);
        u8::try_from(rank).ok().map(Severity::from_rank)
    }

    pub(crate) fn set_explicit(&self, severity: Option<Severity>) {
        let rank = severity.map(|s| s.rank() as i16).unwrap_or(-1);
        self.explicit.store(rank, Ordering::Relaxed);
    }

    pub(crate) fn sinks(&self) -> SinkList {
        self.sinks.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn set_sinks(&self, sinks: SinkList) {
        *self.sinks.write().unwrap_or_else(|e| e.into_inner()) = sinks;
    }
}

/// A cheap cloneable handle to a named logger.
///
/// The disabled handle stands in for a missing logger: every emission
/// through it is dropped by the first branch of the gate.
#[derive(Clone)]
pub struct Logger {
    node: Option<Arc<LoggerNode>>,
}

impl Logger {
    /// The handle whose emissions are always discarded.
    pub fn disabled() -> Logger {
        Logger { node: None }
    }

    pub(crate) fn from_node(node: Arc<LoggerNode>) -> Logger {
        Logger { node: Some(node) }
    }

    /// Name of the logger, empty for the root and for disabled handles.
    pub fn name(&self) -> &str {
        self.node.as_deref().map(LoggerNode::name).unwrap_or("")
    }

    /// Whether a record at `severity` would pass the gate right now.
    #[inline]
    pub fn enabled_for(&self, severity: Severity) -> bool {
        match &self.node {
            Some(node) => severity.rank() >= node.effective(),
            None => false,
        }
    }

    /// The emission gate. Returns the empty record unless `severity`
    /// clears the effective threshold; all capture work happens on the
    /// accept path, which stays out of line.
    #[inline(always)]
    pub fn open(&self, severity: Severity, location: SourceLocation) -> Record<'_> {
        match &self.node {
            Some(node) if severity.rank() >= node.effective() => {
                Record::open(node, severity, location)
            }
            _ => Record::disabled(),
        }
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.node {
            Some(node) => write!(f, "Logger({:?})", node.name()),
            None => f.write_str("Logger(disabled)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source_location;

    fn node(threshold: Severity) -> Arc<LoggerNode> {
        Arc::new(LoggerNode::new("test".to_string(), 1, threshold))
    }

    #[test]
    fn test_disabled_handle_rejects_everything() {
        let logger = Logger::disabled();
        assert!(!logger.enabled_for(Severity::CRITICAL));
        let record = logger.open(Severity::CRITICAL, source_location!());
        assert!(!record.is_enabled());
    }

    #[test]
    fn test_gate_by_threshold() {
        let logger = Logger::from_node(node(Severity::INFO));
        assert!(!logger.enabled_for(Severity::DEBUG));
        assert!(logger.enabled_for(Severity::INFO));
        assert!(logger.enabled_for(Severity::ERROR));

        let rejected = logger.open(Severity::DEBUG, source_location!());
        assert!(!rejected.is_enabled());
        let accepted = logger.open(Severity::ERROR, source_location!());
        assert!(accepted.is_enabled());
    }

    #[test]
    fn test_threshold_change_takes_effect_immediately() {
        let node = node(Severity::WARNING);
        let logger = Logger::from_node(node.clone());
        assert!(!logger.enabled_for(Severity::INFO));
        node.set_effective(Severity::TRACE);
        assert!(logger.enabled_for(Severity::INFO));
    }
}
