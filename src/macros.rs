// SPDX-License-Identifier: Apache-2.0 OR MIT
// Emission macros
//
// Each macro captures the source location, opens the record through
// the inline gate, chains one extend per argument, and emits. For a
// rejected severity the whole expansion is the gate branch plus
// absorbing extends.

/// Capture the current source location.
#[macro_export]
macro_rules! source_location {
    () => {
        $crate::SourceLocation {
            file: file!(),
            line: line!(),
            entity: module_path!(),
        }
    };
}

/// Emit a record at an explicit severity.
///
/// The first component should be the message string; further arguments
/// become typed components via `Component::from`.
///
/// # Examples
/// ```ignore
/// log_event!(logger, Severity::NOTICE, "reloaded, generation=", generation);
/// ```
#[macro_export]
macro_rules! log_event {
    ($logger:expr, $severity:expr $(, $component:expr)+ $(,)?) => {{
        let __logger = &$logger;
        let __record = __logger.open($severity, $crate::source_location!());
        $(let __record = __record.extend($crate::Component::from($component));)+
        __record.emit();
    }};
}

/// Emit at TRACE severity.
#[macro_export]
macro_rules! log_trace {
    ($logger:expr $(, $component:expr)+ $(,)?) => {
        $crate::log_event!($logger, $crate::Severity::TRACE $(, $component)+)
    };
}

/// Emit at DEBUG severity.
#[macro_export]
macro_rules! log_debug {
    ($logger:expr $(, $component:expr)+ $(,)?) => {
        $crate::log_event!($logger, $crate::Severity::DEBUG $(, $component)+)
    };
}

/// Emit at INFO severity.
#[macro_export]
macro_rules! log_info {
    ($logger:expr $(, $component:expr)+ $(,)?) => {
        $crate::log_event!($logger, $crate::Severity::INFO $(, $component)+)
    };
}

/// Emit at NOTICE severity.
#[macro_export]
macro_rules! log_notice {
    ($logger:expr $(, $component:expr)+ $(,)?) => {
        $crate::log_event!($logger, $crate::Severity::NOTICE $(, $component)+)
    };
}

/// Emit at WARNING severity.
#[macro_export]
macro_rules! log_warning {
    ($logger:expr $(, $component:expr)+ $(,)?) => {
        $crate::log_event!($logger, $crate::Severity::WARNING $(, $component)+)
    };
}

/// Emit at ERROR severity.
#[macro_export]
macro_rules! log_error {
    ($logger:expr $(, $component:expr)+ $(,)?) => {
        $crate::log_event!($logger, $crate::Severity::ERROR $(, $component)+)
    };
}

/// Emit at CRITICAL severity.
#[macro_export]
macro_rules! log_critical {
    ($logger:expr $(, $component:expr)+ $(,)?) => {
        $crate::log_event!($logger, $crate::Severity::CRITICAL $(, $component)+)
    };
}

#[cfg(test)]
mod tests {
    use crate::logger::{Logger, LoggerNode};
    use crate::severity::Severity;
    use crate::sink::TextSink;
    use std::sync::Arc;

    fn wired_logger(threshold: Severity) -> (Logger, crate::sink::MemoryHandle) {
        let (sink, handle) = TextSink::builder("mem")
            .format("{severity} {msg}")
            .memory()
            .unwrap();
        let node = Arc::new(LoggerNode::new("macros".to_string(), 31, threshold));
        node.set_sinks(Arc::new(vec![sink as Arc<dyn crate::sink::Sink>]));
        (Logger::from_node(node), handle)
    }

    #[test]
    fn test_severity_macros_route_through_gate() {
        let (logger, handle) = wired_logger(Severity::INFO);

        log_debug!(logger, "invisible");
        assert!(handle.is_empty());

        log_info!(logger, "count=", 3);
        log_error!(logger, "oops");
        assert_eq!(handle.lines(), vec!["INFO count=3", "ERROR oops"]);
    }

    #[test]
    fn test_log_event_mixed_components() {
        let (logger, handle) = wired_logger(Severity::TRACE);
        let ratio = 0.5f64;
        log_event!(
            logger,
            Severity::NOTICE,
            "ratio=",
            ratio,
            " ok=",
            true,
        );
        assert_eq!(handle.lines(), vec!["NOTICE ratio=0.5 ok=true"]);
    }

    #[test]
    fn test_disabled_logger_is_silent() {
        let logger = Logger::disabled();
        log_critical!(logger, "nobody hears ", 1);
    }
}
