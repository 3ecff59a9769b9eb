// SPDX-License-Identifier: Apache-2.0 OR MIT
//! High-performance structured multi-sink logging.
//!
//! Records are built from typed components without formatting or heap
//! allocation on the emission path; a per-logger threshold gate
//! short-circuits rejected records before any capture work. Accepted
//! records go to synchronous sinks inline, or are encoded into
//! self-contained binary frames and handed to one worker thread per
//! asynchronous sink through a bounded lock-free MPSC queue. The
//! [`Runtime`] guard drains every queue before process exit.
//!
//! ```no_run
//! let console = logfan::TextSink::builder("console")
//!     .format("{date_time} {severity} {logger} {msg}")
//!     .stderr()
//!     .unwrap();
//! let runtime = logfan::Runtime::builder()
//!     .root_threshold(logfan::Severity::INFO)
//!     .logger("", None, vec![console])
//!     .build()
//!     .unwrap();
//!
//! let log = logfan::logger("app");
//! logfan::log_info!(log, "started, pid=", std::process::id());
//!
//! runtime.shutdown();
//! ```

mod component;
pub mod config;
mod decorator;
mod encode;
mod filter;
mod logger;
mod macros;
mod pool;
mod queue;
mod record;
mod registry;
mod runtime;
mod scope;
mod severity;
mod sink;
mod typereg;
mod worker;

pub use component::Component;
pub use config::{
    register_sink_factory, Config, ConfigError, DispatchRef, LoggerConfig, SinkFactory,
    StreamConfig, StreamRefs,
};
pub use decorator::{register_decorator, Composed, Decorator, DecoratorError, FormatTemplate};
pub use encode::{Frame, FrameView, DEFAULT_MAX_FRAME};
pub use filter::{register_filter_fn, CompiledFilter, FilterArg, FilterError, FilterFn};
pub use logger::Logger;
pub use queue::OverflowPolicy;
pub use record::{Record, SourceLocation, MAX_COMPONENTS};
pub use runtime::{logger, Runtime, RuntimeBuilder, ShutdownReport};
pub use scope::{enter_scope, Scope};
pub use severity::{Severity, SeverityError};
pub use sink::{
    set_fallback_writer, DispatcherSink, MemoryHandle, RecordMeta, Sink, TextSink,
    TextSinkBuilder, TextTarget,
};
pub use typereg::{register_type, TypeAttributes, TypeRegistryError, UserType};
pub use worker::{AsyncSink, AsyncSinkBuilder, DEFAULT_DRAIN_DEADLINE, DEFAULT_QUEUE_CAPACITY};
