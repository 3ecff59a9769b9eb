// SPDX-License-Identifier: Apache-2.0 OR MIT
// Asynchronous sink: MPSC queue plus one worker thread
//
// Emitters encode at the sink boundary and enqueue the owned frame;
// the worker is the queue's single consumer. It decodes, applies the
// per-sink filter, fans out to the child sinks, and returns the frame
// storage to the pool. Shutdown drains the queue under a per-sink
// deadline; whatever cannot be drained in time is counted and
// reported, never waited on forever.

use crate::config::ConfigError;
use crate::decorator::Composed;
use crate::encode::{self, Frame, FrameView, DEFAULT_MAX_FRAME};
use crate::filter::CompiledFilter;
use crate::queue::{Dequeue, FrameQueue, OverflowPolicy};
use crate::record::Record;
use crate::registry;
use crate::severity::Severity;
use crate::sink::{fallback_report, RecordMeta, Sink};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Worker wake interval; bounds how long shutdown goes unobserved.
const DEQUEUE_WAKE_INTERVAL: Duration = Duration::from_millis(100);

pub const DEFAULT_QUEUE_CAPACITY: usize = 65_536;
pub const DEFAULT_DRAIN_DEADLINE: Duration = Duration::from_secs(5);

struct WorkerShared {
    name: String,
    queue: Arc<FrameQueue>,
    children: Vec<Arc<dyn Sink>>,
    filter: Option<CompiledFilter>,
    drain_deadline: Duration,
    lost_at_shutdown: AtomicU64,
    /// Frames accepted into the queue / frames the worker is done with.
    /// flush() compares the two; queue emptiness alone would race with
    /// the frame the worker currently holds.
    enqueued: AtomicU64,
    processed: AtomicU64,
}

/// A sink that hands records to a background worker through a bounded
/// lock-free queue.
pub struct AsyncSink {
    shared: Arc<WorkerShared>,
    policy: OverflowPolicy,
    max_frame: usize,
    floor: Option<Severity>,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl AsyncSink {
    pub fn builder(name: &str) -> AsyncSinkBuilder {
        AsyncSinkBuilder {
            name: name.to_string(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            policy: OverflowPolicy::default(),
            max_frame: DEFAULT_MAX_FRAME,
            floor: None,
            filter: None,
            drain_deadline: DEFAULT_DRAIN_DEADLINE,
            children: Vec::new(),
            manual_start: false,
        }
    }

    /// Spawn the worker thread. True if this call started it.
    pub fn start(&self) -> bool {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker.is_some() {
            return false;
        }
        let shared = Arc::clone(&self.shared);
        let thread = thread::Builder::new()
            .name(format!("logfan-{}", self.shared.name))
            .spawn(move || worker_loop(shared));
        match thread {
            Ok(handle) => {
                *worker = Some(handle);
                true
            }
            Err(error) => {
                fallback_report(&format!(
                    "logfan: sink '{}': failed to spawn worker: {}",
                    self.shared.name, error
                ));
                false
            }
        }
    }

    /// Records dropped by the overflow policy so far.
    pub fn dropped_count(&self) -> u64 {
        self.shared.queue.dropped_total()
    }

    /// Frames still lost when the drain deadline expired at shutdown.
    pub fn lost_at_shutdown(&self) -> u64 {
        self.shared.lost_at_shutdown.load(Ordering::Relaxed)
    }

    pub(crate) fn shutdown_and_join(&self) -> u64 {
        self.shared.queue.shutdown();
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match handle {
            Some(handle) => {
                let _ = handle.join();
            }
            None => {
                // No worker ever ran; whatever is queued can no longer
                // be written and counts as lost.
                let mut lost = 0u64;
                while let Dequeue::Frame(frame) =
                    self.shared.queue.dequeue_blocking(Duration::ZERO)
                {
                    drop(frame);
                    lost += 1;
                }
                if lost > 0 {
                    self.shared.processed.fetch_add(lost, Ordering::Relaxed);
                    self.shared.lost_at_shutdown.fetch_add(lost, Ordering::Relaxed);
                    fallback_report(&format!(
                        "logfan: sink '{}': {} records lost at shutdown",
                        self.shared.name, lost
                    ));
                }
            }
        }
        self.lost_at_shutdown()
    }

    fn enqueue(&self, frame: Frame) {
        let queue = &self.shared.queue;
        match self.policy {
            OverflowPolicy::Block => {
                // Fails only when shutdown latches mid-wait.
                match queue.enqueue_blocking(frame) {
                    Ok(()) => {
                        self.shared.enqueued.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(_) => queue.record_drop(1),
                }
            }
            OverflowPolicy::DropNewest => match queue.try_enqueue(frame) {
                Ok(()) => {
                    self.shared.enqueued.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => queue.record_drop(1),
            },
            OverflowPolicy::DropOldest => {
                let mut frame = frame;
                for _ in 0..64 {
                    match queue.try_enqueue(frame) {
                        Ok(()) => {
                            self.shared.enqueued.fetch_add(1, Ordering::Relaxed);
                            return;
                        }
                        Err(back) => {
                            frame = back;
                            queue.request_evict();
                            thread::yield_now();
                        }
                    }
                }
                // The worker could not evict in time.
                queue.record_drop(1);
            }
        }
    }
}

impl Sink for AsyncSink {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn maybe_accepts(&self, meta: &RecordMeta) -> bool {
        match self.floor {
            Some(floor) => meta.severity >= floor,
            None => true,
        }
    }

    fn write_record(&self, record: &Record) {
        let frame = encode::encode(record, self.max_frame);
        self.enqueue(frame);
    }

    fn write_frame(&self, frame: &FrameView) {
        self.enqueue(encode::reencode(frame));
    }

    fn flush(&self) {
        let target = self.shared.enqueued.load(Ordering::Relaxed);
        let deadline = Instant::now() + Duration::from_secs(1);
        while self.shared.processed.load(Ordering::Relaxed) < target
            && Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(1));
        }
        for child in &self.shared.children {
            child.flush();
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Standalone use: make close imply the drain the coordinator
        // would otherwise have run.
        self.shutdown_and_join();
    }
}

pub struct AsyncSinkBuilder {
    name: String,
    queue_capacity: usize,
    policy: OverflowPolicy,
    max_frame: usize,
    floor: Option<Severity>,
    filter: Option<String>,
    drain_deadline: Duration,
    children: Vec<Arc<dyn Sink>>,
    manual_start: bool,
}

impl AsyncSinkBuilder {
    pub fn dispatch(mut self, child: Arc<dyn Sink>) -> Self {
        self.children.push(child);
        self
    }

    /// Rounded up to a power of two, minimum 2.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.next_power_of_two().max(2);
        self
    }

    pub fn overflow(mut self, policy: OverflowPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    pub fn severity_floor(mut self, floor: Severity) -> Self {
        self.floor = Some(floor);
        self
    }

    /// Filter applied by the worker over the composed record.
    pub fn filter(mut self, expression: &str) -> Self {
        self.filter = Some(expression.to_string());
        self
    }

    pub fn drain_deadline(mut self, deadline: Duration) -> Self {
        self.drain_deadline = deadline;
        self
    }

    /// Do not spawn the worker in build(); call `start()` later. Lets
    /// tests and embedders stage the queue before consumption begins.
    pub fn manual_start(mut self) -> Self {
        self.manual_start = true;
        self
    }

    pub fn build(self) -> Result<Arc<AsyncSink>, ConfigError> {
        let filter = self
            .filter
            .as_deref()
            .map(CompiledFilter::compile)
            .transpose()
            .map_err(|source| ConfigError::Filter {
                stream: self.name.clone(),
                source,
            })?;
        let sink = Arc::new(AsyncSink {
            shared: Arc::new(WorkerShared {
                name: self.name,
                queue: Arc::new(FrameQueue::new(self.queue_capacity)),
                children: self.children,
                filter,
                drain_deadline: self.drain_deadline,
                lost_at_shutdown: AtomicU64::new(0),
                enqueued: AtomicU64::new(0),
                processed: AtomicU64::new(0),
            }),
            policy: self.policy,
            max_frame: self.max_frame,
            floor: self.floor,
            worker: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        if !self.manual_start {
            sink.start();
        }
        Ok(sink)
    }
}

/// Coalesces the queue's drop counter into at most one diagnostic per
/// second, written through the sink's own children at WARNING.
struct DropReporter {
    reported: u64,
    last: Option<Instant>,
}

impl DropReporter {
    fn new() -> Self {
        Self {
            reported: 0,
            last: None,
        }
    }

    fn maybe_report(&mut self, shared: &WorkerShared, force: bool) {
        let total = shared.queue.dropped_total();
        if total <= self.reported {
            return;
        }
        let due = force
            || self
                .last
                .map(|at| at.elapsed() >= Duration::from_secs(1))
                .unwrap_or(true);
        if !due {
            return;
        }
        let delta = total - self.reported;
        self.reported = total;
        self.last = Some(Instant::now());
        let frame =
            encode::encode_diagnostic(Severity::WARNING, &format!("{} records dropped", delta));
        if let Some(view) = frame.view() {
            let meta = RecordMeta {
                severity: Severity::WARNING,
                logger: "logfan",
            };
            for child in &shared.children {
                if child.maybe_accepts(&meta) {
                    child.write_frame(&view);
                }
            }
        }
    }
}

fn deliver(shared: &WorkerShared, frame: &Frame) {
    let Some(view) = frame.view() else {
        // Malformed frame: logged as a bug in debug builds by the
        // parser, dropped here.
        return;
    };
    let node = registry::global().node_by_id(view.logger_id());
    let logger_name = node.as_ref().map(|n| n.name()).unwrap_or("");
    if let Some(filter) = &shared.filter {
        let composed = Composed::from_frame(&view, logger_name);
        if !filter.accepts(&composed) {
            return;
        }
    }
    let meta = RecordMeta {
        severity: view.severity(),
        logger: logger_name,
    };
    for child in &shared.children {
        if child.maybe_accepts(&meta) {
            child.write_frame(&view);
        }
    }
}

fn worker_loop(shared: Arc<WorkerShared>) {
    let mut drops = DropReporter::new();
    let mut drain_deadline: Option<Instant> = None;
    loop {
        while shared.queue.take_evict_request() {
            if shared.queue.evict_oldest() {
                shared.processed.fetch_add(1, Ordering::Relaxed);
            }
        }
        match shared.queue.dequeue_blocking(DEQUEUE_WAKE_INTERVAL) {
            Dequeue::Frame(frame) => {
                deliver(&shared, &frame);
                // Dropping the frame returns its storage to the pool.
                drop(frame);
                shared.processed.fetch_add(1, Ordering::Relaxed);
            }
            Dequeue::Timeout => {}
            Dequeue::Shutdown => break,
        }
        drops.maybe_report(&shared, false);
        if shared.queue.is_shutdown() {
            let deadline =
                *drain_deadline.get_or_insert_with(|| Instant::now() + shared.drain_deadline);
            if Instant::now() >= deadline {
                let mut lost = 0u64;
                while !shared.queue.is_empty() {
                    match shared.queue.dequeue_blocking(Duration::ZERO) {
                        Dequeue::Frame(frame) => {
                            drop(frame);
                            lost += 1;
                        }
                        _ => break,
                    }
                }
                if lost > 0 {
                    shared.processed.fetch_add(lost, Ordering::Relaxed);
                    shared.lost_at_shutdown.fetch_add(lost, Ordering::Relaxed);
                    fallback_report(&format!(
                        "logfan: sink '{}': {} records lost at shutdown",
                        shared.name, lost
                    ));
                }
                break;
            }
        }
    }
    drops.maybe_report(&shared, true);
    for child in &shared.children {
        child.flush();
    }
}
