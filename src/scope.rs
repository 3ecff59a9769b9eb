// SPDX-License-Identifier: Apache-2.0 OR MIT
// Emission-time context: task id, clocks, thread-local scope stack

use std::cell::RefCell;
use std::marker::PhantomData;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

thread_local! {
    static SCOPES: RefCell<Vec<Instant>> = const { RefCell::new(Vec::new()) };
}

/// RAII guard for a logging scope.
///
/// While the guard is alive, records emitted on this thread capture the
/// scope depth (`scope_indent`) and the time since this scope was
/// entered (`scope_elapsed`).
pub struct Scope {
    // Scope entries are per-thread; the guard must be dropped on the
    // thread that created it.
    _not_send: PhantomData<*const ()>,
}

/// Enter a logging scope on the current thread.
pub fn enter_scope() -> Scope {
    SCOPES.with(|scopes| scopes.borrow_mut().push(Instant::now()));
    Scope {
        _not_send: PhantomData,
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        SCOPES.with(|scopes| {
            scopes.borrow_mut().pop();
        });
    }
}

/// Depth of the scope stack and nanoseconds since the innermost scope
/// was entered, captured at emission time. None outside any scope.
pub(crate) fn scope_snapshot() -> Option<(u16, u64)> {
    SCOPES.with(|scopes| {
        let scopes = scopes.borrow();
        let innermost = scopes.last()?;
        let depth = scopes.len().min(u16::MAX as usize) as u16;
        Some((depth, innermost.elapsed().as_nanos() as u64))
    })
}

/// Kernel task id of the current thread, truncated to u32.
pub(crate) fn task_id() -> u32 {
    #[cfg(target_os = "linux")]
    {
        unsafe { libc::gettid() as u32 }
    }
    #[cfg(not(target_os = "linux"))]
    {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let mut hasher = DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        hasher.finish() as u32
    }
}

/// Nanoseconds since the Unix epoch.
pub(crate) fn epoch_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Monotonic nanoseconds since an arbitrary per-process origin.
/// Gives a stable tie-break where wall-clock reads may be equal.
pub(crate) fn monotonic_nanos() -> u64 {
    use std::sync::OnceLock;
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_nanos() as u64
}
