//! Explicit "current span" scopes.
//!
//! A [`ScopeStack`] keeps one stack of trace contexts per thread. Entering a
//! scope pushes a context and returns a [`ScopeGuard`]; dropping the guard
//! removes exactly that entry, on every exit path including unwinding.
//!
//! Guards are `Send`. A guard released on another thread, or out of order,
//! still removes its own entry and leaves the others in place.

use span_relay::TraceContext;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

struct Entry {
    token: u64,
    context: TraceContext,
}

#[derive(Default)]
struct Stacks {
    by_thread: Mutex<HashMap<ThreadId, Vec<Entry>>>,
    next_token: AtomicU64,
}

impl Stacks {
    fn lock(&self) -> MutexGuard<'_, HashMap<ThreadId, Vec<Entry>>> {
        self.by_thread.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Per-thread stacks of active trace contexts. Cloning shares the stacks.
#[derive(Clone, Default)]
pub struct ScopeStack {
    stacks: Arc<Stacks>,
}

impl ScopeStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `context` current on this thread until the guard is dropped.
    pub fn enter(&self, context: TraceContext) -> ScopeGuard {
        let token = self.stacks.next_token.fetch_add(1, Ordering::Relaxed);
        let thread = thread::current().id();
        self.stacks
            .lock()
            .entry(thread)
            .or_default()
            .push(Entry { token, context });

        ScopeGuard {
            stacks: Arc::clone(&self.stacks),
            thread,
            token,
            context,
        }
    }

    /// Innermost context entered on this thread.
    pub fn current(&self) -> Option<TraceContext> {
        let stacks = self.stacks.lock();
        stacks
            .get(&thread::current().id())
            .and_then(|stack| stack.last())
            .map(|entry| entry.context)
    }

    /// Number of scopes open on this thread
    pub fn depth(&self) -> usize {
        let stacks = self.stacks.lock();
        stacks.get(&thread::current().id()).map_or(0, Vec::len)
    }
}

/// Keeps a context current. Released on drop.
#[must_use = "the scope is released as soon as the guard is dropped"]
pub struct ScopeGuard {
    stacks: Arc<Stacks>,
    thread: ThreadId,
    token: u64,
    context: TraceContext,
}

impl ScopeGuard {
    pub fn context(&self) -> &TraceContext {
        &self.context
    }

    /// Releases the scope now.
    pub fn release(self) {}
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let mut stacks = self.stacks.lock();
        let Some(stack) = stacks.get_mut(&self.thread) else {
            return;
        };
        if let Some(pos) = stack.iter().rposition(|entry| entry.token == self.token) {
            stack.remove(pos);
        }
        if stack.is_empty() {
            stacks.remove(&self.thread);
        }
    }
}

impl std::fmt::Debug for ScopeGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeGuard")
            .field("thread", &self.thread)
            .field("token", &self.token)
            .field("context", &self.context)
            .finish()
    }
}
