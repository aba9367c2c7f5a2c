//! Result collector for asynchronous object-store calls.
//!
//! Each async GET/PUT registers a caller-supplied id as pending, then a
//! worker moves it to completed or failed. Results are indexed by id and
//! their arrival order is preserved.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::http::pool::HttpResponse;

/// State machine of one collector entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchState {
    Pending,
    Completed(HttpResponse),
    Failed(String),
}

impl FetchState {
    pub fn is_done(&self) -> bool {
        !matches!(self, FetchState::Pending)
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<u64, FetchState>,
    /// Ids in the order their results arrived.
    arrivals: Vec<u64>,
}

/// Shared between the caller and the persistence workers.
#[derive(Default)]
pub struct Collector {
    inner: Mutex<Inner>,
    done: Condvar,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an id as in flight. Reusing an id resets its state.
    pub fn register(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.insert(id, FetchState::Pending);
    }

    /// Deliver a worker result for an id.
    pub fn insert(&self, id: u64, state: FetchState) {
        debug_assert!(state.is_done());
        let mut inner = self.inner.lock().unwrap();
        inner.entries.insert(id, state);
        inner.arrivals.push(id);
        self.done.notify_all();
    }

    /// Current state of an id, if it was ever registered.
    pub fn get(&self, id: u64) -> Option<FetchState> {
        self.inner.lock().unwrap().entries.get(&id).cloned()
    }

    /// Block until the id leaves `Pending`, up to `timeout`.
    pub fn wait(&self, id: u64, timeout: Duration) -> Option<FetchState> {
        let deadline = std::time::Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            match inner.entries.get(&id) {
                Some(state) if state.is_done() => return Some(state.clone()),
                Some(_) => {}
                None => return None,
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return inner.entries.get(&id).cloned();
            }
            let (guard, result) = self.done.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
            if result.timed_out() {
                return inner.entries.get(&id).cloned();
            }
        }
    }

    /// Ids whose results have arrived, in arrival order.
    pub fn arrived(&self) -> Vec<u64> {
        self.inner.lock().unwrap().arrivals.clone()
    }

    /// Number of ids still pending.
    pub fn pending(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .entries
            .values()
            .filter(|s| !s.is_done())
            .count()
    }
}

// ── Tests ──────────────────────────────────────────────────────────
