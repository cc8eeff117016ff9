//! Shared engine types: the per-path serialization locks and the HTTP
//! application context.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex};

// ---------------------------------------------------------------------------
// Per-path locks
// ---------------------------------------------------------------------------

/// Serializes `screening → tagging → vectorization` per file path. Across
/// files there is no ordering guarantee, and none is wanted.
#[derive(Default)]
pub struct PathLocks {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

/// RAII guard; dropping releases the path.
pub struct PathLockGuard<'a> {
    locks: &'a PathLocks,
    path: String,
}

impl PathLocks {
    /// Block until `path` is free, then hold it for the guard's lifetime.
    pub fn lock(&self, path: &str) -> PathLockGuard<'_> {
        let mut held = self.held.lock().unwrap_or_else(|p| p.into_inner());
        while held.contains(path) {
            held = self.released.wait(held).unwrap_or_else(|p| p.into_inner());
        }
        held.insert(path.to_string());
        PathLockGuard { locks: self, path: path.to_string() }
    }

    /// Non-blocking attempt; `None` when another worker owns the path.
    pub fn try_lock(&self, path: &str) -> Option<PathLockGuard<'_>> {
        let mut held = self.held.lock().unwrap_or_else(|p| p.into_inner());
        if held.contains(path) {
            return None;
        }
        held.insert(path.to_string());
        Some(PathLockGuard { locks: self, path: path.to_string() })
    }
}

impl Drop for PathLockGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.locks.held.lock().unwrap_or_else(|p| p.into_inner());
        held.remove(&self.path);
        self.locks.released.notify_all();
    }
}

// ---------------------------------------------------------------------------
// HTTP application context
// ---------------------------------------------------------------------------

/// Axum state: one engine handle shared by every route.
#[derive(Clone)]
pub struct AppContext {
    pub engine: std::sync::Arc<crate::engine::Engine>,
    pub start_time: std::time::Instant,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn same_path_serializes_distinct_paths_do_not() {
        let locks = Arc::new(PathLocks::default());

        let g1 = locks.lock("/a");
        assert!(locks.try_lock("/a").is_none(), "same path must contend");
        assert!(locks.try_lock("/b").is_some(), "distinct paths are independent");
        drop(g1);
        assert!(locks.try_lock("/a").is_some());
    }

    #[test]
    fn contended_lock_unblocks_on_release() {
        let locks = Arc::new(PathLocks::default());
        let guard = locks.lock("/file");

        let locks2 = Arc::clone(&locks);
        let waiter = std::thread::spawn(move || {
            let _g = locks2.lock("/file");
            true
        });

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!waiter.is_finished());
        drop(guard);
        assert!(waiter.join().unwrap());
    }
}
