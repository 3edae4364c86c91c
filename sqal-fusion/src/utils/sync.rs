//! Mutex helpers
//!
//! Critical sections in the pipeline never panic while holding a lock, but a
//! panicking test thread can still poison one. The data behind every lock here
//! stays consistent between statements, so a poisoned guard is safe to reuse.

use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering the guard if a previous holder panicked
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
