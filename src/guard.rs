//! # Exclusion Guards
//!
//! Non-blocking mutual exclusion for the worker pass and the upload in flight.
//!
//! A guard is either idle or busy. Entering a busy guard never waits and never
//! queues: `try_enter` returns `None` and the caller skips its pass. The
//! returned [`GuardTicket`] owns the busy state and releases it on drop, so a
//! ticket can travel across an `.await` or into a blocking task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Two-state exclusion flag
#[derive(Debug)]
pub struct ExclusiveGuard {
    name: &'static str,
    busy: AtomicBool,
}

impl ExclusiveGuard {
    /// Create an idle guard
    ///
    /// # Arguments
    ///
    /// * `name` - Label used in log messages (e.g., "worker", "upload")
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            busy: AtomicBool::new(false),
        })
    }

    /// Move from idle to busy
    ///
    /// # Returns
    ///
    /// * `Some(GuardTicket)` - The guard is now held by the caller
    /// * `None` - The guard was already busy; nothing changed
    pub fn try_enter(self: &Arc<Self>) -> Option<GuardTicket> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| GuardTicket { guard: Arc::clone(self) })
    }

    /// Whether a ticket is currently outstanding
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Proof of holding an [`ExclusiveGuard`]; releases it when dropped
#[derive(Debug)]
pub struct GuardTicket {
    guard: Arc<ExclusiveGuard>,
}

impl Drop for GuardTicket {
    fn drop(&mut self) {
        self.guard.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_guard_is_idle() {
        let guard = ExclusiveGuard::new("worker");
        assert!(!guard.is_busy());
        assert_eq!(guard.name(), "worker");
    }

    #[test]
    fn test_second_enter_is_refused() {
        let guard = ExclusiveGuard::new("worker");
        let ticket = guard.try_enter();
        assert!(ticket.is_some());
        assert!(guard.is_busy());
        assert!(guard.try_enter().is_none(), "busy guard must not be re-entered");
    }

    #[test]
    fn test_drop_releases_guard() {
        let guard = ExclusiveGuard::new("upload");
        let ticket = guard.try_enter().unwrap();
        drop(ticket);
        assert!(!guard.is_busy());
        assert!(guard.try_enter().is_some());
    }

    #[test]
    fn test_ticket_released_from_other_thread() {
        let guard = ExclusiveGuard::new("upload");
        let ticket = guard.try_enter().unwrap();

        std::thread::spawn(move || drop(ticket)).join().unwrap();

        assert!(!guard.is_busy());
    }

    #[test]
    fn test_only_one_thread_wins() {
        let guard = ExclusiveGuard::new("worker");
        let barrier = Arc::new(std::sync::Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let guard = Arc::clone(&guard);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    // Keep the ticket alive until every thread has tried
                    let ticket = guard.try_enter();
                    let won = ticket.is_some();
                    barrier.wait();
                    won
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
