//! Host event loop: pending-work flag, condvar wake, keep-alive references.
//!
//! The loop stays alive while at least one handle is referenced. Any thread
//! may `send` on an `AsyncHandle`; sends before the host thread observes the
//! flag coalesce into one wake.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use super::error::{Error, Result};

struct LoopShared {
    pending: Mutex<bool>,
    cond: Condvar,
    refs: AtomicUsize,
    closed: AtomicBool,
}

impl LoopShared {
    fn notify(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        *pending = true;
        drop(pending);
        self.cond.notify_one();
    }
}

#[derive(Clone)]
pub struct EventLoop {
    shared: Arc<LoopShared>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(LoopShared {
                pending: Mutex::new(false),
                cond: Condvar::new(),
                refs: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Create a cross-thread wake handle. Starts unreferenced.
    pub fn async_handle(&self) -> Result<AsyncHandle> {
        if self.is_closed() {
            return Err(Error::initialization(
                "wake handle",
                "event loop is closed",
            ));
        }
        Ok(AsyncHandle {
            shared: Arc::clone(&self.shared),
            referenced: AtomicBool::new(false),
            closing: AtomicBool::new(false),
        })
    }

    /// True while any handle keeps the loop alive.
    pub fn is_alive(&self) -> bool {
        self.ref_count() > 0
    }

    pub fn ref_count(&self) -> usize {
        self.shared.refs.load(Ordering::Acquire)
    }

    /// Consume the pending flag without blocking.
    pub fn take_pending(&self) -> bool {
        let mut pending = self
            .shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *pending, false)
    }

    /// Block until a wake arrives or `timeout` elapses. Consumes the flag.
    pub fn wait(&self, timeout: Duration) -> bool {
        let pending = self
            .shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (mut pending, _) = self
            .shared
            .cond
            .wait_timeout_while(pending, timeout, |p| !*p)
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *pending, false)
    }

    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        // Unblock a host thread parked in `wait`.
        self.shared.notify();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

// =============================================================================
// AsyncHandle
// =============================================================================

pub struct AsyncHandle {
    shared: Arc<LoopShared>,
    referenced: AtomicBool,
    closing: AtomicBool,
}

impl AsyncHandle {
    /// Signal the host thread. No-op once the handle is closing.
    pub fn send(&self) {
        if self.is_closing() {
            return;
        }
        self.shared.notify();
    }

    /// Keep the loop alive on behalf of this handle. Idempotent.
    pub fn ref_(&self) {
        if !self.referenced.swap(true, Ordering::AcqRel) {
            self.shared.refs.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Stop keeping the loop alive. Idempotent.
    pub fn unref(&self) {
        if self.referenced.swap(false, Ordering::AcqRel) {
            self.shared.refs.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub fn has_ref(&self) -> bool {
        self.referenced.load(Ordering::Acquire)
    }

    /// Begin tearing the handle down. Drops its keep-alive reference.
    pub fn close(&self) {
        self.closing.store(true, Ordering::Release);
        self.unref();
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }
}

impl Drop for AsyncHandle {
    fn drop(&mut self) {
        self.unref();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn sends_coalesce() {
        let event_loop = EventLoop::new();
        let handle = event_loop.async_handle().unwrap();
        handle.send();
        handle.send();
        handle.send();
        assert!(event_loop.take_pending());
        assert!(!event_loop.take_pending());
    }

    #[test]
    fn refs_are_idempotent_per_handle() {
        let event_loop = EventLoop::new();
        let a = event_loop.async_handle().unwrap();
        let b = event_loop.async_handle().unwrap();
        assert!(!event_loop.is_alive());

        a.ref_();
        a.ref_();
        assert_eq!(event_loop.ref_count(), 1);
        b.ref_();
        assert_eq!(event_loop.ref_count(), 2);

        a.unref();
        a.unref();
        assert_eq!(event_loop.ref_count(), 1);
        drop(b);
        assert!(!event_loop.is_alive());
    }

    #[test]
    fn wait_wakes_on_cross_thread_send() {
        let event_loop = EventLoop::new();
        let handle = event_loop.async_handle().unwrap();
        let sender = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            handle.send();
        });
        let started = Instant::now();
        assert!(event_loop.wait(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(5));
        sender.join().unwrap();
    }

    #[test]
    fn wait_times_out_without_send() {
        let event_loop = EventLoop::new();
        assert!(!event_loop.wait(Duration::from_millis(5)));
    }

    #[test]
    fn closing_handle_ignores_sends_and_releases_ref() {
        let event_loop = EventLoop::new();
        let handle = event_loop.async_handle().unwrap();
        handle.ref_();
        handle.close();
        assert!(!event_loop.is_alive());
        handle.send();
        assert!(!event_loop.take_pending());
    }

    #[test]
    fn closed_loop_refuses_new_handles() {
        let event_loop = EventLoop::new();
        event_loop.close();
        assert!(event_loop.async_handle().is_err());
    }
}
