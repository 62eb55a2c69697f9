//! Completion counters and trigger scheduling.
//!
//! A counter is a pair of monotonically increasing success/error values.
//! Incrementing is the only mutation and is always followed by a trigger
//! scan: any deferred operation whose threshold is now met moves, in
//! insertion order, to the domain's ready queue for the progress driver to
//! issue. Firing a trigger only makes it eligible to execute.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::domain::DomainShared;
use crate::error::{Error, Result};
use crate::trigger::{Trigger, TriggerWatch};
use crate::wait::WaitSet;

/// A monotonically increasing success/error counter pair.
pub struct Counter {
    success: AtomicU64,
    errors: AtomicU64,
    last_read: AtomicU64,
    last_read_err: AtomicU64,
    wait: Mutex<Option<Arc<WaitSet>>>,
    triggers: Mutex<Vec<Trigger>>,
    domain: Weak<DomainShared>,
}

impl Counter {
    pub(crate) fn new(domain: Weak<DomainShared>) -> Self {
        Self {
            success: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_read: AtomicU64::new(0),
            last_read_err: AtomicU64::new(0),
            wait: Mutex::new(None),
            triggers: Mutex::new(Vec::new()),
            domain,
        }
    }

    /// Bind a waitable object, signaled on every increment.
    pub fn bind_wait(&self, wait: Arc<WaitSet>) {
        *self.wait.lock() = Some(wait);
    }

    /// Read the success count, updating the last-read snapshot.
    pub fn read(&self) -> u64 {
        let value = self.success.load(Ordering::Acquire);
        self.last_read.store(value, Ordering::Release);
        value
    }

    /// Read the error count, updating the last-read snapshot.
    pub fn read_err(&self) -> u64 {
        let value = self.errors.load(Ordering::Acquire);
        self.last_read_err.store(value, Ordering::Release);
        value
    }

    /// Success count at the last [`read`](Counter::read).
    pub fn last_read(&self) -> u64 {
        self.last_read.load(Ordering::Acquire)
    }

    /// Increment the success count and fire ripe triggers.
    pub fn add(&self, value: u64) {
        self.success.fetch_add(value, Ordering::AcqRel);
        self.check_triggers();
        self.signal();
    }

    /// Increment the error count and fire ripe triggers.
    pub fn add_err(&self, value: u64) {
        self.errors.fetch_add(value, Ordering::AcqRel);
        self.check_triggers();
        self.signal();
    }

    fn signal(&self) {
        if let Some(wait) = self.wait.lock().as_ref() {
            wait.signal();
        }
    }

    /// Attach a deferred operation, then scan immediately in case the
    /// threshold is already met.
    pub(crate) fn add_trigger(&self, trigger: Trigger) {
        self.triggers.lock().push(trigger);
        self.check_triggers();
    }

    /// Move every trigger whose threshold is met to the domain ready queue,
    /// preserving insertion order. Uses `>=` so a trigger tolerates
    /// coalesced increments that jump past its threshold.
    fn check_triggers(&self) {
        let success = self.success.load(Ordering::Acquire);
        let errors = self.errors.load(Ordering::Acquire);
        let mut ready = Vec::new();
        {
            let mut triggers = self.triggers.lock();
            let mut i = 0;
            while i < triggers.len() {
                let ripe = match triggers[i].watch {
                    TriggerWatch::Success => success >= triggers[i].threshold,
                    TriggerWatch::Errors => errors >= triggers[i].threshold,
                };
                if ripe {
                    ready.push(triggers.remove(i));
                } else {
                    i += 1;
                }
            }
        }
        if ready.is_empty() {
            return;
        }
        if let Some(domain) = self.domain.upgrade() {
            domain.enqueue_ready_triggers(ready);
        } else {
            tracing::debug!("dropping {} ready triggers: domain gone", ready.len());
        }
    }

    /// Number of triggers still waiting on this counter.
    pub fn pending_triggers(&self) -> usize {
        self.triggers.lock().len()
    }

    /// Block until the success count reaches `threshold`.
    ///
    /// Returns the observed count, or [`Error::ErrorAvailable`] if the error
    /// count moved while waiting. Drives domain progress while spinning when
    /// no wait object is bound.
    pub fn wait(&self, threshold: u64, timeout: Duration) -> Result<u64> {
        let deadline = Instant::now() + timeout;
        let entry_errors = self.errors.load(Ordering::Acquire);
        loop {
            let value = self.success.load(Ordering::Acquire);
            if value >= threshold {
                return Ok(value);
            }
            if self.errors.load(Ordering::Acquire) != entry_errors {
                return Err(Error::ErrorAvailable);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            match self.wait.lock().clone() {
                Some(wait) => {
                    wait.wait(deadline - now)?;
                }
                None => match self.domain.upgrade() {
                    Some(domain) => domain.progress(),
                    None => std::thread::sleep(Duration::from_micros(10)),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wait::WaitKind;

    fn cntr() -> Counter {
        Counter::new(Weak::new())
    }

    #[test]
    fn test_add_and_snapshots() {
        let c = cntr();
        assert_eq!(c.read(), 0);
        c.add(3);
        c.add(1);
        assert_eq!(c.read(), 4);
        assert_eq!(c.last_read(), 4);
        c.add_err(1);
        assert_eq!(c.read_err(), 1);
        assert_eq!(c.read(), 4);
    }

    #[test]
    fn test_wait_already_satisfied() {
        let c = cntr();
        c.add(5);
        assert_eq!(c.wait(5, Duration::from_millis(1)).unwrap(), 5);
    }

    #[test]
    fn test_wait_cross_thread() {
        let c = Arc::new(cntr());
        c.bind_wait(Arc::new(WaitSet::new(WaitKind::Condvar).unwrap()));
        let c2 = c.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            c2.add(2);
        });
        assert_eq!(c.wait(2, Duration::from_secs(5)).unwrap(), 2);
        t.join().unwrap();
    }

    #[test]
    fn test_error_watch_trigger_ignores_success() {
        use crate::ep::OpFlags;
        use crate::trigger::TriggerOp;

        let c = cntr();
        c.add_trigger(Trigger {
            threshold: 1,
            watch: TriggerWatch::Errors,
            op: TriggerOp::Recv {
                ep: Weak::new(),
                buf: 0,
                len: 0,
                src: None,
                context: 0,
                flags: OpFlags::empty(),
            },
        });
        c.add(5);
        assert_eq!(c.pending_triggers(), 1);
        c.add_err(1);
        assert_eq!(c.pending_triggers(), 0);
    }

    #[test]
    fn test_wait_observes_error_movement() {
        let c = Arc::new(cntr());
        c.bind_wait(Arc::new(WaitSet::new(WaitKind::Condvar).unwrap()));
        let c2 = c.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            c2.add_err(1);
        });
        let err = c.wait(1, Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, Error::ErrorAvailable));
        t.join().unwrap();
    }
}
