//! Waitable synchronization objects and the domain poll lock.
//!
//! A [`WaitSet`] is the object a CQ, EQ or counter signals when it becomes
//! readable. It is either condvar-backed (in-process waiters) or backed by a
//! pipe fd pair so the application can feed the read end into its own event
//! loop. Sharing one wait set between several queues is done by cloning the
//! `Arc` and binding it to each of them.

use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

/// Kind of synchronization object backing a [`WaitSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitKind {
    /// Mutex + condition variable.
    Condvar,
    /// Pipe fd pair; the read end becomes readable when signaled.
    Fd,
}

enum WaitImpl {
    Condvar {
        pending: Mutex<u64>,
        cond: Condvar,
    },
    Fd {
        read: OwnedFd,
        write: OwnedFd,
    },
}

/// A waitable signal target.
pub struct WaitSet {
    imp: WaitImpl,
}

impl WaitSet {
    /// Create a new wait set of the given kind.
    pub fn new(kind: WaitKind) -> Result<Self> {
        let imp = match kind {
            WaitKind::Condvar => WaitImpl::Condvar {
                pending: Mutex::new(0),
                cond: Condvar::new(),
            },
            WaitKind::Fd => {
                // Nonblocking so signaling never stalls on a full pipe.
                let (read, write) = nix::unistd::pipe2(OFlag::O_NONBLOCK).map_err(io_err)?;
                WaitImpl::Fd { read, write }
            }
        };
        Ok(Self { imp })
    }

    /// Wake one pending or future waiter.
    pub fn signal(&self) {
        match &self.imp {
            WaitImpl::Condvar { pending, cond } => {
                *pending.lock() += 1;
                cond.notify_all();
            }
            WaitImpl::Fd { write, .. } => {
                // A full pipe already wakes the reader; EAGAIN is fine.
                let _ = nix::unistd::write(write.as_fd(), &[1u8]);
            }
        }
    }

    /// Block until signaled or until the timeout elapses.
    ///
    /// Returns `true` if a signal was consumed, `false` on timeout.
    pub fn wait(&self, timeout: Duration) -> Result<bool> {
        match &self.imp {
            WaitImpl::Condvar { pending, cond } => {
                let deadline = std::time::Instant::now() + timeout;
                let mut pending = pending.lock();
                loop {
                    if *pending > 0 {
                        *pending -= 1;
                        return Ok(true);
                    }
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    let timed_out = cond.wait_for(&mut pending, deadline - now).timed_out();
                    if timed_out && *pending == 0 {
                        return Ok(false);
                    }
                }
            }
            WaitImpl::Fd { read, .. } => {
                let ms = timeout.as_millis().min(i32::MAX as u128) as i32;
                let mut fds = [PollFd::new(read.as_fd(), PollFlags::POLLIN)];
                let n = poll(&mut fds, PollTimeout::try_from(ms).unwrap_or(PollTimeout::MAX))
                    .map_err(io_err)?;
                if n == 0 {
                    return Ok(false);
                }
                let mut byte = [0u8; 1];
                let _ = nix::unistd::read(read.as_raw_fd(), &mut byte);
                Ok(true)
            }
        }
    }

    /// The pollable fd for fd-backed wait sets.
    pub fn fd(&self) -> Option<RawFd> {
        match &self.imp {
            WaitImpl::Condvar { .. } => None,
            WaitImpl::Fd { read, .. } => Some(read.as_raw_fd()),
        }
    }
}

fn io_err(e: nix::errno::Errno) -> Error {
    Error::Io(std::io::Error::from_raw_os_error(e as i32))
}

/// A minimal test-and-set spin lock.
///
/// Guards the substrate's probe-then-consume completion sequence, which must
/// not be interleaved by two threads. Held only for the duration of a
/// bounded poll batch, so waiters spin instead of parking.
pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) -> SpinGuard<'_> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        }
        SpinGuard { lock: self }
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_condvar_signal_then_wait() {
        let w = WaitSet::new(WaitKind::Condvar).unwrap();
        w.signal();
        assert!(w.wait(Duration::from_millis(1)).unwrap());
        assert!(!w.wait(Duration::from_millis(1)).unwrap());
    }

    #[test]
    fn test_condvar_cross_thread_wakeup() {
        let w = Arc::new(WaitSet::new(WaitKind::Condvar).unwrap());
        let w2 = w.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            w2.signal();
        });
        assert!(w.wait(Duration::from_secs(5)).unwrap());
        t.join().unwrap();
    }

    #[test]
    fn test_fd_wait_set() {
        let w = WaitSet::new(WaitKind::Fd).unwrap();
        assert!(w.fd().is_some());
        assert!(!w.wait(Duration::from_millis(1)).unwrap());
        w.signal();
        assert!(w.wait(Duration::from_millis(100)).unwrap());
    }

    #[test]
    fn test_spin_lock_excludes() {
        let lock = Arc::new(SpinLock::new());
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = lock.clone();
            let counter = counter.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    let _g = lock.lock();
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    }
}
