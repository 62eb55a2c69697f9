//! Event queues for non-completion events.
//!
//! Same free-list and waitable design as the completion queue, but the error
//! side is a full queue rather than a single slot: async errors can pile up
//! faster than an application drains them.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::wait::WaitSet;

/// Kind of a control event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EqKind {
    /// Plain notification.
    #[default]
    Notify,
    /// Asynchronous error not tied to a dequeued completion.
    Error,
}

/// One control event.
#[derive(Debug, Clone, Default)]
pub struct EqEvent {
    pub kind: EqKind,
    /// User context, where one is known.
    pub context: u64,
    /// Event payload.
    pub data: u64,
    /// Error code (`0` for notifications).
    pub error: u64,
}

struct EqInner {
    event_queue: VecDeque<Box<EqEvent>>,
    error_queue: VecDeque<Box<EqEvent>>,
    free: Vec<Box<EqEvent>>,
    overruns: u64,
}

impl EqInner {
    fn available(&self) -> bool {
        !self.event_queue.is_empty() || !self.error_queue.is_empty()
    }
}

/// An ordered control event stream.
pub struct EventQueue {
    inner: Mutex<EqInner>,
    wait: Mutex<Option<Arc<WaitSet>>>,
}

impl EventQueue {
    pub(crate) fn new(depth: usize) -> Self {
        let free = (0..depth.max(1))
            .map(|_| Box::new(EqEvent::default()))
            .collect();
        Self {
            inner: Mutex::new(EqInner {
                event_queue: VecDeque::new(),
                error_queue: VecDeque::new(),
                free,
                overruns: 0,
            }),
            wait: Mutex::new(None),
        }
    }

    /// Bind a waitable object, signaled on each empty-to-readable transition.
    pub fn bind_wait(&self, wait: Arc<WaitSet>) {
        *self.wait.lock() = Some(wait);
    }

    /// Number of events dropped because the free list was exhausted.
    pub fn overruns(&self) -> u64 {
        self.inner.lock().overruns
    }

    /// Append an event; errors are routed to the error queue.
    pub(crate) fn enqueue(&self, event: EqEvent) -> bool {
        let signal = {
            let mut inner = self.inner.lock();
            let Some(mut slot) = inner.free.pop() else {
                inner.overruns += 1;
                tracing::warn!(context = event.context, "event dropped: eq overrun");
                return false;
            };
            *slot = event;
            let was_available = inner.available();
            if slot.error != 0 || slot.kind == EqKind::Error {
                slot.kind = EqKind::Error;
                inner.error_queue.push_back(slot);
            } else {
                inner.event_queue.push_back(slot);
            }
            !was_available
        };
        if signal {
            if let Some(wait) = self.wait.lock().as_ref() {
                wait.signal();
            }
        }
        true
    }

    /// Dequeue the next notification.
    ///
    /// Returns [`Error::ErrorAvailable`] while the error queue is non-empty.
    pub fn read(&self) -> Result<Option<EqEvent>> {
        let mut inner = self.inner.lock();
        if !inner.error_queue.is_empty() {
            return Err(Error::ErrorAvailable);
        }
        Ok(inner.event_queue.pop_front().map(|mut slot| {
            let event = std::mem::take(&mut *slot);
            inner.free.push(slot);
            event
        }))
    }

    /// Dequeue the next error event.
    pub fn readerr(&self) -> Option<EqEvent> {
        let mut inner = self.inner.lock();
        inner.error_queue.pop_front().map(|mut slot| {
            let event = std::mem::take(&mut *slot);
            inner.free.push(slot);
            event
        })
    }

    /// Blocking dequeue with timeout.
    pub fn sread(&self, timeout: Duration) -> Result<EqEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(event) = self.read()? {
                return Ok(event);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            match self.wait.lock().clone() {
                Some(wait) => {
                    wait.wait(deadline - now)?;
                }
                None => std::thread::sleep(Duration::from_micros(10)),
            }
        }
    }
}
