//! Completion queues.
//!
//! A completion queue is a FIFO stream of terminal-outcome records. Event
//! memory comes from a preallocated free list so the enqueue path never
//! allocates. An error completion occupies the single pending-error slot and
//! blocks normal dequeue until the caller drains it with [`readerr`]; this
//! is what forces a consumer to observe failures before resuming. Follow-up
//! errors wait in an ordered backlog behind the slot.
//!
//! [`readerr`]: CompletionQueue::readerr

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::domain::DomainShared;
use crate::error::{Error, Result};
use crate::substrate::PeerAddr;
use crate::wait::WaitSet;

bitflags::bitflags! {
    /// Completion flag bits describing the completed operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CompFlags: u64 {
        const SEND = 1 << 0;
        const RECV = 1 << 1;
        const WRITE = 1 << 2;
        const READ = 1 << 3;
        const REMOTE_WRITE = 1 << 4;
        const REMOTE_READ = 1 << 5;
        const MSG = 1 << 6;
        const RMA = 1 << 7;
        const ATOMIC = 1 << 8;
        const REMOTE_CQ_DATA = 1 << 9;
    }
}

/// Entry format of a completion queue.
///
/// The format picks which fields of [`CqEvent`] are populated on success
/// entries; error entries always carry every field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqFormat {
    /// Context only.
    Context,
    /// Context, flags, length.
    Msg,
    /// Msg fields plus remote CQ data.
    Data,
    /// Data fields plus tag.
    Tagged,
}

/// One completion record.
#[derive(Debug, Clone, Default)]
pub struct CqEvent {
    /// User completion context of the originating request.
    pub context: u64,
    /// Operation kind flags.
    pub flags: CompFlags,
    /// Bytes transferred.
    pub len: usize,
    /// Remote CQ data, if the peer supplied any.
    pub data: u64,
    /// Message tag.
    pub tag: u64,
    /// Overflow length: bytes received beyond what the buffer or request
    /// could accept.
    pub olen: usize,
    /// Error code (`0` on success; see [`crate::error::code`]).
    pub error: u64,
    /// Peer the data came from, where meaningful.
    pub source: Option<PeerAddr>,
}

struct CqInner {
    queue: VecDeque<Box<CqEvent>>,
    free: Vec<Box<CqEvent>>,
    pending_error: Option<Box<CqEvent>>,
    error_backlog: VecDeque<Box<CqEvent>>,
    overruns: u64,
}

impl CqInner {
    fn available(&self) -> bool {
        self.pending_error.is_some() || !self.queue.is_empty()
    }
}

/// An ordered, boundedly-buffered completion event stream.
pub struct CompletionQueue {
    format: CqFormat,
    inner: Mutex<CqInner>,
    wait: Mutex<Option<Arc<WaitSet>>>,
    domain: Weak<DomainShared>,
}

impl CompletionQueue {
    pub(crate) fn new(format: CqFormat, depth: usize, domain: Weak<DomainShared>) -> Self {
        let free = (0..depth.max(1))
            .map(|_| Box::new(CqEvent::default()))
            .collect();
        Self {
            format,
            inner: Mutex::new(CqInner {
                queue: VecDeque::new(),
                free,
                pending_error: None,
                error_backlog: VecDeque::new(),
                overruns: 0,
            }),
            wait: Mutex::new(None),
            domain,
        }
    }

    /// The queue's entry format.
    pub fn format(&self) -> CqFormat {
        self.format
    }

    /// Bind a waitable object, signaled on each empty-to-readable
    /// transition. Pass a clone of another queue's wait set to share one
    /// waitable between queues.
    pub fn bind_wait(&self, wait: Arc<WaitSet>) {
        *self.wait.lock() = Some(wait);
    }

    /// The bound wait set, if any.
    pub fn wait_set(&self) -> Option<Arc<WaitSet>> {
        self.wait.lock().clone()
    }

    /// Number of events dropped because the free list was exhausted.
    pub fn overruns(&self) -> u64 {
        self.inner.lock().overruns
    }

    /// Append an event, drawing storage from the free list.
    ///
    /// Returns `false` (and counts an overrun) if no event slot is free.
    pub(crate) fn enqueue(&self, event: CqEvent) -> bool {
        let signal = {
            let mut inner = self.inner.lock();
            let Some(mut slot) = inner.free.pop() else {
                inner.overruns += 1;
                tracing::warn!(context = event.context, "completion dropped: cq overrun");
                return false;
            };
            *slot = self.shape(event);
            let was_available = inner.available();
            if slot.error != 0 {
                if inner.pending_error.is_none() {
                    inner.pending_error = Some(slot);
                } else {
                    inner.error_backlog.push_back(slot);
                }
            } else {
                inner.queue.push_back(slot);
            }
            !was_available && inner.available()
        };
        if signal {
            if let Some(wait) = self.wait.lock().as_ref() {
                wait.signal();
            }
        }
        true
    }

    /// Zero the fields the queue format does not report.
    fn shape(&self, mut event: CqEvent) -> CqEvent {
        if event.error != 0 {
            return event;
        }
        match self.format {
            CqFormat::Context => {
                event.flags = CompFlags::empty();
                event.len = 0;
                event.data = 0;
                event.tag = 0;
            }
            CqFormat::Msg => {
                event.data = 0;
                event.tag = 0;
            }
            CqFormat::Data => {
                event.tag = 0;
            }
            CqFormat::Tagged => {}
        }
        event.olen = 0;
        event
    }

    /// Dequeue up to `max` events in enqueue order.
    ///
    /// Returns an empty vector if nothing is ready, and
    /// [`Error::ErrorAvailable`] while an error entry is pending.
    pub fn read(&self, max: usize) -> Result<Vec<CqEvent>> {
        let mut inner = self.inner.lock();
        if inner.pending_error.is_some() {
            return Err(Error::ErrorAvailable);
        }
        let mut out = Vec::new();
        while out.len() < max {
            let Some(mut slot) = inner.queue.pop_front() else {
                break;
            };
            out.push(std::mem::take(&mut *slot));
            inner.free.push(slot);
        }
        Ok(out)
    }

    /// Drain the pending error entry, unblocking normal reads (unless
    /// another queued error takes its place).
    pub fn readerr(&self) -> Option<CqEvent> {
        let mut inner = self.inner.lock();
        let mut slot = inner.pending_error.take()?;
        let event = std::mem::take(&mut *slot);
        inner.free.push(slot);
        inner.pending_error = inner.error_backlog.pop_front();
        Some(event)
    }

    /// Blocking dequeue: wait until events are ready or the timeout lapses.
    ///
    /// Waits on the bound wait set when one exists; otherwise drives domain
    /// progress while spinning.
    pub fn sread(&self, max: usize, timeout: Duration) -> Result<Vec<CqEvent>> {
        let deadline = Instant::now() + timeout;
        loop {
            let events = self.read(max)?;
            if !events.is_empty() {
                return Ok(events);
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
    use crate::error::code;

    fn cq(format: CqFormat, depth: usize) -> CompletionQueue {
        CompletionQueue::new(format, depth, Weak::new())
    }

    fn event(context: u64, error: u64) -> CqEvent {
        CqEvent {
            context,
            flags: CompFlags::SEND | CompFlags::MSG,
            len: 8,
            data: 5,
            tag: 6,
            error,
            ..Default::default()
        }
    }

    #[test]
    fn test_fifo_order() {
        let cq = cq(CqFormat::Tagged, 16);
        for i in 0..5 {
            assert!(cq.enqueue(event(i, 0)));
        }
        let got = cq.read(3).unwrap();
        assert_eq!(got.iter().map(|e| e.context).collect::<Vec<_>>(), [0, 1, 2]);
        let got = cq.read(16).unwrap();
        assert_eq!(got.iter().map(|e| e.context).collect::<Vec<_>>(), [3, 4]);
        assert!(cq.read(16).unwrap().is_empty());
    }

    #[test]
    fn test_error_blocks_dequeue_until_drained() {
        let cq = cq(CqFormat::Msg, 16);
        cq.enqueue(event(1, 0));
        cq.enqueue(event(2, code::RANGE));
        cq.enqueue(event(3, 0));

        assert!(matches!(cq.read(16), Err(Error::ErrorAvailable)));
        let err = cq.readerr().unwrap();
        assert_eq!(err.context, 2);
        assert_eq!(err.error, code::RANGE);

        let got = cq.read(16).unwrap();
        assert_eq!(got.iter().map(|e| e.context).collect::<Vec<_>>(), [1, 3]);
    }

    #[test]
    fn test_error_backlog_promoted_in_order() {
        let cq = cq(CqFormat::Msg, 16);
        cq.enqueue(event(1, code::BAD_KEY));
        cq.enqueue(event(2, code::ACCESS));
        assert_eq!(cq.readerr().unwrap().context, 1);
        assert!(matches!(cq.read(16), Err(Error::ErrorAvailable)));
        assert_eq!(cq.readerr().unwrap().context, 2);
        assert!(cq.readerr().is_none());
        assert!(cq.read(16).unwrap().is_empty());
    }

    #[test]
    fn test_format_shapes_success_entries() {
        let cq = cq(CqFormat::Context, 4);
        cq.enqueue(event(9, 0));
        let got = cq.read(1).unwrap();
        assert_eq!(got[0].context, 9);
        assert_eq!(got[0].len, 0);
        assert_eq!(got[0].data, 0);

        // Error entries keep full detail regardless of format.
        cq.enqueue(event(10, code::TRUNC));
        let err = cq.readerr().unwrap();
        assert_eq!(err.len, 8);
        assert_eq!(err.data, 5);
    }

    #[test]
    fn test_free_list_exhaustion_counts_overruns() {
        let cq = cq(CqFormat::Msg, 2);
        assert!(cq.enqueue(event(1, 0)));
        assert!(cq.enqueue(event(2, 0)));
        assert!(!cq.enqueue(event(3, 0)));
        assert_eq!(cq.overruns(), 1);

        // Consuming returns slots to the free list.
        cq.read(2).unwrap();
        assert!(cq.enqueue(event(4, 0)));
    }

    #[test]
    fn test_sread_wakes_on_enqueue() {
        let cq = Arc::new(cq(CqFormat::Msg, 8));
        let wait = Arc::new(WaitSet::new(crate::wait::WaitKind::Condvar).unwrap());
        cq.bind_wait(wait);

        let cq2 = cq.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            cq2.enqueue(event(42, 0));
        });
        let got = cq.sread(1, Duration::from_secs(5)).unwrap();
        assert_eq!(got[0].context, 42);
        t.join().unwrap();
    }

    #[test]
    fn test_sread_timeout() {
        let cq = cq(CqFormat::Msg, 8);
        let err = cq.sread(1, Duration::from_millis(5)).unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }
}
