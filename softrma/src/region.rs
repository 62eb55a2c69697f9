//! Registered memory regions and the per-domain region registry.
//!
//! Every remote access names a registration key; the responder resolves the
//! key, checks the requested rights against the region's rights mask, and
//! checks that the whole requested range falls inside one registered
//! segment. A failed check turns the request into an error reply, never a
//! retry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cntr::Counter;
use crate::error::{Error, Result};

bitflags::bitflags! {
    /// Access rights of a registered region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const REMOTE_READ = 1 << 2;
        const REMOTE_WRITE = 1 << 3;
    }
}

/// One contiguous address range of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub addr: u64,
    pub len: usize,
}

/// Registration descriptor.
pub struct RegionDesc {
    /// Address ranges covered by the region (at least one).
    pub segments: Vec<Segment>,
    /// Rights granted to local and remote accesses.
    pub access: Access,
    /// Key remote peers use to name this region.
    pub requested_key: u64,
    /// Offset added to incoming addresses before range checking, for
    /// offset-addressed registrations. Zero for plain virtual addressing.
    pub offset: u64,
    /// Counter ticked once per applied remote access.
    pub cntr: Option<Arc<Counter>>,
}

impl RegionDesc {
    /// Descriptor for a single virtually-addressed segment.
    pub fn new(addr: u64, len: usize, access: Access, requested_key: u64) -> Self {
        Self {
            segments: vec![Segment { addr, len }],
            access,
            requested_key,
            offset: 0,
            cntr: None,
        }
    }

    /// Attach a remote-access counter.
    pub fn with_cntr(mut self, cntr: Arc<Counter>) -> Self {
        self.cntr = Some(cntr);
        self
    }
}

/// A registered memory region.
pub struct MemoryRegion {
    key: u64,
    access: Access,
    offset: u64,
    segments: Vec<Segment>,
    cntr: Mutex<Option<Arc<Counter>>>,
}

impl std::fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("key", &self.key)
            .field("access", &self.access)
            .field("offset", &self.offset)
            .field("segments", &self.segments)
            .finish_non_exhaustive()
    }
}

impl MemoryRegion {
    /// The registration key.
    pub fn key(&self) -> u64 {
        self.key
    }

    /// The rights mask.
    pub fn access(&self) -> Access {
        self.access
    }

    /// Bind or replace the remote-access counter.
    pub fn bind_cntr(&self, cntr: Arc<Counter>) {
        *self.cntr.lock() = Some(cntr);
    }

    pub(crate) fn cntr(&self) -> Option<Arc<Counter>> {
        self.cntr.lock().clone()
    }

    /// Validate an access of `len` bytes at `addr` with the given rights.
    ///
    /// Returns the effective address (after the registration offset) the
    /// access may touch. Fails with a permission error if `access` is not a
    /// subset of the region's rights, and with a range error if
    /// [addr, addr+len) is not fully contained in one segment.
    pub fn validate(&self, addr: u64, len: usize, access: Access) -> Result<u64> {
        if !self.access.contains(access) {
            return Err(Error::AccessDenied {
                requested: access,
                allowed: self.access,
            });
        }
        let addr = addr.wrapping_add(self.offset);
        let end = addr
            .checked_add(len as u64)
            .ok_or(Error::OutOfRange { addr, len })?;
        for seg in &self.segments {
            if addr >= seg.addr && end <= seg.addr + seg.len as u64 {
                return Ok(addr);
            }
        }
        Err(Error::OutOfRange { addr, len })
    }
}

/// Keyed lookup table of registered regions.
#[derive(Default)]
pub struct MrRegistry {
    map: Mutex<HashMap<u64, Arc<MemoryRegion>>>,
}

impl MrRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a region under its requested key.
    pub fn register(&self, desc: RegionDesc) -> Result<Arc<MemoryRegion>> {
        if desc.segments.is_empty() {
            return Err(Error::InvalidArg("region has no segments"));
        }
        let mut map = self.map.lock();
        if map.contains_key(&desc.requested_key) {
            return Err(Error::KeyInUse(desc.requested_key));
        }
        let region = Arc::new(MemoryRegion {
            key: desc.requested_key,
            access: desc.access,
            offset: desc.offset,
            segments: desc.segments,
            cntr: Mutex::new(desc.cntr),
        });
        map.insert(region.key, region.clone());
        Ok(region)
    }

    /// Resolve a key to its region.
    pub fn lookup(&self, key: u64) -> Option<Arc<MemoryRegion>> {
        self.map.lock().get(&key).cloned()
    }

    /// Remove a registration.
    pub fn deregister(&self, key: u64) -> Result<()> {
        self.map
            .lock()
            .remove(&key)
            .map(|_| ())
            .ok_or(Error::BadKey(key))
    }

    /// Resolve and validate in one step, as the protocol handlers do.
    pub fn validate(
        &self,
        key: u64,
        addr: u64,
        len: usize,
        access: Access,
    ) -> Result<(Arc<MemoryRegion>, u64)> {
        let region = self.lookup(key).ok_or(Error::BadKey(key))?;
        let eff = region.validate(addr, len, access)?;
        Ok((region, eff))
    }
}
