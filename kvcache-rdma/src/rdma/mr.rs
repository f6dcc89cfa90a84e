//! Registered memory: scratch buffers owned by the connection and
//! caller-owned ranges registered through [`MrRegistry`].

use super::context::RdmaContext;
use ibverbs_sys::ibv_access_flags;
use kvcache::{KvError, Result};
use std::collections::BTreeMap;
use std::os::raw::c_int;
use std::sync::{Arc, RwLock};

fn access_flags() -> c_int {
    (ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
        | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
        | ibv_access_flags::IBV_ACCESS_REMOTE_READ)
        .0 as c_int
}

/// A heap buffer registered with the device, used as send/receive scratch
/// space.
pub struct RegisteredBuffer {
    mr: *mut ibverbs_sys::ibv_mr,
    ptr: *mut u8,
    size: usize,
    _ctx: Arc<RdmaContext>,
}

unsafe impl Send for RegisteredBuffer {}
unsafe impl Sync for RegisteredBuffer {}

impl RegisteredBuffer {
    /// Allocate and register `size` zeroed bytes.
    pub fn new(ctx: &Arc<RdmaContext>, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(KvError::InvalidRequest("scratch buffer of 0 bytes".into()));
        }
        let ptr = Box::into_raw(vec![0u8; size].into_boxed_slice()) as *mut u8;
        let mr = unsafe { ibverbs_sys::ibv_reg_mr(ctx.pd(), ptr as *mut _, size, access_flags()) };
        if mr.is_null() {
            let err = std::io::Error::last_os_error();
            unsafe {
                drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(ptr, size)));
            }
            return Err(KvError::device_with_source(
                format!("ibv_reg_mr failed for scratch buffer of {size} bytes"),
                err,
            ));
        }
        Ok(Self {
            mr,
            ptr,
            size,
            _ctx: Arc::clone(ctx),
        })
    }

    pub fn lkey(&self) -> u32 {
        unsafe { (*self.mr).lkey }
    }

    pub fn addr(&self) -> u64 {
        self.ptr as u64
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.size) }
    }
}

impl AsRef<[u8]> for RegisteredBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl Drop for RegisteredBuffer {
    fn drop(&mut self) {
        unsafe {
            if !self.mr.is_null() {
                ibverbs_sys::ibv_dereg_mr(self.mr);
            }
            if !self.ptr.is_null() {
                drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                    self.ptr, self.size,
                )));
            }
        }
    }
}

/// Key material of a caller-owned registered range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignRegion {
    pub base: u64,
    pub len: usize,
    pub lkey: u32,
    pub rkey: u32,
}

impl ForeignRegion {
    pub fn end(&self) -> u64 {
        self.base + self.len as u64
    }

    /// Whether `[addr, addr + len)` lies inside this region.
    pub fn contains(&self, addr: u64, len: usize) -> bool {
        addr >= self.base
            && addr
                .checked_add(len as u64)
                .is_some_and(|end| end <= self.end())
    }
}

/// Non-overlapping regions ordered by base address.
#[derive(Debug, Default)]
pub struct RegionIndex {
    regions: BTreeMap<u64, ForeignRegion>,
}

impl RegionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, base: u64) -> Option<ForeignRegion> {
        self.regions.get(&base).copied()
    }

    /// First existing region that intersects `[base, base + len)`.
    pub fn overlapping(&self, base: u64, len: usize) -> Option<ForeignRegion> {
        let end = base.saturating_add(len as u64);
        if let Some((_, below)) = self.regions.range(..=base).next_back() {
            if below.end() > base {
                return Some(*below);
            }
        }
        self.regions
            .range(base..end)
            .next()
            .map(|(_, r)| *r)
    }

    pub fn insert(&mut self, region: ForeignRegion) -> Result<()> {
        if let Some(other) = self.overlapping(region.base, region.len) {
            return Err(KvError::InvalidRequest(format!(
                "range {:#x}+{} overlaps registered region {:#x}+{}",
                region.base, region.len, other.base, other.len
            )));
        }
        self.regions.insert(region.base, region);
        Ok(())
    }

    /// The region that fully contains `[addr, addr + len)`.
    pub fn lookup(&self, addr: u64, len: usize) -> Result<ForeignRegion> {
        self.regions
            .range(..=addr)
            .next_back()
            .map(|(_, r)| *r)
            .filter(|r| r.contains(addr, len))
            .ok_or(KvError::NotRegistered { addr, len })
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

struct MrHandle(*mut ibverbs_sys::ibv_mr);

unsafe impl Send for MrHandle {}
unsafe impl Sync for MrHandle {}

impl Drop for MrHandle {
    fn drop(&mut self) {
        unsafe {
            ibverbs_sys::ibv_dereg_mr(self.0);
        }
    }
}

#[derive(Default)]
struct Registered {
    index: RegionIndex,
    handles: Vec<MrHandle>,
}

/// Caller-owned ranges registered for the lifetime of the connection.
///
/// Registration is idempotent per base address. Regions are deregistered
/// only when the registry is dropped.
pub struct MrRegistry {
    inner: RwLock<Registered>,
    ctx: Arc<RdmaContext>,
}

impl MrRegistry {
    pub fn new(ctx: Arc<RdmaContext>) -> Self {
        Self {
            inner: RwLock::new(Registered::default()),
            ctx,
        }
    }

    /// Register `[ptr, ptr + len)` for local and remote access.
    ///
    /// # Safety
    ///
    /// The range must stay allocated until the connection is closed.
    pub unsafe fn register(&self, ptr: *mut u8, len: usize) -> Result<ForeignRegion> {
        if ptr.is_null() || len == 0 {
            return Err(KvError::InvalidRequest(format!(
                "cannot register {ptr:p}+{len}"
            )));
        }
        let base = ptr as u64;
        let mut inner = self
            .inner
            .write()
            .map_err(|_| KvError::LockPoisoned("mr registry"))?;

        if let Some(existing) = inner.index.get(base) {
            if len <= existing.len {
                tracing::debug!(base = format_args!("{base:#x}"), len, "memory already registered");
                return Ok(existing);
            }
            return Err(KvError::InvalidRequest(format!(
                "{base:#x} already registered with {} bytes, asked for {len}",
                existing.len
            )));
        }
        if let Some(other) = inner.index.overlapping(base, len) {
            return Err(KvError::InvalidRequest(format!(
                "range {base:#x}+{len} overlaps registered region {:#x}+{}",
                other.base, other.len
            )));
        }

        let mr = unsafe { ibverbs_sys::ibv_reg_mr(self.ctx.pd(), ptr as *mut _, len, access_flags()) };
        if mr.is_null() {
            return Err(KvError::device_with_source(
                format!("ibv_reg_mr failed for {base:#x}+{len}"),
                std::io::Error::last_os_error(),
            ));
        }
        let handle = MrHandle(mr);
        let region = unsafe {
            ForeignRegion {
                base,
                len,
                lkey: (*mr).lkey,
                rkey: (*mr).rkey,
            }
        };
        inner.index.insert(region)?;
        inner.handles.push(handle);
        tracing::info!(
            base = format_args!("{base:#x}"),
            len,
            rkey = region.rkey,
            "registered memory region"
        );
        Ok(region)
    }

    /// The registration covering `[addr, addr + len)`.
    pub fn lookup(&self, addr: u64, len: usize) -> Result<ForeignRegion> {
        self.inner
            .read()
            .map_err(|_| KvError::LockPoisoned("mr registry"))?
            .index
            .lookup(addr, len)
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.index.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(base: u64, len: usize) -> ForeignRegion {
        ForeignRegion {
            base,
            len,
            lkey: 1,
            rkey: 2,
        }
    }

    #[test]
    fn test_lookup_inside_region() {
        let mut idx = RegionIndex::new();
        idx.insert(region(0x1000, 0x400_000)).unwrap();
        idx.insert(region(0x1000_0000, 0x1000)).unwrap();

        let r = idx.lookup(0x1000 + 15 * 0x40000, 0x40000).unwrap();
        assert_eq!(r.base, 0x1000);
        assert_eq!(idx.lookup(0x1000_0800, 0x800).unwrap().base, 0x1000_0000);
    }

    #[test]
    fn test_lookup_past_end() {
        let mut idx = RegionIndex::new();
        idx.insert(region(0x1000, 0x1000)).unwrap();
        assert!(matches!(
            idx.lookup(0x1800, 0x1000),
            Err(KvError::NotRegistered {
                addr: 0x1800,
                len: 0x1000
            })
        ));
        assert!(idx.lookup(0x500, 1).is_err());
        assert!(idx.lookup(u64::MAX - 1, 16).is_err());
    }

    #[test]
    fn test_overlap_rejected() {
        let mut idx = RegionIndex::new();
        idx.insert(region(0x1000, 0x1000)).unwrap();
        assert!(idx.insert(region(0x1800, 0x1000)).is_err());
        assert!(idx.insert(region(0x800, 0x1000)).is_err());
        idx.insert(region(0x2000, 0x1000)).unwrap();
        assert_eq!(idx.len(), 2);
    }

    #[test]
    fn test_contains() {
        let r = region(100, 50);
        assert!(r.contains(100, 50));
        assert!(r.contains(120, 10));
        assert!(!r.contains(120, 40));
        assert!(!r.contains(99, 1));
    }
}
