//! Register address map: guest MMIO ranges backed by inaccessible guard
//! regions.
//!
//! Each mapped range reserves host virtual memory at the guest address
//! itself (identity mapping), marked `PROT_NONE`, so driver pointer literals
//! fault straight into the trap engine.
//!
//! The table is append-mostly: entries are published with a release store
//! and never modified afterwards, so the fault path can scan it without
//! taking a lock. `clear` must only run once driver accesses have quiesced.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::{Result, SimError};

/// Maximum number of register ranges.
pub const MAX_REG_MAPPINGS: usize = 32;

const PAGE_SIZE: u64 = 4096;

/// A host virtual-memory reservation covering a guest range.
#[derive(Debug)]
pub struct GuardRegion {
    addr: *mut libc::c_void,
    len: usize,
}

// The raw pointer is only ever passed back to munmap.
unsafe impl Send for GuardRegion {}
unsafe impl Sync for GuardRegion {}

impl GuardRegion {
    /// Reserve `[start, end)` at its own address, page-aligned outward,
    /// with no access permissions.
    fn reserve(start: u32, end: u32) -> Result<Self> {
        let page_start = u64::from(start) & !(PAGE_SIZE - 1);
        let page_end = (u64::from(end) + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let len = (page_end - page_start) as usize;

        // SAFETY: fixed no-replace mapping of anonymous memory; the kernel
        // refuses the placement rather than clobbering an existing mapping.
        let mapped = unsafe {
            libc::mmap(
                page_start as *mut libc::c_void,
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
                -1,
                0,
            )
        };
        if mapped == libc::MAP_FAILED || mapped as u64 != page_start {
            if mapped != libc::MAP_FAILED {
                // SAFETY: we own `mapped` (kernel placed it elsewhere).
                unsafe { libc::munmap(mapped, len) };
            }
            log::error!(
                "addrmap: cannot reserve guard at {:#010x}..{:#010x}: rejected",
                start,
                end
            );
            return Err(SimError::Config);
        }
        Ok(Self { addr: mapped, len })
    }

    fn release(&self) {
        // SAFETY: addr/len came from a successful mmap above.
        unsafe { libc::munmap(self.addr, self.len) };
    }
}

/// One entry of the address map.
#[derive(Debug)]
pub struct RegisterRange {
    pub start: u32,
    /// Exclusive end.
    pub end: u32,
    /// Owning plugin name.
    pub module: String,
    guard: GuardRegion,
}

impl RegisterRange {
    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= u64::from(self.start) && addr < u64::from(self.end)
    }

    fn overlaps(&self, start: u32, end: u32) -> bool {
        start < self.end && self.start < end
    }
}

/// Table of register ranges with lock-free lookup.
pub struct AddressMap {
    slots: [AtomicPtr<RegisterRange>; MAX_REG_MAPPINGS],
    count: AtomicUsize,
    writers: Mutex<()>,
}

impl AddressMap {
    pub const fn new() -> Self {
        const EMPTY: AtomicPtr<RegisterRange> = AtomicPtr::new(ptr::null_mut());
        Self {
            slots: [EMPTY; MAX_REG_MAPPINGS],
            count: AtomicUsize::new(0),
            writers: Mutex::new(()),
        }
    }

    /// Insert a new range owned by `module` and reserve its guard region.
    pub fn add(&self, start: u32, end: u32, module: &str) -> Result<()> {
        if start >= end {
            log::error!("addrmap: empty range {:#010x}..{:#010x}: rejected", start, end);
            return Err(SimError::Config);
        }
        let _guard = self.writers.lock().unwrap();

        let count = self.count.load(Ordering::Acquire);
        if count >= MAX_REG_MAPPINGS {
            log::error!("addrmap: table full ({} ranges): {} rejected", count, module);
            return Err(SimError::Config);
        }
        for i in 0..count {
            let existing = unsafe { &*self.slots[i].load(Ordering::Acquire) };
            if existing.overlaps(start, end) {
                log::error!(
                    "addrmap: {:#010x}..{:#010x} overlaps {} ({:#010x}..{:#010x}): rejected",
                    start,
                    end,
                    existing.module,
                    existing.start,
                    existing.end
                );
                return Err(SimError::Config);
            }
        }

        let guard = GuardRegion::reserve(start, end)?;
        let entry = Box::into_raw(Box::new(RegisterRange {
            start,
            end,
            module: module.to_owned(),
            guard,
        }));
        self.slots[count].store(entry, Ordering::Release);
        self.count.store(count + 1, Ordering::Release);

        log::info!(
            "addrmap: mapped {} [{:#010x}..{:#010x}]",
            module,
            start,
            end
        );
        Ok(())
    }

    /// Find the range containing `addr`.
    ///
    /// Lock-free; safe to call from the fault handler. Linear scan over a
    /// small bounded table.
    pub fn lookup(&self, addr: u64) -> Option<&RegisterRange> {
        let count = self.count.load(Ordering::Acquire);
        for i in 0..count {
            let ptr = self.slots[i].load(Ordering::Acquire);
            // SAFETY: slots below `count` are published, immutable entries.
            let range = unsafe { &*ptr };
            if range.contains(addr) {
                return Some(range);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all ranges and release their guard regions.
    ///
    /// Callers must guarantee no faults are in flight; after this, driver
    /// accesses to the old ranges are genuine crashes.
    pub fn clear(&self) {
        let _guard = self.writers.lock().unwrap();
        let count = self.count.swap(0, Ordering::AcqRel);
        for i in 0..count {
            let ptr = self.slots[i].swap(ptr::null_mut(), Ordering::AcqRel);
            if !ptr.is_null() {
                // SAFETY: pointer came from Box::into_raw in `add`.
                let entry = unsafe { Box::from_raw(ptr) };
                entry.guard.release();
            }
        }
    }
}

impl Default for AddressMap {
    fn default() -> Self {
        Self::new()
    }
}
