//! Accessible guest RAM windows.
//!
//! DMA source/destination registers are 32-bit, so transfer buffers must
//! live at low, identity-mapped host addresses. A guest RAM window is an
//! ordinary read/write anonymous mapping placed at its guest address; it is
//! not trapped and drivers access it at full speed.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::{Result, SimError};

/// Maximum number of guest RAM windows.
pub const MAX_RAM_WINDOWS: usize = 4;

#[derive(Debug)]
struct RamWindow {
    start: u32,
    /// Exclusive end.
    end: u32,
    len: usize,
}

/// Table of guest RAM windows.
pub struct GuestRam {
    slots: [AtomicPtr<RamWindow>; MAX_RAM_WINDOWS],
    count: AtomicUsize,
    writers: Mutex<()>,
}

impl GuestRam {
    pub const fn new() -> Self {
        const EMPTY: AtomicPtr<RamWindow> = AtomicPtr::new(ptr::null_mut());
        Self {
            slots: [EMPTY; MAX_RAM_WINDOWS],
            count: AtomicUsize::new(0),
            writers: Mutex::new(()),
        }
    }

    /// Map `[start, start+len)` as accessible RAM at its own address.
    /// `start` must be page-aligned.
    pub fn map(&self, start: u32, len: u32) -> Result<()> {
        if len == 0 || start % 4096 != 0 {
            log::error!(
                "guest-ram: invalid window {:#010x}+{:#x}: rejected",
                start,
                len
            );
            return Err(SimError::Config);
        }
        let _guard = self.writers.lock().unwrap();
        let count = self.count.load(Ordering::Acquire);
        if count >= MAX_RAM_WINDOWS {
            log::error!("guest-ram: window table full: {:#010x} rejected", start);
            return Err(SimError::Config);
        }

        // SAFETY: fixed no-replace anonymous mapping, same contract as the
        // guard regions but readable and writable.
        let mapped = unsafe {
            libc::mmap(
                start as u64 as *mut libc::c_void,
                len as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
                -1,
                0,
            )
        };
        if mapped == libc::MAP_FAILED || mapped as u64 != u64::from(start) {
            if mapped != libc::MAP_FAILED {
                unsafe { libc::munmap(mapped, len as usize) };
            }
            log::error!(
                "guest-ram: cannot place window at {:#010x}: rejected",
                start
            );
            return Err(SimError::Config);
        }

        let window = Box::into_raw(Box::new(RamWindow {
            start,
            end: start + len,
            len: len as usize,
        }));
        self.slots[count].store(window, Ordering::Release);
        self.count.store(count + 1, Ordering::Release);
        log::info!("guest-ram: mapped {:#010x}..{:#010x}", start, start + len);
        Ok(())
    }

    /// True when the whole span `[addr, addr+len)` lies inside one window.
    pub fn contains_span(&self, addr: u32, len: u32) -> bool {
        let end = match addr.checked_add(len) {
            Some(e) => e,
            None => return false,
        };
        let count = self.count.load(Ordering::Acquire);
        for i in 0..count {
            // SAFETY: slots below `count` are published, immutable entries.
            let w = unsafe { &*self.slots[i].load(Ordering::Acquire) };
            if addr >= w.start && end <= w.end {
                return true;
            }
        }
        false
    }

    /// Unmap every window.
    pub fn clear(&self) {
        let _guard = self.writers.lock().unwrap();
        let count = self.count.swap(0, Ordering::AcqRel);
        for i in 0..count {
            let ptr = self.slots[i].swap(ptr::null_mut(), Ordering::AcqRel);
            if !ptr.is_null() {
                // SAFETY: pointer came from Box::into_raw in `map`.
                let w = unsafe { Box::from_raw(ptr) };
                unsafe { libc::munmap(w.start as u64 as *mut libc::c_void, w.len) };
            }
        }
    }
}

impl Default for GuestRam {
    fn default() -> Self {
        Self::new()
    }
}
