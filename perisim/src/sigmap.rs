//! Signal map: binds OS signal numbers to `(plugin, IRQ)` pairs.
//!
//! Plugins raise interrupts by asking for the signal bound to their
//! `(module, irq)`; the installed handler resolves the incoming signal back
//! to the IRQ number and hands it to the IRQ table. The handler itself is a
//! minimal trampoline: one lock-free table scan plus the atomic-only
//! delivery path.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::{Result, SimError};

/// Maximum number of signal bindings.
pub const MAX_SIGNAL_MAPPINGS: usize = 16;

#[derive(Debug)]
struct SignalBinding {
    signal: i32,
    module: String,
    irq: u32,
}

/// Table of signal bindings with lock-free resolution.
pub struct SignalMap {
    slots: [AtomicPtr<SignalBinding>; MAX_SIGNAL_MAPPINGS],
    count: AtomicUsize,
    writers: Mutex<()>,
}

extern "C" fn irq_signal_handler(
    signal: libc::c_int,
    _info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    let sim = crate::simulator();
    match sim.signal_map().irq_for_signal(signal) {
        Some(irq) => {
            log::debug!("sigmap: signal {} -> IRQ {}", signal, irq);
            let _ = sim.irq_table().deliver(irq);
        }
        None => log::warn!("sigmap: signal {} has no binding: dropped", signal),
    }
}

impl SignalMap {
    pub const fn new() -> Self {
        const EMPTY: AtomicPtr<SignalBinding> = AtomicPtr::new(ptr::null_mut());
        Self {
            slots: [EMPTY; MAX_SIGNAL_MAPPINGS],
            count: AtomicUsize::new(0),
            writers: Mutex::new(()),
        }
    }

    /// Bind `signal` to `(module, irq)` and install the handler for it.
    /// Rebinding an already-bound signal replaces the old binding.
    pub fn add(&self, signal: i32, module: &str, irq: u32) -> Result<()> {
        if signal <= 0 || signal >= libc::SIGRTMAX() {
            log::error!("sigmap: invalid signal {}: rejected", signal);
            return Err(SimError::Config);
        }
        let _guard = self.writers.lock().unwrap();

        let count = self.count.load(Ordering::Acquire);
        for i in 0..count {
            let slot = &self.slots[i];
            // SAFETY: slots below `count` are always populated.
            let existing = unsafe { &*slot.load(Ordering::Acquire) };
            if existing.signal == signal {
                log::warn!(
                    "sigmap: signal {} rebound from {} IRQ {} to {} IRQ {}",
                    signal,
                    existing.module,
                    existing.irq,
                    module,
                    irq
                );
                let binding = Box::into_raw(Box::new(SignalBinding {
                    signal,
                    module: module.to_owned(),
                    irq,
                }));
                let old = slot.swap(binding, Ordering::AcqRel);
                // SAFETY: `old` came from Box::into_raw and is unreachable
                // once swapped out. Bindings are only replaced during
                // configuration, before signals for them are in flight.
                drop(unsafe { Box::from_raw(old) });
                return Ok(());
            }
        }

        if count >= MAX_SIGNAL_MAPPINGS {
            log::error!("sigmap: table full: signal {} rejected", signal);
            return Err(SimError::Config);
        }

        install_handler(signal)?;
        let binding = Box::into_raw(Box::new(SignalBinding {
            signal,
            module: module.to_owned(),
            irq,
        }));
        self.slots[count].store(binding, Ordering::Release);
        self.count.store(count + 1, Ordering::Release);
        log::info!("sigmap: signal {} -> {} IRQ {}", signal, module, irq);
        Ok(())
    }

    /// Resolve an incoming signal to its IRQ number. Lock-free.
    pub fn irq_for_signal(&self, signal: i32) -> Option<u32> {
        let count = self.count.load(Ordering::Acquire);
        for i in 0..count {
            // SAFETY: slots below `count` are always populated.
            let binding = unsafe { &*self.slots[i].load(Ordering::Acquire) };
            if binding.signal == signal {
                return Some(binding.irq);
            }
        }
        None
    }

    /// Raise the interrupt bound to `(module, irq)` by signalling the
    /// current process. First matching binding wins.
    pub fn trigger(&self, module: &str, irq: u32) -> Result<()> {
        let count = self.count.load(Ordering::Acquire);
        for i in 0..count {
            // SAFETY: slots below `count` are always populated.
            let binding = unsafe { &*self.slots[i].load(Ordering::Acquire) };
            if binding.module == module && binding.irq == irq {
                log::debug!(
                    "sigmap: raising signal {} for {} IRQ {}",
                    binding.signal,
                    module,
                    irq
                );
                // SAFETY: plain kill(2) to our own pid.
                unsafe { libc::kill(libc::getpid(), binding.signal) };
                return Ok(());
            }
        }
        log::warn!("sigmap: no binding for {} IRQ {}: not raised", module, irq);
        Err(SimError::NotFound)
    }

    /// Drop all bindings and restore the default disposition of their
    /// signals.
    pub fn clear(&self) {
        let _guard = self.writers.lock().unwrap();
        let count = self.count.swap(0, Ordering::AcqRel);
        for i in 0..count {
            let ptr = self.slots[i].swap(ptr::null_mut(), Ordering::AcqRel);
            if !ptr.is_null() {
                // SAFETY: pointer came from Box::into_raw in `add`.
                let binding = unsafe { Box::from_raw(ptr) };
                restore_default(binding.signal);
            }
        }
    }
}

impl Default for SignalMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Block the whole real-time signal range in the calling thread.
///
/// Plugin workers call this on startup so interrupt signals are always
/// delivered to driver threads. A worker interrupted while holding its own
/// state lock could otherwise deadlock against a handler that reads the
/// plugin's registers.
pub(crate) fn block_rt_signals_for_current_thread() {
    // SAFETY: building a sigset and masking it for this thread only.
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        let mut signal = libc::SIGRTMIN();
        while signal <= libc::SIGRTMAX() {
            libc::sigaddset(&mut set, signal);
            signal += 1;
        }
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
    }
}

fn install_handler(signal: i32) -> Result<()> {
    // SAFETY: standard sigaction setup; the handler only touches atomic
    // simulator state.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = irq_signal_handler as usize;
        sa.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut sa.sa_mask);
        if libc::sigaction(signal, &sa, ptr::null_mut()) != 0 {
            log::error!("sigmap: sigaction({}) failed: rejected", signal);
            return Err(SimError::Config);
        }
    }
    Ok(())
}

fn restore_default(signal: i32) {
    // SAFETY: resetting to SIG_DFL is always valid for catchable signals.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(signal, &sa, ptr::null_mut());
    }
}
