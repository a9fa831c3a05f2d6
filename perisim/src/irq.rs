//! IRQ table: numbered interrupt lines with a handler and an enable bit.
//!
//! Delivery happens in signal context, so every slot field is an atomic and
//! the delivery path never takes a lock. Handlers are plain `fn()` and must
//! confine themselves to atomic state; they run on whichever thread the host
//! picked for signal delivery.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::{Result, SimError};

/// Maximum number of registered IRQ lines.
pub const MAX_INTERRUPTS: usize = 32;

/// An interrupt handler. Runs in signal context; atomics only.
pub type IrqHandler = fn();

const NO_IRQ: u32 = u32::MAX;

struct IrqSlot {
    irq: AtomicU32,
    /// `IrqHandler` stored as a raw address; 0 means none.
    handler: AtomicUsize,
    enabled: AtomicBool,
}

impl IrqSlot {
    const fn empty() -> Self {
        Self {
            irq: AtomicU32::new(NO_IRQ),
            handler: AtomicUsize::new(0),
            enabled: AtomicBool::new(false),
        }
    }
}

/// Fixed-capacity IRQ table.
pub struct IrqTable {
    slots: [IrqSlot; MAX_INTERRUPTS],
    count: AtomicUsize,
    writers: Mutex<()>,
}

impl IrqTable {
    pub const fn new() -> Self {
        const EMPTY: IrqSlot = IrqSlot::empty();
        Self {
            slots: [EMPTY; MAX_INTERRUPTS],
            count: AtomicUsize::new(0),
            writers: Mutex::new(()),
        }
    }

    fn find(&self, irq: u32) -> Option<&IrqSlot> {
        let count = self.count.load(Ordering::Acquire);
        self.slots[..count]
            .iter()
            .find(|s| s.irq.load(Ordering::Acquire) == irq)
    }

    /// Insert or replace the handler for `irq`; enables the line.
    pub fn register(&self, irq: u32, handler: IrqHandler) -> Result<()> {
        let _guard = self.writers.lock().unwrap();

        if let Some(slot) = self.find(irq) {
            log::warn!("irq: handler for IRQ {} replaced", irq);
            slot.handler.store(handler as usize, Ordering::Release);
            slot.enabled.store(true, Ordering::Release);
            return Ok(());
        }

        let count = self.count.load(Ordering::Acquire);
        if count >= MAX_INTERRUPTS {
            log::error!("irq: table full: IRQ {} rejected", irq);
            return Err(SimError::Config);
        }
        let slot = &self.slots[count];
        slot.handler.store(handler as usize, Ordering::Release);
        slot.enabled.store(true, Ordering::Release);
        // Publishing the irq number last makes the slot visible atomically
        // to the lock-free delivery path.
        slot.irq.store(irq, Ordering::Release);
        self.count.store(count + 1, Ordering::Release);
        log::info!("irq: registered handler for IRQ {}", irq);
        Ok(())
    }

    pub fn enable(&self, irq: u32) -> Result<()> {
        match self.find(irq) {
            Some(slot) => {
                slot.enabled.store(true, Ordering::Release);
                log::debug!("irq: IRQ {} enabled", irq);
                Ok(())
            }
            None => {
                log::warn!("irq: enable of unknown IRQ {}: not found", irq);
                Err(SimError::NotFound)
            }
        }
    }

    pub fn disable(&self, irq: u32) -> Result<()> {
        match self.find(irq) {
            Some(slot) => {
                slot.enabled.store(false, Ordering::Release);
                log::debug!("irq: IRQ {} disabled", irq);
                Ok(())
            }
            None => {
                log::warn!("irq: disable of unknown IRQ {}: not found", irq);
                Err(SimError::NotFound)
            }
        }
    }

    /// Deliver `irq`: call its handler if one is registered and enabled.
    ///
    /// Runs in signal context. A disabled line swallows the interrupt; an
    /// unknown line reports `NotFound`.
    pub fn deliver(&self, irq: u32) -> Result<()> {
        let slot = match self.find(irq) {
            Some(s) => s,
            None => {
                log::warn!("irq: delivery of unknown IRQ {}: dropped", irq);
                return Err(SimError::NotFound);
            }
        };
        if !slot.enabled.load(Ordering::Acquire) {
            log::debug!("irq: IRQ {} disabled: dropped", irq);
            return Ok(());
        }
        let raw = slot.handler.load(Ordering::Acquire);
        if raw == 0 {
            log::warn!("irq: IRQ {} has no handler: dropped", irq);
            return Err(SimError::NotFound);
        }
        // SAFETY: the address was stored from an `IrqHandler` in `register`.
        let handler: IrqHandler = unsafe { std::mem::transmute(raw) };
        handler();
        Ok(())
    }

    /// Forget every registered line.
    pub fn clear(&self) {
        let _guard = self.writers.lock().unwrap();
        let count = self.count.swap(0, Ordering::AcqRel);
        for slot in &self.slots[..count] {
            slot.irq.store(NO_IRQ, Ordering::Release);
            slot.handler.store(0, Ordering::Release);
            slot.enabled.store(false, Ordering::Release);
        }
    }
}

impl Default for IrqTable {
    fn default() -> Self {
        Self::new()
    }
}
