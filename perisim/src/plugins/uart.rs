//! UART peripheral model with a PrimeCell-style register window.
//!
//! The control register's enable bit drives the state machine: while
//! enabled, a background worker synthesises one receive byte (`'A'`, `'B'`,
//! …) every few ticks into the RX FIFO and raises the RX IRQ. Data-register
//! writes count as transmissions and raise the TX IRQ.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bitflags::bitflags;

use crate::error::{Result, SimError};
use crate::plugin::{instance_index, Peripheral};
use crate::protocol::{ClockAction, ResetAction};

/// First UART instance base; instance `i` sits at `BASE + i * WINDOW`.
pub const UART_BASE: u32 = 0x4000_2000;
/// Register window size per instance.
pub const UART_WINDOW: u32 = 0x1000;
/// Bytes of the window that hold registers.
pub const UART_REG_SPAN: u32 = 0x50;

/// Default TX-complete IRQ.
pub const UART_IRQ_TX: u32 = 5;
/// Default RX-available IRQ.
pub const UART_IRQ_RX: u32 = 6;

/// RX FIFO capacity in bytes.
pub const FIFO_CAPACITY: usize = 256;

/// Worker ticks between synthetic RX bytes.
const RX_PERIOD_TICKS: u64 = 5;

/// Register offsets within the instance window.
mod offsets {
    pub const DR: u32 = 0x00;
    pub const RSR_ECR: u32 = 0x04;
    pub const FR: u32 = 0x18;
    pub const ILPR: u32 = 0x20;
    pub const IBRD: u32 = 0x24;
    pub const FBRD: u32 = 0x28;
    pub const LCR_H: u32 = 0x2C;
    pub const CR: u32 = 0x30;
    pub const IFLS: u32 = 0x34;
    pub const IMSC: u32 = 0x38;
    pub const RIS: u32 = 0x3C;
    pub const MIS: u32 = 0x40;
    pub const ICR: u32 = 0x44;
    pub const DMACR: u32 = 0x48;
}

bitflags! {
    /// Flag register bits (FR).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FlagBits: u32 {
        /// UART busy.
        const BUSY = 1 << 3;
        /// Receive FIFO empty.
        const RXFE = 1 << 4;
        /// Transmit FIFO full.
        const TXFF = 1 << 5;
    }
}

bitflags! {
    /// Control register bits (CR).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ControlBits: u32 {
        /// UART enable.
        const UARTEN = 1 << 0;
        /// Transmit enable.
        const TXE = 1 << 8;
        /// Receive enable.
        const RXE = 1 << 9;
    }
}

bitflags! {
    /// DMA control register bits (DMACR).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DmaControlBits: u32 {
        /// Receive DMA enable.
        const RXDMAE = 1 << 0;
        /// Transmit DMA enable.
        const TXDMAE = 1 << 1;
        /// DMA on error.
        const DMAONERR = 1 << 2;
    }
}

struct UartState {
    flags: FlagBits,
    ctrl: u32,
    dmacr: u32,
    imsc: u32,
    rx_fifo: [u8; FIFO_CAPACITY],
    rx_head: usize,
    rx_tail: usize,
    tx_count: u32,
    ticks: u64,
    rx_seq: u32,
}

impl UartState {
    fn idle() -> Self {
        Self {
            flags: FlagBits::RXFE,
            ctrl: 0,
            dmacr: 0,
            imsc: 0,
            rx_fifo: [0; FIFO_CAPACITY],
            rx_head: 0,
            rx_tail: 0,
            tx_count: 0,
            ticks: 0,
            rx_seq: 0,
        }
    }

    fn fifo_is_empty(&self) -> bool {
        self.rx_head == self.rx_tail
    }

    fn push_rx(&mut self, byte: u8) {
        let next = (self.rx_head + 1) % FIFO_CAPACITY;
        if next == self.rx_tail {
            return; // full; drop, the flag register already says so
        }
        self.rx_fifo[self.rx_head] = byte;
        self.rx_head = next;
        self.flags.remove(FlagBits::RXFE);
    }

    fn pop_rx(&mut self) -> Option<u8> {
        if self.fifo_is_empty() {
            return None;
        }
        let byte = self.rx_fifo[self.rx_tail];
        self.rx_tail = (self.rx_tail + 1) % FIFO_CAPACITY;
        if self.fifo_is_empty() {
            self.flags.insert(FlagBits::RXFE);
        }
        Some(byte)
    }

    fn enabled(&self) -> bool {
        self.ctrl & ControlBits::UARTEN.bits() != 0
    }
}

struct UartShared {
    name: String,
    base: u32,
    state: Mutex<UartState>,
    running: AtomicBool,
    shutdown: Mutex<bool>,
    wake: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
    tick: Duration,
}

impl UartShared {
    /// One model step. Shared by the worker loop and `clock(Tick)`.
    fn step(&self) {
        let mut raise_rx = false;
        {
            let mut st = self.state.lock().unwrap();
            st.ticks += 1;
            if st.enabled() && st.ticks % RX_PERIOD_TICKS == 0 && st.fifo_is_empty() {
                let byte = b'A' + (st.rx_seq % 26) as u8;
                st.push_rx(byte);
                st.rx_seq += 1;
                log::debug!(
                    "{}: synthetic rx {:#04x} ({})",
                    self.name,
                    byte,
                    byte as char
                );
                raise_rx = true;
            }
        }
        // State is published before the IRQ that makes the driver look.
        if raise_rx {
            let _ = crate::trigger_interrupt(&self.name, UART_IRQ_RX);
        }
    }

    fn start_worker(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.shutdown.lock().unwrap() = false;
        let shared = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("{}-worker", self.name))
            .spawn(move || {
                crate::sigmap::block_rt_signals_for_current_thread();
                log::debug!("{}: worker started", shared.name);
                let mut stop = shared.shutdown.lock().unwrap();
                while !*stop {
                    let (guard, timeout) =
                        shared.wake.wait_timeout(stop, shared.tick).unwrap();
                    stop = guard;
                    if *stop {
                        break;
                    }
                    if timeout.timed_out() {
                        drop(stop);
                        shared.step();
                        stop = shared.shutdown.lock().unwrap();
                    }
                }
                log::debug!("{}: worker stopped", shared.name);
            })
            .expect("spawn uart worker");
        *self.worker.lock().unwrap() = Some(handle);
    }

    fn stop_worker(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        *self.shutdown.lock().unwrap() = true;
        self.wake.notify_all();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// PL011-flavoured UART model.
pub struct UartPlugin {
    shared: Arc<UartShared>,
}

/// Observation handle for tests and host-side tooling.
#[derive(Clone)]
pub struct UartHandle {
    shared: Arc<UartShared>,
}

impl UartHandle {
    /// Bytes transmitted through the data register since reset.
    pub fn tx_count(&self) -> u32 {
        self.shared.state.lock().unwrap().tx_count
    }

    /// True while the RX FIFO holds data.
    pub fn rx_ready(&self) -> bool {
        !self
            .shared
            .state
            .lock()
            .unwrap()
            .flags
            .contains(FlagBits::RXFE)
    }
}

impl UartPlugin {
    /// Create an instance named e.g. `uart0`; the trailing index selects the
    /// register window at `UART_BASE + i * UART_WINDOW`.
    pub fn new(name: &str) -> Self {
        Self::with_tick(name, Duration::from_secs(1))
    }

    /// Like [`UartPlugin::new`] with an explicit worker tick period.
    pub fn with_tick(name: &str, tick: Duration) -> Self {
        let base = UART_BASE + instance_index(name) * UART_WINDOW;
        Self {
            shared: Arc::new(UartShared {
                name: name.to_owned(),
                base,
                state: Mutex::new(UartState::idle()),
                running: AtomicBool::new(false),
                shutdown: Mutex::new(false),
                wake: Condvar::new(),
                worker: Mutex::new(None),
                tick,
            }),
        }
    }

    /// The instance's register window base address.
    pub fn base(&self) -> u32 {
        self.shared.base
    }

    pub fn handle(&self) -> UartHandle {
        UartHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    fn write_ctrl(&self, value: u32) {
        let was_enabled;
        {
            let mut st = self.shared.state.lock().unwrap();
            was_enabled = st.enabled();
            st.ctrl = value;
        }
        let now_enabled = value & ControlBits::UARTEN.bits() != 0;
        log::info!("{}: control register set: {:#010x}", self.shared.name, value);
        if now_enabled && !was_enabled {
            self.shared.start_worker();
        } else if !now_enabled && was_enabled {
            self.shared.stop_worker();
        }
    }

    fn write_dmacr(&self, value: u32) {
        let old;
        {
            let mut st = self.shared.state.lock().unwrap();
            old = DmaControlBits::from_bits_truncate(st.dmacr);
            st.dmacr = value;
        }
        let new = DmaControlBits::from_bits_truncate(value);
        let diff = old ^ new;
        if diff.contains(DmaControlBits::TXDMAE) {
            log::info!(
                "{}: tx dma {}",
                self.shared.name,
                if new.contains(DmaControlBits::TXDMAE) { "enabled" } else { "disabled" }
            );
        }
        if diff.contains(DmaControlBits::RXDMAE) {
            log::info!(
                "{}: rx dma {}",
                self.shared.name,
                if new.contains(DmaControlBits::RXDMAE) { "enabled" } else { "disabled" }
            );
        }
    }
}

impl Peripheral for UartPlugin {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn init(&self) -> Result<()> {
        log::info!(
            "{}: uart initialised at {:#010x}",
            self.shared.name,
            self.shared.base
        );
        Ok(())
    }

    fn cleanup(&self) {
        self.shared.stop_worker();
        log::info!("{}: uart cleaned up", self.shared.name);
    }

    fn reset(&self, action: ResetAction) -> Result<()> {
        match action {
            ResetAction::Assert => {
                self.shared.stop_worker();
                *self.shared.state.lock().unwrap() = UartState::idle();
                log::info!("{}: reset asserted", self.shared.name);
            }
            ResetAction::Deassert => {
                log::debug!("{}: reset deasserted", self.shared.name);
            }
        }
        Ok(())
    }

    fn clock(&self, action: ClockAction, cycles: u32) -> Result<()> {
        match action {
            ClockAction::Tick => {
                for _ in 0..cycles.max(1) {
                    self.shared.step();
                }
            }
            ClockAction::Enable => log::debug!("{}: clock enabled", self.shared.name),
            ClockAction::Disable => log::debug!("{}: clock disabled", self.shared.name),
        }
        Ok(())
    }

    fn read(&self, addr: u32) -> u32 {
        let rel = addr.wrapping_sub(self.shared.base);
        let mut st = self.shared.state.lock().unwrap();
        match rel {
            offsets::DR => match st.pop_rx() {
                Some(byte) => {
                    log::debug!("{}: rx read {:#04x}", self.shared.name, byte);
                    u32::from(byte)
                }
                // Empty FIFO reads as zero and leaves the flags alone.
                None => 0,
            },
            offsets::RSR_ECR => 0,
            offsets::FR => st.flags.bits(),
            offsets::ILPR => 0,
            offsets::IBRD => 0x006E,
            offsets::FBRD => 0x0000,
            offsets::LCR_H => 0x0070,
            offsets::CR => st.ctrl,
            offsets::IFLS => 0,
            offsets::IMSC => st.imsc,
            offsets::RIS | offsets::MIS => 0,
            offsets::DMACR => st.dmacr,
            _ => {
                log::warn!(
                    "{}: read of unknown register offset {:#x}: returning 0",
                    self.shared.name,
                    rel
                );
                0
            }
        }
    }

    fn write(&self, addr: u32, value: u32) -> Result<()> {
        let rel = addr.wrapping_sub(self.shared.base);
        match rel {
            offsets::DR => {
                let raise_tx;
                {
                    let mut st = self.shared.state.lock().unwrap();
                    st.tx_count += 1;
                    raise_tx = st.enabled();
                    let byte = (value & 0xFF) as u8;
                    log::info!(
                        "{}: transmit {:#04x} ({})",
                        self.shared.name,
                        byte,
                        if byte.is_ascii_graphic() { byte as char } else { '.' }
                    );
                }
                if raise_tx {
                    let _ = crate::trigger_interrupt(&self.shared.name, UART_IRQ_TX);
                }
                Ok(())
            }
            offsets::CR => {
                self.write_ctrl(value);
                Ok(())
            }
            offsets::DMACR => {
                self.write_dmacr(value);
                Ok(())
            }
            offsets::IMSC => {
                self.shared.state.lock().unwrap().imsc = value;
                Ok(())
            }
            offsets::FR | offsets::RIS | offsets::MIS => {
                log::warn!(
                    "{}: write to read-only register offset {:#x}: ignored",
                    self.shared.name,
                    rel
                );
                Ok(())
            }
            offsets::RSR_ECR
            | offsets::ILPR
            | offsets::IBRD
            | offsets::FBRD
            | offsets::LCR_H
            | offsets::IFLS
            | offsets::ICR => {
                log::debug!(
                    "{}: register offset {:#x} write: {:#010x}",
                    self.shared.name,
                    rel,
                    value
                );
                Ok(())
            }
            _ => {
                log::warn!(
                    "{}: write to unknown register offset {:#x}: rejected",
                    self.shared.name,
                    rel
                );
                Err(SimError::Protocol)
            }
        }
    }

    fn interrupt(&self, irq: u32) -> Result<()> {
        log::debug!("{}: interrupt {} observed", self.shared.name, irq);
        Ok(())
    }
}

impl Drop for UartPlugin {
    fn drop(&mut self) {
        self.shared.stop_worker();
    }
}
