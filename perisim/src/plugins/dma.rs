//! DMA controller model with sixteen independent channels.
//!
//! A channel becomes active when its control register's enable bit is set.
//! Each worker tick moves `min(remaining, 512)` bytes; when the remaining
//! size reaches zero the channel clears its enable bit, sets its done bit,
//! and raises IRQ `10 + channel` if the channel's config asks for it.
//! Memory-to-memory transfers with both increment flags set copy real bytes
//! between guest RAM windows; every other transfer type only advances the
//! byte counter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bitflags::bitflags;

use crate::error::{Result, SimError};
use crate::plugin::{instance_index, Peripheral};
use crate::protocol::{ClockAction, ResetAction};

/// First DMA instance base; instance `i` sits at `BASE + i * WINDOW`.
pub const DMA_BASE: u32 = 0x4000_6000;
/// Register window size per instance.
pub const DMA_WINDOW: u32 = 0x1000;

/// Number of modelled channels per instance.
pub const NUM_CHANNELS: usize = 16;
/// Channel register windows start at this offset into the instance window.
pub const CHANNEL_BASE: u32 = 0x100;
/// Stride between channel windows.
pub const CHANNEL_STRIDE: u32 = 0x20;

/// Completion IRQ for channel `ch` is `DMA_IRQ_BASE + ch`.
pub const DMA_IRQ_BASE: u32 = 10;

/// Bytes moved per active channel per tick.
pub const BURST_BYTES: u32 = 512;
/// Size substituted when a channel is enabled with `size == 0`.
pub const DEFAULT_TRANSFER_SIZE: u32 = 1024;

/// Global register offsets within the instance window.
mod global {
    /// Interrupt status, one bit per channel. Read-only.
    pub const INT_STATUS: u32 = 0x00;
    /// Write-1-to-clear interrupt status bits.
    pub const INT_CLEAR: u32 = 0x08;
    /// Controller configuration; bit 0 enables the controller.
    pub const CTRL: u32 = 0x30;
}

/// Channel register offsets within a channel window.
mod chan {
    pub const SRC: u32 = 0x00;
    pub const DST: u32 = 0x04;
    pub const SIZE: u32 = 0x08;
    pub const CTRL: u32 = 0x0C;
    pub const CONFIG: u32 = 0x10;
    pub const STATUS: u32 = 0x14;
}

bitflags! {
    /// Channel control register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChannelCtrl: u32 {
        /// Channel active while set.
        const ENABLE = 1 << 0;
        const START = 1 << 1;
        /// Abort the transfer and deactivate the channel.
        const ABORT = 1 << 2;
    }
}

bitflags! {
    /// Channel status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChannelStatus: u32 {
        const BUSY = 1 << 0;
        const DONE = 1 << 1;
        const ERROR = 1 << 2;
    }
}

bitflags! {
    /// Channel config register bits. The low two bits select the transfer
    /// type (0 = mem-to-mem, 1 = mem-to-periph, 2 = periph-to-mem,
    /// 3 = periph-to-periph).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChannelConfig: u32 {
        const INC_SRC = 1 << 4;
        const INC_DST = 1 << 5;
        const INT_ENABLE = 1 << 8;
    }
}

/// Transfer type selector in the channel config's low bits.
pub const CONFIG_TYPE_MASK: u32 = 0x3;
/// Memory-to-memory transfer type value.
pub const CONFIG_MEM_TO_MEM: u32 = 0;

#[derive(Debug, Clone, Copy, Default)]
struct Channel {
    ctrl: u32,
    status: u32,
    src: u32,
    dst: u32,
    size: u32,
    config: u32,
    /// Bytes already moved in the current transfer.
    cursor: u32,
}

impl Channel {
    fn active(&self) -> bool {
        self.ctrl & ChannelCtrl::ENABLE.bits() != 0
    }

    fn copies_memory(&self) -> bool {
        self.config & CONFIG_TYPE_MASK == CONFIG_MEM_TO_MEM
            && self.config & ChannelConfig::INC_SRC.bits() != 0
            && self.config & ChannelConfig::INC_DST.bits() != 0
    }

    fn interrupt_enabled(&self) -> bool {
        self.config & ChannelConfig::INT_ENABLE.bits() != 0
    }
}

#[derive(Debug, Default)]
struct DmaState {
    channels: [Channel; NUM_CHANNELS],
    global_ctrl: u32,
    int_status: u32,
}

struct DmaShared {
    name: String,
    base: u32,
    state: Mutex<DmaState>,
    running: AtomicBool,
    shutdown: Mutex<bool>,
    wake: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
    tick: Duration,
}

impl DmaShared {
    /// One model step. Shared by the worker loop and `clock(Tick)`.
    fn step(&self) {
        let mut completed: [bool; NUM_CHANNELS] = [false; NUM_CHANNELS];
        {
            let mut st = self.state.lock().unwrap();
            for idx in 0..NUM_CHANNELS {
                let ch = &mut st.channels[idx];
                if !ch.active() || ch.size == 0 {
                    continue;
                }
                let amount = ch.size.min(BURST_BYTES);
                if ch.copies_memory() {
                    copy_guest_bytes(
                        ch.src.wrapping_add(ch.cursor),
                        ch.dst.wrapping_add(ch.cursor),
                        amount,
                    );
                }
                ch.size -= amount;
                ch.cursor += amount;
                log::debug!(
                    "{}: channel {} moved {} bytes, {} remaining",
                    self.name,
                    idx,
                    amount,
                    ch.size
                );
                if ch.size == 0 {
                    ch.ctrl &= !ChannelCtrl::ENABLE.bits();
                    ch.status &= !ChannelStatus::BUSY.bits();
                    ch.status |= ChannelStatus::DONE.bits();
                    st.int_status |= 1 << idx;
                    log::info!("{}: channel {} transfer complete", self.name, idx);
                    if st.channels[idx].interrupt_enabled() {
                        completed[idx] = true;
                    }
                }
            }
        }
        // Completion state is published before the IRQs that report it.
        for (idx, done) in completed.iter().enumerate() {
            if *done {
                let _ = crate::trigger_interrupt(&self.name, DMA_IRQ_BASE + idx as u32);
            }
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
            .expect("spawn dma worker");
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

/// Copy `len` bytes between guest RAM windows. Spans outside mapped guest
/// RAM are skipped: the byte counter still advances, but no host memory is
/// touched (peripheral-directed transfers stay pure simulation).
fn copy_guest_bytes(src: u32, dst: u32, len: u32) {
    let ram = crate::simulator().guest_ram();
    if !ram.contains_span(src, len) || !ram.contains_span(dst, len) {
        return;
    }
    // SAFETY: both spans were just verified to lie inside mapped,
    // accessible guest RAM windows.
    unsafe {
        std::ptr::copy(
            src as u64 as *const u8,
            dst as u64 as *mut u8,
            len as usize,
        );
    }
}

/// Sixteen-channel DMA controller model.
pub struct DmaPlugin {
    shared: Arc<DmaShared>,
}

/// Observation handle for tests and host-side tooling.
#[derive(Clone)]
pub struct DmaHandle {
    shared: Arc<DmaShared>,
}

impl DmaHandle {
    /// The channel's status register.
    pub fn channel_status(&self, ch: usize) -> u32 {
        self.shared.state.lock().unwrap().channels[ch].status
    }

    /// Remaining bytes of the channel's current transfer.
    pub fn channel_remaining(&self, ch: usize) -> u32 {
        self.shared.state.lock().unwrap().channels[ch].size
    }
}

impl DmaPlugin {
    /// Create an instance named e.g. `dma0`; the trailing index selects the
    /// register window at `DMA_BASE + i * DMA_WINDOW`.
    pub fn new(name: &str) -> Self {
        Self::with_tick(name, Duration::from_secs(1))
    }

    /// Like [`DmaPlugin::new`] with an explicit worker tick period.
    pub fn with_tick(name: &str, tick: Duration) -> Self {
        let base = DMA_BASE + instance_index(name) * DMA_WINDOW;
        Self {
            shared: Arc::new(DmaShared {
                name: name.to_owned(),
                base,
                state: Mutex::new(DmaState::default()),
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

    pub fn handle(&self) -> DmaHandle {
        DmaHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Split a window-relative offset into `(channel, register)`.
    fn channel_offset(rel: u32) -> Option<(usize, u32)> {
        if rel < CHANNEL_BASE {
            return None;
        }
        let idx = (rel - CHANNEL_BASE) / CHANNEL_STRIDE;
        if idx as usize >= NUM_CHANNELS {
            return None;
        }
        Some((idx as usize, (rel - CHANNEL_BASE) % CHANNEL_STRIDE))
    }

    fn write_channel_ctrl(&self, idx: usize, value: u32) {
        let mut st = self.shared.state.lock().unwrap();
        let ch = &mut st.channels[idx];

        if value & ChannelCtrl::ABORT.bits() != 0 {
            ch.ctrl = 0;
            ch.status &= !ChannelStatus::BUSY.bits();
            log::info!("{}: channel {} aborted", self.shared.name, idx);
            return;
        }

        ch.ctrl = value;
        if value & ChannelCtrl::ENABLE.bits() != 0 {
            if ch.size == 0 {
                // Convenience default so a bare enable still transfers.
                ch.size = DEFAULT_TRANSFER_SIZE;
                log::info!(
                    "{}: channel {} size defaulted to {}",
                    self.shared.name,
                    idx,
                    DEFAULT_TRANSFER_SIZE
                );
            }
            ch.cursor = 0;
            ch.status &= !ChannelStatus::DONE.bits();
            ch.status |= ChannelStatus::BUSY.bits();
            log::info!(
                "{}: channel {} started, size={}",
                self.shared.name,
                idx,
                ch.size
            );
        }
    }
}

impl Peripheral for DmaPlugin {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn init(&self) -> Result<()> {
        // The controller ticks from creation; channels only move once
        // enabled.
        self.shared.start_worker();
        log::info!(
            "{}: dma initialised at {:#010x}, {} channels",
            self.shared.name,
            self.shared.base,
            NUM_CHANNELS
        );
        Ok(())
    }

    fn cleanup(&self) {
        self.shared.stop_worker();
        log::info!("{}: dma cleaned up", self.shared.name);
    }

    fn reset(&self, action: ResetAction) -> Result<()> {
        match action {
            ResetAction::Assert => {
                self.shared.stop_worker();
                *self.shared.state.lock().unwrap() = DmaState::default();
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
        let st = self.shared.state.lock().unwrap();
        match rel {
            global::INT_STATUS => st.int_status,
            global::CTRL => st.global_ctrl,
            _ => match Self::channel_offset(rel) {
                Some((idx, reg)) => {
                    let ch = &st.channels[idx];
                    match reg {
                        chan::SRC => ch.src,
                        chan::DST => ch.dst,
                        chan::SIZE => ch.size,
                        chan::CTRL => ch.ctrl,
                        chan::CONFIG => ch.config,
                        chan::STATUS => ch.status,
                        _ => 0,
                    }
                }
                None => {
                    log::warn!(
                        "{}: read of unknown register offset {:#x}: returning 0",
                        self.shared.name,
                        rel
                    );
                    0
                }
            },
        }
    }

    fn write(&self, addr: u32, value: u32) -> Result<()> {
        let rel = addr.wrapping_sub(self.shared.base);
        match rel {
            global::CTRL => {
                let mut st = self.shared.state.lock().unwrap();
                st.global_ctrl = value;
                log::info!(
                    "{}: controller {}",
                    self.shared.name,
                    if value & 1 != 0 { "enabled" } else { "disabled" }
                );
                Ok(())
            }
            global::INT_CLEAR => {
                let mut st = self.shared.state.lock().unwrap();
                st.int_status &= !value;
                Ok(())
            }
            global::INT_STATUS => {
                log::warn!(
                    "{}: write to read-only interrupt status: ignored",
                    self.shared.name
                );
                Ok(())
            }
            _ => match Self::channel_offset(rel) {
                Some((idx, reg)) => {
                    match reg {
                        chan::CTRL => self.write_channel_ctrl(idx, value),
                        chan::SRC => {
                            self.shared.state.lock().unwrap().channels[idx].src = value
                        }
                        chan::DST => {
                            self.shared.state.lock().unwrap().channels[idx].dst = value
                        }
                        chan::SIZE => {
                            self.shared.state.lock().unwrap().channels[idx].size = value
                        }
                        chan::CONFIG => {
                            self.shared.state.lock().unwrap().channels[idx].config = value
                        }
                        chan::STATUS => {
                            self.shared.state.lock().unwrap().channels[idx].status = value
                        }
                        _ => {
                            log::warn!(
                                "{}: write to unknown channel {} offset {:#x}: rejected",
                                self.shared.name,
                                idx,
                                reg
                            );
                            return Err(SimError::Protocol);
                        }
                    }
                    Ok(())
                }
                None => {
                    log::warn!(
                        "{}: write to unknown register offset {:#x}: rejected",
                        self.shared.name,
                        rel
                    );
                    Err(SimError::Protocol)
                }
            },
        }
    }

    fn interrupt(&self, irq: u32) -> Result<()> {
        // Bidirectional hook: reflect a delivered completion IRQ in the
        // status register, mirroring what the worker would have set.
        if (DMA_IRQ_BASE..DMA_IRQ_BASE + NUM_CHANNELS as u32).contains(&irq) {
            let mut st = self.shared.state.lock().unwrap();
            st.int_status |= 1 << (irq - DMA_IRQ_BASE);
        }
        log::debug!("{}: interrupt {} observed", self.shared.name, irq);
        Ok(())
    }
}

impl Drop for DmaPlugin {
    fn drop(&mut self) {
        self.shared.stop_worker();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Worker tick far beyond test runtime; state advances via clock(Tick).
    fn quiet_dma(name: &str) -> DmaPlugin {
        DmaPlugin::with_tick(name, Duration::from_secs(3600))
    }

    fn ch_addr(dma: &DmaPlugin, ch: u32, reg: u32) -> u32 {
        dma.base() + CHANNEL_BASE + ch * CHANNEL_STRIDE + reg
    }

    #[test]
    fn instance_base_derivation() {
        assert_eq!(quiet_dma("dma0").base(), 0x4000_6000);
        assert_eq!(quiet_dma("dma1").base(), 0x4000_7000);
    }

    #[test]
    fn enable_with_zero_size_defaults_to_1024() {
        let dma = quiet_dma("dma0");
        dma.write(ch_addr(&dma, 0, chan::CTRL), ChannelCtrl::ENABLE.bits())
            .unwrap();
        assert_eq!(
            dma.read(ch_addr(&dma, 0, chan::SIZE)),
            DEFAULT_TRANSFER_SIZE
        );
        dma.cleanup();
    }

    #[test]
    fn tick_accounting_sums_to_initial_size() {
        let dma = quiet_dma("dma0");
        dma.write(ch_addr(&dma, 2, chan::SIZE), 1300).unwrap();
        dma.write(ch_addr(&dma, 2, chan::CTRL), ChannelCtrl::ENABLE.bits())
            .unwrap();

        // 1300 = 512 + 512 + 276: three ticks to completion.
        let mut moved = 0;
        for _ in 0..3 {
            let before = dma.read(ch_addr(&dma, 2, chan::SIZE));
            dma.clock(ClockAction::Tick, 1).unwrap();
            let after = dma.read(ch_addr(&dma, 2, chan::SIZE));
            moved += before - after;
        }
        assert_eq!(moved, 1300);
        assert_eq!(dma.read(ch_addr(&dma, 2, chan::SIZE)), 0);

        let status = dma.read(ch_addr(&dma, 2, chan::STATUS));
        assert_ne!(status & ChannelStatus::DONE.bits(), 0);
        assert_eq!(status & ChannelStatus::BUSY.bits(), 0);
        // Enable bit cleared on completion.
        assert_eq!(
            dma.read(ch_addr(&dma, 2, chan::CTRL)) & ChannelCtrl::ENABLE.bits(),
            0
        );
        dma.cleanup();
    }

    #[test]
    fn completion_sets_interrupt_status_bit() {
        let dma = quiet_dma("dma0");
        dma.write(ch_addr(&dma, 3, chan::SIZE), 100).unwrap();
        dma.write(
            ch_addr(&dma, 3, chan::CONFIG),
            ChannelConfig::INT_ENABLE.bits(),
        )
        .unwrap();
        dma.write(ch_addr(&dma, 3, chan::CTRL), ChannelCtrl::ENABLE.bits())
            .unwrap();
        dma.clock(ClockAction::Tick, 1).unwrap();

        assert_eq!(dma.read(dma.base() + global::INT_STATUS), 1 << 3);

        // Write-1-to-clear.
        dma.write(dma.base() + global::INT_CLEAR, 1 << 3).unwrap();
        assert_eq!(dma.read(dma.base() + global::INT_STATUS), 0);
        dma.cleanup();
    }

    #[test]
    fn abort_deactivates_channel() {
        let dma = quiet_dma("dma0");
        dma.write(ch_addr(&dma, 1, chan::SIZE), 4096).unwrap();
        dma.write(ch_addr(&dma, 1, chan::CTRL), ChannelCtrl::ENABLE.bits())
            .unwrap();
        dma.clock(ClockAction::Tick, 1).unwrap();
        dma.write(ch_addr(&dma, 1, chan::CTRL), ChannelCtrl::ABORT.bits())
            .unwrap();

        assert_eq!(dma.read(ch_addr(&dma, 1, chan::CTRL)), 0);
        let remaining = dma.read(ch_addr(&dma, 1, chan::SIZE));
        dma.clock(ClockAction::Tick, 4).unwrap();
        // No further movement after abort.
        assert_eq!(dma.read(ch_addr(&dma, 1, chan::SIZE)), remaining);
        dma.cleanup();
    }

    #[test]
    fn global_control_roundtrip() {
        let dma = quiet_dma("dma0");
        dma.write(dma.base() + global::CTRL, 1).unwrap();
        assert_eq!(dma.read(dma.base() + global::CTRL), 1);
        dma.cleanup();
    }

    #[test]
    fn reset_zeroes_all_channels() {
        let dma = quiet_dma("dma0");
        dma.write(ch_addr(&dma, 0, chan::SRC), 0x2000_0000).unwrap();
        dma.write(ch_addr(&dma, 0, chan::SIZE), 64).unwrap();
        dma.write(ch_addr(&dma, 0, chan::CTRL), ChannelCtrl::ENABLE.bits())
            .unwrap();
        dma.reset(ResetAction::Assert).unwrap();

        for reg in [chan::SRC, chan::DST, chan::SIZE, chan::CTRL, chan::CONFIG] {
            assert_eq!(dma.read(ch_addr(&dma, 0, reg)), 0);
        }
        assert_eq!(dma.read(dma.base() + global::INT_STATUS), 0);
        assert_eq!(dma.read(dma.base() + global::CTRL), 0);
    }

    #[test]
    fn unknown_offset_write_rejected() {
        let dma = quiet_dma("dma0");
        assert_eq!(dma.write(dma.base() + 0x0C, 1), Err(SimError::Protocol));
        assert_eq!(
            dma.write(ch_addr(&dma, 0, 0x18), 1),
            Err(SimError::Protocol)
        );
        dma.cleanup();
    }
}
