//! DMA driver: channel management, transfer control, completion callbacks.
//!
//! Exposes the first eight channels of DMA instance 0. The completion
//! handler runs in signal context: it reads the controller's interrupt
//! status (a trapped access served by the model), notifies per-channel
//! callbacks, and clears the handled bits.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use perisim::{register_interrupt_handler, Result, SimError};

use crate::regs::{
    dma_base, ChannelConfig, ChannelCtrl, ChannelStatus, DmaChannelRegs, DmaGlobalRegs,
    CHANNEL_BASE, CHANNEL_STRIDE, DMA_IRQ_BASE,
};

/// Channels exposed by the driver.
pub const DMA_MAX_CHANNELS: usize = 8;

/// Driver-visible channel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaChannelState {
    Idle,
    Busy,
    Done,
    Error,
}

/// Transfer type, matching the channel config's low bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DmaTransferKind {
    MemToMem = 0,
    MemToPeriph = 1,
    PeriphToMem = 2,
    PeriphToPeriph = 3,
}

/// Channel configuration.
#[derive(Debug, Clone, Copy)]
pub struct DmaConfig {
    pub src: u32,
    pub dst: u32,
    /// Transfer length in bytes.
    pub size: u32,
    pub kind: DmaTransferKind,
    pub inc_src: bool,
    pub inc_dst: bool,
    pub interrupt: bool,
}

/// Completion callback, invoked from the interrupt path.
pub type DmaCallback = fn(channel: u8, state: DmaChannelState);

const NO_CALLBACK: usize = 0;

const FLAG_CLEAR: AtomicBool = AtomicBool::new(false);
const SLOT_EMPTY: AtomicUsize = AtomicUsize::new(NO_CALLBACK);

static INITIALIZED: AtomicBool = AtomicBool::new(false);
static ALLOCATED: [AtomicBool; DMA_MAX_CHANNELS] = [FLAG_CLEAR; DMA_MAX_CHANNELS];
static BUSY: [AtomicBool; DMA_MAX_CHANNELS] = [FLAG_CLEAR; DMA_MAX_CHANNELS];
static CALLBACKS: [AtomicUsize; DMA_MAX_CHANNELS] = [SLOT_EMPTY; DMA_MAX_CHANNELS];

fn global_regs() -> &'static DmaGlobalRegs {
    // SAFETY: instance 0's global registers live at its window base.
    unsafe { &*(dma_base(0) as usize as *const DmaGlobalRegs) }
}

fn global_regs_mut() -> &'static mut DmaGlobalRegs {
    // SAFETY: as above.
    unsafe { &mut *(dma_base(0) as usize as *mut DmaGlobalRegs) }
}

fn channel_regs(ch: usize) -> &'static mut DmaChannelRegs {
    let addr = dma_base(0) + CHANNEL_BASE + ch as u32 * CHANNEL_STRIDE;
    // SAFETY: channel windows are laid out at fixed strides in the
    // instance window.
    unsafe { &mut *(addr as usize as *mut DmaChannelRegs) }
}

fn raw_channel_state(ch: usize) -> DmaChannelState {
    let status = ChannelStatus::from_bits_truncate(channel_regs(ch).status.read());
    if status.contains(ChannelStatus::ERROR) {
        DmaChannelState::Error
    } else if status.contains(ChannelStatus::DONE) {
        DmaChannelState::Done
    } else if status.contains(ChannelStatus::BUSY) {
        DmaChannelState::Busy
    } else {
        DmaChannelState::Idle
    }
}

/// Completion interrupt handler, shared by every channel IRQ.
fn completion_handler() {
    let int_status = global_regs().int_status.read();
    if int_status == 0 {
        return;
    }
    let mut handled = 0u32;
    for ch in 0..DMA_MAX_CHANNELS {
        if int_status & (1 << ch) == 0 {
            continue;
        }
        let state = raw_channel_state(ch);
        BUSY[ch].store(state == DmaChannelState::Busy, Ordering::Release);
        log::debug!("dma driver: channel {} interrupt, state {:?}", ch, state);

        let raw = CALLBACKS[ch].load(Ordering::Acquire);
        if raw != NO_CALLBACK {
            // SAFETY: the address was stored from a `DmaCallback`.
            let callback: DmaCallback = unsafe { std::mem::transmute(raw) };
            callback(ch as u8, state);
        }
        handled |= 1 << ch;
    }
    global_regs_mut().int_clear.write(handled);
}

/// Driver for the first DMA controller instance.
pub struct DmaDriver {
    _private: (),
}

impl DmaDriver {
    /// Register completion handlers, enable the controller, and clear any
    /// stale interrupt status.
    pub fn init() -> Result<Self> {
        if INITIALIZED.swap(true, Ordering::AcqRel) {
            log::debug!("dma driver: already initialised");
            return Ok(Self { _private: () });
        }
        for ch in 0..DMA_MAX_CHANNELS as u32 {
            register_interrupt_handler(DMA_IRQ_BASE + ch, completion_handler)?;
        }
        global_regs_mut().ctrl.write(1);
        global_regs_mut().int_clear.write(0xFFFF);
        log::info!(
            "dma driver: initialised, {} channels available",
            DMA_MAX_CHANNELS
        );
        Ok(Self { _private: () })
    }

    /// Claim a free channel.
    pub fn allocate_channel(&self) -> Result<u8> {
        for ch in 0..DMA_MAX_CHANNELS {
            if !ALLOCATED[ch].swap(true, Ordering::AcqRel) {
                BUSY[ch].store(false, Ordering::Release);
                CALLBACKS[ch].store(NO_CALLBACK, Ordering::Release);
                log::debug!("dma driver: allocated channel {}", ch);
                return Ok(ch as u8);
            }
        }
        log::warn!("dma driver: no free channels");
        Err(SimError::Busy)
    }

    /// Release a channel, stopping any transfer in flight.
    pub fn free_channel(&self, channel: u8) -> Result<()> {
        let ch = Self::check_channel(channel)?;
        if !ALLOCATED[ch].load(Ordering::Acquire) {
            return Err(SimError::NotFound);
        }
        self.stop_transfer(channel)?;
        CALLBACKS[ch].store(NO_CALLBACK, Ordering::Release);
        ALLOCATED[ch].store(false, Ordering::Release);
        log::debug!("dma driver: freed channel {}", ch);
        Ok(())
    }

    pub fn is_channel_available(&self, channel: u8) -> bool {
        (channel as usize) < DMA_MAX_CHANNELS
            && !ALLOCATED[channel as usize].load(Ordering::Acquire)
    }

    /// Program a channel. The channel must be allocated and idle.
    pub fn configure_channel(&self, channel: u8, config: &DmaConfig) -> Result<()> {
        let ch = Self::check_channel(channel)?;
        if !ALLOCATED[ch].load(Ordering::Acquire) {
            return Err(SimError::NotFound);
        }
        if BUSY[ch].load(Ordering::Acquire) {
            log::warn!("dma driver: channel {} busy: configure rejected", ch);
            return Err(SimError::Busy);
        }

        let mut cfg = config.kind as u32;
        if config.inc_src {
            cfg |= ChannelConfig::INC_SRC.bits();
        }
        if config.inc_dst {
            cfg |= ChannelConfig::INC_DST.bits();
        }
        if config.interrupt {
            cfg |= ChannelConfig::INT_ENABLE.bits();
        }

        let regs = channel_regs(ch);
        regs.src.write(config.src);
        regs.dst.write(config.dst);
        regs.size.write(config.size);
        regs.config.write(cfg);

        log::info!(
            "dma driver: channel {} configured src={:#010x} dst={:#010x} size={}",
            ch,
            config.src,
            config.dst,
            config.size
        );
        Ok(())
    }

    /// Start the programmed transfer.
    pub fn start_transfer(&self, channel: u8) -> Result<()> {
        let ch = Self::check_channel(channel)?;
        if !ALLOCATED[ch].load(Ordering::Acquire) {
            return Err(SimError::NotFound);
        }
        channel_regs(ch)
            .ctrl
            .write((ChannelCtrl::ENABLE | ChannelCtrl::START).bits());
        BUSY[ch].store(true, Ordering::Release);
        log::info!("dma driver: channel {} transfer started", ch);
        Ok(())
    }

    /// Abort a transfer in flight.
    pub fn stop_transfer(&self, channel: u8) -> Result<()> {
        let ch = Self::check_channel(channel)?;
        channel_regs(ch).ctrl.write(ChannelCtrl::ABORT.bits());
        BUSY[ch].store(false, Ordering::Release);
        log::debug!("dma driver: channel {} transfer stopped", ch);
        Ok(())
    }

    /// Current state of a channel as reported by its status register.
    pub fn channel_status(&self, channel: u8) -> DmaChannelState {
        if (channel as usize) >= DMA_MAX_CHANNELS {
            return DmaChannelState::Error;
        }
        if !ALLOCATED[channel as usize].load(Ordering::Acquire) {
            return DmaChannelState::Idle;
        }
        raw_channel_state(channel as usize)
    }

    /// Register a completion callback for an allocated channel.
    pub fn register_callback(&self, channel: u8, callback: DmaCallback) -> Result<()> {
        let ch = Self::check_channel(channel)?;
        if !ALLOCATED[ch].load(Ordering::Acquire) {
            return Err(SimError::NotFound);
        }
        CALLBACKS[ch].store(callback as usize, Ordering::Release);
        Ok(())
    }

    /// Configure, start, and wait for a transfer to finish.
    pub fn transfer_sync(
        &self,
        channel: u8,
        src: u32,
        dst: u32,
        size: u32,
        kind: DmaTransferKind,
        timeout_ms: u64,
    ) -> Result<()> {
        self.configure_channel(
            channel,
            &DmaConfig {
                src,
                dst,
                size,
                kind,
                inc_src: true,
                inc_dst: true,
                interrupt: false,
            },
        )?;
        self.start_transfer(channel)?;

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            match self.channel_status(channel) {
                DmaChannelState::Done => {
                    BUSY[channel as usize].store(false, Ordering::Release);
                    log::info!("dma driver: channel {} sync transfer complete", channel);
                    return Ok(());
                }
                DmaChannelState::Error => {
                    log::error!("dma driver: channel {} transfer error", channel);
                    return Err(SimError::Protocol);
                }
                _ => {}
            }
            if Instant::now() >= deadline {
                log::warn!(
                    "dma driver: channel {} transfer timed out after {} ms",
                    channel,
                    timeout_ms
                );
                return Err(SimError::Timeout);
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Configure and start a transfer, reporting completion through
    /// `callback`.
    pub fn transfer_async(
        &self,
        channel: u8,
        src: u32,
        dst: u32,
        size: u32,
        kind: DmaTransferKind,
        callback: DmaCallback,
    ) -> Result<()> {
        self.configure_channel(
            channel,
            &DmaConfig {
                src,
                dst,
                size,
                kind,
                inc_src: true,
                inc_dst: true,
                interrupt: true,
            },
        )?;
        self.register_callback(channel, callback)?;
        self.start_transfer(channel)
    }

    /// Stop every allocated channel and disable the controller.
    pub fn cleanup(&self) {
        for ch in 0..DMA_MAX_CHANNELS as u8 {
            if ALLOCATED[ch as usize].load(Ordering::Acquire) {
                let _ = self.free_channel(ch);
            }
        }
        global_regs_mut().ctrl.write(0);
        INITIALIZED.store(false, Ordering::Release);
        log::info!("dma driver: cleaned up");
    }

    fn check_channel(channel: u8) -> Result<usize> {
        if (channel as usize) < DMA_MAX_CHANNELS {
            Ok(channel as usize)
        } else {
            log::warn!("dma driver: invalid channel {}", channel);
            Err(SimError::Config)
        }
    }
}
