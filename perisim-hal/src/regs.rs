//! Memory map and register layout of the simulated peripherals.
//!
//! Register blocks are `#[repr(C)]` structs of volatile cells; drivers hold
//! a base address and dereference it as a block, so every access compiles
//! to a plain 32-bit load or store the trap engine can decode.

use core::ptr::{read_volatile, write_volatile};

pub use perisim::plugins::dma::{
    ChannelConfig, ChannelCtrl, ChannelStatus, CHANNEL_BASE, CHANNEL_STRIDE, DMA_BASE,
    DMA_IRQ_BASE, DMA_WINDOW,
};
pub use perisim::plugins::uart::{
    ControlBits, DmaControlBits, FlagBits, UART_BASE, UART_IRQ_RX, UART_IRQ_TX, UART_WINDOW,
};

/// Peripheral bus base.
pub const PERIPH_BASE: u32 = 0x4000_0000;

/// Base address of UART instance `n`.
pub const fn uart_base(n: u32) -> u32 {
    UART_BASE + n * UART_WINDOW
}

/// Base address of DMA instance `n`.
pub const fn dma_base(n: u32) -> u32 {
    DMA_BASE + n * DMA_WINDOW
}

/// A single volatile 32-bit register cell.
#[repr(transparent)]
pub struct Reg<T>(T);

impl<T> Reg<T> {
    pub fn read(&self) -> T {
        // SAFETY: the cell lives inside a register block the driver mapped.
        unsafe { read_volatile(&self.0) }
    }

    pub fn write(&mut self, val: T) {
        // SAFETY: as above.
        unsafe { write_volatile(&mut self.0, val) }
    }
}

/// PrimeCell-style UART register block (0x50 bytes).
#[repr(C)]
pub struct UartRegs {
    /// Data register.
    pub dr: Reg<u32>, // 0x00
    /// Receive status / error clear.
    pub rsr_ecr: Reg<u32>, // 0x04
    _reserved0: [u32; 4], // 0x08..0x18
    /// Flag register (read-only).
    pub fr: Reg<u32>, // 0x18
    _reserved1: u32, // 0x1C
    pub ilpr: Reg<u32>,  // 0x20
    pub ibrd: Reg<u32>,  // 0x24
    pub fbrd: Reg<u32>,  // 0x28
    pub lcr_h: Reg<u32>, // 0x2C
    /// Control register.
    pub cr: Reg<u32>, // 0x30
    pub ifls: Reg<u32>, // 0x34
    /// Interrupt mask set/clear.
    pub imsc: Reg<u32>, // 0x38
    pub ris: Reg<u32>, // 0x3C
    pub mis: Reg<u32>, // 0x40
    pub icr: Reg<u32>, // 0x44
    /// DMA control register.
    pub dmacr: Reg<u32>, // 0x48
}

/// DMA controller global register block.
#[repr(C)]
pub struct DmaGlobalRegs {
    /// Interrupt status, one bit per channel (read-only).
    pub int_status: Reg<u32>, // 0x00
    _reserved0: u32, // 0x04
    /// Write-1-to-clear interrupt status.
    pub int_clear: Reg<u32>, // 0x08
    _reserved1: [u32; 9], // 0x0C..0x30
    /// Controller configuration; bit 0 enables the controller.
    pub ctrl: Reg<u32>, // 0x30
    pub sync: Reg<u32>, // 0x34
}

/// One DMA channel register window (0x20 bytes).
#[repr(C)]
pub struct DmaChannelRegs {
    pub src: Reg<u32>,    // 0x00
    pub dst: Reg<u32>,    // 0x04
    pub size: Reg<u32>,   // 0x08
    pub ctrl: Reg<u32>,   // 0x0C
    pub config: Reg<u32>, // 0x10
    pub status: Reg<u32>, // 0x14
    _reserved: [u32; 2],  // 0x18..0x20
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn uart_register_offsets() {
        assert_eq!(offset_of!(UartRegs, dr), 0x00);
        assert_eq!(offset_of!(UartRegs, rsr_ecr), 0x04);
        assert_eq!(offset_of!(UartRegs, fr), 0x18);
        assert_eq!(offset_of!(UartRegs, ilpr), 0x20);
        assert_eq!(offset_of!(UartRegs, ibrd), 0x24);
        assert_eq!(offset_of!(UartRegs, fbrd), 0x28);
        assert_eq!(offset_of!(UartRegs, lcr_h), 0x2C);
        assert_eq!(offset_of!(UartRegs, cr), 0x30);
        assert_eq!(offset_of!(UartRegs, ifls), 0x34);
        assert_eq!(offset_of!(UartRegs, imsc), 0x38);
        assert_eq!(offset_of!(UartRegs, ris), 0x3C);
        assert_eq!(offset_of!(UartRegs, mis), 0x40);
        assert_eq!(offset_of!(UartRegs, icr), 0x44);
        assert_eq!(offset_of!(UartRegs, dmacr), 0x48);
        assert_eq!(size_of::<UartRegs>(), 0x4C);
    }

    #[test]
    fn dma_register_offsets() {
        assert_eq!(offset_of!(DmaGlobalRegs, int_status), 0x00);
        assert_eq!(offset_of!(DmaGlobalRegs, int_clear), 0x08);
        assert_eq!(offset_of!(DmaGlobalRegs, ctrl), 0x30);
        assert_eq!(offset_of!(DmaGlobalRegs, sync), 0x34);

        assert_eq!(offset_of!(DmaChannelRegs, src), 0x00);
        assert_eq!(offset_of!(DmaChannelRegs, dst), 0x04);
        assert_eq!(offset_of!(DmaChannelRegs, size), 0x08);
        assert_eq!(offset_of!(DmaChannelRegs, ctrl), 0x0C);
        assert_eq!(offset_of!(DmaChannelRegs, config), 0x10);
        assert_eq!(offset_of!(DmaChannelRegs, status), 0x14);
        assert_eq!(size_of::<DmaChannelRegs>(), CHANNEL_STRIDE as usize);
    }

    #[test]
    fn instance_bases() {
        assert_eq!(uart_base(0), 0x4000_2000);
        assert_eq!(uart_base(1), 0x4000_3000);
        assert_eq!(dma_base(0), 0x4000_6000);
        assert_eq!(dma_base(2), 0x4000_8000);
    }
}
