//! Driver-side HAL for the peripheral simulator.
//!
//! These drivers are ordinary memory-mapped peripheral drivers: they poke
//! registers through raw pointers and wait on interrupt flags. Run under
//! the simulator, every access is trapped and served by the peripheral
//! models; the same code would drive real PrimeCell-style hardware.

pub mod dma;
pub mod regs;
pub mod uart;

pub use dma::{DmaChannelState, DmaConfig, DmaDriver, DmaTransferKind};
pub use uart::UartDriver;
