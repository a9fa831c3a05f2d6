//! Concrete peripheral models.

pub mod dma;
pub mod uart;
