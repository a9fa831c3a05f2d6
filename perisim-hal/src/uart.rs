//! UART driver: polled transmit, interrupt-assisted receive.
//!
//! The driver registers TX/RX interrupt handlers, enables the UART through
//! its control register, and then reads and writes the data register like
//! any memory-mapped driver would. The interrupt handlers run in signal
//! context and only touch atomics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use perisim::{register_interrupt_handler, Result, SimError};

use crate::regs::{uart_base, ControlBits, FlagBits, UartRegs, UART_IRQ_RX, UART_IRQ_TX};

static TX_COMPLETE: AtomicBool = AtomicBool::new(false);
static RX_AVAILABLE: AtomicBool = AtomicBool::new(false);

fn tx_interrupt_handler() {
    TX_COMPLETE.store(true, Ordering::Release);
}

fn rx_interrupt_handler() {
    RX_AVAILABLE.store(true, Ordering::Release);
}

/// How long `send_byte` waits for the TX-complete interrupt before moving
/// on. Transmission itself is immediate in the model; the wait only
/// confirms the interrupt path.
const TX_IRQ_GRACE: Duration = Duration::from_millis(100);

/// Driver for one UART instance.
pub struct UartDriver {
    base: usize,
}

impl UartDriver {
    /// Driver for UART instance `n`.
    pub const fn new(instance: u32) -> Self {
        Self {
            base: uart_base(instance) as usize,
        }
    }

    fn regs(&self) -> &UartRegs {
        // SAFETY: the base address is the instance's register window.
        unsafe { &*(self.base as *const UartRegs) }
    }

    fn regs_mut(&mut self) -> &mut UartRegs {
        // SAFETY: as above.
        unsafe { &mut *(self.base as *mut UartRegs) }
    }

    /// Register the TX/RX interrupt handlers and enable the UART.
    pub fn init(&mut self) -> Result<()> {
        TX_COMPLETE.store(false, Ordering::Release);
        RX_AVAILABLE.store(false, Ordering::Release);
        register_interrupt_handler(UART_IRQ_TX, tx_interrupt_handler)?;
        register_interrupt_handler(UART_IRQ_RX, rx_interrupt_handler)?;

        self.regs_mut().cr.write(
            (ControlBits::UARTEN | ControlBits::TXE | ControlBits::RXE).bits(),
        );
        log::info!("uart driver: initialised");
        Ok(())
    }

    fn flags(&self) -> FlagBits {
        FlagBits::from_bits_truncate(self.regs().fr.read())
    }

    /// Transmit one byte. Polls the flag register for TX space, then waits
    /// briefly for the TX-complete interrupt.
    pub fn send_byte(&mut self, byte: u8) -> Result<()> {
        while self.flags().contains(FlagBits::TXFF) {
            thread::sleep(Duration::from_millis(1));
        }

        TX_COMPLETE.store(false, Ordering::Release);
        self.regs_mut().dr.write(u32::from(byte));

        let deadline = Instant::now() + TX_IRQ_GRACE;
        while !TX_COMPLETE.load(Ordering::Acquire) {
            if Instant::now() >= deadline {
                log::debug!("uart driver: tx interrupt not observed for {:#04x}", byte);
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }

    /// Receive one byte, waiting up to `timeout_ms` for the RX interrupt or
    /// the flag register to report data.
    pub fn receive_byte(&mut self, timeout_ms: u64) -> Result<u8> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if RX_AVAILABLE.swap(false, Ordering::AcqRel)
                || !self.flags().contains(FlagBits::RXFE)
            {
                let byte = (self.regs().dr.read() & 0xFF) as u8;
                return Ok(byte);
            }
            if Instant::now() >= deadline {
                log::warn!("uart driver: receive timed out after {} ms", timeout_ms);
                return Err(SimError::Timeout);
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Transmit every byte of `s`.
    pub fn send_str(&mut self, s: &str) -> Result<()> {
        for byte in s.bytes() {
            self.send_byte(byte)?;
        }
        Ok(())
    }

    /// Disable the UART.
    pub fn cleanup(&mut self) {
        self.regs_mut().cr.write(0);
        log::info!("uart driver: cleaned up");
    }
}
