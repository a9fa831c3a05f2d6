//! Demo launcher: brings the simulator up with the exemplar peripheral
//! plan and runs driver scenarios against it.

mod logger;

use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::LevelFilter;

use perisim::plugins::dma::DmaPlugin;
use perisim::plugins::uart::UartPlugin;
use perisim_hal::regs::{DMA_IRQ_BASE, UART_IRQ_RX, UART_IRQ_TX};
use perisim_hal::{DmaDriver, DmaTransferKind, UartDriver};

/// Guest RAM window used for DMA-visible buffers.
const GUEST_RAM_BASE: u32 = 0x2000_0000;
const GUEST_RAM_SIZE: u32 = 0x10_0000;

#[derive(Parser)]
#[command(name = "perisim-demo", about = "Peripheral simulator demos")]
struct Cli {
    /// Plugin worker tick period in milliseconds.
    #[arg(long, default_value_t = 1000)]
    tick_ms: u64,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// UART transmit/receive scenario.
    Uart,
    /// DMA memory-to-memory copy scenario.
    Dma,
    /// Fault on an unmapped trapped address (exits non-zero).
    Fault,
}

/// Static register mapping plan: peripheral windows and the plugins that
/// own them.
const REGISTER_MAPPINGS: &[(u32, u32, &str)] = &[
    (0x4000_2000, 0x4000_2050, "uart0"),
    (0x4000_6000, 0x4000_6400, "dma0"),
];

fn signal_plan() -> Vec<(i32, &'static str, u32)> {
    let rtmin = libc::SIGRTMIN();
    let mut plan = vec![
        (rtmin, "uart0", UART_IRQ_TX),
        (rtmin + 1, "uart0", UART_IRQ_RX),
    ];
    for ch in 0..8 {
        plan.push((rtmin + 2 + ch, "dma0", DMA_IRQ_BASE + ch as u32));
    }
    plan
}

fn bring_up(tick: Duration) -> Result<()> {
    perisim::sim_init().context("simulator init failed")?;
    perisim::map_guest_ram(GUEST_RAM_BASE, GUEST_RAM_SIZE)
        .context("guest RAM mapping failed")?;

    perisim::register_plugin(Box::new(UartPlugin::with_tick("uart0", tick)))
        .context("uart0 registration failed")?;
    perisim::register_plugin(Box::new(DmaPlugin::with_tick("dma0", tick)))
        .context("dma0 registration failed")?;

    for &(start, end, module) in REGISTER_MAPPINGS {
        perisim::add_register_mapping(start, end, module)
            .with_context(|| format!("register mapping for {module} failed"))?;
    }
    for (signal, module, irq) in signal_plan() {
        perisim::add_signal_mapping(signal, module, irq)
            .with_context(|| format!("signal mapping for {module} IRQ {irq} failed"))?;
    }
    Ok(())
}

fn uart_demo(tick: Duration) -> Result<()> {
    bring_up(tick)?;

    let mut uart = UartDriver::new(0);
    uart.init().context("uart driver init failed")?;

    println!("sending byte 0x41 ('A')");
    uart.send_byte(0x41)?;
    println!("sending string \"Hello\"");
    uart.send_str("Hello")?;

    println!("waiting for synthetic receive data...");
    let rx_budget = tick.as_millis() as u64 * 12;
    for _ in 0..3 {
        match uart.receive_byte(rx_budget) {
            Ok(byte) => println!("received {byte:#04x} ({})", byte as char),
            Err(e) => println!("no data received: {e}"),
        }
    }

    uart.cleanup();
    perisim::sim_cleanup();
    Ok(())
}

fn dma_demo(tick: Duration) -> Result<()> {
    bring_up(tick)?;

    let src = GUEST_RAM_BASE;
    let dst = GUEST_RAM_BASE + 0x1000;
    let len = 64u32;
    for i in 0..len {
        // SAFETY: the span lies inside the guest RAM window mapped above.
        unsafe { ((src + i) as u64 as *mut u8).write_volatile(i as u8) };
    }

    let dma = DmaDriver::init().context("dma driver init failed")?;
    let channel = dma.allocate_channel()?;
    println!("copying {len} bytes via DMA channel {channel}");

    let budget = tick.as_millis() as u64 * 8 + 1000;
    dma.transfer_sync(channel, src, dst, len, DmaTransferKind::MemToMem, budget)
        .context("dma transfer failed")?;

    let mut mismatches = 0;
    for i in 0..len {
        // SAFETY: as above.
        let got = unsafe { ((dst + i) as u64 as *const u8).read_volatile() };
        if got != i as u8 {
            mismatches += 1;
        }
    }
    if mismatches != 0 {
        bail!("destination mismatch in {mismatches} of {len} bytes");
    }
    println!("destination matches source ({len} bytes)");

    dma.free_channel(channel)?;
    dma.cleanup();
    perisim::sim_cleanup();
    Ok(())
}

fn fault_demo(tick: Duration) -> Result<()> {
    bring_up(tick)?;

    println!("reading unmapped address 0x4000f000 (this terminates the process)");
    // SAFETY: deliberately faults; the trap engine aborts on unmapped
    // addresses.
    let value = unsafe { (0x4000_F000u64 as *const u32).read_volatile() };
    println!("unreachable: read {value:#010x}");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    logger::init(level);

    let tick = Duration::from_millis(cli.tick_ms.max(1));
    match cli.command {
        Command::Uart => uart_demo(tick),
        Command::Dma => dma_demo(tick),
        Command::Fault => fault_demo(tick),
    }?;

    // Give any in-flight worker log lines a moment to drain.
    thread::sleep(Duration::from_millis(20));
    Ok(())
}
