//! User-space peripheral simulator.
//!
//! Unmodified MMIO driver code runs against register windows that are
//! reserved as inaccessible host memory at their guest addresses. Every
//! load or store faults into the trap engine, which decodes the
//! instruction, routes the access to the owning peripheral plugin, patches
//! the trapped thread's registers with the result, and resumes the driver.
//! Plugins raise interrupts back through POSIX signals, which the router
//! resolves to numbered IRQs and delivers to registered handlers.
//!
//! The simulator is a process-scoped context with an explicit lifecycle:
//! [`sim_init`] installs the fault handler, configuration calls populate
//! the routing tables, and [`sim_cleanup`] tears everything down. Routing
//! tables are append-mostly and lock-free on the read side, so the fault
//! and signal paths never block on configuration state.
//!
//! x86-64 Linux only: the engine relies on identity-mapped guard regions
//! and on decoding the host's `mov` encodings.

mod addrmap;
mod decode;
mod error;
mod guest_ram;
mod irq;
mod plugin;
mod protocol;
mod sigmap;
mod trap;

pub mod plugins;

pub use addrmap::{AddressMap, RegisterRange, MAX_REG_MAPPINGS};
pub use decode::{decode, DecodedInsn, MmioOp, MAX_INSN_BYTES};
pub use error::{Result, SimError};
pub use guest_ram::{GuestRam, MAX_RAM_WINDOWS};
pub use irq::{IrqHandler, IrqTable, MAX_INTERRUPTS};
pub use plugin::{instance_index, Peripheral, PluginRegistry, MAX_PLUGINS, MAX_PLUGIN_NAME};
pub use protocol::{ClockAction, ResetAction, SimOp, SimRequest, SimResponse};
pub use sigmap::{SignalMap, MAX_SIGNAL_MAPPINGS};

use std::sync::atomic::{AtomicBool, Ordering};

/// The process-scoped simulator context.
///
/// All state lives here; the free functions below are thin wrappers over
/// the one instance returned by [`simulator`].
pub struct Simulator {
    addr_map: AddressMap,
    signal_map: SignalMap,
    irq_table: IrqTable,
    plugins: PluginRegistry,
    guest_ram: GuestRam,
    initialized: AtomicBool,
}

impl Simulator {
    const fn new() -> Self {
        Self {
            addr_map: AddressMap::new(),
            signal_map: SignalMap::new(),
            irq_table: IrqTable::new(),
            plugins: PluginRegistry::new(),
            guest_ram: GuestRam::new(),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn address_map(&self) -> &AddressMap {
        &self.addr_map
    }

    pub fn signal_map(&self) -> &SignalMap {
        &self.signal_map
    }

    pub fn irq_table(&self) -> &IrqTable {
        &self.irq_table
    }

    pub fn plugin_registry(&self) -> &PluginRegistry {
        &self.plugins
    }

    pub fn guest_ram(&self) -> &GuestRam {
        &self.guest_ram
    }
}

static SIM: Simulator = Simulator::new();

/// Access the process-scoped simulator.
pub fn simulator() -> &'static Simulator {
    &SIM
}

/// Bring the simulator up: installs the MMIO fault handler.
///
/// Idempotent; returns `Config` only if the handler cannot be installed.
pub fn sim_init() -> Result<()> {
    if SIM.initialized.swap(true, Ordering::AcqRel) {
        log::debug!("sim: already initialised");
        return Ok(());
    }
    trap::install()?;
    log::info!("sim: initialised");
    Ok(())
}

/// Tear the simulator down: plugins are cleaned up in reverse registration
/// order, guard regions and guest RAM are unmapped, signal dispositions are
/// restored. Cleanup is best-effort and never panics over a plugin.
pub fn sim_cleanup() {
    SIM.plugins.cleanup_all();
    SIM.signal_map.clear();
    SIM.irq_table.clear();
    SIM.addr_map.clear();
    SIM.guest_ram.clear();
    if SIM.initialized.swap(false, Ordering::AcqRel) {
        trap::uninstall();
    }
    log::info!("sim: cleaned up");
}

/// Map `[start, end)` as the trapped register window of plugin `module`.
pub fn add_register_mapping(start: u32, end: u32, module: &str) -> Result<()> {
    SIM.addr_map.add(start, end, module)
}

/// Bind an OS signal to `(module, irq)` for interrupt delivery.
pub fn add_signal_mapping(signal: i32, module: &str, irq: u32) -> Result<()> {
    SIM.signal_map.add(signal, module, irq)
}

/// Register (or replace) the handler for `irq` and enable the line.
pub fn register_interrupt_handler(irq: u32, handler: IrqHandler) -> Result<()> {
    SIM.irq_table.register(irq, handler)
}

pub fn enable_interrupt(irq: u32) -> Result<()> {
    SIM.irq_table.enable(irq)
}

pub fn disable_interrupt(irq: u32) -> Result<()> {
    SIM.irq_table.disable(irq)
}

/// Raise the interrupt bound to `(module, irq)`.
///
/// Used by plugin workers; also handy for drivers and tests.
pub fn trigger_interrupt(module: &str, irq: u32) -> Result<()> {
    SIM.signal_map.trigger(module, irq)
}

/// Register a peripheral plugin and run its `init`.
pub fn register_plugin(plugin: Box<dyn Peripheral>) -> Result<()> {
    SIM.plugins.register(plugin)
}

/// Look a registered plugin up by name.
pub fn find_plugin(name: &str) -> Option<&'static dyn Peripheral> {
    SIM.plugins.find(name)
}

/// Route a request to its plugin and return the response.
pub fn dispatch(request: &SimRequest<'_>) -> SimResponse {
    SIM.plugins.dispatch(request)
}

/// Map an accessible guest RAM window for DMA-visible buffers.
pub fn map_guest_ram(start: u32, len: u32) -> Result<()> {
    SIM.guest_ram.map(start, len)
}
