//! Peripheral plugin contract, registry, and request dispatch.
//!
//! A plugin owns the register state of one peripheral instance and models
//! its behaviour; the registry resolves plugins by name and translates
//! routed requests into trait calls.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::{Result, SimError};
use crate::protocol::{ClockAction, ResetAction, SimOp, SimRequest, SimResponse};

/// Maximum number of registered plugins.
pub const MAX_PLUGINS: usize = 32;

/// Maximum plugin name length in bytes.
pub const MAX_PLUGIN_NAME: usize = 31;

/// The contract every peripheral model implements.
///
/// `read` and `write` are called from the trap engine while a driver thread
/// is suspended mid-instruction: they may briefly take the plugin's own
/// lock and raise interrupts, but must not block indefinitely. State shared
/// with a background worker is the plugin's own responsibility to
/// synchronise.
pub trait Peripheral: Send + Sync {
    /// Unique registry name, e.g. `uart0`. A trailing decimal index selects
    /// the instance's 4 KiB register window.
    fn name(&self) -> &str;

    /// Called once at registration. May spawn workers.
    fn init(&self) -> Result<()>;

    /// Stop workers and release resources. Idempotent.
    fn cleanup(&self);

    /// Reset line control. `Assert` zeroes state and stops workers.
    fn reset(&self, action: ResetAction) -> Result<()>;

    /// Clock control; `Tick` advances the model by `cycles` steps.
    fn clock(&self, action: ClockAction, cycles: u32) -> Result<()>;

    /// Read the register at the absolute guest address `addr`.
    fn read(&self, addr: u32) -> u32;

    /// Write the register at the absolute guest address `addr`.
    fn write(&self, addr: u32, value: u32) -> Result<()>;

    /// Notification that `irq` was delivered to this plugin. Reserved for
    /// bidirectional models; most plugins only log it.
    fn interrupt(&self, irq: u32) -> Result<()>;
}

/// Parse the instance index from a trailing decimal suffix (`uart2` -> 2).
/// Names without a suffix are instance 0.
pub fn instance_index(name: &str) -> u32 {
    let digits: String = name
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits.parse().unwrap_or(0)
}

struct PluginEntry {
    plugin: Box<dyn Peripheral>,
}

/// Fixed-capacity, name-indexed plugin registry.
pub struct PluginRegistry {
    slots: [AtomicPtr<PluginEntry>; MAX_PLUGINS],
    count: AtomicUsize,
    writers: Mutex<()>,
}

impl PluginRegistry {
    pub const fn new() -> Self {
        const EMPTY: AtomicPtr<PluginEntry> = AtomicPtr::new(ptr::null_mut());
        Self {
            slots: [EMPTY; MAX_PLUGINS],
            count: AtomicUsize::new(0),
            writers: Mutex::new(()),
        }
    }

    /// Register a plugin and run its `init`. Names must be unique, ASCII,
    /// and at most [`MAX_PLUGIN_NAME`] bytes.
    pub fn register(&self, plugin: Box<dyn Peripheral>) -> Result<()> {
        let name = plugin.name();
        if name.is_empty() || name.len() > MAX_PLUGIN_NAME || !name.is_ascii() {
            log::error!("registry: invalid plugin name {:?}: rejected", name);
            return Err(SimError::Config);
        }
        let _guard = self.writers.lock().unwrap();

        let count = self.count.load(Ordering::Acquire);
        if count >= MAX_PLUGINS {
            log::error!("registry: table full: {} rejected", name);
            return Err(SimError::Config);
        }
        for i in 0..count {
            // SAFETY: slots below `count` are published entries.
            let existing = unsafe { &*self.slots[i].load(Ordering::Acquire) };
            if existing.plugin.name() == name {
                log::error!("registry: duplicate plugin name {}: rejected", name);
                return Err(SimError::Config);
            }
        }

        plugin.init()?;

        let entry = Box::into_raw(Box::new(PluginEntry { plugin }));
        self.slots[count].store(entry, Ordering::Release);
        self.count.store(count + 1, Ordering::Release);
        // SAFETY: entry was just published and stays valid until clear.
        let name = unsafe { &*entry }.plugin.name();
        log::info!("registry: plugin {} registered", name);
        Ok(())
    }

    /// Look a plugin up by name. Lock-free; safe in signal context.
    pub fn find(&self, name: &str) -> Option<&dyn Peripheral> {
        let count = self.count.load(Ordering::Acquire);
        for i in 0..count {
            // SAFETY: slots below `count` are published, immutable entries.
            let entry = unsafe { &*self.slots[i].load(Ordering::Acquire) };
            if entry.plugin.name() == name {
                return Some(entry.plugin.as_ref());
            }
        }
        None
    }

    /// Route a request to the owning plugin and build its response.
    pub fn dispatch(&self, request: &SimRequest<'_>) -> SimResponse {
        let plugin = match self.find(request.module) {
            Some(p) => p,
            None => {
                log::error!(
                    "registry: dispatch to unknown plugin {}: failed",
                    request.module
                );
                return SimResponse {
                    id: request.id,
                    value: 0,
                    error: -1,
                };
            }
        };

        let (value, error) = match request.op {
            SimOp::RegRead { addr } => (plugin.read(addr), 0),
            SimOp::RegWrite { addr, value } => match plugin.write(addr, value) {
                Ok(()) => (0, 0),
                Err(_) => (0, -1),
            },
            SimOp::Clock { action, cycles } => match plugin.clock(action, cycles) {
                Ok(()) => (0, 0),
                Err(_) => (0, -1),
            },
            SimOp::Reset { action } => match plugin.reset(action) {
                Ok(()) => (0, 0),
                Err(_) => (0, -1),
            },
            SimOp::Interrupt { irq } => match plugin.interrupt(irq) {
                Ok(()) => (0, 0),
                Err(_) => (0, -1),
            },
        };

        SimResponse {
            id: request.id,
            value,
            error,
        }
    }

    /// Run every plugin's `cleanup` in reverse registration order, then
    /// empty the registry. Cleanup failures are the plugins' to log; the
    /// sweep itself never stops early.
    pub fn cleanup_all(&self) {
        let _guard = self.writers.lock().unwrap();
        let count = self.count.load(Ordering::Acquire);
        for i in (0..count).rev() {
            // SAFETY: slots below `count` are published entries.
            let entry = unsafe { &*self.slots[i].load(Ordering::Acquire) };
            entry.plugin.cleanup();
        }
        self.count.store(0, Ordering::Release);
        for i in (0..count).rev() {
            let ptr = self.slots[i].swap(ptr::null_mut(), Ordering::AcqRel);
            if !ptr.is_null() {
                // SAFETY: pointer came from Box::into_raw in `register`.
                drop(unsafe { Box::from_raw(ptr) });
            }
        }
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    struct Scratch {
        name: String,
        last_write: AtomicU32,
        cleanups: Arc<AtomicU32>,
    }

    impl Peripheral for Scratch {
        fn name(&self) -> &str {
            &self.name
        }
        fn init(&self) -> Result<()> {
            Ok(())
        }
        fn cleanup(&self) {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
        }
        fn reset(&self, _action: ResetAction) -> Result<()> {
            self.last_write.store(0, Ordering::SeqCst);
            Ok(())
        }
        fn clock(&self, _action: ClockAction, _cycles: u32) -> Result<()> {
            Ok(())
        }
        fn read(&self, _addr: u32) -> u32 {
            self.last_write.load(Ordering::SeqCst)
        }
        fn write(&self, _addr: u32, value: u32) -> Result<()> {
            self.last_write.store(value, Ordering::SeqCst);
            Ok(())
        }
        fn interrupt(&self, _irq: u32) -> Result<()> {
            Ok(())
        }
    }

    fn scratch(name: &str, cleanups: &Arc<AtomicU32>) -> Box<dyn Peripheral> {
        Box::new(Scratch {
            name: name.to_owned(),
            last_write: AtomicU32::new(0),
            cleanups: Arc::clone(cleanups),
        })
    }

    #[test]
    fn register_find_roundtrip() {
        let cleanups = Arc::new(AtomicU32::new(0));
        let registry = PluginRegistry::new();
        registry.register(scratch("dev0", &cleanups)).unwrap();

        assert_eq!(registry.find("dev0").unwrap().name(), "dev0");
        assert!(registry.find("dev1").is_none());
    }

    #[test]
    fn duplicate_and_invalid_names_rejected() {
        let cleanups = Arc::new(AtomicU32::new(0));
        let registry = PluginRegistry::new();
        registry.register(scratch("dev0", &cleanups)).unwrap();
        assert_eq!(
            registry.register(scratch("dev0", &cleanups)),
            Err(SimError::Config)
        );
        assert_eq!(registry.register(scratch("", &cleanups)), Err(SimError::Config));
        let long = "x".repeat(MAX_PLUGIN_NAME + 1);
        assert_eq!(
            registry.register(scratch(&long, &cleanups)),
            Err(SimError::Config)
        );
    }

    #[test]
    fn dispatch_write_then_read() {
        let cleanups = Arc::new(AtomicU32::new(0));
        let registry = PluginRegistry::new();
        registry.register(scratch("dev0", &cleanups)).unwrap();

        let write = SimRequest::new(
            "dev0",
            SimOp::RegWrite {
                addr: 0x10,
                value: 0xABCD,
            },
        );
        let resp = registry.dispatch(&write);
        assert_eq!(resp.error, 0);
        assert_eq!(resp.id, write.id);

        let read = SimRequest::new("dev0", SimOp::RegRead { addr: 0x10 });
        let resp = registry.dispatch(&read);
        assert_eq!(resp.value, 0xABCD);
        assert_eq!(resp.error, 0);
    }

    #[test]
    fn dispatch_translates_clock_reset_and_interrupt() {
        let cleanups = Arc::new(AtomicU32::new(0));
        let registry = PluginRegistry::new();
        registry.register(scratch("dev0", &cleanups)).unwrap();

        let write = SimRequest::new("dev0", SimOp::RegWrite { addr: 0, value: 7 });
        assert_eq!(registry.dispatch(&write).error, 0);

        let clock = SimRequest::new(
            "dev0",
            SimOp::Clock {
                action: ClockAction::Tick,
                cycles: 4,
            },
        );
        assert_eq!(registry.dispatch(&clock).error, 0);

        let irq = SimRequest::new("dev0", SimOp::Interrupt { irq: 5 });
        assert_eq!(registry.dispatch(&irq).error, 0);

        // Reset zeroes the scratch register; a later read sees it.
        let reset = SimRequest::new(
            "dev0",
            SimOp::Reset {
                action: ResetAction::Assert,
            },
        );
        assert_eq!(registry.dispatch(&reset).error, 0);
        let read = SimRequest::new("dev0", SimOp::RegRead { addr: 0 });
        assert_eq!(registry.dispatch(&read).value, 0);
    }

    #[test]
    fn dispatch_to_missing_plugin_errors() {
        let registry = PluginRegistry::new();
        let req = SimRequest::new("ghost", SimOp::RegRead { addr: 0 });
        assert_eq!(registry.dispatch(&req).error, -1);
    }

    #[test]
    fn cleanup_all_runs_and_empties() {
        let cleanups = Arc::new(AtomicU32::new(0));
        let registry = PluginRegistry::new();
        registry.register(scratch("dev0", &cleanups)).unwrap();
        registry.register(scratch("dev1", &cleanups)).unwrap();
        registry.cleanup_all();
        assert_eq!(cleanups.load(Ordering::SeqCst), 2);
        assert!(registry.find("dev0").is_none());
    }

    #[test]
    fn instance_suffix_parsing() {
        assert_eq!(instance_index("uart0"), 0);
        assert_eq!(instance_index("uart2"), 2);
        assert_eq!(instance_index("dma12"), 12);
        assert_eq!(instance_index("dma"), 0);
    }
}
