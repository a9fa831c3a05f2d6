//! MMIO trap engine.
//!
//! Driver loads and stores against guard regions raise SIGSEGV; the handler
//! decodes the faulting instruction, routes the access to the owning plugin,
//! patches the trapped thread's register file with the result, and advances
//! the instruction pointer past the instruction.
//!
//! The handler works synchronously in signal context: pure decode plus a
//! plugin call whose read/write paths are signal-reasonable. Nested faults
//! are fatal by construction — SIGSEGV stays blocked while the handler runs,
//! so a fault inside the handler terminates the process with the default
//! disposition.

use std::ptr;

use crate::decode::{self, MmioOp, MAX_INSN_BYTES};
use crate::error::{Result, SimError};
use crate::protocol::{SimOp, SimRequest};

/// glibc `gregs` indices for general-purpose registers 0-15 in instruction
/// encoding order (rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8-r15).
const GPR_TO_GREG: [i32; 16] = [
    libc::REG_RAX,
    libc::REG_RCX,
    libc::REG_RDX,
    libc::REG_RBX,
    libc::REG_RSP,
    libc::REG_RBP,
    libc::REG_RSI,
    libc::REG_RDI,
    libc::REG_R8,
    libc::REG_R9,
    libc::REG_R10,
    libc::REG_R11,
    libc::REG_R12,
    libc::REG_R13,
    libc::REG_R14,
    libc::REG_R15,
];

/// Install the SIGSEGV fault handler.
pub fn install() -> Result<()> {
    // SAFETY: standard SA_SIGINFO setup. SIGSEGV is implicitly blocked
    // during the handler (no SA_NODEFER), making nested faults fatal.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = trap_handler as usize;
        sa.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut sa.sa_mask);
        if libc::sigaction(libc::SIGSEGV, &sa, ptr::null_mut()) != 0 {
            log::error!("trap: sigaction(SIGSEGV) failed: install rejected");
            return Err(SimError::Config);
        }
    }
    log::info!("trap: fault handler installed");
    Ok(())
}

/// Restore the default SIGSEGV disposition.
pub fn uninstall() {
    // SAFETY: resetting to SIG_DFL is always valid.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(libc::SIGSEGV, &sa, ptr::null_mut());
    }
}

extern "C" fn trap_handler(
    _signal: libc::c_int,
    info: *mut libc::siginfo_t,
    ctx: *mut libc::c_void,
) {
    // SAFETY: the kernel hands us a valid siginfo and ucontext for the
    // faulting thread.
    let fault_addr = unsafe { (*info).si_addr() } as u64;
    let uc = unsafe { &mut *(ctx as *mut libc::ucontext_t) };
    let gregs = &mut uc.uc_mcontext.gregs;

    let sim = crate::simulator();
    let range = match sim.address_map().lookup(fault_addr) {
        Some(r) => r,
        None => fatal(fault_addr, "fault at unmapped address"),
    };

    let rip = gregs[libc::REG_RIP as usize] as u64;
    // SAFETY: RIP points at the faulting instruction in our own text.
    let insn_bytes =
        unsafe { std::slice::from_raw_parts(rip as *const u8, MAX_INSN_BYTES) };
    let insn = match decode::decode(insn_bytes) {
        Some(i) => i,
        None => fatal(fault_addr, "unsupported instruction at trapped address"),
    };

    let addr = fault_addr as u32;
    match insn.op {
        MmioOp::Load { dst } => {
            let request = SimRequest::new(range.module.as_str(), SimOp::RegRead { addr });
            let response = sim.plugin_registry().dispatch(&request);
            if response.error != 0 {
                fatal(fault_addr, "plugin rejected read");
            }
            log::debug!(
                "trap: read {:#010x} -> {:#010x} ({})",
                addr,
                response.value,
                range.module
            );
            // A 32-bit mov zero-extends into the full register.
            gregs[GPR_TO_GREG[dst as usize] as usize] = i64::from(response.value);
        }
        MmioOp::Store { src } => {
            let value = gregs[GPR_TO_GREG[src as usize] as usize] as u32;
            let request =
                SimRequest::new(range.module.as_str(), SimOp::RegWrite { addr, value });
            let response = sim.plugin_registry().dispatch(&request);
            if response.error != 0 {
                fatal(fault_addr, "plugin rejected write");
            }
            log::debug!(
                "trap: write {:#010x} <- {:#010x} ({})",
                addr,
                value,
                range.module
            );
        }
        MmioOp::StoreImm { value } => {
            let request =
                SimRequest::new(range.module.as_str(), SimOp::RegWrite { addr, value });
            let response = sim.plugin_registry().dispatch(&request);
            if response.error != 0 {
                fatal(fault_addr, "plugin rejected write");
            }
            log::debug!(
                "trap: write {:#010x} <- {:#010x} imm ({})",
                addr,
                value,
                range.module
            );
        }
    }

    gregs[libc::REG_RIP as usize] += i64::from(insn.len);
}

/// Emit a one-line diagnostic without allocating and terminate the process.
///
/// Used for the unrecoverable trap-engine conditions: unknown address,
/// undecodable instruction, plugin rejection mid-fault.
fn fatal(addr: u64, reason: &str) -> ! {
    let mut buf = [0u8; 160];
    let mut n = 0;
    for chunk in [b"perisim: fatal: " as &[u8], reason.as_bytes(), b" addr=0x"] {
        let take = chunk.len().min(buf.len() - n - 18);
        buf[n..n + take].copy_from_slice(&chunk[..take]);
        n += take;
    }
    for shift in (0..16).rev() {
        let digit = ((addr >> (shift * 4)) & 0xF) as usize;
        buf[n] = b"0123456789abcdef"[digit];
        n += 1;
    }
    buf[n] = b'\n';
    n += 1;
    // SAFETY: raw write(2) to stderr, then immediate exit; both are
    // async-signal-safe.
    unsafe {
        libc::write(libc::STDERR_FILENO, buf.as_ptr() as *const libc::c_void, n);
        libc::_exit(1);
    }
}
