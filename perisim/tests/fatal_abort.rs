//! Accessing an address outside every mapped range is unrecoverable: the
//! trap engine prints a diagnostic and terminates the process. Verified by
//! re-running this test binary as a child and watching it die.

use std::env;
use std::process::Command;

const CHILD_ENV: &str = "PERISIM_FATAL_CHILD";

fn child_body() {
    perisim::sim_init().unwrap();
    perisim::add_register_mapping(0x4000_2000, 0x4000_2050, "uart0").unwrap();

    // No plugin or mapping owns this address; the handler must abort.
    let value = unsafe { std::ptr::read_volatile(0x4000_F000u64 as *const u32) };
    // Not reached; make the failure loud if it ever is.
    println!("unexpectedly read {value:#010x}");
    std::process::exit(0);
}

#[test]
fn unknown_address_terminates_with_diagnostic() {
    if env::var(CHILD_ENV).is_ok() {
        child_body();
        return;
    }

    let exe = env::current_exe().unwrap();
    let output = Command::new(exe)
        .args(["--exact", "unknown_address_terminates_with_diagnostic", "--nocapture"])
        .env(CHILD_ENV, "1")
        .output()
        .expect("failed to spawn child test process");

    assert!(
        !output.status.success(),
        "child survived an unmapped access: {:?}",
        output
    );
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("perisim: fatal"),
        "missing diagnostic in child stderr: {stderr}"
    );
    assert!(stderr.contains("unmapped"), "diagnostic lacks cause: {stderr}");
}
