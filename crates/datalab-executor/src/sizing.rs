//! Default resource limits derived from host capacity. Leave headroom for
//! the host OS, hand everything else to the server. Explicit caller-supplied
//! limits always take precedence over these defaults.

use sysinfo::System;

/// Logical CPUs kept back for the host.
pub const CPU_RESERVATION: usize = 1;
/// Memory kept back for the host.
pub const MEMORY_RESERVATION_BYTES: u64 = 2 * 1024 * 1024 * 1024;
/// Share of total memory granted on hosts too small to cover the reservation.
const LOW_MEMORY_FRACTION: f64 = 0.7;

pub fn cpu_limit_for(total_cpus: usize) -> usize {
    total_cpus.saturating_sub(CPU_RESERVATION).max(1)
}

pub fn memory_limit_for(total_bytes: u64) -> u64 {
    if total_bytes <= MEMORY_RESERVATION_BYTES {
        (total_bytes as f64 * LOW_MEMORY_FRACTION) as u64
    } else {
        total_bytes - MEMORY_RESERVATION_BYTES
    }
}

/// Default CPU core limit for this host.
pub fn default_cpu_limit() -> usize {
    let mut system = System::new();
    system.refresh_cpu();
    cpu_limit_for(system.cpus().len())
}

/// Default memory limit in bytes for this host.
pub fn default_memory_limit() -> u64 {
    let mut system = System::new();
    system.refresh_memory();
    memory_limit_for(system.total_memory())
}
