//! Host port allocation for a server's published ports.
//!
//! Two independent groups are scanned, each from its own baseline with its
//! own monotonically increasing cursor: the notebook UI port and the Spark UI
//! range. A port counts as free when a loopback bind succeeds at check time;
//! the check is best-effort, nothing is reserved.

use std::net::TcpListener;

use crate::runtime::PortMapping;

/// Container port the notebook service listens on.
pub const NOTEBOOK_PORT: u16 = 8888;
/// First container port of the Spark UI range.
pub const AUX_PORT_BASE: u16 = 4040;
/// Number of consecutive Spark UI ports published.
pub const AUX_PORT_COUNT: u16 = 21;

pub fn loopback_port_is_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Allocate up to `count` distinct host ports scanning upward from `start`,
/// stepping past every port `is_free` rejects. The scan stops at the top of
/// the port space, so a fully occupied tail yields a short result instead of
/// wrapping.
pub fn allocate_group(start: u16, count: u16, is_free: &dyn Fn(u16) -> bool) -> Vec<u16> {
    let mut cursor = u32::from(start);
    let mut allocated = Vec::with_capacity(count as usize);
    for _ in 0..count {
        while cursor <= u32::from(u16::MAX) && !is_free(cursor as u16) {
            cursor += 1;
        }
        if cursor > u32::from(u16::MAX) {
            break;
        }
        allocated.push(cursor as u16);
        cursor += 1;
    }
    allocated
}

fn group_mapping(
    container_base: u16,
    host_base: u16,
    count: u16,
    is_free: &dyn Fn(u16) -> bool,
) -> Vec<PortMapping> {
    allocate_group(host_base, count, is_free)
        .into_iter()
        .enumerate()
        .map(|(i, host_port)| PortMapping {
            container_port: container_base + i as u16,
            host_port,
        })
        .collect()
}

pub fn notebook_ports_mapping(is_free: &dyn Fn(u16) -> bool) -> Vec<PortMapping> {
    group_mapping(NOTEBOOK_PORT, NOTEBOOK_PORT, 1, is_free)
}

pub fn aux_ports_mapping(is_free: &dyn Fn(u16) -> bool) -> Vec<PortMapping> {
    group_mapping(AUX_PORT_BASE, AUX_PORT_BASE, AUX_PORT_COUNT, is_free)
}

/// Full port mapping for a new server: Spark UI range plus notebook UI port,
/// each group scanned independently against the live loopback check.
pub fn ports_mapping() -> Vec<PortMapping> {
    let is_free = loopback_port_is_free;
    let mut mappings = aux_ports_mapping(&is_free);
    mappings.extend(notebook_ports_mapping(&is_free));
    mappings
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn allocates_requested_count_distinct_and_monotonic() {
        let everything_free = |_: u16| true;
        let ports = allocate_group(4040, 21, &everything_free);
        assert_eq!(ports.len(), 21);
        let unique: HashSet<_> = ports.iter().collect();
        assert_eq!(unique.len(), 21);
        assert!(ports.iter().all(|&p| p >= 4040));
        assert!(ports.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn skips_occupied_ports() {
        let occupied: HashSet<u16> = [8888, 8890].into_iter().collect();
        let is_free = |p: u16| !occupied.contains(&p);
        let ports = allocate_group(8888, 3, &is_free);
        assert_eq!(ports, vec![8889, 8891, 8892]);
    }

    #[test]
    fn never_returns_a_port_with_a_live_listener() {
        // Occupy a port in the scan path and verify it is stepped over.
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let held = listener.local_addr().unwrap().port();

        let ports = allocate_group(held, 2, &loopback_port_is_free);
        assert!(!ports.contains(&held));
        assert_eq!(ports.len(), 2);
        assert!(ports.iter().all(|&p| p > held));
    }

    #[test]
    fn scan_stops_at_the_top_of_the_port_space() {
        let everything_free = |_: u16| true;
        let ports = allocate_group(u16::MAX - 1, 5, &everything_free);
        assert_eq!(ports, vec![u16::MAX - 1, u16::MAX]);

        let nothing_free = |_: u16| false;
        assert!(allocate_group(u16::MAX - 1, 2, &nothing_free).is_empty());
    }

    #[test]
    fn groups_scan_from_their_own_baselines() {
        let everything_free = |_: u16| true;
        let aux = aux_ports_mapping(&everything_free);
        let notebook = notebook_ports_mapping(&everything_free);

        assert_eq!(aux.first().unwrap().container_port, AUX_PORT_BASE);
        assert_eq!(aux.last().unwrap().container_port, AUX_PORT_BASE + 20);
        assert_eq!(notebook[0].container_port, NOTEBOOK_PORT);
        assert_eq!(notebook[0].host_port, NOTEBOOK_PORT);
    }
}
