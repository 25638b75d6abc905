//! Public port bookkeeping for tcp and udp proxies.

use rift_core::{RiftError, RiftResult};
use std::collections::HashSet;

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

/// Parse `"2000-3000,3001,4000-4010"` into ranges. An empty string means no restriction.
pub fn parse_port_ranges(list: &str) -> RiftResult<Vec<PortRange>> {
    let mut ranges = Vec::new();
    for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let range = match part.split_once('-') {
            Some((a, b)) => {
                let start = parse_port(a)?;
                let end = parse_port(b)?;
                if start > end {
                    return Err(RiftError::Config(format!("invalid port range: {part}")));
                }
                PortRange { start, end }
            }
            None => {
                let p = parse_port(part)?;
                PortRange { start: p, end: p }
            }
        };
        ranges.push(range);
    }
    Ok(ranges)
}

fn parse_port(s: &str) -> RiftResult<u16> {
    s.trim()
        .parse::<u16>()
        .map_err(|_| RiftError::Config(format!("invalid port: {s}")))
}

/// Tracks which public ports are in use. Allocation itself happens by binding.
#[derive(Debug, Default)]
pub struct PortAllocator {
    allowed: Vec<PortRange>,
    used: HashSet<u16>,
}

impl PortAllocator {
    pub fn new(allowed: Vec<PortRange>) -> Self {
        Self {
            allowed,
            used: HashSet::new(),
        }
    }

    pub fn is_allowed(&self, port: u16) -> bool {
        self.allowed.is_empty() || self.allowed.iter().any(|r| r.contains(port))
    }

    /// Whether a specific port may be claimed right now.
    pub fn check(&self, port: u16) -> RiftResult<()> {
        if !self.is_allowed(port) {
            return Err(RiftError::EndpointUnavailable(format!(
                "port {port} is not allowed"
            )));
        }
        if self.used.contains(&port) {
            return Err(RiftError::EndpointUnavailable(format!(
                "port {port} already used"
            )));
        }
        Ok(())
    }

    /// Free, allowed ports to try for an unspecified request, in order.
    ///
    /// Returns `None` when any port is allowed, meaning the OS should choose.
    pub fn candidates(&self) -> Option<impl Iterator<Item = u16> + '_> {
        if self.allowed.is_empty() {
            return None;
        }
        Some(
            self.allowed
                .iter()
                .flat_map(|r| r.start..=r.end)
                .filter(|p| *p != 0 && !self.used.contains(p)),
        )
    }

    pub fn mark_used(&mut self, port: u16) {
        self.used.insert(port);
    }

    pub fn release(&mut self, port: u16) {
        self.used.remove(&port);
    }

    pub fn in_use(&self) -> usize {
        self.used.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mixed_ranges() {
        let ranges = parse_port_ranges("2000-3000, 3001,4000-4000").unwrap();
        assert_eq!(
            ranges,
            vec![
                PortRange { start: 2000, end: 3000 },
                PortRange { start: 3001, end: 3001 },
                PortRange { start: 4000, end: 4000 },
            ]
        );
        assert!(parse_port_ranges("").unwrap().is_empty());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_port_ranges("3000-2000").is_err());
        assert!(parse_port_ranges("abc").is_err());
        assert!(parse_port_ranges("70000").is_err());
    }

    #[test]
    fn allocator_enforces_allowed_and_used() {
        let mut alloc = PortAllocator::new(parse_port_ranges("6000-6002").unwrap());
        assert!(alloc.check(6001).is_ok());
        assert!(alloc.check(7000).is_err());
        alloc.mark_used(6001);
        assert!(alloc.check(6001).is_err());
        let free: Vec<u16> = alloc.candidates().unwrap().collect();
        assert_eq!(free, vec![6000, 6002]);
        alloc.release(6001);
        assert!(alloc.check(6001).is_ok());
    }

    #[test]
    fn unrestricted_allocator_defers_to_os() {
        let alloc = PortAllocator::default();
        assert!(alloc.candidates().is_none());
        assert!(alloc.check(12345).is_ok());
    }
}
