use std::collections::{HashSet, VecDeque};
use std::net::{Ipv4Addr, TcpListener};

/// Hands out loopback ports from a fixed range
///
/// A port is leased by at most one running instance. Ports that some other
/// process already holds are skipped at allocation time.
#[derive(Debug)]
pub struct PortAllocator {
    free: VecDeque<u16>,
    leased: HashSet<u16>,
    bind_check: bool,
}

impl PortAllocator {
    pub fn new(base: u16, count: u16) -> Self {
        let end = base.saturating_add(count);
        Self {
            free: (base..end).collect(),
            leased: HashSet::new(),
            bind_check: true,
        }
    }

    /// Skip the loopback bind check (tests with in-process engines)
    pub fn without_bind_check(mut self) -> Self {
        self.bind_check = false;
        self
    }

    /// Lease the next port that is free on this host
    pub fn allocate(&mut self) -> Option<u16> {
        for _ in 0..self.free.len() {
            let port = self.free.pop_front()?;
            if !self.bind_check || is_bindable(port) {
                self.leased.insert(port);
                return Some(port);
            }
            // Busy elsewhere; try it again later
            self.free.push_back(port);
        }
        None
    }

    /// Return a leased port; unknown ports are ignored
    pub fn release(&mut self, port: u16) {
        if self.leased.remove(&port) {
            self.free.push_back(port);
        }
    }

    pub fn leased(&self) -> usize {
        self.leased.len()
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }
}

fn is_bindable(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_release() {
        let mut ports = PortAllocator::new(20_000, 2).without_bind_check();
        assert_eq!(ports.allocate(), Some(20_000));
        assert_eq!(ports.allocate(), Some(20_001));
        assert_eq!(ports.allocate(), None);

        ports.release(20_000);
        assert_eq!(ports.leased(), 1);
        assert_eq!(ports.allocate(), Some(20_000));
    }

    #[test]
    fn test_release_ignores_unleased_ports() {
        let mut ports = PortAllocator::new(20_000, 1).without_bind_check();
        ports.release(20_000);
        ports.release(9);
        assert_eq!(ports.available(), 1);
    }

    #[test]
    fn test_busy_port_is_skipped() {
        let holder = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let busy = holder.local_addr().unwrap().port();

        let mut ports = PortAllocator::new(busy, 1);
        assert_eq!(ports.allocate(), None);
        assert_eq!(ports.available(), 1);

        drop(holder);
        assert_eq!(ports.allocate(), Some(busy));
    }
}
