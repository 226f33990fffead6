//! Fixed pool of runtime ports.
//!
//! A FIFO free list plus a held set, both behind one mutex, so a released
//! port goes to the back of the line and is never handed out twice.

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::collections::VecDeque;

pub struct PortPool {
    state: Mutex<PoolState>,
    capacity: usize,
}

#[derive(Default)]
struct PoolState {
    free: VecDeque<u16>,
    held: FxHashSet<u16>,
}

impl PortPool {
    pub fn new(ports: impl IntoIterator<Item = u16>) -> Self {
        let mut seen = FxHashSet::default();
        let free: VecDeque<u16> = ports.into_iter().filter(|p| seen.insert(*p)).collect();
        let capacity = free.len();
        Self {
            state: Mutex::new(PoolState {
                free,
                held: FxHashSet::default(),
            }),
            capacity,
        }
    }

    /// Take the oldest free port.
    pub fn allocate(&self) -> Option<u16> {
        let mut state = self.state.lock();
        let port = state.free.pop_front()?;
        state.held.insert(port);
        Some(port)
    }

    /// Return a port. Ports not currently held are ignored.
    pub fn release(&self, port: u16) -> bool {
        let mut state = self.state.lock();
        if state.held.remove(&port) {
            state.free.push_back(port);
            true
        } else {
            false
        }
    }

    pub fn available(&self) -> usize {
        self.state.lock().free.len()
    }

    pub fn in_use(&self) -> usize {
        self.state.lock().held.len()
    }

    pub fn is_held(&self, port: u16) -> bool {
        self.state.lock().held.contains(&port)
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_allocate_until_exhausted() {
        let pool = PortPool::new(5200..5203);
        assert_eq!(pool.allocate(), Some(5200));
        assert_eq!(pool.allocate(), Some(5201));
        assert_eq!(pool.allocate(), Some(5202));
        assert_eq!(pool.allocate(), None);
        assert_eq!(pool.in_use(), 3);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_release_is_fifo() {
        let pool = PortPool::new(5200..5203);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert!(pool.is_held(a));
        assert!(pool.release(a));
        assert!(!pool.is_held(a));
        assert!(pool.is_held(b));
        assert_eq!(pool.allocate(), Some(5202));
        assert_eq!(pool.allocate(), Some(a));
        assert!(pool.is_held(a));
    }

    #[test]
    fn test_release_unheld_ignored() {
        let pool = PortPool::new([5200]);
        assert!(!pool.release(5200));
        assert!(!pool.release(9999));
        assert_eq!(pool.available(), 1);

        let port = pool.allocate().unwrap();
        assert!(pool.release(port));
        assert!(!pool.release(port));
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_duplicate_ports_collapsed() {
        let pool = PortPool::new([5200, 5200, 5201]);
        assert_eq!(pool.capacity(), 2);
    }

    #[test]
    fn test_concurrent_allocations_unique() {
        let pool = Arc::new(PortPool::new(6000..6064));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || (0..8).filter_map(|_| pool.allocate()).collect::<Vec<_>>())
            })
            .collect();

        let mut all = FxHashSet::default();
        for handle in handles {
            for port in handle.join().unwrap() {
                assert!(all.insert(port), "port {port} handed out twice");
            }
        }
        assert_eq!(all.len(), 64);
        assert_eq!(pool.allocate(), None);
    }
}
