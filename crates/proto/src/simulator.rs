use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::stats::PacketLossSimulation;

#[derive(Debug)]
struct DelayedPackage {
    release_time: Instant,
    data: Vec<u8>,
    addr: SocketAddr,
}

impl PartialEq for DelayedPackage {
    fn eq(&self, other: &Self) -> bool {
        self.release_time == other.release_time
    }
}

impl Eq for DelayedPackage {}

impl PartialOrd for DelayedPackage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedPackage {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order for min-heap
        other.release_time.cmp(&self.release_time)
    }
}

/// Holds packages back for a per-address simulated latency, releasing
/// them once their time has come. Loss is decided by the caller via
/// [`NetworkSimulator::should_drop`] before a package is ever enqueued.
#[derive(Debug, Default)]
pub struct NetworkSimulator {
    configs: HashMap<SocketAddr, PacketLossSimulation>,
    inbound_queue: BinaryHeap<DelayedPackage>,
    outbound_queue: BinaryHeap<DelayedPackage>,
}

impl NetworkSimulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_config(&mut self, addr: SocketAddr, config: PacketLossSimulation) {
        if config.enabled {
            self.configs.insert(addr, config);
        } else {
            self.configs.remove(&addr);
        }
    }

    pub fn get_config(&self, addr: &SocketAddr) -> Option<&PacketLossSimulation> {
        self.configs.get(addr)
    }

    pub fn should_drop(&self, addr: &SocketAddr) -> bool {
        self.configs.get(addr).is_some_and(|sim| sim.should_drop())
    }

    pub fn delay_for(&self, addr: &SocketAddr) -> Duration {
        self.configs.get(addr).map_or(Duration::ZERO, |sim| {
            Duration::from_millis(sim.delay_ms() as u64)
        })
    }

    pub fn enqueue_inbound(&mut self, data: Vec<u8>, addr: SocketAddr) {
        let delay = self.delay_for(&addr);
        self.inbound_queue.push(DelayedPackage {
            release_time: Instant::now() + delay,
            data,
            addr,
        });
    }

    pub fn enqueue_outbound(&mut self, data: Vec<u8>, addr: SocketAddr) {
        let delay = self.delay_for(&addr);
        self.outbound_queue.push(DelayedPackage {
            release_time: Instant::now() + delay,
            data,
            addr,
        });
    }

    pub fn take_inbound(&mut self) -> Vec<(Vec<u8>, SocketAddr)> {
        Self::take_released(&mut self.inbound_queue)
    }

    pub fn take_outbound(&mut self) -> Vec<(Vec<u8>, SocketAddr)> {
        Self::take_released(&mut self.outbound_queue)
    }

    fn take_released(queue: &mut BinaryHeap<DelayedPackage>) -> Vec<(Vec<u8>, SocketAddr)> {
        let mut packages = Vec::new();
        let now = Instant::now();
        while let Some(delayed) = queue.peek() {
            if delayed.release_time > now {
                break;
            }
            let delayed = queue.pop().unwrap();
            packages.push((delayed.data, delayed.addr));
        }
        packages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[test]
    fn undelayed_packages_release_immediately() {
        let mut sim = NetworkSimulator::new();
        sim.enqueue_inbound(vec![1], addr());
        sim.enqueue_inbound(vec![2], addr());

        let released = sim.take_inbound();
        assert_eq!(released.len(), 2);
    }

    #[test]
    fn delayed_packages_are_held_back() {
        let mut sim = NetworkSimulator::new();
        sim.set_config(
            addr(),
            PacketLossSimulation {
                enabled: true,
                min_latency_ms: 50,
                max_latency_ms: 50,
                ..Default::default()
            },
        );

        sim.enqueue_outbound(vec![1], addr());
        assert!(sim.take_outbound().is_empty());

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(sim.take_outbound().len(), 1);
    }

    #[test]
    fn disabling_a_config_removes_it() {
        let mut sim = NetworkSimulator::new();
        sim.set_config(
            addr(),
            PacketLossSimulation {
                enabled: true,
                loss_percent: 100.0,
                ..Default::default()
            },
        );
        assert!(sim.should_drop(&addr()));

        sim.set_config(addr(), PacketLossSimulation::default());
        assert!(sim.get_config(&addr()).is_none());
        assert!(!sim.should_drop(&addr()));
    }
}
