use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::protocol::{FRAGMENT_HEADER_SIZE, MAX_PACKAGE_SIZE, TRAILER_SIZE};
use crate::stats::NetworkStats;

const DEFAULT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("package of {size} bytes exceeds the {max} byte limit")]
    PackageTooLarge { size: usize, max: usize },
    #[error("no remote address set")]
    NotConnected,
}

/// Non-blocking UDP endpoint carrying raw package buffers. It never looks
/// inside a package; validation and reassembly belong to the connection.
#[derive(Debug)]
pub struct NetworkEndpoint {
    socket: UdpSocket,
    local_addr: SocketAddr,
    remote_addr: Option<SocketAddr>,
    stats: NetworkStats,
    recv_buffer: [u8; MAX_PACKAGE_SIZE],
    timeout: Duration,
    last_receive_time: Instant,
}

impl NetworkEndpoint {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;

        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            remote_addr: None,
            stats: NetworkStats::default(),
            recv_buffer: [0u8; MAX_PACKAGE_SIZE],
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            last_receive_time: Instant::now(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn set_remote(&mut self, addr: SocketAddr) {
        self.remote_addr = Some(addr);
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut NetworkStats {
        &mut self.stats
    }

    /// Send one logical send's packages, one datagram each. Returns the
    /// total byte count put on the wire.
    pub fn send_packages_to(
        &mut self,
        packages: &[Vec<u8>],
        addr: SocketAddr,
    ) -> Result<usize, SendError> {
        let mut total = 0;
        for package in packages {
            if package.len() > MAX_PACKAGE_SIZE {
                return Err(SendError::PackageTooLarge {
                    size: package.len(),
                    max: MAX_PACKAGE_SIZE,
                });
            }
            total += self.socket.send_to(package, addr)?;
            self.stats.packets_sent += 1;
        }
        self.stats.bytes_sent += total as u64;
        Ok(total)
    }

    pub fn send_packages(&mut self, packages: &[Vec<u8>]) -> Result<usize, SendError> {
        let addr = self.remote_addr.ok_or(SendError::NotConnected)?;
        self.send_packages_to(packages, addr)
    }

    /// Drain everything currently queued on the socket. Datagrams too
    /// short to even be a package are dropped here; everything else is
    /// the connection's problem.
    pub fn receive(&mut self) -> io::Result<Vec<(Vec<u8>, SocketAddr)>> {
        let mut datagrams = Vec::new();

        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((size, addr)) => {
                    if size < FRAGMENT_HEADER_SIZE + TRAILER_SIZE {
                        continue;
                    }
                    self.stats.packets_received += 1;
                    self.stats.bytes_received += size as u64;
                    self.last_receive_time = Instant::now();
                    datagrams.push((self.recv_buffer[..size].to_vec(), addr));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        Ok(datagrams)
    }

    pub fn is_timed_out(&self) -> bool {
        self.last_receive_time.elapsed() > self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_roundtrip() {
        let mut a = NetworkEndpoint::bind("127.0.0.1:0").unwrap();
        let mut b = NetworkEndpoint::bind("127.0.0.1:0").unwrap();
        a.set_remote(b.local_addr());

        let packages = vec![vec![0u8; 32], vec![1u8; 64]];
        let sent = a.send_packages(&packages).unwrap();
        assert_eq!(sent, 96);
        assert_eq!(a.stats().packets_sent, 2);

        // non-blocking receive needs a moment on loopback
        std::thread::sleep(Duration::from_millis(20));

        let datagrams = b.receive().unwrap();
        assert_eq!(datagrams.len(), 2);
        assert_eq!(datagrams[0].0.len(), 32);
        assert_eq!(datagrams[1].1, a.local_addr());
        assert_eq!(b.stats().bytes_received, 96);
    }

    #[test]
    fn oversized_package_is_refused() {
        let mut a = NetworkEndpoint::bind("127.0.0.1:0").unwrap();
        a.set_remote(a.local_addr());

        let result = a.send_packages(&[vec![0u8; MAX_PACKAGE_SIZE + 1]]);
        assert!(matches!(result, Err(SendError::PackageTooLarge { .. })));
    }

    #[test]
    fn sending_without_a_remote_fails() {
        let mut a = NetworkEndpoint::bind("127.0.0.1:0").unwrap();
        assert!(matches!(
            a.send_packages(&[vec![0u8; 16]]),
            Err(SendError::NotConnected)
        ));
    }

    #[test]
    fn runt_datagrams_are_dropped() {
        let mut a = NetworkEndpoint::bind("127.0.0.1:0").unwrap();

        let runt = UdpSocket::bind("127.0.0.1:0").unwrap();
        runt.send_to(&[1, 2, 3], a.local_addr()).unwrap();

        std::thread::sleep(Duration::from_millis(20));
        assert!(a.receive().unwrap().is_empty());
    }
}
