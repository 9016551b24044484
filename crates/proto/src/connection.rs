use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::builder::PackageBuilder;
use crate::config::ProtocolConfig;
use crate::queue::MessageQueue;
use crate::reassembly::{FragmentReassembler, MessageHandler, PackageStatus};
use crate::tracking::SequenceTracker;

/// Reliable-messaging state for one peer: the sequence tracker, the
/// pending-message queues, the package builder and the fragment
/// reassembler, behind the API the owning application drives.
///
/// Everything here is synchronous and single-threaded; each peer gets its
/// own instance and instances share nothing.
#[derive(Debug)]
pub struct Connection {
    tracker: SequenceTracker,
    queue: MessageQueue,
    builder: PackageBuilder,
    reassembler: FragmentReassembler,
    fragment_max_age: Duration,
}

impl Connection {
    pub fn new(config: &ProtocolConfig) -> Self {
        let builder = PackageBuilder::new(config);
        Self {
            tracker: SequenceTracker::new(config.ping_samples),
            queue: MessageQueue::new(builder.max_message_size()),
            builder,
            reassembler: FragmentReassembler::new(config),
            fragment_max_age: config.fragment_max_age,
        }
    }

    /// Queue a fire-and-forget message; it will be serialized into the
    /// next package and then forgotten. The returned sequence can still be
    /// watched via [`Connection::acknowledged`].
    pub fn queue_message(&mut self, payload: &[u8]) -> u32 {
        let seq = self.next_package_sequence();
        self.queue.push_transient(seq, payload);
        seq
    }

    /// Queue a message that is re-sent with every outgoing package until
    /// the peer acknowledges the returned sequence.
    pub fn queue_critical_message(&mut self, payload: &[u8]) -> u32 {
        let seq = self.next_package_sequence();
        self.queue.push_critical(seq, payload);
        seq
    }

    /// Build the packages for this send tick. Always returns at least one
    /// package: even with nothing queued, the peer needs our ack state.
    pub fn packages(&mut self) -> Vec<Vec<u8>> {
        self.builder.build(&mut self.tracker, &mut self.queue)
    }

    /// Feed one received datagram through header validation, reassembly
    /// and the message-group parser.
    pub fn process_package(
        &mut self,
        data: &[u8],
        handler: &mut dyn MessageHandler,
    ) -> PackageStatus {
        self.reassembler
            .process_package(&mut self.tracker, data, handler)
    }

    /// Has the peer confirmed the package carrying this sequence?
    pub fn acknowledged(&self, seq: u32) -> bool {
        self.tracker.acknowledged(seq)
    }

    /// Drop reassemblies that have outlived the configured maximum age.
    /// Driven by the owner, typically once per tick.
    pub fn discard_stale_fragments(&mut self) -> usize {
        self.reassembler.discard_fragments(self.fragment_max_age)
    }

    pub fn average_rtt(&self) -> Option<Duration> {
        self.tracker.average_rtt()
    }

    pub fn local_sequence(&self) -> u32 {
        self.tracker.local_sequence()
    }

    pub fn remote_sequence(&self) -> u32 {
        self.tracker.remote_sequence()
    }

    pub fn pending_reassemblies(&self) -> usize {
        self.reassembler.pending()
    }

    /// Sequence the next built package will carry; messages queued now
    /// belong to it.
    fn next_package_sequence(&self) -> u32 {
        self.tracker.local_sequence().wrapping_add(1)
    }
}

/// Connections keyed by peer address, with idle-timeout cleanup. Every
/// peer gets a fully independent [`Connection`].
#[derive(Debug)]
pub struct ConnectionManager {
    config: ProtocolConfig,
    connections: HashMap<SocketAddr, Connection>,
    last_receive: HashMap<SocketAddr, Instant>,
}

impl ConnectionManager {
    pub fn new(config: ProtocolConfig) -> Self {
        Self {
            config,
            connections: HashMap::new(),
            last_receive: HashMap::new(),
        }
    }

    pub fn get_or_create(&mut self, addr: SocketAddr) -> &mut Connection {
        self.last_receive.insert(addr, Instant::now());
        self.connections
            .entry(addr)
            .or_insert_with(|| Connection::new(&self.config))
    }

    pub fn get_mut(&mut self, addr: &SocketAddr) -> Option<&mut Connection> {
        self.connections.get_mut(addr)
    }

    pub fn remove(&mut self, addr: &SocketAddr) -> Option<Connection> {
        self.last_receive.remove(addr);
        self.connections.remove(addr)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&SocketAddr, &mut Connection)> {
        self.connections.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Drop peers that have been silent longer than the configured
    /// connection timeout; returns the dropped addresses.
    pub fn cleanup_timed_out(&mut self) -> Vec<SocketAddr> {
        let timeout = self.config.connection_timeout;
        let timed_out: Vec<SocketAddr> = self
            .last_receive
            .iter()
            .filter(|(_, at)| at.elapsed() > timeout)
            .map(|(&addr, _)| addr)
            .collect();

        for addr in &timed_out {
            log::debug!("dropping silent peer {addr}");
            self.remove(addr);
        }
        timed_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reassembly::GroupReader;

    /// Treats whatever is left in the group as one message.
    #[derive(Default)]
    struct Collect {
        messages: Vec<(u32, Vec<u8>)>,
    }

    impl MessageHandler for Collect {
        fn on_message(&mut self, group_seq: u32, reader: &mut GroupReader<'_>) -> bool {
            let bytes = reader.read_bytes(reader.remaining()).unwrap();
            self.messages.push((group_seq, bytes.to_vec()));
            true
        }
    }

    fn pair() -> (Connection, Connection) {
        let config = ProtocolConfig::default();
        (Connection::new(&config), Connection::new(&config))
    }

    /// One full exchange: a's packages to b, then b's reply packages to a.
    fn exchange(a: &mut Connection, b: &mut Connection, collect: &mut Collect) {
        for package in a.packages() {
            b.process_package(&package, collect);
        }
        for package in b.packages() {
            a.process_package(&package, collect);
        }
    }

    #[test]
    fn critical_message_is_resent_until_acknowledged() {
        let (mut a, mut b) = pair();
        let mut collect = Collect::default();

        let seq = a.queue_critical_message(b"must arrive");
        assert_eq!(seq, 1);

        // a's first package is lost entirely; the message survives in the queue
        let _lost = a.packages();
        assert!(!a.acknowledged(seq));

        exchange(&mut a, &mut b, &mut collect);
        assert_eq!(collect.messages, vec![(1, b"must arrive".to_vec())]);
        assert!(a.acknowledged(seq));

        // once acknowledged the message is not sent again
        collect.messages.clear();
        exchange(&mut a, &mut b, &mut collect);
        assert!(collect.messages.is_empty());
    }

    #[test]
    fn non_critical_message_is_sent_at_most_once() {
        let (mut a, mut b) = pair();
        let mut collect = Collect::default();

        let seq = a.queue_message(b"maybe");
        let _lost = a.packages();

        // nothing left to re-send, but delivery is still observable as "not acked"
        exchange(&mut a, &mut b, &mut collect);
        assert!(collect.messages.is_empty());
        assert!(!a.acknowledged(seq));
    }

    #[test]
    fn delivery_of_a_non_critical_message_is_observable() {
        let (mut a, mut b) = pair();
        let mut collect = Collect::default();

        let seq = a.queue_message(b"made it");
        exchange(&mut a, &mut b, &mut collect);

        assert_eq!(collect.messages, vec![(seq, b"made it".to_vec())]);
        assert!(a.acknowledged(seq));
    }

    #[test]
    fn large_critical_message_survives_fragment_loss_of_the_whole_send() {
        let mut a = Connection::new(&ProtocolConfig::default());
        let mut b = Connection::new(&ProtocolConfig {
            fragment_max_age: Duration::from_millis(1),
            ..ProtocolConfig::default()
        });
        let mut collect = Collect::default();

        let payload = vec![0x77; 5000];
        let seq = a.queue_critical_message(&payload);

        // first attempt: only the middle fragment arrives
        let packages = a.packages();
        assert!(packages.len() > 2);
        assert_eq!(
            b.process_package(&packages[1], &mut collect),
            PackageStatus::Fragment
        );
        assert!(collect.messages.is_empty());

        // second attempt arrives in full and completes independently
        exchange(&mut a, &mut b, &mut collect);
        assert_eq!(collect.messages.len(), 1);
        assert_eq!(collect.messages[0].1, payload);
        assert!(a.acknowledged(seq));

        // the abandoned first attempt ages out
        assert_eq!(b.pending_reassemblies(), 1);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(b.discard_stale_fragments(), 1);
        assert_eq!(b.pending_reassemblies(), 0);
    }

    #[test]
    fn messages_queued_between_ticks_land_in_distinct_groups() {
        let (mut a, mut b) = pair();
        let mut collect = Collect::default();

        a.queue_critical_message(b"tick one");
        let _lost = a.packages();
        a.queue_critical_message(b"tick two");

        for package in a.packages() {
            b.process_package(&package, &mut collect);
        }
        assert_eq!(
            collect.messages,
            vec![(1, b"tick one".to_vec()), (2, b"tick two".to_vec())]
        );
    }

    #[test]
    fn manager_hands_out_independent_connections() {
        let mut manager = ConnectionManager::new(ProtocolConfig::default());
        let addr_a: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let addr_b: SocketAddr = "127.0.0.1:4001".parse().unwrap();

        manager.get_or_create(addr_a).queue_message(b"x");
        assert_eq!(manager.get_or_create(addr_a).local_sequence(), 0);
        assert_eq!(manager.len(), 1);

        manager.get_or_create(addr_b);
        assert_eq!(manager.len(), 2);

        manager.remove(&addr_a);
        assert!(manager.get_mut(&addr_a).is_none());
        assert!(manager.get_mut(&addr_b).is_some());
    }

    #[test]
    fn manager_drops_silent_peers() {
        let mut config = ProtocolConfig::default();
        config.connection_timeout = Duration::from_millis(1);
        let mut manager = ConnectionManager::new(config);

        let addr: SocketAddr = "127.0.0.1:4002".parse().unwrap();
        manager.get_or_create(addr);

        std::thread::sleep(Duration::from_millis(5));
        let dropped = manager.cleanup_timed_out();
        assert_eq!(dropped, vec![addr]);
        assert!(manager.is_empty());
    }
}
