use std::collections::VecDeque;

/// Free list of byte buffers so sustained message traffic does not
/// allocate in steady state.
#[derive(Debug)]
pub struct BufferPool {
    free: Vec<Vec<u8>>,
    max_pooled: usize,
}

impl BufferPool {
    pub fn new(max_pooled: usize) -> Self {
        Self {
            free: Vec::new(),
            max_pooled,
        }
    }

    pub fn acquire(&mut self) -> Vec<u8> {
        self.free.pop().unwrap_or_default()
    }

    pub fn release(&mut self, mut buf: Vec<u8>) {
        if self.free.len() < self.max_pooled {
            buf.clear();
            self.free.push(buf);
        }
    }
}

#[derive(Debug)]
pub struct PendingMessage {
    pub sequence: u32,
    pub payload: Vec<u8>,
}

/// Messages awaiting transmission. Critical messages stay queued (and are
/// re-sent with every package) until the peer acknowledges their sequence;
/// non-critical ones live only until the next build pass serializes them.
#[derive(Debug)]
pub struct MessageQueue {
    /// Ascending by sequence; sequences are assigned monotonically, so
    /// appending preserves the order.
    critical: VecDeque<PendingMessage>,
    transient: Vec<PendingMessage>,
    pool: BufferPool,
    max_message_size: usize,
}

impl MessageQueue {
    const MAX_POOLED_BUFFERS: usize = 64;

    pub fn new(max_message_size: usize) -> Self {
        Self {
            critical: VecDeque::new(),
            transient: Vec::new(),
            pool: BufferPool::new(Self::MAX_POOLED_BUFFERS),
            max_message_size,
        }
    }

    pub fn push_critical(&mut self, sequence: u32, payload: &[u8]) {
        let msg = self.make_message(sequence, payload);
        self.critical.push_back(msg);
    }

    pub fn push_transient(&mut self, sequence: u32, payload: &[u8]) {
        let msg = self.make_message(sequence, payload);
        self.transient.push(msg);
    }

    fn make_message(&mut self, sequence: u32, payload: &[u8]) -> PendingMessage {
        assert!(!payload.is_empty(), "empty messages cannot be queued");
        assert!(
            payload.len() <= self.max_message_size,
            "message of {} bytes exceeds the fragment budget of {} bytes",
            payload.len(),
            self.max_message_size
        );
        let mut buf = self.pool.acquire();
        buf.extend_from_slice(payload);
        PendingMessage {
            sequence,
            payload: buf,
        }
    }

    /// Drop every critical message the peer has confirmed. Called before
    /// each package-build pass; relies on the list being sequence-sorted.
    pub fn prune_acknowledged(&mut self, acknowledged: impl Fn(u32) -> bool) {
        while let Some(front) = self.critical.front() {
            if !acknowledged(front.sequence) {
                break;
            }
            let msg = self.critical.pop_front().unwrap();
            self.pool.release(msg.payload);
        }
    }

    pub fn critical(&self) -> impl Iterator<Item = &PendingMessage> {
        self.critical.iter()
    }

    pub fn transient(&self) -> impl Iterator<Item = &PendingMessage> {
        self.transient.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.critical.is_empty() && self.transient.is_empty()
    }

    /// Non-critical messages are fire-and-forget: once serialized into a
    /// package they are gone, delivered or not.
    pub fn clear_transient(&mut self) {
        for msg in self.transient.drain(..) {
            self.pool.release(msg.payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> MessageQueue {
        MessageQueue::new(64 * 1024)
    }

    #[test]
    fn prune_stops_at_first_unacknowledged() {
        let mut queue = queue();
        queue.push_critical(1, b"a");
        queue.push_critical(2, b"b");
        queue.push_critical(3, b"c");

        queue.prune_acknowledged(|seq| seq != 2);

        let left: Vec<u32> = queue.critical().map(|m| m.sequence).collect();
        assert_eq!(left, vec![2, 3]);
    }

    #[test]
    fn clear_transient_keeps_critical() {
        let mut queue = queue();
        queue.push_critical(1, b"keep");
        queue.push_transient(1, b"drop");
        assert!(!queue.is_empty());

        queue.clear_transient();
        assert_eq!(queue.transient().count(), 0);
        assert_eq!(queue.critical().count(), 1);
    }

    #[test]
    fn released_buffers_are_reused() {
        let mut pool = BufferPool::new(4);
        let mut buf = pool.acquire();
        buf.extend_from_slice(b"payload");
        let capacity = buf.capacity();
        pool.release(buf);

        let buf = pool.acquire();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), capacity);
    }

    #[test]
    fn pool_caps_retained_buffers() {
        let mut pool = BufferPool::new(1);
        pool.release(Vec::with_capacity(16));
        pool.release(Vec::with_capacity(32));
        assert!(pool.acquire().capacity() > 0);
        assert_eq!(pool.acquire().capacity(), 0);
    }

    #[test]
    #[should_panic(expected = "empty messages")]
    fn empty_message_is_a_contract_violation() {
        let mut queue = queue();
        queue.push_critical(1, b"");
    }

    #[test]
    #[should_panic(expected = "fragment budget")]
    fn oversized_message_is_a_contract_violation() {
        let mut queue = MessageQueue::new(8);
        queue.push_transient(1, &[0; 9]);
    }
}
