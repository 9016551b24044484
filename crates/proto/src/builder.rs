use bytes::{BufMut, BytesMut};

use crate::config::ProtocolConfig;
use crate::protocol::{
    FRAGMENT_HEADER_SIZE, FragmentHeader, GROUP_HEADER_SIZE, MAX_FRAGMENTS, MESSAGE_HEADER_SIZE,
    MessageHeader, TRAILER_SIZE, Trailer,
};
use crate::queue::MessageQueue;
use crate::tracking::SequenceTracker;

/// Turns the pending-message state into ready-to-send package buffers.
///
/// One `build` call is one logical send: a single header sequence, one or
/// more physical packages. Messages are laid out as groups (group sequence
/// + byte length + concatenated message bytes), and the resulting stream
/// is chunked across fragment packages wherever it exceeds the package
/// size budget.
#[derive(Debug)]
pub struct PackageBuilder {
    first_capacity: usize,
    later_capacity: usize,
}

impl PackageBuilder {
    pub fn new(config: &ProtocolConfig) -> Self {
        assert!(
            config.max_package_size > MESSAGE_HEADER_SIZE + GROUP_HEADER_SIZE + TRAILER_SIZE,
            "max_package_size leaves no room for payload"
        );
        Self {
            first_capacity: config.first_fragment_capacity(),
            later_capacity: config.later_fragment_capacity(),
        }
    }

    /// Largest single message payload that still fits the fragment budget
    /// of one logical send.
    pub fn max_message_size(&self) -> usize {
        self.first_capacity + (MAX_FRAGMENTS as usize - 1) * self.later_capacity
            - GROUP_HEADER_SIZE
    }

    pub fn build(&self, tracker: &mut SequenceTracker, queue: &mut MessageQueue) -> Vec<Vec<u8>> {
        queue.prune_acknowledged(|seq| tracker.acknowledged(seq));
        let header = tracker.next_header();

        let stream = serialize_groups(queue, tracker.local_sequence());
        let packages = self.chunk(&header, &stream);
        queue.clear_transient();

        assert!(
            packages.len() <= MAX_FRAGMENTS as usize,
            "unacknowledged backlog exceeds the fragment budget of one send"
        );
        packages
    }

    fn chunk(&self, header: &MessageHeader, stream: &[u8]) -> Vec<Vec<u8>> {
        let mut packages = Vec::new();

        let first_len = stream.len().min(self.first_capacity);
        let mut rest = &stream[first_len..];

        let mut buf = BytesMut::with_capacity(MESSAGE_HEADER_SIZE + first_len + TRAILER_SIZE);
        header.ser(&mut buf);
        buf.put_slice(&stream[..first_len]);
        let trailer = if rest.is_empty() {
            Trailer::End
        } else {
            Trailer::More
        };
        trailer.ser(&mut buf);
        packages.push(buf.to_vec());

        let mut index = 1u32;
        while !rest.is_empty() {
            let take = rest.len().min(self.later_capacity);
            let (chunk, tail) = rest.split_at(take);
            rest = tail;

            let mut buf = BytesMut::with_capacity(FRAGMENT_HEADER_SIZE + take + TRAILER_SIZE);
            FragmentHeader::new(header.seq, index).ser(&mut buf);
            buf.put_slice(chunk);
            let trailer = if rest.is_empty() {
                Trailer::End
            } else {
                Trailer::More
            };
            trailer.ser(&mut buf);
            packages.push(buf.to_vec());
            index += 1;
        }

        packages
    }
}

/// Serialize all pending messages as message groups. Critical messages
/// come first, one group per distinct sequence; non-critical messages ride
/// along in the group of the package being built right now.
fn serialize_groups(queue: &MessageQueue, current_seq: u32) -> BytesMut {
    let mut stream = BytesMut::new();

    let criticals: Vec<_> = queue.critical().collect();
    let transient_len: usize = queue.transient().map(|m| m.payload.len()).sum();

    let mut wrote_current = false;
    let mut i = 0;
    while i < criticals.len() {
        let group_seq = criticals[i].sequence;
        let mut j = i;
        let mut group_len = 0usize;
        while j < criticals.len() && criticals[j].sequence == group_seq {
            group_len += criticals[j].payload.len();
            j += 1;
        }

        let is_current = group_seq == current_seq;
        if is_current {
            group_len += transient_len;
        }

        stream.put_u32_le(group_seq);
        stream.put_u32_le(group_len as u32);
        for msg in &criticals[i..j] {
            stream.put_slice(&msg.payload);
        }
        if is_current {
            for msg in queue.transient() {
                stream.put_slice(&msg.payload);
            }
            wrote_current = true;
        }
        i = j;
    }

    if !wrote_current && transient_len > 0 {
        stream.put_u32_le(current_seq);
        stream.put_u32_le(transient_len as u32);
        for msg in queue.transient() {
            stream.put_slice(&msg.payload);
        }
    }

    stream
}
