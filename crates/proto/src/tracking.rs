use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::protocol::{ACK_BITS, MESSAGE_MAGIC, MessageHeader, forward_distance};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderStatus {
    Valid,
    InvalidMagic,
    /// Sequence too far from anything we know; the connection is broken.
    SeqDiff,
    AlreadyReceived,
    /// Acknowledged sequence outside the window of packages we sent.
    AckDiff,
    /// A newer package claims an older ack than previously known.
    AckOld,
    /// An older package claims a newer ack than previously known.
    AckNew,
}

/// Which remote sequences had been seen at a given moment. Taken before
/// header validation so that "was this group received before" is answered
/// against the pre-package state.
#[derive(Debug, Clone, Copy)]
pub struct ReceivedWindow {
    last: u32,
    bits: u32,
}

impl ReceivedWindow {
    pub fn contains(&self, seq: u32) -> bool {
        if seq == self.last {
            return true;
        }
        match forward_distance(seq, self.last) {
            Some(d) if d >= 1 && d <= ACK_BITS => self.bits & (1 << (d - 1)) != 0,
            _ => false,
        }
    }
}

enum Position {
    Ahead(u32),
    Equal,
    Behind(u32),
}

/// Shift an ack mask forward by `gap` new sequences, setting the bit for
/// the previously-newest entry. Saturates instead of relying on shift
/// semantics once the gap reaches the mask width.
fn shift_window(bits: u32, gap: u32) -> u32 {
    let shifted = if gap >= ACK_BITS { 0 } else { bits << gap };
    let newest = if (1..=ACK_BITS).contains(&gap) {
        1 << (gap - 1)
    } else {
        0
    };
    shifted | newest
}

/// Bidirectional sequence/acknowledgement state for one connection.
///
/// `local_seq`/`remote_ack`/`remote_ack_bits` describe the packages we
/// send and what the peer has confirmed of them; `remote_seq`/
/// `local_ack_bits` describe what we have received and will confirm back.
/// Invalid headers never mutate anything.
#[derive(Debug)]
pub struct SequenceTracker {
    local_seq: u32,
    remote_seq: u32,
    local_ack_bits: u32,
    remote_ack: u32,
    remote_ack_bits: u32,
    outstanding_ping: Option<(u32, Instant)>,
    rtt_ring: VecDeque<Duration>,
    max_rtt_samples: usize,
}

impl SequenceTracker {
    pub fn new(max_rtt_samples: usize) -> Self {
        Self {
            local_seq: 0,
            remote_seq: 0,
            local_ack_bits: 0,
            remote_ack: 0,
            remote_ack_bits: 0,
            outstanding_ping: None,
            rtt_ring: VecDeque::with_capacity(max_rtt_samples),
            max_rtt_samples,
        }
    }

    /// Sequence of the most recently built package (0 before the first).
    pub fn local_sequence(&self) -> u32 {
        self.local_seq
    }

    /// Highest remote sequence seen so far.
    pub fn remote_sequence(&self) -> u32 {
        self.remote_seq
    }

    /// Advance the local sequence and stamp a header for the next package.
    /// Starts a fresh round-trip probe when the previous one has settled.
    pub fn next_header(&mut self) -> MessageHeader {
        self.local_seq = self.local_seq.wrapping_add(1);

        if self.ping_settled() {
            self.outstanding_ping = Some((self.local_seq, Instant::now()));
        }

        MessageHeader::new(self.local_seq, self.remote_seq, self.local_ack_bits)
    }

    /// Validate an incoming header and, only if it is fully valid, fold it
    /// into the tracker state.
    pub fn process_header(&mut self, header: &MessageHeader) -> HeaderStatus {
        if header.magic != MESSAGE_MAGIC {
            return HeaderStatus::InvalidMagic;
        }

        let seq_pos = match forward_distance(self.remote_seq, header.seq) {
            Some(0) => return HeaderStatus::AlreadyReceived,
            Some(gap) => Position::Ahead(gap),
            None => match forward_distance(header.seq, self.remote_seq) {
                Some(d) if d <= ACK_BITS => {
                    if self.local_ack_bits & (1 << (d - 1)) != 0 {
                        return HeaderStatus::AlreadyReceived;
                    }
                    Position::Behind(d)
                }
                // Older than the ack mask can record: we could not confirm
                // it, and re-dispatching it risks duplicates. Drop it.
                Some(_) => return HeaderStatus::AlreadyReceived,
                None => return HeaderStatus::SeqDiff,
            },
        };

        // The ack must refer to a package we actually sent.
        if forward_distance(header.ack, self.local_seq).is_none() {
            return HeaderStatus::AckDiff;
        }

        let ack_pos = match forward_distance(self.remote_ack, header.ack) {
            Some(0) => Position::Equal,
            Some(gap) => Position::Ahead(gap),
            None => match forward_distance(header.ack, self.remote_ack) {
                Some(d) => Position::Behind(d),
                None => return HeaderStatus::AckDiff,
            },
        };

        // Package order and ack order must agree.
        match (&seq_pos, &ack_pos) {
            (Position::Ahead(_), Position::Behind(_)) => return HeaderStatus::AckOld,
            (Position::Behind(_), Position::Ahead(_)) => return HeaderStatus::AckNew,
            _ => {}
        }

        // All checks passed; commit.
        match seq_pos {
            Position::Ahead(gap) => {
                self.local_ack_bits = shift_window(self.local_ack_bits, gap);
                self.remote_seq = header.seq;
            }
            Position::Behind(d) => self.local_ack_bits |= 1 << (d - 1),
            Position::Equal => unreachable!(),
        }
        match ack_pos {
            Position::Ahead(gap) => {
                self.remote_ack_bits = shift_window(self.remote_ack_bits, gap) | header.ack_bits;
                self.remote_ack = header.ack;
            }
            Position::Equal => self.remote_ack_bits |= header.ack_bits,
            // An old package's ack report still carries knowledge about
            // even older sequences; merge it.
            Position::Behind(d) => self.remote_ack_bits |= shift_window(header.ack_bits, d),
        }

        if let Some((seq, sent_at)) = self.outstanding_ping
            && self.acknowledged(seq)
        {
            if self.rtt_ring.len() == self.max_rtt_samples {
                self.rtt_ring.pop_front();
            }
            self.rtt_ring.push_back(sent_at.elapsed());
            self.outstanding_ping = None;
        }

        HeaderStatus::Valid
    }

    /// Has the peer confirmed receiving our package `seq`? Returns false,
    /// not an error, once `seq` has fallen out of the tracked ack window:
    /// at that point the answer is no longer knowable.
    pub fn acknowledged(&self, seq: u32) -> bool {
        if seq == self.remote_ack {
            return true;
        }
        match forward_distance(seq, self.remote_ack) {
            Some(d) if d >= 1 && d <= ACK_BITS => self.remote_ack_bits & (1 << (d - 1)) != 0,
            _ => false,
        }
    }

    /// Record that the logical send `seq` has been dispatched even though
    /// its own package may never have arrived: its content rode along in a
    /// newer package. Future copies are skipped and the peer sees the
    /// sequence acknowledged, which is what stops the retransmission.
    pub fn mark_group_received(&mut self, seq: u32) {
        if let Some(d) = forward_distance(seq, self.remote_seq)
            && (1..=ACK_BITS).contains(&d)
        {
            self.local_ack_bits |= 1 << (d - 1);
        }
    }

    pub fn received_window(&self) -> ReceivedWindow {
        ReceivedWindow {
            last: self.remote_seq,
            bits: self.local_ack_bits,
        }
    }

    pub fn rtt_samples(&self) -> impl Iterator<Item = Duration> + '_ {
        self.rtt_ring.iter().copied()
    }

    pub fn average_rtt(&self) -> Option<Duration> {
        if self.rtt_ring.is_empty() {
            return None;
        }
        let total: Duration = self.rtt_ring.iter().sum();
        Some(total / self.rtt_ring.len() as u32)
    }

    fn ping_settled(&self) -> bool {
        match self.outstanding_ping {
            None => true,
            Some((seq, _)) => {
                if self.acknowledged(seq) {
                    return true;
                }
                // Still waiting while the peer's ack has not moved past the
                // probe; once it has (or the probe is no longer comparable),
                // the sample is lost and we give up on it.
                forward_distance(self.remote_ack, seq).is_none()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SEQUENCE_WINDOW;

    fn header(seq: u32, ack: u32, ack_bits: u32) -> MessageHeader {
        MessageHeader::new(seq, ack, ack_bits)
    }

    /// Build a tracker that has already sent `n` packages.
    fn tracker_after_sending(n: u32) -> SequenceTracker {
        let mut tracker = SequenceTracker::new(5);
        for _ in 0..n {
            tracker.next_header();
        }
        tracker
    }

    #[test]
    fn next_header_counts_up_and_carries_ack_state() {
        let mut tracker = SequenceTracker::new(5);
        let first = tracker.next_header();
        assert_eq!(first.seq, 1);
        assert_eq!(first.ack, 0);
        assert_eq!(first.ack_bits, 0);

        assert_eq!(tracker.process_header(&header(7, 1, 0)), HeaderStatus::Valid);
        let second = tracker.next_header();
        assert_eq!(second.seq, 2);
        assert_eq!(second.ack, 7);
    }

    #[test]
    fn duplicate_header_is_rejected_second_time() {
        let mut tracker = tracker_after_sending(1);
        let h = header(3, 1, 0);
        assert_eq!(tracker.process_header(&h), HeaderStatus::Valid);
        assert_eq!(tracker.process_header(&h), HeaderStatus::AlreadyReceived);
    }

    #[test]
    fn out_of_order_remote_sequence_sets_ack_bit() {
        let mut tracker = tracker_after_sending(1);
        assert_eq!(tracker.process_header(&header(3, 1, 0)), HeaderStatus::Valid);
        assert_eq!(tracker.process_header(&header(1, 1, 0)), HeaderStatus::Valid);

        let window = tracker.received_window();
        assert!(window.contains(3));
        assert!(window.contains(1));
        assert!(!window.contains(2));

        // and the late package is now a duplicate
        assert_eq!(
            tracker.process_header(&header(1, 1, 0)),
            HeaderStatus::AlreadyReceived
        );
    }

    #[test]
    fn sequence_outside_window_is_a_seq_diff() {
        let mut tracker = tracker_after_sending(1);
        assert_eq!(tracker.process_header(&header(5, 1, 0)), HeaderStatus::Valid);
        assert_eq!(
            tracker.process_header(&header(5u32.wrapping_add(SEQUENCE_WINDOW), 1, 0)),
            HeaderStatus::SeqDiff
        );
        // rejection mutated nothing
        assert_eq!(tracker.remote_sequence(), 5);
    }

    #[test]
    fn sequence_window_accepts_up_to_the_edge() {
        let mut tracker = tracker_after_sending(1);
        assert_eq!(tracker.process_header(&header(1, 1, 0)), HeaderStatus::Valid);
        assert_eq!(
            tracker.process_header(&header(1 + SEQUENCE_WINDOW - 1, 1, 0)),
            HeaderStatus::Valid
        );
        assert_eq!(tracker.remote_sequence(), SEQUENCE_WINDOW);
    }

    #[test]
    fn ack_of_unsent_package_is_rejected() {
        let mut tracker = tracker_after_sending(2);
        assert_eq!(
            tracker.process_header(&header(1, 100, 0)),
            HeaderStatus::AckDiff
        );
        assert_eq!(tracker.remote_sequence(), 0);
    }

    #[test]
    fn ack_roundtrip_through_the_bitfield() {
        let mut tracker = tracker_after_sending(3);

        assert!(!tracker.acknowledged(2));
        // peer has seen our 1..=3 and reports 3 as latest with 1 and 2 in the mask
        assert_eq!(
            tracker.process_header(&header(1, 3, 0b11)),
            HeaderStatus::Valid
        );
        assert!(tracker.acknowledged(1));
        assert!(tracker.acknowledged(2));
        assert!(tracker.acknowledged(3));
        assert!(!tracker.acknowledged(4));
    }

    #[test]
    fn acknowledged_is_false_beyond_the_tracked_window() {
        let mut tracker = tracker_after_sending(100);
        assert_eq!(
            tracker.process_header(&header(1, 100, u32::MAX)),
            HeaderStatus::Valid
        );
        assert!(tracker.acknowledged(100));
        assert!(tracker.acknowledged(68));
        // older than the 32-bit mask reaches: unknowable, not an error
        assert!(!tracker.acknowledged(67));
    }

    #[test]
    fn newer_package_with_older_ack_is_inconsistent() {
        let mut tracker = tracker_after_sending(5);
        assert_eq!(tracker.process_header(&header(10, 5, 0)), HeaderStatus::Valid);
        assert_eq!(
            tracker.process_header(&header(11, 4, 0)),
            HeaderStatus::AckOld
        );
        assert_eq!(tracker.remote_sequence(), 10);
    }

    #[test]
    fn older_package_with_newer_ack_is_inconsistent() {
        let mut tracker = tracker_after_sending(5);
        assert_eq!(tracker.process_header(&header(10, 4, 0)), HeaderStatus::Valid);
        assert_eq!(
            tracker.process_header(&header(8, 5, 0)),
            HeaderStatus::AckNew
        );
        assert!(!tracker.acknowledged(5));
    }

    #[test]
    fn bad_magic_is_rejected_untouched() {
        let mut tracker = tracker_after_sending(1);
        let mut h = header(3, 1, 0);
        h.magic = 0x0BAD_F00D;
        assert_eq!(tracker.process_header(&h), HeaderStatus::InvalidMagic);
        assert_eq!(tracker.remote_sequence(), 0);
    }

    #[test]
    fn far_gap_clears_the_received_mask() {
        let mut tracker = tracker_after_sending(1);
        assert_eq!(tracker.process_header(&header(1, 1, 0)), HeaderStatus::Valid);
        assert_eq!(tracker.process_header(&header(2, 1, 0)), HeaderStatus::Valid);
        // jump well past the mask width
        assert_eq!(tracker.process_header(&header(200, 1, 0)), HeaderStatus::Valid);

        let window = tracker.received_window();
        assert!(window.contains(200));
        assert!(!window.contains(2));
        assert!(!window.contains(1));
    }

    #[test]
    fn rtt_sample_is_captured_when_the_probe_is_acked() {
        let mut tracker = SequenceTracker::new(5);
        let probe = tracker.next_header();

        std::thread::sleep(std::time::Duration::from_millis(10));

        assert_eq!(
            tracker.process_header(&header(1, probe.seq, 0)),
            HeaderStatus::Valid
        );
        let rtt = tracker.average_rtt().unwrap();
        assert!(rtt >= Duration::from_millis(10));
        assert_eq!(tracker.rtt_samples().count(), 1);
    }

    #[test]
    fn rtt_ring_keeps_only_the_latest_samples() {
        let mut tracker = SequenceTracker::new(2);
        for i in 0..4u32 {
            let probe = tracker.next_header();
            assert_eq!(
                tracker.process_header(&header(i + 1, probe.seq, u32::MAX)),
                HeaderStatus::Valid
            );
        }
        assert_eq!(tracker.rtt_samples().count(), 2);
    }
}
