use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::time::{Duration, Instant};

use crate::config::ProtocolConfig;
use crate::protocol::{
    FRAGMENT_HEADER_SIZE, FRAGMENT_MAGIC, FragmentHeader, GROUP_HEADER_SIZE, MAX_FRAGMENTS,
    MESSAGE_HEADER_SIZE, MESSAGE_MAGIC, MessageHeader, TRAILER_SIZE, Trailer, leading_magic,
};
use crate::queue::BufferPool;
use crate::tracking::{HeaderStatus, ReceivedWindow, SequenceTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageStatus {
    /// Not a well-formed package; dropped without trace.
    Invalid,
    /// Wire framing was fine but the content did not parse; dropped.
    InvalidMessage,
    /// A fragment was absorbed; the logical package is not complete yet.
    Fragment,
    /// A complete package was dispatched to the message handler.
    Message,
}

/// Bounds-checked cursor over one message group's bytes. Reads never run
/// past the group; a short read reports `None` instead.
pub struct GroupReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> GroupReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        let bytes = self.read_bytes(4)?;
        Some(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if len > self.remaining() {
            return None;
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Some(bytes)
    }
}

/// Application seam: consumes exactly one message per call and reports
/// whether it was valid. Returning `false`, or not advancing the reader,
/// marks the whole package as [`PackageStatus::InvalidMessage`].
pub trait MessageHandler {
    fn on_message(&mut self, group_seq: u32, reader: &mut GroupReader<'_>) -> bool;
}

impl<F> MessageHandler for F
where
    F: FnMut(u32, &mut GroupReader<'_>) -> bool,
{
    fn on_message(&mut self, group_seq: u32, reader: &mut GroupReader<'_>) -> bool {
        self(group_seq, reader)
    }
}

#[derive(Debug)]
struct FragmentedPackage {
    first_seen: Instant,
    header: Option<MessageHeader>,
    received_mask: u64,
    last_index: Option<u32>,
    buf: Vec<u8>,
}

/// Buffers inbound fragments per originating sequence until a logical
/// package is complete, then validates its header and feeds the assembled
/// bytes through the group parser.
#[derive(Debug)]
pub struct FragmentReassembler {
    partial: BTreeMap<u32, FragmentedPackage>,
    first_capacity: usize,
    later_capacity: usize,
    pool: BufferPool,
}

impl FragmentReassembler {
    const MAX_POOLED_BUFFERS: usize = 8;

    pub fn new(config: &ProtocolConfig) -> Self {
        Self {
            partial: BTreeMap::new(),
            first_capacity: config.first_fragment_capacity(),
            later_capacity: config.later_fragment_capacity(),
            pool: BufferPool::new(Self::MAX_POOLED_BUFFERS),
        }
    }

    /// Number of incomplete reassemblies currently buffered.
    pub fn pending(&self) -> usize {
        self.partial.len()
    }

    pub fn process_package(
        &mut self,
        tracker: &mut SequenceTracker,
        data: &[u8],
        handler: &mut dyn MessageHandler,
    ) -> PackageStatus {
        if data.len() < FRAGMENT_HEADER_SIZE + TRAILER_SIZE {
            return PackageStatus::Invalid;
        }
        let Some(trailer) = Trailer::of_package(data) else {
            return PackageStatus::Invalid;
        };

        match leading_magic(data) {
            Some(MESSAGE_MAGIC) => {
                let mut cursor = data;
                let Some(header) = MessageHeader::parse(&mut cursor) else {
                    return PackageStatus::Invalid;
                };
                if data.len() < MESSAGE_HEADER_SIZE + TRAILER_SIZE {
                    return PackageStatus::Invalid;
                }
                let payload = &data[MESSAGE_HEADER_SIZE..data.len() - TRAILER_SIZE];

                match trailer {
                    Trailer::End => {
                        // complete, unfragmented package
                        let window = tracker.received_window();
                        match tracker.process_header(&header) {
                            HeaderStatus::Valid => parse_groups(payload, window, tracker, handler),
                            status => {
                                log::debug!("dropping package {}: {:?}", header.seq, status);
                                PackageStatus::Invalid
                            }
                        }
                    }
                    Trailer::More => {
                        self.absorb(tracker, header.seq, 0, Some(header), payload, false, handler)
                    }
                }
            }
            Some(FRAGMENT_MAGIC) => {
                let mut cursor = data;
                let Some(header) = FragmentHeader::parse(&mut cursor) else {
                    return PackageStatus::Invalid;
                };
                // index 0 is only ever carried by the leading package
                if header.fragment_index == 0 || header.fragment_index >= MAX_FRAGMENTS {
                    return PackageStatus::Invalid;
                }
                let payload = &data[FRAGMENT_HEADER_SIZE..data.len() - TRAILER_SIZE];
                let is_last = trailer == Trailer::End;
                self.absorb(
                    tracker,
                    header.seq,
                    header.fragment_index,
                    None,
                    payload,
                    is_last,
                    handler,
                )
            }
            _ => PackageStatus::Invalid,
        }
    }

    /// Remove reassemblies that have waited longer than `max_age` for
    /// their missing fragments; returns how many were discarded.
    pub fn discard_fragments(&mut self, max_age: Duration) -> usize {
        let stale: Vec<u32> = self
            .partial
            .iter()
            .filter(|(_, p)| p.first_seen.elapsed() > max_age)
            .map(|(&seq, _)| seq)
            .collect();

        for seq in &stale {
            if let Some(p) = self.partial.remove(seq) {
                log::debug!("discarding stale reassembly for sequence {seq}");
                self.pool.release(p.buf);
            }
        }
        stale.len()
    }

    #[allow(clippy::too_many_arguments)]
    fn absorb(
        &mut self,
        tracker: &mut SequenceTracker,
        seq: u32,
        index: u32,
        header: Option<MessageHeader>,
        payload: &[u8],
        is_last: bool,
        handler: &mut dyn MessageHandler,
    ) -> PackageStatus {
        let capacity = if index == 0 {
            self.first_capacity
        } else {
            self.later_capacity
        };
        if payload.len() > capacity {
            return PackageStatus::Invalid;
        }
        // offsets are derived from fixed slot capacities, so every
        // non-final fragment must fill its slot exactly
        if !is_last && payload.len() != capacity {
            return PackageStatus::Invalid;
        }
        let offset = if index == 0 {
            0
        } else {
            self.first_capacity + (index as usize - 1) * self.later_capacity
        };

        let entry = match self.partial.entry(seq) {
            Entry::Occupied(o) => o.into_mut(),
            Entry::Vacant(v) => v.insert(FragmentedPackage {
                first_seen: Instant::now(),
                header: None,
                received_mask: 0,
                last_index: None,
                buf: self.pool.acquire(),
            }),
        };

        let bit = 1u64 << index;
        if entry.received_mask & bit != 0 {
            return PackageStatus::Fragment;
        }

        if entry.buf.len() < offset + payload.len() {
            entry.buf.resize(offset + payload.len(), 0);
        }
        entry.buf[offset..offset + payload.len()].copy_from_slice(payload);
        entry.received_mask |= bit;
        if header.is_some() {
            entry.header = header;
        }
        if is_last && entry.last_index.is_none() {
            entry.last_index = Some(index);
        }

        let complete = entry.last_index.is_some_and(|last| {
            let needed = if last >= 63 {
                u64::MAX
            } else {
                (1u64 << (last + 1)) - 1
            };
            entry.received_mask & needed == needed
        });
        if !complete {
            return PackageStatus::Fragment;
        }

        let package = self.partial.remove(&seq).unwrap();
        let Some(header) = package.header else {
            // completion implies the leading fragment arrived, so this
            // cannot happen; treat it as corruption rather than panicking
            self.pool.release(package.buf);
            return PackageStatus::Invalid;
        };

        let window = tracker.received_window();
        let result = match tracker.process_header(&header) {
            HeaderStatus::Valid => parse_groups(&package.buf, window, tracker, handler),
            status => {
                log::debug!("dropping reassembled package {}: {:?}", header.seq, status);
                PackageStatus::Invalid
            }
        };
        self.pool.release(package.buf);
        result
    }
}

/// Walk the message groups of an assembled package. Groups whose sequence
/// the `window` already covers were dispatched by an earlier package and
/// are skipped over by their declared length; newly dispatched groups are
/// recorded in the tracker so later copies are skipped and acknowledged.
fn parse_groups(
    data: &[u8],
    window: ReceivedWindow,
    tracker: &mut SequenceTracker,
    handler: &mut dyn MessageHandler,
) -> PackageStatus {
    let mut pos = 0;
    while pos < data.len() {
        if data.len() - pos < GROUP_HEADER_SIZE {
            return PackageStatus::InvalidMessage;
        }
        let group_seq = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap());
        let group_len =
            u32::from_le_bytes(data[pos + 4..pos + 8].try_into().unwrap()) as usize;
        pos += GROUP_HEADER_SIZE;

        if group_len > data.len() - pos {
            return PackageStatus::InvalidMessage;
        }
        if window.contains(group_seq) {
            pos += group_len;
            continue;
        }

        let mut reader = GroupReader::new(&data[pos..pos + group_len]);
        while !reader.is_empty() {
            let before = reader.position();
            if !handler.on_message(group_seq, &mut reader) {
                return PackageStatus::InvalidMessage;
            }
            if reader.position() == before {
                return PackageStatus::InvalidMessage;
            }
        }
        tracker.mark_group_received(group_seq);
        pos += group_len;
    }
    PackageStatus::Message
}
