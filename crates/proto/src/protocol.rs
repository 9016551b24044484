use bytes::{Buf, BufMut, BytesMut};

pub const MAX_PACKAGE_SIZE: usize = 1200;

pub const MESSAGE_MAGIC: u32 = 0x54455448;
pub const FRAGMENT_MAGIC: u32 = 0x54465247;
pub const END_MAGIC: u32 = 0x54454E44;
pub const MORE_MAGIC: u32 = 0x544D4F52;

/// Two sequence numbers further apart than this are not comparable at all.
pub const SEQUENCE_WINDOW: u32 = 1024;
pub const ACK_BITS: u32 = 32;

// One mask word per logical package; ~74 KiB of payload at the default
// package size, which is plenty for a message-oriented protocol.
pub const MAX_FRAGMENTS: u32 = 64;

pub const MESSAGE_HEADER_SIZE: usize = 16;
pub const FRAGMENT_HEADER_SIZE: usize = 12;
pub const GROUP_HEADER_SIZE: usize = 8;
pub const TRAILER_SIZE: usize = 4;

/// Distance from `from` forward to `to`, if the two are comparable.
///
/// Sequence numbers wrap at 2^32, so raw `<`/`>` is meaningless; this is
/// the only way two sequence numbers are ever ordered. `Some(0)` means
/// equal, `None` means the gap is at least [`SEQUENCE_WINDOW`].
#[inline]
pub fn forward_distance(from: u32, to: u32) -> Option<u32> {
    let d = to.wrapping_sub(from);
    (d < SEQUENCE_WINDOW).then_some(d)
}

#[inline]
pub fn in_window(a: u32, b: u32) -> bool {
    forward_distance(a, b).is_some() || forward_distance(b, a).is_some()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: u32,
    pub seq: u32,
    pub ack: u32,
    pub ack_bits: u32,
}

impl MessageHeader {
    pub fn new(seq: u32, ack: u32, ack_bits: u32) -> Self {
        Self {
            magic: MESSAGE_MAGIC,
            seq,
            ack,
            ack_bits,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.magic);
        buf.put_u32_le(self.seq);
        buf.put_u32_le(self.ack);
        buf.put_u32_le(self.ack_bits);
    }

    pub fn parse(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < MESSAGE_HEADER_SIZE {
            return None;
        }
        Some(Self {
            magic: buf.get_u32_le(),
            seq: buf.get_u32_le(),
            ack: buf.get_u32_le(),
            ack_bits: buf.get_u32_le(),
        })
    }
}

/// Header of the 2nd..Nth physical package of a fragmented logical send.
/// `seq` is the owning message sequence, not a sequence of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub magic: u32,
    pub seq: u32,
    pub fragment_index: u32,
}

impl FragmentHeader {
    pub fn new(seq: u32, fragment_index: u32) -> Self {
        Self {
            magic: FRAGMENT_MAGIC,
            seq,
            fragment_index,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.magic);
        buf.put_u32_le(self.seq);
        buf.put_u32_le(self.fragment_index);
    }

    pub fn parse(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < FRAGMENT_HEADER_SIZE {
            return None;
        }
        Some(Self {
            magic: buf.get_u32_le(),
            seq: buf.get_u32_le(),
            fragment_index: buf.get_u32_le(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trailer {
    End,
    More,
}

impl Trailer {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32_le(match self {
            Trailer::End => END_MAGIC,
            Trailer::More => MORE_MAGIC,
        });
    }

    /// Trailer of a raw package buffer, if its last four bytes are one.
    pub fn of_package(data: &[u8]) -> Option<Trailer> {
        if data.len() < TRAILER_SIZE {
            return None;
        }
        let raw = u32::from_le_bytes(data[data.len() - TRAILER_SIZE..].try_into().unwrap());
        match raw {
            END_MAGIC => Some(Trailer::End),
            MORE_MAGIC => Some(Trailer::More),
            _ => None,
        }
    }
}

/// Leading magic of a raw package buffer.
pub fn leading_magic(data: &[u8]) -> Option<u32> {
    if data.len() < 4 {
        return None;
    }
    Some(u32::from_le_bytes(data[..4].try_into().unwrap()))
}
