//! Packet framing: strategies that split a raw byte stream into whole
//! application-level packets, and the engine that drives them against a
//! socket without allocating on the hot path.

pub mod engine;

use crate::io::codec::{CONTINUE_BIT, SEGMENT_BITS};

pub use engine::{packet_framing_handler, FramingConfig};

/// Strategy of extracting meaningful packets out of a read buffer.
///
/// A protocol is stateless: all buffering is owned by the framing engine.
pub trait FramingProtocol: Send + Sync {
    /// Split `source` into the next whole packet and the leftover bytes.
    /// Returns `None` when no complete packet is available yet.
    fn extract_packet<'a>(&self, source: &'a [u8]) -> Option<(&'a [u8], &'a [u8])>;
}

/// Framing strategy that expects each packet to end with a separator byte
/// sequence. A good fit for tasks like Telnet-style sessions where packets
/// are separated by a newline. The separator is discarded.
pub struct SeparatorFraming {
    separator: Vec<u8>,
}

impl SeparatorFraming {
    /// # Panics
    ///
    /// Panics when `separator` is empty.
    pub fn new(separator: impl Into<Vec<u8>>) -> Self {
        let separator = separator.into();
        assert!(!separator.is_empty(), "separator must not be empty");
        Self { separator }
    }
}

impl FramingProtocol for SeparatorFraming {
    fn extract_packet<'a>(&self, source: &'a [u8]) -> Option<(&'a [u8], &'a [u8])> {
        let position = source
            .windows(self.separator.len())
            .position(|window| window == self.separator)?;

        Some((
            &source[..position],
            &source[position + self.separator.len()..],
        ))
    }
}

/// Binary encoding of a length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixKind {
    VarInt,
    VarLong,
    Int16Be,
    Int16Le,
    Int32Be,
    Int32Le,
    Int64Be,
    Int64Le,
}

/// Framing strategy that expects each packet to be prefixed with its length
/// in bytes, encoded as specified by the [`PrefixKind`].
pub struct LengthPrefixedFraming {
    prefix: PrefixKind,
}

impl LengthPrefixedFraming {
    pub fn new(prefix: PrefixKind) -> Self {
        Self { prefix }
    }
}

impl FramingProtocol for LengthPrefixedFraming {
    fn extract_packet<'a>(&self, source: &'a [u8]) -> Option<(&'a [u8], &'a [u8])> {
        let (prefix_length, packet_size) = match self.prefix {
            PrefixKind::VarInt => var_int_prefix(source)?,
            PrefixKind::VarLong => var_long_prefix(source)?,
            PrefixKind::Int16Be => {
                fixed_prefix::<2>(source, |raw| u64::from(u16::from_be_bytes(raw)))?
            }
            PrefixKind::Int16Le => {
                fixed_prefix::<2>(source, |raw| u64::from(u16::from_le_bytes(raw)))?
            }
            PrefixKind::Int32Be => {
                fixed_prefix::<4>(source, |raw| u64::from(u32::from_be_bytes(raw)))?
            }
            PrefixKind::Int32Le => {
                fixed_prefix::<4>(source, |raw| u64::from(u32::from_le_bytes(raw)))?
            }
            PrefixKind::Int64Be => fixed_prefix::<8>(source, u64::from_be_bytes)?,
            PrefixKind::Int64Le => fixed_prefix::<8>(source, u64::from_le_bytes)?,
        };

        let packet_size = usize::try_from(packet_size).ok()?;
        let body = &source[prefix_length..];
        if body.len() < packet_size {
            return None;
        }

        Some((&body[..packet_size], &body[packet_size..]))
    }
}

fn fixed_prefix<const WIDTH: usize>(
    source: &[u8],
    decode: impl Fn([u8; WIDTH]) -> u64,
) -> Option<(usize, u64)> {
    if source.len() < WIDTH {
        return None;
    }

    let mut raw = [0u8; WIDTH];
    raw.copy_from_slice(&source[..WIDTH]);
    Some((WIDTH, decode(raw)))
}

/// Decodes a VarInt length prefix from the front of the buffer. Returns
/// `None` both when the buffer ends mid-varint and when the encoding is too
/// wide; the engine treats either as "packet not yet complete".
fn var_int_prefix(buffer: &[u8]) -> Option<(usize, u64)> {
    let mut value = 0u32;
    let mut position = 0;
    let mut i = 0;

    loop {
        let current = *buffer.get(i)?;
        value |= u32::from(current & SEGMENT_BITS) << position;

        if current & CONTINUE_BIT == 0 {
            break;
        }

        position += 7;
        if position >= 32 {
            return None;
        }

        i += 1;
    }

    Some((i + 1, u64::from(value)))
}

fn var_long_prefix(buffer: &[u8]) -> Option<(usize, u64)> {
    let mut value = 0u64;
    let mut position = 0;
    let mut i = 0;

    loop {
        let current = *buffer.get(i)?;
        value |= u64::from(current & SEGMENT_BITS) << position;

        if current & CONTINUE_BIT == 0 {
            break;
        }

        position += 7;
        if position >= 64 {
            return None;
        }

        i += 1;
    }

    Some((i + 1, value))
}
