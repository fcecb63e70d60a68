use crate::error::{Error, Result};
use zerocopy::byteorder::little_endian::U32 as U32LE;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Maximum payload that fits in a single physical packet; a logical payload
/// longer than this is split across consecutive packets, the last of which
/// may be empty if the split lands exactly on the boundary.
pub const MAX_PACKET_SIZE: usize = 0x00FF_FFFF;

/// The 4-byte packet header: 3-byte little-endian payload length plus a
/// 1-byte sequence number that increments per packet within an exchange and
/// wraps at 256.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub length: u32,
    pub sequence_id: u8,
}

impl PacketHeader {
    pub const SIZE: usize = 4;

    pub fn encode(length: u32, sequence_id: u8) -> [u8; 4] {
        let mut buf = [0u8; 4];
        buf[..3].copy_from_slice(&length.to_le_bytes()[..3]);
        buf[3] = sequence_id;
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::UnexpectedEof);
        }
        let length = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]);
        Ok(Self {
            length,
            sequence_id: bytes[3],
        })
    }
}

/// Raw on-wire layout of a packet header, used only to size-check reads.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawHeader {
    length_le: [u8; 3],
    sequence_id: u8,
}

const _: () = assert!(core::mem::size_of::<RawHeader>() == PacketHeader::SIZE);

pub fn write_packet_header(out: &mut Vec<u8>, length: u32, sequence_id: u8) {
    out.extend_from_slice(&PacketHeader::encode(length, sequence_id));
}

/// Number of physical packets a logical payload of `payload_len` bytes splits
/// into, including a trailing empty packet when `payload_len` is a nonzero
/// multiple of [`MAX_PACKET_SIZE`].
pub fn chunk_count(payload_len: usize) -> usize {
    let whole = payload_len / MAX_PACKET_SIZE;
    if payload_len % MAX_PACKET_SIZE == 0 && payload_len != 0 {
        whole
    } else {
        whole + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let bytes = PacketHeader::encode(300, 7);
        let header = PacketHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header.length, 300);
        assert_eq!(header.sequence_id, 7);
    }

    #[test]
    fn chunk_count_boundaries() {
        assert_eq!(chunk_count(0), 1);
        assert_eq!(chunk_count(MAX_PACKET_SIZE), 2);
        assert_eq!(chunk_count(MAX_PACKET_SIZE - 1), 1);
        assert_eq!(chunk_count(MAX_PACKET_SIZE + 1), 2);
    }

    #[test]
    fn header_from_bytes_too_short() {
        assert!(matches!(PacketHeader::from_bytes(&[1, 2]), Err(Error::UnexpectedEof)));
    }
}
