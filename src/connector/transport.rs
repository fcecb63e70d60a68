//! Non-blocking byte transport: packet framing (length + sequence, 16MB
//! chunk split/reassembly) over a [`mio`]-registrable socket. Carries bytes
//! only; nothing here understands what a payload means.

use std::io::{self, Read, Write};

use mio::net::TcpStream;

use crate::error::{Error, Result};
use crate::wire::packet::{MAX_PACKET_SIZE, PacketHeader};

/// Either side of the connection the core speaks to. Unix sockets are a
/// thin wrapper with the same framing; only TCP is modeled here since it is
/// the common case and the framing logic is identical either way.
pub struct Transport {
    stream: TcpStream,
    write_buf: Vec<u8>,
    write_pos: usize,
    read_buf: Vec<u8>,
    /// Sequence id of the next packet this side sends; reset to 0 at the
    /// start of every command, incremented (mod 256) per physical packet.
    next_sequence_id: u8,
}

impl Transport {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            write_buf: Vec::new(),
            write_pos: 0,
            read_buf: Vec::new(),
            next_sequence_id: 0,
        }
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn stream_ref(&self) -> &TcpStream {
        &self.stream
    }

    /// Start a new command: reset sequencing and the read buffer so a stale
    /// partial packet from a previous (already-completed) exchange can never
    /// bleed into the next one.
    pub fn begin_command(&mut self) {
        self.next_sequence_id = 0;
        self.read_buf.clear();
    }

    /// Frame `payload` as one or more physical packets (splitting at
    /// [`MAX_PACKET_SIZE`]) and append them to the pending write buffer.
    pub fn queue_payload(&mut self, payload: &[u8]) {
        let mut rest = payload;
        loop {
            let chunk_len = rest.len().min(MAX_PACKET_SIZE);
            let (chunk, tail) = rest.split_at(chunk_len);
            self.write_buf.extend_from_slice(&PacketHeader::encode(chunk_len as u32, self.next_sequence_id));
            self.write_buf.extend_from_slice(chunk);
            self.next_sequence_id = self.next_sequence_id.wrapping_add(1);
            rest = tail;
            if chunk_len < MAX_PACKET_SIZE {
                break;
            }
        }
    }

    /// Drive the pending write buffer toward the socket. Returns `true` once
    /// fully flushed, `false` if the socket would block (caller should wait
    /// for writability).
    pub fn try_flush(&mut self) -> Result<bool> {
        while self.write_pos < self.write_buf.len() {
            match self.stream.write(&self.write_buf[self.write_pos..]) {
                Ok(0) => return Err(Error::IoError(io::Error::from(io::ErrorKind::WriteZero))),
                Ok(n) => self.write_pos += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::IoError(e)),
            }
        }
        self.write_buf.clear();
        self.write_pos = 0;
        Ok(true)
    }

    /// Read available bytes and try to assemble one full logical packet
    /// (reassembling 16MB-split chunks). Returns `None` if more data is
    /// needed (caller should wait for readability).
    pub fn try_read_packet(&mut self) -> Result<Option<Vec<u8>>> {
        let mut chunk = [0u8; 64 * 1024];
        loop {
            if let Some(payload) = self.try_assemble_packet()? {
                return Ok(Some(payload));
            }
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(Error::IoError(io::Error::from(io::ErrorKind::UnexpectedEof)));
                }
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::IoError(e)),
            }
        }
    }

    /// Try to pull one or more physical packets worth of a single logical
    /// payload out of `read_buf`. A physical packet whose length equals
    /// [`MAX_PACKET_SIZE`] is always followed by another packet belonging to
    /// the same logical payload (possibly an empty trailing one).
    fn try_assemble_packet(&mut self) -> Result<Option<Vec<u8>>> {
        let mut payload = Vec::new();
        let mut consumed = 0usize;
        loop {
            let header_bytes = &self.read_buf[consumed..];
            if header_bytes.len() < PacketHeader::SIZE {
                return Ok(None);
            }
            let header = PacketHeader::from_bytes(header_bytes)?;
            let total = PacketHeader::SIZE + header.length as usize;
            if header_bytes.len() < total {
                return Ok(None);
            }
            payload.extend_from_slice(&header_bytes[PacketHeader::SIZE..total]);
            consumed += total;
            if (header.length as usize) < MAX_PACKET_SIZE {
                break;
            }
        }
        self.read_buf.drain(..consumed);
        Ok(Some(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_payload_splits_on_max_packet_size() {
        let mut buf = Vec::new();
        let payload = vec![0u8; MAX_PACKET_SIZE + 1];
        // Mirrors Transport::queue_payload without a real socket: exercise
        // the header math directly.
        let mut rest: &[u8] = &payload;
        let mut seq = 0u8;
        loop {
            let chunk_len = rest.len().min(MAX_PACKET_SIZE);
            let (chunk, tail) = rest.split_at(chunk_len);
            buf.extend_from_slice(&PacketHeader::encode(chunk_len as u32, seq));
            buf.extend_from_slice(chunk);
            seq = seq.wrapping_add(1);
            rest = tail;
            if chunk_len < MAX_PACKET_SIZE {
                break;
            }
        }
        assert_eq!(seq, 2);
    }
}
