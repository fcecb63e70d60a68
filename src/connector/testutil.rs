//! Hand-built wire packets for exercising [`super::ops::ResultReader`] and the
//! handshake state machine without a real server (the packet builders below),
//! plus a scripted fake MariaDB server over a real loopback TCP socket and a
//! real `mio::Poll` driver (['FakeServer`]/[`TestClient`]) for exercising the
//! pipeline/lifecycle/client engine end to end. Test-only.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::client::Client;
use crate::constant::CAPABILITIES_ALWAYS_ENABLED;
use crate::opts::Opts;
use crate::wire::packet::PacketHeader;

/// Frame `payload` as a single physical packet.
pub fn frame(payload: &[u8], sequence_id: u8) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&PacketHeader::encode(payload.len() as u32, sequence_id));
    out.extend_from_slice(payload);
    out
}

/// Build an `OK_Packet` payload (header already included).
pub fn ok_packet(affected_rows: u64, last_insert_id: u64, status_flags: u16, warnings: u16) -> Vec<u8> {
    let mut out = vec![0x00];
    write_lenenc(&mut out, affected_rows);
    write_lenenc(&mut out, last_insert_id);
    out.extend_from_slice(&status_flags.to_le_bytes());
    out.extend_from_slice(&warnings.to_le_bytes());
    out
}

/// Build an `ERR_Packet` payload.
pub fn err_packet(error_code: u16, sql_state: &str, message: &str) -> Vec<u8> {
    let mut out = vec![0xFF];
    out.extend_from_slice(&error_code.to_le_bytes());
    out.push(b'#');
    out.extend_from_slice(sql_state.as_bytes());
    out.extend_from_slice(message.as_bytes());
    out
}

/// Build a `Protocol::ColumnDefinition41` payload for a column named `name`.
pub fn column_definition(name: &str, column_type: u8, flags: u16) -> Vec<u8> {
    let mut out = Vec::new();
    write_lenenc_str(&mut out, "def");
    write_lenenc_str(&mut out, "");
    write_lenenc_str(&mut out, "");
    write_lenenc_str(&mut out, "");
    write_lenenc_str(&mut out, name);
    write_lenenc_str(&mut out, name);
    write_lenenc(&mut out, 12);
    out.extend_from_slice(&45u16.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.push(column_type);
    out.extend_from_slice(&flags.to_le_bytes());
    out.push(0);
    out.extend_from_slice(&0u16.to_le_bytes());
    out
}

/// Build a text-protocol row payload from `Some`/`None` cells.
pub fn text_row(cells: &[Option<&str>]) -> Vec<u8> {
    let mut out = Vec::new();
    for cell in cells {
        match cell {
            Some(value) => write_lenenc_str(&mut out, value),
            None => out.push(0xFB),
        }
    }
    out
}

/// Build a `COM_STMT_PREPARE` OK-header payload (status byte + the 11-byte
/// [`crate::wire::command::PrepareOk`] layout).
pub fn prepare_ok_packet(statement_id: u32, num_columns: u16, num_params: u16, warning_count: u16) -> Vec<u8> {
    let mut out = vec![0x00];
    out.extend_from_slice(&statement_id.to_le_bytes());
    out.extend_from_slice(&num_columns.to_le_bytes());
    out.extend_from_slice(&num_params.to_le_bytes());
    out.push(0); // reserved
    out.extend_from_slice(&warning_count.to_le_bytes());
    out
}

/// Build a binary-protocol (`COM_STMT_EXECUTE` response) row payload from
/// `Some`/`None` byte-string cells. Every non-NULL cell is encoded as a
/// length-encoded string, which is sufficient for exercising NULL-bitmap and
/// truncation-refetch behaviour without modelling every numeric wire width.
pub fn binary_row(cells: &[Option<&[u8]>]) -> Vec<u8> {
    let mut out = vec![0x00];
    let bitmap_len = crate::wire::row::null_bitmap_len(cells.len(), 2);
    let mut bitmap = vec![0u8; bitmap_len];
    for (idx, cell) in cells.iter().enumerate() {
        if cell.is_none() {
            let bit_pos = idx + 2;
            bitmap[bit_pos >> 3] |= 1 << (bit_pos & 7);
        }
    }
    out.extend_from_slice(&bitmap);
    for cell in cells.iter().flatten() {
        write_lenenc(&mut out, cell.len() as u64);
        out.extend_from_slice(cell);
    }
    out
}

fn write_lenenc(out: &mut Vec<u8>, value: u64) {
    if value < 251 {
        out.push(value as u8);
    } else if value < 0x1_0000 {
        out.push(0xFC);
        out.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value < 0x1_0000_0000 {
        out.push(0xFD);
        out.extend_from_slice(&(value as u32).to_le_bytes()[..3]);
    } else {
        out.push(0xFE);
        out.extend_from_slice(&value.to_le_bytes());
    }
}

fn write_lenenc_str(out: &mut Vec<u8>, s: &str) {
    write_lenenc(out, s.len() as u64);
    out.extend_from_slice(s.as_bytes());
}

/// Build a `HandshakeV10` payload advertising `mysql_native_password`, wide
/// enough to satisfy [`super::handshake::on_initial_handshake`].
fn initial_handshake_payload() -> Vec<u8> {
    let mut out = Vec::new();
    out.push(10); // protocol_version
    out.extend_from_slice(b"8.0.0-fake");
    out.push(0);
    out.extend_from_slice(&7u32.to_le_bytes()); // connection_id
    let scramble = [0x11u8; 20];
    out.extend_from_slice(&scramble[..8]);
    out.push(0); // filler
    let caps = CAPABILITIES_ALWAYS_ENABLED.bits();
    out.extend_from_slice(&(caps as u16).to_le_bytes());
    out.push(0x2d); // charset: utf8mb4_general_ci
    out.extend_from_slice(&0u16.to_le_bytes()); // status flags
    out.extend_from_slice(&((caps >> 16) as u16).to_le_bytes());
    out.push(21); // auth_data_len
    out.extend_from_slice(&[0u8; 10]);
    out.extend_from_slice(&scramble[8..20]);
    out.extend_from_slice(b"mysql_native_password");
    out.push(0);
    out
}

/// Write one physical packet to a raw stream, for the fake-server side of the
/// harness (the real client goes through [`super::transport::Transport`]).
pub fn write_raw_packet(stream: &mut TcpStream, payload: &[u8], sequence_id: u8) {
    stream.write_all(&frame(payload, sequence_id)).expect("write fake server packet");
}

/// Read one physical packet from a raw stream, returning its sequence id and
/// payload. Blocks until a full packet has arrived.
pub fn read_raw_packet(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut header = [0u8; PacketHeader::SIZE];
    stream.read_exact(&mut header).expect("read packet header");
    let parsed = PacketHeader::from_bytes(&header).expect("valid packet header");
    let mut payload = vec![0u8; parsed.length as usize];
    stream.read_exact(&mut payload).expect("read packet payload");
    (parsed.sequence_id, payload)
}

/// A scripted fake MariaDB server bound to a loopback port. Drives the real
/// handshake state machine (`mysql_native_password`, accepting whatever auth
/// response the client computes) and then hands the raw stream to a script
/// closure for the rest of the exchange, on a background thread so the
/// test's own thread is free to drive the client side through a real
/// `mio::Poll`.
pub struct FakeServer {
    listener: TcpListener,
}

impl FakeServer {
    pub fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback listener");
        Self { listener }
    }

    pub fn port(&self) -> u16 {
        self.listener.local_addr().expect("local addr").port()
    }

    /// Accept exactly one connection, complete the handshake, then run
    /// `script` against the raw stream.
    pub fn run(self, script: impl FnOnce(&mut TcpStream) + Send + 'static) -> JoinHandle<()> {
        std::thread::spawn(move || {
            let (mut stream, _) = self.listener.accept().expect("accept fake client");
            write_raw_packet(&mut stream, &initial_handshake_payload(), 0);
            let _handshake_response = read_raw_packet(&mut stream);
            write_raw_packet(&mut stream, &ok_packet(0, 0, 0x0002, 0), 2);
            script(&mut stream);
        })
    }
}

/// `Opts` pointing at a [`FakeServer`]: empty password (so
/// `mysql_native_password` always produces the same all-zero scramble
/// response regardless of the server's challenge, letting the fake server
/// skip validating it) and no init command.
pub fn fake_server_opts(port: u16) -> Opts {
    Opts { host: Some("127.0.0.1".to_string()), port, user: "test".to_string(), password: None, ..Opts::default() }
}

/// Owns a [`Client`] plus the real `mio::Poll`/`Registry` it is registered
/// on, so a test can drive the genuine non-blocking event loop against a
/// [`FakeServer`] instead of faking the reactor.
pub struct TestClient {
    pub client: Client,
    poll: mio::Poll,
    token: mio::Token,
}

impl TestClient {
    pub fn connect(opts: Opts) -> crate::error::Result<Self> {
        let poll = mio::Poll::new().expect("create mio::Poll");
        let registry = poll.registry().try_clone().expect("clone registry");
        let token = mio::Token(0);
        let client = Client::connect(opts, registry, token)?;
        Ok(Self { client, poll, token })
    }

    /// Pump the real event loop, delivering readiness events to the client,
    /// until `done` reports completion or `timeout` elapses (panics on
    /// timeout, since every scripted exchange here is expected to finish
    /// over loopback well within it).
    pub fn drive_until(&mut self, mut done: impl FnMut(&Client) -> bool, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut events = mio::Events::with_capacity(8);
        while !done(&self.client) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                panic!("test harness timed out waiting for completion");
            }
            self.poll.poll(&mut events, Some(remaining)).expect("poll");
            for event in events.iter() {
                if event.token() == self.token {
                    self.client.notify(event.is_readable(), event.is_writable());
                }
            }
        }
    }
}

/// Default timeout for [`TestClient::drive_until`]; generous for a loopback
/// round trip but still short enough that a genuine hang fails the test
/// instead of the suite.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_packet_roundtrips_through_response_parser() {
        use crate::wire::response::{OkPayload, OkPayloadBytes};

        let payload = ok_packet(3, 0, 0x0002, 0);
        let ok = OkPayload::try_from(OkPayloadBytes(&payload)).expect("valid OK payload");
        assert_eq!(ok.affected_rows, 3);
    }

    #[test]
    fn column_definition_roundtrips_through_parser() {
        use crate::wire::column_definition::parse_column_definition;

        let payload = column_definition("id", 0x03, 0);
        let def = parse_column_definition(&payload).expect("valid column definition");
        assert_eq!(def.name(), b"id");
    }

    #[test]
    fn binary_row_marks_null_bit() {
        let payload = binary_row(&[None, Some(b"hi")]);
        let row = crate::wire::row::read_binary_row(&payload, 2).expect("valid binary row");
        assert_eq!(row.num_columns(), 2);
    }
}
