//! The connector: a non-blocking MariaDB/MySQL client engine standing in for
//! a native connector library. It owns the socket and wire-level state and
//! exposes a `*_start`/`*_cont` pair per operation, each returning
//! [`ConnectorPoll::Done`] or [`ConnectorPoll::Wait`] — never blocking.
//! [`crate::pipeline`] is the only caller; it treats the connector as an
//! opaque collaborator, same as the core treats a native library.

mod handshake;
mod ops;
#[cfg(any(test, feature = "test-util"))]
pub mod testutil;
pub mod transport;

use std::net::ToSocketAddrs;
use std::time::Duration;

use mio::net::TcpStream;
use tracing::instrument;

use crate::constant::CapabilityFlags;
use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::row::{ColumnMeta, QueryResult};
use crate::watcher::WaitSet;
use crate::wire::command::{
    PrepareOk, read_prepare_ok, write_change_user, write_close_statement, write_execute, write_init_db, write_ping,
    write_prepare, write_query, write_reset_connection, write_reset_statement,
};
use crate::wire::params::ParamValue;
use crate::wire::response::{OkPayload, OkPayloadBytes, is_err_packet};
use handshake::{AuthProgress, HandshakeStep, ServerInfo, on_auth_packet, on_initial_handshake};
use ops::{ReaderProgress, ResultReader, RowFormat};
use transport::Transport;

/// Result of a `*_start`/`*_cont` call: either the operation finished
/// synchronously (a full response was already buffered) or the connector
/// needs the event loop to wait on its behalf.
#[derive(Debug)]
pub enum ConnectorPoll<T> {
    Done(T),
    Wait(WaitSet),
}

/// What `COM_STMT_PREPARE` yields at the connector level: the server's own
/// numeric statement id, not yet wrapped in an opaque
/// [`crate::handle::StmtHandle`] (that mapping belongs to [`crate::lifecycle`]).
#[derive(Debug)]
pub struct PrepareResult {
    pub server_statement_id: u32,
    pub param_count: u16,
    pub columns: Vec<ColumnMeta>,
}

/// What to transition into once the current write finishes flushing.
enum NextPhase {
    QueryResult(RowFormat),
    PrepareResult,
    UnitResult,
    None,
}

enum Op {
    Idle,
    Connecting(HandshakeStep),
    Sending(NextPhase),
    AwaitUnitResult,
    AwaitPrepareResult,
    AwaitQueryResult(ResultReader),
}

/// Non-blocking MariaDB/MySQL protocol engine. One instance per connection.
pub struct Connector {
    transport: Transport,
    opts: Opts,
    server: Option<ServerInfo>,
    op: Op,
}

impl Connector {
    /// Open the socket (itself non-blocking: a `connect()` in progress is
    /// surfaced as `Wait(WRITABLE)`) and start the handshake.
    pub fn connect_start(opts: Opts) -> Result<(Self, ConnectorPoll<()>)> {
        if opts.tls {
            return Err(Error::Unsupported("tls".to_string()));
        }

        let addr = match (&opts.host, opts.port) {
            (Some(host), port) => (host.as_str(), port)
                .to_socket_addrs()
                .map_err(Error::IoError)?
                .next()
                .ok_or_else(|| Error::BadConfigError(format!("could not resolve host '{host}'")))?,
            (None, _) => {
                return Err(Error::Unsupported("unix socket connections".to_string()));
            }
        };

        let stream = TcpStream::connect(addr).map_err(Error::IoError)?;
        if opts.tcp_nodelay {
            stream.set_nodelay(true).map_err(Error::IoError)?;
        }

        let mut connector = Self {
            transport: Transport::new(stream),
            opts,
            server: None,
            op: Op::Connecting(HandshakeStep::AwaitingInitial),
        };
        connector.transport.begin_command();
        // The server speaks first; nothing to flush yet.
        let timeout = connector.opts.connect_timeout;
        Ok((connector, ConnectorPoll::Wait(WaitSet::readable(timeout))))
    }

    #[instrument(skip_all)]
    pub fn connect_cont(&mut self) -> Result<ConnectorPoll<()>> {
        if !matches!(self.op, Op::Connecting(_)) {
            return Err(Error::from_debug("connect_cont called outside Connecting"));
        }

        let Some(payload) = self.transport.try_read_packet()? else {
            return Ok(ConnectorPoll::Wait(WaitSet::readable(self.opts.connect_timeout)));
        };

        let step = match std::mem::replace(&mut self.op, Op::Idle) {
            Op::Connecting(step) => step,
            _ => unreachable!(),
        };
        match step {
            HandshakeStep::AwaitingInitial => {
                let (server, next_step, response_bytes) = on_initial_handshake(&self.opts, &payload)?;
                self.server = Some(server);
                self.transport.queue_payload(&response_bytes);
                self.op = Op::Connecting(next_step);
            }
            other => match on_auth_packet(&self.opts, other, &payload)? {
                AuthProgress::Done => {
                    self.op = Op::Idle;
                    return Ok(ConnectorPoll::Done(()));
                }
                AuthProgress::Pending { step, write } => {
                    if !write.is_empty() {
                        self.transport.queue_payload(&write);
                    }
                    self.op = Op::Connecting(step);
                }
            },
        }

        if self.transport.try_flush()? {
            Ok(ConnectorPoll::Wait(WaitSet::readable(self.opts.connect_timeout)))
        } else {
            Ok(ConnectorPoll::Wait(WaitSet::writable(self.opts.connect_timeout)))
        }
    }

    pub fn capabilities(&self) -> CapabilityFlags {
        self.server.as_ref().map(|s| s.capabilities).unwrap_or(CapabilityFlags::empty())
    }

    pub fn thread_id(&self) -> Option<u32> {
        self.server.as_ref().map(|s| s.connection_id)
    }

    pub fn server_version(&self) -> Option<&str> {
        self.server.as_ref().map(|s| s.server_version.as_str())
    }

    /// The socket, for registering with an event-loop reactor. Never read or
    /// written to directly outside [`transport`]; exposed so [`crate::pipeline`]
    /// can hand it to a [`crate::watcher::Watcher`].
    pub fn socket_mut(&mut self) -> &mut TcpStream {
        self.transport.stream_mut()
    }

    /// Raw fd, for the `socket` accessor mirroring `mysql_get_socket`. Unix
    /// only, same as the rest of this crate's transport layer.
    pub fn raw_fd(&self) -> std::os::fd::RawFd {
        use std::os::fd::AsRawFd;
        self.transport.stream_ref().as_raw_fd()
    }

    fn begin_send(&mut self, payload: &[u8], next: NextPhase) -> Result<ConnectorPoll<()>> {
        self.transport.begin_command();
        self.transport.queue_payload(payload);
        self.op = Op::Sending(next);
        self.drive_send()
    }

    fn drive_send(&mut self) -> Result<ConnectorPoll<()>> {
        if self.transport.try_flush()? {
            self.op = match std::mem::replace(&mut self.op, Op::Idle) {
                Op::Sending(NextPhase::QueryResult(fmt)) => Op::AwaitQueryResult(ResultReader::new(fmt)),
                Op::Sending(NextPhase::PrepareResult) => Op::AwaitPrepareResult,
                Op::Sending(NextPhase::UnitResult) => Op::AwaitUnitResult,
                Op::Sending(NextPhase::None) => Op::Idle,
                other => other,
            };
            Ok(ConnectorPoll::Done(()))
        } else {
            Ok(ConnectorPoll::Wait(WaitSet::writable(self.write_timeout())))
        }
    }

    fn write_timeout(&self) -> Option<Duration> {
        self.opts.write_timeout
    }

    fn read_timeout(&self) -> Option<Duration> {
        self.opts.read_timeout
    }

    /// Continue flushing a write begun by any `*_start` call that returned
    /// `Wait(WRITABLE)`. Once flushed, the connector has already moved on to
    /// awaiting the matching response; call the corresponding `recv_*_cont`.
    pub fn send_cont(&mut self) -> Result<ConnectorPoll<()>> {
        if !matches!(self.op, Op::Sending(_)) {
            return Err(Error::from_debug("send_cont called outside Sending"));
        }
        self.drive_send()
    }

    // ---- COM_QUERY -----------------------------------------------------

    pub fn query_start(&mut self, sql: &str) -> Result<ConnectorPoll<()>> {
        let mut payload = Vec::new();
        write_query(&mut payload, sql);
        self.begin_send(&payload, NextPhase::QueryResult(RowFormat::Text))
    }

    pub fn recv_query_cont(&mut self) -> Result<ConnectorPoll<QueryResult>> {
        self.recv_result_cont()
    }

    fn recv_result_cont(&mut self) -> Result<ConnectorPoll<QueryResult>> {
        loop {
            let Some(payload) = self.transport.try_read_packet()? else {
                return Ok(ConnectorPoll::Wait(WaitSet::readable(self.read_timeout())));
            };
            let Op::AwaitQueryResult(reader) = &mut self.op else {
                return Err(Error::from_debug("recv_result_cont called outside AwaitQueryResult"));
            };
            match reader.feed(&payload)? {
                ReaderProgress::NeedMorePackets => continue,
                ReaderProgress::Done(result) => {
                    self.op = Op::Idle;
                    return Ok(ConnectorPoll::Done(result));
                }
            }
        }
    }

    // ---- COM_STMT_PREPARE -----------------------------------------------

    pub fn prepare_start(&mut self, sql: &str) -> Result<ConnectorPoll<()>> {
        let mut payload = Vec::new();
        write_prepare(&mut payload, sql);
        self.begin_send(&payload, NextPhase::PrepareResult)
    }

    pub fn recv_prepare_cont(&mut self) -> Result<ConnectorPoll<PrepareResult>> {
        if !matches!(self.op, Op::AwaitPrepareResult) {
            return Err(Error::from_debug("recv_prepare_cont called outside AwaitPrepareResult"));
        }

        let Some(payload) = self.transport.try_read_packet()? else {
            return Ok(ConnectorPoll::Wait(WaitSet::readable(self.read_timeout())));
        };
        if is_err_packet(&payload) {
            return Err(crate::wire::response::ErrPayloadBytes(&payload).into());
        }
        let ok: PrepareOk = read_prepare_ok(&payload)?;

        // Parameter and column definition packets follow; CLIENT_DEPRECATE_EOF
        // means no trailing EOF packet for either group.
        for _ in 0..ok.num_params() {
            let Some(_param_def) = self.transport.try_read_packet()? else {
                return Ok(ConnectorPoll::Wait(WaitSet::readable(self.read_timeout())));
            };
        }
        let mut columns = Vec::new();
        for _ in 0..ok.num_columns() {
            let Some(col_def) = self.transport.try_read_packet()? else {
                return Ok(ConnectorPoll::Wait(WaitSet::readable(self.read_timeout())));
            };
            let parsed = crate::wire::column_definition::parse_column_definition(&col_def)?;
            columns.push(ColumnMeta {
                name: String::from_utf8_lossy(parsed.name()).to_string(),
                column_type: parsed.tail.column_type()?,
                flags: parsed.tail.flags(),
                decimals: parsed.tail.decimals(),
            });
        }

        self.op = Op::Idle;
        Ok(ConnectorPoll::Done(PrepareResult {
            server_statement_id: ok.statement_id(),
            param_count: ok.num_params(),
            columns,
        }))
    }

    // ---- COM_STMT_EXECUTE -------------------------------------------------

    pub fn execute_start(&mut self, statement_id: u32, params: &[ParamValue<'_>]) -> Result<ConnectorPoll<()>> {
        let mut payload = Vec::new();
        write_execute(&mut payload, statement_id, params)?;
        self.begin_send(&payload, NextPhase::QueryResult(RowFormat::Binary))
    }

    pub fn recv_execute_cont(&mut self) -> Result<ConnectorPoll<QueryResult>> {
        self.recv_result_cont()
    }

    // ---- COM_STMT_CLOSE (fire-and-forget, server sends no response) -----

    pub fn close_stmt_start(&mut self, statement_id: u32) -> Result<ConnectorPoll<()>> {
        let mut payload = Vec::new();
        write_close_statement(&mut payload, statement_id);
        self.begin_send(&payload, NextPhase::None)
    }

    // ---- COM_STMT_RESET, COM_PING, COM_INIT_DB, COM_RESET_CONNECTION -----

    pub fn stmt_reset_start(&mut self, statement_id: u32) -> Result<ConnectorPoll<()>> {
        let mut payload = Vec::new();
        write_reset_statement(&mut payload, statement_id);
        self.begin_send(&payload, NextPhase::UnitResult)
    }

    pub fn ping_start(&mut self) -> Result<ConnectorPoll<()>> {
        let mut payload = Vec::new();
        write_ping(&mut payload);
        self.begin_send(&payload, NextPhase::UnitResult)
    }

    pub fn select_db_start(&mut self, db: &str) -> Result<ConnectorPoll<()>> {
        let mut payload = Vec::new();
        write_init_db(&mut payload, db);
        self.begin_send(&payload, NextPhase::UnitResult)
    }

    pub fn reset_connection_start(&mut self) -> Result<ConnectorPoll<()>> {
        let mut payload = Vec::new();
        write_reset_connection(&mut payload);
        self.begin_send(&payload, NextPhase::UnitResult)
    }

    /// `change_user` re-authenticates on the same connection. The initial
    /// auth response is left empty, forcing the server to issue an
    /// `AuthSwitchRequest` naming its plugin and a fresh scramble; the reply
    /// is read with [`Connector::recv_unit_cont`], so a server that actually
    /// requires that round trip surfaces as a protocol error here rather
    /// than being carried through (no `HandshakeStep` survives from the
    /// initial connection to resume from).
    pub fn change_user_start(&mut self, user: &str, _password: &str, db: Option<&str>) -> Result<ConnectorPoll<()>> {
        let mut payload = Vec::new();
        write_change_user(&mut payload, user, &[], db, 45);
        self.begin_send(&payload, NextPhase::UnitResult)
    }

    pub fn recv_unit_cont(&mut self) -> Result<ConnectorPoll<()>> {
        if !matches!(self.op, Op::AwaitUnitResult) {
            return Err(Error::from_debug("recv_unit_cont called outside AwaitUnitResult"));
        }
        let Some(payload) = self.transport.try_read_packet()? else {
            return Ok(ConnectorPoll::Wait(WaitSet::readable(self.read_timeout())));
        };
        if is_err_packet(&payload) {
            return Err(crate::wire::response::ErrPayloadBytes(&payload).into());
        }
        let _ok: OkPayload = OkPayload::try_from(OkPayloadBytes(&payload))?;
        self.op = Op::Idle;
        Ok(ConnectorPoll::Done(()))
    }
}
