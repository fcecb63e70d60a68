//! Pipeline Engine: the send-phase / receive-phase loop. Owns the connector,
//! its watcher registration, the callback queues, and the statement arena
//! (translating opaque [`StmtHandle`]s to the connector's raw statement ids).
//! Never touches wire bytes directly — only calls through [`Connector`].

use tracing::{debug, instrument};

use crate::connector::{Connector, ConnectorPoll, PrepareResult};
use crate::error::{Error, Result};
use crate::handle::{StmtArena, StmtHandle};
use crate::queues::{CallbackQueues, MAX_PIPELINE_DEPTH, PendingCallback, PendingSend, ReadyCallback};
use crate::row::{PreparedInfo, QueryResult};
use crate::state::OperationState;
use crate::watcher::{MioReactor, WaitSet, Watcher};
use crate::wire::params::ParamValue;

/// What the in-flight send will become once it finishes flushing, so the
/// engine knows which `recv_*_cont` to drive it with.
#[derive(Clone, Copy)]
enum SendKind {
    Query,
    Prepare,
    Execute,
    Unit,
    /// `COM_STMT_CLOSE`: the server sends no response; the callback fires as
    /// soon as the write flushes.
    FireAndForget,
}

pub struct Pipeline {
    connector: Connector,
    watcher: Watcher<MioReactor>,
    queues: CallbackQueues,
    state: OperationState,
    /// The wait-set the connector reported for the operation currently in
    /// flight, carried verbatim (including its timeout) into the watcher.
    current_wait: Option<WaitSet>,
    send_count: usize,
    send_kind: Option<SendKind>,
    stmt_arena: StmtArena<u32>,
}

impl Pipeline {
    pub fn new(connector: Connector, reactor: MioReactor) -> Self {
        Self {
            connector,
            watcher: Watcher::new(reactor),
            queues: CallbackQueues::new(),
            state: OperationState::Idle,
            current_wait: None,
            send_count: 0,
            send_kind: None,
            stmt_arena: StmtArena::new(),
        }
    }

    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    pub fn pending_count(&self) -> usize {
        self.queues.pending_count()
    }

    /// Drain callbacks deferred by [`crate::queues::CallbackQueues::defer`]
    /// since the last drain, for the caller to run once it holds no borrow
    /// this pipeline is behind.
    pub fn drain_ready(&mut self) -> Vec<ReadyCallback> {
        self.queues.drain_ready()
    }

    pub fn state(&self) -> OperationState {
        self.state
    }

    /// Statement-scope operations (execute, close_stmt, stmt_reset) and the
    /// exclusive utility operations (ping, select_db, change_user,
    /// reset_connection, prepare) refuse to queue while queries are
    /// in flight; plain queries may always queue.
    pub fn exclusive_op_allowed(&self) -> bool {
        self.send_count == 0
    }

    pub fn enqueue(&mut self, item: PendingSend) -> Result<()> {
        if self.queues.is_full() {
            return Err(Error::PipelineBusy);
        }
        self.queues.push_send(item);
        Ok(())
    }

    pub fn resolve_handle(&self, handle: StmtHandle) -> Result<u32> {
        self.stmt_arena.get(handle).map(|id| *id)
    }

    /// Drive as much progress as possible without blocking: start sends,
    /// receive completed responses, and loop while the connector keeps
    /// completing synchronously. Always ends by reconciling the watcher
    /// registration with whatever wait the connector now reports. Completed
    /// callbacks are collected rather than run here — see
    /// [`crate::queues::CallbackQueues::defer`] — so the caller must run the
    /// returned thunks once it has released any borrow it took to call this.
    #[instrument(skip_all)]
    pub fn pump(&mut self) -> Result<Vec<ReadyCallback>> {
        loop {
            if !self.state.is_idle() {
                break;
            }
            if self.try_start_next_send()? {
                continue;
            }
            break;
        }
        self.sync_watcher()?;
        Ok(self.queues.drain_ready())
    }

    /// Called by the integrator's event loop when the registered socket
    /// becomes readable and/or writable.
    #[instrument(skip_all)]
    pub fn notify(&mut self, readable: bool, writable: bool) -> Result<Vec<ReadyCallback>> {
        match self.state {
            OperationState::Idle => {}
            OperationState::Connecting if readable => self.continue_connecting()?,
            OperationState::Sending if writable => self.continue_sending()?,
            OperationState::ReceivingQuery if readable => self.continue_receiving_query()?,
            OperationState::ReceivingPrepare if readable => self.continue_receiving_prepare()?,
            OperationState::ReceivingUnit if readable => self.continue_receiving_unit()?,
            _ => {}
        }
        self.pump()
    }

    pub fn begin_connect(&mut self, poll: ConnectorPoll<()>) -> Result<()> {
        match poll {
            ConnectorPoll::Done(()) => {
                self.state = OperationState::Idle;
                self.current_wait = None;
            }
            ConnectorPoll::Wait(ws) => {
                self.state = OperationState::Connecting;
                self.current_wait = Some(ws);
            }
        }
        self.sync_watcher()
    }

    fn continue_connecting(&mut self) -> Result<()> {
        match self.connector.connect_cont() {
            Ok(ConnectorPoll::Done(())) => {
                self.state = OperationState::Idle;
                self.current_wait = None;
                Ok(())
            }
            Ok(ConnectorPoll::Wait(ws)) => {
                self.current_wait = Some(ws);
                Ok(())
            }
            Err(err) => {
                self.state = OperationState::Idle;
                self.current_wait = None;
                Err(err)
            }
        }
    }

    fn try_start_next_send(&mut self) -> Result<bool> {
        if self.send_count >= MAX_PIPELINE_DEPTH {
            return Ok(false);
        }
        let Some(item) = self.queues.pop_send() else {
            return Ok(false);
        };

        let started = match &item {
            PendingSend::Query { sql, .. } => (self.connector.query_start(sql), SendKind::Query),
            PendingSend::Prepare { sql, .. } => (self.connector.prepare_start(sql), SendKind::Prepare),
            PendingSend::Execute { handle, params, .. } => {
                let server_id = self.resolve_handle(*handle);
                let poll = server_id.and_then(|id| {
                    let values: Vec<ParamValue<'_>> = params.iter().map(|p| p.as_deref()).collect();
                    self.connector.execute_start(id, &values)
                });
                (poll, SendKind::Execute)
            }
            PendingSend::CloseStmt { handle, .. } => {
                let poll = self.resolve_handle(*handle).and_then(|id| self.connector.close_stmt_start(id));
                (poll, SendKind::FireAndForget)
            }
            PendingSend::StmtReset { handle, .. } => {
                let poll = self.resolve_handle(*handle).and_then(|id| self.connector.stmt_reset_start(id));
                (poll, SendKind::Unit)
            }
            PendingSend::Ping { .. } => (self.connector.ping_start(), SendKind::Unit),
            PendingSend::SelectDb { db, .. } => (self.connector.select_db_start(db), SendKind::Unit),
            PendingSend::ResetConnection { .. } => (self.connector.reset_connection_start(), SendKind::Unit),
            PendingSend::ChangeUser { user, password, db, .. } => {
                (self.connector.change_user_start(user, password, db.as_deref()), SendKind::Unit)
            }
        };

        let (poll, kind) = started;
        match poll {
            Ok(poll) => self.on_send_started(item, kind, poll),
            Err(err) => {
                let fatal = err.is_fatal();
                let message = err.to_string();
                self.queues.defer_failure(item.into_callback(), err);
                if fatal { Err(Error::ConnectionLost(message)) } else { Ok(true) }
            }
        }
    }

    fn on_send_started(&mut self, item: PendingSend, kind: SendKind, poll: ConnectorPoll<()>) -> Result<bool> {
        match poll {
            ConnectorPoll::Wait(ws) => {
                self.state = OperationState::Sending;
                self.current_wait = Some(ws);
                self.send_kind = Some(kind);
                self.queues.push_callback(pending_for(item));
                self.send_count += 1;
                Ok(false)
            }
            ConnectorPoll::Done(()) => self.on_send_flushed(item, kind),
        }
    }

    fn on_send_flushed(&mut self, item: PendingSend, kind: SendKind) -> Result<bool> {
        if matches!(kind, SendKind::FireAndForget) {
            let PendingCallback::CloseStmt(cb) = item.into_callback() else {
                return Err(Error::from_debug("FireAndForget send produced a non-CloseStmt callback"));
            };
            self.queues.defer(cb, Ok(()));
            return Ok(true);
        }
        self.queues.push_callback(pending_for(item));
        self.send_count += 1;
        self.state = operation_state_for(kind);
        self.try_receive_now()
    }

    fn continue_sending(&mut self) -> Result<()> {
        let kind = self.send_kind.expect("Sending state without a recorded send kind");
        match self.connector.send_cont()? {
            ConnectorPoll::Wait(ws) => {
                self.current_wait = Some(ws);
            }
            ConnectorPoll::Done(()) => {
                if matches!(kind, SendKind::FireAndForget) {
                    let Some(PendingCallback::CloseStmt(cb)) = self.queues.pop_callback() else {
                        return Err(Error::from_debug("expected a pending CloseStmt callback"));
                    };
                    self.send_count -= 1;
                    self.state = OperationState::Idle;
                    self.current_wait = None;
                    self.queues.defer(cb, Ok(()));
                } else {
                    self.state = operation_state_for(kind);
                    self.try_receive_now()?;
                }
            }
        }
        Ok(())
    }

    fn try_receive_now(&mut self) -> Result<bool> {
        match self.state {
            OperationState::ReceivingQuery => self.continue_receiving_query().map(|()| true),
            OperationState::ReceivingPrepare => self.continue_receiving_prepare().map(|()| true),
            OperationState::ReceivingUnit => self.continue_receiving_unit().map(|()| true),
            _ => Ok(true),
        }
    }

    fn continue_receiving_query(&mut self) -> Result<()> {
        match self.connector.recv_query_cont() {
            Ok(ConnectorPoll::Wait(ws)) => {
                self.current_wait = Some(ws);
                Ok(())
            }
            Ok(ConnectorPoll::Done(result)) => self.deliver_query(Ok(result)),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => self.deliver_query(Err(err)),
        }
    }

    fn deliver_query(&mut self, result: Result<QueryResult>) -> Result<()> {
        self.send_count -= 1;
        self.state = OperationState::Idle;
        self.current_wait = None;
        let Some(PendingCallback::Query(cb) | PendingCallback::Execute(cb)) = self.queues.pop_callback() else {
            return Err(Error::from_debug("expected a pending Query/Execute callback"));
        };
        if let Ok(statements) = &result {
            if statements.len() > 1 {
                debug!(drained = statements.len() - 1, "multi-statement query: extra result sets retained in full");
            }
        }
        self.queues.defer(cb, result);
        Ok(())
    }

    fn continue_receiving_prepare(&mut self) -> Result<()> {
        match self.connector.recv_prepare_cont() {
            Ok(ConnectorPoll::Wait(ws)) => {
                self.current_wait = Some(ws);
                Ok(())
            }
            Ok(ConnectorPoll::Done(prepared)) => self.deliver_prepare(Ok(prepared)),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => self.deliver_prepare(Err(err)),
        }
    }

    fn deliver_prepare(&mut self, result: Result<PrepareResult>) -> Result<()> {
        self.send_count -= 1;
        self.state = OperationState::Idle;
        self.current_wait = None;
        let Some(PendingCallback::Prepare(cb)) = self.queues.pop_callback() else {
            return Err(Error::from_debug("expected a pending Prepare callback"));
        };
        let mapped = result.map(|prepared| {
            let param_count = prepared.param_count;
            let columns = prepared.columns;
            let handle = self.stmt_arena.insert(prepared.server_statement_id);
            PreparedInfo { handle, param_count, columns }
        });
        self.queues.defer(cb, mapped);
        Ok(())
    }

    fn continue_receiving_unit(&mut self) -> Result<()> {
        match self.connector.recv_unit_cont() {
            Ok(ConnectorPoll::Wait(ws)) => {
                self.current_wait = Some(ws);
                Ok(())
            }
            Ok(ConnectorPoll::Done(())) => self.deliver_unit(Ok(())),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => self.deliver_unit(Err(err)),
        }
    }

    fn deliver_unit(&mut self, result: Result<()>) -> Result<()> {
        self.send_count -= 1;
        self.state = OperationState::Idle;
        self.current_wait = None;
        let Some(callback) = self.queues.pop_callback() else {
            return Err(Error::from_debug("expected a pending unit callback"));
        };
        match callback {
            PendingCallback::Ping(cb)
            | PendingCallback::SelectDb(cb)
            | PendingCallback::ChangeUser(cb)
            | PendingCallback::ResetConnection(cb)
            | PendingCallback::StmtReset(cb) => self.queues.defer(cb, result),
            _ => return Err(Error::from_debug("unexpected pending callback for unit result")),
        }
        Ok(())
    }

    /// Forget the statement: drop its arena slot so a stale handle is
    /// rejected by future calls, regardless of how `close_stmt` resolves.
    pub fn forget_statement(&mut self, handle: StmtHandle) {
        let _ = self.stmt_arena.remove(handle);
    }

    /// Cancel every queued and in-flight operation with `err_factory`'s
    /// error, without attempting a clean protocol teardown.
    pub fn cancel_all(&mut self, err_factory: impl Fn() -> Error) {
        self.queues.cancel_all(err_factory);
        self.send_count = 0;
        self.state = OperationState::Idle;
        self.current_wait = None;
    }

    fn sync_watcher(&mut self) -> Result<()> {
        self.watcher.update(self.connector.socket_mut(), self.current_wait.as_ref())
    }
}

fn pending_for(item: PendingSend) -> PendingCallback {
    item.into_callback()
}

fn operation_state_for(kind: SendKind) -> OperationState {
    match kind {
        SendKind::Query | SendKind::Execute => OperationState::ReceivingQuery,
        SendKind::Prepare => OperationState::ReceivingPrepare,
        SendKind::Unit => OperationState::ReceivingUnit,
        SendKind::FireAndForget => OperationState::Idle,
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::connector::testutil::{FakeServer, fake_server_opts, ok_packet, read_raw_packet, write_raw_packet};

    /// Build a `Pipeline` directly (below `Lifecycle`/`Client`) against a
    /// `FakeServer`, driving a test-owned `mio::Poll` until the handshake
    /// completes.
    fn connected_pipeline(port: u16) -> (Pipeline, mio::Poll, mio::Token) {
        let poll = mio::Poll::new().expect("create mio::Poll");
        let token = mio::Token(0);
        let registry = poll.registry().try_clone().expect("clone registry");
        let (connector, connect_poll) = Connector::connect_start(fake_server_opts(port)).expect("connect_start");
        let mut pipeline = Pipeline::new(connector, MioReactor::new(registry, token));
        pipeline.begin_connect(connect_poll).expect("begin_connect");
        drive(&mut pipeline, &poll, token, |p| p.state() == OperationState::Idle);
        (pipeline, poll, token)
    }

    fn drive(pipeline: &mut Pipeline, poll: &mio::Poll, token: mio::Token, done: impl Fn(&Pipeline) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut events = mio::Events::with_capacity(8);
        while !done(pipeline) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            assert!(!remaining.is_zero(), "pipeline test timed out");
            poll.poll(&mut events, Some(remaining)).expect("poll");
            for event in events.iter() {
                if event.token() == token {
                    for thunk in pipeline.notify(event.is_readable(), event.is_writable()).expect("notify") {
                        thunk();
                    }
                }
            }
        }
    }

    #[test]
    fn a_query_in_flight_blocks_exclusive_ops_until_the_response_arrives() {
        let server = FakeServer::bind();
        let port = server.port();
        // Never responds, so the "still in flight" assertions below can't
        // race against the fake server's reply arriving early.
        server.run(|stream| {
            let _query = read_raw_packet(stream);
        });

        let (mut pipeline, _poll, _token) = connected_pipeline(port);
        assert!(pipeline.exclusive_op_allowed());

        pipeline.enqueue(PendingSend::Query { sql: "SELECT 1".to_string(), callback: Box::new(|_| {}) }).unwrap();
        let ready = pipeline.pump().unwrap();
        assert!(ready.is_empty());
        assert!(!pipeline.exclusive_op_allowed());
        assert_eq!(pipeline.pending_count(), 1);
    }

    #[test]
    fn pipeline_returns_to_idle_once_the_response_is_delivered() {
        let server = FakeServer::bind();
        let port = server.port();
        server.run(|stream| {
            let _query = read_raw_packet(stream);
            write_raw_packet(stream, &ok_packet(0, 0, 0x0002, 0), 1);
        });

        let (mut pipeline, poll, token) = connected_pipeline(port);
        pipeline.enqueue(PendingSend::Query { sql: "SELECT 1".to_string(), callback: Box::new(|_| {}) }).unwrap();
        for thunk in pipeline.pump().unwrap() {
            thunk();
        }

        drive(&mut pipeline, &poll, token, |p| p.state() == OperationState::Idle);
        assert!(pipeline.exclusive_op_allowed());
        assert_eq!(pipeline.pending_count(), 0);
    }

    #[test]
    fn enqueue_rejects_once_the_queue_is_full() {
        let server = FakeServer::bind();
        let port = server.port();
        // Never responds; every query past the first sits queued, not sent.
        server.run(|stream| {
            let _query = read_raw_packet(stream);
        });

        let (mut pipeline, _poll, _token) = connected_pipeline(port);
        for i in 0..MAX_PIPELINE_DEPTH {
            pipeline.enqueue(PendingSend::Query { sql: format!("SELECT {i}"), callback: Box::new(|_| {}) }).unwrap();
        }
        let err =
            pipeline.enqueue(PendingSend::Query { sql: "SELECT overflow".to_string(), callback: Box::new(|_| {}) });
        assert!(matches!(err, Err(Error::PipelineBusy)));
    }

    #[test]
    fn cancel_all_clears_in_flight_and_queued_work() {
        let server = FakeServer::bind();
        let port = server.port();
        server.run(|stream| {
            let _query = read_raw_packet(stream);
        });

        let (mut pipeline, _poll, _token) = connected_pipeline(port);
        pipeline.enqueue(PendingSend::Query { sql: "SELECT 1".to_string(), callback: Box::new(|_| {}) }).unwrap();
        pipeline.pump().unwrap();
        pipeline.enqueue(PendingSend::Query { sql: "SELECT 2".to_string(), callback: Box::new(|_| {}) }).unwrap();

        pipeline.cancel_all(|| Error::Reset);
        assert_eq!(pipeline.pending_count(), 0);
        assert!(pipeline.exclusive_op_allowed());
        assert_eq!(pipeline.state(), OperationState::Idle);
    }
}
