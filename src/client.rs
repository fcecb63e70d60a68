//! Public entry point. `Client` is a thin, cheaply-`Clone`-able handle around
//! a [`Lifecycle`] plus the bookkeeping for the "reflects the last server
//! response" accessors (`error_message`, `insert_id`, ...). Every method that
//! touches the pipeline follows the same shape: take a short borrow, drive
//! the lifecycle/pipeline, capture whatever [`ReadyCallback`] thunks came
//! back, drop the borrow, then run the thunks — see [`Client::run`]. That
//! last step is where a callback is actually allowed to call back into this
//! `Client`, since by then nothing of ours is borrowed.

use std::cell::RefCell;
use std::rc::Rc;

use mio::{Registry, Token};

use crate::error::{Error, Result};
use crate::handle::StmtHandle;
use crate::lifecycle::{ConnectCallback, ErrorCallback, Lifecycle};
use crate::opts::Opts;
use crate::queues::{PendingSend, PrepareCallback, QueryCallback, ReadyCallback, UnitCallback};
use crate::row::{PreparedInfo, QueryResult};
use crate::wire::response::ErrPayload;

/// Mirrors the last server response the way `libmysqlclient`'s synchronous
/// accessors do, even though every operation here is asynchronous. Updated
/// from the wrapper each raw callback is given, right before the caller's
/// own callback runs.
#[derive(Debug, Default, Clone)]
struct LastState {
    error_message: Option<String>,
    error_number: u16,
    sqlstate: String,
    insert_id: u64,
    warning_count: u16,
    info: String,
}

impl LastState {
    fn record_ok(&mut self) {
        self.error_message = None;
        self.error_number = 0;
        self.sqlstate = "00000".to_string();
    }

    fn record_err(&mut self, err: &Error) {
        self.error_message = Some(err.to_string());
        match err {
            Error::ServerError(ErrPayload { error_code, sql_state, .. }) => {
                self.error_number = *error_code;
                self.sqlstate = sql_state.clone();
            }
            _ => {
                self.error_number = 0;
                self.sqlstate = "HY000".to_string();
            }
        }
    }

    fn record_query(&mut self, result: &Result<QueryResult>) {
        match result {
            Ok(statements) => {
                self.record_ok();
                if let Some(crate::row::StatementResult::Ok { affected_rows: _, last_insert_id, warnings, info }) =
                    statements.last()
                {
                    self.insert_id = *last_insert_id;
                    self.warning_count = *warnings;
                    self.info = info.clone();
                }
            }
            Err(err) => self.record_err(err),
        }
    }

    fn record_prepare(&mut self, result: &Result<PreparedInfo>) {
        match result {
            Ok(_) => self.record_ok(),
            Err(err) => self.record_err(err),
        }
    }

    fn record_unit(&mut self, result: &Result<()>) {
        match result {
            Ok(()) => self.record_ok(),
            Err(err) => self.record_err(err),
        }
    }
}

struct ClientInner {
    lifecycle: Lifecycle,
    last_state: LastState,
}

#[derive(Clone)]
pub struct Client {
    inner: Rc<RefCell<ClientInner>>,
}

impl Client {
    /// Open a connection and register its socket on `registry` under `token`.
    /// The caller owns the actual event loop; this only ever registers and
    /// reregisters its own watcher on it, never polls directly.
    pub fn connect(opts: Opts, registry: Registry, token: Token) -> Result<Self> {
        let lifecycle = Lifecycle::connect(opts, registry, token)?;
        Ok(Self { inner: Rc::new(RefCell::new(ClientInner { lifecycle, last_state: LastState::default() })) })
    }

    pub fn set_on_connect(&self, cb: Option<ConnectCallback>) {
        self.inner.borrow_mut().lifecycle.set_on_connect(cb);
    }

    pub fn set_on_error(&self, cb: Option<ErrorCallback>) {
        self.inner.borrow_mut().lifecycle.set_on_error(cb);
    }

    pub fn socket_token(&self) -> Token {
        self.inner.borrow().lifecycle.socket_token()
    }

    /// Drive the pipeline with a readiness event observed on
    /// [`Client::socket_token`]. Call this from the integrator's event loop.
    pub fn notify(&self, readable: bool, writable: bool) {
        let ready = match self.inner.borrow_mut().lifecycle.notify(readable, writable) {
            Ok(ready) => ready,
            Err(err) => {
                tracing::error!(?err, "notify failed outside the connection-error path");
                return;
            }
        };
        run_ready(ready);
    }

    pub fn reset(&self) -> Result<()> {
        let ready = self.inner.borrow_mut().lifecycle.reset()?;
        run_ready(ready);
        Ok(())
    }

    pub fn finish(&self) {
        let ready = self.inner.borrow_mut().lifecycle.finish();
        run_ready(ready);
    }

    pub fn skip_pending(&self) {
        let ready = self.inner.borrow_mut().lifecycle.skip_pending();
        run_ready(ready);
    }

    pub fn is_connected(&self) -> bool {
        self.inner.borrow().lifecycle.is_connected()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.borrow().lifecycle.pipeline().map(|p| p.pending_count()).unwrap_or(0)
    }

    pub fn error_message(&self) -> Option<String> {
        self.inner.borrow().last_state.error_message.clone()
    }

    pub fn error_number(&self) -> u16 {
        self.inner.borrow().last_state.error_number
    }

    pub fn sqlstate(&self) -> String {
        self.inner.borrow().last_state.sqlstate.clone()
    }

    pub fn insert_id(&self) -> u64 {
        self.inner.borrow().last_state.insert_id
    }

    pub fn warning_count(&self) -> u16 {
        self.inner.borrow().last_state.warning_count
    }

    pub fn info(&self) -> String {
        self.inner.borrow().last_state.info.clone()
    }

    pub fn server_version(&self) -> Option<String> {
        self.inner.borrow().lifecycle.pipeline().and_then(|p| p.connector().server_version()).map(str::to_string)
    }

    /// Same string `server_version` reports; `libmysqlclient` distinguishes
    /// the two only for historical reasons this core doesn't carry forward.
    pub fn server_info(&self) -> Option<String> {
        self.server_version()
    }

    pub fn thread_id(&self) -> Option<u32> {
        self.inner.borrow().lifecycle.pipeline().and_then(|p| p.connector().thread_id())
    }

    pub fn host_info(&self) -> String {
        let inner = self.inner.borrow();
        let opts = inner.lifecycle.opts();
        match &opts.socket {
            Some(path) => format!("{path} via UNIX socket"),
            None => format!("{} via TCP/IP", opts.host.as_deref().unwrap_or("localhost")),
        }
    }

    pub fn character_set_name(&self) -> String {
        self.inner.borrow().lifecycle.opts().charset.clone()
    }

    #[cfg(unix)]
    pub fn socket(&self) -> Option<std::os::fd::RawFd> {
        self.inner.borrow().lifecycle.pipeline().map(|p| p.connector().raw_fd())
    }

    pub fn query(&self, sql: impl Into<String>, callback: impl FnOnce(Result<QueryResult>) + 'static) -> Result<()> {
        let sql = sql.into();
        let callback = self.wrap_query(callback);
        self.run(|pipeline| {
            pipeline.enqueue(PendingSend::Query { sql, callback })?;
            pipeline.pump()
        })
    }

    pub fn prepare(&self, sql: impl Into<String>, callback: impl FnOnce(Result<PreparedInfo>) + 'static) -> Result<()> {
        let sql = sql.into();
        let callback = self.wrap_prepare(callback);
        self.run_exclusive(|pipeline| {
            pipeline.enqueue(PendingSend::Prepare { sql, callback })?;
            pipeline.pump()
        })
    }

    pub fn execute(
        &self,
        handle: StmtHandle,
        params: Vec<Option<Vec<u8>>>,
        callback: impl FnOnce(Result<QueryResult>) + 'static,
    ) -> Result<()> {
        let callback = self.wrap_query(callback);
        self.run_exclusive(|pipeline| {
            pipeline.enqueue(PendingSend::Execute { handle, params, callback })?;
            pipeline.pump()
        })
    }

    pub fn close_stmt(&self, handle: StmtHandle, callback: impl FnOnce(Result<()>) + 'static) -> Result<()> {
        let callback = self.wrap_unit(callback);
        self.run_exclusive(|pipeline| {
            pipeline.enqueue(PendingSend::CloseStmt { handle, callback })?;
            pipeline.forget_statement(handle);
            pipeline.pump()
        })
    }

    pub fn stmt_reset(&self, handle: StmtHandle, callback: impl FnOnce(Result<()>) + 'static) -> Result<()> {
        let callback = self.wrap_unit(callback);
        self.run_exclusive(|pipeline| {
            pipeline.enqueue(PendingSend::StmtReset { handle, callback })?;
            pipeline.pump()
        })
    }

    pub fn ping(&self, callback: impl FnOnce(Result<()>) + 'static) -> Result<()> {
        let callback = self.wrap_unit(callback);
        self.run_exclusive(|pipeline| {
            pipeline.enqueue(PendingSend::Ping { callback })?;
            pipeline.pump()
        })
    }

    pub fn select_db(&self, db: impl Into<String>, callback: impl FnOnce(Result<()>) + 'static) -> Result<()> {
        let db = db.into();
        let callback = self.wrap_unit(callback);
        self.run_exclusive(|pipeline| {
            pipeline.enqueue(PendingSend::SelectDb { db, callback })?;
            pipeline.pump()
        })
    }

    pub fn change_user(
        &self,
        user: impl Into<String>,
        password: impl Into<String>,
        db: Option<String>,
        callback: impl FnOnce(Result<()>) + 'static,
    ) -> Result<()> {
        let user = user.into();
        let password = password.into();
        let callback = self.wrap_unit(callback);
        self.run_exclusive(|pipeline| {
            pipeline.enqueue(PendingSend::ChangeUser { user, password, db, callback })?;
            pipeline.pump()
        })
    }

    pub fn reset_connection(&self, callback: impl FnOnce(Result<()>) + 'static) -> Result<()> {
        let callback = self.wrap_unit(callback);
        self.run_exclusive(|pipeline| {
            pipeline.enqueue(PendingSend::ResetConnection { callback })?;
            pipeline.pump()
        })
    }

    /// Charset-safe SQL string escaping for the subset of bytes that matter
    /// with `NO_BACKSLASH_ESCAPES` off (the default): NUL, newline, carriage
    /// return, backslash, the two quote characters, and Ctrl-Z.
    pub fn escape(input: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(input.len());
        for &byte in input.as_bytes() {
            match byte {
                0 => out.extend_from_slice(b"\\0"),
                b'\n' => out.extend_from_slice(b"\\n"),
                b'\r' => out.extend_from_slice(b"\\r"),
                b'\\' => out.extend_from_slice(b"\\\\"),
                b'\'' => out.extend_from_slice(b"\\'"),
                b'"' => out.extend_from_slice(b"\\\""),
                0x1a => out.extend_from_slice(b"\\Z"),
                other => out.push(other),
            }
        }
        out
    }

    fn wrap_query(&self, callback: impl FnOnce(Result<QueryResult>) + 'static) -> QueryCallback {
        let inner = Rc::clone(&self.inner);
        Box::new(move |result: Result<QueryResult>| {
            inner.borrow_mut().last_state.record_query(&result);
            callback(result);
        })
    }

    fn wrap_prepare(&self, callback: impl FnOnce(Result<PreparedInfo>) + 'static) -> PrepareCallback {
        let inner = Rc::clone(&self.inner);
        Box::new(move |result: Result<PreparedInfo>| {
            inner.borrow_mut().last_state.record_prepare(&result);
            callback(result);
        })
    }

    fn wrap_unit(&self, callback: impl FnOnce(Result<()>) + 'static) -> UnitCallback {
        let inner = Rc::clone(&self.inner);
        Box::new(move |result: Result<()>| {
            inner.borrow_mut().last_state.record_unit(&result);
            callback(result);
        })
    }

    /// Borrow, run `f` against the connected pipeline, release the borrow,
    /// then run whatever callbacks `f` completed synchronously.
    fn run(&self, f: impl FnOnce(&mut crate::pipeline::Pipeline) -> Result<Vec<ReadyCallback>>) -> Result<()> {
        let ready = {
            let mut inner = self.inner.borrow_mut();
            let pipeline = inner.lifecycle.pipeline_mut()?;
            f(pipeline)?
        };
        run_ready(ready);
        Ok(())
    }

    /// Same as [`Client::run`], but first rejects `f` with
    /// [`Error::OperationInProgress`] if a statement-scope or exclusive
    /// utility operation is already queued or in flight.
    fn run_exclusive(&self, f: impl FnOnce(&mut crate::pipeline::Pipeline) -> Result<Vec<ReadyCallback>>) -> Result<()> {
        let ready = {
            let mut inner = self.inner.borrow_mut();
            let pipeline = inner.lifecycle.pipeline_mut()?;
            if !pipeline.exclusive_op_allowed() {
                return Err(Error::OperationInProgress);
            }
            f(pipeline)?
        };
        run_ready(ready);
        Ok(())
    }
}

fn run_ready(ready: Vec<ReadyCallback>) {
    for thunk in ready {
        thunk();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    use super::*;
    use crate::connector::testutil::{
        FakeServer, TEST_TIMEOUT, TestClient, binary_row, column_definition, err_packet, fake_server_opts, ok_packet,
        prepare_ok_packet, read_raw_packet, text_row, write_raw_packet,
    };
    use crate::row::StatementResult;

    fn connected(opts_port: u16) -> TestClient {
        let mut test_client = TestClient::connect(fake_server_opts(opts_port)).expect("connect");
        test_client.drive_until(|client| client.is_connected(), TEST_TIMEOUT);
        test_client
    }

    #[test]
    fn query_delivers_single_row_result() {
        let server = FakeServer::bind();
        let port = server.port();
        server.run(|stream| {
            let _query = read_raw_packet(stream);
            write_raw_packet(stream, &[1], 1);
            write_raw_packet(stream, &column_definition("n", 0x03, 0), 2);
            write_raw_packet(stream, &text_row(&[Some("42")]), 3);
            write_raw_packet(stream, &ok_packet(0, 0, 0x0002, 0), 4);
        });

        let test_client = connected(port);
        let result: Rc<RefCell<Option<Result<QueryResult>>>> = Rc::new(RefCell::new(None));
        let captured = Rc::clone(&result);
        test_client.client.query("SELECT 1", move |r| *captured.borrow_mut() = Some(r)).expect("query queued");
        let mut test_client = test_client;
        test_client.drive_until(|_| result.borrow().is_some(), TEST_TIMEOUT);

        let statements = result.borrow_mut().take().unwrap().expect("query succeeded");
        let StatementResult::Rows(set) = &statements[0] else { panic!("expected a row result") };
        assert_eq!(set.rows, vec![vec![Some(b"42".to_vec())]]);
    }

    #[test]
    fn ordered_delivery_across_sequential_queries() {
        let server = FakeServer::bind();
        let port = server.port();
        server.run(|stream| {
            for i in 0..100u64 {
                let _query = read_raw_packet(stream);
                write_raw_packet(stream, &ok_packet(i, 0, 0x0002, 0), 1);
            }
        });

        let mut test_client = connected(port);
        let order: Rc<RefCell<Vec<u64>>> = Rc::new(RefCell::new(Vec::new()));
        for i in 0..100u64 {
            let order = Rc::clone(&order);
            test_client
                .client
                .query(format!("SELECT {i}"), move |r| {
                    let statements = r.expect("query succeeded");
                    let StatementResult::Ok { affected_rows, .. } = statements[0] else { panic!("expected OK") };
                    order.borrow_mut().push(affected_rows);
                })
                .expect("query queued");
        }
        test_client.drive_until(|c| c.pending_count() == 0, Duration::from_secs(10));

        assert_eq!(*order.borrow(), (0..100u64).collect::<Vec<_>>());
    }

    #[test]
    fn skip_pending_called_from_within_a_callback_cancels_the_rest() {
        let server = FakeServer::bind();
        let port = server.port();
        server.run(|stream| {
            let _query = read_raw_packet(stream);
            write_raw_packet(stream, &ok_packet(0, 0, 0x0002, 0), 1);
        });

        let mut test_client = connected(port);
        let second_result: Rc<RefCell<Option<Result<QueryResult>>>> = Rc::new(RefCell::new(None));
        let captured = Rc::clone(&second_result);
        let client_for_callback = test_client.client.clone();
        test_client
            .client
            .query("FIRST", move |_first| {
                client_for_callback.skip_pending();
            })
            .expect("first query queued");
        test_client
            .client
            .query("SECOND", move |r| *captured.borrow_mut() = Some(r))
            .expect("second query queued");

        test_client.drive_until(|_| second_result.borrow().is_some(), TEST_TIMEOUT);
        assert!(matches!(second_result.borrow().as_ref().unwrap(), Err(Error::Skipped)));
        assert_eq!(test_client.client.pending_count(), 0);
    }

    #[test]
    fn server_error_is_delivered_only_to_the_owning_callback() {
        let server = FakeServer::bind();
        let port = server.port();
        server.run(|stream| {
            let _query = read_raw_packet(stream);
            write_raw_packet(stream, &err_packet(1146, "42S02", "Table doesn't exist"), 1);
        });

        let mut test_client = connected(port);
        let result: Rc<RefCell<Option<Result<QueryResult>>>> = Rc::new(RefCell::new(None));
        let captured = Rc::clone(&result);
        test_client.client.query("SELECT * FROM missing", move |r| *captured.borrow_mut() = Some(r)).expect("queued");
        test_client.drive_until(|_| result.borrow().is_some(), TEST_TIMEOUT);

        assert!(matches!(result.borrow().as_ref().unwrap(), Err(Error::ServerError(_))));
        assert!(test_client.client.is_connected());
        assert_eq!(test_client.client.error_number(), 1146);
    }

    #[test]
    fn connection_drop_mid_query_fires_on_error_and_cancels_the_callback() {
        let server = FakeServer::bind();
        let port = server.port();
        server.run(|stream| {
            let _query = read_raw_packet(stream);
            // Drop the connection instead of responding.
        });

        let mut test_client = connected(port);
        let on_error_fired = Rc::new(RefCell::new(false));
        let flag = Rc::clone(&on_error_fired);
        test_client.client.set_on_error(Some(Box::new(move |_err| *flag.borrow_mut() = true)));

        let query_result: Rc<RefCell<Option<Result<QueryResult>>>> = Rc::new(RefCell::new(None));
        let captured = Rc::clone(&query_result);
        test_client.client.query("SELECT 1", move |r| *captured.borrow_mut() = Some(r)).expect("queued");
        test_client.drive_until(|_| query_result.borrow().is_some(), TEST_TIMEOUT);

        assert!(*on_error_fired.borrow());
        assert!(matches!(query_result.borrow().as_ref().unwrap(), Err(Error::ConnectionLost(_))));
    }

    #[test]
    fn prepare_execute_close_roundtrip_with_null_param() {
        let server = FakeServer::bind();
        let port = server.port();
        server.run(|stream| {
            let _prepare = read_raw_packet(stream);
            write_raw_packet(stream, &prepare_ok_packet(7, 1, 1, 0), 1);
            write_raw_packet(stream, b"ignored-param-def", 2);
            write_raw_packet(stream, &column_definition("value", 0xfc, 0), 3);

            let _execute = read_raw_packet(stream);
            write_raw_packet(stream, &[1], 1);
            write_raw_packet(stream, &column_definition("value", 0xfc, 0), 2);
            write_raw_packet(stream, &binary_row(&[None]), 3);
            write_raw_packet(stream, &ok_packet(0, 0, 0x0002, 0), 4);
        });

        let mut test_client = connected(port);
        let prepared: Rc<RefCell<Option<PreparedInfo>>> = Rc::new(RefCell::new(None));
        let captured = Rc::clone(&prepared);
        test_client
            .client
            .prepare("SELECT ? AS value", move |r| *captured.borrow_mut() = Some(r.expect("prepare succeeded")))
            .expect("prepare queued");
        test_client.drive_until(|_| prepared.borrow().is_some(), TEST_TIMEOUT);
        let info = prepared.borrow_mut().take().unwrap();
        assert_eq!(info.param_count, 1);

        let executed: Rc<RefCell<Option<Result<QueryResult>>>> = Rc::new(RefCell::new(None));
        let captured = Rc::clone(&executed);
        test_client
            .client
            .execute(info.handle, vec![None], move |r| *captured.borrow_mut() = Some(r))
            .expect("execute queued");
        test_client.drive_until(|_| executed.borrow().is_some(), TEST_TIMEOUT);
        let statements = executed.borrow_mut().take().unwrap().expect("execute succeeded");
        let StatementResult::Rows(set) = &statements[0] else { panic!("expected a row result") };
        assert_eq!(set.rows, vec![vec![None]]);

        test_client.client.close_stmt(info.handle, |r| assert!(r.is_ok())).expect("close_stmt queued");
    }
}
