//! Integration tests against the public `Client` API, driven over a real
//! loopback socket and a real `mio::Poll` via `connector::testutil`'s fake
//! server (exposed for integration tests by the `test-util` feature).

use std::cell::RefCell;
use std::rc::Rc;

use mariadb_core::connector::testutil::{
    FakeServer, TEST_TIMEOUT, TestClient, column_definition, fake_server_opts, ok_packet, prepare_ok_packet, read_raw_packet,
    text_row, write_raw_packet,
};
use mariadb_core::{Client, Error, StatementResult};

fn connected(port: u16) -> TestClient {
    let mut test_client = TestClient::connect(fake_server_opts(port)).expect("connect");
    test_client.drive_until(|client| client.is_connected(), TEST_TIMEOUT);
    test_client
}

#[test]
fn query_roundtrip_through_the_public_client_api() {
    let server = FakeServer::bind();
    let port = server.port();
    server.run(|stream| {
        let _query = read_raw_packet(stream);
        write_raw_packet(stream, &[1], 1);
        write_raw_packet(stream, &column_definition("greeting", 0xfd, 0), 2);
        write_raw_packet(stream, &text_row(&[Some("hello")]), 3);
        write_raw_packet(stream, &ok_packet(0, 0, 0x0002, 0), 4);
    });

    let mut test_client = connected(port);
    let result = Rc::new(RefCell::new(None));
    let captured = Rc::clone(&result);
    test_client.client.query("SELECT 'hello'", move |r| *captured.borrow_mut() = Some(r)).expect("query queued");
    test_client.drive_until(|_| result.borrow().is_some(), TEST_TIMEOUT);

    let statements = result.borrow_mut().take().unwrap().expect("query succeeded");
    let StatementResult::Rows(set) = &statements[0] else { panic!("expected a row result") };
    assert_eq!(set.rows, vec![vec![Some(b"hello".to_vec())]]);
}

#[test]
fn ping_reports_errors_through_the_public_client_api() {
    let server = FakeServer::bind();
    let port = server.port();
    server.run(|stream| {
        let _ping = read_raw_packet(stream);
        // Drop without responding.
    });

    let mut test_client = connected(port);
    let result: Rc<RefCell<Option<mariadb_core::Result<()>>>> = Rc::new(RefCell::new(None));
    let captured = Rc::clone(&result);
    test_client.client.ping(move |r| *captured.borrow_mut() = Some(r)).expect("ping queued");
    test_client.drive_until(|_| result.borrow().is_some(), TEST_TIMEOUT);

    assert!(matches!(result.borrow().as_ref().unwrap(), Err(Error::ConnectionLost(_))));
}

#[test]
fn finish_cancels_queued_work_without_reconnecting() {
    let server = FakeServer::bind();
    let port = server.port();
    server.run(|stream| {
        let _query = read_raw_packet(stream);
        write_raw_packet(stream, &ok_packet(0, 0, 0x0002, 0), 1);
    });

    let test_client = connected(port);
    let second_result: Rc<RefCell<Option<mariadb_core::Result<mariadb_core::QueryResult>>>> = Rc::new(RefCell::new(None));
    let captured = Rc::clone(&second_result);
    test_client.client.query("FIRST", |_| {}).expect("first query queued");
    test_client.client.query("SECOND", move |r| *captured.borrow_mut() = Some(r)).expect("second query queued");

    test_client.client.finish();
    assert!(matches!(second_result.borrow().as_ref().unwrap(), Err(Error::Finished)));
    assert!(!test_client.client.is_connected());
}

#[test]
fn escape_matches_the_documented_byte_substitutions() {
    assert_eq!(Client::escape("O'Brien\\n"), b"O\\'Brien\\\\n".to_vec());
    assert_eq!(Client::escape("a\0b"), b"a\\0b".to_vec());
}

#[test]
fn exclusive_operations_reject_overlapping_calls() {
    let server = FakeServer::bind();
    let port = server.port();
    server.run(|stream| {
        let _prepare = read_raw_packet(stream);
        write_raw_packet(stream, &prepare_ok_packet(1, 0, 0, 0), 1);
    });

    let test_client = connected(port);
    test_client.client.prepare("SELECT 1", |_| {}).expect("first prepare queued");
    let err = test_client.client.prepare("SELECT 2", |_| {}).unwrap_err();
    assert!(matches!(err, Error::OperationInProgress));
}
