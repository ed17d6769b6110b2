//! Connection-layer scenarios: server and client on one I/O service over a
//! real UNIX socket, single thread, no blocking calls.

use drvsh::io_service::IoService;
use drvsh::socket::{Client, Server};
use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::Rc;

fn pump_until(iosvc: &Rc<IoService>, cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        iosvc.poll_once(25).unwrap();
    }
    panic!("condition not reached while pumping the io service");
}

struct Harness {
    iosvc: Rc<IoService>,
    server: Server,
    client: Client,
    _dir: tempfile::TempDir,
}

/// Server that remembers accepted connections; client connected to it.
fn harness() -> (Harness, Rc<RefCell<Vec<RawFd>>>) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("echo.0.drv");

    let iosvc = Rc::new(IoService::new());
    let server = Server::bind(Rc::clone(&iosvc), &path).unwrap();

    let accepted = Rc::new(RefCell::new(Vec::new()));
    let accepted2 = Rc::clone(&accepted);
    server
        .listen(Box::new(move |_srv, conn| {
            accepted2.borrow_mut().push(conn);
            true
        }))
        .unwrap();

    let client = Client::new(Rc::clone(&iosvc));
    let connected = Rc::new(RefCell::new(false));
    let connected2 = Rc::clone(&connected);
    client
        .connect(&path, Box::new(move |_| *connected2.borrow_mut() = true))
        .unwrap();

    pump_until(&iosvc, || {
        *connected.borrow() && !accepted.borrow().is_empty()
    });

    (
        Harness {
            iosvc,
            server,
            client,
            _dir: dir,
        },
        accepted,
    )
}

#[test]
fn test_echo_roundtrip() {
    let (h, accepted) = harness();
    let conn = accepted.borrow()[0];

    // Server waits for 5 bytes, then echoes them back.
    let echoed = Rc::new(RefCell::new(false));
    let echoed2 = Rc::clone(&echoed);
    h.server
        .recv(
            conn,
            5,
            Box::new(move |srv, conn, completion| {
                assert!(completion.ok());
                let payload = srv.with_read_buf(conn, |b| b.to_vec()).unwrap();
                assert_eq!(payload, b"hello");
                let echoed3 = Rc::clone(&echoed2);
                srv.send(
                    conn,
                    &payload,
                    Box::new(move |_, _, completion| {
                        assert!(completion.ok());
                        *echoed3.borrow_mut() = true;
                    }),
                )
                .unwrap();
            }),
        )
        .unwrap();

    let sent = Rc::new(RefCell::new(false));
    let sent2 = Rc::clone(&sent);
    h.client
        .send(
            b"hello",
            Box::new(move |_, completion| {
                assert!(completion.ok());
                *sent2.borrow_mut() = true;
            }),
        )
        .unwrap();

    let received = Rc::new(RefCell::new(None));
    let received2 = Rc::clone(&received);
    h.client
        .recv(
            5,
            Box::new(move |cl, completion| {
                assert!(completion.ok());
                *received2.borrow_mut() = Some(cl.with_read_buf(|b| b.to_vec()));
            }),
        )
        .unwrap();

    pump_until(&h.iosvc, || received.borrow().is_some());
    assert!(*sent.borrow());
    assert!(*echoed.borrow());
    assert_eq!(received.borrow().as_deref(), Some(b"hello".as_slice()));
}

#[test]
fn test_overlapping_send_is_rejected() {
    let (h, _accepted) = harness();

    h.client.send(b"first", Box::new(|_, _| {})).unwrap();
    let second = h.client.send(b"second", Box::new(|_, _| {}));
    assert!(second.is_err(), "second in-flight send must be rejected");

    let third = h.client.recv(1, Box::new(|_, _| {}));
    assert!(third.is_ok());
    let fourth = h.client.recv(1, Box::new(|_, _| {}));
    assert!(fourth.is_err(), "second in-flight recv must be rejected");
}

#[test]
fn test_recv_completes_with_eof_when_peer_closes() {
    let (h, accepted) = harness();
    let conn = accepted.borrow()[0];

    let outcome = Rc::new(RefCell::new(None));
    let outcome2 = Rc::clone(&outcome);
    h.client
        .recv(
            4,
            Box::new(move |_, completion| {
                *outcome2.borrow_mut() = Some((completion.err, completion.eof));
            }),
        )
        .unwrap();

    h.server.close_connection(conn);

    pump_until(&h.iosvc, || outcome.borrow().is_some());
    let (err, eof) = outcome.borrow().unwrap();
    assert!(eof);
    assert!(err.is_none());
    assert!(h.client.eof());
}

#[test]
fn test_no_callback_after_close_connection() {
    let (h, accepted) = harness();
    let conn = accepted.borrow()[0];

    let fired = Rc::new(RefCell::new(false));
    let fired2 = Rc::clone(&fired);
    h.server
        .recv(
            conn,
            5,
            Box::new(move |_, _, _| *fired2.borrow_mut() = true),
        )
        .unwrap();

    h.server.close_connection(conn);
    assert_eq!(h.server.connection_count(), 0);

    // Bytes arriving for the closed connection must not resurrect it.
    h.client.send(b"hello", Box::new(|_, _| {})).unwrap();
    for _ in 0..20 {
        h.iosvc.poll_once(10).unwrap();
    }
    assert!(!*fired.borrow());
}

#[test]
fn test_client_deinit_removes_jobs() {
    let (h, _accepted) = harness();

    let fired = Rc::new(RefCell::new(false));
    let fired2 = Rc::clone(&fired);
    h.client
        .recv(1, Box::new(move |_, _| *fired2.borrow_mut() = true))
        .unwrap();

    h.client.deinit();

    for _ in 0..10 {
        h.iosvc.poll_once(10).unwrap();
    }
    assert!(!*fired.borrow());
    assert!(h.client.send(b"x", Box::new(|_, _| {})).is_err());
}

#[test]
fn test_acceptor_hook_can_reject_connection() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("picky.0.drv");

    let iosvc = Rc::new(IoService::new());
    let server = Server::bind(Rc::clone(&iosvc), &path).unwrap();
    let rejected = Rc::new(RefCell::new(0usize));
    let rejected2 = Rc::clone(&rejected);
    server
        .listen(Box::new(move |_srv, _conn| {
            *rejected2.borrow_mut() += 1;
            false
        }))
        .unwrap();

    let client = Client::new(Rc::clone(&iosvc));
    client.connect(&path, Box::new(|_| {})).unwrap();

    let eof = Rc::new(RefCell::new(false));
    let eof2 = Rc::clone(&eof);
    client
        .recv(1, Box::new(move |_, c| *eof2.borrow_mut() = c.eof))
        .unwrap();

    pump_until(&iosvc, || *eof.borrow());
    assert_eq!(*rejected.borrow(), 1);
    assert_eq!(server.connection_count(), 0);
}

#[test]
fn test_server_close_unlinks_socket() {
    let (h, _accepted) = harness();
    let path = h.server.local_path();
    assert!(path.exists());
    h.server.close();
    assert!(!path.exists());
}
