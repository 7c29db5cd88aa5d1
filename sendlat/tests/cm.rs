//! The connection-manager server and client on the in-process fabric.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver};

use sendlat::cm::{greeting, CmClient, CmServer, CompletionNotice};
use sendlat::fabric::CmEventKind;
use sendlat::fabric::soft::SoftFabric;
use sendlat::fabric::WcStatus;
use sendlat::{Error, Result};

const TIMEOUT: Duration = Duration::from_secs(5);

struct Running {
    port: u16,
    stop: Arc<AtomicBool>,
    notices: Receiver<CompletionNotice>,
    handle: JoinHandle<Result<()>>,
}

impl Running {
    fn stop(self) -> Result<()> {
        self.stop.store(true, Ordering::Relaxed);
        self.handle.join().unwrap()
    }
}

fn start(fabric: &SoftFabric, bind: &str) -> Running {
    let addr: SocketAddr = bind.parse().unwrap();
    let fabric = fabric.clone();
    let (tx, rx) = channel::bounded(1);
    let handle = thread::spawn(move || {
        let (mut server, notices) = CmServer::bind(&fabric, addr)?;
        tx.send((server.local_port(), server.stop_handle(), notices))
            .unwrap();
        server.run()
    });
    let (port, stop, notices) = rx.recv().unwrap();
    Running {
        port,
        stop,
        notices,
        handle,
    }
}

fn loopback(host: u8, port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, host], port))
}

#[test]
fn client_receives_the_greeting() {
    let fabric = SoftFabric::new();
    let server = start(&fabric, "127.0.0.1:0");

    let mut client = CmClient::connect(&fabric, loopback(1, server.port), TIMEOUT).unwrap();
    assert_eq!(client.recv_message(TIMEOUT).unwrap(), greeting());
    assert!(greeting().ends_with(&std::process::id().to_string()));

    let notice = server.notices.recv_timeout(TIMEOUT).unwrap();
    assert!(matches!(notice, CompletionNotice::SendCompleted { .. }), "{notice:?}");

    client.disconnect(TIMEOUT).unwrap();
    // the receive the server still had posted is flushed on disconnect
    let notice = server.notices.recv_timeout(TIMEOUT).unwrap();
    assert!(
        matches!(
            notice,
            CompletionNotice::CompletionError {
                status: WcStatus::WrFlush,
                ..
            }
        ),
        "{notice:?}"
    );

    server.stop().unwrap();
    drop(client);
    assert!(fabric.counters().balanced());
}

#[test]
fn client_message_reaches_the_server() {
    let fabric = SoftFabric::new();
    let server = start(&fabric, "0.0.0.0:0");

    let mut client = CmClient::connect(&fabric, loopback(1, server.port), TIMEOUT).unwrap();
    client.recv_message(TIMEOUT).unwrap();
    client.send_message("hello from the active side").unwrap();

    let received = server
        .notices
        .iter()
        .find_map(|n| match n {
            CompletionNotice::Received { message, .. } => Some(message),
            _ => None,
        })
        .unwrap();
    assert_eq!(received, "hello from the active side");

    client.disconnect(TIMEOUT).unwrap();
    server.stop().unwrap();
    drop(client);
    assert!(fabric.counters().balanced());
}

#[test]
fn request_on_a_second_device_is_fatal() {
    let fabric = SoftFabric::with_devices(&[("soft0", 1), ("soft1", 2)]);
    let server = start(&fabric, "0.0.0.0:0");

    let first = CmClient::connect(&fabric, loopback(1, server.port), TIMEOUT).unwrap();
    let second = CmClient::connect(&fabric, loopback(2, server.port), Duration::from_millis(500));
    assert!(matches!(second, Err(Error::HandshakeFailed { .. })));

    let err = server.handle.join().unwrap().unwrap_err();
    assert!(matches!(err, Error::MultiContext { .. }), "{err}");
    assert_eq!(err.exit_code(), 8);
    drop(first);
}

#[test]
fn connecting_to_nobody_is_rejected() {
    let fabric = SoftFabric::new();
    let err = CmClient::connect(&fabric, loopback(1, 1), Duration::from_millis(200))
        .err()
        .unwrap();
    assert!(matches!(err, Error::HandshakeFailed { .. }), "{err}");
    assert!(fabric.counters().balanced());
}

#[test]
fn server_shutdown_disconnects_its_clients() {
    let fabric = SoftFabric::new();
    let server = start(&fabric, "127.0.0.1:0");

    let mut client = CmClient::connect(&fabric, loopback(1, server.port), TIMEOUT).unwrap();
    assert_eq!(client.recv_message(TIMEOUT).unwrap(), greeting());

    server.stop().unwrap();
    client.wait_disconnected(TIMEOUT).unwrap();
    // already down, nothing left to do
    client.disconnect(TIMEOUT).unwrap();
    drop(client);
    assert!(fabric.counters().balanced());
}

#[test]
fn server_disconnects_one_connection() {
    let fabric = SoftFabric::new();
    let (tx, rx) = channel::bounded(1);
    let server = {
        let fabric = fabric.clone();
        thread::spawn(move || -> Result<Vec<CmEventKind>> {
            let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
            let (mut server, notices) = CmServer::bind(&fabric, addr)?;
            tx.send(server.local_port()).unwrap();
            let mut seen = Vec::new();
            let handle = loop {
                seen.extend(server.serve_one(Some(Duration::from_millis(50)))?);
                if let Ok(CompletionNotice::SendCompleted { handle }) = notices.try_recv() {
                    break handle;
                }
            };
            server.disconnect(handle)?;
            while server.connections() > 0 {
                seen.extend(server.serve_one(Some(TIMEOUT))?);
            }
            assert!(matches!(
                server.disconnect(handle),
                Err(Error::StateViolation { .. })
            ));
            Ok(seen)
        })
    };
    let port = rx.recv().unwrap();

    let mut client = CmClient::connect(&fabric, loopback(1, port), TIMEOUT).unwrap();
    assert_eq!(client.recv_message(TIMEOUT).unwrap(), greeting());
    client.wait_disconnected(TIMEOUT).unwrap();

    let seen = server.join().unwrap().unwrap();
    assert_eq!(
        seen,
        [
            CmEventKind::ConnectRequest,
            CmEventKind::Established,
            CmEventKind::Disconnected,
        ]
    );
    drop(client);
    assert!(fabric.counters().balanced());
}
