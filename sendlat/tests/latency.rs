//! End-to-end latency runs between two sessions on the in-process fabric.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;

use sendlat::bench::{Run, Session, SignalPolicy};
use sendlat::config::{BenchConfig, MAX_INLINE};
use sendlat::cq::WaitMode;
use sendlat::exchange::{ConnectionParameters, OobListener, OobStream, RECORD_LEN};
use sendlat::fabric::soft::SoftFabric;
use sendlat::fabric::{QpType, WcStatus};
use sendlat::qp::QpState;
use sendlat::{Error, Result};

fn config(size: usize, iters: usize, tx_depth: u32) -> BenchConfig {
    BenchConfig {
        size,
        iters,
        tx_depth,
        ..BenchConfig::default()
    }
}

fn run_sizes(session: &mut Session<SoftFabric>) -> Result<Vec<Run>> {
    let sizes = session.config().sizes();
    sizes.into_iter().map(|size| session.run_size(size)).collect()
}

fn server_side(fabric: SoftFabric, cfg: BenchConfig, listener: OobListener) -> Result<Vec<Run>> {
    let mut session = Session::prepare(&fabric, cfg)?;
    session.connect(listener.accept()?)?;
    run_sizes(&mut session)
}

fn client_side(fabric: &SoftFabric, cfg: BenchConfig, port: u16) -> Result<Vec<Run>> {
    let cfg = BenchConfig {
        host: Some("127.0.0.1".into()),
        ..cfg
    };
    let mut session = Session::prepare(fabric, cfg)?;
    session.connect(OobStream::connect("127.0.0.1", port)?)?;
    run_sizes(&mut session)
}

/// Runs both ends with `cfg` and returns (server runs, client runs).
fn run_pair(fabric: &SoftFabric, cfg: BenchConfig) -> (Vec<Run>, Vec<Run>) {
    let listener = OobListener::bind(0).unwrap();
    let port = listener.port();
    let server = {
        let fabric = fabric.clone();
        let cfg = cfg.clone();
        thread::spawn(move || server_side(fabric, cfg, listener))
    };
    let client = client_side(fabric, cfg, port).unwrap();
    let server = server.join().unwrap().unwrap();
    (server, client)
}

fn assert_sane(run: &Run, iters: usize) {
    assert_eq!(run.sends, iters);
    assert_eq!(run.recvs, iters);
    assert_eq!(run.stamps.len(), iters);
    let report = run.report().unwrap();
    assert_eq!(report.len(), iters - 1);
    let s = report.summary();
    assert!(s.min as f64 <= s.median && s.median <= s.max as f64, "{s:?}");
}

#[test]
fn rc_ping_pong_busy_poll() {
    let fabric = SoftFabric::new();
    let (server, client) = run_pair(&fabric, config(2, 100, 50));
    assert_eq!((server.len(), client.len()), (1, 1));
    assert_sane(&server[0], 100);
    assert_sane(&client[0], 100);
    // one signal per depth - 2 sends, plus the last one
    let expected = SignalPolicy::new(50, false, 100).unwrap().signaled_count();
    assert_eq!(expected, 3);
    assert_eq!(server[0].signaled, expected);
    assert_eq!(client[0].signaled, expected);
    assert!(fabric.counters().balanced());
}

#[test]
fn largest_inline_message_with_selective_signaling() {
    let fabric = SoftFabric::new();
    let cfg = config(MAX_INLINE as usize, 60, 10);
    assert!(cfg.inline(cfg.size));
    let (server, client) = run_pair(&fabric, cfg);
    let expected = SignalPolicy::new(10, false, 60).unwrap().signaled_count();
    // at least one signal per window of depth - 2 sends
    assert!(expected >= (60 + 7) / 8);
    for run in server.iter().chain(&client) {
        assert_sane(run, 60);
        assert_eq!(run.signaled, expected);
    }
    assert!(fabric.counters().balanced());
}

#[test]
fn inline_sends_signaled_every_time() {
    let fabric = SoftFabric::new();
    let cfg = BenchConfig {
        signal_every: true,
        ..config(2, 100, 50)
    };
    let (server, client) = run_pair(&fabric, cfg);
    for run in server.iter().chain(&client) {
        assert_eq!(run.signaled, run.sends);
        assert_sane(run, 100);
    }
}

#[test]
fn uc_with_completion_events() {
    let fabric = SoftFabric::new();
    let cfg = BenchConfig {
        qp_type: QpType::Uc,
        wait: WaitMode::Events,
        ..config(64, 50, 10)
    };
    let (server, client) = run_pair(&fabric, cfg);
    assert_sane(&server[0], 50);
    assert_sane(&client[0], 50);
    assert!(fabric.counters().balanced());
}

#[test]
fn ud_sweeps_every_size_up_to_the_clamp() {
    let fabric = SoftFabric::new();
    let cfg = BenchConfig {
        qp_type: QpType::Ud,
        all: true,
        ..config(2, 20, 16)
    };
    let (server, client) = run_pair(&fabric, cfg);
    let sizes: Vec<_> = client.iter().map(|r| r.size).collect();
    assert_eq!(sizes.first(), Some(&2));
    assert_eq!(sizes.last(), Some(&2048));
    assert_eq!(server.len(), client.len());
    for run in server.iter().chain(&client) {
        assert_sane(run, 20);
    }
}

#[test]
fn ud_multicast() {
    let fabric = SoftFabric::new();
    let cfg = BenchConfig {
        qp_type: QpType::Ud,
        mcg: true,
        ..config(32, 40, 16)
    };
    let (server, client) = run_pair(&fabric, cfg);
    assert_sane(&server[0], 40);
    assert_sane(&client[0], 40);
    assert!(fabric.counters().balanced());
}

#[test]
fn send_to_a_vanished_peer_fails_the_run() {
    let fabric = SoftFabric::new();
    let cfg = BenchConfig {
        signal_every: true,
        ..config(2, 10, 8)
    };
    let listener = OobListener::bind(0).unwrap();
    let port = listener.port();
    let (gone_tx, gone_rx) = crossbeam::channel::bounded(1);
    let server = {
        let fabric = fabric.clone();
        let cfg = cfg.clone();
        thread::spawn(move || -> Result<()> {
            let mut session = Session::prepare(&fabric, cfg)?;
            session.connect(listener.accept()?)?;
            drop(session);
            gone_tx.send(()).unwrap();
            Ok(())
        })
    };

    let mut session = Session::prepare(
        &fabric,
        BenchConfig {
            host: Some("127.0.0.1".into()),
            ..cfg
        },
    )
    .unwrap();
    session
        .connect(OobStream::connect("127.0.0.1", port).unwrap())
        .unwrap();
    server.join().unwrap().unwrap();
    gone_rx.recv().unwrap();

    let err = session.run_size(2).unwrap_err();
    match &err {
        Error::Completion { side, status, .. } => {
            assert_eq!(*side, "client");
            assert_eq!(*status, WcStatus::RetryExceeded);
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(err.exit_code(), 13);
}

#[test]
fn ud_size_beyond_the_prepared_buffer_is_rejected() {
    let fabric = SoftFabric::new();
    let cfg = BenchConfig {
        qp_type: QpType::Ud,
        ..config(2, 10, 8)
    };
    let listener = OobListener::bind(0).unwrap();
    let port = listener.port();
    let server = {
        let fabric = fabric.clone();
        let cfg = cfg.clone();
        thread::spawn(move || -> Result<()> {
            let mut session = Session::prepare(&fabric, cfg)?;
            session.connect(listener.accept()?)
        })
    };
    let mut session = Session::prepare(
        &fabric,
        BenchConfig {
            host: Some("127.0.0.1".into()),
            ..cfg
        },
    )
    .unwrap();
    session
        .connect(OobStream::connect("127.0.0.1", port).unwrap())
        .unwrap();
    server.join().unwrap().unwrap();

    // the receive area has room for the GRH as well, the payload does not
    for size in [0, 3, 42] {
        let err = session.run_size(size).unwrap_err();
        assert!(matches!(err, Error::Config(_)), "size {size}: {err}");
    }
    assert_eq!(session.qp_state(), QpState::Rts);
}

#[test]
fn mismatched_second_round_leaves_no_queue_pair_ready() {
    let fabric = SoftFabric::new();
    let listener = OobListener::bind(0).unwrap();
    let port = listener.port();
    let peer = thread::spawn(move || {
        let mut first = ConnectionParameters {
            lid: 1,
            qpn: 0x99,
            psn: 0x10,
            ..ConnectionParameters::default()
        };
        let mut s = TcpStream::connect(("127.0.0.1", port)).unwrap();
        s.write_all(first.encode().as_bytes()).unwrap();
        let mut reply = [0u8; RECORD_LEN];
        s.read_exact(&mut reply).unwrap();
        first.qpn = 0x98;
        s.write_all(first.encode().as_bytes()).unwrap();
        let _ = s.read_exact(&mut reply);
    });

    let mut session = Session::prepare(&fabric, config(2, 10, 8)).unwrap();
    let err = session.connect(listener.accept().unwrap()).unwrap_err();
    peer.join().unwrap();
    assert!(matches!(err, Error::HandshakeFailed { .. }), "{err}");
    assert_eq!(session.qp_state(), QpState::Error);
    assert!(session.remote().is_none());
    assert!(matches!(
        session.run_size(2),
        Err(Error::StateViolation { .. })
    ));
    drop(session);
    assert!(fabric.counters().balanced());
}
