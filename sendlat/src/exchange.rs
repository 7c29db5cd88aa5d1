//! Out-of-band exchange of connection parameters over TCP.
//!
//! Before two queue pairs can talk, each side needs the other's LID, QPN, starting PSN, remote
//! key and buffer address (and GID, on RoCE). Those travel as a fixed-width ASCII record:
//!
//! ```text
//! LLLL:QQQQQQ:PPPPPP:RRRRRRRR:VVVVVVVVVVVVVVVV[:GG:GG:...:GG]
//! ```
//!
//! Every field is lower-case hex of exactly the width shown; the optional tail is the 16 GID
//! bytes. Records are 44 bytes without a GID and 92 bytes with one, and are read and written
//! whole.
//!
//! The client dials, the server accepts exactly one connection. In each round the client writes
//! and then reads while the server reads and then writes. There are two rounds, with the caller
//! bringing its queue pair up in between, and the client closes the exchange with the token
//! `done`.

use std::fmt::Write as _;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};

use socket2::{Domain, Socket, Type};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::fabric::Gid;

/// Length of a record without a GID.
pub const RECORD_LEN: usize = 44;
/// Length of a record with a GID.
pub const RECORD_LEN_GID: usize = 92;
/// Token the client sends after the last round.
pub const DONE: &[u8; 4] = b"done";

const WIDTHS: [usize; 5] = [4, 6, 6, 8, 16];

/// What one side tells the other about its queue pair.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ConnectionParameters {
    /// Local LID.
    pub lid: u16,
    /// QP number; 24 bits.
    pub qpn: u32,
    /// Starting packet sequence number; 24 bits.
    pub psn: u32,
    /// Remote key of the buffer.
    pub rkey: u32,
    /// Address the peer may target.
    pub vaddr: u64,
    /// GID, when GID routing is in use.
    pub gid: Option<Gid>,
}

impl ConnectionParameters {
    /// Length of the record for these parameters.
    pub fn record_len(with_gid: bool) -> usize {
        if with_gid {
            RECORD_LEN_GID
        } else {
            RECORD_LEN
        }
    }

    /// The wire record.
    pub fn encode(&self) -> String {
        let mut s = format!(
            "{:04x}:{:06x}:{:06x}:{:08x}:{:016x}",
            self.lid,
            self.qpn & 0xff_ffff,
            self.psn & 0xff_ffff,
            self.rkey,
            self.vaddr
        );
        if let Some(gid) = self.gid {
            for b in gid.raw() {
                let _ = write!(s, ":{b:02x}");
            }
        }
        s
    }

    /// Parses a wire record. Anything that is not exactly a record is an error.
    pub fn decode(record: &[u8]) -> Result<Self> {
        let bad = |reason: String| Error::HandshakeFailed {
            stage: "decode",
            reason,
        };
        if record.len() != RECORD_LEN && record.len() != RECORD_LEN_GID {
            return Err(bad(format!("record is {} bytes", record.len())));
        }
        let text = std::str::from_utf8(record).map_err(|e| bad(e.to_string()))?;
        let fields: Vec<&str> = text.split(':').collect();
        let with_gid = record.len() == RECORD_LEN_GID;
        let expected = if with_gid { WIDTHS.len() + 16 } else { WIDTHS.len() };
        if fields.len() != expected {
            return Err(bad(format!(
                "{} fields, expected {}",
                fields.len(),
                expected
            )));
        }
        let widths = WIDTHS.iter().copied().chain(std::iter::repeat(2));
        let mut values = Vec::with_capacity(fields.len());
        for (i, (field, width)) in fields.iter().zip(widths).enumerate() {
            if field.len() != width || !field.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(bad(format!("field {} is {:?}", i, field)));
            }
            let v = u64::from_str_radix(field, 16).map_err(|e| bad(e.to_string()))?;
            values.push(v);
        }
        let gid = if with_gid {
            let mut raw = [0u8; 16];
            for (b, v) in raw.iter_mut().zip(&values[WIDTHS.len()..]) {
                *b = *v as u8;
            }
            Some(Gid::from(raw))
        } else {
            None
        };
        Ok(ConnectionParameters {
            lid: values[0] as u16,
            qpn: values[1] as u32,
            psn: values[2] as u32,
            rkey: values[3] as u32,
            vaddr: values[4],
            gid,
        })
    }
}

/// Which end of the exchange this is.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Side {
    /// Dials; writes first.
    Client,
    /// Accepts; reads first.
    Server,
}

/// The server end before its one connection arrives.
pub struct OobListener {
    socket: Socket,
    local: SocketAddr,
}

impl OobListener {
    /// Listens on `port` on every local address, with address reuse.
    pub fn bind(port: u16) -> Result<Self> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let socket = Socket::new(Domain::IPV4, Type::STREAM, None).map_err(Error::handshake("socket"))?;
        socket
            .set_reuse_address(true)
            .map_err(Error::handshake("setsockopt"))?;
        socket
            .bind(&addr.into())
            .map_err(|e| Error::HandshakeFailed {
                stage: "bind",
                reason: format!("couldn't listen to port {port}: {e}"),
            })?;
        socket.listen(1).map_err(Error::handshake("listen"))?;
        let local = socket
            .local_addr()
            .map_err(Error::handshake("bind"))?
            .as_socket()
            .unwrap_or(addr);
        log::debug!("waiting for the peer on {}", local);
        Ok(OobListener { socket, local })
    }

    /// The bound port.
    pub fn port(&self) -> u16 {
        self.local.port()
    }

    /// Accepts one connection and stops listening.
    pub fn accept(self) -> Result<OobStream> {
        let (conn, peer) = self.socket.accept().map_err(Error::handshake("accept"))?;
        log::info!(
            "connection from {}",
            peer.as_socket()
                .map_or_else(|| "unknown peer".to_string(), |a| a.to_string())
        );
        Ok(OobStream {
            stream: TcpStream::from(conn),
        })
    }
}

/// An established out-of-band connection.
pub struct OobStream {
    stream: TcpStream,
}

impl OobStream {
    /// Dials `host:port`, trying every address it resolves to.
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let addrs = (host, port).to_socket_addrs().map_err(|e| Error::HandshakeFailed {
            stage: "resolve",
            reason: format!("{host}:{port}: {e}"),
        })?;
        let mut last = None;
        for addr in addrs {
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    log::debug!("connected to {}", addr);
                    return Ok(OobStream { stream });
                }
                Err(e) => {
                    log::debug!("couldn't connect to {}: {}", addr, e);
                    last = Some(e);
                }
            }
        }
        Err(Error::HandshakeFailed {
            stage: "connect",
            reason: match last {
                Some(e) => format!("couldn't connect to {host}:{port}: {e}"),
                None => format!("{host} resolved to no addresses"),
            },
        })
    }

    /// Dials `host` as the client, or listens on `port` and accepts one connection as the
    /// server.
    pub fn establish(host: Option<&str>, port: u16) -> Result<Self> {
        match host {
            Some(host) => Self::connect(host, port),
            None => OobListener::bind(port)?.accept(),
        }
    }

    fn write_record(&mut self, params: &ConnectionParameters) -> Result<()> {
        self.stream
            .write_all(params.encode().as_bytes())
            .map_err(Error::handshake("write"))
    }

    fn read_record(&mut self, with_gid: bool) -> Result<ConnectionParameters> {
        let mut buf = vec![0u8; ConnectionParameters::record_len(with_gid)];
        self.stream
            .read_exact(&mut buf)
            .map_err(Error::handshake("read"))?;
        ConnectionParameters::decode(&buf)
    }
}

/// Drives the two-round exchange on one [`OobStream`].
pub struct Handshake {
    stream: OobStream,
    side: Side,
    with_gid: bool,
}

impl Handshake {
    /// A handshake on `stream`. `with_gid` must be the same on both sides.
    pub fn new(stream: OobStream, side: Side, with_gid: bool) -> Self {
        Handshake {
            stream,
            side,
            with_gid,
        }
    }

    /// One round: sends `local` and returns what the peer sent.
    pub fn exchange(&mut self, local: &ConnectionParameters) -> Result<ConnectionParameters> {
        match self.side {
            Side::Client => {
                self.stream.write_record(local)?;
                self.stream.read_record(self.with_gid)
            }
            Side::Server => {
                let remote = self.stream.read_record(self.with_gid)?;
                self.stream.write_record(local)?;
                Ok(remote)
            }
        }
    }

    /// Runs both rounds and the closing token, calling `connect` with the peer's parameters
    /// between the rounds.
    ///
    /// The peer's second record must repeat its first.
    pub fn run<T>(
        mut self,
        local: &ConnectionParameters,
        connect: impl FnOnce(&ConnectionParameters) -> Result<T>,
    ) -> Result<(ConnectionParameters, T)> {
        let remote = self.exchange(local)?;
        let out = connect(&remote)?;
        let again = self.exchange(local)?;
        if again != remote {
            return Err(Error::HandshakeFailed {
                stage: "second round",
                reason: format!("peer sent {} after {}", again.encode(), remote.encode()),
            });
        }
        self.finish()?;
        Ok((remote, out))
    }

    fn finish(&mut self) -> Result<()> {
        match self.side {
            Side::Client => self
                .stream
                .stream
                .write_all(DONE)
                .map_err(Error::handshake("sync")),
            Side::Server => {
                let mut token = [0u8; 4];
                self.stream
                    .stream
                    .read_exact(&mut token)
                    .map_err(Error::handshake("sync"))?;
                if &token != DONE {
                    return Err(Error::HandshakeFailed {
                        stage: "sync",
                        reason: format!("unexpected token {:?}", String::from_utf8_lossy(&token)),
                    });
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn params(gid: bool) -> ConnectionParameters {
        ConnectionParameters {
            lid: 0x1a,
            qpn: 0xab_cdef,
            psn: 0x12_3456,
            rkey: 0xdead_beef,
            vaddr: 0x7f00_0000_1000,
            gid: gid.then(|| Gid::from([0xfe, 0x80, 0, 0, 0, 0, 0, 0, 2, 0, 0, 0, 0, 0, 1, 9])),
        }
    }

    #[test]
    fn record_has_fixed_width() {
        let s = params(false).encode();
        assert_eq!(s, "001a:abcdef:123456:deadbeef:00007f0000001000");
        assert_eq!(s.len(), RECORD_LEN);
        assert_eq!(params(true).encode().len(), RECORD_LEN_GID);
    }

    #[test]
    fn record_decodes_to_what_was_encoded() {
        for gid in [false, true] {
            let p = params(gid);
            assert_eq!(ConnectionParameters::decode(p.encode().as_bytes()).unwrap(), p);
        }
    }

    #[test]
    fn malformed_records_are_rejected() {
        let good = params(false).encode();
        let cases = [
            String::new(),
            good[..43].to_string(),
            good.replace(':', ";"),
            good.replacen("001a", "001g", 1),
            // right length, wrong field widths
            "01a:0abcdef:123456:deadbeef:00007f0000001000".to_string(),
            format!("{good}\0"),
        ];
        for case in cases {
            let err = ConnectionParameters::decode(case.as_bytes()).err().unwrap();
            assert!(
                matches!(err, Error::HandshakeFailed { stage: "decode", .. }),
                "{case:?} gave {err}"
            );
        }
    }

    #[test]
    fn two_rounds_and_done_over_loopback() {
        let listener = OobListener::bind(0).unwrap();
        let port = listener.port();
        let server = thread::spawn(move || {
            let hs = Handshake::new(listener.accept().unwrap(), Side::Server, true);
            hs.run(&params(true), |remote| Ok(remote.qpn)).unwrap()
        });
        let mut client_params = params(true);
        client_params.qpn = 0x42;
        let hs = Handshake::new(OobStream::connect("127.0.0.1", port).unwrap(), Side::Client, true);
        let (remote, ()) = hs.run(&client_params, |_| Ok(())).unwrap();
        assert_eq!(remote, params(true));
        let (seen, qpn) = server.join().unwrap();
        assert_eq!(seen, client_params);
        assert_eq!(qpn, 0x42);
    }

    #[test]
    fn short_read_is_a_handshake_failure() {
        let listener = OobListener::bind(0).unwrap();
        let port = listener.port();
        let client = thread::spawn(move || {
            let mut s = TcpStream::connect(("127.0.0.1", port)).unwrap();
            s.write_all(b"001a:abc").unwrap();
        });
        let mut hs = Handshake::new(listener.accept().unwrap(), Side::Server, false);
        client.join().unwrap();
        let err = hs.exchange(&params(false)).err().unwrap();
        assert!(matches!(err, Error::HandshakeFailed { stage: "read", .. }));
        assert_eq!(err.exit_code(), 9);
    }

    /// Plays the client by hand: sends `first`, reads the reply, then writes `second` raw and
    /// closes its half of the stream.
    fn scripted_client(
        port: u16,
        first: ConnectionParameters,
        second: Vec<u8>,
    ) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            let mut s = TcpStream::connect(("127.0.0.1", port)).unwrap();
            s.write_all(first.encode().as_bytes()).unwrap();
            let mut reply = [0u8; RECORD_LEN];
            s.read_exact(&mut reply).unwrap();
            s.write_all(&second).unwrap();
            s.shutdown(std::net::Shutdown::Write).unwrap();
            // the server may give up before it answers
            let _ = s.read_exact(&mut reply);
        })
    }

    #[test]
    fn second_round_must_repeat_the_first() {
        let listener = OobListener::bind(0).unwrap();
        let first = params(false);
        let mut changed = first;
        changed.psn ^= 1;
        let client = scripted_client(listener.port(), first, changed.encode().into_bytes());

        let hs = Handshake::new(listener.accept().unwrap(), Side::Server, false);
        let mut seen = None;
        let err = hs
            .run(&params(false), |remote| {
                seen = Some(*remote);
                Ok(())
            })
            .err()
            .unwrap();
        client.join().unwrap();
        assert_eq!(seen, Some(first));
        assert!(
            matches!(err, Error::HandshakeFailed { stage: "second round", .. }),
            "{err}"
        );
        assert_eq!(err.exit_code(), 9);
    }

    #[test]
    fn truncated_second_round_is_a_handshake_failure() {
        let listener = OobListener::bind(0).unwrap();
        let half = params(false).encode().as_bytes()[..20].to_vec();
        let client = scripted_client(listener.port(), params(false), half);

        let hs = Handshake::new(listener.accept().unwrap(), Side::Server, false);
        let mut connected = false;
        let err = hs
            .run(&params(false), |_| {
                connected = true;
                Ok(())
            })
            .err()
            .unwrap();
        client.join().unwrap();
        assert!(connected);
        assert!(matches!(err, Error::HandshakeFailed { stage: "read", .. }), "{err}");
    }

    #[cfg(feature = "serde")]
    #[test]
    fn parameters_serialize() {
        let p = params(true);
        let bytes = bincode::serialize(&p).unwrap();
        let back: ConnectionParameters = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, p);
    }
}
