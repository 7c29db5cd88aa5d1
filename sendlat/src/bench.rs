//! The ping-pong latency loop.
//!
//! Both ends run the same loop. The server receives before it sends, the client sends its first
//! message without waiting, and from then on every receive is answered with a send. The client
//! stamps the cycle counter before each post, so consecutive stamps are one round trip apart.
//!
//! Sends are unsignaled except every `tx_depth - 2`th one (and the last one, and all of them with
//! `--signal`); waiting for the signaled completion keeps the send queue from overflowing.

use crate::clock;
use crate::config::BenchConfig;
use crate::context::{ContextOptions, FabricContext};
use crate::cq::{self, CompletionEngine, CqSide};
use crate::error::{Counters, Error, Result};
use crate::exchange::{ConnectionParameters, Handshake, OobStream, Side};
use crate::fabric::{
    AccessFlags, Fabric, GlobalRoute, Mtu, ProtectionDomain, QpCaps, QpType, SendRequest,
    UdTarget, MULTICAST_QPN, UD_QKEY,
};
use crate::mr::{register_buffer, BufferLayout, MemoryRegion};
use crate::qp::{
    multicast_gid, select_mtu, McastRole, QpState, QueuePair, RtrParams, RtsParams, MCG_LID,
};
use crate::report::Report;

/// Correlation id of every send.
pub const SEND_WRID: u64 = 1;
/// Correlation id of every receive.
pub const RECV_WRID: u64 = 2;

/// Decides which sends generate a completion.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SignalPolicy {
    depth: u32,
    every: bool,
    iters: usize,
}

impl SignalPolicy {
    /// A policy for `iters` sends on a send queue of `depth` entries.
    ///
    /// `depth` must be at least 3.
    pub fn new(depth: u32, every: bool, iters: usize) -> Result<Self> {
        if depth < 3 {
            return Err(Error::Config(format!(
                "tx depth must be at least 3, got {depth}"
            )));
        }
        Ok(SignalPolicy {
            depth,
            every,
            iters,
        })
    }

    /// Whether send number `scnt` (counting from 0) is signaled, given `ccnt` unsignaled sends
    /// since the last signaled one.
    pub fn should_signal(&self, scnt: usize, ccnt: usize) -> bool {
        self.every || ccnt + 1 >= (self.depth - 2) as usize || scnt + 1 == self.iters
    }

    /// How many of the `iters` sends this policy signals.
    pub fn signaled_count(&self) -> usize {
        let mut ccnt = 0;
        (0..self.iters)
            .filter(|&scnt| {
                let signal = self.should_signal(scnt, ccnt);
                ccnt = if signal { 0 } else { ccnt + 1 };
                signal
            })
            .count()
    }
}

/// The outcome of one message size.
#[derive(Clone, Debug)]
pub struct Run {
    /// Message size in bytes.
    pub size: usize,
    /// Cycle counter before each send.
    pub stamps: Vec<u64>,
    /// Sends posted.
    pub sends: usize,
    /// Receives completed.
    pub recvs: usize,
    /// Sends posted with a completion requested; each one was waited for.
    pub signaled: usize,
}

impl Run {
    /// Latency statistics of this run.
    pub fn report(&self) -> Option<Report> {
        Report::from_samples(&self.stamps)
    }
}

// drop order: AH and QP before the region, everything before the context
/// One end of a latency test.
pub struct Session<F: Fabric> {
    ah: Option<F::Ah>,
    qp: QueuePair<F>,
    mr: MemoryRegion<F>,
    layout: BufferLayout,
    local: ConnectionParameters,
    remote: Option<ConnectionParameters>,
    port: u8,
    mtu: Mtu,
    cfg: BenchConfig,
    ctx: FabricContext<F>,
}

impl<F: Fabric> Session<F> {
    /// Opens the device and builds everything short of the connection: CQs, the registered
    /// buffer, and a queue pair in INIT (joined to its multicast group with `--mcg`).
    ///
    /// # Errors
    ///
    ///  - `DeviceNotFound`: the device named in `cfg` is missing.
    ///  - `Config`: the port has no LID and no GID is in use.
    ///  - `ResourceExhausted` or `RegistrationFailed`: the fabric refused a resource.
    pub fn prepare(fabric: &F, cfg: BenchConfig) -> Result<Self> {
        let opts = ContextOptions {
            cq_depth: cfg.tx_depth,
            events: cfg.wait == cq::WaitMode::Events,
            split_cqs: true,
        };
        let ctx = FabricContext::open(fabric, cfg.ib_dev.as_deref(), &opts)?;
        let port = cfg.ib_port;
        let info = ctx.port_info(port)?;
        let gid = match cfg.gid_index {
            Some(index) => Some(ctx.gid(port, index)?),
            None => None,
        };
        if info.lid == 0 && gid.is_none() {
            return Err(Error::Config(
                "Local lid 0x0 detected. Is an SM running?".into(),
            ));
        }
        let mtu = cfg
            .mtu
            .unwrap_or_else(|| select_mtu(ctx.device().vendor_part_id, cfg.uses_gid()));

        let layout = BufferLayout::new(cfg.capacity(), cfg.qp_type);
        let mr = register_buffer::<F>(ctx.pd()?, layout.len(), AccessFlags::default())?;

        let caps = QpCaps {
            max_send_wr: cfg.tx_depth,
            max_recv_wr: cfg.tx_depth,
            max_send_sge: 1,
            max_recv_sge: 1,
            max_inline_data: cfg.inline_size,
        };
        let mut qp = QueuePair::create(&ctx, cfg.qp_type, caps)?;
        qp.to_init(port)?;
        if cfg.mcg {
            qp.attach_multicast(mcast_role(&cfg))?;
        }

        let local = ConnectionParameters {
            lid: info.lid,
            qpn: qp.qp_num(),
            psn: rand::random::<u32>() & 0xff_ffff,
            rkey: mr.rkey(),
            vaddr: layout.remote_addr(mr.addr()),
            gid,
        };
        log::debug!(
            "{} ready on {} port {}: {}",
            side(&cfg),
            ctx.device().name,
            port,
            local.encode()
        );

        Ok(Session {
            ah: None,
            qp,
            mr,
            layout,
            local,
            remote: None,
            port,
            mtu,
            cfg,
            ctx,
        })
    }

    /// What this end tells its peer.
    pub fn local(&self) -> &ConnectionParameters {
        &self.local
    }

    /// What the peer told this end, once connected.
    pub fn remote(&self) -> Option<&ConnectionParameters> {
        self.remote.as_ref()
    }

    /// Path MTU used for RC and UC.
    pub fn mtu(&self) -> Mtu {
        self.mtu
    }

    /// The configuration this session runs with.
    pub fn config(&self) -> &BenchConfig {
        &self.cfg
    }

    /// The opened device.
    pub fn context(&self) -> &FabricContext<F> {
        &self.ctx
    }

    /// State of the session's queue pair.
    pub fn qp_state(&self) -> QpState {
        self.qp.state()
    }

    /// Dials the server or waits for the client, per the configuration.
    pub fn establish(&self) -> Result<OobStream> {
        OobStream::establish(self.cfg.host.as_deref(), self.cfg.port)
    }

    /// Exchanges parameters over `stream` and brings the queue pair to RTS.
    ///
    /// Half of the receive queue is pre-posted before the second round, so the peer never sends
    /// into an empty queue. In event mode both CQs are armed afterwards. If the exchange fails
    /// the queue pair ends up in ERROR, whatever state it had reached.
    pub fn connect(&mut self, stream: OobStream) -> Result<()> {
        let side = if self.cfg.host.is_some() {
            Side::Client
        } else {
            Side::Server
        };
        let local = self.local;
        let (remote, ()) = match Handshake::new(stream, side, self.cfg.uses_gid())
            .run(&local, |remote| self.bring_up(remote))
        {
            Ok(done) => done,
            Err(e) => {
                self.ah = None;
                if let Err(e) = self.qp.to_error() {
                    log::debug!("couldn't fail the QP after the handshake: {}", e);
                }
                return Err(e);
            }
        };
        log::info!("connected to QP {:#06x}", remote.qpn);
        self.remote = Some(remote);
        CompletionEngine::new(&self.ctx, self.cfg.wait)?.arm()
    }

    fn rtr_params(&self, remote: &ConnectionParameters) -> RtrParams {
        let global = match (self.cfg.gid_index, remote.gid) {
            (Some(index), Some(dgid)) => Some(GlobalRoute {
                dgid,
                sgid_index: index as u8,
                hop_limit: 1,
            }),
            _ => None,
        };
        let mut params = RtrParams {
            dlid: remote.lid,
            dest_qpn: remote.qpn,
            rq_psn: remote.psn,
            mtu: self.mtu,
            sl: if global.is_some() { 0 } else { self.cfg.sl },
            global,
        };
        if self.cfg.mcg {
            params.dlid = MCG_LID;
            params.global = Some(GlobalRoute {
                dgid: multicast_gid(mcast_role(&self.cfg).peer(), remote.qpn),
                sgid_index: 0,
                hop_limit: 1,
            });
        }
        params
    }

    fn bring_up(&mut self, remote: &ConnectionParameters) -> Result<()> {
        let params = self.rtr_params(remote);
        self.qp.to_rtr(&params)?;
        self.qp.to_rts(&RtsParams {
            sq_psn: self.local.psn,
            timeout: self.cfg.qp_timeout,
        })?;
        if self.cfg.qp_type == QpType::Ud {
            let ah = self
                .ctx
                .pd()?
                .create_ah(&params.address_vector(self.port))
                .map_err(Error::resource("address handle"))?;
            self.ah = Some(ah);
        }
        let wr = self.layout.recv_request(&self.mr, RECV_WRID);
        for i in 0..self.cfg.tx_depth / 2 {
            let counters = Counters {
                rcnt: i as usize,
                ..Counters::default()
            };
            self.qp.post_recv(&wr, counters)?;
        }
        Ok(())
    }

    /// Runs `iters` round trips of `size`-byte messages.
    ///
    /// # Errors
    ///
    ///  - `Config`: `size` is zero or larger than the buffer prepared for this session.
    ///  - `QueueFull`: the provider refused a post.
    ///  - `Poll`: polling or waiting on a CQ failed.
    ///  - `Completion`: a send or receive completed with an error.
    pub fn run_size(&mut self, size: usize) -> Result<Run> {
        let remote = self.remote.ok_or_else(|| Error::StateViolation {
            from: self.qp.state().to_string(),
            to: "run before connect".into(),
        })?;
        if size == 0 || size > self.layout.payload_len() {
            return Err(Error::Config(format!(
                "message size {} does not fit the {} byte buffer",
                size,
                self.layout.payload_len()
            )));
        }
        let iters = self.cfg.iters;
        let policy = SignalPolicy::new(self.cfg.tx_depth, self.cfg.signal_every, iters)?;
        let inline = self.cfg.inline(size);
        let client = self.cfg.host.is_some();
        let who = side(&self.cfg);
        let remote_qpn = if self.cfg.mcg { MULTICAST_QPN } else { remote.qpn };

        let engine = CompletionEngine::new(&self.ctx, self.cfg.wait)?;
        let send_sge = self.layout.send_sge(&self.mr, size);
        let recv_wr = self.layout.recv_request(&self.mr, RECV_WRID);
        let stamp_at = self.layout.stamp_offset(size);

        let mut stamps = Vec::with_capacity(iters);
        let (mut scnt, mut rcnt, mut ccnt) = (0, 0, 0);
        let mut signaled = 0;
        while scnt < iters || rcnt < iters {
            if rcnt < iters && !(client && scnt < 1) {
                rcnt += 1;
                let counters = Counters { scnt, rcnt, ccnt };
                self.qp.post_recv(&recv_wr, counters)?;
                let wc = engine.wait_one(CqSide::Recv)?;
                cq::check(&wc, who, counters)?;
            }
            if scnt < iters {
                let signal = policy.should_signal(scnt, ccnt);
                ccnt = if signal { 0 } else { ccnt + 1 };
                stamps.push(clock::now());
                self.mr.write_at(stamp_at, &[(scnt + 1) as u8]);
                scnt += 1;
                let wr = SendRequest {
                    wr_id: SEND_WRID,
                    sge: send_sge,
                    signaled: signal,
                    inline,
                    ud: self.ah.as_ref().map(|ah| UdTarget {
                        ah,
                        remote_qpn,
                        remote_qkey: UD_QKEY,
                    }),
                };
                let counters = Counters { scnt, rcnt, ccnt };
                self.qp.post_send(&wr, counters)?;
                if signal {
                    signaled += 1;
                    let wc = engine.wait_one(CqSide::Send)?;
                    cq::check(&wc, who, counters)?;
                }
            }
        }
        log::debug!(
            "{} byte run done: {} sends, {} signaled",
            size,
            scnt,
            signaled
        );
        Ok(Run {
            size,
            stamps,
            sends: scnt,
            recvs: rcnt,
            signaled,
        })
    }
}

fn side(cfg: &BenchConfig) -> &'static str {
    if cfg.host.is_some() {
        "client"
    } else {
        "server"
    }
}

fn mcast_role(cfg: &BenchConfig) -> McastRole {
    if cfg.host.is_some() {
        McastRole::Active
    } else {
        McastRole::Passive
    }
}
