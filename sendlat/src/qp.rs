//! The queue-pair state machine.
//!
//! A queue pair walks RESET → INIT → RTR → RTS, one step at a time:
//!
//!  - INIT binds it to a port and sets its access rights (RC, UC) or queue key (UD). Receives
//!    may be posted from here on.
//!  - RTR ("ready to receive") gives it the address of its peer.
//!  - RTS ("ready to send") sets the starting send PSN and, for RC, the retry behaviour.
//!
//! [`QueuePair`] refuses any step out of order with [`Error::StateViolation`] and leaves its state
//! alone; if the provider rejects a step, the queue pair is considered to be in ERROR.
//!
//! See also [RDMAmojo] for the attributes each transition takes.
//!
//! [RDMAmojo]: http://www.rdmamojo.com/2013/01/12/ibv_modify_qp/

use std::fmt;

use crate::context::FabricContext;
use crate::error::{Counters, Error, Result};
use crate::fabric::{
    AccessFlags, AddressVector, Fabric, Gid, GlobalRoute, Mtu, ProtectionDomain, QpCaps,
    QpTransition, QpType, RawQueuePair, RecvRequest, SendRequest, UD_QKEY,
};

/// Base of the multicast group GIDs; byte 11 is the role, bytes 12..16 the QPN.
pub const MCG_GID: [u8; 16] = [255, 1, 0, 0, 0, 2, 201, 133, 0, 0, 0, 0, 0, 0, 0, 0];
/// Multicast LID shared by every group.
pub const MCG_LID: u16 = 0xc001;
/// Device part id of the adapter model that only runs reliably at 1024-byte MTU.
pub const LEGACY_PART_ID: u32 = 23108;

/// State of a [`QueuePair`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum QpState {
    /// Just created.
    Reset,
    /// Bound to a port.
    Init,
    /// Ready to receive.
    Rtr,
    /// Ready to send.
    Rts,
    /// Failed; must be destroyed.
    Error,
}

impl fmt::Display for QpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QpState::Reset => "RESET",
            QpState::Init => "INIT",
            QpState::Rtr => "RTR",
            QpState::Rts => "RTS",
            QpState::Error => "ERROR",
        })
    }
}

/// Which end of the conversation a multicast group belongs to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum McastRole {
    /// The client, which sends first.
    Active,
    /// The server.
    Passive,
}

impl McastRole {
    /// The group of the other end.
    pub fn peer(self) -> McastRole {
        match self {
            McastRole::Active => McastRole::Passive,
            McastRole::Passive => McastRole::Active,
        }
    }
}

/// The multicast group owned by the queue pair `qpn` playing `role`.
pub fn multicast_gid(role: McastRole, qpn: u32) -> Gid {
    let mut raw = MCG_GID;
    raw[11] = match role {
        McastRole::Active => 0,
        McastRole::Passive => 1,
    };
    raw[12..].copy_from_slice(&qpn.to_ne_bytes());
    Gid::from(raw)
}

/// Path MTU used when none is given: 2048, or 1024 on the legacy adapter and whenever GIDs are
/// in use (RoCE ports).
pub fn select_mtu(vendor_part_id: u32, gid_in_use: bool) -> Mtu {
    if vendor_part_id == LEGACY_PART_ID || gid_in_use {
        Mtu::Mtu1024
    } else {
        Mtu::Mtu2048
    }
}

/// Everything RTR needs to know about the peer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RtrParams {
    /// Peer LID.
    pub dlid: u16,
    /// Peer QPN.
    pub dest_qpn: u32,
    /// Peer starting PSN.
    pub rq_psn: u32,
    /// Path MTU.
    pub mtu: Mtu,
    /// Service level.
    pub sl: u8,
    /// Global routing, when a GID index is in use.
    pub global: Option<GlobalRoute>,
}

impl RtrParams {
    /// The address vector these parameters describe, from local `port`.
    pub fn address_vector(&self, port: u8) -> AddressVector {
        AddressVector {
            dlid: self.dlid,
            sl: self.sl,
            port,
            global: self.global,
        }
    }
}

/// What RTS needs.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RtsParams {
    /// Local starting PSN.
    pub sq_psn: u32,
    /// Local ACK timeout exponent; RC only.
    pub timeout: u8,
}

/// A queue pair together with the state it is known to be in.
pub struct QueuePair<F: Fabric> {
    raw: F::Qp,
    state: QpState,
    qp_type: QpType,
    port: u8,
    mcast: Option<Gid>,
}

impl<F: Fabric> QueuePair<F> {
    /// Creates a queue pair in RESET on the CQs of `ctx`.
    pub fn create(ctx: &FabricContext<F>, qp_type: QpType, caps: QpCaps) -> Result<Self> {
        let raw = ctx
            .pd()?
            .create_qp(ctx.send_cq()?, ctx.recv_cq()?, qp_type, caps)
            .map_err(Error::resource("QP"))?;
        log::debug!("created {} QP {:#06x}", qp_type, raw.qp_num());
        Ok(QueuePair {
            raw,
            state: QpState::Reset,
            qp_type,
            port: 0,
            mcast: None,
        })
    }

    /// Wraps a queue pair the connection manager created; those start in INIT.
    pub fn adopt(raw: F::Qp, qp_type: QpType) -> Self {
        QueuePair {
            raw,
            state: QpState::Init,
            qp_type,
            port: 0,
            mcast: None,
        }
    }

    /// The QP number.
    pub fn qp_num(&self) -> u32 {
        self.raw.qp_num()
    }

    /// Current state.
    pub fn state(&self) -> QpState {
        self.state
    }

    /// Transport type.
    pub fn qp_type(&self) -> QpType {
        self.qp_type
    }

    fn step(&mut self, from: QpState, to: QpState, transition: &QpTransition) -> Result<()> {
        if self.state != from {
            return Err(Error::StateViolation {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        if let Err(e) = self.raw.modify(transition) {
            log::warn!("failed to modify QP {:#06x} to {}: {}", self.qp_num(), to, e);
            self.state = QpState::Error;
            return Err(e.into());
        }
        log::debug!("QP {:#06x}: {} -> {}", self.qp_num(), from, to);
        self.state = to;
        Ok(())
    }

    /// RESET → INIT on `port`.
    ///
    /// RC and UC queue pairs get local and remote write access; UD queue pairs get the shared
    /// queue key.
    pub fn to_init(&mut self, port: u8) -> Result<()> {
        let t = match self.qp_type {
            QpType::Ud => QpTransition::Init {
                port,
                access: None,
                qkey: Some(UD_QKEY),
            },
            QpType::Rc | QpType::Uc => QpTransition::Init {
                port,
                access: Some(AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE),
                qkey: None,
            },
        };
        self.step(QpState::Reset, QpState::Init, &t)?;
        self.port = port;
        Ok(())
    }

    /// INIT → RTR towards the peer described by `params`.
    pub fn to_rtr(&mut self, params: &RtrParams) -> Result<()> {
        let av = params.address_vector(self.port);
        let t = match self.qp_type {
            QpType::Rc => QpTransition::Rtr {
                av,
                path_mtu: Some(params.mtu),
                dest_qpn: Some(params.dest_qpn),
                rq_psn: Some(params.rq_psn),
                max_dest_rd_atomic: Some(1),
                min_rnr_timer: Some(12),
            },
            QpType::Uc => QpTransition::Rtr {
                av,
                path_mtu: Some(params.mtu),
                dest_qpn: Some(params.dest_qpn),
                rq_psn: Some(params.rq_psn),
                max_dest_rd_atomic: None,
                min_rnr_timer: None,
            },
            QpType::Ud => QpTransition::Rtr {
                av,
                path_mtu: None,
                dest_qpn: None,
                rq_psn: None,
                max_dest_rd_atomic: None,
                min_rnr_timer: None,
            },
        };
        self.step(QpState::Init, QpState::Rtr, &t)
    }

    /// RTR → RTS.
    pub fn to_rts(&mut self, params: &RtsParams) -> Result<()> {
        let t = match self.qp_type {
            QpType::Rc => QpTransition::Rts {
                sq_psn: params.sq_psn,
                timeout: Some(params.timeout),
                retry_cnt: Some(7),
                rnr_retry: Some(7),
                max_rd_atomic: Some(1),
            },
            QpType::Uc | QpType::Ud => QpTransition::Rts {
                sq_psn: params.sq_psn,
                timeout: None,
                retry_cnt: None,
                rnr_retry: None,
                max_rd_atomic: None,
            },
        };
        self.step(QpState::Rtr, QpState::Rts, &t)
    }

    /// Records that the connection manager brought the queue pair up.
    pub fn cm_established(&mut self) -> Result<()> {
        match self.state {
            QpState::Init | QpState::Rtr => {
                self.state = QpState::Rts;
                Ok(())
            }
            other => Err(Error::StateViolation {
                from: other.to_string(),
                to: QpState::Rts.to_string(),
            }),
        }
    }

    /// Marks the queue pair as failed.
    pub fn set_error(&mut self) {
        self.state = QpState::Error;
    }

    /// Moves the queue pair to ERROR from any state, flushing whatever is still posted. The
    /// queue pair counts as failed even if the provider refuses.
    pub fn to_error(&mut self) -> Result<()> {
        let from = self.state;
        self.state = QpState::Error;
        self.raw.modify(&QpTransition::Error).map_err(|e| {
            log::warn!("failed to move QP {:#06x} to ERROR: {}", self.qp_num(), e);
            Error::from(e)
        })?;
        log::debug!("QP {:#06x}: {} -> {}", self.qp_num(), from, QpState::Error);
        Ok(())
    }

    /// Joins the multicast group of `role` for this queue pair. UD only, from INIT on.
    pub fn attach_multicast(&mut self, role: McastRole) -> Result<Gid> {
        if self.qp_type != QpType::Ud || matches!(self.state, QpState::Reset | QpState::Error) {
            return Err(Error::StateViolation {
                from: format!("{} {}", self.qp_type, self.state),
                to: "multicast attach".into(),
            });
        }
        let gid = multicast_gid(role, self.qp_num());
        self.raw
            .attach_mcast(&gid, MCG_LID)
            .map_err(Error::resource("multicast attachment"))?;
        log::debug!("QP {:#06x} joined group {}", self.qp_num(), gid);
        self.mcast = Some(gid);
        Ok(gid)
    }

    /// Posts a send. Only allowed in RTS.
    pub fn post_send(&mut self, wr: &SendRequest<'_, F::Ah>, counters: Counters) -> Result<()> {
        if self.state != QpState::Rts {
            return Err(Error::StateViolation {
                from: self.state.to_string(),
                to: "post send".into(),
            });
        }
        self.raw
            .post_send(wr)
            .map_err(|source| Error::QueueFull {
                what: "send",
                counters,
                source,
            })
    }

    /// Posts a receive. Allowed from INIT on.
    pub fn post_recv(&mut self, wr: &RecvRequest, counters: Counters) -> Result<()> {
        if matches!(self.state, QpState::Reset | QpState::Error) {
            return Err(Error::StateViolation {
                from: self.state.to_string(),
                to: "post receive".into(),
            });
        }
        self.raw
            .post_recv(wr)
            .map_err(|source| Error::QueueFull {
                what: "receive",
                counters,
                source,
            })
    }
}

impl<F: Fabric> Drop for QueuePair<F> {
    fn drop(&mut self) {
        if let Some(gid) = self.mcast.take() {
            if let Err(e) = self.raw.detach_mcast(&gid, MCG_LID) {
                log::debug!("failed to leave group {}: {}", gid, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextOptions;
    use crate::fabric::soft::SoftFabric;

    fn caps() -> QpCaps {
        QpCaps {
            max_send_wr: 8,
            max_recv_wr: 8,
            max_send_sge: 1,
            max_recv_sge: 1,
            max_inline_data: 0,
        }
    }

    fn rtr(dest_qpn: u32) -> RtrParams {
        RtrParams {
            dlid: 1,
            dest_qpn,
            rq_psn: 0,
            mtu: Mtu::Mtu1024,
            sl: 0,
            global: None,
        }
    }

    const RTS: RtsParams = RtsParams {
        sq_psn: 0,
        timeout: 14,
    };

    #[test]
    fn transitions_follow_the_ladder() {
        let fabric = SoftFabric::new();
        let ctx = FabricContext::open(&fabric, None, &ContextOptions::default()).unwrap();
        let mut qp = QueuePair::create(&ctx, QpType::Rc, caps()).unwrap();
        assert_eq!(qp.state(), QpState::Reset);
        qp.to_init(1).unwrap();
        let qpn = qp.qp_num();
        qp.to_rtr(&rtr(qpn)).unwrap();
        qp.to_rts(&RTS).unwrap();
        assert_eq!(qp.state(), QpState::Rts);
    }

    #[test]
    fn rtr_before_init_is_refused_and_state_kept() {
        let fabric = SoftFabric::new();
        let ctx = FabricContext::open(&fabric, None, &ContextOptions::default()).unwrap();
        let mut qp = QueuePair::create(&ctx, QpType::Uc, caps()).unwrap();
        let err = qp.to_rtr(&rtr(1)).err().unwrap();
        assert!(
            matches!(err, Error::StateViolation { ref from, ref to } if from == "RESET" && to == "RTR")
        );
        assert_eq!(qp.state(), QpState::Reset);
        assert!(qp.to_rts(&RTS).is_err());
        assert_eq!(qp.state(), QpState::Reset);
    }

    #[test]
    fn provider_rejection_moves_to_error() {
        let fabric = SoftFabric::new();
        let ctx = FabricContext::open(&fabric, None, &ContextOptions::default()).unwrap();
        let mut qp = QueuePair::create(&ctx, QpType::Rc, caps()).unwrap();
        // the soft device only has port 1
        assert!(qp.to_init(2).is_err());
        assert_eq!(qp.state(), QpState::Error);
        assert!(qp.to_init(1).is_err());
    }

    #[test]
    fn multicast_requires_ud() {
        let fabric = SoftFabric::new();
        let ctx = FabricContext::open(&fabric, None, &ContextOptions::default()).unwrap();
        let mut rc = QueuePair::create(&ctx, QpType::Rc, caps()).unwrap();
        rc.to_init(1).unwrap();
        assert!(rc.attach_multicast(McastRole::Active).is_err());

        let mut ud = QueuePair::create(&ctx, QpType::Ud, caps()).unwrap();
        assert!(ud.attach_multicast(McastRole::Active).is_err());
        ud.to_init(1).unwrap();
        let gid = ud.attach_multicast(McastRole::Passive).unwrap();
        assert_eq!(gid.raw()[11], 1);
        assert_eq!(gid.raw()[..8], MCG_GID[..8]);
    }

    #[test]
    fn multicast_gid_layout() {
        let gid = multicast_gid(McastRole::Active, 0x12_3456);
        let raw = gid.raw();
        assert_eq!(raw[11], 0);
        assert_eq!(raw[12..], 0x12_3456u32.to_ne_bytes());
        assert_eq!(multicast_gid(McastRole::Active.peer(), 7).raw()[11], 1);
    }

    #[test]
    fn mtu_policy() {
        assert_eq!(select_mtu(4099, false), Mtu::Mtu2048);
        assert_eq!(select_mtu(LEGACY_PART_ID, false), Mtu::Mtu1024);
        assert_eq!(select_mtu(4099, true), Mtu::Mtu1024);
    }

    #[test]
    fn posting_requires_the_right_state() {
        let fabric = SoftFabric::new();
        let ctx = FabricContext::open(&fabric, None, &ContextOptions::default()).unwrap();
        let mut qp = QueuePair::create(&ctx, QpType::Rc, caps()).unwrap();
        let wr = RecvRequest {
            wr_id: 0,
            sge: Default::default(),
        };
        assert!(matches!(
            qp.post_recv(&wr, Counters::default()),
            Err(Error::StateViolation { .. })
        ));
    }
}
