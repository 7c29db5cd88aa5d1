//! The seam between the benchmark and an RDMA provider.
//!
//! A [`Fabric`] hands out device contexts, and every resource the benchmark touches (protection
//! domains, completion queues and channels, memory regions, queue pairs, address handles) is one
//! of its associated types. All provider operations report failure as `io::Error`, the same way
//! the raw verbs do; the components above map those onto [`crate::Error`].
//!
//! Two providers exist: [`soft::SoftFabric`], an in-process fabric that needs no hardware, and
//! (with the `verbs` feature) [`verbs::VerbsFabric`] on top of `libibverbs` and `librdmacm`.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::mr::AlignedBuffer;

pub mod soft;

#[cfg(feature = "verbs")]
pub mod rdmacm;
#[cfg(feature = "verbs")]
pub mod verbs;

/// The provider the binaries use.
#[cfg(feature = "verbs")]
pub type DefaultFabric = verbs::VerbsFabric;

/// Returns the provider the binaries use.
#[cfg(feature = "verbs")]
pub fn default_fabric() -> DefaultFabric {
    verbs::VerbsFabric
}

/// Queue key used by every UD queue pair.
pub const UD_QKEY: u32 = 0x1111_1111;
/// Bytes reserved ahead of every UD receive for the global routing header.
pub const GRH_LEN: usize = 40;
/// Remote QPN that addresses a multicast group rather than a single queue pair.
pub const MULTICAST_QPN: u32 = 0xff_ffff;

/// A 128-bit global identifier.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Default, Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct Gid {
    raw: [u8; 16],
}

impl Gid {
    /// Raw bytes, network order.
    pub fn raw(&self) -> &[u8; 16] {
        &self.raw
    }

    /// Upper 64 bits, read big endian.
    pub fn subnet_prefix(&self) -> u64 {
        let mut prefix = [0; 8];
        prefix.copy_from_slice(&self.raw[..8]);
        u64::from_be_bytes(prefix)
    }

    /// Lower 64 bits, read big endian.
    pub fn interface_id(&self) -> u64 {
        let mut id = [0; 8];
        id.copy_from_slice(&self.raw[8..]);
        u64::from_be_bytes(id)
    }
}

impl From<[u8; 16]> for Gid {
    fn from(raw: [u8; 16]) -> Self {
        Self { raw }
    }
}

impl From<Gid> for [u8; 16] {
    fn from(gid: Gid) -> Self {
        gid.raw
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.raw.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Path MTU of a connected queue pair.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Mtu {
    /// 256 bytes.
    Mtu256,
    /// 512 bytes.
    Mtu512,
    /// 1024 bytes.
    Mtu1024,
    /// 2048 bytes.
    Mtu2048,
    /// 4096 bytes.
    Mtu4096,
}

impl Mtu {
    /// Size in bytes.
    pub fn bytes(self) -> usize {
        match self {
            Mtu::Mtu256 => 256,
            Mtu::Mtu512 => 512,
            Mtu::Mtu1024 => 1024,
            Mtu::Mtu2048 => 2048,
            Mtu::Mtu4096 => 4096,
        }
    }
}

impl TryFrom<u32> for Mtu {
    type Error = u32;

    fn try_from(bytes: u32) -> Result<Self, u32> {
        Ok(match bytes {
            256 => Mtu::Mtu256,
            512 => Mtu::Mtu512,
            1024 => Mtu::Mtu1024,
            2048 => Mtu::Mtu2048,
            4096 => Mtu::Mtu4096,
            other => return Err(other),
        })
    }
}

impl fmt::Display for Mtu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bytes())
    }
}

/// Transport service type of a queue pair.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum QpType {
    /// Reliable connection.
    Rc,
    /// Unreliable connection.
    Uc,
    /// Unreliable datagram.
    Ud,
}

impl FromStr for QpType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "RC" => Ok(QpType::Rc),
            "UC" => Ok(QpType::Uc),
            "UD" => Ok(QpType::Ud),
            other => Err(format!("unknown connection type {other} (expected RC, UC or UD)")),
        }
    }
}

impl fmt::Display for QpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QpType::Rc => "RC",
            QpType::Uc => "UC",
            QpType::Ud => "UD",
        })
    }
}

/// Memory and queue-pair access permissions. Bit values match `ibv_access_flags`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct AccessFlags(pub u32);

impl AccessFlags {
    /// Local write access.
    pub const LOCAL_WRITE: AccessFlags = AccessFlags(1);
    /// Remote write access.
    pub const REMOTE_WRITE: AccessFlags = AccessFlags(1 << 1);
    /// Remote read access.
    pub const REMOTE_READ: AccessFlags = AccessFlags(1 << 2);

    /// Whether every bit of `other` is set.
    pub fn contains(self, other: AccessFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for AccessFlags {
    type Output = AccessFlags;

    fn bitor(self, rhs: AccessFlags) -> AccessFlags {
        AccessFlags(self.0 | rhs.0)
    }
}

/// Status of a work completion.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum WcStatus {
    /// The work request completed.
    Success,
    /// Local length error.
    LocalLength,
    /// Local QP operation error.
    LocalQpOperation,
    /// Local protection error.
    LocalProtection,
    /// Flushed because the QP entered the error state.
    WrFlush,
    /// Remote access error.
    RemoteAccess,
    /// Remote operation error.
    RemoteOperation,
    /// Transport retry counter exceeded.
    RetryExceeded,
    /// Receiver-not-ready retry counter exceeded.
    RnrRetryExceeded,
    /// Any other status, by its `ibv_wc_status` code.
    Other(u32),
}

impl WcStatus {
    /// The `ibv_wc_status` code.
    pub fn code(self) -> u32 {
        match self {
            WcStatus::Success => 0,
            WcStatus::LocalLength => 1,
            WcStatus::LocalQpOperation => 2,
            WcStatus::LocalProtection => 4,
            WcStatus::WrFlush => 5,
            WcStatus::RemoteAccess => 10,
            WcStatus::RemoteOperation => 11,
            WcStatus::RetryExceeded => 12,
            WcStatus::RnrRetryExceeded => 13,
            WcStatus::Other(code) => code,
        }
    }

    /// Inverse of [`WcStatus::code`].
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => WcStatus::Success,
            1 => WcStatus::LocalLength,
            2 => WcStatus::LocalQpOperation,
            4 => WcStatus::LocalProtection,
            5 => WcStatus::WrFlush,
            10 => WcStatus::RemoteAccess,
            11 => WcStatus::RemoteOperation,
            12 => WcStatus::RetryExceeded,
            13 => WcStatus::RnrRetryExceeded,
            other => WcStatus::Other(other),
        }
    }
}

impl fmt::Display for WcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.code(), self)
    }
}

/// What a completed work request did.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum WcOpcode {
    /// A send.
    Send,
    /// A receive.
    Recv,
    /// Anything else, by its `ibv_wc_opcode` code.
    Other(u32),
}

/// A completed work request.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WorkCompletion {
    /// Correlation id of the originating request.
    pub wr_id: u64,
    /// Outcome.
    pub status: WcStatus,
    /// Operation performed.
    pub opcode: WcOpcode,
    /// Bytes transferred; includes the GRH for UD receives.
    pub byte_len: u32,
    /// Local QP the request was posted on.
    pub qp_num: u32,
    /// Vendor syndrome for failed requests.
    pub vendor_err: u32,
}

impl WorkCompletion {
    /// Whether the request completed successfully.
    pub fn is_success(&self) -> bool {
        self.status == WcStatus::Success
    }
}

/// Opaque id echoed back by a completion channel for the CQ that fired.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct CqId(pub u64);

/// A single scatter/gather element.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Sge {
    /// Start address inside a registered region.
    pub addr: u64,
    /// Length in bytes.
    pub length: u32,
    /// Local key of the region.
    pub lkey: u32,
}

/// Where a UD send goes.
pub struct UdTarget<'a, A> {
    /// Address handle of the destination.
    pub ah: &'a A,
    /// Destination QPN, or [`MULTICAST_QPN`].
    pub remote_qpn: u32,
    /// Destination queue key.
    pub remote_qkey: u32,
}

/// A send work request with a single SGE.
pub struct SendRequest<'a, A> {
    /// Correlation id.
    pub wr_id: u64,
    /// Payload.
    pub sge: Sge,
    /// Generate a completion for this request.
    pub signaled: bool,
    /// Copy the payload into the request at post time.
    pub inline: bool,
    /// Destination, for UD queue pairs.
    pub ud: Option<UdTarget<'a, A>>,
}

/// A receive work request with a single SGE.
#[derive(Copy, Clone, Debug)]
pub struct RecvRequest {
    /// Correlation id.
    pub wr_id: u64,
    /// Buffer to receive into.
    pub sge: Sge,
}

/// Queue sizes requested at QP creation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct QpCaps {
    /// Send queue depth.
    pub max_send_wr: u32,
    /// Receive queue depth.
    pub max_recv_wr: u32,
    /// SGEs per send.
    pub max_send_sge: u32,
    /// SGEs per receive.
    pub max_recv_sge: u32,
    /// Largest inline payload.
    pub max_inline_data: u32,
}

/// Global routing part of an address vector.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct GlobalRoute {
    /// Destination GID.
    pub dgid: Gid,
    /// Source GID table index.
    pub sgid_index: u8,
    /// Hop limit.
    pub hop_limit: u8,
}

/// How to reach the peer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AddressVector {
    /// Destination LID.
    pub dlid: u16,
    /// Service level.
    pub sl: u8,
    /// Local port.
    pub port: u8,
    /// Global routing, when GIDs are in use.
    pub global: Option<GlobalRoute>,
}

/// One `modify_qp` step. Optional attributes are only applied when present.
#[derive(Clone, Debug, PartialEq)]
pub enum QpTransition {
    /// RESET to INIT.
    Init {
        /// Physical port.
        port: u8,
        /// Remote access rights; RC and UC only.
        access: Option<AccessFlags>,
        /// Queue key; UD only.
        qkey: Option<u32>,
    },
    /// INIT to RTR.
    Rtr {
        /// Address of the peer.
        av: AddressVector,
        /// Path MTU; RC and UC only.
        path_mtu: Option<Mtu>,
        /// Peer QPN; RC and UC only.
        dest_qpn: Option<u32>,
        /// Peer starting PSN; RC and UC only.
        rq_psn: Option<u32>,
        /// RC only.
        max_dest_rd_atomic: Option<u8>,
        /// RC only.
        min_rnr_timer: Option<u8>,
    },
    /// RTR to RTS.
    Rts {
        /// Local starting PSN.
        sq_psn: u32,
        /// RC only.
        timeout: Option<u8>,
        /// RC only.
        retry_cnt: Option<u8>,
        /// RC only.
        rnr_retry: Option<u8>,
        /// RC only.
        max_rd_atomic: Option<u8>,
    },
    /// Any state to ERROR; outstanding work is flushed.
    Error,
}

/// Static facts about a device.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct DeviceInfo {
    /// Kernel name, e.g. `mlx5_0`.
    pub name: String,
    /// Vendor part id from the device attributes.
    pub vendor_part_id: u32,
}

/// Attributes of an active port.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PortInfo {
    /// Base LID; zero when no subnet manager assigned one.
    pub lid: u16,
    /// Active MTU.
    pub active_mtu: Mtu,
    /// Entries in the GID table.
    pub gid_table_len: u32,
}

/// An RDMA provider.
pub trait Fabric: Clone + Send + Sync + 'static {
    /// An opened device.
    type Context: DeviceContext<Self>;
    /// A protection domain.
    type Pd: ProtectionDomain<Self>;
    /// A completion queue.
    type Cq: CompletionQueue;
    /// A completion channel.
    type Channel: CompletionChannel;
    /// A registered memory region.
    type Mr: RegisteredMemory;
    /// A queue pair.
    type Qp: RawQueuePair<Self>;
    /// A UD address handle.
    type Ah: Send + Sync;

    /// Lists the devices present on this host.
    fn devices(&self) -> io::Result<Vec<DeviceInfo>>;

    /// Opens a context on `device`.
    fn open(&self, device: &DeviceInfo) -> io::Result<Self::Context>;
}

/// An opened device.
pub trait DeviceContext<F: Fabric>: Send + Sync {
    /// The device this context was opened on.
    fn device(&self) -> &DeviceInfo;
    /// Queries `port`; fails unless the port is ACTIVE or ARMED.
    fn query_port(&self, port: u8) -> io::Result<PortInfo>;
    /// Reads entry `index` of the GID table of `port`.
    fn query_gid(&self, port: u8, index: u32) -> io::Result<Gid>;
    /// Allocates a protection domain.
    fn alloc_pd(&self) -> io::Result<F::Pd>;
    /// Creates a completion channel.
    fn create_channel(&self) -> io::Result<F::Channel>;
    /// Creates a CQ with at least `depth` entries, optionally attached to `channel`.
    fn create_cq(&self, depth: u32, channel: Option<&F::Channel>, id: CqId) -> io::Result<F::Cq>;
}

/// A protection domain.
pub trait ProtectionDomain<F: Fabric>: Send + Sync {
    /// Registers `buf`, taking ownership of it until the region is dropped.
    fn register(&self, buf: AlignedBuffer, access: AccessFlags) -> io::Result<F::Mr>;
    /// Creates a queue pair in RESET.
    fn create_qp(&self, send: &F::Cq, recv: &F::Cq, qp_type: QpType, caps: QpCaps)
        -> io::Result<F::Qp>;
    /// Creates an address handle for UD sends.
    fn create_ah(&self, av: &AddressVector) -> io::Result<F::Ah>;
}

/// A completion queue.
pub trait CompletionQueue: Send + Sync {
    /// The id given at creation.
    fn id(&self) -> CqId;
    /// Pops up to `out.len()` completions without blocking; returns how many were written.
    fn poll(&self, out: &mut [WorkCompletion]) -> io::Result<usize>;
    /// Requests an event on the channel for the next completion.
    fn req_notify(&self) -> io::Result<()>;
    /// Acknowledges `n` events received for this CQ.
    fn ack_events(&self, n: u32);
}

/// A completion channel.
pub trait CompletionChannel: Send + Sync {
    /// Blocks until one of the attached CQs fires. Returns `None` if `timeout` expires first.
    fn get_event(&self, timeout: Option<Duration>) -> io::Result<Option<CqId>>;
}

/// A registered memory region that owns its buffer.
///
/// The device may write into the buffer at any time a receive is posted, so access goes through
/// copies rather than long-lived slices.
pub trait RegisteredMemory: Send + Sync {
    /// Base address.
    fn addr(&self) -> u64;
    /// Length in bytes.
    fn len(&self) -> usize;
    /// Whether the region is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Local key.
    fn lkey(&self) -> u32;
    /// Remote key.
    fn rkey(&self) -> u32;
    /// Copies `data` into the region at `offset`.
    fn write_at(&mut self, offset: usize, data: &[u8]);
    /// Copies `out.len()` bytes from the region at `offset`.
    fn read_at(&self, offset: usize, out: &mut [u8]);
}

/// A queue pair, without any state tracking of its own.
pub trait RawQueuePair<F: Fabric>: Send {
    /// The QP number.
    fn qp_num(&self) -> u32;
    /// Applies one state transition.
    fn modify(&mut self, transition: &QpTransition) -> io::Result<()>;
    /// Joins a multicast group.
    fn attach_mcast(&mut self, gid: &Gid, lid: u16) -> io::Result<()>;
    /// Leaves a multicast group.
    fn detach_mcast(&mut self, gid: &Gid, lid: u16) -> io::Result<()>;
    /// Posts one send.
    fn post_send(&mut self, wr: &SendRequest<'_, F::Ah>) -> io::Result<()>;
    /// Posts one receive.
    fn post_recv(&mut self, wr: &RecvRequest) -> io::Result<()>;
}

/// Connection-manager events the engine distinguishes.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum CmEventKind {
    /// Address resolution finished.
    AddrResolved,
    /// Address resolution failed.
    AddrError,
    /// Route resolution finished.
    RouteResolved,
    /// Route resolution failed.
    RouteError,
    /// A peer wants to connect.
    ConnectRequest,
    /// Connection setup failed.
    ConnectError,
    /// The peer is unreachable.
    Unreachable,
    /// The peer rejected the connection.
    Rejected,
    /// The connection is up.
    Established,
    /// The connection went down.
    Disconnected,
    /// The device was removed.
    DeviceRemoval,
    /// The QP left the timewait state.
    TimewaitExit,
    /// Anything else, by its `rdma_cm_event_type` code.
    Other(u32),
}

impl fmt::Display for CmEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CmEventKind::AddrResolved => "ADDR_RESOLVED",
            CmEventKind::AddrError => "ADDR_ERROR",
            CmEventKind::RouteResolved => "ROUTE_RESOLVED",
            CmEventKind::RouteError => "ROUTE_ERROR",
            CmEventKind::ConnectRequest => "CONNECT_REQUEST",
            CmEventKind::ConnectError => "CONNECT_ERROR",
            CmEventKind::Unreachable => "UNREACHABLE",
            CmEventKind::Rejected => "REJECTED",
            CmEventKind::Established => "ESTABLISHED",
            CmEventKind::Disconnected => "DISCONNECTED",
            CmEventKind::DeviceRemoval => "DEVICE_REMOVAL",
            CmEventKind::TimewaitExit => "TIMEWAIT_EXIT",
            CmEventKind::Other(code) => return write!(f, "EVENT_{code}"),
        };
        f.write_str(name)
    }
}

/// A connection-manager event, already acknowledged.
pub struct CmEvent<Id> {
    /// What happened.
    pub kind: CmEventKind,
    /// Provider status; non-zero for failures.
    pub status: i32,
    /// The context value of the id the event is about.
    pub context: u64,
    /// The newly created id; only set for [`CmEventKind::ConnectRequest`].
    pub request: Option<Id>,
}

/// A provider with a connection manager.
pub trait CmFabric: Fabric {
    /// An event channel.
    type EventChannel: CmEventChannel<Self>;
    /// A connection-manager id.
    type CmId: CmId<Self>;

    /// Creates an event channel.
    fn create_event_channel(&self) -> io::Result<Self::EventChannel>;
}

/// A connection-manager event channel.
pub trait CmEventChannel<F: CmFabric>: Send + Sync {
    /// Creates an id whose events are reported on this channel with `context`.
    fn create_id(&self, context: u64) -> io::Result<F::CmId>;
    /// Waits for the next event. Returns `None` if `timeout` expires first.
    fn get_event(&self, timeout: Option<Duration>) -> io::Result<Option<CmEvent<F::CmId>>>;
}

/// A connection-manager id.
pub trait CmId<F: CmFabric>: Send + Sync {
    /// Replaces the context value reported with this id's events.
    fn set_context(&mut self, context: u64);
    /// The device the id is bound to, once it is bound to one.
    fn device(&self) -> Option<DeviceInfo>;
    /// A context on the id's device. The id keeps ownership of the underlying device handle.
    fn context(&self) -> io::Result<F::Context>;
    /// Binds to a local address.
    fn bind_addr(&mut self, addr: SocketAddr) -> io::Result<()>;
    /// Starts listening.
    fn listen(&mut self, backlog: i32) -> io::Result<()>;
    /// The bound local port.
    fn local_port(&self) -> u16;
    /// Starts resolving `dst`.
    fn resolve_addr(&mut self, dst: SocketAddr, timeout: Duration) -> io::Result<()>;
    /// Starts resolving the route to the resolved address.
    fn resolve_route(&mut self, timeout: Duration) -> io::Result<()>;
    /// Creates an RC queue pair owned by this id.
    fn create_qp(&mut self, pd: &F::Pd, cq: &F::Cq, caps: QpCaps) -> io::Result<F::Qp>;
    /// Accepts a connection request.
    fn accept(&mut self) -> io::Result<()>;
    /// Connects to the resolved peer.
    fn connect(&mut self) -> io::Result<()>;
    /// Disconnects.
    fn disconnect(&mut self) -> io::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(feature = "verbs")]
    #[test]
    fn binaries_use_the_verbs_provider() {
        let fabric: verbs::VerbsFabric = default_fabric();
        assert_eq!(
            std::any::type_name::<DefaultFabric>(),
            std::any::type_name_of_val(&fabric)
        );
    }

    #[test]
    fn gid_array_conversion() {
        let arr = [
            0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66,
            0x77, 0x88,
        ];
        let gid = Gid::from(arr);
        assert_eq!(gid.subnet_prefix(), 0x1234_5678_9abc_def0);
        assert_eq!(gid.interface_id(), 0x1122_3344_5566_7788);
        let arr2: [u8; 16] = gid.into();
        assert_eq!(arr, arr2);
        assert!(gid.to_string().starts_with("12:34:56:78"));
    }

    #[test]
    fn mtu_accepts_only_the_enumerated_sizes() {
        assert_eq!(Mtu::try_from(1024), Ok(Mtu::Mtu1024));
        assert_eq!(Mtu::try_from(4096).map(Mtu::bytes), Ok(4096));
        assert_eq!(Mtu::try_from(1500), Err(1500));
        assert_eq!(Mtu::try_from(0), Err(0));
    }

    #[test]
    fn connection_types_parse() {
        assert_eq!("RC".parse::<QpType>(), Ok(QpType::Rc));
        assert_eq!("UD".parse::<QpType>(), Ok(QpType::Ud));
        assert!("rc".parse::<QpType>().is_err());
    }

    #[test]
    fn wc_status_codes() {
        for status in [
            WcStatus::Success,
            WcStatus::WrFlush,
            WcStatus::RetryExceeded,
            WcStatus::Other(21),
        ] {
            assert_eq!(WcStatus::from_code(status.code()), status);
        }
    }
}
