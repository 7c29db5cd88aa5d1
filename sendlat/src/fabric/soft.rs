//! An in-process fabric.
//!
//! `SoftFabric` models a small subnet of devices that share one address space. Sends copy the
//! payload out of the sender's registered region and into a receive posted on the peer while the
//! call is still in progress, so every completion is visible to the peer by the time
//! `post_send` returns. The model keeps the behaviour the benchmark depends on:
//!
//!  - queue pairs walk RESET, INIT, RTR, RTS and refuse anything else;
//!  - unsignaled sends keep their send-queue slot until a later signaled completion is polled,
//!    so a sender that never signals runs out of slots;
//!  - RC sends to a peer that has no receive posted wait for one; UC and UD sends are dropped;
//!  - RC sends to a peer that is gone complete with `RetryExceeded` and move the QP to ERROR,
//!    flushing its posted receives;
//!  - UD receives get a 40-byte GRH ahead of the payload, and multicast sends reach every QP
//!    attached to the destination group;
//!  - completion channels deliver one event per arm, and events must be acknowledged.
//!
//! Every resource is counted on creation and on drop; see [`ResourceCounters`].

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use nix::errno::Errno;

use super::{
    AccessFlags, AddressVector, CmEvent, CmEventChannel, CmEventKind, CmFabric, CmId,
    CompletionChannel, CompletionQueue, CqId, DeviceContext, DeviceInfo, Fabric, Gid, Mtu,
    PortInfo, ProtectionDomain, QpCaps, QpTransition, QpType, RawQueuePair, RecvRequest,
    RegisteredMemory, SendRequest, Sge, WcOpcode, WcStatus, WorkCompletion, GRH_LEN,
    MULTICAST_QPN,
};
use crate::mr::AlignedBuffer;

const PORT: u8 = 1;
const GID_TABLE_LEN: u32 = 4;
const MAX_QP_WR: u32 = 16384;
const FIRST_QPN: u32 = 0x11;
const FIRST_EPHEMERAL_PORT: u16 = 20000;
const SOFT_VENDOR_PART_ID: u32 = 4099;

/// Kinds of resources the fabric hands out.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Resource {
    /// Device contexts.
    Context,
    /// Protection domains.
    Pd,
    /// Completion queues.
    Cq,
    /// Completion channels.
    Channel,
    /// Memory regions.
    Mr,
    /// Queue pairs.
    Qp,
    /// Address handles.
    Ah,
    /// Connection-manager event channels.
    EventChannel,
    /// Connection-manager ids.
    CmId,
}

impl Resource {
    /// Every kind, in a fixed order.
    pub const ALL: [Resource; 9] = [
        Resource::Context,
        Resource::Pd,
        Resource::Cq,
        Resource::Channel,
        Resource::Mr,
        Resource::Qp,
        Resource::Ah,
        Resource::EventChannel,
        Resource::CmId,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Creation and release counts for each kind of resource.
#[derive(Default, Debug)]
pub struct ResourceCounters {
    created: [AtomicUsize; 9],
    released: [AtomicUsize; 9],
}

impl ResourceCounters {
    fn create(&self, r: Resource) {
        self.created[r.index()].fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self, r: Resource) {
        self.released[r.index()].fetch_add(1, Ordering::SeqCst);
    }

    /// How many of `r` were ever created.
    pub fn created(&self, r: Resource) -> usize {
        self.created[r.index()].load(Ordering::SeqCst)
    }

    /// How many of `r` are still alive.
    pub fn live(&self, r: Resource) -> usize {
        self.created(r) - self.released[r.index()].load(Ordering::SeqCst)
    }

    /// Whether everything created has also been released.
    pub fn balanced(&self) -> bool {
        Resource::ALL.iter().all(|&r| self.live(r) == 0)
    }
}

#[derive(Clone, Debug)]
struct Device {
    info: DeviceInfo,
    lid: u16,
}

fn device_gid(device: usize, index: u32) -> Gid {
    let mut raw = [0u8; 16];
    raw[0] = 0xfe;
    raw[1] = 0x80;
    raw[8] = 0x02;
    raw[14] = device as u8;
    raw[15] = index as u8;
    Gid::from(raw)
}

fn gid_device(gid: &Gid) -> Option<usize> {
    let raw = gid.raw();
    if raw[..2] == [0xfe, 0x80] && raw[8] == 0x02 && u32::from(raw[15]) < GID_TABLE_LEN {
        Some(usize::from(raw[14]))
    } else {
        None
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Phase {
    Reset,
    Init,
    Rtr,
    Rts,
    Error,
}

struct MrEntry {
    addr: u64,
    len: usize,
    access: AccessFlags,
}

struct CqEntry {
    id: CqId,
    entries: VecDeque<(WorkCompletion, Option<(u32, u32)>)>,
    armed: bool,
    channel: Option<u64>,
    unacked: u32,
}

struct QpEntry {
    qp_type: QpType,
    phase: Phase,
    device: usize,
    send_cq: u64,
    recv_cq: u64,
    caps: QpCaps,
    qkey: u32,
    remote: Option<AddressVector>,
    dest_qpn: Option<u32>,
    recv_queue: VecDeque<RecvRequest>,
    parked: VecDeque<Vec<u8>>,
    outstanding: u32,
    unsignaled: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Link {
    Idle,
    Connected,
    Closed,
}

struct CmIdEntry {
    channel: u64,
    context: u64,
    device: Option<usize>,
    port: u16,
    listening: bool,
    peer: Option<u64>,
    qp: Option<u32>,
    dst: Option<SocketAddr>,
    link: Link,
}

struct PendingCm {
    kind: CmEventKind,
    status: i32,
    about: u64,
    request: Option<u64>,
}

struct State {
    devices: Vec<Device>,
    next_key: u64,
    next_qpn: u32,
    next_port: u16,
    mr_budget: Option<usize>,
    mrs: HashMap<u32, MrEntry>,
    cqs: HashMap<u64, CqEntry>,
    channels: HashMap<u64, Sender<(u64, CqId)>>,
    qps: HashMap<u32, QpEntry>,
    mcast: HashMap<Gid, BTreeSet<u32>>,
    cm_channels: HashMap<u64, Sender<PendingCm>>,
    cm_ids: HashMap<u64, CmIdEntry>,
    listeners: HashMap<u16, u64>,
}

enum Delivery {
    Done,
    NoReceiver,
    Unreachable,
}

impl State {
    fn new(devices: Vec<Device>) -> Self {
        Self {
            devices,
            next_key: 1,
            next_qpn: FIRST_QPN,
            next_port: FIRST_EPHEMERAL_PORT,
            mr_budget: None,
            mrs: HashMap::new(),
            cqs: HashMap::new(),
            channels: HashMap::new(),
            qps: HashMap::new(),
            mcast: HashMap::new(),
            cm_channels: HashMap::new(),
            cm_ids: HashMap::new(),
            listeners: HashMap::new(),
        }
    }

    fn key(&mut self) -> u64 {
        let k = self.next_key;
        self.next_key += 1;
        k
    }

    fn ephemeral_port(&mut self) -> u16 {
        loop {
            let p = self.next_port;
            self.next_port = self.next_port.checked_add(1).unwrap_or(FIRST_EPHEMERAL_PORT);
            if !self.listeners.contains_key(&p) {
                return p;
            }
        }
    }

    fn device_for(&self, ip: IpAddr) -> usize {
        match ip {
            IpAddr::V4(v4) if v4.is_loopback() => {
                let k = usize::from(v4.octets()[3]);
                if k >= 1 && k <= self.devices.len() {
                    k - 1
                } else {
                    0
                }
            }
            _ => 0,
        }
    }

    /// Finds a registered region covering `[addr, addr + len)`, checking `lkey` when given.
    fn region(&self, addr: u64, len: usize, lkey: Option<u32>, write: bool) -> bool {
        let covers = |mr: &MrEntry| {
            addr >= mr.addr
                && addr + len as u64 <= mr.addr + mr.len as u64
                && (!write || mr.access.contains(AccessFlags::LOCAL_WRITE))
        };
        match lkey {
            Some(k) => self.mrs.get(&k).map_or(false, covers),
            None => self.mrs.values().any(covers),
        }
    }

    fn read_payload(&self, sge: &Sge, inline: bool) -> Option<Vec<u8>> {
        let len = sge.length as usize;
        let lkey = if inline { None } else { Some(sge.lkey) };
        if len > 0 && !self.region(sge.addr, len, lkey, false) {
            return None;
        }
        let mut out = vec![0u8; len];
        if len > 0 {
            // the range lies inside a live registered buffer
            unsafe {
                std::ptr::copy(sge.addr as *const u8, out.as_mut_ptr(), len);
            }
        }
        Some(out)
    }

    fn push(&mut self, cq: u64, wc: WorkCompletion, release: Option<(u32, u32)>) {
        let Some(entry) = self.cqs.get_mut(&cq) else {
            log::debug!("completion for destroyed CQ dropped: {:?}", wc);
            return;
        };
        entry.entries.push_back((wc, release));
        if entry.armed {
            if let Some(ch) = entry.channel {
                entry.armed = false;
                let id = entry.id;
                if let Some(tx) = self.channels.get(&ch) {
                    if tx.send((cq, id)).is_err() {
                        log::debug!("completion event for closed channel {} dropped", ch);
                    }
                }
            }
        }
    }

    fn completion(qpn: u32, wr_id: u64, status: WcStatus, opcode: WcOpcode, len: usize) -> WorkCompletion {
        WorkCompletion {
            wr_id,
            status,
            opcode,
            byte_len: len as u32,
            qp_num: qpn,
            vendor_err: if status == WcStatus::Success { 0 } else { 0x81 },
        }
    }

    /// Moves `qpn` to ERROR and flushes its posted receives.
    fn flush(&mut self, qpn: u32) {
        let Some(qp) = self.qps.get_mut(&qpn) else {
            return;
        };
        qp.phase = Phase::Error;
        qp.parked.clear();
        let recv_cq = qp.recv_cq;
        let flushed: Vec<_> = qp.recv_queue.drain(..).collect();
        for wr in flushed {
            let wc = Self::completion(qpn, wr.wr_id, WcStatus::WrFlush, WcOpcode::Recv, 0);
            self.push(recv_cq, wc, None);
        }
    }

    fn reaches(&self, av: &AddressVector, device: usize) -> bool {
        match av.global {
            Some(g) => gid_device(&g.dgid) == Some(device),
            None => self.devices.get(device).map_or(false, |d| d.lid == av.dlid),
        }
    }

    fn deliver(&mut self, dst: u32, payload: &[u8], grh: Option<[u8; GRH_LEN]>) -> Delivery {
        let Some(qp) = self.qps.get_mut(&dst) else {
            return Delivery::Unreachable;
        };
        if !matches!(qp.phase, Phase::Rtr | Phase::Rts) {
            return Delivery::Unreachable;
        }
        let Some(wr) = qp.recv_queue.pop_front() else {
            return Delivery::NoReceiver;
        };
        let recv_cq = qp.recv_cq;
        let total = payload.len() + grh.map_or(0, |g| g.len());
        if (wr.sge.length as usize) < total {
            let wc = Self::completion(dst, wr.wr_id, WcStatus::LocalLength, WcOpcode::Recv, 0);
            self.push(recv_cq, wc, None);
            return Delivery::Done;
        }
        if !self.region(wr.sge.addr, total, Some(wr.sge.lkey), true) {
            let wc = Self::completion(dst, wr.wr_id, WcStatus::LocalProtection, WcOpcode::Recv, 0);
            self.push(recv_cq, wc, None);
            return Delivery::Done;
        }
        let mut at = wr.sge.addr as *mut u8;
        // both ranges were checked against live registered buffers above
        unsafe {
            if let Some(grh) = grh {
                std::ptr::copy(grh.as_ptr(), at, GRH_LEN);
                at = at.add(GRH_LEN);
            }
            std::ptr::copy(payload.as_ptr(), at, payload.len());
        }
        let wc = Self::completion(dst, wr.wr_id, WcStatus::Success, WcOpcode::Recv, total);
        self.push(recv_cq, wc, None);
        Delivery::Done
    }

    fn insert_qp(
        &mut self,
        device: usize,
        send_cq: u64,
        recv_cq: u64,
        qp_type: QpType,
        caps: QpCaps,
        phase: Phase,
    ) -> io::Result<u32> {
        if !self.cqs.contains_key(&send_cq) || !self.cqs.contains_key(&recv_cq) {
            return Err(Errno::EINVAL.into());
        }
        if caps.max_send_wr == 0
            || caps.max_send_wr > MAX_QP_WR
            || caps.max_recv_wr > MAX_QP_WR
            || caps.max_send_sge > 1
            || caps.max_recv_sge > 1
        {
            return Err(Errno::EINVAL.into());
        }
        let qpn = self.next_qpn;
        self.next_qpn = (self.next_qpn + 1) & 0xff_ffff;
        self.qps.insert(
            qpn,
            QpEntry {
                qp_type,
                phase,
                device,
                send_cq,
                recv_cq,
                caps,
                qkey: 0,
                remote: None,
                dest_qpn: None,
                recv_queue: VecDeque::new(),
                parked: VecDeque::new(),
                outstanding: 0,
                unsignaled: 0,
            },
        );
        Ok(qpn)
    }

    fn push_cm(&mut self, about: u64, kind: CmEventKind, status: i32, request: Option<u64>) {
        let Some(channel) = self.cm_ids.get(&about).map(|id| id.channel) else {
            return;
        };
        if let Some(tx) = self.cm_channels.get(&channel) {
            let pending = PendingCm {
                kind,
                status,
                about,
                request,
            };
            if tx.send(pending).is_err() {
                log::debug!("CM event {} for closed channel {} dropped", kind, channel);
            }
        }
    }
}

struct Inner {
    state: Mutex<State>,
    counters: ResourceCounters,
}

/// An in-process RDMA provider; see the module documentation.
#[derive(Clone)]
pub struct SoftFabric {
    inner: Arc<Inner>,
}

impl Default for SoftFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftFabric {
    /// A fabric with a single device, `soft0`, whose port has LID 1.
    pub fn new() -> Self {
        Self::with_devices(&[("soft0", 1)])
    }

    /// A fabric with one device per `(name, lid)` pair.
    ///
    /// With the connection manager, `127.0.0.k` resolves to the `k`th device (counting from 1);
    /// every other address resolves to the first.
    pub fn with_devices(devices: &[(&str, u16)]) -> Self {
        let devices = devices
            .iter()
            .map(|&(name, lid)| Device {
                info: DeviceInfo {
                    name: name.to_string(),
                    vendor_part_id: SOFT_VENDOR_PART_ID,
                },
                lid,
            })
            .collect();
        SoftFabric {
            inner: Arc::new(Inner {
                state: Mutex::new(State::new(devices)),
                counters: ResourceCounters::default(),
            }),
        }
    }

    /// Resource accounting for this fabric.
    pub fn counters(&self) -> &ResourceCounters {
        &self.inner.counters
    }

    /// Limits the total bytes that may be registered at once.
    pub fn limit_registered_bytes(&self, bytes: usize) {
        self.lock().mr_budget = Some(bytes);
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Fabric for SoftFabric {
    type Context = SoftContext;
    type Pd = SoftPd;
    type Cq = SoftCq;
    type Channel = SoftChannel;
    type Mr = SoftMr;
    type Qp = SoftQp;
    type Ah = SoftAh;

    fn devices(&self) -> io::Result<Vec<DeviceInfo>> {
        Ok(self.lock().devices.iter().map(|d| d.info.clone()).collect())
    }

    fn open(&self, device: &DeviceInfo) -> io::Result<SoftContext> {
        let index = self
            .lock()
            .devices
            .iter()
            .position(|d| d.info.name == device.name)
            .ok_or(Errno::ENODEV)?;
        self.inner.counters.create(Resource::Context);
        Ok(SoftContext {
            fabric: self.clone(),
            device: index,
            info: device.clone(),
            owned: true,
        })
    }
}

/// A device context on a [`SoftFabric`].
pub struct SoftContext {
    fabric: SoftFabric,
    device: usize,
    info: DeviceInfo,
    owned: bool,
}

impl Drop for SoftContext {
    fn drop(&mut self) {
        if self.owned {
            self.fabric.inner.counters.release(Resource::Context);
        }
    }
}

impl DeviceContext<SoftFabric> for SoftContext {
    fn device(&self) -> &DeviceInfo {
        &self.info
    }

    fn query_port(&self, port: u8) -> io::Result<PortInfo> {
        if port != PORT {
            return Err(Errno::EINVAL.into());
        }
        let st = self.fabric.lock();
        Ok(PortInfo {
            lid: st.devices[self.device].lid,
            active_mtu: Mtu::Mtu4096,
            gid_table_len: GID_TABLE_LEN,
        })
    }

    fn query_gid(&self, port: u8, index: u32) -> io::Result<Gid> {
        if port != PORT || index >= GID_TABLE_LEN {
            return Err(Errno::EINVAL.into());
        }
        Ok(device_gid(self.device, index))
    }

    fn alloc_pd(&self) -> io::Result<SoftPd> {
        self.fabric.inner.counters.create(Resource::Pd);
        Ok(SoftPd {
            fabric: self.fabric.clone(),
            device: self.device,
        })
    }

    fn create_channel(&self) -> io::Result<SoftChannel> {
        let (tx, events) = channel::unbounded();
        let key = {
            let mut st = self.fabric.lock();
            let key = st.key();
            st.channels.insert(key, tx);
            key
        };
        self.fabric.inner.counters.create(Resource::Channel);
        Ok(SoftChannel {
            fabric: self.fabric.clone(),
            key,
            events,
        })
    }

    fn create_cq(&self, depth: u32, channel: Option<&SoftChannel>, id: CqId) -> io::Result<SoftCq> {
        if depth == 0 || depth > MAX_QP_WR * 4 {
            return Err(Errno::EINVAL.into());
        }
        let key = {
            let mut st = self.fabric.lock();
            let key = st.key();
            st.cqs.insert(
                key,
                CqEntry {
                    id,
                    entries: VecDeque::new(),
                    armed: false,
                    channel: channel.map(|c| c.key),
                    unacked: 0,
                },
            );
            key
        };
        self.fabric.inner.counters.create(Resource::Cq);
        Ok(SoftCq {
            fabric: self.fabric.clone(),
            key,
            id,
        })
    }
}

/// A protection domain on a [`SoftFabric`].
pub struct SoftPd {
    fabric: SoftFabric,
    device: usize,
}

impl Drop for SoftPd {
    fn drop(&mut self) {
        self.fabric.inner.counters.release(Resource::Pd);
    }
}

impl ProtectionDomain<SoftFabric> for SoftPd {
    fn register(&self, buf: AlignedBuffer, access: AccessFlags) -> io::Result<SoftMr> {
        let lkey = {
            let mut st = self.fabric.lock();
            if let Some(budget) = st.mr_budget {
                let used: usize = st.mrs.values().map(|m| m.len).sum();
                if used + buf.len() > budget {
                    return Err(Errno::ENOMEM.into());
                }
            }
            let lkey = st.key() as u32;
            st.mrs.insert(
                lkey,
                MrEntry {
                    addr: buf.as_ptr() as u64,
                    len: buf.len(),
                    access,
                },
            );
            lkey
        };
        self.fabric.inner.counters.create(Resource::Mr);
        Ok(SoftMr {
            fabric: self.fabric.clone(),
            lkey,
            buf,
        })
    }

    fn create_qp(
        &self,
        send: &SoftCq,
        recv: &SoftCq,
        qp_type: QpType,
        caps: QpCaps,
    ) -> io::Result<SoftQp> {
        let qpn = self
            .fabric
            .lock()
            .insert_qp(self.device, send.key, recv.key, qp_type, caps, Phase::Reset)?;
        self.fabric.inner.counters.create(Resource::Qp);
        Ok(SoftQp {
            fabric: self.fabric.clone(),
            qpn,
        })
    }

    fn create_ah(&self, av: &AddressVector) -> io::Result<SoftAh> {
        if av.port != PORT {
            return Err(Errno::EINVAL.into());
        }
        self.fabric.inner.counters.create(Resource::Ah);
        Ok(SoftAh {
            fabric: self.fabric.clone(),
            av: *av,
        })
    }
}

/// A completion queue on a [`SoftFabric`].
pub struct SoftCq {
    fabric: SoftFabric,
    key: u64,
    id: CqId,
}

impl Drop for SoftCq {
    fn drop(&mut self) {
        if let Some(cq) = self.fabric.lock().cqs.remove(&self.key) {
            if cq.unacked > 0 {
                log::warn!("CQ {:?} destroyed with {} unacknowledged events", cq.id, cq.unacked);
            }
        }
        self.fabric.inner.counters.release(Resource::Cq);
    }
}

impl CompletionQueue for SoftCq {
    fn id(&self) -> CqId {
        self.id
    }

    fn poll(&self, out: &mut [WorkCompletion]) -> io::Result<usize> {
        let mut st = self.fabric.lock();
        let mut n = 0;
        while n < out.len() {
            let Some((wc, release)) = st.cqs.get_mut(&self.key).and_then(|cq| cq.entries.pop_front())
            else {
                break;
            };
            if let Some((qpn, slots)) = release {
                if let Some(qp) = st.qps.get_mut(&qpn) {
                    qp.outstanding = qp.outstanding.saturating_sub(slots);
                }
            }
            out[n] = wc;
            n += 1;
        }
        Ok(n)
    }

    fn req_notify(&self) -> io::Result<()> {
        let mut st = self.fabric.lock();
        let cq = st.cqs.get_mut(&self.key).ok_or(Errno::EINVAL)?;
        if cq.channel.is_none() {
            return Err(Errno::EINVAL.into());
        }
        cq.armed = true;
        Ok(())
    }

    fn ack_events(&self, n: u32) {
        if let Some(cq) = self.fabric.lock().cqs.get_mut(&self.key) {
            cq.unacked = cq.unacked.saturating_sub(n);
        }
    }
}

/// Waits up to `timeout` (forever if `None`) for the next item on `rx`.
fn next_event<T>(rx: &Receiver<T>, timeout: Option<Duration>) -> io::Result<Option<T>> {
    match timeout {
        None => rx.recv().map(Some).map_err(|_| Errno::EBADF.into()),
        Some(t) => match rx.recv_timeout(t) {
            Ok(ev) => Ok(Some(ev)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Errno::EBADF.into()),
        },
    }
}

/// A completion channel on a [`SoftFabric`].
pub struct SoftChannel {
    fabric: SoftFabric,
    key: u64,
    events: Receiver<(u64, CqId)>,
}

impl Drop for SoftChannel {
    fn drop(&mut self) {
        self.fabric.lock().channels.remove(&self.key);
        self.fabric.inner.counters.release(Resource::Channel);
    }
}

impl CompletionChannel for SoftChannel {
    fn get_event(&self, timeout: Option<Duration>) -> io::Result<Option<CqId>> {
        let Some((cq, id)) = next_event(&self.events, timeout)? else {
            return Ok(None);
        };
        if let Some(cq) = self.fabric.lock().cqs.get_mut(&cq) {
            cq.unacked += 1;
        }
        Ok(Some(id))
    }
}

/// A registered memory region on a [`SoftFabric`].
pub struct SoftMr {
    fabric: SoftFabric,
    lkey: u32,
    buf: AlignedBuffer,
}

impl Drop for SoftMr {
    fn drop(&mut self) {
        self.fabric.lock().mrs.remove(&self.lkey);
        self.fabric.inner.counters.release(Resource::Mr);
    }
}

impl RegisteredMemory for SoftMr {
    fn addr(&self) -> u64 {
        self.buf.as_ptr() as u64
    }

    fn len(&self) -> usize {
        self.buf.len()
    }

    fn lkey(&self) -> u32 {
        self.lkey
    }

    fn rkey(&self) -> u32 {
        self.lkey
    }

    fn write_at(&mut self, offset: usize, data: &[u8]) {
        // hold the fabric lock so a concurrent delivery into this buffer is ordered
        let _st = self.fabric.lock();
        self.buf.write_at(offset, data);
    }

    fn read_at(&self, offset: usize, out: &mut [u8]) {
        let _st = self.fabric.lock();
        self.buf.read_at(offset, out);
    }
}

/// A UD address handle on a [`SoftFabric`].
pub struct SoftAh {
    fabric: SoftFabric,
    av: AddressVector,
}

impl Drop for SoftAh {
    fn drop(&mut self) {
        self.fabric.inner.counters.release(Resource::Ah);
    }
}

/// A queue pair on a [`SoftFabric`].
pub struct SoftQp {
    fabric: SoftFabric,
    qpn: u32,
}

impl Drop for SoftQp {
    fn drop(&mut self) {
        {
            let mut st = self.fabric.lock();
            st.qps.remove(&self.qpn);
            for members in st.mcast.values_mut() {
                members.remove(&self.qpn);
            }
            st.mcast.retain(|_, m| !m.is_empty());
            for id in st.cm_ids.values_mut() {
                if id.qp == Some(self.qpn) {
                    id.qp = None;
                }
            }
        }
        self.fabric.inner.counters.release(Resource::Qp);
    }
}

impl SoftQp {
    fn grh(src_device: usize, dgid: Gid) -> [u8; GRH_LEN] {
        let mut grh = [0u8; GRH_LEN];
        grh[0] = 0x60;
        grh[8..24].copy_from_slice(device_gid(src_device, 0).raw());
        grh[24..40].copy_from_slice(dgid.raw());
        grh
    }

    fn send_ud(
        &self,
        st: &mut State,
        device: usize,
        wr: &SendRequest<'_, SoftAh>,
        payload: &[u8],
    ) -> io::Result<()> {
        let target = wr.ud.as_ref().ok_or(Errno::EINVAL)?;
        let av = target.ah.av;
        let dests: Vec<u32> = if target.remote_qpn == MULTICAST_QPN {
            match av.global {
                Some(g) => st
                    .mcast
                    .get(&g.dgid)
                    .map(|m| m.iter().copied().collect())
                    .unwrap_or_default(),
                None => Vec::new(),
            }
        } else {
            vec![target.remote_qpn]
        };
        for dst in dests {
            let Some(peer) = st.qps.get(&dst) else {
                continue;
            };
            if peer.qp_type != QpType::Ud || peer.qkey != target.remote_qkey {
                continue;
            }
            if target.remote_qpn != MULTICAST_QPN && !st.reaches(&av, peer.device) {
                continue;
            }
            let dgid = match av.global {
                Some(g) => g.dgid,
                None => device_gid(peer.device, 0),
            };
            let grh = Self::grh(device, dgid);
            // UD gives no delivery guarantee; anything that cannot be placed is dropped
            let _ = st.deliver(dst, payload, Some(grh));
        }
        Ok(())
    }
}

impl RawQueuePair<SoftFabric> for SoftQp {
    fn qp_num(&self) -> u32 {
        self.qpn
    }

    fn modify(&mut self, transition: &QpTransition) -> io::Result<()> {
        let mut st = self.fabric.lock();
        if let QpTransition::Error = transition {
            if !st.qps.contains_key(&self.qpn) {
                return Err(Errno::EINVAL.into());
            }
            st.flush(self.qpn);
            return Ok(());
        }
        let qp = st.qps.get_mut(&self.qpn).ok_or(Errno::EINVAL)?;
        match (qp.phase, transition) {
            (Phase::Reset, QpTransition::Init { port, qkey, .. }) => {
                if *port != PORT {
                    return Err(Errno::EINVAL.into());
                }
                if qp.qp_type == QpType::Ud {
                    qp.qkey = qkey.ok_or(Errno::EINVAL)?;
                }
                qp.phase = Phase::Init;
            }
            (
                Phase::Init,
                QpTransition::Rtr {
                    av,
                    path_mtu,
                    dest_qpn,
                    ..
                },
            ) => {
                if qp.qp_type != QpType::Ud {
                    if path_mtu.is_none() {
                        return Err(Errno::EINVAL.into());
                    }
                    qp.dest_qpn = Some(dest_qpn.ok_or(Errno::EINVAL)?);
                    qp.remote = Some(*av);
                }
                qp.phase = Phase::Rtr;
            }
            (Phase::Rtr, QpTransition::Rts { .. }) => qp.phase = Phase::Rts,
            _ => return Err(Errno::EINVAL.into()),
        }
        Ok(())
    }

    fn attach_mcast(&mut self, gid: &Gid, _lid: u16) -> io::Result<()> {
        let mut st = self.fabric.lock();
        let qp = st.qps.get(&self.qpn).ok_or(Errno::EINVAL)?;
        if qp.qp_type != QpType::Ud {
            return Err(Errno::EINVAL.into());
        }
        st.mcast.entry(*gid).or_default().insert(self.qpn);
        Ok(())
    }

    fn detach_mcast(&mut self, gid: &Gid, _lid: u16) -> io::Result<()> {
        let mut st = self.fabric.lock();
        let members = st.mcast.get_mut(gid).ok_or(Errno::EINVAL)?;
        if !members.remove(&self.qpn) {
            return Err(Errno::EINVAL.into());
        }
        if members.is_empty() {
            st.mcast.remove(gid);
        }
        Ok(())
    }

    fn post_send(&mut self, wr: &SendRequest<'_, SoftAh>) -> io::Result<()> {
        let mut st = self.fabric.lock();
        let qp = st.qps.get(&self.qpn).ok_or(Errno::EINVAL)?;
        if qp.phase != Phase::Rts {
            return Err(Errno::EINVAL.into());
        }
        if qp.outstanding >= qp.caps.max_send_wr {
            return Err(Errno::ENOMEM.into());
        }
        if wr.inline && wr.sge.length > qp.caps.max_inline_data {
            return Err(Errno::EINVAL.into());
        }
        if qp.qp_type == QpType::Ud && wr.ud.is_none() {
            return Err(Errno::EINVAL.into());
        }
        let (qp_type, device, send_cq, dest, remote) =
            (qp.qp_type, qp.device, qp.send_cq, qp.dest_qpn, qp.remote);

        let Some(payload) = st.read_payload(&wr.sge, wr.inline) else {
            let slots = st.qps.get_mut(&self.qpn).map_or(1, |q| {
                q.unsignaled = 0;
                q.outstanding += 1;
                q.outstanding
            });
            let wc = State::completion(self.qpn, wr.wr_id, WcStatus::LocalProtection, WcOpcode::Send, 0);
            st.push(send_cq, wc, Some((self.qpn, slots)));
            st.flush(self.qpn);
            return Ok(());
        };

        if let Some(q) = st.qps.get_mut(&self.qpn) {
            q.outstanding += 1;
        }

        let mut failed = false;
        match qp_type {
            QpType::Ud => self.send_ud(&mut *st, device, wr, &payload)?,
            QpType::Rc | QpType::Uc => {
                let reachable = match (dest, remote) {
                    (Some(dst), Some(av)) => st
                        .qps
                        .get(&dst)
                        .map_or(false, |peer| st.reaches(&av, peer.device)),
                    _ => false,
                };
                let outcome = match dest {
                    Some(dst) if reachable => st.deliver(dst, &payload, None),
                    _ => Delivery::Unreachable,
                };
                match (qp_type, outcome) {
                    (_, Delivery::Done) => {}
                    (QpType::Rc, Delivery::NoReceiver) => {
                        if let Some(peer) = dest.and_then(|d| st.qps.get_mut(&d)) {
                            peer.parked.push_back(payload);
                        }
                    }
                    (QpType::Rc, Delivery::Unreachable) => failed = true,
                    _ => log::trace!("unreliable send from QP {:#x} dropped", self.qpn),
                }
            }
        }

        let qp = st.qps.get_mut(&self.qpn).ok_or(Errno::EINVAL)?;
        if failed {
            let slots = qp.outstanding;
            qp.unsignaled = 0;
            let wc = State::completion(self.qpn, wr.wr_id, WcStatus::RetryExceeded, WcOpcode::Send, 0);
            st.push(send_cq, wc, Some((self.qpn, slots)));
            st.flush(self.qpn);
        } else if wr.signaled {
            let slots = qp.unsignaled + 1;
            qp.unsignaled = 0;
            let len = wr.sge.length as usize;
            let wc = State::completion(self.qpn, wr.wr_id, WcStatus::Success, WcOpcode::Send, len);
            st.push(send_cq, wc, Some((self.qpn, slots)));
        } else {
            qp.unsignaled += 1;
        }
        Ok(())
    }

    fn post_recv(&mut self, wr: &RecvRequest) -> io::Result<()> {
        let mut st = self.fabric.lock();
        let qp = st.qps.get(&self.qpn).ok_or(Errno::EINVAL)?;
        if matches!(qp.phase, Phase::Reset) {
            return Err(Errno::EINVAL.into());
        }
        if qp.recv_queue.len() >= qp.caps.max_recv_wr as usize {
            return Err(Errno::ENOMEM.into());
        }
        let (recv_cq, phase) = (qp.recv_cq, qp.phase);
        if !st.region(wr.sge.addr, wr.sge.length as usize, Some(wr.sge.lkey), true) {
            let wc = State::completion(self.qpn, wr.wr_id, WcStatus::LocalProtection, WcOpcode::Recv, 0);
            st.push(recv_cq, wc, None);
            return Ok(());
        }
        if phase == Phase::Error {
            let wc = State::completion(self.qpn, wr.wr_id, WcStatus::WrFlush, WcOpcode::Recv, 0);
            st.push(recv_cq, wc, None);
            return Ok(());
        }
        let parked = {
            let qp = st.qps.get_mut(&self.qpn).ok_or(Errno::EINVAL)?;
            qp.recv_queue.push_back(*wr);
            qp.parked.pop_front()
        };
        if let Some(msg) = parked {
            let _ = st.deliver(self.qpn, &msg, None);
        }
        Ok(())
    }
}

impl CmFabric for SoftFabric {
    type EventChannel = SoftEventChannel;
    type CmId = SoftCmId;

    fn create_event_channel(&self) -> io::Result<SoftEventChannel> {
        let (tx, events) = channel::unbounded();
        let key = {
            let mut st = self.lock();
            let key = st.key();
            st.cm_channels.insert(key, tx);
            key
        };
        self.inner.counters.create(Resource::EventChannel);
        Ok(SoftEventChannel {
            fabric: self.clone(),
            key,
            events,
        })
    }
}

/// A connection-manager event channel on a [`SoftFabric`].
pub struct SoftEventChannel {
    fabric: SoftFabric,
    key: u64,
    events: Receiver<PendingCm>,
}

impl Drop for SoftEventChannel {
    fn drop(&mut self) {
        let mut orphans = 0;
        {
            let mut st = self.fabric.lock();
            st.cm_channels.remove(&self.key);
            // requests nobody picked up own ids that must go with the channel
            for k in self.events.try_iter().filter_map(|ev| ev.request) {
                st.cm_ids.remove(&k);
                orphans += 1;
            }
        }
        for _ in 0..orphans {
            self.fabric.inner.counters.release(Resource::CmId);
        }
        self.fabric.inner.counters.release(Resource::EventChannel);
    }
}

impl CmEventChannel<SoftFabric> for SoftEventChannel {
    fn create_id(&self, context: u64) -> io::Result<SoftCmId> {
        let key = {
            let mut st = self.fabric.lock();
            let key = st.key();
            st.cm_ids.insert(
                key,
                CmIdEntry {
                    channel: self.key,
                    context,
                    device: None,
                    port: 0,
                    listening: false,
                    peer: None,
                    qp: None,
                    dst: None,
                    link: Link::Idle,
                },
            );
            key
        };
        self.fabric.inner.counters.create(Resource::CmId);
        Ok(SoftCmId {
            fabric: self.fabric.clone(),
            key,
        })
    }

    fn get_event(&self, timeout: Option<Duration>) -> io::Result<Option<CmEvent<SoftCmId>>> {
        let Some(ev) = next_event(&self.events, timeout)? else {
            return Ok(None);
        };
        let context = self
            .fabric
            .lock()
            .cm_ids
            .get(&ev.about)
            .map_or(0, |id| id.context);
        Ok(Some(CmEvent {
            kind: ev.kind,
            status: ev.status,
            context,
            request: ev.request.map(|key| SoftCmId {
                fabric: self.fabric.clone(),
                key,
            }),
        }))
    }
}

/// A connection-manager id on a [`SoftFabric`].
pub struct SoftCmId {
    fabric: SoftFabric,
    key: u64,
}

impl SoftCmId {
    fn with<T>(&self, f: impl FnOnce(&mut State, u64) -> io::Result<T>) -> io::Result<T> {
        let mut st = self.fabric.lock();
        if !st.cm_ids.contains_key(&self.key) {
            return Err(Errno::EBADF.into());
        }
        f(&mut *st, self.key)
    }
}

fn link_qps(st: &mut State, a: u32, b: u32) -> io::Result<()> {
    let lid_of = |st: &State, qpn: u32| {
        st.qps
            .get(&qpn)
            .and_then(|qp| st.devices.get(qp.device))
            .map(|d| d.lid)
            .ok_or(Errno::EINVAL)
    };
    let (lid_a, lid_b) = (lid_of(st, a)?, lid_of(st, b)?);
    for (qpn, peer, dlid) in [(a, b, lid_b), (b, a, lid_a)] {
        let qp = st.qps.get_mut(&qpn).ok_or(Errno::EINVAL)?;
        qp.dest_qpn = Some(peer);
        qp.remote = Some(AddressVector {
            dlid,
            sl: 0,
            port: PORT,
            global: None,
        });
        qp.phase = Phase::Rts;
    }
    Ok(())
}

impl Drop for SoftCmId {
    fn drop(&mut self) {
        {
            let mut st = self.fabric.lock();
            if let Some(id) = st.cm_ids.remove(&self.key) {
                if id.listening && st.listeners.get(&id.port) == Some(&self.key) {
                    st.listeners.remove(&id.port);
                }
                if id.link == Link::Connected {
                    if let Some(qpn) = id.qp {
                        st.flush(qpn);
                    }
                    if let Some(peer) = id.peer {
                        let peer_qp = st.cm_ids.get_mut(&peer).and_then(|p| {
                            p.link = Link::Closed;
                            p.qp
                        });
                        if let Some(qpn) = peer_qp {
                            st.flush(qpn);
                        }
                        st.push_cm(peer, CmEventKind::Disconnected, 0, None);
                    }
                }
            }
        }
        self.fabric.inner.counters.release(Resource::CmId);
    }
}

impl CmId<SoftFabric> for SoftCmId {
    fn set_context(&mut self, context: u64) {
        if let Some(id) = self.fabric.lock().cm_ids.get_mut(&self.key) {
            id.context = context;
        }
    }

    fn device(&self) -> Option<DeviceInfo> {
        let st = self.fabric.lock();
        let d = st.cm_ids.get(&self.key)?.device?;
        st.devices.get(d).map(|d| d.info.clone())
    }

    fn context(&self) -> io::Result<SoftContext> {
        let st = self.fabric.lock();
        let device = st
            .cm_ids
            .get(&self.key)
            .and_then(|id| id.device)
            .ok_or(Errno::ENODEV)?;
        let info = st.devices[device].info.clone();
        Ok(SoftContext {
            fabric: self.fabric.clone(),
            device,
            info,
            owned: false,
        })
    }

    fn bind_addr(&mut self, addr: SocketAddr) -> io::Result<()> {
        self.with(|st, key| {
            let port = match addr.port() {
                0 => st.ephemeral_port(),
                p if st.listeners.contains_key(&p) => return Err(Errno::EADDRINUSE.into()),
                p => p,
            };
            let device = (!addr.ip().is_unspecified()).then(|| st.device_for(addr.ip()));
            let id = st.cm_ids.get_mut(&key).ok_or(Errno::EBADF)?;
            id.port = port;
            id.device = device;
            Ok(())
        })
    }

    fn listen(&mut self, _backlog: i32) -> io::Result<()> {
        self.with(|st, key| {
            let port = st.cm_ids.get(&key).map_or(0, |id| id.port);
            if port == 0 {
                return Err(Errno::EINVAL.into());
            }
            if st.listeners.contains_key(&port) {
                return Err(Errno::EADDRINUSE.into());
            }
            st.listeners.insert(port, key);
            if let Some(id) = st.cm_ids.get_mut(&key) {
                id.listening = true;
            }
            Ok(())
        })
    }

    fn local_port(&self) -> u16 {
        self.fabric
            .lock()
            .cm_ids
            .get(&self.key)
            .map_or(0, |id| id.port)
    }

    fn resolve_addr(&mut self, dst: SocketAddr, _timeout: Duration) -> io::Result<()> {
        self.with(|st, key| {
            let device = st.device_for(dst.ip());
            let port = match st.cm_ids.get(&key).map_or(0, |id| id.port) {
                0 => st.ephemeral_port(),
                p => p,
            };
            let id = st.cm_ids.get_mut(&key).ok_or(Errno::EBADF)?;
            id.device = Some(device);
            id.dst = Some(dst);
            id.port = port;
            st.push_cm(key, CmEventKind::AddrResolved, 0, None);
            Ok(())
        })
    }

    fn resolve_route(&mut self, _timeout: Duration) -> io::Result<()> {
        self.with(|st, key| {
            if st.cm_ids.get(&key).and_then(|id| id.dst).is_none() {
                return Err(Errno::EINVAL.into());
            }
            st.push_cm(key, CmEventKind::RouteResolved, 0, None);
            Ok(())
        })
    }

    fn create_qp(&mut self, pd: &SoftPd, cq: &SoftCq, caps: QpCaps) -> io::Result<SoftQp> {
        let qpn = self.with(|st, key| {
            let device = st.cm_ids.get(&key).and_then(|id| id.device);
            if device != Some(pd.device) {
                return Err(Errno::EINVAL.into());
            }
            let qpn = st.insert_qp(pd.device, cq.key, cq.key, QpType::Rc, caps, Phase::Init)?;
            if let Some(id) = st.cm_ids.get_mut(&key) {
                id.qp = Some(qpn);
            }
            Ok(qpn)
        })?;
        self.fabric.inner.counters.create(Resource::Qp);
        Ok(SoftQp {
            fabric: self.fabric.clone(),
            qpn,
        })
    }

    fn accept(&mut self) -> io::Result<()> {
        self.with(|st, key| {
            let (peer, qp) = st
                .cm_ids
                .get(&key)
                .and_then(|id| Some((id.peer?, id.qp?)))
                .ok_or(Errno::EINVAL)?;
            let peer_qp = st.cm_ids.get(&peer).and_then(|p| p.qp).ok_or(Errno::ECONNRESET)?;
            link_qps(st, qp, peer_qp)?;
            for k in [key, peer] {
                if let Some(id) = st.cm_ids.get_mut(&k) {
                    id.link = Link::Connected;
                }
                st.push_cm(k, CmEventKind::Established, 0, None);
            }
            Ok(())
        })
    }

    fn connect(&mut self) -> io::Result<()> {
        let created = self.with(|st, key| {
            let (dst, context_device) = st
                .cm_ids
                .get(&key)
                .and_then(|id| Some((id.dst?, id.device)))
                .ok_or(Errno::EINVAL)?;
            if st.cm_ids.get(&key).and_then(|id| id.qp).is_none() {
                return Err(Errno::EINVAL.into());
            }
            let Some(&listener) = st.listeners.get(&dst.port()) else {
                st.push_cm(key, CmEventKind::Rejected, Errno::ECONNREFUSED as i32, None);
                return Ok(false);
            };
            let (channel, context) = st
                .cm_ids
                .get(&listener)
                .map(|l| (l.channel, l.context))
                .ok_or(Errno::ECONNREFUSED)?;
            let server = st.key();
            st.cm_ids.insert(
                server,
                CmIdEntry {
                    channel,
                    context,
                    device: context_device,
                    port: dst.port(),
                    listening: false,
                    peer: Some(key),
                    qp: None,
                    dst: None,
                    link: Link::Idle,
                },
            );
            if let Some(id) = st.cm_ids.get_mut(&key) {
                id.peer = Some(server);
            }
            st.push_cm(server, CmEventKind::ConnectRequest, 0, Some(server));
            Ok(true)
        })?;
        if created {
            self.fabric.inner.counters.create(Resource::CmId);
        }
        Ok(())
    }

    fn disconnect(&mut self) -> io::Result<()> {
        self.with(|st, key| {
            let (link, qp, peer) = st
                .cm_ids
                .get(&key)
                .map(|id| (id.link, id.qp, id.peer))
                .ok_or(Errno::EBADF)?;
            match link {
                Link::Idle => Err(Errno::EINVAL.into()),
                Link::Closed => Ok(()),
                Link::Connected => {
                    let peer_qp = peer.and_then(|p| st.cm_ids.get(&p)).and_then(|p| p.qp);
                    for qpn in qp.into_iter().chain(peer_qp) {
                        st.flush(qpn);
                    }
                    for k in std::iter::once(key).chain(peer) {
                        if let Some(id) = st.cm_ids.get_mut(&k) {
                            id.link = Link::Closed;
                        }
                        st.push_cm(k, CmEventKind::Disconnected, 0, None);
                    }
                    Ok(())
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::{GlobalRoute, UdTarget, UD_QKEY};

    struct Node {
        _ctx: SoftContext,
        pd: SoftPd,
        cq: SoftCq,
        mr: SoftMr,
        qp: SoftQp,
    }

    fn caps(depth: u32) -> QpCaps {
        QpCaps {
            max_send_wr: depth,
            max_recv_wr: depth,
            max_send_sge: 1,
            max_recv_sge: 1,
            max_inline_data: 64,
        }
    }

    fn node(fabric: &SoftFabric, qp_type: QpType, depth: u32) -> Node {
        let dev = fabric.devices().unwrap().remove(0);
        let ctx = fabric.open(&dev).unwrap();
        let pd = ctx.alloc_pd().unwrap();
        let cq = ctx.create_cq(64, None, CqId(0)).unwrap();
        let mr = pd
            .register(AlignedBuffer::new(256).unwrap(), AccessFlags::LOCAL_WRITE)
            .unwrap();
        let mut qp = pd.create_qp(&cq, &cq, qp_type, caps(depth)).unwrap();
        qp.modify(&QpTransition::Init {
            port: 1,
            access: None,
            qkey: Some(UD_QKEY),
        })
        .unwrap();
        Node {
            _ctx: ctx,
            pd,
            cq,
            mr,
            qp,
        }
    }

    fn connect(a: &mut Node, b: &Node) {
        a.qp
            .modify(&QpTransition::Rtr {
                av: AddressVector {
                    dlid: 1,
                    sl: 0,
                    port: 1,
                    global: None,
                },
                path_mtu: Some(Mtu::Mtu2048),
                dest_qpn: Some(b.qp.qp_num()),
                rq_psn: Some(0),
                max_dest_rd_atomic: None,
                min_rnr_timer: None,
            })
            .unwrap();
        a.qp
            .modify(&QpTransition::Rts {
                sq_psn: 0,
                timeout: None,
                retry_cnt: None,
                rnr_retry: None,
                max_rd_atomic: None,
            })
            .unwrap();
    }

    fn send(n: &mut Node, offset: usize, len: u32, signaled: bool) -> io::Result<()> {
        let sge = Sge {
            addr: n.mr.addr() + offset as u64,
            length: len,
            lkey: n.mr.lkey(),
        };
        n.qp.post_send(&SendRequest {
            wr_id: 1,
            sge,
            signaled,
            inline: false,
            ud: None,
        })
    }

    fn recv(n: &mut Node, len: u32) {
        let sge = Sge {
            addr: n.mr.addr(),
            length: len,
            lkey: n.mr.lkey(),
        };
        n.qp.post_recv(&RecvRequest { wr_id: 2, sge }).unwrap();
    }

    fn poll_all(cq: &SoftCq) -> Vec<WorkCompletion> {
        let mut wc = [WorkCompletion {
            wr_id: 0,
            status: WcStatus::Success,
            opcode: WcOpcode::Send,
            byte_len: 0,
            qp_num: 0,
            vendor_err: 0,
        }; 16];
        let n = cq.poll(&mut wc).unwrap();
        wc[..n].to_vec()
    }

    #[test]
    fn rc_send_lands_in_posted_receive() {
        let fabric = SoftFabric::new();
        let mut a = node(&fabric, QpType::Rc, 8);
        let mut b = node(&fabric, QpType::Rc, 8);
        connect(&mut a, &b);
        connect(&mut b, &a);
        a.mr.write_at(128, b"hello");
        recv(&mut b, 128);
        send(&mut a, 128, 5, true).unwrap();

        let got = poll_all(&b.cq);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].opcode, WcOpcode::Recv);
        assert_eq!(got[0].byte_len, 5);
        let mut out = [0u8; 5];
        b.mr.read_at(0, &mut out);
        assert_eq!(&out, b"hello");

        let sent = poll_all(&a.cq);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].opcode, WcOpcode::Send);
    }

    #[test]
    fn rc_send_waits_for_a_receive() {
        let fabric = SoftFabric::new();
        let mut a = node(&fabric, QpType::Rc, 8);
        let mut b = node(&fabric, QpType::Rc, 8);
        connect(&mut a, &b);
        connect(&mut b, &a);
        send(&mut a, 128, 4, false).unwrap();
        assert!(poll_all(&b.cq).is_empty());
        recv(&mut b, 128);
        assert_eq!(poll_all(&b.cq).len(), 1);
    }

    #[test]
    fn unsignaled_sends_exhaust_the_send_queue() {
        let fabric = SoftFabric::new();
        let mut a = node(&fabric, QpType::Uc, 4);
        let mut b = node(&fabric, QpType::Uc, 4);
        connect(&mut a, &b);
        connect(&mut b, &a);
        for _ in 0..4 {
            send(&mut a, 128, 1, false).unwrap();
        }
        let err = send(&mut a, 128, 1, false).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(Errno::ENOMEM as i32));
    }

    #[test]
    fn polling_a_signaled_send_frees_earlier_slots() {
        let fabric = SoftFabric::new();
        let mut a = node(&fabric, QpType::Uc, 4);
        let mut b = node(&fabric, QpType::Uc, 4);
        connect(&mut a, &b);
        connect(&mut b, &a);
        for _ in 0..3 {
            send(&mut a, 128, 1, false).unwrap();
        }
        send(&mut a, 128, 1, true).unwrap();
        assert_eq!(poll_all(&a.cq).len(), 1);
        for _ in 0..4 {
            send(&mut a, 128, 1, false).unwrap();
        }
    }

    #[test]
    fn send_to_vanished_peer_exceeds_retries() {
        let fabric = SoftFabric::new();
        let mut a = node(&fabric, QpType::Rc, 8);
        let b = node(&fabric, QpType::Rc, 8);
        connect(&mut a, &b);
        recv(&mut a, 64);
        drop(b);
        send(&mut a, 128, 1, false).unwrap();
        let wcs = poll_all(&a.cq);
        assert!(wcs.iter().any(|wc| wc.status == WcStatus::RetryExceeded));
        assert!(wcs.iter().any(|wc| wc.status == WcStatus::WrFlush));
        assert!(send(&mut a, 128, 1, true).is_err());
    }

    #[test]
    fn post_send_before_rts_is_rejected() {
        let fabric = SoftFabric::new();
        let mut a = node(&fabric, QpType::Rc, 8);
        assert!(send(&mut a, 128, 1, true).is_err());
    }

    #[test]
    fn ud_receive_carries_a_grh() {
        let fabric = SoftFabric::new();
        let mut a = node(&fabric, QpType::Ud, 8);
        let mut b = node(&fabric, QpType::Ud, 8);
        connect(&mut a, &b);
        connect(&mut b, &a);
        recv(&mut b, 128);
        let ah = a
            .pd
            .create_ah(&AddressVector {
                dlid: 1,
                sl: 0,
                port: 1,
                global: None,
            })
            .unwrap();
        a.mr.write_at(200, &[7; 8]);
        a.qp.post_send(&SendRequest {
            wr_id: 1,
            sge: Sge {
                addr: a.mr.addr() + 200,
                length: 8,
                lkey: a.mr.lkey(),
            },
            signaled: false,
            inline: true,
            ud: Some(UdTarget {
                ah: &ah,
                remote_qpn: b.qp.qp_num(),
                remote_qkey: UD_QKEY,
            }),
        })
        .unwrap();
        let got = poll_all(&b.cq);
        assert_eq!(got[0].byte_len as usize, 8 + GRH_LEN);
        let mut payload = [0u8; 8];
        b.mr.read_at(GRH_LEN, &mut payload);
        assert_eq!(payload, [7; 8]);
    }

    #[test]
    fn multicast_reaches_every_member() {
        let fabric = SoftFabric::new();
        let mut a = node(&fabric, QpType::Ud, 8);
        let mut b = node(&fabric, QpType::Ud, 8);
        let mut c = node(&fabric, QpType::Ud, 8);
        let group = Gid::from([0xff, 1, 0, 0, 0, 2, 201, 133, 0, 0, 0, 1, 0, 0, 0, 0]);
        for n in [&mut a, &mut b, &mut c] {
            connect_ud(n);
        }
        b.qp.attach_mcast(&group, 0xc001).unwrap();
        c.qp.attach_mcast(&group, 0xc001).unwrap();
        recv(&mut b, 128);
        recv(&mut c, 128);
        let ah = a
            .pd
            .create_ah(&AddressVector {
                dlid: 0xc001,
                sl: 0,
                port: 1,
                global: Some(GlobalRoute {
                    dgid: group,
                    sgid_index: 0,
                    hop_limit: 1,
                }),
            })
            .unwrap();
        a.qp.post_send(&SendRequest {
            wr_id: 1,
            sge: Sge {
                addr: a.mr.addr() + 200,
                length: 2,
                lkey: a.mr.lkey(),
            },
            signaled: true,
            inline: false,
            ud: Some(UdTarget {
                ah: &ah,
                remote_qpn: MULTICAST_QPN,
                remote_qkey: UD_QKEY,
            }),
        })
        .unwrap();
        assert_eq!(poll_all(&b.cq).len(), 1);
        assert_eq!(poll_all(&c.cq).len(), 1);
        b.qp.detach_mcast(&group, 0xc001).unwrap();
        assert!(b.qp.detach_mcast(&group, 0xc001).is_err());
    }

    fn connect_ud(n: &mut Node) {
        n.qp
            .modify(&QpTransition::Rtr {
                av: AddressVector {
                    dlid: 0,
                    sl: 0,
                    port: 1,
                    global: None,
                },
                path_mtu: None,
                dest_qpn: None,
                rq_psn: None,
                max_dest_rd_atomic: None,
                min_rnr_timer: None,
            })
            .unwrap();
        n.qp
            .modify(&QpTransition::Rts {
                sq_psn: 0,
                timeout: None,
                retry_cnt: None,
                rnr_retry: None,
                max_rd_atomic: None,
            })
            .unwrap();
    }

    #[test]
    fn armed_cq_fires_once() {
        let fabric = SoftFabric::new();
        let dev = fabric.devices().unwrap().remove(0);
        let ctx = fabric.open(&dev).unwrap();
        let pd = ctx.alloc_pd().unwrap();
        let ch = ctx.create_channel().unwrap();
        let cq = ctx.create_cq(8, Some(&ch), CqId(42)).unwrap();
        let mr = pd
            .register(AlignedBuffer::new(64).unwrap(), AccessFlags::LOCAL_WRITE)
            .unwrap();
        let mut qp = pd.create_qp(&cq, &cq, QpType::Rc, caps(4)).unwrap();
        qp.modify(&QpTransition::Init {
            port: 1,
            access: None,
            qkey: None,
        })
        .unwrap();
        cq.req_notify().unwrap();
        let sge = Sge {
            addr: mr.addr() + 100,
            length: 4,
            lkey: mr.lkey(),
        };
        // out of range; completes with a protection error, which still fires the channel
        qp.post_recv(&RecvRequest { wr_id: 9, sge }).unwrap();
        assert_eq!(ch.get_event(Some(Duration::from_millis(10))).unwrap(), Some(CqId(42)));
        cq.ack_events(1);
        assert_eq!(ch.get_event(Some(Duration::from_millis(10))).unwrap(), None);
    }

    #[test]
    fn every_resource_is_released() {
        let fabric = SoftFabric::new();
        {
            let mut a = node(&fabric, QpType::Rc, 8);
            let b = node(&fabric, QpType::Rc, 8);
            connect(&mut a, &b);
            assert_eq!(fabric.counters().live(Resource::Qp), 2);
        }
        assert!(fabric.counters().balanced());
        assert_eq!(fabric.counters().created(Resource::Mr), 2);
    }

    #[test]
    fn registration_budget() {
        let fabric = SoftFabric::new();
        fabric.limit_registered_bytes(8192);
        let dev = fabric.devices().unwrap().remove(0);
        let ctx = fabric.open(&dev).unwrap();
        let pd = ctx.alloc_pd().unwrap();
        let big = AlignedBuffer::new(1 << 20).unwrap();
        let err = pd.register(big, AccessFlags::LOCAL_WRITE).err().unwrap();
        assert_eq!(err.raw_os_error(), Some(Errno::ENOMEM as i32));
    }

    #[test]
    fn cm_connect_accept_disconnect() {
        let fabric = SoftFabric::new();
        let dev = fabric.devices().unwrap().remove(0);
        let ctx = fabric.open(&dev).unwrap();
        let pd = ctx.alloc_pd().unwrap();
        let scq = ctx.create_cq(8, None, CqId(1)).unwrap();
        let ccq = ctx.create_cq(8, None, CqId(2)).unwrap();

        let sch = fabric.create_event_channel().unwrap();
        let cch = fabric.create_event_channel().unwrap();
        let mut listener = sch.create_id(0).unwrap();
        listener.bind_addr("0.0.0.0:0".parse().unwrap()).unwrap();
        listener.listen(10).unwrap();
        let port = listener.local_port();
        assert_ne!(port, 0);

        let mut client = cch.create_id(7).unwrap();
        let dst = SocketAddr::from(([127, 0, 0, 1], port));
        client.resolve_addr(dst, Duration::from_secs(1)).unwrap();
        let ev = cch.get_event(None).unwrap().unwrap();
        assert_eq!(ev.kind, CmEventKind::AddrResolved);
        assert_eq!(ev.context, 7);
        client.resolve_route(Duration::from_secs(1)).unwrap();
        assert_eq!(cch.get_event(None).unwrap().unwrap().kind, CmEventKind::RouteResolved);
        let _cqp = client.create_qp(&pd, &ccq, caps(4)).unwrap();
        client.connect().unwrap();

        let ev = sch.get_event(None).unwrap().unwrap();
        assert_eq!(ev.kind, CmEventKind::ConnectRequest);
        let mut conn = ev.request.unwrap();
        assert_eq!(conn.device().unwrap().name, "soft0");
        let _sqp = conn.create_qp(&pd, &scq, caps(4)).unwrap();
        conn.accept().unwrap();
        assert_eq!(sch.get_event(None).unwrap().unwrap().kind, CmEventKind::Established);
        assert_eq!(cch.get_event(None).unwrap().unwrap().kind, CmEventKind::Established);

        client.disconnect().unwrap();
        assert_eq!(sch.get_event(None).unwrap().unwrap().kind, CmEventKind::Disconnected);
        assert_eq!(cch.get_event(None).unwrap().unwrap().kind, CmEventKind::Disconnected);
        conn.disconnect().unwrap();
    }

    #[test]
    fn connect_without_listener_is_rejected() {
        let fabric = SoftFabric::new();
        let dev = fabric.devices().unwrap().remove(0);
        let ctx = fabric.open(&dev).unwrap();
        let pd = ctx.alloc_pd().unwrap();
        let cq = ctx.create_cq(8, None, CqId(1)).unwrap();
        let ch = fabric.create_event_channel().unwrap();
        let mut id = ch.create_id(0).unwrap();
        id.resolve_addr("127.0.0.1:4".parse().unwrap(), Duration::from_secs(1))
            .unwrap();
        let _qp = id.create_qp(&pd, &cq, caps(2)).unwrap();
        id.connect().unwrap();
        let kinds: Vec<_> = std::iter::from_fn(|| {
            ch.get_event(Some(Duration::from_millis(10))).unwrap().map(|e| e.kind)
        })
        .collect();
        assert_eq!(kinds, [CmEventKind::AddrResolved, CmEventKind::Rejected]);
    }
}
