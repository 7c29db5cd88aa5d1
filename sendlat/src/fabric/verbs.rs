//! The `libibverbs` provider.
//!
//! Every handle wraps the raw pointer returned by the corresponding `ibv_*` constructor and
//! destroys it on drop. Handles that other handles depend on are shared through an `Arc`, so a
//! memory region keeps its protection domain alive, a CQ keeps its channel alive, and everything
//! keeps the device context alive.
//!
//! The data path (`poll_cq`, `req_notify_cq`, `post_send`, `post_recv`) goes through the
//! provider's `ops` table, since those verbs are inline functions in `verbs.h` that bindgen does
//! not see.

use std::ffi::CStr;
use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::os::raw::c_void;
use std::ptr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::mr::AlignedBuffer;

use super::{
    AccessFlags, AddressVector, CompletionChannel, CompletionQueue, CqId, DeviceContext,
    DeviceInfo, Fabric, Gid, Mtu, PortInfo, ProtectionDomain, QpCaps, QpTransition, QpType,
    RawQueuePair, RecvRequest, RegisteredMemory, SendRequest, WcOpcode, WcStatus, WorkCompletion,
};

/// Completions read per `poll_cq` call.
const POLL_BATCH: usize = 16;

/// The provider on top of `libibverbs` and `librdmacm`.
#[derive(Copy, Clone, Debug, Default)]
pub struct VerbsFabric;

struct DeviceList {
    list: *mut *mut ffi::ibv_device,
    len: usize,
}

impl DeviceList {
    fn get() -> io::Result<Self> {
        let mut n = 0i32;
        let list = unsafe { ffi::ibv_get_device_list(&mut n as *mut _) };
        if list.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(DeviceList {
            list,
            len: n.max(0) as usize,
        })
    }

    fn iter(&self) -> impl Iterator<Item = *mut ffi::ibv_device> + '_ {
        (0..self.len).map(move |i| unsafe { *self.list.add(i) })
    }
}

impl Drop for DeviceList {
    fn drop(&mut self) {
        unsafe { ffi::ibv_free_device_list(self.list) };
    }
}

fn device_name(dev: *mut ffi::ibv_device) -> String {
    let name = unsafe { ffi::ibv_get_device_name(dev) };
    if name.is_null() {
        String::new()
    } else {
        unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned()
    }
}

fn vendor_part_id(ctx: *mut ffi::ibv_context) -> io::Result<u32> {
    let mut attr = ffi::ibv_device_attr::default();
    let errno = unsafe { ffi::ibv_query_device(ctx, &mut attr as *mut _) };
    if errno != 0 {
        return Err(io::Error::from_raw_os_error(errno));
    }
    Ok(attr.vendor_part_id)
}

pub(super) fn describe(ctx: *mut ffi::ibv_context) -> io::Result<DeviceInfo> {
    let dev = unsafe { &*ctx }.device;
    Ok(DeviceInfo {
        name: device_name(dev),
        vendor_part_id: vendor_part_id(ctx)?,
    })
}

fn raw_gid(gid: &Gid) -> ffi::ibv_gid {
    ffi::ibv_gid { raw: *gid.raw() }
}

fn mtu_from_raw(mtu: ffi::ibv_mtu) -> Mtu {
    match mtu {
        ffi::ibv_mtu::IBV_MTU_256 => Mtu::Mtu256,
        ffi::ibv_mtu::IBV_MTU_512 => Mtu::Mtu512,
        ffi::ibv_mtu::IBV_MTU_1024 => Mtu::Mtu1024,
        ffi::ibv_mtu::IBV_MTU_2048 => Mtu::Mtu2048,
        ffi::ibv_mtu::IBV_MTU_4096 => Mtu::Mtu4096,
    }
}

fn mtu_to_raw(mtu: Mtu) -> ffi::ibv_mtu {
    match mtu {
        Mtu::Mtu256 => ffi::ibv_mtu::IBV_MTU_256,
        Mtu::Mtu512 => ffi::ibv_mtu::IBV_MTU_512,
        Mtu::Mtu1024 => ffi::ibv_mtu::IBV_MTU_1024,
        Mtu::Mtu2048 => ffi::ibv_mtu::IBV_MTU_2048,
        Mtu::Mtu4096 => ffi::ibv_mtu::IBV_MTU_4096,
    }
}

fn qp_type_to_raw(qp_type: QpType) -> ffi::ibv_qp_type {
    match qp_type {
        QpType::Rc => ffi::ibv_qp_type::IBV_QPT_RC,
        QpType::Uc => ffi::ibv_qp_type::IBV_QPT_UC,
        QpType::Ud => ffi::ibv_qp_type::IBV_QPT_UD,
    }
}

fn ah_attr(av: &AddressVector) -> ffi::ibv_ah_attr {
    let mut attr = ffi::ibv_ah_attr {
        dlid: av.dlid,
        sl: av.sl,
        src_path_bits: 0,
        port_num: av.port,
        ..Default::default()
    };
    if let Some(global) = av.global {
        attr.is_global = 1;
        attr.grh.dgid = raw_gid(&global.dgid);
        attr.grh.sgid_index = global.sgid_index;
        attr.grh.hop_limit = global.hop_limit;
    }
    attr
}

pub(super) fn init_attr(
    send: &VerbsCq,
    recv: &VerbsCq,
    qp_type: QpType,
    caps: QpCaps,
) -> ffi::ibv_qp_init_attr {
    ffi::ibv_qp_init_attr {
        qp_context: ptr::null_mut(),
        send_cq: send.inner.cq,
        recv_cq: recv.inner.cq,
        srq: ptr::null_mut(),
        cap: ffi::ibv_qp_cap {
            max_send_wr: caps.max_send_wr,
            max_recv_wr: caps.max_recv_wr,
            max_send_sge: caps.max_send_sge,
            max_recv_sge: caps.max_recv_sge,
            max_inline_data: caps.max_inline_data,
        },
        qp_type: qp_type_to_raw(qp_type),
        sq_sig_all: 0,
    }
}

fn missing_op(name: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("provider does not implement {name}"),
    )
}

/// Puts `fd` into non-blocking mode, so that `ibv_get_cq_event` and `rdma_get_cm_event` return
/// `EAGAIN` instead of blocking once `poll` has said the descriptor is readable.
pub(super) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = nix::fcntl::fcntl(fd, nix::fcntl::F_GETFL)?;
    let arg = nix::fcntl::FcntlArg::F_SETFL(
        nix::fcntl::OFlag::from_bits_retain(flags) | nix::fcntl::OFlag::O_NONBLOCK,
    );
    nix::fcntl::fcntl(fd, arg)?;
    Ok(())
}

/// Waits until `fd` is readable. Returns false if `deadline` passes first.
pub(super) fn wait_readable(fd: RawFd, deadline: Option<Instant>) -> io::Result<bool> {
    loop {
        let timeout = match deadline {
            None => nix::poll::PollTimeout::NONE,
            Some(d) => {
                let left = d.saturating_duration_since(Instant::now());
                nix::poll::PollTimeout::try_from(left)
                    .map_err(|_| io::Error::other("failed to convert timeout to PollTimeout"))?
            }
        };
        // the descriptor outlives this call; its owner holds `&self`
        let pollfd = nix::poll::PollFd::new(
            unsafe { BorrowedFd::borrow_raw(fd) },
            nix::poll::PollFlags::POLLIN,
        );
        match nix::poll::poll(&mut [pollfd], timeout) {
            Ok(0) => return Ok(false),
            Ok(_) => return Ok(true),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

impl Fabric for VerbsFabric {
    type Context = VerbsContext;
    type Pd = VerbsPd;
    type Cq = VerbsCq;
    type Channel = VerbsChannel;
    type Mr = VerbsMr;
    type Qp = VerbsQp;
    type Ah = VerbsAh;

    fn devices(&self) -> io::Result<Vec<DeviceInfo>> {
        let list = DeviceList::get()?;
        let mut out = Vec::with_capacity(list.len);
        for dev in list.iter() {
            let name = device_name(dev);
            let vendor_part_id = match ContextInner::open(dev) {
                Ok(ctx) => vendor_part_id(ctx.ctx).unwrap_or_else(|e| {
                    log::debug!("couldn't query {}: {}", name, e);
                    0
                }),
                Err(e) => {
                    log::debug!("couldn't open {}: {}", name, e);
                    0
                }
            };
            out.push(DeviceInfo {
                name,
                vendor_part_id,
            });
        }
        Ok(out)
    }

    fn open(&self, device: &DeviceInfo) -> io::Result<VerbsContext> {
        let list = DeviceList::get()?;
        let dev = list
            .iter()
            .find(|&dev| device_name(dev) == device.name)
            .ok_or_else(|| io::Error::from(nix::errno::Errno::ENODEV))?;
        let inner = ContextInner::open(dev)?;
        Ok(VerbsContext {
            info: describe(inner.ctx)?,
            inner: Arc::new(inner),
        })
    }
}

struct ContextInner {
    ctx: *mut ffi::ibv_context,
    // contexts handed out by the connection manager belong to it
    owned: bool,
}

unsafe impl Sync for ContextInner {}
unsafe impl Send for ContextInner {}

impl ContextInner {
    fn open(dev: *mut ffi::ibv_device) -> io::Result<Self> {
        let ctx = unsafe { ffi::ibv_open_device(dev) };
        if ctx.is_null() {
            return Err(io::Error::other("failed to open device"));
        }
        Ok(ContextInner { ctx, owned: true })
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        if self.owned {
            let errno = unsafe { ffi::ibv_close_device(self.ctx) };
            if errno != 0 {
                let e = io::Error::last_os_error();
                panic!("{e}");
            }
        }
    }
}

/// An opened device.
pub struct VerbsContext {
    inner: Arc<ContextInner>,
    info: DeviceInfo,
}

impl VerbsContext {
    /// Wraps a context owned by someone else, typically an `rdma_cm_id`.
    pub(super) fn borrowed(ctx: *mut ffi::ibv_context) -> io::Result<Self> {
        Ok(VerbsContext {
            info: describe(ctx)?,
            inner: Arc::new(ContextInner { ctx, owned: false }),
        })
    }
}

impl DeviceContext<VerbsFabric> for VerbsContext {
    fn device(&self) -> &DeviceInfo {
        &self.info
    }

    fn query_port(&self, port: u8) -> io::Result<PortInfo> {
        let mut attr = ffi::ibv_port_attr::default();
        let errno = unsafe {
            ffi::ibv_query_port(
                self.inner.ctx,
                port,
                &mut attr as *mut ffi::ibv_port_attr as *mut _,
            )
        };
        if errno != 0 {
            return Err(io::Error::from_raw_os_error(errno));
        }
        // the GID table is only valid in these two states
        match attr.state {
            ffi::ibv_port_state::IBV_PORT_ACTIVE | ffi::ibv_port_state::IBV_PORT_ARMED => {}
            _ => return Err(io::Error::other("port is not ACTIVE or ARMED")),
        }
        Ok(PortInfo {
            lid: attr.lid,
            active_mtu: mtu_from_raw(attr.active_mtu),
            gid_table_len: attr.gid_tbl_len.max(0) as u32,
        })
    }

    fn query_gid(&self, port: u8, index: u32) -> io::Result<Gid> {
        let mut gid = ffi::ibv_gid::default();
        let rc = unsafe { ffi::ibv_query_gid(self.inner.ctx, port, index as i32, &mut gid) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Gid::from(unsafe { gid.raw }))
    }

    fn alloc_pd(&self) -> io::Result<VerbsPd> {
        let pd = unsafe { ffi::ibv_alloc_pd(self.inner.ctx) };
        if pd.is_null() {
            return Err(io::Error::other("obtain protection domain"));
        }
        Ok(VerbsPd {
            inner: Arc::new(PdInner {
                _ctx: self.inner.clone(),
                pd,
            }),
        })
    }

    fn create_channel(&self) -> io::Result<VerbsChannel> {
        let cc = unsafe { ffi::ibv_create_comp_channel(self.inner.ctx) };
        if cc.is_null() {
            return Err(io::Error::last_os_error());
        }
        let inner = ChannelInner {
            _ctx: self.inner.clone(),
            cc,
        };
        set_nonblocking(unsafe { &*cc }.fd)?;
        Ok(VerbsChannel {
            inner: Arc::new(inner),
        })
    }

    fn create_cq(
        &self,
        depth: u32,
        channel: Option<&VerbsChannel>,
        id: CqId,
    ) -> io::Result<VerbsCq> {
        let cc = channel.map_or(ptr::null_mut(), |c| c.inner.cc);
        // cq_context carries the id back out of ibv_get_cq_event
        let cq = unsafe {
            ffi::ibv_create_cq(
                self.inner.ctx,
                depth as i32,
                id.0 as usize as *mut c_void,
                cc,
                0,
            )
        };
        if cq.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(VerbsCq {
            inner: Arc::new(CqInner {
                _ctx: self.inner.clone(),
                _channel: channel.map(|c| c.inner.clone()),
                cq,
            }),
            id,
        })
    }
}

pub(super) struct PdInner {
    _ctx: Arc<ContextInner>,
    pub(super) pd: *mut ffi::ibv_pd,
}

unsafe impl Sync for PdInner {}
unsafe impl Send for PdInner {}

impl Drop for PdInner {
    fn drop(&mut self) {
        let errno = unsafe { ffi::ibv_dealloc_pd(self.pd) };
        if errno != 0 {
            let e = io::Error::from_raw_os_error(errno);
            panic!("{e}");
        }
    }
}

/// A protection domain.
pub struct VerbsPd {
    pub(super) inner: Arc<PdInner>,
}

impl ProtectionDomain<VerbsFabric> for VerbsPd {
    fn register(&self, buf: AlignedBuffer, access: AccessFlags) -> io::Result<VerbsMr> {
        let mr = unsafe {
            ffi::ibv_reg_mr(
                self.inner.pd,
                buf.as_ptr() as *mut c_void,
                buf.len(),
                access.0 as i32,
            )
        };
        if mr.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(VerbsMr {
            _pd: self.inner.clone(),
            mr,
            buf,
        })
    }

    fn create_qp(
        &self,
        send: &VerbsCq,
        recv: &VerbsCq,
        qp_type: QpType,
        caps: QpCaps,
    ) -> io::Result<VerbsQp> {
        let mut attr = init_attr(send, recv, qp_type, caps);
        let qp = unsafe { ffi::ibv_create_qp(self.inner.pd, &mut attr as *mut _) };
        if qp.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(VerbsQp {
            qp,
            cm_id: None,
            groups: Vec::new(),
            _pd: self.inner.clone(),
            _cqs: [send.inner.clone(), recv.inner.clone()],
        })
    }

    fn create_ah(&self, av: &AddressVector) -> io::Result<VerbsAh> {
        let mut attr = ah_attr(av);
        let ah = unsafe { ffi::ibv_create_ah(self.inner.pd, &mut attr as *mut _) };
        if ah.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(VerbsAh {
            _pd: self.inner.clone(),
            ah,
        })
    }
}

struct ChannelInner {
    _ctx: Arc<ContextInner>,
    cc: *mut ffi::ibv_comp_channel,
}

unsafe impl Sync for ChannelInner {}
unsafe impl Send for ChannelInner {}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        let errno = unsafe { ffi::ibv_destroy_comp_channel(self.cc) };
        if errno != 0 {
            let e = io::Error::from_raw_os_error(errno);
            panic!("{e}");
        }
    }
}

/// A completion channel.
pub struct VerbsChannel {
    inner: Arc<ChannelInner>,
}

impl CompletionChannel for VerbsChannel {
    fn get_event(&self, timeout: Option<Duration>) -> io::Result<Option<CqId>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let fd = unsafe { &*self.inner.cc }.fd;
        loop {
            if !wait_readable(fd, deadline)? {
                return Ok(None);
            }
            let mut cq = ptr::null_mut();
            let mut cq_context = ptr::null_mut();
            let rc = unsafe { ffi::ibv_get_cq_event(self.inner.cc, &mut cq, &mut cq_context) };
            if rc < 0 {
                let e = io::Error::last_os_error();
                if e.kind() == io::ErrorKind::WouldBlock {
                    continue;
                }
                return Err(e);
            }
            return Ok(Some(CqId(cq_context as usize as u64)));
        }
    }
}

pub(super) struct CqInner {
    _ctx: Arc<ContextInner>,
    _channel: Option<Arc<ChannelInner>>,
    pub(super) cq: *mut ffi::ibv_cq,
}

unsafe impl Sync for CqInner {}
unsafe impl Send for CqInner {}

impl Drop for CqInner {
    fn drop(&mut self) {
        let errno = unsafe { ffi::ibv_destroy_cq(self.cq) };
        if errno != 0 {
            let e = io::Error::from_raw_os_error(errno);
            panic!("{e}");
        }
    }
}

/// A completion queue.
pub struct VerbsCq {
    pub(super) inner: Arc<CqInner>,
    id: CqId,
}

impl VerbsCq {
    fn ops(&self) -> ffi::ibv_context_ops {
        let ctx = unsafe { &*self.inner.cq }.context;
        unsafe { &*ctx }.ops
    }
}

fn completion(wc: &ffi::ibv_wc) -> WorkCompletion {
    let opcode = match wc.opcode() {
        ffi::ibv_wc_opcode::IBV_WC_SEND => WcOpcode::Send,
        ffi::ibv_wc_opcode::IBV_WC_RECV => WcOpcode::Recv,
        other => WcOpcode::Other(other as u32),
    };
    WorkCompletion {
        wr_id: wc.wr_id(),
        status: WcStatus::from_code(wc.status() as u32),
        opcode,
        byte_len: wc.len() as u32,
        qp_num: wc.qp_num,
        vendor_err: wc.vendor_err(),
    }
}

impl CompletionQueue for VerbsCq {
    fn id(&self) -> CqId {
        self.id
    }

    fn poll(&self, out: &mut [WorkCompletion]) -> io::Result<usize> {
        let poll_cq = self.ops().poll_cq.ok_or_else(|| missing_op("poll_cq"))?;
        let mut raw = [ffi::ibv_wc::default(); POLL_BATCH];
        let want = out.len().min(POLL_BATCH);
        let n = unsafe { poll_cq(self.inner.cq, want as i32, raw.as_mut_ptr()) };
        if n < 0 {
            return Err(io::Error::other("ibv_poll_cq failed"));
        }
        let n = n as usize;
        for (slot, wc) in out.iter_mut().zip(&raw[..n]) {
            *slot = completion(wc);
        }
        Ok(n)
    }

    fn req_notify(&self) -> io::Result<()> {
        let req_notify_cq = self
            .ops()
            .req_notify_cq
            .ok_or_else(|| missing_op("req_notify_cq"))?;
        let errno = unsafe { req_notify_cq(self.inner.cq, 0) };
        if errno != 0 {
            return Err(io::Error::from_raw_os_error(errno));
        }
        Ok(())
    }

    fn ack_events(&self, n: u32) {
        unsafe { ffi::ibv_ack_cq_events(self.inner.cq, n) };
    }
}

/// A registered memory region that owns its buffer.
pub struct VerbsMr {
    _pd: Arc<PdInner>,
    mr: *mut ffi::ibv_mr,
    // dropped after the region is deregistered
    buf: AlignedBuffer,
}

unsafe impl Sync for VerbsMr {}
unsafe impl Send for VerbsMr {}

impl Drop for VerbsMr {
    fn drop(&mut self) {
        let errno = unsafe { ffi::ibv_dereg_mr(self.mr) };
        if errno != 0 {
            let e = io::Error::from_raw_os_error(errno);
            panic!("{e}");
        }
    }
}

impl RegisteredMemory for VerbsMr {
    fn addr(&self) -> u64 {
        self.buf.as_ptr() as u64
    }

    fn len(&self) -> usize {
        self.buf.len()
    }

    fn lkey(&self) -> u32 {
        unsafe { &*self.mr }.lkey
    }

    fn rkey(&self) -> u32 {
        unsafe { &*self.mr }.rkey
    }

    fn write_at(&mut self, offset: usize, data: &[u8]) {
        self.buf.write_at(offset, data);
    }

    fn read_at(&self, offset: usize, out: &mut [u8]) {
        self.buf.read_at(offset, out);
    }
}

/// A UD address handle.
pub struct VerbsAh {
    _pd: Arc<PdInner>,
    ah: *mut ffi::ibv_ah,
}

unsafe impl Sync for VerbsAh {}
unsafe impl Send for VerbsAh {}

impl Drop for VerbsAh {
    fn drop(&mut self) {
        let errno = unsafe { ffi::ibv_destroy_ah(self.ah) };
        if errno != 0 {
            let e = io::Error::from_raw_os_error(errno);
            panic!("{e}");
        }
    }
}

/// A queue pair, created either directly on a protection domain or through an `rdma_cm_id`.
pub struct VerbsQp {
    qp: *mut ffi::ibv_qp,
    // set when the connection manager owns the QP; it is then destroyed through the id
    cm_id: Option<*mut ffi::rdma_cm_id>,
    groups: Vec<(Gid, u16)>,
    _pd: Arc<PdInner>,
    _cqs: [Arc<CqInner>; 2],
}

unsafe impl Send for VerbsQp {}

impl VerbsQp {
    pub(super) fn owned_by_cm(id: *mut ffi::rdma_cm_id, pd: &VerbsPd, cq: &VerbsCq) -> Self {
        VerbsQp {
            qp: unsafe { &*id }.qp,
            cm_id: Some(id),
            groups: Vec::new(),
            _pd: pd.inner.clone(),
            _cqs: [cq.inner.clone(), cq.inner.clone()],
        }
    }

    fn ops(&self) -> ffi::ibv_context_ops {
        let ctx = unsafe { &*self.qp }.context;
        unsafe { &*ctx }.ops
    }

    fn modify_raw(
        &mut self,
        attr: &mut ffi::ibv_qp_attr,
        mask: ffi::ibv_qp_attr_mask,
    ) -> io::Result<()> {
        let errno = unsafe { ffi::ibv_modify_qp(self.qp, attr as *mut _, mask.0 as i32) };
        if errno != 0 {
            return Err(io::Error::from_raw_os_error(errno));
        }
        Ok(())
    }
}

impl Drop for VerbsQp {
    fn drop(&mut self) {
        // ibv_destroy_qp fails while the QP is still attached to a multicast group
        for (gid, lid) in std::mem::take(&mut self.groups) {
            let errno = unsafe { ffi::ibv_detach_mcast(self.qp, &raw_gid(&gid), lid) };
            if errno != 0 {
                log::warn!(
                    "couldn't leave multicast group {}: {}",
                    gid,
                    io::Error::from_raw_os_error(errno)
                );
            }
        }
        match self.cm_id {
            Some(id) => unsafe { ffi::rdma_destroy_qp(id) },
            None => {
                let errno = unsafe { ffi::ibv_destroy_qp(self.qp) };
                if errno != 0 {
                    let e = io::Error::from_raw_os_error(errno);
                    panic!("{e}");
                }
            }
        }
    }
}

impl RawQueuePair<VerbsFabric> for VerbsQp {
    fn qp_num(&self) -> u32 {
        unsafe { &*self.qp }.qp_num
    }

    fn modify(&mut self, transition: &QpTransition) -> io::Result<()> {
        use ffi::ibv_qp_attr_mask as m;

        match *transition {
            QpTransition::Init { port, access, qkey } => {
                let mut attr = ffi::ibv_qp_attr {
                    qp_state: ffi::ibv_qp_state::IBV_QPS_INIT,
                    pkey_index: 0,
                    port_num: port,
                    ..Default::default()
                };
                let mut mask = m::IBV_QP_STATE | m::IBV_QP_PKEY_INDEX | m::IBV_QP_PORT;
                if let Some(access) = access {
                    attr.qp_access_flags = access.0;
                    mask |= m::IBV_QP_ACCESS_FLAGS;
                }
                if let Some(qkey) = qkey {
                    attr.qkey = qkey;
                    mask |= m::IBV_QP_QKEY;
                }
                self.modify_raw(&mut attr, mask)
            }
            QpTransition::Rtr {
                ref av,
                path_mtu,
                dest_qpn,
                rq_psn,
                max_dest_rd_atomic,
                min_rnr_timer,
            } => {
                let mut attr = ffi::ibv_qp_attr {
                    qp_state: ffi::ibv_qp_state::IBV_QPS_RTR,
                    ..Default::default()
                };
                let mut mask = m::IBV_QP_STATE;
                // UD queue pairs carry no peer in RTR; the address goes into each send
                if let Some(dest_qpn) = dest_qpn {
                    attr.dest_qp_num = dest_qpn;
                    attr.ah_attr = ah_attr(av);
                    mask |= m::IBV_QP_AV | m::IBV_QP_DEST_QPN;
                }
                if let Some(path_mtu) = path_mtu {
                    attr.path_mtu = mtu_to_raw(path_mtu);
                    mask |= m::IBV_QP_PATH_MTU;
                }
                if let Some(rq_psn) = rq_psn {
                    attr.rq_psn = rq_psn;
                    mask |= m::IBV_QP_RQ_PSN;
                }
                if let Some(max_dest_rd_atomic) = max_dest_rd_atomic {
                    attr.max_dest_rd_atomic = max_dest_rd_atomic;
                    mask |= m::IBV_QP_MAX_DEST_RD_ATOMIC;
                }
                if let Some(min_rnr_timer) = min_rnr_timer {
                    attr.min_rnr_timer = min_rnr_timer;
                    mask |= m::IBV_QP_MIN_RNR_TIMER;
                }
                self.modify_raw(&mut attr, mask)
            }
            QpTransition::Rts {
                sq_psn,
                timeout,
                retry_cnt,
                rnr_retry,
                max_rd_atomic,
            } => {
                let mut attr = ffi::ibv_qp_attr {
                    qp_state: ffi::ibv_qp_state::IBV_QPS_RTS,
                    sq_psn,
                    ..Default::default()
                };
                let mut mask = m::IBV_QP_STATE | m::IBV_QP_SQ_PSN;
                if let Some(timeout) = timeout {
                    attr.timeout = timeout;
                    mask |= m::IBV_QP_TIMEOUT;
                }
                if let Some(retry_cnt) = retry_cnt {
                    attr.retry_cnt = retry_cnt;
                    mask |= m::IBV_QP_RETRY_CNT;
                }
                if let Some(rnr_retry) = rnr_retry {
                    attr.rnr_retry = rnr_retry;
                    mask |= m::IBV_QP_RNR_RETRY;
                }
                if let Some(max_rd_atomic) = max_rd_atomic {
                    attr.max_rd_atomic = max_rd_atomic;
                    mask |= m::IBV_QP_MAX_QP_RD_ATOMIC;
                }
                self.modify_raw(&mut attr, mask)
            }
            QpTransition::Error => {
                let mut attr = ffi::ibv_qp_attr {
                    qp_state: ffi::ibv_qp_state::IBV_QPS_ERR,
                    ..Default::default()
                };
                self.modify_raw(&mut attr, m::IBV_QP_STATE)
            }
        }
    }

    fn attach_mcast(&mut self, gid: &Gid, lid: u16) -> io::Result<()> {
        let errno = unsafe { ffi::ibv_attach_mcast(self.qp, &raw_gid(gid), lid) };
        if errno != 0 {
            return Err(io::Error::from_raw_os_error(errno));
        }
        self.groups.push((*gid, lid));
        Ok(())
    }

    fn detach_mcast(&mut self, gid: &Gid, lid: u16) -> io::Result<()> {
        let errno = unsafe { ffi::ibv_detach_mcast(self.qp, &raw_gid(gid), lid) };
        if errno != 0 {
            return Err(io::Error::from_raw_os_error(errno));
        }
        self.groups.retain(|g| *g != (*gid, lid));
        Ok(())
    }

    fn post_send(&mut self, wr: &SendRequest<'_, VerbsAh>) -> io::Result<()> {
        let mut sge = ffi::ibv_sge {
            addr: wr.sge.addr,
            length: wr.sge.length,
            lkey: wr.sge.lkey,
        };
        let mut flags = ffi::ibv_send_flags(0);
        if wr.signaled {
            flags |= ffi::ibv_send_flags::IBV_SEND_SIGNALED;
        }
        // inline payloads are copied at post time, so the buffer is free again on return
        if wr.inline {
            flags |= ffi::ibv_send_flags::IBV_SEND_INLINE;
        }
        let mut raw = ffi::ibv_send_wr {
            wr_id: wr.wr_id,
            next: ptr::null_mut(),
            sg_list: &mut sge as *mut _,
            num_sge: 1,
            opcode: ffi::ibv_wr_opcode::IBV_WR_SEND,
            send_flags: flags.0,
            ..Default::default()
        };
        if let Some(ud) = &wr.ud {
            raw.wr.ud = ffi::ibv_send_wr__bindgen_ty_2__bindgen_ty_3 {
                ah: ud.ah.ah,
                remote_qpn: ud.remote_qpn,
                remote_qkey: ud.remote_qkey,
            };
        }
        let mut bad_wr: *mut ffi::ibv_send_wr = ptr::null_mut();

        let post_send = self.ops().post_send.ok_or_else(|| missing_op("post_send"))?;
        let errno = unsafe { post_send(self.qp, &mut raw as *mut _, &mut bad_wr as *mut _) };
        if errno != 0 {
            return Err(io::Error::from_raw_os_error(errno));
        }
        Ok(())
    }

    fn post_recv(&mut self, wr: &RecvRequest) -> io::Result<()> {
        let mut sge = ffi::ibv_sge {
            addr: wr.sge.addr,
            length: wr.sge.length,
            lkey: wr.sge.lkey,
        };
        // UD receives get the GRH in their first 40 bytes; the layout accounts for it
        let mut raw = ffi::ibv_recv_wr {
            wr_id: wr.wr_id,
            next: ptr::null_mut(),
            sg_list: &mut sge as *mut _,
            num_sge: 1,
        };
        let mut bad_wr: *mut ffi::ibv_recv_wr = ptr::null_mut();

        let post_recv = self.ops().post_recv.ok_or_else(|| missing_op("post_recv"))?;
        let errno = unsafe { post_recv(self.qp, &mut raw as *mut _, &mut bad_wr as *mut _) };
        if errno != 0 {
            return Err(io::Error::from_raw_os_error(errno));
        }
        Ok(())
    }
}
