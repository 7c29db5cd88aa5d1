//! The `librdmacm` connection manager on top of [`VerbsFabric`].
//!
//! Ids are created in the TCP port space, so every connection is RC. The event channel is put
//! into non-blocking mode and waited on with `poll`, which gives `get_event` its timeout. Events
//! are acknowledged as soon as their fields have been copied out.

use std::io;
use std::net::SocketAddr;
use std::os::raw::c_void;
use std::ptr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::SockAddr;

use super::verbs::{self, VerbsContext, VerbsCq, VerbsFabric, VerbsPd, VerbsQp};
use super::{CmEvent, CmEventChannel, CmEventKind, CmFabric, CmId, DeviceInfo, QpCaps, QpType};

fn event_kind(event: ffi::rdma_cm_event_type::Type) -> CmEventKind {
    use ffi::rdma_cm_event_type as t;

    match event {
        t::RDMA_CM_EVENT_ADDR_RESOLVED => CmEventKind::AddrResolved,
        t::RDMA_CM_EVENT_ADDR_ERROR => CmEventKind::AddrError,
        t::RDMA_CM_EVENT_ROUTE_RESOLVED => CmEventKind::RouteResolved,
        t::RDMA_CM_EVENT_ROUTE_ERROR => CmEventKind::RouteError,
        t::RDMA_CM_EVENT_CONNECT_REQUEST => CmEventKind::ConnectRequest,
        t::RDMA_CM_EVENT_CONNECT_ERROR => CmEventKind::ConnectError,
        t::RDMA_CM_EVENT_UNREACHABLE => CmEventKind::Unreachable,
        t::RDMA_CM_EVENT_REJECTED => CmEventKind::Rejected,
        t::RDMA_CM_EVENT_ESTABLISHED => CmEventKind::Established,
        t::RDMA_CM_EVENT_DISCONNECTED => CmEventKind::Disconnected,
        t::RDMA_CM_EVENT_DEVICE_REMOVAL => CmEventKind::DeviceRemoval,
        t::RDMA_CM_EVENT_TIMEWAIT_EXIT => CmEventKind::TimewaitExit,
        other => CmEventKind::Other(other as u32),
    }
}

fn check(rc: i32) -> io::Result<()> {
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl CmFabric for VerbsFabric {
    type EventChannel = VerbsEventChannel;
    type CmId = VerbsCmId;

    fn create_event_channel(&self) -> io::Result<VerbsEventChannel> {
        let channel = unsafe { ffi::rdma_create_event_channel() };
        if channel.is_null() {
            return Err(io::Error::last_os_error());
        }
        let inner = EventChannelInner { channel };
        verbs::set_nonblocking(unsafe { &*channel }.fd)?;
        Ok(VerbsEventChannel {
            inner: Arc::new(inner),
        })
    }
}

struct EventChannelInner {
    channel: *mut ffi::rdma_event_channel,
}

unsafe impl Send for EventChannelInner {}
unsafe impl Sync for EventChannelInner {}

impl Drop for EventChannelInner {
    fn drop(&mut self) {
        unsafe { ffi::rdma_destroy_event_channel(self.channel) };
    }
}

/// A connection-manager event channel.
pub struct VerbsEventChannel {
    inner: Arc<EventChannelInner>,
}

impl CmEventChannel<VerbsFabric> for VerbsEventChannel {
    fn create_id(&self, context: u64) -> io::Result<VerbsCmId> {
        let mut id: *mut ffi::rdma_cm_id = ptr::null_mut();
        let rc = unsafe {
            ffi::rdma_create_id(
                self.inner.channel,
                &mut id,
                context as usize as *mut c_void,
                ffi::rdma_port_space::RDMA_PS_TCP,
            )
        };
        if rc != 0 || id.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(VerbsCmId {
            id,
            _channel: self.inner.clone(),
        })
    }

    fn get_event(&self, timeout: Option<Duration>) -> io::Result<Option<CmEvent<VerbsCmId>>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let fd = unsafe { &*self.inner.channel }.fd;
        loop {
            if !verbs::wait_readable(fd, deadline)? {
                return Ok(None);
            }
            let mut event: *mut ffi::rdma_cm_event = ptr::null_mut();
            let rc = unsafe { ffi::rdma_get_cm_event(self.inner.channel, &mut event) };
            if rc != 0 {
                let e = io::Error::last_os_error();
                if e.kind() == io::ErrorKind::WouldBlock {
                    continue;
                }
                return Err(e);
            }

            let (kind, status, id) = {
                let ev = unsafe { &*event };
                (event_kind(ev.event), ev.status, ev.id)
            };
            let context = unsafe { &*id }.context as usize as u64;
            // a connect request carries a new id that is ours to destroy
            let request = (kind == CmEventKind::ConnectRequest).then(|| VerbsCmId {
                id,
                _channel: self.inner.clone(),
            });

            let rc = unsafe { ffi::rdma_ack_cm_event(event) };
            if rc != 0 {
                log::debug!(
                    "An error occurred on ack_cm_event: {:?}",
                    io::Error::last_os_error()
                );
            }
            return Ok(Some(CmEvent {
                kind,
                status,
                context,
                request,
            }));
        }
    }
}

/// A connection-manager id in the TCP port space.
pub struct VerbsCmId {
    id: *mut ffi::rdma_cm_id,
    // the channel must outlive every id created on it
    _channel: Arc<EventChannelInner>,
}

unsafe impl Send for VerbsCmId {}
unsafe impl Sync for VerbsCmId {}

impl Drop for VerbsCmId {
    fn drop(&mut self) {
        let rc = unsafe { ffi::rdma_destroy_id(self.id) };
        if rc != 0 {
            log::debug!(
                "An error occurred on destroy_id: {:?}",
                io::Error::last_os_error()
            );
        }
    }
}

impl VerbsCmId {
    fn verbs(&self) -> *mut ffi::ibv_context {
        unsafe { &*self.id }.verbs
    }
}

impl CmId<VerbsFabric> for VerbsCmId {
    fn set_context(&mut self, context: u64) {
        unsafe { &mut *self.id }.context = context as usize as *mut c_void;
    }

    fn device(&self) -> Option<DeviceInfo> {
        let ctx = self.verbs();
        if ctx.is_null() {
            return None;
        }
        verbs::describe(ctx)
            .map_err(|e| log::debug!("couldn't describe the id's device: {}", e))
            .ok()
    }

    fn context(&self) -> io::Result<VerbsContext> {
        let ctx = self.verbs();
        if ctx.is_null() {
            return Err(io::Error::from(nix::errno::Errno::ENODEV));
        }
        VerbsContext::borrowed(ctx)
    }

    fn bind_addr(&mut self, addr: SocketAddr) -> io::Result<()> {
        let addr = SockAddr::from(addr);
        check(unsafe { ffi::rdma_bind_addr(self.id, addr.as_ptr() as *mut _) })
    }

    fn listen(&mut self, backlog: i32) -> io::Result<()> {
        check(unsafe { ffi::rdma_listen(self.id, backlog) })
    }

    fn local_port(&self) -> u16 {
        u16::from_be(unsafe { ffi::rdma_get_src_port(self.id) })
    }

    fn resolve_addr(&mut self, dst: SocketAddr, timeout: Duration) -> io::Result<()> {
        let dst = SockAddr::from(dst);
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        check(unsafe {
            ffi::rdma_resolve_addr(self.id, ptr::null_mut(), dst.as_ptr() as *mut _, timeout_ms)
        })
    }

    fn resolve_route(&mut self, timeout: Duration) -> io::Result<()> {
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        check(unsafe { ffi::rdma_resolve_route(self.id, timeout_ms) })
    }

    fn create_qp(&mut self, pd: &VerbsPd, cq: &VerbsCq, caps: QpCaps) -> io::Result<VerbsQp> {
        let mut attr = verbs::init_attr(cq, cq, QpType::Rc, caps);
        check(unsafe { ffi::rdma_create_qp(self.id, pd.inner.pd, &mut attr as *mut _) })?;
        Ok(VerbsQp::owned_by_cm(self.id, pd, cq))
    }

    fn accept(&mut self) -> io::Result<()> {
        let mut param = ffi::rdma_conn_param::default();
        check(unsafe { ffi::rdma_accept(self.id, &mut param as *mut _) })
    }

    fn connect(&mut self) -> io::Result<()> {
        let mut param = ffi::rdma_conn_param {
            responder_resources: 1,
            initiator_depth: 1,
            rnr_retry_count: 7,
            ..Default::default()
        };
        check(unsafe { ffi::rdma_connect(self.id, &mut param as *mut _) })
    }

    fn disconnect(&mut self) -> io::Result<()> {
        check(unsafe { ffi::rdma_disconnect(self.id) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_codes_map_to_kinds() {
        use ffi::rdma_cm_event_type as t;

        assert_eq!(
            event_kind(t::RDMA_CM_EVENT_CONNECT_REQUEST),
            CmEventKind::ConnectRequest
        );
        assert_eq!(
            event_kind(t::RDMA_CM_EVENT_DISCONNECTED),
            CmEventKind::Disconnected
        );
        assert_eq!(
            event_kind(t::RDMA_CM_EVENT_MULTICAST_JOIN),
            CmEventKind::Other(t::RDMA_CM_EVENT_MULTICAST_JOIN as u32)
        );
    }
}
