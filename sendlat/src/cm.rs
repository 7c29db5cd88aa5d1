//! A connection-manager server and client exchanging one greeting per connection.
//!
//! The server listens on one id for its whole life. For every connection request it creates an
//! RC queue pair on the new id, registers a send and a receive buffer, posts a receive, and
//! accepts. Once the connection is established it sends a greeting carrying its pid; once it is
//! disconnected, everything belonging to the connection is released.
//!
//! All connections share one device context, one CQ and one completion channel. A poller thread
//! sleeps on that channel and reports each completion as a [`CompletionNotice`].
//!
//! Work request ids carry the table key in the low 32 bits and the connection's generation in
//! the high 32 bits, so a late completion for a released connection is never reported against a
//! newer connection that reuses its key.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use slab::Slab;

use crate::context::{ContextOptions, FabricContext};
use crate::cq::{self, CompletionEngine, CqSide, WaitMode};
use crate::error::{Counters, Error, Result};
use crate::fabric::{
    AccessFlags, CmEvent, CmEventChannel, CmEventKind, CmFabric, CmId, CompletionChannel,
    CompletionQueue, DeviceInfo, QpCaps, QpType, RecvRequest, SendRequest, WcOpcode, WcStatus,
    WorkCompletion,
};
use crate::mr::{register_buffer, MemoryRegion};
use crate::qp::QueuePair;

/// Size of each connection's send and receive buffer.
pub const BUFFER_SIZE: usize = 1024;
/// Port the demo server listens on.
pub const DEFAULT_PORT: u16 = 9876;
/// Entries in the shared CQ.
pub const CQ_DEPTH: u32 = 10;
/// Pending connection requests the listener queues.
pub const BACKLOG: i32 = 10;

const LISTENER: u64 = u64::MAX;
const TICK: Duration = Duration::from_millis(100);

/// Queue sizes of every connection's queue pair.
pub const QP_CAPS: QpCaps = QpCaps {
    max_send_wr: 10,
    max_recv_wr: 10,
    max_send_sge: 1,
    max_recv_sge: 1,
    max_inline_data: 0,
};

/// The greeting the server sends on every new connection.
pub fn greeting() -> String {
    format!(
        "message from passive/server side with pid {}",
        std::process::id()
    )
}

/// Where a connection is in its life.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ConnState {
    /// Nothing has happened yet.
    Listening,
    /// A request arrived and was accepted.
    ConnectRequested,
    /// The connection is up.
    Established,
    /// The connection is gone.
    Disconnected,
}

impl ConnState {
    /// The state after `event`, or `StateViolation` if `event` cannot happen here.
    pub fn on(self, event: CmEventKind) -> Result<ConnState> {
        use CmEventKind as E;
        use ConnState as S;
        match (self, event) {
            (S::Listening, E::ConnectRequest) => Ok(S::ConnectRequested),
            (S::ConnectRequested, E::Established) => Ok(S::Established),
            (S::ConnectRequested, E::Rejected | E::Unreachable | E::ConnectError) => {
                Ok(S::Disconnected)
            }
            (S::Established, E::Disconnected) => Ok(S::Disconnected),
            (S::Disconnected, E::TimewaitExit) => Ok(S::Disconnected),
            (from, to) => Err(Error::StateViolation {
                from: format!("{from:?}"),
                to: to.to_string(),
            }),
        }
    }
}

/// Index of a connection in the server's table.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ConnHandle(pub usize);

impl ConnHandle {
    fn wr_id(self, generation: u32) -> u64 {
        (u64::from(generation) << 32) | (self.0 as u64 & 0xffff_ffff)
    }

    fn from_wr_id(wr_id: u64) -> (ConnHandle, u32) {
        (ConnHandle((wr_id & 0xffff_ffff) as usize), (wr_id >> 32) as u32)
    }
}

/// What the poller saw.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CompletionNotice {
    /// A message arrived on a connection.
    Received {
        /// The connection.
        handle: ConnHandle,
        /// Its text, up to the first NUL.
        message: String,
    },
    /// The greeting went out.
    SendCompleted {
        /// The connection.
        handle: ConnHandle,
    },
    /// A work request failed.
    CompletionError {
        /// The connection.
        handle: ConnHandle,
        /// The failure.
        status: WcStatus,
    },
}

/// The device context every connection shares, built from the first request.
pub struct ContextSlot<F: CmFabric> {
    ctx: Option<Arc<FabricContext<F>>>,
}

impl<F: CmFabric> Default for ContextSlot<F> {
    fn default() -> Self {
        ContextSlot { ctx: None }
    }
}

impl<F: CmFabric> ContextSlot<F> {
    /// The context, once there is one.
    pub fn get(&self) -> Option<&Arc<FabricContext<F>>> {
        self.ctx.as_ref()
    }

    /// Returns the context for `device`, building it with `build` on first use. The flag is
    /// true when the context was just built.
    ///
    /// A request on any device other than the first one is `MultiContext`.
    pub fn get_or_build(
        &mut self,
        device: &DeviceInfo,
        build: impl FnOnce() -> Result<FabricContext<F>>,
    ) -> Result<(Arc<FabricContext<F>>, bool)> {
        if let Some(ctx) = &self.ctx {
            if ctx.device().name != device.name {
                return Err(Error::MultiContext {
                    have: ctx.device().name.clone(),
                    got: device.name.clone(),
                });
            }
            return Ok((Arc::clone(ctx), false));
        }
        let ctx = Arc::new(build()?);
        self.ctx = Some(Arc::clone(&ctx));
        Ok((ctx, true))
    }

    fn take(&mut self) -> Option<Arc<FabricContext<F>>> {
        self.ctx.take()
    }
}

// released field by field in `release`
struct Connection<F: CmFabric> {
    state: ConnState,
    generation: u32,
    qp: Option<QueuePair<F>>,
    send: Option<MemoryRegion<F>>,
    recv: Option<MemoryRegion<F>>,
    // None until `accept` returns
    id: Option<F::CmId>,
}

impl<F: CmFabric> Connection<F> {
    fn disconnect(&mut self, handle: ConnHandle) -> Result<()> {
        if self.state != ConnState::Established {
            return Err(Error::StateViolation {
                from: format!("{:?}", self.state),
                to: "server disconnect".into(),
            });
        }
        let Some(id) = self.id.as_mut() else {
            return Ok(());
        };
        id.disconnect()?;
        if let Some(qp) = self.qp.as_mut() {
            qp.set_error();
        }
        log::info!("disconnecting connection {}", handle.0);
        Ok(())
    }
}

type Connections<F> = Arc<Mutex<Slab<Connection<F>>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reads a NUL-terminated message out of `mr`.
fn read_message<F: CmFabric>(mr: &MemoryRegion<F>) -> String {
    let mut buf = vec![0u8; mr.len()];
    mr.read_at(0, &mut buf);
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// The passive side.
pub struct CmServer<F: CmFabric> {
    fabric: F,
    poller: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    notices: Sender<CompletionNotice>,
    conns: Connections<F>,
    generation: u32,
    slot: ContextSlot<F>,
    listener: F::CmId,
    channel: F::EventChannel,
}

impl<F: CmFabric> CmServer<F> {
    /// Listens on `addr`. Completions are reported on the returned receiver.
    pub fn bind(fabric: &F, addr: SocketAddr) -> Result<(Self, Receiver<CompletionNotice>)> {
        let channel = fabric
            .create_event_channel()
            .map_err(Error::resource("CM event channel"))?;
        let mut listener = channel
            .create_id(LISTENER)
            .map_err(Error::resource("CM id"))?;
        listener.bind_addr(addr)?;
        listener.listen(BACKLOG)?;
        log::info!("listening on port {}", listener.local_port());
        let (tx, rx) = channel::unbounded();
        Ok((
            CmServer {
                fabric: fabric.clone(),
                poller: None,
                stop: Arc::new(AtomicBool::new(false)),
                notices: tx,
                conns: Arc::new(Mutex::new(Slab::new())),
                generation: 0,
                slot: ContextSlot::default(),
                listener,
                channel,
            },
            rx,
        ))
    }

    /// The port the listener is bound to.
    pub fn local_port(&self) -> u16 {
        self.listener.local_port()
    }

    /// A flag that makes [`CmServer::run`] return once set.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Number of live connections.
    pub fn connections(&self) -> usize {
        lock(&self.conns).len()
    }

    /// Handles events until the stop flag is set or an event cannot be handled.
    pub fn run(&mut self) -> Result<()> {
        while !self.stop.load(Ordering::Relaxed) {
            self.serve_one(Some(TICK))?;
        }
        Ok(())
    }

    /// Waits up to `timeout` for one event and handles it. Returns what it handled.
    pub fn serve_one(&mut self, timeout: Option<Duration>) -> Result<Option<CmEventKind>> {
        let Some(event) = self
            .channel
            .get_event(timeout)
            .map_err(Error::poll("get CM event"))?
        else {
            return Ok(None);
        };
        let kind = event.kind;
        self.handle_event(event)?;
        Ok(Some(kind))
    }

    fn handle_event(&mut self, event: CmEvent<F::CmId>) -> Result<()> {
        log::debug!("CM event {} (status {})", event.kind, event.status);
        match event.kind {
            CmEventKind::ConnectRequest => match event.request {
                Some(id) => self.on_connect_request(id),
                None => Err(Error::StateViolation {
                    from: "Listening".into(),
                    to: "CONNECT_REQUEST without an id".into(),
                }),
            },
            kind @ (CmEventKind::Established
            | CmEventKind::Disconnected
            | CmEventKind::Rejected
            | CmEventKind::Unreachable
            | CmEventKind::ConnectError
            | CmEventKind::TimewaitExit) => {
                let handle = ConnHandle(event.context as usize);
                if event.context == LISTENER || !lock(&self.conns).contains(handle.0) {
                    log::debug!("{} for unknown connection {}", kind, event.context);
                    return Ok(());
                }
                self.on_transition(handle, kind)
            }
            other => {
                log::debug!("ignoring CM event {}", other);
                Ok(())
            }
        }
    }

    fn context_for(&mut self, id: &F::CmId) -> Result<Arc<FabricContext<F>>> {
        let device = id.device().ok_or_else(|| Error::StateViolation {
            from: "ConnectRequested".into(),
            to: "request without a device".into(),
        })?;
        let fabric = self.fabric.clone();
        let (ctx, fresh) = self.slot.get_or_build(&device, || {
            let raw = id.context().map_err(Error::resource("device context"))?;
            let opts = ContextOptions {
                cq_depth: CQ_DEPTH,
                events: true,
                split_cqs: false,
            };
            FabricContext::with_context(&fabric, raw, &opts)
        })?;
        if fresh {
            ctx.send_cq()?
                .req_notify()
                .map_err(Error::poll("request CQ notification"))?;
            self.poller = Some(spawn_poller(
                Arc::clone(&ctx),
                Arc::clone(&self.conns),
                self.notices.clone(),
                Arc::clone(&self.stop),
            )?);
            log::debug!("built shared context on {}", device.name);
        }
        Ok(ctx)
    }

    fn on_connect_request(&mut self, mut id: F::CmId) -> Result<()> {
        let ctx = self.context_for(&id)?;
        let state = ConnState::Listening.on(CmEventKind::ConnectRequest)?;
        let raw = id
            .create_qp(ctx.pd()?, ctx.send_cq()?, QP_CAPS)
            .map_err(Error::resource("QP"))?;
        let mut qp = QueuePair::adopt(raw, QpType::Rc);
        let send = register_buffer::<F>(ctx.pd()?, BUFFER_SIZE, AccessFlags::default())?;
        let recv = register_buffer::<F>(ctx.pd()?, BUFFER_SIZE, AccessFlags::default())?;

        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;

        let handle = {
            let mut conns = lock(&self.conns);
            let entry = conns.vacant_entry();
            let handle = ConnHandle(entry.key());
            let wr = RecvRequest {
                wr_id: handle.wr_id(generation),
                sge: recv.sge(0, BUFFER_SIZE),
            };
            qp.post_recv(&wr, Counters::default())?;
            entry.insert(Connection {
                state,
                generation,
                qp: Some(qp),
                send: Some(send),
                recv: Some(recv),
                id: None,
            });
            handle
        };

        id.set_context(handle.0 as u64);
        if let Err(e) = id.accept() {
            release(&mut lock(&self.conns), handle);
            return Err(e.into());
        }
        if let Some(conn) = lock(&self.conns).get_mut(handle.0) {
            conn.id = Some(id);
        }
        log::info!("accepted connection {}", handle.0);
        Ok(())
    }

    /// Disconnects an established connection. Both sides see `Disconnected`; the connection is
    /// released once the event comes back through [`CmServer::serve_one`].
    ///
    /// # Errors
    ///
    ///  - `StateViolation`: no such connection, or it is not established.
    ///  - `Io`: the provider refused the disconnect.
    pub fn disconnect(&mut self, handle: ConnHandle) -> Result<()> {
        let mut conns = lock(&self.conns);
        let conn = conns
            .get_mut(handle.0)
            .ok_or_else(|| Error::StateViolation {
                from: "Disconnected".into(),
                to: format!("disconnect of unknown connection {}", handle.0),
            })?;
        conn.disconnect(handle)
    }

    fn on_transition(&mut self, handle: ConnHandle, kind: CmEventKind) -> Result<()> {
        let mut conns = lock(&self.conns);
        let Some(conn) = conns.get_mut(handle.0) else {
            return Ok(());
        };
        conn.state = conn.state.on(kind)?;
        match conn.state {
            ConnState::Established => {
                let (Some(qp), Some(send)) = (conn.qp.as_mut(), conn.send.as_mut()) else {
                    return Ok(());
                };
                qp.cm_established()?;
                let mut msg = greeting().into_bytes();
                msg.push(0);
                send.write_at(0, &msg);
                let wr = SendRequest {
                    wr_id: handle.wr_id(conn.generation),
                    sge: send.sge(0, BUFFER_SIZE),
                    signaled: true,
                    inline: false,
                    ud: None,
                };
                qp.post_send(&wr, Counters::default())?;
                log::info!("connection {} established, greeting posted", handle.0);
            }
            ConnState::Disconnected if kind != CmEventKind::TimewaitExit => {
                release(&mut conns, handle);
                log::info!("connection {} closed", handle.0);
            }
            _ => {}
        }
        Ok(())
    }

    /// Stops the poller, disconnects every established connection and releases it, then releases
    /// the shared context.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(poller) = self.poller.take() {
            if poller.join().is_err() {
                log::warn!("completion poller panicked");
            }
        }
        let handles: Vec<_> = lock(&self.conns).iter().map(|(k, _)| ConnHandle(k)).collect();
        for handle in handles {
            let mut conns = lock(&self.conns);
            if let Some(conn) = conns.get_mut(handle.0) {
                if conn.state == ConnState::Established {
                    if let Err(e) = conn.disconnect(handle) {
                        log::warn!("disconnecting connection {} failed: {}", handle.0, e);
                    }
                }
            }
            release(&mut conns, handle);
        }
        if let Some(ctx) = self.slot.take() {
            match Arc::try_unwrap(ctx) {
                Ok(ctx) => drop(ctx),
                Err(_) => log::warn!("shared context still referenced at shutdown"),
            }
        }
    }
}

/// Tears one connection down: queue pair, then regions and their buffers, then the table entry,
/// then the id.
fn release<F: CmFabric>(conns: &mut Slab<Connection<F>>, handle: ConnHandle) {
    let Some(conn) = conns.get_mut(handle.0) else {
        return;
    };
    conn.qp.take();
    conn.send.take();
    conn.recv.take();
    let conn = conns.remove(handle.0);
    drop(conn.id);
}

impl<F: CmFabric> Drop for CmServer<F> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_poller<F: CmFabric>(
    ctx: Arc<FabricContext<F>>,
    conns: Connections<F>,
    notices: Sender<CompletionNotice>,
    stop: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("cq-poller".into())
        .spawn(move || {
            if let Err(e) = poll_completions(&ctx, &conns, &notices, &stop) {
                log::error!("completion poller: {}", e);
            }
        })
        .map_err(Error::resource("poller thread"))
}

fn poll_completions<F: CmFabric>(
    ctx: &FabricContext<F>,
    conns: &Mutex<Slab<Connection<F>>>,
    notices: &Sender<CompletionNotice>,
    stop: &AtomicBool,
) -> Result<()> {
    let cq = ctx.send_cq()?;
    let Some(channel) = ctx.channel()? else {
        return Err(Error::Config("poller needs a completion channel".into()));
    };
    while !stop.load(Ordering::Relaxed) {
        if channel
            .get_event(Some(TICK))
            .map_err(Error::poll("get CQ event"))?
            .is_none()
        {
            continue;
        }
        cq.ack_events(1);
        cq.req_notify()
            .map_err(Error::poll("request CQ notification"))?;
        let mut wc = [WorkCompletion {
            wr_id: 0,
            status: WcStatus::Success,
            opcode: WcOpcode::Send,
            byte_len: 0,
            qp_num: 0,
            vendor_err: 0,
        }];
        while cq.poll(&mut wc).map_err(Error::poll("poll CQ"))? > 0 {
            let Some(notice) = on_completion(&wc[0], conns) else {
                continue;
            };
            if notices.send(notice).is_err() {
                log::trace!("completion notice dropped; nobody is listening");
            }
        }
    }
    Ok(())
}

/// Turns a completion into a notice. Completions whose key now belongs to a later connection
/// are dropped.
fn on_completion<F: CmFabric>(
    wc: &WorkCompletion,
    conns: &Mutex<Slab<Connection<F>>>,
) -> Option<CompletionNotice> {
    let (handle, generation) = ConnHandle::from_wr_id(wc.wr_id);
    let conns = lock(conns);
    let conn = match conns.get(handle.0) {
        Some(c) if c.generation != generation => {
            log::debug!(
                "dropping stale completion ({}) for connection {} generation {}",
                wc.status,
                handle.0,
                generation
            );
            return None;
        }
        conn => conn,
    };
    if !wc.is_success() {
        log::warn!(
            "completion for connection {} failed with status {}",
            handle.0,
            wc.status
        );
        return Some(CompletionNotice::CompletionError {
            handle,
            status: wc.status,
        });
    }
    let notice = match wc.opcode {
        WcOpcode::Recv => {
            let message = conn
                .and_then(|c| c.recv.as_ref().map(read_message))
                .unwrap_or_default();
            log::info!("  -- received message: {}", message);
            CompletionNotice::Received { handle, message }
        }
        WcOpcode::Send => {
            log::info!("  -- send completed successfully.");
            CompletionNotice::SendCompleted { handle }
        }
        WcOpcode::Other(code) => {
            log::warn!("  -- Not sure what is completed, opcode: {}", code);
            CompletionNotice::CompletionError {
                handle,
                status: WcStatus::Other(code),
            }
        }
    };
    Some(notice)
}

/// The active side: connects, receives the server's greeting, disconnects.
// drop order: queue pair, regions, context, id, channel
pub struct CmClient<F: CmFabric> {
    qp: QueuePair<F>,
    send: MemoryRegion<F>,
    recv: MemoryRegion<F>,
    ctx: FabricContext<F>,
    id: F::CmId,
    channel: F::EventChannel,
    connected: bool,
}

impl<F: CmFabric> CmClient<F> {
    /// Resolves `addr`, creates a queue pair, posts a receive and connects. Each step waits at
    /// most `timeout` for its event.
    pub fn connect(fabric: &F, addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let channel = fabric
            .create_event_channel()
            .map_err(Error::resource("CM event channel"))?;
        let mut id = channel.create_id(0).map_err(Error::resource("CM id"))?;

        id.resolve_addr(addr, timeout)?;
        expect_event::<F>(&channel, CmEventKind::AddrResolved, timeout)?;
        id.resolve_route(timeout)?;
        expect_event::<F>(&channel, CmEventKind::RouteResolved, timeout)?;

        let raw = id.context().map_err(Error::resource("device context"))?;
        let opts = ContextOptions {
            cq_depth: CQ_DEPTH,
            events: false,
            split_cqs: false,
        };
        let ctx = FabricContext::with_context(fabric, raw, &opts)?;
        let raw = id
            .create_qp(ctx.pd()?, ctx.send_cq()?, QP_CAPS)
            .map_err(Error::resource("QP"))?;
        let mut qp = QueuePair::adopt(raw, QpType::Rc);
        let send = register_buffer::<F>(ctx.pd()?, BUFFER_SIZE, AccessFlags::default())?;
        let recv = register_buffer::<F>(ctx.pd()?, BUFFER_SIZE, AccessFlags::default())?;
        qp.post_recv(
            &RecvRequest {
                wr_id: 0,
                sge: recv.sge(0, BUFFER_SIZE),
            },
            Counters::default(),
        )?;

        id.connect()?;
        expect_event::<F>(&channel, CmEventKind::Established, timeout)?;
        qp.cm_established()?;
        log::info!("connected to {}", addr);
        Ok(CmClient {
            qp,
            send,
            recv,
            ctx,
            id,
            channel,
            connected: true,
        })
    }

    /// Waits up to `timeout` for the server's greeting.
    pub fn recv_message(&mut self, timeout: Duration) -> Result<String> {
        let engine = CompletionEngine::new(&self.ctx, WaitMode::BusyPoll)?;
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(wc) = engine.poll_once(CqSide::Recv)? {
                cq::check(&wc, "client", Counters::default())?;
                return Ok(read_message(&self.recv));
            }
            if Instant::now() >= deadline {
                return Err(Error::Poll {
                    what: "wait for message",
                    source: std::io::ErrorKind::TimedOut.into(),
                });
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Sends `message` to the server.
    pub fn send_message(&mut self, message: &str) -> Result<()> {
        let mut bytes = message.as_bytes().to_vec();
        bytes.truncate(BUFFER_SIZE - 1);
        bytes.push(0);
        self.send.write_at(0, &bytes);
        let wr = SendRequest {
            wr_id: 0,
            sge: self.send.sge(0, bytes.len()),
            signaled: true,
            inline: false,
            ud: None,
        };
        self.qp.post_send(&wr, Counters::default())?;
        let engine = CompletionEngine::new(&self.ctx, WaitMode::BusyPoll)?;
        let wc = engine.wait_one(CqSide::Send)?;
        cq::check(&wc, "client", Counters::default())
    }

    /// Waits up to `timeout` for the server to close the connection.
    pub fn wait_disconnected(&mut self, timeout: Duration) -> Result<()> {
        if !self.connected {
            return Ok(());
        }
        expect_event::<F>(&self.channel, CmEventKind::Disconnected, timeout)?;
        self.connected = false;
        self.qp.set_error();
        log::info!("server closed the connection");
        Ok(())
    }

    /// Disconnects and waits up to `timeout` for the connection to go down.
    pub fn disconnect(&mut self, timeout: Duration) -> Result<()> {
        if !self.connected {
            return Ok(());
        }
        self.id.disconnect()?;
        self.connected = false;
        self.qp.set_error();
        expect_event::<F>(&self.channel, CmEventKind::Disconnected, timeout)
    }
}

impl<F: CmFabric> Drop for CmClient<F> {
    fn drop(&mut self) {
        if self.connected {
            if let Err(e) = self.id.disconnect() {
                log::debug!("disconnect on drop failed: {}", e);
            }
        }
    }
}

fn expect_event<F: CmFabric>(
    channel: &F::EventChannel,
    want: CmEventKind,
    timeout: Duration,
) -> Result<()> {
    let event = channel
        .get_event(Some(timeout))
        .map_err(Error::poll("get CM event"))?;
    match event {
        Some(ev) if ev.kind == want => Ok(()),
        Some(ev) => Err(Error::HandshakeFailed {
            stage: "connection manager",
            reason: format!("expected {} but got {} (status {})", want, ev.kind, ev.status),
        }),
        None => Err(Error::HandshakeFailed {
            stage: "connection manager",
            reason: format!("timed out waiting for {want}"),
        }),
    }
}
