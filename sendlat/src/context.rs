//! An opened device with the resources every connection on it shares.

use crate::error::{Error, Result};
use crate::fabric::{CqId, DeviceContext, DeviceInfo, Fabric, Gid, PortInfo};

/// Id reported by the completion channel for the send CQ (or the only CQ).
pub const SEND_CQ: CqId = CqId(1);
/// Id reported by the completion channel for the receive CQ.
pub const RECV_CQ: CqId = CqId(2);

/// How to build a [`FabricContext`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ContextOptions {
    /// Minimum entries per completion queue.
    pub cq_depth: u32,
    /// Create a completion channel and attach the CQs to it.
    pub events: bool,
    /// Separate send and receive CQs; otherwise one CQ serves both.
    pub split_cqs: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            cq_depth: 50,
            events: false,
            split_cqs: true,
        }
    }
}

// fields drop in order: CQs before the channel they are attached to, everything before the device
struct Resources<F: Fabric> {
    send_cq: F::Cq,
    recv_cq: Option<F::Cq>,
    channel: Option<F::Channel>,
    pd: F::Pd,
    ctx: F::Context,
}

/// A device context, its protection domain, its completion queues and (in event mode) the
/// completion channel they report to.
///
/// Queue pairs and memory regions created from a `FabricContext` must be dropped before it.
pub struct FabricContext<F: Fabric> {
    fabric: F,
    device: DeviceInfo,
    res: Option<Resources<F>>,
}

impl<F: Fabric> FabricContext<F> {
    /// Opens the device named `selector`, or the first device when `selector` is `None`.
    ///
    /// # Errors
    ///
    ///  - `DeviceNotFound`: no device matches, or there are no devices at all.
    ///  - `ResourceExhausted`: the context, PD, channel or a CQ could not be created.
    pub fn open(fabric: &F, selector: Option<&str>, opts: &ContextOptions) -> Result<Self> {
        let devices = fabric.devices()?;
        let device = match selector {
            Some(name) => devices
                .into_iter()
                .find(|d| d.name == name)
                .ok_or_else(|| Error::DeviceNotFound(Some(name.to_string())))?,
            None => devices
                .into_iter()
                .next()
                .ok_or(Error::DeviceNotFound(None))?,
        };
        let ctx = fabric
            .open(&device)
            .map_err(Error::resource("device context"))?;
        Self::with_context(fabric, ctx, opts)
    }

    /// Builds the shared resources on an already opened device context.
    pub fn with_context(fabric: &F, ctx: F::Context, opts: &ContextOptions) -> Result<Self> {
        let device = ctx.device().clone();
        let pd = ctx.alloc_pd().map_err(Error::resource("PD"))?;
        let channel = if opts.events {
            Some(
                ctx.create_channel()
                    .map_err(Error::resource("completion channel"))?,
            )
        } else {
            None
        };
        let send_cq = ctx
            .create_cq(opts.cq_depth, channel.as_ref(), SEND_CQ)
            .map_err(Error::resource("CQ"))?;
        let recv_cq = if opts.split_cqs {
            Some(
                ctx.create_cq(opts.cq_depth, channel.as_ref(), RECV_CQ)
                    .map_err(Error::resource("CQ"))?,
            )
        } else {
            None
        };
        log::debug!(
            "opened {} (cq depth {}, events: {})",
            device.name,
            opts.cq_depth,
            opts.events
        );
        Ok(FabricContext {
            fabric: fabric.clone(),
            device,
            res: Some(Resources {
                send_cq,
                recv_cq,
                channel,
                pd,
                ctx,
            }),
        })
    }

    fn res(&self) -> Result<&Resources<F>> {
        self.res.as_ref().ok_or_else(|| Error::StateViolation {
            from: "CLOSED".into(),
            to: format!("use of {}", self.device.name),
        })
    }

    /// The provider this context was opened through.
    pub fn fabric(&self) -> &F {
        &self.fabric
    }

    /// The device this context was opened on.
    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    /// The underlying device context.
    pub fn context(&self) -> Result<&F::Context> {
        Ok(&self.res()?.ctx)
    }

    /// The protection domain.
    pub fn pd(&self) -> Result<&F::Pd> {
        Ok(&self.res()?.pd)
    }

    /// The completion channel, if this context was opened for events.
    pub fn channel(&self) -> Result<Option<&F::Channel>> {
        Ok(self.res()?.channel.as_ref())
    }

    /// The send CQ.
    pub fn send_cq(&self) -> Result<&F::Cq> {
        Ok(&self.res()?.send_cq)
    }

    /// The receive CQ; the same as the send CQ when the queues are not split.
    pub fn recv_cq(&self) -> Result<&F::Cq> {
        let res = self.res()?;
        Ok(res.recv_cq.as_ref().unwrap_or(&res.send_cq))
    }

    /// Attributes of `port`.
    pub fn port_info(&self, port: u8) -> Result<PortInfo> {
        Ok(self.context()?.query_port(port)?)
    }

    /// Entry `index` of the GID table of `port`.
    pub fn gid(&self, port: u8, index: u32) -> Result<Gid> {
        Ok(self.context()?.query_gid(port, index)?)
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.res.is_none()
    }

    /// Releases the CQs, the channel, the PD and the device context. Calling it again does
    /// nothing.
    pub fn close(&mut self) {
        if self.res.take().is_some() {
            log::debug!("closed {}", self.device.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::soft::{Resource, SoftFabric};
    use crate::fabric::CompletionQueue;

    #[test]
    fn open_first_device_and_close_twice() {
        let fabric = SoftFabric::new();
        let mut ctx = FabricContext::open(&fabric, None, &ContextOptions::default()).unwrap();
        assert_eq!(ctx.device().name, "soft0");
        assert_eq!(ctx.send_cq().unwrap().id(), SEND_CQ);
        assert_eq!(ctx.recv_cq().unwrap().id(), RECV_CQ);
        assert!(ctx.channel().unwrap().is_none());
        ctx.close();
        ctx.close();
        assert!(ctx.is_closed());
        assert!(ctx.pd().is_err());
        assert!(fabric.counters().balanced());
    }

    #[test]
    fn unknown_device_is_reported_by_name() {
        let fabric = SoftFabric::new();
        let err = FabricContext::open(&fabric, Some("mlx5_9"), &ContextOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, Error::DeviceNotFound(Some(ref n)) if n == "mlx5_9"));
        assert_eq!(err.exit_code(), 7);
    }

    #[test]
    fn empty_device_list() {
        let fabric = SoftFabric::with_devices(&[]);
        let err = FabricContext::open(&fabric, None, &ContextOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, Error::DeviceNotFound(None)));
    }

    #[test]
    fn combined_cq_with_channel() {
        let fabric = SoftFabric::new();
        let opts = ContextOptions {
            cq_depth: 10,
            events: true,
            split_cqs: false,
        };
        let ctx = FabricContext::open(&fabric, None, &opts).unwrap();
        assert_eq!(ctx.recv_cq().unwrap().id(), SEND_CQ);
        assert!(ctx.channel().unwrap().is_some());
        assert_eq!(fabric.counters().live(Resource::Cq), 1);
        assert_eq!(fabric.counters().live(Resource::Channel), 1);
    }
}
