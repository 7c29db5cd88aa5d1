//! Waiting for completions.

use std::io;

use crate::context::FabricContext;
use crate::error::{Counters, Error, Result};
use crate::fabric::{
    CompletionChannel, CompletionQueue, Fabric, WcOpcode, WcStatus, WorkCompletion,
};

/// How to wait for a completion.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaitMode {
    /// Spin on the CQ.
    BusyPoll,
    /// Sleep on the completion channel until the CQ fires.
    Events,
}

/// Which of the two CQs to wait on.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CqSide {
    /// The send CQ.
    Send,
    /// The receive CQ.
    Recv,
}

const EMPTY: WorkCompletion = WorkCompletion {
    wr_id: 0,
    status: WcStatus::Success,
    opcode: WcOpcode::Send,
    byte_len: 0,
    qp_num: 0,
    vendor_err: 0,
};

/// Pulls completions off the send and receive CQs of a [`FabricContext`].
pub struct CompletionEngine<'a, F: Fabric> {
    send: &'a F::Cq,
    recv: &'a F::Cq,
    channel: Option<&'a F::Channel>,
    mode: WaitMode,
}

impl<'a, F: Fabric> CompletionEngine<'a, F> {
    /// An engine over the CQs of `ctx`.
    ///
    /// Event mode needs a context that was opened with a completion channel.
    pub fn new(ctx: &'a FabricContext<F>, mode: WaitMode) -> Result<Self> {
        let channel = ctx.channel()?;
        if mode == WaitMode::Events && channel.is_none() {
            return Err(Error::Config(
                "event mode needs a completion channel".into(),
            ));
        }
        Ok(CompletionEngine {
            send: ctx.send_cq()?,
            recv: ctx.recv_cq()?,
            channel,
            mode,
        })
    }

    /// The wait mode.
    pub fn mode(&self) -> WaitMode {
        self.mode
    }

    fn cq(&self, side: CqSide) -> &'a F::Cq {
        match side {
            CqSide::Send => self.send,
            CqSide::Recv => self.recv,
        }
    }

    /// Requests a notification for the next completion on both CQs. Event mode only; call it
    /// once before the first wait.
    pub fn arm(&self) -> Result<()> {
        if self.mode == WaitMode::Events {
            self.send
                .req_notify()
                .map_err(Error::poll("request CQ notification"))?;
            self.recv
                .req_notify()
                .map_err(Error::poll("request CQ notification"))?;
        }
        Ok(())
    }

    /// Takes one completion off `side` if there is one.
    pub fn poll_once(&self, side: CqSide) -> Result<Option<WorkCompletion>> {
        let mut wc = [EMPTY];
        let n = self
            .cq(side)
            .poll(&mut wc)
            .map_err(Error::poll("poll CQ"))?;
        Ok(if n == 0 { None } else { Some(wc[0]) })
    }

    /// Waits until one completion is available on `side` and returns it.
    pub fn wait_one(&self, side: CqSide) -> Result<WorkCompletion> {
        match (self.mode, self.channel) {
            (WaitMode::Events, Some(channel)) => self.wait_event(channel, side),
            _ => loop {
                if let Some(wc) = self.poll_once(side)? {
                    return Ok(wc);
                }
                std::hint::spin_loop();
            },
        }
    }

    fn wait_event(&self, channel: &F::Channel, side: CqSide) -> Result<WorkCompletion> {
        loop {
            if let Some(wc) = self.poll_once(side)? {
                return Ok(wc);
            }
            let Some(id) = channel
                .get_event(None)
                .map_err(Error::poll("get CQ event"))?
            else {
                continue;
            };
            let cq = if id == self.send.id() {
                self.send
            } else if id == self.recv.id() {
                self.recv
            } else {
                return Err(Error::Poll {
                    what: "get CQ event",
                    source: io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("event for unknown CQ {}", id.0),
                    ),
                });
            };
            cq.ack_events(1);
            cq.req_notify()
                .map_err(Error::poll("request CQ notification"))?;
        }
    }
}

/// Turns a failed completion into [`Error::Completion`].
pub fn check(wc: &WorkCompletion, side: &'static str, counters: Counters) -> Result<()> {
    if wc.is_success() {
        return Ok(());
    }
    log::debug!(
        "completion with error at {}: status {}, wr_id {}, syndrome {:#x}",
        side,
        wc.status,
        wc.wr_id,
        wc.vendor_err
    );
    Err(Error::Completion {
        side,
        status: wc.status,
        wr_id: wc.wr_id,
        counters,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextOptions;
    use crate::fabric::soft::SoftFabric;

    #[test]
    fn events_need_a_channel() {
        let fabric = SoftFabric::new();
        let ctx = FabricContext::open(&fabric, None, &ContextOptions::default()).unwrap();
        assert!(matches!(
            CompletionEngine::new(&ctx, WaitMode::Events),
            Err(Error::Config(_))
        ));
        let engine = CompletionEngine::new(&ctx, WaitMode::BusyPoll).unwrap();
        assert!(engine.poll_once(CqSide::Send).unwrap().is_none());
        engine.arm().unwrap();
    }

    #[test]
    fn failed_completion_carries_counters() {
        let wc = WorkCompletion {
            wr_id: 2,
            status: WcStatus::WrFlush,
            opcode: WcOpcode::Recv,
            ..EMPTY
        };
        let counters = Counters {
            scnt: 5,
            rcnt: 6,
            ccnt: 0,
        };
        match check(&wc, "server", counters) {
            Err(Error::Completion {
                side,
                status,
                wr_id,
                counters: c,
            }) => {
                assert_eq!(side, "server");
                assert_eq!(status, WcStatus::WrFlush);
                assert_eq!(wr_id, 2);
                assert_eq!(c, counters);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(check(&EMPTY, "client", counters).is_ok());
    }
}
