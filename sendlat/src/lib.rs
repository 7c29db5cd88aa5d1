//! Send-latency measurement over RDMA verbs, and a connection-manager demo.
//!
//! Two peers connect a pair of queue pairs and then ping-pong small messages: the client sends,
//! the server answers every receive with a send of its own, and each side stamps the cycle
//! counter as it posts. Half the round trip between consecutive stamps is the one-way latency
//! reported in the perftest format. The pieces, from the bottom up:
//!
//!  - [`fabric`]: the provider traits, plus an in-process [`fabric::soft::SoftFabric`] and (with
//!    the `verbs` feature) the `libibverbs`/`librdmacm` provider.
//!  - [`context`]: a device context with its protection domain, completion queues and optional
//!    completion channel.
//!  - [`mr`]: page-aligned registered buffers and where the send and receive areas sit in them.
//!  - [`exchange`]: the fixed-width ASCII record both sides swap over TCP before they can talk
//!    over the fabric.
//!  - [`qp`]: the RESET, INIT, RTR, RTS walk of a queue pair, checked at every step.
//!  - [`cq`]: waiting for completions by spinning or by blocking on a completion channel.
//!  - [`bench`]: the ping-pong loop and its signaling policy.
//!  - [`report`]: turning time stamps into the min/max/typical row.
//!  - [`cm`]: a connection-manager server that greets every client with its pid, and the client
//!    that talks to it.
//!
//! # Runtime requirements
//!
//! The `verbs` provider needs `libibverbs` and `librdmacm` from [`rdma-core`] at build and run
//! time, and an RDMA device (a [SoftRoCE][soft] device on a regular NIC works). The binaries
//! are only built with the feature; without it the library and its tests run on the in-process
//! fabric.
//!
//! Much of the documentation of the verbs borrows from [RDMAmojo].
//!
//! [`rdma-core`]: https://github.com/linux-rdma/rdma-core
//! [soft]: https://github.com/SoftRoCE/rxe-dev/wiki/rxe-dev:-Home
//! [RDMAmojo]: http://www.rdmamojo.com/

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
// avoid warnings about RDMAmojo, SoftRoCE, InfiniBand, etc. not being in backticks
#![allow(clippy::doc_markdown)]

pub mod bench;
pub mod clock;
pub mod cm;
pub mod config;
pub mod context;
pub mod cq;
pub mod error;
pub mod exchange;
pub mod fabric;
pub mod mr;
pub mod qp;
pub mod report;

pub use error::{Error, Result};
