//! Command-line options of `send_lat` and their validation.

use clap::Parser;

use crate::cq::WaitMode;
use crate::error::{Error, Result};
use crate::fabric::{Mtu, QpType};

/// perftest release this tool reports.
pub const VERSION: f64 = 1.1;
/// Largest inline payload that may be requested.
pub const MAX_INLINE: u32 = 400;
/// Largest UD message.
pub const UD_MAX_MSG: usize = 2048;
/// Largest UD message when GIDs are in use.
pub const UD_MAX_MSG_GID: usize = 1024;

/// The version line printed by `-V`.
pub fn version_string() -> String {
    format!("perftest version : {VERSION:.2}")
}

/// Raw command-line options.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "send_lat",
    about = "Measure one-way send latency between two hosts",
    disable_version_flag = true
)]
pub struct Args {
    /// Listen on / connect to port
    #[arg(short = 'p', long, default_value_t = 18515)]
    pub port: u16,
    /// Connection type RC/UC/UD
    #[arg(short = 'c', long = "connection", default_value = "RC")]
    pub connection: QpType,
    /// MTU size: 256 - 4096 (default port mtu)
    #[arg(short = 'm', long)]
    pub mtu: Option<u32>,
    /// Use IB device (default first device found)
    #[arg(short = 'd', long = "ib-dev")]
    pub ib_dev: Option<String>,
    /// Use port of IB device
    #[arg(short = 'i', long = "ib-port", default_value_t = 1)]
    pub ib_port: u8,
    /// Size of message to exchange
    #[arg(short = 's', long, default_value_t = 2)]
    pub size: usize,
    /// Size of tx queue
    #[arg(short = 't', long = "tx-depth", default_value_t = 50)]
    pub tx_depth: u32,
    /// Number of exchanges (at least 2)
    #[arg(short = 'n', long, default_value_t = 1000)]
    pub iters: usize,
    /// Max size of message to be sent in inline mode
    #[arg(short = 'I', long = "inline_size", default_value_t = MAX_INLINE)]
    pub inline_size: u32,
    /// QP timeout, timeout value is 4 usec * 2 ^(timeout)
    #[arg(short = 'u', long = "qp-timeout", default_value_t = 14)]
    pub qp_timeout: u8,
    /// SL (service level)
    #[arg(short = 'S', long, default_value_t = 0)]
    pub sl: u8,
    /// Test uses GID with GID index
    #[arg(short = 'x', long = "gid-index")]
    pub gid_index: Option<u32>,
    /// Signal completion on each msg
    #[arg(short = 'l', long)]
    pub signal: bool,
    /// Run sizes from 2 till 2^23
    #[arg(short = 'a', long)]
    pub all: bool,
    /// Sleep on CQ events
    #[arg(short = 'e', long)]
    pub events: bool,
    /// Send messages to multicast group (UD only)
    #[arg(short = 'g', long)]
    pub mcg: bool,
    /// Report times in cpu cycle units
    #[arg(short = 'C', long = "report-cycles")]
    pub report_cycles: bool,
    /// Print out all results (default print summary only)
    #[arg(short = 'H', long = "report-histogram")]
    pub report_histogram: bool,
    /// Print out unsorted results (default sorted)
    #[arg(short = 'U', long = "report-unsorted")]
    pub report_unsorted: bool,
    /// Do not fail even if cpufreq_ondemand module is loaded
    #[arg(short = 'F', long = "CPU-freq")]
    pub cpu_freq: bool,
    /// Display version number
    #[arg(short = 'V', long)]
    pub version: bool,
    /// Server to connect to; listen when absent
    pub host: Option<String>,
}

/// A validated benchmark configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct BenchConfig {
    /// TCP port of the exchange.
    pub port: u16,
    /// Transport.
    pub qp_type: QpType,
    /// Path MTU; picked from the device when `None`.
    pub mtu: Option<Mtu>,
    /// Device name; the first device when `None`.
    pub ib_dev: Option<String>,
    /// Device port.
    pub ib_port: u8,
    /// Message size, after the UD clamp.
    pub size: usize,
    /// The requested size when the UD clamp changed it.
    pub clamped_from: Option<usize>,
    /// Run every power of two instead of `size`.
    pub all: bool,
    /// Send queue depth.
    pub tx_depth: u32,
    /// Iterations per size.
    pub iters: usize,
    /// Largest inline payload.
    pub inline_size: u32,
    /// RC ACK timeout exponent.
    pub qp_timeout: u8,
    /// Service level.
    pub sl: u8,
    /// GID index; GID routing is used when set.
    pub gid_index: Option<u32>,
    /// Signal every send.
    pub signal_every: bool,
    /// How to wait for completions.
    pub wait: WaitMode,
    /// UD multicast.
    pub mcg: bool,
    /// Report in cycles instead of microseconds.
    pub report_cycles: bool,
    /// Print every sorted delta.
    pub report_histogram: bool,
    /// Print every delta in measurement order.
    pub report_unsorted: bool,
    /// Run even when CPUs report different frequencies.
    pub cpu_freq_tolerant: bool,
    /// Server to connect to.
    pub host: Option<String>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        BenchConfig {
            port: 18515,
            qp_type: QpType::Rc,
            mtu: None,
            ib_dev: None,
            ib_port: 1,
            size: 2,
            clamped_from: None,
            all: false,
            tx_depth: 50,
            iters: 1000,
            inline_size: MAX_INLINE,
            qp_timeout: 14,
            sl: 0,
            gid_index: None,
            signal_every: false,
            wait: WaitMode::BusyPoll,
            mcg: false,
            report_cycles: false,
            report_histogram: false,
            report_unsorted: false,
            cpu_freq_tolerant: false,
            host: None,
        }
    }
}

impl TryFrom<Args> for BenchConfig {
    type Error = Error;

    fn try_from(args: Args) -> Result<Self> {
        let bad = |msg: String| Err(Error::Config(msg));
        if args.iters < 2 {
            return bad(format!("iterations must be at least 2, got {}", args.iters));
        }
        if args.tx_depth < 3 {
            return bad(format!("tx depth must be at least 3, got {}", args.tx_depth));
        }
        if args.inline_size > MAX_INLINE {
            return bad(format!(
                "inline size must be at most {MAX_INLINE}, got {}",
                args.inline_size
            ));
        }
        if args.size < 1 {
            return bad("message size must be at least 1".into());
        }
        if args.ib_port < 1 {
            return bad("IB port must be at least 1".into());
        }
        if args.sl > 15 {
            return bad(format!("SL must be at most 15, got {}", args.sl));
        }
        if let Some(idx) = args.gid_index {
            if idx > 63 {
                return bad(format!("GID index must be at most 63, got {idx}"));
            }
        }
        let mtu = match args.mtu {
            Some(m) => Some(
                Mtu::try_from(m).map_err(|m| Error::Config(format!("invalid MTU {m}")))?,
            ),
            None => None,
        };
        let mut mcg = args.mcg;
        if mcg && args.connection != QpType::Ud {
            log::warn!("multicast is only supported over UD; ignoring --mcg");
            mcg = false;
        }

        let mut size = args.size;
        let mut clamped_from = None;
        if args.connection == QpType::Ud {
            let max = if args.gid_index.is_some() {
                UD_MAX_MSG_GID
            } else {
                UD_MAX_MSG
            };
            if size > max {
                clamped_from = Some(size);
                size = max;
            }
        }

        Ok(BenchConfig {
            port: args.port,
            qp_type: args.connection,
            mtu,
            ib_dev: args.ib_dev,
            ib_port: args.ib_port,
            size,
            clamped_from,
            all: args.all,
            tx_depth: args.tx_depth,
            iters: args.iters,
            inline_size: args.inline_size,
            qp_timeout: args.qp_timeout,
            sl: args.sl,
            gid_index: args.gid_index,
            signal_every: args.signal,
            wait: if args.events {
                WaitMode::Events
            } else {
                WaitMode::BusyPoll
            },
            mcg,
            report_cycles: args.report_cycles,
            report_histogram: args.report_histogram,
            report_unsorted: args.report_unsorted,
            cpu_freq_tolerant: args.cpu_freq,
            host: args.host,
        })
    }
}

impl BenchConfig {
    /// Exponent bound of the size sweep: sizes run from `2^1` to `2^(max_pow - 1)`.
    pub fn max_pow(&self) -> u32 {
        match (self.qp_type, self.gid_index) {
            (QpType::Ud, Some(_)) => 11,
            (QpType::Ud, None) => 12,
            _ => 24,
        }
    }

    /// Message sizes to run, in order.
    pub fn sizes(&self) -> Vec<usize> {
        if self.all {
            (1..self.max_pow()).map(|p| 1usize << p).collect()
        } else {
            vec![self.size]
        }
    }

    /// Largest message the buffer must hold.
    pub fn capacity(&self) -> usize {
        self.sizes().into_iter().max().unwrap_or(self.size)
    }

    /// Whether GID routing is in use.
    pub fn uses_gid(&self) -> bool {
        self.gid_index.is_some()
    }

    /// Whether `size` goes out inline.
    pub fn inline(&self, size: usize) -> bool {
        size > 0 && size <= self.inline_size as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<BenchConfig> {
        let args = Args::try_parse_from(std::iter::once("send_lat").chain(args.iter().copied()))
            .map_err(|e| Error::Config(e.to_string()))?;
        BenchConfig::try_from(args)
    }

    #[test]
    fn defaults_match_default() {
        assert_eq!(parse(&[]).unwrap(), BenchConfig::default());
    }

    #[test]
    fn client_options() {
        let c = parse(&["-c", "UC", "-s", "64", "-t", "10", "-n", "5", "-e", "-l", "host1"]).unwrap();
        assert_eq!(c.qp_type, QpType::Uc);
        assert_eq!(c.size, 64);
        assert_eq!(c.wait, WaitMode::Events);
        assert!(c.signal_every);
        assert_eq!(c.host.as_deref(), Some("host1"));
    }

    #[test]
    fn out_of_range_values_are_config_errors() {
        for args in [
            &["-n", "1"][..],
            &["-t", "2"],
            &["-I", "401"],
            &["-m", "1500"],
            &["-s", "0"],
            &["-S", "16"],
            &["-x", "64"],
        ] {
            let err = parse(args).err().unwrap();
            assert!(matches!(err, Error::Config(_)), "{args:?}");
            assert_eq!(err.exit_code(), 1);
        }
        assert!(parse(&["-c", "XRC"]).is_err());
    }

    #[test]
    fn ud_clamps_and_sweeps_less() {
        let c = parse(&["-c", "UD", "-s", "4096"]).unwrap();
        assert_eq!((c.size, c.clamped_from), (2048, Some(4096)));
        let c = parse(&["-c", "UD", "-x", "0", "-s", "4096"]).unwrap();
        assert_eq!(c.size, 1024);
        let c = parse(&["-c", "UD", "-a"]).unwrap();
        assert_eq!(c.sizes().last(), Some(&2048));
        assert_eq!(c.capacity(), 2048);
        let c = parse(&["-a"]).unwrap();
        assert_eq!(c.sizes().len(), 23);
        assert_eq!(c.sizes()[0], 2);
        assert_eq!(c.capacity(), 1 << 23);
    }

    #[test]
    fn multicast_needs_ud() {
        assert!(!parse(&["-g"]).unwrap().mcg);
        assert!(parse(&["-g", "-c", "UD"]).unwrap().mcg);
    }

    #[test]
    fn inline_threshold() {
        let c = BenchConfig::default();
        assert!(c.inline(2));
        assert!(c.inline(400));
        assert!(!c.inline(401));
    }

    #[test]
    fn version_line() {
        assert_eq!(version_string(), "perftest version : 1.10");
    }
}
