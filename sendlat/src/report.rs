//! Latency statistics and the perftest report format.

use std::fmt;

use crate::config::{BenchConfig, UD_MAX_MSG, UD_MAX_MSG_GID};
use crate::exchange::ConnectionParameters;
use crate::fabric::QpType;

/// Separator line around the banner and the table.
pub const RULE: &str = "------------------------------------------------------------------";

/// Header of the results table.
pub const TABLE_HEADER: &str =
    " #bytes #iterations    t_min[usec]    t_max[usec]  t_typical[usec]";

/// Lines printed before anything is allocated: test name, inline threshold, transport, and any
/// size adjustment.
pub fn banner(cfg: &BenchConfig) -> Vec<String> {
    let mut out = vec![RULE.to_string()];
    if cfg.mcg && cfg.qp_type == QpType::Ud {
        out.push("                    Send Latency Multicast Test".into());
    } else {
        out.push("                    Send Latency Test".into());
    }
    out.push(format!(
        "Inline data is used up to {} bytes message",
        cfg.inline_size
    ));
    out.push(format!("Connection type : {}", cfg.qp_type));
    if cfg.uses_gid() {
        out.push(
            "Using GID to support RDMAoE configuration. Refer to port type as Ethernet, default MTU 1024B"
                .into(),
        );
    }
    if cfg.qp_type == QpType::Ud {
        let requested = if cfg.all {
            1 << 23
        } else {
            cfg.clamped_from.unwrap_or(cfg.size)
        };
        if requested > UD_MAX_MSG {
            out.push(format!(
                "Max msg size in UD is {UD_MAX_MSG} changing to {UD_MAX_MSG}"
            ));
        }
        if cfg.uses_gid() && requested > UD_MAX_MSG_GID {
            out.push(format!(
                "Max msg size in UD RDMAoE is {UD_MAX_MSG_GID}. changing to {UD_MAX_MSG_GID}"
            ));
        }
    }
    out
}

/// `   local address: LID ... QPN ... PSN ...`, followed by the GID when there is one.
pub fn address_lines(which: &str, p: &ConnectionParameters) -> Vec<String> {
    let mut out = vec![format!(
        "{:>8} address: LID {:#04x} QPN {:#06x} PSN {:#06x}",
        which, p.lid, p.qpn, p.psn
    )];
    if let Some(gid) = p.gid {
        out.push(format!("                  GID: {gid}"));
    }
    out
}

/// Unit the report is printed in.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Units {
    /// Raw cycle-counter ticks.
    Cycles,
    /// Microseconds, given the counter frequency in MHz.
    Micros {
        /// Counter ticks per microsecond.
        mhz: f64,
    },
}

impl Units {
    /// Ticks per output unit.
    pub fn ticks_per_unit(&self) -> f64 {
        match self {
            Units::Cycles => 1.0,
            Units::Micros { mhz } => *mhz,
        }
    }

    /// One-way latency, in this unit, for a round trip of `ticks`.
    pub fn one_way(&self, ticks: f64) -> f64 {
        ticks / self.ticks_per_unit() / 2.0
    }
}

impl fmt::Display for Units {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Units::Cycles => "cycles",
            Units::Micros { .. } => "usec",
        })
    }
}

/// Median of an already sorted slice; the mean of the two middle values for even lengths.
///
/// Returns `None` for an empty slice.
pub fn median(sorted: &[u64]) -> Option<f64> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    Some(if n % 2 == 1 {
        sorted[n / 2] as f64
    } else {
        (sorted[n / 2 - 1] as f64 + sorted[n / 2] as f64) / 2.0
    })
}

/// Smallest, largest and typical round trip, in ticks.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Summary {
    /// Smallest delta.
    pub min: u64,
    /// Largest delta.
    pub max: u64,
    /// Median delta.
    pub median: f64,
}

/// Round-trip deltas between consecutive time stamps of one run.
#[derive(Clone, Debug)]
pub struct Report {
    deltas: Vec<u64>,
    sorted: Vec<u64>,
}

impl Report {
    /// Differences between consecutive stamps; `None` with fewer than two stamps.
    pub fn from_samples(stamps: &[u64]) -> Option<Self> {
        if stamps.len() < 2 {
            return None;
        }
        let deltas: Vec<u64> = stamps
            .windows(2)
            .map(|w| w[1].saturating_sub(w[0]))
            .collect();
        let mut sorted = deltas.clone();
        sorted.sort_unstable();
        Some(Report { deltas, sorted })
    }

    /// Number of deltas.
    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    /// Always false; a report has at least one delta.
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    /// Deltas in measurement order.
    pub fn deltas(&self) -> &[u64] {
        &self.deltas
    }

    /// Min, max and median.
    pub fn summary(&self) -> Summary {
        Summary {
            min: self.sorted[0],
            max: self.sorted[self.sorted.len() - 1],
            median: median(&self.sorted).unwrap_or_default(),
        }
    }

    /// The table row for messages of `size` bytes over `iters` iterations.
    pub fn row(&self, size: usize, iters: usize, units: Units) -> String {
        let s = self.summary();
        format!(
            "{:7}        {}        {:7.2}        {:7.2}          {:7.2}",
            size,
            iters,
            units.one_way(s.min as f64),
            units.one_way(s.max as f64),
            units.one_way(s.median),
        )
    }

    /// `#, <unit>` followed by one `i, latency` line per delta in measurement order.
    pub fn unsorted_lines(&self, units: Units) -> Vec<String> {
        lines(&self.deltas, units)
    }

    /// `#, <unit>` followed by one `i, latency` line per delta in ascending order.
    pub fn histogram_lines(&self, units: Units) -> Vec<String> {
        lines(&self.sorted, units)
    }
}

fn lines(deltas: &[u64], units: Units) -> Vec<String> {
    std::iter::once(format!("#, {units}"))
        .chain(
            deltas
                .iter()
                .enumerate()
                .map(|(i, &d)| format!("{}, {}", i + 1, format_g(units.one_way(d as f64)))),
        )
        .collect()
}

fn trim_fraction(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

/// Formats like C's `%g`: six significant digits, no trailing zeros, exponent form for very
/// large or very small values.
pub fn format_g(v: f64) -> String {
    if v == 0.0 || !v.is_finite() {
        return format!("{v}");
    }
    let exp = v.abs().log10().floor() as i32;
    if !(-4..6).contains(&exp) {
        let s = format!("{v:.5e}");
        match s.split_once('e') {
            Some((mantissa, e)) => {
                let e: i32 = e.parse().unwrap_or(0);
                let sign = if e < 0 { '-' } else { '+' };
                format!("{}e{}{:02}", trim_fraction(mantissa), sign, e.abs())
            }
            None => s,
        }
    } else {
        let decimals = (5 - exp).max(0) as usize;
        trim_fraction(&format!("{v:.decimals$}")).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_of_odd_and_even() {
        assert_eq!(median(&[1, 2, 3, 4, 5]), Some(3.0));
        assert_eq!(median(&[1, 2, 3, 4]), Some(2.5));
        assert_eq!(median(&[7]), Some(7.0));
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn deltas_between_consecutive_stamps() {
        let r = Report::from_samples(&[10, 13, 20, 22]).unwrap();
        assert_eq!(r.deltas(), &[3, 7, 2]);
        let s = r.summary();
        assert_eq!((s.min, s.max, s.median), (2, 7, 3.0));
        assert!(Report::from_samples(&[5]).is_none());
    }

    #[test]
    fn row_halves_the_round_trip() {
        let r = Report::from_samples(&[0, 200, 600]).unwrap();
        let row = r.row(2, 1000, Units::Micros { mhz: 100.0 });
        assert_eq!(
            row,
            "      2        1000           1.00           2.00             1.50"
        );
        let cycles = r.row(2, 3, Units::Cycles);
        assert!(cycles.ends_with("150.00"), "{cycles}");
    }

    #[test]
    fn histogram_is_sorted_and_unsorted_is_not() {
        let r = Report::from_samples(&[0, 40, 60]).unwrap();
        assert_eq!(r.unsorted_lines(Units::Cycles), ["#, cycles", "1, 20", "2, 10"]);
        assert_eq!(r.histogram_lines(Units::Cycles), ["#, cycles", "1, 10", "2, 20"]);
    }

    #[test]
    fn banner_mentions_transport_and_clamp() {
        let cfg = BenchConfig {
            qp_type: QpType::Ud,
            size: 2048,
            clamped_from: Some(4096),
            mcg: true,
            ..BenchConfig::default()
        };
        let lines = banner(&cfg);
        assert_eq!(lines[0], RULE);
        assert!(lines[1].ends_with("Send Latency Multicast Test"));
        assert_eq!(lines[2], "Inline data is used up to 400 bytes message");
        assert_eq!(lines[3], "Connection type : UD");
        assert_eq!(lines[4], "Max msg size in UD is 2048 changing to 2048");
        assert_eq!(banner(&BenchConfig::default()).len(), 4);
    }

    #[test]
    fn address_line_format() {
        let p = ConnectionParameters {
            lid: 1,
            qpn: 0x4a,
            psn: 0x12_3456,
            ..ConnectionParameters::default()
        };
        assert_eq!(
            address_lines("local", &p),
            ["   local address: LID 0x01 QPN 0x004a PSN 0x123456"]
        );
        let with_gid = ConnectionParameters {
            gid: Some([0xfe; 16].into()),
            ..p
        };
        let lines = address_lines("remote", &with_gid);
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("                  GID: fe:fe:"));
    }

    #[test]
    fn g_format() {
        assert_eq!(format_g(1.5), "1.5");
        assert_eq!(format_g(0.0), "0");
        assert_eq!(format_g(123456.0), "123456");
        assert_eq!(format_g(1234567.0), "1.23457e+06");
        assert_eq!(format_g(0.00001), "1e-05");
        assert_eq!(format_g(2.25), "2.25");
    }
}
