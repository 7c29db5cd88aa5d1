//! The cycle counter and its frequency.

use std::time::{Duration, Instant};

use crate::error::Result;

const CALIBRATION: Duration = Duration::from_millis(20);

#[cfg(not(target_arch = "x86_64"))]
lazy_static::lazy_static! {
    static ref EPOCH: Instant = Instant::now();
}

/// Reads the cycle counter.
#[cfg(target_arch = "x86_64")]
pub fn now() -> u64 {
    // rdtsc has no preconditions
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Reads the cycle counter; without a TSC this is nanoseconds since first use.
#[cfg(not(target_arch = "x86_64"))]
pub fn now() -> u64 {
    EPOCH.elapsed().as_nanos() as u64
}

/// Counter ticks per microsecond, measured against the monotonic clock.
pub fn measured_mhz() -> f64 {
    let start = Instant::now();
    let c0 = now();
    while start.elapsed() < CALIBRATION {
        std::hint::spin_loop();
    }
    let c1 = now();
    let us = start.elapsed().as_secs_f64() * 1e6;
    c1.saturating_sub(c0) as f64 / us
}

/// The `cpu MHz` reported by `/proc/cpuinfo`.
///
/// Returns `Ok(None)` when no CPU reports a frequency, and the first two values that disagree
/// when CPUs report different ones.
pub fn reported_mhz(cpuinfo: &str) -> std::result::Result<Option<f64>, (f64, f64)> {
    let mut seen: Option<f64> = None;
    for line in cpuinfo.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if key.trim() != "cpu MHz" {
            continue;
        }
        let Ok(mhz) = value.trim().parse::<f64>() else {
            continue;
        };
        match seen {
            None => seen = Some(mhz),
            Some(first) if (first - mhz).abs() > 0.01 => return Err((first, mhz)),
            Some(_) => {}
        }
    }
    Ok(seen)
}

/// Counter ticks per microsecond, used to convert deltas into microseconds.
///
/// On x86-64 the measured TSC rate is cross-checked against `/proc/cpuinfo`. CPUs that report
/// different frequencies are an error unless `allow_mismatch` is set; a reported value more than
/// 1% away from the measured one is only a warning.
#[cfg(target_arch = "x86_64")]
pub fn cpu_mhz(allow_mismatch: bool) -> Result<f64> {
    let measured = measured_mhz();
    let reported = match std::fs::read_to_string("/proc/cpuinfo") {
        Ok(text) => reported_mhz(&text),
        Err(e) => {
            log::debug!("couldn't read /proc/cpuinfo: {}", e);
            Ok(None)
        }
    };
    match reported {
        Ok(Some(reported)) => {
            if (reported - measured).abs() / reported > 0.01 {
                log::warn!(
                    "measured timestamp frequency {:.3} MHz differs from reported CPU frequency {:.3} MHz",
                    measured,
                    reported
                );
            }
            Ok(measured)
        }
        Ok(None) => Ok(measured),
        Err((a, b)) if allow_mismatch => {
            log::warn!("Conflicting CPU frequency values detected: {} != {}", a, b);
            Ok(measured)
        }
        Err((a, b)) => Err(crate::Error::Config(format!(
            "Conflicting CPU frequency values detected: {a} != {b}. \
             CPU frequency scaling may be on; use --CPU-freq to run anyway"
        ))),
    }
}

/// Counter ticks per microsecond; the fallback counter runs at 1 GHz.
#[cfg(not(target_arch = "x86_64"))]
pub fn cpu_mhz(_allow_mismatch: bool) -> Result<f64> {
    Ok(1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_advances() {
        let a = now();
        std::thread::sleep(Duration::from_millis(1));
        assert!(now() > a);
    }

    #[test]
    fn cpuinfo_agreement() {
        let one = "processor\t: 0\ncpu MHz\t\t: 2400.000\nprocessor\t: 1\ncpu MHz\t\t: 2400.000\n";
        assert_eq!(reported_mhz(one), Ok(Some(2400.0)));
        assert_eq!(reported_mhz("model name\t: foo\n"), Ok(None));
        let scaled = "cpu MHz\t\t: 2400.000\ncpu MHz\t\t: 1200.500\n";
        assert_eq!(reported_mhz(scaled), Err((2400.0, 1200.5)));
    }

    #[test]
    fn measured_rate_is_positive() {
        assert!(measured_mhz() > 0.0);
    }
}
