//! `send_lat`: one-way send latency between two hosts.
//!
//! Run without a host to wait for a client; run with the server's host name to start the test.

use clap::Parser;

use sendlat::bench::Session;
use sendlat::clock;
use sendlat::config::{version_string, Args, BenchConfig};
use sendlat::fabric::{default_fabric, QpType};
use sendlat::report::{self, Units, RULE, TABLE_HEADER};
use sendlat::{Error, Result};

fn init_logging() {
    let env = env_logger::Env::new().filter_or("RUST_LOG", "warn");
    env_logger::Builder::from_env(env).format_timestamp(None).init();
}

fn run(cfg: BenchConfig) -> Result<()> {
    for line in report::banner(&cfg) {
        println!("{line}");
    }

    let mut session = Session::prepare(&default_fabric(), cfg)?;
    for line in report::address_lines("local", session.local()) {
        println!("{line}");
    }

    let stream = session.establish()?;
    session.connect(stream)?;
    if let Some(remote) = session.remote() {
        for line in report::address_lines("remote", remote) {
            println!("{line}");
        }
    }

    let cfg = session.config().clone();
    if cfg.qp_type != QpType::Ud {
        println!("Mtu : {}", session.mtu());
    }
    if cfg.wait == sendlat::cq::WaitMode::Events {
        println!("Test with events.");
    }
    println!("{RULE}");
    println!("{TABLE_HEADER}");

    let units = if cfg.report_cycles {
        Units::Cycles
    } else {
        Units::Micros {
            mhz: clock::cpu_mhz(cfg.cpu_freq_tolerant)?,
        }
    };
    log::debug!("reporting in {}", units);

    for size in cfg.sizes() {
        let run = session.run_size(size)?;
        log::debug!(
            "size {}: {} sends, {} receives, {} signaled",
            size,
            run.sends,
            run.recvs,
            run.signaled
        );
        let Some(report) = run.report() else {
            continue;
        };
        if cfg.report_unsorted {
            for line in report.unsorted_lines(units) {
                println!("{line}");
            }
        }
        if cfg.report_histogram {
            for line in report.histogram_lines(units) {
                println!("{line}");
            }
        }
        println!("{}", report.row(size, cfg.iters, units));
    }
    println!("{RULE}");
    Ok(())
}

fn main() {
    init_logging();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if e.use_stderr() => {
            eprintln!("{e}");
            std::process::exit(Error::Config(String::new()).exit_code());
        }
        Err(e) => e.exit(),
    };
    if args.version {
        println!("{}", version_string());
        return;
    }

    let result = BenchConfig::try_from(args).and_then(run);
    if let Err(e) = result {
        log::error!("{}", e);
        std::process::exit(e.exit_code());
    }
}
