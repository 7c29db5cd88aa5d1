//! `cm_server`: a connection-manager server that greets every client with its pid.
//!
//! With `--client` it instead connects to a running server, prints the greeting and disconnects.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use clap::Parser;

use sendlat::cm::{CmClient, CmServer, CompletionNotice, DEFAULT_PORT};
use sendlat::fabric::{default_fabric, Fabric};
use sendlat::{Error, Result};

const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "cm_server", about = "RDMA connection-manager demo")]
struct Args {
    /// Listen on this local address (default: every address)
    #[arg(short = 's', long, num_args = 0..=1, default_missing_value = "0.0.0.0")]
    server: Option<IpAddr>,
    /// Connect to the server at this address instead of listening
    #[arg(short = 'c', long, conflicts_with = "server")]
    client: Option<IpAddr>,
    /// Port to listen on or connect to
    #[arg(short = 'p', long, default_value_t = DEFAULT_PORT)]
    port: u16,
}

fn init_logging() {
    let env = env_logger::Env::new().filter_or("RUST_LOG", "warn");
    env_logger::Builder::from_env(env).format_timestamp(None).init();
}

fn print_notice(notice: CompletionNotice) {
    match notice {
        CompletionNotice::Received { handle, message } => {
            log::debug!("message on connection {}", handle.0);
            println!("  -- received message: {message}");
        }
        CompletionNotice::SendCompleted { .. } => println!("  -- send completed successfully."),
        CompletionNotice::CompletionError { handle, status } => {
            log::warn!("work request on connection {} failed: {}", handle.0, status);
        }
    }
}

fn serve(addr: SocketAddr) -> Result<()> {
    let fabric = default_fabric();
    let devices = fabric
        .devices()
        .map_err(|_| Error::DeviceNotFound(None))?;
    println!("{} device(s) are present on the system:", devices.len());
    for (i, d) in devices.iter().enumerate() {
        println!("{}. device = {}", i + 1, d.name);
    }

    let (mut server, notices) = CmServer::bind(&fabric, addr)?;
    println!("listening on port {}.", server.local_port());

    let printer = std::thread::Builder::new()
        .name("notice-printer".into())
        .spawn(move || {
            for notice in notices {
                print_notice(notice);
            }
        })?;

    let result = server.run();
    // dropping the server closes the notice channel, which ends the printer
    drop(server);
    if printer.join().is_err() {
        log::warn!("notice printer panicked");
    }
    result
}

fn connect(addr: SocketAddr) -> Result<()> {
    let fabric = default_fabric();
    let mut client = CmClient::connect(&fabric, addr, CLIENT_TIMEOUT)?;
    println!("connected to {addr}.");
    let message = client.recv_message(CLIENT_TIMEOUT)?;
    println!("  -- received message: {message}");
    client.disconnect(CLIENT_TIMEOUT)?;
    println!("disconnected.");
    Ok(())
}

fn main() {
    init_logging();
    let args = Args::parse();

    let result = match args.client {
        Some(ip) => connect(SocketAddr::new(ip, args.port)),
        None => {
            let ip = args.server.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
            serve(SocketAddr::new(ip, args.port))
        }
    };
    if let Err(e) = result {
        log::error!("{}", e);
        std::process::exit(e.exit_code());
    }
}
