//! `ntp-ctl`: a thin CLI client for the control surface (spec §6/§11).
//! Connects to the daemon's control socket, sends one line-delimited
//! JSON request, waits for the matching line-delimited JSON reply, and
//! prints it. No session state is kept across invocations — each
//! subcommand is its own connection, matching the daemon's one-request
//! per connection handling.

use std::io::{Read, Write};
use std::net::IpAddr;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use ntp_daemon::{AccessList, AssociationModeArg, ControlRequest, ControlResponse, SourceKindArg};

#[derive(Debug, Parser)]
#[command(name = "ntp-ctl", about = "control client for the NTP synchronization daemon")]
struct Cli {
    /// Path to the daemon's control socket.
    #[arg(long, env = "NTPD_CMDSOCKET", default_value = "/run/ntpd-rs/ntpd.sock")]
    socket: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Registers a new source.
    AddSource {
        address: String,
        #[arg(long, value_enum, default_value_t = SourceKindArg::Ntp)]
        kind: SourceKindArg,
        #[arg(long, value_enum, default_value_t = AssociationModeArg::Server)]
        mode: AssociationModeArg,
        #[arg(long)]
        prefer: bool,
        #[arg(long)]
        noselect: bool,
        #[arg(long)]
        iburst: bool,
        #[arg(long)]
        presend: bool,
        #[arg(long)]
        auto_offline: bool,
        #[arg(long, default_value_t = 6)]
        minpoll: i8,
        #[arg(long, default_value_t = 10)]
        maxpoll: i8,
    },
    /// Removes a source.
    RemoveSource { id: u32 },
    /// Resumes polling a source that was taken offline.
    Online { id: u32 },
    /// Stops polling a source without removing it.
    Offline { id: u32 },
    /// Requests an out-of-schedule burst of measurements.
    Burst {
        id: u32,
        #[arg(long, default_value_t = 4)]
        good: u8,
        #[arg(long, default_value_t = 8)]
        total: u8,
    },
    /// Writes one source's measurement history under `dumpdir`.
    Dump { id: u32, dumpdir: PathBuf },
    /// Forces the next selected offset to be stepped instead of slewed.
    MakeStep,
    /// Re-runs source selection immediately.
    Reselect,
    /// Prints the current tracking state.
    Tracking,
    /// Lists every configured source and its status.
    Sources,
    /// Lists per-source regression statistics.
    SourceStats,
    /// Reports online/offline/bursting/unresolved source counts.
    Activity,
    /// Adds an allow/deny rule to the NTP or command access list.
    Access {
        #[arg(value_enum)]
        list: AccessList,
        subnet_addr: IpAddr,
        prefix_bits: u8,
        /// Denies the subnet instead of allowing it.
        #[arg(long)]
        deny: bool,
    },
}

fn to_request(command: Command) -> ControlRequest {
    match command {
        Command::AddSource {
            address,
            kind,
            mode,
            prefer,
            noselect,
            iburst,
            presend,
            auto_offline,
            minpoll,
            maxpoll,
        } => ControlRequest::AddSource {
            address,
            kind,
            mode,
            prefer,
            noselect,
            iburst,
            presend,
            auto_offline,
            minpoll,
            maxpoll,
        },
        Command::RemoveSource { id } => ControlRequest::RemoveSource { id },
        Command::Online { id } => ControlRequest::SetOnline { id, online: true },
        Command::Offline { id } => ControlRequest::SetOnline { id, online: false },
        Command::Burst { id, good, total } => ControlRequest::Burst {
            id,
            n_good: good,
            n_total: total,
        },
        Command::Dump { id, dumpdir } => ControlRequest::Dump { id, dumpdir },
        Command::MakeStep => ControlRequest::MakeStep,
        Command::Reselect => ControlRequest::Reselect,
        Command::Tracking => ControlRequest::ReportTracking,
        Command::Sources => ControlRequest::ReportSources,
        Command::SourceStats => ControlRequest::ReportSourceStats,
        Command::Activity => ControlRequest::ReportActivity,
        Command::Access {
            list,
            subnet_addr,
            prefix_bits,
            deny,
        } => ControlRequest::AccessEdit {
            list,
            subnet_addr,
            prefix_bits,
            allow: !deny,
        },
    }
}

fn send_request(socket: &PathBuf, request: &ControlRequest) -> std::io::Result<ControlResponse> {
    let mut stream = UnixStream::connect(socket)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;

    let mut payload = serde_json::to_vec(request).expect("ControlRequest always serializes");
    payload.push(b'\n');
    stream.write_all(&payload)?;

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.contains(&b'\n') {
            break;
        }
    }

    serde_json::from_slice(&buf[..buf.len().saturating_sub(1)])
        .map_err(|error| std::io::Error::new(std::io::ErrorKind::InvalidData, error))
}

fn print_response(response: ControlResponse) -> i32 {
    match response {
        ControlResponse::Ok => {
            println!("OK");
            exitcode::OK
        }
        ControlResponse::SourceAdded { id: Some(id) } => {
            println!("source added, id={id}");
            exitcode::OK
        }
        ControlResponse::SourceAdded { id: None } => {
            println!("name queued for resolution");
            exitcode::OK
        }
        ControlResponse::Error(message) => {
            eprintln!("error: {message}");
            exitcode::DATAERR
        }
        other => {
            match serde_json::to_string_pretty(&other) {
                Ok(text) => println!("{text}"),
                Err(_) => println!("{other:?}"),
            }
            exitcode::OK
        }
    }
}

fn main() {
    tracing_subscriber::fmt().with_target(false).init();

    let cli = Cli::parse();
    let request = to_request(cli.command);

    match send_request(&cli.socket, &request) {
        Ok(response) => std::process::exit(print_response(response)),
        Err(error) => {
            eprintln!(
                "failed to reach ntp-daemon at {}: {error}",
                cli.socket.display()
            );
            std::process::exit(exitcode::UNAVAILABLE);
        }
    }
}
