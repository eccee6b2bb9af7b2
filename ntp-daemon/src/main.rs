//! The `chronyd`-equivalent binary: parses the CLI/config, constructs a
//! [`Daemon`], and runs its event loop until a shutdown signal arrives.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use ntp_daemon::{AddrOrName, Daemon, ParsedConfig, SourceDirective, SourceMode, SourceParams, StdNameResolver};
use ntp_os_clock::UnixClock;
use ntp_proto::LocalClock;

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "ntpd-rs", about = "NTP synchronization daemon")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, env = "NTPD_CONFIG", default_value = "/etc/ntpd-rs/ntpd.toml")]
    config: PathBuf,

    #[arg(long, env = "NTPD_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Performs a one-shot `ntpdate`-style step against `source`
    /// directives before starting the disciplined main loop, using its
    /// own sockets (spec §9 Design Notes).
    #[arg(long)]
    rapid_acquire: bool,
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_signum: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGTERM, request_shutdown as libc::sighandler_t);
        libc::signal(libc::SIGINT, request_shutdown as libc::sighandler_t);
    }
}

fn init_tracing(format: LogFormat) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(env_filter);
    match format {
        LogFormat::Text => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }
}

fn source_params(directive: &SourceDirective) -> SourceParams {
    let mut engine_config = directive.engine_config();
    engine_config.association_mode = match directive.mode {
        SourceMode::Server => ntp_proto::NtpAssociationMode::Client,
        SourceMode::Peer => ntp_proto::NtpAssociationMode::SymmetricActive,
    };
    SourceParams {
        option: directive.select_option(),
        engine_config,
        ..SourceParams::default()
    }
}

fn addr_or_name(address: &str) -> AddrOrName {
    match address.parse::<SocketAddr>() {
        Ok(addr) => AddrOrName::Addr(addr),
        Err(_) => match address.parse::<std::net::IpAddr>() {
            Ok(ip) => AddrOrName::Addr(SocketAddr::new(ip, 123)),
            Err(_) => AddrOrName::Name(address.to_string()),
        },
    }
}

fn run(cli: Cli, config: ParsedConfig) -> Result<(), i32> {
    let mut clock = UnixClock::new();

    if let Some(path) = &config.driftfile {
        match ntp_daemon::driftfile::read(path) {
            Ok(drift) => {
                if let Err(error) = clock.set_frequency(drift.frequency_ppm) {
                    tracing::warn!(?error, "failed to seed frequency from drift file");
                }
            }
            Err(error) => {
                tracing::info!(?error, "no usable drift file, starting from zero frequency");
            }
        }
    }

    if cli.rapid_acquire {
        let addresses: Vec<SocketAddr> = config
            .source
            .iter()
            .filter_map(|s| s.address.parse::<SocketAddr>().ok())
            .collect();
        match ntp_daemon::acquire::acquire(&mut clock, &addresses) {
            Ok(Some(offset)) => tracing::info!(offset = offset.to_seconds(), "rapid acquisition stepped the clock"),
            Ok(None) => tracing::warn!("rapid acquisition: no server replied in time"),
            Err(error) => tracing::warn!(?error, "rapid acquisition failed"),
        }
    }

    let mut daemon = Daemon::new(
        clock,
        config.reference_config(),
        config.selection_config(),
        config.maxsources,
        Box::new(StdNameResolver),
    )
    .map_err(|error| {
        tracing::error!(?error, "failed to initialize daemon");
        exitcode::OSERR
    })?;

    for rule in &config.ntp_access {
        apply_access_rule(&mut daemon.ntp_access, rule);
    }
    for rule in &config.cmd_access {
        apply_access_rule(&mut daemon.cmd_access, rule);
    }
    // the command surface always stays reachable from loopback,
    // regardless of `cmd_access` directives.
    daemon.cmd_access.set("127.0.0.1".parse().unwrap(), 32, ntp_proto::FilterState::Allow, false);
    daemon.cmd_access.set("::1".parse().unwrap(), 128, ntp_proto::FilterState::Allow, false);

    let bind_addr = config.bindaddress.unwrap_or_else(|| SocketAddr::new("0.0.0.0".parse().unwrap(), config.port));
    if let Err(error) = daemon.bind_server(bind_addr) {
        tracing::error!(?error, %bind_addr, "failed to bind NTP server socket");
        return Err(exitcode::OSERR);
    }

    if let Some(cmdsocket) = &config.cmdsocket {
        if let Err(error) = daemon.bind_control_socket(cmdsocket) {
            tracing::error!(?error, path = %cmdsocket.display(), "failed to bind control socket");
            return Err(exitcode::OSERR);
        }
    }

    for directive in &config.source {
        let params = source_params(directive);
        let kind = ntp_proto::SourceKind::Ntp;
        if let Err(error) = daemon.add_source(addr_or_name(&directive.address), kind, params) {
            tracing::warn!(?error, address = %directive.address, "failed to register source");
        }
    }

    install_signal_handlers();
    while !SHUTDOWN.load(Ordering::SeqCst) {
        if let Err(error) = daemon.step() {
            tracing::error!(?error, "event loop step failed");
            return Err(exitcode::OSERR);
        }
    }

    tracing::info!("shutting down");
    if let Some(cmdsocket) = &config.cmdsocket {
        let _ = std::fs::remove_file(cmdsocket);
    }
    if let Some(path) = &config.driftfile {
        let tracking = daemon.reference().tracking();
        let drift = ntp_daemon::driftfile::Drift {
            frequency_ppm: tracking.frequency,
            skew_ppm: tracking.skew,
        };
        if let Err(error) = ntp_daemon::driftfile::write(path, drift) {
            tracing::warn!(?error, "failed to persist drift file on shutdown");
        }
    }

    Ok(())
}

fn apply_access_rule(filter: &mut ntp_proto::AccessFilter, rule: &ntp_daemon::AccessRule) {
    match rule.parse_subnet() {
        Ok(subnet) => {
            let state = match rule.action {
                ntp_daemon::AccessAction::Allow => ntp_proto::FilterState::Allow,
                ntp_daemon::AccessAction::Deny => ntp_proto::FilterState::Deny,
            };
            filter.set(subnet.addr, subnet.prefix_bits, state, false);
        }
        Err(error) => tracing::warn!(?error, subnet = %rule.subnet, "ignoring invalid access rule"),
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    #[cfg(feature = "sentry")]
    let _sentry_guard = sentry::init(sentry::ClientOptions::default());

    let config = match ParsedConfig::load(&cli.config) {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(?error, "failed to load configuration");
            std::process::exit(exitcode::CONFIG);
        }
    };

    match run(cli, config) {
        Ok(()) => std::process::exit(exitcode::OK),
        Err(code) => std::process::exit(code),
    }
}
