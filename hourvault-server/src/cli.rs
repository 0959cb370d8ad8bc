//! Command-line interface

use clap::{Parser, ValueEnum};
use hourvault_core::config;
use hourvault_core::daemon::DaemonConfig;
use hourvault_core::retention::CompressorChoice;
use hourvault_core::BucketZone;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Receive raw or syslog datagrams and store them in hourly SQLite files.
#[derive(Debug, Parser)]
#[command(name = "hourvaultd")]
#[command(version)]
pub struct Args {
    /// Database directory; must already exist.
    #[arg(short = 'd', long, env = "HOURVAULT_DB_DIR", default_value = "./db")]
    pub db_dir: PathBuf,

    /// UDP listen port [default: 514 as root, 5140 otherwise]
    #[arg(short = 'p', long, env = "HOURVAULT_PORT")]
    pub port: Option<u16>,

    /// Address to bind.
    #[arg(long, env = "HOURVAULT_BIND", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// Verbose logging.
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Seconds after which a closed hourly file is compressed.
    #[arg(long, env = "HOURVAULT_COMPRESS_AGE", default_value_t = config::COMPRESS_AGE.as_secs())]
    pub compress_age: u64,

    /// Seconds between retention sweeps.
    #[arg(
        long,
        env = "HOURVAULT_SWEEP_INTERVAL",
        default_value_t = config::SWEEP_INTERVAL.as_secs(),
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub sweep_interval: u64,

    /// Pending messages held before new ones are dropped.
    #[arg(long, env = "HOURVAULT_QUEUE_CAPACITY", default_value_t = config::QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    /// Requested socket receive buffer in bytes.
    #[arg(long, default_value_t = config::RECV_BUFFER_SIZE)]
    pub recv_buffer: usize,

    /// Name hourly files by UTC instead of local time.
    #[arg(long, env = "HOURVAULT_UTC")]
    pub utc: bool,

    /// Compression backend for aged files.
    #[arg(long, value_enum, default_value_t = CompressorKind::Linked)]
    pub compressor: CompressorKind,

    /// xz program used by the external compressor.
    #[arg(long, default_value = "xz")]
    pub xz_path: PathBuf,

    /// Log output format.
    #[arg(long, value_enum, env = "HOURVAULT_LOG_FORMAT", default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CompressorKind {
    /// Built-in xz encoder
    Linked,
    /// Run the xz program
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

impl Args {
    /// Listen port, falling back to the privilege-dependent default
    pub fn resolved_port(&self) -> u16 {
        self.port.unwrap_or_else(|| {
            if running_as_root() {
                config::PRIVILEGED_PORT
            } else {
                config::UNPRIVILEGED_PORT
            }
        })
    }

    pub fn into_config(self) -> DaemonConfig {
        let bind_addr = SocketAddr::new(self.bind, self.resolved_port());
        let compressor = match self.compressor {
            CompressorKind::Linked => CompressorChoice::Linked,
            CompressorKind::External => CompressorChoice::External {
                program: self.xz_path,
            },
        };

        DaemonConfig {
            db_dir: self.db_dir,
            bind_addr,
            recv_buffer_size: self.recv_buffer,
            queue_capacity: self.queue_capacity,
            compress_age: Duration::from_secs(self.compress_age),
            sweep_interval: Duration::from_secs(self.sweep_interval),
            zone: if self.utc { BucketZone::Utc } else { BucketZone::Local },
            compressor,
            ..DaemonConfig::default()
        }
    }
}

#[cfg(unix)]
fn running_as_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    false
}
