//! hourvault core - connectionless log ingestion into hourly SQLite files
//!
//! Datagrams arrive on a UDP socket, are buffered in a bounded queue and
//! persisted by a single writer into one database file per wall-clock hour.
//! Files older than the retention age are compressed with xz.
//!
//! # Architecture
//!
//! - **Listener**: receives datagrams and stamps them into [`LogRecord`]s
//! - **Queue**: bounded FIFO between the listener and the writer, drops on overflow
//! - **Writer**: owns the active database file and rotates it every hour
//! - **Retention**: background sweep compressing closed files past the retention age

pub mod bucket;
pub mod clock;
pub mod daemon;
pub mod listener;
pub mod queue;
pub mod retention;
pub mod storage;

mod error;
mod types;

pub use bucket::{ActiveBucket, BucketKey, BucketPin, BucketZone};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Result, VaultError};
pub use types::*;

/// hourvault version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    use std::time::Duration;

    /// Pending records held before incoming datagrams are dropped
    pub const QUEUE_CAPACITY: usize = 100_000;

    /// Largest datagram payload read from the socket
    pub const MAX_DATAGRAM_SIZE: usize = 65_535;

    /// Requested socket receive buffer (256KB)
    pub const RECV_BUFFER_SIZE: usize = 262_144;

    /// Listener wait for readability before re-checking shutdown
    pub const LISTENER_POLL_TIMEOUT: Duration = Duration::from_secs(1);

    /// Longest the writer waits on an empty queue before re-evaluating rotation
    pub const WRITER_IDLE_WAIT: Duration = Duration::from_millis(250);

    /// Age after which a closed file is compressed (7 days)
    pub const COMPRESS_AGE: Duration = Duration::from_secs(7 * 86_400);

    /// Retention sweep cadence
    pub const SWEEP_INTERVAL: Duration = Duration::from_secs(3_600);

    /// Listen port when running with root privileges
    pub const PRIVILEGED_PORT: u16 = 514;

    /// Listen port otherwise
    pub const UNPRIVILEGED_PORT: u16 = 5140;

    /// xz preset used for compaction (fast/low)
    pub const XZ_PRESET: u32 = 1;
}
