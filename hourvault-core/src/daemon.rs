//! Daemon - owns the pipeline components and their lifecycle
//!
//! The listener and the writer run on dedicated OS threads; the retention
//! compactor runs as a tokio task. Shutdown cancels the listener, lets the
//! writer drain every queued record and close the active file, then stops
//! the compactor between sweeps.

use crate::config;
use crate::listener::{Listener, ListenerConfig, ListenerStats};
use crate::queue::{self, QueueStats, QueueStatsSnapshot};
use crate::retention::{CompressorChoice, RetentionCompactor, RetentionConfig};
use crate::storage::{Writer, WriterConfig, WriterStats};
use crate::{ActiveBucket, BucketKey, BucketZone, Clock, Result, VaultError};
use serde::{Serialize, Serializer};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Process configuration, built once by the binary
#[derive(Debug, Clone, Serialize)]
pub struct DaemonConfig {
    /// Directory for hourly database files; must already exist
    pub db_dir: PathBuf,
    /// UDP listen address
    pub bind_addr: SocketAddr,
    /// Requested socket receive buffer
    pub recv_buffer_size: usize,
    /// Pending records held before dropping
    pub queue_capacity: usize,
    /// Retention age before compression
    #[serde(serialize_with = "as_secs")]
    pub compress_age: Duration,
    /// Time between retention sweeps
    #[serde(serialize_with = "as_secs")]
    pub sweep_interval: Duration,
    /// Zone for hour buckets
    pub zone: BucketZone,
    /// Compressor used by the retention sweep
    pub compressor: CompressorChoice,
    #[serde(skip)]
    pub listener_poll_timeout: Duration,
    #[serde(skip)]
    pub writer_idle_wait: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            db_dir: PathBuf::from("./db"),
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, config::UNPRIVILEGED_PORT)),
            recv_buffer_size: config::RECV_BUFFER_SIZE,
            queue_capacity: config::QUEUE_CAPACITY,
            compress_age: config::COMPRESS_AGE,
            sweep_interval: config::SWEEP_INTERVAL,
            zone: BucketZone::default(),
            compressor: CompressorChoice::default(),
            listener_poll_timeout: config::LISTENER_POLL_TIMEOUT,
            writer_idle_wait: config::WRITER_IDLE_WAIT,
        }
    }
}

impl DaemonConfig {
    /// Reject configurations the pipeline cannot start with
    pub fn validate(&self) -> Result<()> {
        if !self.db_dir.is_dir() {
            return Err(VaultError::Config(format!(
                "database directory {} does not exist",
                self.db_dir.display()
            )));
        }
        if self.queue_capacity == 0 {
            return Err(VaultError::Config("queue capacity must be non-zero".into()));
        }
        if self.sweep_interval.is_zero() {
            return Err(VaultError::Config("sweep interval must be non-zero".into()));
        }
        Ok(())
    }

    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            bind_addr: self.bind_addr,
            recv_buffer_size: self.recv_buffer_size,
            poll_timeout: self.listener_poll_timeout,
        }
    }

    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            db_dir: self.db_dir.clone(),
            zone: self.zone,
            idle_wait: self.writer_idle_wait,
        }
    }

    pub fn retention_config(&self) -> RetentionConfig {
        RetentionConfig {
            db_dir: self.db_dir.clone(),
            compress_age: self.compress_age,
            sweep_interval: self.sweep_interval,
            zone: self.zone,
        }
    }
}

fn as_secs<S: Serializer>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_secs())
}

/// Totals collected from every component on shutdown
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ShutdownReport {
    pub listener: ListenerStats,
    pub writer: WriterStats,
    pub queue: QueueStatsSnapshot,
}

/// Running pipeline
pub struct Daemon {
    token: CancellationToken,
    local_addr: SocketAddr,
    initial_bucket: BucketKey,
    queue_stats: Arc<QueueStats>,
    listener: thread::JoinHandle<ListenerStats>,
    writer: thread::JoinHandle<WriterStats>,
    compactor: tokio::task::JoinHandle<()>,
}

impl Daemon {
    /// Validate, bind, open the initial file and spawn every component
    ///
    /// Any error returned here is fatal for the process. Must be called
    /// from within a tokio runtime.
    pub fn start(config: DaemonConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let listener = Listener::bind(&config.listener_config(), clock.clone())?;
        let local_addr = listener.local_addr()?;

        let active = ActiveBucket::new();
        let mut writer = Writer::new(config.writer_config(), clock.clone(), active.clone());
        let initial_bucket = writer.open_initial()?;

        let (producer, consumer) = queue::bounded(config.queue_capacity);
        let queue_stats = producer.stats();
        let token = CancellationToken::new();

        // Writer first: if the listener fails to spawn, the dropped producer stops it
        let writer = thread::Builder::new()
            .name("hourvault-writer".into())
            .spawn(move || writer.run(consumer))?;

        let listener_token = token.clone();
        let listener = thread::Builder::new()
            .name("hourvault-listener".into())
            .spawn(move || listener.run(producer, listener_token))?;

        let compactor = Arc::new(RetentionCompactor::new(
            config.retention_config(),
            config.compressor.build(config::XZ_PRESET),
            active,
            clock,
        ));
        let compactor = tokio::spawn(compactor.run(token.clone()));

        info!(
            %local_addr,
            dir = %config.db_dir.display(),
            bucket = %initial_bucket,
            "Pipeline started"
        );

        Ok(Self {
            token,
            local_addr,
            initial_bucket,
            queue_stats,
            listener,
            writer,
            compactor,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Bucket of the file opened at startup
    pub fn initial_bucket(&self) -> BucketKey {
        self.initial_bucket
    }

    pub fn queue_stats(&self) -> QueueStatsSnapshot {
        self.queue_stats.snapshot()
    }

    /// Token cancelled when shutdown begins
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stop ingestion, drain the queue, close the active file
    pub async fn shutdown(self) -> Result<ShutdownReport> {
        info!("Shutting down pipeline");
        self.token.cancel();

        // A failed listener has still dropped its producer; the writer drains regardless
        let listener = join_thread(self.listener, "listener").await;
        let writer = join_thread(self.writer, "writer").await;
        if let Err(e) = self.compactor.await {
            warn!(error = %e, "Retention compactor task failed");
        }

        let writer = writer?;
        let listener = match listener {
            Ok(stats) => stats,
            Err(e) => {
                warn!(inserted = writer.inserted, "Writer drained after listener failure");
                return Err(e);
            }
        };

        Ok(ShutdownReport {
            listener,
            writer,
            queue: self.queue_stats.snapshot(),
        })
    }
}

async fn join_thread<T: Send + 'static>(
    handle: thread::JoinHandle<T>,
    name: &'static str,
) -> Result<T> {
    tokio::task::spawn_blocking(move || handle.join())
        .await
        .map_err(|e| VaultError::Internal(format!("failed to join {} thread: {}", name, e)))?
        .map_err(|_| VaultError::Internal(format!("{} thread panicked", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LogRecord, SystemClock};
    use rusqlite::Connection;
    use std::net::UdpSocket;
    use std::path::Path;
    use tempfile::TempDir;

    fn test_config(dir: &Path) -> DaemonConfig {
        DaemonConfig {
            db_dir: dir.to_path_buf(),
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            zone: BucketZone::Utc,
            listener_poll_timeout: Duration::from_millis(50),
            writer_idle_wait: Duration::from_millis(5),
            ..Default::default()
        }
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..500 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    /// (file name, timestamp, host, message) for every row in the directory
    fn all_rows(dir: &Path) -> Vec<(String, i64, String, String)> {
        let mut rows = Vec::new();
        for entry in std::fs::read_dir(dir).unwrap() {
            let name = entry.unwrap().file_name().into_string().unwrap();
            if !name.ends_with(".sqlite3") {
                continue;
            }
            let conn = Connection::open(dir.join(&name)).unwrap();
            let mut stmt = conn
                .prepare("SELECT timestamp, host, message FROM log ORDER BY id")
                .unwrap();
            let found = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })
                .unwrap()
                .map(|r| r.unwrap());
            for (ts, host, message) in found {
                rows.push((name.clone(), ts, host, message));
            }
        }
        rows
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_datagram_persisted_after_drain() {
        let temp_dir = TempDir::new().unwrap();
        let daemon = Daemon::start(test_config(temp_dir.path()), Arc::new(SystemClock)).unwrap();

        let sent_at = SystemClock.now();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"hello", daemon.local_addr()).unwrap();
        wait_for(|| daemon.queue_stats().enqueued == 1).await;

        let report = daemon.shutdown().await.unwrap();
        assert_eq!(report.writer.inserted, 1);
        assert_eq!(report.listener.dropped, 0);

        let rows = all_rows(temp_dir.path());
        assert_eq!(rows.len(), 1);
        let (file, ts, host, message) = &rows[0];
        assert_eq!(message, "hello");
        assert_eq!(host, "127.0.0.1");
        assert!((ts - sent_at).abs() <= 1);
        assert_eq!(
            file,
            &BucketKey::from_timestamp(*ts, BucketZone::Utc).unwrap().file_name()
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_drains_queue_in_order() {
        let temp_dir = TempDir::new().unwrap();
        let daemon = Daemon::start(test_config(temp_dir.path()), Arc::new(SystemClock)).unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        for i in 0..100 {
            sender.send_to(format!("msg-{:03}", i).as_bytes(), daemon.local_addr()).unwrap();
        }
        wait_for(|| daemon.queue_stats().enqueued == 100).await;

        let report = daemon.shutdown().await.unwrap();
        assert_eq!(report.writer.inserted, 100);

        let mut rows = all_rows(temp_dir.path());
        // An hour boundary may split the run across two files
        rows.sort_by(|a, b| (a.1, &a.0).cmp(&(b.1, &b.0)));
        let messages: Vec<_> = rows.iter().map(|r| r.3.clone()).collect();
        let expected: Vec<_> = (0..100).map(|i| format!("msg-{:03}", i)).collect();
        assert_eq!(messages, expected);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_startup_compresses_aged_file() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        let conn = Connection::open(dir.join("2020010100.sqlite3")).unwrap();
        conn.execute_batch("CREATE TABLE IF NOT EXISTS log (id INTEGER PRIMARY KEY AUTOINCREMENT, timestamp INTEGER, host TEXT, message TEXT);")
            .unwrap();
        conn.close().unwrap();

        let daemon = Daemon::start(test_config(dir), Arc::new(SystemClock)).unwrap();
        wait_for(|| dir.join("2020010100.sqlite3.xz").exists()).await;
        daemon.shutdown().await.unwrap();

        assert!(!dir.join("2020010100.sqlite3").exists());
        // The file opened at startup is never compressed
        let current = BucketKey::from_timestamp(SystemClock.now(), BucketZone::Utc).unwrap();
        assert!(!dir.join(current.compressed_file_name()).exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_drains_writer_after_listener_panic() {
        let temp_dir = TempDir::new().unwrap();
        let config = DaemonConfig {
            // Long enough that the writer is still waiting when the listener dies
            writer_idle_wait: Duration::from_millis(200),
            ..test_config(temp_dir.path())
        };

        let active = ActiveBucket::new();
        let mut writer = Writer::new(config.writer_config(), Arc::new(SystemClock), active.clone());
        let initial_bucket = writer.open_initial().unwrap();

        let (producer, consumer) = queue::bounded(16);
        let queue_stats = producer.stats();
        let writer = thread::spawn(move || writer.run(consumer));

        let now = SystemClock.now();
        let listener = thread::spawn(move || -> ListenerStats {
            for i in 0..3 {
                producer.enqueue(LogRecord::new(now, "10.0.0.1", format!("m{}", i)));
            }
            panic!("socket gone");
        });

        let daemon = Daemon {
            token: CancellationToken::new(),
            local_addr: "127.0.0.1:0".parse().unwrap(),
            initial_bucket,
            queue_stats,
            listener,
            writer,
            compactor: tokio::spawn(async {}),
        };

        let err = daemon.shutdown().await.unwrap_err();
        assert!(matches!(err, VaultError::Internal(_)));
        assert!(err.to_string().contains("listener"));

        // The writer was joined: active file closed and every record stored
        assert_eq!(active.get(), None);
        assert_eq!(all_rows(temp_dir.path()).len(), 3);
    }

    #[tokio::test]
    async fn test_start_rejects_missing_dir() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir.path().join("absent"));
        let err = Daemon::start(config, Arc::new(SystemClock)).err().unwrap();
        assert!(matches!(err, VaultError::Config(_)));
        assert!(err.is_fatal_at_startup());
    }

    #[tokio::test]
    async fn test_start_rejects_taken_port() {
        let temp_dir = TempDir::new().unwrap();
        let taken = UdpSocket::bind("127.0.0.1:0").unwrap();
        let config = DaemonConfig {
            bind_addr: taken.local_addr().unwrap(),
            ..test_config(temp_dir.path())
        };
        let err = Daemon::start(config, Arc::new(SystemClock)).err().unwrap();
        assert!(matches!(err, VaultError::Bind { .. }));
    }

    #[test]
    fn test_config_validation() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = test_config(temp_dir.path());
        assert!(config.validate().is_ok());

        config.queue_capacity = 0;
        assert!(config.validate().is_err());

        config.queue_capacity = 10;
        config.sweep_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let file = temp_dir.path().join("plain-file");
        std::fs::write(&file, b"").unwrap();
        config.sweep_interval = Duration::from_secs(1);
        config.db_dir = file;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serializes_durations_as_secs() {
        let json = serde_json::to_value(DaemonConfig::default()).unwrap();
        assert_eq!(json["compress_age"], 604_800);
        assert_eq!(json["sweep_interval"], 3_600);
        assert_eq!(json["queue_capacity"], 100_000);
        assert_eq!(json["zone"], "local");
        assert_eq!(json["compressor"], "linked");
        assert!(json.get("writer_idle_wait").is_none());
    }
}
