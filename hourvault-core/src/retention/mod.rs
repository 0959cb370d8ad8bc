//! Retention sweep - compresses closed hourly files past the retention age
//!
//! Each sweep lists the database directory, picks `<YYYYMMDDHH>.sqlite3`
//! files whose hour started at least `compress_age` ago, and rewrites
//! them as `<YYYYMMDDHH>.sqlite3.xz`. The compressed output is written to
//! a `.partial` sibling, synced and linked into place before the
//! plaintext is removed, so a failed sweep leaves the original for the
//! next one. An existing archive is never replaced.

mod compressor;

pub use compressor::{Compressor, ExternalXz, LinkedXz};

use crate::{ActiveBucket, BucketKey, BucketZone, Clock, Result, VaultError};
use serde::Serialize;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const PARTIAL_SUFFIX: &str = "partial";

/// Which compressor the sweep uses
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressorChoice {
    /// In-process xz encoder
    #[default]
    Linked,
    /// External `xz` program at the given path
    External { program: PathBuf },
}

impl CompressorChoice {
    pub fn build(&self, preset: u32) -> Arc<dyn Compressor> {
        match self {
            CompressorChoice::Linked => Arc::new(LinkedXz::new(preset)),
            CompressorChoice::External { program } => Arc::new(ExternalXz::new(program.clone(), preset)),
        }
    }
}

/// Retention configuration
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Directory holding the hourly database files
    pub db_dir: PathBuf,
    /// Files whose hour started at least this long ago are compressed
    pub compress_age: Duration,
    /// Time between sweeps
    pub sweep_interval: Duration,
    /// Zone the bucket keys were written in
    pub zone: BucketZone,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            db_dir: PathBuf::from("db"),
            compress_age: crate::config::COMPRESS_AGE,
            sweep_interval: crate::config::SWEEP_INTERVAL,
            zone: BucketZone::default(),
        }
    }
}

/// Outcome of one sweep
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// Entries whose name matched the bucket file pattern
    pub candidates: usize,
    /// Compressed outputs produced
    pub compressed: Vec<PathBuf>,
    /// Old enough but currently open for writes
    pub skipped_active: usize,
    /// Plaintext left in place because its archive already exists
    pub skipped_archived: usize,
    /// Directory entries that could not be inspected
    pub unreadable: usize,
    /// Compression attempts that failed; originals kept
    pub failed: usize,
}

/// Background compactor for aged database files
#[derive(Debug)]
pub struct RetentionCompactor {
    config: RetentionConfig,
    compressor: Arc<dyn Compressor>,
    active: ActiveBucket,
    clock: Arc<dyn Clock>,
}

impl RetentionCompactor {
    pub fn new(
        config: RetentionConfig,
        compressor: Arc<dyn Compressor>,
        active: ActiveBucket,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            compressor,
            active,
            clock,
        }
    }

    /// Run one pass over the database directory
    pub fn sweep(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let age_secs = i64::try_from(self.config.compress_age.as_secs()).unwrap_or(i64::MAX);
        let mut report = SweepReport::default();

        // Listing is opened here and closed when the iterator drops
        let entries = fs::read_dir(&self.config.db_dir)?;
        for entry in entries {
            let Some((key, path)) = self.bucket_entry(entry, &mut report) else {
                continue;
            };

            let Some(start) = key.start_timestamp(self.config.zone) else {
                warn!(bucket = %key, "Bucket hour does not exist in local time, skipping");
                continue;
            };
            if now.saturating_sub(start) < age_secs {
                continue;
            }

            // Held until compression finishes; the writer waits on it for late records
            let Some(_pin) = self.active.try_pin(key) else {
                report.skipped_active += 1;
                debug!(bucket = %key, "Skipping database file in use by the writer");
                continue;
            };
            if self.active.is_active(&key) {
                report.skipped_active += 1;
                debug!(bucket = %key, "Skipping active database file");
                continue;
            }

            if !path.exists() {
                continue;
            }
            if path.with_file_name(key.compressed_file_name()).exists() {
                report.skipped_archived += 1;
                warn!(file = %path.display(), "Compressed archive already exists, keeping plaintext");
                continue;
            }

            match self.compact_file(&path, key) {
                Ok(out) => {
                    info!(
                        file = %path.display(),
                        compressor = self.compressor.name(),
                        "Compressed database file"
                    );
                    report.compressed.push(out);
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(file = %path.display(), error = %e, "Compression failed, keeping original");
                }
            }
        }

        Ok(report)
    }

    /// Sweep every interval until cancelled; the first sweep runs immediately
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            dir = %self.config.db_dir.display(),
            compress_age_secs = self.config.compress_age.as_secs(),
            interval_secs = self.config.sweep_interval.as_secs(),
            "Retention compactor started"
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let compactor = self.clone();
                    match tokio::task::spawn_blocking(move || compactor.sweep()).await {
                        Ok(Ok(report)) => debug!(
                            candidates = report.candidates,
                            compressed = report.compressed.len(),
                            failed = report.failed,
                            "Retention sweep finished"
                        ),
                        Ok(Err(e)) => warn!(error = %e, "Retention sweep failed"),
                        Err(e) => error!(error = %e, "Retention sweep panicked"),
                    }
                }
            }
        }

        info!("Retention compactor stopped");
    }

    /// Bucket key and path of a plaintext database file, counting it as a
    /// candidate; entries that cannot be inspected are logged and skipped
    fn bucket_entry(
        &self,
        entry: std::io::Result<fs::DirEntry>,
        report: &mut SweepReport,
    ) -> Option<(BucketKey, PathBuf)> {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                report.unreadable += 1;
                warn!(dir = %self.config.db_dir.display(), error = %e, "Failed to read directory entry");
                return None;
            }
        };
        let key = entry.file_name().to_str().and_then(BucketKey::from_file_name)?;
        match entry.file_type() {
            Ok(kind) if kind.is_file() => {}
            Ok(_) => return None,
            Err(e) => {
                report.unreadable += 1;
                warn!(file = %entry.path().display(), error = %e, "Failed to stat directory entry");
                return None;
            }
        }

        report.candidates += 1;
        Some((key, entry.path()))
    }

    fn compact_file(&self, src: &Path, key: BucketKey) -> Result<PathBuf> {
        let dst = src.with_file_name(key.compressed_file_name());
        let partial = src.with_file_name(format!("{}.{}", key.compressed_file_name(), PARTIAL_SUFFIX));

        if let Err(e) = self.write_verified(src, &partial) {
            let _ = fs::remove_file(&partial);
            return Err(e);
        }

        // Linking fails if the archive appeared meanwhile, so it is never replaced
        let published = fs::hard_link(&partial, &dst);
        let _ = fs::remove_file(&partial);
        if let Err(e) = published {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                return Err(VaultError::Compression(format!(
                    "{} already exists",
                    dst.display()
                )));
            }
            return Err(e.into());
        }
        fs::remove_file(src)?;
        Ok(dst)
    }

    fn write_verified(&self, src: &Path, partial: &Path) -> Result<()> {
        self.compressor.compress(src, partial)?;

        let written = File::open(partial)?;
        written.sync_all()?;
        if written.metadata()?.len() == 0 {
            return Err(VaultError::Compression(format!(
                "{} produced an empty file",
                self.compressor.name()
            )));
        }
        Ok(())
    }
}
