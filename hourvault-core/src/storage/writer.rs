//! Writer - sole owner of the active database file

use super::{HourlyDatabase, WriterConfig};
use crate::queue::{Dequeued, QueueConsumer};
use crate::{ActiveBucket, BucketKey, Clock, LogRecord, Result, VaultError};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Rotation state machine
#[derive(Debug)]
pub enum RotationState {
    /// Startup, or the last open attempt failed
    NoFileOpen,
    /// Handle on the file for the current hour
    FileOpen(HourlyDatabase),
}

/// Writer counters, returned when the writer exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriterStats {
    pub inserted: u64,
    pub failed: u64,
    pub rotations: u64,
    pub stragglers: u64,
    /// Late records whose hour was already compressed
    pub late_dropped: u64,
}

/// Drains the queue into hourly database files
pub struct Writer {
    config: WriterConfig,
    clock: Arc<dyn Clock>,
    active: ActiveBucket,
    state: RotationState,
    rotation_failed: Option<BucketKey>,
    stats: WriterStats,
}

impl Writer {
    /// Create a writer with no file open
    pub fn new(config: WriterConfig, clock: Arc<dyn Clock>, active: ActiveBucket) -> Self {
        Self {
            config,
            clock,
            active,
            state: RotationState::NoFileOpen,
            rotation_failed: None,
            stats: WriterStats::default(),
        }
    }

    /// Bucket of the open file, if any
    pub fn active_key(&self) -> Option<BucketKey> {
        match &self.state {
            RotationState::FileOpen(db) => Some(db.key()),
            RotationState::NoFileOpen => None,
        }
    }

    pub fn state(&self) -> &RotationState {
        &self.state
    }

    pub fn stats(&self) -> WriterStats {
        self.stats
    }

    /// Open the file for the current hour; failure here is fatal at startup
    pub fn open_initial(&mut self) -> Result<BucketKey> {
        let key = self.current_bucket()?;
        self.rotate_to(key)?;
        Ok(key)
    }

    /// Rotate when the wall-clock hour differs from the open file
    ///
    /// Returns `true` if a new file was opened.
    pub fn rotate_if_needed(&mut self) -> Result<bool> {
        let key = self.current_bucket()?;
        if self.active_key() == Some(key) || self.rotation_failed == Some(key) {
            return Ok(false);
        }

        match self.rotate_to(key) {
            Ok(()) => {
                self.rotation_failed = None;
                Ok(true)
            }
            Err(e) => {
                self.rotation_failed = Some(key);
                Err(e)
            }
        }
    }

    /// Persist one record into the file for the hour it was received in
    ///
    /// A failed insert is logged and counted; the record is discarded.
    pub fn persist(&mut self, record: &LogRecord) -> Result<()> {
        let result = self.route(record);
        match &result {
            Ok(()) => self.stats.inserted += 1,
            Err(e) => {
                self.stats.failed += 1;
                warn!(
                    host = %record.source(),
                    timestamp = record.received_at(),
                    error = %e,
                    "Failed to persist record, discarding"
                );
            }
        }
        result
    }

    /// Drain the queue until the producer is gone and the queue is empty
    pub fn run(mut self, consumer: QueueConsumer) -> WriterStats {
        info!(dir = %self.config.db_dir.display(), "Writer started");

        loop {
            if let Err(e) = self.rotate_if_needed() {
                error!(error = %e, "Database rotation failed");
            }

            match consumer.dequeue_timeout(self.config.idle_wait) {
                Dequeued::Record(record) => {
                    if self.persist(&record).is_err() {
                        // Logged and counted by persist; the record is gone
                        continue;
                    }
                }
                Dequeued::Idle => {}
                Dequeued::Closed => break,
            }
        }

        if let Err(e) = self.close() {
            warn!(error = %e, "Failed to close active database");
        }

        info!(
            inserted = self.stats.inserted,
            failed = self.stats.failed,
            rotations = self.stats.rotations,
            "Writer stopped"
        );
        self.stats
    }

    /// Close the active file, if any
    pub fn close(&mut self) -> Result<()> {
        let result = self.close_active();
        self.active.clear();
        result
    }

    fn route(&mut self, record: &LogRecord) -> Result<()> {
        let key = BucketKey::from_timestamp(record.received_at(), self.config.zone)?;

        match self.active_key() {
            Some(active) if active == key => self.insert_active(record),
            Some(active) if active > key => self.insert_straggler(key, record),
            _ => {
                self.rotate_to(key)?;
                self.insert_active(record)
            }
        }
    }

    fn insert_active(&self, record: &LogRecord) -> Result<()> {
        match &self.state {
            RotationState::FileOpen(db) => db.insert(record).map(|_| ()),
            RotationState::NoFileOpen => Err(VaultError::Internal("no database file open".into())),
        }
    }

    // Received before the hour turned but dequeued after the rotation.
    // The pin keeps the retention sweep off this bucket until the
    // short-lived handle is closed.
    fn insert_straggler(&mut self, key: BucketKey, record: &LogRecord) -> Result<()> {
        let _pin = self.active.pin(key);
        if self.config.db_dir.join(key.compressed_file_name()).exists() {
            self.stats.late_dropped += 1;
            warn!(bucket = %key, "Hour already compressed, dropping late record");
            return Err(VaultError::Archived(key.to_string()));
        }

        let db = HourlyDatabase::open(&self.config.db_dir, key)?;
        let inserted = db.insert(record);
        let closed = db.close();
        inserted?;
        closed?;

        self.stats.stragglers += 1;
        debug!(bucket = %key, "Routed late record to its own hour file");
        Ok(())
    }

    fn rotate_to(&mut self, key: BucketKey) -> Result<()> {
        if let Err(e) = self.close_active() {
            warn!(error = %e, "Failed to close previous database");
        }

        // Publish before opening so the retention sweep never sees the new file unguarded
        {
            let _pin = self.active.pin(key);
            self.active.set(key);
        }
        match HourlyDatabase::open(&self.config.db_dir, key) {
            Ok(db) => {
                info!(file = %db.path().display(), bucket = %key, "Opened database file");
                self.state = RotationState::FileOpen(db);
                self.stats.rotations += 1;
                Ok(())
            }
            Err(e) => {
                self.active.clear();
                Err(e)
            }
        }
    }

    fn close_active(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, RotationState::NoFileOpen) {
            RotationState::FileOpen(db) => {
                let key = db.key();
                db.close()?;
                debug!(bucket = %key, "Closed database file");
                Ok(())
            }
            RotationState::NoFileOpen => Ok(()),
        }
    }

    fn current_bucket(&self) -> Result<BucketKey> {
        BucketKey::from_timestamp(self.clock.now(), self.config.zone)
    }
}
