//! Storage - hourly database files and the writer that rotates them

mod database;
mod writer;

pub use database::HourlyDatabase;
pub use writer::{RotationState, Writer, WriterStats};

use crate::BucketZone;
use std::path::PathBuf;
use std::time::Duration;

/// Writer configuration
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Directory holding the hourly database files
    pub db_dir: PathBuf,
    /// Zone in which hour buckets are computed
    pub zone: BucketZone,
    /// Longest wait on an empty queue before re-checking rotation
    pub idle_wait: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            db_dir: PathBuf::from("db"),
            zone: BucketZone::default(),
            idle_wait: crate::config::WRITER_IDLE_WAIT,
        }
    }
}
