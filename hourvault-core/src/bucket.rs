//! Hour bucket keys naming the database files
//!
//! A bucket key is the `YYYYMMDDHH` wall-clock hour during which every
//! record in a file was received. File names are `<key>.sqlite3`, and
//! `<key>.sqlite3.xz` once the retention sweep has compressed them.

use crate::{Result, Timestamp, VaultError};
use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use parking_lot::{Condvar, Mutex, RwLock};
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Extension of an active or closed database file
pub const DB_EXTENSION: &str = "sqlite3";

/// Extension appended to a compressed database file
pub const COMPRESSED_EXTENSION: &str = "xz";

/// Time zone in which wall-clock hours are computed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketZone {
    /// Host local time
    #[default]
    Local,
    /// Coordinated universal time
    Utc,
}

/// Hour bucket identifier (`YYYYMMDDHH`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BucketKey(NaiveDateTime);

impl BucketKey {
    /// Bucket containing the given instant
    pub fn from_timestamp(secs: Timestamp, zone: BucketZone) -> Result<Self> {
        let naive = match zone {
            BucketZone::Utc => Utc.timestamp_opt(secs, 0).single().map(|t| t.naive_utc()),
            BucketZone::Local => Local.timestamp_opt(secs, 0).single().map(|t| t.naive_local()),
        }
        .ok_or_else(|| VaultError::InvalidBucket(format!("timestamp {} out of range", secs)))?;

        Self::from_parts(naive.year(), naive.month(), naive.day(), naive.hour())
    }

    /// Parse a `YYYYMMDDHH` key
    pub fn parse(key: &str) -> Result<Self> {
        let invalid = || VaultError::InvalidBucket(key.to_string());

        if key.len() != 10 || !key.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        let field = |range: std::ops::Range<usize>| -> Result<u32> {
            key[range].parse::<u32>().map_err(|_| invalid())
        };

        let year = field(0..4)? as i32;
        Self::from_parts(year, field(4..6)?, field(6..8)?, field(8..10)?).map_err(|_| invalid())
    }

    /// Extract the key from a plaintext database file name
    ///
    /// Only exact `<YYYYMMDDHH>.sqlite3` names match; compressed files,
    /// temporaries and anything else yield `None`.
    pub fn from_file_name(name: &str) -> Option<Self> {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        let pattern = PATTERN.get_or_init(|| {
            Regex::new(r"^(\d{10})\.sqlite3$").expect("static bucket file pattern")
        });

        let captures = pattern.captures(name)?;
        Self::parse(captures.get(1)?.as_str()).ok()
    }

    /// Plaintext database file name for this bucket
    pub fn file_name(&self) -> String {
        format!("{}.{}", self, DB_EXTENSION)
    }

    /// Compressed file name for this bucket
    pub fn compressed_file_name(&self) -> String {
        format!("{}.{}.{}", self, DB_EXTENSION, COMPRESSED_EXTENSION)
    }

    /// First second of the bucket in the given zone
    ///
    /// Returns `None` for local hours skipped by a DST transition.
    pub fn start_timestamp(&self, zone: BucketZone) -> Option<Timestamp> {
        match zone {
            BucketZone::Utc => Some(Utc.from_utc_datetime(&self.0).timestamp()),
            BucketZone::Local => Local
                .from_local_datetime(&self.0)
                .earliest()
                .map(|t| t.timestamp()),
        }
    }

    fn from_parts(year: i32, month: u32, day: u32, hour: u32) -> Result<Self> {
        NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|date| date.and_hms_opt(hour, 0, 0))
            .map(BucketKey)
            .ok_or_else(|| {
                VaultError::InvalidBucket(format!("{:04}-{:02}-{:02} {:02}h", year, month, day, hour))
            })
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}{:02}{:02}{:02}",
            self.0.year(),
            self.0.month(),
            self.0.day(),
            self.0.hour()
        )
    }
}

/// Bucket currently open for writes, published by the writer
///
/// The retention sweep consults it so that the active file is never
/// compressed, even under clock skew or a very low retention age.
///
/// Besides the active key, any bucket can be pinned for the length of a
/// file operation. The writer pins a bucket while it publishes a rotation
/// or writes a late record; the sweep pins a bucket while compressing it.
/// A bucket is held by at most one pin at a time.
#[derive(Debug, Clone, Default)]
pub struct ActiveBucket {
    inner: Arc<BucketState>,
}

#[derive(Debug, Default)]
struct BucketState {
    active: RwLock<Option<BucketKey>>,
    pinned: Mutex<HashSet<BucketKey>>,
    released: Condvar,
}

impl ActiveBucket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: BucketKey) {
        *self.inner.active.write() = Some(key);
    }

    pub fn clear(&self) {
        *self.inner.active.write() = None;
    }

    pub fn get(&self) -> Option<BucketKey> {
        *self.inner.active.read()
    }

    pub fn is_active(&self, key: &BucketKey) -> bool {
        self.inner.active.read().as_ref() == Some(key)
    }

    /// Pin `key`, waiting for any current holder to release it
    pub fn pin(&self, key: BucketKey) -> BucketPin {
        let mut pinned = self.inner.pinned.lock();
        while pinned.contains(&key) {
            self.inner.released.wait(&mut pinned);
        }
        pinned.insert(key);
        BucketPin {
            state: self.inner.clone(),
            key,
        }
    }

    /// Pin `key` unless someone else holds it
    pub fn try_pin(&self, key: BucketKey) -> Option<BucketPin> {
        let mut pinned = self.inner.pinned.lock();
        if !pinned.insert(key) {
            return None;
        }
        Some(BucketPin {
            state: self.inner.clone(),
            key,
        })
    }
}

/// Exclusive hold on one bucket's files, released on drop
#[derive(Debug)]
pub struct BucketPin {
    state: Arc<BucketState>,
    key: BucketKey,
}

impl BucketPin {
    pub fn key(&self) -> BucketKey {
        self.key
    }
}

impl Drop for BucketPin {
    fn drop(&mut self) {
        self.state.pinned.lock().remove(&self.key);
        self.state.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-03-05 17:42:10 UTC
    const T: Timestamp = 1_709_660_530;

    #[test]
    fn test_bucket_from_timestamp_utc() {
        let key = BucketKey::from_timestamp(T, BucketZone::Utc).unwrap();
        assert_eq!(key.to_string(), "2024030517");
        assert_eq!(key.file_name(), "2024030517.sqlite3");
        assert_eq!(key.compressed_file_name(), "2024030517.sqlite3.xz");
        assert_eq!(key.start_timestamp(BucketZone::Utc), Some(T - 42 * 60 - 10));
    }

    #[test]
    fn test_bucket_boundaries() {
        let start = BucketKey::from_timestamp(T, BucketZone::Utc)
            .unwrap()
            .start_timestamp(BucketZone::Utc)
            .unwrap();
        let before = BucketKey::from_timestamp(start - 1, BucketZone::Utc).unwrap();
        let first = BucketKey::from_timestamp(start, BucketZone::Utc).unwrap();
        let last = BucketKey::from_timestamp(start + 3_599, BucketZone::Utc).unwrap();
        let next = BucketKey::from_timestamp(start + 3_600, BucketZone::Utc).unwrap();

        assert_eq!(before.to_string(), "2024030516");
        assert_eq!(first, last);
        assert!(before < first && first < next);
        assert_eq!(next.to_string(), "2024030518");
    }

    #[test]
    fn test_bucket_parse() {
        let key = BucketKey::parse("2020010100").unwrap();
        assert_eq!(key.to_string(), "2020010100");
        assert!(BucketKey::parse("2020013100").is_ok());

        assert!(BucketKey::parse("2020023000").is_err());
        assert!(BucketKey::parse("2020010124").is_err());
        assert!(BucketKey::parse("202001010").is_err());
        assert!(BucketKey::parse("20200101+1").is_err());
    }

    #[test]
    fn test_bucket_from_file_name() {
        assert_eq!(
            BucketKey::from_file_name("2020010100.sqlite3"),
            Some(BucketKey::parse("2020010100").unwrap())
        );
        assert_eq!(BucketKey::from_file_name("2020010100.sqlite3.xz"), None);
        assert_eq!(BucketKey::from_file_name("2020010100.sqlite3.xz.partial"), None);
        assert_eq!(BucketKey::from_file_name("2020010100.sqlite3-journal"), None);
        assert_eq!(BucketKey::from_file_name("notes.sqlite3"), None);
        assert_eq!(BucketKey::from_file_name("20200101000000.sqlite3"), None);
        assert_eq!(BucketKey::from_file_name("2020019900.sqlite3"), None);
    }

    #[test]
    fn test_active_bucket() {
        let active = ActiveBucket::new();
        let key = BucketKey::parse("2024030517").unwrap();
        assert!(!active.is_active(&key));

        let shared = active.clone();
        shared.set(key);
        assert!(active.is_active(&key));
        assert_eq!(active.get(), Some(key));

        active.clear();
        assert_eq!(shared.get(), None);
    }

    #[test]
    fn test_bucket_pin_is_exclusive() {
        let active = ActiveBucket::new();
        let key = BucketKey::parse("2024030517").unwrap();
        let other = BucketKey::parse("2024030518").unwrap();

        let held = active.try_pin(key).unwrap();
        assert_eq!(held.key(), key);
        assert!(active.try_pin(key).is_none());
        assert!(active.try_pin(other).is_some());

        let (tx, rx) = std::sync::mpsc::channel();
        let waiter = active.clone();
        let handle = std::thread::spawn(move || {
            let _pin = waiter.pin(key);
            tx.send(()).unwrap();
        });

        // Blocked until the first pin is released
        assert!(rx.recv_timeout(std::time::Duration::from_millis(100)).is_err());
        drop(held);
        rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        handle.join().unwrap();

        assert!(active.try_pin(key).is_some());
    }
}
