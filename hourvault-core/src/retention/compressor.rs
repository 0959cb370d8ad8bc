//! xz compressors used by the retention sweep

use crate::{Result, VaultError};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use xz2::write::XzEncoder;

/// Compresses one file into another
///
/// Implementations must return an error whenever `dst` may be incomplete.
/// The caller owns `dst` and removes it on failure.
pub trait Compressor: Send + Sync + fmt::Debug {
    /// Short name for logs
    fn name(&self) -> &str;

    fn compress(&self, src: &Path, dst: &Path) -> Result<()>;
}

/// In-process xz encoder
#[derive(Debug, Clone, Copy)]
pub struct LinkedXz {
    preset: u32,
}

impl LinkedXz {
    pub fn new(preset: u32) -> Self {
        Self { preset }
    }
}

impl Default for LinkedXz {
    fn default() -> Self {
        Self::new(crate::config::XZ_PRESET)
    }
}

impl Compressor for LinkedXz {
    fn name(&self) -> &str {
        "xz2"
    }

    fn compress(&self, src: &Path, dst: &Path) -> Result<()> {
        let mut input = BufReader::new(File::open(src)?);
        let output = BufWriter::new(File::create(dst)?);

        let mut encoder = XzEncoder::new(output, self.preset);
        io::copy(&mut input, &mut encoder)?;

        let mut output = encoder.finish()?;
        output.flush()?;
        output
            .into_inner()
            .map_err(|e| VaultError::Io(e.into_error()))?
            .sync_all()?;
        Ok(())
    }
}

/// External `xz` binary, run as `xz -<level> --stdout -- <src>`
#[derive(Debug, Clone)]
pub struct ExternalXz {
    program: PathBuf,
    level: u32,
}

impl ExternalXz {
    pub fn new(program: impl Into<PathBuf>, level: u32) -> Self {
        Self {
            program: program.into(),
            level,
        }
    }
}

impl Default for ExternalXz {
    fn default() -> Self {
        Self::new("xz", crate::config::XZ_PRESET)
    }
}

impl Compressor for ExternalXz {
    fn name(&self) -> &str {
        "xz"
    }

    fn compress(&self, src: &Path, dst: &Path) -> Result<()> {
        let output = File::create(dst)?;

        let result = Command::new(&self.program)
            .arg(format!("-{}", self.level))
            .arg("--stdout")
            .arg("--")
            .arg(src)
            .stdin(Stdio::null())
            .stdout(Stdio::from(output.try_clone()?))
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| {
                VaultError::Compression(format!("failed to run {}: {}", self.program.display(), e))
            })?;

        if !result.status.success() {
            return Err(VaultError::Compression(format!(
                "{} exited with {}: {}",
                self.program.display(),
                result.status,
                String::from_utf8_lossy(&result.stderr).trim()
            )));
        }

        output.sync_all()?;
        Ok(())
    }
}
