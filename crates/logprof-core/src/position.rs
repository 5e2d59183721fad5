//! Position files for incremental re-reads
//!
//! A position file holds the byte offset up to which a log has already been
//! aggregated, so the next run can resume from there.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct PositionFile {
    path: PathBuf,
}

impl PositionFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored offset. A missing or empty file means offset 0.
    pub fn read(&self) -> io::Result<u64> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        let content = content.trim();
        if content.is_empty() {
            return Ok(0);
        }
        content
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Store an offset
    pub fn write(&self, offset: u64) -> io::Result<()> {
        fs::write(&self.path, offset.to_string())?;
        debug!("Stored position {} in {}", offset, self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_reads_zero() {
        let dir = tempfile::tempdir().unwrap();
        let pos = PositionFile::new(dir.path().join("pos"));
        assert_eq!(pos.read().unwrap(), 0);
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let pos = PositionFile::new(dir.path().join("pos"));
        pos.write(4096).unwrap();
        assert_eq!(pos.read().unwrap(), 4096);
    }

    #[test]
    fn test_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pos");
        fs::write(&path, "not a number").unwrap();
        assert!(PositionFile::new(path).read().is_err());
    }
}
