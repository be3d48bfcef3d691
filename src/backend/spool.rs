//! On-disk retry spool.
//!
//! One spool per backend: an append-only data file of length-prefixed
//! records plus a sibling meta file holding the durable read offset.
//! Records are written when the upstream is unreachable and destroyed
//! once a drain attempt reaches a terminal outcome. The read cursor is
//! committed only after the upstream acknowledges a record, so a crash
//! re-delivers at most the in-flight record (at-least-once).

use crate::Result;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

const LEN_PREFIX: u64 = 8;

/// Append-only record log with a crash-safe read cursor.
pub struct FileSpool {
    name: String,
    meta_path: PathBuf,
    file: File,
    /// Next record to hand out; may run ahead of `committed_offset` while
    /// a drain attempt is in flight.
    read_offset: u64,
    /// Last durably committed read position.
    committed_offset: u64,
    /// End of the last complete record (the file length).
    write_offset: u64,
}

impl FileSpool {
    /// Open (or create) the spool for `name` under `store_dir`.
    pub fn open(name: &str, store_dir: impl AsRef<Path>) -> Result<Self> {
        let store_dir = store_dir.as_ref();
        fs::create_dir_all(store_dir)?;
        let data_path = store_dir.join(format!("{name}.dat"));
        let meta_path = store_dir.join(format!("{name}.rec"));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&data_path)?;
        let write_offset = file.metadata()?.len();

        let mut committed_offset = match fs::read(&meta_path) {
            Ok(bytes) if bytes.len() == 8 => u64::from_le_bytes(bytes.try_into().unwrap()),
            Ok(_) => {
                warn!(spool = name, "corrupt meta file, restarting from offset 0");
                0
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        if committed_offset > write_offset {
            warn!(
                spool = name,
                committed_offset, write_offset, "meta beyond data end, clamping"
            );
            committed_offset = write_offset;
        }

        Ok(Self {
            name: name.to_string(),
            meta_path,
            file,
            read_offset: committed_offset,
            committed_offset,
            write_offset,
        })
    }

    /// Append one record and make it durable.
    pub fn write(&mut self, record: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(self.write_offset))?;
        self.file.write_all(&(record.len() as u64).to_le_bytes())?;
        self.file.write_all(record)?;
        self.file.sync_data()?;
        self.write_offset += LEN_PREFIX + record.len() as u64;
        Ok(())
    }

    /// Next undelivered record, or `None` once the cursor reaches the end.
    ///
    /// A truncated trailing record (a crash mid-append) is trimmed off and
    /// reported as end-of-stream. I/O errors leave the cursor unchanged.
    pub fn read(&mut self) -> Result<Option<Vec<u8>>> {
        if self.read_offset >= self.write_offset {
            return Ok(None);
        }
        if self.write_offset - self.read_offset < LEN_PREFIX {
            return self.trim_partial_tail();
        }

        self.file.seek(SeekFrom::Start(self.read_offset))?;
        let mut prefix = [0u8; 8];
        self.file.read_exact(&mut prefix)?;
        let len = u64::from_le_bytes(prefix);

        if self.write_offset - self.read_offset - LEN_PREFIX < len {
            return self.trim_partial_tail();
        }

        let mut payload = vec![0u8; len as usize];
        self.file.read_exact(&mut payload)?;
        self.read_offset += LEN_PREFIX + len;
        Ok(Some(payload))
    }

    /// Commit the in-memory read position durably; compacts the file when
    /// the reader has caught the writer.
    pub fn update_meta(&mut self) -> Result<()> {
        if self.read_offset == self.write_offset && self.write_offset > 0 {
            // Reader caught up: drop the consumed bytes entirely.
            self.file.set_len(0)?;
            self.file.sync_data()?;
            self.write_offset = 0;
            self.read_offset = 0;
        }
        self.persist_offset(self.read_offset)?;
        self.committed_offset = self.read_offset;
        Ok(())
    }

    /// Restore the cursor to the last committed position.
    pub fn rollback_meta(&mut self) -> Result<()> {
        self.read_offset = self.committed_offset;
        Ok(())
    }

    /// Whether any undelivered record exists.
    pub fn is_data(&self) -> bool {
        self.read_offset < self.write_offset
    }

    /// Write-then-rename so a crash never leaves a half-written cursor.
    fn persist_offset(&self, offset: u64) -> Result<()> {
        let tmp = self.meta_path.with_extension("rec.tmp");
        let mut f = File::create(&tmp)?;
        f.write_all(&offset.to_le_bytes())?;
        f.sync_all()?;
        fs::rename(&tmp, &self.meta_path)?;
        Ok(())
    }

    fn trim_partial_tail(&mut self) -> Result<Option<Vec<u8>>> {
        warn!(
            spool = %self.name,
            offset = self.read_offset,
            "truncated trailing record, trimming"
        );
        self.file.set_len(self.read_offset)?;
        self.file.sync_data()?;
        self.write_offset = self.read_offset;
        Ok(None)
    }
}

impl std::fmt::Debug for FileSpool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSpool")
            .field("name", &self.name)
            .field("read_offset", &self.read_offset)
            .field("committed_offset", &self.committed_offset)
            .field("write_offset", &self.write_offset)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_read_ack_cycle() {
        let dir = TempDir::new().unwrap();
        let mut spool = FileSpool::open("b1", dir.path()).unwrap();
        assert!(!spool.is_data());

        spool.write(b"first").unwrap();
        spool.write(b"second").unwrap();
        assert!(spool.is_data());

        assert_eq!(spool.read().unwrap().unwrap(), b"first");
        spool.update_meta().unwrap();
        assert_eq!(spool.read().unwrap().unwrap(), b"second");
        spool.update_meta().unwrap();

        assert!(!spool.is_data());
        assert_eq!(spool.read().unwrap(), None);
    }

    #[test]
    fn rollback_redelivers() {
        let dir = TempDir::new().unwrap();
        let mut spool = FileSpool::open("b1", dir.path()).unwrap();
        spool.write(b"payload").unwrap();

        assert_eq!(spool.read().unwrap().unwrap(), b"payload");
        spool.rollback_meta().unwrap();
        assert_eq!(spool.read().unwrap().unwrap(), b"payload");
    }

    #[test]
    fn uncommitted_read_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut spool = FileSpool::open("b1", dir.path()).unwrap();
            spool.write(b"one").unwrap();
            spool.write(b"two").unwrap();
            // Read without committing, then "crash".
            assert_eq!(spool.read().unwrap().unwrap(), b"one");
        }
        let mut spool = FileSpool::open("b1", dir.path()).unwrap();
        assert_eq!(spool.read().unwrap().unwrap(), b"one", "redelivered once");
        assert_eq!(spool.read().unwrap().unwrap(), b"two");
    }

    #[test]
    fn committed_read_not_redelivered_after_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut spool = FileSpool::open("b1", dir.path()).unwrap();
            spool.write(b"one").unwrap();
            spool.write(b"two").unwrap();
            assert_eq!(spool.read().unwrap().unwrap(), b"one");
            spool.update_meta().unwrap();
        }
        let mut spool = FileSpool::open("b1", dir.path()).unwrap();
        assert_eq!(spool.read().unwrap().unwrap(), b"two");
    }

    #[test]
    fn catch_up_compacts_the_file() {
        let dir = TempDir::new().unwrap();
        let mut spool = FileSpool::open("b1", dir.path()).unwrap();
        spool.write(b"payload").unwrap();
        spool.read().unwrap().unwrap();
        spool.update_meta().unwrap();

        let len = fs::metadata(dir.path().join("b1.dat")).unwrap().len();
        assert_eq!(len, 0, "caught-up spool is truncated");

        // And the spool is still usable afterwards.
        spool.write(b"again").unwrap();
        assert_eq!(spool.read().unwrap().unwrap(), b"again");
    }

    #[test]
    fn truncated_tail_is_trimmed() {
        let dir = TempDir::new().unwrap();
        {
            let mut spool = FileSpool::open("b1", dir.path()).unwrap();
            spool.write(b"complete").unwrap();
        }
        // Simulate a crash mid-append: a length prefix promising more
        // bytes than the file holds.
        let data_path = dir.path().join("b1.dat");
        let mut f = OpenOptions::new().append(true).open(&data_path).unwrap();
        f.write_all(&100u64.to_le_bytes()).unwrap();
        f.write_all(b"short").unwrap();
        drop(f);

        let mut spool = FileSpool::open("b1", dir.path()).unwrap();
        assert_eq!(spool.read().unwrap().unwrap(), b"complete");
        assert_eq!(spool.read().unwrap(), None, "partial tail is end-of-stream");
        assert!(!spool.is_data());
    }

    #[test]
    fn meta_beyond_data_is_clamped() {
        let dir = TempDir::new().unwrap();
        {
            let mut spool = FileSpool::open("b1", dir.path()).unwrap();
            spool.write(b"x").unwrap();
        }
        fs::write(dir.path().join("b1.rec"), 9999u64.to_le_bytes()).unwrap();
        let mut spool = FileSpool::open("b1", dir.path()).unwrap();
        assert!(!spool.is_data(), "clamped cursor sits at data end");
        assert_eq!(spool.read().unwrap(), None);
    }

    #[test]
    fn corrupt_meta_restarts_from_zero() {
        let dir = TempDir::new().unwrap();
        {
            let mut spool = FileSpool::open("b1", dir.path()).unwrap();
            spool.write(b"x").unwrap();
        }
        fs::write(dir.path().join("b1.rec"), b"bad").unwrap();
        let mut spool = FileSpool::open("b1", dir.path()).unwrap();
        assert_eq!(spool.read().unwrap().unwrap(), b"x");
    }
}
