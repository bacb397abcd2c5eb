use std::collections::BTreeMap;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use fs4::FileExt;
use serde_derive::{Deserialize, Serialize};
use strum_macros::Display;

use crate::error::{CResult, Error};
use crate::sql::plan::Filter;
use crate::sql::schema::Table;
use crate::sql::value::Value;
use crate::sql::Row;

/// A write-ahead log entry. Appended (and fsync'd) before the in-memory
/// operation it describes; replayed in order on restart.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WalEntry {
    Insert { table: String, rows: Vec<Row> },
    Update { table: String, filters: Vec<Filter>, updates: BTreeMap<String, Value> },
    Delete { table: String, filters: Vec<Filter> },
    CreateTable { schema: Table },
    DropTable { table: String },
    Truncate { table: String },
    /// All entries before this one are reflected in the on-disk table files
    /// and may be discarded.
    Checkpoint,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
#[repr(u8)]
pub enum WalEntryKind {
    Insert = 1,
    Update = 2,
    Delete = 3,
    CreateTable = 4,
    DropTable = 5,
    Truncate = 6,
    Checkpoint = 7,
}

impl WalEntry {
    pub fn kind(&self) -> WalEntryKind {
        match self {
            WalEntry::Insert { .. } => WalEntryKind::Insert,
            WalEntry::Update { .. } => WalEntryKind::Update,
            WalEntry::Delete { .. } => WalEntryKind::Delete,
            WalEntry::CreateTable { .. } => WalEntryKind::CreateTable,
            WalEntry::DropTable { .. } => WalEntryKind::DropTable,
            WalEntry::Truncate { .. } => WalEntryKind::Truncate,
            WalEntry::Checkpoint => WalEntryKind::Checkpoint,
        }
    }
}

impl TryFrom<u8> for WalEntryKind {
    type Error = Error;

    fn try_from(tag: u8) -> CResult<Self> {
        match tag {
            1 => Ok(WalEntryKind::Insert),
            2 => Ok(WalEntryKind::Update),
            3 => Ok(WalEntryKind::Delete),
            4 => Ok(WalEntryKind::CreateTable),
            5 => Ok(WalEntryKind::DropTable),
            6 => Ok(WalEntryKind::Truncate),
            7 => Ok(WalEntryKind::Checkpoint),
            tag => Err(Error::Storage(format!("unknown WAL entry tag {}", tag))),
        }
    }
}

/// The append-only write-ahead log of one database directory.
///
/// The record framing is:
///
/// - Entry kind as u8.
/// - Payload length as big-endian u32.
/// - Payload as bincode.
///
/// A crash can leave at most one partial trailing record, which replay
/// detects and truncates. The file carries an exclusive lock so only one
/// adapter writes a given database directory.
pub struct Wal {
    pub(crate) path: PathBuf,
    pub(crate) file: std::fs::File,
}

impl Wal {
    /// Opens the log, creating it (and its directory) if missing, and takes
    /// out an exclusive lock until dropped.
    pub fn open(path: PathBuf) -> CResult<Self> {
        Self::open_with_lock(path, true)
    }

    pub fn open_with_lock(path: PathBuf, try_lock: bool) -> CResult<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|err| Error::Storage(format!("{}: {:?}", err, dir.to_str())))?;
        }
        let file = std::fs::OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        if try_lock {
            file.try_lock_exclusive()
                .map_err(|err| Error::Storage(format!("WAL {} is locked: {}", path.display(), err)))?;
        }
        Ok(Self { path, file })
    }

    /// Appends an entry and fsyncs before returning, so the in-memory apply
    /// that follows is always covered by a durable record. Returns the
    /// entry's offset and encoded length.
    pub fn append(&mut self, entry: &WalEntry) -> CResult<(u64, u32)> {
        let payload = bincode::serialize(entry)?;
        let len = 1 + 4 + payload.len() as u32;

        let pos = self.file.seek(SeekFrom::End(0))?;
        let mut w = BufWriter::with_capacity(len as usize, &mut self.file);
        w.write_all(&[entry.kind() as u8])?;
        w.write_all(&(payload.len() as u32).to_be_bytes())?;
        w.write_all(&payload)?;
        w.flush()?;
        drop(w);
        self.file.sync_all()?;

        Ok((pos, len))
    }

    /// Scans the log and returns the entries that still need to be applied:
    /// everything after the last checkpoint. A partial trailing record is
    /// treated as EOF and truncated away.
    pub fn replay(&mut self) -> CResult<Vec<WalEntry>> {
        let file_len = self.file.metadata()?.len();
        let mut r = BufReader::new(&mut self.file);
        let mut pos = r.seek(SeekFrom::Start(0))?;

        let mut pending: Vec<WalEntry> = Vec::new();
        while pos < file_len {
            let mut read_entry = || -> Result<(WalEntry, u64), std::io::Error> {
                let mut tag = [0u8; 1];
                r.read_exact(&mut tag)?;
                let kind = WalEntryKind::try_from(tag[0]).map_err(|err| {
                    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, err.to_string())
                })?;
                let mut len_buf = [0u8; 4];
                r.read_exact(&mut len_buf)?;
                let len = u32::from_be_bytes(len_buf);
                if pos + 1 + 4 + len as u64 > file_len {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "payload extends beyond end of file",
                    ));
                }
                let mut payload = vec![0; len as usize];
                r.read_exact(&mut payload)?;
                let entry: WalEntry = bincode::deserialize(&payload).map_err(|err| {
                    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, err.to_string())
                })?;
                if entry.kind() != kind {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "entry tag does not match payload",
                    ));
                }
                Ok((entry, pos + 1 + 4 + len as u64))
            };

            match read_entry() {
                Ok((WalEntry::Checkpoint, end)) => {
                    // Everything buffered so far is reflected on disk.
                    pending.clear();
                    pos = end;
                }
                Ok((entry, end)) => {
                    pending.push(entry);
                    pos = end;
                }
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    log::error!(
                        "found incomplete WAL entry at offset {} in {}, truncating",
                        pos,
                        self.path.display()
                    );
                    self.file.set_len(pos)?;
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }

        Ok(pending)
    }

    /// Truncates the log after a successful checkpoint.
    pub fn reset(&mut self) -> CResult<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.sync_all()?;
        Ok(())
    }

    pub fn len(&self) -> CResult<u64> {
        Ok(self.file.metadata()?.len())
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        if let Err(error) = self.file.sync_all() {
            log::error!("failed to sync WAL {}: {}", self.path.display(), error);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sql::plan::FilterOp;
    use crate::sql::row_from;

    fn insert_entry(table: &str, id: i64) -> WalEntry {
        WalEntry::Insert { table: table.to_string(), rows: vec![row_from(vec![("id", Value::Integer(id))])] }
    }

    #[test]
    fn round_trips_entries_in_order() -> CResult<()> {
        let path = tempdir::TempDir::new("wal")?.path().join("wal.log");
        let mut wal = Wal::open(path.clone())?;
        let entries = vec![
            insert_entry("t", 1),
            WalEntry::Update {
                table: "t".to_string(),
                filters: vec![Filter::new("id", FilterOp::Eq, Value::Integer(1))],
                updates: [("v".to_string(), Value::Integer(2))].into_iter().collect(),
            },
            WalEntry::Delete {
                table: "t".to_string(),
                filters: vec![Filter::new("id", FilterOp::Eq, Value::Integer(1))],
            },
        ];
        for entry in &entries {
            wal.append(entry)?;
        }
        drop(wal);

        let mut wal = Wal::open(path)?;
        assert_eq!(wal.replay()?, entries);
        Ok(())
    }

    #[test]
    fn checkpoint_discards_prior_entries() -> CResult<()> {
        let path = tempdir::TempDir::new("wal")?.path().join("wal.log");
        let mut wal = Wal::open(path)?;
        wal.append(&insert_entry("t", 1))?;
        wal.append(&insert_entry("t", 2))?;
        wal.append(&WalEntry::Checkpoint)?;
        wal.append(&insert_entry("t", 3))?;

        assert_eq!(wal.replay()?, vec![insert_entry("t", 3)]);
        Ok(())
    }

    #[test]
    fn reset_empties_the_log() -> CResult<()> {
        let path = tempdir::TempDir::new("wal")?.path().join("wal.log");
        let mut wal = Wal::open(path)?;
        wal.append(&insert_entry("t", 1))?;
        wal.reset()?;
        assert_eq!(wal.len()?, 0);
        assert_eq!(wal.replay()?, Vec::new());
        Ok(())
    }

    #[test]
    fn exclusive_lock_is_held_until_close() -> CResult<()> {
        let path = tempdir::TempDir::new("wal")?.path().join("wal.log");
        let wal = Wal::open(path.clone())?;
        assert!(Wal::open(path.clone()).is_err());
        drop(wal);
        assert!(Wal::open(path).is_ok());
        Ok(())
    }

    #[test]
    /// Truncate the log at every possible byte offset and verify that replay
    /// always yields a prefix of complete entries.
    fn partial_trailing_entry_is_discarded() -> CResult<()> {
        let dir = tempdir::TempDir::new("wal")?;
        let path = dir.path().join("complete.log");
        let truncpath = dir.path().join("truncated.log");

        let mut wal = Wal::open(path.clone())?;
        let mut ends = Vec::new();
        for i in 0..3 {
            let (pos, len) = wal.append(&insert_entry("t", i))?;
            ends.push(pos + len as u64);
        }
        drop(wal);

        let size = std::fs::metadata(&path)?.len();
        for cut in 0..=size {
            std::fs::copy(&path, &truncpath)?;
            let f = std::fs::OpenOptions::new().write(true).open(&truncpath)?;
            f.set_len(cut)?;
            drop(f);

            let complete = ends.iter().filter(|end| cut >= **end).count();
            let expect: Vec<WalEntry> = (0..complete as i64).map(|i| insert_entry("t", i)).collect();

            let mut wal = Wal::open(truncpath.clone())?;
            assert_eq!(wal.replay()?, expect, "cut at byte {}", cut);
        }
        Ok(())
    }

    #[test]
    fn unknown_tag_reads_as_eof() -> CResult<()> {
        let path = tempdir::TempDir::new("wal")?.path().join("wal.log");
        let mut wal = Wal::open(path.clone())?;
        wal.append(&insert_entry("t", 1))?;
        drop(wal);

        // Scribble an invalid tag after the valid entry.
        let mut f = std::fs::OpenOptions::new().append(true).open(&path)?;
        f.write_all(&[0xEE, 0, 0, 0, 4, 1, 2, 3, 4])?;
        drop(f);

        let mut wal = Wal::open(path)?;
        assert_eq!(wal.replay()?, vec![insert_entry("t", 1)]);
        Ok(())
    }
}
