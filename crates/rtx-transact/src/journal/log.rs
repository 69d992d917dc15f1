use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, warn};

use super::record::JournalRecord;
use crate::config::SyncMode;
use crate::error::{TransactError, TransactResult};

/// Header size: 4 bytes length + 4 bytes CRC.
const HEADER_SIZE: usize = 8;

/// Internal mutable state for the log writer.
struct LogWriter {
    writer: BufWriter<File>,
    /// Current write offset in the log file.
    offset: u64,
}

/// Append-only, CRC-framed journal log.
///
/// On-disk format, repeated per record:
/// ```text
/// [4 bytes: payload length (little-endian u32)]
/// [4 bytes: CRC32 of payload (little-endian u32)]
/// [N bytes: payload (bincode-serialized JournalRecord)]
/// ```
///
/// Reading stops at the first torn record (a crash mid-append). Records
/// whose CRC does not match are skipped.
pub struct JournalLog {
    path: PathBuf,
    writer: Mutex<LogWriter>,
    sync_mode: SyncMode,
}

impl JournalLog {
    /// Open (or create) the log file at `path`.
    pub fn open(path: &Path, sync_mode: SyncMode) -> TransactResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        let offset = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(LogWriter {
                writer: BufWriter::new(file),
                offset,
            }),
            sync_mode,
        })
    }

    fn writer(&self) -> TransactResult<MutexGuard<'_, LogWriter>> {
        self.writer
            .lock()
            .map_err(|_| TransactError::Fatal("journal writer poisoned".into()))
    }

    fn encode(record: &JournalRecord) -> TransactResult<Vec<u8>> {
        bincode::serialize(record).map_err(|e| TransactError::Serialization(e.to_string()))
    }

    fn write_frame(writer: &mut BufWriter<File>, payload: &[u8]) -> io::Result<()> {
        let length = payload.len() as u32;
        let crc = crc32fast::hash(payload);
        writer.write_all(&length.to_le_bytes())?;
        writer.write_all(&crc.to_le_bytes())?;
        writer.write_all(payload)
    }

    fn sync(&self, writer: &mut BufWriter<File>) -> io::Result<()> {
        writer.flush()?;
        if self.sync_mode == SyncMode::EveryWrite {
            writer.get_ref().sync_all()?;
        }
        Ok(())
    }

    /// Append one record. Returns the byte offset it was written at.
    pub fn append(&self, record: &JournalRecord) -> TransactResult<u64> {
        let payload = Self::encode(record)?;

        let mut w = self.writer()?;
        let record_offset = w.offset;
        Self::write_frame(&mut w.writer, &payload)?;
        self.sync(&mut w.writer)?;
        w.offset += (HEADER_SIZE + payload.len()) as u64;

        debug!(offset = record_offset, kind = record.kind(), "journal append");
        Ok(record_offset)
    }

    /// Read every valid record in this log.
    pub fn recover(&self) -> TransactResult<Vec<JournalRecord>> {
        read_records(&self.path)
    }

    /// Atomically replace the whole log with `records`.
    ///
    /// The new contents are written to a sibling file which is then renamed
    /// over the log, so a crash leaves either the old or the new log intact.
    pub fn replace_with(&self, records: &[JournalRecord]) -> TransactResult<()> {
        let mut w = self.writer()?;
        w.writer.flush()?;

        let staging = self.path.with_extension("compact");
        let mut offset = 0u64;
        {
            let mut out = BufWriter::new(File::create(&staging)?);
            for record in records {
                let payload = Self::encode(record)?;
                Self::write_frame(&mut out, &payload)?;
                offset += (HEADER_SIZE + payload.len()) as u64;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&staging, &self.path)?;

        let file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        w.writer = BufWriter::new(file);
        w.offset = offset;

        debug!(records = records.len(), offset, "journal compacted");
        Ok(())
    }

    /// Current write offset, which is also the log size.
    pub fn offset(&self) -> u64 {
        self.writer().map(|w| w.offset).unwrap_or(0)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read every valid record from a journal log file.
///
/// A missing file reads as empty.
pub fn read_records(path: &Path) -> TransactResult<Vec<JournalRecord>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let file_len = file.metadata()?.len();
    let mut file = BufReader::new(file);
    let mut records = Vec::new();
    let mut offset: u64 = 0;

    while offset + HEADER_SIZE as u64 <= file_len {
        file.seek(SeekFrom::Start(offset))?;

        let mut header = [0u8; HEADER_SIZE];
        match file.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }

        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        if length == 0 || (offset + HEADER_SIZE as u64 + length as u64) > file_len {
            warn!(offset, length, file_len, "torn journal record; stopping");
            break;
        }

        let mut payload = vec![0u8; length as usize];
        match file.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                warn!(offset, "truncated journal record; stopping");
                break;
            }
            Err(e) => return Err(e.into()),
        }

        let actual_crc = crc32fast::hash(&payload);
        if actual_crc != expected_crc {
            warn!(
                offset,
                expected = expected_crc,
                actual = actual_crc,
                "CRC mismatch; skipping journal record"
            );
        } else {
            match bincode::deserialize::<JournalRecord>(&payload) {
                Ok(record) => records.push(record),
                Err(e) => warn!(offset, error = %e, "undecodable journal record; skipping"),
            }
        }

        offset += HEADER_SIZE as u64 + length as u64;
    }

    debug!(recovered = records.len(), "journal read complete");
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtx_types::{NodeId, TransactionId};

    fn begin(n: u64) -> JournalRecord {
        JournalRecord::Begin {
            transaction: TransactionId::new(n),
            node: NodeId::from_uuid(uuid_for(n)),
        }
    }

    fn uuid_for(n: u64) -> uuid::Uuid {
        uuid::Uuid::from_u64_pair(n, n)
    }

    #[test]
    fn append_and_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let log = JournalLog::open(&dir.path().join("j.log"), SyncMode::OsDefault).unwrap();
        log.append(&begin(1)).unwrap();
        log.append(&JournalRecord::Committed {
            transaction: TransactionId::new(1),
        })
        .unwrap();

        let records = log.recover().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], begin(1));
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_records(&dir.path().join("absent.log")).unwrap().is_empty());
    }

    #[test]
    fn crc_mismatch_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.log");
        let log = JournalLog::open(&path, SyncMode::EveryWrite).unwrap();
        log.append(&begin(1)).unwrap();
        log.append(&begin(2)).unwrap();
        drop(log);

        {
            let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(HEADER_SIZE as u64)).unwrap();
            let mut buf = [0u8; 1];
            file.read_exact(&mut buf).unwrap();
            buf[0] ^= 0xFF;
            file.seek(SeekFrom::Start(HEADER_SIZE as u64)).unwrap();
            file.write_all(&buf).unwrap();
        }

        let records = read_records(&path).unwrap();
        assert_eq!(records, vec![begin(2)]);
    }

    #[test]
    fn torn_tail_stops_reading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tail.log");
        let log = JournalLog::open(&path, SyncMode::OsDefault).unwrap();
        log.append(&begin(1)).unwrap();
        log.append(&begin(2)).unwrap();
        let len = log.offset();
        drop(log);

        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(len - 3)
            .unwrap();

        assert_eq!(read_records(&path).unwrap(), vec![begin(1)]);
    }

    #[test]
    fn replace_with_compacts_and_keeps_appending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("compact.log");
        let log = JournalLog::open(&path, SyncMode::OsDefault).unwrap();
        for n in 1..=5 {
            log.append(&begin(n)).unwrap();
        }
        let before = log.offset();

        let checkpoint = JournalRecord::Checkpoint {
            next_transaction: TransactionId::new(6),
        };
        log.replace_with(&[checkpoint.clone()]).unwrap();
        assert!(log.offset() < before);

        log.append(&begin(6)).unwrap();
        assert_eq!(log.recover().unwrap(), vec![checkpoint, begin(6)]);
    }
}
