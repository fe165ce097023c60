use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Encode a single record to [len][bincode][crc32] format.
fn encode_record<R: Serialize>(writer: &mut impl Write, record: &R) -> io::Result<()> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Append-only Write-Ahead Log of `R` records.
///
/// Format per entry: `[u32: len][bincode: R][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - Truncated last entry (crash) is safely discarded via length-prefix + CRC check.
pub struct Wal<R> {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    _record: PhantomData<fn(R)>,
}

impl<R: Serialize + DeserializeOwned> Wal<R> {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            _record: PhantomData,
        })
    }

    /// Append a single record and fsync.
    pub fn append(&mut self, record: &R) -> io::Result<()> {
        self.append_buffered(record)?;
        self.flush_sync()
    }

    /// Append to the BufWriter without flushing or syncing.
    /// Call `flush_sync()` after the batch to durably commit all buffered records.
    pub fn append_buffered(&mut self, record: &R) -> io::Result<()> {
        encode_record(&mut self.writer, record)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write compacted records to a temp file and fsync.
    pub fn write_compact_file(path: &Path, records: &[R]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for record in records {
            encode_record(&mut writer, record)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Atomic swap: rename temp file over the WAL and reopen.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Replace the WAL with a minimal set of records that recreates the current state.
    pub fn compact(&mut self, records: &[R]) -> io::Result<()> {
        Self::write_compact_file(&self.path, records)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL from disk, returning all valid records.
    /// Truncated/corrupt trailing entries are silently discarded.
    pub fn replay(path: &Path) -> io::Result<Vec<R>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }

            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                tracing::warn!(path = %path.display(), "WAL checksum mismatch, stopping replay");
                break;
            }

            match bincode::deserialize::<R>(&payload) {
                Ok(record) => records.push(record),
                Err(_) => break, // corrupt payload
            }
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Event, Span};
    use rust_decimal::Decimal;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("parkline_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn facility(name: &str) -> Event {
        Event::FacilityRegistered {
            id: Ulid::new(),
            name: name.into(),
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![
            facility("North"),
            Event::ReservationCreated {
                id: Ulid::new(),
                user_id: Ulid::new(),
                vehicle_id: Ulid::new(),
                spot_id: Ulid::new(),
                span: Span::new(1000, 2000),
                total_price: Decimal::new(250, 2),
                at: 10,
            },
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        let replayed: Vec<Event> = Wal::replay(&path).unwrap();
        assert_eq!(replayed, events);
    }

    #[test]
    fn replay_handles_truncation() {
        let path = tmp_path("truncation.wal");
        let event = facility("South");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        // Partial second entry
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0u8; 6]).unwrap();
        }

        let replayed: Vec<Event> = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![event]);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        let replayed: Vec<Event> = Wal::replay(&path).unwrap();
        assert!(replayed.is_empty());
    }

    #[test]
    fn replay_corrupt_crc() {
        let path = tmp_path("corrupt_crc.wal");
        let event = Event::ReservationDeleted { id: Ulid::new() };
        {
            let payload = bincode::serialize(&event).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }

        let replayed: Vec<Event> = Wal::replay(&path).unwrap();
        assert!(replayed.is_empty());
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let keep = facility("Kept");
        let extra = facility("After");
        {
            let mut wal = Wal::open(&path).unwrap();
            for i in 0..20 {
                wal.append(&facility(&format!("churn {i}"))).unwrap();
            }
            let before = fs::metadata(&path).unwrap().len();
            wal.compact(std::slice::from_ref(&keep)).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            assert!(fs::metadata(&path).unwrap().len() < before);
            wal.append(&extra).unwrap();
        }

        let replayed: Vec<Event> = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![keep, extra]);
    }

    #[test]
    fn append_buffered_then_flush_sync() {
        let path = tmp_path("buffered_flush.wal");
        let events: Vec<Event> = (0..5).map(|i| facility(&format!("f{i}"))).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }

        let replayed: Vec<Event> = Wal::replay(&path).unwrap();
        assert_eq!(replayed, events);
    }

    #[test]
    fn generic_over_record_type() {
        let path = tmp_path("tuples.wal");
        {
            let mut wal: Wal<(u64, String)> = Wal::open(&path).unwrap();
            wal.append(&(7, "seven".to_string())).unwrap();
        }
        let replayed: Vec<(u64, String)> = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![(7, "seven".to_string())]);
    }
}
