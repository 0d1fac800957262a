use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Frame one event as `[u32 len][bincode payload][u32 crc32]`, little endian.
/// Returns the frame size in bytes.
fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<u64> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(8 + u64::from(len))
}

/// Read exactly `buf.len()` bytes; `Ok(false)` on a clean or torn end of file.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Next valid event, or `None` at the end of the usable log.
fn read_frame(reader: &mut impl Read) -> io::Result<Option<Event>> {
    let mut word = [0u8; 4];
    if !fill(reader, &mut word)? {
        return Ok(None);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(word) as usize];
    if !fill(reader, &mut payload)? || !fill(reader, &mut word)? {
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize::<Event>(&payload).ok())
}

/// Append-only write-ahead log of booking events.
///
/// A torn or corrupt tail (crash mid-write) ends replay at the last good
/// record. A batch that fails before it is synced is cut off again with
/// [`rollback`](Wal::rollback), so callers told "failed" never see their
/// events replayed.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// File length after the last successful sync.
    committed_len: u64,
    pending_len: u64,
    pending_appends: u64,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let committed_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            committed_len,
            pending_len: 0,
            pending_appends: 0,
            appends_since_compact: 0,
        })
    }

    /// Append and fsync a single event. Production goes through the
    /// group-commit writer instead.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer without syncing; `flush_sync` commits the batch.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        self.pending_len += write_frame(&mut self.writer, event)?;
        self.pending_appends += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.committed_len += self.pending_len;
        self.appends_since_compact += self.pending_appends;
        self.pending_len = 0;
        self.pending_appends = 0;
        Ok(())
    }

    /// Drop everything appended since the last successful `flush_sync`,
    /// both still buffered and already written, and truncate the file back
    /// to its committed length.
    pub fn rollback(&mut self) -> io::Result<()> {
        let fresh = OpenOptions::new().append(true).open(&self.path)?;
        let old = std::mem::replace(&mut self.writer, BufWriter::new(fresh));
        let (file, _discarded) = old.into_parts();
        self.pending_len = 0;
        self.pending_appends = 0;
        file.set_len(self.committed_len)?;
        file.sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write the compacted log next to the live one. Slow; no lock needed.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_tmp_path(path))?);
        for event in events {
            write_frame(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compacted file over the live log and reopen it.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.committed_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.pending_len = 0;
        self.pending_appends = 0;
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// All valid events on disk, oldest first. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        while let Some(event) = read_frame(&mut reader)? {
            events.push(event);
        }
        Ok(events)
    }
}
