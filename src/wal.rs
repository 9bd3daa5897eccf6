use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Frame one event as length, bincode payload, checksum.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

enum Record {
    Event(Event, u64),
    /// Clean end of file.
    End,
    /// Truncated or corrupt bytes from here on.
    Torn,
}

/// Read one record; returns the event and its encoded size.
fn decode_next(reader: &mut impl Read) -> io::Result<Record> {
    let mut len_buf = [0u8; 4];
    match read_full(reader, &mut len_buf)? {
        0 => return Ok(Record::End),
        4 => {}
        _ => return Ok(Record::Torn),
    }
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut payload = vec![0u8; len];
    if read_full(reader, &mut payload)? != len {
        return Ok(Record::Torn);
    }
    let mut crc_buf = [0u8; 4];
    if read_full(reader, &mut crc_buf)? != 4 {
        return Ok(Record::Torn);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Record::Torn);
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Record::Event(event, (len + 8) as u64)),
        Err(_) => Ok(Record::Torn),
    }
}

/// Like `read_exact`, but reports how many bytes were available instead of
/// failing on EOF.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Append-only Write-Ahead Log of committed booking events.
///
/// Records are `[u32 len][bincode Event][u32 crc32]`, little endian; `len`
/// counts the payload only.
/// - A torn tail (crash mid-write) is discarded on open and truncated away,
///   so later appends stay readable.
/// - A batch that fails to flush or sync is cut back off the file, so a
///   commit reported as failed never replays. If the cut itself fails the
///   log refuses appends until the next compaction rewrites it.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// File length covered by the last successful sync.
    synced_len: u64,
    /// Records buffered or written since that sync.
    unsynced: u64,
    appends_since_compact: u64,
    poisoned: bool,
    #[cfg(test)]
    fail_next_sync: bool,
}

impl Wal {
    /// Open (or create) the WAL at `path` and return it with every valid event on disk.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let (events, valid_len) = Self::scan(path)?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        if file.metadata()?.len() > valid_len {
            tracing::warn!(
                "WAL {}: discarding torn tail after {valid_len} bytes",
                path.display()
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        let file = OpenOptions::new().append(true).open(path)?;
        let wal = Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            synced_len: valid_len,
            unsynced: 0,
            appends_since_compact: 0,
            poisoned: false,
            #[cfg(test)]
            fail_next_sync: false,
        };
        Ok((wal, events))
    }

    /// Append a single event and fsync. Used by tests only; the engine goes
    /// through `append_buffered` + `flush_sync` for group commit.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Append to the BufWriter without flushing or syncing.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        self.check_writable()?;
        encode_event(&mut self.writer, event)?;
        self.unsynced += 1;
        Ok(())
    }

    /// Push buffered records to disk. One fsync covers the whole batch.
    /// On failure the batch is discarded before the error is returned.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.check_writable()?;
        match self.write_through() {
            Ok(()) => {
                self.synced_len = self.writer.get_ref().metadata()?.len();
                self.appends_since_compact += self.unsynced;
                self.unsynced = 0;
                Ok(())
            }
            Err(e) => {
                self.discard_unsynced();
                Err(e)
            }
        }
    }

    fn write_through(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        #[cfg(test)]
        if std::mem::take(&mut self.fail_next_sync) {
            return Err(io::Error::other("injected sync failure"));
        }
        self.writer.get_ref().sync_all()
    }

    /// Drop every record since the last sync, from the buffer and the file.
    pub fn discard_unsynced(&mut self) {
        let dropped = self.unsynced;
        self.unsynced = 0;
        if let Err(e) = self.truncate_to_synced() {
            tracing::error!(
                "WAL {}: could not discard {dropped} unsynced records, refusing appends until compaction: {e}",
                self.path.display()
            );
            self.poisoned = true;
        }
    }

    fn truncate_to_synced(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        // The old writer flushes leftovers when dropped; cut the file after that.
        drop(std::mem::replace(&mut self.writer, BufWriter::new(file)));
        let file = self.writer.get_ref();
        file.set_len(self.synced_len)?;
        file.sync_all()
    }

    fn check_writable(&self) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other(format!(
                "WAL {} holds records of a failed batch",
                self.path.display()
            )));
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn fail_next_sync(&mut self) {
        self.fail_next_sync = true;
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replace the log with `events`: write a temp file, fsync, rename over the WAL, reopen.
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            for event in events {
                encode_event(&mut writer, event)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.synced_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.unsynced = 0;
        self.appends_since_compact = 0;
        self.poisoned = false;
        Ok(())
    }

    /// Read every valid event. Stops at the first torn record.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Self::scan(path).map(|(events, _)| events)
    }

    fn scan(path: &Path) -> io::Result<(Vec<Event>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut valid_len = 0u64;
        while let Record::Event(event, size) = decode_next(&mut reader)? {
            events.push(event);
            valid_len += size;
        }
        Ok((events, valid_len))
    }
}
