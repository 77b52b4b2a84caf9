//! On-disk packet log
//!
//! Layout of a log directory:
//!
//! ```text
//! packets.log   append-only sequence of CRC-framed packet records
//! head          first live key (u64 LE) + crc32 (u32 LE)
//! ```
//!
//! Records are the `Packet` frames of the wire protocol, so every record
//! carries its own length and checksum. Trimming the head only moves the
//! `head` marker; the dead prefix is physically dropped by rewriting the live
//! suffix into a fresh file once it dominates the data file.
//!
//! On reopen the data file is scanned once: records below the head marker are
//! skipped, a torn final record is truncated away, and any other damage
//! (checksum mismatch, gap, non-increasing keys) refuses to open the log.

use super::{LogSize, PacketIter, PacketLogStorage, check_append, check_sequence};
use crate::config::{CompactionRange, CompactionResult};
use crate::error::{Error, Result};
use gridsync_protocol::frame::{HEADER_LEN, TRAILER_LEN, body_len_from_header};
use gridsync_protocol::{Frame, FrameType, OrderedPacket, PROTOCOL_VERSION};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const DATA_FILE: &str = "packets.log";
const HEAD_FILE: &str = "head";

/// Tuning of the on-disk log
#[derive(Debug, Clone)]
pub struct FileLogOptions {
    /// fsync after every append and head move
    pub sync_on_append: bool,
    /// Live bytes the log may hold (`None` = unbounded)
    pub max_bytes: Option<u64>,
    /// Dead prefix size below which the data file is never rewritten
    pub rewrite_min_dead_bytes: u64,
}

impl Default for FileLogOptions {
    fn default() -> Self {
        Self {
            sync_on_append: false,
            max_bytes: None,
            rewrite_min_dead_bytes: 1024 * 1024,
        }
    }
}

impl FileLogOptions {
    /// Enable fsync
    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync_on_append = sync;
        self
    }

    /// Bound live bytes
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    key: u64,
    offset: u64,
    len: u64,
    weight: u32,
}

/// Packet log persisted in a directory
#[derive(Debug)]
pub struct FilePacketLog {
    name: String,
    dir: PathBuf,
    file: Option<File>,
    index: VecDeque<IndexEntry>,
    head_offset: u64,
    end_offset: u64,
    weight: u64,
    last_appended: Option<u64>,
    options: FileLogOptions,
    size: LogSize,
    compromised: Option<String>,
}

impl FilePacketLog {
    /// Open (or create) the log stored in `dir`
    pub fn open(dir: impl AsRef<Path>, options: FileLogOptions) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| dir.display().to_string());

        let head_key = read_head_marker(&dir.join(HEAD_FILE))?;
        let data_path = dir.join(DATA_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&data_path)?;
        let file_len = file.metadata()?.len();

        let mut log = Self {
            name,
            dir,
            file: Some(file),
            index: VecDeque::new(),
            head_offset: 0,
            end_offset: 0,
            weight: 0,
            last_appended: head_key.and_then(|k| k.checked_sub(1)),
            options,
            size: LogSize::default(),
            compromised: None,
        };
        log.recover(head_key.unwrap_or(0), file_len)?;

        tracing::info!(
            "Opened packet log {} ({} packets, weight {}, keys {:?}..={:?})",
            log.name,
            log.index.len(),
            log.weight,
            log.first_key(),
            log.last_key()
        );
        Ok(log)
    }

    /// Directory holding the log
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Bytes between the head and the tail of the data file
    pub fn live_bytes(&self) -> u64 {
        self.end_offset - self.head_offset
    }

    fn data_path(&self) -> PathBuf {
        self.dir.join(DATA_FILE)
    }

    fn recover(&mut self, head_key: u64, file_len: u64) -> Result<()> {
        let mut reader = BufReader::new(File::open(self.data_path())?);
        let mut offset = 0u64;
        let mut head_offset: Option<u64> = None;

        loop {
            match read_record(&mut reader, file_len - offset)? {
                RecordRead::Eof => break,
                RecordRead::Torn => {
                    tracing::warn!(
                        "Packet log {}: truncating torn record at offset {} ({} bytes)",
                        self.name,
                        offset,
                        file_len - offset
                    );
                    if let Some(file) = &self.file {
                        file.set_len(offset)?;
                        file.sync_all()?;
                    }
                    break;
                }
                RecordRead::Corrupt(reason) => {
                    return Err(Error::log_compromised(format!(
                        "{}: record at offset {}: {}",
                        self.name, offset, reason
                    )));
                }
                RecordRead::Record(bytes) => {
                    let len = bytes.len() as u64;
                    let packet = decode_record(&bytes).map_err(|e| {
                        Error::log_compromised(format!(
                            "{}: record at offset {}: {}",
                            self.name, offset, e
                        ))
                    })?;
                    self.last_appended = Some(match self.last_appended {
                        Some(last) => last.max(packet.key),
                        None => packet.key,
                    });
                    if packet.key >= head_key {
                        head_offset.get_or_insert(offset);
                        self.weight += packet.weight as u64;
                        self.index.push_back(IndexEntry {
                            key: packet.key,
                            offset,
                            len,
                            weight: packet.weight,
                        });
                    }
                    offset += len;
                }
            }
        }

        self.end_offset = offset;
        self.head_offset = head_offset.unwrap_or(offset);
        self.publish_size();

        let entries = self.index.iter().map(|e| (e.key, e.weight));
        check_sequence(entries, self.index.len() as u64, self.weight)
            .map_err(|reason| Error::log_compromised(format!("{}: {}", self.name, reason)))
    }

    fn guard(&self) -> Result<()> {
        if self.file.is_none() {
            return Err(Error::storage(format!("packet log {} is closed", self.name)));
        }
        if let Some(reason) = &self.compromised {
            return Err(Error::log_compromised(format!("{}: {}", self.name, reason)));
        }
        Ok(())
    }

    fn publish_size(&self) {
        self.size.set(self.index.len() as u64, self.weight);
    }

    fn mark_compromised(&mut self, reason: String) -> Error {
        tracing::error!("Packet log {} compromised: {}", self.name, reason);
        self.compromised = Some(reason.clone());
        Error::log_compromised(format!("{}: {}", self.name, reason))
    }

    /// Read the packets of `entries`, which must be consecutive
    fn read_entries(&self, entries: &[IndexEntry]) -> Result<Vec<OrderedPacket>> {
        let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
            return Ok(Vec::new());
        };
        let end = last.offset + last.len;
        let iter = FileIter::open(&self.data_path(), first.offset, end, entries.len())?;
        iter.collect()
    }

    /// Drop head entries up to `limit` while `keep_going` holds
    fn trim_head(
        &mut self,
        limit: usize,
        keep_going: impl Fn(&IndexEntry) -> bool,
    ) -> Result<Vec<IndexEntry>> {
        let count = self
            .index
            .iter()
            .take(limit)
            .take_while(|e| keep_going(*e))
            .count();
        if count == 0 {
            return Ok(Vec::new());
        }

        let removed: Vec<IndexEntry> = self.index.drain(..count).collect();
        for entry in &removed {
            self.weight = self.weight.saturating_sub(entry.weight as u64);
        }
        self.head_offset = self.index.front().map_or(self.end_offset, |e| e.offset);
        self.publish_size();

        let marker = match self.index.front() {
            Some(entry) => entry.key,
            None => self.last_appended.map_or(0, |k| k + 1),
        };
        if let Err(e) = self.write_head_marker(marker) {
            return Err(self.mark_compromised(format!("head marker write failed: {}", e)));
        }
        if let Err(e) = self.maybe_rewrite() {
            return Err(self.mark_compromised(format!("data file rewrite failed: {}", e)));
        }
        Ok(removed)
    }

    fn write_head_marker(&self, key: u64) -> Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        let bytes = key.to_le_bytes();
        tmp.write_all(&bytes)?;
        tmp.write_all(&crc32fast::hash(&bytes).to_le_bytes())?;
        if self.options.sync_on_append {
            tmp.as_file().sync_all()?;
        }
        tmp.persist(self.dir.join(HEAD_FILE))
            .map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    /// Copy the live suffix into a fresh data file once the dead prefix dominates
    fn maybe_rewrite(&mut self) -> Result<()> {
        let dead = self.head_offset;
        if dead < self.options.rewrite_min_dead_bytes || dead < self.live_bytes() {
            return Ok(());
        }

        let live = self.live_bytes();
        let mut source = File::open(self.data_path())?;
        source.seek(SeekFrom::Start(self.head_offset))?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        let copied = std::io::copy(&mut source.take(live), tmp.as_file_mut())?;
        if copied != live {
            return Err(Error::storage(format!(
                "rewrite copied {} of {} live bytes",
                copied, live
            )));
        }
        tmp.as_file().sync_all()?;
        tmp.persist(self.data_path()).map_err(|e| Error::Io(e.error))?;

        self.file = Some(
            OpenOptions::new()
                .read(true)
                .append(true)
                .open(self.data_path())?,
        );
        for entry in self.index.iter_mut() {
            entry.offset -= dead;
        }
        self.head_offset = 0;
        self.end_offset = live;

        tracing::debug!(
            "Packet log {}: rewrote data file, dropped {} dead bytes",
            self.name,
            dead
        );
        Ok(())
    }
}

impl PacketLogStorage for FilePacketLog {
    fn append_batch(&mut self, packets: Vec<OrderedPacket>) -> Result<()> {
        self.guard()?;
        check_append(self.last_appended, &packets)?;

        let mut buf = Vec::new();
        let mut entries = Vec::with_capacity(packets.len());
        let mut offset = self.end_offset;
        for packet in packets {
            let key = packet.key;
            let weight = packet.weight;
            let record = Frame::Packet(packet).encode()?;
            let len = record.len() as u64;
            entries.push(IndexEntry {
                key,
                offset,
                len,
                weight,
            });
            buf.extend_from_slice(&record);
            offset += len;
        }

        if let Some(max) = self.options.max_bytes {
            let wanted = self.live_bytes() + buf.len() as u64;
            if wanted > max {
                return Err(Error::StorageFull {
                    group: self.name.clone(),
                    weight: wanted,
                    threshold: max,
                });
            }
        }

        let sync = self.options.sync_on_append;
        let write_result = match self.file.as_mut() {
            Some(file) => file.write_all(&buf).and_then(|_| {
                if sync {
                    file.sync_data()
                } else {
                    Ok(())
                }
            }),
            None => return Err(Error::storage(format!("packet log {} is closed", self.name))),
        };
        if let Err(e) = write_result {
            return Err(self.mark_compromised(format!("append failed: {}", e)));
        }

        self.end_offset = offset;
        if self.index.is_empty() {
            self.head_offset = entries.first().map_or(offset, |e| e.offset);
        }
        for entry in entries {
            self.weight += entry.weight as u64;
            self.last_appended = Some(entry.key);
            self.index.push_back(entry);
        }
        self.publish_size();
        Ok(())
    }

    fn size_probe(&self) -> LogSize {
        self.size.clone()
    }

    fn weight(&self) -> u64 {
        self.weight
    }

    fn first_key(&self) -> Option<u64> {
        self.index.front().map(|e| e.key)
    }

    fn last_key(&self) -> Option<u64> {
        self.index.back().map(|e| e.key)
    }

    fn last_appended_key(&self) -> Option<u64> {
        self.last_appended
    }

    fn remove_first_batch(&mut self, capacity: usize, frontier: u64) -> Result<Vec<OrderedPacket>> {
        self.guard()?;
        let count = self
            .index
            .iter()
            .take(capacity)
            .take_while(|e| e.key <= frontier)
            .count();
        let entries: Vec<IndexEntry> = self.index.iter().take(count).copied().collect();
        let packets = self.read_entries(&entries)?;
        self.trim_head(count, |_| true)?;
        Ok(packets)
    }

    fn delete_oldest_packets(&mut self, up_to_inclusive: u64) -> Result<u64> {
        self.guard()?;
        let removed = self.trim_head(usize::MAX, |e| e.key <= up_to_inclusive)?;
        Ok(removed.len() as u64)
    }

    fn read_only_iterator(&self, from_key: Option<u64>) -> Result<PacketIter<'_>> {
        self.guard()?;
        let start = match from_key {
            Some(key) => self.index.partition_point(|e| e.key < key),
            None => 0,
        };
        let Some(entry) = self.index.get(start) else {
            return Ok(Box::new(std::iter::empty()));
        };
        let iter = FileIter::open(
            &self.data_path(),
            entry.offset,
            self.end_offset,
            self.index.len() - start,
        )?;
        Ok(Box::new(iter))
    }

    fn perform_compaction(&mut self, from: u64, to: u64) -> Result<CompactionResult> {
        self.guard()?;
        if from > to {
            return Err(Error::storage(format!("invalid compaction range [{}, {}]", from, to)));
        }
        if let Some(first) = self.first_key() {
            if from > first {
                return Err(Error::storage(format!(
                    "compaction range [{}, {}] does not start at head {}",
                    from, to, first
                )));
            }
        }

        let removed = self.trim_head(usize::MAX, |e| e.key <= to)?;
        let range = match (removed.first(), removed.last()) {
            (Some(first), Some(last)) => Some(CompactionRange::new(first.key, last.key)),
            _ => None,
        };
        Ok(CompactionResult {
            range,
            removed: removed.len() as u64,
            removed_weight: removed.iter().map(|e| e.weight as u64).sum(),
            remaining_weight: self.weight,
        })
    }

    fn validate_integrity(&mut self) -> Result<()> {
        self.guard()?;
        let entries = self.index.iter().map(|e| (e.key, e.weight));
        if let Err(reason) = check_sequence(entries, self.size.len(), self.weight) {
            return Err(self.mark_compromised(reason));
        }

        // Every indexed record must still decode to the indexed key
        let indexed: Vec<IndexEntry> = self.index.iter().copied().collect();
        let packets = match self.read_entries(&indexed) {
            Ok(packets) => packets,
            Err(e) => return Err(self.mark_compromised(format!("unreadable record: {}", e))),
        };
        for (entry, packet) in indexed.iter().zip(&packets) {
            if entry.key != packet.key || entry.weight != packet.weight {
                return Err(self.mark_compromised(format!(
                    "record at offset {} holds key {} but index says {}",
                    entry.offset, packet.key, entry.key
                )));
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
            tracing::info!("Closed packet log {}", self.name);
        }
        self.index.clear();
        self.weight = 0;
        self.publish_size();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.file.is_none()
    }
}

enum RecordRead {
    Record(Vec<u8>),
    Eof,
    Torn,
    Corrupt(String),
}

/// Read one framed record; `available` bounds how far the record may extend
///
/// A record running past the end of the file is torn only when no complete
/// record follows its header; otherwise its length field is damaged.
fn read_record<R: Read>(reader: &mut R, available: u64) -> std::io::Result<RecordRead> {
    let mut header = [0u8; HEADER_LEN];
    match read_full(reader, &mut header)? {
        0 => return Ok(RecordRead::Eof),
        n if n < HEADER_LEN => return Ok(RecordRead::Torn),
        _ => {}
    }
    if header[0] != PROTOCOL_VERSION || header[1] != FrameType::Packet as u8 {
        return Ok(RecordRead::Corrupt(format!(
            "invalid record header (version {}, type {:#04x})",
            header[0], header[1]
        )));
    }

    let body_len = body_len_from_header(&header);
    let total = HEADER_LEN as u64 + body_len as u64 + TRAILER_LEN as u64;
    if total > available {
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest)?;
        if contains_record(&rest) {
            return Ok(RecordRead::Corrupt(format!(
                "length {} overruns the {} bytes left but valid records follow",
                total, available
            )));
        }
        return Ok(RecordRead::Torn);
    }
    let total = total as usize;

    let mut record = vec![0u8; total];
    record[..HEADER_LEN].copy_from_slice(&header);
    let n = read_full(reader, &mut record[HEADER_LEN..])?;
    if n < body_len + TRAILER_LEN {
        return Ok(RecordRead::Torn);
    }
    Ok(RecordRead::Record(record))
}

/// Whether a complete, checksum-valid packet record starts anywhere in `bytes`
fn contains_record(bytes: &[u8]) -> bool {
    let min = HEADER_LEN + TRAILER_LEN;
    (0..bytes.len().saturating_sub(min - 1)).any(|start| {
        let candidate = &bytes[start..];
        if candidate[0] != PROTOCOL_VERSION || candidate[1] != FrameType::Packet as u8 {
            return false;
        }
        let end = HEADER_LEN + body_len_from_header(candidate) + TRAILER_LEN;
        end <= candidate.len() && decode_record(&candidate[..end]).is_ok()
    })
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn decode_record(bytes: &[u8]) -> Result<OrderedPacket> {
    match Frame::decode(bytes)? {
        Frame::Packet(packet) => Ok(packet),
        other => Err(Error::storage(format!(
            "unexpected {:?} frame in packet log",
            other.frame_type()
        ))),
    }
}

fn read_head_marker(path: &Path) -> Result<Option<u64>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if bytes.len() != 12 {
        return Err(Error::log_compromised(format!(
            "head marker {} has {} bytes",
            path.display(),
            bytes.len()
        )));
    }
    let (key_bytes, crc_bytes) = bytes.split_at(8);
    let mut key = [0u8; 8];
    key.copy_from_slice(key_bytes);
    let mut crc = [0u8; 4];
    crc.copy_from_slice(crc_bytes);
    if crc32fast::hash(&key) != u32::from_le_bytes(crc) {
        return Err(Error::log_compromised(format!(
            "head marker {} checksum mismatch",
            path.display()
        )));
    }
    Ok(Some(u64::from_le_bytes(key)))
}

/// Lazy reader over consecutive records
struct FileIter {
    reader: BufReader<File>,
    offset: u64,
    end: u64,
    remaining: usize,
}

impl FileIter {
    fn open(path: &Path, offset: u64, end: u64, count: usize) -> Result<Self> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(Self {
            reader: BufReader::new(file),
            offset,
            end,
            remaining: count,
        })
    }
}

impl Iterator for FileIter {
    type Item = Result<OrderedPacket>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let result = match read_record(&mut self.reader, self.end.saturating_sub(self.offset)) {
            Ok(RecordRead::Record(bytes)) => {
                self.offset += bytes.len() as u64;
                decode_record(&bytes)
            }
            Ok(RecordRead::Eof) | Ok(RecordRead::Torn) => Err(Error::log_compromised(format!(
                "record at offset {} missing",
                self.offset
            ))),
            Ok(RecordRead::Corrupt(reason)) => Err(Error::log_compromised(format!(
                "record at offset {}: {}",
                self.offset, reason
            ))),
            Err(e) => Err(e.into()),
        };
        if result.is_err() {
            self.remaining = 0;
        }
        Some(result)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridsync_protocol::{EntryData, EntryOperation, Payload};
    use tempfile::TempDir;

    fn packet(key: u64, weight: u32) -> OrderedPacket {
        OrderedPacket::new(
            key,
            Payload::Entry(EntryOperation::Write(EntryData::new(
                "Order",
                format!("o-{}", key),
                key,
                vec![key as u8; 16],
            ))),
        )
        .with_weight(weight)
    }

    fn keys(log: &FilePacketLog, from: Option<u64>) -> Vec<u64> {
        log.read_only_iterator(from)
            .unwrap()
            .map(|p| p.unwrap().key)
            .collect()
    }

    #[test]
    fn test_append_iterate_and_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = FilePacketLog::open(dir.path(), FileLogOptions::default()).unwrap();
            log.append_batch((1..=5).map(|k| packet(k, 2)).collect()).unwrap();
            assert_eq!(keys(&log, Some(3)), vec![3, 4, 5]);
            log.close().unwrap();
        }

        let log = FilePacketLog::open(dir.path(), FileLogOptions::default()).unwrap();
        assert_eq!(log.size(), 5);
        assert_eq!(log.weight(), 10);
        assert_eq!(keys(&log, None), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_head_trim_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = FilePacketLog::open(dir.path(), FileLogOptions::default()).unwrap();
            log.append_batch((1..=5).map(|k| packet(k, 2)).collect()).unwrap();
            let result = log.perform_compaction(1, 3).unwrap();
            assert_eq!(result.removed, 3);
            assert_eq!(result.removed_weight, 6);
        }

        let log = FilePacketLog::open(dir.path(), FileLogOptions::default()).unwrap();
        assert_eq!(keys(&log, None), vec![4, 5]);
        assert_eq!(log.weight(), 4);
    }

    #[test]
    fn test_empty_log_remembers_last_key() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = FilePacketLog::open(dir.path(), FileLogOptions::default()).unwrap();
            log.append_batch((1..=3).map(|k| packet(k, 1)).collect()).unwrap();
            log.delete_oldest_packets(3).unwrap();
        }

        let mut log = FilePacketLog::open(dir.path(), FileLogOptions::default()).unwrap();
        assert_eq!(log.size(), 0);
        assert_eq!(log.last_appended_key(), Some(3));
        assert!(log.append_batch(vec![packet(2, 1)]).is_err());
        log.append_batch(vec![packet(4, 1)]).unwrap();
        assert_eq!(keys(&log, None), vec![4]);
    }

    #[test]
    fn test_append_rejects_gaps() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = FilePacketLog::open(dir.path(), FileLogOptions::default()).unwrap();
            log.append_batch((1..=3).map(|k| packet(k, 1)).collect()).unwrap();
            assert!(matches!(
                log.append_batch(vec![packet(5, 1)]),
                Err(Error::Storage(_))
            ));
            assert!(matches!(
                log.append_batch(vec![packet(4, 1), packet(6, 1)]),
                Err(Error::Storage(_))
            ));
        }

        let mut log = FilePacketLog::open(dir.path(), FileLogOptions::default()).unwrap();
        assert_eq!(keys(&log, None), vec![1, 2, 3]);
        assert!(log.append_batch(vec![packet(9, 1)]).is_err());
        log.append_batch(vec![packet(4, 1)]).unwrap();
        log.validate_integrity().unwrap();
    }

    #[test]
    fn test_rewrite_drops_dead_prefix() {
        let dir = TempDir::new().unwrap();
        let options = FileLogOptions {
            rewrite_min_dead_bytes: 1,
            ..Default::default()
        };
        let mut log = FilePacketLog::open(dir.path(), options.clone()).unwrap();
        log.append_batch((1..=6).map(|k| packet(k, 1)).collect()).unwrap();
        let before = std::fs::metadata(dir.path().join(DATA_FILE)).unwrap().len();

        let removed = log.remove_first_batch(4, 10).unwrap();
        assert_eq!(removed.iter().map(|p| p.key).collect::<Vec<_>>(), vec![1, 2, 3, 4]);

        let after = std::fs::metadata(dir.path().join(DATA_FILE)).unwrap().len();
        assert!(after < before);
        assert_eq!(after, log.live_bytes());
        assert_eq!(keys(&log, None), vec![5, 6]);
        log.append_batch(vec![packet(7, 1)]).unwrap();
        log.validate_integrity().unwrap();
        drop(log);

        let log = FilePacketLog::open(dir.path(), options).unwrap();
        assert_eq!(keys(&log, None), vec![5, 6, 7]);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = FilePacketLog::open(dir.path(), FileLogOptions::default()).unwrap();
            log.append_batch((1..=3).map(|k| packet(k, 1)).collect()).unwrap();
        }
        let path = dir.path().join(DATA_FILE);
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();
        drop(file);

        let mut log = FilePacketLog::open(dir.path(), FileLogOptions::default()).unwrap();
        assert_eq!(keys(&log, None), vec![1, 2]);
        log.append_batch(vec![packet(3, 1)]).unwrap();
        assert_eq!(keys(&log, None), vec![1, 2, 3]);
    }

    #[test]
    fn test_corrupt_record_refuses_to_open() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = FilePacketLog::open(dir.path(), FileLogOptions::default()).unwrap();
            log.append_batch((1..=3).map(|k| packet(k, 1)).collect()).unwrap();
        }
        let path = dir.path().join(DATA_FILE);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[HEADER_LEN + 2] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let result = FilePacketLog::open(dir.path(), FileLogOptions::default());
        assert!(matches!(result, Err(Error::LogCompromised(_))));
    }

    #[test]
    fn test_damaged_length_mid_file_refuses_to_open() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = FilePacketLog::open(dir.path(), FileLogOptions::default()).unwrap();
            log.append_batch((1..=5).map(|k| packet(k, 1)).collect()).unwrap();
        }
        let path = dir.path().join(DATA_FILE);
        let mut bytes = std::fs::read(&path).unwrap();
        let original_len = bytes.len();
        assert_eq!(original_len % 5, 0);
        let record_len = original_len / 5;
        // High byte of the second record's length field
        bytes[record_len + HEADER_LEN - 1] = 0x7F;
        std::fs::write(&path, bytes).unwrap();

        let result = FilePacketLog::open(dir.path(), FileLogOptions::default());
        assert!(matches!(result, Err(Error::LogCompromised(_))));
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            original_len as u64
        );
    }

    #[test]
    fn test_bad_record_header_refuses_to_open() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = FilePacketLog::open(dir.path(), FileLogOptions::default()).unwrap();
            log.append_batch((1..=3).map(|k| packet(k, 1)).collect()).unwrap();
        }
        let path = dir.path().join(DATA_FILE);
        let mut bytes = std::fs::read(&path).unwrap();
        let record_len = bytes.len() / 3;
        bytes[record_len] = PROTOCOL_VERSION + 1;
        std::fs::write(&path, bytes).unwrap();

        let result = FilePacketLog::open(dir.path(), FileLogOptions::default());
        assert!(matches!(result, Err(Error::LogCompromised(_))));
    }

    #[test]
    fn test_max_bytes_is_storage_full() {
        let dir = TempDir::new().unwrap();
        let mut log =
            FilePacketLog::open(dir.path(), FileLogOptions::default().with_max_bytes(64)).unwrap();
        let result = log.append_batch((1..=10).map(|k| packet(k, 1)).collect());
        assert!(matches!(result, Err(Error::StorageFull { .. })));
        assert_eq!(log.size(), 0);
    }

    #[test]
    fn test_closed_log_refuses_everything() {
        let dir = TempDir::new().unwrap();
        let mut log = FilePacketLog::open(dir.path(), FileLogOptions::default()).unwrap();
        log.close().unwrap();
        assert!(log.is_closed());
        assert!(matches!(
            log.append_batch(vec![packet(1, 1)]),
            Err(Error::Storage(_))
        ));
    }
}
