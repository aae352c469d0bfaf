//! On-disk frame and segment-file format (§4.2a).
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │ Header (28 bytes)                    │
//! │ ├─ magic:    u32                     │
//! │ ├─ checksum: u32 (CRC32C of payload) │
//! │ ├─ length:   u32                     │
//! │ ├─ term:     u64                     │
//! │ └─ index:    u64                     │
//! ├──────────────────────────────────────┤
//! │ Payload (prost-encoded LogEntry.batch) │
//! └──────────────────────────────────────┘
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub(crate) const FRAME_MAGIC: u32 = u32::from_be_bytes(*b"SQLG");
pub(crate) const HEADER_SIZE: usize = 28;

#[derive(Clone, Copy, Debug)]
pub(crate) struct FrameHeader {
    pub(crate) magic: u32,
    pub(crate) checksum: u32,
    pub(crate) length: u32,
    pub(crate) term: u64,
    pub(crate) index: u64,
}

impl FrameHeader {
    fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        buf[8..12].copy_from_slice(&self.length.to_le_bytes());
        buf[12..20].copy_from_slice(&self.term.to_le_bytes());
        buf[20..28].copy_from_slice(&self.index.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8; HEADER_SIZE]) -> Self {
        Self {
            magic: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            checksum: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            length: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            term: u64::from_le_bytes(buf[12..20].try_into().unwrap()),
            index: u64::from_le_bytes(buf[20..28].try_into().unwrap()),
        }
    }
}

/// One decoded frame recovered from a segment scan.
pub(crate) struct ScannedEntry {
    pub(crate) term: u64,
    pub(crate) index: u64,
    pub(crate) offset: u64,
    pub(crate) payload: Vec<u8>,
}

#[derive(Clone, Debug)]
pub(crate) struct SegmentMeta {
    pub(crate) segment_id: u64,
    pub(crate) first_index: Option<u64>,
    pub(crate) last_index: Option<u64>,
    pub(crate) path: PathBuf,
    pub(crate) size_bytes: u64,
}

pub(crate) fn segment_path(dir: &Path, segment_id: u64) -> PathBuf {
    dir.join(format!("{segment_id:020}.seg"))
}

/// The single active, appendable segment. Sealed segments are read through
/// [`scan_segment`] only; they are never reopened for writing.
pub(crate) struct SegmentWriter {
    pub(crate) meta: SegmentMeta,
    file: File,
}

impl SegmentWriter {
    pub(crate) fn create(dir: &Path, segment_id: u64) -> io::Result<Self> {
        let path = segment_path(dir, segment_id);
        let file = OpenOptions::new().create(true).append(true).read(true).open(&path)?;
        let size_bytes = file.metadata()?.len();
        Ok(Self {
            meta: SegmentMeta { segment_id, first_index: None, last_index: None, path, size_bytes },
            file,
        })
    }

    /// Reopen an existing active segment after a restart, with its metadata
    /// already rebuilt by the caller via [`scan_segment`].
    pub(crate) fn reopen(meta: SegmentMeta) -> io::Result<Self> {
        let file = OpenOptions::new().append(true).read(true).open(&meta.path)?;
        Ok(Self { meta, file })
    }

    /// Appends one frame, fsyncing only when the caller asks (durability is
    /// batched by `ReplicationLog`, not per-frame).
    pub(crate) fn append(&mut self, term: u64, index: u64, payload: &[u8]) -> io::Result<u64> {
        let offset = self.file.seek(SeekFrom::End(0))?;
        let checksum = crc32fast::hash(payload);
        let header = FrameHeader { magic: FRAME_MAGIC, checksum, length: payload.len() as u32, term, index };
        self.file.write_all(&header.to_bytes())?;
        self.file.write_all(payload)?;
        self.meta.size_bytes = offset + HEADER_SIZE as u64 + payload.len() as u64;
        self.meta.first_index.get_or_insert(index);
        self.meta.last_index = Some(index);
        Ok(offset)
    }

    pub(crate) fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    pub(crate) fn size_bytes(&self) -> u64 {
        self.meta.size_bytes
    }
}

/// Scans one segment file front to back, stopping (without error) at the
/// first truncated or checksum-mismatched frame — that tail is a partial
/// write from a crash mid-append and is discarded (§4.2a recovery).
pub(crate) fn scan_segment(path: &Path) -> io::Result<Vec<ScannedEntry>> {
    let mut entries = Vec::new();
    if !path.exists() {
        return Ok(entries);
    }

    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut offset = 0u64;

    loop {
        let mut header_buf = [0u8; HEADER_SIZE];
        match reader.read_exact(&mut header_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
        let header = FrameHeader::from_bytes(&header_buf);
        if header.magic != FRAME_MAGIC {
            break;
        }

        let mut payload = vec![0u8; header.length as usize];
        if reader.read_exact(&mut payload).is_err() {
            break;
        }

        if crc32fast::hash(&payload) != header.checksum {
            break;
        }

        entries.push(ScannedEntry { term: header.term, index: header.index, offset, payload });
        offset += HEADER_SIZE as u64 + header.length as u64;
    }

    Ok(entries)
}

/// Truncates `path` so only the frames with index `< upto_exclusive`
/// survive, by rewriting via a temp file and atomic rename (used by
/// `truncateSuffix` on the active segment during leader conflict
/// resolution, §4.6).
pub(crate) fn rewrite_segment_excluding_from(path: &Path, keep: &[ScannedEntry]) -> io::Result<()> {
    let temp_path = path.with_extension("seg.tmp");
    {
        let mut file = File::create(&temp_path)?;
        for entry in keep {
            let checksum = crc32fast::hash(&entry.payload);
            let header = FrameHeader {
                magic: FRAME_MAGIC,
                checksum,
                length: entry.payload.len() as u32,
                term: entry.term,
                index: entry.index,
            };
            file.write_all(&header.to_bytes())?;
            file.write_all(&entry.payload)?;
        }
        file.flush()?;
        file.sync_all()?;
    }
    fs::rename(&temp_path, path)?;
    if let Some(dir) = path.parent() {
        File::open(dir)?.sync_all()?;
    }
    Ok(())
}
