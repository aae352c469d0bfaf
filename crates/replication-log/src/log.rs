use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use prost::Message;
use sequencer_types::{Batch, LogEntry};
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use crate::error::ReplicationLogError;
use crate::segment::{rewrite_segment_excluding_from, scan_segment, segment_path, ScannedEntry, SegmentMeta, SegmentWriter};

const DEFAULT_SEGMENT_SIZE_BYTES: u64 = 64 * 1024 * 1024;
const DEFAULT_FSYNC_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug)]
pub struct ReplicationLogConfig {
    pub segment_size_bytes: u64,
    pub fsync_interval: Duration,
}

impl Default for ReplicationLogConfig {
    fn default() -> Self {
        Self { segment_size_bytes: DEFAULT_SEGMENT_SIZE_BYTES, fsync_interval: DEFAULT_FSYNC_INTERVAL }
    }
}

struct CachedEntry {
    segment_id: u64,
    term: u64,
    checksum: u32,
    batch: Batch,
}

struct LogState {
    sealed: Vec<SegmentMeta>,
    active: SegmentWriter,
    index: BTreeMap<u64, CachedEntry>,
    current_term: u64,
    last_sync: Instant,
}

/// Durable, segment-backed append-only log of committed batches (§4.2,
/// §4.2a). One active segment is appendable; all others are sealed and
/// read only through a rescan on open.
pub struct ReplicationLog {
    dir: PathBuf,
    config: ReplicationLogConfig,
    state: RwLock<LogState>,
}

impl ReplicationLog {
    #[instrument(skip(config))]
    pub async fn open(dir: impl AsRef<Path>, config: ReplicationLogConfig) -> Result<Self, ReplicationLogError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut segment_ids: Vec<u64> = fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| e.path().file_stem().and_then(|s| s.to_str().map(str::to_owned)))
            .filter_map(|stem| stem.parse::<u64>().ok())
            .collect();
        segment_ids.sort_unstable();

        let mut sealed = Vec::new();
        let mut index = BTreeMap::new();
        let mut current_term = 0u64;

        let active_segment_id = segment_ids.last().copied().unwrap_or(0);

        for &segment_id in &segment_ids {
            let path = segment_path(&dir, segment_id);
            let scanned = scan_segment(&path)?;
            let (first_index, last_index) = (scanned.first().map(|e| e.index), scanned.last().map(|e| e.index));
            for entry in &scanned {
                current_term = current_term.max(entry.term);
            }
            for ScannedEntry { term, index: idx, payload, .. } in scanned {
                let checksum = crc32fast::hash(&payload);
                let proto_batch = sequencer_proto::Batch::decode(payload.as_slice())?;
                let batch = Batch::try_from(proto_batch)?;
                index.insert(idx, CachedEntry { segment_id, term, checksum, batch });
            }
            let size_bytes = fs::metadata(&path)?.len();
            if segment_id == active_segment_id {
                continue;
            }
            sealed.push(SegmentMeta { segment_id, first_index, last_index, path, size_bytes });
        }

        let active = if segment_ids.is_empty() {
            SegmentWriter::create(&dir, 0)?
        } else {
            let path = segment_path(&dir, active_segment_id);
            let scanned = scan_segment(&path)?;
            let first_index = scanned.first().map(|e| e.index);
            let last_index = scanned.last().map(|e| e.index);
            let size_bytes = last_index_end_offset(&scanned);
            // Rewrite the active segment to drop any corrupt tail frame the
            // scan silently stopped at, so the writer's append offset lines
            // up with what's actually indexed.
            rewrite_segment_excluding_from(&path, &scanned)?;
            SegmentWriter::reopen(SegmentMeta { segment_id: active_segment_id, first_index, last_index, path, size_bytes })?
        };

        debug!(sealed = sealed.len(), entries = index.len(), "replication log recovered");

        Ok(Self {
            dir,
            config,
            state: RwLock::new(LogState { sealed, active, index, current_term, last_sync: Instant::now() }),
        })
    }

    /// Leader-only; rejects with `TermConflict` if `term` is not the log's
    /// current term (§4.2 `append`). Rejects empty batches outright. The
    /// log itself assigns the dense, monotone `index` — a freshly formed
    /// `Batch` arrives with `index: 0` (per its own doc comment) and that
    /// is overwritten here, not trusted from the caller.
    #[instrument(skip(self, batch))]
    pub async fn append(&self, term: u64, mut batch: Batch) -> Result<u64, ReplicationLogError> {
        if batch.transactions.is_empty() {
            return Err(ReplicationLogError::EmptyBatch { index: batch.index });
        }

        let mut state = self.state.write().await;
        if term < state.current_term {
            return Err(ReplicationLogError::TermConflict { attempted: term, current: state.current_term });
        }
        state.current_term = term;

        let index = state.index.keys().next_back().copied().unwrap_or(0) + 1;
        batch.index = index;
        batch.term = term;
        let proto_batch = sequencer_proto::Batch::from(&batch);
        let payload = proto_batch.encode_to_vec();
        let checksum = crc32fast::hash(&payload);
        state.active.append(term, index, &payload)?;

        let should_sync = state.last_sync.elapsed() >= self.config.fsync_interval;
        if should_sync {
            state.active.sync()?;
            state.last_sync = Instant::now();
        }

        if state.active.size_bytes() >= self.config.segment_size_bytes {
            self.roll_segment(&mut state)?;
        }

        state.index.insert(index, CachedEntry { segment_id: state.active.meta.segment_id, term, checksum, batch });
        Ok(index)
    }

    /// Forces an fsync of the active segment regardless of the batching
    /// interval; called once a commit has actually been acknowledged by a
    /// quorum (§4.2 "Durability").
    pub async fn sync_now(&self) -> Result<(), ReplicationLogError> {
        let mut state = self.state.write().await;
        state.active.sync()?;
        state.last_sync = Instant::now();
        Ok(())
    }

    fn roll_segment(&self, state: &mut LogState) -> Result<(), ReplicationLogError> {
        state.active.sync()?;
        let next_id = state.active.meta.segment_id + 1;
        let sealed_meta = state.active.meta.clone();
        let new_active = SegmentWriter::create(&self.dir, next_id)?;
        let old_active = std::mem::replace(&mut state.active, new_active);
        drop(old_active);
        state.sealed.push(sealed_meta);
        Ok(())
    }

    pub async fn get_entries_after(&self, index: u64) -> Vec<LogEntry> {
        let state = self.state.read().await;
        state
            .index
            .range((std::ops::Bound::Excluded(index), std::ops::Bound::Unbounded))
            .map(|(&idx, entry)| LogEntry {
                term: entry.term,
                index: idx,
                batch: entry.batch.clone(),
                checksum: entry.checksum,
            })
            .collect()
    }

    pub async fn get(&self, index: u64) -> Option<LogEntry> {
        let state = self.state.read().await;
        state.index.get(&index).map(|entry| LogEntry {
            term: entry.term,
            index,
            batch: entry.batch.clone(),
            checksum: entry.checksum,
        })
    }

    pub async fn last_index(&self) -> u64 {
        self.state.read().await.index.keys().next_back().copied().unwrap_or(0)
    }

    /// The smallest index still retained in the log, or `0` if the log is
    /// empty. Used by `node-sync` to decide whether a lagging peer's
    /// `next_index` has fallen behind `truncate_prefix`'s watermark and
    /// needs a snapshot rather than ordinary `AppendEntries` replay.
    pub async fn first_index(&self) -> u64 {
        self.state.read().await.index.keys().next().copied().unwrap_or(0)
    }

    pub async fn last_term(&self) -> u64 {
        self.state.read().await.index.values().next_back().map(|e| e.term).unwrap_or(0)
    }

    /// Used during leader conflict resolution (§4.6): drops every entry with
    /// `index >= from` from the in-memory index and rewrites whichever
    /// segment(s) still contain surviving frames past `from`.
    #[instrument(skip(self))]
    pub async fn truncate_suffix(&self, from: u64) -> Result<(), ReplicationLogError> {
        let mut state = self.state.write().await;
        state.index.retain(|&idx, _| idx < from);

        if state.active.meta.first_index.is_some_and(|first| first >= from) {
            rewrite_segment_excluding_from(&state.active.meta.path, &[])?;
            state.active.meta.first_index = None;
            state.active.meta.last_index = None;
            state.active.meta.size_bytes = 0;
        } else if state.active.meta.last_index.is_some_and(|last| last >= from) {
            let survivors = scan_segment(&state.active.meta.path)?
                .into_iter()
                .filter(|e| e.index < from)
                .collect::<Vec<_>>();
            rewrite_segment_excluding_from(&state.active.meta.path, &survivors)?;
            state.active.meta.last_index = survivors.last().map(|e| e.index);
            state.active.meta.size_bytes = fs::metadata(&state.active.meta.path)?.len();
        }

        let mut retained_sealed = Vec::new();
        for meta in std::mem::take(&mut state.sealed) {
            match meta.first_index {
                Some(first) if first >= from => {
                    fs::remove_file(&meta.path).ok();
                }
                _ if meta.last_index.is_some_and(|last| last >= from) => {
                    let survivors = scan_segment(&meta.path)?.into_iter().filter(|e| e.index < from).collect::<Vec<_>>();
                    rewrite_segment_excluding_from(&meta.path, &survivors)?;
                    let mut meta = meta;
                    meta.last_index = survivors.last().map(|e| e.index);
                    meta.size_bytes = fs::metadata(&meta.path)?.len();
                    retained_sealed.push(meta);
                }
                _ => retained_sealed.push(meta),
            }
        }
        state.sealed = retained_sealed;
        Ok(())
    }

    /// Used after a snapshot install (§4.6): deletes whole sealed segments
    /// entirely covered by `[0, upto_exclusive)`, never splitting one
    /// (§4.2a).
    #[instrument(skip(self))]
    pub async fn truncate_prefix(&self, upto_exclusive: u64) -> Result<(), ReplicationLogError> {
        let mut state = self.state.write().await;
        state.index.retain(|&idx, _| idx >= upto_exclusive);

        let mut retained = Vec::new();
        for meta in std::mem::take(&mut state.sealed) {
            match meta.last_index {
                Some(last) if last < upto_exclusive => {
                    if let Err(e) = fs::remove_file(&meta.path) {
                        warn!(error = %e, path = ?meta.path, "failed to remove purged segment");
                    }
                }
                _ => retained.push(meta),
            }
        }
        state.sealed = retained;
        Ok(())
    }
}

fn last_index_end_offset(entries: &[ScannedEntry]) -> u64 {
    entries
        .last()
        .map(|e| e.offset + crate::segment::HEADER_SIZE as u64 + e.payload.len() as u64)
        .unwrap_or(0)
}
