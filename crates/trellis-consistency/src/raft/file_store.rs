// File-backed log storage for Raft
// Persists the log as an append-only segment of length-prefixed JSON records,
// plus the vote state, the compaction point and the latest snapshot

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use trellis_common::{Index, NodeId, Result, Term, TrellisError};

use super::log_store::{LogStore, MemoryLogStore};
use super::types::{HardState, LogEntry, Snapshot, SnapshotMeta};

const SEGMENT_FILE: &str = "log.segment";
const SNAPSHOT_FILE: &str = "snapshot.bin";
const HARD_STATE_FILE: &str = "hard_state.json";
const COMPACTION_FILE: &str = "compaction.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct CompactionPoint {
    index: Index,
    term: Term,
}

/// Durable log store
///
/// Reads are served from an in-memory mirror; every mutation is written
/// through before it returns. Truncation and compaction rewrite the segment
/// with a temp file and rename.
pub struct FileLogStore {
    dir: PathBuf,
    inner: MemoryLogStore,
    segment: BufWriter<File>,
    sync: bool,
}

impl FileLogStore {
    /// Open (or create) the store in `dir`, recovering any persisted state
    pub fn open<P: AsRef<Path>>(dir: P, sync: bool) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let hard_state: HardState = read_json(&dir.join(HARD_STATE_FILE))?.unwrap_or_default();
        let point: CompactionPoint = read_json(&dir.join(COMPACTION_FILE))?.unwrap_or_default();
        let snapshot = read_snapshot(&dir.join(SNAPSHOT_FILE))?;

        let mut inner = MemoryLogStore::restore(hard_state, (point.index, point.term), snapshot);
        let recovered = read_segment(&dir.join(SEGMENT_FILE))?;
        let live: Vec<LogEntry> = recovered
            .into_iter()
            .filter(|entry| entry.index > point.index)
            .collect();
        inner.append(&live)?;

        let segment = open_segment(&dir.join(SEGMENT_FILE))?;
        let mut store = Self {
            dir,
            inner,
            segment,
            sync,
        };
        // Drop a torn tail or stale prefix left by a crash.
        store.rewrite_segment()?;

        info!(
            "File log store opened at {:?}: first_index={}, last_index={}, term={}",
            store.dir,
            store.inner.first_index(),
            store.inner.last_index(),
            hard_state.term
        );
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn flush(&mut self) -> Result<()> {
        self.segment.flush()?;
        if self.sync {
            self.segment.get_ref().sync_data()?;
        }
        Ok(())
    }

    fn rewrite_segment(&mut self) -> Result<()> {
        let path = self.dir.join(SEGMENT_FILE);
        let tmp = self.dir.join(format!("{}.tmp", SEGMENT_FILE));
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            for entry in self.inner.iter() {
                write_record(&mut writer, entry)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        self.segment = open_segment(&path)?;
        debug!("Rewrote log segment with {} entries", self.inner.len());
        Ok(())
    }

    fn persist_compaction_point(&self) -> Result<()> {
        let (index, term) = self.inner.compaction_point();
        write_json_atomic(
            &self.dir.join(COMPACTION_FILE),
            &CompactionPoint { index, term },
        )
    }

    fn persist_snapshot(&self) -> Result<()> {
        match self.inner.snapshot() {
            Some(snapshot) => write_snapshot(&self.dir.join(SNAPSHOT_FILE), snapshot),
            None => Ok(()),
        }
    }
}

impl LogStore for FileLogStore {
    fn hard_state(&self) -> HardState {
        self.inner.hard_state()
    }

    fn save_hard_state(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<()> {
        write_json_atomic(&self.dir.join(HARD_STATE_FILE), &HardState { term, voted_for })?;
        self.inner.save_hard_state(term, voted_for)
    }

    fn first_index(&self) -> Index {
        self.inner.first_index()
    }

    fn last_index(&self) -> Index {
        self.inner.last_index()
    }

    fn term_at(&self, index: Index) -> Option<Term> {
        self.inner.term_at(index)
    }

    fn entry(&self, index: Index) -> Option<LogEntry> {
        self.inner.entry(index)
    }

    fn entries(&self, from: Index, to: Index, max: usize) -> Result<Vec<LogEntry>> {
        self.inner.entries(from, to, max)
    }

    fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
        self.inner.append(entries)?;
        for entry in entries {
            write_record(&mut self.segment, entry)?;
        }
        self.flush()
    }

    fn truncate_from(&mut self, index: Index) -> Result<()> {
        self.inner.truncate_from(index)?;
        self.rewrite_segment()
    }

    fn compact(&mut self, upto: Index, snapshot: Snapshot) -> Result<()> {
        let before = self.inner.compacted_index();
        self.inner.compact(upto, snapshot)?;
        // The snapshot must be durable before the entries it replaces vanish.
        self.persist_snapshot()?;
        if self.inner.compacted_index() > before {
            self.persist_compaction_point()?;
            self.rewrite_segment()?;
        }
        Ok(())
    }

    fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        self.inner.install_snapshot(snapshot)?;
        self.persist_snapshot()?;
        self.persist_compaction_point()?;
        self.rewrite_segment()
    }

    fn snapshot(&self) -> Option<&Snapshot> {
        self.inner.snapshot()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

fn open_segment(path: &Path) -> Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

/// Frame: u32 big-endian length, then the JSON encoded entry
fn write_record<W: Write>(writer: &mut W, entry: &LogEntry) -> Result<()> {
    let bytes = serde_json::to_vec(entry)?;
    writer.write_u32::<BigEndian>(bytes.len() as u32)?;
    writer.write_all(&bytes)?;
    Ok(())
}

fn read_segment(path: &Path) -> Result<Vec<LogEntry>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut reader = BufReader::new(file);
    let mut entries = Vec::new();
    loop {
        let len = match reader.read_u32::<BigEndian>() {
            Ok(len) => len as usize,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        };
        let mut buf = vec![0u8; len];
        if let Err(e) = reader.read_exact(&mut buf) {
            if e.kind() == ErrorKind::UnexpectedEof {
                warn!("Discarding torn record at the tail of {:?}", path);
                break;
            }
            return Err(e.into());
        }
        match serde_json::from_slice::<LogEntry>(&buf) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                warn!("Discarding undecodable tail of {:?}: {}", path, e);
                break;
            }
        }
    }
    Ok(entries)
}

/// Snapshot layout: u32 length + JSON metadata, then u64 length + raw data
fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        let meta = serde_json::to_vec(&snapshot.meta)?;
        writer.write_u32::<BigEndian>(meta.len() as u32)?;
        writer.write_all(&meta)?;
        writer.write_u64::<BigEndian>(snapshot.data.len() as u64)?;
        writer.write_all(&snapshot.data)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_snapshot(path: &Path) -> Result<Option<Snapshot>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let corrupted = |e: std::io::Error| TrellisError::corrupted_snapshot(e.to_string());
    let mut reader = BufReader::new(file);

    let meta_len = reader.read_u32::<BigEndian>().map_err(corrupted)? as usize;
    let mut meta = vec![0u8; meta_len];
    reader.read_exact(&mut meta).map_err(corrupted)?;
    let meta: SnapshotMeta = serde_json::from_slice(&meta)
        .map_err(|e| TrellisError::corrupted_snapshot(e.to_string()))?;

    let data_len = reader.read_u64::<BigEndian>().map_err(corrupted)? as usize;
    let mut data = vec![0u8; data_len];
    reader.read_exact(&mut data).map_err(corrupted)?;

    let snapshot = Snapshot { meta, data };
    snapshot.verify()?;
    Ok(Some(snapshot))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, serde_json::to_vec(value)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
