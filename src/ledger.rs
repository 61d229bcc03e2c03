use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::model::{now_ms, LedgerAction, Ms, SlotKey};

/// One record of the tamper-evident booking history.
///
/// `hash = SHA-256(sequence_no ∥ slot_key ∥ action ∥ actor ∥ timestamp ∥ prev_hash)`,
/// hex-encoded; `prev_hash` of entry 0 is the configured genesis value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub sequence_no: u64,
    pub slot_key: SlotKey,
    pub action: LedgerAction,
    pub actor: String,
    pub timestamp: Ms,
    pub prev_hash: String,
    pub hash: String,
}

#[derive(Debug)]
pub enum LedgerError {
    Io(io::Error),
    /// Replayed entries fail the chain check — audit trust is gone and the
    /// file is never silently repaired.
    Corrupt { sequence_no: u64 },
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::Io(e) => write!(f, "ledger I/O error: {e}"),
            LedgerError::Corrupt { sequence_no } => {
                write!(f, "ledger integrity failure at entry {sequence_no}")
            }
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<io::Error> for LedgerError {
    fn from(e: io::Error) -> Self {
        LedgerError::Io(e)
    }
}

fn entry_hash(
    sequence_no: u64,
    slot_key: &SlotKey,
    action: LedgerAction,
    actor: &str,
    timestamp: Ms,
    prev_hash: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sequence_no.to_be_bytes());
    hasher.update([0u8]);
    hasher.update(slot_key.to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(action.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(actor.as_bytes());
    hasher.update([0u8]);
    hasher.update(timestamp.to_be_bytes());
    hasher.update([0u8]);
    hasher.update(prev_hash.as_bytes());
    hex::encode(hasher.finalize())
}

/// Recompute the chain over `entries`, where the first entry's `prev_hash`
/// must equal `prev`. Pure — used by `verify` over a read snapshot and by
/// replay.
pub fn chain_valid(prev: &str, entries: &[LedgerEntry]) -> bool {
    let mut prev = prev.to_string();
    for e in entries {
        if e.prev_hash != prev {
            return false;
        }
        let computed = entry_hash(
            e.sequence_no,
            &e.slot_key,
            e.action,
            &e.actor,
            e.timestamp,
            &e.prev_hash,
        );
        if computed != e.hash {
            return false;
        }
        prev = e.hash.clone();
    }
    true
}

/// Encode one entry in `[u32 len][bincode][u32 crc32]` framing.
fn encode_entry(writer: &mut impl Write, entry: &LedgerEntry) -> io::Result<()> {
    let payload =
        bincode::serialize(entry).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Read all intact entries from an append-only ledger file. A truncated or
/// CRC-corrupt tail (crash mid-append) is discarded; everything before it
/// is kept.
fn read_entries(path: &Path) -> io::Result<Vec<LedgerEntry>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut entries = Vec::new();

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
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }

        let mut crc_buf = [0u8; 4];
        match reader.read_exact(&mut crc_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
        if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
            break;
        }

        match bincode::deserialize::<LedgerEntry>(&payload) {
            Ok(entry) => entries.push(entry),
            Err(_) => break,
        }
    }

    Ok(entries)
}

#[derive(Debug)]
struct LedgerInner {
    entries: Vec<LedgerEntry>,
    writer: BufWriter<File>,
}

/// Append-only, hash-chained audit log of booking actions.
///
/// Appends are serialized behind the write lock since each entry depends on
/// the previous entry's hash; the operation is O(1) and sits after the state
/// transition has already committed, so the global ordering lock is off the
/// booking hot path. Each append is fsynced before returning.
#[derive(Debug)]
pub struct Ledger {
    genesis: String,
    path: PathBuf,
    inner: RwLock<LedgerInner>,
}

impl Ledger {
    /// Open (or create) the ledger at `path`, replaying and chain-checking
    /// any existing entries against `genesis`.
    pub fn open(path: &Path, genesis: impl Into<String>) -> Result<Self, LedgerError> {
        let genesis = genesis.into();
        let entries = read_entries(path)?;
        if !chain_valid(&genesis, &entries) {
            let at = entries.first().map(|e| e.sequence_no).unwrap_or(0);
            return Err(LedgerError::Corrupt { sequence_no: at });
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            genesis,
            path: path.to_path_buf(),
            inner: RwLock::new(LedgerInner {
                entries,
                writer: BufWriter::new(file),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one action. Single-writer: the chain tail is read and the new
    /// entry written under one lock.
    pub async fn append(
        &self,
        slot_key: &SlotKey,
        action: LedgerAction,
        actor: &str,
    ) -> Result<LedgerEntry, LedgerError> {
        let start = std::time::Instant::now();
        let mut inner = self.inner.write().await;

        let sequence_no = inner.entries.len() as u64;
        let prev_hash = inner
            .entries
            .last()
            .map(|e| e.hash.clone())
            .unwrap_or_else(|| self.genesis.clone());
        let timestamp = now_ms();
        let hash = entry_hash(sequence_no, slot_key, action, actor, timestamp, &prev_hash);
        let entry = LedgerEntry {
            sequence_no,
            slot_key: slot_key.clone(),
            action,
            actor: actor.to_string(),
            timestamp,
            prev_hash,
            hash,
        };

        encode_entry(&mut inner.writer, &entry)?;
        inner.writer.flush()?;
        inner.writer.get_ref().sync_all()?;
        inner.entries.push(entry.clone());

        metrics::counter!(crate::observability::LEDGER_APPENDS_TOTAL).increment(1);
        metrics::histogram!(crate::observability::LEDGER_APPEND_DURATION_SECONDS)
            .record(start.elapsed().as_secs_f64());
        Ok(entry)
    }

    /// Recompute the hash chain over `[from, to]` (inclusive) against a
    /// read snapshot. Out-of-range or inverted bounds verify as false.
    pub async fn verify(&self, from: u64, to: u64) -> bool {
        let inner = self.inner.read().await;
        let len = inner.entries.len() as u64;
        if from > to || to >= len {
            return false;
        }
        let prev = if from == 0 {
            self.genesis.clone()
        } else {
            inner.entries[from as usize - 1].hash.clone()
        };
        chain_valid(&prev, &inner.entries[from as usize..=to as usize])
    }

    pub async fn len(&self) -> u64 {
        self.inner.read().await.entries.len() as u64
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.entries.is_empty()
    }

    /// Snapshot of all entries, for audits.
    pub async fn entries(&self) -> Vec<LedgerEntry> {
        self.inner.read().await.entries.clone()
    }
}
