// =============================================================================
// Journal — hash-chained append-only event log with periodic snapshots
// =============================================================================
//
// Every state transition in the engine lands here. Entries form a single
// global chain: each carries the SHA-256 over
// (seq, ts, kind, payload, prev_hash), so reading the log back and
// recomputing hashes detects tampering or corruption. That chain is the only
// integrity guarantee the store makes.
//
// Durability is write-through best-effort: an optional JSONL file sink is
// flushed per append; readers recover from the latest snapshot plus replay.
// =============================================================================

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::clock::{Clock, SharedClock};

/// Hash of the empty chain head.
const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// In-memory retention; the file sink keeps everything.
const MAX_RETAINED_EVENTS: usize = 65_536;

// =============================================================================
// Event model
// =============================================================================

/// What happened. The wire form is the audit vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    EngineStarted,
    EngineStopped,
    OrderAccepted,
    OrderRejected,
    OrderFilled,
    OrderCancelled,
    OrderExpired,
    OrderModified,
    OrderHeld,
    OrderUncertain,
    OrderReconciled,
    PositionOpened,
    PositionClosed,
    ExposureUpdated,
    ExposureBreach,
    HedgeRequested,
    BreakerTransition,
    SessionTransition,
    ComplianceAlert,
    SafeModeEntered,
    SafeModeCleared,
    SnapshotWritten,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
        write!(f, "{}", s.trim_matches('"'))
    }
}

/// One chained journal entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEvent {
    pub seq: u64,
    pub ts: u64,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub prev_hash: String,
    pub hash: String,
}

/// Periodic snapshot of aggregate state, tagged with the last journal
/// sequence it covers. Recovery replays events after `covered_seq`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub covered_seq: u64,
    pub ts: u64,
    pub payload: serde_json::Value,
}

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("hash chain broken at seq {seq}: expected prev {expected}, found {found}")]
    ChainBroken {
        seq: u64,
        expected: String,
        found: String,
    },

    #[error("entry hash mismatch at seq {seq}")]
    HashMismatch { seq: u64 },
}

// =============================================================================
// Journal
// =============================================================================

struct Inner {
    events: VecDeque<JournalEvent>,
    next_seq: u64,
    last_hash: String,
    snapshot: Option<StateSnapshot>,
}

/// Append-only event journal shared by every component.
pub struct Journal {
    inner: RwLock<Inner>,
    sink: Option<Mutex<File>>,
    sink_path: Option<PathBuf>,
    clock: SharedClock,
}

impl Journal {
    /// In-memory journal (tests, demo mode).
    pub fn in_memory(clock: SharedClock) -> Self {
        Self {
            inner: RwLock::new(Inner {
                events: VecDeque::new(),
                next_seq: 1,
                last_hash: GENESIS_HASH.to_string(),
                snapshot: None,
            }),
            sink: None,
            sink_path: None,
            clock,
        }
    }

    /// Journal backed by an append-only JSONL file.
    pub fn with_file(clock: SharedClock, path: impl Into<PathBuf>) -> Result<Self, JournalError> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!(path = %path.display(), "journal file sink opened");
        Ok(Self {
            inner: RwLock::new(Inner {
                events: VecDeque::new(),
                next_seq: 1,
                last_hash: GENESIS_HASH.to_string(),
                snapshot: None,
            }),
            sink: Some(Mutex::new(file)),
            sink_path: Some(path),
            clock,
        })
    }

    /// Append an event and return its sequence number.
    pub fn append(
        &self,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> Result<u64, JournalError> {
        let ts = self.clock.now_ms();
        let mut inner = self.inner.write();

        let seq = inner.next_seq;
        let prev_hash = inner.last_hash.clone();
        let hash = chain_hash(seq, ts, kind, &payload, &prev_hash);

        let event = JournalEvent {
            seq,
            ts,
            kind,
            payload,
            prev_hash,
            hash: hash.clone(),
        };

        if let Some(sink) = &self.sink {
            let line = serde_json::to_string(&event)?;
            let mut file = sink.lock();
            writeln!(file, "{line}")?;
            file.flush()?;
        }

        inner.events.push_back(event);
        while inner.events.len() > MAX_RETAINED_EVENTS {
            inner.events.pop_front();
        }
        inner.next_seq = seq + 1;
        inner.last_hash = hash;

        Ok(seq)
    }

    /// Sequence number of the last appended event, or 0 if empty.
    pub fn last_seq(&self) -> u64 {
        self.inner.read().next_seq - 1
    }

    /// Events with `seq >= from`, oldest first (bounded by retention).
    pub fn read_from(&self, from: u64) -> Vec<JournalEvent> {
        self.inner
            .read()
            .events
            .iter()
            .filter(|e| e.seq >= from)
            .cloned()
            .collect()
    }

    /// Verify the retained chain: every entry's hash recomputes, and every
    /// entry links to its predecessor.
    pub fn verify_chain(&self) -> Result<(), JournalError> {
        let inner = self.inner.read();
        let mut prev = match inner.events.front() {
            Some(first) => first.prev_hash.clone(),
            None => return Ok(()),
        };

        for event in &inner.events {
            if event.prev_hash != prev {
                return Err(JournalError::ChainBroken {
                    seq: event.seq,
                    expected: prev,
                    found: event.prev_hash.clone(),
                });
            }
            let recomputed =
                chain_hash(event.seq, event.ts, event.kind, &event.payload, &event.prev_hash);
            if recomputed != event.hash {
                return Err(JournalError::HashMismatch { seq: event.seq });
            }
            prev = event.hash.clone();
        }
        Ok(())
    }

    /// Record a snapshot of aggregate state covering everything up to the
    /// current sequence.
    pub fn record_snapshot(&self, payload: serde_json::Value) -> Result<u64, JournalError> {
        let covered_seq = self.last_seq();
        let snapshot = StateSnapshot {
            covered_seq,
            ts: self.clock.now_ms(),
            payload,
        };
        self.inner.write().snapshot = Some(snapshot);
        // The marker entry makes snapshot timing auditable in the chain itself.
        self.append(
            EventKind::SnapshotWritten,
            serde_json::json!({ "coveredSeq": covered_seq }),
        )
    }

    /// Latest recorded snapshot, if any.
    pub fn latest_snapshot(&self) -> Option<StateSnapshot> {
        self.inner.read().snapshot.clone()
    }

    /// Load previously journaled events from the file sink (startup
    /// recovery). Returns the recovered events after verifying the chain.
    pub fn recover_from_file(&self) -> Result<Vec<JournalEvent>, JournalError> {
        let Some(path) = &self.sink_path else {
            return Ok(Vec::new());
        };
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let event: JournalEvent = serde_json::from_str(&line)?;
            events.push(event);
        }

        let mut prev = GENESIS_HASH.to_string();
        for event in &events {
            if event.prev_hash != prev {
                return Err(JournalError::ChainBroken {
                    seq: event.seq,
                    expected: prev,
                    found: event.prev_hash.clone(),
                });
            }
            prev = event.hash.clone();
        }

        if let Some(last) = events.last() {
            let mut inner = self.inner.write();
            inner.next_seq = last.seq + 1;
            inner.last_hash = last.hash.clone();
            for event in &events {
                inner.events.push_back(event.clone());
            }
            while inner.events.len() > MAX_RETAINED_EVENTS {
                inner.events.pop_front();
            }
            info!(events = events.len(), last_seq = last.seq, "journal recovered from file");
        } else {
            warn!("journal file present but empty");
        }

        Ok(events)
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Journal")
            .field("events", &inner.events.len())
            .field("next_seq", &inner.next_seq)
            .field("file_backed", &self.sink.is_some())
            .finish()
    }
}

/// SHA-256 over the canonical entry encoding.
fn chain_hash(
    seq: u64,
    ts: u64,
    kind: EventKind,
    payload: &serde_json::Value,
    prev_hash: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seq.to_be_bytes());
    hasher.update(ts.to_be_bytes());
    hasher.update(kind.to_string().as_bytes());
    hasher.update(payload.to_string().as_bytes());
    hasher.update(prev_hash.as_bytes());
    hex::encode(hasher.finalize())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn journal() -> Journal {
        Journal::in_memory(Arc::new(ManualClock::new(1_000)))
    }

    #[test]
    fn append_returns_monotonic_seq() {
        let j = journal();
        let a = j.append(EventKind::OrderAccepted, serde_json::json!({"id": "o1"})).unwrap();
        let b = j.append(EventKind::OrderFilled, serde_json::json!({"id": "o1"})).unwrap();
        let c = j.append(EventKind::PositionOpened, serde_json::json!({"id": "p1"})).unwrap();
        assert_eq!((a, b, c), (1, 2, 3));
        assert_eq!(j.last_seq(), 3);
    }

    #[test]
    fn chain_links_and_verifies() {
        let j = journal();
        for i in 0..10 {
            j.append(EventKind::ExposureUpdated, serde_json::json!({"i": i})).unwrap();
        }
        let events = j.read_from(1);
        assert_eq!(events.len(), 10);
        assert_eq!(events[0].prev_hash, GENESIS_HASH);
        for pair in events.windows(2) {
            assert_eq!(pair[1].prev_hash, pair[0].hash);
        }
        j.verify_chain().unwrap();
    }

    #[test]
    fn tampering_is_detected() {
        let j = journal();
        j.append(EventKind::OrderAccepted, serde_json::json!({"id": "o1"})).unwrap();
        j.append(EventKind::OrderFilled, serde_json::json!({"qty": "1.0"})).unwrap();

        // Corrupt the payload of the first retained entry.
        {
            let mut inner = j.inner.write();
            inner.events[0].payload = serde_json::json!({"id": "oX"});
        }
        match j.verify_chain() {
            Err(JournalError::HashMismatch { seq }) => assert_eq!(seq, 1),
            other => panic!("expected hash mismatch, got {other:?}"),
        }
    }

    #[test]
    fn read_from_filters_by_seq() {
        let j = journal();
        for i in 0..5 {
            j.append(EventKind::ExposureUpdated, serde_json::json!({"i": i})).unwrap();
        }
        let tail = j.read_from(4);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].seq, 4);
    }

    #[test]
    fn snapshot_records_covered_seq() {
        let j = journal();
        j.append(EventKind::OrderAccepted, serde_json::json!({})).unwrap();
        j.append(EventKind::OrderFilled, serde_json::json!({})).unwrap();
        j.record_snapshot(serde_json::json!({"positions": []})).unwrap();

        let snap = j.latest_snapshot().unwrap();
        assert_eq!(snap.covered_seq, 2);
        // The marker entry itself comes after the covered range.
        assert_eq!(j.last_seq(), 3);
    }

    #[test]
    fn file_sink_round_trip() {
        let dir = std::env::temp_dir().join(format!("meridian-journal-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("test-journal.jsonl");
        let _ = std::fs::remove_file(&path);

        let clock: SharedClock = Arc::new(ManualClock::new(5_000));
        {
            let j = Journal::with_file(clock.clone(), &path).unwrap();
            j.append(EventKind::OrderAccepted, serde_json::json!({"id": "o1"})).unwrap();
            j.append(EventKind::OrderFilled, serde_json::json!({"id": "o1"})).unwrap();
        }

        let j2 = Journal::with_file(clock, &path).unwrap();
        let recovered = j2.recover_from_file().unwrap();
        assert_eq!(recovered.len(), 2);
        assert_eq!(j2.last_seq(), 2);
        // New appends continue the recovered chain.
        let seq = j2.append(EventKind::OrderCancelled, serde_json::json!({"id": "o1"})).unwrap();
        assert_eq!(seq, 3);
        j2.verify_chain().unwrap();

        let _ = std::fs::remove_file(&path);
    }
}
