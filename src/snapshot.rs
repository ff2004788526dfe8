use std::sync::Arc;

/// A handle pinning reads to the state at a particular sequence number.
/// While any clone of the handle is alive, compaction will not discard
/// entries that were visible at that sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Snapshot {
    sequence: u64,
}

impl Snapshot {
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// Live snapshots ordered by sequence (oldest first). Liveness is tracked
/// by `Arc` reference counts: a snapshot whose only owner is the list has
/// been released by every reader and is garbage collected lazily.
#[derive(Default)]
pub struct SnapshotList {
    snapshots: Vec<Arc<Snapshot>>,
}

impl SnapshotList {
    /// Registers and returns a snapshot at `sequence`. Sequences are
    /// assigned monotonically, so pushing to the tail keeps the order.
    pub fn acquire(&mut self, sequence: u64) -> Arc<Snapshot> {
        if let Some(last) = self.snapshots.last() {
            assert!(
                last.sequence <= sequence,
                "snapshot sequences regressed: {} then {}",
                last.sequence,
                sequence
            );
        }
        let snapshot = Arc::new(Snapshot { sequence });
        self.snapshots.push(snapshot.clone());
        snapshot
    }

    /// Drops snapshots no reader holds anymore.
    pub fn gc(&mut self) {
        self.snapshots.retain(|s| Arc::strong_count(s) > 1)
    }

    /// Explicitly releases `snapshot`, then collects.
    pub fn release(&mut self, snapshot: Arc<Snapshot>) {
        drop(snapshot);
        self.gc();
    }

    #[inline]
    pub fn is_empty(&mut self) -> bool {
        self.gc();
        self.snapshots.is_empty()
    }

    /// The smallest live sequence, if any snapshot is held.
    pub fn oldest(&mut self) -> Option<u64> {
        self.gc();
        self.snapshots.first().map(|s| s.sequence)
    }
}
