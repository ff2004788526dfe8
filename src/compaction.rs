use std::cmp::Ordering;
use std::sync::Arc;

use crate::db::format::{InternalKey, InternalKeyComparator, NUM_LEVELS};
use crate::options::Options;
use crate::sstable::TableBuilder;
use crate::storage::File;
use crate::util::comparator::Comparator;
use crate::version::version_edit::{FileMetaData, VersionEdit};
use crate::version::{total_file_size, Version};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionReason {
    /// A level outgrew its byte (or, for level 0, file-count) budget.
    MaxSize,
    /// A file exhausted its allowed seeks.
    SeekLimit,
    /// Requested through `compact_range`.
    Manual,
}

/// The input files of a compaction: `base` at the compaction level,
/// `parent` at the level below it.
#[derive(Default)]
pub struct CompactionInputs {
    pub base: Vec<Arc<FileMetaData>>,
    pub parent: Vec<Arc<FileMetaData>>,
}

impl CompactionInputs {
    #[inline]
    pub fn add_base(&mut self, f: Arc<FileMetaData>) {
        self.base.push(f);
    }

    /// Inputs addressed as LevelDB numbers them: 0 = base, 1 = parent.
    pub fn get(&self, which: usize) -> &[Arc<FileMetaData>] {
        match which {
            0 => &self.base,
            1 => &self.parent,
            _ => panic!("compaction input index out of range: {}", which),
        }
    }
}

/// A planned compaction of `level` into `level + 1`.
pub struct Compaction<C: Comparator> {
    pub level: usize,
    pub reason: CompactionReason,
    /// The version the plan was made against; pins the input files.
    pub input_version: Option<Arc<Version<C>>>,
    /// The delta that installs this compaction's results.
    pub edit: VersionEdit,
    pub inputs: CompactionInputs,
    /// Files at `level + 2` overlapping the output range; outputs are
    /// rolled early when they accumulate too much overlap, or a future
    /// compaction of `level + 1` would be enormous.
    pub grand_parents: Vec<Arc<FileMetaData>>,

    max_grandparent_overlap_bytes: u64,

    // State for `should_stop_before`.
    grandparent_index: usize,
    seen_key: bool,
    overlapped_bytes: u64,

    // Per-level cursors for `is_base_level_for`; monotonic because keys
    // arrive in order.
    level_ptrs: Vec<usize>,
}

impl<C: Comparator + 'static> Compaction<C> {
    pub fn new<UC: Comparator>(options: &Options<UC>, level: usize, reason: CompactionReason) -> Self {
        Compaction {
            level,
            reason,
            input_version: None,
            edit: VersionEdit::new(),
            inputs: CompactionInputs::default(),
            grand_parents: vec![],
            max_grandparent_overlap_bytes: options.max_grandparent_overlap_bytes(),
            grandparent_index: 0,
            seen_key: false,
            overlapped_bytes: 0,
            level_ptrs: vec![0; NUM_LEVELS],
        }
    }

    /// A compaction that moves a single file down a level without
    /// rewriting it: nothing to merge with, and little enough
    /// grandparent overlap that the move cannot set up a pathological
    /// future compaction.
    pub fn is_trivial_move(&self) -> bool {
        self.inputs.base.len() == 1
            && self.inputs.parent.is_empty()
            && total_file_size(&self.grand_parents) <= self.max_grandparent_overlap_bytes
    }

    /// Records the deletion of every input file into the edit.
    pub fn add_input_deletions(&mut self) {
        for f in &self.inputs.base {
            self.edit.delete_file(self.level, f.number);
        }
        for f in &self.inputs.parent {
            self.edit.delete_file(self.level + 1, f.number);
        }
    }

    /// True when the current output should be closed before `ikey` is
    /// added, because the output's grandparent overlap just crossed the
    /// bound.
    pub fn should_stop_before(&mut self, ikey: &[u8], icmp: &InternalKeyComparator<C>) -> bool {
        while self.grandparent_index < self.grand_parents.len()
            && icmp.compare(
                ikey,
                self.grand_parents[self.grandparent_index].largest.data(),
            ) == Ordering::Greater
        {
            if self.seen_key {
                self.overlapped_bytes += self.grand_parents[self.grandparent_index].file_size;
            }
            self.grandparent_index += 1;
        }
        self.seen_key = true;
        if self.overlapped_bytes > self.max_grandparent_overlap_bytes {
            // Charge starts over for the next output file.
            self.overlapped_bytes = 0;
            true
        } else {
            false
        }
    }

    /// Whether no level beyond the compaction's output holds `ukey`. A
    /// tombstone whose key satisfies this (and is older than every
    /// snapshot) deletes nothing observable and can itself be dropped.
    pub fn is_base_level_for(&mut self, ukey: &[u8]) -> bool {
        let version = self
            .input_version
            .as_ref()
            .expect("compaction must carry its input version");
        let ucmp = &version.comparator().user_comparator;
        for level in self.level + 2..NUM_LEVELS {
            let files = &version.files[level];
            while self.level_ptrs[level] < files.len() {
                let f = &files[self.level_ptrs[level]];
                if ucmp.compare(ukey, f.largest.user_key()) != Ordering::Greater {
                    if ucmp.compare(ukey, f.smallest.user_key()) != Ordering::Less {
                        return false;
                    }
                    break;
                }
                // Keys only grow; this file is done for good.
                self.level_ptrs[level] += 1;
            }
        }
        true
    }

    #[inline]
    pub fn num_inputs(&self, which: usize) -> usize {
        self.inputs.get(which).len()
    }
}

/// The smallest and largest internal key covered by `files`, which must
/// be non-empty. For a sorted level this is just the ends; level-0 files
/// must all be scanned.
pub fn base_range<'a, C: Comparator>(
    files: &'a [Arc<FileMetaData>],
    level: usize,
    icmp: &InternalKeyComparator<C>,
) -> (&'a InternalKey, &'a InternalKey) {
    assert!(!files.is_empty(), "no files to compute a range over");
    if level == 0 {
        let mut smallest = &files[0].smallest;
        let mut largest = &files[0].largest;
        for f in files.iter().skip(1) {
            if icmp.compare(f.smallest.data(), smallest.data()) == Ordering::Less {
                smallest = &f.smallest;
            }
            if icmp.compare(f.largest.data(), largest.data()) == Ordering::Greater {
                largest = &f.largest;
            }
        }
        (smallest, largest)
    } else {
        (&files[0].smallest, &files[files.len() - 1].largest)
    }
}

/// The combined range of a compaction's base and parent inputs.
pub fn total_range<'a, C: Comparator>(
    base: &'a [Arc<FileMetaData>],
    parent: &'a [Arc<FileMetaData>],
    level: usize,
    icmp: &InternalKeyComparator<C>,
) -> (&'a InternalKey, &'a InternalKey) {
    let (mut smallest, mut largest) = base_range(base, level, icmp);
    if !parent.is_empty() {
        let first = &parent[0];
        if icmp.compare(first.smallest.data(), smallest.data()) == Ordering::Less {
            smallest = &first.smallest;
        }
        let last = &parent[parent.len() - 1];
        if icmp.compare(last.largest.data(), largest.data()) == Ordering::Greater {
            largest = &last.largest;
        }
    }
    (smallest, largest)
}

/// Mutable state of a compaction being executed: the output tables
/// produced so far and the builder of the one in progress.
pub struct CompactionState<F: File, C: Comparator> {
    pub compaction: Compaction<C>,
    /// Sequence numbers at or below this are invisible to every live
    /// snapshot, so shadowed entries may be dropped.
    pub smallest_snapshot: u64,
    pub outputs: Vec<FileMetaData>,
    pub builder: Option<TableBuilder<F, InternalKeyComparator<C>>>,
    pub total_bytes: u64,
}

impl<F: File, C: Comparator + 'static> CompactionState<F, C> {
    pub fn new(compaction: Compaction<C>, smallest_snapshot: u64) -> Self {
        CompactionState {
            compaction,
            smallest_snapshot,
            outputs: vec![],
            builder: None,
            total_bytes: 0,
        }
    }

    pub fn current_output(&mut self) -> &mut FileMetaData {
        self.outputs
            .last_mut()
            .expect("no compaction output is open")
    }
}
