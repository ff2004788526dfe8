use std::cmp::Ordering as CmpOrdering;
use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::compaction::{base_range, total_range, Compaction, CompactionInputs, CompactionReason};
use crate::db::filename::{generate_filename, parse_filename, update_current, FileType};
use crate::db::format::{InternalKey, InternalKeyComparator, NUM_LEVELS};
use crate::error::{Error, IResult};
use crate::iterator::{ConcatenateIterator, DerivedIterFactory, Iter, KMergeCore, KMergeIter};
use crate::options::{Options, ReadOptions};
use crate::snapshot::{Snapshot, SnapshotList};
use crate::storage::{read_string_from_file, File, Storage};
use crate::table_cache::TableCache;
use crate::util::comparator::Comparator;
use crate::util::reporter::LogReporter;
use crate::version::version_edit::{FileDelta, FileMetaData, VersionEdit};
use crate::version::{
    decode_file_meta_value, total_file_size, LevelFileNumIterator, Version,
};
use crate::wal::reader::Reader;
use crate::wal::writer::Writer;

/// Per-level diff a `VersionBuilder` accumulates before materializing a
/// new `Version`.
struct LevelDiff {
    deleted_files: HashSet<u64>,
    added_files: Vec<Arc<FileMetaData>>,
}

/// Folds one or more `VersionEdit`s over a base `Version` to produce the
/// next `Version`.
pub struct VersionBuilder<'a, C: Comparator> {
    levels: Vec<LevelDiff>,
    base: &'a Version<C>,
}

impl<'a, C: Comparator + 'static> VersionBuilder<'a, C> {
    pub fn new(base: &'a Version<C>) -> Self {
        let levels = (0..NUM_LEVELS)
            .map(|_| LevelDiff {
                deleted_files: HashSet::new(),
                added_files: vec![],
            })
            .collect();
        VersionBuilder { levels, base }
    }

    /// Folds `delta` in, updating the set's round-robin compaction
    /// pointers as it goes.
    pub fn accumulate(&mut self, delta: FileDelta, compaction_pointers: &mut [InternalKey]) {
        for (level, key) in delta.compaction_pointers {
            compaction_pointers[level] = key;
        }
        for (level, number) in delta.deleted_files {
            self.levels[level].deleted_files.insert(number);
        }
        for (level, file) in delta.new_files {
            file.init_allowed_seeks();
            self.levels[level].deleted_files.remove(&file.number);
            self.levels[level].added_files.push(Arc::new(file));
        }
    }

    /// Materializes the accumulated state into a fresh version.
    pub fn apply_to_new(mut self, icmp: &InternalKeyComparator<C>) -> Version<C> {
        let mut version = Version::new(icmp.clone());
        for (level, diff) in self.levels.iter_mut().enumerate() {
            let mut kept: Vec<Arc<FileMetaData>> = self.base.files[level]
                .iter()
                .filter(|f| !diff.deleted_files.contains(&f.number))
                .cloned()
                .collect();
            let mut added: Vec<Arc<FileMetaData>> = diff
                .added_files
                .drain(..)
                .filter(|f| !diff.deleted_files.contains(&f.number))
                .collect();
            if level == 0 {
                // Level-0 files overlap; keep them newest first, the
                // order lookups want.
                kept.append(&mut added);
                kept.sort_by(|a, b| b.number.cmp(&a.number));
                version.files[level] = kept;
            } else {
                added.sort_by(|a, b| icmp.compare(a.smallest.data(), b.smallest.data()));
                let merged = merge_by_smallest(icmp, kept, added);
                debug_assert!(
                    !has_overlapping(icmp, &merged),
                    "overlapping files produced in level {}",
                    level
                );
                version.files[level] = merged;
            }
        }
        version
    }
}

fn merge_by_smallest<C: Comparator>(
    icmp: &InternalKeyComparator<C>,
    left: Vec<Arc<FileMetaData>>,
    right: Vec<Arc<FileMetaData>>,
) -> Vec<Arc<FileMetaData>> {
    let mut merged = Vec::with_capacity(left.len() + right.len());
    let (mut i, mut j) = (0, 0);
    while i < left.len() && j < right.len() {
        if icmp.compare(left[i].smallest.data(), right[j].smallest.data()) == CmpOrdering::Less {
            merged.push(left[i].clone());
            i += 1;
        } else {
            merged.push(right[j].clone());
            j += 1;
        }
    }
    merged.extend_from_slice(&left[i..]);
    merged.extend_from_slice(&right[j..]);
    merged
}

fn has_overlapping<C: Comparator>(
    icmp: &InternalKeyComparator<C>,
    files: &[Arc<FileMetaData>],
) -> bool {
    files
        .windows(2)
        .any(|w| icmp.compare(w[0].largest.data(), w[1].smallest.data()) != CmpOrdering::Less)
}

/// Owns the chain of versions, the logical clocks (sequence, file
/// numbers, WAL numbers), the snapshot registry, and the manifest
/// writer. Guarded by the database mutex; expensive I/O (manifest
/// append/sync) is the one thing done while holding it that callers
/// arrange to overlap with foreground work.
pub struct VersionSet<S: Storage + Clone, C: Comparator> {
    db_path: String,
    storage: S,
    options: Options<C>,
    icmp: InternalKeyComparator<C>,

    pub snapshots: SnapshotList,
    /// File numbers claimed by in-flight flushes/compactions; such files
    /// are not deletable even though no version references them yet.
    pub pending_outputs: HashSet<u64>,
    /// Round-robin cursor per level for size compactions.
    pub compaction_pointers: Vec<InternalKey>,

    next_file_number: u64,
    last_sequence: u64,
    /// Number of the live WAL.
    log_number: u64,
    /// WAL superseded but possibly not yet fully flushed (legacy field,
    /// kept for format compatibility).
    prev_log_number: u64,
    manifest_file_number: u64,
    manifest_writer: Option<Writer<S::F>>,

    versions: Vec<Arc<Version<C>>>,
}

impl<S: Storage + Clone, C: Comparator + 'static> VersionSet<S, C> {
    pub fn new(db_path: String, options: Options<C>, storage: S) -> Self {
        let icmp = InternalKeyComparator::new(options.comparator.clone());
        let first = Arc::new(Version::new(icmp.clone()));
        VersionSet {
            db_path,
            storage,
            options,
            icmp,
            snapshots: SnapshotList::default(),
            pending_outputs: HashSet::new(),
            compaction_pointers: vec![InternalKey::default(); NUM_LEVELS],
            next_file_number: 2,
            last_sequence: 0,
            log_number: 0,
            prev_log_number: 0,
            manifest_file_number: 0,
            manifest_writer: None,
            versions: vec![first],
        }
    }

    #[inline]
    pub fn current(&self) -> Arc<Version<C>> {
        self.versions.last().unwrap().clone()
    }

    #[inline]
    pub fn comparator(&self) -> InternalKeyComparator<C> {
        self.icmp.clone()
    }

    #[inline]
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    #[inline]
    pub fn set_last_sequence(&mut self, seq: u64) {
        debug_assert!(seq >= self.last_sequence);
        self.last_sequence = seq;
    }

    #[inline]
    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    #[inline]
    pub fn prev_log_number(&self) -> u64 {
        self.prev_log_number
    }

    #[inline]
    pub fn manifest_number(&self) -> u64 {
        self.manifest_file_number
    }

    /// Allocates a fresh file number.
    #[inline]
    pub fn new_file_number(&mut self) -> u64 {
        let n = self.next_file_number;
        self.next_file_number += 1;
        n
    }

    /// Returns an unused allocation so the number space stays dense.
    /// Only valid for the most recently allocated number.
    #[inline]
    pub fn reuse_file_number(&mut self, number: u64) {
        if number + 1 == self.next_file_number {
            self.next_file_number = number;
        }
    }

    /// Advances the allocator past an externally observed number.
    pub fn mark_file_number_used(&mut self, number: u64) {
        if self.next_file_number <= number {
            self.next_file_number = number + 1;
        }
    }

    #[inline]
    pub fn new_snapshot(&mut self) -> Arc<Snapshot> {
        self.snapshots.acquire(self.last_sequence)
    }

    /// File count of `level` in the current version.
    pub fn level_files_count(&self, level: usize) -> usize {
        self.current().num_files(level)
    }

    /// Whether background work is warranted: a level over budget or a
    /// file over its seek allowance.
    pub fn needs_compaction(&self) -> bool {
        let current = self.current();
        current.compaction_score >= 1.0 || current.file_to_compact().is_some()
    }

    /// Table file numbers referenced by any live version.
    pub fn live_files(&self) -> HashSet<u64> {
        let mut live = HashSet::new();
        for version in &self.versions {
            for files in &version.files {
                for f in files {
                    live.insert(f.number);
                }
            }
        }
        live
    }

    /// Applies `edit` to the current version, journals it in the
    /// manifest (fsynced), and installs the result as the new current
    /// version. On a manifest error nothing is installed and the
    /// half-written manifest (if it was new) is discarded.
    pub fn log_and_apply(&mut self, mut edit: VersionEdit) -> IResult<()> {
        if let Some(target_log) = edit.log_number {
            assert!(
                target_log >= self.log_number && target_log < self.next_file_number,
                "edit carries log number {} outside [{}, {})",
                target_log,
                self.log_number,
                self.next_file_number
            );
        } else {
            edit.set_log_number(self.log_number);
        }
        if edit.prev_log_number.is_none() {
            edit.set_prev_log_number(self.prev_log_number);
        }
        edit.set_next_file_number(self.next_file_number);
        edit.set_last_sequence(self.last_sequence);

        let mut record = vec![];
        edit.encode_to(&mut record);

        let version = {
            let current = self.current();
            let mut builder = VersionBuilder::new(&current);
            builder.accumulate(
                std::mem::take(&mut edit.file_delta),
                &mut self.compaction_pointers,
            );
            let mut version = builder.apply_to_new(&self.icmp);
            version.finalize(&self.options);
            version
        };

        // First application ever: start a manifest seeded with a
        // snapshot of the current state.
        let mut created_manifest = None;
        if self.manifest_writer.is_none() {
            let path = generate_filename(&self.db_path, FileType::Manifest, self.manifest_file_number);
            debug!(manifest = self.manifest_file_number, "creating manifest");
            let file = self.storage.create(&path)?;
            let mut writer = Writer::new(file);
            match self.write_snapshot(&mut writer) {
                Ok(()) => {
                    self.manifest_writer = Some(writer);
                    created_manifest = Some(path);
                }
                Err(e) => {
                    let _ = self.storage.remove(&path);
                    return Err(e);
                }
            }
        }

        let writer = self.manifest_writer.as_mut().unwrap();
        let result = writer.add_record(&record).and_then(|()| writer.sync());
        match result {
            Ok(()) => {
                if let Some(path) = created_manifest.as_ref() {
                    if let Err(e) =
                        update_current(&self.storage, &self.db_path, self.manifest_file_number)
                    {
                        warn!("failed to install CURRENT: {}", e);
                        self.manifest_writer = None;
                        let _ = self.storage.remove(path);
                        return Err(e);
                    }
                }
            }
            Err(e) => {
                warn!("manifest append failed: {}", e);
                self.manifest_writer = None;
                if let Some(path) = created_manifest {
                    let _ = self.storage.remove(&path);
                }
                return Err(e);
            }
        }

        self.log_number = edit.log_number.unwrap();
        self.prev_log_number = edit.prev_log_number.unwrap();
        info!(
            level_files = %version.level_summary(),
            "installed version"
        );
        self.versions.push(Arc::new(version));
        self.gc();
        Ok(())
    }

    /// Reconstructs the current version and counters from
    /// CURRENT/manifest. Returns whether a fresh manifest should be
    /// written (i.e. the old one is not being reused).
    pub fn recover(&mut self) -> IResult<bool> {
        let current_contents = read_string_from_file(
            &self.storage,
            generate_filename(&self.db_path, FileType::Current, 0),
        )?;
        if current_contents.is_empty() || !current_contents.ends_with('\n') {
            return Err(Error::Corruption(
                "CURRENT file does not end with newline".to_owned(),
            ));
        }
        let manifest_name = current_contents.trim_end_matches('\n');
        let manifest_path = format!(
            "{}{}{}",
            self.db_path,
            std::path::MAIN_SEPARATOR,
            manifest_name
        );
        let manifest_file = self.storage.open(&manifest_path)?;
        let manifest_len = manifest_file.len()?;

        let mut next_file_number = None;
        let mut last_sequence = None;
        let mut log_number = None;
        let mut prev_log_number = None;

        let base = Version::new(self.icmp.clone());
        let mut builder = VersionBuilder::new(&base);
        let reporter = LogReporter::new();
        let mut reader = Reader::new(manifest_file, Some(Box::new(reporter.clone())), true, 0);
        let mut record = vec![];
        while reader.read_record(&mut record) {
            reporter.result()?;
            let mut edit = VersionEdit::new();
            edit.decoded_from(&record)?;
            debug!(?edit, "manifest record");
            if let Some(name) = &edit.comparator_name {
                if name != self.icmp.user_comparator.name() {
                    return Err(Error::InvalidArgument(format!(
                        "comparator mismatch: database uses {}, caller supplied {}",
                        name,
                        self.icmp.user_comparator.name()
                    )));
                }
            }
            builder.accumulate(
                std::mem::take(&mut edit.file_delta),
                &mut self.compaction_pointers,
            );
            next_file_number = edit.next_file_number.or(next_file_number);
            last_sequence = edit.last_sequence.or(last_sequence);
            log_number = edit.log_number.or(log_number);
            prev_log_number = edit.prev_log_number.or(prev_log_number);
        }
        reporter.result()?;

        let next_file_number = next_file_number
            .ok_or_else(|| Error::Corruption("no meta-nextfile entry in manifest".to_owned()))?;
        let log_number = log_number
            .ok_or_else(|| Error::Corruption("no meta-lognumber entry in manifest".to_owned()))?;
        let last_sequence = last_sequence.ok_or_else(|| {
            Error::Corruption("no last-sequence-number entry in manifest".to_owned())
        })?;
        let prev_log_number = prev_log_number.unwrap_or(0);

        self.mark_file_number_used(prev_log_number);
        self.mark_file_number_used(log_number);

        let mut version = builder.apply_to_new(&self.icmp);
        version.finalize(&self.options);
        self.versions.push(Arc::new(version));
        self.manifest_file_number = next_file_number;
        self.next_file_number = next_file_number + 1;
        self.last_sequence = last_sequence;
        self.log_number = log_number;
        self.prev_log_number = prev_log_number;

        Ok(!self.should_reuse_manifest(&manifest_path, manifest_len))
    }

    /// Plans the next compaction, size-triggered first, else
    /// seek-triggered. `None` when no work is warranted.
    pub fn pick_compaction(&mut self) -> Option<Compaction<C>> {
        let current = self.current();
        let size_compaction = current.compaction_score >= 1.0;
        let mut compaction = if size_compaction {
            let level = current.compaction_level;
            assert!(
                level + 1 < NUM_LEVELS,
                "compaction level {} has nowhere to go",
                level
            );
            let mut c = Compaction::new(&self.options, level, CompactionReason::MaxSize);
            // Round-robin: first file past the cursor for this level.
            for f in &current.files[level] {
                if self.compaction_pointers[level].is_empty()
                    || self
                        .icmp
                        .compare(f.largest.data(), self.compaction_pointers[level].data())
                        == CmpOrdering::Greater
                {
                    c.inputs.add_base(f.clone());
                    break;
                }
            }
            if c.inputs.base.is_empty() {
                // Cursor past the last file: wrap around.
                if let Some(f) = current.files[level].first() {
                    c.inputs.add_base(f.clone());
                }
            }
            c
        } else {
            let file = current.file_to_compact()?;
            let level = current.file_to_compact_level();
            if level + 1 >= NUM_LEVELS {
                return None;
            }
            let mut c = Compaction::new(&self.options, level, CompactionReason::SeekLimit);
            c.inputs.add_base(file);
            c
        };
        if compaction.inputs.base.is_empty() {
            return None;
        }
        compaction.input_version = Some(current.clone());

        if compaction.level == 0 {
            // Level-0 inputs overlap each other: widen to everything
            // the chosen file touches.
            let (smallest, largest) =
                base_range(&compaction.inputs.base, 0, &self.icmp);
            compaction.inputs.base =
                current.get_overlapping_inputs(0, Some(smallest), Some(largest));
            assert!(!compaction.inputs.base.is_empty());
        }
        Some(self.setup_other_inputs(compaction))
    }

    /// Plans a manual compaction of `level` covering `[begin, end]`.
    /// `None` when the range holds no files at that level.
    pub fn compact_range(
        &mut self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Option<Compaction<C>> {
        let current = self.current();
        let mut inputs = current.get_overlapping_inputs(level, begin, end);
        if inputs.is_empty() {
            return None;
        }
        // For a sorted level, bound how much one manual pass chews: a
        // range over the whole key space must not become one giant
        // compaction.
        if level > 0 {
            let mut total = 0;
            for (i, f) in inputs.iter().enumerate() {
                total += f.file_size;
                if total >= self.options.max_file_size {
                    inputs.truncate(i + 1);
                    break;
                }
            }
        }
        let mut c = Compaction::new(&self.options, level, CompactionReason::Manual);
        c.input_version = Some(current);
        c.inputs.base = inputs;
        Some(self.setup_other_inputs(c))
    }

    /// Completes a compaction plan: pulls in user-key boundary files,
    /// the parent-level overlap, optionally grows the base set when
    /// that is free, records the grandparents, and advances this
    /// level's compaction pointer.
    fn setup_other_inputs(&mut self, mut c: Compaction<C>) -> Compaction<C> {
        let current = c
            .input_version
            .clone()
            .expect("compaction must carry its input version");
        add_boundary_inputs(&self.icmp, &current.files[c.level], &mut c.inputs.base);

        let (smallest, largest) = base_range(&c.inputs.base, c.level, &self.icmp);
        let parent = current.get_overlapping_inputs(c.level + 1, Some(smallest), Some(largest));
        let (all_smallest, all_largest) =
            total_range(&c.inputs.base, &parent, c.level, &self.icmp);

        // Try to grow the base set without dragging in more parent
        // files: more data per pass for the same parent rewrite.
        let (base_files, parent_files) = if parent.is_empty() {
            (std::mem::take(&mut c.inputs.base), parent)
        } else {
            let mut expanded = current.get_overlapping_inputs(
                c.level,
                Some(all_smallest),
                Some(all_largest),
            );
            add_boundary_inputs(&self.icmp, &current.files[c.level], &mut expanded);
            let base_size = total_file_size(&c.inputs.base);
            let parent_size = total_file_size(&parent);
            let expanded_size = total_file_size(&expanded);
            if expanded.len() > c.inputs.base.len()
                && parent_size + expanded_size
                    <= self.options.expanded_compaction_byte_size_limit()
            {
                let (new_smallest, new_largest) = base_range(&expanded, c.level, &self.icmp);
                let expanded_parent = current.get_overlapping_inputs(
                    c.level + 1,
                    Some(new_smallest),
                    Some(new_largest),
                );
                if expanded_parent.len() == parent.len() {
                    info!(
                        level = c.level,
                        files = expanded.len(),
                        bytes = expanded_size,
                        prev_files = c.inputs.base.len(),
                        prev_bytes = base_size,
                        "expanding compaction inputs"
                    );
                    (expanded, expanded_parent)
                } else {
                    // Growing the base would grow the parent set too;
                    // keep the original plan.
                    (std::mem::take(&mut c.inputs.base), parent)
                }
            } else {
                (std::mem::take(&mut c.inputs.base), parent)
            }
        };

        let (final_smallest, final_largest) =
            total_range(&base_files, &parent_files, c.level, &self.icmp);
        if c.level + 2 < NUM_LEVELS {
            c.grand_parents = current.get_overlapping_inputs(
                c.level + 2,
                Some(final_smallest),
                Some(final_largest),
            );
        }

        // Move the cursor now rather than when the edit commits: if the
        // compaction fails, the next attempt tries different keys.
        let cursor = final_largest.clone();
        c.edit.set_compact_pointer(c.level, cursor.clone());
        self.compaction_pointers[c.level] = cursor;

        c.inputs = CompactionInputs {
            base: base_files,
            parent: parent_files,
        };
        c
    }

    /// A merging iterator over every entry the compaction reads.
    pub fn make_input_iterator(
        &self,
        c: &Compaction<C>,
        table_cache: &TableCache<S, C>,
    ) -> IResult<KMergeIter<SSTableIters<S, C>>> {
        let read_options = ReadOptions {
            verify_checksums: self.options.paranoid_checks,
            // Compaction reads each block once; do not churn the cache.
            fill_cache: false,
            snapshot: None,
        };
        let mut level0 = vec![];
        let mut leveln = vec![];
        if c.level == 0 {
            // Level-0 inputs overlap: one iterator per file.
            for f in &c.inputs.base {
                level0.push(table_cache.new_iter(
                    self.icmp.clone(),
                    read_options.clone(),
                    f.number,
                    f.file_size,
                )?);
            }
        } else {
            leveln.push(ConcatenateIterator::new(
                LevelFileNumIterator::new(self.icmp.clone(), c.inputs.base.clone()),
                FileIterFactory::new(self.icmp.clone(), read_options.clone(), table_cache.clone()),
            ));
        }
        if !c.inputs.parent.is_empty() {
            leveln.push(ConcatenateIterator::new(
                LevelFileNumIterator::new(self.icmp.clone(), c.inputs.parent.clone()),
                FileIterFactory::new(self.icmp.clone(), read_options, table_cache.clone()),
            ));
        }
        Ok(KMergeIter::new(SSTableIters::new(
            self.icmp.clone(),
            level0,
            leveln,
        )))
    }

    /// Iterators covering every table of the current version, for the
    /// database iterator: one per level-0 file, one lazily opening
    /// iterator per deeper level.
    #[allow(clippy::type_complexity)]
    pub fn current_sst_iters(
        &self,
        read_options: ReadOptions,
        table_cache: &TableCache<S, C>,
    ) -> IResult<(
        Vec<crate::sstable::TableIterator<InternalKeyComparator<C>, S::F>>,
        Vec<ConcatenateIterator<LevelFileNumIterator<C>, FileIterFactory<S, C>>>,
    )> {
        let version = self.current();
        let mut level0 = Vec::with_capacity(version.files[0].len());
        for f in &version.files[0] {
            level0.push(table_cache.new_iter(
                self.icmp.clone(),
                read_options.clone(),
                f.number,
                f.file_size,
            )?);
        }
        let mut leveln = vec![];
        for files in version.files.iter().skip(1) {
            if !files.is_empty() {
                leveln.push(ConcatenateIterator::new(
                    LevelFileNumIterator::new(self.icmp.clone(), files.clone()),
                    FileIterFactory::new(
                        self.icmp.clone(),
                        read_options.clone(),
                        table_cache.clone(),
                    ),
                ));
            }
        }
        Ok((level0, leveln))
    }

    // Writes a snapshot of the current state (comparator, compaction
    // pointers, live files) as the first record of a new manifest.
    fn write_snapshot(&mut self, writer: &mut Writer<S::F>) -> IResult<()> {
        let mut edit = VersionEdit::new();
        edit.set_comparator_name(self.icmp.user_comparator.name().to_owned());
        for (level, key) in self.compaction_pointers.iter().enumerate() {
            if !key.is_empty() {
                edit.set_compact_pointer(level, key.clone());
            }
        }
        let current = self.current();
        for (level, files) in current.files.iter().enumerate() {
            for f in files {
                edit.add_file(level, f.number, f.file_size, f.smallest.clone(), f.largest.clone());
            }
        }
        let mut record = vec![];
        edit.encode_to(&mut record);
        writer.add_record(&record)
    }

    // Keeps the manifest across restarts when permitted and still small
    // enough; otherwise a compacted one will be written.
    fn should_reuse_manifest(&mut self, manifest_path: &str, manifest_len: u64) -> bool {
        if !self.options.reuse_logs {
            return false;
        }
        match parse_filename(Path::new(manifest_path)) {
            Some((FileType::Manifest, number)) => {
                if manifest_len >= self.options.max_file_size {
                    return false;
                }
                match self.storage.open(manifest_path) {
                    Ok(mut file) => {
                        if let Err(e) = file.seek(SeekFrom::End(0)) {
                            error!("cannot position reused manifest: {}", e);
                            return false;
                        }
                        info!(manifest = number, "reusing manifest");
                        self.manifest_writer = Some(Writer::new_with_length(file, manifest_len));
                        self.manifest_file_number = number;
                        true
                    }
                    Err(e) => {
                        error!("cannot reopen manifest for reuse: {}", e);
                        false
                    }
                }
            }
            _ => false,
        }
    }

    // Drops versions nobody references anymore. The newest version is
    // always kept.
    fn gc(&mut self) {
        let last = self.versions.len() - 1;
        let mut index = 0;
        self.versions.retain(|v| {
            let keep = index == last || Arc::strong_count(v) > 1;
            index += 1;
            keep
        });
    }
}

/// Extends `files_to_compact` so that for any user key it touches, every
/// entry of that user key in the level compacts together. Leaving the
/// newest entry of a key behind in the level while older ones sink would
/// let a stale value resurface.
fn add_boundary_inputs<C: Comparator>(
    icmp: &InternalKeyComparator<C>,
    level_files: &[Arc<FileMetaData>],
    files_to_compact: &mut Vec<Arc<FileMetaData>>,
) {
    if files_to_compact.is_empty() {
        return;
    }
    let mut largest = files_to_compact
        .iter()
        .skip(1)
        .fold(files_to_compact[0].largest.clone(), |acc, f| {
            if icmp.compare(f.largest.data(), acc.data()) == CmpOrdering::Greater {
                f.largest.clone()
            } else {
                acc
            }
        });
    while let Some(boundary) = find_smallest_boundary_file(icmp, level_files, &largest) {
        largest = boundary.largest.clone();
        files_to_compact.push(boundary);
    }
}

// The file whose smallest key continues `largest_key`'s user key with an
// older sequence, if any (ordered after it internally).
fn find_smallest_boundary_file<C: Comparator>(
    icmp: &InternalKeyComparator<C>,
    level_files: &[Arc<FileMetaData>],
    largest_key: &InternalKey,
) -> Option<Arc<FileMetaData>> {
    let ucmp = &icmp.user_comparator;
    let mut smallest: Option<&Arc<FileMetaData>> = None;
    for f in level_files {
        if icmp.compare(f.smallest.data(), largest_key.data()) == CmpOrdering::Greater
            && ucmp.compare(f.smallest.user_key(), largest_key.user_key()) == CmpOrdering::Equal
        {
            match smallest {
                Some(current)
                    if icmp.compare(f.smallest.data(), current.smallest.data())
                        != CmpOrdering::Less => {}
                _ => smallest = Some(f),
            }
        }
    }
    smallest.cloned()
}

/// Opens table iterators for a sorted level on demand, from the encoded
/// `(file number, file size)` values of a `LevelFileNumIterator`.
pub struct FileIterFactory<S: Storage + Clone, C: Comparator> {
    icmp: InternalKeyComparator<C>,
    options: ReadOptions,
    table_cache: TableCache<S, C>,
}

impl<S: Storage + Clone, C: Comparator> FileIterFactory<S, C> {
    pub fn new(
        icmp: InternalKeyComparator<C>,
        options: ReadOptions,
        table_cache: TableCache<S, C>,
    ) -> Self {
        FileIterFactory {
            icmp,
            options,
            table_cache,
        }
    }
}

impl<S: Storage + Clone, C: Comparator + 'static> DerivedIterFactory for FileIterFactory<S, C> {
    type Iter = crate::sstable::TableIterator<InternalKeyComparator<C>, S::F>;

    fn derive(&self, value: &[u8]) -> IResult<Self::Iter> {
        let (file_number, file_size) = decode_file_meta_value(value)?;
        self.table_cache.new_iter(
            self.icmp.clone(),
            self.options.clone(),
            file_number,
            file_size,
        )
    }
}

/// The merge source over a set of table iterators: per-file iterators
/// for overlapping level-0 tables, per-level concatenating iterators for
/// the sorted levels.
pub struct SSTableIters<S: Storage + Clone, C: Comparator + 'static> {
    cmp: InternalKeyComparator<C>,
    level0: Vec<crate::sstable::TableIterator<InternalKeyComparator<C>, S::F>>,
    leveln: Vec<ConcatenateIterator<LevelFileNumIterator<C>, FileIterFactory<S, C>>>,
}

impl<S: Storage + Clone, C: Comparator + 'static> SSTableIters<S, C> {
    pub fn new(
        cmp: InternalKeyComparator<C>,
        level0: Vec<crate::sstable::TableIterator<InternalKeyComparator<C>, S::F>>,
        leveln: Vec<ConcatenateIterator<LevelFileNumIterator<C>, FileIterFactory<S, C>>>,
    ) -> Self {
        SSTableIters {
            cmp,
            level0,
            leveln,
        }
    }
}

impl<S: Storage + Clone, C: Comparator + 'static> KMergeCore for SSTableIters<S, C> {
    type Cmp = InternalKeyComparator<C>;

    fn cmp(&self) -> &Self::Cmp {
        &self.cmp
    }

    fn iters_len(&self) -> usize {
        self.level0.len() + self.leveln.len()
    }

    fn find_smallest(&mut self) -> usize {
        let mut smallest: Option<&[u8]> = None;
        let mut index = self.iters_len();
        for (i, child) in self.level0.iter().enumerate() {
            if self.smaller(&mut smallest, child) {
                index = i;
            }
        }
        for (i, child) in self.leveln.iter().enumerate() {
            if self.smaller(&mut smallest, child) {
                index = i + self.level0.len();
            }
        }
        index
    }

    fn find_largest(&mut self) -> usize {
        let mut largest: Option<&[u8]> = None;
        let mut index = self.iters_len();
        for (i, child) in self.level0.iter().enumerate() {
            if self.larger(&mut largest, child) {
                index = i;
            }
        }
        for (i, child) in self.leveln.iter().enumerate() {
            if self.larger(&mut largest, child) {
                index = i + self.level0.len();
            }
        }
        index
    }

    fn get_child(&self, i: usize) -> &dyn Iter {
        if i < self.level0.len() {
            &self.level0[i]
        } else {
            &self.leveln[i - self.level0.len()]
        }
    }

    fn get_child_mut(&mut self, i: usize) -> &mut dyn Iter {
        if i < self.level0.len() {
            &mut self.level0[i]
        } else {
            let i = i - self.level0.len();
            &mut self.leveln[i]
        }
    }

    fn for_each_child<F>(&mut self, mut f: F)
    where
        F: FnMut(&mut dyn Iter),
    {
        for child in self.level0.iter_mut() {
            f(child);
        }
        for child in self.leveln.iter_mut() {
            f(child);
        }
    }

    fn for_not_ith<F>(&mut self, n: usize, mut f: F)
    where
        F: FnMut(&mut dyn Iter, &Self::Cmp),
    {
        for (i, child) in self.level0.iter_mut().enumerate() {
            if i != n {
                f(child, &self.cmp);
            }
        }
        for (i, child) in self.leveln.iter_mut().enumerate() {
            if i + self.level0.len() != n {
                f(child, &self.cmp);
            }
        }
    }

    fn take_err(&mut self) -> IResult<()> {
        for child in self.level0.iter_mut() {
            child.status()?;
        }
        for child in self.leveln.iter_mut() {
            child.status()?;
        }
        Ok(())
    }
}
