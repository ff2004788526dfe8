pub mod version_edit;
pub mod version_set;

use std::cmp::Ordering;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, RwLock};

use crate::db::format::{
    InternalKeyComparator, LookupKey, ParsedInternalKey, ValueType, InternalKey,
    L0_COMPACTION_TRIGGER, MAX_MEM_COMPACT_LEVEL, NUM_LEVELS,
};
use crate::error::{Error, IResult};
use crate::iterator::Iter;
use crate::options::{Options, ReadOptions};
use crate::storage::Storage;
use crate::table_cache::TableCache;
use crate::util::coding::{decode_fixed_64, put_fixed_64};
use crate::util::comparator::Comparator;
use crate::version::version_edit::FileMetaData;

/// Encoded length of a `LevelFileNumIterator` value: fixed64 file number
/// plus fixed64 file size.
pub const FILE_META_LENGTH: usize = 16;

/// Charge-tracking result of a point lookup: the first table consulted,
/// when more than one had to be.
pub struct SeekStats {
    pub seek_file: Option<(usize, Arc<FileMetaData>)>,
}

/// An immutable snapshot of which tables live at which levels. Versions
/// are chained by the `VersionSet`; readers and iterators hold an `Arc`
/// to the version they started from, which keeps its files undeletable.
pub struct Version<C: Comparator> {
    icmp: InternalKeyComparator<C>,
    /// Files per level, ordered by smallest key for levels >= 1. Level-0
    /// files may overlap and are ordered newest-first.
    pub files: Vec<Vec<Arc<FileMetaData>>>,

    /// Level whose byte volume (file count for level 0) most exceeds its
    /// budget, and by what factor. Set by `finalize`.
    pub compaction_score: f64,
    pub compaction_level: usize,

    /// A file that burned through its seek allowance, if any.
    file_to_compact: RwLock<Option<Arc<FileMetaData>>>,
    file_to_compact_level: AtomicUsize,
}

impl<C: Comparator + 'static> Version<C> {
    pub fn new(icmp: InternalKeyComparator<C>) -> Self {
        Version {
            icmp,
            files: (0..NUM_LEVELS).map(|_| vec![]).collect(),
            compaction_score: 0.0,
            compaction_level: 0,
            file_to_compact: RwLock::new(None),
            file_to_compact_level: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn comparator(&self) -> InternalKeyComparator<C> {
        self.icmp.clone()
    }

    #[inline]
    pub fn num_files(&self, level: usize) -> usize {
        self.files[level].len()
    }

    /// Looks `lkey` up in this version's tables, newest layer first.
    /// Besides the result, reports which file should be charged a seek
    /// (the first file consulted whenever a lookup had to touch a second
    /// one).
    pub fn get<S: Storage + Clone>(
        &self,
        options: &ReadOptions,
        lkey: &LookupKey,
        table_cache: &TableCache<S, C>,
    ) -> IResult<(Option<Vec<u8>>, SeekStats)> {
        let ikey = lkey.internal_key();
        let ukey = lkey.user_key();
        let ucmp = &self.icmp.user_comparator;
        let mut stats = SeekStats { seek_file: None };
        let mut last_file_read: Option<(usize, Arc<FileMetaData>)> = None;

        for level in 0..NUM_LEVELS {
            let files = &self.files[level];
            if files.is_empty() {
                continue;
            }
            let candidates: Vec<Arc<FileMetaData>> = if level == 0 {
                // Level-0 files may overlap: every file whose range
                // covers the key must be checked, newest first.
                let mut overlapping: Vec<Arc<FileMetaData>> = files
                    .iter()
                    .filter(|f| {
                        ucmp.compare(ukey, f.smallest.user_key()) != Ordering::Less
                            && ucmp.compare(ukey, f.largest.user_key()) != Ordering::Greater
                    })
                    .cloned()
                    .collect();
                overlapping.sort_by(|a, b| b.number.cmp(&a.number));
                overlapping
            } else {
                let index = find_file(&self.icmp, files, ikey);
                match files.get(index) {
                    Some(f) if ucmp.compare(ukey, f.smallest.user_key()) != Ordering::Less => {
                        vec![f.clone()]
                    }
                    _ => vec![],
                }
            };

            for f in candidates {
                if stats.seek_file.is_none() {
                    if let Some(last) = last_file_read.take() {
                        // Second table touched by this lookup: the first
                        // one wasted a seek.
                        stats.seek_file = Some(last);
                    }
                }
                last_file_read = Some((level, f.clone()));

                let found =
                    table_cache.get(self.icmp.clone(), options, ikey, f.number, f.file_size)?;
                if let Some(block_iter) = found {
                    let parsed = ParsedInternalKey::decode_from(block_iter.key()).ok_or_else(
                        || Error::Corruption("bad internal key in table".to_owned()),
                    )?;
                    if ucmp.compare(parsed.user_key, ukey) == Ordering::Equal {
                        return match parsed.value_type {
                            ValueType::KTypeValue => {
                                Ok((Some(block_iter.value().to_vec()), stats))
                            }
                            ValueType::KTypeDeletion => Ok((None, stats)),
                            ValueType::Unknown => Err(Error::Corruption(
                                "unknown value type in table".to_owned(),
                            )),
                        };
                    }
                }
            }
        }
        Ok((None, stats))
    }

    /// Applies the seek charge recorded by `get`. Returns true when a
    /// file just ran out of its allowance and a compaction should be
    /// scheduled.
    pub fn update_stats(&self, stats: SeekStats) -> bool {
        if let Some((level, f)) = stats.seek_file {
            if f.charge_seek() {
                let mut candidate = self.file_to_compact.write().unwrap();
                if candidate.is_none() {
                    self.file_to_compact_level
                        .store(level, AtomicOrdering::Release);
                    *candidate = Some(f);
                    return true;
                }
            }
        }
        false
    }

    #[inline]
    pub fn file_to_compact(&self) -> Option<Arc<FileMetaData>> {
        self.file_to_compact.read().unwrap().clone()
    }

    #[inline]
    pub fn file_to_compact_level(&self) -> usize {
        self.file_to_compact_level.load(AtomicOrdering::Acquire)
    }

    /// Computes `compaction_score`/`compaction_level`. Called once per
    /// version, right after construction.
    pub fn finalize<UC: Comparator>(&mut self, options: &Options<UC>) {
        let mut best_level = 0;
        let mut best_score = -1.0f64;
        for level in 0..NUM_LEVELS - 1 {
            let score = if level == 0 {
                // File count, not bytes: every level-0 file is consulted
                // by every read in its range, and a small write buffer
                // would otherwise cause compaction storms.
                self.files[0].len() as f64 / L0_COMPACTION_TRIGGER as f64
            } else {
                total_file_size(&self.files[level]) as f64 / options.max_bytes_for_level(level)
            };
            if score > best_score {
                best_score = score;
                best_level = level;
            }
        }
        self.compaction_level = best_level;
        self.compaction_score = best_score;
    }

    /// Whether any file in `level` overlaps `[smallest_ukey, largest_ukey]`
    /// (either bound may be unbounded).
    pub fn overlap_in_level(
        &self,
        level: usize,
        smallest_ukey: Option<&[u8]>,
        largest_ukey: Option<&[u8]>,
    ) -> bool {
        some_file_overlaps_range(
            &self.icmp,
            level > 0,
            &self.files[level],
            smallest_ukey,
            largest_ukey,
        )
    }

    /// Picks the level a flushed memtable covering
    /// `[smallest_ukey, largest_ukey]` should land in. Level 0 when it
    /// overlaps level 0; otherwise it may be pushed down up to
    /// `MAX_MEM_COMPACT_LEVEL` while no overlap exists and the
    /// grandparent overlap stays small.
    pub fn pick_level_for_memtable_output<UC: Comparator>(
        &self,
        options: &Options<UC>,
        smallest_ukey: &[u8],
        largest_ukey: &[u8],
    ) -> usize {
        let mut level = 0;
        if self.overlap_in_level(0, Some(smallest_ukey), Some(largest_ukey)) {
            return level;
        }
        let start = InternalKey::new(
            smallest_ukey,
            crate::db::format::MAX_SEQUENCE_NUMBER,
            crate::db::format::VALUE_TYPE_FOR_SEEK,
        );
        let limit = InternalKey::new(largest_ukey, 0, ValueType::KTypeDeletion);
        while level < MAX_MEM_COMPACT_LEVEL {
            if self.overlap_in_level(level + 1, Some(smallest_ukey), Some(largest_ukey)) {
                break;
            }
            if level + 2 < NUM_LEVELS {
                let overlaps =
                    self.get_overlapping_inputs(level + 2, Some(&start), Some(&limit));
                if total_file_size(&overlaps) > options.max_grandparent_overlap_bytes() {
                    break;
                }
            }
            level += 1;
        }
        level
    }

    /// All files in `level` whose key range intersects
    /// `[begin, end]` (unbounded when `None`). For level 0 the search
    /// restarts with a widened range whenever an overlapping file
    /// extends it, because level-0 files overlap each other.
    pub fn get_overlapping_inputs(
        &self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Vec<Arc<FileMetaData>> {
        let ucmp = &self.icmp.user_comparator;
        let mut begin_ukey = begin.map(|k| k.user_key().to_vec());
        let mut end_ukey = end.map(|k| k.user_key().to_vec());
        let mut inputs: Vec<Arc<FileMetaData>> = vec![];
        let mut i = 0;
        while i < self.files[level].len() {
            let f = self.files[level][i].clone();
            i += 1;
            let file_start = f.smallest.user_key();
            let file_limit = f.largest.user_key();
            if begin_ukey
                .as_ref()
                .map_or(false, |b| ucmp.compare(file_limit, b) == Ordering::Less)
            {
                continue; // entirely before the range
            }
            if end_ukey
                .as_ref()
                .map_or(false, |e| ucmp.compare(file_start, e) == Ordering::Greater)
            {
                continue; // entirely after the range
            }
            if level == 0 {
                // The file may drag the range wider; restart so earlier
                // files are re-examined against the new bounds.
                let mut restart = false;
                if let Some(b) = begin_ukey.as_ref() {
                    if ucmp.compare(file_start, b) == Ordering::Less {
                        begin_ukey = Some(file_start.to_vec());
                        restart = true;
                    }
                }
                if let Some(e) = end_ukey.as_ref() {
                    if ucmp.compare(file_limit, e) == Ordering::Greater {
                        end_ukey = Some(file_limit.to_vec());
                        restart = true;
                    }
                }
                if restart {
                    inputs.clear();
                    i = 0;
                    continue;
                }
            }
            inputs.push(f);
        }
        inputs
    }

    /// An approximate byte offset into the version's total data at which
    /// `ikey` would reside.
    pub fn approximate_offset_of<S: Storage + Clone>(
        &self,
        ikey: &InternalKey,
        table_cache: &TableCache<S, C>,
    ) -> u64 {
        let mut result = 0u64;
        for (level, files) in self.files.iter().enumerate() {
            for f in files {
                if self.icmp.compare(f.largest.data(), ikey.data()) != Ordering::Greater {
                    // Entirely before `ikey`.
                    result += f.file_size;
                } else if self.icmp.compare(f.smallest.data(), ikey.data()) == Ordering::Greater {
                    // Entirely after. Deeper files in a sorted level are
                    // farther still.
                    if level > 0 {
                        break;
                    }
                } else if let Ok(table) = table_cache.find_table(f.number, f.file_size) {
                    result += table.approximate_offset_of(self.icmp.clone(), ikey.data());
                }
            }
        }
        result
    }

    /// A one-line rendering of the per-level file counts.
    pub fn level_summary(&self) -> String {
        let counts: Vec<String> = self
            .files
            .iter()
            .map(|files| files.len().to_string())
            .collect();
        format!("files[ {} ]", counts.join(" "))
    }
}

/// Total size in bytes of `files`.
#[inline]
pub fn total_file_size(files: &[Arc<FileMetaData>]) -> u64 {
    files.iter().map(|f| f.file_size).sum()
}

/// Binary-searches `files` (sorted, disjoint) for the first file whose
/// largest key is >= `ikey`. Returns `files.len()` when every file ends
/// before `ikey`.
pub fn find_file<C: Comparator>(
    icmp: &InternalKeyComparator<C>,
    files: &[Arc<FileMetaData>],
    ikey: &[u8],
) -> usize {
    let mut left = 0usize;
    let mut right = files.len();
    while left < right {
        let mid = (left + right) / 2;
        if icmp.compare(files[mid].largest.data(), ikey) == Ordering::Less {
            left = mid + 1;
        } else {
            right = mid;
        }
    }
    left
}

fn key_is_after_file<C: Comparator>(
    ucmp: &C,
    user_key: Option<&[u8]>,
    f: &FileMetaData,
) -> bool {
    user_key.map_or(false, |k| {
        ucmp.compare(k, f.largest.user_key()) == Ordering::Greater
    })
}

fn key_is_before_file<C: Comparator>(
    ucmp: &C,
    user_key: Option<&[u8]>,
    f: &FileMetaData,
) -> bool {
    user_key.map_or(false, |k| {
        ucmp.compare(k, f.smallest.user_key()) == Ordering::Less
    })
}

/// Whether any file overlaps `[smallest_ukey, largest_ukey]`.
/// `disjoint_sorted` enables the binary-search fast path valid for
/// levels >= 1.
pub fn some_file_overlaps_range<C: Comparator>(
    icmp: &InternalKeyComparator<C>,
    disjoint_sorted: bool,
    files: &[Arc<FileMetaData>],
    smallest_ukey: Option<&[u8]>,
    largest_ukey: Option<&[u8]>,
) -> bool {
    let ucmp = &icmp.user_comparator;
    if !disjoint_sorted {
        return files.iter().any(|f| {
            !key_is_after_file(ucmp, smallest_ukey, f)
                && !key_is_before_file(ucmp, largest_ukey, f)
        });
    }
    let index = match smallest_ukey {
        Some(ukey) => {
            let small = LookupKey::new(ukey, crate::db::format::MAX_SEQUENCE_NUMBER);
            find_file(icmp, files, small.internal_key())
        }
        None => 0,
    };
    index < files.len() && !key_is_before_file(ucmp, largest_ukey, &files[index])
}

/// Index iterator over the files of one sorted level: yields
/// `largest key -> {fixed64 file number, fixed64 file size}` so a
/// `ConcatenateIterator` can open tables lazily.
pub struct LevelFileNumIterator<C: Comparator> {
    icmp: InternalKeyComparator<C>,
    files: Vec<Arc<FileMetaData>>,
    index: usize,
    value_buf: Vec<u8>,
}

impl<C: Comparator> LevelFileNumIterator<C> {
    pub fn new(icmp: InternalKeyComparator<C>, files: Vec<Arc<FileMetaData>>) -> Self {
        let index = files.len();
        LevelFileNumIterator {
            icmp,
            files,
            index,
            value_buf: vec![],
        }
    }

    fn fill_value(&mut self) {
        if self.index < self.files.len() {
            let f = &self.files[self.index];
            self.value_buf.clear();
            put_fixed_64(&mut self.value_buf, f.number);
            put_fixed_64(&mut self.value_buf, f.file_size);
        }
    }
}

impl<C: Comparator> Iter for LevelFileNumIterator<C> {
    fn valid(&self) -> bool {
        self.index < self.files.len()
    }

    fn seek_to_first(&mut self) {
        self.index = 0;
        self.fill_value();
    }

    fn seek_to_last(&mut self) {
        self.index = self.files.len().saturating_sub(1);
        self.fill_value();
    }

    fn seek(&mut self, target: &[u8]) {
        self.index = find_file(&self.icmp, &self.files, target);
        self.fill_value();
    }

    fn next(&mut self) {
        assert!(self.valid());
        self.index += 1;
        self.fill_value();
    }

    fn prev(&mut self) {
        assert!(self.valid());
        if self.index == 0 {
            self.index = self.files.len();
            return;
        }
        self.index -= 1;
        self.fill_value();
    }

    fn key(&self) -> &[u8] {
        assert!(self.valid());
        self.files[self.index].largest.data()
    }

    fn value(&self) -> &[u8] {
        assert!(self.valid());
        &self.value_buf
    }

    fn status(&mut self) -> IResult<()> {
        Ok(())
    }
}

/// Decodes a `LevelFileNumIterator` value.
pub fn decode_file_meta_value(value: &[u8]) -> IResult<(u64, u64)> {
    if value.len() != FILE_META_LENGTH {
        return Err(Error::Corruption(
            "file metadata value of unexpected length".to_owned(),
        ));
    }
    Ok((decode_fixed_64(value), decode_fixed_64(&value[8..])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::comparator::BytewiseComparator;

    fn icmp() -> InternalKeyComparator<BytewiseComparator> {
        InternalKeyComparator::new(BytewiseComparator)
    }

    fn file(number: u64, smallest: &str, largest: &str) -> Arc<FileMetaData> {
        Arc::new(FileMetaData::new(
            number,
            0,
            InternalKey::new(smallest.as_bytes(), 100, ValueType::KTypeValue),
            InternalKey::new(largest.as_bytes(), 100, ValueType::KTypeValue),
        ))
    }

    fn seek_key(ukey: &str) -> Vec<u8> {
        InternalKey::new(
            ukey.as_bytes(),
            crate::db::format::MAX_SEQUENCE_NUMBER,
            crate::db::format::VALUE_TYPE_FOR_SEEK,
        )
        .data()
        .to_vec()
    }

    #[test]
    fn test_find_file_empty() {
        assert_eq!(find_file(&icmp(), &[], &seek_key("foo")), 0);
    }

    #[test]
    fn test_find_file_single() {
        let files = vec![file(1, "p", "q")];
        let cases = [("a", 0), ("p", 0), ("p1", 0), ("q", 0), ("q1", 1), ("z", 1)];
        for (key, want) in cases {
            assert_eq!(find_file(&icmp(), &files, &seek_key(key)), want, "{}", key);
        }
    }

    #[test]
    fn test_find_file_multiple() {
        let files = vec![
            file(1, "150", "200"),
            file(2, "200", "250"),
            file(3, "300", "350"),
            file(4, "400", "450"),
        ];
        let cases = [
            ("100", 0),
            ("150", 0),
            ("201", 1),
            ("251", 2),
            ("301", 2),
            ("350", 2),
            ("351", 3),
            ("451", 4),
        ];
        for (key, want) in cases {
            assert_eq!(find_file(&icmp(), &files, &seek_key(key)), want, "{}", key);
        }
    }

    #[test]
    fn test_overlap_disjoint_level() {
        let files = vec![file(1, "150", "200"), file(2, "300", "350")];
        let overlap = |a: Option<&str>, b: Option<&str>| {
            some_file_overlaps_range(
                &icmp(),
                true,
                &files,
                a.map(|s| s.as_bytes()),
                b.map(|s| s.as_bytes()),
            )
        };
        assert!(!overlap(Some("100"), Some("149")));
        assert!(!overlap(Some("201"), Some("299")));
        assert!(!overlap(Some("351"), Some("450")));
        assert!(overlap(Some("100"), Some("150")));
        assert!(overlap(Some("200"), Some("200")));
        assert!(overlap(Some("190"), Some("310")));
        assert!(overlap(None, Some("150")));
        assert!(overlap(Some("350"), None));
        assert!(overlap(None, None));
        assert!(!overlap(None, Some("149")));
        assert!(!overlap(Some("351"), None));
    }

    #[test]
    fn test_overlap_overlapping_level_zero() {
        let files = vec![file(1, "150", "600"), file(2, "400", "500")];
        let overlap = |a: Option<&str>, b: Option<&str>| {
            some_file_overlaps_range(
                &icmp(),
                false,
                &files,
                a.map(|s| s.as_bytes()),
                b.map(|s| s.as_bytes()),
            )
        };
        assert!(!overlap(Some("100"), Some("149")));
        assert!(!overlap(Some("601"), Some("700")));
        assert!(overlap(Some("100"), Some("150")));
        assert!(overlap(Some("450"), Some("700")));
        assert!(overlap(Some("450"), Some("470")));
    }

    fn version_with(
        level_files: Vec<(usize, Vec<Arc<FileMetaData>>)>,
    ) -> Version<BytewiseComparator> {
        let mut v = Version::new(icmp());
        for (level, files) in level_files {
            v.files[level] = files;
        }
        v
    }

    #[test]
    fn test_get_overlapping_inputs_level0_expands() {
        // Overlapping level-0 files: starting from [400, 500] must pull
        // in the wide file and then re-admit everything it touches.
        let v = version_with(vec![(
            0,
            vec![file(1, "000", "100"), file(2, "150", "600"), file(3, "400", "500")],
        )]);
        let begin = InternalKey::new(b"400", 100, ValueType::KTypeValue);
        let end = InternalKey::new(b"500", 100, ValueType::KTypeValue);
        let inputs = v.get_overlapping_inputs(0, Some(&begin), Some(&end));
        let numbers: Vec<u64> = inputs.iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![2, 3]);
    }

    #[test]
    fn test_get_overlapping_inputs_sorted_level() {
        let v = version_with(vec![(
            2,
            vec![file(1, "100", "200"), file(2, "300", "400"), file(3, "500", "600")],
        )]);
        let begin = InternalKey::new(b"250", 100, ValueType::KTypeValue);
        let end = InternalKey::new(b"550", 100, ValueType::KTypeValue);
        let inputs = v.get_overlapping_inputs(2, Some(&begin), Some(&end));
        let numbers: Vec<u64> = inputs.iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![2, 3]);
        assert_eq!(v.get_overlapping_inputs(2, None, None).len(), 3);
    }

    #[test]
    fn test_finalize_scores_level0_by_count() {
        let options = Options::<BytewiseComparator>::default();
        let mut v = version_with(vec![(0, vec![file(1, "a", "b"), file(2, "c", "d")])]);
        v.finalize(&options);
        assert_eq!(v.compaction_level, 0);
        assert!((v.compaction_score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_finalize_scores_deeper_levels_by_bytes() {
        let options = Options::<BytewiseComparator>::default();
        let big = Arc::new(FileMetaData::new(
            9,
            25 << 20, // 2.5x the 10MiB level-1 budget
            InternalKey::new(b"a", 1, ValueType::KTypeValue),
            InternalKey::new(b"b", 1, ValueType::KTypeValue),
        ));
        let mut v = version_with(vec![(1, vec![big])]);
        v.finalize(&options);
        assert_eq!(v.compaction_level, 1);
        assert!(v.compaction_score > 2.0);
    }

    #[test]
    fn test_pick_level_for_memtable_output() {
        let options = Options::<BytewiseComparator>::default();
        // Nothing anywhere: a flush may sink to MAX_MEM_COMPACT_LEVEL.
        let v = version_with(vec![]);
        assert_eq!(
            v.pick_level_for_memtable_output(&options, b"a", b"b"),
            MAX_MEM_COMPACT_LEVEL
        );
        // Overlap with level 0 pins the flush at level 0.
        let v = version_with(vec![(0, vec![file(1, "a", "c")])]);
        assert_eq!(v.pick_level_for_memtable_output(&options, b"b", b"d"), 0);
        // Overlap at level 1 stops the descent there.
        let v = version_with(vec![(1, vec![file(1, "a", "c")])]);
        assert_eq!(v.pick_level_for_memtable_output(&options, b"b", b"d"), 0);
        // Disjoint from level 1, overlapping level 2: lands at 1.
        let v = version_with(vec![(2, vec![file(1, "a", "c")])]);
        assert_eq!(v.pick_level_for_memtable_output(&options, b"b", b"d"), 1);
    }

    #[test]
    fn test_level_file_num_iterator() {
        let files = vec![
            file(7, "150", "200"),
            file(8, "300", "350"),
            file(9, "500", "600"),
        ];
        let mut iter = LevelFileNumIterator::new(icmp(), files);
        assert!(!iter.valid());
        iter.seek_to_first();
        assert!(iter.valid());
        assert_eq!(decode_file_meta_value(iter.value()).unwrap().0, 7);
        iter.next();
        assert_eq!(decode_file_meta_value(iter.value()).unwrap().0, 8);
        iter.seek(&seek_key("400"));
        assert_eq!(decode_file_meta_value(iter.value()).unwrap().0, 9);
        iter.seek(&seek_key("700"));
        assert!(!iter.valid());
        iter.seek_to_last();
        assert_eq!(decode_file_meta_value(iter.value()).unwrap().0, 9);
        iter.prev();
        assert_eq!(decode_file_meta_value(iter.value()).unwrap().0, 8);
        iter.prev();
        iter.prev();
        assert!(!iter.valid());
    }
}
