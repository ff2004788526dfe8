pub mod filename;
pub mod format;
pub mod iterator;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::batch::WriteBatch;
use crate::compaction::{Compaction, CompactionState};
use crate::db::filename::{
    generate_filename, parse_filename, update_current, FileType,
};
use crate::db::format::{
    InternalKey, InternalKeyComparator, LookupKey, ParsedInternalKey, ValueType,
    L0_SLOWDOWN_WRITES_TRIGGER, L0_STOP_WRITES_TRIGGER, MAX_SEQUENCE_NUMBER, NUM_LEVELS,
    VALUE_TYPE_FOR_SEEK,
};
use crate::db::iterator::{DBIterator, DBIteratorCore};
use crate::error::{Error, IResult};
use crate::iterator::{Iter, KMergeIter};
use crate::mem::MemTable;
use crate::options::{Options, ReadOptions, WriteOptions};
use crate::snapshot::Snapshot;
use crate::sstable::TableBuilder;
use crate::storage::{File, Storage};
use crate::table_cache::TableCache;
use crate::util::comparator::Comparator;
use crate::util::reporter::LogReporter;
use crate::version::version_edit::{FileMetaData, VersionEdit};
use crate::version::version_set::VersionSet;
use crate::version::Version;
use crate::wal::reader::{Reader, Reporter};
use crate::wal::writer::Writer;

/// Writer groups are capped at 1 MiB, and at a smaller bonus when the
/// head batch is tiny, so small writes keep low latency.
const MAX_GROUP_SIZE: usize = 1 << 20;
const SMALL_GROUP_HEAD: usize = 128 << 10;

/// The iterator type returned by `SiltDB::iter`.
pub type SiltDBIterator<S, C> = DBIterator<KMergeIter<DBIteratorCore<S, C>>, C>;

/// An embedded, ordered key/value store over a single directory: WAL +
/// memtables in front of a leveled tree of immutable sorted tables, with
/// one background thread compacting.
///
/// The handle is internally synchronized. Dropping it (or calling
/// `close`) stops the background threads; un-flushed writes stay
/// recoverable through the WAL.
pub struct SiltDB<S: Storage + Clone + 'static, C: Comparator + 'static> {
    inner: Arc<DBImpl<S, C>>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl<S: Storage + Clone + 'static, C: Comparator + 'static> SiltDB<S, C> {
    /// Opens (or, with `create_if_missing`, creates) the database in
    /// `db_path`.
    pub fn open(db_path: &str, options: Options<C>, storage: S) -> IResult<Self> {
        let inner = Arc::new(DBImpl::new(db_path.to_owned(), options, storage)?);
        inner.recover_or_initialize()?;
        inner.delete_obsolete_files();

        let mut handles = vec![];
        {
            let db = inner.clone();
            handles.push(
                thread::Builder::new()
                    .name("silt-write".to_owned())
                    .spawn(move || db.process_batches())
                    .expect("spawning the write thread"),
            );
        }
        {
            let db = inner.clone();
            handles.push(
                thread::Builder::new()
                    .name("silt-compact".to_owned())
                    .spawn(move || db.compaction_loop())
                    .expect("spawning the compaction thread"),
            );
        }
        inner.maybe_schedule_compaction();
        Ok(SiltDB {
            inner,
            handles: Mutex::new(handles),
        })
    }

    /// Stores `key -> value`.
    pub fn put(&self, options: WriteOptions, key: &[u8], value: &[u8]) -> IResult<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(options, batch)
    }

    /// Erases `key` if present.
    pub fn delete(&self, options: WriteOptions, key: &[u8]) -> IResult<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(options, batch)
    }

    /// Applies `batch` atomically.
    pub fn write(&self, options: WriteOptions, batch: WriteBatch) -> IResult<()> {
        self.inner.schedule_batch_and_wait(options, batch, false)
    }

    /// Reads the newest value of `key` visible at the read snapshot.
    pub fn get(&self, options: ReadOptions, key: &[u8]) -> IResult<Option<Vec<u8>>> {
        self.inner.get(options, key)
    }

    /// An iterator over the live state (or the snapshot in `options`).
    pub fn iter(&self, options: ReadOptions) -> IResult<SiltDBIterator<S, C>> {
        self.inner.new_iterator(options)
    }

    /// Pins the current state for repeatable reads.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.versions.lock().unwrap().new_snapshot()
    }

    /// Releases `snapshot`; its sequence stops holding back compaction
    /// garbage collection.
    pub fn release_snapshot(&self, snapshot: Arc<Snapshot>) {
        self.inner
            .versions
            .lock()
            .unwrap()
            .snapshots
            .release(snapshot);
    }

    /// Database introspection; see the crate docs for the property
    /// names.
    pub fn get_property(&self, name: &str) -> Option<String> {
        self.inner.get_property(name)
    }

    /// For each `[start, limit)` range, the approximate bytes of table
    /// data it covers.
    pub fn get_approximate_sizes(&self, ranges: &[(&[u8], &[u8])]) -> Vec<u64> {
        self.inner.get_approximate_sizes(ranges)
    }

    /// Compacts everything overlapping `[begin, end]` (both unbounded
    /// when `None`) down the tree. Blocks until done.
    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> IResult<()> {
        self.inner.compact_range(begin, end)
    }

    /// Prevents new compactions from being scheduled. A compaction
    /// already running completes normally.
    pub fn suspend_compaction(&self) {
        self.inner.compaction_suspended.store(true, Ordering::Release);
    }

    pub fn resume_compaction(&self) {
        self.inner
            .compaction_suspended
            .store(false, Ordering::Release);
        self.inner.maybe_schedule_compaction();
    }

    /// Stops background work and releases the directory lock. The
    /// handle is unusable afterwards.
    pub fn close(&self) -> IResult<()> {
        if self.inner.is_shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Unblock a writer stalled on backpressure and the write thread.
        self.inner.background_work_finished_signal.notify_all();
        {
            let mut queue = self.inner.batch_queue.lock().unwrap();
            queue.push_back(BatchTask::stop());
            self.inner.process_batch_sem.notify_all();
        }
        let _ = self.inner.do_compaction.0.send(());
        for handle in self.handles.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
        // Background threads are gone; sync the WAL tail so only a
        // machine crash can lose acknowledged non-sync writes.
        if let Some(wal) = self.inner.wal.lock().unwrap().as_mut() {
            let _ = wal.writer.flush();
        }
        if let Some(lock_file) = self.inner.db_lock.lock().unwrap().take() {
            lock_file.unlock()?;
        }
        info!(path = %self.inner.db_path, "database closed");
        Ok(())
    }
}

impl<S: Storage + Clone + 'static, C: Comparator + 'static> Drop for SiltDB<S, C> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("close on drop failed: {}", e);
        }
    }
}

struct WalState<F: crate::storage::File> {
    writer: Writer<F>,
    log_number: u64,
}

struct BatchTask {
    stop_process: bool,
    /// An empty task that only forces a memtable rotation (used by
    /// `compact_range`).
    force_rotate: bool,
    batch: WriteBatch,
    options: WriteOptions,
    signal: Sender<IResult<()>>,
}

impl BatchTask {
    fn new(batch: WriteBatch, options: WriteOptions, signal: Sender<IResult<()>>) -> Self {
        BatchTask {
            stop_process: false,
            force_rotate: false,
            batch,
            options,
            signal,
        }
    }

    fn stop() -> Self {
        let (signal, _) = crossbeam_channel::bounded(1);
        BatchTask {
            stop_process: true,
            force_rotate: false,
            batch: WriteBatch::new(),
            options: WriteOptions::default(),
            signal,
        }
    }
}

/// A manual compaction request handed to the background worker.
struct ManualCompaction {
    level: usize,
    done: bool,
    begin: Option<InternalKey>,
    end: Option<InternalKey>,
}

pub struct DBImpl<S: Storage + Clone + 'static, C: Comparator + 'static> {
    options: Options<C>,
    icmp: InternalKeyComparator<C>,
    env: S,
    db_path: String,
    db_lock: Mutex<Option<S::F>>,
    table_cache: TableCache<S, C>,

    /// The version set owns all metadata: versions, counters, snapshots,
    /// pending outputs, and the manifest writer.
    versions: Mutex<VersionSet<S, C>>,
    /// Paired with `versions`; signaled whenever background work
    /// finishes something a foreground thread may be waiting on.
    background_work_finished_signal: Condvar,

    mem: RwLock<Arc<MemTable<C>>>,
    imm: RwLock<Option<Arc<MemTable<C>>>>,
    wal: Mutex<Option<WalState<S::F>>>,

    batch_queue: Mutex<VecDeque<BatchTask>>,
    process_batch_sem: Condvar,

    do_compaction: (Sender<()>, Receiver<()>),
    background_compaction_scheduled: AtomicBool,
    manual_compaction: Mutex<Option<Arc<Mutex<ManualCompaction>>>>,
    compaction_suspended: AtomicBool,
    is_shutting_down: AtomicBool,

    /// A WAL-state error: the log and memtable may disagree, so every
    /// later write fails with this.
    poison: RwLock<Option<Error>>,
    /// A background compaction error: logged, surfaced to writers that
    /// need a rotation, retried on the next trigger.
    bg_error: RwLock<Option<Error>>,
}

impl<S: Storage + Clone + 'static, C: Comparator + 'static> DBImpl<S, C> {
    fn new(db_path: String, options: Options<C>, storage: S) -> IResult<Self> {
        let icmp = InternalKeyComparator::new(options.comparator.clone());
        storage.mkdir_all(&db_path)?;
        // LOCK excludes other processes for the directory's lifetime,
        // not just during open.
        let lock_path = generate_filename(&db_path, FileType::Lock, 0);
        let lock_file = if storage.exists(&lock_path) {
            storage.open(&lock_path)?
        } else {
            storage.create(&lock_path)?
        };
        lock_file.lock()?;

        let table_cache = TableCache::new(db_path.clone(), options.clone(), storage.clone());
        let versions = VersionSet::new(db_path.clone(), options.clone(), storage.clone());
        Ok(DBImpl {
            icmp: icmp.clone(),
            env: storage,
            db_path,
            db_lock: Mutex::new(Some(lock_file)),
            table_cache,
            versions: Mutex::new(versions),
            background_work_finished_signal: Condvar::new(),
            mem: RwLock::new(Arc::new(MemTable::new(icmp))),
            imm: RwLock::new(None),
            wal: Mutex::new(None),
            batch_queue: Mutex::new(VecDeque::new()),
            process_batch_sem: Condvar::new(),
            do_compaction: crossbeam_channel::unbounded(),
            background_compaction_scheduled: AtomicBool::new(false),
            manual_compaction: Mutex::new(None),
            compaction_suspended: AtomicBool::new(false),
            is_shutting_down: AtomicBool::new(false),
            poison: RwLock::new(None),
            bg_error: RwLock::new(None),
            options,
        })
    }

    // RECOVERY //

    fn recover_or_initialize(&self) -> IResult<()> {
        let current_path = generate_filename(&self.db_path, FileType::Current, 0);
        if !self.env.exists(&current_path) {
            if !self.options.create_if_missing {
                return Err(Error::InvalidArgument(format!(
                    "database {} does not exist (create_if_missing is false)",
                    self.db_path
                )));
            }
            self.initialize_db()?;
        } else if self.options.error_if_exists {
            return Err(Error::InvalidArgument(format!(
                "database {} already exists (error_if_exists is true)",
                self.db_path
            )));
        }

        let mut edit = VersionEdit::new();
        let mut save_manifest = {
            let mut versions = self.versions.lock().unwrap();
            versions.recover()?
        };

        // Find WAL files to replay: everything at or after the
        // manifest's log number (plus the legacy prev log).
        let (min_log, prev_log, mut expected) = {
            let versions = self.versions.lock().unwrap();
            (
                versions.log_number(),
                versions.prev_log_number(),
                versions.live_files(),
            )
        };
        let mut log_numbers = vec![];
        for path in self.env.list(&self.db_path)? {
            if let Some((file_type, number)) = parse_filename(&path) {
                expected.remove(&number);
                if file_type == FileType::Log && (number >= min_log || number == prev_log) {
                    log_numbers.push(number);
                }
            }
        }
        if !expected.is_empty() {
            let mut missing: Vec<u64> = expected.into_iter().collect();
            missing.sort_unstable();
            return Err(Error::Corruption(format!(
                "{} missing table files, e.g. {:06}.ldb",
                missing.len(),
                missing[0]
            )));
        }

        log_numbers.sort_unstable();
        let mut max_sequence = 0;
        for (i, &number) in log_numbers.iter().enumerate() {
            let is_last = i == log_numbers.len() - 1;
            let (flushed, log_max_seq) = self.replay_log_file(number, is_last, &mut edit)?;
            save_manifest |= flushed;
            max_sequence = max_sequence.max(log_max_seq);
            self.versions.lock().unwrap().mark_file_number_used(number);
        }
        {
            let mut versions = self.versions.lock().unwrap();
            if versions.last_sequence() < max_sequence {
                versions.set_last_sequence(max_sequence);
            }
        }

        // If the previous WAL was not adopted wholesale, start a new one.
        if self.wal.lock().unwrap().is_none() {
            let log_number = self.versions.lock().unwrap().new_file_number();
            let file = self
                .env
                .create(generate_filename(&self.db_path, FileType::Log, log_number))?;
            *self.wal.lock().unwrap() = Some(WalState {
                writer: Writer::new(file),
                log_number,
            });
            edit.set_log_number(log_number);
            save_manifest = true;
        }

        if save_manifest {
            edit.set_prev_log_number(0);
            if edit.log_number.is_none() {
                let log_number = self.wal.lock().unwrap().as_ref().unwrap().log_number;
                edit.set_log_number(log_number);
            }
            self.versions.lock().unwrap().log_and_apply(edit)?;
        }
        Ok(())
    }

    /// Creates the manifest and CURRENT of a brand-new database.
    fn initialize_db(&self) -> IResult<()> {
        let mut edit = VersionEdit::new();
        edit.set_comparator_name(self.options.comparator.name().to_owned());
        edit.set_log_number(0);
        edit.set_next_file_number(2);
        edit.set_last_sequence(0);
        let manifest_path = generate_filename(&self.db_path, FileType::Manifest, 1);
        let file = self.env.create(&manifest_path)?;
        let mut writer = Writer::new(file);
        let mut record = vec![];
        edit.encode_to(&mut record);
        let result = writer
            .add_record(&record)
            .and_then(|()| writer.sync())
            .and_then(|()| update_current(&self.env, &self.db_path, 1));
        if result.is_err() {
            let _ = self.env.remove(&manifest_path);
        }
        result
    }

    /// Replays one WAL into a fresh memtable, flushing level-0 tables
    /// whenever it fills. Returns whether any table was flushed and the
    /// largest sequence seen. With `reuse_logs`, a cleanly replayed
    /// final log is adopted as the live WAL together with its memtable.
    fn replay_log_file(
        &self,
        log_number: u64,
        is_last: bool,
        edit: &mut VersionEdit,
    ) -> IResult<(bool, u64)> {
        struct CountingReporter {
            paranoid: LogReporter,
            paranoid_mode: bool,
            dropped: u64,
        }
        impl Reporter for CountingReporter {
            fn corruption(&mut self, bytes: u64, reason: &str) {
                self.dropped += bytes;
                warn!(bytes, reason, "corrupted WAL region");
                if self.paranoid_mode {
                    self.paranoid.corruption(bytes, reason);
                }
            }
        }

        let path = generate_filename(&self.db_path, FileType::Log, log_number);
        let file = self.env.open(&path)?;
        info!(log = log_number, "replaying WAL");
        let reporter = LogReporter::new();
        let counting = CountingReporter {
            paranoid: reporter.clone(),
            paranoid_mode: self.options.paranoid_checks,
            dropped: 0,
        };
        let mut reader = Reader::new(file, Some(Box::new(counting)), true, 0);

        let mut mem = MemTable::new(self.icmp.clone());
        let mut record = vec![];
        let mut batch = WriteBatch::new();
        let mut max_sequence = 0u64;
        let mut flushed = false;
        let mut compactions = 0;
        while reader.read_record(&mut record) {
            reporter.result()?;
            if record.len() < crate::batch::BATCH_HEADER_SIZE {
                if self.options.paranoid_checks {
                    return Err(Error::Corruption("log record too small".to_owned()));
                }
                warn!(log = log_number, "skipping undersized log record");
                continue;
            }
            batch.set_contents(&record)?;
            let insert = batch.insert_into(&mem);
            if let Err(e) = insert {
                if self.options.paranoid_checks {
                    return Err(e);
                }
                warn!(log = log_number, "ignoring corrupted batch: {}", e);
                continue;
            }
            max_sequence = max_sequence.max(batch.sequence() + u64::from(batch.count()) - 1);
            if mem.approximate_memory_usage() > self.options.write_buffer_size {
                compactions += 1;
                flushed = true;
                self.write_level0_table(&mem, edit, None)?;
                mem = MemTable::new(self.icmp.clone());
            }
        }
        reporter.result()?;

        if self.options.reuse_logs && is_last && compactions == 0 {
            let mut file = reader.into_file();
            let length = file.len()?;
            file.seek(std::io::SeekFrom::End(0))?;
            info!(log = log_number, "reusing WAL");
            *self.wal.lock().unwrap() = Some(WalState {
                writer: Writer::new_with_length(file, length),
                log_number,
            });
            *self.mem.write().unwrap() = Arc::new(mem);
        } else if !mem.is_empty() {
            flushed = true;
            self.write_level0_table(&mem, edit, None)?;
        }
        Ok((flushed, max_sequence))
    }

    // WRITE PATH //

    fn schedule_batch_and_wait(
        &self,
        options: WriteOptions,
        batch: WriteBatch,
        force_rotate: bool,
    ) -> IResult<()> {
        if self.is_shutting_down.load(Ordering::Acquire) {
            return Err(Error::DBClosed);
        }
        if let Some(e) = self.poison.read().unwrap().as_ref() {
            return Err(e.clone());
        }
        if !force_rotate {
            if batch.is_empty() {
                return Ok(());
            }
            if batch.approximate_size() > self.options.write_buffer_size {
                return Err(Error::InvalidArgument(format!(
                    "batch of {} bytes exceeds the write buffer size",
                    batch.approximate_size()
                )));
            }
        }
        let (tx, rx) = crossbeam_channel::bounded(1);
        let mut task = BatchTask::new(batch, options, tx);
        task.force_rotate = force_rotate;
        {
            let mut queue = self.batch_queue.lock().unwrap();
            queue.push_back(task);
            self.process_batch_sem.notify_all();
        }
        rx.recv().map_err(|_| Error::DBClosed)?
    }

    /// Body of the write thread: pops the queue, groups compatible
    /// writers, commits the group, answers everyone in it.
    fn process_batches(&self) {
        loop {
            let tasks = {
                let mut queue = self.batch_queue.lock().unwrap();
                while queue.is_empty() {
                    queue = self.process_batch_sem.wait(queue).unwrap();
                }
                let head = queue.pop_front().unwrap();
                if head.stop_process {
                    // Anything queued behind the stop marker is refused.
                    for task in queue.drain(..) {
                        let _ = task.signal.send(Err(Error::DBClosed));
                    }
                    return;
                }
                let mut tasks = vec![head];
                if !tasks[0].force_rotate {
                    let mut size = tasks[0].batch.approximate_size();
                    let limit = if size <= SMALL_GROUP_HEAD {
                        size + SMALL_GROUP_HEAD
                    } else {
                        MAX_GROUP_SIZE
                    };
                    while let Some(next) = queue.front() {
                        if next.stop_process || next.force_rotate {
                            break;
                        }
                        // A sync write must not ride a group that will
                        // not be synced.
                        if next.options.sync && !tasks[0].options.sync {
                            break;
                        }
                        size += next.batch.approximate_size();
                        if size > limit {
                            break;
                        }
                        tasks.push(queue.pop_front().unwrap());
                    }
                }
                tasks
            };

            let result = self.commit_group(&tasks);
            for task in &tasks {
                let _ = task.signal.send(result.clone());
            }
        }
    }

    fn commit_group(&self, tasks: &[BatchTask]) -> IResult<()> {
        if let Some(e) = self.poison.read().unwrap().as_ref() {
            return Err(e.clone());
        }
        let force = tasks[0].force_rotate;
        self.make_room_for_write(force)?;
        if force {
            return Ok(());
        }

        let mut grouped = WriteBatch::new();
        for task in tasks {
            grouped.append(&task.batch);
        }
        let sync = tasks[0].options.sync;
        let last_sequence = self.versions.lock().unwrap().last_sequence();
        grouped.set_sequence(last_sequence + 1);
        let count = u64::from(grouped.count());

        // WAL first. An error here or during sync leaves the log state
        // ambiguous, which poisons the database.
        {
            let mut wal_guard = self.wal.lock().unwrap();
            let wal = wal_guard.as_mut().expect("WAL must exist while open");
            if let Err(e) = wal.writer.add_record(grouped.data()) {
                return Err(self.poison_db(e));
            }
            if sync {
                if let Err(e) = wal.writer.sync() {
                    return Err(self.poison_db(e));
                }
            }
        }

        let mem = self.mem.read().unwrap().clone();
        if let Err(e) = grouped.insert_into(&mem) {
            return Err(self.poison_db(e));
        }
        self.versions
            .lock()
            .unwrap()
            .set_last_sequence(last_sequence + count);
        Ok(())
    }

    fn poison_db(&self, e: Error) -> Error {
        error!("write path failed, poisoning database: {}", e);
        let mut poison = self.poison.write().unwrap();
        if poison.is_none() {
            *poison = Some(e.clone());
        }
        e
    }

    /// Applies write backpressure and rotates the memtable when full:
    /// one 1 ms sleep near the level-0 soft limit, a full stall at the
    /// hard limit or while a flush is still pending, and otherwise a new
    /// WAL + memtable with the old memtable handed to the compactor.
    fn make_room_for_write(&self, mut force: bool) -> IResult<()> {
        let mut allow_delay = !force;
        loop {
            if self.is_shutting_down.load(Ordering::Acquire) {
                return Err(Error::DBClosed);
            }
            if allow_delay
                && self.versions.lock().unwrap().level_files_count(0)
                    >= L0_SLOWDOWN_WRITES_TRIGGER
            {
                // Give the compactor a breath instead of stalling a
                // write outright at the hard limit. At most once per
                // write.
                thread::sleep(Duration::from_millis(1));
                allow_delay = false;
                continue;
            }
            let mem_usage = self.mem.read().unwrap().approximate_memory_usage();
            if !force && mem_usage <= self.options.write_buffer_size {
                return Ok(());
            }
            if force && self.mem.read().unwrap().is_empty() {
                return Ok(());
            }
            if let Some(e) = self.bg_error.read().unwrap().as_ref() {
                return Err(e.clone());
            }
            if self.imm.read().unwrap().is_some() {
                // The previous memtable is still being flushed.
                debug!("write stalled: immutable memtable pending");
                let versions = self.versions.lock().unwrap();
                let _unused = self
                    .background_work_finished_signal
                    .wait_timeout(versions, Duration::from_millis(100))
                    .unwrap();
                continue;
            }
            if self.versions.lock().unwrap().level_files_count(0) >= L0_STOP_WRITES_TRIGGER {
                debug!("write stalled: too many level-0 files");
                let versions = self.versions.lock().unwrap();
                let _unused = self
                    .background_work_finished_signal
                    .wait_timeout(versions, Duration::from_millis(100))
                    .unwrap();
                continue;
            }

            // Rotate: fresh WAL + memtable, the old pair queued for
            // flushing.
            let new_log_number = self.versions.lock().unwrap().new_file_number();
            let path = generate_filename(&self.db_path, FileType::Log, new_log_number);
            let file = match self.env.create(&path) {
                Ok(f) => f,
                Err(e) => {
                    self.versions.lock().unwrap().reuse_file_number(new_log_number);
                    return Err(e);
                }
            };
            {
                let mut wal = self.wal.lock().unwrap();
                if let Some(old) = wal.as_mut() {
                    let _ = old.writer.flush();
                }
                *wal = Some(WalState {
                    writer: Writer::new(file),
                    log_number: new_log_number,
                });
            }
            {
                let mut mem = self.mem.write().unwrap();
                let full = std::mem::replace(&mut *mem, Arc::new(MemTable::new(self.icmp.clone())));
                *self.imm.write().unwrap() = Some(full);
            }
            force = false;
            self.maybe_schedule_compaction();
        }
    }

    // READ PATH //

    fn read_sequence(&self, options: &ReadOptions) -> u64 {
        match &options.snapshot {
            Some(snapshot) => snapshot.sequence(),
            None => self.versions.lock().unwrap().last_sequence(),
        }
    }

    fn get(&self, options: ReadOptions, key: &[u8]) -> IResult<Option<Vec<u8>>> {
        if self.is_shutting_down.load(Ordering::Acquire) {
            return Err(Error::DBClosed);
        }
        let sequence = self.read_sequence(&options);
        let lkey = LookupKey::new(key, sequence);

        let mem = self.mem.read().unwrap().clone();
        match mem.get(&lkey) {
            Some(Ok(value)) => return Ok(Some(value)),
            Some(Err(e)) if e.is_not_found() => return Ok(None),
            Some(Err(e)) => return Err(e),
            None => {}
        }
        let imm = self.imm.read().unwrap().clone();
        if let Some(imm) = imm {
            match imm.get(&lkey) {
                Some(Ok(value)) => return Ok(Some(value)),
                Some(Err(e)) if e.is_not_found() => return Ok(None),
                Some(Err(e)) => return Err(e),
                None => {}
            }
        }

        let current = self.versions.lock().unwrap().current();
        let (value, stats) = current.get(&options, &lkey, &self.table_cache)?;
        if current.update_stats(stats) {
            self.maybe_schedule_compaction();
        }
        Ok(value)
    }

    fn new_iterator(&self, options: ReadOptions) -> IResult<SiltDBIterator<S, C>> {
        if self.is_shutting_down.load(Ordering::Acquire) {
            return Err(Error::DBClosed);
        }
        let sequence = self.read_sequence(&options);
        let mut mem_iters = vec![self.mem.read().unwrap().iter()];
        if let Some(imm) = self.imm.read().unwrap().as_ref() {
            mem_iters.push(imm.iter());
        }
        let (level0, leveln, version) = {
            let versions = self.versions.lock().unwrap();
            let (level0, leveln) =
                versions.current_sst_iters(options.clone(), &self.table_cache)?;
            (level0, leveln, versions.current())
        };
        let core = DBIteratorCore::new(self.icmp.clone(), mem_iters, level0, leveln, version);
        Ok(DBIterator::new(
            KMergeIter::new(core),
            self.options.comparator.clone(),
            sequence,
        ))
    }

    // PROPERTIES //

    fn get_property(&self, name: &str) -> Option<String> {
        if let Some(level) = name.strip_prefix("num-files-at-level") {
            let level: usize = level.parse().ok()?;
            if level >= NUM_LEVELS {
                return None;
            }
            return Some(
                self.versions
                    .lock()
                    .unwrap()
                    .level_files_count(level)
                    .to_string(),
            );
        }
        match name {
            "sstables" => {
                let current = self.versions.lock().unwrap().current();
                let mut out = String::new();
                for (level, files) in current.files.iter().enumerate() {
                    out.push_str(&format!("--- level {} ---\n", level));
                    for f in files {
                        out.push_str(&format!(
                            "{}:{}[{:?} .. {:?}]\n",
                            f.number, f.file_size, f.smallest, f.largest
                        ));
                    }
                }
                Some(out)
            }
            "approximate-memory-usage" => {
                let mut total = self.mem.read().unwrap().approximate_memory_usage();
                if let Some(imm) = self.imm.read().unwrap().as_ref() {
                    total += imm.approximate_memory_usage();
                }
                Some(total.to_string())
            }
            _ => None,
        }
    }

    fn get_approximate_sizes(&self, ranges: &[(&[u8], &[u8])]) -> Vec<u64> {
        let current = self.versions.lock().unwrap().current();
        ranges
            .iter()
            .map(|(start, limit)| {
                let start_key = InternalKey::new(start, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
                let limit_key = InternalKey::new(limit, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
                let start_offset = current.approximate_offset_of(&start_key, &self.table_cache);
                let limit_offset = current.approximate_offset_of(&limit_key, &self.table_cache);
                limit_offset.saturating_sub(start_offset)
            })
            .collect()
    }

    // COMPACTION //

    fn maybe_schedule_compaction(&self) {
        if self.is_shutting_down.load(Ordering::Acquire)
            || self.compaction_suspended.load(Ordering::Acquire)
        {
            return;
        }
        let work_pending = self.imm.read().unwrap().is_some()
            || self.manual_compaction.lock().unwrap().is_some()
            || self.versions.lock().unwrap().needs_compaction();
        if !work_pending {
            return;
        }
        if self
            .background_compaction_scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let _ = self.do_compaction.0.send(());
        }
    }

    /// Body of the compaction thread.
    fn compaction_loop(&self) {
        while self.do_compaction.1.recv().is_ok() {
            if self.is_shutting_down.load(Ordering::Acquire) {
                break;
            }
            if let Err(e) = self.background_compaction() {
                error!("background compaction failed: {}", e);
                let mut bg_error = self.bg_error.write().unwrap();
                if bg_error.is_none() {
                    *bg_error = Some(e);
                }
            }
            self.background_compaction_scheduled
                .store(false, Ordering::Release);
            // More may have piled up while this round ran.
            self.maybe_schedule_compaction();
            self.background_work_finished_signal.notify_all();
        }
    }

    fn background_compaction(&self) -> IResult<()> {
        if self.imm.read().unwrap().is_some() {
            return self.compact_memtable();
        }

        let manual = self.manual_compaction.lock().unwrap().clone();
        let compaction = match &manual {
            Some(m) => {
                let mg = m.lock().unwrap();
                let c = self.versions.lock().unwrap().compact_range(
                    mg.level,
                    mg.begin.as_ref(),
                    mg.end.as_ref(),
                );
                debug!(
                    level = mg.level,
                    planned = c.is_some(),
                    "manual compaction round"
                );
                c
            }
            None => self.versions.lock().unwrap().pick_compaction(),
        };

        let result = match compaction {
            None => {
                if let Some(m) = &manual {
                    m.lock().unwrap().done = true;
                }
                Ok(())
            }
            Some(c) if manual.is_none() && c.is_trivial_move() => {
                let f = c.inputs.base[0].clone();
                let level = c.level;
                let mut c = c;
                c.edit.delete_file(level, f.number);
                c.edit.add_file(
                    level + 1,
                    f.number,
                    f.file_size,
                    f.smallest.clone(),
                    f.largest.clone(),
                );
                let edit = std::mem::take(&mut c.edit);
                let result = self.versions.lock().unwrap().log_and_apply(edit);
                match result {
                    Ok(()) => {
                        info!(
                            file = f.number,
                            bytes = f.file_size,
                            from = level,
                            to = level + 1,
                            "trivial move"
                        );
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            Some(c) => {
                // Continuation point for the next manual round: just
                // past the largest base input key.
                let resume_after = c
                    .inputs
                    .base
                    .iter()
                    .map(|f| f.largest.clone())
                    .max_by(|a, b| self.icmp.compare(a.data(), b.data()));
                let result = self.run_compaction(c);
                if let Some(m) = &manual {
                    let mut mg = m.lock().unwrap();
                    if result.is_err() {
                        mg.done = true;
                    } else {
                        mg.begin = resume_after;
                    }
                }
                result
            }
        };
        if manual.is_some() {
            *self.manual_compaction.lock().unwrap() = None;
        }
        if result.is_ok() {
            // A successful round clears an earlier background error so
            // stalled writers can proceed.
            *self.bg_error.write().unwrap() = None;
        }
        result
    }

    fn compact_memtable(&self) -> IResult<()> {
        let imm = match self.imm.read().unwrap().as_ref() {
            Some(imm) => imm.clone(),
            None => return Ok(()),
        };
        let mut edit = VersionEdit::new();
        let base = self.versions.lock().unwrap().current();
        self.write_level0_table(&imm, &mut edit, Some(&base))?;
        if self.is_shutting_down.load(Ordering::Acquire) {
            return Err(Error::DBClosed);
        }
        // The flushed memtable's log (and everything before it) is no
        // longer needed for recovery.
        let log_number = self
            .wal
            .lock()
            .unwrap()
            .as_ref()
            .map(|w| w.log_number)
            .unwrap_or(0);
        edit.set_log_number(log_number);
        edit.set_prev_log_number(0);
        self.versions.lock().unwrap().log_and_apply(edit)?;
        *self.imm.write().unwrap() = None;
        self.delete_obsolete_files();
        Ok(())
    }

    /// Builds a table from `mem` and registers it in `edit` at the best
    /// level (level 0 unless a base version proves deeper is safe).
    fn write_level0_table(
        &self,
        mem: &MemTable<C>,
        edit: &mut VersionEdit,
        base: Option<&Arc<Version<C>>>,
    ) -> IResult<()> {
        let number = {
            let mut versions = self.versions.lock().unwrap();
            let number = versions.new_file_number();
            versions.pending_outputs.insert(number);
            number
        };
        info!(table = number, "flushing memtable");
        let mut meta = FileMetaData {
            number,
            ..Default::default()
        };
        let mut iter = mem.iter();
        let build_result = build_table(
            &self.options,
            &self.env,
            &self.db_path,
            &self.table_cache,
            &mut iter,
            &mut meta,
        );
        let mut versions = self.versions.lock().unwrap();
        versions.pending_outputs.remove(&number);
        if meta.file_size == 0 {
            versions.reuse_file_number(number);
        }
        build_result?;
        if meta.file_size > 0 {
            let level = match base {
                Some(v) => v.pick_level_for_memtable_output(
                    &self.options,
                    meta.smallest.user_key(),
                    meta.largest.user_key(),
                ),
                None => 0,
            };
            info!(
                table = meta.number,
                bytes = meta.file_size,
                level,
                "memtable flushed"
            );
            edit.add_file(level, meta.number, meta.file_size, meta.smallest, meta.largest);
        }
        Ok(())
    }

    /// Executes a non-trivial compaction plan and installs its results.
    fn run_compaction(&self, c: Compaction<C>) -> IResult<()> {
        let smallest_snapshot = {
            let mut versions = self.versions.lock().unwrap();
            let last = versions.last_sequence();
            versions.snapshots.oldest().unwrap_or(last)
        };
        info!(
            level = c.level,
            base_files = c.num_inputs(0),
            parent_files = c.num_inputs(1),
            reason = ?c.reason,
            "compaction started"
        );
        let mut state = CompactionState::new(c, smallest_snapshot);
        let result = self.do_compaction_work(&mut state);
        match result {
            Ok(()) => {
                let install = self.install_compaction_results(state);
                self.delete_obsolete_files();
                install
            }
            Err(e) => {
                self.cleanup_compaction_outputs(&mut state);
                self.delete_obsolete_files();
                Err(e)
            }
        }
    }

    fn do_compaction_work(&self, state: &mut CompactionState<S::F, C>) -> IResult<()> {
        let mut input = {
            let versions = self.versions.lock().unwrap();
            versions.make_input_iterator(&state.compaction, &self.table_cache)?
        };
        input.seek_to_first();

        let ucmp = self.options.comparator.clone();
        let mut current_ukey: Option<Vec<u8>> = None;
        let mut last_sequence_for_key = MAX_SEQUENCE_NUMBER;
        let mut last_key = vec![];

        while input.valid() {
            if self.is_shutting_down.load(Ordering::Acquire) {
                return Err(Error::DBClosed);
            }
            // Flushing the memtable outranks everything: a stalled
            // writer is waiting on it.
            if self.imm.read().unwrap().is_some() {
                self.compact_memtable()?;
                self.background_work_finished_signal.notify_all();
            }

            last_key.clear();
            last_key.extend_from_slice(input.key());
            if state.builder.is_some()
                && state
                    .compaction
                    .should_stop_before(&last_key, &self.icmp)
            {
                self.finish_compaction_output(state)?;
            }

            let mut drop_entry = false;
            match ParsedInternalKey::decode_from(&last_key) {
                None => {
                    // Keep corrupted entries; hiding them would silently
                    // lose whatever they were.
                    current_ukey = None;
                    last_sequence_for_key = MAX_SEQUENCE_NUMBER;
                }
                Some(parsed) => {
                    let first_occurrence = current_ukey
                        .as_deref()
                        .map_or(true, |k| ucmp.compare(parsed.user_key, k) != std::cmp::Ordering::Equal);
                    if first_occurrence {
                        current_ukey = Some(parsed.user_key.to_vec());
                        last_sequence_for_key = MAX_SEQUENCE_NUMBER;
                    }
                    if last_sequence_for_key <= state.smallest_snapshot {
                        // Shadowed by a newer entry that every snapshot
                        // already sees.
                        drop_entry = true;
                    } else if parsed.value_type == ValueType::KTypeDeletion
                        && parsed.seq <= state.smallest_snapshot
                        && state.compaction.is_base_level_for(parsed.user_key)
                    {
                        // The tombstone deletes nothing below and no
                        // snapshot can observe the deletion itself.
                        drop_entry = true;
                    }
                    last_sequence_for_key = parsed.seq;
                }
            }

            if !drop_entry {
                if state.builder.is_none() {
                    self.open_compaction_output(state)?;
                }
                if state.builder.as_ref().unwrap().num_entries() == 0 {
                    state.current_output().smallest = InternalKey::decoded_from(&last_key);
                }
                state.current_output().largest = InternalKey::decoded_from(&last_key);
                let builder = state.builder.as_mut().unwrap();
                builder.add(&last_key, input.value())?;
                if builder.file_size() >= self.options.max_file_size {
                    self.finish_compaction_output(state)?;
                }
            }

            input.next();
        }

        input.status()?;
        if state.builder.is_some() {
            self.finish_compaction_output(state)?;
        }
        Ok(())
    }

    fn open_compaction_output(&self, state: &mut CompactionState<S::F, C>) -> IResult<()> {
        debug_assert!(state.builder.is_none());
        let number = {
            let mut versions = self.versions.lock().unwrap();
            let number = versions.new_file_number();
            versions.pending_outputs.insert(number);
            number
        };
        let path = generate_filename(&self.db_path, FileType::Table, number);
        let file = self.env.create(&path)?;
        state.builder = Some(TableBuilder::new(file, self.icmp.clone(), &self.options));
        state.outputs.push(FileMetaData {
            number,
            ..Default::default()
        });
        Ok(())
    }

    fn finish_compaction_output(&self, state: &mut CompactionState<S::F, C>) -> IResult<()> {
        let mut builder = state.builder.take().expect("no output to finish");
        let entries = builder.num_entries();
        if entries == 0 {
            // An empty output: abandon the file.
            let number = state.current_output().number;
            state.outputs.pop();
            let mut versions = self.versions.lock().unwrap();
            versions.pending_outputs.remove(&number);
            versions.reuse_file_number(number);
            let _ = self
                .env
                .remove(generate_filename(&self.db_path, FileType::Table, number));
            return Ok(());
        }
        builder.finish(true)?;
        let file_size = builder.file_size();
        state.current_output().file_size = file_size;
        state.total_bytes += file_size;
        let number = state.current_output().number;
        // Verify the table is usable before relying on it.
        self.table_cache
            .new_iter(self.icmp.clone(), ReadOptions::default(), number, file_size)
            .and_then(|mut iter| iter.status())?;
        debug!(
            table = number,
            entries,
            bytes = file_size,
            "compaction output finished"
        );
        Ok(())
    }

    fn install_compaction_results(&self, mut state: CompactionState<S::F, C>) -> IResult<()> {
        state.compaction.add_input_deletions();
        let level = state.compaction.level;
        let output_numbers: Vec<u64> = state.outputs.iter().map(|o| o.number).collect();
        for output in state.outputs.drain(..) {
            state.compaction.edit.add_file(
                level + 1,
                output.number,
                output.file_size,
                output.smallest,
                output.largest,
            );
        }
        info!(
            level,
            bytes = state.total_bytes,
            "compaction finished"
        );
        let edit = std::mem::take(&mut state.compaction.edit);
        let mut versions = self.versions.lock().unwrap();
        let result = versions.log_and_apply(edit);
        // On success the outputs live in a version now; on failure
        // delete_obsolete_files sweeps them once the claims are gone.
        for number in output_numbers {
            versions.pending_outputs.remove(&number);
        }
        result
    }

    fn cleanup_compaction_outputs(&self, state: &mut CompactionState<S::F, C>) {
        state.builder = None;
        let mut versions = self.versions.lock().unwrap();
        for output in state.outputs.drain(..) {
            versions.pending_outputs.remove(&output.number);
            let _ = self.env.remove(generate_filename(
                &self.db_path,
                FileType::Table,
                output.number,
            ));
        }
    }

    fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> IResult<()> {
        // Which levels hold anything in range?
        let max_level = {
            let current = self.versions.lock().unwrap().current();
            let mut max_level = 1;
            for level in 1..NUM_LEVELS - 1 {
                if current.overlap_in_level(level, begin, end) {
                    max_level = level;
                }
            }
            max_level
        };
        // The memtable may hold keys in range; push it to a table first.
        self.schedule_batch_and_wait(WriteOptions::default(), WriteBatch::new(), true)?;
        self.wait_for_imm_flush()?;

        let begin_key =
            begin.map(|k| InternalKey::new(k, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK));
        let end_key = end.map(|k| InternalKey::new(k, 0, ValueType::KTypeDeletion));
        for level in 0..=max_level {
            self.manual_compact_level(level, begin_key.clone(), end_key.clone())?;
        }
        Ok(())
    }

    fn manual_compact_level(
        &self,
        level: usize,
        begin: Option<InternalKey>,
        end: Option<InternalKey>,
    ) -> IResult<()> {
        let request = Arc::new(Mutex::new(ManualCompaction {
            level,
            done: false,
            begin,
            end,
        }));
        loop {
            if self.is_shutting_down.load(Ordering::Acquire) {
                return Err(Error::DBClosed);
            }
            if request.lock().unwrap().done {
                return Ok(());
            }
            if let Some(e) = self.bg_error.read().unwrap().as_ref() {
                return Err(e.clone());
            }
            {
                let mut slot = self.manual_compaction.lock().unwrap();
                if slot.is_none() {
                    *slot = Some(request.clone());
                    drop(slot);
                    // Bypass the work_pending checks: the slot itself is
                    // the work.
                    if self
                        .background_compaction_scheduled
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        let _ = self.do_compaction.0.send(());
                    }
                }
            }
            let versions = self.versions.lock().unwrap();
            let _unused = self
                .background_work_finished_signal
                .wait_timeout(versions, Duration::from_millis(100))
                .unwrap();
        }
    }

    fn wait_for_imm_flush(&self) -> IResult<()> {
        loop {
            if self.is_shutting_down.load(Ordering::Acquire) {
                return Err(Error::DBClosed);
            }
            if self.imm.read().unwrap().is_none() {
                return Ok(());
            }
            if let Some(e) = self.bg_error.read().unwrap().as_ref() {
                return Err(e.clone());
            }
            self.maybe_schedule_compaction();
            let versions = self.versions.lock().unwrap();
            let _unused = self
                .background_work_finished_signal
                .wait_timeout(versions, Duration::from_millis(100))
                .unwrap();
        }
    }

    /// Removes files no longer reachable: WALs below the live log,
    /// manifests below the current one, tables in no version and no
    /// in-flight output.
    fn delete_obsolete_files(&self) {
        let (live, log_number, prev_log, manifest_number) = {
            let versions = self.versions.lock().unwrap();
            let mut live = versions.live_files();
            live.extend(versions.pending_outputs.iter().copied());
            (
                live,
                versions.log_number(),
                versions.prev_log_number(),
                versions.manifest_number(),
            )
        };
        let entries = match self.env.list(&self.db_path) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("cannot list database directory: {}", e);
                return;
            }
        };
        for path in entries {
            if let Some((file_type, number)) = parse_filename(&path) {
                let keep = match file_type {
                    FileType::Log => number >= log_number || number == prev_log,
                    FileType::Manifest => number >= manifest_number,
                    FileType::Table => live.contains(&number),
                    // An in-flight CURRENT rewrite.
                    FileType::Temp => live.contains(&number),
                    FileType::Current
                    | FileType::Lock
                    | FileType::InfoLog
                    | FileType::OldInfoLog => true,
                };
                if !keep {
                    if file_type == FileType::Table {
                        self.table_cache.evict(number);
                    }
                    debug!(?file_type, number, "deleting obsolete file");
                    if let Err(e) = self.env.remove(&path) {
                        warn!("failed to delete {:?}: {}", path, e);
                    }
                }
            }
        }
    }
}

/// Builds a table file from the contents of `iter`. The file is named
/// after `meta.number`; on success the rest of `meta` is filled in. An
/// empty iterator produces no file and leaves `meta.file_size` zero.
pub(crate) fn build_table<S: Storage + Clone, C: Comparator + 'static>(
    options: &Options<C>,
    storage: &S,
    db_path: &str,
    table_cache: &TableCache<S, C>,
    iter: &mut dyn Iter,
    meta: &mut FileMetaData,
) -> IResult<()> {
    meta.file_size = 0;
    iter.seek_to_first();
    let path = generate_filename(db_path, FileType::Table, meta.number);
    if !iter.valid() {
        return iter.status();
    }
    let icmp = InternalKeyComparator::new(options.comparator.clone());
    let mut status = (|| {
        let file = storage.create(&path)?;
        let mut builder = TableBuilder::new(file, icmp.clone(), options);
        meta.smallest = InternalKey::decoded_from(iter.key());
        let mut largest = vec![];
        while iter.valid() {
            largest.clear();
            largest.extend_from_slice(iter.key());
            builder.add(&largest, iter.value())?;
            iter.next();
        }
        meta.largest = InternalKey::decoded_from(&largest);
        builder.finish(true)?;
        meta.file_size = builder.file_size();
        debug_assert!(meta.file_size > 0);
        // Confirm the new table is readable before advertising it.
        let mut check =
            table_cache.new_iter(icmp, ReadOptions::default(), meta.number, meta.file_size)?;
        check.status()
    })();
    if let Err(e) = iter.status() {
        status = Err(e);
    }
    if status.is_err() || meta.file_size == 0 {
        let _ = storage.remove(&path);
        meta.file_size = 0;
    }
    status
}

/// Deletes the database in `db_path`: every file this implementation (or
/// a compatible one) may have produced, then the directory itself.
pub fn destroy_db<S: Storage>(storage: &S, db_path: &str) -> IResult<()> {
    let entries = match storage.list(db_path) {
        Ok(entries) => entries,
        // Nothing there: declared success, like removing a missing file
        // with force.
        Err(Error::NotFound) => return Ok(()),
        Err(e) => return Err(e),
    };
    let lock_path = generate_filename(db_path, FileType::Lock, 0);
    let lock_file = storage.open(&lock_path)?;
    lock_file.lock()?;
    let mut result = Ok(());
    for path in entries {
        if let Some((file_type, _)) = parse_filename(&path) {
            if file_type == FileType::Lock {
                continue;
            }
            if let Err(e) = storage.remove(&path) {
                result = Err(e);
            }
        }
    }
    lock_file.unlock()?;
    let _ = storage.remove(&lock_path);
    let _ = storage.remove_dir(db_path, false);
    result
}

/// Best-effort reconstruction of a database whose metadata is damaged:
/// orphaned WALs are converted to tables, every readable table is
/// re-registered at level 0 with freshly derived key ranges, and a new
/// manifest is written. Unreadable tables are dropped with a warning.
pub fn repair_db<S: Storage + Clone, C: Comparator + 'static>(
    storage: &S,
    db_path: &str,
    options: &Options<C>,
) -> IResult<()> {
    let icmp = InternalKeyComparator::new(options.comparator.clone());
    let table_cache = TableCache::new(db_path.to_owned(), options.clone(), storage.clone());

    let mut logs = vec![];
    let mut tables = vec![];
    let mut max_number = 1;
    for path in storage.list(db_path)? {
        if let Some((file_type, number)) = parse_filename(&path) {
            max_number = max_number.max(number);
            match file_type {
                FileType::Log => logs.push(number),
                FileType::Table => tables.push(number),
                // Old manifests are superseded by the one written below.
                FileType::Manifest | FileType::Temp => {
                    let _ = storage.remove(&path);
                }
                _ => {}
            }
        }
    }
    let mut next_number = max_number + 1;

    // Convert each WAL to a table so its updates survive.
    logs.sort_unstable();
    for log_number in logs {
        let path = generate_filename(db_path, FileType::Log, log_number);
        let file = storage.open(&path)?;
        let mut reader = Reader::new(file, None, true, 0);
        let mem = MemTable::new(icmp.clone());
        let mut record = vec![];
        let mut batch = WriteBatch::new();
        while reader.read_record(&mut record) {
            if record.len() < crate::batch::BATCH_HEADER_SIZE {
                continue;
            }
            if batch.set_contents(&record).is_ok() {
                // Tolerate partial batches: salvage what parses.
                let _ = batch.insert_into(&mem);
            }
        }
        if !mem.is_empty() {
            let number = next_number;
            next_number += 1;
            let mut meta = FileMetaData {
                number,
                ..Default::default()
            };
            let mut iter = mem.iter();
            match build_table(options, storage, db_path, &table_cache, &mut iter, &mut meta) {
                Ok(()) if meta.file_size > 0 => tables.push(number),
                Ok(()) => {}
                Err(e) => warn!(log = log_number, "log conversion failed: {}", e),
            }
        }
        let _ = storage.remove(&path);
    }

    // Derive metadata for every readable table; drop the rest.
    let mut metas: Vec<FileMetaData> = vec![];
    let mut max_sequence = 0u64;
    for number in tables {
        let scan = (|| -> IResult<FileMetaData> {
            let path = generate_filename(db_path, FileType::Table, number);
            let file_size = match storage.open(&path) {
                Ok(f) => f.len()?,
                Err(Error::NotFound) => {
                    let legacy =
                        crate::db::filename::generate_legacy_table_filename(db_path, number);
                    storage.open(legacy)?.len()?
                }
                Err(e) => return Err(e),
            };
            let mut iter =
                table_cache.new_iter(icmp.clone(), ReadOptions::default(), number, file_size)?;
            let mut meta = FileMetaData {
                number,
                file_size,
                ..Default::default()
            };
            let mut counted = 0usize;
            iter.seek_to_first();
            while iter.valid() {
                if let Some(parsed) = ParsedInternalKey::decode_from(iter.key()) {
                    max_sequence = max_sequence.max(parsed.seq);
                }
                if counted == 0 {
                    meta.smallest = InternalKey::decoded_from(iter.key());
                }
                meta.largest = InternalKey::decoded_from(iter.key());
                counted += 1;
                iter.next();
            }
            iter.status()?;
            if counted == 0 {
                return Err(Error::Corruption("table holds no entries".to_owned()));
            }
            Ok(meta)
        })();
        match scan {
            Ok(meta) => metas.push(meta),
            Err(e) => {
                warn!(table = number, "dropping unreadable table: {}", e);
                let _ = storage.remove(generate_filename(db_path, FileType::Table, number));
            }
        }
    }

    // A fresh manifest listing every salvaged table at level 0 (level-0
    // overlap rules make that always legal).
    let manifest_number = next_number;
    let mut edit = VersionEdit::new();
    edit.set_comparator_name(options.comparator.name().to_owned());
    edit.set_log_number(0);
    edit.set_next_file_number(manifest_number + 1);
    edit.set_last_sequence(max_sequence);
    for meta in metas {
        edit.add_file(
            0,
            meta.number,
            meta.file_size,
            meta.smallest,
            meta.largest,
        );
    }
    let manifest_path = generate_filename(db_path, FileType::Manifest, manifest_number);
    let file = storage.create(&manifest_path)?;
    let mut writer = Writer::new(file);
    let mut record = vec![];
    edit.encode_to(&mut record);
    let result = writer
        .add_record(&record)
        .and_then(|()| writer.sync())
        .and_then(|()| update_current(storage, db_path, manifest_number));
    if result.is_err() {
        let _ = storage.remove(&manifest_path);
    }
    info!(path = db_path, "repair finished");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::mem::MemStorage;
    use crate::util::comparator::BytewiseComparator;

    type TestDB = SiltDB<MemStorage, BytewiseComparator>;

    fn small_buffer_options() -> Options<BytewiseComparator> {
        Options {
            write_buffer_size: 64 << 10,
            // Tests assert on physical sizes; keep bytes incompressible
            // by construction instead of reasoning about codec ratios.
            compression: crate::options::CompressionType::KNoCompression,
            ..Default::default()
        }
    }

    fn open(storage: &MemStorage) -> TestDB {
        open_with(storage, small_buffer_options())
    }

    fn open_with(storage: &MemStorage, options: Options<BytewiseComparator>) -> TestDB {
        SiltDB::open("db", options, storage.clone()).unwrap()
    }

    fn put(db: &TestDB, key: &[u8], value: &[u8]) {
        db.put(WriteOptions::default(), key, value).unwrap();
    }

    fn get(db: &TestDB, key: &[u8]) -> Option<Vec<u8>> {
        db.get(ReadOptions::default(), key).unwrap()
    }

    fn num_files_at(db: &TestDB, level: usize) -> usize {
        db.get_property(&format!("num-files-at-level{}", level))
            .unwrap()
            .parse()
            .unwrap()
    }

    fn total_table_files(db: &TestDB) -> usize {
        (0..NUM_LEVELS).map(|l| num_files_at(db, l)).sum()
    }

    #[test]
    fn test_put_get_delete() {
        let storage = MemStorage::new();
        let db = open(&storage);
        put(&db, b"foo", b"v1");
        assert_eq!(get(&db, b"foo"), Some(b"v1".to_vec()));
        put(&db, b"foo", b"v2");
        assert_eq!(get(&db, b"foo"), Some(b"v2".to_vec()));
        db.delete(WriteOptions::default(), b"foo").unwrap();
        assert_eq!(get(&db, b"foo"), None);
        // Deleting an absent key is fine.
        db.delete(WriteOptions::default(), b"never").unwrap();
    }

    #[test]
    fn test_empty_key_and_empty_value() {
        let storage = MemStorage::new();
        let db = open(&storage);
        put(&db, b"", b"empty-key");
        put(&db, b"empty-value", b"");
        assert_eq!(get(&db, b""), Some(b"empty-key".to_vec()));
        assert_eq!(get(&db, b"empty-value"), Some(b"".to_vec()));
        assert_eq!(get(&db, b"missing"), None);
    }

    #[test]
    fn test_write_batch_is_atomic_and_ordered() {
        let storage = MemStorage::new();
        let db = open(&storage);
        let mut batch = WriteBatch::new();
        batch.put(b"a", b"va");
        batch.put(b"b", b"vb");
        batch.delete(b"a");
        db.write(WriteOptions::default(), batch).unwrap();
        assert_eq!(get(&db, b"a"), None);
        assert_eq!(get(&db, b"b"), Some(b"vb".to_vec()));
    }

    #[test]
    fn test_oversized_batch_is_rejected() {
        let storage = MemStorage::new();
        let db = open(&storage);
        let mut batch = WriteBatch::new();
        batch.put(b"k", &vec![0u8; 128 << 10]); // 2x the write buffer
        assert!(matches!(
            db.write(WriteOptions::default(), batch),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_recovery_across_reopen() {
        let storage = MemStorage::new();
        {
            let db = open(&storage);
            put(&db, b"foo", b"v1");
            put(&db, b"baz", b"v5");
            db.close().unwrap();
        }
        {
            let db = open(&storage);
            assert_eq!(get(&db, b"foo"), Some(b"v1".to_vec()));
            assert_eq!(get(&db, b"baz"), Some(b"v5".to_vec()));
            put(&db, b"bar", b"v2");
            put(&db, b"foo", b"v3");
            db.close().unwrap();
        }
        let db = open(&storage);
        assert_eq!(get(&db, b"foo"), Some(b"v3".to_vec()));
        assert_eq!(get(&db, b"bar"), Some(b"v2".to_vec()));
        assert_eq!(get(&db, b"baz"), Some(b"v5".to_vec()));
    }

    #[test]
    fn test_recovery_with_flushed_tables() {
        let storage = MemStorage::new();
        // Snappy-compressed tables must recover just the same.
        let options = Options {
            compression: crate::options::CompressionType::KSnappyCompression,
            ..small_buffer_options()
        };
        {
            let db = open_with(&storage, options.clone());
            for i in 0..500u32 {
                put(&db, format!("key{:05}", i).as_bytes(), &vec![b'x'; 1000]);
            }
            db.compact_range(None, None).unwrap();
            assert!(total_table_files(&db) > 0);
            put(&db, b"after-compact", b"wal-only");
            db.close().unwrap();
        }
        let db = open(&storage);
        for i in (0..500u32).step_by(37) {
            assert_eq!(
                get(&db, format!("key{:05}", i).as_bytes()),
                Some(vec![b'x'; 1000]),
                "key{:05}",
                i
            );
        }
        assert_eq!(get(&db, b"after-compact"), Some(b"wal-only".to_vec()));
    }

    #[test]
    fn test_flush_through_write_buffer() {
        let storage = MemStorage::new();
        let db = open(&storage);
        // Push well past the 64 KiB write buffer so rotations happen on
        // their own, then give the background flush a moment.
        for i in 0..300u32 {
            put(&db, format!("key{:05}", i).as_bytes(), &vec![b'v'; 1000]);
        }
        for _ in 0..100 {
            if total_table_files(&db) > 0 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(total_table_files(&db) > 0, "no memtable flush happened");
        for i in (0..300u32).step_by(23) {
            assert_eq!(
                get(&db, format!("key{:05}", i).as_bytes()),
                Some(vec![b'v'; 1000])
            );
        }
    }

    #[test]
    fn test_large_values_survive_flush_and_compaction() {
        let storage = MemStorage::new();
        let db = open(&storage);
        let big = vec![b'x'; 100_000];
        put(&db, b"big0", &big);
        put(&db, b"big1", &big);
        db.compact_range(None, None).unwrap();
        assert_eq!(get(&db, b"big0"), Some(big.clone()));
        assert_eq!(get(&db, b"big1"), Some(big));
    }

    #[test]
    fn test_hidden_by_snapshot_then_collected() {
        let storage = MemStorage::new();
        let db = open(&storage);
        let big = vec![b'x'; 50_000];
        put(&db, b"foo", &big);
        let snapshot = db.snapshot();
        put(&db, b"foo", b"tiny");
        db.compact_range(None, None).unwrap();

        assert_eq!(get(&db, b"foo"), Some(b"tiny".to_vec()));
        let at_snapshot = db
            .get(
                ReadOptions {
                    snapshot: Some(snapshot.clone()),
                    ..Default::default()
                },
                b"foo",
            )
            .unwrap();
        assert_eq!(at_snapshot, Some(big));

        // While the snapshot lives, the old value occupies table space.
        let before = db.get_approximate_sizes(&[(b"a".as_ref(), b"z".as_ref())])[0];
        assert!(before > 20_000, "old value should still be on disk ({})", before);

        db.release_snapshot(snapshot);
        db.compact_range(None, None).unwrap();
        db.compact_range(None, None).unwrap();
        assert_eq!(get(&db, b"foo"), Some(b"tiny".to_vec()));
        let after = db.get_approximate_sizes(&[(b"a".as_ref(), b"z".as_ref())])[0];
        assert!(
            after < 20_000,
            "released snapshot's value should be collected ({} -> {})",
            before,
            after
        );
    }

    #[test]
    fn test_snapshot_get_is_stable_across_writes() {
        let storage = MemStorage::new();
        let db = open(&storage);
        put(&db, b"k", b"v1");
        let snapshot = db.snapshot();
        put(&db, b"k", b"v2");
        db.delete(WriteOptions::default(), b"k").unwrap();
        let read = ReadOptions {
            snapshot: Some(snapshot.clone()),
            ..Default::default()
        };
        assert_eq!(db.get(read.clone(), b"k").unwrap(), Some(b"v1".to_vec()));
        db.compact_range(None, None).unwrap();
        assert_eq!(db.get(read, b"k").unwrap(), Some(b"v1".to_vec()));
        db.release_snapshot(snapshot);
    }

    #[test]
    fn test_iterator_sees_creation_time_state() {
        let storage = MemStorage::new();
        let db = open(&storage);
        put(&db, b"a", b"va");
        put(&db, b"b", b"vb");
        put(&db, b"c", b"vc");
        let mut iter = db.iter(ReadOptions::default()).unwrap();
        // Later writes must be invisible to the existing iterator.
        put(&db, b"a", b"va2");
        db.delete(WriteOptions::default(), b"b").unwrap();
        put(&db, b"c", b"vc2");

        iter.seek_to_first();
        let mut seen = vec![];
        while iter.valid() {
            seen.push((iter.key().to_vec(), iter.value().to_vec()));
            iter.next();
        }
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), b"va".to_vec()),
                (b"b".to_vec(), b"vb".to_vec()),
                (b"c".to_vec(), b"vc".to_vec()),
            ]
        );
        // A fresh iterator sees the new state.
        let mut iter = db.iter(ReadOptions::default()).unwrap();
        iter.seek_to_first();
        let mut seen = vec![];
        while iter.valid() {
            seen.push((iter.key().to_vec(), iter.value().to_vec()));
            iter.next();
        }
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), b"va2".to_vec()),
                (b"c".to_vec(), b"vc2".to_vec()),
            ]
        );
    }

    #[test]
    fn test_iterator_forward_backward_agree_across_layers() {
        let storage = MemStorage::new();
        let db = open(&storage);
        for i in 0..200u32 {
            put(&db, format!("key{:05}", i).as_bytes(), &vec![b'v'; 500]);
        }
        // Some keys in tables, some fresh in the memtable, one deleted.
        db.compact_range(None, None).unwrap();
        for i in 200..260u32 {
            put(&db, format!("key{:05}", i).as_bytes(), b"memvalue");
        }
        db.delete(WriteOptions::default(), b"key00100").unwrap();

        let mut iter = db.iter(ReadOptions::default()).unwrap();
        iter.seek_to_first();
        let mut forward = vec![];
        while iter.valid() {
            forward.push(iter.key().to_vec());
            iter.next();
        }
        iter.seek_to_last();
        let mut backward = vec![];
        while iter.valid() {
            backward.push(iter.key().to_vec());
            iter.prev();
        }
        backward.reverse();
        assert_eq!(forward, backward);
        assert_eq!(forward.len(), 259);
        assert!(!forward.contains(&b"key00100".to_vec()));

        iter.seek(b"key00150");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"key00150");
        iter.status().unwrap();
    }

    #[test]
    fn test_sync_error_poisons_writes() {
        let storage = MemStorage::new();
        let db = open(&storage);
        put(&db, b"k1", b"v1");
        storage
            .faults()
            .sync_error
            .store(true, std::sync::atomic::Ordering::Relaxed);
        let sync = WriteOptions { sync: true };
        assert!(db.put(sync, b"k2", b"v2").is_err());
        storage
            .faults()
            .sync_error
            .store(false, std::sync::atomic::Ordering::Relaxed);
        // The failure is sticky even for non-sync writes.
        assert!(db.put(WriteOptions::default(), b"k3", b"v3").is_err());
        assert_eq!(get(&db, b"k1"), Some(b"v1".to_vec()));
        assert_eq!(get(&db, b"k2"), None);
        assert_eq!(get(&db, b"k3"), None);
    }

    #[test]
    fn test_missing_table_file_fails_reopen() {
        let storage = MemStorage::new();
        {
            let db = open(&storage);
            put(&db, b"foo", b"bar");
            db.compact_range(None, None).unwrap();
            assert!(total_table_files(&db) > 0);
            db.close().unwrap();
        }
        // Delete one table file behind the database's back.
        let victim = storage
            .list("db")
            .unwrap()
            .into_iter()
            .find(|p| matches!(parse_filename(p), Some((FileType::Table, _))))
            .expect("a table file should exist");
        storage.remove(&victim).unwrap();

        let options = Options {
            paranoid_checks: true,
            ..small_buffer_options()
        };
        match SiltDB::open("db", options, storage) {
            Err(Error::Corruption(msg)) => assert!(msg.contains("missing"), "{}", msg),
            other => panic!("expected corruption, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_second_open_is_locked_out() {
        let storage = MemStorage::new();
        let db = open(&storage);
        assert!(SiltDB::open("db", small_buffer_options(), storage.clone()).is_err());
        db.close().unwrap();
        // After close the directory is free again.
        let db = open(&storage);
        drop(db);
    }

    #[test]
    fn test_create_if_missing_and_error_if_exists() {
        let storage = MemStorage::new();
        let options = Options {
            create_if_missing: false,
            ..small_buffer_options()
        };
        assert!(matches!(
            SiltDB::open("db", options, storage.clone()),
            Err(Error::InvalidArgument(_))
        ));
        open(&storage).close().unwrap();
        let options = Options {
            error_if_exists: true,
            ..small_buffer_options()
        };
        assert!(matches!(
            SiltDB::open("db", options, storage),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_properties() {
        let storage = MemStorage::new();
        let db = open(&storage);
        assert_eq!(num_files_at(&db, 0), 0);
        assert!(db.get_property("approximate-memory-usage").is_some());
        assert!(db.get_property("nonsense").is_none());
        put(&db, b"k", b"v");
        db.compact_range(None, None).unwrap();
        assert!(total_table_files(&db) > 0);
        let dump = db.get_property("sstables").unwrap();
        assert!(dump.contains("--- level "));
    }

    #[test]
    fn test_approximate_sizes_grow_with_data() {
        let storage = MemStorage::new();
        let db = open(&storage);
        for i in 0..300u32 {
            put(&db, format!("key{:05}", i).as_bytes(), &vec![b'x'; 1000]);
        }
        db.compact_range(None, None).unwrap();
        let sizes = db.get_approximate_sizes(&[
            (b"key00000".as_ref(), b"key00150".as_ref()),
            (b"key00150".as_ref(), b"key00300".as_ref()),
            (b"zz".as_ref(), b"zzz".as_ref()),
        ]);
        assert!(sizes[0] > 50_000, "{:?}", sizes);
        assert!(sizes[1] > 50_000, "{:?}", sizes);
        assert_eq!(sizes[2], 0);
    }

    #[test]
    fn test_compaction_pushes_data_down_levels() {
        let storage = MemStorage::new();
        let db = open(&storage);
        for i in 0..400u32 {
            put(&db, format!("key{:05}", i).as_bytes(), &vec![b'd'; 800]);
        }
        db.compact_range(None, None).unwrap();
        assert_eq!(num_files_at(&db, 0), 0, "everything should leave level 0");
        assert!(total_table_files(&db) > 0);
        for i in (0..400u32).step_by(41) {
            assert_eq!(
                get(&db, format!("key{:05}", i).as_bytes()),
                Some(vec![b'd'; 800])
            );
        }
    }

    #[test]
    fn test_overwrites_and_deletes_through_compaction() {
        let storage = MemStorage::new();
        let db = open(&storage);
        for i in 0..100u32 {
            put(&db, format!("key{:03}", i).as_bytes(), b"first");
        }
        db.compact_range(None, None).unwrap();
        for i in 0..100u32 {
            if i % 2 == 0 {
                put(&db, format!("key{:03}", i).as_bytes(), b"second");
            } else {
                db.delete(WriteOptions::default(), format!("key{:03}", i).as_bytes())
                    .unwrap();
            }
        }
        db.compact_range(None, None).unwrap();
        for i in 0..100u32 {
            let got = get(&db, format!("key{:03}", i).as_bytes());
            if i % 2 == 0 {
                assert_eq!(got, Some(b"second".to_vec()), "key{:03}", i);
            } else {
                assert_eq!(got, None, "key{:03}", i);
            }
        }
    }

    #[test]
    fn test_suspend_holds_back_compaction() {
        let storage = MemStorage::new();
        let db = open(&storage);
        db.suspend_compaction();
        // Exactly one rotation's worth: the memtable rotates but the
        // pending flush must not run while suspended.
        for i in 0..100u32 {
            put(&db, format!("key{:05}", i).as_bytes(), &vec![b'v'; 1000]);
        }
        thread::sleep(Duration::from_millis(50));
        assert!(
            db.inner.imm.read().unwrap().is_some(),
            "flush ran despite suspension"
        );
        db.resume_compaction();
        for _ in 0..100 {
            if db.inner.imm.read().unwrap().is_none() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(db.inner.imm.read().unwrap().is_none());
        for i in (0..100u32).step_by(10) {
            assert_eq!(
                get(&db, format!("key{:05}", i).as_bytes()),
                Some(vec![b'v'; 1000])
            );
        }
    }

    #[test]
    fn test_destroy_db_removes_everything() {
        let storage = MemStorage::new();
        {
            let db = open(&storage);
            put(&db, b"k", b"v");
            db.compact_range(None, None).unwrap();
            db.close().unwrap();
        }
        destroy_db(&storage, "db").unwrap();
        assert!(storage.list("db").unwrap().is_empty());
        // A fresh database can be created in the same place.
        let db = open(&storage);
        assert_eq!(get(&db, b"k"), None);
    }

    #[test]
    fn test_repair_db_rebuilds_metadata() {
        let storage = MemStorage::new();
        {
            let db = open(&storage);
            for i in 0..50u32 {
                put(&db, format!("key{:03}", i).as_bytes(), b"value");
            }
            db.compact_range(None, None).unwrap();
            put(&db, b"wal-key", b"wal-value");
            db.close().unwrap();
        }
        // Lose the metadata.
        storage
            .remove(generate_filename("db", FileType::Current, 0))
            .unwrap();
        repair_db(&storage, "db", &small_buffer_options()).unwrap();

        let db = open(&storage);
        for i in (0..50u32).step_by(7) {
            assert_eq!(
                get(&db, format!("key{:03}", i).as_bytes()),
                Some(b"value".to_vec())
            );
        }
        assert_eq!(get(&db, b"wal-key"), Some(b"wal-value".to_vec()));
    }

    #[test]
    fn test_reuse_logs_keeps_wal_across_reopen() {
        let storage = MemStorage::new();
        let options = Options {
            reuse_logs: true,
            ..small_buffer_options()
        };
        {
            let db = open_with(&storage, options.clone());
            put(&db, b"a", b"1");
            put(&db, b"b", b"2");
            db.close().unwrap();
        }
        let log_count_before = storage
            .list("db")
            .unwrap()
            .iter()
            .filter(|p| matches!(parse_filename(p), Some((FileType::Log, _))))
            .count();
        {
            let db = open_with(&storage, options.clone());
            assert_eq!(get(&db, b"a"), Some(b"1".to_vec()));
            put(&db, b"c", b"3");
            db.close().unwrap();
        }
        let log_count_after = storage
            .list("db")
            .unwrap()
            .iter()
            .filter(|p| matches!(parse_filename(p), Some((FileType::Log, _))))
            .count();
        // The old WAL was appended to, not replaced.
        assert_eq!(log_count_before, log_count_after);
        let db = open_with(&storage, options);
        assert_eq!(get(&db, b"a"), Some(b"1".to_vec()));
        assert_eq!(get(&db, b"b"), Some(b"2".to_vec()));
        assert_eq!(get(&db, b"c"), Some(b"3".to_vec()));
    }

    #[test]
    fn test_concurrent_writers_see_all_writes() {
        let storage = MemStorage::new();
        let db = Arc::new(open(&storage));
        let mut handles = vec![];
        for t in 0..4 {
            let db = db.clone();
            handles.push(thread::spawn(move || {
                for i in 0..100u32 {
                    db.put(
                        WriteOptions::default(),
                        format!("t{}-{:03}", t, i).as_bytes(),
                        format!("v{}", i).as_bytes(),
                    )
                    .unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        for t in 0..4 {
            for i in (0..100u32).step_by(13) {
                assert_eq!(
                    get(&db, format!("t{}-{:03}", t, i).as_bytes()),
                    Some(format!("v{}", i).into_bytes())
                );
            }
        }
    }
}
