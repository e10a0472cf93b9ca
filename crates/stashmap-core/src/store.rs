//! The persistent map: key index + value log + append cache under one lock
//!
//! `PersistentMap` ties the components together. Every key is enumerated to a
//! stable id by the key index; the id's address slot points at the newest
//! chunk of the key's value in the append-only log. Incremental appends pass
//! through a write-back cache and only reach the log when a buffer is evicted,
//! read through, or flushed.
//!
//! All storage state lives behind one mutex. Operations lock, do their file
//! work, unlock; there is no finer-grained locking and no background thread.
//! Compaction runs stop-the-world under the same lock: it rewrites live
//! values into a fresh log, swaps the files, and resets the garbage counters.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::addr::can_use_small_address;
use crate::addr::ValueRef;
use crate::append_cache::{AppendCache, BufferPool};
use crate::codec::{KeyDescriptor, ValueExternalizer};
use crate::compaction::{should_compact, CompactionInputs, CompactionStats};
use crate::config::StoreConfig;
use crate::counters::LiveGarbageCounter;
use crate::error::{StoreError, StoreResult};
use crate::key_index::KeyIndex;
use crate::low_memory::{MemoryPressureSource, MemoryPressureSubscription};
use crate::vlog::{ValueLog, NULL_ADDR};

/// Delete every file in `base`'s directory whose name starts with `base`'s
/// file name. Used to clear orphaned storage files when the index is gone
/// and the remaining siblings cannot be trusted.
pub fn delete_files_starting_with(base: &Path) -> StoreResult<()> {
    let dir = match base.parent() {
        Some(dir) if dir.as_os_str().is_empty() => Path::new("."),
        Some(dir) => dir,
        None => return Ok(()),
    };
    let prefix = match base.file_name().and_then(|n| n.to_str()) {
        Some(prefix) => prefix.to_string(),
        None => return Ok(()),
    };
    if !dir.exists() {
        return Ok(());
    }

    let entries = std::fs::read_dir(dir).map_err(|e| StoreError::Io {
        path: Some(dir.to_path_buf()),
        kind: e.kind(),
        message: format!("Failed to list storage directory: {}", e),
    })?;
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::Io {
            path: Some(dir.to_path_buf()),
            kind: e.kind(),
            message: format!("Failed to list storage directory: {}", e),
        })?;
        let name = entry.file_name();
        let matches = name.to_str().map(|n| n.starts_with(&prefix)).unwrap_or(false);
        if matches && entry.path().is_file() {
            std::fs::remove_file(entry.path()).map_err(|e| StoreError::Io {
                path: Some(entry.path()),
                kind: e.kind(),
                message: format!("Failed to delete stale storage file: {}", e),
            })?;
        }
    }
    Ok(())
}

fn values_path(base: &Path) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(".values");
    name.into()
}

fn compaction_target_path(log_path: &Path) -> PathBuf {
    let mut name = log_path.as_os_str().to_os_string();
    name.push(".new");
    name.into()
}

/// Encode `addr` into `id`'s slot, re-enumerating the key onto a wide record
/// first when the large form does not fit the existing slot. Returns the id
/// the slot was written under, which differs from `id` after re-enumeration.
fn persist_value_ref(
    index: &mut KeyIndex,
    watermark_id: &mut u32,
    small_limit: u64,
    id: u32,
    addr: Option<u64>,
) -> StoreResult<u32> {
    let value = match addr {
        None => ValueRef::NoMapping,
        Some(offset) => {
            if can_use_small_address(index.can_reenumerate(), offset, small_limit) {
                ValueRef::Small(offset as u32)
            } else {
                ValueRef::Large(offset)
            }
        }
    };

    let mut id = id;
    if matches!(value, ValueRef::Large(_)) && !index.is_wide(id)? {
        id = index.reenumerate(id)?;
        if *watermark_id == 0 {
            *watermark_id = id;
        }
    }
    index.write_value_ref(id, value)?;
    Ok(id)
}

/// All storage state, owned by the single lock.
struct MapCore {
    /// None once the map is closed
    index: Option<KeyIndex>,
    /// None once the map is closed (and transiently during compaction)
    vlog: Option<ValueLog>,
    counter: LiveGarbageCounter,
    /// First id ever assigned a wide record, 0 while none exists
    watermark_id: u32,
    /// Bytes of stale chunk chains observed by reads since the last compaction
    read_garbage_size: u64,
    cache: AppendCache,
    pool: BufferPool,
    config: StoreConfig,
}

impl MapCore {
    fn put_impl(&mut self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        // The new value replaces anything buffered for this key.
        if let Some(buf) = self.cache.remove(key) {
            self.pool.recycle(buf);
        }

        let Self { index, vlog, counter, watermark_id, config, .. } = self;
        let index = index.as_mut().ok_or(StoreError::Closed)?;
        let vlog = vlog.as_mut().ok_or(StoreError::Closed)?;

        let wide =
            !can_use_small_address(index.can_reenumerate(), vlog.size(), config.small_address_limit);
        let before = index.len();
        let id = index.enumerate(key, wide)?;
        if id > before && wide && *watermark_id == 0 {
            *watermark_id = id;
        }

        let old = index.read_value_ref(id)?;
        let addr = vlog.append(value, NULL_ADDR)?;
        persist_value_ref(index, watermark_id, config.small_address_limit, id, Some(addr))?;

        if old.is_none() {
            counter.on_new_mapping();
        } else {
            counter.on_overwrite();
        }
        Ok(())
    }

    fn get_impl(&mut self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.flush_pending(key)?;

        let Self { index, vlog, counter, watermark_id, read_garbage_size, config, .. } = self;
        let index = index.as_mut().ok_or(StoreError::Closed)?;
        let vlog = vlog.as_mut().ok_or(StoreError::Closed)?;

        let id = match index.try_enumerate(key) {
            Some(id) => id,
            None => return Ok(None),
        };
        let addr = match index.read_value_ref(id)?.addr() {
            Some(addr) => addr,
            None => return Ok(None),
        };

        let result = vlog.read(addr)?;
        if result.addr != addr {
            // The read merged a chunk chain; repoint the slot at the merged
            // copy and account the stale chain as reclaimable.
            persist_value_ref(index, watermark_id, config.small_address_limit, id, Some(result.addr))?;
            counter.on_read_relocation();
            *read_garbage_size += result.data.len() as u64;
        }
        Ok(Some(result.data))
    }

    fn contains_impl(&mut self, key: &[u8]) -> StoreResult<bool> {
        self.flush_pending(key)?;
        let index = self.index.as_ref().ok_or(StoreError::Closed)?;
        match index.try_enumerate(key) {
            Some(id) => Ok(!index.read_value_ref(id)?.is_none()),
            None => Ok(false),
        }
    }

    fn remove_impl(&mut self, key: &[u8]) -> StoreResult<()> {
        // Buffered appends for a removed key never reach the log.
        if let Some(buf) = self.cache.remove(key) {
            self.pool.recycle(buf);
        }

        let Self { index, counter, watermark_id, config, .. } = self;
        let index = index.as_mut().ok_or(StoreError::Closed)?;

        if let Some(id) = index.try_enumerate(key) {
            if !index.read_value_ref(id)?.is_none() {
                persist_value_ref(index, watermark_id, config.small_address_limit, id, None)?;
                counter.on_removal();
            }
        }
        Ok(())
    }

    fn append_impl<F: FnOnce(&mut Vec<u8>)>(&mut self, key: &[u8], appender: F) -> StoreResult<()> {
        if self.index.is_none() || self.vlog.is_none() {
            return Err(StoreError::Closed);
        }

        let evicted = self.cache.touch(key, &mut self.pool);
        for (victim, buf) in evicted {
            if buf.is_empty() {
                self.pool.recycle(buf);
            } else {
                self.flush_buffer(&victim, buf)?;
            }
        }
        if let Some(buf) = self.cache.buffer_mut(key) {
            appender(buf);
        }
        Ok(())
    }

    /// Flush `key`'s buffered appends, if any, into the value log.
    fn flush_pending(&mut self, key: &[u8]) -> StoreResult<()> {
        if let Some(buf) = self.cache.remove(key) {
            if buf.is_empty() {
                self.pool.recycle(buf);
            } else {
                self.flush_buffer(key, buf)?;
            }
        }
        Ok(())
    }

    fn flush_all_pending(&mut self) -> StoreResult<()> {
        for (key, buf) in self.cache.drain() {
            if buf.is_empty() {
                self.pool.recycle(buf);
            } else {
                self.flush_buffer(&key, buf)?;
            }
        }
        Ok(())
    }

    /// Append a flushed buffer as a chunk chained onto the key's current
    /// value. A key whose first data arrived through appends becomes a live
    /// mapping here, not at append time.
    fn flush_buffer(&mut self, key: &[u8], buf: Vec<u8>) -> StoreResult<()> {
        let Self { index, vlog, counter, watermark_id, config, pool, .. } = self;
        let index = index.as_mut().ok_or(StoreError::Closed)?;
        let vlog = vlog.as_mut().ok_or(StoreError::Closed)?;

        let wide =
            !can_use_small_address(index.can_reenumerate(), vlog.size(), config.small_address_limit);
        let before = index.len();
        let id = index.enumerate(key, wide)?;
        if id > before && wide && *watermark_id == 0 {
            *watermark_id = id;
        }

        let old = index.read_value_ref(id)?;
        let prev = old.addr().unwrap_or(NULL_ADDR);
        let addr = vlog.append(&buf, prev)?;
        persist_value_ref(index, watermark_id, config.small_address_limit, id, Some(addr))?;

        if old.is_none() {
            counter.on_new_mapping();
        }
        pool.recycle(buf);
        Ok(())
    }

    /// Keys of every non-retired record, flushing pending appends first so
    /// append-only keys are visible. `mapped_only` skips keys without a value.
    fn collect_keys(&mut self, mapped_only: bool) -> StoreResult<Vec<Vec<u8>>> {
        self.flush_all_pending()?;
        let index = self.index.as_ref().ok_or(StoreError::Closed)?;

        let mut keys = Vec::new();
        for id in 1..=index.len() {
            if index.is_retired(id)? {
                continue;
            }
            if mapped_only && index.read_value_ref(id)?.is_none() {
                continue;
            }
            keys.push(index.key_bytes(id)?.to_vec());
        }
        Ok(keys)
    }

    fn compaction_inputs(&self) -> StoreResult<CompactionInputs> {
        let vlog = self.vlog.as_ref().ok_or(StoreError::Closed)?;
        Ok(CompactionInputs {
            file_size: vlog.size(),
            live_keys: self.counter.live(),
            dead_keys: self.counter.dead(),
            read_garbage_size: self.read_garbage_size,
        })
    }

    /// Stash the counters and watermark in the index header metadata.
    fn stage_metadata(&mut self) -> StoreResult<()> {
        let meta1 = self.counter.to_packed();
        let garbage = self.read_garbage_size.min(u32::MAX as u64);
        let meta2 = u64::from(self.watermark_id) | (garbage << 32);
        self.index.as_mut().ok_or(StoreError::Closed)?.set_metadata(meta1, meta2);
        Ok(())
    }

    fn force_impl(&mut self) -> StoreResult<()> {
        self.flush_all_pending()?;
        self.stage_metadata()?;
        self.vlog.as_ref().ok_or(StoreError::Closed)?.force()?;
        self.index.as_mut().ok_or(StoreError::Closed)?.force()
    }

    /// Flush, persist and release both files. Idempotent.
    fn close_impl(&mut self) -> StoreResult<()> {
        if self.index.is_none() {
            return Ok(());
        }
        self.flush_all_pending()?;
        self.stage_metadata()?;
        if let Some(vlog) = self.vlog.take() {
            vlog.dispose()?;
        }
        if let Some(index) = self.index.take() {
            index.close()?;
        }
        Ok(())
    }

    /// Rewrite every live value into a fresh log and swap it in. Runs under
    /// the storage lock; readers and writers wait. On failure the old log
    /// stays in place and the counters are restored to their pre-pass state.
    fn compact_impl(&mut self) -> StoreResult<CompactionStats> {
        self.flush_all_pending()?;
        let started = Instant::now();
        let saved_counter = self.counter;
        let saved_garbage = self.read_garbage_size;

        let Self { index, vlog, counter, watermark_id, read_garbage_size, config, .. } = self;
        let index = index.as_mut().ok_or(StoreError::Closed)?;
        let mut old_log = vlog.take().ok_or(StoreError::Closed)?;

        old_log.switch_to_compaction_mode();
        let old_size = old_log.size();
        let log_path = old_log.path().to_path_buf();
        let new_path = compaction_target_path(&log_path);

        counter.on_compaction_reset();
        *read_garbage_size = 0;

        let outcome = (|| -> StoreResult<(u64, u64)> {
            let mut new_log = ValueLog::open(&new_path)?;
            let mut rewritten = 0u64;
            for id in 1..=index.len() {
                if index.is_retired(id)? {
                    continue;
                }
                let addr = match index.read_value_ref(id)?.addr() {
                    Some(addr) => addr,
                    None => continue,
                };
                let data = old_log.read(addr)?.data;
                let new_addr = new_log.append(&data, NULL_ADDR)?;
                persist_value_ref(index, watermark_id, config.small_address_limit, id, Some(new_addr))?;
                counter.on_new_mapping();
                rewritten += 1;
            }
            let new_size = new_log.size();
            new_log.dispose()?;
            Ok((rewritten, new_size))
        })();

        match outcome {
            Ok((rewritten, new_size)) => {
                old_log.dispose()?;
                std::fs::rename(&new_path, &log_path).map_err(|e| StoreError::Io {
                    path: Some(log_path.clone()),
                    kind: e.kind(),
                    message: format!("Failed to swap in compacted value log: {}", e),
                })?;
                let new_log = ValueLog::open(&log_path)?;
                new_log.force()?;
                *vlog = Some(new_log);

                // Read garbage is zero after the reset, so the second word is
                // just the watermark.
                index.set_metadata(counter.to_packed(), u64::from(*watermark_id));
                index.force()?;

                let stats = CompactionStats {
                    records_rewritten: rewritten,
                    old_log_size: old_size,
                    new_log_size: new_size,
                    elapsed: started.elapsed(),
                };
                eprintln!(
                    "[stashmap] compacted {}: {} records, {} -> {} bytes in {:?}",
                    log_path.display(),
                    stats.records_rewritten,
                    stats.old_log_size,
                    stats.new_log_size,
                    stats.elapsed
                );
                Ok(stats)
            }
            Err(err) => {
                // Index slots touched before the failure still point into the
                // old log only if the pass died before repointing them; either
                // way the old data is intact, so surface the error and keep
                // the map usable for reads of untouched keys.
                *counter = saved_counter;
                *read_garbage_size = saved_garbage;
                let _ = std::fs::remove_file(&new_path);
                let _ = old_log.dispose();
                *vlog = Some(ValueLog::open(&log_path)?);
                Err(err)
            }
        }
    }
}

struct Shared<D: KeyDescriptor, E: ValueExternalizer> {
    core: Mutex<MapCore>,
    key_codec: D,
    value_codec: E,
    base_path: PathBuf,
    subscription: Mutex<Option<MemoryPressureSubscription>>,
}

/// Persistent disk-backed map with append support.
///
/// Keys and values are (de)serialized through the supplied codecs; all
/// persistence goes through a key index file at the base path and a value
/// log at `<base>.values`. The handle is `Send + Sync`; every operation
/// serializes on one internal lock.
pub struct PersistentMap<D: KeyDescriptor, E: ValueExternalizer> {
    shared: Arc<Shared<D, E>>,
}

impl<D: KeyDescriptor, E: ValueExternalizer> PersistentMap<D, E> {
    /// Open or create a map rooted at `base_path`.
    ///
    /// If the index file is missing but sibling storage files exist, the
    /// siblings are deleted first; without the index they are unreadable.
    /// When the persisted garbage counters already warrant compaction, a
    /// compaction pass runs before the map is returned.
    pub fn open<P: AsRef<Path>>(
        base_path: P,
        key_codec: D,
        value_codec: E,
        config: StoreConfig,
    ) -> StoreResult<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        config.validate().map_err(|msg| StoreError::Io {
            path: Some(base_path.clone()),
            kind: std::io::ErrorKind::InvalidInput,
            message: format!("Invalid configuration: {}", msg),
        })?;

        let log_path = values_path(&base_path);
        if !base_path.exists() && log_path.exists() {
            eprintln!(
                "[stashmap] index missing for {}, dropping stale storage files",
                base_path.display()
            );
            delete_files_starting_with(&base_path)?;
        }

        let index = KeyIndex::open(&base_path)?;
        let vlog = match ValueLog::open(&log_path) {
            Ok(vlog) => vlog,
            Err(err) => {
                let _ = index.close();
                return Err(err);
            }
        };

        let (meta1, meta2) = index.metadata();
        let core = MapCore {
            index: Some(index),
            vlog: Some(vlog),
            counter: LiveGarbageCounter::from_packed(meta1),
            watermark_id: meta2 as u32,
            read_garbage_size: meta2 >> 32,
            cache: AppendCache::new(config.append_cache_protected, config.append_cache_probational),
            pool: BufferPool::new(config.buffer_pool_capacity),
            config,
        };

        let map = Self {
            shared: Arc::new(Shared {
                core: Mutex::new(core),
                key_codec,
                value_codec,
                base_path,
                subscription: Mutex::new(None),
            }),
        };

        {
            let mut core = map.shared.core.lock();
            let inputs = core.compaction_inputs()?;
            if should_compact(&inputs, &core.config) {
                eprintln!(
                    "[stashmap] compacting {} at open",
                    map.shared.base_path.display()
                );
                core.compact_impl()?;
            }
        }

        Ok(map)
    }

    /// Store `value` for `key`, replacing any existing value and discarding
    /// any buffered appends for the key.
    pub fn put(&self, key: &D::Key, value: &E::Value) -> StoreResult<()> {
        let key_bytes = self.shared.key_codec.save(key)?;
        let mut value_bytes = Vec::new();
        self.shared.value_codec.save(&mut value_bytes, value)?;
        self.shared.core.lock().put_impl(&key_bytes, &value_bytes)
    }

    /// Current value for `key`, with buffered appends flushed first.
    pub fn get(&self, key: &D::Key) -> StoreResult<Option<E::Value>> {
        let key_bytes = self.shared.key_codec.save(key)?;
        let data = self.shared.core.lock().get_impl(&key_bytes)?;
        match data {
            Some(bytes) => Ok(Some(self.shared.value_codec.read(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Whether `key` currently has a value.
    pub fn contains_mapping(&self, key: &D::Key) -> StoreResult<bool> {
        let key_bytes = self.shared.key_codec.save(key)?;
        self.shared.core.lock().contains_impl(&key_bytes)
    }

    /// Drop `key`'s mapping. A no-op for unmapped keys.
    pub fn remove(&self, key: &D::Key) -> StoreResult<()> {
        let key_bytes = self.shared.key_codec.save(key)?;
        self.shared.core.lock().remove_impl(&key_bytes)
    }

    /// Grow `key`'s value incrementally: `appender` writes into the key's
    /// in-memory append buffer. Appends accumulate and reach disk on
    /// eviction, read, `force` or `close`; a key created this way has no
    /// visible mapping until then.
    pub fn append_data<F: FnOnce(&mut Vec<u8>)>(&self, key: &D::Key, appender: F) -> StoreResult<()> {
        let key_bytes = self.shared.key_codec.save(key)?;
        self.shared.core.lock().append_impl(&key_bytes, appender)
    }

    /// Flush buffered appends and sync both files to persistent storage.
    pub fn force(&self) -> StoreResult<()> {
        self.shared.core.lock().force_impl()
    }

    /// Flush buffered appends without syncing. Wired to low-memory
    /// notifications; also callable directly.
    pub fn drop_memory_caches(&self) -> StoreResult<()> {
        self.shared.core.lock().flush_all_pending()
    }

    /// Flush, persist and close. Further operations return
    /// [`StoreError::Closed`]; closing again is a no-op.
    pub fn close(&self) -> StoreResult<()> {
        if let Some(subscription) = self.shared.subscription.lock().take() {
            subscription.stop();
        }
        self.shared.core.lock().close_impl()
    }

    /// Whether accumulated garbage justifies a compaction pass.
    pub fn needs_compaction(&self) -> StoreResult<bool> {
        let core = self.shared.core.lock();
        let inputs = core.compaction_inputs()?;
        Ok(should_compact(&inputs, &core.config))
    }

    /// Rewrite live values into a fresh log, reclaiming dead space. Blocks
    /// every other operation for the duration.
    pub fn compact(&self) -> StoreResult<CompactionStats> {
        self.shared.core.lock().compact_impl()
    }

    /// Invoke `f` for every key ever enumerated (mapped or not), stopping
    /// early when it returns false. Returns whether the walk completed.
    pub fn process_all_keys<F: FnMut(&D::Key) -> bool>(&self, mut f: F) -> StoreResult<bool> {
        let keys = self.shared.core.lock().collect_keys(false)?;
        for key_bytes in keys {
            let key = self.shared.key_codec.read(&key_bytes)?;
            if !f(&key) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Invoke `f` for every key with a current value.
    pub fn process_keys_with_mapping<F: FnMut(&D::Key) -> bool>(
        &self,
        mut f: F,
    ) -> StoreResult<bool> {
        let keys = self.shared.core.lock().collect_keys(true)?;
        for key_bytes in keys {
            let key = self.shared.key_codec.read(&key_bytes)?;
            if !f(&key) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Every key with a current value.
    pub fn all_keys_with_mapping(&self) -> StoreResult<Vec<D::Key>> {
        let keys = self.shared.core.lock().collect_keys(true)?;
        keys.iter().map(|bytes| self.shared.key_codec.read(bytes)).collect()
    }

    /// Keys with a live mapping.
    pub fn live_keys(&self) -> u32 {
        self.shared.core.lock().counter.live()
    }

    /// Mappings overwritten, removed or relocated since the last compaction.
    pub fn dead_keys(&self) -> u32 {
        self.shared.core.lock().counter.dead()
    }

    /// Bytes of stale chunk chains observed by reads since the last compaction.
    pub fn garbage_size(&self) -> u64 {
        self.shared.core.lock().read_garbage_size
    }

    pub fn base_path(&self) -> &Path {
        &self.shared.base_path
    }

    /// Flush the append cache whenever `source` signals memory pressure. The
    /// subscription lives until the map is closed or dropped; re-subscribing
    /// replaces the previous subscription.
    pub fn subscribe_low_memory(&self, source: &MemoryPressureSource)
    where
        D: 'static,
        E: 'static,
    {
        let weak = Arc::downgrade(&self.shared);
        let subscription = source.subscribe(Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                let mut core = shared.core.lock();
                if let Err(err) = core.flush_all_pending() {
                    eprintln!("[stashmap] low-memory flush failed: {}", err);
                }
            }
        }));
        *self.shared.subscription.lock() = Some(subscription);
    }
}

impl<D: KeyDescriptor, E: ValueExternalizer> Drop for PersistentMap<D, E> {
    fn drop(&mut self) {
        if let Some(subscription) = self.shared.subscription.lock().take() {
            subscription.stop();
        }
        if let Err(err) = self.shared.core.lock().close_impl() {
            eprintln!(
                "[stashmap] close on drop failed for {}: {}",
                self.shared.base_path.display(),
                err
            );
        }
    }
}
