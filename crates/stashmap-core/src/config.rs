//! Configuration for a persistent map instance
//!
//! The compaction thresholds and cache capacities are policy constants tuned
//! empirically; they are exposed here instead of being hard-coded so tests and
//! unusual workloads can dial them.

/// Persistent map configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Compaction is not considered at all while the value log is smaller than this
    pub compaction_min_file_size: u64,
    /// Compaction is not considered while fewer than this many dead keys exist
    pub compaction_dead_key_floor: u32,
    /// Compact when estimated reclaimable bytes (dead keys x average record size) exceed this
    pub compaction_benefit_bytes: u64,
    /// Protected segment capacity of the write-back append cache (entries)
    pub append_cache_protected: usize,
    /// Probational segment capacity of the write-back append cache (entries)
    pub append_cache_probational: usize,
    /// Maximum number of recycled append buffers kept in the pool
    pub buffer_pool_capacity: usize,
    /// Largest value log offset still encodable in the narrow (4-byte) address form.
    /// The default matches the signed 32-bit range; lowering it forces the wide
    /// form early, which is how the encoding boundary is exercised in tests.
    pub small_address_limit: u64,
}

impl StoreConfig {
    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.compaction_min_file_size == 0 {
            return Err("compaction_min_file_size must be > 0".into());
        }
        if self.compaction_benefit_bytes == 0 {
            return Err("compaction_benefit_bytes must be > 0".into());
        }
        if self.append_cache_protected == 0 {
            return Err("append_cache_protected must be > 0".into());
        }
        if self.append_cache_probational == 0 {
            return Err("append_cache_probational must be > 0".into());
        }
        if self.buffer_pool_capacity == 0 {
            return Err("buffer_pool_capacity must be > 0".into());
        }
        if self.small_address_limit < 2 || self.small_address_limit > i32::MAX as u64 {
            return Err("small_address_limit must be in [2, i32::MAX]".into());
        }
        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        let megabyte = 1024 * 1024;
        Self {
            compaction_min_file_size: 5 * megabyte,
            compaction_dead_key_floor: 50,
            compaction_benefit_bytes: 100 * megabyte,
            append_cache_protected: 16 * 1024,
            append_cache_probational: 4 * 1024,
            buffer_pool_capacity: 10,
            small_address_limit: i32::MAX as u64,
        }
    }
}
