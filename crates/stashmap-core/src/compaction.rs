//! Compaction heuristic and reporting
//!
//! The value log only ever grows: overwrites, removals and chain relocations
//! all leave dead bytes behind. The heuristic below decides when rewriting the
//! whole log is worth a stop-the-world pause; the map runs it at open time and
//! callers can consult it through `PersistentMap::needs_compaction`.

use std::time::Duration;

use crate::config::StoreConfig;

/// Inputs to the compaction decision, sampled under the storage lock.
#[derive(Debug, Clone, Copy)]
pub struct CompactionInputs {
    /// Current size of the value log file in bytes.
    pub file_size: u64,
    /// Keys with a live mapping.
    pub live_keys: u32,
    /// Keys whose mapping was overwritten or removed since the last compaction.
    pub dead_keys: u32,
    /// Bytes of chain garbage observed by reads since the last compaction.
    pub read_garbage_size: u64,
}

/// Whether the garbage in the value log justifies a rewrite.
///
/// Small files are never compacted, and a handful of dead keys is not worth
/// the pause. Past those floors, compact when dead mappings outnumber live
/// ones, when the estimated reclaimable bytes pass the configured benefit
/// threshold, or when reads have already walked more garbage than half the
/// file.
pub fn should_compact(inputs: &CompactionInputs, config: &StoreConfig) -> bool {
    if inputs.file_size <= config.compaction_min_file_size {
        return false;
    }
    if inputs.dead_keys < config.compaction_dead_key_floor {
        return false;
    }

    if inputs.dead_keys > inputs.live_keys {
        return true;
    }

    let total = u64::from(inputs.live_keys) + u64::from(inputs.dead_keys);
    let avg_value_size = inputs.file_size / total.max(1);
    if avg_value_size * u64::from(inputs.dead_keys) > config.compaction_benefit_bytes {
        return true;
    }

    inputs.read_garbage_size > inputs.file_size / 2
}

/// Outcome of a completed compaction pass.
#[derive(Debug, Clone, Copy)]
pub struct CompactionStats {
    /// Live mappings carried into the new log.
    pub records_rewritten: u64,
    /// Value log size before the rewrite.
    pub old_log_size: u64,
    /// Value log size after the rewrite.
    pub new_log_size: u64,
    pub elapsed: Duration,
}

impl CompactionStats {
    pub fn reclaimed_bytes(&self) -> u64 {
        self.old_log_size.saturating_sub(self.new_log_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StoreConfig {
        StoreConfig {
            compaction_min_file_size: 1000,
            compaction_dead_key_floor: 10,
            compaction_benefit_bytes: 10_000,
            ..StoreConfig::default()
        }
    }

    fn inputs(file_size: u64, live: u32, dead: u32, garbage: u64) -> CompactionInputs {
        CompactionInputs {
            file_size,
            live_keys: live,
            dead_keys: dead,
            read_garbage_size: garbage,
        }
    }

    #[test]
    fn test_small_file_never_compacts() {
        // Dead-heavy but below the size floor.
        assert!(!should_compact(&inputs(1000, 1, 500, 900), &config()));
    }

    #[test]
    fn test_few_dead_keys_never_compact() {
        assert!(!should_compact(&inputs(50_000, 1, 9, 40_000), &config()));
    }

    #[test]
    fn test_dead_majority_compacts() {
        assert!(should_compact(&inputs(2000, 10, 11, 0), &config()));
        assert!(!should_compact(&inputs(2000, 11, 11, 0), &config()));
    }

    #[test]
    fn test_reclaimable_bytes_compact() {
        // avg value size 100, 50 dead keys -> 5000 estimated reclaim: below.
        assert!(!should_compact(&inputs(10_000, 50, 50, 0), &config()));
        // avg value size 2000, 50 dead keys -> 100_000: above.
        assert!(should_compact(&inputs(200_000, 50, 50, 0), &config()));
    }

    #[test]
    fn test_read_garbage_compacts() {
        assert!(!should_compact(&inputs(10_000, 100, 20, 5000), &config()));
        assert!(should_compact(&inputs(10_000, 100, 20, 5001), &config()));
    }

    #[test]
    fn test_stats_reclaimed() {
        let stats = CompactionStats {
            records_rewritten: 3,
            old_log_size: 900,
            new_log_size: 250,
            elapsed: Duration::from_millis(5),
        };
        assert_eq!(stats.reclaimed_bytes(), 650);
    }
}
