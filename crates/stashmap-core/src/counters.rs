//! Live/garbage key accounting
//!
//! A single 64-bit word, persisted through the key index metadata, packs the
//! live-key count in the high half and the dead-key count in the low half.
//! Every address transition goes through one of the named methods below so
//! the invariant (counts reflect every id ever assigned or nulled since the
//! last compaction) stays auditable.

/// Packed live/dead key counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveGarbageCounter {
    live: u32,
    dead: u32,
}

impl LiveGarbageCounter {
    /// Restore from the persisted metadata word (live high, dead low).
    pub fn from_packed(word: u64) -> Self {
        Self {
            live: (word >> 32) as u32,
            dead: word as u32,
        }
    }

    /// Pack for persistence (live high, dead low).
    pub fn to_packed(self) -> u64 {
        ((self.live as u64) << 32) | self.dead as u64
    }

    pub fn live(&self) -> u32 {
        self.live
    }

    pub fn dead(&self) -> u32 {
        self.dead
    }

    /// A key received its first-ever value.
    pub fn on_new_mapping(&mut self) {
        self.live = self.live.wrapping_add(1);
    }

    /// A live key's value was replaced; the key stays live, the old value
    /// becomes reclaimable.
    pub fn on_overwrite(&mut self) {
        self.dead = self.dead.wrapping_add(1);
    }

    /// A mapped key was removed. The live count is intentionally left alone:
    /// together live + dead track every address ever written, which is what
    /// the compaction heuristic divides the file size by.
    pub fn on_removal(&mut self) {
        self.dead = self.dead.wrapping_add(1);
    }

    /// A read relocated a chained value; the stale chain is garbage now.
    pub fn on_read_relocation(&mut self) {
        self.dead = self.dead.wrapping_add(1);
    }

    /// Compaction rewrote the log; counting starts over from zero and the
    /// caller re-adds one live mapping per surviving record.
    pub fn on_compaction_reset(&mut self) {
        self.live = 0;
        self.dead = 0;
    }
}
