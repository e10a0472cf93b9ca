//! Key index: stable integer ids for keys
//!
//! The index owns key -> id assignment and one record per id. Records are
//! append-only; ids are 1-based record ordinals and are never freed. Each
//! record ends in an address slot owned by the map core (see `addr`); the
//! slot is 4 bytes for records allocated while the value log was small and
//! 8 bytes otherwise. Re-enumeration retires a record and appends a wide one
//! for the same key when a large address no longer fits.
//!
//! File layout:
//!   header (32 bytes): [magic b"SMIX"][version u32 LE][meta1 u64 LE]
//!                      [meta2 u64 LE][reserved 8]
//!   records:           [flags u8][key_len u32 LE][key bytes][slot 4|8]
//!
//! The two metadata words are opaque to the index; the map packs its
//! live/garbage counter and watermark/read-garbage state into them. Slot
//! updates write through to disk immediately; the header (and metadata) is
//! rewritten on force/close.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use hashbrown::HashMap;

use crate::addr::ValueRef;
use crate::error::{StoreError, StoreResult};
use crate::platform_durability::durable_sync;

/// Magic bytes at the start of every index file
const MAGIC: [u8; 4] = *b"SMIX";

/// On-disk format version
const VERSION: u32 = 1;

/// Index header size in bytes
const HEADER_SIZE: u64 = 32;

/// Record flag: the address slot is 8 bytes wide
const FLAG_WIDE: u8 = 0b01;

/// Record flag: the record was superseded by re-enumeration
const FLAG_RETIRED: u8 = 0b10;

/// The null id: no key ever enumerates to 0.
pub const NULL_ID: u32 = 0;

struct Record {
    key: Vec<u8>,
    flags: u8,
    /// File offset of the record's flags byte
    offset: u64,
    /// In-memory copy of the address slot (first 4 bytes for narrow records)
    slot: [u8; 8],
}

impl Record {
    fn slot_width(&self) -> usize {
        if self.flags & FLAG_WIDE != 0 { 8 } else { 4 }
    }

    fn slot_offset(&self) -> u64 {
        self.offset + 1 + 4 + self.key.len() as u64
    }
}

/// Persistent key -> id enumerator with per-id address slots.
pub struct KeyIndex {
    file: File,
    path: PathBuf,
    size: u64,
    records: Vec<Record>,
    lookup: HashMap<Vec<u8>, u32>,
    meta1: u64,
    meta2: u64,
}

impl KeyIndex {
    /// Open or create the index at `path`. Structural damage in an existing
    /// file surfaces as `StoreError::Corrupted`.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| StoreError::Io {
                path: Some(path.clone()),
                kind: e.kind(),
                message: format!("Failed to open key index: {}", e),
            })?;

        let len = file
            .metadata()
            .map_err(|e| StoreError::Io {
                path: Some(path.clone()),
                kind: e.kind(),
                message: format!("Failed to stat key index: {}", e),
            })?
            .len();

        if len == 0 {
            let mut index = Self {
                file,
                path,
                size: HEADER_SIZE,
                records: Vec::new(),
                lookup: HashMap::new(),
                meta1: 0,
                meta2: 0,
            };
            index.write_header()?;
            return Ok(index);
        }

        let mut buffer = Vec::with_capacity(len as usize);
        file.read_to_end(&mut buffer).map_err(|e| StoreError::Io {
            path: Some(path.clone()),
            kind: e.kind(),
            message: format!("Failed to read key index: {}", e),
        })?;

        if buffer.len() < HEADER_SIZE as usize {
            return Err(StoreError::Corrupted {
                path,
                reason: format!("index shorter than its header: {} bytes", buffer.len()),
            });
        }
        if buffer[0..4] != MAGIC {
            return Err(StoreError::Corrupted {
                path,
                reason: "index magic bytes not found".to_string(),
            });
        }
        let version = u32::from_le_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]);
        if version != VERSION {
            return Err(StoreError::Corrupted {
                path,
                reason: format!("unsupported index version {}", version),
            });
        }
        let mut word = [0u8; 8];
        word.copy_from_slice(&buffer[8..16]);
        let meta1 = u64::from_le_bytes(word);
        word.copy_from_slice(&buffer[16..24]);
        let meta2 = u64::from_le_bytes(word);

        let mut records = Vec::new();
        let mut lookup: HashMap<Vec<u8>, u32> = HashMap::new();
        let mut pos = HEADER_SIZE as usize;

        while pos < buffer.len() {
            let record_offset = pos as u64;
            let flags = buffer[pos];
            if flags & !(FLAG_WIDE | FLAG_RETIRED) != 0 {
                return Err(StoreError::Corrupted {
                    path,
                    reason: format!("unknown record flags 0x{:02x} at offset {}", flags, pos),
                });
            }
            if pos + 5 > buffer.len() {
                return Err(StoreError::Corrupted {
                    path,
                    reason: format!("truncated record header at offset {}", pos),
                });
            }
            let key_len = u32::from_le_bytes([
                buffer[pos + 1], buffer[pos + 2], buffer[pos + 3], buffer[pos + 4],
            ]) as usize;
            let slot_width = if flags & FLAG_WIDE != 0 { 8 } else { 4 };
            let record_end = pos + 5 + key_len + slot_width;
            if record_end > buffer.len() {
                return Err(StoreError::Corrupted {
                    path,
                    reason: format!("truncated record at offset {}", pos),
                });
            }

            let key = buffer[pos + 5..pos + 5 + key_len].to_vec();
            let mut slot = [0u8; 8];
            slot[..slot_width].copy_from_slice(&buffer[pos + 5 + key_len..record_end]);

            let id = records.len() as u32 + 1;
            if flags & FLAG_RETIRED == 0 {
                lookup.insert(key.clone(), id);
            }
            records.push(Record { key, flags, offset: record_offset, slot });
            pos = record_end;
        }

        Ok(Self { file, path, size: len, records, lookup, meta1, meta2 })
    }

    /// Whether this index can reassign ids to widen a record. Always true for
    /// this format; kept as a queryable property because the address encoding
    /// must degrade to wide-only when it is not.
    pub fn can_reenumerate(&self) -> bool {
        true
    }

    /// Number of ids ever assigned (retired ones included).
    pub fn len(&self) -> u32 {
        self.records.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The two opaque metadata words (restored from the header).
    pub fn metadata(&self) -> (u64, u64) {
        (self.meta1, self.meta2)
    }

    /// Replace the metadata words; persisted on the next `force`.
    pub fn set_metadata(&mut self, meta1: u64, meta2: u64) {
        self.meta1 = meta1;
        self.meta2 = meta2;
    }

    /// Id for `key` if it was ever enumerated.
    pub fn try_enumerate(&self, key: &[u8]) -> Option<u32> {
        self.lookup.get(key).copied()
    }

    /// Id for `key`, allocating a record on first sight. `wide` fixes the
    /// address slot width for a newly allocated record and is ignored for
    /// existing ones.
    pub fn enumerate(&mut self, key: &[u8], wide: bool) -> StoreResult<u32> {
        if let Some(id) = self.lookup.get(key) {
            return Ok(*id);
        }
        let flags = if wide { FLAG_WIDE } else { 0 };
        let id = self.append_record(key.to_vec(), flags)?;
        self.lookup.insert(key.to_vec(), id);
        Ok(id)
    }

    /// Reassign `id`'s key to a fresh wide record. The old record is retired
    /// and its slot nulled so traversals and compaction skip it. Returns the
    /// new id; the old one is no longer reachable through lookup.
    pub fn reenumerate(&mut self, id: u32) -> StoreResult<u32> {
        let (key, flags_offset, slot_offset, slot_width) = {
            let record = self.record(id)?;
            (record.key.clone(), record.offset, record.slot_offset(), record.slot_width())
        };

        {
            let record = self.record_mut(id)?;
            record.flags |= FLAG_RETIRED;
            record.slot = [0u8; 8];
            let flags = record.flags;
            self.write_at(flags_offset, &[flags])?;
        }
        self.write_at(slot_offset, &[0u8; 8][..slot_width])?;

        let new_id = self.append_record(key.clone(), FLAG_WIDE)?;
        self.lookup.insert(key, new_id);
        Ok(new_id)
    }

    /// Whether `id`'s record carries the 8-byte address slot.
    pub fn is_wide(&self, id: u32) -> StoreResult<bool> {
        Ok(self.record(id)?.flags & FLAG_WIDE != 0)
    }

    /// Whether `id` was superseded by re-enumeration.
    pub fn is_retired(&self, id: u32) -> StoreResult<bool> {
        Ok(self.record(id)?.flags & FLAG_RETIRED != 0)
    }

    /// Serialized key bytes for `id`.
    pub fn key_bytes(&self, id: u32) -> StoreResult<&[u8]> {
        Ok(&self.record(id)?.key)
    }

    /// Decode `id`'s address slot.
    pub fn read_value_ref(&self, id: u32) -> StoreResult<ValueRef> {
        let record = self.record(id)?;
        Ok(ValueRef::decode(&record.slot[..record.slot_width()]))
    }

    /// Encode `value` into `id`'s address slot and write it through to disk.
    /// A wide form aimed at a narrow slot is rejected; the map re-enumerates
    /// before ever getting here.
    pub fn write_value_ref(&mut self, id: u32, value: ValueRef) -> StoreResult<()> {
        let (slot_offset, width, slot) = {
            let record = self.record_mut(id)?;
            let width = record.slot_width();
            if !value.encode(&mut record.slot[..width]) {
                return Err(StoreError::Corrupted {
                    path: self.path.clone(),
                    reason: format!("wide address written to narrow slot of id {}", id),
                });
            }
            (record.slot_offset(), width, record.slot)
        };
        self.write_at(slot_offset, &slot[..width])
    }

    /// Persist the header (metadata words included) and sync.
    pub fn force(&mut self) -> StoreResult<()> {
        self.write_header()?;
        durable_sync(&self.file).map_err(|e| StoreError::Io {
            path: Some(self.path.clone()),
            kind: e.kind(),
            message: format!("Key index durable_sync failed: {}", e),
        })
    }

    /// Persist and release the file handle.
    pub fn close(mut self) -> StoreResult<()> {
        self.force()
    }

    fn record(&self, id: u32) -> StoreResult<&Record> {
        if id == NULL_ID || id > self.records.len() as u32 {
            return Err(StoreError::Corrupted {
                path: self.path.clone(),
                reason: format!("id {} out of range (have {})", id, self.records.len()),
            });
        }
        Ok(&self.records[(id - 1) as usize])
    }

    fn record_mut(&mut self, id: u32) -> StoreResult<&mut Record> {
        if id == NULL_ID || id > self.records.len() as u32 {
            return Err(StoreError::Corrupted {
                path: self.path.clone(),
                reason: format!("id {} out of range (have {})", id, self.records.len()),
            });
        }
        Ok(&mut self.records[(id - 1) as usize])
    }

    fn append_record(&mut self, key: Vec<u8>, flags: u8) -> StoreResult<u32> {
        let slot_width = if flags & FLAG_WIDE != 0 { 8 } else { 4 };
        let offset = self.size;

        let mut buf = Vec::with_capacity(5 + key.len() + slot_width);
        buf.push(flags);
        buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
        buf.extend_from_slice(&key);
        buf.extend_from_slice(&[0u8; 8][..slot_width]);
        self.write_at(offset, &buf)?;

        self.size += buf.len() as u64;
        self.records.push(Record { key, flags, offset, slot: [0u8; 8] });
        Ok(self.records.len() as u32)
    }

    fn write_header(&mut self) -> StoreResult<()> {
        let mut header = [0u8; HEADER_SIZE as usize];
        header[0..4].copy_from_slice(&MAGIC);
        header[4..8].copy_from_slice(&VERSION.to_le_bytes());
        header[8..16].copy_from_slice(&self.meta1.to_le_bytes());
        header[16..24].copy_from_slice(&self.meta2.to_le_bytes());
        self.write_at(0, &header)
    }

    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> StoreResult<()> {
        self.file.seek(SeekFrom::Start(offset)).map_err(|e| StoreError::Io {
            path: Some(self.path.clone()),
            kind: e.kind(),
            message: format!("Key index seek failed: {}", e),
        })?;
        self.file.write_all(bytes).map_err(|e| StoreError::Io {
            path: Some(self.path.clone()),
            kind: e.kind(),
            message: format!("Key index write failed: {}", e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_index(tmp: &TempDir) -> KeyIndex {
        KeyIndex::open(tmp.path().join("map")).unwrap()
    }

    #[test]
    fn test_enumerate_assigns_sequential_ids() {
        let tmp = TempDir::new().unwrap();
        let mut index = open_index(&tmp);

        assert_eq!(index.enumerate(b"alpha", false).unwrap(), 1);
        assert_eq!(index.enumerate(b"beta", false).unwrap(), 2);
        assert_eq!(index.enumerate(b"alpha", false).unwrap(), 1);
        assert_eq!(index.len(), 2);
        assert_eq!(index.try_enumerate(b"gamma"), None);
    }

    #[test]
    fn test_slot_roundtrip_and_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("map");

        {
            let mut index = KeyIndex::open(&path).unwrap();
            let narrow = index.enumerate(b"narrow", false).unwrap();
            let wide = index.enumerate(b"wide", true).unwrap();
            index.write_value_ref(narrow, ValueRef::Small(4096)).unwrap();
            index.write_value_ref(wide, ValueRef::Large(1 << 40)).unwrap();
            index.close().unwrap();
        }

        let index = KeyIndex::open(&path).unwrap();
        let narrow = index.try_enumerate(b"narrow").unwrap();
        let wide = index.try_enumerate(b"wide").unwrap();
        assert_eq!(index.read_value_ref(narrow).unwrap(), ValueRef::Small(4096));
        assert_eq!(index.read_value_ref(wide).unwrap(), ValueRef::Large(1 << 40));
        assert!(!index.is_wide(narrow).unwrap());
        assert!(index.is_wide(wide).unwrap());
    }

    #[test]
    fn test_metadata_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("map");

        {
            let mut index = KeyIndex::open(&path).unwrap();
            index.set_metadata(0xDEAD_BEEF_0000_0001, 42);
            index.close().unwrap();
        }

        let index = KeyIndex::open(&path).unwrap();
        assert_eq!(index.metadata(), (0xDEAD_BEEF_0000_0001, 42));
    }

    #[test]
    fn test_reenumerate_retires_old_record() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("map");

        {
            let mut index = KeyIndex::open(&path).unwrap();
            let id = index.enumerate(b"grower", false).unwrap();
            index.write_value_ref(id, ValueRef::Small(7)).unwrap();

            let new_id = index.reenumerate(id).unwrap();
            assert_ne!(new_id, id);
            assert!(index.is_retired(id).unwrap());
            assert!(index.is_wide(new_id).unwrap());
            assert_eq!(index.try_enumerate(b"grower"), Some(new_id));
            // The retired slot is nulled so traversals skip its stale address.
            assert_eq!(index.read_value_ref(id).unwrap(), ValueRef::NoMapping);

            index.write_value_ref(new_id, ValueRef::Large(1 << 35)).unwrap();
            index.close().unwrap();
        }

        let index = KeyIndex::open(&path).unwrap();
        let id = index.try_enumerate(b"grower").unwrap();
        assert_eq!(index.read_value_ref(id).unwrap(), ValueRef::Large(1 << 35));
        assert!(index.is_retired(1).unwrap());
    }

    #[test]
    fn test_wide_into_narrow_slot_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut index = open_index(&tmp);
        let id = index.enumerate(b"k", false).unwrap();
        assert!(index.write_value_ref(id, ValueRef::Large(1 << 40)).is_err());
    }

    #[test]
    fn test_truncated_file_is_corruption() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("map");

        {
            let mut index = KeyIndex::open(&path).unwrap();
            index.enumerate(b"victim-key", false).unwrap();
            index.close().unwrap();
        }

        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        assert!(matches!(KeyIndex::open(&path), Err(StoreError::Corrupted { .. })));
    }

    #[test]
    fn test_garbage_file_is_corruption() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("map");
        std::fs::write(&path, b"garbage that is long enough to pass the header check").unwrap();

        assert!(matches!(KeyIndex::open(&path), Err(StoreError::Corrupted { .. })));
    }
}
