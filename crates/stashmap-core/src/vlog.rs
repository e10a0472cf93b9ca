//! Append-only value log
//!
//! Serialized values live in a single append-only file at `<base>.values`.
//! Each append produces a chunk; incremental appends for the same key chain
//! onto the previous chunk instead of rewriting the whole value. An address
//! is simply the file offset of a chunk; 0 is the null address (no chunk can
//! start there because of the file header).
//!
//! Chunk format: [payload_len u32 LE][crc32c u32 LE][prev u64 LE][payload]
//!
//! Reading walks the `prev` chain and concatenates oldest-first. When a read
//! touches a multi-chunk chain, the merged value is re-appended as a single
//! chunk and the new address is returned, so the caller can repoint its index
//! record and account the stale chain as garbage. Compaction mode suppresses
//! that relocation while the old log is being drained.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{StoreError, StoreResult};
use crate::platform_durability::durable_sync;

/// Magic bytes at the start of every value log file
const MAGIC: [u8; 4] = *b"SVLG";

/// On-disk format version
const VERSION: u32 = 1;

/// File header size in bytes (magic + version)
const FILE_HEADER_SIZE: u64 = 8;

/// Chunk header size in bytes
const CHUNK_HEADER_SIZE: u64 = 16;

/// The null address: no chunk ever starts at offset 0.
pub const NULL_ADDR: u64 = 0;

/// Outcome of reading a value: the bytes plus the address they now live at.
/// The address differs from the requested one when the read merged a chunk
/// chain into a fresh single chunk.
#[derive(Debug)]
pub struct ReadResult {
    pub data: Vec<u8>,
    pub addr: u64,
}

/// Append-only chunked log of serialized values.
pub struct ValueLog {
    file: File,
    path: PathBuf,
    size: u64,
    compaction_mode: bool,
}

impl ValueLog {
    /// Open or create the log at `path`. An existing file must carry a valid
    /// header; anything else is reported as corruption, not raw I/O.
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
                message: format!("Failed to open value log: {}", e),
            })?;

        let len = file
            .metadata()
            .map_err(|e| StoreError::Io {
                path: Some(path.clone()),
                kind: e.kind(),
                message: format!("Failed to stat value log: {}", e),
            })?
            .len();

        if len == 0 {
            let mut header = [0u8; FILE_HEADER_SIZE as usize];
            header[0..4].copy_from_slice(&MAGIC);
            header[4..8].copy_from_slice(&VERSION.to_le_bytes());
            file.write_all(&header).map_err(|e| StoreError::Io {
                path: Some(path.clone()),
                kind: e.kind(),
                message: format!("Failed to write value log header: {}", e),
            })?;
            return Ok(Self { file, path, size: FILE_HEADER_SIZE, compaction_mode: false });
        }

        if len < FILE_HEADER_SIZE {
            return Err(StoreError::Corrupted {
                path,
                reason: format!("value log shorter than its header: {} bytes", len),
            });
        }

        let mut header = [0u8; FILE_HEADER_SIZE as usize];
        file.seek(SeekFrom::Start(0)).map_err(|e| StoreError::Io {
            path: Some(path.clone()),
            kind: e.kind(),
            message: format!("Value log seek failed: {}", e),
        })?;
        file.read_exact(&mut header).map_err(|e| StoreError::Io {
            path: Some(path.clone()),
            kind: e.kind(),
            message: format!("Failed to read value log header: {}", e),
        })?;
        if header[0..4] != MAGIC {
            return Err(StoreError::Corrupted {
                path,
                reason: "value log magic bytes not found".to_string(),
            });
        }
        let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if version != VERSION {
            return Err(StoreError::Corrupted {
                path,
                reason: format!("unsupported value log version {}", version),
            });
        }

        Ok(Self { file, path, size: len, compaction_mode: false })
    }

    /// Current log size in bytes. New records land at this offset.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a chunk carrying `bytes`, chained onto `prev` (NULL_ADDR for a
    /// fresh value). Returns the new chunk's address.
    pub fn append(&mut self, bytes: &[u8], prev: u64) -> StoreResult<u64> {
        let offset = self.size;
        let checksum = crc32c::crc32c(bytes);

        let mut buf = Vec::with_capacity(CHUNK_HEADER_SIZE as usize + bytes.len());
        buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        buf.extend_from_slice(&checksum.to_le_bytes());
        buf.extend_from_slice(&prev.to_le_bytes());
        buf.extend_from_slice(bytes);

        // Reads seek around the file, so position explicitly at the tail.
        self.file.seek(SeekFrom::Start(offset)).map_err(|e| StoreError::Io {
            path: Some(self.path.clone()),
            kind: e.kind(),
            message: format!("Value log seek failed: {}", e),
        })?;
        self.file.write_all(&buf).map_err(|e| StoreError::Io {
            path: Some(self.path.clone()),
            kind: e.kind(),
            message: format!("Value log append failed: {}", e),
        })?;

        self.size += buf.len() as u64;
        Ok(offset)
    }

    /// Read the value whose newest chunk lives at `addr`.
    pub fn read(&mut self, addr: u64) -> StoreResult<ReadResult> {
        let mut chunks: Vec<Vec<u8>> = Vec::new();
        let mut current = addr;

        while current != NULL_ADDR {
            let (payload, prev) = self.read_chunk(current)?;
            chunks.push(payload);
            if prev != NULL_ADDR && prev >= current {
                return Err(StoreError::LogCorrupted {
                    path: self.path.clone(),
                    offset: current,
                    reason: format!("chunk chain does not go backwards: prev {}", prev),
                });
            }
            current = prev;
        }

        // Chunks were collected newest-first; the value reads oldest-first.
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        let mut data = Vec::with_capacity(total);
        for chunk in chunks.iter().rev() {
            data.extend_from_slice(chunk);
        }

        if chunks.len() > 1 && !self.compaction_mode {
            // Merge the chain into one chunk at the tail so the next read is
            // a single seek. The caller persists the moved address and counts
            // the stale chain as garbage.
            let new_addr = self.append(&data, NULL_ADDR)?;
            return Ok(ReadResult { data, addr: new_addr });
        }

        Ok(ReadResult { data, addr })
    }

    /// Read one chunk's payload and chain pointer, verifying bounds and crc.
    fn read_chunk(&mut self, addr: u64) -> StoreResult<(Vec<u8>, u64)> {
        if addr < FILE_HEADER_SIZE || addr + CHUNK_HEADER_SIZE > self.size {
            return Err(StoreError::LogCorrupted {
                path: self.path.clone(),
                offset: addr,
                reason: format!("chunk address out of bounds (log size {})", self.size),
            });
        }

        self.file.seek(SeekFrom::Start(addr)).map_err(|e| StoreError::Io {
            path: Some(self.path.clone()),
            kind: e.kind(),
            message: format!("Value log seek failed: {}", e),
        })?;

        let mut header = [0u8; CHUNK_HEADER_SIZE as usize];
        self.file.read_exact(&mut header).map_err(|e| StoreError::Io {
            path: Some(self.path.clone()),
            kind: e.kind(),
            message: format!("Failed to read chunk header at offset {}: {}", addr, e),
        })?;

        let payload_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as u64;
        let checksum = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let prev = u64::from_le_bytes([
            header[8], header[9], header[10], header[11],
            header[12], header[13], header[14], header[15],
        ]);

        if addr + CHUNK_HEADER_SIZE + payload_len > self.size {
            return Err(StoreError::LogCorrupted {
                path: self.path.clone(),
                offset: addr,
                reason: format!("chunk payload of {} bytes exceeds log size {}", payload_len, self.size),
            });
        }

        let mut payload = vec![0u8; payload_len as usize];
        self.file.read_exact(&mut payload).map_err(|e| StoreError::Io {
            path: Some(self.path.clone()),
            kind: e.kind(),
            message: format!("Failed to read chunk payload at offset {}: {}", addr, e),
        })?;

        let computed = crc32c::crc32c(&payload);
        if computed != checksum {
            return Err(StoreError::ChecksumMismatch {
                path: self.path.clone(),
                expected: checksum,
                actual: computed,
                offset: addr,
            });
        }

        Ok((payload, prev))
    }

    /// Stop merging chunk chains on read. Set for the duration of a
    /// compaction pass so draining the old log does not grow it.
    pub fn switch_to_compaction_mode(&mut self) {
        self.compaction_mode = true;
    }

    /// Sync all appended data to persistent storage.
    pub fn force(&self) -> StoreResult<()> {
        durable_sync(&self.file).map_err(|e| StoreError::Io {
            path: Some(self.path.clone()),
            kind: e.kind(),
            message: format!("Value log durable_sync failed: {}", e),
        })
    }

    /// Sync and release the file handle.
    pub fn dispose(self) -> StoreResult<()> {
        self.force()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_log(dir: &TempDir) -> ValueLog {
        ValueLog::open(dir.path().join("map.values")).unwrap()
    }

    #[test]
    fn test_append_read_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let mut log = open_log(&tmp);

        let addr = log.append(b"hello value", NULL_ADDR).unwrap();
        assert!(addr >= FILE_HEADER_SIZE);

        let result = log.read(addr).unwrap();
        assert_eq!(result.data, b"hello value");
        assert_eq!(result.addr, addr);
    }

    #[test]
    fn test_chained_read_concatenates_and_relocates() {
        let tmp = TempDir::new().unwrap();
        let mut log = open_log(&tmp);

        let a = log.append(b"first-", NULL_ADDR).unwrap();
        let b = log.append(b"second-", a).unwrap();
        let c = log.append(b"third", b).unwrap();

        let result = log.read(c).unwrap();
        assert_eq!(result.data, b"first-second-third");
        // The chain was merged into a fresh chunk past the old tail.
        assert!(result.addr > c);

        // Reading the merged chunk again is stable.
        let again = log.read(result.addr).unwrap();
        assert_eq!(again.data, b"first-second-third");
        assert_eq!(again.addr, result.addr);
    }

    #[test]
    fn test_compaction_mode_suppresses_relocation() {
        let tmp = TempDir::new().unwrap();
        let mut log = open_log(&tmp);

        let a = log.append(b"one", NULL_ADDR).unwrap();
        let b = log.append(b"two", a).unwrap();

        log.switch_to_compaction_mode();
        let size_before = log.size();
        let result = log.read(b).unwrap();
        assert_eq!(result.data, b"onetwo");
        assert_eq!(result.addr, b);
        assert_eq!(log.size(), size_before);
    }

    #[test]
    fn test_reopen_preserves_data() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("map.values");

        let addr = {
            let mut log = ValueLog::open(&path).unwrap();
            let addr = log.append(b"durable bytes", NULL_ADDR).unwrap();
            log.dispose().unwrap();
            addr
        };

        let mut log = ValueLog::open(&path).unwrap();
        let result = log.read(addr).unwrap();
        assert_eq!(result.data, b"durable bytes");
    }

    #[test]
    fn test_corrupt_payload_detected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("map.values");

        let addr = {
            let mut log = ValueLog::open(&path).unwrap();
            let addr = log.append(b"payload under test", NULL_ADDR).unwrap();
            log.dispose().unwrap();
            addr
        };

        // Flip a payload byte on disk.
        {
            let mut file = OpenOptions::new().write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(addr + CHUNK_HEADER_SIZE + 2)).unwrap();
            file.write_all(&[0xFF]).unwrap();
        }

        let mut log = ValueLog::open(&path).unwrap();
        assert!(matches!(log.read(addr), Err(StoreError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_out_of_bounds_address_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut log = open_log(&tmp);
        log.append(b"x", NULL_ADDR).unwrap();

        assert!(matches!(log.read(3), Err(StoreError::LogCorrupted { .. })));
        assert!(matches!(log.read(1 << 40), Err(StoreError::LogCorrupted { .. })));
    }

    #[test]
    fn test_bad_magic_is_corruption() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("map.values");
        std::fs::write(&path, b"not a value log at all").unwrap();

        assert!(matches!(ValueLog::open(&path), Err(StoreError::Corrupted { .. })));
    }

    #[test]
    fn test_size_tracks_appends() {
        let tmp = TempDir::new().unwrap();
        let mut log = open_log(&tmp);
        assert_eq!(log.size(), FILE_HEADER_SIZE);

        log.append(b"abcd", NULL_ADDR).unwrap();
        assert_eq!(log.size(), FILE_HEADER_SIZE + CHUNK_HEADER_SIZE + 4);
    }
}
