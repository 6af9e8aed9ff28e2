use crate::storage::block::BlockId;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageBuffer;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Files whose names start with this prefix are scratch materializations left
/// behind by other subsystems (e.g. external sort runs) and are purged when
/// the manager starts.
const TEMP_PREFIX: &str = "temp";

/// Performs the primitive block I/O that every higher layer builds on.
///
/// Each named stream or table is one flat file under the storage directory,
/// and a block's byte offset is `block number * block size`. `read`, `write`
/// and `append` are serialized through a single manager-wide lock, so at most
/// one of them runs at a time across the whole manager; finer-grained
/// concurrency is the buffer pool's job, not this layer's.
///
/// File handles are opened lazily, cached per filename, and held until the
/// manager is dropped.
pub struct BlockManager {
    db_directory: PathBuf,
    block_size: usize,
    is_new: bool,
    open_files: DashMap<String, Arc<File>>,
    io_lock: Mutex<()>,
}

impl BlockManager {
    /// Open the storage directory, creating it if it does not exist yet, and
    /// purge leftover `temp*` files so every subsystem starts from a clean
    /// slate.
    pub fn new(db_directory: &Path, block_size: usize) -> StorageResult<Self> {
        let db_directory = db_directory.to_path_buf();
        let is_new = !db_directory.exists();

        if is_new {
            fs::create_dir_all(&db_directory).map_err(|source| StorageError::CreateDirectory {
                path: db_directory.clone(),
                source,
            })?;
        }

        let entries = fs::read_dir(&db_directory).map_err(|source| StorageError::ScanDirectory {
            path: db_directory.clone(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| StorageError::ScanDirectory {
                path: db_directory.clone(),
                source,
            })?;
            if entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                fs::remove_file(entry.path()).map_err(|source| StorageError::RemoveTemp {
                    path: entry.path(),
                    source,
                })?;
            }
        }

        Ok(Self {
            db_directory,
            block_size,
            is_new,
            open_files: DashMap::new(),
            io_lock: Mutex::new(()),
        })
    }

    /// Read the given block into `page`.
    ///
    /// On success the buffer holds the exact on-disk bytes of the block. If
    /// the file ends inside the block, the unread tail is zero-filled to
    /// match the contents of an unwritten gap.
    pub fn read(&self, block: &BlockId, page: &mut PageBuffer) -> StorageResult<()> {
        self.check_page_size(page.size())?;
        let _io = self.io_lock.lock();

        let file = self.file_for(block.filename())?;
        let offset = self.block_offset(block);
        read_block_at(&file, offset, page.contents_mut()).map_err(|source| {
            StorageError::ReadBlock {
                block: block.clone(),
                source,
            }
        })
    }

    /// Write `page` to the given block.
    ///
    /// The bytes are forced to disk before this returns; the manager never
    /// batches writes. Writing past end-of-file implicitly zero-fills the
    /// gap; callers must not rely on reading the gap before writing it.
    pub fn write(&self, block: &BlockId, page: &PageBuffer) -> StorageResult<()> {
        self.check_page_size(page.size())?;
        let _io = self.io_lock.lock();

        let file = self.file_for(block.filename())?;
        let offset = self.block_offset(block);
        write_block_at(&file, offset, page.contents()).map_err(|source| {
            StorageError::WriteBlock {
                block: block.clone(),
                source,
            }
        })
    }

    /// Allocate one new zero-filled block at the end of `filename` and return
    /// its id.
    ///
    /// The length-then-write sequence runs entirely under the manager-wide
    /// lock, so two concurrent appends never produce the same block number.
    pub fn append(&self, filename: &str) -> StorageResult<BlockId> {
        let _io = self.io_lock.lock();

        let file = self.file_for(filename)?;
        let number = self
            .block_count(&file)
            .map_err(|source| StorageError::FileLength {
                filename: filename.to_string(),
                source,
            })?;
        let block = BlockId::new(filename, number);

        let zeros = vec![0u8; self.block_size];
        write_block_at(&file, self.block_offset(&block), &zeros).map_err(|source| {
            StorageError::AppendBlock {
                block: block.clone(),
                source,
            }
        })?;
        Ok(block)
    }

    /// Current number of blocks in `filename`.
    ///
    /// Deliberately not serialized with the I/O lock: a call racing an
    /// in-flight `append` on the same file may observe either the old or the
    /// new count.
    pub fn length(&self, filename: &str) -> StorageResult<u64> {
        let file = self.file_for(filename)?;
        self.block_count(&file)
            .map_err(|source| StorageError::FileLength {
                filename: filename.to_string(),
                source,
            })
    }

    /// True iff the storage directory did not exist before this manager was
    /// constructed.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Resolve the cached handle for `filename`, opening (and creating) the
    /// backing file on first access. Handles are never closed while the
    /// manager is alive.
    fn file_for(&self, filename: &str) -> StorageResult<Arc<File>> {
        if let Some(file) = self.open_files.get(filename) {
            return Ok(file.value().clone());
        }

        let path = self.db_directory.join(filename);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|source| StorageError::OpenFile {
                filename: filename.to_string(),
                source,
            })?;

        // Insert through the entry API so a racing open of the same filename
        // still leaves exactly one cached handle.
        Ok(self
            .open_files
            .entry(filename.to_string())
            .or_insert(Arc::new(file))
            .value()
            .clone())
    }

    fn block_count(&self, file: &File) -> io::Result<u64> {
        Ok(file.metadata()?.len() / self.block_size as u64)
    }

    fn block_offset(&self, block: &BlockId) -> u64 {
        block.number() * self.block_size as u64
    }

    fn check_page_size(&self, actual: usize) -> StorageResult<()> {
        if actual != self.block_size {
            return Err(StorageError::PageSizeMismatch {
                expected: self.block_size,
                actual,
            });
        }
        Ok(())
    }
}

fn read_block_at(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    let mut f: &File = file;
    f.seek(SeekFrom::Start(offset))?;

    let mut filled = 0;
    while filled < buf.len() {
        match f.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    buf[filled..].fill(0);
    Ok(())
}

fn write_block_at(file: &File, offset: u64, buf: &[u8]) -> io::Result<()> {
    let mut f: &File = file;
    f.seek(SeekFrom::Start(offset))?;
    f.write_all(buf)?;
    f.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;

    const BLOCK_SIZE: usize = 512;

    #[test]
    fn test_round_trip() -> Result<()> {
        let dir = tempdir()?;
        let manager = BlockManager::new(dir.path(), BLOCK_SIZE)?;
        let block = manager.append("users.tbl")?;

        let mut page = PageBuffer::new(BLOCK_SIZE);
        page.contents_mut()[0] = 42;
        page.contents_mut()[100] = 99;
        page.contents_mut()[BLOCK_SIZE - 1] = 255;
        manager.write(&block, &page)?;

        let mut out = PageBuffer::new(BLOCK_SIZE);
        manager.read(&block, &mut out)?;
        assert_eq!(out.contents(), page.contents());

        Ok(())
    }

    #[test]
    fn test_sequential_append() -> Result<()> {
        let dir = tempdir()?;
        let manager = BlockManager::new(dir.path(), BLOCK_SIZE)?;

        for expected in 0..8 {
            let block = manager.append("log")?;
            assert_eq!(block.filename(), "log");
            assert_eq!(block.number(), expected);
        }
        assert_eq!(manager.length("log")?, 8);

        Ok(())
    }

    #[test]
    fn test_append_zero_fills_new_block() -> Result<()> {
        let dir = tempdir()?;
        let manager = BlockManager::new(dir.path(), BLOCK_SIZE)?;
        let block = manager.append("users.tbl")?;

        let mut page = PageBuffer::new(BLOCK_SIZE);
        page.contents_mut().fill(0xaa);
        manager.read(&block, &mut page)?;
        assert!(page.contents().iter().all(|&b| b == 0));

        Ok(())
    }

    #[test]
    fn test_is_new_then_reopened() -> Result<()> {
        let dir = tempdir()?;
        let db_path = dir.path().join("db");

        let first = BlockManager::new(&db_path, BLOCK_SIZE)?;
        assert!(first.is_new());
        assert!(db_path.is_dir());
        drop(first);

        let second = BlockManager::new(&db_path, BLOCK_SIZE)?;
        assert!(!second.is_new());

        Ok(())
    }

    #[test]
    fn test_temp_files_purged_on_startup() -> Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join("tempsort1"), b"scratch")?;
        fs::write(dir.path().join("temp"), b"scratch")?;
        fs::write(dir.path().join("users.tbl"), b"keep")?;

        let _manager = BlockManager::new(dir.path(), BLOCK_SIZE)?;

        assert!(!dir.path().join("tempsort1").exists());
        assert!(!dir.path().join("temp").exists());
        assert!(dir.path().join("users.tbl").exists());

        Ok(())
    }

    #[test]
    fn test_block_size_is_stable() -> Result<()> {
        let dir = tempdir()?;
        let manager = BlockManager::new(dir.path(), BLOCK_SIZE)?;

        assert_eq!(manager.block_size(), BLOCK_SIZE);
        manager.append("users.tbl")?;
        assert_eq!(manager.block_size(), BLOCK_SIZE);

        Ok(())
    }

    #[test]
    fn test_mis_sized_buffer_is_rejected() -> Result<()> {
        let dir = tempdir()?;
        let manager = BlockManager::new(dir.path(), BLOCK_SIZE)?;
        let block = manager.append("users.tbl")?;

        let mut small = PageBuffer::new(BLOCK_SIZE - 1);
        assert!(matches!(
            manager.read(&block, &mut small),
            Err(StorageError::PageSizeMismatch { .. })
        ));

        let large = PageBuffer::new(BLOCK_SIZE + 1);
        assert!(matches!(
            manager.write(&block, &large),
            Err(StorageError::PageSizeMismatch { .. })
        ));
        assert_eq!(manager.length("users.tbl")?, 1);

        Ok(())
    }

    #[test]
    fn test_write_past_eof_zero_fills_gap() -> Result<()> {
        let dir = tempdir()?;
        let manager = BlockManager::new(dir.path(), BLOCK_SIZE)?;

        let mut page = PageBuffer::new(BLOCK_SIZE);
        page.contents_mut().fill(7);
        manager.write(&BlockId::new("users.tbl", 5), &page)?;
        assert_eq!(manager.length("users.tbl")?, 6);

        let mut gap = PageBuffer::new(BLOCK_SIZE);
        gap.contents_mut().fill(0xaa);
        manager.read(&BlockId::new("users.tbl", 2), &mut gap)?;
        assert!(gap.contents().iter().all(|&b| b == 0));

        Ok(())
    }

    #[test]
    fn test_read_past_eof_yields_zeros() -> Result<()> {
        let dir = tempdir()?;
        let manager = BlockManager::new(dir.path(), BLOCK_SIZE)?;
        manager.append("users.tbl")?;

        let mut page = PageBuffer::new(BLOCK_SIZE);
        page.contents_mut().fill(0xaa);
        manager.read(&BlockId::new("users.tbl", 9), &mut page)?;
        assert!(page.contents().iter().all(|&b| b == 0));

        Ok(())
    }

    #[test]
    fn test_adjacent_blocks_do_not_overlap() -> Result<()> {
        let dir = tempdir()?;
        let manager = BlockManager::new(dir.path(), BLOCK_SIZE)?;
        let first = manager.append("users.tbl")?;
        let second = manager.append("users.tbl")?;

        let mut page = PageBuffer::new(BLOCK_SIZE);
        page.contents_mut().fill(1);
        manager.write(&first, &page)?;
        page.contents_mut().fill(2);
        manager.write(&second, &page)?;

        let mut out = PageBuffer::new(BLOCK_SIZE);
        manager.read(&first, &mut out)?;
        assert!(out.contents().iter().all(|&b| b == 1));
        manager.read(&second, &mut out)?;
        assert!(out.contents().iter().all(|&b| b == 2));

        Ok(())
    }

    #[test]
    fn test_files_are_independent() -> Result<()> {
        let dir = tempdir()?;
        let manager = BlockManager::new(dir.path(), BLOCK_SIZE)?;

        manager.append("users.tbl")?;
        manager.append("users.tbl")?;
        manager.append("orders.tbl")?;

        assert_eq!(manager.length("users.tbl")?, 2);
        assert_eq!(manager.length("orders.tbl")?, 1);

        Ok(())
    }

    #[test]
    fn test_length_of_untouched_file_is_zero() -> Result<()> {
        let dir = tempdir()?;
        let manager = BlockManager::new(dir.path(), BLOCK_SIZE)?;
        assert_eq!(manager.length("users.tbl")?, 0);

        Ok(())
    }

    #[test]
    fn test_typed_values_survive_disk_round_trip() -> Result<()> {
        let dir = tempdir()?;
        let manager = BlockManager::new(dir.path(), BLOCK_SIZE)?;
        let block = manager.append("users.tbl")?;

        let mut page = PageBuffer::new(BLOCK_SIZE);
        page.set_u32(0, 1234)?;
        let pos = PageBuffer::max_len("abcdefghij".len());
        page.set_string(4, "abcdefghij")?;
        page.set_u32(4 + pos, 5678)?;
        manager.write(&block, &page)?;

        let mut out = PageBuffer::new(BLOCK_SIZE);
        manager.read(&block, &mut out)?;
        assert_eq!(out.get_u32(0)?, 1234);
        assert_eq!(out.get_string(4)?, "abcdefghij");
        assert_eq!(out.get_u32(4 + pos)?, 5678);

        Ok(())
    }
}
