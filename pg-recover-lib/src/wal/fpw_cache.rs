//! Full-page-write cache (spec §4.F "Full-page-write cache (on-disk,
//! per-filenode)", §5 concurrency model), reimplemented from the
//! `GlobalHashTable`/`SubHashTable` two-level structure in
//! `original_source/pg_walgettx.c`'s `FPW2File`/`FPWfromFile` family.
//!
//! In-memory: a global map keyed by filenode, each holding a
//! `Mutex`-guarded per-filenode map keyed by block number -- per-filenode
//! locks serialize within a filenode while leaving cross-filenode access
//! unsynchronized, as spec §5 requires. On-disk: each filenode gets a
//! data file (page images, appended or overwritten in place) and an
//! index file (`(block_number, file_offset)` pairs) so the scan can
//! resume after a restart.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::page::PAGE_SIZE;

/// One filenode's block → file-offset map plus its open data/index
/// file handles.
struct FilenodeShard {
    blocks: HashMap<u32, u64>,
    data_file: File,
    index_file: File,
}

impl FilenodeShard {
    fn open(cache_dir: &Path, filenode: u32) -> std::io::Result<FilenodeShard> {
        let data_path = cache_dir.join(format!("{filenode}.data"));
        let index_path = cache_dir.join(format!("{filenode}.index"));
        let mut index_file = OpenOptions::new().create(true).read(true).append(true).open(&index_path)?;
        let mut blocks = HashMap::new();

        // Reload the index so a restarted scan sees what was already
        // written (spec §5 "on any restart the index is reloaded from
        // disk before first access").
        let mut buf = Vec::new();
        index_file.seek(SeekFrom::Start(0))?;
        index_file.read_to_end(&mut buf)?;
        let mut i = 0;
        while i + 12 <= buf.len() {
            let block = u32::from_le_bytes(buf[i..i + 4].try_into().unwrap());
            let offset = i64::from_le_bytes(buf[i + 4..i + 12].try_into().unwrap());
            blocks.insert(block, offset as u64);
            i += 12;
        }

        let data_file = OpenOptions::new().create(true).read(true).write(true).open(&data_path)?;
        Ok(FilenodeShard { blocks, data_file, index_file })
    }

    fn get(&mut self, block_number: u32) -> std::io::Result<Option<Vec<u8>>> {
        let Some(&offset) = self.blocks.get(&block_number) else {
            return Ok(None);
        };
        let mut page = vec![0u8; PAGE_SIZE];
        self.data_file.seek(SeekFrom::Start(offset))?;
        self.data_file.read_exact(&mut page)?;
        Ok(Some(page))
    }

    fn put(&mut self, block_number: u32, page: &[u8]) -> std::io::Result<()> {
        debug_assert_eq!(page.len(), PAGE_SIZE);
        if let Some(&offset) = self.blocks.get(&block_number) {
            self.data_file.seek(SeekFrom::Start(offset))?;
            self.data_file.write_all(page)?;
            return Ok(());
        }
        let offset = self.data_file.seek(SeekFrom::End(0))?;
        self.data_file.write_all(page)?;
        self.blocks.insert(block_number, offset);

        self.index_file.seek(SeekFrom::End(0))?;
        self.index_file.write_all(&block_number.to_le_bytes())?;
        self.index_file.write_all(&(offset as i64).to_le_bytes())?;
        Ok(())
    }
}

/// The two-level cache: global map (filenode → shard), each shard
/// individually locked.
pub struct FpwCache {
    cache_dir: PathBuf,
    shards: Mutex<HashMap<u32, Mutex<FilenodeShard>>>,
}

impl FpwCache {
    pub fn open(cache_dir: impl Into<PathBuf>) -> std::io::Result<FpwCache> {
        let cache_dir = cache_dir.into();
        std::fs::create_dir_all(&cache_dir)?;
        Ok(FpwCache { cache_dir, shards: Mutex::new(HashMap::new()) })
    }

    fn with_shard<T>(&self, filenode: u32, f: impl FnOnce(&mut FilenodeShard) -> std::io::Result<T>) -> std::io::Result<T> {
        let mut global = self.shards.lock().unwrap();
        if !global.contains_key(&filenode) {
            let shard = FilenodeShard::open(&self.cache_dir, filenode)?;
            global.insert(filenode, Mutex::new(shard));
        }
        // Clone the Mutex reference out so we don't hold the global lock
        // while doing I/O on this filenode's shard -- other filenodes'
        // lookups can proceed concurrently (spec §5).
        let shard_lock = global.get(&filenode).unwrap();
        let mut shard = shard_lock.lock().unwrap();
        f(&mut shard)
    }

    /// Look up a cached page. A miss is not an error -- the caller treats
    /// it as "pre-image not available, skip this record" (spec §4.F).
    pub fn get(&self, filenode: u32, block_number: u32) -> std::io::Result<Option<Vec<u8>>> {
        self.with_shard(filenode, |shard| shard.get(block_number))
    }

    pub fn put(&self, filenode: u32, block_number: u32, page: &[u8]) -> std::io::Result<()> {
        self.with_shard(filenode, |shard| shard.put(block_number, page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_a_page_through_put_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FpwCache::open(dir.path()).unwrap();
        let page = vec![7u8; PAGE_SIZE];
        cache.put(16384, 3, &page).unwrap();
        let fetched = cache.get(16384, 3).unwrap().unwrap();
        assert_eq!(fetched, page);
    }

    #[test]
    fn miss_returns_none_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FpwCache::open(dir.path()).unwrap();
        assert!(cache.get(99, 0).unwrap().is_none());
    }

    #[test]
    fn overwrite_of_known_block_replaces_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FpwCache::open(dir.path()).unwrap();
        cache.put(1, 0, &vec![1u8; PAGE_SIZE]).unwrap();
        cache.put(1, 0, &vec![2u8; PAGE_SIZE]).unwrap();
        let fetched = cache.get(1, 0).unwrap().unwrap();
        assert_eq!(fetched, vec![2u8; PAGE_SIZE]);
    }

    #[test]
    fn reopening_cache_dir_reloads_index() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = FpwCache::open(dir.path()).unwrap();
            cache.put(5, 2, &vec![9u8; PAGE_SIZE]).unwrap();
        }
        let cache = FpwCache::open(dir.path()).unwrap();
        let fetched = cache.get(5, 2).unwrap().unwrap();
        assert_eq!(fetched, vec![9u8; PAGE_SIZE]);
    }
}
