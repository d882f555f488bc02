use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use memmap2::{MmapMut, MmapOptions};
use once_cell::sync::Lazy;

use crate::error::{CacheError, IoKind, Result};

static PAGE_SIZE: Lazy<usize> = Lazy::new(read_page_size);

#[cfg(unix)]
fn read_page_size() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n > 0 { n as usize } else { 4096 }
}

#[cfg(not(unix))]
fn read_page_size() -> usize {
    4096
}

/// The OS page size, queried once.
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// One mapped region of the table file, covering a whole number of entries.
/// The mapping stays alive for as long as any `ChunkHandle` clone does and is
/// unmapped when the last one drops.
pub struct ChunkMapping {
    ptr: *mut u8,
    len: usize,
    index: u32,
    mmap: MmapMut,
}

// Entry windows over one mapping never overlap, and every write goes through
// the owning table, which is only reachable behind its cache's state lock;
// `ptr` is derived from `mmap`, which lives alongside it.
unsafe impl Send for ChunkMapping {}
unsafe impl Sync for ChunkMapping {}

/// Reference-counted handle to a mapped chunk.
#[derive(Clone)]
pub struct ChunkHandle {
    mapping: Arc<ChunkMapping>,
}

impl ChunkHandle {
    pub fn index(&self) -> u32 {
        self.mapping.index
    }

    pub fn len(&self) -> usize {
        self.mapping.len
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.len == 0
    }

    /// Raw pointer to `len` bytes starting `offset` bytes into the chunk.
    /// Panics when the range falls outside the mapping.
    pub fn byte_range(&self, offset: usize, len: usize) -> *mut u8 {
        let end = offset.checked_add(len).expect("chunk range overflow");
        assert!(
            end <= self.mapping.len,
            "chunk range {offset}+{len} exceeds chunk of {} bytes",
            self.mapping.len
        );
        unsafe { self.mapping.ptr.add(offset) }
    }

    /// Schedule `len` bytes at `offset` for asynchronous writeback.
    pub(crate) fn flush_async(&self, offset: usize, len: usize) -> std::io::Result<()> {
        self.mapping.mmap.flush_async_range(offset, len)
    }
}

/// Lazily maps fixed-size chunks of the table file and tracks which are
/// currently live. Holds only weak references, so a chunk unmaps exactly when
/// the last outstanding handle is dropped.
pub struct ChunkMapper {
    path: PathBuf,
    file: File,
    chunk_bytes: usize,
    chunks: HashMap<u32, Weak<ChunkMapping>>,
}

impl ChunkMapper {
    pub fn open(path: &Path, chunk_bytes: usize) -> Result<ChunkMapper> {
        let file = Self::open_file(path)?;
        Ok(ChunkMapper {
            path: path.to_path_buf(),
            file,
            chunk_bytes,
            chunks: HashMap::new(),
        })
    }

    fn open_file(path: &Path) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| CacheError::io(IoKind::OpenFailed, path, e))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn map(&mut self, index: u32) -> Result<ChunkHandle> {
        if let Some(live) = self.chunks.get(&index).and_then(Weak::upgrade) {
            return Ok(ChunkHandle { mapping: live });
        }

        let start = index as u64 * self.chunk_bytes as u64;
        let end = start + self.chunk_bytes as u64;
        let file_len = self
            .file
            .metadata()
            .map_err(|e| CacheError::io(IoKind::ExtendFailed, &self.path, e))?
            .len();
        if file_len < end {
            self.file
                .set_len(end)
                .map_err(|e| CacheError::io(IoKind::ExtendFailed, &self.path, e))?;
        }

        let mut mmap = unsafe {
            MmapOptions::new()
                .offset(start)
                .len(self.chunk_bytes)
                .map_mut(&self.file)
        }
        .map_err(|e| CacheError::io(IoKind::MmapFailed, &self.path, e))?;

        let ptr = mmap.as_mut_ptr();
        let mapping = Arc::new(ChunkMapping {
            ptr,
            len: self.chunk_bytes,
            index,
            mmap,
        });
        self.chunks.retain(|_, weak| weak.strong_count() > 0);
        self.chunks.insert(index, Arc::downgrade(&mapping));
        Ok(ChunkHandle { mapping })
    }

    /// Outstanding handles for one chunk; zero once it has been unmapped.
    pub fn refcount(&self, index: u32) -> usize {
        self.chunks
            .get(&index)
            .map(Weak::strong_count)
            .unwrap_or(0)
    }

    pub fn mapped_chunk_count(&self) -> usize {
        self.chunks
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Forget all mappings and recreate an empty backing file. Outstanding
    /// handles keep their (now orphaned) mappings alive until dropped.
    pub fn reset(&mut self) -> Result<()> {
        self.chunks.clear();
        let _ = std::fs::remove_file(&self.path);
        self.file = Self::open_file(&self.path)?;
        Ok(())
    }
}
