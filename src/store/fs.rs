//! Filesystem-backed directory.
//!
//! Outputs buffer writes (1 KiB) and keep a running CRC-32. Inputs use
//! positional reads over a shared descriptor, so `dup` costs nothing;
//! `reopen` draws an independent descriptor from a bounded per-input
//! pool (a fresh one is opened when the pool is exhausted).

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use tracing::warn;

use crate::error::{Error, Result};
use crate::store::{
    DataInput, DataOutput, Directory, FileRefs, IndexInput, IndexLock, IndexOutput, IoAdvice,
};

const OUTPUT_BUFFER: usize = 1024;
const INPUT_BUFFER: usize = 1024;
const DEFAULT_POOL_SIZE: usize = 8;

/// Directory rooted at a filesystem path.
#[derive(Clone)]
pub struct FsDirectory {
    root: PathBuf,
    pool_size: usize,
    refs: Arc<FileRefs>,
}

impl FsDirectory {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self::with_pool_size(root, DEFAULT_POOL_SIZE)
    }

    /// `pool_size` bounds the descriptor pool each opened input carries
    /// for `reopen`.
    pub fn with_pool_size(root: impl AsRef<Path>, pool_size: usize) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            pool_size: pool_size.max(1),
            refs: Arc::new(FileRefs::default()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl Directory for FsDirectory {
    fn create(&self, name: &str) -> Result<Box<dyn IndexOutput>> {
        std::fs::create_dir_all(&self.root)?;
        let file = File::create(self.resolve(name))?;
        Ok(Box::new(FsOutput {
            name: name.to_string(),
            file: Some(file),
            buf: Vec::with_capacity(OUTPUT_BUFFER),
            written: 0,
            crc: crc32fast::Hasher::new(),
        }))
    }

    fn open(&self, name: &str, advice: IoAdvice) -> Result<Box<dyn IndexInput>> {
        let path = self.resolve(name);
        let handle = FileHandle::open(&path)?;
        let pool = Arc::new(HandlePool {
            path,
            advice,
            capacity: self.pool_size,
            slots: Mutex::new(Vec::new()),
        });
        Ok(Box::new(FsInput {
            handle: Arc::new(handle),
            pool,
            pooled: false,
            pos: 0,
            window: Vec::new(),
            window_start: 0,
        }))
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.resolve(name).is_file())
    }

    fn length(&self, name: &str) -> Result<u64> {
        Ok(std::fs::metadata(self.resolve(name))?.len())
    }

    fn mtime(&self, name: &str) -> Result<SystemTime> {
        Ok(std::fs::metadata(self.resolve(name))?.modified()?)
    }

    fn remove(&self, name: &str) -> Result<()> {
        std::fs::remove_file(self.resolve(name))?;
        Ok(())
    }

    fn rename(&self, src: &str, dst: &str) -> Result<()> {
        std::fs::rename(self.resolve(src), self.resolve(dst))?;
        Ok(())
    }

    fn sync(&self, name: &str) -> Result<()> {
        let file = File::open(self.resolve(name))?;
        file.sync_all()?;
        Ok(())
    }

    fn visit(&self, visitor: &mut dyn FnMut(&str) -> bool) -> Result<()> {
        if !self.root.is_dir() {
            return Ok(());
        }
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !visitor(name) {
                    break;
                }
            }
        }
        Ok(())
    }

    fn make_lock(&self, name: &str) -> Result<Box<dyn IndexLock>> {
        Ok(Box::new(FsLock {
            dir: self.root.clone(),
            path: self.resolve(name),
            handle: None,
        }))
    }

    fn file_refs(&self) -> &Arc<FileRefs> {
        &self.refs
    }
}

struct FsOutput {
    name: String,
    file: Option<File>,
    buf: Vec<u8>,
    written: u64,
    crc: crc32fast::Hasher,
}

impl FsOutput {
    fn flush_buffer(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::io("output already closed"))?;
        file.write_all(&self.buf)?;
        self.buf.clear();
        Ok(())
    }
}

impl DataOutput for FsOutput {
    fn write_byte(&mut self, b: u8) -> Result<()> {
        self.write_bytes(&[b])
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if self.file.is_none() {
            return Err(Error::io(format!("write after close: {}", self.name)));
        }
        self.crc.update(bytes);
        self.written += bytes.len() as u64;
        if self.buf.len() + bytes.len() > OUTPUT_BUFFER {
            self.flush_buffer()?;
        }
        if bytes.len() >= OUTPUT_BUFFER {
            self.file.as_mut().unwrap().write_all(bytes)?;
        } else {
            self.buf.extend_from_slice(bytes);
        }
        Ok(())
    }
}

impl IndexOutput for FsOutput {
    fn file_pointer(&self) -> u64 {
        self.written
    }

    fn checksum(&mut self) -> Result<u32> {
        self.flush()?;
        Ok(self.crc.clone().finalize())
    }

    fn flush(&mut self) -> Result<()> {
        self.flush_buffer()?;
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.file.is_none() {
            return Ok(());
        }
        self.flush()?;
        self.file = None;
        Ok(())
    }
}

impl Drop for FsOutput {
    fn drop(&mut self) {
        if self.file.is_some() {
            if let Err(err) = self.close() {
                warn!(name = %self.name, %err, "failed to close output on drop");
            }
        }
    }
}

#[derive(Debug)]
struct FileHandle {
    file: File,
    len: u64,
}

impl FileHandle {
    fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }

    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        use std::os::unix::fs::FileExt;
        Ok(self.file.read_at(buf, offset)?)
    }

    #[cfg(windows)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        use std::os::windows::fs::FileExt;
        Ok(self.file.seek_read(buf, offset)?)
    }
}

#[derive(Debug)]
struct HandlePool {
    path: PathBuf,
    #[allow(dead_code)]
    advice: IoAdvice,
    capacity: usize,
    slots: Mutex<Vec<Arc<FileHandle>>>,
}

impl HandlePool {
    fn acquire(&self) -> Result<Arc<FileHandle>> {
        if let Some(handle) = self.slots.lock().pop() {
            return Ok(handle);
        }
        Ok(Arc::new(FileHandle::open(&self.path)?))
    }

    fn release(&self, handle: Arc<FileHandle>) {
        let mut slots = self.slots.lock();
        if slots.len() < self.capacity {
            slots.push(handle);
        }
    }
}

#[derive(Debug)]
struct FsInput {
    handle: Arc<FileHandle>,
    pool: Arc<HandlePool>,
    /// Handle was drawn from the pool and goes back on drop.
    pooled: bool,
    pos: u64,
    window: Vec<u8>,
    window_start: u64,
}

impl FsInput {
    fn fill_window(&mut self) -> Result<()> {
        let want = INPUT_BUFFER.min((self.handle.len - self.pos) as usize);
        if want == 0 {
            return Err(Error::eof("read past end of file"));
        }
        self.window.resize(want, 0);
        let mut filled = 0;
        while filled < want {
            let n = self.handle.read_at(&mut self.window[filled..], self.pos + filled as u64)?;
            if n == 0 {
                return Err(Error::eof("short read"));
            }
            filled += n;
        }
        self.window_start = self.pos;
        Ok(())
    }

    fn window_contains(&self, pos: u64) -> bool {
        pos >= self.window_start && pos < self.window_start + self.window.len() as u64
    }
}

impl DataInput for FsInput {
    fn read_byte(&mut self) -> Result<u8> {
        if !self.window_contains(self.pos) {
            if self.pos >= self.handle.len {
                return Err(Error::eof("read past end of file"));
            }
            self.fill_window()?;
        }
        let b = self.window[(self.pos - self.window_start) as usize];
        self.pos += 1;
        Ok(b)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        if self.pos + buf.len() as u64 > self.handle.len {
            return Err(Error::eof("read past end of file"));
        }
        // serve from the buffered window when possible
        if self.window_contains(self.pos)
            && self.window_contains(self.pos + buf.len().saturating_sub(1) as u64)
        {
            let start = (self.pos - self.window_start) as usize;
            buf.copy_from_slice(&self.window[start..start + buf.len()]);
            self.pos += buf.len() as u64;
            return Ok(());
        }
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.handle.read_at(&mut buf[filled..], self.pos)?;
            if n == 0 {
                return Err(Error::eof("short read"));
            }
            filled += n;
            self.pos += n as u64;
        }
        Ok(())
    }
}

impl IndexInput for FsInput {
    fn len(&self) -> u64 {
        self.handle.len
    }

    fn file_pointer(&self) -> u64 {
        self.pos
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        if pos > self.handle.len {
            return Err(Error::io(format!(
                "seek out of range: {pos} > {}",
                self.handle.len
            )));
        }
        self.pos = pos;
        Ok(())
    }

    fn dup(&self) -> Result<Box<dyn IndexInput>> {
        Ok(Box::new(FsInput {
            handle: Arc::clone(&self.handle),
            pool: Arc::clone(&self.pool),
            pooled: false,
            pos: self.pos,
            window: Vec::new(),
            window_start: 0,
        }))
    }

    fn reopen(&self) -> Result<Box<dyn IndexInput>> {
        let handle = self.pool.acquire()?;
        Ok(Box::new(FsInput {
            handle,
            pool: Arc::clone(&self.pool),
            pooled: true,
            pos: 0,
            window: Vec::new(),
            window_start: 0,
        }))
    }
}

impl Drop for FsInput {
    fn drop(&mut self) {
        if self.pooled {
            self.pool.release(Arc::clone(&self.handle));
        }
    }
}

struct FsLock {
    dir: PathBuf,
    path: PathBuf,
    handle: Option<File>,
}

impl IndexLock for FsLock {
    fn lock(&mut self) -> Result<bool> {
        if self.handle.is_some() {
            // no self re-acquisition
            return Ok(false);
        }
        std::fs::create_dir_all(&self.dir)?;
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => {
                self.handle = Some(file);
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(Error::Lock(format!(
                "failed to create lock file {}: {err}",
                self.path.display()
            ))),
        }
    }

    fn is_locked(&self) -> Result<bool> {
        Ok(self.handle.is_some() || self.path.is_file())
    }

    fn unlock(&mut self) -> Result<bool> {
        if self.handle.take().is_none() {
            return Ok(false);
        }
        std::fs::remove_file(&self.path)
            .map_err(|err| Error::Lock(format!("failed to remove lock file: {err}")))?;
        Ok(true)
    }
}

impl Drop for FsLock {
    fn drop(&mut self) {
        if self.handle.take().is_some() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
