//! Memory-mapped directory variant.
//!
//! Reads are served straight from a shared mapping; writes, locking and
//! namespace operations delegate to the filesystem implementation.

use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use memmap2::Mmap;

use crate::error::{Error, Result};
use crate::store::{
    DataInput, Directory, FileRefs, FsDirectory, IndexInput, IndexLock, IndexOutput, IoAdvice,
};

/// Directory whose inputs are backed by `mmap`.
#[derive(Clone)]
pub struct MmapDirectory {
    inner: FsDirectory,
}

impl MmapDirectory {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            inner: FsDirectory::new(root),
        }
    }

    pub fn root(&self) -> &Path {
        self.inner.root()
    }

    #[cfg(unix)]
    fn advise(map: &Mmap, advice: IoAdvice) {
        use memmap2::Advice;

        let hint = match advice {
            IoAdvice::Normal => Advice::Normal,
            IoAdvice::Sequential | IoAdvice::ReadOnce | IoAdvice::ReadOnceSequential => {
                Advice::Sequential
            }
            IoAdvice::Random | IoAdvice::ReadOnceRandom => Advice::Random,
        };
        // advisory only; a refusal changes nothing about correctness
        let _ = map.advise(hint);
    }

    #[cfg(not(unix))]
    fn advise(_map: &Mmap, _advice: IoAdvice) {}
}

impl Directory for MmapDirectory {
    fn create(&self, name: &str) -> Result<Box<dyn IndexOutput>> {
        self.inner.create(name)
    }

    fn open(&self, name: &str, advice: IoAdvice) -> Result<Box<dyn IndexInput>> {
        let path = self.root().join(name);
        let file = std::fs::File::open(&path)?;
        let len = file.metadata()?.len();
        let data = if len == 0 {
            MmapData::Empty
        } else {
            // SAFETY: segment files are immutable once published; the
            // writer never mutates a file a reader can open.
            let map = unsafe { Mmap::map(&file)? };
            Self::advise(&map, advice);
            MmapData::Map(Arc::new(map))
        };
        Ok(Box::new(MmapInput { data, pos: 0 }))
    }

    fn exists(&self, name: &str) -> Result<bool> {
        self.inner.exists(name)
    }

    fn length(&self, name: &str) -> Result<u64> {
        self.inner.length(name)
    }

    fn mtime(&self, name: &str) -> Result<SystemTime> {
        self.inner.mtime(name)
    }

    fn remove(&self, name: &str) -> Result<()> {
        self.inner.remove(name)
    }

    fn rename(&self, src: &str, dst: &str) -> Result<()> {
        self.inner.rename(src, dst)
    }

    fn sync(&self, name: &str) -> Result<()> {
        self.inner.sync(name)
    }

    fn visit(&self, visitor: &mut dyn FnMut(&str) -> bool) -> Result<()> {
        self.inner.visit(visitor)
    }

    fn make_lock(&self, name: &str) -> Result<Box<dyn IndexLock>> {
        self.inner.make_lock(name)
    }

    fn file_refs(&self) -> &Arc<FileRefs> {
        self.inner.file_refs()
    }
}

#[derive(Clone, Debug)]
enum MmapData {
    Map(Arc<Mmap>),
    Empty,
}

impl MmapData {
    fn as_slice(&self) -> &[u8] {
        match self {
            MmapData::Map(map) => map,
            MmapData::Empty => &[],
        }
    }
}

#[derive(Debug)]
struct MmapInput {
    data: MmapData,
    pos: u64,
}

impl DataInput for MmapInput {
    fn read_byte(&mut self) -> Result<u8> {
        let slice = self.data.as_slice();
        if self.pos >= slice.len() as u64 {
            return Err(Error::eof("read past end of mapping"));
        }
        let b = slice[self.pos as usize];
        self.pos += 1;
        Ok(b)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let slice = self.data.as_slice();
        let end = self.pos + buf.len() as u64;
        if end > slice.len() as u64 {
            return Err(Error::eof("read past end of mapping"));
        }
        buf.copy_from_slice(&slice[self.pos as usize..end as usize]);
        self.pos = end;
        Ok(())
    }
}

impl IndexInput for MmapInput {
    fn len(&self) -> u64 {
        self.data.as_slice().len() as u64
    }

    fn file_pointer(&self) -> u64 {
        self.pos
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        if pos > self.len() {
            return Err(Error::io(format!("seek out of range: {pos} > {}", self.len())));
        }
        self.pos = pos;
        Ok(())
    }

    fn dup(&self) -> Result<Box<dyn IndexInput>> {
        Ok(Box::new(MmapInput {
            data: self.data.clone(),
            pos: self.pos,
        }))
    }

    fn reopen(&self) -> Result<Box<dyn IndexInput>> {
        Ok(Box::new(MmapInput {
            data: self.data.clone(),
            pos: 0,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DataOutput;

    #[test]
    fn test_mmap_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = MmapDirectory::new(tmp.path());

        let mut out = dir.create("data.bin").unwrap();
        out.write_bytes(b"mapped bytes").unwrap();
        out.close().unwrap();

        let mut input = dir.open("data.bin", IoAdvice::Random).unwrap();
        assert_eq!(input.len(), 12);
        let mut buf = vec![0u8; 5];
        input.seek(7).unwrap();
        input.read_exact(&mut buf).unwrap();
        assert_eq!(buf, b"bytes");
    }

    #[test]
    fn test_mmap_empty_file() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = MmapDirectory::new(tmp.path());

        let mut out = dir.create("empty.bin").unwrap();
        out.close().unwrap();

        let mut input = dir.open("empty.bin", IoAdvice::Normal).unwrap();
        assert_eq!(input.len(), 0);
        assert!(input.read_byte().is_err());
    }
}
