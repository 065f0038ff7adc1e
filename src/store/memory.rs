//! In-memory directory for tests and small transient indexes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::store::{
    DataInput, DataOutput, Directory, FileRefs, IndexInput, IndexLock, IndexOutput, IoAdvice,
};

#[derive(Clone)]
struct MemoryFile {
    data: Arc<Vec<u8>>,
    mtime: SystemTime,
}

type FileMap = Arc<RwLock<HashMap<String, MemoryFile>>>;

/// Directory keeping every file in an `Arc`-shared byte buffer.
///
/// Writes are staged privately and published on `close`, so a file is
/// never observable half-written. Cloning shares the underlying map.
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    files: FileMap,
    refs: Arc<FileRefs>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Directory for MemoryDirectory {
    fn create(&self, name: &str) -> Result<Box<dyn IndexOutput>> {
        Ok(Box::new(MemoryOutput {
            name: name.to_string(),
            buffer: Vec::new(),
            crc: crc32fast::Hasher::new(),
            files: Arc::clone(&self.files),
            closed: false,
        }))
    }

    fn open(&self, name: &str, _advice: IoAdvice) -> Result<Box<dyn IndexInput>> {
        let files = self.files.read();
        let file = files
            .get(name)
            .ok_or_else(|| Error::io(format!("no such file: {name}")))?;
        Ok(Box::new(MemoryInput {
            data: Arc::clone(&file.data),
            pos: 0,
        }))
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.files.read().contains_key(name))
    }

    fn length(&self, name: &str) -> Result<u64> {
        self.files
            .read()
            .get(name)
            .map(|f| f.data.len() as u64)
            .ok_or_else(|| Error::io(format!("no such file: {name}")))
    }

    fn mtime(&self, name: &str) -> Result<SystemTime> {
        self.files
            .read()
            .get(name)
            .map(|f| f.mtime)
            .ok_or_else(|| Error::io(format!("no such file: {name}")))
    }

    fn remove(&self, name: &str) -> Result<()> {
        self.files
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::io(format!("no such file: {name}")))
    }

    fn rename(&self, src: &str, dst: &str) -> Result<()> {
        let mut files = self.files.write();
        let file = files
            .remove(src)
            .ok_or_else(|| Error::io(format!("no such file: {src}")))?;
        files.insert(dst.to_string(), file);
        Ok(())
    }

    fn sync(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    fn visit(&self, visitor: &mut dyn FnMut(&str) -> bool) -> Result<()> {
        for name in self.files.read().keys() {
            if !visitor(name) {
                break;
            }
        }
        Ok(())
    }

    fn make_lock(&self, name: &str) -> Result<Box<dyn IndexLock>> {
        Ok(Box::new(MemoryLock {
            files: Arc::clone(&self.files),
            name: name.to_string(),
            held: false,
        }))
    }

    fn file_refs(&self) -> &Arc<FileRefs> {
        &self.refs
    }
}

struct MemoryOutput {
    name: String,
    buffer: Vec<u8>,
    crc: crc32fast::Hasher,
    files: FileMap,
    closed: bool,
}

impl DataOutput for MemoryOutput {
    fn write_byte(&mut self, b: u8) -> Result<()> {
        self.write_bytes(&[b])
    }

    fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::io(format!("write after close: {}", self.name)));
        }
        self.crc.update(buf);
        self.buffer.extend_from_slice(buf);
        Ok(())
    }
}

impl IndexOutput for MemoryOutput {
    fn file_pointer(&self) -> u64 {
        self.buffer.len() as u64
    }

    fn checksum(&mut self) -> Result<u32> {
        Ok(self.crc.clone().finalize())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let data = std::mem::take(&mut self.buffer);
        self.files.write().insert(
            self.name.clone(),
            MemoryFile {
                data: Arc::new(data),
                mtime: SystemTime::now(),
            },
        );
        Ok(())
    }
}

#[derive(Debug)]
struct MemoryInput {
    data: Arc<Vec<u8>>,
    pos: u64,
}

impl DataInput for MemoryInput {
    fn read_byte(&mut self) -> Result<u8> {
        if self.pos >= self.data.len() as u64 {
            return Err(Error::eof("read past end of file"));
        }
        let b = self.data[self.pos as usize];
        self.pos += 1;
        Ok(b)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let end = self.pos + buf.len() as u64;
        if end > self.data.len() as u64 {
            return Err(Error::eof("read past end of file"));
        }
        buf.copy_from_slice(&self.data[self.pos as usize..end as usize]);
        self.pos = end;
        Ok(())
    }
}

impl IndexInput for MemoryInput {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn file_pointer(&self) -> u64 {
        self.pos
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        if pos > self.data.len() as u64 {
            return Err(Error::io(format!(
                "seek out of range: {pos} > {}",
                self.data.len()
            )));
        }
        self.pos = pos;
        Ok(())
    }

    fn dup(&self) -> Result<Box<dyn IndexInput>> {
        Ok(Box::new(MemoryInput {
            data: Arc::clone(&self.data),
            pos: self.pos,
        }))
    }

    fn reopen(&self) -> Result<Box<dyn IndexInput>> {
        Ok(Box::new(MemoryInput {
            data: Arc::clone(&self.data),
            pos: 0,
        }))
    }
}

struct MemoryLock {
    files: FileMap,
    name: String,
    held: bool,
}

impl IndexLock for MemoryLock {
    fn lock(&mut self) -> Result<bool> {
        if self.held {
            // no self re-acquisition
            return Ok(false);
        }
        let mut files = self.files.write();
        if files.contains_key(&self.name) {
            return Ok(false);
        }
        files.insert(
            self.name.clone(),
            MemoryFile {
                data: Arc::new(Vec::new()),
                mtime: SystemTime::now(),
            },
        );
        self.held = true;
        Ok(true)
    }

    fn is_locked(&self) -> Result<bool> {
        Ok(self.held || self.files.read().contains_key(&self.name))
    }

    fn unlock(&mut self) -> Result<bool> {
        if !self.held {
            return Ok(false);
        }
        self.held = false;
        self.files.write().remove(&self.name);
        Ok(true)
    }
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        if self.held {
            self.files.write().remove(&self.name);
        }
    }
}
