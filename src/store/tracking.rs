//! Tracking decorators and the directory garbage collector.
//!
//! The segment writer works through a [`TrackingDirectory`] so that a
//! failed flush leaves its partial files discoverable; readers pin the
//! files they depend on through [`FileRefs`], and the cleaner removes
//! whatever is neither referenced nor retained by an acceptor.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::store::{Directory, IndexInput, IndexLock, IndexOutput, IoAdvice};

/// Directory-wide reference counts keyed by file name.
///
/// Holding a [`FileRef`] keeps the named file safe from the cleaner;
/// the count drops when the ref is dropped.
#[derive(Default)]
pub struct FileRefs {
    counts: Mutex<HashMap<String, usize>>,
}

impl FileRefs {
    pub fn add(self: &Arc<Self>, name: &str) -> FileRef {
        *self.counts.lock().entry(name.to_string()).or_insert(0) += 1;
        FileRef {
            refs: Arc::clone(self),
            name: name.to_string(),
        }
    }

    pub fn count(&self, name: &str) -> usize {
        self.counts.lock().get(name).copied().unwrap_or(0)
    }

    pub fn is_referenced(&self, name: &str) -> bool {
        self.count(name) > 0
    }

    fn release(&self, name: &str) {
        let mut counts = self.counts.lock();
        if let Some(count) = counts.get_mut(name) {
            *count -= 1;
            if *count == 0 {
                counts.remove(name);
            }
        }
    }
}

/// RAII handle pinning one file against removal by the cleaner.
pub struct FileRef {
    refs: Arc<FileRefs>,
    name: String,
}

impl FileRef {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Clone for FileRef {
    fn clone(&self) -> Self {
        self.refs.add(&self.name)
    }
}

impl Drop for FileRef {
    fn drop(&mut self) {
        self.refs.release(&self.name);
    }
}

/// Take a reference on `name`, verifying the file still exists.
///
/// The existence check runs again after the ref is taken; losing the
/// race against a concurrent removal yields `None`.
pub fn reference(
    dir: &dyn Directory,
    name: &str,
    include_missing: bool,
) -> Result<Option<FileRef>> {
    if include_missing {
        return Ok(Some(dir.file_refs().add(name)));
    }
    if !dir.exists(name)? {
        return Ok(None);
    }
    let file_ref = dir.file_refs().add(name);
    if dir.exists(name)? {
        Ok(Some(file_ref))
    } else {
        Ok(None)
    }
}

/// Decorator recording every created (and optionally opened) file name.
pub struct TrackingDirectory {
    inner: Arc<dyn Directory>,
    files: Mutex<HashSet<String>>,
    track_open: bool,
}

impl TrackingDirectory {
    pub fn new(inner: Arc<dyn Directory>) -> Self {
        Self::with_track_open(inner, false)
    }

    pub fn with_track_open(inner: Arc<dyn Directory>, track_open: bool) -> Self {
        Self {
            inner,
            files: Mutex::new(HashSet::new()),
            track_open,
        }
    }

    pub fn inner(&self) -> &Arc<dyn Directory> {
        &self.inner
    }

    /// Atomically exchange the tracked set with `other`, transferring
    /// ownership of the tracked names to the caller.
    pub fn swap_tracked(&self, other: &mut HashSet<String>) {
        std::mem::swap(&mut *self.files.lock(), other);
    }

    pub fn tracked(&self) -> HashSet<String> {
        self.files.lock().clone()
    }
}

impl Directory for TrackingDirectory {
    fn create(&self, name: &str) -> Result<Box<dyn IndexOutput>> {
        self.files.lock().insert(name.to_string());
        match self.inner.create(name) {
            Ok(out) => Ok(out),
            Err(err) => {
                self.files.lock().remove(name);
                Err(err)
            }
        }
    }

    fn open(&self, name: &str, advice: IoAdvice) -> Result<Box<dyn IndexInput>> {
        if self.track_open {
            self.files.lock().insert(name.to_string());
        }
        self.inner.open(name, advice)
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
        let result = self.inner.remove(name);
        if result.is_ok() {
            self.files.lock().remove(name);
        }
        result
    }

    fn rename(&self, src: &str, dst: &str) -> Result<()> {
        self.inner.rename(src, dst)?;
        let mut files = self.files.lock();
        if files.remove(src) {
            files.insert(dst.to_string());
        }
        Ok(())
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

/// Decorator that additionally pins each tracked file through the
/// directory's [`FileRefs`], so the cleaner cannot remove a file that
/// is still being written or read.
pub struct RefTrackingDirectory {
    inner: Arc<dyn Directory>,
    refs: Mutex<HashMap<String, FileRef>>,
    track_open: bool,
}

impl RefTrackingDirectory {
    pub fn new(inner: Arc<dyn Directory>) -> Self {
        Self::with_track_open(inner, false)
    }

    pub fn with_track_open(inner: Arc<dyn Directory>, track_open: bool) -> Self {
        Self {
            inner,
            refs: Mutex::new(HashMap::new()),
            track_open,
        }
    }

    pub fn clear_refs(&self) {
        self.refs.lock().clear();
    }

    pub fn visit_refs(&self, visitor: &mut dyn FnMut(&FileRef) -> bool) {
        for file_ref in self.refs.lock().values() {
            if !visitor(file_ref) {
                break;
            }
        }
    }
}

impl Directory for RefTrackingDirectory {
    fn create(&self, name: &str) -> Result<Box<dyn IndexOutput>> {
        let file_ref = self.inner.file_refs().add(name);
        let out = self.inner.create(name)?;
        self.refs.lock().insert(name.to_string(), file_ref);
        Ok(out)
    }

    fn open(&self, name: &str, advice: IoAdvice) -> Result<Box<dyn IndexInput>> {
        let input = self.inner.open(name, advice)?;
        if self.track_open {
            let file_ref = self.inner.file_refs().add(name);
            self.refs.lock().insert(name.to_string(), file_ref);
        }
        Ok(input)
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
        let result = self.inner.remove(name);
        if result.is_ok() {
            self.refs.lock().remove(name);
        }
        result
    }

    fn rename(&self, src: &str, dst: &str) -> Result<()> {
        self.inner.rename(src, dst)?;
        let mut refs = self.refs.lock();
        if refs.remove(src).is_some() {
            let file_ref = self.inner.file_refs().add(dst);
            refs.insert(dst.to_string(), file_ref);
        }
        Ok(())
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

/// Remove every unreferenced file the acceptor approves for removal.
/// Returns the number of files removed.
pub fn clean(dir: &dyn Directory, acceptor: impl Fn(&str) -> bool) -> Result<usize> {
    let refs = Arc::clone(dir.file_refs());
    let mut candidates = Vec::new();
    dir.visit(&mut |name| {
        if !refs.is_referenced(name) && acceptor(name) {
            candidates.push(name.to_string());
        }
        true
    })?;

    let mut removed = 0;
    for name in candidates {
        // a reader may have pinned the file since the listing
        if refs.is_referenced(&name) {
            continue;
        }
        match dir.remove(&name) {
            Ok(()) => {
                debug!(file = %name, "cleaner removed file");
                removed += 1;
            }
            Err(err) => warn!(file = %name, %err, "cleaner failed to remove file"),
        }
    }
    Ok(removed)
}

/// Remove every file in the directory that nothing references.
pub fn remove_all_unreferenced(dir: &dyn Directory) -> Result<usize> {
    clean(dir, |_| true)
}

/// Acceptor retaining a fixed set of file names (the current segments
/// file and every file of the published segments); everything else is
/// fair game for the cleaner.
pub fn retain_current_segments(retain: HashSet<String>) -> impl Fn(&str) -> bool {
    move |name| !retain.contains(name)
}
