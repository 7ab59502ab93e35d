//! # Staging Area
//!
//! Bounded-memory-then-disk resource pool holding in-flight batch payloads.
//!
//! ## Features
//!
//! - **Memory→file promotion**: payloads buffer in memory up to a threshold,
//!   then promote seamlessly to a backing file with no change to the read
//!   contract
//! - **Idempotent create**: recreating a resource that never finished writing
//!   discards the partial payload (restart-after-partial-write recovery)
//! - **Crash recovery**: resources are rediscovered from disk on startup
//! - **TTL purge**: `clean` removes aged resources, never ones still
//!   referenced by a pending batch
//!
//! ## Key layout
//!
//! `<category>/<location>/<batchId>` — category is `outgoing` or `incoming`,
//! location is the remote node's staged location. File-backed resources live
//! at that path under the staging dir with a `.create` or `.done` extension
//! reflecting their state.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

use crate::error::{Result, SluiceError};

/// Lifecycle state of a staged resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    /// Being written; payload is incomplete
    Create,
    /// Finalized; payload exactly reproduces the bytes written
    Done,
}

impl ResourceState {
    fn extension(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Done => "done",
        }
    }
}

#[derive(Debug)]
enum Backing {
    Empty,
    Memory(Vec<u8>),
    File,
}

#[derive(Debug)]
struct Inner {
    state: ResourceState,
    backing: Backing,
    last_update: SystemTime,
    writing: bool,
}

/// One staged batch payload. Writers own the resource exclusively from
/// CREATE to DONE; readers never mutate.
#[derive(Debug)]
pub struct StagedResource {
    path: String,
    base: PathBuf,
    memory_threshold: usize,
    inner: Mutex<Inner>,
    references: AtomicI32,
}

impl StagedResource {
    fn new(path: String, base: PathBuf, memory_threshold: usize) -> Self {
        // Rediscover state from disk: a .done file wins, then .create.
        let done_file = Self::file_for(&base, ResourceState::Done);
        let create_file = Self::file_for(&base, ResourceState::Create);
        let (state, backing, last_update) = if done_file.exists() {
            (
                ResourceState::Done,
                Backing::File,
                file_mtime(&done_file),
            )
        } else if create_file.exists() {
            (
                ResourceState::Create,
                Backing::File,
                file_mtime(&create_file),
            )
        } else {
            (ResourceState::Create, Backing::Empty, SystemTime::now())
        };
        Self {
            path,
            base,
            memory_threshold,
            inner: Mutex::new(Inner {
                state,
                backing,
                last_update,
                writing: false,
            }),
            references: AtomicI32::new(0),
        }
    }

    fn file_for(base: &Path, state: ResourceState) -> PathBuf {
        let mut os = base.as_os_str().to_owned();
        os.push(".");
        os.push(state.extension());
        PathBuf::from(os)
    }

    /// Staging key, e.g. `outgoing/002/7`.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn state(&self) -> ResourceState {
        self.inner.lock().state
    }

    /// Pin this resource against purge while a caller holds it.
    pub fn reference(&self) {
        self.references.fetch_add(1, Ordering::SeqCst);
    }

    pub fn dereference(&self) {
        self.references.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn is_in_use(&self) -> bool {
        self.references.load(Ordering::SeqCst) > 0 || self.inner.lock().writing
    }

    pub fn is_file_backed(&self) -> bool {
        matches!(self.inner.lock().backing, Backing::File)
    }

    pub fn last_update(&self) -> SystemTime {
        self.inner.lock().last_update
    }

    pub fn size(&self) -> u64 {
        let inner = self.inner.lock();
        match &inner.backing {
            Backing::Empty => 0,
            Backing::Memory(buf) => buf.len() as u64,
            Backing::File => {
                let file = Self::file_for(&self.base, inner.state);
                fs::metadata(file).map(|m| m.len()).unwrap_or(0)
            }
        }
    }

    pub fn exists(&self) -> bool {
        self.size() > 0
    }

    /// Open a writer for this resource. An existing partial payload is
    /// discarded first so a retried create starts clean.
    pub fn writer(self: &Arc<Self>) -> Result<StagedWriter> {
        let mut inner = self.inner.lock();
        if inner.writing {
            return Err(SluiceError::staging(format!(
                "{} is already being written",
                self.path
            )));
        }
        match &inner.backing {
            Backing::Memory(_) => {
                warn!(path = %self.path, "discarding existing memory buffer for rewrite");
                inner.backing = Backing::Empty;
            }
            Backing::File => {
                let file = Self::file_for(&self.base, inner.state);
                warn!(path = %self.path, "deleting existing staged file for rewrite");
                let _ = fs::remove_file(file);
                inner.backing = Backing::Empty;
            }
            Backing::Empty => {}
        }
        inner.state = ResourceState::Create;
        inner.writing = true;
        inner.last_update = SystemTime::now();
        drop(inner);
        Ok(StagedWriter {
            resource: Arc::clone(self),
            buf: Vec::new(),
            file: None,
            closed: false,
        })
    }

    /// Open a reader over the payload. Memory- and file-backed resources
    /// produce identical content.
    pub fn reader(&self) -> Result<Box<dyn std::io::BufRead + Send>> {
        let inner = self.inner.lock();
        match &inner.backing {
            Backing::Memory(buf) => Ok(Box::new(Cursor::new(buf.clone()))),
            Backing::File => {
                let file = Self::file_for(&self.base, inner.state);
                let f = File::open(&file).map_err(|e| {
                    SluiceError::staging(format!("cannot open {}: {e}", file.display()))
                })?;
                Ok(Box::new(BufReader::new(f)))
            }
            Backing::Empty => Err(SluiceError::staging(format!(
                "{} has no content to read",
                self.path
            ))),
        }
    }

    /// Read the whole payload into memory (transport push path).
    pub fn read_all(&self) -> Result<Vec<u8>> {
        let mut reader = self.reader()?;
        let mut out = Vec::new();
        reader.read_to_end(&mut out)?;
        Ok(out)
    }

    /// Finalize the resource. For file-backed payloads this renames
    /// `.create` to `.done`; the DONE payload must exactly reproduce the
    /// bytes written.
    pub fn set_done(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.writing {
            return Err(SluiceError::staging(format!(
                "{} still has an open writer",
                self.path
            )));
        }
        if inner.state == ResourceState::Done {
            return Ok(());
        }
        if matches!(inner.backing, Backing::File) {
            let from = Self::file_for(&self.base, ResourceState::Create);
            let to = Self::file_for(&self.base, ResourceState::Done);
            fs::rename(&from, &to).map_err(|e| {
                SluiceError::staging(format!(
                    "rename {} -> {} failed: {e}",
                    from.display(),
                    to.display()
                ))
            })?;
        }
        inner.state = ResourceState::Done;
        inner.last_update = SystemTime::now();
        Ok(())
    }

    /// Remove the payload. Returns Ok even when there was nothing to delete.
    pub fn delete(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if matches!(inner.backing, Backing::File) {
            for state in [ResourceState::Create, ResourceState::Done] {
                let file = Self::file_for(&self.base, state);
                if file.exists() {
                    fs::remove_file(&file).map_err(|e| {
                        SluiceError::staging(format!(
                            "delete {} failed: {e}",
                            file.display()
                        ))
                    })?;
                }
            }
        }
        inner.backing = Backing::Empty;
        inner.state = ResourceState::Create;
        inner.last_update = SystemTime::now();
        Ok(())
    }

    fn finish_write(&self, backing: Backing) {
        let mut inner = self.inner.lock();
        inner.backing = backing;
        inner.writing = false;
        inner.last_update = SystemTime::now();
    }
}

fn file_mtime(path: &Path) -> SystemTime {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or_else(|_| SystemTime::now())
}

/// Writer that buffers in memory and promotes to a file at the threshold.
///
/// The promotion happens on the first byte past the threshold; already
/// buffered bytes are flushed to the file first, so no data is lost and the
/// logical stream is unchanged.
pub struct StagedWriter {
    resource: Arc<StagedResource>,
    buf: Vec<u8>,
    file: Option<BufWriter<File>>,
    closed: bool,
}

impl StagedWriter {
    fn promote(&mut self) -> std::io::Result<()> {
        let path = StagedResource::file_for(&self.resource.base, ResourceState::Create);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&self.buf)?;
        self.buf = Vec::new();
        self.file = Some(writer);
        debug!(path = %self.resource.path(), "staged resource promoted to file");
        Ok(())
    }

    /// Flush and hand the payload back to the resource.
    pub fn close(mut self) -> Result<()> {
        self.close_internal()?;
        Ok(())
    }

    fn close_internal(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let backing = if let Some(mut file) = self.file.take() {
            file.flush()?;
            Backing::File
        } else if self.buf.is_empty() {
            Backing::Empty
        } else {
            Backing::Memory(std::mem::take(&mut self.buf))
        };
        self.resource.finish_write(backing);
        Ok(())
    }
}

impl Write for StagedWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        if let Some(file) = self.file.as_mut() {
            return file.write(data);
        }
        if self.buf.len() + data.len() > self.resource.memory_threshold {
            self.promote()?;
            return self.file.as_mut().expect("promoted").write(data);
        }
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

impl Drop for StagedWriter {
    fn drop(&mut self) {
        if !self.closed {
            // abandoned writer: release the resource so a retry can recreate
            let _ = self.close_internal();
        }
    }
}

/// Pending batches captured at the start of a purge pass, keyed by staging
/// location and batch id. Batch ids are only unique per remote node, so the
/// id alone must never pin another node's payload. Staging never deletes a
/// resource a retry might still need.
#[derive(Debug, Default, Clone)]
pub struct BatchReferenceSnapshot {
    pub outgoing: HashSet<(String, u64)>,
    pub incoming: HashSet<(String, u64)>,
}

impl BatchReferenceSnapshot {
    pub fn is_referenced(&self, category: &str, location: &str, batch_id: u64) -> bool {
        let key = (location.to_string(), batch_id);
        match category {
            "outgoing" => self.outgoing.contains(&key),
            "incoming" => self.incoming.contains(&key),
            _ => false,
        }
    }
}

/// Outcome of one purge pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanStats {
    pub purged: u64,
    pub bytes_freed: u64,
    pub skipped_in_use: u64,
    pub skipped_referenced: u64,
    pub failed: u64,
}

/// Resource pool over one staging directory.
pub struct StagingManager {
    dir: PathBuf,
    memory_threshold: usize,
    resources: DashMap<String, Arc<StagedResource>>,
    clean_lock: Mutex<()>,
}

impl StagingManager {
    /// Open a staging manager rooted at `dir`, rediscovering any resources
    /// left on disk by a previous run.
    pub fn new(dir: impl Into<PathBuf>, memory_threshold: usize) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let manager = Self {
            dir,
            memory_threshold,
            resources: DashMap::new(),
            clean_lock: Mutex::new(()),
        };
        manager.restore()?;
        Ok(manager)
    }

    fn restore(&self) -> Result<()> {
        let mut stack = vec![self.dir.clone()];
        let mut restored = 0u64;
        while let Some(dir) = stack.pop() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                let ext = path.extension().and_then(|e| e.to_str());
                if !matches!(ext, Some("create") | Some("done")) {
                    continue;
                }
                let base = path.with_extension("");
                if let Ok(rel) = base.strip_prefix(&self.dir) {
                    let key = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    self.resources.entry(key.clone()).or_insert_with(|| {
                        restored += 1;
                        Arc::new(StagedResource::new(key, base.clone(), self.memory_threshold))
                    });
                }
            }
        }
        if restored > 0 {
            debug!(count = restored, dir = %self.dir.display(), "restored staged resources");
        }
        Ok(())
    }

    fn key_of(parts: &[&str]) -> String {
        parts.join("/")
    }

    /// Create a resource for the given key parts, replacing any existing
    /// payload under the same key (idempotent under retry).
    pub fn create(&self, category: &str, parts: &[&str]) -> Result<Arc<StagedResource>> {
        let mut all = vec![category];
        all.extend_from_slice(parts);
        let key = Self::key_of(&all);
        if let Some(existing) = self.resources.get(&key).map(|r| Arc::clone(&r)) {
            debug!(path = %key, "replacing existing staged resource");
            existing.delete()?;
        }
        let base = self.dir.join(&key);
        let resource = Arc::new(StagedResource::new(
            key.clone(),
            base,
            self.memory_threshold,
        ));
        self.resources.insert(key, Arc::clone(&resource));
        Ok(resource)
    }

    /// Find an existing resource, checking the in-memory pool then disk.
    pub fn find(&self, category: &str, parts: &[&str]) -> Option<Arc<StagedResource>> {
        let mut all = vec![category];
        all.extend_from_slice(parts);
        let key = Self::key_of(&all);
        if let Some(existing) = self.resources.get(&key) {
            return Some(Arc::clone(&existing));
        }
        let base = self.dir.join(&key);
        if StagedResource::file_for(&base, ResourceState::Done).exists()
            || StagedResource::file_for(&base, ResourceState::Create).exists()
        {
            let resource = Arc::new(StagedResource::new(
                key.clone(),
                base,
                self.memory_threshold,
            ));
            self.resources.insert(key, Arc::clone(&resource));
            return Some(resource);
        }
        None
    }

    /// Purge staged resources.
    ///
    /// With a zero ttl everything goes, unconditionally (force-purge on full
    /// restart). Otherwise a resource is purged only when it is older than
    /// the ttl, not in use, and not referenced by a pending batch in the
    /// snapshot. Keys that don't parse as `<category>/.../<batchId>` are
    /// purged only when old enough. One failed delete never aborts the pass.
    pub fn clean(&self, ttl: Duration, refs: &BatchReferenceSnapshot) -> CleanStats {
        // Exclusive over key enumeration so the key set doesn't mutate
        // underneath the pass; per-resource deletes run inside it as
        // discrete operations.
        let _guard = self.clean_lock.lock();
        let force = ttl.is_zero();
        let now = SystemTime::now();
        let mut stats = CleanStats::default();

        let keys: Vec<String> = self.resources.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            let Some(resource) = self.resources.get(&key).map(|r| Arc::clone(&r)) else {
                continue;
            };
            let age = now
                .duration_since(resource.last_update())
                .unwrap_or_default();
            let old_enough = age >= ttl;

            if !force {
                if resource.is_in_use() {
                    stats.skipped_in_use += 1;
                    continue;
                }
                match parse_key(&key) {
                    Some((category, location, batch_id)) => {
                        if refs.is_referenced(category, location, batch_id) {
                            stats.skipped_referenced += 1;
                            continue;
                        }
                        if !old_enough {
                            continue;
                        }
                    }
                    None => {
                        // keys without a parsable batch id age out on ttl alone
                        if !old_enough {
                            continue;
                        }
                    }
                }
            }

            let size = resource.size();
            match resource.delete() {
                Ok(()) => {
                    self.resources.remove(&key);
                    stats.purged += 1;
                    stats.bytes_freed += size;
                    debug!(path = %key, "purged staged resource");
                }
                Err(e) => {
                    stats.failed += 1;
                    warn!(path = %key, error = %e, "failed to purge staged resource, continuing");
                }
            }
        }
        stats
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }
}

/// Parse `<category>/<location>/<batchId>` into its purge-relevant parts.
fn parse_key(key: &str) -> Option<(&str, &str, u64)> {
    let (category, rest) = key.split_once('/')?;
    if !matches!(category, "outgoing" | "incoming") {
        return None;
    }
    let (location, id_part) = rest.rsplit_once('/')?;
    let batch_id = id_part.parse::<u64>().ok()?;
    Some((category, location, batch_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(threshold: usize) -> (TempDir, StagingManager) {
        let dir = TempDir::new().unwrap();
        let mgr = StagingManager::new(dir.path(), threshold).unwrap();
        (dir, mgr)
    }

    fn write_payload(resource: &Arc<StagedResource>, payload: &[u8]) {
        let mut writer = resource.writer().unwrap();
        writer.write_all(payload).unwrap();
        writer.close().unwrap();
        resource.set_done().unwrap();
    }

    #[test]
    fn test_memory_backed_below_threshold() {
        let (_dir, mgr) = manager(1024);
        let resource = mgr.create("outgoing", &["002", "1"]).unwrap();
        write_payload(&resource, b"hello\nworld\n");

        assert!(!resource.is_file_backed());
        assert_eq!(resource.state(), ResourceState::Done);
        assert_eq!(resource.read_all().unwrap(), b"hello\nworld\n");
    }

    #[test]
    fn test_file_promotion_above_threshold() {
        let (_dir, mgr) = manager(16);
        let resource = mgr.create("outgoing", &["002", "2"]).unwrap();
        let payload = b"0123456789abcdef0123456789abcdef";
        write_payload(&resource, payload);

        assert!(resource.is_file_backed());
        assert_eq!(resource.read_all().unwrap(), payload);
        assert_eq!(resource.size(), payload.len() as u64);
    }

    #[test]
    fn test_promotion_mid_stream_loses_nothing() {
        let (_dir, mgr) = manager(10);
        let resource = mgr.create("outgoing", &["002", "3"]).unwrap();
        let mut writer = resource.writer().unwrap();
        writer.write_all(b"aaaa").unwrap();
        writer.write_all(b"bbbb").unwrap();
        // this write crosses the threshold
        writer.write_all(b"cccc").unwrap();
        writer.write_all(b"dddd").unwrap();
        writer.close().unwrap();
        resource.set_done().unwrap();

        assert!(resource.is_file_backed());
        assert_eq!(resource.read_all().unwrap(), b"aaaabbbbccccdddd");
    }

    #[test]
    fn test_idempotent_recreate() {
        let (_dir, mgr) = manager(1024);
        let resource = mgr.create("outgoing", &["002", "4"]).unwrap();
        let mut writer = resource.writer().unwrap();
        writer.write_all(b"partial garbage").unwrap();
        writer.close().unwrap();
        // never reached DONE; a retry recreates and writes clean
        let resource = mgr.create("outgoing", &["002", "4"]).unwrap();
        write_payload(&resource, b"clean payload");
        assert_eq!(resource.read_all().unwrap(), b"clean payload");
    }

    #[test]
    fn test_find_and_restore_from_disk() {
        let dir = TempDir::new().unwrap();
        {
            let mgr = StagingManager::new(dir.path(), 4).unwrap();
            let resource = mgr.create("incoming", &["001", "9"]).unwrap();
            write_payload(&resource, b"persisted beyond threshold");
        }
        // a fresh manager over the same dir sees the resource
        let mgr = StagingManager::new(dir.path(), 4).unwrap();
        let resource = mgr.find("incoming", &["001", "9"]).unwrap();
        assert_eq!(resource.state(), ResourceState::Done);
        assert_eq!(resource.read_all().unwrap(), b"persisted beyond threshold");
    }

    #[test]
    fn test_find_missing() {
        let (_dir, mgr) = manager(64);
        assert!(mgr.find("outgoing", &["002", "404"]).is_none());
    }

    #[test]
    fn test_force_clean_purges_everything() {
        let (_dir, mgr) = manager(8);
        for id in ["1", "2", "3"] {
            let r = mgr.create("outgoing", &["002", id]).unwrap();
            write_payload(&r, b"some payload data");
        }
        let stats = mgr.clean(Duration::ZERO, &BatchReferenceSnapshot::default());
        assert_eq!(stats.purged, 3);
        assert_eq!(mgr.resource_count(), 0);
    }

    #[test]
    fn test_clean_keeps_referenced_batches() {
        let (_dir, mgr) = manager(1024);
        let r1 = mgr.create("outgoing", &["002", "1"]).unwrap();
        write_payload(&r1, b"pending");
        let r2 = mgr.create("outgoing", &["002", "2"]).unwrap();
        write_payload(&r2, b"acked");

        let mut refs = BatchReferenceSnapshot::default();
        refs.outgoing.insert(("002".to_string(), 1));
        // everything is "old" with a tiny ttl
        std::thread::sleep(Duration::from_millis(20));
        let stats = mgr.clean(Duration::from_millis(1), &refs);
        assert_eq!(stats.purged, 1);
        assert_eq!(stats.skipped_referenced, 1);
        assert!(mgr.find("outgoing", &["002", "1"]).is_some());
        assert!(mgr.find("outgoing", &["002", "2"]).is_none());
    }

    #[test]
    fn test_clean_keeps_young_resources() {
        let (_dir, mgr) = manager(1024);
        let r = mgr.create("outgoing", &["002", "1"]).unwrap();
        write_payload(&r, b"fresh");
        let stats = mgr.clean(Duration::from_secs(3600), &BatchReferenceSnapshot::default());
        assert_eq!(stats.purged, 0);
        assert_eq!(mgr.resource_count(), 1);
    }

    #[test]
    fn test_clean_skips_in_use() {
        let (_dir, mgr) = manager(1024);
        let r = mgr.create("outgoing", &["002", "1"]).unwrap();
        write_payload(&r, b"busy");
        r.reference();
        std::thread::sleep(Duration::from_millis(20));
        let stats = mgr.clean(Duration::from_millis(1), &BatchReferenceSnapshot::default());
        assert_eq!(stats.purged, 0);
        assert_eq!(stats.skipped_in_use, 1);
        r.dereference();
        let stats = mgr.clean(Duration::from_millis(1), &BatchReferenceSnapshot::default());
        assert_eq!(stats.purged, 1);
    }

    #[test]
    fn test_clean_scopes_references_to_node() {
        let (_dir, mgr) = manager(1024);
        // same batch id staged for two different nodes
        let r1 = mgr.create("outgoing", &["002", "7"]).unwrap();
        write_payload(&r1, b"pending for 002");
        let r2 = mgr.create("outgoing", &["003", "7"]).unwrap();
        write_payload(&r2, b"acked for 003");

        let mut refs = BatchReferenceSnapshot::default();
        refs.outgoing.insert(("002".to_string(), 7));
        std::thread::sleep(Duration::from_millis(20));
        let stats = mgr.clean(Duration::from_millis(1), &refs);
        assert_eq!(stats.purged, 1);
        assert_eq!(stats.skipped_referenced, 1);
        assert!(mgr.find("outgoing", &["002", "7"]).is_some());
        assert!(mgr.find("outgoing", &["003", "7"]).is_none());
    }

    #[test]
    fn test_parse_key() {
        assert_eq!(parse_key("outgoing/002/7"), Some(("outgoing", "002", 7)));
        assert_eq!(parse_key("incoming/g1/001/12"), Some(("incoming", "g1/001", 12)));
        assert_eq!(parse_key("outgoing/002/not-a-number"), None);
        assert_eq!(parse_key("elsewhere/002/7"), None);
    }

    #[test]
    fn test_done_reproduces_written_bytes_both_backings() {
        for threshold in [4usize, 4096] {
            let (_dir, mgr) = manager(threshold);
            let resource = mgr.create("outgoing", &["002", "1"]).unwrap();
            let payload = b"line one\nline two\nline three\n";
            write_payload(&resource, payload);
            assert_eq!(resource.read_all().unwrap(), payload);
        }
    }
}
