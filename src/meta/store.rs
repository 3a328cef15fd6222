//! Durable metadata store.
//!
//! A [`Meta`] owns one directory holding a single buffer blob (the engine's
//! serialized line cache) plus one subdirectory per followed file, each
//! managed through a [`SubMeta`]. All writes go through a
//! write-to-temp-then-rename so a crash never leaves a torn record.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

const BUF_FILE: &str = "buf.json";
const OFFSET_FILE: &str = "offset.json";

/// Per-file offset record stored inside a submeta directory.
#[derive(Debug, Serialize, Deserialize)]
struct OffsetRecord {
    path: PathBuf,
    offset: u64,
}

/// Root metadata store for one engine instance.
pub struct Meta {
    runner_name: String,
    dir: PathBuf,
    sub_metas: Mutex<HashMap<PathBuf, SubMeta>>,
    /// Directories flagged by `check_expired_sub_metas`, pending deletion.
    expired: Mutex<HashSet<PathBuf>>,
}

impl Meta {
    pub fn new(runner_name: impl Into<String>, dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|e| Error::Persistence(format!("failed to create meta directory: {}", e)))?;
        Ok(Self {
            runner_name: runner_name.into(),
            dir,
            sub_metas: Mutex::new(HashMap::new()),
            expired: Mutex::new(HashSet::new()),
        })
    }

    pub fn runner_name(&self) -> &str {
        &self.runner_name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn buf_file(&self) -> PathBuf {
        self.dir.join(BUF_FILE)
    }

    /// Whether a buffer blob from a prior run exists. Discovery uses this as
    /// the "the agent has history" signal when deciding the initial read
    /// position of a brand-new file.
    pub fn is_statistic_file_exist(&self) -> bool {
        self.buf_file().exists()
    }

    /// Persist the opaque buffer blob.
    pub fn write_buf(&self, buf: &[u8]) -> Result<()> {
        atomic_write(&self.buf_file(), buf)
    }

    /// Read the buffer blob back. `None` when no blob has been written yet.
    pub fn read_buf(&self) -> Result<Option<Vec<u8>>> {
        let path = self.buf_file();
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read(&path)?))
    }

    /// Allocate the per-file metadata namespace for `real_path`. The
    /// directory name encodes the real path with path separators and drive
    /// colons replaced by underscores.
    pub fn new_sub_meta(&self, real_path: &Path) -> Result<SubMeta> {
        let dir = self.dir.join(sub_meta_dir_name(real_path));
        fs::create_dir_all(&dir)
            .map_err(|e| Error::Persistence(format!("failed to create submeta directory: {}", e)))?;
        Ok(SubMeta {
            dir,
            real_path: real_path.to_path_buf(),
        })
    }

    /// Register a live submeta so TTL sweeps leave it alone.
    pub fn add_sub_meta(&self, real_path: &Path, sub_meta: SubMeta) -> Result<()> {
        let mut subs = self.sub_metas.lock().unwrap();
        if subs.contains_key(real_path) {
            return Err(Error::Persistence(format!(
                "submeta for {} already registered",
                real_path.display()
            )));
        }
        subs.insert(real_path.to_path_buf(), sub_meta);
        Ok(())
    }

    /// Unregister the submeta for `real_path` and delete its directory.
    pub fn remove_sub_meta(&self, real_path: &Path) -> Result<()> {
        let removed = self.sub_metas.lock().unwrap().remove(real_path);
        let dir = match removed {
            Some(sub) => sub.dir,
            None => self.dir.join(sub_meta_dir_name(real_path)),
        };
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn registered_dirs(&self) -> HashSet<PathBuf> {
        self.sub_metas
            .lock()
            .unwrap()
            .values()
            .map(|s| s.dir.clone())
            .collect()
    }

    /// Scan for unregistered submeta directories older than `ttl` and flag
    /// them for the next cleaning pass.
    pub fn check_expired_sub_metas(&self, ttl: Duration) {
        let registered = self.registered_dirs();
        let mut flagged = 0usize;
        for dir in self.scan_sub_meta_dirs() {
            if registered.contains(&dir) {
                continue;
            }
            if sub_meta_age(&dir).map(|age| age > ttl).unwrap_or(false) {
                self.expired.lock().unwrap().insert(dir);
                flagged += 1;
            }
        }
        if flagged > 0 {
            debug!(
                runner = %self.runner_name,
                flagged, "flagged expired submeta directories"
            );
        }
    }

    /// Delete unregistered submeta directories older than `ttl`, including
    /// any flagged by a prior check pass.
    pub fn clean_expired_sub_metas(&self, ttl: Duration) {
        let registered = self.registered_dirs();
        let mut candidates: HashSet<PathBuf> = self.expired.lock().unwrap().drain().collect();
        candidates.extend(self.scan_sub_meta_dirs());

        for dir in candidates {
            if registered.contains(&dir) {
                continue;
            }
            if !sub_meta_age(&dir).map(|age| age > ttl).unwrap_or(false) {
                continue;
            }
            match fs::remove_dir_all(&dir) {
                Ok(()) => {
                    debug!(runner = %self.runner_name, dir = %dir.display(), "removed expired submeta")
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(
                        runner = %self.runner_name,
                        dir = %dir.display(),
                        error = %e,
                        "failed to remove expired submeta"
                    )
                }
            }
        }
    }

    fn scan_sub_meta_dirs(&self) -> Vec<PathBuf> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(runner = %self.runner_name, error = %e, "failed to scan meta directory");
                return Vec::new();
            }
        };
        entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_dir())
            .collect()
    }

    /// Drop the persisted buffer blob.
    pub fn reset(&self) -> Result<()> {
        match fs::remove_file(self.buf_file()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Per-file metadata namespace: one directory holding the file's offset.
#[derive(Debug, Clone)]
pub struct SubMeta {
    dir: PathBuf,
    real_path: PathBuf,
}

impl SubMeta {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn offset_file(&self) -> PathBuf {
        self.dir.join(OFFSET_FILE)
    }

    /// True when no offset has ever been recorded for this file.
    pub fn is_not_exist(&self) -> bool {
        !self.offset_file().exists()
    }

    /// Read the stored offset. A corrupted record reads as `None` so one
    /// bad file only costs a re-read, never the follower.
    pub fn read_offset(&self) -> Option<u64> {
        let bytes = fs::read(self.offset_file()).ok()?;
        match serde_json::from_slice::<OffsetRecord>(&bytes) {
            Ok(record) => Some(record.offset),
            Err(e) => {
                warn!(
                    path = %self.real_path.display(),
                    error = %e,
                    "corrupted offset record, starting over"
                );
                None
            }
        }
    }

    pub fn write_offset(&self, offset: u64) -> Result<()> {
        let record = OffsetRecord {
            path: self.real_path.clone(),
            offset,
        };
        atomic_write(&self.offset_file(), &serde_json::to_vec(&record)?)
    }

    /// Drop the stored offset.
    pub fn reset(&self) -> Result<()> {
        match fs::remove_file(self.offset_file()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn sub_meta_dir_name(real_path: &Path) -> String {
    real_path
        .to_string_lossy()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            other => other,
        })
        .collect()
}

fn sub_meta_age(dir: &Path) -> Option<Duration> {
    // Prefer the offset record's mtime: it advances on every flush, while
    // the directory's own mtime may not.
    let target = dir.join(OFFSET_FILE);
    let meta = fs::metadata(&target).or_else(|_| fs::metadata(dir)).ok()?;
    let mtime = meta.modified().ok()?;
    SystemTime::now().duration_since(mtime).ok()
}

/// Write bytes to `path` atomically (write to temp, then rename).
fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::Persistence(format!("failed to create parent directory: {}", e))
            })?;
        }
    }

    // Unique temp name so concurrent flushes never clobber each other.
    let unique_id = COUNTER.fetch_add(1, Ordering::SeqCst);
    let temp_path = path.with_extension(format!("tmp.{}.{}", std::process::id(), unique_id));

    let file = File::create(&temp_path)
        .map_err(|e| Error::Persistence(format!("failed to create temp file: {}", e)))?;
    let mut writer = BufWriter::new(file);
    writer
        .write_all(bytes)
        .map_err(|e| Error::Persistence(format!("failed to write record: {}", e)))?;
    writer
        .flush()
        .map_err(|e| Error::Persistence(format!("failed to flush record: {}", e)))?;
    drop(writer);

    fs::rename(&temp_path, path)
        .map_err(|e| Error::Persistence(format!("failed to rename record into place: {}", e)))?;

    Ok(())
}
