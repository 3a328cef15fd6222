// SPDX-License-Identifier: Apache-2.0

//! The engine singleton: discovers files matching a glob pattern on a
//! timer, runs one [`Follower`] per live file, multiplexes their lines to a
//! single consumer, and checkpoints read positions through a [`Meta`].

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use regex::Regex;
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::follower::Follower;
use super::status::{AtomicStatus, Status};
use super::{LineRecord, StatsInfo};
use crate::bounded_channel::{rendezvous, BoundedReceiver, BoundedSender};
use crate::config::TailConfig;
use crate::error::{Error, Result};
use crate::input::LagInfo;
use crate::meta::Meta;

/// How often unregistered submeta directories are checked for expiry.
const SUBMETA_CHECK_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// How long `read_line` waits before reporting an idle poll.
const READ_LINE_TIMEOUT: Duration = Duration::from_secs(1);
/// Settle time between the stop broadcast and the final checkpoint.
const CLOSE_SETTLE: Duration = Duration::from_millis(10);

/// Line assembly modes applied to followers at creation.
#[derive(Debug, Clone)]
pub enum ReadMode {
    /// Join physical lines onto the preceding entry unless they match the
    /// head pattern.
    HeadPattern(String),
}

/// Mutable registry guarded by one mutex, held only around map access.
struct Registry {
    followers: HashMap<PathBuf, Arc<Follower>>,
    /// real path → line read but not yet delivered; persisted so a restart
    /// re-presents it (at-least-once).
    cache_map: HashMap<PathBuf, String>,
    /// Producer handles cloned into new followers; dropped at close so the
    /// channels tear down once every producer has stopped.
    result_tx: Option<BoundedSender<LineRecord>>,
    error_tx: Option<BoundedSender<Error>>,
}

pub struct TailReader {
    meta: Arc<Meta>,
    config: TailConfig,
    status: AtomicStatus,
    stop: CancellationToken,
    registry: Mutex<Registry>,
    result_rx: BoundedReceiver<LineRecord>,
    error_rx: BoundedReceiver<Error>,
    /// Origin path of the last delivered line. The caller is contracted to
    /// serialize `source` with `read_line`.
    current_file: Mutex<PathBuf>,
    head_pattern: Mutex<Option<Regex>>,
    stats: RwLock<StatsInfo>,
    /// False only until the first discovery pass completes; afterwards new
    /// files are always read from the beginning.
    not_first_time: AtomicBool,
}

impl TailReader {
    pub fn new(meta: Arc<Meta>, config: TailConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let cache_map = match meta.read_buf() {
            Ok(Some(buf)) => match serde_json::from_slice::<HashMap<PathBuf, String>>(&buf) {
                Ok(map) => map,
                Err(e) => {
                    warn!(
                        runner = %meta.runner_name(),
                        error = %e,
                        "could not decode persisted line cache, ignoring it"
                    );
                    HashMap::new()
                }
            },
            Ok(None) => HashMap::new(),
            Err(e) => {
                warn!(
                    runner = %meta.runner_name(),
                    error = %e,
                    "could not read persisted line cache, ignoring it"
                );
                HashMap::new()
            }
        };

        let (result_tx, result_rx) = rendezvous();
        let (error_tx, error_rx) = rendezvous();

        Ok(Arc::new(Self {
            meta,
            config,
            status: AtomicStatus::new(Status::Init),
            stop: CancellationToken::new(),
            registry: Mutex::new(Registry {
                followers: HashMap::new(),
                cache_map,
                result_tx: Some(result_tx),
                error_tx: Some(error_tx),
            }),
            result_rx,
            error_rx,
            current_file: Mutex::new(PathBuf::new()),
            head_pattern: Mutex::new(None),
            stats: RwLock::new(StatsInfo::default()),
            not_first_time: AtomicBool::new(false),
        }))
    }

    pub fn name(&self) -> String {
        format!("TailxReader: {}", self.config.log_path_pattern)
    }

    /// Origin path of the last line handed out by `read_line`.
    pub fn source(&self) -> PathBuf {
        self.current_file.lock().unwrap().clone()
    }

    /// Number of live followers (open files).
    pub fn open_files(&self) -> usize {
        self.registry.lock().unwrap().followers.len()
    }

    /// Compile a line-assembly mode. Applies to followers created after the
    /// call; existing followers keep their mode.
    pub fn set_mode(&self, mode: ReadMode) -> Result<()> {
        match mode {
            ReadMode::HeadPattern(pattern) => {
                let compiled = Regex::new(&pattern)
                    .map_err(|e| Error::Config(format!("head pattern '{}': {}", pattern, e)))?;
                *self.head_pattern.lock().unwrap() = Some(compiled);
            }
        }
        Ok(())
    }

    /// Launch the discovery ticker (and the submeta TTL ticker when
    /// configured). Idempotent while running; an error once stopped.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if matches!(self.status.load(), Status::Stopping | Status::Stopped) {
            return Err(Error::NotRunning(
                "reader is stopping or has stopped".to_string(),
            ));
        }
        if !self.status.transition(Status::Init, Status::Running) {
            warn!(
                runner = %self.meta.runner_name(),
                name = %self.name(),
                "daemon has already started"
            );
            return Ok(());
        }

        let reader = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(reader.config.stat_interval);
            ticker.tick().await; // the first tick completes immediately
            loop {
                reader.check_expired_files().await;
                reader.stat_log_path().await;

                tokio::select! {
                    _ = reader.stop.cancelled() => {
                        reader.status.store(Status::Stopped);
                        info!(
                            runner = %reader.meta.runner_name(),
                            name = %reader.name(),
                            "daemon has stopped"
                        );
                        return;
                    }
                    _ = ticker.tick() => {}
                }
            }
        });

        if self.submeta_expire_active() {
            let reader = self.clone();
            tokio::spawn(async move {
                let mut ticker = interval(SUBMETA_CHECK_INTERVAL);
                ticker.tick().await;
                loop {
                    reader
                        .meta
                        .check_expired_sub_metas(reader.config.submeta_expire);

                    tokio::select! {
                        _ = reader.stop.cancelled() => return,
                        _ = ticker.tick() => {}
                    }
                }
            });
        }

        info!(
            runner = %self.meta.runner_name(),
            name = %self.name(),
            "daemon has started"
        );
        Ok(())
    }

    /// Wait up to one second for the next line from any follower. `Ok(None)`
    /// is the benign idle signal the caller polls on.
    pub async fn read_line(&self) -> Result<Option<String>> {
        tokio::select! {
            biased;
            msg = self.result_rx.recv() => match msg {
                Some(record) => {
                    *self.current_file.lock().unwrap() = record.origin_path;
                    Ok(Some(record.line))
                }
                None => Ok(None), // channels torn down during close
            },
            err = self.error_rx.recv() => match err {
                Some(e) => Err(e),
                None => Ok(None),
            },
            _ = sleep(READ_LINE_TIMEOUT) => Ok(None),
        }
    }

    /// Engine status plus every follower's last error.
    pub fn status(&self) -> StatsInfo {
        let mut stats = self.stats.read().unwrap().clone();
        for follower in self.follower_snapshot() {
            let sub = follower.status_info();
            if !sub.last_error.is_empty() {
                stats.last_error.push_str(&format!(
                    "\n<{}>: {}",
                    follower.origin_path().display(),
                    sub.last_error
                ));
            }
        }
        stats
    }

    /// Total unread bytes across followers. Per-follower failures are
    /// aggregated into the returned error; the sum stays partial, not lost.
    pub fn lag(&self) -> (LagInfo, Option<Error>) {
        let mut info = LagInfo {
            size: 0,
            size_unit: "bytes",
        };
        let mut errors = String::new();
        for follower in self.follower_snapshot() {
            match follower.lag() {
                Ok(sub) => info.size += sub.size,
                Err(e) => {
                    warn!(
                        runner = %self.meta.runner_name(),
                        path = %follower.origin_path().display(),
                        error = %e,
                        "lag query failed"
                    );
                    errors.push_str(&e.to_string());
                }
            }
        }
        let err = if errors.is_empty() {
            None
        } else {
            Some(Error::Aggregate(errors))
        };
        (info, err)
    }

    /// Checkpoint: flush every follower's offset, fold each undelivered
    /// cached line into the cache map, and persist the serialized map.
    pub fn sync_meta(&self) {
        for follower in self.follower_snapshot() {
            let read_cache = follower.sync_meta();
            if read_cache.is_empty() {
                continue;
            }
            self.registry
                .lock()
                .unwrap()
                .cache_map
                .insert(follower.real_path().to_path_buf(), read_cache);
        }

        let encoded = {
            let registry = self.registry.lock().unwrap();
            serde_json::to_vec(&registry.cache_map)
        };
        let buf = match encoded {
            Ok(buf) => buf,
            Err(e) => {
                error!(
                    runner = %self.meta.runner_name(),
                    name = %self.name(),
                    error = %e,
                    "could not serialize line cache"
                );
                return;
            }
        };
        if let Err(e) = self.meta.write_buf(&buf) {
            error!(
                runner = %self.meta.runner_name(),
                name = %self.name(),
                error = %e,
                "could not persist line cache"
            );
            return;
        }

        if self.submeta_expire_active() {
            self.meta
                .clean_expired_sub_metas(self.config.submeta_expire);
        }
    }

    /// Stop discovery, checkpoint, close every follower, and tear down the
    /// channels. No-op unless the engine is running.
    pub async fn close(&self) {
        if !self.status.transition(Status::Running, Status::Stopping) {
            warn!(
                runner = %self.meta.runner_name(),
                name = %self.name(),
                "reader is not running, close ignored"
            );
            return;
        }
        debug!(
            runner = %self.meta.runner_name(),
            name = %self.name(),
            "daemon is stopping"
        );
        self.stop.cancel();

        // let in-flight sends settle so the checkpoint sees final caches
        sleep(CLOSE_SETTLE).await;
        self.sync_meta();

        let followers = self.follower_snapshot();
        let mut closers = JoinSet::new();
        for follower in followers {
            closers.spawn(async move { follower.close().await });
        }
        while let Some(joined) = closers.join_next().await {
            if let Err(e) = joined {
                error!(
                    runner = %self.meta.runner_name(),
                    error = %e,
                    "follower close task failed"
                );
            }
        }

        // all producers have stopped; releasing the followers and our own
        // sender handles drops every sender clone, which closes the
        // channels for any remaining consumer
        let mut registry = self.registry.lock().unwrap();
        registry.followers.clear();
        registry.result_tx = None;
        registry.error_tx = None;
    }

    /// Drop all persisted positions: the engine blob and every live
    /// follower's offset.
    pub fn reset(&self) -> Result<()> {
        let mut errors = Vec::new();
        if let Err(e) = self.meta.reset() {
            errors.push(e.to_string());
        }
        for follower in self.follower_snapshot() {
            if let Err(e) = follower.reset_sub_meta() {
                errors.push(e.to_string());
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Aggregate(errors.join("\n")))
        }
    }

    fn submeta_expire_active(&self) -> bool {
        !self.config.submeta_expire.is_zero() && self.config.submeta_expire >= self.config.expire
    }

    fn follower_snapshot(&self) -> Vec<Arc<Follower>> {
        self.registry
            .lock()
            .unwrap()
            .followers
            .values()
            .cloned()
            .collect()
    }

    fn set_last_error(&self, message: String) {
        self.stats.write().unwrap().last_error = message;
    }

    async fn send_error(&self, err: Error) {
        let error_tx = match self.registry.lock().unwrap().error_tx.clone() {
            Some(tx) => tx,
            None => return,
        };
        if timeout(READ_LINE_TIMEOUT, error_tx.send(err)).await.is_err() {
            debug!(
                runner = %self.meta.runner_name(),
                "no consumer for error, dropping it"
            );
        }
    }

    /// Expire sweep: retire followers whose file has gone quiet past
    /// `expire`, dropping their cache entry and submeta with them.
    async fn check_expired_files(&self) {
        let expire = self.config.expire;
        let candidates: Vec<(PathBuf, Arc<Follower>)> = {
            let registry = self.registry.lock().unwrap();
            registry
                .followers
                .iter()
                .map(|(path, follower)| (path.clone(), follower.clone()))
                .collect()
        };
        // the expiry predicate stats the file, so it runs outside the lock
        let expired: Vec<(PathBuf, Arc<Follower>)> = candidates
            .into_iter()
            .filter(|(_, follower)| follower.expired(expire))
            .collect();
        if expired.is_empty() {
            return;
        }

        let mut retired = Vec::new();
        for (path, follower) in expired {
            follower.close().await;
            {
                let mut registry = self.registry.lock().unwrap();
                registry.followers.remove(&path);
                registry.cache_map.remove(&path);
            }
            if let Err(e) = self.meta.remove_sub_meta(&path) {
                warn!(
                    runner = %self.meta.runner_name(),
                    path = %path.display(),
                    error = %e,
                    "failed to remove submeta"
                );
            }
            retired.push(path);
        }
        info!(
            runner = %self.meta.runner_name(),
            paths = ?retired,
            "retired expired files"
        );
    }

    /// Reconcile sweep: glob the include/exclude patterns and bring the
    /// follower set in line with what is on disk.
    async fn stat_log_path(&self) {
        if self.open_files() >= self.config.max_open_files {
            warn!(
                runner = %self.meta.runner_name(),
                name = %self.name(),
                limit = self.config.max_open_files,
                "max open files reached, skipping discovery"
            );
            return;
        }

        let matches = match glob::glob(&self.config.log_path_pattern) {
            Ok(paths) => paths,
            Err(e) => {
                let message = format!(
                    "glob pattern {} failed: {}",
                    self.config.log_path_pattern, e
                );
                error!(runner = %self.meta.runner_name(), "{}", message);
                self.set_last_error(message);
                return;
            }
        };
        let matches: Vec<PathBuf> = matches
            .filter_map(|entry| match entry {
                Ok(path) => Some(path),
                Err(e) => {
                    debug!(
                        runner = %self.meta.runner_name(),
                        error = %e,
                        "skipping unreadable glob match"
                    );
                    None
                }
            })
            .collect();

        let mut exclude: HashSet<PathBuf> = HashSet::new();
        if !self.config.ignore_log_path_pattern.is_empty() {
            match glob::glob(&self.config.ignore_log_path_pattern) {
                Ok(paths) => exclude = paths.filter_map(|entry| entry.ok()).collect(),
                Err(e) => {
                    let message = format!(
                        "ignore glob pattern {} failed: {}",
                        self.config.ignore_log_path_pattern, e
                    );
                    error!(runner = %self.meta.runner_name(), "{}", message);
                    self.set_last_error(message);
                    return;
                }
            }
        }

        let now = SystemTime::now();
        let mut new_paths = Vec::new();
        for origin in matches {
            if exclude.contains(&origin) {
                continue;
            }
            let (real_path, file_meta) = match resolve_real_path(&origin) {
                Ok(resolved) => resolved,
                Err(e) => {
                    debug!(
                        runner = %self.meta.runner_name(),
                        path = %origin.display(),
                        error = %e,
                        "stat failed, skipping match"
                    );
                    continue;
                }
            };
            if file_meta.is_dir() {
                debug!(
                    runner = %self.meta.runner_name(),
                    path = %origin.display(),
                    "directories are not followed, skipping"
                );
                continue;
            }

            let existing = {
                self.registry
                    .lock()
                    .unwrap()
                    .followers
                    .get(&real_path)
                    .cloned()
            };
            if let Some(follower) = existing {
                // a write within the current window revives a stopped
                // follower
                if modified_within(&file_meta, self.config.stat_interval, now) {
                    follower.start().await;
                }
                continue;
            }

            let cached_line = {
                self.registry
                    .lock()
                    .unwrap()
                    .cache_map
                    .get(&real_path)
                    .cloned()
                    .unwrap_or_default()
            };
            // an already-stale file with nothing to recover is not worth a
            // follower
            if cached_line.is_empty() && !self.config.expire.is_zero() {
                if let Ok(mtime) = file_meta.modified() {
                    if mtime + self.config.expire < now {
                        debug!(
                            runner = %self.meta.runner_name(),
                            path = %origin.display(),
                            "match is already expired, skipping"
                        );
                        continue;
                    }
                }
            }

            if self.open_files() >= self.config.max_open_files {
                warn!(
                    runner = %self.meta.runner_name(),
                    name = %self.name(),
                    limit = self.config.max_open_files,
                    "max open files reached mid-scan, deferring remaining matches"
                );
                break;
            }

            let (result_tx, error_tx) = {
                let registry = self.registry.lock().unwrap();
                match (&registry.result_tx, &registry.error_tx) {
                    (Some(result_tx), Some(error_tx)) => (result_tx.clone(), error_tx.clone()),
                    _ => return, // tearing down
                }
            };
            let not_first_time = self.not_first_time.load(Ordering::SeqCst);
            let follower = match Follower::new(
                &origin,
                &real_path,
                self.config.whence,
                not_first_time,
                &self.meta,
                result_tx,
                error_tx,
            ) {
                Ok(follower) => follower,
                Err(e) => {
                    error!(
                        runner = %self.meta.runner_name(),
                        path = %real_path.display(),
                        error = %e,
                        "could not follow file, skipping this match"
                    );
                    self.send_error(e).await;
                    continue;
                }
            };

            if !cached_line.is_empty() {
                follower.seed_read_cache(cached_line);
            }
            if let Some(pattern) = self.head_pattern.lock().unwrap().clone() {
                follower.set_head_pattern(pattern);
            }

            let registered = {
                let mut registry = self.registry.lock().unwrap();
                if matches!(self.status.load(), Status::Stopping | Status::Stopped) {
                    warn!(
                        runner = %self.meta.runner_name(),
                        path = %origin.display(),
                        "reader stopped, dropping new follower"
                    );
                    false
                } else {
                    if let Err(e) = self.meta.add_sub_meta(&real_path, follower.sub_meta()) {
                        warn!(
                            runner = %self.meta.runner_name(),
                            path = %real_path.display(),
                            error = %e,
                            "submeta registration failed, follower will still run"
                        );
                    }
                    registry
                        .followers
                        .insert(real_path.clone(), follower.clone());
                    true
                }
            };
            if registered {
                follower.start().await;
                new_paths.push(real_path);
            }
        }

        self.not_first_time.store(true, Ordering::SeqCst);
        if !new_paths.is_empty() {
            info!(
                runner = %self.meta.runner_name(),
                paths = ?new_paths,
                "following new files"
            );
        }
    }
}

fn resolve_real_path(origin: &Path) -> std::io::Result<(PathBuf, fs::Metadata)> {
    let real_path = fs::canonicalize(origin)?;
    let file_meta = fs::metadata(&real_path)?;
    Ok((real_path, file_meta))
}

fn modified_within(file_meta: &fs::Metadata, window: Duration, now: SystemTime) -> bool {
    match file_meta.modified() {
        Ok(mtime) => match now.duration_since(mtime) {
            Ok(age) => age <= window,
            // mtime in the future counts as just modified
            Err(_) => true,
        },
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Whence;
    use tempfile::TempDir;

    fn config(pattern: &str) -> TailConfig {
        TailConfig {
            log_path_pattern: pattern.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let meta = Arc::new(Meta::new("test", dir.path().join("meta")).unwrap());
        assert!(TailReader::new(meta, TailConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_name_includes_pattern() {
        let dir = TempDir::new().unwrap();
        let meta = Arc::new(Meta::new("test", dir.path().join("meta")).unwrap());
        let reader = TailReader::new(meta, config("/tmp/logs/*.log")).unwrap();
        assert_eq!(reader.name(), "TailxReader: /tmp/logs/*.log");
    }

    #[tokio::test]
    async fn test_set_mode_rejects_bad_pattern() {
        let dir = TempDir::new().unwrap();
        let meta = Arc::new(Meta::new("test", dir.path().join("meta")).unwrap());
        let reader = TailReader::new(meta, config("/tmp/logs/*.log")).unwrap();
        assert!(reader
            .set_mode(ReadMode::HeadPattern("(".to_string()))
            .is_err());
        assert!(reader
            .set_mode(ReadMode::HeadPattern(r"^\d{4}".to_string()))
            .is_ok());
    }

    #[tokio::test]
    async fn test_corrupted_cache_blob_is_ignored() {
        let dir = TempDir::new().unwrap();
        let meta = Arc::new(Meta::new("test", dir.path().join("meta")).unwrap());
        meta.write_buf(b"not json").unwrap();
        let reader = TailReader::new(meta, config("/tmp/logs/*.log")).unwrap();
        assert_eq!(reader.open_files(), 0);
    }

    #[tokio::test]
    async fn test_close_before_start_is_ignored() {
        let dir = TempDir::new().unwrap();
        let meta = Arc::new(Meta::new("test", dir.path().join("meta")).unwrap());
        let reader = TailReader::new(meta, config("/tmp/logs/*.log")).unwrap();
        reader.close().await;
        assert_eq!(reader.status.load(), Status::Init);
    }

    #[tokio::test]
    async fn test_start_twice_is_idempotent() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("logs")).unwrap();
        let meta = Arc::new(Meta::new("test", dir.path().join("meta")).unwrap());
        let pattern = format!("{}/logs/*.log", dir.path().display());
        let reader = TailReader::new(meta, {
            let mut c = config(&pattern);
            c.whence = Whence::Oldest;
            c
        })
        .unwrap();
        reader.start().unwrap();
        reader.start().unwrap();
        reader.close().await;
        assert!(reader.start().is_err());
    }
}
