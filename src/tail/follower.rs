//! Per-file reading worker.
//!
//! A follower alternates two phases: fetch one logical line from its
//! [`LineBuffer`] into `read_cache`, then offer that line to the shared
//! result channel until the consumer takes it. The cached line is what
//! `sync_meta` hands to the engine for persistence, which is what makes
//! delivery at-least-once across restarts.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use regex::Regex;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, warn};

use super::status::{AtomicStatus, Status};
use super::{LineRecord, StatsInfo};
use crate::bounded_channel::{BoundedSender, SendError};
use crate::config::Whence;
use crate::error::{Error, Result};
use crate::input::{LagInfo, LineBuffer};
use crate::meta::{Meta, SubMeta};

/// Consecutive empty non-EOF polls before a follower turns inactive.
const MAX_EMPTY_POLLS: u32 = 3;
/// Log a stuck downstream after this many attempted sends of one line.
const STUCK_SEND_WARN_EVERY: u32 = 3000;
/// Pause between empty polls and between send attempts.
const POLL_PAUSE: Duration = Duration::from_secs(1);

struct FollowerCache {
    /// The line consumed from the byte stream but not yet delivered.
    read_cache: String,
    line_buffer: LineBuffer,
}

pub(crate) struct Follower {
    origin_path: PathBuf,
    real_path: PathBuf,
    runner_name: String,
    /// Guards `read_cache` and the line buffer: the reading task and
    /// `sync_meta` (the consumer thread) both touch them.
    cache: Mutex<FollowerCache>,
    status: AtomicStatus,
    /// Set after EOF or sustained empty polls; expiry only retires
    /// inactive followers.
    inactive: AtomicBool,
    stats: RwLock<StatsInfo>,
    result_tx: BoundedSender<LineRecord>,
    error_tx: BoundedSender<Error>,
}

impl Follower {
    pub fn new(
        origin_path: &Path,
        real_path: &Path,
        mut whence: Whence,
        not_first_time: bool,
        meta: &Meta,
        result_tx: BoundedSender<LineRecord>,
        error_tx: BoundedSender<Error>,
    ) -> Result<Arc<Self>> {
        let sub_meta = meta.new_sub_meta(real_path)?;

        // A file that appears while the agent already has history must be
        // read from the beginning or its early lines are lost.
        let has_history = meta.is_statistic_file_exist() || not_first_time;
        if has_history && sub_meta.is_not_exist() {
            whence = Whence::Oldest;
        }

        let line_buffer = LineBuffer::new(sub_meta, real_path, whence)?;

        Ok(Arc::new(Self {
            origin_path: origin_path.to_path_buf(),
            real_path: real_path.to_path_buf(),
            runner_name: meta.runner_name().to_string(),
            cache: Mutex::new(FollowerCache {
                read_cache: String::new(),
                line_buffer,
            }),
            status: AtomicStatus::new(Status::Init),
            inactive: AtomicBool::new(true),
            stats: RwLock::new(StatsInfo::default()),
            result_tx,
            error_tx,
        }))
    }

    pub fn origin_path(&self) -> &Path {
        &self.origin_path
    }

    pub fn real_path(&self) -> &Path {
        &self.real_path
    }

    /// Restore a line persisted by a previous run; it is re-offered before
    /// anything new is read.
    pub fn seed_read_cache(&self, line: String) {
        self.cache.lock().unwrap().read_cache = line;
    }

    pub fn set_head_pattern(&self, pattern: Regex) {
        self.cache
            .lock()
            .unwrap()
            .line_buffer
            .set_head_pattern(pattern);
    }

    pub fn sub_meta(&self) -> SubMeta {
        self.cache.lock().unwrap().line_buffer.sub_meta().clone()
    }

    /// Launch (or relaunch) the reading task. A follower stopped by EOF is
    /// re-entered through here when discovery sees its file change again.
    pub async fn start(self: &Arc<Self>) {
        match self.status.load() {
            Status::Running => {
                warn!(
                    runner = %self.runner_name,
                    path = %self.origin_path.display(),
                    "follower is already running"
                );
                return;
            }
            Status::Stopping => {
                // bounded wait for the previous task to settle
                let mut waited = 0u32;
                while self.status.load() != Status::Stopped {
                    waited += 1;
                    if waited > 300 {
                        error!(
                            runner = %self.runner_name,
                            path = %self.origin_path.display(),
                            "follower did not stop within 3s, forcing it"
                        );
                        break;
                    }
                    sleep(Duration::from_millis(10)).await;
                }
                self.status.transition(Status::Stopping, Status::Stopped);
            }
            _ => {}
        }

        self.status.store(Status::Init);
        let follower = self.clone();
        tokio::spawn(async move { follower.run().await });
    }

    /// Request a stop and wait (bounded, ~3s) for the reading task to exit.
    pub async fn stop(&self) -> Result<()> {
        if self.status.load() == Status::Stopped {
            return Ok(());
        }

        if !self.status.transition(Status::Running, Status::Stopping)
            && self.status.load() != Status::Stopping
        {
            let err = Error::NotRunning(format!(
                "follower for {} is neither running nor stopping",
                self.origin_path.display()
            ));
            debug!(runner = %self.runner_name, error = %err, "stop skipped");
            return Err(err);
        }
        debug!(
            runner = %self.runner_name,
            path = %self.origin_path.display(),
            "follower is closing"
        );

        let mut waited = 0u32;
        while self.status.load() != Status::Stopped {
            waited += 1;
            if waited > 3 {
                error!(
                    runner = %self.runner_name,
                    path = %self.origin_path.display(),
                    "follower did not stop within 3s, forcing it"
                );
                self.status.store(Status::Stopped);
                break;
            }
            sleep(POLL_PAUSE).await;
        }

        Ok(())
    }

    /// Release the file handle and stop the reading task.
    pub async fn close(&self) {
        self.cache.lock().unwrap().line_buffer.close();
        let _ = self.stop().await;
        debug!(
            runner = %self.runner_name,
            path = %self.origin_path.display(),
            "follower closed"
        );
    }

    async fn run(self: Arc<Self>) {
        if !self.status.transition(Status::Init, Status::Running) {
            debug!(
                runner = %self.runner_name,
                path = %self.origin_path.display(),
                "follower was not in init before running, exiting"
            );
            return;
        }

        let mut empty_line_cnt = 0u32;
        loop {
            if matches!(self.status.load(), Status::Stopping | Status::Stopped) {
                self.status.transition(Status::Stopping, Status::Stopped);
                debug!(
                    runner = %self.runner_name,
                    path = %self.origin_path.display(),
                    "follower stopped"
                );
                return;
            }

            // Fetch phase: refill the cache when it is empty.
            let fetch = {
                let mut cache = self.cache.lock().unwrap();
                if cache.read_cache.is_empty() {
                    match cache.line_buffer.read_line() {
                        Ok(line) => {
                            cache.read_cache = line;
                            Ok((
                                cache.read_cache.is_empty(),
                                cache.line_buffer.reached_eof(),
                            ))
                        }
                        Err(e) => Err(e),
                    }
                } else {
                    Ok((false, false))
                }
            };

            match fetch {
                // The handle was released under us. Usually a stop request
                // lands right after; the empty-poll counter covers the case
                // where it never does.
                Err(Error::Closed) => {
                    empty_line_cnt += 1;
                    if empty_line_cnt > MAX_EMPTY_POLLS {
                        self.inactive.store(true, Ordering::SeqCst);
                        self.self_stop();
                        return;
                    }
                    sleep(POLL_PAUSE).await;
                    continue;
                }
                Err(e) => {
                    warn!(
                        runner = %self.runner_name,
                        path = %self.origin_path.display(),
                        error = %e,
                        "read error, stopping follower"
                    );
                    self.set_last_error(e.to_string());
                    self.send_error(e).await;
                    self.self_stop();
                    return;
                }
                Ok((true, reached_eof)) => {
                    empty_line_cnt += 1;
                    if reached_eof {
                        // nothing more is coming for now; discovery restarts
                        // us when the file's mtime advances
                        self.inactive.store(true, Ordering::SeqCst);
                        debug!(
                            runner = %self.runner_name,
                            path = %self.origin_path.display(),
                            "reached EOF, follower is inactive now"
                        );
                        self.self_stop();
                        return;
                    }
                    if empty_line_cnt > MAX_EMPTY_POLLS {
                        self.inactive.store(true, Ordering::SeqCst);
                        debug!(
                            runner = %self.runner_name,
                            path = %self.origin_path.display(),
                            polls = empty_line_cnt,
                            "no content, follower is inactive now"
                        );
                        self.self_stop();
                        return;
                    }
                    sleep(POLL_PAUSE).await;
                    continue;
                }
                Ok((false, _)) => {}
            }

            // Deliver phase: offer the cached line until the consumer takes
            // it, re-checking status once a second so shutdown stays bounded.
            let mut repeat = 0u32;
            loop {
                let line = self.cache.lock().unwrap().read_cache.clone();
                if line.is_empty() {
                    break;
                }
                repeat += 1;
                if repeat % STUCK_SEND_WARN_EVERY == 0 {
                    error!(
                        runner = %self.runner_name,
                        path = %self.origin_path.display(),
                        attempts = repeat,
                        "downstream has not drained the pending line"
                    );
                }

                self.inactive.store(false, Ordering::SeqCst);
                empty_line_cnt = 0;

                if matches!(self.status.load(), Status::Stopping | Status::Stopped) {
                    debug!(
                        runner = %self.runner_name,
                        path = %self.origin_path.display(),
                        "follower stopped while waiting to send"
                    );
                    self.status.transition(Status::Stopping, Status::Stopped);
                    return;
                }

                let record = LineRecord {
                    line,
                    origin_path: self.origin_path.clone(),
                };
                match timeout(POLL_PAUSE, self.result_tx.send(record)).await {
                    Ok(Ok(())) => {
                        self.cache.lock().unwrap().read_cache.clear();
                    }
                    Ok(Err(SendError::Disconnected)) => {
                        debug!(
                            runner = %self.runner_name,
                            path = %self.origin_path.display(),
                            "result channel is gone, stopping follower"
                        );
                        self.self_stop();
                        return;
                    }
                    // timed out; re-check status and offer the line again
                    Err(_elapsed) => {}
                }
            }
        }
    }

    /// The run task is its own drainer, so it can go straight to Stopped.
    fn self_stop(&self) {
        self.status.transition(Status::Running, Status::Stopping);
        self.status.store(Status::Stopped);
    }

    fn set_last_error(&self, message: String) {
        self.stats.write().unwrap().last_error = message;
    }

    async fn send_error(&self, err: Error) {
        if matches!(self.status.load(), Status::Stopping | Status::Stopped) {
            debug!(
                runner = %self.runner_name,
                path = %self.origin_path.display(),
                "follower is closed, skipping error publication"
            );
            return;
        }
        match timeout(POLL_PAUSE, self.error_tx.send(err)).await {
            Ok(Ok(())) => {}
            Ok(Err(SendError::Disconnected)) | Err(_) => {
                debug!(
                    runner = %self.runner_name,
                    path = %self.origin_path.display(),
                    "error channel unavailable, dropping error"
                );
            }
        }
    }

    pub fn status_info(&self) -> StatsInfo {
        self.stats.read().unwrap().clone()
    }

    pub fn lag(&self) -> Result<LagInfo> {
        self.cache.lock().unwrap().line_buffer.lag()
    }

    /// Flush the offset and return the undelivered cached line (empty when
    /// there is none). The returned string is what the engine persists.
    pub fn sync_meta(&self) -> String {
        let cache = self.cache.lock().unwrap();
        if let Err(e) = cache.line_buffer.sync_meta() {
            warn!(
                runner = %self.runner_name,
                path = %self.origin_path.display(),
                error = %e,
                "failed to flush offset"
            );
        }
        cache.read_cache.clone()
    }

    pub fn reset_sub_meta(&self) -> Result<()> {
        self.cache.lock().unwrap().line_buffer.sub_meta().reset()
    }

    /// Whether this follower should be retired: inactive, and its file's
    /// mtime is more than `expire` in the past. A vanished file is expired
    /// outright; other stat errors keep the follower alive.
    pub fn expired(&self, expire: Duration) -> bool {
        if expire.is_zero() {
            return false;
        }

        let file_meta = match fs::metadata(&self.real_path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return true,
            Err(e) => {
                error!(
                    runner = %self.runner_name,
                    path = %self.origin_path.display(),
                    error = %e,
                    "stat failed, will not expire"
                );
                return false;
            }
        };
        let mtime = match file_meta.modified() {
            Ok(t) => t,
            Err(_) => return false,
        };

        mtime + expire < SystemTime::now() && self.inactive.load(Ordering::SeqCst)
    }
}
