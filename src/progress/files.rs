//! Watched-directory transport
//!
//! Each message is one small file. Files are read in name order, emitted and
//! deleted. A file that reads back empty is assumed to still be in the
//! middle of being written and is retried shortly after.

use super::ProgressReader;
use crate::config::ProgressChannelKind;
use crate::error::{PipelineError, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::Duration;

/// Fallback rescan when no watcher event arrives
const RESCAN_INTERVAL: Duration = Duration::from_millis(250);
/// Delay before re-reading a file that was still empty
const EMPTY_RETRY: Duration = Duration::from_millis(10);

enum Signal {
    Changed,
    Stop,
}

pub struct FilesProgressReader {
    path: PathBuf,
    tx: Sender<String>,
    rx: Receiver<String>,
    signal_tx: Option<Sender<Signal>>,
    watcher: Option<RecommendedWatcher>,
    thread: Option<JoinHandle<()>>,
}

impl FilesProgressReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            path: path.into(),
            tx,
            rx,
            signal_tx: None,
            watcher: None,
            thread: None,
        }
    }
}

/// Emit every complete message file in `dir`. Returns true when some file
/// was still empty and needs another look.
fn check_for_progress_files(dir: &Path, tx: &Sender<String>) -> bool {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::error!(path = %dir.display(), "cannot list progress directory: {}", e);
            return false;
        }
    };

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter(|entry| !entry.file_name().to_string_lossy().starts_with('.'))
        .map(|entry| entry.path())
        .collect();
    files.sort();

    let mut retry = false;
    for file in files {
        let content = match std::fs::read_to_string(&file) {
            Ok(content) => content,
            // Removed between listing and reading
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                tracing::error!(path = %file.display(), "unable to read progress file: {}", e);
                continue;
            }
        };

        let line = content.lines().next().unwrap_or("").trim();
        if line.is_empty() {
            retry = true;
            continue;
        }

        let _ = tx.send(line.to_string());
        if let Err(e) = std::fs::remove_file(&file) {
            tracing::warn!(path = %file.display(), "unable to remove progress file: {}", e);
        }
    }
    retry
}

impl ProgressReader for FilesProgressReader {
    fn start(&mut self) -> Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.path)?;

        let (signal_tx, signal_rx) = crossbeam_channel::unbounded();
        let watch_tx = signal_tx.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(_) => {
                    let _ = watch_tx.send(Signal::Changed);
                }
                Err(e) => tracing::warn!("progress watcher error: {}", e),
            }
        })
        .map_err(|e| PipelineError::Progress(format!("cannot create watcher: {}", e)))?;
        watcher
            .watch(&self.path, RecursiveMode::NonRecursive)
            .map_err(|e| {
                PipelineError::Progress(format!("cannot watch {}: {}", self.path.display(), e))
            })?;

        let dir = self.path.clone();
        let tx = self.tx.clone();
        let thread = std::thread::Builder::new()
            .name("progress-files".to_string())
            .spawn(move || {
                let mut wait = RESCAN_INTERVAL;
                loop {
                    match signal_rx.recv_timeout(wait) {
                        Ok(Signal::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                        Ok(Signal::Changed) | Err(RecvTimeoutError::Timeout) => {}
                    }
                    // Coalesce bursts of watcher events
                    while let Ok(signal) = signal_rx.try_recv() {
                        if matches!(signal, Signal::Stop) {
                            return;
                        }
                    }
                    wait = if check_for_progress_files(&dir, &tx) {
                        EMPTY_RETRY
                    } else {
                        RESCAN_INTERVAL
                    };
                }
            })?;

        self.signal_tx = Some(signal_tx);
        self.watcher = Some(watcher);
        self.thread = Some(thread);
        tracing::debug!(path = %self.path.display(), "watching progress directory");
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            let _ = watcher.unwatch(&self.path);
        }
        if let Some(signal_tx) = self.signal_tx.take() {
            let _ = signal_tx.send(Signal::Stop);
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("progress files thread panicked");
            }
            // Messages written before stop still count
            check_for_progress_files(&self.path, &self.tx);
        }
    }

    fn messages(&self) -> &Receiver<String> {
        &self.rx
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn kind(&self) -> ProgressChannelKind {
        ProgressChannelKind::Files
    }
}

impl Drop for FilesProgressReader {
    fn drop(&mut self) {
        self.stop();
    }
}
