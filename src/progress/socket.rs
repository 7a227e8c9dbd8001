//! Local socket transport

use super::ProgressReader;
use crate::config::ProgressChannelKind;
use crate::error::{PipelineError, Result};
use crossbeam_channel::{Receiver, Sender};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
#[cfg(unix)]
use std::time::Duration;

#[cfg(unix)]
const ACCEPT_POLL: Duration = Duration::from_millis(20);
#[cfg(unix)]
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Whether this host can serve progress over a local socket
///
/// Probed once per process by binding a throwaway socket.
pub fn socket_supported() -> bool {
    static SUPPORTED: OnceLock<bool> = OnceLock::new();
    *SUPPORTED.get_or_init(probe_socket)
}

#[cfg(unix)]
fn probe_socket() -> bool {
    let Ok(dir) = tempfile::tempdir() else {
        return false;
    };
    let supported = std::os::unix::net::UnixListener::bind(dir.path().join("probe")).is_ok();
    tracing::debug!(supported, "local socket probe");
    supported
}

#[cfg(not(unix))]
fn probe_socket() -> bool {
    false
}

/// Listens on a local socket; the runner connects and writes lines
pub struct LocalSocketProgressReader {
    path: PathBuf,
    tx: Sender<String>,
    rx: Receiver<String>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl LocalSocketProgressReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            path: path.into(),
            tx,
            rx,
            stop: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }
}

#[cfg(unix)]
fn serve(listener: std::os::unix::net::UnixListener, tx: Sender<String>, stop: Arc<AtomicBool>) {
    use std::io::{BufRead, BufReader, ErrorKind};

    while !stop.load(Ordering::Acquire) {
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
                continue;
            }
            Err(e) => {
                tracing::error!("progress socket accept failed: {}", e);
                std::thread::sleep(ACCEPT_POLL);
                continue;
            }
        };
        tracing::debug!("progress connection accepted");

        if let Err(e) = stream
            .set_nonblocking(false)
            .and_then(|_| stream.set_read_timeout(Some(READ_TIMEOUT)))
        {
            tracing::error!("progress socket setup failed: {}", e);
            continue;
        }

        let mut reader = BufReader::new(stream);
        let mut pending = Vec::new();
        loop {
            if stop.load(Ordering::Acquire) {
                return;
            }
            match reader.read_until(b'\n', &mut pending) {
                // Peer closed
                Ok(0) => break,
                Ok(_) => {
                    if pending.last() != Some(&b'\n') {
                        // EOF in the middle of a line
                        deliver(&tx, &pending);
                        break;
                    }
                    deliver(&tx, &pending);
                    pending.clear();
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(e) if e.kind() == ErrorKind::ConnectionReset => break,
                Err(e) => {
                    tracing::error!("progress socket error: {}", e);
                    break;
                }
            }
        }
    }
}

#[cfg(unix)]
fn deliver(tx: &Sender<String>, bytes: &[u8]) {
    let line = String::from_utf8_lossy(bytes);
    let line = line.trim();
    if !line.is_empty() {
        let _ = tx.send(line.to_string());
    }
}

impl ProgressReader for LocalSocketProgressReader {
    #[cfg(unix)]
    fn start(&mut self) -> Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        let listener = std::os::unix::net::UnixListener::bind(&self.path).map_err(|e| {
            PipelineError::Progress(format!("cannot listen on {}: {}", self.path.display(), e))
        })?;
        listener.set_nonblocking(true)?;

        self.stop.store(false, Ordering::Release);
        let tx = self.tx.clone();
        let stop = self.stop.clone();
        let thread = std::thread::Builder::new()
            .name("progress-socket".to_string())
            .spawn(move || serve(listener, tx, stop))?;
        self.thread = Some(thread);
        tracing::debug!(path = %self.path.display(), "progress socket listening");
        Ok(())
    }

    #[cfg(not(unix))]
    fn start(&mut self) -> Result<()> {
        Err(PipelineError::Progress(
            "local sockets are not available on this platform".to_string(),
        ))
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("progress socket thread panicked");
            }
            let _ = std::fs::remove_file(&self.path);
        }
    }

    fn messages(&self) -> &Receiver<String> {
        &self.rx
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn kind(&self) -> ProgressChannelKind {
        ProgressChannelKind::Socket
    }
}

impl Drop for LocalSocketProgressReader {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    #[test]
    fn test_reads_newline_delimited_messages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress");
        let mut reader = LocalSocketProgressReader::new(&path);
        reader.start().unwrap();

        let mut stream = UnixStream::connect(&path).unwrap();
        stream
            .write_all(b"{\"type\":\"started\"}\n{\"type\":\"progress.step\",\"operator\":0,\"value\":1}\n")
            .unwrap();
        // A line split across writes
        stream.write_all(b"{\"type\":\"fin").unwrap();
        stream.flush().unwrap();
        std::thread::sleep(Duration::from_millis(150));
        stream.write_all(b"ished\"}\n").unwrap();
        drop(stream);

        let rx = reader.messages().clone();
        let timeout = Duration::from_secs(5);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), "{\"type\":\"started\"}");
        assert!(rx.recv_timeout(timeout).unwrap().contains("progress.step"));
        assert_eq!(rx.recv_timeout(timeout).unwrap(), "{\"type\":\"finished\"}");

        reader.stop();
        assert!(!path.exists());
    }

    #[test]
    fn test_accepts_a_new_connection_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress");
        let mut reader = LocalSocketProgressReader::new(&path);
        reader.start().unwrap();

        for n in 0..2 {
            let mut stream = UnixStream::connect(&path).unwrap();
            writeln!(stream, "{{\"type\":\"progress.step\",\"operator\":0,\"value\":{}}}", n).unwrap();
        }

        let rx = reader.messages().clone();
        let mut got = Vec::new();
        for _ in 0..2 {
            got.push(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        }
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn test_socket_supported_on_unix() {
        assert!(socket_supported());
    }
}
