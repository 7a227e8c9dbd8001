//! Runner side of the progress channel

use super::ProgressMessage;
use crate::config::ProgressChannelKind;
use crate::error::{PipelineError, Result, ResultExt};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Sends progress messages back to the host
pub enum ProgressWriter {
    #[cfg(unix)]
    Socket(std::os::unix::net::UnixStream),
    Files { dir: PathBuf, next: u64 },
    /// No host is listening
    Null,
}

impl ProgressWriter {
    /// Connect to the host's reader of `kind` at `path`
    pub fn connect(kind: ProgressChannelKind, path: &Path) -> Result<Self> {
        match super::resolve_channel(kind) {
            ProgressChannelKind::Socket => Self::connect_socket(path),
            _ => {
                std::fs::create_dir_all(path)
                    .with_context(|| format!("creating progress directory {}", path.display()))?;
                Ok(ProgressWriter::Files {
                    dir: path.to_path_buf(),
                    next: 0,
                })
            }
        }
    }

    #[cfg(unix)]
    fn connect_socket(path: &Path) -> Result<Self> {
        let stream = std::os::unix::net::UnixStream::connect(path).map_err(|e| {
            PipelineError::Progress(format!("cannot connect to {}: {}", path.display(), e))
        })?;
        Ok(ProgressWriter::Socket(stream))
    }

    #[cfg(not(unix))]
    fn connect_socket(path: &Path) -> Result<Self> {
        Err(PipelineError::Progress(format!(
            "local sockets are not available, cannot connect to {}",
            path.display()
        )))
    }

    pub fn send(&mut self, message: &ProgressMessage) -> Result<()> {
        let line = message.to_line()?;
        match self {
            #[cfg(unix)]
            ProgressWriter::Socket(stream) => {
                stream.write_all(line.as_bytes())?;
                stream.flush()?;
            }
            ProgressWriter::Files { dir, next } => {
                // Write under a hidden name first so the reader never sees a partial file
                let name = format!("{:010}", *next);
                *next += 1;
                let staging = dir.join(format!(".{}.tmp", name));
                let mut file = std::fs::File::create(&staging)?;
                file.write_all(line.as_bytes())?;
                file.sync_all()?;
                drop(file);
                std::fs::rename(&staging, dir.join(name))?;
            }
            ProgressWriter::Null => {}
        }
        Ok(())
    }

    /// Send, logging instead of failing
    pub fn report(&mut self, message: ProgressMessage) {
        if let Err(e) = self.send(&message) {
            tracing::warn!("failed to send progress message: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{FilesProgressReader, MessageKind, ProgressReader};
    use std::time::Duration;

    #[test]
    fn test_files_writer_is_read_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress");
        let mut writer = ProgressWriter::connect(ProgressChannelKind::Files, &path).unwrap();
        for step in 0..3u64 {
            writer
                .send(&ProgressMessage::operator(MessageKind::ProgressStep, 0).with_value(step))
                .unwrap();
        }

        let mut reader = FilesProgressReader::new(&path);
        reader.start().unwrap();
        let rx = reader.messages().clone();
        let steps: Vec<u64> = (0..3)
            .map(|_| {
                let line = rx.recv_timeout(Duration::from_secs(5)).unwrap();
                ProgressMessage::parse(&line).unwrap().value_u64().unwrap()
            })
            .collect();
        assert_eq!(steps, vec![0, 1, 2]);
    }

    #[cfg(unix)]
    #[test]
    fn test_socket_writer_reaches_reader() {
        use crate::progress::LocalSocketProgressReader;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress");
        let mut reader = LocalSocketProgressReader::new(&path);
        reader.start().unwrap();

        let mut writer = ProgressWriter::connect(ProgressChannelKind::Socket, &path).unwrap();
        writer.report(ProgressMessage::pipeline(MessageKind::Started));

        let line = reader.messages().recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(
            ProgressMessage::parse(&line).unwrap(),
            ProgressMessage::pipeline(MessageKind::Started)
        );
    }

    #[test]
    fn test_null_writer_accepts_everything() {
        let mut writer = ProgressWriter::Null;
        assert!(writer.send(&ProgressMessage::pipeline(MessageKind::Finished)).is_ok());
    }
}
