//! Inbound file receiver (§4.9), grounded on `agent/file_receiver.py`.

use crate::error::{CoreError, CoreResult};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Receives at most one in-flight file per session: collision-safe naming,
/// chunked writes, and progress tracking.
pub struct FileReceiver {
    save_dir: PathBuf,
    current: Option<ActiveTransfer>,
}

struct ActiveTransfer {
    file: File,
    path: PathBuf,
    declared_size: u64,
    received: u64,
}

impl std::fmt::Debug for FileReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileReceiver")
            .field("save_dir", &self.save_dir)
            .field("is_receiving", &self.is_receiving())
            .finish()
    }
}

impl FileReceiver {
    pub fn new(save_dir: impl Into<PathBuf>) -> Self {
        Self {
            save_dir: save_dir.into(),
            current: None,
        }
    }

    pub fn is_receiving(&self) -> bool {
        self.current.is_some()
    }

    /// Declared size of the in-flight transfer, if any.
    pub fn declared_size(&self) -> Option<u64> {
        self.current.as_ref().map(|t| t.declared_size)
    }

    /// Fraction of the declared size received so far, clamped to `0.0..=1.0`.
    pub fn progress(&self) -> f64 {
        match &self.current {
            Some(t) if t.declared_size > 0 => {
                (t.received as f64 / t.declared_size as f64).min(1.0)
            }
            _ => 0.0,
        }
    }

    /// Begin receiving `name` (size `declared_size`), creating the save
    /// directory if needed and suffixing `(N)` on a name collision.
    pub fn begin_file(&mut self, name: &str, declared_size: u64) -> CoreResult<()> {
        if self.current.is_some() {
            return Err(CoreError::FileTransfer(
                "a file transfer is already in progress for this session".into(),
            ));
        }
        std::fs::create_dir_all(&self.save_dir)?;
        let path = Self::unique_path(&self.save_dir, name);
        let file = File::create(&path)?;
        self.current = Some(ActiveTransfer {
            file,
            path,
            declared_size,
            received: 0,
        });
        Ok(())
    }

    fn unique_path(dir: &Path, name: &str) -> PathBuf {
        let candidate = dir.join(name);
        if !candidate.exists() {
            return candidate;
        }
        let stem = Path::new(name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(name);
        let ext = Path::new(name).extension().and_then(|s| s.to_str());

        for n in 1.. {
            let candidate_name = match ext {
                Some(ext) => format!("{stem} ({n}).{ext}"),
                None => format!("{stem} ({n})"),
            };
            let candidate = dir.join(candidate_name);
            if !candidate.exists() {
                return candidate;
            }
        }
        unreachable!("collision suffix search never terminates")
    }

    /// Append a chunk, returning the cumulative received byte count.
    pub fn write_chunk(&mut self, data: &[u8]) -> CoreResult<u64> {
        let transfer = self
            .current
            .as_mut()
            .ok_or_else(|| CoreError::FileTransfer("no file transfer in progress".into()))?;
        transfer.file.write_all(data)?;
        transfer.received += data.len() as u64;
        Ok(transfer.received)
    }

    /// Flush, close, and return the final path. Does not verify
    /// `received == declared_size`: a short transfer is still saved so the
    /// caller can decide, matching the source behavior.
    pub fn finish_file(&mut self) -> CoreResult<PathBuf> {
        let mut transfer = self
            .current
            .take()
            .ok_or_else(|| CoreError::FileTransfer("no file transfer in progress".into()))?;
        transfer.file.flush()?;
        Ok(transfer.path)
    }

    /// Abort the in-flight transfer and delete the partial file.
    pub fn cancel(&mut self) {
        if let Some(transfer) = self.current.take() {
            drop(transfer.file);
            let _ = std::fs::remove_file(&transfer.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_write_finish_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut receiver = FileReceiver::new(dir.path());
        receiver.begin_file("report.pdf", 10).unwrap();
        let received = receiver.write_chunk(b"hello").unwrap();
        assert_eq!(received, 5);
        let received = receiver.write_chunk(b"world").unwrap();
        assert_eq!(received, 10);
        assert!((receiver.progress() - 1.0).abs() < f64::EPSILON);

        let path = receiver.finish_file().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"helloworld");
        assert!(!receiver.is_receiving());
    }

    #[test]
    fn name_collision_gets_numbered_suffix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"existing").unwrap();

        let mut receiver = FileReceiver::new(dir.path());
        receiver.begin_file("notes.txt", 4).unwrap();
        receiver.write_chunk(b"new!").unwrap();
        let path = receiver.finish_file().unwrap();

        assert_eq!(path.file_name().unwrap(), "notes (1).txt");
    }

    #[test]
    fn second_begin_while_in_flight_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut receiver = FileReceiver::new(dir.path());
        receiver.begin_file("a.bin", 1).unwrap();
        let err = receiver.begin_file("b.bin", 1).unwrap_err();
        assert!(matches!(err, CoreError::FileTransfer(_)));
    }

    #[test]
    fn cancel_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut receiver = FileReceiver::new(dir.path());
        receiver.begin_file("partial.bin", 100).unwrap();
        receiver.write_chunk(b"only some bytes").unwrap();
        receiver.cancel();
        assert!(!dir.path().join("partial.bin").exists());
        assert!(!receiver.is_receiving());
    }
}
