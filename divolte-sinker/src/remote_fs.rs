use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use anyhow::{Context, Result};

/// Byte sink on the remote file system.
pub trait RemoteStream: io::Write + Send {
    /// Force written data to be persisted across storage replicas. Any
    /// failure here must be surfaced to the caller.
    fn hsync(&mut self) -> Result<()>;

    /// Flush and release the stream. Must be callable from failure paths
    /// as well as regular shutdown.
    fn close(&mut self) -> Result<()>;
}

/// Narrow interface over a remote append-only file system.
///
/// `create` may return successfully even when no storage node is currently
/// able to persist data, so callers probe durability with an immediate
/// `hsync` on the fresh stream.
pub trait RemoteFileSystem: Send {
    type Stream: RemoteStream;

    fn create(&self, path: &Path, replication: u16) -> Result<Self::Stream>;

    fn delete(&self, path: &Path) -> Result<()>;
}

/// Local directory standing in for the remote file system.
///
/// Used by the binary and by tests. `hsync` maps to `sync_data`, the
/// strongest durability barrier a local file offers; the replication
/// factor has no local meaning and is ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSystem;

pub struct LocalStream {
    file: File,
}

impl io::Write for LocalStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl RemoteStream for LocalStream {
    fn hsync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_data().context("sync_data failed")?;

        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.file.flush()?;

        Ok(())
    }
}

impl RemoteFileSystem for LocalFileSystem {
    type Stream = LocalStream;

    fn create(&self, path: &Path, _replication: u16) -> Result<LocalStream> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .with_context(|| format!("failed to create file: {}", path.display()))?;

        Ok(LocalStream { file })
    }

    fn delete(&self, path: &Path) -> Result<()> {
        fs::remove_file(path)
            .with_context(|| format!("failed to delete file: {}", path.display()))?;

        Ok(())
    }
}
