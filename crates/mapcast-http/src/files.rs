//! File sources and the file-access collaborator.

use std::io;
use std::path::{Path, PathBuf};

use futures_util::future::BoxFuture;

/// Where the content registered under a name comes from.
///
/// On-disk sources are not checked when registered; they are read on every
/// request that needs them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSource {
    /// Content held in memory.
    Inline(String),
    /// A path read at request time.
    OnDisk(PathBuf),
}

impl FileSource {
    pub fn inline(content: impl Into<String>) -> Self {
        Self::Inline(content.into())
    }

    pub fn on_disk(path: impl Into<PathBuf>) -> Self {
        Self::OnDisk(path.into())
    }
}

/// Reads files on behalf of the router.
pub trait FileAccess: Send + Sync + 'static {
    /// Reads the whole file at `path`.
    fn read<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, io::Result<Vec<u8>>>;
}

/// [`FileAccess`] backed by `tokio::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioFileAccess;

impl FileAccess for TokioFileAccess {
    fn read<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, io::Result<Vec<u8>>> {
        Box::pin(tokio::fs::read(path))
    }
}
