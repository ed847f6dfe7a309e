//! Static content and asset routing.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use crate::response::{self, HttpResponse};
use crate::{FileAccess, FileSource};

/// Name under which the document for unmatched routes is registered.
pub const INDEX_FILE: &str = "index.html";

/// Body served for unmatched routes when no index was registered, or when
/// the registered one cannot be read.
pub const INDEX_PLACEHOLDER: &str = "index";

/// Body of the response to a missing or unreadable image.
pub const NO_SUCH_IMAGE: &str = "No such image";

/// Where a request path is dispatched to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// `/<prefix>/<name>.png`, carrying `<name>` as it appeared in the path.
    Asset(String),
    /// Every other path.
    Index,
}

/// Resolves plain HTTP requests against the registered files and the
/// assets directory.
pub struct StaticRouter {
    files: RwLock<HashMap<String, FileSource>>,
    assets_prefix: String,
    assets_dir: PathBuf,
    fs: Arc<dyn FileAccess>,
}

impl StaticRouter {
    /// Creates a router serving `/<assets_prefix>/<name>.png` from
    /// `assets_dir`.
    pub fn new(
        assets_prefix: impl Into<String>,
        assets_dir: impl Into<PathBuf>,
        fs: Arc<dyn FileAccess>,
    ) -> Self {
        let assets_prefix: String = assets_prefix.into();
        Self {
            files: RwLock::new(HashMap::new()),
            assets_prefix: assets_prefix.trim_matches('/').to_string(),
            assets_dir: assets_dir.into(),
            fs,
        }
    }

    /// Registers `source` under `name`, silently replacing any previous
    /// registration. On-disk sources are not checked until requested.
    pub fn register_file(&self, name: impl Into<String>, source: FileSource) {
        let name = name.into();
        tracing::debug!(%name, ?source, "registered file");
        self.files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, source);
    }

    /// Returns the source registered under `name`.
    pub fn file(&self, name: &str) -> Option<FileSource> {
        self.files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Decides which handler serves `path`.
    pub fn route(&self, path: &str) -> Route {
        let name = path
            .strip_prefix('/')
            .and_then(|rest| rest.strip_prefix(self.assets_prefix.as_str()))
            .and_then(|rest| rest.strip_prefix('/'))
            .and_then(|rest| rest.strip_suffix(".png"))
            .filter(|name| !name.is_empty() && !name.contains('/'));
        match name {
            Some(name) => Route::Asset(name.to_string()),
            None => Route::Index,
        }
    }

    /// Produces the response for a request to `path`.
    pub async fn handle(&self, path: &str) -> HttpResponse {
        match self.route(path) {
            Route::Asset(name) => self.serve_asset(&name).await,
            Route::Index => self.serve_index().await,
        }
    }

    /// Reads the content behind `source`.
    pub async fn resolve(&self, source: &FileSource) -> std::io::Result<Vec<u8>> {
        match source {
            FileSource::Inline(content) => Ok(content.as_bytes().to_vec()),
            FileSource::OnDisk(path) => self.fs.read(path).await,
        }
    }

    async fn serve_asset(&self, name: &str) -> HttpResponse {
        // Only the first `%20` is unescaped; no other percent-decoding.
        let name = name.replacen("%20", " ", 1);
        let path = self.assets_dir.join(format!("{name}.png"));
        match self.fs.read(&path).await {
            Ok(bytes) => response::ok("image/png", bytes),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "requested image not available"
                );
                response::bad_request(NO_SUCH_IMAGE)
            }
        }
    }

    async fn serve_index(&self) -> HttpResponse {
        let Some(source) = self.file(INDEX_FILE) else {
            return response::ok("text/html", INDEX_PLACEHOLDER);
        };
        match self.resolve(&source).await {
            Ok(body) => response::ok("text/html", body),
            Err(e) => {
                tracing::warn!(?source, error = %e, "index document unreadable");
                response::ok("text/html", INDEX_PLACEHOLDER)
            }
        }
    }
}
