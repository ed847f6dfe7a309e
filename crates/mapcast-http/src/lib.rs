//! Plain-HTTP side of a Mapcast server.
//!
//! Requests that are not WebSocket upgrades are answered here with
//! buffered `hyper` responses:
//!
//! - `/<assets-prefix>/<name>.png` → the image bytes from the assets
//!   directory, or `400 No such image`
//! - anything else → the registered `index.html` document (or a fixed
//!   placeholder)
//!
//! File contents are read through a [`FileAccess`] collaborator so slow
//! disks never block the task accepting connections, and so tests can
//! substitute an in-memory file system.

mod files;
pub mod response;
mod router;

pub use files::{FileAccess, FileSource, TokioFileAccess};
pub use response::HttpResponse;
pub use router::{Route, StaticRouter, INDEX_FILE, INDEX_PLACEHOLDER, NO_SUCH_IMAGE};
