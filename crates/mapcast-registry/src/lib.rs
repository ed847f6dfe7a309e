//! Connection registry for Mapcast.
//!
//! Each server instance owns one [`ConnectionRegistry`]: the table of
//! peers that completed the upgrade and have not closed yet. The
//! instance's accept path inserts, its close path removes, and anyone
//! holding the instance handle may read (send, broadcast, iterate).
//!
//! ```text
//! upgrade ok ──→ add(id) ──→ [registered] ──→ remove(id) ──→ gone
//!                                 │
//!                  for_each / broadcast / send (snapshot reads)
//! ```

mod registry;

pub use registry::ConnectionRegistry;
