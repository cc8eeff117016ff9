//! Mindex engine — local knowledge-base ingestion and retrieval core.
//!
//! Subsystem map: [`store`] owns durable state, [`events`] bridges the host,
//! [`config_queue`] gates topology changes, [`scan`]/[`watch`] discover
//! files, [`screening`] classifies them, [`tags`] and [`vectorize`] enrich
//! them, [`capability`] routes model calls, [`retrieval`] ranks, and
//! [`session`] coordinates co-reading. [`engine`] wires it all together.

pub mod api;
pub mod capability;
pub mod config_queue;
pub mod engine;
pub mod events;
pub mod models;
pub mod retrieval;
pub mod scan;
pub mod screening;
pub mod session;
pub mod store;
pub mod tags;
pub mod types;
pub mod vector_index;
pub mod vectorize;
pub mod watch;

use std::path::PathBuf;

/// Default data root when the host does not pick one:
/// `~/.local/share/mindex` (or `./mindex-data` with no home).
pub fn default_data_root() -> PathBuf {
    std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share")))
        .map(|base| base.join("mindex"))
        .unwrap_or_else(|| PathBuf::from("./mindex-data"))
}
