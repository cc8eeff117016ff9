//! Mindex core — pure domain layer shared by the engine and its tests.
//!
//! Holds the entity model, the error taxonomy, per-subsystem configuration
//! records, the hierarchical chunker, and the lexical scorer. No I/O lives
//! here; everything is unit-testable without a data directory.

pub mod chunking;
pub mod config;
pub mod error;
pub mod lexical;
pub mod types;

pub use error::{EngineError, ProviderError, StoreError};
