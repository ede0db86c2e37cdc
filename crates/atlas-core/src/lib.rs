//! Atlas Core Components
//!
//! This crate provides the shared configuration surface and core error
//! types for the Atlas file-index and module-resolution engine.

mod config;
mod error;

pub use config::{BackendKind, ExtractionErrorPolicy, IndexConfig};
pub use error::CoreError;
