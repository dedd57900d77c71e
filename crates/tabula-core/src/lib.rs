//! `Tabula` Core Library
//!
//! Shared functionality for `Tabula` components:
//! - NDJSON line reassembly and parsing for the generation stream
//! - Configuration resolution and hierarchy
//! - Prompt construction from tabular data
//! - Common error types

pub mod config;
pub mod error;
pub mod ndjson;
pub mod prompt;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
