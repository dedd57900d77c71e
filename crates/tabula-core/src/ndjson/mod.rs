//! NDJSON handling for the generation stream.
//!
//! The upstream emits one JSON object per line. [`LineReassembler`] turns raw
//! byte chunks into complete lines and [`parse_line`] decodes each line into a
//! [`GenerateChunk`], implementing a tolerant reader pattern.

mod parser;
mod reader;
mod types;

pub use parser::{parse_line, parse_value};
pub use reader::LineReassembler;
pub use types::*;
