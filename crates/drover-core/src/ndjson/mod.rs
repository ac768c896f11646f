//! NDJSON parser for the agent stream-json protocol.
//!
//! This module turns newline-delimited JSON from an agent's stdout into
//! canonical message types, implementing a tolerant reader pattern, and maps
//! those messages onto [`OutputRecord`](crate::output::OutputRecord)s.

mod decoder;
mod parser;
mod records;
mod types;

pub use decoder::{DecoderStats, NdjsonDecoder, message_stream};
pub use parser::{parse_line, parse_value};
pub use records::{to_output_body, to_output_record};
pub use types::*;
