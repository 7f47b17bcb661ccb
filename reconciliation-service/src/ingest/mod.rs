//! Streaming ingestion: read rows, normalize them, group them into batches.

pub mod batcher;
pub mod normalizer;
pub mod reader;

pub use batcher::{Batcher, DEFAULT_BATCH_SIZE};
pub use normalizer::normalize;
pub use reader::{preview, FileFormat, Preview, RawRow, ReadError, RowStream};
