//! Batch shaping around the network step.
//!
//! CSV input is read into rows, operations are sliced into order-preserving
//! batches, and per-batch results are merged back into one record list.

mod batcher;
mod csv_rows;
mod result_merger;

pub use batcher::{chunk, chunk_groups, Batch};
pub use csv_rows::{read_csv_file, read_csv_str};
pub use result_merger::{aggregate, verify_records, ChunkResult};
