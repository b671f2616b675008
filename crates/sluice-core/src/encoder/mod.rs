//! Columnar file construction.
//!
//! Rows arrive as JSON objects and leave as a Parquet file:
//!
//! 1. [`build_schema`] maps the destination table's columns onto an Arrow
//!    schema, one [`ColumnTransformer`] per column and static file metadata
//! 2. [`transform_rows`] converts a batch, collecting min/max/null statistics
//! 3. [`write_file`] encodes the batch with the embedded metadata
//! 4. [`read_file_statistics`] parses the footer of the written file

pub mod schema;
pub mod stats;
pub mod transform;
pub mod writer;

pub use schema::{build_schema, ColumnKind, EncodingPlan, PRIMARY_FILE_ID_KEY, SF_VERSION_KEY};
pub use stats::{ep_info, read_file_statistics, ColumnChunkStatistics, FileStatistics};
pub use transform::{transform_rows, ColumnStats, ColumnTransformer, TransformedRows};
pub use writer::write_file;
