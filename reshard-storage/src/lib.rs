//! In-memory partition engines exposing chunked, undo-tracked extraction.

pub mod engine;
pub mod table;
pub mod undo;

pub use engine::{DEFAULT_LIMIT, ExtractChunk, ExtractRequest, PartitionEngine};
pub use table::{Column, ColumnType, Row, RowBatch, TableSchema, Value};
pub use undo::{UndoEntry, UndoLog};
