//! Persistence: partitioned SQLite storage and the buffered writer.

pub mod partitions;
pub mod storage;
pub mod writer;
