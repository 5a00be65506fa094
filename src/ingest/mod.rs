//! Ingestion: sequence validation, gap recovery, and the message pipeline.

pub mod gap_recovery;
pub mod pipeline;
pub mod sequence;
