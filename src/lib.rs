//! Prediction-market order book capture and historical reconstruction.
//!
//! The service side subscribes to an exchange WebSocket feed, validates
//! per-market delta sequencing, recovers from gaps via REST snapshots, and
//! persists everything into date-partitioned SQLite tables. The replay side
//! rebuilds any market's book at an arbitrary past instant from the nearest
//! snapshot plus the delta stream.

pub mod config;
pub mod feed;
pub mod ingest;
pub mod models;
pub mod replay;
pub mod store;
