//! Historical replay: book state and point-in-time reconstruction.

pub mod book;
pub mod reconstruction;
