//! Maintenance operations shipped with the tool.

pub mod inline_data;
pub mod journal;

pub use inline_data::INLINE_DATA;
pub use journal::{JournalSizeOp, parse_size};
