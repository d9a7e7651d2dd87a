//! Small shared utilities

pub mod ranges;
pub mod singledo;

pub use ranges::{IntRange, IntRanges, InvalidRange};
pub use singledo::SingleDo;
