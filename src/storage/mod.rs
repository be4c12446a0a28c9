//! The memory-mapped Storage Map (spec.md §4.A) and its runtime layout type.

pub mod map;

pub use map::{Map, OpenMode};
