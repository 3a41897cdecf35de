//! Small helpers shared across the crate.

mod bitset;

pub use bitset::Bitset;
