//! High-level entry points that tie parsers, grouping, and validation
//! together into complete protocol-assembly operations.

pub mod discover;
