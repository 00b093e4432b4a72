//! # mdprov Core Library
//!
//! A library for extracting structured metadata from AMBER molecular dynamics
//! run artifacts and assembling it into an ordered, cross-validated protocol
//! description: what ran, in what order, for how long, with what settings, and
//! whether consecutive stages are actually continuous.
//!
//! ## Architectural Philosophy
//!
//! The library is split into three layers with a strict dependency direction:
//!
//! - **[`core`]: The Foundation.** Format-specific parsers for the five AMBER
//!   artifact kinds (topology, control input, output log, trajectory,
//!   restart), the streaming statistics and value-cleaning utilities they
//!   share, and the `Stage`/`Protocol` domain model with its validation rules.
//!
//! - **[`engine`]: Assembly Logic.** Filename sequence detection and stem
//!   grouping, deterministic restart-chain inference, and the progress
//!   reporting callback used by long discovery runs.
//!
//! - **[`workflows`]: The Public API.** The build-protocol entry points that
//!   tie parsers, grouping, and validation together, either from normalized
//!   stage descriptors or by directory auto-discovery.

pub mod core;
pub mod engine;
pub mod workflows;
