//! # Inkflow Server Library
//!
//! Wiring and lifecycle of the `inkflow-cache-sync` process.

pub mod di;
pub mod startup;
