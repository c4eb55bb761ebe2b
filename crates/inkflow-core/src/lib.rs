//! # Inkflow Core
//!
//! Core types shared by every Inkflow crate: the unified error type,
//! result aliases and tracing initialisation.

pub mod error;
pub mod result;
pub mod telemetry;

pub use error::*;
pub use result::*;

// Re-export shaku for component interfaces
pub use shaku::Interface;
