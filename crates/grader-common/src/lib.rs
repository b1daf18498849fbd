//! Common types and errors shared by the grading worker and the diff engine.

pub mod error;
pub mod types;

pub use error::{GraderError, GraderResult};
pub use types::*;
