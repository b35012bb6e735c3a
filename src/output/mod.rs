//! Output module
//!
//! Console text and JSON report sinks for a finished run.

pub mod json;
pub mod text;
