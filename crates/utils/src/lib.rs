//! Small shared helpers. Only add things here that depend on the
//! standard library and "core" crates.
//!
mod command;
pub use command::*;
mod tracing_util;
pub use tracing_util::*;
