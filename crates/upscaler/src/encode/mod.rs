//! External tool invocations: command lines, process supervision and
//! per-chunk encoding.

pub mod commands;
pub mod executor;
pub mod process;

pub use executor::{ChunkError, ChunkExecutor, ChunkJob};
pub use process::{LoggedChild, ProcessError};
