//! Out-of-process solver and enhancer backends.

pub mod process;

pub use process::{ProcessCommand, ProcessEnhancer, ProcessSolver};
