//! Shared helpers.

pub mod atomic;
pub mod fs;

pub use atomic::AtomicFileWriter;
