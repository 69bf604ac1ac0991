//! event-relay library crate.
//!
//! Receivers pull change notifications from peek-lock queues, partitioned streams
//! and local folders, normalize them into [`envelope::Envelope`]s and run them
//! through per-receiver action chains.

pub mod actions;
pub mod config;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod receivers;
pub mod service;
pub mod transport;
pub mod utils;

pub use error::{Error, Result};
pub use service::RelayService;
