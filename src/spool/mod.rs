//! Spool directory handling.
//!
//! - [`JobSpooler`]: owns the `new`/`cur`/`done`/`error` layout and every
//!   move of a job file between those directories
//! - [`EventHandler`]: parses, claims and queues one job file
//! - [`SpoolWatcher`]: feeds files appearing in `new` to the handler

pub mod spooler;
pub mod watcher;

pub use spooler::{JobSpooler, SpoolDir};
pub use watcher::{EventHandler, Ingest, SpoolWatcher};
