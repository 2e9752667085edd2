pub mod config;
pub mod engine;
pub mod error;
pub mod manager;
pub mod scheduler;
pub mod shutdown;
pub mod spool;
