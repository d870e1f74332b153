//! # taskclaim
//!
//! Distributed task claiming and worker coordination on an embedded SQLite
//! queue store.
//!
//! Producers insert tasks; any number of worker processes claim them
//! atomically under a configurable strategy (FIFO, LIFO, priority or
//! weighted random), run them through pluggable work functions, and write
//! outcomes back with compare-and-swap guards. Completions can optionally be
//! mirrored to an external HTTP task registry.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod model;
pub mod registry;
pub mod strategy;
pub mod telemetry;
pub mod work;
