//! Turnstile - Per-Key Admission Control
//!
//! This crate decides whether the next unit of work for a key (usually a
//! client identity) may proceed. It provides token bucket, fixed window and
//! sliding window log limiters over a pluggable per-key state store, and a
//! registry for building limiters by name from loosely typed configuration.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod registry;
pub mod server;
pub mod store;

pub use ratelimit::Limiter;
pub use registry::Registry;
