//! Configuration models for worker pools.

pub mod concurrency;

pub use concurrency::{ConcurrencyConfig, ENV_PREFIX};
