//! System wiring for pagecore
//!
//! Typed configuration with startup-time validation, external cache
//! endpoint parsing, and the root/child factory that composes the
//! statistics, cache, and fetch stacks into per-vhost server contexts.

pub mod config;
pub mod error;
pub mod factory;

pub use config::{
    ExternalServerSpec, MEMCACHED_DEFAULT_PORT, REDIS_DEFAULT_PORT, SystemConfig, ValidatedConfig,
};
pub use error::{Error, Result};
pub use factory::{ServerContext, SystemFactory};
