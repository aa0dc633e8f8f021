//! Aegis Core Library
//!
//! Shared foundations for the Aegis security core: the error taxonomy used across
//! every crate, the structured security configuration, the cache abstraction
//! (Redis-backed in production, in-memory for tests), and PostgreSQL pool and
//! migration helpers.

pub mod cache;
pub mod config;
pub mod db;
pub mod error;

pub use cache::{Cache, MemoryCache, RedisCache, WindowDecision};
pub use config::SecurityConfig;
pub use error::{Error, Result};
