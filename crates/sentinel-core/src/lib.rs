//! # sentinel-core
//!
//! Core crate for the Sentinel execution engine, providing:
//!
//! - **Types** (`types`): orders, alerts, conditions, feed keys, shared enums
//! - **Configuration** (`config`): JSON config deserialization and validation
//! - **Error types** (`error`): `EngineError` / `BreakerError` via thiserror
//! - **Circuit breakers** (`breaker`): per-dependency breakers and their registry
//! - **Health** (`health`): health events and sinks
//! - **Store** (`store`): durable order and alert records
//! - **Logging** (`logging`): tracing-based structured logging

pub mod breaker;
pub mod config;
pub mod error;
pub mod health;
pub mod logging;
pub mod store;
pub mod types;

// Re-export types at crate root for convenience.
pub use types::*;
