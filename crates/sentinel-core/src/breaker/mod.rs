//! Circuit breakers guarding the engine's external dependencies.

pub mod circuit;
pub mod registry;

pub use circuit::{
    BreakerConfig, BreakerMetrics, BreakerSnapshot, BreakerTransition, CircuitBreaker, TransitionObserver,
};
pub use registry::{BROKER, BreakerRegistry, PRICE_QUOTE, WALLET};
