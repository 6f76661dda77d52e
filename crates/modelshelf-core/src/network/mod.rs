//! Network plumbing: HTTP clients, rate limiting, retry policy and circuit
//! breakers.

mod circuit_breaker;
mod client;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use client::{api_client, transfer_client, RateGate};
pub use retry::RetryConfig;
