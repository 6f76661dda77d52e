//! Shared reqwest client construction.

use crate::config::NetworkConfig;
use crate::error::{Result, ShelfError};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::Client;
use std::num::NonZeroU32;
use std::time::Duration;

/// Client for small JSON API calls, bounded by a whole-request timeout.
pub fn api_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(NetworkConfig::CONNECT_TIMEOUT)
        .user_agent(NetworkConfig::USER_AGENT)
        .build()
        .map_err(|e| ShelfError::Network {
            message: format!("Failed to create HTTP client: {}", e),
            cause: Some(e.to_string()),
        })
}

/// Client for large transfers.
///
/// Only the connect phase has a timeout: a multi-gigabyte body can take
/// hours, so stalls are detected per chunk by the caller instead.
pub fn transfer_client() -> Result<Client> {
    Client::builder()
        .connect_timeout(NetworkConfig::CONNECT_TIMEOUT)
        .user_agent(NetworkConfig::USER_AGENT)
        .build()
        .map_err(|e| ShelfError::Network {
            message: format!("Failed to create download client: {}", e),
            cause: Some(e.to_string()),
        })
}

/// Token-bucket limiter for one remote service.
pub struct RateGate {
    service: String,
    limiter: DefaultDirectRateLimiter,
}

impl RateGate {
    pub fn per_second(service: impl Into<String>, requests: u32) -> Self {
        let rate = NonZeroU32::new(requests).unwrap_or(NonZeroU32::MIN);
        Self {
            service: service.into(),
            limiter: RateLimiter::direct(Quota::per_second(rate)),
        }
    }

    /// Wait until the next request may be sent.
    pub async fn acquire(&self) {
        if self.limiter.check().is_err() {
            tracing::debug!("Throttling requests to {}", self.service);
            self.limiter.until_ready().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clients_build() {
        assert!(api_client(Duration::from_secs(5)).is_ok());
        assert!(transfer_client().is_ok());
    }

    #[tokio::test]
    async fn test_rate_gate_admits_burst_of_one() {
        let gate = RateGate::per_second("test", 50);
        gate.acquire().await;
        gate.acquire().await;
    }
}
