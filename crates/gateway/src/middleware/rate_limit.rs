//! Rate limiting middleware using token bucket algorithm

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use governor::{
    clock::QuantaClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use influencemapper_common::{config::RateLimitConfig, errors::AppError};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Rate limiter using governor crate
pub type GlobalRateLimiter = RateLimiter<NotKeyed, InMemoryState, QuantaClock>;

/// Limiter plus the configured rate, reported back to throttled clients
#[derive(Clone)]
pub struct UploadLimiter {
    limiter: Option<Arc<GlobalRateLimiter>>,
    requests_per_second: u32,
}

impl UploadLimiter {
    pub fn from_config(config: &RateLimitConfig) -> Self {
        let limiter = config
            .enabled
            .then(|| create_rate_limiter(config.requests_per_second, config.burst));
        Self {
            limiter,
            requests_per_second: config.requests_per_second,
        }
    }

    fn check(&self) -> bool {
        self.limiter.as_ref().map_or(true, |l| l.check().is_ok())
    }
}

/// Create a new rate limiter. Zero values are raised to one.
pub fn create_rate_limiter(requests_per_second: u32, burst: u32) -> Arc<GlobalRateLimiter> {
    let rate = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
    let burst = NonZeroU32::new(burst).unwrap_or(rate);
    let quota = Quota::per_second(rate).allow_burst(burst);

    Arc::new(RateLimiter::direct(quota))
}

/// Rate limiting middleware
pub async fn rate_limit_middleware(
    State(limiter): State<UploadLimiter>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if limiter.check() {
        Ok(next.run(request).await)
    } else {
        tracing::warn!(path = %request.uri().path(), "Rate limit exceeded");
        Err(AppError::RateLimited {
            limit: limiter.requests_per_second,
        })
    }
}
