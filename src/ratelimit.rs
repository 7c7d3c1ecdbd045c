use governor::{
    Quota, RateLimiter as GovernorRateLimiter,
    clock::{QuantaClock, QuantaInstant},
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
};
use nonzero_ext::nonzero;
use std::{num::NonZeroU32, time::Duration};

// Fallbacks for zero values coming out of the environment.
const FALLBACK_REQ_PER_SEC: NonZeroU32 = nonzero!(10u32);
const FALLBACK_MS_BETWEEN_REQ: Duration = Duration::from_millis(50);

type SpecificGovernorRateLimiter =
    GovernorRateLimiter<NotKeyed, InMemoryState, QuantaClock, NoOpMiddleware<QuantaInstant>>;

/// Paces requests to one portal so a busy session does not trip the school
/// server's flood protection.
pub struct RateLimiter {
    req_per_sec: SpecificGovernorRateLimiter,
    ms_between_req: SpecificGovernorRateLimiter,
}

impl RateLimiter {
    pub fn new(req_per_sec: u32, min_gap: Duration) -> Self {
        let req_per_sec = NonZeroU32::new(req_per_sec).unwrap_or(FALLBACK_REQ_PER_SEC);
        // Limit to X total req/sec on average.
        let req_per_sec = GovernorRateLimiter::direct(Quota::per_second(req_per_sec));

        // No two requests closer than Y ms.
        let gap_quota = Quota::with_period(min_gap)
            .or_else(|| Quota::with_period(FALLBACK_MS_BETWEEN_REQ))
            .unwrap_or(Quota::per_second(FALLBACK_REQ_PER_SEC));
        let ms_between_req = GovernorRateLimiter::direct(gap_quota);

        RateLimiter {
            req_per_sec,
            ms_between_req,
        }
    }

    pub async fn wait_until_ready(&self) {
        // Order matters: the per-second limiter lets bursts through, the gap
        // limiter then spreads them out one at a time.
        self.req_per_sec.until_ready().await;
        self.ms_between_req.until_ready().await;
    }
}
