//! Intake rate limiting: per-owner and global token buckets.
//!
//! Rejections happen before the idempotency claim so a throttled submission
//! consumes nothing.

use std::num::NonZeroU32;

use governor::{DefaultDirectRateLimiter, DefaultKeyedRateLimiter, Quota, RateLimiter};

use crate::error::EngineError;
use crate::job::OwnerId;

pub struct IntakeLimiter {
    global: DefaultDirectRateLimiter,
    per_owner: DefaultKeyedRateLimiter<OwnerId>,
}

impl IntakeLimiter {
    pub fn new(global_rps: u32, per_owner_rps: u32) -> Result<Self, EngineError> {
        let global = NonZeroU32::new(global_rps)
            .ok_or_else(|| EngineError::validation("global_rps must be > 0"))?;
        let per_owner = NonZeroU32::new(per_owner_rps)
            .ok_or_else(|| EngineError::validation("per_owner_rps must be > 0"))?;
        Ok(Self {
            global: RateLimiter::direct(Quota::per_second(global)),
            per_owner: RateLimiter::keyed(Quota::per_second(per_owner)),
        })
    }

    /// Gate one submission. Per-owner bucket is consulted first so a noisy
    /// tenant exhausts its own budget before touching the global one.
    pub fn check(&self, owner: OwnerId) -> Result<(), EngineError> {
        if self.per_owner.check_key(&owner).is_err() {
            metrics::counter!("lathe_intake_rate_limited_total", "scope" => "owner").increment(1);
            return Err(EngineError::RateLimited);
        }
        if self.global.check().is_err() {
            metrics::counter!("lathe_intake_rate_limited_total", "scope" => "global").increment(1);
            return Err(EngineError::RateLimited);
        }
        Ok(())
    }
}
