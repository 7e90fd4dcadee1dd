mod bucket;
mod limiter;

pub(crate) use limiter::{RateGroups, RateLimiter};
