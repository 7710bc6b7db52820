//! Acquisition order tokens.
//!
//! Callers that promise an acquisition order can tag each acquisition with a
//! token; the checker verifies tokens are monotone per bucket. Violations are
//! a caller bug: fatal in debug builds, reported and tolerated in release.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::error;

/// Ordering tag carried by an acquisition: a bucket (one independent ordered
/// stream) and a position within it.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct OrderToken {
    pub bucket: u32,
    pub value: u64,
}

impl OrderToken {
    pub fn new(bucket: u32, value: u64) -> Self {
        Self { bucket, value }
    }
}

/// Whether an acquisition's token is verified.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum OrderMode {
    #[default]
    Check,
    Ignore,
}

#[derive(Default)]
pub(crate) struct FifoChecker {
    last_seen: Mutex<HashMap<u32, u64>>,
}

impl FifoChecker {
    pub(crate) fn check(&self, token: Option<OrderToken>, mode: OrderMode) {
        let token = match (mode, token) {
            (OrderMode::Ignore, _) | (_, None) => return,
            (OrderMode::Check, Some(token)) => token,
        };
        let mut last_seen = self.last_seen.lock();
        let last = last_seen.entry(token.bucket).or_insert(0);
        if token.value < *last {
            error!(
                bucket = token.bucket,
                value = token.value,
                last = *last,
                "cache.order.violation"
            );
            debug_assert!(
                false,
                "out-of-order acquisition in bucket {} (value {} after {})",
                token.bucket, token.value, last
            );
            return;
        }
        *last = token.value;
    }
}
