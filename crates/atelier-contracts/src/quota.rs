use serde::{Deserialize, Serialize};

/// Millisecond timestamp of one consumed provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CallRecord(u64);

impl CallRecord {
    pub fn at(timestamp_ms: u64) -> Self {
        Self(timestamp_ms)
    }

    pub fn timestamp_ms(self) -> u64 {
        self.0
    }

    /// A record is live while `now - ts < window_ms`. Records stamped in the
    /// future (clock skew between callers) count as live.
    pub fn is_live(self, now_ms: u64, window_ms: u64) -> bool {
        now_ms.saturating_sub(self.0) < window_ms
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuotaWindowError {
    #[error("quota limit must be greater than zero")]
    ZeroLimit,
    #[error("quota window duration must be greater than zero")]
    ZeroWindow,
}

/// Provider call budget: at most `limit` calls per rolling `window_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaWindow {
    limit: usize,
    window_ms: u64,
}

impl QuotaWindow {
    pub const DEFAULT_LIMIT: usize = 60;
    pub const DEFAULT_WINDOW_MS: u64 = 60_000;

    pub fn new(limit: usize, window_ms: u64) -> Result<Self, QuotaWindowError> {
        if limit == 0 {
            return Err(QuotaWindowError::ZeroLimit);
        }
        if window_ms == 0 {
            return Err(QuotaWindowError::ZeroWindow);
        }
        Ok(Self { limit, window_ms })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }
}

impl Default for QuotaWindow {
    fn default() -> Self {
        Self {
            limit: Self::DEFAULT_LIMIT,
            window_ms: Self::DEFAULT_WINDOW_MS,
        }
    }
}
