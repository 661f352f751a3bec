//! Storage quota admission control.
//!
//! Pure arithmetic over megabyte figures. Called once with the declared size
//! when a session starts and again with the real merged size at commit.

use serde::Serialize;
use std::fmt;

use crate::constants::{BYTES_PER_MB, UNLIMITED};

/// Usage figures after a successful admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaLedger {
    pub current_used_mb: i64,
    pub projected_mb: i64,
    pub limit_mb: i64,
}

/// Rejection carrying enough detail for the caller to act on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaExceeded {
    pub used_mb: i64,
    pub incoming_mb: i64,
    pub limit_mb: i64,
}

impl fmt::Display for QuotaExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "storage quota exceeded: {} MB used + {} MB incoming > {} MB limit",
            self.used_mb, self.incoming_mb, self.limit_mb
        )
    }
}

impl std::error::Error for QuotaExceeded {}

/// Partial megabytes count as a whole one.
pub fn bytes_to_mb(bytes: u64) -> i64 {
    bytes.div_ceil(BYTES_PER_MB) as i64
}

pub fn check_admission(
    limit_mb: i64,
    recorded_used_mb: i64,
    released_mb: i64,
    incoming_mb: i64,
) -> Result<QuotaLedger, QuotaExceeded> {
    let current_used_mb = (recorded_used_mb - released_mb).max(0);
    let projected_mb = current_used_mb + incoming_mb;

    if limit_mb == UNLIMITED || projected_mb <= limit_mb {
        return Ok(QuotaLedger {
            current_used_mb,
            projected_mb,
            limit_mb,
        });
    }

    Err(QuotaExceeded {
        used_mb: current_used_mb,
        incoming_mb,
        limit_mb,
    })
}
