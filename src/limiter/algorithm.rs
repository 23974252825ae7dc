use crate::error::BreakwaterError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Admission algorithm used by a [`Limiter`](crate::Limiter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Counter per window, anchored to the first request in it. Cheap, but
    /// admits up to `2 * limit` across a window boundary.
    FixedWindow,
    /// Generic Cell Rate Algorithm with zero delay tolerance: requests are
    /// spaced at least one emission interval (`period / limit`) apart.
    Gcra,
    /// Continuous refill at `limit / period` tokens per second with burst
    /// capacity `limit`.
    TokenBucket,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FixedWindow => "fixed_window",
            Self::Gcra => "gcra",
            Self::TokenBucket => "token_bucket",
        };
        f.write_str(name)
    }
}

impl FromStr for Algorithm {
    type Err = BreakwaterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed_window" => Ok(Self::FixedWindow),
            "gcra" => Ok(Self::Gcra),
            "token_bucket" => Ok(Self::TokenBucket),
            other => Err(BreakwaterError::config(format!(
                "Unknown rate limit algorithm: {:?} (expected fixed_window, gcra, or token_bucket)",
                other
            ))),
        }
    }
}
