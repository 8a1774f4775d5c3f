//! Pure delay calculators keyed by a backoff kind and attempt number.

use std::{convert::Infallible, str::FromStr, time::Duration};

/// Base delay unit for all backoff kinds.
const BASE_DELAY_MS: u64 = 1000;

/// How the delay between retry attempts grows.
///
/// Unknown names parse to [`BackoffKind::Exponential`]:
///
/// ```
/// use warden_core::BackoffKind;
/// assert_eq!("linear".parse::<BackoffKind>().unwrap(), BackoffKind::Linear);
/// assert_eq!("no-such-kind".parse::<BackoffKind>().unwrap(), BackoffKind::Exponential);
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum BackoffKind {
    /// Constant 1s delay regardless of attempt.
    Static,
    /// 1s × attempt.
    Linear,
    /// 1s × 2^(attempt − 1).
    #[default]
    Exponential,
}

impl FromStr for BackoffKind {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "static" => BackoffKind::Static,
            "linear" => BackoffKind::Linear,
            _ => BackoffKind::Exponential,
        })
    }
}

/// Compute the delay before dispatching `attempt`.
///
/// Attempts are numbered from 1; `attempt == 0` yields [`Duration::ZERO`].
/// Exponential growth saturates rather than overflowing.
pub fn delay(kind: BackoffKind, attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let ms = match kind {
        BackoffKind::Static => BASE_DELAY_MS,
        BackoffKind::Linear => BASE_DELAY_MS.saturating_mul(u64::from(attempt)),
        BackoffKind::Exponential => {
            BASE_DELAY_MS.saturating_mul(1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX))
        }
    };
    Duration::from_millis(ms)
}
