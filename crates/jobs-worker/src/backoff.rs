//! Retry spacing and failure classification. Everything here is stateless.

use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_MS: u64 = 300;
pub const DEFAULT_CAP_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base_ms: u64,
    cap_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_ms: DEFAULT_BASE_MS,
            cap_ms: DEFAULT_CAP_MS,
        }
    }
}

impl Backoff {
    /// `base_ms` is clamped to `cap_ms` so every delay stays within `[base, cap]`.
    pub fn new(base_ms: u64, cap_ms: u64) -> Self {
        Self {
            base_ms: base_ms.min(cap_ms),
            cap_ms,
        }
    }

    pub fn base_ms(&self) -> u64 {
        self.base_ms
    }

    pub fn cap_ms(&self) -> u64 {
        self.cap_ms
    }

    pub fn delay_ms(&self, attempt: u32) -> u64 {
        compute_backoff(attempt, self.base_ms, self.cap_ms)
    }
}

/// `min(cap, base + random(0, min(cap, base * 2^attempt)))`.
///
/// The jitter term is redrawn over the whole capped exponential range on every
/// call; it does not depend on the previous delay.
pub fn compute_backoff(attempt: u32, base_ms: u64, cap_ms: u64) -> u64 {
    let growth = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    let ceiling = base_ms.saturating_mul(growth).min(cap_ms);
    let jitter = rand::thread_rng().gen_range(0..=ceiling);
    cap_ms.min(base_ms.saturating_add(jitter))
}

/// Delay requested by an upstream `Retry-After` header, in milliseconds.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<u64> {
    parse_retry_after_at(headers, Utc::now())
}

/// Accepts delta-seconds or an HTTP date; a date in the past yields 0.
pub fn parse_retry_after_at(headers: &HeaderMap, now: DateTime<Utc>) -> Option<u64> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(secs) = raw.parse::<u64>() {
        return Some(secs.saturating_mul(1_000));
    }

    let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    Some((at - now).num_milliseconds().max(0) as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusClass {
    Ok,
    /// 429.
    Rate,
    /// 5xx, or anything unrecognised.
    Server,
    /// 4xx other than 429. Never retried.
    Client,
}

impl StatusClass {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, StatusClass::Client)
    }
}

pub fn classify_status(status: Option<u16>) -> StatusClass {
    match status {
        Some(429) => StatusClass::Rate,
        Some(s) if s >= 500 => StatusClass::Server,
        Some(s) if (400..500).contains(&s) => StatusClass::Client,
        Some(s) if (200..300).contains(&s) => StatusClass::Ok,
        _ => StatusClass::Server,
    }
}
