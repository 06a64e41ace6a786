//! Rate-limit arbitration shared by every REST and GraphQL caller.
//!
//! REST callers hand non-success responses to [`RateLimiter::handle_rest`];
//! a `true` return means the limiter already slept and the caller must
//! re-issue the same request. GraphQL callers gate on
//! [`RateLimiter::graphql_wait`] before each query and feed the query's
//! side-channel into [`RateLimiter::handle_graphql`] after.

use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::StatusCode;
use reqwest::header::HeaderMap;

use super::error::GithubError;

/// Sleep when a rate-limit response carries no retry-after header.
const DEFAULT_REST_BACKOFF: Duration = Duration::from_secs(5 * 60);

/// Fallback when GraphQL reports exhaustion without a usable reset time.
const GRAPHQL_FALLBACK_BACKOFF: Duration = Duration::from_secs(60);

/// Re-arm the shared clock once this few GraphQL points remain.
const GRAPHQL_REMAINING_FLOOR: i64 = 3;

/// Minimum slack added past a GraphQL reset time.
const GRAPHQL_MIN_JITTER: Duration = Duration::from_secs(5);

/// Receives rate-limit events without knowing anything about sources.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, err: &GithubError);
}

/// Default reporter: log and move on.
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, err: &GithubError) {
        log::debug!("rate limited: {err}");
    }
}

pub struct RateLimiter {
    /// Process-wide time before which no GraphQL query should be sent.
    resume_time: RwLock<Option<Instant>>,
    encounters: AtomicU64,
    seconds_spent: AtomicU64,
    reporter: Box<dyn ErrorReporter>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Box::new(LogReporter))
    }
}

impl RateLimiter {
    pub fn new(reporter: Box<dyn ErrorReporter>) -> Self {
        Self {
            resume_time: RwLock::new(None),
            encounters: AtomicU64::new(0),
            seconds_spent: AtomicU64::new(0),
            reporter,
        }
    }

    pub fn encounters(&self) -> u64 {
        self.encounters.load(Ordering::Relaxed)
    }

    pub fn seconds_spent(&self) -> u64 {
        self.seconds_spent.load(Ordering::Relaxed)
    }

    /// Inspect a REST response. Sleeps and returns true when the response
    /// was a rate limit and the request should be retried verbatim.
    pub fn handle_rest(&self, status: StatusCode, headers: &HeaderMap) -> bool {
        let retry_after = header_seconds(headers, "retry-after");
        let remaining = header_seconds(headers, "x-ratelimit-remaining");
        let jitter = rand::thread_rng().gen_range(1..=10);
        match rest_backoff(status.as_u16(), retry_after, remaining, jitter) {
            Some(wait) => {
                self.note(wait);
                self.reporter.report(&GithubError::Api {
                    status: status.as_u16(),
                    url: String::new(),
                    message: format!("rate limited, sleeping {}s", wait.as_secs()),
                });
                std::thread::sleep(wait);
                true
            }
            None => false,
        }
    }

    /// Block until the shared GraphQL resume time has passed.
    pub fn graphql_wait(&self) {
        let wait = {
            let resume = self.resume_time.read().expect("resume lock poisoned");
            resume.and_then(|at| at.checked_duration_since(Instant::now()))
        };
        if let Some(wait) = wait {
            log::debug!("waiting {}s for the GraphQL rate limit window", wait.as_secs());
            self.seconds_spent.fetch_add(wait.as_secs(), Ordering::Relaxed);
            std::thread::sleep(wait);
        }
    }

    /// Feed a GraphQL result's rate-limit side channel. Returns true when
    /// the caller must retry the same query after [`graphql_wait`].
    pub fn handle_graphql(
        &self,
        remaining: Option<i64>,
        reset_at: Option<DateTime<Utc>>,
        error_text: Option<&str>,
    ) -> bool {
        if let Some(text) = error_text {
            if text.to_ascii_lowercase().contains("rate limit exceeded") {
                self.arm(Instant::now() + GRAPHQL_FALLBACK_BACKOFF);
                self.note(GRAPHQL_FALLBACK_BACKOFF);
                return true;
            }
        }

        if let Some(remaining) = remaining {
            if remaining <= GRAPHQL_REMAINING_FLOOR {
                let until_reset = reset_at
                    .map(|at| {
                        (at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
                    })
                    .unwrap_or(Duration::ZERO);
                let jitter = GRAPHQL_MIN_JITTER
                    + Duration::from_secs(rand::thread_rng().gen_range(0..=5));
                let wait = until_reset + jitter;
                self.arm(Instant::now() + wait);
                self.note(wait);
                return true;
            }
        }
        false
    }

    fn arm(&self, at: Instant) {
        let mut resume = self.resume_time.write().expect("resume lock poisoned");
        *resume = Some(at);
    }

    fn note(&self, wait: Duration) {
        self.encounters.fetch_add(1, Ordering::Relaxed);
        self.seconds_spent.fetch_add(wait.as_secs(), Ordering::Relaxed);
    }
}

/// Pure backoff decision for a REST response.
///
/// Primary and secondary rate limits arrive as 429, or as 403 with either a
/// `Retry-After` header or an exhausted remaining-quota header. The wait is
/// the advertised retry-after plus jitter, or five minutes when the header
/// is absent.
fn rest_backoff(
    status: u16,
    retry_after: Option<u64>,
    remaining: Option<u64>,
    jitter_secs: u64,
) -> Option<Duration> {
    let rate_limited = status == 429
        || (status == 403 && (retry_after.is_some() || remaining == Some(0)));
    if !rate_limited {
        return None;
    }
    Some(match retry_after {
        Some(secs) => Duration::from_secs(secs + jitter_secs),
        None => DEFAULT_REST_BACKOFF,
    })
}

fn header_seconds(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_is_honored_with_jitter() {
        let wait = rest_backoff(429, Some(2), None, 1).unwrap();
        assert!(wait >= Duration::from_secs(2));
        assert_eq!(wait, Duration::from_secs(3));
    }

    #[test]
    fn missing_header_defaults_to_five_minutes() {
        assert_eq!(rest_backoff(429, None, None, 7), Some(DEFAULT_REST_BACKOFF));
    }

    #[test]
    fn forbidden_with_quota_left_is_not_a_rate_limit() {
        assert_eq!(rest_backoff(403, None, Some(55), 1), None);
        assert_eq!(rest_backoff(404, None, None, 1), None);
        assert_eq!(rest_backoff(500, None, None, 1), None);
    }

    #[test]
    fn forbidden_with_exhausted_quota_backs_off() {
        assert!(rest_backoff(403, None, Some(0), 1).is_some());
        assert!(rest_backoff(403, Some(30), None, 1).is_some());
    }

    #[test]
    fn graphql_low_remaining_arms_the_clock() {
        let limiter = RateLimiter::default();
        let reset = Utc::now(); // already passed: wait is jitter only
        assert!(limiter.handle_graphql(Some(2), Some(reset), None));
        assert_eq!(limiter.encounters(), 1);

        let resume = limiter.resume_time.read().unwrap();
        assert!(resume.is_some());
    }

    #[test]
    fn graphql_healthy_remaining_passes() {
        let limiter = RateLimiter::default();
        assert!(!limiter.handle_graphql(Some(4999), Some(Utc::now()), None));
        assert_eq!(limiter.encounters(), 0);
    }

    #[test]
    fn graphql_exceeded_text_uses_fallback() {
        let limiter = RateLimiter::default();
        assert!(limiter.handle_graphql(None, None, Some("API rate limit exceeded for user")));
        let resume = limiter.resume_time.read().unwrap().unwrap();
        assert!(resume > Instant::now());
    }
}
