//! Utility functions for clustermon

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Parse duration string (e.g., "30s", "5m", "1h", "7d")
pub fn parse_duration(s: &str) -> crate::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::InvalidConfig("empty duration".into()));
    }

    let (num_str, unit) = if let Some(num) = s.strip_suffix("ms") {
        (num, "ms")
    } else {
        s.split_at(s.len() - s.chars().last().map_or(0, char::len_utf8))
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid duration: {}", s)))?;

    let duration = match unit {
        "ms" => Duration::from_millis(num),
        "s" => Duration::from_secs(num),
        "m" => Duration::from_secs(num * 60),
        "h" => Duration::from_secs(num * 3600),
        "d" => Duration::from_secs(num * 86400),
        _ => {
            return Err(crate::Error::InvalidConfig(format!(
                "unknown duration unit: {}",
                unit
            )))
        }
    };

    Ok(duration)
}

/// Get current Unix timestamp (fractional seconds)
pub fn timestamp_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Render a Unix timestamp for log lines
pub fn format_timestamp(ts: f64) -> String {
    chrono::DateTime::from_timestamp(ts.trunc() as i64, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| format!("{:.3}", ts))
}

/// Wall clock source for every decision that compares timestamps.
pub trait Clock: Send + Sync + 'static {
    /// Current Unix time in fractional seconds
    fn now(&self) -> f64;
}

#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        timestamp_now()
    }
}

/// Manually advanced clock, shared between clones.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<f64>>,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, delta: Duration) {
        *self.now.lock() += delta.as_secs_f64();
    }

    pub fn set(&self, now: f64) {
        *self.now.lock() = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock()
    }
}

/// Last-writer-wins decision for a timestamped field.
///
/// The remote value wins when it differs from the local one and either the
/// local value is unset or the remote stamp is strictly newer.
pub fn newer_wins<T: PartialEq>(
    local: Option<&T>,
    local_updated: f64,
    remote: &T,
    remote_updated: f64,
) -> bool {
    match local {
        None => true,
        Some(value) if value == remote => false,
        Some(_) => remote_updated > local_updated,
    }
}

/// Retry with exponential backoff
pub async fn retry_with_backoff<F, Fut, T>(
    mut f: F,
    max_retries: usize,
    initial_delay: Duration,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::Result<T>>,
{
    let mut delay = initial_delay;

    for attempt in 0..max_retries {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt + 1 < max_retries => {
                tracing::warn!(
                    "Retry attempt {} failed: {}, retrying in {:?}",
                    attempt + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }

    Err(crate::Error::Internal("Max retries exceeded".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(604800));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("10x").is_err());
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(100.0);
        let other = clock.clone();
        clock.advance(Duration::from_millis(1500));
        assert_eq!(other.now(), 101.5);
        other.set(5.0);
        assert_eq!(clock.now(), 5.0);
    }

    #[test]
    fn test_newer_wins() {
        let frozen = "frozen".to_string();
        let thawed = "thawed".to_string();
        assert!(newer_wins(None, 0.0, &frozen, 1.0));
        assert!(!newer_wins(Some(&frozen), 0.0, &frozen, 10.0));
        assert!(newer_wins(Some(&thawed), 1.0, &frozen, 2.0));
        assert!(!newer_wins(Some(&thawed), 2.0, &frozen, 1.0));
        assert!(!newer_wins(Some(&thawed), 2.0, &frozen, 2.0));
    }

    #[tokio::test]
    async fn test_retry_gives_up_on_permanent_error() {
        let mut calls = 0;
        let res: crate::Result<()> = retry_with_backoff(
            || {
                calls += 1;
                async { Err(crate::Error::UnknownService("x".into())) }
            },
            3,
            Duration::from_millis(1),
        )
        .await;
        assert!(res.is_err());
        assert_eq!(calls, 1);
    }
}
