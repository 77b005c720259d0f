use crate::archive::parse_reception_timestamp;
use crate::orthanc::{OrthancApi, OrthancError, SystemInfo};
use chrono::{DateTime, NaiveDateTime};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Clone, Debug, PartialEq)]
pub enum Health {
    Reachable(SystemInfo),
    Unreachable {
        attempts: u32,
        last_error: OrthancError,
    },
}

impl Health {
    pub fn is_reachable(&self) -> bool {
        matches!(self, Self::Reachable(_))
    }
}

/// Polls `GET /system` up to `attempts` times, sleeping `delay` between
/// attempts but not after the last one.
pub fn check_health(api: &dyn OrthancApi, attempts: u32, delay: Duration) -> Health {
    let attempts = attempts.max(1);
    let mut last_error = OrthancError::Transport("no attempt made".into());

    for attempt in 1..=attempts {
        match api.system() {
            Ok(info) => {
                info!(
                    "[HEALTH] reachable attempt={attempt} version={}",
                    info.version.as_deref().unwrap_or("unknown")
                );
                return Health::Reachable(info);
            }
            Err(err) => {
                warn!(
                    "[HEALTH] attempt-failed attempt={attempt}/{attempts} code={} err={err}",
                    err.code()
                );
                last_error = err;
            }
        }
        if attempt < attempts {
            thread::sleep(delay);
        }
    }

    warn!("[HEALTH] unreachable attempts={attempts} err={last_error}");
    Health::Unreachable {
        attempts,
        last_error,
    }
}

/// Accepts RFC 3339 as well as the server's compact `YYYYMMDDTHHMMSS` form.
pub fn parse_startup_time(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.naive_utc())
        .ok()
        .or_else(|| parse_reception_timestamp(raw))
}

/// Returns the uptime when the server started less than `window` ago.
pub fn recent_restart(
    startup: NaiveDateTime,
    now: NaiveDateTime,
    window: Duration,
) -> Option<Duration> {
    let uptime = now.signed_duration_since(startup).to_std().ok()?;
    (uptime < window).then_some(uptime)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeOrthanc;

    fn at(raw: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[test]
    fn succeeds_on_first_reachable_attempt() {
        let fake = FakeOrthanc::new();
        fake.push_system(Err(OrthancError::Timeout));
        fake.push_system(Ok(SystemInfo {
            version: Some("1.12.3".into()),
            ..SystemInfo::default()
        }));

        let health = check_health(&fake, 3, Duration::ZERO);
        assert!(health.is_reachable());
        assert_eq!(fake.system_calls(), 2);
    }

    #[test]
    fn fails_closed_after_all_attempts() {
        let fake = FakeOrthanc::new();
        fake.set_system(Err(OrthancError::Status {
            status: 503,
            body: String::new(),
        }));

        let health = check_health(&fake, 3, Duration::ZERO);
        assert_eq!(
            health,
            Health::Unreachable {
                attempts: 3,
                last_error: OrthancError::Status {
                    status: 503,
                    body: String::new()
                },
            }
        );
        assert_eq!(fake.system_calls(), 3);
    }

    #[test]
    fn zero_attempts_still_checks_once() {
        let fake = FakeOrthanc::new();
        fake.set_reachable(false);
        assert!(!check_health(&fake, 0, Duration::ZERO).is_reachable());
        assert_eq!(fake.system_calls(), 1);
    }

    #[test]
    fn parses_startup_formats() {
        assert_eq!(
            parse_startup_time("2024-05-01T10:00:00+02:00"),
            Some(at("2024-05-01 08:00:00"))
        );
        assert_eq!(
            parse_startup_time("20240501T100000"),
            Some(at("2024-05-01 10:00:00"))
        );
        assert_eq!(parse_startup_time("yesterday"), None);
    }

    #[test]
    fn restart_window_is_exclusive() {
        let startup = at("2024-05-01 10:00:00");
        let window = Duration::from_secs(300);
        assert_eq!(
            recent_restart(startup, at("2024-05-01 10:04:59"), window),
            Some(Duration::from_secs(299))
        );
        assert_eq!(recent_restart(startup, at("2024-05-01 10:05:00"), window), None);
        // Clock skew: a startup in the future is not a restart.
        assert_eq!(recent_restart(startup, at("2024-05-01 09:59:00"), window), None);
    }
}
