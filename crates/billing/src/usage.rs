//! Usage accounting
//!
//! Monthly event counts per organization, computed from the analytics event
//! store and cached in Redis. A count that cannot be computed is reported as
//! `Unavailable`, never as zero: checkout and profile rendering rely on the
//! distinction to surface the error instead of displaying empty usage.

use redis::AsyncCommands;
use sqlx::PgPool;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};
use uuid::Uuid;

use crate::error::BillingResult;

/// Default cache TTL: 12 hours.
pub const DEFAULT_USAGE_CACHE_TTL_SECS: u64 = 43_200;

/// Result of a usage computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventUsage {
    Count(i64),
    /// The analytics store could not be queried. Distinct from zero events;
    /// callers must branch explicitly.
    Unavailable,
}

impl EventUsage {
    pub fn as_option(self) -> Option<i64> {
        match self {
            EventUsage::Count(n) => Some(n),
            EventUsage::Unavailable => None,
        }
    }
}

/// UTC calendar month containing `at`, as a half-open interval
/// `[start of day 1, start of day 1 of the next month)`. Equivalent to the
/// inclusive start-of-day-1 through end-of-day-last-day convention.
pub fn month_bounds(at: OffsetDateTime) -> (OffsetDateTime, OffsetDateTime) {
    let date = at.to_offset(time::UtcOffset::UTC).date();
    // Day 1 is valid for every month.
    let start_date = date.replace_day(1).unwrap_or(date);
    let (next_year, next_month) = match date.month() {
        Month::December => (date.year() + 1, Month::January),
        m => (date.year(), m.next()),
    };
    let next_start_date =
        Date::from_calendar_date(next_year, next_month, 1).unwrap_or(start_date);
    (
        PrimitiveDateTime::new(start_date, Time::MIDNIGHT).assume_utc(),
        PrimitiveDateTime::new(next_start_date, Time::MIDNIGHT).assume_utc(),
    )
}

/// Seconds until 00:00 UTC on day 1 of the next calendar month. Bounds the
/// cache TTL so a prior month's partial count never leaks into the new month.
pub fn seconds_until_next_month(now: OffsetDateTime) -> u64 {
    let (_, next_month_start) = month_bounds(now);
    let remaining = (next_month_start - now).whole_seconds();
    remaining.max(0) as u64
}

/// Usage meter backed by the analytics event store, with an optional Redis
/// cache in front.
#[derive(Clone)]
pub struct UsageMeter {
    pool: PgPool,
    redis: Option<redis::aio::ConnectionManager>,
    cache_ttl_secs: u64,
}

impl UsageMeter {
    pub fn new(
        pool: PgPool,
        redis: Option<redis::aio::ConnectionManager>,
        cache_ttl_secs: u64,
    ) -> Self {
        Self {
            pool,
            redis,
            cache_ttl_secs,
        }
    }

    /// Raw event count for an organization's teams in `[start, end)`.
    /// Transient store errors propagate so task runners can retry.
    pub async fn event_count_between(
        &self,
        organization_id: Uuid,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> BillingResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM events e \
             JOIN teams t ON t.id = e.team_id \
             WHERE t.organization_id = $1 AND e.timestamp >= $2 AND e.timestamp < $3",
        )
        .bind(organization_id)
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Events recorded across all of the organization's teams within the UTC
    /// calendar month containing `at`.
    pub async fn monthly_event_usage(
        &self,
        organization_id: Uuid,
        at: OffsetDateTime,
    ) -> EventUsage {
        let (start, end) = month_bounds(at);
        match self.event_count_between(organization_id, start, end).await {
            Ok(count) => EventUsage::Count(count),
            Err(e) => {
                tracing::warn!(
                    organization_id = %organization_id,
                    error = %e,
                    "Analytics store unreachable while computing monthly usage"
                );
                EventUsage::Unavailable
            }
        }
    }

    /// Cached monthly usage for the current month. Cache expiry is the
    /// configured TTL clamped to the start of the next calendar month.
    /// `Unavailable` results are never cached.
    pub async fn cached_monthly_event_usage(&self, organization_id: Uuid) -> EventUsage {
        let cache_key = format!("monthly_usage_{}", organization_id);

        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            match conn.get::<_, Option<i64>>(&cache_key).await {
                Ok(Some(cached)) => return EventUsage::Count(cached),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Usage cache read failed, computing directly");
                }
            }
        }

        let now = OffsetDateTime::now_utc();
        let usage = self.monthly_event_usage(organization_id, now).await;

        if let (Some(redis), EventUsage::Count(count)) = (&self.redis, usage) {
            let ttl = self.cache_ttl_secs.min(seconds_until_next_month(now));
            if ttl > 0 {
                let mut conn = redis.clone();
                if let Err(e) = conn.set_ex::<_, _, ()>(&cache_key, count, ttl).await {
                    tracing::warn!(error = %e, "Usage cache write failed");
                }
            }
        }

        usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_month_bounds_mid_month() {
        let (start, end) = month_bounds(datetime!(2020-08-07 12:28:15 UTC));
        assert_eq!(start, datetime!(2020-08-01 00:00:00 UTC));
        assert_eq!(end, datetime!(2020-09-01 00:00:00 UTC));
    }

    #[test]
    fn test_month_bounds_december_rolls_into_next_year() {
        let (start, end) = month_bounds(datetime!(2020-12-31 23:59:59 UTC));
        assert_eq!(start, datetime!(2020-12-01 00:00:00 UTC));
        assert_eq!(end, datetime!(2021-01-01 00:00:00 UTC));
    }

    #[test]
    fn test_month_bounds_includes_both_boundaries() {
        // Start of day 1 is inside the interval, start of the next month is not.
        let (start, end) = month_bounds(datetime!(2020-08-15 00:00:00 UTC));
        let first_instant = datetime!(2020-08-01 00:00:00 UTC);
        let last_instant = datetime!(2020-08-31 23:59:59.999999 UTC);
        assert!(first_instant >= start && first_instant < end);
        assert!(last_instant >= start && last_instant < end);
        assert!(end > last_instant);
    }

    #[test]
    fn test_seconds_until_next_month() {
        let now = datetime!(2020-08-31 23:59:00 UTC);
        assert_eq!(seconds_until_next_month(now), 60);

        let start_of_month = datetime!(2020-08-01 00:00:00 UTC);
        assert_eq!(seconds_until_next_month(start_of_month), 31 * 86_400);
    }

    #[test]
    fn test_cache_ttl_never_exceeds_month_boundary() {
        // 90 seconds before midnight on the month boundary, the effective TTL
        // must clamp below the configured 12 hours.
        let now = datetime!(2021-01-31 23:58:30 UTC);
        let effective = DEFAULT_USAGE_CACHE_TTL_SECS.min(seconds_until_next_month(now));
        assert_eq!(effective, 90);

        // Mid-month the configured TTL wins.
        let mid = datetime!(2021-01-10 12:00:00 UTC);
        let effective = DEFAULT_USAGE_CACHE_TTL_SECS.min(seconds_until_next_month(mid));
        assert_eq!(effective, DEFAULT_USAGE_CACHE_TTL_SECS);
    }

    #[test]
    fn test_event_usage_as_option() {
        assert_eq!(EventUsage::Count(42).as_option(), Some(42));
        assert_eq!(EventUsage::Unavailable.as_option(), None);
    }
}
