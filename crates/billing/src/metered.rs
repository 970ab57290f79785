//! Metered billing
//!
//! Two daily jobs: compute daily event usage for every organization on a
//! metered plan, and push not-yet-reported usage to Stripe usage records.
//! Computation and reporting are separate so a Stripe outage never loses a
//! day's count; an unreported row just waits for the next reporting sweep.
//! A computation failure propagates to the scheduler, and each sweep picks
//! up where the last stored day left off, so a failed sweep does not lose
//! the day either.

use sqlx::PgPool;
use time::{Date, Duration, OffsetDateTime, PrimitiveDateTime, Time};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::BillingResult;
use crate::usage::UsageMeter;

/// Idempotency key for a single day's usage report. Stripe dedupes retries
/// on this, so re-running a failed sweep can never double-bill a day.
pub fn usage_idempotency_key(subscription_item_id: &str, day: Date) -> String {
    format!(
        "{}-{:04}-{:02}-{:02}",
        subscription_item_id,
        day.year(),
        u8::from(day.month()),
        day.day()
    )
}

/// The UTC day before `now`, as a half-open interval.
pub fn previous_utc_day(now: OffsetDateTime) -> (Date, OffsetDateTime, OffsetDateTime) {
    let day = (now.to_offset(time::UtcOffset::UTC) - Duration::days(1)).date();
    let start = PrimitiveDateTime::new(day, Time::MIDNIGHT).assume_utc();
    (day, start, start + Duration::days(1))
}

/// Oldest missed day a sweep will go back and recompute.
pub const BACKFILL_WINDOW_DAYS: i64 = 7;

/// First day a sweep must compute, given the organization's last stored
/// day. New organizations start at `yesterday`; gaps from failed sweeps are
/// backfilled up to the window. May return a day after `yesterday`, meaning
/// nothing is due.
pub fn backfill_start(last_computed: Option<Date>, yesterday: Date) -> Date {
    let earliest = yesterday - Duration::days(BACKFILL_WINDOW_DAYS - 1);
    match last_computed {
        None => yesterday,
        Some(last) => {
            let next = last.next_day().unwrap_or(yesterday);
            next.max(earliest)
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MeteredOrganization {
    id: Uuid,
    organization_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct UnreportedUsage {
    id: Uuid,
    billing_period: Date,
    event_usage: i64,
    stripe_subscription_item_id: String,
}

/// Per-sweep tallies, logged by the worker.
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepSummary {
    pub succeeded: usize,
    pub failed: usize,
}

/// Metered-billing usage computation and reporting.
#[derive(Clone)]
pub struct MeteredBillingService {
    pool: PgPool,
    stripe: StripeClient,
    meter: UsageMeter,
}

impl MeteredBillingService {
    pub fn new(pool: PgPool, stripe: StripeClient, meter: UsageMeter) -> Self {
        Self { pool, stripe, meter }
    }

    /// Compute and store daily usage up to yesterday (UTC) for every
    /// organization with a subscription item on file, backfilling days a
    /// failed sweep left uncomputed. Idempotent: re-runs overwrite a day's
    /// count rather than duplicating it. Remaining organizations are still
    /// processed after a failure, but the first error propagates so the
    /// scheduler knows the sweep must run again.
    pub async fn compute_daily_usage(&self, now: OffsetDateTime) -> BillingResult<SweepSummary> {
        let (yesterday, _, _) = previous_utc_day(now);

        let organizations: Vec<MeteredOrganization> = sqlx::query_as(
            "SELECT id, organization_id FROM organization_billing \
             WHERE stripe_subscription_item_id <> ''",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut summary = SweepSummary::default();
        let mut first_error: Option<crate::error::BillingError> = None;
        for org in &organizations {
            let (last_computed,): (Option<Date>,) = sqlx::query_as(
                "SELECT MAX(billing_period) FROM monthly_billing_records \
                 WHERE organization_billing_id = $1",
            )
            .bind(org.id)
            .fetch_one(&self.pool)
            .await?;

            let mut day = backfill_start(last_computed, yesterday);
            while day <= yesterday {
                let start = PrimitiveDateTime::new(day, Time::MIDNIGHT).assume_utc();
                let count = match self
                    .meter
                    .event_count_between(org.organization_id, start, start + Duration::days(1))
                    .await
                {
                    Ok(count) => count,
                    Err(e) => {
                        tracing::error!(
                            organization_id = %org.organization_id,
                            day = %day,
                            error = %e,
                            "Failed to compute daily usage"
                        );
                        summary.failed += 1;
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                        break;
                    }
                };

                sqlx::query(
                    "INSERT INTO monthly_billing_records \
                         (organization_billing_id, billing_period, event_usage) \
                     VALUES ($1, $2, $3) \
                     ON CONFLICT (organization_billing_id, billing_period) \
                     DO UPDATE SET event_usage = EXCLUDED.event_usage",
                )
                .bind(org.id)
                .bind(day)
                .bind(count)
                .execute(&self.pool)
                .await?;
                summary.succeeded += 1;

                match day.next_day() {
                    Some(next) => day = next,
                    None => break,
                }
            }
        }

        tracing::info!(
            through = %yesterday,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Daily usage computation finished"
        );

        // A failed day has no stored row yet; the error must reach the
        // scheduler so the sweep runs again and the backfill catches up.
        match first_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    /// Report stored-but-unreported usage to Stripe. Rows are claimed with
    /// `SKIP LOCKED` and marked reported only after Stripe acknowledges;
    /// failures stay unreported and are retried on the next sweep.
    pub async fn report_unreported_usage(&self) -> BillingResult<SweepSummary> {
        let mut tx = self.pool.begin().await?;

        let records: Vec<UnreportedUsage> = sqlx::query_as(
            "SELECT r.id, r.billing_period, r.event_usage, ob.stripe_subscription_item_id \
             FROM monthly_billing_records r \
             JOIN organization_billing ob ON ob.id = r.organization_billing_id \
             WHERE NOT r.usage_reported AND ob.stripe_subscription_item_id <> '' \
             ORDER BY r.billing_period \
             FOR UPDATE OF r SKIP LOCKED",
        )
        .fetch_all(&mut *tx)
        .await?;

        let mut summary = SweepSummary::default();
        for record in &records {
            let day_start =
                PrimitiveDateTime::new(record.billing_period, Time::MIDNIGHT).assume_utc();
            let key =
                usage_idempotency_key(&record.stripe_subscription_item_id, record.billing_period);

            match self
                .stripe
                .create_usage_record(
                    &record.stripe_subscription_item_id,
                    record.event_usage,
                    day_start.unix_timestamp(),
                    &key,
                )
                .await
            {
                Ok(_) => {
                    sqlx::query(
                        "UPDATE monthly_billing_records SET usage_reported = TRUE WHERE id = $1",
                    )
                    .bind(record.id)
                    .execute(&mut *tx)
                    .await?;
                    summary.succeeded += 1;
                }
                Err(e) => {
                    tracing::error!(
                        subscription_item_id = %record.stripe_subscription_item_id,
                        billing_period = %record.billing_period,
                        error = %e,
                        "Failed to report usage to Stripe, leaving record for retry"
                    );
                    summary.failed += 1;
                }
            }
        }

        tx.commit().await?;

        tracing::info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Usage reporting finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime};

    #[test]
    fn test_idempotency_key_format() {
        assert_eq!(
            usage_idempotency_key("si_HbSpBTL6hI03Lp", date!(2020 - 08 - 07)),
            "si_HbSpBTL6hI03Lp-2020-08-07"
        );
        // Single-digit months and days are zero-padded, so keys stay stable.
        assert_eq!(
            usage_idempotency_key("si_x", date!(2021 - 01 - 03)),
            "si_x-2021-01-03"
        );
    }

    #[test]
    fn test_previous_utc_day_mid_day() {
        let (day, start, end) = previous_utc_day(datetime!(2020-08-07 12:28:15 UTC));
        assert_eq!(day, date!(2020 - 08 - 06));
        assert_eq!(start, datetime!(2020-08-06 00:00:00 UTC));
        assert_eq!(end, datetime!(2020-08-07 00:00:00 UTC));
    }

    #[test]
    fn test_previous_utc_day_crosses_month_boundary() {
        let (day, start, end) = previous_utc_day(datetime!(2020-09-01 00:30:00 UTC));
        assert_eq!(day, date!(2020 - 08 - 31));
        assert_eq!(start, datetime!(2020-08-31 00:00:00 UTC));
        assert_eq!(end, datetime!(2020-09-01 00:00:00 UTC));
    }

    #[test]
    fn test_backfill_starts_at_yesterday_for_new_organizations() {
        assert_eq!(
            backfill_start(None, date!(2020 - 08 - 06)),
            date!(2020 - 08 - 06)
        );
    }

    #[test]
    fn test_backfill_resumes_after_a_missed_day() {
        // Last stored day is two days back: the sweep recomputes the gap.
        assert_eq!(
            backfill_start(Some(date!(2020 - 08 - 04)), date!(2020 - 08 - 06)),
            date!(2020 - 08 - 05)
        );
    }

    #[test]
    fn test_backfill_noop_when_up_to_date() {
        let start = backfill_start(Some(date!(2020 - 08 - 06)), date!(2020 - 08 - 06));
        assert!(start > date!(2020 - 08 - 06));
    }

    #[test]
    fn test_backfill_is_bounded_by_the_window() {
        assert_eq!(
            backfill_start(Some(date!(2020 - 07 - 01)), date!(2020 - 08 - 06)),
            date!(2020 - 07 - 31)
        );
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_unreachable_event_store_fails_the_sweep(pool: sqlx::PgPool) {
        use crate::client::{StripeClient, StripeConfig};

        let (org_id,): (Uuid,) =
            sqlx::query_as("INSERT INTO organizations (name) VALUES ('Acme') RETURNING id")
                .fetch_one(&pool)
                .await
                .unwrap();
        sqlx::query(
            "INSERT INTO organization_billing (organization_id, stripe_subscription_item_id) \
             VALUES ($1, 'si_HbSpBTL6hI03Lp')",
        )
        .bind(org_id)
        .execute(&pool)
        .await
        .unwrap();

        // Event store pool that cannot connect.
        let dead_pool = sqlx::postgres::PgPoolOptions::new()
            .acquire_timeout(std::time::Duration::from_millis(200))
            .connect_lazy("postgres://nobody@127.0.0.1:9/nowhere")
            .unwrap();
        let meter = UsageMeter::new(dead_pool, None, 60);
        let stripe = StripeClient::new(StripeConfig {
            api_key: String::new(),
            publishable_key: String::new(),
            webhook_secret: String::new(),
            site_url: "http://testserver".to_string(),
        })
        .unwrap();
        let service = MeteredBillingService::new(pool.clone(), stripe, meter);

        let result = service.compute_daily_usage(OffsetDateTime::now_utc()).await;
        assert!(result.is_err());

        // The failed day left no row behind, so the next sweep recomputes it.
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM monthly_billing_records")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
