//! Signup follow-up messaging
//!
//! A delayed-job pipeline: signup enqueues a follow-up job, a worker
//! dispatches due jobs, and a per-(user, campaign) messaging record enforces
//! at-most-once delivery. The unique constraint on the record is the source
//! of truth; the row lock narrows the window between the outbound send and
//! stamping `sent_at`, but the email itself is sent without holding any lock.

use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::email::EmailService;
use crate::error::BillingResult;

pub const CAMPAIGN_NO_EVENT_INGESTION_FOLLOWUP: &str = "no_event_ingestion_followup";

/// How long after signup the follow-up goes out.
pub const DEFAULT_FOLLOWUP_DELAY_HOURS: i64 = 24;

const FOLLOWUP_SUBJECT: &str = "Your Glimpse setup";

const FOLLOWUP_BODY: &str = "Hi,\n\n\
You created a Glimpse organization yesterday but we haven't received any \
events from it yet. Usually that means the snippet isn't installed or the \
project API key doesn't match.\n\n\
The integration guide covers the most common setups, and replying to this \
email reaches a human who can help you debug.\n\n\
Glimpse Team";

/// Minimal structural check. The delivery provider does the real validation;
/// this only filters addresses that cannot possibly route.
pub fn is_valid_email(address: &str) -> bool {
    let Some((local, domain)) = address.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !address.contains(char::is_whitespace)
}

/// What happened to a single follow-up job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowupOutcome {
    Sent,
    /// The messaging record was already stamped, by this worker or another.
    AlreadySent,
    /// The user opted out of product communications.
    SkippedAnonymized,
    /// The organization started ingesting events, so the nudge is moot.
    SkippedHasEvents,
    SkippedInvalidEmail,
}

#[derive(Debug, sqlx::FromRow)]
struct FollowupJob {
    id: Uuid,
    user_id: Uuid,
    organization_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct FollowupUser {
    email: String,
    anonymize_data: bool,
}

/// Signup messaging service.
#[derive(Clone)]
pub struct MessagingService {
    pool: PgPool,
    email: EmailService,
}

impl MessagingService {
    pub fn new(pool: PgPool, email: EmailService) -> Self {
        Self { pool, email }
    }

    /// Enqueue the post-signup follow-up for a new user. Called inline from
    /// the signup transaction path; the job itself runs later.
    pub async fn schedule_signup_followup(
        &self,
        user_id: Uuid,
        organization_id: Uuid,
        delay_hours: i64,
    ) -> BillingResult<()> {
        let run_after = OffsetDateTime::now_utc() + Duration::hours(delay_hours);
        sqlx::query(
            "INSERT INTO followup_jobs (user_id, organization_id, campaign, run_after) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(user_id)
        .bind(organization_id)
        .bind(CAMPAIGN_NO_EVENT_INGESTION_FOLLOWUP)
        .bind(run_after)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            user_id = %user_id,
            organization_id = %organization_id,
            run_after = %run_after,
            "Scheduled signup follow-up"
        );
        Ok(())
    }

    /// Claim and run due follow-up jobs. `SKIP LOCKED` lets multiple worker
    /// instances drain the queue without stepping on each other. Jobs whose
    /// send fails stay unprocessed and are retried on the next sweep; skips
    /// are terminal and stamped like successes.
    pub async fn dispatch_due_jobs(&self, batch_size: i64) -> BillingResult<usize> {
        let mut tx = self.pool.begin().await?;

        let jobs: Vec<FollowupJob> = sqlx::query_as(
            "SELECT id, user_id, organization_id FROM followup_jobs \
             WHERE processed_at IS NULL AND run_after <= NOW() \
             ORDER BY run_after \
             LIMIT $1 \
             FOR UPDATE SKIP LOCKED",
        )
        .bind(batch_size)
        .fetch_all(&mut *tx)
        .await?;

        let mut completed: Vec<Uuid> = Vec::with_capacity(jobs.len());
        for job in &jobs {
            match self.check_and_send(job.user_id, job.organization_id).await {
                Ok(outcome) => {
                    tracing::info!(
                        user_id = %job.user_id,
                        organization_id = %job.organization_id,
                        outcome = ?outcome,
                        "Processed signup follow-up"
                    );
                    completed.push(job.id);
                }
                Err(e) => {
                    tracing::error!(
                        user_id = %job.user_id,
                        error = %e,
                        "Signup follow-up failed, leaving job for retry"
                    );
                }
            }
        }

        for job_id in &completed {
            sqlx::query("UPDATE followup_jobs SET processed_at = NOW() WHERE id = $1")
                .bind(job_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(completed.len())
    }

    /// Run the follow-up checks for one user and send the email if every
    /// gate passes. At-most-once per (user, campaign) is enforced by the
    /// unique messaging record plus a locked re-check before stamping.
    pub async fn check_and_send(
        &self,
        user_id: Uuid,
        organization_id: Uuid,
    ) -> BillingResult<FollowupOutcome> {
        let user: FollowupUser =
            sqlx::query_as("SELECT email, anonymize_data FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;

        if user.anonymize_data {
            return Ok(FollowupOutcome::SkippedAnonymized);
        }
        if !is_valid_email(&user.email) {
            tracing::warn!(user_id = %user_id, "Skipping follow-up, email address is invalid");
            return Ok(FollowupOutcome::SkippedInvalidEmail);
        }

        let (has_events,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (\
                 SELECT 1 FROM events e \
                 JOIN teams t ON t.id = e.team_id \
                 WHERE t.organization_id = $1\
             )",
        )
        .bind(organization_id)
        .fetch_one(&self.pool)
        .await?;
        if has_events {
            return Ok(FollowupOutcome::SkippedHasEvents);
        }

        // The unique constraint makes this race-free across workers.
        sqlx::query(
            "INSERT INTO messaging_records (user_id, campaign) VALUES ($1, $2) \
             ON CONFLICT (user_id, campaign) DO NOTHING",
        )
        .bind(user_id)
        .bind(CAMPAIGN_NO_EVENT_INGESTION_FOLLOWUP)
        .execute(&self.pool)
        .await?;

        let (sent_at,): (Option<OffsetDateTime>,) = sqlx::query_as(
            "SELECT sent_at FROM messaging_records WHERE user_id = $1 AND campaign = $2",
        )
        .bind(user_id)
        .bind(CAMPAIGN_NO_EVENT_INGESTION_FOLLOWUP)
        .fetch_one(&self.pool)
        .await?;
        if sent_at.is_some() {
            return Ok(FollowupOutcome::AlreadySent);
        }

        // Send outside any lock; holding a row lock across an outbound HTTP
        // call would serialize the whole queue on the provider's latency.
        self.email
            .send(&user.email, FOLLOWUP_SUBJECT, FOLLOWUP_BODY)
            .await?;

        if self.stamp_if_unsent(user_id).await? {
            Ok(FollowupOutcome::Sent)
        } else {
            tracing::warn!(
                user_id = %user_id,
                campaign = CAMPAIGN_NO_EVENT_INGESTION_FOLLOWUP,
                "Follow-up was sent concurrently by another worker"
            );
            Ok(FollowupOutcome::AlreadySent)
        }
    }

    /// Stamp `sent_at` unless another worker already did. The `FOR UPDATE`
    /// re-check-then-write spans one transaction, so exactly one of any
    /// number of concurrent callers sees `true`.
    async fn stamp_if_unsent(&self, user_id: Uuid) -> BillingResult<bool> {
        let mut tx = self.pool.begin().await?;
        let (sent_at,): (Option<OffsetDateTime>,) = sqlx::query_as(
            "SELECT sent_at FROM messaging_records \
             WHERE user_id = $1 AND campaign = $2 FOR UPDATE",
        )
        .bind(user_id)
        .bind(CAMPAIGN_NO_EVENT_INGESTION_FOLLOWUP)
        .fetch_one(&mut *tx)
        .await?;

        if sent_at.is_some() {
            tx.commit().await?;
            return Ok(false);
        }

        sqlx::query(
            "UPDATE messaging_records SET sent_at = NOW() \
             WHERE user_id = $1 AND campaign = $2",
        )
        .bind(user_id)
        .bind(CAMPAIGN_NO_EVENT_INGESTION_FOLLOWUP)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_addresses() {
        assert!(is_valid_email("charlotte@gmail.com"));
        assert!(is_valid_email("first.last@sub.example.co.uk"));
        assert!(is_valid_email("x+billing@example.io"));
    }

    #[test]
    fn test_invalid_addresses() {
        assert!(!is_valid_email(""));
        assert!(!is_valid_email("no-at-sign.example.com"));
        assert!(!is_valid_email("@example.com"));
        assert!(!is_valid_email("user@"));
        assert!(!is_valid_email("user@localhost"));
        assert!(!is_valid_email("user@.example.com"));
        assert!(!is_valid_email("user@example.com."));
        assert!(!is_valid_email("user name@example.com"));
    }

    #[test]
    fn test_default_delay_is_a_day() {
        assert_eq!(DEFAULT_FOLLOWUP_DELAY_HOURS, 24);
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_concurrent_workers_stamp_exactly_one_send(pool: PgPool) {
        use crate::email::{EmailConfig, EmailService};

        let (user_id,): (Uuid,) = sqlx::query_as(
            "INSERT INTO users (email, password_hash) \
             VALUES ('charlotte@gmail.com', 'hash') RETURNING id",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO messaging_records (user_id, campaign) VALUES ($1, $2)")
            .bind(user_id)
            .bind(CAMPAIGN_NO_EVENT_INGESTION_FOLLOWUP)
            .execute(&pool)
            .await
            .unwrap();

        let email = EmailService::new(EmailConfig {
            api_url: String::new(),
            api_key: String::new(),
            from_address: "hello@glimpse.com".to_string(),
        })
        .unwrap();
        let service = MessagingService::new(pool.clone(), email);
        let other = service.clone();

        let (a, b) = tokio::join!(
            service.stamp_if_unsent(user_id),
            other.stamp_if_unsent(user_id)
        );
        let stamped = [a.unwrap(), b.unwrap()];
        assert_eq!(stamped.iter().filter(|won| **won).count(), 1);

        let (sent_at,): (Option<OffsetDateTime>,) = sqlx::query_as(
            "SELECT sent_at FROM messaging_records WHERE user_id = $1 AND campaign = $2",
        )
        .bind(user_id)
        .bind(CAMPAIGN_NO_EVENT_INGESTION_FOLLOWUP)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert!(sent_at.is_some());
    }
}
