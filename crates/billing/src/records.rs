//! Organization billing records
//!
//! The central mutable entity: one row per organization tracking its plan,
//! Stripe identifiers, pending checkout session, and current billing period.
//! Rows are created lazily on first access through an explicit idempotent
//! upsert so the two-concurrent-first-reads race resolves at the database
//! rather than in application code.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Per-organization billing state.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OrganizationBilling {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub plan_id: Option<Uuid>,
    pub stripe_customer_id: String,
    pub stripe_checkout_session: String,
    pub checkout_session_created_at: Option<OffsetDateTime>,
    pub stripe_subscription_item_id: String,
    pub should_setup_billing: bool,
    pub billing_period_ends: Option<OffsetDateTime>,
}

impl OrganizationBilling {
    pub fn is_billing_active(&self) -> bool {
        self.is_billing_active_at(OffsetDateTime::now_utc())
    }

    /// Active iff a period end is on file and still in the future.
    pub fn is_billing_active_at(&self, now: OffsetDateTime) -> bool {
        self.billing_period_ends.map(|ends| ends > now).unwrap_or(false)
    }
}

const RECORD_COLUMNS: &str = "id, organization_id, plan_id, stripe_customer_id, \
     stripe_checkout_session, checkout_session_created_at, stripe_subscription_item_id, \
     should_setup_billing, billing_period_ends";

/// Data access for billing records.
#[derive(Clone)]
pub struct BillingRecordService {
    pool: PgPool,
}

impl BillingRecordService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Fetch the organization's billing record, creating it with defaults if
    /// it does not exist yet. The insert is a no-op on conflict, so two
    /// concurrent first reads produce exactly one row.
    pub async fn get_or_create(&self, organization_id: Uuid) -> BillingResult<OrganizationBilling> {
        sqlx::query(
            "INSERT INTO organization_billing (organization_id) VALUES ($1) \
             ON CONFLICT (organization_id) DO NOTHING",
        )
        .bind(organization_id)
        .execute(&self.pool)
        .await?;

        let query = format!(
            "SELECT {} FROM organization_billing WHERE organization_id = $1",
            RECORD_COLUMNS
        );
        sqlx::query_as::<_, OrganizationBilling>(&query)
            .bind(organization_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(BillingError::RecordNotFound(organization_id))
    }

    pub async fn get(&self, organization_id: Uuid) -> BillingResult<Option<OrganizationBilling>> {
        let query = format!(
            "SELECT {} FROM organization_billing WHERE organization_id = $1",
            RECORD_COLUMNS
        );
        let record = sqlx::query_as::<_, OrganizationBilling>(&query)
            .bind(organization_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    /// Look a record up by the Stripe customer identifier a webhook carries.
    pub async fn find_by_customer(
        &self,
        stripe_customer_id: &str,
    ) -> BillingResult<Option<OrganizationBilling>> {
        let query = format!(
            "SELECT {} FROM organization_billing WHERE stripe_customer_id = $1",
            RECORD_COLUMNS
        );
        let record = sqlx::query_as::<_, OrganizationBilling>(&query)
            .bind(stripe_customer_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    /// Persist a freshly created checkout session.
    pub async fn set_checkout_session(
        &self,
        record_id: Uuid,
        session_id: &str,
        customer_id: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            "UPDATE organization_billing \
             SET stripe_checkout_session = $2, stripe_customer_id = $3, \
                 checkout_session_created_at = NOW(), updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(record_id)
        .bind(session_id)
        .bind(customer_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Assign a plan and flip the setup gate, used by self-serve enrollment
    /// and signup-with-plan.
    pub async fn assign_plan(
        &self,
        record_id: Uuid,
        plan_id: Uuid,
        should_setup_billing: bool,
    ) -> BillingResult<()> {
        sqlx::query(
            "UPDATE organization_billing \
             SET plan_id = $2, should_setup_billing = $3, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(record_id)
        .bind(plan_id)
        .bind(should_setup_billing)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn record(billing_period_ends: Option<OffsetDateTime>) -> OrganizationBilling {
        OrganizationBilling {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            plan_id: None,
            stripe_customer_id: String::new(),
            stripe_checkout_session: String::new(),
            checkout_session_created_at: None,
            stripe_subscription_item_id: String::new(),
            should_setup_billing: false,
            billing_period_ends,
        }
    }

    #[test]
    fn test_billing_inactive_without_period_end() {
        assert!(!record(None).is_billing_active());
    }

    #[test]
    fn test_billing_active_iff_period_end_in_future() {
        let now = OffsetDateTime::now_utc();
        assert!(record(Some(now + Duration::minutes(10))).is_billing_active_at(now));
        assert!(!record(Some(now - Duration::minutes(10))).is_billing_active_at(now));
        assert!(!record(Some(now)).is_billing_active_at(now));
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_concurrent_first_reads_produce_exactly_one_record(pool: PgPool) {
        let (org_id,): (Uuid,) =
            sqlx::query_as("INSERT INTO organizations (name) VALUES ('Acme') RETURNING id")
                .fetch_one(&pool)
                .await
                .unwrap();

        let service = BillingRecordService::new(pool.clone());
        let other = service.clone();
        let (a, b) = tokio::join!(service.get_or_create(org_id), other.get_or_create(org_id));
        let a = a.unwrap();
        let b = b.unwrap();

        assert_eq!(a.id, b.id);
        assert!(!a.should_setup_billing);
        assert!(a.billing_period_ends.is_none());

        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM organization_billing WHERE organization_id = $1",
        )
        .bind(org_id)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 1);
    }
}
