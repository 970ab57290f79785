//! Billing error types

use uuid::Uuid;

/// Errors produced by the billing crate.
///
/// The taxonomy matters for callers: `NotConfigured` degrades the billing
/// section of a response, `InvalidSignature`/`InvalidPayload` reject a single
/// webhook, and `Stripe`/`Database`/`Cache` are transient and must propagate
/// so the task runner can retry.
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("billing is not configured: {0}")]
    NotConfigured(&'static str),

    #[error("invalid webhook signature")]
    InvalidSignature,

    #[error("invalid webhook payload: {0}")]
    InvalidPayload(String),

    #[error("invoice line items do not match subscription item {0} on file")]
    SubscriptionItemMismatch(String),

    #[error("plan not found: {0}")]
    PlanNotFound(String),

    #[error("plan {0} is not eligible for self-serve enrollment")]
    PlanNotSelfServe(String),

    #[error("billing record not found for organization {0}")]
    RecordNotFound(Uuid),

    #[error("Stripe API error: {0}")]
    Stripe(String),

    #[error("email delivery failed: {0}")]
    Email(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type BillingResult<T> = Result<T, BillingError>;
