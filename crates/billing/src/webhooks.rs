//! Stripe webhook handling
//!
//! Verifies webhook signatures, parses the two event types the billing state
//! machine consumes, and reconciles invoice line items against the
//! subscription item stored on the billing record. Verification and payload
//! validation happen before any state is touched; the read-check-write over
//! the billing row runs under a database row lock so concurrently delivered
//! webhooks for the same organization cannot race on `billing_period_ends`.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use time::{Duration, OffsetDateTime};

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::records::{BillingRecordService, OrganizationBilling};

type HmacSha256 = Hmac<Sha256>;

/// Signature timestamps older or newer than this are rejected.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

pub const EVENT_INVOICE_PAYMENT_SUCCEEDED: &str = "invoice.payment_succeeded";
pub const EVENT_PAYMENT_INTENT_CAPTURABLE: &str = "payment_intent.amount_capturable_updated";

/// A verified webhook envelope. `object` stays untyped until the event type
/// is known.
#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookEventData,
}

#[derive(Debug, Deserialize)]
pub struct WebhookEventData {
    pub object: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceObject {
    pub customer: String,
    pub lines: InvoiceLines,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceLines {
    pub data: Vec<InvoiceLineItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InvoiceLineItem {
    #[serde(default)]
    pub subscription_item: Option<String>,
    pub period: LinePeriod,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LinePeriod {
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntentObject {
    pub id: String,
    pub customer: String,
}

/// Verify a `Stripe-Signature` header (`t=<ts>,v1=<hex>`) over the raw
/// request body. HMAC-SHA256 of `"{t}.{payload}"` keyed by the shared
/// webhook secret, with a bounded timestamp skew.
pub fn verify_signature(
    payload: &str,
    signature_header: &str,
    secret: &str,
    now_unix: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<&str> = None;

    for part in signature_header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => v1_signature = Some(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(BillingError::InvalidSignature)?;
    let v1_signature = v1_signature.ok_or(BillingError::InvalidSignature)?;

    if (now_unix - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(BillingError::InvalidSignature);
    }

    let provided = hex::decode(v1_signature).map_err(|_| BillingError::InvalidSignature)?;

    let signed_payload = format!("{}.{}", timestamp, payload);
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::InvalidSignature)?;
    mac.update(signed_payload.as_bytes());
    // Constant-time comparison via the Mac trait.
    mac.verify_slice(&provided)
        .map_err(|_| BillingError::InvalidSignature)
}

/// How an invoice line item was selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineMatch {
    /// No subscription item on file yet: the first line item is taken and its
    /// subscription item id will be recorded. `ambiguous` marks an invoice
    /// that carried more than one item.
    First {
        item: InvoiceLineItem,
        ambiguous: bool,
    },
    /// A line item matched the subscription item already on file.
    Matched(InvoiceLineItem),
}

/// Select the invoice line item that drives the billing period update.
///
/// With an id on file, exactly one item must carry it; anything else is a
/// hard error and the caller must not change state. With no id on file the
/// first item wins unconditionally.
pub fn match_invoice_line(
    items: &[InvoiceLineItem],
    subscription_item_on_file: &str,
) -> BillingResult<LineMatch> {
    if subscription_item_on_file.is_empty() {
        let first = items
            .first()
            .ok_or_else(|| BillingError::InvalidPayload("invoice has no line items".into()))?;
        return Ok(LineMatch::First {
            item: first.clone(),
            ambiguous: items.len() > 1,
        });
    }

    items
        .iter()
        .find(|item| item.subscription_item.as_deref() == Some(subscription_item_on_file))
        .cloned()
        .map(LineMatch::Matched)
        .ok_or_else(|| {
            BillingError::SubscriptionItemMismatch(subscription_item_on_file.to_string())
        })
}

/// Webhook handler over the billing record state machine.
#[derive(Clone)]
pub struct WebhookHandler {
    stripe: StripeClient,
    records: BillingRecordService,
    /// Billing period granted by a successful card validation, anchored to
    /// the organization's creation date.
    trial_days: i64,
}

impl WebhookHandler {
    pub fn new(stripe: StripeClient, records: BillingRecordService, trial_days: i64) -> Self {
        Self {
            stripe,
            records,
            trial_days,
        }
    }

    /// Verify the signature and parse the envelope. 400-class errors only;
    /// no state is touched here.
    pub fn verify_and_parse(
        &self,
        payload: &str,
        signature_header: &str,
    ) -> BillingResult<WebhookEvent> {
        let secret = &self.stripe.config().webhook_secret;
        if secret.is_empty() {
            return Err(BillingError::NotConfigured(
                "STRIPE_WEBHOOK_SECRET is not set",
            ));
        }
        verify_signature(
            payload,
            signature_header,
            secret,
            OffsetDateTime::now_utc().unix_timestamp(),
        )?;

        serde_json::from_str(payload)
            .map_err(|e| BillingError::InvalidPayload(e.to_string()))
    }

    /// Handle a verified event. `Ok(())` means processed or benign no-op;
    /// errors map to a 400 (or 500 for infrastructure failures) upstream.
    pub async fn handle_event(&self, event: WebhookEvent) -> BillingResult<()> {
        match event.event_type.as_str() {
            EVENT_INVOICE_PAYMENT_SUCCEEDED => {
                let invoice: InvoiceObject = serde_json::from_value(event.data.object)
                    .map_err(|e| BillingError::InvalidPayload(e.to_string()))?;
                self.handle_invoice_payment_succeeded(invoice).await
            }
            EVENT_PAYMENT_INTENT_CAPTURABLE => {
                let intent: PaymentIntentObject = serde_json::from_value(event.data.object)
                    .map_err(|e| BillingError::InvalidPayload(e.to_string()))?;
                self.handle_payment_intent_capturable(intent).await
            }
            other => {
                tracing::info!(event_type = %other, "Ignoring unhandled Stripe event type");
                Ok(())
            }
        }
    }

    /// Advance the billing period from a paid invoice. The period comes from
    /// the line items rather than the invoice header: Stripe sets the
    /// invoice-level period to a zero-length interval on the first month.
    async fn handle_invoice_payment_succeeded(&self, invoice: InvoiceObject) -> BillingResult<()> {
        let record = match self.records.find_by_customer(&invoice.customer).await? {
            Some(record) => record,
            None => {
                tracing::warn!(
                    customer_id = %invoice.customer,
                    "Received invoice.payment_succeeded but customer is not in the database"
                );
                return Ok(());
            }
        };

        let mut tx = self.records.pool().begin().await?;

        // Re-read under lock: the on-file subscription item decides matching
        // and must not move between the check and the write.
        let locked: OrganizationBilling = sqlx::query_as(
            "SELECT id, organization_id, plan_id, stripe_customer_id, \
                    stripe_checkout_session, checkout_session_created_at, \
                    stripe_subscription_item_id, should_setup_billing, billing_period_ends \
             FROM organization_billing WHERE id = $1 FOR UPDATE",
        )
        .bind(record.id)
        .fetch_one(&mut *tx)
        .await?;

        let selected = match match_invoice_line(
            &invoice.lines.data,
            &locked.stripe_subscription_item_id,
        ) {
            Ok(selected) => selected,
            Err(e) => {
                tracing::error!(
                    organization_id = %locked.organization_id,
                    customer_id = %invoice.customer,
                    subscription_item_on_file = %locked.stripe_subscription_item_id,
                    "Stripe webhook does not match subscription item on file"
                );
                return Err(e);
            }
        };

        let item = match &selected {
            LineMatch::First { item, ambiguous } => {
                if *ambiguous {
                    tracing::warn!(
                        organization_id = %locked.organization_id,
                        line_items = invoice.lines.data.len(),
                        "Stripe invoice.payment_succeeded webhook contained more than 1 item, using the first one"
                    );
                }
                item
            }
            LineMatch::Matched(item) => item,
        };

        let period_end = OffsetDateTime::from_unix_timestamp(item.period.end)
            .map_err(|e| BillingError::InvalidPayload(format!("invalid period end: {}", e)))?;

        let subscription_item_id = if locked.stripe_subscription_item_id.is_empty() {
            item.subscription_item.clone().unwrap_or_default()
        } else {
            locked.stripe_subscription_item_id.clone()
        };

        sqlx::query(
            "UPDATE organization_billing \
             SET billing_period_ends = $2, stripe_subscription_item_id = $3, \
                 should_setup_billing = FALSE, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(locked.id)
        .bind(period_end)
        .bind(&subscription_item_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            organization_id = %locked.organization_id,
            billing_period_ends = %period_end,
            subscription_item_id = %subscription_item_id,
            "Billing period advanced from invoice"
        );

        Ok(())
    }

    /// Card-validation-only flow: a capturable hold means the card is valid.
    /// Grant the plan-specific period (organization creation + trial length)
    /// and release the hold. No subscription item exists in this flow, so
    /// `stripe_subscription_item_id` is left untouched.
    async fn handle_payment_intent_capturable(
        &self,
        intent: PaymentIntentObject,
    ) -> BillingResult<()> {
        let record = match self.records.find_by_customer(&intent.customer).await? {
            Some(record) => record,
            None => {
                tracing::warn!(
                    customer_id = %intent.customer,
                    "Received payment_intent.amount_capturable_updated but customer is not in the database"
                );
                return Ok(());
            }
        };

        let mut tx = self.records.pool().begin().await?;

        let (organization_created_at,): (OffsetDateTime,) =
            sqlx::query_as("SELECT created_at FROM organizations WHERE id = $1")
                .bind(record.organization_id)
                .fetch_one(&mut *tx)
                .await?;

        let period_end = organization_created_at + Duration::days(self.trial_days);

        sqlx::query(
            "UPDATE organization_billing \
             SET billing_period_ends = $2, should_setup_billing = FALSE, updated_at = NOW() \
             WHERE id = (SELECT id FROM organization_billing WHERE id = $1 FOR UPDATE)",
        )
        .bind(record.id)
        .bind(period_end)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            organization_id = %record.organization_id,
            billing_period_ends = %period_end,
            "Billing period granted after card validation"
        );

        // Release the authorization hold; the 50 cents are never captured.
        if let Err(e) = self.stripe.cancel_payment_intent(&intent.id).await {
            tracing::warn!(
                payment_intent_id = %intent.id,
                error = %e,
                "Failed to cancel card-validation payment intent"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn sign(payload: &str, secret: &str, timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    const SECRET: &str = "wh_sec_test_abcdefghijklmnopqrstuvwxyz";

    #[test]
    fn test_valid_signature_passes() {
        let payload = r#"{"type":"invoice.payment_succeeded"}"#;
        let header = sign(payload, SECRET, 1_594_124_897);
        assert!(verify_signature(payload, &header, SECRET, 1_594_124_897).is_ok());
    }

    #[test]
    fn test_flipped_signature_byte_fails() {
        let payload = r#"{"type":"invoice.payment_succeeded"}"#;
        let header = sign(payload, SECRET, 1_594_124_897);
        // Flip the final hex digit.
        let mut bytes = header.into_bytes();
        let last = *bytes.last().unwrap();
        *bytes.last_mut().unwrap() = if last == b'0' { b'1' } else { b'0' };
        let tampered = String::from_utf8(bytes).unwrap();

        assert!(matches!(
            verify_signature(payload, &tampered, SECRET, 1_594_124_897),
            Err(BillingError::InvalidSignature)
        ));
    }

    #[test]
    fn test_tampered_payload_fails() {
        let header = sign(r#"{"amount":50}"#, SECRET, 1_594_124_897);
        assert!(matches!(
            verify_signature(r#"{"amount":5000}"#, &header, SECRET, 1_594_124_897),
            Err(BillingError::InvalidSignature)
        ));
    }

    #[test]
    fn test_stale_timestamp_fails() {
        let payload = "{}";
        let header = sign(payload, SECRET, 1_594_124_897);
        assert!(matches!(
            verify_signature(payload, &header, SECRET, 1_594_124_897 + 301),
            Err(BillingError::InvalidSignature)
        ));
        // Within tolerance is fine.
        assert!(verify_signature(payload, &header, SECRET, 1_594_124_897 + 299).is_ok());
    }

    #[test]
    fn test_signature_hex_is_case_insensitive() {
        let payload = "{}";
        let header = sign(payload, SECRET, 1_594_124_897);
        let (prefix, sig) = header.split_once("v1=").unwrap();
        let upper = format!("{}v1={}", prefix, sig.to_uppercase());
        assert!(verify_signature(payload, &upper, SECRET, 1_594_124_897).is_ok());
    }

    #[test]
    fn test_non_hex_signature_fails() {
        let payload = "{}";
        let header = sign(payload, SECRET, 1_594_124_897);
        let (prefix, _) = header.split_once("v1=").unwrap();
        let garbage = format!("{}v1=not-hex-at-all", prefix);
        assert!(matches!(
            verify_signature(payload, &garbage, SECRET, 1_594_124_897),
            Err(BillingError::InvalidSignature)
        ));
    }

    #[test]
    fn test_malformed_header_fails() {
        assert!(matches!(
            verify_signature("{}", "v1=abcdef", SECRET, 0),
            Err(BillingError::InvalidSignature)
        ));
        assert!(matches!(
            verify_signature("{}", "t=123", SECRET, 123),
            Err(BillingError::InvalidSignature)
        ));
    }

    fn line(subscription_item: Option<&str>, end: i64) -> InvoiceLineItem {
        InvoiceLineItem {
            subscription_item: subscription_item.map(|s| s.to_string()),
            period: LinePeriod {
                start: 1_594_124_895,
                end,
            },
        }
    }

    #[test]
    fn test_single_item_no_prior_id_takes_first() {
        let items = vec![line(Some("si_HbSpBTL6hI03Lp"), 1_596_803_295)];
        let selected = match_invoice_line(&items, "").unwrap();
        assert_eq!(
            selected,
            LineMatch::First {
                item: items[0].clone(),
                ambiguous: false
            }
        );
    }

    #[test]
    fn test_two_items_no_prior_id_takes_first_and_flags_ambiguity() {
        let items = vec![
            line(Some("si_01234567890"), 1_596_803_295),
            line(Some("si_abcdefghi"), 1_206_803_292),
        ];
        match match_invoice_line(&items, "").unwrap() {
            LineMatch::First { item, ambiguous } => {
                assert!(ambiguous);
                assert_eq!(item.subscription_item.as_deref(), Some("si_01234567890"));
                assert_eq!(item.period.end, 1_596_803_295);
            }
            other => panic!("expected First, got {:?}", other),
        }
    }

    #[test]
    fn test_prior_id_matching_second_item_wins() {
        let items = vec![
            line(Some("si_01234567890"), 1_596_803_295),
            line(Some("si_abcdefghi"), 1_607_453_607),
        ];
        match match_invoice_line(&items, "si_abcdefghi").unwrap() {
            LineMatch::Matched(item) => {
                assert_eq!(item.period.end, 1_607_453_607);
            }
            other => panic!("expected Matched, got {:?}", other),
        }
    }

    #[test]
    fn test_prior_id_matching_neither_item_is_hard_error() {
        let items = vec![
            line(Some("invalid"), 1_596_803_295),
            line(Some("invalid2"), 1_596_803_295),
        ];
        assert!(matches!(
            match_invoice_line(&items, "si_1234567890"),
            Err(BillingError::SubscriptionItemMismatch(_))
        ));
    }

    #[test]
    fn test_empty_line_items_is_invalid_payload() {
        assert!(matches!(
            match_invoice_line(&[], ""),
            Err(BillingError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_period_end_epoch_converts_to_utc() {
        let end = OffsetDateTime::from_unix_timestamp(1_596_803_295).unwrap();
        assert_eq!(end, datetime!(2020-08-07 12:28:15 UTC));

        let other = OffsetDateTime::from_unix_timestamp(1_607_453_607).unwrap();
        assert_eq!(other, datetime!(2020-12-08 18:53:27 UTC));
    }

    #[test]
    fn test_envelope_parsing() {
        let body = r#"
        {
            "id": "evt_1H2FuICyh3ETxLbCJnSt7FQu",
            "data": {
                "object": {
                    "id": "in_1H2FuFCyh3ETxLbCNarFj00f",
                    "customer": "cus_aEDNOHbSpxHcmq",
                    "lines": {
                        "data": [
                            {
                                "subscription_item": "si_HbSpBTL6hI03Lp",
                                "period": {"end": 1596803295, "start": 1594124895}
                            }
                        ]
                    }
                }
            },
            "type": "invoice.payment_succeeded"
        }
        "#;

        let event: WebhookEvent = serde_json::from_str(body).unwrap();
        assert_eq!(event.event_type, EVENT_INVOICE_PAYMENT_SUCCEEDED);

        let invoice: InvoiceObject = serde_json::from_value(event.data.object).unwrap();
        assert_eq!(invoice.customer, "cus_aEDNOHbSpxHcmq");
        assert_eq!(invoice.lines.data.len(), 1);
        assert_eq!(invoice.lines.data[0].period.end, 1_596_803_295);
    }

    #[test]
    fn test_invoice_missing_customer_key_is_invalid() {
        let object = serde_json::json!({
            "id": "in_1H2FuFCyh3ETxLbCNarFj00f",
            "customer_UNEXPECTED_KEY": "cus_dEDNOHbSpxHcmq",
            "lines": {"data": [{"period": {"end": 1596803295, "start": 1594124895}}]}
        });
        assert!(serde_json::from_value::<InvoiceObject>(object).is_err());
    }

    #[test]
    fn test_not_json_payload_is_rejected() {
        assert!(serde_json::from_str::<WebhookEvent>("Not a JSON?").is_err());
    }
}
