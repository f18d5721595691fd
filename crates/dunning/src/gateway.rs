//! Payment gateway collaborator
//!
//! Re-runs the original charge. A decline is an expected outcome, not an
//! error: `ChargeOutcome::Declined` feeds the attempt's `payment_error` and
//! the campaign keeps moving through its schedule.

use async_trait::async_trait;
use sqlx::PgPool;
use stripe::{
    Client, CreatePaymentIntent, Currency, CustomerId, PaymentIntent, PaymentIntentStatus,
    PaymentMethodId, RequestStrategy,
};
use uuid::Uuid;

use crate::error::{DunningError, DunningResult};

/// Domain identifiers the gateway resolves into provider context
#[derive(Debug, Clone)]
pub struct PaymentContext {
    pub workspace_id: Uuid,
    pub customer_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub payment_id: Option<Uuid>,
    /// The attempt driving this charge. Gateways must key provider-side
    /// deduplication on it: a timed-out request is indeterminate, and the
    /// re-issued charge for the same attempt must not bill twice.
    pub attempt_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeOutcome {
    /// The charge went through; `payment_id` is the provider reference
    Succeeded { payment_id: String },
    /// The provider declined or failed the charge
    Declined { reason: String },
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn retry_charge(
        &self,
        ctx: &PaymentContext,
        amount_cents: i64,
        currency: &str,
    ) -> DunningResult<ChargeOutcome>;
}

/// Stripe-backed gateway: confirms an off-session PaymentIntent against the
/// customer's stored default payment method.
pub struct StripeGateway {
    client: Client,
    pool: PgPool,
}

impl StripeGateway {
    pub fn new(secret_key: &str, pool: PgPool) -> Self {
        Self {
            client: Client::new(secret_key),
            pool,
        }
    }

    pub fn from_env(pool: PgPool) -> DunningResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| DunningError::Storage("STRIPE_SECRET_KEY not set".to_string()))?;
        Ok(Self::new(&secret_key, pool))
    }

    async fn stripe_context(
        &self,
        customer_id: Uuid,
    ) -> DunningResult<(CustomerId, Option<PaymentMethodId>)> {
        let row: Option<(Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT stripe_customer_id, stripe_payment_method_id FROM customers WHERE id = $1",
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;

        let (stripe_customer, payment_method) = row
            .ok_or_else(|| DunningError::NotFound(format!("customer {}", customer_id)))?;

        let stripe_customer = stripe_customer.ok_or_else(|| {
            DunningError::InsufficientContext(format!(
                "customer {} has no provider customer id",
                customer_id
            ))
        })?;

        let customer = stripe_customer
            .parse::<CustomerId>()
            .map_err(|e| DunningError::Storage(format!("invalid customer id: {}", e)))?;
        let payment_method = payment_method
            .map(|pm| pm.parse::<PaymentMethodId>())
            .transpose()
            .map_err(|e| DunningError::Storage(format!("invalid payment method id: {}", e)))?;

        Ok((customer, payment_method))
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn retry_charge(
        &self,
        ctx: &PaymentContext,
        amount_cents: i64,
        currency: &str,
    ) -> DunningResult<ChargeOutcome> {
        let currency = currency
            .to_lowercase()
            .parse::<Currency>()
            .map_err(|e| DunningError::Validation(format!("invalid currency: {}", e)))?;

        let (customer, payment_method) = self.stripe_context(ctx.customer_id).await?;

        let mut params = CreatePaymentIntent::new(amount_cents, currency);
        params.customer = Some(customer);
        params.payment_method = payment_method;
        params.confirm = Some(true);
        let description = match (ctx.subscription_id, ctx.payment_id) {
            (Some(sub), _) => format!("Dunning retry for subscription {}", sub),
            (None, Some(pay)) => format!("Dunning retry for payment {}", pay),
            (None, None) => "Dunning retry".to_string(),
        };
        params.description = Some(&description);

        // Keyed on the attempt id: if the caller times out and re-issues the
        // charge for this attempt, Stripe collapses both requests into one
        // PaymentIntent instead of billing twice.
        let client = self
            .client
            .clone()
            .with_strategy(RequestStrategy::Idempotent(format!(
                "dunning-attempt-{}",
                ctx.attempt_id
            )));

        let intent = match PaymentIntent::create(&client, params).await {
            Ok(intent) => intent,
            Err(e) => {
                // Card declines surface as provider errors; report them as a
                // decline so the attempt records the reason instead of the
                // whole scheduling pass erroring out.
                return Ok(ChargeOutcome::Declined {
                    reason: e.to_string(),
                });
            }
        };

        match intent.status {
            PaymentIntentStatus::Succeeded => Ok(ChargeOutcome::Succeeded {
                payment_id: intent.id.to_string(),
            }),
            status => Ok(ChargeOutcome::Declined {
                reason: format!("payment intent {} in status {:?}", intent.id, status),
            }),
        }
    }
}
