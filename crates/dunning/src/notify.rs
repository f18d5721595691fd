//! Customer notification collaborator
//!
//! Sends templated dunning emails. The engine only knows template ids and
//! variables; rendering and delivery live behind this trait so the scheduler
//! can run against a recording stub in tests.

use async_trait::async_trait;
use sqlx::PgPool;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use uuid::Uuid;

use crate::error::{DunningError, DunningResult};

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send the template to the customer with the given variables
    async fn send(
        &self,
        template_id: &str,
        customer_id: Uuid,
        variables: serde_json::Value,
    ) -> DunningResult<()>;
}

/// Resend-backed notifier. Templates are plain subject/body pairs with
/// `{{variable}}` placeholders substituted from the attempt context.
pub struct ResendNotifier {
    http: reqwest::Client,
    pool: PgPool,
    api_key: String,
    from_address: String,
}

impl ResendNotifier {
    pub fn new(pool: PgPool, api_key: String, from_address: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            pool,
            api_key,
            from_address,
        }
    }

    pub fn from_env(pool: PgPool) -> DunningResult<Self> {
        let api_key = std::env::var("RESEND_API_KEY")
            .map_err(|_| DunningError::Storage("RESEND_API_KEY not set".to_string()))?;
        let from_address = std::env::var("DUNNING_FROM_EMAIL")
            .unwrap_or_else(|_| "billing@payrecover.dev".to_string());
        Ok(Self::new(pool, api_key, from_address))
    }

    async fn customer_email(&self, customer_id: Uuid) -> DunningResult<String> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT email FROM customers WHERE id = $1")
                .bind(customer_id)
                .fetch_optional(&self.pool)
                .await?;

        let (email,) =
            row.ok_or_else(|| DunningError::NotFound(format!("customer {}", customer_id)))?;
        email.ok_or_else(|| {
            DunningError::InsufficientContext(format!(
                "customer {} has no email address",
                customer_id
            ))
        })
    }

    fn render(template: &str, variables: &serde_json::Value) -> String {
        let mut rendered = template.to_string();
        if let Some(map) = variables.as_object() {
            for (key, value) in map {
                let placeholder = format!("{{{{{}}}}}", key);
                let replacement = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                rendered = rendered.replace(&placeholder, &replacement);
            }
        }
        rendered
    }

    fn template_content(template_id: &str) -> (&'static str, &'static str) {
        match template_id {
            "payment_failed" => (
                "Your payment could not be processed",
                "We were unable to process your payment of {{amount_cents}} cents \
                 ({{currency}}). Reason: {{failure_reason}}. Please update your \
                 payment method to keep your subscription active.",
            ),
            "payment_retry_upcoming" => (
                "We will retry your payment soon",
                "Your payment of {{amount_cents}} cents ({{currency}}) is still \
                 outstanding. We will retry it automatically; you can also update \
                 your payment method now to resolve it sooner.",
            ),
            "pre_dunning_reminder" => (
                "Your subscription renews soon",
                "Your subscription renews on {{renewal_date}} for {{amount_cents}} \
                 cents ({{currency}}). Please make sure your payment method is up \
                 to date to avoid any interruption.",
            ),
            "final_notice" => (
                "Final notice: action required on your subscription",
                "This is attempt {{attempt_number}} to collect your outstanding \
                 payment of {{amount_cents}} cents ({{currency}}). If it cannot be \
                 collected, changes will be applied to your subscription.",
            ),
            _ => (
                "Action required on your payment",
                "Your payment of {{amount_cents}} cents ({{currency}}) failed: \
                 {{failure_reason}}. Please update your payment method.",
            ),
        }
    }
}

#[async_trait]
impl Notifier for ResendNotifier {
    async fn send(
        &self,
        template_id: &str,
        customer_id: Uuid,
        variables: serde_json::Value,
    ) -> DunningResult<()> {
        let to = self.customer_email(customer_id).await?;
        let (subject, body) = Self::template_content(template_id);
        let subject = Self::render(subject, &variables);
        let text = Self::render(body, &variables);

        let payload = serde_json::json!({
            "from": self.from_address,
            "to": [to],
            "subject": subject,
            "text": text,
        });

        // Transient delivery failures get a short backoff before the attempt
        // is recorded as failed.
        let strategy = ExponentialBackoff::from_millis(200).map(jitter).take(3);
        let response = Retry::start(strategy, || async {
            self.http
                .post("https://api.resend.com/emails")
                .bearer_auth(&self.api_key)
                .json(&payload)
                .send()
                .await
        })
        .await
        .map_err(|e| DunningError::Storage(format!("email delivery failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(DunningError::Storage(format!(
                "email provider returned {}: {}",
                status, detail
            )));
        }

        tracing::info!(
            customer_id = %customer_id,
            template = %template_id,
            "Sent dunning email"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_substitutes_known_variables() {
        let vars = serde_json::json!({
            "amount_cents": 1999,
            "currency": "usd",
        });
        let out = ResendNotifier::render("Pay {{amount_cents}} {{currency}} {{missing}}", &vars);
        assert_eq!(out, "Pay 1999 usd {{missing}}");
    }

    #[test]
    fn test_unknown_template_falls_back() {
        let (subject, _) = ResendNotifier::template_content("no_such_template");
        assert_eq!(subject, "Action required on your payment");
    }
}
