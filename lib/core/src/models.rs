use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::OrchestratorError;

/// Kind of business object a provider originates
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Payment,
    Subscription,
    Dispute,
    Payout,
    Invoice,
    PaymentSession,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Payment => "payment",
            EntityType::Subscription => "subscription",
            EntityType::Dispute => "dispute",
            EntityType::Payout => "payout",
            EntityType::Invoice => "invoice",
            EntityType::PaymentSession => "payment_session",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "payment" => Ok(EntityType::Payment),
            "subscription" => Ok(EntityType::Subscription),
            "dispute" => Ok(EntityType::Dispute),
            "payout" => Ok(EntityType::Payout),
            "invoice" => Ok(EntityType::Invoice),
            "payment_session" => Ok(EntityType::PaymentSession),
            other => Err(OrchestratorError::StorageError(format!(
                "Invalid entity type: {other}"
            ))),
        }
    }
}

/// Durable record of which provider owns an entity
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProviderMapping {
    pub entity_id: String,
    pub entity_type: EntityType,
    pub provider_name: String,
    /// The provider's own identifier for the entity
    pub provider_entity_id: String,
    pub created_at: i64,
}

/// Normalized status of a payment across providers
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Processing,
    RequiresAction,
    RequiresCapture,
    #[serde(alias = "succeeded")]
    Success,
    Failed,
    Canceled,
    Refunded,
}

impl PaymentStatus {
    /// Statuses from which the payment can still settle either way
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Pending
                | PaymentStatus::Processing
                | PaymentStatus::RequiresAction
                | PaymentStatus::RequiresCapture
        )
    }

    /// Payment status only moves forward: in flight, then settled, then
    /// refunded. A failed or canceled payment never becomes refunded.
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        if *self == next {
            return true;
        }
        match self {
            _ if self.is_in_flight() => next != PaymentStatus::Refunded,
            PaymentStatus::Success => next == PaymentStatus::Refunded,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Processing => "processing",
            PaymentStatus::RequiresAction => "requires_action",
            PaymentStatus::RequiresCapture => "requires_capture",
            PaymentStatus::Success => "success",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Canceled => "canceled",
            PaymentStatus::Refunded => "refunded",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "processing" => Ok(PaymentStatus::Processing),
            "requires_action" => Ok(PaymentStatus::RequiresAction),
            "requires_capture" => Ok(PaymentStatus::RequiresCapture),
            "success" | "succeeded" => Ok(PaymentStatus::Success),
            "failed" => Ok(PaymentStatus::Failed),
            "canceled" => Ok(PaymentStatus::Canceled),
            "refunded" => Ok(PaymentStatus::Refunded),
            other => Err(OrchestratorError::StorageError(format!(
                "Invalid payment status: {other}"
            ))),
        }
    }
}

/// Status of a refund at the provider
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Pending,
    Succeeded,
    Failed,
}

impl fmt::Display for RefundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefundStatus::Pending => write!(f, "pending"),
            RefundStatus::Succeeded => write!(f, "succeeded"),
            RefundStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for RefundStatus {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RefundStatus::Pending),
            "succeeded" => Ok(RefundStatus::Succeeded),
            "failed" => Ok(RefundStatus::Failed),
            other => Err(OrchestratorError::StorageError(format!(
                "Invalid refund status: {other}"
            ))),
        }
    }
}

/// Further user interaction a payment needs before it can complete
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NextAction {
    RedirectToUrl { url: String },
    UseClientSecret { client_secret: String },
}

/// Uniform charge request sent to whichever provider is selected
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChargeRequest {
    /// Amount in the currency's minor unit
    pub amount: u64,
    /// ISO 4217 currency code
    pub currency: String,
    pub payment_method: String,
    pub customer_id: String,
    pub description: Option<String>,
    /// Caller supplied key deduplicating retried requests
    pub idempotency_key: Option<String>,
    /// Authorize only; capture later with `capture_payment`
    #[serde(default)]
    pub manual_capture: bool,
    /// Provider to prefer over currency routing
    pub preferred_provider: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ChargeRequest {
    pub fn new(amount: u64, currency: &str, payment_method: &str, customer_id: &str) -> Self {
        Self {
            amount,
            currency: currency.to_string(),
            payment_method: payment_method.to_string(),
            customer_id: customer_id.to_string(),
            description: None,
            idempotency_key: None,
            manual_capture: false,
            preferred_provider: None,
            metadata: HashMap::new(),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), OrchestratorError> {
        if self.amount == 0 {
            return Err(OrchestratorError::Validation(
                "amount must be positive".to_string(),
            ));
        }
        if self.currency.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "currency is required".to_string(),
            ));
        }
        if self.payment_method.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "payment method is required".to_string(),
            ));
        }
        if self.customer_id.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "customer is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Uniform charge response returned by providers
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChargeResponse {
    /// Provider assigned charge identifier
    pub id: String,
    pub status: PaymentStatus,
    pub amount: u64,
    pub currency: String,
    pub captured: bool,
    pub amount_captured: u64,
    pub next_action: Option<NextAction>,
    /// Name of the provider that handled the charge, attached by the orchestrator
    pub provider: String,
    pub failure_message: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RefundRequest {
    /// Local payment identifier
    pub payment_id: String,
    /// Amount in minor units
    pub amount: u64,
    pub reason: Option<String>,
}

/// Refund instruction addressed to the provider that holds the charge
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderRefundRequest {
    pub provider_charge_id: String,
    pub amount: u64,
    pub currency: String,
    pub reason: Option<String>,
    pub idempotency_key: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RefundResponse {
    /// Provider assigned refund identifier
    pub id: String,
    pub provider_charge_id: String,
    pub amount: u64,
    pub currency: String,
    pub status: RefundStatus,
    pub provider: String,
}

/// Locally persisted payment
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Payment {
    /// Local identifier
    pub id: String,
    pub amount: u64,
    pub currency: String,
    pub status: PaymentStatus,
    /// Name of the provider owning the charge
    pub provider: String,
    pub provider_charge_id: String,
    pub customer_id: String,
    pub payment_method: String,
    pub idempotency_key: Option<String>,
    pub description: Option<String>,
    pub amount_captured: u64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Payment {
    /// Applies a status change, rejecting moves that go backwards
    pub fn transition(&mut self, next: PaymentStatus) -> Result<(), OrchestratorError> {
        if !self.status.can_transition_to(next) {
            return Err(OrchestratorError::Validation(format!(
                "payment {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = chrono::Utc::now().timestamp();
        Ok(())
    }

    /// Rebuilds the uniform response from the stored record
    pub fn to_charge_response(&self) -> ChargeResponse {
        ChargeResponse {
            id: self.provider_charge_id.clone(),
            status: self.status,
            amount: self.amount,
            currency: self.currency.clone(),
            captured: self.amount_captured > 0,
            amount_captured: self.amount_captured,
            next_action: None,
            provider: self.provider.clone(),
            failure_message: None,
        }
    }
}

/// Locally persisted refund
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Refund {
    pub id: String,
    pub payment_id: String,
    pub amount: u64,
    pub currency: String,
    pub status: RefundStatus,
    pub provider: String,
    pub provider_refund_id: String,
    pub reason: Option<String>,
    pub created_at: i64,
}

/// Result of `create_charge`
#[derive(Clone, Debug, Serialize)]
pub struct ChargeOutcome {
    pub payment: Payment,
    pub response: ChargeResponse,
    /// True when the result was served from a previous request with the same key
    pub replayed: bool,
}

/// Retry tuning as stored in configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Circuit breaker tuning as stored in configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BreakerSettings {
    pub max_failures: u32,
    pub timeout_ms: u64,
    pub half_open_max: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            max_failures: 5,
            timeout_ms: 30_000,
            half_open_max: 3,
        }
    }
}

/// Configuration for the orchestrator
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Directory for storing data files (e.g., SQLite database)
    pub data_dir: String,
    /// Currency code to preferred provider name
    pub routing: HashMap<String, String>,
    /// Upper bound for a single provider liveness probe
    pub probe_timeout_ms: u64,
    /// Upper bound for the reversing refund issued after a failed local write
    pub compensation_timeout_ms: u64,
    /// Period of the background refresh of in-flight payments, 0 disables it
    #[serde(default)]
    pub status_refresh_interval_secs: u64,
    pub circuit_breaker: BreakerSettings,
    pub charge_retry: RetrySettings,
    pub refund_retry: RetrySettings,
}

impl Config {
    /// Creates the default configuration
    ///
    /// # Arguments
    ///
    /// * `data_dir` - Directory for storing data files
    pub fn default_config(data_dir: String) -> Self {
        Self {
            data_dir,
            routing: default_routing(),
            probe_timeout_ms: 2_000,
            compensation_timeout_ms: 30_000,
            status_refresh_interval_secs: 60,
            circuit_breaker: BreakerSettings::default(),
            charge_retry: RetrySettings {
                max_retries: 5,
                initial_delay_ms: 50,
                max_delay_ms: 5_000,
                multiplier: 2.0,
                jitter: true,
            },
            refund_retry: RetrySettings {
                max_retries: 2,
                initial_delay_ms: 100,
                max_delay_ms: 5_000,
                multiplier: 2.0,
                jitter: true,
            },
        }
    }
}

/// Default currency routing table
pub fn default_routing() -> HashMap<String, String> {
    let mut routing = HashMap::new();
    for currency in ["USD", "EUR", "GBP"] {
        routing.insert(currency.to_string(), "stripe".to_string());
    }
    for currency in ["IDR", "PHP", "VND", "THB", "MYR"] {
        routing.insert(currency.to_string(), "xendit".to_string());
    }
    routing.insert("INR".to_string(), "razorpay".to_string());
    routing
}

/// Request for listing payments
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListPaymentsRequest {
    /// Number of payments to skip
    pub offset: u32,
    /// Maximum number of payments to return
    pub limit: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_payment(status: PaymentStatus) -> Payment {
        Payment {
            id: "pay_1".to_string(),
            amount: 2500,
            currency: "USD".to_string(),
            status,
            provider: "stripe".to_string(),
            provider_charge_id: "ch_1".to_string(),
            customer_id: "cus_1".to_string(),
            payment_method: "pm_card".to_string(),
            idempotency_key: None,
            description: None,
            amount_captured: 2500,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn test_status_transitions() {
        assert!(PaymentStatus::Pending.can_transition_to(PaymentStatus::Success));
        assert!(PaymentStatus::Pending.can_transition_to(PaymentStatus::Failed));
        assert!(PaymentStatus::Success.can_transition_to(PaymentStatus::Refunded));
        assert!(!PaymentStatus::Failed.can_transition_to(PaymentStatus::Refunded));
        assert!(!PaymentStatus::Pending.can_transition_to(PaymentStatus::Refunded));
        assert!(!PaymentStatus::Refunded.can_transition_to(PaymentStatus::Success));
    }

    #[test]
    fn test_failed_payment_cannot_be_refunded() {
        let mut payment = test_payment(PaymentStatus::Failed);
        assert!(payment.transition(PaymentStatus::Refunded).is_err());
        assert_eq!(payment.status, PaymentStatus::Failed);

        let mut payment = test_payment(PaymentStatus::Success);
        payment.transition(PaymentStatus::Refunded).unwrap();
        assert_eq!(payment.status, PaymentStatus::Refunded);
    }

    #[test]
    fn test_status_parses_succeeded_alias() {
        assert_eq!(
            "succeeded".parse::<PaymentStatus>().unwrap(),
            PaymentStatus::Success
        );
        let parsed: PaymentStatus = serde_json::from_str("\"succeeded\"").unwrap();
        assert_eq!(parsed, PaymentStatus::Success);
        assert!("bogus".parse::<PaymentStatus>().is_err());
    }

    #[test]
    fn test_charge_request_validation() {
        assert!(ChargeRequest::new(2500, "USD", "pm_card", "cus_1")
            .validate()
            .is_ok());
        assert!(ChargeRequest::new(0, "USD", "pm_card", "cus_1")
            .validate()
            .is_err());
        assert!(ChargeRequest::new(100, "", "pm_card", "cus_1")
            .validate()
            .is_err());
        assert!(ChargeRequest::new(100, "USD", " ", "cus_1")
            .validate()
            .is_err());
        assert!(ChargeRequest::new(100, "USD", "pm_card", "")
            .validate()
            .is_err());
    }

    #[test]
    fn test_default_routing_table() {
        let routing = default_routing();
        assert_eq!(routing.get("USD").map(String::as_str), Some("stripe"));
        assert_eq!(routing.get("IDR").map(String::as_str), Some("xendit"));
        assert_eq!(routing.get("INR").map(String::as_str), Some("razorpay"));
        assert!(routing.get("JPY").is_none());
    }
}
