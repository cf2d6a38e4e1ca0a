use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Incomplete,
    Trialing,
    Active,
    PastDue,
    Canceled,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub customer_id: String,
    pub plan_id: String,
    /// Used to route the subscription when no provider is preferred
    pub currency: String,
    pub trial_days: Option<u32>,
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UpdateSubscriptionRequest {
    pub plan_id: Option<String>,
    pub quantity: Option<u32>,
    pub metadata: Option<HashMap<String, String>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Subscription {
    /// Provider assigned identifier
    pub id: String,
    pub customer_id: String,
    pub plan_id: String,
    pub status: SubscriptionStatus,
    pub quantity: u32,
    pub current_period_end: i64,
    pub cancel_at_period_end: bool,
    pub provider: String,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Day,
    Week,
    Month,
    Year,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreatePlanRequest {
    pub name: String,
    pub amount: u64,
    pub currency: String,
    pub interval: BillingInterval,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub amount: u64,
    pub currency: String,
    pub interval: BillingInterval,
    pub provider: String,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DisputeStatus {
    NeedsResponse,
    UnderReview,
    Won,
    Lost,
    Closed,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DisputeEvidence {
    pub explanation: Option<String>,
    pub tracking_number: Option<String>,
    pub documents: Vec<String>,
    /// Submit the evidence for review instead of saving a draft
    pub submit: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Dispute {
    pub id: String,
    pub provider_charge_id: String,
    pub customer_id: String,
    pub amount: u64,
    pub currency: String,
    pub reason: String,
    pub status: DisputeStatus,
    pub provider: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateCustomerRequest {
    pub email: String,
    pub name: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UpdateCustomerRequest {
    pub email: Option<String>,
    pub name: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub provider: String,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Open,
    Paid,
    Void,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateInvoiceRequest {
    pub customer_id: String,
    pub amount: u64,
    pub currency: String,
    pub description: Option<String>,
    pub due_days: Option<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub customer_id: String,
    pub amount: u64,
    pub currency: String,
    pub status: InvoiceStatus,
    pub hosted_url: Option<String>,
    pub provider: String,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Pending,
    InTransit,
    Paid,
    Failed,
    Canceled,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreatePayoutRequest {
    /// Recipient reference, used for fan-out listing
    pub customer_id: String,
    pub amount: u64,
    pub currency: String,
    pub destination: String,
    pub idempotency_key: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Payout {
    pub id: String,
    pub customer_id: String,
    pub amount: u64,
    pub currency: String,
    pub destination: String,
    pub status: PayoutStatus,
    pub provider: String,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentSessionStatus {
    Open,
    Complete,
    Expired,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreatePaymentSessionRequest {
    pub customer_id: String,
    pub amount: u64,
    pub currency: String,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentSession {
    pub id: String,
    pub customer_id: String,
    pub amount: u64,
    pub currency: String,
    pub url: String,
    pub status: PaymentSessionStatus,
    pub provider: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredPaymentMethod {
    pub id: String,
    pub customer_id: String,
    pub method_type: String,
    pub last4: Option<String>,
    pub provider: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BalanceAmount {
    pub currency: String,
    pub available: u64,
    pub pending: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Balance {
    pub amounts: Vec<BalanceAmount>,
    pub provider: String,
}
