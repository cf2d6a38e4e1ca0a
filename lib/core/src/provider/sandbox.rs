use async_trait::async_trait;
use log::debug;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use super::types::*;
use super::{
    BalanceProvider, Capability, CaptureProvider, InvoiceProvider, PaymentMethodProvider,
    PaymentProvider, PaymentSessionProvider, PayoutProvider, ProviderCapabilities, ProviderEntry,
};
use crate::error::{ProviderError, ProviderErrorKind};
use crate::models::{
    ChargeRequest, ChargeResponse, NextAction, PaymentStatus, ProviderRefundRequest,
    RefundResponse, RefundStatus,
};

/// Payment method that the sandbox always declines
pub const DECLINED_PAYMENT_METHOD: &str = "pm_card_declined";
/// Payment method that the sandbox answers with a 3DS redirect
pub const THREE_DS_PAYMENT_METHOD: &str = "pm_card_3ds_required";

struct SandboxCharge {
    response: ChargeResponse,
    customer_id: String,
    refunded: u64,
}

#[derive(Default)]
struct SandboxState {
    charges: HashMap<String, SandboxCharge>,
    charges_by_key: HashMap<String, String>,
    refunds: HashMap<String, RefundResponse>,
    subscriptions: HashMap<String, Subscription>,
    plans: HashMap<String, Plan>,
    disputes: HashMap<String, Dispute>,
    customers: HashMap<String, Customer>,
    invoices: HashMap<String, Invoice>,
    payouts: HashMap<String, Payout>,
    sessions: HashMap<String, PaymentSession>,
    payment_methods: HashMap<String, StoredPaymentMethod>,
    injected_failures: HashMap<String, VecDeque<ProviderError>>,
    calls: HashMap<String, u32>,
    charge_latency: Duration,
    refund_latency: Duration,
    probe_delay: Duration,
    /// Status reported for accepted refunds, `Succeeded` when unset
    refund_status: Option<RefundStatus>,
}

/// In-process provider with deterministic behaviour and fault injection
///
/// Backs the CLI and the test suites. Behaviour:
/// * [DECLINED_PAYMENT_METHOD] yields a failed charge
/// * [THREE_DS_PAYMENT_METHOD] yields `requires_action` with a redirect
/// * manual capture requests yield `requires_capture` when the capability is declared
pub struct SandboxProvider {
    name: String,
    capabilities: ProviderCapabilities,
    available: AtomicBool,
    state: Mutex<SandboxState>,
}

impl SandboxProvider {
    pub fn new(name: &str, capabilities: ProviderCapabilities) -> Self {
        Self {
            name: name.to_string(),
            capabilities,
            available: AtomicBool::new(true),
            state: Mutex::new(SandboxState::default()),
        }
    }

    /// Sandbox declaring every optional capability
    pub fn full_featured<I, S>(name: &str, currencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let capabilities = ProviderCapabilities::new(currencies)
            .with(Capability::Invoices)
            .with(Capability::Payouts)
            .with(Capability::PaymentSessions)
            .with(Capability::ThreeDSecure)
            .with(Capability::ManualCapture)
            .with(Capability::Balance)
            .with(Capability::PaymentMethods)
            .with_payment_method_types(["card", "ewallet", "bank_transfer"]);
        Self::new(name, capabilities)
    }

    /// Registry entry exposing every optional capability this sandbox implements
    pub fn entry(self: &Arc<Self>) -> ProviderEntry {
        ProviderEntry::builder(self.clone())
            .invoices()
            .payouts()
            .payment_sessions()
            .payment_methods()
            .balance()
            .capture()
            .build()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Queues an error returned by the next call of `operation`
    pub fn fail_next(&self, operation: &str, error: ProviderError) {
        self.lock()
            .injected_failures
            .entry(operation.to_string())
            .or_default()
            .push_back(error);
    }

    pub fn set_charge_latency(&self, latency: Duration) {
        self.lock().charge_latency = latency;
    }

    pub fn set_refund_latency(&self, latency: Duration) {
        self.lock().refund_latency = latency;
    }

    pub fn set_probe_delay(&self, delay: Duration) {
        self.lock().probe_delay = delay;
    }

    /// Makes accepted refunds report `status`; a failed refund moves no money
    pub fn set_refund_status(&self, status: RefundStatus) {
        self.lock().refund_status = Some(status);
    }

    /// Number of times `operation` was invoked
    pub fn call_count(&self, operation: &str) -> u32 {
        self.lock().calls.get(operation).copied().unwrap_or(0)
    }

    /// Amount refunded so far against a charge
    pub fn refunded_amount(&self, provider_charge_id: &str) -> u64 {
        self.lock()
            .charges
            .get(provider_charge_id)
            .map(|charge| charge.refunded)
            .unwrap_or(0)
    }

    /// Simulates a cardholder opening a dispute against a charge
    pub fn open_dispute(&self, provider_charge_id: &str, reason: &str) -> Result<Dispute, ProviderError> {
        let mut state = self.lock();
        let charge = state
            .charges
            .get(provider_charge_id)
            .ok_or_else(|| ProviderError::not_found(format!("charge {provider_charge_id}")))?;
        let dispute = Dispute {
            id: self.new_id("dp"),
            provider_charge_id: provider_charge_id.to_string(),
            customer_id: charge.customer_id.clone(),
            amount: charge.response.amount_captured,
            currency: charge.response.currency.clone(),
            reason: reason.to_string(),
            status: DisputeStatus::NeedsResponse,
            provider: self.name.clone(),
        };
        state.disputes.insert(dispute.id.clone(), dispute.clone());
        Ok(dispute)
    }

    fn lock(&self) -> MutexGuard<'_, SandboxState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn new_id(&self, prefix: &str) -> String {
        format!("{prefix}_{}_{}", self.name, Uuid::new_v4().simple())
    }

    /// Records the call and applies injected faults
    fn enter(&self, operation: &str) -> Result<MutexGuard<'_, SandboxState>, ProviderError> {
        let mut state = self.lock();
        *state.calls.entry(operation.to_string()).or_default() += 1;
        if let Some(error) = state
            .injected_failures
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
        {
            debug!("{}: injected failure for {operation}: {error}", self.name);
            return Err(error);
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(ProviderError::unavailable(format!("{} is down", self.name)));
        }
        Ok(state)
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn missing(kind: &str, id: &str) -> ProviderError {
    ProviderError::not_found(format!("{kind} {id} not found"))
}

#[async_trait]
impl PaymentProvider for SandboxProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &ProviderCapabilities {
        &self.capabilities
    }

    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeResponse, ProviderError> {
        let latency = self.lock().charge_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.enter("charge")?;
        if let Some(existing) = request
            .idempotency_key
            .as_ref()
            .and_then(|key| state.charges_by_key.get(key))
            .and_then(|id| state.charges.get(id))
        {
            return Ok(existing.response.clone());
        }
        if !self.capabilities.supports_currency(&request.currency) {
            return Err(ProviderError::invalid_request(format!(
                "currency {} is not supported by {}",
                request.currency, self.name
            )));
        }

        let id = self.new_id("ch");
        let mut response = ChargeResponse {
            id: id.clone(),
            status: PaymentStatus::Success,
            amount: request.amount,
            currency: request.currency.to_uppercase(),
            captured: true,
            amount_captured: request.amount,
            next_action: None,
            provider: self.name.clone(),
            failure_message: None,
        };
        match request.payment_method.as_str() {
            DECLINED_PAYMENT_METHOD => {
                response.status = PaymentStatus::Failed;
                response.captured = false;
                response.amount_captured = 0;
                response.failure_message = Some("card declined".to_string());
            }
            THREE_DS_PAYMENT_METHOD if self.capabilities.three_d_secure => {
                response.status = PaymentStatus::RequiresAction;
                response.captured = false;
                response.amount_captured = 0;
                response.next_action = Some(NextAction::RedirectToUrl {
                    url: format!("https://sandbox.{}.test/3ds/{id}", self.name),
                });
            }
            _ if request.manual_capture && self.capabilities.manual_capture => {
                response.status = PaymentStatus::RequiresCapture;
                response.captured = false;
                response.amount_captured = 0;
            }
            _ => {}
        }

        if let Some(key) = &request.idempotency_key {
            state.charges_by_key.insert(key.clone(), id.clone());
        }
        state.charges.insert(
            id,
            SandboxCharge {
                response: response.clone(),
                customer_id: request.customer_id.clone(),
                refunded: 0,
            },
        );
        Ok(response)
    }

    async fn refund(
        &self,
        request: &ProviderRefundRequest,
    ) -> Result<RefundResponse, ProviderError> {
        let latency = self.lock().refund_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.enter("refund")?;
        let refund_id = self.new_id("re");
        let status = state.refund_status.unwrap_or(RefundStatus::Succeeded);
        let charge = state
            .charges
            .get_mut(&request.provider_charge_id)
            .ok_or_else(|| missing("charge", &request.provider_charge_id))?;
        if !matches!(
            charge.response.status,
            PaymentStatus::Success | PaymentStatus::Refunded
        ) {
            return Err(ProviderError::invalid_request(format!(
                "charge {} is {}",
                request.provider_charge_id, charge.response.status
            )));
        }
        let refundable = charge.response.amount_captured - charge.refunded;
        if request.amount == 0 || request.amount > refundable {
            return Err(ProviderError::invalid_request(format!(
                "refund of {} exceeds refundable {refundable}",
                request.amount
            )));
        }
        if status != RefundStatus::Failed {
            charge.refunded += request.amount;
        }
        if charge.refunded == charge.response.amount_captured {
            charge.response.status = PaymentStatus::Refunded;
        }

        let refund = RefundResponse {
            id: refund_id,
            provider_charge_id: request.provider_charge_id.clone(),
            amount: request.amount,
            currency: charge.response.currency.clone(),
            status,
            provider: self.name.clone(),
        };
        state.refunds.insert(refund.id.clone(), refund.clone());
        Ok(refund)
    }

    async fn get_charge(&self, provider_charge_id: &str) -> Result<ChargeResponse, ProviderError> {
        let state = self.enter("get_charge")?;
        state
            .charges
            .get(provider_charge_id)
            .map(|charge| charge.response.clone())
            .ok_or_else(|| missing("charge", provider_charge_id))
    }

    async fn create_subscription(
        &self,
        request: &CreateSubscriptionRequest,
    ) -> Result<Subscription, ProviderError> {
        let mut state = self.enter("create_subscription")?;
        let trialing = request.trial_days.unwrap_or(0) > 0;
        let subscription = Subscription {
            id: self.new_id("sub"),
            customer_id: request.customer_id.clone(),
            plan_id: request.plan_id.clone(),
            status: if trialing {
                SubscriptionStatus::Trialing
            } else {
                SubscriptionStatus::Active
            },
            quantity: 1,
            current_period_end: now() + 30 * 24 * 3600,
            cancel_at_period_end: false,
            provider: self.name.clone(),
        };
        state
            .subscriptions
            .insert(subscription.id.clone(), subscription.clone());
        Ok(subscription)
    }

    async fn update_subscription(
        &self,
        subscription_id: &str,
        request: &UpdateSubscriptionRequest,
    ) -> Result<Subscription, ProviderError> {
        let mut state = self.enter("update_subscription")?;
        let subscription = state
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| missing("subscription", subscription_id))?;
        if subscription.status == SubscriptionStatus::Canceled {
            return Err(ProviderError::invalid_request("subscription is canceled"));
        }
        if let Some(plan_id) = &request.plan_id {
            subscription.plan_id = plan_id.clone();
        }
        if let Some(quantity) = request.quantity {
            subscription.quantity = quantity;
        }
        Ok(subscription.clone())
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        at_period_end: bool,
    ) -> Result<Subscription, ProviderError> {
        let mut state = self.enter("cancel_subscription")?;
        let subscription = state
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| missing("subscription", subscription_id))?;
        if at_period_end {
            subscription.cancel_at_period_end = true;
        } else {
            subscription.status = SubscriptionStatus::Canceled;
        }
        Ok(subscription.clone())
    }

    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Subscription, ProviderError> {
        let state = self.enter("get_subscription")?;
        state
            .subscriptions
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| missing("subscription", subscription_id))
    }

    async fn list_subscriptions(
        &self,
        customer_id: &str,
    ) -> Result<Vec<Subscription>, ProviderError> {
        let state = self.enter("list_subscriptions")?;
        Ok(state
            .subscriptions
            .values()
            .filter(|s| s.customer_id == customer_id)
            .cloned()
            .collect())
    }

    async fn create_plan(&self, request: &CreatePlanRequest) -> Result<Plan, ProviderError> {
        let mut state = self.enter("create_plan")?;
        if request.amount == 0 {
            return Err(ProviderError::invalid_request("plan amount must be positive"));
        }
        let plan = Plan {
            id: self.new_id("plan"),
            name: request.name.clone(),
            amount: request.amount,
            currency: request.currency.to_uppercase(),
            interval: request.interval,
            provider: self.name.clone(),
        };
        state.plans.insert(plan.id.clone(), plan.clone());
        Ok(plan)
    }

    async fn get_plan(&self, plan_id: &str) -> Result<Plan, ProviderError> {
        let state = self.enter("get_plan")?;
        state
            .plans
            .get(plan_id)
            .cloned()
            .ok_or_else(|| missing("plan", plan_id))
    }

    async fn list_plans(&self) -> Result<Vec<Plan>, ProviderError> {
        let state = self.enter("list_plans")?;
        Ok(state.plans.values().cloned().collect())
    }

    async fn delete_plan(&self, plan_id: &str) -> Result<(), ProviderError> {
        let mut state = self.enter("delete_plan")?;
        state
            .plans
            .remove(plan_id)
            .map(|_| ())
            .ok_or_else(|| missing("plan", plan_id))
    }

    async fn get_dispute(&self, dispute_id: &str) -> Result<Dispute, ProviderError> {
        let state = self.enter("get_dispute")?;
        state
            .disputes
            .get(dispute_id)
            .cloned()
            .ok_or_else(|| missing("dispute", dispute_id))
    }

    async fn list_disputes(&self, customer_id: &str) -> Result<Vec<Dispute>, ProviderError> {
        let state = self.enter("list_disputes")?;
        Ok(state
            .disputes
            .values()
            .filter(|d| d.customer_id == customer_id)
            .cloned()
            .collect())
    }

    async fn update_dispute(
        &self,
        dispute_id: &str,
        evidence: &DisputeEvidence,
    ) -> Result<Dispute, ProviderError> {
        let mut state = self.enter("update_dispute")?;
        let dispute = state
            .disputes
            .get_mut(dispute_id)
            .ok_or_else(|| missing("dispute", dispute_id))?;
        if dispute.status != DisputeStatus::NeedsResponse {
            return Err(ProviderError::invalid_request(format!(
                "dispute {dispute_id} no longer accepts evidence"
            )));
        }
        if evidence.submit {
            dispute.status = DisputeStatus::UnderReview;
        }
        Ok(dispute.clone())
    }

    async fn close_dispute(&self, dispute_id: &str) -> Result<Dispute, ProviderError> {
        let mut state = self.enter("close_dispute")?;
        let dispute = state
            .disputes
            .get_mut(dispute_id)
            .ok_or_else(|| missing("dispute", dispute_id))?;
        dispute.status = DisputeStatus::Lost;
        Ok(dispute.clone())
    }

    async fn create_customer(
        &self,
        request: &CreateCustomerRequest,
    ) -> Result<Customer, ProviderError> {
        let mut state = self.enter("create_customer")?;
        if request.email.trim().is_empty() {
            return Err(ProviderError::invalid_request("email is required"));
        }
        let customer = Customer {
            id: self.new_id("cus"),
            email: request.email.clone(),
            name: request.name.clone(),
            provider: self.name.clone(),
        };
        state.customers.insert(customer.id.clone(), customer.clone());
        Ok(customer)
    }

    async fn get_customer(&self, customer_id: &str) -> Result<Customer, ProviderError> {
        let state = self.enter("get_customer")?;
        state
            .customers
            .get(customer_id)
            .cloned()
            .ok_or_else(|| missing("customer", customer_id))
    }

    async fn update_customer(
        &self,
        customer_id: &str,
        request: &UpdateCustomerRequest,
    ) -> Result<Customer, ProviderError> {
        let mut state = self.enter("update_customer")?;
        let customer = state
            .customers
            .get_mut(customer_id)
            .ok_or_else(|| missing("customer", customer_id))?;
        if let Some(email) = &request.email {
            customer.email = email.clone();
        }
        if let Some(name) = &request.name {
            customer.name = Some(name.clone());
        }
        Ok(customer.clone())
    }

    async fn delete_customer(&self, customer_id: &str) -> Result<(), ProviderError> {
        let mut state = self.enter("delete_customer")?;
        state
            .customers
            .remove(customer_id)
            .map(|_| ())
            .ok_or_else(|| missing("customer", customer_id))
    }

    async fn is_available(&self) -> bool {
        let delay = self.lock().probe_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.available.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InvoiceProvider for SandboxProvider {
    async fn create_invoice(
        &self,
        request: &CreateInvoiceRequest,
    ) -> Result<Invoice, ProviderError> {
        let mut state = self.enter("create_invoice")?;
        let invoice = Invoice {
            id: self.new_id("in"),
            customer_id: request.customer_id.clone(),
            amount: request.amount,
            currency: request.currency.to_uppercase(),
            status: InvoiceStatus::Draft,
            hosted_url: None,
            provider: self.name.clone(),
        };
        state.invoices.insert(invoice.id.clone(), invoice.clone());
        Ok(invoice)
    }

    async fn get_invoice(&self, invoice_id: &str) -> Result<Invoice, ProviderError> {
        let state = self.enter("get_invoice")?;
        state
            .invoices
            .get(invoice_id)
            .cloned()
            .ok_or_else(|| missing("invoice", invoice_id))
    }

    async fn finalize_invoice(&self, invoice_id: &str) -> Result<Invoice, ProviderError> {
        let mut state = self.enter("finalize_invoice")?;
        let invoice = state
            .invoices
            .get_mut(invoice_id)
            .ok_or_else(|| missing("invoice", invoice_id))?;
        if invoice.status != InvoiceStatus::Draft {
            return Err(ProviderError::invalid_request("only draft invoices can be finalized"));
        }
        invoice.status = InvoiceStatus::Open;
        invoice.hosted_url = Some(format!("https://sandbox.{}.test/invoices/{invoice_id}", self.name));
        Ok(invoice.clone())
    }

    async fn void_invoice(&self, invoice_id: &str) -> Result<Invoice, ProviderError> {
        let mut state = self.enter("void_invoice")?;
        let invoice = state
            .invoices
            .get_mut(invoice_id)
            .ok_or_else(|| missing("invoice", invoice_id))?;
        if invoice.status == InvoiceStatus::Paid {
            return Err(ProviderError::invalid_request("paid invoices cannot be voided"));
        }
        invoice.status = InvoiceStatus::Void;
        Ok(invoice.clone())
    }

    async fn list_invoices(&self, customer_id: &str) -> Result<Vec<Invoice>, ProviderError> {
        let state = self.enter("list_invoices")?;
        Ok(state
            .invoices
            .values()
            .filter(|i| i.customer_id == customer_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PayoutProvider for SandboxProvider {
    async fn create_payout(&self, request: &CreatePayoutRequest) -> Result<Payout, ProviderError> {
        let mut state = self.enter("create_payout")?;
        if request.amount == 0 {
            return Err(ProviderError::invalid_request("payout amount must be positive"));
        }
        let payout = Payout {
            id: self.new_id("po"),
            customer_id: request.customer_id.clone(),
            amount: request.amount,
            currency: request.currency.to_uppercase(),
            destination: request.destination.clone(),
            status: PayoutStatus::Pending,
            provider: self.name.clone(),
        };
        state.payouts.insert(payout.id.clone(), payout.clone());
        Ok(payout)
    }

    async fn get_payout(&self, payout_id: &str) -> Result<Payout, ProviderError> {
        let state = self.enter("get_payout")?;
        state
            .payouts
            .get(payout_id)
            .cloned()
            .ok_or_else(|| missing("payout", payout_id))
    }

    async fn cancel_payout(&self, payout_id: &str) -> Result<Payout, ProviderError> {
        let mut state = self.enter("cancel_payout")?;
        let payout = state
            .payouts
            .get_mut(payout_id)
            .ok_or_else(|| missing("payout", payout_id))?;
        if payout.status != PayoutStatus::Pending {
            return Err(ProviderError::invalid_request("only pending payouts can be canceled"));
        }
        payout.status = PayoutStatus::Canceled;
        Ok(payout.clone())
    }

    async fn list_payouts(&self, customer_id: &str) -> Result<Vec<Payout>, ProviderError> {
        let state = self.enter("list_payouts")?;
        Ok(state
            .payouts
            .values()
            .filter(|p| p.customer_id == customer_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PaymentSessionProvider for SandboxProvider {
    async fn create_payment_session(
        &self,
        request: &CreatePaymentSessionRequest,
    ) -> Result<PaymentSession, ProviderError> {
        let mut state = self.enter("create_payment_session")?;
        let id = self.new_id("cs");
        let session = PaymentSession {
            url: format!("https://sandbox.{}.test/checkout/{id}", self.name),
            id,
            customer_id: request.customer_id.clone(),
            amount: request.amount,
            currency: request.currency.to_uppercase(),
            status: PaymentSessionStatus::Open,
            provider: self.name.clone(),
        };
        state.sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn get_payment_session(
        &self,
        session_id: &str,
    ) -> Result<PaymentSession, ProviderError> {
        let state = self.enter("get_payment_session")?;
        state
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| missing("payment session", session_id))
    }

    async fn expire_payment_session(
        &self,
        session_id: &str,
    ) -> Result<PaymentSession, ProviderError> {
        let mut state = self.enter("expire_payment_session")?;
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| missing("payment session", session_id))?;
        if session.status != PaymentSessionStatus::Open {
            return Err(ProviderError::invalid_request("session is not open"));
        }
        session.status = PaymentSessionStatus::Expired;
        Ok(session.clone())
    }

    async fn list_payment_sessions(
        &self,
        customer_id: &str,
    ) -> Result<Vec<PaymentSession>, ProviderError> {
        let state = self.enter("list_payment_sessions")?;
        Ok(state
            .sessions
            .values()
            .filter(|s| s.customer_id == customer_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PaymentMethodProvider for SandboxProvider {
    async fn attach_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> Result<StoredPaymentMethod, ProviderError> {
        let mut state = self.enter("attach_payment_method")?;
        let method = StoredPaymentMethod {
            id: payment_method_id.to_string(),
            customer_id: customer_id.to_string(),
            method_type: "card".to_string(),
            last4: Some("4242".to_string()),
            provider: self.name.clone(),
        };
        state
            .payment_methods
            .insert(method.id.clone(), method.clone());
        Ok(method)
    }

    async fn detach_payment_method(&self, payment_method_id: &str) -> Result<(), ProviderError> {
        let mut state = self.enter("detach_payment_method")?;
        state
            .payment_methods
            .remove(payment_method_id)
            .map(|_| ())
            .ok_or_else(|| missing("payment method", payment_method_id))
    }

    async fn list_payment_methods(
        &self,
        customer_id: &str,
    ) -> Result<Vec<StoredPaymentMethod>, ProviderError> {
        let state = self.enter("list_payment_methods")?;
        Ok(state
            .payment_methods
            .values()
            .filter(|m| m.customer_id == customer_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl BalanceProvider for SandboxProvider {
    async fn get_balance(&self) -> Result<Balance, ProviderError> {
        let state = self.enter("get_balance")?;
        let mut totals: HashMap<String, BalanceAmount> = HashMap::new();
        for charge in state.charges.values() {
            let amount = totals
                .entry(charge.response.currency.clone())
                .or_insert_with(|| BalanceAmount {
                    currency: charge.response.currency.clone(),
                    available: 0,
                    pending: 0,
                });
            if charge.response.captured {
                amount.available += charge.response.amount_captured - charge.refunded;
            } else if charge.response.status == PaymentStatus::RequiresCapture {
                amount.pending += charge.response.amount;
            }
        }
        let mut amounts: Vec<BalanceAmount> = totals.into_values().collect();
        amounts.sort_by(|a, b| a.currency.cmp(&b.currency));
        Ok(Balance {
            amounts,
            provider: self.name.clone(),
        })
    }
}

#[async_trait]
impl CaptureProvider for SandboxProvider {
    async fn capture(
        &self,
        provider_charge_id: &str,
        amount: Option<u64>,
    ) -> Result<ChargeResponse, ProviderError> {
        let mut state = self.enter("capture")?;
        let charge = state
            .charges
            .get_mut(provider_charge_id)
            .ok_or_else(|| missing("charge", provider_charge_id))?;
        if charge.response.status != PaymentStatus::RequiresCapture {
            return Err(ProviderError::invalid_request(format!(
                "charge {provider_charge_id} is {}",
                charge.response.status
            )));
        }
        let amount = amount.unwrap_or(charge.response.amount);
        if amount == 0 || amount > charge.response.amount {
            return Err(ProviderError::new(
                ProviderErrorKind::InvalidRequest,
                format!("capture of {amount} exceeds authorized {}", charge.response.amount),
            ));
        }
        charge.response.status = PaymentStatus::Success;
        charge.response.captured = true;
        charge.response.amount_captured = amount;
        Ok(charge.response.clone())
    }

    async fn void(&self, provider_charge_id: &str) -> Result<ChargeResponse, ProviderError> {
        let mut state = self.enter("void")?;
        let charge = state
            .charges
            .get_mut(provider_charge_id)
            .ok_or_else(|| missing("charge", provider_charge_id))?;
        if !matches!(
            charge.response.status,
            PaymentStatus::RequiresCapture | PaymentStatus::RequiresAction
        ) {
            return Err(ProviderError::invalid_request(format!(
                "charge {provider_charge_id} is {}",
                charge.response.status
            )));
        }
        charge.response.status = PaymentStatus::Canceled;
        charge.response.next_action = None;
        Ok(charge.response.clone())
    }
}
