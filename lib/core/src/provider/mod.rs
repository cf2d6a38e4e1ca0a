pub mod capabilities;
pub mod sandbox;
pub mod types;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::error::{OrchestratorError, ProviderError};
use crate::models::{ChargeRequest, ChargeResponse, ProviderRefundRequest, RefundResponse};
use crate::webhook::WebhookVerifier;
pub use capabilities::{Capability, ProviderCapabilities};
use types::*;

/// Operation contract every payment provider implements
///
/// Optional features live in the separate capability traits below and are
/// registered per provider through [ProviderEntry].
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Canonical provider name, e.g. "stripe"
    fn name(&self) -> &str;

    fn capabilities(&self) -> &ProviderCapabilities;

    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeResponse, ProviderError>;

    async fn refund(&self, request: &ProviderRefundRequest)
        -> Result<RefundResponse, ProviderError>;

    /// Fetches the current state of a charge
    async fn get_charge(&self, provider_charge_id: &str) -> Result<ChargeResponse, ProviderError>;

    async fn create_subscription(
        &self,
        request: &CreateSubscriptionRequest,
    ) -> Result<Subscription, ProviderError>;

    async fn update_subscription(
        &self,
        subscription_id: &str,
        request: &UpdateSubscriptionRequest,
    ) -> Result<Subscription, ProviderError>;

    /// If `at_period_end` is true the subscription stays active until the period ends
    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        at_period_end: bool,
    ) -> Result<Subscription, ProviderError>;

    async fn get_subscription(&self, subscription_id: &str)
        -> Result<Subscription, ProviderError>;

    async fn list_subscriptions(&self, customer_id: &str)
        -> Result<Vec<Subscription>, ProviderError>;

    async fn create_plan(&self, request: &CreatePlanRequest) -> Result<Plan, ProviderError>;

    async fn get_plan(&self, plan_id: &str) -> Result<Plan, ProviderError>;

    async fn list_plans(&self) -> Result<Vec<Plan>, ProviderError>;

    async fn delete_plan(&self, plan_id: &str) -> Result<(), ProviderError>;

    async fn get_dispute(&self, dispute_id: &str) -> Result<Dispute, ProviderError>;

    async fn list_disputes(&self, customer_id: &str) -> Result<Vec<Dispute>, ProviderError>;

    async fn update_dispute(
        &self,
        dispute_id: &str,
        evidence: &DisputeEvidence,
    ) -> Result<Dispute, ProviderError>;

    /// Accepts the dispute, conceding the disputed amount
    async fn close_dispute(&self, dispute_id: &str) -> Result<Dispute, ProviderError>;

    async fn create_customer(&self, request: &CreateCustomerRequest)
        -> Result<Customer, ProviderError>;

    async fn get_customer(&self, customer_id: &str) -> Result<Customer, ProviderError>;

    async fn update_customer(
        &self,
        customer_id: &str,
        request: &UpdateCustomerRequest,
    ) -> Result<Customer, ProviderError>;

    async fn delete_customer(&self, customer_id: &str) -> Result<(), ProviderError>;

    /// Lightweight liveness check. Callers bound it with a short timeout.
    async fn is_available(&self) -> bool;
}

#[async_trait]
pub trait InvoiceProvider: Send + Sync {
    async fn create_invoice(&self, request: &CreateInvoiceRequest)
        -> Result<Invoice, ProviderError>;
    async fn get_invoice(&self, invoice_id: &str) -> Result<Invoice, ProviderError>;
    async fn finalize_invoice(&self, invoice_id: &str) -> Result<Invoice, ProviderError>;
    async fn void_invoice(&self, invoice_id: &str) -> Result<Invoice, ProviderError>;
    async fn list_invoices(&self, customer_id: &str) -> Result<Vec<Invoice>, ProviderError>;
}

#[async_trait]
pub trait PayoutProvider: Send + Sync {
    async fn create_payout(&self, request: &CreatePayoutRequest) -> Result<Payout, ProviderError>;
    async fn get_payout(&self, payout_id: &str) -> Result<Payout, ProviderError>;
    async fn cancel_payout(&self, payout_id: &str) -> Result<Payout, ProviderError>;
    async fn list_payouts(&self, customer_id: &str) -> Result<Vec<Payout>, ProviderError>;
}

#[async_trait]
pub trait PaymentSessionProvider: Send + Sync {
    async fn create_payment_session(
        &self,
        request: &CreatePaymentSessionRequest,
    ) -> Result<PaymentSession, ProviderError>;
    async fn get_payment_session(&self, session_id: &str)
        -> Result<PaymentSession, ProviderError>;
    async fn expire_payment_session(
        &self,
        session_id: &str,
    ) -> Result<PaymentSession, ProviderError>;
    async fn list_payment_sessions(
        &self,
        customer_id: &str,
    ) -> Result<Vec<PaymentSession>, ProviderError>;
}

#[async_trait]
pub trait PaymentMethodProvider: Send + Sync {
    async fn attach_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> Result<StoredPaymentMethod, ProviderError>;
    async fn detach_payment_method(&self, payment_method_id: &str) -> Result<(), ProviderError>;
    async fn list_payment_methods(
        &self,
        customer_id: &str,
    ) -> Result<Vec<StoredPaymentMethod>, ProviderError>;
}

#[async_trait]
pub trait BalanceProvider: Send + Sync {
    async fn get_balance(&self) -> Result<Balance, ProviderError>;
}

/// Manual capture and void of authorized charges
#[async_trait]
pub trait CaptureProvider: Send + Sync {
    /// Captures `amount`, or the full authorized amount when `None`
    async fn capture(
        &self,
        provider_charge_id: &str,
        amount: Option<u64>,
    ) -> Result<ChargeResponse, ProviderError>;
    async fn void(&self, provider_charge_id: &str) -> Result<ChargeResponse, ProviderError>;
}

/// A configured provider together with the optional capabilities it implements
///
/// Optional capabilities are available only when the provider's
/// [ProviderCapabilities] flag is set and an implementation was registered.
#[derive(Clone)]
pub struct ProviderEntry {
    name: String,
    provider: Arc<dyn PaymentProvider>,
    invoices: Option<Arc<dyn InvoiceProvider>>,
    payouts: Option<Arc<dyn PayoutProvider>>,
    payment_sessions: Option<Arc<dyn PaymentSessionProvider>>,
    payment_methods: Option<Arc<dyn PaymentMethodProvider>>,
    balance: Option<Arc<dyn BalanceProvider>>,
    capture: Option<Arc<dyn CaptureProvider>>,
    webhook_verifier: Option<WebhookVerifier>,
}

impl fmt::Debug for ProviderEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderEntry")
            .field("name", &self.name)
            .field("capabilities", self.capabilities())
            .finish()
    }
}

impl ProviderEntry {
    /// Starts registering `provider`; optional capabilities are added on the builder
    pub fn builder<P: PaymentProvider + 'static>(provider: Arc<P>) -> ProviderEntryBuilder<P> {
        let entry = ProviderEntry {
            name: provider.name().to_string(),
            provider: provider.clone(),
            invoices: None,
            payouts: None,
            payment_sessions: None,
            payment_methods: None,
            balance: None,
            capture: None,
            webhook_verifier: None,
        };
        ProviderEntryBuilder { provider, entry }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capabilities(&self) -> &ProviderCapabilities {
        self.provider.capabilities()
    }

    pub fn provider(&self) -> &Arc<dyn PaymentProvider> {
        &self.provider
    }

    /// Whether the capability is both declared and registered
    pub fn supports(&self, capability: Capability) -> bool {
        if !self.capabilities().supports(capability) {
            return false;
        }
        match capability {
            Capability::Invoices => self.invoices.is_some(),
            Capability::Payouts => self.payouts.is_some(),
            Capability::PaymentSessions => self.payment_sessions.is_some(),
            Capability::PaymentMethods => self.payment_methods.is_some(),
            Capability::Balance => self.balance.is_some(),
            Capability::ManualCapture => self.capture.is_some(),
            Capability::ThreeDSecure => true,
        }
    }

    fn optional<'a, T: ?Sized>(
        &self,
        capability: Capability,
        slot: &'a Option<Arc<T>>,
    ) -> Result<&'a Arc<T>, OrchestratorError> {
        match slot {
            Some(implementation) if self.capabilities().supports(capability) => Ok(implementation),
            _ => Err(OrchestratorError::not_supported(
                &self.name,
                &capability.to_string(),
            )),
        }
    }

    pub fn invoices(&self) -> Result<&Arc<dyn InvoiceProvider>, OrchestratorError> {
        self.optional(Capability::Invoices, &self.invoices)
    }

    pub fn payouts(&self) -> Result<&Arc<dyn PayoutProvider>, OrchestratorError> {
        self.optional(Capability::Payouts, &self.payouts)
    }

    pub fn payment_sessions(&self) -> Result<&Arc<dyn PaymentSessionProvider>, OrchestratorError> {
        self.optional(Capability::PaymentSessions, &self.payment_sessions)
    }

    pub fn payment_methods(&self) -> Result<&Arc<dyn PaymentMethodProvider>, OrchestratorError> {
        self.optional(Capability::PaymentMethods, &self.payment_methods)
    }

    pub fn balance(&self) -> Result<&Arc<dyn BalanceProvider>, OrchestratorError> {
        self.optional(Capability::Balance, &self.balance)
    }

    pub fn capture(&self) -> Result<&Arc<dyn CaptureProvider>, OrchestratorError> {
        self.optional(Capability::ManualCapture, &self.capture)
    }

    pub fn webhook_verifier(&self) -> Option<&WebhookVerifier> {
        self.webhook_verifier.as_ref()
    }
}

/// Builder for [ProviderEntry]; each optional capability is only offered when
/// the provider type implements it
pub struct ProviderEntryBuilder<P> {
    provider: Arc<P>,
    entry: ProviderEntry,
}

impl<P: PaymentProvider + 'static> ProviderEntryBuilder<P> {
    pub fn invoices(mut self) -> Self
    where
        P: InvoiceProvider,
    {
        self.entry.invoices = Some(self.provider.clone());
        self
    }

    pub fn payouts(mut self) -> Self
    where
        P: PayoutProvider,
    {
        self.entry.payouts = Some(self.provider.clone());
        self
    }

    pub fn payment_sessions(mut self) -> Self
    where
        P: PaymentSessionProvider,
    {
        self.entry.payment_sessions = Some(self.provider.clone());
        self
    }

    pub fn payment_methods(mut self) -> Self
    where
        P: PaymentMethodProvider,
    {
        self.entry.payment_methods = Some(self.provider.clone());
        self
    }

    pub fn balance(mut self) -> Self
    where
        P: BalanceProvider,
    {
        self.entry.balance = Some(self.provider.clone());
        self
    }

    pub fn capture(mut self) -> Self
    where
        P: CaptureProvider,
    {
        self.entry.capture = Some(self.provider.clone());
        self
    }

    /// Secret used to verify this provider's webhook signatures
    pub fn webhook_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.entry.webhook_verifier = Some(WebhookVerifier::new(&self.entry.name, secret));
        self
    }

    pub fn build(self) -> ProviderEntry {
        self.entry
    }
}

#[cfg(test)]
mod tests {
    use super::sandbox::SandboxProvider;
    use super::*;

    #[test]
    fn test_entry_reports_provider_name() {
        let provider = Arc::new(SandboxProvider::new(
            "stripe",
            ProviderCapabilities::new(["USD"]),
        ));
        let entry = ProviderEntry::builder(provider).build();
        assert_eq!(entry.name(), "stripe");
    }

    #[test]
    fn test_unregistered_capability_is_not_supported() {
        let provider = Arc::new(SandboxProvider::new(
            "stripe",
            ProviderCapabilities::new(["USD"]).with(Capability::Payouts),
        ));
        let entry = ProviderEntry::builder(provider).build();
        assert!(!entry.supports(Capability::Payouts));
        assert!(matches!(
            entry.payouts(),
            Err(OrchestratorError::NotSupported { .. })
        ));
    }

    #[test]
    fn test_undeclared_capability_is_not_supported() {
        let provider = Arc::new(SandboxProvider::new(
            "xendit",
            ProviderCapabilities::new(["IDR"]),
        ));
        // Registered but not declared in the capability flags
        let entry = ProviderEntry::builder(provider).invoices().build();
        assert!(!entry.supports(Capability::Invoices));
        assert!(entry.invoices().is_err());
    }

    #[test]
    fn test_declared_and_registered_capability() {
        let provider = Arc::new(SandboxProvider::new(
            "stripe",
            ProviderCapabilities::new(["USD"])
                .with(Capability::Invoices)
                .with(Capability::ManualCapture),
        ));
        let entry = ProviderEntry::builder(provider)
            .invoices()
            .capture()
            .build();
        assert!(entry.supports(Capability::Invoices));
        assert!(entry.capture().is_ok());
        assert!(entry.balance().is_err());
    }
}
