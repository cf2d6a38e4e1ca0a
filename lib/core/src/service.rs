use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakers, CircuitState};
use crate::context::Context;
use crate::error::{OrchestratorError, ProviderError, ProviderErrorKind, ProviderResultExt};
use crate::events::{EventEmitter, OrchestratorEvent};
use crate::models::{
    ChargeOutcome, ChargeRequest, ChargeResponse, Config, EntityType, ListPaymentsRequest,
    Payment, PaymentStatus, ProviderRefundRequest, Refund, RefundRequest, RefundStatus,
};
use crate::persist::{with_transaction, PaymentRepository};
use crate::provider::ProviderEntry;
use crate::retry::RetryPolicy;
use crate::selector::MultiProviderSelector;

/// Charges and refunds with at most one provider side effect per request and
/// local records that match the provider's
pub struct PaymentService {
    selector: Arc<MultiProviderSelector>,
    repository: Arc<dyn PaymentRepository>,
    breakers: Arc<CircuitBreakers>,
    charge_retry: RetryPolicy,
    refund_retry: RetryPolicy,
    compensation_timeout: Duration,
    event_emitter: Arc<EventEmitter>,
}

impl PaymentService {
    pub fn new(
        selector: Arc<MultiProviderSelector>,
        repository: Arc<dyn PaymentRepository>,
        config: &Config,
        event_emitter: Arc<EventEmitter>,
    ) -> Self {
        let emitter = event_emitter.clone();
        let breakers = CircuitBreakers::new(CircuitBreakerConfig::from(&config.circuit_breaker))
            .with_failure_predicate(Arc::new(|err: &OrchestratorError| err.is_transient()))
            .with_state_change_callback(Arc::new(
                move |breaker: &str, from: CircuitState, to: CircuitState| {
                    emitter.emit(&OrchestratorEvent::CircuitStateChanged {
                        breaker: breaker.to_string(),
                        from,
                        to,
                    });
                },
            ));

        Self {
            selector,
            repository,
            breakers: Arc::new(breakers),
            charge_retry: RetryPolicy::from(&config.charge_retry)
                .with_retryable(OrchestratorError::is_transient),
            refund_retry: RetryPolicy::from(&config.refund_retry)
                .with_retryable(OrchestratorError::is_transient),
            compensation_timeout: Duration::from_millis(config.compensation_timeout_ms),
            event_emitter,
        }
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakers> {
        &self.breakers
    }

    /// Runs one provider call through the retry policy, each attempt gated by
    /// the provider's breaker for `operation`
    async fn call_provider<T, F, Fut>(
        &self,
        ctx: &Context,
        entry: &ProviderEntry,
        operation: &str,
        policy: &RetryPolicy,
        call: F,
    ) -> Result<T, OrchestratorError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, OrchestratorError>> + Send + 'static,
        T: Send + 'static,
    {
        let breaker = self.breakers.get(entry.name(), operation);
        let started = Instant::now();
        let abandoned = AtomicBool::new(false);
        let (result, stats) = policy
            .execute(ctx, || {
                let attempt = breaker.execute(ctx, &call);
                let abandoned = &abandoned;
                async move {
                    let result = attempt.await;
                    if matches!(result, Err(OrchestratorError::Timeout(_))) {
                        abandoned.store(true, Ordering::SeqCst);
                    }
                    result
                }
            })
            .await;
        self.selector
            .record_call(entry.name(), operation, result.is_ok(), started);
        if let Err(e) = &result {
            if abandoned.load(Ordering::SeqCst) {
                warn!(
                    "{} {operation} was abandoned and may still complete, idempotency key {:?}",
                    entry.name(),
                    ctx.idempotency_key()
                );
                self.event_emitter
                    .emit(&OrchestratorEvent::ProviderCallAbandoned {
                        provider: entry.name().to_string(),
                        operation: operation.to_string(),
                        idempotency_key: ctx.idempotency_key().map(str::to_string),
                        error: e.to_string(),
                    });
            }
        }
        if stats.attempts > 1 {
            info!(
                "{} {operation} took {} attempts, last error: {:?}",
                entry.name(),
                stats.attempts,
                stats.last_error
            );
        }
        result
    }

    /// Charges the customer through the provider selected for the currency
    ///
    /// A request carrying an idempotency key (on the request or on `ctx`) that
    /// was already charged returns the stored result without calling any
    /// provider. If the provider charges but the local record cannot be
    /// committed, the charge is reversed on a detached task and the commit
    /// error is returned.
    pub async fn create_charge(
        &self,
        ctx: &Context,
        request: ChargeRequest,
    ) -> Result<ChargeOutcome, OrchestratorError> {
        request.validate()?;
        let currency = request.currency.trim().to_uppercase();
        let key = request
            .idempotency_key
            .clone()
            .or_else(|| ctx.idempotency_key().map(str::to_string));

        if let Some(key) = &key {
            if let Some(existing) = self.repository.get_payment_by_idempotency_key(key)? {
                return replay(existing, &request, &currency);
            }
        }

        let selected = match &request.preferred_provider {
            Some(preferred) => {
                self.selector
                    .select_preferred(Some(preferred.as_str()), &currency)
                    .await
            }
            None => self.selector.select_by_currency(&currency).await,
        };
        let entry = match selected {
            Ok(entry) => entry,
            Err(e) => {
                warn!("No provider for a {currency} charge: {e}");
                self.event_emitter.emit(&OrchestratorEvent::ChargeFailed {
                    provider: None,
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        // Without a caller key the token only deduplicates our own retries
        let token = key.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let ctx = ctx.with_idempotency_key(token.clone());
        let provider_request = Arc::new(ChargeRequest {
            currency: currency.clone(),
            idempotency_key: Some(token.clone()),
            ..request.clone()
        });
        info!(
            "Charging {} {currency} for customer {} via {}",
            request.amount,
            request.customer_id,
            entry.name()
        );

        let mut tx = self.repository.begin();
        let provider = entry.provider().clone();
        let name = entry.name().to_string();
        let charged = self
            .call_provider(&ctx, entry, "charge", &self.charge_retry, || {
                let provider = provider.clone();
                let request = provider_request.clone();
                let name = name.clone();
                async move { provider.charge(&request).await.during(&name, "charge") }
            })
            .await;
        let mut response = match charged {
            Ok(response) => response,
            Err(e) => {
                warn!("Charge via {} failed: {e}", entry.name());
                self.event_emitter.emit(&OrchestratorEvent::ChargeFailed {
                    provider: Some(entry.name().to_string()),
                    error: e.to_string(),
                });
                return Err(e);
            }
        };
        response.provider = entry.name().to_string();

        let now = chrono::Utc::now().timestamp();
        let payment = Payment {
            id: Uuid::new_v4().to_string(),
            amount: request.amount,
            currency,
            status: response.status,
            provider: entry.name().to_string(),
            provider_charge_id: response.id.clone(),
            customer_id: request.customer_id.clone(),
            payment_method: request.payment_method.clone(),
            idempotency_key: key.clone(),
            description: request.description.clone(),
            amount_captured: response.amount_captured,
            created_at: now,
            updated_at: now,
        };
        tx.create_payment(payment.clone());

        if let Err(e) = self.repository.commit(tx) {
            // A concurrent request with the same key may have stored the same
            // provider charge first
            if let (OrchestratorError::AlreadyExists(_), Some(key)) = (&e, &key) {
                if let Some(existing) = self.repository.get_payment_by_idempotency_key(key)? {
                    if existing.provider_charge_id == payment.provider_charge_id {
                        return replay(existing, &request, &payment.currency);
                    }
                }
            }
            error!(
                "Charge {} at {} succeeded but its payment could not be stored: {e}",
                payment.provider_charge_id, payment.provider
            );
            self.compensate(&ctx, entry, &payment, &response);
            return Err(e);
        }

        self.selector.record_mapping(
            EntityType::Payment,
            &payment.id,
            &payment.provider,
            &payment.provider_charge_id,
        );

        if payment.status == PaymentStatus::Failed {
            info!("Charge {} was declined by {}", payment.id, payment.provider);
            self.event_emitter.emit(&OrchestratorEvent::ChargeFailed {
                provider: Some(payment.provider.clone()),
                error: response
                    .failure_message
                    .clone()
                    .unwrap_or_else(|| "declined".to_string()),
            });
        } else {
            info!("Stored payment {} ({})", payment.id, payment.status);
            self.event_emitter.emit(&OrchestratorEvent::ChargeSucceeded {
                payment: payment.clone(),
            });
        }

        Ok(ChargeOutcome {
            payment,
            response,
            replayed: false,
        })
    }

    /// Reverses a charge that has no local record, on a detached task with a
    /// bounded timeout and a single attempt
    fn compensate(
        &self,
        ctx: &Context,
        entry: &ProviderEntry,
        payment: &Payment,
        response: &ChargeResponse,
    ) {
        let amount = payment.amount;
        let currency = payment.currency.clone();
        let reversal_ctx = ctx.detached().with_timeout(self.compensation_timeout);
        let emitter = self.event_emitter.clone();
        let provider = entry.provider().clone();
        let capture = entry.capture().ok().cloned();
        let provider_name = payment.provider.clone();
        let charge_id = payment.provider_charge_id.clone();
        let status = response.status;
        let refund = ProviderRefundRequest {
            provider_charge_id: charge_id.clone(),
            amount: response.amount_captured,
            currency: payment.currency.clone(),
            reason: Some("reversal of an unrecorded charge".to_string()),
            idempotency_key: Some(format!("reversal-{charge_id}")),
        };

        tokio::spawn(async move {
            let reversal = async {
                match status {
                    PaymentStatus::Failed | PaymentStatus::Canceled => {
                        debug!("Charge {charge_id} moved no money, nothing to reverse");
                        Ok(0)
                    }
                    _ if refund.amount > 0 => provider
                        .refund(&refund)
                        .await
                        .map(|refunded| refunded.amount)
                        .during(&provider_name, "refund"),
                    _ => match capture {
                        Some(capture) => capture
                            .void(&charge_id)
                            .await
                            .map(|_| 0)
                            .during(&provider_name, "void"),
                        None => Err(OrchestratorError::not_supported(&provider_name, "void")),
                    },
                }
            };
            let outcome = tokio::select! {
                result = reversal => result,
                _ = reversal_ctx.done() => Err(reversal_ctx.err().unwrap_or(OrchestratorError::DeadlineExceeded)),
            };

            match outcome {
                Ok(reversed) => {
                    warn!("Reversed unrecorded charge {charge_id} at {provider_name}");
                    emitter.emit(&OrchestratorEvent::CompensationSucceeded {
                        provider: provider_name,
                        provider_charge_id: charge_id,
                        amount: reversed,
                    });
                }
                Err(e) => {
                    error!(
                        "CRITICAL: charge {charge_id} at {provider_name} has no local record \
                         and could not be reversed: {e}"
                    );
                    emitter.emit(&OrchestratorEvent::CompensationFailed {
                        provider: provider_name,
                        provider_charge_id: charge_id,
                        amount,
                        currency,
                        error: e.to_string(),
                    });
                }
            }
        });
    }

    /// The provider holding a payment's charge: the recorded mapping, or the
    /// payment's own provider when the mapping was never written
    fn payment_owner(&self, payment: &Payment) -> Result<&ProviderEntry, OrchestratorError> {
        match self.selector.resolve(EntityType::Payment, &payment.id) {
            Ok((entry, _)) => Ok(entry),
            Err(OrchestratorError::NotFound(_)) => {
                warn!(
                    "Payment {} has no provider mapping, restoring it from the payment",
                    payment.id
                );
                let entry = self.selector.provider_by_name(&payment.provider)?;
                self.selector.record_mapping(
                    EntityType::Payment,
                    &payment.id,
                    &payment.provider,
                    &payment.provider_charge_id,
                );
                Ok(entry)
            }
            Err(e) => Err(e),
        }
    }

    fn load_payment(&self, payment_id: &str) -> Result<Payment, OrchestratorError> {
        self.repository
            .get_payment(payment_id)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("payment {payment_id}")))
    }

    /// Refunds part or all of a successful payment through the provider that
    /// holds the charge, then marks the payment refunded and stores the refund
    /// in one transaction
    pub async fn create_refund(
        &self,
        ctx: &Context,
        request: RefundRequest,
    ) -> Result<Refund, OrchestratorError> {
        if request.amount == 0 {
            return Err(OrchestratorError::Validation(
                "refund amount must be positive".to_string(),
            ));
        }
        let mut payment = self.load_payment(&request.payment_id)?;
        if payment.status != PaymentStatus::Success {
            return Err(OrchestratorError::Validation(format!(
                "payment {} is {}, only successful payments can be refunded",
                payment.id, payment.status
            )));
        }
        if request.amount > payment.amount {
            return Err(OrchestratorError::Validation(format!(
                "refund of {} exceeds the payment amount {}",
                request.amount, payment.amount
            )));
        }

        let entry = self.payment_owner(&payment)?;
        let token = ctx
            .idempotency_key()
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let ctx = &ctx.with_idempotency_key(token.clone());
        let provider_request = Arc::new(ProviderRefundRequest {
            provider_charge_id: payment.provider_charge_id.clone(),
            amount: request.amount,
            currency: payment.currency.clone(),
            reason: request.reason.clone(),
            idempotency_key: Some(token),
        });
        info!(
            "Refunding {} {} of payment {} via {}",
            request.amount,
            payment.currency,
            payment.id,
            entry.name()
        );

        let provider = entry.provider().clone();
        let name = entry.name().to_string();
        let response = self
            .call_provider(ctx, entry, "refund", &self.refund_retry, || {
                let provider = provider.clone();
                let request = provider_request.clone();
                let name = name.clone();
                async move { provider.refund(&request).await.during(&name, "refund") }
            })
            .await?;

        if response.status == RefundStatus::Failed {
            warn!(
                "{} reported refund {} of payment {} as failed",
                entry.name(),
                response.id,
                payment.id
            );
            return Err(OrchestratorError::provider(
                entry.name(),
                "refund",
                ProviderError::new(
                    ProviderErrorKind::Declined,
                    format!("refund {} failed", response.id),
                ),
            ));
        }

        let refund = Refund {
            id: Uuid::new_v4().to_string(),
            payment_id: payment.id.clone(),
            amount: response.amount,
            currency: payment.currency.clone(),
            status: response.status,
            provider: entry.name().to_string(),
            provider_refund_id: response.id.clone(),
            reason: request.reason.clone(),
            created_at: chrono::Utc::now().timestamp(),
        };
        // A pending refund leaves the payment successful until the provider settles it
        let settled = response.status == RefundStatus::Succeeded;
        if settled {
            payment.transition(PaymentStatus::Refunded)?;
        }

        let stored = with_transaction(self.repository.as_ref(), |mut tx| async move {
            if settled {
                tx.update_payment(payment);
            }
            tx.create_refund(refund.clone());
            Ok((refund, tx))
        })
        .await;

        match stored {
            Ok(refund) if settled => {
                info!("Stored refund {} for payment {}", refund.id, refund.payment_id);
                self.event_emitter.emit(&OrchestratorEvent::RefundSucceeded {
                    refund: refund.clone(),
                });
                Ok(refund)
            }
            Ok(refund) => {
                info!(
                    "Stored pending refund {} for payment {}",
                    refund.id, refund.payment_id
                );
                Ok(refund)
            }
            Err(e) => {
                error!(
                    "CRITICAL: refund {} at {} succeeded but could not be stored: {e}",
                    response.id,
                    entry.name()
                );
                self.event_emitter
                    .emit(&OrchestratorEvent::RefundPersistenceFailed {
                        payment_id: request.payment_id,
                        provider: entry.name().to_string(),
                        provider_refund_id: response.id,
                        error: e.to_string(),
                    });
                Err(e)
            }
        }
    }

    /// Captures an authorized payment, fully or `amount` of it
    pub async fn capture_payment(
        &self,
        ctx: &Context,
        payment_id: &str,
        amount: Option<u64>,
    ) -> Result<Payment, OrchestratorError> {
        let mut payment = self.load_payment(payment_id)?;
        if payment.status != PaymentStatus::RequiresCapture {
            return Err(OrchestratorError::Validation(format!(
                "payment {payment_id} is {}, not awaiting capture",
                payment.status
            )));
        }
        if let Some(amount) = amount {
            if amount == 0 || amount > payment.amount {
                return Err(OrchestratorError::Validation(format!(
                    "capture of {amount} is outside the authorized {}",
                    payment.amount
                )));
            }
        }

        let entry = self.payment_owner(&payment)?;
        let capture = entry.capture()?.clone();
        let name = entry.name().to_string();
        let charge_id = payment.provider_charge_id.clone();
        let response = self
            .call_provider(ctx, entry, "capture", &self.refund_retry, || {
                let capture = capture.clone();
                let name = name.clone();
                let charge_id = charge_id.clone();
                async move { capture.capture(&charge_id, amount).await.during(&name, "capture") }
            })
            .await?;

        payment.transition(response.status)?;
        payment.amount_captured = response.amount_captured;
        self.repository.update_payment(&payment)?;
        info!("Captured {} of payment {payment_id}", payment.amount_captured);
        Ok(payment)
    }

    /// Releases an authorization without moving money
    pub async fn void_payment(
        &self,
        ctx: &Context,
        payment_id: &str,
    ) -> Result<Payment, OrchestratorError> {
        let mut payment = self.load_payment(payment_id)?;
        if !matches!(
            payment.status,
            PaymentStatus::RequiresCapture | PaymentStatus::RequiresAction
        ) {
            return Err(OrchestratorError::Validation(format!(
                "payment {payment_id} is {} and cannot be voided",
                payment.status
            )));
        }

        let entry = self.payment_owner(&payment)?;
        let capture = entry.capture()?.clone();
        let name = entry.name().to_string();
        let charge_id = payment.provider_charge_id.clone();
        let response = self
            .call_provider(ctx, entry, "void", &self.refund_retry, || {
                let capture = capture.clone();
                let name = name.clone();
                let charge_id = charge_id.clone();
                async move { capture.void(&charge_id).await.during(&name, "void") }
            })
            .await?;

        payment.transition(response.status)?;
        self.repository.update_payment(&payment)?;
        info!("Voided payment {payment_id}");
        Ok(payment)
    }

    /// Refreshes the local status from the provider's view of the charge
    ///
    /// Status moves the local record cannot make (for example a failed
    /// payment reported as refunded) are logged and left alone.
    pub async fn sync_payment_status(
        &self,
        ctx: &Context,
        payment_id: &str,
    ) -> Result<Payment, OrchestratorError> {
        let mut payment = self.load_payment(payment_id)?;
        let entry = self.payment_owner(&payment)?;
        let provider = entry.provider().clone();
        let name = entry.name().to_string();
        let charge_id = payment.provider_charge_id.clone();
        let response = self
            .call_provider(ctx, entry, "get_charge", &self.refund_retry, || {
                let provider = provider.clone();
                let name = name.clone();
                let charge_id = charge_id.clone();
                async move { provider.get_charge(&charge_id).await.during(&name, "get_charge") }
            })
            .await?;

        if response.status == payment.status
            && response.amount_captured == payment.amount_captured
        {
            return Ok(payment);
        }
        if response.status == payment.status {
            payment.amount_captured = response.amount_captured;
            self.repository.update_payment(&payment)?;
            return Ok(payment);
        }
        if !payment.status.can_transition_to(response.status) {
            warn!(
                "Ignoring {} status {} for payment {payment_id} that is {}",
                entry.name(),
                response.status,
                payment.status
            );
            return Ok(payment);
        }
        info!(
            "Payment {payment_id} moved from {} to {}",
            payment.status, response.status
        );
        payment.transition(response.status)?;
        payment.amount_captured = response.amount_captured;
        self.repository.update_payment(&payment)?;
        Ok(payment)
    }

    /// Rewrites a missing provider mapping from the stored payment
    pub fn reconcile_mapping(&self, payment_id: &str) -> Result<(), OrchestratorError> {
        let payment = self.load_payment(payment_id)?;
        self.selector.register_entity(
            EntityType::Payment,
            &payment.id,
            &payment.provider,
            &payment.provider_charge_id,
        )
    }

    pub fn get_payment(&self, payment_id: &str) -> Result<Payment, OrchestratorError> {
        self.load_payment(payment_id)
    }

    pub fn list_payments(
        &self,
        request: &ListPaymentsRequest,
    ) -> Result<Vec<Payment>, OrchestratorError> {
        self.repository.list_payments(request.offset, request.limit)
    }

    pub fn list_refunds(&self, payment_id: &str) -> Result<Vec<Refund>, OrchestratorError> {
        self.repository.list_refunds(payment_id)
    }
}

/// Serves a stored payment for a repeated idempotency key
fn replay(
    existing: Payment,
    request: &ChargeRequest,
    currency: &str,
) -> Result<ChargeOutcome, OrchestratorError> {
    if existing.amount != request.amount || existing.currency != currency {
        return Err(OrchestratorError::Validation(format!(
            "idempotency key of payment {} was used with different parameters",
            existing.id
        )));
    }
    info!("Replaying payment {} for a repeated idempotency key", existing.id);
    Ok(ChargeOutcome {
        response: existing.to_charge_response(),
        payment: existing,
        replayed: true,
    })
}
