use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use futures::future::join_all;
use log::{debug, error, info, warn};
use serde::Serialize;

use crate::error::{OrchestratorError, ProviderResultExt};
use crate::events::{EventEmitter, OrchestratorEvent};
use crate::models::{EntityType, ProviderMapping};
use crate::persist::MappingStore;
use crate::provider::types::*;
use crate::provider::{Capability, ProviderCapabilities, ProviderEntry};

/// Provider-originated object that later operations must address through the
/// same provider
pub trait ProviderEntity {
    const ENTITY_TYPE: EntityType;

    fn entity_id(&self) -> &str;
}

impl ProviderEntity for Subscription {
    const ENTITY_TYPE: EntityType = EntityType::Subscription;

    fn entity_id(&self) -> &str {
        &self.id
    }
}

impl ProviderEntity for Dispute {
    const ENTITY_TYPE: EntityType = EntityType::Dispute;

    fn entity_id(&self) -> &str {
        &self.id
    }
}

impl ProviderEntity for Payout {
    const ENTITY_TYPE: EntityType = EntityType::Payout;

    fn entity_id(&self) -> &str {
        &self.id
    }
}

impl ProviderEntity for Invoice {
    const ENTITY_TYPE: EntityType = EntityType::Invoice;

    fn entity_id(&self) -> &str {
        &self.id
    }
}

impl ProviderEntity for PaymentSession {
    const ENTITY_TYPE: EntityType = EntityType::PaymentSession;

    fn entity_id(&self) -> &str {
        &self.id
    }
}

/// Provider owning an entity, and the provider's id for it
#[derive(Clone, Debug, PartialEq)]
struct EntityOwner {
    provider: String,
    provider_entity_id: String,
}

struct SelectorState {
    /// Upper-case currency code to preferred provider name
    routing: HashMap<String, String>,
    /// Cache of the durable mapping store
    affinity: HashMap<(EntityType, String), EntityOwner>,
}

/// Liveness and feature set of one configured provider
#[derive(Clone, Debug, Serialize)]
pub struct ProviderStatus {
    pub name: String,
    pub available: bool,
    pub capabilities: ProviderCapabilities,
    pub webhooks_configured: bool,
}

/// Picks one provider per operation and remembers which provider owns each entity
pub struct MultiProviderSelector {
    providers: Vec<ProviderEntry>,
    state: RwLock<SelectorState>,
    mappings: Arc<dyn MappingStore>,
    probe_timeout: Duration,
    event_emitter: Arc<EventEmitter>,
}

impl MultiProviderSelector {
    /// Creates a selector over `providers`, probed and scanned in the given order
    ///
    /// # Arguments
    ///
    /// * `routing` - Currency code to preferred provider name
    /// * `mappings` - Durable entity to provider mapping store
    /// * `probe_timeout` - Upper bound for a single `is_available` probe
    pub fn new(
        providers: Vec<ProviderEntry>,
        routing: HashMap<String, String>,
        mappings: Arc<dyn MappingStore>,
        probe_timeout: Duration,
        event_emitter: Arc<EventEmitter>,
    ) -> Result<Self, OrchestratorError> {
        if providers.is_empty() {
            return Err(OrchestratorError::Validation(
                "at least one provider must be configured".to_string(),
            ));
        }
        for (i, entry) in providers.iter().enumerate() {
            if providers[..i].iter().any(|other| other.name() == entry.name()) {
                return Err(OrchestratorError::Validation(format!(
                    "provider {} is configured twice",
                    entry.name()
                )));
            }
        }
        let routing = routing
            .into_iter()
            .map(|(currency, provider)| (currency.to_uppercase(), provider))
            .collect();

        Ok(Self {
            providers,
            state: RwLock::new(SelectorState {
                routing,
                affinity: HashMap::new(),
            }),
            mappings,
            probe_timeout,
            event_emitter,
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, SelectorState> {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, SelectorState> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn providers(&self) -> &[ProviderEntry] {
        &self.providers
    }

    /// The configured provider named `name`
    pub fn provider_by_name(&self, name: &str) -> Result<&ProviderEntry, OrchestratorError> {
        self.providers
            .iter()
            .find(|entry| entry.name() == name)
            .ok_or_else(|| OrchestratorError::ProviderNotAvailable(name.to_string()))
    }

    /// Whether any configured provider supports `capability`
    pub fn supports(&self, capability: Capability) -> bool {
        self.providers.iter().any(|entry| entry.supports(capability))
    }

    pub fn supports_currency(&self, currency: &str) -> bool {
        self.providers
            .iter()
            .any(|entry| entry.capabilities().supports_currency(currency))
    }

    /// Probes every provider concurrently
    pub async fn provider_statuses(&self) -> Vec<ProviderStatus> {
        join_all(self.providers.iter().map(|entry| async move {
            ProviderStatus {
                name: entry.name().to_string(),
                available: self.probe(entry).await,
                capabilities: entry.capabilities().clone(),
                webhooks_configured: entry.webhook_verifier().is_some(),
            }
        }))
        .await
    }

    /// Liveness probe bounded by the probe timeout; a slow probe counts as unavailable
    pub async fn probe(&self, entry: &ProviderEntry) -> bool {
        match tokio::time::timeout(self.probe_timeout, entry.provider().is_available()).await {
            Ok(available) => available,
            Err(_) => {
                warn!(
                    "Availability probe of {} timed out after {:?}",
                    entry.name(),
                    self.probe_timeout
                );
                false
            }
        }
    }

    pub fn routed_provider(&self, currency: &str) -> Option<String> {
        self.read().routing.get(&currency.to_uppercase()).cloned()
    }

    pub fn routing_table(&self) -> HashMap<String, String> {
        self.read().routing.clone()
    }

    /// Routes `currency` to `provider`, which must be configured
    pub fn set_route(&self, currency: &str, provider: &str) -> Result<(), OrchestratorError> {
        if currency.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "currency is required".to_string(),
            ));
        }
        self.provider_by_name(provider)?;
        info!("Routing {} to {provider}", currency.to_uppercase());
        self.write()
            .routing
            .insert(currency.to_uppercase(), provider.to_string());
        Ok(())
    }

    /// The preferred provider if it is available, otherwise the first
    /// available provider in configured order that passes `eligible`
    async fn select_where<F>(
        &self,
        preferred: Option<&str>,
        eligible: F,
    ) -> Result<&ProviderEntry, OrchestratorError>
    where
        F: Fn(&ProviderEntry) -> bool,
    {
        if let Some(name) = preferred {
            match self.providers.iter().find(|entry| entry.name() == name) {
                Some(entry) if eligible(entry) => {
                    if self.probe(entry).await {
                        return Ok(entry);
                    }
                    warn!("Preferred provider {name} is unavailable, falling back");
                }
                Some(_) => debug!("Preferred provider {name} is not eligible, falling back"),
                None => debug!("Preferred provider {name} is not configured, falling back"),
            }
        }

        for entry in &self.providers {
            if Some(entry.name()) == preferred || !eligible(entry) {
                continue;
            }
            if self.probe(entry).await {
                return Ok(entry);
            }
            debug!("Provider {} is unavailable", entry.name());
        }
        Err(OrchestratorError::NoAvailableProvider)
    }

    /// Selects the routed provider for `currency`, falling back to the first
    /// available provider that accepts the currency
    pub async fn select_by_currency(
        &self,
        currency: &str,
    ) -> Result<&ProviderEntry, OrchestratorError> {
        let preferred = self.routed_provider(currency);
        self.select_preferred(preferred.as_deref(), currency).await
    }

    /// Like [MultiProviderSelector::select_by_currency] with an explicit preference
    pub async fn select_preferred(
        &self,
        preferred: Option<&str>,
        currency: &str,
    ) -> Result<&ProviderEntry, OrchestratorError> {
        let entry = self
            .select_where(preferred, |entry| {
                entry.capabilities().supports_currency(currency)
            })
            .await?;
        debug!("Selected {} for {currency}", entry.name());
        Ok(entry)
    }

    /// Selects a provider that supports `capability`, preferring the one routed
    /// for `currency`
    pub async fn select_for_capability(
        &self,
        capability: Capability,
        currency: Option<&str>,
    ) -> Result<&ProviderEntry, OrchestratorError> {
        if !self.supports(capability) {
            return Err(OrchestratorError::not_supported(
                "configured providers",
                &capability.to_string(),
            ));
        }
        let preferred = currency.and_then(|currency| self.routed_provider(currency));
        self.select_where(preferred.as_deref(), |entry| {
            entry.supports(capability)
                && currency.map_or(true, |c| entry.capabilities().supports_currency(c))
        })
        .await
    }

    /// Finds the provider owning an entity: the cache first, then the durable
    /// mapping. The owner must still be configured.
    ///
    /// # Returns
    ///
    /// The owning provider and its id for the entity
    pub fn resolve(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<(&ProviderEntry, String), OrchestratorError> {
        let key = (entity_type, entity_id.to_string());
        let cached = self.read().affinity.get(&key).cloned();
        let owner = match cached {
            Some(owner) => owner,
            None => {
                let mapping = self
                    .mappings
                    .get_by_entity(entity_id, entity_type)?
                    .ok_or_else(|| {
                        OrchestratorError::NotFound(format!(
                            "no provider mapping for {entity_type} {entity_id}"
                        ))
                    })?;
                let owner = EntityOwner {
                    provider: mapping.provider_name,
                    provider_entity_id: mapping.provider_entity_id,
                };
                self.write().affinity.insert(key, owner.clone());
                owner
            }
        };

        let entry = self.provider_by_name(&owner.provider).map_err(|e| {
            error!("{entity_type} {entity_id} belongs to unconfigured provider {}", owner.provider);
            e
        })?;
        Ok((entry, owner.provider_entity_id))
    }

    /// Writes the durable mapping, then caches the owner the store agrees on
    ///
    /// A conflicting owner already in the store wins: the cache is refilled
    /// from it and the write is refused. Storage failures still cache the new
    /// owner since the entity exists at that provider.
    fn store_mapping(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        provider: &str,
        provider_entity_id: &str,
    ) -> Result<(), OrchestratorError> {
        let key = (entity_type, entity_id.to_string());
        let mapping = ProviderMapping {
            entity_id: entity_id.to_string(),
            entity_type,
            provider_name: provider.to_string(),
            provider_entity_id: provider_entity_id.to_string(),
            created_at: chrono::Utc::now().timestamp(),
        };
        let owner = EntityOwner {
            provider: provider.to_string(),
            provider_entity_id: provider_entity_id.to_string(),
        };

        match self.mappings.create(&mapping) {
            Ok(()) => {
                self.write().affinity.insert(key, owner);
                Ok(())
            }
            Err(OrchestratorError::AlreadyExists(what)) => {
                let existing = self
                    .mappings
                    .get_by_entity(entity_id, entity_type)?
                    .ok_or_else(|| OrchestratorError::AlreadyExists(what.clone()))?;
                let same_owner = existing.provider_name == provider;
                if !same_owner {
                    warn!(
                        "{entity_type} {entity_id} is owned by {}, refusing {provider}",
                        existing.provider_name
                    );
                }
                self.write().affinity.insert(
                    key,
                    EntityOwner {
                        provider: existing.provider_name,
                        provider_entity_id: existing.provider_entity_id,
                    },
                );
                if same_owner {
                    Ok(())
                } else {
                    Err(OrchestratorError::AlreadyExists(what))
                }
            }
            Err(e) => {
                self.write().affinity.insert(key, owner);
                Err(e)
            }
        }
    }

    /// Caches and durably records the owner of a newly created entity
    ///
    /// A failed durable write never fails the caller: the entity already exists
    /// at the provider. It is logged and raised as
    /// [OrchestratorEvent::MappingWriteFailed] so the mapping can be reconciled.
    pub fn record_mapping(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        provider: &str,
        provider_entity_id: &str,
    ) {
        if let Err(e) = self.store_mapping(entity_type, entity_id, provider, provider_entity_id) {
            error!("Failed to record {entity_type} {entity_id} owned by {provider}: {e}");
            self.event_emitter.emit(&OrchestratorEvent::MappingWriteFailed {
                entity_type,
                entity_id: entity_id.to_string(),
                provider: provider.to_string(),
                error: e.to_string(),
            });
        }
    }

    /// Records an entity that the provider originated on its own, such as a
    /// dispute announced by webhook
    pub fn register_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        provider: &str,
        provider_entity_id: &str,
    ) -> Result<(), OrchestratorError> {
        self.provider_by_name(provider)?;
        self.store_mapping(entity_type, entity_id, provider, provider_entity_id)
    }

    /// Drops the in-memory affinity cache; the durable mappings stay authoritative
    pub fn clear_cache(&self) {
        self.write().affinity.clear();
    }

    /// Checks a webhook payload against the provider's signing secret
    pub fn verify_webhook(
        &self,
        provider: &str,
        payload: &[u8],
        signature: &str,
    ) -> Result<(), OrchestratorError> {
        let entry = self.provider_by_name(provider)?;
        let verifier = entry.webhook_verifier().ok_or_else(|| {
            warn!("No webhook secret configured for {provider}");
            OrchestratorError::InvalidSignature
        })?;
        verifier.verify(payload, signature)
    }

    pub(crate) fn record_call(
        &self,
        provider: &str,
        operation: &str,
        success: bool,
        started: Instant,
    ) {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        debug!("{provider} {operation} finished in {elapsed_ms}ms, success: {success}");
        self.event_emitter.emit(&OrchestratorEvent::ProviderCall {
            provider: provider.to_string(),
            operation: operation.to_string(),
            success,
            elapsed_ms,
        });
    }

    /// Runs an entity-creating call and records the new entity's owner
    async fn originate<'a, T, F, Fut>(
        &'a self,
        entry: &'a ProviderEntry,
        operation: &str,
        call: F,
    ) -> Result<T, OrchestratorError>
    where
        T: ProviderEntity,
        F: FnOnce(&'a ProviderEntry) -> Fut,
        Fut: Future<Output = Result<T, OrchestratorError>>,
    {
        let started = Instant::now();
        let result = call(entry).await;
        self.record_call(entry.name(), operation, result.is_ok(), started);
        let entity = result?;
        info!(
            "{} created {} {}",
            entry.name(),
            T::ENTITY_TYPE,
            entity.entity_id()
        );
        self.record_mapping(
            T::ENTITY_TYPE,
            entity.entity_id(),
            entry.name(),
            entity.entity_id(),
        );
        Ok(entity)
    }

    /// Runs a call against the provider owning an existing entity
    async fn with_entity<'a, T, F, Fut>(
        &'a self,
        entity_type: EntityType,
        entity_id: &str,
        operation: &str,
        call: F,
    ) -> Result<T, OrchestratorError>
    where
        F: FnOnce(&'a ProviderEntry, String) -> Fut,
        Fut: Future<Output = Result<T, OrchestratorError>>,
    {
        let (entry, provider_entity_id) = self.resolve(entity_type, entity_id)?;
        let started = Instant::now();
        let result = call(entry, provider_entity_id).await;
        self.record_call(entry.name(), operation, result.is_ok(), started);
        result
    }

    /// Queries every available provider supporting `capability` and concatenates
    /// the results, skipping providers that fail
    async fn fan_out<'a, T, F, Fut>(
        &'a self,
        capability: Option<Capability>,
        operation: &str,
        call: F,
    ) -> Result<Vec<T>, OrchestratorError>
    where
        F: Fn(&'a ProviderEntry) -> Fut,
        Fut: Future<Output = Result<Vec<T>, OrchestratorError>>,
    {
        let call = &call;
        let queries = self
            .providers
            .iter()
            .filter(|entry| capability.map_or(true, |c| entry.supports(c)))
            .map(|entry| async move {
                if !self.probe(entry).await {
                    debug!("{operation}: skipping unavailable provider {}", entry.name());
                    return Vec::new();
                }
                let started = Instant::now();
                let result = call(entry).await;
                self.record_call(entry.name(), operation, result.is_ok(), started);
                result.unwrap_or_else(|e| {
                    warn!("{operation}: skipping provider {}: {e}", entry.name());
                    Vec::new()
                })
            });

        let results: Vec<T> = join_all(queries).await.into_iter().flatten().collect();
        if results.is_empty() {
            return Err(OrchestratorError::NotFound(format!(
                "{operation}: no results from any provider"
            )));
        }
        Ok(results)
    }

    // Subscriptions

    pub async fn create_subscription(
        &self,
        request: &CreateSubscriptionRequest,
    ) -> Result<Subscription, OrchestratorError> {
        let entry = self.select_by_currency(&request.currency).await?;
        self.originate(entry, "create_subscription", |entry| async move {
            entry
                .provider()
                .create_subscription(request)
                .await
                .during(entry.name(), "create_subscription")
        })
        .await
    }

    pub async fn update_subscription(
        &self,
        subscription_id: &str,
        request: &UpdateSubscriptionRequest,
    ) -> Result<Subscription, OrchestratorError> {
        self.with_entity(
            EntityType::Subscription,
            subscription_id,
            "update_subscription",
            |entry, id| async move {
                entry
                    .provider()
                    .update_subscription(&id, request)
                    .await
                    .during(entry.name(), "update_subscription")
            },
        )
        .await
    }

    pub async fn cancel_subscription(
        &self,
        subscription_id: &str,
        at_period_end: bool,
    ) -> Result<Subscription, OrchestratorError> {
        self.with_entity(
            EntityType::Subscription,
            subscription_id,
            "cancel_subscription",
            |entry, id| async move {
                entry
                    .provider()
                    .cancel_subscription(&id, at_period_end)
                    .await
                    .during(entry.name(), "cancel_subscription")
            },
        )
        .await
    }

    pub async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Subscription, OrchestratorError> {
        self.with_entity(
            EntityType::Subscription,
            subscription_id,
            "get_subscription",
            |entry, id| async move {
                entry
                    .provider()
                    .get_subscription(&id)
                    .await
                    .during(entry.name(), "get_subscription")
            },
        )
        .await
    }

    pub async fn list_subscriptions(
        &self,
        customer_id: &str,
    ) -> Result<Vec<Subscription>, OrchestratorError> {
        self.fan_out(None, "list_subscriptions", |entry| async move {
            entry
                .provider()
                .list_subscriptions(customer_id)
                .await
                .during(entry.name(), "list_subscriptions")
        })
        .await
    }

    // Disputes are opened by the cardholder; they reach the selector through
    // `register_entity`.

    pub async fn get_dispute(&self, dispute_id: &str) -> Result<Dispute, OrchestratorError> {
        self.with_entity(
            EntityType::Dispute,
            dispute_id,
            "get_dispute",
            |entry, id| async move {
                entry
                    .provider()
                    .get_dispute(&id)
                    .await
                    .during(entry.name(), "get_dispute")
            },
        )
        .await
    }

    pub async fn list_disputes(&self, customer_id: &str) -> Result<Vec<Dispute>, OrchestratorError> {
        self.fan_out(None, "list_disputes", |entry| async move {
            entry
                .provider()
                .list_disputes(customer_id)
                .await
                .during(entry.name(), "list_disputes")
        })
        .await
    }

    pub async fn update_dispute(
        &self,
        dispute_id: &str,
        evidence: &DisputeEvidence,
    ) -> Result<Dispute, OrchestratorError> {
        self.with_entity(
            EntityType::Dispute,
            dispute_id,
            "update_dispute",
            |entry, id| async move {
                entry
                    .provider()
                    .update_dispute(&id, evidence)
                    .await
                    .during(entry.name(), "update_dispute")
            },
        )
        .await
    }

    pub async fn close_dispute(&self, dispute_id: &str) -> Result<Dispute, OrchestratorError> {
        self.with_entity(
            EntityType::Dispute,
            dispute_id,
            "close_dispute",
            |entry, id| async move {
                entry
                    .provider()
                    .close_dispute(&id)
                    .await
                    .during(entry.name(), "close_dispute")
            },
        )
        .await
    }

    // Payouts

    pub async fn create_payout(
        &self,
        request: &CreatePayoutRequest,
    ) -> Result<Payout, OrchestratorError> {
        let entry = self
            .select_for_capability(Capability::Payouts, Some(&request.currency))
            .await?;
        self.originate(entry, "create_payout", |entry| async move {
            entry
                .payouts()?
                .create_payout(request)
                .await
                .during(entry.name(), "create_payout")
        })
        .await
    }

    pub async fn get_payout(&self, payout_id: &str) -> Result<Payout, OrchestratorError> {
        self.with_entity(
            EntityType::Payout,
            payout_id,
            "get_payout",
            |entry, id| async move {
                entry
                    .payouts()?
                    .get_payout(&id)
                    .await
                    .during(entry.name(), "get_payout")
            },
        )
        .await
    }

    pub async fn cancel_payout(&self, payout_id: &str) -> Result<Payout, OrchestratorError> {
        self.with_entity(
            EntityType::Payout,
            payout_id,
            "cancel_payout",
            |entry, id| async move {
                entry
                    .payouts()?
                    .cancel_payout(&id)
                    .await
                    .during(entry.name(), "cancel_payout")
            },
        )
        .await
    }

    pub async fn list_payouts(&self, customer_id: &str) -> Result<Vec<Payout>, OrchestratorError> {
        self.fan_out(Some(Capability::Payouts), "list_payouts", |entry| async move {
            entry
                .payouts()?
                .list_payouts(customer_id)
                .await
                .during(entry.name(), "list_payouts")
        })
        .await
    }

    // Invoices

    pub async fn create_invoice(
        &self,
        request: &CreateInvoiceRequest,
    ) -> Result<Invoice, OrchestratorError> {
        let entry = self
            .select_for_capability(Capability::Invoices, Some(&request.currency))
            .await?;
        self.originate(entry, "create_invoice", |entry| async move {
            entry
                .invoices()?
                .create_invoice(request)
                .await
                .during(entry.name(), "create_invoice")
        })
        .await
    }

    pub async fn get_invoice(&self, invoice_id: &str) -> Result<Invoice, OrchestratorError> {
        self.with_entity(
            EntityType::Invoice,
            invoice_id,
            "get_invoice",
            |entry, id| async move {
                entry
                    .invoices()?
                    .get_invoice(&id)
                    .await
                    .during(entry.name(), "get_invoice")
            },
        )
        .await
    }

    pub async fn finalize_invoice(&self, invoice_id: &str) -> Result<Invoice, OrchestratorError> {
        self.with_entity(
            EntityType::Invoice,
            invoice_id,
            "finalize_invoice",
            |entry, id| async move {
                entry
                    .invoices()?
                    .finalize_invoice(&id)
                    .await
                    .during(entry.name(), "finalize_invoice")
            },
        )
        .await
    }

    pub async fn void_invoice(&self, invoice_id: &str) -> Result<Invoice, OrchestratorError> {
        self.with_entity(
            EntityType::Invoice,
            invoice_id,
            "void_invoice",
            |entry, id| async move {
                entry
                    .invoices()?
                    .void_invoice(&id)
                    .await
                    .during(entry.name(), "void_invoice")
            },
        )
        .await
    }

    pub async fn list_invoices(&self, customer_id: &str) -> Result<Vec<Invoice>, OrchestratorError> {
        self.fan_out(Some(Capability::Invoices), "list_invoices", |entry| async move {
            entry
                .invoices()?
                .list_invoices(customer_id)
                .await
                .during(entry.name(), "list_invoices")
        })
        .await
    }

    // Payment sessions

    pub async fn create_payment_session(
        &self,
        request: &CreatePaymentSessionRequest,
    ) -> Result<PaymentSession, OrchestratorError> {
        let entry = self
            .select_for_capability(Capability::PaymentSessions, Some(&request.currency))
            .await?;
        self.originate(entry, "create_payment_session", |entry| async move {
            entry
                .payment_sessions()?
                .create_payment_session(request)
                .await
                .during(entry.name(), "create_payment_session")
        })
        .await
    }

    pub async fn get_payment_session(
        &self,
        session_id: &str,
    ) -> Result<PaymentSession, OrchestratorError> {
        self.with_entity(
            EntityType::PaymentSession,
            session_id,
            "get_payment_session",
            |entry, id| async move {
                entry
                    .payment_sessions()?
                    .get_payment_session(&id)
                    .await
                    .during(entry.name(), "get_payment_session")
            },
        )
        .await
    }

    pub async fn expire_payment_session(
        &self,
        session_id: &str,
    ) -> Result<PaymentSession, OrchestratorError> {
        self.with_entity(
            EntityType::PaymentSession,
            session_id,
            "expire_payment_session",
            |entry, id| async move {
                entry
                    .payment_sessions()?
                    .expire_payment_session(&id)
                    .await
                    .during(entry.name(), "expire_payment_session")
            },
        )
        .await
    }

    pub async fn list_payment_sessions(
        &self,
        customer_id: &str,
    ) -> Result<Vec<PaymentSession>, OrchestratorError> {
        self.fan_out(
            Some(Capability::PaymentSessions),
            "list_payment_sessions",
            |entry| async move {
                entry
                    .payment_sessions()?
                    .list_payment_sessions(customer_id)
                    .await
                    .during(entry.name(), "list_payment_sessions")
            },
        )
        .await
    }

    // Stored payment methods, customers, plans and balances are not mapped
    // entities: callers name the provider.

    pub async fn attach_payment_method(
        &self,
        provider: &str,
        customer_id: &str,
        payment_method_id: &str,
    ) -> Result<StoredPaymentMethod, OrchestratorError> {
        let entry = self.provider_by_name(provider)?;
        entry
            .payment_methods()?
            .attach_payment_method(customer_id, payment_method_id)
            .await
            .during(provider, "attach_payment_method")
    }

    pub async fn detach_payment_method(
        &self,
        provider: &str,
        payment_method_id: &str,
    ) -> Result<(), OrchestratorError> {
        let entry = self.provider_by_name(provider)?;
        entry
            .payment_methods()?
            .detach_payment_method(payment_method_id)
            .await
            .during(provider, "detach_payment_method")
    }

    pub async fn list_payment_methods(
        &self,
        provider: &str,
        customer_id: &str,
    ) -> Result<Vec<StoredPaymentMethod>, OrchestratorError> {
        let entry = self.provider_by_name(provider)?;
        entry
            .payment_methods()?
            .list_payment_methods(customer_id)
            .await
            .during(provider, "list_payment_methods")
    }

    pub async fn get_balance(&self, provider: &str) -> Result<Balance, OrchestratorError> {
        let entry = self.provider_by_name(provider)?;
        entry
            .balance()?
            .get_balance()
            .await
            .during(provider, "get_balance")
    }

    pub async fn create_customer(
        &self,
        provider: &str,
        request: &CreateCustomerRequest,
    ) -> Result<Customer, OrchestratorError> {
        self.provider_by_name(provider)?
            .provider()
            .create_customer(request)
            .await
            .during(provider, "create_customer")
    }

    pub async fn get_customer(
        &self,
        provider: &str,
        customer_id: &str,
    ) -> Result<Customer, OrchestratorError> {
        self.provider_by_name(provider)?
            .provider()
            .get_customer(customer_id)
            .await
            .during(provider, "get_customer")
    }

    pub async fn update_customer(
        &self,
        provider: &str,
        customer_id: &str,
        request: &UpdateCustomerRequest,
    ) -> Result<Customer, OrchestratorError> {
        self.provider_by_name(provider)?
            .provider()
            .update_customer(customer_id, request)
            .await
            .during(provider, "update_customer")
    }

    pub async fn delete_customer(
        &self,
        provider: &str,
        customer_id: &str,
    ) -> Result<(), OrchestratorError> {
        self.provider_by_name(provider)?
            .provider()
            .delete_customer(customer_id)
            .await
            .during(provider, "delete_customer")
    }

    pub async fn create_plan(
        &self,
        provider: &str,
        request: &CreatePlanRequest,
    ) -> Result<Plan, OrchestratorError> {
        self.provider_by_name(provider)?
            .provider()
            .create_plan(request)
            .await
            .during(provider, "create_plan")
    }

    pub async fn get_plan(&self, provider: &str, plan_id: &str) -> Result<Plan, OrchestratorError> {
        self.provider_by_name(provider)?
            .provider()
            .get_plan(plan_id)
            .await
            .during(provider, "get_plan")
    }

    pub async fn list_plans(&self, provider: &str) -> Result<Vec<Plan>, OrchestratorError> {
        self.provider_by_name(provider)?
            .provider()
            .list_plans()
            .await
            .during(provider, "list_plans")
    }

    pub async fn delete_plan(&self, provider: &str, plan_id: &str) -> Result<(), OrchestratorError> {
        self.provider_by_name(provider)?
            .provider()
            .delete_plan(plan_id)
            .await
            .during(provider, "delete_plan")
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::events::tests::RecordingListener;
    use crate::models::default_routing;
    use crate::persist::sqlite::SqliteStorage;
    use crate::provider::sandbox::SandboxProvider;
    use crate::provider::PaymentProvider;

    pub(crate) struct Sandboxes {
        pub(crate) stripe: Arc<SandboxProvider>,
        pub(crate) xendit: Arc<SandboxProvider>,
        pub(crate) razorpay: Arc<SandboxProvider>,
    }

    impl Sandboxes {
        pub(crate) fn new() -> Self {
            Self {
                stripe: Arc::new(SandboxProvider::full_featured("stripe", ["USD", "EUR", "GBP"])),
                xendit: Arc::new(SandboxProvider::new(
                    "xendit",
                    ProviderCapabilities::new(["IDR", "PHP", "VND", "THB", "MYR"])
                        .with(Capability::Invoices),
                )),
                razorpay: Arc::new(SandboxProvider::full_featured("razorpay", ["INR", "USD"])),
            }
        }

        pub(crate) fn entries(&self) -> Vec<ProviderEntry> {
            vec![
                self.stripe.entry(),
                ProviderEntry::builder(self.xendit.clone())
                    .invoices()
                    .webhook_secret("xnd_callback_token")
                    .build(),
                self.razorpay.entry(),
            ]
        }
    }

    fn selector_with(
        sandboxes: &Sandboxes,
        mappings: Arc<dyn MappingStore>,
        emitter: Arc<EventEmitter>,
    ) -> MultiProviderSelector {
        MultiProviderSelector::new(
            sandboxes.entries(),
            default_routing(),
            mappings,
            Duration::from_millis(100),
            emitter,
        )
        .unwrap()
    }

    fn selector(sandboxes: &Sandboxes) -> MultiProviderSelector {
        selector_with(
            sandboxes,
            Arc::new(SqliteStorage::new_in_memory().unwrap()),
            Arc::new(EventEmitter::new()),
        )
    }

    fn subscription_request(currency: &str) -> CreateSubscriptionRequest {
        CreateSubscriptionRequest {
            customer_id: "cus_1".to_string(),
            plan_id: "plan_gold".to_string(),
            currency: currency.to_string(),
            trial_days: None,
            idempotency_key: None,
            metadata: HashMap::new(),
        }
    }

    struct FailingMappings;

    impl MappingStore for FailingMappings {
        fn get_by_entity(
            &self,
            _entity_id: &str,
            _entity_type: EntityType,
        ) -> Result<Option<ProviderMapping>, OrchestratorError> {
            Ok(None)
        }

        fn create(&self, _mapping: &ProviderMapping) -> Result<(), OrchestratorError> {
            Err(OrchestratorError::StorageError("disk full".to_string()))
        }
    }

    #[test]
    fn test_rejects_duplicate_provider_names() {
        let sandboxes = Sandboxes::new();
        let mut entries = sandboxes.entries();
        entries.push(sandboxes.stripe.entry());
        let result = MultiProviderSelector::new(
            entries,
            default_routing(),
            Arc::new(SqliteStorage::new_in_memory().unwrap()),
            Duration::from_millis(100),
            Arc::new(EventEmitter::new()),
        );
        assert!(matches!(result, Err(OrchestratorError::Validation(_))));
    }

    #[tokio::test]
    async fn test_routes_by_currency() {
        let sandboxes = Sandboxes::new();
        let selector = selector(&sandboxes);
        for (currency, expected) in [
            ("USD", "stripe"),
            ("eur", "stripe"),
            ("GBP", "stripe"),
            ("IDR", "xendit"),
            ("PHP", "xendit"),
            ("INR", "razorpay"),
        ] {
            let entry = selector.select_by_currency(currency).await.unwrap();
            assert_eq!(entry.name(), expected, "currency {currency}");
        }
    }

    #[tokio::test]
    async fn test_falls_back_when_preferred_unavailable() {
        let sandboxes = Sandboxes::new();
        let selector = selector(&sandboxes);

        sandboxes.stripe.set_available(false);
        let entry = selector.select_by_currency("USD").await.unwrap();
        assert_eq!(entry.name(), "razorpay");

        sandboxes.razorpay.set_available(false);
        let result = selector.select_by_currency("USD").await;
        assert!(matches!(result, Err(OrchestratorError::NoAvailableProvider)));

        // Xendit is up but does not accept USD
        assert_eq!(selector.select_by_currency("IDR").await.unwrap().name(), "xendit");
    }

    #[tokio::test]
    async fn test_slow_probe_counts_as_unavailable() {
        let sandboxes = Sandboxes::new();
        let selector = selector(&sandboxes);
        sandboxes.stripe.set_probe_delay(Duration::from_secs(5));

        let started = Instant::now();
        let entry = selector.select_by_currency("USD").await.unwrap();
        assert_eq!(entry.name(), "razorpay");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_explicit_preference_and_routes() {
        let sandboxes = Sandboxes::new();
        let selector = selector(&sandboxes);

        let entry = selector
            .select_preferred(Some("razorpay"), "USD")
            .await
            .unwrap();
        assert_eq!(entry.name(), "razorpay");

        selector.set_route("usd", "razorpay").unwrap();
        assert_eq!(selector.routed_provider("USD").as_deref(), Some("razorpay"));
        assert_eq!(selector.select_by_currency("USD").await.unwrap().name(), "razorpay");

        assert!(matches!(
            selector.set_route("USD", "paypal"),
            Err(OrchestratorError::ProviderNotAvailable(_))
        ));
    }

    #[tokio::test]
    async fn test_entity_resolves_after_cache_clear_and_restart() {
        let sandboxes = Sandboxes::new();
        let storage = Arc::new(SqliteStorage::new_in_memory().unwrap());
        let selector = selector_with(&sandboxes, storage.clone(), Arc::new(EventEmitter::new()));

        let subscription = selector
            .create_subscription(&subscription_request("IDR"))
            .await
            .unwrap();
        assert_eq!(subscription.provider, "xendit");

        selector.clear_cache();
        let (entry, provider_id) = selector
            .resolve(EntityType::Subscription, &subscription.id)
            .unwrap();
        assert_eq!(entry.name(), "xendit");
        assert_eq!(provider_id, subscription.id);

        // A fresh selector over the same store has an empty cache
        let restarted = selector_with(&sandboxes, storage, Arc::new(EventEmitter::new()));
        let canceled = restarted
            .cancel_subscription(&subscription.id, false)
            .await
            .unwrap();
        assert_eq!(canceled.status, SubscriptionStatus::Canceled);
        assert_eq!(sandboxes.xendit.call_count("cancel_subscription"), 1);
        assert_eq!(sandboxes.stripe.call_count("cancel_subscription"), 0);
    }

    #[tokio::test]
    async fn test_unconfigured_owner_is_never_substituted() {
        let sandboxes = Sandboxes::new();
        let storage = Arc::new(SqliteStorage::new_in_memory().unwrap());
        storage
            .create(&ProviderMapping {
                entity_id: "po_1".to_string(),
                entity_type: EntityType::Payout,
                provider_name: "paypal".to_string(),
                provider_entity_id: "PAYOUT-1".to_string(),
                created_at: 0,
            })
            .unwrap();
        let selector = selector_with(&sandboxes, storage, Arc::new(EventEmitter::new()));

        let result = selector.get_payout("po_1").await;
        assert!(matches!(result, Err(OrchestratorError::ProviderNotAvailable(_))));
        let result = selector.get_payout("po_unknown").await;
        assert!(matches!(result, Err(OrchestratorError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_mapping_write_failure_is_surfaced_not_fatal() {
        let sandboxes = Sandboxes::new();
        let emitter = Arc::new(EventEmitter::new());
        let listener = RecordingListener::default();
        emitter.add_listener(Box::new(listener.clone()));
        let selector = selector_with(&sandboxes, Arc::new(FailingMappings), emitter);

        let payout = selector
            .create_payout(&CreatePayoutRequest {
                customer_id: "cus_1".to_string(),
                amount: 5000,
                currency: "USD".to_string(),
                destination: "acct_1".to_string(),
                idempotency_key: None,
            })
            .await
            .unwrap();
        assert_eq!(payout.provider, "stripe");

        let failures: Vec<_> = listener
            .events()
            .into_iter()
            .filter(|event| matches!(event, OrchestratorEvent::MappingWriteFailed { .. }))
            .collect();
        assert_eq!(failures.len(), 1);

        // Still resolvable from the cache for the life of the process
        assert_eq!(selector.get_payout(&payout.id).await.unwrap().id, payout.id);
    }

    #[tokio::test]
    async fn test_capability_selection() {
        let sandboxes = Sandboxes::new();
        let selector = selector(&sandboxes);

        // Xendit is routed for IDR but declares no payouts
        let result = selector
            .select_for_capability(Capability::Payouts, Some("IDR"))
            .await;
        assert!(matches!(result, Err(OrchestratorError::NoAvailableProvider)));

        let entry = selector
            .select_for_capability(Capability::Invoices, Some("IDR"))
            .await
            .unwrap();
        assert_eq!(entry.name(), "xendit");

        assert!(selector.supports(Capability::Balance));
        assert!(matches!(
            selector.get_balance("xendit").await,
            Err(OrchestratorError::NotSupported { .. })
        ));
        assert_eq!(selector.get_balance("stripe").await.unwrap().provider, "stripe");
    }

    #[tokio::test]
    async fn test_fan_out_skips_failing_providers() {
        let sandboxes = Sandboxes::new();
        let selector = selector(&sandboxes);

        selector
            .create_subscription(&subscription_request("USD"))
            .await
            .unwrap();
        selector
            .create_subscription(&subscription_request("INR"))
            .await
            .unwrap();
        assert_eq!(selector.list_subscriptions("cus_1").await.unwrap().len(), 2);

        sandboxes
            .razorpay
            .fail_next("list_subscriptions", ProviderError::unavailable("502"));
        let subscriptions = selector.list_subscriptions("cus_1").await.unwrap();
        assert_eq!(subscriptions.len(), 1);
        assert_eq!(subscriptions[0].provider, "stripe");

        let result = selector.list_subscriptions("cus_nobody").await;
        assert!(matches!(result, Err(OrchestratorError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_registered_dispute_routes_to_owner() {
        let sandboxes = Sandboxes::new();
        let selector = selector(&sandboxes);
        let charge = sandboxes
            .razorpay
            .charge(&crate::models::ChargeRequest::new(900, "INR", "pm_upi", "cus_1"))
            .await
            .unwrap();
        let dispute = sandboxes.razorpay.open_dispute(&charge.id, "fraudulent").unwrap();

        selector
            .register_entity(EntityType::Dispute, &dispute.id, "razorpay", &dispute.id)
            .unwrap();
        let closed = selector.close_dispute(&dispute.id).await.unwrap();
        assert_eq!(closed.provider, "razorpay");

        // Re-registering with the same owner is a no-op, a different owner is refused
        selector
            .register_entity(EntityType::Dispute, &dispute.id, "razorpay", &dispute.id)
            .unwrap();
        assert!(matches!(
            selector.register_entity(EntityType::Dispute, &dispute.id, "stripe", &dispute.id),
            Err(OrchestratorError::AlreadyExists(_))
        ));

        // The refused owner never reaches the cache
        let (owner, _) = selector.resolve(EntityType::Dispute, &dispute.id).unwrap();
        assert_eq!(owner.name(), "razorpay");
        let closed = selector.close_dispute(&dispute.id).await.unwrap();
        assert_eq!(closed.provider, "razorpay");
        assert_eq!(sandboxes.stripe.call_count("close_dispute"), 0);
        assert_eq!(sandboxes.razorpay.call_count("close_dispute"), 2);
    }

    #[tokio::test]
    async fn test_conflicting_registration_refills_cache_from_store() {
        let sandboxes = Sandboxes::new();
        let store = Arc::new(SqliteStorage::new_in_memory().unwrap());
        let selector = selector_with(&sandboxes, store.clone(), Arc::new(EventEmitter::new()));
        selector
            .register_entity(EntityType::Dispute, "dp_1", "razorpay", "dp_rzp_1")
            .unwrap();
        selector.clear_cache();

        assert!(selector
            .register_entity(EntityType::Dispute, "dp_1", "stripe", "dp_str_1")
            .is_err());
        let (owner, provider_entity_id) = selector.resolve(EntityType::Dispute, "dp_1").unwrap();
        assert_eq!(owner.name(), "razorpay");
        assert_eq!(provider_entity_id, "dp_rzp_1");
        assert_eq!(
            store
                .get_by_entity("dp_1", EntityType::Dispute)
                .unwrap()
                .unwrap()
                .provider_name,
            "razorpay"
        );
    }

    #[test]
    fn test_webhook_verification_per_provider() {
        let sandboxes = Sandboxes::new();
        let selector = selector(&sandboxes);
        let payload = br#"{"event":"invoice.paid"}"#;
        let signature = crate::webhook::WebhookVerifier::new("xendit", "xnd_callback_token")
            .sign(payload)
            .unwrap();

        selector.verify_webhook("xendit", payload, &signature).unwrap();
        assert!(matches!(
            selector.verify_webhook("stripe", payload, &signature),
            Err(OrchestratorError::InvalidSignature)
        ));
        assert!(matches!(
            selector.verify_webhook("paypal", payload, &signature),
            Err(OrchestratorError::ProviderNotAvailable(_))
        ));
    }

    #[tokio::test]
    async fn test_provider_statuses() {
        let sandboxes = Sandboxes::new();
        let selector = selector(&sandboxes);
        sandboxes.xendit.set_available(false);

        let statuses = selector.provider_statuses().await;
        let names: Vec<_> = statuses.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["stripe", "xendit", "razorpay"]);
        assert!(statuses[0].available);
        assert!(!statuses[1].available);
        assert!(statuses[1].webhooks_configured);
    }
}
