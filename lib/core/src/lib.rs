pub mod circuit_breaker;
pub mod context;
pub mod error;
pub mod events;
mod logger;
pub mod models;
pub mod orchestrator_builder;
pub mod persist;
pub mod provider;
pub mod retry;
pub mod selector;
pub mod service;
pub mod webhook;

use circuit_breaker::CircuitBreakerStats;
use log::{error, info, warn};
use persist::{MappingStore, PaymentRepository};
use provider::ProviderEntry;
use selector::{MultiProviderSelector, ProviderStatus};
use service::PaymentService;
use std::{collections::HashSet, sync::Arc, time::Duration};
use tokio::sync::watch;

pub use context::{CancelHandle, Context};
pub use error::{OrchestratorError, ProviderError, ProviderErrorKind};
pub use events::{EventEmitter, EventListener, OrchestratorEvent, Severity};
pub use models::{
    ChargeOutcome, ChargeRequest, ChargeResponse, Config, EntityType, ListPaymentsRequest,
    Payment, PaymentStatus, Refund, RefundRequest, RefundStatus,
};
pub use orchestrator_builder::OrchestratorBuilder;
pub use provider::{Capability, PaymentProvider, ProviderCapabilities};

const REFRESH_PAGE_SIZE: u32 = 100;

/// Entry point tying provider selection and the payment service together
#[derive(Clone)]
pub struct PaymentOrchestrator {
    config: Config,
    selector: Arc<MultiProviderSelector>,
    payments: Arc<PaymentService>,
    event_emitter: Arc<EventEmitter>,
    shutdown_sender: watch::Sender<()>,
    shutdown_receiver: watch::Receiver<()>,
}

impl PaymentOrchestrator {
    /// Creates an orchestrator over the given providers and stores
    ///
    /// Most callers go through [OrchestratorBuilder] instead.
    pub fn new(
        config: Config,
        providers: Vec<ProviderEntry>,
        mapping_store: Arc<dyn MappingStore>,
        repository: Arc<dyn PaymentRepository>,
        event_emitter: Arc<EventEmitter>,
    ) -> Result<Self, OrchestratorError> {
        let selector = Arc::new(MultiProviderSelector::new(
            providers,
            config.routing.clone(),
            mapping_store,
            Duration::from_millis(config.probe_timeout_ms),
            event_emitter.clone(),
        )?);
        let payments = Arc::new(PaymentService::new(
            selector.clone(),
            repository,
            &config,
            event_emitter.clone(),
        ));
        let (shutdown_sender, shutdown_receiver) = watch::channel(());

        Ok(Self {
            config,
            selector,
            payments,
            event_emitter,
            shutdown_sender,
            shutdown_receiver,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Provider selection, entity routing and the non-payment entity operations
    pub fn selector(&self) -> &Arc<MultiProviderSelector> {
        &self.selector
    }

    pub fn payments(&self) -> &Arc<PaymentService> {
        &self.payments
    }

    /// Registers a listener to receive orchestrator events
    ///
    /// # Returns
    ///
    /// A unique identifier for the listener, which can be used to remove it later
    pub fn add_event_listener(&self, listener: Box<dyn EventListener>) -> String {
        self.event_emitter.add_listener(listener)
    }

    /// Removes a previously registered event listener
    ///
    /// # Returns
    ///
    /// `true` if the listener was found and removed, `false` otherwise
    pub fn remove_event_listener(&self, id: &str) -> bool {
        self.event_emitter.remove_listener(id)
    }

    /// Starts the periodic refresh of in-flight payments
    ///
    /// Does nothing when `status_refresh_interval_secs` is 0.
    pub fn start(&self) {
        if self.config.status_refresh_interval_secs == 0 {
            info!("Status refresh disabled");
            return;
        }
        self.periodic_refresh(Duration::from_secs(self.config.status_refresh_interval_secs));
    }

    fn periodic_refresh(&self, period: Duration) {
        let orchestrator = self.clone();
        let mut shutdown_receiver = orchestrator.shutdown_receiver.clone();
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_receiver.changed() => {
                        info!("Status refresh loop shutdown signal received");
                        return;
                    }
                    _ = interval.tick() => {
                        let ctx = Context::background().with_timeout(period);
                        if let Err(e) = orchestrator.refresh_in_flight_payments(&ctx).await {
                            error!("Periodic status refresh failed: {e}");
                        }
                    }
                }
            }
        });
    }

    /// Stops the background tasks started by [PaymentOrchestrator::start]
    pub fn stop(&self) -> Result<(), OrchestratorError> {
        self.shutdown_sender
            .send(())
            .map_err(|_| OrchestratorError::GenericError("Failed to send shutdown signal".into()))
    }

    /// Asks the owning provider for the status of every in-flight payment
    ///
    /// The in-flight set is read in full before any provider is called, so
    /// payments created during the refresh are left for the next one.
    ///
    /// # Returns
    ///
    /// The number of payments whose status changed
    pub async fn refresh_in_flight_payments(
        &self,
        ctx: &Context,
    ) -> Result<usize, OrchestratorError> {
        self.refresh_in_flight(ctx, REFRESH_PAGE_SIZE).await
    }

    async fn refresh_in_flight(
        &self,
        ctx: &Context,
        page_size: u32,
    ) -> Result<usize, OrchestratorError> {
        let in_flight = self.in_flight_snapshot(page_size)?;
        let mut changed = 0;
        for payment in in_flight {
            if let Some(err) = ctx.err() {
                return Err(err);
            }
            match self.payments.sync_payment_status(ctx, &payment.id).await {
                Ok(updated) if updated.status != payment.status => changed += 1,
                Ok(_) => {}
                Err(e) => warn!("Could not refresh payment {}: {e}", payment.id),
            }
        }
        if changed > 0 {
            info!("Status refresh updated {changed} payments");
        }
        Ok(changed)
    }

    /// In-flight payments, each listed once even when inserts shift the pages
    fn in_flight_snapshot(&self, page_size: u32) -> Result<Vec<Payment>, OrchestratorError> {
        let mut seen = HashSet::new();
        let mut in_flight = Vec::new();
        let mut offset = 0;
        loop {
            let page = self.payments.list_payments(&ListPaymentsRequest {
                offset,
                limit: page_size,
            })?;
            let last_page = (page.len() as u32) < page_size;
            for payment in page {
                if payment.status.is_in_flight() && seen.insert(payment.id.clone()) {
                    in_flight.push(payment);
                }
            }
            if last_page {
                break;
            }
            offset += page_size;
        }
        Ok(in_flight)
    }

    pub async fn create_charge(
        &self,
        ctx: &Context,
        request: ChargeRequest,
    ) -> Result<ChargeOutcome, OrchestratorError> {
        self.payments.create_charge(ctx, request).await
    }

    pub async fn create_refund(
        &self,
        ctx: &Context,
        request: RefundRequest,
    ) -> Result<Refund, OrchestratorError> {
        self.payments.create_refund(ctx, request).await
    }

    pub async fn capture_payment(
        &self,
        ctx: &Context,
        payment_id: &str,
        amount: Option<u64>,
    ) -> Result<Payment, OrchestratorError> {
        self.payments.capture_payment(ctx, payment_id, amount).await
    }

    pub async fn void_payment(
        &self,
        ctx: &Context,
        payment_id: &str,
    ) -> Result<Payment, OrchestratorError> {
        self.payments.void_payment(ctx, payment_id).await
    }

    pub fn get_payment(&self, payment_id: &str) -> Result<Payment, OrchestratorError> {
        self.payments.get_payment(payment_id)
    }

    /// Lists payments, newest first
    pub fn list_payments(
        &self,
        request: &ListPaymentsRequest,
    ) -> Result<Vec<Payment>, OrchestratorError> {
        self.payments.list_payments(request)
    }

    pub fn list_refunds(&self, payment_id: &str) -> Result<Vec<Refund>, OrchestratorError> {
        self.payments.list_refunds(payment_id)
    }

    /// Probes every provider and reports its capabilities
    pub async fn provider_statuses(&self) -> Vec<ProviderStatus> {
        self.selector.provider_statuses().await
    }

    pub fn breaker_stats(&self) -> Vec<CircuitBreakerStats> {
        self.payments.breakers().stats()
    }

    pub fn verify_webhook(
        &self,
        provider: &str,
        payload: &[u8],
        signature: &str,
    ) -> Result<(), OrchestratorError> {
        self.selector.verify_webhook(provider, payload, signature)
    }

    /// Initializes the orchestrator's file logger
    ///
    /// Records go to `payorch.log` in `log_dir` and are forwarded to
    /// `app_logger` when one is given. Fails if a global logger is already
    /// configured.
    pub fn init_logging(
        log_dir: &str,
        app_logger: Option<Box<dyn log::Log>>,
    ) -> anyhow::Result<()> {
        crate::logger::OrchestratorLogger::init(log_dir, log::LevelFilter::Debug, app_logger)
    }
}
