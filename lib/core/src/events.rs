use crate::circuit_breaker::CircuitState;
use crate::models::{EntityType, Payment, Refund};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// How urgently an event needs a human
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Enum representing orchestrator events, alerts and metric samples
#[derive(Clone, Debug)]
pub enum OrchestratorEvent {
    /// A charge was persisted locally
    ChargeSucceeded { payment: Payment },

    /// The provider declined the charge or the call failed
    ChargeFailed {
        provider: Option<String>,
        error: String,
    },

    RefundSucceeded { refund: Refund },

    /// One provider call finished, successfully or not
    ProviderCall {
        provider: String,
        operation: String,
        success: bool,
        elapsed_ms: u64,
    },

    /// A provider call was abandoned at the caller's deadline and may still
    /// complete at the provider; reconcile it by its idempotency key
    ProviderCallAbandoned {
        provider: String,
        operation: String,
        idempotency_key: Option<String>,
        error: String,
    },

    CircuitStateChanged {
        breaker: String,
        from: CircuitState,
        to: CircuitState,
    },

    /// The entity exists at the provider but its durable mapping is missing
    MappingWriteFailed {
        entity_type: EntityType,
        entity_id: String,
        provider: String,
        error: String,
    },

    /// A charge without a local record was reversed
    CompensationSucceeded {
        provider: String,
        provider_charge_id: String,
        amount: u64,
    },

    /// Money was charged, no local record exists and the reversal failed
    CompensationFailed {
        provider: String,
        provider_charge_id: String,
        amount: u64,
        currency: String,
        error: String,
    },

    /// The provider refunded but the local records could not be updated
    RefundPersistenceFailed {
        payment_id: String,
        provider: String,
        provider_refund_id: String,
        error: String,
    },
}

impl OrchestratorEvent {
    pub fn severity(&self) -> Severity {
        match self {
            OrchestratorEvent::ChargeSucceeded { .. }
            | OrchestratorEvent::RefundSucceeded { .. }
            | OrchestratorEvent::ProviderCall { .. } => Severity::Info,
            OrchestratorEvent::ChargeFailed { .. }
            | OrchestratorEvent::CircuitStateChanged { .. }
            | OrchestratorEvent::ProviderCallAbandoned { .. }
            | OrchestratorEvent::CompensationSucceeded { .. } => Severity::Warning,
            OrchestratorEvent::MappingWriteFailed { .. }
            | OrchestratorEvent::CompensationFailed { .. }
            | OrchestratorEvent::RefundPersistenceFailed { .. } => Severity::Critical,
        }
    }
}

/// Trait for event listeners
pub trait EventListener: Send + Sync {
    /// Called when an event occurs
    fn on_event(&self, event: &OrchestratorEvent);
}

/// Event emitter shared by the selector, the payment service and the breakers
pub struct EventEmitter {
    listeners: Mutex<HashMap<String, Box<dyn EventListener>>>,
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventEmitter {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
        }
    }

    fn listeners(&self) -> MutexGuard<'_, HashMap<String, Box<dyn EventListener>>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds a listener to the event emitter
    ///
    /// # Returns
    ///
    /// A unique ID for the listener
    pub fn add_listener(&self, listener: Box<dyn EventListener>) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.listeners().insert(id.clone(), listener);
        id
    }

    /// Removes a listener, returning `true` if it was registered
    pub fn remove_listener(&self, id: &str) -> bool {
        self.listeners().remove(id).is_some()
    }

    /// Emits an event to all listeners
    pub fn emit(&self, event: &OrchestratorEvent) {
        let listeners = self.listeners();
        for listener in listeners.values() {
            listener.on_event(event);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;

    /// Listener collecting every event it sees
    #[derive(Clone, Default)]
    pub(crate) struct RecordingListener {
        pub(crate) events: Arc<Mutex<Vec<OrchestratorEvent>>>,
    }

    impl RecordingListener {
        pub(crate) fn events(&self) -> Vec<OrchestratorEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl EventListener for RecordingListener {
        fn on_event(&self, event: &OrchestratorEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn test_add_emit_remove() {
        let emitter = EventEmitter::new();
        let listener = RecordingListener::default();
        let id = emitter.add_listener(Box::new(listener.clone()));

        emitter.emit(&OrchestratorEvent::ChargeFailed {
            provider: None,
            error: "no provider".to_string(),
        });
        assert_eq!(listener.events().len(), 1);

        assert!(emitter.remove_listener(&id));
        assert!(!emitter.remove_listener(&id));
        emitter.emit(&OrchestratorEvent::ChargeFailed {
            provider: None,
            error: "no provider".to_string(),
        });
        assert_eq!(listener.events().len(), 1);
    }

    #[test]
    fn test_compensation_failure_is_critical() {
        let event = OrchestratorEvent::CompensationFailed {
            provider: "stripe".to_string(),
            provider_charge_id: "ch_1".to_string(),
            amount: 2500,
            currency: "USD".to_string(),
            error: "timeout".to_string(),
        };
        assert_eq!(event.severity(), Severity::Critical);
    }
}
