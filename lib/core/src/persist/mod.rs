pub mod sqlite;

use std::future::Future;

use crate::error::OrchestratorError;
use crate::models::{EntityType, Payment, ProviderMapping, Refund};

/// Durable record of which provider originated each entity
pub trait MappingStore: Send + Sync {
    /// Returns the mapping for `(entity_id, entity_type)`, if one exists
    fn get_by_entity(
        &self,
        entity_id: &str,
        entity_type: EntityType,
    ) -> Result<Option<ProviderMapping>, OrchestratorError>;

    /// Stores a new mapping, failing with `AlreadyExists` when the entity is
    /// already mapped
    fn create(&self, mapping: &ProviderMapping) -> Result<(), OrchestratorError>;
}

/// A write staged inside a [Transaction]
#[derive(Clone, Debug, PartialEq)]
pub enum WriteOp {
    CreatePayment(Payment),
    UpdatePayment(Payment),
    CreateRefund(Refund),
}

/// Writes staged by a unit of work, applied all together by
/// [PaymentRepository::commit] or not at all
#[derive(Clone, Debug, Default)]
pub struct Transaction {
    ops: Vec<WriteOp>,
}

impl Transaction {
    pub fn create_payment(&mut self, payment: Payment) {
        self.ops.push(WriteOp::CreatePayment(payment));
    }

    pub fn update_payment(&mut self, payment: Payment) {
        self.ops.push(WriteOp::UpdatePayment(payment));
    }

    pub fn create_refund(&mut self, refund: Refund) {
        self.ops.push(WriteOp::CreateRefund(refund));
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Storage of payments and refunds
pub trait PaymentRepository: Send + Sync {
    fn get_payment(&self, id: &str) -> Result<Option<Payment>, OrchestratorError>;

    fn get_payment_by_provider_charge_id(
        &self,
        provider: &str,
        provider_charge_id: &str,
    ) -> Result<Option<Payment>, OrchestratorError>;

    fn get_payment_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Payment>, OrchestratorError>;

    /// List payments with pagination, newest first
    fn list_payments(&self, offset: u32, limit: u32) -> Result<Vec<Payment>, OrchestratorError>;

    fn get_refund(&self, id: &str) -> Result<Option<Refund>, OrchestratorError>;

    fn list_refunds(&self, payment_id: &str) -> Result<Vec<Refund>, OrchestratorError>;

    /// Applies every staged write atomically
    fn commit(&self, tx: Transaction) -> Result<(), OrchestratorError>;

    fn begin(&self) -> Transaction {
        Transaction::default()
    }

    fn create_payment(&self, payment: &Payment) -> Result<(), OrchestratorError> {
        let mut tx = self.begin();
        tx.create_payment(payment.clone());
        self.commit(tx)
    }

    fn update_payment(&self, payment: &Payment) -> Result<(), OrchestratorError> {
        let mut tx = self.begin();
        tx.update_payment(payment.clone());
        self.commit(tx)
    }

    fn create_refund(&self, refund: &Refund) -> Result<(), OrchestratorError> {
        let mut tx = self.begin();
        tx.create_refund(refund.clone());
        self.commit(tx)
    }
}

/// Runs `operation` against a fresh unit of work and commits what it staged
///
/// The operation hands the transaction back alongside its value. If it
/// fails, nothing it staged is written.
pub async fn with_transaction<R, T, F, Fut>(
    repository: &R,
    operation: F,
) -> Result<T, OrchestratorError>
where
    R: PaymentRepository + ?Sized,
    F: FnOnce(Transaction) -> Fut,
    Fut: Future<Output = Result<(T, Transaction), OrchestratorError>>,
{
    let tx = repository.begin();
    let (value, tx) = operation(tx).await?;
    repository.commit(tx)?;
    Ok(value)
}
