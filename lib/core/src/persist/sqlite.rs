use crate::error::OrchestratorError;
use crate::models::{EntityType, Payment, PaymentStatus, ProviderMapping, Refund, RefundStatus};
use crate::persist::{MappingStore, PaymentRepository, Transaction, WriteOp};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

const PAYMENT_COLUMNS: &str = "id, amount, currency, status, provider, provider_charge_id,
    customer_id, payment_method, idempotency_key, description, amount_captured,
    created_at, updated_at";

const REFUND_COLUMNS: &str =
    "id, payment_id, amount, currency, status, provider, provider_refund_id, reason, created_at";

/// SQLite implementation of the mapping store and the payment repository
pub struct SqliteStorage {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Creates a new SQLite storage instance
    ///
    /// # Arguments
    ///
    /// * `db_path` - Path to the SQLite database file
    pub fn new(db_path: &Path) -> Result<Self, OrchestratorError> {
        let connection = Connection::open(db_path)?;
        let storage = Self {
            connection: Arc::new(Mutex::new(connection)),
        };
        storage.init()?;
        Ok(storage)
    }

    /// Creates a new in-memory SQLite storage instance for testing
    pub fn new_in_memory() -> Result<Self, OrchestratorError> {
        let connection = Connection::open_in_memory()?;
        let storage = Self {
            connection: Arc::new(Mutex::new(connection)),
        };
        storage.init()?;
        Ok(storage)
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>, OrchestratorError> {
        self.connection
            .lock()
            .map_err(|_| OrchestratorError::StorageError("Failed to lock connection".to_string()))
    }

    fn init(&self) -> Result<(), OrchestratorError> {
        let connection = self.connection()?;

        connection.execute_batch(
            "CREATE TABLE IF NOT EXISTS payments (
                id TEXT PRIMARY KEY,
                amount INTEGER NOT NULL,
                currency TEXT NOT NULL,
                status TEXT NOT NULL,
                provider TEXT NOT NULL,
                provider_charge_id TEXT NOT NULL,
                customer_id TEXT NOT NULL,
                payment_method TEXT NOT NULL,
                idempotency_key TEXT UNIQUE,
                description TEXT,
                amount_captured INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS payments_provider_charge
                ON payments (provider, provider_charge_id);

            CREATE TABLE IF NOT EXISTS refunds (
                id TEXT PRIMARY KEY,
                payment_id TEXT NOT NULL,
                amount INTEGER NOT NULL,
                currency TEXT NOT NULL,
                status TEXT NOT NULL,
                provider TEXT NOT NULL,
                provider_refund_id TEXT NOT NULL,
                reason TEXT,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS refunds_payment ON refunds (payment_id);

            CREATE TABLE IF NOT EXISTS provider_mappings (
                entity_id TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                provider_name TEXT NOT NULL,
                provider_entity_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (entity_id, entity_type)
            );",
        )?;

        Ok(())
    }

    fn query_payment(
        &self,
        filter: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Option<Payment>, OrchestratorError> {
        let connection = self.connection()?;
        let mut stmt =
            connection.prepare(&format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE {filter}"))?;
        Ok(stmt.query_row(params, payment_from_row).optional()?)
    }
}

fn parse_column<T>(row: &Row<'_>, idx: usize, what: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
{
    let value: String = row.get(idx)?;
    value
        .parse()
        .map_err(|_| rusqlite::Error::InvalidColumnType(idx, format!("Invalid {what}"), Type::Text))
}

fn payment_from_row(row: &Row<'_>) -> rusqlite::Result<Payment> {
    let status: PaymentStatus = parse_column(row, 3, "payment status")?;
    Ok(Payment {
        id: row.get(0)?,
        amount: row.get(1)?,
        currency: row.get(2)?,
        status,
        provider: row.get(4)?,
        provider_charge_id: row.get(5)?,
        customer_id: row.get(6)?,
        payment_method: row.get(7)?,
        idempotency_key: row.get(8)?,
        description: row.get(9)?,
        amount_captured: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

fn refund_from_row(row: &Row<'_>) -> rusqlite::Result<Refund> {
    let status: RefundStatus = parse_column(row, 4, "refund status")?;
    Ok(Refund {
        id: row.get(0)?,
        payment_id: row.get(1)?,
        amount: row.get(2)?,
        currency: row.get(3)?,
        status,
        provider: row.get(5)?,
        provider_refund_id: row.get(6)?,
        reason: row.get(7)?,
        created_at: row.get(8)?,
    })
}

/// Maps unique key violations to `AlreadyExists`
fn write_error(err: rusqlite::Error, what: &str) -> OrchestratorError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            OrchestratorError::AlreadyExists(what.to_string())
        }
        _ => err.into(),
    }
}

fn apply(tx: &rusqlite::Transaction<'_>, op: &WriteOp) -> Result<(), OrchestratorError> {
    match op {
        WriteOp::CreatePayment(payment) => {
            tx.execute(
                &format!(
                    "INSERT INTO payments ({PAYMENT_COLUMNS})
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
                ),
                params![
                    payment.id,
                    payment.amount,
                    payment.currency,
                    payment.status.as_str(),
                    payment.provider,
                    payment.provider_charge_id,
                    payment.customer_id,
                    payment.payment_method,
                    payment.idempotency_key,
                    payment.description,
                    payment.amount_captured,
                    payment.created_at,
                    payment.updated_at,
                ],
            )
            .map_err(|e| write_error(e, &format!("payment {}", payment.id)))?;
        }
        WriteOp::UpdatePayment(payment) => {
            let updated = tx.execute(
                "UPDATE payments
                 SET status = ?, amount_captured = ?, description = ?, updated_at = ?
                 WHERE id = ?",
                params![
                    payment.status.as_str(),
                    payment.amount_captured,
                    payment.description,
                    payment.updated_at,
                    payment.id,
                ],
            )?;
            if updated == 0 {
                return Err(OrchestratorError::NotFound(format!("payment {}", payment.id)));
            }
        }
        WriteOp::CreateRefund(refund) => {
            tx.execute(
                &format!("INSERT INTO refunds ({REFUND_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"),
                params![
                    refund.id,
                    refund.payment_id,
                    refund.amount,
                    refund.currency,
                    refund.status.to_string(),
                    refund.provider,
                    refund.provider_refund_id,
                    refund.reason,
                    refund.created_at,
                ],
            )
            .map_err(|e| write_error(e, &format!("refund {}", refund.id)))?;
        }
    }
    Ok(())
}

impl PaymentRepository for SqliteStorage {
    fn get_payment(&self, id: &str) -> Result<Option<Payment>, OrchestratorError> {
        self.query_payment("id = ?", &[&id])
    }

    fn get_payment_by_provider_charge_id(
        &self,
        provider: &str,
        provider_charge_id: &str,
    ) -> Result<Option<Payment>, OrchestratorError> {
        self.query_payment(
            "provider = ? AND provider_charge_id = ?",
            &[&provider, &provider_charge_id],
        )
    }

    fn get_payment_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Payment>, OrchestratorError> {
        self.query_payment("idempotency_key = ?", &[&key])
    }

    fn list_payments(&self, offset: u32, limit: u32) -> Result<Vec<Payment>, OrchestratorError> {
        let connection = self.connection()?;

        let mut stmt = connection.prepare(&format!(
            "SELECT {PAYMENT_COLUMNS}
             FROM payments
             ORDER BY created_at DESC, rowid DESC
             LIMIT ? OFFSET ?"
        ))?;

        let payments = stmt
            .query_map(params![limit, offset], payment_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(payments)
    }

    fn get_refund(&self, id: &str) -> Result<Option<Refund>, OrchestratorError> {
        let connection = self.connection()?;
        let mut stmt =
            connection.prepare(&format!("SELECT {REFUND_COLUMNS} FROM refunds WHERE id = ?"))?;
        Ok(stmt.query_row(params![id], refund_from_row).optional()?)
    }

    fn list_refunds(&self, payment_id: &str) -> Result<Vec<Refund>, OrchestratorError> {
        let connection = self.connection()?;
        let mut stmt = connection.prepare(&format!(
            "SELECT {REFUND_COLUMNS} FROM refunds WHERE payment_id = ? ORDER BY created_at, rowid"
        ))?;
        let refunds = stmt
            .query_map(params![payment_id], refund_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(refunds)
    }

    fn commit(&self, tx: Transaction) -> Result<(), OrchestratorError> {
        if tx.is_empty() {
            return Ok(());
        }
        let mut connection = self.connection()?;

        // Dropping the sqlite transaction on an early return rolls it back
        let sql_tx = connection.transaction()?;
        for op in tx.ops() {
            apply(&sql_tx, op)?;
        }
        sql_tx.commit()?;

        Ok(())
    }
}

impl MappingStore for SqliteStorage {
    fn get_by_entity(
        &self,
        entity_id: &str,
        entity_type: EntityType,
    ) -> Result<Option<ProviderMapping>, OrchestratorError> {
        let connection = self.connection()?;
        let mut stmt = connection.prepare(
            "SELECT entity_id, entity_type, provider_name, provider_entity_id, created_at
             FROM provider_mappings
             WHERE entity_id = ? AND entity_type = ?",
        )?;

        let mapping = stmt
            .query_row(params![entity_id, entity_type.as_str()], |row| {
                Ok(ProviderMapping {
                    entity_id: row.get(0)?,
                    entity_type: parse_column(row, 1, "entity type")?,
                    provider_name: row.get(2)?,
                    provider_entity_id: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })
            .optional()?;
        Ok(mapping)
    }

    fn create(&self, mapping: &ProviderMapping) -> Result<(), OrchestratorError> {
        let connection = self.connection()?;
        connection
            .execute(
                "INSERT INTO provider_mappings (
                    entity_id, entity_type, provider_name, provider_entity_id, created_at
                ) VALUES (?, ?, ?, ?, ?)",
                params![
                    mapping.entity_id,
                    mapping.entity_type.as_str(),
                    mapping.provider_name,
                    mapping.provider_entity_id,
                    mapping.created_at,
                ],
            )
            .map_err(|e| {
                write_error(
                    e,
                    &format!("{} mapping {}", mapping.entity_type, mapping.entity_id),
                )
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_payment(id: &str, status: PaymentStatus, created_at: i64) -> Payment {
        Payment {
            id: id.to_string(),
            amount: 2500,
            currency: "USD".to_string(),
            status,
            provider: "stripe".to_string(),
            provider_charge_id: format!("ch_{id}"),
            customer_id: "cus_1".to_string(),
            payment_method: "pm_card_visa".to_string(),
            idempotency_key: Some(format!("key_{id}")),
            description: Some("Test payment".to_string()),
            amount_captured: 2500,
            created_at,
            updated_at: created_at,
        }
    }

    fn create_test_refund(id: &str, payment_id: &str) -> Refund {
        Refund {
            id: id.to_string(),
            payment_id: payment_id.to_string(),
            amount: 1000,
            currency: "USD".to_string(),
            status: RefundStatus::Succeeded,
            provider: "stripe".to_string(),
            provider_refund_id: format!("re_{id}"),
            reason: None,
            created_at: 1_620_000_100,
        }
    }

    #[test]
    fn test_save_and_get_payment() {
        let storage = SqliteStorage::new_in_memory().unwrap();
        let payment = create_test_payment("pay_1", PaymentStatus::Success, 1_620_000_000);
        storage.create_payment(&payment).unwrap();

        let retrieved = storage.get_payment("pay_1").unwrap().unwrap();
        assert_eq!(payment, retrieved);

        let by_key = storage
            .get_payment_by_idempotency_key("key_pay_1")
            .unwrap()
            .unwrap();
        assert_eq!(by_key.id, "pay_1");

        let by_charge = storage
            .get_payment_by_provider_charge_id("stripe", "ch_pay_1")
            .unwrap()
            .unwrap();
        assert_eq!(by_charge.id, "pay_1");
        assert!(storage
            .get_payment_by_provider_charge_id("xendit", "ch_pay_1")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_get_nonexistent_payment() {
        let storage = SqliteStorage::new_in_memory().unwrap();
        assert!(storage.get_payment("nonexistent_id").unwrap().is_none());
        assert!(storage.get_refund("nonexistent_id").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_idempotency_key_rejected() {
        let storage = SqliteStorage::new_in_memory().unwrap();
        let first = create_test_payment("pay_1", PaymentStatus::Success, 1);
        let mut second = create_test_payment("pay_2", PaymentStatus::Success, 2);
        second.idempotency_key = first.idempotency_key.clone();

        storage.create_payment(&first).unwrap();
        let result = storage.create_payment(&second);
        assert!(matches!(result, Err(OrchestratorError::AlreadyExists(_))));
        assert!(storage.get_payment("pay_2").unwrap().is_none());
    }

    #[test]
    fn test_list_payments() {
        let storage = SqliteStorage::new_in_memory().unwrap();
        for (i, id) in ["pay_a", "pay_b", "pay_c"].iter().enumerate() {
            storage
                .create_payment(&create_test_payment(id, PaymentStatus::Success, i as i64))
                .unwrap();
        }

        let all_payments = storage.list_payments(0, 10).unwrap();
        assert_eq!(3, all_payments.len());
        assert_eq!("pay_c", all_payments[0].id);

        let first_page = storage.list_payments(0, 2).unwrap();
        assert_eq!(2, first_page.len());

        let second_page = storage.list_payments(2, 2).unwrap();
        assert_eq!(1, second_page.len());
        assert_eq!("pay_a", second_page[0].id);
    }

    #[test]
    fn test_commit_is_atomic() {
        let storage = SqliteStorage::new_in_memory().unwrap();
        let mut payment = create_test_payment("pay_1", PaymentStatus::Success, 1);
        storage.create_payment(&payment).unwrap();
        storage
            .create_refund(&create_test_refund("ref_1", "pay_1"))
            .unwrap();

        // The duplicate refund id fails the second write, so the update rolls back
        payment.status = PaymentStatus::Refunded;
        let mut tx = storage.begin();
        tx.update_payment(payment.clone());
        tx.create_refund(create_test_refund("ref_1", "pay_1"));
        assert!(storage.commit(tx).is_err());
        assert_eq!(
            storage.get_payment("pay_1").unwrap().unwrap().status,
            PaymentStatus::Success
        );

        let mut tx = storage.begin();
        tx.update_payment(payment);
        tx.create_refund(create_test_refund("ref_2", "pay_1"));
        storage.commit(tx).unwrap();
        assert_eq!(
            storage.get_payment("pay_1").unwrap().unwrap().status,
            PaymentStatus::Refunded
        );
        let refunds = storage.list_refunds("pay_1").unwrap();
        assert_eq!(2, refunds.len());
        assert_eq!(storage.get_refund("ref_2").unwrap().unwrap(), refunds[1]);
    }

    #[test]
    fn test_update_missing_payment() {
        let storage = SqliteStorage::new_in_memory().unwrap();
        let payment = create_test_payment("pay_missing", PaymentStatus::Success, 1);
        let result = storage.update_payment(&payment);
        assert!(matches!(result, Err(OrchestratorError::NotFound(_))));
    }

    #[test]
    fn test_mapping_round_trip_and_uniqueness() {
        let storage = SqliteStorage::new_in_memory().unwrap();
        let mapping = ProviderMapping {
            entity_id: "sub_1".to_string(),
            entity_type: EntityType::Subscription,
            provider_name: "xendit".to_string(),
            provider_entity_id: "xnd_sub_1".to_string(),
            created_at: 1_620_000_000,
        };
        storage.create(&mapping).unwrap();

        let found = storage
            .get_by_entity("sub_1", EntityType::Subscription)
            .unwrap();
        assert_eq!(Some(mapping.clone()), found);
        assert!(storage
            .get_by_entity("sub_1", EntityType::Payment)
            .unwrap()
            .is_none());

        let duplicate = storage.create(&ProviderMapping {
            provider_name: "stripe".to_string(),
            ..mapping
        });
        assert!(matches!(duplicate, Err(OrchestratorError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_with_transaction_discards_on_error() {
        let storage = SqliteStorage::new_in_memory().unwrap();

        let result: Result<(), _> =
            crate::persist::with_transaction(&storage, |mut tx| async move {
                tx.create_payment(create_test_payment("pay_1", PaymentStatus::Success, 1));
                Err::<((), Transaction), _>(OrchestratorError::GenericError("abort".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert!(storage.get_payment("pay_1").unwrap().is_none());

        let id = crate::persist::with_transaction(&storage, |mut tx| async move {
            tx.create_payment(create_test_payment("pay_2", PaymentStatus::Success, 2));
            Ok(("pay_2", tx))
        })
        .await
        .unwrap();
        assert!(storage.get_payment(id).unwrap().is_some());
    }
}
