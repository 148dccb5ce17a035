//! Postgres-backed account store.
//!
//! ## Error Mapping
//!
//! | SQLx error | Postgres code | AccountStoreError | Scenario |
//! |------------|---------------|-------------------|----------|
//! | Database (unique violation) | `23505` | `Concurrency` | concurrent account creation or claim insert |
//! | Database (check violation) | `23514` | `Invalid` | a balance would go negative |
//! | Database (other) | any | `Unavailable` | other database errors |
//! | PoolClosed / IO / other | n/a | `Unavailable` | connection failures |
//!
//! ## Atomicity
//!
//! `commit` runs in one transaction: claim insert (`ON CONFLICT DO NOTHING`),
//! versioned account updates in ascending id order, then the rows. Any
//! failure rolls the whole operation back.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::{debug, instrument};

use wager_core::{AccountId, Currency, OperationId, TransactionId, UserId};
use wager_ledger::{
    Account, AccountOwner, AccountType, EscrowPosition, OperationRecord, Reference, Transaction,
    TransactionType,
};

use super::r#trait::{
    AccountStore, AccountStoreError, CommitOutcome, HistoryPage, HistoryQuery, LedgerCommit,
};
use crate::blocking::RuntimeBridge;

const ACCOUNT_COLUMNS: &str = "id, account_type, label, user_id, currency, decimals, \
     available_minor, locked_minor, total_deposited_minor, total_withdrawn_minor, version, created_at";

const TRANSACTION_COLUMNS: &str = "seq, id, operation_id, tx_type, state, account_id, amount_minor, \
     available_delta_minor, locked_delta_minor, counter_account_id, ref_type, ref_id, \
     idempotency_key, balance_after_minor, locked_after_minor, note, created_at";

#[derive(Debug, Clone)]
pub struct PostgresAccountStore {
    pool: Arc<PgPool>,
    bridge: RuntimeBridge,
}

impl PostgresAccountStore {
    /// Must be called from inside a tokio runtime (the handle is captured).
    pub fn new(pool: PgPool) -> Result<Self, AccountStoreError> {
        let bridge = RuntimeBridge::current().map_err(AccountStoreError::Unavailable)?;
        Ok(Self {
            pool: Arc::new(pool),
            bridge,
        })
    }

    #[instrument(skip(self), fields(owner = %owner, currency = %currency), err)]
    pub async fn get_or_open_async(
        &self,
        owner: &AccountOwner,
        currency: Currency,
    ) -> Result<Account, AccountStoreError> {
        if let Some(existing) = self.find_async(owner, currency).await? {
            return Ok(existing);
        }

        let fresh = Account::open(owner, currency);
        let inserted = sqlx::query(
            r#"
            INSERT INTO accounts (id, account_type, label, user_id, currency, decimals, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(fresh.id.as_uuid())
        .bind(fresh.account_type.as_str())
        .bind(&fresh.label)
        .bind(fresh.user_id.map(|u| *u.as_uuid()))
        .bind(currency.as_str())
        .bind(i16::from(fresh.decimals))
        .bind(fresh.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_account", e))?;

        if inserted.rows_affected() == 0 {
            debug!("account created concurrently, re-reading");
        }

        self.find_async(owner, currency)
            .await?
            .ok_or_else(|| AccountStoreError::NotFound(format!("account for {owner}")))
    }

    pub async fn find_async(
        &self,
        owner: &AccountOwner,
        currency: Currency,
    ) -> Result<Option<Account>, AccountStoreError> {
        let row = match owner {
            AccountOwner::House { label } => {
                sqlx::query(&format!(
                    "SELECT {ACCOUNT_COLUMNS} FROM accounts \
                     WHERE account_type = 'HOUSE' AND label = $1 AND currency = $2"
                ))
                .bind(label)
                .bind(currency.as_str())
                .fetch_optional(&*self.pool)
                .await
            }
            AccountOwner::User { user_id } => {
                sqlx::query(&format!(
                    "SELECT {ACCOUNT_COLUMNS} FROM accounts \
                     WHERE account_type = 'USER' AND user_id = $1 AND currency = $2"
                ))
                .bind(user_id.as_uuid())
                .bind(currency.as_str())
                .fetch_optional(&*self.pool)
                .await
            }
        }
        .map_err(|e| map_sqlx_error("find_account", e))?;

        row.map(|r| decode_account(&r)).transpose()
    }

    pub async fn load_async(
        &self,
        ids: &[AccountId],
    ) -> Result<BTreeMap<AccountId, Account>, AccountStoreError> {
        let uuids: Vec<uuid::Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
        let rows = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ANY($1)"
        ))
        .bind(&uuids)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_accounts", e))?;

        let mut out = BTreeMap::new();
        for row in rows {
            let account = decode_account(&row)?;
            out.insert(account.id, account);
        }
        if let Some(missing) = ids.iter().find(|id| !out.contains_key(id)) {
            return Err(AccountStoreError::NotFound(format!("account {missing}")));
        }
        Ok(out)
    }

    pub async fn find_operation_async(
        &self,
        idempotency_key: &str,
        tx_type: TransactionType,
    ) -> Result<Option<OperationRecord>, AccountStoreError> {
        let row = sqlx::query(
            r#"
            SELECT operation_id, idempotency_key, tx_type, fingerprint, primary_account_id, created_at
            FROM ledger_operations
            WHERE idempotency_key = $1 AND tx_type = $2
            "#,
        )
        .bind(idempotency_key)
        .bind(tx_type.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_operation", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let op = OperationRow::from_row(&row).map_err(decode_error)?;

        let tx_rows = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM ledger_transactions \
             WHERE operation_id = $1 ORDER BY seq ASC"
        ))
        .bind(op.operation_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_operation_rows", e))?;

        let transactions = tx_rows
            .iter()
            .map(decode_transaction)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(OperationRecord {
            operation_id: OperationId::from_uuid(op.operation_id),
            idempotency_key: op.idempotency_key,
            tx_type: parse(&op.tx_type)?,
            fingerprint: op.fingerprint,
            primary_account_id: AccountId::from_uuid(op.primary_account_id),
            transactions,
            created_at: op.created_at,
        }))
    }

    pub async fn escrow_positions_async(
        &self,
        reference: &Reference,
    ) -> Result<Vec<EscrowPosition>, AccountStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT t.account_id, a.user_id, SUM(t.locked_delta_minor)::BIGINT AS locked_minor
            FROM ledger_transactions t
            JOIN accounts a ON a.id = t.account_id
            WHERE t.ref_type = $1 AND t.ref_id = $2
            GROUP BY t.account_id, a.user_id
            HAVING SUM(t.locked_delta_minor) > 0
            ORDER BY t.account_id ASC
            "#,
        )
        .bind(reference.ref_type.as_str())
        .bind(&reference.ref_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("escrow_positions", e))?;

        rows.iter()
            .map(|row| {
                let account_id: uuid::Uuid = row.try_get("account_id").map_err(decode_error)?;
                let user_id: Option<uuid::Uuid> = row.try_get("user_id").map_err(decode_error)?;
                let locked_minor: i64 = row.try_get("locked_minor").map_err(decode_error)?;
                Ok(EscrowPosition {
                    account_id: AccountId::from_uuid(account_id),
                    user_id: user_id.map(UserId::from_uuid),
                    locked_minor,
                })
            })
            .collect()
    }

    #[instrument(
        skip(self, commit),
        fields(
            idempotency_key = %commit.record.idempotency_key,
            tx_type = commit.record.tx_type.as_str(),
            accounts = commit.accounts.len()
        ),
        err
    )]
    pub async fn commit_async(
        &self,
        commit: LedgerCommit,
    ) -> Result<CommitOutcome, AccountStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let record = commit.record;
        let claimed = sqlx::query(
            r#"
            INSERT INTO ledger_operations (
                operation_id, idempotency_key, tx_type, fingerprint, primary_account_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (idempotency_key, tx_type) DO NOTHING
            "#,
        )
        .bind(record.operation_id.as_uuid())
        .bind(&record.idempotency_key)
        .bind(record.tx_type.as_str())
        .bind(&record.fingerprint)
        .bind(record.primary_account_id.as_uuid())
        .bind(record.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_claim", e))?;

        if claimed.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            let existing = self
                .find_operation_async(&record.idempotency_key, record.tx_type)
                .await?
                .ok_or_else(|| {
                    AccountStoreError::Concurrency("claim vanished after conflict".to_string())
                })?;
            return Ok(CommitOutcome::AlreadyClaimed(existing));
        }

        let expected: BTreeMap<AccountId, u64> = commit.expected_versions.into_iter().collect();
        let mut accounts = commit.accounts;
        accounts.sort_by_key(|a| a.id);

        for account in &accounts {
            let expected_version = expected.get(&account.id).copied().ok_or_else(|| {
                AccountStoreError::Invalid(format!("no expected version for account {}", account.id))
            })?;
            let updated = sqlx::query(
                r#"
                UPDATE accounts
                SET available_minor = $3,
                    locked_minor = $4,
                    total_deposited_minor = $5,
                    total_withdrawn_minor = $6,
                    version = $7
                WHERE id = $1 AND version = $2
                "#,
            )
            .bind(account.id.as_uuid())
            .bind(to_db_version(expected_version)?)
            .bind(account.available_minor)
            .bind(account.locked_minor)
            .bind(account.total_deposited_minor)
            .bind(account.total_withdrawn_minor)
            .bind(to_db_version(account.version)?)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("update_account", e))?;

            if updated.rows_affected() == 0 {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(AccountStoreError::Concurrency(format!(
                    "account {} is no longer at version {expected_version}",
                    account.id
                )));
            }
        }

        let mut record = record;
        for row in &mut record.transactions {
            let inserted = sqlx::query(
                r#"
                INSERT INTO ledger_transactions (
                    id, operation_id, tx_type, state, account_id, amount_minor,
                    available_delta_minor, locked_delta_minor, counter_account_id,
                    ref_type, ref_id, idempotency_key, balance_after_minor,
                    locked_after_minor, note, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                RETURNING seq
                "#,
            )
            .bind(row.id.as_uuid())
            .bind(row.operation_id.as_uuid())
            .bind(row.tx_type.as_str())
            .bind(row.state.as_str())
            .bind(row.account_id.as_uuid())
            .bind(row.amount_minor)
            .bind(row.available_delta_minor)
            .bind(row.locked_delta_minor)
            .bind(row.counter_account_id.map(|a| *a.as_uuid()))
            .bind(row.ref_type.map(|r| r.as_str()))
            .bind(&row.ref_id)
            .bind(&row.idempotency_key)
            .bind(row.balance_after_minor)
            .bind(row.locked_after_minor)
            .bind(&row.note)
            .bind(row.created_at)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_transaction", e))?;

            let seq: i64 = inserted.try_get("seq").map_err(decode_error)?;
            row.seq = u64::try_from(seq)
                .map_err(|_| AccountStoreError::Invalid(format!("negative seq {seq}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(CommitOutcome::Committed(record))
    }

    pub async fn history_async(
        &self,
        account_id: AccountId,
        query: &HistoryQuery,
    ) -> Result<HistoryPage, AccountStoreError> {
        let cursor = query.cursor.map(i64::try_from).transpose().map_err(|_| {
            AccountStoreError::Invalid("cursor out of range".to_string())
        })?;
        let fetch = i64::try_from(query.limit + 1).unwrap_or(i64::MAX);

        let rows = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM ledger_transactions \
             WHERE account_id = $1 \
               AND ($2::BIGINT IS NULL OR seq < $2) \
               AND ($3::TEXT IS NULL OR tx_type = $3) \
               AND ($4::TEXT IS NULL OR state = $4) \
             ORDER BY seq DESC \
             LIMIT $5"
        ))
        .bind(account_id.as_uuid())
        .bind(cursor)
        .bind(query.tx_type.map(|t| t.as_str()))
        .bind(query.state.map(|s| s.as_str()))
        .bind(fetch)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("history", e))?;

        let items = rows
            .iter()
            .map(decode_transaction)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(HistoryPage::from_rows(items, query.limit))
    }

    pub async fn accounts_async(&self, currency: Currency) -> Result<Vec<Account>, AccountStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE currency = $1 ORDER BY id ASC"
        ))
        .bind(currency.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_accounts", e))?;

        rows.iter().map(decode_account).collect()
    }
}

impl AccountStore for PostgresAccountStore {
    fn get_or_open(
        &self,
        owner: &AccountOwner,
        currency: Currency,
    ) -> Result<Account, AccountStoreError> {
        self.bridge.block_on(self.get_or_open_async(owner, currency))
    }

    fn find(
        &self,
        owner: &AccountOwner,
        currency: Currency,
    ) -> Result<Option<Account>, AccountStoreError> {
        self.bridge.block_on(self.find_async(owner, currency))
    }

    fn load(&self, ids: &[AccountId]) -> Result<BTreeMap<AccountId, Account>, AccountStoreError> {
        self.bridge.block_on(self.load_async(ids))
    }

    fn find_operation(
        &self,
        idempotency_key: &str,
        tx_type: TransactionType,
    ) -> Result<Option<OperationRecord>, AccountStoreError> {
        self.bridge
            .block_on(self.find_operation_async(idempotency_key, tx_type))
    }

    fn escrow_positions(
        &self,
        reference: &Reference,
    ) -> Result<Vec<EscrowPosition>, AccountStoreError> {
        self.bridge.block_on(self.escrow_positions_async(reference))
    }

    fn commit(&self, commit: LedgerCommit) -> Result<CommitOutcome, AccountStoreError> {
        self.bridge.block_on(self.commit_async(commit))
    }

    fn history(
        &self,
        account_id: AccountId,
        query: &HistoryQuery,
    ) -> Result<HistoryPage, AccountStoreError> {
        self.bridge.block_on(self.history_async(account_id, query))
    }

    fn accounts(&self, currency: Currency) -> Result<Vec<Account>, AccountStoreError> {
        self.bridge.block_on(self.accounts_async(currency))
    }
}

// SQLx row types

#[derive(Debug)]
struct OperationRow {
    operation_id: uuid::Uuid,
    idempotency_key: String,
    tx_type: String,
    fingerprint: String,
    primary_account_id: uuid::Uuid,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for OperationRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(OperationRow {
            operation_id: row.try_get("operation_id")?,
            idempotency_key: row.try_get("idempotency_key")?,
            tx_type: row.try_get("tx_type")?,
            fingerprint: row.try_get("fingerprint")?,
            primary_account_id: row.try_get("primary_account_id")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

fn decode_account(row: &sqlx::postgres::PgRow) -> Result<Account, AccountStoreError> {
    let account_type: String = row.try_get("account_type").map_err(decode_error)?;
    let account_type = match account_type.as_str() {
        "HOUSE" => AccountType::House,
        "USER" => AccountType::User,
        other => {
            return Err(AccountStoreError::Invalid(format!(
                "unknown account type '{other}'"
            )));
        }
    };
    let currency: String = row.try_get("currency").map_err(decode_error)?;
    let decimals: i16 = row.try_get("decimals").map_err(decode_error)?;
    let user_id: Option<uuid::Uuid> = row.try_get("user_id").map_err(decode_error)?;
    let id: uuid::Uuid = row.try_get("id").map_err(decode_error)?;
    let version: i64 = row.try_get("version").map_err(decode_error)?;

    Ok(Account {
        id: AccountId::from_uuid(id),
        account_type,
        label: row.try_get("label").map_err(decode_error)?,
        user_id: user_id.map(UserId::from_uuid),
        currency: parse(&currency)?,
        decimals: u8::try_from(decimals)
            .map_err(|_| AccountStoreError::Invalid(format!("bad decimals {decimals}")))?,
        available_minor: row.try_get("available_minor").map_err(decode_error)?,
        locked_minor: row.try_get("locked_minor").map_err(decode_error)?,
        total_deposited_minor: row.try_get("total_deposited_minor").map_err(decode_error)?,
        total_withdrawn_minor: row.try_get("total_withdrawn_minor").map_err(decode_error)?,
        version: u64::try_from(version)
            .map_err(|_| AccountStoreError::Invalid(format!("negative version {version}")))?,
        created_at: row.try_get("created_at").map_err(decode_error)?,
    })
}

fn decode_transaction(row: &sqlx::postgres::PgRow) -> Result<Transaction, AccountStoreError> {
    let seq: i64 = row.try_get("seq").map_err(decode_error)?;
    let id: uuid::Uuid = row.try_get("id").map_err(decode_error)?;
    let operation_id: uuid::Uuid = row.try_get("operation_id").map_err(decode_error)?;
    let account_id: uuid::Uuid = row.try_get("account_id").map_err(decode_error)?;
    let counter: Option<uuid::Uuid> = row.try_get("counter_account_id").map_err(decode_error)?;
    let tx_type: String = row.try_get("tx_type").map_err(decode_error)?;
    let state: String = row.try_get("state").map_err(decode_error)?;
    let ref_type: Option<String> = row.try_get("ref_type").map_err(decode_error)?;

    Ok(Transaction {
        id: TransactionId::from_uuid(id),
        seq: u64::try_from(seq)
            .map_err(|_| AccountStoreError::Invalid(format!("negative seq {seq}")))?,
        operation_id: OperationId::from_uuid(operation_id),
        tx_type: parse(&tx_type)?,
        state: parse(&state)?,
        account_id: AccountId::from_uuid(account_id),
        amount_minor: row.try_get("amount_minor").map_err(decode_error)?,
        available_delta_minor: row.try_get("available_delta_minor").map_err(decode_error)?,
        locked_delta_minor: row.try_get("locked_delta_minor").map_err(decode_error)?,
        counter_account_id: counter.map(AccountId::from_uuid),
        ref_type: ref_type.as_deref().map(parse).transpose()?,
        ref_id: row.try_get("ref_id").map_err(decode_error)?,
        idempotency_key: row.try_get("idempotency_key").map_err(decode_error)?,
        balance_after_minor: row.try_get("balance_after_minor").map_err(decode_error)?,
        locked_after_minor: row.try_get("locked_after_minor").map_err(decode_error)?,
        note: row.try_get("note").map_err(decode_error)?,
        created_at: row.try_get("created_at").map_err(decode_error)?,
    })
}

fn parse<T>(raw: &str) -> Result<T, AccountStoreError>
where
    T: core::str::FromStr<Err = wager_core::DomainError>,
{
    raw.parse()
        .map_err(|e: wager_core::DomainError| AccountStoreError::Invalid(e.to_string()))
}

fn to_db_version(version: u64) -> Result<i64, AccountStoreError> {
    i64::try_from(version).map_err(|_| AccountStoreError::Invalid(format!("version {version} too large")))
}

fn decode_error(err: sqlx::Error) -> AccountStoreError {
    AccountStoreError::Invalid(format!("failed to decode row: {err}"))
}

/// Map SQLx errors to AccountStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> AccountStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => AccountStoreError::Concurrency(msg),
                Some("23514") => AccountStoreError::Invalid(msg),
                _ => AccountStoreError::Unavailable(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            AccountStoreError::Unavailable(format!("connection pool closed in {operation}"))
        }
        other => AccountStoreError::Unavailable(format!("sqlx error in {operation}: {other}")),
    }
}
