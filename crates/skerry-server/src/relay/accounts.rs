//! External account store — registration records and safety bookkeeping.
//!
//! The relay core never owns account data; it only invokes these
//! operations. Backed by PostgreSQL (`DATABASE_URL`). The salt, KDF
//! parameters and public key are opaque client material stored and
//! returned verbatim.

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls};
use tracing::error;

use super::error::RelayError;

const INIT_SQL: &str = include_str!("../../migrations/001_init.sql");

/// One registration record as the wire needs it.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountRecord {
    pub identity: String,
    pub username: Option<String>,
    pub salt: Option<String>,
    pub kdf_params: Option<Value>,
    pub public_key: Option<String>,
}

/// Connection to the account store. Not `Clone` — shared via `Arc`.
pub struct AccountStore {
    client: Client,
    _conn_task: JoinHandle<()>,
}

impl AccountStore {
    /// Connect and keep the connection task alive for the process lifetime.
    pub async fn connect(dsn: &str) -> Result<Self, RelayError> {
        let (client, connection) = tokio_postgres::connect(dsn, NoTls).await?;
        let task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "account store connection stopped");
            }
        });
        Ok(Self {
            client,
            _conn_task: task,
        })
    }

    /// Apply the bundled schema. Idempotent.
    pub async fn migrate(&self) -> Result<(), RelayError> {
        self.client.batch_execute(INIT_SQL).await?;
        Ok(())
    }

    /// Lightweight liveness probe.
    pub async fn readiness(&self) -> Result<(), RelayError> {
        self.client.simple_query("SELECT 1").await?;
        Ok(())
    }

    pub async fn load_by_username(
        &self,
        username: &str,
    ) -> Result<Option<AccountRecord>, RelayError> {
        let row = self
            .client
            .query_opt(
                "SELECT identity, username, salt, kdf_params, public_key
                 FROM account WHERE username = $1",
                &[&username],
            )
            .await?;
        Ok(row.map(record_from_row))
    }

    pub async fn load_by_identity(
        &self,
        identity: &str,
    ) -> Result<Option<AccountRecord>, RelayError> {
        let row = self
            .client
            .query_opt(
                "SELECT identity, username, salt, kdf_params, public_key
                 FROM account WHERE identity = $1",
                &[&identity],
            )
            .await?;
        Ok(row.map(record_from_row))
    }

    /// Create or refresh a registration. A username already held by a
    /// different identity surfaces as [`RelayError::UsernameTaken`].
    pub async fn upsert_registration(&self, record: &AccountRecord) -> Result<(), RelayError> {
        let result = self
            .client
            .execute(
                "INSERT INTO account (identity, username, salt, kdf_params, public_key)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (identity) DO UPDATE SET
                   username   = COALESCE(excluded.username, account.username),
                   salt       = COALESCE(excluded.salt, account.salt),
                   kdf_params = COALESCE(excluded.kdf_params, account.kdf_params),
                   public_key = COALESCE(excluded.public_key, account.public_key),
                   updated_at = now()",
                &[
                    &record.identity,
                    &record.username,
                    &record.salt,
                    &record.kdf_params,
                    &record.public_key,
                ],
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some(&SqlState::UNIQUE_VIOLATION) => {
                Err(RelayError::UsernameTaken)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Record that `blocker` blocked `blocked`. Re-blocking is a no-op.
    pub async fn record_block(&self, blocker: &str, blocked: &str) -> Result<(), RelayError> {
        self.client
            .execute(
                "INSERT INTO safety_block (blocker, blocked) VALUES ($1, $2)
                 ON CONFLICT (blocker, blocked) DO NOTHING",
                &[&blocker, &blocked],
            )
            .await?;
        Ok(())
    }

    /// Record a user report with an optional free-form reason.
    pub async fn record_report(
        &self,
        reporter: &str,
        reported: &str,
        reason: Option<&str>,
    ) -> Result<(), RelayError> {
        self.client
            .execute(
                "INSERT INTO safety_report (reporter, reported, reason)
                 VALUES ($1, $2, $3)",
                &[&reporter, &reported, &reason],
            )
            .await?;
        Ok(())
    }
}

fn record_from_row(row: tokio_postgres::Row) -> AccountRecord {
    AccountRecord {
        identity: row.get(0),
        username: row.get(1),
        salt: row.get(2),
        kdf_params: row.get(3),
        public_key: row.get(4),
    }
}
