use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{DuplicateSecret, Ledger, ReserveOutcome};
use crate::models::credential::{Credential, CredentialPatch, NewCredential, RequestLogEntry};

const CREDENTIAL_COLUMNS: &str = "id, secret, quota_limit, quota_used, is_active, error_count, \
     last_used_at, last_checked_at, created_at, refreshes_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl Ledger for PgStore {
    async fn list_credentials(&self) -> anyhow::Result<Vec<Credential>> {
        let rows = sqlx::query_as::<_, Credential>(&format!(
            "SELECT {} FROM credentials ORDER BY created_at ASC, id ASC",
            CREDENTIAL_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_active(&self) -> anyhow::Result<Vec<Credential>> {
        let rows = sqlx::query_as::<_, Credential>(&format!(
            "SELECT {} FROM credentials WHERE is_active = true ORDER BY created_at ASC, id ASC",
            CREDENTIAL_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<Credential>> {
        let row = sqlx::query_as::<_, Credential>(&format!(
            "SELECT {} FROM credentials WHERE id = $1",
            CREDENTIAL_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn insert(&self, cred: &NewCredential) -> anyhow::Result<Credential> {
        let row = sqlx::query_as::<_, Credential>(&format!(
            r#"INSERT INTO credentials (secret, quota_limit, quota_used, is_active, refreshes_at)
               VALUES ($1, $2, 0, true, $3)
               RETURNING {}"#,
            CREDENTIAL_COLUMNS
        ))
        .bind(&cred.secret)
        .bind(cred.quota_limit)
        .bind(cred.refreshes_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                anyhow::Error::new(DuplicateSecret)
            }
            other => other.into(),
        })?;
        Ok(row)
    }

    async fn delete(&self, id: Uuid) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM credentials WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update(&self, id: Uuid, patch: &CredentialPatch) -> anyhow::Result<Option<Credential>> {
        let row = sqlx::query_as::<_, Credential>(&format!(
            r#"UPDATE credentials
               SET is_active = COALESCE($1, is_active),
                   quota_limit = COALESCE($2, quota_limit)
               WHERE id = $3
               RETURNING {}"#,
            CREDENTIAL_COLUMNS
        ))
        .bind(patch.is_active)
        .bind(patch.quota_limit)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn reserve(&self, id: Uuid, cost: i64, now: DateTime<Utc>) -> anyhow::Result<ReserveOutcome> {
        // The WHERE clause re-checks eligibility so a writer outside this
        // process can never push usage past the limit between scan and update.
        let row = sqlx::query_as::<_, Credential>(&format!(
            r#"UPDATE credentials
               SET quota_used = quota_used + $2, last_used_at = $3
               WHERE id = $1
                 AND is_active = true
                 AND (quota_limit = 0 OR quota_used < quota_limit)
               RETURNING {}"#,
            CREDENTIAL_COLUMNS
        ))
        .bind(id)
        .bind(cost)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(c) => ReserveOutcome::Reserved(c),
            None => ReserveOutcome::Conflict,
        })
    }

    async fn rollback(&self, id: Uuid, cost: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE credentials SET quota_used = GREATEST(quota_used - $2, 0) WHERE id = $1")
            .bind(id)
            .bind(cost)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_rejection(&self, id: Uuid) -> anyhow::Result<()> {
        sqlx::query(
            r#"UPDATE credentials
               SET is_active = false, error_count = error_count + 1, last_checked_at = NOW()
               WHERE id = $1"#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_status(&self, id: Uuid, is_active: bool, error_count: i32) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE credentials SET is_active = $1, error_count = $2, last_checked_at = NOW() WHERE id = $3",
        )
        .bind(is_active)
        .bind(error_count)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn rollover(
        &self,
        id: Uuid,
        next_refresh: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let result = sqlx::query(
            r#"UPDATE credentials
               SET quota_used = 0, refreshes_at = $2
               WHERE id = $1 AND refreshes_at <= $3"#,
        )
        .bind(id)
        .bind(next_refresh)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            tracing::info!(credential_id = %id, next_refresh = %next_refresh, "quota period rolled over");
        }
        Ok(())
    }

    async fn overwrite_usage(&self, id: Uuid, quota_used: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE credentials SET quota_used = $1 WHERE id = $2")
            .bind(quota_used)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn touch_checked(&self, id: Uuid) -> anyhow::Result<()> {
        sqlx::query("UPDATE credentials SET last_checked_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn log_request(&self, entry: &RequestLogEntry) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO request_log (path, method, status_code, credential_id, created_at)
               VALUES ($1, $2, $3, $4, $5)"#,
        )
        .bind(&entry.path)
        .bind(&entry.method)
        .bind(entry.status_code.map(i32::from))
        .bind(entry.credential_id)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
