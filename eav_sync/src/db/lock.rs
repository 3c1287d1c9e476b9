//! Per-entity-type synchronization lock
//!
//! A lock is a row in [`LOCK_TABLE`] keyed by entity type code. Inserting the row acquires it,
//! so a second concurrent sync fails fast on the primary key instead of waiting.

use chrono::Utc;
use uuid::Uuid;

use crate::db::connection::{DatabaseConnection, Param};
use crate::error::{Error, Result};
use crate::utils::naming::LOCK_TABLE;

/// A held lock; call [`SyncLock::release`] when done
#[derive(Debug)]
pub struct SyncLock {
    connection: DatabaseConnection,
    entity_type_code: String,
    owner: String,
}

impl SyncLock {
    /// Try to take the lock for `entity_type_code`.
    ///
    /// Locks older than `ttl_seconds` are considered abandoned and reclaimed first.
    pub async fn acquire(
        connection: &DatabaseConnection,
        entity_type_code: &str,
        ttl_seconds: u64,
    ) -> Result<Self> {
        ensure_lock_table(connection).await?;

        let dialect = connection.dialect();
        let now = Utc::now().timestamp();
        let stale_before = now - ttl_seconds as i64;

        let reclaimed = connection
            .execute_with(
                &format!(
                    "DELETE FROM {} WHERE entity_type_code = {} AND acquired_at < {}",
                    dialect.quote(LOCK_TABLE),
                    dialect.placeholder(1),
                    dialect.placeholder(2)
                ),
                &[entity_type_code.into(), Param::Int(stale_before)],
            )
            .await?;
        if reclaimed > 0 {
            tracing::warn!(entity_type = %entity_type_code, "Reclaimed stale synchronization lock");
        }

        let owner = Uuid::new_v4().to_string();
        let inserted = connection
            .execute_with(
                &format!(
                    "INSERT INTO {} (entity_type_code, owner, acquired_at) VALUES ({}, {}, {})",
                    dialect.quote(LOCK_TABLE),
                    dialect.placeholder(1),
                    dialect.placeholder(2),
                    dialect.placeholder(3)
                ),
                &[entity_type_code.into(), owner.as_str().into(), Param::Int(now)],
            )
            .await;

        match inserted {
            Ok(_) => {
                tracing::debug!(entity_type = %entity_type_code, owner = %owner, "Lock acquired");
                Ok(Self {
                    connection: connection.clone(),
                    entity_type_code: entity_type_code.to_string(),
                    owner,
                })
            }
            Err(Error::SqlxError(sqlx::Error::Database(e))) if e.is_unique_violation() => {
                Err(Error::LockContention(entity_type_code.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Whether any live lock exists for `entity_type_code`
    pub async fn is_locked(connection: &DatabaseConnection, entity_type_code: &str) -> Result<bool> {
        ensure_lock_table(connection).await?;
        let dialect = connection.dialect();
        let count = connection
            .fetch_i64(
                &format!(
                    "SELECT COUNT(*) FROM {} WHERE entity_type_code = {}",
                    dialect.quote(LOCK_TABLE),
                    dialect.placeholder(1)
                ),
                &[entity_type_code.into()],
            )
            .await?;
        Ok(count > 0)
    }

    pub fn entity_type_code(&self) -> &str {
        &self.entity_type_code
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Release the lock. Only the owner's row is removed, so a lock that was reclaimed and
    /// re-acquired by someone else stays intact.
    pub async fn release(self) -> Result<()> {
        let dialect = self.connection.dialect();
        self.connection
            .execute_with(
                &format!(
                    "DELETE FROM {} WHERE entity_type_code = {} AND owner = {}",
                    dialect.quote(LOCK_TABLE),
                    dialect.placeholder(1),
                    dialect.placeholder(2)
                ),
                &[self.entity_type_code.as_str().into(), self.owner.as_str().into()],
            )
            .await?;

        tracing::debug!(entity_type = %self.entity_type_code, "Lock released");
        Ok(())
    }
}

async fn ensure_lock_table(connection: &DatabaseConnection) -> Result<()> {
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {} (\
            entity_type_code VARCHAR(255) NOT NULL PRIMARY KEY, \
            owner VARCHAR(64) NOT NULL, \
            acquired_at BIGINT NOT NULL\
        )",
        connection.dialect().quote(LOCK_TABLE)
    );
    connection.execute(&sql).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;

    async fn connection() -> DatabaseConnection {
        DatabaseConnection::connect(&DatabaseConfig::sqlite_memory())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn second_acquire_is_contention() {
        let connection = connection().await;

        let lock = SyncLock::acquire(&connection, "customer", 600).await.unwrap();
        let second = SyncLock::acquire(&connection, "customer", 600).await;

        assert!(matches!(second, Err(Error::LockContention(ref code)) if code == "customer"));
        assert!(SyncLock::acquire(&connection, "product", 600).await.is_ok());

        lock.release().await.unwrap();
        assert!(SyncLock::acquire(&connection, "customer", 600).await.is_ok());
    }

    #[tokio::test]
    async fn stale_locks_are_reclaimed() {
        let connection = connection().await;
        ensure_lock_table(&connection).await.unwrap();
        connection
            .execute("INSERT INTO eav_sync_locks (entity_type_code, owner, acquired_at) VALUES ('customer', 'crashed', 0)")
            .await
            .unwrap();

        assert!(SyncLock::is_locked(&connection, "customer").await.unwrap());
        let lock = SyncLock::acquire(&connection, "customer", 600).await.unwrap();
        assert_ne!(lock.owner(), "crashed");
    }
}
