mod common;

use pretty_assertions::assert_eq;

use common::{setup, TestEnv, CUSTOMER_FLAT};
use eav_sync::sync::{BackupType, RestoreStatus};
use eav_sync::{Entity, RestoreOptions, SyncOptions, SyncStrategy};

const VERIFY_ONLY: RestoreOptions = RestoreOptions { verify_only: true };

/// Synced flat customer with one stored customer and a legacy table holding two rows
async fn populated() -> TestEnv {
    let env = setup(&[("customer", CUSTOMER_FLAT)]).await;
    assert!(env.sync("customer", SyncOptions::default()).await.success);

    let mut customer = Entity::new("customer").with("email", "ada@example.com");
    env.client.entities().save_entity(&mut customer).await.unwrap();

    let connection = env.connection();
    connection
        .execute("CREATE TABLE customer_entity_legacy (id INTEGER PRIMARY KEY, note TEXT)")
        .await
        .unwrap();
    connection
        .execute("INSERT INTO customer_entity_legacy (id, note) VALUES (1, 'first'), (2, 'second')")
        .await
        .unwrap();
    env
}

fn full_force() -> SyncOptions {
    SyncOptions::default()
        .with_strategy(SyncStrategy::Full)
        .force()
}

#[tokio::test]
async fn restore_brings_back_a_dropped_table() {
    let env = populated().await;

    let result = env.sync("customer", full_force()).await;
    assert!(result.success, "{}", result);
    let backup_id = result.backup_id.unwrap();
    assert!(!env.tables().await.contains(&"customer_entity_legacy".to_string()));

    let backup = env.client.engine().backups().get(backup_id).await.unwrap();
    assert_eq!(backup.entity_type_code, "customer");
    assert_eq!(backup.backup_type, BackupType::Full);
    assert_eq!(backup.table("customer_entity_legacy").unwrap().rows.len(), 2);

    let restored = env.client.restore(backup_id, &RestoreOptions::default()).await;

    assert_eq!(restored.status, RestoreStatus::Completed, "{}", restored);
    assert!(restored.success);
    assert!(restored
        .restored_tables
        .contains(&"customer_entity_legacy".to_string()));
    assert_eq!(env.count("SELECT COUNT(*) FROM customer_entity_legacy").await, 2);
    assert_eq!(
        env.count("SELECT COUNT(*) FROM customer_entity WHERE email = 'ada@example.com'")
            .await,
        1
    );

    // The restored table is drift again
    let report = env.client.analyze("customer").await.unwrap();
    assert_eq!(report.differences.len(), 1);
}

#[tokio::test]
async fn verify_only_changes_nothing() {
    let env = populated().await;
    let backup_id = env
        .sync("customer", full_force())
        .await
        .backup_id
        .unwrap();
    let before = env.tables().await;

    let verified = env.client.restore(backup_id, &VERIFY_ONLY).await;

    assert_eq!(verified.status, RestoreStatus::Verified);
    assert!(verified.success);
    assert!(verified.errors.is_empty());
    assert_eq!(env.tables().await, before);
}

#[tokio::test]
async fn verification_reports_columns_that_no_longer_exist() {
    let env = populated().await;
    let entity_type = env.client.registry().get("customer").unwrap();
    let backup = env
        .client
        .engine()
        .backups()
        .backup(&entity_type, BackupType::Data)
        .await
        .unwrap();

    env.connection()
        .execute("ALTER TABLE customer_entity DROP COLUMN is_verified")
        .await
        .unwrap();

    let verified = env.client.restore(backup.id, &VERIFY_ONLY).await;

    assert_eq!(verified.status, RestoreStatus::VerificationFailed);
    assert!(!verified.success);
    assert_eq!(verified.errors.len(), 1);
    assert!(verified.errors[0].message.contains("is_verified"));
}

#[tokio::test]
async fn schema_restore_keeps_rows() {
    let env = populated().await;
    let entity_type = env.client.registry().get("customer").unwrap();
    let backup = env
        .client
        .engine()
        .backups()
        .backup(&entity_type, BackupType::Schema)
        .await
        .unwrap();

    env.connection()
        .execute("ALTER TABLE customer_entity ADD COLUMN nickname TEXT")
        .await
        .unwrap();

    let restored = env.client.restore(backup.id, &RestoreOptions::default()).await;

    assert!(restored.success, "{}", restored);
    assert!(!env
        .columns("customer_entity")
        .await
        .contains(&"nickname".to_string()));
    assert_eq!(env.count("SELECT COUNT(*) FROM customer_entity").await, 1);
    assert_eq!(env.count("SELECT COUNT(*) FROM customer_entity_legacy").await, 2);
}

#[tokio::test]
async fn unknown_backup_fails() {
    let env = setup(&[("customer", CUSTOMER_FLAT)]).await;

    let result = env.client.restore(404, &RestoreOptions::default()).await;

    assert_eq!(result.status, RestoreStatus::Failed);
    assert!(!result.success);
    assert!(result.entity_type_code.is_none());
    assert!(result.errors[0].message.contains("#404"));
}
