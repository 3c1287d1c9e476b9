mod common;

use pretty_assertions::assert_eq;
use serde_json::Value;

use common::{setup, TestEnv, CUSTOMER_EAV, CUSTOMER_FLAT, CUSTOMER_FLAT_WITHOUT_VERIFIED};
use eav_sync::db::lock::SyncLock;
use eav_sync::schema::diff::{Action, DifferenceType, ReportStatus, Severity};
use eav_sync::sync::{ChangeOutcome, SyncStatus};
use eav_sync::{AttributeValue, Entity, SyncOptions, SyncStrategy};

const ITEM_WITH_TEXT_SKU: &str = "[[attributes]]\ncode = \"sku\"\nbackend_type = \"varchar\"\n";
const ITEM_WITH_NUMERIC_SKU: &str = "[[attributes]]\ncode = \"sku\"\nbackend_type = \"int\"\n";

/// Synced `item` entity type with one stored item per sku, then reconfigured with numeric skus
async fn items_with_skus(skus: &[&str]) -> (TestEnv, Vec<i64>) {
    let env = setup(&[("item", ITEM_WITH_TEXT_SKU)]).await;
    assert!(env.sync("item", SyncOptions::default()).await.success);

    let mut ids = Vec::new();
    for sku in skus {
        let mut item = Entity::new("item").with("sku", *sku);
        env.client.entities().save_entity(&mut item).await.unwrap();
        ids.push(item.id.unwrap());
    }
    env.rewrite_entity_type("item", ITEM_WITH_NUMERIC_SKU);
    (env, ids)
}

fn full_force() -> SyncOptions {
    SyncOptions::default()
        .with_strategy(SyncStrategy::Full)
        .force()
}

fn planned(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn first_sync_creates_tables_and_registers_attributes() {
    let env = setup(&[("customer", CUSTOMER_EAV)]).await;

    let result = env.sync("customer", SyncOptions::default()).await;

    assert_eq!(result.status, SyncStatus::Completed, "{}", result);
    assert!(result.success);
    assert!(result.backup_id.is_some());
    assert!(result
        .applied_changes
        .iter()
        .all(|change| change.outcome == ChangeOutcome::Applied));
    assert_eq!(
        result.applied_changes[0].description,
        "Create table customer_entity"
    );

    let tables = env.tables().await;
    for table in [
        "customer_entity",
        "eav_attributes",
        "eav_values_varchar",
        "eav_values_text",
        "eav_values_int",
        "eav_values_decimal",
        "eav_values_datetime",
    ] {
        assert!(tables.contains(&table.to_string()), "missing {}", table);
    }
    assert_eq!(
        env.count("SELECT COUNT(*) FROM eav_attributes WHERE entity_type_code = 'customer'")
            .await,
        2
    );

    let history = env
        .client
        .engine()
        .history()
        .list("customer")
        .await
        .unwrap();
    assert_eq!(history.len(), result.applied_changes.len());
}

#[tokio::test]
async fn second_sync_is_in_sync_and_analysis_is_idempotent() {
    let env = setup(&[("customer", CUSTOMER_EAV)]).await;
    assert!(env.sync("customer", SyncOptions::default()).await.success);

    let result = env.sync("customer", SyncOptions::default()).await;
    assert_eq!(result.status, SyncStatus::InSync);
    assert!(result.success);
    assert!(result.applied_changes.is_empty());

    let first = env.client.analyze("customer").await.unwrap();
    let second = env.client.analyze("customer").await.unwrap();
    assert_eq!(first.status, ReportStatus::InSync);
    assert_eq!(first.risk_score, 0);
    assert!(first.differences.is_empty());
    assert_eq!(first, second);
}

#[tokio::test]
async fn missing_column_is_one_critical_difference() {
    let env = setup(&[("customer", CUSTOMER_FLAT_WITHOUT_VERIFIED)]).await;
    assert!(env.sync("customer", SyncOptions::default()).await.success);

    env.rewrite_entity_type("customer", CUSTOMER_FLAT);
    let report = env.client.analyze("customer").await.unwrap();

    assert_eq!(report.differences.len(), 1);
    let difference = &report.differences[0];
    assert_eq!(difference.difference_type, DifferenceType::MissingColumn);
    assert_eq!(difference.severity, Severity::Critical);
    assert_eq!(difference.column.as_deref(), Some("is_verified"));
    assert!(report.risk_score >= 25);

    let result = env.sync("customer", SyncOptions::default()).await;
    assert!(result.success, "{}", result);
    assert_eq!(
        result.applied_changes[0].description,
        "Add column customer_entity.is_verified (bigint)"
    );
    assert!(env
        .columns("customer_entity")
        .await
        .contains(&"is_verified".to_string()));
}

#[tokio::test]
async fn dry_run_never_mutates_the_database() {
    let env = setup(&[("customer", CUSTOMER_EAV)]).await;
    let before = env.tables().await;

    let result = env
        .sync("customer", SyncOptions::default().dry_run())
        .await;

    assert_eq!(result.status, SyncStatus::DryRun);
    assert!(result.success);
    assert!(result.applied_changes.is_empty());
    assert!(!planned(result.metadata.get("planned_changes")).is_empty());
    assert_eq!(env.tables().await, before);

    assert!(env.sync("customer", SyncOptions::default()).await.success);
    let in_sync = env
        .sync("customer", SyncOptions::default().dry_run())
        .await;
    assert!(planned(in_sync.metadata.get("planned_changes")).is_empty());
}

#[tokio::test]
async fn full_strategy_creates_missing_table_first_and_drops_extra_table_last() {
    let env = setup(&[("customer", CUSTOMER_FLAT)]).await;
    env.connection()
        .execute("CREATE TABLE customer_entity_legacy (id INTEGER PRIMARY KEY, note TEXT)")
        .await
        .unwrap();

    let options = SyncOptions::default().with_strategy(SyncStrategy::Full);
    let dry_run = env.sync("customer", options.clone().dry_run()).await;
    let steps = planned(dry_run.metadata.get("planned_steps"));

    assert_eq!(steps.first().map(String::as_str), Some("Create table customer_entity"));
    assert_eq!(steps.last().map(String::as_str), Some("Drop table customer_entity_legacy"));

    let refused = env.sync("customer", options.clone()).await;
    assert_eq!(refused.status, SyncStatus::Aborted);
    assert!(!refused.success);
    assert!(env.tables().await.contains(&"customer_entity_legacy".to_string()));

    let applied = env.sync("customer", options.force()).await;
    assert_eq!(applied.status, SyncStatus::Completed, "{}", applied);
    assert!(applied.backup_id.is_some());
    assert_eq!(
        applied.applied_changes.last().map(|c| c.description.as_str()),
        Some("Drop table customer_entity_legacy")
    );
    assert!(!env.tables().await.contains(&"customer_entity_legacy".to_string()));
}

#[tokio::test]
async fn additive_strategy_never_removes() {
    let env = setup(&[("customer", CUSTOMER_FLAT)]).await;
    assert!(env.sync("customer", SyncOptions::default()).await.success);
    env.connection()
        .execute("CREATE TABLE customer_entity_legacy (id INTEGER PRIMARY KEY)")
        .await
        .unwrap();
    env.connection()
        .execute("ALTER TABLE customer_entity ADD COLUMN nickname TEXT")
        .await
        .unwrap();
    env.client.engine().analyzer().invalidate("customer");

    let report = env.client.analyze("customer").await.unwrap();
    assert!(report
        .differences
        .iter()
        .all(|d| d.action == Action::Remove && d.severity == Severity::Info));
    assert_eq!(report.count(DifferenceType::ExtraTable), 1);
    assert_eq!(report.count(DifferenceType::ExtraColumn), 1);

    let result = env.sync("customer", SyncOptions::default()).await;

    assert!(result.success);
    assert!(result.applied_changes.is_empty());
    assert_eq!(planned(result.metadata.get("skipped_changes")).len(), 2);
    assert!(env.tables().await.contains(&"customer_entity_legacy".to_string()));
    assert!(env
        .columns("customer_entity")
        .await
        .contains(&"nickname".to_string()));
}

#[tokio::test]
async fn unknown_entity_type_aborts() {
    let env = setup(&[("customer", CUSTOMER_EAV)]).await;

    let result = env.sync("vendor", SyncOptions::default()).await;

    assert_eq!(result.status, SyncStatus::Aborted);
    assert!(!result.success);
    assert_eq!(result.errors[0].details.as_deref(), Some("configuration"));
}

#[tokio::test]
async fn concurrent_sync_fails_fast_on_the_lock() {
    let env = setup(&[("customer", CUSTOMER_EAV)]).await;
    let lock = SyncLock::acquire(env.connection(), "customer", 600)
        .await
        .unwrap();

    let result = env.sync("customer", SyncOptions::default()).await;

    assert_eq!(result.status, SyncStatus::Aborted);
    assert!(result.errors[0].message.contains("already running"));
    assert!(!env.tables().await.contains(&"customer_entity".to_string()));

    lock.release().await.unwrap();
    assert!(env.sync("customer", SyncOptions::default()).await.success);
    assert!(!SyncLock::is_locked(env.connection(), "customer").await.unwrap());
}

#[tokio::test]
async fn attribute_values_move_to_their_new_backend_type() {
    let (env, ids) = items_with_skus(&["42", "-7"]).await;

    let result = env.sync("item", full_force()).await;

    assert_eq!(result.status, SyncStatus::Completed, "{}", result);
    assert_eq!(env.count("SELECT COUNT(*) FROM eav_values_varchar").await, 0);
    assert_eq!(env.count("SELECT COUNT(*) FROM eav_values_int").await, 2);
    let entities = env.client.entities();
    assert_eq!(
        entities.load_entity("item", ids[0]).await.unwrap().get("sku"),
        Some(&AttributeValue::Integer(42))
    );
    assert_eq!(
        entities.load_entity("item", ids[1]).await.unwrap().get("sku"),
        Some(&AttributeValue::Integer(-7))
    );
}

#[tokio::test]
async fn values_that_do_not_convert_fail_the_migration() {
    let (env, _) = items_with_skus(&["42", "ABC-123"]).await;

    let result = env.sync("item", full_force()).await;

    assert_eq!(result.status, SyncStatus::Failed, "{}", result);
    assert!(!result.success);
    assert_eq!(result.errors[0].details.as_deref(), Some("migration"));
    assert!(result.errors[0].message.contains("cannot be converted from varchar to int"));
    assert!(result
        .applied_changes
        .iter()
        .any(|change| change.outcome == ChangeOutcome::Failed));

    // Nothing moved and the attribute keeps its old backend type
    assert_eq!(env.count("SELECT COUNT(*) FROM eav_values_varchar").await, 2);
    assert_eq!(env.count("SELECT COUNT(*) FROM eav_values_int").await, 0);
    assert_eq!(
        env.count("SELECT COUNT(*) FROM eav_attributes WHERE attribute_code = 'sku' AND backend_type = 'varchar'")
            .await,
        1
    );
}
