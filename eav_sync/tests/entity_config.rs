mod common;

use std::fs;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use rstest::rstest;
use tempfile::tempdir;

use common::{write_entity_type, CUSTOMER_EAV};
use eav_sync::config::CacheConfig;
use eav_sync::{BackendType, CacheDriver, ConfigLoader, EntityTypeRegistry, Error, StorageMode};

#[test]
fn loader_applies_defaults() {
    let dir = tempdir().unwrap();
    write_entity_type(dir.path(), "customer", CUSTOMER_EAV);

    let customer = ConfigLoader::new(dir.path()).load("customer").unwrap();

    assert_eq!(customer.label, "Customer");
    assert_eq!(customer.entity_table, "customer_entity");
    assert_eq!(customer.storage_strategy, StorageMode::Eav);

    let email = customer.attribute("email").unwrap();
    assert_eq!(email.backend_type, BackendType::Varchar);
    assert!(email.is_required && email.is_unique);
    assert_eq!(email.label, "email");
    assert_eq!(email.frontend_type, "text");

    let born = customer.attribute("date_of_birth").unwrap();
    assert_eq!(born.backend_type, BackendType::Datetime);
    assert!(!born.is_required);
    assert!(born.validation_rules.is_none());
}

#[test]
fn yaml_files_are_supported() {
    let dir = tempdir().unwrap();
    fs::write(
        dir.path().join("vendor.yaml"),
        "label: Vendor\nentity_table: vendors\nstorage_strategy: flat\nattributes:\n  - code: name\n    backend_type: varchar\n    validation_rules:\n      max_length: 64\n",
    )
    .unwrap();

    let vendor = ConfigLoader::new(dir.path()).load("vendor").unwrap();

    assert_eq!(vendor.entity_table, "vendors");
    assert!(vendor.is_flat());
    let rules = vendor.attribute("name").unwrap().validation_rules.clone().unwrap();
    assert_eq!(rules.max_length, Some(64));
}

#[rstest]
#[case::invalid_attribute_code("[[attributes]]\ncode = \"Email\"\nbackend_type = \"varchar\"\n")]
#[case::duplicate_attribute(
    "[[attributes]]\ncode = \"email\"\nbackend_type = \"varchar\"\n\n[[attributes]]\ncode = \"email\"\nbackend_type = \"text\"\n"
)]
#[case::reserved_attribute("[[attributes]]\ncode = \"created_at\"\nbackend_type = \"datetime\"\n")]
#[case::unknown_backend_type("[[attributes]]\ncode = \"email\"\nbackend_type = \"blob\"\n")]
#[case::unknown_rule(
    "[[attributes]]\ncode = \"email\"\nbackend_type = \"varchar\"\nvalidation_rules = { maxlen = 3 }\n"
)]
#[case::invalid_pattern(
    "[[attributes]]\ncode = \"email\"\nbackend_type = \"varchar\"\nvalidation_rules = { pattern = \"(\" }\n"
)]
#[case::invalid_default("[[attributes]]\ncode = \"age\"\nbackend_type = \"int\"\ndefault_value = \"old\"\n")]
#[case::future_version("version = 2\n\n[[attributes]]\ncode = \"email\"\nbackend_type = \"varchar\"\n")]
#[case::invalid_table("entity_table = \"Customer Table\"\n\n[[attributes]]\ncode = \"email\"\nbackend_type = \"varchar\"\n")]
fn malformed_configuration_is_rejected(#[case] contents: &str) {
    let dir = tempdir().unwrap();
    write_entity_type(dir.path(), "customer", contents);

    let result = ConfigLoader::new(dir.path()).load("customer");

    assert!(matches!(result, Err(Error::ConfigError(_))), "{:?}", result);
}

#[test]
fn one_entity_type_per_code() {
    let dir = tempdir().unwrap();
    write_entity_type(dir.path(), "customer", CUSTOMER_EAV);
    fs::write(
        dir.path().join("customer.yml"),
        "attributes:\n  - code: email\n    backend_type: varchar\n",
    )
    .unwrap();

    assert!(matches!(
        ConfigLoader::new(dir.path()).codes(),
        Err(Error::ConfigError(_))
    ));
}

#[test]
fn registry_resolves_and_reloads() {
    let dir = tempdir().unwrap();
    write_entity_type(dir.path(), "customer", CUSTOMER_EAV);
    let registry = EntityTypeRegistry::new(
        ConfigLoader::new(dir.path()),
        Arc::new(CacheDriver::new(&CacheConfig::default())),
    );

    assert_eq!(registry.initialize().unwrap(), 1);
    assert!(registry.has("customer"));
    assert!(!registry.has("vendor"));
    assert!(matches!(registry.get("vendor"), Err(Error::ConfigError(_))));
    assert_eq!(registry.get("customer").unwrap().attributes().len(), 2);

    write_entity_type(
        dir.path(),
        "customer",
        &format!("{}\n[[attributes]]\ncode = \"bio\"\nbackend_type = \"text\"\n", CUSTOMER_EAV),
    );
    // Served from cache until reloaded
    assert_eq!(registry.get("customer").unwrap().attributes().len(), 2);

    write_entity_type(dir.path(), "vendor", "[[attributes]]\ncode = \"name\"\nbackend_type = \"varchar\"\n");
    assert_eq!(registry.reload().unwrap(), 2);
    assert_eq!(registry.get("customer").unwrap().attributes().len(), 3);
    assert_eq!(registry.codes().unwrap(), vec!["customer", "vendor"]);
}

#[test]
fn directories_with_glob_characters_are_taken_literally() {
    let root = tempdir().unwrap();
    let directory = root.path().join("types[1]");
    fs::create_dir(&directory).unwrap();
    write_entity_type(&directory, "customer", CUSTOMER_EAV);
    // Would match the unescaped pattern `types[1]/*.toml`
    let decoy = root.path().join("types1");
    fs::create_dir(&decoy).unwrap();
    write_entity_type(&decoy, "vendor", CUSTOMER_EAV);

    let loader = ConfigLoader::new(&directory);

    assert_eq!(loader.codes().unwrap(), vec!["customer"]);
    assert_eq!(loader.load_all().unwrap().len(), 1);
}

#[rstest]
#[case::parent_directory("../customer")]
#[case::nested("nested/customer")]
#[case::uppercase("Customer")]
fn codes_that_are_not_identifiers_never_resolve(#[case] code: &str) {
    let root = tempdir().unwrap();
    let directory = root.path().join("types");
    fs::create_dir(&directory).unwrap();
    fs::create_dir(directory.join("nested")).unwrap();
    write_entity_type(root.path(), "customer", CUSTOMER_EAV);
    write_entity_type(&directory.join("nested"), "customer", CUSTOMER_EAV);
    let registry = EntityTypeRegistry::new(
        ConfigLoader::new(&directory),
        Arc::new(CacheDriver::new(&CacheConfig::default())),
    );

    assert!(!ConfigLoader::new(&directory).exists(code));
    assert!(!registry.has(code));
    assert!(matches!(registry.get(code), Err(Error::ConfigError(_))));
}
