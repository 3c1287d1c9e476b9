//! Entity type configuration loader
//!
//! One file per entity type lives in the configured directory, named after the entity type
//! code: `customer.toml`, `customer.yaml` or `customer.yml`.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Deserialize;

use crate::entity::types::{Attribute, BackendType, EntityType, StorageMode, ValidationRules};
use crate::error::{Error, Result};
use crate::storage::value::AttributeValue;
use crate::utils::naming::{default_entity_table, is_valid_identifier, validate_identifier};

/// Highest configuration format version this loader understands
pub const CONFIG_VERSION: u32 = 1;

const EXTENSIONS: [&str; 3] = ["toml", "yaml", "yml"];

/// On-disk shape of an entity type file
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EntityTypeFile {
    version: Option<u32>,
    label: Option<String>,
    entity_table: Option<String>,
    storage_strategy: Option<StorageMode>,
    attributes: Vec<AttributeFile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AttributeFile {
    code: String,
    backend_type: BackendType,
    label: Option<String>,
    frontend_type: Option<String>,
    #[serde(default)]
    is_required: bool,
    #[serde(default)]
    is_unique: bool,
    #[serde(default)]
    is_searchable: bool,
    #[serde(default)]
    is_filterable: bool,
    default_value: Option<serde_json::Value>,
    #[serde(default)]
    sort_order: i32,
    validation_rules: Option<ValidationRules>,
}

/// Loads entity types from configuration files
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    directory: PathBuf,
}

impl ConfigLoader {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Whether a configuration file exists for `code`
    pub fn exists(&self, code: &str) -> bool {
        is_valid_identifier(code) && self.find_file(code).is_some()
    }

    /// Load and validate a single entity type
    pub fn load(&self, code: &str) -> Result<EntityType> {
        validate_identifier("entity type code", code)?;

        let path = self.find_file(code).ok_or_else(|| {
            Error::ConfigError(format!(
                "No configuration found for entity type '{}' in {}",
                code,
                self.directory.display()
            ))
        })?;

        tracing::debug!(entity_type = code, path = %path.display(), "Loading entity type configuration");
        parse_file(code, &path)
    }

    /// Load every entity type in the directory; any malformed file aborts the whole load
    pub fn load_all(&self) -> Result<Vec<EntityType>> {
        self.codes()?
            .iter()
            .map(|code| self.load(code))
            .collect()
    }

    /// Codes of every discoverable entity type, sorted
    pub fn codes(&self) -> Result<Vec<String>> {
        if !self.directory.is_dir() {
            return Err(Error::ConfigError(format!(
                "Entity type directory does not exist: {}",
                self.directory.display()
            )));
        }

        let mut codes = Vec::new();
        let mut seen = HashSet::new();

        for extension in EXTENSIONS {
            // The directory is matched literally; only the file name is a pattern
            let directory = glob::Pattern::escape(&self.directory.to_string_lossy());
            let pattern = Path::new(&directory).join(format!("*.{}", extension));
            let paths = glob::glob(&pattern.to_string_lossy())
                .map_err(|e| Error::ConfigError(format!("Invalid glob pattern: {}", e)))?;

            for entry in paths {
                let path = entry.map_err(|e| Error::IoError(e.into_error()))?;
                let Some(code) = path.file_stem().and_then(|stem| stem.to_str()) else {
                    continue;
                };
                if seen.insert(code.to_string()) {
                    codes.push(code.to_string());
                } else {
                    return Err(Error::ConfigError(format!(
                        "Entity type '{}' is configured by more than one file",
                        code
                    )));
                }
            }
        }

        codes.sort();
        Ok(codes)
    }

    /// Only called with validated codes, so `code` cannot leave the directory
    fn find_file(&self, code: &str) -> Option<PathBuf> {
        EXTENSIONS
            .iter()
            .map(|extension| self.directory.join(format!("{}.{}", code, extension)))
            .find(|path| path.is_file())
    }
}

/// Parse and validate one configuration file
fn parse_file(code: &str, path: &Path) -> Result<EntityType> {
    let content = fs::read_to_string(path)?;
    let is_yaml = path
        .extension()
        .and_then(|extension| extension.to_str())
        .map_or(false, |extension| extension != "toml");

    let file: EntityTypeFile = if is_yaml {
        serde_yaml::from_str(&content).map_err(|e| {
            Error::ConfigError(format!("Malformed configuration for '{}': {}", code, e))
        })?
    } else {
        toml::from_str(&content).map_err(|e| {
            Error::ConfigError(format!("Malformed configuration for '{}': {}", code, e))
        })?
    };

    build_entity_type(code, file)
}

fn build_entity_type(code: &str, file: EntityTypeFile) -> Result<EntityType> {
    let version = file.version.unwrap_or(CONFIG_VERSION);
    if version != CONFIG_VERSION {
        return Err(Error::ConfigError(format!(
            "Entity type '{}' uses configuration version {}, only version {} is supported",
            code, version, CONFIG_VERSION
        )));
    }

    let entity_table = file
        .entity_table
        .unwrap_or_else(|| default_entity_table(code));
    validate_identifier("entity table", &entity_table)?;

    let mut seen = HashSet::new();
    let mut attributes = Vec::with_capacity(file.attributes.len());

    for raw in file.attributes {
        validate_identifier("attribute code", &raw.code)?;
        if !seen.insert(raw.code.clone()) {
            return Err(Error::ConfigError(format!(
                "Entity type '{}' declares attribute '{}' more than once",
                code, raw.code
            )));
        }
        if matches!(raw.code.as_str(), "id" | "created_at" | "updated_at") {
            return Err(Error::ConfigError(format!(
                "Attribute code '{}' of entity type '{}' is reserved",
                raw.code, code
            )));
        }
        if let Some(pattern) = raw
            .validation_rules
            .as_ref()
            .and_then(|rules| rules.pattern.as_deref())
        {
            Regex::new(pattern).map_err(|e| {
                Error::ConfigError(format!(
                    "Invalid pattern for attribute '{}' of '{}': {}",
                    raw.code, code, e
                ))
            })?;
        }

        if let Some(default) = &raw.default_value {
            if AttributeValue::coerce(default, raw.backend_type).is_none() {
                return Err(Error::ConfigError(format!(
                    "Default value {} of attribute '{}' of '{}' is not a valid {} value",
                    default, raw.code, code, raw.backend_type
                )));
            }
        }

        attributes.push(Attribute {
            label: raw.label.unwrap_or_else(|| raw.code.clone()),
            frontend_type: raw.frontend_type.unwrap_or_else(|| "text".to_string()),
            code: raw.code,
            backend_type: raw.backend_type,
            is_required: raw.is_required,
            is_unique: raw.is_unique,
            is_searchable: raw.is_searchable,
            is_filterable: raw.is_filterable,
            default_value: raw.default_value,
            sort_order: raw.sort_order,
            validation_rules: raw.validation_rules.filter(|rules| !rules.is_empty()),
        });
    }

    Ok(EntityType::new(
        code,
        &file.label.unwrap_or_else(|| code.to_string()),
        &entity_table,
        file.storage_strategy.unwrap_or_default(),
        attributes,
    ))
}
