//! Alias storage
//!
//! Short names mapped to canonical model ids, kept in the flat JSON object
//! the host tool already uses for its own aliases. The file is re-read on
//! every query and replaced atomically on every change.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::MlcError;
use crate::storage::{write_atomic, StorageError};

/// Names an alias may never take
pub const RESERVED_ALIASES: &[&str] = &["lib", "default", "mlc"];

/// Persisted alias -> canonical id mapping
#[derive(Debug, Clone)]
pub struct AliasRegistry {
    path: PathBuf,
}

impl AliasRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Canonical id for an alias, `None` when unset
    pub fn get(&self, alias: &str) -> Result<Option<String>, StorageError> {
        Ok(self.all()?.remove(alias))
    }

    /// Map `alias` to `model_id`, replacing any previous mapping
    pub fn set(&self, alias: &str, model_id: &str) -> Result<(), MlcError> {
        validate_alias(alias)?;
        if model_id.trim().is_empty() {
            return Err(MlcError::InvalidAlias {
                alias: alias.to_string(),
                reason: "target model id is empty".to_string(),
            });
        }

        let mut aliases = self.all()?;
        if let Some(previous) = aliases.insert(alias.to_string(), model_id.to_string()) {
            if previous != model_id {
                tracing::info!("Alias '{}' moved from {} to {}", alias, previous, model_id);
            }
        }
        self.write(&aliases)?;
        tracing::debug!("Alias '{}' -> {}", alias, model_id);
        Ok(())
    }

    /// Drop an alias; returns whether it existed
    pub fn remove(&self, alias: &str) -> Result<bool, StorageError> {
        let mut aliases = self.all()?;
        if aliases.remove(alias).is_none() {
            return Ok(false);
        }
        self.write(&aliases)?;
        Ok(true)
    }

    /// Every alias, including ones the host set for other plugins
    pub fn all(&self) -> Result<BTreeMap<String, String>, StorageError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let json = fs::read_to_string(&self.path).map_err(|e| StorageError::io(&self.path, e))?;
        if json.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&json).map_err(|e| StorageError::json(&self.path, e))
    }

    /// Aliases pointing at one model id
    pub fn aliases_for(&self, model_id: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|(_, target)| target == model_id)
            .map(|(alias, _)| alias)
            .collect())
    }

    fn write(&self, aliases: &BTreeMap<String, String>) -> Result<(), StorageError> {
        let json =
            serde_json::to_string_pretty(aliases).map_err(|e| StorageError::json(&self.path, e))?;
        write_atomic(&self.path, json.as_bytes())
    }
}

/// Reject empty, reserved or URL-shaped alias names
pub fn validate_alias(alias: &str) -> Result<(), MlcError> {
    let invalid = |reason: &str| MlcError::InvalidAlias {
        alias: alias.to_string(),
        reason: reason.to_string(),
    };

    if alias.trim().is_empty() {
        return Err(invalid("alias is empty"));
    }
    if alias.trim() != alias || alias.chars().any(char::is_whitespace) {
        return Err(invalid("alias must not contain whitespace"));
    }
    if RESERVED_ALIASES.contains(&alias) {
        return Err(invalid("this name is reserved"));
    }
    if alias.contains("://") {
        return Err(invalid("an alias cannot look like a URL"));
    }
    Ok(())
}
