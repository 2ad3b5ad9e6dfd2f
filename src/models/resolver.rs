//! Model name resolution
//!
//! Turns whatever the user typed (alias, canonical id, short name or URL) into
//! either an installed bundle or a description of what would have to be
//! downloaded. Resolution only reads state; it never fetches anything.

use crate::error::MlcError;
use crate::models::catalog;
use crate::storage::{AliasRegistry, ModelStore};
use crate::types::ModelBundle;

/// What a download would need to fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    /// Canonical id the bundle will be stored under
    pub model_id: String,
    /// Repository to clone
    pub source: String,
    /// Aliases worth recording once installed
    pub suggested_aliases: Vec<String>,
}

/// Outcome of a successful resolution
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Installed(ModelBundle),
    NeedsDownload(DownloadRequest),
}

#[derive(Debug, Clone)]
pub struct Resolver {
    aliases: AliasRegistry,
    store: ModelStore,
}

impl Resolver {
    pub fn new(aliases: AliasRegistry, store: ModelStore) -> Self {
        Self { aliases, store }
    }

    pub fn aliases(&self) -> &AliasRegistry {
        &self.aliases
    }

    pub fn store(&self) -> &ModelStore {
        &self.store
    }

    /// Classify a requested name; first match wins
    pub fn resolve(&self, requested: &str) -> Result<Resolution, MlcError> {
        let requested = requested.trim();
        if requested.is_empty() {
            return Err(MlcError::UnknownModel {
                name: requested.to_string(),
            });
        }

        if let Some(model_id) = self.aliases.get(requested)? {
            tracing::debug!("Alias '{}' -> {}", requested, model_id);
            return self.resolve_alias_target(&model_id);
        }

        if let Some(bundle) = self.store.find(requested) {
            return Ok(Resolution::Installed(bundle));
        }

        if catalog::is_url(requested) {
            let model_id = catalog::derive_model_id(requested).ok_or_else(|| {
                MlcError::UnknownModel {
                    name: requested.to_string(),
                }
            })?;
            return Ok(self.installed_or_download(model_id, requested, Vec::new()));
        }

        if let Some(known) = catalog::find_by_name(requested) {
            return Ok(self.installed_or_download(
                known.model_id(),
                known.source,
                vec![known.short_name.to_string()],
            ));
        }

        Err(MlcError::UnknownModel {
            name: requested.to_string(),
        })
    }

    /// Resolve and insist on an installed bundle
    pub fn resolve_installed(&self, requested: &str) -> Result<ModelBundle, MlcError> {
        match self.resolve(requested)? {
            Resolution::Installed(bundle) => Ok(bundle),
            Resolution::NeedsDownload(request) => Err(MlcError::ModelNotInstalled {
                fetch: if catalog::is_url(requested) || catalog::find_by_name(requested).is_some() {
                    requested.to_string()
                } else {
                    request.source
                },
                model_id: request.model_id,
            }),
        }
    }

    fn resolve_alias_target(&self, model_id: &str) -> Result<Resolution, MlcError> {
        if let Some(bundle) = self.store.find(model_id) {
            return Ok(Resolution::Installed(bundle));
        }
        match catalog::find_by_model_id(model_id) {
            Some(known) => Ok(Resolution::NeedsDownload(DownloadRequest {
                model_id: model_id.to_string(),
                source: known.source.to_string(),
                suggested_aliases: vec![known.short_name.to_string()],
            })),
            None => Err(MlcError::ModelNotInstalled {
                model_id: model_id.to_string(),
                fetch: "<repository-url>".to_string(),
            }),
        }
    }

    fn installed_or_download(
        &self,
        model_id: String,
        source: &str,
        suggested_aliases: Vec<String>,
    ) -> Resolution {
        match self.store.find(&model_id) {
            Some(bundle) => Resolution::Installed(bundle),
            None => Resolution::NeedsDownload(DownloadRequest {
                model_id,
                source: source.to_string(),
                suggested_aliases,
            }),
        }
    }
}
