//! Model management
//!
//! Ties together the alias file, the bundle scanner, the known-model catalog
//! and the installer. [`ModelManager`] backs every CLI command that lists,
//! aliases or downloads models.

pub mod catalog;
pub mod install;
pub mod resolver;

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::MlcError;
use crate::storage::aliases::validate_alias;
use crate::storage::{AliasRegistry, ModelStore, PluginPaths, PluginSettings, ScanEntry};
use crate::types::ModelBundle;

pub use install::{GitInstaller, InstallError, Installer};
pub use resolver::{DownloadRequest, Resolution, Resolver};

/// An installed bundle together with the aliases pointing at it
#[derive(Debug, Clone, PartialEq)]
pub struct ModelListing {
    pub bundle: ModelBundle,
    pub aliases: Vec<String>,
}

impl std::fmt::Display for ModelListing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.bundle)?;
        if !self.aliases.is_empty() {
            write!(f, " (aliases: {})", self.aliases.join(", "))?;
        }
        Ok(())
    }
}

/// What `download` ended up doing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// The bundle was already on disk; only aliases were recorded
    AlreadyInstalled { model_id: String, aliases: Vec<String> },
    Downloaded { model_id: String, aliases: Vec<String> },
}

pub struct ModelManager {
    paths: PluginPaths,
    resolver: Resolver,
    installer: Arc<dyn Installer>,
}

impl ModelManager {
    pub fn new(paths: PluginPaths, settings: &PluginSettings, installer: Arc<dyn Installer>) -> Self {
        let store = ModelStore::from_paths(&paths, settings.preferred_backend);
        Self::with_store(paths, store, installer)
    }

    /// Manager over an explicit store, bypassing backend detection
    pub fn with_store(paths: PluginPaths, store: ModelStore, installer: Arc<dyn Installer>) -> Self {
        let resolver = Resolver::new(AliasRegistry::new(paths.aliases_file.clone()), store);
        Self {
            paths,
            resolver,
            installer,
        }
    }

    pub fn paths(&self) -> &PluginPaths {
        &self.paths
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn aliases(&self) -> &AliasRegistry {
        self.resolver.aliases()
    }

    /// Prepare the plugin directory and fetch compiled libraries
    pub async fn setup(&self) -> Result<(), MlcError> {
        self.installer.setup(&self.paths).await?;
        tracing::info!("Ready to install models in {}", self.paths.models_dir.display());
        Ok(())
    }

    /// Make `name_or_url` available locally and record aliases for it
    ///
    /// Aliases are validated before anything is fetched. Short names from the
    /// catalog are recorded as aliases too.
    pub async fn download(
        &self,
        name_or_url: &str,
        aliases: &[String],
    ) -> Result<DownloadOutcome, MlcError> {
        for alias in aliases {
            validate_alias(alias)?;
        }

        match self.resolver.resolve(name_or_url)? {
            Resolution::Installed(bundle) => {
                tracing::info!("{} is already installed", bundle.model_id);
                let aliases = self.record_aliases(&bundle.model_id, aliases.iter())?;
                Ok(DownloadOutcome::AlreadyInstalled {
                    model_id: bundle.model_id,
                    aliases,
                })
            }
            Resolution::NeedsDownload(request) => {
                if !self.paths.models_dir.is_dir() {
                    return Err(MlcError::Setup(format!(
                        "The model directory {} does not exist",
                        self.paths.models_dir.display()
                    )));
                }

                let destination = self.paths.models_dir.join(&request.model_id);
                self.installer.install(&request, &destination).await?;

                if self.resolver.store().find(&request.model_id).is_none() {
                    tracing::warn!(
                        "{} was downloaded but is not runnable yet; check that a compiled library exists in {}",
                        request.model_id,
                        self.paths.lib_dir.display()
                    );
                }

                let aliases = self.record_aliases(
                    &request.model_id,
                    aliases.iter().chain(request.suggested_aliases.iter()),
                )?;
                Ok(DownloadOutcome::Downloaded {
                    model_id: request.model_id,
                    aliases,
                })
            }
        }
    }

    /// Installed bundles with their aliases, sorted by id
    pub fn list(&self) -> Result<Vec<ModelListing>, MlcError> {
        let all_aliases = self.aliases().all()?;
        Ok(self
            .resolver
            .store()
            .list_installed()
            .into_iter()
            .map(|bundle| {
                let aliases = all_aliases
                    .iter()
                    .filter(|(_, target)| **target == bundle.model_id)
                    .map(|(alias, _)| alias.clone())
                    .collect();
                ModelListing { bundle, aliases }
            })
            .collect())
    }

    /// Bundle directories that are present but not runnable
    pub fn incomplete(&self) -> Vec<(PathBuf, String)> {
        self.resolver
            .store()
            .scan()
            .filter_map(|entry| match entry {
                ScanEntry::Incomplete { dir, missing } => Some((dir, missing)),
                ScanEntry::Complete(_) => None,
            })
            .collect()
    }

    /// Point `alias` at whatever `target` resolves to
    ///
    /// Installed targets are stored under their canonical id. Anything else is
    /// stored verbatim so an alias can be recorded ahead of a download.
    pub fn set_alias(&self, alias: &str, target: &str) -> Result<String, MlcError> {
        let model_id = match self.resolver.resolve(target) {
            Ok(Resolution::Installed(bundle)) => bundle.model_id,
            Ok(Resolution::NeedsDownload(request)) => request.model_id,
            Err(MlcError::UnknownModel { .. }) | Err(MlcError::ModelNotInstalled { .. }) => {
                tracing::warn!("'{}' is not installed; recording alias anyway", target);
                target.to_string()
            }
            Err(e) => return Err(e),
        };
        self.aliases().set(alias, &model_id)?;
        Ok(model_id)
    }

    fn record_aliases<'a>(
        &self,
        model_id: &str,
        aliases: impl Iterator<Item = &'a String>,
    ) -> Result<Vec<String>, MlcError> {
        let mut recorded: Vec<String> = Vec::new();
        for alias in aliases {
            if recorded.contains(alias) {
                continue;
            }
            self.aliases().set(alias, model_id)?;
            recorded.push(alias.clone());
        }
        Ok(recorded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::scanner::tests::{make_bundle, store};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Installer that lays out a complete bundle instead of cloning
    #[derive(Default)]
    struct FakeInstaller {
        installs: AtomicUsize,
        setups: AtomicUsize,
    }

    #[async_trait]
    impl Installer for FakeInstaller {
        async fn setup(&self, paths: &PluginPaths) -> Result<(), InstallError> {
            self.setups.fetch_add(1, Ordering::SeqCst);
            std::fs::create_dir_all(&paths.lib_dir).map_err(|e| InstallError::Io {
                path: paths.lib_dir.clone(),
                source: e,
            })
        }

        async fn install(
            &self,
            request: &DownloadRequest,
            destination: &Path,
        ) -> Result<(), InstallError> {
            self.installs.fetch_add(1, Ordering::SeqCst);
            let root = destination.parent().unwrap();
            make_bundle(root, &request.model_id, true);
            Ok(())
        }
    }

    fn manager(user_dir: &Path) -> (ModelManager, Arc<FakeInstaller>) {
        let paths = PluginPaths::from_user_dir(user_dir);
        let installer = Arc::new(FakeInstaller::default());
        let manager = ModelManager::with_store(paths.clone(), store(&paths.models_dir), installer.clone());
        (manager, installer)
    }

    #[tokio::test]
    async fn test_download_requires_setup() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, installer) = manager(dir.path());

        let result = manager.download("Llama-2-7b-chat", &[]).await;
        assert!(matches!(result, Err(MlcError::Setup(_))));
        assert_eq!(installer.installs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_download_short_name_records_aliases() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, installer) = manager(dir.path());
        manager.setup().await.unwrap();
        assert_eq!(installer.setups.load(Ordering::SeqCst), 1);

        let outcome = manager
            .download("Llama-2-7b-chat", &["llama2".to_string()])
            .await
            .unwrap();
        assert_eq!(
            outcome,
            DownloadOutcome::Downloaded {
                model_id: "mlc-chat-Llama-2-7b-chat-hf-q4f16_1".to_string(),
                aliases: vec!["llama2".to_string(), "Llama-2-7b-chat".to_string()],
            }
        );

        let listing = manager.list().unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(
            listing[0].to_string(),
            "MlcModel: mlc-chat-Llama-2-7b-chat-hf-q4f16_1 (aliases: Llama-2-7b-chat, llama2)"
        );
    }

    #[tokio::test]
    async fn test_download_of_installed_model_only_sets_aliases() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, installer) = manager(dir.path());
        make_bundle(&manager.paths().models_dir, "X", true);

        let outcome = manager
            .download("https://example.com/models/X", &["x".to_string()])
            .await
            .unwrap();
        assert!(matches!(outcome, DownloadOutcome::AlreadyInstalled { .. }));
        assert_eq!(installer.installs.load(Ordering::SeqCst), 0);
        assert_eq!(manager.aliases().get("x").unwrap().as_deref(), Some("X"));
    }

    #[tokio::test]
    async fn test_invalid_alias_rejected_before_download() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, installer) = manager(dir.path());
        manager.setup().await.unwrap();

        let result = manager
            .download("Llama-2-7b-chat", &["lib".to_string()])
            .await;
        assert!(matches!(result, Err(MlcError::InvalidAlias { .. })));
        assert_eq!(installer.installs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_name_is_not_downloaded() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, installer) = manager(dir.path());
        manager.setup().await.unwrap();

        let result = manager.download("not-a-model", &[]).await;
        assert!(matches!(result, Err(MlcError::UnknownModel { .. })));
        assert_eq!(installer.installs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_set_alias_canonicalises_installed_target() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager(dir.path());
        make_bundle(&manager.paths().models_dir, "mlc-chat-Llama-2-7b-chat-hf-q4f16_1", true);

        let id = manager.set_alias("l2", "Llama-2-7b-chat").unwrap();
        assert_eq!(id, "mlc-chat-Llama-2-7b-chat-hf-q4f16_1");

        let id = manager.set_alias("later", "some-future-model").unwrap();
        assert_eq!(id, "some-future-model");
    }

    #[test]
    fn test_incomplete_bundles_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager(dir.path());
        make_bundle(&manager.paths().models_dir, "mlc-chat-half-q4f16_1", false);

        assert!(manager.list().unwrap().is_empty());
        assert_eq!(manager.incomplete().len(), 1);
    }
}
