//! Download and setup collaborator
//!
//! Fetching a bundle is delegated to an [`Installer`] so the rest of the crate
//! never shells out directly. [`GitInstaller`] is the real implementation:
//! bundles and compiled libraries are git-lfs repositories.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use crate::models::resolver::DownloadRequest;
use crate::storage::PluginPaths;

/// Installer errors
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("Could not run git: {0}")]
    GitUnavailable(String),

    #[error("Git LFS is not installed. Install it with 'brew install git-lfs' or your package manager")]
    GitLfsMissing,

    #[error("Git LFS is not initialised. Run 'git lfs install' or 'llm-mlc setup --yes'")]
    GitLfsNotInitialized,

    #[error("'{command}' failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} already exists; remove it before downloading again")]
    DestinationExists(PathBuf),
}

/// Something that can prepare the plugin directory and fetch bundles
#[async_trait]
pub trait Installer: Send + Sync {
    /// One-time preparation: tooling checks and compiled libraries
    async fn setup(&self, paths: &PluginPaths) -> Result<(), InstallError>;

    /// Place the bundle described by `request` at `destination`
    async fn install(&self, request: &DownloadRequest, destination: &Path)
        -> Result<(), InstallError>;
}

/// Output of one git invocation
struct GitOutput {
    stdout: String,
    stderr: String,
    success: bool,
}

/// Helper to run git commands
async fn run_git(args: &[&str]) -> Result<GitOutput, InstallError> {
    let mut cmd = Command::new("git");
    cmd.args(args);
    cmd.stdin(std::process::Stdio::null());

    tracing::debug!("Running git {}", args.join(" "));
    let output = cmd
        .output()
        .await
        .map_err(|e| InstallError::GitUnavailable(e.to_string()))?;

    Ok(GitOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        success: output.status.success(),
    })
}

async fn run_git_checked(args: &[&str]) -> Result<GitOutput, InstallError> {
    let output = run_git(args).await?;
    if !output.success {
        return Err(InstallError::CommandFailed {
            command: format!("git {}", args.join(" ")),
            stderr: output.stderr.trim().to_string(),
        });
    }
    Ok(output)
}

/// `git lfs status` output that only appears once LFS hooks are configured
pub fn lfs_status_means_installed(status: &str) -> bool {
    ["Objects to be pushed", "Objects to be committed", "Not in a Git repository"]
        .iter()
        .any(|marker| status.contains(marker))
}

/// Installer backed by the `git` CLI with the LFS extension
#[derive(Debug, Clone)]
pub struct GitInstaller {
    libs_repo: String,
    /// Run `git lfs install` when LFS is present but not initialised
    init_lfs: bool,
}

impl GitInstaller {
    pub fn new(libs_repo: impl Into<String>) -> Self {
        Self {
            libs_repo: libs_repo.into(),
            init_lfs: false,
        }
    }

    pub fn with_lfs_init(mut self, init_lfs: bool) -> Self {
        self.init_lfs = init_lfs;
        self
    }

    async fn ensure_lfs(&self) -> Result<(), InstallError> {
        if !run_git(&["lfs"]).await?.success {
            return Err(InstallError::GitLfsMissing);
        }

        let status = run_git(&["lfs", "status"]).await?;
        if status.success && lfs_status_means_installed(&status.stdout) {
            return Ok(());
        }

        if !self.init_lfs {
            return Err(InstallError::GitLfsNotInitialized);
        }
        tracing::info!("Running 'git lfs install'");
        run_git_checked(&["lfs", "install"]).await?;
        Ok(())
    }
}

#[async_trait]
impl Installer for GitInstaller {
    async fn setup(&self, paths: &PluginPaths) -> Result<(), InstallError> {
        tokio::fs::create_dir_all(&paths.plugin_dir)
            .await
            .map_err(|e| InstallError::Io {
                path: paths.plugin_dir.clone(),
                source: e,
            })?;

        self.ensure_lfs().await?;

        if paths.lib_dir.exists() {
            tracing::info!("Compiled libraries already present in {}", paths.lib_dir.display());
            return Ok(());
        }

        tokio::fs::create_dir_all(&paths.models_dir)
            .await
            .map_err(|e| InstallError::Io {
                path: paths.models_dir.clone(),
                source: e,
            })?;

        tracing::info!("Downloading prebuilt libraries from {}", self.libs_repo);
        let lib_dir = paths.lib_dir.to_string_lossy();
        run_git_checked(&["clone", self.libs_repo.as_str(), &*lib_dir]).await?;
        Ok(())
    }

    async fn install(
        &self,
        request: &DownloadRequest,
        destination: &Path,
    ) -> Result<(), InstallError> {
        if destination.exists() {
            return Err(InstallError::DestinationExists(destination.to_path_buf()));
        }

        self.ensure_lfs().await?;

        tracing::info!("Cloning {} into {}", request.source, destination.display());
        let dest = destination.to_string_lossy();
        let output = run_git_checked(&["clone", request.source.as_str(), &*dest]).await?;
        tracing::debug!("git clone: {}", output.stdout.trim());
        Ok(())
    }
}
