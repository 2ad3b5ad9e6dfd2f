//! Command handlers
//!
//! Each handler returns the process exit code. Errors are printed to stderr
//! as their actionable message. A reader closing stdout early (`| head`) is
//! not an error.

use std::io::{self, ErrorKind, Write};
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;

use crate::cli::commands::{AliasCommand, DownloadArgs, PromptArgs, SetupArgs};
use crate::error::MlcError;
use crate::inference::{engine, ConversationAdapter, FinishReason, Prompt, SessionManager};
use crate::models::{DownloadOutcome, GitInstaller, ModelManager};
use crate::storage::settings::load_settings;
use crate::storage::{PluginPaths, PluginSettings, StorageError};
use crate::types::{ConversationTurn, GenerationOptions};

/// Paths and settings for this invocation
struct Context {
    paths: PluginPaths,
    settings: PluginSettings,
}

impl Context {
    fn load() -> Result<Self, MlcError> {
        let paths = PluginPaths::discover()?;
        let settings = load_settings(&paths.settings_file);
        tracing::debug!("Using model directory {}", paths.models_dir.display());
        Ok(Self { paths, settings })
    }

    fn manager(&self, init_lfs: bool) -> ModelManager {
        let installer = GitInstaller::new(self.settings.libs_repo.clone()).with_lfs_init(init_lfs);
        ModelManager::new(self.paths.clone(), &self.settings, Arc::new(installer))
    }
}

/// Why a command stopped early
#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Mlc(#[from] MlcError),

    #[error("Cannot write output: {0}")]
    Output(#[from] io::Error),
}

fn exit_code(result: Result<(), CliError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(CliError::Output(e)) if e.kind() == ErrorKind::BrokenPipe => {
            tracing::debug!("Output closed by reader");
            0
        }
        Err(e) => {
            tracing::debug!("Command failed: {:?}", e);
            eprintln!("Error: {}", e);
            1
        }
    }
}

pub async fn handle_setup(args: &SetupArgs) -> i32 {
    exit_code(run_setup(args).await)
}

async fn run_setup(args: &SetupArgs) -> Result<(), CliError> {
    let ctx = Context::load()?;
    let mut out = io::stdout();
    writeln!(out, "Downloading prebuilt binaries if needed...")?;
    ctx.manager(args.yes).setup().await?;
    writeln!(out, "Ready to install models in {}", ctx.paths.plugin_dir.display())?;
    Ok(())
}

pub async fn handle_download(args: &DownloadArgs) -> i32 {
    exit_code(run_download(args).await)
}

async fn run_download(args: &DownloadArgs) -> Result<(), CliError> {
    let ctx = Context::load()?;
    let outcome = ctx
        .manager(args.yes)
        .download(&args.name_or_url, &args.aliases)
        .await?;

    let mut out = io::stdout();
    let (model_id, aliases) = match &outcome {
        DownloadOutcome::AlreadyInstalled { model_id, aliases } => {
            writeln!(out, "{} is already installed", model_id)?;
            (model_id, aliases)
        }
        DownloadOutcome::Downloaded { model_id, aliases } => {
            writeln!(out, "Downloaded {}", model_id)?;
            (model_id, aliases)
        }
    };
    if !aliases.is_empty() {
        writeln!(out, "Aliases for {}: {}", model_id, aliases.join(", "))?;
    }
    Ok(())
}

pub fn handle_models() -> i32 {
    exit_code(run_models())
}

fn run_models() -> Result<(), CliError> {
    let ctx = Context::load()?;
    let manager = ctx.manager(false);
    let mut out = io::stdout().lock();
    for listing in manager.list()? {
        writeln!(out, "{}", listing)?;
    }
    for (dir, missing) in manager.incomplete() {
        eprintln!("Incomplete bundle {}: missing {}", dir.display(), missing);
    }
    Ok(())
}

pub fn handle_models_dir() -> i32 {
    exit_code(run_models_dir())
}

fn run_models_dir() -> Result<(), CliError> {
    let ctx = Context::load()?;
    writeln!(io::stdout(), "{}", ctx.paths.models_dir.display())?;
    Ok(())
}

pub fn handle_alias(command: &AliasCommand) -> i32 {
    exit_code(run_alias(command))
}

fn run_alias(command: &AliasCommand) -> Result<(), CliError> {
    let ctx = Context::load()?;
    let manager = ctx.manager(false);
    let mut out = io::stdout().lock();
    match command {
        AliasCommand::Set { alias, model } => {
            let model_id = manager.set_alias(alias, model)?;
            writeln!(out, "{} -> {}", alias, model_id)?;
        }
        AliasCommand::List => {
            for (alias, model_id) in manager.aliases().all().map_err(MlcError::from)? {
                writeln!(out, "{}: {}", alias, model_id)?;
            }
        }
        AliasCommand::Remove { alias } => {
            if manager.aliases().remove(alias).map_err(MlcError::from)? {
                writeln!(out, "Removed alias {}", alias)?;
            } else {
                eprintln!("No alias named {}", alias);
            }
        }
    }
    Ok(())
}

pub async fn handle_prompt(args: &PromptArgs) -> i32 {
    exit_code(run_prompt(args).await)
}

/// Parse repeated `-o key=value` pairs
pub fn parse_options(pairs: &[String]) -> Result<GenerationOptions, MlcError> {
    let mut options = GenerationOptions::default();
    for pair in pairs {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            MlcError::InvalidOption(format!("'{}' is not in key=value form", pair))
        })?;
        options.set(key.trim(), value.trim())?;
    }
    Ok(options)
}

fn read_history(path: &std::path::Path) -> Result<Vec<ConversationTurn>, MlcError> {
    let json = std::fs::read_to_string(path).map_err(|e| StorageError::io(path, e))?;
    serde_json::from_str(&json).map_err(|e| StorageError::json(path, e).into())
}

/// Copy fragments to `out` until the channel closes or `out` stops accepting
/// them. Returning drops the receiver, which cancels the generation feeding it.
async fn print_fragments<W: Write>(
    mut rx: UnboundedReceiver<String>,
    mut out: W,
) -> io::Result<()> {
    while let Some(fragment) = rx.recv().await {
        out.write_all(fragment.as_bytes())?;
        out.flush()?;
    }
    Ok(())
}

async fn run_prompt(args: &PromptArgs) -> Result<(), CliError> {
    let ctx = Context::load()?;
    let manager = ctx.manager(false);

    let mut prompt = Prompt::new(args.text.clone()).with_options(parse_options(&args.options)?);
    if let Some(system) = &args.system {
        prompt = prompt.with_system(system.clone());
    }
    let history = match &args.history {
        Some(path) => read_history(path)?,
        None => Vec::new(),
    };

    let sessions = Arc::new(SessionManager::new(engine::default_factory()));
    let adapter = ConversationAdapter::new(
        manager.resolver().clone(),
        sessions,
        ctx.settings.generation.clone(),
    );

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let (result, printed) = tokio::join!(
        adapter.execute(&args.model, &prompt, &history, tx),
        print_fragments(rx, io::stdout())
    );
    let completion = result?;
    printed?;
    writeln!(io::stdout())?;
    if completion.finish == FinishReason::Cancelled {
        tracing::warn!("Output was cut short");
    }
    Ok(())
}
