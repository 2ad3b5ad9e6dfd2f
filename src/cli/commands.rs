use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Run locally installed MLC chat models
#[derive(Parser, Debug)]
#[command(
    name = "llm-mlc",
    about = "Manage and run locally installed MLC chat models",
    version,
    long_about = "llm-mlc downloads prebuilt MLC model bundles, keeps aliases for them in the \
                  llm user directory and runs prompts against them with a cached engine."
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short = 'v', long, global = true, help = "Show debug logging")]
    pub verbose: bool,

    #[arg(
        short = 'q',
        long,
        global = true,
        conflicts_with = "verbose",
        help = "Quiet mode - only log errors"
    )]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(
        about = "Finish setting up MLC, step by step",
        long_about = "Checks that Git LFS is available and downloads the prebuilt runtime \
                      libraries into the model directory."
    )]
    Setup(SetupArgs),

    #[command(
        about = "Download and register a model from a URL or known name",
        long_about = "Downloads a prebuilt model bundle and records aliases for it.\n\n\
                      Known names:\n  \
                      Llama-2-7b-chat\n  \
                      Llama-2-13b-chat\n  \
                      Llama-2-70b-chat\n\n\
                      Examples:\n  \
                      llm-mlc download-model Llama-2-7b-chat --alias llama2\n  \
                      llm-mlc download-model https://huggingface.co/mlc-ai/mlc-chat-Llama-2-13b-chat-hf-q4f16_1"
    )]
    DownloadModel(DownloadArgs),

    #[command(about = "List installed MLC models")]
    Models,

    #[command(about = "Display the path to the directory holding downloaded models")]
    ModelsDir,

    #[command(subcommand, about = "Manage model aliases")]
    Alias(AliasCommand),

    #[command(
        about = "Run a prompt against an installed model",
        long_about = "Streams the model's reply to stdout.\n\n\
                      Examples:\n  \
                      llm-mlc prompt -m llama2 'Five names for a pet pelican'\n  \
                      llm-mlc prompt -m llama2 -o temperature=0.2 -s 'Answer in French' 'Hello'"
    )]
    Prompt(PromptArgs),
}

#[derive(Args, Debug, Clone)]
pub struct SetupArgs {
    #[arg(short = 'y', long, help = "Run 'git lfs install' if Git LFS is not initialised")]
    pub yes: bool,
}

#[derive(Args, Debug, Clone)]
pub struct DownloadArgs {
    #[arg(value_name = "NAME_OR_URL", help = "Known model name or https:// repository URL")]
    pub name_or_url: String,

    #[arg(
        short = 'a',
        long = "alias",
        value_name = "ALIAS",
        help = "Alias to use for this model (repeatable)"
    )]
    pub aliases: Vec<String>,

    #[arg(short = 'y', long, help = "Run 'git lfs install' if Git LFS is not initialised")]
    pub yes: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum AliasCommand {
    #[command(about = "Point an alias at a model")]
    Set {
        #[arg(value_name = "ALIAS")]
        alias: String,
        #[arg(value_name = "MODEL")]
        model: String,
    },

    #[command(about = "List aliases")]
    List,

    #[command(about = "Remove an alias")]
    Remove {
        #[arg(value_name = "ALIAS")]
        alias: String,
    },
}

#[derive(Args, Debug, Clone)]
pub struct PromptArgs {
    #[arg(short = 'm', long, value_name = "MODEL", help = "Model id, alias, known name or URL")]
    pub model: String,

    #[arg(short = 's', long, value_name = "SYSTEM", help = "System prompt")]
    pub system: Option<String>,

    #[arg(
        short = 'o',
        long = "option",
        value_name = "KEY=VALUE",
        help = "Generation option: temperature, top_p, repetition_penalty or max_gen_len"
    )]
    pub options: Vec<String>,

    #[arg(
        long,
        value_name = "FILE",
        help = "JSON file with prior turns: [{\"role\": \"user\", \"text\": \"...\"}, ...]"
    )]
    pub history: Option<PathBuf>,

    #[arg(value_name = "TEXT", help = "Prompt text")]
    pub text: String,
}
