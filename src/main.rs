use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "chatchain")]
#[command(
    version,
    about = "Role-playing agent company that builds software through a chain of dialogue phases"
)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Directory holding one sub-directory of config files per company
    #[arg(long, global = true, default_value = "CompanyConfig")]
    pub company_root: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the chain of a company on a task
    Run(RunArgs),
    /// Load and validate a company configuration without calling any model
    Validate {
        /// Company name (sub-directory of the company root)
        #[arg(long, default_value = "Default")]
        config: String,
    },
    /// List the model catalog and the supported backends
    Models,
}

#[derive(Args, Clone)]
pub struct RunArgs {
    /// Company name (sub-directory of the company root)
    #[arg(long, default_value = "Default")]
    pub config: String,

    /// Organization name, part of the artifact directory name
    #[arg(long, default_value = "DefaultOrganization")]
    pub org: String,

    /// Prompt of the software to build
    #[arg(long, default_value = "Develop a basic Gomoku game.")]
    pub task: String,

    /// Name of the software, part of the artifact directory name
    #[arg(long, default_value = "Gomoku")]
    pub name: String,

    #[arg(long, default_value = "gpt-3.5-turbo")]
    pub model: String,

    #[arg(long, default_value = "openai")]
    pub platform: String,

    /// API style; defaults to the first one the platform supports
    #[arg(long)]
    pub api_type: Option<String>,

    /// Existing code base for incremental development
    #[arg(long)]
    pub path: Option<PathBuf>,

    /// Directory receiving the artifact directories
    #[arg(long, default_value = "WareHouse")]
    pub warehouse: PathBuf,

    /// Bound the dialogue history each persona sends per request
    #[arg(long)]
    pub message_window: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Run(args) => cmd::cmd_run(&cli, args).await?,
        Commands::Validate { config } => cmd::cmd_validate(&cli, config)?,
        Commands::Models => cmd::cmd_models(&cli)?,
    }

    Ok(())
}
