/// CI build
use clap::{Parser, Subcommand};
use log::error;
use thiserror::Error;

mod catapult;
mod config;
mod docker;
mod lambda;
mod launch;
mod pipeline;
mod validate;

/// Build, publish and deploy every application declared in a repository
/// checkout. Expects to run with the repository root as the working
/// directory.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Directory containing per-application launch configuration files.
    #[arg(long, default_value = "./launch")]
    launch_dir: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the identifiers of all discovered applications, space
    /// separated.
    Detect,
    /// Run the pre-flight policy checks and exit.
    Validate,
    /// Build every discovered application, publish the artifacts, and
    /// deploy them when on the primary branch.
    ArtifactBuildPublishDeploy,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration: {0}")]
    Config(#[from] config::Error),

    #[error("discover applications: {0}")]
    Launch(#[from] launch::Error),

    #[error("validation: {0}")]
    Validate(#[from] validate::Error),

    #[error(transparent)]
    Pipeline(#[from] pipeline::Error),
}

const EXIT_FAILURE: i32 = 1;
// Policy violations get their own exit code so CI can distinguish a
// misconfigured repository from an execution failure.
const EXIT_VALIDATION: i32 = 2;

#[tokio::main]
async fn main() {
    env_logger::init();
    match run().await {
        Ok(_) => std::process::exit(0),
        Err(err) => {
            error!("fatal: {err}");
            let code = match err {
                Error::Validate(validate::Error::Policy(_)) => EXIT_VALIDATION,
                _ => EXIT_FAILURE,
            };
            std::process::exit(code)
        }
    }
}

async fn run() -> Result<(), Error> {
    let args = Cli::parse();
    let apps = launch::discover(&args.launch_dir)?;

    match args.command {
        Commands::Detect => {
            // Never fails beyond discovery, and needs no run
            // configuration from the environment.
            let ids: Vec<&str> = apps.keys().map(String::as_str).collect();
            println!("{}", ids.join(" "));
            Ok(())
        }
        Commands::Validate => {
            let cfg = config::Config::from_env()?;
            Ok(validate::run(&cfg).await?)
        }
        Commands::ArtifactBuildPublishDeploy => {
            let cfg = config::Config::from_env()?;
            // Validate on every full run, not just in validate mode.
            validate::run(&cfg).await?;
            Ok(pipeline::run(&cfg, &apps).await?)
        }
    }
}
