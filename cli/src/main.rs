use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod util;

use commands::experiment::SampleArgs;
use commands::policy::{PauseArgs, PolicyCommands};
use commands::session::SessionCommands;
use util::exit_error;

#[derive(Parser)]
#[command(
    name = "learnloop",
    version,
    about = "LearnLoop CLI: start, follow and decide learning sessions for deployed agents"
)]
struct Cli {
    /// API base URL
    #[arg(long, env = "LEARNLOOP_API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    /// Agent slug the learning commands act on
    #[arg(long, short = 'a', env = "LEARNLOOP_AGENT", global = true)]
    agent: Option<String>,

    /// Log requests to stderr
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check API health
    Health,
    /// Learning session operations
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },
    /// Learning policy operations
    Policy {
        #[command(subcommand)]
        command: PolicyCommands,
    },
    /// Pause learning for the agent
    Pause(PauseArgs),
    /// Resume learning for the agent
    Resume {
        #[arg(long, env = "LEARNLOOP_ACTOR")]
        actor: Option<String>,
    },
    /// Learning metrics summary
    Metrics,
    /// List experiments (active by default)
    Experiments {
        /// `active`, `all`, or an experiment status
        #[arg(long)]
        status: Option<String>,
    },
    /// Ask which arm a run should be dispatched to
    Route {
        #[arg(long)]
        run_id: String,
    },
    /// Record an experiment sample
    Sample(SampleArgs),
}

fn init_tracing(verbose: bool) {
    if !verbose {
        return;
    }
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "learnloop=debug".into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let api_url = cli.api_url;
    let code = match cli.command {
        Commands::Health => commands::health::run(&api_url).await,
        command => {
            let agent = cli.agent.unwrap_or_else(|| {
                exit_error(
                    "agent is required for learning commands",
                    Some("Set --agent or LEARNLOOP_AGENT"),
                )
            });
            run_learning(&api_url, &agent, command).await
        }
    };

    std::process::exit(code);
}

async fn run_learning(api_url: &str, agent: &str, command: Commands) -> i32 {
    match command {
        Commands::Health => commands::health::run(api_url).await,
        Commands::Session { command } => commands::session::run(api_url, agent, command).await,
        Commands::Policy { command } => commands::policy::run(api_url, agent, command).await,
        Commands::Pause(args) => commands::policy::pause(api_url, agent, args).await,
        Commands::Resume { actor } => commands::policy::resume(api_url, agent, actor).await,
        Commands::Metrics => commands::experiment::metrics(api_url, agent).await,
        Commands::Experiments { status } => {
            commands::experiment::list(api_url, agent, status).await
        }
        Commands::Route { run_id } => commands::experiment::route(api_url, agent, &run_id).await,
        Commands::Sample(args) => commands::experiment::sample(api_url, agent, args).await,
    }
}
