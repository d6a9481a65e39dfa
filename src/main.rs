use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use skilld::cli;
use skilld::config::Settings;
use skilld::router::IntentMode;

#[derive(Parser, Debug)]
#[command(name = "skilld", version, about = "Agentic skill runtime")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the runtime (stdio transport by default)
    Serve {
        /// Serve over SSE on this address instead of stdio
        #[arg(long)]
        sse: Option<SocketAddr>,
    },
    /// Rebuild the routing index from disk
    Sync,
    /// Reindex a single source file
    Reindex {
        /// Path to a skill script
        path: PathBuf,
    },
    /// Diagnostic: print the route plan for a query
    Route {
        /// Natural-language query
        query: String,
        /// Retrieval strategy: exact, semantic, or hybrid
        #[arg(long, default_value = "hybrid")]
        intent: IntentMode,
    },
    /// One-shot dispatch of a command
    Run {
        /// Canonical name or alias, e.g. git.status
        name: String,
        /// JSON arguments object
        #[arg(default_value = "{}")]
        args: String,
    },
    /// Index health report
    Health,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logging goes to stderr: stdout belongs to the stdio transport.
    {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
    }

    let cli = Cli::parse();
    let config_path = cli
        .config
        .unwrap_or_else(|| skilld::runtime_home().join("config.yaml"));
    // Corrupt settings are fatal at boot.
    let settings = Settings::load(&config_path)?;

    match cli.command {
        Command::Serve { sse } => cli::cmd_serve(settings, config_path, sse).await,
        Command::Sync => cli::cmd_sync(settings).await,
        Command::Reindex { path } => cli::cmd_reindex(settings, &path).await,
        Command::Route { query, intent } => cli::cmd_route(settings, &query, intent).await,
        Command::Run { name, args } => cli::cmd_run(settings, &name, &args).await,
        Command::Health => cli::cmd_health(settings).await,
    }
}
