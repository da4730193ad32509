mod app;
mod config_commands;
mod exec_commands;
mod job_commands;
mod sandbox_commands;

use std::path::PathBuf;

use {
    anyhow::Result,
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use app::{App, ProjectArgs, UserArgs};

#[derive(Parser)]
#[command(
    name = "labrun",
    version,
    about = "labrun: isolated code execution and per-user containers"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file (defaults to ./labrun.toml, then ~/.config/labrun/).
    #[arg(long, global = true, env = "LABRUN_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the terminal WebSocket server.
    Serve {
        /// Address to bind to (overrides config value).
        #[arg(long)]
        bind: Option<String>,
        /// Port to listen on (overrides config value).
        #[arg(long)]
        port: Option<u16>,
    },
    /// Show which image a user's code would run in.
    Resolve {
        #[command(flatten)]
        user: UserArgs,
        /// Project id; checks the project image first when given.
        #[arg(long, requires = "project")]
        project_id: Option<u64>,
        #[arg(long, requires = "project_id")]
        project: Option<String>,
        #[arg(long)]
        owner: Option<String>,
    },
    /// Per-user sandboxes and custom images.
    Sandbox {
        #[command(flatten)]
        user: UserArgs,
        #[command(subcommand)]
        action: sandbox_commands::SandboxAction,
    },
    /// Run a script in the user's container.
    Exec(exec_commands::ExecArgs),
    /// Cluster scheduler batch jobs.
    Job {
        #[command(subcommand)]
        action: job_commands::JobAction,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr)
                    .with_ansi(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Config { action } => config_commands::handle_config(action, config_path),
        Commands::Serve { bind, port } => {
            let config = app::load_config(config_path)?;
            info!(version = env!("CARGO_PKG_VERSION"), "labrun starting");
            let bind = bind.unwrap_or_else(|| config.server.bind.clone());
            let port = port.unwrap_or(config.server.port);
            let app = App::build(config)?;
            labrun_terminal::serve(&bind, port, app.terminal_service()?).await?;
            Ok(())
        },
        Commands::Resolve {
            user,
            project_id,
            project,
            owner,
        } => {
            let app = App::build(app::load_config(config_path)?)?;
            let user = user.identity()?;
            let project = match (project_id, project) {
                (Some(project_id), Some(project)) => Some(
                    ProjectArgs {
                        project_id,
                        project,
                        owner,
                    }
                    .project_ref(&user)?,
                ),
                _ => None,
            };
            let resolved = app.resolver.resolve_scoped(&user, project.as_ref());
            println!("{}\t{}", resolved.scope, resolved.path.display());
            Ok(())
        },
        Commands::Sandbox { user, action } => {
            let app = App::build(app::load_config(config_path)?)?;
            sandbox_commands::handle_sandbox(&app, &user.identity()?, action).await
        },
        Commands::Exec(args) => {
            let app = App::build(app::load_config(config_path)?)?;
            exec_commands::handle_exec(&app, args).await
        },
        Commands::Job { action } => {
            let app = App::build(app::load_config(config_path)?)?;
            job_commands::handle_job(&app, action).await
        },
    }
}
