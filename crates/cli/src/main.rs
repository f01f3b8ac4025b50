mod token_commands;

use std::{path::PathBuf, process::ExitCode};

use {
    clap::{Parser, Subcommand},
    cloudlogin_config::Config,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use crate::token_commands::{OutputFormat, Target};

#[derive(Parser)]
#[command(name = "cloudlogin", version, about = "Fetch and cache OIDC tokens for cloud CLIs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to the platform config directory).
    #[arg(long, global = true, env = "CLOUDLOGIN_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a fresh ID token, logging in if needed.
    Token {
        #[command(flatten)]
        target: Target,
        /// Use the device authorization grant instead of a browser redirect.
        #[arg(long)]
        device: bool,
        #[arg(long, value_enum, default_value_t = OutputFormat::IdToken)]
        format: OutputFormat,
    },
    /// Show the cached token without refreshing it.
    Status {
        #[command(flatten)]
        target: Target,
    },
    /// Remove the cached token.
    Logout {
        #[command(flatten)]
        target: Target,
    },
}

/// Logs go to stderr; stdout carries the token.
fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_thread_ids(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

/// Cancel in-flight work on Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("interrupt received");
            trigger.cancel();
        }
    });
    cancel
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref())?;
    let cancel = cancel_on_ctrl_c();

    match cli.command {
        Commands::Token {
            target,
            device,
            format,
        } => token_commands::token(&config, &target, device, format, &cancel).await,
        Commands::Status { target } => token_commands::status(&config, &target).await,
        Commands::Logout { target } => token_commands::logout_command(&config, &target).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "cloudlogin starting");

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<cloudlogin_oauth::Error>() {
                Some(err) if err.is_user_actionable() => eprintln!("error: {err}"),
                _ => eprintln!("error: {e:#}"),
            }
            ExitCode::FAILURE
        },
    }
}
