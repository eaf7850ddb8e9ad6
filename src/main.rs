//! panel-proxy: logs into a web panel by scraping its login form and re-exposes
//! its numbers and SMS data endpoints as a small JSON API.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod client;
mod config;
mod health;
mod login;
mod metrics;
mod panel;
mod session;

use config::Config;
use session::{CookieFile, SessionHolder, mask_cookie};

#[derive(Parser)]
#[command(name = "panel-proxy")]
#[command(author, version, about = "Login-scraping proxy for a web panel")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    #[arg(short, long, global = true)]
    quiet: bool,

    /// Optional YAML config file; environment variables override it
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server (default)
    Serve,

    /// Log in once, store the session cookie and print the result
    Login {
        /// Username (defaults to PANEL_USER)
        #[arg(long)]
        user: Option<String>,

        /// Password (defaults to PANEL_PASS)
        #[arg(long)]
        pass: Option<String>,
    },

    /// Print the stored session cookie (masked)
    Session,

    /// Validate configuration and print it (password redacted)
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    init_logging(&config, &cli);

    match &cli.command {
        None | Some(Commands::Serve) => run_serve(config).await,
        Some(Commands::Login { user, pass }) => {
            run_login(&config, user.as_deref(), pass.as_deref()).await
        }
        Some(Commands::Session) => run_session(&config),
        Some(Commands::Validate) => run_validate(&config),
    }
}

/// Init tracing from config (log_format, log_level). --quiet / --verbose take precedence.
fn init_logging(config: &Config, cli: &Cli) {
    let use_json = config.log_format.as_deref() == Some("json");
    let filter = if cli.quiet {
        EnvFilter::new("error")
    } else if cli.verbose {
        EnvFilter::new("panel_proxy=debug")
    } else {
        EnvFilter::new(format!("panel_proxy={}", config.log_level))
    };
    if use_json {
        let json_fmt = tracing_subscriber::fmt::format()
            .json()
            .with_current_span(false)
            .with_span_list(false);
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false)
                    .event_format(json_fmt),
            )
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true),
            )
            .with(filter)
            .init();
    }
}

async fn run_serve(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    if config.panel_user.is_empty() || config.panel_pass.is_empty() {
        tracing::warn!("PANEL_USER / PANEL_PASS not set; POST /login needs explicit credentials");
    }
    if config.metrics_enabled {
        metrics::init().map_err(|e| anyhow::anyhow!("metrics init: {}", e))?;
    }

    let session = SessionHolder::load(CookieFile::new(&config.cookie_file));
    if let Some(masked) = session.masked().await {
        tracing::info!(cookie = %masked, "loaded session");
    }

    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("bind {}: {}", addr, e))?;
    let local = listener.local_addr()?;
    tracing::info!(
        %local,
        panel = %config.panel_base(),
        metrics = config.metrics_enabled,
        "proxy listening"
    );

    let state = Arc::new(api::AppState::new(config, session)?);
    api::serve(listener, state, shutdown_signal()).await?;
    tracing::info!("proxy stopped");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("ctrl_c handler: {}", e);
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::error!("SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown requested");
}

async fn run_login(config: &Config, user: Option<&str>, pass: Option<&str>) -> anyhow::Result<()> {
    config.validate()?;
    let session = SessionHolder::load(CookieFile::new(&config.cookie_file));
    let client = client::PanelClient::new(config)?;
    let creds = login::Credentials::resolve(user, pass, &config.panel_user, &config.panel_pass);
    let (_, body) = api::login_and_store(&client, &session, &creds).await;
    println!("{}", serde_json::to_string_pretty(&body)?);
    if !body.ok {
        anyhow::bail!("login failed");
    }
    Ok(())
}

fn run_session(config: &Config) -> anyhow::Result<()> {
    let stored = CookieFile::new(&config.cookie_file).load();
    let body = api::SessionResponse {
        cookie: mask_cookie(stored.as_deref()),
    };
    println!("{}", serde_json::to_string(&body)?);
    Ok(())
}

fn run_validate(config: &Config) -> anyhow::Result<()> {
    match config.validate() {
        Ok(()) => {
            println!("{}", serde_json::to_string_pretty(config)?);
            Ok(())
        }
        Err(e) => {
            eprintln!("config invalid: {:#}", e);
            std::process::exit(1);
        }
    }
}
