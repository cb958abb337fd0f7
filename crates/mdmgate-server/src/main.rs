//! mdmgate server
//!
//! MDM check-in and command server with APNs push and external sync jobs.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use mdmgate_core::ServerConfig;
use mdmgate_core::tracing_init::init_tracing;
use mdmgate_server::auth::JwtManager;
use mdmgate_server::auth::operator::permission;
use mdmgate_server::credentials::spawn_push_cert_monitor;
use mdmgate_server::http::{self, AppState};
use mdmgate_server::push::ApnsClient;
use mdmgate_server::queue::spawn_overdue_sweeper;
use mdmgate_server::storage::MdmDatabase;
use mdmgate_server::sync::spawn_job_cleanup;

#[derive(Parser, Debug)]
#[command(name = "mdmgate-server")]
#[command(version, about = "mdmgate server - MDM check-in, command queue and push")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, env = "MDMGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on (overrides `server.listen_addr`).
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Path to SQLite database file.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print an operator bearer token and exit.
    IssueToken {
        /// Operator identifier stored in the `sub` claim.
        subject: String,

        /// Permission to grant; repeatable. Defaults to every permission.
        #[arg(long = "permission")]
        permissions: Vec<String>,

        /// Token lifetime in seconds.
        #[arg(long, default_value_t = 3600)]
        ttl_secs: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = ServerConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.server.listen_addr = addr.to_string();
    }
    if let Some(path) = args.db_path {
        config.server.database_path = Some(path);
    }
    if args.log_json {
        config.server.log_json = true;
    }

    init_tracing(
        "mdmgate_server=info,tower_http=info",
        config.server.log_json,
    );

    if let Some(Command::IssueToken {
        subject,
        permissions,
        ttl_secs,
    }) = args.command
    {
        let jwt = JwtManager::new(config.api.jwt_secret.as_bytes());
        let granted: Vec<&str> = if permissions.is_empty() {
            permission::ALL.to_vec()
        } else {
            permissions.iter().map(String::as_str).collect()
        };
        print_token(&jwt.issue_token(&subject, &granted, ttl_secs)?);
        return Ok(());
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.server.listen_addr,
        trust_mode = ?config.auth.trust_mode,
        "Starting mdmgate-server"
    );

    // reqwest and the APNs client use rustls-no-provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let db_path = match &config.server.database_path {
        Some(path) => path.clone(),
        None => default_db_path()?,
    };
    info!(path = %db_path.display(), "Opening MDM database");
    let db = MdmDatabase::open(&db_path).await?;

    let transport = Arc::new(ApnsClient::new(
        &config.push.apns_url,
        Duration::from_secs(config.push.request_timeout_secs),
    ));
    let state = AppState::build(&config, db, transport)?;

    match &config.auth.trust_chain_path {
        Some(path) => {
            let chain = state.credentials.load_trust_chain_file(path)?;
            info!(
                path = %path.display(),
                certificates = chain.len(),
                "Device trust chain loaded"
            );
        }
        None => warn!("No device trust chain configured; device requests will be rejected"),
    }

    state.sync.recover_interrupted().await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let background = [
        spawn_push_cert_monitor(
            Arc::clone(&state.credentials),
            Duration::from_secs(config.credentials.monitor_interval_secs),
            shutdown_rx.clone(),
        ),
        spawn_overdue_sweeper(
            Arc::clone(&state.queue),
            config.queue.sweep_interval(),
            shutdown_rx.clone(),
        ),
        spawn_job_cleanup(
            Arc::clone(&state.sync),
            Duration::from_secs(config.sync.job_retention_secs),
            shutdown_rx,
        ),
    ];

    let app = http::router(state, config.server.max_body_bytes);
    let listener = tokio::net::TcpListener::bind(&config.server.listen_addr).await?;
    info!(addr = %listener.local_addr()?, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received shutdown signal");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    for handle in background {
        let _ = handle.await;
    }

    info!("mdmgate-server stopped");
    Ok(())
}

#[allow(clippy::print_stdout)]
fn print_token(token: &str) {
    println!("{token}");
}

fn default_db_path() -> anyhow::Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".mdmgate").join("mdmgate.db"))
}
