mod server;

use std::net::SocketAddr;
use std::path::Path;

use axum::http::HeaderName;
use chrono::Utc;
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use quota_relay::store::NewToken;
use quota_relay::{GatewayConfig, GatewayError, RelayGateway, StoreError, scheduler};
use tracing_subscriber::EnvFilter;

use crate::server::ForwardAuthConfig;

#[derive(Debug, Parser)]
#[command(author, version, about = "OpenAI compatible relay gateway with quota metering")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP relay server.
    Serve(ServeArgs),
    /// Issue a new access token for a user and print its key.
    IssueToken(IssueTokenArgs),
    /// Grant quota to a user account.
    Grant(GrantArgs),
    /// Run one interval-quota refresh sweep and exit.
    Refresh(StoreArgs),
}

#[derive(Debug, Parser)]
struct StoreArgs {
    /// SQLite database path holding tokens, balances and consume logs.
    #[arg(long, env = "QUOTA_RELAY_DB_PATH", default_value = "quota_relay.db")]
    db_path: String,

    /// JSON gateway config file. Defaults are used when the file does not exist.
    #[arg(long, env = "QUOTA_RELAY_CONFIG", default_value = "quota_relay.json")]
    config: String,
}

#[derive(Debug, Parser)]
struct ServeArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Address to bind the relay server to.
    #[arg(long, env = "QUOTA_RELAY_BIND", default_value = "127.0.0.1")]
    bind: String,

    /// Port to bind the relay server to.
    #[arg(long, env = "QUOTA_RELAY_PORT", default_value_t = 3000)]
    port: u16,

    /// Header carrying the authenticated user id set by the fronting proxy.
    #[arg(long, env = "QUOTA_RELAY_USER_HEADER", default_value = "x-user-id")]
    user_header: String,
}

#[derive(Debug, Parser)]
struct IssueTokenArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Owner of the new token.
    #[arg(long)]
    user_id: i64,

    /// Display name of the token.
    #[arg(long, default_value = "")]
    name: String,

    /// Initial remaining quota.
    #[arg(long, default_value_t = 0)]
    quota: i64,

    /// Issue a token without a quota limit.
    #[arg(long)]
    unlimited: bool,

    /// Comma separated model allow-list.
    #[arg(long)]
    models: Option<String>,
}

#[derive(Debug, Parser)]
struct GrantArgs {
    #[command(flatten)]
    store: StoreArgs,

    #[arg(long)]
    user_id: i64,

    /// Quota added to the user's balance.
    #[arg(long)]
    amount: i64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();

    let outcome = match cli.command {
        Command::Serve(args) => return run_server(args).await,
        Command::IssueToken(args) => run_issue_token(args).await,
        Command::Grant(args) => run_grant(args).await,
        Command::Refresh(args) => run_refresh(args).await,
    };
    if let Err(err) = outcome {
        report_error(&err);
        std::process::exit(1);
    }

    Ok(())
}

async fn open_gateway(args: &StoreArgs) -> Result<RelayGateway, GatewayError> {
    let config = if Path::new(&args.config).exists() {
        GatewayConfig::load(&args.config)?
    } else {
        tracing::info!(path = %args.config, "config file not found; using defaults");
        GatewayConfig::default()
    };
    RelayGateway::new(config, &args.db_path).await
}

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let gateway = open_gateway(&args.store).await?;
    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    let user_header = HeaderName::from_bytes(args.user_header.as_bytes())?;

    server::serve(addr, gateway, ForwardAuthConfig::new(user_header)).await
}

async fn run_issue_token(args: IssueTokenArgs) -> Result<(), GatewayError> {
    let gateway = open_gateway(&args.store).await?;
    let spec = NewToken {
        name: args.name,
        remain_quota: args.quota,
        unlimited_quota: args.unlimited,
        model_limits_enabled: args.models.is_some(),
        model_limits: args.models.unwrap_or_default(),
        ..NewToken::default()
    };
    let token = gateway.store().issue_token(args.user_id, spec).await?;
    gateway.shutdown().await?;
    println!("{}\tsk-{}", token.id, token.key);
    Ok(())
}

async fn run_grant(args: GrantArgs) -> Result<(), GatewayError> {
    let gateway = open_gateway(&args.store).await?;
    gateway
        .store()
        .grant_user_quota(args.user_id, args.amount)
        .await?;
    let balance = gateway.store().get_user(args.user_id).await?;
    gateway.shutdown().await?;
    println!("user {} quota {}", balance.id, balance.quota);
    Ok(())
}

async fn run_refresh(args: StoreArgs) -> Result<(), GatewayError> {
    let gateway = open_gateway(&args).await?;
    let report = scheduler::run_refresh_once(gateway.store(), Utc::now().timestamp()).await?;
    gateway.shutdown().await?;
    println!(
        "due {} refreshed {} failed {}",
        report.due, report.refreshed, report.failed
    );
    Ok(())
}

fn report_error(err: &GatewayError) {
    eprintln!("error: {err}");
    match err {
        GatewayError::Http(source) => {
            if let Some(status) = source.status() {
                eprintln!("  status: {status}");
            }
        }
        GatewayError::Database(db_err) | GatewayError::Store(StoreError::Database(db_err)) => {
            eprintln!("  database: {db_err}");
        }
        _ => {}
    }
}
