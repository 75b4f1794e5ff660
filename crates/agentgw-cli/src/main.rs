//! agentgw command-line entry point.
//!
//! `agentgw serve` starts the daemon; the remaining commands are thin HTTP
//! clients against a running instance.
//!
//! Exit codes: 0 clean shutdown, 1 startup failure (bad config, port in
//! use), 2 provider unreachable when the startup probe is enabled.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use agentgw_agent::build_provider;
use agentgw_service::{Config, Scheduler, Service, WebhookDispatcher};
use agentgw_web::WebServer;

/// Default daemon address for client commands.
const DEFAULT_URL: &str = "http://127.0.0.1:8080";

#[derive(Parser)]
#[command(name = "agentgw", version, about = "Local agent-orchestration daemon")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon: HTTP server, scheduler, and webhook dispatcher.
    Serve,

    /// Run one message against a skill on a running daemon.
    Run {
        /// Skill name.
        skill: String,
        /// The message to send.
        message: String,
        /// Resume an existing session.
        #[arg(long)]
        session: Option<String>,
        /// Daemon base URL.
        #[arg(long, default_value = DEFAULT_URL)]
        url: String,
    },

    /// Ingest a text file into the knowledge base.
    Ingest {
        /// File to ingest.
        file: PathBuf,
        /// Source label; defaults to the file name.
        #[arg(long)]
        source: Option<String>,
        /// Skills allowed to retrieve the document (default: all).
        #[arg(long, value_delimiter = ',')]
        skills: Vec<String>,
        /// Routing tags.
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
        /// Target collection.
        #[arg(long)]
        collection: Option<String>,
        /// Daemon base URL.
        #[arg(long, default_value = DEFAULT_URL)]
        url: String,
    },

    /// List the skills loaded by a running daemon.
    Skills {
        /// Daemon base URL.
        #[arg(long, default_value = DEFAULT_URL)]
        url: String,
    },

    /// Ask the planner which skill fits a message.
    Route {
        /// The message to route.
        message: String,
        /// Daemon base URL.
        #[arg(long, default_value = DEFAULT_URL)]
        url: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve => serve(cli.config.as_deref()).await,
        Command::Run {
            skill,
            message,
            session,
            url,
        } => client_exit(run_remote(&url, &skill, &message, session.as_deref()).await),
        Command::Ingest {
            file,
            source,
            skills,
            tags,
            collection,
            url,
        } => client_exit(ingest_remote(&url, &file, source, &skills, &tags, collection).await),
        Command::Skills { url } => client_exit(list_skills(&url).await),
        Command::Route { message, url } => client_exit(route_remote(&url, &message).await),
    }
}

fn client_exit(result: Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

// ---------------------------------------------------------------------------
// serve
// ---------------------------------------------------------------------------

async fn serve(config_path: Option<&std::path::Path>) -> ExitCode {
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e}");
            return ExitCode::from(1);
        }
    };

    let provider = match config.provider_config().and_then(|pc| {
        build_provider(pc).map_err(|e| agentgw_service::ServiceError::Config {
            reason: e.to_string(),
        })
    }) {
        Ok(provider) => provider,
        Err(e) => {
            error!("provider setup failed: {e}");
            return ExitCode::from(1);
        }
    };

    let startup_probe = config.llm.startup_probe;
    let jobs = config.jobs.clone();
    let webhooks = config.webhooks.clone();
    let log_dir = config.storage.log_dir.clone();

    let (service, events_rx) = match Service::new(config, provider).await {
        Ok(built) => built,
        Err(e) => {
            error!("startup failed: {e}");
            return ExitCode::from(1);
        }
    };

    if startup_probe {
        info!("probing llm provider");
        if let Err(e) = service.probe_provider().await {
            error!("provider unreachable: {e}");
            return ExitCode::from(2);
        }
    }

    WebhookDispatcher::new(webhooks).spawn(events_rx);

    let scheduler = match Scheduler::new(jobs) {
        Ok(scheduler) => Arc::new(scheduler),
        Err(e) => {
            error!("scheduler setup failed: {e}");
            return ExitCode::from(1);
        }
    };
    if let Err(e) = scheduler.start(Arc::clone(&service), log_dir) {
        error!("scheduler start failed: {e}");
        return ExitCode::from(1);
    }

    let server = WebServer::new(service, Some(Arc::clone(&scheduler)));
    info!(addr = %server.addr(), "agentgw starting");

    match server.start().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("http server failed: {e}");
            ExitCode::from(1)
        }
    }
}

// ---------------------------------------------------------------------------
// client commands
// ---------------------------------------------------------------------------

/// Build a client that attaches the API key when one is configured.
fn client() -> reqwest::Client {
    reqwest::Client::new()
}

fn authorize(request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    match std::env::var("AGENTGW_API_KEY") {
        Ok(key) if !key.is_empty() => request.bearer_auth(key),
        _ => request,
    }
}

async fn expect_ok(resp: reqwest::Response) -> Result<serde_json::Value> {
    let status = resp.status();
    let body: serde_json::Value = resp.json().await.context("reading daemon response")?;
    if !status.is_success() {
        anyhow::bail!("daemon returned {status}: {body}");
    }
    Ok(body)
}

async fn run_remote(
    url: &str,
    skill: &str,
    message: &str,
    session: Option<&str>,
) -> Result<()> {
    let resp = authorize(client().post(format!("{url}/api/run")))
        .json(&serde_json::json!({
            "skill_name": skill,
            "message": message,
            "session_id": session,
        }))
        .send()
        .await
        .context("contacting daemon")?;

    let body = expect_ok(resp).await?;
    println!("{}", body["result"].as_str().unwrap_or_default());
    eprintln!("session: {}", body["session_id"].as_str().unwrap_or_default());
    Ok(())
}

async fn ingest_remote(
    url: &str,
    file: &std::path::Path,
    source: Option<String>,
    skills: &[String],
    tags: &[String],
    collection: Option<String>,
) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let source = source.unwrap_or_else(|| {
        file.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "stdin".into())
    });

    let resp = authorize(client().post(format!("{url}/api/ingest")))
        .json(&serde_json::json!({
            "text": text,
            "source": source,
            "skills": skills,
            "tags": tags,
            "collection": collection,
        }))
        .send()
        .await
        .context("contacting daemon")?;

    let body = expect_ok(resp).await?;
    println!("ingested {} chunks from {source}", body["chunks_added"]);
    Ok(())
}

async fn list_skills(url: &str) -> Result<()> {
    let resp = authorize(client().get(format!("{url}/api/skills")))
        .send()
        .await
        .context("contacting daemon")?;

    let body = expect_ok(resp).await?;
    for skill in body["skills"].as_array().into_iter().flatten() {
        println!(
            "{:<20} {}",
            skill["name"].as_str().unwrap_or_default(),
            skill["description"].as_str().unwrap_or_default()
        );
    }
    Ok(())
}

async fn route_remote(url: &str, message: &str) -> Result<()> {
    let resp = authorize(client().post(format!("{url}/api/route")))
        .json(&serde_json::json!({ "message": message }))
        .send()
        .await
        .context("contacting daemon")?;

    let body = expect_ok(resp).await?;
    println!("{}", body["skill_name"].as_str().unwrap_or_default());
    eprintln!("reason: {}", body["reason"].as_str().unwrap_or_default());
    Ok(())
}
