//! Kiln Server
//!
//! Axum server exposing conversational turns, planning, bundle saves and
//! build requests. The same binary can run a single turn or queue a build
//! from the command line.

mod api;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use kiln_core::agent::{AgentService, Collaborators, Planner, TurnRequest};
use kiln_core::config::KilnConfig;
use kiln_core::gateway::ModelGateway;
use kiln_core::graph::{CapabilityRegistry, ExecutionGraph, ScreenshotClient, WebSearch};
use kiln_core::images::{HttpImageFetcher, ImagePipeline};
use kiln_core::queue::BuildQueue;
use kiln_core::relay::relay_channel;
use kiln_core::state::{FsBundleStore, KilnDb, LoggingCdnInvalidator, SqliteStore};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Application state
pub struct AppState {
    pub service: Arc<AgentService>,
    pub planner: Planner,
    pub queue: BuildQueue,
    /// Account and project administration
    pub store: SqliteStore,
}

pub type SharedState = Arc<AppState>;

#[derive(Parser, Clone)]
#[command(author, version, about = "Kiln - conversational app generation")]
struct Args {
    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Subcommand, Clone)]
enum CliCommand {
    /// Start the Kiln server (default)
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "3000")]
        port: u16,
    },
    /// Run one turn and print its wire frames
    Turn {
        /// Project key
        #[arg(long)]
        project: String,
        /// Owner's email
        #[arg(long)]
        user: String,
        /// Logical model name
        #[arg(long)]
        model: Option<String>,
        /// Modify the existing app instead of generating a new one
        #[arg(long)]
        fix: bool,
        prompt: String,
    },
    /// Queue a build of a project's current bundle
    Build {
        #[arg(long)]
        project: String,
        #[arg(long)]
        user: String,
    },
    /// Create a user (if needed) and a project owned by them
    Project {
        #[arg(long)]
        user: String,
        /// Public project key
        #[arg(long)]
        key: String,
        #[arg(long, default_value = "New Project")]
        title: String,
    },
}

fn load_env() {
    let _ = dotenvy::dotenv();
    let _ = dotenvy::from_path(".kiln/.env");
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Wire every service from configuration.
fn build_state(config: &KilnConfig) -> anyhow::Result<AppState> {
    let db = KilnDb::open_at(&config.db_path)
        .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?;
    let store = SqliteStore::new(&db);

    let mut registry = CapabilityRegistry::new();
    registry.register(Arc::new(WebSearch::new(config.searxng_url.as_deref())?));
    let screenshots = match &config.screenshot_api_url {
        Some(url) => {
            let client = Arc::new(ScreenshotClient::new(url)?);
            registry.register(client.clone());
            Some(client)
        }
        None => {
            tracing::info!("SCREENSHOT_API_URL not set, screenshots disabled");
            None
        }
    };

    let gateway = Arc::new(
        ModelGateway::from_config(config)
            .context("Failed to configure model providers")?
            .with_tools(registry.definitions()),
    );
    let images = Arc::new(
        ImagePipeline::new(Arc::new(
            HttpImageFetcher::new()?.with_max_bytes(config.limits.max_image_bytes),
        ))
            .with_max_bytes(config.limits.max_image_bytes),
    );

    let mut planner = Planner::new(gateway.clone(), images.clone(), config.limits.planner_image_limit);
    if let Some(client) = screenshots {
        planner = planner.with_screenshots(client);
    }

    let graph = Arc::new(ExecutionGraph::new(gateway, Arc::new(registry)));
    let stores = Collaborators {
        projects: Arc::new(store.clone()),
        gallery: Arc::new(store.clone()),
        bundles: Arc::new(FsBundleStore::new(&config.bundle_dir, &config.bundle_base_url)?),
        cdn: Arc::new(LoggingCdnInvalidator),
    };
    let service = Arc::new(AgentService::new(graph, images, stores, config.limits.clone()));

    Ok(AppState {
        service,
        planner,
        queue: BuildQueue::new(&db, config.queue.clone()),
        store,
    })
}

async fn run_turn_once(state: AppState, request: TurnRequest) -> anyhow::Result<()> {
    let (tx, rx) = mpsc::channel(256);
    let printer = tokio::spawn(async move {
        let mut frames = Box::pin(relay_channel(rx));
        while let Some(frame) = frames.next().await {
            print!("{}", frame.encode());
        }
    });

    let outcome = state.service.run_turn(request, tx).await;
    printer.await.context("Frame printer panicked")?;

    if let Some(error) = outcome.error {
        anyhow::bail!(error);
    }
    if let Some(plan) = outcome.plan {
        tracing::info!("Saved plan with {} file(s)", plan.file_count);
    }
    Ok(())
}

async fn queue_build(state: AppState, project: &str, user: &str) -> anyhow::Result<()> {
    let enqueued = state.service.request_build(&state.queue, project, user).await?;
    if enqueued.existing {
        println!("Already building! (job {})", enqueued.job.id);
    } else {
        println!("Build queued successfully (job {})", enqueued.job.id);
    }
    Ok(())
}

fn create_project(state: AppState, user: &str, key: &str, title: &str) -> anyhow::Result<()> {
    let owner = state.store.ensure_user(user, user)?;
    let project = state.store.create_project(key, &owner.id, title)?;
    println!("Created project {} ({}) for {}", project.key, project.id, owner.email);
    Ok(())
}

async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let app = api::routes().with_state(Arc::new(state));

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    tracing::info!("Kiln server running at http://{}", addr);
    tracing::info!("Routes: /api/agent, /api/plan, /api/build, /api/projects, /api/v1/models");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_env();
    init_tracing();

    let args = Args::parse();
    let config = KilnConfig::load().await;
    let state = build_state(&config)?;

    match args.command {
        Some(CliCommand::Turn {
            project,
            user,
            model,
            fix,
            prompt,
        }) => {
            let request = TurnRequest {
                prompt,
                project_key: project,
                owner: user,
                model,
                fix,
                ..Default::default()
            };
            run_turn_once(state, request).await
        }
        Some(CliCommand::Build { project, user }) => queue_build(state, &project, &user).await,
        Some(CliCommand::Project { user, key, title }) => create_project(state, &user, &key, &title),
        Some(CliCommand::Serve { port }) => serve(state, port).await,
        None => serve(state, 3000).await,
    }
}
