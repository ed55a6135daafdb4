//! Battleground CLI - send one prompt to many LLMs and compare the answers.

use anyhow::{bail, Context};
use battleground::api::{create_router_with_state, AppState};
use battleground::challenge::ChallengeOrchestrator;
use battleground::config::{Config, LogVerbosity};
use battleground::credentials::{CredentialManager, FileSecretStore};
use battleground::discovery::ModelCatalog;
use battleground::drivers::{spawn_stream, DriverFactory, HttpDriverFactory};
use battleground::http::create_client;
use battleground::logger;
use battleground::message::Message;
use battleground::models::LlmModel;
use battleground::service::{ProtocolKind, ServiceConfiguration, ServiceRegistry};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::signal;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "battleground")]
#[command(about = "Send one prompt to many LLMs and compare the answers")]
#[command(version)]
struct Cli {
    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output verbosity (defaults to the configured level)
    #[arg(short, long, global = true, value_enum)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the local API server
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Manage configured services
    Services {
        #[command(subcommand)]
        action: ServiceAction,
    },

    /// Store or clear a service's API key
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },

    /// Discover and manage models
    Models {
        #[command(subcommand)]
        action: ModelAction,
    },

    /// Send a prompt to several models at once
    Challenge {
        /// The prompt to send
        prompt: String,

        /// Model id (`<service>:<model>`); repeat for more. Defaults to every enabled model.
        #[arg(short, long = "model")]
        models: Vec<String>,

        /// Stream the reply of a single model as it arrives
        #[arg(long)]
        stream: bool,
    },

    /// Show current configuration
    Config {
        /// Show config file path
        #[arg(long)]
        path: bool,
    },
}

#[derive(Subcommand)]
enum ServiceAction {
    /// List services and whether a key is stored
    List,
    /// Add a service, or replace the one with the same id
    Add {
        /// Display name
        name: String,
        /// openai, anthropic, or an alias such as claude
        #[arg(short, long)]
        protocol: ProtocolKind,
        /// Base URL; defaults to the protocol's public endpoint
        #[arg(short, long)]
        endpoint: Option<String>,
        /// Stable id; generated when omitted
        #[arg(long)]
        id: Option<String>,
    },
    /// Remove a service and its key
    Remove { id: String },
}

#[derive(Subcommand)]
enum KeyAction {
    Set { service: String, key: String },
    Clear { service: String },
}

#[derive(Subcommand)]
enum ModelAction {
    /// Refresh and print the model catalog
    List,
    /// Refresh and print only the summary
    Refresh,
    /// Enable or disable a model
    Toggle { id: String },
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum LogLevel {
    Minimal,
    Compact,
    Verbose,
}

impl From<LogLevel> for LogVerbosity {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Minimal => LogVerbosity::Minimal,
            LogLevel::Compact => LogVerbosity::Compact,
            LogLevel::Verbose => LogVerbosity::Verbose,
        }
    }
}

/// Everything a command needs, opened from the config.
struct Runtime {
    state: AppState,
    factory: Arc<dyn DriverFactory>,
    verbosity: LogVerbosity,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path.clone())?,
        None => Config::load()?,
    };
    let config = config.with_env_overrides();
    let verbosity = cli
        .log_level
        .map(LogVerbosity::from)
        .unwrap_or(config.app.log_verbosity);

    match cli.command {
        Some(Commands::Config { path }) => show_config(&config, cli.config.as_ref(), path),
        Some(Commands::Serve { port }) => {
            init_tracing(tracing::Level::INFO);
            run_server(&config, port, verbosity).await
        }
        None => {
            init_tracing(tracing::Level::INFO);
            run_server(&config, None, verbosity).await
        }
        Some(command) => {
            init_tracing(tracing::Level::WARN);
            let runtime = open_runtime(&config, verbosity).await?;
            match command {
                Commands::Services { action } => services_command(&runtime, action).await,
                Commands::Key { action } => key_command(&runtime, action).await,
                Commands::Models { action } => models_command(&runtime, action).await,
                Commands::Challenge {
                    prompt,
                    models,
                    stream,
                } => challenge_command(&runtime, &prompt, &models, stream).await,
                Commands::Serve { .. } | Commands::Config { .. } => Ok(()),
            }
        }
    }
}

fn init_tracing(default_level: tracing::Level) {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(EnvFilter::from_default_env().add_directive(default_level.into()))
        .init();
}

async fn open_runtime(config: &Config, verbosity: LogVerbosity) -> anyhow::Result<Runtime> {
    let storage = &config.storage;
    let store = FileSecretStore::open(storage.secrets_path())
        .await
        .context("opening secret store")?;
    let credentials = CredentialManager::new(Arc::new(store));
    let services = ServiceRegistry::open(storage.services_path(), credentials.clone())
        .await
        .context("opening service list")?;

    let client = create_client()?;
    let factory: Arc<dyn DriverFactory> = Arc::new(HttpDriverFactory::new(
        client,
        credentials,
        config.driver_options(),
    ));
    let catalog = ModelCatalog::open(
        factory.clone(),
        config.discovery.max_concurrency,
        storage.disabled_models_path(),
    )
    .await
    .context("opening disabled model list")?;
    let challenge = ChallengeOrchestrator::new(
        factory.clone(),
        config.challenge.max_concurrency,
        config.request_timeout(),
    );

    Ok(Runtime {
        state: AppState::new(services, catalog, challenge),
        factory,
        verbosity,
    })
}

async fn run_server(
    config: &Config,
    port_override: Option<u16>,
    verbosity: LogVerbosity,
) -> anyhow::Result<()> {
    let runtime = open_runtime(config, verbosity).await?;
    let port = port_override.unwrap_or(config.server.port);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));

    // Discover models in the background so the API is up immediately
    let state = runtime.state.clone();
    tokio::spawn(async move {
        let services = state.services.list().await;
        state.catalog.refresh(services).await;
    });

    let app = create_router_with_state(runtime.state);

    match verbosity {
        LogVerbosity::Minimal => {
            println!("battleground:{}", port);
        }
        LogVerbosity::Compact => {
            println!("→ Battleground starting on http://{}", addr);
            println!("→ API: http://{}/api", addr);
        }
        LogVerbosity::Verbose => {
            println!("────────────────────────────────────────");
            println!("Battleground v{}", env!("CARGO_PKG_VERSION"));
            println!("────────────────────────────────────────");
            println!("Server:     http://{}", addr);
            println!("Health:     http://{}/health", addr);
            println!("Services:   http://{}/api/services", addr);
            println!("Models:     http://{}/api/models", addr);
            println!("Challenge:  http://{}/api/challenge", addr);
            println!("State dir:  {}", config.storage.state_dir.display());
            println!("────────────────────────────────────────");
            println!("Log Level:  {:?}", verbosity);
            println!("────────────────────────────────────────");
        }
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    println!("\nServer stopped.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

async fn services_command(runtime: &Runtime, action: ServiceAction) -> anyhow::Result<()> {
    let state = &runtime.state;
    match action {
        ServiceAction::List => {
            for service in state.services.list().await {
                let key = if state.credentials.has_api_key(&service.id).await? {
                    "key"
                } else {
                    "no key"
                };
                println!(
                    "{}  {}  [{}]  {}  ({})",
                    service.id, service.name, service.protocol, service.endpoint_url, key
                );
            }
        }
        ServiceAction::Add {
            name,
            protocol,
            endpoint,
            id,
        } => {
            let endpoint = endpoint.unwrap_or_else(|| protocol.default_base_url().to_string());
            reqwest::Url::parse(&endpoint).with_context(|| format!("invalid endpoint '{}'", endpoint))?;
            let service = ServiceConfiguration::new(id, name, protocol, endpoint);
            state.services.add(service.clone()).await?;
            println!("Saved service {}", service.id);
        }
        ServiceAction::Remove { id } => {
            state.services.delete(&id).await?;
            println!("Removed service {}", id);
        }
    }
    Ok(())
}

async fn key_command(runtime: &Runtime, action: KeyAction) -> anyhow::Result<()> {
    let state = &runtime.state;
    let (service, key) = match &action {
        KeyAction::Set { service, key } => (service, Some(key.as_str())),
        KeyAction::Clear { service } => (service, None),
    };
    if state.services.get(service).await.is_none() {
        bail!("no service with id '{}'", service);
    }
    state.credentials.set_api_key(service, key).await?;
    match key {
        Some(_) => println!("Stored key for {}", service),
        None => println!("Cleared key for {}", service),
    }
    Ok(())
}

async fn refresh(runtime: &Runtime) {
    let state = &runtime.state;
    let outcome = state.catalog.refresh(state.services.list().await).await;
    let failures = state.catalog.service_errors().await;
    eprintln!("{}", logger::format_refresh(&outcome, &failures, &runtime.verbosity));
}

async fn models_command(runtime: &Runtime, action: ModelAction) -> anyhow::Result<()> {
    let catalog = &runtime.state.catalog;
    match action {
        ModelAction::Refresh => refresh(runtime).await,
        ModelAction::List => {
            refresh(runtime).await;
            for model in catalog.enabled_models().await {
                println!("  {}  {}", model.id, model.model_entry.label());
            }
            for model in catalog.disabled_models().await {
                println!("- {}  {} (disabled)", model.id, model.model_entry.label());
            }
        }
        ModelAction::Toggle { id } => {
            let enabled = catalog.toggle_model(&id).await?;
            println!("{} {}", id, if enabled { "enabled" } else { "disabled" });
        }
    }
    Ok(())
}

async fn select_models(runtime: &Runtime, ids: &[String]) -> anyhow::Result<Vec<LlmModel>> {
    let catalog = &runtime.state.catalog;
    if ids.is_empty() {
        return Ok(catalog.enabled_models().await);
    }
    let mut models = Vec::with_capacity(ids.len());
    for id in ids {
        match catalog.find(id).await {
            Some(model) => models.push(model),
            None => bail!("unknown model '{}' (see `battleground models list`)", id),
        }
    }
    Ok(models)
}

async fn challenge_command(
    runtime: &Runtime,
    prompt: &str,
    ids: &[String],
    stream: bool,
) -> anyhow::Result<()> {
    refresh(runtime).await;
    let models = select_models(runtime, ids).await?;
    if models.is_empty() {
        bail!("no models to ask; add a key with `battleground key set` and refresh");
    }

    if stream {
        let [model] = models.as_slice() else {
            bail!("--stream needs exactly one --model");
        };
        return stream_one(runtime, prompt, model).await;
    }

    let report = runtime.state.challenge.run(prompt, models).await;
    logger::log_report(&mut std::io::stdout(), &report, &runtime.verbosity)?;
    Ok(())
}

async fn stream_one(runtime: &Runtime, prompt: &str, model: &LlmModel) -> anyhow::Result<()> {
    let driver = runtime.factory.driver_for(&model.configuration).await;
    let (done_tx, mut done_rx) = tokio::sync::oneshot::channel();
    let started = Instant::now();

    let handle = spawn_stream(
        driver,
        vec![Message::user(prompt)],
        model.profile(),
        |chunk| {
            let mut stdout = std::io::stdout();
            let _ = write!(stdout, "{}", chunk);
            let _ = stdout.flush();
        },
        move |result| {
            let _ = done_tx.send(result);
        },
    );

    let result = tokio::select! {
        received = &mut done_rx => received?,
        _ = signal::ctrl_c() => {
            handle.cancel();
            done_rx.await?
        }
    };
    handle.join().await;

    println!();
    let elapsed_ms = started.elapsed().as_millis() as u64;
    eprintln!(
        "{}",
        logger::format_stream_end(result.as_ref(), elapsed_ms, &runtime.verbosity)
    );
    Ok(())
}

fn show_config(config: &Config, config_path: Option<&PathBuf>, show_path: bool) -> anyhow::Result<()> {
    if show_path {
        let path = config_path.cloned().unwrap_or_else(Config::default_path);
        println!("{}", path.display());
        return Ok(());
    }

    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}
