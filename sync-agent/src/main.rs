//! CLI entry point: loads configuration, wires `tracing-subscriber`,
//! constructs a `SyncCoordinator` and runs it to completion or until a
//! shutdown signal. Grounded on `storage_scrubber/src/main.rs`'s
//! `Parser`/`Subcommand` shape.

use std::sync::Arc;

use anyhow::{bail, Context};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use sync_core::{
    CredentialStore, EventBus, FileCredentialStore, HttpRemoteClient, JsonFileMetadataStore,
    MetadataStore, Pipeline, RemoteClient, StaticAuthProvider, SyncAgentConfig, SyncCoordinator,
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use url::Url;

#[derive(Parser)]
#[command(author, version, about = "Desktop file-sync agent", long_about = None)]
#[command(arg_required_else_help(true))]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to the agent's TOML config file.
    #[arg(long, default_value = "sync-agent.toml")]
    config: Utf8PathBuf,

    /// Base URL of the remote API.
    #[arg(long)]
    api_base_url: Option<Url>,

    /// Path to the credential store's JSON file.
    #[arg(long, default_value = "credentials.json")]
    credentials: Utf8PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Runs an initial reconcile, then starts the watcher and the periodic
    /// timer; blocks until Ctrl-C.
    Run,
    /// Runs a single reconcile pass and exits, without starting the
    /// watcher or the periodic timer.
    ReconcileOnce,
    /// Switches the active workspace and runs an initial reconcile
    /// against it.
    SwitchWorkspace {
        #[arg(long)]
        workspace_id: i64,
        #[arg(long)]
        workspace_name: String,
    },
}

/// Stderr always gets logs; a rotating file sink under `./logs/` is added
/// unless `SYNC_AGENT_DISABLE_FILE_LOGGING` is set, mirroring the teacher's
/// `storage_scrubber::init_logging`. The returned guard must be held for the
/// process lifetime or the non-blocking file writer stops flushing.
fn init_logging() -> Option<WorkerGuard> {
    let stderr_logs = fmt::Layer::new().with_target(false).with_writer(std::io::stderr);
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let disable_file_logging = match std::env::var("SYNC_AGENT_DISABLE_FILE_LOGGING") {
        Ok(s) => s == "1" || s.eq_ignore_ascii_case("true"),
        Err(_) => false,
    };

    if disable_file_logging {
        tracing_subscriber::registry().with(filter()).with(stderr_logs).init();
        None
    } else {
        let (file_writer, guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::daily("./logs", "sync-agent.log"));
        let file_logs = fmt::Layer::new()
            .with_target(false)
            .with_ansi(false)
            .with_writer(file_writer);
        tracing_subscriber::registry()
            .with(filter())
            .with(stderr_logs)
            .with(file_logs)
            .init();
        Some(guard)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _logging_guard = init_logging();
    let cli = Cli::parse();

    let config_text = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("reading config file {}", cli.config))?;
    let config = SyncAgentConfig::from_toml_str(&config_text)
        .with_context(|| format!("parsing config file {}", cli.config))?;

    let credential_store = FileCredentialStore::new(cli.credentials.as_std_path());
    let credentials = credential_store.load().unwrap_or_default();
    if !credentials.is_authenticated() {
        bail!(
            "no credentials found in {} - complete the login flow before running the agent",
            cli.credentials
        );
    }
    let auth = Arc::new(StaticAuthProvider::new(credential_store));

    let api_base_url = cli
        .api_base_url
        .clone()
        .context("--api-base-url is required")?;
    let remote: Arc<dyn RemoteClient> = Arc::new(
        HttpRemoteClient::new(api_base_url, auth, config.large_file_threshold_bytes())
            .context("constructing remote client")?,
    );

    let metadata_path = config.sync_root.join(".sync-metadata.json");
    let store: Arc<dyn MetadataStore> =
        Arc::new(JsonFileMetadataStore::open(metadata_path.as_std_path())?);

    let events = EventBus::new();
    let pipeline = Arc::new(Pipeline::new(
        Arc::clone(&remote),
        config.max_concurrent_transfers,
        events.clone(),
        config.large_file_threshold_bytes(),
    ));

    let coordinator = SyncCoordinator::new(
        remote,
        store,
        pipeline,
        Arc::new(sync_core::EchoSuppressor::new(config.echo_ttl)),
        Arc::new(sync_core::Debouncer::new(config.debounce)),
        events,
        config.clone(),
        config.sync_root.clone(),
    );

    match cli.command {
        Command::Run => {
            let workspace_name = format!("workspace-{}", config.workspace_id);
            coordinator.start(config.workspace_id, &workspace_name).await?;
            tracing::info!("sync agent running, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            coordinator.stop().await;
        }
        Command::ReconcileOnce => {
            let workspace_name = format!("workspace-{}", config.workspace_id);
            let summary = coordinator.start(config.workspace_id, &workspace_name).await?;
            tracing::info!(?summary, "reconcile-once complete");
            coordinator.stop().await;
        }
        Command::SwitchWorkspace {
            workspace_id,
            workspace_name,
        } => {
            coordinator.start(config.workspace_id, "initial").await?;
            let summary = coordinator
                .switch_workspace(workspace_id, &workspace_name)
                .await?;
            tracing::info!(?summary, "workspace switch complete");
            coordinator.stop().await;
        }
    }

    Ok(())
}
