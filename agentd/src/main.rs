//! agentd entry point.
//!
//! Mode selection (producer / consumer / combined), config loading and the
//! wiring of shared pieces: database actor, context layout, LLM client,
//! tracker tool client, execution environment.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use eyre::{Context, Result, eyre};
use tracing::{debug, info};

use agentd::cli::{Cli, Command, Mode};
use agentd::config::Config;
use agentd::db::DbHandle;
use agentd::exec::ExecEnvManager;
use agentd::llm::{RawLlmLogger, create_client};
use agentd::mcp::{McpServerConfig, ToolCaller, ToolClient};
use agentd::queueing::{InMemoryQueue, TaskQueue};
use agentd::runner::{Consumer, ProducerLock, produce_tasks};
use agentd::tracker::TaskGetter;
use ctxstore::ContextLayout;

/// Producer mutual-exclusion lock path.
const PRODUCER_LOCK_PATH: &str = "/tmp/agentd_produce.lock";

fn setup_logging(cli_level: Option<&str>, config: &Config) -> Result<()> {
    fs::create_dir_all(&config.logging.dir).context("Failed to create log directory")?;

    // Priority: CLI --log-level > config > INFO
    let level_str = cli_level.unwrap_or(&config.logging.level);
    let level = match level_str.to_uppercase().as_str() {
        "TRACE" => tracing::Level::TRACE,
        "DEBUG" => tracing::Level::DEBUG,
        "INFO" => tracing::Level::INFO,
        "WARN" | "WARNING" => tracing::Level::WARN,
        "ERROR" => tracing::Level::ERROR,
        other => {
            eprintln!("Warning: Unknown log-level '{other}', defaulting to INFO");
            tracing::Level::INFO
        }
    };

    let log_file = fs::File::create(config.logging.dir.join("agentd.log")).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    setup_logging(cli.log_level.as_deref(), &config).context("Failed to setup logging")?;

    info!(
        provider = %config.llm.provider,
        task_source = %config.task_source,
        "agentd starting"
    );

    debug!(command = ?cli.command, mode = ?cli.mode, "main: dispatching");
    match cli.command {
        Some(Command::CleanupStale) => cmd_cleanup_stale(&config).await,
        None => match cli.mode {
            Some(Mode::Producer) => cmd_producer(&config).await,
            Some(Mode::Consumer) => cmd_consumer(&config).await,
            None => cmd_both(&config).await,
        },
    }
}

async fn cmd_cleanup_stale(config: &Config) -> Result<()> {
    let exec = ExecEnvManager::new(config.executor.clone());
    let removed = exec.cleanup_stale_containers().await?;
    println!("Removed {removed} stale container(s)");
    Ok(())
}

async fn cmd_producer(config: &Config) -> Result<()> {
    let _lock = ProducerLock::acquire(PRODUCER_LOCK_PATH)?;
    let (db, _, tracker_client) = build_shared(config).await?;
    let queue = InMemoryQueue::new();

    let getter = TaskGetter::new(
        &config.task_source,
        tracker_client,
        config.tracker(&config.task_source).clone(),
    );
    let enqueued = produce_tasks(&getter, &db, &queue).await?;
    println!("Enqueued {enqueued} task(s)");
    db.shutdown().await;
    Ok(())
}

async fn cmd_consumer(config: &Config) -> Result<()> {
    let (db, layout, tracker_client) = build_shared(config).await?;
    let queue = InMemoryQueue::new();
    let consumer = build_consumer(config, db.clone(), layout, tracker_client).await?;

    consumer.startup_recovery(&queue).await?;
    let processed = consumer.run_until_empty(&queue).await?;
    println!("Processed {processed} task(s)");
    db.shutdown().await;
    Ok(())
}

/// Default mode: one producer pass feeding one consumer pass over a shared
/// in-process queue.
async fn cmd_both(config: &Config) -> Result<()> {
    let (db, layout, tracker_client) = build_shared(config).await?;
    let queue: Arc<dyn TaskQueue> = Arc::new(InMemoryQueue::new());

    {
        let _lock = ProducerLock::acquire(PRODUCER_LOCK_PATH)?;
        let getter = TaskGetter::new(
            &config.task_source,
            tracker_client.clone(),
            config.tracker(&config.task_source).clone(),
        );
        let enqueued = produce_tasks(&getter, &db, queue.as_ref()).await?;
        info!(enqueued, "cmd_both: producer pass done");
    }

    let consumer = build_consumer(config, db.clone(), layout, tracker_client).await?;
    consumer.startup_recovery(queue.as_ref()).await?;
    let processed = consumer.run_until_empty(queue.as_ref()).await?;
    println!("Processed {processed} task(s)");
    db.shutdown().await;
    Ok(())
}

/// Database actor, context layout, and the tracker's MCP client.
async fn build_shared(config: &Config) -> Result<(DbHandle, ContextLayout, Arc<dyn ToolCaller>)> {
    let db = DbHandle::spawn(&config.database.path)?;
    let layout = ContextLayout::new(&config.context_storage.base_dir);
    layout.ensure_dirs()?;

    let tracker = config.tracker(&config.task_source);
    if tracker.mcp_command.is_empty() {
        return Err(eyre!(
            "no MCP server command configured for task source '{}'",
            config.task_source
        ));
    }
    let mut server_config = McpServerConfig::new(config.task_source.clone(), tracker.mcp_command.clone());
    server_config.call_timeout = Duration::from_secs(120);
    let client = ToolClient::start(server_config)
        .await
        .map_err(|e| eyre!("tracker MCP server failed to start: {e}"))?;

    Ok((db, layout, Arc::new(client)))
}

async fn build_consumer(
    config: &Config,
    db: DbHandle,
    layout: ContextLayout,
    tracker_client: Arc<dyn ToolCaller>,
) -> Result<Consumer> {
    let raw_logger = Arc::new(RawLlmLogger::new(config.logging.dir.join("llm"))?);
    let llm = create_client(config, Some(raw_logger)).map_err(|e| eyre!("LLM client: {e}"))?;

    let exec = if config.executor.enabled {
        Some(Arc::new(ExecEnvManager::new(config.executor.clone())))
    } else {
        None
    };

    Ok(Consumer::new(config.clone(), db, layout, llm, tracker_client, exec))
}
