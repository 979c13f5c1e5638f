// # segsync - Segment Reconciliation Runner
//
// This binary is a THIN integration layer:
// - DO NOT add rule, tag or sync logic here
// - All reconciliation logic lives in segsync-core
// - Configuration is via environment variables ONLY
//
// The runner is responsible for:
// 1. Reading configuration from environment variables
// 2. Initializing logging and the runtime
// 3. Registering the directory client and table stores
// 4. Running one reconciliation pass and reporting the outcome
//
// SIGTERM/SIGINT stop the run at the next batch boundary; lists already
// finished are still summarised and the exit code is 2.
//
// ## Configuration
//
// ### Directory
// - `SEGSYNC_DIRECTORY_TYPE`: Directory client type (acumbamail)
// - `SEGSYNC_API_TOKEN`: API token (required)
// - `SEGSYNC_API_BASE_URL`: API base URL (optional)
// - `SEGSYNC_MODE`: `dry-run` to log mutations instead of sending them
//
// ### Local data
// - `SEGSYNC_DATA_DIR`: Directory holding the JSON workbooks (default `data`)
// - `SEGSYNC_RULES_STORE`: Workbook holding the rule rows (default `Segmentos`)
// - `SEGSYNC_RULES_SHEET`: Sheet holding the rule rows (default `Segmentos`)
// - `SEGSYNC_TAG_FIELD`: Tag field name (default `Segmentos`)
//
// ### Engine
// - `SEGSYNC_LISTS`: Comma-separated subset of lists to reconcile
// - `SEGSYNC_BATCH_SIZE`: Subscribers per upsert batch (1-1000, default 100)
//
// ### New list profile
// - `SEGSYNC_SENDER_EMAIL`, `SEGSYNC_COMPANY`, `SEGSYNC_COUNTRY`,
//   `SEGSYNC_CITY`, `SEGSYNC_ADDRESS`, `SEGSYNC_PHONE`
//
// ### Logging
// - `SEGSYNC_LOG_LEVEL`: trace, debug, info, warn, error (default info)
//
// ## Example
//
// ```bash
// export SEGSYNC_API_TOKEN=your_token
// export SEGSYNC_DATA_DIR=/var/lib/segsync
// export SEGSYNC_SENDER_EMAIL=boletin@example.es
// export SEGSYNC_LISTS="Lista Madrid,Lista Bilbao"
//
// segsync
// ```

use anyhow::Result;
use segsync_core::config::MAX_BATCH_SIZE;
use segsync_core::traits::{ListProfile, SubscriberDirectory, TableStore};
use segsync_core::{
    ComponentRegistry, DirectoryConfig, EngineConfig, ListRepository, ListStoreConfig,
    ReconcileEvent, ReconciliationEngine, RuleSource, RuleSourceConfig, RunResult, SyncConfig,
    TableStoreConfig,
};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Exit codes for the possible run outcomes
#[derive(Debug, Clone, Copy)]
enum SegsyncExitCode {
    /// Every selected list reconciled
    Success = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
    /// The run could not complete (rule loading, interruption)
    RuntimeError = 2,
    /// The run completed but at least one list failed
    ListFailures = 3,
}

impl From<SegsyncExitCode> for ExitCode {
    fn from(code: SegsyncExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Application configuration
struct Config {
    directory_type: String,
    api_token: String,
    api_base_url: Option<String>,
    data_dir: PathBuf,
    rules_store: Option<String>,
    rules_sheet: Option<String>,
    lists: Vec<String>,
    batch_size: Option<usize>,
    tag_field: Option<String>,
    profile: ListProfile,
    log_level: String,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        let defaults = EngineConfig::default().list_profile;

        Ok(Self {
            directory_type: env::var("SEGSYNC_DIRECTORY_TYPE")
                .unwrap_or_else(|_| "acumbamail".to_string()),
            api_token: env::var("SEGSYNC_API_TOKEN")
                .map_err(|_| anyhow::anyhow!("SEGSYNC_API_TOKEN is not set"))?,
            api_base_url: env::var("SEGSYNC_API_BASE_URL").ok().filter(|s| !s.is_empty()),
            data_dir: env::var("SEGSYNC_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data")),
            rules_store: env::var("SEGSYNC_RULES_STORE").ok(),
            rules_sheet: env::var("SEGSYNC_RULES_SHEET").ok(),
            lists: env::var("SEGSYNC_LISTS")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            batch_size: env::var("SEGSYNC_BATCH_SIZE")
                .ok()
                .map(|s| {
                    s.trim().parse::<usize>().map_err(|e| {
                        anyhow::anyhow!("SEGSYNC_BATCH_SIZE must be a number. Got '{}': {}", s, e)
                    })
                })
                .transpose()?,
            tag_field: env::var("SEGSYNC_TAG_FIELD").ok(),
            profile: ListProfile {
                name: String::new(),
                sender_email: env::var("SEGSYNC_SENDER_EMAIL").unwrap_or_default(),
                company: env::var("SEGSYNC_COMPANY").unwrap_or_default(),
                country: env::var("SEGSYNC_COUNTRY").unwrap_or(defaults.country),
                city: env::var("SEGSYNC_CITY").unwrap_or_default(),
                address: env::var("SEGSYNC_ADDRESS").unwrap_or_default(),
                phone: env::var("SEGSYNC_PHONE").unwrap_or_default(),
            },
            log_level: env::var("SEGSYNC_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Validate the configuration
    ///
    /// Runner-level checks first, then the library's own validation of the
    /// assembled [`SyncConfig`].
    fn validate(&self) -> Result<()> {
        if self.api_token.trim().is_empty() {
            anyhow::bail!(
                "SEGSYNC_API_TOKEN is required. \
                Set it via: export SEGSYNC_API_TOKEN=your_token"
            );
        }

        let token_lower = self.api_token.to_lowercase();
        if token_lower.contains("your_token")
            || token_lower.contains("replace_me")
            || token_lower == "token"
        {
            anyhow::bail!(
                "SEGSYNC_API_TOKEN appears to be a placeholder. \
                Use an actual API token from your Acumbamail account."
            );
        }

        match self.directory_type.as_str() {
            "acumbamail" => {}
            _ => anyhow::bail!(
                "SEGSYNC_DIRECTORY_TYPE '{}' is not supported. \
                Supported directories: acumbamail",
                self.directory_type
            ),
        }

        if let Some(batch_size) = self.batch_size
            && !(1..=MAX_BATCH_SIZE).contains(&batch_size)
        {
            anyhow::bail!(
                "SEGSYNC_BATCH_SIZE must be between 1 and {}. Got: {}",
                MAX_BATCH_SIZE,
                batch_size
            );
        }

        if self.data_dir.as_os_str().is_empty() {
            anyhow::bail!("SEGSYNC_DATA_DIR cannot be empty");
        }

        if self.profile.sender_email.is_empty() {
            eprintln!(
                "WARNING: SEGSYNC_SENDER_EMAIL is not set. \
                Lists that must be created will have no sender address."
            );
        }

        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "SEGSYNC_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            ),
        }

        self.sync_config().validate()?;
        Ok(())
    }

    /// Assemble the library configuration
    fn sync_config(&self) -> SyncConfig {
        let mut rules = RuleSourceConfig::default();
        if let Some(store) = &self.rules_store {
            rules.store_id = store.clone();
        }
        if let Some(sheet) = &self.rules_sheet {
            rules.sheet = sheet.clone();
        }

        let mut lists = ListStoreConfig::default();
        if let Some(tag_field) = &self.tag_field {
            lists.tag_field = tag_field.clone();
        }

        let mut engine = EngineConfig {
            only_lists: self.lists.clone(),
            list_profile: self.profile.clone(),
            ..EngineConfig::default()
        };
        if let Some(batch_size) = self.batch_size {
            engine.batch_size = batch_size;
        }

        SyncConfig {
            directory: DirectoryConfig::Acumbamail {
                api_token: self.api_token.clone(),
                base_url: self.api_base_url.clone(),
            },
            table_store: TableStoreConfig::File {
                root: self.data_dir.clone(),
            },
            rules,
            lists,
            engine,
        }
    }
}

fn main() -> ExitCode {
    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return SegsyncExitCode::ConfigError.into();
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {}", e);
        return SegsyncExitCode::ConfigError.into();
    }

    // Initialize tracing
    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return SegsyncExitCode::ConfigError.into();
    }

    info!("Starting segsync");
    info!("Data directory: {}", config.data_dir.display());
    if !config.lists.is_empty() {
        info!("Restricted to {} list(s)", config.lists.len());
    }

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return SegsyncExitCode::RuntimeError.into();
        }
    };

    let code = rt.block_on(async {
        match run_sync(config).await {
            Ok((result, interrupted)) => {
                log_summary(&result);
                if interrupted {
                    warn!("Run interrupted; remaining lists were not reconciled");
                    SegsyncExitCode::RuntimeError
                } else if result.has_failures() {
                    SegsyncExitCode::ListFailures
                } else {
                    SegsyncExitCode::Success
                }
            }
            Err(e) => {
                error!("Run failed: {}", e);
                SegsyncExitCode::RuntimeError
            }
        }
    });

    code.into()
}

/// Wire the components and run one reconciliation pass
///
/// Returns the run result and whether a shutdown signal cut it short.
async fn run_sync(config: Config) -> Result<(RunResult, bool)> {
    let sync = config.sync_config();

    let registry = ComponentRegistry::with_builtin_stores();

    #[cfg(feature = "acumbamail")]
    {
        info!("Registering Acumbamail directory");
        segsync_directory_acumbamail::register(&registry);
    }

    let directory: Arc<dyn SubscriberDirectory> =
        Arc::from(registry.create_directory(&sync.directory)?);
    let store: Arc<dyn TableStore> = Arc::from(registry.create_table_store(&sync.table_store).await?);

    info!("Directory: {}", directory.directory_name());
    info!(
        "Rules: workbook '{}', sheet '{}'",
        sync.rules.store_id, sync.rules.sheet
    );

    let rule_source = RuleSource::new(Arc::clone(&store), sync.rules.clone());
    let repository = ListRepository::new(store, sync.lists.clone());
    let (engine, mut events) = ReconciliationEngine::new(directory, repository, sync.engine.clone())?;

    let event_logger = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            log_event(&event);
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal_watcher = tokio::spawn(async move {
        match wait_for_shutdown().await {
            Ok(signal) => {
                warn!("Received {}, stopping at the next batch boundary", signal);
                let _ = shutdown_tx.send(true);
            }
            Err(e) => error!("Signal handling unavailable: {}", e),
        }
    });

    let outcome = engine
        .run_from_source_with_shutdown(&rule_source, shutdown_rx.clone())
        .await;
    signal_watcher.abort();

    // Closing the channel ends the logger
    drop(engine);
    if let Err(e) = event_logger.await {
        warn!("Event logger task failed: {}", e);
    }

    let interrupted = *shutdown_rx.borrow();
    Ok((outcome?, interrupted))
}

fn log_event(event: &ReconcileEvent) {
    match event {
        ReconcileEvent::ListStarted { list_name, rules } => {
            debug!("[event] list '{}' started ({} rules)", list_name, rules)
        }
        ReconcileEvent::BatchFailed {
            list_name,
            batch,
            error,
        } => debug!("[event] list '{}' batch {} failed: {}", list_name, batch, error),
        other => debug!("[event] {:?}", other),
    }
}

fn log_summary(result: &RunResult) {
    for report in &result.lists_succeeded {
        info!(
            "List '{}': {} subscribers, {} new, {} changed, {} upserted, {} rejected, {} batch errors",
            report.list_name,
            report.subscribers,
            report.new_emails,
            report.changed,
            report.upserted,
            report.upsert_errors,
            report.batch_errors.len()
        );
        if !report.missing_columns.is_empty() {
            warn!(
                "List '{}' has no local column for: {}",
                report.list_name,
                report.missing_columns.join(", ")
            );
        }
    }

    for (list_name, reason) in &result.lists_skipped {
        info!("List '{}' skipped: {}", list_name, reason);
    }

    for failure in &result.lists_failed {
        error!("List '{}' failed: {}", failure.list_name, failure.error);
    }

    for segment in &result.segments_failed {
        warn!(
            "Segment '{}' on list '{}' not created: {}",
            segment.segment_name,
            segment.list_name,
            segment.error.as_deref().unwrap_or("unknown error")
        );
    }

    info!(
        "Run complete: {} lists succeeded, {} failed, {} skipped; {} segments created, {} failed",
        result.lists_succeeded.len(),
        result.lists_failed.len(),
        result.lists_skipped.len(),
        result.segments_created.len(),
        result.segments_failed.len()
    );
}

/// Wait for an interrupt (SIGTERM, SIGINT)
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;

    tokio::select! {
        _ = sigterm.recv() => Ok("SIGTERM"),
        _ = sigint.recv() => Ok("SIGINT"),
    }
}

/// Wait for an interrupt (SIGINT only)
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}
