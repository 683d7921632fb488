//! Trellis CLI entrypoint.
//!
//! This is the main entrypoint for the trellis command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use trellis::adapter::{AdapterRegistry, HttpAdapter, MemoryAdapter, ResourceAdapter};
use trellis::cli::{Cli, Commands, OutputFormatter, StateCommands};
use trellis::config::{
    Manifest, ManifestParser, ManifestValidator, ProviderDriver, StateBackend, find_manifest_file,
};
use trellis::engine::{Engine, RunOutcome};
use trellis::error::{ApplyError, ConfigError, Result, TrellisError};
use trellis::graph::DependencyGraph;
use trellis::planner::CancelToken;
use trellis::state::{LocalStateStore, S3StateStore, StateStore, generate_holder_id};

use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Validate { warnings } => cmd_validate(cli.config.as_ref(), warnings),
        Commands::Graph => cmd_graph(cli.config.as_ref(), &formatter),
        Commands::Plan { detailed } => cmd_plan(cli.config.as_ref(), detailed, &formatter).await,
        Commands::Apply { yes } => cmd_apply(cli.config.as_ref(), yes, &formatter).await,
        Commands::Status { detailed } => {
            cmd_status(cli.config.as_ref(), detailed, &formatter).await
        }
        Commands::Reconcile { yes, max_attempts } => {
            cmd_reconcile(cli.config.as_ref(), yes, max_attempts, &formatter).await
        }
        Commands::Destroy { yes } => cmd_destroy(cli.config.as_ref(), yes, &formatter).await,
        Commands::Drift => cmd_drift(cli.config.as_ref(), &formatter).await,
        Commands::State { command } => cmd_state(cli.config.as_ref(), command, &formatter).await,
    }
}

/// Initialize a new project.
fn cmd_init(path: &PathBuf, force: bool) -> Result<()> {
    info!("Initializing new Trellis project in: {}", path.display());

    let manifest_path = path.join("trellis.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    // Check if files exist
    if !force && manifest_path.exists() {
        eprintln!("Manifest file already exists: {}", manifest_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    // Create directory if needed
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    // Write manifest template
    let manifest_template = include_str!("../templates/trellis.yaml");
    std::fs::write(&manifest_path, manifest_template)?;
    eprintln!("Created: {}", manifest_path.display());

    // Write .env.example
    let env_template = include_str!("../templates/.env.example");
    std::fs::write(&env_path, env_template)?;
    eprintln!("Created: {}", env_path.display());

    // Write/update .gitignore
    let gitignore_content = ".env\n.trellis/\n";
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        if !existing.contains(".env") || !existing.contains(".trellis") {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# Trellis")?;
            if !existing.contains(".env") {
                writeln!(file, ".env")?;
            }
            if !existing.contains(".trellis") {
                writeln!(file, ".trellis/")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, gitignore_content)?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nProject initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Edit trellis.yaml with your resource topology");
    eprintln!("  2. Run 'trellis validate' to check the manifest");
    eprintln!("  3. Run 'trellis plan' to see what would change");
    eprintln!("  4. Run 'trellis apply' to converge the topology");

    Ok(())
}

/// Validate the manifest.
fn cmd_validate(config_path: Option<&PathBuf>, show_warnings: bool) -> Result<()> {
    let manifest_file = resolve_manifest_path(config_path)?;
    info!("Validating manifest: {}", manifest_file.display());

    // Load .env
    let parser = parser_for(&manifest_file);
    parser.load_dotenv()?;

    // Parse manifest
    let manifest = parser.load_file(&manifest_file)?;

    // Validate declarations and the graph they imply
    let validator = ManifestValidator::new();
    let result = validator.validate(&manifest)?;
    DependencyGraph::build(&manifest.resources)?;

    eprintln!("Manifest is valid!");
    if show_warnings && !result.warnings.is_empty() {
        eprintln!("\nWarnings:");
        for warning in &result.warnings {
            eprintln!("  - {warning}");
        }
    }

    // Show summary
    eprintln!("\nManifest summary:");
    eprintln!("  Project: {}", manifest.project.name);
    eprintln!("  Environment: {}", manifest.project.environment);
    eprintln!("  Resources: {}", manifest.resources.len());

    Ok(())
}

/// Show the dependency graph.
fn cmd_graph(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<()> {
    let (manifest, _base) = load_manifest(config_path)?;

    ManifestValidator::new().validate(&manifest)?;
    let graph = DependencyGraph::build(&manifest.resources)?;

    let output = formatter.format_graph(&graph);
    eprintln!("{output}");

    Ok(())
}

/// Show the execution plan.
async fn cmd_plan(
    config_path: Option<&PathBuf>,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (manifest, store) = load_manifest_and_state(config_path).await?;
    let registry = build_registry(&manifest)?;
    let engine = Engine::new(&manifest, &store, registry);

    let plan = engine.plan().await?;

    let output = formatter.format_plan(&plan);
    eprintln!("{output}");

    if detailed && !plan.is_empty() {
        eprintln!("\nOperations in detail:");
        for op in &plan.ops {
            eprintln!("  {op}");
            for dep in &op.depends_on {
                eprintln!("      after: {dep}");
            }
        }
    }

    Ok(())
}

/// Apply one round of planned changes.
async fn cmd_apply(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (manifest, store) = load_manifest_and_state(config_path).await?;
    let registry = build_registry(&manifest)?;
    let engine = Engine::new(&manifest, &store, registry);

    // Show the plan first
    let plan = engine.plan().await?;
    if plan.is_empty() {
        eprintln!("No changes to apply.");
        return Ok(());
    }

    let output = formatter.format_plan(&plan);
    eprintln!("{output}");

    // Confirm
    if !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
        eprintln!("Apply cancelled.");
        return Ok(());
    }

    let cancel = cancel_on_ctrl_c();
    let outcome = engine.apply(&cancel).await?;

    eprintln!("{}", formatter.format_outcome(&outcome));

    if outcome.converged {
        Ok(())
    } else {
        Err(ApplyError::Aborted {
            reason: abort_reason(&outcome, "operation(s)"),
        }
        .into())
    }
}

/// Show remembered state.
async fn cmd_status(
    config_path: Option<&PathBuf>,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (_manifest, store) = load_manifest_and_state(config_path).await?;

    match store.load().await? {
        Some(state) => {
            let output = formatter.format_status(&state, detailed);
            eprintln!("{output}");
        }
        None => eprintln!("No state found. Run 'trellis apply' first."),
    }

    Ok(())
}

/// Reconcile until converged.
async fn cmd_reconcile(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    max_attempts: Option<u32>,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (manifest, store) = load_manifest_and_state(config_path).await?;
    let registry = build_registry(&manifest)?;

    let mut engine = Engine::new(&manifest, &store, registry);
    if let Some(attempts) = max_attempts {
        engine = engine.with_max_attempts(attempts);
    }

    // Confirm
    if !auto_approve
        && !confirm(
            "This will converge the topology to match the manifest. Continue? [y/N]: ",
            "y",
        )?
    {
        eprintln!("Reconciliation cancelled.");
        return Ok(());
    }

    let cancel = cancel_on_ctrl_c();
    let outcome = engine.reconcile(&cancel).await?;

    eprintln!("{}", formatter.format_outcome(&outcome));

    Ok(())
}

/// Destroy every remembered resource.
async fn cmd_destroy(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (manifest, store) = load_manifest_and_state(config_path).await?;
    let registry = build_registry(&manifest)?;
    let engine = Engine::new(&manifest, &store, registry);

    // Show what would go, from the remembered records
    let Some(state) = store.load().await? else {
        eprintln!("No state found; nothing to destroy.");
        return Ok(());
    };
    if state.record_count() == 0 {
        eprintln!("No resources remembered; nothing to destroy.");
        return Ok(());
    }

    eprintln!("The following resources will be destroyed:");
    for id in state.record_ids() {
        eprintln!("  - {id}");
    }

    // Confirm
    if !auto_approve
        && !confirm("\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ", "destroy")?
    {
        eprintln!("Destruction cancelled.");
        return Ok(());
    }

    let cancel = cancel_on_ctrl_c();
    let outcome = engine.destroy(&cancel).await?;

    eprintln!("{}", formatter.format_outcome(&outcome));

    if outcome.converged {
        eprintln!("All resources destroyed.");
        Ok(())
    } else {
        Err(ApplyError::Aborted {
            reason: abort_reason(&outcome, "delete(s)"),
        }
        .into())
    }
}

/// Check for drift.
async fn cmd_drift(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<()> {
    let (manifest, store) = load_manifest_and_state(config_path).await?;
    let registry = build_registry(&manifest)?;
    let engine = Engine::new(&manifest, &store, registry);

    let report = engine.check_drift().await?;

    let output = formatter.format_drift(&report);
    eprintln!("{output}");

    Ok(())
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&PathBuf>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (_manifest, store) = load_manifest_and_state(config_path).await?;

    match command {
        StateCommands::Show => {
            if let Some(state) = store.load().await? {
                let output = formatter.format_state(&state);
                eprintln!("{output}");
            } else {
                eprintln!("No state found.");
            }
        }
        StateCommands::Lock { holder } => {
            let holder = holder.unwrap_or_else(generate_holder_id);
            let lock = store.acquire_lock(&holder).await?;
            eprintln!("State locked: {}", lock.lock_id);
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                if let Some(lock_info) = store.get_lock_info().await? {
                    store.release_lock(&lock_info.lock_id).await?;
                    eprintln!("State forcefully unlocked.");
                } else {
                    eprintln!("State is not locked.");
                }
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                eprintln!("State unlocked.");
            } else {
                eprintln!("Please provide --lock-id or use --force");
            }
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the manifest file path.
fn resolve_manifest_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_manifest_file("."), |path| Ok(path.clone()))
}

/// Builds a parser rooted next to the manifest file.
fn parser_for(manifest_file: &Path) -> ManifestParser {
    ManifestParser::new()
        .with_base_path(manifest_file.parent().unwrap_or_else(|| Path::new(".")))
}

/// Loads the manifest with environment substitution applied.
fn load_manifest(config_path: Option<&PathBuf>) -> Result<(Manifest, PathBuf)> {
    let manifest_file = resolve_manifest_path(config_path)?;
    debug!("Loading manifest from: {}", manifest_file.display());

    let parser = parser_for(&manifest_file);
    parser.load_dotenv()?;

    let manifest = parser.load_with_env(&manifest_file)?;
    let base = manifest_file
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    Ok((manifest, base))
}

/// Loads the manifest and opens the configured state store.
async fn load_manifest_and_state(
    config_path: Option<&PathBuf>,
) -> Result<(Manifest, Box<dyn StateStore>)> {
    let (manifest, base) = load_manifest(config_path)?;

    let store: Box<dyn StateStore> = match manifest.state.backend {
        StateBackend::Local => {
            let path = manifest
                .state
                .path
                .as_ref()
                .map_or_else(|| base.join(".trellis"), PathBuf::from);
            Box::new(LocalStateStore::with_base_dir(path))
        }
        StateBackend::S3 => {
            let bucket = manifest.state.bucket.as_deref().ok_or_else(|| {
                TrellisError::Config(ConfigError::ValidationError {
                    message: String::from("S3 bucket not configured"),
                    field: Some(String::from("state.bucket")),
                })
            })?;
            let prefix = manifest.state.prefix.as_deref();
            let region = manifest.state.region.as_deref();
            Box::new(S3StateStore::new(bucket, prefix, region).await?)
        }
    };

    Ok((manifest, store))
}

/// Builds the adapter registry for the configured provider.
fn build_registry(manifest: &Manifest) -> Result<AdapterRegistry> {
    let adapter: Arc<dyn ResourceAdapter> = match manifest.provider.driver {
        ProviderDriver::Memory => Arc::new(MemoryAdapter::new()),
        ProviderDriver::Http => {
            let endpoint = manifest.provider.endpoint.as_deref().ok_or_else(|| {
                TrellisError::Config(ConfigError::ValidationError {
                    message: String::from("HTTP endpoint not configured"),
                    field: Some(String::from("provider.endpoint")),
                })
            })?;

            ManifestParser::validate_required_env(&manifest.provider)?;
            let token = ManifestParser::provider_token(&manifest.provider)?;

            Arc::new(HttpAdapter::with_timeout(
                endpoint,
                Some(&token),
                manifest.provider.timeout_secs,
            )?)
        }
    };

    Ok(AdapterRegistry::with_fallback(adapter))
}

/// Describes why a run left operations outstanding.
fn abort_reason(outcome: &RunOutcome, what: &str) -> String {
    let pending = outcome.report.pending();
    if outcome.report.was_cancelled() {
        format!("run cancelled with {pending} {what} outstanding")
    } else {
        format!("{pending} {what} did not apply")
    }
}

/// Installs a Ctrl-C handler that cancels the running operation.
fn cancel_on_ctrl_c() -> CancelToken {
    let cancel = CancelToken::new();
    let watcher = cancel.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nCancellation requested; letting in-flight operations finish...");
            watcher.cancel();
        }
    });

    cancel
}

/// Prompts on stderr and checks the answer against the expected word.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;

    Ok(input.trim().eq_ignore_ascii_case(expected))
}
