//! Chain execution — `chatchain run`.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{info, warn};

use super::super::{Cli, RunArgs};

pub async fn cmd_run(cli: &Cli, args: &RunArgs) -> Result<()> {
    use chatchain::audit::RunConfig;
    use chatchain::backend::{BackendRegistry, ModelCatalog};
    use chatchain::config::{
        CompanyConfig, MODEL_CATALOG_FILE, absolutize, log_file_path, software_name, timestamp,
    };
    use chatchain::logging;
    use chatchain::orchestrator::{CancelFlag, ChainExecutor, WarehouseStaging};
    use chatchain::pipeline::PhaseRegistry;

    let company_root = absolutize(&cli.company_root)?;
    let company = CompanyConfig::resolve(&company_root, &args.config)?;
    let loaded = company.load()?;

    let catalog = ModelCatalog::load_or_default(&company_root.join(MODEL_CATALOG_FILE))?;
    let spec = catalog
        .resolve(&args.platform, &args.model, args.api_type.as_deref())
        .context("Failed to resolve model backend")?
        .with_api_key_from_env();
    let backend = BackendRegistry::default()
        .create(&spec)
        .with_context(|| format!("Failed to create backend for platform '{}'", spec.vendor))?;

    let warehouse = absolutize(&args.warehouse)?;
    let start_time = timestamp();
    let log_file = log_file_path(&warehouse, &args.name, &args.org, &start_time);
    let _guard = logging::init(cli.verbose, Some(&log_file))?;

    info!(
        company = %company.company,
        model = %spec.model,
        platform = %spec.vendor,
        api_style = %spec.api_style,
        "Starting {}",
        software_name(&args.name, &args.org, &start_time)
    );

    let config_dir = company
        .chain_config
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| company_root.join(&company.company));
    let code_path = args.path.as_deref().map(absolutize).transpose()?;

    let staging = WarehouseStaging::new(&warehouse, &args.name, &args.org, &args.task)
        .with_start_time(&start_time)
        .with_config_files(&config_dir, &company.files())
        .with_code_path(code_path)
        .with_log_file(Some(log_file.clone()));
    let artifact_dir = staging.artifact_directory();

    let cancel = CancelFlag::new();
    let handle = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping before the next phase");
            handle.cancel();
        }
    });

    let mut executor = ChainExecutor::new(
        loaded.chain,
        loaded.phases,
        loaded.roles,
        PhaseRegistry::chatdev(),
        backend,
    )?
    .with_hooks(staging)
    .with_cancel_flag(cancel)
    .with_message_window(args.message_window)
    .with_run_config(RunConfig {
        project_name: args.name.clone(),
        org_name: args.org.clone(),
        task: args.task.clone(),
        model: spec.model.clone(),
        platform: spec.vendor.clone(),
        config_dir: config_dir.clone(),
        artifact_dir: artifact_dir.clone(),
    });

    let summary = executor
        .run()
        .await
        .with_context(|| format!("Run failed, partial artifacts in {}", artifact_dir.display()))?;

    println!();
    println!(
        "{} {}",
        console::style("Done:").green().bold(),
        summary.artifact_directory.display()
    );
    println!("  Code version: {}", summary.version);
    println!("  Phases:       {}", summary.phases_recorded);
    println!(
        "  Calls:        {} ({} tokens, ${:.6})",
        summary.cost.calls,
        summary.cost.total_tokens(),
        summary.cost.cost_usd
    );
    if let Some(audit) = &summary.audit_file {
        println!("  Audit:        {}", audit.display());
    }

    Ok(())
}
