mod logging;

use std::path::Path;
use std::sync::Arc;
use anyhow::{anyhow, Context};
use clap::Parser;
use tracing::level_filters::LevelFilter;
use nw_reconfig_lib::batch::consolidate::{consolidate, prepare_apply};
use nw_reconfig_lib::batch::validate::validate_payload;
use nw_reconfig_lib::collaborators::dns::HostsFileDns;
use nw_reconfig_lib::collaborators::inventory::ClusterInventoryFile;
use nw_reconfig_lib::collaborators::store::{JsonFileStore, StdoutStore};
use nw_reconfig_lib::collaborators::RequestStore;
use nw_reconfig_lib::direction::Direction;
use nw_reconfig_lib::gateway::ssh::SshGateway;
use nw_reconfig_lib::orchestration::orchestrator::ReconfigOrchestrator;
use nw_reconfig_lib::orchestration::ReconfigCommon;
use nw_reconfig_schemas::cli_models::{ExecuteCmd, Opts, SubCommand};
use nw_reconfig_schemas::payload::{BatchPayload, BatchStatus};
use nw_reconfig_schemas::settings::ReconfigSettings;
use crate::logging::configure_logging;

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() {
    std::process::exit(match run_app().await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{:#}", err);
            1
        }
    });
}

fn log_level(s: &str) -> anyhow::Result<LevelFilter> {
    match s.to_lowercase().as_str() {
        "error" => Ok(LevelFilter::ERROR),
        "warn" => Ok(LevelFilter::WARN),
        "info" => Ok(LevelFilter::INFO),
        "debug" => Ok(LevelFilter::DEBUG),
        "trace" => Ok(LevelFilter::TRACE),
        _ => Err(anyhow!("Unknown Log LevelFilter {}", s)),
    }
}

/// Parses the command line, sets up logging and runs the chosen sub command. Returns the process
/// exit code.
pub async fn run_app() -> anyhow::Result<i32> {
    let opts: Opts = Opts::parse();
    let mut e = None;
    let level = match &opts.verbosity {
        None => LevelFilter::INFO,
        Some(x) => match log_level(x) {
            Ok(l) => l,
            Err(err) => {
                e = Some(err);
                LevelFilter::INFO
            }
        },
    };
    let _guard = configure_logging(level, opts.log_dir.as_deref()).await?;
    if let Some(e) = e {
        tracing::warn!("{}", e);
    }

    tracing::trace!("running {}", opts.sub_command.name());
    match parse_command(&opts).await {
        Ok(code) => Ok(code),
        Err(err) => {
            tracing::error!("ERROR: {}", err);
            err.chain().skip(1).for_each(|cause| tracing::error!("because: {}", cause));
            Ok(1)
        }
    }
}

pub async fn parse_command(opts: &Opts) -> anyhow::Result<i32> {
    match &opts.sub_command {
        SubCommand::Validate(args) => validate(&args.payload).await,
        SubCommand::ShowWork(args) => show_work(&args.payload).await,
        SubCommand::Run(cmd) => execute(opts, cmd, None).await,
        SubCommand::Apply(cmd) => execute(opts, cmd, Some(Direction::Apply)).await,
        SubCommand::Revert(cmd) => execute(opts, cmd, Some(Direction::Revert)).await,
    }
}

async fn read_payload(location: &Path) -> anyhow::Result<BatchPayload> {
    BatchPayload::read(location).await
        .with_context(|| format!("reading payload {location:?}"))
}

async fn validate(location: &Path) -> anyhow::Result<i32> {
    let mut payload = read_payload(location).await?;
    let direction = Direction::infer(&payload);
    match validate_payload(&mut payload, direction) {
        Ok(()) => {
            tracing::info!("{} payload is valid", direction.label());
            Ok(0)
        }
        Err(err) => {
            tracing::error!("{}: {}", err.code(), err);
            Ok(1)
        }
    }
}

async fn show_work(location: &Path) -> anyhow::Result<i32> {
    let mut payload = read_payload(location).await?;
    let direction = Direction::infer(&payload);
    if let Err(err) = validate_payload(&mut payload, direction) {
        tracing::error!("{}: {}", err.code(), err);
        return Ok(1);
    }
    if direction == Direction::Apply {
        prepare_apply(&mut payload);
    }
    let work = consolidate(&payload, direction);
    let text = serde_json::to_string_pretty(&work).context("serialising consolidated work")?;
    println!("{text}");
    Ok(0)
}

/// Wires the ssh gateway and the file backed collaborators together and runs the batch.
async fn execute(opts: &Opts, cmd: &ExecuteCmd, direction: Option<Direction>) -> anyhow::Result<i32> {
    let settings = ReconfigSettings::read(opts.config.as_deref()).await
        .context("reading nw-reconfig settings")?;
    tracing::debug!("settings: {}", settings);
    let inventory = ClusterInventoryFile::read(&settings.inventory_path).await
        .with_context(|| format!("reading cluster inventory {:?}", settings.inventory_path))?;
    let mut payload = read_payload(&cmd.payload.payload).await?;

    let gateway = Arc::new(SshGateway::new(&settings));
    let dns = Arc::new(HostsFileDns::new(&settings, gateway.clone()));
    let stdout_store = Arc::new(StdoutStore::default());
    let store: Arc<dyn RequestStore> = match &cmd.output {
        Some(location) => Arc::new(JsonFileStore::new(location.clone())),
        None => stdout_store.clone(),
    };
    let operation_id = opts.operation_id.clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let common = ReconfigCommon {
        settings,
        gateway,
        inventory: Arc::new(inventory),
        operation_id,
    };

    let mut orchestrator = ReconfigOrchestrator::new(common, dns, store);
    if let Some(direction) = direction {
        orchestrator = orchestrator.with_direction(direction);
    }
    let result = orchestrator.apply(&mut payload).await;
    if cmd.output.is_none() {
        stdout_store.print().await;
    }

    match result {
        Ok(BatchStatus::Success) | Ok(BatchStatus::Noop) => Ok(0),
        Ok(BatchStatus::Failure) => {
            tracing::error!(
                "batch failed with error code {}: {}",
                payload.update_network.errorcode.as_deref().unwrap_or_default(),
                payload.update_network.msg
            );
            Ok(1)
        }
        Err(err) => {
            tracing::error!("{}: {}", err.code(), err);
            Ok(1)
        }
    }
}
