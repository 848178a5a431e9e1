use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use tracing::instrument::WithSubscriber;
use tracing::{error, info, warn};

mod alerts;
mod cli;
mod config;
mod database;
mod metrics;
mod telemetry;

use alerts::{AlertContext, AlertSink, LogAlertSink, SentryAlertSink};
use cli::{Cli, Mode};
use config::{BackupConfig, RestoreSettings, SinkConfig, StorageConfig};
use database::backup::{BackupOutcome, BackupPipeline};
use database::backup_naming::BackupNamingService;
use database::monitor::BackupMonitor;
use database::process::{CommandRunner, ProcessRunner};
use database::restore::RestorePipeline;
use database::storage::create_storage_provider;
use database::{BackupError, Result};
use metrics::PushgatewayClient;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // Load .env file
    dotenv().ok();

    let argv0 = std::env::args().next().unwrap_or_default();
    let Some(mode) = Mode::from_program_name(&argv0) else {
        eprintln!(
            "unknown program name {:?}: run as edx_backup, edx_restore or edx_backups_monitor",
            argv0
        );
        return ExitCode::from(2);
    };

    let cli = Cli::parse();
    run(mode, cli).with_subscriber(telemetry::dispatch()).await
}

async fn run(mode: Mode, cli: Cli) -> ExitCode {
    info!(?mode, service = %cli.service, "Starting");

    let naming = BackupNamingService::for_local_host();
    let runner: Arc<dyn CommandRunner> =
        Arc::new(ProcessRunner::new(config::command_timeout(&cli)));

    match mode {
        Mode::Backup => run_backup(&cli, runner, naming).await,
        Mode::Restore => match run_restore(&cli, runner).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("Restore failed: {}", e);
                ExitCode::FAILURE
            }
        },
        Mode::Monitor => {
            run_monitor(&cli, naming).await;
            ExitCode::SUCCESS
        }
    }
}

async fn run_backup(
    cli: &Cli,
    runner: Arc<dyn CommandRunner>,
    naming: BackupNamingService,
) -> ExitCode {
    let alerts = alert_sink(&SinkConfig::from_cli(cli), naming.hostname());
    let storage_config = StorageConfig::from_cli(cli);

    let storage = match create_storage_provider(&storage_config).await {
        Ok(storage) => storage,
        Err(e) => {
            error!("Backup of {} cannot start: {}", cli.service, e);
            let context = AlertContext::new()
                .with_unique_fingerprint()
                .with_tag("stage", "setup")
                .with_tag("kind", cli.service.as_str())
                .with_tag("bucket", storage_config.bucket.as_str());
            alerts.capture(&e, &context).await;
            return ExitCode::FAILURE;
        }
    };

    let pipeline = BackupPipeline::new(runner, storage, alerts, naming, BackupConfig::from_cli(cli));
    let outcome = pipeline.run(&cli.service).await;
    match &outcome {
        BackupOutcome::Shipped { key } => info!(%key, "Backup complete"),
        BackupOutcome::Failed(e) => error!(kind = e.kind(), "Backup did not complete"),
    }
    ExitCode::from(outcome.exit_code())
}

async fn run_restore(cli: &Cli, runner: Arc<dyn CommandRunner>) -> Result<()> {
    let backup_path = cli
        .restore_path
        .as_deref()
        .ok_or_else(|| BackupError::Config("a backup path is required (-r)".to_string()))?;

    RestorePipeline::new(runner, RestoreSettings::from_env())
        .restore(&cli.service, backup_path, !cli.uncompressed, &cli.settings)
        .await
}

async fn run_monitor(cli: &Cli, naming: BackupNamingService) {
    let sinks = SinkConfig::from_cli(cli);
    let alerts = alert_sink(&sinks, naming.hostname());
    let storage_config = StorageConfig::from_cli(cli);

    let setup = async {
        let storage = create_storage_provider(&storage_config).await?;
        let metrics = Arc::new(PushgatewayClient::new(&sinks.pushgateway)?);
        Ok::<_, BackupError>((storage, metrics))
    };

    match setup.await {
        Ok((storage, metrics)) => {
            BackupMonitor::new(storage, metrics, alerts, naming)
                .run(&cli.service)
                .await;
        }
        Err(e) => {
            error!("Backup monitor cannot start: {}", e);
            let context = AlertContext::new()
                .with_tag("bucket", storage_config.bucket.as_str())
                .with_tag("kind", cli.service.as_str());
            alerts.capture(&e, &context).await;
        }
    }
}

/// Sentry when a DSN is configured, log-only otherwise
fn alert_sink(sinks: &SinkConfig, server_name: &str) -> Arc<dyn AlertSink> {
    let Some(dsn) = &sinks.sentry_dsn else {
        return Arc::new(LogAlertSink);
    };
    match SentryAlertSink::from_dsn(dsn, server_name) {
        Ok(sink) => Arc::new(sink),
        Err(e) => {
            warn!("Alerts will only be logged: {}", e);
            Arc::new(LogAlertSink)
        }
    }
}
