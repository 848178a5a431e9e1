use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::cli::Cli;
use crate::database::dump::DumpCredentials;
use crate::database::process::DEFAULT_COMMAND_TIMEOUT;
use crate::database::storage::chunking::MAX_CHUNK_SIZE;

/// Default Google Cloud Storage API endpoint
pub const GCS_API_ENDPOINT: &str = "https://storage.googleapis.com";

/// GCE metadata server endpoint handing out service-account tokens
pub const GCE_TOKEN_ENDPOINT: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Remote object-storage backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ProviderKind {
    /// Google Cloud Storage, single-shot uploads
    Gs,
    /// Amazon S3, chunked multipart uploads
    S3,
    /// A directory on this machine
    Local,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Gs => "gs",
            ProviderKind::S3 => "s3",
            ProviderKind::Local => "local",
        }
    }
}

/// Configuration for the remote storage provider
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub provider: ProviderKind,
    /// Bucket name (or sub-directory of `local_root` for the local provider)
    pub bucket: String,
    /// AWS access key id; the default credential chain is used when unset
    pub s3_access_key_id: Option<String>,
    pub s3_secret_access_key: Option<String>,
    pub s3_region: String,
    /// Custom endpoint for S3-compatible services
    pub s3_endpoint_url: Option<String>,
    /// Static OAuth2 bearer token; the metadata server is used when unset
    pub gcs_token: Option<String>,
    pub gcs_endpoint: String,
    pub gcs_token_endpoint: String,
    pub local_root: PathBuf,
    /// Maximum bytes per multipart chunk
    pub chunk_size: u64,
    /// Multipart chunks in flight at once
    pub upload_concurrency: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Gs,
            bucket: String::new(),
            s3_access_key_id: None,
            s3_secret_access_key: None,
            s3_region: String::from("us-east-1"),
            s3_endpoint_url: None,
            gcs_token: None,
            gcs_endpoint: String::from(GCS_API_ENDPOINT),
            gcs_token_endpoint: String::from(GCE_TOKEN_ENDPOINT),
            local_root: PathBuf::from("/var/backups/edx"),
            chunk_size: MAX_CHUNK_SIZE,
            upload_concurrency: 1,
        }
    }
}

impl StorageConfig {
    pub fn from_cli(cli: &Cli) -> Self {
        let defaults = Self::default();
        Self {
            provider: cli.provider,
            bucket: cli.bucket.clone().unwrap_or_default(),
            s3_access_key_id: non_empty(cli.s3_id.clone()),
            s3_secret_access_key: non_empty(cli.s3_key.clone()),
            s3_region: cli.s3_region.clone(),
            s3_endpoint_url: non_empty(env::var("BACKUP_S3_ENDPOINT_URL").ok()),
            gcs_token: non_empty(cli.gcs_token.clone()),
            gcs_endpoint: env::var("BACKUP_GCS_ENDPOINT").unwrap_or(defaults.gcs_endpoint),
            gcs_token_endpoint: env::var("BACKUP_GCS_TOKEN_ENDPOINT")
                .unwrap_or(defaults.gcs_token_endpoint),
            local_root: cli.local_root.clone().unwrap_or(defaults.local_root),
            chunk_size: chunk_size_from(env::var("BACKUP_CHUNK_SIZE").ok().as_deref()),
            upload_concurrency: cli.upload_concurrency.max(1),
        }
    }
}

/// Configuration for the backup pipeline
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Temporary storage directory used during backup
    pub backup_dir: PathBuf,
    pub credentials: DumpCredentials,
    pub compressed: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            backup_dir: PathBuf::from("/tmp/db_backups"),
            credentials: DumpCredentials::default(),
            compressed: true,
        }
    }
}

impl BackupConfig {
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            backup_dir: cli.backup_dir.clone(),
            credentials: DumpCredentials::new(
                cli.user.clone().unwrap_or_default(),
                cli.password.clone().unwrap_or_default(),
            ),
            compressed: !cli.uncompressed,
        }
    }
}

/// Commands and names used by the MySQL post-restore reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreSettings {
    /// Schema dropped, recreated and loaded
    pub database: String,
    /// Shell file sourced before running migrations
    pub env_file: PathBuf,
    /// Management command running the migrations
    pub manage_command: String,
    pub supervisorctl: String,
    /// Supervisor group restarted once the data is back
    pub service_group: String,
}

impl Default for RestoreSettings {
    fn default() -> Self {
        Self {
            database: String::from("edxapp"),
            env_file: PathBuf::from("/edx/app/edxapp/edxapp_env"),
            manage_command: String::from("/edx/bin/manage.edxapp"),
            supervisorctl: String::from("/edx/bin/supervisorctl"),
            service_group: String::from("edxapp:"),
        }
    }
}

impl RestoreSettings {
    /// Load restore settings from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database: env::var("BACKUP_MYSQL_DATABASE").unwrap_or(defaults.database),
            env_file: env::var("BACKUP_EDXAPP_ENV")
                .map(PathBuf::from)
                .unwrap_or(defaults.env_file),
            manage_command: env::var("BACKUP_MANAGE_COMMAND").unwrap_or(defaults.manage_command),
            supervisorctl: env::var("BACKUP_SUPERVISORCTL").unwrap_or(defaults.supervisorctl),
            service_group: env::var("BACKUP_SERVICE_GROUP").unwrap_or(defaults.service_group),
        }
    }
}

/// Where alerts and metrics go
#[derive(Debug, Clone, Default)]
pub struct SinkConfig {
    /// Sentry DSN; alerts are only logged when empty
    pub sentry_dsn: Option<String>,
    pub pushgateway: String,
}

impl SinkConfig {
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            sentry_dsn: non_empty(cli.sentry_dsn.clone()),
            pushgateway: cli.pushgateway.clone(),
        }
    }
}

/// Upper bound for each external command
pub fn command_timeout(cli: &Cli) -> Duration {
    cli.command_timeout
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_COMMAND_TIMEOUT)
}

/// Chunk size override, capped at the largest allowed part
fn chunk_size_from(value: Option<&str>) -> u64 {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|size| *size > 0)
        .map_or(MAX_CHUNK_SIZE, |size| size.min(MAX_CHUNK_SIZE))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("edx_backup").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_backup_config_from_cli() {
        let cli = parse(&["mongodb", "-d", "/data/dumps", "-u", "root", "--password", "pw", "-n"]);
        let config = BackupConfig::from_cli(&cli);

        assert_eq!(config.backup_dir, PathBuf::from("/data/dumps"));
        assert_eq!(config.credentials.user, "root");
        assert_eq!(config.credentials.password, "pw");
        assert!(!config.compressed);
    }

    #[test]
    fn test_storage_config_from_cli() {
        let cli = parse(&[
            "mysql",
            "-p",
            "s3",
            "-b",
            "nightly",
            "-i",
            "AKIA",
            "-k",
            "",
            "--upload-concurrency",
            "0",
        ]);
        let config = StorageConfig::from_cli(&cli);

        assert_eq!(config.provider, ProviderKind::S3);
        assert_eq!(config.bucket, "nightly");
        assert_eq!(config.s3_access_key_id.as_deref(), Some("AKIA"));
        assert_eq!(config.s3_secret_access_key, None);
        assert_eq!(config.upload_concurrency, 1);
        assert_eq!(config.chunk_size, MAX_CHUNK_SIZE);
    }

    #[test]
    fn test_chunk_size_override_is_capped() {
        use crate::database::storage::chunking::plan_chunks;

        assert_eq!(chunk_size_from(None), MAX_CHUNK_SIZE);
        assert_eq!(chunk_size_from(Some("1048576")), 1_048_576);
        assert_eq!(chunk_size_from(Some("0")), MAX_CHUNK_SIZE);
        assert_eq!(chunk_size_from(Some("lots")), MAX_CHUNK_SIZE);

        let oversized = chunk_size_from(Some("209715200"));
        assert_eq!(oversized, MAX_CHUNK_SIZE);
        let chunks = plan_chunks(250 * 1024 * 1024, oversized);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.length <= MAX_CHUNK_SIZE));
    }

    #[test]
    fn test_restore_settings_defaults() {
        let settings = RestoreSettings::default();
        assert_eq!(settings.database, "edxapp");
        assert_eq!(settings.service_group, "edxapp:");
        assert_eq!(settings.manage_command, "/edx/bin/manage.edxapp");
    }

    #[test]
    fn test_command_timeout() {
        let cli = parse(&["mysql", "--command-timeout", "30"]);
        assert_eq!(command_timeout(&cli), Duration::from_secs(30));
    }
}
