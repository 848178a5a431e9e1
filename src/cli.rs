//! Command line interface shared by the three program identities
//!
//! Every flag falls back to an environment variable so cron jobs can be
//! configured from a `.env` file.

use std::path::{Path, PathBuf};

use clap::Parser;

use crate::config::ProviderKind;

#[derive(Debug, Parser)]
#[command(about = "Back up, restore and monitor MySQL and MongoDB databases")]
pub struct Cli {
    /// mongodb or mysql
    pub service: String,

    /// Path to a backup used to restore a database
    #[arg(short = 'r', long = "restore-path", env = "BACKUP_RESTORE_PATH")]
    pub restore_path: Option<PathBuf>,

    /// Temporary storage directory used during backup
    #[arg(short = 'd', long = "dir", env = "BACKUP_DIR", default_value = "/tmp/db_backups")]
    pub backup_dir: PathBuf,

    /// Database user
    #[arg(short = 'u', long, env = "BACKUP_USER")]
    pub user: Option<String>,

    /// Database password
    #[arg(long, env = "BACKUP_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Storage provider
    #[arg(short = 'p', long, env = "BACKUP_PROVIDER", value_enum, default_value = "gs")]
    pub provider: ProviderKind,

    /// Bucket name
    #[arg(short = 'b', long, env = "BACKUP_BUCKET")]
    pub bucket: Option<String>,

    /// AWS access key id
    #[arg(short = 'i', long = "s3-id", env = "BACKUP_AWS_ACCESS_KEY_ID")]
    pub s3_id: Option<String>,

    /// AWS secret access key
    #[arg(short = 'k', long = "s3-key", env = "BACKUP_AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    pub s3_key: Option<String>,

    /// AWS region of the bucket
    #[arg(long = "s3-region", env = "BACKUP_AWS_REGION", default_value = "us-east-1")]
    pub s3_region: String,

    /// OAuth2 bearer token for Google Cloud Storage
    #[arg(long = "gcs-token", env = "BACKUP_GCS_TOKEN", hide_env_values = true)]
    pub gcs_token: Option<String>,

    /// Root directory for the local provider
    #[arg(long = "local-root", env = "BACKUP_LOCAL_ROOT")]
    pub local_root: Option<PathBuf>,

    /// Disable compression
    #[arg(short = 'n', long = "uncompressed")]
    pub uncompressed: bool,

    /// Django settings used when running database migrations
    #[arg(short = 's', long, env = "BACKUP_SETTINGS", default_value = "aws_appsembler")]
    pub settings: String,

    /// Sentry data source name
    #[arg(long = "sentry-dsn", env = "BACKUP_SENTRY_DSN", hide_env_values = true)]
    pub sentry_dsn: Option<String>,

    /// Prometheus pushgateway URL
    #[arg(long, env = "PUSHGATEWAY", default_value = "http://localhost:9091")]
    pub pushgateway: String,

    /// Seconds an external command may run before it is killed
    #[arg(long = "command-timeout", env = "BACKUP_COMMAND_TIMEOUT")]
    pub command_timeout: Option<u64>,

    /// Multipart chunks uploaded concurrently
    #[arg(long = "upload-concurrency", env = "BACKUP_UPLOAD_CONCURRENCY", default_value_t = 1)]
    pub upload_concurrency: usize,
}

/// Which pipeline an invocation runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Backup,
    Restore,
    Monitor,
}

impl Mode {
    /// Resolve the mode from the name the program was invoked as
    pub fn from_program_name(argv0: &str) -> Option<Self> {
        let name = Path::new(argv0).file_stem()?.to_str()?;
        match name {
            "edx_backup" => Some(Mode::Backup),
            "edx_restore" => Some(Mode::Restore),
            "edx_backups_monitor" => Some(Mode::Monitor),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_from_program_name() {
        assert_eq!(Mode::from_program_name("edx_backup"), Some(Mode::Backup));
        assert_eq!(
            Mode::from_program_name("/usr/local/bin/edx_restore"),
            Some(Mode::Restore)
        );
        assert_eq!(
            Mode::from_program_name("./target/debug/edx_backups_monitor"),
            Some(Mode::Monitor)
        );
        assert_eq!(Mode::from_program_name("edx_backup.exe"), Some(Mode::Backup));
        assert_eq!(Mode::from_program_name("backup"), None);
        assert_eq!(Mode::from_program_name(""), None);
    }

    #[test]
    fn test_cli_parses_short_flags() {
        let cli = Cli::try_parse_from([
            "edx_restore",
            "mysql",
            "-r",
            "/tmp/db_backups/host1_mysql_20240101.tar.gz",
            "-s",
            "production",
        ])
        .unwrap();

        assert_eq!(cli.service, "mysql");
        assert_eq!(
            cli.restore_path,
            Some(PathBuf::from("/tmp/db_backups/host1_mysql_20240101.tar.gz"))
        );
        assert_eq!(cli.settings, "production");
        assert!(!cli.uncompressed);
    }

    #[test]
    fn test_cli_rejects_unknown_provider() {
        let err = Cli::try_parse_from(["edx_backup", "mysql", "-p", "azure"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::InvalidValue);
    }
}
