//! Database backup, restore and monitoring pipelines
//!
//! Every pipeline is assembled from the stages in this module: dump,
//! compress, transfer (see [`storage`]), cleanup, restore and monitor.

pub mod storage;

pub mod archive;
pub mod backup;
pub mod backup_naming;
pub mod cleanup;
pub mod dump;
pub mod monitor;
pub mod process;
pub mod restore;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Database engines that can be dumped and restored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    /// Relational engine, dumped to a single SQL file
    Mysql,
    /// Document store, dumped to a directory tree
    Mongodb,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Mysql => "mysql",
            ServiceKind::Mongodb => "mongodb",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceKind {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mysql" => Ok(ServiceKind::Mysql),
            "mongodb" => Ok(ServiceKind::Mongodb),
            other => Err(BackupError::UnknownServiceKind(other.to_string())),
        }
    }
}

/// Error type for backup, restore and monitor operations
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("Unknown service {0}")]
    UnknownServiceKind(String),

    #[error("Error occurred while dumping database: {0}")]
    DumpFailed(String),

    #[error("Error occurred while compressing backup: {0}")]
    CompressionFailed(String),

    #[error("Error occurred while uncompressing backup: {0}")]
    UncompressFailed(String),

    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Restore failed: {0}")]
    RestoreFailed(String),

    #[error("There are no backup files in the bucket")]
    NoBackupsFound,

    #[error("`{program}` did not finish within {timeout:?}")]
    ProcessTimeout { program: String, timeout: Duration },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Metrics push failed: {0}")]
    Metrics(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackupError {
    /// Stable name of the error kind, used as the exception type in alerts
    pub fn kind(&self) -> &'static str {
        match self {
            BackupError::UnknownServiceKind(_) => "UnknownServiceKind",
            BackupError::DumpFailed(_) => "DumpFailed",
            BackupError::CompressionFailed(_) => "CompressionFailed",
            BackupError::UncompressFailed(_) => "UncompressFailed",
            BackupError::UploadFailed(_) => "UploadFailed",
            BackupError::RestoreFailed(_) => "RestoreFailed",
            BackupError::NoBackupsFound => "NoBackupsFound",
            BackupError::ProcessTimeout { .. } => "ProcessTimeout",
            BackupError::Storage(_) => "StorageError",
            BackupError::Metrics(_) => "MetricsError",
            BackupError::Config(_) => "ConfigError",
            BackupError::Io(_) => "IoError",
        }
    }
}

/// Result type for backup operations
pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_kind_parse() {
        assert_eq!("mysql".parse::<ServiceKind>().unwrap(), ServiceKind::Mysql);
        assert_eq!("mongodb".parse::<ServiceKind>().unwrap(), ServiceKind::Mongodb);

        let err = "postgres".parse::<ServiceKind>().unwrap_err();
        assert!(matches!(err, BackupError::UnknownServiceKind(ref s) if s == "postgres"));
        assert_eq!(err.kind(), "UnknownServiceKind");
    }

    #[test]
    fn test_service_kind_display_round_trips() {
        for kind in [ServiceKind::Mysql, ServiceKind::Mongodb] {
            assert_eq!(kind.to_string().parse::<ServiceKind>().unwrap(), kind);
        }
    }
}
