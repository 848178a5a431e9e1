//! Dump stage: runs the engine's dump tool into the backup directory

use std::path::{Path, PathBuf};

use tracing::{error, info};

use crate::database::backup_naming::BackupNamingService;
use crate::database::process::{CommandRunner, CommandSpec};
use crate::database::{BackupError, Result, ServiceKind};

/// Credentials for the document store's authenticated mode
#[derive(Debug, Clone, Default)]
pub struct DumpCredentials {
    pub user: String,
    pub password: String,
}

impl DumpCredentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    /// Authentication is only used when both halves are present
    fn is_complete(&self) -> bool {
        !self.user.is_empty() && !self.password.is_empty()
    }
}

/// Build the dump command for an engine writing to `backup_path`
pub fn dump_command(
    kind: ServiceKind,
    backup_path: &Path,
    credentials: Option<&DumpCredentials>,
) -> CommandSpec {
    let target = backup_path.display().to_string();
    match kind {
        ServiceKind::Mysql => CommandSpec::new("mysqldump").args([
            "-u".to_string(),
            "root".to_string(),
            "--all-databases".to_string(),
            "--single-transaction".to_string(),
            format!("--result-file={}", target),
        ]),
        ServiceKind::Mongodb => {
            let mut command = CommandSpec::new("mongodump").args(["-o".to_string(), target]);
            if let Some(creds) = credentials.filter(|c| c.is_complete()) {
                command = command
                    .args(["--authenticationDatabase", "admin", "-u"])
                    .arg(creds.user.clone())
                    .arg("-p")
                    .secret_arg(creds.password.clone());
            }
            command
        }
    }
}

/// Resolve the engine and the absolute path its dump is written to
pub fn dump_target(
    naming: &BackupNamingService,
    service: &str,
    backup_dir: &Path,
) -> Result<(ServiceKind, PathBuf)> {
    let kind: ServiceKind = service.parse().inspect_err(|e| error!("{}", e))?;
    let backup_dir = std::path::absolute(backup_dir)?;
    Ok((kind, backup_dir.join(naming.make_name(kind.as_str()))))
}

/// Dump the database contents of `kind` into `backup_path`
///
/// `backup_path` becomes a file (mysql) or a directory (mongodb).
pub async fn dump_service(
    runner: &dyn CommandRunner,
    kind: ServiceKind,
    backup_path: &Path,
    credentials: Option<&DumpCredentials>,
) -> Result<()> {
    let command = dump_command(kind, backup_path, credentials);

    info!("Dumping database: `{}`", command);
    runner.run(&command).await.map_err(|e| {
        error!("Error occurred while dumping database: {}", e);
        e.into_stage_error(BackupError::DumpFailed)
    })
}
