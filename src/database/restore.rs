//! Restore pipeline: bring a dump back into the running databases
//!
//! The relational restore is destructive and runs strictly in order: the
//! schema is dropped and recreated, the dump is loaded, migrations run and
//! the application services restart. The first failing step stops the run
//! and nothing is rolled back.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{Instrument, error, info, info_span};

use crate::config::RestoreSettings;
use crate::database::archive::uncompress_backup;
use crate::database::process::{CommandRunner, CommandSpec};
use crate::database::{BackupError, Result, ServiceKind};

/// Shell snippet running the migrations; every value arrives as a positional
/// parameter so nothing user-supplied is spliced into the script.
const MIGRATE_SCRIPT: &str = r#"source "$1" && "$2" lms migrate --settings="$3""#;

/// One named step of a restore
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreStep {
    pub name: &'static str,
    pub command: CommandSpec,
}

impl RestoreStep {
    fn new(name: &'static str, command: CommandSpec) -> Self {
        Self { name, command }
    }
}

/// Ordered steps restoring a MySQL dump file
pub fn mysql_restore_steps(
    settings: &RestoreSettings,
    dump_file: &Path,
    django_settings: &str,
) -> Vec<RestoreStep> {
    let db = settings.database.as_str();
    let env_file = settings.env_file.display().to_string();
    vec![
        RestoreStep::new(
            "drop database",
            CommandSpec::new("mysqladmin").args(["-f", "drop", db]),
        ),
        RestoreStep::new(
            "create database",
            CommandSpec::new("mysqladmin").args(["-f", "create", db]),
        ),
        RestoreStep::new(
            "load dump",
            CommandSpec::new("mysql").args(["-D", db]).stdin_file(dump_file),
        ),
        RestoreStep::new(
            "run migrations",
            CommandSpec::new("bash").args([
                "-c",
                MIGRATE_SCRIPT,
                "_",
                env_file.as_str(),
                settings.manage_command.as_str(),
                django_settings,
            ]),
        ),
        RestoreStep::new(
            "restart services",
            CommandSpec::new(settings.supervisorctl.clone())
                .args(["restart", settings.service_group.as_str()]),
        ),
    ]
}

/// Single step restoring a MongoDB dump directory
pub fn mongodb_restore_steps(dump_dir: &Path) -> Vec<RestoreStep> {
    vec![RestoreStep::new(
        "mongorestore",
        CommandSpec::new("mongorestore").arg(dump_dir.display().to_string()),
    )]
}

/// Restores databases from local backup artifacts
pub struct RestorePipeline {
    runner: Arc<dyn CommandRunner>,
    settings: RestoreSettings,
}

impl RestorePipeline {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: RestoreSettings) -> Self {
        Self { runner, settings }
    }

    /// Restore `service` from `backup_path`
    ///
    /// When `compressed` is set the archive is extracted next to itself first
    /// and the extracted artifact is restored. `django_settings` selects the
    /// settings module used by the migrations.
    pub async fn restore(
        &self,
        service: &str,
        backup_path: &Path,
        compressed: bool,
        django_settings: &str,
    ) -> Result<()> {
        let span = info_span!("restore", service, path = %backup_path.display());
        self.restore_inner(service, backup_path, compressed, django_settings)
            .instrument(span)
            .await
    }

    async fn restore_inner(
        &self,
        service: &str,
        backup_path: &Path,
        compressed: bool,
        django_settings: &str,
    ) -> Result<()> {
        let kind: ServiceKind = service.parse().inspect_err(|e| error!("{}", e))?;

        let restored: PathBuf = if compressed {
            uncompress_backup(backup_path).await?
        } else {
            backup_path.to_path_buf()
        };

        let steps = match kind {
            ServiceKind::Mysql => mysql_restore_steps(&self.settings, &restored, django_settings),
            ServiceKind::Mongodb => mongodb_restore_steps(&restored),
        };

        for step in steps {
            info!("Restore step: {} (`{}`)", step.name, step.command);
            self.runner.run(&step.command).await.map_err(|e| {
                error!("Restore step \"{}\" failed: {}", step.name, e);
                e.into_stage_error(|msg| {
                    BackupError::RestoreFailed(format!("{}: {}", step.name, msg))
                })
            })?;
        }

        info!("Restored {} from \"{}\"", kind, restored.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::Sequence;

    use crate::database::archive::compress_backup;
    use crate::database::process::{CommandError, MockCommandRunner};

    fn settings() -> RestoreSettings {
        RestoreSettings::default()
    }

    fn expect_in_order(runner: &mut MockCommandRunner, seq: &mut Sequence, shown: &[String]) {
        for expected in shown {
            let expected = expected.clone();
            runner
                .expect_run()
                .withf(move |c: &CommandSpec| c.to_string() == expected)
                .times(1)
                .in_sequence(seq)
                .returning(|_| Ok(()));
        }
    }

    #[test]
    fn test_mysql_steps() {
        let steps = mysql_restore_steps(&settings(), Path::new("/tmp/db/host1_mysql_20240101"), "production");
        let names: Vec<_> = steps.iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            vec![
                "drop database",
                "create database",
                "load dump",
                "run migrations",
                "restart services"
            ]
        );

        let load = &steps[2].command;
        assert_eq!(load.program, "mysql");
        assert_eq!(load.args, vec!["-D", "edxapp"]);
        assert_eq!(load.stdin, Some(PathBuf::from("/tmp/db/host1_mysql_20240101")));

        let migrate = &steps[3].command;
        assert_eq!(migrate.program, "bash");
        assert_eq!(
            migrate.args,
            vec![
                "-c",
                MIGRATE_SCRIPT,
                "_",
                "/edx/app/edxapp/edxapp_env",
                "/edx/bin/manage.edxapp",
                "production"
            ]
        );

        assert_eq!(steps[4].command.to_string(), "/edx/bin/supervisorctl restart edxapp:");
    }

    #[test]
    fn test_settings_identifier_is_never_part_of_the_script() {
        let hostile = "x\"; rm -rf / #";
        let steps = mysql_restore_steps(&settings(), Path::new("/tmp/d"), hostile);
        let migrate = &steps[3].command;
        assert_eq!(migrate.args[1], MIGRATE_SCRIPT);
        assert_eq!(migrate.args.last().map(String::as_str), Some(hostile));
    }

    #[tokio::test]
    async fn test_mysql_restore_runs_steps_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let dump = dir.path().join("host1_mysql_20240101");
        std::fs::write(&dump, "CREATE TABLE t (id INT);").unwrap();

        let shown: Vec<String> = mysql_restore_steps(&settings(), &dump, "aws_appsembler")
            .iter()
            .map(|s| s.command.to_string())
            .collect();
        let mut runner = MockCommandRunner::new();
        let mut seq = Sequence::new();
        expect_in_order(&mut runner, &mut seq, &shown);

        let pipeline = RestorePipeline::new(Arc::new(runner), settings());
        pipeline
            .restore("mysql", &dump, false, "aws_appsembler")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_mysql_restore_stops_at_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let dump = dir.path().join("host1_mysql_20240101");

        let shown: Vec<String> = mysql_restore_steps(&settings(), &dump, "aws_appsembler")
            .iter()
            .map(|s| s.command.to_string())
            .collect();

        let mut runner = MockCommandRunner::new();
        let mut seq = Sequence::new();
        expect_in_order(&mut runner, &mut seq, &shown[..1]);
        let create = shown[1].clone();
        runner
            .expect_run()
            .withf(move |c: &CommandSpec| c.to_string() == create)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|c| {
                Err(CommandError::Exit {
                    command: c.to_string(),
                    status: "exit status: 1".to_string(),
                    stderr: "database exists".to_string(),
                })
            });

        let pipeline = RestorePipeline::new(Arc::new(runner), settings());
        let err = pipeline
            .restore("mysql", &dump, false, "aws_appsembler")
            .await
            .unwrap_err();

        assert!(matches!(err, BackupError::RestoreFailed(ref m) if m.starts_with("create database")));
    }

    #[tokio::test]
    async fn test_compressed_mongodb_restore_uses_extracted_directory() {
        let dir = tempfile::tempdir().unwrap();
        let dump = dir.path().join("host1_mongodb_20240101");
        std::fs::create_dir_all(dump.join("edxapp")).unwrap();
        std::fs::write(dump.join("edxapp").join("modulestore.bson"), "bson").unwrap();
        let archive = compress_backup(&dump).await.unwrap();
        std::fs::remove_dir_all(&dump).unwrap();

        let expected = dump.clone();
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(move |c: &CommandSpec| {
                c.program == "mongorestore" && c.args == vec![expected.display().to_string()]
            })
            .times(1)
            .returning(|c| {
                assert!(Path::new(&c.args[0]).join("edxapp").join("modulestore.bson").is_file());
                Ok(())
            });

        let pipeline = RestorePipeline::new(Arc::new(runner), settings());
        pipeline
            .restore("mongodb", &archive, true, "aws_appsembler")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_bad_archive_is_uncompress_failed() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("host1_mysql_20240101.tar.gz");
        std::fs::write(&archive, "definitely not gzip").unwrap();

        let mut runner = MockCommandRunner::new();
        runner.expect_run().never();

        let pipeline = RestorePipeline::new(Arc::new(runner), settings());
        let err = pipeline
            .restore("mysql", &archive, true, "aws_appsembler")
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::UncompressFailed(_)));
    }

    #[tokio::test]
    async fn test_unknown_service_runs_nothing() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().never();

        let pipeline = RestorePipeline::new(Arc::new(runner), settings());
        let err = pipeline
            .restore("redis", Path::new("/tmp/x"), false, "aws_appsembler")
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::UnknownServiceKind(_)));
    }
}
