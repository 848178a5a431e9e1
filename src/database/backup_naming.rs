//! Backup naming module for generating host- and date-based artifact names
//!
//! Artifacts are named `{hostname}_{kind}_{yyyymmdd}`. The same stem is used
//! for the local dump file, the remote object key and, without the date, as
//! the prefix the monitor filters remote listings on.

use chrono::{NaiveDate, Utc};
use std::ffi::OsString;

/// Fallback host identity when the OS refuses to tell us
const UNKNOWN_HOST: &str = "localhost";

/// Service for generating backup names for one host
#[derive(Debug, Clone)]
pub struct BackupNamingService {
    /// Sanitized host identity
    hostname: String,
}

impl BackupNamingService {
    /// Create a naming service for the given hostname
    pub fn new(hostname: &str) -> Self {
        Self {
            hostname: sanitize(hostname),
        }
    }

    /// Create a naming service for the machine we are running on
    ///
    /// `BACKUP_HOSTNAME` overrides the OS hostname.
    pub fn for_local_host() -> Self {
        let hostname = std::env::var("BACKUP_HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(system_hostname);
        Self::new(&hostname)
    }

    /// The sanitized hostname embedded in every name
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// `{hostname}_{kind}`, the stable key shared by all backups of a kind
    pub fn prefix(&self, kind: &str) -> String {
        format!("{}_{}", self.hostname, sanitize(kind))
    }

    /// Name for a backup taken today (UTC)
    pub fn make_name(&self, kind: &str) -> String {
        self.name_for_date(kind, Utc::now().date_naive())
    }

    /// Name for a backup taken on the given date
    pub fn name_for_date(&self, kind: &str, date: NaiveDate) -> String {
        format!("{}_{}", self.prefix(kind), date.format("%Y%m%d"))
    }
}

/// Replace anything that is not valid in both a path and an object key
fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(unix)]
fn system_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name: OsString| name.into_string().ok())
        .unwrap_or_else(|| UNKNOWN_HOST.to_string())
}

#[cfg(not(unix))]
fn system_hostname() -> String {
    std::env::var_os("COMPUTERNAME")
        .and_then(|name: OsString| name.into_string().ok())
        .unwrap_or_else(|| UNKNOWN_HOST.to_string())
}
