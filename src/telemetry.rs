//! Log output setup
//!
//! The dispatcher is built here and attached to the top-level future by
//! `main`, so nothing is installed as a process-wide default.

use std::env;

use tracing::Dispatch;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Set to `json` for one JSON object per event
pub const LOG_FORMAT_VAR: &str = "BACKUP_LOG_FORMAT";

/// Build the dispatcher from `RUST_LOG` (default `info`) and `BACKUP_LOG_FORMAT`
pub fn dispatch() -> Dispatch {
    let json = env::var(LOG_FORMAT_VAR).is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    build(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()), json)
}

fn build(filter: EnvFilter, json: bool) -> Dispatch {
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| fmt::layer().with_writer(std::io::stderr)));
    Dispatch::new(subscriber)
}
