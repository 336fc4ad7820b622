//! Log targets and subscriber setup
//!
//! The library only emits `tracing` events; each log kind has its own target
//! so `log=<kind>=<level>` options become plain `EnvFilter` directives.

use crate::config::Config;
use crate::{Error, Result};
use std::fs::File;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

pub const ARCHIVE: &str = "code_revive::archive";
pub const GLOBAL: &str = "code_revive::global";
pub const ASSEMBLY: &str = "code_revive::assembly";
pub const OPT: &str = "code_revive::opt";
pub const SAVE: &str = "code_revive::save";
pub const RESTORE: &str = "code_revive::restore";
pub const MERGE: &str = "code_revive::merge";

/// Build the filter for a base verbosity plus the per-kind levels in `config`
pub fn env_filter(config: &Config, verbosity: u8) -> Result<EnvFilter> {
    let base = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let mut filter = EnvFilter::try_new(base).map_err(|e| Error::config(e.to_string()))?;
    for directive in config.log_directives() {
        let parsed = directive
            .parse()
            .map_err(|e| Error::config(format!("bad log directive {}: {}", directive, e)))?;
        filter = filter.add_directive(parsed);
    }
    Ok(filter)
}

/// Install a global fmt subscriber, writing to `config.log_file` when set
pub fn init(config: &Config, verbosity: u8) -> Result<()> {
    let filter = env_filter(config, verbosity)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = match &config.log_file {
        Some(path) => {
            let file = File::create(path).map_err(|e| {
                Error::InternalError(format!("Failed to create log file {}: {}", path.display(), e))
            })?;
            builder.with_writer(Mutex::new(file)).try_init()
        }
        None => builder.with_writer(std::io::stderr).try_init(),
    };
    installed.map_err(|e| Error::internal(format!("Failed to install log subscriber: {}", e)))
}
