#![forbid(unsafe_code)]

//! Logger initialization.

use std::io::Write;

use anyhow::{Context, Result};
use log::LevelFilter;

/// Installs an `env_logger` backend.
///
/// `RUST_LOG` is read first; a level passed on the command line overrides it
/// for this crate. HTTP internals are capped at `info` so `--log-level debug`
/// stays readable.
pub fn init_logger(level: Option<LevelFilter>) -> Result<()> {
    let mut builder = env_logger::Builder::from_default_env();
    if std::env::var_os("RUST_LOG").is_none() {
        builder.filter_level(LevelFilter::Info);
    }
    if let Some(level) = level {
        builder.filter_level(level);
        builder.filter_module("clipharvest", level);
    }
    builder.filter_module("ureq", LevelFilter::Info);
    builder.filter_module("rustls", LevelFilter::Warn);

    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} {:<5} {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            record.level(),
            record.args()
        )
    });

    builder.try_init().context("initializing logger")
}
