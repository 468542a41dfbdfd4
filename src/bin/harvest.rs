#![forbid(unsafe_code)]

//! `harvest`: keyword crawler front-end.
//!
//! `run` harvests the date range from the settings file, `range` an explicit
//! one. `save-credential` stores a session token for later runs and `wipe`
//! deletes everything under the output root.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use log::LevelFilter;

use clipharvest::batch::{BatchController, BatchSummary};
use clipharvest::config::{
    DEFAULT_SETTINGS_PATH, PipelineSettings, RuntimeOverrides, RuntimePaths, load_settings,
    resolve_runtime_paths,
};
use clipharvest::credential::{Credential, CredentialStore, establish_session};
use clipharvest::ledger::CompletionLedger;
use clipharvest::logging::init_logger;
use clipharvest::provider::{HttpSearchProvider, PlatformClient};
use clipharvest::retry::{InterruptibleSleeper, Pacer};
use clipharvest::window::parse_date;

#[derive(Parser, Debug)]
#[command(name = "harvest", version, about = "Keyword video crawler")]
struct Cli {
    /// `.env` file with HARVEST_* path settings.
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// TOML pipeline settings.
    #[arg(long, global = true, default_value = DEFAULT_SETTINGS_PATH)]
    settings: PathBuf,

    #[arg(long, global = true)]
    output_root: Option<PathBuf>,

    #[arg(long, global = true)]
    fetch_tool: Option<PathBuf>,

    #[arg(long, global = true)]
    encoder: Option<PathBuf>,

    /// Overrides RUST_LOG for this crate (error, warn, info, debug, trace).
    #[arg(long, global = true)]
    log_level: Option<LevelFilter>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Harvest the date range from the settings file.
    Run {
        /// Session token to use (and save) instead of the stored credential.
        #[arg(long)]
        token: Option<String>,
    },
    /// Harvest an explicit date range, both ends inclusive (YYYY-MM-DD).
    Range {
        start: String,
        end: String,
        #[arg(long)]
        token: Option<String>,
    },
    /// Delete every artifact, ledger and cache under the output root.
    Wipe {
        /// Required confirmation.
        #[arg(long)]
        yes: bool,
    },
    /// Store a session token without contacting the platform.
    SaveCredential { token: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(cli.log_level)?;

    let paths = resolve_runtime_paths(RuntimeOverrides {
        output_root: cli.output_root,
        fetch_tool: cli.fetch_tool,
        encoder: cli.encoder,
        credential_file: None,
        env_path: cli.env_file,
    })?;
    let settings = load_settings(&cli.settings)?;

    match cli.command {
        Commands::Run { token } => {
            let (start, end) = (settings.start_date, settings.end_date);
            harvest(paths, settings, start, end, token).await
        }
        Commands::Range { start, end, token } => {
            let start = parse_date(&start)?;
            let end = parse_date(&end)?;
            if start > end {
                bail!("start date {start} is after end date {end}");
            }
            harvest(paths, settings, start, end, token).await
        }
        Commands::Wipe { yes } => wipe(&paths.output_root, yes),
        Commands::SaveCredential { token } => save_credential(&paths, &token),
    }
}

async fn harvest(
    paths: RuntimePaths,
    settings: PipelineSettings,
    start: NaiveDate,
    end: NaiveDate,
    token: Option<String>,
) -> Result<()> {
    ensure_program_available(&paths.fetch_tool, "--version")?;
    ensure_program_available(&paths.encoder, "-version")?;
    fs::create_dir_all(&paths.output_root)
        .with_context(|| format!("creating {}", paths.output_root.display()))?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("Interrupt received; stopping after the current step");
                shutdown.store(true, Ordering::Relaxed);
            }
        });
    }

    println!("===================================");
    println!("Keyword Harvester");
    println!("===================================");
    println!("Keyword: {}", settings.keyword);
    println!("Range: {start} to {end}");
    println!(
        "Filters: at least {} views, at most {}s",
        settings.min_view_count, settings.max_duration_secs
    );
    println!("Output root: {}", paths.output_root.display());
    println!();

    let output_root = paths.output_root.clone();
    let summary = tokio::task::spawn_blocking(move || -> Result<BatchSummary> {
        let store = CredentialStore::new(
            paths.credential_file.clone(),
            paths.fetch_cookie_file.clone(),
        );
        let client = PlatformClient::default();
        let session = establish_session(
            store,
            &client,
            token.as_deref(),
            Local::now().timestamp(),
        )
        .context("establishing a session")?;
        log::info!("Session validated");

        let provider = HttpSearchProvider::new(client, Arc::new(session));
        let pacer = Pacer::new(Arc::new(InterruptibleSleeper::new(shutdown.clone())));
        let mut controller =
            BatchController::from_settings(provider, &paths, &settings, pacer, shutdown)?;
        Ok(controller.run_range(start, end))
    })
    .await
    .context("batch task aborted")??;

    println!();
    println!("===================================");
    if summary.session_lost {
        println!("Harvest stopped: the platform rejected the session");
        println!("Save a fresh token with `harvest save-credential <token>`");
    } else if summary.interrupted {
        println!("Harvest interrupted");
    } else {
        println!("Harvest complete!");
    }
    println!("===================================");
    println!(
        "Windows: {} ({} from cache, {} incomplete)",
        summary.windows, summary.windows_from_cache, summary.incomplete_windows
    );
    println!("Accepted items: {}", summary.found);
    println!("Completed: {}", summary.completed);
    println!("Already complete: {}", summary.already_complete);
    println!("Skipped: {}", summary.skipped);
    println!("Failed: {}", summary.failed);
    println!("Output root: {}", output_root.display());
    Ok(())
}

fn wipe(root: &Path, confirmed: bool) -> Result<()> {
    if !confirmed {
        bail!(
            "refusing to delete {} without --yes",
            root.display()
        );
    }
    CompletionLedger::new(root)
        .reset()
        .with_context(|| format!("wiping {}", root.display()))?;
    println!("Removed all artifacts under {}", root.display());
    Ok(())
}

fn save_credential(paths: &RuntimePaths, token: &str) -> Result<()> {
    let credential = Credential::from_token(token, Local::now().timestamp())?;
    let store = CredentialStore::new(
        paths.credential_file.clone(),
        paths.fetch_cookie_file.clone(),
    );
    store.save(&credential)?;
    println!("Saved credential to {}", store.path().display());
    if let Some(export) = &paths.fetch_cookie_file {
        println!("Exported cookies to {}", export.display());
    }
    Ok(())
}

fn ensure_program_available(program: &Path, version_flag: &str) -> Result<()> {
    let status = Command::new(program)
        .arg(version_flag)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(_) => bail!(
            "{} is installed but returned a failure status",
            program.display()
        ),
        Err(err) => bail!(
            "{} is not installed or not in PATH: {}",
            program.display(),
            err
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/usr/bin/env bash\n{body}\n")).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from([
            "harvest",
            "--output-root",
            "/data",
            "range",
            "2023-01-01",
            "2023-02-01",
            "--token",
            "abc",
        ])
        .unwrap();
        assert_eq!(cli.output_root, Some(PathBuf::from("/data")));
        match cli.command {
            Commands::Range { start, end, token } => {
                assert_eq!(start, "2023-01-01");
                assert_eq!(end, "2023-02-01");
                assert_eq!(token.as_deref(), Some("abc"));
            }
            other => panic!("unexpected command {other:?}"),
        }

        let cli = Cli::try_parse_from(["harvest", "--log-level", "debug", "wipe"]).unwrap();
        assert_eq!(cli.log_level, Some(LevelFilter::Debug));
        assert!(matches!(cli.command, Commands::Wipe { yes: false }));
    }

    #[test]
    fn wipe_requires_confirmation() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("out");
        fs::create_dir_all(root.join("media")).unwrap();
        fs::write(root.join("completed.csv"), "id\nBV1aa411c7aa\n").unwrap();

        assert!(wipe(&root, false).is_err());
        assert!(root.join("completed.csv").exists());

        wipe(&root, true).unwrap();
        assert!(root.exists());
        assert_eq!(fs::read_dir(&root).unwrap().count(), 0);
    }

    #[test]
    fn save_credential_writes_store_and_export() {
        let dir = tempdir().unwrap();
        let paths = RuntimePaths {
            output_root: dir.path().join("out"),
            fetch_tool: PathBuf::from("BBDown"),
            encoder: PathBuf::from("ffmpeg"),
            credential_file: dir.path().join("session.json"),
            fetch_cookie_file: Some(dir.path().join("cookies.json")),
        };
        save_credential(&paths, "token-value").unwrap();
        let stored = CredentialStore::new(paths.credential_file.clone(), None)
            .load()
            .unwrap()
            .unwrap();
        assert_eq!(stored.token(), Some("token-value"));
        let exported = fs::read_to_string(dir.path().join("cookies.json")).unwrap();
        assert!(exported.contains("token-value"));
        assert!(save_credential(&paths, "  ").is_err());
    }

    #[test]
    fn program_check_reports_status() {
        let dir = tempdir().unwrap();
        let ok = write_script(dir.path(), "ok", "exit 0");
        let broken = write_script(dir.path(), "broken", "exit 3");
        assert!(ensure_program_available(&ok, "--version").is_ok());
        assert!(ensure_program_available(&broken, "--version").is_err());
        assert!(ensure_program_available(&dir.path().join("missing"), "--version").is_err());
    }
}
