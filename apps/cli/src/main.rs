//! Command line front end for the updater library
//!
//! ```text
//! updater server --dir /srv/arma3 --gm --ws
//! updater mod 450814997 --dir /srv/mods/@cba
//! updater mods --list mods.json --workers 4
//! updater depots
//! updater status
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;
use updater::{
    AuthCodeProvider, ConsoleProgressReporter, EnvCredentials, FeatureFlags, IntoProgressCallback, UpdateOutcome,
    Updater, UpdaterConfig, WorkshopItem,
};

/// Keep a dedicated server and its workshop mods up to date
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Base URL of the content service (overrides UPDATER_CDN_URL)
    #[arg(long, global = true)]
    cdn_url: Option<String>,

    /// Directory holding per-user auth artifacts (overrides UPDATER_AUTH_DIR)
    #[arg(long, global = true)]
    auth_dir: Option<PathBuf>,

    /// One-time second-factor code; prompted for on stdin when omitted and required
    #[arg(long, global = true)]
    auth_code: Option<String>,

    /// Print per-file lines and job state changes
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Update the dedicated server install
    Server {
        /// Install directory
        #[arg(short, long)]
        dir: PathBuf,
        /// Use the Contact DLC branch
        #[arg(long)]
        contact: bool,
        /// Use the profiling binaries
        #[arg(long)]
        profiling: bool,
        /// Include the Global Mobilization creator DLC
        #[arg(long)]
        gm: bool,
        /// Include the CSLA Iron Curtain creator DLC
        #[arg(long)]
        csla: bool,
        /// Include the S.O.G. Prairie Fire creator DLC
        #[arg(long)]
        sogpf: bool,
        /// Include the Western Sahara creator DLC
        #[arg(long)]
        ws: bool,
    },
    /// Download a single workshop item
    Mod {
        /// Workshop item id
        id: u64,
        /// Destination directory
        #[arg(short, long)]
        dir: PathBuf,
    },
    /// Update every item of a JSON mod list and write the new state back
    Mods {
        /// JSON array of workshop items
        #[arg(short, long)]
        list: PathBuf,
        /// Items downloaded concurrently
        #[arg(short, long)]
        workers: Option<usize>,
        /// Report batch progress as finished / total
        #[arg(long)]
        normalized_progress: bool,
    },
    /// List the depots the server app advertises
    Depots,
    /// Log on and print the session state
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    match run(args).await {
        Ok(outcome) => ExitCode::from(outcome.code() as u8),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "updater=debug" } else { "updater=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(args: Args) -> anyhow::Result<UpdateOutcome> {
    let mut config = UpdaterConfig::from_env();
    if let Some(url) = args.cdn_url {
        config.cdn_url = url;
    }
    if let Some(dir) = args.auth_dir {
        config.auth_dir = Some(dir);
    }
    if let Command::Mods {
        workers,
        normalized_progress,
        ..
    } = &args.command
    {
        if let Some(workers) = workers {
            config.batch_workers = *workers;
        }
        config.normalized_batch_progress |= *normalized_progress;
    }

    let provider: Arc<dyn AuthCodeProvider> = match args.auth_code {
        Some(code) => Arc::new(code),
        None => Arc::new(StdinAuthCode),
    };
    let updater = Arc::new(
        Updater::with_http(config, Arc::new(EnvCredentials))
            .context("invalid configuration")?
            .with_auth_code_provider(provider),
    );
    updater.add_progress_callback(ConsoleProgressReporter::new(args.verbose).into_callback());
    spawn_cancel_on_ctrl_c(updater.clone());

    let outcome = match args.command {
        Command::Server {
            dir,
            contact,
            profiling,
            gm,
            csla,
            sogpf,
            ws,
        } => {
            let flags = FeatureFlags {
                using_contact_dlc: contact,
                using_perf_binaries: profiling,
                using_gm_dlc: gm,
                using_csla_dlc: csla,
                using_pf_dlc: sogpf,
                using_ws_dlc: ws,
            };
            updater.update_server(flags, &dir).await
        }
        Command::Mod { id, dir } => updater.run_single_mod_update(id, &dir).await,
        Command::Mods { list, .. } => update_mod_list(&updater, &list).await?,
        Command::Depots => list_depots(&updater).await?,
        Command::Status => print_status(&updater).await,
    };

    updater.shutdown().await;
    let metrics = updater.metrics();
    debug!(
        "jobs started={} completed={} failed={} cancelled={} bytes={}",
        metrics.jobs_started,
        metrics.jobs_completed,
        metrics.jobs_failed,
        metrics.jobs_cancelled,
        metrics.bytes_downloaded
    );
    Ok(outcome)
}

/// Prompts for the auth code on the terminal
struct StdinAuthCode;

#[async_trait]
impl AuthCodeProvider for StdinAuthCode {
    async fn auth_code(&self, username: &str) -> Option<String> {
        let mut stderr = tokio::io::stderr();
        let prompt = format!("Auth code for {}: ", username);
        stderr.write_all(prompt.as_bytes()).await.ok()?;
        stderr.flush().await.ok()?;

        let mut line = String::new();
        BufReader::new(tokio::io::stdin()).read_line(&mut line).await.ok()?;
        let code = line.trim();
        (!code.is_empty()).then(|| code.to_string())
    }
}

fn spawn_cancel_on_ctrl_c(updater: Arc<Updater>) {
    tokio::spawn(async move {
        loop {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Could not listen for Ctrl+C: {}", e);
                return;
            }
            updater.cancel();
        }
    });
}

async fn update_mod_list(updater: &Updater, list: &PathBuf) -> anyhow::Result<UpdateOutcome> {
    let raw = tokio::fs::read_to_string(list)
        .await
        .with_context(|| format!("reading mod list {}", list.display()))?;
    let mut items: Vec<WorkshopItem> =
        serde_json::from_str(&raw).with_context(|| format!("parsing mod list {}", list.display()))?;

    let report = updater.run_batch_mod_update(items.clone()).await;
    report.apply(&mut items);

    let updated = serde_json::to_string_pretty(&items)?;
    tokio::fs::write(list, updated)
        .await
        .with_context(|| format!("writing mod list {}", list.display()))?;

    for item in &report.items {
        debug!("{} -> {:?}", item.item.workshop_id, item.result);
    }
    Ok(report.outcome)
}

async fn list_depots(updater: &Updater) -> anyhow::Result<UpdateOutcome> {
    let session = match updater.connect().await {
        Ok(session) => session,
        Err(_) => return Ok(UpdateOutcome::LoginFailed),
    };
    let app_id = updater.config().server_app_id;
    let depots = session
        .client()
        .list_depots(app_id)
        .await
        .with_context(|| format!("listing depots of app {}", app_id))?;

    for depot in depots {
        println!("{:>8}  {}", depot.id, depot.name);
    }
    Ok(UpdateOutcome::Success)
}

async fn print_status(updater: &Updater) -> UpdateOutcome {
    let outcome = match updater.connect().await {
        Ok(session) => {
            println!("os: {}", session.os());
            println!("anonymous: {}", session.is_anonymous());
            UpdateOutcome::Success
        }
        Err(_) => UpdateOutcome::LoginFailed,
    };
    let status = updater.session_status();
    println!("state: {:?}", updater.connection_state());
    println!("connected: {}, faulted: {}", status.connected, status.faulted);
    outcome
}
