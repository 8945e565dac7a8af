//! Ephemera - Entry Point
//!
//! Deploys, modifies, lists and removes ephemeral test clusters, or runs as a
//! service that removes clusters once they expire.

use std::collections::HashMap;
use std::env;

use anyhow::{anyhow, Context as _};
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use ephemera::app::options::AppOptions;
use ephemera::app::run::run;
use ephemera::app::state::AppState;
use ephemera::cluster::view::ClusterState;
use ephemera::filesys::file::File;
use ephemera::logs::{init_logging, LogOptions};
use ephemera::models::cluster::{ClusterDef, RebalancePlan};
use ephemera::storage::layout::StorageLayout;
use ephemera::storage::settings::Settings;
use ephemera::utils::version_info;

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version_info()) {
            Ok(version) => println!("{}", version),
            Err(e) => eprintln!("Failed to render version: {}", e),
        }
        return;
    }

    if let Err(e) = dispatch(&cli_args).await {
        eprintln!("{} {:#}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn dispatch(cli_args: &HashMap<String, String>) -> anyhow::Result<()> {
    let layout = match cli_args.get("base-dir") {
        Some(dir) => StorageLayout::new(dir),
        None => StorageLayout::default(),
    };

    // Retrieve the settings file
    let settings_file = match cli_args.get("settings") {
        Some(path) => File::new(path),
        None => layout.settings_file(),
    };
    let settings = if settings_file.exists().await {
        settings_file
            .read_json::<Settings>()
            .await
            .with_context(|| format!("unable to read {}", settings_file.path().display()))?
    } else {
        Settings::default()
    };

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        log_dir: Some(layout.logs_dir()),
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    let options = AppOptions::from_settings(layout, &settings);

    if cli_args.contains_key("reap") {
        info!("Running the expiry reaper with options: {:?}", options.reaper);
        return run(options, await_shutdown_signal())
            .await
            .map_err(|e| anyhow!(e));
    }

    let state = AppState::init(&options).await?;
    let orchestrator = state.orchestrator.clone();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        await_shutdown_signal().await;
        on_signal.cancel();
    });

    if let Some(path) = cli_args.get("deploy") {
        let def: ClusterDef = File::new(path).read_json().await?;
        let view = orchestrator.new_cluster(&cancel, &def).await?;
        println!("{} cluster {}", "deployed".green().bold(), view.cluster_id.bold());
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else if let Some(cluster_id) = cli_args.get("modify") {
        let plan_path = cli_args
            .get("plan")
            .ok_or_else(|| anyhow!("--modify requires --plan=<file>"))?;
        let plan: RebalancePlan = File::new(plan_path).read_json().await?;
        let done = orchestrator.modify_cluster(&cancel, cluster_id, &plan).await?;
        println!(
            "{} cluster {} in {} attempts ({} added, {} removed)",
            "reconciled".green().bold(),
            cluster_id.bold(),
            done.attempts,
            done.added.len(),
            done.removed.len()
        );
    } else if let Some(cluster_id) = cli_args.get("remove") {
        let removed = orchestrator.remove_cluster(cluster_id).await?;
        println!("{} cluster {} ({} nodes)", "removed".yellow().bold(), cluster_id.bold(), removed);
    } else if let Some(cluster_id) = cli_args.get("status") {
        let ex = orchestrator.get_cluster_ex(cluster_id).await?;
        println!("{} {}", cluster_id.bold(), paint(ex.state()));
        println!("{}", serde_json::to_string_pretty(&ex)?);
    } else if cli_args.contains_key("list") {
        for cluster in orchestrator.list_clusters().await? {
            let state = orchestrator.get_cluster_ex(&cluster.cluster_id).await?.state();
            let expiry = cluster
                .expiry()
                .map(|e| e.to_rfc3339())
                .unwrap_or_else(|| "never".to_string());
            println!(
                "{}  {:<12} {} members  expires {}  {}",
                cluster.cluster_id.bold(),
                paint(state),
                cluster.members().count(),
                expiry,
                cluster.purpose()
            );
        }
    } else {
        error!("No command given");
        return Err(anyhow!(
            "usage: ephemera [--settings=<file>] (--deploy=<file> | --modify=<id> --plan=<file> | \
             --remove=<id> | --status=<id> | --list | --reap | --version)"
        ));
    }

    Ok(())
}

fn paint(state: ClusterState) -> colored::ColoredString {
    let label = state.to_string();
    match state {
        ClusterState::Ready => label.green(),
        ClusterState::Provisioning | ClusterState::Reconciling => label.cyan(),
        ClusterState::Degraded => label.red(),
        ClusterState::Removed => label.dimmed(),
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            _ => {
                error!("Unable to install signal handlers, waiting for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Ctrl+C received, shutting down...");
    }
}
