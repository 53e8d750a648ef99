/*
    playstate-rs | Dual-backend persistence for player sources and watch history.
    Copyright (C) 2025  Israel Alberto Roldan Vega

    This program is free software: you can redistribute it and/or modify
    it under the terms of the GNU Affero General Public License as published
    by the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU Affero General Public License for more details.

    You should have received a copy of the GNU Affero General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use log::debug;
use playstate_core::{
    spawn_flusher, DualBackendStore, RegistryError, Source, SourceRegistry, StoreConfig,
    WatchedSetTracker,
};
use serde_json::json;
use std::process;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Parser)]
#[command(name = "playstate")]
#[command(about = "Inspect and drive the player's persisted sources and watch history", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Shows backend availability, the current source and the watched count.
    Status {
        /// Print the status as JSON
        #[arg(long)]
        json: bool,
    },
    /// Lists all sources in playback order
    Sources,
    /// Prints the currently selected source
    Current,
    /// Advances to the next source (wraps around)
    Next,
    /// Goes back to the previous source (wraps around)
    Previous,
    /// Selects a source by its position in the list
    Select {
        /// Zero-based position, as shown by 'sources'
        #[arg(value_name = "INDEX")]
        index: usize,
    },
    /// Marks one or more item IDs as watched
    Watch {
        #[arg(value_name = "ID", required = true)]
        ids: Vec<String>,
    },
    /// Reports whether each item ID has been watched
    Check {
        #[arg(value_name = "ID", required = true)]
        ids: Vec<String>,
    },
    /// Checks whether the database is reachable
    Probe,
}

#[tokio::main]
async fn main() {
    env_logger::init();

    if dotenv().is_err() {
        // Silently ignore
    }

    let cli = Cli::parse();

    if let Err(e) = run(cli.command).await {
        eprintln!("[ERROR] {:#}", e);
        process::exit(1);
    }
}

async fn run(command: Commands) -> Result<()> {
    let config = StoreConfig::from_env().context("Invalid configuration")?;
    debug!("Using data directory {}", config.data_dir.display());
    let store = Arc::new(DualBackendStore::open(&config));

    match command {
        Commands::Status { json } => handle_status(store, &config, json).await,
        Commands::Sources => handle_sources(store).await,
        Commands::Current => {
            let registry = SourceRegistry::initialize(store).await;
            match registry.current() {
                Some(source) => println!("{}", source),
                None => println!("No source selected (no sources configured)."),
            }
        }
        Commands::Next => {
            let mut registry = SourceRegistry::initialize(store).await;
            println!("{}", move_report(registry.next().await));
        }
        Commands::Previous => {
            let mut registry = SourceRegistry::initialize(store).await;
            println!("{}", move_report(registry.previous().await));
        }
        Commands::Select { index } => {
            let mut registry = SourceRegistry::initialize(store).await;
            println!("{}", move_report(registry.select(index).await));
        }
        Commands::Watch { ids } => handle_watch(store, &config, ids).await,
        Commands::Check { ids } => {
            let tracker = WatchedSetTracker::initialize(store, config.batch.clone()).await;
            for id in ids {
                let mark = if tracker.is_watched(&id) { "watched" } else { "new" };
                println!("{:<20} {}", id, mark);
            }
        }
        Commands::Probe => {
            if !store.has_primary() {
                println!("No database configured; state is kept in {}", config.data_dir.display());
            } else {
                println!("Database: {}", store.reprobe().await);
            }
        }
    }

    Ok(())
}

async fn handle_status(store: Arc<DualBackendStore>, config: &StoreConfig, as_json: bool) {
    let registry = SourceRegistry::initialize(store.clone()).await;
    let tracker = WatchedSetTracker::initialize(store.clone(), config.batch.clone()).await;
    let state = store.state();

    if as_json {
        let status = json!({
            "backend_state": state.to_string(),
            "database_configured": store.has_primary(),
            "data_dir": config.data_dir.display().to_string(),
            "source_count": registry.len(),
            "current_index": registry.current_index(),
            "current_source": registry.current(),
            "watched_count": tracker.len(),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&status).unwrap_or_default()
        );
        return;
    }

    println!("---------------------------------------------------");
    println!("PLAYER STATE");
    println!("---------------------------------------------------");
    println!("Backend:         {}", state);
    println!("Data Directory:  {}", config.data_dir.display());
    println!("Sources:         {}", registry.len());
    match registry.current() {
        Some(source) => println!(
            "Current Source:  [{}] {}",
            registry.current_index().unwrap_or_default(),
            source
        ),
        None => println!("Current Source:  (none)"),
    }
    println!("Watched Items:   {}", tracker.len());
    println!("---------------------------------------------------");
}

async fn handle_sources(store: Arc<DualBackendStore>) {
    let registry = SourceRegistry::initialize(store).await;

    if registry.is_empty() {
        println!("No sources configured.");
        return;
    }

    println!();
    println!(
        "{:<3} | {:<5} | {:<30} | {:<16} | {:<6}",
        "#", "Now", "Name", "Type", "Kind"
    );
    println!("{:-<3}-+-{:-<5}-+-{:-<30}-+-{:-<16}-+-{:-<6}", "", "", "", "", "");

    for (i, source) in registry.sources().iter().enumerate() {
        let name = if source.name.chars().count() > 28 {
            format!("{}..", source.name.chars().take(28).collect::<String>())
        } else {
            source.name.clone()
        };
        let now = if registry.current_index() == Some(i) { ">>" } else { "" };

        println!(
            "{:<3} | {:<5} | {:<30} | {:<16} | {:<6}",
            i,
            now,
            name,
            source.kind.as_str(),
            source.category.as_str()
        );
    }
    println!();
    println!("Tip: run 'playstate select <#>' to jump to a source");
}

/// Registry errors are printed; they never fail the command.
fn move_report(result: Result<&Source, RegistryError>) -> String {
    match result {
        Ok(source) => format!("Now on: {}", source),
        Err(e) => format!("[WARN] {}", e),
    }
}

async fn handle_watch(store: Arc<DualBackendStore>, config: &StoreConfig, ids: Vec<String>) {
    let tracker = WatchedSetTracker::initialize(store, config.batch.clone()).await;
    let shared = Arc::new(Mutex::new(tracker));
    let flusher = spawn_flusher(shared.clone(), config.batch.check_interval());

    {
        let mut tracker = shared.lock().await;
        for id in &ids {
            let seen = tracker.is_watched(id);
            tracker.mark_watched(id.as_str());
            println!("{:<20} {}", id, if seen { "already watched" } else { "marked" });
        }
    }

    match flusher.shutdown().await {
        Some(outcome) => println!("[SAVED] Watch history stored ({:?})", outcome),
        None => println!("Nothing new to save."),
    }
}
