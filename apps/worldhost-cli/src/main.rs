use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use worldhost_common::Position;
use worldhost_executor::{ExecutorConfig, SystemError, TickExecutor};
use worldhost_persist::StateStore;

#[derive(Parser)]
#[command(name = "worldhost-cli", about = "Run and inspect a worldhost server core")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print version and crate info
    Info,
    /// Run the tick loop for a while and print executor status
    Run {
        /// Number of ticks to run before stopping
        #[arg(short, long, default_value = "100")]
        ticks: u64,
        /// Tick period in milliseconds
        #[arg(long, default_value = "50")]
        tick_period_ms: u64,
        /// Autosave cadence in ticks (0 disables)
        #[arg(long, default_value = "20")]
        autosave: u64,
        /// Directory for the state file (omit to run without persistence)
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Print the migration report of a state file without loading it
    Inspect { path: PathBuf },
    /// Upgrade a state file to the current schema version on disk
    Migrate { path: PathBuf },
    /// Populate a world, save it, restart, and verify the restored state
    Demo {
        #[arg(long, default_value = "worldhost-data")]
        data_dir: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match cli.command {
        Commands::Info => {
            println!("worldhost-cli v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "state schema version: {}",
                worldhost_persist::CURRENT_SCHEMA_VERSION
            );
            let defaults = ExecutorConfig::default();
            println!(
                "defaults: tick_period={}ms, autosave_every={} ticks, world={:?}",
                defaults.tick_period.as_millis(),
                defaults.autosave_every_ticks,
                defaults.default_world
            );
            println!(
                "isolation: threshold={}, cooldown={}..{} ticks, max_level={}",
                defaults.isolation.failure_threshold,
                defaults.isolation.base_cooldown_ticks,
                defaults.isolation.max_cooldown_ticks,
                defaults.isolation.max_isolation_level
            );
        }
        Commands::Run {
            ticks,
            tick_period_ms,
            autosave,
            data_dir,
        } => {
            let config = ExecutorConfig {
                tick_period: Duration::from_millis(tick_period_ms.max(1)),
                autosave_every_ticks: autosave,
                state_path: data_dir.map(|dir| dir.join("state.json")),
                ..ExecutorConfig::default()
            };
            let executor = TickExecutor::new(config);
            executor.register_system("core", "heartbeat", |ctx| {
                if ctx.tick % 20 == 0 {
                    tracing::info!(tick = ctx.tick, players = ctx.state.online_player_count(), "heartbeat");
                }
                Ok::<(), SystemError>(())
            })?;
            executor.start()?;
            while executor.tick_count() < ticks {
                std::thread::sleep(Duration::from_millis(tick_period_ms.max(1)));
            }
            executor.stop();

            let status = executor.status();
            println!(
                "ran {} ticks ({} failures), last={:?}, avg={:?}",
                status.tick_count,
                status.tick_failures,
                status.last_tick_duration,
                status.average_tick_duration
            );
            println!(
                "worlds={}, players={}, entities={}",
                status.worlds, status.online_players, status.entities
            );
            for system in &status.systems {
                println!(
                    "system {}/{}: runs={}, failures={}, avg={:?}, max={:?}",
                    system.owner,
                    system.unit,
                    system.runs,
                    system.failures,
                    system.average_duration,
                    system.max_duration
                );
            }
        }
        Commands::Inspect { path } => {
            match StateStore::new(&path).inspect()? {
                None => println!("{}: no state file", path.display()),
                Some(report) => {
                    println!(
                        "{}: schema {} -> {}{}",
                        path.display(),
                        report.from_version,
                        report.to_version,
                        if report.migrated { " (migration needed)" } else { "" }
                    );
                    for step in &report.applied_steps {
                        println!("  step: {step}");
                    }
                    for entry in &report.migration_history {
                        println!("  history: {entry}");
                    }
                    for warning in &report.warnings {
                        println!("  warning: {warning}");
                    }
                }
            }
        }
        Commands::Migrate { path } => {
            match StateStore::new(&path).migrate_in_place()? {
                None => println!("{}: no state file", path.display()),
                Some(report) if report.migrated => {
                    println!(
                        "{}: migrated schema {} -> {}",
                        path.display(),
                        report.from_version,
                        report.to_version
                    );
                    for step in &report.applied_steps {
                        println!("  applied: {step}");
                    }
                }
                Some(report) => {
                    println!(
                        "{}: already at schema {}",
                        path.display(),
                        report.to_version
                    );
                }
            }
        }
        Commands::Demo { data_dir } => {
            let state_path = data_dir.join("state.json");
            let config = ExecutorConfig {
                tick_period: Duration::from_millis(10),
                state_path: Some(state_path.clone()),
                ..ExecutorConfig::default()
            };

            println!("first run: populating {}", state_path.display());
            let executor = TickExecutor::new(config.clone());
            executor.start()?;
            executor.create_world("w", 42)?;
            executor.join_player("Alex", "w", Position::new(10.0, 70.0, 5.0))?;
            executor.set_inventory_item("Alex", 0, "iron_ingot");
            executor.spawn_entity("sheep", "w", Position::new(1.0, 64.0, 1.0))?;
            executor.stop();

            println!("second run: restoring from {}", state_path.display());
            let executor = TickExecutor::new(config);
            executor.start()?;
            let player = executor
                .find_player("Alex")
                .ok_or_else(|| anyhow::anyhow!("player did not survive restart"))?;
            let item = executor
                .inventory("Alex")
                .and_then(|inv| inv.slots.get(&0).cloned())
                .ok_or_else(|| anyhow::anyhow!("inventory did not survive restart"))?;
            let entities = executor.entities(Some("w"));
            executor.stop();

            println!("player {} in world {:?} at {:?}", player.name, player.world, player.position);
            println!("slot 0: {item}");
            for entity in entities.iter() {
                println!("entity {} ({}) in {}", entity.id, entity.kind, entity.world);
            }
            let ok = player.world == "w" && item == "iron_ingot" && entities.len() == 2;
            println!("verify: {}", if ok { "OK" } else { "MISMATCH" });
        }
    }

    Ok(())
}
