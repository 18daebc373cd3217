mod app;
mod blogger;
mod config;
mod fallback;
mod generator;
mod history;
mod images;
mod logger;
mod models;
mod render;
mod retry;
mod scheduler;
mod selection;
mod server;
mod sources;
mod utils;

use std::sync::Arc;

use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use futures::future::BoxFuture;
use log::{debug, info};

use crate::app::AppContext;
use crate::config::{Profile, Settings};
use crate::logger::init_logger;
use crate::selection::Slot;
use crate::server::SlotRunner;

#[derive(Parser)]
#[command(name = "autopost")]
#[command(about = "Generate articles and publish them to Blogger")]
struct Cli {
    /// Generate and render, but print the HTML instead of publishing
    #[arg(long, global = true)]
    dry_run: bool,

    /// Debug output on the console
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Publish the rotating category article for one slot
    Run {
        #[arg(long, default_value_t = 0)]
        slot: i64,
    },
    /// Publish both slots back to back
    RunAll,
    /// Review a store app
    Apps,
    /// Write a gaming trend guide
    Gaming,
    /// Write an invented tech-solution guide
    Tech,
    /// Rebuild the store catalog page
    Store,
    /// Run the slots every day at the profile's post times
    Schedule,
    /// Serve the HTTP trigger
    Serve,
    /// Write the default content profile to the config directory
    InitProfile,
}

struct Orchestrator(Arc<AppContext>);

impl SlotRunner for Orchestrator {
    fn run(&self, slot: Slot) -> BoxFuture<'_, Result<()>> {
        Box::pin(app::run_slot(&self.0, slot))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(cli.verbose)?;

    match dotenvy::dotenv() {
        Ok(path) => debug!("Loaded environment from {}", path.display()),
        Err(e) if e.not_found() => debug!("No .env file"),
        Err(e) => return Err(anyhow!("Could not read .env: {}", e)),
    }

    if let Command::InitProfile = cli.command {
        let outcome = Profile::ensure_user_profile()?;
        if outcome.created {
            info!("Profile written to {}. Edit it and run again.", outcome.path.display());
        } else {
            info!("Profile already exists at {}", outcome.path.display());
        }
        return Ok(());
    }

    let settings = Settings::from_env()?;
    let profile = Profile::load(&settings)?;
    debug!("Settings and profile loaded");
    let ctx = AppContext::new(settings, profile, cli.dry_run)?;

    match cli.command {
        Command::Run { slot } => {
            let slot = Slot::from_index(slot).ok_or_else(|| anyhow!("--slot must be 0 or 1, got {slot}"))?;
            app::run_slot(&ctx, slot).await
        }
        Command::RunAll => app::run_all(&ctx).await,
        Command::Apps => app::run_apps(&ctx).await,
        Command::Gaming => app::run_gaming(&ctx).await,
        Command::Tech => app::run_tech(&ctx).await,
        Command::Store => app::run_store(&ctx).await,
        Command::Schedule => {
            let times = scheduler::parse_post_times(&ctx.profile.post_times)?;
            scheduler::run_schedule(&times, || ctx.settings.now(), |slot| app::run_slot(&ctx, slot)).await
        }
        Command::Serve => {
            let port = ctx.settings.port;
            let token = ctx.settings.trigger_token.clone();
            server::serve(port, token, Arc::new(Orchestrator(Arc::new(ctx)))).await
        }
        Command::InitProfile => Ok(()),
    }
}
