use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use labdash::config::DispatchSettings;
use labdash::transport::SshConnector;
use labdash::{load_config, LabService};
use labdash_dispatch::{Dispatcher, ExpiryTracker, JobStore, MemoryJobStore, SqliteJobStore};
use labdash_shared::now_ms;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "labdash")]
#[command(about = "Inspect and reset lab appliances and network devices", long_about = None)]
struct Args {
    /// Configuration file (default: ./labdash.toml)
    #[arg(long, short)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Status of one target, or of the whole lab
    Status {
        target: Option<String>,
    },
    /// Configured appliances and devices
    List,
    /// Restore an appliance or reset a device to its default configuration
    Reset {
        target: String,
        /// Block until the reset finishes
        #[arg(long)]
        wait: bool,
    },
    /// Back up a device's running configuration to flash
    Backup {
        device: String,
        customer_id: String,
    },
    /// Look up a job by id
    Job {
        id: String,
    },
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn open_store(settings: &DispatchSettings) -> anyhow::Result<Arc<dyn JobStore>> {
    let store: Arc<dyn JobStore> = match &settings.store_path {
        Some(path) => Arc::new(
            SqliteJobStore::open(path)
                .await
                .with_context(|| format!("opening job store {}", path.display()))?,
        ),
        None => Arc::new(MemoryJobStore::new()),
    };

    let abandoned = store.recover_abandoned(now_ms()).await?;
    if !abandoned.is_empty() {
        warn!(jobs = ?abandoned, "marked jobs with lapsed leases as abandoned");
    }
    Ok(store)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_deref()).context("loading configuration")?;
    let lab = config.lab.settings()?;

    let store = open_store(&config.dispatch).await?;
    let tracker = ExpiryTracker::new(store.clone());
    tokio::spawn(async move { tracker.run().await });

    let dispatcher = Arc::new(Dispatcher::new(store, config.dispatch.dispatch_config()));
    let service = LabService::new(config, lab, Arc::new(SshConnector::new()), dispatcher.clone());

    match args.command {
        Command::Status { target: Some(target) } => {
            print_json(&service.status(&target).await?)?;
        }
        Command::Status { target: None } => {
            print_json(&service.lab_status().await?)?;
        }
        Command::List => {
            print_json(&service.list())?;
        }
        Command::Reset { target, wait } => {
            let record = service.reset(&target, wait).await?;
            print_json(&record)?;
            // Workers live in this process; let a detached reset finish
            if dispatcher.is_in_flight(&record.id) {
                info!(job_id = %record.id, "waiting for reset to finish before exit");
                while dispatcher.is_in_flight(&record.id) {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                print_json(&service.job(&record.id).await?)?;
            }
        }
        Command::Backup {
            device,
            customer_id,
        } => {
            print_json(&service.backup(&device, &customer_id, true).await?)?;
        }
        Command::Job { id } => {
            print_json(&service.job(&id).await?)?;
        }
    }
    Ok(())
}
