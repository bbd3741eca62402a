use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use log::{debug, error, info, warn};
use tokio::sync::broadcast;

use fallwatch::config::AppConfig;
use fallwatch::dispatcher::{AlertDispatcher, LogAlert, MqttAlert};
use fallwatch::feed::MqttFeed;
use fallwatch::registry::DeviceRegistry;
use fallwatch::store::JsonFileStore;
use fallwatch::{Contact, DeviceId, Monitor, StreamEvent};

#[derive(Parser, Debug)]
#[command(version, about = "Watch fall-detection sensors and raise an alarm on danger")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Monitor every registered device until interrupted
    Run,
    /// List registered devices
    List,
    /// Register a device
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        address: String,
    },
    /// Unregister a device
    Remove { address: String },
    /// Rename a device
    Rename { address: String, name: String },
    /// Replace the emergency contacts of a device
    Contacts {
        address: String,
        /// Contact as "Name|Number"; repeat for more than one
        #[arg(long = "contact")]
        contacts: Vec<String>,
    },
}

type FileMonitor = Monitor<MqttFeed, JsonFileStore>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::formatted_timed_builder()
        .parse_filters(&std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)
        .with_context(|| format!("reading config from {}", cli.config.display()))?;

    let (feed, mut eventloop) = MqttFeed::new(&config.mqtt);
    let feed = Arc::new(feed);
    let feed_task = {
        let feed = feed.clone();
        tokio::task::spawn(async move {
            feed.event_loop(&mut eventloop).await;
        })
    };

    let store = JsonFileStore::new(config.storage_path());
    let registry = DeviceRegistry::load(store)?;
    let mut monitor = Monitor::new(feed.clone(), registry, &config.alarm());

    let result = match cli.command {
        Command::Run => run(&mut monitor, &config, feed.clone()).await,
        Command::List => {
            list(&monitor);
            Ok(())
        }
        Command::Add { name, address } => monitor
            .add_device(&name, &address)
            .await
            .map(|id| println!("Added {} ({})", name.trim(), id))
            .map_err(Into::into),
        Command::Remove { address } => remove(&mut monitor, &address).await,
        Command::Rename { address, name } => {
            let id = DeviceId::parse(&address)?;
            monitor.rename_device(&id, &name).await.map_err(Into::into)
        }
        Command::Contacts { address, contacts } => {
            let id = DeviceId::parse(&address)?;
            let contacts: Vec<Contact> = contacts.iter().filter_map(|c| Contact::parse(c)).collect();
            monitor.set_contacts(&id, contacts).await.map_err(Into::into)
        }
    };

    // Flush queued publishes before leaving
    if let Err(err) = feed.disconnect().await {
        warn!("Error disconnecting from MQTT: {}", err);
    }
    if tokio::time::timeout(Duration::from_secs(5), feed_task).await.is_err() {
        debug!("MQTT event loop did not finish in time");
    }

    result
}

async fn run(
    monitor: &mut FileMonitor,
    config: &AppConfig,
    feed: Arc<MqttFeed>,
) -> anyhow::Result<()> {
    if monitor.devices().is_empty() {
        warn!("No devices registered; add one with `fallwatch add`");
    }

    let mut dispatcher = AlertDispatcher::new(monitor.aggregate()).with_sink(LogAlert);
    if config.alarm().announce_mqtt.unwrap_or(false) {
        dispatcher = dispatcher.with_sink(MqttAlert::new(feed));
    }

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let dispatcher_task = tokio::task::spawn(dispatcher.run(async move {
        let _ = stop_rx.await;
    }));

    let status_task = tokio::task::spawn(log_status(monitor.subscribe_to_status()));

    monitor.start();

    // Streams that failed to open or were closed by the feed are retried
    let mut refresh = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("Interrupted, shutting down");
                break;
            }
            _ = refresh.tick() => monitor.refresh(),
        }
    }

    monitor.shutdown().await;
    let _ = stop_tx.send(());
    if let Err(err) = dispatcher_task.await {
        error!("Alert dispatcher failed: {:?}", err);
    }
    status_task.abort();

    Ok(())
}

async fn log_status(mut events: broadcast::Receiver<StreamEvent>) {
    loop {
        match events.recv().await {
            Ok(StreamEvent::StatusChanged(id, update)) => match update.record() {
                Some(record) => info!(
                    "{}: {} at ({}, {})",
                    id, record.state, record.latitude, record.longitude
                ),
                None => info!("{}: no data", id),
            },
            Ok(StreamEvent::StreamError { device, reason }) => {
                warn!("{}: stream error: {}", device, reason);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("Status log lagged by {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn list(monitor: &FileMonitor) {
    for device in monitor.devices() {
        println!("{}  {}", device.id, device.name);
        for contact in &device.contacts {
            println!("    {} {}", contact.name, contact.number);
        }
    }
}

async fn remove(monitor: &mut FileMonitor, address: &str) -> anyhow::Result<()> {
    let id = DeviceId::parse(address)?;
    let removed = monitor.remove_device(&id).await?;
    println!("Removed {} ({})", removed.name, id);
    Ok(())
}
