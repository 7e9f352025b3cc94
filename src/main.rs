//! CLI for the RTD bridge
//!
//! Connects to the broker, binds the cells given with `--cell TOPIC:FIELD`
//! and prints their values on every poll tick until Ctrl-C. With `--demo`
//! a publisher feeds sample prices through the loopback broker.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rtd_bridge::config::load_config_from;
use rtd_bridge::connection::ConnectionManager;
use rtd_bridge::rtd::{CellId, LiveDataServer, UpdateNotifier};
use rtd_bridge::transport::{BrokerTransport, LoopbackBroker, LoopbackTransport};
use rtd_bridge::utils::logging;
use serde_json::json;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const DEMO_TOPIC: &str = "demo/prices/ABC";

#[derive(Parser)]
#[command(name = "rtd-bridge", about = "Bridge broker topics to polled live-data cells")]
struct Cli {
    /// Configuration file, without extension (default: config/default)
    #[arg(long, default_value = "config/default")]
    config: String,
    /// Bind a cell to a topic field; may be repeated
    #[arg(long = "cell", value_name = "TOPIC:FIELD", value_parser = parse_cell)]
    cells: Vec<(String, String)>,
    /// Publish sample prices on the bound topics
    #[arg(long)]
    demo: bool,
}

fn parse_cell(arg: &str) -> Result<(String, String), String> {
    match arg.rsplit_once(':') {
        Some((topic, field)) if !topic.is_empty() && !field.is_empty() => {
            Ok((topic.to_string(), field.to_string()))
        }
        _ => Err(format!("expected TOPIC:FIELD, got '{arg}'")),
    }
}

/// Forwards poll ticks to the print loop.
struct TickForwarder(UnboundedSender<()>);

impl UpdateNotifier for TickForwarder {
    fn update_notify(&self) {
        let _ = self.0.send(());
    }
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        // logging may not be configured yet when settings failed to load
        logging::init("info");
        error!("rtd-bridge failed: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let settings = load_config_from(&cli.config)?;
    logging::init(&settings.logging.level);

    let transport = LoopbackTransport::initialize(&settings.api)?;
    let broker = transport.broker().clone();
    let connection = ConnectionManager::from_settings(transport, &settings);
    let server = LiveDataServer::new(connection, &settings.poller);

    let mut cells = cli.cells;
    if cli.demo && cells.is_empty() {
        cells.push((DEMO_TOPIC.to_string(), "price".to_string()));
    }

    let (tx, mut ticks) = mpsc::unbounded_channel();
    if !server.start(Arc::new(TickForwarder(tx))).await {
        return Err("could not connect to the broker".into());
    }

    for (index, (topic, field)) in cells.iter().enumerate() {
        let id = CellId::try_from(index)?;
        let value = server.connect_data(id, topic, field).await;
        info!(cell = id, %topic, %field, %value, "cell bound");
    }

    let demo = cli.demo.then(|| {
        let topics: BTreeSet<String> = cells.iter().map(|(topic, _)| topic.clone()).collect();
        spawn_demo_publisher(broker, topics, settings.poller.interval())
    });

    loop {
        tokio::select! {
            tick = ticks.recv() => {
                if tick.is_none() {
                    warn!("update timer stopped");
                    break;
                }
                let bindings: BTreeMap<CellId, String> = server
                    .cells()
                    .into_iter()
                    .map(|(id, binding)| (id, format!("{}:{}", binding.topic, binding.field)))
                    .collect();
                for (id, value) in server.refresh_data().await {
                    let label = bindings.get(&id).map(String::as_str).unwrap_or("?");
                    println!("[{id}] {label} = {value}");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received. Exiting gracefully.");
                break;
            }
        }
    }

    if let Some(publisher) = demo {
        publisher.abort();
    }
    server.terminate().await;
    Ok(())
}

fn spawn_demo_publisher(
    broker: LoopbackBroker,
    topics: BTreeSet<String>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
        let mut sequence: u64 = 0;
        loop {
            ticker.tick().await;
            sequence += 1;
            for (offset, topic) in topics.iter().enumerate() {
                let price = 100.0 + offset as f64 + (sequence % 20) as f64 * 0.25;
                let body = json!({
                    "price": price,
                    "qty": sequence * 10,
                    "ts": chrono::Utc::now().to_rfc3339(),
                });
                broker.publish(topic, body.to_string());
            }
        }
    })
}
