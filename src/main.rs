use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;
use tokio::sync::{broadcast, mpsc};

use ebus_gateway::broker::{self, MqttBrokerClient};
use ebus_gateway::bus::BusTask;
use ebus_gateway::client::ClientManager;
use ebus_gateway::config::Config;
use ebus_gateway::persistence;
use ebus_gateway::scheduler::Scheduler;
use ebus_gateway::uart::Uart;

#[derive(Parser)]
#[command(name = "ebus-gateway", version, about = "eBUS-to-TCP/broker gateway")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway: bus task, scheduler, TCP multiplexer, and
    /// (if configured) the broker client. The default when no
    /// subcommand is given.
    Run {
        #[arg(long)]
        foreground: bool,
    },
    /// Print the resolved configuration.
    Config,
    /// Print current message counters as JSON.
    Counters,
    /// Trigger a bus scan against a running instance (thin client stub;
    /// actually driving a scan is the broker's job, see `broker.rs`).
    Scan {
        #[arg(long)]
        full: bool,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run { foreground: true }) {
        Commands::Config => {
            let config = Config::load()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Counters => {
            // Standalone invocation has no running gateway to query; report
            // an empty counter set shaped like the live one.
            let counters = ebus_gateway::counters::Counters::new();
            println!("{}", serde_json::to_string_pretty(&counters)?);
            Ok(())
        }
        Commands::Scan { full } => {
            println!(
                "scan requested (full={full}); connect to the running gateway's broker to trigger it live"
            );
            Ok(())
        }
        Commands::Run { foreground: _ } => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(run())
        }
    }
}

async fn run() -> Result<()> {
    let config = Config::load()?;
    info!("starting ebus-gateway on {}", config.serial_port);

    let mut scheduler = Scheduler::new(config.address);
    let loaded = persistence::load_commands(&mut scheduler.store, &config.commands_path)?;
    info!("loaded {loaded} bytes of command definitions from {:?}", config.commands_path);

    if config.scan_on_start {
        scheduler.devices.set_scan_on_startup(true);
    }

    let uart = Uart::open(&config.serial_port, config.baud_rate)?;
    let (writer, bytes_rx) = uart.split()?;

    let (job_tx, job_rx) = mpsc::channel::<Vec<u8>>(16);
    let (event_tx, mut event_rx) = mpsc::channel(64);
    let (monitor_tx, _monitor_rx) = broadcast::channel::<u8>(1024);
    let (bus_byte_tx, mut bus_byte_rx) = mpsc::channel::<u8>(16);

    let bus_task = BusTask::new(config.address, writer);
    let bus_monitor_for_task = monitor_tx.clone();
    tokio::spawn(bus_task.run(bytes_rx, job_rx, event_tx, bus_monitor_for_task));

    // Enhanced clients write bus bytes directly; forward them onto the
    // same job queue the scheduler feeds so the bus task sees one input.
    let job_tx_for_enhanced = job_tx.clone();
    tokio::spawn(async move {
        while let Some(byte) = bus_byte_rx.recv().await {
            let _ = job_tx_for_enhanced.send(vec![byte]).await;
        }
    });

    let client_manager = ClientManager::new(config.ports.clone(), bus_byte_tx, monitor_tx.clone());
    tokio::spawn(client_manager.run());

    let mut broker_client = None;
    let mut actions_rx = None;
    if let Some(broker_cfg) = &config.broker {
        let (actions_tx, rx) = mpsc::channel(32);
        let client = MqttBrokerClient::start(broker_cfg, actions_tx);
        broker_client = Some(client);
        actions_rx = Some(rx);
    }

    let job = scheduler.tick(0);
    if let Some(job) = job {
        let _ = job_tx.send(job).await;
    }

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                let now_ms = 0;
                if let Some((master, slave)) = scheduler.handle_event(event, now_ms) {
                    if let Some(client) = &broker_client {
                        client.publish(&client.response_topic(), serde_json::json!({
                            "master": ebus_gateway::sequence::Sequence::bytes_to_hex(&master),
                            "slave": ebus_gateway::sequence::Sequence::bytes_to_hex(&slave),
                        }).to_string()).await;
                    }
                }
                if let Some(job) = scheduler.tick(now_ms) {
                    let _ = job_tx.send(job).await;
                }
            }
            Some(action) = async {
                match &mut actions_rx {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                let response = broker::apply_action(&mut scheduler, action).await;
                if let Some(client) = &broker_client {
                    client.publish(&client.response_topic(), response.to_string()).await;
                }
            }
        }
    }
}
