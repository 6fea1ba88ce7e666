// src/main.rs
use anyhow::Context;
use log::{error, info};
use tokio::signal;
use tokio::sync::mpsc;

use vigil::{AlarmService, Config, MqttTransport, StateStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("vigil v{} starting", vigil::VERSION);

    let config_path = std::env::args()
        .nth(1)
        .context("usage: vigil <config.yaml>")?;
    let config = Config::from_file(&config_path)
        .with_context(|| format!("cannot load configuration from {config_path}"))?;
    info!(
        "Loaded {} groups, {} switch outputs, {} text outputs",
        config.groups.len(),
        config.switch_outputs.len(),
        config.text_outputs.len()
    );

    let store = StateStore::open(&config.state_file).context("cannot open state file")?;

    let online_topic = format!("service/{}/online", config.service_name);
    let (transport, bus) = MqttTransport::connect(&config.broker, &online_topic)?;

    let mut service = AlarmService::new(&config, Box::new(bus), store)?;
    let subscriptions = service.subscriptions().to_vec();

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let transport_handle = tokio::spawn(async move {
        if let Err(e) = transport.run(subscriptions, inbound_tx).await {
            error!("MQTT transport error: {e}");
        }
    });

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = service.run(inbound_rx) => {
            if let Err(e) = result {
                error!("Service error: {e}");
                std::process::exit(1);
            }
        }
    }

    transport_handle.abort();
    info!("Service stopped");
    Ok(())
}
