/*!
 * withub gateway binary.
 *
 * Usage: `withub [CONFIG_FILE]`. The configuration file defaults to
 * `withub.toml`; `WITHUB__SECTION__KEY` environment variables override it.
 */
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::info;

use withub_core::config::ConfigBuilder;
use withub_core::logging;
use withub_core::types::AccessPoint;
use withub_devices::ble::BtleRadio;
use withub_gateway::channel;
use withub_gateway::mqtt::MqttBroker;
use withub_gateway::{Collaborators, Gateway, HostLink, NetworkLink};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "withub.toml".to_string());

    let config = ConfigBuilder::new()
        .with_config_file(&path)
        .with_environment_prefix("WITHUB")
        .build()
        .with_context(|| format!("failed to load configuration from {}", path))?;

    logging::init_with_config(&config.logging)?;
    withub_devices::init()?;
    withub_gateway::init()?;
    info!(
        "{} {} starting (radios: {:?})",
        config.general.app_name,
        withub_gateway::VERSION,
        withub_devices::available_radios()
    );

    let radio = BtleRadio::new()
        .await
        .context("failed to open the Bluetooth adapter")?;
    let (link, link_events) = HostLink::new(16);
    let link = Arc::new(link);

    let (broker_tx, broker_events) = mpsc::channel(16);
    let (message_tx, messages) = channel::channel(config.mqtt.inbound_queue_depth);
    let broker = MqttBroker::new(&config.mqtt, broker_tx, message_tx);

    let gateway = Gateway::start(
        &config,
        Collaborators {
            radio: Arc::new(radio),
            link: link.clone(),
            link_events,
            broker: Arc::new(broker),
            broker_events,
            messages,
        },
    )
    .await
    .context("failed to start the gateway")?;

    if config.wifi.access_point.is_none() {
        // the host network needs no credentials
        link.connect(&AccessPoint::new(config.general.app_name.clone(), ""))
            .await
            .context("failed to bring up the host link")?;
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    gateway.shutdown().await;
    info!("Bye");
    Ok(())
}
