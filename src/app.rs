// `app.rs` wires the relay together: it loads configuration, starts the
// MQTT pump in the background, and runs the relay consumer in the
// foreground until Ctrl-C or a fatal error. In forwarder mode the relay runs
// inside `cellular::with_link` so the cellular link is released on the way out.
use std::io;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task;
use tracing::info;

use crate::cellular::{self, CellularSession, CloudSocket};
use crate::config::RelayConfig;
use crate::mqtt;
use crate::relay::Relay;

pub async fn run() -> anyhow::Result<()> {
    let config = RelayConfig::from_env()?;

    let (client, eventloop) = mqtt::connect(&config.broker, config.channel_capacity);
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let pump = task::spawn(mqtt::pump_events(eventloop, tx));

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    let idle = config.idle_interval;
    let broker = &config.broker;
    let mut relay = Relay::new(broker.topic.clone(), broker.qos, client, io::stdout());

    let outcome = match &config.cellular {
        None => {
            info!(topic = %broker.topic, "starting local relay");
            relay.run(rx, shutdown, idle).await.map(|()| relay.state())
        }
        Some(cell) => {
            info!(
                topic = %broker.topic,
                endpoint = %format!("{}:{}", cell.cloud_host, cell.cloud_port),
                manage_link = cell.manage_link,
                "starting cellular forwarder"
            );
            let session: Arc<dyn CellularSession> = Arc::new(CloudSocket::new(cell.clone()));
            cellular::with_link(session, cell.manage_link, |session| {
                let mut relay = relay.with_forwarder(session);
                async move { relay.run(rx, shutdown, idle).await.map(|()| relay.state()) }
            })
            .await
        }
    };

    pump.abort();
    let state = outcome?;
    info!(?state, "relay stopped");
    Ok(())
}
