// MQTT background task. This connects to the broker using `rumqttc` and
// turns every event the relay cares about into a `RelayEvent` on a bounded
// channel. The event loop is polled here and nowhere else; the relay only
// ever sees the channel, one event at a time.
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming, MqttOptions, QoS,
};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::BrokerConfig;
use crate::error::RelayError;
use crate::message::{Message, RelayEvent};
use crate::relay::Subscriber;

/// Build the client and its event loop. Nothing touches the network until
/// the event loop is polled by `pump_events`.
pub fn connect(config: &BrokerConfig, capacity: usize) -> (AsyncClient, EventLoop) {
    let mut mqttoptions =
        MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
    mqttoptions.set_keep_alive(config.keep_alive);

    match &config.credentials {
        Some((user, pass)) => {
            mqttoptions.set_credentials(user, pass);
            info!(user = %user, "using MQTT credentials");
        }
        None => info!("no MQTT credentials provided; connecting without authentication"),
    }

    info!(
        host = %config.host,
        port = config.port,
        keep_alive_secs = config.keep_alive.as_secs(),
        "connecting to MQTT broker"
    );
    AsyncClient::new(mqttoptions, capacity)
}

/// Drive the event loop until a terminal event or until the relay hangs up.
/// There is no reconnect: a connection error is forwarded as `BrokerLost`
/// and the pump stops polling.
pub async fn pump_events(mut eventloop: EventLoop, events: mpsc::Sender<RelayEvent>) {
    loop {
        let event = match eventloop.poll().await {
            Ok(ev) => match translate(ev) {
                Some(event) => event,
                None => continue,
            },
            Err(ConnectionError::ConnectionRefused(code)) => RelayEvent::Connected {
                code: return_code(code),
            },
            Err(e) => RelayEvent::BrokerLost(e.to_string()),
        };

        let terminal = event.is_terminal();
        if events.send(event).await.is_err() {
            debug!("relay consumer gone, stopping MQTT pump");
            return;
        }
        if terminal {
            return;
        }
    }
}

/// Map a raw `rumqttc` event onto the relay's vocabulary. Events the relay
/// has no use for (acks, pings, outgoing traffic) yield `None`.
pub fn translate(event: Event) -> Option<RelayEvent> {
    match event {
        Event::Incoming(Incoming::ConnAck(ack)) => Some(RelayEvent::Connected {
            code: return_code(ack.code),
        }),
        Event::Incoming(Incoming::Publish(p)) => Some(RelayEvent::Message(Message::from(p))),
        Event::Incoming(Incoming::Disconnect) => {
            warn!("MQTT broker initiated disconnect");
            Some(RelayEvent::BrokerLost("broker initiated disconnect".to_string()))
        }
        Event::Incoming(Incoming::SubAck(ack)) => {
            debug!(pkid = ack.pkid, "subscription acknowledged");
            None
        }
        Event::Incoming(i) => {
            trace!("incoming = {i:?}");
            None
        }
        Event::Outgoing(o) => {
            trace!("outgoing = {o:?}");
            None
        }
    }
}

/// MQTT 3.1.1 CONNACK return code as a number.
pub fn return_code(code: ConnectReturnCode) -> u8 {
    match code {
        ConnectReturnCode::Success => 0,
        ConnectReturnCode::RefusedProtocolVersion => 1,
        ConnectReturnCode::BadClientId => 2,
        ConnectReturnCode::ServiceUnavailable => 3,
        ConnectReturnCode::BadUserNamePassword => 4,
        ConnectReturnCode::NotAuthorized => 5,
    }
}

#[async_trait]
impl Subscriber for AsyncClient {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), RelayError> {
        AsyncClient::subscribe(self, topic, qos)
            .await
            .map_err(|e| RelayError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}
